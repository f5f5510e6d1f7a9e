use std::io::{self, Cursor};

use base64::Engine;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;

/// Encode a raster as PNG, then base64, for the JSON upload body.
pub fn encode_png_base64(image: &DynamicImage) -> Result<String, image::ImageError> {
    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageFormat::Png)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png.into_inner()))
}

/// JSON with `", "` / `": "` separators and non-ASCII escaped as `\uXXXX`.
/// Keys come out in the order the value serializes them, so callers pass
/// sorted maps. The auth server verifies token signatures over exactly
/// these bytes, and `user_data` is stored in the same form.
struct CanonicalFormatter;

impl serde_json::ser::Formatter for CanonicalFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

pub fn canonical_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, CanonicalFormatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// [`canonical_payload`] as a string.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = canonical_payload(value)?;
    String::from_utf8(bytes).map_err(serde::ser::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use std::collections::BTreeMap;

    #[test]
    fn test_png_is_lossless() {
        let mut raster = RgbImage::new(4, 3);
        raster.put_pixel(1, 2, Rgb([200, 10, 30]));
        let image = DynamicImage::ImageRgb8(raster);

        let encoded = encode_png_base64(&image).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        assert!(bytes.starts_with(b"\x89PNG"));

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.to_rgb8().get_pixel(1, 2), &Rgb([200, 10, 30]));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let image = DynamicImage::new_rgb8(200, 200);
        assert_eq!(
            encode_png_base64(&image).unwrap(),
            encode_png_base64(&image).unwrap()
        );
    }

    #[test]
    fn test_canonical_payload_sorts_keys_and_spaces_separators() {
        let headers = BTreeMap::from([
            ("pipeline_id", "123"),
            ("device_id", "qwe-123-rty"),
            ("group_id", "123456"),
        ]);
        let payload = canonical_payload(&headers).unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"device_id": "qwe-123-rty", "group_id": "123456", "pipeline_id": "123"}"#
        );
    }

    #[test]
    fn test_canonical_payload_escapes_non_ascii() {
        let payload = canonical_payload(&BTreeMap::from([("name", "caf\u{e9} \u{1f600}")])).unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"name": "caf\u00e9 \ud83d\ude00"}"#
        );
    }

    #[test]
    fn test_canonical_payload_array() {
        let payload = canonical_payload(&vec![1, 2, 3]).unwrap();
        assert_eq!(String::from_utf8(payload).unwrap(), "[1, 2, 3]");
    }
}
