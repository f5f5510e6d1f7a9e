use std::collections::BTreeMap;

use chrono::Utc;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::services::codec::canonical_json;

/// A captured frame together with the timestamp the producer assigned to it.
#[derive(Debug, Clone)]
pub struct DatedImage {
    pub timestamp: String,
    pub image: DynamicImage,
}

impl DatedImage {
    pub fn new(timestamp: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            timestamp: timestamp.into(),
            image,
        }
    }

    /// Stamp the image with the current UTC time (RFC 3339).
    pub fn now(image: DynamicImage) -> Self {
        Self::new(Utc::now().to_rfc3339(), image)
    }
}

/// Primitive scalar allowed in user metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// JSON-like settings stored alongside every uploaded sample
/// (e.g. the act settings that produced it).
pub type UserMetadata = BTreeMap<String, MetadataValue>;

/// Serialize metadata into the string form carried in the `user_data` field:
/// keys sorted, `", "` / `": "` separators, ASCII only.
pub fn serialize_metadata(metadata: &UserMetadata) -> Result<String, serde_json::Error> {
    canonical_json(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_serializes_as_flat_object() {
        let mut metadata = UserMetadata::new();
        metadata.insert("score_threshold".to_string(), 0.3.into());
        metadata.insert("camera".to_string(), "front".into());
        metadata.insert("rotate".to_string(), true.into());
        metadata.insert("fps".to_string(), 15i64.into());

        let serialized = serialize_metadata(&metadata).unwrap();
        assert_eq!(
            serialized,
            r#"{"camera": "front", "fps": 15, "rotate": true, "score_threshold": 0.3}"#
        );
    }

    #[test]
    fn test_metadata_parses_from_settings_json() {
        let metadata: UserMetadata =
            serde_json::from_str(r#"{"threshold": 0.5, "label": "cat", "n": 2, "on": false}"#)
                .unwrap();
        assert_eq!(metadata["threshold"], MetadataValue::Float(0.5));
        assert_eq!(metadata["label"], MetadataValue::Text("cat".to_string()));
        assert_eq!(metadata["n"], MetadataValue::Int(2));
        assert_eq!(metadata["on"], MetadataValue::Bool(false));
    }

    #[test]
    fn test_metadata_text_is_ascii_escaped() {
        let mut metadata = UserMetadata::new();
        metadata.insert("label".to_string(), "caf\u{e9}".into());
        assert_eq!(
            serialize_metadata(&metadata).unwrap(),
            r#"{"label": "caf\u00e9"}"#
        );
    }

    #[test]
    fn test_empty_metadata() {
        assert_eq!(serialize_metadata(&UserMetadata::new()).unwrap(), "{}");
    }
}
