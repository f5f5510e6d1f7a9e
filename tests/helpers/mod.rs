//! Shared setup for sender integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::DynamicImage;
use lp_sender::config::{DeviceEnv, SenderConfig};
use lp_sender::models::sample::DatedImage;
use lp_sender::services::notifier::Notifier;
use lp_sender::services::token::{SignError, Signer};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN_PATH: &str = "/device/token";
pub const COLLECT_PATH: &str = "/data_collect";
pub const TOKEN: &str = "b1af81f2-5622-4ae2-9e89-4344a47337ce";
pub const PIPELINE_ID: &str = "123";

/// Collects every status message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Signer that records the payloads it was asked to sign.
#[derive(Default)]
pub struct PseudoSigner {
    pub payloads: Mutex<Vec<Vec<u8>>>,
}

impl Signer for PseudoSigner {
    fn sign(&self, payload: &[u8]) -> Result<String, SignError> {
        self.payloads.lock().unwrap().push(payload.to_vec());
        Ok("pseudo_sign".to_string())
    }
}

pub fn device() -> DeviceEnv {
    DeviceEnv {
        device_id: Some("qwe-123-rty".to_string()),
        group_id: Some("123456".to_string()),
        act_id: Some("987".to_string()),
        socks_server: None,
    }
}

pub fn sender_config(endpoint_root: &str) -> SenderConfig {
    SenderConfig::new(endpoint_root, PIPELINE_ID, device())
        .with_retry_backoff(Duration::ZERO)
        .with_request_timeout(Duration::from_secs(5))
}

pub fn sample(timestamp: &str) -> DatedImage {
    DatedImage::new(timestamp, DynamicImage::new_rgb8(200, 200))
}

pub fn as_notifier(notifier: &Arc<RecordingNotifier>) -> Arc<dyn Notifier> {
    Arc::clone(notifier) as Arc<dyn Notifier>
}

/// Token endpoint answering with the given lifetime in seconds.
pub async fn mount_token(server: &MockServer, expires_in: f64) {
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data_collect_token": TOKEN,
            "expires_in": expires_in,
        })))
        .mount(server)
        .await;
}

pub async fn mount_collect(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path(COLLECT_PATH))
        .respond_with(ResponseTemplate::new(status).set_body_string("collect response"))
        .mount(server)
        .await;
}

pub async fn call_count(server: &MockServer, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == request_path)
        .count()
}
