use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::models::sample::UserMetadata;

/// Settings for the `lp-sender` binary, read from `LP_*` variables.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Root URL of the learning pipeline API. Empty disables sending.
    #[serde(default)]
    pub endpoint_root: String,

    /// Pipeline the samples belong to (issued when the pipeline is created)
    pub pipeline_id: String,

    /// JSON object stored with every sample (e.g. the act settings)
    #[serde(default)]
    pub user_metadata: Option<String>,

    /// Sending queue size; 0 means no limit
    #[serde(default)]
    pub queue_size: usize,

    #[serde(default = "default_max_retry")]
    pub max_retry: NonZeroU32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long to wait for the queue to drain on shutdown
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    /// RSA private key (PEM) used to sign token requests
    pub signing_key_path: PathBuf,

    /// Prometheus listen address. Metrics are not exported when unset.
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

fn default_max_retry() -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(2)
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_join_timeout_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("LP_").from_env()
    }

    pub fn metadata(&self) -> Result<UserMetadata, serde_json::Error> {
        match self.user_metadata.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw),
            _ => Ok(UserMetadata::new()),
        }
    }
}

/// Identity the device agent exposes through `ACTCAST_*` variables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceEnv {
    pub device_id: Option<String>,
    pub group_id: Option<String>,
    pub act_id: Option<String>,
    /// `host:port` of the SOCKS proxy all traffic must go through
    pub socks_server: Option<String>,
}

impl DeviceEnv {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ACTCAST_").from_env()
    }
}

/// Validated device identity sent with token and upload requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub device_id: String,
    pub group_id: String,
    pub act_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("endpoint URL is not set, data sending will fail")]
    MissingEndpoint,

    #[error("Device ID could not be retrieved, check device firmware")]
    MissingDeviceId,

    #[error("Group ID could not be retrieved, check device firmware")]
    MissingGroupId,

    #[error("SOCKS server address {address:?} is invalid: {reason}")]
    InvalidProxy { address: String, reason: String },
}

/// Everything needed to reach the remote endpoints.
#[derive(Debug, Clone)]
pub struct Link {
    pub endpoint_root: String,
    pub identity: Identity,
    pub proxy: Option<reqwest::Proxy>,
}

#[derive(Debug, Clone)]
pub enum Sending {
    Enabled(Link),
    Disabled(Vec<ConfigurationError>),
}

/// Explicit configuration for one sender task. Nothing is looked up from
/// the environment after this value is built.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub endpoint_root: String,
    pub pipeline_id: String,
    pub device: DeviceEnv,
    pub metadata: UserMetadata,
    pub max_retry: NonZeroU32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl SenderConfig {
    pub fn new(
        endpoint_root: impl Into<String>,
        pipeline_id: impl Into<String>,
        device: DeviceEnv,
    ) -> Self {
        Self {
            endpoint_root: endpoint_root.into(),
            pipeline_id: pipeline_id.into(),
            device,
            metadata: UserMetadata::new(),
            max_retry: default_max_retry(),
            retry_backoff: Duration::from_millis(default_retry_backoff_ms()),
            request_timeout: Duration::from_secs(default_request_timeout_secs()),
        }
    }

    pub fn from_app(app: &AppConfig, device: DeviceEnv) -> Result<Self, serde_json::Error> {
        Ok(Self {
            metadata: app.metadata()?,
            max_retry: app.max_retry,
            retry_backoff: Duration::from_millis(app.retry_backoff_ms),
            request_timeout: Duration::from_secs(app.request_timeout_secs),
            ..Self::new(app.endpoint_root.clone(), app.pipeline_id.clone(), device)
        })
    }

    pub fn with_metadata(mut self, metadata: UserMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_retry(mut self, max_retry: NonZeroU32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Check the required values once. Problems do not fail construction;
    /// they disable sending for the lifetime of the task.
    pub fn validate(self) -> ValidatedConfig {
        let mut problems = Vec::new();

        let endpoint_root = self.endpoint_root.trim().to_string();
        if endpoint_root.is_empty() {
            problems.push(ConfigurationError::MissingEndpoint);
        }
        let device_id = present(&self.device.device_id);
        if device_id.is_none() {
            problems.push(ConfigurationError::MissingDeviceId);
        }
        let group_id = present(&self.device.group_id);
        if group_id.is_none() {
            problems.push(ConfigurationError::MissingGroupId);
        }

        let proxy = match present(&self.device.socks_server) {
            None => None,
            Some(address) => match reqwest::Proxy::all(format!("socks5h://{address}")) {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    problems.push(ConfigurationError::InvalidProxy {
                        address: address.to_string(),
                        reason: e.to_string(),
                    });
                    None
                }
            },
        };

        let sending = match (device_id, group_id) {
            (Some(device_id), Some(group_id)) if problems.is_empty() => Sending::Enabled(Link {
                endpoint_root,
                identity: Identity {
                    device_id: device_id.to_string(),
                    group_id: group_id.to_string(),
                    act_id: present(&self.device.act_id).map(str::to_string),
                },
                proxy,
            }),
            _ => Sending::Disabled(problems),
        };

        ValidatedConfig {
            config: self,
            sending,
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// A [`SenderConfig`] together with the outcome of validating it.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub config: SenderConfig,
    pub sending: Sending,
}

impl ValidatedConfig {
    pub fn sending_enabled(&self) -> bool {
        matches!(self.sending, Sending::Enabled(_))
    }

    pub fn problems(&self) -> &[ConfigurationError] {
        match &self.sending {
            Sending::Enabled(_) => &[],
            Sending::Disabled(problems) => problems,
        }
    }
}

/// Join a path onto an endpoint root regardless of trailing slashes.
pub fn endpoint_url(root: &str, path: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceEnv {
        DeviceEnv {
            device_id: Some("qwe-123-rty".to_string()),
            group_id: Some("123456".to_string()),
            act_id: Some("42".to_string()),
            socks_server: None,
        }
    }

    #[test]
    fn test_complete_config_enables_sending() {
        let validated = SenderConfig::new("https://api.example.com", "123", device()).validate();
        assert!(validated.sending_enabled());
        let Sending::Enabled(link) = &validated.sending else {
            panic!("expected sending to be enabled");
        };
        assert_eq!(link.identity.device_id, "qwe-123-rty");
        assert_eq!(link.identity.act_id.as_deref(), Some("42"));
        assert!(link.proxy.is_none());
    }

    #[test]
    fn test_missing_group_id_disables_sending() {
        let device = DeviceEnv {
            group_id: None,
            ..device()
        };
        let validated = SenderConfig::new("https://api.example.com", "123", device).validate();
        assert!(!validated.sending_enabled());
        assert_eq!(validated.problems(), &[ConfigurationError::MissingGroupId]);
    }

    #[test]
    fn test_every_problem_is_reported() {
        let validated = SenderConfig::new("  ", "123", DeviceEnv::default()).validate();
        assert_eq!(
            validated.problems(),
            &[
                ConfigurationError::MissingEndpoint,
                ConfigurationError::MissingDeviceId,
                ConfigurationError::MissingGroupId,
            ]
        );
    }

    #[test]
    fn test_socks_server_becomes_proxy() {
        let device = DeviceEnv {
            socks_server: Some("127.0.0.1:1080".to_string()),
            ..device()
        };
        let validated = SenderConfig::new("https://api.example.com", "123", device).validate();
        let Sending::Enabled(link) = validated.sending else {
            panic!("expected sending to be enabled");
        };
        assert!(link.proxy.is_some());
    }

    #[test]
    fn test_missing_act_id_is_allowed() {
        let device = DeviceEnv {
            act_id: None,
            ..device()
        };
        assert!(SenderConfig::new("https://api.example.com", "123", device)
            .validate()
            .sending_enabled());
    }

    #[test]
    fn test_defaults() {
        let config = SenderConfig::new("https://api.example.com", "123", device());
        assert_eq!(config.max_retry.get(), 3);
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_endpoint_url_joins_cleanly() {
        assert_eq!(
            endpoint_url("https://api.example.com/", "device/token"),
            "https://api.example.com/device/token"
        );
        assert_eq!(
            endpoint_url("https://api.example.com", "data_collect"),
            "https://api.example.com/data_collect"
        );
    }
}
