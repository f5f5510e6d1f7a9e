use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{endpoint_url, Identity, Sending, ValidatedConfig};
use crate::models::outcome::SendOutcome;
use crate::models::sample::{serialize_metadata, DatedImage};
use crate::services::codec;
use crate::services::notifier::Notifier;
use crate::services::queue::QueuePolicy;
use crate::services::token::{AuthError, Signer, TokenError, TokenManager};
use crate::services::worker::{Processor, StepError, Worker};

/// A worker whose step uploads dated images.
pub type SenderTask = Worker<DatedImage, DataSender>;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("endpoint not configured")]
    NotConfigured,

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("data collect token request failure: {0}")]
    Auth(#[from] AuthError),

    #[error("upload rejected as unauthorized")]
    Unauthorized,

    #[error("data collect failed with status {status} (reason: {body})")]
    Server { status: StatusCode, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<SendError>,
    },
}

impl From<TokenError> for SendError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Auth(e) => SendError::Auth(e),
            TokenError::Transport(e) => SendError::Transport(e),
        }
    }
}

impl SendError {
    /// Whether another attempt can succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendError::Unauthorized | SendError::Server { .. } | SendError::Transport(_)
        )
    }
}

/// Bounded attempts with exponential backoff between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (0-based). None before the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

#[derive(Serialize)]
struct DataCollectRequest<'a> {
    timestamp: &'a str,
    image: &'a str,
    device_id: &'a str,
    act_id: Option<&'a str>,
    pipeline_id: &'a str,
    user_data: &'a str,
}

/// Connection to the learning pipeline API. Only exists when sending is enabled.
struct Uplink {
    http: Client,
    data_collect_url: String,
    identity: Identity,
    pipeline_id: String,
    user_data: String,
    tokens: TokenManager,
}

impl Uplink {
    /// One upload round-trip, including the token it needs.
    async fn attempt(&mut self, timestamp: &str, image: &str) -> Result<(), SendError> {
        let credential = self.tokens.current_or_refreshed().await?;

        let body = DataCollectRequest {
            timestamp,
            image,
            device_id: &self.identity.device_id,
            act_id: self.identity.act_id.as_deref(),
            pipeline_id: &self.pipeline_id,
            user_data: &self.user_data,
        };
        let response = self
            .http
            .post(&self.data_collect_url)
            .bearer_auth(&credential.token)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED => {
                // Never reuse a token the server has refused.
                self.tokens.invalidate();
                self.tokens.refresh().await?;
                Err(SendError::Unauthorized)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SendError::Server { status, body })
            }
        }
    }
}

/// The sending step: encodes a sample, authenticates, uploads, and retries
/// within a bounded budget. Every sample ends with exactly one
/// `Tried to send data sample: ...` message; rejected attempts are reported
/// as they happen.
pub struct DataSender {
    uplink: Option<Uplink>,
    retry: RetryPolicy,
    notifier: Arc<dyn Notifier>,
}

impl DataSender {
    /// Build the sender. Configuration problems are reported to the notifier
    /// here, once, and leave the sender permanently disabled.
    pub fn new(
        validated: ValidatedConfig,
        signer: Arc<dyn Signer>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, reqwest::Error> {
        let ValidatedConfig { config, sending } = validated;
        let retry = RetryPolicy {
            max_attempts: config.max_retry,
            backoff: config.retry_backoff,
        };

        let link = match sending {
            Sending::Enabled(link) => link,
            Sending::Disabled(problems) => {
                for problem in &problems {
                    tracing::warn!(problem = %problem, "Data sending disabled");
                    notifier.notify(&problem.to_string());
                }
                return Ok(Self {
                    uplink: None,
                    retry,
                    notifier,
                });
            }
        };

        let mut builder = Client::builder().timeout(config.request_timeout);
        if let Some(proxy) = link.proxy {
            builder = builder.proxy(proxy);
        }
        let http = builder.build()?;

        let user_data = match serialize_metadata(&config.metadata) {
            Ok(user_data) => user_data,
            Err(e) => {
                tracing::warn!(error = %e, "User metadata could not be serialized, sending empty object");
                "{}".to_string()
            }
        };

        let tokens = TokenManager::new(
            http.clone(),
            endpoint_url(&link.endpoint_root, "device/token"),
            link.identity.clone(),
            config.pipeline_id.clone(),
            signer,
        );

        Ok(Self {
            uplink: Some(Uplink {
                http,
                data_collect_url: endpoint_url(&link.endpoint_root, "data_collect"),
                identity: link.identity,
                pipeline_id: config.pipeline_id,
                user_data,
                tokens,
            }),
            retry,
            notifier,
        })
    }

    pub fn sending_enabled(&self) -> bool {
        self.uplink.is_some()
    }

    /// Wrap the sender in a worker with its own queue and thread.
    pub fn into_task(self, policy: QueuePolicy) -> SenderTask {
        let notifier = Arc::clone(&self.notifier);
        Worker::new("lp-sender", policy, self, notifier)
    }

    /// Upload one sample, retrying within the budget.
    /// Returns the number of attempts it took.
    pub async fn send(&mut self, sample: &DatedImage) -> Result<u32, SendError> {
        let Some(uplink) = self.uplink.as_mut() else {
            return Err(SendError::NotConfigured);
        };
        let image = codec::encode_png_base64(&sample.image)?;

        let max_attempts = self.retry.max_attempts.get();
        let mut last = None;
        for attempt in 0..max_attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            metrics::counter!("sender_attempts_total").increment(1);

            let result = uplink.attempt(&sample.timestamp, &image).await;
            if let Err(e) = &result {
                report_attempt(self.notifier.as_ref(), e);
            }
            match result {
                Ok(()) => return Ok(attempt + 1),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt = attempt + 1, max_attempts, error = %e, "Data collect attempt failed");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(match last {
            Some(last) => SendError::RetryExhausted {
                attempts: max_attempts,
                last: Box::new(last),
            },
            None => SendError::NotConfigured,
        })
    }

    /// Send and report the final outcome to the notifier.
    pub async fn submit(&mut self, sample: &DatedImage) -> SendOutcome {
        let sample_id = Uuid::new_v4();
        let span = tracing::info_span!("send_sample", %sample_id, timestamp = %sample.timestamp);

        let result = self.send(sample).instrument(span.clone()).await;
        let _entered = span.enter();
        match result {
            Ok(attempts) => {
                tracing::info!(attempts, "Data sample sent");
                metrics::counter!("sender_samples_total", "outcome" => "success").increment(1);
                self.notifier.notify("Tried to send data sample: Success");
                SendOutcome::Success
            }
            Err(e) => {
                tracing::warn!(error = %e, "Data sample not sent");
                metrics::counter!("sender_samples_total", "outcome" => "failure").increment(1);
                self.notifier
                    .notify(&format!("Tried to send data sample: Failure ({e})"));
                SendOutcome::Failure
            }
        }
    }
}

/// Per-attempt status for the failures the server told us about.
/// Transport errors only show up in the final message.
fn report_attempt(notifier: &dyn Notifier, err: &SendError) {
    match err {
        SendError::Server { status, body } => notifier.notify(&format!(
            "Data collect failed with status {} (reason: {body})",
            status.as_u16()
        )),
        SendError::Auth(AuthError::Rejected { status }) => notifier.notify(&format!(
            "Data Collect Token request failure ({})",
            status.as_u16()
        )),
        _ => {}
    }
}

impl Processor<DatedImage> for DataSender {
    async fn process(&mut self, sample: DatedImage) -> Result<(), StepError> {
        self.submit(&sample).await;
        Ok(())
    }
}
