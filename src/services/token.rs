use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::Identity;
use crate::models::credential::Credential;
use crate::services::codec::canonical_payload;

/// Opaque signing capability: canonical bytes in, signature string out.
pub trait Signer: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<String, SignError>;
}

impl<F> Signer for F
where
    F: Fn(&[u8]) -> Result<String, SignError> + Send + Sync,
{
    fn sign(&self, payload: &[u8]) -> Result<String, SignError> {
        self(payload)
    }
}

/// RS256 over a PEM-encoded RSA private key.
pub struct Rs256Signer {
    key: EncodingKey,
}

impl Rs256Signer {
    pub fn from_pem(pem: &[u8]) -> Result<Self, SignError> {
        let key = EncodingKey::from_rsa_pem(pem).map_err(SignError::Key)?;
        Ok(Self { key })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SignError> {
        let pem = std::fs::read(path)?;
        Self::from_pem(&pem)
    }
}

impl Signer for Rs256Signer {
    fn sign(&self, payload: &[u8]) -> Result<String, SignError> {
        jsonwebtoken::crypto::sign(payload, &self.key, Algorithm::RS256)
            .map_err(|e| SignError::Failed(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("Failed to read signing key: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid signing key: {0}")]
    Key(#[source] jsonwebtoken::errors::Error),

    #[error("Signing failed: {0}")]
    Failed(String),
}

/// Failures that say the device cannot authenticate right now.
/// Retrying the same request will not help.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("could not build signing payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("{0}")]
    Signing(#[from] SignError),

    #[error("token endpoint responded {status}")]
    Rejected { status: StatusCode },

    #[error("malformed token response: {0}")]
    Malformed(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("token request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    data_collect_token: String,
    expires_in: f64,
}

/// Holds the data collect token and refreshes it from the token endpoint.
///
/// Owned by the sending step, so it is only ever mutated from the worker
/// thread and needs no lock.
pub struct TokenManager {
    http: Client,
    url: String,
    identity: Identity,
    pipeline_id: String,
    signer: Arc<dyn Signer>,
    credential: Option<Credential>,
}

impl TokenManager {
    pub fn new(
        http: Client,
        url: String,
        identity: Identity,
        pipeline_id: String,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            http,
            url,
            identity,
            pipeline_id,
            signer,
            credential: None,
        }
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Forget the held token so the next call refreshes.
    pub fn invalidate(&mut self) {
        self.credential = None;
    }

    /// The held token while it is still valid, otherwise a fresh one.
    pub async fn current_or_refreshed(&mut self) -> Result<Credential, TokenError> {
        if let Some(credential) = self.credential.as_ref().filter(|c| !c.is_expired()) {
            return Ok(credential.clone());
        }
        self.refresh().await
    }

    /// Request a new token. Not retried here; the caller owns retry policy.
    pub async fn refresh(&mut self) -> Result<Credential, TokenError> {
        let headers = BTreeMap::from([
            ("device_id", self.identity.device_id.as_str()),
            ("group_id", self.identity.group_id.as_str()),
            ("pipeline_id", self.pipeline_id.as_str()),
        ]);
        let payload = canonical_payload(&headers).map_err(AuthError::Payload)?;
        let signature = self.signer.sign(&payload).map_err(AuthError::Signing)?;

        let response = self
            .http
            .get(&self.url)
            .header("device_id", &self.identity.device_id)
            .header("group_id", &self.identity.group_id)
            .header("pipeline_id", &self.pipeline_id)
            .header(AUTHORIZATION, signature)
            .send()
            .await
            .map_err(|e| {
                metrics::counter!("sender_token_refresh_total", "result" => "transport").increment(1);
                TokenError::Transport(e)
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            metrics::counter!("sender_token_refresh_total", "result" => "rejected").increment(1);
            tracing::warn!(status = status.as_u16(), "Data collect token request rejected");
            return Err(AuthError::Rejected { status }.into());
        }

        let body: TokenResponse = response.json().await.map_err(AuthError::Malformed)?;
        let credential = Credential::issued(body.data_collect_token, body.expires_in, Utc::now());
        tracing::debug!(expires_at = %credential.expires_at, "Data collect token refreshed");
        metrics::counter!("sender_token_refresh_total", "result" => "ok").increment(1);

        // Replaced wholesale; there is never more than one token.
        self.credential = Some(credential.clone());
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_signer() {
        let signer = |payload: &[u8]| -> Result<String, SignError> {
            Ok(format!("signed:{}", payload.len()))
        };
        assert_eq!(signer.sign(b"abc").unwrap(), "signed:3");
    }

    #[test]
    fn test_rs256_signer_rejects_garbage_key() {
        let err = Rs256Signer::from_pem(b"not a pem").err().unwrap();
        assert!(matches!(err, SignError::Key(_)));
    }

    #[test]
    fn test_manager_starts_without_credential() {
        let signer: Arc<dyn Signer> =
            Arc::new(|_: &[u8]| -> Result<String, SignError> { Ok("sig".to_string()) });
        let identity = Identity {
            device_id: "dev".to_string(),
            group_id: "grp".to_string(),
            act_id: None,
        };
        let mut manager = TokenManager::new(
            Client::new(),
            "http://127.0.0.1:9/device/token".to_string(),
            identity,
            "pipe".to_string(),
            signer,
        );
        assert!(manager.credential().is_none());
        manager.invalidate();
        assert!(manager.credential().is_none());
    }
}
