//! Oracle HTTP client.
//!
//! The Oracle is the remote trust authority that holds each wearable's
//! symmetric key; the host never sees it.  Two stages, correlated by the
//! wearable identifier:
//!
//! ```text
//! GET {base}/auth/stage1/{id}/{plaintextHex}   → {"message": ciphertextHex}
//! GET {base}/auth/stage2/{id}/{ciphertextHex}  → {"message": plaintextHex}
//! ```
//!
//! The handshake state machine treats the absence of a reply within its own
//! per-state deadline as a timeout, so callers here simply log failures;
//! non-200 statuses and transport errors are never distinguished from a slow
//! network.  At most one request is in flight because at most one handshake
//! session exists.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by Oracle calls.  All of them route to the same place:
/// the state machine's timeout path.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Connection, DNS, TLS, or body-read failure.
    #[error("oracle transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The Oracle answered with a non-success status.
    #[error("oracle returned HTTP {0}")]
    Status(reqwest::StatusCode),

    /// Used by scripted test doubles to refuse a stage.
    #[error("oracle refused: {0}")]
    Refused(String),
}

/// Response body common to both stages.
#[derive(Debug, Deserialize)]
struct OracleReply {
    message: String,
}

/// The seam between the handshake state machine and the trust authority.
///
/// Production uses [`HttpOracle`]; tests substitute scripted doubles.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Stage 1: the wearable's submitted block, encrypted under its key.
    async fn encrypt(&self, id: &str, plaintext_hex: &str) -> Result<String, OracleError>;

    /// Stage 2: the wearable's echo, decrypted back to plaintext.
    async fn decrypt(&self, id: &str, ciphertext_hex: &str) -> Result<String, OracleError>;
}

/// Oracle client backed by `reqwest`.
pub struct HttpOracle {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOracle {
    /// Builds a client with a hard per-request timeout.
    ///
    /// The timeout should sit above the state machine's oracle deadline so
    /// the machine, not the HTTP layer, decides when a round has failed.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::Transport`] if the underlying client cannot be
    /// constructed.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn stage(&self, stage: &str, id: &str, block: &str) -> Result<String, OracleError> {
        let url = stage_url(&self.base_url, stage, id, block);
        debug!("oracle request: {url}");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(OracleError::Status(response.status()));
        }

        let reply: OracleReply = response.json().await?;
        Ok(reply.message)
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn encrypt(&self, id: &str, plaintext_hex: &str) -> Result<String, OracleError> {
        self.stage("stage1", id, plaintext_hex).await
    }

    async fn decrypt(&self, id: &str, ciphertext_hex: &str) -> Result<String, OracleError> {
        self.stage("stage2", id, ciphertext_hex).await
    }
}

/// Builds the request URL for one stage.
fn stage_url(base_url: &str, stage: &str, id: &str, block: &str) -> String {
    format!("{base_url}/auth/{stage}/{id}/{block}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_url_layout_matches_oracle_contract() {
        assert_eq!(
            stage_url("http://oracle.example", "stage1", "ABC123", "DEADBEEF"),
            "http://oracle.example/auth/stage1/ABC123/DEADBEEF"
        );
    }

    #[test]
    fn test_http_oracle_strips_trailing_slash_from_base_url() {
        let oracle = HttpOracle::new("http://oracle.example/", Duration::from_secs(8)).unwrap();
        assert_eq!(oracle.base_url, "http://oracle.example");
    }

    #[test]
    fn test_oracle_reply_deserializes_message_field() {
        let reply: OracleReply = serde_json::from_str(r#"{"message":"CAFEBABE"}"#).unwrap();
        assert_eq!(reply.message, "CAFEBABE");
    }

    #[test]
    fn test_refused_error_display_names_the_reason() {
        let e = OracleError::Refused("scripted".to_string());
        assert_eq!(e.to_string(), "oracle refused: scripted");
    }
}
