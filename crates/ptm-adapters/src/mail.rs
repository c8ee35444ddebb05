use std::sync::Arc;

use async_trait::async_trait;
use ptm_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport is not configured")]
    NotConfigured,
    #[error("mail request failed: {0}")]
    Http(#[from] FetchError),
}

/// Outbound email. No retry contract: a failure is reported, not retried.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Returns the provider's message id.
    async fn send(&self, mail: &OutgoingMail) -> Result<String, MailError>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Clone)]
pub struct ResendMailer {
    http: Arc<HttpFetcher>,
    endpoint: String,
    api_key: Option<String>,
}

impl ResendMailer {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl MailTransport for ResendMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<String, MailError> {
        let api_key = self.api_key.as_deref().ok_or(MailError::NotConfigured)?;
        let auth = format!("Bearer {api_key}");
        let body = json!({
            "from": mail.from,
            "to": [mail.to],
            "subject": mail.subject,
            "html": mail.html,
        });
        let resp = self
            .http
            .post_json("resend", &self.endpoint, &[("authorization", auth.as_str())], &body)
            .await?;
        let id = serde_json::from_slice::<SendResponse>(&resp.body)
            .map(|r| r.id)
            .unwrap_or_default();
        info!(to = %mail.to, message_id = %id, "mail accepted");
        Ok(id)
    }
}
