use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ptm_storage::{decode_body, FetchError, HttpFetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    /// Body decoded per the declared charset; municipal pages are often
    /// Shift_JIS or EUC-JP.
    pub fn html(&self) -> String {
        decode_body(&self.body, Some(&self.content_type))
    }
}

/// Network boundary for listing and detail pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, scope: &str, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: Arc<HttpFetcher>,
}

impl HttpPageSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, scope: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.http.fetch_bytes(scope, url).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            content_type: resp.content_type.unwrap_or_else(|| "text/html".to_string()),
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }
}
