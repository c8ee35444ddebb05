//! External collaborator adapters: page fetching and HTML text extraction,
//! source scrapers, the LLM client with its call-site prompts, and mail.

use thiserror::Error;

pub mod llm;
pub mod mail;
pub mod page;
pub mod prompts;
pub mod scrape;
pub mod text;

pub use llm::{generate_json, parse_json_response, strip_code_blocks, GeminiClient, LlmClient, LlmError, LlmRequest};
pub use mail::{MailError, MailTransport, OutgoingMail, ResendMailer};
pub use page::{FetchedPage, HttpPageSource, PageSource};
pub use scrape::{KkjApiScraper, LlmListingScraper, ScrapeStrategy, ScraperRegistry, SourceScraper};
pub use text::{html_to_text, TextOptions};

pub const CRATE_NAME: &str = "ptm-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] ptm_storage::FetchError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("source {source_id} is misconfigured: {reason}")]
    InvalidSource { source_id: String, reason: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// Network-layer failures, as opposed to extraction or configuration problems.
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}
