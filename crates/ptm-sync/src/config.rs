use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ptm_adapters::llm::{DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL};
use ptm_adapters::mail::DEFAULT_RESEND_ENDPOINT;
use serde::{Deserialize, Serialize};

/// Credentials and endpoints, read from the process environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_endpoint: String,
    pub resend_api_key: Option<String>,
    pub resend_endpoint: String,
    pub from_email: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub pipeline_config: Option<PathBuf>,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_var("DATABASE_URL"),
            gemini_api_key: non_empty_var("GEMINI_API_KEY"),
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_endpoint: std::env::var("GEMINI_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GEMINI_ENDPOINT.to_string()),
            resend_api_key: non_empty_var("RESEND_API_KEY"),
            resend_endpoint: std::env::var("RESEND_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_RESEND_ENDPOINT.to_string()),
            from_email: std::env::var("FROM_EMAIL")
                .unwrap_or_else(|_| "Public Tender Matcher <noreply@example.jp>".to_string()),
            user_agent: std::env::var("PTM_USER_AGENT").unwrap_or_else(|_| {
                "PublicTenderMatcher/0.1 (+procurement notice aggregation)".to_string()
            }),
            http_timeout_secs: std::env::var("PTM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            llm_timeout_secs: std::env::var("PTM_LLM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            scheduler_enabled: std::env::var("PTM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            // 02:00 JST
            sync_cron: std::env::var("PTM_SYNC_CRON").unwrap_or_else(|_| "0 17 * * *".to_string()),
            pipeline_config: non_empty_var("PTM_PIPELINE_CONFIG").map(PathBuf::from),
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        match self.database_url.as_deref() {
            Some(url) => Ok(url),
            None => bail!("DATABASE_URL is not set"),
        }
    }

    pub fn require_gemini_api_key(&self) -> Result<&str> {
        match self.gemini_api_key.as_deref() {
            Some(key) => Ok(key),
            None => bail!("GEMINI_API_KEY is not set"),
        }
    }
}

/// Pipeline tunables. Every field has a default, so a partial YAML file works.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scrape: ScrapeSettings,
    pub enrichment: EnrichmentSettings,
    pub classification: ClassificationSettings,
    pub matching: MatchingSettings,
    pub notification: NotificationSettings,
    pub ledger: LedgerSettings,
    pub llm: LlmSettings,
}

impl PipelineConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeSettings {
    pub source_timeout_secs: u64,
    /// Only scrape areas at least one active subscriber follows.
    pub subscribed_areas_only: bool,
    /// Date window for structured-API sources.
    pub api_window_days: i64,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            source_timeout_secs: 90,
            subscribed_areas_only: true,
            api_window_days: 7,
        }
    }
}

impl ScrapeSettings {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    pub workers: usize,
    pub page_size: usize,
    pub max_pages: Option<usize>,
    pub progress_every: u64,
    pub request_delay_ms: u64,
    pub min_text_chars: usize,
    pub max_text_chars: usize,
    /// Case-insensitive URL fragments that are never fetched.
    pub deny_list: Vec<String>,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            page_size: 200,
            max_pages: None,
            progress_every: 50,
            request_delay_ms: 0,
            min_text_chars: 30,
            max_text_chars: 15_000,
            deny_list: [
                ".pdf",
                ".zip",
                ".xls",
                ".xlsx",
                ".doc",
                ".docx",
                "mailto:",
                "javascript:",
                "/login",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationSettings {
    pub batch_size: usize,
    pub delay_ms: u64,
    pub limit: usize,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            delay_ms: 300,
            limit: 50_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    pub batch_size: usize,
    pub delay_ms: u64,
    pub screening_window_days: i64,
    pub screening_limit: usize,
    /// Look-back for a standalone match run, which has no fresh scrape to work from.
    pub recent_window_hours: i64,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            batch_size: 15,
            delay_ms: 1_000,
            screening_window_days: 30,
            screening_limit: 300,
            recent_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub paid_cap: usize,
    pub free_cap: usize,
    pub trial_days: i64,
    pub default_threshold: u8,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            paid_cap: 20,
            free_cap: 5,
            trial_days: 14,
            default_threshold: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub max_error_entries: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_error_entries: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub bucket_capacity: u32,
    pub refill_every_ms: u64,
    pub max_retries: usize,
    pub concurrency: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            bucket_capacity: 10,
            refill_every_ms: 200,
            max_retries: 3,
            concurrency: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_path_yields_defaults() {
        let cfg = PipelineConfig::load(None).unwrap();
        assert_eq!(cfg.matching.batch_size, 15);
        assert_eq!(cfg.classification.batch_size, 50);
        assert_eq!(cfg.notification.free_cap, 5);
        assert!(cfg.enrichment.deny_list.iter().any(|f| f == ".pdf"));
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "enrichment:\n  workers: 4\n  deny_list: ['/archive/']\nnotification:\n  paid_cap: 30\n"
        )
        .unwrap();

        let cfg = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.enrichment.workers, 4);
        assert_eq!(cfg.enrichment.page_size, 200);
        assert_eq!(cfg.enrichment.deny_list, vec!["/archive/".to_string()]);
        assert_eq!(cfg.notification.paid_cap, 30);
        assert_eq!(cfg.notification.free_cap, 5);
        assert_eq!(cfg.ledger.max_error_entries, 500);
    }

    #[test]
    fn malformed_yaml_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enrichment: [not, a, map]").unwrap();
        let err = PipelineConfig::load(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
    }
}
