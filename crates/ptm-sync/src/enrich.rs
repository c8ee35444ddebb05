use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ptm_adapters::prompts::{detail_request, parse_detail, value_text};
use ptm_adapters::{generate_json, html_to_text, LlmClient, PageSource, TextOptions};
use ptm_core::{
    parse_strict_date, truncate_chars, truncate_with_ellipsis, Difficulty, EnrichOutcome, ErrorClass,
    EnrichmentPatch, EnrichmentTally, Opportunity, RunError, RunPhase,
};
use ptm_storage::{RecordStore, StoreError};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::EnrichmentSettings;

pub const DETAILED_SUMMARY_MAX_CHARS: usize = 300;
pub const REQUIREMENTS_MAX_CHARS: usize = 500;
pub const BUDGET_MAX_CHARS: usize = 100;
pub const CONTRACT_PERIOD_MAX_CHARS: usize = 200;
pub const CONTACT_INFO_MAX_CHARS: usize = 300;

/// Turns the raw extraction object into a column-safe patch: malformed dates
/// and unknown difficulty labels become `None`, text fields are cut to their
/// column budgets.
pub fn validate_detail(raw: &Map<String, JsonValue>) -> EnrichmentPatch {
    let text = |key: &str| value_text(raw.get(key));
    let date = |key: &str| text(key).as_deref().and_then(parse_strict_date);
    let capped = |key: &str, max: usize| text(key).map(|v| truncate_chars(&v, max));

    EnrichmentPatch {
        published_date: date("published_date"),
        deadline: date("deadline"),
        bid_opening_date: date("bid_opening_date"),
        briefing_date: date("briefing_date"),
        budget: capped("budget", BUDGET_MAX_CHARS),
        requirements: capped("requirements", REQUIREMENTS_MAX_CHARS),
        contract_period: capped("contract_period", CONTRACT_PERIOD_MAX_CHARS),
        contact_info: capped("contact_info", CONTACT_INFO_MAX_CHARS),
        detailed_summary: text("detailed_summary")
            .map(|v| truncate_with_ellipsis(&v, DETAILED_SUMMARY_MAX_CHARS)),
        difficulty: text("difficulty").as_deref().and_then(Difficulty::parse),
    }
}

/// URL fragments that are never fetched (binary documents, login walls).
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    fragments: Vec<String>,
}

impl DenyList {
    pub fn new(fragments: &[String]) -> Self {
        Self {
            fragments: fragments
                .iter()
                .map(|f| f.trim().to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        let url = url.to_lowercase();
        self.fragments.iter().any(|f| url.contains(f.as_str()))
    }
}

/// URLs that already failed during this run, with the outcome they failed with.
#[derive(Debug, Default)]
pub struct FailedUrlMemo {
    urls: Mutex<HashMap<String, EnrichOutcome>>,
}

impl FailedUrlMemo {
    pub async fn get(&self, url: &str) -> Option<EnrichOutcome> {
        self.urls.lock().await.get(url).copied()
    }

    pub async fn remember(&self, url: &str, outcome: EnrichOutcome) {
        self.urls.lock().await.insert(url.to_string(), outcome);
    }

    pub async fn count(&self) -> usize {
        self.urls.lock().await.len()
    }
}

struct StatsInner {
    tally: EnrichmentTally,
    errors: Vec<RunError>,
}

/// Outcome counters shared by all workers of one enrichment run.
pub struct EnrichStats {
    inner: Mutex<StatsInner>,
    started: Instant,
    progress_every: u64,
}

impl EnrichStats {
    pub fn new(progress_every: u64) -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                tally: EnrichmentTally::default(),
                errors: Vec::new(),
            }),
            started: Instant::now(),
            progress_every: progress_every.max(1),
        }
    }

    pub async fn record(&self, outcome: EnrichOutcome, error: Option<RunError>) {
        let mut inner = self.inner.lock().await;
        inner.tally.bump(outcome);
        if let Some(err) = error {
            inner.errors.push(err);
        }
        let done = inner.tally.total();
        if done % self.progress_every == 0 {
            let minutes = self.started.elapsed().as_secs_f64() / 60.0;
            let per_minute = if minutes > 0.0 { done as f64 / minutes } else { 0.0 };
            info!(
                done,
                success = inner.tally.success,
                failed = done - inner.tally.success - inner.tally.skipped,
                skipped = inner.tally.skipped,
                per_minute = %format!("{per_minute:.1}"),
                "enrichment progress"
            );
        }
    }

    pub async fn tally(&self) -> EnrichmentTally {
        self.inner.lock().await.tally
    }

    async fn drain(&self) -> (EnrichmentTally, Vec<RunError>) {
        let mut inner = self.inner.lock().await;
        (inner.tally, std::mem::take(&mut inner.errors))
    }
}

#[derive(Debug, Default)]
pub struct EnrichReport {
    pub tally: EnrichmentTally,
    pub errors: Vec<RunError>,
    pub pages: usize,
}

struct Worker {
    store: Arc<dyn RecordStore>,
    pages: Arc<dyn PageSource>,
    llm: Arc<dyn LlmClient>,
    memo: FailedUrlMemo,
    deny: DenyList,
    stats: EnrichStats,
    min_text_chars: usize,
    max_text_chars: usize,
    request_delay: Duration,
}

impl Worker {
    async fn process(&self, opp: Opportunity) -> EnrichOutcome {
        let (outcome, message) = self.attempt(&opp).await;
        let error = outcome.error_class().map(|class| RunError {
            phase: RunPhase::Enrich,
            class,
            context: format!(
                "opportunity={} url={}",
                opp.id,
                opp.detail_url.as_deref().unwrap_or("")
            ),
            message: message.unwrap_or_default(),
        });
        self.stats.record(outcome, error).await;
        outcome
    }

    async fn attempt(&self, opp: &Opportunity) -> (EnrichOutcome, Option<String>) {
        let Some(url) = opp.detail_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return (EnrichOutcome::Skipped, None);
        };
        if self.deny.matches(url) {
            debug!(%url, "detail url deny-listed");
            return (EnrichOutcome::Skipped, None);
        }
        if let Some(previous) = self.memo.get(url).await {
            return (previous, Some("url already failed in this run".to_string()));
        }

        let page = match self.pages.fetch("detail", url).await {
            Ok(page) => page,
            Err(err) => {
                debug!(%url, error = %err, "detail fetch failed");
                self.memo.remember(url, EnrichOutcome::FetchFailed).await;
                return (EnrichOutcome::FetchFailed, Some(err.to_string()));
            }
        };
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let text = match html_to_text(&page.html(), &TextOptions::detail(self.max_text_chars)) {
            Ok(text) => text,
            Err(err) => return (EnrichOutcome::ExtractionFailed, Some(err.to_string())),
        };
        if text.trim().chars().count() < self.min_text_chars {
            self.memo.remember(url, EnrichOutcome::FetchFailed).await;
            return (
                EnrichOutcome::FetchFailed,
                Some(format!("page text under {} chars", self.min_text_chars)),
            );
        }

        let raw = match generate_json(self.llm.as_ref(), &detail_request(&opp.title, &text))
            .await
            .and_then(parse_detail)
        {
            Ok(raw) => raw,
            Err(err) => return (EnrichOutcome::ExtractionFailed, Some(err.to_string())),
        };
        let patch = validate_detail(&raw);

        match self.store.apply_enrichment(opp.id, &patch, Utc::now()).await {
            Ok(()) => (EnrichOutcome::Success, None),
            Err(err) => (EnrichOutcome::DbFailed, Some(err.to_string())),
        }
    }
}

/// Drains the enrichment backlog page by page with a bounded set of workers.
pub struct EnrichmentPool {
    store: Arc<dyn RecordStore>,
    pages: Arc<dyn PageSource>,
    llm: Arc<dyn LlmClient>,
    settings: EnrichmentSettings,
}

impl EnrichmentPool {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pages: Arc<dyn PageSource>,
        llm: Arc<dyn LlmClient>,
        settings: EnrichmentSettings,
    ) -> Self {
        Self {
            store,
            pages,
            llm,
            settings,
        }
    }

    /// Successful rows leave the backlog, so the cursor only advances past the
    /// rows that stay behind. Stops on an empty or short page, or at `max_pages`.
    pub async fn run(&self) -> Result<EnrichReport, StoreError> {
        let page_size = self.settings.page_size.max(1);
        let workers = self.settings.workers.max(1);
        let worker = Arc::new(Worker {
            store: Arc::clone(&self.store),
            pages: Arc::clone(&self.pages),
            llm: Arc::clone(&self.llm),
            memo: FailedUrlMemo::default(),
            deny: DenyList::new(&self.settings.deny_list),
            stats: EnrichStats::new(self.settings.progress_every),
            min_text_chars: self.settings.min_text_chars,
            max_text_chars: self.settings.max_text_chars,
            request_delay: Duration::from_millis(self.settings.request_delay_ms),
        });
        let permits = Arc::new(Semaphore::new(workers));

        let mut offset = 0usize;
        let mut pages = 0usize;
        loop {
            if self.settings.max_pages.is_some_and(|max| pages >= max) {
                info!(pages, "enrichment page limit reached");
                break;
            }
            let batch = self.store.unenriched_page(offset, page_size).await?;
            if batch.is_empty() {
                break;
            }
            pages += 1;
            let page_len = batch.len();
            debug!(page = pages, offset, rows = page_len, "enrichment page");

            let mut tasks = JoinSet::new();
            for opp in batch {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let worker = Arc::clone(&worker);
                tasks.spawn(async move {
                    let _permit = permit;
                    worker.process(opp).await
                });
            }

            let mut successes = 0usize;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(EnrichOutcome::Success) => successes += 1,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "enrichment worker aborted");
                        worker
                            .stats
                            .record(
                                EnrichOutcome::ExtractionFailed,
                                Some(RunError {
                                    phase: RunPhase::Enrich,
                                    class: ErrorClass::ExtractionFailed,
                                    context: "worker".to_string(),
                                    message: err.to_string(),
                                }),
                            )
                            .await;
                    }
                }
            }

            offset += page_len - successes;
            if page_len < page_size {
                break;
            }
        }

        let (tally, errors) = worker.stats.drain().await;
        let memoized_urls = worker.memo.count().await;
        info!(
            pages,
            success = tally.success,
            fetch_failed = tally.fetch_failed,
            extraction_failed = tally.extraction_failed,
            db_failed = tally.db_failed,
            skipped = tally.skipped,
            memoized_urls,
            "enrichment finished"
        );
        Ok(EnrichReport {
            tally,
            errors,
            pages,
        })
    }
}
