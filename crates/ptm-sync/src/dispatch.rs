use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ptm_adapters::SourceScraper;
use ptm_core::{DataSource, ErrorClass, Opportunity, RunError, RunPhase};
use ptm_storage::RecordStore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// What one scrape pass produced: the opportunities it saved, grouped by area,
/// plus source health counts and per-source errors.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub by_area: BTreeMap<String, Vec<Opportunity>>,
    pub sources_scraped: u64,
    pub sources_failed: u64,
    pub opportunities_saved: u64,
    pub errors: Vec<RunError>,
}

impl ScrapeReport {
    pub fn opportunities_for(&self, area_ids: &[String]) -> Vec<Opportunity> {
        area_ids
            .iter()
            .filter_map(|area| self.by_area.get(area))
            .flatten()
            .cloned()
            .collect()
    }
}

/// Routes each source through its scrape strategy. One source failing never
/// affects its siblings.
pub struct SourceDispatcher {
    store: Arc<dyn RecordStore>,
    scraper: Arc<dyn SourceScraper>,
    source_timeout: Duration,
}

impl SourceDispatcher {
    pub fn new(store: Arc<dyn RecordStore>, scraper: Arc<dyn SourceScraper>, source_timeout: Duration) -> Self {
        Self {
            store,
            scraper,
            source_timeout,
        }
    }

    /// Restricts `sources` to the given areas.
    pub fn select(sources: Vec<DataSource>, areas: &BTreeSet<String>) -> Vec<DataSource> {
        sources
            .into_iter()
            .filter(|s| s.active && areas.contains(&s.area_id))
            .collect()
    }

    pub async fn dispatch(&self, sources: &[DataSource]) -> ScrapeReport {
        let mut report = ScrapeReport::default();
        let mut seen: HashSet<Uuid> = HashSet::new();

        let mut by_area: BTreeMap<&str, Vec<&DataSource>> = BTreeMap::new();
        for source in sources {
            by_area.entry(source.area_id.as_str()).or_default().push(source);
        }

        for (area, area_sources) in by_area {
            let span = info_span!("area", area_id = %area, sources = area_sources.len());
            async {
                for source in area_sources {
                    self.scrape_one(source, &mut report, &mut seen).await;
                }
            }
            .instrument(span)
            .await;
        }

        info!(
            sources_scraped = report.sources_scraped,
            sources_failed = report.sources_failed,
            opportunities_saved = report.opportunities_saved,
            "scrape pass finished"
        );
        report
    }

    async fn scrape_one(&self, source: &DataSource, report: &mut ScrapeReport, seen: &mut HashSet<Uuid>) {
        let context = format!("source={}", source.id);
        let outcome = tokio::time::timeout(self.source_timeout, self.scraper.scrape(source)).await;
        let failure = match outcome {
            Ok(Ok(drafts)) => {
                report.sources_scraped += 1;
                self.note_attempt(source, true, report).await;
                let found = drafts.len();
                for draft in drafts.iter().filter(|d| !d.title.trim().is_empty()) {
                    match self.store.upsert_opportunity_by_key(draft, Utc::now()).await {
                        Ok(opp) => {
                            if seen.insert(opp.id) {
                                report.opportunities_saved += 1;
                                report.by_area.entry(opp.area_id.clone()).or_default().push(opp);
                            }
                        }
                        Err(err) => report.errors.push(RunError {
                            phase: RunPhase::Scrape,
                            class: ErrorClass::DbFailed,
                            context: format!("{context} title={}", draft.title),
                            message: err.to_string(),
                        }),
                    }
                }
                info!(source_id = %source.id, found, "source scraped");
                return;
            }
            Ok(Err(err)) => {
                let class = if err.is_fetch() {
                    ErrorClass::FetchFailed
                } else {
                    ErrorClass::ExtractionFailed
                };
                (class, err.to_string())
            }
            Err(_) => (
                ErrorClass::FetchFailed,
                format!("no result within {}s", self.source_timeout.as_secs()),
            ),
        };

        let (class, message) = failure;
        warn!(source_id = %source.id, ?class, %message, "source failed");
        report.sources_failed += 1;
        self.note_attempt(source, false, report).await;
        report.errors.push(RunError {
            phase: RunPhase::Scrape,
            class,
            context,
            message,
        });
    }

    async fn note_attempt(&self, source: &DataSource, success: bool, report: &mut ScrapeReport) {
        if let Err(err) = self.store.record_source_attempt(&source.id, success, Utc::now()).await {
            report.errors.push(RunError {
                phase: RunPhase::Scrape,
                class: ErrorClass::DbFailed,
                context: format!("source={} health", source.id),
                message: err.to_string(),
            });
        }
    }
}
