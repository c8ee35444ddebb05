//! Daily pipeline: scrape, enrich, classify, match and notify, each run
//! recorded in a ledger.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ptm_adapters::{
    GeminiClient, HttpPageSource, KkjApiScraper, LlmClient, LlmListingScraper, MailTransport,
    PageSource, ResendMailer, ScraperRegistry, SourceScraper,
};
use ptm_core::{BusinessProfile, ErrorClass, Opportunity, RunLedgerEntry, RunPhase, Subscriber};
use ptm_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, PgStore, RecordStore, TokenBucketConfig,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod enrich;
pub mod ledger;
pub mod notify;

pub use batch::{assign_ranks, run_batches, BatchFailure, BatchRun, Classifier, Matcher, ScoredMatch};
pub use config::{PipelineConfig, SyncConfig};
pub use dispatch::{ScrapeReport, SourceDispatcher};
pub use enrich::{validate_detail, DenyList, EnrichReport, EnrichmentPool, FailedUrlMemo};
pub use ledger::RunLedger;
pub use notify::{render_digest, tier_cap, Digest, Notifier, NotifyReport, TierSnapshot};

pub const CRATE_NAME: &str = "ptm-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scrape,
    Enrich,
    Classify,
    Match,
    Notify,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Scrape,
        Phase::Enrich,
        Phase::Classify,
        Phase::Match,
        Phase::Notify,
    ];

    pub fn ledger_phase(self) -> RunPhase {
        match self {
            Phase::Scrape => RunPhase::Scrape,
            Phase::Enrich => RunPhase::Enrich,
            Phase::Classify => RunPhase::Classify,
            Phase::Match => RunPhase::Match,
            Phase::Notify => RunPhase::Notify,
        }
    }
}

/// The pipeline's external collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub scraper: Arc<dyn SourceScraper>,
    pub pages: Arc<dyn PageSource>,
    pub llm: Arc<dyn LlmClient>,
    pub mailer: Arc<dyn MailTransport>,
}

pub struct Pipeline {
    config: PipelineConfig,
    from_email: String,
    parts: Collaborators,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, from_email: impl Into<String>, parts: Collaborators) -> Self {
        Self {
            config,
            from_email: from_email.into(),
            parts,
        }
    }

    /// Production wiring: Postgres, Gemini, Resend and plain HTTP page fetching.
    pub async fn from_env(sync: &SyncConfig, config: PipelineConfig) -> Result<Self> {
        let database_url = sync.require_database_url()?;
        let api_key = sync.require_gemini_api_key()?;
        let http_timeout = Duration::from_secs(sync.http_timeout_secs);
        let workers = config.enrichment.workers.max(1);

        let store = PgStore::connect(database_url, http_timeout)
            .await
            .context("connecting to database")?;

        let page_http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: http_timeout,
            user_agent: Some(sync.user_agent.clone()),
            global_concurrency: workers.max(16),
            per_scope_concurrency: workers.max(4),
            backoff: BackoffPolicy::no_retry(),
            token_bucket: None,
        })?);
        let llm_http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(sync.llm_timeout_secs),
            user_agent: Some(sync.user_agent.clone()),
            global_concurrency: config.llm.concurrency.max(1),
            per_scope_concurrency: config.llm.concurrency.max(1),
            backoff: BackoffPolicy {
                max_retries: config.llm.max_retries,
                ..BackoffPolicy::default()
            },
            token_bucket: Some(TokenBucketConfig {
                capacity: config.llm.bucket_capacity,
                refill_every: Duration::from_millis(config.llm.refill_every_ms),
            }),
        })?);
        let mail_http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: http_timeout,
            user_agent: Some(sync.user_agent.clone()),
            ..HttpClientConfig::default()
        })?);

        let llm: Arc<dyn LlmClient> = Arc::new(GeminiClient::new(
            llm_http,
            sync.gemini_endpoint.as_str(),
            sync.gemini_model.as_str(),
            api_key,
        ));
        let pages: Arc<dyn PageSource> = Arc::new(HttpPageSource::new(Arc::clone(&page_http)));
        let scraper = ScraperRegistry::new(
            Arc::new(LlmListingScraper::new(Arc::clone(&pages), Arc::clone(&llm))),
            Arc::new(KkjApiScraper::new(page_http, config.scrape.api_window_days)),
        );
        let mailer = ResendMailer::new(mail_http, sync.resend_endpoint.as_str(), sync.resend_api_key.clone());
        if sync.resend_api_key.is_none() {
            warn!("RESEND_API_KEY is not set; digests will be logged as failed");
        }

        Ok(Self::new(
            config,
            sync.from_email.clone(),
            Collaborators {
                store: Arc::new(store),
                scraper: Arc::new(scraper),
                pages,
                llm,
                mailer: Arc::new(mailer),
            },
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.parts.store
    }

    pub async fn run_once(&self) -> Result<RunLedgerEntry> {
        self.run_phases(&Phase::ALL).await
    }

    /// Runs `phases` in order under one ledger. Per-item failures are recorded
    /// and the run goes on; a phase that cannot start ends the run `failed`.
    /// `Err` only when the ledger itself cannot be opened.
    pub async fn run_phases(&self, phases: &[Phase]) -> Result<RunLedgerEntry> {
        let mut ledger = RunLedger::open(
            Arc::clone(&self.parts.store),
            Utc::now(),
            self.config.ledger.max_error_entries,
        )
        .await
        .context("opening run ledger")?;
        let span = info_span!("run", run_id = %ledger.id());

        let entry = async move {
            let mut scraped: Option<ScrapeReport> = None;
            for &phase in phases {
                info!(?phase, "phase started");
                let result = match phase {
                    Phase::Scrape => self
                        .scrape_phase(&mut ledger)
                        .await
                        .map(|report| scraped = Some(report)),
                    Phase::Enrich => self.enrich_phase(&mut ledger).await,
                    Phase::Classify => self.classify_phase(&mut ledger).await,
                    Phase::Match => self.match_phase(&mut ledger, scraped.as_ref()).await,
                    Phase::Notify => self.notify_phase(&mut ledger).await,
                };
                if let Err(err) = result {
                    ledger.mark_fatal(phase.ledger_phase(), format!("{err:#}"));
                    break;
                }
            }
            ledger.close(Utc::now()).await
        }
        .instrument(span)
        .await;
        Ok(entry)
    }

    async fn scrape_phase(&self, ledger: &mut RunLedger) -> Result<ScrapeReport> {
        let store = &self.parts.store;
        let mut sources = store.active_sources().await.context("loading sources")?;
        if self.config.scrape.subscribed_areas_only {
            let subscribers = store.active_subscribers().await.context("loading subscribers")?;
            let areas: BTreeSet<String> = subscribers
                .iter()
                .flat_map(|s| s.area_ids.iter().cloned())
                .collect();
            sources = SourceDispatcher::select(sources, &areas);
            info!(areas = areas.len(), sources = sources.len(), "sources for subscribed areas");
        }

        let dispatcher = SourceDispatcher::new(
            Arc::clone(store),
            Arc::clone(&self.parts.scraper),
            self.config.scrape.source_timeout(),
        );
        let mut report = dispatcher.dispatch(&sources).await;

        let counters = ledger.counters_mut();
        counters.sources_scraped += report.sources_scraped;
        counters.sources_failed += report.sources_failed;
        counters.opportunities_saved += report.opportunities_saved;
        ledger.record_errors(std::mem::take(&mut report.errors));
        Ok(report)
    }

    async fn enrich_phase(&self, ledger: &mut RunLedger) -> Result<()> {
        let pool = EnrichmentPool::new(
            Arc::clone(&self.parts.store),
            Arc::clone(&self.parts.pages),
            Arc::clone(&self.parts.llm),
            self.config.enrichment.clone(),
        );
        let report = pool.run().await.context("reading enrichment backlog")?;

        let counters = ledger.counters_mut();
        counters.records_enriched += report.tally.success;
        counters.enrichment.absorb(&report.tally);
        ledger.record_errors(report.errors);
        Ok(())
    }

    async fn classify_phase(&self, ledger: &mut RunLedger) -> Result<()> {
        let settings = &self.config.classification;
        let store = &self.parts.store;
        let records = store
            .unclassified(settings.limit)
            .await
            .context("loading unclassified opportunities")?;
        if records.is_empty() {
            info!("nothing to classify");
            return Ok(());
        }

        let classifier = Classifier::new(
            Arc::clone(&self.parts.llm),
            settings.batch_size,
            Duration::from_millis(settings.delay_ms),
        );
        let run = classifier.classify(&records).await;
        for failure in run.failures {
            ledger.error(
                RunPhase::Classify,
                ErrorClass::ExtractionFailed,
                format!("batch={} size={}", failure.batch_index, failure.size),
                failure.message,
            );
        }
        for (id, category) in run.results {
            match store.set_industry_category(id, category).await {
                Ok(()) => ledger.counters_mut().records_classified += 1,
                Err(err) => ledger.error(
                    RunPhase::Classify,
                    ErrorClass::DbFailed,
                    format!("opportunity={id}"),
                    err,
                ),
            }
        }
        info!(
            requested = records.len(),
            classified = ledger.counters().records_classified,
            batches = run.batches_issued,
            "classification finished"
        );
        Ok(())
    }

    /// With a scrape report in hand, each subscriber is scored against what this
    /// run saved in their areas; otherwise against the recent window.
    async fn match_phase(&self, ledger: &mut RunLedger, scraped: Option<&ScrapeReport>) -> Result<()> {
        let settings = &self.config.matching;
        let store = &self.parts.store;
        let subscribers = store.active_subscribers().await.context("loading subscribers")?;
        let matcher = Matcher::new(
            Arc::clone(&self.parts.llm),
            settings.batch_size,
            Duration::from_millis(settings.delay_ms),
        );
        let now = Utc::now();

        for sub in subscribers.iter().filter(|s| !s.initial_screening_done) {
            self.screen_subscriber(&matcher, sub, ledger)
                .instrument(info_span!("screening", subscriber_id = %sub.id))
                .await;
        }

        for sub in &subscribers {
            let Some(profile) = sub.profile.as_ref() else {
                debug!(subscriber_id = %sub.id, "no business profile; not matched");
                continue;
            };
            let candidates = match scraped {
                Some(report) => report.opportunities_for(&sub.area_ids),
                None => {
                    let since = now - chrono::Duration::hours(settings.recent_window_hours);
                    match store
                        .recent_opportunities_for_areas(&sub.area_ids, since, settings.screening_limit)
                        .await
                    {
                        Ok(recent) => recent,
                        Err(err) => {
                            ledger.error(
                                RunPhase::Match,
                                ErrorClass::DbFailed,
                                format!("subscriber={}", sub.id),
                                err,
                            );
                            continue;
                        }
                    }
                }
            };
            if candidates.is_empty() {
                continue;
            }
            self.score_and_save(&matcher, sub, profile, &candidates, RunPhase::Match, ledger)
                .instrument(info_span!("match", subscriber_id = %sub.id, candidates = candidates.len()))
                .await;
        }
        Ok(())
    }

    /// First-time subscribers get scored against the last window of their
    /// areas. Without a profile they stay unscreened for a later run.
    async fn screen_subscriber(&self, matcher: &Matcher, sub: &Subscriber, ledger: &mut RunLedger) {
        let Some(profile) = sub.profile.as_ref() else {
            debug!(subscriber_id = %sub.id, "screening deferred until a profile exists");
            return;
        };
        let settings = &self.config.matching;
        let store = &self.parts.store;
        let now = Utc::now();

        if !sub.area_ids.is_empty() {
            let since = now - chrono::Duration::days(settings.screening_window_days);
            match store
                .recent_opportunities_for_areas(&sub.area_ids, since, settings.screening_limit)
                .await
            {
                Ok(recent) if !recent.is_empty() => {
                    info!(subscriber_id = %sub.id, candidates = recent.len(), "initial screening");
                    self.score_and_save(matcher, sub, profile, &recent, RunPhase::Screening, ledger)
                        .await;
                }
                Ok(_) => {}
                Err(err) => {
                    ledger.error(
                        RunPhase::Screening,
                        ErrorClass::DbFailed,
                        format!("subscriber={}", sub.id),
                        err,
                    );
                    return;
                }
            }
        }

        if let Err(err) = store.mark_screening_done(sub.id, now).await {
            ledger.error(
                RunPhase::Screening,
                ErrorClass::DbFailed,
                format!("subscriber={}", sub.id),
                err,
            );
        }
    }

    async fn score_and_save(
        &self,
        matcher: &Matcher,
        sub: &Subscriber,
        profile: &BusinessProfile,
        candidates: &[Opportunity],
        phase: RunPhase,
        ledger: &mut RunLedger,
    ) {
        let (ranked, failures) = matcher.score(profile, candidates).await;
        for failure in failures {
            ledger.error(
                phase,
                ErrorClass::ExtractionFailed,
                format!(
                    "subscriber={} batch={} size={}",
                    sub.id, failure.batch_index, failure.size
                ),
                failure.message,
            );
        }

        let mut saved = 0u64;
        for (rank, scored) in ranked {
            let upsert = scored.into_upsert(sub.id, rank);
            match self.parts.store.upsert_match_by_key(&upsert).await {
                Ok(()) => saved += 1,
                Err(err) => ledger.error(
                    phase,
                    ErrorClass::DbFailed,
                    format!("subscriber={} opportunity={}", sub.id, upsert.opportunity_id),
                    err,
                ),
            }
        }
        ledger.counters_mut().matches_created += saved;
        info!(subscriber_id = %sub.id, saved, "matches saved");
    }

    async fn notify_phase(&self, ledger: &mut RunLedger) -> Result<()> {
        let subscribers = self
            .parts
            .store
            .active_subscribers()
            .await
            .context("loading subscribers")?;
        let snapshot = TierSnapshot::resolve(
            &subscribers,
            Utc::now(),
            self.config.notification.trial_days,
        );
        let notifier = Notifier::new(
            Arc::clone(&self.parts.store),
            Arc::clone(&self.parts.llm),
            Arc::clone(&self.parts.mailer),
            self.config.notification.clone(),
            self.from_email.clone(),
        );
        let report = notifier.notify_all(&subscribers, &snapshot).await;
        ledger.counters_mut().notifications_sent += report.sent;
        ledger.record_errors(report.errors);
        Ok(())
    }
}

/// The full pipeline on `sync.sync_cron`, or `None` when scheduling is off.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Pipeline>,
    sync: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !sync.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = sync.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(entry) => info!(
                    run_id = %entry.id,
                    status = entry.status.as_str(),
                    "scheduled run finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run could not start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
