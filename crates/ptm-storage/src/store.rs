use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ptm_core::{
    DataSource, EnrichmentPatch, IndustryCategory, MatchAnalysis, MatchUpsert, NotificationLog,
    Opportunity, OpportunityDraft, PendingMatch, RunLedgerEntry, Subscriber,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store operation `{operation}` timed out")]
    Timeout { operation: &'static str },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("malformed row in {table}: {detail}")]
    Decode { table: &'static str, detail: String },
}

/// Persistence contract of the pipeline. Both upserts merge on their natural
/// key instead of failing on conflict, so backends are swappable without
/// touching pipeline logic.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<Uuid, StoreError>;

    async fn finish_run(&self, entry: &RunLedgerEntry) -> Result<(), StoreError>;

    async fn active_sources(&self) -> Result<Vec<DataSource>, StoreError>;

    /// Success resets the consecutive-failure counter; failure increments it.
    async fn record_source_attempt(
        &self,
        source_id: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Keyed by (source_id, title). A repeat submission updates the existing row.
    async fn upsert_opportunity_by_key(
        &self,
        draft: &OpportunityDraft,
        at: DateTime<Utc>,
    ) -> Result<Opportunity, StoreError>;

    /// Rows still awaiting enrichment, newest first. Rows leave the backlog
    /// once `detail_fetched_at` is set.
    async fn unenriched_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError>;

    async fn apply_enrichment(
        &self,
        opportunity_id: Uuid,
        patch: &EnrichmentPatch,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn unclassified(&self, limit: usize) -> Result<Vec<Opportunity>, StoreError>;

    async fn set_industry_category(
        &self,
        opportunity_id: Uuid,
        category: IndustryCategory,
    ) -> Result<(), StoreError>;

    async fn recent_opportunities_for_areas(
        &self,
        area_ids: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError>;

    async fn active_subscribers(&self) -> Result<Vec<Subscriber>, StoreError>;

    async fn mark_screening_done(
        &self,
        subscriber_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Keyed by (subscriber, opportunity). Notification state and cached
    /// analysis survive a re-score.
    async fn upsert_match_by_key(&self, upsert: &MatchUpsert) -> Result<(), StoreError>;

    /// `notified = false` and `score >= threshold`, highest score first.
    async fn unnotified_matches(
        &self,
        subscriber_id: Uuid,
        threshold: u8,
    ) -> Result<Vec<PendingMatch>, StoreError>;

    async fn cached_analysis(
        &self,
        subscriber_id: Uuid,
        opportunity_id: Uuid,
    ) -> Result<Option<MatchAnalysis>, StoreError>;

    /// Keyed by (subscriber, opportunity); creates the match row if missing.
    async fn save_analysis_by_key(
        &self,
        subscriber_id: Uuid,
        opportunity_id: Uuid,
        analysis: &MatchAnalysis,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_notified(
        &self,
        subscriber_id: Uuid,
        opportunity_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn log_notification(&self, entry: &NotificationLog) -> Result<(), StoreError>;
}
