//! Core domain model for the public tender matching pipeline.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ptm-core";

/// Namespace for deterministic opportunity identities.
const OPPORTUNITY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a77_94d3_4b0e_9a51_3c8e_d2f4_a901);

/// Natural key of an opportunity. The store keeps exactly one row per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpportunityKey {
    pub source_id: String,
    pub title: String,
}

impl OpportunityKey {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
        }
    }

    /// Identity assigned on first persistence; the same key always maps to the same id.
    pub fn stable_id(&self) -> Uuid {
        let name = format!("{}\u{1f}{}", self.source_id, self.title);
        Uuid::new_v5(&OPPORTUNITY_NAMESPACE, name.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    High,
    Medium,
    Low,
}

impl Difficulty {
    /// Accepts the English slugs and the single-kanji ratings the extraction schema allows.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "high" | "High" | "高" => Some(Self::High),
            "medium" | "Medium" | "中" => Some(Self::Medium),
            "low" | "Low" | "低" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndustryCategory {
    ItDx,
    Construction,
    Consulting,
    Creative,
    Equipment,
    FacilityManagement,
    Healthcare,
    Education,
    Environment,
    Other,
}

impl IndustryCategory {
    pub const ALL: [IndustryCategory; 10] = [
        Self::ItDx,
        Self::Construction,
        Self::Consulting,
        Self::Creative,
        Self::Equipment,
        Self::FacilityManagement,
        Self::Healthcare,
        Self::Education,
        Self::Environment,
        Self::Other,
    ];

    /// Display label, also the value the classification collaborator answers with.
    pub fn label(self) -> &'static str {
        match self {
            Self::ItDx => "IT・DX",
            Self::Construction => "建設・土木",
            Self::Consulting => "コンサル・調査",
            Self::Creative => "広告・クリエイティブ",
            Self::Equipment => "設備・物品",
            Self::FacilityManagement => "清掃・管理",
            Self::Healthcare => "医療・福祉",
            Self::Education => "教育・研修",
            Self::Environment => "環境・エネルギー",
            Self::Other => "その他",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ItDx => "it_dx",
            Self::Construction => "construction",
            Self::Consulting => "consulting",
            Self::Creative => "creative",
            Self::Equipment => "equipment",
            Self::FacilityManagement => "facility_management",
            Self::Healthcare => "healthcare",
            Self::Education => "education",
            Self::Environment => "environment",
            Self::Other => "other",
        }
    }

    /// Matches either the label or the slug.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.label() == value || c.as_str() == value)
    }

    /// Anything outside the fixed set lands in `Other`.
    pub fn parse_or_other(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::Other)
    }
}

/// Listing-level record produced by a scrape strategy, before persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    pub area_id: String,
    pub source_id: String,
    pub title: String,
    pub organization: Option<String>,
    pub category: Option<String>,
    pub method: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub budget: Option<String>,
    pub summary: Option<String>,
    pub requirements: Option<String>,
    pub detail_url: Option<String>,
}

impl OpportunityDraft {
    pub fn key(&self) -> OpportunityKey {
        OpportunityKey::new(self.source_id.clone(), self.title.clone())
    }
}

/// Persisted procurement announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub area_id: String,
    pub source_id: String,
    pub title: String,
    pub organization: Option<String>,
    pub category: Option<String>,
    pub method: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub budget: Option<String>,
    pub summary: Option<String>,
    pub requirements: Option<String>,
    pub detail_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
    /// `None` means the detail page has not been enriched yet.
    pub detail_fetched_at: Option<DateTime<Utc>>,
    pub published_date: Option<NaiveDate>,
    pub bid_opening_date: Option<NaiveDate>,
    pub briefing_date: Option<NaiveDate>,
    pub contract_period: Option<String>,
    pub contact_info: Option<String>,
    pub detailed_summary: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub industry_category: Option<IndustryCategory>,
}

impl Opportunity {
    pub fn key(&self) -> OpportunityKey {
        OpportunityKey::new(self.source_id.clone(), self.title.clone())
    }

    pub fn from_draft(draft: &OpportunityDraft, scraped_at: DateTime<Utc>) -> Self {
        Self {
            id: draft.key().stable_id(),
            area_id: draft.area_id.clone(),
            source_id: draft.source_id.clone(),
            title: draft.title.clone(),
            organization: draft.organization.clone(),
            category: draft.category.clone(),
            method: draft.method.clone(),
            deadline: draft.deadline,
            budget: draft.budget.clone(),
            summary: draft.summary.clone(),
            requirements: draft.requirements.clone(),
            detail_url: draft.detail_url.clone(),
            scraped_at,
            detail_fetched_at: None,
            published_date: None,
            bid_opening_date: None,
            briefing_date: None,
            contract_period: None,
            contact_info: None,
            detailed_summary: None,
            difficulty: None,
            industry_category: None,
        }
    }

    /// Merge a repeat sighting: non-null listing fields refresh, enrichment is kept.
    pub fn merge_draft(&mut self, draft: &OpportunityDraft) {
        fn refresh<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if incoming.is_some() {
                slot.clone_from(incoming);
            }
        }
        self.area_id.clone_from(&draft.area_id);
        refresh(&mut self.organization, &draft.organization);
        refresh(&mut self.category, &draft.category);
        refresh(&mut self.method, &draft.method);
        refresh(&mut self.deadline, &draft.deadline);
        refresh(&mut self.budget, &draft.budget);
        refresh(&mut self.summary, &draft.summary);
        refresh(&mut self.requirements, &draft.requirements);
        refresh(&mut self.detail_url, &draft.detail_url);
    }

    pub fn apply_enrichment(&mut self, patch: &EnrichmentPatch, at: DateTime<Utc>) {
        fn overwrite<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if incoming.is_some() {
                slot.clone_from(incoming);
            }
        }
        overwrite(&mut self.published_date, &patch.published_date);
        overwrite(&mut self.deadline, &patch.deadline);
        overwrite(&mut self.bid_opening_date, &patch.bid_opening_date);
        overwrite(&mut self.briefing_date, &patch.briefing_date);
        overwrite(&mut self.budget, &patch.budget);
        overwrite(&mut self.requirements, &patch.requirements);
        overwrite(&mut self.contract_period, &patch.contract_period);
        overwrite(&mut self.contact_info, &patch.contact_info);
        overwrite(&mut self.detailed_summary, &patch.detailed_summary);
        overwrite(&mut self.difficulty, &patch.difficulty);
        self.detail_fetched_at = Some(at);
    }
}

/// Validated detail-page fields. Only `Some` values overwrite stored columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentPatch {
    pub published_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub bid_opening_date: Option<NaiveDate>,
    pub briefing_date: Option<NaiveDate>,
    pub budget: Option<String>,
    pub requirements: Option<String>,
    pub contract_period: Option<String>,
    pub contact_info: Option<String>,
    pub detailed_summary: Option<String>,
    pub difficulty: Option<Difficulty>,
}

/// A configured scrape target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub area_id: String,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Selects an alternate structured-API strategy, e.g. `api:kkj`.
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Trial,
    Inactive,
}

impl AccountStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "trial" => Self::Trial,
            _ => Self::Inactive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trial => "trial",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Paid,
    Free,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub company_name: Option<String>,
    #[serde(default)]
    pub business_areas: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub qualifications: Vec<String>,
    #[serde(default)]
    pub matching_keywords: Vec<String>,
    #[serde(default)]
    pub industry_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub status: AccountStatus,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub notification_email: Option<String>,
    pub email_notify: bool,
    pub match_threshold: Option<u8>,
    pub initial_screening_done: bool,
    pub area_ids: Vec<String>,
    pub profile: Option<BusinessProfile>,
}

impl Subscriber {
    /// Paid when the account is active, or when a trial window contains `now`.
    /// The expiry is `trial_ends_at`, falling back to start + `trial_days`.
    pub fn tier_at(&self, now: DateTime<Utc>, trial_days: i64) -> Tier {
        match self.status {
            AccountStatus::Active => Tier::Paid,
            AccountStatus::Trial => {
                let expiry = self.trial_ends_at.or_else(|| {
                    self.trial_started_at
                        .map(|start| start + Duration::days(trial_days))
                });
                let started = self.trial_started_at.map_or(true, |start| start <= now);
                match expiry {
                    Some(expiry) if started && now < expiry => Tier::Paid,
                    _ => Tier::Free,
                }
            }
            AccountStatus::Inactive => Tier::Free,
        }
    }
}

/// Cached per-subscriber, per-opportunity analysis attached to a match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub match_points: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Scoring fields written by the matching phase, keyed by (subscriber, opportunity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchUpsert {
    pub subscriber_id: Uuid,
    pub opportunity_id: Uuid,
    pub score: u8,
    pub reason: Option<String>,
    pub risk_notes: Option<String>,
    pub recommendation: Option<String>,
    pub action_items: Vec<String>,
    pub rank_position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub subscriber_id: Uuid,
    pub opportunity_id: Uuid,
    pub score: u8,
    pub reason: Option<String>,
    pub risk_notes: Option<String>,
    pub recommendation: Option<String>,
    pub action_items: Vec<String>,
    pub rank_position: Option<u32>,
    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub detailed_analysis: Option<MatchAnalysis>,
    pub analysis_completed_at: Option<DateTime<Utc>>,
}

impl MatchRecord {
    pub fn empty(subscriber_id: Uuid, opportunity_id: Uuid) -> Self {
        Self {
            subscriber_id,
            opportunity_id,
            score: 0,
            reason: None,
            risk_notes: None,
            recommendation: None,
            action_items: Vec::new(),
            rank_position: None,
            notified: false,
            notified_at: None,
            detailed_analysis: None,
            analysis_completed_at: None,
        }
    }

    /// Merge-on-conflict: scoring fields are replaced, notification state and cached analysis survive.
    pub fn merge_scores(&mut self, upsert: &MatchUpsert) {
        self.score = upsert.score;
        self.reason.clone_from(&upsert.reason);
        self.risk_notes.clone_from(&upsert.risk_notes);
        self.recommendation.clone_from(&upsert.recommendation);
        self.action_items.clone_from(&upsert.action_items);
        self.rank_position = Some(upsert.rank_position);
    }
}

/// An unnotified match joined with its opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMatch {
    pub record: MatchRecord,
    pub opportunity: Opportunity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Sent,
    Failed,
    Skipped,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub subscriber_id: Uuid,
    pub channel: String,
    pub status: NotificationStatus,
    pub opportunities_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    /// Terminal status for a run that stopped (fatally or not) with `errors` recorded.
    pub fn settle(fatal: bool, errors: u64) -> Self {
        if fatal {
            Self::Failed
        } else if errors == 0 {
            Self::Completed
        } else {
            Self::CompletedWithErrors
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Run,
    Scrape,
    Enrich,
    Classify,
    Screening,
    Match,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    FetchFailed,
    ExtractionFailed,
    DbFailed,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub phase: RunPhase,
    pub class: ErrorClass,
    pub context: String,
    pub message: String,
}

/// Per-record enrichment outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichOutcome {
    Success,
    FetchFailed,
    ExtractionFailed,
    DbFailed,
    Skipped,
}

impl EnrichOutcome {
    /// The ledger error class for failed outcomes.
    pub fn error_class(self) -> Option<ErrorClass> {
        match self {
            Self::FetchFailed => Some(ErrorClass::FetchFailed),
            Self::ExtractionFailed => Some(ErrorClass::ExtractionFailed),
            Self::DbFailed => Some(ErrorClass::DbFailed),
            Self::Success | Self::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentTally {
    pub success: u64,
    pub fetch_failed: u64,
    pub extraction_failed: u64,
    pub db_failed: u64,
    pub skipped: u64,
}

impl EnrichmentTally {
    pub fn bump(&mut self, outcome: EnrichOutcome) {
        let slot = match outcome {
            EnrichOutcome::Success => &mut self.success,
            EnrichOutcome::FetchFailed => &mut self.fetch_failed,
            EnrichOutcome::ExtractionFailed => &mut self.extraction_failed,
            EnrichOutcome::DbFailed => &mut self.db_failed,
            EnrichOutcome::Skipped => &mut self.skipped,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u64 {
        self.success + self.fetch_failed + self.extraction_failed + self.db_failed + self.skipped
    }

    pub fn absorb(&mut self, other: &EnrichmentTally) {
        self.success += other.success;
        self.fetch_failed += other.fetch_failed;
        self.extraction_failed += other.extraction_failed;
        self.db_failed += other.db_failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub sources_scraped: u64,
    pub sources_failed: u64,
    pub opportunities_saved: u64,
    pub records_enriched: u64,
    pub records_classified: u64,
    pub matches_created: u64,
    pub notifications_sent: u64,
    pub errors_count: u64,
    #[serde(default)]
    pub enrichment: EnrichmentTally,
}

/// Summary of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedgerEntry {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub errors: Vec<RunError>,
}

/// Accepts only the exact `YYYY-MM-DD` shape. `2024/01/01`, `2024-1-1` and
/// trailing text are rejected.
pub fn parse_strict_date(value: &str) -> Option<NaiveDate> {
    let bytes = value.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

/// Hard-truncate to `max` characters.
pub fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Truncate to `max` characters, marking the cut with `...`.
pub fn truncate_with_ellipsis(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = value.chars().take(keep).collect();
    out.push_str("...");
    out
}
