use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ptm_core::{
    AccountStatus, BusinessProfile, DataSource, Difficulty, EnrichmentPatch, IndustryCategory,
    MatchAnalysis, MatchRecord, MatchUpsert, NotificationLog, Opportunity, OpportunityDraft,
    PendingMatch, RunLedgerEntry, Subscriber,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{RecordStore, StoreError};

const OPPORTUNITY_COLUMNS: &str = "o.id, o.area_id, o.source_id, o.title, o.organization, \
    o.category, o.method, o.deadline, o.budget, o.summary, o.requirements, o.detail_url, \
    o.scraped_at, o.detail_fetched_at, o.published_date, o.bid_opening_date, o.briefing_date, \
    o.contract_period, o.contact_info, o.detailed_summary, o.difficulty, o.industry_category";

/// Postgres-backed record store. Every operation is bounded by `op_timeout`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgStore {
    pub async fn connect(database_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(op_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool, op_timeout })
    }

    pub fn from_pool(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.op_timeout.as_millis() as u64, "store operation timed out");
                Err(StoreError::Timeout { operation })
            }
        }
    }
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, StoreError> {
    let difficulty: Option<String> = row.try_get("difficulty")?;
    let industry: Option<String> = row.try_get("industry_category")?;
    Ok(Opportunity {
        id: row.try_get("id")?,
        area_id: row.try_get("area_id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        organization: row.try_get("organization")?,
        category: row.try_get("category")?,
        method: row.try_get("method")?,
        deadline: row.try_get::<Option<NaiveDate>, _>("deadline")?,
        budget: row.try_get("budget")?,
        summary: row.try_get("summary")?,
        requirements: row.try_get("requirements")?,
        detail_url: row.try_get("detail_url")?,
        scraped_at: row.try_get("scraped_at")?,
        detail_fetched_at: row.try_get("detail_fetched_at")?,
        published_date: row.try_get("published_date")?,
        bid_opening_date: row.try_get("bid_opening_date")?,
        briefing_date: row.try_get("briefing_date")?,
        contract_period: row.try_get("contract_period")?,
        contact_info: row.try_get("contact_info")?,
        detailed_summary: row.try_get("detailed_summary")?,
        difficulty: difficulty.as_deref().and_then(Difficulty::parse),
        industry_category: industry.as_deref().and_then(IndustryCategory::parse),
    })
}

fn match_from_row(row: &PgRow) -> Result<MatchRecord, StoreError> {
    let score: i16 = row.try_get("match_score")?;
    let rank: Option<i32> = row.try_get("rank_position")?;
    let action_items: Option<Json<Vec<String>>> = row.try_get("action_items")?;
    let analysis: Option<Json<MatchAnalysis>> = row.try_get("detailed_analysis")?;
    Ok(MatchRecord {
        subscriber_id: row.try_get("subscriber_id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        score: score.clamp(0, 100) as u8,
        reason: row.try_get("match_reason")?,
        risk_notes: row.try_get("risk_notes")?,
        recommendation: row.try_get("recommendation")?,
        action_items: action_items.map(|j| j.0).unwrap_or_default(),
        rank_position: rank.and_then(|r| u32::try_from(r).ok()),
        notified: row.try_get("notified")?,
        notified_at: row.try_get("notified_at")?,
        detailed_analysis: analysis.map(|j| j.0),
        analysis_completed_at: row.try_get("analysis_completed_at")?,
    })
}

fn source_from_row(row: &PgRow) -> Result<DataSource, StoreError> {
    let failures: i32 = row.try_get("consecutive_failures")?;
    Ok(DataSource {
        id: row.try_get("id")?,
        area_id: row.try_get("area_id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        active: row.try_get("active")?,
        consecutive_failures: u32::try_from(failures).unwrap_or(0),
        last_checked_at: row.try_get("last_checked_at")?,
        last_success_at: row.try_get("last_success_at")?,
        notes: row.try_get("notes")?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl RecordStore for PgStore {
    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.timed("create_run", async {
            sqlx::query("INSERT INTO batch_logs (id, started_at, status) VALUES ($1, $2, 'running')")
                .bind(id)
                .bind(started_at)
                .execute(&self.pool)
                .await?;
            Ok(id)
        })
        .await
    }

    async fn finish_run(&self, entry: &RunLedgerEntry) -> Result<(), StoreError> {
        self.timed("finish_run", async {
            let c = &entry.counters;
            let result = sqlx::query(
                r#"
                UPDATE batch_logs
                   SET finished_at = $2, status = $3,
                       sources_scraped = $4, sources_failed = $5, opportunities_saved = $6,
                       records_enriched = $7, records_classified = $8, matches_created = $9,
                       notifications_sent = $10, errors_count = $11, errors = $12,
                       enrichment = $13
                 WHERE id = $1
                "#,
            )
            .bind(entry.id)
            .bind(entry.finished_at)
            .bind(entry.status.as_str())
            .bind(to_i64(c.sources_scraped))
            .bind(to_i64(c.sources_failed))
            .bind(to_i64(c.opportunities_saved))
            .bind(to_i64(c.records_enriched))
            .bind(to_i64(c.records_classified))
            .bind(to_i64(c.matches_created))
            .bind(to_i64(c.notifications_sent))
            .bind(to_i64(c.errors_count))
            .bind(Json(&entry.errors))
            .bind(Json(&c.enrichment))
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    entity: "batch_log",
                    id: entry.id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn active_sources(&self) -> Result<Vec<DataSource>, StoreError> {
        self.timed("active_sources", async {
            let rows = sqlx::query(
                r#"
                SELECT id, area_id, name, url, active, consecutive_failures,
                       last_checked_at, last_success_at, notes
                  FROM area_sources
                 WHERE active
                 ORDER BY area_id, id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(source_from_row).collect()
        })
        .await
    }

    async fn record_source_attempt(
        &self,
        source_id: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed("record_source_attempt", async {
            let sql = if success {
                "UPDATE area_sources SET last_checked_at = $2, last_success_at = $2, \
                 consecutive_failures = 0 WHERE id = $1"
            } else {
                "UPDATE area_sources SET last_checked_at = $2, \
                 consecutive_failures = consecutive_failures + 1 WHERE id = $1"
            };
            let result = sqlx::query(sql)
                .bind(source_id)
                .bind(at)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    entity: "area_source",
                    id: source_id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn upsert_opportunity_by_key(
        &self,
        draft: &OpportunityDraft,
        at: DateTime<Utc>,
    ) -> Result<Opportunity, StoreError> {
        self.timed("upsert_opportunity_by_key", async {
            let sql = format!(
                r#"
                INSERT INTO opportunities AS o
                    (id, area_id, source_id, title, organization, category, method, deadline,
                     budget, summary, requirements, detail_url, scraped_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (source_id, title) DO UPDATE SET
                    area_id = EXCLUDED.area_id,
                    organization = COALESCE(EXCLUDED.organization, o.organization),
                    category = COALESCE(EXCLUDED.category, o.category),
                    method = COALESCE(EXCLUDED.method, o.method),
                    deadline = COALESCE(EXCLUDED.deadline, o.deadline),
                    budget = COALESCE(EXCLUDED.budget, o.budget),
                    summary = COALESCE(EXCLUDED.summary, o.summary),
                    requirements = COALESCE(EXCLUDED.requirements, o.requirements),
                    detail_url = COALESCE(EXCLUDED.detail_url, o.detail_url)
                RETURNING {OPPORTUNITY_COLUMNS}
                "#
            );
            let row = sqlx::query(&sql)
                .bind(draft.key().stable_id())
                .bind(&draft.area_id)
                .bind(&draft.source_id)
                .bind(&draft.title)
                .bind(&draft.organization)
                .bind(&draft.category)
                .bind(&draft.method)
                .bind(draft.deadline)
                .bind(&draft.budget)
                .bind(&draft.summary)
                .bind(&draft.requirements)
                .bind(&draft.detail_url)
                .bind(at)
                .fetch_one(&self.pool)
                .await?;
            opportunity_from_row(&row)
        })
        .await
    }

    async fn unenriched_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        self.timed("unenriched_page", async {
            let sql = format!(
                "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities o \
                 WHERE o.detail_fetched_at IS NULL AND o.detail_url IS NOT NULL \
                 ORDER BY o.scraped_at DESC, o.id OFFSET $1 LIMIT $2"
            );
            let rows = sqlx::query(&sql)
                .bind(offset as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(opportunity_from_row).collect()
        })
        .await
    }

    async fn apply_enrichment(
        &self,
        opportunity_id: Uuid,
        patch: &EnrichmentPatch,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed("apply_enrichment", async {
            let result = sqlx::query(
                r#"
                UPDATE opportunities SET
                    published_date = COALESCE($2, published_date),
                    deadline = COALESCE($3, deadline),
                    bid_opening_date = COALESCE($4, bid_opening_date),
                    briefing_date = COALESCE($5, briefing_date),
                    budget = COALESCE($6, budget),
                    requirements = COALESCE($7, requirements),
                    contract_period = COALESCE($8, contract_period),
                    contact_info = COALESCE($9, contact_info),
                    detailed_summary = COALESCE($10, detailed_summary),
                    difficulty = COALESCE($11, difficulty),
                    detail_fetched_at = $12
                 WHERE id = $1
                "#,
            )
            .bind(opportunity_id)
            .bind(patch.published_date)
            .bind(patch.deadline)
            .bind(patch.bid_opening_date)
            .bind(patch.briefing_date)
            .bind(&patch.budget)
            .bind(&patch.requirements)
            .bind(&patch.contract_period)
            .bind(&patch.contact_info)
            .bind(&patch.detailed_summary)
            .bind(patch.difficulty.map(Difficulty::as_str))
            .bind(at)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    entity: "opportunity",
                    id: opportunity_id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn unclassified(&self, limit: usize) -> Result<Vec<Opportunity>, StoreError> {
        self.timed("unclassified", async {
            let sql = format!(
                "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities o \
                 WHERE o.industry_category IS NULL \
                 ORDER BY o.scraped_at DESC, o.id LIMIT $1"
            );
            let rows = sqlx::query(&sql)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(opportunity_from_row).collect()
        })
        .await
    }

    async fn set_industry_category(
        &self,
        opportunity_id: Uuid,
        category: IndustryCategory,
    ) -> Result<(), StoreError> {
        self.timed("set_industry_category", async {
            sqlx::query("UPDATE opportunities SET industry_category = $2 WHERE id = $1")
                .bind(opportunity_id)
                .bind(category.as_str())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn recent_opportunities_for_areas(
        &self,
        area_ids: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        self.timed("recent_opportunities_for_areas", async {
            let sql = format!(
                "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities o \
                 WHERE o.area_id = ANY($1) AND o.scraped_at >= $2 \
                 ORDER BY o.scraped_at DESC, o.id LIMIT $3"
            );
            let rows = sqlx::query(&sql)
                .bind(area_ids)
                .bind(since)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(opportunity_from_row).collect()
        })
        .await
    }

    async fn active_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        self.timed("active_subscribers", async {
            let rows = sqlx::query(
                r#"
                SELECT id, status, trial_started_at, trial_ends_at, notification_email,
                       email_notify, match_threshold, initial_screening_done
                  FROM subscribers
                 WHERE status IN ('active', 'trial')
                 ORDER BY id
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            let area_rows = sqlx::query(
                "SELECT subscriber_id, area_id FROM subscriber_areas ORDER BY subscriber_id, area_id",
            )
            .fetch_all(&self.pool)
            .await?;
            let mut areas: HashMap<Uuid, Vec<String>> = HashMap::new();
            for row in &area_rows {
                areas
                    .entry(row.try_get("subscriber_id")?)
                    .or_default()
                    .push(row.try_get("area_id")?);
            }

            let profile_rows = sqlx::query(
                r#"
                SELECT subscriber_id, company_name, business_areas, services, strengths,
                       qualifications, matching_keywords, industry_categories
                  FROM business_profiles
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            let mut profiles: HashMap<Uuid, BusinessProfile> = HashMap::new();
            for row in &profile_rows {
                let list = |column: &str| -> Result<Vec<String>, StoreError> {
                    Ok(row
                        .try_get::<Option<Vec<String>>, _>(column)?
                        .unwrap_or_default())
                };
                profiles.insert(
                    row.try_get("subscriber_id")?,
                    BusinessProfile {
                        company_name: row.try_get("company_name")?,
                        business_areas: list("business_areas")?,
                        services: list("services")?,
                        strengths: list("strengths")?,
                        qualifications: list("qualifications")?,
                        matching_keywords: list("matching_keywords")?,
                        industry_categories: list("industry_categories")?,
                    },
                );
            }

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let id: Uuid = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                let threshold: Option<i16> = row.try_get("match_threshold")?;
                out.push(Subscriber {
                    id,
                    status: AccountStatus::parse(&status),
                    trial_started_at: row.try_get("trial_started_at")?,
                    trial_ends_at: row.try_get("trial_ends_at")?,
                    notification_email: row.try_get("notification_email")?,
                    email_notify: row.try_get("email_notify")?,
                    match_threshold: threshold.map(|t| t.clamp(0, 100) as u8),
                    initial_screening_done: row.try_get("initial_screening_done")?,
                    area_ids: areas.remove(&id).unwrap_or_default(),
                    profile: profiles.remove(&id),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn mark_screening_done(
        &self,
        subscriber_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed("mark_screening_done", async {
            sqlx::query(
                "UPDATE subscribers SET initial_screening_done = TRUE, screening_completed_at = $2 \
                 WHERE id = $1",
            )
            .bind(subscriber_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn upsert_match_by_key(&self, upsert: &MatchUpsert) -> Result<(), StoreError> {
        self.timed("upsert_match_by_key", async {
            sqlx::query(
                r#"
                INSERT INTO user_opportunities
                    (subscriber_id, opportunity_id, match_score, match_reason, risk_notes,
                     recommendation, action_items, rank_position)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (subscriber_id, opportunity_id) DO UPDATE SET
                    match_score = EXCLUDED.match_score,
                    match_reason = EXCLUDED.match_reason,
                    risk_notes = EXCLUDED.risk_notes,
                    recommendation = EXCLUDED.recommendation,
                    action_items = EXCLUDED.action_items,
                    rank_position = EXCLUDED.rank_position
                "#,
            )
            .bind(upsert.subscriber_id)
            .bind(upsert.opportunity_id)
            .bind(i16::from(upsert.score))
            .bind(&upsert.reason)
            .bind(&upsert.risk_notes)
            .bind(&upsert.recommendation)
            .bind(Json(&upsert.action_items))
            .bind(i32::try_from(upsert.rank_position).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn unnotified_matches(
        &self,
        subscriber_id: Uuid,
        threshold: u8,
    ) -> Result<Vec<PendingMatch>, StoreError> {
        self.timed("unnotified_matches", async {
            let sql = format!(
                r#"
                SELECT {OPPORTUNITY_COLUMNS},
                       uo.subscriber_id, uo.opportunity_id, uo.match_score, uo.match_reason,
                       uo.risk_notes, uo.recommendation, uo.action_items, uo.rank_position,
                       uo.notified, uo.notified_at, uo.detailed_analysis, uo.analysis_completed_at
                  FROM user_opportunities uo
                  JOIN opportunities o ON o.id = uo.opportunity_id
                 WHERE uo.subscriber_id = $1 AND NOT uo.notified AND uo.match_score >= $2
                 ORDER BY uo.match_score DESC, uo.rank_position ASC NULLS LAST, uo.opportunity_id
                "#
            );
            let rows = sqlx::query(&sql)
                .bind(subscriber_id)
                .bind(i16::from(threshold))
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|row| {
                    Ok(PendingMatch {
                        record: match_from_row(row)?,
                        opportunity: opportunity_from_row(row)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn cached_analysis(
        &self,
        subscriber_id: Uuid,
        opportunity_id: Uuid,
    ) -> Result<Option<MatchAnalysis>, StoreError> {
        self.timed("cached_analysis", async {
            let row = sqlx::query(
                "SELECT detailed_analysis FROM user_opportunities \
                 WHERE subscriber_id = $1 AND opportunity_id = $2",
            )
            .bind(subscriber_id)
            .bind(opportunity_id)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => {
                    let analysis: Option<Json<MatchAnalysis>> = row.try_get("detailed_analysis")?;
                    Ok(analysis.map(|j| j.0))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_analysis_by_key(
        &self,
        subscriber_id: Uuid,
        opportunity_id: Uuid,
        analysis: &MatchAnalysis,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed("save_analysis_by_key", async {
            sqlx::query(
                r#"
                INSERT INTO user_opportunities
                    (subscriber_id, opportunity_id, match_score, detailed_analysis, analysis_completed_at)
                VALUES ($1, $2, 0, $3, $4)
                ON CONFLICT (subscriber_id, opportunity_id) DO UPDATE SET
                    detailed_analysis = EXCLUDED.detailed_analysis,
                    analysis_completed_at = EXCLUDED.analysis_completed_at
                "#,
            )
            .bind(subscriber_id)
            .bind(opportunity_id)
            .bind(Json(analysis))
            .bind(at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn mark_notified(
        &self,
        subscriber_id: Uuid,
        opportunity_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed("mark_notified", async {
            sqlx::query(
                "UPDATE user_opportunities SET notified = TRUE, notified_at = $3 \
                 WHERE subscriber_id = $1 AND opportunity_id = ANY($2) AND NOT notified",
            )
            .bind(subscriber_id)
            .bind(opportunity_ids)
            .bind(at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn log_notification(&self, entry: &NotificationLog) -> Result<(), StoreError> {
        self.timed("log_notification", async {
            sqlx::query(
                "INSERT INTO notifications (subscriber_id, channel, status, opportunities_count, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(entry.subscriber_id)
            .bind(&entry.channel)
            .bind(entry.status.as_str())
            .bind(i32::try_from(entry.opportunities_count).unwrap_or(i32::MAX))
            .bind(entry.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
