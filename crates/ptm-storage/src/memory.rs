use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ptm_core::{
    AccountStatus, DataSource, EnrichmentPatch, IndustryCategory, MatchAnalysis, MatchRecord,
    MatchUpsert, NotificationLog, Opportunity, OpportunityDraft, OpportunityKey, PendingMatch,
    RunLedgerEntry, RunStatus, Subscriber,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{RecordStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    runs: BTreeMap<Uuid, RunLedgerEntry>,
    sources: BTreeMap<String, DataSource>,
    opportunities: BTreeMap<Uuid, Opportunity>,
    by_key: HashMap<OpportunityKey, Uuid>,
    subscribers: BTreeMap<Uuid, Subscriber>,
    matches: BTreeMap<(Uuid, Uuid), MatchRecord>,
    notifications: Vec<NotificationLog>,
    failing_writes: HashSet<Uuid>,
}

/// In-process store with the same merge semantics as the Postgres backend.
/// Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_source(&self, source: DataSource) {
        self.state
            .lock()
            .await
            .sources
            .insert(source.id.clone(), source);
    }

    pub async fn insert_subscriber(&self, subscriber: Subscriber) {
        self.state
            .lock()
            .await
            .subscribers
            .insert(subscriber.id, subscriber);
    }

    /// Seed a row directly, bypassing the upsert path.
    pub async fn insert_opportunity(&self, opportunity: Opportunity) {
        let mut state = self.state.lock().await;
        state.by_key.insert(opportunity.key(), opportunity.id);
        state.opportunities.insert(opportunity.id, opportunity);
    }

    /// Every subsequent write touching this opportunity fails.
    pub async fn fail_writes_for(&self, opportunity_id: Uuid) {
        self.state.lock().await.failing_writes.insert(opportunity_id);
    }

    pub async fn opportunities(&self) -> Vec<Opportunity> {
        self.state.lock().await.opportunities.values().cloned().collect()
    }

    pub async fn opportunity(&self, id: Uuid) -> Option<Opportunity> {
        self.state.lock().await.opportunities.get(&id).cloned()
    }

    pub async fn source(&self, id: &str) -> Option<DataSource> {
        self.state.lock().await.sources.get(id).cloned()
    }

    pub async fn subscriber(&self, id: Uuid) -> Option<Subscriber> {
        self.state.lock().await.subscribers.get(&id).cloned()
    }

    pub async fn matches_for(&self, subscriber_id: Uuid) -> Vec<MatchRecord> {
        self.state
            .lock()
            .await
            .matches
            .values()
            .filter(|m| m.subscriber_id == subscriber_id)
            .cloned()
            .collect()
    }

    pub async fn runs(&self) -> Vec<RunLedgerEntry> {
        self.state.lock().await.runs.values().cloned().collect()
    }

    pub async fn notifications(&self) -> Vec<NotificationLog> {
        self.state.lock().await.notifications.clone()
    }
}

fn injected_failure(id: Uuid) -> StoreError {
    StoreError::Decode {
        table: "opportunities",
        detail: format!("injected write failure for {id}"),
    }
}

fn newest_first(a: &Opportunity, b: &Opportunity) -> std::cmp::Ordering {
    b.scraped_at.cmp(&a.scraped_at).then(a.id.cmp(&b.id))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.state.lock().await.runs.insert(
            id,
            RunLedgerEntry {
                id,
                started_at,
                finished_at: None,
                status: RunStatus::Running,
                counters: Default::default(),
                errors: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn finish_run(&self, entry: &RunLedgerEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&entry.id) {
            Some(slot) => {
                *slot = entry.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "batch_log",
                id: entry.id.to_string(),
            }),
        }
    }

    async fn active_sources(&self) -> Result<Vec<DataSource>, StoreError> {
        let state = self.state.lock().await;
        let mut sources: Vec<_> = state.sources.values().filter(|s| s.active).cloned().collect();
        sources.sort_by(|a, b| a.area_id.cmp(&b.area_id).then(a.id.cmp(&b.id)));
        Ok(sources)
    }

    async fn record_source_attempt(
        &self,
        source_id: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .get_mut(source_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "area_source",
                id: source_id.to_string(),
            })?;
        source.last_checked_at = Some(at);
        if success {
            source.last_success_at = Some(at);
            source.consecutive_failures = 0;
        } else {
            source.consecutive_failures = source.consecutive_failures.saturating_add(1);
        }
        Ok(())
    }

    async fn upsert_opportunity_by_key(
        &self,
        draft: &OpportunityDraft,
        at: DateTime<Utc>,
    ) -> Result<Opportunity, StoreError> {
        let mut state = self.state.lock().await;
        let key = draft.key();
        if let Some(id) = state.by_key.get(&key).copied() {
            if state.failing_writes.contains(&id) {
                return Err(injected_failure(id));
            }
            if let Some(existing) = state.opportunities.get_mut(&id) {
                existing.merge_draft(draft);
                return Ok(existing.clone());
            }
        }
        let opportunity = Opportunity::from_draft(draft, at);
        state.by_key.insert(key, opportunity.id);
        state.opportunities.insert(opportunity.id, opportunity.clone());
        Ok(opportunity)
    }

    async fn unenriched_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.lock().await;
        let mut backlog: Vec<_> = state
            .opportunities
            .values()
            .filter(|o| o.detail_fetched_at.is_none() && o.detail_url.is_some())
            .cloned()
            .collect();
        backlog.sort_by(newest_first);
        Ok(backlog.into_iter().skip(offset).take(limit).collect())
    }

    async fn apply_enrichment(
        &self,
        opportunity_id: Uuid,
        patch: &EnrichmentPatch,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_writes.contains(&opportunity_id) {
            return Err(injected_failure(opportunity_id));
        }
        let opportunity = state
            .opportunities
            .get_mut(&opportunity_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "opportunity",
                id: opportunity_id.to_string(),
            })?;
        opportunity.apply_enrichment(patch, at);
        Ok(())
    }

    async fn unclassified(&self, limit: usize) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .opportunities
            .values()
            .filter(|o| o.industry_category.is_none())
            .cloned()
            .collect();
        rows.sort_by(newest_first);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn set_industry_category(
        &self,
        opportunity_id: Uuid,
        category: IndustryCategory,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_writes.contains(&opportunity_id) {
            return Err(injected_failure(opportunity_id));
        }
        let opportunity = state
            .opportunities
            .get_mut(&opportunity_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "opportunity",
                id: opportunity_id.to_string(),
            })?;
        opportunity.industry_category = Some(category);
        Ok(())
    }

    async fn recent_opportunities_for_areas(
        &self,
        area_ids: &[String],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .opportunities
            .values()
            .filter(|o| area_ids.contains(&o.area_id) && o.scraped_at >= since)
            .cloned()
            .collect();
        rows.sort_by(newest_first);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn active_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .subscribers
            .values()
            .filter(|s| matches!(s.status, AccountStatus::Active | AccountStatus::Trial))
            .cloned()
            .collect())
    }

    async fn mark_screening_done(
        &self,
        subscriber_id: Uuid,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let subscriber = state
            .subscribers
            .get_mut(&subscriber_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "subscriber",
                id: subscriber_id.to_string(),
            })?;
        subscriber.initial_screening_done = true;
        Ok(())
    }

    async fn upsert_match_by_key(&self, upsert: &MatchUpsert) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_writes.contains(&upsert.opportunity_id) {
            return Err(injected_failure(upsert.opportunity_id));
        }
        state
            .matches
            .entry((upsert.subscriber_id, upsert.opportunity_id))
            .or_insert_with(|| MatchRecord::empty(upsert.subscriber_id, upsert.opportunity_id))
            .merge_scores(upsert);
        Ok(())
    }

    async fn unnotified_matches(
        &self,
        subscriber_id: Uuid,
        threshold: u8,
    ) -> Result<Vec<PendingMatch>, StoreError> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .matches
            .values()
            .filter(|m| m.subscriber_id == subscriber_id && !m.notified && m.score >= threshold)
            .filter_map(|m| {
                state.opportunities.get(&m.opportunity_id).map(|o| PendingMatch {
                    record: m.clone(),
                    opportunity: o.clone(),
                })
            })
            .collect();
        pending.sort_by(|a, b| {
            b.record
                .score
                .cmp(&a.record.score)
                .then(
                    a.record
                        .rank_position
                        .unwrap_or(u32::MAX)
                        .cmp(&b.record.rank_position.unwrap_or(u32::MAX)),
                )
                .then(a.record.opportunity_id.cmp(&b.record.opportunity_id))
        });
        Ok(pending)
    }

    async fn cached_analysis(
        &self,
        subscriber_id: Uuid,
        opportunity_id: Uuid,
    ) -> Result<Option<MatchAnalysis>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .matches
            .get(&(subscriber_id, opportunity_id))
            .and_then(|m| m.detailed_analysis.clone()))
    }

    async fn save_analysis_by_key(
        &self,
        subscriber_id: Uuid,
        opportunity_id: Uuid,
        analysis: &MatchAnalysis,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .matches
            .entry((subscriber_id, opportunity_id))
            .or_insert_with(|| MatchRecord::empty(subscriber_id, opportunity_id));
        record.detailed_analysis = Some(analysis.clone());
        record.analysis_completed_at = Some(at);
        Ok(())
    }

    async fn mark_notified(
        &self,
        subscriber_id: Uuid,
        opportunity_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for opportunity_id in opportunity_ids {
            if let Some(record) = state.matches.get_mut(&(subscriber_id, *opportunity_id)) {
                if !record.notified {
                    record.notified = true;
                    record.notified_at = Some(at);
                }
            }
        }
        Ok(())
    }

    async fn log_notification(&self, entry: &NotificationLog) -> Result<(), StoreError> {
        self.state.lock().await.notifications.push(entry.clone());
        Ok(())
    }
}
