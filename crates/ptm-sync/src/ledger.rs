use std::sync::Arc;

use chrono::{DateTime, Utc};
use ptm_core::{ErrorClass, RunCounters, RunError, RunLedgerEntry, RunPhase, RunStatus};
use ptm_storage::{RecordStore, StoreError};
use tracing::{error, info, warn};
use uuid::Uuid;

/// One pipeline run's audit record. Opened before any phase and closed once,
/// whatever happened in between.
pub struct RunLedger {
    store: Arc<dyn RecordStore>,
    entry: RunLedgerEntry,
    max_error_entries: usize,
    fatal: bool,
}

impl RunLedger {
    pub async fn open(
        store: Arc<dyn RecordStore>,
        started_at: DateTime<Utc>,
        max_error_entries: usize,
    ) -> Result<Self, StoreError> {
        let id = store.create_run(started_at).await?;
        info!(run_id = %id, "run opened");
        Ok(Self {
            store,
            entry: RunLedgerEntry {
                id,
                started_at,
                finished_at: None,
                status: RunStatus::Running,
                counters: RunCounters::default(),
                errors: Vec::new(),
            },
            max_error_entries,
            fatal: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    pub fn counters(&self) -> &RunCounters {
        &self.entry.counters
    }

    pub fn counters_mut(&mut self) -> &mut RunCounters {
        &mut self.entry.counters
    }

    pub fn errors(&self) -> &[RunError] {
        &self.entry.errors
    }

    /// `errors_count` always counts; the detail list stops growing at the cap.
    pub fn record_error(&mut self, err: RunError) {
        self.entry.counters.errors_count += 1;
        if self.entry.errors.len() < self.max_error_entries {
            self.entry.errors.push(err);
        }
    }

    pub fn record_errors(&mut self, errs: impl IntoIterator<Item = RunError>) {
        for err in errs {
            self.record_error(err);
        }
    }

    pub fn error(
        &mut self,
        phase: RunPhase,
        class: ErrorClass,
        context: impl Into<String>,
        message: impl ToString,
    ) {
        self.record_error(RunError {
            phase,
            class,
            context: context.into(),
            message: message.to_string(),
        });
    }

    /// An error that escaped its phase; the run ends `failed`.
    pub fn mark_fatal(&mut self, phase: RunPhase, message: impl ToString) {
        self.fatal = true;
        let message = message.to_string();
        error!(run_id = %self.entry.id, ?phase, %message, "run aborted");
        self.error(phase, ErrorClass::Fatal, "run", message);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Settles the status and persists the final counters. A write failure here
    /// is logged; the run's side effects already stand.
    pub async fn close(mut self, finished_at: DateTime<Utc>) -> RunLedgerEntry {
        self.entry.finished_at = Some(finished_at);
        self.entry.status = RunStatus::settle(self.fatal, self.entry.counters.errors_count);
        if let Err(err) = self.store.finish_run(&self.entry).await {
            warn!(run_id = %self.entry.id, error = %err, "failed to persist run ledger");
        }
        let c = &self.entry.counters;
        info!(
            run_id = %self.entry.id,
            status = self.entry.status.as_str(),
            sources_scraped = c.sources_scraped,
            sources_failed = c.sources_failed,
            opportunities_saved = c.opportunities_saved,
            records_enriched = c.records_enriched,
            records_classified = c.records_classified,
            matches_created = c.matches_created,
            notifications_sent = c.notifications_sent,
            errors_count = c.errors_count,
            "run closed"
        );
        self.entry
    }
}
