use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ptm_adapters::prompts::{
    classification_request, match_request, parse_classification, parse_matches,
};
use ptm_adapters::{generate_json, LlmClient, LlmError};
use ptm_core::{BusinessProfile, IndustryCategory, MatchUpsert, Opportunity};
use tracing::{debug, warn};
use uuid::Uuid;

/// A batch whose collaborator call failed. Its records are simply absent from
/// the results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub size: usize,
    pub message: String,
}

#[derive(Debug)]
pub struct BatchRun<R> {
    pub results: Vec<R>,
    pub failures: Vec<BatchFailure>,
    pub batches_issued: usize,
}

/// Calls `call` once per fixed-size batch, in order, sleeping `delay` between
/// calls. A failing batch is recorded and skipped; later batches still run.
pub async fn run_batches<'a, T, R, E, F, Fut>(
    items: &'a [T],
    batch_size: usize,
    delay: Duration,
    mut call: F,
) -> BatchRun<R>
where
    F: FnMut(usize, &'a [T]) -> Fut,
    Fut: Future<Output = Result<Vec<R>, E>>,
    E: Display,
{
    let mut run = BatchRun {
        results: Vec::new(),
        failures: Vec::new(),
        batches_issued: 0,
    };
    for (index, batch) in items.chunks(batch_size.max(1)).enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        run.batches_issued += 1;
        match call(index, batch).await {
            Ok(mut results) => run.results.append(&mut results),
            Err(err) => {
                warn!(batch = index, size = batch.len(), error = %err, "batch failed");
                run.failures.push(BatchFailure {
                    batch_index: index,
                    size: batch.len(),
                    message: err.to_string(),
                });
            }
        }
    }
    run
}

/// Assigns industry categories in fixed-size batches.
pub struct Classifier {
    llm: Arc<dyn LlmClient>,
    batch_size: usize,
    delay: Duration,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmClient>, batch_size: usize, delay: Duration) -> Self {
        Self {
            llm,
            batch_size,
            delay,
        }
    }

    pub async fn classify(&self, records: &[Opportunity]) -> BatchRun<(Uuid, IndustryCategory)> {
        run_batches(records, self.batch_size, self.delay, |index, batch| async move {
            let value = generate_json(self.llm.as_ref(), &classification_request(batch)).await?;
            let items = parse_classification(value)?;
            let assigned = correlate_by_index(batch, items.into_iter().map(|i| (i.index, i.category)));
            debug!(batch = index, requested = batch.len(), assigned = assigned.len(), "classified batch");
            Ok::<_, LlmError>(assigned)
        })
        .await
    }
}

/// Maps 1-based response indexes back to records. Out-of-range and repeated
/// indexes are ignored; unknown labels fall back to the catch-all category.
pub fn correlate_by_index(
    batch: &[Opportunity],
    items: impl IntoIterator<Item = (usize, String)>,
) -> Vec<(Uuid, IndustryCategory)> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter_map(|(index, label)| {
            let opp = batch.get(index.checked_sub(1)?)?;
            seen.insert(index)
                .then(|| (opp.id, IndustryCategory::parse_or_other(&label)))
        })
        .collect()
}

/// A scored candidate before ranking. `position` is the opportunity's index in
/// the matcher input and breaks score ties.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch {
    pub opportunity_id: Uuid,
    pub position: usize,
    pub score: u8,
    pub reason: Option<String>,
    pub risk_notes: Option<String>,
    pub recommendation: Option<String>,
    pub action_items: Vec<String>,
}

impl ScoredMatch {
    pub fn into_upsert(self, subscriber_id: Uuid, rank_position: u32) -> MatchUpsert {
        MatchUpsert {
            subscriber_id,
            opportunity_id: self.opportunity_id,
            score: self.score,
            reason: self.reason,
            risk_notes: self.risk_notes,
            recommendation: self.recommendation,
            action_items: self.action_items,
            rank_position,
        }
    }
}

/// Stable sort by score, highest first, then rank 1..K.
pub fn assign_ranks(mut scored: Vec<ScoredMatch>) -> Vec<(u32, ScoredMatch)> {
    scored.sort_by(|a, b| b.score.cmp(&a.score).then(a.position.cmp(&b.position)));
    scored
        .into_iter()
        .enumerate()
        .map(|(i, m)| (u32::try_from(i + 1).unwrap_or(u32::MAX), m))
        .collect()
}

/// Scores opportunities against one business profile in fixed-size batches.
pub struct Matcher {
    llm: Arc<dyn LlmClient>,
    batch_size: usize,
    delay: Duration,
}

impl Matcher {
    pub fn new(llm: Arc<dyn LlmClient>, batch_size: usize, delay: Duration) -> Self {
        Self {
            llm,
            batch_size,
            delay,
        }
    }

    /// Ranked matches for `profile`. Scores naming an id outside the batch
    /// that was sent are discarded.
    pub async fn score(
        &self,
        profile: &BusinessProfile,
        opportunities: &[Opportunity],
    ) -> (Vec<(u32, ScoredMatch)>, Vec<BatchFailure>) {
        let positions: HashMap<Uuid, usize> = opportunities
            .iter()
            .enumerate()
            .map(|(i, o)| (o.id, i))
            .collect();
        let positions = &positions;

        let run = run_batches(opportunities, self.batch_size, self.delay, |index, batch| async move {
            let value = generate_json(self.llm.as_ref(), &match_request(profile, batch)).await?;
            let sent: HashSet<Uuid> = batch.iter().map(|o| o.id).collect();
            let mut kept = Vec::new();
            let mut dropped = 0usize;
            for item in parse_matches(value)? {
                let id = match Uuid::parse_str(item.id.trim()) {
                    Ok(id) if sent.contains(&id) => id,
                    _ => {
                        dropped += 1;
                        continue;
                    }
                };
                if kept.iter().any(|m: &ScoredMatch| m.opportunity_id == id) {
                    continue;
                }
                kept.push(ScoredMatch {
                    opportunity_id: id,
                    position: positions.get(&id).copied().unwrap_or(usize::MAX),
                    score: item.score,
                    reason: item.reason,
                    risk_notes: item.risk_notes,
                    recommendation: item.recommendation,
                    action_items: item.action_items,
                });
            }
            if dropped > 0 {
                warn!(batch = index, dropped, "match response named unknown ids");
            }
            Ok::<_, LlmError>(kept)
        })
        .await;

        (assign_ranks(run.results), run.failures)
    }
}
