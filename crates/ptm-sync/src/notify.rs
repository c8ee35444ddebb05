use std::collections::HashMap;
use std::sync::Arc;

use askama::Template;
use chrono::{DateTime, Utc};
use ptm_adapters::prompts::{analysis_request, parse_analysis};
use ptm_adapters::{generate_json, LlmClient, MailTransport, OutgoingMail};
use ptm_core::{
    BusinessProfile, ErrorClass, MatchAnalysis, NotificationLog, NotificationStatus, PendingMatch,
    RunError, RunPhase, Subscriber, Tier,
};
use ptm_storage::RecordStore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::NotificationSettings;

pub const EMAIL_CHANNEL: &str = "email";

/// Every subscriber's tier, resolved once against a single clock reading so a
/// trial expiring mid-run cannot give two answers.
#[derive(Debug, Clone)]
pub struct TierSnapshot {
    now: DateTime<Utc>,
    tiers: HashMap<Uuid, Tier>,
}

impl TierSnapshot {
    pub fn resolve(subscribers: &[Subscriber], now: DateTime<Utc>, trial_days: i64) -> Self {
        Self {
            now,
            tiers: subscribers
                .iter()
                .map(|s| (s.id, s.tier_at(now, trial_days)))
                .collect(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn tier_of(&self, subscriber_id: Uuid) -> Tier {
        self.tiers.get(&subscriber_id).copied().unwrap_or(Tier::Free)
    }
}

pub fn tier_cap(tier: Tier, settings: &NotificationSettings) -> usize {
    match tier {
        Tier::Paid => settings.paid_cap,
        Tier::Free => settings.free_cap,
    }
}

struct DigestItem {
    rank: usize,
    score: u8,
    title: String,
    has_url: bool,
    detail_url: String,
    organization: String,
    deadline: String,
    budget: String,
    reason: String,
    has_analysis: bool,
    summary: String,
    match_points: Vec<String>,
    concerns: Vec<String>,
    actions: Vec<String>,
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestTemplate {
    heading: String,
    tier_label: &'static str,
    items: Vec<DigestItem>,
    remaining: usize,
    show_upgrade: bool,
    paid_cap: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub subject: String,
    pub html: String,
    pub surfaced: usize,
    pub remaining: usize,
}

/// One digest covering the surfaced matches; `total` is the full candidate count.
pub fn render_digest(
    tier: Tier,
    surfaced: &[(PendingMatch, Option<MatchAnalysis>)],
    total: usize,
    paid_cap: usize,
) -> Result<Digest, askama::Error> {
    let unknown = "不明".to_string();
    let items = surfaced
        .iter()
        .enumerate()
        .map(|(i, (pending, analysis))| {
            let opp = &pending.opportunity;
            let analysis = analysis.clone();
            DigestItem {
                rank: i + 1,
                score: pending.record.score,
                title: opp.title.clone(),
                has_url: opp.detail_url.is_some(),
                detail_url: opp.detail_url.clone().unwrap_or_default(),
                organization: opp.organization.clone().unwrap_or_else(|| unknown.clone()),
                deadline: opp.deadline.map(|d| d.to_string()).unwrap_or_else(|| unknown.clone()),
                budget: opp.budget.clone().unwrap_or_else(|| unknown.clone()),
                reason: pending.record.reason.clone().unwrap_or_default(),
                has_analysis: analysis.is_some(),
                summary: analysis.as_ref().map(|a| a.summary.clone()).unwrap_or_default(),
                match_points: analysis.as_ref().map(|a| a.match_points.clone()).unwrap_or_default(),
                concerns: analysis.as_ref().map(|a| a.concerns.clone()).unwrap_or_default(),
                actions: analysis.map(|a| a.actions).unwrap_or_default(),
            }
        })
        .collect::<Vec<_>>();

    let count = items.len();
    let remaining = total.saturating_sub(count);
    let subject = format!("【新着公募】本日の新着案件 {count}件");
    let html = DigestTemplate {
        heading: subject.clone(),
        tier_label: match tier {
            Tier::Paid => "有料プラン",
            Tier::Free => "無料プラン",
        },
        items,
        remaining,
        show_upgrade: tier == Tier::Free,
        paid_cap,
    }
    .render()?;

    Ok(Digest {
        subject,
        html,
        surfaced: count,
        remaining,
    })
}

#[derive(Debug, Default)]
pub struct NotifyReport {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub opted_out: u64,
    pub errors: Vec<RunError>,
}

impl NotifyReport {
    fn error(&mut self, class: ErrorClass, subscriber_id: Uuid, message: impl ToString) {
        self.errors.push(RunError {
            phase: RunPhase::Notify,
            class,
            context: format!("subscriber={subscriber_id}"),
            message: message.to_string(),
        });
    }
}

/// Per-subscriber digests with tier caps. Every candidate over threshold is
/// marked notified after a confirmed send, surfaced or not, so nothing is
/// offered twice.
pub struct Notifier {
    store: Arc<dyn RecordStore>,
    llm: Arc<dyn LlmClient>,
    mailer: Arc<dyn MailTransport>,
    settings: NotificationSettings,
    from_email: String,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn RecordStore>,
        llm: Arc<dyn LlmClient>,
        mailer: Arc<dyn MailTransport>,
        settings: NotificationSettings,
        from_email: impl Into<String>,
    ) -> Self {
        Self {
            store,
            llm,
            mailer,
            settings,
            from_email: from_email.into(),
        }
    }

    pub async fn notify_all(&self, subscribers: &[Subscriber], snapshot: &TierSnapshot) -> NotifyReport {
        let mut report = NotifyReport::default();
        for sub in subscribers {
            if !sub.email_notify {
                debug!(subscriber_id = %sub.id, "email notifications disabled");
                report.opted_out += 1;
                continue;
            }
            let tier = snapshot.tier_of(sub.id);
            let span = info_span!("notify", subscriber_id = %sub.id, ?tier);
            self.notify_one(sub, tier, snapshot.now(), &mut report)
                .instrument(span)
                .await;
        }
        info!(
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            opted_out = report.opted_out,
            "notification pass finished"
        );
        report
    }

    async fn notify_one(&self, sub: &Subscriber, tier: Tier, now: DateTime<Utc>, report: &mut NotifyReport) {
        let threshold = sub.match_threshold.unwrap_or(self.settings.default_threshold);
        let candidates = match self.store.unnotified_matches(sub.id, threshold).await {
            Ok(candidates) => candidates,
            Err(err) => {
                report.error(ErrorClass::DbFailed, sub.id, err);
                return;
            }
        };

        if candidates.is_empty() {
            report.skipped += 1;
            self.log(sub.id, NotificationStatus::Skipped, 0, now, report).await;
            return;
        }

        let cap = tier_cap(tier, &self.settings);
        let Some(to) = sub.notification_email.as_deref().filter(|e| !e.trim().is_empty()) else {
            warn!(subscriber_id = %sub.id, "no notification address");
            report.failed += 1;
            report.error(ErrorClass::FetchFailed, sub.id, "no notification address");
            self.log(sub.id, NotificationStatus::Failed, cap.min(candidates.len()), now, report)
                .await;
            return;
        };

        let mut surfaced = Vec::with_capacity(cap.min(candidates.len()));
        for pending in candidates.iter().take(cap) {
            let analysis = self.analysis_for(sub, pending, now, report).await;
            surfaced.push((pending.clone(), analysis));
        }

        let digest = match render_digest(tier, &surfaced, candidates.len(), self.settings.paid_cap) {
            Ok(digest) => digest,
            Err(err) => {
                report.failed += 1;
                report.error(ErrorClass::ExtractionFailed, sub.id, err);
                self.log(sub.id, NotificationStatus::Failed, surfaced.len(), now, report).await;
                return;
            }
        };

        let mail = OutgoingMail {
            from: self.from_email.clone(),
            to: to.to_string(),
            subject: digest.subject.clone(),
            html: digest.html,
        };
        match self.mailer.send(&mail).await {
            Ok(message_id) => {
                let ids: Vec<Uuid> = candidates.iter().map(|c| c.opportunity.id).collect();
                if let Err(err) = self.store.mark_notified(sub.id, &ids, now).await {
                    report.error(ErrorClass::DbFailed, sub.id, err);
                }
                report.sent += 1;
                info!(
                    subscriber_id = %sub.id,
                    %message_id,
                    surfaced = digest.surfaced,
                    remaining = digest.remaining,
                    "digest sent"
                );
                self.log(sub.id, NotificationStatus::Sent, digest.surfaced, now, report).await;
            }
            Err(err) => {
                warn!(subscriber_id = %sub.id, error = %err, "digest send failed");
                report.failed += 1;
                report.error(ErrorClass::FetchFailed, sub.id, err);
                self.log(sub.id, NotificationStatus::Failed, digest.surfaced, now, report).await;
            }
        }
    }

    /// Cached analysis when present, otherwise generated and saved on the
    /// match row. A failure leaves the item without an analysis section.
    async fn analysis_for(
        &self,
        sub: &Subscriber,
        pending: &PendingMatch,
        now: DateTime<Utc>,
        report: &mut NotifyReport,
    ) -> Option<MatchAnalysis> {
        if let Some(cached) = pending.record.detailed_analysis.clone() {
            return Some(cached);
        }
        let opp_id = pending.opportunity.id;
        match self.store.cached_analysis(sub.id, opp_id).await {
            Ok(Some(cached)) => return Some(cached),
            Ok(None) => {}
            Err(err) => {
                report.error(ErrorClass::DbFailed, sub.id, err);
                return None;
            }
        }

        let profile: &BusinessProfile = sub.profile.as_ref()?;
        let analysis = match generate_json(self.llm.as_ref(), &analysis_request(profile, &pending.opportunity))
            .await
            .and_then(parse_analysis)
        {
            Ok(analysis) => analysis,
            Err(err) => {
                debug!(opportunity_id = %opp_id, error = %err, "analysis unavailable");
                report.error(ErrorClass::ExtractionFailed, sub.id, format!("analysis {opp_id}: {err}"));
                return None;
            }
        };
        if let Err(err) = self.store.save_analysis_by_key(sub.id, opp_id, &analysis, now).await {
            report.error(ErrorClass::DbFailed, sub.id, err);
        }
        Some(analysis)
    }

    async fn log(
        &self,
        subscriber_id: Uuid,
        status: NotificationStatus,
        count: usize,
        now: DateTime<Utc>,
        report: &mut NotifyReport,
    ) {
        let entry = NotificationLog {
            subscriber_id,
            channel: EMAIL_CHANNEL.to_string(),
            status,
            opportunities_count: count,
            created_at: now,
        };
        if let Err(err) = self.store.log_notification(&entry).await {
            report.error(ErrorClass::DbFailed, subscriber_id, err);
        }
    }
}
