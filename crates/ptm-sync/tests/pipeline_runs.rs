use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ptm_adapters::{
    AdapterError, FetchedPage, LlmClient, LlmError, LlmRequest, MailError, MailTransport,
    OutgoingMail, PageSource, SourceScraper,
};
use ptm_core::{
    AccountStatus, BusinessProfile, DataSource, ErrorClass, MatchUpsert, NotificationStatus,
    Opportunity, OpportunityDraft, RunStatus, Subscriber,
};
use ptm_storage::{FetchError, MemoryStore, RecordStore};
use ptm_sync::{Collaborators, Phase, Pipeline, PipelineConfig};
use uuid::Uuid;

const GOOD_PAGE: &str = "<html><body><h1>道路維持補修業務委託</h1>\
    <p>本業務は市道の維持補修を行うものです。参加資格は市の入札参加資格者名簿に登録のある者とします。</p>\
    </body></html>";

/// Scrape results keyed by source id; ids listed in `failing` error out.
#[derive(Default)]
struct ListScraper {
    drafts: HashMap<String, Vec<OpportunityDraft>>,
    failing: HashSet<String>,
}

#[async_trait]
impl SourceScraper for ListScraper {
    async fn scrape(&self, source: &DataSource) -> Result<Vec<OpportunityDraft>, AdapterError> {
        if self.failing.contains(&source.id) {
            return Err(AdapterError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: source.url.clone(),
            }));
        }
        Ok(self.drafts.get(&source.id).cloned().unwrap_or_default())
    }
}

/// Serves canned HTML by URL and records every request.
#[derive(Default)]
struct MapPages {
    pages: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl PageSource for MapPages {
    async fn fetch(&self, _scope: &str, url: &str) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        match self.pages.get(url) {
            Some(html) => Ok(FetchedPage {
                url: url.to_string(),
                content_type: "text/html".into(),
                body: html.clone().into_bytes(),
                fetched_at: Utc::now(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

/// Answers each prompt kind with a fixed shape. Classification calls listed in
/// `fail_classify_calls` (1-based) fail.
#[derive(Default)]
struct ScriptedLlm {
    fail_classify_calls: HashSet<usize>,
    classify_calls: Mutex<usize>,
    match_calls: Mutex<usize>,
    analysis_calls: Mutex<usize>,
}

fn ids_in(prompt: &str) -> Vec<String> {
    prompt
        .match_indices("\"id\": \"")
        .filter_map(|(at, marker)| prompt.get(at + marker.len()..at + marker.len() + 36))
        .filter(|id| Uuid::parse_str(id).is_ok())
        .map(String::from)
        .collect()
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let prompt = request.prompt.as_str();
        if prompt.contains("詳細ページから情報を抜き出し") {
            return Ok(r#"{"published_date": "2026-05-01", "deadline": "2024/01/01",
                "budget": "1,200万円", "difficulty": "低",
                "detailed_summary": "市道の維持補修を行う業務"}"#
                .into());
        }
        if prompt.contains("カテゴリのどれか1つに分類") {
            let call = {
                let mut calls = self.classify_calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if self.fail_classify_calls.contains(&call) {
                return Err(LlmError::EmptyResponse);
            }
            let items: Vec<String> = (1..=50)
                .map(|i| format!(r#"{{"index": {i}, "category": "建設・土木"}}"#))
                .collect();
            return Ok(format!("[{}]", items.join(",")));
        }
        if prompt.contains("会社プロフィールと公募") {
            *self.match_calls.lock().unwrap() += 1;
            let mut items: Vec<String> = ids_in(prompt)
                .into_iter()
                .enumerate()
                .map(|(i, id)| {
                    let score = if i == 0 { 90 } else { 70 };
                    format!(r#"{{"id": "{id}", "match_score": {score}, "match_reason": "施工実績と合致"}}"#)
                })
                .collect();
            items.push(format!(r#"{{"id": "{}", "match_score": 99}}"#, Uuid::new_v4()));
            return Ok(format!("[{}]", items.join(",")));
        }
        if prompt.contains("詳しい分析") {
            *self.analysis_calls.lock().unwrap() += 1;
            return Ok(r#"{"summary": "地元での施工実績が評価される案件",
                "match_points": ["市内業者要件を満たす"], "concerns": [],
                "actions": ["現場説明会に参加する"]}"#
                .into());
        }
        Err(LlmError::Malformed("unexpected prompt".into()))
    }
}

/// Records delivered mail. Addresses in `refuse` get a transport error.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingMail>>,
    refuse: Mutex<HashSet<String>>,
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<String, MailError> {
        if self.refuse.lock().unwrap().contains(&mail.to) {
            return Err(MailError::Http(FetchError::HttpStatus {
                status: 422,
                url: "https://api.resend.test/emails".into(),
            }));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail.clone());
        Ok(format!("msg_{}", sent.len()))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    pages: Arc<MapPages>,
    llm: Arc<ScriptedLlm>,
    mailer: Arc<RecordingMailer>,
    pipeline: Pipeline,
}

fn harness(
    config: PipelineConfig,
    store: Arc<MemoryStore>,
    scraper: ListScraper,
    pages: MapPages,
    llm: ScriptedLlm,
) -> Harness {
    let pages = Arc::new(pages);
    let llm = Arc::new(llm);
    let mailer = Arc::new(RecordingMailer::default());
    let pipeline = Pipeline::new(
        config,
        "Tender Digest <noreply@example.jp>",
        Collaborators {
            store: store.clone(),
            scraper: Arc::new(scraper),
            pages: pages.clone(),
            llm: llm.clone(),
            mailer: mailer.clone(),
        },
    );
    Harness {
        store,
        pages,
        llm,
        mailer,
        pipeline,
    }
}

fn quiet_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.classification.delay_ms = 0;
    config.matching.delay_ms = 0;
    config
}

fn source(id: &str, area: &str) -> DataSource {
    DataSource {
        id: id.into(),
        area_id: area.into(),
        name: format!("{id} 入札情報"),
        url: format!("https://{id}.example.jp/nyusatsu/"),
        active: true,
        consecutive_failures: 0,
        last_checked_at: None,
        last_success_at: None,
        notes: None,
    }
}

fn draft(source: &DataSource, title: &str, detail_url: Option<&str>) -> OpportunityDraft {
    OpportunityDraft {
        area_id: source.area_id.clone(),
        source_id: source.id.clone(),
        title: title.into(),
        organization: Some("岐阜市".into()),
        detail_url: detail_url.map(String::from),
        ..Default::default()
    }
}

fn subscriber(status: AccountStatus, area: &str, profile: Option<BusinessProfile>) -> Subscriber {
    Subscriber {
        id: Uuid::new_v4(),
        status,
        trial_started_at: None,
        trial_ends_at: None,
        notification_email: Some("bids@example.jp".into()),
        email_notify: true,
        match_threshold: None,
        initial_screening_done: true,
        area_ids: vec![area.into()],
        profile,
    }
}

fn profile() -> BusinessProfile {
    BusinessProfile {
        company_name: Some("長良建設".into()),
        business_areas: vec!["土木".into()],
        services: vec!["道路補修".into()],
        ..Default::default()
    }
}

fn seeded(area: &str, title: &str, detail_url: Option<String>, minutes_ago: i64) -> Opportunity {
    let mut opp = Opportunity::from_draft(
        &OpportunityDraft {
            area_id: area.into(),
            source_id: format!("{area}-city"),
            title: title.into(),
            detail_url,
            ..Default::default()
        },
        Utc::now() - Duration::minutes(minutes_ago),
    );
    opp.industry_category = None;
    opp
}

#[tokio::test]
async fn repeated_titles_collapse_and_denied_urls_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    let src = source("gifu-city", "gifu");
    store.insert_source(src.clone()).await;
    store
        .insert_subscriber(subscriber(AccountStatus::Active, "gifu", None))
        .await;

    let pdf = "https://gifu-city.example.jp/nyusatsu/koukoku.PDF";
    let mut scraper = ListScraper::default();
    scraper.drafts.insert(
        src.id.clone(),
        vec![
            draft(&src, "庁舎清掃業務", Some(pdf)),
            draft(&src, "庁舎清掃業務", Some(pdf)),
            draft(&src, "庁舎清掃業務", Some(pdf)),
        ],
    );
    let h = harness(quiet_config(), store, scraper, MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Scrape, Phase::Enrich]).await.unwrap();

    assert_eq!(h.store.opportunities().await.len(), 1);
    assert_eq!(entry.counters.opportunities_saved, 1);
    assert_eq!(entry.counters.enrichment.skipped, 1);
    assert_eq!(entry.counters.enrichment.success, 0);
    assert_eq!(entry.status, RunStatus::Completed);
    assert!(h.pages.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn enrichment_accounts_for_every_record_and_drops_bad_dates() {
    let store = Arc::new(MemoryStore::new());
    let mut pages = MapPages::default();
    let mut good_ids = Vec::new();
    for i in 0..20 {
        let url = match i % 10 {
            0 | 1 => format!("https://city.example.jp/files/{i}.pdf"),
            2 => format!("https://city.example.jp/login?next={i}"),
            3 | 4 => format!("https://city.example.jp/gone/{i}.html"),
            5 => {
                let url = format!("https://city.example.jp/empty/{i}.html");
                pages.pages.insert(url.clone(), "<html><body>準備中</body></html>".into());
                url
            }
            _ => {
                let url = format!("https://city.example.jp/koukoku/{i}.html");
                pages.pages.insert(url.clone(), GOOD_PAGE.into());
                url
            }
        };
        let opp = seeded("gifu", &format!("案件{i}"), Some(url), i);
        if i % 10 >= 6 {
            good_ids.push(opp.id);
        }
        store.insert_opportunity(opp).await;
    }

    let mut config = quiet_config();
    config.enrichment.page_size = 5;
    config.enrichment.workers = 3;
    config.enrichment.progress_every = 4;
    let h = harness(config, store, ListScraper::default(), pages, ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Enrich]).await.unwrap();
    let tally = entry.counters.enrichment;

    assert_eq!(tally.total(), 20);
    assert_eq!(tally.skipped, 6);
    assert_eq!(tally.fetch_failed, 6);
    assert_eq!(tally.extraction_failed, 0);
    assert_eq!(tally.success, 8);
    assert_eq!(entry.counters.records_enriched, 8);
    assert_eq!(entry.counters.errors_count, 6);
    assert_eq!(entry.status, RunStatus::CompletedWithErrors);
    assert_eq!(h.pages.calls.lock().unwrap().len(), 14);

    for id in good_ids {
        let opp = h.store.opportunity(id).await.unwrap();
        assert!(opp.detail_fetched_at.is_some());
        assert_eq!(opp.deadline, None);
        assert_eq!(opp.published_date.map(|d| d.to_string()).as_deref(), Some("2026-05-01"));
        assert_eq!(opp.budget.as_deref(), Some("1,200万円"));
    }
}

#[tokio::test]
async fn enrichment_db_failure_is_counted_and_row_stays_in_backlog() {
    let store = Arc::new(MemoryStore::new());
    let url = "https://city.example.jp/koukoku/1.html".to_string();
    let opp = seeded("gifu", "下水道管渠調査", Some(url.clone()), 0);
    let id = opp.id;
    store.insert_opportunity(opp).await;
    store.fail_writes_for(id).await;

    let mut pages = MapPages::default();
    pages.pages.insert(url, GOOD_PAGE.into());
    let h = harness(quiet_config(), store, ListScraper::default(), pages, ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Enrich]).await.unwrap();

    assert_eq!(entry.counters.enrichment.db_failed, 1);
    assert_eq!(entry.errors[0].class, ErrorClass::DbFailed);
    assert!(h.store.opportunity(id).await.unwrap().detail_fetched_at.is_none());
}

#[tokio::test]
async fn one_failed_classification_batch_loses_only_its_records() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..47 {
        store
            .insert_opportunity(seeded("gifu", &format!("物品購入{i}"), None, i))
            .await;
    }
    let mut config = quiet_config();
    config.classification.batch_size = 15;
    let llm = ScriptedLlm {
        fail_classify_calls: [2].into(),
        ..Default::default()
    };
    let h = harness(config, store, ListScraper::default(), MapPages::default(), llm);

    let entry = h.pipeline.run_phases(&[Phase::Classify]).await.unwrap();

    assert_eq!(*h.llm.classify_calls.lock().unwrap(), 4);
    assert_eq!(entry.counters.records_classified, 32);
    assert_eq!(entry.counters.errors_count, 1);
    assert_eq!(entry.errors[0].class, ErrorClass::ExtractionFailed);
    assert_eq!(entry.status, RunStatus::CompletedWithErrors);
    let unclassified = h.store.unclassified(100).await.unwrap();
    assert_eq!(unclassified.len(), 15);
}

#[tokio::test]
async fn free_tier_digest_surfaces_cap_and_retires_every_candidate() {
    let store = Arc::new(MemoryStore::new());
    let mut sub = subscriber(AccountStatus::Trial, "gifu", None);
    sub.trial_ends_at = Some(Utc::now() - Duration::days(1));
    store.insert_subscriber(sub.clone()).await;
    for i in 0..50u8 {
        let opp = seeded("gifu", &format!("業務委託{i}"), None, i64::from(i));
        store
            .upsert_match_by_key(&MatchUpsert {
                subscriber_id: sub.id,
                opportunity_id: opp.id,
                score: 50 + i,
                reason: Some("対応可能".into()),
                risk_notes: None,
                recommendation: None,
                action_items: Vec::new(),
                rank_position: u32::from(50 - i),
            })
            .await
            .unwrap();
        store.insert_opportunity(opp).await;
    }
    // under threshold, never offered
    let low = seeded("gifu", "参考案件", None, 0);
    store
        .upsert_match_by_key(&MatchUpsert {
            subscriber_id: sub.id,
            opportunity_id: low.id,
            score: 12,
            reason: None,
            risk_notes: None,
            recommendation: None,
            action_items: Vec::new(),
            rank_position: 51,
        })
        .await
        .unwrap();
    store.insert_opportunity(low.clone()).await;

    let mut config = quiet_config();
    config.notification.free_cap = 10;
    let h = harness(config, store, ListScraper::default(), MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Notify]).await.unwrap();

    assert_eq!(entry.counters.notifications_sent, 1);
    {
        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "bids@example.jp");
        assert_eq!(sent[0].html.matches("class=\"item\"").count(), 10);
        assert!(sent[0].html.contains("残り40件"));
        assert!(sent[0].html.contains("業務委託49"));
        assert!(!sent[0].html.contains("業務委託39"));
    }
    let matches = h.store.matches_for(sub.id).await;
    assert_eq!(matches.iter().filter(|m| m.notified).count(), 50);
    assert!(!matches.iter().any(|m| m.opportunity_id == low.id && m.notified));

    let again = h.pipeline.run_phases(&[Phase::Notify]).await.unwrap();
    assert_eq!(again.counters.notifications_sent, 0);
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);

    let statuses: Vec<_> = h
        .store
        .notifications()
        .await
        .iter()
        .map(|n| (n.status, n.opportunities_count))
        .collect();
    assert_eq!(
        statuses,
        vec![(NotificationStatus::Sent, 10), (NotificationStatus::Skipped, 0)]
    );
}

#[tokio::test]
async fn opted_out_subscriber_gets_nothing() {
    let store = Arc::new(MemoryStore::new());
    let mut sub = subscriber(AccountStatus::Active, "gifu", None);
    sub.email_notify = false;
    store.insert_subscriber(sub.clone()).await;
    let opp = seeded("gifu", "公園管理業務", None, 0);
    store
        .upsert_match_by_key(&MatchUpsert {
            subscriber_id: sub.id,
            opportunity_id: opp.id,
            score: 95,
            reason: None,
            risk_notes: None,
            recommendation: None,
            action_items: Vec::new(),
            rank_position: 1,
        })
        .await
        .unwrap();
    store.insert_opportunity(opp).await;
    let h = harness(quiet_config(), store, ListScraper::default(), MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Notify]).await.unwrap();

    assert_eq!(entry.status, RunStatus::Completed);
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert!(h.store.notifications().await.is_empty());
    assert!(!h.store.matches_for(sub.id).await[0].notified);
}

#[tokio::test]
async fn failing_source_does_not_stop_its_sibling() {
    let store = Arc::new(MemoryStore::new());
    let ok = source("ogaki-city", "gifu");
    let down = source("gifu-pref", "gifu");
    store.insert_source(ok.clone()).await;
    store.insert_source(down.clone()).await;
    store
        .insert_subscriber(subscriber(AccountStatus::Active, "gifu", None))
        .await;

    let mut scraper = ListScraper::default();
    scraper
        .drafts
        .insert(ok.id.clone(), vec![draft(&ok, "学校給食運搬業務", None)]);
    scraper.failing.insert(down.id.clone());
    let h = harness(quiet_config(), store, scraper, MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Scrape]).await.unwrap();

    assert_eq!(entry.counters.sources_scraped, 1);
    assert_eq!(entry.counters.sources_failed, 1);
    assert_eq!(entry.counters.opportunities_saved, 1);
    assert_eq!(entry.errors[0].class, ErrorClass::FetchFailed);
    assert_eq!(entry.status, RunStatus::CompletedWithErrors);
    assert_eq!(h.store.source(&down.id).await.unwrap().consecutive_failures, 1);
    assert!(h.store.source(&ok.id).await.unwrap().last_success_at.is_some());
}

#[tokio::test]
async fn unfollowed_areas_are_not_scraped() {
    let store = Arc::new(MemoryStore::new());
    let followed = source("gifu-city", "gifu");
    let ignored = source("tsu-city", "mie");
    store.insert_source(followed.clone()).await;
    store.insert_source(ignored.clone()).await;
    store
        .insert_subscriber(subscriber(AccountStatus::Active, "gifu", None))
        .await;
    let mut scraper = ListScraper::default();
    scraper.failing.insert(ignored.id.clone());
    let h = harness(quiet_config(), store, scraper, MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Scrape]).await.unwrap();

    assert_eq!(entry.counters.sources_scraped, 1);
    assert_eq!(entry.counters.sources_failed, 0);
    assert!(h.store.source(&ignored.id).await.unwrap().last_checked_at.is_none());
}

#[tokio::test]
async fn full_run_ranks_matches_and_sends_analysed_digest() {
    let store = Arc::new(MemoryStore::new());
    let src = source("gifu-city", "gifu");
    store.insert_source(src.clone()).await;
    let sub = subscriber(AccountStatus::Active, "gifu", Some(profile()));
    store.insert_subscriber(sub.clone()).await;

    let mut pages = MapPages::default();
    let mut drafts = Vec::new();
    for i in 0..3 {
        let url = format!("https://gifu-city.example.jp/nyusatsu/{i}.html");
        pages.pages.insert(url.clone(), GOOD_PAGE.into());
        drafts.push(draft(&src, &format!("市道補修工事{i}"), Some(url.as_str())));
    }
    let mut scraper = ListScraper::default();
    scraper.drafts.insert(src.id.clone(), drafts);
    let h = harness(quiet_config(), store, scraper, pages, ScriptedLlm::default());

    let entry = h.pipeline.run_once().await.unwrap();

    assert_eq!(entry.status, RunStatus::Completed, "{:?}", entry.errors);
    assert_eq!(entry.counters.opportunities_saved, 3);
    assert_eq!(entry.counters.records_enriched, 3);
    assert_eq!(entry.counters.records_classified, 3);
    assert_eq!(entry.counters.matches_created, 3);
    assert_eq!(entry.counters.notifications_sent, 1);
    assert_eq!(*h.llm.match_calls.lock().unwrap(), 1);

    let mut matches = h.store.matches_for(sub.id).await;
    matches.sort_by_key(|m| m.rank_position);
    let ranked: Vec<(Option<u32>, u8)> = matches.iter().map(|m| (m.rank_position, m.score)).collect();
    assert_eq!(ranked, vec![(Some(1), 90), (Some(2), 70), (Some(3), 70)]);
    assert!(matches.iter().all(|m| m.notified && m.detailed_analysis.is_some()));

    let sent = h.mailer.sent.lock().unwrap();
    assert!(sent[0].html.contains("現場説明会に参加する"));
    assert_eq!(sent[0].from, "Tender Digest <noreply@example.jp>");
    assert_eq!(h.store.runs().await.len(), 1);
}

#[tokio::test]
async fn new_subscriber_is_screened_against_recent_window() {
    let store = Arc::new(MemoryStore::new());
    let mut sub = subscriber(AccountStatus::Trial, "gifu", Some(profile()));
    sub.initial_screening_done = false;
    sub.trial_started_at = Some(Utc::now() - Duration::days(1));
    store.insert_subscriber(sub.clone()).await;
    store
        .insert_opportunity(seeded("gifu", "河川維持工事", None, 60 * 24 * 3))
        .await;
    store
        .insert_opportunity(seeded("gifu", "旧年度の工事", None, 60 * 24 * 45))
        .await;
    let h = harness(quiet_config(), store, ListScraper::default(), MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Match]).await.unwrap();

    assert!(h.store.subscriber(sub.id).await.unwrap().initial_screening_done);
    let matches = h.store.matches_for(sub.id).await;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].rank_position, Some(1));
    assert_eq!(entry.counters.matches_created, 1);
}

#[tokio::test]
async fn placeholder_detail_page_counts_as_fetch_failure() {
    let store = Arc::new(MemoryStore::new());
    let url = "https://city.example.jp/koukoku/junbi.html".to_string();
    let opp = seeded("gifu", "体育館改修工事", Some(url.clone()), 0);
    let id = opp.id;
    store.insert_opportunity(opp).await;
    let mut pages = MapPages::default();
    pages.pages.insert(url, "<html><body>準備中</body></html>".into());
    let h = harness(quiet_config(), store, ListScraper::default(), pages, ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Enrich]).await.unwrap();

    assert_eq!(entry.counters.enrichment.fetch_failed, 1);
    assert_eq!(entry.counters.enrichment.extraction_failed, 0);
    assert_eq!(entry.errors[0].class, ErrorClass::FetchFailed);
    assert!(h.store.opportunity(id).await.unwrap().detail_fetched_at.is_none());
}

#[tokio::test]
async fn shared_dead_url_is_fetched_once() {
    let store = Arc::new(MemoryStore::new());
    let url = "https://city.example.jp/nyusatsu/list.html".to_string();
    for i in 0..4 {
        store
            .insert_opportunity(seeded("gifu", &format!("除雪業務{i}"), Some(url.clone()), i))
            .await;
    }
    let mut config = quiet_config();
    config.enrichment.workers = 1;
    let h = harness(config, store, ListScraper::default(), MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Enrich]).await.unwrap();

    assert_eq!(*h.pages.calls.lock().unwrap(), vec![url]);
    assert_eq!(entry.counters.enrichment.fetch_failed, 4);
    assert_eq!(entry.counters.errors_count, 4);
}

/// Seeds an opportunity with an unnotified match for `sub`.
async fn pending(store: &MemoryStore, sub: &Subscriber, title: &str, score: u8) -> Uuid {
    let opp = seeded("gifu", title, None, 0);
    let id = opp.id;
    store
        .upsert_match_by_key(&MatchUpsert {
            subscriber_id: sub.id,
            opportunity_id: id,
            score,
            reason: None,
            risk_notes: None,
            recommendation: None,
            action_items: Vec::new(),
            rank_position: 1,
        })
        .await
        .unwrap();
    store.insert_opportunity(opp).await;
    id
}

#[tokio::test]
async fn refused_digest_leaves_matches_pending_and_next_subscriber_is_served() {
    let store = Arc::new(MemoryStore::new());
    let mut refused = subscriber(AccountStatus::Active, "gifu", None);
    refused.notification_email = Some("closed@example.jp".into());
    let served = subscriber(AccountStatus::Active, "gifu", None);
    store.insert_subscriber(refused.clone()).await;
    store.insert_subscriber(served.clone()).await;
    pending(&store, &refused, "街路灯保守業務", 80).await;
    pending(&store, &refused, "橋梁点検業務", 75).await;
    pending(&store, &served, "公民館清掃業務", 90).await;
    let h = harness(quiet_config(), store, ListScraper::default(), MapPages::default(), ScriptedLlm::default());
    h.mailer.refuse.lock().unwrap().insert("closed@example.jp".into());

    let entry = h.pipeline.run_phases(&[Phase::Notify]).await.unwrap();

    assert_eq!(entry.counters.notifications_sent, 1);
    assert_eq!(entry.status, RunStatus::CompletedWithErrors);
    assert_eq!(entry.errors[0].class, ErrorClass::FetchFailed);
    {
        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].html.contains("公民館清掃業務"));
    }

    let refused_matches = h.store.matches_for(refused.id).await;
    assert_eq!(refused_matches.len(), 2);
    assert!(refused_matches.iter().all(|m| !m.notified));
    assert!(h.store.matches_for(served.id).await[0].notified);

    let logs = h.store.notifications().await;
    let refused_log = logs.iter().find(|n| n.subscriber_id == refused.id).unwrap();
    assert_eq!(refused_log.status, NotificationStatus::Failed);
    let served_log = logs.iter().find(|n| n.subscriber_id == served.id).unwrap();
    assert_eq!(served_log.status, NotificationStatus::Sent);
}

#[tokio::test]
async fn missing_address_fails_before_any_analysis_call() {
    let store = Arc::new(MemoryStore::new());
    let mut sub = subscriber(AccountStatus::Active, "gifu", Some(profile()));
    sub.notification_email = None;
    store.insert_subscriber(sub.clone()).await;
    pending(&store, &sub, "上水道管更新工事", 88).await;
    let h = harness(quiet_config(), store, ListScraper::default(), MapPages::default(), ScriptedLlm::default());

    let entry = h.pipeline.run_phases(&[Phase::Notify]).await.unwrap();

    assert_eq!(*h.llm.analysis_calls.lock().unwrap(), 0);
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert_eq!(entry.counters.notifications_sent, 0);
    assert_eq!(entry.errors[0].class, ErrorClass::FetchFailed);
    let logs = h.store.notifications().await;
    assert_eq!(logs[0].status, NotificationStatus::Failed);
    assert_eq!(logs[0].opportunities_count, 1);
    assert!(!h.store.matches_for(sub.id).await[0].notified);
}

fn assert_send<T: Send>(_: &T) {}

#[test]
fn scheduled_run_future_is_send() {
    let h = harness(
        quiet_config(),
        Arc::new(MemoryStore::new()),
        ListScraper::default(),
        MapPages::default(),
        ScriptedLlm::default(),
    );
    let run = h.pipeline.run_once();
    assert_send(&run);
}
