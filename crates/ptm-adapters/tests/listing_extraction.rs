use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ptm_adapters::{
    HttpPageSource, LlmClient, LlmError, LlmListingScraper, LlmRequest, SourceScraper,
};
use ptm_core::DataSource;
use ptm_storage::{HttpClientConfig, HttpFetcher};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Replays one canned answer and keeps the prompts it was shown.
struct CannedLlm {
    answer: String,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl LlmClient for CannedLlm {
    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(self.answer.clone())
    }
}

fn source(url: String) -> DataSource {
    DataSource {
        id: "gifu-pref".into(),
        area_id: "gifu".into(),
        name: "岐阜県 入札情報".into(),
        url,
        active: true,
        consecutive_failures: 0,
        last_checked_at: None,
        last_success_at: None,
        notes: None,
    }
}

#[tokio::test]
async fn listing_page_becomes_drafts_with_resolved_links() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bid/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><h2>入札公告</h2>
            <a href="/bid/d/77.html">橋梁点検業務委託</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let llm = Arc::new(CannedLlm {
        answer: r#"```json
[
  {"title": "橋梁点検業務委託", "organization": "岐阜県", "deadline": "2026-07-01", "detail_url": "/bid/d/77.html"},
  {"title": "", "organization": "岐阜県"}
]
```"#
            .into(),
        prompts: Mutex::new(Vec::new()),
    });
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let scraper = LlmListingScraper::new(Arc::new(HttpPageSource::new(http)), llm.clone());

    let src = source(format!("{}/bid/index.html", server.uri()));
    let drafts = scraper.scrape(&src).await.unwrap();

    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].title, "橋梁点検業務委託");
    assert_eq!(drafts[0].source_id, "gifu-pref");
    assert_eq!(drafts[0].deadline.map(|d| d.to_string()).as_deref(), Some("2026-07-01"));
    assert_eq!(
        drafts[0].detail_url.as_deref(),
        Some(format!("{}/bid/d/77.html", server.uri()).as_str())
    );

    let prompts = llm.prompts.lock().unwrap();
    assert!(prompts[0].contains("ページ内リンク"));
    assert!(prompts[0].contains("岐阜県 入札情報"));
}

#[tokio::test]
async fn unreachable_listing_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let llm = Arc::new(CannedLlm {
        answer: "[]".into(),
        prompts: Mutex::new(Vec::new()),
    });
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let scraper = LlmListingScraper::new(Arc::new(HttpPageSource::new(http)), llm.clone());

    let err = scraper
        .scrape(&source(format!("{}/missing", server.uri())))
        .await
        .unwrap_err();
    assert!(err.is_fetch());
    assert!(llm.prompts.lock().unwrap().is_empty());
}
