use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use ptm_core::{parse_strict_date, truncate_chars, truncate_with_ellipsis, DataSource, OpportunityDraft};
use ptm_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

use crate::llm::{generate_json, LlmClient};
use crate::page::PageSource;
use crate::prompts::{listing_request, parse_listing, ListingItem};
use crate::text::{html_to_text, TextOptions};
use crate::AdapterError;

pub const KKJ_NOTES_TAG: &str = "api:kkj";
const KKJ_DETAIL_BASE: &str = "https://www.kkj.go.jp/d/";
const MAX_TITLE_CHARS: usize = 500;
const MAX_KKJ_SUMMARY_CHARS: usize = 200;

/// The scrape collaborator: one data source in, listing drafts out.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    async fn scrape(&self, source: &DataSource) -> Result<Vec<OpportunityDraft>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeStrategy {
    ListingExtraction,
    KkjApi,
}

impl ScrapeStrategy {
    /// A source opts into a structured API through its notes.
    pub fn for_source(source: &DataSource) -> Self {
        match source.notes.as_deref() {
            Some(notes) if notes.contains(KKJ_NOTES_TAG) => Self::KkjApi,
            _ => Self::ListingExtraction,
        }
    }
}

fn resolve_against(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

fn draft_from_listing(source: &DataSource, item: ListingItem) -> Option<OpportunityDraft> {
    let title = truncate_chars(item.title?.trim(), MAX_TITLE_CHARS);
    if title.is_empty() {
        return None;
    }
    Some(OpportunityDraft {
        area_id: source.area_id.clone(),
        source_id: source.id.clone(),
        title,
        organization: item.organization,
        category: item.category,
        method: item.method,
        deadline: item.deadline.as_deref().and_then(parse_strict_date),
        budget: item.budget,
        summary: item.summary,
        requirements: item.requirements,
        detail_url: item.detail_url.map(|href| resolve_against(&source.url, &href)),
    })
}

/// Fetch the source page, flatten it to text with a link appendix, and ask the
/// LLM for the opportunity list.
pub struct LlmListingScraper {
    pages: Arc<dyn PageSource>,
    llm: Arc<dyn LlmClient>,
    max_text_chars: usize,
}

impl LlmListingScraper {
    pub fn new(pages: Arc<dyn PageSource>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            pages,
            llm,
            max_text_chars: TextOptions::default().max_chars,
        }
    }

    pub fn with_max_text_chars(mut self, max_text_chars: usize) -> Self {
        self.max_text_chars = max_text_chars;
        self
    }
}

#[async_trait]
impl SourceScraper for LlmListingScraper {
    async fn scrape(&self, source: &DataSource) -> Result<Vec<OpportunityDraft>, AdapterError> {
        if source.url.trim().is_empty() {
            return Err(AdapterError::InvalidSource {
                source_id: source.id.clone(),
                reason: "empty url".to_string(),
            });
        }
        let page = self.pages.fetch(&source.id, &source.url).await?;
        let options = TextOptions {
            max_chars: self.max_text_chars,
            ..TextOptions::listing(&page.url)
        };
        let text = html_to_text(&page.html(), &options)?;
        if text.trim().is_empty() {
            debug!(source_id = %source.id, "listing page has no text");
            return Ok(Vec::new());
        }

        let value = generate_json(self.llm.as_ref(), &listing_request(&source.name, &source.url, &text)).await?;
        let drafts: Vec<_> = parse_listing(value)?
            .into_iter()
            .filter_map(|item| draft_from_listing(source, item))
            .collect();
        info!(source_id = %source.id, drafts = drafts.len(), "listing extracted");
        Ok(drafts)
    }
}

/// The national procurement portal's XML search API.
pub struct KkjApiScraper {
    http: Arc<HttpFetcher>,
    window_days: i64,
}

impl KkjApiScraper {
    pub fn new(http: Arc<HttpFetcher>, window_days: i64) -> Self {
        Self { http, window_days }
    }

    /// Keeps the configured `LG_Code` and sets the date window ending `today`.
    pub fn request_url(&self, source: &DataSource, today: NaiveDate) -> Result<String, AdapterError> {
        let invalid = |reason: &str| AdapterError::InvalidSource {
            source_id: source.id.clone(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(&source.url).map_err(|e| invalid(&e.to_string()))?;
        let lg_code = url
            .query_pairs()
            .find(|(k, _)| k == "LG_Code")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| invalid("missing LG_Code"))?;
        let start = today - Duration::days(self.window_days);
        url.query_pairs_mut()
            .clear()
            .append_pair("LG_Code", &lg_code)
            .append_pair("Start_Date", &start.format("%Y-%m-%d").to_string())
            .append_pair("End_Date", &today.format("%Y-%m-%d").to_string());
        Ok(url.to_string())
    }
}

#[async_trait]
impl SourceScraper for KkjApiScraper {
    async fn scrape(&self, source: &DataSource) -> Result<Vec<OpportunityDraft>, AdapterError> {
        let url = self.request_url(source, Utc::now().date_naive())?;
        let resp = self.http.fetch_bytes(&source.id, &url).await?;
        let drafts = parse_kkj_xml(&resp.text(), source)?;
        info!(source_id = %source.id, drafts = drafts.len(), "kkj results parsed");
        Ok(drafts)
    }
}

/// Direct text of the first matching child; nested elements are ignored so an
/// unclosed sibling never leaks into the value.
fn child_text(parent: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let element = parent.select(selector).next()?;
    let text: String = element
        .children()
        .filter_map(|c| c.value().as_text().map(|t| t.to_string()))
        .collect();
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn map_kkj_category(raw: Option<String>) -> String {
    match raw.as_deref() {
        Some("物品") => "物品".to_string(),
        Some("工事") => "建設".to_string(),
        Some("役務") => "サービス".to_string(),
        Some(other) => other.to_string(),
        None => "その他".to_string(),
    }
}

fn map_kkj_method(raw: Option<String>) -> String {
    let Some(raw) = raw else {
        return "不明".to_string();
    };
    if raw.contains("一般競争") {
        "一般競争入札".to_string()
    } else if raw.contains("指名") {
        "指名競争入札".to_string()
    } else if raw.contains("随意") {
        "随意契約".to_string()
    } else if raw.contains("公募") || raw.contains("プロポーザル") || raw.contains("企画") {
        "公募型プロポーザル".to_string()
    } else {
        raw
    }
}

fn strip_case_numbers(text: &str) -> String {
    const MARK: &str = "調達案件番号";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(MARK) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + MARK.len()..];
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            out.push_str(MARK);
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

fn clean_kkj_summary(raw: Option<String>, title: &str) -> Option<String> {
    let raw = raw?;
    let text = raw.trim();
    let text = text.strip_prefix(title).unwrap_or(text);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = strip_case_numbers(&collapsed);
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| truncate_with_ellipsis(cleaned, MAX_KKJ_SUMMARY_CHARS))
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

pub fn parse_kkj_xml(xml: &str, source: &DataSource) -> Result<Vec<OpportunityDraft>, AdapterError> {
    let document = Html::parse_fragment(xml);
    let result_sel = selector("searchresult")?;
    let name_sel = selector("projectname")?;
    let org_sel = selector("organizationname")?;
    let category_sel = selector("category")?;
    let procedure_sel = selector("proceduretype")?;
    let key_sel = selector("key")?;
    let external_sel = selector("externaldocumenturi")?;
    let cert_sel = selector("certification")?;
    let description_sel = selector("projectdescription")?;

    let mut drafts = Vec::new();
    for item in document.select(&result_sel) {
        let Some(title) = child_text(item, &name_sel) else {
            continue;
        };
        let title = truncate_chars(&title, MAX_TITLE_CHARS);
        let detail_url = match child_text(item, &key_sel) {
            Some(key) => {
                let mut url = Url::parse(KKJ_DETAIL_BASE).map_err(|e| AdapterError::Message(e.to_string()))?;
                url.query_pairs_mut().append_pair("A", &key).append_pair("L", "ja");
                Some(url.to_string())
            }
            None => child_text(item, &external_sel),
        };
        drafts.push(OpportunityDraft {
            area_id: source.area_id.clone(),
            source_id: source.id.clone(),
            organization: child_text(item, &org_sel),
            category: Some(map_kkj_category(child_text(item, &category_sel))),
            method: Some(map_kkj_method(child_text(item, &procedure_sel))),
            deadline: None,
            budget: None,
            summary: clean_kkj_summary(child_text(item, &description_sel), &title),
            requirements: child_text(item, &cert_sel),
            detail_url,
            title,
        });
    }
    Ok(drafts)
}

/// Routes each source to its strategy.
pub struct ScraperRegistry {
    listing: Arc<dyn SourceScraper>,
    kkj: Arc<dyn SourceScraper>,
}

impl ScraperRegistry {
    pub fn new(listing: Arc<dyn SourceScraper>, kkj: Arc<dyn SourceScraper>) -> Self {
        Self { listing, kkj }
    }
}

#[async_trait]
impl SourceScraper for ScraperRegistry {
    async fn scrape(&self, source: &DataSource) -> Result<Vec<OpportunityDraft>, AdapterError> {
        match ScrapeStrategy::for_source(source) {
            ScrapeStrategy::KkjApi => self.kkj.scrape(source).await,
            ScrapeStrategy::ListingExtraction => self.listing.scrape(source).await,
        }
    }
}
