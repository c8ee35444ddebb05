//! Call-site prompts and response shapes for the LLM collaborator.
//!
//! Parsers are lenient about field types (a score may arrive as `"85"`) but
//! strict about the outer shape: an object where an array is expected is an
//! error for that call.

use ptm_core::{BusinessProfile, IndustryCategory, MatchAnalysis, Opportunity};
use serde_json::{json, Map, Value as JsonValue};

use crate::llm::{LlmError, LlmRequest};

pub const DETAIL_MAX_TOKENS: u32 = 1024;
pub const LISTING_MAX_TOKENS: u32 = 8192;
pub const CLASSIFY_MAX_TOKENS: u32 = 4096;
pub const MATCH_MAX_TOKENS: u32 = 16384;
pub const ANALYSIS_MAX_TOKENS: u32 = 2048;

/// Non-empty trimmed text from a string or number.
pub fn value_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty() && trimmed != "null").then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn expect_array(value: JsonValue, call_site: &str) -> Result<Vec<JsonValue>, LlmError> {
    match value {
        JsonValue::Array(items) => Ok(items),
        other => Err(LlmError::Malformed(format!(
            "{call_site}: expected array, got {}",
            kind(&other)
        ))),
    }
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// detail enrichment

pub fn detail_request(title: &str, page_text: &str) -> LlmRequest {
    let prompt = format!(
        r#"公募・入札案件の詳細ページから情報を抜き出し、次のキーを持つJSONオブジェクトだけを返してください。
ページに無い項目は null にしてください。日付はすべて YYYY-MM-DD 形式です。

案件名: {title}

{{
  "published_date": "公告日",
  "deadline": "提出・入札の締切日",
  "bid_opening_date": "開札日",
  "briefing_date": "説明会の日付",
  "budget": "予算や予定価格（例: 1,200万円）",
  "requirements": "参加資格の要約（50文字程度）",
  "contract_period": "契約・履行期間",
  "contact_info": "問い合わせ先",
  "detailed_summary": "業務内容の要約（200文字以内）",
  "difficulty": "参入難易度。高・中・低のいずれか（高=特殊資格や大規模実績が必要、中=一般的な資格で可、低=資格不要）"
}}

ページ本文:
{page_text}"#
    );
    LlmRequest::json(prompt, DETAIL_MAX_TOKENS)
}

/// The raw detail object; field validation happens at the persistence boundary.
pub fn parse_detail(value: JsonValue) -> Result<Map<String, JsonValue>, LlmError> {
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(LlmError::Malformed(format!(
            "detail: expected object, got {}",
            kind(&other)
        ))),
    }
}

// listing extraction

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingItem {
    pub title: Option<String>,
    pub organization: Option<String>,
    pub category: Option<String>,
    pub method: Option<String>,
    pub deadline: Option<String>,
    pub budget: Option<String>,
    pub summary: Option<String>,
    pub requirements: Option<String>,
    pub detail_url: Option<String>,
}

pub fn listing_request(source_name: &str, source_url: &str, page_text: &str) -> LlmRequest {
    let prompt = format!(
        r#"次は「{source_name}」のページ本文です。公募・入札・調達・業務委託・プロポーザルの案件をすべて抜き出し、JSON配列で返してください。
案件が無ければ [] を返してください。メニューやフッターなど案件以外の記述は無視してください。

各要素の形式:
{{
  "title": "案件名",
  "organization": "発注機関",
  "category": "IT/建設/物品/サービス/コンサル/清掃/警備/印刷/イベント/その他",
  "deadline": "締切日 YYYY-MM-DD（不明なら null）",
  "budget": "予算（不明なら null）",
  "summary": "概要（100文字以内）",
  "detail_url": "詳細ページの絶対URL。相対URLは {source_url} を基準に解決（不明なら null）",
  "requirements": "参加資格（無ければ null）",
  "method": "一般競争入札/指名競争入札/随意契約/公募型プロポーザル/企画競争/不明"
}}

ページ本文:
{page_text}"#
    );
    LlmRequest::json(prompt, LISTING_MAX_TOKENS)
}

pub fn parse_listing(value: JsonValue) -> Result<Vec<ListingItem>, LlmError> {
    Ok(expect_array(value, "listing")?
        .iter()
        .filter(|item| item.is_object())
        .map(|item| ListingItem {
            title: value_text(item.get("title")),
            organization: value_text(item.get("organization")),
            category: value_text(item.get("category")),
            method: value_text(item.get("method")),
            deadline: value_text(item.get("deadline")),
            budget: value_text(item.get("budget")),
            summary: value_text(item.get("summary")),
            requirements: value_text(item.get("requirements")),
            detail_url: value_text(item.get("detail_url")),
        })
        .collect())
}

// industry classification

/// 1-based position in the submitted batch paired with the answered label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationItem {
    pub index: usize,
    pub category: String,
}

pub fn classification_request(batch: &[Opportunity]) -> LlmRequest {
    let categories = IndustryCategory::ALL
        .iter()
        .map(|c| c.label())
        .collect::<Vec<_>>()
        .join(" / ");
    let lines = batch
        .iter()
        .enumerate()
        .map(|(i, opp)| {
            let summary: String = opp.summary.as_deref().unwrap_or("").chars().take(100).collect();
            format!(
                "{}. タイトル: {} / 分類: {} / 要約: {}",
                i + 1,
                opp.title,
                opp.category.as_deref().unwrap_or(""),
                summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        r#"以下の公募・入札案件を、それぞれ次のカテゴリのどれか1つに分類してください。

カテゴリ: {categories}

案件:
{lines}

番号と分類をJSON配列で返してください。全{count}件分が必要です。
[{{"index": 1, "category": "カテゴリ名"}}]"#,
        count = batch.len()
    );
    LlmRequest::json(prompt, CLASSIFY_MAX_TOKENS)
}

pub fn parse_classification(value: JsonValue) -> Result<Vec<ClassificationItem>, LlmError> {
    Ok(expect_array(value, "classification")?
        .iter()
        .filter_map(|item| {
            let index = match item.get("index")? {
                JsonValue::Number(n) => usize::try_from(n.as_u64()?).ok()?,
                JsonValue::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            let category = value_text(item.get("category")).unwrap_or_default();
            Some(ClassificationItem { index, category })
        })
        .collect())
}

// matching

#[derive(Debug, Clone, PartialEq)]
pub struct MatchItem {
    pub id: String,
    pub score: u8,
    pub reason: Option<String>,
    pub risk_notes: Option<String>,
    pub recommendation: Option<String>,
    pub action_items: Vec<String>,
}

fn profile_json(profile: &BusinessProfile) -> JsonValue {
    json!({
        "company_name": profile.company_name,
        "business_areas": profile.business_areas,
        "services": profile.services,
        "strengths": profile.strengths,
        "qualifications": profile.qualifications,
        "matching_keywords": profile.matching_keywords,
    })
}

pub fn match_request(profile: &BusinessProfile, batch: &[Opportunity]) -> LlmRequest {
    let opportunities: Vec<JsonValue> = batch
        .iter()
        .map(|opp| {
            json!({
                "id": opp.id.to_string(),
                "title": opp.title,
                "organization": opp.organization,
                "category": opp.category,
                "method": opp.method,
                "budget": opp.budget,
                "summary": opp.summary,
                "requirements": opp.requirements,
            })
        })
        .collect();
    let company = serde_json::to_string_pretty(&profile_json(profile)).unwrap_or_default();
    let listing = serde_json::to_string_pretty(&opportunities).unwrap_or_default();
    let prompt = format!(
        r#"会社プロフィールと公募・入札案件リストを照らし合わせ、案件ごとの適合度を判定してください。

## 会社プロフィール
{company}

## 案件リスト
{listing}

## 出力（JSON配列）
[
  {{
    "id": "入力のidをそのまま",
    "match_score": 0〜100の整数,
    "match_reason": "適合の理由（50文字以内）",
    "risk_notes": "注意点（無ければ null）",
    "recommendation": "強く推奨/推奨/検討可/非推奨",
    "action_items": ["次にやること"]
  }}
]

目安: 80以上=事業内容とよく合う、60〜79=対応可能、40〜59=一部関連、39以下=関連が薄い。
全件を判定してください。"#
    );
    LlmRequest::json(prompt, MATCH_MAX_TOKENS)
}

fn score_of(value: Option<&JsonValue>) -> Option<u8> {
    let raw = match value? {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items.iter().filter_map(|v| value_text(Some(v))).collect(),
        Some(other) => value_text(Some(other)).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Items without an id or a usable score are dropped.
pub fn parse_matches(value: JsonValue) -> Result<Vec<MatchItem>, LlmError> {
    Ok(expect_array(value, "match")?
        .iter()
        .filter_map(|item| {
            Some(MatchItem {
                id: value_text(item.get("id").or_else(|| item.get("opportunity_id")))?,
                score: score_of(item.get("match_score"))?,
                reason: value_text(item.get("match_reason")),
                risk_notes: value_text(item.get("risk_notes")),
                recommendation: value_text(item.get("recommendation")),
                action_items: string_list(item.get("action_items")),
            })
        })
        .collect())
}

// per-match analysis

pub fn analysis_request(profile: &BusinessProfile, opp: &Opportunity) -> LlmRequest {
    let unknown = "不明";
    let deadline = opp.deadline.map(|d| d.to_string());
    let summary = opp.detailed_summary.as_deref().or(opp.summary.as_deref());
    let prompt = format!(
        r#"公募案件と企業プロフィールを比較し、詳しい分析をJSONオブジェクトで返してください。

【案件】
タイトル: {title}
カテゴリ: {category}
発注機関: {organization}
業種: {industry}
締切: {deadline}
予算: {budget}
要約: {summary}

【企業】
会社名: {company}
事業分野: {areas}
サービス: {services}
強み: {strengths}

{{
  "summary": "総合評価（150文字程度）",
  "match_points": ["適合するポイント"],
  "concerns": ["懸念点"],
  "actions": ["取るべきアクション"]
}}"#,
        title = opp.title,
        category = opp.category.as_deref().unwrap_or(unknown),
        organization = opp.organization.as_deref().unwrap_or(unknown),
        industry = opp.industry_category.map(|c| c.label()).unwrap_or(unknown),
        deadline = deadline.as_deref().unwrap_or(unknown),
        budget = opp.budget.as_deref().unwrap_or(unknown),
        summary = summary.unwrap_or(unknown),
        company = profile.company_name.as_deref().unwrap_or(unknown),
        areas = profile.business_areas.join(", "),
        services = profile.services.join(", "),
        strengths = profile.strengths.join(", "),
    );
    LlmRequest::json(prompt, ANALYSIS_MAX_TOKENS)
}

pub fn parse_analysis(value: JsonValue) -> Result<MatchAnalysis, LlmError> {
    let map = match value {
        JsonValue::Object(map) => map,
        other => {
            return Err(LlmError::Malformed(format!(
                "analysis: expected object, got {}",
                kind(&other)
            )))
        }
    };
    Ok(MatchAnalysis {
        summary: value_text(map.get("summary")).unwrap_or_default(),
        match_points: string_list(map.get("match_points")),
        concerns: string_list(map.get("concerns")),
        actions: string_list(map.get("actions")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptm_core::OpportunityDraft;

    #[test]
    fn classification_accepts_numeric_and_string_indexes() {
        let items = parse_classification(json!([
            {"index": 1, "category": "IT・DX"},
            {"index": "2", "category": "宇宙"},
            {"category": "その他"}
        ]))
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], ClassificationItem { index: 2, category: "宇宙".into() });
    }

    #[test]
    fn match_scores_are_clamped_and_unscored_items_dropped() {
        let items = parse_matches(json!([
            {"id": "a", "match_score": 130, "action_items": ["仕様書を確認"]},
            {"id": "b", "match_score": "72"},
            {"id": "c"},
            {"match_score": 50}
        ]))
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].score, 100);
        assert_eq!(items[0].action_items, vec!["仕様書を確認".to_string()]);
        assert_eq!(items[1].score, 72);
    }

    #[test]
    fn wrong_outer_shape_is_an_error() {
        assert!(parse_matches(json!({"id": "a"})).is_err());
        assert!(parse_listing(json!("nothing")).is_err());
        assert!(parse_detail(json!([])).is_err());
        assert!(parse_analysis(json!(null)).is_err());
    }

    #[test]
    fn listing_values_are_trimmed_and_numbers_stringified() {
        let items = parse_listing(json!([
            {"title": "  庁舎清掃  ", "budget": 1200000, "deadline": null, "detail_url": ""}
        ]))
        .unwrap();
        assert_eq!(items[0].title.as_deref(), Some("庁舎清掃"));
        assert_eq!(items[0].budget.as_deref(), Some("1200000"));
        assert_eq!(items[0].deadline, None);
        assert_eq!(items[0].detail_url, None);
    }

    #[test]
    fn classification_prompt_numbers_items_from_one() {
        let batch: Vec<Opportunity> = ["庁舎清掃業務", "基幹システム更改"]
            .iter()
            .map(|title| {
                Opportunity::from_draft(
                    &OpportunityDraft {
                        area_id: "gifu".into(),
                        source_id: "gifu-city".into(),
                        title: (*title).into(),
                        ..Default::default()
                    },
                    chrono::Utc::now(),
                )
            })
            .collect();
        let request = classification_request(&batch);
        assert!(request.prompt.contains("1. タイトル: 庁舎清掃業務"));
        assert!(request.prompt.contains("2. タイトル: 基幹システム更改"));
        assert!(!request.prompt.contains("0. タイトル"));
        assert!(request.prompt.contains("全2件"));
        assert!(request.prompt.contains("環境・エネルギー"));
        assert_eq!(request.max_output_tokens, CLASSIFY_MAX_TOKENS);
    }
}
