use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::AdapterError;

const SKIPPED_TAGS: [&str; 4] = ["script", "style", "noscript", "iframe"];
const LINK_HEADER: &str = "\n\n--- ページ内リンク ---\n";
pub const TRUNCATION_MARKER: &str = "\n...(以下省略)";

#[derive(Debug, Clone)]
pub struct TextOptions {
    /// Append a `[text](url)` appendix of in-page links.
    pub include_links: bool,
    /// Relative links are resolved against this URL.
    pub base_url: Option<String>,
    pub max_links: usize,
    pub min_link_text_chars: usize,
    pub max_chars: usize,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            include_links: false,
            base_url: None,
            max_links: 200,
            min_link_text_chars: 3,
            max_chars: 30_000,
        }
    }
}

impl TextOptions {
    pub fn listing(base_url: &str) -> Self {
        Self {
            include_links: true,
            base_url: Some(base_url.to_string()),
            ..Self::default()
        }
    }

    pub fn detail(max_chars: usize) -> Self {
        Self {
            max_chars,
            ..Self::default()
        }
    }
}

fn collect_lines(element: ElementRef<'_>, lines: &mut Vec<String>) {
    if SKIPPED_TAGS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        } else if let Some(child_element) = ElementRef::wrap(child) {
            collect_lines(child_element, lines);
        }
    }
}

fn resolve_href(base: Option<&Url>, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match base.and_then(|b| b.join(href).ok()) {
        Some(joined) => joined.to_string(),
        None => href.to_string(),
    }
}

/// Cap `text` at `max_chars` characters, marking the cut.
pub fn cap_text(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut capped: String = text.chars().take(max_chars).collect();
    capped.push_str(TRUNCATION_MARKER);
    capped
}

/// Plain text of an HTML page, one trimmed text node per line.
pub fn html_to_text(html: &str, options: &TextOptions) -> Result<String, AdapterError> {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();
    collect_lines(document.root_element(), &mut lines);
    let mut text = lines.join("\n");

    if options.include_links {
        let anchors = Selector::parse("a[href]").map_err(|e| AdapterError::Message(e.to_string()))?;
        let base = options.base_url.as_deref().and_then(|b| Url::parse(b).ok());
        let links: Vec<String> = document
            .select(&anchors)
            .filter_map(|a| {
                let href = a.value().attr("href")?;
                let label = a.text().collect::<String>();
                let label = label.trim();
                if label.chars().count() < options.min_link_text_chars {
                    return None;
                }
                Some(format!("[{label}]({})", resolve_href(base.as_ref(), href.trim())))
            })
            .take(options.max_links)
            .collect();
        if !links.is_empty() {
            text.push_str(LINK_HEADER);
            text.push_str(&links.join("\n"));
        }
    }

    Ok(cap_text(text, options.max_chars))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>入札情報</title><style>body{color:red}</style></head>
<body>
  <script>var tracking = 1;</script>
  <h1>令和8年度 入札公告</h1>
  <p>庁舎清掃業務委託</p>
  <a href="/nyusatsu/001.html">庁舎清掃業務委託の詳細</a>
  <a href="https://example.go.jp/abs.html">道路補修工事</a>
  <a href="/top">TOP</a>
</body></html>"#;

    #[test]
    fn drops_script_and_style_content() {
        let text = html_to_text(PAGE, &TextOptions::default()).unwrap();
        assert!(text.contains("令和8年度 入札公告"));
        assert!(text.contains("庁舎清掃業務委託"));
        assert!(!text.contains("tracking"));
        assert!(!text.contains("color:red"));
        assert!(!text.contains("ページ内リンク"));
    }

    #[test]
    fn link_appendix_resolves_relative_links_and_skips_short_labels() {
        let text = html_to_text(PAGE, &TextOptions::listing("https://www.pref.example.jp/bid/")).unwrap();
        assert!(text.contains("[庁舎清掃業務委託の詳細](https://www.pref.example.jp/nyusatsu/001.html)"));
        assert!(text.contains("[道路補修工事](https://example.go.jp/abs.html)"));
        assert!(!text.contains("[TOP]"));
    }

    #[test]
    fn long_text_is_capped_with_marker() {
        let body = format!("<p>{}</p>", "あ".repeat(50));
        let text = html_to_text(&body, &TextOptions::detail(10)).unwrap();
        assert_eq!(text, format!("{}{}", "あ".repeat(10), TRUNCATION_MARKER));
    }
}
