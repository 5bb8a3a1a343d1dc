//! Text extraction for ingestion sources.
//!
//! Two collaborators live here:
//! - [`extract_document`] turns uploaded bytes (PDF, markdown, plain text)
//!   into markdown-ish text. PDFs become one `## Page N` section per page
//!   so the markdown separators split at page boundaries first.
//! - [`PageExtractor`] fetches the main textual content of a web page.
//!   [`TavilyExtractor`] calls the Tavily extract API.
//!
//! Extraction never panics. An extractor that finds nothing returns
//! `Ok(None)`; transport failures are [`Error::ProviderUnavailable`].

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use kbchat_core::{Error, Provider, Result};

use crate::config::ExtractionConfig;
use crate::http::{self, Auth};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_TEXT: &str = "text/plain";

const TAVILY_EXTRACT_URL: &str = "https://api.tavily.com/extract";

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedContentType(String),
    Pdf(String),
    Encoding(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content-type: {}", ct)
            }
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Encoding(e) => write!(f, "document is not valid UTF-8: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

impl From<ExtractError> for Error {
    fn from(err: ExtractError) -> Self {
        Error::Validation(err.to_string())
    }
}

/// Guess a content type from a file name.
pub fn content_type_for(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".pdf") {
        Some(MIME_PDF)
    } else if lower.ends_with(".md") || lower.ends_with(".markdown") {
        Some(MIME_MARKDOWN)
    } else if lower.ends_with(".txt") {
        Some(MIME_TEXT)
    } else {
        None
    }
}

/// Extract text from an uploaded document.
pub fn extract_document(bytes: &[u8], content_type: &str) -> std::result::Result<String, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_MARKDOWN | MIME_TEXT => String::from_utf8(bytes.to_vec())
            .map_err(|e| ExtractError::Encoding(e.to_string())),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> std::result::Result<String, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(pages_to_markdown(&pages))
}

/// Render page texts as `## Page N` sections, skipping blank pages.
///
/// Line breaks inside a paragraph become markdown hard breaks (`"  \n"`);
/// blank lines stay paragraph breaks.
pub fn pages_to_markdown<S: AsRef<str>>(pages: &[S]) -> String {
    pages
        .iter()
        .enumerate()
        .filter(|(_, text)| !text.as_ref().trim().is_empty())
        .map(|(i, text)| format!("## Page {}\n\n{}", i + 1, hard_breaks(text.as_ref().trim())))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn hard_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_blank = true;
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if i > 0 {
            if prev_blank || line.is_empty() {
                out.push('\n');
            } else {
                out.push_str("  \n");
            }
        }
        out.push_str(line);
        prev_blank = line.is_empty();
    }
    out
}

/// Validate a URL before handing it to an extractor.
pub fn validate_url(raw: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| Error::Validation(format!("malformed URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "URL must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::Validation(format!("URL '{}' has no host", raw)));
    }
    Ok(url)
}

/// Fetches the main textual content of a web page.
///
/// Returns `Ok(None)` when the page yields no content.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, url: &reqwest::Url) -> Result<Option<String>>;
}

pub struct DisabledExtractor;

#[async_trait]
impl PageExtractor for DisabledExtractor {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn extract(&self, _url: &reqwest::Url) -> Result<Option<String>> {
        Err(Error::provider(
            Provider::Extraction,
            "web extraction provider is disabled",
        ))
    }
}

/// Page extractor backed by the Tavily extract API.
pub struct TavilyExtractor {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl TavilyExtractor {
    pub fn new(config: &ExtractionConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            endpoint: config
                .url
                .clone()
                .unwrap_or_else(|| TAVILY_EXTRACT_URL.to_string()),
            api_key: http::secret_from_env(&config.api_key_env)?,
        })
    }
}

#[async_trait]
impl PageExtractor for TavilyExtractor {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn extract(&self, url: &reqwest::Url) -> Result<Option<String>> {
        let body = serde_json::json!({ "urls": [url.as_str()] });
        let json = http::post_json(
            &self.client,
            &self.endpoint,
            &Auth::Bearer(self.api_key.clone()),
            &body,
            2,
            "Tavily",
        )
        .await
        .map_err(|e| Error::provider(Provider::Extraction, e.to_string()))?;

        let content = parse_tavily_response(&json);
        if content.is_none() {
            tracing::warn!(%url, "extraction returned no content");
        }
        Ok(content)
    }
}

/// The `raw_content` of the first result, if non-blank.
fn parse_tavily_response(json: &serde_json::Value) -> Option<String> {
    json.get("results")
        .and_then(|r| r.as_array())
        .and_then(|results| results.first())
        .and_then(|first| first.get("raw_content"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
}

pub fn create_extractor(config: &ExtractionConfig) -> anyhow::Result<Arc<dyn PageExtractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledExtractor)),
        "tavily" => Ok(Arc::new(TavilyExtractor::new(config)?)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract_document(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_document(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn markdown_passes_through() {
        let text = extract_document("# Title\n\nbody".as_bytes(), MIME_MARKDOWN).unwrap();
        assert_eq!(text, "# Title\n\nbody");
        assert!(extract_document(&[0xff, 0xfe], MIME_TEXT).is_err());
    }

    #[test]
    fn pages_become_sections() {
        let md = pages_to_markdown(&["First page\n", "   ", "Third"]);
        assert_eq!(md, "## Page 1\n\nFirst page\n\n## Page 3\n\nThird");
        assert_eq!(pages_to_markdown::<&str>(&[]), "");
    }

    #[test]
    fn page_line_breaks_become_hard_breaks() {
        let md = pages_to_markdown(&["Name: Ada\nRole: Engineer \n\nSecond paragraph\nends here"]);
        assert_eq!(
            md,
            "## Page 1\n\nName: Ada  \nRole: Engineer\n\nSecond paragraph  \nends here"
        );
    }

    #[test]
    fn content_type_from_name() {
        assert_eq!(content_type_for("Report.PDF"), Some(MIME_PDF));
        assert_eq!(content_type_for("notes.md"), Some(MIME_MARKDOWN));
        assert_eq!(content_type_for("a.docx"), None);
    }

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/a").is_ok());
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn tavily_response_parsing() {
        let json = serde_json::json!({
            "results": [{"url": "https://x", "raw_content": "Page text"}],
            "failed_results": []
        });
        assert_eq!(parse_tavily_response(&json).as_deref(), Some("Page text"));
        let empty = serde_json::json!({"results": [], "failed_results": [{"url": "https://x"}]});
        assert_eq!(parse_tavily_response(&empty), None);
        let blank = serde_json::json!({"results": [{"raw_content": "  "}]});
        assert_eq!(parse_tavily_response(&blank), None);
    }
}
