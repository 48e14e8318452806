//! Markdown source resolution.
//!
//! Normalizes repository links to their raw form, decides whether fetched
//! text is markdown, and stashes loaded text in the session store under a
//! generated key for the viewer to pick up.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::storage::{KeyValueStore, StorageError};
use crate::types::generate_id;

/// Viewer page, relative to the extension origin
pub const VIEWER_PAGE: &str = "markdown/viewer.html";

const ACCEPT_MARKDOWN: &str = "text/markdown,text/plain,*/*";

lazy_static! {
    static ref MARKDOWN_EXT: Regex =
        Regex::new(r"(?i)\.(?:md|markdown|mdown|mkd|mkdn|mdtxt|mdtext)(?:$|[?#])").unwrap();
    static ref GITHUB_HTML_VIEW: Regex = Regex::new(r"(?i)(^|/)(blob|tree)/").unwrap();
    static ref README: Regex = Regex::new(r"(?i)(^|/)readme(\.md)?($|[?#])").unwrap();
    static ref HTML_TAG: Regex = Regex::new(r"<[a-zA-Z][^>]*>").unwrap();

    static ref HEADING: Regex = Regex::new(r"(?m)^#{1,6}\s+.+$").unwrap();
    static ref BULLET: Regex = Regex::new(r"(?m)^\s*[-*+]\s+\S+").unwrap();
    static ref ORDERED: Regex = Regex::new(r"(?m)^\s*\d+\.\s+\S+").unwrap();
    static ref FENCE: Regex = Regex::new(r"(?s)```.*?```").unwrap();
    static ref LINK: Regex = Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap();

    /// Syntax markers with their weight toward "this is markdown"
    static ref WEIGHTED: Vec<(Regex, f64)> = vec![
        (Regex::new(r"(?s)^---.+?---").unwrap(), 0.9),
        (HEADING.clone(), 0.8),
        (BULLET.clone(), 0.7),
        (ORDERED.clone(), 0.7),
        (Regex::new(r"`{1,3}[^`]*`{1,3}").unwrap(), 0.6),
        (LINK.clone(), 0.5),
        (Regex::new(r"!\[([^\]]+)\]\(([^)]+)\)").unwrap(), 0.5),
        (Regex::new(r"\*\*[^*]+\*\*").unwrap(), 0.4),
        (Regex::new(r"\*[^*]+\*").unwrap(), 0.3),
    ];
}

#[derive(Error, Debug)]
pub enum MarkdownError {
    #[error("Failed to load: {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Rewrite repository "view" links to the raw file:
/// GitHub blob/raw pages to raw.githubusercontent.com, GitLab `/-/blob/` to
/// `/-/raw/`, and Bitbucket links get `raw=1`. Anything unparseable is
/// returned unchanged.
pub fn normalize_source_url(candidate: &str) -> String {
    let Ok(mut url) = Url::parse(candidate) else {
        return candidate.to_string();
    };
    let host = url.host_str().unwrap_or_default().to_string();
    let parts: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if host == "github.com" {
        let at = |name: &str| parts.iter().position(|p| p == name);
        if parts.len() >= 5 && (at("blob") == Some(2) || at("raw") == Some(2)) {
            return format!(
                "https://raw.githubusercontent.com/{}/{}/{}/{}",
                parts[0],
                parts[1],
                parts[3],
                parts[4..].join("/")
            );
        }
    }

    if host.ends_with("gitlab.com") {
        if let Some(dash) = parts.iter().position(|p| p == "-") {
            if parts.get(dash + 1).map(String::as_str) == Some("blob") {
                let tail = parts.get(dash + 3..).map(|rest| rest.join("/")).unwrap_or_default();
                return format!(
                    "https://{}/{}/-/raw/{}/{}",
                    host,
                    parts[..dash].join("/"),
                    parts.get(dash + 2).map(String::as_str).unwrap_or_default(),
                    tail
                );
            }
        }
    }

    if host == "bitbucket.org" && !url.query_pairs().any(|(k, _)| k == "raw") {
        url.query_pairs_mut().append_pair("raw", "1");
    }

    url.to_string()
}

pub fn is_probably_url(value: &str) -> bool {
    Url::parse(value).is_ok()
}

/// Links that point at a markdown asset rather than an HTML view of one
pub fn is_markdown_url(candidate: &str) -> bool {
    let Ok(url) = Url::parse(candidate) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https" | "file" | "ftp") {
        return false;
    }

    let host = url.host_str().unwrap_or_default();
    let path = url.path();
    if host == "github.com" && GITHUB_HTML_VIEW.is_match(path) {
        return false;
    }
    if MARKDOWN_EXT.is_match(path) {
        return true;
    }
    matches!(host, "raw.githubusercontent.com" | "gist.githubusercontent.com")
        && README.is_match(path)
}

/// Weighted syntax score: at least two kinds of markers totalling 0.8
pub fn is_markdown_content(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        return false;
    }
    if HTML_TAG.is_match(trimmed) {
        return false;
    }

    let (score, hits) = WEIGHTED
        .iter()
        .filter(|(pattern, _)| pattern.is_match(text))
        .fold((0.0, 0), |(score, hits), (_, weight)| (score + weight, hits + 1));
    hits >= 2 && score >= 0.8
}

pub fn looks_like_html_document(text: &str) -> bool {
    let head = text.trim_start().to_lowercase();
    ["<!doctype html", "<html", "<head", "<body"]
        .iter()
        .any(|prefix| head.starts_with(prefix))
}

/// Two or more of: heading, bullet, numbered item, fenced block, link
pub fn looks_like_markdown(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || looks_like_html_document(trimmed) {
        return false;
    }
    [&*HEADING, &*BULLET, &*ORDERED, &*FENCE, &*LINK]
        .iter()
        .filter(|pattern| pattern.is_match(trimmed))
        .count()
        >= 2
}

/// Whether a fetched response can be shown in the markdown viewer. A
/// markdown extension alone only counts for plain-text responses.
pub fn is_definitely_markdown_response(source_url: &str, text: &str, content_type: &str) -> bool {
    if text.trim().is_empty() || looks_like_html_document(text) {
        return false;
    }

    let content_type = content_type.to_lowercase();
    if content_type.contains("text/html") || content_type.contains("application/xhtml+xml") {
        return false;
    }
    if content_type.contains("text/markdown") || content_type.contains("text/x-markdown") {
        return true;
    }

    if is_markdown_content(text) {
        return true;
    }
    let has_extension = Url::parse(source_url)
        .map(|u| MARKDOWN_EXT.is_match(u.path()))
        .unwrap_or(false);
    has_extension && (content_type.contains("text/plain") || content_type.is_empty())
}

/// Fence language for a source file, from its extension
pub fn guess_language(url: &Url) -> &'static str {
    let file = url.path().rsplit('/').next().unwrap_or_default();
    let ext = file.rsplit('.').next().unwrap_or_default().to_lowercase();
    match ext.as_str() {
        "ts" => "ts",
        "tsx" => "tsx",
        "js" => "js",
        "jsx" => "jsx",
        "json" => "json",
        "css" => "css",
        "scss" => "scss",
        "html" | "htm" => "html",
        "xml" => "xml",
        "yml" | "yaml" => "yaml",
        "py" => "py",
        "sh" => "sh",
        "go" => "go",
        "rs" => "rs",
        "java" => "java",
        _ => "",
    }
}

/// Viewer link for a source and an optional session key
pub fn viewer_url(viewer_page: &str, source: Option<&str>, markdown_key: Option<&str>) -> String {
    let Some(source) = source else {
        return viewer_page.to_string();
    };
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("src", source);
    if let Some(key) = markdown_key {
        query.append_pair("mdk", key);
    }
    format!("{}?{}", viewer_page, query.finish())
}

/// A fetched document
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedText {
    pub status: u16,
    pub text: String,
    pub content_type: String,
}

impl FetchedText {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait MarkdownFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedText, MarkdownError>;
}

/// Fetches over HTTP with reqwest
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, MarkdownError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MarkdownFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedText, MarkdownError> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, ACCEPT_MARKDOWN)
            .send()
            .await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        let text = response.text().await?;

        Ok(FetchedText {
            status,
            text,
            content_type,
        })
    }
}

/// Where loaded text was stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedMarkdown {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

/// Loads markdown from a URL (or takes `src` as the text itself) into the
/// session store
pub struct MarkdownLoader {
    fetcher: Arc<dyn MarkdownFetcher>,
    session: Arc<dyn KeyValueStore>,
}

impl MarkdownLoader {
    pub fn new(fetcher: Arc<dyn MarkdownFetcher>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { fetcher, session }
    }

    /// Resolve `src` and cache the text. Non-markdown text from a URL is
    /// wrapped in a fence tagged with the guessed language; a `src` that is
    /// not a fetchable URL is stored as the markdown itself.
    pub async fn load(&self, src: &str) -> Result<LoadedMarkdown, MarkdownError> {
        let normalized = normalize_source_url(src);

        let text = match Url::parse(&normalized) {
            Ok(url) => match self.fetcher.fetch(&url).await {
                Ok(fetched) if !fetched.is_ok() => {
                    return Err(MarkdownError::Status(fetched.status));
                }
                Ok(fetched) => Self::prepare(&url, fetched),
                Err(e) => {
                    debug!("Fetching {} failed ({}), treating source as text", url, e);
                    src.to_string()
                }
            },
            Err(_) => src.to_string(),
        };

        let key = generate_id("md");
        self.session.set(&key, &Value::String(text))?;
        info!("📄 Cached markdown under {}", key);

        Ok(LoadedMarkdown {
            key,
            src: is_probably_url(&normalized).then_some(normalized),
        })
    }

    /// Previously cached text
    pub fn cached(&self, key: &str) -> Result<Option<String>, MarkdownError> {
        Ok(self
            .session
            .get(key)?
            .and_then(|v| v.as_str().map(String::from)))
    }

    fn prepare(url: &Url, fetched: FetchedText) -> String {
        if looks_like_html_document(&fetched.text) {
            return fetched.text;
        }
        let is_markdown = MARKDOWN_EXT.is_match(url.path())
            || fetched.content_type.contains("text/markdown")
            || looks_like_markdown(&fetched.text);
        if is_markdown {
            return fetched.text;
        }
        format!(
            "```{}\n{}\n```\n",
            guess_language(url),
            fetched.text.replace("\r\n", "\n")
        )
    }
}
