//! Core types used throughout the snip router.
//!
//! This module defines the data model shared by the rule engine, the action
//! history and the delivery pipeline: where a request came from, what it
//! carries, and what processing produced.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The extension surface that originated a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceContext {
    /// The work center panel
    Workcenter,
    /// Content shared into the app by the OS share sheet
    ShareTarget,
    /// The browser extension (popup, snip, context menu)
    ChromeExtension,
    /// Files handed over by the OS launch queue
    LaunchQueue,
    /// Back-filled for persisted entries that lost their context
    Unknown,
}

impl SourceContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceContext::Workcenter => "workcenter",
            SourceContext::ShareTarget => "share-target",
            SourceContext::ChromeExtension => "chrome-extension",
            SourceContext::LaunchQueue => "launch-queue",
            SourceContext::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    pub source: SourceContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ActionContext {
    pub fn new(source: SourceContext) -> Self {
        Self {
            source,
            session_id: None,
        }
    }

    pub fn with_session(source: SourceContext, session_id: impl Into<String>) -> Self {
        Self {
            source,
            session_id: Some(session_id.into()),
        }
    }
}

/// Input kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Files,
    Image,
    Text,
    Markdown,
    Url,
    Mixed,
    Unknown,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Files => "files",
            InputKind::Image => "image",
            InputKind::Text => "text",
            InputKind::Markdown => "markdown",
            InputKind::Url => "url",
            InputKind::Mixed => "mixed",
            InputKind::Unknown => "unknown",
        }
    }
}

/// A file attached to a request. Bytes travel as base64 in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFile {
    pub name: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Plain text or markdown that can be used as-is without recognition
    pub fn is_text_like(&self) -> bool {
        self.mime_type.starts_with("text/")
            || self.mime_type == "application/markdown"
            || self.name.ends_with(".md")
            || self.name.ends_with(".txt")
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// File contents as UTF-8 text
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Encode the file as a `data:` URL
    pub fn to_data_url(&self) -> String {
        let mime = if self.mime_type.is_empty() {
            "application/octet-stream"
        } else {
            &self.mime_type
        };
        format!("data:{};base64,{}", mime, BASE64.encode(&self.data))
    }
}

/// Content that was already recognized in an earlier step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizedData {
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub recognized_as: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

/// The payload of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInput {
    #[serde(rename = "type")]
    pub kind: InputKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<InputFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognized_data: Option<RecognizedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognized_content: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ActionInput {
    pub fn new(kind: InputKind) -> Self {
        Self {
            kind,
            files: Vec::new(),
            text: None,
            url: None,
            recognized_data: None,
            processed_data: None,
            recognized_content: None,
            metadata: Map::new(),
        }
    }

    pub fn files(files: Vec<InputFile>) -> Self {
        Self {
            files,
            ..Self::new(InputKind::Files)
        }
    }

    pub fn image(files: Vec<InputFile>) -> Self {
        Self {
            files,
            ..Self::new(InputKind::Image)
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(InputKind::Text)
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(InputKind::Markdown)
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new(InputKind::Url)
        }
    }

    pub fn has_images(&self) -> bool {
        self.files.iter().any(InputFile::is_image)
    }

    pub fn text_files(&self) -> impl Iterator<Item = &InputFile> {
        self.files.iter().filter(|f| f.is_text_like())
    }
}

/// Format label of a processed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Markdown,
    Text,
    Json,
    Html,
    Error,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Markdown => "markdown",
            ResultType::Text => "text",
            ResultType::Json => "json",
            ResultType::Html => "html",
            ResultType::Error => "error",
        }
    }
}

/// Whether a result is freshly recognized content or a further transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCategory {
    Recognized,
    Processed,
}

/// Output of a rule processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResult {
    #[serde(rename = "type")]
    pub kind: ResultType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_category: Option<DataCategory>,
    /// Wall-clock processing time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_copied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_chain: Option<Vec<String>>,
}

impl ProcessedResult {
    pub fn new(kind: ResultType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            raw_data: None,
            response_id: None,
            data_category: None,
            processing_time: None,
            auto_copied: None,
            token_usage: None,
            model: None,
            processing_chain: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResultType::Error, message)
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultType::Error
    }

    pub fn with_category(mut self, category: DataCategory) -> Self {
        self.data_category = Some(category);
        self
    }

    pub fn with_response_id(mut self, response_id: impl Into<String>) -> Self {
        self.response_id = Some(response_id.into());
        self
    }
}

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate an id of the form `<prefix>_<epoch ms>_<9 random chars>`
pub fn generate_id(prefix: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, now_millis(), &random[..9])
}

/// Serde adapter storing bytes as a base64 string
pub(crate) mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
