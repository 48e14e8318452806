//! AI processing service contract.
//!
//! The rule engine never talks HTTP itself. It hands an [`AiInput`] and
//! [`AiOptions`] to an [`AiService`] and gets back an [`AiResponse`]. The
//! bundled [`HttpAiService`] speaks the `/responses` API.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AiConfig;
use crate::types::InputFile;

#[derive(Error, Debug)]
pub enum AiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("AI service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("AI response contained no output")]
    EmptyOutput,
}

/// One piece of a structured message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    InputImage { detail: String, image_url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::InputText { text: text.into() }
    }

    pub fn image(data_url: impl Into<String>) -> Self {
        ContentPart::InputImage {
            detail: "auto".to_string(),
            image_url: data_url.into(),
        }
    }
}

/// `{type: "message", role, content: [...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl AiMessage {
    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content,
        }
    }
}

/// What gets sent to the model
#[derive(Debug, Clone, PartialEq)]
pub enum AiInput {
    Text(String),
    DataUrl(String),
    File(InputFile),
    Messages(Vec<AiMessage>),
    /// Text followed by attachments, flattened into one user message
    Parts(Vec<AiInput>),
}

impl AiInput {
    /// Render as the `input` field of a responses request
    pub fn to_request_value(&self) -> Value {
        match self {
            AiInput::Text(text) => Value::String(text.clone()),
            AiInput::Messages(messages) => json!(messages),
            other => json!([AiMessage::user(other.content_parts())]),
        }
    }

    fn content_parts(&self) -> Vec<ContentPart> {
        match self {
            AiInput::Text(text) => vec![ContentPart::text(text.clone())],
            AiInput::DataUrl(url) => vec![ContentPart::image(url.clone())],
            AiInput::File(file) if file.is_image() => vec![ContentPart::image(file.to_data_url())],
            AiInput::File(file) => match file.text() {
                Some(text) => vec![ContentPart::text(text)],
                None => vec![ContentPart::image(file.to_data_url())],
            },
            AiInput::Messages(messages) => messages
                .iter()
                .flat_map(|m| m.content.iter().cloned())
                .collect(),
            AiInput::Parts(parts) => parts.iter().flat_map(AiInput::content_parts).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermediateRecognition {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(default)]
    pub cache_results: bool,
}

/// Per-request knobs passed alongside the input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiOptions {
    pub instruction: String,
    pub output_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_language: Option<String>,
    #[serde(default)]
    pub intermediate_recognition: IntermediateRecognition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_verbosity: Option<String>,
}

impl AiOptions {
    pub fn new(instruction: impl Into<String>, output_format: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            output_format: output_format.into(),
            ..Default::default()
        }
    }
}

/// `{ok, data, error?, responseId?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponse {
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

impl AiResponse {
    pub fn success(data: Value, response_id: Option<String>) -> Self {
        Self {
            ok: true,
            data,
            error: None,
            response_id,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            error: Some(error.into()),
            response_id: None,
        }
    }
}

/// Turns files, text and images into recognized or processed content
#[async_trait]
pub trait AiService: Send + Sync {
    /// Extract content from raw media
    async fn recognize(&self, input: AiInput, options: AiOptions) -> AiResponse;

    /// Transform content according to an instruction
    async fn process(&self, input: AiInput, options: AiOptions) -> AiResponse;
}

/// Client for an OpenAI-style `/responses` endpoint
pub struct HttpAiService {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpAiService {
    pub fn new(config: &AiConfig) -> Result<Self, AiError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.resolved_api_key() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/responses", config.api_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    fn build_body(&self, input: &AiInput, options: &AiOptions, default_effort: &str) -> Value {
        let mut instructions = options.instruction.clone();
        if let Some(language) = options
            .output_language
            .as_deref()
            .filter(|l| *l != "auto")
        {
            instructions.push_str(&format!("\nRespond in {}.", language));
        }

        json!({
            "model": self.model,
            "input": input.to_request_value(),
            "instructions": instructions,
            "reasoning": {
                "effort": options.processing_effort.as_deref().unwrap_or(default_effort)
            },
            "text": {
                "verbosity": options.processing_verbosity.as_deref().unwrap_or("low")
            },
        })
    }

    async fn send(&self, body: Value) -> Result<AiResponse, AiError> {
        debug!("POST {}", self.endpoint);
        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().await?;
        let text = extract_output_text(&payload).ok_or(AiError::EmptyOutput)?;
        let response_id = payload.get("id").and_then(Value::as_str).map(String::from);

        Ok(AiResponse::success(parse_output(&text), response_id))
    }

    async fn run(&self, input: AiInput, options: AiOptions, default_effort: &str) -> AiResponse {
        let body = self.build_body(&input, &options, default_effort);
        match self.send(body).await {
            Ok(response) => response,
            Err(e) => {
                warn!("AI request failed: {}", e);
                AiResponse::failure(e.to_string())
            }
        }
    }
}

#[async_trait]
impl AiService for HttpAiService {
    async fn recognize(&self, input: AiInput, options: AiOptions) -> AiResponse {
        self.run(input, options, "low").await
    }

    async fn process(&self, input: AiInput, options: AiOptions) -> AiResponse {
        self.run(input, options, "medium").await
    }
}

/// Pull the text out of `output_text` or `output[].content[].text`
fn extract_output_text(payload: &Value) -> Option<String> {
    match payload.get("output_text") {
        Some(Value::String(text)) if !text.is_empty() => return Some(text.clone()),
        Some(Value::Array(parts)) => {
            let joined: String = parts.iter().filter_map(Value::as_str).collect();
            if !joined.is_empty() {
                return Some(joined);
            }
        }
        _ => {}
    }

    let joined: String = payload
        .get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    (!joined.is_empty()).then_some(joined)
}

/// Structured answers come back as JSON text; keep them structured
fn parse_output(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    Value::String(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> AiConfig {
        AiConfig {
            api_url: server.uri(),
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_parts_flatten_into_one_message() {
        let input = AiInput::Parts(vec![
            AiInput::Text("describe".into()),
            AiInput::File(InputFile::new("a.png", "image/png", vec![1, 2])),
        ]);
        let value = input.to_request_value();
        let content = &value[0]["content"];
        assert_eq!(value[0]["role"], "user");
        assert_eq!(content[0]["type"], "input_text");
        assert_eq!(content[1]["type"], "input_image");
        assert_eq!(content[1]["detail"], "auto");
        assert_eq!(content[1]["image_url"], "data:image/png;base64,AQI=");
    }

    #[test]
    fn test_extract_output_text_variants() {
        let direct = json!({"output_text": "hello"});
        assert_eq!(extract_output_text(&direct).as_deref(), Some("hello"));

        let nested = json!({"output": [
            {"type": "reasoning"},
            {"type": "message", "content": [{"type": "output_text", "text": "a"}, {"text": "b"}]}
        ]});
        assert_eq!(extract_output_text(&nested).as_deref(), Some("ab"));

        assert!(extract_output_text(&json!({"output": []})).is_none());
    }

    #[tokio::test]
    async fn test_recognize_parses_structured_output() {
        let server = MockServer::start().await;
        let body = json!({
            "id": "resp_123",
            "output_text": "{\"recognized_data\": [\"line one\", \"line two\"]}"
        });

        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/json"),
            )
            .mount(&server)
            .await;

        let service = HttpAiService::new(&config_for(&server)).unwrap();
        let response = service
            .recognize(AiInput::Text("x".into()), AiOptions::new("Recognize", "auto"))
            .await;

        assert!(response.ok);
        assert_eq!(response.response_id.as_deref(), Some("resp_123"));
        assert_eq!(response.data["recognized_data"][1], "line two");
    }

    #[tokio::test]
    async fn test_http_failure_becomes_failed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let service = HttpAiService::new(&config_for(&server)).unwrap();
        let response = service
            .process(AiInput::Text("x".into()), AiOptions::new("Process", "markdown"))
            .await;

        assert!(!response.ok);
        assert_eq!(
            response.error.as_deref(),
            Some("AI service returned 500: overloaded")
        );
    }
}
