//! Background service.
//!
//! Serves the background method table (`capture`, `processImage`,
//! `loadMarkdown`, ...) on top of the capture, AI, clipboard and markdown
//! services, either directly or as handlers on a [`RuntimeChannel`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ai::{AiInput, AiMessage, AiOptions, AiResponse, AiService, ContentPart};
use crate::capture::{data_url_to_file, CaptureError, CaptureService};
use crate::clipboard::{ClipboardOrchestrator, CopyRequest};
use crate::markdown::{MarkdownError, MarkdownLoader};
use crate::messaging::{BackgroundMethod, MessagingError, RuntimeChannel};
use crate::storage::{KeyValueStore, StorageError};
use crate::surface::{CaptureRect, TabId};

/// Local-store key holding the user's custom instructions
pub const CUSTOM_INSTRUCTIONS_KEY: &str = "rs-custom-instructions";

const RECOGNIZE_INSTRUCTION: &str = "Recognize the data shown in the content, orienting by \
fonts where useful. Do not describe the image itself. Format text as multiline Markdown, math \
as $KaTeX$, tables as Markdown tables, code as fenced or inline code and lists as Markdown lists. \
Normalize phone numbers, emails, URLs, dates and times. If nothing is found, return \"No data \
recognized\".";

const SOLVE_INSTRUCTION: &str = "Solve the problem or answer the question presented in the \
content. Reply with **Problem/Question:**, **Solution/Answer:** and **Explanation:** sections. \
Show intermediate steps for math using $KaTeX$, name the correct option for multiple choice \
and solve each problem separately when there are several.";

const CODE_INSTRUCTION: &str = "Generate code for the request presented in the content. Reply \
with **Request:**, **Language:**, **Code:** (a fenced block tagged with the language) and \
**Explanation:** sections. Note any assumptions made about an unclear request.";

const CSS_INSTRUCTION: &str = "Analyze the visual design in the content and generate CSS that \
recreates it. Reply with **Visual Analysis:**, **CSS:** (a fenced css block) and **Usage \
Notes:** sections. Cover colors, typography, spacing, layout, effects and borders, preferring \
custom properties and logical properties.";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Markdown(#[from] MarkdownError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),
}

/// What to do with a snipped region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnipMode {
    #[default]
    Recognize,
    Solve,
    Code,
    Css,
    Custom,
}

impl SnipMode {
    /// Built-in instruction with its reasoning effort and verbosity.
    /// `Custom` has none and falls back to recognition.
    fn preset(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            SnipMode::Solve => (SOLVE_INSTRUCTION, "high", "medium"),
            SnipMode::Code => (CODE_INSTRUCTION, "high", "medium"),
            SnipMode::Css => (CSS_INSTRUCTION, "high", "medium"),
            SnipMode::Recognize | SnipMode::Custom => (RECOGNIZE_INSTRUCTION, "low", "low"),
        }
    }

    fn options(&self) -> AiOptions {
        let (instruction, effort, verbosity) = self.preset();
        AiOptions {
            processing_effort: Some(effort.to_string()),
            processing_verbosity: Some(verbosity.to_string()),
            ..AiOptions::new(instruction, "markdown")
        }
    }
}

/// A user-defined instruction, selectable with `mode: "custom"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomInstruction {
    pub id: String,
    pub label: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

/// `{ok, data?, error?}` as answered to capture and processing calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

impl CaptureOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
            response_id: None,
        }
    }

    fn from_response(response: &AiResponse) -> Self {
        let text = recognized_text(response);
        Self {
            ok: response.ok,
            data: (!text.is_empty()).then_some(text),
            error: response.error.clone(),
            response_id: response.response_id.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureParams {
    #[serde(default)]
    rect: Option<CaptureRect>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    mode: SnipMode,
    #[serde(default)]
    instruction_id: Option<String>,
    #[serde(default)]
    tab_id: Option<TabId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessImageParams {
    image_data: String,
    #[serde(default)]
    mode: SnipMode,
    #[serde(default)]
    tab_id: Option<TabId>,
}

#[derive(Debug, Deserialize)]
struct ProcessTextParams {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyParams {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    tab_id: Option<TabId>,
}

#[derive(Debug, Deserialize)]
struct LoadMarkdownParams {
    src: String,
}

/// Text worth copying out of an AI response. JSON payloads are unwrapped
/// through `recognized_data`, `data` or `text`.
pub fn recognized_text(response: &AiResponse) -> String {
    if !response.ok {
        return String::new();
    }
    let text = match &response.data {
        Value::Null => return String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            let candidate = ["recognized_data", "data", "text"]
                .iter()
                .find_map(|key| parsed.get(key).filter(|v| !v.is_null()));
            match candidate {
                Some(Value::String(s)) => return s.trim().to_string(),
                Some(other) => return other.to_string(),
                None => {}
            }
        }
    }
    trimmed.to_string()
}

/// Text of a copy payload: a string, or the `data` string of a result object
fn copyable_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => match other.get("data") {
            Some(Value::String(s)) => s.clone(),
            _ => other.to_string(),
        },
    }
}

/// The background side of the extension
pub struct BackgroundService {
    capture: Arc<CaptureService>,
    ai: Arc<dyn AiService>,
    clipboard: Arc<ClipboardOrchestrator>,
    markdown: Arc<MarkdownLoader>,
    settings: Arc<dyn KeyValueStore>,
}

impl BackgroundService {
    pub fn new(
        capture: Arc<CaptureService>,
        ai: Arc<dyn AiService>,
        clipboard: Arc<ClipboardOrchestrator>,
        markdown: Arc<MarkdownLoader>,
        settings: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            capture,
            ai,
            clipboard,
            markdown,
            settings,
        }
    }

    /// Register every background method on `channel`
    pub fn register_handlers(self: &Arc<Self>, channel: &RuntimeChannel) {
        for method in BackgroundMethod::ALL {
            let service = Arc::clone(self);
            channel.handlers().register(method.as_str(), move |data| {
                let service = Arc::clone(&service);
                async move { service.call(method, data).await.map_err(|e| e.to_string()) }
            });
        }
        info!(
            "✅ Registered {} background handlers on {}",
            BackgroundMethod::ALL.len(),
            channel.context()
        );
    }

    /// Route by method name; unknown names fail with "Unknown method: X"
    pub async fn dispatch(&self, method: &str, data: Value) -> Result<Value, MessagingError> {
        let method = BackgroundMethod::parse(method)?;
        self.call(method, data)
            .await
            .map_err(|e| MessagingError::Remote(e.to_string()))
    }

    pub async fn call(&self, method: BackgroundMethod, data: Value) -> Result<Value, ServiceError> {
        debug!("Background call {}", method.as_str());
        let data = if data.is_null() { json!({}) } else { data };

        match method {
            BackgroundMethod::Capture => {
                let params: CaptureParams = serde_json::from_value(data)?;
                let outcome = self
                    .capture_and_process(
                        params.rect,
                        params.mode,
                        params.instruction_id,
                        params.tab_id,
                    )
                    .await?;
                Ok(serde_json::to_value(outcome)?)
            }
            BackgroundMethod::CaptureScreenshot => {
                let params: CaptureParams = serde_json::from_value(data)?;
                let image = self
                    .capture
                    .capture_visible_tab(params.rect, params.scale)
                    .await?;
                Ok(json!({ "ok": true, "data": image, "imageData": image }))
            }
            BackgroundMethod::CaptureWithRect => {
                let params: CaptureParams = serde_json::from_value(data)?;
                Ok(json!({ "status": "rect_selection_required", "mode": params.mode }))
            }
            BackgroundMethod::ProcessImage => {
                let params: ProcessImageParams = serde_json::from_value(data)?;
                let input = AiInput::File(data_url_to_file(&params.image_data, "snip.png"));
                let response = self.run_mode(params.mode, input).await;
                let outcome = CaptureOutcome::from_response(&response);
                self.copy_outcome(&outcome, params.tab_id).await;
                Ok(serde_json::to_value(outcome)?)
            }
            BackgroundMethod::ProcessText => {
                let params: ProcessTextParams = serde_json::from_value(data)?;
                let response = self
                    .ai
                    .recognize(AiInput::Text(params.content), SnipMode::Recognize.options())
                    .await;
                Ok(serde_json::to_value(response)?)
            }
            BackgroundMethod::DoCopy => {
                let params: CopyParams = serde_json::from_value(data)?;
                let outcome = self
                    .clipboard
                    .copy(
                        &copyable_text(&params.data),
                        CopyRequest {
                            tab_id: params.tab_id,
                            show_feedback: true,
                        },
                    )
                    .await;
                Ok(json!({ "success": outcome.ok }))
            }
            BackgroundMethod::LoadMarkdown => {
                let params: LoadMarkdownParams = serde_json::from_value(data)?;
                match self.markdown.load(&params.src).await {
                    Ok(loaded) => Ok(serde_json::to_value(loaded)?),
                    Err(e @ MarkdownError::Status(_)) => Ok(json!({ "error": e.to_string() })),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Screenshot, run the mode's AI call and copy the answer
    pub async fn capture_and_process(
        &self,
        rect: Option<CaptureRect>,
        mode: SnipMode,
        instruction_id: Option<String>,
        tab_id: Option<TabId>,
    ) -> Result<CaptureOutcome, ServiceError> {
        let image = self.capture.capture_visible_tab(rect, None).await?;

        let outcome = match (mode, instruction_id) {
            (SnipMode::Custom, Some(id)) => {
                let custom = self.custom_instructions()?.into_iter().find(|i| i.id == id);
                let Some(custom) = custom else {
                    return Ok(CaptureOutcome::failure("Custom instruction not found"));
                };
                let input =
                    AiInput::Messages(vec![AiMessage::user(vec![ContentPart::image(image)])]);
                let response = self
                    .ai
                    .recognize(input, AiOptions::new(custom.instruction.clone(), "markdown"))
                    .await;
                let mut outcome = CaptureOutcome::from_response(&response);
                if outcome.data.is_none() && outcome.error.is_none() {
                    outcome.ok = false;
                    outcome.error = Some(format!("{} failed", custom.label));
                }
                outcome
            }
            (mode, _) => {
                let input = AiInput::File(data_url_to_file(&image, "snip.png"));
                CaptureOutcome::from_response(&self.run_mode(mode, input).await)
            }
        };

        self.copy_outcome(&outcome, tab_id).await;
        Ok(outcome)
    }

    /// Stored custom instructions, ordered by `order` then label
    pub fn custom_instructions(&self) -> Result<Vec<CustomInstruction>, ServiceError> {
        let mut instructions: Vec<CustomInstruction> =
            match self.settings.get(CUSTOM_INSTRUCTIONS_KEY)? {
                Some(value) => serde_json::from_value(value)?,
                None => Vec::new(),
            };
        instructions.sort_by(|a, b| {
            a.order
                .unwrap_or(i64::MAX)
                .cmp(&b.order.unwrap_or(i64::MAX))
                .then_with(|| a.label.cmp(&b.label))
        });
        Ok(instructions)
    }

    async fn run_mode(&self, mode: SnipMode, input: AiInput) -> AiResponse {
        self.ai.recognize(input, mode.options()).await
    }

    async fn copy_outcome(&self, outcome: &CaptureOutcome, tab_id: Option<TabId>) {
        let Some(text) = outcome.data.as_deref().filter(|_| outcome.ok) else {
            return;
        };
        let copied = self
            .clipboard
            .copy(
                text,
                CopyRequest {
                    tab_id,
                    show_feedback: true,
                },
            )
            .await;
        if !copied.ok {
            warn!(
                "Copy after processing failed: {}",
                copied.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::markdown::HttpFetcher;
    use crate::messaging::{ContextKind, CrxMessage};
    use crate::storage::MemoryStore;
    use crate::surface::{CaptureApi, ClipboardApi, NoTabs, SurfaceError, TabCaptureOptions};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    const PIXEL: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8DwHwAFBQIAX8jx0gAAAABJRU5ErkJggg==";

    struct FixedCapture;

    #[async_trait]
    impl CaptureApi for FixedCapture {
        async fn capture_visible_tab(
            &self,
            _options: &TabCaptureOptions,
        ) -> Result<String, SurfaceError> {
            Ok(PIXEL.to_string())
        }

        async fn capture_desktop(
            &self,
            _rect: Option<CaptureRect>,
        ) -> Result<String, SurfaceError> {
            Err(SurfaceError::Unavailable("desktop capture"))
        }
    }

    /// Answers with `reply` and records the instruction of every call
    struct ScriptedAi {
        reply: AiResponse,
        instructions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AiService for ScriptedAi {
        async fn recognize(&self, _input: AiInput, options: AiOptions) -> AiResponse {
            self.instructions.lock().unwrap().push(options.instruction);
            self.reply.clone()
        }

        async fn process(&self, input: AiInput, options: AiOptions) -> AiResponse {
            self.recognize(input, options).await
        }
    }

    #[derive(Default)]
    struct RecordingClipboard {
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClipboardApi for RecordingClipboard {
        async fn write_text(&self, text: &str) -> Result<(), SurfaceError> {
            self.written.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Fixture {
        service: Arc<BackgroundService>,
        ai: Arc<ScriptedAi>,
        clipboard: Arc<RecordingClipboard>,
        settings: Arc<MemoryStore>,
    }

    fn fixture(reply: AiResponse) -> Fixture {
        let ai = Arc::new(ScriptedAi {
            reply,
            instructions: Mutex::new(Vec::new()),
        });
        let native = Arc::new(RecordingClipboard::default());
        let settings = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(ClipboardOrchestrator::new(
            Arc::new(NoTabs),
            Arc::new(NoTabs),
            Some(native.clone()),
            Duration::ZERO,
        ));
        let markdown = Arc::new(MarkdownLoader::new(
            Arc::new(HttpFetcher::new(Duration::from_secs(5)).unwrap()),
            Arc::new(MemoryStore::new()),
        ));
        let service = Arc::new(BackgroundService::new(
            Arc::new(CaptureService::new(Arc::new(FixedCapture), CaptureConfig::default())),
            ai.clone(),
            orchestrator,
            markdown,
            settings.clone(),
        ));
        Fixture {
            service,
            ai,
            clipboard: native,
            settings,
        }
    }

    #[test]
    fn test_recognized_text_unwraps_json() {
        let wrapped = AiResponse::success(json!("{\"recognized_data\": \" hi \"}"), None);
        assert_eq!(recognized_text(&wrapped), "hi");

        let nested = AiResponse::success(json!({ "data": ["a", "b"] }), None);
        assert_eq!(recognized_text(&nested), "[\"a\",\"b\"]");

        assert_eq!(recognized_text(&AiResponse::success(json!("  plain  "), None)), "plain");
        assert_eq!(recognized_text(&AiResponse::failure("boom")), "");
    }

    #[tokio::test]
    async fn test_capture_copies_result() {
        let f = fixture(AiResponse::success(json!("# Title"), Some("resp_1".into())));

        let result = f
            .service
            .dispatch("capture", json!({ "mode": "solve" }))
            .await
            .unwrap();

        assert_eq!(result["ok"], json!(true));
        assert_eq!(result["data"], json!("# Title"));
        assert_eq!(result["responseId"], json!("resp_1"));
        assert_eq!(*f.clipboard.written.lock().unwrap(), vec!["# Title".to_string()]);
        assert_eq!(f.ai.instructions.lock().unwrap()[0], SOLVE_INSTRUCTION);
    }

    #[tokio::test]
    async fn test_failed_processing_not_copied() {
        let f = fixture(AiResponse::failure("HTTP 500"));

        let result = f
            .service
            .dispatch("processImage", json!({ "imageData": PIXEL }))
            .await
            .unwrap();

        assert_eq!(result["ok"], json!(false));
        assert_eq!(result["error"], json!("HTTP 500"));
        assert!(f.clipboard.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_instruction_lookup() {
        let f = fixture(AiResponse::success(json!("styled"), None));
        f.settings
            .set(
                CUSTOM_INSTRUCTIONS_KEY,
                &json!([
                    { "id": "b", "label": "Beta", "instruction": "Do beta" },
                    { "id": "a", "label": "Alpha", "instruction": "Do alpha", "order": 1 }
                ]),
            )
            .unwrap();

        let ids: Vec<String> = f
            .service
            .custom_instructions()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let found = f
            .service
            .capture_and_process(None, SnipMode::Custom, Some("b".into()), None)
            .await
            .unwrap();
        assert!(found.ok);
        assert_eq!(f.ai.instructions.lock().unwrap()[0], "Do beta");

        let missing = f
            .service
            .capture_and_process(None, SnipMode::Custom, Some("zzz".into()), None)
            .await
            .unwrap();
        assert_eq!(missing.error.as_deref(), Some("Custom instruction not found"));
    }

    #[tokio::test]
    async fn test_simple_methods() {
        let f = fixture(AiResponse::success(json!("ok"), None));

        let rect = f
            .service
            .dispatch("captureWithRect", json!({ "mode": "css" }))
            .await
            .unwrap();
        assert_eq!(rect, json!({ "status": "rect_selection_required", "mode": "css" }));

        let shot = f.service.dispatch("captureScreenshot", Value::Null).await.unwrap();
        assert_eq!(shot["imageData"], json!(PIXEL));

        let copied = f
            .service
            .dispatch("doCopy", json!({ "data": { "ok": true, "data": "copy me" } }))
            .await
            .unwrap();
        assert_eq!(copied, json!({ "success": true }));
        let empty = f.service.dispatch("doCopy", json!({ "data": "  " })).await.unwrap();
        assert_eq!(empty, json!({ "success": false }));

        let err = f.service.dispatch("explode", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown method: explode");
    }

    #[tokio::test]
    async fn test_handlers_on_runtime_channel() {
        let f = fixture(AiResponse::success(json!("text"), None));
        let channel = RuntimeChannel::new(ContextKind::Background, None);
        f.service.register_handlers(&channel);
        assert_eq!(channel.handlers().len(), BackgroundMethod::ALL.len());

        let request = CrxMessage::request(
            "crx_1",
            "processText",
            ContextKind::Popup,
            None,
            json!({ "content": "hello" }),
        );
        let response = channel
            .handle_incoming(serde_json::to_value(request).unwrap())
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.kind.as_deref(), Some("response:processText"));
    }
}
