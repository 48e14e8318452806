//! Execution rule engine.
//!
//! Given an input and the context it came from, the engine picks exactly one
//! rule, runs its processor and records the outcome in the action history.
//! Lookup order is: forced action, then the named rule set, then the default
//! table, each first-match in descending priority. Nothing escapes
//! [`ExecutionCore::execute`]: failures come back as `error` results.

pub mod defaults;
pub mod format;
pub mod rules;

use futures_util::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::ai::AiService;
use crate::clipboard::ClipboardSink;
use crate::config::ExecutionConfig;
use crate::history::{ActionHistoryEntry, ActionStatus, EntryUpdate, SharedHistory};
use crate::messaging::broadcast::{BroadcastHub, CLIPBOARD_CHANNEL};
use crate::types::{
    generate_id, ActionContext, ActionInput, ProcessedResult, ResultType, SourceContext,
};

pub use defaults::{default_rules, BuiltinRule};
pub use format::{ProcessingFormat, RecognitionFormat};
pub use rules::{ConditionFn, ExecutionRule, RuleProcessor, RuleRequest};

lazy_static! {
    static ref TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
}

/// Failures inside the engine boundary
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No matching execution rule found")]
    NoMatchingRule,

    #[error("No files provided")]
    NoFiles,

    #[error("No URL provided")]
    MissingUrl,

    #[error("{0}")]
    Ai(String),

    #[error("Rule processor panicked")]
    Panicked,
}

/// Per-request overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Pick the rule with this action, ignoring conditions
    #[serde(default)]
    pub force_action: Option<String>,
    /// Consult this registered rule set before the default table
    #[serde(default)]
    pub rule_set: Option<String>,
    #[serde(default)]
    pub recognition_format: Option<RecognitionFormat>,
    #[serde(default)]
    pub processing_format: Option<ProcessingFormat>,
    /// Replaces the default instruction of analyze/process rules
    #[serde(default)]
    pub custom_instruction: Option<String>,
}

/// The rule engine
pub struct ExecutionCore {
    rules: Vec<ExecutionRule>,
    rule_sets: HashMap<String, Vec<ExecutionRule>>,
    history: SharedHistory,
    ai: Arc<dyn AiService>,
    clipboard: Option<Arc<dyn ClipboardSink>>,
    broadcast: Option<Arc<BroadcastHub>>,
    defaults: ExecutionConfig,
}

impl ExecutionCore {
    /// Create an engine with no rules registered
    pub fn new(history: SharedHistory, ai: Arc<dyn AiService>, defaults: ExecutionConfig) -> Self {
        Self {
            rules: Vec::new(),
            rule_sets: HashMap::new(),
            history,
            ai,
            clipboard: None,
            broadcast: None,
            defaults,
        }
    }

    /// Create an engine with the built-in rule table
    pub fn with_default_rules(
        history: SharedHistory,
        ai: Arc<dyn AiService>,
        defaults: ExecutionConfig,
    ) -> Self {
        let mut core = Self::new(history, ai, defaults);
        for rule in default_rules() {
            core.register_rule(rule);
        }
        info!("✅ Registered {} default execution rules", core.rules.len());
        core
    }

    /// Clipboard used for auto-copy; without one auto-copy is skipped
    pub fn with_clipboard(mut self, clipboard: Arc<dyn ClipboardSink>) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    /// Hub used to announce successful copies
    pub fn with_broadcast(mut self, broadcast: Arc<BroadcastHub>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// Add a rule, keeping the table sorted by descending priority.
    /// Equal priorities keep registration order.
    pub fn register_rule(&mut self, rule: ExecutionRule) {
        debug!("Registering rule {} (priority {})", rule.id, rule.priority);
        self.rules.push(rule);
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Register a named rule set, consulted in the given order
    pub fn register_rule_set(&mut self, name: impl Into<String>, rules: Vec<ExecutionRule>) {
        self.rule_sets.insert(name.into(), rules);
    }

    pub fn rules(&self) -> &[ExecutionRule] {
        &self.rules
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    /// Resolve the rule for a request without running it
    pub fn find_matching_rule(
        &self,
        input: &ActionInput,
        context: &ActionContext,
        options: &ExecutionOptions,
    ) -> Option<&ExecutionRule> {
        if let Some(action) = &options.force_action {
            let forced = self
                .rules
                .iter()
                .find(|r| &r.action == action && r.accepts(context.source, input.kind));
            if forced.is_some() {
                return forced;
            }
        }

        if let Some(name) = &options.rule_set {
            if let Some(set) = self.rule_sets.get(name) {
                if let Some(rule) = set.iter().find(|r| r.matches(input, context)) {
                    return Some(rule);
                }
            }
        }

        self.rules.iter().find(|r| r.matches(input, context))
    }

    fn resolve_options(&self, mut options: ExecutionOptions) -> ExecutionOptions {
        if options.recognition_format.is_none() {
            options.recognition_format = Some(self.defaults.recognition_format);
        }
        if options.processing_format.is_none() {
            options.processing_format = Some(self.defaults.processing_format);
        }
        if options.rule_set.is_none() {
            options.rule_set = self.defaults.default_rule_set.clone();
        }
        options
    }

    /// Run one request end to end. Never fails: errors become `error` results.
    pub async fn execute(
        &self,
        input: ActionInput,
        context: ActionContext,
        options: ExecutionOptions,
    ) -> ProcessedResult {
        let options = self.resolve_options(options);

        let mut entry = ActionHistoryEntry::new(
            context.clone(),
            options.force_action.as_deref().unwrap_or("auto"),
            input.clone(),
            ActionStatus::Processing,
        );
        entry.rule_set = options.rule_set.clone();
        entry.execution_id = Some(generate_id("exec"));
        let entry_id = self.history.lock().await.add_entry(entry);

        match self.run(&entry_id, &input, &context, &options).await {
            Ok(result) => result,
            Err(e) => {
                let message = e.to_string();
                warn!("❌ Execution failed for {}: {}", context.source, message);
                self.history.lock().await.update_entry(
                    &entry_id,
                    EntryUpdate {
                        status: Some(ActionStatus::Failed),
                        error: Some(message.clone()),
                        ..Default::default()
                    },
                );
                ProcessedResult::error(message)
            }
        }
    }

    async fn run(
        &self,
        entry_id: &str,
        input: &ActionInput,
        context: &ActionContext,
        options: &ExecutionOptions,
    ) -> Result<ProcessedResult, EngineError> {
        let rule = self
            .find_matching_rule(input, context, options)
            .ok_or(EngineError::NoMatchingRule)?;

        debug!("Matched rule {} for {} {}", rule.id, context.source, input.kind.as_str());
        self.history.lock().await.update_entry(
            entry_id,
            EntryUpdate {
                action: Some(rule.action.clone()),
                ..Default::default()
            },
        );

        let request = RuleRequest {
            input,
            context,
            options,
            ai: self.ai.as_ref(),
        };

        let started = Instant::now();
        let mut result = AssertUnwindSafe(rule.processor.process(request))
            .catch_unwind()
            .await
            .map_err(|_| EngineError::Panicked)??;
        let elapsed = started.elapsed().as_millis() as u64;

        result.processing_time = Some(elapsed);
        result.auto_copied = Some(rule.auto_copy);

        self.history.lock().await.update_entry(
            entry_id,
            EntryUpdate {
                status: Some(ActionStatus::Completed),
                result: Some(result.clone()),
                data_category: result.data_category,
                ..Default::default()
            },
        );
        info!("✅ {} finished in {}ms", rule.id, elapsed);

        if rule.auto_copy && !result.is_error() {
            self.auto_copy_result(&result, context).await;
        }

        Ok(result)
    }

    async fn auto_copy_result(&self, result: &ProcessedResult, context: &ActionContext) {
        let Some(text) = copy_text(result) else { return };

        if context.source == SourceContext::ChromeExtension {
            debug!("Auto-copy deferred to the extension messaging path");
            return;
        }

        let Some(clipboard) = &self.clipboard else {
            debug!("No clipboard available, skipping auto-copy");
            return;
        };

        let outcome = clipboard.write_text(&text).await;
        if outcome.ok {
            self.notify_copy_success(context);
        } else {
            warn!(
                "Auto-copy failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    fn notify_copy_success(&self, context: &ActionContext) {
        if let Some(hub) = &self.broadcast {
            hub.publish(
                CLIPBOARD_CHANNEL,
                json!({ "type": "copy-success", "context": context }),
            );
        }
    }
}

/// Text to place on the clipboard for a result, if any
pub fn copy_text(result: &ProcessedResult) -> Option<String> {
    match result.kind {
        ResultType::Markdown | ResultType::Text => Some(result.content.clone()),
        ResultType::Html => Some(TAG.replace_all(&result.content, "").into_owned()),
        ResultType::Json => {
            let recognized = serde_json::from_str::<Value>(&result.content)
                .ok()
                .and_then(|v| v.get("recognized_data").cloned());
            match recognized {
                Some(Value::Array(items)) => Some(
                    items
                        .iter()
                        .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                        .collect::<Vec<_>>()
                        .join("\n\n"),
                ),
                Some(Value::String(s)) => Some(s),
                _ => Some(result.content.clone()),
            }
        }
        ResultType::Error => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiInput, AiOptions, AiResponse};
    use crate::clipboard::CopyOutcome;
    use crate::history::ActionHistoryStore;
    use crate::types::{DataCategory, InputFile, InputKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call and answers with a fixed response
    struct FakeAi {
        response: AiResponse,
        calls: Mutex<Vec<(AiInput, AiOptions)>>,
    }

    impl FakeAi {
        fn answering(response: AiResponse) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AiService for FakeAi {
        async fn recognize(&self, input: AiInput, options: AiOptions) -> AiResponse {
            self.calls.lock().unwrap().push((input, options));
            self.response.clone()
        }

        async fn process(&self, input: AiInput, options: AiOptions) -> AiResponse {
            self.calls.lock().unwrap().push((input, options));
            self.response.clone()
        }
    }

    #[derive(Default)]
    struct RecordingClipboard {
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClipboardSink for RecordingClipboard {
        async fn write_text(&self, text: &str) -> CopyOutcome {
            self.writes.lock().unwrap().push(text.to_string());
            CopyOutcome::success("test")
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl RuleProcessor for Fixed {
        async fn process(&self, _request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
            Ok(ProcessedResult::new(ResultType::Text, self.0))
        }
    }

    struct Failing;

    #[async_trait]
    impl RuleProcessor for Failing {
        async fn process(&self, _request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
            Err(EngineError::Ai("model unavailable".into()))
        }
    }

    fn engine_with(ai: Arc<dyn AiService>) -> ExecutionCore {
        let history = ActionHistoryStore::new(100).into_shared();
        ExecutionCore::with_default_rules(history, ai, ExecutionConfig::default())
    }

    fn text_rule(id: &str, priority: i32, output: &'static str) -> ExecutionRule {
        ExecutionRule::new(
            id,
            SourceContext::Workcenter,
            vec![InputKind::Text],
            id,
            Arc::new(Fixed(output)),
        )
        .with_priority(priority)
    }

    #[tokio::test]
    async fn test_markdown_file_uses_source_rule() {
        let ai = FakeAi::answering(AiResponse::failure("should not be called"));
        let engine = engine_with(ai.clone());

        let input = ActionInput::files(vec![InputFile::new(
            "a.md",
            "text/markdown",
            b"# Notes\n- one".to_vec(),
        )]);
        let result = engine
            .execute(
                input,
                ActionContext::new(SourceContext::Workcenter),
                ExecutionOptions::default(),
            )
            .await;

        assert_eq!(result.kind, ResultType::Markdown);
        assert_eq!(result.content, "# Notes\n- one");
        assert_eq!(result.data_category, Some(DataCategory::Recognized));
        assert_eq!(result.auto_copied, Some(false));
        assert!(result.processing_time.is_some());
        assert!(ai.calls.lock().unwrap().is_empty());

        let history = engine.history().lock().await;
        let entries = history.get_recent_entries(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ActionStatus::Completed);
        assert_eq!(entries[0].action, "source");
        assert!(entries[0].execution_id.as_deref().unwrap().starts_with("exec_"));
    }

    #[tokio::test]
    async fn test_no_matching_rule() {
        let engine = engine_with(FakeAi::answering(AiResponse::failure("unused")));

        let result = engine
            .execute(
                ActionInput::url("https://example.com"),
                ActionContext::new(SourceContext::Workcenter),
                ExecutionOptions::default(),
            )
            .await;

        assert_eq!(result, ProcessedResult::error("No matching execution rule found"));
        let history = engine.history().lock().await;
        let entries = history.get_recent_entries(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ActionStatus::Failed);
        assert_eq!(entries[0].action, "auto");
        assert_eq!(entries[0].error.as_deref(), Some("No matching execution rule found"));
    }

    #[tokio::test]
    async fn test_higher_priority_wins_regardless_of_order() {
        let history = ActionHistoryStore::new(10).into_shared();
        let ai: Arc<dyn AiService> = FakeAi::answering(AiResponse::failure("unused"));
        let mut engine = ExecutionCore::new(history, ai, ExecutionConfig::default());

        engine.register_rule(text_rule("low", 1, "low"));
        engine.register_rule(text_rule("high", 5, "high"));
        engine.register_rule(text_rule("mid", 3, "mid"));

        let ids: Vec<&str> = engine.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["high", "mid", "low"]);

        let result = engine
            .execute(
                ActionInput::text("x"),
                ActionContext::new(SourceContext::Workcenter),
                ExecutionOptions::default(),
            )
            .await;
        assert_eq!(result.content, "high");
    }

    #[tokio::test]
    async fn test_forced_action_and_rule_set() {
        let history = ActionHistoryStore::new(10).into_shared();
        let ai: Arc<dyn AiService> = FakeAi::answering(AiResponse::failure("unused"));
        let mut engine = ExecutionCore::new(history, ai, ExecutionConfig::default());

        engine.register_rule(text_rule("summarize", 5, "summary"));
        engine.register_rule(
            text_rule("translate", 1, "translation").with_condition(|_, _| false),
        );
        engine.register_rule_set("custom", vec![text_rule("custom", 0, "from set")]);

        let ctx = ActionContext::new(SourceContext::Workcenter);
        let forced = ExecutionOptions {
            force_action: Some("translate".into()),
            ..Default::default()
        };
        let result = engine.execute(ActionInput::text("x"), ctx.clone(), forced).await;
        assert_eq!(result.content, "translation");

        let with_set = ExecutionOptions {
            rule_set: Some("custom".into()),
            ..Default::default()
        };
        let result = engine.execute(ActionInput::text("x"), ctx, with_set).await;
        assert_eq!(result.content, "from set");
    }

    #[tokio::test]
    async fn test_processor_error_is_recorded() {
        let history = ActionHistoryStore::new(10).into_shared();
        let ai: Arc<dyn AiService> = FakeAi::answering(AiResponse::failure("unused"));
        let mut engine = ExecutionCore::new(history, ai, ExecutionConfig::default());
        engine.register_rule(ExecutionRule::new(
            "broken",
            SourceContext::Workcenter,
            vec![InputKind::Text],
            "analyze",
            Arc::new(Failing),
        ));

        let result = engine
            .execute(
                ActionInput::text("x"),
                ActionContext::new(SourceContext::Workcenter),
                ExecutionOptions::default(),
            )
            .await;

        assert!(result.is_error());
        assert_eq!(result.content, "model unavailable");
        let history = engine.history().lock().await;
        let entry = &history.get_recent_entries(1)[0];
        assert_eq!(entry.status, ActionStatus::Failed);
        assert_eq!(entry.action, "analyze");
    }

    #[tokio::test]
    async fn test_recognition_uses_ai_and_auto_copies() {
        let ai = FakeAi::answering(AiResponse::success(
            json!({"recognized_data": ["Invoice 42"]}),
            Some("resp_9".into()),
        ));
        let clipboard = Arc::new(RecordingClipboard::default());
        let hub = Arc::new(BroadcastHub::new());
        let mut copies = hub.subscribe(CLIPBOARD_CHANNEL);
        let engine = engine_with(ai.clone())
            .with_clipboard(clipboard.clone())
            .with_broadcast(hub.clone());

        let input = ActionInput::image(vec![InputFile::new("s.png", "image/png", vec![1, 2, 3])]);
        let result = engine
            .execute(
                input,
                ActionContext::new(SourceContext::ShareTarget),
                ExecutionOptions::default(),
            )
            .await;

        assert_eq!(result.kind, ResultType::Json);
        assert_eq!(result.content, "Invoice 42");
        assert_eq!(result.response_id.as_deref(), Some("resp_9"));
        assert_eq!(result.auto_copied, Some(true));
        assert_eq!(*clipboard.writes.lock().unwrap(), vec!["Invoice 42".to_string()]);
        assert_eq!(copies.try_recv().unwrap()["type"], "copy-success");

        let calls = ai.calls.lock().unwrap();
        assert_eq!(
            calls[0].1.instruction,
            "Recognize and extract text/content from the shared image"
        );
    }

    #[tokio::test]
    async fn test_extension_context_defers_copy() {
        let ai = FakeAi::answering(AiResponse::success(json!("plain"), None));
        let clipboard = Arc::new(RecordingClipboard::default());
        let engine = engine_with(ai).with_clipboard(clipboard.clone());

        let input = ActionInput::image(vec![InputFile::new("s.png", "image/png", vec![1])]);
        let result = engine
            .execute(
                input,
                ActionContext::new(SourceContext::ChromeExtension),
                ExecutionOptions::default(),
            )
            .await;

        assert_eq!(result.kind, ResultType::Text);
        assert!(clipboard.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ai_failure_marks_history_failed() {
        let ai = FakeAi::answering(AiResponse::failure("quota exceeded"));
        let engine = engine_with(ai);

        let result = engine
            .execute(
                ActionInput::text("Summarize this"),
                ActionContext::new(SourceContext::Workcenter),
                ExecutionOptions::default(),
            )
            .await;

        assert_eq!(result, ProcessedResult::error("quota exceeded"));
        let stats = engine.history().lock().await.get_stats();
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_copy_text_by_type() {
        let html = ProcessedResult::new(ResultType::Html, "<p>Hello <b>there</b></p>");
        assert_eq!(copy_text(&html).as_deref(), Some("Hello there"));

        let json_result =
            ProcessedResult::new(ResultType::Json, r#"{"recognized_data":["a","b"]}"#);
        assert_eq!(copy_text(&json_result).as_deref(), Some("a\n\nb"));

        let raw_json = ProcessedResult::new(ResultType::Json, "not json");
        assert_eq!(copy_text(&raw_json).as_deref(), Some("not json"));

        assert!(copy_text(&ProcessedResult::error("x")).is_none());
    }
}
