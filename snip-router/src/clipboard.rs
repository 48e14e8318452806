//! Best-effort clipboard writes.
//!
//! A write walks an ordered list of strategies and stops at the first one
//! that reports success:
//!
//! 1. the target tab's content script (injected on demand)
//! 2. the offscreen document (created on demand, then given time to settle)
//! 3. every other open tab
//! 4. the clipboard API of the current context
//!
//! Exhausting the list yields a failed [`CopyOutcome`], never an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::surface::{ClipboardApi, OffscreenApi, TabId, TabsApi};

/// Page loaded into the offscreen document for clipboard access
pub const OFFSCREEN_COPY_URL: &str = "offscreen/copy.html";

/// Message type understood by content scripts and the offscreen document
pub const COPY_MESSAGE: &str = "COPY_HACK";

/// Tagged result of a clipboard write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CopyOutcome {
    pub fn success(method: impl Into<String>) -> Self {
        Self {
            ok: true,
            method: Some(method.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            method: None,
            error: Some(error.into()),
        }
    }
}

/// Anything that can put text on the clipboard
#[async_trait]
pub trait ClipboardSink: Send + Sync {
    async fn write_text(&self, text: &str) -> CopyOutcome;
}

/// Try `attempt` for each strategy in order and stop at the first success.
/// On exhaustion every failure is returned, paired with its strategy.
pub async fn first_ok<S, T, E, F, Fut>(
    strategies: impl IntoIterator<Item = S>,
    mut attempt: F,
) -> Result<(S, T), Vec<(S, E)>>
where
    S: Copy,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failures = Vec::new();
    for strategy in strategies {
        match attempt(strategy).await {
            Ok(value) => return Ok((strategy, value)),
            Err(e) => failures.push((strategy, e)),
        }
    }
    Err(failures)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyStrategy {
    TargetTab,
    Offscreen,
    OtherTabs,
    Native,
}

impl CopyStrategy {
    pub const ALL: [CopyStrategy; 4] = [
        CopyStrategy::TargetTab,
        CopyStrategy::Offscreen,
        CopyStrategy::OtherTabs,
        CopyStrategy::Native,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStrategy::TargetTab => "tab",
            CopyStrategy::Offscreen => "offscreen",
            CopyStrategy::OtherTabs => "broadcast",
            CopyStrategy::Native => "native",
        }
    }
}

/// Options for a single write
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRequest {
    #[serde(default)]
    pub tab_id: Option<TabId>,
    #[serde(default = "default_true")]
    pub show_feedback: bool,
}

impl Default for CopyRequest {
    fn default() -> Self {
        Self {
            tab_id: None,
            show_feedback: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Walks the clipboard strategy chain
pub struct ClipboardOrchestrator {
    tabs: Arc<dyn TabsApi>,
    offscreen: Arc<dyn OffscreenApi>,
    native: Option<Arc<dyn ClipboardApi>>,
    settle: Duration,
}

impl ClipboardOrchestrator {
    pub fn new(
        tabs: Arc<dyn TabsApi>,
        offscreen: Arc<dyn OffscreenApi>,
        native: Option<Arc<dyn ClipboardApi>>,
        settle: Duration,
    ) -> Self {
        Self {
            tabs,
            offscreen,
            native,
            settle,
        }
    }

    /// Write `text`, trying each strategy until one succeeds
    pub async fn copy(&self, text: &str, request: CopyRequest) -> CopyOutcome {
        let text = text.trim();
        if text.is_empty() {
            return CopyOutcome::failure("Empty content");
        }

        let message = json!({
            "type": COPY_MESSAGE,
            "data": text,
            "showFeedback": request.show_feedback,
        });

        let outcome = first_ok(CopyStrategy::ALL, |strategy| {
            self.attempt(strategy, &message, request.tab_id)
        })
        .await;

        match outcome {
            Ok((strategy, ())) => {
                info!("📋 Copied {} chars via {}", text.len(), strategy.as_str());
                CopyOutcome::success(strategy.as_str())
            }
            Err(failures) => {
                for (strategy, error) in &failures {
                    debug!("Clipboard strategy {} failed: {}", strategy.as_str(), error);
                }
                warn!("All clipboard methods failed");
                CopyOutcome::failure("All clipboard methods failed")
            }
        }
    }

    async fn attempt(
        &self,
        strategy: CopyStrategy,
        message: &Value,
        target: Option<TabId>,
    ) -> Result<(), String> {
        match strategy {
            CopyStrategy::TargetTab => {
                let tab = target.filter(|t| *t > 0).ok_or("no target tab")?;
                if !self.tabs.tab_exists(tab).await {
                    return Err(format!("tab {} not found", tab));
                }
                self.copy_in_tab(tab, message).await
            }
            CopyStrategy::Offscreen => {
                if !self.offscreen.has_document().await {
                    self.offscreen
                        .create_document(OFFSCREEN_COPY_URL, "CLIPBOARD")
                        .await
                        .map_err(|e| e.to_string())?;
                    tokio::time::sleep(self.settle).await;
                }
                let mut offscreen_message = message.clone();
                offscreen_message["target"] = json!("offscreen");
                let response = self
                    .offscreen
                    .send_message(offscreen_message)
                    .await
                    .map_err(|e| e.to_string())?;
                accepted(&response)
            }
            CopyStrategy::OtherTabs => {
                for tab in self.tabs.list_tabs().await {
                    if Some(tab) == target {
                        continue;
                    }
                    if self.copy_in_tab(tab, message).await.is_ok() {
                        return Ok(());
                    }
                }
                Err("no tab accepted the copy request".to_string())
            }
            CopyStrategy::Native => {
                let native = self.native.as_ref().ok_or("no clipboard API in this context")?;
                let text = message["data"].as_str().unwrap_or_default();
                native.write_text(text).await.map_err(|e| e.to_string())
            }
        }
    }

    async fn copy_in_tab(&self, tab: TabId, message: &Value) -> Result<(), String> {
        if let Err(e) = self.tabs.inject_content_script(tab).await {
            debug!("Content script injection into tab {} failed: {}", tab, e);
        }
        let response = self
            .tabs
            .send_message(tab, None, message.clone())
            .await
            .map_err(|e| e.to_string())?;
        accepted(&response)
    }
}

/// Content scripts answer `{ok: true}` (older builds: `{success: true}`)
fn accepted(response: &Value) -> Result<(), String> {
    let ok = ["ok", "success"]
        .iter()
        .any(|k| response.get(*k).and_then(Value::as_bool) == Some(true));
    if ok {
        Ok(())
    } else {
        Err(response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("copy rejected")
            .to_string())
    }
}

#[async_trait]
impl ClipboardSink for ClipboardOrchestrator {
    async fn write_text(&self, text: &str) -> CopyOutcome {
        self.copy(text, CopyRequest::default()).await
    }
}
