//! Result delivery pipeline.
//!
//! A bounded queue of processed results, each fanned out to a list of
//! destinations. A drain pass picks up every `pending` item, tries all of its
//! destinations in order and completes the item as soon as any one succeeded.
//! Items with no successful destination go back to `pending` until they run
//! out of attempts, then become `failed`.

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clipboard::{ClipboardOrchestrator, CopyRequest};
use crate::config::PipelineConfig;
use crate::engine::{copy_text, ExecutionCore, ExecutionOptions};
use crate::messaging::broadcast::{BroadcastHub, POPUP_CHANNEL, SHARE_TARGET_CHANNEL};
use crate::surface::{NotificationApi, SurfaceError, TabId, TabsApi};
use crate::types::{base64_bytes, now_millis, ActionContext, ActionInput, SourceContext};

const NOTIFICATION_LIMIT: usize = 100;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Not found")]
    NotFound,
}

/// Per-destination delivery failure
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("{0}")]
    Clipboard(String),

    #[error("{0}")]
    Surface(#[from] SurfaceError),

    #[error("WorkCenter delivery failed")]
    Workcenter,

    #[error("Delivery panicked")]
    Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultSource {
    CrxSnip,
    ContentScript,
    AiProcessing,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::CrxSnip => "crx-snip",
            ResultSource::ContentScript => "content-script",
            ResultSource::AiProcessing => "ai-processing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineResultType {
    Text,
    Image,
    Markdown,
    Processed,
}

impl PipelineResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineResultType::Text => "text",
            PipelineResultType::Image => "image",
            PipelineResultType::Markdown => "markdown",
            PipelineResultType::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryPayload {
    #[serde(with = "base64_bytes")]
    pub binary: Vec<u8>,
}

/// Result payload: text, or raw bytes carried as `{"binary": "<base64>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultContent {
    Text(String),
    Binary(BinaryPayload),
}

impl ResultContent {
    /// Text form used by every destination
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            ResultContent::Text(text) => Cow::Borrowed(text),
            ResultContent::Binary(payload) => {
                Cow::Owned(format!("[Binary {} bytes]", payload.binary.len()))
            }
        }
    }
}

/// A result waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PipelineResultType,
    pub content: ResultContent,
    pub source: ResultSource,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl PipelineResult {
    pub fn new(kind: PipelineResultType, content: ResultContent, source: ResultSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content,
            source,
            timestamp: now_millis(),
            metadata: None,
        }
    }

    pub fn text(content: impl Into<String>, source: ResultSource) -> Self {
        Self::new(
            PipelineResultType::Text,
            ResultContent::Text(content.into()),
            source,
        )
    }
}

fn default_true() -> bool {
    true
}

/// Where a result should go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Destination {
    Clipboard {
        #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
        #[serde(rename = "showFeedback", default = "default_true")]
        show_feedback: bool,
    },
    /// A specific tab/frame, or every tab when `tab_id` is unset
    ContentScript {
        #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
        #[serde(rename = "frameId", default, skip_serializing_if = "Option::is_none")]
        frame_id: Option<i64>,
    },
    Popup,
    Workcenter,
    Notification,
}

impl Destination {
    pub fn clipboard() -> Self {
        Destination::Clipboard {
            tab_id: None,
            show_feedback: true,
        }
    }

    pub fn content_script() -> Self {
        Destination::ContentScript {
            tab_id: None,
            frame_id: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Destination::Clipboard { .. } => "clipboard",
            Destination::ContentScript { .. } => "content-script",
            Destination::Popup => "popup",
            Destination::Workcenter => "workcenter",
            Destination::Notification => "notification",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResult {
    pub id: String,
    pub result: PipelineResult,
    pub destinations: Vec<Destination>,
    pub status: PendingStatus,
    pub attempts: u32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub queue_size: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Delivers one result to one destination
#[async_trait]
pub trait DeliverySurface: Send + Sync {
    async fn deliver(
        &self,
        result: &PipelineResult,
        destination: &Destination,
    ) -> Result<(), DeliveryError>;
}

/// Routes destinations to the clipboard chain, tabs, broadcast channels and
/// OS notifications
pub struct DefaultSurface {
    clipboard: Arc<ClipboardOrchestrator>,
    tabs: Arc<dyn TabsApi>,
    hub: Arc<BroadcastHub>,
    notifier: Arc<dyn NotificationApi>,
}

impl DefaultSurface {
    pub fn new(
        clipboard: Arc<ClipboardOrchestrator>,
        tabs: Arc<dyn TabsApi>,
        hub: Arc<BroadcastHub>,
        notifier: Arc<dyn NotificationApi>,
    ) -> Self {
        Self {
            clipboard,
            tabs,
            hub,
            notifier,
        }
    }

    fn delivered_message(result: &PipelineResult, destination: &Destination) -> Value {
        json!({
            "type": "crx-result-delivered",
            "result": result,
            "destination": destination.kind(),
            "timestamp": now_millis(),
        })
    }

    fn content_share_message(result: &PipelineResult, text: &str) -> Value {
        json!({
            "id": result.id,
            "type": "content-share",
            "source": "crx-snip",
            "destination": "workcenter",
            "contentType": result.kind,
            "data": {
                "text": text,
                "processed": true,
                "source": result.source,
                "metadata": result.metadata,
            },
            "metadata": {
                "title": format!("CRX-Snip {} Result", result.kind.as_str()),
                "timestamp": result.timestamp,
                "source": result.source,
            },
        })
    }
}

#[async_trait]
impl DeliverySurface for DefaultSurface {
    async fn deliver(
        &self,
        result: &PipelineResult,
        destination: &Destination,
    ) -> Result<(), DeliveryError> {
        let text = result.content.as_text();

        match destination {
            Destination::Clipboard {
                tab_id,
                show_feedback,
            } => {
                let request = CopyRequest {
                    tab_id: *tab_id,
                    show_feedback: *show_feedback,
                };
                let outcome = self.clipboard.copy(&text, request).await;
                if outcome.ok {
                    Ok(())
                } else {
                    Err(DeliveryError::Clipboard(
                        outcome.error.unwrap_or_else(|| "Clipboard write failed".to_string()),
                    ))
                }
            }
            Destination::ContentScript { tab_id, frame_id } => {
                let message = Self::delivered_message(result, destination);
                match tab_id {
                    Some(tab) => {
                        self.tabs.send_message(*tab, *frame_id, message).await?;
                    }
                    None => {
                        // Best effort to every tab; individual failures are ignored
                        for tab in self.tabs.list_tabs().await {
                            if let Err(e) =
                                self.tabs.send_message(tab, None, message.clone()).await
                            {
                                debug!("Tab {} did not take the result: {}", tab, e);
                            }
                        }
                    }
                }
                Ok(())
            }
            Destination::Popup => {
                self.hub
                    .publish(POPUP_CHANNEL, Self::delivered_message(result, destination));
                Ok(())
            }
            Destination::Workcenter => {
                let message = Self::content_share_message(result, &text);
                if self.hub.publish(SHARE_TARGET_CHANNEL, message) == 0 {
                    return Err(DeliveryError::Workcenter);
                }
                Ok(())
            }
            Destination::Notification => {
                let title = format!("CrossWord {}", result.source.as_str());
                self.notifier
                    .notify(&title, &truncate_for_notification(&text))
                    .await?;
                Ok(())
            }
        }
    }
}

/// First 100 characters plus `...` when longer
pub fn truncate_for_notification(text: &str) -> String {
    match text.char_indices().nth(NOTIFICATION_LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Outcome of [`ResultPipeline::process_snip`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnipOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The delivery queue and its drain task
pub struct ResultPipeline {
    queue: Mutex<VecDeque<PendingResult>>,
    surface: Arc<dyn DeliverySurface>,
    config: PipelineConfig,
    drain_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ResultPipeline {
    pub fn new(surface: Arc<dyn DeliverySurface>, config: PipelineConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            surface,
            config,
            drain_task: std::sync::Mutex::new(None),
        }
    }

    /// Queue `result` for delivery and return the item id
    pub async fn enqueue(&self, result: PipelineResult, destinations: Vec<Destination>) -> String {
        let item = PendingResult {
            id: Uuid::new_v4().to_string(),
            result,
            destinations,
            status: PendingStatus::Pending,
            attempts: 0,
            created_at: now_millis(),
            completed_at: None,
            error: None,
        };
        let id = item.id.clone();

        let mut queue = self.queue.lock().await;
        queue.push_back(item);
        if queue.len() > self.config.max_queue_size {
            self.evict(&mut queue);
        }
        debug!("📥 Queued result {} ({} items)", id, queue.len());
        id
    }

    /// Drop one item older than the one just pushed. With `protect_processing`
    /// the queue may run over capacity while everything older is mid-delivery.
    fn evict(&self, queue: &mut VecDeque<PendingResult>) {
        let older = queue.len().saturating_sub(1);
        let index = if self.config.protect_processing {
            queue
                .range(..older)
                .position(|item| item.status != PendingStatus::Processing)
        } else {
            Some(0)
        };

        match index.and_then(|i| queue.remove(i)) {
            Some(evicted) if evicted.status == PendingStatus::Pending => {
                warn!("⚠️ Queue full, dropped undelivered result {}", evicted.id);
            }
            Some(evicted) => {
                debug!("Queue full, dropped {:?} result {}", evicted.status, evicted.id);
            }
            None => {
                warn!("⚠️ Queue full but every item is mid-delivery; keeping all");
            }
        }
    }

    pub async fn get_status(&self) -> PipelineStatus {
        let queue = self.queue.lock().await;
        let mut status = PipelineStatus {
            queue_size: queue.len(),
            ..Default::default()
        };
        for item in queue.iter() {
            match item.status {
                PendingStatus::Pending => status.pending += 1,
                PendingStatus::Processing => status.processing += 1,
                PendingStatus::Completed => status.completed += 1,
                PendingStatus::Failed => status.failed += 1,
            }
        }
        status
    }

    /// Pending items, optionally only those with a destination of this type
    pub async fn get_pending(&self, destination_type: Option<&str>) -> Vec<PendingResult> {
        self.queue
            .lock()
            .await
            .iter()
            .filter(|item| item.status == PendingStatus::Pending)
            .filter(|item| {
                destination_type.map_or(true, |t| item.destinations.iter().any(|d| d.kind() == t))
            })
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<PendingResult> {
        self.queue.lock().await.iter().find(|i| i.id == id).cloned()
    }

    /// Remove completed items and return how many were removed
    pub async fn clear_completed(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|item| item.status != PendingStatus::Completed);
        before - queue.len()
    }

    /// Add a destination to an existing item. A completed item goes back to
    /// `pending` so the new destination is delivered on the next pass.
    pub async fn send_to_destination(
        &self,
        id: &str,
        destination: Destination,
    ) -> Result<(), PipelineError> {
        let mut queue = self.queue.lock().await;
        let item = queue
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(PipelineError::NotFound)?;

        item.destinations.push(destination);
        if item.status == PendingStatus::Completed {
            item.status = PendingStatus::Pending;
            item.completed_at = None;
        }
        Ok(())
    }

    /// One drain pass over every item that is pending right now
    pub async fn drain_once(&self) {
        let batch: Vec<(String, PipelineResult, Vec<Destination>)> = {
            let mut queue = self.queue.lock().await;
            queue
                .iter_mut()
                .filter(|item| item.status == PendingStatus::Pending)
                .map(|item| {
                    item.status = PendingStatus::Processing;
                    item.attempts += 1;
                    (item.id.clone(), item.result.clone(), item.destinations.clone())
                })
                .collect()
        };

        if batch.is_empty() {
            return;
        }

        let outcomes = join_all(batch.into_iter().map(|(id, result, destinations)| async move {
            let delivered = self.deliver_all(&result, &destinations).await;
            (id, delivered)
        }))
        .await;

        let mut queue = self.queue.lock().await;
        for (id, delivered) in outcomes {
            // Evicted or cleared while delivering
            let Some(item) = queue.iter_mut().find(|i| i.id == id) else {
                continue;
            };

            if delivered > 0 {
                item.status = PendingStatus::Completed;
                item.completed_at = Some(now_millis());
                item.error = None;
                info!("✅ Delivered result {} to {} destination(s)", id, delivered);
            } else if item.attempts >= self.config.max_retries {
                item.status = PendingStatus::Failed;
                item.error = Some("All destinations failed".to_string());
                warn!("❌ Result {} failed after {} attempts", id, item.attempts);
            } else {
                item.status = PendingStatus::Pending;
                debug!("Result {} will retry (attempt {})", id, item.attempts);
            }
        }
    }

    /// Try every destination in order; returns how many succeeded
    async fn deliver_all(&self, result: &PipelineResult, destinations: &[Destination]) -> usize {
        let mut delivered = 0;
        for destination in destinations {
            let attempt = AssertUnwindSafe(self.surface.deliver(result, destination))
                .catch_unwind()
                .await
                .unwrap_or(Err(DeliveryError::Panicked));
            match attempt {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Delivery to {} failed: {}", destination.kind(), e),
            }
        }
        delivered
    }

    /// Start the periodic drain. The task holds only a weak reference and
    /// exits once the pipeline is dropped.
    pub fn spawn_drain(self: &Arc<Self>) {
        let pipeline: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.drain_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pipeline) = pipeline.upgrade() else { break };
                pipeline.drain_once().await;
            }
        });

        let mut slot = self.drain_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the drain task and drop every queued item
    pub async fn destroy(&self) {
        let handle = self
            .drain_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.queue.lock().await.clear();
        info!("🛑 Result pipeline stopped");
    }

    /// Run `input` through the engine as a chrome-extension request and queue
    /// the processed text for clipboard, tabs, work center and notification
    pub async fn process_snip(
        &self,
        engine: &ExecutionCore,
        input: ActionInput,
        options: ExecutionOptions,
        extra_destinations: Vec<Destination>,
    ) -> SnipOutcome {
        let processed = engine
            .execute(input, ActionContext::new(SourceContext::ChromeExtension), options)
            .await;

        if processed.is_error() {
            return SnipOutcome {
                success: false,
                result_id: None,
                error: Some(processed.content),
            };
        }

        let text = copy_text(&processed).unwrap_or_else(|| processed.content.clone());
        let mut result = PipelineResult::new(
            PipelineResultType::Processed,
            ResultContent::Text(text),
            ResultSource::CrxSnip,
        );
        let mut metadata = Map::new();
        metadata.insert("resultType".into(), json!(processed.kind));
        if let Some(response_id) = &processed.response_id {
            metadata.insert("responseId".into(), json!(response_id));
        }
        result.metadata = Some(metadata);

        let mut destinations = vec![
            Destination::clipboard(),
            Destination::content_script(),
            Destination::Workcenter,
            Destination::Notification,
        ];
        destinations.extend(extra_destinations);

        let id = self.enqueue(result, destinations).await;
        SnipOutcome {
            success: true,
            result_id: Some(id),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Scripted surface: destination kind -> succeed?; panics on "popup"
    struct ScriptedSurface {
        outcomes: HashMap<&'static str, bool>,
        calls: StdMutex<Vec<&'static str>>,
    }

    impl ScriptedSurface {
        fn new(outcomes: &[(&'static str, bool)]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: outcomes.iter().copied().collect(),
                calls: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DeliverySurface for ScriptedSurface {
        async fn deliver(
            &self,
            _result: &PipelineResult,
            destination: &Destination,
        ) -> Result<(), DeliveryError> {
            self.calls.lock().unwrap().push(destination.kind());
            if destination.kind() == "popup" {
                panic!("popup exploded");
            }
            if self.outcomes.get(destination.kind()).copied().unwrap_or(false) {
                Ok(())
            } else {
                Err(DeliveryError::Clipboard("nope".into()))
            }
        }
    }

    fn pipeline(surface: Arc<ScriptedSurface>, config: PipelineConfig) -> ResultPipeline {
        ResultPipeline::new(surface, config)
    }

    fn sample() -> PipelineResult {
        PipelineResult::text("hello", ResultSource::CrxSnip)
    }

    #[tokio::test]
    async fn test_any_success_completes() {
        let surface = ScriptedSurface::new(&[("clipboard", false), ("notification", true)]);
        let pipeline = pipeline(surface.clone(), PipelineConfig::default());

        let id = pipeline
            .enqueue(sample(), vec![Destination::clipboard(), Destination::Notification])
            .await;
        pipeline.drain_once().await;

        let item = pipeline.get(&id).await.unwrap();
        assert_eq!(item.status, PendingStatus::Completed);
        assert_eq!(item.attempts, 1);
        assert!(item.completed_at.is_some());
        assert_eq!(*surface.calls.lock().unwrap(), vec!["clipboard", "notification"]);
    }

    #[tokio::test]
    async fn test_fails_after_max_retries() {
        let surface = ScriptedSurface::new(&[("clipboard", false)]);
        let pipeline = pipeline(surface, PipelineConfig::default());
        let id = pipeline.enqueue(sample(), vec![Destination::clipboard()]).await;

        pipeline.drain_once().await;
        assert_eq!(pipeline.get(&id).await.unwrap().status, PendingStatus::Pending);
        pipeline.drain_once().await;
        assert_eq!(pipeline.get(&id).await.unwrap().status, PendingStatus::Pending);
        pipeline.drain_once().await;

        let item = pipeline.get(&id).await.unwrap();
        assert_eq!(item.status, PendingStatus::Failed);
        assert_eq!(item.attempts, 3);
        assert_eq!(item.error.as_deref(), Some("All destinations failed"));

        // Terminal items are not retried
        pipeline.drain_once().await;
        assert_eq!(pipeline.get(&id).await.unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_panicking_destination_is_contained() {
        let surface = ScriptedSurface::new(&[("workcenter", true)]);
        let pipeline = pipeline(surface.clone(), PipelineConfig::default());
        let id = pipeline
            .enqueue(sample(), vec![Destination::Popup, Destination::Workcenter])
            .await;

        pipeline.drain_once().await;

        assert_eq!(pipeline.get(&id).await.unwrap().status, PendingStatus::Completed);
        assert_eq!(*surface.calls.lock().unwrap(), vec!["popup", "workcenter"]);
    }

    #[tokio::test]
    async fn test_status_pending_filter_and_clear() {
        let surface = ScriptedSurface::new(&[("notification", true)]);
        let pipeline = pipeline(surface, PipelineConfig::default());

        let done = pipeline.enqueue(sample(), vec![Destination::Notification]).await;
        pipeline.drain_once().await;
        pipeline.enqueue(sample(), vec![Destination::clipboard()]).await;
        pipeline.enqueue(sample(), vec![Destination::Workcenter]).await;

        let status = pipeline.get_status().await;
        assert_eq!(
            status,
            PipelineStatus { queue_size: 3, pending: 2, processing: 0, completed: 1, failed: 0 }
        );
        assert_eq!(pipeline.get_pending(None).await.len(), 2);
        assert_eq!(pipeline.get_pending(Some("workcenter")).await.len(), 1);
        assert_eq!(pipeline.get_pending(Some("popup")).await.len(), 0);

        assert_eq!(pipeline.clear_completed().await, 1);
        assert!(pipeline.get(&done).await.is_none());
        assert_eq!(pipeline.get_status().await.queue_size, 2);
    }

    #[tokio::test]
    async fn test_send_to_destination_requeues_completed() {
        let surface = ScriptedSurface::new(&[("notification", true), ("clipboard", true)]);
        let pipeline = pipeline(surface.clone(), PipelineConfig::default());
        let id = pipeline.enqueue(sample(), vec![Destination::Notification]).await;
        pipeline.drain_once().await;

        pipeline
            .send_to_destination(&id, Destination::clipboard())
            .await
            .unwrap();
        let item = pipeline.get(&id).await.unwrap();
        assert_eq!(item.status, PendingStatus::Pending);
        assert_eq!(item.destinations.len(), 2);

        pipeline.drain_once().await;
        assert_eq!(pipeline.get(&id).await.unwrap().attempts, 2);
        assert!(matches!(
            pipeline.send_to_destination("missing", Destination::Popup).await,
            Err(PipelineError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let surface = ScriptedSurface::new(&[]);
        let config = PipelineConfig {
            max_queue_size: 2,
            ..Default::default()
        };
        let pipeline = pipeline(surface, config);

        let first = pipeline.enqueue(sample(), vec![]).await;
        let second = pipeline.enqueue(sample(), vec![]).await;
        let third = pipeline.enqueue(sample(), vec![]).await;

        assert!(pipeline.get(&first).await.is_none());
        assert!(pipeline.get(&second).await.is_some());
        assert!(pipeline.get(&third).await.is_some());
    }

    #[tokio::test]
    async fn test_overflow_skips_items_mid_delivery() {
        let surface = ScriptedSurface::new(&[]);
        let config = PipelineConfig {
            max_queue_size: 2,
            ..Default::default()
        };
        let pipeline = pipeline(surface, config);

        let first = pipeline.enqueue(sample(), vec![]).await;
        let second = pipeline.enqueue(sample(), vec![]).await;
        pipeline.queue.lock().await[0].status = PendingStatus::Processing;
        pipeline.enqueue(sample(), vec![]).await;

        assert!(pipeline.get(&first).await.is_some());
        assert!(pipeline.get(&second).await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_keeps_new_item_when_all_mid_delivery() {
        let surface = ScriptedSurface::new(&[]);
        let config = PipelineConfig {
            max_queue_size: 2,
            ..Default::default()
        };
        let pipeline = pipeline(surface, config);

        let first = pipeline.enqueue(sample(), vec![]).await;
        let second = pipeline.enqueue(sample(), vec![]).await;
        for item in pipeline.queue.lock().await.iter_mut() {
            item.status = PendingStatus::Processing;
        }
        let third = pipeline.enqueue(sample(), vec![]).await;

        assert!(pipeline.get(&first).await.is_some());
        assert!(pipeline.get(&second).await.is_some());
        let item = pipeline.get(&third).await.unwrap();
        assert_eq!(item.status, PendingStatus::Pending);
        assert_eq!(pipeline.get_status().await.queue_size, 3);
    }

    #[tokio::test]
    async fn test_drain_task_and_destroy() {
        let surface = ScriptedSurface::new(&[("notification", true)]);
        let config = PipelineConfig {
            drain_interval_ms: 10,
            ..Default::default()
        };
        let pipeline = Arc::new(pipeline(surface, config));
        pipeline.spawn_drain();

        let id = pipeline.enqueue(sample(), vec![Destination::Notification]).await;
        let mut completed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pipeline.get(&id).await.map(|i| i.status) == Some(PendingStatus::Completed) {
                completed = true;
                break;
            }
        }
        assert!(completed);

        pipeline.destroy().await;
        assert_eq!(pipeline.get_status().await.queue_size, 0);
    }

    #[test]
    fn test_notification_truncation_and_binary_text() {
        let long = "x".repeat(150);
        let short = truncate_for_notification(&long);
        assert_eq!(short.len(), 103);
        assert!(short.ends_with("..."));
        assert_eq!(truncate_for_notification("short"), "short");
        assert_eq!(truncate_for_notification(&"é".repeat(100)), "é".repeat(100));

        let binary = ResultContent::Binary(BinaryPayload { binary: vec![0; 12] });
        assert_eq!(binary.as_text(), "[Binary 12 bytes]");
    }

    #[test]
    fn test_destination_wire_format() {
        let dest: Destination =
            serde_json::from_value(json!({"type": "content-script", "tabId": 4})).unwrap();
        assert_eq!(dest, Destination::ContentScript { tab_id: Some(4), frame_id: None });

        let clip: Destination = serde_json::from_value(json!({"type": "clipboard"})).unwrap();
        assert_eq!(clip, Destination::clipboard());
        assert_eq!(
            serde_json::to_value(Destination::Workcenter).unwrap(),
            json!({"type": "workcenter"})
        );
    }
}
