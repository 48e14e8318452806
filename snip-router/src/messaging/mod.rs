//! Message routing between extension contexts.
//!
//! Messages carry a generated id, a `request:{method}` / `response:{method}`
//! type, the sending context and an optional target. Requests are answered by
//! handlers registered by name; anything unroutable gets an explicit error
//! response instead of being dropped.

pub mod broadcast;
pub mod native;
pub mod runtime;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::types::now_millis;

pub use broadcast::BroadcastHub;
pub use runtime::{RuntimeChannel, RuntimeTransport};

/// Errors surfaced to callers of the routing layer
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("No handler for type: {0}")]
    NoHandler(String),

    #[error("Message not targeted at this context")]
    NotTargeted,

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Chrome extension messaging is only available in Chrome extension context. Current context: {0}")]
    Unsupported(ContextKind),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("{0}")]
    Remote(String),

    #[error("Frame of {0} bytes exceeds the native messaging limit")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Execution context of a message endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    ContentScript,
    Popup,
    Background,
    ServiceWorker,
    Offscreen,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::ContentScript => "content-script",
            ContextKind::Popup => "popup",
            ContextKind::Background => "background",
            ContextKind::ServiceWorker => "service-worker",
            ContextKind::Offscreen => "offscreen",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<MessagePriority>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Envelope exchanged between contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrxMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: ContextKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ContextKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl CrxMessage {
    /// `request:{method}` message stamped with the current time
    pub fn request(
        id: impl Into<String>,
        method: &str,
        source: ContextKind,
        target: Option<ContextKind>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: format!("request:{}", method),
            source,
            target,
            tab_id: None,
            frame_id: None,
            data,
            metadata: Some(MessageMetadata {
                timestamp: Some(now_millis()),
                ..Default::default()
            }),
        }
    }

    /// Method name of a request, if this is one
    pub fn method(&self) -> Option<&str> {
        self.kind.strip_prefix("request:")
    }

    pub fn is_response(&self) -> bool {
        self.kind.starts_with("response:")
    }
}

/// Reply to a [`CrxMessage`] request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ContextKind>,
}

impl RpcResponse {
    pub fn success(id: &str, method: &str, result: Value, source: ContextKind) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: Some(format!("response:{}", method)),
            success: true,
            result: Some(result),
            error: None,
            source: Some(source),
        }
    }

    pub fn failure(
        id: Option<&str>,
        kind: Option<String>,
        error: impl Into<String>,
        source: ContextKind,
    ) -> Self {
        Self {
            id: id.map(String::from),
            kind,
            success: false,
            result: None,
            error: Some(error.into()),
            source: Some(source),
        }
    }
}

/// Async request handler: message data in, result or error message out
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Name to handler map
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |data| handler(data).boxed());
        self.write().insert(name.into(), handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.read().get(name).cloned()
    }

    /// Run the handler for `name`
    pub async fn dispatch(&self, name: &str, data: Value) -> Result<Value, MessagingError> {
        let handler = self
            .get(name)
            .ok_or_else(|| MessagingError::NoHandler(name.to_string()))?;
        handler(data).await.map_err(MessagingError::Remote)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Handler>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Handler>> {
        self.handlers.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Methods the background service answers over the runtime channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackgroundMethod {
    Capture,
    CaptureScreenshot,
    CaptureWithRect,
    ProcessImage,
    ProcessText,
    DoCopy,
    LoadMarkdown,
}

impl BackgroundMethod {
    pub const ALL: [BackgroundMethod; 7] = [
        BackgroundMethod::Capture,
        BackgroundMethod::CaptureScreenshot,
        BackgroundMethod::CaptureWithRect,
        BackgroundMethod::ProcessImage,
        BackgroundMethod::ProcessText,
        BackgroundMethod::DoCopy,
        BackgroundMethod::LoadMarkdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundMethod::Capture => "capture",
            BackgroundMethod::CaptureScreenshot => "captureScreenshot",
            BackgroundMethod::CaptureWithRect => "captureWithRect",
            BackgroundMethod::ProcessImage => "processImage",
            BackgroundMethod::ProcessText => "processText",
            BackgroundMethod::DoCopy => "doCopy",
            BackgroundMethod::LoadMarkdown => "loadMarkdown",
        }
    }

    pub fn parse(method: &str) -> Result<Self, MessagingError> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == method)
            .ok_or_else(|| MessagingError::UnknownMethod(method.to_string()))
    }
}
