//! Platform collaborators.
//!
//! Browser tabs, the offscreen document, screen capture, the system
//! clipboard and OS notifications are reached through these traits so the
//! core can be driven by the extension bridge in production and by fakes in
//! tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Browser tab identifier
pub type TabId = i64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurfaceError {
    #[error("{0} is not available in this context")]
    Unavailable(&'static str),
    #[error("Tab {0} not found")]
    TabNotFound(TabId),
    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for SurfaceError {
    fn from(e: std::io::Error) -> Self {
        SurfaceError::Failed(e.to_string())
    }
}

/// Open tabs and their content scripts
#[async_trait]
pub trait TabsApi: Send + Sync {
    async fn tab_exists(&self, tab_id: TabId) -> bool;
    async fn list_tabs(&self) -> Vec<TabId>;
    /// Inject the content-script bundle; a no-op when already present
    async fn inject_content_script(&self, tab_id: TabId) -> Result<(), SurfaceError>;
    async fn send_message(
        &self,
        tab_id: TabId,
        frame_id: Option<i64>,
        message: Value,
    ) -> Result<Value, SurfaceError>;
}

/// The singleton offscreen document
#[async_trait]
pub trait OffscreenApi: Send + Sync {
    async fn has_document(&self) -> bool;
    async fn create_document(&self, url: &str, reason: &str) -> Result<(), SurfaceError>;
    async fn send_message(&self, message: Value) -> Result<Value, SurfaceError>;
}

/// Direct clipboard access from the current context
#[async_trait]
pub trait ClipboardApi: Send + Sync {
    async fn write_text(&self, text: &str) -> Result<(), SurfaceError>;
}

/// OS notifications
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn notify(&self, title: &str, message: &str) -> Result<(), SurfaceError>;
}

/// Crop rectangle in CSS pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CaptureRect {
    /// Rects with a zero or negative side mean "whole tab"
    pub fn is_usable(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabCaptureOptions {
    #[serde(default)]
    pub rect: Option<CaptureRect>,
    #[serde(default)]
    pub scale: Option<f64>,
}

/// Screenshot sources; both return PNG data URLs
#[async_trait]
pub trait CaptureApi: Send + Sync {
    async fn capture_visible_tab(
        &self,
        options: &TabCaptureOptions,
    ) -> Result<String, SurfaceError>;
    async fn capture_desktop(&self, rect: Option<CaptureRect>) -> Result<String, SurfaceError>;
}

/// System clipboard through `arboard`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

#[async_trait]
impl ClipboardApi for SystemClipboard {
    async fn write_text(&self, text: &str) -> Result<(), SurfaceError> {
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut clipboard =
                arboard::Clipboard::new().map_err(|e| SurfaceError::Failed(e.to_string()))?;
            clipboard
                .set_text(text)
                .map_err(|e| SurfaceError::Failed(e.to_string()))
        })
        .await
        .map_err(|e| SurfaceError::Failed(e.to_string()))?
    }
}

/// Runs an external program (`notify-send` by default) with title and message
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
}

impl CommandNotifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CommandNotifier {
    fn default() -> Self {
        Self::new("notify-send")
    }
}

#[async_trait]
impl NotificationApi for CommandNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), SurfaceError> {
        debug!("Running {} for notification {:?}", self.program, title);
        let status = Command::new(&self.program)
            .arg(title)
            .arg(message)
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(SurfaceError::Failed(format!(
                "{} exited with {}",
                self.program, status
            )))
        }
    }
}

/// Notifier that only logs; used when no notification program is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationApi for LogNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), SurfaceError> {
        info!("🔔 {}: {}", title, message);
        Ok(())
    }
}

/// Placeholder for contexts that have no tabs (daemon without a bridge)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTabs;

#[async_trait]
impl TabsApi for NoTabs {
    async fn tab_exists(&self, _tab_id: TabId) -> bool {
        false
    }

    async fn list_tabs(&self) -> Vec<TabId> {
        Vec::new()
    }

    async fn inject_content_script(&self, _tab_id: TabId) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unavailable("tabs"))
    }

    async fn send_message(
        &self,
        _tab_id: TabId,
        _frame_id: Option<i64>,
        _message: Value,
    ) -> Result<Value, SurfaceError> {
        Err(SurfaceError::Unavailable("tabs"))
    }
}

#[async_trait]
impl OffscreenApi for NoTabs {
    async fn has_document(&self) -> bool {
        false
    }

    async fn create_document(&self, _url: &str, _reason: &str) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unavailable("offscreen document"))
    }

    async fn send_message(&self, _message: Value) -> Result<Value, SurfaceError> {
        Err(SurfaceError::Unavailable("offscreen document"))
    }
}

#[async_trait]
impl CaptureApi for NoTabs {
    async fn capture_visible_tab(
        &self,
        _options: &TabCaptureOptions,
    ) -> Result<String, SurfaceError> {
        Err(SurfaceError::Unavailable("tab capture"))
    }

    async fn capture_desktop(&self, _rect: Option<CaptureRect>) -> Result<String, SurfaceError> {
        Err(SurfaceError::Unavailable("desktop capture"))
    }
}
