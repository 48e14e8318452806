//! Named broadcast channels.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

pub const TOAST_CHANNEL: &str = "rs-toast";
pub const AI_RECOGNITION_CHANNEL: &str = "rs-ai-recognition";
pub const POPUP_CHANNEL: &str = "rs-popup";
pub const CLIPBOARD_CHANNEL: &str = "rs-clipboard";
pub const SHARE_TARGET_CHANNEL: &str = "rs-share-target";
/// Carries runtime requests when no native transport exists
pub const RUNTIME_CHANNEL: &str = "rs-runtime";

const DEFAULT_CAPACITY: usize = 64;

/// Fan-out hub keyed by channel name. Channels are created on first use.
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Post to every current subscriber; returns how many received it
    pub fn publish(&self, channel: &str, message: Value) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let delivered = channels
            .get(channel)
            .and_then(|sender| sender.send(message).ok())
            .unwrap_or(0);
        debug!("Broadcast on {} reached {} listeners", channel, delivered);
        delivered
    }

    pub fn receiver_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(channel).map_or(0, |s| s.receiver_count())
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
