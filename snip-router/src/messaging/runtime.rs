//! Request/response RPC over the extension runtime.
//!
//! Outbound requests get a `crx_` id and wait on a oneshot until the matching
//! response arrives, the timeout fires, or the channel is closed. Transports
//! either answer inline (native runtime messaging) or deliver the response
//! later through [`RuntimeChannel::handle_response`] (broadcast fallback).

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::broadcast::BroadcastHub;
use super::{ContextKind, CrxMessage, HandlerRegistry, MessagingError, RpcResponse};
use crate::types::generate_id;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Carries a request to its target context
#[async_trait]
pub trait RuntimeTransport: Send + Sync {
    /// Send `message`. Transports that get the reply inline return it here;
    /// the rest return `None` and the reply arrives via `handle_response`.
    async fn send(&self, message: CrxMessage) -> Result<Option<RpcResponse>, MessagingError>;

    fn name(&self) -> &'static str;
}

/// Fallback transport that posts requests on a broadcast channel
pub struct BroadcastTransport {
    hub: Arc<BroadcastHub>,
    channel: String,
}

impl BroadcastTransport {
    pub fn new(hub: Arc<BroadcastHub>, channel: impl Into<String>) -> Self {
        Self {
            hub,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl RuntimeTransport for BroadcastTransport {
    async fn send(&self, message: CrxMessage) -> Result<Option<RpcResponse>, MessagingError> {
        let value = serde_json::to_value(&message)?;
        if self.hub.publish(&self.channel, value) == 0 {
            debug!("No listeners on {} for {}", self.channel, message.kind);
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

/// Pick the native transport when present, else the broadcast fallback
pub fn select_transport(
    native: Option<Arc<dyn RuntimeTransport>>,
    fallback: Option<(Arc<BroadcastHub>, &str)>,
) -> Option<Arc<dyn RuntimeTransport>> {
    native.or_else(|| {
        fallback.map(|(hub, channel)| {
            Arc::new(BroadcastTransport::new(hub, channel)) as Arc<dyn RuntimeTransport>
        })
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub registered_handlers: usize,
    pub pending_requests: usize,
    pub transport: Option<&'static str>,
}

type Pending = oneshot::Sender<Result<Value, MessagingError>>;

/// One endpoint of the runtime RPC
pub struct RuntimeChannel {
    context: ContextKind,
    target: Option<ContextKind>,
    transport: Option<Arc<dyn RuntimeTransport>>,
    handlers: HandlerRegistry,
    pending: Mutex<HashMap<String, Pending>>,
    timeout: Duration,
}

impl RuntimeChannel {
    /// A channel without a transport can still answer incoming requests,
    /// but every outbound request fails immediately.
    pub fn new(context: ContextKind, transport: Option<Arc<dyn RuntimeTransport>>) -> Self {
        Self {
            context,
            target: None,
            transport,
            handlers: HandlerRegistry::new(),
            pending: Mutex::new(HashMap::new()),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_target(mut self, target: ContextKind) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn context(&self) -> ContextKind {
        self.context
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Call `method` on the target context. A single argument is sent bare,
    /// anything else as an array.
    pub async fn request(
        &self,
        method: &str,
        mut args: Vec<Value>,
    ) -> Result<Value, MessagingError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(MessagingError::Unsupported(self.context))?;

        let id = generate_id("crx");
        let data = if args.len() == 1 {
            args.remove(0)
        } else {
            Value::Array(args)
        };
        let message = CrxMessage::request(id.clone(), method, self.context, self.target, data);

        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id.clone(), tx);

        match transport.send(message).await {
            Ok(Some(response)) => {
                self.handle_response(response);
            }
            Ok(None) => {}
            Err(e) => {
                self.pending_map().remove(&id);
                return Err(e);
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MessagingError::ChannelClosed),
            Err(_) => {
                self.pending_map().remove(&id);
                warn!("⏱️ Request {} timed out after {:?}", method, self.timeout);
                Err(MessagingError::Timeout(method.to_string()))
            }
        }
    }

    /// Resolve the pending request a response belongs to. Returns false for
    /// responses nobody is waiting on.
    pub fn handle_response(&self, response: RpcResponse) -> bool {
        let Some(id) = response.id.as_deref() else {
            return false;
        };
        let Some(tx) = self.pending_map().remove(id) else {
            debug!("Dropping response for unknown request {}", id);
            return false;
        };

        let outcome = if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(MessagingError::Remote(
                response.error.unwrap_or_else(|| "Request failed".to_string()),
            ))
        };
        tx.send(outcome).is_ok()
    }

    /// Answer an incoming message. Requests always get a response; other
    /// well-formed messages (responses, notifications) yield `None`.
    pub async fn handle_incoming(&self, raw: Value) -> Option<RpcResponse> {
        let well_formed = raw.get("id").and_then(Value::as_str).is_some()
            && raw.get("type").and_then(Value::as_str).is_some();
        let message = match well_formed.then(|| serde_json::from_value::<CrxMessage>(raw)) {
            Some(Ok(message)) => message,
            _ => {
                return Some(RpcResponse::failure(
                    None,
                    None,
                    MessagingError::InvalidFormat.to_string(),
                    self.context,
                ))
            }
        };

        if message.target.map_or(false, |t| t != self.context) {
            return Some(RpcResponse::failure(
                Some(&message.id),
                Some("response:not-targeted".to_string()),
                MessagingError::NotTargeted.to_string(),
                self.context,
            ));
        }

        let method = message.method()?.to_string();
        debug!("📨 {} request from {}", method, message.source);

        match self.handlers.dispatch(&method, message.data).await {
            Ok(result) => Some(RpcResponse::success(&message.id, &method, result, self.context)),
            Err(e) => Some(RpcResponse::failure(
                Some(&message.id),
                Some(format!("response:{}", method)),
                e.to_string(),
                self.context,
            )),
        }
    }

    /// Drop all handlers and fail every in-flight request
    pub fn close(&self) {
        self.handlers.clear();
        let pending: Vec<Pending> = self.pending_map().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            debug!("Closing runtime channel with {} pending requests", pending.len());
        }
        for tx in pending {
            let _ = tx.send(Err(MessagingError::ChannelClosed));
        }
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        QueueStatus {
            registered_handlers: self.handlers.len(),
            pending_requests: self.pending_map().len(),
            transport: self.transport.as_ref().map(|t| t.name()),
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
