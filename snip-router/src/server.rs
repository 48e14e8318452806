//! Unix socket server exposing the router to the native host and local tools.
//!
//! One JSON value per line in each direction. Plain calls look like
//! `{id?, method, params}` and are answered with `{id?, success, result|error}`.
//! Runtime messages (`type: "request:*"` / `"response:*"`) go to the
//! background [`RuntimeChannel`]. After `subscribe`, broadcast traffic on the
//! requested channels is streamed to the connection as `{channel, message}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ai::{AiService, HttpAiService};
use crate::capture::CaptureService;
use crate::clipboard::{ClipboardOrchestrator, CopyRequest};
use crate::config::Config;
use crate::engine::{ExecutionCore, ExecutionOptions};
use crate::history::{ActionHistoryStore, ExportFormat, HistoryError, SharedHistory};
use crate::markdown::{HttpFetcher, MarkdownError, MarkdownFetcher, MarkdownLoader};
use crate::messaging::broadcast::{BroadcastHub, RUNTIME_CHANNEL};
use crate::messaging::runtime::select_transport;
use crate::messaging::{ContextKind, MessagingError, RpcResponse, RuntimeChannel};
use crate::pipeline::{DefaultSurface, Destination, PipelineError, ResultPipeline};
use crate::service::BackgroundService;
use crate::storage::{KeyValueStore, MemoryStore, SqliteStore};
use crate::surface::{
    CaptureApi, ClipboardApi, CommandNotifier, LogNotifier, NoTabs, NotificationApi, OffscreenApi,
    SystemClipboard, TabsApi,
};
use crate::types::{ActionContext, ActionInput};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Markdown(#[from] MarkdownError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything outside the router's own logic
pub struct Collaborators {
    pub ai: Arc<dyn AiService>,
    pub tabs: Arc<dyn TabsApi>,
    pub offscreen: Arc<dyn OffscreenApi>,
    pub native_clipboard: Option<Arc<dyn ClipboardApi>>,
    pub capture: Arc<dyn CaptureApi>,
    pub notifier: Arc<dyn NotificationApi>,
    pub fetcher: Arc<dyn MarkdownFetcher>,
    /// Persistent namespace (history, settings)
    pub local: Arc<dyn KeyValueStore>,
    /// Per-run namespace (markdown cache)
    pub session: Arc<dyn KeyValueStore>,
}

impl Collaborators {
    /// Collaborators for a standalone daemon: HTTP AI service, SQLite local
    /// store, system clipboard. There is no browser attached, so tabs,
    /// offscreen documents and tab capture are unavailable.
    pub fn system(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(parent) = config.server.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let notifier: Arc<dyn NotificationApi> = match &config.pipeline.notify_command {
            Some(program) => Arc::new(CommandNotifier::new(program.clone())),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            ai: Arc::new(HttpAiService::new(&config.ai)?),
            tabs: Arc::new(NoTabs),
            offscreen: Arc::new(NoTabs),
            native_clipboard: Some(Arc::new(SystemClipboard)),
            capture: Arc::new(NoTabs),
            notifier,
            fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(
                config.ai.request_timeout_secs,
            ))?),
            local: Arc::new(SqliteStore::open(&config.server.db_path)?),
            session: Arc::new(MemoryStore::new()),
        })
    }
}

/// The wired-up router, created once at startup and torn down with
/// [`Services::shutdown`]
pub struct Services {
    pub engine: Arc<ExecutionCore>,
    pub pipeline: Arc<ResultPipeline>,
    pub history: SharedHistory,
    pub clipboard: Arc<ClipboardOrchestrator>,
    pub markdown: Arc<MarkdownLoader>,
    pub background: Arc<BackgroundService>,
    pub runtime: Arc<RuntimeChannel>,
    pub hub: Arc<BroadcastHub>,
}

impl Services {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            ai,
            tabs,
            offscreen,
            native_clipboard,
            capture,
            notifier,
            fetcher,
            local,
            session,
        } = collaborators;

        let hub = Arc::new(BroadcastHub::new());
        let history = ActionHistoryStore::load(&config.history, Arc::clone(&local)).into_shared();

        let clipboard = Arc::new(ClipboardOrchestrator::new(
            Arc::clone(&tabs),
            offscreen,
            native_clipboard,
            Duration::from_millis(config.capture.offscreen_settle_ms),
        ));

        let engine = Arc::new(
            ExecutionCore::with_default_rules(
                history.clone(),
                Arc::clone(&ai),
                config.execution.clone(),
            )
            .with_clipboard(clipboard.clone())
            .with_broadcast(Arc::clone(&hub)),
        );

        let surface = DefaultSurface::new(clipboard.clone(), tabs, Arc::clone(&hub), notifier);
        let pipeline = Arc::new(ResultPipeline::new(Arc::new(surface), config.pipeline.clone()));

        let markdown = Arc::new(MarkdownLoader::new(fetcher, session));
        let background = Arc::new(BackgroundService::new(
            Arc::new(CaptureService::new(capture, config.capture.clone())),
            ai,
            clipboard.clone(),
            markdown.clone(),
            local,
        ));

        let transport = select_transport(None, Some((Arc::clone(&hub), RUNTIME_CHANNEL)));
        let runtime = Arc::new(
            RuntimeChannel::new(ContextKind::Background, transport)
                .with_timeout(Duration::from_millis(config.messaging.request_timeout_ms)),
        );
        background.register_handlers(&runtime);

        Self {
            engine,
            pipeline,
            history,
            clipboard,
            markdown,
            background,
            runtime,
            hub,
        }
    }

    /// Stop the drain task, drop queued results and fail in-flight RPCs
    pub async fn shutdown(&self) {
        self.pipeline.destroy().await;
        self.runtime.close();
        info!("👋 Services shut down");
    }

    /// Answer one incoming value. `None` when there is nothing to send back
    /// (a runtime response settling one of our own requests).
    pub async fn handle_value(&self, raw: Value) -> Option<Value> {
        let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();

        if kind.starts_with("response:") {
            match serde_json::from_value::<RpcResponse>(raw) {
                Ok(response) => {
                    self.runtime.handle_response(response);
                }
                Err(e) => warn!("Malformed runtime response: {}", e),
            }
            return None;
        }

        if kind.starts_with("request:") {
            let response = self.runtime.handle_incoming(raw).await?;
            return serde_json::to_value(response).ok();
        }

        let request = match serde_json::from_value::<ServerRequest>(raw) {
            Ok(request) => request,
            Err(e) => {
                let message = format!("Parse error: {}", e);
                return Some(json!(ServerResponse::failure(None, message)));
            }
        };

        let response = match self.dispatch(&request.method, request.params).await {
            Ok(result) => ServerResponse::success(request.id, result),
            Err(e) => {
                debug!("{} failed: {}", request.method, e);
                ServerResponse::failure(request.id, e.to_string())
            }
        };
        Some(json!(response))
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServerError> {
        let params = if params.is_null() { json!({}) } else { params };

        let result = match method {
            "ping" => json!({ "pong": true, "version": env!("CARGO_PKG_VERSION") }),
            "execute" => {
                let p: ExecuteParams = serde_json::from_value(params)?;
                json!(self.engine.execute(p.input, p.context, p.options).await)
            }
            "snip" => {
                let p: SnipParams = serde_json::from_value(params)?;
                json!(
                    self.pipeline
                        .process_snip(&self.engine, p.input, p.options, p.destinations)
                        .await
                )
            }
            "pipeline.status" => json!(self.pipeline.get_status().await),
            "pipeline.pending" => {
                let p: PendingParams = serde_json::from_value(params)?;
                json!(self.pipeline.get_pending(p.destination.as_deref()).await)
            }
            "pipeline.clearCompleted" => {
                json!({ "cleared": self.pipeline.clear_completed().await })
            }
            "pipeline.sendToDestination" => {
                let p: SendParams = serde_json::from_value(params)?;
                self.pipeline.send_to_destination(&p.id, p.destination).await?;
                json!({ "success": true })
            }
            "history.recent" => {
                let p: RecentParams = serde_json::from_value(params)?;
                json!(self.history.lock().await.get_recent_entries(p.limit))
            }
            "history.stats" => json!(self.history.lock().await.get_stats()),
            "history.export" => {
                let p: ExportParams = serde_json::from_value(params)?;
                let data = self.history.lock().await.export_entries(p.format)?;
                json!({ "format": p.format, "data": data })
            }
            "markdown.load" => {
                let p: MarkdownParams = serde_json::from_value(params)?;
                json!(self.markdown.load(&p.src).await?)
            }
            "copy" => {
                let p: CopyParams = serde_json::from_value(params)?;
                json!(self.clipboard.copy(&p.text, p.request).await)
            }
            "runtime.request" => {
                let p: RuntimeParams = serde_json::from_value(params)?;
                self.runtime.request(&p.method, p.args).await?
            }
            "runtime.status" => json!(self.runtime.get_queue_status()),
            other => self.background.dispatch(other, params).await?,
        };
        Ok(result)
    }
}

#[derive(Debug, Deserialize)]
struct ServerRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct ServerResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ServerResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, error: String) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    input: ActionInput,
    context: ActionContext,
    #[serde(default)]
    options: ExecutionOptions,
}

#[derive(Debug, Deserialize)]
struct SnipParams {
    input: ActionInput,
    #[serde(default)]
    options: ExecutionOptions,
    #[serde(default)]
    destinations: Vec<Destination>,
}

#[derive(Debug, Deserialize)]
struct PendingParams {
    #[serde(default)]
    destination: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendParams {
    id: String,
    destination: Destination,
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    #[serde(default = "default_export_format")]
    format: ExportFormat,
}

fn default_export_format() -> ExportFormat {
    ExportFormat::Json
}

#[derive(Debug, Deserialize)]
struct MarkdownParams {
    src: String,
}

#[derive(Debug, Deserialize)]
struct CopyParams {
    text: String,
    #[serde(flatten)]
    request: CopyRequest,
}

#[derive(Debug, Deserialize)]
struct RuntimeParams {
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    channels: Vec<String>,
}

/// Line-delimited JSON server on a Unix socket
pub struct SnipServer {
    socket_path: PathBuf,
    services: Arc<Services>,
}

impl SnipServer {
    pub fn new(socket_path: impl Into<PathBuf>, services: Arc<Services>) -> Self {
        Self {
            socket_path: socket_path.into(),
            services,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket (replacing a stale one) and serve until the task is
    /// dropped
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("🚀 Snip router listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let services = Arc::clone(&self.services);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, services).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Serve one client. Lines are handled concurrently so a runtime request
/// waiting on this same client's reply does not block the reader.
async fn handle_connection(stream: UnixStream, services: Arc<Services>) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer_task: JoinHandle<std::io::Result<()>> = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok(())
    });

    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            line.clear();
            continue;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(raw) if raw.get("method").and_then(Value::as_str) == Some("subscribe") => {
                let id = raw.get("id").cloned();
                let params = raw.get("params").cloned().unwrap_or(Value::Null);
                let response = match serde_json::from_value::<SubscribeParams>(params) {
                    Ok(p) => {
                        for channel in &p.channels {
                            forwarders.push(forward_channel(
                                services.hub.subscribe(channel),
                                channel.clone(),
                                out_tx.clone(),
                            ));
                        }
                        info!("🔔 Client subscribed to {:?}", p.channels);
                        ServerResponse::success(id, json!({ "channels": p.channels }))
                    }
                    Err(e) => ServerResponse::failure(id, ServerError::from(e).to_string()),
                };
                let _ = out_tx.send(json!(response).to_string());
            }
            Ok(raw) => {
                let services = Arc::clone(&services);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    if let Some(reply) = services.handle_value(raw).await {
                        let _ = out_tx.send(reply.to_string());
                    }
                });
            }
            Err(e) => {
                warn!("Failed to parse line: {}", e);
                let response = ServerResponse::failure(None, format!("Parse error: {}", e));
                let _ = out_tx.send(json!(response).to_string());
            }
        }

        line.clear();
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    drop(out_tx);
    match writer_task.await {
        Ok(result) => result?,
        Err(e) => warn!("Writer task ended abnormally: {}", e),
    }
    Ok(())
}

fn forward_channel(
    mut rx: broadcast::Receiver<Value>,
    channel: String,
    out_tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let line = json!({ "channel": channel, "message": message }).to_string();
                    if out_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber on {} lagged, {} messages dropped", channel, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiInput, AiOptions, AiResponse};
    use crate::messaging::CrxMessage;
    use crate::surface::SurfaceError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct EchoAi;

    #[async_trait]
    impl AiService for EchoAi {
        async fn recognize(&self, _input: AiInput, _options: AiOptions) -> AiResponse {
            AiResponse::success(json!("# Recognized"), Some("resp_1".into()))
        }

        async fn process(&self, _input: AiInput, _options: AiOptions) -> AiResponse {
            AiResponse::success(json!("# Processed"), Some("resp_2".into()))
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

    fn services() -> (Arc<Services>, Arc<RecordingClipboard>) {
        let clipboard = Arc::new(RecordingClipboard::default());
        let mut config = Config::default();
        config.messaging.request_timeout_ms = 2_000;
        config.capture.offscreen_settle_ms = 0;

        let collaborators = Collaborators {
            ai: Arc::new(EchoAi),
            tabs: Arc::new(NoTabs),
            offscreen: Arc::new(NoTabs),
            native_clipboard: Some(clipboard.clone()),
            capture: Arc::new(NoTabs),
            notifier: Arc::new(LogNotifier),
            fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(5)).unwrap()),
            local: Arc::new(MemoryStore::new()),
            session: Arc::new(MemoryStore::new()),
        };
        (Arc::new(Services::new(&config, collaborators)), clipboard)
    }

    #[tokio::test]
    async fn test_plain_calls() {
        let (services, clipboard) = services();

        let pong = services
            .handle_value(json!({ "id": 1, "method": "ping" }))
            .await
            .unwrap();
        assert_eq!(pong["id"], json!(1));
        assert_eq!(pong["success"], json!(true));
        assert_eq!(pong["result"]["pong"], json!(true));

        let copied = services
            .handle_value(json!({ "method": "copy", "params": { "text": " hi ", "tabId": 3 } }))
            .await
            .unwrap();
        assert_eq!(copied["result"]["ok"], json!(true));
        assert_eq!(copied["result"]["method"], json!("native"));
        assert_eq!(*clipboard.written.lock().unwrap(), vec!["hi".to_string()]);

        let unknown = services
            .handle_value(json!({ "id": "x", "method": "nope" }))
            .await
            .unwrap();
        assert_eq!(unknown["success"], json!(false));
        assert_eq!(unknown["error"], json!("Unknown method: nope"));

        let missing = services
            .handle_value(json!({
                "method": "pipeline.sendToDestination",
                "params": { "id": "zz", "destination": { "type": "popup" } }
            }))
            .await
            .unwrap();
        assert_eq!(missing["error"], json!("Not found"));

        let bad = services.handle_value(json!({ "params": {} })).await.unwrap();
        assert!(bad["error"].as_str().unwrap().starts_with("Parse error"));
    }

    #[tokio::test]
    async fn test_execute_records_history() {
        let (services, _) = services();

        let result = services
            .dispatch(
                "execute",
                json!({
                    "input": {
                        "type": "files",
                        "files": [{ "name": "a.md", "type": "text/markdown", "data": "IyBB" }]
                    },
                    "context": { "source": "workcenter" }
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["type"], json!("markdown"));
        assert_eq!(result["dataCategory"], json!("recognized"));

        let stats = services.dispatch("history.stats", Value::Null).await.unwrap();
        assert_eq!(stats["total"], json!(1));

        let recent = services
            .dispatch("history.recent", json!({ "limit": 10 }))
            .await
            .unwrap();
        assert_eq!(recent.as_array().unwrap().len(), 1);

        let export = services
            .dispatch("history.export", json!({ "format": "csv" }))
            .await
            .unwrap();
        assert!(export["data"].as_str().unwrap().starts_with("ID,Timestamp"));
    }

    #[tokio::test]
    async fn test_runtime_messages() {
        let (services, _) = services();

        let request = CrxMessage::request(
            "crx_1",
            "captureWithRect",
            ContextKind::ContentScript,
            Some(ContextKind::Background),
            json!({ "mode": "code" }),
        );
        let response = services
            .handle_value(serde_json::to_value(request).unwrap())
            .await
            .unwrap();
        assert_eq!(response["type"], json!("response:captureWithRect"));
        assert_eq!(response["result"]["status"], json!("rect_selection_required"));

        // Outbound request answered by a subscriber on the runtime channel
        let mut outbound = services.hub.subscribe(RUNTIME_CHANNEL);
        let caller = Arc::clone(&services);
        let call = tokio::spawn(async move {
            caller
                .dispatch("runtime.request", json!({ "method": "ping", "args": [1] }))
                .await
        });

        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent["type"], json!("request:ping"));
        assert_eq!(sent["data"], json!(1));
        let reply = json!({
            "id": sent["id"],
            "type": "response:ping",
            "success": true,
            "result": "pong",
        });
        assert!(services.handle_value(reply).await.is_none());
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_socket_round_trip_and_subscribe() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("snip.sock");
        let (services, _) = services();
        let hub = Arc::clone(&services.hub);

        let server = SnipServer::new(socket.clone(), services);
        let server_task = tokio::spawn(async move { server.run().await });

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (reader, mut writer) = stream.expect("server did not come up").into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(
                b"{\"id\":1,\"method\":\"subscribe\",\"params\":{\"channels\":[\"rs-toast\"]}}\n",
            )
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let subscribed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(subscribed["result"]["channels"], json!(["rs-toast"]));

        hub.publish("rs-toast", json!({ "text": "Copied" }));
        let line = lines.next_line().await.unwrap().unwrap();
        let pushed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(pushed, json!({ "channel": "rs-toast", "message": { "text": "Copied" } }));

        writer.write_all(b"not json\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let rejected: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(rejected["success"], json!(false));

        writer
            .write_all(b"{\"id\":2,\"method\":\"pipeline.status\"}\n")
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let status: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(status["id"], json!(2));
        assert_eq!(status["result"]["queueSize"], json!(0));

        server_task.abort();
    }
}
