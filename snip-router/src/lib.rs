//! Snip Router - execution rules and result delivery for the snip extension
//!
//! Given an input (image, files, text, URL) and the surface it came from,
//! the router picks one processing action, runs it against the AI service
//! and fans the result out to the clipboard, tabs, popup, work center and OS
//! notifications.
//!
//! # Architecture
//!
//! - **engine**: priority-ordered rule table, one rule per request
//! - **pipeline**: bounded delivery queue with retries; an item completes
//!   when at least one destination accepted it
//! - **messaging**: runtime RPC between extension contexts, broadcast
//!   channels and native messaging framing
//! - **server**: Unix socket daemon the native host relays to

pub mod ai;
pub mod capture;
pub mod clipboard;
pub mod config;
pub mod engine;
pub mod history;
pub mod markdown;
pub mod messaging;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod storage;
pub mod surface;
pub mod types;

// Re-export commonly used types
pub use ai::{AiResponse, AiService, HttpAiService};
pub use capture::CaptureService;
pub use clipboard::{ClipboardOrchestrator, CopyOutcome, CopyRequest};
pub use config::Config;
pub use engine::{ExecutionCore, ExecutionOptions, ExecutionRule};
pub use history::{ActionHistoryEntry, ActionHistoryStore, SharedHistory};
pub use markdown::MarkdownLoader;
pub use messaging::{BroadcastHub, CrxMessage, MessagingError, RuntimeChannel};
pub use pipeline::{Destination, PipelineResult, ResultPipeline};
pub use server::{Collaborators, Services, SnipServer};
pub use service::BackgroundService;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use types::{
    ActionContext, ActionInput, InputFile, InputKind, ProcessedResult, ResultType, SourceContext,
};
