//! capstan - streaming LLM chat orchestration with a non-blocking tool-pair
//! buffer
//!
//! The orchestrator drives one streaming request at a time against a chat
//! API with tool use. When the model calls a tool, the matching
//! `tool_result` is deferred while the handler runs; the user keeps
//! chatting, and the pair is sent back the moment it completes. A
//! keep-alive timer pings the server so prompt caches stay warm.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use capstan::{AnthropicProvider, ChatConfig, ChatOrchestrator, Settings};
//!
//! #[tokio::main]
//! async fn main() -> capstan::Result<()> {
//!     let settings = Settings::load();
//!     let api_key = settings.resolve_api_key()?;
//!
//!     let provider = Arc::new(AnthropicProvider::new(api_key));
//!     let orchestrator =
//!         ChatOrchestrator::new(provider, ChatConfig::from_settings(&settings));
//!
//!     let mut events = orchestrator.take_event_rx().expect("first take");
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             // render deltas, status, errors
//!             let _ = event;
//!         }
//!     });
//!
//!     orchestrator.send_user("hello there", true, true).await?;
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;

pub use chat::buffer::{FlushOutcome, ToolPair, ToolPairBuffer};
pub use chat::events::{ChatEvent, EventReceiver, EventSender};
pub use chat::history::normalize;
pub use chat::orchestrator::{ChatConfig, ChatOrchestrator, KEEP_ALIVE_PROMPT};
pub use chat::permissions::{PermissionGate, ToolPermission};
pub use chat::timer::{KeepAliveTimer, TimerEvent, TimerState};
pub use chat::tools::{ToolError, ToolHandler, ToolOutcome, ToolRunner};
pub use config::Settings;
pub use error::{CapstanError, Result};
pub use llm::anthropic::AnthropicProvider;
pub use llm::provider::{EventStream, Provider};
pub use llm::types::{
    CacheControl, CacheTtl, ContentBlock, LLMError, Message, RequestParams, Role, StopReason,
    StreamDelta, StreamEvent, ToolChoice, ToolDefinition, Usage,
};
pub use store::MessageStore;
