//! Streaming event bus consumed by the front-end
//!
//! Events for one turn arrive in production order. Consumers drop whatever
//! they do not render. `Cancelled` and `Error` are terminal for a turn.

use tokio::sync::mpsc;

use crate::llm::types::{StopReason, StreamDelta, Usage};

/// Event published to the UI channel
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Raw SSE line as received from the wire
    RawData(String),
    Debug(String),
    Warning(String),
    MessageStart,
    ContentBlockStart { index: usize, kind: String },
    ContentBlockDelta { index: usize, delta: StreamDelta },
    ContentBlockStop { index: usize },
    MessageDelta { stop_reason: Option<StopReason> },
    MessageStop,
    Ping,
    Usage(Usage),
    Status(String),
    InteractionComplete,
    StopRequested,
    Cancelled,
    Error { kind: String, detail: String },
}

impl ChatEvent {
    /// Stable kind label, for consumers that filter by type
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::RawData(_) => "raw_data",
            ChatEvent::Debug(_) => "debug",
            ChatEvent::Warning(_) => "warning",
            ChatEvent::MessageStart => "message_start",
            ChatEvent::ContentBlockStart { .. } => "content_block_start",
            ChatEvent::ContentBlockDelta { .. } => "content_block_delta",
            ChatEvent::ContentBlockStop { .. } => "content_block_stop",
            ChatEvent::MessageDelta { .. } => "message_delta",
            ChatEvent::MessageStop => "message_stop",
            ChatEvent::Ping => "ping",
            ChatEvent::Usage(_) => "usage",
            ChatEvent::Status(_) => "status",
            ChatEvent::InteractionComplete => "interaction_complete",
            ChatEvent::StopRequested => "stop_requested",
            ChatEvent::Cancelled => "cancelled",
            ChatEvent::Error { .. } => "error",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ChatEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Create the ordered UI channel
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
