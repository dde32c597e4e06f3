pub mod buffer;
pub mod events;
pub mod history;
pub mod orchestrator;
pub mod permissions;
pub mod timer;
pub mod tools;

pub use buffer::{FlushOutcome, ToolPair, ToolPairBuffer};
pub use events::{ChatEvent, EventReceiver, EventSender};
pub use history::normalize;
pub use orchestrator::{ChatConfig, ChatOrchestrator, KEEP_ALIVE_PROMPT};
pub use permissions::{PermissionGate, ToolPermission};
pub use timer::{KeepAliveTimer, TimerError, TimerEvent, TimerState};
pub use tools::{ToolError, ToolHandler, ToolOutcome, ToolRunner};
