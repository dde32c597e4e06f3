pub mod anthropic;
pub mod assembler;
pub mod provider;
pub mod request;
pub mod sse;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use assembler::{AssistantTurn, TurnAssembler, GENERATION_STOPPED_MARKER};
pub use provider::{EventStream, Provider};
pub use request::{ApiRequest, RequestBuilder};
pub use types::*;
