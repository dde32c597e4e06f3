use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapstanError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("LLM error: {0}")]
    Llm(#[from] crate::llm::types::LLMError),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timer error: {0}")]
    Timer(#[from] crate::chat::timer::TimerError),

    #[error("Tool error: {0}")]
    Tool(#[from] crate::chat::tools::ToolError),

    #[error("Event channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, CapstanError>;
