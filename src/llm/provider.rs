//! Transport seam between the orchestrator and the HTTP layer

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::request::ApiRequest;
use super::types::{LLMError, StreamEvent};

/// Stream of decoded events - boxed for trait object safety
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LLMError>> + Send>>;

/// Submits one request and yields the decoded event stream.
///
/// The orchestrator cancels a stream by dropping it; the transport must
/// abort within one read of the drop.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Send a streaming request, returns a stream of decoded events
    async fn stream(&self, request: ApiRequest) -> Result<EventStream, LLMError>;
}
