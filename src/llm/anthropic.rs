//! Anthropic messages-endpoint provider

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::chat::events::EventSender;

use super::provider::{EventStream, Provider};
use super::request::ApiRequest;
use super::sse::decode_stream;
use super::types::LLMError;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Generous wall-clock ceiling; long turns with thinking take minutes
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Anthropic Claude provider
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    http_client: Client,
    raw_tx: Option<EventSender>,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            http_client,
            raw_tx: None,
        }
    }

    /// Point at a different endpoint (proxies, test servers)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Forward raw SSE lines to the UI channel
    pub fn with_event_tx(mut self, tx: EventSender) -> Self {
        self.raw_tx = Some(tx);
        self
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, request: ApiRequest) -> Result<EventStream, LLMError> {
        let response = self
            .http_client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LLMError::Timeout {
                        timeout_secs: REQUEST_TIMEOUT.as_secs() as u32,
                    }
                } else {
                    LLMError::NetworkError {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_error_response(status.as_u16(), &text));
        }

        let byte_stream = response.bytes_stream();
        let (tx, rx) = mpsc::channel(32);
        let raw_tx = self.raw_tx.clone();

        tokio::spawn(async move {
            decode_stream(byte_stream, tx, raw_tx).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn parse_error_response(status: u16, body: &str) -> LLMError {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let message = json["error"]["message"]
            .as_str()
            .unwrap_or("Unknown error")
            .to_string();
        let error_type = json["error"]["type"].as_str().unwrap_or("");

        match error_type {
            "authentication_error" => LLMError::AuthError { message },
            "invalid_request_error" => LLMError::InvalidRequest { message },
            _ => LLMError::ProviderError { status, message },
        }
    } else {
        LLMError::ProviderError {
            status,
            message: body.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_authentication() {
        let body = r#"{"error":{"type":"authentication_error","message":"bad key"}}"#;
        assert!(matches!(
            parse_error_response(401, body),
            LLMError::AuthError { .. }
        ));
    }

    #[test]
    fn test_parse_error_invalid_request() {
        let body = r#"{"error":{"type":"invalid_request_error","message":"nope"}}"#;
        assert!(matches!(
            parse_error_response(400, body),
            LLMError::InvalidRequest { .. }
        ));
    }

    #[test]
    fn test_parse_error_other_statuses() {
        let err = parse_error_response(529, r#"{"error":{"type":"overloaded_error","message":"busy"}}"#);
        match err {
            LLMError::ProviderError { status, message } => {
                assert_eq!(status, 529);
                assert_eq!(message, "busy");
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_non_json_body() {
        let err = parse_error_response(502, "<html>bad gateway</html>");
        match err {
            LLMError::ProviderError { status, message } => {
                assert_eq!(status, 502);
                assert!(message.contains("bad gateway"));
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }
}
