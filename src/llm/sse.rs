//! SSE stream decoder - frames the byte stream into typed events
//!
//! Records are newline-framed `data: <json>` lines. Anything else (blank
//! lines, `event:` headers, comments) is skipped. `[DONE]` ends the stream.

use std::collections::HashSet;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::types::{BlockStart, LLMError, StopReason, StreamDelta, StreamEvent, Usage};

/// Outcome of decoding one line
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(StreamEvent),
    Skip,
    EndOfStream,
}

/// Line decoder for one in-progress turn
pub struct SseDecoder {
    started: HashSet<usize>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            started: HashSet::new(),
        }
    }

    /// Decode a single line from the stream
    pub fn decode_line(&mut self, line: &str) -> Result<Decoded, LLMError> {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(Decoded::Skip);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(Decoded::Skip);
        }
        if payload == "[DONE]" {
            return Ok(Decoded::EndOfStream);
        }

        let json: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| LLMError::Protocol {
                message: format!("malformed frame: {}", e),
            })?;

        match json["type"].as_str() {
            Some("message_start") => {
                let message_id = json["message"]["id"].as_str().map(|s| s.to_string());
                let usage = parse_usage(&json["message"]["usage"]);
                Ok(Decoded::Event(StreamEvent::MessageStart { message_id, usage }))
            }
            Some("content_block_start") => {
                let index = frame_index(&json)?;
                if !self.started.insert(index) {
                    return Err(LLMError::Protocol {
                        message: format!("duplicate content_block_start for index {}", index),
                    });
                }
                let content_block = &json["content_block"];
                let block = match content_block["type"].as_str() {
                    Some("tool_use") => BlockStart::ToolUse {
                        id: content_block["id"].as_str().unwrap_or_default().to_string(),
                        name: content_block["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    },
                    Some("thinking") => BlockStart::Thinking,
                    Some("redacted_thinking") => BlockStart::RedactedThinking {
                        data: content_block["data"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    },
                    // Unknown kinds accumulate as text so the turn survives
                    _ => BlockStart::Text,
                };
                Ok(Decoded::Event(StreamEvent::ContentBlockStart { index, block }))
            }
            Some("content_block_delta") => {
                let index = frame_index(&json)?;
                self.check_started(index)?;
                let delta = &json["delta"];
                let delta = match delta["type"].as_str() {
                    Some("text_delta") => {
                        StreamDelta::Text(delta["text"].as_str().unwrap_or_default().to_string())
                    }
                    Some("input_json_delta") => StreamDelta::InputJson(
                        delta["partial_json"].as_str().unwrap_or_default().to_string(),
                    ),
                    Some("thinking_delta") => StreamDelta::Thinking(
                        delta["thinking"].as_str().unwrap_or_default().to_string(),
                    ),
                    Some("signature_delta") => StreamDelta::Signature(
                        delta["signature"].as_str().unwrap_or_default().to_string(),
                    ),
                    other => {
                        tracing::debug!("Skipping unknown delta type {:?}", other);
                        return Ok(Decoded::Skip);
                    }
                };
                Ok(Decoded::Event(StreamEvent::ContentBlockDelta { index, delta }))
            }
            Some("content_block_stop") => {
                let index = frame_index(&json)?;
                self.check_started(index)?;
                Ok(Decoded::Event(StreamEvent::ContentBlockStop { index }))
            }
            Some("message_delta") => {
                let stop_reason = json["delta"]["stop_reason"]
                    .as_str()
                    .map(StopReason::from_wire);
                let usage = parse_usage(&json["usage"]);
                Ok(Decoded::Event(StreamEvent::MessageDelta { stop_reason, usage }))
            }
            Some("message_stop") => Ok(Decoded::Event(StreamEvent::MessageStop)),
            Some("ping") => Ok(Decoded::Event(StreamEvent::Ping)),
            Some("error") => Err(LLMError::Api {
                kind: json["error"]["type"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                message: json["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            other => {
                tracing::debug!("Skipping unknown event type {:?}", other);
                Ok(Decoded::Skip)
            }
        }
    }

    fn check_started(&self, index: usize) -> Result<(), LLMError> {
        if self.started.contains(&index) {
            Ok(())
        } else {
            Err(LLMError::Protocol {
                message: format!("index {} referenced before content_block_start", index),
            })
        }
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_index(json: &serde_json::Value) -> Result<usize, LLMError> {
    json["index"]
        .as_u64()
        .map(|i| i as usize)
        .ok_or_else(|| LLMError::Protocol {
            message: "frame missing index".to_string(),
        })
}

fn parse_usage(v: &serde_json::Value) -> Option<Usage> {
    let obj = v.as_object()?;
    let field = |name: &str| obj.get(name).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Some(Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_creation_input_tokens: field("cache_creation_input_tokens"),
        cache_read_input_tokens: field("cache_read_input_tokens"),
    })
}

/// Pump a byte stream through the decoder into an event channel.
///
/// The caller cancels by dropping the receiver: the next send fails and the
/// pump exits, aborting within one read. Errors are sent once and terminate
/// decoding. `raw_tx` mirrors each non-blank line to the UI channel.
pub async fn decode_stream<S, E>(
    mut byte_stream: S,
    tx: mpsc::Sender<Result<StreamEvent, LLMError>>,
    raw_tx: Option<crate::chat::events::EventSender>,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder = SseDecoder::new();
    let mut buffer = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(Err(LLMError::NetworkError {
                        message: e.to_string(),
                    }))
                    .await;
                return;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n');
            if let Some(raw) = &raw_tx {
                if !line.trim().is_empty() {
                    let _ = raw.send(crate::chat::events::ChatEvent::RawData(line.to_string()));
                }
            }
            match decoder.decode_line(line) {
                Ok(Decoded::Event(event)) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Ok(Decoded::Skip) => {}
                Ok(Decoded::EndOfStream) => return,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    // Server closed mid-line; decode whatever is left
    if !buffer.trim().is_empty() {
        match decoder.decode_line(&buffer) {
            Ok(Decoded::Event(event)) => {
                let _ = tx.send(Ok(event)).await;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(e)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(decoder: &mut SseDecoder, line: &str) -> Decoded {
        decoder.decode_line(line).unwrap()
    }

    #[test]
    fn test_decode_message_start() {
        let mut d = SseDecoder::new();
        let out = decode(
            &mut d,
            r#"data: {"type":"message_start","message":{"id":"msg_123","usage":{"input_tokens":12}}}"#,
        );
        match out {
            Decoded::Event(StreamEvent::MessageStart { message_id, usage }) => {
                assert_eq!(message_id.as_deref(), Some("msg_123"));
                assert_eq!(usage.unwrap().input_tokens, 12);
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_text_delta() {
        let mut d = SseDecoder::new();
        decode(
            &mut d,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        );
        let out = decode(
            &mut d,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        );
        assert_eq!(
            out,
            Decoded::Event(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: StreamDelta::Text("Hello".to_string()),
            })
        );
    }

    #[test]
    fn test_decode_tool_use_start() {
        let mut d = SseDecoder::new();
        let out = decode(
            &mut d,
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"demo"}}"#,
        );
        match out {
            Decoded::Event(StreamEvent::ContentBlockStart {
                index: 1,
                block: BlockStart::ToolUse { id, name },
            }) => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "demo");
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_non_data_lines_skipped() {
        let mut d = SseDecoder::new();
        assert_eq!(decode(&mut d, "event: content_block_delta"), Decoded::Skip);
        assert_eq!(decode(&mut d, ""), Decoded::Skip);
        assert_eq!(decode(&mut d, ": comment"), Decoded::Skip);
    }

    #[test]
    fn test_done_terminates() {
        let mut d = SseDecoder::new();
        assert_eq!(decode(&mut d, "data: [DONE]"), Decoded::EndOfStream);
    }

    #[test]
    fn test_ping_frame() {
        let mut d = SseDecoder::new();
        assert_eq!(
            decode(&mut d, r#"data: {"type":"ping"}"#),
            Decoded::Event(StreamEvent::Ping)
        );
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let mut d = SseDecoder::new();
        let err = d.decode_line("data: {not json").unwrap_err();
        assert!(matches!(err, LLMError::Protocol { .. }));
    }

    #[test]
    fn test_delta_before_start_is_protocol_error() {
        let mut d = SseDecoder::new();
        let err = d
            .decode_line(
                r#"data: {"type":"content_block_delta","index":3,"delta":{"type":"text_delta","text":"x"}}"#,
            )
            .unwrap_err();
        assert!(matches!(err, LLMError::Protocol { .. }));
    }

    #[test]
    fn test_duplicate_start_is_protocol_error() {
        let mut d = SseDecoder::new();
        decode(
            &mut d,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
        );
        let err = d
            .decode_line(
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
            )
            .unwrap_err();
        assert!(matches!(err, LLMError::Protocol { .. }));
    }

    #[test]
    fn test_error_frame_terminates() {
        let mut d = SseDecoder::new();
        let err = d
            .decode_line(
                r#"data: {"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
            )
            .unwrap_err();
        match err {
            LLMError::Api { kind, message } => {
                assert_eq!(kind, "overloaded_error");
                assert_eq!(message, "busy");
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_message_delta_stop_reason_and_usage() {
        let mut d = SseDecoder::new();
        let out = decode(
            &mut d,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":55}}"#,
        );
        match out {
            Decoded::Event(StreamEvent::MessageDelta { stop_reason, usage }) => {
                assert_eq!(stop_reason, Some(StopReason::ToolUse));
                assert_eq!(usage.unwrap().output_tokens, 55);
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_stream_splits_chunks() {
        let frames: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\"}}\ndata: {\"type\":\"content_bl",
            )),
            Ok(Bytes::from_static(
                b"ock_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\ndata: {\"type\":\"message_stop\"}\n",
            )),
        ];
        let stream = futures::stream::iter(frames);
        let (tx, mut rx) = mpsc::channel(8);
        decode_stream(stream, tx, None).await;

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev.unwrap());
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], StreamEvent::MessageStop));
    }
}
