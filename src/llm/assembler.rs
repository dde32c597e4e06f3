//! Assistant-turn assembler - collapses stream events into one completed turn

use std::collections::BTreeMap;

use crate::chat::events::{ChatEvent, EventSender};

use super::types::{
    BlockStart, ContentBlock, Message, Role, StopReason, StreamDelta, StreamEvent, Usage,
};

/// Appended to the last text block when the user stops generation mid-stream
pub const GENERATION_STOPPED_MARKER: &str = "[generation stopped]";

/// One completed assistant turn
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub message: Message,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

enum Slot {
    Open(Accumulator),
    Done(ContentBlock),
}

enum Accumulator {
    Text { buf: String, first_fragment: bool },
    Thinking { buf: String, signature: String },
    RedactedThinking { data: String },
    ToolUse { id: String, name: String, json: String },
}

/// Accumulates one in-progress turn from decoded stream events
pub struct TurnAssembler {
    blocks: BTreeMap<usize, Slot>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    events: Option<EventSender>,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            stop_reason: None,
            usage: Usage::default(),
            events: None,
        }
    }

    /// Republish deltas to the UI channel as they arrive
    pub fn with_event_tx(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: ChatEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn protocol_error(&self, detail: String) {
        tracing::warn!("Protocol error while assembling turn: {}", detail);
        self.emit(ChatEvent::Error {
            kind: "protocol_error".to_string(),
            detail,
        });
    }

    /// Feed one decoded event into the turn
    pub fn handle(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { usage, .. } => {
                if let Some(usage) = &usage {
                    self.usage.merge(usage);
                }
                self.emit(ChatEvent::MessageStart);
            }
            StreamEvent::ContentBlockStart { index, block } => {
                self.emit(ChatEvent::ContentBlockStart {
                    index,
                    kind: block_kind(&block).to_string(),
                });
                if self.blocks.contains_key(&index) {
                    self.protocol_error(format!("content block {} started twice", index));
                    return;
                }
                let acc = match block {
                    BlockStart::Text => Accumulator::Text {
                        buf: String::new(),
                        first_fragment: true,
                    },
                    BlockStart::Thinking => Accumulator::Thinking {
                        buf: String::new(),
                        signature: String::new(),
                    },
                    BlockStart::RedactedThinking { data } => {
                        Accumulator::RedactedThinking { data }
                    }
                    BlockStart::ToolUse { id, name } => Accumulator::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                };
                self.blocks.insert(index, Slot::Open(acc));
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.emit(ChatEvent::ContentBlockDelta {
                    index,
                    delta: delta.clone(),
                });
                let Some(Slot::Open(acc)) = self.blocks.get_mut(&index) else {
                    self.protocol_error(format!("delta for unopened block {}", index));
                    return;
                };
                let matched = match (acc, delta) {
                    (
                        Accumulator::Text {
                            buf,
                            first_fragment,
                        },
                        StreamDelta::Text(fragment),
                    ) => {
                        if *first_fragment {
                            buf.push_str(fragment.strip_prefix('\n').unwrap_or(&fragment));
                            *first_fragment = false;
                        } else {
                            buf.push_str(&fragment);
                        }
                        true
                    }
                    (Accumulator::Thinking { buf, .. }, StreamDelta::Thinking(fragment)) => {
                        buf.push_str(&fragment);
                        true
                    }
                    (
                        Accumulator::Thinking { signature, .. },
                        StreamDelta::Signature(fragment),
                    ) => {
                        signature.push_str(&fragment);
                        true
                    }
                    (Accumulator::ToolUse { json, .. }, StreamDelta::InputJson(fragment)) => {
                        json.push_str(&fragment);
                        true
                    }
                    _ => false,
                };
                if !matched {
                    self.protocol_error(format!(
                        "delta kind does not match block {} kind",
                        index
                    ));
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                self.emit(ChatEvent::ContentBlockStop { index });
                self.finalize_block(index);
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                if let Some(reason) = stop_reason {
                    self.stop_reason = Some(reason);
                }
                if let Some(usage) = &usage {
                    self.usage.merge(usage);
                    self.emit(ChatEvent::Usage(usage.clone()));
                }
                self.emit(ChatEvent::MessageDelta { stop_reason });
            }
            StreamEvent::MessageStop => {
                self.emit(ChatEvent::MessageStop);
            }
            StreamEvent::Ping => {
                self.emit(ChatEvent::Ping);
            }
        }
    }

    fn finalize_block(&mut self, index: usize) {
        let Some(slot) = self.blocks.remove(&index) else {
            self.protocol_error(format!("stop for unopened block {}", index));
            return;
        };
        let block = match slot {
            Slot::Done(block) => block,
            Slot::Open(acc) => self.seal(acc),
        };
        self.blocks.insert(index, Slot::Done(block));
    }

    fn seal(&self, acc: Accumulator) -> ContentBlock {
        match acc {
            Accumulator::Text { buf, .. } => ContentBlock::text(buf),
            Accumulator::Thinking { buf, signature } => ContentBlock::Thinking {
                thinking: buf,
                signature,
            },
            Accumulator::RedactedThinking { data } => ContentBlock::RedactedThinking { data },
            Accumulator::ToolUse { id, name, json } => {
                let input = if json.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    match serde_json::from_str(&json) {
                        Ok(value) => value,
                        Err(e) => {
                            self.protocol_error(format!(
                                "tool input for '{}' is not valid JSON: {}",
                                name, e
                            ));
                            serde_json::json!({})
                        }
                    }
                };
                ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                    cache_control: None,
                }
            }
        }
    }

    /// Emit the completed turn. Blocks come out in ascending index order;
    /// cancellation appends the stop marker and overrides the stop reason.
    pub fn finish(mut self, cancelled: bool) -> AssistantTurn {
        // Streams cut short (cancel, error) leave open accumulators behind
        let blocks = std::mem::take(&mut self.blocks);
        let mut content = Vec::new();
        for (_, slot) in blocks {
            match slot {
                Slot::Done(block) => content.push(block),
                Slot::Open(acc) => content.push(self.seal(acc)),
            }
        }

        let stop_reason = if cancelled {
            let marker_target = content.iter_mut().rev().find_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text),
                _ => None,
            });
            match marker_target {
                Some(text) => text.push_str(GENERATION_STOPPED_MARKER),
                None => content.push(ContentBlock::text(GENERATION_STOPPED_MARKER)),
            }
            StopReason::CancelledByUser
        } else {
            self.stop_reason.unwrap_or(StopReason::EndTurn)
        };

        AssistantTurn {
            message: Message::new(Role::Assistant, content),
            stop_reason,
            usage: self.usage.clone(),
        }
    }
}

impl Default for TurnAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn block_kind(block: &BlockStart) -> &'static str {
    match block {
        BlockStart::Text => "text",
        BlockStart::Thinking => "thinking",
        BlockStart::RedactedThinking { .. } => "redacted_thinking",
        BlockStart::ToolUse { .. } => "tool_use",
    }
}
