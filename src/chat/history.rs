//! Conversation history repair
//!
//! Persisted histories accumulate artifacts: dropped replies, duplicated
//! messages, orphaned tool calls. `normalize` deterministically repairs a
//! loaded history so it starts with a user message, ends with an assistant
//! message, strictly alternates roles, and pairs every tool_use with a
//! tool_result in the following user message. Gaps are filled with sentinel
//! placeholder messages; the sentinel prefix is kept stable for
//! compatibility with existing persisted data.

use std::collections::HashSet;

use crate::llm::types::{ContentBlock, Message, Role, ToolResultBlock};

pub const PLACEHOLDER_PREFIX: &str = "placeholder for missing";
pub const PLACEHOLDER_USER_TEXT: &str = "placeholder for missing user text message";
pub const PLACEHOLDER_USER_TOOL_RESULT: &str = "placeholder for missing user tool result message";
pub const PLACEHOLDER_ASSISTANT: &str = "placeholder for missing assistant message";

/// Repair passes are iterated until the history stops changing; histories
/// that refuse to settle are beyond repair.
const MAX_PASSES: usize = 10;

pub fn user_text_placeholder() -> Message {
    Message::user(PLACEHOLDER_USER_TEXT)
}

pub fn assistant_placeholder() -> Message {
    Message::assistant(PLACEHOLDER_ASSISTANT)
}

/// User message answering the given tool_use ids with sentinel results
pub fn tool_result_placeholder(ids: &[String]) -> Message {
    Message::new(
        Role::User,
        ids.iter()
            .map(|id| {
                ContentBlock::tool_result(
                    id.clone(),
                    vec![PLACEHOLDER_USER_TOOL_RESULT.to_string()],
                    false,
                )
            })
            .collect(),
    )
}

fn placeholder_result_block(id: &str) -> ContentBlock {
    ContentBlock::tool_result(id, vec![PLACEHOLDER_USER_TOOL_RESULT.to_string()], false)
}

/// A placeholder standing in for a missing tool_result specifically
fn is_tool_result_placeholder(msg: &Message) -> bool {
    is_placeholder(msg) && msg.content.iter().any(ContentBlock::is_tool_result)
}

/// A message whose sole textual content carries the sentinel prefix
pub fn is_placeholder(msg: &Message) -> bool {
    if msg.content.is_empty() {
        return false;
    }
    if msg.content.len() == 1 {
        if let ContentBlock::Text { text, .. } = &msg.content[0] {
            return text.starts_with(PLACEHOLDER_PREFIX);
        }
    }
    msg.content.iter().all(|b| {
        matches!(
            b,
            ContentBlock::ToolResult { content, .. }
                if matches!(
                    content.as_slice(),
                    [ToolResultBlock::Text { text }] if text.starts_with(PLACEHOLDER_PREFIX)
                )
        )
    })
}

/// Deterministically repair a loaded history. Never fails; input that does
/// not settle is discarded with a warning.
pub fn normalize(history: Vec<Message>) -> Vec<Message> {
    let mut current = history;
    for _ in 0..MAX_PASSES {
        let next = repair_pass(current.clone());
        if next == current {
            // A history of nothing but placeholders carries no information
            if !current.is_empty() && current.iter().all(is_placeholder) {
                tracing::warn!("History contains only placeholders; discarding it");
                return Vec::new();
            }
            return current;
        }
        current = next;
    }
    tracing::warn!(
        "History did not stabilize after {} repair passes; discarding it",
        MAX_PASSES
    );
    Vec::new()
}

fn repair_pass(msgs: Vec<Message>) -> Vec<Message> {
    let msgs = clean(msgs);
    let msgs = repair_tool_pairs(msgs);
    let msgs = collapse_repeats(msgs);
    let msgs = enforce_alternation(msgs);
    let msgs = remove_sandwiches(msgs);
    let msgs = collapse_runs(msgs);
    let msgs = collapse_placeholder_runs(msgs);
    let msgs = bookend(msgs);
    if verify(&msgs) {
        msgs
    } else {
        repair_alternation(msgs)
    }
}

/// Stage 1: drop empty content, deduplicate text bodies, drop hollow messages
fn clean(msgs: Vec<Message>) -> Vec<Message> {
    msgs.into_iter()
        .filter_map(|mut m| {
            if m.role == Role::System {
                tracing::warn!("Dropping system message found in chat history");
                return None;
            }
            let mut seen = HashSet::new();
            m.content.retain(|b| match b {
                ContentBlock::Text { text, .. } => {
                    !text.is_empty() && seen.insert(text.clone())
                }
                _ => true,
            });
            if m.content.is_empty() {
                None
            } else {
                Some(m)
            }
        })
        .collect()
}

/// Drop tool_results with no matching tool_use in the preceding assistant
/// message; answer tool_uses missing a result in the following user message.
fn repair_tool_pairs(msgs: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(msgs.len());
    for mut m in msgs {
        if m.content.iter().any(ContentBlock::is_tool_result) {
            let prev_ids: HashSet<String> = match out.last() {
                Some(prev) if prev.role == Role::Assistant => {
                    prev.tool_use_ids().iter().map(|s| s.to_string()).collect()
                }
                _ => HashSet::new(),
            };
            m.content.retain(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    let keep = prev_ids.contains(tool_use_id);
                    if !keep {
                        tracing::warn!("Dropping orphaned tool_result {}", tool_use_id);
                    }
                    keep
                }
                _ => true,
            });
            if m.content.is_empty() {
                continue;
            }
        }
        out.push(m);
    }

    for i in 0..out.len() {
        if out[i].role != Role::Assistant {
            continue;
        }
        let use_ids: Vec<String> = out[i].tool_use_ids().iter().map(|s| s.to_string()).collect();
        if use_ids.is_empty() {
            continue;
        }
        if let Some(next) = out.get(i + 1) {
            if next.role != Role::User {
                continue;
            }
            let answered: HashSet<String> =
                next.tool_result_ids().iter().map(|s| s.to_string()).collect();
            let missing: Vec<String> = use_ids
                .into_iter()
                .filter(|id| !answered.contains(id))
                .collect();
            if !missing.is_empty() {
                if let Some(next) = out.get_mut(i + 1) {
                    for id in missing {
                        next.content.push(placeholder_result_block(&id));
                    }
                }
            }
        }
    }
    out
}

/// Stage 2: `A - placeholder - A` with one role collapses to the newer A
fn collapse_repeats(msgs: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(msgs.len());
    let mut i = 0;
    while i < msgs.len() {
        if i + 2 < msgs.len()
            && msgs[i] == msgs[i + 2]
            && msgs[i].role == msgs[i + 1].role
            && is_placeholder(&msgs[i + 1])
        {
            out.push(msgs[i + 2].clone());
            i += 3;
        } else {
            out.push(msgs[i].clone());
            i += 1;
        }
    }
    out
}

/// Stage 3: insert an opposite-role placeholder between same-role neighbors
fn enforce_alternation(msgs: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(msgs.len());
    for m in msgs {
        let filler = match out.last() {
            Some(prev) if prev.role == m.role => {
                if prev.role == Role::Assistant {
                    if let Some(ContentBlock::ToolUse { id, .. }) = prev.content.last() {
                        Some(tool_result_placeholder(&[id.clone()]))
                    } else {
                        Some(user_text_placeholder())
                    }
                } else {
                    Some(assistant_placeholder())
                }
            }
            _ => None,
        };
        if let Some(filler) = filler {
            out.push(filler);
        }
        out.push(m);
    }
    out
}

/// Stage 4: a real message wedged between two placeholders is unreliable;
/// the whole triple goes
fn remove_sandwiches(msgs: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(msgs.len());
    let mut i = 0;
    while i < msgs.len() {
        if i + 2 < msgs.len()
            && is_placeholder(&msgs[i])
            && !is_placeholder(&msgs[i + 1])
            && is_placeholder(&msgs[i + 2])
        {
            i += 3;
        } else {
            out.push(msgs[i].clone());
            i += 1;
        }
    }
    out
}

/// Stage 5: consecutive same-role messages collapse to the last one
fn collapse_runs(msgs: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(msgs.len());
    for m in msgs {
        match out.last_mut() {
            Some(prev) if prev.role == m.role => *prev = m,
            _ => out.push(m),
        }
    }
    out
}

/// Stage 6: no adjacent placeholders; a placeholder-real-placeholder triple
/// left over after run collapse keeps only its first placeholder
fn collapse_placeholder_runs(msgs: Vec<Message>) -> Vec<Message> {
    // A tool_result placeholder legitimately sits next to the assistant
    // bookend placeholder; only text-placeholder runs are artifacts.
    let mut deduped: Vec<Message> = Vec::with_capacity(msgs.len());
    for m in msgs {
        let prev_is_run_start = deduped
            .last()
            .map(|p| is_placeholder(p) && !is_tool_result_placeholder(p))
            .unwrap_or(false);
        if is_placeholder(&m) && prev_is_run_start {
            continue;
        }
        deduped.push(m);
    }

    let mut out = Vec::with_capacity(deduped.len());
    let mut i = 0;
    while i < deduped.len() {
        if i + 2 < deduped.len()
            && is_placeholder(&deduped[i])
            && !is_placeholder(&deduped[i + 1])
            && is_placeholder(&deduped[i + 2])
        {
            out.push(deduped[i].clone());
            i += 3;
        } else {
            out.push(deduped[i].clone());
            i += 1;
        }
    }
    out
}

/// Stage 7: bracket the history with valid endpoints
fn bookend(mut msgs: Vec<Message>) -> Vec<Message> {
    if msgs.is_empty() {
        return msgs;
    }
    if msgs.first().map(|m| m.role) == Some(Role::Assistant) {
        msgs.insert(0, user_text_placeholder());
    }
    match msgs.last() {
        Some(m) if m.role == Role::User => msgs.push(assistant_placeholder()),
        Some(m) if m.role == Role::Assistant && m.ends_with_tool_use() => {
            let ids: Vec<String> = m.tool_use_ids().iter().map(|s| s.to_string()).collect();
            msgs.push(tool_result_placeholder(&ids));
        }
        _ => {}
    }
    msgs
}

/// Stage 8 check: first user, last assistant, strict alternation
fn verify(msgs: &[Message]) -> bool {
    if msgs.is_empty() {
        return true;
    }
    if msgs.first().map(|m| m.role) != Some(Role::User) {
        return false;
    }
    if msgs.last().map(|m| m.role) != Some(Role::Assistant) {
        return false;
    }
    msgs.windows(2).all(|w| w[0].role != w[1].role)
}

/// Stage 8 repair: keep the alternating subsequence from the first user
/// message, then close with an assistant placeholder if needed
fn repair_alternation(msgs: Vec<Message>) -> Vec<Message> {
    let Some(start) = msgs.iter().position(|m| m.role == Role::User) else {
        tracing::warn!("History has no user message; discarding it");
        return Vec::new();
    };
    let mut out: Vec<Message> = Vec::new();
    let mut expected = Role::User;
    for m in msgs.into_iter().skip(start) {
        if m.role == expected {
            expected = expected.opposite();
            out.push(m);
        }
    }
    if out.last().map(|m| m.role) == Some(Role::User) {
        out.push(assistant_placeholder());
    }
    out
}
