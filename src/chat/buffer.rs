//! Tool-pair buffer - non-blocking pairing of tool_use and tool_result
//!
//! The model's tool_use and the handler's tool_result arrive on independent
//! schedules. Both sides are buffered by tool-use id; the moment both halves
//! of an id are present they pair up and leave the buffer. Uses that wait
//! longer than the timeout expire; results wait indefinitely for their use.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::llm::types::Message;

/// Default wait before an unanswered tool_use expires
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A matched tool_use / tool_result pair leaving the buffer
#[derive(Debug, Clone)]
pub struct ToolPair {
    pub id: String,
    /// Assistant message containing the tool_use block
    pub tool_use: Message,
    /// User message containing the tool_result block
    pub tool_result: Message,
    pub buffered_at: Instant,
}

/// A tool_use that waited past the timeout without a result
#[derive(Debug, Clone)]
pub struct ExpiredUse {
    pub id: String,
    pub tool_names: Vec<String>,
    pub buffered_at: Instant,
}

/// Result of a `flush`
#[derive(Debug, Clone, Default)]
pub struct FlushOutcome {
    /// Matched pairs in ascending enqueue order
    pub ready: Vec<ToolPair>,
    pub expired: Vec<ExpiredUse>,
}

struct PendingUse {
    message: Message,
    buffered_at: Instant,
}

#[derive(Default)]
struct BufferInner {
    pending_use: HashMap<String, PendingUse>,
    pending_result: HashMap<String, Message>,
}

/// Thread-safe pairing buffer keyed by tool-use id
pub struct ToolPairBuffer {
    inner: Mutex<BufferInner>,
    timeout: Duration,
}

impl ToolPairBuffer {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PAIR_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Buffer an assistant tool_use message. Returns the ready pair when the
    /// matching result is already waiting.
    pub fn buffer_use(&self, id: impl Into<String>, message: Message) -> Option<ToolPair> {
        let id = id.into();
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(result) = inner.pending_result.remove(&id) {
            tracing::debug!("Tool use {} paired with waiting result", id);
            return Some(ToolPair {
                id,
                tool_use: message,
                tool_result: result,
                buffered_at: now,
            });
        }
        inner.pending_use.insert(
            id,
            PendingUse {
                message,
                buffered_at: now,
            },
        );
        None
    }

    /// Buffer a user tool_result message. Returns the ready pair when the
    /// matching use is already waiting.
    pub fn buffer_result(&self, id: impl Into<String>, message: Message) -> Option<ToolPair> {
        let id = id.into();
        let mut inner = self.lock();
        if let Some(pending) = inner.pending_use.remove(&id) {
            tracing::debug!("Tool result {} paired with waiting use", id);
            return Some(ToolPair {
                id,
                tool_use: pending.message,
                tool_result: message,
                buffered_at: pending.buffered_at,
            });
        }
        inner.pending_result.insert(id, message);
        None
    }

    /// Drain every id-matched pair (oldest enqueue first) and expire uses
    /// that outlived the timeout. Results never expire on their own.
    pub fn flush(&self) -> FlushOutcome {
        let now = Instant::now();
        let mut outcome = FlushOutcome::default();
        let mut inner = self.lock();

        let matched: Vec<String> = inner
            .pending_use
            .keys()
            .filter(|id| inner.pending_result.contains_key(*id))
            .cloned()
            .collect();
        for id in matched {
            let Some(pending) = inner.pending_use.remove(&id) else {
                continue;
            };
            let Some(result) = inner.pending_result.remove(&id) else {
                continue;
            };
            outcome.ready.push(ToolPair {
                id,
                tool_use: pending.message,
                tool_result: result,
                buffered_at: pending.buffered_at,
            });
        }
        outcome
            .ready
            .sort_by(|a, b| a.buffered_at.cmp(&b.buffered_at).then_with(|| a.id.cmp(&b.id)));

        let expired: Vec<String> = inner
            .pending_use
            .iter()
            .filter(|(_, p)| now.duration_since(p.buffered_at) > self.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(pending) = inner.pending_use.remove(&id) {
                outcome.expired.push(ExpiredUse {
                    id,
                    tool_names: pending
                        .message
                        .tool_names()
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    buffered_at: pending.buffered_at,
                });
            }
        }
        outcome.expired.sort_by_key(|e| e.buffered_at);
        outcome
    }

    /// Names of every tool still waiting for its result, oldest first
    pub fn pending_tool_names(&self) -> Vec<String> {
        let inner = self.lock();
        let mut entries: Vec<(Instant, Vec<String>)> = inner
            .pending_use
            .values()
            .map(|p| {
                (
                    p.buffered_at,
                    p.message.tool_names().iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        entries.into_iter().flat_map(|(_, names)| names).collect()
    }

    pub fn pending_use_count(&self) -> usize {
        self.lock().pending_use.len()
    }

    pub fn pending_result_count(&self) -> usize {
        self.lock().pending_result.len()
    }

    pub fn has_pending_use(&self, id: &str) -> bool {
        self.lock().pending_use.contains_key(id)
    }
}

impl Default for ToolPairBuffer {
    fn default() -> Self {
        Self::new()
    }
}
