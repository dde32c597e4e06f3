//! SQLite-backed persistent message store
//!
//! One `messages` table: role, the serialized content-block list, and a
//! wall-clock timestamp. Loads return the most recent N rows in ascending
//! time. Keep-alive exclusions are the orchestrator's job; the store
//! persists whatever it is handed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::llm::types::{ContentBlock, Message, Role, ToolResultBlock};

/// Appended to text bodies cut short on load
pub const TRUNCATION_SUFFIX: &str = "... [truncated]";

/// Database connection manager
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl MessageStore {
    /// Initialize or open the store database
    pub async fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, db_path.to_path_buf()).await
    }

    /// In-memory store for tests and ephemeral sessions
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:")).await
    }

    async fn from_connection(conn: Connection, db_path: PathBuf) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // WAL for concurrent readers; journal_mode returns a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Append one message with its ordered content list
    pub async fn append(&self, role: Role, content: &[ContentBlock]) -> Result<()> {
        let payload = serde_json::to_string(content)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (role, content, created_at) VALUES (?1, ?2, ?3)",
            params![
                role.to_string(),
                payload,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Load the most recent `limit` messages in ascending time, optionally
    /// truncating text bodies to `truncate_chars`
    pub async fn load_recent(
        &self,
        limit: usize,
        truncate_chars: Option<usize>,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT role, content FROM messages ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content) = row?;
            let Some(role) = Role::parse(&role) else {
                tracing::warn!("Skipping stored message with unknown role '{}'", role);
                continue;
            };
            let blocks: Vec<ContentBlock> = match serde_json::from_str(&content) {
                Ok(blocks) => blocks,
                Err(e) => {
                    tracing::warn!("Skipping unreadable stored message: {}", e);
                    continue;
                }
            };
            messages.push(Message::new(role, blocks));
        }
        drop(stmt);
        drop(conn);

        messages.reverse();
        if let Some(max_chars) = truncate_chars {
            for message in &mut messages {
                truncate_message(message, max_chars);
            }
        }
        Ok(messages)
    }

    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Truncate every text body in the message, marking cut points
pub fn truncate_message(message: &mut Message, max_chars: usize) {
    for block in &mut message.content {
        match block {
            ContentBlock::Text { text, .. } => truncate_text(text, max_chars),
            ContentBlock::ToolResult { content, .. } => {
                for nested in content {
                    if let ToolResultBlock::Text { text } = nested {
                        truncate_text(text, max_chars);
                    }
                }
            }
            _ => {}
        }
    }
}

fn truncate_text(text: &mut String, max_chars: usize) {
    if text.chars().count() <= max_chars {
        return;
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    *text = truncated;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_load_round_trip() {
        let store = MessageStore::open_in_memory().await.unwrap();
        store
            .append(Role::User, &[ContentBlock::text("hello")])
            .await
            .unwrap();
        store
            .append(
                Role::Assistant,
                &[
                    ContentBlock::text("hi"),
                    ContentBlock::ToolUse {
                        id: "t1".to_string(),
                        name: "demo".to_string(),
                        input: serde_json::json!({"a": 1}),
                        cache_control: None,
                    },
                ],
            )
            .await
            .unwrap();

        let messages = store.load_recent(10, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].first_text(), Some("hello"));
        assert_eq!(messages[1].tool_use_ids(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_load_recent_returns_newest_in_ascending_order() {
        let store = MessageStore::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .append(Role::User, &[ContentBlock::text(format!("msg {}", i))])
                .await
                .unwrap();
        }

        let messages = store.load_recent(3, None).await.unwrap();
        assert_eq!(messages.len(), 3);
        let bodies: Vec<&str> = messages.iter().filter_map(|m| m.first_text()).collect();
        assert_eq!(bodies, vec!["msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn test_truncation_appends_suffix() {
        let store = MessageStore::open_in_memory().await.unwrap();
        store
            .append(Role::User, &[ContentBlock::text("abcdefghij")])
            .await
            .unwrap();

        let messages = store.load_recent(1, Some(4)).await.unwrap();
        let text = messages[0].first_text().unwrap();
        assert_eq!(text, format!("abcd{}", TRUNCATION_SUFFIX));

        // Short bodies come back untouched
        let messages = store.load_recent(1, Some(100)).await.unwrap();
        assert_eq!(messages[0].first_text(), Some("abcdefghij"));
    }

    #[tokio::test]
    async fn test_truncation_reaches_tool_result_text() {
        let store = MessageStore::open_in_memory().await.unwrap();
        store
            .append(
                Role::User,
                &[ContentBlock::tool_result(
                    "t1",
                    vec!["0123456789".to_string()],
                    false,
                )],
            )
            .await
            .unwrap();

        let messages = store.load_recent(1, Some(3)).await.unwrap();
        match &messages[0].content[0] {
            ContentBlock::ToolResult { content, .. } => match &content[0] {
                ToolResultBlock::Text { text } => {
                    assert_eq!(text, &format!("012{}", TRUNCATION_SUFFIX));
                }
                other => panic!("Unexpected nested block: {:?}", other),
            },
            other => panic!("Unexpected block: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cache_markers_survive_persistence() {
        let store = MessageStore::open_in_memory().await.unwrap();
        let mut block = ContentBlock::text("marked");
        block.set_cache_control(Some(crate::llm::types::CacheControl::ephemeral()));
        store.append(Role::User, &[block]).await.unwrap();

        let messages = store.load_recent(1, None).await.unwrap();
        assert!(messages[0].content[0].cache_control().is_some());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        {
            let store = MessageStore::open(&path).await.unwrap();
            store
                .append(Role::User, &[ContentBlock::text("persisted")])
                .await
                .unwrap();
            assert_eq!(store.count().await.unwrap(), 1);
        }
        let store = MessageStore::open(&path).await.unwrap();
        let messages = store.load_recent(10, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].first_text(), Some("persisted"));
    }
}
