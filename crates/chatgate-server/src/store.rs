use std::collections::HashMap;

use chatgate_contracts::{ChatRecord, MessageRecord, MessageRole};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
pub struct MemoryStore {
    chats: HashMap<String, ChatRecord>,
    messages: HashMap<String, Vec<MessageRecord>>,
}

pub struct SqliteStore {
    conn: Connection,
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl StoreBackend {
    pub fn open(kind: &str, sqlite_path: Option<&str>) -> Result<Self, String> {
        match kind {
            "sqlite" => {
                let path = sqlite_path
                    .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
                Ok(StoreBackend::Sqlite(SqliteStore::new(path)?))
            }
            _ => Ok(StoreBackend::Memory(MemoryStore::default())),
        }
    }

    /// Caller's chats, most recently updated first.
    pub fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut chats: Vec<ChatRecord> = store
                    .chats
                    .values()
                    .filter(|c| c.user_id == user_id)
                    .cloned()
                    .collect();
                chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                Ok(chats)
            }
            StoreBackend::Sqlite(store) => store.list_chats(user_id),
        }
    }

    pub fn create_chat(&mut self, user_id: &str, title: &str) -> Result<ChatRecord, String> {
        let ts = now_ts();
        let chat = ChatRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: ts.clone(),
            updated_at: ts,
        };
        match self {
            StoreBackend::Memory(store) => {
                store.chats.insert(chat.id.clone(), chat.clone());
            }
            StoreBackend::Sqlite(store) => store.insert_chat(&chat)?,
        }
        Ok(chat)
    }

    /// The chat, only if it belongs to `user_id`.
    pub fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<Option<ChatRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .chats
                .get(chat_id)
                .filter(|c| c.user_id == user_id)
                .cloned()),
            StoreBackend::Sqlite(store) => store.get_chat(chat_id, user_id),
        }
    }

    pub fn list_messages(&self, chat_id: &str) -> Result<Vec<MessageRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.messages.get(chat_id).cloned().unwrap_or_default())
            }
            StoreBackend::Sqlite(store) => store.list_messages(chat_id, None),
        }
    }

    /// The newest `limit` messages, oldest first.
    pub fn recent_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let all = store.messages.get(chat_id).map(Vec::as_slice).unwrap_or(&[]);
                let skip = all.len().saturating_sub(limit);
                Ok(all[skip..].to_vec())
            }
            StoreBackend::Sqlite(store) => store.list_messages(chat_id, Some(limit)),
        }
    }

    pub fn insert_message(
        &mut self,
        chat_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageRecord, String> {
        let message = MessageRecord {
            id: new_id(),
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now_ts(),
        };
        match self {
            StoreBackend::Memory(store) => {
                store
                    .messages
                    .entry(chat_id.to_string())
                    .or_default()
                    .push(message.clone());
            }
            StoreBackend::Sqlite(store) => store.insert_message(&message)?,
        }
        Ok(message)
    }

    pub fn touch_chat(&mut self, chat_id: &str) -> Result<(), String> {
        let ts = now_ts();
        match self {
            StoreBackend::Memory(store) => {
                if let Some(chat) = store.chats.get_mut(chat_id) {
                    chat.updated_at = ts;
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.touch_chat(chat_id, &ts),
        }
    }

    pub fn update_title(
        &mut self,
        chat_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<Option<ChatRecord>, String> {
        let ts = now_ts();
        match self {
            StoreBackend::Memory(store) => Ok(store
                .chats
                .get_mut(chat_id)
                .filter(|c| c.user_id == user_id)
                .map(|chat| {
                    chat.title = title.to_string();
                    chat.updated_at = ts;
                    chat.clone()
                })),
            StoreBackend::Sqlite(store) => store.update_title(chat_id, user_id, title, &ts),
        }
    }

    /// Deletes the chat and its messages. Returns false if nothing matched.
    pub fn delete_chat(&mut self, chat_id: &str, user_id: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => {
                let owned = store
                    .chats
                    .get(chat_id)
                    .map(|c| c.user_id == user_id)
                    .unwrap_or(false);
                if owned {
                    store.chats.remove(chat_id);
                    store.messages.remove(chat_id);
                }
                Ok(owned)
            }
            StoreBackend::Sqlite(store) => store.delete_chat(chat_id, user_id),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS chats_user_updated ON chats(user_id, updated_at);
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS messages_chat_seq ON messages(chat_id, seq);
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, title, created_at, updated_at FROM chats
                 WHERE user_id = ?1 ORDER BY updated_at DESC",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![user_id], chat_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn insert_chat(&mut self, chat: &ChatRecord) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT INTO chats(id, user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chat.id,
                    chat.user_id,
                    chat.title,
                    chat.created_at,
                    chat.updated_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<Option<ChatRecord>, String> {
        self.conn
            .query_row(
                "SELECT id, user_id, title, created_at, updated_at FROM chats
                 WHERE id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
                chat_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn list_messages(
        &self,
        chat_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, String> {
        // Newest N by seq, flipped back to chronological order.
        let limit = limit.map(|v| v as i64).unwrap_or(-1);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, chat_id, role, content, created_at FROM (
                    SELECT seq, id, chat_id, role, content, created_at FROM messages
                    WHERE chat_id = ?1 ORDER BY seq DESC LIMIT ?2
                 ) ORDER BY seq ASC",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![chat_id, limit], |row| {
                let role: String = row.get(2)?;
                Ok(MessageRecord {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    role: MessageRole::parse(&role).unwrap_or(MessageRole::Assistant),
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn insert_message(&mut self, message: &MessageRecord) -> Result<(), String> {
        self.conn
            .execute(
                "INSERT INTO messages(id, chat_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.id,
                    message.chat_id,
                    message.role.as_str(),
                    message.content,
                    message.created_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn touch_chat(&mut self, chat_id: &str, ts: &str) -> Result<(), String> {
        self.conn
            .execute(
                "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
                params![chat_id, ts],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn update_title(
        &mut self,
        chat_id: &str,
        user_id: &str,
        title: &str,
        ts: &str,
    ) -> Result<Option<ChatRecord>, String> {
        let changed = self
            .conn
            .execute(
                "UPDATE chats SET title = ?3, updated_at = ?4 WHERE id = ?1 AND user_id = ?2",
                params![chat_id, user_id, title, ts],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_chat(chat_id, user_id)
    }

    fn delete_chat(&mut self, chat_id: &str, user_id: &str) -> Result<bool, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let deleted = tx
            .execute(
                "DELETE FROM chats WHERE id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )
            .map_err(|e| e.to_string())?;
        if deleted > 0 {
            tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id])
                .map_err(|e| e.to_string())?;
        }
        tx.commit().map_err(|e| e.to_string())?;
        Ok(deleted > 0)
    }
}

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
