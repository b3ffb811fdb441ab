use std::collections::HashMap;
use std::time::Duration;

use chatgate_config::Cache;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct CachedResponse {
    body: Value,
    expires_at: Instant,
}

/// Short-lived copies of read responses, keyed per user.
pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CachedResponse>>,
}

pub fn chats_key(user_id: &str) -> String {
    format!("chats:{user_id}")
}

pub fn chat_key(chat_id: &str, user_id: &str) -> String {
    format!("chat:{chat_id}:{user_id}")
}

impl ResponseCache {
    pub fn new(cfg: &Cache) -> Self {
        Self {
            enabled: cfg.enabled,
            ttl: Duration::from_millis(cfg.ttl_ms),
            max_entries: cfg.max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.body.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: String, body: Value) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.clear();
        }
        entries.insert(
            key,
            CachedResponse {
                body,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drops the chat list and the chat detail for this user.
    pub async fn invalidate_chat(&self, chat_id: &str, user_id: &str) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock().await;
        entries.remove(&chats_key(user_id));
        entries.remove(&chat_key(chat_id, user_id));
    }

    pub async fn invalidate_list(&self, user_id: &str) {
        if self.enabled {
            self.entries.lock().await.remove(&chats_key(user_id));
        }
    }
}
