//! Per-visitor key-value storage.
//!
//! Visitors are identified by an opaque session ID (carried in a cookie by the
//! HTTP layer). Nothing in here knows about HTTP.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use humble_common::GateError;
use humble_common::constants::redis_keys::SESSION_PREFIX;
use redis::AsyncCommands;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Get/set values scoped to one visitor session
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>, GateError>;
    async fn set(&self, session_id: &str, key: &str, value: String) -> Result<(), GateError>;
}

/// New opaque session ID (256 random bits)
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Sessions held in process memory
pub struct MemorySessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, MemorySession>>,
}

struct MemorySession {
    values: HashMap<String, String>,
    touched: Instant,
}

impl MemorySessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>, GateError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .filter(|s| s.touched.elapsed() < self.ttl)
            .and_then(|s| s.values.get(key).cloned()))
    }

    async fn set(&self, session_id: &str, key: &str, value: String) -> Result<(), GateError> {
        let mut sessions = self.sessions.write().await;

        // Drop idle sessions while we hold the lock anyway
        sessions.retain(|_, s| s.touched.elapsed() < self.ttl);

        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| MemorySession {
                values: HashMap::new(),
                touched: Instant::now(),
            });
        session.values.insert(key.to_string(), value);
        session.touched = Instant::now();

        Ok(())
    }
}

/// Sessions in Redis, one key per value, expiring with the session TTL
pub struct RedisSessionStore {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl RedisSessionStore {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }

    fn key(session_id: &str, key: &str) -> String {
        format!("{}{}:{}", SESSION_PREFIX, session_id, key)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>, GateError> {
        let mut conn = self.redis.clone();
        conn.get::<_, Option<String>>(Self::key(session_id, key))
            .await
            .map_err(|e| GateError::Session(e.to_string()))
    }

    async fn set(&self, session_id: &str, key: &str, value: String) -> Result<(), GateError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(Self::key(session_id, key), value, self.ttl_secs)
            .await
            .map_err(|e| GateError::Session(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_are_scoped_per_session() {
        let store = MemorySessionStore::new(60);
        store.set("alice", "k", "1".to_string()).await.unwrap();
        store.set("bob", "k", "2".to_string()).await.unwrap();

        assert_eq!(store.get("alice", "k").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("bob", "k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("carol", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let store = MemorySessionStore::new(0);
        store.set("alice", "k", "1".to_string()).await.unwrap();
        assert_eq!(store.get("alice", "k").await.unwrap(), None);
    }

    #[test]
    fn test_session_ids_are_unique_and_cookie_safe() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_redis_key_layout() {
        assert_eq!(
            RedisSessionStore::key("sid", "math_challenges"),
            "session:sid:math_challenges"
        );
    }
}
