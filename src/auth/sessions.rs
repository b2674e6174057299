//! Session registry: the single source of truth for refresh-token
//! revocation. One entry per user, `refresh_token:{user_id}` -> token,
//! expiring with the refresh-token lifetime.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use uuid::Uuid;

/// Key-value custody of the currently valid refresh token per user.
/// Entries self-expire; absence means "no valid session".
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert the entry and reset its TTL.
    async fn put(&self, user_id: Uuid, refresh_token: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<String>>;
    async fn delete(&self, user_id: Uuid) -> anyhow::Result<()>;
}

fn registry_key(user_id: Uuid) -> String {
    format!("refresh_token:{}", user_id)
}

/// Redis-backed registry. `ConnectionManager` reconnects on its own and is
/// cheap to clone per operation.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn put(&self, user_id: Uuid, refresh_token: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(registry_key(user_id), refresh_token, ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(registry_key(user_id)).await?;
        Ok(value)
    }

    async fn delete(&self, user_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(registry_key(user_id)).await?;
        Ok(())
    }
}

/// In-memory registry with the same TTL semantics, used by tests and
/// `AppState::fake()`.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<Uuid, (String, Instant)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, user_id: Uuid, refresh_token: &str, ttl: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap()
            .insert(user_id, (refresh_token.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&user_id) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(&user_id);
                Ok(None)
            }
            Some((token, _)) => Ok(Some(token.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, user_id: Uuid) -> anyhow::Result<()> {
        self.entries.lock().unwrap().remove(&user_id);
        Ok(())
    }
}
