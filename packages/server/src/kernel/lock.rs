//! Named, non-blocking locks that serialize cron executions across replicas.
//!
//! Two backends:
//! - [`RedisLock`]: `SET key token NX PX ttl`, released with a
//!   compare-and-delete script. Exclusive across every process sharing Redis.
//! - [`LocalLock`]: a process-local table. Only exclusive inside one process;
//!   replicas running side by side do not see each other's locks.
//!
//! A [`LockGuard`] releases on drop, so an early return or a panic inside the
//! critical section cannot leak the lock past its TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deletes the key only while it still holds our token, so a release after
/// TTL expiry never removes a lock somebody else acquired since.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    Redis,
    Local,
}

#[async_trait]
pub trait NamedLock: Send + Sync {
    /// Try to take `key` for at most `ttl`. Returns immediately; `None` when
    /// somebody else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>>;

    fn backend(&self) -> LockBackend;
}

/// Pick the lock backend from configuration.
pub async fn connect_lock(redis_url: Option<&str>) -> Result<Arc<dyn NamedLock>> {
    match redis_url {
        Some(url) => {
            let lock = RedisLock::connect(url).await?;
            info!("cron locks backed by redis");
            Ok(Arc::new(lock))
        }
        None => {
            warn!("REDIS_URL not set; cron locks are process-local and do not exclude other replicas");
            Ok(Arc::new(LocalLock::new()))
        }
    }
}

// =============================================================================
// Guard
// =============================================================================

enum Releaser {
    Local(Arc<Mutex<HashMap<String, LocalEntry>>>),
    Redis(ConnectionManager),
}

/// A held lock. Call [`LockGuard::release`] to release and observe errors;
/// dropping the guard releases too.
pub struct LockGuard {
    key: String,
    token: String,
    releaser: Option<Releaser>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.releaser.is_none())
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. Safe to call after the TTL already expired.
    pub async fn release(mut self) -> Result<()> {
        match self.releaser.take() {
            None => Ok(()),
            Some(Releaser::Local(held)) => {
                release_local(&held, &self.key, &self.token);
                Ok(())
            }
            Some(Releaser::Redis(mut conn)) => {
                release_redis(&mut conn, &self.key, &self.token).await
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.releaser.take() {
            None => {}
            Some(Releaser::Local(held)) => release_local(&held, &self.key, &self.token),
            Some(Releaser::Redis(mut conn)) => {
                let key = std::mem::take(&mut self.key);
                let token = std::mem::take(&mut self.token);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = release_redis(&mut conn, &key, &token).await {
                                warn!(lock_key = %key, error = %e, "failed to release dropped lock");
                            }
                        });
                    }
                    Err(_) => {
                        warn!(lock_key = %key, "lock dropped outside a runtime; it expires with its TTL");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Redis
// =============================================================================

/// Lock shared by every process connected to the same Redis.
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl NamedLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET NX failed for lock {}", key))?;

        if reply.is_none() {
            debug!(lock_key = %key, "redis lock already held");
            return Ok(None);
        }

        Ok(Some(LockGuard {
            key: key.to_string(),
            token,
            releaser: Some(Releaser::Redis(conn)),
        }))
    }

    fn backend(&self) -> LockBackend {
        LockBackend::Redis
    }
}

async fn release_redis(conn: &mut ConnectionManager, key: &str, token: &str) -> Result<()> {
    let script = redis::Script::new(RELEASE_SCRIPT);
    let removed: i64 = script
        .key(key)
        .arg(token)
        .invoke_async(conn)
        .await
        .with_context(|| format!("failed to release lock {}", key))?;

    if removed == 0 {
        debug!(lock_key = %key, "lock had already expired or changed hands");
    }
    Ok(())
}

// =============================================================================
// Process-local
// =============================================================================

struct LocalEntry {
    token: String,
    expires_at: Instant,
}

/// Lock table living in this process only.
#[derive(Clone, Default)]
pub struct LocalLock {
    held: Arc<Mutex<HashMap<String, LocalEntry>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl NamedLock for LocalLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = held.get(key) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            key.to_string(),
            LocalEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );

        Ok(Some(LockGuard {
            key: key.to_string(),
            token,
            releaser: Some(Releaser::Local(self.held.clone())),
        }))
    }

    fn backend(&self) -> LockBackend {
        LockBackend::Local
    }
}

fn release_local(held: &Mutex<HashMap<String, LocalEntry>>, key: &str, token: &str) {
    let mut held = held.lock().unwrap_or_else(|e| e.into_inner());
    if held.get(key).map(|entry| entry.token == token).unwrap_or(false) {
        held.remove(key);
    }
}
