//! Short-TTL fact cache gating repeated auth failures
//!
//! Facts are keyed `"{username}:{fact}"` and live for 60 seconds. The
//! cache is strictly best-effort: a failed read is treated as an absent
//! fact and never grants privilege, a failed write is logged and
//! ignored.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::constants::quota::{AUTH_FAILURE_LIMIT, LOCKOUT_TTL};

/// String facts with a TTL
///
/// The proxy ships an in-process implementation; a deployment shared by
/// several instances would put an external store behind this trait.
#[async_trait]
pub trait FactCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

pub type DynCache = Arc<dyn FactCache>;

/// Milliseconds since the Unix epoch
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

struct Entry {
    value: String,
    expires_at: u64,
}

/// In-process TTL cache with lazy eviction
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Entry count above which a write sweeps out expired entries first
const SWEEP_THRESHOLD: usize = 1024;

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if now_millis() < entry.expires_at => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = now_millis();
        let mut entries = self.entries.lock().await;
        if entries.len() >= SWEEP_THRESHOLD {
            entries.retain(|_, entry| now < entry.expires_at);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now.saturating_add(ttl.as_millis() as u64),
            },
        );
        Ok(())
    }
}

/// The lockout policy on top of a fact cache
///
/// Owns the key scheme and the auth-failure counter: up to
/// [`AUTH_FAILURE_LIMIT`] failures are counted per user, the next one
/// sets the `blocked` fact and resets the counter, both for 60 seconds.
#[derive(Clone)]
pub struct Lockout {
    cache: DynCache,
}

impl Lockout {
    pub fn new(cache: DynCache) -> Self {
        Self { cache }
    }

    async fn get_fact(&self, user: &str, fact: &str) -> Option<String> {
        match self.cache.get(&format!("{}:{}", user, fact)).await {
            Ok(value) => value,
            Err(e) => {
                debug!("lockout cache read failed for {}:{}: {}", user, fact, e);
                None
            }
        }
    }

    async fn set_fact(&self, user: &str, fact: &str, value: &str) {
        if let Err(e) = self
            .cache
            .set(&format!("{}:{}", user, fact), value, LOCKOUT_TTL)
            .await
        {
            warn!("lockout cache write failed for {}:{}: {}", user, fact, e);
        }
    }

    /// True while the user is locked out for repeated auth failures
    pub async fn is_blocked(&self, user: &str) -> bool {
        self.get_fact(user, "blocked").await.as_deref() == Some("true")
    }

    /// True while an allowance-exhausted verdict is cached
    pub async fn allowance_exhausted(&self, user: &str) -> bool {
        self.get_fact(user, "allowance").await.as_deref() == Some("true")
    }

    /// Cache an allowance-exhausted verdict so the next attempts skip
    /// the store
    pub async fn mark_allowance_exhausted(&self, user: &str) {
        self.set_fact(user, "allowance", "true").await;
    }

    /// Count one failed credential check
    pub async fn record_auth_failure(&self, user: &str) {
        let failures: u32 = self
            .get_fact(user, "authfailed")
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if failures + 1 > AUTH_FAILURE_LIMIT {
            self.set_fact(user, "blocked", "true").await;
            self.set_fact(user, "authfailed", "0").await;
        } else {
            self.set_fact(user, "authfailed", &(failures + 1).to_string())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockout() -> Lockout {
        Lockout::new(Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip() {
        let cache = MemoryCache::new();
        cache
            .set("alice:blocked", "true", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("alice:blocked").await.unwrap().as_deref(),
            Some("true")
        );
        assert!(cache.get("bob:blocked").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let cache = MemoryCache::new();
        cache
            .set("alice:blocked", "true", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("alice:blocked").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_overwrite() {
        let cache = MemoryCache::new();
        cache
            .set("alice:authfailed", "1", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set("alice:authfailed", "2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("alice:authfailed").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_failures_count_up() {
        let lockout = lockout();
        lockout.record_auth_failure("bob").await;
        lockout.record_auth_failure("bob").await;
        assert_eq!(lockout.get_fact("bob", "authfailed").await.as_deref(), Some("2"));
        assert!(!lockout.is_blocked("bob").await);
    }

    #[tokio::test]
    async fn test_limit_failures_do_not_block() {
        let lockout = lockout();
        for _ in 0..AUTH_FAILURE_LIMIT {
            lockout.record_auth_failure("bob").await;
        }
        assert_eq!(
            lockout.get_fact("bob", "authfailed").await.as_deref(),
            Some("100")
        );
        assert!(!lockout.is_blocked("bob").await);
    }

    #[tokio::test]
    async fn test_next_failure_blocks_and_resets_counter() {
        let lockout = lockout();
        for _ in 0..=AUTH_FAILURE_LIMIT {
            lockout.record_auth_failure("bob").await;
        }
        assert!(lockout.is_blocked("bob").await);
        assert_eq!(lockout.get_fact("bob", "authfailed").await.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let lockout = lockout();
        for _ in 0..=AUTH_FAILURE_LIMIT {
            lockout.record_auth_failure("bob").await;
        }
        assert!(lockout.is_blocked("bob").await);
        assert!(!lockout.is_blocked("alice").await);
    }

    #[tokio::test]
    async fn test_allowance_fact() {
        let lockout = lockout();
        assert!(!lockout.allowance_exhausted("alice").await);
        lockout.mark_allowance_exhausted("alice").await;
        assert!(lockout.allowance_exhausted("alice").await);
    }
}
