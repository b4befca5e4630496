//! Per-adapter nickname cache.
//!
//! Backends that deliver only user IDs need a display name resolved once
//! and remembered. Entries older than ten minutes are evicted on every
//! write, and when two users resolve to the same nick both entries are
//! renamed by appending the backend identifier so readers can tell them
//! apart.
//!
//! Owned by a single adapter; cross-task reads go through the mutex.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chatweave_types::{ChatweaveError, Result};

/// Entries older than this are removed on every write.
const NICK_TTL: Duration = Duration::from_secs(600);

struct CachedNick {
    nick: String,
    stored_at: Instant,
}

/// Thread-safe nickname cache with time-based eviction.
pub struct NickCache {
    inner: Mutex<HashMap<String, CachedNick>>,
    ttl: Duration,
}

impl NickCache {
    pub fn new() -> Self {
        Self::with_ttl(NICK_TTL)
    }

    /// Cache with a custom eviction age. Test hook.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Stores a nick for a user and returns the name to display.
    ///
    /// On collision (another user already holds the nick) both entries are
    /// renamed to `"<nick> (<user-id>)"`.
    pub fn insert(&self, user_id: &str, nick: &str) -> Result<String> {
        let mut map = self.inner.lock().map_err(|_| ChatweaveError::Protocol {
            reason: "nick cache lock poisoned".into(),
        })?;
        let now = Instant::now();

        // Eviction on every write keeps the map bounded without a sweeper.
        let ttl = self.ttl;
        map.retain(|_, entry| now.duration_since(entry.stored_at) < ttl);

        let colliding: Option<String> = map
            .iter()
            .find(|(id, entry)| entry.nick == nick && id.as_str() != user_id)
            .map(|(id, _)| id.clone());

        let resolved = if let Some(other_id) = colliding {
            if let Some(other) = map.get_mut(&other_id) {
                other.nick = format!("{nick} ({other_id})");
            }
            format!("{nick} ({user_id})")
        } else {
            nick.to_string()
        };

        map.insert(
            user_id.to_string(),
            CachedNick {
                nick: resolved.clone(),
                stored_at: now,
            },
        );
        Ok(resolved)
    }

    /// Looks up the cached nick for a user.
    pub fn get(&self, user_id: &str) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(user_id).map(|entry| entry.nick.clone()))
    }

    /// Number of cached entries. Useful for monitoring and tests.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NickCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stores_and_returns_nick() -> Result<()> {
        let cache = NickCache::new();
        assert_eq!(cache.insert("u1", "alice")?, "alice");
        assert_eq!(cache.get("u1").as_deref(), Some("alice"));
        Ok(())
    }

    #[test]
    fn collision_renames_both_entries() -> Result<()> {
        let cache = NickCache::new();
        cache.insert("u1", "alice")?;
        let resolved = cache.insert("u2", "alice")?;

        assert_eq!(resolved, "alice (u2)");
        assert_eq!(cache.get("u1").as_deref(), Some("alice (u1)"));
        assert_eq!(cache.get("u2").as_deref(), Some("alice (u2)"));
        Ok(())
    }

    #[test]
    fn same_user_refresh_is_not_a_collision() -> Result<()> {
        let cache = NickCache::new();
        cache.insert("u1", "alice")?;
        assert_eq!(cache.insert("u1", "alice")?, "alice");
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn stale_entries_evicted_on_write() -> Result<()> {
        let cache = NickCache::with_ttl(Duration::from_millis(30));
        cache.insert("u1", "alice")?;
        thread::sleep(Duration::from_millis(50));
        cache.insert("u2", "bob")?;
        assert_eq!(cache.get("u1"), None);
        assert_eq!(cache.len(), 1);
        Ok(())
    }
}
