//! Short-lived per-guild credentials (vanity code changes need one).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use moka::sync::Cache;
use tokio::sync::Notify;

pub struct CredentialCache {
    tokens: Cache<u64, String>,
    in_progress: DashMap<u64, Arc<Notify>>,
}

/// Clears the in-progress marker even if the acquiring future is dropped.
struct Acquiring<'a> {
    cache: &'a CredentialCache,
    guild_id: u64,
}

impl Drop for Acquiring<'_> {
    fn drop(&mut self) {
        self.cache.set_in_progress(self.guild_id, false);
    }
}

impl CredentialCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(1_024)
                .build(),
            in_progress: DashMap::new(),
        }
    }

    pub fn get(&self, guild_id: u64) -> Option<String> {
        self.tokens.get(&guild_id)
    }

    /// Stores the token; an existing entry gets a fresh expiry.
    pub fn set(&self, guild_id: u64, token: String) {
        self.tokens.insert(guild_id, token);
    }

    pub fn invalidate(&self, guild_id: u64) {
        self.tokens.invalidate(&guild_id);
    }

    pub fn is_in_progress(&self, guild_id: u64) -> bool {
        self.in_progress.contains_key(&guild_id)
    }

    pub fn set_in_progress(&self, guild_id: u64, on: bool) {
        if on {
            self.in_progress
                .entry(guild_id)
                .or_insert_with(|| Arc::new(Notify::new()));
        } else if let Some((_, n)) = self.in_progress.remove(&guild_id) {
            n.notify_waiters();
        }
    }

    /// Cached token, or the result of `acquire`. A caller that finds an
    /// acquisition already running waits for it instead of starting another.
    pub async fn get_or_acquire<F, Fut, E>(&self, guild_id: u64, acquire: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        loop {
            if let Some(t) = self.get(guild_id) {
                return Ok(t);
            }
            let notified = match self.in_progress.entry(guild_id) {
                Entry::Occupied(o) => {
                    let n = o.get().clone();
                    drop(o);
                    n
                }
                Entry::Vacant(v) => {
                    v.insert(Arc::new(Notify::new()));
                    break;
                }
            };
            let wait = notified.notified();
            // the owner may have finished between the entry lookup and here
            let same_owner = self
                .in_progress
                .get(&guild_id)
                .is_some_and(|cur| Arc::ptr_eq(cur.value(), &notified));
            if !same_owner {
                continue;
            }
            wait.await;
        }

        let _guard = Acquiring {
            cache: self,
            guild_id,
        };
        let token = acquire().await?;
        self.set(guild_id, token.clone());
        Ok(token)
    }
}
