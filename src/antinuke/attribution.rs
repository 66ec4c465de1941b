use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::sync::Cache;

use super::ActionKind;
use super::platform::{AuditEntry, Platform, PlatformError};
use crate::ratelimit::{CallExecutor, RetryOptions};

/// Entries pulled per audit action code (the platform's page maximum).
const AUDIT_FETCH_LIMIT: u8 = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum Unattributed {
    NoEntry,
    NoExecutor,
    FetchFailed(PlatformError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribution {
    Attributed { executor_id: u64, entry: AuditEntry },
    Unattributed(Unattributed),
}

impl Attribution {
    pub fn executor(&self) -> Option<u64> {
        match self {
            Attribution::Attributed { executor_id, .. } => Some(*executor_id),
            Attribution::Unattributed(_) => None,
        }
    }
}

/// Finds who performed an action by matching fresh audit entries to the target.
pub struct Attributor {
    platform: Arc<dyn Platform>,
    executor: Arc<CallExecutor>,
    freshness: chrono::Duration,
    // (guild, action code, target) -> newest entry pushed by the gateway
    recent: Cache<(u64, u8, u64), AuditEntry>,
}

impl Attributor {
    pub fn new(platform: Arc<dyn Platform>, executor: Arc<CallExecutor>, freshness_ms: u64) -> Self {
        Self {
            platform,
            executor,
            freshness: chrono::Duration::milliseconds(freshness_ms as i64),
            recent: Cache::builder()
                .time_to_live(Duration::from_millis(freshness_ms.max(1)))
                .max_capacity(4_096)
                .build(),
        }
    }

    /// Remembers an entry delivered by the gateway so attribution can skip a fetch.
    pub fn observe(&self, guild_id: u64, entry: AuditEntry) {
        if let Some(target) = entry.target_id {
            self.recent.insert((guild_id, entry.action, target), entry);
        }
    }

    fn is_fresh(&self, entry: &AuditEntry) -> bool {
        Utc::now().signed_duration_since(entry.created_at) < self.freshness
    }

    fn decide(entry: AuditEntry) -> Attribution {
        match entry.executor_id {
            Some(executor_id) => Attribution::Attributed { executor_id, entry },
            None => Attribution::Unattributed(Unattributed::NoExecutor),
        }
    }

    pub async fn attribute(&self, guild_id: u64, kind: ActionKind, target_id: u64) -> Attribution {
        let codes = kind.audit_codes();

        let cached = codes
            .iter()
            .filter_map(|c| self.recent.get(&(guild_id, *c, target_id)))
            .filter(|e| self.is_fresh(e))
            .max_by_key(|e| e.created_at);
        if let Some(entry) = cached {
            return Self::decide(entry);
        }

        let opts = RetryOptions {
            retry_limit: 2,
            ..RetryOptions::default()
        };
        let mut best: Option<AuditEntry> = None;
        let mut last_err = None;
        for code in codes {
            let route = format!("guild.{guild_id}.audit.{code}");
            let fetched = self
                .executor
                .execute(&route, &opts, || {
                    self.platform
                        .fetch_audit_log(guild_id, *code, AUDIT_FETCH_LIMIT)
                })
                .await;
            match fetched {
                Ok(entries) => {
                    let hit = entries
                        .into_iter()
                        .filter(|e| e.target_id == Some(target_id) && self.is_fresh(e))
                        .max_by_key(|e| e.created_at);
                    if let Some(e) = hit {
                        if best.as_ref().is_none_or(|b| e.created_at > b.created_at) {
                            best = Some(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, guild = guild_id, %kind, code, "audit log fetch failed");
                    last_err = Some(e);
                }
            }
        }

        match (best, last_err) {
            (Some(entry), _) => Self::decide(entry),
            (None, Some(e)) => Attribution::Unattributed(Unattributed::FetchFailed(e)),
            (None, None) => Attribution::Unattributed(Unattributed::NoEntry),
        }
    }
}
