use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::ActionKind;
use super::oplock::OperationLock;
use crate::db::GuardStore;
use crate::notify::{self, Alert, Notifier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub guild_id: u64,
    pub actor_id: u64,
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Below {
        count: u64,
        threshold: u32,
    },
    /// Threshold reached (or forced); the caller now holds the actor's operation lock.
    Exceeded {
        count: u64,
        threshold: u32,
        forced: bool,
    },
    /// Actor already has an operation running; the action was not recorded.
    AlreadyProcessing,
}

/// Windowed per-actor action counts, backed by a `GuardStore`.
pub struct Ledger {
    store: Arc<dyn GuardStore>,
    lock: Arc<OperationLock>,
    notifier: Arc<dyn Notifier>,
    window: Duration,
    sections: DashMap<u64, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn GuardStore>,
        lock: Arc<OperationLock>,
        notifier: Arc<dyn Notifier>,
        window_ms: u64,
    ) -> Self {
        Self {
            store,
            lock,
            notifier,
            window: Duration::milliseconds(window_ms.min(i64::MAX as u64) as i64),
            sections: DashMap::new(),
        }
    }

    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    pub async fn record(&self, rec: &ActionRecord) -> Result<()> {
        self.store.record_action(rec).await
    }

    pub async fn count(&self, guild_id: u64, actor_id: u64, kind: ActionKind) -> Result<u64> {
        let since = self.window_start(Utc::now());
        self.store
            .count_actions(guild_id, actor_id, kind, since)
            .await
    }

    /// Compares the actor's windowed count to `threshold` and emits a
    /// threshold alert either way.
    pub async fn evaluate(
        &self,
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        threshold: u32,
        forced: bool,
    ) -> Result<Verdict> {
        let count = self.count(guild_id, actor_id, kind).await?;
        let exceeded = forced || count >= threshold as u64;

        notify::fire_and_forget(
            &self.notifier,
            Alert::Threshold {
                guild_id,
                actor_id,
                kind,
                count,
                threshold,
            },
        );

        if exceeded {
            if forced {
                tracing::warn!(guild = guild_id, actor = actor_id, %kind, count, threshold, "forced threshold");
            } else {
                tracing::warn!(guild = guild_id, actor = actor_id, %kind, count, threshold, "threshold exceeded");
            }
            Ok(Verdict::Exceeded {
                count,
                threshold,
                forced,
            })
        } else {
            tracing::debug!(guild = guild_id, actor = actor_id, %kind, count, threshold, "action counted");
            Ok(Verdict::Below { count, threshold })
        }
    }

    /// record + count + compare + lock acquisition as one step per actor, so
    /// concurrent events for the same actor cannot slip past the threshold.
    pub async fn record_and_evaluate(
        &self,
        rec: ActionRecord,
        threshold: u32,
        forced: bool,
    ) -> Result<Verdict> {
        let section = self
            .sections
            .entry(rec.actor_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = section.lock().await;

        if self.lock.is_processing(rec.actor_id) {
            tracing::debug!(actor = rec.actor_id, kind = %rec.kind, "actor already being processed, action dropped");
            return Ok(Verdict::AlreadyProcessing);
        }

        self.record(&rec).await?;
        let verdict = self
            .evaluate(rec.guild_id, rec.actor_id, rec.kind, threshold, forced)
            .await?;

        if matches!(verdict, Verdict::Exceeded { .. })
            && !self.lock.try_acquire(rec.actor_id, rec.guild_id, rec.kind)
        {
            return Ok(Verdict::AlreadyProcessing);
        }
        Ok(verdict)
    }

    /// Clears the actor's records for one category; other categories keep counting.
    pub async fn purge(&self, guild_id: u64, actor_id: u64, kind: ActionKind) -> Result<u64> {
        let n = self.store.purge_actions(guild_id, actor_id, kind).await?;
        tracing::debug!(guild = guild_id, actor = actor_id, %kind, removed = n, "ledger purged");
        Ok(n)
    }

    /// Drops critical-section handles nobody is holding.
    pub fn prune_sections(&self) {
        self.sections.retain(|_, m| Arc::strong_count(m) > 1);
    }
}
