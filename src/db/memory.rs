use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serenity::async_trait;
use tokio::sync::Mutex;

use super::{GuardStore, SweepReport};
use crate::antinuke::ActionKind;
use crate::antinuke::ledger::ActionRecord;
use crate::antinuke::snapshot::{EntitySnapshot, SnapshotKind, TargetRecord};

type SnapshotKey = (u64, SnapshotKind, u64, ActionKind);
type TargetKey = (u64, u64, ActionKind, u64);

#[derive(Default)]
struct Inner {
    actions: Vec<ActionRecord>,
    snapshots: HashMap<SnapshotKey, EntitySnapshot>,
    targets: HashMap<TargetKey, TargetRecord>,
}

/// In-process `GuardStore` for tests and dry runs. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.inner.lock().await.snapshots.len()
    }

    pub async fn target_count(&self) -> usize {
        self.inner.lock().await.targets.len()
    }
}

#[async_trait]
impl GuardStore for MemoryStore {
    async fn record_action(&self, rec: &ActionRecord) -> Result<()> {
        self.inner.lock().await.actions.push(rec.clone());
        Ok(())
    }

    async fn count_actions(
        &self,
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let g = self.inner.lock().await;
        let n = g
            .actions
            .iter()
            .filter(|a| {
                a.guild_id == guild_id && a.actor_id == actor_id && a.kind == kind && a.at >= since
            })
            .count();
        Ok(n as u64)
    }

    async fn purge_actions(&self, guild_id: u64, actor_id: u64, kind: ActionKind) -> Result<u64> {
        let mut g = self.inner.lock().await;
        let before = g.actions.len();
        g.actions
            .retain(|a| !(a.guild_id == guild_id && a.actor_id == actor_id && a.kind == kind));
        Ok((before - g.actions.len()) as u64)
    }

    async fn save_snapshot(&self, snap: &EntitySnapshot) -> Result<bool> {
        let key = (snap.guild_id, snap.kind(), snap.entity_id, snap.cause);
        let mut g = self.inner.lock().await;
        if g.snapshots.contains_key(&key) {
            return Ok(false);
        }
        g.snapshots.insert(key, snap.clone());
        Ok(true)
    }

    async fn snapshots_since(
        &self,
        guild_id: u64,
        cause: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntitySnapshot>> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g
            .snapshots
            .values()
            .filter(|s| s.guild_id == guild_id && s.cause == cause && s.captured_at >= since)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.captured_at);
        Ok(out)
    }

    async fn delete_snapshot(
        &self,
        guild_id: u64,
        kind: SnapshotKind,
        entity_id: u64,
        cause: ActionKind,
    ) -> Result<()> {
        self.inner
            .lock()
            .await
            .snapshots
            .remove(&(guild_id, kind, entity_id, cause));
        Ok(())
    }

    async fn record_target(&self, target: &TargetRecord) -> Result<()> {
        let key = (
            target.guild_id,
            target.executor_id,
            target.cause,
            target.target_id,
        );
        self.inner.lock().await.targets.insert(key, target.clone());
        Ok(())
    }

    async fn targets_since(
        &self,
        guild_id: u64,
        executor_id: u64,
        cause: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<TargetRecord>> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g
            .targets
            .values()
            .filter(|t| {
                t.guild_id == guild_id
                    && t.executor_id == executor_id
                    && t.cause == cause
                    && t.at >= since
            })
            .cloned()
            .collect();
        out.sort_by_key(|t| t.at);
        Ok(out)
    }

    async fn delete_target(&self, guild_id: u64, cause: ActionKind, target_id: u64) -> Result<()> {
        self.inner
            .lock()
            .await
            .targets
            .retain(|(g, _, c, t), _| !(*g == guild_id && *c == cause && *t == target_id));
        Ok(())
    }

    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepReport> {
        let mut g = self.inner.lock().await;
        let (a, s, t) = (g.actions.len(), g.snapshots.len(), g.targets.len());
        g.actions.retain(|x| x.at >= cutoff);
        g.snapshots.retain(|_, x| x.captured_at >= cutoff);
        g.targets.retain(|_, x| x.at >= cutoff);
        Ok(SweepReport {
            actions: (a - g.actions.len()) as u64,
            snapshots: (s - g.snapshots.len()) as u64,
            targets: (t - g.targets.len()) as u64,
        })
    }

    async fn action_stats(&self, guild_id: u64) -> Result<Vec<(ActionKind, u64)>> {
        let g = self.inner.lock().await;
        let mut by_kind: BTreeMap<&'static str, (ActionKind, u64)> = BTreeMap::new();
        for a in g.actions.iter().filter(|a| a.guild_id == guild_id) {
            by_kind.entry(a.kind.as_str()).or_insert((a.kind, 0)).1 += 1;
        }
        Ok(by_kind.into_values().collect())
    }
}
