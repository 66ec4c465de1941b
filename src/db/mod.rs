use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serenity::async_trait;
use sqlx::{Pool, Postgres, postgres::{PgConnectOptions, PgPoolOptions}};

use crate::antinuke::ActionKind;
use crate::antinuke::ledger::ActionRecord;
use crate::antinuke::snapshot::{EntitySnapshot, SnapshotKind, TargetRecord};

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str, max: Option<u32>, statement_timeout_ms: Option<u64>) -> Result<Db> {
    let mut opts = PgConnectOptions::from_str(url)?;
    if let Some(ms) = statement_timeout_ms {
        opts = opts.options([("statement_timeout", ms)]);
    }
    let pool = PgPoolOptions::new()
        .max_connections(max.unwrap_or(10))
        .connect_with(opts)
        .await?;

    Ok(pool)
}

pub async fn migrate(pool: &Db) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub actions: u64,
    pub snapshots: u64,
    pub targets: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.actions + self.snapshots + self.targets
    }
}

/// Persistence for the action ledger, entity snapshots and target records.
#[async_trait]
pub trait GuardStore: Send + Sync {
    async fn record_action(&self, rec: &ActionRecord) -> Result<()>;

    /// Actions by `actor` of `kind` recorded at or after `since`.
    async fn count_actions(
        &self,
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Deletes every record for (guild, actor, kind); other categories stay.
    async fn purge_actions(&self, guild_id: u64, actor_id: u64, kind: ActionKind) -> Result<u64>;

    /// Insert-if-absent. Returns false when a snapshot with the same
    /// (guild, kind, entity, cause) already exists; the first capture wins.
    async fn save_snapshot(&self, snap: &EntitySnapshot) -> Result<bool>;

    async fn snapshots_since(
        &self,
        guild_id: u64,
        cause: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntitySnapshot>>;

    async fn delete_snapshot(
        &self,
        guild_id: u64,
        kind: SnapshotKind,
        entity_id: u64,
        cause: ActionKind,
    ) -> Result<()>;

    async fn record_target(&self, target: &TargetRecord) -> Result<()>;

    async fn targets_since(
        &self,
        guild_id: u64,
        executor_id: u64,
        cause: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<TargetRecord>>;

    async fn delete_target(&self, guild_id: u64, cause: ActionKind, target_id: u64) -> Result<()>;

    /// Drops everything older than `cutoff`.
    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepReport>;

    /// Per-category action counts for `/stats`.
    async fn action_stats(&self, guild_id: u64) -> Result<Vec<(ActionKind, u64)>>;
}
