use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use serenity::async_trait;
use sqlx::Row;

use super::{Db, GuardStore, SweepReport};
use crate::antinuke::ActionKind;
use crate::antinuke::ledger::ActionRecord;
use crate::antinuke::snapshot::{EntityAttributes, EntitySnapshot, SnapshotKind, TargetRecord};

/// `GuardStore` on the `tss.antinuke_*` tables.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn parse_kind(s: &str) -> Result<ActionKind> {
    ActionKind::parse(s).with_context(|| format!("unknown action kind in db: {s}"))
}

#[async_trait]
impl GuardStore for PgStore {
    async fn record_action(&self, rec: &ActionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tss.antinuke_actions (guild_id, actor_id, kind, at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(rec.guild_id as i64)
        .bind(rec.actor_id as i64)
        .bind(rec.kind.as_str())
        .bind(rec.at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn count_actions(
        &self,
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tss.antinuke_actions
             WHERE guild_id = $1 AND actor_id = $2 AND kind = $3 AND at >= $4
            "#,
        )
        .bind(guild_id as i64)
        .bind(actor_id as i64)
        .bind(kind.as_str())
        .bind(since)
        .fetch_one(&self.db)
        .await?;
        Ok(n.max(0) as u64)
    }

    async fn purge_actions(&self, guild_id: u64, actor_id: u64, kind: ActionKind) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM tss.antinuke_actions
             WHERE guild_id = $1 AND actor_id = $2 AND kind = $3
            "#,
        )
        .bind(guild_id as i64)
        .bind(actor_id as i64)
        .bind(kind.as_str())
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn save_snapshot(&self, snap: &EntitySnapshot) -> Result<bool> {
        let attrs: Value = serde_json::to_value(&snap.attributes)?;
        let res = sqlx::query(
            r#"
            INSERT INTO tss.antinuke_snapshots
                (guild_id, kind, entity_id, cause, attributes, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (guild_id, kind, entity_id, cause) DO NOTHING
            "#,
        )
        .bind(snap.guild_id as i64)
        .bind(snap.kind().as_str())
        .bind(snap.entity_id as i64)
        .bind(snap.cause.as_str())
        .bind(attrs)
        .bind(snap.captured_at)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn snapshots_since(
        &self,
        guild_id: u64,
        cause: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntitySnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, attributes, captured_at
              FROM tss.antinuke_snapshots
             WHERE guild_id = $1 AND cause = $2 AND captured_at >= $3
             ORDER BY captured_at
            "#,
        )
        .bind(guild_id as i64)
        .bind(cause.as_str())
        .bind(since)
        .fetch_all(&self.db)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_id: i64 = row.try_get("entity_id")?;
            let attrs: Value = row.try_get("attributes")?;
            let attributes: EntityAttributes = match serde_json::from_value(attrs) {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error=?e, guild = guild_id, entity = entity_id, "skipping unreadable snapshot");
                    continue;
                }
            };
            out.push(EntitySnapshot {
                guild_id,
                entity_id: entity_id as u64,
                cause,
                attributes,
                captured_at: row.try_get("captured_at")?,
            });
        }
        Ok(out)
    }

    async fn delete_snapshot(
        &self,
        guild_id: u64,
        kind: SnapshotKind,
        entity_id: u64,
        cause: ActionKind,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM tss.antinuke_snapshots
             WHERE guild_id = $1 AND kind = $2 AND entity_id = $3 AND cause = $4
            "#,
        )
        .bind(guild_id as i64)
        .bind(kind.as_str())
        .bind(entity_id as i64)
        .bind(cause.as_str())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn record_target(&self, target: &TargetRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tss.antinuke_targets (guild_id, executor_id, cause, target_id, at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (guild_id, executor_id, cause, target_id) DO UPDATE SET at = EXCLUDED.at
            "#,
        )
        .bind(target.guild_id as i64)
        .bind(target.executor_id as i64)
        .bind(target.cause.as_str())
        .bind(target.target_id as i64)
        .bind(target.at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn targets_since(
        &self,
        guild_id: u64,
        executor_id: u64,
        cause: ActionKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<TargetRecord>> {
        let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT target_id, at FROM tss.antinuke_targets
             WHERE guild_id = $1 AND executor_id = $2 AND cause = $3 AND at >= $4
             ORDER BY at
            "#,
        )
        .bind(guild_id as i64)
        .bind(executor_id as i64)
        .bind(cause.as_str())
        .bind(since)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(target_id, at)| TargetRecord {
                guild_id,
                executor_id,
                cause,
                target_id: target_id as u64,
                at,
            })
            .collect())
    }

    async fn delete_target(&self, guild_id: u64, cause: ActionKind, target_id: u64) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM tss.antinuke_targets
             WHERE guild_id = $1 AND cause = $2 AND target_id = $3
            "#,
        )
        .bind(guild_id as i64)
        .bind(cause.as_str())
        .bind(target_id as i64)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<SweepReport> {
        let mut tx = self.db.begin().await?;
        let actions = sqlx::query("DELETE FROM tss.antinuke_actions WHERE at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let snapshots = sqlx::query("DELETE FROM tss.antinuke_snapshots WHERE captured_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let targets = sqlx::query("DELETE FROM tss.antinuke_targets WHERE at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(SweepReport {
            actions,
            snapshots,
            targets,
        })
    }

    async fn action_stats(&self, guild_id: u64) -> Result<Vec<(ActionKind, u64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT kind, COUNT(*) FROM tss.antinuke_actions
             WHERE guild_id = $1
             GROUP BY kind
             ORDER BY kind
            "#,
        )
        .bind(guild_id as i64)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(k, n)| Ok((parse_kind(&k)?, n.max(0) as u64)))
            .collect()
    }
}
