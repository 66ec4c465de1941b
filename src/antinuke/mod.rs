//! Detection-and-response engine.
//!
//! Every gateway event for the protected guild is turned into zero or more
//! monitored actions, attributed to an executor through the audit trail,
//! counted per actor and category, and, once a threshold is crossed, answered
//! with a punishment and a best-effort restore of what the actor broke.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

pub mod api;
pub mod attribution;
pub mod events;
pub mod exemptions;
pub mod ledger;
pub mod oplock;
pub mod platform;
pub mod punish;
pub mod restore;
pub mod snapshot;

pub use events::{ActionKind, Derived, EventPayload, GuardEvent, VanityChange};

use attribution::{Attribution, Attributor, Unattributed};
use exemptions::Exemptions;
use ledger::{ActionRecord, Ledger, Verdict};
use oplock::{LockView, OpState, OperationLock};
use platform::{Platform, PlatformError};
use punish::{PunishOutcome, Punisher};
use restore::{RestoreReport, Restorer};
use snapshot::{EntitySnapshot, TargetRecord};

use crate::config::{AntinukeConfig, VanityConfig};
use crate::credentials::CredentialCache;
use crate::db::GuardStore;
use crate::notify::{self, Alert, Notifier};
use crate::ratelimit::{CallExecutor, ExecutorStats, RetryOptions};

/// Everything the engine is built from.
pub struct GuardCtx {
    pub config: AntinukeConfig,
    pub vanity: VanityConfig,
    pub owner_dm: bool,
    pub platform: Arc<dyn Platform>,
    pub executor: Arc<CallExecutor>,
    pub store: Arc<dyn GuardStore>,
    pub notifier: Arc<dyn Notifier>,
    pub exemptions: Arc<Exemptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    ForeignGuild,
    /// Nothing monitored changed.
    NoAction,
    OwnAction,
    Exempt,
    Unattributed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: ActionKind,
    pub actor_id: u64,
    pub punishment: PunishOutcome,
    /// Outcome for the added bot itself on `bot_add`.
    pub bot_punishment: Option<PunishOutcome>,
    pub recovery: Option<RestoreReport>,
    pub vanity_reverted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ignored(Skip),
    Counted {
        kind: ActionKind,
        actor_id: u64,
        count: u64,
        threshold: u32,
    },
    AlreadyProcessing {
        kind: ActionKind,
        actor_id: u64,
    },
    Responded(Box<Response>),
    /// Unattributed destructive action; the entity was put back as a precaution.
    Precautionary {
        kind: ActionKind,
        target_id: u64,
        restored: bool,
    },
    /// Unattributed bot addition; the bot alone was punished.
    BotRemoved {
        bot_id: u64,
        punishment: PunishOutcome,
    },
    Failed(String),
}

#[derive(Debug, Default)]
struct Counters {
    events: AtomicU64,
    counted: AtomicU64,
    responses: AtomicU64,
    precautionary: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub protected_guild: u64,
    pub uptime_secs: u64,
    pub events: u64,
    pub counted: u64,
    pub responses: u64,
    pub precautionary: u64,
    pub actions_in_store: BTreeMap<String, u64>,
    pub operations: Vec<LockView>,
    pub executor: ExecutorStats,
}

pub struct Antinuke {
    cfg: AntinukeConfig,
    vanity: VanityConfig,
    platform: Arc<dyn Platform>,
    executor: Arc<CallExecutor>,
    store: Arc<dyn GuardStore>,
    notifier: Arc<dyn Notifier>,
    exemptions: Arc<Exemptions>,
    ignored_roles: HashSet<u64>,
    attributor: Attributor,
    ledger: Ledger,
    lock: Arc<OperationLock>,
    punisher: Punisher,
    restorer: Restorer,
    credentials: CredentialCache,
    counters: Counters,
    started: Instant,
}

impl Antinuke {
    pub fn new(ctx: GuardCtx) -> Arc<Self> {
        let cfg = ctx.config;
        let lock = OperationLock::new(
            Duration::from_secs(cfg.lock_stale_secs),
            Duration::from_secs(cfg.lock_grace_secs),
        );
        let ledger = Ledger::new(
            ctx.store.clone(),
            lock.clone(),
            ctx.notifier.clone(),
            cfg.time_window_ms,
        );
        let attributor = Attributor::new(
            ctx.platform.clone(),
            ctx.executor.clone(),
            cfg.freshness_ms,
        );
        let punisher = Punisher::new(
            ctx.platform.clone(),
            ctx.executor.clone(),
            ctx.exemptions.clone(),
            ctx.notifier.clone(),
            cfg.punishment,
            ctx.owner_dm,
        );
        let restorer = Restorer::new(
            ctx.platform.clone(),
            ctx.executor.clone(),
            ctx.store.clone(),
            Duration::from_millis(cfg.recovery.delay_ms),
            cfg.time_window_ms,
        );
        let credentials = CredentialCache::new(Duration::from_secs(ctx.vanity.credential_ttl_secs));

        let this = Arc::new(Self {
            ignored_roles: cfg.ignored_role_ids.iter().copied().collect(),
            vanity: ctx.vanity,
            platform: ctx.platform,
            executor: ctx.executor,
            store: ctx.store,
            notifier: ctx.notifier,
            exemptions: ctx.exemptions,
            attributor,
            ledger,
            lock,
            punisher,
            restorer,
            credentials,
            counters: Counters::default(),
            started: Instant::now(),
            cfg,
        });

        OperationLock::spawn_sweeper(&this.lock, Duration::from_secs(this.cfg.lock_sweep_secs.max(1)));
        Self::spawn_sweep_task(&this);

        tracing::info!(
            guild = this.cfg.protected_guild,
            punishment = ?this.cfg.punishment,
            window_ms = this.cfg.time_window_ms,
            "antinuke engine ready"
        );
        this
    }

    fn spawn_sweep_task(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let every = Duration::from_secs(this.cfg.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(strong) = weak.upgrade() else {
                    break;
                };
                strong.sweep().await;
            }
        });
    }

    /// Drops stored rows older than the window.
    pub async fn sweep(&self) {
        let cutoff = self.ledger.window_start(Utc::now());
        match self.store.sweep(cutoff).await {
            Ok(r) if r.total() > 0 => {
                tracing::info!(actions = r.actions, snapshots = r.snapshots, targets = r.targets, "store sweep")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = ?e, "store sweep failed"),
        }
        self.ledger.prune_sections();
    }

    pub fn protected_guild(&self) -> u64 {
        self.cfg.protected_guild
    }

    pub fn operations(&self) -> &OperationLock {
        &self.lock
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    /// Runs one event through the pipeline.
    pub async fn handle(&self, event: GuardEvent) -> Vec<Outcome> {
        if event.guild_id != self.cfg.protected_guild {
            return vec![Outcome::Ignored(Skip::ForeignGuild)];
        }
        self.counters.events.fetch_add(1, Ordering::Relaxed);

        if let EventPayload::AuditEntryCreated { entry } = &event.payload {
            self.attributor.observe(event.guild_id, entry.clone());
            return vec![];
        }

        let derived = event.derive(&self.ignored_roles);
        if derived.is_empty() {
            return vec![Outcome::Ignored(Skip::NoAction)];
        }

        let mut out = Vec::with_capacity(derived.len());
        for d in derived {
            let outcome = match self.process(event.guild_id, &d).await {
                Ok(o) => o,
                Err(e) => {
                    tracing::error!(error = ?e, guild = event.guild_id, kind = %d.kind, "pipeline failed");
                    Outcome::Failed(e.to_string())
                }
            };
            out.push(outcome);
        }
        out
    }

    async fn process(&self, guild_id: u64, d: &Derived) -> Result<Outcome> {
        let attribution = self.attributor.attribute(guild_id, d.kind, d.target_id).await;
        let actor_id = match attribution {
            Attribution::Attributed { executor_id, .. } => executor_id,
            Attribution::Unattributed(why) => return Ok(self.unattributed(guild_id, d, why).await),
        };

        if actor_id == self.platform.current_user_id() {
            return Ok(Outcome::Ignored(Skip::OwnAction));
        }
        if self.exemptions.is_exempt(actor_id) {
            tracing::debug!(guild = guild_id, actor = actor_id, kind = %d.kind, "exempt actor");
            return Ok(Outcome::Ignored(Skip::Exempt));
        }

        let now = Utc::now();
        if let Some(attrs) = &d.snapshot {
            let snap = EntitySnapshot::new(guild_id, d.target_id, d.kind, attrs.clone());
            if !self.store.save_snapshot(&snap).await? {
                tracing::debug!(guild = guild_id, entity = d.target_id, kind = %d.kind, "snapshot already captured");
            }
        }
        if d.kind.records_targets() {
            self.store
                .record_target(&TargetRecord {
                    guild_id,
                    executor_id: actor_id,
                    cause: d.kind,
                    target_id: d.target_id,
                    at: now,
                })
                .await?;
        }

        let rec = ActionRecord {
            guild_id,
            actor_id,
            kind: d.kind,
            at: now,
        };
        let threshold = self.cfg.threshold_for(d.kind);
        let verdict = self
            .ledger
            .record_and_evaluate(rec, threshold, d.kind.forced())
            .await?;

        match verdict {
            Verdict::Below { count, threshold } => {
                self.counters.counted.fetch_add(1, Ordering::Relaxed);
                Ok(Outcome::Counted {
                    kind: d.kind,
                    actor_id,
                    count,
                    threshold,
                })
            }
            Verdict::AlreadyProcessing => Ok(Outcome::AlreadyProcessing {
                kind: d.kind,
                actor_id,
            }),
            Verdict::Exceeded {
                count,
                threshold,
                forced,
            } => {
                self.counters.counted.fetch_add(1, Ordering::Relaxed);
                self.counters.responses.fetch_add(1, Ordering::Relaxed);
                let reason = if forced {
                    format!("{} (zero tolerance)", d.kind)
                } else {
                    format!("{} threshold exceeded ({count}/{threshold})", d.kind)
                };
                let resp = self.respond(guild_id, actor_id, d, &reason).await;
                Ok(Outcome::Responded(Box::new(resp)))
            }
        }
    }

    /// Punish, revert, restore, purge, release. The caller holds the actor's lock.
    async fn respond(&self, guild_id: u64, actor_id: u64, d: &Derived, reason: &str) -> Response {
        let kind = d.kind;
        self.lock.advance(actor_id, OpState::Punishing);

        let bot_punishment = if kind == ActionKind::BotAdd {
            Some(
                self.punisher
                    .punish(guild_id, d.target_id, kind, &format!("unauthorized bot (invited by {actor_id})"))
                    .await,
            )
        } else {
            None
        };

        let punishment = self.punisher.punish(guild_id, actor_id, kind, reason).await;

        // revert regardless of whether the actor could be punished
        let vanity_reverted = match (&d.vanity, kind) {
            (Some(change), ActionKind::VanityChange) => Some(self.revert_vanity(guild_id, change).await),
            _ => None,
        };

        let recovery = if punishment.is_success() && kind.recovery_enabled(&self.cfg.recovery) {
            self.lock.advance(actor_id, OpState::Restoring);
            let report = self.restorer.restore(guild_id, kind, actor_id).await;
            if !report.is_empty() {
                notify::fire_and_forget(
                    &self.notifier,
                    Alert::Recovery {
                        guild_id,
                        actor_id,
                        kind,
                        succeeded: report.succeeded,
                        failed: report.failed,
                    },
                );
            }
            Some(report)
        } else {
            None
        };

        if punishment.is_success() || self.cfg.purge_on_failed_punishment {
            if let Err(e) = self.ledger.purge(guild_id, actor_id, kind).await {
                tracing::warn!(error = ?e, guild = guild_id, actor = actor_id, %kind, "ledger purge failed");
            }
        }

        self.lock.release(actor_id, punishment.is_success());
        tracing::warn!(
            guild = guild_id,
            actor = actor_id,
            %kind,
            punishment = ?punishment,
            recovery = ?recovery,
            "response finished"
        );

        Response {
            kind,
            actor_id,
            punishment,
            bot_punishment,
            recovery,
            vanity_reverted,
        }
    }

    async fn unattributed(&self, guild_id: u64, d: &Derived, why: Unattributed) -> Outcome {
        tracing::debug!(guild = guild_id, kind = %d.kind, target = d.target_id, reason = ?why, "unattributed action");

        match d.kind {
            ActionKind::ChannelDelete | ActionKind::RoleDelete
                if d.kind.recovery_enabled(&self.cfg.recovery) =>
            {
                let Some(attrs) = &d.snapshot else {
                    return Outcome::Ignored(Skip::Unattributed);
                };
                // our own restore may be deleting things right now
                if self.lock.guild_busy(guild_id) {
                    tracing::debug!(guild = guild_id, kind = %d.kind, target = d.target_id, "operation running, no precautionary restore");
                    return Outcome::Ignored(Skip::Unattributed);
                }
                self.counters.precautionary.fetch_add(1, Ordering::Relaxed);
                let snap = EntitySnapshot::new(guild_id, d.target_id, d.kind, attrs.clone());
                let restored = match self
                    .restorer
                    .restore_entity(&snap, &Default::default())
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, guild = guild_id, kind = %d.kind, target = d.target_id, "precautionary restore failed");
                        false
                    }
                };
                tracing::warn!(guild = guild_id, kind = %d.kind, target = d.target_id, restored, "precautionary restore");
                Outcome::Precautionary {
                    kind: d.kind,
                    target_id: d.target_id,
                    restored,
                }
            }
            ActionKind::BotAdd => {
                let bot_id = d.target_id;
                if !self.lock.try_acquire(bot_id, guild_id, ActionKind::BotAdd) {
                    return Outcome::AlreadyProcessing {
                        kind: ActionKind::BotAdd,
                        actor_id: bot_id,
                    };
                }
                self.lock.advance(bot_id, OpState::Punishing);
                let punishment = self
                    .punisher
                    .punish(guild_id, bot_id, ActionKind::BotAdd, "unauthorized bot (inviter unknown)")
                    .await;
                self.lock.release(bot_id, punishment.is_success());
                Outcome::BotRemoved { bot_id, punishment }
            }
            _ => Outcome::Ignored(Skip::Unattributed),
        }
    }

    /// Puts the vanity code back to the old one (or the configured fallback).
    async fn revert_vanity(&self, guild_id: u64, change: &VanityChange) -> bool {
        let code = change
            .old
            .as_deref()
            .or(self.vanity.fallback_code.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let Some(code) = code else {
            tracing::warn!(guild = guild_id, "vanity changed but there is no code to revert to");
            return false;
        };

        let credential_route = format!("guild.{guild_id}.vanity.credential");
        let opts = RetryOptions::with_limit(1);
        for attempt in 0..2 {
            let credential = self
                .credentials
                .get_or_acquire(guild_id, || {
                    self.executor.execute(&credential_route, &opts, || {
                        self.platform.exchange_vanity_credential(guild_id)
                    })
                })
                .await;
            let credential = match credential {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, guild = guild_id, "vanity credential unavailable");
                    return false;
                }
            };

            let res = self
                .executor
                .execute(&format!("guild.{guild_id}.vanity"), &opts, || {
                    self.platform.set_vanity_code(guild_id, &code, &credential)
                })
                .await;
            match res {
                Ok(()) => {
                    tracing::info!(guild = guild_id, code = %code, "vanity code reverted");
                    return true;
                }
                Err(PlatformError::Unauthorized) if attempt == 0 => {
                    // cached credential expired early
                    self.credentials.invalidate(guild_id);
                }
                Err(e) => {
                    tracing::error!(error = %e, guild = guild_id, code = %code, "vanity revert failed");
                    return false;
                }
            }
        }
        false
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let actions_in_store = self
            .store
            .action_stats(self.cfg.protected_guild)
            .await?
            .into_iter()
            .map(|(k, n)| (k.as_str().to_string(), n))
            .collect();
        Ok(EngineStats {
            protected_guild: self.cfg.protected_guild,
            uptime_secs: self.started.elapsed().as_secs(),
            events: self.counters.events.load(Ordering::Relaxed),
            counted: self.counters.counted.load(Ordering::Relaxed),
            responses: self.counters.responses.load(Ordering::Relaxed),
            precautionary: self.counters.precautionary.load(Ordering::Relaxed),
            actions_in_store,
            operations: self.lock.snapshot(),
            executor: self.executor.stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PunishmentMode, Settings};
    use crate::db::MemoryStore;
    use crate::notify::NoopNotifier;
    use crate::testing::{Call, MockPlatform, RecordingNotifier, text_channel};
    use serenity::all::Permissions;

    const GUILD: u64 = 1;
    const ME: u64 = 100;
    const NUKER: u64 = 7;
    const FRIEND: u64 = 333333333333333333;

    fn engine_with(
        p: &Arc<MockPlatform>,
        notifier: Arc<dyn Notifier>,
        tweak: impl FnOnce(&mut Settings),
    ) -> Arc<Antinuke> {
        let mut s = Settings::for_tests(GUILD);
        s.antinuke.default_threshold = 3;
        s.antinuke.recovery.delay_ms = 0;
        s.whitelist.users = vec![FRIEND.to_string()];
        tweak(&mut s);
        Antinuke::new(GuardCtx {
            exemptions: Arc::new(Exemptions::from_config(&s.whitelist)),
            config: s.antinuke,
            vanity: s.vanity,
            owner_dm: s.notify.owner_dm,
            platform: p.clone(),
            executor: CallExecutor::new(),
            store: Arc::new(MemoryStore::new()),
            notifier,
        })
    }

    fn engine(p: &Arc<MockPlatform>) -> Arc<Antinuke> {
        engine_with(p, Arc::new(NoopNotifier), |_| {})
    }

    fn delete_channel(p: &MockPlatform, actor: Option<u64>, id: u64) -> GuardEvent {
        p.push_audit(GUILD, 12, actor, id);
        GuardEvent::new(
            GUILD,
            EventPayload::ChannelDeleted {
                channel: text_channel(id, &format!("chan-{id}"), None),
            },
        )
    }

    #[tokio::test]
    async fn counts_then_punishes_and_restores() {
        let p = MockPlatform::new(ME);
        p.add_member(NUKER, 1, Permissions::MANAGE_CHANNELS);
        let e = engine(&p);

        for (i, id) in [501, 502].into_iter().enumerate() {
            let out = e.handle(delete_channel(&p, Some(NUKER), id)).await;
            assert_eq!(
                out,
                vec![Outcome::Counted {
                    kind: ActionKind::ChannelDelete,
                    actor_id: NUKER,
                    count: i as u64 + 1,
                    threshold: 3
                }]
            );
        }
        let out = e.handle(delete_channel(&p, Some(NUKER), 503)).await;
        let [Outcome::Responded(resp)] = out.as_slice() else {
            panic!("expected a response, got {out:?}");
        };
        assert_eq!(resp.punishment, PunishOutcome::Punished(PunishmentMode::Ban));
        assert_eq!(
            resp.recovery,
            Some(RestoreReport {
                succeeded: 3,
                failed: 0
            })
        );
        let calls = p.calls();
        assert_eq!(calls[0], Call::Ban(NUKER));
        assert_eq!(
            calls.iter().filter(|c| matches!(c, Call::CreateChannel(_))).count(),
            3
        );
    }

    #[tokio::test]
    async fn actor_under_response_is_not_double_punished() {
        let p = MockPlatform::new(ME);
        p.add_member(NUKER, 1, Permissions::empty());
        let e = engine(&p);
        for id in 501..504 {
            e.handle(delete_channel(&p, Some(NUKER), id)).await;
        }
        // still inside the grace period after release
        let out = e.handle(delete_channel(&p, Some(NUKER), 504)).await;
        assert_eq!(
            out,
            vec![Outcome::AlreadyProcessing {
                kind: ActionKind::ChannelDelete,
                actor_id: NUKER
            }]
        );
        assert_eq!(p.calls().iter().filter(|c| **c == Call::Ban(NUKER)).count(), 1);
    }

    #[tokio::test]
    async fn skips_foreign_own_and_exempt() {
        let p = MockPlatform::new(ME);
        let e = engine(&p);

        let foreign = GuardEvent::new(2, EventPayload::BanAdded { user_id: 9 });
        assert_eq!(e.handle(foreign).await, vec![Outcome::Ignored(Skip::ForeignGuild)]);

        let own = delete_channel(&p, Some(ME), 601);
        assert_eq!(e.handle(own).await, vec![Outcome::Ignored(Skip::OwnAction)]);

        let friendly = delete_channel(&p, Some(FRIEND), 602);
        assert_eq!(e.handle(friendly).await, vec![Outcome::Ignored(Skip::Exempt)]);

        let human_join = GuardEvent::new(GUILD, EventPayload::MemberAdded { user_id: 9, bot: false });
        assert_eq!(e.handle(human_join).await, vec![Outcome::Ignored(Skip::NoAction)]);
        assert!(p.calls().is_empty());
    }

    #[tokio::test]
    async fn unattributed_delete_is_restored_as_a_precaution() {
        let p = MockPlatform::new(ME);
        let e = engine(&p);
        let out = e.handle(delete_channel(&p, None, 701)).await;
        assert_eq!(
            out,
            vec![Outcome::Precautionary {
                kind: ActionKind::ChannelDelete,
                target_id: 701,
                restored: true
            }]
        );
        assert_eq!(p.calls(), vec![Call::CreateChannel("chan-701".into())]);
    }

    #[tokio::test]
    async fn no_precautionary_restore_while_an_operation_runs() {
        let p = MockPlatform::new(ME);
        let e = engine(&p);
        assert!(e.operations().try_acquire(NUKER, GUILD, ActionKind::ChannelCreate));

        let out = e.handle(delete_channel(&p, None, 702)).await;
        assert_eq!(out, vec![Outcome::Ignored(Skip::Unattributed)]);
        assert!(p.calls().is_empty());
    }

    #[tokio::test]
    async fn bot_add_removes_bot_then_inviter() {
        let p = MockPlatform::new(ME);
        p.add_member(NUKER, 1, Permissions::MANAGE_GUILD);
        p.add_member(55, 0, Permissions::empty());
        p.push_audit(GUILD, 28, Some(NUKER), 55);
        let e = engine(&p);

        let out = e
            .handle(GuardEvent::new(GUILD, EventPayload::MemberAdded { user_id: 55, bot: true }))
            .await;
        let [Outcome::Responded(resp)] = out.as_slice() else {
            panic!("expected a response, got {out:?}");
        };
        assert_eq!(resp.bot_punishment, Some(PunishOutcome::Punished(PunishmentMode::Ban)));
        assert!(resp.punishment.is_success());
        assert_eq!(resp.recovery, None);
        assert_eq!(p.calls(), vec![Call::Ban(55), Call::Ban(NUKER)]);
    }

    #[tokio::test]
    async fn unattributed_bot_is_removed_alone() {
        let p = MockPlatform::new(ME);
        p.add_member(55, 0, Permissions::empty());
        let e = engine(&p);
        let out = e
            .handle(GuardEvent::new(GUILD, EventPayload::MemberAdded { user_id: 55, bot: true }))
            .await;
        assert_eq!(
            out,
            vec![Outcome::BotRemoved {
                bot_id: 55,
                punishment: PunishOutcome::Punished(PunishmentMode::Ban)
            }]
        );
        assert_eq!(p.calls(), vec![Call::Ban(55)]);
    }

    #[tokio::test]
    async fn whitelisted_inviter_may_add_bots() {
        let p = MockPlatform::new(ME);
        p.push_audit(GUILD, 28, Some(FRIEND), 55);
        let e = engine(&p);
        let out = e
            .handle(GuardEvent::new(GUILD, EventPayload::MemberAdded { user_id: 55, bot: true }))
            .await;
        assert_eq!(out, vec![Outcome::Ignored(Skip::Exempt)]);
        assert!(p.calls().is_empty());
    }

    fn server(vanity: Option<&str>) -> snapshot::ServerSnapshot {
        snapshot::ServerSnapshot {
            name: "tigris".into(),
            verification_level: 1,
            explicit_content_filter: 0,
            default_message_notifications: 0,
            mfa_level: 0,
            vanity_code: vanity.map(str::to_string),
        }
    }

    fn vanity_event(old: Option<&str>, new: Option<&str>) -> GuardEvent {
        GuardEvent::new(
            GUILD,
            EventPayload::GuildUpdated {
                old: Some(server(old)),
                new: server(new),
            },
        )
    }

    #[tokio::test]
    async fn vanity_change_is_reverted_with_a_fresh_credential() {
        let p = MockPlatform::new(ME);
        p.add_member(NUKER, 1, Permissions::MANAGE_GUILD);
        p.push_audit(GUILD, 1, Some(NUKER), GUILD);
        p.fail_times("set_vanity_code", PlatformError::Unauthorized, 1);
        let e = engine(&p);
        e.credentials().set(GUILD, "stale".into());

        let out = e.handle(vanity_event(Some("tigris"), Some("stolen"))).await;
        let [Outcome::Responded(resp)] = out.as_slice() else {
            panic!("expected a response, got {out:?}");
        };
        assert_eq!(resp.vanity_reverted, Some(true));
        assert_eq!(
            p.calls(),
            vec![
                Call::Ban(NUKER),
                Call::ExchangeVanityCredential,
                Call::SetVanityCode("tigris".into(), "cred-1".into()),
            ]
        );
        assert_eq!(e.credentials().get(GUILD), Some("cred-1".into()));
    }

    #[tokio::test]
    async fn vanity_reverts_to_fallback_even_when_punishment_fails() {
        let p = MockPlatform::new(ME);
        // nuker outranks us
        p.add_member(NUKER, 50, Permissions::ADMINISTRATOR);
        p.push_audit(GUILD, 1, Some(NUKER), GUILD);
        let rec = RecordingNotifier::new();
        let e = engine_with(&p, rec.clone(), |s| {
            s.vanity.fallback_code = Some("tigris-home".into());
        });

        let out = e.handle(vanity_event(None, Some("stolen"))).await;
        let [Outcome::Responded(resp)] = out.as_slice() else {
            panic!("expected a response, got {out:?}");
        };
        assert!(matches!(resp.punishment, PunishOutcome::Hierarchy { .. }));
        assert_eq!(resp.vanity_reverted, Some(true));
        assert!(p.calls().contains(&Call::SetVanityCode("tigris-home".into(), "cred-1".into())));

        tokio::task::yield_now().await;
        let alerts = rec.alerts();
        assert!(alerts.iter().any(|a| matches!(a, Alert::Threshold { .. })));
        assert!(alerts.iter().any(|a| matches!(a, Alert::Hierarchy { .. })));
    }

    #[tokio::test]
    async fn stats_reflect_activity() {
        let p = MockPlatform::new(ME);
        p.add_member(NUKER, 1, Permissions::empty());
        let e = engine(&p);
        e.handle(delete_channel(&p, Some(NUKER), 801)).await;
        let stats = e.stats().await.expect("stats");
        assert_eq!(stats.protected_guild, GUILD);
        assert_eq!(stats.events, 1);
        assert_eq!(stats.counted, 1);
        assert_eq!(stats.actions_in_store.get("channel_delete"), Some(&1));
    }
}
