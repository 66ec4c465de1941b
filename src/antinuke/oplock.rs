//! Per-actor operation lock.
//!
//! At most one punish+restore runs per actor. An entry moves through
//! `Evaluating -> Punishing -> Restoring -> Done | Failed`, stays around for a
//! short grace period after completion (late events from the same burst are
//! dropped while it exists) and is swept once stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::time::Instant;

use super::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    Evaluating,
    Punishing,
    Restoring,
    Done,
    Failed,
}

impl OpState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Done | OpState::Failed)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    guild_id: u64,
    kind: ActionKind,
    state: OpState,
    started_at: Instant,
    completed_at: Option<Instant>,
    token: u64,
}

/// Read-only view for `/stats`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LockView {
    pub actor_id: u64,
    pub guild_id: u64,
    pub kind: ActionKind,
    pub state: OpState,
    pub age_ms: u64,
}

#[derive(Debug)]
pub struct OperationLock {
    entries: DashMap<u64, LockEntry>,
    stale_after: Duration,
    grace: Duration,
    next_token: AtomicU64,
}

impl OperationLock {
    pub fn new(stale_after: Duration, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            stale_after,
            grace,
            next_token: AtomicU64::new(1),
        })
    }

    fn is_stale(&self, e: &LockEntry, now: Instant) -> bool {
        now.duration_since(e.started_at) > self.stale_after
    }

    /// Claims the actor. False while another operation (or its grace period)
    /// holds it; a stale entry is taken over.
    pub fn try_acquire(&self, actor_id: u64, guild_id: u64, kind: ActionKind) -> bool {
        let now = Instant::now();
        let fresh = LockEntry {
            guild_id,
            kind,
            state: OpState::Evaluating,
            started_at: now,
            completed_at: None,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        };
        match self.entries.entry(actor_id) {
            Entry::Occupied(mut o) => {
                if !self.is_stale(o.get(), now) {
                    return false;
                }
                tracing::warn!(
                    actor = actor_id,
                    guild = o.get().guild_id,
                    kind = %o.get().kind,
                    state = ?o.get().state,
                    "taking over stale operation"
                );
                o.insert(fresh);
                true
            }
            Entry::Vacant(v) => {
                v.insert(fresh);
                true
            }
        }
    }

    pub fn is_processing(&self, actor_id: u64) -> bool {
        let now = Instant::now();
        self.entries
            .get(&actor_id)
            .is_some_and(|e| !self.is_stale(&e, now))
    }

    /// True while any operation in the guild is running or in its grace period.
    pub fn guild_busy(&self, guild_id: u64) -> bool {
        let now = Instant::now();
        self.entries
            .iter()
            .any(|e| e.guild_id == guild_id && !self.is_stale(&e, now))
    }

    pub fn state(&self, actor_id: u64) -> Option<OpState> {
        self.entries.get(&actor_id).map(|e| e.state)
    }

    pub fn advance(&self, actor_id: u64, state: OpState) {
        if let Some(mut e) = self.entries.get_mut(&actor_id) {
            tracing::debug!(actor = actor_id, from = ?e.state, to = ?state, "operation state");
            e.state = state;
        }
    }

    /// Marks the operation finished. The entry is dropped after the grace period.
    pub fn release(self: &Arc<Self>, actor_id: u64, succeeded: bool) {
        let token = {
            let Some(mut e) = self.entries.get_mut(&actor_id) else {
                return;
            };
            e.state = if succeeded {
                OpState::Done
            } else {
                OpState::Failed
            };
            e.completed_at = Some(Instant::now());
            e.token
        };

        let weak = Arc::downgrade(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(strong) = weak.upgrade() {
                strong
                    .entries
                    .remove_if(&actor_id, |_, e| e.token == token);
            }
        });
    }

    /// Drops stale entries and completed ones past their grace period.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|actor, e| {
            let expired_grace = e
                .completed_at
                .is_some_and(|t| now.duration_since(t) > self.grace);
            let stale = self.is_stale(e, now);
            if stale && !e.state.is_terminal() {
                tracing::warn!(actor, guild = e.guild_id, kind = %e.kind, state = ?e.state, "dropping stuck operation");
            }
            !(expired_grace || stale)
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn spawn_sweeper(this: &Arc<Self>, every: Duration) {
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Some(strong) = weak.upgrade() {
                    let n = strong.sweep();
                    if n > 0 {
                        tracing::debug!(removed = n, "operation lock sweep");
                    }
                } else {
                    break;
                }
            }
        });
    }

    pub fn snapshot(&self) -> Vec<LockView> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|e| LockView {
                actor_id: *e.key(),
                guild_id: e.guild_id,
                kind: e.kind,
                state: e.state,
                age_ms: now.duration_since(e.started_at).as_millis() as u64,
            })
            .collect();
        out.sort_by_key(|v| v.actor_id);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> Arc<OperationLock> {
        OperationLock::new(Duration::from_secs(300), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn one_operation_per_actor() {
        let l = lock();
        assert!(l.try_acquire(1, 9, ActionKind::Ban));
        assert!(!l.try_acquire(1, 9, ActionKind::ChannelDelete));
        assert!(l.try_acquire(2, 9, ActionKind::Ban));
        assert_eq!(l.state(1), Some(OpState::Evaluating));
    }

    #[tokio::test(start_paused = true)]
    async fn guild_is_busy_until_grace_ends() {
        let l = lock();
        assert!(!l.guild_busy(9));
        assert!(l.try_acquire(1, 9, ActionKind::ChannelCreate));
        assert!(l.guild_busy(9));
        assert!(!l.guild_busy(8));
        l.release(1, true);
        assert!(l.guild_busy(9));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!l.guild_busy(9));
    }

    #[tokio::test(start_paused = true)]
    async fn release_keeps_entry_for_grace_period() {
        let l = lock();
        assert!(l.try_acquire(1, 9, ActionKind::Ban));
        l.advance(1, OpState::Punishing);
        l.release(1, true);
        assert_eq!(l.state(1), Some(OpState::Done));
        assert!(!l.try_acquire(1, 9, ActionKind::Ban));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(l.is_empty());
        assert!(l.try_acquire(1, 9, ActionKind::Ban));
    }

    #[tokio::test(start_paused = true)]
    async fn late_removal_does_not_drop_a_newer_entry() {
        let l = OperationLock::new(Duration::from_secs(10), Duration::from_secs(30));
        assert!(l.try_acquire(1, 9, ActionKind::Ban));
        l.release(1, false);
        // stale after 10s, so a new operation takes over before the grace timer fires
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(l.try_acquire(1, 9, ActionKind::Kick));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(l.state(1), Some(OpState::Evaluating));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_stale_entries() {
        let l = lock();
        assert!(l.try_acquire(1, 9, ActionKind::Ban));
        assert_eq!(l.sweep(), 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!l.is_processing(1));
        assert_eq!(l.sweep(), 1);
        assert!(l.is_empty());
    }
}
