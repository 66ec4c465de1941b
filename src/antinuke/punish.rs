use std::sync::Arc;

use serenity::all::Permissions;

use super::ActionKind;
use super::exemptions::Exemptions;
use super::platform::{MemberInfo, Platform, PlatformError};
use crate::config::PunishmentMode;
use crate::notify::{self, Alert, Notifier, punishment_word};
use crate::ratelimit::{CallExecutor, RetryOptions};

#[derive(Debug, Clone, PartialEq)]
pub enum PunishOutcome {
    /// Sanction applied. `PunishmentMode::None` means detected and reported only.
    Punished(PunishmentMode),
    RefusedSelf,
    RefusedOwner,
    MemberNotFound,
    OwnMemberMissing,
    MissingPermission,
    Hierarchy { actor_position: i64, own_position: i64 },
    Failed(PlatformError),
}

impl PunishOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PunishOutcome::Punished(_))
    }
}

pub struct Punisher {
    platform: Arc<dyn Platform>,
    executor: Arc<CallExecutor>,
    exemptions: Arc<Exemptions>,
    notifier: Arc<dyn Notifier>,
    mode: PunishmentMode,
    owner_dm: bool,
}

impl Punisher {
    pub fn new(
        platform: Arc<dyn Platform>,
        executor: Arc<CallExecutor>,
        exemptions: Arc<Exemptions>,
        notifier: Arc<dyn Notifier>,
        mode: PunishmentMode,
        owner_dm: bool,
    ) -> Self {
        Self {
            platform,
            executor,
            exemptions,
            notifier,
            mode,
            owner_dm,
        }
    }

    async fn member(&self, guild_id: u64, user_id: u64) -> Result<MemberInfo, PlatformError> {
        self.executor
            .execute(
                &format!("guild.{guild_id}.members.fetch.{user_id}"),
                &RetryOptions::with_limit(2),
                || self.platform.fetch_member(guild_id, user_id),
            )
            .await
    }

    pub async fn punish(
        &self,
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        reason: &str,
    ) -> PunishOutcome {
        let self_id = self.platform.current_user_id();
        if actor_id == self_id {
            tracing::warn!(guild = guild_id, "refusing to punish ourselves");
            return PunishOutcome::RefusedSelf;
        }
        if self.exemptions.is_owner(actor_id) {
            tracing::warn!(guild = guild_id, actor = actor_id, "refusing to punish an owner");
            return PunishOutcome::RefusedOwner;
        }

        let member = match self.member(guild_id, actor_id).await {
            Ok(m) => m,
            Err(PlatformError::NotFound) => {
                tracing::warn!(guild = guild_id, actor = actor_id, "member not found, may have left");
                return PunishOutcome::MemberNotFound;
            }
            Err(e) => {
                tracing::warn!(error = %e, guild = guild_id, actor = actor_id, "member fetch failed");
                return PunishOutcome::Failed(e);
            }
        };
        if member.is_owner() {
            tracing::warn!(guild = guild_id, actor = actor_id, "actor owns the guild, cannot punish");
            return PunishOutcome::RefusedOwner;
        }

        let me = match self.member(guild_id, self_id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, guild = guild_id, "cannot resolve our own member");
                return PunishOutcome::OwnMemberMissing;
            }
        };

        let required = match self.mode {
            PunishmentMode::Ban => Permissions::BAN_MEMBERS,
            PunishmentMode::Kick | PunishmentMode::None => Permissions::KICK_MEMBERS,
        };
        if !me.permissions.contains(required) && !me.permissions.contains(Permissions::ADMINISTRATOR)
        {
            tracing::error!(guild = guild_id, actor = actor_id, required = ?required, "missing permission to punish");
            return PunishOutcome::MissingPermission;
        }

        if member.highest_position >= me.highest_position {
            tracing::error!(
                guild = guild_id,
                actor = actor_id,
                actor_position = member.highest_position,
                own_position = me.highest_position,
                "actor ranks at or above us"
            );
            notify::fire_and_forget(
                &self.notifier,
                Alert::Hierarchy {
                    guild_id,
                    actor_id,
                    kind,
                    actor_position: member.highest_position,
                    own_position: me.highest_position,
                },
            );
            return PunishOutcome::Hierarchy {
                actor_position: member.highest_position,
                own_position: me.highest_position,
            };
        }

        let staff = Permissions::ADMINISTRATOR
            | Permissions::BAN_MEMBERS
            | Permissions::KICK_MEMBERS
            | Permissions::MANAGE_ROLES
            | Permissions::MANAGE_GUILD;
        if member.permissions.intersects(staff) {
            tracing::warn!(guild = guild_id, actor = actor_id, "actor holds staff permissions");
        }

        let full_reason = format!("[AntiNuke] {reason}");
        let applied = match self.mode {
            PunishmentMode::Ban => {
                self.executor
                    .execute(
                        &format!("guild.{guild_id}.members.ban"),
                        &RetryOptions::default(),
                        || self.platform.ban(guild_id, actor_id, &full_reason),
                    )
                    .await
            }
            PunishmentMode::Kick => {
                self.executor
                    .execute(
                        &format!("guild.{guild_id}.members.kick"),
                        &RetryOptions::default(),
                        || self.platform.kick(guild_id, actor_id, &full_reason),
                    )
                    .await
            }
            PunishmentMode::None => {
                tracing::warn!(guild = guild_id, actor = actor_id, %kind, "punishment disabled, detection only");
                Ok(())
            }
        };
        if let Err(e) = applied {
            tracing::error!(error = %e, guild = guild_id, actor = actor_id, "punishment call failed");
            return PunishOutcome::Failed(e);
        }

        tracing::info!(guild = guild_id, actor = actor_id, %kind, mode = ?self.mode, "actor {}", punishment_word(self.mode));
        notify::fire_and_forget(
            &self.notifier,
            Alert::Punished {
                guild_id,
                actor_id,
                kind,
                mode: self.mode,
                reason: reason.to_string(),
            },
        );
        if self.owner_dm {
            self.notify_owners(guild_id, actor_id, reason).await;
        }

        PunishOutcome::Punished(self.mode)
    }

    /// DMs every configured owner. Returns (sent, failed); never fails the caller.
    pub async fn notify_owners(&self, guild_id: u64, actor_id: u64, reason: &str) -> (usize, usize) {
        let message = format!(
            "**ANTI-NUKE ACTION TAKEN**\n**Server:** {guild_id}\n**User:** <@{actor_id}> ({actor_id})\n**Action:** {}\n**Reason:** {reason}\n**Time:** {}",
            punishment_word(self.mode).to_uppercase(),
            chrono::Utc::now().to_rfc3339()
        );

        let (mut sent, mut failed) = (0, 0);
        for owner in self.exemptions.owners() {
            let res = self
                .executor
                .execute(
                    &format!("users.{owner}.send"),
                    &RetryOptions::with_limit(2),
                    || self.platform.send_direct_message(owner, &message),
                )
                .await;
            match res {
                Ok(()) => sent += 1,
                Err(e) => {
                    failed += 1;
                    tracing::debug!(error = %e, owner, "owner DM failed");
                }
            }
        }
        if failed > 0 {
            tracing::info!(sent, failed, "owner notifications");
        }
        (sent, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use crate::testing::{Call, MockPlatform, RecordingNotifier};

    const GUILD: u64 = 1;
    const ME: u64 = 100;
    const OWNER: u64 = 222222222222222222;

    fn punisher(p: &Arc<MockPlatform>, mode: PunishmentMode, owner_dm: bool) -> Punisher {
        Punisher::new(
            p.clone(),
            CallExecutor::new(),
            Arc::new(Exemptions::new([], [OWNER])),
            Arc::new(NoopNotifier),
            mode,
            owner_dm,
        )
    }

    #[tokio::test]
    async fn bans_lower_ranked_actor() {
        let p = MockPlatform::new(ME);
        p.add_member(7, 3, Permissions::MANAGE_CHANNELS);
        let out = punisher(&p, PunishmentMode::Ban, false)
            .punish(GUILD, 7, ActionKind::ChannelDelete, "mass delete")
            .await;
        assert_eq!(out, PunishOutcome::Punished(PunishmentMode::Ban));
        assert_eq!(p.calls(), vec![Call::Ban(7)]);
    }

    #[tokio::test]
    async fn refuses_self_and_owner() {
        let p = MockPlatform::new(ME);
        let pn = punisher(&p, PunishmentMode::Ban, false);
        assert_eq!(pn.punish(GUILD, ME, ActionKind::Ban, "x").await, PunishOutcome::RefusedSelf);
        assert_eq!(pn.punish(GUILD, OWNER, ActionKind::Ban, "x").await, PunishOutcome::RefusedOwner);
        p.add_member(5, i64::MAX, Permissions::empty());
        assert_eq!(pn.punish(GUILD, 5, ActionKind::Ban, "x").await, PunishOutcome::RefusedOwner);
        assert!(p.calls().is_empty());
    }

    #[tokio::test]
    async fn hierarchy_blocks_and_alerts() {
        let p = MockPlatform::new(ME);
        p.add_member(7, 10, Permissions::empty());
        let rec = RecordingNotifier::new();
        let pn = Punisher::new(
            p.clone(),
            CallExecutor::new(),
            Arc::new(Exemptions::default()),
            rec.clone(),
            PunishmentMode::Ban,
            false,
        );
        let out = pn.punish(GUILD, 7, ActionKind::Ban, "x").await;
        assert_eq!(
            out,
            PunishOutcome::Hierarchy {
                actor_position: 10,
                own_position: 10
            }
        );
        tokio::task::yield_now().await;
        assert!(matches!(rec.alerts().as_slice(), [Alert::Hierarchy { actor_id: 7, .. }]));
        assert!(p.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_permission() {
        let p = MockPlatform::new(ME);
        p.add_member(ME, 10, Permissions::KICK_MEMBERS);
        p.add_member(7, 1, Permissions::empty());
        let out = punisher(&p, PunishmentMode::Ban, false)
            .punish(GUILD, 7, ActionKind::Ban, "x")
            .await;
        assert_eq!(out, PunishOutcome::MissingPermission);
        // kick only needs KICK_MEMBERS
        let out = punisher(&p, PunishmentMode::Kick, false)
            .punish(GUILD, 7, ActionKind::Ban, "x")
            .await;
        assert_eq!(out, PunishOutcome::Punished(PunishmentMode::Kick));
    }

    #[tokio::test]
    async fn missing_member() {
        let p = MockPlatform::new(ME);
        let out = punisher(&p, PunishmentMode::Ban, false)
            .punish(GUILD, 7, ActionKind::Ban, "x")
            .await;
        assert_eq!(out, PunishOutcome::MemberNotFound);
    }

    #[tokio::test]
    async fn none_mode_reports_without_acting() {
        let p = MockPlatform::new(ME);
        p.add_member(7, 1, Permissions::empty());
        let out = punisher(&p, PunishmentMode::None, true)
            .punish(GUILD, 7, ActionKind::Ban, "x")
            .await;
        assert!(out.is_success());
        assert_eq!(p.calls(), vec![Call::DirectMessage(OWNER)]);
    }

    #[tokio::test]
    async fn owner_dm_failures_are_not_fatal() {
        let p = MockPlatform::new(ME);
        p.add_member(7, 1, Permissions::empty());
        p.fail_always("send_direct_message", PlatformError::Forbidden);
        let out = punisher(&p, PunishmentMode::Ban, true)
            .punish(GUILD, 7, ActionKind::Ban, "x")
            .await;
        assert!(out.is_success());
    }
}
