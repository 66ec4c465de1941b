// src/discord/mod.rs
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures_util::FutureExt;
use serenity::all::*;
use serenity::async_trait;

use crate::AppContext;
use crate::antinuke::{EventPayload, GuardEvent};

pub mod convert;
pub mod platform;

pub use platform::SerenityPlatform;

pub struct Handler {
    pub app: Arc<AppContext>,
}

impl Handler {
    /// Hands the event to the engine. A panic inside is logged and swallowed
    /// so one bad event cannot take the shard down.
    async fn dispatch(&self, guild_id: GuildId, payload: EventPayload) {
        let Some(engine) = self.app.antinuke() else {
            tracing::debug!(gid = guild_id.get(), "event before ready, dropped");
            return;
        };
        let event = GuardEvent::new(guild_id.get(), payload);
        let fut = engine.handle(event);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(outcomes) => {
                for o in outcomes {
                    tracing::trace!(gid = guild_id.get(), outcome = ?o, "handled");
                }
            }
            Err(_) => tracing::error!(gid = guild_id.get(), "antinuke handler panicked"),
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);

        let platform = Arc::new(SerenityPlatform::new(
            ctx.http.clone(),
            ctx.cache.clone(),
            ready.user.id.get(),
        ));
        // ready also fires after reconnects; the engine is built once
        if let Some(engine) = self.app.init_antinuke(platform) {
            if let Some(addr) = self.app.settings.antinuke.api_addr.as_deref() {
                if let Err(e) = crate::antinuke::api::spawn(addr, engine).await {
                    tracing::error!(error = ?e, "status api not started");
                }
            }
        }

        let protected = self.app.settings.antinuke.protected_guild;
        if !ready.guilds.iter().any(|g| g.id.get() == protected) {
            tracing::warn!(gid = protected, "protected guild is not in the ready payload");
        }
    }

    async fn channel_create(&self, _ctx: Context, channel: GuildChannel) {
        let payload = EventPayload::ChannelCreated {
            channel: convert::channel(&channel),
        };
        self.dispatch(channel.guild_id, payload).await;
    }

    async fn channel_delete(
        &self,
        _ctx: Context,
        channel: GuildChannel,
        _messages: Option<Vec<Message>>,
    ) {
        let payload = EventPayload::ChannelDeleted {
            channel: convert::channel(&channel),
        };
        self.dispatch(channel.guild_id, payload).await;
    }

    async fn channel_update(&self, _ctx: Context, old: Option<GuildChannel>, new: GuildChannel) {
        let payload = EventPayload::ChannelUpdated {
            old: old.as_ref().map(convert::channel),
            new: convert::channel(&new),
        };
        self.dispatch(new.guild_id, payload).await;
    }

    async fn guild_role_create(&self, _ctx: Context, new: Role) {
        let payload = EventPayload::RoleCreated {
            role: convert::role(&new),
        };
        self.dispatch(new.guild_id, payload).await;
    }

    async fn guild_role_delete(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        removed_role_id: RoleId,
        removed_role_data_if_available: Option<Role>,
    ) {
        let payload = EventPayload::RoleDeleted {
            role_id: removed_role_id.get(),
            role: removed_role_data_if_available.as_ref().map(convert::role),
        };
        self.dispatch(guild_id, payload).await;
    }

    async fn guild_role_update(&self, _ctx: Context, old: Option<Role>, new: Role) {
        let payload = EventPayload::RoleUpdated {
            old: old.as_ref().map(convert::role),
            new: convert::role(&new),
        };
        self.dispatch(new.guild_id, payload).await;
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let payload = EventPayload::MemberAdded {
            user_id: member.user.id.get(),
            bot: member.user.bot,
        };
        self.dispatch(member.guild_id, payload).await;
    }

    async fn guild_member_removal(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        user: User,
        _member: Option<Member>,
    ) {
        let payload = EventPayload::MemberRemoved {
            user_id: user.id.get(),
            bot: user.bot,
        };
        self.dispatch(guild_id, payload).await;
    }

    async fn guild_member_update(
        &self,
        _ctx: Context,
        old: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        let payload = EventPayload::MemberUpdated {
            user_id: event.user.id.get(),
            old_roles: old.map(|m| m.roles.iter().map(|r| r.get()).collect()),
            new_roles: event.roles.iter().map(|r| r.get()).collect(),
        };
        self.dispatch(event.guild_id, payload).await;
    }

    async fn guild_ban_addition(&self, _ctx: Context, guild_id: GuildId, banned_user: User) {
        let payload = EventPayload::BanAdded {
            user_id: banned_user.id.get(),
        };
        self.dispatch(guild_id, payload).await;
    }

    async fn guild_ban_removal(&self, _ctx: Context, guild_id: GuildId, unbanned_user: User) {
        let payload = EventPayload::BanRemoved {
            user_id: unbanned_user.id.get(),
        };
        self.dispatch(guild_id, payload).await;
    }

    async fn guild_update(&self, _ctx: Context, old: Option<Guild>, new: PartialGuild) {
        let payload = EventPayload::GuildUpdated {
            old: old.as_ref().map(convert::server_from_guild),
            new: convert::server_from_partial(&new),
        };
        self.dispatch(new.id, payload).await;
    }

    async fn guild_audit_log_entry_create(
        &self,
        _ctx: Context,
        entry: AuditLogEntry,
        guild_id: GuildId,
    ) {
        let payload = EventPayload::AuditEntryCreated {
            entry: convert::audit_entry(&entry),
        };
        self.dispatch(guild_id, payload).await;
    }
}

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MODERATION" => i |= GatewayIntents::GUILD_MODERATION,
            other => tracing::warn!(intent = other, "unknown intent ignored"),
        }
    }
    // the engine is blind without these three
    i | crate::default_gateway_intents()
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("missing Discord token (TSS_DISCORD__TOKEN), set it in .env");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);
    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    let shards = client.shard_manager.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested, closing shards");
        shards.shutdown_all().await;
    });

    tracing::info!("Discord client starting…");
    let res = client.start().await;
    ctx.db.close().await;
    tracing::info!("database pool closed");
    res?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = ?e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = ?e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_intents_are_always_on() {
        let i = intents_from_settings(&[]);
        assert!(i.contains(GatewayIntents::GUILDS | GatewayIntents::GUILD_MEMBERS | GatewayIntents::GUILD_MODERATION));
        let i = intents_from_settings(&["GUILD_MESSAGES".into()]);
        assert_eq!(i, crate::default_gateway_intents());
    }
}
