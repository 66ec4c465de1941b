//! `Platform` over serenity's HTTP client and cache.

use std::sync::Arc;
use std::time::Duration;

use serenity::all::{
    Cache, ChannelId, ChannelType, CreateAttachment, CreateChannel, CreateMessage,
    DefaultMessageNotificationLevel, EditChannel, EditGuild, EditMember, EditRole,
    ExplicitContentFilter, GuildId, Http, HttpError, MfaLevel, PermissionOverwrite,
    PermissionOverwriteType, Permissions, RoleId, UserId, VerificationLevel,
};
use serenity::async_trait;
use serenity::model::guild::audit_log::Action;

use super::convert;
use crate::antinuke::platform::{
    AuditEntry, MemberInfo, Platform, PlatformError, PlatformResult, ServerPatch,
};
use crate::antinuke::snapshot::{ChannelSnapshot, OverwriteSnapshot, RoleSnapshot, ServerSnapshot};
use crate::notify;

pub struct SerenityPlatform {
    http: Arc<Http>,
    cache: Arc<Cache>,
    self_id: u64,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>, self_id: u64) -> Self {
        Self {
            http,
            cache,
            self_id,
        }
    }

    /// Role icon from the CDN, so a re-created role keeps it.
    async fn role_icon(&self, role: &RoleSnapshot) -> Option<CreateAttachment> {
        let hash = role.icon.as_ref()?;
        let url = format!("https://cdn.discordapp.com/role-icons/{}/{hash}.png", role.id);
        let res = notify::http().get(&url).send().await.ok()?;
        if !res.status().is_success() {
            tracing::debug!(role = role.id, status = %res.status(), "role icon not downloadable");
            return None;
        }
        let bytes = res.bytes().await.ok()?;
        Some(CreateAttachment::bytes(bytes.to_vec(), "icon.png"))
    }
}

fn status_code(e: &serenity::Error) -> Option<u16> {
    match e {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => Some(resp.status_code.as_u16()),
        _ => None,
    }
}

fn platform_error(e: serenity::Error) -> PlatformError {
    match status_code(&e) {
        Some(401) => PlatformError::Unauthorized,
        Some(403) => PlatformError::Forbidden,
        Some(404) => PlatformError::NotFound,
        Some(429) => PlatformError::RateLimited {
            retry_after: Duration::from_secs(1),
            global: false,
        },
        _ => PlatformError::Transport(e.to_string()),
    }
}

fn overwrites(list: &[OverwriteSnapshot]) -> Vec<PermissionOverwrite> {
    list.iter()
        .map(|o| PermissionOverwrite {
            allow: Permissions::from_bits_truncate(o.allow),
            deny: Permissions::from_bits_truncate(o.deny),
            kind: if o.kind == 1 {
                PermissionOverwriteType::Member(UserId::new(o.id))
            } else {
                PermissionOverwriteType::Role(RoleId::new(o.id))
            },
        })
        .collect()
}

fn role_builder<'a>(r: &RoleSnapshot, icon: Option<&'a CreateAttachment>) -> EditRole<'a> {
    EditRole::new()
        .name(r.name.clone())
        .colour(r.colour)
        .hoist(r.hoist)
        .position(position(r.position))
        .permissions(Permissions::from_bits_truncate(r.permissions))
        .mentionable(r.mentionable)
        .unicode_emoji(r.unicode_emoji.clone())
        .icon(icon)
}

fn position(p: i64) -> u16 {
    u16::try_from(p.max(0)).unwrap_or(u16::MAX)
}

/// Full create request: overwrites go out with the channel itself, and the
/// parent too unless `with_parent` is off.
fn channel_builder(c: &ChannelSnapshot, with_parent: bool) -> CreateChannel<'static> {
    let mut builder = CreateChannel::new(c.name.clone())
        .kind(ChannelType::from(c.kind))
        .nsfw(c.nsfw)
        .position(position(c.position))
        .permissions(overwrites(&c.permission_overwrites));
    if let Some(t) = &c.topic {
        builder = builder.topic(t.clone());
    }
    if let Some(b) = c.bitrate {
        builder = builder.bitrate(b);
    }
    if let Some(l) = c.user_limit {
        builder = builder.user_limit(l);
    }
    if let Some(r) = c.rate_limit_per_user {
        builder = builder.rate_limit_per_user(r);
    }
    match c.parent_id {
        Some(p) if with_parent => builder.category(ChannelId::new(p)),
        _ => builder,
    }
}

#[async_trait]
impl Platform for SerenityPlatform {
    fn current_user_id(&self) -> u64 {
        self.self_id
    }

    async fn fetch_audit_log(
        &self,
        guild_id: u64,
        action: u8,
        limit: u8,
    ) -> PlatformResult<Vec<AuditEntry>> {
        let logs = GuildId::new(guild_id)
            .audit_logs(&self.http, Some(Action::from_value(action)), None, None, Some(limit))
            .await
            .map_err(platform_error)?;
        Ok(logs.entries.iter().map(convert::audit_entry).collect())
    }

    async fn fetch_member(&self, guild_id: u64, user_id: u64) -> PlatformResult<MemberInfo> {
        let gid = GuildId::new(guild_id);
        let member = gid
            .member(&self.http, UserId::new(user_id))
            .await
            .map_err(platform_error)?;

        let cached = self
            .cache
            .guild(gid)
            .map(|g| (g.owner_id.get(), convert::role_table(&g.roles)));
        let (owner_id, roles) = match cached {
            Some(v) => v,
            None => {
                let g = self.http.get_guild(gid).await.map_err(platform_error)?;
                (g.owner_id.get(), convert::role_table(&g.roles))
            }
        };
        let member_roles: Vec<u64> = member.roles.iter().map(|r| r.get()).collect();
        Ok(convert::rank(
            guild_id,
            owner_id,
            user_id,
            member.user.bot,
            &member_roles,
            &roles,
        ))
    }

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), 0, reason)
            .await
            .map_err(platform_error)
    }

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        self.http
            .remove_ban(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await
            .map_err(platform_error)
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        GuildId::new(guild_id)
            .kick_with_reason(&self.http, UserId::new(user_id), reason)
            .await
            .map_err(platform_error)
    }

    async fn create_channel(&self, guild_id: u64, c: &ChannelSnapshot) -> PlatformResult<u64> {
        let gid = GuildId::new(guild_id);
        match gid.create_channel(&self.http, channel_builder(c, true)).await {
            Ok(created) => return Ok(created.id.get()),
            // 400/404: the parent category is gone, create at top level
            Err(e) if c.parent_id.is_some() && matches!(status_code(&e), Some(400 | 404)) => {
                tracing::warn!(guild = guild_id, channel = c.id, parent = ?c.parent_id, error = %e, "parent rejected, creating without it");
            }
            Err(e) => return Err(platform_error(e)),
        }
        let created = gid
            .create_channel(&self.http, channel_builder(c, false))
            .await
            .map_err(platform_error)?;
        Ok(created.id.get())
    }

    async fn edit_channel(&self, _guild_id: u64, c: &ChannelSnapshot) -> PlatformResult<()> {
        let mut builder = EditChannel::new()
            .name(c.name.clone())
            .nsfw(c.nsfw)
            .category(c.parent_id.map(ChannelId::new));
        if let Some(t) = &c.topic {
            builder = builder.topic(t.clone());
        }
        if let Some(b) = c.bitrate {
            builder = builder.bitrate(b);
        }
        if let Some(l) = c.user_limit {
            builder = builder.user_limit(l);
        }
        if let Some(r) = c.rate_limit_per_user {
            builder = builder.rate_limit_per_user(r);
        }
        ChannelId::new(c.id)
            .edit(&self.http, builder)
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn set_channel_parent(&self, channel_id: u64, parent_id: Option<u64>) -> PlatformResult<()> {
        ChannelId::new(channel_id)
            .edit(&self.http, EditChannel::new().category(parent_id.map(ChannelId::new)))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn set_channel_overwrites(
        &self,
        channel_id: u64,
        list: &[OverwriteSnapshot],
    ) -> PlatformResult<()> {
        ChannelId::new(channel_id)
            .edit(&self.http, EditChannel::new().permissions(overwrites(list)))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn delete_channel(&self, channel_id: u64) -> PlatformResult<()> {
        ChannelId::new(channel_id)
            .delete(&self.http)
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn create_role(&self, guild_id: u64, r: &RoleSnapshot) -> PlatformResult<u64> {
        let icon = self.role_icon(r).await;
        let created = GuildId::new(guild_id)
            .create_role(&self.http, role_builder(r, icon.as_ref()))
            .await
            .map_err(platform_error)?;
        Ok(created.id.get())
    }

    async fn edit_role(&self, guild_id: u64, r: &RoleSnapshot) -> PlatformResult<()> {
        let icon = self.role_icon(r).await;
        GuildId::new(guild_id)
            .edit_role(&self.http, RoleId::new(r.id), role_builder(r, icon.as_ref()))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn delete_role(&self, guild_id: u64, role_id: u64) -> PlatformResult<()> {
        GuildId::new(guild_id)
            .delete_role(&self.http, RoleId::new(role_id))
            .await
            .map_err(platform_error)
    }

    async fn set_member_roles(
        &self,
        guild_id: u64,
        user_id: u64,
        role_ids: &[u64],
    ) -> PlatformResult<()> {
        let roles: Vec<RoleId> = role_ids.iter().copied().map(RoleId::new).collect();
        GuildId::new(guild_id)
            .edit_member(&self.http, UserId::new(user_id), EditMember::new().roles(roles))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn fetch_guild_settings(&self, guild_id: u64) -> PlatformResult<ServerSnapshot> {
        let g = self
            .http
            .get_guild(GuildId::new(guild_id))
            .await
            .map_err(platform_error)?;
        Ok(convert::server_from_partial(&g))
    }

    async fn edit_guild_settings(&self, guild_id: u64, patch: &ServerPatch) -> PlatformResult<()> {
        let gid = GuildId::new(guild_id);
        let mut builder = EditGuild::new();
        if let Some(n) = &patch.name {
            builder = builder.name(n.clone());
        }
        if let Some(v) = patch.verification_level {
            builder = builder.verification_level(VerificationLevel::from(v));
        }
        if let Some(v) = patch.explicit_content_filter {
            builder = builder.explicit_content_filter(Some(ExplicitContentFilter::from(v)));
        }
        if let Some(v) = patch.default_message_notifications {
            builder = builder
                .default_message_notifications(Some(DefaultMessageNotificationLevel::from(v)));
        }
        gid.edit(&self.http, builder).await.map_err(platform_error)?;

        if let Some(v) = patch.mfa_level {
            gid.edit_mfa_level(&self.http, MfaLevel::from(v), Some("[AntiNuke] restore"))
                .await
                .map_err(platform_error)?;
        }
        Ok(())
    }

    async fn send_direct_message(&self, user_id: u64, content: &str) -> PlatformResult<()> {
        UserId::new(user_id)
            .direct_message(&self.http, CreateMessage::new().content(content))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn exchange_vanity_credential(&self, _guild_id: u64) -> PlatformResult<String> {
        Err(PlatformError::Unsupported(
            "vanity credentials need a user account with MFA",
        ))
    }

    async fn set_vanity_code(&self, _guild_id: u64, _code: &str, _credential: &str) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("vanity codes cannot be set by bot accounts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_kinds_map_to_targets() {
        let list = overwrites(&[
            OverwriteSnapshot {
                id: 5,
                kind: 0,
                allow: Permissions::VIEW_CHANNEL.bits(),
                deny: 0,
            },
            OverwriteSnapshot {
                id: 6,
                kind: 1,
                allow: 0,
                deny: Permissions::SEND_MESSAGES.bits(),
            },
        ]);
        assert_eq!(list[0].kind, PermissionOverwriteType::Role(RoleId::new(5)));
        assert_eq!(list[1].kind, PermissionOverwriteType::Member(UserId::new(6)));
        assert_eq!(list[1].deny, Permissions::SEND_MESSAGES);
        assert_eq!(list.iter().filter_map(convert::overwrite).count(), 2);
    }

    fn snapshot_with_overwrites() -> ChannelSnapshot {
        ChannelSnapshot {
            id: 41,
            name: "staff".into(),
            kind: 0,
            topic: Some("private".into()),
            nsfw: false,
            bitrate: None,
            user_limit: None,
            rate_limit_per_user: Some(5),
            position: 3,
            parent_id: Some(9),
            permission_overwrites: vec![
                OverwriteSnapshot {
                    id: 1,
                    kind: 0,
                    allow: 0,
                    deny: Permissions::VIEW_CHANNEL.bits(),
                },
                OverwriteSnapshot {
                    id: 2,
                    kind: 0,
                    allow: Permissions::VIEW_CHANNEL.bits(),
                    deny: 0,
                },
            ],
        }
    }

    #[test]
    fn create_request_carries_overwrites_and_parent() {
        let body = serde_json::to_value(channel_builder(&snapshot_with_overwrites(), true)).unwrap();
        assert_eq!(body["name"], "staff");
        assert_eq!(body["permission_overwrites"].as_array().map(Vec::len), Some(2));
        assert!(!body["parent_id"].is_null());
    }

    #[test]
    fn create_request_without_parent_keeps_overwrites() {
        let body = serde_json::to_value(channel_builder(&snapshot_with_overwrites(), false)).unwrap();
        assert_eq!(body["permission_overwrites"].as_array().map(Vec::len), Some(2));
        assert!(body.get("parent_id").is_none_or(|v| v.is_null()));
    }

    #[test]
    fn role_request_keeps_position() {
        let mut r = RoleSnapshot {
            id: 5,
            name: "mods".into(),
            colour: 0,
            hoist: true,
            position: 5,
            permissions: Permissions::ADMINISTRATOR.bits(),
            mentionable: false,
            icon: None,
            unicode_emoji: None,
        };
        let dbg = format!("{:?}", role_builder(&r, None));
        assert!(dbg.contains("position: Some(5)"), "{dbg}");
        r.position = -1;
        let dbg = format!("{:?}", role_builder(&r, None));
        assert!(dbg.contains("position: Some(0)"), "{dbg}");
    }

    #[test]
    fn audit_codes_map_to_audit_actions() {
        // channel delete, kick, ban, bot add, role delete
        for code in [12u8, 20, 22, 28, 32] {
            assert_eq!(Action::from_value(code).num(), code);
        }
    }

    #[test]
    fn positions_clamp() {
        assert_eq!(position(-3), 0);
        assert_eq!(position(12), 12);
        assert_eq!(position(1 << 40), u16::MAX);
    }
}
