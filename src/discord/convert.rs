//! serenity models -> engine snapshots.

use std::collections::HashMap;

use serenity::all::{
    AuditLogEntry, Guild, GuildChannel, PartialGuild, PermissionOverwrite, PermissionOverwriteType,
    Permissions, Role, RoleId,
};

use crate::antinuke::platform::{AuditEntry, MemberInfo};
use crate::antinuke::snapshot::{ChannelSnapshot, OverwriteSnapshot, RoleSnapshot, ServerSnapshot};

pub fn overwrite(o: &PermissionOverwrite) -> Option<OverwriteSnapshot> {
    let (id, kind) = match o.kind {
        PermissionOverwriteType::Role(r) => (r.get(), 0),
        PermissionOverwriteType::Member(u) => (u.get(), 1),
        // newer overwrite kinds are skipped
        _ => return None,
    };
    Some(OverwriteSnapshot {
        id,
        kind,
        allow: o.allow.bits(),
        deny: o.deny.bits(),
    })
}

pub fn channel(c: &GuildChannel) -> ChannelSnapshot {
    ChannelSnapshot {
        id: c.id.get(),
        name: c.name.clone(),
        kind: u8::from(c.kind),
        topic: c.topic.clone(),
        nsfw: c.nsfw,
        bitrate: c.bitrate,
        user_limit: c.user_limit,
        rate_limit_per_user: c.rate_limit_per_user,
        position: i64::from(c.position),
        parent_id: c.parent_id.map(|p| p.get()),
        permission_overwrites: c.permission_overwrites.iter().filter_map(overwrite).collect(),
    }
}

pub fn role(r: &Role) -> RoleSnapshot {
    RoleSnapshot {
        id: r.id.get(),
        name: r.name.clone(),
        colour: r.colour.0,
        hoist: r.hoist,
        position: i64::from(r.position),
        permissions: r.permissions.bits(),
        mentionable: r.mentionable,
        icon: r.icon.as_ref().map(|h| h.to_string()),
        unicode_emoji: r.unicode_emoji.clone(),
    }
}

pub fn server_from_guild(g: &Guild) -> ServerSnapshot {
    ServerSnapshot {
        name: g.name.clone(),
        verification_level: u8::from(g.verification_level),
        explicit_content_filter: u8::from(g.explicit_content_filter),
        default_message_notifications: u8::from(g.default_message_notifications),
        mfa_level: u8::from(g.mfa_level),
        vanity_code: g.vanity_url_code.clone(),
    }
}

pub fn server_from_partial(g: &PartialGuild) -> ServerSnapshot {
    ServerSnapshot {
        name: g.name.clone(),
        verification_level: u8::from(g.verification_level),
        explicit_content_filter: u8::from(g.explicit_content_filter),
        default_message_notifications: u8::from(g.default_message_notifications),
        mfa_level: u8::from(g.mfa_level),
        vanity_code: g.vanity_url_code.clone(),
    }
}

pub fn audit_entry(e: &AuditLogEntry) -> AuditEntry {
    AuditEntry::new(
        e.id.get(),
        e.action.num(),
        Some(e.user_id.get()),
        e.target_id.map(|t| t.get()),
    )
}

/// Role data needed to rank a member: (position, permissions) per role id.
pub fn role_table(roles: &HashMap<RoleId, Role>) -> HashMap<u64, (i64, Permissions)> {
    roles
        .iter()
        .map(|(id, r)| (id.get(), (i64::from(r.position), r.permissions)))
        .collect()
}

/// Highest role position and effective guild permissions. The owner ranks
/// above everyone; administrators hold every permission.
pub fn rank(
    guild_id: u64,
    owner_id: u64,
    user_id: u64,
    bot: bool,
    member_roles: &[u64],
    roles: &HashMap<u64, (i64, Permissions)>,
) -> MemberInfo {
    if user_id == owner_id {
        return MemberInfo {
            user_id,
            highest_position: i64::MAX,
            permissions: Permissions::all(),
            bot,
        };
    }

    // @everyone ma id gildii
    let mut permissions = roles
        .get(&guild_id)
        .map(|(_, p)| *p)
        .unwrap_or_else(Permissions::empty);
    let mut highest_position = 0;
    for (pos, perms) in member_roles.iter().filter_map(|r| roles.get(r)) {
        permissions |= *perms;
        highest_position = highest_position.max(*pos);
    }
    if permissions.contains(Permissions::ADMINISTRATOR) {
        permissions = Permissions::all();
    }

    MemberInfo {
        user_id,
        highest_position,
        permissions,
        bot,
    }
}
