use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ActionKind;

/// Permission overwrite on a channel. `kind` 0 = role, 1 = member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverwriteSnapshot {
    pub id: u64,
    pub kind: u8,
    pub allow: u64,
    pub deny: u64,
}

/// Snapshot of a single channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSnapshot {
    pub id: u64,
    pub name: String,
    /// Raw channel type (0 text, 2 voice, 4 category, ...).
    pub kind: u8,
    pub topic: Option<String>,
    pub nsfw: bool,
    pub bitrate: Option<u32>,
    pub user_limit: Option<u32>,
    pub rate_limit_per_user: Option<u16>,
    pub position: i64,
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub permission_overwrites: Vec<OverwriteSnapshot>,
}

impl ChannelSnapshot {
    /// Attributes whose change counts as a `channel_update`.
    pub fn tracked_differs(&self, other: &ChannelSnapshot) -> bool {
        self.name != other.name
            || self.topic != other.topic
            || self.nsfw != other.nsfw
            || self.bitrate != other.bitrate
            || self.user_limit != other.user_limit
            || self.rate_limit_per_user != other.rate_limit_per_user
            || self.parent_id != other.parent_id
            || self.permission_overwrites != other.permission_overwrites
    }
}

/// Snapshot of a single role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleSnapshot {
    pub id: u64,
    pub name: String,
    pub colour: u32,
    pub hoist: bool,
    pub position: i64,
    pub permissions: u64,
    pub mentionable: bool,
    /// Icon hash, re-uploaded from the CDN on restore.
    pub icon: Option<String>,
    pub unicode_emoji: Option<String>,
}

impl RoleSnapshot {
    pub fn tracked_differs(&self, other: &RoleSnapshot) -> bool {
        self.name != other.name
            || self.colour != other.colour
            || self.hoist != other.hoist
            || self.permissions != other.permissions
            || self.mentionable != other.mentionable
            || self.icon != other.icon
            || self.unicode_emoji != other.unicode_emoji
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberSnapshot {
    pub user_id: u64,
    pub role_ids: Vec<u64>,
}

/// Guild-wide moderation settings plus the vanity code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSnapshot {
    pub name: String,
    pub verification_level: u8,
    pub explicit_content_filter: u8,
    pub default_message_notifications: u8,
    pub mfa_level: u8,
    pub vanity_code: Option<String>,
}

impl ServerSnapshot {
    /// True when any setting restored by `server_update` recovery changed.
    pub fn settings_differ(&self, other: &ServerSnapshot) -> bool {
        self.name != other.name
            || self.verification_level != other.verification_level
            || self.explicit_content_filter != other.explicit_content_filter
            || self.default_message_notifications != other.default_message_notifications
            || self.mfa_level != other.mfa_level
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Channel,
    Role,
    Member,
    Server,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Channel => "channel",
            SnapshotKind::Role => "role",
            SnapshotKind::Member => "member",
            SnapshotKind::Server => "server",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EntityAttributes {
    Channel(ChannelSnapshot),
    Role(RoleSnapshot),
    Member(MemberSnapshot),
    Server(ServerSnapshot),
}

impl EntityAttributes {
    pub fn kind(&self) -> SnapshotKind {
        match self {
            EntityAttributes::Channel(_) => SnapshotKind::Channel,
            EntityAttributes::Role(_) => SnapshotKind::Role,
            EntityAttributes::Member(_) => SnapshotKind::Member,
            EntityAttributes::Server(_) => SnapshotKind::Server,
        }
    }
}

/// Pre-mutation state of one entity, keyed by the action that caused the capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    pub guild_id: u64,
    /// Channel/role/user id; the guild id for server snapshots.
    pub entity_id: u64,
    pub cause: ActionKind,
    pub attributes: EntityAttributes,
    pub captured_at: DateTime<Utc>,
}

impl EntitySnapshot {
    pub fn new(guild_id: u64, entity_id: u64, cause: ActionKind, attributes: EntityAttributes) -> Self {
        Self {
            guild_id,
            entity_id,
            cause,
            attributes,
            captured_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> SnapshotKind {
        self.attributes.kind()
    }
}

/// Victim or artifact of an action that has no prior state to capture
/// (banned users, unbanned users, created channels/roles).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetRecord {
    pub guild_id: u64,
    pub executor_id: u64,
    pub cause: ActionKind,
    pub target_id: u64,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelSnapshot {
        ChannelSnapshot {
            id: 1,
            name: "general".into(),
            kind: 0,
            topic: Some("hi".into()),
            nsfw: false,
            bitrate: None,
            user_limit: None,
            rate_limit_per_user: Some(5),
            position: 3,
            parent_id: Some(9),
            permission_overwrites: vec![OverwriteSnapshot {
                id: 1,
                kind: 0,
                allow: 0,
                deny: 1024,
            }],
        }
    }

    #[test]
    fn attributes_are_tagged() {
        let attrs = EntityAttributes::Channel(channel());
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["type"], "channel");
        assert_eq!(json["data"]["name"], "general");
        let back: EntityAttributes = serde_json::from_value(json).unwrap();
        assert_eq!(back, attrs);
        assert_eq!(back.kind(), SnapshotKind::Channel);
    }

    #[test]
    fn position_alone_is_not_a_tracked_change() {
        let a = channel();
        let mut b = channel();
        b.position = 10;
        assert!(!a.tracked_differs(&b));
        b.name = "nuked".into();
        assert!(a.tracked_differs(&b));
    }

    #[test]
    fn vanity_is_not_a_server_setting() {
        let a = ServerSnapshot {
            name: "g".into(),
            verification_level: 1,
            explicit_content_filter: 0,
            default_message_notifications: 0,
            mfa_level: 0,
            vanity_code: Some("home".into()),
        };
        let mut b = a.clone();
        b.vanity_code = Some("stolen".into());
        assert!(!a.settings_differ(&b));
        b.mfa_level = 1;
        assert!(a.settings_differ(&b));
    }
}
