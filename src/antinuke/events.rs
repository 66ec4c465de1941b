use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::platform::AuditEntry;
use super::snapshot::{
    ChannelSnapshot, EntityAttributes, MemberSnapshot, RoleSnapshot, ServerSnapshot,
};
use crate::config::RecoveryConfig;

/// Category of a monitored mutating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Ban,
    Kick,
    Unban,
    ChannelCreate,
    ChannelDelete,
    ChannelUpdate,
    RoleCreate,
    RoleDelete,
    RoleUpdate,
    MemberUpdate,
    ServerUpdate,
    BotAdd,
    VanityChange,
}

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        ActionKind::Ban,
        ActionKind::Kick,
        ActionKind::Unban,
        ActionKind::ChannelCreate,
        ActionKind::ChannelDelete,
        ActionKind::ChannelUpdate,
        ActionKind::RoleCreate,
        ActionKind::RoleDelete,
        ActionKind::RoleUpdate,
        ActionKind::MemberUpdate,
        ActionKind::ServerUpdate,
        ActionKind::BotAdd,
        ActionKind::VanityChange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Ban => "ban",
            ActionKind::Kick => "kick",
            ActionKind::Unban => "unban",
            ActionKind::ChannelCreate => "channel_create",
            ActionKind::ChannelDelete => "channel_delete",
            ActionKind::ChannelUpdate => "channel_update",
            ActionKind::RoleCreate => "role_create",
            ActionKind::RoleDelete => "role_delete",
            ActionKind::RoleUpdate => "role_update",
            ActionKind::MemberUpdate => "member_update",
            ActionKind::ServerUpdate => "server_update",
            ActionKind::BotAdd => "bot_add",
            ActionKind::VanityChange => "vanity_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Audit log action codes that can explain this category.
    pub fn audit_codes(self) -> &'static [u8] {
        match self {
            ActionKind::Ban => &[22],
            ActionKind::Kick => &[20],
            ActionKind::Unban => &[23],
            ActionKind::ChannelCreate => &[10],
            ActionKind::ChannelDelete => &[12],
            // overwrite create/update/delete also surface as channel updates
            ActionKind::ChannelUpdate => &[11, 13, 14, 15],
            ActionKind::RoleCreate => &[30],
            ActionKind::RoleDelete => &[32],
            ActionKind::RoleUpdate => &[31],
            ActionKind::MemberUpdate => &[25],
            ActionKind::ServerUpdate | ActionKind::VanityChange => &[1],
            ActionKind::BotAdd => &[28],
        }
    }

    /// Escalates on the first occurrence, regardless of threshold.
    pub fn forced(self) -> bool {
        matches!(self, ActionKind::BotAdd | ActionKind::VanityChange)
    }

    /// Categories whose victims/artifacts are kept as target records.
    pub fn records_targets(self) -> bool {
        matches!(
            self,
            ActionKind::Ban | ActionKind::Unban | ActionKind::ChannelCreate | ActionKind::RoleCreate
        )
    }

    pub fn recovery_enabled(self, cfg: &RecoveryConfig) -> bool {
        if !cfg.auto_recovery {
            return false;
        }
        match self {
            ActionKind::ChannelCreate | ActionKind::ChannelDelete | ActionKind::ChannelUpdate => {
                cfg.channels
            }
            ActionKind::RoleCreate | ActionKind::RoleDelete | ActionKind::RoleUpdate => cfg.roles,
            ActionKind::MemberUpdate => cfg.members,
            ActionKind::ServerUpdate => cfg.server,
            ActionKind::Ban => cfg.bans,
            ActionKind::Unban => cfg.unbans,
            ActionKind::Kick | ActionKind::BotAdd | ActionKind::VanityChange => false,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound gateway event, already converted from the platform's model.
#[derive(Debug, Clone)]
pub struct GuardEvent {
    pub guild_id: u64,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    ChannelCreated {
        channel: ChannelSnapshot,
    },
    ChannelDeleted {
        channel: ChannelSnapshot,
    },
    ChannelUpdated {
        old: Option<ChannelSnapshot>,
        new: ChannelSnapshot,
    },
    RoleCreated {
        role: RoleSnapshot,
    },
    RoleDeleted {
        role_id: u64,
        role: Option<RoleSnapshot>,
    },
    RoleUpdated {
        old: Option<RoleSnapshot>,
        new: RoleSnapshot,
    },
    MemberAdded {
        user_id: u64,
        bot: bool,
    },
    MemberRemoved {
        user_id: u64,
        bot: bool,
    },
    MemberUpdated {
        user_id: u64,
        old_roles: Option<Vec<u64>>,
        new_roles: Vec<u64>,
    },
    BanAdded {
        user_id: u64,
    },
    BanRemoved {
        user_id: u64,
    },
    GuildUpdated {
        old: Option<ServerSnapshot>,
        new: ServerSnapshot,
    },
    AuditEntryCreated {
        entry: AuditEntry,
    },
}

impl GuardEvent {
    pub fn new(guild_id: u64, payload: EventPayload) -> Self {
        Self { guild_id, payload }
    }

    /// Monitored actions this event represents. A guild update can carry both
    /// a settings change and a vanity change.
    pub fn derive(&self, ignored_roles: &HashSet<u64>) -> Vec<Derived> {
        let gid = self.guild_id;
        match &self.payload {
            EventPayload::ChannelCreated { channel } => {
                vec![Derived::plain(ActionKind::ChannelCreate, channel.id)]
            }
            EventPayload::ChannelDeleted { channel } => vec![Derived::captured(
                ActionKind::ChannelDelete,
                channel.id,
                EntityAttributes::Channel(channel.clone()),
            )],
            EventPayload::ChannelUpdated { old: Some(old), new } if old.tracked_differs(new) => {
                vec![Derived::captured(
                    ActionKind::ChannelUpdate,
                    new.id,
                    EntityAttributes::Channel(old.clone()),
                )]
            }
            EventPayload::ChannelUpdated { .. } => vec![],
            EventPayload::RoleCreated { role } => {
                vec![Derived::plain(ActionKind::RoleCreate, role.id)]
            }
            EventPayload::RoleDeleted { role_id, role } => vec![Derived {
                kind: ActionKind::RoleDelete,
                target_id: *role_id,
                snapshot: role.clone().map(EntityAttributes::Role),
                vanity: None,
            }],
            EventPayload::RoleUpdated { old: Some(old), new } if old.tracked_differs(new) => {
                vec![Derived::captured(
                    ActionKind::RoleUpdate,
                    new.id,
                    EntityAttributes::Role(old.clone()),
                )]
            }
            EventPayload::RoleUpdated { .. } => vec![],
            EventPayload::MemberAdded { user_id, bot: true } => {
                vec![Derived::plain(ActionKind::BotAdd, *user_id)]
            }
            EventPayload::MemberAdded { .. } => vec![],
            EventPayload::MemberRemoved { bot: true, .. } => vec![],
            EventPayload::MemberRemoved { user_id, .. } => {
                vec![Derived::plain(ActionKind::Kick, *user_id)]
            }
            EventPayload::MemberUpdated {
                user_id,
                old_roles: Some(old_roles),
                new_roles,
            } => {
                let changed = old_roles
                    .iter()
                    .filter(|r| !new_roles.contains(r))
                    .chain(new_roles.iter().filter(|r| !old_roles.contains(r)))
                    .any(|r| !ignored_roles.contains(r));
                if !changed {
                    return vec![];
                }
                vec![Derived::captured(
                    ActionKind::MemberUpdate,
                    *user_id,
                    EntityAttributes::Member(MemberSnapshot {
                        user_id: *user_id,
                        role_ids: old_roles.clone(),
                    }),
                )]
            }
            EventPayload::MemberUpdated { .. } => vec![],
            EventPayload::BanAdded { user_id } => vec![Derived::plain(ActionKind::Ban, *user_id)],
            EventPayload::BanRemoved { user_id } => {
                vec![Derived::plain(ActionKind::Unban, *user_id)]
            }
            EventPayload::GuildUpdated { old: Some(old), new } => {
                let mut out = Vec::new();
                if old.settings_differ(new) {
                    out.push(Derived::captured(
                        ActionKind::ServerUpdate,
                        gid,
                        EntityAttributes::Server(old.clone()),
                    ));
                }
                if old.vanity_code != new.vanity_code {
                    out.push(Derived {
                        kind: ActionKind::VanityChange,
                        target_id: gid,
                        snapshot: None,
                        vanity: Some(VanityChange {
                            old: old.vanity_code.clone(),
                            new: new.vanity_code.clone(),
                        }),
                    });
                }
                out
            }
            EventPayload::GuildUpdated { old: None, .. } => vec![],
            EventPayload::AuditEntryCreated { .. } => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VanityChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// One monitored action derived from an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub kind: ActionKind,
    pub target_id: u64,
    /// Pre-mutation state, captured before the action is counted.
    pub snapshot: Option<EntityAttributes>,
    pub vanity: Option<VanityChange>,
}

impl Derived {
    fn plain(kind: ActionKind, target_id: u64) -> Self {
        Self {
            kind,
            target_id,
            snapshot: None,
            vanity: None,
        }
    }

    fn captured(kind: ActionKind, target_id: u64, snapshot: EntityAttributes) -> Self {
        Self {
            kind,
            target_id,
            snapshot: Some(snapshot),
            vanity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, vanity: Option<&str>) -> ServerSnapshot {
        ServerSnapshot {
            name: name.into(),
            verification_level: 1,
            explicit_content_filter: 0,
            default_message_notifications: 0,
            mfa_level: 0,
            vanity_code: vanity.map(str::to_string),
        }
    }

    #[test]
    fn kinds_roundtrip_through_strings() {
        for k in ActionKind::ALL {
            assert_eq!(ActionKind::parse(k.as_str()), Some(k));
            let json = serde_json::to_string(&k).unwrap();
            assert_eq!(json, format!("\"{}\"", k.as_str()));
        }
        assert_eq!(ActionKind::parse("nope"), None);
    }

    #[test]
    fn recovery_respects_master_switch() {
        let mut cfg = RecoveryConfig::default();
        assert!(ActionKind::ChannelDelete.recovery_enabled(&cfg));
        assert!(!ActionKind::Kick.recovery_enabled(&cfg));
        cfg.auto_recovery = false;
        assert!(!ActionKind::ChannelDelete.recovery_enabled(&cfg));
    }

    #[test]
    fn member_update_ignores_configured_roles() {
        let ignored: HashSet<u64> = [77].into_iter().collect();
        let ev = GuardEvent::new(
            1,
            EventPayload::MemberUpdated {
                user_id: 5,
                old_roles: Some(vec![10]),
                new_roles: vec![10, 77],
            },
        );
        assert!(ev.derive(&ignored).is_empty());

        let ev = GuardEvent::new(
            1,
            EventPayload::MemberUpdated {
                user_id: 5,
                old_roles: Some(vec![10]),
                new_roles: vec![10, 78],
            },
        );
        let d = ev.derive(&ignored);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].kind, ActionKind::MemberUpdate);
        assert_eq!(
            d[0].snapshot,
            Some(EntityAttributes::Member(MemberSnapshot {
                user_id: 5,
                role_ids: vec![10]
            }))
        );
    }

    #[test]
    fn guild_update_can_yield_two_actions() {
        let ev = GuardEvent::new(
            1,
            EventPayload::GuildUpdated {
                old: Some(server("home", Some("home"))),
                new: server("nuked", Some("stolen")),
            },
        );
        let kinds: Vec<_> = ev.derive(&HashSet::new()).into_iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![ActionKind::ServerUpdate, ActionKind::VanityChange]);
    }

    #[test]
    fn bots_leaving_are_ignored() {
        let ev = GuardEvent::new(1, EventPayload::MemberRemoved { user_id: 3, bot: true });
        assert!(ev.derive(&HashSet::new()).is_empty());
        let ev = GuardEvent::new(1, EventPayload::MemberAdded { user_id: 3, bot: true });
        assert_eq!(ev.derive(&HashSet::new())[0].kind, ActionKind::BotAdd);
    }
}
