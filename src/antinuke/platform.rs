//! Outbound port to the chat platform.
//!
//! Everything the engine mutates or reads goes through [`Platform`], so the
//! pipeline can run against serenity in production and a mock in tests.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serenity::all::Permissions;
use serenity::async_trait;
use thiserror::Error;

use super::snapshot::{ChannelSnapshot, OverwriteSnapshot, RoleSnapshot, ServerSnapshot};

/// Discord epoch (2015-01-01) in unix ms.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlatformError {
    #[error("rate limited for {retry_after:?} (global: {global})")]
    RateLimited { retry_after: Duration, global: bool },
    #[error("not found")]
    NotFound,
    #[error("missing permissions")]
    Forbidden,
    #[error("unauthorized")]
    Unauthorized,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("transport: {0}")]
    Transport(String),
}

/// One audit trail entry, reduced to what attribution needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub action: u8,
    pub executor_id: Option<u64>,
    pub target_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(id: u64, action: u8, executor_id: Option<u64>, target_id: Option<u64>) -> Self {
        Self {
            id,
            action,
            executor_id,
            target_id,
            created_at: snowflake_time(id),
        }
    }
}

/// Creation time encoded in a snowflake id.
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22) as i64 + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Builds a snowflake for a given instant. Used by tests and mocks.
pub fn snowflake_at(at: DateTime<Utc>, seq: u64) -> u64 {
    let ms = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    (ms << 22) | (seq & 0x3f_ffff)
}

/// What the punisher needs to know about a member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub user_id: u64,
    /// Position of the member's highest role; the guild owner reports `i64::MAX`.
    pub highest_position: i64,
    pub permissions: Permissions,
    pub bot: bool,
}

impl MemberInfo {
    pub fn is_owner(&self) -> bool {
        self.highest_position == i64::MAX
    }
}

/// Fields of the guild's moderation settings that can be patched back.
/// `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub verification_level: Option<u8>,
    pub explicit_content_filter: Option<u8>,
    pub default_message_notifications: Option<u8>,
    pub mfa_level: Option<u8>,
}

impl ServerPatch {
    /// Fields of `wanted` that differ from `current`.
    pub fn diff(current: &ServerSnapshot, wanted: &ServerSnapshot) -> Self {
        fn changed<T: PartialEq + Clone>(cur: &T, want: &T) -> Option<T> {
            (cur != want).then(|| want.clone())
        }
        Self {
            name: changed(&current.name, &wanted.name),
            verification_level: changed(&current.verification_level, &wanted.verification_level),
            explicit_content_filter: changed(
                &current.explicit_content_filter,
                &wanted.explicit_content_filter,
            ),
            default_message_notifications: changed(
                &current.default_message_notifications,
                &wanted.default_message_notifications,
            ),
            mfa_level: changed(&current.mfa_level, &wanted.mfa_level),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[async_trait]
pub trait Platform: Send + Sync {
    /// Id of the account the engine runs as.
    fn current_user_id(&self) -> u64;

    async fn fetch_audit_log(
        &self,
        guild_id: u64,
        action: u8,
        limit: u8,
    ) -> PlatformResult<Vec<AuditEntry>>;

    async fn fetch_member(&self, guild_id: u64, user_id: u64) -> PlatformResult<MemberInfo>;

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;
    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;
    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;

    /// Creates the channel with its overwrites and parent, returns the new id.
    /// A parent that no longer exists is dropped instead of failing the call.
    async fn create_channel(&self, guild_id: u64, channel: &ChannelSnapshot)
    -> PlatformResult<u64>;
    async fn edit_channel(&self, guild_id: u64, channel: &ChannelSnapshot) -> PlatformResult<()>;
    async fn set_channel_parent(
        &self,
        channel_id: u64,
        parent_id: Option<u64>,
    ) -> PlatformResult<()>;
    async fn set_channel_overwrites(
        &self,
        channel_id: u64,
        overwrites: &[OverwriteSnapshot],
    ) -> PlatformResult<()>;
    async fn delete_channel(&self, channel_id: u64) -> PlatformResult<()>;

    /// Creates the role and returns the new id.
    async fn create_role(&self, guild_id: u64, role: &RoleSnapshot) -> PlatformResult<u64>;
    async fn edit_role(&self, guild_id: u64, role: &RoleSnapshot) -> PlatformResult<()>;
    async fn delete_role(&self, guild_id: u64, role_id: u64) -> PlatformResult<()>;

    async fn set_member_roles(
        &self,
        guild_id: u64,
        user_id: u64,
        role_ids: &[u64],
    ) -> PlatformResult<()>;

    async fn fetch_guild_settings(&self, guild_id: u64) -> PlatformResult<ServerSnapshot>;
    async fn edit_guild_settings(&self, guild_id: u64, patch: &ServerPatch) -> PlatformResult<()>;

    async fn send_direct_message(&self, user_id: u64, content: &str) -> PlatformResult<()>;

    /// Short-lived credential allowing vanity code changes.
    async fn exchange_vanity_credential(&self, guild_id: u64) -> PlatformResult<String>;
    async fn set_vanity_code(
        &self,
        guild_id: u64,
        code: &str,
        credential: &str,
    ) -> PlatformResult<()>;
}
