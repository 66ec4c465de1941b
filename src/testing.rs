//! In-memory `Platform` and alert recorder for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::Utc;
use serenity::all::Permissions;
use serenity::async_trait;

use crate::antinuke::platform::{
    AuditEntry, MemberInfo, Platform, PlatformError, PlatformResult, ServerPatch, snowflake_at,
};
use crate::antinuke::snapshot::{ChannelSnapshot, OverwriteSnapshot, RoleSnapshot, ServerSnapshot};
use crate::notify::{Alert, Notifier};

/// Mutating call observed by the mock, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Ban(u64),
    Unban(u64),
    Kick(u64),
    CreateChannel(String),
    EditChannel(u64),
    SetChannelParent(u64, Option<u64>),
    SetChannelOverwrites(u64, usize),
    DeleteChannel(u64),
    CreateRole(String),
    EditRole(u64),
    DeleteRole(u64),
    SetMemberRoles(u64, Vec<u64>),
    EditGuild(ServerPatch),
    DirectMessage(u64),
    ExchangeVanityCredential,
    SetVanityCode(String, String),
}

#[derive(Default)]
pub struct MockState {
    pub audit: Vec<(u64, AuditEntry)>,
    pub members: HashMap<u64, MemberInfo>,
    pub channels: HashMap<u64, ChannelSnapshot>,
    pub roles: HashMap<u64, RoleSnapshot>,
    pub member_roles: HashMap<u64, Vec<u64>>,
    pub server: Option<ServerSnapshot>,
    pub bans: HashSet<u64>,
    pub calls: Vec<Call>,
    /// op name -> (error, remaining failures; None = forever)
    pub failures: HashMap<&'static str, (PlatformError, Option<usize>)>,
    pub credentials_issued: usize,
    next_id: u64,
    seq: u64,
}

pub struct MockPlatform {
    self_id: u64,
    state: Mutex<MockState>,
}

impl MockPlatform {
    /// Mock whose own account is a member with administrator and position 10.
    pub fn new(self_id: u64) -> Arc<Self> {
        let p = Self {
            self_id,
            state: Mutex::new(MockState {
                next_id: 900_000,
                ..MockState::default()
            }),
        };
        p.add_member(self_id, 10, Permissions::ADMINISTRATOR);
        Arc::new(p)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_member(&self, user_id: u64, highest_position: i64, permissions: Permissions) {
        self.state().members.insert(
            user_id,
            MemberInfo {
                user_id,
                highest_position,
                permissions,
                bot: false,
            },
        );
    }

    pub fn push_audit(&self, guild_id: u64, action: u8, executor: Option<u64>, target: u64) {
        self.push_audit_aged(guild_id, action, executor, target, chrono::Duration::zero());
    }

    pub fn push_audit_aged(
        &self,
        guild_id: u64,
        action: u8,
        executor: Option<u64>,
        target: u64,
        age: chrono::Duration,
    ) {
        let mut s = self.state();
        s.seq += 1;
        let id = snowflake_at(Utc::now() - age, s.seq);
        s.audit
            .push((guild_id, AuditEntry::new(id, action, executor, Some(target))));
    }

    pub fn fail_always(&self, op: &'static str, err: PlatformError) {
        self.state().failures.insert(op, (err, None));
    }

    pub fn fail_times(&self, op: &'static str, err: PlatformError, times: usize) {
        self.state().failures.insert(op, (err, Some(times)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    fn check(&self, op: &'static str) -> PlatformResult<()> {
        let mut s = self.state();
        let (err, remaining) = match s.failures.get(op) {
            Some((e, r)) => (e.clone(), *r),
            None => return Ok(()),
        };
        match remaining {
            None => Err(err),
            Some(0) => {
                s.failures.remove(op);
                Ok(())
            }
            Some(1) => {
                s.failures.remove(op);
                Err(err)
            }
            Some(n) => {
                s.failures.insert(op, (err.clone(), Some(n - 1)));
                Err(err)
            }
        }
    }

    fn log(&self, call: Call) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn current_user_id(&self) -> u64 {
        self.self_id
    }

    async fn fetch_audit_log(
        &self,
        guild_id: u64,
        action: u8,
        limit: u8,
    ) -> PlatformResult<Vec<AuditEntry>> {
        self.check("fetch_audit_log")?;
        let s = self.state();
        let mut out: Vec<AuditEntry> = s
            .audit
            .iter()
            .filter(|(g, e)| *g == guild_id && e.action == action)
            .map(|(_, e)| e.clone())
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn fetch_member(&self, _guild_id: u64, user_id: u64) -> PlatformResult<MemberInfo> {
        self.check("fetch_member")?;
        self.state()
            .members
            .get(&user_id)
            .cloned()
            .ok_or(PlatformError::NotFound)
    }

    async fn ban(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.check("ban")?;
        self.log(Call::Ban(user_id));
        let mut s = self.state();
        s.bans.insert(user_id);
        s.members.remove(&user_id);
        Ok(())
    }

    async fn unban(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.check("unban")?;
        self.log(Call::Unban(user_id));
        self.state().bans.remove(&user_id);
        Ok(())
    }

    async fn kick(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.check("kick")?;
        self.log(Call::Kick(user_id));
        self.state().members.remove(&user_id);
        Ok(())
    }

    async fn create_channel(
        &self,
        _guild_id: u64,
        channel: &ChannelSnapshot,
    ) -> PlatformResult<u64> {
        self.check("create_channel")?;
        self.log(Call::CreateChannel(channel.name.clone()));
        let mut s = self.state();
        s.next_id += 1;
        let id = s.next_id;
        let mut created = channel.clone();
        created.id = id;
        // unknown parents are dropped, like the real endpoint fallback
        if created.parent_id.is_some_and(|p| !s.channels.contains_key(&p)) {
            created.parent_id = None;
        }
        s.channels.insert(id, created);
        Ok(id)
    }

    async fn edit_channel(&self, _guild_id: u64, channel: &ChannelSnapshot) -> PlatformResult<()> {
        self.check("edit_channel")?;
        self.log(Call::EditChannel(channel.id));
        self.state().channels.insert(channel.id, channel.clone());
        Ok(())
    }

    async fn set_channel_parent(
        &self,
        channel_id: u64,
        parent_id: Option<u64>,
    ) -> PlatformResult<()> {
        self.check("set_channel_parent")?;
        self.log(Call::SetChannelParent(channel_id, parent_id));
        if let Some(c) = self.state().channels.get_mut(&channel_id) {
            c.parent_id = parent_id;
        }
        Ok(())
    }

    async fn set_channel_overwrites(
        &self,
        channel_id: u64,
        overwrites: &[OverwriteSnapshot],
    ) -> PlatformResult<()> {
        self.check("set_channel_overwrites")?;
        self.log(Call::SetChannelOverwrites(channel_id, overwrites.len()));
        if let Some(c) = self.state().channels.get_mut(&channel_id) {
            c.permission_overwrites = overwrites.to_vec();
        }
        Ok(())
    }

    async fn delete_channel(&self, channel_id: u64) -> PlatformResult<()> {
        self.check("delete_channel")?;
        self.log(Call::DeleteChannel(channel_id));
        self.state()
            .channels
            .remove(&channel_id)
            .map(|_| ())
            .ok_or(PlatformError::NotFound)
    }

    async fn create_role(&self, _guild_id: u64, role: &RoleSnapshot) -> PlatformResult<u64> {
        self.check("create_role")?;
        self.log(Call::CreateRole(role.name.clone()));
        let mut s = self.state();
        s.next_id += 1;
        let id = s.next_id;
        let mut created = role.clone();
        created.id = id;
        s.roles.insert(id, created);
        Ok(id)
    }

    async fn edit_role(&self, _guild_id: u64, role: &RoleSnapshot) -> PlatformResult<()> {
        self.check("edit_role")?;
        self.log(Call::EditRole(role.id));
        self.state().roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn delete_role(&self, _guild_id: u64, role_id: u64) -> PlatformResult<()> {
        self.check("delete_role")?;
        self.log(Call::DeleteRole(role_id));
        self.state()
            .roles
            .remove(&role_id)
            .map(|_| ())
            .ok_or(PlatformError::NotFound)
    }

    async fn set_member_roles(
        &self,
        _guild_id: u64,
        user_id: u64,
        role_ids: &[u64],
    ) -> PlatformResult<()> {
        self.check("set_member_roles")?;
        self.log(Call::SetMemberRoles(user_id, role_ids.to_vec()));
        self.state().member_roles.insert(user_id, role_ids.to_vec());
        Ok(())
    }

    async fn fetch_guild_settings(&self, _guild_id: u64) -> PlatformResult<ServerSnapshot> {
        self.check("fetch_guild_settings")?;
        self.state().server.clone().ok_or(PlatformError::NotFound)
    }

    async fn edit_guild_settings(&self, _guild_id: u64, patch: &ServerPatch) -> PlatformResult<()> {
        self.check("edit_guild_settings")?;
        self.log(Call::EditGuild(patch.clone()));
        let mut s = self.state();
        if let Some(srv) = s.server.as_mut() {
            if let Some(n) = &patch.name {
                srv.name = n.clone();
            }
            if let Some(v) = patch.verification_level {
                srv.verification_level = v;
            }
            if let Some(v) = patch.explicit_content_filter {
                srv.explicit_content_filter = v;
            }
            if let Some(v) = patch.default_message_notifications {
                srv.default_message_notifications = v;
            }
            if let Some(v) = patch.mfa_level {
                srv.mfa_level = v;
            }
        }
        Ok(())
    }

    async fn send_direct_message(&self, user_id: u64, _content: &str) -> PlatformResult<()> {
        self.check("send_direct_message")?;
        self.log(Call::DirectMessage(user_id));
        Ok(())
    }

    async fn exchange_vanity_credential(&self, _guild_id: u64) -> PlatformResult<String> {
        self.check("exchange_vanity_credential")?;
        self.log(Call::ExchangeVanityCredential);
        let mut s = self.state();
        s.credentials_issued += 1;
        Ok(format!("cred-{}", s.credentials_issued))
    }

    async fn set_vanity_code(
        &self,
        _guild_id: u64,
        code: &str,
        credential: &str,
    ) -> PlatformResult<()> {
        self.check("set_vanity_code")?;
        self.log(Call::SetVanityCode(code.to_string(), credential.to_string()));
        if let Some(srv) = self.state().server.as_mut() {
            srv.vanity_code = Some(code.to_string());
        }
        Ok(())
    }
}

/// Plain text channel with no overwrites.
pub fn text_channel(id: u64, name: &str, parent_id: Option<u64>) -> ChannelSnapshot {
    ChannelSnapshot {
        id,
        name: name.to_string(),
        kind: 0,
        topic: None,
        nsfw: false,
        bitrate: None,
        user_limit: None,
        rate_limit_per_user: None,
        position: 0,
        parent_id,
        permission_overwrites: vec![],
    }
}

pub fn category(id: u64, name: &str) -> ChannelSnapshot {
    ChannelSnapshot {
        kind: 4,
        ..text_channel(id, name, None)
    }
}

pub fn role(id: u64, name: &str, position: i64) -> RoleSnapshot {
    RoleSnapshot {
        id,
        name: name.to_string(),
        colour: 0,
        hoist: false,
        position,
        permissions: 0,
        mentionable: false,
        icon: None,
        unicode_emoji: None,
    }
}

/// Keeps every alert it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}
