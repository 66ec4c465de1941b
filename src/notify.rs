//! Alert sink: webhook embeds, or nothing.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use once_cell::sync::OnceCell;
use serde_json::{Value, json};
use serenity::async_trait;
use url::Url;

use crate::antinuke::ActionKind;
use crate::antinuke::platform::PlatformError;
use crate::config::PunishmentMode;
use crate::ratelimit::{CallExecutor, RetryOptions};

const ALERT_COLOUR: u32 = 0x8b5cf6;
const HIERARCHY_COLOUR: u32 = 0xf59e0b;
const RECOVERY_COLOUR: u32 = 0x22c55e;

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    Threshold {
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        count: u64,
        threshold: u32,
    },
    Punished {
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        mode: PunishmentMode,
        reason: String,
    },
    /// Actor sits at or above us in the role hierarchy; a human has to step in.
    Hierarchy {
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        actor_position: i64,
        own_position: i64,
    },
    Recovery {
        guild_id: u64,
        actor_id: u64,
        kind: ActionKind,
        succeeded: usize,
        failed: usize,
    },
}

impl Alert {
    /// Route key used for pacing; one queue per alert type.
    pub fn route(&self) -> &'static str {
        match self {
            Alert::Threshold { .. } => "webhook.threshold",
            Alert::Punished { .. } => "webhook.punishment",
            Alert::Hierarchy { .. } => "webhook.hierarchy",
            Alert::Recovery { .. } => "webhook.recovery",
        }
    }

    pub fn render(&self) -> Value {
        let (title, description, colour) = match self {
            Alert::Threshold {
                guild_id,
                actor_id,
                kind,
                count,
                threshold,
            } => {
                let pct = (*count as f64 / (*threshold).max(1) as f64 * 100.0).round() as u64;
                let exceeded = *count >= *threshold as u64;
                let status = if exceeded {
                    "THRESHOLD EXCEEDED"
                } else {
                    "MONITORING"
                };
                (
                    format!("Anti-Nuke Alert - {status}"),
                    format!(
                        "**Server**: {guild_id}\n**User**: <@{actor_id}> ({actor_id})\n**Action**: {kind}\n**Progress**: {count}/{threshold} ({pct}%)\n**Status**: {}",
                        if exceeded {
                            "ACTION TAKEN"
                        } else {
                            "APPROACHING THRESHOLD"
                        }
                    ),
                    ALERT_COLOUR,
                )
            }
            Alert::Punished {
                guild_id,
                actor_id,
                kind,
                mode,
                reason,
            } => (
                format!("User {}", punishment_word(*mode)),
                format!(
                    "**Server**: {guild_id}\n**User**: <@{actor_id}> ({actor_id})\n**Action**: {kind}\n**Reason**: {reason}"
                ),
                ALERT_COLOUR,
            ),
            Alert::Hierarchy {
                guild_id,
                actor_id,
                kind,
                actor_position,
                own_position,
            } => (
                "Cannot punish: role hierarchy".to_string(),
                format!(
                    "**Server**: {guild_id}\n**User**: <@{actor_id}> ({actor_id})\n**Action**: {kind}\n**Their top role**: {}\n**Our top role**: {own_position}\nManual action required.",
                    if *actor_position == i64::MAX {
                        "owner".to_string()
                    } else {
                        actor_position.to_string()
                    }
                ),
                HIERARCHY_COLOUR,
            ),
            Alert::Recovery {
                guild_id,
                actor_id,
                kind,
                succeeded,
                failed,
            } => (
                "Recovery finished".to_string(),
                format!(
                    "**Server**: {guild_id}\n**User**: <@{actor_id}> ({actor_id})\n**Action**: {kind}\n**Restored**: {succeeded}\n**Failed**: {failed}"
                ),
                RECOVERY_COLOUR,
            ),
        };

        json!({
            "username": "Tigris Antinuke",
            "embeds": [{
                "title": title,
                "description": description,
                "color": colour,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }]
        })
    }
}

pub fn punishment_word(mode: PunishmentMode) -> &'static str {
    match mode {
        PunishmentMode::Ban => "banned",
        PunishmentMode::Kick => "kicked",
        PunishmentMode::None => "detected",
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Sends alerts on a detached task; failures only reach the log.
pub fn fire_and_forget(notifier: &Arc<dyn Notifier>, alert: Alert) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.send(&alert).await {
            tracing::debug!(error=?e, route = alert.route(), "alert not delivered");
        }
    });
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _alert: &Alert) -> Result<()> {
        Ok(())
    }
}

static HTTP: OnceCell<reqwest::Client> = OnceCell::new();

pub(crate) fn http() -> &'static reqwest::Client {
    HTTP.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent("Tigris-Antinuke/1.0")
            .connect_timeout(Duration::from_millis(1500))
            .timeout(Duration::from_millis(5000))
            .build()
            .unwrap_or_default()
    })
}

pub struct WebhookNotifier {
    url: Url,
    executor: Arc<CallExecutor>,
    limiter: DefaultDirectRateLimiter,
    alerts: bool,
}

impl WebhookNotifier {
    /// `alerts = false` keeps punishment/hierarchy messages but drops threshold progress.
    pub fn new(raw_url: &str, executor: Arc<CallExecutor>, alerts: bool) -> Result<Self> {
        let url = Url::parse(raw_url.trim())?;
        if url.scheme() != "https" && url.scheme() != "http" {
            anyhow::bail!("webhook url must be http(s): {url}");
        }
        // Discord allows ~30 webhook messages per minute per webhook
        let quota = Quota::per_minute(NonZeroU32::new(30).unwrap_or(NonZeroU32::MIN));
        Ok(Self {
            url,
            executor,
            limiter: RateLimiter::direct(quota),
            alerts,
        })
    }
}

fn retry_after_from(headers: &reqwest::header::HeaderMap, body: &Value) -> Duration {
    body.get("retry_after")
        .and_then(Value::as_f64)
        .or_else(|| {
            headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
        })
        .map(|s| Duration::from_secs_f64(s.max(0.0)))
        .unwrap_or(Duration::from_secs(1))
}

async fn post_webhook(url: &Url, payload: &Value) -> Result<(), PlatformError> {
    let resp = http()
        .post(url.clone())
        .json(payload)
        .send()
        .await
        .map_err(|e| PlatformError::Transport(e.to_string()))?;

    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        429 => {
            let headers = resp.headers().clone();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let global = body.get("global").and_then(Value::as_bool).unwrap_or(false);
            Err(PlatformError::RateLimited {
                retry_after: retry_after_from(&headers, &body),
                global,
            })
        }
        401 => Err(PlatformError::Unauthorized),
        403 => Err(PlatformError::Forbidden),
        404 => Err(PlatformError::NotFound),
        other => Err(PlatformError::Transport(format!("webhook returned {other}"))),
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        if !self.alerts && matches!(alert, Alert::Threshold { .. }) {
            return Ok(());
        }
        self.limiter.until_ready().await;

        let payload = alert.render();
        self.executor
            .execute(alert.route(), &RetryOptions::with_limit(2), || {
                post_webhook(&self.url, &payload)
            })
            .await?;
        Ok(())
    }
}
