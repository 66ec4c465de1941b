// src/lib.rs

pub mod antinuke;
pub mod config;
pub mod credentials;
pub mod db;
pub mod discord;
pub mod logging;
pub mod notify;
pub mod ratelimit;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;

use antinuke::exemptions::Exemptions;
use antinuke::platform::Platform;
use antinuke::{Antinuke, GuardCtx};
use config::Settings;
use db::{Db, GuardStore, PgStore};
use notify::{NoopNotifier, Notifier, WebhookNotifier};
use ratelimit::CallExecutor;

use serenity::all::GatewayIntents;

/// Application-wide context.
/// DB, settings, the shared call executor and the antinuke engine (after `ready`).
pub struct AppContext {
    pub settings: Settings,
    pub db: Db,
    pub store: Arc<dyn GuardStore>,
    pub executor: Arc<CallExecutor>,
    pub notifier: Arc<dyn Notifier>,
    pub exemptions: Arc<Exemptions>,
    antinuke: OnceCell<Arc<Antinuke>>,
}

impl AppContext {
    /// Bootstraps the application:
    /// - logging
    /// - DB connection + migrations
    /// - executor, webhook and whitelist; the engine itself is built on `ready`
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        // 1) logging
        logging::init(&settings);

        // 2) DB
        let db = db::connect(
            &settings.database.url,
            settings.database.max_connections,
            settings.database.statement_timeout_ms,
        )
        .await?;
        db::migrate(&db).await?;

        // 3) services
        let executor = CallExecutor::new();
        CallExecutor::spawn_prune_task(&executor, std::time::Duration::from_secs(300));
        let notifier: Arc<dyn Notifier> = match settings.notify.webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(WebhookNotifier::new(
                url,
                executor.clone(),
                settings.notify.alerts,
            )?),
            _ => {
                tracing::warn!("no alert webhook configured, alerts go to the log only");
                Arc::new(NoopNotifier)
            }
        };
        let exemptions = Arc::new(Exemptions::from_config(&settings.whitelist));
        let store: Arc<dyn GuardStore> = Arc::new(PgStore::new(db.clone()));

        Ok(Arc::new(Self {
            settings,
            db,
            store,
            executor,
            notifier,
            exemptions,
            antinuke: OnceCell::new(),
        }))
    }

    /// Builds the engine on first call. Returns it only when this call built it.
    pub fn init_antinuke(&self, platform: Arc<dyn Platform>) -> Option<Arc<Antinuke>> {
        if self.antinuke.get().is_some() {
            return None;
        }
        let engine = Antinuke::new(GuardCtx {
            config: self.settings.antinuke.clone(),
            vanity: self.settings.vanity.clone(),
            owner_dm: self.settings.notify.owner_dm,
            platform,
            executor: self.executor.clone(),
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            exemptions: self.exemptions.clone(),
        });
        // set() succeeds once
        self.antinuke.set(engine.clone()).ok()?;
        Some(engine)
    }

    /// The engine, once `ready` has arrived.
    pub fn antinuke(&self) -> Option<Arc<Antinuke>> {
        self.antinuke.get().cloned()
    }
}

/// Intents the engine cannot see events without:
/// - GUILDS (channels, roles, guild settings),
/// - GUILD_MEMBERS (joins/leaves, role changes),
/// - GUILD_MODERATION (bans + audit log entries).
pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS | GatewayIntents::GUILD_MEMBERS | GatewayIntents::GUILD_MODERATION
}

/// Starts the Discord client.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
