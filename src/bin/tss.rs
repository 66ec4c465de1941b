use anyhow::Result;
use std::sync::Arc;
use tigris_antinuke::{AppContext, config::Settings, run};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    let ctx: Arc<AppContext> = AppContext::bootstrap(settings).await?;
    tracing::info!(
        guild = ctx.settings.antinuke.protected_guild,
        env = %ctx.settings.env,
        "tigris antinuke starting"
    );
    run(ctx).await
}
