use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get};
use serde_json::json;
use tokio::net::TcpListener;

use super::Antinuke;

pub fn router(engine: Arc<Antinuke>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(engine)
}

async fn health(State(engine): State<Arc<Antinuke>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "guild": engine.protected_guild().to_string(),
        "operations": engine.operations().len(),
    }))
}

async fn stats(State(engine): State<Arc<Antinuke>>) -> Response {
    match engine.stats().await {
        Ok(s) => Json(s).into_response(),
        Err(e) => {
            tracing::warn!(error = ?e, "stats unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Binds `addr` and serves until the process exits.
pub async fn serve(listener: TcpListener, engine: Arc<Antinuke>) -> Result<()> {
    axum::serve(listener, router(engine))
        .await
        .context("status api stopped")
}

/// Binds in the foreground so a bad address fails startup, then serves in the background.
pub async fn spawn(addr: &str, engine: Arc<Antinuke>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding status api on {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "status api listening");
    tokio::spawn(async move {
        if let Err(e) = serve(listener, engine).await {
            tracing::error!(error = ?e, "status api failed");
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antinuke::GuardCtx;
    use crate::antinuke::exemptions::Exemptions;
    use crate::config::Settings;
    use crate::db::MemoryStore;
    use crate::notify::NoopNotifier;
    use crate::ratelimit::CallExecutor;
    use crate::testing::MockPlatform;

    #[tokio::test]
    async fn health_and_stats() {
        let s = Settings::for_tests(42);
        let engine = Antinuke::new(GuardCtx {
            config: s.antinuke,
            vanity: s.vanity,
            owner_dm: false,
            platform: MockPlatform::new(100),
            executor: CallExecutor::new(),
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(NoopNotifier),
            exemptions: Arc::new(Exemptions::default()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, engine));

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["guild"], "42");

        let stats: serde_json::Value = reqwest::get(format!("http://{addr}/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["protected_guild"], 42);
        assert_eq!(stats["events"], 0);
        assert!(stats["executor"]["global_limited"].is_boolean());
    }
}
