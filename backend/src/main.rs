// Santa draw server entry point.
//
// Startup: tracing, config, storage tiers, session restore, save queue,
// engine, HTTP/WebSocket server. On Ctrl+C the server drains and the last
// session change is flushed to storage.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use santa_backend::config::{self, StorageConfig};
use santa_backend::engine::{DrawEngine, EngineSettings};
use santa_backend::message::TemplateProvider;
use santa_backend::persist::{JsonFileStore, SaveQueue, SqliteStore, StorageBackend, TieredStore};
use santa_backend::{app, restore_session, AppState};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config =
        config::load_config(config_path.as_deref()).context("failed to load configuration")?;

    let store = Arc::new(open_storage(&config.storage));
    info!(tiers = ?store.tier_names(), "storage ready");

    let session = restore_session(&store, &config.roster)
        .await
        .context("failed to restore session")?;
    info!(
        stage = ?session.stage(),
        participants = session.store().participants().len(),
        remaining = session.store().remaining_participants().len(),
        "session loaded"
    );

    let (saves, save_task) = SaveQueue::spawn(store, config.storage.debounce());
    let provider = Arc::new(TemplateProvider::new(
        std::time::Duration::from_millis(config.messages.delay_ms),
        config.draw.seed,
    ));
    let engine = DrawEngine::new(session, provider, saves, EngineSettings::from(&config.draw));
    let state = AppState::new(engine.clone(), config.server.admin_password.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!("listening on {}", config.server.bind);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Err(e) = engine.flush().await {
        error!("final save failed: {e}");
    }
    drop(engine);
    save_task.abort();

    info!("santa server shut down cleanly");
    Ok(())
}

fn open_storage(config: &StorageConfig) -> TieredStore {
    let mut tiers: Vec<Box<dyn StorageBackend>> = Vec::new();
    if config.sqlite_path.is_empty() {
        info!("sqlite tier disabled");
    } else {
        match SqliteStore::open(&config.sqlite_path) {
            Ok(sqlite) => tiers.push(Box::new(sqlite)),
            Err(e) => warn!("sqlite tier unavailable at {}: {e}", config.sqlite_path),
        }
    }
    tiers.push(Box::new(JsonFileStore::new(config.json_path.clone())));
    TieredStore::new(tiers)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("santa_backend=info,draw_core=info,warn")),
        )
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(())
}
