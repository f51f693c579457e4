use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use lodestone_agent::{
    config::AgentConfig,
    engine::{self, Engine, StartOutcome},
    gateway::{self, GatewayState},
    lists,
    monitor::UsageMonitor,
    session::{self, ScreenSession, SessionDriver},
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "lodestone.log";

/// Stdout by default; a daily rolling file under `LODESTONE_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = std::env::var("LODESTONE_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty());
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested; the game server keeps running in its session");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = AgentConfig::from_env()?;
    tracing::info!(
        server_dir = %config.server_dir.display(),
        session = %config.session_name,
        history_file = %config.history_file.display(),
        "lodestone starting"
    );

    let driver: Arc<dyn SessionDriver> = Arc::new(ScreenSession::new(config.session_name.clone()));
    let engine = Engine::new(config.clone(), driver.clone()).await?;
    let (handle, _engine_task) = engine.spawn();

    let (list_tx, list_rx) = mpsc::unbounded_channel();
    let _watcher = match lists::watch(&config.server_dir, list_tx) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "list watcher unavailable; lists refresh only after admin commands");
            None
        }
    };
    lists::spawn_debouncer(config.list_debounce, list_rx, {
        let handle = handle.clone();
        move |kind| handle.refresh_list(kind)
    });

    let found = session::probe(driver.as_ref(), config.probe_timeout).await;
    handle.report_probe(found);
    if !found && config.auto_start {
        tracing::info!("no server session found; auto-starting");
        let handle = handle.clone();
        tokio::spawn(async move {
            match handle.start().await {
                StartOutcome::Failed(reason) => tracing::error!(error = %reason, "auto-start failed"),
                outcome => tracing::info!(?outcome, "auto-start requested"),
            }
        });
    }
    let _timers = engine::spawn_timers(handle.clone(), driver.clone());

    let monitor = UsageMonitor::new(config.usage_interval, handle.events());
    let app = gateway::router(GatewayState {
        engine: handle,
        monitor,
    });

    let addr = config.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "lodestone gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
