//! Daemon entry point: one process, one agent thread, one HTTP server.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use biovault::agent::{start_agent, Agent};
use biovault::alerts::AlertDispatcher;
use biovault::api::build_router;
use biovault::config::{default_log_filter, Settings, APP_NAME, APP_VERSION};
use biovault::core_state::CoreState;
use biovault::db::{open_database, repository};
use biovault::pipeline::adapter::{HttpExtractionAdapter, HttpStandardizationAdapter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_filter())),
        )
        .init();

    let settings = Settings::from_env();
    info!(version = APP_VERSION, db = %settings.db_path.display(), "{APP_NAME} starting");

    if let Some(dir) = settings.db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::create_dir_all(&settings.upload_dir)?;

    // Open once at startup so migrations run before anything else touches
    // the schema; handlers and the agent reopen per operation.
    let conn = open_database(&settings.db_path)?;
    repository::init_heartbeat(&conn)?;
    drop(conn);

    let extraction = HttpExtractionAdapter::new(&settings)
        .map_err(|e| format!("extraction adapter: {e}"))?;
    let standardization = HttpStandardizationAdapter::new(&settings)
        .map_err(|e| format!("standardization adapter: {e}"))?;
    let dispatcher = AlertDispatcher::from_webhook_url(settings.webhook_url.as_deref());

    let state = Arc::new(CoreState::new(settings.clone()));
    let agent = Agent::new(
        settings.clone(),
        Box::new(extraction),
        Box::new(standardization),
        dispatcher,
    );
    // Joined on drop at the end of main.
    let _agent_handle = start_agent(agent, state.wake_flag());

    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("{APP_NAME} shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
