use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use syncing_file_core::config::AppConfig;
use syncing_file_core::download::HttpDownloadHandler;
use syncing_file_core::routes;
use syncing_file_core::services::SyncService;
use syncing_file_core::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(AppConfig::from_env());
    tracing::info!(port = config.port, root_dir = %config.root_dir.display(), "starting syncing file core");

    std::fs::create_dir_all(&config.root_dir)?;

    let cancel = CancellationToken::new();
    let download_handler = Arc::new(HttpDownloadHandler::new(Duration::from_secs(10)));
    let sync_service = SyncService::new(config.clone(), download_handler, cancel.clone());
    sync_service.spawn_auto_forget_janitor();

    let state = Arc::new(AppState::new(sync_service, config.clone()));

    let app = routes::create_router(state.clone()).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    cancel.cancel();
}
