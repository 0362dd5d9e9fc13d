/**
 * LABDASH KERNEL - Process entry point
 *
 * Loads configuration, picks the coordinator backend, performs a first fleet
 * refresh, then runs the scheduler, the refresh loop and the HTTP/WebSocket
 * server until ctrl-c.
 */

use anyhow::{Context, Result};
use labdash_kernel::app::AppState;
use labdash_kernel::config::{load_config, CoordinatorMode, PresetCatalog};
use labdash_kernel::coordinator::{CliCoordinator, Coordinator, MockCoordinator};
use labdash_kernel::http::build_router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().await;
    let coordinator: Arc<dyn Coordinator> = match config.coordinator.mode {
        CoordinatorMode::Cli => Arc::new(
            CliCoordinator::new(
                &config.coordinator.program,
                &config.coordinator.url,
                &config.coordinator.owner_identity(),
            )
            .context("invalid coordinator program")?,
        ),
        CoordinatorMode::Mock => {
            warn!("using the simulated fleet (coordinator.mode = mock)");
            Arc::new(MockCoordinator::demo_fleet())
        }
    };
    info!("coordinator backend: {}", coordinator.kind());

    let catalog = PresetCatalog::load(&config.files.commands_file).await;
    let bind = config.http.bind.clone();
    let app = AppState::build(config, coordinator, catalog);

    let changed = app.refresh_once().await;
    info!("initial refresh: {changed} targets");

    app.scheduler.start();
    let cancel = CancellationToken::new();
    let refresh = app.spawn_refresh_loop(cancel.clone());

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!("listening on http://{bind}");
    axum::serve(listener, build_router(app.clone()))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await
        .context("http server failed")?;

    cancel.cancel();
    refresh.await.ok();
    app.scheduler.stop().await;
    info!("bye");
    Ok(())
}
