use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use qr_access_api::app::{create_app, AppState};
use qr_access_api::config::Config;
use qr_access_api::jobs::{
    AnchorRetryJob, AttendanceBackfillJob, JobScheduler, PoolMetricsJob, ScanAttemptRetentionJob,
};
use qr_access_api::middleware::{init_logging, init_metrics};

const JOB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    init_logging(&config.logging);
    init_metrics().context("failed to install metrics recorder")?;

    info!("Starting QR access API v{}", env!("CARGO_PKG_VERSION"));

    let pool = persistence::db::create_pool(&(&config.database).into())
        .await
        .context("failed to connect to database")?;

    info!("Running database migrations");
    persistence::db::run_migrations(&pool).await?;

    let addr = config.socket_addr().context("invalid server address")?;
    let jobs_config = config.jobs.clone();
    let retention_days = config.access_codes.attempt_retention_days;

    let state = AppState::new(config, pool.clone()).context("failed to build anchor client")?;

    let mut scheduler = JobScheduler::new();
    if jobs_config.enabled {
        scheduler.register(AnchorRetryJob::new(
            state.access.clone(),
            jobs_config.anchor_batch_size,
        ));
        scheduler.register(AttendanceBackfillJob::new(
            state.access.clone(),
            jobs_config.attendance_batch_size,
        ));
        scheduler.register(ScanAttemptRetentionJob::new(
            state.access.clone(),
            retention_days,
        ));
        scheduler.register(PoolMetricsJob::new(pool, Arc::clone(&state.rate_limiter)));
        scheduler.start();
    }

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    scheduler.wait_for_shutdown(JOB_SHUTDOWN_TIMEOUT).await;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("Failed to listen for SIGTERM: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
