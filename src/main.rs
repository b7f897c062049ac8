use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vx_academy::{
    config::{get_config, init_config},
    database::pool::{create_pool, run_migrations},
    routes, AppState,
};

const EXPIRY_SWEEP_SCHEDULE: &str = "0 * * * * *";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vx_academy=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    init_config()?;
    let config = get_config();
    info!("Starting VX Academy v{}", env!("CARGO_PKG_VERSION"));

    let pool = create_pool().await?;
    run_migrations(&pool).await?;

    let app_state = AppState::new(pool);

    match app_state.attempt_service.restore_countdowns().await {
        Ok(n) => info!(restored = n, "assessment countdowns restored"),
        Err(e) => tracing::error!(error = ?e, "failed to restore assessment countdowns"),
    }

    {
        let state = app_state.clone();
        tokio::spawn(async move {
            loop {
                match state.notification_service.run_once().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tokio::time::sleep(Duration::from_millis(1000)).await;
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Webhook worker error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("scheduler init failed: {:?}", e))?;
    {
        let state = app_state.clone();
        let sweep = Job::new_async(EXPIRY_SWEEP_SCHEDULE, move |_id, _lock| {
            let state = state.clone();
            Box::pin(async move {
                match state.attempt_service.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(finalized = n, "expired attempts finalized"),
                    Err(e) => tracing::error!(error = ?e, "Expiry sweep error"),
                }
                if let Err(e) = state.notification_service.reclaim_stale().await {
                    tracing::error!(error = ?e, "Webhook reclaim error");
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("invalid sweep schedule: {:?}", e))?;
        scheduler
            .add(sweep)
            .await
            .map_err(|e| anyhow::anyhow!("failed to add sweep job: {:?}", e))?;
    }
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("scheduler start failed: {:?}", e))?;

    info!("Serving uploads from: {}", config.uploads_dir);
    let app = routes::router(app_state, config);

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
