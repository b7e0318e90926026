mod state;

use anyhow::Context;
use mycelix_config::ConfigManager;
use state::AppState;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_manager = ConfigManager::new().context("initialize config manager")?;
    let config = config_manager.load().context("load app config")?;
    init_tracing(&config.logging.filter);

    tracing::info!(
        config = %config_manager.config_path().display(),
        folders = ?config.sync.folders,
        "starting mycelix mail daemon"
    );

    let interval = Duration::from_secs(config.sync.poll_interval_secs);
    let state = AppState::initialize(&config_manager, config)
        .await
        .context("initialize daemon state")?;

    tokio::select! {
        _ = background_sync_loop(&state, interval) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
    }

    state.storage.pool().close().await;
    Ok(())
}

async fn background_sync_loop(state: &AppState, interval: Duration) {
    loop {
        match state.sync_all().await {
            Ok((succeeded, failed)) if succeeded > 0 || failed > 0 => {
                tracing::info!(succeeded, failed, "background sync cycle completed");
            }
            Ok(_) => {}
            Err(err) => tracing::error!("background sync run failed: {err:#}"),
        }

        tokio::time::sleep(interval).await;
    }
}
