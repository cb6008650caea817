//! `llamadds-server`: fronts a completion engine with the DDS bridge.

use std::sync::Arc;

use llamadds_bridge::{BridgeConfig, BridgeServer, LoopbackEngine};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env();
    init_tracing(&config);

    if !config.enable_dds {
        info!("LLAMADDS_ENABLE is false, nothing to do");
        return Ok(());
    }

    let engine = Arc::new(LoopbackEngine::builder(config.model_name.clone()).build()?);

    let mut server = match BridgeServer::start(&config, engine) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start bridge server");
            std::process::exit(1);
        }
    };

    wait_for_shutdown().await;
    server.stop();
    Ok(())
}

fn init_tracing(config: &BridgeConfig) {
    let filter = EnvFilter::new(&config.log_level);
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT received, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, shutting down");
}
