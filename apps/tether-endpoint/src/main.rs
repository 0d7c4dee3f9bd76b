use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::shutdown_channel;
use tether_endpoint::{
    cli::Cli, EndpointConfig, FileFrameSource, ReconnectController, ScreenSource, TracingInjector,
    WsSessionDriver,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let config = EndpointConfig::try_from(Cli::parse())?;
    info!(
        relay_url = %config.relay_url,
        frame_file = ?config.frame_file,
        "starting tether endpoint"
    );

    let screen = config
        .frame_file
        .clone()
        .map(|path| Arc::new(FileFrameSource::new(path)) as Arc<dyn ScreenSource>);
    if screen.is_none() {
        warn!("no frame file configured; streaming disabled");
    }
    let driver = WsSessionDriver::new(config.clone(), screen, Arc::new(TracingInjector));

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                trigger.trigger();
            }
            Err(err) => warn!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    ReconnectController::new(driver, config.backoff, config.shutdown_grace)
        .run(shutdown)
        .await;
    Ok(())
}
