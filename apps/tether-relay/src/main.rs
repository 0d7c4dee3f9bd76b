use anyhow::{Context, Result};
use clap::Parser;
use tether_relay::{
    cli::{issue_token, Cli, Command},
    telemetry::Telemetry,
    RelayConfig, RelayServer,
};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::IssueToken {
        subject,
        ttl_secs,
        scope,
    }) = &cli.command
    {
        let token = issue_token(&cli.server, subject, *ttl_secs, *scope)?;
        println!("{}", token.as_str());
        return Ok(());
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        heartbeat_interval_secs = config.heartbeat.interval.as_secs(),
        session_timeout_secs = config.heartbeat.timeout.as_secs(),
        rate_limit_requests = config.rate_limit.max_requests,
        allowed_ips = config.allowed_ips.len(),
        blocked_ips = config.blocked_ips.len(),
        "starting tether relay"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    RelayServer::new(config, Some(telemetry.metrics_handle()))
        .serve(listener, shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
