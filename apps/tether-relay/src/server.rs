use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::{shutdown_channel, ShutdownSignal, ShutdownTrigger, TokenIssuer};
use tokio::{net::TcpListener, task::JoinHandle, time::Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::RelayConfig,
    handlers::{admission_guard, control_handler, health_handler, metrics_handler, root_handler},
    heartbeat::HeartbeatMonitor,
    rate_limit::RateLimiter,
    registry::ConnectionRegistry,
    websocket::{controller_ws_handler, endpoint_ws_handler},
};

/// Everything a request handler or session task needs, built once per process.
pub struct AppState {
    pub config: RelayConfig,
    pub registry: ConnectionRegistry,
    pub issuer: TokenIssuer,
    pub limiter: RateLimiter,
    pub shutdown: ShutdownSignal,
    metrics: Option<PrometheusHandle>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

pub struct RelayServer {
    state: SharedState,
    trigger: ShutdownTrigger,
}

impl RelayServer {
    pub fn new(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        let (trigger, shutdown) = shutdown_channel();
        let issuer = TokenIssuer::new(config.secret.as_bytes(), config.endpoint_token_ttl);
        let limiter = RateLimiter::new(config.rate_limit);
        let state = Arc::new(AppState {
            config,
            registry: ConnectionRegistry::new(),
            issuer,
            limiter,
            shutdown,
            metrics,
        });
        Self { state, trigger }
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    pub fn router(&self) -> Router {
        router(self.state())
    }

    /// Serve on `listener` until `shutdown` resolves, then close every session.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state();
        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;

        let monitor = HeartbeatMonitor::new(state.registry.clone(), state.config.heartbeat)
            .spawn(state.shutdown.clone());
        let purger = spawn_limiter_purge(Arc::clone(&state));

        info!(listen_addr = %local_addr, "tether relay listening");

        let trigger = self.trigger;
        let registry = state.registry.clone();
        let app = router(Arc::clone(&state));
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown requested; closing sessions");
            let closed = registry.close_all();
            trigger.trigger();
            info!(closed, "sessions closed");
        })
        .await
        .context("server shutdown with error")?;

        // Sessions that registered while the listener was draining.
        state.registry.close_all();
        let _ = monitor.await;
        purger.abort();

        info!(
            grace_ms = state.config.shutdown_grace.as_millis() as u64,
            "waiting for writers to flush"
        );
        tokio::time::sleep(state.config.shutdown_grace).await;
        info!("graceful shutdown complete");
        Ok(())
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(health_handler))
        .route("/control", get(control_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/client", get(endpoint_ws_handler))
        .route("/ws/control", get(controller_ws_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            admission_guard,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn spawn_limiter_purge(state: SharedState) -> JoinHandle<()> {
    let period = state.limiter.window();
    let mut shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = interval.tick() => {
                    state.limiter.purge_expired(Instant::now());
                }
            }
        }
    })
}
