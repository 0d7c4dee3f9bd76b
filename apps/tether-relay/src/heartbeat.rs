use metrics::counter;
use tether_core::{SessionId, ShutdownSignal};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    config::HeartbeatConfig,
    registry::{CloseReason, ConnectionRegistry, Role},
};

/// Evicts sessions that have stopped sending liveness signals.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    registry: ConnectionRegistry,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(registry: ConnectionRegistry, config: HeartbeatConfig) -> Self {
        Self { registry, config }
    }

    /// Run one eviction pass as of `now`; returns the evicted ids.
    ///
    /// Only the caller whose `unregister` actually removed a session announces
    /// its disconnect, so a concurrent close by the session's own loop never
    /// produces a second `client_disconnected`.
    pub fn sweep(&self, now: Instant) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        for entry in self.registry.heartbeat_snapshot() {
            let age = now.saturating_duration_since(entry.last_heartbeat);
            if age <= self.config.timeout {
                continue;
            }
            if self
                .registry
                .unregister(&entry.id, CloseReason::HeartbeatTimeout)
                .is_none()
            {
                continue;
            }

            warn!(
                session_id = %entry.id,
                role = entry.role.as_str(),
                age_secs = age.as_secs(),
                "heartbeat timeout; session evicted"
            );
            counter!("tether_relay_heartbeat_evictions_total", "role" => entry.role.as_str())
                .increment(1);
            if entry.role == Role::Endpoint {
                self.registry.notify_endpoint_gone(&entry.id);
            }
            evicted.push(entry.id);
        }
        evicted
    }

    /// Start the recurring monitor. It lives until `shutdown` fires; a cycle
    /// that panics is logged and followed by a short back-off.
    pub fn spawn(self, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                timeout_secs = self.config.timeout.as_secs(),
                "heartbeat monitor started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = interval.tick() => {}
                }

                let monitor = self.clone();
                let cycle = tokio::spawn(async move { monitor.sweep(Instant::now()) });
                match cycle.await {
                    Ok(evicted) if !evicted.is_empty() => {
                        debug!(evicted = evicted.len(), "heartbeat cycle complete");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "heartbeat cycle failed");
                        tokio::select! {
                            _ = shutdown.triggered() => break,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                }
            }
            info!("heartbeat monitor stopped");
        })
    }
}
