use std::time::Duration;

use async_trait::async_trait;
use tether_core::ShutdownSignal;
use tracing::{info, warn};

use crate::{backoff::Backoff, config::BackoffConfig, error::EndpointError};

/// How one connect-and-run attempt ended.
#[derive(Debug, Default)]
pub struct SessionReport {
    /// The relay accepted the session (auth frame received).
    pub reached_active: bool,
    pub error: Option<EndpointError>,
}

impl SessionReport {
    pub fn failed(error: EndpointError) -> Self {
        Self {
            reached_active: false,
            error: Some(error),
        }
    }
}

/// One connection attempt: connect, authenticate, then run until the
/// transport fails or `shutdown` fires. Implementations close their transport
/// before returning.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn run_session(&self, shutdown: ShutdownSignal) -> SessionReport;
}

/// Persistent retry loop around a [`SessionDriver`].
pub struct ReconnectController<D> {
    driver: D,
    backoff: Backoff,
    shutdown_grace: Duration,
}

impl<D: SessionDriver> ReconnectController<D> {
    pub fn new(driver: D, backoff: BackoffConfig, shutdown_grace: Duration) -> Self {
        Self {
            driver,
            backoff: Backoff::new(backoff),
            shutdown_grace,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Run sessions until `shutdown` fires. Returns the number of attempts.
    pub async fn run(&mut self, mut shutdown: ShutdownSignal) -> u64 {
        let mut attempts = 0u64;
        while !shutdown.is_triggered() {
            attempts += 1;
            let session = self.driver.run_session(shutdown.clone());
            tokio::pin!(session);

            let report = tokio::select! {
                report = &mut session => report,
                _ = shutdown.triggered() => {
                    match tokio::time::timeout(self.shutdown_grace, &mut session).await {
                        Ok(report) => report,
                        Err(_) => {
                            warn!(
                                grace_ms = self.shutdown_grace.as_millis() as u64,
                                "session did not stop within grace period; abandoning it"
                            );
                            break;
                        }
                    }
                }
            };

            if shutdown.is_triggered() {
                break;
            }
            if report.reached_active {
                self.backoff.reset();
            }

            let delay = self.backoff.next_delay();
            match &report.error {
                Some(err) => warn!(
                    attempt = attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "session ended; reconnecting"
                ),
                None => info!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "session closed; reconnecting"
                ),
            }

            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(attempts, "reconnect loop stopped");
        attempts
    }
}
