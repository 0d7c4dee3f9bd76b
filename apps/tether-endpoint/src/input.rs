use tracing::info;

use crate::error::EndpointError;

/// Applies console input to the local machine. Coordinates are normalised to
/// 0..=1 of the screen size.
pub trait InputInjector: Send + Sync {
    fn move_to(&self, x: f64, y: f64) -> Result<(), EndpointError>;
    fn click(&self) -> Result<(), EndpointError>;
    fn press(&self, key: &str) -> Result<(), EndpointError>;
}

/// Logs every command instead of touching the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInjector;

impl InputInjector for TracingInjector {
    fn move_to(&self, x: f64, y: f64) -> Result<(), EndpointError> {
        info!(x, y, "mouse move");
        Ok(())
    }

    fn click(&self) -> Result<(), EndpointError> {
        info!("mouse click");
        Ok(())
    }

    fn press(&self, key: &str) -> Result<(), EndpointError> {
        if key.trim().is_empty() {
            return Err(EndpointError::Input("empty key name".into()));
        }
        info!(key, "key press");
        Ok(())
    }
}
