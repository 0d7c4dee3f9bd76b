use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::time::Instant;

use crate::error::EndpointError;

pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(3600);

/// Parameters handed to the screen source and used to pace streaming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    /// Encoder quality, 1..=100.
    pub quality: u8,
    /// Resize factor, 0.1..=1.0.
    pub scale: f32,
    pub update_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            quality: 70,
            scale: 0.75,
            update_interval: MIN_UPDATE_INTERVAL,
        }
    }
}

impl CaptureSettings {
    /// Apply a console `config` command; each field is clamped to its range
    /// and non-finite values are ignored.
    pub fn apply_update(
        &mut self,
        quality: Option<f64>,
        scale: Option<f64>,
        update_interval_secs: Option<f64>,
    ) {
        if let Some(quality) = quality.filter(|value| value.is_finite()) {
            self.quality = quality.trunc().clamp(1.0, 100.0) as u8;
        }
        if let Some(scale) = scale.filter(|value| value.is_finite()) {
            self.scale = scale.clamp(0.1, 1.0) as f32;
        }
        if let Some(secs) = update_interval_secs.filter(|value| value.is_finite()) {
            let secs = secs.clamp(
                MIN_UPDATE_INTERVAL.as_secs_f64(),
                MAX_UPDATE_INTERVAL.as_secs_f64(),
            );
            self.update_interval = Duration::from_secs_f64(secs);
        }
    }
}

/// Produces encoded screen images.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    async fn capture(&self, settings: &CaptureSettings) -> Result<Vec<u8>, EndpointError>;
}

/// Serves whatever image is currently stored at `path`, re-read on each
/// capture so an external grabber can keep overwriting it.
#[derive(Debug, Clone)]
pub struct FileFrameSource {
    path: PathBuf,
}

impl FileFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScreenSource for FileFrameSource {
    async fn capture(&self, _settings: &CaptureSettings) -> Result<Vec<u8>, EndpointError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|err| EndpointError::Capture(format!("{}: {err}", self.path.display())))
    }
}

/// Wraps a [`ScreenSource`], reusing the last encoded frame while it is
/// younger than the update interval.
pub struct FrameCache {
    source: Arc<dyn ScreenSource>,
    last: Option<(Instant, String)>,
}

impl FrameCache {
    pub fn new(source: Arc<dyn ScreenSource>) -> Self {
        Self { source, last: None }
    }

    /// Base64 text of the current frame.
    pub async fn frame(&mut self, settings: &CaptureSettings) -> Result<&str, EndpointError> {
        let now = Instant::now();
        let fresh = matches!(
            &self.last,
            Some((captured_at, _)) if now.saturating_duration_since(*captured_at) < settings.update_interval
        );
        if !fresh {
            let bytes = self.source.capture(settings).await?;
            self.last = Some((now, STANDARD.encode(bytes)));
        }
        match &self.last {
            Some((_, encoded)) => Ok(encoded.as_str()),
            None => Err(EndpointError::Capture("no frame captured".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        captures: AtomicUsize,
    }

    #[async_trait]
    impl ScreenSource for CountingSource {
        async fn capture(&self, _settings: &CaptureSettings) -> Result<Vec<u8>, EndpointError> {
            let count = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("frame-{count}").into_bytes())
        }
    }

    #[test_timeout::timeout]
    fn config_updates_are_clamped() {
        let mut settings = CaptureSettings::default();
        settings.apply_update(Some(250.0), Some(0.01), Some(0.0));
        assert_eq!(settings.quality, 100);
        assert_eq!(settings.scale, 0.1);
        assert_eq!(settings.update_interval, MIN_UPDATE_INTERVAL);

        settings.apply_update(Some(-3.0), Some(4.0), Some(2.5));
        assert_eq!(settings.quality, 1);
        assert_eq!(settings.scale, 1.0);
        assert_eq!(settings.update_interval, Duration::from_millis(2500));

        settings.apply_update(Some(42.9), None, None);
        assert_eq!(settings.quality, 42);
        assert_eq!(settings.scale, 1.0);
    }

    #[test_timeout::timeout]
    fn oversized_and_non_finite_intervals_are_contained() {
        let mut settings = CaptureSettings::default();
        settings.apply_update(None, None, Some(1e300));
        assert_eq!(settings.update_interval, MAX_UPDATE_INTERVAL);

        settings.apply_update(None, None, Some(f64::INFINITY));
        settings.apply_update(None, None, Some(f64::NAN));
        assert_eq!(settings.update_interval, MAX_UPDATE_INTERVAL);

        settings.apply_update(None, None, Some(-1e300));
        assert_eq!(settings.update_interval, MIN_UPDATE_INTERVAL);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn frames_are_reused_within_interval() {
        let source = Arc::new(CountingSource {
            captures: AtomicUsize::new(0),
        });
        let mut cache = FrameCache::new(source.clone());
        let settings = CaptureSettings {
            update_interval: Duration::from_secs(1),
            ..CaptureSettings::default()
        };

        let first = cache.frame(&settings).await.unwrap().to_string();
        tokio::time::advance(Duration::from_millis(500)).await;
        let second = cache.frame(&settings).await.unwrap().to_string();
        assert_eq!(first, second);
        assert_eq!(source.captures.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        let third = cache.frame(&settings).await.unwrap().to_string();
        assert_ne!(first, third);
        assert_eq!(third, STANDARD.encode("frame-2"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_frame_file_is_a_capture_error() {
        let source = FileFrameSource::new("/nonexistent/tether/frame.jpg");
        let result = source.capture(&CaptureSettings::default()).await;
        assert!(matches!(result, Err(EndpointError::Capture(_))));
    }
}
