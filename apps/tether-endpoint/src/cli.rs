use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use clap::Parser;

use crate::{
    capture::CaptureSettings,
    config::{normalize_relay_url, BackoffConfig, EndpointConfig, DEFAULT_RELAY_URL},
};

#[derive(Debug, Parser)]
#[command(
    name = "tether-endpoint",
    author,
    version,
    about = "Streams this machine's screen to a Tether relay and applies console input"
)]
pub struct Cli {
    /// Relay address; http(s):// and bare host:port forms are accepted.
    #[arg(env = "TETHER_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    #[arg(long, env = "TETHER_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Time allowed for the relay's auth frame after connecting.
    #[arg(long, env = "TETHER_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    #[arg(long, env = "TETHER_BACKOFF_FLOOR_SECS", default_value_t = 1)]
    pub backoff_floor_secs: u64,

    #[arg(long, env = "TETHER_BACKOFF_MAX_SECS", default_value_t = 60)]
    pub backoff_max_secs: u64,

    #[arg(long, env = "TETHER_SCREEN_QUALITY", default_value_t = 70)]
    pub screen_quality: u8,

    #[arg(long, env = "TETHER_SCREEN_SCALE", default_value_t = 0.75)]
    pub screen_scale: f64,

    /// Seconds between streamed frames (minimum 0.1).
    #[arg(long, env = "TETHER_SCREEN_UPDATE_INTERVAL", default_value_t = 0.1)]
    pub update_interval: f64,

    /// Image file served as the screen; re-read for every frame.
    #[arg(long, env = "TETHER_FRAME_FILE")]
    pub frame_file: Option<PathBuf>,

    #[arg(long, env = "TETHER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for EndpointConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.relay_url.trim().is_empty() {
            bail!("relay url must not be empty");
        }
        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be positive");
        }
        if cli.backoff_floor_secs == 0 || cli.backoff_max_secs < cli.backoff_floor_secs {
            bail!("backoff floor must be positive and not above the maximum");
        }

        let mut capture = CaptureSettings::default();
        capture.apply_update(
            Some(f64::from(cli.screen_quality)),
            Some(cli.screen_scale),
            Some(cli.update_interval),
        );

        Ok(EndpointConfig {
            relay_url: normalize_relay_url(&cli.relay_url),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs.max(1)),
            backoff: BackoffConfig {
                floor: Duration::from_secs(cli.backoff_floor_secs),
                max: Duration::from_secs(cli.backoff_max_secs),
            },
            capture,
            frame_file: cli.frame_file,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["tether-endpoint"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test_timeout::timeout]
    fn defaults_target_local_relay() {
        let config = EndpointConfig::try_from(parse(&[])).unwrap();
        assert_eq!(config.relay_url, "ws://localhost:8000/ws/client");
        assert_eq!(config.capture, CaptureSettings::default());
        assert_eq!(config.backoff, BackoffConfig::default());
    }

    #[test_timeout::timeout]
    fn capture_flags_are_clamped() {
        let config = EndpointConfig::try_from(parse(&[
            "https://relay.example.com",
            "--screen-quality",
            "0",
            "--screen-scale",
            "3.5",
            "--update-interval",
            "0.01",
        ]))
        .unwrap();
        assert_eq!(config.relay_url, "wss://relay.example.com/ws/client");
        assert_eq!(config.capture.quality, 1);
        assert_eq!(config.capture.scale, 1.0);
        assert_eq!(config.capture.update_interval, Duration::from_millis(100));
    }

    #[test_timeout::timeout]
    fn inverted_backoff_is_rejected() {
        let cli = parse(&["--backoff-floor-secs", "90", "--backoff-max-secs", "60"]);
        assert!(EndpointConfig::try_from(cli).is_err());
    }
}
