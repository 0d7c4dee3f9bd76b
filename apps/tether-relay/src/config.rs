use std::{collections::HashSet, net::IpAddr, net::SocketAddr, time::Duration};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_SESSION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Period of the monitor sweep, the per-read wait and the transport keepalive.
    pub interval: Duration,
    /// Age after which a session without liveness signals is evicted.
    pub timeout: Duration,
    /// Pause after a monitor cycle fails before the next one starts.
    pub error_backoff: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub secret: String,
    pub endpoint_token_ttl: time::Duration,
    pub rate_limit: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub session_buffer: usize,
    /// When non-empty, only these addresses may connect.
    pub allowed_ips: HashSet<IpAddr>,
    pub blocked_ips: HashSet<IpAddr>,
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Defaults for everything except the signing secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            secret: secret.into(),
            endpoint_token_ttl: tether_core::token::DEFAULT_TOKEN_TTL,
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            session_buffer: DEFAULT_SESSION_BUFFER,
            allowed_ips: HashSet::new(),
            blocked_ips: HashSet::new(),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    /// Address filtering verdict for a remote peer.
    pub fn address_permitted(&self, addr: &IpAddr) -> bool {
        if self.blocked_ips.contains(addr) {
            return false;
        }
        self.allowed_ips.is_empty() || self.allowed_ips.contains(addr)
    }
}

/// Parse a comma separated address list; blank entries are skipped.
pub fn parse_ip_list(raw: &str) -> Result<HashSet<IpAddr>, std::net::AddrParseError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ip_lists_ignore_blanks() {
        let parsed = parse_ip_list(" 10.0.0.1, ,::1,").unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&"10.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(parse_ip_list("").unwrap().is_empty());
        assert!(parse_ip_list("not-an-ip").is_err());
    }

    #[test_timeout::timeout]
    fn block_list_wins_over_allow_list() {
        let mut config = RelayConfig::new("secret");
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let other: IpAddr = "10.1.1.1".parse().unwrap();
        assert!(config.address_permitted(&local));

        config.allowed_ips.insert(local);
        assert!(config.address_permitted(&local));
        assert!(!config.address_permitted(&other));

        config.blocked_ips.insert(local);
        assert!(!config.address_permitted(&local));
    }
}
