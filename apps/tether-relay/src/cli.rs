use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tether_core::{Token, TokenIssuer, TokenScope};

use crate::config::{
    parse_ip_list, HeartbeatConfig, RateLimitConfig, RelayConfig, DEFAULT_LISTEN_ADDR,
};

#[derive(Debug, Parser)]
#[command(
    name = "tether-relay",
    author,
    version,
    about = "Rendezvous relay between controlled endpoints and operator consoles"
)]
pub struct Cli {
    #[command(flatten)]
    pub server: ServerArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a signed token for a console operator or an endpoint.
    IssueToken {
        /// Subject the token is bound to.
        #[arg(long)]
        subject: String,

        /// Lifetime in seconds; defaults to the endpoint token lifetime.
        #[arg(long)]
        ttl_secs: Option<u64>,

        #[arg(long, value_enum, default_value_t = ScopeArg::Controller)]
        scope: ScopeArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    Controller,
    Endpoint,
}

impl From<ScopeArg> for TokenScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Controller => TokenScope::Controller,
            ScopeArg::Endpoint => TokenScope::Endpoint,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP and WebSocket listener to.
    #[arg(long, env = "TETHER_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Secret used to sign and verify tokens.
    #[arg(long, env = "TETHER_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Lifetime of identity tokens handed to endpoints.
    #[arg(long, env = "TETHER_ENDPOINT_TOKEN_TTL_SECS", default_value_t = 86_400)]
    pub endpoint_token_ttl_secs: u64,

    /// Requests admitted per address in each window.
    #[arg(long, env = "TETHER_RATE_LIMIT_REQUESTS", default_value_t = 100)]
    pub rate_limit_requests: u32,

    #[arg(long, env = "TETHER_RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Period of heartbeat sweeps and transport keepalives.
    #[arg(long, env = "TETHER_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Silence after which a session is evicted.
    #[arg(long, env = "TETHER_SESSION_TIMEOUT_SECS", default_value_t = 60)]
    pub session_timeout_secs: u64,

    /// Outbound frames queued per session before new frames are dropped.
    #[arg(long, env = "TETHER_SESSION_BUFFER", default_value_t = 64)]
    pub session_buffer: usize,

    /// Comma separated addresses allowed to connect (empty allows all).
    #[arg(long, env = "TETHER_ALLOWED_IPS", default_value = "")]
    pub allowed_ips: String,

    /// Comma separated addresses refused outright.
    #[arg(long, env = "TETHER_BLOCKED_IPS", default_value = "")]
    pub blocked_ips: String,

    #[arg(long, env = "TETHER_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl ServerArgs {
    fn secret(&self) -> Result<&str> {
        match self.secret_key.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => bail!("a signing secret is required (--secret-key or TETHER_SECRET_KEY)"),
        }
    }

    fn endpoint_token_ttl(&self) -> Result<time::Duration> {
        let secs = i64::try_from(self.endpoint_token_ttl_secs)
            .context("endpoint token lifetime is too large")?;
        Ok(time::Duration::seconds(secs))
    }
}

impl TryFrom<ServerArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let secret = args.secret()?.to_string();
        let endpoint_token_ttl = args.endpoint_token_ttl()?;

        if args.rate_limit_requests == 0 || args.rate_limit_window_secs == 0 {
            bail!("rate limit requests and window must be positive");
        }
        if args.heartbeat_interval_secs == 0 || args.session_timeout_secs == 0 {
            bail!("heartbeat interval and session timeout must be positive");
        }
        if args.session_buffer == 0 {
            bail!("session buffer must hold at least one frame");
        }

        let allowed_ips = parse_ip_list(&args.allowed_ips)
            .with_context(|| format!("invalid allowed address list: {}", args.allowed_ips))?;
        let blocked_ips = parse_ip_list(&args.blocked_ips)
            .with_context(|| format!("invalid blocked address list: {}", args.blocked_ips))?;

        Ok(RelayConfig {
            listen_addr,
            secret,
            endpoint_token_ttl,
            rate_limit: RateLimitConfig {
                max_requests: args.rate_limit_requests,
                window: Duration::from_secs(args.rate_limit_window_secs),
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(args.heartbeat_interval_secs),
                timeout: Duration::from_secs(args.session_timeout_secs),
                ..HeartbeatConfig::default()
            },
            session_buffer: args.session_buffer,
            allowed_ips,
            blocked_ips,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

/// Mint a token with the configured secret.
pub fn issue_token(
    args: &ServerArgs,
    subject: &str,
    ttl_secs: Option<u64>,
    scope: ScopeArg,
) -> Result<Token> {
    if subject.trim().is_empty() {
        bail!("token subject must not be empty");
    }
    let ttl = match ttl_secs {
        Some(secs) => {
            time::Duration::seconds(i64::try_from(secs).context("token lifetime is too large")?)
        }
        None => args.endpoint_token_ttl()?,
    };
    let issuer = TokenIssuer::new(args.secret()?.as_bytes(), ttl);
    issuer
        .issue(subject, scope.into())
        .context("failed to sign token")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["tether-relay"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test_timeout::timeout]
    fn defaults_build_config() {
        let cli = parse(&["--secret-key", "s3cret"]);
        assert!(cli.command.is_none());
        let config = RelayConfig::try_from(cli.server).unwrap();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
        assert_eq!(config.endpoint_token_ttl, time::Duration::hours(24));
        assert_eq!(config.session_buffer, 64);
        assert!(config.allowed_ips.is_empty());
    }

    #[test_timeout::timeout]
    fn missing_or_blank_secret_is_rejected() {
        let cli = parse(&["--secret-key", "   "]);
        assert!(RelayConfig::try_from(cli.server).is_err());
    }

    #[test_timeout::timeout]
    fn invalid_values_are_rejected() {
        for args in [
            ["--secret-key", "s", "--listen-addr", "nowhere"].as_slice(),
            ["--secret-key", "s", "--session-buffer", "0"].as_slice(),
            ["--secret-key", "s", "--rate-limit-window-secs", "0"].as_slice(),
            ["--secret-key", "s", "--blocked-ips", "10.0.0.1,bogus"].as_slice(),
        ] {
            let cli = parse(args);
            assert!(RelayConfig::try_from(cli.server).is_err(), "{args:?}");
        }
    }

    #[test_timeout::timeout]
    fn issue_token_subcommand_mints_verifiable_token() {
        let cli = parse(&[
            "--secret-key",
            "s3cret",
            "issue-token",
            "--subject",
            "ops",
            "--ttl-secs",
            "600",
        ]);
        let Some(Command::IssueToken {
            subject,
            ttl_secs,
            scope,
        }) = cli.command
        else {
            panic!("expected issue-token subcommand");
        };
        assert_eq!(scope, ScopeArg::Controller);

        let token = issue_token(&cli.server, &subject, ttl_secs, scope).unwrap();
        let issuer = TokenIssuer::new(b"s3cret", time::Duration::minutes(10));
        let claims = issuer
            .verify_scoped(token.as_str(), TokenScope::Controller)
            .unwrap();
        assert_eq!(claims.subject_id(), "ops");
        assert_eq!(token.expires_at - token.issued_at, time::Duration::seconds(600));
    }
}
