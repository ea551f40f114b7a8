//! Resolved server configuration.
//!
//! [`ServerConfig::from_cli`] validates the raw CLI flags into the typed
//! configuration the rest of the gateway consumes. Validation failures are
//! startup failures with a human-readable message.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::allowlist::Ipv4Cidr;
use crate::cli::Cli;

/// Interval between SSE keepalive comment frames.
pub const SSE_KEEPALIVE: Duration = Duration::from_secs(15);
/// Per-child grace period on shutdown before escalating to kill.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(2_500);

/// Configuration validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `--port` and `--rpc-port` collide.
    #[error("--port and --rpc-port must differ (both are {0})")]
    PortClash(u16),
    /// `--bind` is not a valid IP address.
    #[error("invalid --bind address '{0}'")]
    InvalidBind(String),
    /// An `--allow-cidr` value failed to parse.
    #[error("invalid --allow-cidr '{input}': {reason}")]
    InvalidCidr {
        /// The offending flag value.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
    /// `--base-path` does not point at a usable directory.
    #[error("invalid --base-path '{path}': {reason}")]
    BasePath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for both listeners.
    pub bind: IpAddr,
    /// UI listener port.
    pub port: u16,
    /// RPC/API listener port.
    pub rpc_port: u16,
    /// Extra allowed IPv4 networks.
    pub allow_cidrs: Vec<Ipv4Cidr>,
    /// Root the filesystem browser is confined to.
    pub base_path: PathBuf,
    /// Binary spawned as `<bin> app-server`.
    pub app_server_bin: String,
    /// Deadline for child RPC responses.
    pub rpc_timeout: Duration,
    /// SSE keepalive interval.
    pub keepalive: Duration,
    /// Per-child shutdown grace period.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Validate raw CLI flags into a usable configuration.
    ///
    /// # Errors
    ///
    /// One [`ConfigError`] naming the offending flag.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if cli.port == cli.rpc_port {
            return Err(ConfigError::PortClash(cli.port));
        }

        let bind: IpAddr = cli
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBind(cli.bind.clone()))?;

        let mut allow_cidrs = Vec::with_capacity(cli.allow_cidr.len());
        for raw in &cli.allow_cidr {
            let cidr: Ipv4Cidr = raw.parse().map_err(|e: crate::allowlist::CidrParseError| {
                ConfigError::InvalidCidr {
                    input: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
            allow_cidrs.push(cidr);
        }

        let base_path = match &cli.base_path {
            Some(path) => {
                let canonical =
                    std::fs::canonicalize(path).map_err(|e| ConfigError::BasePath {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                if !canonical.is_dir() {
                    return Err(ConfigError::BasePath {
                        path: path.display().to_string(),
                        reason: "not a directory".into(),
                    });
                }
                canonical
            }
            None => std::env::current_dir().map_err(|e| ConfigError::BasePath {
                path: ".".into(),
                reason: e.to_string(),
            })?,
        };

        // Flag beats environment beats the stock `codex` binary.
        let app_server_bin = cli
            .app_server_bin
            .clone()
            .or_else(|| std::env::var("DARKHOLD_APP_SERVER_BIN").ok())
            .unwrap_or_else(|| "codex".to_string());

        Ok(Self {
            bind,
            port: cli.port,
            rpc_port: cli.rpc_port,
            allow_cidrs,
            base_path,
            app_server_bin,
            rpc_timeout: Duration::from_secs(cli.rpc_timeout_secs),
            keepalive: SSE_KEEPALIVE,
            shutdown_grace: SHUTDOWN_GRACE,
        })
    }
}
