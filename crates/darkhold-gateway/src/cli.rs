//! CLI argument types for the `darkhold` binary.

use clap::Parser;
use std::path::PathBuf;

/// Host-resident HTTP gateway exposing a local Codex app-server to browser
/// clients.
#[derive(Parser, Debug)]
#[command(name = "darkhold", version, about)]
pub struct Cli {
    /// Address to bind the listeners on
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Port for the UI listener
    #[arg(long, default_value_t = 3275)]
    pub port: u16,

    /// Port for the RPC/API listener (must differ from --port)
    #[arg(long, name = "rpc-port", default_value_t = 3276)]
    pub rpc_port: u16,

    /// Additional IPv4 CIDR to allow (repeatable); loopback and the
    /// Tailscale ULA are always permitted
    #[arg(long, name = "allow-cidr")]
    pub allow_cidr: Vec<String>,

    /// Restrict the filesystem browser to this directory
    #[arg(long, name = "base-path")]
    pub base_path: Option<PathBuf>,

    /// Seconds to wait for a child's RPC response
    #[arg(long, name = "rpc-timeout-secs", default_value_t = 20)]
    pub rpc_timeout_secs: u64,

    /// Binary to run as the agent backend (`<bin> app-server`); the
    /// `DARKHOLD_APP_SERVER_BIN` environment variable overrides the default
    #[arg(long, name = "app-server-bin")]
    pub app_server_bin: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports() {
        let cli = Cli::parse_from(["darkhold"]);
        assert_eq!(cli.bind, "127.0.0.1");
        assert_eq!(cli.port, 3275);
        assert_eq!(cli.rpc_port, 3276);
        assert!(cli.allow_cidr.is_empty());
        assert_eq!(cli.rpc_timeout_secs, 20);
        assert!(cli.app_server_bin.is_none());
    }

    #[test]
    fn allow_cidr_is_repeatable() {
        let cli = Cli::parse_from([
            "darkhold",
            "--allow-cidr",
            "10.0.0.0/8",
            "--allow-cidr",
            "192.168.0.0/16",
        ]);
        assert_eq!(cli.allow_cidr.len(), 2);
    }

    #[test]
    fn invalid_port_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["darkhold", "--port", "99999"]).is_err());
        assert!(Cli::try_parse_from(["darkhold", "--port", "http"]).is_err());
    }
}
