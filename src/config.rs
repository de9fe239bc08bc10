//! Server configuration from command-line flags and environment
//!
//! A flag wins over its environment variable, which wins over the default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::Level;

pub const DEFAULT_SOCKET: &str = "/tmp/minefield.sock";
pub const DEFAULT_GRACE_SECS: u64 = 5;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "minefield-server", version)]
#[command(about = "Supply-chain graph server over a Unix socket", long_about = None)]
pub struct ServerConfig {
    /// sled database directory; in-memory storage when omitted
    #[arg(value_name = "DB_PATH", env = "MINEFIELD_DB")]
    pub db_path: Option<PathBuf>,

    /// Unix socket path
    #[arg(long = "socket", env = "MINEFIELD_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket_path: PathBuf,

    /// Leaderboard worker threads (at least 1)
    #[arg(
        long,
        env = "MINEFIELD_CONCURRENCY",
        default_value_t = default_concurrency(),
        value_parser = parse_concurrency
    )]
    pub concurrency: usize,

    /// Seconds to wait for in-flight clients on shutdown
    #[arg(long = "grace-secs", env = "MINEFIELD_GRACE_SECS", default_value_t = DEFAULT_GRACE_SECS)]
    pub grace_secs: u64,

    /// trace, debug, info, warn or error
    #[arg(long = "log", env = "MINEFIELD_LOG", default_value_t = Level::INFO)]
    pub log_level: Level,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn parse_concurrency(raw: &str) -> Result<usize, String> {
    raw.trim()
        .parse::<usize>()
        .map(|n| n.max(1))
        .map_err(|e| format!("invalid thread count '{}': {}", raw, e))
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<ServerConfig, clap::Error> {
        ServerConfig::try_parse_from(std::iter::once("minefield-server").chain(args.iter().copied()))
    }

    // The only test that touches MINEFIELD_* variables; the others pass
    // every value they assert as a flag.
    #[test]
    fn test_defaults_then_env_then_flags() {
        for key in [
            "MINEFIELD_DB",
            "MINEFIELD_SOCKET",
            "MINEFIELD_CONCURRENCY",
            "MINEFIELD_GRACE_SECS",
            "MINEFIELD_LOG",
        ] {
            std::env::remove_var(key);
        }

        let config = parse(&[]).unwrap();
        assert_eq!(config.db_path, None);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET));
        assert!(config.concurrency >= 1);
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.log_level, Level::INFO);

        std::env::set_var("MINEFIELD_DB", "/var/lib/minefield");
        std::env::set_var("MINEFIELD_SOCKET", "/run/env.sock");
        std::env::set_var("MINEFIELD_CONCURRENCY", "3");
        std::env::set_var("MINEFIELD_LOG", "warn");

        let from_env = parse(&[]);
        let from_flags = parse(&["--socket", "/tmp/flag.sock", "--log", "debug"]);

        for key in ["MINEFIELD_DB", "MINEFIELD_SOCKET", "MINEFIELD_CONCURRENCY", "MINEFIELD_LOG"] {
            std::env::remove_var(key);
        }

        let from_env = from_env.unwrap();
        assert_eq!(from_env.socket_path, PathBuf::from("/run/env.sock"));
        assert_eq!(from_env.log_level, Level::WARN);

        let from_flags = from_flags.unwrap();
        assert_eq!(from_flags.db_path, Some(PathBuf::from("/var/lib/minefield")));
        assert_eq!(from_flags.socket_path, PathBuf::from("/tmp/flag.sock"));
        assert_eq!(from_flags.concurrency, 3);
        assert_eq!(from_flags.log_level, Level::DEBUG);
    }

    #[test]
    fn test_positional_db_and_numbers() {
        let config = parse(&["./graph.db", "--concurrency", "0", "--grace-secs", "12"]).unwrap();

        assert_eq!(config.db_path, Some(PathBuf::from("./graph.db")));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.grace_period(), Duration::from_secs(12));
    }

    #[test]
    fn test_invalid_input() {
        for bad in [
            &["--concurrency", "many"][..],
            &["--verbose"],
            &["--socket"],
            &["a.db", "b.db"],
            &["--log", "loud"],
            &["--grace-secs", "-1"],
        ] {
            assert!(parse(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_help() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert!(err.to_string().contains("MINEFIELD_SOCKET"));
    }
}
