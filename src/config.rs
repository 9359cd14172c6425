//! Configuration module for the limiter node
//!
//! This module handles CLI argument parsing with environment variable support.
//! Node policy (users, alive devices, routes) comes from the panel, not from here.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LimiterError, Result};

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Plain seconds, as the panel expresses intervals
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default data directory for reports written by the file panel
const DEFAULT_DATA_DIR: &str = "/var/lib/panda-limiter";

/// CLI arguments for the limiter node
///
/// Supports environment variables with X_PANDA_LIMITER_ prefix
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Per-user admission control, rate limiting and traffic accounting node"
)]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Panel definition file (node info, users, alive devices)
    #[arg(long, env = "X_PANDA_LIMITER_PANEL_FILE")]
    pub panel_file: PathBuf,

    /// Tag of the node this process manages
    #[arg(long, env = "X_PANDA_LIMITER_NODE_TAG", default_value = "node")]
    pub node_tag: String,

    /// Node-wide speed cap in Mbps, 0 = unlimited
    #[arg(long, env = "X_PANDA_LIMITER_SPEED_LIMIT", default_value_t = 0)]
    pub speed_limit: u64,

    /// Users below this much traffic (KB) are not reported yet
    #[arg(long, env = "X_PANDA_LIMITER_REPORT_MIN_TRAFFIC", default_value_t = 0)]
    pub report_min_traffic: u64,

    /// Interval for fetching users (e.g., "60s", "2m", default: 60s)
    #[arg(long, env = "X_PANDA_LIMITER_FETCH_USERS_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub fetch_users_interval: Duration,

    /// Interval for reporting traffic and online devices (default: 60s)
    #[arg(long, env = "X_PANDA_LIMITER_REPORT_TRAFFICS_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub report_traffics_interval: Duration,

    /// Log mode: debug, info, warn, error (default: info)
    #[arg(long, env = "X_PANDA_LIMITER_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Data directory for traffic and online reports
    #[arg(long, env = "X_PANDA_LIMITER_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.node_tag.is_empty() {
            return Err(LimiterError::Config("Node tag is required".into()));
        }
        if self.node_tag.contains('|') {
            return Err(LimiterError::Config("Node tag must not contain '|'".into()));
        }
        if !self.panel_file.exists() {
            return Err(LimiterError::Config(format!(
                "Panel file not found: {}",
                self.panel_file.display()
            )));
        }
        if self.fetch_users_interval.is_zero() {
            return Err(LimiterError::Config(
                "fetch_users_interval must be greater than 0".into(),
            ));
        }
        if self.report_traffics_interval.is_zero() {
            return Err(LimiterError::Config(
                "report_traffics_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Node-level limiting parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitConfig {
    /// Node-wide cap in Mbps, 0 = unlimited
    pub speed_limit: u64,
    /// Traffic slices only include users strictly above this many bytes
    pub report_min_traffic_bytes: u64,
}

impl LimitConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            speed_limit: cli.speed_limit,
            report_min_traffic_bytes: cli.report_min_traffic.saturating_mul(1024),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_cli_args(panel_file: PathBuf) -> CliArgs {
        CliArgs {
            panel_file,
            node_tag: "node".to_string(),
            speed_limit: 0,
            report_min_traffic: 0,
            fetch_users_interval: Duration::from_secs(60),
            report_traffics_interval: Duration::from_secs(60),
            log_mode: "info".to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }

    fn create_test_cli_args_with_panel_file() -> (CliArgs, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let panel_path = temp_dir.path().join("panel.json");
        std::fs::write(&panel_path, "{}").unwrap();
        (create_test_cli_args(panel_path), temp_dir)
    }

    #[test]
    fn test_cli_args_from_command_line() {
        let cli = CliArgs::try_parse_from([
            "panda-limiter",
            "--panel_file",
            "/tmp/panel.json",
            "--node_tag",
            "hk-1",
            "--speed_limit",
            "100",
            "--fetch_users_interval",
            "2m",
            "--report_traffics_interval",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.panel_file, PathBuf::from("/tmp/panel.json"));
        assert_eq!(cli.node_tag, "hk-1");
        assert_eq!(cli.speed_limit, 100);
        assert_eq!(cli.fetch_users_interval, Duration::from_secs(120));
        assert_eq!(cli.report_traffics_interval, Duration::from_secs(30));
        assert_eq!(cli.log_mode, "info");
        assert_eq!(cli.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn test_cli_args_validate_success() {
        let (cli, _dir) = create_test_cli_args_with_panel_file();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_args_validate_missing_panel_file() {
        let cli = create_test_cli_args(PathBuf::from("/nonexistent/panel.json"));
        let err = cli.validate().unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
        assert!(err.to_string().contains("Panel file not found"));
    }

    #[test]
    fn test_cli_args_validate_bad_tag() {
        let (mut cli, _dir) = create_test_cli_args_with_panel_file();
        cli.node_tag = String::new();
        assert!(cli.validate().is_err());
        cli.node_tag = "a|b".to_string();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_zero_interval() {
        let (mut cli, _dir) = create_test_cli_args_with_panel_file();
        cli.fetch_users_interval = Duration::ZERO;
        assert!(cli.validate().is_err());

        let (mut cli, _dir) = create_test_cli_args_with_panel_file();
        cli.report_traffics_interval = Duration::ZERO;
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_limit_config_from_cli() {
        let mut cli = create_test_cli_args(PathBuf::from("/tmp/panel.json"));
        cli.speed_limit = 50;
        cli.report_min_traffic = 4;
        let config = LimitConfig::from_cli(&cli);
        assert_eq!(config.speed_limit, 50);
        assert_eq!(config.report_min_traffic_bytes, 4096);
    }
}
