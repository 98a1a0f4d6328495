use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::orchestrator::OrchestratorConfig;
use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "roulette",
    about = "Video and text chat with a random stranger",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "ROULETTE_SIGNAL_URL",
        default_value = "ws://localhost:8080/ws",
        help = "Matchmaker WebSocket endpoint"
    )]
    pub signal_url: String,

    #[arg(
        long,
        env = "ROULETTE_STUN_SERVER",
        default_value = "stun.l.google.com:19302",
        value_name = "HOST:PORT",
        help = "STUN server used for the reachability check and ICE"
    )]
    pub stun_server: String,

    #[arg(long, env = "ROULETTE_INCLUDE_LOOPBACK", default_value_t = false)]
    pub include_loopback: bool,

    #[command(flatten)]
    pub timing: TimingArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct TimingArgs {
    #[arg(long, env = "ROULETTE_PREFLIGHT_TIMEOUT_MS", default_value_t = 5_000)]
    pub preflight_timeout_ms: u64,

    #[arg(
        long,
        env = "ROULETTE_CONNECT_TIMEOUT_MS",
        default_value_t = 10_000,
        help = "Time allowed from match to first connectivity"
    )]
    pub connect_timeout_ms: u64,

    #[arg(
        long,
        env = "ROULETTE_FRAME_TIMEOUT_MS",
        default_value_t = 5_000,
        help = "Longest gap between video frames before giving up"
    )]
    pub frame_timeout_ms: u64,

    #[arg(long, env = "ROULETTE_MAX_BACKOFF_EXPONENT", default_value_t = 4)]
    pub max_backoff_exponent: u32,
}

impl TimingArgs {
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            preflight_timeout: Duration::from_millis(self.preflight_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            max_backoff_exponent: self.max_backoff_exponent,
            ..OrchestratorConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "ROULETTE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "ROULETTE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    /// ICE server URL derived from `--stun-server`.
    pub fn ice_server(&self) -> String {
        format!("stun:{}", self.stun_server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_design_timings() {
        let cli = Cli::parse_from(["roulette"]);
        assert_eq!(cli.signal_url, "ws://localhost:8080/ws");
        assert_eq!(cli.ice_server(), "stun:stun.l.google.com:19302");
        let config = cli.timing.to_config();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.frame_timeout, Duration::from_secs(5));
        assert_eq!(config.preflight_timeout, Duration::from_secs(5));
        assert_eq!(config.max_backoff_exponent, 4);
        assert_eq!(config.retry_pause, Duration::from_millis(100));
        assert_eq!(cli.logging.level, LogLevel::Warn);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "roulette",
            "--signal-url",
            "wss://match.example/ws",
            "--connect-timeout-ms",
            "2500",
            "--log-level",
            "debug",
            "--log-file",
            "/tmp/roulette.log",
        ]);
        assert_eq!(cli.signal_url, "wss://match.example/ws");
        assert_eq!(
            cli.timing.to_config().connect_timeout,
            Duration::from_millis(2500)
        );
        let logging = cli.logging.to_config();
        assert_eq!(logging.level, LogLevel::Debug);
        assert_eq!(logging.file, Some(PathBuf::from("/tmp/roulette.log")));
    }
}
