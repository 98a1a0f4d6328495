use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::config::MatchConfig;

#[derive(Parser, Debug)]
#[command(
    name = "roulette-match",
    about = "Pairs anonymous roulette clients and relays their WebRTC handshake",
    version
)]
pub struct Cli {
    #[arg(long, env = "ROULETTE_MATCH_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    #[arg(
        long,
        env = "ROULETTE_MATCH_INTERVAL_MS",
        default_value_t = 5_000,
        help = "Milliseconds between matching ticks"
    )]
    pub match_interval_ms: u64,

    #[arg(
        long,
        env = "ROULETTE_HANDSHAKE_TIMEOUT_MS",
        default_value_t = 10_000,
        help = "Deadline for each handshake reply"
    )]
    pub handshake_timeout_ms: u64,

    #[arg(
        long,
        env = "ROULETTE_ANSWER_ACK_GRACE_MS",
        default_value_t = 1_000,
        help = "How long to wait for an optional answerAck"
    )]
    pub answer_ack_grace_ms: u64,
}

impl Cli {
    pub fn to_config(&self) -> MatchConfig {
        MatchConfig {
            match_interval: Duration::from_millis(self.match_interval_ms.max(1)),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            answer_ack_grace: Duration::from_millis(self.answer_ack_grace_ms),
            ..MatchConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_values() {
        let cli = Cli::parse_from(["roulette-match"]);
        let config = cli.to_config();
        assert_eq!(config.match_interval, Duration::from_secs(5));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(cli.bind.port(), 8080);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cli = Cli::parse_from(["roulette-match", "--match-interval-ms", "0"]);
        assert_eq!(cli.to_config().match_interval, Duration::from_millis(1));
    }
}
