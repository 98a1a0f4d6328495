use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// How often the lobby is drained and paired.
    pub match_interval: Duration,
    /// Deadline for each handshake reply from a client.
    pub handshake_timeout: Duration,
    /// How long to wait for the optional `answerAck` after relaying an answer.
    pub answer_ack_grace: Duration,
    /// Deadline for writing a close frame to a peer that may already be gone.
    pub close_timeout: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            match_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            answer_ack_grace: Duration::from_secs(1),
            close_timeout: Duration::from_millis(100),
        }
    }
}
