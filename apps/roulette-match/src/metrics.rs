use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Matchmaking counters, owned by one server instance.
pub struct MatchMetrics {
    registry: Registry,
    pub started: IntCounter,
    pub succeeded: IntCounter,
    pub failed: IntCounter,
    pub pairs: IntCounter,
    pub left: IntCounter,
    pub active: IntGauge,
    pub waiting: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid counter descriptor");
    registry.register(Box::new(c.clone())).ok();
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("valid gauge descriptor");
    registry.register(Box::new(g.clone())).ok();
    g
}

impl MatchMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        Self {
            started: counter(
                &registry,
                "roulette_match_clients_started_total",
                "Signaling clients accepted",
            ),
            succeeded: counter(
                &registry,
                "roulette_match_clients_succeeded_total",
                "Clients closed after a completed handshake",
            ),
            failed: counter(
                &registry,
                "roulette_match_clients_failed_total",
                "Clients closed after a failed handshake",
            ),
            pairs: counter(
                &registry,
                "roulette_match_pairs_total",
                "Pairings attempted by the matching tick",
            ),
            left: counter(
                &registry,
                "roulette_match_clients_left_total",
                "Clients that disconnected while waiting in the lobby",
            ),
            active: gauge(
                &registry,
                "roulette_match_active_connections",
                "Open signaling connections",
            ),
            waiting: gauge(
                &registry,
                "roulette_match_waiting_connections",
                "Connections waiting in the lobby",
            ),
            registry,
        }
    }

    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf).ok();
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
