use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use axum::extract::ws::WebSocket;
use rand::seq::SliceRandom;
use signal_proto::close;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::MatchConfig;
use crate::conn::{ConnectionHandle, Departure, MatchError};
use crate::lobby::{pair_up, ConnId, Lobby};
use crate::metrics::MatchMetrics;

/// Point-in-time view of the server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pairs: u64,
    pub left: u64,
    pub active: i64,
    pub waiting: usize,
}

/// Matchmaking state: the lobby, the identity counter and the metrics.
///
/// Everything is owned by the instance so several servers can run side by
/// side in one process.
pub struct MatchServer {
    config: MatchConfig,
    lobby: Lobby<Arc<ConnectionHandle>>,
    next_id: AtomicU64,
    metrics: MatchMetrics,
}

impl MatchServer {
    pub fn new(config: MatchConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            lobby: Lobby::new(),
            next_id: AtomicU64::new(0),
            metrics: MatchMetrics::new(),
        })
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MatchMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> MatchStats {
        MatchStats {
            started: self.metrics.started.get(),
            succeeded: self.metrics.succeeded.get(),
            failed: self.metrics.failed.get(),
            pairs: self.metrics.pairs.get(),
            left: self.metrics.left.get(),
            active: self.metrics.active.get(),
            waiting: self.lobby.len(),
        }
    }

    /// Takes ownership of a freshly upgraded socket, parks it in the lobby and
    /// starts its reader task.
    pub fn admit(self: &Arc<Self>, socket: WebSocket) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (handle, pump) = ConnectionHandle::new(
            id,
            socket,
            self.config.handshake_timeout,
            self.metrics.active.clone(),
        );
        self.metrics.started.inc();
        self.lobby.add(Arc::new(handle));
        self.metrics.waiting.set(self.lobby.len() as i64);
        debug!(conn_id = id, "client waiting for a partner");

        let server = Arc::downgrade(self);
        tokio::spawn(async move {
            let departure = pump.run().await;
            depart(&server, id, departure);
        });
        id
    }

    /// Drains the lobby, shuffles it and starts a handshake for every pair.
    /// Returns the number of pairs started.
    pub fn tick(self: &Arc<Self>) -> usize {
        let mut waiting = self.lobby.drain_all();
        waiting.shuffle(&mut rand::thread_rng());
        let (pairs, leftover) = pair_up(waiting);
        if let Some(handle) = leftover {
            self.lobby.add(handle);
        }
        self.metrics.waiting.set(self.lobby.len() as i64);

        let count = pairs.len();
        for (first, second) in pairs {
            self.metrics.pairs.inc();
            tokio::spawn(Arc::clone(self).run_pair(first, second));
        }
        if count > 0 {
            debug!(pairs = count, "matching tick");
        }
        count
    }

    /// Runs matching ticks until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.match_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
        debug!("matching loop stopped");
    }

    async fn run_pair(self: Arc<Self>, first: Arc<ConnectionHandle>, second: Arc<ConnectionHandle>) {
        let (a, b) = (first.id(), second.id());
        info!(offerer = a, answerer = b, "pairing clients");

        let deadline = self.config.close_timeout;
        match self.relay_handshake(&first, &second).await {
            Ok(()) => {
                tokio::join!(
                    first.close(close::NORMAL, "", deadline),
                    second.close(close::NORMAL, "", deadline),
                );
                self.metrics.succeeded.inc_by(2);
                info!(conn_id = a, partner = b, reason = "complete", "client closed");
                info!(conn_id = b, partner = a, reason = "complete", "client closed");
            }
            Err(err) => {
                let code = err.close_code();
                let reason = if code == close::PROTOCOL {
                    "protocol error"
                } else {
                    "handshake failed"
                };
                tokio::join!(
                    first.close(code, reason, deadline),
                    second.close(code, reason, deadline),
                );
                self.metrics.failed.inc_by(2);
                warn!(conn_id = a, partner = b, failed_conn = err.conn_id(), error = %err, "client closed");
                warn!(conn_id = b, partner = a, failed_conn = err.conn_id(), error = %err, "client closed");
            }
        }
    }

    /// Drops a waiting client whose connection ended. Clients already handed
    /// to a pairing are left to it; their handshake fails on its own.
    fn evict(&self, id: ConnId, departure: Departure) {
        if self.lobby.remove(id).is_some() {
            self.metrics.left.inc();
            self.metrics.waiting.set(self.lobby.len() as i64);
            info!(conn_id = id, reason = departure.as_str(), "client left while waiting");
        } else {
            trace!(conn_id = id, reason = departure.as_str(), "reader stopped");
        }
    }

    async fn relay_handshake(
        &self,
        offerer: &ConnectionHandle,
        answerer: &ConnectionHandle,
    ) -> Result<(), MatchError> {
        let offer = offerer.request_offer().await?;
        let answer = answerer.send_offer(offer).await?;
        if let Some(ack) = offerer
            .send_answer(answer, self.config.answer_ack_grace)
            .await?
        {
            // The answerer is finished by now and may have hung up already.
            if let Err(err) = answerer.send(&ack).await {
                debug!(conn_id = answerer.id(), error = %err, "answerAck not relayed");
            }
        }
        Ok(())
    }
}

fn depart(server: &Weak<MatchServer>, id: ConnId, departure: Departure) {
    if let Some(server) = server.upgrade() {
        server.evict(id, departure);
    }
}
