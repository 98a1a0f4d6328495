use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prometheus::IntGauge;
use serde_json::Value;
use signal_proto::{close, expect_kind, ProtocolError, SignalKind, SignalMessage};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::lobby::{ConnId, LobbyMember};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("conn {conn_id}: {stage}: write failed: {source}")]
    Write {
        conn_id: ConnId,
        stage: &'static str,
        source: axum::Error,
    },
    #[error("conn {conn_id}: {stage}: read failed: {source}")]
    Read {
        conn_id: ConnId,
        stage: &'static str,
        source: axum::Error,
    },
    #[error("conn {conn_id}: {stage}: connection closed")]
    Closed { conn_id: ConnId, stage: &'static str },
    #[error("conn {conn_id}: {stage}: timed out waiting for reply")]
    Timeout { conn_id: ConnId, stage: &'static str },
    #[error("conn {conn_id}: {stage}: {source}")]
    Protocol {
        conn_id: ConnId,
        stage: &'static str,
        source: ProtocolError,
    },
}

impl MatchError {
    pub fn close_code(&self) -> u16 {
        match self {
            MatchError::Protocol { .. } => close::PROTOCOL,
            _ => close::INTERNAL,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        match self {
            MatchError::Write { conn_id, .. }
            | MatchError::Read { conn_id, .. }
            | MatchError::Closed { conn_id, .. }
            | MatchError::Timeout { conn_id, .. }
            | MatchError::Protocol { conn_id, .. } => *conn_id,
        }
    }
}

/// Decrements the active-connection gauge when the handle goes away.
struct ActiveGuard(IntGauge);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Frames a client may send before the handshake reads them. A client that
/// overruns this while nobody is listening is dropped.
const INBOX_DEPTH: usize = 16;

type Inbound = Result<Message, axum::Error>;

/// Why a connection's reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The client sent a close frame.
    Closed,
    /// The stream ended or failed without a close frame.
    HungUp,
    /// The client sent more than the inbox holds.
    Flooded,
    /// The handle was dropped; nobody reads this client any more.
    Released,
}

impl Departure {
    pub fn as_str(self) -> &'static str {
        match self {
            Departure::Closed => "closed",
            Departure::HungUp => "hung up",
            Departure::Flooded => "flooded",
            Departure::Released => "released",
        }
    }
}

/// The read half of a client socket. Runs on its own task for the whole
/// life of the connection, so a client that leaves is noticed even while
/// nobody is waiting on a reply from it.
pub struct InboundPump {
    id: ConnId,
    stream: SplitStream<WebSocket>,
    inbox: mpsc::Sender<Inbound>,
}

impl InboundPump {
    /// Forwards frames to the handle until the client goes away.
    pub async fn run(mut self) -> Departure {
        loop {
            let frame = tokio::select! {
                _ = self.inbox.closed() => return Departure::Released,
                frame = self.stream.next() => frame,
            };
            let (frame, last) = match frame {
                None => return Departure::HungUp,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(frame @ Message::Close(_))) => (Ok(frame), Some(Departure::Closed)),
                Some(Ok(frame)) => (Ok(frame), None),
                Some(Err(err)) => (Err(err), Some(Departure::HungUp)),
            };
            match self.inbox.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(conn_id = self.id, "client overran its inbox");
                    return Departure::Flooded;
                }
                Err(TrySendError::Closed(_)) => return Departure::Released,
            }
            if let Some(departure) = last {
                return departure;
            }
        }
    }
}

/// One signaling client, owned by the lobby while it waits and by a pairing
/// task while its handshake runs. The read half lives in an [`InboundPump`].
pub struct ConnectionHandle {
    id: ConnId,
    sink: AsyncMutex<SplitSink<WebSocket, Message>>,
    inbox: AsyncMutex<mpsc::Receiver<Inbound>>,
    read_timeout: Duration,
    closed: AtomicBool,
    _active: ActiveGuard,
}

impl LobbyMember for ConnectionHandle {
    fn id(&self) -> ConnId {
        self.id
    }
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnId,
        socket: WebSocket,
        read_timeout: Duration,
        active: IntGauge,
    ) -> (Self, InboundPump) {
        active.inc();
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let handle = Self {
            id,
            sink: AsyncMutex::new(sink),
            inbox: AsyncMutex::new(rx),
            read_timeout,
            closed: AtomicBool::new(false),
            _active: ActiveGuard(active),
        };
        let pump = InboundPump {
            id,
            stream,
            inbox: tx,
        };
        (handle, pump)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Asks this client to create an offer and returns it.
    pub async fn request_offer(&self) -> Result<Value, MatchError> {
        const STAGE: &str = "request offer";
        let reply = self
            .rpc(STAGE, SignalMessage::request_offer(), SignalKind::Offer)
            .await?;
        self.description(STAGE, reply)
    }

    /// Forwards an offer and returns the client's answer.
    pub async fn send_offer(&self, offer: Value) -> Result<Value, MatchError> {
        const STAGE: &str = "send offer";
        let reply = self
            .rpc(STAGE, SignalMessage::offer(offer), SignalKind::Answer)
            .await?;
        self.description(STAGE, reply)
    }

    /// Forwards an answer, then waits up to `grace` for the optional
    /// acknowledgement. Silence or a hang-up after the answer is not an error.
    pub async fn send_answer(
        &self,
        answer: Value,
        grace: Duration,
    ) -> Result<Option<SignalMessage>, MatchError> {
        const STAGE: &str = "send answer";
        let mut sink = self.sink.lock().await;
        self.write(&mut sink, STAGE, &SignalMessage::answer(answer))
            .await?;
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(grace, self.read(&mut inbox, STAGE)).await {
            Ok(Ok(reply)) => {
                expect_kind(&reply, SignalKind::AnswerAck).map_err(|source| {
                    MatchError::Protocol {
                        conn_id: self.id,
                        stage: STAGE,
                        source,
                    }
                })?;
                Ok(Some(reply))
            }
            Ok(Err(err @ MatchError::Protocol { .. })) => Err(err),
            Ok(Err(err)) => {
                debug!(conn_id = self.id, error = %err, "no answerAck before hang-up");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    /// Writes a single message without waiting for a reply.
    pub async fn send(&self, message: &SignalMessage) -> Result<(), MatchError> {
        let mut sink = self.sink.lock().await;
        self.write(&mut sink, "send", message).await
    }

    /// Sends a close frame under `deadline`. Only the first call has an effect.
    pub async fn close(&self, code: u16, reason: &str, deadline: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_owned()),
        };
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(deadline, sink.send(Message::Close(Some(frame)))).await {
            Ok(Ok(())) => trace!(conn_id = self.id, code, "close frame sent"),
            Ok(Err(err)) => debug!(conn_id = self.id, error = %err, "close frame write failed"),
            Err(_) => debug!(conn_id = self.id, "close frame write timed out"),
        }
    }

    async fn rpc(
        &self,
        stage: &'static str,
        request: SignalMessage,
        expected: SignalKind,
    ) -> Result<SignalMessage, MatchError> {
        let mut sink = self.sink.lock().await;
        self.write(&mut sink, stage, &request).await?;
        let mut inbox = self.inbox.lock().await;
        let reply = tokio::time::timeout(self.read_timeout, self.read(&mut inbox, stage))
            .await
            .map_err(|_| MatchError::Timeout {
                conn_id: self.id,
                stage,
            })??;
        expect_kind(&reply, expected).map_err(|source| MatchError::Protocol {
            conn_id: self.id,
            stage,
            source,
        })?;
        Ok(reply)
    }

    fn description(&self, stage: &'static str, reply: SignalMessage) -> Result<Value, MatchError> {
        reply
            .into_description()
            .map_err(|source| MatchError::Protocol {
                conn_id: self.id,
                stage,
                source,
            })
    }

    async fn write(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        stage: &'static str,
        message: &SignalMessage,
    ) -> Result<(), MatchError> {
        trace!(conn_id = self.id, kind = %message.kind, "signal out");
        sink
            .send(Message::Text(message.to_json()))
            .await
            .map_err(|source| MatchError::Write {
                conn_id: self.id,
                stage,
                source,
            })
    }

    async fn read(
        &self,
        inbox: &mut mpsc::Receiver<Inbound>,
        stage: &'static str,
    ) -> Result<SignalMessage, MatchError> {
        loop {
            let frame = match inbox.recv().await {
                Some(Ok(frame)) => frame,
                Some(Err(source)) => {
                    return Err(MatchError::Read {
                        conn_id: self.id,
                        stage,
                        source,
                    })
                }
                None => {
                    return Err(MatchError::Closed {
                        conn_id: self.id,
                        stage,
                    })
                }
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => {
                    return Err(MatchError::Closed {
                        conn_id: self.id,
                        stage,
                    })
                }
            };
            let message = SignalMessage::from_json(&text).map_err(|source| MatchError::Protocol {
                conn_id: self.id,
                stage,
                source,
            })?;
            trace!(conn_id = self.id, kind = %message.kind, "signal in");
            return Ok(message);
        }
    }
}
