//! Client side of the matchmaking handshake.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use signal_proto::{close, Handshake, HandshakeAction, ProtocolError, SignalMessage};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use crate::session::SessionError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The local half of a negotiation: produces and consumes session
/// descriptions in their `{type, sdp}` JSON form.
#[async_trait]
pub trait DescriptionEndpoint: Send + Sync {
    /// Creates an offer and applies it locally.
    async fn local_offer(&self) -> Result<Value, SessionError>;
    /// Applies a remote offer, then creates and applies the answer.
    async fn answer_offer(&self, offer: Value) -> Result<Value, SessionError>;
    async fn accept_answer(&self, answer: Value) -> Result<(), SessionError>;
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid signaling url {url}: {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },
    #[error("failed to reach signaling server: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("signaling transport error: {0}")]
    Transport(#[source] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session error during handshake: {0}")]
    Session(#[from] SessionError),
    #[error("no match found")]
    NoMatch,
    #[error("signaling server closed the handshake ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("signaling connection closed")]
    Closed,
    #[error("cancelled")]
    Cancelled,
}

/// Finds a partner and negotiates with it through `endpoint`.
#[async_trait]
pub trait Matchmaker: Send + Sync {
    async fn negotiate(
        &self,
        endpoint: &dyn DescriptionEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(), SignalError>;
}

pub struct WebSocketMatchmaker {
    url: Url,
    linger: Duration,
}

impl WebSocketMatchmaker {
    pub fn new(url: &str) -> Result<Self, SignalError> {
        let url = Url::parse(url).map_err(|source| SignalError::Url {
            url: url.to_owned(),
            source,
        })?;
        Ok(Self {
            url,
            linger: Duration::from_secs(2),
        })
    }

    /// How long to wait for the server's close after the handshake is done.
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

#[async_trait]
impl Matchmaker for WebSocketMatchmaker {
    async fn negotiate(
        &self,
        endpoint: &dyn DescriptionEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(), SignalError> {
        let socket = tokio::select! {
            _ = cancel.cancelled() => return Err(SignalError::Cancelled),
            result = connect_async(self.url.as_str()) => result.map_err(SignalError::Connect)?.0,
        };
        debug!(url = %self.url, "connected to signaling server");
        run_handshake(socket, endpoint, cancel, self.linger).await
    }
}

async fn send(socket: &mut Socket, message: &SignalMessage) -> Result<(), SignalError> {
    trace!(kind = %message.kind, "signal out");
    socket
        .send(Message::Text(message.to_json()))
        .await
        .map_err(SignalError::Transport)
}

async fn close_normally(socket: &mut Socket) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(err) = socket.close(Some(frame)).await {
        trace!(error = %err, "close after cancel failed");
    }
}

/// Drives `Handshake` over an open socket until it completes, the server
/// closes, or `cancel` fires.
pub async fn run_handshake(
    mut socket: Socket,
    endpoint: &dyn DescriptionEndpoint,
    cancel: &CancellationToken,
    linger: Duration,
) -> Result<(), SignalError> {
    let mut handshake = Handshake::new();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                close_normally(&mut socket).await;
                return Err(SignalError::Cancelled);
            }
            frame = socket.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
            Some(Ok(Message::Close(frame))) => {
                return Err(closed_early(frame));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(SignalError::Transport(err)),
            None => return Err(SignalError::Closed),
        };

        let message = SignalMessage::from_json(&text)?;
        trace!(kind = %message.kind, state = %handshake.state(), "signal in");
        match handshake.receive(message)? {
            HandshakeAction::CreateOffer => {
                info!("creating offer");
                let offer = step(&mut socket, cancel, endpoint.local_offer()).await?;
                let reply = handshake.local_description_ready(offer)?;
                send(&mut socket, &reply).await?;
            }
            HandshakeAction::AnswerOffer(offer) => {
                info!("answering offer");
                let answer = step(&mut socket, cancel, endpoint.answer_offer(offer)).await?;
                let reply = handshake.local_description_ready(answer)?;
                send(&mut socket, &reply).await?;
            }
            HandshakeAction::AcceptAnswer(answer) => {
                info!("applying answer");
                step(&mut socket, cancel, endpoint.accept_answer(answer)).await?;
                if let Err(err) = send(&mut socket, &SignalMessage::answer_ack()).await {
                    debug!(error = %err, "answerAck not delivered");
                }
            }
            HandshakeAction::Acknowledged => {}
        }

        if handshake.is_complete() {
            await_server_close(&mut socket, cancel, linger).await;
            return Ok(());
        }
    }
}

/// Runs one endpoint call, abandoning it if `cancel` fires first. ICE
/// gathering inside these calls can take seconds.
async fn step<T>(
    socket: &mut Socket,
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SignalError> {
    tokio::select! {
        _ = cancel.cancelled() => {
            close_normally(socket).await;
            Err(SignalError::Cancelled)
        }
        result = work => Ok(result?),
    }
}

fn closed_early(frame: Option<CloseFrame<'_>>) -> SignalError {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            if code == close::NORMAL {
                SignalError::NoMatch
            } else {
                SignalError::Rejected {
                    code,
                    reason: frame.reason.into_owned(),
                }
            }
        }
        None => SignalError::NoMatch,
    }
}

/// After completion the server only has an optional `answerAck` and its
/// close frame left to send. Neither is required.
async fn await_server_close(socket: &mut Socket, cancel: &CancellationToken, linger: Duration) {
    let drain = async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Close(frame)) => {
                    trace!(?frame, "server closed signaling");
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::timeout(linger, drain) => {}
    }
}
