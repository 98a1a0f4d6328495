use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;
use webrtc::stun::agent::TransactionId;
use webrtc::stun::message::{Getter, Message, BINDING_REQUEST};
use webrtc::stun::xoraddr::XorMappedAddress;

pub const DEFAULT_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },
    #[error("{0} resolved to no addresses")]
    NoAddress(String),
    #[error("probe socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stun error: {0}")]
    Stun(#[from] webrtc::stun::Error),
    #[error("no reply from {server} within {timeout:?}")]
    TimedOut { server: String, timeout: Duration },
}

/// A cheap "can we reach the outside world" check run before each attempt.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), PreflightError>;
}

/// Sends one STUN binding request and waits for the matching response.
pub struct StunProbe {
    server: String,
    timeout: Duration,
}

impl StunProbe {
    /// `server` is `host:port`, without the `stun:` scheme.
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    async fn exchange(&self) -> Result<SocketAddr, PreflightError> {
        let target = tokio::net::lookup_host(&self.server)
            .await
            .map_err(|source| PreflightError::Resolve {
                host: self.server.clone(),
                source,
            })?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| PreflightError::NoAddress(self.server.clone()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mut request = Message::new();
        request.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;
        socket.send_to(&request.raw, target).await?;

        let mut buf = vec![0u8; 1500];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != target {
                continue;
            }
            let mut response = Message::new();
            response.raw = buf[..len].to_vec();
            if response.decode().is_err() || response.transaction_id != request.transaction_id {
                debug!(len, "ignoring unrelated datagram");
                continue;
            }
            let mut mapped = XorMappedAddress::default();
            mapped.get_from(&response)?;
            return Ok(SocketAddr::new(mapped.ip, mapped.port));
        }
    }
}

#[async_trait]
impl ReachabilityProbe for StunProbe {
    async fn probe(&self) -> Result<(), PreflightError> {
        match tokio::time::timeout(self.timeout, self.exchange()).await {
            Ok(Ok(public)) => {
                debug!(server = %self.server, %public, "preflight ok");
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PreflightError::TimedOut {
                server: self.server.clone(),
                timeout: self.timeout,
            }),
        }
    }
}
