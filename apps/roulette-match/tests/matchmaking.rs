use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use roulette_match::{MatchConfig, MatchServer};
use serde_json::json;
use signal_proto::{close, SignalKind, SignalMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    server: Arc<MatchServer>,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(config: MatchConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = roulette_match::spawn(listener, config, shutdown.clone());
        Self {
            server,
            addr,
            shutdown,
        }
    }

    async fn connect(&self) -> Client {
        let (socket, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        socket
    }

    async fn http_get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn fast_config() -> MatchConfig {
    MatchConfig {
        match_interval: Duration::from_millis(20),
        handshake_timeout: Duration::from_secs(2),
        answer_ack_grace: Duration::from_millis(500),
        ..MatchConfig::default()
    }
}

async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn send_signal(client: &mut Client, message: SignalMessage) {
    client.send(Message::Text(message.to_json())).await.unwrap();
}

/// Next signaling message, or `Err(code)` when the server closes instead.
async fn next_event(client: &mut Client) -> Result<SignalMessage, u16> {
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => return Ok(SignalMessage::from_json(&text).unwrap()),
            Some(Ok(Message::Close(frame))) => {
                return Err(frame.map(|f| u16::from(f.code)).unwrap_or(close::NORMAL))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => panic!("socket error: {err}"),
            None => return Err(0),
        }
    }
}

async fn close_code(client: &mut Client) -> u16 {
    loop {
        match next_event(client).await {
            Ok(_) => continue,
            Err(code) => return code,
        }
    }
}

/// Plays one side of the handshake and returns the first instruction it got
/// along with the close code it was sent afterwards.
async fn well_behaved_peer(mut client: Client) -> (SignalKind, u16) {
    let first = next_event(&mut client).await.expect("first signal");
    match first.kind {
        SignalKind::RequestOffer => {
            send_signal(&mut client, SignalMessage::offer(json!({"type": "offer", "sdp": "o"}))).await;
            let answer = next_event(&mut client).await.expect("answer");
            assert_eq!(answer.kind, SignalKind::Answer);
            assert_eq!(answer.payload, Some(json!({"type": "answer", "sdp": "a"})));
            send_signal(&mut client, SignalMessage::answer_ack()).await;
        }
        SignalKind::Offer => {
            assert_eq!(first.payload, Some(json!({"type": "offer", "sdp": "o"})));
            send_signal(&mut client, SignalMessage::answer(json!({"type": "answer", "sdp": "a"}))).await;
        }
        other => panic!("unexpected first signal {other}"),
    }
    (first.kind, close_code(&mut client).await)
}

#[test_timeout::tokio_timeout_test(20)]
async fn two_clients_complete_a_handshake() {
    let harness = Harness::start(fast_config()).await;
    let first = tokio::spawn(well_behaved_peer(harness.connect().await));
    let second = tokio::spawn(well_behaved_peer(harness.connect().await));

    let (kind_a, code_a) = first.await.unwrap();
    let (kind_b, code_b) = second.await.unwrap();

    let mut kinds = [kind_a, kind_b];
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(kinds, [SignalKind::Offer, SignalKind::RequestOffer]);
    assert_eq!(code_a, close::NORMAL);
    assert_eq!(code_b, close::NORMAL);

    let server = Arc::clone(&harness.server);
    wait_until(|| {
        let server = Arc::clone(&server);
        async move { server.stats().active == 0 }
    })
    .await;
    let stats = harness.server.stats();
    assert_eq!(stats.started, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pairs, 1);
}

/// Answers a request for an offer with garbage and reports the close code.
async fn malformed_peer(mut client: Client) -> u16 {
    match next_event(&mut client).await {
        Ok(first) => {
            assert_eq!(first.kind, SignalKind::RequestOffer);
            client
                .send(Message::Text(r#"{"type":"bogus"}"#.into()))
                .await
                .unwrap();
            close_code(&mut client).await
        }
        Err(code) => code,
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn malformed_reply_closes_both_with_protocol_error() {
    let harness = Harness::start(fast_config()).await;
    let first = tokio::spawn(malformed_peer(harness.connect().await));
    let second = tokio::spawn(malformed_peer(harness.connect().await));

    assert_eq!(first.await.unwrap(), close::PROTOCOL);
    assert_eq!(second.await.unwrap(), close::PROTOCOL);

    let server = Arc::clone(&harness.server);
    wait_until(|| {
        let server = Arc::clone(&server);
        async move { server.stats().failed == 2 }
    })
    .await;
    assert_eq!(harness.server.stats().succeeded, 0);
}

#[test_timeout::tokio_timeout_test(20)]
async fn silent_partner_times_out_with_internal_error() {
    let harness = Harness::start(MatchConfig {
        handshake_timeout: Duration::from_millis(200),
        ..fast_config()
    })
    .await;
    let mut a = harness.connect().await;
    let mut b = harness.connect().await;

    // Neither side answers; the first request times out.
    assert_eq!(close_code(&mut a).await, close::INTERNAL);
    assert_eq!(close_code(&mut b).await, close::INTERNAL);
}

#[test_timeout::tokio_timeout_test(20)]
async fn odd_client_waits_for_next_tick() {
    let harness = Harness::start(MatchConfig {
        match_interval: Duration::from_secs(3_600),
        ..fast_config()
    })
    .await;
    let _clients = vec![
        harness.connect().await,
        harness.connect().await,
        harness.connect().await,
    ];

    let server = Arc::clone(&harness.server);
    wait_until(|| {
        let server = Arc::clone(&server);
        async move { server.stats().waiting == 3 }
    })
    .await;

    assert_eq!(harness.server.tick(), 1);
    let stats = harness.server.stats();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.pairs, 1);
    assert_eq!(stats.active, 3);
}

#[test_timeout::tokio_timeout_test(20)]
async fn client_leaving_the_lobby_is_evicted() {
    let harness = Harness::start(MatchConfig {
        match_interval: Duration::from_secs(3_600),
        ..fast_config()
    })
    .await;
    let server = Arc::clone(&harness.server);

    let mut quitter = harness.connect().await;
    wait_until(|| {
        let server = Arc::clone(&server);
        async move { server.stats().waiting == 1 }
    })
    .await;
    quitter.close(None).await.unwrap();
    wait_until(|| {
        let server = Arc::clone(&server);
        async move {
            let stats = server.stats();
            stats.waiting == 0 && stats.active == 0 && stats.left == 1
        }
    })
    .await;

    let mut stayer = harness.connect().await;
    wait_until(|| {
        let server = Arc::clone(&server);
        async move { server.stats().waiting == 1 }
    })
    .await;
    assert_eq!(harness.server.tick(), 0);
    let stats = harness.server.stats();
    assert_eq!(stats.pairs, 0);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.waiting, 1);

    // Nobody was paired with the departed client, so nothing closes us.
    let quiet = tokio::time::timeout(Duration::from_millis(200), next_event(&mut stayer)).await;
    assert!(quiet.is_err(), "unexpected {quiet:?}");

    // A real partner still gets through.
    let partner = tokio::spawn(well_behaved_peer(harness.connect().await));
    wait_until(|| {
        let server = Arc::clone(&server);
        async move { server.stats().waiting == 2 }
    })
    .await;
    assert_eq!(harness.server.tick(), 1);
    let mine = well_behaved_peer(stayer).await;
    let theirs = partner.await.unwrap();
    assert_eq!(mine.1, close::NORMAL);
    assert_eq!(theirs.1, close::NORMAL);
}

#[test_timeout::tokio_timeout_test(20)]
async fn status_and_metrics_endpoints() {
    let harness = Harness::start(fast_config()).await;

    let status = harness.http_get("/").await;
    assert!(status.starts_with("HTTP/1.1 200"));
    assert!(status.contains("\"app\": \"roulette\""));
    assert!(status.contains("\"service\": \"matchmaker\""));
    assert!(status.contains(&format!("\"version\": \"{}\"", env!("CARGO_PKG_VERSION"))));
    assert!(!status.contains("invalid"));

    let metrics = harness.http_get("/metrics").await;
    assert!(metrics.contains("roulette_match_clients_started_total 0"));
    assert!(metrics.contains("roulette_match_active_connections 0"));
}
