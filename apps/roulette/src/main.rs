use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use roulette_client_core::cli::Cli;
use roulette_client_core::media::pattern::{PatternConfig, TestPatternCapture};
use roulette_client_core::media::raw::{RawLumaDecoder, RawLumaEncoder};
use roulette_client_core::preflight::StunProbe;
use roulette_client_core::session::{SessionConfig, WebRtcSessionFactory};
use roulette_client_core::signaling::WebSocketMatchmaker;
use roulette_client_core::logging;
use roulette_client_core::ui::{ConsoleSink, StatusSink, UiEvent};
use roulette_client_core::{Collaborators, Orchestrator, OrchestratorHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initializing logging")?;

    let config = cli.timing.to_config();
    info!(
        signal_url = %cli.signal_url,
        stun = %cli.stun_server,
        "starting roulette client"
    );

    let matchmaker = WebSocketMatchmaker::new(&cli.signal_url)
        .with_context(|| format!("invalid signaling url {}", cli.signal_url))?;
    let sessions = WebRtcSessionFactory::new(SessionConfig {
        ice_servers: vec![cli.ice_server()],
        include_loopback: cli.include_loopback,
    });
    let probe = StunProbe::new(cli.stun_server.clone(), config.preflight_timeout);

    let stop_capture = CancellationToken::new();
    let capture = TestPatternCapture::new();
    let capture_task = capture.start(
        Box::new(RawLumaEncoder::default()),
        PatternConfig::default(),
        stop_capture.clone(),
    );

    let console = Arc::new(ConsoleSink::stdout());
    let (orchestrator, handle) = Orchestrator::new(
        config,
        Collaborators {
            probe: Arc::new(probe),
            sessions: Arc::new(sessions),
            matchmaker: Arc::new(matchmaker),
            capture: Arc::new(capture),
            decoder: Box::new(RawLumaDecoder::new()),
            ui: console.clone(),
        },
    );

    let input = tokio::spawn(read_commands(handle.clone(), console, stdin_lines()));
    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.quit();
        }
    });

    orchestrator.run().await;

    stop_capture.cancel();
    capture_task.await.ok();
    input.abort();
    Ok(())
}

/// Reads stdin on a plain thread so a pending read never holds up runtime
/// shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Console commands: `/next` skips the partner, `/quit` leaves, `/frame`
/// shows the last picture's brightness, anything else is chat.
async fn read_commands(
    handle: OrchestratorHandle,
    console: Arc<ConsoleSink<std::io::Stdout>>,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        match line.trim() {
            "/next" => handle.next(),
            "/quit" => break,
            "/frame" => {
                let status = match console.brightness() {
                    Some(level) => format!("Last frame brightness: {level}"),
                    None => "No video".to_owned(),
                };
                console.dispatch(UiEvent::Status(status));
            }
            text => handle.send_chat(text),
        }
    }
    handle.quit();
}
