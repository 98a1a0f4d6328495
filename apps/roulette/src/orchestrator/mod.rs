//! The outer connection loop: preflight, negotiate, watch, tear down, retry.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::media::{CapturePipeline, VideoDecoder};
use crate::preflight::ReachabilityProbe;
use crate::session::{ConnectivityState, PeerSession, SessionEvent, SessionEvents, SessionFactory};
use crate::signaling::{Matchmaker, SignalError};
use crate::ui::{StatusSink, UiEvent};
use backoff::Backoff;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub preflight_timeout: Duration,
    /// From handshake completion until connectivity first reaches `Connected`.
    pub connect_timeout: Duration,
    /// Longest gap between decoded frames once video has started.
    pub frame_timeout: Duration,
    pub max_backoff_exponent: u32,
    /// Pause between attempts, on top of any backoff.
    pub retry_pause: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            preflight_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(5),
            max_backoff_exponent: backoff::DEFAULT_MAX_EXPONENT,
            retry_pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchFailure {
    NoMatch,
    Error(String),
}

/// Why an attempt ended. Exactly one per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Normal,
    SetupError(String),
    MatchError(MatchFailure),
    TimedOut,
    Disconnected,
    PartnerLeft,
}

impl SessionOutcome {
    pub fn status_line(&self) -> String {
        match self {
            SessionOutcome::Normal => "Session ended".to_owned(),
            SessionOutcome::SetupError(err) => format!("Setup error: {err}"),
            SessionOutcome::MatchError(MatchFailure::NoMatch) => "No match found".to_owned(),
            SessionOutcome::MatchError(MatchFailure::Error(err)) => {
                format!("Connection error: {err}")
            }
            SessionOutcome::TimedOut => "Connection timed out".to_owned(),
            SessionOutcome::Disconnected => "Disconnected".to_owned(),
            SessionOutcome::PartnerLeft => "Partner left".to_owned(),
        }
    }

    /// Outcomes that point at a fault on our side of the network and so
    /// back off before retrying. Stalls, departures and an empty lobby retry
    /// at once.
    pub fn is_operational_failure(&self) -> bool {
        matches!(
            self,
            SessionOutcome::SetupError(_) | SessionOutcome::MatchError(MatchFailure::Error(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttemptReport {
    outcome: SessionOutcome,
    connected: bool,
}

impl AttemptReport {
    fn ended(outcome: SessionOutcome) -> Self {
        Self {
            outcome,
            connected: false,
        }
    }
}

#[derive(Debug)]
enum Command {
    Chat(String),
}

struct Control {
    root: CancellationToken,
    attempt: Mutex<Option<CancellationToken>>,
}

/// Remote control for a running orchestrator, handed to the input side.
#[derive(Clone)]
pub struct OrchestratorHandle {
    control: Arc<Control>,
    commands: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    /// Abandons the current partner; the loop starts a new attempt.
    pub fn next(&self) {
        if let Some(attempt) = self.control.attempt.lock().as_ref() {
            attempt.cancel();
        }
    }

    /// Stops the loop for good.
    pub fn quit(&self) {
        self.control.root.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.control.root.is_cancelled()
    }

    pub fn send_chat(&self, text: impl Into<String>) {
        if self.commands.send(Command::Chat(text.into())).is_err() {
            trace!("orchestrator gone, chat dropped");
        }
    }
}

pub struct Collaborators {
    pub probe: Arc<dyn ReachabilityProbe>,
    pub sessions: Arc<dyn SessionFactory>,
    pub matchmaker: Arc<dyn Matchmaker>,
    pub capture: Arc<dyn CapturePipeline>,
    pub decoder: Box<dyn VideoDecoder + Sync>,
    pub ui: Arc<dyn StatusSink>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    parts: Collaborators,
    backoff: Backoff,
    control: Arc<Control>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, parts: Collaborators) -> (Self, OrchestratorHandle) {
        let control = Arc::new(Control {
            root: CancellationToken::new(),
            attempt: Mutex::new(None),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = OrchestratorHandle {
            control: Arc::clone(&control),
            commands: commands_tx,
        };
        let orchestrator = Self {
            backoff: Backoff::new(config.max_backoff_exponent),
            config,
            parts,
            control,
            commands: commands_rx,
            commands_open: true,
        };
        (orchestrator, handle)
    }

    /// Runs attempts until the handle quits.
    pub async fn run(mut self) {
        let root = self.control.root.clone();
        while !root.is_cancelled() {
            let scope = root.child_token();
            *self.control.attempt.lock() = Some(scope.clone());
            let report = self.attempt(&scope).await;
            *self.control.attempt.lock() = None;

            if report.connected {
                self.backoff.reset();
            }
            if root.is_cancelled() {
                break;
            }
            info!(outcome = ?report.outcome, "attempt finished");
            self.status(report.outcome.status_line());
            self.parts.ui.dispatch(UiEvent::ClearFrame);

            let mut wait = self.config.retry_pause;
            if report.outcome.is_operational_failure() {
                self.backoff.record_failure();
                let delay = self.backoff.delay();
                debug!(
                    failures = self.backoff.failures(),
                    delay_secs = delay.as_secs(),
                    "backing off"
                );
                wait += delay;
            }
            tokio::select! {
                _ = root.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }
        info!("connection loop stopped");
    }

    fn status(&self, line: impl Into<String>) {
        self.parts.ui.dispatch(UiEvent::Status(line.into()));
    }

    async fn attempt(&mut self, scope: &CancellationToken) -> AttemptReport {
        let preflight = tokio::select! {
            _ = scope.cancelled() => return AttemptReport::ended(SessionOutcome::Normal),
            result = tokio::time::timeout(self.config.preflight_timeout, self.parts.probe.probe()) => result,
        };
        match preflight {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "preflight failed");
                return AttemptReport::ended(SessionOutcome::SetupError(err.to_string()));
            }
            Err(_) => {
                warn!("preflight timed out");
                return AttemptReport::ended(SessionOutcome::SetupError(format!(
                    "reachability check timed out after {:?}",
                    self.config.preflight_timeout
                )));
            }
        }

        let (session, mut events) = match self.parts.sessions.create().await {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "could not create session");
                return AttemptReport::ended(SessionOutcome::SetupError(err.to_string()));
            }
        };
        self.parts.capture.set_output(Some(session.video_sender()));

        self.status("Searching for match...");
        let report = match self.parts.matchmaker.negotiate(session.endpoint(), scope).await {
            Err(err) if scope.is_cancelled() => {
                debug!(error = %err, "handshake cancelled");
                AttemptReport::ended(SessionOutcome::Normal)
            }
            Err(SignalError::NoMatch) => {
                AttemptReport::ended(SessionOutcome::MatchError(MatchFailure::NoMatch))
            }
            Err(err) => {
                warn!(error = %err, "handshake failed");
                AttemptReport::ended(SessionOutcome::MatchError(MatchFailure::Error(
                    err.to_string(),
                )))
            }
            Ok(()) => {
                self.status("Found match. Connecting...");
                self.watch(session.as_ref(), &mut events, scope).await
            }
        };

        self.teardown(session.as_ref(), report.connected).await;
        report
    }

    /// Blocks until the session ends one way or another.
    async fn watch(
        &mut self,
        session: &dyn PeerSession,
        events: &mut SessionEvents,
        scope: &CancellationToken,
    ) -> AttemptReport {
        self.discard_stale_commands();

        let connect_timer = sleep(self.config.connect_timeout);
        tokio::pin!(connect_timer);
        let mut connect_armed = true;
        let liveness = sleep(self.config.frame_timeout);
        tokio::pin!(liveness);
        let mut liveness_armed = false;
        let mut connected = false;

        let outcome = loop {
            tokio::select! {
                _ = scope.cancelled() => break SessionOutcome::Normal,
                _ = &mut connect_timer, if connect_armed => break SessionOutcome::TimedOut,
                _ = &mut liveness, if liveness_armed => break SessionOutcome::Disconnected,
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(Command::Chat(text)) => self.send_chat(session, text).await,
                    None => self.commands_open = false,
                },
                event = events.recv() => {
                    let Some(event) = event else {
                        break SessionOutcome::Disconnected;
                    };
                    match event {
                        SessionEvent::StateChanged(ConnectivityState::Connected) => {
                            connect_armed = false;
                            self.parts.capture.request_keyframe();
                            self.status("Connected");
                            if !connected {
                                connected = true;
                                self.parts.ui.dispatch(UiEvent::ConnectionStarted);
                            }
                        }
                        SessionEvent::StateChanged(ConnectivityState::Disconnected) => {
                            self.status("Reconnecting...");
                        }
                        SessionEvent::StateChanged(
                            ConnectivityState::Failed | ConnectivityState::Closed,
                        ) => break SessionOutcome::Disconnected,
                        SessionEvent::StateChanged(state) => trace!(?state, "connectivity"),
                        SessionEvent::Frame(frame) => {
                            connect_armed = false;
                            let deadline = Instant::now() + self.config.frame_timeout;
                            if !liveness_armed {
                                liveness.as_mut().reset(deadline);
                                liveness_armed = true;
                            }
                            match self.parts.decoder.decode(&frame.data) {
                                Ok(picture) => {
                                    liveness.as_mut().reset(deadline);
                                    self.parts.ui.dispatch(UiEvent::Frame(picture));
                                }
                                Err(err) => {
                                    debug!(error = %err, timestamp = frame.timestamp, "decode failed");
                                    request_recovery(session).await;
                                }
                            }
                        }
                        SessionEvent::FramesSkipped(count) => {
                            debug!(count, "frames skipped");
                            request_recovery(session).await;
                        }
                        SessionEvent::LossIndication => self.parts.capture.request_keyframe(),
                        SessionEvent::Chat(text) => self.parts.ui.dispatch(UiEvent::ChatReceived(text)),
                        SessionEvent::DataOpen => self.parts.ui.dispatch(UiEvent::DataOpened),
                        SessionEvent::Bye => break SessionOutcome::PartnerLeft,
                    }
                }
            }
        };
        AttemptReport { outcome, connected }
    }

    fn discard_stale_commands(&mut self) {
        while let Ok(Command::Chat(text)) = self.commands.try_recv() {
            debug!(len = text.len(), "dropping chat typed before connecting");
        }
    }

    async fn send_chat(&self, session: &dyn PeerSession, text: String) {
        match session.send_chat(&text).await {
            Ok(true) => self
                .parts
                .ui
                .dispatch(UiEvent::ChatSent(text.trim().to_owned())),
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "chat not sent");
                self.status(format!("Chat not sent: {err}"));
            }
        }
    }

    async fn teardown(&self, session: &dyn PeerSession, connected: bool) {
        self.parts.capture.set_output(None);
        session.silence();
        if session.was_connected() {
            if let Err(err) = session.send_bye().await {
                debug!(error = %err, "goodbye not sent");
            }
        }
        if let Err(err) = session.close().await {
            debug!(error = %err, "session close failed");
        }
        if connected {
            self.parts.ui.dispatch(UiEvent::ConnectionEnded);
        }
    }
}

async fn request_recovery(session: &dyn PeerSession) {
    match session.send_loss_indication().await {
        Ok(true) => debug!("asked partner for a keyframe"),
        Ok(false) => trace!("keyframe request suppressed"),
        Err(err) => warn!(error = %err, "keyframe request failed"),
    }
}
