pub mod assembly;
pub mod control;
pub mod keyframe;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::goodbye::Goodbye;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{VideoSender, VideoSink};
use crate::signaling::DescriptionEndpoint;
use assembly::{AssembledFrame, FrameAssembly};
use control::ControlMessage;
use keyframe::KeyframeRequestLimiter;

pub const CHAT_CHANNEL_LABEL: &str = "chat";
pub const CHAT_CHANNEL_ID: u16 = 0;
pub const VIDEO_CLOCK_RATE: u32 = 90_000;
const EVENT_QUEUE_DEPTH: usize = 256;
const NO_REMOTE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("invalid session description: {0}")]
    Description(#[from] serde_json::Error),
    #[error("no local description after ICE gathering")]
    NoLocalDescription,
    #[error("chat channel is not open")]
    ChannelNotOpen,
}

/// Connectivity as reported by the ICE agent, folded to what the
/// orchestrator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCIceConnectionState> for ConnectivityState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => ConnectivityState::Connecting,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                ConnectivityState::Connected
            }
            RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCIceConnectionState::Failed => ConnectivityState::Failed,
            RTCIceConnectionState::Closed => ConnectivityState::Closed,
            _ => ConnectivityState::New,
        }
    }
}

/// Everything a session reports, delivered in order on one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectivityState),
    Frame(AssembledFrame),
    /// The remote peer asked for a keyframe.
    LossIndication,
    /// Frames were abandoned by the reorder window.
    FramesSkipped(u32),
    Chat(String),
    DataOpen,
    Bye,
}

pub type SessionEvents = mpsc::Receiver<SessionEvent>;

/// What the orchestrator needs from a live peer connection.
#[async_trait]
pub trait PeerSession: Send + Sync {
    fn endpoint(&self) -> &dyn DescriptionEndpoint;
    fn video_sender(&self) -> VideoSender;
    async fn send_chat(&self, text: &str) -> Result<bool, SessionError>;
    /// Sends a picture-loss indication unless one went out recently or no
    /// remote track exists yet. Returns whether one was sent.
    async fn send_loss_indication(&self) -> Result<bool, SessionError>;
    async fn send_bye(&self) -> Result<(), SessionError>;
    /// Stops event delivery; later callbacks are dropped.
    fn silence(&self);
    fn was_connected(&self) -> bool;
    async fn close(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn PeerSession>, SessionEvents), SessionError>;
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// `stun:` URLs handed to the ICE agent.
    pub ice_servers: Vec<String>,
    /// Gather loopback candidates; only useful for same-host sessions.
    pub include_loopback: bool,
}

pub struct WebRtcSessionFactory {
    config: SessionConfig,
}

impl WebRtcSessionFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn create(&self) -> Result<(Arc<dyn PeerSession>, SessionEvents), SessionError> {
        let (session, events) = MediaSession::new(&self.config).await?;
        Ok((session, events))
    }
}

struct Shared {
    events: mpsc::Sender<SessionEvent>,
    silenced: AtomicBool,
    connected_once: AtomicBool,
    // SSRC of the claimed remote track, or `NO_REMOTE`.
    remote_ssrc: AtomicU64,
    limiter: KeyframeRequestLimiter,
}

impl Shared {
    async fn emit(&self, event: SessionEvent) {
        if self.silenced.load(Ordering::Acquire) {
            return;
        }
        if self.events.send(event).await.is_err() {
            trace!("session event dropped, receiver gone");
        }
    }

    /// First caller wins; later tracks are ignored.
    fn claim_remote(&self, ssrc: u32) -> bool {
        self.remote_ssrc
            .compare_exchange(NO_REMOTE, u64::from(ssrc), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn remote_ssrc(&self) -> Option<u32> {
        match self.remote_ssrc.load(Ordering::Acquire) {
            NO_REMOTE => None,
            ssrc => Some(ssrc as u32),
        }
    }

    /// Sorts inbound RTCP into loss indications and goodbyes.
    async fn handle_rtcp(&self, packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>]) {
        for packet in packets {
            let any = packet.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some()
                || any.downcast_ref::<FullIntraRequest>().is_some()
            {
                debug!("remote requested a keyframe");
                self.emit(SessionEvent::LossIndication).await;
            } else if let Some(bye) = any.downcast_ref::<Goodbye>() {
                match self.remote_ssrc() {
                    Some(ssrc) if bye.sources.contains(&ssrc) => {
                        info!(ssrc, "partner sent goodbye");
                        self.emit(SessionEvent::Bye).await;
                    }
                    _ => trace!(sources = ?bye.sources, "goodbye for unknown source"),
                }
            }
        }
    }
}

/// Outbound half of the video track.
struct OutboundVideo {
    track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl VideoSink for OutboundVideo {
    async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<(), SessionError> {
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// One peer connection: an outbound sample track, the inbound video
/// reassembly pipeline and the negotiated `chat` data channel.
pub struct MediaSession {
    pc: Arc<RTCPeerConnection>,
    video: Arc<TrackLocalStaticSample>,
    video_rtp_sender: Arc<RTCRtpSender>,
    chat: Arc<RTCDataChannel>,
    shared: Arc<Shared>,
}

impl MediaSession {
    pub async fn new(config: &SessionConfig) -> Result<(Arc<Self>, SessionEvents), SessionError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(config.include_loopback);
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            events: events_tx,
            silenced: AtomicBool::new(false),
            connected_once: AtomicBool::new(false),
            remote_ssrc: AtomicU64::new(NO_REMOTE),
            limiter: KeyframeRequestLimiter::default(),
        });

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            "video".to_owned(),
            "roulette".to_owned(),
        ));
        let video_rtp_sender = pc
            .add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        spawn_sender_rtcp(Arc::clone(&video_rtp_sender), Arc::clone(&shared));

        let chat = pc
            .create_data_channel(
                CHAT_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    negotiated: Some(CHAT_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await?;
        wire_chat_channel(&chat, &shared);
        wire_connection(&pc, &shared);

        let session = Arc::new(Self {
            pc,
            video,
            video_rtp_sender,
            chat,
            shared,
        });
        Ok((session, events_rx))
    }

    async fn local_description(&self) -> Result<Value, SessionError> {
        let description = self
            .pc
            .local_description()
            .await
            .ok_or(SessionError::NoLocalDescription)?;
        Ok(serde_json::to_value(description)?)
    }

    async fn apply_local(&self, description: RTCSessionDescription) -> Result<Value, SessionError> {
        // Signaling carries no trickled candidates, so wait for gathering
        // to finish before handing the description out.
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(description).await?;
        let _ = gathered.recv().await;
        self.local_description().await
    }

    async fn local_ssrc(&self) -> Option<u32> {
        self.video_rtp_sender
            .get_parameters()
            .await
            .encodings
            .first()
            .map(|encoding| encoding.ssrc)
    }
}

#[async_trait]
impl DescriptionEndpoint for MediaSession {
    async fn local_offer(&self) -> Result<Value, SessionError> {
        let offer = self.pc.create_offer(None).await?;
        self.apply_local(offer).await
    }

    async fn answer_offer(&self, offer: Value) -> Result<Value, SessionError> {
        let offer: RTCSessionDescription = serde_json::from_value(offer)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.apply_local(answer).await
    }

    async fn accept_answer(&self, answer: Value) -> Result<(), SessionError> {
        let answer: RTCSessionDescription = serde_json::from_value(answer)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerSession for MediaSession {
    fn endpoint(&self) -> &dyn DescriptionEndpoint {
        self
    }

    fn video_sender(&self) -> VideoSender {
        Arc::new(OutboundVideo {
            track: Arc::clone(&self.video),
        })
    }

    /// Trims `text` and sends it as a chat envelope. Blank input is not sent
    /// and returns `Ok(false)`.
    async fn send_chat(&self, text: &str) -> Result<bool, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        if self.chat.ready_state() != RTCDataChannelState::Open {
            return Err(SessionError::ChannelNotOpen);
        }
        self.chat
            .send_text(ControlMessage::Chat(text.to_owned()).encode())
            .await?;
        Ok(true)
    }

    async fn send_loss_indication(&self) -> Result<bool, SessionError> {
        let Some(media_ssrc) = self.shared.remote_ssrc() else {
            return Ok(false);
        };
        if !self.shared.limiter.try_acquire() {
            return Ok(false);
        }
        debug!(media_ssrc, "requesting keyframe from partner");
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await?;
        Ok(true)
    }

    async fn send_bye(&self) -> Result<(), SessionError> {
        let Some(ssrc) = self.local_ssrc().await else {
            return Ok(());
        };
        self.pc
            .write_rtcp(&[Box::new(Goodbye {
                sources: vec![ssrc],
                reason: Bytes::from_static(b"bye"),
            })])
            .await?;
        Ok(())
    }

    fn silence(&self) {
        self.shared.silenced.store(true, Ordering::Release);
    }

    fn was_connected(&self) -> bool {
        self.shared.connected_once.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn wire_connection(pc: &Arc<RTCPeerConnection>, shared: &Arc<Shared>) {
    let on_state = Arc::clone(shared);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let shared = Arc::clone(&on_state);
        Box::pin(async move {
            debug!(?state, "ice connection state changed");
            let state = ConnectivityState::from(state);
            if state == ConnectivityState::Connected {
                shared.connected_once.store(true, Ordering::Release);
            }
            shared.emit(SessionEvent::StateChanged(state)).await;
        })
    }));

    let on_track = Arc::clone(shared);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver| {
            let shared = Arc::clone(&on_track);
            Box::pin(async move {
                if track.kind() != RTPCodecType::Video {
                    return;
                }
                if !shared.claim_remote(track.ssrc()) {
                    debug!(ssrc = track.ssrc(), "ignoring additional remote track");
                    return;
                }
                info!(ssrc = track.ssrc(), "remote video track");
                tokio::spawn(read_receiver_rtcp(receiver, Arc::clone(&shared)));
                tokio::spawn(read_remote_video(track, shared));
            })
        },
    ));
}

fn wire_chat_channel(chat: &Arc<RTCDataChannel>, shared: &Arc<Shared>) {
    let on_open = Arc::clone(shared);
    chat.on_open(Box::new(move || {
        let shared = Arc::clone(&on_open);
        Box::pin(async move {
            debug!("chat channel open");
            shared.emit(SessionEvent::DataOpen).await;
        })
    }));

    let on_message = Arc::clone(shared);
    chat.on_message(Box::new(move |message: DataChannelMessage| {
        let shared = Arc::clone(&on_message);
        Box::pin(async move {
            if let Some(ControlMessage::Chat(text)) = ControlMessage::decode(&message.data) {
                shared.emit(SessionEvent::Chat(text)).await;
            }
        })
    }));
}

fn spawn_sender_rtcp(sender: Arc<RTCRtpSender>, shared: Arc<Shared>) {
    tokio::spawn(async move {
        // Reading also drives the interceptors (NACK, reports).
        while let Ok((packets, _)) = sender.read_rtcp().await {
            shared.handle_rtcp(&packets).await;
        }
        trace!("sender rtcp reader finished");
    });
}

async fn read_receiver_rtcp(receiver: Arc<RTCRtpReceiver>, shared: Arc<Shared>) {
    while let Ok((packets, _)) = receiver.read_rtcp().await {
        shared.handle_rtcp(&packets).await;
    }
    trace!("receiver rtcp reader finished");
}

async fn read_remote_video(track: Arc<TrackRemote>, shared: Arc<Shared>) {
    let mut assembly = FrameAssembly::new(Vp8Packet::default());
    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(err) => {
                debug!(error = %err, "remote video ended");
                break;
            }
        };
        assembly.push(packet);
        while let Some(frame) = assembly.pop() {
            shared.emit(SessionEvent::Frame(frame)).await;
        }
        let skipped = assembly.take_skipped();
        if skipped > 0 {
            warn!(skipped, "dropped incomplete frames");
            shared.emit(SessionEvent::FramesSkipped(skipped)).await;
        }
    }
}
