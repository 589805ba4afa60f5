//! The stream manager: single owner of the signaling session, the peer
//! connection and every timer.
//!
//! Producers (socket pump, webrtc callbacks, video reader) never touch
//! manager state directly. They post [`SessionEvent`]s tagged with the
//! session generation; the owner loop pulls them through
//! [`StreamManager::next_event`] and applies them in [`StreamManager::handle`].
//! Bumping the generation on teardown makes any late callback of a closed
//! peer inert.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use overlook_protocol::{ChannelMessage, InputEvent, OverlookConfig, WatchParams};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::WebRtcError;
use crate::events::{self, EventReceiver, EventSender, SessionEvent};
use crate::health::{FrameClock, STALL_REASON, StallTransition, StreamHealthMonitor};
use crate::peer::{self, WebRtcPeer};
use crate::signaling::{self, JanusSignaling, SignalingSocket, SignalingTarget};
use crate::stats::{ConnectionQuality, QualityTracker, StatsSample};
use crate::transaction::TransactionCorrelator;
use crate::video::{FrameRenderer, ReceptionStats, VideoFrame};

pub const SIGNALING_LOST_REASON: &str = "Signaling connection lost";

/// Everything the UI observes about the stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStatus {
    pub connected: bool,
    pub connecting: bool,
    pub has_ever_connected: bool,
    pub stalled: bool,
    pub disconnect_reason: Option<String>,
    pub last_frame_age_secs: Option<u64>,
    pub latency_ms: u64,
    pub video_size: Option<(u32, u32)>,
    pub inbound_fps: Option<f64>,
    pub quality: ConnectionQuality,
}

/// Microphone permission, asked before a mic track is added.
pub trait MicrophoneAccess: Send + Sync {
    fn request_access(&self) -> BoxFuture<'_, anyhow::Result<bool>>;
}

/// The slice of the device configuration API the session lifecycle needs.
pub trait DeviceControl: Send + Sync {
    fn set_hid_connected(&self, connected: bool) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// What woke the owner loop.
#[derive(Debug)]
pub enum Wake {
    Session { generation: u64, event: SessionEvent },
    HealthTick,
    StatsTick,
    KeepaliveTick,
}

struct Timers {
    health: Interval,
    stats: Interval,
    keepalive: Interval,
}

/// `interval_at` panics on a zero period; unvalidated configs can carry one.
const MIN_PERIOD: Duration = Duration::from_millis(1);

fn periodic(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl Timers {
    const COUNT: usize = 3;

    fn start(config: &OverlookConfig) -> Self {
        Self {
            health: periodic(Duration::from_millis(config.health.check_interval_ms)),
            stats: periodic(Duration::from_millis(config.health.stats_interval_ms)),
            keepalive: periodic(Duration::from_secs(config.signaling.keepalive_interval_secs)),
        }
    }
}

pub struct StreamManager {
    config: OverlookConfig,
    api: Option<Arc<API>>,
    renderer: Option<Arc<dyn FrameRenderer>>,
    microphone: Option<Arc<dyn MicrophoneAccess>>,
    device: Option<Arc<dyn DeviceControl>>,

    status: watch::Sender<StreamStatus>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    generation: u64,

    peer: Option<Arc<WebRtcPeer>>,
    socket: Option<SignalingSocket>,
    signaling: Option<JanusSignaling>,
    timers: Option<Timers>,
    mic_track: Option<Arc<TrackLocalStaticSample>>,
    hid_connected: bool,

    clock: Arc<FrameClock>,
    health: StreamHealthMonitor,
    quality: QualityTracker,
    reception: Option<ReceptionStats>,
    ping_started: Option<Instant>,

    audio_enabled: bool,
    mic_enabled: bool,
}

impl StreamManager {
    pub fn new(config: OverlookConfig) -> Self {
        let (events_tx, events_rx) = events::channel(0);
        let (status, _) = watch::channel(StreamStatus::default());
        let health = StreamHealthMonitor::new((&config.health).into());
        Self {
            audio_enabled: config.stream.audio,
            mic_enabled: config.stream.mic,
            config,
            api: None,
            renderer: None,
            microphone: None,
            device: None,
            status,
            events_tx,
            events_rx,
            generation: 0,
            peer: None,
            socket: None,
            signaling: None,
            timers: None,
            mic_track: None,
            hid_connected: false,
            clock: Arc::new(FrameClock::new()),
            health,
            quality: QualityTracker::new(),
            reception: None,
            ping_started: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn FrameRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_microphone_access(mut self, microphone: Arc<dyn MicrophoneAccess>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    pub fn with_device_control(mut self, device: Arc<dyn DeviceControl>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn config(&self) -> &OverlookConfig {
        &self.config
    }

    /// Takes effect on the next connect.
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
    }

    /// Takes effect on the next connect.
    pub fn set_mic_enabled(&mut self, enabled: bool) {
        self.mic_enabled = enabled;
    }

    pub fn set_frame_capture_enabled(&self, enabled: bool) {
        self.clock.set_capture_enabled(enabled);
    }

    pub fn captured_frame(&self) -> Option<VideoFrame> {
        self.clock.captured_frame()
    }

    /// Local Opus track to feed microphone samples into, when one was added.
    pub fn microphone_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.mic_track.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.signaling
            .as_ref()
            .map_or(0, |s| s.correlator().pending())
    }

    pub fn active_timers(&self) -> usize {
        if self.timers.is_some() { Timers::COUNT } else { 0 }
    }

    fn publish(&self, update: impl FnOnce(&mut StreamStatus)) {
        self.status.send_modify(update);
    }

    fn api(&mut self) -> Result<Arc<API>, WebRtcError> {
        if let Some(api) = &self.api {
            return Ok(Arc::clone(api));
        }
        let api = Arc::new(peer::build_api()?);
        self.api = Some(Arc::clone(&api));
        Ok(api)
    }

    /// Bring up a fresh session. On failure everything is torn down and the
    /// reason recorded before the error is returned.
    pub async fn connect(&mut self) -> Result<(), WebRtcError> {
        if self.has_session() {
            self.disconnect().await;
        }
        self.generation += 1;
        let events = self.events_tx.for_generation(self.generation);
        self.publish(|s| {
            s.connecting = true;
            s.stalled = false;
            s.disconnect_reason = None;
            s.last_frame_age_secs = None;
            s.has_ever_connected = false;
        });

        match self.establish(events).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Connect failed: {e}");
                let reason = format!("Connect failed: {e}");
                self.disconnect().await;
                self.publish(|s| s.disconnect_reason = Some(reason));
                Err(e)
            }
        }
    }

    async fn establish(&mut self, events: EventSender) -> Result<(), WebRtcError> {
        let api = self.api()?;
        let peer = WebRtcPeer::new(
            &api,
            &self.config.ice,
            events.clone(),
            Arc::clone(&self.clock),
            self.renderer.clone(),
        )
        .await
        .map_err(WebRtcError::peer)?;
        let peer = Arc::new(peer);
        self.peer = Some(Arc::clone(&peer));

        if self.mic_enabled && self.microphone_granted().await {
            match peer.attach_microphone().await {
                Ok(track) => self.mic_track = Some(track),
                Err(e) => warn!("Continuing without microphone: {e:#}"),
            }
        }

        let target = SignalingTarget::from_config(&self.config.device, &self.config.signaling);
        let correlator = Arc::new(TransactionCorrelator::new());
        let (socket, outbox) = SignalingSocket::open(&target, Arc::clone(&correlator), events).await?;
        self.socket = Some(socket);
        let reply_timeout = Duration::from_secs(self.config.signaling.reply_timeout_secs);
        let signaling = self
            .signaling
            .insert(JanusSignaling::new(outbox, correlator, reply_timeout));

        let params = WatchParams::new(self.audio_enabled, self.mic_track.is_some());
        signaling
            .negotiate(&self.config.signaling.plugin, params)
            .await?;

        self.timers = Some(Timers::start(&self.config));
        self.set_hid(true).await;
        Ok(())
    }

    async fn microphone_granted(&self) -> bool {
        let Some(microphone) = &self.microphone else {
            debug!("No microphone access provider, skipping mic track");
            return false;
        };
        match microphone.request_access().await {
            Ok(true) => true,
            Ok(false) => {
                info!("Microphone access denied, continuing without mic");
                false
            }
            Err(e) => {
                warn!("Microphone access check failed: {e:#}");
                false
            }
        }
    }

    async fn set_hid(&mut self, connected: bool) {
        self.hid_connected = connected;
        let Some(device) = &self.device else {
            return;
        };
        if let Err(e) = device.set_hid_connected(connected).await {
            warn!(connected, "Failed to toggle HID: {e:#}");
        }
    }

    /// Tear down and build again. Failures are recorded, not returned.
    pub async fn reconnect(&mut self) {
        self.disconnect().await;
        if let Err(e) = self.connect().await {
            self.publish(|s| {
                s.connecting = false;
                s.disconnect_reason = Some(format!("Reconnect failed: {e}"));
            });
        }
    }

    fn has_session(&self) -> bool {
        self.peer.is_some() || self.socket.is_some() || self.signaling.is_some()
    }

    /// Release everything. Safe from any state, including after a connect
    /// future was dropped halfway.
    pub async fn disconnect(&mut self) {
        let had_session = self.has_session();
        self.generation += 1;

        self.timers = None;
        if let Some(mut signaling) = self.signaling.take() {
            let failed = signaling.teardown();
            if failed > 0 {
                debug!(failed, "Failed pending Janus requests on disconnect");
            }
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.mic_track = None;
        if let Some(peer) = self.peer.take()
            && let Err(e) = peer.close().await
        {
            debug!("Peer close failed: {e:#}");
        }

        self.clock.reset();
        self.health.reset();
        self.quality.reset();
        self.reception = None;
        self.ping_started = None;
        self.status.send_replace(StreamStatus::default());

        if self.hid_connected {
            self.set_hid(false).await;
        }
        if had_session {
            info!("Disconnected");
        }
    }

    /// Wait for the next thing to do. Cancel-safe.
    pub async fn next_event(&mut self) -> Wake {
        let events = &mut self.events_rx;
        let Some(timers) = self.timers.as_mut() else {
            return match events.recv().await {
                Some((generation, event)) => Wake::Session { generation, event },
                // We hold a sender ourselves, so the channel never closes.
                None => std::future::pending().await,
            };
        };
        tokio::select! {
            Some((generation, event)) = events.recv() => Wake::Session { generation, event },
            _ = timers.health.tick() => Wake::HealthTick,
            _ = timers.stats.tick() => Wake::StatsTick,
            _ = timers.keepalive.tick() => Wake::KeepaliveTick,
        }
    }

    pub async fn handle(&mut self, wake: Wake) {
        let now = Instant::now();
        match wake {
            Wake::Session { generation, event } => {
                if generation != self.generation {
                    trace!(generation, current = self.generation, "Dropping stale session event");
                    return;
                }
                self.handle_session_event(event, now).await;
            }
            Wake::HealthTick => self.check_health(now),
            Wake::StatsTick => {
                self.send_ping(now).await;
                self.poll_stats(now).await;
            }
            Wake::KeepaliveTick => {
                if let Some(signaling) = &self.signaling
                    && let Err(e) = signaling.keepalive()
                {
                    debug!("Keepalive failed: {e}");
                }
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Push(push) => {
                if let (Some(peer), Some(signaling)) = (&self.peer, &self.signaling) {
                    signaling::handle_push(peer.as_ref(), signaling, push).await;
                }
            }
            SessionEvent::SignalingLost(reason) => self.on_signaling_lost(&reason),
            SessionEvent::IceConnectionState(state) => self.handle_ice_state(state, now),
            SessionEvent::LocalCandidate(candidate) => {
                if let Some(signaling) = &self.signaling
                    && let Err(e) = signaling.trickle(candidate)
                {
                    debug!("Failed to trickle local candidate: {e}");
                }
            }
            SessionEvent::DataChannelOpen => debug!("Input channel ready"),
            SessionEvent::ChannelMessage(ChannelMessage::Pong { .. }) => self.on_pong(now),
            SessionEvent::ChannelMessage(other) => trace!(?other, "Ignoring channel message"),
            SessionEvent::VideoTrackStarted { mime_type } => {
                info!(mime_type, "Receiving video");
            }
            SessionEvent::InboundFps(fps) => self.publish(|s| s.inbound_fps = Some(fps)),
            SessionEvent::Reception(stats) => self.reception = Some(stats),
            SessionEvent::VideoSize { width, height } => {
                if width > 0 && height > 0 {
                    info!(width, height, "Video size");
                    self.publish(|s| s.video_size = Some((width, height)));
                }
            }
        }
    }

    fn on_signaling_lost(&mut self, reason: &str) {
        debug!(reason, "Signaling lost");
        self.publish(|s| {
            s.connecting = false;
            if s.connected || s.has_ever_connected || s.disconnect_reason.is_none() {
                s.disconnect_reason = Some(SIGNALING_LOST_REASON.to_string());
            }
        });
    }

    pub fn handle_ice_state(&mut self, state: RTCIceConnectionState, now: Instant) {
        let connected = matches!(
            state,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
        );
        if connected {
            self.health.ice_connected(now);
            self.publish(|s| {
                s.connected = true;
                s.connecting = false;
                s.has_ever_connected = true;
                s.disconnect_reason = None;
            });
            return;
        }

        self.health.ice_lost();
        let reason = match state {
            RTCIceConnectionState::Disconnected => Some("Video connection lost"),
            RTCIceConnectionState::Failed => Some("Video connection failed"),
            RTCIceConnectionState::Closed => Some("Video connection closed"),
            _ => None,
        };
        self.publish(|s| {
            s.connected = false;
            s.stalled = false;
            if let Some(reason) = reason {
                s.connecting = false;
                s.disconnect_reason = Some(reason.to_string());
            }
        });
    }

    pub fn check_health(&mut self, now: Instant) {
        let connected = self.status.borrow().connected;
        let (verdict, transition) = self.health.check(connected, self.clock.last_frame_at(), now);
        self.publish(|s| {
            s.stalled = verdict.stalled;
            s.last_frame_age_secs = verdict.frame_age_secs();
            match transition {
                StallTransition::Entered => {
                    s.disconnect_reason = Some(STALL_REASON.to_string());
                }
                StallTransition::Cleared
                    if connected && s.disconnect_reason.as_deref() == Some(STALL_REASON) =>
                {
                    s.disconnect_reason = None;
                }
                _ => {}
            }
        });
        if transition == StallTransition::Entered {
            warn!(age = ?verdict.frame_age, "Video stream stalled");
        }
    }

    async fn poll_stats(&mut self, now: Instant) {
        let Some(peer) = &self.peer else {
            self.publish(|s| s.quality = ConnectionQuality::default());
            return;
        };
        let report = peer.get_stats().await;
        let sample = StatsSample::collect(&report, self.reception.as_ref());
        let quality = self.quality.update(&sample, now);
        self.publish(|s| s.quality = quality);
    }

    async fn send_ping(&mut self, now: Instant) {
        let Some(peer) = &self.peer else {
            return;
        };
        self.ping_started = Some(now);
        let bytes = match ChannelMessage::ping_now().encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Failed to encode ping: {e}");
                return;
            }
        };
        if let Err(e) = peer.send_channel_bytes(bytes).await {
            debug!("Ping failed: {e:#}");
        }
    }

    fn on_pong(&mut self, now: Instant) {
        let Some(started) = self.ping_started.take() else {
            return;
        };
        let latency = now.saturating_duration_since(started).as_millis() as u64;
        self.publish(|s| s.latency_ms = latency);
    }

    /// Forward an input event to the device. Dropped when the channel is
    /// not open; returns whether it went out.
    pub async fn send_input_event(&self, event: &InputEvent) -> bool {
        let Some(peer) = &self.peer else {
            return false;
        };
        let bytes = match event.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode input event: {e}");
                return false;
            }
        };
        match peer.send_channel_bytes(bytes).await {
            Ok(sent) => sent,
            Err(e) => {
                debug!("Input event not sent: {e:#}");
                false
            }
        }
    }

    #[cfg(test)]
    fn install_test_session(
        &mut self,
    ) -> (
        Arc<TransactionCorrelator>,
        tokio::sync::mpsc::UnboundedReceiver<overlook_protocol::JanusRequest>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let correlator = Arc::new(TransactionCorrelator::new());
        self.signaling = Some(JanusSignaling::new(
            tx,
            Arc::clone(&correlator),
            Duration::from_secs(1),
        ));
        self.timers = Some(Timers::start(&self.config));
        (correlator, rx)
    }

    #[cfg(test)]
    fn current_events(&self) -> EventSender {
        self.events_tx.for_generation(self.generation)
    }
}
