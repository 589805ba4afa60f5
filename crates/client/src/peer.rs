use anyhow::Context;
use bytes::Bytes;
use overlook_protocol::{ChannelMessage, INPUT_CHANNEL_LABEL, IceConfig, TrickleCandidate};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::WebRtcError;
use crate::events::{EventSender, SessionEvent};
use crate::health::FrameClock;
use crate::signaling::RemoteCandidate;
use crate::video::{self, FrameRenderer};

/// The media side of a session as seen by signaling: take an offer, return
/// an answer, absorb remote candidates.
pub trait RemotePeer: Send + Sync {
    fn accept_offer(&self, sdp: &str) -> impl Future<Output = anyhow::Result<String>> + Send;

    fn add_remote_candidate(
        &self,
        candidate: &RemoteCandidate,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Build the WebRTC API object (codec table + interceptors).
///
/// Unlike a sender we accept whatever the device offers, so the full
/// default codec set is registered.
pub fn build_api() -> Result<API, WebRtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| WebRtcError::FactoryNotInitialized(e.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| WebRtcError::FactoryNotInitialized(e.to_string()))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !config.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// One peer connection to the device. Built fresh for every connect.
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: SharedChannel,
}

impl WebRtcPeer {
    pub async fn new(
        api: &API,
        ice: &IceConfig,
        events: EventSender,
        clock: Arc<FrameClock>,
        renderer: Option<Arc<dyn FrameRenderer>>,
    ) -> anyhow::Result<Self> {
        let config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let state_events = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |state| {
            info!(?state, "ICE connection state changed");
            state_events.send(SessionEvent::IceConnectionState(state));
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            match candidate {
                Some(c) => match c.to_json() {
                    Ok(json) => {
                        candidate_events.send(SessionEvent::LocalCandidate(TrickleCandidate::local(
                            json.candidate,
                            json.sdp_mid,
                            json.sdp_mline_index,
                        )));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                },
                None => {
                    debug!("ICE gathering complete");
                    candidate_events.send(SessionEvent::LocalCandidate(TrickleCandidate::completed()));
                }
            }
            Box::pin(async {})
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            if track.kind() == RTPCodecType::Video {
                tokio::spawn(video::run_remote_video(
                    track,
                    renderer.clone(),
                    Arc::clone(&clock),
                    track_events.clone(),
                ));
            } else {
                debug!(kind = ?track.kind(), "Ignoring non-video remote track");
            }
            Box::pin(async {})
        }));

        let data_channel: SharedChannel = Arc::new(Mutex::new(None));

        // The device may also announce its own channel with the same label.
        let announced = Arc::clone(&data_channel);
        let announced_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |dc| {
            let storage = Arc::clone(&announced);
            let events = announced_events.clone();
            Box::pin(async move {
                if dc.label() == INPUT_CHANNEL_LABEL {
                    info!("Remote announced input data channel");
                    wire_channel(&dc, events);
                    *storage.lock().await = Some(dc);
                }
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = peer_connection
            .create_data_channel(INPUT_CHANNEL_LABEL, Some(init))
            .await
            .context("Failed to create input data channel")?;
        wire_channel(&dc, events);
        *data_channel.lock().await = Some(dc);

        info!("WebRTC peer connection created");
        Ok(Self {
            peer_connection,
            data_channel,
        })
    }

    /// Add the local microphone as an Opus track. The caller feeds samples.
    pub async fn attach_microphone(&self) -> anyhow::Result<Arc<TrackLocalStaticSample>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio0".to_string(),
            "stream0".to_string(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add microphone track")?;

        // Interceptors only run while RTCP is being read.
        tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });

        info!("Local microphone track added");
        Ok(track)
    }

    pub async fn handle_offer(&self, sdp: &str) -> anyhow::Result<String> {
        debug!("=== OFFER SDP START ===");
        log_sdp("Offer SDP", sdp);
        debug!("=== OFFER SDP END ===");

        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse SDP offer")?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;

        debug!("=== ANSWER SDP START ===");
        log_sdp("Answer SDP", &answer.sdp);
        debug!("=== ANSWER SDP END ===");
        Ok(answer.sdp)
    }

    pub async fn add_ice_candidate(&self, candidate: &RemoteCandidate) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            ..Default::default()
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;

        debug!(candidate = candidate.candidate, "Remote ICE candidate added");
        Ok(())
    }

    /// Send a binary frame if the input channel is open. Returns whether it
    /// was sent.
    pub async fn send_channel_bytes(&self, data: Vec<u8>) -> anyhow::Result<bool> {
        let dc = self.data_channel.lock().await;
        let Some(dc) = dc.as_ref() else {
            return Ok(false);
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Ok(false);
        }
        dc.send(&Bytes::from(data))
            .await
            .context("Failed to send data channel message")?;
        Ok(true)
    }

    pub async fn get_stats(&self) -> webrtc::stats::StatsReport {
        self.peer_connection.get_stats().await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        if let Some(dc) = self.data_channel.lock().await.take()
            && let Err(e) = dc.close().await
        {
            debug!("Data channel close failed: {e}");
        }
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!("Peer connection closed");
        Ok(())
    }
}

impl RemotePeer for WebRtcPeer {
    async fn accept_offer(&self, sdp: &str) -> anyhow::Result<String> {
        self.handle_offer(sdp).await
    }

    async fn add_remote_candidate(&self, candidate: &RemoteCandidate) -> anyhow::Result<()> {
        self.add_ice_candidate(candidate).await
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: EventSender) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        info!("Input data channel open");
        open_events.send(SessionEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match serde_json::from_slice::<ChannelMessage>(&msg.data) {
            Ok(message) => {
                events.send(SessionEvent::ChannelMessage(message));
            }
            Err(e) => debug!("Ignoring malformed data channel message: {e}"),
        }
        Box::pin(async {})
    }));
}

fn log_sdp(label: &'static str, sdp: &str) {
    for line in sdp.lines() {
        if line.starts_with("m=")
            || line.starts_with("a=rtpmap:")
            || line.starts_with("a=fmtp:")
            || line.starts_with("a=group:")
            || line.starts_with("a=mid:")
            || line.starts_with("a=candidate:")
        {
            debug!(sdp_line = line, "{label}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_and_turn_become_separate_servers() {
        let config = IceConfig {
            stun_urls: vec!["stun:stun.example.com:3478".into()],
            turn_urls: vec!["turn:turn.example.com:3478".into()],
            turn_username: Some("user".into()),
            turn_credential: Some("pass".into()),
        };
        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "pass");
    }

    #[test]
    fn no_urls_no_servers() {
        let config = IceConfig {
            stun_urls: Vec::new(),
            ..Default::default()
        };
        assert!(ice_servers(&config).is_empty());
    }

    #[tokio::test]
    async fn fresh_peer_cannot_send_before_channel_opens() {
        let api = build_api().unwrap();
        let (events, _rx) = crate::events::channel(1);
        let peer = WebRtcPeer::new(
            &api,
            &IceConfig {
                stun_urls: Vec::new(),
                ..Default::default()
            },
            events,
            Arc::new(FrameClock::new()),
            None,
        )
        .await
        .unwrap();
        assert!(!peer.send_channel_bytes(b"{}".to_vec()).await.unwrap());
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn garbage_offer_is_an_error() {
        let api = build_api().unwrap();
        let (events, _rx) = crate::events::channel(1);
        let peer = WebRtcPeer::new(
            &api,
            &IceConfig::default(),
            events,
            Arc::new(FrameClock::new()),
            None,
        )
        .await
        .unwrap();
        assert!(peer.handle_offer("not an sdp").await.is_err());
        peer.close().await.unwrap();
    }
}
