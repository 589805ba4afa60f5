use overlook_protocol::{ChannelMessage, TrickleCandidate};
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::signaling::JanusPush;
use crate::video::ReceptionStats;

/// Everything the background producers (socket pump, webrtc callbacks,
/// video reader) report to the manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Unsolicited gateway message that needs a reaction
    Push(JanusPush),
    /// The signaling socket closed or errored
    SignalingLost(String),
    IceConnectionState(RTCIceConnectionState),
    /// Locally gathered candidate (or the completed sentinel) to trickle out
    LocalCandidate(TrickleCandidate),
    DataChannelOpen,
    ChannelMessage(ChannelMessage),
    VideoTrackStarted { mime_type: String },
    InboundFps(f64),
    Reception(ReceptionStats),
    VideoSize { width: u32, height: u32 },
}

/// Producer handle stamped with the session generation it belongs to.
///
/// The manager bumps its generation on every teardown and drops events
/// carrying an older one, so late callbacks of a closed peer are inert.
#[derive(Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<(u64, SessionEvent)>;

pub fn channel(generation: u64) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { generation, tx }, rx)
}

impl EventSender {
    /// Same channel, new generation.
    pub fn for_generation(&self, generation: u64) -> Self {
        Self {
            generation,
            tx: self.tx.clone(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the manager is gone.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_carry_their_generation() {
        let (tx, mut rx) = channel(1);
        let newer = tx.for_generation(2);
        assert!(tx.send(SessionEvent::DataChannelOpen));
        assert!(newer.send(SessionEvent::InboundFps(30.0)));

        let (generation, _) = rx.recv().await.unwrap();
        assert_eq!(generation, 1);
        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 2);
        assert!(matches!(event, SessionEvent::InboundFps(f) if f == 30.0));
    }

    #[test]
    fn send_fails_after_receiver_dropped() {
        let (tx, rx) = channel(0);
        drop(rx);
        assert!(!tx.send(SessionEvent::DataChannelOpen));
    }
}
