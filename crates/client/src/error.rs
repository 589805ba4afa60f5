use thiserror::Error;

/// Errors surfaced to callers of the stream manager.
///
/// Clone so a single failure can be fanned out to every pending waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebRtcError {
    #[error("WebRTC factory not initialized: {0}")]
    FactoryNotInitialized(String),

    #[error("invalid signaling URL: {0}")]
    InvalidSignalingUrl(String),

    #[error("signaling connection lost")]
    SignalingConnectionLost,

    #[error("signaling rejected with HTTP {0} (bad or expired auth token?)")]
    Unauthorized(u16),

    #[error("Janus error {code}: {reason}")]
    Janus { code: i64, reason: String },

    #[error("peer connection failed: {0}")]
    PeerConnectionFailed(String),
}

impl WebRtcError {
    /// Wrap an internal `anyhow` chain as a peer failure, keeping the context.
    pub(crate) fn peer(err: anyhow::Error) -> Self {
        WebRtcError::PeerConnectionFailed(format!("{err:#}"))
    }
}
