use thiserror::Error;

/// Crate-level error at the signaling boundary. WebSocket protocol errors
/// keep their own type ([`crate::ws::Error`]) because read errors are
/// permanent and re-surfaced on every subsequent call.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),

    #[error(transparent)]
    Socket(#[from] crate::ws::Error),

    #[error("failed to decode signaling message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
