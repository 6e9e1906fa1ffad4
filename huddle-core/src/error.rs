//! Engine error types
//!
//! One tagged error channel: every failure carries a stable string code and
//! a human message. Failures scoped to one peer are contained to that peer;
//! failures scoped to local resources (media, recording) never tear down
//! existing connections.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Media access refused by the user or OS. Not retryable without new
    /// user consent; existing connections are unaffected.
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    /// No matching capture device
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),

    /// Any other local capture failure (screen share, device switch)
    #[error("media failure: {0}")]
    Media(String),

    /// Malformed or unexpected signaling message, or a negotiation step that
    /// failed after a message was accepted
    #[error("signaling failure: {0}")]
    Signaling(String),

    /// ICE or transport failure not attributable to a known negotiation race
    #[error("peer connection failed: {0}")]
    PeerConnectionFailed(String),

    /// Invalid recording state transition or encoder unavailability
    #[error("recording failure: {0}")]
    Recording(String),

    /// An operation was issued against a session in the wrong lifecycle phase
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Stable machine-readable code for the error kind
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission-denied",
            Self::DeviceNotFound(_) => "device-not-found",
            Self::Media(_) => "media-error",
            Self::Signaling(_) => "signaling-error",
            Self::PeerConnectionFailed(_) => "peer-connection-failed",
            Self::Recording(_) => "recording-error",
            Self::InvalidState(_) => "invalid-state",
        }
    }
}

impl From<huddle_signaling::SignalingError> for EngineError {
    fn from(err: huddle_signaling::SignalingError) -> Self {
        Self::Signaling(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
