//! Peer transport abstraction
//!
//! The engine consumes the underlying WebRTC-style peer connection through a
//! narrow interface: a handful of operations on [`PeerTransport`] and five
//! callbacks delivered as [`TransportEvent`] values. Everything negotiation-
//! related above this seam (politeness, collision handling, signaling) is the
//! engine's job; everything below it (ICE gathering, DTLS, media transport)
//! belongs to the primitive.
//!
//! [`MemoryTransport`](memory::MemoryTransport) is an in-process
//! implementation of the contract used by the test suites.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServerConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::types::{ParticipantId, StreamId, TrackId};

pub use huddle_signaling::{IceCandidate, SdpType, SessionDescription};

/// Signaling state of a peer transport, mirroring the primitive's own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Connection state re-exposed to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE connection state, surfaced for diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Handle to one outgoing track binding on a transport. Obtained from
/// [`PeerTransport::add_track`], used for in-place replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(pub u64);

/// A remote media track surfaced by the transport
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: TrackId,
    pub stream_id: StreamId,
    pub kind: TrackKind,
    pub owner: ParticipantId,
}

/// Raw transport counters, polled by the stats monitor each tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Jitter in milliseconds, 0 if unavailable
    pub jitter_ms: f64,
    /// Remote round-trip time in milliseconds, 0 if unavailable
    pub rtt_ms: f64,
    /// Available outgoing bitrate in bits per second, 0 if unavailable
    pub available_outgoing_bitrate: u64,
}

/// The five transport callbacks, delivered as an event stream
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local change (track added) requires renegotiation
    NegotiationNeeded,
    /// A local ICE candidate was gathered and must be signaled to the peer
    IceCandidate(IceCandidate),
    /// The transport's connection state changed
    ConnectionStateChanged(PeerConnectionState),
    /// A remote track arrived
    TrackReceived(RemoteTrack),
    /// The ICE connection state changed
    IceConnectionStateChanged(IceConnectionState),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport state: {0}")]
    InvalidState(String),

    #[error("transport operation failed: {0}")]
    Failed(String),

    #[error("transport is closed")]
    Closed,
}

/// One WebRTC-style peer connection, owned by the peer manager
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create and apply the local description appropriate for the current
    /// signaling state (an offer when stable, an answer when a remote offer
    /// is pending) and return it for signaling.
    async fn set_local_description(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote description. An offer arriving while a local offer is
    /// pending performs an implicit rollback of the local offer first.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate. Candidates arriving before the remote
    /// description are buffered, not rejected.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Attach a local track for sending. Returns the sender binding used for
    /// later in-place replacement.
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError>;

    /// Replace the track carried by `sender` without renegotiation
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError>;

    /// Detach a sender. Triggers renegotiation on the next offer.
    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError>;

    /// Current signaling state
    fn signaling_state(&self) -> SignalingState;

    /// Current connection state
    fn connection_state(&self) -> PeerConnectionState;

    /// Snapshot of the raw transport counters
    async fn stats(&self) -> TransportStats;

    /// Close the transport. Idempotent; emits no further events.
    async fn close(&self);
}

/// Creates transports wired to an event stream
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport toward `remote`. The five transport callbacks are
    /// delivered through `events`.
    async fn create(
        &self,
        remote: &ParticipantId,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
