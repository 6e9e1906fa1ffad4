//! Signaling transport contract
//!
//! A transport wraps one pub/sub channel scoped to a room. Delivery is
//! at-most-once; ordering is preserved per sender only. The channel does not
//! filter by recipient: every subscriber receives every envelope published
//! to the room, and consumers must check the `to` field themselves.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::SignalEnvelope;
use crate::types::RoomId;

#[derive(Debug, Error)]
pub enum SignalingError {
    /// Subscribing to the room channel failed. Fatal to session start.
    #[error("failed to subscribe to room channel: {0}")]
    Subscribe(String),

    #[error("failed to publish envelope: {0}")]
    Publish(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, SignalingError>;

/// Pub/sub signaling channel scoped to a room
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to the room channel. Returns the stream of every envelope
    /// published to the room by other participants (the transport suppresses
    /// the subscriber's own echoes).
    async fn connect(&self, room_id: &RoomId) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>>;

    /// Publish an envelope to the room channel
    async fn send(&self, envelope: SignalEnvelope) -> Result<()>;

    /// Tear down the subscription. Idempotent.
    async fn disconnect(&self);
}
