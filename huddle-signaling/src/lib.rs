//! Signaling layer for the Huddle call engine
//!
//! Peers bootstrap their direct connections by exchanging small JSON
//! envelopes (offers, answers, ICE candidates, presence) over a pub/sub
//! channel scoped to a room. This crate defines the wire format and the
//! [`SignalingTransport`] contract, plus two bindings:
//!
//! - [`MemoryHub`] — in-process hub for single-node use and tests
//! - [`RedisTransport`] — Redis pub/sub channel per room
//!
//! The channel broadcasts to every subscriber and filters nothing by
//! recipient; consumers must check [`SignalEnvelope::to`] and ignore
//! envelopes addressed to someone else.

mod envelope;
mod memory;
mod redis;
mod sdp;
mod transport;
mod types;

pub use envelope::{SignalEnvelope, SignalPayload};
pub use memory::{MemoryClient, MemoryHub};
pub use self::redis::RedisTransport;
pub use sdp::{IceCandidate, SdpType, SessionDescription};
pub use transport::{Result, SignalingError, SignalingTransport};
pub use types::{ParticipantId, RoomId};
