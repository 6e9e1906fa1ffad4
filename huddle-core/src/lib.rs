//! Huddle call engine
//!
//! Real-time multi-peer communication for rooms: connection lifecycle,
//! perfect-negotiation offer exchange, live camera/screen track
//! substitution, session recording and network-quality monitoring, over a
//! relay-free peer transport bootstrapped through a shared signaling
//! channel.
//!
//! ## Architecture
//!
//! - [`session::CallSession`] — the facade: initialize, media controls,
//!   recording, cleanup, and the outbound [`events::CallEvent`] stream
//! - [`peers::PeerManager`] — one transport per remote participant, the
//!   polite/impolite glare-resolution protocol, track attachment
//! - [`media::MediaPipeline`] — local capture, mute by flag flip, screen
//!   share source switching
//! - [`recording::Recorder`] — composite-stream recording state machine
//! - [`stats::StatsMonitor`] — fixed-interval counters and quality grades
//! - [`transport`] — the narrow seam to the WebRTC-style primitive
//!
//! Signaling envelopes and their transports live in `huddle-signaling`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_core::{CallConfig, CallSession, SessionDeps};
//!
//! let session = CallSession::new(CallConfig::new("room-42", "u1", "User One"), deps);
//! let mut events = session.events();
//! session.initialize().await?;
//! session.toggle_video(Some(false))?;
//! session.cleanup().await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod peers;
pub mod recording;
pub mod session;
pub mod stats;
pub mod test_helpers;
pub mod transport;
pub mod types;

pub use config::{CallConfig, IceServerConfig};
pub use error::{EngineError, Result};
pub use events::CallEvent;
pub use media::{MediaConstraints, MediaPipeline, ScreenShareOptions, TrackKind};
pub use peers::{NegotiationState, Participant, PeerManager};
pub use recording::{Recorder, RecordingOptions, RecordingState};
pub use session::{CallSession, SessionDeps};
pub use stats::{NetworkQuality, StatsMonitor, WebRtcStats};
pub use types::{ParticipantId, RoomId, StreamId, TrackId};
