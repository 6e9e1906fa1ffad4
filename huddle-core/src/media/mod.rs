//! Local media pipeline
//!
//! Acquires and releases camera/microphone and screen-capture streams
//! through the [`MediaDevices`] seam, and owns the mute/unmute and
//! screen-share source-switching rules:
//!
//! - Toggling audio/video only flips the `enabled` flag on the existing
//!   track. Tracks are never removed and re-added for a mute, so no
//!   renegotiation happens.
//! - Screen share swaps the *video source* while the pipeline keeps both
//!   streams; the peer manager replaces the outgoing track on every sender
//!   in place.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::types::{StreamId, TrackId};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a local track captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// Capture constraints, passed through to media acquisition unmodified
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    /// Specific input device ids; `None` picks the default device
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub frame_rate: Option<u32>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            audio_device: None,
            video_device: None,
            video_width: Some(1280),
            video_height: Some(720),
            frame_rate: Some(30),
        }
    }
}

/// Options for display capture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreenShareOptions {
    /// Capture system audio alongside the screen
    pub audio: bool,
}

/// One local audio or video track
///
/// The `enabled` flag is the mute switch: flipping it does not detach the
/// track from any sender. `end` marks the track dead (device released, or
/// the browser-level "stop sharing" control), which is irreversible.
pub struct LocalTrack {
    id: TrackId,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: AtomicBool,
    ended_notify: Notify,
}

impl LocalTrack {
    #[must_use]
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: TrackId::generate(),
            kind,
            source,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            ended_notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.source
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Mark the track ended and wake every `ended()` waiter
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.ended_notify.notify_waiters();
    }

    /// Resolve when the track ends
    pub async fn ended(&self) {
        loop {
            let notified = self.ended_notify.notified();
            if self.is_ended() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A named bundle of local tracks
#[derive(Debug)]
pub struct LocalStream {
    id: StreamId,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    #[must_use]
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: StreamId::generate(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    #[must_use]
    pub fn track_of_kind(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind).cloned()
    }
}

/// Media acquisition failure, mapped onto the engine's error codes
#[derive(Debug, Error)]
pub enum MediaDeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<MediaDeviceError> for EngineError {
    fn from(err: MediaDeviceError) -> Self {
        match err {
            MediaDeviceError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            MediaDeviceError::DeviceNotFound(msg) => Self::DeviceNotFound(msg),
            MediaDeviceError::Other(msg) => Self::Media(msg),
        }
    }
}

/// `getUserMedia`/`getDisplayMedia`-style acquisition capability
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire camera and/or microphone per the constraints
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalStream, MediaDeviceError>;

    /// Acquire a screen-capture stream
    async fn get_display_media(
        &self,
        options: &ScreenShareOptions,
    ) -> std::result::Result<LocalStream, MediaDeviceError>;
}

/// Owns the local capture streams for one session
pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    local: RwLock<Option<Arc<LocalStream>>>,
    screen: RwLock<Option<Arc<LocalStream>>>,
}

impl MediaPipeline {
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: RwLock::new(None),
            screen: RwLock::new(None),
        }
    }

    /// Acquire the local camera/microphone stream
    pub async fn acquire_local_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalStream>> {
        let stream = Arc::new(self.devices.get_user_media(constraints).await?);
        info!(
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "acquired local media stream"
        );
        *self.local.write() = Some(Arc::clone(&stream));
        Ok(stream)
    }

    #[must_use]
    pub fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.local.read().clone()
    }

    #[must_use]
    pub fn screen_stream(&self) -> Option<Arc<LocalStream>> {
        self.screen.read().clone()
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.screen.read().is_some()
    }

    /// Flip the microphone track's `enabled` flag. `None` toggles.
    /// Returns the new state.
    pub fn toggle_audio(&self, enabled: Option<bool>) -> Result<bool> {
        self.toggle_kind(TrackKind::Audio, enabled)
    }

    /// Flip the camera track's `enabled` flag. `None` toggles.
    /// Returns the new state.
    pub fn toggle_video(&self, enabled: Option<bool>) -> Result<bool> {
        self.toggle_kind(TrackKind::Video, enabled)
    }

    fn toggle_kind(&self, kind: TrackKind, enabled: Option<bool>) -> Result<bool> {
        let guard = self.local.read();
        let track = guard
            .as_ref()
            .and_then(|s| s.track_of_kind(kind))
            .ok_or_else(|| EngineError::Media(format!("no local {kind:?} track").to_lowercase()))?;

        let new_state = enabled.unwrap_or(!track.is_enabled());
        track.set_enabled(new_state);
        debug!(track_id = %track.id(), kind = ?kind, enabled = new_state, "toggled local track");
        Ok(new_state)
    }

    /// Re-acquire the camera/microphone stream against new constraints
    /// (device switch). Mute state carries over to the replacement tracks;
    /// the old tracks are ended after the swap.
    pub async fn switch_input(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalStream>> {
        let old = self
            .local
            .read()
            .clone()
            .ok_or_else(|| EngineError::Media("no local stream to switch".into()))?;

        let stream = Arc::new(self.devices.get_user_media(constraints).await?);
        for track in stream.tracks() {
            if let Some(prev) = old.track_of_kind(track.kind()) {
                track.set_enabled(prev.is_enabled());
            }
        }

        *self.local.write() = Some(Arc::clone(&stream));
        for track in old.tracks() {
            track.end();
        }

        info!(
            stream_id = %stream.id(),
            "switched local input devices"
        );
        Ok(stream)
    }

    /// Acquire a screen-capture stream and remember it as the active share
    pub async fn start_screen_share(
        &self,
        options: &ScreenShareOptions,
    ) -> Result<Arc<LocalStream>> {
        if self.is_screen_sharing() {
            return Err(EngineError::Media("screen share already active".into()));
        }

        let stream = Arc::new(self.devices.get_display_media(options).await?);
        if stream.track_of_kind(TrackKind::Video).is_none() {
            return Err(EngineError::Media(
                "display capture produced no video track".into(),
            ));
        }

        info!(stream_id = %stream.id(), "screen capture started");
        *self.screen.write() = Some(Arc::clone(&stream));
        Ok(stream)
    }

    /// End the active screen share, returning the stream if one was active.
    /// Safe to call when no share is active (the track-ended path and the
    /// explicit stop call race onto this method).
    pub fn stop_screen_share(&self) -> Option<Arc<LocalStream>> {
        let stream = self.screen.write().take()?;
        for track in stream.tracks() {
            track.end();
        }
        info!(stream_id = %stream.id(), "screen capture stopped");
        Some(stream)
    }

    /// End every local track and drop both streams. Idempotent.
    pub fn release_all(&self) {
        if let Some(stream) = self.local.write().take() {
            for track in stream.tracks() {
                track.end();
            }
        }
        if let Some(stream) = self.screen.write().take() {
            for track in stream.tracks() {
                track.end();
            }
        }
    }
}
