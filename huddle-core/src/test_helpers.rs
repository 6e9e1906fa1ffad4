//! In-process fakes for the engine's external collaborators
//!
//! Used by the unit and integration suites: device acquisition that mints
//! plain tracks, and a deterministic encoder. The in-process peer transport
//! lives in [`crate::transport::memory`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDeviceError, MediaDevices, ScreenShareOptions,
    TrackKind, TrackSource,
};
use crate::recording::{CompositeTrack, EncoderFactory, MediaEncoder};

/// How a fake acquisition call should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    /// The user/OS refused access
    Denied,
    /// No matching capture device exists
    Missing,
}

/// Media acquisition that fabricates live tracks without any hardware
pub struct FakeDevices {
    user_media_failure: Mutex<Option<FakeFailure>>,
    display_media_failure: Mutex<Option<FakeFailure>>,
}

impl FakeDevices {
    #[must_use]
    pub fn new() -> Self {
        Self {
            user_media_failure: Mutex::new(None),
            display_media_failure: Mutex::new(None),
        }
    }

    /// Make every subsequent `get_user_media` call fail
    pub fn fail_user_media(&self, failure: FakeFailure) {
        *self.user_media_failure.lock() = Some(failure);
    }

    /// Make every subsequent `get_display_media` call fail
    pub fn fail_display_media(&self, failure: FakeFailure) {
        *self.display_media_failure.lock() = Some(failure);
    }
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self::new()
    }
}

fn failure_error(failure: FakeFailure, what: &str) -> MediaDeviceError {
    match failure {
        FakeFailure::Denied => MediaDeviceError::PermissionDenied(format!("{what} access denied")),
        FakeFailure::Missing => MediaDeviceError::DeviceNotFound(format!("no {what} available")),
    }
}

#[async_trait::async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<LocalStream, MediaDeviceError> {
        if let Some(failure) = *self.user_media_failure.lock() {
            return Err(failure_error(failure, "camera"));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(
                TrackKind::Video,
                TrackSource::Camera,
            )));
        }
        Ok(LocalStream::new(tracks))
    }

    async fn get_display_media(
        &self,
        options: &ScreenShareOptions,
    ) -> std::result::Result<LocalStream, MediaDeviceError> {
        if let Some(failure) = *self.display_media_failure.lock() {
            return Err(failure_error(failure, "screen"));
        }

        let mut tracks = vec![Arc::new(LocalTrack::new(
            TrackKind::Video,
            TrackSource::Screen,
        ))];
        if options.audio {
            tracks.push(Arc::new(LocalTrack::new(
                TrackKind::Audio,
                TrackSource::Screen,
            )));
        }
        Ok(LocalStream::new(tracks))
    }
}

/// Encoder that emits a fixed-size chunk per timeslice and a trailer on
/// finish, so recording sizes are predictable in tests
pub struct FixedEncoder {
    mime_type: String,
    chunk_index: u64,
}

impl MediaEncoder for FixedEncoder {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn poll_chunk(&mut self) -> Option<Bytes> {
        self.chunk_index += 1;
        Some(Bytes::from(format!("chunk-{:04}\n", self.chunk_index)))
    }

    fn finish(&mut self) -> Bytes {
        Bytes::from_static(b"trailer\n")
    }
}

/// Factory with a configurable supported-mime set
pub struct FixedEncoderFactory {
    supported: Vec<String>,
}

impl FixedEncoderFactory {
    /// Supports the engine's default candidates
    #[must_use]
    pub fn new() -> Self {
        Self::supporting(&[
            "video/webm;codecs=vp9,opus",
            "video/webm;codecs=vp8,opus",
            "video/webm",
            "audio/webm",
        ])
    }

    #[must_use]
    pub fn supporting(mimes: &[&str]) -> Self {
        Self {
            supported: mimes.iter().map(ToString::to_string).collect(),
        }
    }

    /// Supports nothing; every start fails codec selection
    #[must_use]
    pub fn unsupported() -> Self {
        Self {
            supported: Vec::new(),
        }
    }
}

impl Default for FixedEncoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderFactory for FixedEncoderFactory {
    fn supports(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|m| m == mime_type)
    }

    fn create(
        &self,
        mime_type: &str,
        _tracks: &[CompositeTrack],
    ) -> Result<Box<dyn MediaEncoder>> {
        if !self.supports(mime_type) {
            return Err(EngineError::Recording(format!(
                "unsupported mime type {mime_type}"
            )));
        }
        Ok(Box::new(FixedEncoder {
            mime_type: mime_type.to_string(),
            chunk_index: 0,
        }))
    }
}
