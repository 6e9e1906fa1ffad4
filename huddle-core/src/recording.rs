//! Session recording
//!
//! Composes selected local/remote tracks into one recordable stream and
//! drives the start/pause/resume/stop state machine:
//!
//! ```text
//! inactive --start--> recording --pause--> paused --resume--> recording
//!                          \____________________stop____________________/
//! ```
//!
//! `start` while a recording is active is an error; `pause`/`resume` in a
//! state where they do not apply are no-ops; `stop` on inactive is a no-op.
//! Encoded data is chunked on a fixed timeslice while recording; `stop`
//! flushes the remaining chunks, concatenates them into one blob and emits
//! it. Persistence of the blob is the caller's business.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::events::CallEvent;
use crate::media::TrackKind;
use crate::types::{ParticipantId, TrackId};

/// Recording lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Inactive,
    Recording,
    Paused,
}

/// Which sources to compose into the recording
#[derive(Debug, Clone, Default)]
pub struct RecordingOptions {
    /// Include the local camera/microphone stream
    pub include_camera: bool,
    /// Include the local screen-capture stream
    pub include_screen: bool,
    /// Include the streams of these remote participants
    pub remote_participants: Vec<ParticipantId>,
}

/// One track in the composite recording stream
#[derive(Debug, Clone)]
pub struct CompositeTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    /// `None` for local tracks
    pub owner: Option<ParticipantId>,
}

/// Encodes the composite stream into container chunks
pub trait MediaEncoder: Send {
    fn mime_type(&self) -> &str;

    /// Encode whatever samples arrived since the last call. `None` when
    /// nothing accumulated in this timeslice.
    fn poll_chunk(&mut self) -> Option<Bytes>;

    /// Flush trailing container data
    fn finish(&mut self) -> Bytes;
}

/// Creates encoders; `supports` drives the codec-candidate fallback
pub trait EncoderFactory: Send + Sync {
    fn supports(&self, mime_type: &str) -> bool;

    fn create(
        &self,
        mime_type: &str,
        tracks: &[CompositeTrack],
    ) -> Result<Box<dyn MediaEncoder>>;
}

struct RecorderInner {
    state: RecordingState,
    encoder: Option<Box<dyn MediaEncoder>>,
    chunks: Vec<Bytes>,
    mime_type: String,
    started_at: Option<Instant>,
    cancel: Option<CancellationToken>,
}

/// Drives one recording at a time for a session
pub struct Recorder {
    factory: Arc<dyn EncoderFactory>,
    timeslice: Duration,
    events: broadcast::Sender<CallEvent>,
    inner: Arc<Mutex<RecorderInner>>,
}

impl Recorder {
    #[must_use]
    pub fn new(
        factory: Arc<dyn EncoderFactory>,
        timeslice: Duration,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            factory,
            timeslice,
            events,
            inner: Arc::new(Mutex::new(RecorderInner {
                state: RecordingState::Inactive,
                encoder: None,
                chunks: Vec::new(),
                mime_type: String::new(),
                started_at: None,
                cancel: None,
            })),
        }
    }

    #[must_use]
    pub fn state(&self) -> RecordingState {
        self.inner.lock().state
    }

    /// Begin recording the given composite tracks. The encoder is chosen
    /// from the candidate list in descending priority; the first supported
    /// mime type wins.
    pub fn start(&self, mime_candidates: &[String], tracks: &[CompositeTrack]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Inactive {
            return Err(EngineError::Recording(
                "recording already in progress".into(),
            ));
        }
        if tracks.is_empty() {
            return Err(EngineError::Recording(
                "no tracks selected for recording".into(),
            ));
        }

        let mime_type = mime_candidates
            .iter()
            .find(|mime| self.factory.supports(mime))
            .cloned()
            .ok_or_else(|| EngineError::Recording("no supported recording codec".into()))?;

        inner.encoder = Some(self.factory.create(&mime_type, tracks)?);
        inner.chunks.clear();
        inner.mime_type = mime_type.clone();
        inner.state = RecordingState::Recording;
        inner.started_at = Some(Instant::now());

        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        drop(inner);

        let shared = Arc::clone(&self.inner);
        let timeslice = self.timeslice;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeslice);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut inner = shared.lock();
                        if inner.state != RecordingState::Recording {
                            continue;
                        }
                        if let Some(encoder) = inner.encoder.as_mut() {
                            if let Some(chunk) = encoder.poll_chunk() {
                                inner.chunks.push(chunk);
                            }
                        }
                    }
                }
            }
            debug!("recording chunk loop stopped");
        });

        info!(mime_type = %mime_type, track_count = tracks.len(), "recording started");
        let _ = self.events.send(CallEvent::RecordingStarted {
            mime_type,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Pause chunk capture. No-op unless recording.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Recording {
            return;
        }
        inner.state = RecordingState::Paused;
        drop(inner);
        let _ = self.events.send(CallEvent::RecordingPaused {
            timestamp: Utc::now(),
        });
    }

    /// Resume chunk capture. No-op unless paused.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Paused {
            return;
        }
        inner.state = RecordingState::Recording;
        drop(inner);
        let _ = self.events.send(CallEvent::RecordingResumed {
            timestamp: Utc::now(),
        });
    }

    /// Flush, concatenate and emit the finished recording. Returns `None`
    /// when no recording was active.
    pub fn stop(&self) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        if inner.state == RecordingState::Inactive {
            return Ok(None);
        }

        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }

        if let Some(mut encoder) = inner.encoder.take() {
            if let Some(chunk) = encoder.poll_chunk() {
                inner.chunks.push(chunk);
            }
            inner.chunks.push(encoder.finish());
        }

        let mut data = BytesMut::new();
        for chunk in inner.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        let blob = data.freeze();

        let duration_ms = inner
            .started_at
            .take()
            .map_or(0, |started| started.elapsed().as_millis() as u64);
        let mime_type = std::mem::take(&mut inner.mime_type);
        inner.state = RecordingState::Inactive;
        drop(inner);

        info!(
            mime_type = %mime_type,
            bytes = blob.len(),
            duration_ms,
            "recording stopped"
        );
        let _ = self.events.send(CallEvent::RecordingStopped {
            mime_type,
            data: blob.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
        Ok(Some(blob))
    }
}
