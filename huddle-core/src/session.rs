//! Session controller
//!
//! The facade over the engine: composes the media pipeline, peer manager,
//! recorder and stats monitor, runs the single event pump that feeds
//! signaling and transport events into the manager, and re-emits everything
//! through one broadcast channel.
//!
//! `cleanup` is the single guaranteed teardown path and is idempotent;
//! every teardown step runs even when an earlier one fails.

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_signaling::{SignalEnvelope, SignalPayload, SignalingTransport};

use crate::config::CallConfig;
use crate::error::{EngineError, Result};
use crate::events::CallEvent;
use crate::media::{
    LocalStream, MediaConstraints, MediaDevices, MediaPipeline, ScreenShareOptions, TrackKind,
};
use crate::peers::{Participant, PeerManager};
use crate::recording::{
    CompositeTrack, EncoderFactory, Recorder, RecordingOptions, RecordingState,
};
use crate::stats::StatsMonitor;
use crate::transport::{PeerTransportFactory, TransportEvent};
use crate::types::ParticipantId;

/// External collaborators injected at construction
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub encoders: Arc<dyn EncoderFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    Live,
    Closed,
}

/// One call session: join a room, exchange media, leave
pub struct CallSession {
    config: CallConfig,
    signaling: Arc<dyn SignalingTransport>,
    pipeline: Arc<MediaPipeline>,
    manager: Arc<PeerManager>,
    recorder: Recorder,
    monitor: Mutex<Option<StatsMonitor>>,
    events: broadcast::Sender<CallEvent>,
    phase: Mutex<SessionPhase>,
    signal_out_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalEnvelope>>>,
    transport_rx: Mutex<Option<mpsc::UnboundedReceiver<(ParticipantId, TransportEvent)>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    #[must_use]
    pub fn new(config: CallConfig, deps: SessionDeps) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (signal_tx, signal_out_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let pipeline = Arc::new(MediaPipeline::new(deps.devices));
        let manager = Arc::new(PeerManager::new(
            config.local_id.clone(),
            config.display_name.clone(),
            config.room_id.clone(),
            deps.transports,
            config.ice_servers.clone(),
            Arc::clone(&pipeline),
            events.clone(),
            signal_tx,
            transport_tx,
        ));
        let recorder = Recorder::new(deps.encoders, config.recording_timeslice(), events.clone());

        Arc::new(Self {
            config,
            signaling: deps.signaling,
            pipeline,
            manager,
            recorder,
            monitor: Mutex::new(None),
            events,
            phase: Mutex::new(SessionPhase::Idle),
            signal_out_rx: Mutex::new(Some(signal_out_rx)),
            transport_rx: Mutex::new(Some(transport_rx)),
            pump: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to the engine's outbound events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Acquire local media (if configured), open the signaling channel,
    /// start the pumps and announce presence to the room.
    pub async fn initialize(&self) -> Result<()> {
        if *self.phase.lock() != SessionPhase::Idle {
            return Err(EngineError::InvalidState(
                "session already initialized".into(),
            ));
        }

        if self.config.audio || self.config.video {
            let mut constraints = self.config.constraints.clone();
            constraints.audio = self.config.audio;
            constraints.video = self.config.video;
            self.pipeline.acquire_local_stream(&constraints).await?;
        }

        // A channel error here is fatal to session start.
        let inbound = self.signaling.connect(&self.config.room_id).await?;

        let outbound = self
            .signal_out_rx
            .lock()
            .take()
            .ok_or_else(|| EngineError::InvalidState("session already initialized".into()))?;
        let transport_events = self
            .transport_rx
            .lock()
            .take()
            .ok_or_else(|| EngineError::InvalidState("session already initialized".into()))?;

        let pump = tokio::spawn(Self::run_pump(
            Arc::clone(&self.manager),
            Arc::clone(&self.signaling),
            self.events.clone(),
            self.config.local_id.clone(),
            inbound,
            outbound,
            transport_events,
        ));
        *self.pump.lock() = Some(pump);

        *self.monitor.lock() = Some(StatsMonitor::spawn(
            Arc::clone(&self.manager),
            self.events.clone(),
            self.config.stats_interval(),
        ));

        self.signaling
            .send(SignalEnvelope::broadcast(
                self.config.room_id.clone(),
                self.config.local_id.clone(),
                SignalPayload::Join {
                    display_name: self.config.display_name.clone(),
                    audio: self.config.audio,
                    video: self.config.video,
                },
            ))
            .await?;

        *self.phase.lock() = SessionPhase::Live;
        info!(
            room_id = %self.config.room_id,
            participant_id = %self.config.local_id,
            "session initialized"
        );
        Ok(())
    }

    /// Flip the microphone's `enabled` flag; `None` toggles
    pub fn toggle_audio(&self, enabled: Option<bool>) -> Result<bool> {
        self.pipeline.toggle_audio(enabled)
    }

    /// Flip the camera's `enabled` flag; `None` toggles
    pub fn toggle_video(&self, enabled: Option<bool>) -> Result<bool> {
        self.pipeline.toggle_video(enabled)
    }

    /// Switch capture devices: re-acquire local media against the new
    /// constraints and swap the outgoing tracks in place on every peer.
    /// While a screen share is active only the audio sender is touched; the
    /// share keeps the video sender until it ends.
    pub async fn switch_input_devices(&self, constraints: &MediaConstraints) -> Result<()> {
        self.ensure_live()?;

        let stream = self.pipeline.switch_input(constraints).await?;
        if let Some(audio) = stream.track_of_kind(TrackKind::Audio) {
            self.manager.replace_audio_track(audio).await?;
        }
        if !self.pipeline.is_screen_sharing() {
            if let Some(video) = stream.track_of_kind(TrackKind::Video) {
                self.manager.replace_video_track(video).await?;
            }
        }
        Ok(())
    }

    /// Start screen sharing: the outgoing video track on every peer sender
    /// is replaced in place, preserving the connections.
    pub async fn start_screen_share(&self, options: &ScreenShareOptions) -> Result<()> {
        self.ensure_live()?;

        let stream = self.pipeline.start_screen_share(options).await?;
        let track = stream
            .track_of_kind(TrackKind::Video)
            .ok_or_else(|| EngineError::Media("display capture produced no video track".into()))?;

        self.manager.replace_video_track(Arc::clone(&track)).await?;
        let _ = self.events.send(CallEvent::ScreenShareStarted {
            timestamp: Utc::now(),
        });

        // The browser-level "stop sharing" control surfaces as the track
        // ending; route it through the same stop path.
        let pipeline = Arc::clone(&self.pipeline);
        let manager = Arc::clone(&self.manager);
        let events = self.events.clone();
        let watched = Arc::clone(&track);
        let watcher = tokio::spawn(async move {
            watched.ended().await;
            Self::end_screen_share(&pipeline, &manager, &events).await;
        });
        self.watchers.lock().push(watcher);
        Ok(())
    }

    /// Stop screen sharing and restore the camera track on every sender.
    /// No-op when no share is active.
    pub async fn stop_screen_share(&self) -> Result<()> {
        Self::end_screen_share(&self.pipeline, &self.manager, &self.events).await;
        Ok(())
    }

    async fn end_screen_share(
        pipeline: &Arc<MediaPipeline>,
        manager: &Arc<PeerManager>,
        events: &broadcast::Sender<CallEvent>,
    ) {
        // The explicit stop and the track-ended watcher race onto this
        // method; whoever takes the stream does the work.
        if pipeline.stop_screen_share().is_none() {
            return;
        }

        if let Some(camera) = pipeline
            .local_stream()
            .and_then(|s| s.track_of_kind(TrackKind::Video))
        {
            if let Err(e) = manager.replace_video_track(camera).await {
                warn!(error = %e, "failed to restore camera track after screen share");
            }
        }

        let _ = events.send(CallEvent::ScreenShareEnded {
            timestamp: Utc::now(),
        });
    }

    /// Start recording the selected sources
    pub async fn start_recording(&self, options: &RecordingOptions) -> Result<()> {
        self.ensure_live()?;

        let mut tracks = Vec::new();
        if options.include_camera {
            if let Some(stream) = self.pipeline.local_stream() {
                for track in stream.tracks() {
                    tracks.push(CompositeTrack {
                        id: track.id().clone(),
                        kind: track.kind(),
                        owner: None,
                    });
                }
            }
        }
        if options.include_screen {
            if let Some(stream) = self.pipeline.screen_stream() {
                for track in stream.tracks() {
                    tracks.push(CompositeTrack {
                        id: track.id().clone(),
                        kind: track.kind(),
                        owner: None,
                    });
                }
            }
        }
        for participant_id in &options.remote_participants {
            if let Some(participant) = self.manager.participant(participant_id).await {
                for stream in participant.streams.values() {
                    for track in &stream.tracks {
                        tracks.push(CompositeTrack {
                            id: track.id.clone(),
                            kind: track.kind,
                            owner: Some(participant_id.clone()),
                        });
                    }
                }
            }
        }

        self.recorder
            .start(&self.config.recording_mime_candidates, &tracks)
    }

    pub fn pause_recording(&self) {
        self.recorder.pause();
    }

    pub fn resume_recording(&self) {
        self.recorder.resume();
    }

    /// Stop recording and return the blob, `None` when none was active
    pub fn stop_recording(&self) -> Result<Option<Bytes>> {
        self.recorder.stop()
    }

    #[must_use]
    pub fn recording_state(&self) -> RecordingState {
        self.recorder.state()
    }

    /// Snapshot of every known remote participant
    pub async fn participants(&self) -> Vec<Participant> {
        self.manager.participants().await
    }

    /// Snapshot of one remote participant
    pub async fn participant(&self, id: &ParticipantId) -> Option<Participant> {
        self.manager.participant(id).await
    }

    #[must_use]
    pub fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.pipeline.local_stream()
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.pipeline.is_screen_sharing()
    }

    /// Tear everything down: recording, local media, peer connections, the
    /// stats interval, presence, signaling, pumps. Idempotent, and every
    /// step runs even if an earlier one fails.
    pub async fn cleanup(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == SessionPhase::Closed {
                return Ok(());
            }
            *phase = SessionPhase::Closed;
        }
        info!(room_id = %self.config.room_id, "session cleanup started");

        if let Err(e) = self.recorder.stop() {
            warn!(error = %e, "failed to stop recording during cleanup");
        }

        self.pipeline.release_all();

        self.manager.close_all().await;

        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let leave = SignalEnvelope::broadcast(
            self.config.room_id.clone(),
            self.config.local_id.clone(),
            SignalPayload::Leave,
        );
        if let Err(e) = self.signaling.send(leave).await {
            debug!(error = %e, "failed to announce leave during cleanup");
        }

        self.signaling.disconnect().await;

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }

        info!(room_id = %self.config.room_id, "session cleanup finished");
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if *self.phase.lock() == SessionPhase::Live {
            Ok(())
        } else {
            Err(EngineError::InvalidState("session is not live".into()))
        }
    }

    /// The single event pump: inbound signals, outbound signals and
    /// transport callbacks are interleaved here, so each peer link has one
    /// logical writer.
    async fn run_pump(
        manager: Arc<PeerManager>,
        signaling: Arc<dyn SignalingTransport>,
        events: broadcast::Sender<CallEvent>,
        local_id: ParticipantId,
        mut inbound: mpsc::UnboundedReceiver<SignalEnvelope>,
        mut outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
        mut transport_events: mpsc::UnboundedReceiver<(ParticipantId, TransportEvent)>,
    ) {
        loop {
            tokio::select! {
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    Self::handle_envelope(&manager, &events, &local_id, envelope).await;
                }
                envelope = outbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(e) = signaling.send(envelope).await {
                        let err = EngineError::from(e);
                        warn!(error = %err, "failed to send signal");
                        let _ = events.send(CallEvent::from_error(&err));
                    }
                }
                event = transport_events.recv() => {
                    let Some((participant_id, event)) = event else { break };
                    if let Err(e) = manager.handle_transport_event(&participant_id, event).await {
                        let _ = events.send(CallEvent::from_error(&e));
                    }
                }
            }
        }
        debug!("session event pump stopped");
    }

    async fn handle_envelope(
        manager: &Arc<PeerManager>,
        events: &broadcast::Sender<CallEvent>,
        local_id: &ParticipantId,
        envelope: SignalEnvelope,
    ) {
        if envelope.from == *local_id {
            return;
        }

        let from = envelope.from.clone();
        let to = envelope.to.clone();
        let result = match envelope.payload {
            SignalPayload::Join { display_name, .. } => {
                manager.connect_to(&from, &display_name).await
            }
            SignalPayload::Leave => {
                manager.remove_connection(&from).await;
                Ok(())
            }
            SignalPayload::Offer {
                description,
                display_name,
            } => {
                manager
                    .handle_offer(&from, to.as_ref(), description, &display_name)
                    .await
            }
            SignalPayload::Answer { description } => {
                manager.handle_answer(&from, to.as_ref(), description).await
            }
            SignalPayload::Candidate { candidate } => {
                manager.handle_candidate(&from, to.as_ref(), candidate).await
            }
        };

        if let Err(e) = result {
            warn!(participant_id = %from, error = %e, "signal handling failed");
            let _ = events.send(CallEvent::from_error(&e));
        }
    }
}
