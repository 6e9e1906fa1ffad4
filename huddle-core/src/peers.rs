//! Peer connection manager
//!
//! Owns one transport-layer connection per remote participant and drives the
//! offer/answer/ICE exchange using the polite/impolite collision-resolution
//! protocol. The registry is owned exclusively by this manager; external
//! reads go through accessor methods returning snapshots, never raw
//! references.
//!
//! ## Negotiation state
//!
//! Instead of loose `makingOffer`/`ignoreOffer` booleans, each link carries
//! one explicit [`NegotiationState`]:
//!
//! - `Idle` — nothing in flight; negotiation-needed may start an offer
//! - `Offering` — our offer is signaled, answer outstanding
//! - `AnswerPending` — the answer arrived and is being applied
//! - `Ignoring` — impolite side dropped a colliding remote offer; remote
//!   candidates are dropped until our own offer's answer lands
//!
//! Politeness is fixed per pair at link creation: the side that receives the
//! join announcement initiates the first offer and is impolite; the
//! announcing side accepts that first offer and is polite. A remote offer
//! colliding with `Offering` is silently dropped on the impolite side and
//! rolled into an implicit rollback + answer on the polite side, so exactly
//! one offer wins per colliding pair without extra round-trips.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_signaling::{SignalEnvelope, SignalPayload};

use crate::config::IceServerConfig;
use crate::error::{EngineError, Result};
use crate::events::CallEvent;
use crate::media::{LocalTrack, MediaPipeline, TrackKind};
use crate::stats::NetworkQuality;
use crate::transport::{
    IceCandidate, PeerConnectionState, PeerTransport, PeerTransportFactory, RemoteTrack, SenderId,
    SessionDescription, SignalingState, TransportEvent,
};
use crate::types::{ParticipantId, RoomId, StreamId};

/// Per-link negotiation phase; see the module docs for the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AnswerPending,
    Ignoring,
}

/// A remote media stream as seen by the UI
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: StreamId,
    pub tracks: Vec<RemoteTrack>,
}

/// One remote room member. The instance inside the manager's registry is the
/// single source of truth for this peer's UI-visible state; callers only
/// ever see clones of it.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub streams: HashMap<StreamId, RemoteStream>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub connection_state: PeerConnectionState,
    pub quality: NetworkQuality,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Participant {
    fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            display_name: display_name.into(),
            streams: HashMap::new(),
            audio_enabled: false,
            video_enabled: false,
            screen_sharing: false,
            connection_state: PeerConnectionState::New,
            quality: NetworkQuality::Unknown,
            joined_at: now,
            last_activity: now,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Pairing of one transport with its participant plus negotiation bookkeeping
struct PeerLink {
    participant: Participant,
    transport: Arc<dyn PeerTransport>,
    polite: bool,
    negotiation: NegotiationState,
    /// Local track id -> sender binding on this transport
    senders: HashMap<crate::types::TrackId, SenderId>,
    /// The sender currently carrying our outgoing audio
    audio_sender: Option<SenderId>,
    /// The sender currently carrying our outgoing video (camera or screen)
    video_sender: Option<SenderId>,
    /// Forwards this transport's events into the shared pump channel
    forwarder: JoinHandle<()>,
}

/// Owns the participant-id -> link registry and the negotiation protocol
pub struct PeerManager {
    local_id: ParticipantId,
    display_name: String,
    room_id: RoomId,
    factory: Arc<dyn PeerTransportFactory>,
    ice_servers: Vec<IceServerConfig>,
    pipeline: Arc<MediaPipeline>,
    links: DashMap<ParticipantId, Arc<Mutex<PeerLink>>>,
    events: broadcast::Sender<CallEvent>,
    signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
    transport_tx: mpsc::UnboundedSender<(ParticipantId, TransportEvent)>,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: ParticipantId,
        display_name: String,
        room_id: RoomId,
        factory: Arc<dyn PeerTransportFactory>,
        ice_servers: Vec<IceServerConfig>,
        pipeline: Arc<MediaPipeline>,
        events: broadcast::Sender<CallEvent>,
        signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
        transport_tx: mpsc::UnboundedSender<(ParticipantId, TransportEvent)>,
    ) -> Self {
        Self {
            local_id,
            display_name,
            room_id,
            factory,
            ice_servers,
            pipeline,
            links: DashMap::new(),
            events,
            signal_tx,
            transport_tx,
        }
    }

    /// Create a link toward `remote` without attaching tracks.
    /// A link that already exists is left untouched.
    pub async fn create_connection(
        &self,
        remote: &ParticipantId,
        display_name: &str,
        polite: bool,
    ) -> Result<()> {
        if self.links.contains_key(remote) {
            warn!(participant_id = %remote, "link already exists, not overwriting");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = self
            .factory
            .create(remote, &self.ice_servers, tx)
            .await
            .map_err(|e| EngineError::PeerConnectionFailed(e.to_string()))?;

        let shared = self.transport_tx.clone();
        let pid = remote.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if shared.send((pid.clone(), event)).is_err() {
                    break;
                }
            }
        });

        let link = PeerLink {
            participant: Participant::new(remote.clone(), display_name),
            transport,
            polite,
            negotiation: NegotiationState::Idle,
            senders: HashMap::new(),
            audio_sender: None,
            video_sender: None,
            forwarder,
        };
        self.links.insert(remote.clone(), Arc::new(Mutex::new(link)));

        info!(
            room_id = %self.room_id,
            participant_id = %remote,
            polite,
            "created peer link"
        );
        Ok(())
    }

    /// React to a join announcement: create the link (impolite, we initiate)
    /// and attach the current local tracks, which kicks off the first offer.
    pub async fn connect_to(&self, remote: &ParticipantId, display_name: &str) -> Result<()> {
        self.create_connection(remote, display_name, false).await?;
        let Some(link_arc) = self.link(remote) else {
            return Ok(());
        };
        let mut link = link_arc.lock().await;
        self.attach_tracks_locked(&mut link).await
    }

    /// Handle a remote offer, resolving collisions per the politeness rule
    pub async fn handle_offer(
        &self,
        from: &ParticipantId,
        to: Option<&ParticipantId>,
        description: SessionDescription,
        display_name: &str,
    ) -> Result<()> {
        if !self.addressed_to_local(to) {
            debug!(participant_id = %from, "offer not addressed to us, ignored");
            return Ok(());
        }

        // First offer from an unknown peer: we announced, they initiated,
        // so our side of the pair is polite.
        if !self.links.contains_key(from) {
            self.create_connection(from, display_name, true).await?;
        }
        let Some(link_arc) = self.link(from) else {
            return Ok(());
        };
        let mut link = link_arc.lock().await;

        let collision = link.negotiation != NegotiationState::Idle
            || link.transport.signaling_state() != SignalingState::Stable;

        if collision && !link.polite {
            link.negotiation = NegotiationState::Ignoring;
            debug!(
                participant_id = %from,
                "offer collision: impolite side dropping remote offer"
            );
            return Ok(());
        }

        // Accept. An in-flight local offer is implicitly rolled back by the
        // transport when the remote offer is applied.
        link.transport
            .set_remote_description(description)
            .await
            .map_err(|e| EngineError::Signaling(format!("failed to apply remote offer: {e}")))?;

        // Tracks attached here ride along in the answer; the transport does
        // not raise negotiation-needed while non-stable.
        self.attach_tracks_locked(&mut link).await?;

        let answer = link
            .transport
            .set_local_description()
            .await
            .map_err(|e| EngineError::Signaling(format!("failed to create answer: {e}")))?;
        link.negotiation = NegotiationState::Idle;
        link.participant.touch();

        self.send_signal(SignalEnvelope::to_peer(
            self.room_id.clone(),
            self.local_id.clone(),
            from.clone(),
            SignalPayload::Answer {
                description: answer,
            },
        ));
        Ok(())
    }

    /// Handle a remote answer to our in-flight offer
    pub async fn handle_answer(
        &self,
        from: &ParticipantId,
        to: Option<&ParticipantId>,
        description: SessionDescription,
    ) -> Result<()> {
        if !self.addressed_to_local(to) {
            debug!(participant_id = %from, "answer not addressed to us, ignored");
            return Ok(());
        }
        let Some(link_arc) = self.link(from) else {
            debug!(participant_id = %from, "answer for unknown connection, dropped");
            return Ok(());
        };
        let mut link = link_arc.lock().await;

        match link.negotiation {
            // `Ignoring` implies our own offer is still outstanding; its
            // answer resolves the glare.
            NegotiationState::Offering | NegotiationState::Ignoring => {
                link.negotiation = NegotiationState::AnswerPending;
                let applied = link.transport.set_remote_description(description).await;
                link.negotiation = NegotiationState::Idle;
                applied.map_err(|e| {
                    EngineError::Signaling(format!("failed to apply answer: {e}"))
                })?;
                link.participant.touch();
            }
            state => {
                debug!(participant_id = %from, ?state, "discarding unexpected answer");
            }
        }
        Ok(())
    }

    /// Handle a remote ICE candidate
    pub async fn handle_candidate(
        &self,
        from: &ParticipantId,
        to: Option<&ParticipantId>,
        candidate: IceCandidate,
    ) -> Result<()> {
        if !self.addressed_to_local(to) {
            debug!(participant_id = %from, "candidate not addressed to us, ignored");
            return Ok(());
        }
        let Some(link_arc) = self.link(from) else {
            // Not the glare case: the connection is simply gone.
            debug!(participant_id = %from, "candidate for unknown connection, dropped");
            return Ok(());
        };
        let link = link_arc.lock().await;

        if link.negotiation == NegotiationState::Ignoring {
            debug!(
                participant_id = %from,
                "candidate dropped: remote offer was ignored after collision"
            );
            return Ok(());
        }

        link.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| {
                EngineError::PeerConnectionFailed(format!("candidate rejected for {from}: {e}"))
            })
    }

    /// Dispatch one of the five transport callbacks
    pub async fn handle_transport_event(
        &self,
        participant_id: &ParticipantId,
        event: TransportEvent,
    ) -> Result<()> {
        match event {
            TransportEvent::NegotiationNeeded => self.negotiate(participant_id).await,
            TransportEvent::IceCandidate(candidate) => {
                self.send_signal(SignalEnvelope::to_peer(
                    self.room_id.clone(),
                    self.local_id.clone(),
                    participant_id.clone(),
                    SignalPayload::Candidate { candidate },
                ));
                Ok(())
            }
            TransportEvent::ConnectionStateChanged(state) => {
                self.on_connection_state(participant_id, state).await
            }
            TransportEvent::TrackReceived(track) => self.on_track(participant_id, track).await,
            TransportEvent::IceConnectionStateChanged(state) => {
                debug!(participant_id = %participant_id, ?state, "ice connection state changed");
                Ok(())
            }
        }
    }

    /// Attach a newly added local track to every existing link, triggering
    /// the renegotiation path on each (never a new connection).
    pub async fn attach_track_to_all(&self, track: Arc<LocalTrack>) -> Result<()> {
        for (pid, link_arc) in self.link_snapshot() {
            let mut link = link_arc.lock().await;
            if link.senders.contains_key(track.id()) {
                continue;
            }
            match link.transport.add_track(Arc::clone(&track)).await {
                Ok(sender) => {
                    match track.kind() {
                        TrackKind::Audio if link.audio_sender.is_none() => {
                            link.audio_sender = Some(sender);
                        }
                        TrackKind::Video if link.video_sender.is_none() => {
                            link.video_sender = Some(sender);
                        }
                        _ => {}
                    }
                    link.senders.insert(track.id().clone(), sender);
                }
                Err(e) => {
                    warn!(participant_id = %pid, error = %e, "failed to attach track");
                }
            }
        }
        Ok(())
    }

    /// Swap the outgoing video track on every link's sender in place.
    /// No renegotiation, no connection teardown: the camera/screen switch
    /// must not disturb established connections.
    pub async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.replace_track_of_kind(track, TrackKind::Video).await
    }

    /// Swap the outgoing audio track on every link's sender in place
    /// (microphone device switch)
    pub async fn replace_audio_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.replace_track_of_kind(track, TrackKind::Audio).await
    }

    async fn replace_track_of_kind(&self, track: Arc<LocalTrack>, kind: TrackKind) -> Result<()> {
        for (pid, link_arc) in self.link_snapshot() {
            let mut link = link_arc.lock().await;
            let slot = match kind {
                TrackKind::Audio => link.audio_sender,
                TrackKind::Video => link.video_sender,
            };
            match slot {
                Some(sender) => {
                    if let Err(e) = link.transport.replace_track(sender, Arc::clone(&track)).await
                    {
                        warn!(participant_id = %pid, error = %e, "failed to replace track");
                        continue;
                    }
                    let old_id = link
                        .senders
                        .iter()
                        .find(|(_, s)| **s == sender)
                        .map(|(id, _)| id.clone());
                    if let Some(old_id) = old_id {
                        link.senders.remove(&old_id);
                    }
                    link.senders.insert(track.id().clone(), sender);
                }
                None => match link.transport.add_track(Arc::clone(&track)).await {
                    Ok(sender) => {
                        match kind {
                            TrackKind::Audio => link.audio_sender = Some(sender),
                            TrackKind::Video => link.video_sender = Some(sender),
                        }
                        link.senders.insert(track.id().clone(), sender);
                    }
                    Err(e) => {
                        warn!(participant_id = %pid, error = %e, "failed to add replacement track");
                    }
                },
            }
        }
        Ok(())
    }

    /// Remove a link, close its transport and announce the departure
    pub async fn remove_connection(&self, participant_id: &ParticipantId) {
        let Some((_, link_arc)) = self.links.remove(participant_id) else {
            return;
        };
        let link = link_arc.lock().await;
        link.forwarder.abort();
        link.transport.close().await;

        for stream_id in link.participant.streams.keys() {
            self.emit(CallEvent::StreamRemoved {
                participant_id: participant_id.clone(),
                stream_id: stream_id.clone(),
                timestamp: Utc::now(),
            });
        }
        self.emit(CallEvent::PeerDisconnected {
            participant_id: participant_id.clone(),
            timestamp: Utc::now(),
        });

        info!(room_id = %self.room_id, participant_id = %participant_id, "removed peer link");
    }

    /// Close every link (session teardown)
    pub async fn close_all(&self) {
        let ids: Vec<ParticipantId> = self.links.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove_connection(&id).await;
        }
    }

    /// Snapshot of every participant
    pub async fn participants(&self) -> Vec<Participant> {
        let mut out = Vec::new();
        for (_, link_arc) in self.link_snapshot() {
            out.push(link_arc.lock().await.participant.clone());
        }
        out
    }

    /// Snapshot of one participant
    pub async fn participant(&self, participant_id: &ParticipantId) -> Option<Participant> {
        let link_arc = self.link(participant_id)?;
        let link = link_arc.lock().await;
        Some(link.participant.clone())
    }

    /// Current negotiation phase of one link, for diagnostics
    pub async fn negotiation_state(
        &self,
        participant_id: &ParticipantId,
    ) -> Option<NegotiationState> {
        let link_arc = self.link(participant_id)?;
        let link = link_arc.lock().await;
        Some(link.negotiation)
    }

    /// Transport handles for the stats monitor
    pub async fn transports(&self) -> Vec<(ParticipantId, Arc<dyn PeerTransport>)> {
        let mut out = Vec::new();
        for (pid, link_arc) in self.link_snapshot() {
            out.push((pid, Arc::clone(&link_arc.lock().await.transport)));
        }
        out
    }

    /// Write a freshly computed quality grade onto the participant.
    /// Returns whether the grade changed.
    pub async fn apply_quality(
        &self,
        participant_id: &ParticipantId,
        quality: NetworkQuality,
    ) -> bool {
        let Some(link_arc) = self.link(participant_id) else {
            return false;
        };
        let mut link = link_arc.lock().await;
        if link.participant.quality == quality {
            return false;
        }
        link.participant.quality = quality;
        link.participant.touch();
        true
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    fn addressed_to_local(&self, to: Option<&ParticipantId>) -> bool {
        match to {
            Some(to) => *to == self.local_id,
            None => true,
        }
    }

    fn link(&self, participant_id: &ParticipantId) -> Option<Arc<Mutex<PeerLink>>> {
        self.links.get(participant_id).map(|e| Arc::clone(e.value()))
    }

    fn link_snapshot(&self) -> Vec<(ParticipantId, Arc<Mutex<PeerLink>>)> {
        self.links
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Start an offer if the link is idle; negotiation-needed conditions that
    /// fire mid-negotiation are deliberately skipped, the pending cycle
    /// already carries the change.
    async fn negotiate(&self, participant_id: &ParticipantId) -> Result<()> {
        let Some(link_arc) = self.link(participant_id) else {
            return Ok(());
        };
        let mut link = link_arc.lock().await;

        if link.negotiation != NegotiationState::Idle {
            debug!(
                participant_id = %participant_id,
                state = ?link.negotiation,
                "negotiation needed while busy, skipped"
            );
            return Ok(());
        }
        if link.transport.signaling_state() != SignalingState::Stable {
            debug!(participant_id = %participant_id, "negotiation needed while not stable, skipped");
            return Ok(());
        }

        link.negotiation = NegotiationState::Offering;
        let offer = match link.transport.set_local_description().await {
            Ok(offer) => offer,
            Err(e) => {
                link.negotiation = NegotiationState::Idle;
                return Err(EngineError::Signaling(format!(
                    "failed to create offer: {e}"
                )));
            }
        };

        self.send_signal(SignalEnvelope::to_peer(
            self.room_id.clone(),
            self.local_id.clone(),
            participant_id.clone(),
            SignalPayload::Offer {
                description: offer,
                display_name: self.display_name.clone(),
            },
        ));
        Ok(())
    }

    async fn on_connection_state(
        &self,
        participant_id: &ParticipantId,
        state: PeerConnectionState,
    ) -> Result<()> {
        {
            let Some(link_arc) = self.link(participant_id) else {
                return Ok(());
            };
            let mut link = link_arc.lock().await;
            link.participant.connection_state = state;
            link.participant.touch();
        }

        self.emit(CallEvent::ConnectionStateChanged {
            participant_id: participant_id.clone(),
            state,
            timestamp: Utc::now(),
        });

        match state {
            PeerConnectionState::Connected => {
                self.emit(CallEvent::PeerConnected {
                    participant_id: participant_id.clone(),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            PeerConnectionState::Failed => {
                self.remove_connection(participant_id).await;
                Err(EngineError::PeerConnectionFailed(format!(
                    "transport failed for {participant_id}"
                )))
            }
            PeerConnectionState::Closed => {
                self.remove_connection(participant_id).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_track(&self, participant_id: &ParticipantId, track: RemoteTrack) -> Result<()> {
        let Some(link_arc) = self.link(participant_id) else {
            return Ok(());
        };
        let mut link = link_arc.lock().await;

        match track.kind {
            TrackKind::Audio => link.participant.audio_enabled = true,
            TrackKind::Video => link.participant.video_enabled = true,
        }

        let stream_id = track.stream_id.clone();
        let is_new_stream = !link.participant.streams.contains_key(&stream_id);
        link.participant
            .streams
            .entry(stream_id.clone())
            .or_insert_with(|| RemoteStream {
                id: stream_id.clone(),
                tracks: Vec::new(),
            })
            .tracks
            .push(track);
        link.participant.touch();
        drop(link);

        if is_new_stream {
            self.emit(CallEvent::StreamAdded {
                participant_id: participant_id.clone(),
                stream_id,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Attach every currently active local track that this link does not
    /// carry yet. The outgoing video source is the screen while sharing,
    /// the camera otherwise.
    async fn attach_tracks_locked(&self, link: &mut PeerLink) -> Result<()> {
        let audio = self
            .pipeline
            .local_stream()
            .and_then(|s| s.track_of_kind(TrackKind::Audio));
        let video = self
            .pipeline
            .screen_stream()
            .and_then(|s| s.track_of_kind(TrackKind::Video))
            .or_else(|| {
                self.pipeline
                    .local_stream()
                    .and_then(|s| s.track_of_kind(TrackKind::Video))
            });

        for track in [audio, video].into_iter().flatten() {
            if link.senders.contains_key(track.id()) {
                continue;
            }
            let sender = link
                .transport
                .add_track(Arc::clone(&track))
                .await
                .map_err(|e| EngineError::PeerConnectionFailed(e.to_string()))?;
            match track.kind() {
                TrackKind::Audio => link.audio_sender = Some(sender),
                TrackKind::Video => link.video_sender = Some(sender),
            }
            link.senders.insert(track.id().clone(), sender);
        }
        Ok(())
    }

    fn send_signal(&self, envelope: SignalEnvelope) {
        // The session's pump forwards these to the signaling channel; a
        // closed channel means the session is tearing down.
        let _ = self.signal_tx.send(envelope);
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}
