//! In-process peer transport
//!
//! A deterministic implementation of the [`PeerTransport`] contract that
//! models the primitive's observable behavior — signaling-state machine,
//! implicit rollback on colliding offers, candidate gathering and buffering,
//! connection establishment, track delivery — without any networking. Two
//! endpoints created against the same [`MemoryTransportRouter`] under
//! mirrored `(owner, remote)` keys form one connection.
//!
//! The test suites drive entire calls through this transport; it also backs
//! single-process loopback setups.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::IceServerConfig;
use crate::media::LocalTrack;
use crate::transport::{
    IceCandidate, PeerConnectionState, PeerTransport, PeerTransportFactory, RemoteTrack, SdpType,
    SenderId, SessionDescription, SignalingState, TransportError, TransportEvent, TransportStats,
};
use crate::types::{ParticipantId, StreamId};

type PairKey = (ParticipantId, ParticipantId);

/// Links mirrored endpoints into connections
pub struct MemoryTransportRouter {
    endpoints: DashMap<PairKey, Arc<MemoryTransport>>,
}

impl MemoryTransportRouter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
        })
    }

    /// Endpoint owned by `owner` facing `remote`, if registered
    #[must_use]
    pub fn endpoint(
        &self,
        owner: &ParticipantId,
        remote: &ParticipantId,
    ) -> Option<Arc<MemoryTransport>> {
        self.endpoints
            .get(&(owner.clone(), remote.clone()))
            .map(|e| Arc::clone(e.value()))
    }

    fn register(&self, endpoint: Arc<MemoryTransport>) {
        self.endpoints.insert(
            (endpoint.owner.clone(), endpoint.remote.clone()),
            endpoint,
        );
    }

    fn unregister(&self, owner: &ParticipantId, remote: &ParticipantId) {
        self.endpoints.remove(&(owner.clone(), remote.clone()));
    }

    /// Re-evaluate one endpoint pair: establish the connection once both
    /// sides are negotiated and have candidates, then deliver any tracks the
    /// other side has not seen yet.
    fn sync_pair(&self, owner: &ParticipantId, remote: &ParticipantId) {
        let Some(a) = self.endpoint(owner, remote) else {
            return;
        };
        let Some(b) = self.endpoint(remote, owner) else {
            return;
        };

        // Consistent lock order across concurrent syncs from either side.
        let a_first = owner <= remote;
        let (mut first, mut second) = if a_first {
            (a.state.lock(), b.state.lock())
        } else {
            (b.state.lock(), a.state.lock())
        };
        let (a_state, b_state) = if a_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        let ready = |s: &EndpointState| {
            !s.closed
                && s.negotiated_once
                && s.signaling == SignalingState::Stable
                && !s.remote_candidates.is_empty()
        };
        if !ready(a_state) || !ready(b_state) {
            return;
        }

        for (endpoint, state) in [(&a, &mut *a_state), (&b, &mut *b_state)] {
            if state.connection != PeerConnectionState::Connected {
                state.connection = PeerConnectionState::Connecting;
                endpoint.send_event(TransportEvent::ConnectionStateChanged(
                    PeerConnectionState::Connecting,
                ));
                state.connection = PeerConnectionState::Connected;
                endpoint.send_event(TransportEvent::ConnectionStateChanged(
                    PeerConnectionState::Connected,
                ));
            }
        }

        deliver_tracks(&a, a_state, &b);
        deliver_tracks(&b, b_state, &a);
    }
}

/// Hand `from`'s undelivered outgoing tracks to `to` as remote tracks
fn deliver_tracks(from: &Arc<MemoryTransport>, from_state: &mut EndpointState, to: &Arc<MemoryTransport>) {
    let stream_id = StreamId::from(format!("{}-media", from.owner));
    let senders: Vec<(SenderId, Arc<LocalTrack>)> = from_state
        .senders
        .iter()
        .filter(|(id, _)| !from_state.delivered.contains(id))
        .map(|(id, track)| (*id, Arc::clone(track)))
        .collect();

    for (sender_id, track) in senders {
        to.send_event(TransportEvent::TrackReceived(RemoteTrack {
            id: track.id().clone(),
            stream_id: stream_id.clone(),
            kind: track.kind(),
            owner: from.owner.clone(),
        }));
        from_state.delivered.insert(sender_id);
    }
}

struct EndpointState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    has_remote_description: bool,
    negotiated_once: bool,
    /// Completed offer/answer cycles observed by this endpoint
    negotiation_rounds: u64,
    remote_candidates: Vec<IceCandidate>,
    /// Candidates that arrived before the remote description
    pending_candidates: Vec<IceCandidate>,
    senders: HashMap<SenderId, Arc<LocalTrack>>,
    delivered: HashSet<SenderId>,
    next_sender: u64,
    next_candidate: u64,
    stats: TransportStats,
    closed: bool,
}

/// One side of an in-process peer connection
pub struct MemoryTransport {
    owner: ParticipantId,
    remote: ParticipantId,
    router: Arc<MemoryTransportRouter>,
    state: Mutex<EndpointState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    fn new(
        owner: ParticipantId,
        remote: ParticipantId,
        router: Arc<MemoryTransportRouter>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            owner,
            remote,
            router,
            state: Mutex::new(EndpointState {
                signaling: SignalingState::Stable,
                connection: PeerConnectionState::New,
                has_remote_description: false,
                negotiated_once: false,
                negotiation_rounds: 0,
                remote_candidates: Vec::new(),
                pending_candidates: Vec::new(),
                senders: HashMap::new(),
                delivered: HashSet::new(),
                next_sender: 0,
                next_candidate: 0,
                stats: TransportStats::default(),
                closed: false,
            }),
            events,
        });
        endpoint.router.register(Arc::clone(&endpoint));
        endpoint
    }

    /// Completed offer/answer cycles, for renegotiation assertions in tests
    #[must_use]
    pub fn negotiation_rounds(&self) -> u64 {
        self.state.lock().negotiation_rounds
    }

    /// Sources currently bound to outgoing senders, for tests
    #[must_use]
    pub fn outgoing_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.state.lock().senders.values().cloned().collect()
    }

    /// Override the raw counters returned by `stats`, for tests
    pub fn set_stats(&self, stats: TransportStats) {
        self.state.lock().stats = stats;
    }

    /// Force a connection state and emit the change, simulating transport
    /// failures and drops
    pub fn force_connection_state(&self, state: PeerConnectionState) {
        self.state.lock().connection = state;
        self.send_event(TransportEvent::ConnectionStateChanged(state));
    }

    fn send_event(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn make_candidate(state: &mut EndpointState, owner: &ParticipantId) -> IceCandidate {
        state.next_candidate += 1;
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 UDP 2130706431 198.51.100.1 {} typ host",
                owner,
                49152 + state.next_candidate
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

#[async_trait::async_trait]
impl PeerTransport for MemoryTransport {
    async fn set_local_description(&self) -> Result<SessionDescription, TransportError> {
        let (description, candidate, answered) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            match state.signaling {
                SignalingState::Stable => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    let description =
                        SessionDescription::offer(format!("v=0 o={} offer", self.owner));
                    let candidate = Self::make_candidate(&mut state, &self.owner);
                    (description, candidate, false)
                }
                SignalingState::HaveRemoteOffer => {
                    state.signaling = SignalingState::Stable;
                    state.negotiated_once = true;
                    state.negotiation_rounds += 1;
                    let description =
                        SessionDescription::answer(format!("v=0 o={} answer", self.owner));
                    let candidate = Self::make_candidate(&mut state, &self.owner);
                    (description, candidate, true)
                }
                other => {
                    return Err(TransportError::InvalidState(format!(
                        "cannot create local description in {other:?}"
                    )));
                }
            }
        };

        // Applying a local description starts candidate gathering.
        self.send_event(TransportEvent::IceCandidate(candidate));
        if answered {
            self.router.sync_pair(&self.owner, &self.remote);
        }
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            match description.sdp_type {
                SdpType::Offer => match state.signaling {
                    SignalingState::Stable => {
                        state.signaling = SignalingState::HaveRemoteOffer;
                    }
                    SignalingState::HaveLocalOffer => {
                        // Implicit rollback: the pending local offer is
                        // discarded in favor of the remote one.
                        debug!(owner = %self.owner, remote = %self.remote, "rolled back local offer");
                        state.signaling = SignalingState::HaveRemoteOffer;
                    }
                    other => {
                        return Err(TransportError::InvalidState(format!(
                            "cannot apply remote offer in {other:?}"
                        )));
                    }
                },
                SdpType::Answer => match state.signaling {
                    SignalingState::HaveLocalOffer => {
                        state.signaling = SignalingState::Stable;
                        state.negotiated_once = true;
                        state.negotiation_rounds += 1;
                    }
                    other => {
                        return Err(TransportError::InvalidState(format!(
                            "cannot apply answer in {other:?}"
                        )));
                    }
                },
                SdpType::Pranswer | SdpType::Rollback => {
                    return Err(TransportError::InvalidState(format!(
                        "{} descriptions are not produced by this engine",
                        description.sdp_type.as_str()
                    )));
                }
            }

            state.has_remote_description = true;
            let buffered = std::mem::take(&mut state.pending_candidates);
            state.remote_candidates.extend(buffered);
        }

        self.router.sync_pair(&self.owner, &self.remote);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.has_remote_description {
                state.remote_candidates.push(candidate);
            } else {
                // Candidates may race ahead of the description; buffer them.
                state.pending_candidates.push(candidate);
                return Ok(());
            }
        }
        self.router.sync_pair(&self.owner, &self.remote);
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError> {
        let (sender, fire) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.next_sender += 1;
            let sender = SenderId(state.next_sender);
            state.senders.insert(sender, track);
            // A track added mid-negotiation rides along in the pending
            // cycle; only a stable-state addition needs a new one.
            (sender, state.signaling == SignalingState::Stable)
        };
        if fire {
            self.send_event(TransportEvent::NegotiationNeeded);
        }
        Ok(sender)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<LocalTrack>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !state.senders.contains_key(&sender) {
            return Err(TransportError::Failed(format!(
                "unknown sender {sender:?}"
            )));
        }
        // In-place swap: no renegotiation, no events, the remote side keeps
        // the same logical track.
        state.senders.insert(sender, track);
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError> {
        let fire = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.senders.remove(&sender).is_none() {
                return Err(TransportError::Failed(format!(
                    "unknown sender {sender:?}"
                )));
            }
            state.delivered.remove(&sender);
            state.signaling == SignalingState::Stable
        };
        if fire {
            self.send_event(TransportEvent::NegotiationNeeded);
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    async fn stats(&self) -> TransportStats {
        self.state.lock().stats.clone()
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.connection = PeerConnectionState::Closed;
        }
        self.router.unregister(&self.owner, &self.remote);
    }
}

/// Creates [`MemoryTransport`] endpoints for one local participant
pub struct MemoryTransportFactory {
    router: Arc<MemoryTransportRouter>,
    local: ParticipantId,
}

impl MemoryTransportFactory {
    #[must_use]
    pub fn new(router: Arc<MemoryTransportRouter>, local: ParticipantId) -> Self {
        Self { router, local }
    }
}

#[async_trait::async_trait]
impl PeerTransportFactory for MemoryTransportFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        _ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let endpoint = MemoryTransport::new(
            self.local.clone(),
            remote.clone(),
            Arc::clone(&self.router),
            events,
        );
        Ok(endpoint)
    }
}
