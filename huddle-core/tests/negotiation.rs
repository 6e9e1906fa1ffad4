//! Offer-collision resolution at the peer-manager level
//!
//! Drives two managers directly, pumping their transport events and routing
//! envelopes by hand so collision timing is fully controlled.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use huddle_core::events::CallEvent;
use huddle_core::media::{MediaConstraints, MediaPipeline, TrackKind};
use huddle_core::peers::{NegotiationState, PeerManager};
use huddle_core::test_helpers::FakeDevices;
use huddle_core::transport::memory::{MemoryTransportFactory, MemoryTransportRouter};
use huddle_core::transport::{PeerConnectionState, SessionDescription, TransportEvent};
use huddle_core::types::{ParticipantId, RoomId};
use huddle_signaling::{SignalEnvelope, SignalPayload};

struct TestPeer {
    id: ParticipantId,
    manager: Arc<PeerManager>,
    pipeline: Arc<MediaPipeline>,
    signal_rx: mpsc::UnboundedReceiver<SignalEnvelope>,
    transport_rx: mpsc::UnboundedReceiver<(ParticipantId, TransportEvent)>,
    _events_rx: broadcast::Receiver<CallEvent>,
}

async fn test_peer(router: &Arc<MemoryTransportRouter>, id: &str, name: &str) -> TestPeer {
    let id = ParticipantId::from(id);
    let (events, events_rx) = broadcast::channel(256);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let pipeline = Arc::new(MediaPipeline::new(Arc::new(FakeDevices::new())));
    pipeline
        .acquire_local_stream(&MediaConstraints::default())
        .await
        .unwrap();

    let manager = Arc::new(PeerManager::new(
        id.clone(),
        name.to_string(),
        RoomId::from("room-1"),
        Arc::new(MemoryTransportFactory::new(
            Arc::clone(router),
            id.clone(),
        )),
        Vec::new(),
        Arc::clone(&pipeline),
        events,
        signal_tx,
        transport_tx,
    ));

    TestPeer {
        id,
        manager,
        pipeline,
        signal_rx,
        transport_rx,
        _events_rx: events_rx,
    }
}

/// Run every queued transport callback through the manager. Yields first so
/// the per-transport forwarder tasks get to move events into our channel.
async fn pump_transport(peer: &mut TestPeer) {
    tokio::task::yield_now().await;
    while let Ok((pid, event)) = peer.transport_rx.try_recv() {
        let _ = peer.manager.handle_transport_event(&pid, event).await;
        tokio::task::yield_now().await;
    }
}

fn outgoing_signals(peer: &mut TestPeer) -> Vec<SignalEnvelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = peer.signal_rx.try_recv() {
        out.push(envelope);
    }
    out
}

async fn deliver(peer: &mut TestPeer, envelope: SignalEnvelope) {
    let from = envelope.from.clone();
    let to = envelope.to.clone();
    let result = match envelope.payload {
        SignalPayload::Join { display_name, .. } => {
            peer.manager.connect_to(&from, &display_name).await
        }
        SignalPayload::Leave => {
            peer.manager.remove_connection(&from).await;
            Ok(())
        }
        SignalPayload::Offer {
            description,
            display_name,
        } => {
            peer.manager
                .handle_offer(&from, to.as_ref(), description, &display_name)
                .await
        }
        SignalPayload::Answer { description } => {
            peer.manager.handle_answer(&from, to.as_ref(), description).await
        }
        SignalPayload::Candidate { candidate } => {
            peer.manager.handle_candidate(&from, to.as_ref(), candidate).await
        }
    };
    result.unwrap();
}

/// Route signals and transport callbacks between the two peers until both
/// sides go quiet
async fn settle(a: &mut TestPeer, b: &mut TestPeer) {
    loop {
        pump_transport(a).await;
        pump_transport(b).await;

        let from_a = outgoing_signals(a);
        let from_b = outgoing_signals(b);
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for envelope in from_a {
            deliver(b, envelope).await;
        }
        for envelope in from_b {
            deliver(a, envelope).await;
        }
    }
}

fn is_answer(envelope: &SignalEnvelope) -> bool {
    matches!(envelope.payload, SignalPayload::Answer { .. })
}

#[tokio::test]
async fn test_join_bootstrap_connects_both_sides() {
    let router = MemoryTransportRouter::new();
    let mut u1 = test_peer(&router, "u1", "User One").await;
    let mut u2 = test_peer(&router, "u2", "User Two").await;

    // u1 received u2's join announcement and initiates.
    u1.manager.connect_to(&u2.id, "User Two").await.unwrap();
    settle(&mut u1, &mut u2).await;

    let u1_view = u1.manager.participant(&u2.id).await.unwrap();
    let u2_view = u2.manager.participant(&u1.id).await.unwrap();
    assert_eq!(u1_view.connection_state, PeerConnectionState::Connected);
    assert_eq!(u2_view.connection_state, PeerConnectionState::Connected);
    assert_eq!(u2_view.display_name, "User One");

    // Both ended in the idle negotiation phase.
    assert_eq!(
        u1.manager.negotiation_state(&u2.id).await,
        Some(NegotiationState::Idle)
    );
    assert_eq!(
        u2.manager.negotiation_state(&u1.id).await,
        Some(NegotiationState::Idle)
    );
}

#[tokio::test]
async fn test_simultaneous_offers_resolve_to_one_accepted() {
    let router = MemoryTransportRouter::new();
    let mut u1 = test_peer(&router, "u1", "User One").await;
    let mut u2 = test_peer(&router, "u2", "User Two").await;

    // u1 is impolite toward u2 (it received the announcement and initiates);
    // u2 is polite toward u1.
    u1.manager.connect_to(&u2.id, "User Two").await.unwrap();
    u2.manager
        .create_connection(&u1.id, "User One", true)
        .await
        .unwrap();
    let u2_camera = u2
        .pipeline
        .local_stream()
        .unwrap()
        .track_of_kind(TrackKind::Video)
        .unwrap();
    u2.manager.attach_track_to_all(u2_camera).await.unwrap();

    // Both raise negotiation-needed before either offer is delivered.
    pump_transport(&mut u1).await;
    pump_transport(&mut u2).await;
    let from_u1 = outgoing_signals(&mut u1);
    let from_u2 = outgoing_signals(&mut u2);
    assert!(from_u1
        .iter()
        .any(|e| matches!(e.payload, SignalPayload::Offer { .. })));
    assert!(from_u2
        .iter()
        .any(|e| matches!(e.payload, SignalPayload::Offer { .. })));

    // u2's colliding offer reaches the impolite side first: dropped, and the
    // candidates that belong to it are dropped with it.
    for envelope in from_u2 {
        deliver(&mut u1, envelope).await;
    }
    assert_eq!(
        u1.manager.negotiation_state(&u2.id).await,
        Some(NegotiationState::Ignoring)
    );
    pump_transport(&mut u1).await;
    assert!(
        !outgoing_signals(&mut u1).iter().any(is_answer),
        "the impolite side must not answer a colliding offer"
    );

    // u1's offer reaches the polite side: rollback, then answer.
    for envelope in from_u1 {
        deliver(&mut u2, envelope).await;
    }
    pump_transport(&mut u2).await;
    let from_u2 = outgoing_signals(&mut u2);
    let answers = from_u2.iter().filter(|e| is_answer(e)).count();
    assert_eq!(answers, 1, "exactly one offer wins the collision");

    // The answer resolves the glare on the impolite side.
    for envelope in from_u2 {
        deliver(&mut u1, envelope).await;
    }
    assert_eq!(
        u1.manager.negotiation_state(&u2.id).await,
        Some(NegotiationState::Idle)
    );

    // Let the remaining candidates flow; both sides reach connected.
    settle(&mut u1, &mut u2).await;
    assert_eq!(
        u1.manager
            .participant(&u2.id)
            .await
            .unwrap()
            .connection_state,
        PeerConnectionState::Connected
    );
    assert_eq!(
        u2.manager
            .participant(&u1.id)
            .await
            .unwrap()
            .connection_state,
        PeerConnectionState::Connected
    );
}

#[tokio::test]
async fn test_foreign_addressed_messages_mutate_nothing() {
    let router = MemoryTransportRouter::new();
    let mut u1 = test_peer(&router, "u1", "User One").await;
    let mut u2 = test_peer(&router, "u2", "User Two").await;

    u1.manager.connect_to(&u2.id, "User Two").await.unwrap();
    settle(&mut u1, &mut u2).await;
    let before = u1.manager.negotiation_state(&u2.id).await;

    // An offer for somebody else, broadcast to every subscriber.
    let foreign_offer = SignalEnvelope::to_peer(
        RoomId::from("room-1"),
        u2.id.clone(),
        ParticipantId::from("u3"),
        SignalPayload::Offer {
            description: SessionDescription::offer("v=0 foreign"),
            display_name: "User Two".to_string(),
        },
    );
    deliver(&mut u1, foreign_offer).await;

    assert_eq!(u1.manager.negotiation_state(&u2.id).await, before);
    assert_eq!(u1.manager.connection_count(), 1);

    // Same for a foreign candidate and a foreign answer.
    let foreign_candidate = SignalEnvelope::to_peer(
        RoomId::from("room-1"),
        u2.id.clone(),
        ParticipantId::from("u3"),
        SignalPayload::Candidate {
            candidate: huddle_signaling::IceCandidate {
                candidate: "candidate:x 1 UDP 1 203.0.113.9 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        },
    );
    deliver(&mut u1, foreign_candidate).await;
    assert_eq!(u1.manager.negotiation_state(&u2.id).await, before);
}

#[tokio::test]
async fn test_candidate_for_unknown_connection_is_dropped() {
    let router = MemoryTransportRouter::new();
    let mut u1 = test_peer(&router, "u1", "User One").await;

    let stray = SignalEnvelope::to_peer(
        RoomId::from("room-1"),
        ParticipantId::from("ghost"),
        u1.id.clone(),
        SignalPayload::Candidate {
            candidate: huddle_signaling::IceCandidate {
                candidate: "candidate:g 1 UDP 1 203.0.113.7 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        },
    );

    // Must not error and must not create a link.
    deliver(&mut u1, stray).await;
    assert_eq!(u1.manager.connection_count(), 0);
}

#[tokio::test]
async fn test_stale_answer_is_discarded() {
    let router = MemoryTransportRouter::new();
    let mut u1 = test_peer(&router, "u1", "User One").await;
    let mut u2 = test_peer(&router, "u2", "User Two").await;

    u1.manager.connect_to(&u2.id, "User Two").await.unwrap();
    settle(&mut u1, &mut u2).await;

    // A duplicate answer after negotiation completed is ignored, not applied.
    let stale = SignalEnvelope::to_peer(
        RoomId::from("room-1"),
        u2.id.clone(),
        u1.id.clone(),
        SignalPayload::Answer {
            description: SessionDescription::answer("v=0 stale"),
        },
    );
    deliver(&mut u1, stale).await;

    assert_eq!(
        u1.manager.negotiation_state(&u2.id).await,
        Some(NegotiationState::Idle)
    );
    assert_eq!(
        u1.manager
            .participant(&u2.id)
            .await
            .unwrap()
            .connection_state,
        PeerConnectionState::Connected
    );
}
