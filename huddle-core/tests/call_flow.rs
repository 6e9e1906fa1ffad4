//! End-to-end call flows: two or three sessions joined through the
//! in-process signaling hub and transport router.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use huddle_core::events::CallEvent;
use huddle_core::media::{MediaConstraints, ScreenShareOptions, TrackKind, TrackSource};
use huddle_core::recording::RecordingOptions;
use huddle_core::session::{CallSession, SessionDeps};
use huddle_core::stats::NetworkQuality;
use huddle_core::test_helpers::{FakeDevices, FakeFailure, FixedEncoderFactory};
use huddle_core::transport::memory::{MemoryTransportFactory, MemoryTransportRouter};
use huddle_core::transport::{PeerConnectionState, TransportStats};
use huddle_core::types::ParticipantId;
use huddle_core::{CallConfig, EngineError};
use huddle_signaling::MemoryHub;

struct Harness {
    hub: Arc<MemoryHub>,
    router: Arc<MemoryTransportRouter>,
}

impl Harness {
    fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            router: MemoryTransportRouter::new(),
        }
    }

    fn session(&self, room: &str, id: &str, name: &str) -> Arc<CallSession> {
        self.session_with(room, id, name, FakeDevices::new())
    }

    fn session_with(
        &self,
        room: &str,
        id: &str,
        name: &str,
        devices: FakeDevices,
    ) -> Arc<CallSession> {
        let mut config = CallConfig::new(room, id, name);
        config.stats_interval_ms = 50;
        config.recording_timeslice_ms = 20;

        let participant = ParticipantId::from(id);
        CallSession::new(
            config,
            SessionDeps {
                signaling: Arc::new(self.hub.client(participant.clone())),
                devices: Arc::new(devices),
                transports: Arc::new(MemoryTransportFactory::new(
                    Arc::clone(&self.router),
                    participant,
                )),
                encoders: Arc::new(FixedEncoderFactory::new()),
            },
        )
    }
}

async fn wait_connected(session: &CallSession, peer: &ParticipantId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(p) = session.participant(peer).await {
            if p.connection_state == PeerConnectionState::Connected {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {peer} to connect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_removed(session: &CallSession, peer: &ParticipantId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if session.participant(peer).await.is_none() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {peer} to be removed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_event(rx: &mut broadcast::Receiver<CallEvent>, want: &str) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.event_type() == want => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => panic!("event channel closed while waiting for {want}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want} event"))
}

#[tokio::test]
async fn test_two_participants_connect_and_exchange_streams() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");
    let mut u1_events = u1.events();

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();

    let u2_id = ParticipantId::from("u2");
    let u1_id = ParticipantId::from("u1");
    wait_connected(&u1, &u2_id).await;
    wait_connected(&u2, &u1_id).await;

    wait_for_event(&mut u1_events, "stream_added").await;

    // Display names travel with the join announcement and the first offer.
    let u1_view = u1.participant(&u2_id).await.unwrap();
    assert_eq!(u1_view.display_name, "User Two");
    let u2_view = u2.participant(&u1_id).await.unwrap();
    assert_eq!(u2_view.display_name, "User One");

    // Each side received the other's microphone and camera.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let tracks: usize = u1
            .participant(&u2_id)
            .await
            .unwrap()
            .streams
            .values()
            .map(|s| s.tracks.len())
            .sum();
        if tracks == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for remote tracks"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_room_42_toggle_scenario() {
    let harness = Harness::new();
    let u1 = harness.session("room-42", "u1", "User One");
    let u2 = harness.session("room-42", "u2", "User Two");

    // u1 is in the room first; joining u2 announces, so u1 initiates and is
    // impolite, u2 is polite.
    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    wait_connected(&u1, &ParticipantId::from("u2")).await;
    wait_connected(&u2, &ParticipantId::from("u1")).await;

    let u1_endpoint = harness
        .router
        .endpoint(&ParticipantId::from("u1"), &ParticipantId::from("u2"))
        .unwrap();
    let u2_endpoint = harness
        .router
        .endpoint(&ParticipantId::from("u2"), &ParticipantId::from("u1"))
        .unwrap();
    let rounds_before = (
        u1_endpoint.negotiation_rounds(),
        u2_endpoint.negotiation_rounds(),
    );

    // Video off, then on.
    assert!(!u1.toggle_video(None).unwrap());
    let video = u1
        .local_stream()
        .unwrap()
        .track_of_kind(TrackKind::Video)
        .unwrap();
    assert!(!video.is_enabled());

    assert!(u1.toggle_video(None).unwrap());
    assert!(video.is_enabled());

    // Exactly zero renegotiation happened for a mute/unmute.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        (
            u1_endpoint.negotiation_rounds(),
            u2_endpoint.negotiation_rounds()
        ),
        rounds_before
    );

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_screen_share_preserves_connections() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    let u2_id = ParticipantId::from("u2");
    wait_connected(&u1, &u2_id).await;

    let endpoint = harness
        .router
        .endpoint(&ParticipantId::from("u1"), &u2_id)
        .unwrap();
    let rounds_before = endpoint.negotiation_rounds();
    let mut events = u1.events();

    u1.start_screen_share(&ScreenShareOptions::default())
        .await
        .unwrap();
    wait_for_event(&mut events, "screen_share_started").await;

    // The outgoing video sender now carries the screen track.
    assert!(endpoint
        .outgoing_tracks()
        .iter()
        .any(|t| t.source() == TrackSource::Screen));
    assert!(u1.is_screen_sharing());

    u1.stop_screen_share().await.unwrap();
    wait_for_event(&mut events, "screen_share_ended").await;

    // Camera restored, and no negotiation cycle or state transition
    // happened at any point: the switch is a pure track replacement.
    assert!(endpoint
        .outgoing_tracks()
        .iter()
        .any(|t| t.source() == TrackSource::Camera));
    assert!(!endpoint
        .outgoing_tracks()
        .iter()
        .any(|t| t.source() == TrackSource::Screen));
    assert_eq!(endpoint.negotiation_rounds(), rounds_before);
    assert_eq!(
        u1.participant(&u2_id).await.unwrap().connection_state,
        PeerConnectionState::Connected
    );

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_browser_stop_control_ends_share() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    let u2_id = ParticipantId::from("u2");
    wait_connected(&u1, &u2_id).await;

    let mut events = u1.events();
    u1.start_screen_share(&ScreenShareOptions::default())
        .await
        .unwrap();

    // The user hits the browser-level "stop sharing" control: the screen
    // track ends without any engine call.
    let endpoint = harness
        .router
        .endpoint(&ParticipantId::from("u1"), &u2_id)
        .unwrap();
    let screen_track = endpoint
        .outgoing_tracks()
        .into_iter()
        .find(|t| t.source() == TrackSource::Screen)
        .unwrap();
    screen_track.end();

    wait_for_event(&mut events, "screen_share_ended").await;
    assert!(!u1.is_screen_sharing());
    assert!(endpoint
        .outgoing_tracks()
        .iter()
        .any(|t| t.source() == TrackSource::Camera));

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_device_switch_preserves_connections() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    let u2_id = ParticipantId::from("u2");
    wait_connected(&u1, &u2_id).await;

    let endpoint = harness
        .router
        .endpoint(&ParticipantId::from("u1"), &u2_id)
        .unwrap();
    let rounds_before = endpoint.negotiation_rounds();
    let old_tracks = u1.local_stream().unwrap().tracks().to_vec();

    u1.switch_input_devices(&MediaConstraints {
        video_device: Some("usb-cam".into()),
        ..MediaConstraints::default()
    })
    .await
    .unwrap();

    // Old tracks are gone, replacements ride the same senders.
    assert!(old_tracks.iter().all(|t| t.is_ended()));
    let outgoing = endpoint.outgoing_tracks();
    assert!(outgoing.iter().all(|t| !t.is_ended()));
    assert_eq!(outgoing.len(), 2);
    assert_eq!(endpoint.negotiation_rounds(), rounds_before);
    assert_eq!(
        u1.participant(&u2_id).await.unwrap().connection_state,
        PeerConnectionState::Connected
    );

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_recording_over_a_live_call() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    let u2_id = ParticipantId::from("u2");
    wait_connected(&u1, &u2_id).await;

    let mut events = u1.events();
    u1.start_recording(&RecordingOptions {
        include_camera: true,
        remote_participants: vec![u2_id.clone()],
        ..RecordingOptions::default()
    })
    .await
    .unwrap();
    wait_for_event(&mut events, "recording_started").await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    let blob = u1.stop_recording().unwrap().expect("an active recording");
    assert!(!blob.is_empty());

    match wait_for_event(&mut events, "recording_stopped").await {
        CallEvent::RecordingStopped {
            data, mime_type, ..
        } => {
            assert_eq!(data, blob);
            assert!(mime_type.starts_with("video/webm"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_quality_grade_follows_transport_counters() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    let u2_id = ParticipantId::from("u2");
    wait_connected(&u1, &u2_id).await;

    // 8% loss at 800ms rtt grades poor.
    harness
        .router
        .endpoint(&ParticipantId::from("u1"), &u2_id)
        .unwrap()
        .set_stats(TransportStats {
            packets_received: 920,
            packets_lost: 80,
            rtt_ms: 800.0,
            ..TransportStats::default()
        });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if u1.participant(&u2_id).await.unwrap().quality == NetworkQuality::Poor {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the poor grade"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_cleanup_is_idempotent_and_complete() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    let u2_id = ParticipantId::from("u2");
    let u1_id = ParticipantId::from("u1");
    wait_connected(&u1, &u2_id).await;
    wait_connected(&u2, &u1_id).await;

    let local_tracks: Vec<_> = u1.local_stream().unwrap().tracks().to_vec();

    u1.cleanup().await.unwrap();

    // No local track remains live.
    assert!(local_tracks.iter().all(|t| t.is_ended()));
    assert!(u1.participants().await.is_empty());

    // The stats interval is gone: a fresh subscriber sees no further events.
    let mut fresh = u1.events();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fresh.try_recv().is_err());

    // The leave announcement removed us on the other side.
    wait_removed(&u2, &u1_id).await;

    // Second cleanup is a no-op, not an error.
    u1.cleanup().await.unwrap();

    u2.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_peer_failure_is_contained() {
    let harness = Harness::new();
    let u1 = harness.session("room-1", "u1", "User One");
    let u2 = harness.session("room-1", "u2", "User Two");
    let u3 = harness.session("room-1", "u3", "User Three");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    u3.initialize().await.unwrap();

    let u1_id = ParticipantId::from("u1");
    let u2_id = ParticipantId::from("u2");
    let u3_id = ParticipantId::from("u3");
    wait_connected(&u1, &u2_id).await;
    wait_connected(&u1, &u3_id).await;
    wait_connected(&u2, &u3_id).await;

    let mut events = u1.events();

    // u1's transport to u2 dies.
    harness
        .router
        .endpoint(&u1_id, &u2_id)
        .unwrap()
        .force_connection_state(PeerConnectionState::Failed);

    match wait_for_event(&mut events, "error").await {
        CallEvent::Error { code, .. } => assert_eq!(code, "peer-connection-failed"),
        other => panic!("unexpected event: {other:?}"),
    }
    wait_removed(&u1, &u2_id).await;

    // The other connection is untouched.
    assert_eq!(
        u1.participant(&u3_id).await.unwrap().connection_state,
        PeerConnectionState::Connected
    );
    assert_eq!(
        u2.participant(&u3_id).await.unwrap().connection_state,
        PeerConnectionState::Connected
    );

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
    u3.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_denied_media_fails_initialize() {
    let harness = Harness::new();
    let devices = FakeDevices::new();
    devices.fail_user_media(FakeFailure::Denied);
    let u1 = harness.session_with("room-1", "u1", "User One", devices);

    let err = u1.initialize().await.unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));
    assert_eq!(err.code(), "permission-denied");

    // Cleanup after a failed start is still safe.
    u1.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_screen_share_failure_leaves_call_running() {
    let harness = Harness::new();
    let devices = FakeDevices::new();
    devices.fail_display_media(FakeFailure::Missing);
    let u1 = harness.session_with("room-1", "u1", "User One", devices);
    let u2 = harness.session("room-1", "u2", "User Two");

    u1.initialize().await.unwrap();
    u2.initialize().await.unwrap();
    let u2_id = ParticipantId::from("u2");
    wait_connected(&u1, &u2_id).await;

    let err = u1
        .start_screen_share(&ScreenShareOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "device-not-found");

    // The failure is local: the connection is unaffected.
    assert_eq!(
        u1.participant(&u2_id).await.unwrap().connection_state,
        PeerConnectionState::Connected
    );

    u1.cleanup().await.unwrap();
    u2.cleanup().await.unwrap();
}
