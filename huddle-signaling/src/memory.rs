//! In-process signaling hub
//!
//! Single-node counterpart of the hosted pub/sub service: a hub routes
//! envelopes to every subscriber of a room, suppressing the sender's own
//! echo. The integration test suites drive whole calls through this hub.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::envelope::SignalEnvelope;
use crate::transport::{Result, SignalingError, SignalingTransport};
use crate::types::{ParticipantId, RoomId};

struct HubSubscriber {
    participant: ParticipantId,
    sender: mpsc::UnboundedSender<SignalEnvelope>,
}

/// In-memory room hub: one subscriber list per room
pub struct MemoryHub {
    rooms: DashMap<RoomId, Vec<HubSubscriber>>,
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
        })
    }

    /// Create a transport handle bound to one participant
    #[must_use]
    pub fn client(self: &Arc<Self>, participant: ParticipantId) -> MemoryClient {
        MemoryClient {
            hub: Arc::clone(self),
            participant,
            room: Mutex::new(None),
        }
    }

    fn subscribe(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
    ) -> mpsc::UnboundedReceiver<SignalEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self.rooms.entry(room_id.clone()).or_default();
        // A reconnecting participant replaces its previous subscription.
        subscribers.retain(|sub| sub.participant != *participant);
        subscribers.push(HubSubscriber {
            participant: participant.clone(),
            sender: tx,
        });

        info!(
            room_id = %room_id,
            participant_id = %participant,
            "participant subscribed to room channel"
        );

        rx
    }

    fn unsubscribe(&self, room_id: &RoomId, participant: &ParticipantId) {
        if let Some(mut subscribers) = self.rooms.get_mut(room_id) {
            subscribers.retain(|sub| sub.participant != *participant);
            if subscribers.is_empty() {
                drop(subscribers);
                self.rooms.remove(room_id);
                debug!(room_id = %room_id, "room channel has no subscribers, removed");
            }
        }
    }

    fn publish(&self, envelope: &SignalEnvelope) -> usize {
        let Some(mut subscribers) = self.rooms.get_mut(&envelope.room_id) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|sub| {
            if sub.participant == envelope.from {
                // No self-echo: the sender already knows its own messages.
                return true;
            }
            match sub.sender.send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver dropped without disconnecting; prune it.
                Err(_) => false,
            }
        });

        delivered
    }
}

/// Handle through which one participant uses the [`MemoryHub`]
pub struct MemoryClient {
    hub: Arc<MemoryHub>,
    participant: ParticipantId,
    room: Mutex<Option<RoomId>>,
}

#[async_trait::async_trait]
impl SignalingTransport for MemoryClient {
    async fn connect(&self, room_id: &RoomId) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>> {
        let rx = self.hub.subscribe(room_id, &self.participant);
        *self.room.lock().expect("room lock poisoned") = Some(room_id.clone());
        Ok(rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        if self.room.lock().expect("room lock poisoned").is_none() {
            return Err(SignalingError::NotConnected);
        }
        let delivered = self.hub.publish(&envelope);
        debug!(
            room_id = %envelope.room_id,
            kind = envelope.payload.kind(),
            delivered,
            "published envelope"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(room_id) = self.room.lock().expect("room lock poisoned").take() {
            self.hub.unsubscribe(&room_id, &self.participant);
        }
    }
}
