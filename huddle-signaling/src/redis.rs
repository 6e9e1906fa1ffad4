//! Redis pub/sub signaling transport
//!
//! Binds the signaling contract to a hosted Redis instance: one channel per
//! room (`{prefix}:room:{room_id}`), JSON envelopes, a subscriber task that
//! reconnects with exponential backoff, and self-echo suppression by sender
//! id. The initial subscribe is performed inline so that a broken channel
//! fails session start instead of limping along silently.

use anyhow::Context;
use futures::stream::StreamExt;
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::SignalEnvelope;
use crate::transport::{Result, SignalingError, SignalingTransport};
use crate::types::{ParticipantId, RoomId};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Signaling transport backed by Redis pub/sub
pub struct RedisTransport {
    client: RedisClient,
    local_id: ParticipantId,
    channel_prefix: String,
    cancel: CancellationToken,
    publish_conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    connected: Mutex<bool>,
}

impl RedisTransport {
    pub fn new(redis_url: &str, local_id: ParticipantId) -> Result<Self> {
        Self::with_prefix(redis_url, local_id, "huddle")
    }

    pub fn with_prefix(
        redis_url: &str,
        local_id: ParticipantId,
        channel_prefix: &str,
    ) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| SignalingError::Subscribe(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            local_id,
            channel_prefix: channel_prefix.to_string(),
            cancel: CancellationToken::new(),
            publish_conn: tokio::sync::Mutex::new(None),
            connected: Mutex::new(false),
        })
    }

    fn channel_name(&self, room_id: &RoomId) -> String {
        format!("{}:room:{}", self.channel_prefix, room_id.as_str())
    }

    async fn open_pubsub(&self, channel: &str) -> anyhow::Result<redis::aio::PubSub> {
        let mut pubsub = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_async_pubsub(),
        )
        .await
        .context("timed out getting redis pub/sub connection")?
        .context("failed to get redis pub/sub connection")?;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(channel),
        )
        .await
        .context("timed out subscribing to room channel")?
        .context("failed to subscribe to room channel")?;

        Ok(pubsub)
    }
}

#[async_trait::async_trait]
impl SignalingTransport for RedisTransport {
    async fn connect(&self, room_id: &RoomId) -> Result<mpsc::UnboundedReceiver<SignalEnvelope>> {
        let channel = self.channel_name(room_id);

        // The first subscribe happens inline: a channel error here is fatal
        // to session start.
        let pubsub = self
            .open_pubsub(&channel)
            .await
            .map_err(|e| SignalingError::Subscribe(format!("{e:#}")))?;

        info!(channel = %channel, "redis subscriber connected");

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let local_id = self.local_id.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut pubsub = Some(pubsub);
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                let ps = match pubsub.take() {
                    Some(ps) => ps,
                    None => {
                        // Reconnect with backoff after the stream dropped.
                        match open_pubsub_with(&client, &channel).await {
                            Ok(ps) => {
                                info!(channel = %channel, "redis subscriber reconnected");
                                backoff_secs = INITIAL_BACKOFF_SECS;
                                ps
                            }
                            Err(e) => {
                                error!(
                                    error = %e,
                                    backoff_secs,
                                    "redis subscriber failed to reconnect"
                                );
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                                }
                                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                                continue;
                            }
                        }
                    }
                };

                run_subscriber(ps, &local_id, &tx, &cancel).await;

                if cancel.is_cancelled() || tx.is_closed() {
                    debug!(channel = %channel, "redis subscriber task exiting");
                    return;
                }
                warn!(channel = %channel, "redis subscriber stream ended, reconnecting");
            }
        });

        *self.connected.lock().expect("connected lock poisoned") = true;
        Ok(rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        if !*self.connected.lock().expect("connected lock poisoned") {
            return Err(SignalingError::NotConnected);
        }

        let channel = self.channel_name(&envelope.room_id);
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| SignalingError::Malformed(e.to_string()))?;

        let mut guard = self.publish_conn.lock().await;
        if guard.is_none() {
            let conn = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                self.client.get_multiplexed_async_connection(),
            )
            .await
            .map_err(|_| SignalingError::Publish("timed out connecting to redis".into()))?
            .map_err(|e| SignalingError::Publish(e.to_string()))?;
            *guard = Some(conn);
        }

        let conn = guard.as_mut().expect("publish connection just installed");
        let published: std::result::Result<usize, _> = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(&channel, &payload),
        )
        .await
        .map_err(|_| SignalingError::Publish("timed out publishing to redis".into()))?;

        match published {
            Ok(subscribers) => {
                debug!(
                    channel = %channel,
                    kind = envelope.payload.kind(),
                    subscribers,
                    "published envelope to redis"
                );
                Ok(())
            }
            Err(e) => {
                // Drop the connection so the next send re-establishes it.
                *guard = None;
                Err(SignalingError::Publish(e.to_string()))
            }
        }
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
        *self.connected.lock().expect("connected lock poisoned") = false;
        *self.publish_conn.lock().await = None;
    }
}

async fn open_pubsub_with(client: &RedisClient, channel: &str) -> anyhow::Result<redis::aio::PubSub> {
    let mut pubsub = timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        client.get_async_pubsub(),
    )
    .await
    .context("timed out getting redis pub/sub connection")?
    .context("failed to get redis pub/sub connection")?;

    timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        pubsub.subscribe(channel),
    )
    .await
    .context("timed out subscribing to room channel")?
    .context("failed to subscribe to room channel")?;

    Ok(pubsub)
}

/// Pump messages from one pub/sub connection until it drops or we shut down
async fn run_subscriber(
    mut pubsub: redis::aio::PubSub,
    local_id: &ParticipantId,
    tx: &mpsc::UnboundedSender<SignalEnvelope>,
    cancel: &CancellationToken,
) {
    let mut stream = pubsub.on_message();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else { return };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "invalid payload on room channel");
                continue;
            }
        };

        match serde_json::from_str::<SignalEnvelope>(&payload) {
            Ok(envelope) => {
                if envelope.from == *local_id {
                    // Every publish echoes back to all subscribers; skip our own.
                    continue;
                }
                if tx.send(envelope).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to deserialize signal envelope");
            }
        }
    }
}
