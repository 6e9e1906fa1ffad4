//! Network statistics and quality grading
//!
//! A fixed-interval monitor polls every peer transport's raw counters,
//! derives a per-tick stats snapshot and a discrete quality grade, writes
//! the grade onto the participant and emits both through the event channel.
//!
//! ## Quality grade
//! - Excellent: loss < 1%  and rtt < 150ms
//! - Good:      loss < 3%  and rtt < 300ms
//! - Fair:      loss < 5%  and rtt < 500ms
//! - Poor:      loss < 10% and rtt < 1000ms
//! - Critical:  otherwise
//!
//! The grade is an independently recomputed snapshot each tick; there is no
//! smoothing or hysteresis.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::CallEvent;
use crate::peers::PeerManager;
use crate::transport::TransportStats;

/// Discrete network-quality grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// No sample yet
    Unknown,
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

/// Per-peer stats snapshot, recomputed each poll tick
#[derive(Debug, Clone, Serialize)]
pub struct WebRtcStats {
    pub timestamp: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// `packets_lost / (packets_received + packets_lost)`, 0 before any packets
    pub packet_loss_rate: f64,
    pub jitter_ms: f64,
    /// Remote round-trip time, 0 if unavailable
    pub rtt_ms: f64,
    pub available_outgoing_bitrate: u64,
}

impl WebRtcStats {
    /// Derive a snapshot from the transport's raw counters
    #[must_use]
    pub fn from_raw(raw: &TransportStats) -> Self {
        Self {
            timestamp: Utc::now(),
            bytes_sent: raw.bytes_sent,
            bytes_received: raw.bytes_received,
            packets_sent: raw.packets_sent,
            packets_received: raw.packets_received,
            packets_lost: raw.packets_lost,
            packet_loss_rate: packet_loss_rate(raw.packets_received, raw.packets_lost),
            jitter_ms: raw.jitter_ms,
            rtt_ms: raw.rtt_ms,
            available_outgoing_bitrate: raw.available_outgoing_bitrate,
        }
    }

    /// Grade this snapshot
    #[must_use]
    pub fn quality(&self) -> NetworkQuality {
        grade(self.packet_loss_rate, self.rtt_ms)
    }
}

/// Packet loss rate over cumulative counters; 0 when no packets were seen
#[must_use]
pub fn packet_loss_rate(packets_received: u64, packets_lost: u64) -> f64 {
    let total = packets_received + packets_lost;
    if total == 0 {
        0.0
    } else {
        packets_lost as f64 / total as f64
    }
}

/// Pure grading function over one tick's `(loss rate, rtt)` pair
#[must_use]
pub fn grade(packet_loss_rate: f64, rtt_ms: f64) -> NetworkQuality {
    if packet_loss_rate < 0.01 && rtt_ms < 150.0 {
        NetworkQuality::Excellent
    } else if packet_loss_rate < 0.03 && rtt_ms < 300.0 {
        NetworkQuality::Good
    } else if packet_loss_rate < 0.05 && rtt_ms < 500.0 {
        NetworkQuality::Fair
    } else if packet_loss_rate < 0.10 && rtt_ms < 1000.0 {
        NetworkQuality::Poor
    } else {
        NetworkQuality::Critical
    }
}

/// Fixed-interval poller over every active peer connection
pub struct StatsMonitor {
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StatsMonitor {
    /// Spawn the polling task
    #[must_use]
    pub fn spawn(
        manager: Arc<PeerManager>,
        events: broadcast::Sender<CallEvent>,
        period: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = ticker.tick() => Self::poll_once(&manager, &events).await,
                }
            }
            debug!("stats monitor stopped");
        });

        Self {
            cancel,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    async fn poll_once(manager: &PeerManager, events: &broadcast::Sender<CallEvent>) {
        for (participant_id, transport) in manager.transports().await {
            let raw = transport.stats().await;
            let stats = WebRtcStats::from_raw(&raw);
            let quality = stats.quality();

            let changed = manager.apply_quality(&participant_id, quality).await;

            let _ = events.send(CallEvent::Stats {
                participant_id: participant_id.clone(),
                stats,
                quality,
                timestamp: Utc::now(),
            });
            if changed {
                let _ = events.send(CallEvent::QualityChanged {
                    participant_id,
                    quality,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Cancel the interval task and wait for it to finish. Idempotent; a
    /// dangling interval after cleanup is a defect, not a tradeoff.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the polling task has fully terminated
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.handle.lock().is_none()
    }
}
