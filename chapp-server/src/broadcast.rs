//! Fan-out of server events to every registered connection.
//!
//! One broadcast encodes the envelope once and hands the same `Arc<str>` to
//! every connection's outbound buffer. Delivery is at-most-once and
//! best-effort: a connection whose buffer is full or closed is pruned on the
//! spot and misses the event; nothing is retried or replayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{ProtocolError, ServerEvent};
use crate::registry::{ConnectionRegistry, Frame};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub frames_delivered: u64,
    pub connections_pruned: u64,
    pub active_connections: usize,
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections that accepted the frame
    pub delivered: usize,
    /// Connections removed because the write failed
    pub pruned: usize,
}

/// Lock-free counters, read via [`Broadcaster::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    broadcasts: AtomicU64,
    frames_delivered: AtomicU64,
    connections_pruned: AtomicU64,
}

/// The broadcast engine.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    atomic_stats: AtomicBroadcastStats,
}

impl Broadcaster {
    /// Broadcaster delivering to `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Connections this broadcaster delivers to.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Encode `event` and deliver it to every registered connection.
    ///
    /// Only an encoding failure is returned as an error; per-connection
    /// failures are absorbed by pruning and show up in the report.
    pub fn broadcast(&self, event: &ServerEvent) -> Result<BroadcastReport, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        let report = self.broadcast_frame(&frame);
        log::debug!(
            "Broadcast {} to {} connections ({} pruned)",
            event.kind().as_str(),
            report.delivered,
            report.pruned
        );
        Ok(report)
    }

    /// Deliver a pre-encoded frame.
    pub fn broadcast_frame(&self, frame: &Frame) -> BroadcastReport {
        let mut delivered = 0;
        let pruned = self.registry.for_each(|conn| {
            conn.try_send(frame)?;
            delivered += 1;
            Ok(())
        });

        for p in &pruned {
            match p.peer {
                Some(peer) => log::warn!("Dropping connection {} ({peer}): {}", p.id, p.error),
                None => log::warn!("Dropping connection {}: {}", p.id, p.error),
            }
        }

        self.atomic_stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.atomic_stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.atomic_stats
            .connections_pruned
            .fetch_add(pruned.len() as u64, Ordering::Relaxed);

        BroadcastReport {
            delivered,
            pruned: pruned.len(),
        }
    }

    /// Snapshot of broadcast counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.atomic_stats.broadcasts.load(Ordering::Relaxed),
            frames_delivered: self.atomic_stats.frames_delivered.load(Ordering::Relaxed),
            connections_pruned: self.atomic_stats.connections_pruned.load(Ordering::Relaxed),
            active_connections: self.registry.len(),
        }
    }
}
