//! Audit sinks
//!
//! `record` is synchronous and must never block the mission task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::AuditEntry;

/// Destination for audit entries
pub trait AuditSink: Send + Sync {
    /// Accept one entry without blocking
    fn record(&self, entry: &AuditEntry);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn record(&self, _entry: &AuditEntry) {}
}

/// Keeps every entry in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded entries
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().clone()
    }

    /// Number of recorded entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, entry: &AuditEntry) {
        self.inner.lock().push(entry.clone());
    }
}

/// Mirrors entries into the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            target: "dart::audit",
            mission_id = %entry.mission_id,
            sequence = entry.sequence,
            stage = %entry.stage,
            kind = %entry.kind,
            actor = %entry.actor,
            "{}",
            entry.summary
        );
    }
}

/// Forwards to a bounded channel; drops and counts on overflow
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<AuditEntry>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Sink plus the receiving end, buffering up to `capacity` entries
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<AuditEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Entries lost to a full or closed channel
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelSink {
    fn record(&self, entry: &AuditEntry) {
        if self.tx.try_send(entry.clone()).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                mission_id = %entry.mission_id,
                sequence = entry.sequence,
                dropped,
                "audit channel full; entry dropped"
            );
        }
    }
}

/// Forwards to every inner sink in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    /// Empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[inline]
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl AuditSink for FanoutSink {
    fn record(&self, entry: &AuditEntry) {
        for sink in &self.sinks {
            sink.record(entry);
        }
    }
}
