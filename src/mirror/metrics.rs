//! Pipeline counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::store::StatusCounts;

/// Counters of the ingestion worker (shared across worker restarts)
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub frames_received: AtomicU64,
    /// Empty frames or frames not starting with `{` / `[`
    pub fast_rejects: AtomicU64,
    /// Unparsable frames plus payloads the validator refused
    pub invalid_frames: AtomicU64,
    pub loading_placeholders: AtomicU64,
    pub updates_accepted: AtomicU64,
    /// Updates that replaced a still-pending update for the same asset
    pub coalesced_overwrites: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_timers_armed: AtomicU64,
    /// Flushed updates that predate the current connection or subscription
    pub stale_updates_dropped: AtomicU64,
    pub worker_restarts: AtomicU64,
}

impl IngestMetrics {
    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn summary(&self) -> IngestMetricsSummary {
        IngestMetricsSummary {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            fast_rejects: self.fast_rejects.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            loading_placeholders: self.loading_placeholders.load(Ordering::Relaxed),
            updates_accepted: self.updates_accepted.load(Ordering::Relaxed),
            coalesced_overwrites: self.coalesced_overwrites.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_timers_armed: self.flush_timers_armed.load(Ordering::Relaxed),
            stale_updates_dropped: self.stale_updates_dropped.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestMetricsSummary {
    pub frames_received: u64,
    pub fast_rejects: u64,
    pub invalid_frames: u64,
    pub loading_placeholders: u64,
    pub updates_accepted: u64,
    pub coalesced_overwrites: u64,
    pub flushes: u64,
    pub flush_timers_armed: u64,
    pub stale_updates_dropped: u64,
    pub worker_restarts: u64,
}

/// Counters of the transport task
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub connect_attempts: AtomicU64,
    pub opens: AtomicU64,
    pub normal_closes: AtomicU64,
    pub abnormal_closes: AtomicU64,
    pub errors: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
    pub intents_sent: AtomicU64,
    /// Intents not written because the socket was not open
    pub intents_dropped: AtomicU64,
    pub resyncs_sent: AtomicU64,
    pub frames_forwarded: AtomicU64,
}

impl TransportMetrics {
    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> TransportMetricsSummary {
        TransportMetricsSummary {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            normal_closes: self.normal_closes.load(Ordering::Relaxed),
            abnormal_closes: self.abnormal_closes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            intents_sent: self.intents_sent.load(Ordering::Relaxed),
            intents_dropped: self.intents_dropped.load(Ordering::Relaxed),
            resyncs_sent: self.resyncs_sent.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportMetricsSummary {
    pub connect_attempts: u64,
    pub opens: u64,
    pub normal_closes: u64,
    pub abnormal_closes: u64,
    pub errors: u64,
    pub reconnects_scheduled: u64,
    pub intents_sent: u64,
    pub intents_dropped: u64,
    pub resyncs_sent: u64,
    pub frames_forwarded: u64,
}

/// Everything `/metrics` reports
#[derive(Debug, Clone, Serialize)]
pub struct MirrorMetricsSummary {
    pub frame: u32,
    pub revision: u64,
    pub books: usize,
    pub active_assets: usize,
    pub status: StatusCounts,
    pub transport_state: String,
    pub ingest: IngestMetricsSummary,
    pub transport: TransportMetricsSummary,
}
