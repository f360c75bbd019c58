use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Relay counters. Lenient drops (malformed content, frames for unknown
/// requests) are counted here instead of being treated as errors.
#[derive(Debug, Default)]
pub struct BridgeStats {
    events_received: AtomicU64,
    duplicates_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
    uncorrelated_frames: AtomicU64,
    backend_dispatches: AtomicU64,
    fallback_dispatches: AtomicU64,
    reply_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub duplicates_dropped: u64,
    pub malformed_dropped: u64,
    pub uncorrelated_frames: u64,
    pub backend_dispatches: u64,
    pub fallback_dispatches: u64,
    pub reply_failures: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uncorrelated(&self) {
        self.uncorrelated_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_dispatch(&self) {
        self.backend_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_dispatch(&self) {
        self.fallback_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply_failure(&self) {
        self.reply_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            uncorrelated_frames: self.uncorrelated_frames.load(Ordering::Relaxed),
            backend_dispatches: self.backend_dispatches.load(Ordering::Relaxed),
            fallback_dispatches: self.fallback_dispatches.load(Ordering::Relaxed),
            reply_failures: self.reply_failures.load(Ordering::Relaxed),
        }
    }
}
