// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber: env-filtered (`MOAT_LOG`, falling
/// back to `info`), compact fmt output. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("MOAT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Atomic counters for the execute pipeline.
///
/// Best-effort side channels (outcome emission, receipt publication) never
/// affect the returned receipt; their failures surface here instead.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    executions: AtomicU64,
    denials: AtomicU64,
    idempotent_hits: AtomicU64,
    failures: AtomicU64,
    emitter_failures: AtomicU64,
    publisher_failures: AtomicU64,
}

/// Point-in-time snapshot of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Completed executions (success or failure receipts).
    pub executions: u64,
    /// Policy denials.
    pub denials: u64,
    /// Idempotent replays served.
    pub idempotent_hits: u64,
    /// Failure receipts written.
    pub failures: u64,
    /// Outcome events that could not be delivered to the scorer.
    pub emitter_failures: u64,
    /// Receipts the on-chain publisher failed to accept.
    pub publisher_failures: u64,
}

impl PipelineCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed execution (success or failure receipt).
    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a policy denial.
    pub fn record_denial(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idempotent replay.
    pub fn record_idempotent_hit(&self) {
        self.idempotent_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure receipt.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped outcome event.
    pub fn record_emitter_failure(&self) {
        self.emitter_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed receipt publication.
    pub fn record_publisher_failure(&self) {
        self.publisher_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters at once.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            idempotent_hits: self.idempotent_hits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            emitter_failures: self.emitter_failures.load(Ordering::Relaxed),
            publisher_failures: self.publisher_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let counters = PipelineCounters::new();
        counters.record_execution();
        counters.record_execution();
        counters.record_denial();
        counters.record_idempotent_hit();
        counters.record_failure();
        counters.record_emitter_failure();
        counters.record_publisher_failure();

        let snap = counters.snapshot();
        assert_eq!(snap.executions, 2);
        assert_eq!(snap.denials, 1);
        assert_eq!(snap.idempotent_hits, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.emitter_failures, 1);
        assert_eq!(snap.publisher_failures, 1);
    }

    #[test]
    fn snapshot_serializes() {
        let counters = PipelineCounters::new();
        counters.record_execution();
        let json = serde_json::to_string(&counters.snapshot()).unwrap();
        assert!(json.contains("\"executions\":1"));
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
