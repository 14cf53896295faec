// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-trust
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Threshold rules that turn stats snapshots into routing statuses.
pub mod advisor;
/// Rolling-window aggregation of outcome events.
pub mod scorer;

pub use advisor::{AdvisorConfig, AdvisorRule, RoutingAdvisor, RoutingTransition};
pub use scorer::{TrustScorer, compute_stats, percentile, weight_of};

use moat_core::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Spawn the periodic recompute worker. Each tick recomputes every
/// capability's snapshot; per-capability isolation lives inside
/// [`TrustScorer::recompute_all`]. The task runs until aborted.
pub fn spawn_recompute_worker(
    scorer: Arc<TrustScorer>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshots = scorer.recompute_all(clock.now_utc()).await;
            debug!(capabilities = snapshots.len(), "scorer batch complete");
        }
    })
}
