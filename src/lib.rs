// SPDX-License-Identifier: MIT OR Apache-2.0
//! Moat — a policy-enforced execution and trust layer between AI agents
//! and the provider APIs they call.
//!
//! This facade crate re-exports the public surface of the member crates
//! and provides the glue that wires the execute pipeline's outcome bus
//! into the trust scorer. Take the individual crates as dependencies for
//! narrower surfaces.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use moat_adapter as adapter;
pub use moat_catalog as catalog;
pub use moat_config as config;
pub use moat_core as core;
pub use moat_error as error;
pub use moat_idempotency as idempotency;
pub use moat_policy as policy;
pub use moat_runtime as runtime;
pub use moat_telemetry as telemetry;
pub use moat_trust as trust;
pub use moat_vault as vault;

/// Background wiring between the pipeline and the trust plane.
pub mod wiring {
    use moat_runtime::OutcomeSubscription;
    use moat_trust::TrustScorer;
    use std::sync::Arc;
    use tracing::debug;

    /// Forward outcome events from the pipeline's bus into the scorer.
    ///
    /// Spawned once per process; runs until the bus closes or the task is
    /// aborted. Idempotent hits never reach the bus, so everything received
    /// here is an observable execution.
    pub fn spawn_scoring_feed(
        mut subscription: OutcomeSubscription,
        scorer: Arc<TrustScorer>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                debug!(capability = %event.capability_id, "forwarding outcome to scorer");
                scorer.ingest(event).await;
            }
        })
    }
}
