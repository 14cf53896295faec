// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-policy
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The fixed, priority-ordered rule table.
pub mod rules;
/// Policy bundle and budget counter seams.
pub mod store;

pub use rules::{EvaluationInput, RuleOutcome, run as run_rules};
pub use store::{
    BudgetCounters, InMemoryBudgetCounters, InMemoryPolicyStore, PolicyStore, StoreError, day_key,
    month_key,
};

use moat_core::{
    BudgetSnapshot, CapabilityManifest, Clock, Decision, ExecuteRequest, PolicyDecision, RuleHit,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// The policy evaluator.
///
/// `decide` is the only entry point the pipeline uses. It fetches the
/// tenant's bundle and a budget snapshot, runs the rule table, and returns
/// an immutable [`PolicyDecision`] — always. Any internal fault (bundle
/// store down, counter store down) produces a denied decision with
/// `POLICY_ENGINE_ERROR` instead of an error.
pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
    counters: Arc<dyn BudgetCounters>,
    clock: Arc<dyn Clock>,
}

impl PolicyEngine {
    /// Create an engine over the given stores.
    #[must_use]
    pub fn new(
        store: Arc<dyn PolicyStore>,
        counters: Arc<dyn BudgetCounters>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            counters,
            clock,
        }
    }

    /// Evaluate the request against the tenant's policy.
    ///
    /// Never fails: evaluator faults deny fail-closed.
    pub async fn decide(
        &self,
        manifest: &CapabilityManifest,
        request: &ExecuteRequest,
        stale_manifest: bool,
    ) -> PolicyDecision {
        let started = Instant::now();
        let now = self.clock.now_utc();

        let fetched = async {
            let bundle = self
                .store
                .get_bundle(&request.tenant_id, &manifest.id, &manifest.version)
                .await?;
            let budget = self
                .counters
                .snapshot(&request.tenant_id, &manifest.id, now)
                .await?;
            Ok::<_, StoreError>((bundle, budget))
        }
        .await;

        let (hit, warnings, granted, budget) = match fetched {
            Ok((bundle, budget)) => {
                let outcome = rules::run(&EvaluationInput {
                    bundle: bundle.as_ref(),
                    manifest,
                    request,
                    budget: &budget,
                    now,
                });
                let granted = bundle.map(|b| b.granted_scopes).unwrap_or_default();
                (outcome.hit, outcome.warnings, granted, budget)
            }
            Err(err) => {
                warn!(
                    tenant = %request.tenant_id,
                    capability = %manifest.id,
                    error = %err,
                    "policy evaluation failed, denying fail-closed"
                );
                (
                    RuleHit::PolicyEngineError,
                    Vec::new(),
                    Vec::new(),
                    BudgetSnapshot::default(),
                )
            }
        };

        let decision = if hit == RuleHit::PolicyAllowed {
            Decision::Allowed
        } else {
            Decision::Denied
        };
        debug!(
            tenant = %request.tenant_id,
            capability = %manifest.id,
            ?decision,
            rule_hit = ?hit,
            "policy decision"
        );

        PolicyDecision {
            id: Uuid::now_v7(),
            decision,
            rule_hit: hit,
            evaluation_ms: started.elapsed().as_millis() as u64,
            requested_scopes: manifest.scopes.clone(),
            granted_scopes: granted,
            budget_state: budget,
            request_id: request.request_id.clone(),
            warnings,
            stale_manifest,
            timestamp: now,
        }
    }
}
