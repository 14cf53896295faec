// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy bundle and budget counter seams.
//!
//! Production deployments back both with the durable fast store; tests and
//! development inject the in-memory variants. No process-wide singletons.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moat_core::{BudgetSnapshot, CapabilityId, CapabilityVersion, PolicyBundle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Errors from the policy/counter backing store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached. The engine denies
    /// fail-closed when this surfaces during evaluation.
    #[error("policy store unreachable: {reason}")]
    Unreachable {
        /// Transport-level detail.
        reason: String,
    },
}

/// Read access to policy bundles.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch the bundle for a `(tenant, capability, version)` triple.
    /// `Ok(None)` means no bundle exists (which denies by rule 1).
    async fn get_bundle(
        &self,
        tenant_id: &str,
        capability_id: &CapabilityId,
        capability_version: &CapabilityVersion,
    ) -> Result<Option<PolicyBundle>, StoreError>;
}

/// Atomic budget counters keyed by `(tenant, capability, period)`.
///
/// Period keys are `YYYY-MM-DD` for the UTC day and `YYYY-MM` for the UTC
/// calendar month, so resets fall out of the key derivation rather than a
/// scheduled job. Reads are snapshot-consistent, not linearizable; bounded
/// over-spend by concurrent in-flight calls is accepted.
#[async_trait]
pub trait BudgetCounters: Send + Sync {
    /// Read the counters for both periods at `now`.
    async fn snapshot(
        &self,
        tenant_id: &str,
        capability_id: &CapabilityId,
        now: DateTime<Utc>,
    ) -> Result<BudgetSnapshot, StoreError>;

    /// Record one successful call (and its cost, when priced) against both
    /// periods at `now`.
    async fn record_success(
        &self,
        tenant_id: &str,
        capability_id: &CapabilityId,
        cost_usd: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// The UTC-day period key (`YYYY-MM-DD`).
#[must_use]
pub fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// The UTC-month period key (`YYYY-MM`).
#[must_use]
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// In-memory [`PolicyStore`] for tests and development.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    bundles: Mutex<HashMap<(String, CapabilityId, CapabilityVersion), PolicyBundle>>,
    unreachable: AtomicBool,
}

impl InMemoryPolicyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a bundle.
    pub async fn insert(&self, bundle: PolicyBundle) {
        let key = (
            bundle.tenant_id.clone(),
            bundle.capability_id.clone(),
            bundle.capability_version,
        );
        self.bundles.lock().await.insert(key, bundle);
    }

    /// Remove a bundle, if present.
    pub async fn remove(
        &self,
        tenant_id: &str,
        capability_id: &CapabilityId,
        capability_version: &CapabilityVersion,
    ) {
        self.bundles.lock().await.remove(&(
            tenant_id.to_string(),
            capability_id.clone(),
            *capability_version,
        ));
    }

    /// Simulate a store outage (or recovery).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_bundle(
        &self,
        tenant_id: &str,
        capability_id: &CapabilityId,
        capability_version: &CapabilityVersion,
    ) -> Result<Option<PolicyBundle>, StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable {
                reason: "policy store offline".into(),
            });
        }
        Ok(self
            .bundles
            .lock()
            .await
            .get(&(
                tenant_id.to_string(),
                capability_id.clone(),
                *capability_version,
            ))
            .cloned())
    }
}

#[derive(Default)]
struct CounterCell {
    calls: u64,
    // Cost in integer micro-dollars so increments stay exact.
    cost_micro: u64,
}

/// In-memory [`BudgetCounters`] for tests and development.
#[derive(Default)]
pub struct InMemoryBudgetCounters {
    cells: Mutex<HashMap<(String, CapabilityId, String), CounterCell>>,
    unreachable: AtomicBool,
}

impl InMemoryBudgetCounters {
    /// Create an empty counter store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage (or recovery).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable {
                reason: "counter store offline".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BudgetCounters for InMemoryBudgetCounters {
    async fn snapshot(
        &self,
        tenant_id: &str,
        capability_id: &CapabilityId,
        now: DateTime<Utc>,
    ) -> Result<BudgetSnapshot, StoreError> {
        self.check()?;
        let cells = self.cells.lock().await;
        let read = |period: String| {
            cells
                .get(&(tenant_id.to_string(), capability_id.clone(), period))
                .map(|c| (c.calls, c.cost_micro as f64 / 1_000_000.0))
                .unwrap_or((0, 0.0))
        };
        let (daily_calls_used, daily_cost_usd_used) = read(day_key(now));
        let (monthly_calls_used, monthly_cost_usd_used) = read(month_key(now));
        Ok(BudgetSnapshot {
            daily_calls_used,
            monthly_calls_used,
            daily_cost_usd_used,
            monthly_cost_usd_used,
        })
    }

    async fn record_success(
        &self,
        tenant_id: &str,
        capability_id: &CapabilityId,
        cost_usd: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let micro = (cost_usd * 1_000_000.0) as u64;
        let mut cells = self.cells.lock().await;
        for period in [day_key(now), month_key(now)] {
            let cell = cells
                .entry((tenant_id.to_string(), capability_id.clone(), period))
                .or_default();
            cell.calls += 1;
            cell.cost_micro += micro;
        }
        Ok(())
    }
}
