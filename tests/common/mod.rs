// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared harness for end-to-end pipeline tests: every collaborator is the
//! in-memory double, the clock is manual, and receipts/decisions land in a
//! temp directory.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use moat_adapter::{AdapterOutput, AdapterRegistry, AdapterResult, ProviderAdapter};
use moat_catalog::{ManifestCache, StaticRegistry};
use moat_config::MoatConfig;
use moat_core::{
    CapabilityManifest, CapabilityVersion, ManifestStatus, ManualClock, PolicyBundle, RiskClass,
    RoutingStatus,
};
use moat_error::ErrorCode;
use moat_idempotency::IdempotencyStore;
use moat_policy::{InMemoryBudgetCounters, InMemoryPolicyStore, PolicyEngine};
use moat_runtime::{
    CollectingPublisher, DecisionStore, ExecutePipeline, OutcomeBus, OutcomeSubscription,
    ReceiptStore,
};
use moat_telemetry::PipelineCounters;
use moat_vault::{Credential, SecretRef, StaticConnections, StaticVault};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const TENANT: &str = "tenant-1";
pub const CAPABILITY: &str = "slack.post_message";

pub fn version() -> CapabilityVersion {
    CapabilityVersion::new(1, 0, 0)
}

pub fn manifest() -> CapabilityManifest {
    CapabilityManifest {
        id: CAPABILITY.parse().unwrap(),
        version: version(),
        provider: "slack".into(),
        method: "chat.postMessage".into(),
        scopes: vec![CAPABILITY.to_string()],
        input_schema: json!({"type": "object"}),
        output_schema: json!({"type": "object"}),
        risk_class: RiskClass::Low,
        domain_allowlist: vec!["api.slack.com".into()],
        status: ManifestStatus::Published,
        routing_status: RoutingStatus::Active,
        verified: true,
    }
}

pub fn bundle() -> PolicyBundle {
    PolicyBundle {
        tenant_id: TENANT.into(),
        capability_id: CAPABILITY.parse().unwrap(),
        capability_version: version(),
        granted_scopes: vec![CAPABILITY.to_string()],
        denied_scopes: vec![],
        daily_calls_limit: Some(5),
        monthly_calls_limit: None,
        daily_cost_usd_limit: None,
        monthly_cost_usd_limit: None,
        hard_limit: true,
        domain_allowlist: vec!["api.slack.com".into()],
        approval_required_risk_classes: vec![],
    }
}

/// An adapter double that counts invocations and returns a canned result
/// after an optional delay.
pub struct RecordingAdapter {
    provider: String,
    invocations: Arc<AtomicUsize>,
    delay: Duration,
    result: Result<serde_json::Value, ErrorCode>,
}

impl RecordingAdapter {
    pub fn succeeding(provider: &str, output: serde_json::Value) -> (Self, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Self {
                provider: provider.to_string(),
                invocations: Arc::clone(&invocations),
                delay: Duration::ZERO,
                result: Ok(output),
            },
            invocations,
        )
    }

    pub fn failing(provider: &str, code: ErrorCode) -> (Self, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Self {
                provider: provider.to_string(),
                invocations: Arc::clone(&invocations),
                delay: Duration::ZERO,
                result: Err(code),
            },
            invocations,
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ProviderAdapter for RecordingAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn execute(
        &self,
        _params: &serde_json::Value,
        _credential: &Credential,
        _manifest: &CapabilityManifest,
    ) -> AdapterResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.result {
            Ok(output) => Ok(AdapterOutput {
                output: output.clone(),
                annotation: None,
            }),
            Err(code) => Err(moat_adapter::AdapterFailure {
                code: *code,
                http_status: None,
                detail: "canned failure".to_string(),
            }),
        }
    }
}

pub struct Harness {
    pub registry: Arc<StaticRegistry>,
    pub catalog: Arc<ManifestCache>,
    pub policy_store: Arc<InMemoryPolicyStore>,
    pub budget_counters: Arc<InMemoryBudgetCounters>,
    pub idempotency: Arc<IdempotencyStore>,
    pub connections: Arc<StaticConnections>,
    pub vault: Arc<StaticVault>,
    pub receipts: Arc<ReceiptStore>,
    pub decisions: Arc<DecisionStore>,
    pub publisher: Arc<CollectingPublisher>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<PipelineCounters>,
    pub pipeline: ExecutePipeline,
    pub outcomes: OutcomeSubscription,
    pub config: MoatConfig,
    pub storage_root: std::path::PathBuf,
    _tmp: TempDir,
}

impl Harness {
    /// Drain every outcome event currently in the bus.
    pub fn drain_outcomes(&mut self) -> Vec<moat_core::OutcomeEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.outcomes.try_recv() {
            events.push(ev);
        }
        events
    }
}

pub async fn harness(config: MoatConfig) -> Harness {
    harness_with(config, AdapterRegistry::new()).await
}

pub async fn harness_with(config: MoatConfig, adapters: AdapterRegistry) -> Harness {
    let clock = Arc::new(ManualClock::starting_at(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ));
    let registry = Arc::new(StaticRegistry::new());
    let catalog = Arc::new(ManifestCache::new(
        registry.clone(),
        config.capability_cache_ttl(),
        config.capability_cache_negative_ttl(),
    ));
    let policy_store = Arc::new(InMemoryPolicyStore::new());
    let budget_counters = Arc::new(InMemoryBudgetCounters::new());
    let policy = Arc::new(PolicyEngine::new(
        policy_store.clone(),
        budget_counters.clone(),
        clock.clone(),
    ));
    let idempotency = Arc::new(IdempotencyStore::new(clock.clone()));
    let connections = Arc::new(StaticConnections::new());
    let vault = Arc::new(StaticVault::new());
    let tmp = TempDir::new().unwrap();
    let storage_root = tmp.path().to_path_buf();
    let receipts = Arc::new(ReceiptStore::new(tmp.path().join("receipts")));
    let decisions = Arc::new(DecisionStore::new(tmp.path().join("decisions")));
    let outcomes_bus = Arc::new(OutcomeBus::new());
    let subscription = outcomes_bus.subscribe();
    let publisher = Arc::new(CollectingPublisher::new());
    let metrics = Arc::new(PipelineCounters::new());

    let pipeline = ExecutePipeline::new(moat_runtime::PipelineParts {
        catalog: catalog.clone(),
        policy,
        budget_counters: budget_counters.clone(),
        idempotency: idempotency.clone(),
        connections: connections.clone(),
        vault: vault.clone(),
        adapters: Arc::new(adapters),
        receipts: receipts.clone(),
        decisions: decisions.clone(),
        outcomes: outcomes_bus,
        publisher: publisher.clone(),
        clock: clock.clone(),
        config: config.clone(),
        metrics: metrics.clone(),
    });

    Harness {
        registry,
        catalog,
        policy_store,
        budget_counters,
        idempotency,
        connections,
        vault,
        receipts,
        decisions,
        publisher,
        clock,
        metrics,
        pipeline,
        outcomes: subscription,
        config,
        storage_root,
        _tmp: tmp,
    }
}

/// Seed the default manifest, bundle, connection row, and vault secret.
pub async fn seed_defaults(h: &Harness) {
    h.registry.insert(manifest()).await;
    h.policy_store.insert(bundle()).await;
    h.connections
        .connect(TENANT, "slack", SecretRef("vault://t1/slack".into()))
        .await;
    h.vault
        .put(SecretRef("vault://t1/slack".into()), "xoxb-secret")
        .await;
}
