// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios: fresh success, idempotent replay, policy
//! denial, budget rollover, adapter timeout, concurrent single-flight, and
//! the pre-policy fault paths.

mod common;

use common::*;
use moat_adapter::AdapterRegistry;
use moat_config::MoatConfig;
use moat_core::{Clock, Decision, ExecuteRequestBuilder, ReceiptStatus, RuleHit};
use moat_error::ErrorCode;
use moat_policy::BudgetCounters;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn request(key: &str) -> moat_core::ExecuteRequest {
    ExecuteRequestBuilder::new(CAPABILITY, TENANT, key)
        .unwrap()
        .params(json!({"channel": "#g", "text": "hi"}))
        .build()
}

// ---------------------------------------------------------------------------
// Scenario: fresh success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_success_produces_receipt_spend_and_outcome() {
    let (adapter, invocations) =
        RecordingAdapter::succeeding("slack", json!({"ok": true, "ts": "1.0"}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let mut h = harness_with(MoatConfig::default(), registry).await;
    seed_defaults(&h).await;

    let result = h.pipeline.execute(TENANT, request("k1")).await;
    let receipt = result.receipt().expect("expected a receipt").clone();

    assert_eq!(receipt.status, ReceiptStatus::Success);
    assert!(receipt.output_hash.is_some());
    assert!(receipt.error_code.is_none());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // Spend recorded for the UTC day.
    let snap = h
        .budget_counters
        .snapshot(TENANT, &CAPABILITY.parse().unwrap(), h.clock.now_utc())
        .await
        .unwrap();
    assert_eq!(snap.daily_calls_used, 1);

    // One outcome event, success=true.
    let events = h.drain_outcomes();
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].receipt_id, receipt.id);

    // Decision persisted and referenced.
    let decision = h.decisions.load(receipt.policy_decision_id).unwrap();
    assert_eq!(decision.decision, Decision::Allowed);
}

// ---------------------------------------------------------------------------
// Scenario: idempotent replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replay_within_ttl_serves_hit_without_spend_or_outcome() {
    let (adapter, invocations) =
        RecordingAdapter::succeeding("slack", json!({"ok": true, "ts": "1.0"}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let mut h = harness_with(MoatConfig::default(), registry).await;
    seed_defaults(&h).await;

    let first = h.pipeline.execute(TENANT, request("k1")).await;
    let first = first.receipt().unwrap().clone();
    h.drain_outcomes();

    let second = h.pipeline.execute(TENANT, request("k1")).await;
    let second = second.receipt().unwrap().clone();

    assert_eq!(second.status, ReceiptStatus::IdempotentHit);
    assert_eq!(second.output_hash, first.output_hash);
    assert_eq!(second.input_hash, first.input_hash);
    assert_eq!(second.policy_decision_id, first.policy_decision_id);
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "no second adapter call");

    // Budget unchanged, no new outcome event.
    let snap = h
        .budget_counters
        .snapshot(TENANT, &CAPABILITY.parse().unwrap(), h.clock.now_utc())
        .await
        .unwrap();
    assert_eq!(snap.daily_calls_used, 1);
    assert!(h.drain_outcomes().is_empty(), "idempotent hits emit nothing");
    assert_eq!(h.metrics.snapshot().idempotent_hits, 1);
}

// ---------------------------------------------------------------------------
// Scenario: policy deny on scope
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_scope_denies_without_receipt_or_adapter_call() {
    let (adapter, invocations) = RecordingAdapter::succeeding("slack", json!({"ok": true}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let h = harness_with(MoatConfig::default(), registry).await;
    seed_defaults(&h).await;

    // Replace the bundle with one missing the scope.
    let mut b = bundle();
    b.granted_scopes = vec![];
    h.policy_store.insert(b).await;

    let result = h.pipeline.execute(TENANT, request("k1")).await;
    let decision = result.denial().expect("expected a denial");

    assert_eq!(decision.decision, Decision::Denied);
    assert_eq!(decision.rule_hit, RuleHit::ScopeNotGranted);
    assert_eq!(invocations.load(Ordering::SeqCst), 0, "adapter never called");
    assert!(h.receipts.list().unwrap().is_empty(), "no receipt exists");

    // The decision itself is persisted.
    assert_eq!(h.decisions.list().unwrap(), vec![decision.id]);
}

// ---------------------------------------------------------------------------
// Scenario: budget exhaustion, then UTC-midnight rollover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn budget_exhausts_then_rolls_over_at_utc_midnight() {
    let (adapter, _) = RecordingAdapter::succeeding("slack", json!({"ok": true}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let h = harness_with(MoatConfig::default(), registry).await;
    seed_defaults(&h).await;

    let mut b = bundle();
    b.daily_calls_limit = Some(2);
    h.policy_store.insert(b).await;

    for key in ["k1", "k2"] {
        let result = h.pipeline.execute(TENANT, request(key)).await;
        assert!(result.receipt().is_some(), "call {key} should succeed");
    }

    let third = h.pipeline.execute(TENANT, request("k3")).await;
    let decision = third.denial().expect("third call must be denied");
    assert_eq!(decision.rule_hit, RuleHit::BudgetDailyCallsExceeded);
    assert_eq!(decision.budget_state.daily_calls_used, 2);

    // Past UTC midnight the daily counter starts fresh.
    h.clock.advance(chrono::Duration::hours(13));
    let fourth = h.pipeline.execute(TENANT, request("k4")).await;
    assert_eq!(
        fourth.receipt().expect("fourth call succeeds").status,
        ReceiptStatus::Success
    );
}

// ---------------------------------------------------------------------------
// Scenario: adapter timeout, failure not cached
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_yields_failure_receipt_and_retry_reexecutes() {
    let (adapter, invocations) = RecordingAdapter::succeeding("slack", json!({"ok": true}));
    let adapter = adapter.with_delay(Duration::from_secs(60));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);

    let config = MoatConfig {
        adapter_default_timeout_ms: 1_000,
        ..MoatConfig::default()
    };
    let mut h = harness_with(config, registry).await;
    seed_defaults(&h).await;

    let result = h.pipeline.execute(TENANT, request("k2")).await;
    let receipt = result.receipt().unwrap().clone();
    assert_eq!(receipt.status, ReceiptStatus::Failure);
    assert_eq!(receipt.error_code, Some(ErrorCode::Timeout));
    assert!(receipt.latency_ms >= 1_000, "latency {}", receipt.latency_ms);
    assert!(receipt.latency_ms < 2_000, "latency {}", receipt.latency_ms);
    assert!(receipt.output_hash.is_none());

    // Failure receipts are not cached: same key re-executes.
    let retry = h.pipeline.execute(TENANT, request("k2")).await;
    assert_eq!(retry.receipt().unwrap().status, ReceiptStatus::Failure);
    assert_eq!(invocations.load(Ordering::SeqCst), 2, "retry re-executed");

    // Outcome events carry the TIMEOUT taxonomy.
    let events = h.drain_outcomes();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.error_taxonomy == Some(ErrorCode::Timeout)));
}

// ---------------------------------------------------------------------------
// Scenario: concurrent single-flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_same_key_requests_execute_once() {
    let (adapter, invocations) =
        RecordingAdapter::succeeding("slack", json!({"ok": true, "ts": "1.0"}));
    let adapter = adapter.with_delay(Duration::from_millis(200));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let h = Arc::new(harness_with(MoatConfig::default(), registry).await);
    seed_defaults(&h).await;

    let a = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.pipeline.execute(TENANT, request("k1")).await })
    };
    let b = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.pipeline.execute(TENANT, request("k1")).await })
    };

    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
    let ra = ra.receipt().expect("caller A got a receipt").clone();
    let rb = rb.receipt().expect("caller B got a receipt").clone();

    assert_eq!(invocations.load(Ordering::SeqCst), 1, "adapter ran once");

    let statuses = [ra.status, rb.status];
    assert!(
        statuses.contains(&ReceiptStatus::Success)
            && statuses.contains(&ReceiptStatus::IdempotentHit),
        "one winner, one hit: {statuses:?}"
    );
    assert_eq!(ra.output_hash, rb.output_hash, "identical results");
    assert_eq!(ra.policy_decision_id, rb.policy_decision_id);
}

// ---------------------------------------------------------------------------
// Synthetic traffic is never billed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn synthetic_requests_execute_but_do_not_spend() {
    let (adapter, invocations) = RecordingAdapter::succeeding("slack", json!({"ok": true}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let mut h = harness_with(MoatConfig::default(), registry).await;
    seed_defaults(&h).await;

    let req = ExecuteRequestBuilder::new(CAPABILITY, TENANT, "probe-1")
        .unwrap()
        .params(json!({"channel": "#g", "text": "probe"}))
        .synthetic(true)
        .build();
    let result = h.pipeline.execute(TENANT, req).await;
    let receipt = result.receipt().unwrap();
    assert!(receipt.is_synthetic);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let snap = h
        .budget_counters
        .snapshot(TENANT, &CAPABILITY.parse().unwrap(), h.clock.now_utc())
        .await
        .unwrap();
    assert_eq!(snap.daily_calls_used, 0, "synthetic calls are not billed");

    // But they do feed scoring.
    let events = h.drain_outcomes();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_synthetic);
}

// ---------------------------------------------------------------------------
// Pre-policy faults
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tenant_mismatch_is_unauthorized_with_no_side_effects() {
    let h = harness(MoatConfig::default()).await;
    seed_defaults(&h).await;

    let result = h.pipeline.execute("other-tenant", request("k1")).await;
    let err = result.error().expect("expected an error");
    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert!(h.receipts.list().unwrap().is_empty());
    assert!(h.decisions.list().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_capability_is_rejected_before_policy() {
    let h = harness(MoatConfig::default()).await;
    // Nothing seeded: the registry knows no manifests.
    let result = h.pipeline.execute(TENANT, request("k1")).await;
    let err = result.error().expect("expected an error");
    assert_eq!(err.code, ErrorCode::CapabilityNotPublished);
    assert!(h.decisions.list().unwrap().is_empty(), "no principal checked");
}

#[tokio::test]
async fn idempotency_store_outage_fails_closed() {
    let (adapter, invocations) = RecordingAdapter::succeeding("slack", json!({"ok": true}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let h = harness_with(MoatConfig::default(), registry).await;
    seed_defaults(&h).await;
    h.idempotency.set_unreachable(true);

    let result = h.pipeline.execute(TENANT, request("k1")).await;
    let err = result.error().expect("expected an error");
    assert_eq!(err.code, ErrorCode::GatewayError);
    assert_eq!(invocations.load(Ordering::SeqCst), 0, "no execution without idempotency");
    assert!(h.receipts.list().unwrap().is_empty());
}

#[tokio::test]
async fn unwired_provider_falls_back_to_stub() {
    // No adapter registered at all.
    let h = harness(MoatConfig::default()).await;
    seed_defaults(&h).await;

    let result = h.pipeline.execute(TENANT, request("k1")).await;
    let receipt = result.receipt().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Success);
    assert_eq!(
        receipt.output_annotation.as_deref(),
        Some(moat_adapter::STUB_ANNOTATION)
    );
}

#[tokio::test]
async fn params_schema_violation_is_a_failure_receipt() {
    let (adapter, invocations) = RecordingAdapter::succeeding("slack", json!({"ok": true}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let h = harness_with(MoatConfig::default(), registry).await;
    seed_defaults(&h).await;

    // Tighten the manifest's input schema.
    let mut m = manifest();
    m.input_schema = json!({
        "type": "object",
        "required": ["channel", "text"],
        "properties": {
            "channel": {"type": "string"},
            "text": {"type": "string"}
        }
    });
    h.registry.insert(m).await;
    h.catalog.invalidate(&CAPABILITY.parse().unwrap()).await;

    let req = ExecuteRequestBuilder::new(CAPABILITY, TENANT, "k1")
        .unwrap()
        .params(json!({"channel": 42}))
        .build();
    let result = h.pipeline.execute(TENANT, req).await;
    let receipt = result.receipt().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failure);
    assert_eq!(receipt.error_code, Some(ErrorCode::ParamsSchemaViolation));
    assert_eq!(invocations.load(Ordering::SeqCst), 0, "provider never reached");
}

#[tokio::test]
async fn missing_connection_yields_gateway_failure_receipt() {
    let (adapter, invocations) = RecordingAdapter::succeeding("slack", json!({"ok": true}));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let h = harness_with(MoatConfig::default(), registry).await;
    // Manifest and bundle, but no connection row or secret.
    h.registry.insert(manifest()).await;
    h.policy_store.insert(bundle()).await;

    let result = h.pipeline.execute(TENANT, request("k1")).await;
    let receipt = result.receipt().expect("execution phase always yields a receipt");
    assert_eq!(receipt.status, ReceiptStatus::Failure);
    assert_eq!(receipt.error_code, Some(ErrorCode::GatewayError));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}
