// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execute pipeline orchestrator.
//!
//! Eleven steps in a fixed total order. Steps 1–4 are pre-execution: their
//! failures emit at most a policy decision and never a receipt. Once step 5
//! installs the in-flight idempotency marker, a receipt is always produced;
//! the execution phase runs in a spawned task so caller cancellation cannot
//! unwind it, and adapter panics surface as gateway-error failure receipts.

use crate::emitter::OutcomeBus;
use crate::publish::ReceiptPublisher;
use crate::store::{DecisionStore, ReceiptStore};
use crate::{ExecuteError, ExecuteResult};
use chrono::Duration as ChronoDuration;
use moat_adapter::AdapterRegistry;
use moat_catalog::{CatalogError, ManifestCache};
use moat_config::MoatConfig;
use moat_core::{
    CapabilityManifest, Clock, Decision, ExecuteRequest, OutcomeEvent, PolicyDecision, Receipt,
    ReceiptBuilder, ReceiptStatus, Redactor, RuleHit,
};
use moat_error::ErrorCode;
use moat_idempotency::{BeginOutcome, IdempotencyStore};
use moat_policy::{BudgetCounters, PolicyEngine};
use moat_telemetry::PipelineCounters;
use moat_vault::{ConnectionStore, Vault};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything the pipeline needs, injected. No process-wide singletons.
pub struct PipelineParts {
    /// Read-through manifest cache.
    pub catalog: Arc<ManifestCache>,
    /// The policy evaluator.
    pub policy: Arc<PolicyEngine>,
    /// Budget counters (shared with the evaluator's snapshot reads).
    pub budget_counters: Arc<dyn BudgetCounters>,
    /// The idempotency store.
    pub idempotency: Arc<IdempotencyStore>,
    /// Tenant connection rows.
    pub connections: Arc<dyn ConnectionStore>,
    /// Credential vault.
    pub vault: Arc<dyn Vault>,
    /// Provider adapters.
    pub adapters: Arc<AdapterRegistry>,
    /// Receipt persistence.
    pub receipts: Arc<ReceiptStore>,
    /// Decision persistence.
    pub decisions: Arc<DecisionStore>,
    /// Outcome bus feeding the trust scorer.
    pub outcomes: Arc<OutcomeBus>,
    /// Best-effort receipt publisher.
    pub publisher: Arc<dyn ReceiptPublisher>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Tunables.
    pub config: MoatConfig,
    /// Pipeline counters.
    pub metrics: Arc<PipelineCounters>,
}

/// The synchronous choke-point: one call per [`ExecuteRequest`].
pub struct ExecutePipeline {
    parts: PipelineParts,
    redactor: Arc<Redactor>,
}

impl ExecutePipeline {
    /// Assemble a pipeline from its injected parts.
    #[must_use]
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            parts,
            redactor: Arc::new(Redactor::default()),
        }
    }

    /// Access the outcome bus (for wiring subscribers).
    #[must_use]
    pub fn outcome_bus(&self) -> &Arc<OutcomeBus> {
        &self.parts.outcomes
    }

    /// Access the pipeline counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineCounters> {
        &self.parts.metrics
    }

    /// Execute one capability invocation on behalf of `authenticated_tenant`.
    ///
    /// Faults are returned in-band as [`ExecuteResult::Error`]; this method
    /// itself never fails.
    pub async fn execute(
        &self,
        authenticated_tenant: &str,
        request: ExecuteRequest,
    ) -> ExecuteResult {
        let entry = Instant::now();

        if let Err(problems) = request.validate() {
            return ExecuteResult::Error(ExecuteError {
                code: ErrorCode::GatewayError,
                message: format!("malformed execute request: {problems}"),
                request_id: request.request_id,
            });
        }

        // 1. Resolve manifest. No decision is written on failure here: no
        // principal has been policy-checked yet.
        let resolved = match self
            .parts
            .catalog
            .resolve(&request.capability_id, request.capability_version.as_ref())
            .await
        {
            Ok(r) => r,
            Err(CatalogError::NotFound { id, version }) => {
                return ExecuteResult::Error(ExecuteError {
                    code: ErrorCode::CapabilityNotPublished,
                    message: format!("no published manifest for {id}@{version}"),
                    request_id: request.request_id,
                });
            }
            Err(CatalogError::Unreachable { id }) => {
                return ExecuteResult::Error(ExecuteError {
                    code: ErrorCode::GatewayError,
                    message: format!("capability registry unreachable resolving {id}"),
                    request_id: request.request_id,
                });
            }
        };
        let manifest = resolved.manifest;

        // 2. Liveness guard. Rejections are recorded as denied decisions so
        // the audit trail shows why the call never ran.
        if manifest.status != moat_core::ManifestStatus::Published {
            return self
                .gate_denial(&manifest, &request, RuleHit::CapabilityNotPublished, resolved.stale)
                .await;
        }
        if manifest.routing_status == moat_core::RoutingStatus::Hidden {
            return self
                .gate_denial(&manifest, &request, RuleHit::CapabilityHidden, resolved.stale)
                .await;
        }

        // 3. Tenant identity guard (confused-deputy defense). Last check
        // before policy evaluation.
        if authenticated_tenant != request.tenant_id {
            warn!(
                authenticated = authenticated_tenant,
                requested = %request.tenant_id,
                "tenant mismatch"
            );
            return ExecuteResult::Error(ExecuteError {
                code: ErrorCode::Unauthorized,
                message: "authenticated tenant does not match request tenant".to_string(),
                request_id: request.request_id,
            });
        }

        // 4. Policy evaluation. The decision persists unconditionally.
        let decision = self.parts.policy.decide(&manifest, &request, resolved.stale).await;
        if let Err(e) = self.parts.decisions.save(&decision) {
            error!(error = %e, "failed to persist policy decision");
            return ExecuteResult::Error(ExecuteError {
                code: ErrorCode::GatewayError,
                message: "policy decision could not be persisted".to_string(),
                request_id: request.request_id,
            });
        }
        if decision.decision == Decision::Denied {
            self.parts.metrics.record_denial();
            return ExecuteResult::PolicyDenied(decision);
        }

        // 5. Idempotency pre-check.
        let adapter_timeout = self.parts.config.adapter_timeout();
        let marker_deadline = self.parts.clock.now_utc()
            + ChronoDuration::from_std(adapter_timeout + Duration::from_secs(5))
                .unwrap_or_else(|_| ChronoDuration::seconds(35));
        match self
            .parts
            .idempotency
            .begin(&request.tenant_id, &request.idempotency_key, marker_deadline)
            .await
        {
            Err(e) => ExecuteResult::Error(ExecuteError {
                code: ErrorCode::GatewayError,
                message: e.to_string(),
                request_id: request.request_id,
            }),
            Ok(BeginOutcome::Existing(stored)) => self.replay(stored, &request, entry),
            Ok(BeginOutcome::Join(barrier)) => {
                match barrier.wait(adapter_timeout + Duration::from_secs(1)).await {
                    Ok(stored) => self.replay(stored, &request, entry),
                    Err(e) => ExecuteResult::Error(ExecuteError {
                        code: ErrorCode::GatewayError,
                        message: e.to_string(),
                        request_id: request.request_id,
                    }),
                }
            }
            Ok(BeginOutcome::Started) => {
                // Steps 6–11 run detached: cancellation of the caller after
                // the marker is installed must not unwind the execution.
                let ctx = ExecutionCtx {
                    idempotency: Arc::clone(&self.parts.idempotency),
                    connections: Arc::clone(&self.parts.connections),
                    vault: Arc::clone(&self.parts.vault),
                    adapters: Arc::clone(&self.parts.adapters),
                    receipts: Arc::clone(&self.parts.receipts),
                    outcomes: Arc::clone(&self.parts.outcomes),
                    publisher: Arc::clone(&self.parts.publisher),
                    budget_counters: Arc::clone(&self.parts.budget_counters),
                    clock: Arc::clone(&self.parts.clock),
                    metrics: Arc::clone(&self.parts.metrics),
                    redactor: Arc::clone(&self.redactor),
                    adapter_timeout,
                    ttl_success: Duration::from_secs(self.parts.config.idempotency_ttl_success_s),
                    ttl_failure: Duration::from_secs(self.parts.config.idempotency_ttl_failure_s),
                };
                let tenant = request.tenant_id.clone();
                let key = request.idempotency_key.clone();
                let handle = tokio::spawn(ctx.run(request.clone(), manifest, decision));
                match handle.await {
                    Ok(result) => result,
                    Err(join_err) => {
                        // The execution task itself died; clear the marker
                        // so the key does not stay wedged until its deadline.
                        error!(error = %join_err, "execution phase crashed");
                        let _ = self.parts.idempotency.abandon(&tenant, &key).await;
                        ExecuteResult::Error(ExecuteError {
                            code: ErrorCode::GatewayError,
                            message: "execution phase crashed".to_string(),
                            request_id: request.request_id,
                        })
                    }
                }
            }
        }
    }

    /// Serve a stored receipt as an idempotent hit. No adapter call, no new
    /// outcome event; latency measured from pipeline entry.
    fn replay(&self, stored: Receipt, request: &ExecuteRequest, entry: Instant) -> ExecuteResult {
        self.parts.metrics.record_idempotent_hit();
        let hit = stored.replayed(
            &request.request_id,
            entry.elapsed().as_millis() as u64,
            self.parts.clock.now_utc(),
        );
        if let Err(e) = self.parts.receipts.save(&hit) {
            warn!(error = %e, "failed to persist idempotent-hit receipt");
        }
        debug!(
            tenant = %request.tenant_id,
            key = %request.idempotency_key,
            "served idempotent hit"
        );
        ExecuteResult::Receipt(hit)
    }

    /// Persist and return a denied decision for a step-2 liveness rejection.
    async fn gate_denial(
        &self,
        manifest: &CapabilityManifest,
        request: &ExecuteRequest,
        hit: RuleHit,
        stale_manifest: bool,
    ) -> ExecuteResult {
        let decision = PolicyDecision {
            id: Uuid::now_v7(),
            decision: Decision::Denied,
            rule_hit: hit,
            evaluation_ms: 0,
            requested_scopes: manifest.scopes.clone(),
            granted_scopes: Vec::new(),
            budget_state: Default::default(),
            request_id: request.request_id.clone(),
            warnings: Vec::new(),
            stale_manifest,
            timestamp: self.parts.clock.now_utc(),
        };
        if let Err(e) = self.parts.decisions.save(&decision) {
            error!(error = %e, "failed to persist liveness denial");
            return ExecuteResult::Error(ExecuteError {
                code: hit.error_code().unwrap_or(ErrorCode::GatewayError),
                message: "liveness denial could not be persisted".to_string(),
                request_id: request.request_id.clone(),
            });
        }
        self.parts.metrics.record_denial();
        info!(
            capability = %manifest.id,
            rule_hit = ?hit,
            "liveness gate denied execution"
        );
        ExecuteResult::PolicyDenied(decision)
    }
}

// ---------------------------------------------------------------------------
// Execution phase (steps 6–11)
// ---------------------------------------------------------------------------

struct ExecutionCtx {
    idempotency: Arc<IdempotencyStore>,
    connections: Arc<dyn ConnectionStore>,
    vault: Arc<dyn Vault>,
    adapters: Arc<AdapterRegistry>,
    receipts: Arc<ReceiptStore>,
    outcomes: Arc<OutcomeBus>,
    publisher: Arc<dyn ReceiptPublisher>,
    budget_counters: Arc<dyn BudgetCounters>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineCounters>,
    redactor: Arc<Redactor>,
    adapter_timeout: Duration,
    ttl_success: Duration,
    ttl_failure: Duration,
}

enum ParamsIssue {
    SchemaInvalid(String),
    Violation(String),
}

fn validate_params(
    schema: &serde_json::Value,
    params: &serde_json::Value,
) -> Result<(), ParamsIssue> {
    let validator = jsonschema::draft7::new(schema)
        .map_err(|e| ParamsIssue::SchemaInvalid(e.to_string()))?;
    validator
        .validate(params)
        .map_err(|e| ParamsIssue::Violation(e.to_string()))
}

impl ExecutionCtx {
    async fn run(
        self,
        request: ExecuteRequest,
        manifest: CapabilityManifest,
        decision: PolicyDecision,
    ) -> ExecuteResult {
        let input_hash = match self.redactor.hash_redacted(&request.params) {
            Ok(h) => h,
            Err(e) => {
                return self
                    .fail(
                        &request,
                        &manifest,
                        &decision,
                        String::new(),
                        0,
                        ErrorCode::GatewayError,
                        format!("params could not be hashed: {e}"),
                    )
                    .await;
            }
        };

        // 6. Credential resolution. The raw credential lives only in this
        // scope and the adapter call below.
        let credential = match self
            .connections
            .secret_ref(&request.tenant_id, &manifest.provider)
            .await
        {
            Ok(secret_ref) => match self.vault.resolve(&secret_ref).await {
                Ok(c) => c,
                Err(e) => {
                    return self
                        .fail(
                            &request,
                            &manifest,
                            &decision,
                            input_hash,
                            0,
                            ErrorCode::GatewayError,
                            format!("credential resolution failed: {e}"),
                        )
                        .await;
                }
            },
            Err(e) => {
                return self
                    .fail(
                        &request,
                        &manifest,
                        &decision,
                        input_hash,
                        0,
                        ErrorCode::GatewayError,
                        format!("no provider connection: {e}"),
                    )
                    .await;
            }
        };

        // Params must satisfy the manifest's input schema before any
        // provider traffic.
        if let Err(issue) = validate_params(&manifest.input_schema, &request.params) {
            let (code, detail) = match issue {
                ParamsIssue::SchemaInvalid(d) => {
                    (ErrorCode::GatewayError, format!("manifest input schema invalid: {d}"))
                }
                ParamsIssue::Violation(d) => (ErrorCode::ParamsSchemaViolation, d),
            };
            return self
                .fail(&request, &manifest, &decision, input_hash, 0, code, detail)
                .await;
        }

        // 7. Adapter dispatch under a hard deadline, isolated in its own
        // task so a panic cannot take the pipeline down with it.
        let adapter = self.adapters.get_or_stub(&manifest.provider);
        let step7 = Instant::now();
        let mut call = {
            let params = request.params.clone();
            let manifest = manifest.clone();
            tokio::spawn(async move { adapter.execute(&params, &credential, &manifest).await })
        };
        let outcome = match tokio::time::timeout(self.adapter_timeout, &mut call).await {
            Err(_elapsed) => {
                call.abort();
                Err((ErrorCode::Timeout, "adapter deadline exceeded".to_string()))
            }
            Ok(Err(join_err)) => {
                error!(error = %join_err, provider = %manifest.provider, "adapter crashed");
                Err((ErrorCode::GatewayError, "adapter crashed".to_string()))
            }
            Ok(Ok(result)) => result.map_err(|f| (f.code, f.detail)),
        };
        let latency_ms = step7.elapsed().as_millis() as u64;

        match outcome {
            Err((code, detail)) => {
                self.fail(&request, &manifest, &decision, input_hash, latency_ms, code, detail)
                    .await
            }
            Ok(output) => {
                // 8. Build the success receipt over redacted hashes.
                let output_hash = match self.redactor.hash_redacted(&output.output) {
                    Ok(h) => h,
                    Err(e) => {
                        return self
                            .fail(
                                &request,
                                &manifest,
                                &decision,
                                input_hash,
                                latency_ms,
                                ErrorCode::GatewayError,
                                format!("output could not be hashed: {e}"),
                            )
                            .await;
                    }
                };
                let mut builder = ReceiptBuilder::new(
                    manifest.id.clone(),
                    manifest.version,
                    request.tenant_id.clone(),
                    request.request_id.clone(),
                    request.idempotency_key.clone(),
                    decision.id,
                )
                .status(ReceiptStatus::Success)
                .input_hash(input_hash)
                .output_hash(output_hash)
                .latency_ms(latency_ms)
                .synthetic(request.is_synthetic)
                .timestamp(self.clock.now_utc());
                if let Some(note) = output.annotation {
                    builder = builder.output_annotation(note);
                }
                let receipt = builder.build();

                // 9. Commit idempotency with the success TTL.
                self.commit(&request, &receipt, self.ttl_success).await;
                self.persist_and_fanout(&receipt);
                self.metrics.record_execution();

                // 11. Record spend. Synthetic traffic is never billed.
                if !request.is_synthetic
                    && let Err(e) = self
                        .budget_counters
                        .record_success(
                            &request.tenant_id,
                            &manifest.id,
                            0.0,
                            self.clock.now_utc(),
                        )
                        .await
                {
                    warn!(error = %e, "failed to record spend");
                }

                ExecuteResult::Receipt(receipt)
            }
        }
    }

    /// Build, commit, persist, and fan out a failure receipt. Failure TTL
    /// is normally zero: retries must re-execute.
    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        request: &ExecuteRequest,
        manifest: &CapabilityManifest,
        decision: &PolicyDecision,
        input_hash: String,
        latency_ms: u64,
        code: ErrorCode,
        detail: String,
    ) -> ExecuteResult {
        let receipt = ReceiptBuilder::new(
            manifest.id.clone(),
            manifest.version,
            request.tenant_id.clone(),
            request.request_id.clone(),
            request.idempotency_key.clone(),
            decision.id,
        )
        .status(ReceiptStatus::Failure)
        .input_hash(input_hash)
        .latency_ms(latency_ms)
        .error_code(code)
        .error_detail(self.redactor.redact_text(&detail))
        .synthetic(request.is_synthetic)
        .timestamp(self.clock.now_utc())
        .build();

        self.commit(request, &receipt, self.ttl_failure).await;
        self.persist_and_fanout(&receipt);
        self.metrics.record_execution();
        self.metrics.record_failure();
        info!(
            capability = %manifest.id,
            code = %code,
            latency_ms,
            "execution failed"
        );
        ExecuteResult::Receipt(receipt)
    }

    async fn commit(&self, request: &ExecuteRequest, receipt: &Receipt, ttl: Duration) {
        if let Err(e) = self
            .idempotency
            .commit(
                &request.tenant_id,
                &request.idempotency_key,
                receipt.clone(),
                ttl,
            )
            .await
        {
            // The receipt still stands; the key may re-execute early.
            warn!(error = %e, "idempotency commit failed");
        }
    }

    /// Steps 8 (persist) and 10 (emit): the receipt is written, the outcome
    /// event published without awaiting delivery, and the publisher fed in
    /// the background. None of these can change the returned receipt.
    fn persist_and_fanout(&self, receipt: &Receipt) {
        if let Err(e) = self.receipts.save(receipt) {
            warn!(error = %e, receipt = %receipt.id, "failed to persist receipt");
        }

        if !self.outcomes.publish(OutcomeEvent::from_receipt(receipt)) {
            self.metrics.record_emitter_failure();
        }

        let publisher = Arc::clone(&self.publisher);
        let metrics = Arc::clone(&self.metrics);
        let receipt = receipt.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&receipt).await {
                metrics.record_publisher_failure();
                warn!(error = %e, receipt = %receipt.id, "receipt publication failed");
            }
        });
    }
}
