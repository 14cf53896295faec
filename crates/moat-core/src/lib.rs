// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Moat.
//!
//! Every record here is frozen after creation: constructed once, never
//! mutated, structurally comparable. The execute pipeline owns receipts and
//! policy decisions; the trust scorer owns capability stats; everything else
//! is held as read-through state owned by external collaborators.

/// Wall-clock seam for deterministic tests.
pub mod clock;
/// Validated identifier newtypes.
pub mod ids;
/// Denylist-key redaction and redacted hashing.
pub mod redact;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{CapabilityId, CapabilityVersion, IdError};
pub use redact::Redactor;

use chrono::{DateTime, Utc};
use moat_error::ErrorCode;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maximum allowed idempotency key length in bytes.
pub const MAX_IDEMPOTENCY_KEY_BYTES: usize = 256;

// ---------------------------------------------------------------------------
// Capability manifests
// ---------------------------------------------------------------------------

/// Risk classification assigned to a capability at publication time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Read-mostly, reversible operations.
    Low,
    /// Mutating but recoverable operations.
    Medium,
    /// Externally visible or costly operations.
    High,
    /// Irreversible or financial operations.
    Critical,
}

/// Lifecycle status of a manifest version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    /// Still editable; not executable.
    Draft,
    /// Live and executable.
    Published,
    /// Still executable but discouraged.
    Deprecated,
    /// Retired; not executable.
    Archived,
}

/// Routing status derived from rolling stats and synthetic probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStatus {
    /// Normal visibility and executability.
    Active,
    /// Boosted in catalog ranking.
    Preferred,
    /// Visible but rate-limited by the catalog read path.
    Throttled,
    /// Invisible and not executable.
    Hidden,
}

/// Result of the most recent synthetic probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticStatus {
    /// The probe's receipt reported success.
    Success,
    /// The probe's receipt reported failure.
    Failure,
}

/// A method-level capability contract, identified by `(id, version)`.
///
/// A manifest with status other than [`ManifestStatus::Draft`] is immutable;
/// behaviour changes ship as a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityManifest {
    /// Capability identifier (`provider.action`).
    #[schemars(with = "String")]
    pub id: CapabilityId,
    /// Strict semver version of this manifest.
    #[schemars(with = "String")]
    pub version: CapabilityVersion,
    /// Provider key used for adapter dispatch and connection lookup.
    pub provider: String,
    /// Provider-side method name.
    pub method: String,
    /// Scopes an invoking tenant must hold. Never empty.
    pub scopes: Vec<String>,
    /// JSON Schema (Draft 7) for request params.
    pub input_schema: serde_json::Value,
    /// JSON Schema (Draft 7) for provider output.
    pub output_schema: serde_json::Value,
    /// Risk classification.
    pub risk_class: RiskClass,
    /// Outbound hosts the capability may reach. Never empty; no wildcards,
    /// no IP literals.
    pub domain_allowlist: Vec<String>,
    /// Lifecycle status.
    pub status: ManifestStatus,
    /// Routing status derived by the trust plane.
    pub routing_status: RoutingStatus,
    /// Whether the provider identity has been verified.
    pub verified: bool,
}

/// Validation failure for a contract record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {record}: {problems:?}")]
pub struct ValidationError {
    /// Which record failed.
    pub record: &'static str,
    /// Individual violations, in field order.
    pub problems: Vec<String>,
}

fn looks_like_ip_literal(host: &str) -> bool {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    // Bracketed IPv6 ("[::1]") as it would appear in a URL authority.
    host.starts_with('[') && host.ends_with(']')
}

impl CapabilityManifest {
    /// Check the record-level invariants: non-empty scopes, and a
    /// domain allowlist that is non-empty, wildcard-free, and free of IP
    /// literals.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] listing every violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut problems = Vec::new();
        if self.scopes.is_empty() {
            problems.push("scopes must be non-empty".to_string());
        }
        if self.provider.is_empty() {
            problems.push("provider must be non-empty".to_string());
        }
        if self.domain_allowlist.is_empty() {
            problems.push("domain_allowlist must be non-empty".to_string());
        }
        for host in &self.domain_allowlist {
            if host.contains('*') {
                problems.push(format!("domain_allowlist entry {host:?} contains a wildcard"));
            }
            if looks_like_ip_literal(host) {
                problems.push(format!("domain_allowlist entry {host:?} is an IP literal"));
            }
            if host.is_empty() {
                problems.push("domain_allowlist entry is empty".to_string());
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                record: "capability manifest",
                problems,
            })
        }
    }

    /// `true` when the manifest may be executed at all (step-2 liveness).
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.status == ManifestStatus::Published && self.routing_status != RoutingStatus::Hidden
    }
}

// ---------------------------------------------------------------------------
// Policy bundles and approvals
// ---------------------------------------------------------------------------

/// The effective policy for one `(tenant, capability, version)` triple.
///
/// Nullable limits mean unlimited; the corresponding rule is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyBundle {
    /// Tenant this bundle applies to.
    pub tenant_id: String,
    /// Capability this bundle applies to.
    #[schemars(with = "String")]
    pub capability_id: CapabilityId,
    /// Capability version this bundle applies to.
    #[schemars(with = "String")]
    pub capability_version: CapabilityVersion,
    /// Scopes granted to the tenant.
    pub granted_scopes: Vec<String>,
    /// Scopes explicitly denied to the tenant; deny beats grant.
    pub denied_scopes: Vec<String>,
    /// Daily call cap.
    pub daily_calls_limit: Option<u64>,
    /// Monthly call cap.
    pub monthly_calls_limit: Option<u64>,
    /// Daily cost cap in USD.
    pub daily_cost_usd_limit: Option<f64>,
    /// Monthly cost cap in USD.
    pub monthly_cost_usd_limit: Option<f64>,
    /// When `false`, budget rules warn instead of denying.
    pub hard_limit: bool,
    /// Mirrored from the manifest; not tenant-overridable.
    pub domain_allowlist: Vec<String>,
    /// Risk classes that require an approval token.
    pub approval_required_risk_classes: Vec<RiskClass>,
}

/// State of a human-approval token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// The approval was granted.
    Granted,
    /// The approval request is still open.
    Pending,
    /// The approval request was rejected.
    Denied,
}

/// A token attached to a request to satisfy an approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalToken {
    /// Current state of the approval.
    pub state: ApprovalState,
    /// Instant after which a granted token is no longer valid.
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execute requests
// ---------------------------------------------------------------------------

/// An inbound capability invocation, as delivered by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteRequest {
    /// Capability to invoke.
    #[schemars(with = "String")]
    pub capability_id: CapabilityId,
    /// Specific version; `None` resolves to the latest published version.
    #[schemars(with = "Option<String>")]
    pub capability_version: Option<CapabilityVersion>,
    /// Tenant on whose behalf the call is made.
    pub tenant_id: String,
    /// Opaque request params, validated against the manifest's input schema.
    pub params: serde_json::Value,
    /// Caller-supplied idempotency key, unique per tenant, ≤ 256 bytes.
    pub idempotency_key: String,
    /// Synthetic-prober traffic: traverses the pipeline, feeds scoring,
    /// never billed.
    #[serde(default)]
    pub is_synthetic: bool,
    /// Correlation id minted by the transport.
    pub request_id: String,
    /// Approval token for approval-gated risk classes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<ApprovalToken>,
}

impl ExecuteRequest {
    /// Check caller-controllable invariants before the pipeline runs.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] listing every violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut problems = Vec::new();
        if self.idempotency_key.is_empty() {
            problems.push("idempotency_key must be non-empty".to_string());
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
            problems.push(format!(
                "idempotency_key exceeds {MAX_IDEMPOTENCY_KEY_BYTES} bytes"
            ));
        }
        if self.tenant_id.is_empty() {
            problems.push("tenant_id must be non-empty".to_string());
        }
        if self.request_id.is_empty() {
            problems.push("request_id must be non-empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                record: "execute request",
                problems,
            })
        }
    }
}

/// Builder for [`ExecuteRequest`]s.
///
/// # Examples
///
/// ```
/// use moat_core::ExecuteRequestBuilder;
/// use serde_json::json;
///
/// let req = ExecuteRequestBuilder::new("slack.post_message", "tenant-1", "k1")
///     .unwrap()
///     .params(json!({"channel": "#general", "text": "hi"}))
///     .build();
/// assert_eq!(req.tenant_id, "tenant-1");
/// assert!(!req.is_synthetic);
/// ```
#[derive(Debug)]
pub struct ExecuteRequestBuilder {
    capability_id: CapabilityId,
    capability_version: Option<CapabilityVersion>,
    tenant_id: String,
    params: serde_json::Value,
    idempotency_key: String,
    is_synthetic: bool,
    request_id: Option<String>,
    approval_token: Option<ApprovalToken>,
}

impl ExecuteRequestBuilder {
    /// Start a builder for the given capability, tenant, and idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] when the capability id is malformed.
    pub fn new(
        capability_id: &str,
        tenant_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Result<Self, IdError> {
        Ok(Self {
            capability_id: CapabilityId::parse(capability_id)?,
            capability_version: None,
            tenant_id: tenant_id.into(),
            params: serde_json::Value::Object(serde_json::Map::new()),
            idempotency_key: idempotency_key.into(),
            is_synthetic: false,
            request_id: None,
            approval_token: None,
        })
    }

    /// Pin a specific capability version.
    #[must_use]
    pub fn version(mut self, version: CapabilityVersion) -> Self {
        self.capability_version = Some(version);
        self
    }

    /// Set the request params.
    #[must_use]
    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Mark the request as synthetic-prober traffic.
    #[must_use]
    pub fn synthetic(mut self, synthetic: bool) -> Self {
        self.is_synthetic = synthetic;
        self
    }

    /// Override the correlation id (defaults to a fresh UUID v7).
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Attach an approval token.
    #[must_use]
    pub fn approval_token(mut self, token: ApprovalToken) -> Self {
        self.approval_token = Some(token);
        self
    }

    /// Consume the builder and produce an [`ExecuteRequest`].
    #[must_use]
    pub fn build(self) -> ExecuteRequest {
        ExecuteRequest {
            capability_id: self.capability_id,
            capability_version: self.capability_version,
            tenant_id: self.tenant_id,
            params: self.params,
            idempotency_key: self.idempotency_key,
            is_synthetic: self.is_synthetic,
            request_id: self
                .request_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            approval_token: self.approval_token,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy decisions
// ---------------------------------------------------------------------------

/// Allow/deny verdict of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// All rules passed.
    Allowed,
    /// A rule denied the invocation.
    Denied,
}

/// The first rule outcome recorded by an evaluation.
///
/// Rules evaluate in a fixed priority order and the first failure
/// short-circuits, so a denied decision carries exactly the highest-priority
/// violated rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleHit {
    /// All checks passed.
    PolicyAllowed,
    /// No bundle exists for the tenant + capability.
    NoPolicyBundle,
    /// A required scope is missing from the grants.
    ScopeNotGranted,
    /// A required scope is explicitly denied.
    ScopeExplicitlyDenied,
    /// Daily call cap reached.
    BudgetDailyCallsExceeded,
    /// Monthly call cap reached.
    BudgetMonthlyCallsExceeded,
    /// Daily cost cap reached.
    BudgetDailyCostExceeded,
    /// Monthly cost cap reached.
    BudgetMonthlyCostExceeded,
    /// The manifest's domain allowlist is empty.
    DomainNotAllowlisted,
    /// Pipeline liveness gate: the manifest is not published.
    CapabilityNotPublished,
    /// Pipeline liveness gate: the capability's routing status is hidden.
    CapabilityHidden,
    /// Approval required and no token supplied.
    ApprovalRequired,
    /// Approval token exists but is pending.
    ApprovalPending,
    /// Approval was denied.
    ApprovalDenied,
    /// Approval token expired.
    ApprovalExpired,
    /// The evaluator failed internally and denied fail-closed.
    PolicyEngineError,
}

impl RuleHit {
    /// Map a deny hit onto the boundary error taxonomy.
    ///
    /// Returns `None` for [`RuleHit::PolicyAllowed`].
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::PolicyAllowed => None,
            Self::NoPolicyBundle => Some(ErrorCode::NoPolicyBundle),
            Self::ScopeNotGranted => Some(ErrorCode::ScopeNotGranted),
            Self::ScopeExplicitlyDenied => Some(ErrorCode::ScopeExplicitlyDenied),
            Self::BudgetDailyCallsExceeded => Some(ErrorCode::BudgetDailyCallsExceeded),
            Self::BudgetMonthlyCallsExceeded => Some(ErrorCode::BudgetMonthlyCallsExceeded),
            Self::BudgetDailyCostExceeded => Some(ErrorCode::BudgetDailyCostExceeded),
            Self::BudgetMonthlyCostExceeded => Some(ErrorCode::BudgetMonthlyCostExceeded),
            Self::DomainNotAllowlisted => Some(ErrorCode::DomainNotAllowlisted),
            Self::CapabilityNotPublished => Some(ErrorCode::CapabilityNotPublished),
            Self::CapabilityHidden => Some(ErrorCode::CapabilityHidden),
            Self::ApprovalRequired => Some(ErrorCode::ApprovalRequired),
            Self::ApprovalPending => Some(ErrorCode::ApprovalPending),
            Self::ApprovalDenied => Some(ErrorCode::ApprovalDenied),
            Self::ApprovalExpired => Some(ErrorCode::ApprovalExpired),
            Self::PolicyEngineError => Some(ErrorCode::PolicyEngineError),
        }
    }
}

/// Budget counter values at evaluation time, before any increment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct BudgetSnapshot {
    /// Calls recorded today (UTC day).
    pub daily_calls_used: u64,
    /// Calls recorded this calendar month (UTC).
    pub monthly_calls_used: u64,
    /// Cost in USD recorded today.
    pub daily_cost_usd_used: f64,
    /// Cost in USD recorded this calendar month.
    pub monthly_cost_usd_used: f64,
}

/// Immutable audit record of one policy evaluation.
///
/// Written before any side effect other than itself; referenced by the
/// receipt it gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PolicyDecision {
    /// Time-ordered unique id (UUID v7).
    pub id: Uuid,
    /// The verdict.
    pub decision: Decision,
    /// First failing rule, or `POLICY_ALLOWED`.
    pub rule_hit: RuleHit,
    /// Wall-clock evaluation duration in milliseconds.
    pub evaluation_ms: u64,
    /// Scopes the manifest required at evaluation time.
    pub requested_scopes: Vec<String>,
    /// Scopes the bundle granted at evaluation time.
    pub granted_scopes: Vec<String>,
    /// Budget counters at evaluation time (pre-increment).
    pub budget_state: BudgetSnapshot,
    /// Correlation id of the originating request.
    pub request_id: String,
    /// Soft-limit annotations (`hard_limit=false` downgrades).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// The manifest was served stale because the registry was unreachable.
    #[serde(default)]
    pub stale_manifest: bool,
    /// Evaluation timestamp.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// Terminal status of one observable execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// The adapter call succeeded.
    Success,
    /// The adapter call failed (taxonomy code recorded).
    Failure,
    /// A stored receipt was replayed for a duplicate idempotency key.
    IdempotentHit,
}

/// Immutable record of one observable execution.
///
/// Carries hashes, never raw bodies. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Receipt {
    /// Time-ordered unique id (UUID v7).
    pub id: Uuid,
    /// Capability that was invoked.
    #[schemars(with = "String")]
    pub capability_id: CapabilityId,
    /// Resolved capability version.
    #[schemars(with = "String")]
    pub capability_version: CapabilityVersion,
    /// Invoking tenant.
    pub tenant_id: String,
    /// Correlation id of the originating request.
    pub request_id: String,
    /// Caller-supplied idempotency key.
    pub idempotency_key: String,
    /// SHA-256 over canonical JSON of the redacted params.
    pub input_hash: String,
    /// SHA-256 over canonical JSON of the redacted output; absent on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// Terminal status.
    pub status: ReceiptStatus,
    /// Taxonomy code on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub error_code: Option<ErrorCode>,
    /// Redacted provider error detail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// The policy decision that gated this execution.
    pub policy_decision_id: Uuid,
    /// Synthetic-prober traffic marker.
    pub is_synthetic: bool,
    /// Free-form annotation (e.g. the stub adapter marks its output).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_annotation: Option<String>,
    /// Receipt creation timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Receipt {
    /// Derive the idempotent-hit view of a stored receipt: same hashes and
    /// identifiers, `status=idempotent_hit`, latency measured from the
    /// replaying pipeline's entry.
    #[must_use]
    pub fn replayed(&self, request_id: &str, latency_ms: u64, at: DateTime<Utc>) -> Receipt {
        Receipt {
            id: Uuid::now_v7(),
            request_id: request_id.to_string(),
            latency_ms,
            status: ReceiptStatus::IdempotentHit,
            timestamp: at,
            ..self.clone()
        }
    }
}

/// Builder for [`Receipt`]s.
///
/// # Examples
///
/// ```
/// use moat_core::{CapabilityVersion, ReceiptBuilder, ReceiptStatus};
/// use uuid::Uuid;
///
/// let receipt = ReceiptBuilder::new(
///     "slack.post_message".parse().unwrap(),
///     CapabilityVersion::new(1, 0, 0),
///     "tenant-1",
///     "req-1",
///     "k1",
///     Uuid::now_v7(),
/// )
/// .status(ReceiptStatus::Success)
/// .input_hash("abc")
/// .build();
/// assert_eq!(receipt.status, ReceiptStatus::Success);
/// ```
#[derive(Debug)]
pub struct ReceiptBuilder {
    capability_id: CapabilityId,
    capability_version: CapabilityVersion,
    tenant_id: String,
    request_id: String,
    idempotency_key: String,
    policy_decision_id: Uuid,
    input_hash: String,
    output_hash: Option<String>,
    latency_ms: u64,
    status: ReceiptStatus,
    error_code: Option<ErrorCode>,
    error_detail: Option<String>,
    is_synthetic: bool,
    output_annotation: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl ReceiptBuilder {
    /// Start a builder with the identifying fields every receipt carries.
    #[must_use]
    pub fn new(
        capability_id: CapabilityId,
        capability_version: CapabilityVersion,
        tenant_id: impl Into<String>,
        request_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        policy_decision_id: Uuid,
    ) -> Self {
        Self {
            capability_id,
            capability_version,
            tenant_id: tenant_id.into(),
            request_id: request_id.into(),
            idempotency_key: idempotency_key.into(),
            policy_decision_id,
            input_hash: String::new(),
            output_hash: None,
            latency_ms: 0,
            status: ReceiptStatus::Success,
            error_code: None,
            error_detail: None,
            is_synthetic: false,
            output_annotation: None,
            timestamp: None,
        }
    }

    /// Set the input hash (SHA-256 over canonical redacted params).
    #[must_use]
    pub fn input_hash(mut self, hash: impl Into<String>) -> Self {
        self.input_hash = hash.into();
        self
    }

    /// Set the output hash.
    #[must_use]
    pub fn output_hash(mut self, hash: impl Into<String>) -> Self {
        self.output_hash = Some(hash.into());
        self
    }

    /// Set the latency in milliseconds.
    #[must_use]
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    /// Set the terminal status.
    #[must_use]
    pub fn status(mut self, status: ReceiptStatus) -> Self {
        self.status = status;
        self
    }

    /// Record a failure taxonomy code.
    #[must_use]
    pub fn error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    /// Record a redacted provider error detail.
    #[must_use]
    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    /// Mark the receipt as synthetic traffic.
    #[must_use]
    pub fn synthetic(mut self, synthetic: bool) -> Self {
        self.is_synthetic = synthetic;
        self
    }

    /// Attach a free-form output annotation.
    #[must_use]
    pub fn output_annotation(mut self, note: impl Into<String>) -> Self {
        self.output_annotation = Some(note.into());
        self
    }

    /// Pin the creation timestamp (defaults to now).
    #[must_use]
    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Consume the builder and produce a write-once [`Receipt`].
    #[must_use]
    pub fn build(self) -> Receipt {
        Receipt {
            id: Uuid::now_v7(),
            capability_id: self.capability_id,
            capability_version: self.capability_version,
            tenant_id: self.tenant_id,
            request_id: self.request_id,
            idempotency_key: self.idempotency_key,
            input_hash: self.input_hash,
            output_hash: self.output_hash,
            latency_ms: self.latency_ms,
            status: self.status,
            error_code: self.error_code,
            error_detail: self.error_detail,
            policy_decision_id: self.policy_decision_id,
            is_synthetic: self.is_synthetic,
            output_annotation: self.output_annotation,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome events and capability stats
// ---------------------------------------------------------------------------

/// Telemetry projection of a receipt, consumed by the trust scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutcomeEvent {
    /// The receipt this event projects.
    pub receipt_id: Uuid,
    /// Capability that was invoked.
    #[schemars(with = "String")]
    pub capability_id: CapabilityId,
    /// Resolved capability version.
    #[schemars(with = "String")]
    pub capability_version: CapabilityVersion,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// Taxonomy code on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub error_taxonomy: Option<ErrorCode>,
    /// Receipt timestamp.
    pub timestamp: DateTime<Utc>,
    /// Synthetic-prober traffic marker.
    pub is_synthetic: bool,
}

impl OutcomeEvent {
    /// Project a receipt into its scoring event.
    ///
    /// Idempotent hits are not observable executions; callers skip them
    /// before projecting.
    #[must_use]
    pub fn from_receipt(receipt: &Receipt) -> Self {
        Self {
            receipt_id: receipt.id,
            capability_id: receipt.capability_id.clone(),
            capability_version: receipt.capability_version,
            success: receipt.status == ReceiptStatus::Success,
            latency_ms: receipt.latency_ms,
            error_taxonomy: receipt.error_code,
            timestamp: receipt.timestamp,
            is_synthetic: receipt.is_synthetic,
        }
    }
}

/// Rolling reliability aggregate for one `(capability, version)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityStats {
    /// Capability the stats describe.
    #[schemars(with = "String")]
    pub capability_id: CapabilityId,
    /// Capability version the stats describe.
    #[schemars(with = "String")]
    pub capability_version: CapabilityVersion,
    /// Weighted success rate over the 7-day window; `None` below the
    /// minimum scoring volume.
    pub weighted_success_rate_7d: Option<f64>,
    /// Median latency over included events.
    pub p50_latency_ms: f64,
    /// 95th-percentile latency over included events.
    pub p95_latency_ms: f64,
    /// Included events in the window.
    pub total_calls_7d: u64,
    /// Timestamp of the most recent synthetic probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synthetic_check_at: Option<DateTime<Utc>>,
    /// Result of the most recent synthetic probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synthetic_status: Option<SyntheticStatus>,
    /// Snapshot computation timestamp.
    pub computed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Canonicalization and hashing
// ---------------------------------------------------------------------------

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing.
///
/// This is not a full JCS implementation, but it is stable for our types:
/// - keys are sorted (serde_json Map is a BTreeMap by default)
/// - numbers are serialized consistently by serde_json
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
