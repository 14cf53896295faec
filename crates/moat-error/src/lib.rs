//! Closed error taxonomy with stable error codes for Moat.
//!
//! Every fault that crosses the execution boundary carries an [`ErrorCode`]
//! (a machine-readable, stable string tag), a human-readable message, an
//! optional cause chain, and arbitrary key-value context.  Use the builder
//! returned by [`MoatError::new`] to construct errors fluently.
//!
//! The taxonomy is *closed*: adapters and stores map their internal failures
//! onto one of these codes, and callers decide whether to retry from the
//! code's [`Retryability`] alone.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Policy rule denials and evaluator faults.
    Policy,
    /// Budget cap denials (calls and cost, daily and monthly).
    Budget,
    /// Human-approval gate states.
    Approval,
    /// Capability manifest / routing state rejections.
    Capability,
    /// Caller identity problems.
    Auth,
    /// Request parameter problems.
    Params,
    /// Errors reported by the upstream provider.
    Provider,
    /// Transport-level failures between Moat and the provider.
    Transport,
    /// Faults inside the Moat core itself.
    Gateway,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Policy => "policy",
            Self::Budget => "budget",
            Self::Approval => "approval",
            Self::Capability => "capability",
            Self::Auth => "auth",
            Self::Params => "params",
            Self::Provider => "provider",
            Self::Transport => "transport",
            Self::Gateway => "gateway",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Retryability
// ---------------------------------------------------------------------------

/// Whether (and how) a caller may retry after receiving a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retryability {
    /// Retrying will not help; operator or caller action is required first.
    No,
    /// Retry is permitted once the budget period rolls over.
    AfterReset,
    /// Retry is permitted once the gate condition changes (e.g. approval granted).
    Conditional,
    /// Retry is permitted with backoff.
    WithBackoff,
    /// Retry is permitted immediately.
    Yes,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Policy --
    /// No policy bundle exists for the tenant + capability pair.
    NoPolicyBundle,
    /// A required scope was not granted to the tenant.
    ScopeNotGranted,
    /// A required scope is explicitly denied for the tenant.
    ScopeExplicitlyDenied,
    /// Generic policy denial (used in outcome telemetry).
    PolicyDenied,
    /// The policy evaluator failed internally and denied fail-closed.
    PolicyEngineError,

    // -- Budget --
    /// Daily call cap reached.
    BudgetDailyCallsExceeded,
    /// Monthly call cap reached.
    BudgetMonthlyCallsExceeded,
    /// Daily cost cap reached.
    BudgetDailyCostExceeded,
    /// Monthly cost cap reached.
    BudgetMonthlyCostExceeded,

    // -- Approval --
    /// The risk class requires approval and no token was supplied.
    ApprovalRequired,
    /// An approval token exists but is still pending.
    ApprovalPending,
    /// The approval request was denied.
    ApprovalDenied,
    /// The approval token has expired.
    ApprovalExpired,

    // -- Capability --
    /// The manifest is not in `published` status.
    CapabilityNotPublished,
    /// The capability's routing status is `hidden`.
    CapabilityHidden,
    /// The outbound host is not in the manifest's domain allowlist.
    DomainNotAllowlisted,

    // -- Auth --
    /// The authenticated tenant does not match the request tenant.
    Unauthorized,

    // -- Params --
    /// Request params failed the manifest's input JSON Schema.
    ParamsSchemaViolation,

    // -- Provider --
    /// Provider rejected the input (4xx validation).
    ProviderInvalidInput,
    /// Provider rejected the credential (401/403).
    ProviderAuthFailure,
    /// Provider could not find the resource (404).
    ProviderNotFound,
    /// Provider rate-limited the call (429).
    ProviderRateLimited,
    /// Provider failed internally (5xx).
    ProviderServerError,

    // -- Transport --
    /// The adapter deadline elapsed.
    Timeout,
    /// The transport to the provider failed.
    NetworkError,

    // -- Gateway --
    /// A fault inside the Moat core itself.
    GatewayError,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoPolicyBundle
            | Self::ScopeNotGranted
            | Self::ScopeExplicitlyDenied
            | Self::PolicyDenied
            | Self::PolicyEngineError => ErrorCategory::Policy,

            Self::BudgetDailyCallsExceeded
            | Self::BudgetMonthlyCallsExceeded
            | Self::BudgetDailyCostExceeded
            | Self::BudgetMonthlyCostExceeded => ErrorCategory::Budget,

            Self::ApprovalRequired
            | Self::ApprovalPending
            | Self::ApprovalDenied
            | Self::ApprovalExpired => ErrorCategory::Approval,

            Self::CapabilityNotPublished | Self::CapabilityHidden | Self::DomainNotAllowlisted => {
                ErrorCategory::Capability
            }

            Self::Unauthorized => ErrorCategory::Auth,

            Self::ParamsSchemaViolation => ErrorCategory::Params,

            Self::ProviderInvalidInput
            | Self::ProviderAuthFailure
            | Self::ProviderNotFound
            | Self::ProviderRateLimited
            | Self::ProviderServerError => ErrorCategory::Provider,

            Self::Timeout | Self::NetworkError => ErrorCategory::Transport,

            Self::GatewayError => ErrorCategory::Gateway,
        }
    }

    /// Whether a caller may retry after receiving this code.
    pub fn retryability(&self) -> Retryability {
        match self {
            Self::NoPolicyBundle
            | Self::ScopeNotGranted
            | Self::ScopeExplicitlyDenied
            | Self::PolicyDenied
            | Self::PolicyEngineError
            | Self::DomainNotAllowlisted
            | Self::CapabilityNotPublished
            | Self::CapabilityHidden
            | Self::Unauthorized
            | Self::ParamsSchemaViolation
            | Self::ProviderInvalidInput
            | Self::ProviderAuthFailure
            | Self::ProviderNotFound => Retryability::No,

            Self::BudgetDailyCallsExceeded
            | Self::BudgetMonthlyCallsExceeded
            | Self::BudgetDailyCostExceeded
            | Self::BudgetMonthlyCostExceeded => Retryability::AfterReset,

            Self::ApprovalRequired
            | Self::ApprovalPending
            | Self::ApprovalDenied
            | Self::ApprovalExpired => Retryability::Conditional,

            Self::ProviderRateLimited => Retryability::WithBackoff,

            Self::ProviderServerError | Self::Timeout | Self::NetworkError | Self::GatewayError => {
                Retryability::Yes
            }
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"BUDGET_DAILY_CALLS_EXCEEDED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPolicyBundle => "NO_POLICY_BUNDLE",
            Self::ScopeNotGranted => "SCOPE_NOT_GRANTED",
            Self::ScopeExplicitlyDenied => "SCOPE_EXPLICITLY_DENIED",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::PolicyEngineError => "POLICY_ENGINE_ERROR",
            Self::BudgetDailyCallsExceeded => "BUDGET_DAILY_CALLS_EXCEEDED",
            Self::BudgetMonthlyCallsExceeded => "BUDGET_MONTHLY_CALLS_EXCEEDED",
            Self::BudgetDailyCostExceeded => "BUDGET_DAILY_COST_EXCEEDED",
            Self::BudgetMonthlyCostExceeded => "BUDGET_MONTHLY_COST_EXCEEDED",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::ApprovalPending => "APPROVAL_PENDING",
            Self::ApprovalDenied => "APPROVAL_DENIED",
            Self::ApprovalExpired => "APPROVAL_EXPIRED",
            Self::CapabilityNotPublished => "CAPABILITY_NOT_PUBLISHED",
            Self::CapabilityHidden => "CAPABILITY_HIDDEN",
            Self::DomainNotAllowlisted => "DOMAIN_NOT_ALLOWLISTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ParamsSchemaViolation => "PARAMS_SCHEMA_VIOLATION",
            Self::ProviderInvalidInput => "PROVIDER_INVALID_INPUT",
            Self::ProviderAuthFailure => "PROVIDER_AUTH_FAILURE",
            Self::ProviderNotFound => "PROVIDER_NOT_FOUND",
            Self::ProviderRateLimited => "PROVIDER_RATE_LIMITED",
            Self::ProviderServerError => "PROVIDER_SERVER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::GatewayError => "GATEWAY_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MoatError
// ---------------------------------------------------------------------------

/// Unified Moat error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use moat_error::{ErrorCode, MoatError};
///
/// let err = MoatError::new(ErrorCode::Timeout, "adapter timed out after 30 s")
///     .with_context("provider", "slack")
///     .with_context("timeout_ms", 30_000);
/// ```
pub struct MoatError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl MoatError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.retryability()`.
    pub fn retryability(&self) -> Retryability {
        self.code.retryability()
    }
}

impl fmt::Debug for MoatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("MoatError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for MoatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for MoatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`MoatError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoatErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&MoatError> for MoatErrorDto {
    fn from(err: &MoatError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<MoatErrorDto> for MoatError {
    fn from(dto: MoatErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
