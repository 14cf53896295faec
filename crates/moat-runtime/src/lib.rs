// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Broadcast-based outcome bus.
pub mod emitter;
/// The execute pipeline orchestrator.
pub mod pipeline;
/// Best-effort receipt publication seam.
pub mod publish;
/// Receipt and decision persistence.
pub mod store;

pub use emitter::{OutcomeBus, OutcomeBusStats, OutcomeSubscription};
pub use pipeline::{ExecutePipeline, PipelineParts};
pub use publish::{CollectingPublisher, NullPublisher, ReceiptPublisher};
pub use store::{DecisionStore, ReceiptStore};

use moat_core::{PolicyDecision, Receipt};
use moat_error::ErrorCode;

/// A pre-policy fault, returned without a receipt or decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message} (request {request_id})")]
pub struct ExecuteError {
    /// Taxonomy code for the fault.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Correlation id of the request that faulted.
    pub request_id: String,
}

/// What one pipeline invocation returns.
#[derive(Debug)]
pub enum ExecuteResult {
    /// A receipt: success, failure, or idempotent hit.
    Receipt(Receipt),
    /// A pre-execution policy denial; the decision is persisted.
    PolicyDenied(PolicyDecision),
    /// A pre-policy fault: manifest unresolvable, auth mismatch,
    /// idempotency store down.
    Error(ExecuteError),
}

impl ExecuteResult {
    /// The receipt, if this result carries one.
    #[must_use]
    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            Self::Receipt(r) => Some(r),
            _ => None,
        }
    }

    /// The denial decision, if this result carries one.
    #[must_use]
    pub fn denial(&self) -> Option<&PolicyDecision> {
        match self {
            Self::PolicyDenied(d) => Some(d),
            _ => None,
        }
    }

    /// The pre-policy fault, if this result carries one.
    #[must_use]
    pub fn error(&self) -> Option<&ExecuteError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }
}
