// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-adapter
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Outbound host enforcement shared by every adapter.
pub mod host_guard;
/// Generic reqwest-based adapter base.
pub mod http;
/// Development fallback adapter.
pub mod stub;

pub use host_guard::{HostGuard, HostGuardError, is_forbidden_address};
pub use http::HttpAdapter;
pub use stub::{STUB_ANNOTATION, StubAdapter};

use async_trait::async_trait;
use moat_core::CapabilityManifest;
use moat_error::ErrorCode;
use moat_vault::Credential;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Successful adapter output.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    /// Provider output as JSON.
    pub output: serde_json::Value,
    /// Free-form annotation carried into the receipt (e.g. stub marker).
    pub annotation: Option<String>,
}

/// Failed adapter call, already mapped onto the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("adapter failure [{code}]: {detail}")]
pub struct AdapterFailure {
    /// Taxonomy code for the failure.
    pub code: ErrorCode,
    /// Provider HTTP status, when one was received.
    pub http_status: Option<u16>,
    /// Detail string; redacted by the pipeline before persistence.
    pub detail: String,
}

/// What an adapter call produces.
pub type AdapterResult = Result<AdapterOutput, AdapterFailure>;

/// A provider adapter. One method, no inheritance.
///
/// Implementations are shared singletons and must be re-entrant; the
/// pipeline may invoke the same adapter from many requests concurrently.
/// Adapters MUST NOT log the raw credential.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider key this adapter serves (matches `manifest.provider`).
    fn provider(&self) -> &str;

    /// Execute one call against the provider.
    async fn execute(
        &self,
        params: &serde_json::Value,
        credential: &Credential,
        manifest: &CapabilityManifest,
    ) -> AdapterResult;
}

/// Map a provider HTTP status onto the taxonomy.
#[must_use]
pub fn map_http_status(status: u16) -> ErrorCode {
    match status {
        401 | 403 => ErrorCode::ProviderAuthFailure,
        404 => ErrorCode::ProviderNotFound,
        429 => ErrorCode::ProviderRateLimited,
        400..=499 => ErrorCode::ProviderInvalidInput,
        500..=599 => ErrorCode::ProviderServerError,
        _ => ErrorCode::NetworkError,
    }
}

/// Typed registry of adapters indexed by provider string.
///
/// Lookups that miss fall back to the [`StubAdapter`] so unwired providers
/// still execute in development, clearly marked in their receipts.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its provider key, replacing any previous
    /// registration.
    pub fn register<A: ProviderAdapter + 'static>(&mut self, adapter: A) {
        self.adapters
            .insert(adapter.provider().to_string(), Arc::new(adapter));
    }

    /// Register an already-shared adapter.
    pub fn register_arc(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.provider().to_string(), adapter);
    }

    /// Look up an adapter by provider key.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    /// Look up an adapter, falling back to the stub for unwired providers.
    #[must_use]
    pub fn get_or_stub(&self, provider: &str) -> Arc<dyn ProviderAdapter> {
        self.get(provider)
            .unwrap_or_else(|| Arc::new(StubAdapter))
    }

    /// Sorted provider keys with registered adapters.
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}
