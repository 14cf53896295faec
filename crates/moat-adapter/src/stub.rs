// SPDX-License-Identifier: MIT OR Apache-2.0
//! Development fallback adapter.

use crate::{AdapterOutput, AdapterResult, ProviderAdapter};
use async_trait::async_trait;
use moat_core::CapabilityManifest;
use moat_vault::Credential;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Annotation written into receipts produced through the stub.
pub const STUB_ANNOTATION: &str = "stub-adapter: no registered provider adapter";

/// Returns a synthetic success with 100–500 ms simulated latency.
///
/// Used for capabilities whose provider has no registered adapter. The
/// latency is derived deterministically from the params and capability id,
/// so replays are reproducible without a random source.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubAdapter;

impl StubAdapter {
    fn simulated_latency(params: &serde_json::Value, manifest: &CapabilityManifest) -> Duration {
        let mut hasher = Sha256::new();
        hasher.update(manifest.id.as_str().as_bytes());
        if let Ok(canonical) = moat_core::canonical_json(params) {
            hasher.update(canonical.as_bytes());
        }
        let digest = hasher.finalize();
        let seed = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        Duration::from_millis(100 + seed % 401)
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn provider(&self) -> &str {
        "stub"
    }

    async fn execute(
        &self,
        params: &serde_json::Value,
        _credential: &Credential,
        manifest: &CapabilityManifest,
    ) -> AdapterResult {
        tokio::time::sleep(Self::simulated_latency(params, manifest)).await;
        Ok(AdapterOutput {
            output: json!({
                "ok": true,
                "stub": true,
                "capability": manifest.id.to_string(),
                "method": manifest.method,
            }),
            annotation: Some(STUB_ANNOTATION.to_string()),
        })
    }
}
