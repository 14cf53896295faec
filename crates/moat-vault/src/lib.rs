// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-vault
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use zeroize::Zeroize;

/// Errors from vault and connection lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    /// No connection row exists for the tenant + provider pair.
    #[error("no connection for tenant {tenant_id:?} and provider {provider:?}")]
    NoConnection {
        /// Tenant that asked.
        tenant_id: String,
        /// Provider that was requested.
        provider: String,
    },

    /// The secret reference did not resolve.
    #[error("secret reference did not resolve")]
    UnknownSecretRef,

    /// The vault could not be reached.
    #[error("vault unreachable: {reason}")]
    Unreachable {
        /// Transport-level detail.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A raw provider credential, alive only for the span of one adapter call.
///
/// The type deliberately implements neither `Clone` nor serde, so a
/// credential cannot be stashed in a record, logged through `Debug`, or
/// outlive the dispatch that needed it. Memory is zeroized on drop.
pub struct Credential(String);

impl Credential {
    /// Wrap a raw secret string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Expose the raw secret for the adapter call. The name is deliberately
    /// loud; call sites are audit points.
    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential").field(&"<redacted>").finish()
    }
}

impl Zeroize for Credential {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.zeroize();
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Opaque reference to a secret held by the external vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef(pub String);

/// Maps `(tenant, provider)` to the tenant's connection secret reference.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Look up the secret reference for a tenant's provider connection.
    async fn secret_ref(&self, tenant_id: &str, provider: &str) -> Result<SecretRef, VaultError>;
}

/// Resolves secret references to raw credentials at call time.
///
/// Raw credentials are returned in-memory and never cached.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Resolve a secret reference.
    async fn resolve(&self, secret_ref: &SecretRef) -> Result<Credential, VaultError>;
}

// ---------------------------------------------------------------------------
// In-memory doubles
// ---------------------------------------------------------------------------

/// In-memory [`ConnectionStore`] for tests and development.
#[derive(Default)]
pub struct StaticConnections {
    rows: Mutex<HashMap<(String, String), SecretRef>>,
}

impl StaticConnections {
    /// Create an empty connection store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection row.
    pub async fn connect(&self, tenant_id: &str, provider: &str, secret_ref: SecretRef) {
        self.rows
            .lock()
            .await
            .insert((tenant_id.to_string(), provider.to_string()), secret_ref);
    }
}

#[async_trait]
impl ConnectionStore for StaticConnections {
    async fn secret_ref(&self, tenant_id: &str, provider: &str) -> Result<SecretRef, VaultError> {
        self.rows
            .lock()
            .await
            .get(&(tenant_id.to_string(), provider.to_string()))
            .cloned()
            .ok_or_else(|| VaultError::NoConnection {
                tenant_id: tenant_id.to_string(),
                provider: provider.to_string(),
            })
    }
}

/// In-memory [`Vault`] for tests and development.
#[derive(Default)]
pub struct StaticVault {
    secrets: Mutex<HashMap<SecretRef, String>>,
}

impl StaticVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a secret under a reference.
    pub async fn put(&self, secret_ref: SecretRef, raw: impl Into<String>) {
        self.secrets.lock().await.insert(secret_ref, raw.into());
    }
}

#[async_trait]
impl Vault for StaticVault {
    async fn resolve(&self, secret_ref: &SecretRef) -> Result<Credential, VaultError> {
        self.secrets
            .lock()
            .await
            .get(secret_ref)
            .map(|raw| Credential::new(raw.clone()))
            .ok_or(VaultError::UnknownSecretRef)
    }
}
