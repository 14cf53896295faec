// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! moat-catalog
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use moat_core::{CapabilityId, CapabilityManifest, CapabilityVersion, ManifestStatus, RoutingStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Errors from the external registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("capability registry unreachable: {reason}")]
    Unreachable {
        /// Transport-level detail.
        reason: String,
    },
}

/// Errors from manifest resolution through the cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// No such capability (possibly served from the negative cache).
    #[error("capability not found: {id}@{version}")]
    NotFound {
        /// Requested capability id.
        id: String,
        /// Requested version, or `latest-published`.
        version: String,
    },

    /// The registry was unreachable and no cached entry could answer.
    #[error("capability registry unreachable and no cached manifest for {id}")]
    Unreachable {
        /// Requested capability id.
        id: String,
    },
}

/// Read-only lookup into the external capability manifest registry.
///
/// `Ok(None)` means the capability (or version) does not exist; `Err` means
/// the registry could not be consulted at all. The distinction drives the
/// negative cache vs. stale-serve behaviour in [`ManifestCache`].
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    /// Fetch a manifest by id, either a pinned version or the latest
    /// published one.
    async fn get_manifest(
        &self,
        id: &CapabilityId,
        version: Option<&CapabilityVersion>,
    ) -> Result<Option<CapabilityManifest>, RegistryError>;
}

// ---------------------------------------------------------------------------
// ManifestCache
// ---------------------------------------------------------------------------

/// A successfully resolved manifest, with its freshness annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedManifest {
    /// The manifest.
    pub manifest: CapabilityManifest,
    /// `true` when the registry was unreachable and an expired cache entry
    /// was served instead. Surfaces on the policy decision.
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    // None caches a negative lookup.
    value: Option<CapabilityManifest>,
    fetched_at: Instant,
}

type CacheKey = (CapabilityId, Option<CapabilityVersion>);

/// Time-bounded read-through cache over a [`CapabilityRegistry`].
///
/// Entries are keyed both by pinned `(id, version)` and by
/// `(id, latest-published)` (the `None` version key). Positive entries live
/// for the configured TTL, negative entries for the (shorter) negative TTL.
/// When the registry is unreachable an expired positive entry is served
/// stale rather than failing the pipeline.
pub struct ManifestCache {
    registry: Arc<dyn CapabilityRegistry>,
    ttl: Duration,
    negative_ttl: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl ManifestCache {
    /// Create a cache over `registry` with the given TTLs.
    #[must_use]
    pub fn new(registry: Arc<dyn CapabilityRegistry>, ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            negative_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a manifest, consulting the cache first.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the registry (or the negative cache)
    /// answers that the capability does not exist; [`CatalogError::Unreachable`]
    /// when the registry is down and no cached entry, fresh or stale, exists.
    pub async fn resolve(
        &self,
        id: &CapabilityId,
        version: Option<&CapabilityVersion>,
    ) -> Result<ResolvedManifest, CatalogError> {
        let key: CacheKey = (id.clone(), version.copied());

        let cached = {
            let entries = self.entries.read().await;
            entries.get(&key).cloned()
        };

        if let Some(entry) = &cached {
            let age = entry.fetched_at.elapsed();
            match &entry.value {
                Some(manifest) if age < self.ttl => {
                    debug!(capability = %id, "manifest cache hit");
                    return Ok(ResolvedManifest {
                        manifest: manifest.clone(),
                        stale: false,
                    });
                }
                None if age < self.negative_ttl => {
                    debug!(capability = %id, "manifest negative-cache hit");
                    return Err(self.not_found(id, version));
                }
                _ => {}
            }
        }

        match self.registry.get_manifest(id, version).await {
            Ok(found) => {
                let mut entries = self.entries.write().await;
                entries.insert(
                    key,
                    CacheEntry {
                        value: found.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                match found {
                    Some(manifest) => Ok(ResolvedManifest {
                        manifest,
                        stale: false,
                    }),
                    None => Err(self.not_found(id, version)),
                }
            }
            Err(RegistryError::Unreachable { reason }) => {
                // Serve an expired positive entry stale rather than failing.
                if let Some(CacheEntry {
                    value: Some(manifest),
                    ..
                }) = cached
                {
                    warn!(capability = %id, %reason, "registry unreachable, serving stale manifest");
                    return Ok(ResolvedManifest {
                        manifest,
                        stale: true,
                    });
                }
                warn!(capability = %id, %reason, "registry unreachable and no cached manifest");
                Err(CatalogError::Unreachable { id: id.to_string() })
            }
        }
    }

    /// Drop any cached entries for the given capability (all version keys).
    ///
    /// Used when the routing advisor transitions a capability so the next
    /// pipeline read observes the new routing status immediately.
    pub async fn invalidate(&self, id: &CapabilityId) {
        let mut entries = self.entries.write().await;
        entries.retain(|(cached_id, _), _| cached_id != id);
    }

    fn not_found(&self, id: &CapabilityId, version: Option<&CapabilityVersion>) -> CatalogError {
        CatalogError::NotFound {
            id: id.to_string(),
            version: version
                .map(ToString::to_string)
                .unwrap_or_else(|| "latest-published".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// StaticRegistry
// ---------------------------------------------------------------------------

/// In-memory registry double for tests and development.
///
/// Supports toggling an "unreachable" mode to exercise the cache's
/// stale-serve path, and routing-status updates to exercise the advisor
/// write-back.
#[derive(Default)]
pub struct StaticRegistry {
    manifests: Mutex<HashMap<(CapabilityId, CapabilityVersion), CapabilityManifest>>,
    unreachable: std::sync::atomic::AtomicBool,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a manifest.
    pub async fn insert(&self, manifest: CapabilityManifest) {
        let mut m = self.manifests.lock().await;
        m.insert((manifest.id.clone(), manifest.version), manifest);
    }

    /// Simulate a registry outage (or recovery).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Update the routing status of a stored manifest, as the trust plane's
    /// write path would.
    pub async fn set_routing_status(
        &self,
        id: &CapabilityId,
        version: &CapabilityVersion,
        status: RoutingStatus,
    ) {
        let mut m = self.manifests.lock().await;
        if let Some(manifest) = m.get_mut(&(id.clone(), *version)) {
            manifest.routing_status = status;
        }
    }
}

#[async_trait]
impl CapabilityRegistry for StaticRegistry {
    async fn get_manifest(
        &self,
        id: &CapabilityId,
        version: Option<&CapabilityVersion>,
    ) -> Result<Option<CapabilityManifest>, RegistryError> {
        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RegistryError::Unreachable {
                reason: "registry offline".to_string(),
            });
        }
        let m = self.manifests.lock().await;
        match version {
            Some(v) => Ok(m.get(&(id.clone(), *v)).cloned()),
            None => {
                // Latest published version wins.
                let mut best: Option<&CapabilityManifest> = None;
                for ((mid, _), manifest) in m.iter() {
                    if mid == id && manifest.status == ManifestStatus::Published {
                        match best {
                            Some(b) if b.version >= manifest.version => {}
                            _ => best = Some(manifest),
                        }
                    }
                }
                Ok(best.cloned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moat_core::RiskClass;
    use serde_json::json;

    fn manifest(version: &str, status: ManifestStatus) -> CapabilityManifest {
        CapabilityManifest {
            id: "slack.post_message".parse().unwrap(),
            version: version.parse().unwrap(),
            provider: "slack".into(),
            method: "chat.postMessage".into(),
            scopes: vec!["slack.post_message".into()],
            input_schema: json!({"type": "object"}),
            output_schema: json!({"type": "object"}),
            risk_class: RiskClass::Low,
            domain_allowlist: vec!["api.slack.com".into()],
            status,
            routing_status: RoutingStatus::Active,
            verified: true,
        }
    }

    fn id() -> CapabilityId {
        "slack.post_message".parse().unwrap()
    }

    #[tokio::test]
    async fn resolves_pinned_version_through_cache() {
        let registry = Arc::new(StaticRegistry::new());
        registry.insert(manifest("1.0.0", ManifestStatus::Published)).await;
        let cache = ManifestCache::new(
            registry,
            Duration::from_secs(300),
            Duration::from_secs(30),
        );

        let v = "1.0.0".parse().unwrap();
        let resolved = cache.resolve(&id(), Some(&v)).await.unwrap();
        assert!(!resolved.stale);
        assert_eq!(resolved.manifest.version, v);
    }

    #[tokio::test]
    async fn latest_published_skips_drafts_and_picks_highest() {
        let registry = Arc::new(StaticRegistry::new());
        registry.insert(manifest("1.0.0", ManifestStatus::Published)).await;
        registry.insert(manifest("1.2.0", ManifestStatus::Published)).await;
        registry.insert(manifest("2.0.0", ManifestStatus::Draft)).await;
        let cache = ManifestCache::new(
            registry,
            Duration::from_secs(300),
            Duration::from_secs(30),
        );

        let resolved = cache.resolve(&id(), None).await.unwrap();
        assert_eq!(resolved.manifest.version.to_string(), "1.2.0");
    }

    #[tokio::test]
    async fn missing_capability_is_not_found_and_negatively_cached() {
        let registry = Arc::new(StaticRegistry::new());
        let cache = ManifestCache::new(
            registry.clone(),
            Duration::from_secs(300),
            Duration::from_secs(30),
        );

        let err = cache.resolve(&id(), None).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));

        // The manifest now exists, but the negative cache still answers.
        registry.insert(manifest("1.0.0", ManifestStatus::Published)).await;
        let err = cache.resolve(&id(), None).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }

    #[tokio::test]
    async fn negative_entries_expire_quickly() {
        let registry = Arc::new(StaticRegistry::new());
        let cache = ManifestCache::new(
            registry.clone(),
            Duration::from_secs(300),
            Duration::ZERO,
        );

        let _ = cache.resolve(&id(), None).await;
        registry.insert(manifest("1.0.0", ManifestStatus::Published)).await;
        // Zero negative TTL: the next read goes back to the registry.
        assert!(cache.resolve(&id(), None).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_with_no_cache_fails() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_unreachable(true);
        let cache = ManifestCache::new(
            registry,
            Duration::from_secs(300),
            Duration::from_secs(30),
        );

        let err = cache.resolve(&id(), None).await.unwrap_err();
        assert!(matches!(err, CatalogError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn expired_entry_serves_stale_when_registry_down() {
        let registry = Arc::new(StaticRegistry::new());
        registry.insert(manifest("1.0.0", ManifestStatus::Published)).await;
        // Zero TTL: every positive entry is immediately expired.
        let cache = ManifestCache::new(registry.clone(), Duration::ZERO, Duration::ZERO);

        let first = cache.resolve(&id(), None).await.unwrap();
        assert!(!first.stale);

        registry.set_unreachable(true);
        let second = cache.resolve(&id(), None).await.unwrap();
        assert!(second.stale, "expired entry must serve stale on outage");
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let registry = Arc::new(StaticRegistry::new());
        registry.insert(manifest("1.0.0", ManifestStatus::Published)).await;
        let cache = ManifestCache::new(
            registry.clone(),
            Duration::from_secs(300),
            Duration::from_secs(30),
        );

        let v = "1.0.0".parse().unwrap();
        let before = cache.resolve(&id(), Some(&v)).await.unwrap();
        assert_eq!(before.manifest.routing_status, RoutingStatus::Active);

        registry
            .set_routing_status(&id(), &v, RoutingStatus::Hidden)
            .await;
        // Cached entry still fresh: old status until invalidated.
        let cached = cache.resolve(&id(), Some(&v)).await.unwrap();
        assert_eq!(cached.manifest.routing_status, RoutingStatus::Active);

        cache.invalidate(&id()).await;
        let after = cache.resolve(&id(), Some(&v)).await.unwrap();
        assert_eq!(after.manifest.routing_status, RoutingStatus::Hidden);
    }
}
