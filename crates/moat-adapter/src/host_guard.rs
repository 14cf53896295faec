// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound host enforcement shared by every adapter.
//!
//! Three checks, in order: the host must be in the manifest's domain
//! allowlist, the port must be 80 or 443, and every address the host
//! resolves to must be publicly routable (no RFC-1918, loopback,
//! link-local, unique-local, or unspecified addresses). The DNS check runs
//! post-resolution, so an allowlisted name that points at an internal
//! address is still rejected.

use std::net::IpAddr;
use tracing::warn;

/// A rejected outbound host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostGuardError {
    /// The host is not in the manifest's domain allowlist.
    #[error("host {host:?} is not in the domain allowlist")]
    NotAllowlisted {
        /// The offending host.
        host: String,
    },

    /// The port is not 80 or 443.
    #[error("port {port} is not permitted")]
    ForbiddenPort {
        /// The offending port.
        port: u16,
    },

    /// The host resolved to a private, loopback, link-local, or
    /// unspecified address.
    #[error("host {host:?} resolved to forbidden address {addr}")]
    ForbiddenAddress {
        /// The offending host.
        host: String,
        /// The resolved address that tripped the check.
        addr: IpAddr,
    },

    /// DNS resolution failed entirely.
    #[error("host {host:?} did not resolve: {reason}")]
    ResolutionFailed {
        /// The offending host.
        host: String,
        /// Resolver error detail.
        reason: String,
    },
}

/// Whether `addr` must never be dialled from an adapter.
#[must_use]
pub fn is_forbidden_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_forbidden_address(IpAddr::V4(mapped));
            }
            // fe80::/10 link-local and fc00::/7 unique-local.
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg0 & 0xffc0) == 0xfe80
                || (seg0 & 0xfe00) == 0xfc00
        }
    }
}

/// The shared outbound host guard.
#[derive(Debug, Clone)]
pub struct HostGuard {
    permissive: bool,
}

impl HostGuard {
    /// The production guard: all three checks enforced.
    #[must_use]
    pub fn strict() -> Self {
        Self { permissive: false }
    }

    /// Development/test guard: allowlist membership is still enforced, but
    /// port and address checks are skipped so local mock providers work.
    #[must_use]
    pub fn allowing_private_hosts() -> Self {
        Self { permissive: true }
    }

    /// Run the pre-call checks for `host:port` against `allowlist`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`HostGuardError`].
    pub async fn check(
        &self,
        host: &str,
        port: u16,
        allowlist: &[String],
    ) -> Result<(), HostGuardError> {
        let host_lower = host.to_ascii_lowercase();
        if !allowlist.iter().any(|d| d.to_ascii_lowercase() == host_lower) {
            warn!(host, "outbound host not in allowlist");
            return Err(HostGuardError::NotAllowlisted {
                host: host.to_string(),
            });
        }

        if self.permissive {
            return Ok(());
        }

        if port != 80 && port != 443 {
            return Err(HostGuardError::ForbiddenPort { port });
        }

        // Literal addresses never get this far in production manifests
        // (validation rejects them), but guard anyway.
        if let Ok(addr) = host.parse::<IpAddr>() {
            if is_forbidden_address(addr) {
                return Err(HostGuardError::ForbiddenAddress {
                    host: host.to_string(),
                    addr,
                });
            }
            return Ok(());
        }

        let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
            HostGuardError::ResolutionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            }
        })?;
        for sock in addrs {
            if is_forbidden_address(sock.ip()) {
                warn!(host, addr = %sock.ip(), "host resolved to forbidden address");
                return Err(HostGuardError::ForbiddenAddress {
                    host: host.to_string(),
                    addr: sock.ip(),
                });
            }
        }
        Ok(())
    }
}
