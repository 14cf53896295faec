// SPDX-License-Identifier: MIT OR Apache-2.0
//! Generic HTTP adapter base.
//!
//! Concrete provider adapters are out of scope for the core; this base
//! exists so that when one is written, the shared obligations come for
//! free: every hop passes the [`HostGuard`], redirects are only followed
//! when the target re-passes the guard, responses are size-capped, and
//! provider statuses map onto the closed taxonomy.

use crate::host_guard::{HostGuard, HostGuardError};
use crate::{AdapterFailure, AdapterOutput, AdapterResult, ProviderAdapter, map_http_status};
use async_trait::async_trait;
use moat_core::CapabilityManifest;
use moat_error::ErrorCode;
use moat_vault::Credential;
use reqwest::{StatusCode, Url, redirect};
use tracing::debug;

const MAX_REDIRECT_HOPS: usize = 3;

/// A provider adapter that POSTs JSON params to `base_url` + the
/// manifest's method path, authenticated with a bearer credential.
pub struct HttpAdapter {
    provider: String,
    base_url: Url,
    guard: HostGuard,
    client: reqwest::Client,
    output_limit_bytes: usize,
}

impl HttpAdapter {
    /// Build an adapter for `provider` rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the client cannot be
    /// constructed.
    pub fn new(
        provider: impl Into<String>,
        base_url: Url,
        guard: HostGuard,
        output_limit_bytes: usize,
    ) -> Result<Self, reqwest::Error> {
        // Redirects are handled manually so each hop re-passes the guard.
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            provider: provider.into(),
            base_url,
            guard,
            client,
            output_limit_bytes,
        })
    }

    fn guard_failure(err: HostGuardError) -> AdapterFailure {
        let code = match &err {
            HostGuardError::ResolutionFailed { .. } => ErrorCode::NetworkError,
            _ => ErrorCode::DomainNotAllowlisted,
        };
        AdapterFailure {
            code,
            http_status: None,
            detail: err.to_string(),
        }
    }

    async fn check_url(&self, url: &Url, allowlist: &[String]) -> Result<(), AdapterFailure> {
        let host = url
            .host_str()
            .ok_or_else(|| AdapterFailure {
                code: ErrorCode::DomainNotAllowlisted,
                http_status: None,
                detail: "request URL has no host".to_string(),
            })?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        self.guard
            .check(&host, port, allowlist)
            .await
            .map_err(Self::guard_failure)
    }

    async fn read_capped(&self, response: reqwest::Response) -> Result<Vec<u8>, AdapterFailure> {
        if let Some(len) = response.content_length() {
            if len > self.output_limit_bytes as u64 {
                return Err(self.oversized(len as usize));
            }
        }
        let body = response.bytes().await.map_err(|e| AdapterFailure {
            code: ErrorCode::NetworkError,
            http_status: None,
            detail: e.to_string(),
        })?;
        if body.len() > self.output_limit_bytes {
            return Err(self.oversized(body.len()));
        }
        Ok(body.to_vec())
    }

    fn oversized(&self, got: usize) -> AdapterFailure {
        AdapterFailure {
            code: ErrorCode::GatewayError,
            http_status: None,
            detail: format!(
                "provider output of {got} bytes exceeds the {} byte cap",
                self.output_limit_bytes
            ),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn execute(
        &self,
        params: &serde_json::Value,
        credential: &Credential,
        manifest: &CapabilityManifest,
    ) -> AdapterResult {
        let mut url = self
            .base_url
            .join(&manifest.method)
            .map_err(|e| AdapterFailure {
                code: ErrorCode::GatewayError,
                http_status: None,
                detail: format!("invalid method path: {e}"),
            })?;

        for hop in 0..=MAX_REDIRECT_HOPS {
            self.check_url(&url, &manifest.domain_allowlist).await?;

            let response = self
                .client
                .post(url.clone())
                .bearer_auth(credential.expose_secret())
                .json(params)
                .send()
                .await
                .map_err(|e| {
                    let code = if e.is_timeout() {
                        ErrorCode::Timeout
                    } else {
                        ErrorCode::NetworkError
                    };
                    AdapterFailure {
                        code,
                        http_status: None,
                        detail: e.without_url().to_string(),
                    }
                })?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| url.join(loc).ok());
                match location {
                    Some(next) if hop < MAX_REDIRECT_HOPS => {
                        debug!(provider = %self.provider, target = %next, "following vetted redirect");
                        url = next;
                        continue;
                    }
                    _ => {
                        return Err(AdapterFailure {
                            code: ErrorCode::ProviderServerError,
                            http_status: Some(status.as_u16()),
                            detail: "redirect chain could not be followed".to_string(),
                        });
                    }
                }
            }

            if !status.is_success() {
                let body = self.read_capped(response).await.unwrap_or_default();
                let detail = String::from_utf8_lossy(&body).into_owned();
                return Err(AdapterFailure {
                    code: map_http_status(status.as_u16()),
                    http_status: Some(status.as_u16()),
                    detail,
                });
            }

            let body = self.read_capped(response).await?;
            let output: serde_json::Value =
                serde_json::from_slice(&body).map_err(|e| AdapterFailure {
                    code: ErrorCode::ProviderServerError,
                    http_status: Some(StatusCode::OK.as_u16()),
                    detail: format!("provider returned non-JSON output: {e}"),
                })?;
            return Ok(AdapterOutput {
                output,
                annotation: None,
            });
        }

        unreachable!("redirect loop is bounded")
    }
}
