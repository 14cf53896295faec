// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and advisory warnings for Moat.
//!
//! This crate provides [`MoatConfig`] — the execution core's tunables —
//! together with helpers for loading from TOML files and producing advisory
//! [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The adapter timeout is unusually large.
    LargeAdapterTimeout {
        /// Timeout value in milliseconds.
        ms: u64,
    },
    /// The scorer window is shorter than the hide-sustain period, so the
    /// advisor can never observe a full sustain interval.
    SustainExceedsWindow {
        /// Sustain period in seconds.
        sustain_s: u64,
        /// Window length in seconds.
        window_s: u64,
    },
    /// Failure receipts are being cached, which blocks caller retries.
    NonzeroFailureTtl {
        /// Configured failure TTL in seconds.
        ttl_s: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeAdapterTimeout { ms } => {
                write!(f, "adapter timeout is unusually large ({ms} ms)")
            }
            ConfigWarning::SustainExceedsWindow { sustain_s, window_s } => {
                write!(
                    f,
                    "hide sustain period ({sustain_s}s) exceeds the scoring window ({window_s}s)"
                )
            }
            ConfigWarning::NonzeroFailureTtl { ttl_s } => {
                write!(
                    f,
                    "failure receipts cached for {ttl_s}s — retries will not re-execute"
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Execution-core tunables with their documented defaults.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MoatConfig {
    /// Hard deadline for one adapter call, in milliseconds.
    pub adapter_default_timeout_ms: u64,
    /// How long a successful receipt answers duplicate keys, in seconds.
    pub idempotency_ttl_success_s: u64,
    /// How long a failure receipt answers duplicate keys, in seconds.
    /// Zero means failures are never cached and retries re-execute.
    pub idempotency_ttl_failure_s: u64,
    /// Capability manifest cache TTL, in seconds.
    pub capability_cache_ttl_s: u64,
    /// Negative-result cache TTL, in seconds.
    pub capability_cache_negative_ttl_s: u64,
    /// Rolling scoring window, in days.
    pub scorer_window_days: u64,
    /// Minimum included events before a scored verdict is exposed.
    pub scorer_min_volume: u64,
    /// Scorer recomputation cadence, in seconds.
    pub scorer_interval_s: u64,
    /// Weighted-success-rate floor below which a capability hides.
    pub hide_success_threshold: f64,
    /// How long the rate must stay below the floor before hiding, in seconds.
    pub hide_sustained_s: u64,
    /// p95 latency ceiling above which a capability throttles, in ms.
    pub throttle_p95_ms: u64,
    /// Weighted-success-rate floor for preferred status.
    pub preferred_success_threshold: f64,
    /// p95 latency ceiling for preferred status, in ms.
    pub preferred_p95_ms: u64,
    /// Maximum adapter output size per call, in bytes.
    pub output_size_limit_bytes: u64,
}

impl Default for MoatConfig {
    fn default() -> Self {
        Self {
            adapter_default_timeout_ms: 30_000,
            idempotency_ttl_success_s: 86_400,
            idempotency_ttl_failure_s: 0,
            capability_cache_ttl_s: 300,
            capability_cache_negative_ttl_s: 30,
            scorer_window_days: 7,
            scorer_min_volume: 10,
            scorer_interval_s: 900,
            hide_success_threshold: 0.80,
            hide_sustained_s: 86_400,
            throttle_p95_ms: 10_000,
            preferred_success_threshold: 0.99,
            preferred_p95_ms: 2_000,
            output_size_limit_bytes: 1_048_576,
        }
    }
}

impl MoatConfig {
    /// Load a config from a TOML file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::ParseError {
                    reason: e.to_string(),
                }
            }
        })?;
        Self::from_toml(&raw)
    }

    /// Parse a config from a TOML string. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] for malformed or unknown keys.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Semantic validation. Hard errors fail; soft issues come back as
    /// advisory warnings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every hard problem.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if self.adapter_default_timeout_ms == 0 {
            reasons.push("adapter_default_timeout_ms must be > 0".to_string());
        }
        if self.adapter_default_timeout_ms > 600_000 {
            warnings.push(ConfigWarning::LargeAdapterTimeout {
                ms: self.adapter_default_timeout_ms,
            });
        }
        if !(0.0..=1.0).contains(&self.hide_success_threshold) {
            reasons.push("hide_success_threshold must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.preferred_success_threshold) {
            reasons.push("preferred_success_threshold must be in [0, 1]".to_string());
        }
        if self.preferred_success_threshold < self.hide_success_threshold {
            reasons.push(
                "preferred_success_threshold must be >= hide_success_threshold".to_string(),
            );
        }
        if self.scorer_window_days == 0 {
            reasons.push("scorer_window_days must be > 0".to_string());
        }
        if self.scorer_interval_s == 0 {
            reasons.push("scorer_interval_s must be > 0".to_string());
        }
        if self.output_size_limit_bytes == 0 {
            reasons.push("output_size_limit_bytes must be > 0".to_string());
        }
        if self.hide_sustained_s > self.scorer_window_days * 86_400 {
            warnings.push(ConfigWarning::SustainExceedsWindow {
                sustain_s: self.hide_sustained_s,
                window_s: self.scorer_window_days * 86_400,
            });
        }
        if self.idempotency_ttl_failure_s > 0 {
            warnings.push(ConfigWarning::NonzeroFailureTtl {
                ttl_s: self.idempotency_ttl_failure_s,
            });
        }

        if reasons.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// The adapter deadline as a [`Duration`].
    #[must_use]
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_default_timeout_ms)
    }

    /// The capability cache TTL as a [`Duration`].
    #[must_use]
    pub fn capability_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.capability_cache_ttl_s)
    }

    /// The negative-result cache TTL as a [`Duration`].
    #[must_use]
    pub fn capability_cache_negative_ttl(&self) -> Duration {
        Duration::from_secs(self.capability_cache_negative_ttl_s)
    }

    /// The scorer cadence as a [`Duration`].
    #[must_use]
    pub fn scorer_interval(&self) -> Duration {
        Duration::from_secs(self.scorer_interval_s)
    }
}
