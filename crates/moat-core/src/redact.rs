// SPDX-License-Identifier: MIT OR Apache-2.0
//! Denylist-key redaction for params, outputs, and error details.
//!
//! Receipts never store raw request or response bodies, only hashes — and
//! those hashes are computed over the *redacted* form, so a denylisted value
//! can never be brute-forced back out of a stored hash of an otherwise
//! low-entropy document.

use serde_json::Value;
use std::collections::BTreeSet;

/// Replacement string substituted for denylisted values.
pub const REDACTED: &str = "[REDACTED]";

/// Keys whose values are always stripped, case-insensitively, at any depth.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "access_token",
    "api_key",
    "apikey",
    "authorization",
    "client_secret",
    "cookie",
    "credential",
    "id_token",
    "passphrase",
    "password",
    "private_key",
    "refresh_token",
    "secret",
    "secret_ref",
    "session_token",
    "token",
];

/// Recursive key-denylist redactor.
///
/// # Examples
///
/// ```
/// use moat_core::redact::Redactor;
/// use serde_json::json;
///
/// let redactor = Redactor::default();
/// let out = redactor.redact(&json!({"text": "hi", "api_key": "sk-123"}));
/// assert_eq!(out, json!({"text": "hi", "api_key": "[REDACTED]"}));
/// ```
#[derive(Debug, Clone)]
pub struct Redactor {
    denylist: BTreeSet<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            denylist: DEFAULT_DENYLIST.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl Redactor {
    /// Create a redactor with extra denylisted keys on top of the defaults.
    #[must_use]
    pub fn with_extra_keys<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut r = Self::default();
        for k in extra {
            r.denylist.insert(k.into().to_ascii_lowercase());
        }
        r
    }

    /// Whether `key` is denylisted (comparison is case-insensitive).
    #[must_use]
    pub fn is_denied(&self, key: &str) -> bool {
        self.denylist.contains(&key.to_ascii_lowercase())
    }

    /// Return a copy of `value` with every denylisted key's value replaced
    /// by [`REDACTED`], at any nesting depth (objects and arrays).
    #[must_use]
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    if self.is_denied(k) {
                        out.insert(k.clone(), Value::String(REDACTED.to_string()));
                    } else {
                        out.insert(k.clone(), self.redact(v));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }

    /// Redact free-form text by replacing it wholesale when it contains a
    /// denylisted key name followed by a separator. Used for provider error
    /// details, which are opaque strings rather than structured JSON.
    #[must_use]
    pub fn redact_text(&self, text: &str) -> String {
        let lower = text.to_ascii_lowercase();
        let leaky = self
            .denylist
            .iter()
            .any(|k| lower.contains(&format!("{k}=")) || lower.contains(&format!("{k}:")));
        if leaky {
            REDACTED.to_string()
        } else {
            text.to_string()
        }
    }

    /// Hash the canonical JSON of the *redacted* form of `value`.
    ///
    /// This is the one entry point for computing `input_hash` and
    /// `output_hash`; raw values never reach the hasher.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ContractError::Json`] if the value cannot be
    /// serialized.
    pub fn hash_redacted(&self, value: &Value) -> Result<String, crate::ContractError> {
        let redacted = self.redact(value);
        let canonical = crate::canonical_json(&redacted)?;
        Ok(crate::sha256_hex(canonical.as_bytes()))
    }
}
