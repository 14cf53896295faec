// SPDX-License-Identifier: MIT OR Apache-2.0
//! Validated identifier newtypes: capability ids and strict semver versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors from parsing a [`CapabilityId`] or [`CapabilityVersion`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The capability id does not match `provider.action` with
    /// `[a-z0-9_]` segments.
    #[error("invalid capability id: {0:?}")]
    InvalidCapabilityId(String),

    /// The version is not strict numeric `major.minor.patch`.
    #[error("invalid capability version: {0:?}")]
    InvalidVersion(String),
}

// ---------------------------------------------------------------------------
// CapabilityId
// ---------------------------------------------------------------------------

/// A capability identifier of the form `provider.action`.
///
/// Both segments are non-empty and restricted to `[a-z0-9_]`.
///
/// # Examples
///
/// ```
/// use moat_core::CapabilityId;
///
/// let id: CapabilityId = "slack.post_message".parse().unwrap();
/// assert_eq!(id.provider_segment(), "slack");
/// assert_eq!(id.action_segment(), "post_message");
/// assert!("Slack.PostMessage".parse::<CapabilityId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

fn is_id_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl CapabilityId {
    /// Parse and validate a capability id.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::InvalidCapabilityId`] when the input is not two
    /// `[a-z0-9_]+` segments joined by a single dot.
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        let mut parts = raw.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(provider), Some(action), None)
                if is_id_segment(provider) && is_id_segment(action) =>
            {
                Ok(Self(raw))
            }
            _ => Err(IdError::InvalidCapabilityId(raw)),
        }
    }

    /// The full `provider.action` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The segment before the dot.
    #[must_use]
    pub fn provider_segment(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// The segment after the dot.
    #[must_use]
    pub fn action_segment(&self) -> &str {
        self.0.split('.').nth(1).unwrap_or_default()
    }
}

impl FromStr for CapabilityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// CapabilityVersion
// ---------------------------------------------------------------------------

/// A strict semantic version: numeric `major.minor.patch`, no pre-release
/// or build metadata.
///
/// Ordering is the usual semver precedence, which is what "latest
/// published" resolution relies on.
///
/// # Examples
///
/// ```
/// use moat_core::CapabilityVersion;
///
/// let a: CapabilityVersion = "1.0.0".parse().unwrap();
/// let b: CapabilityVersion = "1.2.0".parse().unwrap();
/// assert!(a < b);
/// assert!("1.0".parse::<CapabilityVersion>().is_err());
/// assert!("1.0.0-rc1".parse::<CapabilityVersion>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityVersion {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl CapabilityVersion {
    /// Construct from components.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

fn parse_component(s: &str) -> Option<u64> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // Reject leading zeros ("01") per strict semver, but allow plain "0".
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl FromStr for CapabilityVersion {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, '.');
        let (a, b, c, rest) = (parts.next(), parts.next(), parts.next(), parts.next());
        match (a, b, c, rest) {
            (Some(a), Some(b), Some(c), None) => {
                match (parse_component(a), parse_component(b), parse_component(c)) {
                    (Some(major), Some(minor), Some(patch)) => Ok(Self {
                        major,
                        minor,
                        patch,
                    }),
                    _ => Err(IdError::InvalidVersion(s.to_string())),
                }
            }
            _ => Err(IdError::InvalidVersion(s.to_string())),
        }
    }
}

impl TryFrom<String> for CapabilityVersion {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CapabilityVersion> for String {
    fn from(v: CapabilityVersion) -> Self {
        v.to_string()
    }
}

impl fmt::Display for CapabilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_capability_ids() {
        for raw in ["slack.post_message", "github.create_issue", "x2.y_3"] {
            assert!(CapabilityId::parse(raw).is_ok(), "{raw} should parse");
        }
    }

    #[test]
    fn invalid_capability_ids() {
        for raw in [
            "",
            "slack",
            "slack.",
            ".post",
            "Slack.post",
            "slack.post-message",
            "slack.post.message",
            "slack .post",
        ] {
            assert!(CapabilityId::parse(raw).is_err(), "{raw:?} should fail");
        }
    }

    #[test]
    fn id_segments() {
        let id = CapabilityId::parse("stripe.create_charge").unwrap();
        assert_eq!(id.provider_segment(), "stripe");
        assert_eq!(id.action_segment(), "create_charge");
    }

    #[test]
    fn id_serializes_as_plain_string() {
        let id = CapabilityId::parse("slack.post_message").unwrap();
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            r#""slack.post_message""#
        );
    }

    #[test]
    fn version_ordering() {
        let v100: CapabilityVersion = "1.0.0".parse().unwrap();
        let v101: CapabilityVersion = "1.0.1".parse().unwrap();
        let v2: CapabilityVersion = "2.0.0".parse().unwrap();
        let v0_10: CapabilityVersion = "0.10.0".parse().unwrap();
        let v0_9: CapabilityVersion = "0.9.9".parse().unwrap();
        assert!(v100 < v101);
        assert!(v101 < v2);
        assert!(v0_9 < v0_10);
    }

    #[test]
    fn version_rejects_non_strict_forms() {
        for raw in ["1.0", "1", "1.0.0.0", "1.0.0-rc1", "v1.0.0", "1.00.0", "a.b.c", ""] {
            assert!(raw.parse::<CapabilityVersion>().is_err(), "{raw:?}");
        }
    }

    #[test]
    fn version_serde_roundtrip_as_string() {
        let v: CapabilityVersion = "1.2.3".parse().unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#""1.2.3""#);
        let back: CapabilityVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
