// SPDX-License-Identifier: MIT OR Apache-2.0
//! Threshold rules that turn stats snapshots into routing statuses.

use chrono::{DateTime, Duration, Utc};
use moat_config::MoatConfig;
use moat_core::{CapabilityId, CapabilityStats, CapabilityVersion, RoutingStatus, SyntheticStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

/// A synthetic failure older than this hides the capability (rule 2).
fn synthetic_failure_grace() -> Duration {
    Duration::hours(2)
}

/// Which advisor rule produced a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvisorRule {
    /// Weighted success rate below the floor, sustained.
    HideLowSuccessRate,
    /// Latest synthetic probe failed and is stale.
    HideSyntheticFailure,
    /// p95 latency above the ceiling.
    ThrottleHighLatency,
    /// Verified and healthy enough to prefer.
    PreferredVerifiedHealthy,
    /// Sustained recovery from hidden.
    Recovered,
    /// No rule matched.
    Default,
}

/// Audit record of one routing-status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTransition {
    /// Capability that transitioned.
    pub capability_id: CapabilityId,
    /// Capability version that transitioned.
    pub capability_version: CapabilityVersion,
    /// Status before.
    pub from: RoutingStatus,
    /// Status after.
    pub to: RoutingStatus,
    /// The rule that fired.
    pub rule: AdvisorRule,
    /// When the advisor decided.
    pub at: DateTime<Utc>,
}

/// Advisor thresholds, lifted from [`MoatConfig`].
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    /// Weighted-success floor for hiding.
    pub hide_success_threshold: f64,
    /// How long the rate must stay below the floor (and above it, for
    /// recovery) before the advisor acts.
    pub sustain: Duration,
    /// p95 ceiling for throttling, in ms.
    pub throttle_p95_ms: f64,
    /// Weighted-success floor for preferred status.
    pub preferred_success_threshold: f64,
    /// p95 ceiling for preferred status, in ms.
    pub preferred_p95_ms: f64,
}

impl From<&MoatConfig> for AdvisorConfig {
    fn from(config: &MoatConfig) -> Self {
        Self {
            hide_success_threshold: config.hide_success_threshold,
            sustain: Duration::seconds(config.hide_sustained_s as i64),
            throttle_p95_ms: config.throttle_p95_ms as f64,
            preferred_success_threshold: config.preferred_success_threshold,
            preferred_p95_ms: config.preferred_p95_ms as f64,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct SustainState {
    below_since: Option<DateTime<Utc>>,
    healthy_since: Option<DateTime<Utc>>,
}

/// Applies the ordered threshold rules after each scorer batch and tracks
/// the sustain windows that rules 1 and recovery require.
pub struct RoutingAdvisor {
    config: AdvisorConfig,
    state: Mutex<HashMap<(CapabilityId, CapabilityVersion), SustainState>>,
}

impl RoutingAdvisor {
    /// Create an advisor with the given thresholds.
    #[must_use]
    pub fn new(config: AdvisorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Decide the routing status for one capability.
    ///
    /// `current` is the capability's present routing status and `verified`
    /// its manifest flag. Returns the new status and, when it differs from
    /// `current`, the audit transition.
    pub async fn advise(
        &self,
        stats: &CapabilityStats,
        verified: bool,
        current: RoutingStatus,
        now: DateTime<Utc>,
    ) -> (RoutingStatus, Option<RoutingTransition>) {
        let key = (stats.capability_id.clone(), stats.capability_version);
        let mut states = self.state.lock().await;
        let state = states.entry(key).or_default();

        let (next, rule) = Self::decide(&self.config, stats, verified, current, state, now);

        let transition = (next != current).then(|| {
            info!(
                capability = %stats.capability_id,
                version = %stats.capability_version,
                from = ?current,
                to = ?next,
                rule = ?rule,
                "routing transition"
            );
            RoutingTransition {
                capability_id: stats.capability_id.clone(),
                capability_version: stats.capability_version,
                from: current,
                to: next,
                rule,
                at: now,
            }
        });
        (next, transition)
    }

    fn decide(
        config: &AdvisorConfig,
        stats: &CapabilityStats,
        verified: bool,
        current: RoutingStatus,
        state: &mut SustainState,
        now: DateTime<Utc>,
    ) -> (RoutingStatus, AdvisorRule) {
        // Below minimum volume there is no verdict: treat as active and
        // reset the sustain windows.
        let Some(rate) = stats.weighted_success_rate_7d else {
            state.below_since = None;
            state.healthy_since = None;
            return match current {
                RoutingStatus::Hidden => (RoutingStatus::Hidden, AdvisorRule::Default),
                _ => (RoutingStatus::Active, AdvisorRule::Default),
            };
        };

        // Maintain the sustain windows on every batch.
        if rate < config.hide_success_threshold {
            state.below_since.get_or_insert(now);
            state.healthy_since = None;
        } else {
            state.healthy_since.get_or_insert(now);
            state.below_since = None;
        }

        // A hidden capability only ever recovers; the positive rules do not
        // apply until it is active again.
        if current == RoutingStatus::Hidden {
            let healthy_long_enough = state
                .healthy_since
                .is_some_and(|since| now - since >= config.sustain);
            let synthetic_ok = stats.last_synthetic_status == Some(SyntheticStatus::Success);
            if healthy_long_enough && synthetic_ok {
                return (RoutingStatus::Active, AdvisorRule::Recovered);
            }
            return (RoutingStatus::Hidden, AdvisorRule::Default);
        }

        // 1. HIDE_LOW_SUCCESS_RATE
        if state
            .below_since
            .is_some_and(|since| now - since >= config.sustain)
        {
            return (RoutingStatus::Hidden, AdvisorRule::HideLowSuccessRate);
        }

        // 2. HIDE_SYNTHETIC_FAILURE
        if stats.last_synthetic_status == Some(SyntheticStatus::Failure)
            && stats
                .last_synthetic_check_at
                .is_some_and(|at| at < now - synthetic_failure_grace())
        {
            return (RoutingStatus::Hidden, AdvisorRule::HideSyntheticFailure);
        }

        // 3. THROTTLE_HIGH_LATENCY
        if stats.p95_latency_ms > config.throttle_p95_ms {
            return (RoutingStatus::Throttled, AdvisorRule::ThrottleHighLatency);
        }

        // 4. PREFERRED_VERIFIED_HEALTHY
        if verified
            && rate >= config.preferred_success_threshold
            && stats.p95_latency_ms <= config.preferred_p95_ms
        {
            return (
                RoutingStatus::Preferred,
                AdvisorRule::PreferredVerifiedHealthy,
            );
        }

        (RoutingStatus::Active, AdvisorRule::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdvisorConfig {
        AdvisorConfig::from(&MoatConfig::default())
    }

    fn stats(
        rate: Option<f64>,
        p50: f64,
        p95: f64,
        count: u64,
        synthetic: Option<(DateTime<Utc>, SyntheticStatus)>,
        now: DateTime<Utc>,
    ) -> CapabilityStats {
        CapabilityStats {
            capability_id: "cap.op".parse().unwrap(),
            capability_version: CapabilityVersion::new(1, 0, 0),
            weighted_success_rate_7d: rate,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            total_calls_7d: count,
            last_synthetic_check_at: synthetic.map(|(at, _)| at),
            last_synthetic_status: synthetic.map(|(_, s)| s),
            computed_at: now,
        }
    }

    #[tokio::test]
    async fn low_volume_is_active_regardless_of_metrics() {
        let advisor = RoutingAdvisor::new(config());
        let now = Utc::now();
        // Unscored: even terrible latency cannot throttle.
        let s = stats(None, 50_000.0, 90_000.0, 5, None, now);
        let (status, transition) = advisor.advise(&s, true, RoutingStatus::Active, now).await;
        assert_eq!(status, RoutingStatus::Active);
        assert!(transition.is_none());
    }

    #[tokio::test]
    async fn low_rate_hides_only_after_sustain() {
        let advisor = RoutingAdvisor::new(config());
        let now = Utc::now();
        let s = stats(Some(0.15), 100.0, 200.0, 100, None, now);

        // First observation starts the sustain window.
        let (status, _) = advisor.advise(&s, false, RoutingStatus::Active, now).await;
        assert_eq!(status, RoutingStatus::Active);

        // Still below 24 h later minus a minute: no transition.
        let later = now + Duration::hours(23);
        let s2 = stats(Some(0.15), 100.0, 200.0, 100, None, later);
        let (status, _) = advisor.advise(&s2, false, RoutingStatus::Active, later).await;
        assert_eq!(status, RoutingStatus::Active);

        // Past the sustain window: hidden.
        let past = now + Duration::hours(25);
        let s3 = stats(Some(0.15), 100.0, 200.0, 100, None, past);
        let (status, transition) = advisor.advise(&s3, false, RoutingStatus::Active, past).await;
        assert_eq!(status, RoutingStatus::Hidden);
        let t = transition.unwrap();
        assert_eq!(t.rule, AdvisorRule::HideLowSuccessRate);
        assert_eq!(t.from, RoutingStatus::Active);
        assert_eq!(t.to, RoutingStatus::Hidden);
    }

    #[tokio::test]
    async fn rate_recovery_resets_the_sustain_window() {
        let advisor = RoutingAdvisor::new(config());
        let now = Utc::now();
        let bad = stats(Some(0.15), 100.0, 200.0, 100, None, now);
        advisor.advise(&bad, false, RoutingStatus::Active, now).await;

        // Rate recovers mid-window.
        let mid = now + Duration::hours(12);
        let good = stats(Some(0.95), 100.0, 200.0, 100, None, mid);
        advisor.advise(&good, false, RoutingStatus::Active, mid).await;

        // Dips again: the 24 h clock restarts, so no hide at hour 25.
        let later = now + Duration::hours(25);
        let bad2 = stats(Some(0.15), 100.0, 200.0, 100, None, later);
        let (status, _) = advisor.advise(&bad2, false, RoutingStatus::Active, later).await;
        assert_eq!(status, RoutingStatus::Active);
    }

    #[tokio::test]
    async fn stale_synthetic_failure_hides() {
        let advisor = RoutingAdvisor::new(config());
        let now = Utc::now();
        let s = stats(
            Some(0.95),
            100.0,
            200.0,
            100,
            Some((now - Duration::hours(3), SyntheticStatus::Failure)),
            now,
        );
        let (status, transition) = advisor.advise(&s, false, RoutingStatus::Active, now).await;
        assert_eq!(status, RoutingStatus::Hidden);
        assert_eq!(transition.unwrap().rule, AdvisorRule::HideSyntheticFailure);
    }

    #[tokio::test]
    async fn fresh_synthetic_failure_does_not_hide() {
        let advisor = RoutingAdvisor::new(config());
        let now = Utc::now();
        let s = stats(
            Some(0.95),
            100.0,
            200.0,
            100,
            Some((now - Duration::minutes(30), SyntheticStatus::Failure)),
            now,
        );
        let (status, _) = advisor.advise(&s, false, RoutingStatus::Active, now).await;
        assert_eq!(status, RoutingStatus::Active);
    }

    #[tokio::test]
    async fn high_p95_throttles() {
        let advisor = RoutingAdvisor::new(config());
        let now = Utc::now();
        let s = stats(Some(0.95), 2_000.0, 15_000.0, 100, None, now);
        let (status, transition) = advisor.advise(&s, false, RoutingStatus::Active, now).await;
        assert_eq!(status, RoutingStatus::Throttled);
        assert_eq!(transition.unwrap().rule, AdvisorRule::ThrottleHighLatency);
    }

    #[tokio::test]
    async fn verified_healthy_becomes_preferred() {
        let advisor = RoutingAdvisor::new(config());
        let now = Utc::now();
        let s = stats(Some(0.995), 300.0, 1_500.0, 100, None, now);
        let (status, _) = advisor.advise(&s, true, RoutingStatus::Active, now).await;
        assert_eq!(status, RoutingStatus::Preferred);

        // Same numbers, unverified: stays active.
        let advisor = RoutingAdvisor::new(config());
        let (status, _) = advisor.advise(&s, false, RoutingStatus::Active, now).await;
        assert_eq!(status, RoutingStatus::Active);
    }

    #[tokio::test]
    async fn hide_beats_throttle_and_preferred() {
        // Rule order: a sustained low rate hides even with awful p95 that
        // would otherwise throttle.
        let advisor = RoutingAdvisor::new(config());
        let start = Utc::now();
        let s = stats(Some(0.10), 100.0, 50_000.0, 100, None, start);
        advisor.advise(&s, true, RoutingStatus::Active, start).await;

        let later = start + Duration::hours(25);
        let s2 = stats(Some(0.10), 100.0, 50_000.0, 100, None, later);
        let (status, transition) = advisor.advise(&s2, true, RoutingStatus::Active, later).await;
        assert_eq!(status, RoutingStatus::Hidden);
        assert_eq!(transition.unwrap().rule, AdvisorRule::HideLowSuccessRate);
    }

    #[tokio::test]
    async fn hidden_recovers_only_with_sustained_health_and_synthetic_success() {
        let advisor = RoutingAdvisor::new(config());
        let start = Utc::now();

        // Healthy numbers but no sustain yet: stays hidden.
        let s = stats(
            Some(0.95),
            100.0,
            200.0,
            100,
            Some((start, SyntheticStatus::Success)),
            start,
        );
        let (status, _) = advisor.advise(&s, false, RoutingStatus::Hidden, start).await;
        assert_eq!(status, RoutingStatus::Hidden);

        // Sustained health but failing synthetic: stays hidden.
        let later = start + Duration::hours(25);
        let s_fail = stats(
            Some(0.95),
            100.0,
            200.0,
            100,
            Some((later, SyntheticStatus::Failure)),
            later,
        );
        let (status, _) = advisor.advise(&s_fail, false, RoutingStatus::Hidden, later).await;
        assert_eq!(status, RoutingStatus::Hidden);

        // Sustained health and synthetic success: recovered.
        let s_ok = stats(
            Some(0.95),
            100.0,
            200.0,
            100,
            Some((later, SyntheticStatus::Success)),
            later,
        );
        let (status, transition) = advisor.advise(&s_ok, false, RoutingStatus::Hidden, later).await;
        assert_eq!(status, RoutingStatus::Active);
        assert_eq!(transition.unwrap().rule, AdvisorRule::Recovered);
    }
}
