// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rolling-window aggregation of outcome events.

use chrono::{DateTime, Duration, Utc};
use moat_core::{CapabilityId, CapabilityStats, CapabilityVersion, OutcomeEvent, SyntheticStatus};
use moat_error::ErrorCode;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

type Key = (CapabilityId, CapabilityVersion);

/// Scoring weight for an outcome, by taxonomy.
///
/// `None` means the event is excluded from scoring entirely (core faults
/// and policy denials say nothing about the provider's reliability).
#[must_use]
pub fn weight_of(error_taxonomy: Option<ErrorCode>) -> Option<f64> {
    match error_taxonomy {
        None => Some(1.0),
        Some(ErrorCode::ProviderRateLimited) => Some(0.5),
        Some(ErrorCode::ProviderInvalidInput) => Some(0.7),
        Some(ErrorCode::ProviderNotFound) => Some(0.2),
        Some(
            ErrorCode::ProviderServerError
            | ErrorCode::Timeout
            | ErrorCode::NetworkError
            | ErrorCode::ProviderAuthFailure,
        ) => Some(0.0),
        Some(ErrorCode::GatewayError | ErrorCode::PolicyDenied) => None,
        // Anything else reaching the scorer is a pipeline bug; score it
        // like a hard failure rather than dropping it silently.
        Some(other) => {
            warn!(code = %other, "unexpected taxonomy code in outcome stream");
            Some(0.0)
        }
    }
}

/// Compute a percentile value from a **sorted** slice.
#[must_use]
pub fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Pure snapshot computation over one capability's window.
///
/// Deterministic and idempotent: the same event set and `now` always
/// produce the same snapshot.
#[must_use]
pub fn compute_stats(
    capability_id: &CapabilityId,
    capability_version: CapabilityVersion,
    events: &[OutcomeEvent],
    min_volume: u64,
    now: DateTime<Utc>,
) -> CapabilityStats {
    let mut weight_sum = 0.0;
    let mut latencies: Vec<u64> = Vec::new();
    let mut last_synthetic: Option<(DateTime<Utc>, SyntheticStatus)> = None;

    for event in events {
        if event.is_synthetic {
            let status = if event.success {
                SyntheticStatus::Success
            } else {
                SyntheticStatus::Failure
            };
            match last_synthetic {
                Some((at, _)) if at >= event.timestamp => {}
                _ => last_synthetic = Some((event.timestamp, status)),
            }
        }
        let Some(weight) = weight_of(event.error_taxonomy) else {
            continue;
        };
        weight_sum += weight;
        latencies.push(event.latency_ms);
    }

    latencies.sort_unstable();
    let count = latencies.len() as u64;
    let rate = if count >= min_volume && count > 0 {
        Some(weight_sum / count as f64)
    } else {
        None
    };

    CapabilityStats {
        capability_id: capability_id.clone(),
        capability_version,
        weighted_success_rate_7d: rate,
        p50_latency_ms: percentile(&latencies, 50.0),
        p95_latency_ms: percentile(&latencies, 95.0),
        total_calls_7d: count,
        last_synthetic_check_at: last_synthetic.map(|(at, _)| at),
        last_synthetic_status: last_synthetic.map(|(_, status)| status),
        computed_at: now,
    }
}

/// The trust scorer: per-capability event windows plus the latest stats
/// snapshots it owns exclusively.
pub struct TrustScorer {
    window: Duration,
    min_volume: u64,
    events: Mutex<HashMap<Key, Vec<OutcomeEvent>>>,
    stats: RwLock<HashMap<Key, CapabilityStats>>,
}

impl TrustScorer {
    /// Create a scorer with the given rolling window and minimum volume.
    #[must_use]
    pub fn new(window_days: u64, min_volume: u64) -> Self {
        Self {
            window: Duration::days(window_days as i64),
            min_volume,
            events: Mutex::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Accept one outcome event into its capability's window.
    pub async fn ingest(&self, event: OutcomeEvent) {
        let key = (event.capability_id.clone(), event.capability_version);
        let mut events = self.events.lock().await;
        events.entry(key).or_default().push(event);
    }

    /// Recompute every capability's snapshot at `now`, pruning events that
    /// fell out of the window. Partial failure of one capability must not
    /// block the others, so each is computed independently.
    pub async fn recompute_all(&self, now: DateTime<Utc>) -> Vec<CapabilityStats> {
        let horizon = now - self.window;
        let mut snapshots = Vec::new();

        let mut events = self.events.lock().await;
        for ((id, version), window) in events.iter_mut() {
            window.retain(|e| e.timestamp > horizon);
            let snapshot = compute_stats(id, *version, window, self.min_volume, now);
            debug!(
                capability = %id,
                version = %version,
                calls = snapshot.total_calls_7d,
                rate = ?snapshot.weighted_success_rate_7d,
                "recomputed capability stats"
            );
            snapshots.push(snapshot);
        }
        drop(events);

        let mut stats = self.stats.write().await;
        for snapshot in &snapshots {
            stats.insert(
                (snapshot.capability_id.clone(), snapshot.capability_version),
                snapshot.clone(),
            );
        }
        snapshots
    }

    /// Read-through for the trust-plane stats consumer.
    pub async fn fetch_stats(
        &self,
        capability_id: &CapabilityId,
        capability_version: &CapabilityVersion,
    ) -> Option<CapabilityStats> {
        self.stats
            .read()
            .await
            .get(&(capability_id.clone(), *capability_version))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id() -> CapabilityId {
        "cap.op".parse().unwrap()
    }

    fn version() -> CapabilityVersion {
        CapabilityVersion::new(1, 0, 0)
    }

    fn event(
        success: bool,
        error: Option<ErrorCode>,
        latency_ms: u64,
        at: DateTime<Utc>,
    ) -> OutcomeEvent {
        OutcomeEvent {
            receipt_id: Uuid::now_v7(),
            capability_id: id(),
            capability_version: version(),
            success,
            latency_ms,
            error_taxonomy: error,
            timestamp: at,
            is_synthetic: false,
        }
    }

    #[test]
    fn weight_table_matches_contract() {
        assert_eq!(weight_of(None), Some(1.0));
        assert_eq!(weight_of(Some(ErrorCode::ProviderRateLimited)), Some(0.5));
        assert_eq!(weight_of(Some(ErrorCode::ProviderInvalidInput)), Some(0.7));
        assert_eq!(weight_of(Some(ErrorCode::ProviderNotFound)), Some(0.2));
        assert_eq!(weight_of(Some(ErrorCode::ProviderServerError)), Some(0.0));
        assert_eq!(weight_of(Some(ErrorCode::Timeout)), Some(0.0));
        assert_eq!(weight_of(Some(ErrorCode::NetworkError)), Some(0.0));
        assert_eq!(weight_of(Some(ErrorCode::ProviderAuthFailure)), Some(0.0));
        assert_eq!(weight_of(Some(ErrorCode::GatewayError)), None);
        assert_eq!(weight_of(Some(ErrorCode::PolicyDenied)), None);
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = [100, 200, 300, 400, 500];
        assert_eq!(percentile(&sorted, 50.0), 300.0);
        assert_eq!(percentile(&sorted, 0.0), 100.0);
        assert_eq!(percentile(&sorted, 100.0), 500.0);
        assert!(percentile(&sorted, 95.0) > percentile(&sorted, 50.0));
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[42], 95.0), 42.0);
    }

    #[test]
    fn rate_is_weighted_and_bounded() {
        let now = Utc::now();
        // 85 timeouts (weight 0) + 15 successes (weight 1) = 0.15.
        let mut events: Vec<OutcomeEvent> = (0..85)
            .map(|_| event(false, Some(ErrorCode::Timeout), 50, now))
            .collect();
        events.extend((0..15).map(|_| event(true, None, 50, now)));

        let stats = compute_stats(&id(), version(), &events, 10, now);
        let rate = stats.weighted_success_rate_7d.unwrap();
        assert!((rate - 0.15).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&rate));
        assert_eq!(stats.total_calls_7d, 100);
    }

    #[test]
    fn excluded_codes_do_not_affect_scores() {
        let now = Utc::now();
        let mut events: Vec<OutcomeEvent> =
            (0..20).map(|_| event(true, None, 100, now)).collect();
        let baseline = compute_stats(&id(), version(), &events, 10, now);

        events.extend((0..50).map(|_| event(false, Some(ErrorCode::GatewayError), 9_999, now)));
        events.extend((0..50).map(|_| event(false, Some(ErrorCode::PolicyDenied), 9_999, now)));
        let with_excluded = compute_stats(&id(), version(), &events, 10, now);

        assert_eq!(
            baseline.weighted_success_rate_7d,
            with_excluded.weighted_success_rate_7d
        );
        assert_eq!(baseline.p95_latency_ms, with_excluded.p95_latency_ms);
        assert_eq!(baseline.total_calls_7d, with_excluded.total_calls_7d);
    }

    #[test]
    fn below_min_volume_exposes_no_verdict() {
        let now = Utc::now();
        let events: Vec<OutcomeEvent> = (0..9).map(|_| event(true, None, 100, now)).collect();
        let stats = compute_stats(&id(), version(), &events, 10, now);
        assert_eq!(stats.weighted_success_rate_7d, None);
        assert_eq!(stats.total_calls_7d, 9);
    }

    #[test]
    fn p95_at_least_p50() {
        let now = Utc::now();
        let events: Vec<OutcomeEvent> = (0..50)
            .map(|i| event(true, None, 10 * (i + 1), now))
            .collect();
        let stats = compute_stats(&id(), version(), &events, 10, now);
        assert!(stats.p95_latency_ms >= stats.p50_latency_ms);
    }

    #[test]
    fn synthetic_probe_state_tracks_latest() {
        let now = Utc::now();
        let mut probe_ok = event(true, None, 100, now - Duration::hours(3));
        probe_ok.is_synthetic = true;
        let mut probe_fail = event(false, Some(ErrorCode::Timeout), 100, now - Duration::hours(1));
        probe_fail.is_synthetic = true;

        let stats = compute_stats(&id(), version(), &[probe_ok, probe_fail], 1, now);
        assert_eq!(stats.last_synthetic_status, Some(SyntheticStatus::Failure));
        assert_eq!(
            stats.last_synthetic_check_at,
            Some(now - Duration::hours(1))
        );
    }

    #[test]
    fn computation_is_deterministic() {
        let now = Utc::now();
        let events: Vec<OutcomeEvent> = (0..30)
            .map(|i| event(i % 3 != 0, (i % 3 == 0).then_some(ErrorCode::Timeout), 10 * i, now))
            .collect();
        let a = compute_stats(&id(), version(), &events, 10, now);
        let b = compute_stats(&id(), version(), &events, 10, now);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn recompute_prunes_old_events() {
        let scorer = TrustScorer::new(7, 1);
        let now = Utc::now();
        scorer.ingest(event(true, None, 100, now - Duration::days(8))).await;
        scorer.ingest(event(true, None, 100, now - Duration::hours(1))).await;

        let snapshots = scorer.recompute_all(now).await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].total_calls_7d, 1);
    }

    #[tokio::test]
    async fn fetch_stats_reads_the_latest_snapshot() {
        let scorer = TrustScorer::new(7, 1);
        let now = Utc::now();
        scorer.ingest(event(true, None, 100, now)).await;
        scorer.recompute_all(now).await;

        let stats = scorer.fetch_stats(&id(), &version()).await.unwrap();
        assert_eq!(stats.total_calls_7d, 1);
        assert!(scorer
            .fetch_stats(&"other.cap".parse().unwrap(), &version())
            .await
            .is_none());
    }
}
