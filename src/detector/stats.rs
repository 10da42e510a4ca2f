//! Sliding-window statistics and degradation thresholds.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Loss percentage at or above which a target is degraded.
pub const LOSS_THRESHOLD_PCT: f64 = 5.0;
/// p95 round-trip time at or above which a target is degraded.
pub const RTT_P95_THRESHOLD_MS: f64 = 200.0;
/// Unbroken run of failed pings at which a target is degraded.
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

/// A single ping outcome inside a target's window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSample {
    pub time: DateTime<Utc>,
    pub success: bool,
    pub rtt_ms: f64,
}

/// Statistics derived from the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub loss_pct: f64,
    pub rtt_p95_ms: f64,
    pub rtt_avg_ms: f64,
}

impl WindowStats {
    /// Compute loss, nearest-rank p95 and mean RTT over the window.
    ///
    /// RTT figures only consider successful samples and are zero when there
    /// are none.
    pub fn compute<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a PingSample>,
    {
        let mut sent = 0usize;
        let mut rtts = Vec::new();

        for s in samples {
            sent += 1;
            if s.success {
                rtts.push(s.rtt_ms);
            }
        }

        if sent == 0 {
            return Self::default();
        }

        let loss_pct = (1.0 - rtts.len() as f64 / sent as f64) * 100.0;
        if rtts.is_empty() {
            return Self {
                loss_pct,
                ..Self::default()
            };
        }

        rtts.sort_by(f64::total_cmp);
        let rank = ((rtts.len() - 1) as f64 * 0.95).floor() as usize;
        let rtt_avg_ms = rtts.iter().sum::<f64>() / rtts.len() as f64;

        Self {
            loss_pct,
            rtt_p95_ms: rtts[rank],
            rtt_avg_ms,
        }
    }
}

/// Judge degradation, returning the comma-joined reason when degraded.
///
/// Criteria are reported in a fixed order: loss, latency, consecutive failures.
pub fn evaluate(stats: &WindowStats, consecutive_failures: u32) -> Option<String> {
    let mut reasons = Vec::with_capacity(3);
    if stats.loss_pct >= LOSS_THRESHOLD_PCT {
        reasons.push("loss_pct");
    }
    if stats.rtt_p95_ms >= RTT_P95_THRESHOLD_MS {
        reasons.push("rtt_p95_ms");
    }
    if consecutive_failures >= CONSECUTIVE_FAILURE_THRESHOLD {
        reasons.push("consecutive_failures");
    }

    if reasons.is_empty() {
        None
    } else {
        Some(reasons.join(","))
    }
}

/// Insert a sample keeping the window in chronological order.
///
/// Equal timestamps keep arrival order.
pub fn insert(window: &mut VecDeque<PingSample>, sample: PingSample) {
    let pos = window.partition_point(|s| s.time <= sample.time);
    window.insert(pos, sample);
}

/// Drop samples older than `span` before `latest`, popping from the front.
///
/// The cutoff itself is kept. A span reaching past the representable
/// range prunes nothing.
pub fn prune(window: &mut VecDeque<PingSample>, latest: DateTime<Utc>, span: Duration) {
    let Some(cutoff) = latest.checked_sub_signed(span) else {
        return;
    };
    while window.front().is_some_and(|s| s.time < cutoff) {
        window.pop_front();
    }
}
