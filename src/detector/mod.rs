//! Outage detector.
//!
//! Turns a stream of per-target ping outcomes into outage start/end
//! transitions. Each target keeps a sliding window of samples; an episode
//! opens the first time the window looks degraded and closes only after a
//! full window duration of continuously clean evaluations.
//!
//! The detector does no I/O and never blocks. Callers serialise access to it
//! (see `scheduler::SharedDetector`).

mod stats;

pub use stats::*;

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Events produced by [`Detector::process_ping`].
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    OutageStart(Transition),
    OutageEnd(Transition),
    OutageSummary(OutageSummary),
}

impl DetectorEvent {
    pub fn target(&self) -> &str {
        match self {
            Self::OutageStart(t) | Self::OutageEnd(t) => &t.target,
            Self::OutageSummary(s) => &s.target,
        }
    }

    pub fn outage_id(&self) -> &str {
        match self {
            Self::OutageStart(t) | Self::OutageEnd(t) => &t.outage_id,
            Self::OutageSummary(s) => &s.outage_id,
        }
    }
}

/// Snapshot taken when an episode opens or closes.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub target: String,
    pub outage_id: String,
    pub reason: String,
    pub loss_pct: f64,
    pub rtt_p95_ms: f64,
    pub consecutive_failures: u32,
}

/// Final figures for a closed episode.
#[derive(Debug, Clone, PartialEq)]
pub struct OutageSummary {
    pub target: String,
    pub outage_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: i64,
    pub loss_pct_max: f64,
    pub rtt_p95_max_ms: f64,
    pub rtt_avg_max_ms: f64,
    pub consecutive_failures_max: u32,
    pub ping_sent: u64,
    pub ping_recv: u64,
    pub dns_errors: u64,
    pub traceroute_count: u64,
}

/// Worst values observed since an episode opened.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMaxima {
    pub loss_pct: f64,
    pub rtt_p95_ms: f64,
    pub rtt_avg_ms: f64,
    pub consecutive_failures: u32,
}

impl RunningMaxima {
    fn observe(&mut self, stats: &WindowStats, consecutive_failures: u32) {
        self.loss_pct = self.loss_pct.max(stats.loss_pct);
        self.rtt_p95_ms = self.rtt_p95_ms.max(stats.rtt_p95_ms);
        self.rtt_avg_ms = self.rtt_avg_ms.max(stats.rtt_avg_ms);
        self.consecutive_failures = self.consecutive_failures.max(consecutive_failures);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeCounters {
    pub ping_sent: u64,
    pub ping_recv: u64,
    pub dns_errors: u64,
    pub traceroute_count: u64,
}

impl EpisodeCounters {
    fn count_ping(&mut self, success: bool) {
        self.ping_sent += 1;
        if success {
            self.ping_recv += 1;
        }
    }
}

/// An open outage for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub id: String,
    pub start_time: DateTime<Utc>,
    /// Start of the current run of clean evaluations.
    pub clear_since: Option<DateTime<Utc>>,
    pub maxima: RunningMaxima,
    pub counters: EpisodeCounters,
}

#[derive(Debug, Default)]
struct TargetState {
    window: VecDeque<PingSample>,
    latest: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    outage: Option<Episode>,
}

/// Per-target sliding-window outage detector.
#[derive(Debug)]
pub struct Detector {
    window: Duration,
    states: HashMap<String, TargetState>,
    id_counter: u64,
}

impl Detector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            states: HashMap::new(),
            id_counter: 0,
        }
    }

    /// Feed one ping outcome for `target`.
    ///
    /// Returns at most one outage start, or an outage end immediately
    /// followed by its summary.
    pub fn process_ping(
        &mut self,
        target: &str,
        time: DateTime<Utc>,
        success: bool,
        rtt_ms: f64,
    ) -> Vec<DetectorEvent> {
        let window = self.window;
        let state = self.states.entry(target.to_string()).or_default();

        let latest = state.latest.map_or(time, |l| l.max(time));
        state.latest = Some(latest);
        insert(&mut state.window, PingSample { time, success, rtt_ms });
        prune(&mut state.window, latest, window);

        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
        }

        let stats = WindowStats::compute(&state.window);
        let reason = evaluate(&stats, state.consecutive_failures);

        let Some(episode) = state.outage.as_mut() else {
            let Some(reason) = reason else {
                return Vec::new();
            };

            self.id_counter += 1;
            let id = episode_id(target, time, self.id_counter);

            let mut maxima = RunningMaxima::default();
            maxima.observe(&stats, state.consecutive_failures);
            let mut counters = EpisodeCounters::default();
            counters.count_ping(success);

            state.outage = Some(Episode {
                id: id.clone(),
                start_time: time,
                clear_since: None,
                maxima,
                counters,
            });

            return vec![DetectorEvent::OutageStart(Transition {
                target: target.to_string(),
                outage_id: id,
                reason,
                loss_pct: stats.loss_pct,
                rtt_p95_ms: stats.rtt_p95_ms,
                consecutive_failures: state.consecutive_failures,
            })];
        };

        episode.counters.count_ping(success);
        episode.maxima.observe(&stats, state.consecutive_failures);

        if reason.is_some() {
            episode.clear_since = None;
            return Vec::new();
        }

        let clear_since = *episode.clear_since.get_or_insert(time);
        if time - clear_since < window {
            return Vec::new();
        }

        let Some(episode) = state.outage.take() else {
            return Vec::new();
        };

        let end = DetectorEvent::OutageEnd(Transition {
            target: target.to_string(),
            outage_id: episode.id.clone(),
            reason: "cleared".to_string(),
            loss_pct: stats.loss_pct,
            rtt_p95_ms: stats.rtt_p95_ms,
            consecutive_failures: state.consecutive_failures,
        });
        let summary = DetectorEvent::OutageSummary(OutageSummary {
            target: target.to_string(),
            outage_id: episode.id,
            start: episode.start_time,
            end: time,
            duration_ms: (time - episode.start_time).num_milliseconds(),
            loss_pct_max: episode.maxima.loss_pct,
            rtt_p95_max_ms: episode.maxima.rtt_p95_ms,
            rtt_avg_max_ms: episode.maxima.rtt_avg_ms,
            consecutive_failures_max: episode.maxima.consecutive_failures,
            ping_sent: episode.counters.ping_sent,
            ping_recv: episode.counters.ping_recv,
            dns_errors: episode.counters.dns_errors,
            traceroute_count: episode.counters.traceroute_count,
        });

        vec![end, summary]
    }

    /// Feed one DNS outcome.
    ///
    /// DNS health is host-wide: a failure counts against every open episode,
    /// whichever target it belongs to.
    pub fn process_dns(&mut self, _time: DateTime<Utc>, success: bool) {
        if success {
            return;
        }

        for episode in self.states.values_mut().filter_map(|s| s.outage.as_mut()) {
            episode.counters.dns_errors += 1;
        }
    }

    /// Count a traceroute against `episode_id` if it is still the open
    /// episode for `target`. Late results for closed episodes are ignored.
    pub fn record_traceroute(&mut self, target: &str, episode_id: &str) {
        if let Some(episode) = self
            .states
            .get_mut(target)
            .and_then(|s| s.outage.as_mut())
            .filter(|e| e.id == episode_id)
        {
            episode.counters.traceroute_count += 1;
        }
    }

    pub fn active_episode_id(&self, target: &str) -> Option<&str> {
        self.episode(target).map(|e| e.id.as_str())
    }

    pub fn episode(&self, target: &str) -> Option<&Episode> {
        self.states.get(target).and_then(|s| s.outage.as_ref())
    }
}

/// `<target>-<unix nanos>-<counter>`; the counter keeps ids unique for
/// identical timestamps.
fn episode_id(target: &str, time: DateTime<Utc>, counter: u64) -> String {
    let nanos = time
        .timestamp_nanos_opt()
        .unwrap_or_else(|| time.timestamp_micros().saturating_mul(1000));
    format!("{}-{}-{:06}", target, nanos, counter)
}
