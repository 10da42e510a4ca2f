//! Traceroute correlation: per-target cooldown, path fingerprints and
//! path-change detection across consecutive traces.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use super::{MonitorError, SharedDetector};
use crate::probe::{run_traceroute, Hop, TraceOutcome};
use crate::sink::{PathChange, Record, RecordBody, RecordWriter, TracerouteResult};

/// Capacity of the trace request queue.
pub const TRACE_QUEUE_CAPACITY: usize = 64;

/// Something that can trace the path to a host.
#[async_trait]
pub trait Tracer: Send + Sync + 'static {
    async fn trace(&self, host: &str) -> TraceOutcome;
}

/// Runs the system `traceroute` utility.
#[derive(Debug, Clone)]
pub struct SystemTracer {
    pub max_hops: u32,
    pub hop_timeout: Duration,
}

#[async_trait]
impl Tracer for SystemTracer {
    async fn trace(&self, host: &str) -> TraceOutcome {
        run_traceroute(host, self.max_hops, self.hop_timeout).await
    }
}

/// A request to trace `host` on behalf of an outage episode.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRequest {
    pub target: String,
    pub host: String,
    pub episode_id: String,
}

/// Last known path for a target.
#[derive(Debug, Clone, Default)]
pub struct PathRecord {
    pub last_trace_time: Option<DateTime<Utc>>,
    pub last_path_hash: Option<String>,
    pub last_hops: Vec<Hop>,
}

/// Owns all per-target path state. Driven by a single serial worker.
#[derive(Debug)]
pub struct Correlator {
    cooldown: ChronoDuration,
    paths: HashMap<String, PathRecord>,
}

impl Correlator {
    pub fn new(cooldown: ChronoDuration) -> Self {
        Self {
            cooldown,
            paths: HashMap::new(),
        }
    }

    pub fn path(&self, target: &str) -> Option<&PathRecord> {
        self.paths.get(target)
    }

    /// Decide whether a trace may run now, and if so mark it as started.
    pub fn admit(&mut self, target: &str, now: DateTime<Utc>) -> bool {
        let record = self.paths.entry(target.to_string()).or_default();
        if let Some(last) = record.last_trace_time {
            if now - last < self.cooldown {
                return false;
            }
        }
        record.last_trace_time = Some(now);
        true
    }

    /// Turn a finished trace into records.
    ///
    /// Always yields a traceroute result; adds a path change when a previous
    /// successful fingerprint exists and differs. Stored path state only
    /// moves on successful traces.
    pub fn complete(&mut self, request: &TraceRequest, outcome: TraceOutcome) -> Vec<Record> {
        let success = outcome.is_success();
        let TraceOutcome {
            hops,
            path_hash,
            error,
        } = outcome;

        let mut records = vec![Record::new(
            &request.target,
            &request.episode_id,
            RecordBody::TracerouteResult(TracerouteResult {
                hops: hops.clone(),
                path_hash: path_hash.clone().unwrap_or_default(),
                err: error,
            }),
        )];

        let Some(new_hash) = path_hash.filter(|_| success) else {
            return records;
        };

        let path = self.paths.entry(request.target.clone()).or_default();
        if let Some(prev_hash) = path.last_path_hash.as_ref().filter(|h| **h != new_hash) {
            records.push(Record::new(
                &request.target,
                &request.episode_id,
                RecordBody::PathChange(PathChange {
                    prev_path_hash: prev_hash.clone(),
                    new_path_hash: new_hash.clone(),
                    prev_hops: path.last_hops.clone(),
                    new_hops: hops.clone(),
                }),
            ));
        }

        path.last_path_hash = Some(new_hash);
        path.last_hops = hops;
        records
    }
}

/// Serial traceroute worker.
///
/// Requests are handled one at a time in submission order, which is what
/// keeps cooldown and path diffs consistent without further locking.
pub async fn run_traceroute_worker<T: Tracer>(
    mut correlator: Correlator,
    tracer: T,
    detector: SharedDetector,
    writer: RecordWriter,
    mut requests: mpsc::Receiver<TraceRequest>,
    errors: mpsc::Sender<MonitorError>,
    mut stop: broadcast::Receiver<()>,
) {
    loop {
        let request = tokio::select! {
            _ = stop.recv() => break,
            r = requests.recv() => match r {
                Some(r) => r,
                None => break,
            },
        };

        if !correlator.admit(&request.target, Utc::now()) {
            tracing::debug!(
                "Traceroute: skipping {} ({}), within cooldown",
                request.target,
                request.episode_id
            );
            continue;
        }

        let outcome = tokio::select! {
            _ = stop.recv() => break,
            o = tracer.trace(&request.host) => o,
        };
        if let Some(err) = &outcome.error {
            tracing::warn!("Traceroute to {} failed: {}", request.host, err);
        }

        detector.record_traceroute(&request.target, &request.episode_id);

        for record in correlator.complete(&request, outcome) {
            if let Err(e) = writer.emit(&record) {
                let _ = errors.send(e.into()).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Detector;
    use crate::probe::path_fingerprint;
    use crate::sink::{RotatingFile, LOG_FILE_NAME};
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn request(target: &str, episode_id: &str) -> TraceRequest {
        TraceRequest {
            target: target.to_string(),
            host: format!("{}.example", target),
            episode_id: episode_id.to_string(),
        }
    }

    fn hops(path: &[(u32, &str)]) -> Vec<Hop> {
        path.iter()
            .map(|(ttl, ip)| Hop {
                ttl: *ttl,
                ip: ip.to_string(),
                rtt_ms: (!ip.is_empty()).then_some(1.0),
            })
            .collect()
    }

    fn clean(path: &[(u32, &str)]) -> TraceOutcome {
        let hops = hops(path);
        TraceOutcome {
            path_hash: Some(path_fingerprint(&hops)),
            hops,
            error: None,
        }
    }

    #[test]
    fn test_cooldown_scenario() {
        let mut c = Correlator::new(ChronoDuration::seconds(60));
        assert!(c.admit("gw", at(0)));
        assert!(!c.admit("gw", at(30)));
        assert!(c.admit("gw", at(90)));

        // Cooldown is per target
        assert!(c.admit("dns", at(91)));
        assert!(!c.admit("gw", at(149)));
        assert!(c.admit("gw", at(150)));
    }

    #[test]
    fn test_first_trace_never_reports_path_change() {
        let mut c = Correlator::new(ChronoDuration::seconds(60));
        let records = c.complete(&request("gw", "e1"), clean(&[(1, "10.0.0.1")]));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), "traceroute_result");
        assert_eq!(records[0].outage_id, "e1");
        assert!(c.path("gw").unwrap().last_path_hash.is_some());
    }

    #[test]
    fn test_path_change_scenario() {
        let mut c = Correlator::new(ChronoDuration::seconds(60));
        let first = clean(&[(1, "10.0.0.1"), (2, "10.0.0.2")]);
        let second = clean(&[(1, "10.0.0.1"), (2, "10.0.0.3")]);
        let first_hash = first.path_hash.clone().unwrap();
        let second_hash = second.path_hash.clone().unwrap();
        assert_ne!(first_hash, second_hash);

        assert_eq!(c.complete(&request("gw", "e1"), first).len(), 1);
        let records = c.complete(&request("gw", "e2"), second);
        assert_eq!(records.len(), 2);

        let RecordBody::PathChange(change) = &records[1].body else {
            panic!("expected path change, got {:?}", records[1].body);
        };
        assert_eq!(records[1].outage_id, "e2");
        assert_eq!(change.prev_path_hash, first_hash);
        assert_eq!(change.new_path_hash, second_hash);
        assert_eq!(change.prev_hops[1].ip, "10.0.0.2");
        assert_eq!(change.new_hops[1].ip, "10.0.0.3");

        // Same path again: no change
        let records = c.complete(&request("gw", "e3"), clean(&[(1, "10.0.0.1"), (2, "10.0.0.3")]));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_failed_trace_does_not_touch_path_state() {
        let mut c = Correlator::new(ChronoDuration::seconds(60));
        c.complete(&request("gw", "e1"), clean(&[(1, "10.0.0.1")]));
        let stored = c.path("gw").unwrap().last_path_hash.clone();

        // Partial output with an error: fingerprinted, but not stored
        let partial = TraceOutcome::from_output(" 1  10.9.9.9  1.0 ms\n", Some("timed out".into()));
        let records = c.complete(&request("gw", "e2"), partial);
        assert_eq!(records.len(), 1);
        let RecordBody::TracerouteResult(result) = &records[0].body else {
            panic!("expected traceroute result");
        };
        assert!(!result.path_hash.is_empty());
        assert_eq!(result.err.as_deref(), Some("timed out"));
        assert_eq!(c.path("gw").unwrap().last_path_hash, stored);

        // No output at all: errored record without fingerprint
        let empty = TraceOutcome::from_output("", Some("exit status: 2".into()));
        let records = c.complete(&request("gw", "e3"), empty);
        let RecordBody::TracerouteResult(result) = &records[0].body else {
            panic!("expected traceroute result");
        };
        assert!(result.path_hash.is_empty());
        assert!(result.hops.is_empty());
        assert_eq!(c.path("gw").unwrap().last_path_hash, stored);
    }

    #[test]
    fn test_path_change_after_failed_trace_compares_last_success() {
        let mut c = Correlator::new(ChronoDuration::seconds(60));
        c.complete(&request("gw", "e1"), clean(&[(1, "10.0.0.1")]));
        c.complete(&request("gw", "e2"), TraceOutcome::from_output("", Some("boom".into())));

        let records = c.complete(&request("gw", "e3"), clean(&[(1, "10.0.0.9")]));
        assert_eq!(records.len(), 2);
        let RecordBody::PathChange(change) = &records[1].body else {
            panic!("expected path change");
        };
        assert_eq!(change.prev_hops[0].ip, "10.0.0.1");
    }

    /// Returns queued outcomes in order and remembers which hosts it traced.
    struct ScriptedTracer {
        outcomes: Mutex<VecDeque<TraceOutcome>>,
        calls: std::sync::Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tracer for ScriptedTracer {
        async fn trace(&self, host: &str) -> TraceOutcome {
            self.calls.lock().unwrap().push(host.to_string());
            self.outcomes.lock().unwrap().pop_front().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn test_worker_traces_once_per_cooldown_and_counts() {
        let dir = TempDir::new().unwrap();
        let writer = RecordWriter::new(RotatingFile::open(dir.path(), 1 << 20, 1).unwrap(), "h");

        let detector = SharedDetector::new(Detector::new(ChronoDuration::seconds(10)));
        let events = detector.process_ping("gw", at(0), false, 0.0);
        let episode_id = events[0].outage_id().to_string();

        let calls = std::sync::Arc::new(Mutex::new(Vec::new()));
        let tracer = ScriptedTracer {
            outcomes: Mutex::new(VecDeque::from(vec![clean(&[(1, "10.0.0.1")])])),
            calls: calls.clone(),
        };

        let (req_tx, req_rx) = mpsc::channel(TRACE_QUEUE_CAPACITY);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        req_tx.send(request("gw", &episode_id)).await.unwrap();
        req_tx.send(request("gw", &episode_id)).await.unwrap();
        drop(req_tx);

        run_traceroute_worker(
            Correlator::new(ChronoDuration::seconds(60)),
            tracer,
            detector.clone(),
            writer.clone(),
            req_rx,
            err_tx,
            stop_rx,
        )
        .await;

        assert_eq!(calls.lock().unwrap().as_slice(), ["gw.example"]);
        assert!(err_rx.try_recv().is_err());

        let logged = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(logged.lines().count(), 1);
        assert!(logged.contains("\"type\":\"traceroute_result\""));

        // The trace was counted against the open episode
        let closing: Vec<_> = (1..=21)
            .flat_map(|t| detector.process_ping("gw", at(t), true, 1.0))
            .collect();
        let crate::detector::DetectorEvent::OutageSummary(summary) = &closing[1] else {
            panic!("expected summary");
        };
        assert_eq!(summary.traceroute_count, 1);
    }

    #[tokio::test]
    async fn test_worker_reports_sink_failure_and_exits() {
        let dir = TempDir::new().unwrap();
        let writer = crate::scheduler::tests::broken_writer(&dir);
        let detector = SharedDetector::new(Detector::new(ChronoDuration::seconds(10)));

        let tracer = ScriptedTracer {
            outcomes: Mutex::new(VecDeque::from(vec![clean(&[(1, "10.0.0.1")])])),
            calls: std::sync::Arc::new(Mutex::new(Vec::new())),
        };

        let (req_tx, req_rx) = mpsc::channel(TRACE_QUEUE_CAPACITY);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = broadcast::channel(1);
        req_tx.send(request("gw", "e1")).await.unwrap();

        // The request queue stays open: only the failure may end the worker
        tokio::time::timeout(
            Duration::from_secs(2),
            run_traceroute_worker(
                Correlator::new(ChronoDuration::seconds(60)),
                tracer,
                detector,
                writer,
                req_rx,
                err_tx,
                stop_rx,
            ),
        )
        .await
        .unwrap();

        let err = err_rx.try_recv().unwrap();
        assert!(matches!(err, MonitorError::Sink(_)));
        drop(req_tx);
    }

    #[tokio::test]
    async fn test_worker_stops_on_signal() {
        let dir = TempDir::new().unwrap();
        let writer = RecordWriter::new(RotatingFile::open(dir.path(), 1 << 20, 1).unwrap(), "h");
        let detector = SharedDetector::new(Detector::new(ChronoDuration::seconds(10)));

        let (_req_tx, req_rx) = mpsc::channel(TRACE_QUEUE_CAPACITY);
        let (err_tx, _err_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let worker = tokio::spawn(run_traceroute_worker(
            Correlator::new(ChronoDuration::seconds(60)),
            SystemTracer { max_hops: 1, hop_timeout: Duration::from_millis(10) },
            detector,
            writer,
            req_rx,
            err_tx,
            stop_rx,
        ));

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
