//! Record types written to the JSONL sink.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detector::{DetectorEvent, OutageSummary, Transition};
use crate::probe::Hop;

pub const SCHEMA_VERSION: u32 = 2;
pub const TOOL_NAME: &str = "edgeprobe";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CLOCK_SOURCE: &str = "system";

/// A domain record waiting to be stamped with its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub target: String,
    pub outage_id: String,
    pub body: RecordBody,
}

impl Record {
    pub fn new(target: impl Into<String>, outage_id: impl Into<String>, body: RecordBody) -> Self {
        Self {
            target: target.into(),
            outage_id: outage_id.into(),
            body,
        }
    }

    pub fn record_type(&self) -> &'static str {
        match self.body {
            RecordBody::DegradationStart(_) => "degradation_start",
            RecordBody::DegradationEnd(_) => "degradation_end",
            RecordBody::OutageSummary(_) => "outage_summary",
            RecordBody::TracerouteResult(_) => "traceroute_result",
            RecordBody::PathChange(_) => "path_change",
        }
    }
}

impl From<DetectorEvent> for Record {
    fn from(event: DetectorEvent) -> Self {
        match event {
            DetectorEvent::OutageStart(t) => degradation(t, RecordBody::DegradationStart),
            DetectorEvent::OutageEnd(t) => degradation(t, RecordBody::DegradationEnd),
            DetectorEvent::OutageSummary(s) => summary(s),
        }
    }
}

fn degradation(t: Transition, variant: fn(Degradation) -> RecordBody) -> Record {
    Record::new(
        t.target,
        t.outage_id,
        variant(Degradation {
            reason: t.reason,
            loss_pct: t.loss_pct,
            rtt_p95_ms: t.rtt_p95_ms,
            consecutive_failures: t.consecutive_failures,
        }),
    )
}

fn summary(s: OutageSummary) -> Record {
    Record::new(
        s.target,
        s.outage_id,
        RecordBody::OutageSummary(Summary {
            start_ts: s.start,
            end_ts: s.end,
            duration_ms: s.duration_ms,
            loss_pct_max: s.loss_pct_max,
            rtt_p95_max_ms: s.rtt_p95_max_ms,
            rtt_avg_max_ms: s.rtt_avg_max_ms,
            consecutive_failures_max: s.consecutive_failures_max,
            ping_sent: s.ping_sent,
            ping_recv: s.ping_recv,
            dns_errors: s.dns_errors,
            traceroute_count: s.traceroute_count,
        }),
    )
}

/// Record payloads. The variant becomes the envelope's `type` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordBody {
    DegradationStart(Degradation),
    DegradationEnd(Degradation),
    OutageSummary(Summary),
    TracerouteResult(TracerouteResult),
    PathChange(PathChange),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Degradation {
    pub reason: String,
    pub loss_pct: f64,
    pub rtt_p95_ms: f64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
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

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerouteResult {
    pub hops: Vec<Hop>,
    pub path_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathChange {
    pub prev_path_hash: String,
    pub new_path_hash: String,
    pub prev_hops: Vec<Hop>,
    pub new_hops: Vec<Hop>,
}

/// Fields common to every line in the sink.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub ts_utc: String,
    pub ts_unix_ms: i64,
    pub seq: u64,
    pub target: &'a str,
    pub outage_id: &'a str,
    pub schema_version: u32,
    pub tool_name: &'a str,
    pub tool_version: &'a str,
    pub host_id: &'a str,
    pub clock_source: &'a str,
}

/// Envelope and payload flattened into one JSON object.
#[derive(Debug, Serialize)]
pub struct StampedRecord<'a> {
    #[serde(flatten)]
    pub envelope: Envelope<'a>,
    #[serde(flatten)]
    pub body: &'a RecordBody,
}
