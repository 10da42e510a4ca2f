//! JSONL writer with envelope stamping and size-based rotation.

use chrono::{SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::records::*;
use super::SinkError;

/// File name of the active log inside the log directory.
pub const LOG_FILE_NAME: &str = "edgeprobe.jsonl";

/// Append-only file that rotates to `<name>.1 .. <name>.N` by size.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
    max_files: usize,
}

impl RotatingFile {
    pub fn open<P: AsRef<Path>>(dir: P, max_bytes: u64, max_files: usize) -> Result<Self, SinkError> {
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(LOG_FILE_NAME);
        let file = open_append(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            max_bytes,
            max_files,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, rotating first if it would overflow the current file.
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), SinkError> {
        if self.size > 0 && self.size + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }

        self.file.write_all(line)?;
        self.size += line.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> Result<(), SinkError> {
        self.file.flush()?;

        let oldest = self.backup(self.max_files);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_files).rev() {
            let from = self.backup(n);
            if from.exists() {
                fs::rename(&from, self.backup(n + 1))?;
            }
        }
        if self.max_files > 0 {
            fs::rename(&self.path, self.backup(1))?;
        } else {
            fs::remove_file(&self.path)?;
        }

        self.file = open_append(&self.path)?;
        self.size = 0;
        tracing::debug!("Sink: rotated {}", self.path.display());
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Thread-safe record writer shared by the dispatcher and traceroute worker.
#[derive(Clone)]
pub struct RecordWriter {
    file: Arc<Mutex<RotatingFile>>,
    seq: Arc<AtomicU64>,
    host_id: Arc<str>,
}

impl RecordWriter {
    pub fn new(file: RotatingFile, host_id: impl Into<String>) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
            seq: Arc::new(AtomicU64::new(0)),
            host_id: Arc::from(host_id.into()),
        }
    }

    /// Stamp the envelope onto `record` and append it as one JSON line.
    ///
    /// Returns the sequence number assigned to the record.
    pub fn emit(&self, record: &Record) -> Result<u64, SinkError> {
        validate(record)?;

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Utc::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let stamped = StampedRecord {
            envelope: Envelope {
                ts_utc: now.to_rfc3339_opts(SecondsFormat::Nanos, true),
                ts_unix_ms: now.timestamp_millis(),
                seq,
                target: &record.target,
                outage_id: &record.outage_id,
                schema_version: SCHEMA_VERSION,
                tool_name: TOOL_NAME,
                tool_version: TOOL_VERSION,
                host_id: &self.host_id,
                clock_source: CLOCK_SOURCE,
            },
            body: &record.body,
        };

        let mut line = serde_json::to_vec(&stamped)?;
        line.push(b'\n');
        file.write_line(&line)?;
        Ok(seq)
    }

    pub fn flush(&self) -> Result<(), SinkError> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

fn validate(record: &Record) -> Result<(), SinkError> {
    let missing = |field| SinkError::Malformed {
        record_type: record.record_type(),
        field,
    };
    if record.target.is_empty() {
        return Err(missing("target"));
    }
    if record.outage_id.is_empty() {
        return Err(missing("outage_id"));
    }
    Ok(())
}

/// Best-effort host identifier for the record envelope.
pub fn host_id() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .chain(std::env::var("HOSTNAME").ok())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectorEvent, OutageSummary, Transition};
    use crate::probe::Hop;
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn start_record() -> Record {
        DetectorEvent::OutageStart(Transition {
            target: "example.com".to_string(),
            outage_id: "example.com-123-000001".to_string(),
            reason: "loss_pct".to_string(),
            loss_pct: 50.0,
            rtt_p95_ms: 300.0,
            consecutive_failures: 4,
        })
        .into()
    }

    #[test]
    fn test_emit_populates_envelope() {
        let dir = TempDir::new().unwrap();
        let writer = RecordWriter::new(RotatingFile::open(dir.path(), 1 << 20, 1).unwrap(), "host-1");

        let summary: Record = DetectorEvent::OutageSummary(OutageSummary {
            target: "example.com".to_string(),
            outage_id: "example.com-123-000001".to_string(),
            start: Utc.timestamp_opt(1, 0).unwrap(),
            end: Utc.timestamp_opt(2, 0).unwrap(),
            duration_ms: 1000,
            loss_pct_max: 50.0,
            rtt_p95_max_ms: 300.0,
            rtt_avg_max_ms: 150.0,
            consecutive_failures_max: 4,
            ping_sent: 10,
            ping_recv: 2,
            dns_errors: 1,
            traceroute_count: 1,
        })
        .into();

        assert_eq!(writer.emit(&start_record()).unwrap(), 1);
        assert_eq!(writer.emit(&summary).unwrap(), 2);
        writer.flush().unwrap();

        let lines = read_lines(&dir.path().join(LOG_FILE_NAME));
        assert_eq!(lines.len(), 2);

        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line["seq"], (i + 1) as u64);
            assert_eq!(line["target"], "example.com");
            assert_eq!(line["outage_id"], "example.com-123-000001");
            assert_eq!(line["schema_version"], 2);
            assert_eq!(line["tool_name"], "edgeprobe");
            assert_eq!(line["tool_version"], TOOL_VERSION);
            assert_eq!(line["host_id"], "host-1");
            assert_eq!(line["clock_source"], "system");
            assert!(line["ts_unix_ms"].as_i64().unwrap() > 0);

            let ts = line["ts_utc"].as_str().unwrap();
            assert!(ts.ends_with('Z'));
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        }

        assert_eq!(lines[0]["type"], "degradation_start");
        assert_eq!(lines[0]["reason"], "loss_pct");
        assert_eq!(lines[0]["consecutive_failures"], 4);

        assert_eq!(lines[1]["type"], "outage_summary");
        assert_eq!(lines[1]["duration_ms"], 1000);
        assert_eq!(lines[1]["consecutive_failures_max"], 4);
        assert_eq!(lines[1]["start_ts"], "1970-01-01T00:00:01Z");
    }

    #[test]
    fn test_traceroute_hops_serialize_missing_rtt_as_null() {
        let dir = TempDir::new().unwrap();
        let writer = RecordWriter::new(RotatingFile::open(dir.path(), 1 << 20, 1).unwrap(), "h");

        let record = Record::new(
            "gw",
            "gw-1-000001",
            RecordBody::TracerouteResult(TracerouteResult {
                hops: vec![
                    Hop { ttl: 1, ip: "10.0.0.1".to_string(), rtt_ms: Some(1.5) },
                    Hop { ttl: 2, ip: String::new(), rtt_ms: None },
                ],
                path_hash: "abc".to_string(),
                err: None,
            }),
        );
        writer.emit(&record).unwrap();

        let lines = read_lines(&dir.path().join(LOG_FILE_NAME));
        let line = &lines[0];
        assert_eq!(line["type"], "traceroute_result");
        assert_eq!(line["hops"][0]["rtt_ms"], 1.5);
        assert!(line["hops"][1]["rtt_ms"].is_null());
        assert_eq!(line["hops"][1]["ip"], "");
        assert!(line.get("err").is_none());
    }

    #[test]
    fn test_malformed_record_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = RecordWriter::new(RotatingFile::open(dir.path(), 1 << 20, 1).unwrap(), "h");

        let mut record = start_record();
        record.outage_id.clear();
        let err = writer.emit(&record).unwrap_err();
        assert!(matches!(err, SinkError::Malformed { field: "outage_id", .. }));

        // Nothing written, sequence untouched
        assert_eq!(writer.emit(&start_record()).unwrap(), 1);
    }

    #[test]
    fn test_rotation_keeps_max_files() {
        let dir = TempDir::new().unwrap();
        let mut file = RotatingFile::open(dir.path(), 10, 2).unwrap();

        for i in 0..5 {
            file.write_line(format!("line-{}\n", i).as_bytes()).unwrap();
        }
        file.flush().unwrap();

        let current = fs::read_to_string(file.path()).unwrap();
        assert_eq!(current, "line-4\n");
        assert_eq!(fs::read_to_string(file.backup(1)).unwrap(), "line-3\n");
        assert_eq!(fs::read_to_string(file.backup(2)).unwrap(), "line-2\n");
        assert!(!file.backup(3).exists());
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        {
            let mut file = RotatingFile::open(dir.path(), 1 << 20, 1).unwrap();
            file.write_line(b"a\n").unwrap();
        }
        let mut file = RotatingFile::open(dir.path(), 1 << 20, 1).unwrap();
        file.write_line(b"b\n").unwrap();

        assert_eq!(fs::read_to_string(file.path()).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_host_id_not_empty() {
        assert!(!host_id().is_empty());
    }
}
