//! Traceroute probe via the system `traceroute` utility.

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::ProbeError;

/// Slack added on top of `max_hops * hop_timeout`.
pub const TRACE_MARGIN: Duration = Duration::from_secs(2);

/// One hop of a trace. `ip` is empty and `rtt_ms` absent when nothing
/// answered at this TTL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    pub ttl: u32,
    pub ip: String,
    pub rtt_ms: Option<f64>,
}

/// Result of one traceroute invocation.
///
/// `path_hash` is `None` only when the tracer produced no output at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceOutcome {
    pub hops: Vec<Hop>,
    pub path_hash: Option<String>,
    pub error: Option<String>,
}

impl TraceOutcome {
    /// Clean run with a fingerprint; only these update stored path state.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.path_hash.as_deref().is_some_and(|h| !h.is_empty())
    }

    /// Build an outcome from raw tracer output and an optional error.
    pub fn from_output(output: &str, error: Option<String>) -> Self {
        if output.trim().is_empty() {
            return Self {
                hops: Vec::new(),
                path_hash: None,
                error: Some(error.unwrap_or_else(|| "traceroute produced no output".to_string())),
            };
        }

        let hops = parse_output(output);
        let path_hash = Some(path_fingerprint(&hops));
        Self {
            hops,
            path_hash,
            error,
        }
    }
}

/// Total time allowed for one trace.
pub fn trace_budget(max_hops: u32, hop_timeout: Duration) -> Duration {
    hop_timeout * max_hops + TRACE_MARGIN
}

/// Trace the path to `host`.
///
/// Never fails: spawn errors, non-zero exits and timeouts are reported in
/// [`TraceOutcome::error`], with whatever hops could be parsed from the
/// output produced so far.
pub async fn run_traceroute(host: &str, max_hops: u32, hop_timeout: Duration) -> TraceOutcome {
    let wait_secs = hop_timeout.as_secs_f64().round().max(1.0);
    let budget = trace_budget(max_hops, hop_timeout);

    let mut child = match Command::new("traceroute")
        .args(["-n", "-m", &max_hops.to_string(), "-w", &format!("{:.0}", wait_secs), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            let err = ProbeError::Command(format!("failed to execute traceroute: {}", e));
            return TraceOutcome::from_output("", Some(err.to_string()));
        }
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out = Vec::new();
    let mut err_out = Vec::new();

    let run = async {
        let read_out = async {
            match stdout.as_mut() {
                Some(s) => s.read_to_end(&mut out).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let read_err = async {
            match stderr.as_mut() {
                Some(s) => s.read_to_end(&mut err_out).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let (r1, r2) = tokio::join!(read_out, read_err);
        r1?;
        r2?;
        child.wait().await
    };
    let waited = tokio::time::timeout(budget, run).await;

    let error = match waited {
        Ok(Ok(status)) if status.success() => None,
        Ok(Ok(status)) => {
            let stderr_text = String::from_utf8_lossy(&err_out);
            let detail = stderr_text.trim();
            Some(if detail.is_empty() {
                format!("traceroute exited with {}", status)
            } else {
                format!("traceroute exited with {}: {}", status, detail)
            })
        }
        Ok(Err(e)) => Some(format!("traceroute I/O error: {}", e)),
        Err(_) => {
            let _ = child.start_kill();
            Some(ProbeError::Timeout(budget).to_string())
        }
    };

    let mut text = String::from_utf8_lossy(&out).into_owned();
    text.push_str(&String::from_utf8_lossy(&err_out));
    TraceOutcome::from_output(&text, error)
}

/// Parse `traceroute -n` output into hops.
///
/// The header line and anything that does not start with a TTL are skipped.
pub fn parse_output(output: &str) -> Vec<Hop> {
    static HOP_LINE: OnceLock<Regex> = OnceLock::new();
    let re = HOP_LINE.get_or_init(|| {
        Regex::new(r"^\s*(?P<ttl>\d+)\s+(?P<rest>.+)$").expect("valid hop regex")
    });

    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("traceroute"))
        .filter_map(|line| {
            let caps = re.captures(line)?;
            let ttl = caps["ttl"].parse().ok()?;
            let (ip, rtt_ms) = parse_hop(&caps["rest"]);
            Some(Hop { ttl, ip, rtt_ms })
        })
        .collect()
}

/// Split the remainder of a hop line into responder address and its first
/// RTT. Lost probes (`*`) are skipped, so a hop is silent only when every
/// probe was lost.
fn parse_hop(rest: &str) -> (String, Option<f64>) {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let Some(at) = fields.iter().position(|f| *f != "*") else {
        return (String::new(), None);
    };

    let rtt = fields[at..]
        .windows(2)
        .find(|w| w[1] == "ms")
        .and_then(|w| w[0].parse::<f64>().ok());

    (fields[at].to_string(), rtt)
}

/// SHA-256 over the ordered `(ttl, ip)` sequence, hex encoded.
///
/// Silent hops contribute an empty address, so hop position is part of the
/// fingerprint.
pub fn path_fingerprint(hops: &[Hop]) -> String {
    let mut hasher = Sha256::new();
    for hop in hops {
        hasher.update(format!("{}:{}|", hop.ttl, hop.ip).as_bytes());
    }
    hex::encode(hasher.finalize())
}
