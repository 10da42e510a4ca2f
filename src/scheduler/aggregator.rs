//! Fan-in of probe results into the detector.

use tokio::sync::{broadcast, mpsc};

use super::SharedDetector;
use crate::detector::DetectorEvent;
use crate::probe::{DnsResult, PingResult};

/// Feed ping and DNS results to the detector as they arrive, forwarding
/// detector events downstream in the order they were produced.
///
/// Whichever input is ready first is handled first. Exits on stop, when
/// both inputs close, or when nobody is left to receive events.
pub async fn run_aggregator(
    detector: SharedDetector,
    mut ping_rx: mpsc::Receiver<PingResult>,
    mut dns_rx: mpsc::Receiver<DnsResult>,
    events_tx: mpsc::Sender<DetectorEvent>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut ping_open = true;
    let mut dns_open = true;

    while ping_open || dns_open {
        tokio::select! {
            _ = stop_rx.recv() => break,
            r = ping_rx.recv(), if ping_open => match r {
                Some(ping) => {
                    let events = detector.process_ping(&ping.target, ping.time, ping.success, ping.rtt_ms);
                    for event in events {
                        if events_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                None => ping_open = false,
            },
            r = dns_rx.recv(), if dns_open => match r {
                Some(dns) => detector.process_dns(dns.time, dns.success),
                None => dns_open = false,
            },
        }
    }
    tracing::debug!("Aggregator stopped");
}
