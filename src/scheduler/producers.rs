//! Periodic ping and DNS producers.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::config::{DnsConfig, PingConfig, TargetConfig};
use crate::probe::{
    ensure_icmp_capability, ping_once, resolve_address, run_dns_probe, DnsResult, Pacer,
    PingResult, ProbeError,
};

/// Ping one target on a fixed grid until stopped.
///
/// The host is resolved once up front; failing that, or lacking any ICMP
/// socket capability, ends the producer with an error. Individual ping
/// failures are reported as failed samples.
pub async fn run_ping_producer(
    target: TargetConfig,
    settings: PingConfig,
    tx: mpsc::Sender<PingResult>,
    mut stop_rx: broadcast::Receiver<()>,
) -> Result<(), ProbeError> {
    ensure_icmp_capability()?;
    let ip = resolve_address(&target.host).await?;
    tracing::info!("Ping producer: {} ({}) -> {}", target.name, target.host, ip);

    let timeout = settings.timeout();
    let mut pacer = Pacer::new(Instant::now(), settings.interval());

    loop {
        tokio::select! {
            _ = stop_rx.recv() => return Ok(()),
            _ = tokio::time::sleep_until(pacer.deadline()) => {}
        }

        let outcome = tokio::select! {
            _ = stop_rx.recv() => return Ok(()),
            r = ping_once(ip, timeout) => r,
        };

        let result = match outcome {
            Ok(rtt_ms) => PingResult {
                target: target.name.clone(),
                time: Utc::now(),
                success: true,
                rtt_ms,
            },
            Err(e) => {
                tracing::debug!("Ping to {} failed: {}", target.name, e);
                PingResult {
                    target: target.name.clone(),
                    time: Utc::now(),
                    success: false,
                    rtt_ms: 0.0,
                }
            }
        };

        tokio::select! {
            _ = stop_rx.recv() => return Ok(()),
            sent = tx.send(result) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }

        pacer.advance(Instant::now());
    }
}

/// Query DNS on a fixed grid, rotating through names and resolvers.
///
/// Tick `k` asks `queries[k % len]` of `resolvers[k % len]`.
pub async fn run_dns_producer(
    settings: DnsConfig,
    tx: mpsc::Sender<DnsResult>,
    mut stop_rx: broadcast::Receiver<()>,
) -> Result<(), ProbeError> {
    if settings.queries.is_empty() || settings.resolvers.is_empty() {
        return Err(ProbeError::Config(
            "dns producer needs at least one query and one resolver".to_string(),
        ));
    }
    tracing::info!(
        "DNS producer: {} queries across {} resolvers",
        settings.queries.len(),
        settings.resolvers.len()
    );

    let timeout: Duration = settings.timeout();
    let mut pacer = Pacer::new(Instant::now(), settings.interval());
    let mut tick: usize = 0;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => return Ok(()),
            _ = tokio::time::sleep_until(pacer.deadline()) => {}
        }

        let query = &settings.queries[tick % settings.queries.len()];
        let resolver = &settings.resolvers[tick % settings.resolvers.len()];
        tick = tick.wrapping_add(1);

        let outcome = tokio::select! {
            _ = stop_rx.recv() => return Ok(()),
            r = run_dns_probe(resolver, query, timeout) => r,
        };

        let success = match outcome {
            Ok(_) => true,
            // A query name that cannot be encoded will never succeed
            Err(e @ ProbeError::Config(_)) => return Err(e),
            Err(e) => {
                tracing::debug!("DNS {} via {} failed: {}", query, resolver, e);
                false
            }
        };

        tokio::select! {
            _ = stop_rx.recv() => return Ok(()),
            sent = tx.send(DnsResult { time: Utc::now(), success }) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }

        pacer.advance(Instant::now());
    }
}
