//! DNS probe implementation using raw UDP packets.

use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::ProbeError;

/// Resolve `name` (A record) against `resolver` once.
///
/// The resolver may carry a port; port 53 is assumed otherwise. Returns the
/// latency in milliseconds of a well-formed, RCODE 0 answer.
pub async fn run_dns_probe(resolver: &str, name: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let target_addr = resolver_addr(resolver);

    let packet = build_dns_query(name)?;
    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);

    let bind = if target_addr.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    socket
        .connect(&target_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    let exchange = async {
        socket
            .send(&packet)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

        let mut response = [0u8; 512];
        let n = socket
            .recv(&mut response)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;
        validate_response(&response[..n], tx_id)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

/// Append `:53` unless the resolver already names a port.
fn resolver_addr(resolver: &str) -> String {
    let resolver = resolver.trim();
    if resolver.parse::<std::net::Ipv6Addr>().is_ok() {
        return format!("[{}]:53", resolver);
    }
    if resolver.contains(':') {
        resolver.to_string()
    } else {
        format!("{}:53", resolver)
    }
}

fn validate_response(response: &[u8], tx_id: u16) -> Result<(), ProbeError> {
    if response.len() < 12 {
        return Err(ProbeError::Network(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // Check RCODE (lower 4 bits of byte 3)
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
    }

    Ok(())
}

/// Build a minimal DNS query packet for an A record of `name`.
fn build_dns_query(name: &str) -> Result<Vec<u8>, ProbeError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired

    // Header (12 bytes): id, flags, qd=1, an=0, ns=0, ar=0
    let mut packet = Vec::with_capacity(18 + name.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0; 6]);

    // Question name: length-prefixed labels
    let mut labels = 0;
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid DNS name: {:?}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
        labels += 1;
    }
    if labels == 0 || packet.len() - 12 > 254 {
        return Err(ProbeError::Config(format!("invalid DNS name: {:?}", name)));
    }
    packet.push(0); // Null terminator

    // QTYPE: A record (1)
    packet.extend_from_slice(&1u16.to_be_bytes());
    // QCLASS: IN (1)
    packet.extend_from_slice(&1u16.to_be_bytes());

    Ok(packet)
}
