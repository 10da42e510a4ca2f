//! Native ICMP echo probe.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::ProbeError;

/// Which kind of ICMP socket this process may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpCapability {
    /// RAW socket (root or CAP_NET_RAW)
    Raw,
    /// Unprivileged DGRAM socket (Linux ping_group_range, macOS)
    Dgram,
    Unavailable,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each ping request.
/// This ensures concurrent pings can be distinguished even to the same destination.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Raw;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Dgram;
    }

    IcmpCapability::Unavailable
}

/// Check once per process that an ICMP socket can be opened.
///
/// Fails with [`ProbeError::Permission`] when neither a RAW nor a DGRAM
/// socket is allowed; ping monitoring cannot run at all in that case.
pub fn ensure_icmp_capability() -> Result<IcmpCapability, ProbeError> {
    match *ICMP_CAPABILITY.get_or_init(detect_icmp_capability) {
        IcmpCapability::Unavailable => Err(ProbeError::Permission(
            "ICMP sockets require root, CAP_NET_RAW or net.ipv4.ping_group_range".to_string(),
        )),
        capability => Ok(capability),
    }
}

/// Resolve hostname to IP address.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Send one echo request to `ip` and wait for its reply.
///
/// Returns the round-trip time in milliseconds.
pub async fn ping_once(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
}

fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (identifier, sequence) = generate_ping_id();

    let (domain, protocol, packet) = match ip {
        IpAddr::V4(_) => (
            Domain::IPV4,
            Protocol::ICMPV4,
            build_icmp_echo_request(identifier, sequence),
        ),
        IpAddr::V6(_) => (
            Domain::IPV6,
            Protocol::ICMPV6,
            build_icmpv6_echo_request(identifier, sequence),
        ),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(s) => (s, true),
        Err(_) => (
            Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|e| ProbeError::Permission(format!("Failed to create ICMP socket: {}", e)))?,
            false,
        ),
    };

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    // Start timing just before send
    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Permission(e.to_string())
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Receive replies until we get OUR reply or time out
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        let Some(reply) = parse_echo_reply(buf, ip.is_ipv4()) else {
            continue;
        };

        // DGRAM sockets have their identifier rewritten by the kernel, so
        // only the sequence can be matched there.
        if reply.sequence == sequence && (!raw || reply.identifier == identifier) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
    }
}

#[derive(Debug, PartialEq)]
struct EchoReply {
    identifier: u16,
    sequence: u16,
}

/// Extract identifier and sequence from an echo reply, skipping an IPv4
/// header when the socket delivers one. Returns `None` for anything else.
fn parse_echo_reply(buf: &[u8], ipv4: bool) -> Option<EchoReply> {
    let offset = if ipv4 && buf.first().is_some_and(|b| b >> 4 == 4) {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };
    let icmp = buf.get(offset..offset + 8)?;

    // Echo Reply: type 0 (ICMPv4) or 129 (ICMPv6)
    let reply_type = if ipv4 { 0 } else { 129 };
    if icmp[0] != reply_type {
        return None;
    }

    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

fn payload_timestamp() -> [u8; 8] {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    nanos.to_be_bytes()
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&payload_timestamp());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&payload_timestamp());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // A packet including its own checksum sums to zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0x01]), !0x0100u16);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
    }

    #[test]
    fn test_build_icmpv6_packet() {
        let packet = build_icmpv6_echo_request(0xBEEF, 7);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
        assert_eq!(packet[6..8], [0x00, 0x07]);
    }

    #[test]
    fn test_parse_echo_reply_dgram() {
        let mut reply = vec![0u8; 16];
        reply[4..6].copy_from_slice(&0xABCDu16.to_be_bytes());
        reply[6..8].copy_from_slice(&42u16.to_be_bytes());

        assert_eq!(
            parse_echo_reply(&reply, true),
            Some(EchoReply { identifier: 0xABCD, sequence: 42 })
        );
    }

    #[test]
    fn test_parse_echo_reply_skips_ip_header() {
        let mut packet = vec![0u8; 20 + 8];
        packet[0] = 0x45; // IPv4, IHL 5
        packet[20] = 0; // Echo Reply
        packet[24..26].copy_from_slice(&1u16.to_be_bytes());
        packet[26..28].copy_from_slice(&2u16.to_be_bytes());

        assert_eq!(
            parse_echo_reply(&packet, true),
            Some(EchoReply { identifier: 1, sequence: 2 })
        );
    }

    #[test]
    fn test_parse_echo_reply_rejects_other_types() {
        let mut unreachable = vec![0u8; 8];
        unreachable[0] = 3;
        assert_eq!(parse_echo_reply(&unreachable, true), None);

        // Our own echo request looped back
        let request = build_icmpv6_echo_request(1, 1);
        assert_eq!(parse_echo_reply(&request, false), None);

        assert_eq!(parse_echo_reply(&[0u8; 4], true), None);
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let ip = resolve_address("192.0.2.7").await.unwrap();
        assert_eq!(ip, "192.0.2.7".parse::<IpAddr>().unwrap());
    }
}
