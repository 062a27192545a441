//! Minimal in-tunnel DNS resolution
//!
//! Queries the configured DNS servers over virtual UDP sockets, so lookups
//! for proxied destinations travel through the tunnel like everything else.
//! Only A and AAAA questions are needed; anything fancier belongs to a real
//! resolver on the other side.

use super::{StackError, VirtualTun};
use crate::proxy::Network;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace};

const DNS_PORT: u16 = 53;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE: usize = 2048;

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

/// Resolve a host name through the tunnel. Literal IPs pass straight
/// through; otherwise each configured server is tried in order, with the
/// question type chosen by the requested network family.
pub(crate) async fn resolve(
    tun: &VirtualTun,
    host: &str,
    network: Network,
) -> Result<IpAddr, StackError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if !network.accepts(ip) {
            return Err(StackError::NameResolution(format!(
                "{} is not a {} address",
                host, network
            )));
        }
        return Ok(ip);
    }

    let servers = tun.dns_servers();
    if servers.is_empty() {
        return Err(StackError::NameResolution(format!(
            "no DNS servers configured to resolve {:?}",
            host
        )));
    }

    let qtypes = question_types(tun, network);
    for server in servers {
        for &qtype in &qtypes {
            match query(tun, server, host, qtype).await {
                Ok(Some(ip)) => {
                    debug!(host, %ip, %server, "resolved through tunnel");
                    return Ok(ip);
                }
                Ok(None) => continue,
                Err(err) => {
                    trace!(host, %server, "DNS query failed: {}", err);
                    continue;
                }
            }
        }
    }

    Err(StackError::NameResolution(host.to_string()))
}

/// Question types to try, most useful family first
fn question_types(tun: &VirtualTun, network: Network) -> Vec<u16> {
    match network {
        Network::Tcp4 | Network::Udp4 => vec![QTYPE_A],
        Network::Tcp6 | Network::Udp6 => vec![QTYPE_AAAA],
        _ => {
            if tun.has_ipv4() {
                if tun.has_ipv6() {
                    vec![QTYPE_A, QTYPE_AAAA]
                } else {
                    vec![QTYPE_A]
                }
            } else {
                vec![QTYPE_AAAA]
            }
        }
    }
}

async fn query(
    tun: &VirtualTun,
    server: IpAddr,
    host: &str,
    qtype: u16,
) -> Result<Option<IpAddr>, StackError> {
    let socket = tun.listen_packet(None).await?;
    let id: u16 = rand::thread_rng().gen();
    let message = encode_query(id, host, qtype)?;

    socket
        .send_to(&message, SocketAddr::new(server, DNS_PORT))
        .await?;

    let mut buf = vec![0u8; MAX_RESPONSE];
    let (n, _) = tokio::time::timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| StackError::NameResolution(format!("{} (timed out)", host)))??;

    Ok(parse_answer(&buf[..n], id, qtype))
}

/// Build a standard recursive query for one question
pub(crate) fn encode_query(id: u16, host: &str, qtype: u16) -> Result<Vec<u8>, StackError> {
    let mut out = Vec::with_capacity(32 + host.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD set
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0u8; 6]); // AN/NS/AR counts

    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(StackError::NameResolution(format!(
                "invalid host name {:?}",
                host
            )));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(out)
}

/// Extract the first matching answer record. Compressed names are skipped,
/// not expanded; only the record data matters here.
pub(crate) fn parse_answer(buf: &[u8], id: u16, qtype: u16) -> Option<IpAddr> {
    if buf.len() < 12 {
        return None;
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != id {
        return None;
    }
    // QR must be set and RCODE zero
    if buf[2] & 0x80 == 0 || buf[3] & 0x0F != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(buf, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    for _ in 0..ancount {
        pos = skip_name(buf, pos)?;
        if pos + 10 > buf.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let rdlength = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > buf.len() {
            return None;
        }
        if rtype == qtype {
            match (qtype, rdlength) {
                (QTYPE_A, 4) => {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(&buf[pos..pos + 4]);
                    return Some(IpAddr::V4(Ipv4Addr::from(octets)));
                }
                (QTYPE_AAAA, 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&buf[pos..pos + 16]);
                    return Some(IpAddr::V6(Ipv6Addr::from(octets)));
                }
                _ => {}
            }
        }
        pos += rdlength;
    }

    None
}

/// Advance past a possibly-compressed domain name
fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        // Compression pointer: two bytes, ends the name
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_query() {
        let query = encode_query(0x1234, "ex.com", QTYPE_A).unwrap();
        assert_eq!(&query[..2], &[0x12, 0x34]);
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        // 2 "ex" 3 "com" 0
        let name = &query[12..];
        assert_eq!(name[0], 2);
        assert_eq!(&name[1..3], b"ex");
        assert_eq!(name[3], 3);
        assert_eq!(&name[4..7], b"com");
        assert_eq!(name[7], 0);
        assert_eq!(&name[8..10], &QTYPE_A.to_be_bytes());
    }

    #[test]
    fn rejects_empty_labels() {
        assert!(encode_query(1, "bad..host", QTYPE_A).is_err());
    }

    fn answer_fixture(id: u16) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&[0x81, 0x80]); // QR, RD, RA
        msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        msg.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        msg.extend_from_slice(&[0u8; 4]);
        // Question: ex.com A IN
        msg.extend_from_slice(&[2, b'e', b'x', 3, b'c', b'o', b'm', 0]);
        msg.extend_from_slice(&QTYPE_A.to_be_bytes());
        msg.extend_from_slice(&QCLASS_IN.to_be_bytes());
        // Answer with a compression pointer to offset 12
        msg.extend_from_slice(&[0xC0, 12]);
        msg.extend_from_slice(&QTYPE_A.to_be_bytes());
        msg.extend_from_slice(&QCLASS_IN.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&[93, 184, 216, 34]);
        msg
    }

    #[test]
    fn parses_a_answer() {
        let msg = answer_fixture(0x4242);
        assert_eq!(
            parse_answer(&msg, 0x4242, QTYPE_A),
            Some("93.184.216.34".parse().unwrap())
        );
    }

    #[test]
    fn rejects_mismatched_id() {
        let msg = answer_fixture(0x4242);
        assert_eq!(parse_answer(&msg, 0x4243, QTYPE_A), None);
    }

    #[test]
    fn rejects_wrong_type() {
        let msg = answer_fixture(7);
        assert_eq!(parse_answer(&msg, 7, QTYPE_AAAA), None);
    }
}
