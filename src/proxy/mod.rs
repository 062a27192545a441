//! Proxy front-ends
//!
//! Provides:
//! - a front-door listener that demultiplexes SOCKS4 and SOCKS5 by first byte
//! - SOCKS4/4a server (CONNECT, BIND)
//! - SOCKS5 server (CONNECT, BIND, UDP ASSOCIATE) per RFC 1928/1929
//! - HTTP proxy server (CONNECT, absolute-form, connect-ip upgrade)
//!
//! Every handler parses its protocol, then hands a [`ProxyRequest`] to the
//! forwarder. The forwarder knows nothing about SOCKS or HTTP; the request
//! structure is the sole hand-off.

pub mod front;
pub mod http;
pub mod socks4;
pub mod socks5;

pub use front::FrontDoor;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Anything a proxy handler can pump bytes through
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("GSSAPI authentication is not supported")]
    GssapiUnsupported,

    #[error("no acceptable authentication methods")]
    NoAcceptableAuth,

    #[error("invalid username or password")]
    AuthenticationFailed,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("dial timed out")]
    Timeout,

    #[error("name resolution failed: {0}")]
    NameResolution(String),

    #[error("bind source address mismatch: got {got}, want {want}")]
    BindMismatch { got: IpAddr, want: IpAddr },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("general failure: {0}")]
    General(String),
}

impl ProxyError {
    /// Map a dial failure onto the SOCKS5 reply code table
    pub fn socks5_reply(&self) -> u8 {
        match self {
            ProxyError::HostUnreachable | ProxyError::NameResolution(_) => 0x04,
            ProxyError::NetworkUnreachable => 0x03,
            ProxyError::ConnectionRefused => 0x05,
            ProxyError::Timeout => 0x06,
            _ => 0x01,
        }
    }

    /// Fold an I/O error from a host-network dial into the taxonomy
    pub fn from_dial(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => ProxyError::ConnectionRefused,
            ErrorKind::TimedOut => ProxyError::Timeout,
            ErrorKind::HostUnreachable => ProxyError::HostUnreachable,
            ErrorKind::NetworkUnreachable => ProxyError::NetworkUnreachable,
            _ => ProxyError::Io(err),
        }
    }
}

/// Network selector for a dial through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    /// Whether a resolved address satisfies the family constraint
    pub fn accepts(self, addr: IpAddr) -> bool {
        match self {
            Network::Tcp | Network::Udp => true,
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed destination: literal IP or domain name, plus port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TargetAddr::Ip(addr) => Some(addr.ip()),
            TargetAddr::Domain(_, _) => None,
        }
    }

    /// Read a SOCKS5 address: ATYP, then IPv4/domain/IPv6, then port
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProxyError> {
        let atyp = r.read_u8().await?;
        let addr = match atyp {
            0x01 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            0x03 => {
                let len = r.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let domain = String::from_utf8(name)
                    .map_err(|_| ProxyError::Malformed("non-UTF-8 domain name".into()))?;
                let port = r.read_u16().await?;
                TargetAddr::Domain(domain, port)
            }
            0x04 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => return Err(ProxyError::UnsupportedAddressType(other)),
        };
        Ok(addr)
    }

    /// Parse a SOCKS5 address from a byte slice, returning the address and
    /// the number of bytes consumed. Used by the UDP relay framing.
    pub fn read_from_slice(buf: &[u8]) -> Result<(Self, usize), ProxyError> {
        if buf.is_empty() {
            return Err(ProxyError::Malformed("empty address".into()));
        }
        match buf[0] {
            0x01 => {
                if buf.len() < 7 {
                    return Err(ProxyError::Malformed("short IPv4 address".into()));
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((
                    TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)),
                    7,
                ))
            }
            0x03 => {
                if buf.len() < 2 {
                    return Err(ProxyError::Malformed("short domain address".into()));
                }
                let len = buf[1] as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(ProxyError::Malformed("short domain address".into()));
                }
                let domain = String::from_utf8(buf[2..2 + len].to_vec())
                    .map_err(|_| ProxyError::Malformed("non-UTF-8 domain name".into()))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((TargetAddr::Domain(domain, port), 2 + len + 2))
            }
            0x04 => {
                if buf.len() < 19 {
                    return Err(ProxyError::Malformed("short IPv6 address".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            other => Err(ProxyError::UnsupportedAddressType(other)),
        }
    }

    /// Append the SOCKS5 wire encoding: ATYP, address, port
    pub fn write_to_buf(&self, buf: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(0x01);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(0x04);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                buf.push(0x03);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

/// The handler-to-forwarder contract. The owning protocol handler has
/// already written its success reply; the forwarder dials `host:port`
/// through the tunnel and pumps bytes both ways until one side closes.
pub struct ProxyRequest {
    /// The client-side connection (possibly wrapped for framing or replay)
    pub stream: Box<dyn ProxyStream>,
    pub network: Network,
    /// Destination as `host:port`
    pub destination: String,
    pub host: String,
    pub port: u16,
}

impl ProxyRequest {
    pub fn new(stream: Box<dyn ProxyStream>, network: Network, host: String, port: u16) -> Self {
        let destination = format_host_port(&host, port);
        Self {
            stream,
            network,
            destination,
            host,
            port,
        }
    }
}

/// Join host and port, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_ipv4_address() {
        let bytes = [0x01u8, 1, 1, 1, 1, 0x00, 0x50];
        let mut cursor = std::io::Cursor::new(bytes.to_vec());
        let addr = TargetAddr::read_from(&mut cursor).await.unwrap();
        assert_eq!(addr, TargetAddr::Ip("1.1.1.1:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn reads_domain_address() {
        let mut bytes = vec![0x03u8, 6];
        bytes.extend_from_slice(b"ex.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());
        let mut cursor = std::io::Cursor::new(bytes);
        let addr = TargetAddr::read_from(&mut cursor).await.unwrap();
        assert_eq!(addr, TargetAddr::Domain("ex.com".into(), 443));
    }

    #[tokio::test]
    async fn rejects_unknown_atyp() {
        let mut cursor = std::io::Cursor::new(vec![0x05u8, 0, 0]);
        assert!(matches!(
            TargetAddr::read_from(&mut cursor).await,
            Err(ProxyError::UnsupportedAddressType(0x05))
        ));
    }

    #[test]
    fn slice_codec_round_trip() {
        let addr = TargetAddr::Ip("8.8.8.8:53".parse().unwrap());
        let mut buf = Vec::new();
        addr.write_to_buf(&mut buf);
        let (parsed, consumed) = TargetAddr::read_from_slice(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn ipv6_host_port_brackets() {
        assert_eq!(format_host_port("fd00::1", 80), "[fd00::1]:80");
        assert_eq!(format_host_port("ex.com", 80), "ex.com:80");
    }

    #[test]
    fn reply_code_mapping() {
        assert_eq!(ProxyError::HostUnreachable.socks5_reply(), 0x04);
        assert_eq!(ProxyError::NetworkUnreachable.socks5_reply(), 0x03);
        assert_eq!(ProxyError::ConnectionRefused.socks5_reply(), 0x05);
        assert_eq!(ProxyError::Timeout.socks5_reply(), 0x06);
        assert_eq!(ProxyError::General("x".into()).socks5_reply(), 0x01);
    }
}
