//! SOCKS4 and SOCKS4a server
//!
//! Request: `VN=0x04 | CMD | DSTPORT(2) | DSTIP(4) | USERID | 0x00`, with a
//! trailing NUL-terminated hostname when DSTIP is `0.0.0.x, x != 0`
//! (the SOCKS4a convention).

use super::{format_host_port, Network, ProxyError, ProxyStream};
use crate::forward::{pump, Forwarder};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const SOCKS4_VERSION: u8 = 0x04;
const REPLY_VERSION: u8 = 0x00;

/// SOCKS4 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Granted = 0x5A,
    Rejected = 0x5B,
    NoIdentd = 0x5C,
    InvalidUser = 0x5D,
}

/// SOCKS4 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
}

/// A parsed SOCKS4/4a request
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub user: String,
    /// Present only for SOCKS4a requests
    pub domain: Option<String>,
}

impl Request {
    /// Read one request from the wire. The caller has already consumed
    /// nothing; the version byte is part of the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProxyError> {
        let version = r.read_u8().await?;
        if version != SOCKS4_VERSION {
            return Err(ProxyError::InvalidVersion(version));
        }

        let command = match r.read_u8().await? {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            other => return Err(ProxyError::UnsupportedCommand(other)),
        };

        let port = r.read_u16().await?;
        let mut octets = [0u8; 4];
        r.read_exact(&mut octets).await?;
        let ip = Ipv4Addr::from(octets);

        let user = read_until_nul(r).await?;

        // SOCKS4a: 0.0.0.x with x != 0 signals a trailing hostname
        let domain = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
            Some(read_until_nul(r).await?)
        } else {
            None
        };

        Ok(Self {
            command,
            ip,
            port,
            user,
            domain,
        })
    }

    /// Destination host, preferring the SOCKS4a domain when present
    pub fn host(&self) -> String {
        match &self.domain {
            Some(domain) => domain.clone(),
            None => self.ip.to_string(),
        }
    }
}

async fn read_until_nul<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProxyError> {
    let mut out = Vec::new();
    loop {
        let byte = r.read_u8().await?;
        if byte == 0 {
            break;
        }
        if out.len() >= 255 {
            return Err(ProxyError::Malformed("unterminated SOCKS4 field".into()));
        }
        out.push(byte);
    }
    String::from_utf8(out).map_err(|_| ProxyError::Malformed("non-UTF-8 SOCKS4 field".into()))
}

/// Write a reply: `VN=0x00 | CD | DSTPORT(2) | DSTIP(4)`
pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    reply: Reply,
    addr: Option<SocketAddr>,
) -> Result<(), ProxyError> {
    let (ip, port) = match addr {
        Some(SocketAddr::V4(v4)) => (v4.ip().octets(), v4.port()),
        // SOCKS4 replies can only carry IPv4
        _ => ([0u8; 4], 0),
    };
    let mut buf = [0u8; 8];
    buf[0] = REPLY_VERSION;
    buf[1] = reply as u8;
    buf[2..4].copy_from_slice(&port.to_be_bytes());
    buf[4..8].copy_from_slice(&ip);
    w.write_all(&buf).await?;
    Ok(())
}

/// SOCKS4/4a server: parses the request, then connects or binds via the
/// forwarder.
pub struct Socks4Server {
    forwarder: Arc<Forwarder>,
}

impl Socks4Server {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }

    /// Serve one accepted client connection to completion
    pub async fn serve_conn(
        &self,
        mut stream: Box<dyn ProxyStream>,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let req = Request::read_from(&mut stream).await?;
        debug!(command = ?req.command, destination = %format_host_port(&req.host(), req.port), %peer, "SOCKS4 request");

        match req.command {
            Command::Connect => self.handle_connect(stream, req).await,
            Command::Bind => self.handle_bind(stream, req).await,
        }
    }

    async fn handle_connect(
        &self,
        mut stream: Box<dyn ProxyStream>,
        req: Request,
    ) -> Result<(), ProxyError> {
        let host = req.host();
        let upstream = match self.forwarder.dial(Network::Tcp, &host, req.port).await {
            Ok(conn) => conn,
            Err(err) => {
                write_reply(&mut stream, Reply::Rejected, None).await?;
                return Err(err);
            }
        };

        write_reply(&mut stream, Reply::Granted, Some(upstream.local_addr)).await?;
        info!(destination = %format_host_port(&host, req.port), "SOCKS4 CONNECT established");
        self.forwarder
            .bridge(stream, upstream.stream, Network::Tcp)
            .await
    }

    async fn handle_bind(
        &self,
        mut stream: Box<dyn ProxyStream>,
        req: Request,
    ) -> Result<(), ProxyError> {
        let listener = match TcpListener::bind("0.0.0.0:0").await {
            Ok(ln) => ln,
            Err(err) => {
                write_reply(&mut stream, Reply::Rejected, None).await?;
                return Err(ProxyError::Io(err));
            }
        };
        let bound = listener.local_addr()?;
        write_reply(&mut stream, Reply::Granted, Some(bound)).await?;
        debug!(%bound, "SOCKS4 BIND listener waiting");

        let token = self.forwarder.token();
        let (remote, remote_addr) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    write_reply(&mut stream, Reply::Rejected, None).await?;
                    return Err(ProxyError::Io(err));
                }
            },
        };
        drop(listener);

        write_reply(&mut stream, Reply::Granted, Some(remote_addr)).await?;
        debug!(%remote_addr, destination = %format_host_port(&req.host(), req.port), "SOCKS4 BIND accepted");
        pump(
            stream,
            Box::new(remote),
            None,
            &self.forwarder.pool(),
            &token,
        )
        .await
    }
}
