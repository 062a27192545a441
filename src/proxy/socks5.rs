//! SOCKS5 server (RFC 1928) with username/password authentication
//! (RFC 1929), CONNECT, BIND and UDP ASSOCIATE.
//!
//! UDP associations either forward through the tunnel (the gateway's
//! default, with SOCKS5 framing applied transparently by [`SocksUdpConn`])
//! or run the embedded host-side relay.

use super::{Network, ProxyError, ProxyRequest, ProxyStream, TargetAddr};
use crate::forward::{pump, Forwarder};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_GSSAPI: u8 = 0x01;
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_ASSOCIATE: u8 = 0x03;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_SERVER_FAILURE: u8 = 0x01;
const REPLY_RULE_FAILURE: u8 = 0x02;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Largest UDP datagram the relay will carry
const MAX_UDP_PACKET: usize = 65536;

/// Username/password credentials for RFC 1929 subnegotiation
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn valid(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// How UDP ASSOCIATE traffic is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    /// Dial the target through the tunnel; framing handled by `SocksUdpConn`
    Forward,
    /// Relay datagrams on the host network without tunneling
    EmbeddedRelay,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    forwarder: Arc<Forwarder>,
    credentials: Option<Credentials>,
    udp_mode: UdpMode,
}

impl Socks5Server {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self {
            forwarder,
            credentials: None,
            udp_mode: UdpMode::Forward,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_udp_mode(mut self, mode: UdpMode) -> Self {
        self.udp_mode = mode;
        self
    }

    /// Serve one accepted client connection through the full state machine:
    /// method negotiation, optional auth, request, dispatch.
    pub async fn serve_conn(
        &self,
        mut stream: Box<dyn ProxyStream>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let version = stream.read_u8().await?;
        if version != SOCKS5_VERSION {
            return Err(ProxyError::InvalidVersion(version));
        }

        self.negotiate(&mut stream).await?;

        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(ProxyError::InvalidVersion(header[0]));
        }
        let command = header[1];

        let dest = match TargetAddr::read_from(&mut stream).await {
            Ok(dest) => dest,
            Err(err @ ProxyError::UnsupportedAddressType(_)) => {
                write_reply(&mut stream, REPLY_ADDR_NOT_SUPPORTED, None).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        debug!(command, destination = %dest, %peer, "SOCKS5 request");

        match command {
            CMD_CONNECT => self.handle_connect(stream, dest).await,
            CMD_BIND => self.handle_bind(stream, local, dest).await,
            CMD_ASSOCIATE => self.handle_associate(stream, local, dest).await,
            other => {
                write_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
                Err(ProxyError::UnsupportedCommand(other))
            }
        }
    }

    /// Method negotiation. Selection order: GSSAPI is answered and refused,
    /// username/password wins when credentials are configured, then
    /// no-auth, otherwise no-acceptable-methods.
    async fn negotiate(&self, stream: &mut Box<dyn ProxyStream>) -> Result<(), ProxyError> {
        let nmethods = stream.read_u8().await? as usize;
        let mut methods = vec![0u8; nmethods];
        stream.read_exact(&mut methods).await?;

        if methods.contains(&AUTH_GSSAPI) {
            stream.write_all(&[SOCKS5_VERSION, AUTH_GSSAPI]).await?;
            return Err(ProxyError::GssapiUnsupported);
        }

        if let Some(credentials) = &self.credentials {
            if methods.contains(&AUTH_USERNAME_PASSWORD) {
                stream
                    .write_all(&[SOCKS5_VERSION, AUTH_USERNAME_PASSWORD])
                    .await?;
                return self.authenticate(stream, credentials).await;
            }
        }

        if methods.contains(&AUTH_NONE) {
            stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;
            return Ok(());
        }

        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        Err(ProxyError::NoAcceptableAuth)
    }

    /// RFC 1929 username/password subnegotiation
    async fn authenticate(
        &self,
        stream: &mut Box<dyn ProxyStream>,
        credentials: &Credentials,
    ) -> Result<(), ProxyError> {
        let version = stream.read_u8().await?;
        if version != 0x01 {
            return Err(ProxyError::Malformed(format!(
                "unsupported auth version: {}",
                version
            )));
        }

        let ulen = stream.read_u8().await? as usize;
        let mut username = vec![0u8; ulen];
        stream.read_exact(&mut username).await?;
        let plen = stream.read_u8().await? as usize;
        let mut password = vec![0u8; plen];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username);
        let password = String::from_utf8_lossy(&password);

        if credentials.valid(&username, &password) {
            debug!(user = %username, "SOCKS5 authentication succeeded");
            stream.write_all(&[0x01, 0x00]).await?;
            Ok(())
        } else {
            warn!(user = %username, "SOCKS5 authentication failed");
            stream.write_all(&[0x01, 0x01]).await?;
            Err(ProxyError::AuthenticationFailed)
        }
    }

    async fn handle_connect(
        &self,
        mut stream: Box<dyn ProxyStream>,
        dest: TargetAddr,
    ) -> Result<(), ProxyError> {
        let host = dest.host();
        let port = dest.port();

        let upstream = match self.forwarder.dial(Network::Tcp, &host, port).await {
            Ok(conn) => conn,
            Err(err) => {
                write_reply(&mut stream, err.socks5_reply(), None).await?;
                return Err(err);
            }
        };

        write_reply(&mut stream, REPLY_SUCCESS, Some(upstream.local_addr)).await?;
        info!(destination = %dest, "SOCKS5 CONNECT established");
        self.forwarder
            .bridge(stream, upstream.stream, Network::Tcp)
            .await
    }

    /// BIND: two-reply sequence. The listener binds on the local IP of the
    /// accepted TCP connection; when DST.ADDR is specified and non-wildcard
    /// the incoming peer must match it.
    async fn handle_bind(
        &self,
        mut stream: Box<dyn ProxyStream>,
        local: SocketAddr,
        dest: TargetAddr,
    ) -> Result<(), ProxyError> {
        let listener = match TcpListener::bind(SocketAddr::new(local.ip(), 0)).await {
            Ok(ln) => ln,
            Err(err) => {
                write_reply(&mut stream, REPLY_SERVER_FAILURE, None).await?;
                return Err(ProxyError::Io(err));
            }
        };
        let bound = listener.local_addr()?;
        write_reply(&mut stream, REPLY_SUCCESS, Some(bound)).await?;
        debug!(%bound, "SOCKS5 BIND listener waiting");

        let token = self.forwarder.token();
        let (remote, remote_addr) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    write_reply(&mut stream, REPLY_SERVER_FAILURE, None).await?;
                    return Err(ProxyError::Io(err));
                }
            },
        };
        drop(listener);

        if let Some(want) = dest.ip() {
            if !want.is_unspecified() && remote_addr.ip() != want {
                write_reply(&mut stream, REPLY_RULE_FAILURE, None).await?;
                return Err(ProxyError::BindMismatch {
                    got: remote_addr.ip(),
                    want,
                });
            }
        }

        write_reply(&mut stream, REPLY_SUCCESS, Some(remote_addr)).await?;
        debug!(%remote_addr, "SOCKS5 BIND accepted");
        pump(
            stream,
            Box::new(remote),
            None,
            &self.forwarder.pool(),
            &token,
        )
        .await
    }

    /// UDP ASSOCIATE: bind a host-side packet endpoint, advertise the
    /// client connection's local IP with the endpoint's port, then carry
    /// datagrams either through the tunnel or the embedded relay. The
    /// association lives exactly as long as the control TCP connection.
    async fn handle_associate(
        &self,
        mut stream: Box<dyn ProxyStream>,
        local: SocketAddr,
        dest: TargetAddr,
    ) -> Result<(), ProxyError> {
        // Prefer the address the client asked for, fall back to a wildcard
        let requested = match &dest {
            TargetAddr::Ip(addr) if !addr.ip().is_unspecified() || addr.port() != 0 => Some(*addr),
            _ => None,
        };
        let socket = match bind_udp(requested).await {
            Ok(socket) => socket,
            Err(err) => {
                let mapped = ProxyError::from_dial(err);
                write_reply(&mut stream, mapped.socks5_reply(), None).await?;
                return Err(mapped);
            }
        };
        let socket = Arc::new(socket);

        // Advertised bind address: client-facing IP, UDP endpoint's port
        let advertised = SocketAddr::new(local.ip(), socket.local_addr()?.port());
        write_reply(&mut stream, REPLY_SUCCESS, Some(advertised)).await?;
        debug!(%advertised, "SOCKS5 UDP association open");

        // RFC 1928: the association terminates when the control connection
        // does. A watcher drains the TCP side and cancels on EOF or error.
        let assoc_token = self.forwarder.token().child_token();
        let watcher_token = assoc_token.clone();
        let watcher = tokio::spawn(async move {
            let mut scratch = [0u8; 1];
            loop {
                tokio::select! {
                    _ = watcher_token.cancelled() => break,
                    read = stream.read(&mut scratch) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    },
                }
            }
            watcher_token.cancel();
        });

        let result = match self.udp_mode {
            UdpMode::Forward => {
                self.associate_forward(Arc::clone(&socket), assoc_token.clone())
                    .await
            }
            UdpMode::EmbeddedRelay => {
                embedded_relay(Arc::clone(&socket), assoc_token.clone()).await
            }
        };

        assoc_token.cancel();
        let _ = watcher.await;
        result
    }

    /// Tunnel-forwarding association: wait for the first client datagram to
    /// learn source and target, then hand a framing-transparent stream to
    /// the forwarder.
    async fn associate_forward(
        &self,
        socket: Arc<UdpSocket>,
        token: CancellationToken,
    ) -> Result<(), ProxyError> {
        let (conn, target) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            first = SocksUdpConn::establish(socket) => first?,
        };

        let host = target.host();
        let port = target.port();
        info!(target = %target, "SOCKS5 UDP association forwarding through tunnel");

        let req = ProxyRequest::new(Box::new(conn), Network::Udp, host, port);
        tokio::select! {
            _ = token.cancelled() => Ok(()),
            result = self.forwarder.handle(req) => result,
        }
    }
}

async fn bind_udp(requested: Option<SocketAddr>) -> std::io::Result<UdpSocket> {
    if let Some(addr) = requested {
        if let Ok(socket) = UdpSocket::bind(addr).await {
            return Ok(socket);
        }
    }
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await
}

/// Write a reply: `VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`
pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: u8,
    addr: Option<SocketAddr>,
) -> Result<(), ProxyError> {
    let addr = addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = vec![SOCKS5_VERSION, code, 0x00];
    TargetAddr::from(addr).write_to_buf(&mut buf);
    w.write_all(&buf).await?;
    Ok(())
}

/// Parse a SOCKS5 UDP request datagram:
/// `RSV(2) | FRAG(1) | ATYP | DST.ADDR | DST.PORT | DATA`.
/// Returns the inner target and the payload offset. Fragmented datagrams
/// are unsupported and rejected.
pub fn parse_udp_datagram(buf: &[u8]) -> Result<(TargetAddr, usize), ProxyError> {
    if buf.len() < 3 {
        return Err(ProxyError::Malformed("short UDP datagram".into()));
    }
    if buf[2] != 0 {
        return Err(ProxyError::Malformed("fragmented UDP datagram".into()));
    }
    let (target, consumed) = TargetAddr::read_from_slice(&buf[3..])?;
    Ok((target, 3 + consumed))
}

/// Build the cached reply prefix `0,0,0 | ATYP | DST.ADDR | DST.PORT`
pub fn udp_reply_prefix(target: &TargetAddr) -> Vec<u8> {
    let mut buf = vec![0u8, 0, 0];
    target.write_to_buf(&mut buf);
    buf
}

/// Embedded host-network UDP relay, used when associations are not
/// forwarded through the tunnel. The first datagram fixes the source; the
/// first parsed inner address fixes the target; everything else is dropped.
async fn embedded_relay(socket: Arc<UdpSocket>, token: CancellationToken) -> Result<(), ProxyError> {
    let mut source: Option<SocketAddr> = None;
    let mut target: Option<SocketAddr> = None;
    let mut reply_prefix: Option<Vec<u8>> = None;
    let mut buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        let (n, from) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => received?,
        };

        let source_addr = *source.get_or_insert(from);

        if from == source_addr {
            // Client to target
            let (inner, offset) = match parse_udp_datagram(&buf[..n]) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!("dropping client datagram: {}", err);
                    continue;
                }
            };
            let inner_addr = match inner {
                TargetAddr::Ip(addr) => addr,
                TargetAddr::Domain(_, _) => {
                    debug!("dropping datagram with unresolved domain target");
                    continue;
                }
            };
            let target_addr = *target.get_or_insert(inner_addr);
            if inner_addr != target_addr {
                debug!(got = %inner_addr, want = %target_addr, "dropping datagram to non-target address");
                continue;
            }
            socket.send_to(&buf[offset..n], target_addr).await?;
        } else if Some(from) == target {
            // Target to client: prepend the cached reply prefix
            let prefix = reply_prefix
                .get_or_insert_with(|| udp_reply_prefix(&TargetAddr::Ip(from)))
                .clone();
            let mut framed = Vec::with_capacity(prefix.len() + n);
            framed.extend_from_slice(&prefix);
            framed.extend_from_slice(&buf[..n]);
            socket.send_to(&framed, source_addr).await?;
        } else {
            warn!(%from, "ignoring datagram from unknown sender");
        }
    }
}

/// A stream view of a UDP association: reads yield client payloads with the
/// SOCKS5 UDP header stripped, writes are re-framed with the cached reply
/// prefix and sent back to the client. The target is fixed by the first
/// datagram; packets to other destinations are dropped.
pub struct SocksUdpConn {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    target: TargetAddr,
    reply_prefix: Vec<u8>,
    /// First payload, captured while learning the target
    pending: Option<Vec<u8>>,
}

impl SocksUdpConn {
    /// Wait for the first well-formed client datagram; it fixes both the
    /// client source address and the association target.
    pub async fn establish(socket: Arc<UdpSocket>) -> Result<(Self, TargetAddr), ProxyError> {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            match parse_udp_datagram(&buf[..n]) {
                Ok((target, offset)) => {
                    let conn = Self {
                        socket,
                        client: from,
                        reply_prefix: udp_reply_prefix(&target),
                        pending: Some(buf[offset..n].to_vec()),
                        target: target.clone(),
                    };
                    return Ok((conn, target));
                }
                Err(err) => {
                    debug!("dropping malformed first datagram: {}", err);
                    continue;
                }
            }
        }
    }
}

impl AsyncRead for SocksUdpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(pending) = self.pending.take() {
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            return Poll::Ready(Ok(()));
        }

        let mut datagram = vec![0u8; MAX_UDP_PACKET];
        loop {
            let mut read_buf = ReadBuf::new(&mut datagram);
            let from = match self.socket.poll_recv_from(cx, &mut read_buf) {
                Poll::Ready(Ok(from)) => from,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            };
            let filled = read_buf.filled().len();

            if from != self.client {
                continue;
            }
            let (inner, offset) = match parse_udp_datagram(&datagram[..filled]) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if inner != self.target {
                continue;
            }

            let payload = &datagram[offset..filled];
            let n = payload.len().min(buf.remaining());
            buf.put_slice(&payload[..n]);
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncWrite for SocksUdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut framed = Vec::with_capacity(self.reply_prefix.len() + data.len());
        framed.extend_from_slice(&self.reply_prefix);
        framed.extend_from_slice(data);
        match self.socket.poll_send_to(cx, &framed, self.client) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(data.len())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_datagram_parsing() {
        // RSV RSV FRAG | ATYP=1 | 8.8.8.8 | 53 | payload
        let mut datagram = vec![0u8, 0, 0, 0x01, 8, 8, 8, 8, 0, 53];
        datagram.extend_from_slice(b"hello");
        let (target, offset) = parse_udp_datagram(&datagram).unwrap();
        assert_eq!(target, TargetAddr::Ip("8.8.8.8:53".parse().unwrap()));
        assert_eq!(&datagram[offset..], b"hello");
    }

    #[test]
    fn rejects_fragmented_datagrams() {
        let datagram = [0u8, 0, 1, 0x01, 8, 8, 8, 8, 0, 53];
        assert!(parse_udp_datagram(&datagram).is_err());
    }

    #[test]
    fn rejects_short_datagrams() {
        assert!(parse_udp_datagram(&[0u8, 0]).is_err());
    }

    #[test]
    fn reply_prefix_matches_request_framing() {
        let target = TargetAddr::Ip("8.8.8.8:53".parse().unwrap());
        let prefix = udp_reply_prefix(&target);
        assert_eq!(prefix, vec![0u8, 0, 0, 0x01, 8, 8, 8, 8, 0, 53]);
    }

    #[tokio::test]
    async fn reply_encoding_carries_bound_address() {
        let mut buf = Vec::new();
        let addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        write_reply(&mut buf, REPLY_SUCCESS, Some(addr)).await.unwrap();
        assert_eq!(
            buf,
            vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]
        );
    }
}
