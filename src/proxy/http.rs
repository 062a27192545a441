//! HTTP proxy server
//!
//! Handles three request shapes on one listener:
//! - `CONNECT host:port` tunneling
//! - absolute-form requests (`GET http://host/path`) replayed upstream
//! - the RFC 9484 connect-ip upgrade handshake (data plane not implemented)

use super::{Network, ProxyError, ProxyStream};
use crate::forward::Forwarder;
use bytes::Bytes;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info};

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

/// Request heads larger than this are refused
const MAX_HEAD_SIZE: usize = 65536;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const SWITCHING_PROTOCOLS: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
Connection: Upgrade\r\n\
Upgrade: connect-ip\r\n\
Capsule-Protocol: ?1\r\n\r\n";

/// A parsed HTTP/1.x request head
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP proxy server
pub struct HttpServer {
    forwarder: Arc<Forwarder>,
}

impl HttpServer {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }

    /// Serve one accepted client connection
    pub async fn serve_conn(
        &self,
        mut stream: Box<dyn ProxyStream>,
        peer: SocketAddr,
    ) -> Result<(), ProxyError> {
        let (head, leftover) = match read_request_head(&mut stream).await? {
            Some(parsed) => parsed,
            // Connection closed before a request arrived
            None => return Ok(()),
        };
        debug!(method = %head.method, target = %head.target, %peer, "HTTP request");

        if is_connect_ip_upgrade(&head) {
            return self.handle_connect_ip(stream, head).await;
        }

        let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
        let (host, port) = target_host_port(&head, is_connect)?;

        let upstream = match self.forwarder.dial(Network::Tcp, &host, port).await {
            Ok(conn) => conn,
            Err(err) => {
                write_response(
                    &mut stream,
                    503,
                    "Service Unavailable",
                    &err.to_string(),
                )
                .await?;
                return Err(err);
            }
        };

        if is_connect {
            stream.write_all(CONNECTION_ESTABLISHED).await?;
            info!(destination = %format!("{}:{}", host, port), "HTTP CONNECT established");
            self.forwarder
                .bridge(stream, upstream.stream, Network::Tcp)
                .await
        } else {
            // Absolute-form proxying: the first reads from the wrapped
            // stream replay the original request ahead of live client bytes
            let replay = reconstruct_request(&head, &leftover);
            info!(destination = %format!("{}:{}", host, port), "HTTP absolute-form forwarding");
            let wrapped = PrefixedStream::new(Bytes::from(replay), stream);
            self.forwarder
                .bridge(Box::new(wrapped), upstream.stream, Network::Tcp)
                .await
        }
    }

    /// RFC 9484 connect-ip upgrade. Only the handshake is recognized; the
    /// tunnel is opened but carries no payload until the client closes.
    async fn handle_connect_ip(
        &self,
        mut stream: Box<dyn ProxyStream>,
        head: RequestHead,
    ) -> Result<(), ProxyError> {
        if head.header("Capsule-Protocol") != Some("?1") {
            write_response(
                &mut stream,
                400,
                "Bad Request",
                "Capsule-Protocol header required for connect-ip",
            )
            .await?;
            return Err(ProxyError::Malformed(
                "missing Capsule-Protocol header".into(),
            ));
        }

        stream.write_all(SWITCHING_PROTOCOLS).await?;
        info!("connect-ip tunnel established, idling until client close");

        let token = self.forwarder.token();
        let mut sink = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                read = stream.read(&mut sink) => match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => continue,
                    Err(err) => return Err(ProxyError::Io(err)),
                },
            }
        }
    }
}

fn is_connect_ip_upgrade(head: &RequestHead) -> bool {
    head.method.eq_ignore_ascii_case("GET")
        && head
            .header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("upgrade"))
        && head
            .header("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("connect-ip"))
}

/// Read up to the end of the request head (`\r\n\r\n`), returning the parsed
/// head and any body bytes already consumed. `None` on immediate EOF.
pub async fn read_request_head<R: AsyncRead + Unpin + ?Sized>(
    stream: &mut R,
) -> Result<Option<(RequestHead, Vec<u8>)>, ProxyError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::Malformed("request head too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Malformed("truncated request head".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_text = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| ProxyError::Malformed("non-UTF-8 request head".into()))?;
    let head = parse_head(head_text)?;
    let leftover = buf[head_end + 4..].to_vec();
    Ok(Some((head, leftover)))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(text: &str) -> Result<RequestHead, ProxyError> {
    let mut lines = text.split("\r\n");
    let start = lines
        .next()
        .ok_or_else(|| ProxyError::Malformed("empty request".into()))?;
    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::Malformed("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::Malformed("missing request target".into()))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::Malformed("missing HTTP version".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Malformed(format!("malformed header: {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Extract destination host and port. CONNECT targets are `host:port`;
/// absolute-form targets carry a URL whose scheme picks the default port.
pub fn target_host_port(head: &RequestHead, is_connect: bool) -> Result<(String, u16), ProxyError> {
    if is_connect {
        return split_host_port(&head.target, DEFAULT_HTTPS_PORT);
    }

    let (scheme, rest) = match head.target.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        // Origin-form: fall back to the Host header
        None => {
            let host = head
                .header("Host")
                .ok_or_else(|| ProxyError::Malformed("missing Host header".into()))?;
            return split_host_port(host, DEFAULT_HTTP_PORT);
        }
    };

    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let default_port = if scheme == "https" {
        DEFAULT_HTTPS_PORT
    } else {
        DEFAULT_HTTP_PORT
    };
    split_host_port(authority, default_port)
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    // Bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::Malformed(format!("bad authority: {}", authority)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| ProxyError::Malformed(format!("bad port in {}", authority)))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| ProxyError::Malformed(format!("bad port in {}", authority)))?;
            Ok((host.to_string(), port))
        }
        // No port, or an unbracketed IPv6 literal
        _ => Ok((authority.to_string(), default_port)),
    }
}

/// Rebuild the request in origin form for replay upstream: start line with
/// the URL reduced to its path, original headers minus proxy hop headers,
/// then any body bytes that were read along with the head.
pub fn reconstruct_request(head: &RequestHead, leftover: &[u8]) -> Vec<u8> {
    let path = match head.target.split_once("://") {
        Some((_, rest)) => match rest.find(['/', '?']) {
            Some(pos) if rest.as_bytes()[pos] == b'/' => &rest[pos..],
            Some(pos) => &rest[pos..],
            None => "/",
        },
        None => head.target.as_str(),
    };

    let mut out = Vec::with_capacity(256 + leftover.len());
    out.extend_from_slice(format!("{} {} {}\r\n", head.method, path, head.version).as_bytes());
    for (name, value) in &head.headers {
        if name.to_ascii_lowercase().starts_with("proxy-") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(leftover);
    out
}

async fn write_response<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
    code: u16,
    reason: &str,
    body: &str,
) -> Result<(), ProxyError> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len() + 1,
        format_args!("{}\n", body),
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// A stream whose first reads re-emit a prefix before live bytes from the
/// inner connection. Writes pass straight through.
pub struct PrefixedStream {
    prefix: Bytes,
    inner: Box<dyn ProxyStream>,
}

impl PrefixedStream {
    pub fn new(prefix: Bytes, inner: Box<dyn ProxyStream>) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            let _ = self.prefix.split_to(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(raw: &str) -> (RequestHead, Vec<u8>) {
        let mut cursor = std::io::Cursor::new(raw.as_bytes().to_vec());
        futures_block(read_request_head(&mut cursor)).unwrap().unwrap()
    }

    fn futures_block<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn parses_connect_request() {
        let (head, leftover) =
            head_of("CONNECT ex.com:443 HTTP/1.1\r\nHost: ex.com:443\r\n\r\n");
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "ex.com:443");
        assert!(leftover.is_empty());
        let (host, port) = target_host_port(&head, true).unwrap();
        assert_eq!(host, "ex.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn connect_without_port_defaults_to_https() {
        let (head, _) = head_of("CONNECT ex.com HTTP/1.1\r\n\r\n");
        let (host, port) = target_host_port(&head, true).unwrap();
        assert_eq!(host, "ex.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn absolute_form_defaults_by_scheme() {
        let (head, _) = head_of("GET http://ex.com/path HTTP/1.1\r\nHost: ex.com\r\n\r\n");
        let (host, port) = target_host_port(&head, false).unwrap();
        assert_eq!(host, "ex.com");
        assert_eq!(port, 80);

        let (head, _) = head_of("GET https://ex.com/ HTTP/1.1\r\nHost: ex.com\r\n\r\n");
        let (_, port) = target_host_port(&head, false).unwrap();
        assert_eq!(port, 443);
    }

    #[test]
    fn explicit_port_wins() {
        let (head, _) = head_of("GET http://ex.com:8080/x HTTP/1.1\r\n\r\n");
        let (host, port) = target_host_port(&head, false).unwrap();
        assert_eq!(host, "ex.com");
        assert_eq!(port, 8080);
    }

    #[test]
    fn body_bytes_are_preserved() {
        let (head, leftover) = head_of(
            "POST http://ex.com/submit HTTP/1.1\r\nContent-Length: 4\r\n\r\nBODY",
        );
        assert_eq!(head.method, "POST");
        assert_eq!(leftover, b"BODY");
    }

    #[test]
    fn reconstructs_origin_form() {
        let (head, leftover) = head_of(
            "GET http://ex.com/a/b?q=1 HTTP/1.1\r\nHost: ex.com\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
        );
        let bytes = reconstruct_request(&head, &leftover);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: ex.com\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(!text.contains("Proxy-Connection"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn bare_host_reconstructs_root_path() {
        let (head, _) = head_of("GET http://ex.com HTTP/1.1\r\nHost: ex.com\r\n\r\n");
        let bytes = reconstruct_request(&head, &[]);
        assert!(String::from_utf8(bytes).unwrap().starts_with("GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn detects_connect_ip_upgrade() {
        let (head, _) = head_of(
            "GET https://proxy/.well-known/masque/ip/ HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: connect-ip\r\nCapsule-Protocol: ?1\r\n\r\n",
        );
        assert!(is_connect_ip_upgrade(&head));
        assert_eq!(head.header("Capsule-Protocol"), Some("?1"));
    }

    #[test]
    fn ipv6_authority() {
        let (host, port) = split_host_port("[fd00::1]:8080", 80).unwrap();
        assert_eq!(host, "fd00::1");
        assert_eq!(port, 8080);
        let (host, port) = split_host_port("[fd00::1]", 80).unwrap();
        assert_eq!(host, "fd00::1");
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn prefixed_stream_replays_before_live_bytes() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let mut wrapped = PrefixedStream::new(
            Bytes::from_static(b"PREFIX"),
            Box::new(ours) as Box<dyn ProxyStream>,
        );

        theirs.write_all(b"LIVE").await.unwrap();
        let mut buf = [0u8; 6];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PREFIX");
        let mut buf = [0u8; 4];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"LIVE");
    }
}
