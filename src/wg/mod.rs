//! WireGuard engine driver
//!
//! Owns the strictly ordered activation sequence: bootstrap-resolve peer
//! endpoints, render the IPC document, bind the device to the netstack
//! TUN, bring it up, wait for the first handshake, then prove end-to-end
//! connectivity with an HTTP HEAD through the tunnel.

pub mod device;
pub mod ipc;

pub use device::Device;
pub use ipc::ObfuscationParams;

use crate::config::Configuration;
use crate::netstack::{StackError, TunChannel, VirtualTun};
use crate::proxy::Network;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default connectivity test URL
pub const DEFAULT_TEST_URL: &str = "https://1.1.1.1/cdn-cgi/trace/";

/// Bootstrap resolver for peer endpoints, reached over the host network
pub const BOOTSTRAP_RESOLVER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(1, 1, 1, 1));

/// Hard deadline for the first handshake
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(15);

/// Hard deadline for the connectivity probe
pub const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Interval between handshake status polls
const HANDSHAKE_POLL: Duration = Duration::from_secs(1);

/// Pause between failed probe attempts
const PROBE_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// WireGuard engine errors
#[derive(Debug, Error)]
pub enum WgError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid IPC configuration: {0}")]
    Ipc(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("handshake did not complete within {}s", HANDSHAKE_DEADLINE.as_secs())]
    HandshakeTimeout,

    #[error("connectivity probe failed: {0}")]
    ProbeFailed(String),

    #[error("netstack error: {0}")]
    Stack(#[from] StackError),

    #[error("cancelled")]
    Cancelled,
}

/// Resolve peer endpoints once through the bootstrap resolver, before the
/// tunnel exists. Failures keep the original endpoint string; the device
/// layer retries through the host resolver when it comes up.
pub async fn resolve_endpoints(conf: &mut Configuration, resolver_addr: IpAddr) {
    let resolver = TokioAsyncResolver::tokio(
        ResolverConfig::from_parts(
            None,
            Vec::new(),
            NameServerConfigGroup::from_ips_clear(&[resolver_addr], 53, true),
        ),
        ResolverOpts::default(),
    );

    for peer in &mut conf.peers {
        let Some(endpoint) = peer.endpoint.clone() else {
            continue;
        };
        if endpoint.parse::<std::net::SocketAddr>().is_ok() {
            continue;
        }
        let Some((host, port)) = split_endpoint(&endpoint) else {
            warn!(endpoint, "unparseable peer endpoint, leaving as-is");
            continue;
        };

        match resolver.lookup_ip(host).await {
            Ok(response) => {
                if let Some(ip) = response.iter().next() {
                    let resolved = match ip {
                        IpAddr::V4(v4) => format!("{}:{}", v4, port),
                        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
                    };
                    debug!(endpoint, resolved, "peer endpoint resolved at bootstrap");
                    peer.endpoint = Some(resolved);
                }
            }
            Err(err) => {
                warn!(
                    endpoint,
                    "bootstrap resolution failed, keeping original: {}", err
                );
            }
        }
    }
}

fn split_endpoint(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let host = host.strip_prefix('[').unwrap_or(host);
    let host = host.strip_suffix(']').unwrap_or(host);
    Some((host, port.parse().ok()?))
}

/// The activation sequence of the engine. On handshake or probe failure
/// the device is closed before the error is returned, so no tunnel state
/// outlives a failed startup.
pub async fn establish(
    conf: &Configuration,
    tun_channel: TunChannel,
    vtun: &VirtualTun,
    test_url: &str,
    token: &CancellationToken,
) -> Result<Device, WgError> {
    let doc = ipc::render(conf);

    let device = Device::new(tun_channel, token.child_token()).await?;
    device.ipc_set(&doc)?;
    device.up().await?;

    if let Err(err) = wait_handshake(&device, token).await {
        device.close();
        return Err(err);
    }

    if let Err(err) = connectivity_probe(vtun, test_url, token).await {
        device.close();
        return Err(err);
    }

    info!("WireGuard tunnel established and verified");
    Ok(device)
}

/// Poll the device status at 1 Hz until any peer reports a nonzero
/// `last_handshake_time_sec`, with a 15 second hard deadline.
pub async fn wait_handshake(device: &Device, token: &CancellationToken) -> Result<(), WgError> {
    debug!("waiting for WireGuard handshake");
    let wait = async {
        loop {
            if handshake_completed(&device.ipc_get()) {
                debug!("handshake completed");
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(WgError::Cancelled),
                _ = tokio::time::sleep(HANDSHAKE_POLL) => {}
            }
        }
    };

    match tokio::time::timeout(HANDSHAKE_DEADLINE, wait).await {
        Ok(result) => result,
        Err(_) => Err(WgError::HandshakeTimeout),
    }
}

/// True when any peer in a status document has completed a handshake
pub(crate) fn handshake_completed(status: &str) -> bool {
    status.lines().any(|line| {
        line.strip_prefix("last_handshake_time_sec=")
            .is_some_and(|v| v != "0")
    })
}

/// Issue HTTP HEAD requests through the tunnel until one returns 200 or
/// the 10 second deadline passes. Non-200 responses and transport errors
/// are both retryable.
pub async fn connectivity_probe(
    vtun: &VirtualTun,
    url: &str,
    token: &CancellationToken,
) -> Result<(), WgError> {
    let target = ProbeTarget::parse(url)?;
    debug!(url, "starting connectivity probe");

    let attempt_loop = async {
        loop {
            if token.is_cancelled() {
                return Err(WgError::Cancelled);
            }
            match probe_once(vtun, &target).await {
                Ok(200) => {
                    debug!("connectivity probe succeeded");
                    return Ok(());
                }
                Ok(code) => debug!(code, "probe returned non-OK status, retrying"),
                Err(err) => debug!("probe attempt failed, retrying: {}", err),
            }
            tokio::time::sleep(PROBE_RETRY_PAUSE).await;
        }
    };

    match tokio::time::timeout(PROBE_DEADLINE, attempt_loop).await {
        Ok(result) => result,
        Err(_) => Err(WgError::ProbeFailed(format!(
            "no successful response from {} within {}s",
            url,
            PROBE_DEADLINE.as_secs()
        ))),
    }
}

struct ProbeTarget {
    tls: bool,
    host: String,
    port: u16,
    path: String,
}

impl ProbeTarget {
    fn parse(url: &str) -> Result<Self, WgError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| WgError::ProbeFailed(format!("unparseable test URL {:?}", url)))?;
        let tls = match scheme {
            "http" => false,
            "https" => true,
            other => {
                return Err(WgError::ProbeFailed(format!(
                    "unsupported test URL scheme {:?}",
                    other
                )))
            }
        };
        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], rest[pos..].to_string()),
            None => (rest, "/".to_string()),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (
                host.to_string(),
                port.parse().map_err(|_| {
                    WgError::ProbeFailed(format!("bad port in test URL {:?}", url))
                })?,
            ),
            _ => (
                authority.trim_matches(['[', ']']).to_string(),
                if tls { 443 } else { 80 },
            ),
        };
        Ok(Self {
            tls,
            host,
            port,
            path,
        })
    }
}

async fn probe_once(vtun: &VirtualTun, target: &ProbeTarget) -> Result<u16, WgError> {
    let ip = vtun.resolve(&target.host, Network::Tcp).await?;
    let stream = vtun
        .dial_tcp(std::net::SocketAddr::new(ip, target.port))
        .await?;

    if target.tls {
        let connector = tls_connector();
        let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
            .map_err(|e| WgError::ProbeFailed(format!("bad server name: {}", e)))?;
        let mut tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| WgError::ProbeFailed(format!("TLS handshake: {}", e)))?;
        head_request(&mut tls, &target.host, &target.path).await
    } else {
        let mut stream = stream;
        head_request(&mut stream, &target.host, &target.path).await
    }
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    // First call installs the ring provider; later calls are no-ops
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Write a HEAD request and parse the status code off the response line
async fn head_request<S>(stream: &mut S, host: &str, path: &str) -> Result<u16, WgError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: wgbridge/{}\r\nConnection: close\r\n\r\n",
        path,
        host,
        crate::VERSION
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n") && response.len() < 1024 {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        response.push(byte[0]);
    }

    parse_status_line(&response)
        .ok_or_else(|| WgError::ProbeFailed("malformed probe response".into()))
}

fn parse_status_line(line: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_completed_handshake() {
        assert!(!handshake_completed(
            "public_key=ab\nlast_handshake_time_sec=0\nerrno=0\n"
        ));
        assert!(handshake_completed(
            "public_key=ab\nlast_handshake_time_sec=1712345678\nerrno=0\n"
        ));
        assert!(!handshake_completed("errno=0\n"));
    }

    #[test]
    fn parses_probe_targets() {
        let target = ProbeTarget::parse("https://1.1.1.1/cdn-cgi/trace/").unwrap();
        assert!(target.tls);
        assert_eq!(target.host, "1.1.1.1");
        assert_eq!(target.port, 443);
        assert_eq!(target.path, "/cdn-cgi/trace/");

        let target = ProbeTarget::parse("http://probe.test:8080").unwrap();
        assert!(!target.tls);
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/");

        assert!(ProbeTarget::parse("ftp://x/").is_err());
        assert!(ProbeTarget::parse("not a url").is_err());
    }

    #[test]
    fn parses_status_lines() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.1 503 Unavailable\r\n"), Some(503));
        assert_eq!(parse_status_line(b"garbage"), None);
    }

    #[test]
    fn splits_endpoints() {
        assert_eq!(split_endpoint("vpn.test:51820"), Some(("vpn.test", 51820)));
        assert_eq!(split_endpoint("[fd00::1]:51820"), Some(("fd00::1", 51820)));
        assert_eq!(split_endpoint("no-port"), None);
    }
}
