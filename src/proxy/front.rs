//! Front-door listeners
//!
//! One TCP listener serves both SOCKS protocols: the first byte of each
//! accepted connection is peeked without being consumed, `0x05` dispatches
//! to SOCKS5, `0x04` to SOCKS4, anything else is closed. HTTP runs on an
//! independent listener. Either may be disabled, but not both.

use super::http::HttpServer;
use super::socks4::Socks4Server;
use super::socks5::{Credentials, Socks5Server};
use super::{ProxyError, ProxyStream};
use crate::forward::Forwarder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Front-door configuration and listeners
pub struct FrontDoor {
    socks: Option<TcpListener>,
    http: Option<TcpListener>,
    socks5: Arc<Socks5Server>,
    socks4: Arc<Socks4Server>,
    http_server: Arc<HttpServer>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl FrontDoor {
    /// Bind the configured listeners. Fails when both binds are disabled or
    /// when a requested bind cannot be acquired.
    pub async fn bind(
        forwarder: Arc<Forwarder>,
        socks_bind: Option<SocketAddr>,
        http_bind: Option<SocketAddr>,
        credentials: Option<Credentials>,
        token: CancellationToken,
    ) -> Result<Self, crate::Error> {
        if socks_bind.is_none() && http_bind.is_none() {
            return Err(crate::Error::NoListeners);
        }

        let socks = match socks_bind {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!(addr = %listener.local_addr()?, "SOCKS proxy listening");
                Some(listener)
            }
            None => None,
        };

        let http = match http_bind {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!(addr = %listener.local_addr()?, "HTTP proxy listening");
                Some(listener)
            }
            None => None,
        };

        let mut socks5 = Socks5Server::new(Arc::clone(&forwarder));
        if let Some(credentials) = credentials {
            socks5 = socks5.with_credentials(credentials);
        }

        Ok(Self {
            socks,
            http,
            socks5: Arc::new(socks5),
            socks4: Arc::new(Socks4Server::new(Arc::clone(&forwarder))),
            http_server: Arc::new(HttpServer::new(forwarder)),
            token,
            tracker: TaskTracker::new(),
        })
    }

    /// Local address of the SOCKS listener, when enabled
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Local address of the HTTP listener, when enabled
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Run both accept loops until cancellation, then wait for in-flight
    /// connection handlers to drain.
    pub async fn run(self) {
        let Self {
            socks,
            http,
            socks5,
            socks4,
            http_server,
            token,
            tracker,
        } = self;

        let mut loops = Vec::new();

        if let Some(listener) = socks {
            let socks5 = Arc::clone(&socks5);
            let socks4 = Arc::clone(&socks4);
            let token = token.clone();
            let tracker = tracker.clone();
            loops.push(tokio::spawn(async move {
                socks_accept_loop(listener, socks5, socks4, token, tracker).await;
            }));
        }

        if let Some(listener) = http {
            let http_server = Arc::clone(&http_server);
            let token = token.clone();
            let tracker = tracker.clone();
            loops.push(tokio::spawn(async move {
                http_accept_loop(listener, http_server, token, tracker).await;
            }));
        }

        for accept_loop in loops {
            let _ = accept_loop.await;
        }

        // Listeners are closed; wait for per-connection handlers
        tracker.close();
        tracker.wait().await;
        debug!("front door drained");
    }
}

async fn socks_accept_loop(
    listener: TcpListener,
    socks5: Arc<Socks5Server>,
    socks4: Arc<Socks4Server>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (conn, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("SOCKS accept failed: {}", err);
                    continue;
                }
            },
        };

        let socks5 = Arc::clone(&socks5);
        let socks4 = Arc::clone(&socks4);
        tracker.spawn(async move {
            if let Err(err) = dispatch_socks(conn, peer, socks5, socks4).await {
                debug!(%peer, "SOCKS connection ended: {}", err);
            }
        });
    }
    debug!("SOCKS accept loop stopped");
}

/// Peek the first byte without consuming it and hand the connection to the
/// matching protocol server.
async fn dispatch_socks(
    conn: TcpStream,
    peer: SocketAddr,
    socks5: Arc<Socks5Server>,
    socks4: Arc<Socks4Server>,
) -> Result<(), ProxyError> {
    let local = conn.local_addr()?;
    let mut first = [0u8; 1];
    let n = conn.peek(&mut first).await?;
    if n == 0 {
        return Ok(());
    }

    let stream: Box<dyn ProxyStream> = Box::new(conn);
    match first[0] {
        0x05 => {
            debug!(%peer, "detected SOCKS5");
            socks5.serve_conn(stream, local, peer).await
        }
        0x04 => {
            debug!(%peer, "detected SOCKS4");
            socks4.serve_conn(stream, peer).await
        }
        other => Err(ProxyError::InvalidVersion(other)),
    }
}

async fn http_accept_loop(
    listener: TcpListener,
    server: Arc<HttpServer>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (conn, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("HTTP accept failed: {}", err);
                    continue;
                }
            },
        };

        let server = Arc::clone(&server);
        tracker.spawn(async move {
            if let Err(err) = server.serve_conn(Box::new(conn), peer).await {
                debug!(%peer, "HTTP connection ended: {}", err);
            }
        });
    }
    debug!("HTTP accept loop stopped");
}
