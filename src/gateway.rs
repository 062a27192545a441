//! Lifecycle orchestrator
//!
//! Owns the whole run: keepalive and endpoint preparation, netstack and
//! device bring-up (handshake + probe), listener binding, the front-door
//! accept loops, and ordered teardown on cancellation.

use crate::config::Configuration;
use crate::forward::Forwarder;
use crate::netstack::VirtualTun;
use crate::proxy::socks5::Credentials;
use crate::proxy::FrontDoor;
use crate::wg;
use crate::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Minimum keepalive applied to peers that did not configure one
const KEEPALIVE_FLOOR: u16 = 5;

/// The gateway engine: tunnel underneath, proxies on top
pub struct Gateway {
    conf: Configuration,
    socks_bind: Option<SocketAddr>,
    http_bind: Option<SocketAddr>,
    test_url: String,
    credentials: Option<Credentials>,
    token: CancellationToken,
}

impl Gateway {
    pub fn new(conf: Configuration) -> Self {
        Self {
            conf,
            socks_bind: None,
            http_bind: None,
            test_url: wg::DEFAULT_TEST_URL.to_string(),
            credentials: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_socks_bind(mut self, addr: SocketAddr) -> Self {
        self.socks_bind = Some(addr);
        self
    }

    pub fn with_http_bind(mut self, addr: SocketAddr) -> Self {
        self.http_bind = Some(addr);
        self
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Token that stops the gateway; wire it to the process signal source
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Run until cancelled. Startup errors (config, tunnel, listeners)
    /// surface before any listener accepts traffic.
    pub async fn run(&self) -> Result<(), Error> {
        if self.socks_bind.is_none() && self.http_bind.is_none() {
            return Err(Error::NoListeners);
        }

        let mut conf = self.conf.clone();

        // Keepalive floor applies only where the user left it unset;
        // parsed values are authoritative.
        for peer in &mut conf.peers {
            if peer.keepalive == 0 {
                debug!(keepalive = KEEPALIVE_FLOOR, "applying keepalive floor");
                peer.keepalive = KEEPALIVE_FLOOR;
            }
        }

        wg::resolve_endpoints(&mut conf, wg::BOOTSTRAP_RESOLVER).await;

        let (vtun, tun_channel) = VirtualTun::new(
            conf.interface.addresses.clone(),
            conf.interface.dns.clone(),
            conf.interface.mtu,
            self.token.child_token(),
        )?;

        info!("establishing WireGuard tunnel");
        let device = wg::establish(&conf, tun_channel, &vtun, &self.test_url, &self.token).await?;

        let forwarder = Arc::new(Forwarder::new(
            Arc::new(vtun.clone()),
            self.token.child_token(),
        ));

        // Listeners bind only after the tunnel is proven, so a failed
        // handshake never leaves ports open
        let front_door = FrontDoor::bind(
            forwarder,
            self.socks_bind,
            self.http_bind,
            self.credentials.clone(),
            self.token.child_token(),
        )
        .await?;

        let front_task = tokio::spawn(front_door.run());

        info!("gateway is running, waiting for shutdown signal");
        self.token.cancelled().await;

        info!("shutdown requested, draining");
        let _ = front_task.await;
        device.close();

        info!("gateway stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_conf() -> Configuration {
        Configuration::parse(
            "
[Interface]
PrivateKey = dGhpcyBpcyBhIHRlc3QgcHJpdmF0ZSBleS4uLi4uLi4=
Address = 10.0.0.2

[Peer]
PublicKey = dGhpcyBpcyBhIHRlc3QgcHVibGljIGtleS4uLi4uLi4=
AllowedIPs = 0.0.0.0/0
Endpoint = 192.0.2.1:51820",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn refuses_to_run_without_listeners() {
        let gateway = Gateway::new(minimal_conf());
        assert!(matches!(gateway.run().await, Err(Error::NoListeners)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let gateway = Gateway::new(minimal_conf());
        gateway.shutdown();
        gateway.shutdown();
        assert!(gateway.cancel_token().is_cancelled());
    }
}
