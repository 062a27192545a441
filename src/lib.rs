//! # wgbridge
//!
//! A userspace VPN-to-proxy gateway. wgbridge terminates an AmneziaWG
//! (obfuscated WireGuard) tunnel entirely in user space, attaches it to an
//! in-process TCP/IP stack, and exposes local SOCKS4/4a/5 and HTTP proxy
//! endpoints so applications can route selected flows through the tunnel
//! without touching the host network configuration.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Proxy Front-Ends                     │
//! │    (SOCKS4/4a + SOCKS5 demux, HTTP CONNECT)          │
//! ├─────────────────────────────────────────────────────┤
//! │                    Forwarder                         │
//! │      (dial-through-tunnel + bidirectional pump)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Virtual Netstack                    │
//! │        (userspace TCP/IP, dial / listen_packet)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 WireGuard Device                     │
//! │   (Noise handshake, rekey, keepalive, junk burst)    │
//! ├─────────────────────────────────────────────────────┤
//! │                   UDP Transport                      │
//! │              (host socket to the peer)               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod forward;
pub mod gateway;
pub mod netstack;
pub mod proxy;
pub mod wg;

pub use config::Configuration;
pub use gateway::Gateway;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Netstack error: {0}")]
    Stack(#[from] netstack::StackError),

    #[error("WireGuard error: {0}")]
    Wg(#[from] wg::WgError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("No proxy listeners configured")]
    NoListeners,
}
