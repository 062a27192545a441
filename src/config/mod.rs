//! Tunnel configuration
//!
//! Parses the INI-flavoured wg-quick syntax: one `[Interface]` section, one
//! or more `[Peer]` sections, case-insensitive section and key names,
//! repeated keys and comma-joined values both accepted for list-valued keys.
//!
//! Bare addresses widen to host prefixes (`10.0.0.1` becomes `10.0.0.1/32`,
//! `fd00::1` becomes `fd00::1/128`); explicit prefixes are preserved.

mod key;

pub use key::{Key, KEY_LEN};

use ipnet::IpNet;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

/// Default interface MTU when the config does not specify one
pub const DEFAULT_MTU: usize = 1330;

/// Configuration errors, all fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("malformed line {0}: {1:?}")]
    MalformedLine(usize, String),

    #[error("unexpected section [{0}]")]
    UnknownSection(String),

    #[error("key {0:?} outside of any section")]
    KeyOutsideSection(String),

    #[error("exactly one [Interface] section is expected")]
    InterfaceCount,

    #[error("at least one [Peer] section is expected")]
    NoPeers,

    #[error("PrivateKey must not be empty")]
    MissingPrivateKey,

    #[error("PublicKey must not be empty")]
    MissingPublicKey,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key should be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid integer value {0:?}")]
    InvalidInt(String),
}

/// The `[Interface]` section
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: Key,
    pub addresses: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub mtu: usize,
    pub fwmark: u32,
}

/// A `[Peer]` section
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: Key,
    /// Defaults to the all-zero key when absent
    pub preshared_key: Key,
    /// `host:port`; the host may be a DNS name resolved at activation time
    pub endpoint: Option<String>,
    /// Persistent keepalive in seconds, 0 disables
    pub keepalive: u16,
    pub allowed_ips: Vec<IpNet>,
}

/// A parsed tunnel configuration: one interface, one or more peers
#[derive(Debug, Clone)]
pub struct Configuration {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

impl Configuration {
    /// Load and parse a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a configuration document
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let sections = split_sections(content)?;

        let interfaces: Vec<_> = sections
            .iter()
            .filter(|s| s.name.eq_ignore_ascii_case("interface"))
            .collect();
        if interfaces.len() != 1 {
            return Err(ConfigError::InterfaceCount);
        }
        let interface = parse_interface(interfaces[0])?;

        let peer_sections: Vec<_> = sections
            .iter()
            .filter(|s| s.name.eq_ignore_ascii_case("peer"))
            .collect();
        if peer_sections.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        let peers = peer_sections
            .iter()
            .map(|s| parse_peer(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { interface, peers })
    }

    /// Re-encode into a canonical document such that `parse(to_ini(c))` is
    /// equivalent to `c`. Keys are emitted as base64; an all-zero pre-shared
    /// key is omitted.
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!(
            "PrivateKey = {}\n",
            self.interface.private_key.to_base64()
        ));
        if !self.interface.addresses.is_empty() {
            let addrs: Vec<String> = self
                .interface
                .addresses
                .iter()
                .map(|p| p.to_string())
                .collect();
            out.push_str(&format!("Address = {}\n", addrs.join(",")));
        }
        if !self.interface.dns.is_empty() {
            let dns: Vec<String> = self.interface.dns.iter().map(|a| a.to_string()).collect();
            out.push_str(&format!("DNS = {}\n", dns.join(",")));
        }
        if self.interface.mtu != DEFAULT_MTU {
            out.push_str(&format!("MTU = {}\n", self.interface.mtu));
        }
        if self.interface.fwmark != 0 {
            out.push_str(&format!("FwMark = {}\n", self.interface.fwmark));
        }
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key.to_base64()));
            if !peer.preshared_key.is_zero() {
                out.push_str(&format!(
                    "PreSharedKey = {}\n",
                    peer.preshared_key.to_base64()
                ));
            }
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {}\n", endpoint));
            }
            if !peer.allowed_ips.is_empty() {
                let ips: Vec<String> = peer.allowed_ips.iter().map(|p| p.to_string()).collect();
                out.push_str(&format!("AllowedIPs = {}\n", ips.join(",")));
            }
            if peer.keepalive != 0 {
                out.push_str(&format!("PersistentKeepalive = {}\n", peer.keepalive));
            }
        }
        out
    }
}

/// A raw section: ordered key/value pairs with repeats preserved
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    /// First value for a key, case-insensitive
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a key, with each value additionally split on commas
    /// (the "comma-shadowed" form: repeated keys and comma lists are both
    /// accepted and equivalent)
    fn get_list(&self, key: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .flat_map(|(_, v)| v.split(','))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn split_sections(content: &str) -> Result<Vec<Section>, ConfigError> {
    let mut sections: Vec<Section> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| ConfigError::MalformedLine(idx + 1, raw.to_string()))?
                .trim()
                .to_string();
            if !name.eq_ignore_ascii_case("interface") && !name.eq_ignore_ascii_case("peer") {
                return Err(ConfigError::UnknownSection(name));
            }
            sections.push(Section {
                name,
                entries: Vec::new(),
            });
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::MalformedLine(idx + 1, raw.to_string()))?;
        let key = key.trim().to_string();
        let value = unquote(value.trim()).to_string();

        match sections.last_mut() {
            Some(section) => section.entries.push((key, value)),
            None => return Err(ConfigError::KeyOutsideSection(key)),
        }
    }

    Ok(sections)
}

fn strip_comment(line: &str) -> &str {
    match line.find([';', '#']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parse an address that may be bare (`10.0.0.1`) or prefixed
/// (`192.168.1.5/24`); bare addresses widen to /32 or /128.
pub fn parse_prefix(s: &str) -> Result<IpNet, ConfigError> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    let addr: IpAddr = s
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
    let width = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(addr, width).map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

fn parse_interface(section: &Section) -> Result<InterfaceConfig, ConfigError> {
    let private_key = section
        .get("PrivateKey")
        .ok_or(ConfigError::MissingPrivateKey)
        .and_then(Key::from_base64)?;

    let addresses = section
        .get_list("Address")
        .iter()
        .map(|s| parse_prefix(s))
        .collect::<Result<Vec<_>, _>>()?;

    let dns = section
        .get_list("DNS")
        .iter()
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidAddress(s.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mtu = match section.get("MTU") {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|&v| v > 0)
            .ok_or_else(|| ConfigError::InvalidInt(raw.to_string()))?,
        None => DEFAULT_MTU,
    };

    let fwmark = match section.get("FwMark") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidInt(raw.to_string()))?,
        None => 0,
    };

    Ok(InterfaceConfig {
        private_key,
        addresses,
        dns,
        mtu,
        fwmark,
    })
}

fn parse_peer(section: &Section) -> Result<PeerConfig, ConfigError> {
    let public_key = section
        .get("PublicKey")
        .ok_or(ConfigError::MissingPublicKey)
        .and_then(Key::from_base64)?;

    let preshared_key = match section.get("PreSharedKey") {
        Some(raw) => Key::from_base64(raw)?,
        None => Key::ZERO,
    };

    let keepalive = match section.get("PersistentKeepalive") {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidInt(raw.to_string()))?,
        None => 0,
    };

    let allowed_ips = section
        .get_list("AllowedIPs")
        .iter()
        .map(|s| parse_prefix(s))
        .collect::<Result<Vec<_>, _>>()?;

    let endpoint = section.get("Endpoint").map(|s| s.to_string());

    Ok(PeerConfig {
        public_key,
        preshared_key,
        endpoint,
        keepalive,
        allowed_ips,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conf_without_subnet() {
        let config = "
[Interface]
PrivateKey = dGhpcyBpcyBhIHRlc3QgcHJpdmF0ZSBleS4uLi4uLi4=
Address = 10.10.0.1
DNS = 8.8.8.8

[Peer]
PublicKey = dGhpcyBpcyBhIHRlc3QgcHVibGljIGtleS4uLi4uLi4=
AllowedIPs = 0.0.0.0/0
Endpoint = 1.2.3.4:51820
PersistentKeepalive = 25";

        let conf = Configuration::parse(config).unwrap();
        assert_eq!(conf.interface.addresses, vec!["10.10.0.1/32".parse().unwrap()]);
        assert_eq!(conf.interface.dns, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
        assert_eq!(conf.interface.mtu, DEFAULT_MTU);
        assert_eq!(conf.peers.len(), 1);
        assert_eq!(conf.peers[0].keepalive, 25);
        assert_eq!(conf.peers[0].endpoint.as_deref(), Some("1.2.3.4:51820"));
        assert!(conf.peers[0].preshared_key.is_zero());
    }

    #[test]
    fn conf_with_subnet() {
        let config = "
[Interface]
PrivateKey = anotherkeyanotherkeyanotherkeyanotherkeynow=
Address = 192.168.1.5/24
DNS = 8.8.4.4

[Peer]
PublicKey = onemorekeyonemorekeyonemorekeyonemorekeynow=
AllowedIPs = 192.168.1.0/24
Endpoint = 5.6.7.8:51820
PersistentKeepalive = 15";

        let conf = Configuration::parse(config).unwrap();
        assert_eq!(
            conf.interface.addresses,
            vec!["192.168.1.5/24".parse().unwrap()]
        );
    }

    #[test]
    fn conf_with_many_addresses() {
        let config = "
[Interface]
PrivateKey = anotherkeyanotherkeyanotherkeyanotherkeynow=
Address = 172.16.0.100/32,fd00::100/128
DNS = 208.67.222.222,208.67.220.220

[Peer]
PublicKey = \"BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB=\"
AllowedIPs = 0.0.0.0/0,::/0
Endpoint = 9.9.9.9:51820";

        let conf = Configuration::parse(config).unwrap();
        assert_eq!(conf.interface.addresses.len(), 2);
        assert_eq!(conf.interface.dns.len(), 2);
        assert_eq!(conf.peers[0].allowed_ips.len(), 2);
        assert_eq!(conf.peers[0].keepalive, 0);
    }

    #[test]
    fn case_insensitive_and_repeated_keys() {
        let config = "
[interface]
privatekey = anotherkeyanotherkeyanotherkeyanotherkeynow=
address = 10.0.0.1
ADDRESS = 10.0.0.2/31

[PEER]
publickey = onemorekeyonemorekeyonemorekeyonemorekeynow=
allowedips = 10.0.0.0/8
allowedips = 172.16.0.0/12";

        let conf = Configuration::parse(config).unwrap();
        assert_eq!(conf.interface.addresses.len(), 2);
        assert_eq!(conf.interface.addresses[0], "10.0.0.1/32".parse().unwrap());
        assert_eq!(conf.peers[0].allowed_ips.len(), 2);
    }

    #[test]
    fn bare_ipv6_widens() {
        assert_eq!(parse_prefix("fd00::1").unwrap(), "fd00::1/128".parse().unwrap());
        assert_eq!(
            parse_prefix("10.1.2.3/8").unwrap(),
            "10.1.2.3/8".parse().unwrap()
        );
    }

    #[test]
    fn requires_single_interface() {
        let config = "
[Peer]
PublicKey = onemorekeyonemorekeyonemorekeyonemorekeynow=";
        assert!(matches!(
            Configuration::parse(config),
            Err(ConfigError::InterfaceCount)
        ));
    }

    #[test]
    fn requires_a_peer() {
        let config = "
[Interface]
PrivateKey = anotherkeyanotherkeyanotherkeyanotherkeynow=";
        assert!(matches!(
            Configuration::parse(config),
            Err(ConfigError::NoPeers)
        ));
    }

    #[test]
    fn round_trip_is_equivalent() {
        let config = "
[Interface]
PrivateKey = anotherkeyanotherkeyanotherkeyanotherkeynow=
Address = 172.16.0.100/32,fd00::100/128
DNS = 1.1.1.1
MTU = 1280
FwMark = 51820

[Peer]
PublicKey = onemorekeyonemorekeyonemorekeyonemorekeynow=
PreSharedKey = dGhpcyBpcyBhIHRlc3QgcHJpdmF0ZSBleS4uLi4uLi4=
AllowedIPs = 0.0.0.0/0,::/0
Endpoint = example.com:51820
PersistentKeepalive = 25";

        let first = Configuration::parse(config).unwrap();
        let second = Configuration::parse(&first.to_ini()).unwrap();

        assert_eq!(
            first.interface.private_key,
            second.interface.private_key
        );
        assert_eq!(first.interface.addresses, second.interface.addresses);
        assert_eq!(first.interface.dns, second.interface.dns);
        assert_eq!(first.interface.mtu, second.interface.mtu);
        assert_eq!(first.interface.fwmark, second.interface.fwmark);
        assert_eq!(first.peers.len(), second.peers.len());
        assert_eq!(first.peers[0].public_key, second.peers[0].public_key);
        assert_eq!(first.peers[0].preshared_key, second.peers[0].preshared_key);
        assert_eq!(first.peers[0].endpoint, second.peers[0].endpoint);
        assert_eq!(first.peers[0].allowed_ips, second.peers[0].allowed_ips);
        assert_eq!(first.peers[0].keepalive, second.peers[0].keepalive);
    }

    #[test]
    fn zero_psk_omitted_on_emit() {
        let config = "
[Interface]
PrivateKey = anotherkeyanotherkeyanotherkeyanotherkeynow=

[Peer]
PublicKey = onemorekeyonemorekeyonemorekeyonemorekeynow=";
        let conf = Configuration::parse(config).unwrap();
        assert!(!conf.to_ini().contains("PreSharedKey"));
    }
}
