//! Device IPC configuration document
//!
//! Line-oriented `key=value\n` text, peers delimited by `public_key=`
//! lines. The obfuscation block carries the fixed AmneziaWG parameter set;
//! with these values (s1=s2=0, h1..h4 = 1..4) the wire format reduces to
//! standard WireGuard preceded by a junk-packet burst.

use super::WgError;
use crate::config::{parse_prefix, Configuration, Key};
use ipnet::IpNet;

/// Fixed obfuscation parameter values written into every IPC document
pub const JC: u8 = 10;
pub const JMIN: u16 = 50;
pub const JMAX: u16 = 1000;
pub const S1: u16 = 0;
pub const S2: u16 = 0;
pub const H1: u32 = 1;
pub const H2: u32 = 2;
pub const H3: u32 = 3;
pub const H4: u32 = 4;

/// AmneziaWG obfuscation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObfuscationParams {
    /// Junk packets sent before the handshake initiation
    pub jc: u8,
    /// Minimum junk packet size
    pub jmin: u16,
    /// Maximum junk packet size
    pub jmax: u16,
    /// Init packet junk prefix size
    pub s1: u16,
    /// Response packet junk prefix size
    pub s2: u16,
    /// Init packet message type
    pub h1: u32,
    /// Response packet message type
    pub h2: u32,
    /// Cookie packet message type
    pub h3: u32,
    /// Transport packet message type
    pub h4: u32,
}

impl Default for ObfuscationParams {
    fn default() -> Self {
        Self {
            jc: JC,
            jmin: JMIN,
            jmax: JMAX,
            s1: S1,
            s2: S2,
            h1: H1,
            h2: H2,
            h3: H3,
            h4: H4,
        }
    }
}

impl ObfuscationParams {
    /// Whether the parameters describe plain WireGuard framing after the
    /// junk burst (the only mode the device implements)
    pub fn is_standard_framing(&self) -> bool {
        self.s1 == 0 && self.s2 == 0 && (self.h1, self.h2, self.h3, self.h4) == (1, 2, 3, 4)
    }
}

/// Typed form of a parsed IPC document
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub private_key: Key,
    pub fwmark: u32,
    pub obfuscation: ObfuscationParams,
    pub peers: Vec<DevicePeer>,
}

#[derive(Debug, Clone)]
pub struct DevicePeer {
    pub public_key: Key,
    pub preshared_key: Key,
    pub endpoint: Option<String>,
    pub keepalive: u16,
    pub allowed_ips: Vec<IpNet>,
}

/// Render the IPC document for a tunnel configuration, in the exact key
/// order the device contract specifies.
pub fn render(conf: &Configuration) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "private_key={}\n",
        conf.interface.private_key.to_hex()
    ));
    if conf.interface.fwmark != 0 {
        out.push_str(&format!("fwmark={}\n", conf.interface.fwmark));
    }

    out.push_str(&format!("jc={}\n", JC));
    out.push_str(&format!("jmin={}\n", JMIN));
    out.push_str(&format!("jmax={}\n", JMAX));
    out.push_str(&format!("s1={}\n", S1));
    out.push_str(&format!("s2={}\n", S2));
    out.push_str(&format!("h1={}\n", H1));
    out.push_str(&format!("h2={}\n", H2));
    out.push_str(&format!("h3={}\n", H3));
    out.push_str(&format!("h4={}\n", H4));

    for peer in &conf.peers {
        out.push_str(&format!("public_key={}\n", peer.public_key.to_hex()));
        out.push_str(&format!(
            "persistent_keepalive_interval={}\n",
            peer.keepalive
        ));
        out.push_str(&format!("preshared_key={}\n", peer.preshared_key.to_hex()));
        if let Some(endpoint) = &peer.endpoint {
            out.push_str(&format!("endpoint={}\n", endpoint));
        }
        for prefix in &peer.allowed_ips {
            out.push_str(&format!("allowed_ip={}\n", prefix));
        }
    }

    out
}

/// Parse an IPC document back into its typed form. Unknown keys are an
/// error; this protocol has no room for silent drift.
pub fn parse(doc: &str) -> Result<DeviceConfig, WgError> {
    let mut private_key: Option<Key> = None;
    let mut fwmark = 0u32;
    let mut obfuscation = ObfuscationParams::default();
    let mut peers: Vec<DevicePeer> = Vec::new();

    for line in doc.lines() {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| WgError::Ipc(format!("malformed line {:?}", line)))?;

        match key {
            "private_key" => {
                private_key =
                    Some(Key::from_hex(value).map_err(|e| WgError::Ipc(e.to_string()))?)
            }
            "fwmark" => fwmark = parse_num(key, value)?,
            "jc" => obfuscation.jc = parse_num(key, value)?,
            "jmin" => obfuscation.jmin = parse_num(key, value)?,
            "jmax" => obfuscation.jmax = parse_num(key, value)?,
            "s1" => obfuscation.s1 = parse_num(key, value)?,
            "s2" => obfuscation.s2 = parse_num(key, value)?,
            "h1" => obfuscation.h1 = parse_num(key, value)?,
            "h2" => obfuscation.h2 = parse_num(key, value)?,
            "h3" => obfuscation.h3 = parse_num(key, value)?,
            "h4" => obfuscation.h4 = parse_num(key, value)?,
            "public_key" => peers.push(DevicePeer {
                public_key: Key::from_hex(value).map_err(|e| WgError::Ipc(e.to_string()))?,
                preshared_key: Key::ZERO,
                endpoint: None,
                keepalive: 0,
                allowed_ips: Vec::new(),
            }),
            "preshared_key" | "persistent_keepalive_interval" | "endpoint" | "allowed_ip" => {
                let peer = peers
                    .last_mut()
                    .ok_or_else(|| WgError::Ipc(format!("{} before any public_key", key)))?;
                match key {
                    "preshared_key" => {
                        peer.preshared_key =
                            Key::from_hex(value).map_err(|e| WgError::Ipc(e.to_string()))?
                    }
                    "persistent_keepalive_interval" => peer.keepalive = parse_num(key, value)?,
                    "endpoint" => peer.endpoint = Some(value.to_string()),
                    "allowed_ip" => peer.allowed_ips.push(
                        parse_prefix(value).map_err(|e| WgError::Ipc(e.to_string()))?,
                    ),
                    _ => unreachable!(),
                }
            }
            other => return Err(WgError::Ipc(format!("unknown key {:?}", other))),
        }
    }

    let private_key = private_key.ok_or_else(|| WgError::Ipc("missing private_key".into()))?;
    if peers.is_empty() {
        return Err(WgError::Ipc("no peers in configuration".into()));
    }

    Ok(DeviceConfig {
        private_key,
        fwmark,
        obfuscation,
        peers,
    })
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, WgError> {
    value
        .parse()
        .map_err(|_| WgError::Ipc(format!("invalid value for {}: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Configuration {
        Configuration::parse(
            "
[Interface]
PrivateKey = dGhpcyBpcyBhIHRlc3QgcHJpdmF0ZSBleS4uLi4uLi4=
Address = 10.10.0.1
FwMark = 51820

[Peer]
PublicKey = dGhpcyBpcyBhIHRlc3QgcHVibGljIGtleS4uLi4uLi4=
AllowedIPs = 0.0.0.0/0,::/0
Endpoint = 1.2.3.4:51820
PersistentKeepalive = 25",
        )
        .unwrap()
    }

    #[test]
    fn renders_contract_key_order() {
        let conf = fixture();
        let doc = render(&conf);
        let lines: Vec<&str> = doc.lines().collect();

        assert!(lines[0].starts_with("private_key="));
        assert_eq!(lines[1], "fwmark=51820");
        assert_eq!(
            &lines[2..11],
            &[
                "jc=10", "jmin=50", "jmax=1000", "s1=0", "s2=0", "h1=1", "h2=2", "h3=3", "h4=4"
            ]
        );
        assert!(lines[11].starts_with("public_key="));
        assert_eq!(lines[12], "persistent_keepalive_interval=25");
        assert!(lines[13].starts_with("preshared_key="));
        assert_eq!(lines[14], "endpoint=1.2.3.4:51820");
        assert_eq!(lines[15], "allowed_ip=0.0.0.0/0");
        assert_eq!(lines[16], "allowed_ip=::/0");
    }

    #[test]
    fn private_key_written_once() {
        let doc = render(&fixture());
        assert_eq!(
            doc.lines()
                .filter(|l| l.starts_with("private_key="))
                .count(),
            1
        );
    }

    #[test]
    fn fwmark_omitted_when_zero() {
        let mut conf = fixture();
        conf.interface.fwmark = 0;
        assert!(!render(&conf).contains("fwmark="));
    }

    #[test]
    fn parses_rendered_document() {
        let conf = fixture();
        let parsed = parse(&render(&conf)).unwrap();

        assert_eq!(parsed.private_key, conf.interface.private_key);
        assert_eq!(parsed.fwmark, 51820);
        assert_eq!(parsed.obfuscation, ObfuscationParams::default());
        assert!(parsed.obfuscation.is_standard_framing());
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].public_key, conf.peers[0].public_key);
        assert_eq!(parsed.peers[0].keepalive, 25);
        assert_eq!(parsed.peers[0].endpoint.as_deref(), Some("1.2.3.4:51820"));
        assert_eq!(parsed.peers[0].allowed_ips.len(), 2);
    }

    #[test]
    fn rejects_unknown_keys() {
        let doc = format!("private_key={}\nbogus=1\n", "00".repeat(32));
        assert!(matches!(parse(&doc), Err(WgError::Ipc(_))));
    }

    #[test]
    fn rejects_peer_keys_before_public_key() {
        let doc = "endpoint=1.2.3.4:1\n";
        assert!(matches!(parse(doc), Err(WgError::Ipc(_))));
    }
}
