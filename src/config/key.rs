//! 32-byte key material handling
//!
//! WireGuard keys travel as base64 in configuration files and as lowercase
//! hex in the device IPC protocol. This module owns both encodings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;

use super::ConfigError;

/// Length of every WireGuard key (private, public, pre-shared)
pub const KEY_LEN: usize = 32;

/// A 32-byte key in either base64 (config) or hex (IPC) form
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// The all-zero key, used when a pre-shared key is absent
    pub const ZERO: Key = Key([0u8; KEY_LEN]);

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key, rejecting anything that is not exactly 32 bytes
    pub fn from_base64(s: &str) -> Result<Self, ConfigError> {
        let decoded = BASE64
            .decode(s.trim())
            .map_err(|_| ConfigError::InvalidKey(s.to_string()))?;
        if decoded.len() != KEY_LEN {
            return Err(ConfigError::KeyLength(decoded.len()));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Decode a lowercase-hex key as found in IPC documents
    pub fn from_hex(s: &str) -> Result<Self, ConfigError> {
        let decoded = hex::decode(s).map_err(|_| ConfigError::InvalidKey(s.to_string()))?;
        if decoded.len() != KEY_LEN {
            return Err(ConfigError::KeyLength(decoded.len()));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Render as lowercase hex, the form the device IPC protocol expects
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print whole keys
        write!(f, "Key({}...)", &self.to_base64()[..8])
    }
}
