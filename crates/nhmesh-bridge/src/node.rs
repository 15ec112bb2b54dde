//! Mesh node identifiers
//!
//! Meshtastic identifies nodes with 4-byte numbers. Everything this crate
//! publishes or persists uses the canonical text form `!xxxxxxxx`: a `!`
//! followed by exactly eight lowercase hex digits. Decimal node numbers
//! never leave this module.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

/// Broadcast destination number
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Text form used by Meshtastic for the broadcast address
pub const BROADCAST_ID: &str = "^all";

/// A mesh node number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Wrap a raw node number
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    /// The broadcast address
    pub const fn broadcast() -> Self {
        Self(BROADCAST_NUM)
    }

    /// Raw node number
    pub const fn num(&self) -> u32 {
        self.0
    }

    /// Whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_NUM
    }

    /// Whether this can be the source of a packet or a unicast target
    pub fn is_unicast(&self) -> bool {
        self.0 != 0 && !self.is_broadcast()
    }

    /// Canonical `!xxxxxxxx` form
    pub fn canonical(&self) -> String {
        format!("!{:08x}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str(BROADCAST_ID)
        } else {
            write!(f, "!{:08x}", self.0)
        }
    }
}

impl From<u32> for NodeId {
    fn from(num: u32) -> Self {
        Self(num)
    }
}

impl FromStr for NodeId {
    type Err = BridgeError;

    /// Accepts `!1a2b3c4d`, `0x1a2b3c4d` and `^all`
    ///
    /// Bare digits are rejected: `1234` could be hex or a decimal node
    /// number, and guessing would misroute.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed == BROADCAST_ID {
            return Ok(Self::broadcast());
        }

        let hex = trimmed
            .strip_prefix('!')
            .or_else(|| trimmed.strip_prefix("0x"))
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| BridgeError::InvalidNodeId(s.to_string()))?;

        if hex.is_empty() || hex.len() > 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BridgeError::InvalidNodeId(s.to_string()));
        }

        u32::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| BridgeError::InvalidNodeId(s.to_string()))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
