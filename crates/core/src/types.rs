//! Core type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::KoreError;

/// Message identifier (16-bit, little-endian on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u16);

impl MessageId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    /// Parse the hex notation used in length tables and config files
    /// (`"02AE"`, `"0x02ae"`).
    pub fn from_hex(text: &str) -> Option<Self> {
        let text = text.trim();
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        u16::from_str_radix(digits, 16).ok().map(Self)
    }
}

impl From<u16> for MessageId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Account ID (32-bit unsigned)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u32);

impl AccountId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Character ID (32-bit unsigned)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CharId(pub u32);

impl CharId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Mirrored client ID (local only, never on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ClientId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Session tokens handed out by the master server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub session_id: u32,
    pub session_id2: u32,
}

/// A host/port pair for an upstream server or a local listener
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build an endpoint from the wire representation: a 32-bit IPv4 address
    /// whose little-endian bytes are the dotted octets in order.
    pub fn from_wire(ip: u32, port: u16) -> Self {
        Self::new(Ipv4Addr::from(ip.to_le_bytes()).to_string(), port)
    }

    /// Inverse of [`Endpoint::from_wire`]. Hostnames that are not IPv4 literals
    /// encode as `0.0.0.0`.
    pub fn wire_ip(&self) -> u32 {
        self.host
            .parse::<Ipv4Addr>()
            .map(|ip| u32::from_le_bytes(ip.octets()))
            .unwrap_or(0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = KoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            KoreError::Configuration(format!("Endpoint '{}' is missing a port", s))
        })?;
        if host.is_empty() {
            return Err(KoreError::Configuration(format!("Endpoint '{}' is missing a host", s)));
        }
        let port = port.parse::<u16>().map_err(|e| {
            KoreError::Configuration(format!("Endpoint '{}' has an invalid port: {}", s, e))
        })?;
        Ok(Self::new(host, port))
    }
}

/// Character sex flag as carried in login frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Female = 0,
    #[default]
    Male = 1,
}

impl Sex {
    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            Self::Female
        } else {
            Self::Male
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}
