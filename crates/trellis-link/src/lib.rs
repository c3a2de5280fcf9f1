//! Trellis link substrate.
//!
//! Everything below the overlay: peer identity, the binary packet codec,
//! the underlying-connection contracts, the packet-level multiplexer and
//! the retry/backoff machinery. The overlay layer (`trellis-mesh`) builds
//! routing, reliability and transfers on top of this crate; concrete
//! transports (Wi-Fi, relay, loopback) plug in underneath through the
//! [`Address`]/[`Link`] contracts.
//!
//! Wire format: fixed little-endian layouts, one packet per transport
//! frame (see [`packet`]).

pub mod error;
pub mod executor;
pub mod link;
pub mod packet;
pub mod packet_connection;
pub mod timer;
pub mod tree;

pub use error::{DecodeError, EncodeError, LinkError};
pub use link::{Address, Link, LinkEvent, OpenedLink};
pub use packet::{ConnectionPurpose, Packet, PacketType};
pub use packet_connection::{
    ConnectionEffect, ConnectionEvent, ConnectionState, HandlerId, PacketConnection,
};
pub use timer::{BackoffSettings, BackoffTimer, TimerTick};
pub use tree::Tree;

use std::fmt;
use std::str::FromStr;

/// Overlay peer identity — a 16-byte universally unique identifier.
///
/// Ordered by raw byte lexicographic order; the protocol leans on this
/// ordering wherever it needs a deterministic tie-break. Displayed and
/// parsed as a hyphenated UUID string; on the wire it is the 16 raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(uuid::Uuid);

impl PeerId {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Reconstruct an identity from its 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// The 16 raw bytes of this identity.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.simple().to_string();
        write!(f, "PeerId({}...)", &hex[..8])
    }
}

impl FromStr for PeerId {
    type Err = error::LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = uuid::Uuid::parse_str(s)
            .map_err(|_| error::LinkError::InvalidPeerId(s.to_string()))?;
        Ok(Self(id))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
