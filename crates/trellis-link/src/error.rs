use std::time::Duration;

use crate::packet::{ConnectionPurpose, PacketType};

/// Errors surfaced by the link substrate.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open underlying link: {0}")]
    OpenFailed(#[source] anyhow::Error),

    #[error("underlying link closed by peer")]
    ClosedByPeer,

    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("no handshake received within {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("link purpose mismatch: expected {expected:?}, got {actual:?}")]
    PurposeMismatch {
        expected: ConnectionPurpose,
        actual: ConnectionPurpose,
    },

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Errors produced while encoding a packet.
///
/// The wire format forbids very little; encoding fails only for values
/// the closed packet set cannot represent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("cannot encode {packet:?}: {reason}")]
    InvalidPacket {
        packet: PacketType,
        reason: &'static str,
    },
}

/// Errors produced while decoding a packet frame.
///
/// Decode errors are never fatal to the process: the offending frame is
/// dropped and logged, and the link stays up unless errors persist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    TruncatedFrame { needed: usize, remaining: usize },

    #[error("unexpected packet type discriminant {discriminant}")]
    UnexpectedType { discriminant: u32 },

    #[error("invalid field in {packet:?}: {reason}")]
    InvalidField {
        packet: PacketType,
        reason: &'static str,
    },
}
