use trellis_link::{DecodeError, LinkError, PeerId};

/// Overlay-level errors.
///
/// Transient failures are absorbed by the retry machinery; only reconnect
/// exhaustion and handshake purpose mismatches reach user code as
/// terminal. Cancellation is a normal terminal state, not an error.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("peer unreachable: {peer}")]
    Unreachable { peer: PeerId },

    #[error("no route for destination {peer}")]
    NoRouteForDestination { peer: PeerId },

    #[error("reconnect attempts exhausted: {original}")]
    ReconnectExhausted { original: String },

    #[error("transfer was cancelled")]
    TransferCancelled,

    #[error("transfer lost its underlying link")]
    TransferLinkLost,

    #[error("mesh node is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_route() {
        let peer = PeerId::from_bytes([0x11; 16]);
        let err = MeshError::NoRouteForDestination { peer };
        assert_eq!(
            err.to_string(),
            format!("no route for destination {peer}")
        );
    }

    #[test]
    fn link_error_wraps() {
        let err: MeshError = LinkError::ClosedByPeer.into();
        assert_eq!(err.to_string(), "link error: underlying link closed by peer");
    }

    #[test]
    fn display_reconnect_exhausted() {
        let err = MeshError::ReconnectExhausted {
            original: "transport failure: io".into(),
        };
        assert_eq!(
            err.to_string(),
            "reconnect attempts exhausted: transport failure: io"
        );
    }
}
