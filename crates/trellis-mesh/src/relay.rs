//! Relay (RemoteP2P) endpoint layout.
//!
//! A WebSocket relay module discovers peers and brokers connections over
//! three endpoints relative to a base URL. The control packets it carries
//! are part of the shared codec (`trellis_link::packet`); this module only
//! fixes the URL layout both sides must agree on.

use trellis_link::PeerId;

/// Discovery endpoint: advertise/browse control frames.
pub fn discovery_url(base: &str) -> String {
    format!("{}/RemoteP2P/discovery", base.trim_end_matches('/'))
}

/// Endpoint the dialing side connects to when requesting a link.
pub fn connection_request_url(base: &str, local: PeerId, remote: PeerId) -> String {
    format!(
        "{}/RemoteP2P/connection/request/{local}/{remote}",
        base.trim_end_matches('/')
    )
}

/// Endpoint the accepting side connects to when answering a request.
pub fn connection_accept_url(base: &str, local: PeerId, remote: PeerId) -> String {
    format!(
        "{}/RemoteP2P/connection/accept/{local}/{remote}",
        base.trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    #[test]
    fn discovery_layout() {
        assert_eq!(
            discovery_url("wss://relay.example.org"),
            "wss://relay.example.org/RemoteP2P/discovery"
        );
        // trailing slash tolerated
        assert_eq!(
            discovery_url("wss://relay.example.org/"),
            "wss://relay.example.org/RemoteP2P/discovery"
        );
    }

    #[test]
    fn request_and_accept_layout() {
        let local = peer(1);
        let remote = peer(2);
        assert_eq!(
            connection_request_url("ws://r", local, remote),
            format!("ws://r/RemoteP2P/connection/request/{local}/{remote}")
        );
        assert_eq!(
            connection_accept_url("ws://r", local, remote),
            format!("ws://r/RemoteP2P/connection/accept/{local}/{remote}")
        );
    }
}
