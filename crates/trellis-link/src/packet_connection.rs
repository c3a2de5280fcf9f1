//! Packet-level multiplexer over a replaceable underlying link.
//!
//! Pure state machine: operations return the effects the owning event loop
//! must apply to the real link (`SendFrame`, `CloseLink`) and the events
//! the registered handlers must observe. The link itself is owned by the
//! event loop; the connection only tracks attachment, the FIFO outbox and
//! the at-most-one-frame-in-flight drain discipline. Swapping the link
//! preserves the outbox; a frame in flight across a swap or failure counts
//! as lost and is the next layer's job to retransmit.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DecodeError, LinkError};
use crate::packet::{Packet, PacketType};
use crate::PeerId;

/// Identifies a registered packet handler within one connection.
pub type HandlerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No underlying link yet.
    Idle,
    /// Link attached, outbox empty or drain not started.
    Connected,
    /// Link attached, a frame is in flight.
    Draining,
    /// Link gone (failure or disconnect).
    Closed,
}

/// Side effects for the event loop that owns the underlying link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEffect {
    /// Hand this frame to the current underlying link.
    SendFrame(Bytes),
    /// Tear the current underlying link down.
    CloseLink,
}

/// Notifications for handlers and the owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An inbound packet for exactly one registered handler.
    Dispatch { handler: HandlerId, packet: Packet },
    /// An inbound frame failed to decode; it was dropped.
    DecodeFailed(DecodeError),
    /// The outbox drained completely.
    DidWriteAllPackets,
    /// The current link is about to be replaced.
    WillSwapUnderlying,
    /// A link is attached and live.
    UnderlyingDidConnect,
    /// The link went away. `None` means an orderly local disconnect.
    UnderlyingDidClose(Option<Arc<LinkError>>),
}

struct HandlerSlot {
    id: HandlerId,
    types: Vec<PacketType>,
}

/// Multiplexes typed packets over one replaceable underlying link.
pub struct PacketConnection {
    state: ConnectionState,
    outbox: VecDeque<Bytes>,
    in_flight: bool,
    handlers: Vec<HandlerSlot>,
    destinations: BTreeSet<PeerId>,
}

impl PacketConnection {
    pub fn new(destinations: BTreeSet<PeerId>) -> Self {
        Self {
            state: ConnectionState::Idle,
            outbox: VecDeque::new(),
            in_flight: false,
            handlers: Vec::new(),
            destinations,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Draining
        )
    }

    pub fn destinations(&self) -> &BTreeSet<PeerId> {
        &self.destinations
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    // ── Handlers ───────────────────────────────────────────────────────

    /// Register a handler for a set of packet types.
    ///
    /// Two handlers claiming the same type is a programming error.
    pub fn add_handler(&mut self, id: HandlerId, types: &[PacketType]) {
        assert!(
            self.handlers.iter().all(|slot| slot.id != id),
            "handler {id} registered twice"
        );
        for slot in &self.handlers {
            for claimed in types {
                assert!(
                    !slot.types.contains(claimed),
                    "packet type {claimed:?} claimed by two handlers"
                );
            }
        }
        self.handlers.push(HandlerSlot {
            id,
            types: types.to_vec(),
        });
    }

    pub fn remove_handler(&mut self, id: HandlerId) {
        self.handlers.retain(|slot| slot.id != id);
    }

    // ── Writing ────────────────────────────────────────────────────────

    /// Queue a packet. Returns immediately; the frame goes out when the
    /// drain reaches it. Packets written in sequence arrive in order.
    /// A packet the codec refuses to encode is dropped and logged.
    pub fn write(&mut self, packet: &Packet) -> Vec<ConnectionEffect> {
        match packet.serialize() {
            Ok(frame) => self.write_frame(frame),
            Err(error) => {
                tracing::error!(%error, "dropping unencodable packet");
                Vec::new()
            }
        }
    }

    /// Queue an already serialized frame behind everything written so far.
    /// Forwarded frames use this so they cannot overtake queued packets.
    pub fn write_frame(&mut self, frame: Bytes) -> Vec<ConnectionEffect> {
        self.outbox.push_back(frame);
        self.pump()
    }

    /// The link accepted the in-flight frame; continue the drain.
    pub fn frame_sent(&mut self) -> (Vec<ConnectionEffect>, Vec<ConnectionEvent>) {
        self.in_flight = false;
        if self.state != ConnectionState::Draining {
            return (Vec::new(), Vec::new());
        }
        if self.outbox.is_empty() {
            self.state = ConnectionState::Connected;
            return (Vec::new(), vec![ConnectionEvent::DidWriteAllPackets]);
        }
        (self.pump(), Vec::new())
    }

    fn pump(&mut self) -> Vec<ConnectionEffect> {
        if self.in_flight || !self.is_connected() {
            return Vec::new();
        }
        match self.outbox.pop_front() {
            Some(frame) => {
                self.in_flight = true;
                self.state = ConnectionState::Draining;
                vec![ConnectionEffect::SendFrame(frame)]
            }
            None => Vec::new(),
        }
    }

    // ── Link lifecycle ─────────────────────────────────────────────────

    /// A fresh underlying link is attached and open.
    pub fn link_attached(&mut self) -> (Vec<ConnectionEffect>, Vec<ConnectionEvent>) {
        self.state = ConnectionState::Connected;
        self.in_flight = false;
        let effects = self.pump();
        (effects, vec![ConnectionEvent::UnderlyingDidConnect])
    }

    /// Detach the current link without closing it, ahead of attaching a
    /// replacement. The outbox is preserved; any frame in flight is lost.
    pub fn swap_link(&mut self) -> Vec<ConnectionEvent> {
        self.state = ConnectionState::Idle;
        self.in_flight = false;
        vec![ConnectionEvent::WillSwapUnderlying]
    }

    /// Orderly local teardown of the underlying link.
    pub fn disconnect(&mut self) -> (Vec<ConnectionEffect>, Vec<ConnectionEvent>) {
        let effects = if self.is_connected() {
            vec![ConnectionEffect::CloseLink]
        } else {
            Vec::new()
        };
        self.state = ConnectionState::Closed;
        self.in_flight = false;
        (effects, vec![ConnectionEvent::UnderlyingDidClose(None)])
    }

    /// The link closed or failed underneath us.
    pub fn link_closed(&mut self, error: Option<Arc<LinkError>>) -> Vec<ConnectionEvent> {
        self.state = ConnectionState::Closed;
        self.in_flight = false;
        vec![ConnectionEvent::UnderlyingDidClose(error)]
    }

    // ── Receiving ──────────────────────────────────────────────────────

    /// Decode one inbound frame and dispatch it to the handler that claims
    /// its type. Unclaimed packets are dropped with a warning.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<ConnectionEvent> {
        let packet = match Packet::deserialize(frame) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::error!(%error, "dropping undecodable frame");
                return vec![ConnectionEvent::DecodeFailed(error)];
            }
        };

        let packet_type = packet.packet_type();
        match self
            .handlers
            .iter()
            .find(|slot| slot.types.contains(&packet_type))
        {
            Some(slot) => vec![ConnectionEvent::Dispatch {
                handler: slot.id,
                packet,
            }],
            None => {
                tracing::warn!(?packet_type, "no handler for inbound packet, dropping");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    fn connection() -> PacketConnection {
        PacketConnection::new(BTreeSet::from([peer(2)]))
    }

    fn sent_frame(effects: &[ConnectionEffect]) -> Bytes {
        match effects {
            [ConnectionEffect::SendFrame(frame)] => frame.clone(),
            other => panic!("expected one SendFrame, got {other:?}"),
        }
    }

    #[test]
    fn writes_queue_until_link_attaches() {
        let mut conn = connection();
        assert!(conn.write(&Packet::CloseRequest).is_empty());
        assert!(conn.write(&Packet::CloseAnnounce).is_empty());
        assert_eq!(conn.outbox_len(), 2);
        assert_eq!(conn.state(), ConnectionState::Idle);

        let (effects, events) = conn.link_attached();
        assert!(matches!(
            events[0],
            ConnectionEvent::UnderlyingDidConnect
        ));
        // Drain begins with the first queued frame.
        assert_eq!(sent_frame(&effects), Packet::CloseRequest.serialize().expect("serialize"));
        assert_eq!(conn.state(), ConnectionState::Draining);
    }

    #[test]
    fn outbox_drains_fifo_one_frame_in_flight() {
        let mut conn = connection();
        conn.link_attached();

        let first = conn.write(&Packet::TransferStarted {
            transfer_id: 1,
            length: 10,
        });
        assert_eq!(
            sent_frame(&first),
            Packet::TransferStarted {
                transfer_id: 1,
                length: 10
            }
            .serialize().expect("serialize")
        );

        // Second write queues behind the in-flight frame.
        assert!(conn
            .write(&Packet::TransferCompleted { transfer_id: 1 })
            .is_empty());

        let (effects, events) = conn.frame_sent();
        assert!(events.is_empty());
        assert_eq!(
            sent_frame(&effects),
            Packet::TransferCompleted { transfer_id: 1 }.serialize().expect("serialize")
        );

        let (effects, events) = conn.frame_sent();
        assert!(effects.is_empty());
        assert!(matches!(events[0], ConnectionEvent::DidWriteAllPackets));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn swap_preserves_outbox_and_drops_in_flight_frame() {
        let mut conn = connection();
        conn.link_attached();
        conn.write(&Packet::CloseRequest); // goes in flight
        conn.write(&Packet::CloseAnnounce); // queued

        let events = conn.swap_link();
        assert!(matches!(events[0], ConnectionEvent::WillSwapUnderlying));
        assert_eq!(conn.state(), ConnectionState::Idle);
        // The in-flight CloseRequest is lost; CloseAnnounce survives.
        assert_eq!(conn.outbox_len(), 1);

        let (effects, _) = conn.link_attached();
        assert_eq!(sent_frame(&effects), Packet::CloseAnnounce.serialize().expect("serialize"));
    }

    #[test]
    fn disconnect_closes_link_and_notifies() {
        let mut conn = connection();
        conn.link_attached();

        let (effects, events) = conn.disconnect();
        assert_eq!(effects, vec![ConnectionEffect::CloseLink]);
        assert!(matches!(
            events[0],
            ConnectionEvent::UnderlyingDidClose(None)
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn fresh_attach_reopens_closed_connection() {
        let mut conn = connection();
        conn.link_attached();
        conn.link_closed(None);
        assert_eq!(conn.state(), ConnectionState::Closed);

        conn.link_attached();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn dispatch_to_single_claiming_handler() {
        let mut conn = connection();
        conn.add_handler(1, &[PacketType::CloseRequest, PacketType::CloseAnnounce]);
        conn.add_handler(2, &[PacketType::Data]);

        let events = conn.handle_frame(&Packet::CloseAnnounce.serialize().expect("serialize"));
        match &events[0] {
            ConnectionEvent::Dispatch { handler, packet } => {
                assert_eq!(*handler, 1);
                assert_eq!(*packet, Packet::CloseAnnounce);
            }
            other => panic!("expected Dispatch, got {other:?}"),
        }
    }

    #[test]
    fn unclaimed_packet_dropped() {
        let mut conn = connection();
        conn.add_handler(1, &[PacketType::Data]);
        let events = conn.handle_frame(&Packet::CloseRequest.serialize().expect("serialize"));
        assert!(events.is_empty());
    }

    #[test]
    fn decode_failure_reported_not_fatal() {
        let mut conn = connection();
        let events = conn.handle_frame(&[0xFF, 0xFF]);
        assert!(matches!(events[0], ConnectionEvent::DecodeFailed(_)));
        // Connection state untouched.
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    #[should_panic(expected = "claimed by two handlers")]
    fn overlapping_handlers_are_a_programming_error() {
        let mut conn = connection();
        conn.add_handler(1, &[PacketType::Data]);
        conn.add_handler(2, &[PacketType::Data, PacketType::CloseRequest]);
    }

    #[test]
    fn unencodable_packet_dropped_not_queued() {
        use crate::tree::Tree;

        let mut conn = connection();
        conn.link_attached();
        let malformed = Packet::MulticastHandshake {
            source: peer(1),
            destinations: Vec::new(),
            next_hops: Tree::leaf(peer(2)),
        };
        assert!(conn.write(&malformed).is_empty());
        assert_eq!(conn.outbox_len(), 0);
    }

    #[test]
    fn removed_handler_no_longer_dispatched() {
        let mut conn = connection();
        conn.add_handler(1, &[PacketType::CloseRequest]);
        conn.remove_handler(1);
        assert!(conn
            .handle_frame(&Packet::CloseRequest.serialize().expect("serialize"))
            .is_empty());
    }
}
