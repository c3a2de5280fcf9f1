//! Peer graph, reachability exchange and routed-connection orchestration.
//!
//! Pure decision core. Every input (discovery events, dial results,
//! inbound frames, timer firings, user connect requests) returns a list of
//! [`RouterAction`]s; the node event loop owns the real links and applies
//! them. No I/O happens here.
//!
//! Direct links are classified by the first frame they carry: a
//! `LinkHandshake` naming the dialing peer and a purpose. Routing links
//! exchange `LinkState` reachability updates which feed the
//! [`RoutingTable`]. Routed links belong to exactly one routed connection:
//! the dialer identifies it with a `ManagedConnectionHandshake`, then a
//! `MulticastHandshake` carries the destination set and the next-hop
//! subtree. Each hop rebuilds the subtree below itself from its own table,
//! so multi-hop paths unfold hop by hop and stay deterministic.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Buf, Bytes};

use trellis_link::packet::{ConnectionPurpose, Packet, PacketType};
use trellis_link::PeerId;

use crate::error::MeshError;
use crate::routing::RoutingTable;

/// Identifies one direct connection within a node.
pub type ConnectionId = u32;
/// Identifies one routed (user-visible) connection within a node.
pub type RoutedId = u32;
/// Correlates a dial request with its outcome.
pub type DialToken = u64;

/// Routing links tolerate this many consecutive decode errors before the
/// link is torn down.
const MAX_ROUTING_DECODE_ERRORS: u32 = 3;

// ── Actions and events ──────────────────────────────────────────────────

/// What the node event loop must do after feeding the router an input.
#[derive(Debug)]
pub enum RouterAction {
    /// Dial the given address of `peer`. Report back through
    /// `dial_succeeded` / `dial_failed` with the token.
    OpenLink {
        token: DialToken,
        peer: PeerId,
        address_id: u64,
        purpose: ConnectionPurpose,
    },
    /// Bind the link dialed under `token` to a fresh connection slot.
    AttachLink {
        connection: ConnectionId,
        token: DialToken,
    },
    /// Swap the link dialed under `token` into an existing connection,
    /// replacing whatever it had.
    ReattachLink {
        connection: ConnectionId,
        token: DialToken,
    },
    /// An incoming link turned out to be the reconnect of an existing
    /// managed connection: move the link of `from` into `into` and discard
    /// the `from` slot.
    MergeConnection {
        from: ConnectionId,
        into: ConnectionId,
    },
    /// Write a packet on a connection.
    Send {
        connection: ConnectionId,
        packet: Packet,
    },
    /// Forward an opaque frame to these connections unchanged.
    Forward {
        connections: Vec<ConnectionId>,
        frame: Bytes,
    },
    /// Hand the frame to the endpoint machinery (reliability/transfers) of
    /// the routed connection this link belongs to.
    Deliver {
        connection: ConnectionId,
        routed: RoutedId,
        frame: Bytes,
    },
    /// Tear down the link of this connection and drop the slot.
    CloseConnection { connection: ConnectionId },
    /// Arm the handshake timeout for a fresh incoming link.
    StartHandshakeTimer { connection: ConnectionId },
    /// Arm the bounded establishment wait for a routed connection.
    StartEstablishTimer { routed: RoutedId },
    /// Surface an event to the node / application.
    Event(RouterEvent),
}

/// Router-level notifications.
#[derive(Debug)]
pub enum RouterEvent {
    /// A peer became known through discovery.
    PeerAppeared { peer: PeerId },
    /// A peer's last address retracted and no connection remains.
    PeerDisappeared { peer: PeerId },
    /// All destinations confirmed a routed connection we initiated.
    RoutedEstablished {
        routed: RoutedId,
        destinations: BTreeSet<PeerId>,
    },
    /// We are a destination of a routed connection opened by `source`.
    IncomingRouted {
        routed: RoutedId,
        connection: ConnectionId,
        source: PeerId,
        destinations: BTreeSet<PeerId>,
    },
    /// The establishment wait expired with destinations missing.
    EstablishmentTimedOut {
        routed: RoutedId,
        unconfirmed: BTreeSet<PeerId>,
    },
    /// A reconnect dial for this managed connection failed.
    ReconnectFailed { connection: ConnectionId },
}

// ── Internal state ──────────────────────────────────────────────────────

#[derive(Default)]
struct PeerEntry {
    addresses: BTreeSet<u64>,
    routing_connection: Option<ConnectionId>,
    routing_dial: Option<DialToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnKind {
    /// Incoming link, no `LinkHandshake` yet.
    AwaitingHandshake,
    /// Carries `LinkState` reachability exchange with `peer`.
    Routing,
    /// Routed link not yet tied to a routed connection.
    RoutedPending { identified: bool },
    /// Routed link belonging to one routed connection.
    RoutedMember { routed: RoutedId },
}

struct ConnState {
    peer: Option<PeerId>,
    kind: ConnKind,
    dialed_by_us: bool,
    decode_errors: u32,
}

enum Dial {
    Routing { peer: PeerId },
    RoutedChild { routed: RoutedId, child: PeerId },
    Reconnect { connection: ConnectionId },
}

enum ChildSlot {
    Dialing { pending: Vec<Packet> },
    Active(ConnectionId),
}

struct RoutedState {
    source: PeerId,
    destinations: BTreeSet<PeerId>,
    /// `None` on the initiating side.
    upstream: Option<ConnectionId>,
    children: BTreeMap<PeerId, ChildSlot>,
    confirmed: BTreeSet<PeerId>,
    established: bool,
    is_destination: bool,
}

/// The routing core of one mesh node.
pub struct Router {
    local: PeerId,
    peers: BTreeMap<PeerId, PeerEntry>,
    table: RoutingTable,
    conns: BTreeMap<ConnectionId, ConnState>,
    routed: BTreeMap<RoutedId, RoutedState>,
    dials: BTreeMap<DialToken, Dial>,
    /// (neighbor, dialer-side connection id) → local managed connection.
    managed_by_remote: BTreeMap<(PeerId, u32), ConnectionId>,
    /// Last reachability vector announced per routing connection.
    announced: BTreeMap<ConnectionId, BTreeMap<PeerId, u32>>,
    next_connection: ConnectionId,
    next_routed: RoutedId,
    next_token: DialToken,
}

impl Router {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
            table: RoutingTable::new(local),
            conns: BTreeMap::new(),
            routed: BTreeMap::new(),
            dials: BTreeMap::new(),
            managed_by_remote: BTreeMap::new(),
            announced: BTreeMap::new(),
            next_connection: 0,
            next_routed: 0,
            next_token: 0,
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// The routed connection a link belongs to, if any.
    pub fn routed_for_connection(&self, connection: ConnectionId) -> Option<RoutedId> {
        match self.conns.get(&connection)?.kind {
            ConnKind::RoutedMember { routed } => Some(routed),
            _ => None,
        }
    }

    /// Connections belonging to a routed connection, upstream first.
    pub fn routed_links(&self, routed: RoutedId) -> Vec<ConnectionId> {
        let Some(state) = self.routed.get(&routed) else {
            return Vec::new();
        };
        state
            .upstream
            .into_iter()
            .chain(state.children.values().filter_map(|slot| match slot {
                ChildSlot::Active(conn) => Some(*conn),
                ChildSlot::Dialing { .. } => None,
            }))
            .collect()
    }

    // ── Discovery ──────────────────────────────────────────────────────

    /// A browser discovered an address for `peer`.
    pub fn address_discovered(&mut self, peer: PeerId, address_id: u64) -> Vec<RouterAction> {
        if peer == self.local {
            return Vec::new();
        }
        let entry = self.peers.entry(peer).or_default();
        let appeared = entry.addresses.is_empty() && entry.routing_connection.is_none();
        entry.addresses.insert(address_id);

        let mut actions = Vec::new();
        if appeared {
            actions.push(RouterAction::Event(RouterEvent::PeerAppeared { peer }));
        }
        if entry.routing_connection.is_none() && entry.routing_dial.is_none() {
            self.next_token += 1;
            let token = self.next_token;
            self.peers.get_mut(&peer).expect("just inserted").routing_dial = Some(token);
            self.dials.insert(token, Dial::Routing { peer });
            actions.push(RouterAction::OpenLink {
                token,
                peer,
                address_id,
                purpose: ConnectionPurpose::Routing,
            });
        }
        actions
    }

    /// A previously discovered address was retracted.
    pub fn address_removed(&mut self, peer: PeerId, address_id: u64) -> Vec<RouterAction> {
        let Some(entry) = self.peers.get_mut(&peer) else {
            return Vec::new();
        };
        if address_id == 0 {
            entry.addresses.clear();
        } else {
            entry.addresses.remove(&address_id);
        }
        if entry.addresses.is_empty() && entry.routing_connection.is_none() {
            self.peers.remove(&peer);
            return vec![RouterAction::Event(RouterEvent::PeerDisappeared { peer })];
        }
        Vec::new()
    }

    // ── Incoming links and dial results ────────────────────────────────

    /// An advertiser accepted an incoming link. The node must bind the
    /// link to the returned connection id; the dialer's handshake will
    /// classify it.
    pub fn incoming_link(&mut self) -> (ConnectionId, Vec<RouterAction>) {
        let connection = self.alloc_connection(None, ConnKind::AwaitingHandshake, false);
        (
            connection,
            vec![RouterAction::StartHandshakeTimer { connection }],
        )
    }

    /// A dial we requested completed.
    pub fn dial_succeeded(&mut self, token: DialToken) -> Vec<RouterAction> {
        let Some(dial) = self.dials.remove(&token) else {
            tracing::warn!(token, "dial result for unknown token");
            return Vec::new();
        };
        match dial {
            Dial::Routing { peer } => {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.routing_dial = None;
                }
                let connection = self.alloc_connection(Some(peer), ConnKind::Routing, true);
                let mut actions = vec![
                    RouterAction::AttachLink { connection, token },
                    RouterAction::Send {
                        connection,
                        packet: Packet::LinkHandshake {
                            peer: self.local,
                            purpose: ConnectionPurpose::Routing,
                        },
                    },
                ];
                actions.extend(self.adopt_routing_connection(connection, peer));
                actions
            }
            Dial::RoutedChild { routed, child } => {
                let connection =
                    self.alloc_connection(Some(child), ConnKind::RoutedMember { routed }, true);
                let mut actions = vec![
                    RouterAction::AttachLink { connection, token },
                    RouterAction::Send {
                        connection,
                        packet: Packet::LinkHandshake {
                            peer: self.local,
                            purpose: ConnectionPurpose::Routed,
                        },
                    },
                    RouterAction::Send {
                        connection,
                        packet: Packet::ManagedConnectionHandshake {
                            connection_id: connection,
                        },
                    },
                ];
                if let Some(state) = self.routed.get_mut(&routed) {
                    if let Some(slot) = state.children.get_mut(&child) {
                        if let ChildSlot::Dialing { pending } = slot {
                            for packet in pending.drain(..) {
                                actions.push(RouterAction::Send { connection, packet });
                            }
                        }
                        *slot = ChildSlot::Active(connection);
                    }
                } else {
                    tracing::warn!(routed, "dial completed for vanished routed connection");
                    actions.push(RouterAction::CloseConnection { connection });
                    self.conns.remove(&connection);
                }
                actions
            }
            Dial::Reconnect { connection } => {
                if !self.conns.contains_key(&connection) {
                    return vec![RouterAction::Event(RouterEvent::ReconnectFailed {
                        connection,
                    })];
                }
                vec![
                    RouterAction::ReattachLink { connection, token },
                    RouterAction::Send {
                        connection,
                        packet: Packet::LinkHandshake {
                            peer: self.local,
                            purpose: ConnectionPurpose::Routed,
                        },
                    },
                    RouterAction::Send {
                        connection,
                        packet: Packet::ManagedConnectionHandshake {
                            connection_id: connection,
                        },
                    },
                ]
            }
        }
    }

    /// A dial we requested failed.
    pub fn dial_failed(&mut self, token: DialToken) -> Vec<RouterAction> {
        let Some(dial) = self.dials.remove(&token) else {
            return Vec::new();
        };
        match dial {
            Dial::Routing { peer } => {
                tracing::warn!(%peer, "routing dial failed");
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.routing_dial = None;
                }
                Vec::new()
            }
            Dial::RoutedChild { routed, child } => {
                tracing::warn!(%child, routed, "routed child dial failed");
                if let Some(state) = self.routed.get_mut(&routed) {
                    state.children.remove(&child);
                }
                Vec::new()
            }
            Dial::Reconnect { connection } => {
                vec![RouterAction::Event(RouterEvent::ReconnectFailed {
                    connection,
                })]
            }
        }
    }

    /// The handshake timeout for an incoming link fired.
    pub fn handshake_timeout(&mut self, connection: ConnectionId) -> Vec<RouterAction> {
        match self.conns.get(&connection) {
            Some(state)
                if matches!(
                    state.kind,
                    ConnKind::AwaitingHandshake | ConnKind::RoutedPending { .. }
                ) =>
            {
                tracing::warn!(connection, "no handshake within timeout, tearing down");
                self.conns.remove(&connection);
                vec![RouterAction::CloseConnection { connection }]
            }
            _ => Vec::new(),
        }
    }

    // ── User-facing connection establishment ───────────────────────────

    /// Open a routed connection from this peer to the destination set.
    pub fn connect(
        &mut self,
        destinations: BTreeSet<PeerId>,
    ) -> Result<(RoutedId, Vec<RouterAction>), MeshError> {
        let (tree, unroutable) = self.table.build_next_hop_tree(&destinations)?;
        if !unroutable.is_empty() {
            tracing::warn!(
                ?unroutable,
                "some destinations have no route, proceeding without them"
            );
        }

        self.next_routed += 1;
        let routed = self.next_routed;
        let mut state = RoutedState {
            source: self.local,
            destinations: destinations.clone(),
            upstream: None,
            children: BTreeMap::new(),
            confirmed: BTreeSet::new(),
            established: false,
            is_destination: false,
        };

        let mut actions = Vec::new();
        let destination_list: Vec<PeerId> = destinations.iter().copied().collect();
        for child_tree in tree.children() {
            let child = *child_tree.value();
            let handshake = Packet::MulticastHandshake {
                source: self.local,
                destinations: destination_list.clone(),
                next_hops: child_tree.clone(),
            };
            actions.extend(self.dial_routed_child(&mut state, routed, child, vec![handshake]));
        }
        actions.push(RouterAction::StartEstablishTimer { routed });
        self.routed.insert(routed, state);
        Ok((routed, actions))
    }

    /// The bounded establishment wait expired.
    pub fn establish_timer_fired(&mut self, routed: RoutedId) -> Vec<RouterAction> {
        match self.routed.get(&routed) {
            Some(state) if !state.established && state.upstream.is_none() => {
                let unconfirmed: BTreeSet<PeerId> = state
                    .destinations
                    .difference(&state.confirmed)
                    .copied()
                    .collect();
                vec![RouterAction::Event(RouterEvent::EstablishmentTimedOut {
                    routed,
                    unconfirmed,
                })]
            }
            _ => Vec::new(),
        }
    }

    /// Re-dial the neighbor behind an existing managed connection
    /// (reconnect, driven by its reliability manager).
    pub fn establish_underlying(&mut self, connection: ConnectionId) -> Vec<RouterAction> {
        let Some(state) = self.conns.get(&connection) else {
            return vec![RouterAction::Event(RouterEvent::ReconnectFailed {
                connection,
            })];
        };
        let Some(peer) = state.peer else {
            return vec![RouterAction::Event(RouterEvent::ReconnectFailed {
                connection,
            })];
        };
        match self.pick_address(peer) {
            Some(address_id) => {
                self.next_token += 1;
                let token = self.next_token;
                self.dials.insert(token, Dial::Reconnect { connection });
                vec![RouterAction::OpenLink {
                    token,
                    peer,
                    address_id,
                    purpose: ConnectionPurpose::Routed,
                }]
            }
            None => vec![RouterAction::Event(RouterEvent::ReconnectFailed {
                connection,
            })],
        }
    }

    /// The node removed a managed connection (close protocol finished or
    /// reconnection exhausted).
    pub fn connection_removed(&mut self, connection: ConnectionId) -> Vec<RouterAction> {
        let Some(state) = self.conns.remove(&connection) else {
            return Vec::new();
        };
        if let (Some(peer), ConnKind::RoutedMember { routed }) = (state.peer, state.kind) {
            self.managed_by_remote
                .retain(|(p, _), conn| !(*p == peer && *conn == connection));
            self.drop_routed_membership(routed, connection);
        }
        Vec::new()
    }

    // ── Frames ─────────────────────────────────────────────────────────

    /// One frame arrived on a connection.
    pub fn handle_frame(&mut self, connection: ConnectionId, frame: Bytes) -> Vec<RouterAction> {
        let Some(state) = self.conns.get(&connection) else {
            tracing::warn!(connection, "frame on unknown connection");
            return Vec::new();
        };

        if let ConnKind::RoutedMember { routed } = state.kind {
            return self.routed_frame(connection, routed, frame);
        }

        match Packet::deserialize(&frame) {
            Ok(packet) => {
                if let Some(state) = self.conns.get_mut(&connection) {
                    state.decode_errors = 0;
                }
                self.control_packet(connection, packet)
            }
            Err(error) => {
                tracing::error!(connection, %error, "dropping undecodable frame");
                let state = self.conns.get_mut(&connection).expect("checked above");
                state.decode_errors += 1;
                if state.kind == ConnKind::Routing
                    && state.decode_errors >= MAX_ROUTING_DECODE_ERRORS
                {
                    tracing::warn!(
                        connection,
                        "persistent decode errors on routing link, tearing down"
                    );
                    return self.link_closed(connection);
                }
                Vec::new()
            }
        }
    }

    /// The underlying link of a connection closed or failed.
    pub fn link_closed(&mut self, connection: ConnectionId) -> Vec<RouterAction> {
        let Some(state) = self.conns.get(&connection) else {
            return Vec::new();
        };
        match state.kind {
            ConnKind::Routing => {
                let peer = state.peer;
                self.conns.remove(&connection);
                self.announced.remove(&connection);
                let mut actions = vec![RouterAction::CloseConnection { connection }];
                if let Some(peer) = peer {
                    if let Some(entry) = self.peers.get_mut(&peer) {
                        if entry.routing_connection == Some(connection) {
                            entry.routing_connection = None;
                        }
                        if entry.addresses.is_empty() && entry.routing_connection.is_none() {
                            self.peers.remove(&peer);
                            actions.push(RouterAction::Event(RouterEvent::PeerDisappeared {
                                peer,
                            }));
                        }
                    }
                    let lost = self.table.neighbor_down(peer);
                    if !lost.is_empty() {
                        tracing::debug!(?lost, "destinations lost with routing link");
                    }
                    actions.extend(self.broadcast_updates());
                }
                actions
            }
            ConnKind::AwaitingHandshake | ConnKind::RoutedPending { .. } => {
                self.conns.remove(&connection);
                vec![RouterAction::CloseConnection { connection }]
            }
            ConnKind::RoutedMember { .. } => {
                // The slot survives: the driving endpoint may reconnect and
                // reattach this managed connection.
                tracing::debug!(connection, "routed link lost, awaiting reconnect");
                Vec::new()
            }
        }
    }

    // ── Internal: control packets ──────────────────────────────────────

    fn control_packet(&mut self, connection: ConnectionId, packet: Packet) -> Vec<RouterAction> {
        let Some(kind) = self.conns.get(&connection).map(|state| state.kind) else {
            return Vec::new();
        };
        match (kind, packet) {
            (ConnKind::AwaitingHandshake, Packet::LinkHandshake { peer, purpose }) => {
                match purpose {
                    ConnectionPurpose::Routing => {
                        if let Some(state) = self.conns.get_mut(&connection) {
                            state.peer = Some(peer);
                            state.kind = ConnKind::Routing;
                        }
                        self.adopt_routing_connection(connection, peer)
                    }
                    ConnectionPurpose::Routed => {
                        if let Some(state) = self.conns.get_mut(&connection) {
                            state.peer = Some(peer);
                            state.kind = ConnKind::RoutedPending { identified: false };
                        }
                        Vec::new()
                    }
                    ConnectionPurpose::Unknown => {
                        tracing::warn!(connection, "handshake with unknown purpose");
                        self.conns.remove(&connection);
                        vec![RouterAction::CloseConnection { connection }]
                    }
                }
            }
            (ConnKind::Routing, Packet::LinkState { added, removed }) => {
                let peer = self.conns[&connection]
                    .peer
                    .expect("routing connections know their peer");
                self.table.apply_update(peer, &added, &removed);
                self.broadcast_updates()
            }
            (
                ConnKind::RoutedPending { identified: false },
                Packet::ManagedConnectionHandshake { connection_id },
            ) => {
                let peer = self.conns[&connection]
                    .peer
                    .expect("pending links know their peer");
                if let Some(&existing) = self.managed_by_remote.get(&(peer, connection_id)) {
                    // Reconnect of a managed connection we already host.
                    self.conns.remove(&connection);
                    return vec![RouterAction::MergeConnection {
                        from: connection,
                        into: existing,
                    }];
                }
                self.managed_by_remote
                    .insert((peer, connection_id), connection);
                if let Some(state) = self.conns.get_mut(&connection) {
                    state.kind = ConnKind::RoutedPending { identified: true };
                }
                Vec::new()
            }
            (
                ConnKind::RoutedPending { identified: true },
                Packet::MulticastHandshake {
                    source,
                    destinations,
                    next_hops,
                },
            ) => self.multicast_handshake(connection, source, destinations, next_hops),
            // A handshake repeated on an already classified link.
            (_, Packet::LinkHandshake { .. }) => Vec::new(),
            (kind, packet) => {
                tracing::warn!(
                    connection,
                    ?kind,
                    packet_type = ?packet.packet_type(),
                    "unexpected packet for connection state, dropping"
                );
                Vec::new()
            }
        }
    }

    fn multicast_handshake(
        &mut self,
        connection: ConnectionId,
        source: PeerId,
        destinations: Vec<PeerId>,
        next_hops: trellis_link::Tree<PeerId>,
    ) -> Vec<RouterAction> {
        if *next_hops.value() != self.local {
            tracing::warn!(
                connection,
                "multicast handshake tree not rooted at us, dropping"
            );
            return Vec::new();
        }

        let destinations: BTreeSet<PeerId> = destinations.into_iter().collect();
        self.next_routed += 1;
        let routed = self.next_routed;

        let is_destination = destinations.contains(&self.local);
        let mut state = RoutedState {
            source,
            destinations: destinations.clone(),
            upstream: Some(connection),
            children: BTreeMap::new(),
            confirmed: BTreeSet::new(),
            established: false,
            is_destination,
        };
        if let Some(conn_state) = self.conns.get_mut(&connection) {
            conn_state.kind = ConnKind::RoutedMember { routed };
        }

        let mut actions = Vec::new();

        // Destinations below us in the received subtree, re-routed from
        // our own table.
        let below: BTreeSet<PeerId> = next_hops
            .values()
            .into_iter()
            .copied()
            .filter(|p| *p != self.local && destinations.contains(p))
            .collect();
        if !below.is_empty() {
            match self.table.build_next_hop_tree(&below) {
                Ok((subtree, unroutable)) => {
                    if !unroutable.is_empty() {
                        tracing::warn!(
                            ?unroutable,
                            "no route for some multicast destinations, skipping them"
                        );
                    }
                    let destination_list: Vec<PeerId> =
                        state.destinations.iter().copied().collect();
                    for child_tree in subtree.children() {
                        let child = *child_tree.value();
                        let handshake = Packet::MulticastHandshake {
                            source: state.source,
                            destinations: destination_list.clone(),
                            next_hops: child_tree.clone(),
                        };
                        actions.extend(self.dial_routed_child(
                            &mut state,
                            routed,
                            child,
                            vec![handshake],
                        ));
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "cannot forward multicast handshake");
                }
            }
        }

        if is_destination {
            actions.push(RouterAction::Event(RouterEvent::IncomingRouted {
                routed,
                connection,
                source,
                destinations: state.destinations.clone(),
            }));
            actions.push(RouterAction::Send {
                connection,
                packet: Packet::EstablishedConfirmation { source: self.local },
            });
        }

        self.routed.insert(routed, state);
        actions
    }

    // ── Internal: routed frames ────────────────────────────────────────

    fn routed_frame(
        &mut self,
        connection: ConnectionId,
        routed: RoutedId,
        frame: Bytes,
    ) -> Vec<RouterAction> {
        // Peek the discriminant; confirmations are consumed or relayed
        // here, everything else is opaque.
        let mut header = &frame[..];
        if header.remaining() >= 4
            && header.get_u32_le() == PacketType::EstablishedConfirmation as u32
        {
            if let Ok(Packet::EstablishedConfirmation { source }) = Packet::deserialize(&frame) {
                return self.confirmation(routed, source, frame);
            }
        }

        let Some(state) = self.routed.get(&routed) else {
            tracing::warn!(routed, "frame for unknown routed connection");
            return Vec::new();
        };

        let mut actions = Vec::new();
        if state.upstream == Some(connection) {
            // Downstream fan-out.
            let children: Vec<ConnectionId> = state
                .children
                .values()
                .filter_map(|slot| match slot {
                    ChildSlot::Active(conn) => Some(*conn),
                    ChildSlot::Dialing { .. } => None,
                })
                .collect();
            if !children.is_empty() {
                actions.push(RouterAction::Forward {
                    connections: children,
                    frame: frame.clone(),
                });
            }
            if state.is_destination {
                actions.push(RouterAction::Deliver {
                    connection,
                    routed,
                    frame,
                });
            }
        } else {
            // From a child: upstream toward the initiator, or deliver if
            // the initiator is us.
            match state.upstream {
                Some(upstream) => actions.push(RouterAction::Forward {
                    connections: vec![upstream],
                    frame,
                }),
                None => actions.push(RouterAction::Deliver {
                    connection,
                    routed,
                    frame,
                }),
            }
        }
        actions
    }

    fn confirmation(
        &mut self,
        routed: RoutedId,
        source: PeerId,
        frame: Bytes,
    ) -> Vec<RouterAction> {
        let Some(state) = self.routed.get_mut(&routed) else {
            return Vec::new();
        };
        match state.upstream {
            None => {
                // We initiated: collect.
                state.confirmed.insert(source);
                if !state.established && state.confirmed.is_superset(&state.destinations) {
                    state.established = true;
                    return vec![RouterAction::Event(RouterEvent::RoutedEstablished {
                        routed,
                        destinations: state.destinations.clone(),
                    })];
                }
                Vec::new()
            }
            Some(upstream) => vec![RouterAction::Forward {
                connections: vec![upstream],
                frame,
            }],
        }
    }

    // ── Internal: plumbing ─────────────────────────────────────────────

    fn alloc_connection(
        &mut self,
        peer: Option<PeerId>,
        kind: ConnKind,
        dialed_by_us: bool,
    ) -> ConnectionId {
        self.next_connection += 1;
        let connection = self.next_connection;
        self.conns.insert(
            connection,
            ConnState {
                peer,
                kind,
                dialed_by_us,
                decode_errors: 0,
            },
        );
        connection
    }

    fn pick_address(&self, peer: PeerId) -> Option<u64> {
        self.peers
            .get(&peer)
            .and_then(|entry| entry.addresses.iter().next().copied())
    }

    fn dial_routed_child(
        &mut self,
        state: &mut RoutedState,
        routed: RoutedId,
        child: PeerId,
        pending: Vec<Packet>,
    ) -> Vec<RouterAction> {
        let Some(address_id) = self.pick_address(child) else {
            tracing::warn!(%child, "no address for next hop, destinations behind it unreachable");
            return Vec::new();
        };
        self.next_token += 1;
        let token = self.next_token;
        self.dials.insert(token, Dial::RoutedChild { routed, child });
        state.children.insert(child, ChildSlot::Dialing { pending });
        vec![RouterAction::OpenLink {
            token,
            peer: child,
            address_id,
            purpose: ConnectionPurpose::Routed,
        }]
    }

    /// Make `connection` the routing connection for `peer`, resolving a
    /// simultaneous-dial conflict toward the lower identifier's dial.
    fn adopt_routing_connection(
        &mut self,
        connection: ConnectionId,
        peer: PeerId,
    ) -> Vec<RouterAction> {
        let mut actions = Vec::new();
        let entry = self.peers.entry(peer).or_default();

        if let Some(existing) = entry.routing_connection {
            if existing == connection {
                return actions;
            }
            let winner_dialer = self.local.min(peer);
            let new_dialer = if self.conns[&connection].dialed_by_us {
                self.local
            } else {
                peer
            };
            if new_dialer != winner_dialer {
                // Keep the existing connection, drop the new one.
                self.conns.remove(&connection);
                return vec![RouterAction::CloseConnection { connection }];
            }
            // The new connection wins; retire the old one quietly.
            self.conns.remove(&existing);
            self.announced.remove(&existing);
            actions.push(RouterAction::CloseConnection {
                connection: existing,
            });
        }

        self.peers
            .get_mut(&peer)
            .expect("entry just touched")
            .routing_connection = Some(connection);
        self.table.neighbor_up(peer);
        actions.extend(self.broadcast_updates());
        actions
    }

    /// Push reachability changes to every routing neighbor (split
    /// horizon), diffed against what each has already been told.
    fn broadcast_updates(&mut self) -> Vec<RouterAction> {
        let neighbors: Vec<(PeerId, ConnectionId)> = self
            .peers
            .iter()
            .filter_map(|(peer, entry)| entry.routing_connection.map(|c| (*peer, c)))
            .collect();

        let mut actions = Vec::new();
        for (peer, connection) in neighbors {
            let vector = self.table.vector_for(peer);
            let last = self.announced.entry(connection).or_default();

            let added: Vec<(PeerId, u32)> = vector
                .iter()
                .filter(|(dest, hops)| last.get(*dest) != Some(*hops))
                .map(|(dest, hops)| (*dest, *hops))
                .collect();
            let removed: Vec<PeerId> = last
                .keys()
                .filter(|dest| !vector.contains_key(*dest))
                .copied()
                .collect();

            if !added.is_empty() || !removed.is_empty() {
                *last = vector;
                actions.push(RouterAction::Send {
                    connection,
                    packet: Packet::LinkState { added, removed },
                });
            }
        }
        actions
    }

    fn drop_routed_membership(&mut self, routed: RoutedId, connection: ConnectionId) {
        let remove = match self.routed.get_mut(&routed) {
            Some(state) => {
                if state.upstream == Some(connection) {
                    state.upstream = None;
                }
                state.children.retain(|_, slot| match slot {
                    ChildSlot::Active(conn) => *conn != connection,
                    ChildSlot::Dialing { .. } => true,
                });
                state.upstream.is_none() && state.children.is_empty()
            }
            None => false,
        };
        if remove {
            self.routed.remove(&routed);
        }
    }
}
