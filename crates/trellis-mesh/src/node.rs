//! The mesh node event loop — thin orchestrator.
//!
//! Owns the real links, packet connections, endpoint managers and modules.
//! Multiplexes link events, module events, timer firings and application
//! commands over one `tokio::select!` loop. All decisions live in the pure
//! cores ([`Router`], [`ReliabilityManager`], [`TransferManager`],
//! [`StartStopHelper`]); this loop executes their effects. Effect
//! application is synchronous and defers the few genuinely asynchronous
//! steps (link sends, module calls, application events) onto queues the
//! loop drains after every input, so nothing here recurses across an
//! await point.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use trellis_link::executor::{HelperEffect, HelperRole, RetryEffect, StartStopHelper};
use trellis_link::packet_connection::{ConnectionEffect, ConnectionEvent, PacketConnection};
use trellis_link::timer::BackoffTimer;
use trellis_link::{Address, Link, LinkError, LinkEvent, OpenedLink, PeerId};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::module::{Advertiser, AdvertiserEvent, Browser, BrowserEvent, Module};
use crate::reliability::{
    ReliabilityEffect, ReliabilityEvent, ReliabilityManager, RELIABILITY_PACKET_TYPES,
};
use crate::router::{ConnectionId, DialToken, RoutedId, Router, RouterAction, RouterEvent};
use crate::transfer::{TransferEffect, TransferEvent, TransferManager, TRANSFER_PACKET_TYPES};

const RELIABILITY_HANDLER: u32 = 1;
const TRANSFER_HANDLER: u32 = 2;

// ── Commands (app → node) ───────────────────────────────────────────────

enum MeshCommand {
    Connect {
        destinations: BTreeSet<PeerId>,
        reply: oneshot::Sender<Result<RoutedId, MeshError>>,
    },
    SendData {
        connection: RoutedId,
        payload: Bytes,
        reply: oneshot::Sender<Result<u32, MeshError>>,
    },
    CancelTransfer {
        connection: RoutedId,
        transfer_id: u32,
    },
    AttachPartialSink {
        connection: RoutedId,
        transfer_id: u32,
        sink: mpsc::Sender<Bytes>,
    },
    AttachCompleteSink {
        connection: RoutedId,
        transfer_id: u32,
        sink: oneshot::Sender<Bytes>,
    },
    Close {
        connection: RoutedId,
    },
    StopModules,
    Shutdown,
}

// ── Events (node → app) ─────────────────────────────────────────────────

/// Mesh-level events the application observes.
#[derive(Debug)]
pub enum MeshEvent {
    /// A peer became reachable through discovery.
    PeerDiscovered { peer: PeerId },
    /// A peer's addresses all retracted.
    PeerRemoved { peer: PeerId },
    /// Every destination confirmed a connection we opened.
    ConnectionEstablished {
        connection: RoutedId,
        destinations: BTreeSet<PeerId>,
    },
    /// A remote peer opened a routed connection to us.
    IncomingConnection {
        connection: RoutedId,
        source: PeerId,
        destinations: BTreeSet<PeerId>,
    },
    /// The establishment wait expired with destinations unconfirmed.
    EstablishmentTimedOut {
        connection: RoutedId,
        unconfirmed: BTreeSet<PeerId>,
    },
    /// A routed connection closed. `error` is `None` for the orderly
    /// close protocol, the original link error when reconnection gave up.
    ConnectionClosed {
        connection: RoutedId,
        error: Option<Arc<LinkError>>,
    },
    /// A transfer event on a routed connection.
    Transfer {
        connection: RoutedId,
        event: TransferEvent,
    },
}

// ── Handle (app-facing API) ─────────────────────────────────────────────

/// Handle to a running [`MeshNode`]. Cheap to clone; all methods are
/// channel sends.
#[derive(Clone)]
pub struct MeshHandle {
    cmd_tx: mpsc::Sender<MeshCommand>,
    local: PeerId,
}

impl MeshHandle {
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Open a routed connection to the destination set. Resolves with the
    /// connection id once the router accepted the request; listen for
    /// [`MeshEvent::ConnectionEstablished`] for completion.
    pub async fn connect(&self, destinations: BTreeSet<PeerId>) -> Result<RoutedId, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MeshCommand::Connect {
                destinations,
                reply,
            })
            .await
            .map_err(|_| MeshError::Shutdown)?;
        rx.await.map_err(|_| MeshError::Shutdown)?
    }

    /// Send a payload as a chunked transfer. Resolves with the transfer id.
    pub async fn send(&self, connection: RoutedId, payload: Bytes) -> Result<u32, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MeshCommand::SendData {
                connection,
                payload,
                reply,
            })
            .await
            .map_err(|_| MeshError::Shutdown)?;
        rx.await.map_err(|_| MeshError::Shutdown)?
    }

    /// Cancel an outbound transfer.
    pub async fn cancel_transfer(&self, connection: RoutedId, transfer_id: u32) {
        let _ = self
            .cmd_tx
            .send(MeshCommand::CancelTransfer {
                connection,
                transfer_id,
            })
            .await;
    }

    /// Receive an incoming transfer chunk by chunk.
    pub async fn attach_partial_sink(
        &self,
        connection: RoutedId,
        transfer_id: u32,
        sink: mpsc::Sender<Bytes>,
    ) {
        let _ = self
            .cmd_tx
            .send(MeshCommand::AttachPartialSink {
                connection,
                transfer_id,
                sink,
            })
            .await;
    }

    /// Receive an incoming transfer as one buffer on completion.
    pub async fn attach_complete_sink(
        &self,
        connection: RoutedId,
        transfer_id: u32,
        sink: oneshot::Sender<Bytes>,
    ) {
        let _ = self
            .cmd_tx
            .send(MeshCommand::AttachCompleteSink {
                connection,
                transfer_id,
                sink,
            })
            .await;
    }

    /// Begin the orderly close protocol on a routed connection.
    pub async fn close(&self, connection: RoutedId) {
        let _ = self.cmd_tx.send(MeshCommand::Close { connection }).await;
    }

    /// Stop advertising and browsing on all modules.
    pub async fn stop_modules(&self) {
        let _ = self.cmd_tx.send(MeshCommand::StopModules).await;
    }

    /// Shut the node down.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(MeshCommand::Shutdown).await;
    }
}

/// Channels returned to the application when a node starts.
pub struct MeshChannels {
    pub handle: MeshHandle,
    pub events: mpsc::Receiver<MeshEvent>,
}

// ── Internal loop input ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ModuleUnit {
    Advertising,
    Browsing,
}

enum Internal {
    Link {
        connection: ConnectionId,
        event: LinkEvent,
    },
    DialResult {
        token: DialToken,
        result: Result<OpenedLink, LinkError>,
    },
    Advertiser {
        module: usize,
        event: AdvertiserEvent,
    },
    Browser {
        module: usize,
        event: BrowserEvent,
    },
    HandshakeTimeout {
        connection: ConnectionId,
    },
    EstablishTimeout {
        routed: RoutedId,
    },
    ReconnectDue {
        routed: RoutedId,
        generation: u64,
    },
    HelperTick {
        module: usize,
        unit: ModuleUnit,
        generation: u64,
    },
}

// ── Node state ──────────────────────────────────────────────────────────

struct Endpoint {
    conns: Vec<ConnectionId>,
    reliability: ReliabilityManager,
    transfers: TransferManager,
}

struct ModuleDriver {
    advertiser: Box<dyn Advertiser>,
    browser: Box<dyn Browser>,
    advertising: StartStopHelper,
    browsing: StartStopHelper,
}

struct NodeState {
    local: PeerId,
    config: MeshConfig,
    router: Router,

    links: HashMap<ConnectionId, Box<dyn Link>>,
    pcs: HashMap<ConnectionId, PacketConnection>,
    /// Merged connections whose pump tasks still report the old id.
    aliases: HashMap<ConnectionId, ConnectionId>,
    pending_links: HashMap<DialToken, OpenedLink>,
    addresses: HashMap<(PeerId, u64), Arc<dyn Address>>,

    endpoints: HashMap<RoutedId, Endpoint>,
    conn_endpoint: HashMap<ConnectionId, RoutedId>,

    modules: Vec<ModuleDriver>,
    helper_timers: HashMap<(usize, ModuleUnit, HelperRole), BackoffTimer>,

    // Deferred asynchronous work, drained by the loop after every input.
    outbound: VecDeque<(ConnectionId, Bytes)>,
    module_calls: VecDeque<(usize, ModuleUnit, HelperRole)>,
    app_events: VecDeque<MeshEvent>,

    internal_tx: mpsc::Sender<Internal>,
    event_tx: mpsc::Sender<MeshEvent>,
}

/// The mesh node — spawn it and communicate via channels.
pub struct MeshNode;

impl MeshNode {
    /// Start a node with its transport modules. Advertising and browsing
    /// begin driving toward started immediately; the returned channels are
    /// the whole API.
    pub fn spawn(local: PeerId, config: MeshConfig, modules: Vec<Module>) -> MeshChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel::<MeshCommand>(config.channel_buffer);
        let (event_tx, event_rx) = mpsc::channel::<MeshEvent>(config.channel_buffer);
        let (internal_tx, internal_rx) = mpsc::channel::<Internal>(config.channel_buffer * 4);

        let mut drivers = Vec::new();
        for (index, module) in modules.into_iter().enumerate() {
            let Module {
                advertiser,
                browser,
                mut advertiser_events,
                mut browser_events,
            } = module;
            drivers.push(ModuleDriver {
                advertiser,
                browser,
                advertising: StartStopHelper::new(),
                browsing: StartStopHelper::new(),
            });

            let tx = internal_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = advertiser_events.recv().await {
                    let input = Internal::Advertiser {
                        module: index,
                        event,
                    };
                    if tx.send(input).await.is_err() {
                        return;
                    }
                }
            });
            let tx = internal_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = browser_events.recv().await {
                    let input = Internal::Browser {
                        module: index,
                        event,
                    };
                    if tx.send(input).await.is_err() {
                        return;
                    }
                }
            });
        }

        let state = NodeState {
            local,
            config,
            router: Router::new(local),
            links: HashMap::new(),
            pcs: HashMap::new(),
            aliases: HashMap::new(),
            pending_links: HashMap::new(),
            addresses: HashMap::new(),
            endpoints: HashMap::new(),
            conn_endpoint: HashMap::new(),
            modules: drivers,
            helper_timers: HashMap::new(),
            outbound: VecDeque::new(),
            module_calls: VecDeque::new(),
            app_events: VecDeque::new(),
            internal_tx,
            event_tx,
        };

        tokio::spawn(node_loop(state, cmd_rx, internal_rx));

        MeshChannels {
            handle: MeshHandle { cmd_tx, local },
            events: event_rx,
        }
    }
}

// ── Main loop ───────────────────────────────────────────────────────────

async fn node_loop(
    mut state: NodeState,
    mut cmd_rx: mpsc::Receiver<MeshCommand>,
    mut internal_rx: mpsc::Receiver<Internal>,
) {
    for module in 0..state.modules.len() {
        let effects = state.modules[module].advertising.start();
        apply_helper_effects(&mut state, module, ModuleUnit::Advertising, effects);
        let effects = state.modules[module].browsing.start();
        apply_helper_effects(&mut state, module, ModuleUnit::Browsing, effects);
    }
    drain_deferred(&mut state).await;

    loop {
        tokio::select! {
            Some(command) = cmd_rx.recv() => {
                if !handle_command(&mut state, command) {
                    break;
                }
            }
            Some(input) = internal_rx.recv() => {
                handle_internal(&mut state, input);
            }
            else => break,
        }
        drain_deferred(&mut state).await;
    }

    for (_, mut link) in state.links.drain() {
        link.close().await;
    }
}

/// Run the deferred queues dry: module start/stop calls, link sends (with
/// their cascading drain effects) and application events.
async fn drain_deferred(state: &mut NodeState) {
    loop {
        if let Some((module, unit, role)) = state.module_calls.pop_front() {
            let local = state.local;
            let driver = &mut state.modules[module];
            match (unit, role) {
                (ModuleUnit::Advertising, HelperRole::Starter) => {
                    driver.advertiser.start_advertising(local).await;
                }
                (ModuleUnit::Advertising, HelperRole::Stopper) => {
                    driver.advertiser.stop_advertising().await;
                }
                (ModuleUnit::Browsing, HelperRole::Starter) => {
                    driver.browser.start_browsing().await;
                }
                (ModuleUnit::Browsing, HelperRole::Stopper) => {
                    driver.browser.stop_browsing().await;
                }
            }
            continue;
        }

        if let Some((connection, frame)) = state.outbound.pop_front() {
            let result = match state.links.get_mut(&connection) {
                Some(link) => link.send(frame).await,
                None => Err(LinkError::ClosedByPeer),
            };
            match result {
                Ok(()) => pc_input(state, connection, |pc| pc.frame_sent()),
                Err(error) => {
                    tracing::debug!(connection, %error, "send failed, link is down");
                    link_went_down(state, connection, Some(Arc::new(error)));
                }
            }
            continue;
        }

        if let Some(event) = state.app_events.pop_front() {
            if state.event_tx.send(event).await.is_err() {
                tracing::debug!("application dropped the event channel");
            }
            continue;
        }

        break;
    }
}

fn handle_command(state: &mut NodeState, command: MeshCommand) -> bool {
    match command {
        MeshCommand::Connect {
            destinations,
            reply,
        } => {
            match state.router.connect(destinations.clone()) {
                Ok((routed, actions)) => {
                    state.endpoints.insert(
                        routed,
                        Endpoint {
                            conns: Vec::new(),
                            reliability: ReliabilityManager::new(
                                state.local,
                                destinations,
                                true,
                                state.config.reconnect_short_delay,
                                state.config.reconnect_regular_delay,
                                state.config.max_reconnect_attempts,
                            ),
                            transfers: TransferManager::new(state.config.chunk_size),
                        },
                    );
                    apply_router_actions(state, actions);
                    let _ = reply.send(Ok(routed));
                }
                Err(error) => {
                    let _ = reply.send(Err(error));
                }
            }
            true
        }
        MeshCommand::SendData {
            connection,
            payload,
            reply,
        } => {
            match state.endpoints.get_mut(&connection) {
                Some(endpoint) => {
                    let (id, effects) = endpoint.transfers.send(payload);
                    apply_transfer_effects(state, connection, effects);
                    let _ = reply.send(Ok(id));
                }
                None => {
                    let _ = reply.send(Err(MeshError::Unreachable { peer: state.local }));
                }
            }
            true
        }
        MeshCommand::CancelTransfer {
            connection,
            transfer_id,
        } => {
            if let Some(endpoint) = state.endpoints.get_mut(&connection) {
                let effects = endpoint.transfers.cancel(transfer_id);
                apply_transfer_effects(state, connection, effects);
            }
            true
        }
        MeshCommand::AttachPartialSink {
            connection,
            transfer_id,
            sink,
        } => {
            if let Some(endpoint) = state.endpoints.get_mut(&connection) {
                endpoint.transfers.attach_partial_sink(transfer_id, sink);
            }
            true
        }
        MeshCommand::AttachCompleteSink {
            connection,
            transfer_id,
            sink,
        } => {
            if let Some(endpoint) = state.endpoints.get_mut(&connection) {
                endpoint.transfers.attach_complete_sink(transfer_id, sink);
            }
            true
        }
        MeshCommand::Close { connection } => {
            reliability_input(state, connection, |manager| manager.close_connection());
            true
        }
        MeshCommand::StopModules => {
            for module in 0..state.modules.len() {
                let effects = state.modules[module].advertising.stop();
                apply_helper_effects(state, module, ModuleUnit::Advertising, effects);
                let effects = state.modules[module].browsing.stop();
                apply_helper_effects(state, module, ModuleUnit::Browsing, effects);
            }
            true
        }
        MeshCommand::Shutdown => false,
    }
}

fn handle_internal(state: &mut NodeState, input: Internal) {
    match input {
        Internal::Link { connection, event } => {
            let connection = resolve_alias(state, connection);
            match event {
                LinkEvent::Opened => {
                    pc_input(state, connection, |pc| pc.link_attached());
                }
                LinkEvent::Message(frame) => {
                    let actions = state.router.handle_frame(connection, frame);
                    apply_router_actions(state, actions);
                }
                LinkEvent::Closed { clean } => {
                    let error = if clean {
                        None
                    } else {
                        Some(Arc::new(LinkError::ClosedByPeer))
                    };
                    link_went_down(state, connection, error);
                }
                LinkEvent::Failed(error) => {
                    link_went_down(state, connection, Some(Arc::new(error)));
                }
            }
        }
        Internal::DialResult { token, result } => match result {
            Ok(opened) => {
                state.pending_links.insert(token, opened);
                let actions = state.router.dial_succeeded(token);
                apply_router_actions(state, actions);
                // A dial nobody claimed is torn down.
                if let Some(mut orphan) = state.pending_links.remove(&token) {
                    tokio::spawn(async move { orphan.link.close().await });
                }
            }
            Err(error) => {
                tracing::debug!(%error, token, "dial failed");
                let actions = state.router.dial_failed(token);
                apply_router_actions(state, actions);
            }
        },
        Internal::Advertiser { module, event } => match event {
            AdvertiserEvent::DidStart => {
                let effects = state.modules[module].advertising.confirm_start_occurred();
                apply_helper_effects(state, module, ModuleUnit::Advertising, effects);
            }
            AdvertiserEvent::DidStop { error } => {
                if let Some(error) = error {
                    tracing::warn!(%error, module, "advertiser stopped with error");
                }
                let effects = state.modules[module].advertising.confirm_stop_occurred();
                apply_helper_effects(state, module, ModuleUnit::Advertising, effects);
            }
            AdvertiserEvent::IncomingLink(opened) => {
                let (connection, actions) = state.router.incoming_link();
                install_link(state, connection, opened);
                apply_router_actions(state, actions);
            }
        },
        Internal::Browser { module, event } => match event {
            BrowserEvent::DidStart => {
                let effects = state.modules[module].browsing.confirm_start_occurred();
                apply_helper_effects(state, module, ModuleUnit::Browsing, effects);
            }
            BrowserEvent::DidStop { error } => {
                if let Some(error) = error {
                    tracing::warn!(%error, module, "browser stopped with error");
                }
                let effects = state.modules[module].browsing.confirm_stop_occurred();
                apply_helper_effects(state, module, ModuleUnit::Browsing, effects);
            }
            BrowserEvent::AddressDiscovered {
                peer,
                address_id,
                address,
            } => {
                state.addresses.insert((peer, address_id), address);
                let actions = state.router.address_discovered(peer, address_id);
                apply_router_actions(state, actions);
            }
            BrowserEvent::AddressRemoved { peer, address_id } => {
                if address_id == 0 {
                    state.addresses.retain(|(p, _), _| *p != peer);
                } else {
                    state.addresses.remove(&(peer, address_id));
                }
                let actions = state.router.address_removed(peer, address_id);
                apply_router_actions(state, actions);
            }
        },
        Internal::HandshakeTimeout { connection } => {
            let actions = state.router.handshake_timeout(connection);
            apply_router_actions(state, actions);
        }
        Internal::EstablishTimeout { routed } => {
            let actions = state.router.establish_timer_fired(routed);
            apply_router_actions(state, actions);
        }
        Internal::ReconnectDue { routed, generation } => {
            reliability_input(state, routed, |manager| manager.reconnect_due(generation));
        }
        Internal::HelperTick {
            module,
            unit,
            generation,
        } => {
            for role in [HelperRole::Starter, HelperRole::Stopper] {
                let helper = helper_mut(state, module, unit);
                let effects = helper.timer_fired(role, generation);
                apply_helper_effects(state, module, unit, effects);
            }
        }
    }
}

// ── Router action execution ─────────────────────────────────────────────

fn apply_router_actions(state: &mut NodeState, actions: Vec<RouterAction>) {
    for action in actions {
        match action {
            RouterAction::OpenLink {
                token,
                peer,
                address_id,
                ..
            } => {
                let address = state.addresses.get(&(peer, address_id)).cloned();
                let tx = state.internal_tx.clone();
                tokio::spawn(async move {
                    let result = match address {
                        Some(address) => address.open().await,
                        None => Err(LinkError::OpenFailed(anyhow::anyhow!(
                            "address already retracted"
                        ))),
                    };
                    let _ = tx.send(Internal::DialResult { token, result }).await;
                });
            }
            RouterAction::AttachLink { connection, token } => {
                if let Some(opened) = state.pending_links.remove(&token) {
                    install_link(state, connection, opened);
                    wire_endpoint_connection(state, connection);
                }
            }
            RouterAction::ReattachLink { connection, token } => {
                if let Some(opened) = state.pending_links.remove(&token) {
                    if let Some(pc) = state.pcs.get_mut(&connection) {
                        pc.swap_link();
                    }
                    if let Some(mut old) = state.links.remove(&connection) {
                        tokio::spawn(async move { old.close().await });
                    }
                    attach_raw_link(state, connection, opened);
                }
            }
            RouterAction::MergeConnection { from, into } => {
                // The reconnect of a managed connection arrived on a fresh
                // incoming link; move it into the surviving slot.
                state.pcs.remove(&from);
                if let Some(link) = state.links.remove(&from) {
                    if let Some(pc) = state.pcs.get_mut(&into) {
                        pc.swap_link();
                    }
                    if let Some(mut old) = state.links.remove(&into) {
                        tokio::spawn(async move { old.close().await });
                    }
                    state.aliases.insert(from, into);
                    state.links.insert(into, link);
                    // The merged link is already open; reattach right away.
                    pc_input(state, into, |pc| pc.link_attached());
                }
            }
            RouterAction::Send { connection, packet } => {
                pc_input(state, connection, |pc| (pc.write(&packet), Vec::new()));
            }
            RouterAction::Forward { connections, frame } => {
                for connection in connections {
                    let frame = frame.clone();
                    pc_input(state, connection, move |pc| {
                        (pc.write_frame(frame), Vec::new())
                    });
                }
            }
            RouterAction::Deliver {
                connection, frame, ..
            } => {
                pc_input(state, connection, move |pc| {
                    (Vec::new(), pc.handle_frame(&frame))
                });
            }
            RouterAction::CloseConnection { connection } => {
                state.pcs.remove(&connection);
                if let Some(mut link) = state.links.remove(&connection) {
                    tokio::spawn(async move { link.close().await });
                }
            }
            RouterAction::StartHandshakeTimer { connection } => {
                schedule(
                    state,
                    state.config.handshake_timeout,
                    Internal::HandshakeTimeout { connection },
                );
            }
            RouterAction::StartEstablishTimer { routed } => {
                schedule(
                    state,
                    state.config.establishment_timeout,
                    Internal::EstablishTimeout { routed },
                );
            }
            RouterAction::Event(event) => {
                router_event(state, event);
            }
        }
    }
}

fn router_event(state: &mut NodeState, event: RouterEvent) {
    match event {
        RouterEvent::PeerAppeared { peer } => {
            state.app_events.push_back(MeshEvent::PeerDiscovered { peer });
        }
        RouterEvent::PeerDisappeared { peer } => {
            state.app_events.push_back(MeshEvent::PeerRemoved { peer });
        }
        RouterEvent::RoutedEstablished {
            routed,
            destinations,
        } => {
            state.app_events.push_back(MeshEvent::ConnectionEstablished {
                connection: routed,
                destinations,
            });
        }
        RouterEvent::IncomingRouted {
            routed,
            connection,
            source,
            destinations,
        } => {
            state.endpoints.insert(
                routed,
                Endpoint {
                    conns: Vec::new(),
                    reliability: ReliabilityManager::new(
                        state.local,
                        BTreeSet::from([source]),
                        false,
                        state.config.reconnect_short_delay,
                        state.config.reconnect_regular_delay,
                        state.config.max_reconnect_attempts,
                    ),
                    transfers: TransferManager::new(state.config.chunk_size),
                },
            );
            wire_endpoint_connection(state, connection);
            state.app_events.push_back(MeshEvent::IncomingConnection {
                connection: routed,
                source,
                destinations,
            });
        }
        RouterEvent::EstablishmentTimedOut {
            routed,
            unconfirmed,
        } => {
            state.app_events.push_back(MeshEvent::EstablishmentTimedOut {
                connection: routed,
                unconfirmed,
            });
        }
        RouterEvent::ReconnectFailed { connection } => {
            if let Some(&routed) = state.conn_endpoint.get(&connection) {
                reliability_input(state, routed, |manager| manager.reconnect_failed());
            }
        }
    }
}

// ── Link plumbing ───────────────────────────────────────────────────────

fn install_link(state: &mut NodeState, connection: ConnectionId, opened: OpenedLink) {
    state
        .pcs
        .insert(connection, PacketConnection::new(BTreeSet::new()));
    attach_raw_link(state, connection, opened);
}

fn attach_raw_link(state: &mut NodeState, connection: ConnectionId, opened: OpenedLink) {
    let OpenedLink { link, mut events } = opened;
    state.links.insert(connection, link);
    let tx = state.internal_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(Internal::Link { connection, event }).await.is_err() {
                return;
            }
        }
    });
}

fn resolve_alias(state: &NodeState, connection: ConnectionId) -> ConnectionId {
    let mut current = connection;
    while let Some(&next) = state.aliases.get(&current) {
        current = next;
    }
    current
}

fn wire_endpoint_connection(state: &mut NodeState, connection: ConnectionId) {
    let Some(routed) = state.router.routed_for_connection(connection) else {
        return;
    };
    let Some(endpoint) = state.endpoints.get_mut(&routed) else {
        return;
    };
    if endpoint.conns.contains(&connection) {
        return;
    }
    endpoint.conns.push(connection);
    state.conn_endpoint.insert(connection, routed);
    if let Some(pc) = state.pcs.get_mut(&connection) {
        pc.add_handler(RELIABILITY_HANDLER, RELIABILITY_PACKET_TYPES);
        pc.add_handler(TRANSFER_HANDLER, TRANSFER_PACKET_TYPES);
    }
}

fn link_went_down(
    state: &mut NodeState,
    connection: ConnectionId,
    error: Option<Arc<LinkError>>,
) {
    state.links.remove(&connection);
    pc_input(state, connection, move |pc| {
        (Vec::new(), pc.link_closed(error))
    });
    let actions = state.router.link_closed(connection);
    apply_router_actions(state, actions);
}

// ── Packet connection plumbing ──────────────────────────────────────────

/// Run an operation against one packet connection, then apply the
/// resulting link effects and handler events.
fn pc_input<F>(state: &mut NodeState, connection: ConnectionId, operation: F)
where
    F: FnOnce(&mut PacketConnection) -> (Vec<ConnectionEffect>, Vec<ConnectionEvent>),
{
    let Some(pc) = state.pcs.get_mut(&connection) else {
        return;
    };
    let (effects, events) = operation(pc);
    for effect in effects {
        match effect {
            ConnectionEffect::SendFrame(frame) => {
                state.outbound.push_back((connection, frame));
            }
            ConnectionEffect::CloseLink => {
                if let Some(mut link) = state.links.remove(&connection) {
                    tokio::spawn(async move { link.close().await });
                }
            }
        }
    }
    handle_conn_events(state, connection, events);
}

fn handle_conn_events(
    state: &mut NodeState,
    connection: ConnectionId,
    events: Vec<ConnectionEvent>,
) {
    for event in events {
        match event {
            ConnectionEvent::Dispatch { handler, packet } => {
                let Some(&routed) = state.conn_endpoint.get(&connection) else {
                    continue;
                };
                match handler {
                    RELIABILITY_HANDLER => {
                        reliability_input(state, routed, |manager| manager.handle_packet(&packet));
                    }
                    TRANSFER_HANDLER => {
                        let effects = match state.endpoints.get_mut(&routed) {
                            Some(endpoint) => endpoint.transfers.handle_packet(&packet),
                            None => Vec::new(),
                        };
                        apply_transfer_effects(state, routed, effects);
                    }
                    other => tracing::warn!(other, "dispatch to unknown handler"),
                }
            }
            ConnectionEvent::DecodeFailed(error) => {
                tracing::debug!(connection, %error, "endpoint frame dropped");
            }
            ConnectionEvent::DidWriteAllPackets => {
                let Some(&routed) = state.conn_endpoint.get(&connection) else {
                    continue;
                };
                if endpoint_drained(state, routed) {
                    let effects = match state.endpoints.get_mut(&routed) {
                        Some(endpoint) => endpoint.transfers.did_write_all_packets(),
                        None => Vec::new(),
                    };
                    apply_transfer_effects(state, routed, effects);
                }
            }
            ConnectionEvent::UnderlyingDidConnect => {
                if let Some(&routed) = state.conn_endpoint.get(&connection) {
                    reliability_input(state, routed, |manager| manager.underlying_did_connect());
                }
            }
            ConnectionEvent::UnderlyingDidClose(error) => {
                if let Some(&routed) = state.conn_endpoint.get(&connection) {
                    reliability_input(state, routed, move |manager| {
                        manager.underlying_did_close(error)
                    });
                }
            }
            ConnectionEvent::WillSwapUnderlying => {}
        }
    }
}

fn endpoint_drained(state: &NodeState, routed: RoutedId) -> bool {
    let Some(endpoint) = state.endpoints.get(&routed) else {
        return false;
    };
    endpoint.conns.iter().all(|conn| {
        state
            .pcs
            .get(conn)
            .map(|pc| pc.outbox_len() == 0)
            .unwrap_or(true)
    })
}

// ── Reliability plumbing ────────────────────────────────────────────────

fn reliability_input<F>(state: &mut NodeState, routed: RoutedId, operation: F)
where
    F: FnOnce(&mut ReliabilityManager) -> Vec<ReliabilityEffect>,
{
    let effects = match state.endpoints.get_mut(&routed) {
        Some(endpoint) => operation(&mut endpoint.reliability),
        None => return,
    };
    apply_reliability_effects(state, routed, effects);
}

fn apply_reliability_effects(
    state: &mut NodeState,
    routed: RoutedId,
    effects: Vec<ReliabilityEffect>,
) {
    for effect in effects {
        match effect {
            ReliabilityEffect::Write(packet) => {
                for connection in endpoint_conns(state, routed) {
                    let packet = packet.clone();
                    pc_input(state, connection, move |pc| (pc.write(&packet), Vec::new()));
                }
            }
            ReliabilityEffect::DisconnectUnderlying => {
                for connection in endpoint_conns(state, routed) {
                    pc_input(state, connection, |pc| pc.disconnect());
                }
            }
            ReliabilityEffect::EstablishUnderlying => {
                // Re-dial every member link that is currently down.
                let down: Vec<ConnectionId> = endpoint_conns(state, routed)
                    .into_iter()
                    .filter(|conn| !state.links.contains_key(conn))
                    .collect();
                if down.is_empty() {
                    reliability_input(state, routed, |manager| manager.underlying_did_connect());
                    continue;
                }
                for connection in down {
                    let actions = state.router.establish_underlying(connection);
                    apply_router_actions(state, actions);
                }
            }
            ReliabilityEffect::ScheduleReconnect { generation, delay } => {
                schedule(state, delay, Internal::ReconnectDue { routed, generation });
            }
            ReliabilityEffect::CancelReconnect => {
                // Stale ticks are filtered by generation; nothing to tear down.
            }
            ReliabilityEffect::Notify(event) => match event {
                ReliabilityEvent::Connected => {
                    tracing::debug!(routed, "routed connection (re)connected");
                }
                ReliabilityEvent::ClosedExpectedly => {
                    state.app_events.push_back(MeshEvent::ConnectionClosed {
                        connection: routed,
                        error: None,
                    });
                }
                ReliabilityEvent::ClosedUnexpectedly(error) => {
                    state.app_events.push_back(MeshEvent::ConnectionClosed {
                        connection: routed,
                        error,
                    });
                }
            },
            ReliabilityEffect::RemoveConnection => {
                remove_endpoint(state, routed);
            }
        }
    }
}

fn remove_endpoint(state: &mut NodeState, routed: RoutedId) {
    let Some(mut endpoint) = state.endpoints.remove(&routed) else {
        return;
    };
    for effect in endpoint.transfers.link_lost() {
        if let TransferEffect::Notify(event) = effect {
            state.app_events.push_back(MeshEvent::Transfer {
                connection: routed,
                event,
            });
        }
    }
    for connection in endpoint.conns.drain(..) {
        state.conn_endpoint.remove(&connection);
        state.pcs.remove(&connection);
        if let Some(mut link) = state.links.remove(&connection) {
            tokio::spawn(async move { link.close().await });
        }
        let actions = state.router.connection_removed(connection);
        apply_router_actions(state, actions);
    }
}

// ── Transfer plumbing ───────────────────────────────────────────────────

fn apply_transfer_effects(
    state: &mut NodeState,
    routed: RoutedId,
    effects: Vec<TransferEffect>,
) {
    for effect in effects {
        match effect {
            TransferEffect::Write(packet) => {
                for connection in endpoint_conns(state, routed) {
                    let packet = packet.clone();
                    pc_input(state, connection, move |pc| (pc.write(&packet), Vec::new()));
                }
            }
            TransferEffect::Notify(event) => {
                state.app_events.push_back(MeshEvent::Transfer {
                    connection: routed,
                    event,
                });
            }
        }
    }
}

fn endpoint_conns(state: &NodeState, routed: RoutedId) -> Vec<ConnectionId> {
    state
        .endpoints
        .get(&routed)
        .map(|endpoint| endpoint.conns.clone())
        .unwrap_or_default()
}

// ── Module helper plumbing ──────────────────────────────────────────────

fn helper_mut(state: &mut NodeState, module: usize, unit: ModuleUnit) -> &mut StartStopHelper {
    match unit {
        ModuleUnit::Advertising => &mut state.modules[module].advertising,
        ModuleUnit::Browsing => &mut state.modules[module].browsing,
    }
}

fn apply_helper_effects(
    state: &mut NodeState,
    module: usize,
    unit: ModuleUnit,
    effects: Vec<HelperEffect>,
) {
    for helper_effect in effects {
        let role = helper_effect.role;
        match helper_effect.effect {
            RetryEffect::InvokeAction { attempt } => {
                if attempt > 0 {
                    tracing::debug!(module, ?unit, ?role, attempt, "retrying module action");
                }
                state.module_calls.push_back((module, unit, role));
            }
            RetryEffect::ArmTimer { generation } => {
                let backoff = state.config.executor_backoff;
                let timer = state
                    .helper_timers
                    .entry((module, unit, role))
                    .or_insert_with(|| BackoffTimer::new(backoff));
                let (tick_tx, mut tick_rx) = mpsc::channel(4);
                timer.start(tick_tx);
                let tx = state.internal_tx.clone();
                tokio::spawn(async move {
                    while tick_rx.recv().await.is_some() {
                        let input = Internal::HelperTick {
                            module,
                            unit,
                            generation,
                        };
                        if tx.send(input).await.is_err() {
                            return;
                        }
                    }
                });
            }
            RetryEffect::CancelTimer => {
                if let Some(timer) = state.helper_timers.get_mut(&(module, unit, role)) {
                    timer.stop();
                }
            }
        }
    }
}

// ── Small utilities ─────────────────────────────────────────────────────

fn schedule(state: &NodeState, delay: Duration, input: Internal) {
    let tx = state.internal_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(input).await;
    });
}
