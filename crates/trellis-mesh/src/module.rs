//! Transport module contracts and the in-process loopback module.
//!
//! A module bundles an advertiser (accept incoming links, announce our
//! identity) and a browser (discover dialable addresses of other peers).
//! Both report through event channels handed over at construction; the
//! node's event loop multiplexes them alongside everything else.
//!
//! [`LocalModule`] wires advertisers and browsers of one process together
//! through a shared registry with in-memory links. It exists for tests,
//! demos and single-host setups; real transports implement the same
//! contracts out of tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use trellis_link::{Address, Link, LinkError, LinkEvent, OpenedLink, PeerId};

/// Events from an advertiser.
pub enum AdvertiserEvent {
    DidStart,
    DidStop { error: Option<LinkError> },
    /// A remote peer dialed us.
    IncomingLink(OpenedLink),
}

impl std::fmt::Debug for AdvertiserEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdvertiserEvent::DidStart => write!(f, "DidStart"),
            AdvertiserEvent::DidStop { error } => write!(f, "DidStop({error:?})"),
            AdvertiserEvent::IncomingLink(_) => write!(f, "IncomingLink"),
        }
    }
}

/// Events from a browser.
pub enum BrowserEvent {
    DidStart,
    DidStop {
        error: Option<LinkError>,
    },
    /// A dialable address for `peer` appeared.
    AddressDiscovered {
        peer: PeerId,
        address_id: u64,
        address: Arc<dyn Address>,
    },
    /// A previously discovered address was retracted.
    AddressRemoved { peer: PeerId, address_id: u64 },
}

impl std::fmt::Debug for BrowserEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserEvent::DidStart => write!(f, "DidStart"),
            BrowserEvent::DidStop { error } => write!(f, "DidStop({error:?})"),
            BrowserEvent::AddressDiscovered {
                peer, address_id, ..
            } => write!(f, "AddressDiscovered({peer:?}, {address_id})"),
            BrowserEvent::AddressRemoved { peer, address_id } => {
                write!(f, "AddressRemoved({peer:?}, {address_id})")
            }
        }
    }
}

/// Advertises the local peer and accepts incoming links.
#[async_trait::async_trait]
pub trait Advertiser: Send + 'static {
    async fn start_advertising(&mut self, id: PeerId);
    async fn stop_advertising(&mut self);
    fn is_advertising(&self) -> bool;
}

/// Discovers dialable addresses of remote peers.
#[async_trait::async_trait]
pub trait Browser: Send + 'static {
    async fn start_browsing(&mut self);
    async fn stop_browsing(&mut self);
    fn is_browsing(&self) -> bool;
}

/// One transport: an advertiser/browser pair plus their event streams.
pub struct Module {
    pub advertiser: Box<dyn Advertiser>,
    pub browser: Box<dyn Browser>,
    pub advertiser_events: mpsc::Receiver<AdvertiserEvent>,
    pub browser_events: mpsc::Receiver<BrowserEvent>,
}

// ── In-memory links ─────────────────────────────────────────────────────

struct MemoryLink {
    /// Events of the remote side; our sends surface there as messages.
    remote: mpsc::Sender<LinkEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, frame: Bytes) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ClosedByPeer);
        }
        self.remote
            .send(LinkEvent::Message(frame))
            .await
            .map_err(|_| LinkError::ClosedByPeer)
    }

    async fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.remote.send(LinkEvent::Closed { clean: true }).await;
        }
    }
}

/// Build a connected pair of in-memory links. Both sides start with an
/// `Opened` event already queued.
pub fn memory_link_pair() -> (OpenedLink, OpenedLink) {
    let (tx_a, rx_a) = mpsc::channel(64);
    let (tx_b, rx_b) = mpsc::channel(64);
    let closed = Arc::new(AtomicBool::new(false));

    tx_a.try_send(LinkEvent::Opened).expect("fresh channel");
    tx_b.try_send(LinkEvent::Opened).expect("fresh channel");

    let a = OpenedLink {
        link: Box::new(MemoryLink {
            remote: tx_b,
            closed: closed.clone(),
        }),
        events: rx_a,
    };
    let b = OpenedLink {
        link: Box::new(MemoryLink {
            remote: tx_a,
            closed,
        }),
        events: rx_b,
    };
    (a, b)
}

// ── Loopback module ─────────────────────────────────────────────────────

struct Registration {
    /// Where the advertiser receives incoming links.
    acceptor: mpsc::Sender<AdvertiserEvent>,
}

#[derive(Default)]
struct RegistryInner {
    advertised: HashMap<PeerId, Registration>,
    browsers: Vec<(u64, mpsc::Sender<BrowserEvent>)>,
    next_browser: u64,
    next_address: u64,
}

/// Shared in-process registry connecting loopback advertisers and browsers.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<RegistryInner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a module backed by this registry.
    pub fn module(&self) -> Module {
        let (adv_tx, adv_rx) = mpsc::channel(64);
        let (browse_tx, browse_rx) = mpsc::channel(64);
        Module {
            advertiser: Box::new(LocalAdvertiser {
                network: self.clone(),
                events: adv_tx,
                advertised: None,
            }),
            browser: Box::new(LocalBrowser {
                network: self.clone(),
                events: browse_tx,
                browser_id: None,
            }),
            advertiser_events: adv_rx,
            browser_events: browse_rx,
        }
    }

    fn advertise(&self, peer: PeerId, acceptor: mpsc::Sender<AdvertiserEvent>) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.advertised.insert(peer, Registration { acceptor });

        // Announce the new peer to every active browser.
        inner.next_address += 1;
        let address_id = inner.next_address;
        let address: Arc<dyn Address> = Arc::new(LocalAddress {
            network: self.clone(),
            peer,
        });
        for (_, browser) in &inner.browsers {
            let _ = browser.try_send(BrowserEvent::AddressDiscovered {
                peer,
                address_id,
                address: address.clone(),
            });
        }
    }

    fn retract(&self, peer: PeerId) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.advertised.remove(&peer);
        for (_, browser) in &inner.browsers {
            let _ = browser.try_send(BrowserEvent::AddressRemoved {
                peer,
                // Loopback addresses are one per peer; id 0 retracts all.
                address_id: 0,
            });
        }
    }

    fn register_browser(&self, events: mpsc::Sender<BrowserEvent>) -> u64 {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.next_browser += 1;
        let id = inner.next_browser;

        // Replay already-advertised peers to the new browser.
        let advertised: Vec<PeerId> = inner.advertised.keys().copied().collect();
        for peer in advertised {
            inner.next_address += 1;
            let address_id = inner.next_address;
            let _ = events.try_send(BrowserEvent::AddressDiscovered {
                peer,
                address_id,
                address: Arc::new(LocalAddress {
                    network: self.clone(),
                    peer,
                }),
            });
        }
        inner.browsers.push((id, events));
        id
    }

    fn unregister_browser(&self, id: u64) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.browsers.retain(|(browser_id, _)| *browser_id != id);
    }

    fn dial(&self, peer: PeerId) -> Result<OpenedLink, LinkError> {
        let inner = self.inner.lock().expect("registry poisoned");
        let registration = inner
            .advertised
            .get(&peer)
            .ok_or_else(|| LinkError::OpenFailed(anyhow::anyhow!("peer {peer} not advertised")))?;

        let (ours, theirs) = memory_link_pair();
        registration
            .acceptor
            .try_send(AdvertiserEvent::IncomingLink(theirs))
            .map_err(|_| LinkError::OpenFailed(anyhow::anyhow!("acceptor queue full or gone")))?;
        Ok(ours)
    }
}

struct LocalAddress {
    network: LocalNetwork,
    peer: PeerId,
}

#[async_trait::async_trait]
impl Address for LocalAddress {
    async fn open(&self) -> Result<OpenedLink, LinkError> {
        self.network.dial(self.peer)
    }
}

struct LocalAdvertiser {
    network: LocalNetwork,
    events: mpsc::Sender<AdvertiserEvent>,
    advertised: Option<PeerId>,
}

#[async_trait::async_trait]
impl Advertiser for LocalAdvertiser {
    async fn start_advertising(&mut self, id: PeerId) {
        self.network.advertise(id, self.events.clone());
        self.advertised = Some(id);
        let _ = self.events.send(AdvertiserEvent::DidStart).await;
    }

    async fn stop_advertising(&mut self) {
        if let Some(peer) = self.advertised.take() {
            self.network.retract(peer);
        }
        let _ = self
            .events
            .send(AdvertiserEvent::DidStop { error: None })
            .await;
    }

    fn is_advertising(&self) -> bool {
        self.advertised.is_some()
    }
}

struct LocalBrowser {
    network: LocalNetwork,
    events: mpsc::Sender<BrowserEvent>,
    browser_id: Option<u64>,
}

#[async_trait::async_trait]
impl Browser for LocalBrowser {
    async fn start_browsing(&mut self) {
        if self.browser_id.is_none() {
            self.browser_id = Some(self.network.register_browser(self.events.clone()));
        }
        let _ = self.events.send(BrowserEvent::DidStart).await;
    }

    async fn stop_browsing(&mut self) {
        if let Some(id) = self.browser_id.take() {
            self.network.unregister_browser(id);
        }
        let _ = self
            .events
            .send(BrowserEvent::DidStop { error: None })
            .await;
    }

    fn is_browsing(&self) -> bool {
        self.browser_id.is_some()
    }
}
