//! Trellis overlay layer.
//!
//! Turns a sparse graph of direct point-to-point links into an overlay
//! supporting unicast and multicast routed connections: routing tables fed
//! by reachability exchange, spanning-tree connection establishment,
//! orderly close with acknowledgement from every destination, automatic
//! reconnection, and chunked cancellable transfers.
//!
//! The pure decision cores ([`router::Router`],
//! [`reliability::ReliabilityManager`], [`transfer::TransferManager`])
//! return effect lists; [`node::MeshNode`] is the one event loop per node
//! that owns the real links and applies them.

pub mod config;
pub mod error;
pub mod module;
pub mod node;
pub mod relay;
pub mod reliability;
pub mod router;
pub mod routing;
pub mod transfer;

pub use config::MeshConfig;
pub use error::MeshError;
pub use node::{MeshChannels, MeshEvent, MeshHandle, MeshNode};
pub use router::{ConnectionId, RoutedId, Router, RouterAction, RouterEvent};
pub use routing::RoutingTable;

pub use trellis_link::{PeerId, Tree};
