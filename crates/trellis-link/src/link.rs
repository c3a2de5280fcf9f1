//! Underlying connection contracts.
//!
//! A transport module produces [`Address`]es; dialing one yields an
//! [`OpenedLink`]: a write half plus a stream of [`LinkEvent`]s. The link
//! is a bidirectional framed packet pipe — one `send` is one frame on the
//! remote side, and ordering is preserved per link.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::LinkError;

/// Events delivered by an underlying link, in arrival order.
#[derive(Debug)]
pub enum LinkEvent {
    /// The link finished opening and can carry frames.
    Opened,
    /// One inbound frame.
    Message(Bytes),
    /// The link closed. `clean` is true for an orderly shutdown.
    Closed { clean: bool },
    /// The link failed; no further events follow.
    Failed(LinkError),
}

/// Write half of an underlying link.
#[async_trait::async_trait]
pub trait Link: Send + 'static {
    /// Hand one frame to the transport. Resolving does not mean the frame
    /// reached the peer, only that the transport accepted it.
    async fn send(&mut self, frame: Bytes) -> Result<(), LinkError>;

    /// Tear the link down cleanly. Idempotent.
    async fn close(&mut self);
}

/// A freshly opened underlying link.
pub struct OpenedLink {
    pub link: Box<dyn Link>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Opaque dialable handle to a specific remote peer, produced by a
/// transport module's browser.
#[async_trait::async_trait]
pub trait Address: Send + Sync + 'static {
    async fn open(&self) -> Result<OpenedLink, LinkError>;
}
