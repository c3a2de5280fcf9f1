//! Binary packet codec.
//!
//! Every protocol message is one frame: a 32-bit little-endian type
//! discriminant followed by the fields of that packet. Identifiers are the
//! 16 raw bytes of a [`PeerId`], sets are a 32-bit count followed by the
//! elements, and next-hop trees are serialized preorder as
//! `value | childCount | children…`. The transport delivers discrete
//! frames, so there is no outer length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::tree::Tree;
use crate::PeerId;

/// Closed set of packet types carried over trellis links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    LinkHandshake = 1,
    MulticastHandshake = 2,
    EstablishedConfirmation = 3,
    CloseRequest = 4,
    CloseAnnounce = 5,
    CloseAcknowledge = 6,
    Data = 7,
    TransferStarted = 8,
    TransferCancelled = 9,
    TransferCompleted = 10,
    ManagedConnectionHandshake = 11,
    // Relay (RemoteP2P) control packets
    StartAdvertisement = 12,
    StopAdvertisement = 13,
    StartBrowsing = 14,
    StopBrowsing = 15,
    PeerAdded = 16,
    PeerRemoved = 17,
    ConnectionRequest = 18,
    // Routing metadata over routing connections
    LinkState = 19,
}

impl PacketType {
    fn from_u32(raw: u32) -> Option<Self> {
        use PacketType::*;
        Some(match raw {
            1 => LinkHandshake,
            2 => MulticastHandshake,
            3 => EstablishedConfirmation,
            4 => CloseRequest,
            5 => CloseAnnounce,
            6 => CloseAcknowledge,
            7 => Data,
            8 => TransferStarted,
            9 => TransferCancelled,
            10 => TransferCompleted,
            11 => ManagedConnectionHandshake,
            12 => StartAdvertisement,
            13 => StopAdvertisement,
            14 => StartBrowsing,
            15 => StopBrowsing,
            16 => PeerAdded,
            17 => PeerRemoved,
            18 => ConnectionRequest,
            19 => LinkState,
            _ => return None,
        })
    }
}

/// Role a fresh underlying link is handshaken into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ConnectionPurpose {
    Unknown = 0,
    Routing = 1,
    Routed = 2,
}

impl ConnectionPurpose {
    fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ConnectionPurpose::Unknown,
            1 => ConnectionPurpose::Routing,
            2 => ConnectionPurpose::Routed,
            _ => return None,
        })
    }
}

/// Nesting bound for decoded next-hop trees. Deeper frames are rejected
/// rather than recursed into.
const MAX_TREE_DEPTH: u32 = 64;

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// First frame on any fresh link: who is dialing and what the link is for.
    LinkHandshake {
        peer: PeerId,
        purpose: ConnectionPurpose,
    },
    /// Routed-connection establishment: the destination set and the
    /// next-hop subtree rooted at the receiver. Never has zero destinations.
    MulticastHandshake {
        source: PeerId,
        destinations: Vec<PeerId>,
        next_hops: Tree<PeerId>,
    },
    /// Sent upstream by each destination once its end of a routed
    /// connection is live; forwarded unchanged by intermediates.
    EstablishedConfirmation { source: PeerId },
    CloseRequest,
    CloseAnnounce,
    CloseAcknowledge { source: PeerId },
    Data { transfer_id: u32, chunk: Bytes },
    TransferStarted { transfer_id: u32, length: u32 },
    TransferCancelled { transfer_id: u32 },
    TransferCompleted { transfer_id: u32 },
    /// Identifies which managed connection a routed link belongs to, keyed
    /// by the dialing side's connection id.
    ManagedConnectionHandshake { connection_id: u32 },
    StartAdvertisement { peer: PeerId },
    StopAdvertisement { peer: PeerId },
    StartBrowsing { peer: PeerId },
    StopBrowsing { peer: PeerId },
    PeerAdded { peer: PeerId },
    PeerRemoved { peer: PeerId },
    ConnectionRequest { peer: PeerId },
    /// Incremental reachability update exchanged over routing connections:
    /// destinations that became reachable (with hop counts as seen by the
    /// sender) and destinations that are gone.
    LinkState {
        added: Vec<(PeerId, u32)>,
        removed: Vec<PeerId>,
    },
}

impl Packet {
    /// The type discriminant of this packet.
    pub fn packet_type(&self) -> PacketType {
        use Packet::*;
        match self {
            LinkHandshake { .. } => PacketType::LinkHandshake,
            MulticastHandshake { .. } => PacketType::MulticastHandshake,
            EstablishedConfirmation { .. } => PacketType::EstablishedConfirmation,
            CloseRequest => PacketType::CloseRequest,
            CloseAnnounce => PacketType::CloseAnnounce,
            CloseAcknowledge { .. } => PacketType::CloseAcknowledge,
            Data { .. } => PacketType::Data,
            TransferStarted { .. } => PacketType::TransferStarted,
            TransferCancelled { .. } => PacketType::TransferCancelled,
            TransferCompleted { .. } => PacketType::TransferCompleted,
            ManagedConnectionHandshake { .. } => PacketType::ManagedConnectionHandshake,
            StartAdvertisement { .. } => PacketType::StartAdvertisement,
            StopAdvertisement { .. } => PacketType::StopAdvertisement,
            StartBrowsing { .. } => PacketType::StartBrowsing,
            StopBrowsing { .. } => PacketType::StopBrowsing,
            PeerAdded { .. } => PacketType::PeerAdded,
            PeerRemoved { .. } => PacketType::PeerRemoved,
            ConnectionRequest { .. } => PacketType::ConnectionRequest,
            LinkState { .. } => PacketType::LinkState,
        }
    }

    /// Serialize to a wire frame. The first 4 bytes are always the type.
    ///
    /// Fails for the one value the wire format forbids: a
    /// `MulticastHandshake` with zero destinations. The codec never emits
    /// a frame its own `deserialize` would reject.
    pub fn serialize(&self) -> Result<Bytes, EncodeError> {
        if let Packet::MulticastHandshake { destinations, .. } = self {
            if destinations.is_empty() {
                return Err(EncodeError::InvalidPacket {
                    packet: PacketType::MulticastHandshake,
                    reason: "zero destinations",
                });
            }
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.packet_type() as u32);

        match self {
            Packet::LinkHandshake { peer, purpose } => {
                put_peer(&mut buf, peer);
                buf.put_u32_le(*purpose as u32);
            }
            Packet::MulticastHandshake {
                source,
                destinations,
                next_hops,
            } => {
                put_peer(&mut buf, source);
                buf.put_i32_le(destinations.len() as i32);
                for destination in destinations {
                    put_peer(&mut buf, destination);
                }
                put_tree(&mut buf, next_hops);
            }
            Packet::EstablishedConfirmation { source } => put_peer(&mut buf, source),
            Packet::CloseRequest | Packet::CloseAnnounce => {}
            Packet::CloseAcknowledge { source } => put_peer(&mut buf, source),
            Packet::Data { transfer_id, chunk } => {
                buf.put_u32_le(*transfer_id);
                buf.put_slice(chunk);
            }
            Packet::TransferStarted {
                transfer_id,
                length,
            } => {
                buf.put_u32_le(*transfer_id);
                buf.put_u32_le(*length);
            }
            Packet::TransferCancelled { transfer_id }
            | Packet::TransferCompleted { transfer_id } => {
                buf.put_u32_le(*transfer_id);
            }
            Packet::ManagedConnectionHandshake { connection_id } => {
                buf.put_u32_le(*connection_id);
            }
            Packet::StartAdvertisement { peer }
            | Packet::StopAdvertisement { peer }
            | Packet::StartBrowsing { peer }
            | Packet::StopBrowsing { peer }
            | Packet::PeerAdded { peer }
            | Packet::PeerRemoved { peer }
            | Packet::ConnectionRequest { peer } => put_peer(&mut buf, peer),
            Packet::LinkState { added, removed } => {
                buf.put_i32_le(added.len() as i32);
                for (peer, hops) in added {
                    put_peer(&mut buf, peer);
                    buf.put_u32_le(*hops);
                }
                buf.put_i32_le(removed.len() as i32);
                for peer in removed {
                    put_peer(&mut buf, peer);
                }
            }
        }

        Ok(buf.freeze())
    }

    /// Decode one wire frame.
    pub fn deserialize(frame: &[u8]) -> Result<Packet, DecodeError> {
        let mut buf = frame;
        let discriminant = get_u32(&mut buf)?;
        let packet_type = PacketType::from_u32(discriminant)
            .ok_or(DecodeError::UnexpectedType { discriminant })?;

        let packet = match packet_type {
            PacketType::LinkHandshake => {
                let peer = get_peer(&mut buf)?;
                let raw = get_u32(&mut buf)?;
                let purpose =
                    ConnectionPurpose::from_u32(raw).ok_or(DecodeError::InvalidField {
                        packet: packet_type,
                        reason: "unknown connection purpose",
                    })?;
                Packet::LinkHandshake { peer, purpose }
            }
            PacketType::MulticastHandshake => {
                let source = get_peer(&mut buf)?;
                let count = get_count(&mut buf, packet_type)?;
                if count == 0 {
                    return Err(DecodeError::InvalidField {
                        packet: packet_type,
                        reason: "zero destinations",
                    });
                }
                let mut destinations = Vec::with_capacity(count);
                for _ in 0..count {
                    destinations.push(get_peer(&mut buf)?);
                }
                let next_hops = get_tree(&mut buf, 0)?;
                Packet::MulticastHandshake {
                    source,
                    destinations,
                    next_hops,
                }
            }
            PacketType::EstablishedConfirmation => Packet::EstablishedConfirmation {
                source: get_peer(&mut buf)?,
            },
            PacketType::CloseRequest => Packet::CloseRequest,
            PacketType::CloseAnnounce => Packet::CloseAnnounce,
            PacketType::CloseAcknowledge => Packet::CloseAcknowledge {
                source: get_peer(&mut buf)?,
            },
            PacketType::Data => {
                let transfer_id = get_u32(&mut buf)?;
                Packet::Data {
                    transfer_id,
                    chunk: Bytes::copy_from_slice(buf),
                }
            }
            PacketType::TransferStarted => Packet::TransferStarted {
                transfer_id: get_u32(&mut buf)?,
                length: get_u32(&mut buf)?,
            },
            PacketType::TransferCancelled => Packet::TransferCancelled {
                transfer_id: get_u32(&mut buf)?,
            },
            PacketType::TransferCompleted => Packet::TransferCompleted {
                transfer_id: get_u32(&mut buf)?,
            },
            PacketType::ManagedConnectionHandshake => Packet::ManagedConnectionHandshake {
                connection_id: get_u32(&mut buf)?,
            },
            PacketType::StartAdvertisement => Packet::StartAdvertisement {
                peer: get_peer(&mut buf)?,
            },
            PacketType::StopAdvertisement => Packet::StopAdvertisement {
                peer: get_peer(&mut buf)?,
            },
            PacketType::StartBrowsing => Packet::StartBrowsing {
                peer: get_peer(&mut buf)?,
            },
            PacketType::StopBrowsing => Packet::StopBrowsing {
                peer: get_peer(&mut buf)?,
            },
            PacketType::PeerAdded => Packet::PeerAdded {
                peer: get_peer(&mut buf)?,
            },
            PacketType::PeerRemoved => Packet::PeerRemoved {
                peer: get_peer(&mut buf)?,
            },
            PacketType::ConnectionRequest => Packet::ConnectionRequest {
                peer: get_peer(&mut buf)?,
            },
            PacketType::LinkState => {
                let added_count = get_count(&mut buf, packet_type)?;
                let mut added = Vec::with_capacity(added_count);
                for _ in 0..added_count {
                    let peer = get_peer(&mut buf)?;
                    let hops = get_u32(&mut buf)?;
                    added.push((peer, hops));
                }
                let removed_count = get_count(&mut buf, packet_type)?;
                let mut removed = Vec::with_capacity(removed_count);
                for _ in 0..removed_count {
                    removed.push(get_peer(&mut buf)?);
                }
                Packet::LinkState { added, removed }
            }
        };

        // Data chunks consume the remainder by construction; everything
        // else must account for the whole frame.
        if !matches!(packet, Packet::Data { .. }) && !buf.is_empty() {
            return Err(DecodeError::InvalidField {
                packet: packet_type,
                reason: "trailing bytes after packet",
            });
        }

        Ok(packet)
    }

    fn encoded_len(&self) -> usize {
        match self {
            Packet::LinkHandshake { .. } => 24,
            Packet::MulticastHandshake {
                destinations,
                next_hops,
                ..
            } => 4 + 16 + 4 + destinations.len() * 16 + tree_len(next_hops),
            Packet::EstablishedConfirmation { .. } | Packet::CloseAcknowledge { .. } => 20,
            Packet::CloseRequest | Packet::CloseAnnounce => 4,
            Packet::Data { chunk, .. } => 8 + chunk.len(),
            Packet::TransferStarted { .. } => 12,
            Packet::TransferCancelled { .. }
            | Packet::TransferCompleted { .. }
            | Packet::ManagedConnectionHandshake { .. } => 8,
            Packet::StartAdvertisement { .. }
            | Packet::StopAdvertisement { .. }
            | Packet::StartBrowsing { .. }
            | Packet::StopBrowsing { .. }
            | Packet::PeerAdded { .. }
            | Packet::PeerRemoved { .. }
            | Packet::ConnectionRequest { .. } => 20,
            Packet::LinkState { added, removed } => {
                4 + 4 + added.len() * 20 + 4 + removed.len() * 16
            }
        }
    }
}

// ── Wire helpers ────────────────────────────────────────────────────────

fn put_peer(buf: &mut BytesMut, peer: &PeerId) {
    buf.put_slice(peer.as_bytes());
}

fn put_tree(buf: &mut BytesMut, tree: &Tree<PeerId>) {
    put_peer(buf, tree.value());
    buf.put_i32_le(tree.children().len() as i32);
    for child in tree.children() {
        put_tree(buf, child);
    }
}

fn tree_len(tree: &Tree<PeerId>) -> usize {
    20 + tree.children().iter().map(tree_len).sum::<usize>()
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::TruncatedFrame {
            needed: 4,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.get_u32_le())
}

fn get_peer(buf: &mut &[u8]) -> Result<PeerId, DecodeError> {
    if buf.remaining() < 16 {
        return Err(DecodeError::TruncatedFrame {
            needed: 16,
            remaining: buf.remaining(),
        });
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(PeerId::from_bytes(bytes))
}

/// Read a signed 32-bit element count; negative counts are malformed.
fn get_count(buf: &mut &[u8], packet: PacketType) -> Result<usize, DecodeError> {
    let raw = get_u32(&mut *buf)? as i32;
    if raw < 0 {
        return Err(DecodeError::InvalidField {
            packet,
            reason: "negative element count",
        });
    }
    Ok(raw as usize)
}

fn get_tree(buf: &mut &[u8], depth: u32) -> Result<Tree<PeerId>, DecodeError> {
    if depth > MAX_TREE_DEPTH {
        return Err(DecodeError::InvalidField {
            packet: PacketType::MulticastHandshake,
            reason: "next-hop tree nested too deeply",
        });
    }
    let value = get_peer(buf)?;
    let count = get_count(buf, PacketType::MulticastHandshake)?;
    let mut children = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        children.push(get_tree(buf, depth + 1)?);
    }
    Ok(Tree::with_children(value, children))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    #[test]
    fn link_handshake_layout() {
        // 11112222-3333-4444-5555-666677778899
        let id = PeerId::from_bytes([
            0x11, 0x11, 0x22, 0x22, 0x33, 0x33, 0x44, 0x44, 0x55, 0x55, 0x66, 0x66, 0x77, 0x77,
            0x88, 0x99,
        ]);
        let packet = Packet::LinkHandshake {
            peer: id,
            purpose: ConnectionPurpose::Routed,
        };

        let bytes = packet.serialize().expect("serialize");
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..4], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[4..20], id.as_bytes());
        assert_eq!(&bytes[20..24], &[0x02, 0x00, 0x00, 0x00]);

        assert_eq!(Packet::deserialize(&bytes).unwrap(), packet);
    }

    #[test]
    fn roundtrip_every_type() {
        let tree = Tree::with_children(
            peer(1),
            vec![
                Tree::with_children(peer(2), vec![Tree::leaf(peer(4))]),
                Tree::leaf(peer(3)),
            ],
        );
        let packets = [
            Packet::LinkHandshake {
                peer: peer(1),
                purpose: ConnectionPurpose::Routing,
            },
            Packet::MulticastHandshake {
                source: peer(1),
                destinations: vec![peer(3), peer(4)],
                next_hops: tree,
            },
            Packet::EstablishedConfirmation { source: peer(4) },
            Packet::CloseRequest,
            Packet::CloseAnnounce,
            Packet::CloseAcknowledge { source: peer(2) },
            Packet::Data {
                transfer_id: 7,
                chunk: Bytes::from_static(b"chunk bytes"),
            },
            Packet::TransferStarted {
                transfer_id: 7,
                length: 40000,
            },
            Packet::TransferCancelled { transfer_id: 7 },
            Packet::TransferCompleted { transfer_id: 7 },
            Packet::ManagedConnectionHandshake { connection_id: 12 },
            Packet::StartAdvertisement { peer: peer(9) },
            Packet::StopAdvertisement { peer: peer(9) },
            Packet::StartBrowsing { peer: peer(9) },
            Packet::StopBrowsing { peer: peer(9) },
            Packet::PeerAdded { peer: peer(9) },
            Packet::PeerRemoved { peer: peer(9) },
            Packet::ConnectionRequest { peer: peer(9) },
            Packet::LinkState {
                added: vec![(peer(5), 2), (peer(6), 1)],
                removed: vec![peer(7)],
            },
        ];

        for packet in packets {
            let bytes = packet.serialize().expect("serialize");
            assert_eq!(
                &bytes[..4],
                (packet.packet_type() as u32).to_le_bytes(),
                "frame must begin with the type discriminant"
            );
            let decoded = Packet::deserialize(&bytes)
                .unwrap_or_else(|e| panic!("decode failed for {packet:?}: {e}"));
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn empty_data_chunk_roundtrip() {
        let packet = Packet::Data {
            transfer_id: 1,
            chunk: Bytes::new(),
        };
        let decoded = Packet::deserialize(&packet.serialize().expect("serialize")).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn unknown_discriminant_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            Packet::deserialize(&frame),
            Err(DecodeError::UnexpectedType { discriminant: 99 })
        );
    }

    #[test]
    fn truncated_frame_rejected() {
        let full = Packet::CloseAcknowledge { source: peer(1) }
            .serialize()
            .expect("serialize");
        let result = Packet::deserialize(&full[..10]);
        assert!(matches!(
            result,
            Err(DecodeError::TruncatedFrame { needed: 16, .. })
        ));
    }

    #[test]
    fn zero_destination_multicast_rejected() {
        // type | source | count=0 | leaf tree
        let mut frame = Vec::new();
        frame.extend_from_slice(&(PacketType::MulticastHandshake as u32).to_le_bytes());
        frame.extend_from_slice(peer(1).as_bytes());
        frame.extend_from_slice(&0i32.to_le_bytes());
        frame.extend_from_slice(peer(2).as_bytes());
        frame.extend_from_slice(&0i32.to_le_bytes());

        assert_eq!(
            Packet::deserialize(&frame),
            Err(DecodeError::InvalidField {
                packet: PacketType::MulticastHandshake,
                reason: "zero destinations",
            })
        );
    }

    #[test]
    fn zero_destination_multicast_unencodable() {
        let packet = Packet::MulticastHandshake {
            source: peer(1),
            destinations: Vec::new(),
            next_hops: Tree::leaf(peer(2)),
        };
        assert_eq!(
            packet.serialize(),
            Err(EncodeError::InvalidPacket {
                packet: PacketType::MulticastHandshake,
                reason: "zero destinations",
            })
        );
    }

    #[test]
    fn unknown_purpose_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(PacketType::LinkHandshake as u32).to_le_bytes());
        frame.extend_from_slice(peer(1).as_bytes());
        frame.extend_from_slice(&7u32.to_le_bytes());

        assert!(matches!(
            Packet::deserialize(&frame),
            Err(DecodeError::InvalidField { .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = Packet::CloseRequest.serialize().expect("serialize").to_vec();
        frame.push(0xFF);
        assert!(matches!(
            Packet::deserialize(&frame),
            Err(DecodeError::InvalidField {
                reason: "trailing bytes after packet",
                ..
            })
        ));
    }

    #[test]
    fn tree_preorder_layout() {
        // root(1) with children 2 and 3; child 2 has leaf 4
        let tree = Tree::with_children(
            peer(1),
            vec![
                Tree::with_children(peer(2), vec![Tree::leaf(peer(4))]),
                Tree::leaf(peer(3)),
            ],
        );
        let packet = Packet::MulticastHandshake {
            source: peer(1),
            destinations: vec![peer(3), peer(4)],
            next_hops: tree,
        };
        let bytes = packet.serialize().expect("serialize");

        // Skip type, source, count, two destination ids
        let tree_bytes = &bytes[4 + 16 + 4 + 32..];
        assert_eq!(&tree_bytes[..16], peer(1).as_bytes()); // root value
        assert_eq!(&tree_bytes[16..20], &2i32.to_le_bytes()); // two children
        assert_eq!(&tree_bytes[20..36], peer(2).as_bytes()); // first child preorder
    }
}
