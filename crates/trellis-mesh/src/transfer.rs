//! Chunked, cancellable transfers over a packet connection.
//!
//! An outbound payload becomes `TransferStarted`, a run of `Data` chunks,
//! then `TransferCompleted`. Chunks are paced by the connection's drain:
//! each `did_write_all_packets` releases the next one, so a transfer never
//! floods the outbox. Inbound chunks go to an attached partial sink if one
//! exists, otherwise into a buffer delivered whole on completion. A
//! cancelled transfer never delivers completion data.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use trellis_link::packet::{Packet, PacketType};

/// Packet types consumed by a [`TransferManager`].
pub const TRANSFER_PACKET_TYPES: &[PacketType] = &[
    PacketType::Data,
    PacketType::TransferStarted,
    PacketType::TransferCancelled,
    PacketType::TransferCompleted,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// Effects for the owning event loop.
#[derive(Debug)]
pub enum TransferEffect {
    /// Write a packet through the connection.
    Write(Packet),
    /// Surface a transfer event to the application.
    Notify(TransferEvent),
}

/// Application-visible transfer notifications.
#[derive(Debug)]
pub enum TransferEvent {
    /// A remote peer started sending a transfer. Attach a sink through the
    /// manager to receive its bytes.
    IncomingStarted { transfer_id: u32, length: u32 },
    /// Bytes moved, in either direction.
    Progress {
        transfer_id: u32,
        progress: u32,
        length: u32,
    },
    /// An outbound transfer was fully written.
    SendCompleted { transfer_id: u32 },
    /// An inbound transfer finished and no complete-sink was attached.
    ReceiveCompleted { transfer_id: u32 },
    /// The transfer ended by cancellation (either side).
    Cancelled { transfer_id: u32 },
    /// The transfer failed (link loss or protocol violation).
    Failed { transfer_id: u32 },
}

// ── Outbound ────────────────────────────────────────────────────────────

struct OutTransfer {
    id: u32,
    data: Bytes,
    offset: usize,
    started: bool,
    completed: bool,
}

impl OutTransfer {
    fn next_packet(&mut self, chunk_size: usize) -> Packet {
        if !self.started {
            self.started = true;
            return Packet::TransferStarted {
                transfer_id: self.id,
                length: self.data.len() as u32,
            };
        }
        if self.offset < self.data.len() {
            let end = (self.offset + chunk_size).min(self.data.len());
            let chunk = self.data.slice(self.offset..end);
            self.offset = end;
            return Packet::Data {
                transfer_id: self.id,
                chunk,
            };
        }
        self.completed = true;
        Packet::TransferCompleted {
            transfer_id: self.id,
        }
    }

    fn is_done(&self) -> bool {
        self.completed
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────

struct InTransfer {
    id: u32,
    length: u32,
    progress: u32,
    partial: Option<mpsc::Sender<Bytes>>,
    complete: Option<oneshot::Sender<Bytes>>,
    buffer: BytesMut,
    warned_both_sinks: bool,
}

impl InTransfer {
    fn receive_chunk(&mut self, chunk: Bytes) {
        self.progress = self
            .progress
            .saturating_add(chunk.len() as u32)
            .min(self.length);

        if let Some(partial) = &self.partial {
            if self.complete.is_some() && !self.warned_both_sinks {
                self.warned_both_sinks = true;
                tracing::warn!(
                    transfer_id = self.id,
                    "both partial and complete sinks attached, partial wins"
                );
            }
            if partial.try_send(chunk).is_err() {
                tracing::debug!(transfer_id = self.id, "partial sink gone, dropping chunk");
            }
        } else if self.complete.is_some() {
            self.buffer.extend_from_slice(&chunk);
        } else {
            tracing::error!(
                transfer_id = self.id,
                "no sink attached to incoming transfer, payload dropped"
            );
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────────

/// All transfers of one packet connection, both directions.
///
/// Identifiers are unique per connection, allocated from a counter.
pub struct TransferManager {
    chunk_size: usize,
    next_id: u32,
    /// Outbound transfers, written one at a time in FIFO order.
    outgoing: Vec<OutTransfer>,
    incoming: BTreeMap<u32, InTransfer>,
}

impl TransferManager {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            next_id: 0,
            outgoing: Vec::new(),
            incoming: BTreeMap::new(),
        }
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Queue an outbound payload. Returns the transfer id; the first
    /// packet goes out immediately if nothing else is in front of it.
    pub fn send(&mut self, data: Bytes) -> (u32, Vec<TransferEffect>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.outgoing.push(OutTransfer {
            id,
            data,
            offset: 0,
            started: false,
            completed: false,
        });

        let mut effects = Vec::new();
        if self.outgoing.len() == 1 {
            effects.push(TransferEffect::Write(
                self.outgoing[0].next_packet(self.chunk_size),
            ));
        }
        (id, effects)
    }

    /// Cancel an outbound transfer.
    pub fn cancel(&mut self, transfer_id: u32) -> Vec<TransferEffect> {
        let Some(index) = self.outgoing.iter().position(|t| t.id == transfer_id) else {
            return Vec::new();
        };
        self.outgoing.remove(index);
        // The next queued transfer starts on the following drain cycle.
        vec![
            TransferEffect::Write(Packet::TransferCancelled { transfer_id }),
            TransferEffect::Notify(TransferEvent::Cancelled { transfer_id }),
        ]
    }

    /// The connection's outbox drained; release the next packet of the
    /// front transfer.
    pub fn did_write_all_packets(&mut self) -> Vec<TransferEffect> {
        let Some(front) = self.outgoing.first_mut() else {
            return Vec::new();
        };

        if front.is_done() {
            // The completed packet was the last write.
            let id = front.id;
            self.outgoing.remove(0);
            let mut effects = vec![TransferEffect::Notify(TransferEvent::SendCompleted {
                transfer_id: id,
            })];
            if let Some(next) = self.outgoing.first_mut() {
                effects.push(TransferEffect::Write(next.next_packet(self.chunk_size)));
            }
            return effects;
        }

        let packet = front.next_packet(self.chunk_size);
        let mut effects = Vec::new();
        if matches!(packet, Packet::Data { .. }) {
            effects.push(TransferEffect::Notify(TransferEvent::Progress {
                transfer_id: front.id,
                progress: front.offset as u32,
                length: front.data.len() as u32,
            }));
        }
        effects.push(TransferEffect::Write(packet));
        effects
    }

    /// Attach a chunk-by-chunk sink to an incoming transfer. Preferred
    /// over a complete-sink when both are attached.
    pub fn attach_partial_sink(&mut self, transfer_id: u32, sink: mpsc::Sender<Bytes>) -> bool {
        match self.incoming.get_mut(&transfer_id) {
            Some(transfer) => {
                transfer.partial = Some(sink);
                true
            }
            None => false,
        }
    }

    /// Attach a whole-payload sink to an incoming transfer.
    pub fn attach_complete_sink(
        &mut self,
        transfer_id: u32,
        sink: oneshot::Sender<Bytes>,
    ) -> bool {
        match self.incoming.get_mut(&transfer_id) {
            Some(transfer) => {
                transfer.complete = Some(sink);
                true
            }
            None => false,
        }
    }

    /// A transfer-related packet arrived on the connection.
    pub fn handle_packet(&mut self, packet: &Packet) -> Vec<TransferEffect> {
        match packet {
            Packet::TransferStarted {
                transfer_id,
                length,
            } => {
                if self.incoming.contains_key(transfer_id) {
                    tracing::warn!(transfer_id, "duplicate TransferStarted, ignoring");
                    return Vec::new();
                }
                self.incoming.insert(
                    *transfer_id,
                    InTransfer {
                        id: *transfer_id,
                        length: *length,
                        progress: 0,
                        partial: None,
                        complete: None,
                        buffer: BytesMut::new(),
                        warned_both_sinks: false,
                    },
                );
                vec![TransferEffect::Notify(TransferEvent::IncomingStarted {
                    transfer_id: *transfer_id,
                    length: *length,
                })]
            }
            Packet::Data { transfer_id, chunk } => {
                let Some(transfer) = self.incoming.get_mut(transfer_id) else {
                    tracing::warn!(transfer_id, "chunk for unknown transfer, dropping");
                    return Vec::new();
                };
                transfer.receive_chunk(chunk.clone());
                vec![TransferEffect::Notify(TransferEvent::Progress {
                    transfer_id: *transfer_id,
                    progress: transfer.progress,
                    length: transfer.length,
                })]
            }
            Packet::TransferCompleted { transfer_id } => {
                let Some(mut transfer) = self.incoming.remove(transfer_id) else {
                    return Vec::new();
                };
                if let Some(complete) = transfer.complete.take() {
                    let _ = complete.send(transfer.buffer.freeze());
                }
                vec![TransferEffect::Notify(TransferEvent::ReceiveCompleted {
                    transfer_id: *transfer_id,
                })]
            }
            Packet::TransferCancelled { transfer_id } => {
                // Remote cancelled: drop buffered bytes, fire the end hook.
                if self.incoming.remove(transfer_id).is_none() {
                    return Vec::new();
                }
                vec![TransferEffect::Notify(TransferEvent::Cancelled {
                    transfer_id: *transfer_id,
                })]
            }
            other => {
                tracing::warn!(?other, "transfer manager got unrelated packet");
                Vec::new()
            }
        }
    }

    /// The underlying link is gone for good; fail everything in flight.
    pub fn link_lost(&mut self) -> Vec<TransferEffect> {
        let mut effects = Vec::new();
        for transfer in self.outgoing.drain(..) {
            effects.push(TransferEffect::Notify(TransferEvent::Failed {
                transfer_id: transfer.id,
            }));
        }
        let ids: Vec<u32> = self.incoming.keys().copied().collect();
        for id in ids {
            self.incoming.remove(&id);
            effects.push(TransferEffect::Notify(TransferEvent::Failed {
                transfer_id: id,
            }));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(manager: &mut TransferManager, first: Vec<TransferEffect>) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut pending = first;
        loop {
            let mut wrote = false;
            for effect in pending {
                if let TransferEffect::Write(packet) = effect {
                    packets.push(packet);
                    wrote = true;
                }
            }
            if !wrote {
                break;
            }
            pending = manager.did_write_all_packets();
        }
        packets
    }

    #[test]
    fn chunking_40000_bytes_into_16k_chunks() {
        let mut manager = TransferManager::new(16384);
        let payload = Bytes::from(vec![0xA5u8; 40000]);
        let (id, effects) = manager.send(payload.clone());

        let packets = drain_all(&mut manager, effects);

        assert_eq!(
            packets[0],
            Packet::TransferStarted {
                transfer_id: id,
                length: 40000
            }
        );
        let chunk_sizes: Vec<usize> = packets[1..packets.len() - 1]
            .iter()
            .map(|p| match p {
                Packet::Data { chunk, .. } => chunk.len(),
                other => panic!("expected Data, got {other:?}"),
            })
            .collect();
        assert_eq!(chunk_sizes, vec![16384, 16384, 7232]);
        assert_eq!(
            packets[packets.len() - 1],
            Packet::TransferCompleted { transfer_id: id }
        );

        // Receiver reassembles to the original payload.
        let mut receiver = TransferManager::new(16384);
        let (tx, mut rx) = oneshot::channel();
        receiver.handle_packet(&packets[0]);
        assert!(receiver.attach_complete_sink(id, tx));
        for packet in &packets[1..] {
            receiver.handle_packet(packet);
        }
        let assembled = rx.try_recv().unwrap();
        assert_eq!(assembled, payload);
    }

    #[test]
    fn ids_are_unique_per_connection() {
        let mut manager = TransferManager::new(4);
        let (a, _) = manager.send(Bytes::from_static(b"one"));
        let (b, _) = manager.send(Bytes::from_static(b"two"));
        assert_ne!(a, b);
    }

    #[test]
    fn transfers_run_one_at_a_time_in_order() {
        let mut manager = TransferManager::new(1024);
        let (first, effects) = manager.send(Bytes::from_static(b"first"));
        let (second, _) = manager.send(Bytes::from_static(b"second"));

        let packets = drain_all(&mut manager, effects);
        let starts: Vec<u32> = packets
            .iter()
            .filter_map(|p| match p {
                Packet::TransferStarted { transfer_id, .. } => Some(*transfer_id),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![first, second]);
        assert_eq!(manager.outgoing_len(), 0);
    }

    #[test]
    fn progress_reported_after_each_chunk() {
        let mut manager = TransferManager::new(10);
        // Started goes out with the send; drive the three chunks.
        let (_, _started) = manager.send(Bytes::from(vec![0u8; 25]));

        let mut progresses = Vec::new();
        for _ in 0..3 {
            for effect in manager.did_write_all_packets() {
                if let TransferEffect::Notify(TransferEvent::Progress { progress, .. }) = effect {
                    progresses.push(progress);
                }
            }
        }
        assert_eq!(progresses, vec![10, 20, 25]);
    }

    #[test]
    fn cancel_writes_cancelled_and_stops_chunks() {
        let mut manager = TransferManager::new(8);
        let (id, _) = manager.send(Bytes::from(vec![1u8; 64]));

        let effects = manager.cancel(id);
        assert!(effects.iter().any(|e| matches!(
            e,
            TransferEffect::Write(Packet::TransferCancelled { transfer_id }) if *transfer_id == id
        )));
        assert!(effects.iter().any(|e| matches!(
            e,
            TransferEffect::Notify(TransferEvent::Cancelled { .. })
        )));

        // No further chunks for the cancelled transfer.
        let effects = manager.did_write_all_packets();
        assert!(effects.is_empty());
    }

    #[test]
    fn remote_cancel_drops_buffer_and_never_completes() {
        let mut manager = TransferManager::new(8);
        manager.handle_packet(&Packet::TransferStarted {
            transfer_id: 9,
            length: 16,
        });
        let (tx, mut rx) = oneshot::channel();
        manager.attach_complete_sink(9, tx);
        manager.handle_packet(&Packet::Data {
            transfer_id: 9,
            chunk: Bytes::from_static(b"01234567"),
        });

        let effects = manager.handle_packet(&Packet::TransferCancelled { transfer_id: 9 });
        assert!(effects.iter().any(|e| matches!(
            e,
            TransferEffect::Notify(TransferEvent::Cancelled { .. })
        )));
        assert_eq!(manager.incoming_len(), 0);
        // The complete sink was dropped without a payload.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn partial_sink_preferred_over_complete() {
        let mut manager = TransferManager::new(8);
        manager.handle_packet(&Packet::TransferStarted {
            transfer_id: 3,
            length: 8,
        });
        let (partial_tx, mut partial_rx) = mpsc::channel(4);
        let (complete_tx, mut complete_rx) = oneshot::channel();
        manager.attach_partial_sink(3, partial_tx);
        manager.attach_complete_sink(3, complete_tx);

        manager.handle_packet(&Packet::Data {
            transfer_id: 3,
            chunk: Bytes::from_static(b"abcd"),
        });
        assert_eq!(partial_rx.try_recv().unwrap(), Bytes::from_static(b"abcd"));

        manager.handle_packet(&Packet::TransferCompleted { transfer_id: 3 });
        // Complete sink fires with an empty buffer: partial consumed the bytes.
        assert_eq!(complete_rx.try_recv().unwrap(), Bytes::new());
    }

    #[test]
    fn no_sink_drops_payload() {
        let mut manager = TransferManager::new(8);
        manager.handle_packet(&Packet::TransferStarted {
            transfer_id: 4,
            length: 4,
        });
        manager.handle_packet(&Packet::Data {
            transfer_id: 4,
            chunk: Bytes::from_static(b"data"),
        });
        let effects = manager.handle_packet(&Packet::TransferCompleted { transfer_id: 4 });
        assert!(effects.iter().any(|e| matches!(
            e,
            TransferEffect::Notify(TransferEvent::ReceiveCompleted { .. })
        )));
    }

    #[test]
    fn link_lost_fails_everything() {
        let mut manager = TransferManager::new(8);
        manager.send(Bytes::from(vec![0u8; 32]));
        manager.handle_packet(&Packet::TransferStarted {
            transfer_id: 77,
            length: 10,
        });

        let effects = manager.link_lost();
        let failed: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, TransferEffect::Notify(TransferEvent::Failed { .. })))
            .collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(manager.outgoing_len(), 0);
        assert_eq!(manager.incoming_len(), 0);
    }

    #[test]
    fn empty_payload_still_frames_start_and_complete() {
        let mut manager = TransferManager::new(8);
        let (id, effects) = manager.send(Bytes::new());
        let packets = drain_all(&mut manager, effects);
        assert_eq!(
            packets,
            vec![
                Packet::TransferStarted {
                    transfer_id: id,
                    length: 0
                },
                Packet::TransferCompleted { transfer_id: id },
            ]
        );
    }
}
