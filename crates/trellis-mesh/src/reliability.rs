//! Orderly close and automatic reconnection for one packet connection.
//!
//! The close protocol is three packets: a `CloseRequest` asks the driving
//! side to announce, a `CloseAnnounce` tells every destination the
//! connection is going down, and each destination answers with a
//! `CloseAcknowledge` carrying its identifier. The side that collects
//! acknowledgements from every destination disconnects the underlying
//! link; both sides then observe an expected close.
//!
//! Reconnection is driven only on the side that originally dialed: an
//! unexpected link loss schedules an attempt after a short delay, each
//! failed attempt schedules the next after the regular delay, and after
//! the configured maximum the delegate hears `ClosedUnexpectedly` exactly
//! once. An attempt completes only through an explicit
//! [`reconnect_failed`](ReliabilityManager::reconnect_failed) or a link
//! attach; a new attempt never starts while one is in flight.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use trellis_link::packet::{Packet, PacketType};
use trellis_link::{LinkError, PeerId};

/// Packet types consumed by a [`ReliabilityManager`].
pub const RELIABILITY_PACKET_TYPES: &[PacketType] = &[
    PacketType::CloseRequest,
    PacketType::CloseAnnounce,
    PacketType::CloseAcknowledge,
];

/// Delegate notifications.
#[derive(Debug, Clone)]
pub enum ReliabilityEvent {
    /// The underlying link is (re)connected.
    Connected,
    /// The connection closed as part of the close protocol.
    ClosedExpectedly,
    /// Reconnection gave up; the original link error, if any.
    ClosedUnexpectedly(Option<Arc<LinkError>>),
}

/// Effects the owning event loop must apply.
#[derive(Debug, Clone)]
pub enum ReliabilityEffect {
    /// Write a packet through the managed connection.
    Write(Packet),
    /// Tear down the underlying link cleanly.
    DisconnectUnderlying,
    /// Ask the connection manager to re-establish the underlying link.
    /// Completion is reported via `underlying_did_connect` or
    /// `reconnect_failed`.
    EstablishUnderlying,
    /// Arm the reconnect timer for this delay; the tick must come back
    /// through `reconnect_due` with this generation.
    ScheduleReconnect { generation: u64, delay: Duration },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Notify the delegate.
    Notify(ReliabilityEvent),
    /// Remove the managed connection from its connection manager.
    RemoveConnection,
}

/// Close-and-reconnect state machine for one managed connection.
pub struct ReliabilityManager {
    local: PeerId,
    destinations: BTreeSet<PeerId>,
    /// True on the side that dialed and drives reconnection.
    reconnects: bool,

    acks: BTreeSet<PeerId>,
    expecting_close: bool,

    attempts: u32,
    attempt_in_flight: bool,
    original_error: Option<Arc<LinkError>>,
    timer_generation: u64,

    short_delay: Duration,
    regular_delay: Duration,
    max_attempts: u32,
}

impl ReliabilityManager {
    pub fn new(
        local: PeerId,
        destinations: BTreeSet<PeerId>,
        reconnects: bool,
        short_delay: Duration,
        regular_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            local,
            destinations,
            reconnects,
            acks: BTreeSet::new(),
            expecting_close: false,
            attempts: 0,
            attempt_in_flight: false,
            original_error: None,
            timer_generation: 0,
            short_delay,
            regular_delay,
            max_attempts,
        }
    }

    pub fn is_expecting_close(&self) -> bool {
        self.expecting_close
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    // ── Close protocol ─────────────────────────────────────────────────

    /// Begin closing the connection from this side.
    pub fn close_connection(&mut self) -> Vec<ReliabilityEffect> {
        let packet = if self.reconnects {
            Packet::CloseAnnounce
        } else {
            Packet::CloseRequest
        };
        vec![ReliabilityEffect::Write(packet)]
    }

    /// One of the close-protocol packets arrived.
    pub fn handle_packet(&mut self, packet: &Packet) -> Vec<ReliabilityEffect> {
        match packet {
            Packet::CloseRequest => vec![ReliabilityEffect::Write(Packet::CloseAnnounce)],
            Packet::CloseAnnounce => {
                self.expecting_close = true;
                vec![ReliabilityEffect::Write(Packet::CloseAcknowledge {
                    source: self.local,
                })]
            }
            Packet::CloseAcknowledge { source } => {
                self.acks.insert(*source);
                if self.acks == self.destinations {
                    self.acks.clear();
                    self.expecting_close = true;
                    vec![ReliabilityEffect::DisconnectUnderlying]
                } else {
                    Vec::new()
                }
            }
            other => {
                tracing::warn!(?other, "reliability manager got unrelated packet");
                Vec::new()
            }
        }
    }

    // ── Reconnect loop ─────────────────────────────────────────────────

    /// The underlying link closed. Expected closes notify and remove;
    /// unexpected ones start the reconnect loop (on the driving side).
    pub fn underlying_did_close(
        &mut self,
        error: Option<Arc<LinkError>>,
    ) -> Vec<ReliabilityEffect> {
        if self.expecting_close {
            return vec![
                ReliabilityEffect::CancelReconnect,
                ReliabilityEffect::Notify(ReliabilityEvent::ClosedExpectedly),
                ReliabilityEffect::RemoveConnection,
            ];
        }

        if self.original_error.is_none() {
            self.original_error = error;
        }

        if !self.reconnects {
            // Passively hosted: wait for the driving side to come back.
            return Vec::new();
        }
        if self.attempt_in_flight {
            // The link we were told about is already being replaced.
            return Vec::new();
        }
        self.attempts = 0;
        vec![self.schedule(self.short_delay)]
    }

    /// A reconnect timer tick. Stale generations and ticks racing an
    /// attempt in flight are ignored.
    pub fn reconnect_due(&mut self, generation: u64) -> Vec<ReliabilityEffect> {
        if generation != self.timer_generation || self.attempt_in_flight || self.expecting_close {
            return Vec::new();
        }
        self.attempts += 1;
        self.attempt_in_flight = true;
        tracing::debug!(attempt = self.attempts, "attempting reconnect");
        vec![ReliabilityEffect::EstablishUnderlying]
    }

    /// The connection manager reported that the attempt failed.
    pub fn reconnect_failed(&mut self) -> Vec<ReliabilityEffect> {
        if !self.attempt_in_flight {
            return Vec::new();
        }
        self.attempt_in_flight = false;

        if self.attempts >= self.max_attempts {
            let original = self.original_error.take();
            self.expecting_close = true;
            return vec![
                ReliabilityEffect::CancelReconnect,
                ReliabilityEffect::Notify(ReliabilityEvent::ClosedUnexpectedly(original)),
                ReliabilityEffect::RemoveConnection,
            ];
        }
        vec![self.schedule(self.regular_delay)]
    }

    /// The underlying link is (re)attached and open.
    pub fn underlying_did_connect(&mut self) -> Vec<ReliabilityEffect> {
        self.attempts = 0;
        self.attempt_in_flight = false;
        self.original_error = None;
        vec![
            ReliabilityEffect::CancelReconnect,
            ReliabilityEffect::Notify(ReliabilityEvent::Connected),
        ]
    }

    fn schedule(&mut self, delay: Duration) -> ReliabilityEffect {
        self.timer_generation += 1;
        ReliabilityEffect::ScheduleReconnect {
            generation: self.timer_generation,
            delay,
        }
    }
}
