//! Per-peer connection record and state machine (§4.3). Owned by the
//! reactor, keyed by peer address — timer closures must key by address
//! rather than hold an owning reference into this table (§9).

use std::collections::HashMap;
use std::time::Instant;

use crate::address::Address;
use crate::error::ProtocolError;
use crate::packet::{PacketFamily, PacketKind, PacketType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Undiscovered,
    DiscoveryRequested,
    Discovered,
    Disconnected,
}

impl ConnectionState {
    /// Whether an incoming `(family, kind)` is permitted in this state,
    /// per the §4.3 acceptance table.
    pub fn accepts(self, incoming: PacketType) -> bool {
        match self {
            Self::Undiscovered | Self::Disconnected => {
                matches!(incoming.family, PacketFamily::Normal)
                    && matches!(incoming.kind, PacketKind::Probe)
            }
            Self::DiscoveryRequested => {
                matches!(incoming.kind, PacketKind::Probe)
                    && matches!(incoming.family, PacketFamily::Normal | PacketFamily::Ack)
            }
            Self::Discovered => true,
        }
    }
}

/// Bounded retry counter per packet kind; exhausting the NACK budget
/// for any kind disconnects the peer.
#[derive(Debug, Clone, Default)]
pub struct NackCounters {
    counts: HashMap<PacketKind, u32>,
}

impl NackCounters {
    pub fn bump(&mut self, kind: PacketKind) -> u32 {
        let entry = self.counts.entry(kind).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn reset(&mut self, kind: PacketKind) {
        self.counts.remove(&kind);
    }

    pub fn count(&self, kind: PacketKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

/// One in-flight reliability wait: the kind awaiting acknowledgement,
/// the sequence number it was sent with, and the deadline by which an
/// ACK must arrive before a NACK is emitted.
#[derive(Debug, Clone, Copy)]
pub struct PendingAck {
    pub kind: PacketKind,
    pub sequence_number: u32,
    pub deadline: Instant,
}

pub struct Connection {
    pub address: Address,
    pub state: ConnectionState,
    pub last_sent_seq_n: u32,
    pub last_recv_seq_n: u32,
    pub last_sent_packet_type: Option<PacketType>,
    pub last_received_packet_type: Option<PacketType>,
    pub receive_buffer: Vec<u8>,
    pub nack_counts: NackCounters,
    pub pending_ack: Option<PendingAck>,
    pub last_heartbeat_received: Option<Instant>,
}

impl Connection {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: ConnectionState::Undiscovered,
            last_sent_seq_n: 0,
            last_recv_seq_n: 0,
            last_sent_packet_type: None,
            last_received_packet_type: None,
            receive_buffer: Vec::new(),
            nack_counts: NackCounters::default(),
            pending_ack: None,
            last_heartbeat_received: None,
        }
    }

    /// Next outgoing sequence number for this peer; every normal
    /// packet sent consumes exactly one.
    pub fn next_send_seq(&mut self) -> u32 {
        self.last_sent_seq_n += 1;
        self.last_sent_seq_n
    }

    /// Accepts or rejects an incoming sequence number. A strictly
    /// older number is out-of-order; an equal one is the duplicate of
    /// the most recently accepted packet (ACK-loss retry) and is
    /// accepted again without advancing state.
    pub fn check_incoming_seq(
        &self,
        kind: PacketKind,
        seq: u32,
    ) -> Result<IncomingSeq, ProtocolError> {
        if seq < self.last_recv_seq_n {
            return Err(ProtocolError::OutOfOrder {
                kind: kind.name(),
                sender: self.address.to_string(),
            });
        }
        if seq == self.last_recv_seq_n && self.last_recv_seq_n != 0 {
            return Ok(IncomingSeq::Duplicate);
        }
        Ok(IncomingSeq::Fresh)
    }

    pub fn record_incoming(&mut self, packet_type: PacketType, seq: u32) {
        self.last_recv_seq_n = self.last_recv_seq_n.max(seq);
        self.last_received_packet_type = Some(packet_type);
    }

    pub fn record_outgoing(&mut self, packet_type: PacketType) {
        self.last_sent_packet_type = Some(packet_type);
    }

    /// Whether `ack` matches what we are currently waiting on, per the
    /// `discovered` state's "ack matching last_sent_packet_type" rule.
    pub fn ack_matches_outstanding(&self, ack_kind: PacketKind) -> bool {
        matches!(
            self.last_sent_packet_type,
            Some(t) if t.kind == ack_kind
        )
    }

    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.pending_ack = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingSeq {
    Fresh,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undiscovered_accepts_only_probe() {
        let state = ConnectionState::Undiscovered;
        assert!(state.accepts(PacketType::normal(PacketKind::Probe)));
        assert!(!state.accepts(PacketType::normal(PacketKind::Heartbeat)));
    }

    #[test]
    fn discovered_accepts_matching_ack_and_any_normal() {
        let state = ConnectionState::Discovered;
        assert!(state.accepts(PacketType::normal(PacketKind::Publish)));
        assert!(state.accepts(PacketType::ack(PacketKind::Heartbeat)));
        assert!(state.accepts(PacketType::new(
            crate::packet::PacketFamily::Nack,
            PacketKind::Publish
        )));
    }

    #[test]
    fn sequence_numbers_strictly_increase_on_send() {
        let mut conn = Connection::new(Address::new(1, 1));
        assert_eq!(conn.next_send_seq(), 1);
        assert_eq!(conn.next_send_seq(), 2);
        assert_eq!(conn.next_send_seq(), 3);
    }

    #[test]
    fn out_of_order_receive_is_rejected_without_mutation() {
        let mut conn = Connection::new(Address::new(1, 1));
        conn.record_incoming(PacketType::normal(PacketKind::Publish), 10);
        let result = conn.check_incoming_seq(PacketKind::Publish, 7);
        assert!(matches!(result, Err(ProtocolError::OutOfOrder { .. })));
        assert_eq!(conn.last_recv_seq_n, 10);
    }

    #[test]
    fn duplicate_of_most_recent_is_accepted() {
        let mut conn = Connection::new(Address::new(1, 1));
        conn.record_incoming(PacketType::normal(PacketKind::Heartbeat), 5);
        assert_eq!(
            conn.check_incoming_seq(PacketKind::Heartbeat, 5).unwrap(),
            IncomingSeq::Duplicate
        );
    }

    #[test]
    fn zero_sequence_number_never_recorded_as_duplicate_baseline() {
        let conn = Connection::new(Address::new(1, 1));
        assert_eq!(
            conn.check_incoming_seq(PacketKind::Probe, 1).unwrap(),
            IncomingSeq::Fresh
        );
    }
}
