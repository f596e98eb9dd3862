//! Protocol v1 wire packets: header, the six normal kinds plus their
//! ACK/NACK families, and the factory that turns a received datagram
//! into a typed packet.

mod body;
mod hash;

pub use body::{
    HeartbeatBody, PeerEntry, PublishBody, Publication, SubscribeBody, TopicSet,
};
pub use hash::{is_topic_filter, topic_hash};

use crate::codec::{InputStream, OutputStream};
use crate::error::ProtocolError;

pub const MAGIC: u64 = 0x6f63_746f_7075_7321; // "octopus!" little-endian on the wire
pub const HEADER_SIZE: usize = 14;
pub const MIN_SEQ_N: u32 = 1;
pub const CURRENT_VERSION: u8 = 1;

/// MTU-bounded payload budget; subscribe/unsubscribe/publish bodies
/// split into blocks once the serialized body would exceed this.
pub const MTU_BUDGET: usize = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketFamily {
    Normal,
    Ack,
    Nack,
}

impl PacketFamily {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x00 => Some(Self::Normal),
            0x10 => Some(Self::Ack),
            0x20 => Some(Self::Nack),
            _ => None,
        }
    }

    fn nibble(self) -> u8 {
        match self {
            Self::Normal => 0x00,
            Self::Ack => 0x10,
            Self::Nack => 0x20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Probe,
    Heartbeat,
    Subscribe,
    Unsubscribe,
    Publish,
    Disconnect,
}

impl PacketKind {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x1 => Some(Self::Probe),
            0x2 => Some(Self::Heartbeat),
            0x3 => Some(Self::Subscribe),
            0x4 => Some(Self::Unsubscribe),
            0x5 => Some(Self::Publish),
            0x6 => Some(Self::Disconnect),
            _ => None,
        }
    }

    fn nibble(self) -> u8 {
        match self {
            Self::Probe => 0x1,
            Self::Heartbeat => 0x2,
            Self::Subscribe => 0x3,
            Self::Unsubscribe => 0x4,
            Self::Publish => 0x5,
            Self::Disconnect => 0x6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Heartbeat => "heartbeat",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Disconnect => "disconnect",
        }
    }
}

/// `(family, kind)` pair, encoded as a single byte (family in the high
/// nibble, kind in the low nibble). Not every pair is constructible:
/// `disconnect` has no nack, and `probe` has no nack either (probes are
/// retried as fresh probes, never negatively acknowledged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketType {
    pub family: PacketFamily,
    pub kind: PacketKind,
}

impl PacketType {
    pub const fn new(family: PacketFamily, kind: PacketKind) -> Self {
        Self { family, kind }
    }

    pub fn normal(kind: PacketKind) -> Self {
        Self::new(PacketFamily::Normal, kind)
    }

    pub fn ack(kind: PacketKind) -> Self {
        Self::new(PacketFamily::Ack, kind)
    }

    /// The nack counterpart of this type's kind, if one exists.
    pub fn nack(kind: PacketKind) -> Result<Self, ProtocolError> {
        match kind {
            PacketKind::Disconnect => Err(ProtocolError::NackDoesNotExist),
            PacketKind::Probe => Err(ProtocolError::NackDoesNotExist),
            _ => Ok(Self::new(PacketFamily::Nack, kind)),
        }
    }

    pub fn byte(self) -> u8 {
        self.family.nibble() | self.kind.nibble()
    }

    /// Decodes a type byte, rejecting `disconnect_nack` and any
    /// `probe` + non-normal-family combination (probe only exists as
    /// `probe` or `probe_ack`).
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        let family_nibble = byte & 0xf0;
        let kind_nibble = byte & 0x0f;
        let family = PacketFamily::from_nibble(family_nibble)
            .ok_or(ProtocolError::InvalidPacketType { type_byte: byte })?;
        let kind = PacketKind::from_nibble(kind_nibble)
            .ok_or(ProtocolError::InvalidPacketType { type_byte: byte })?;

        let invalid = matches!(
            (family, kind),
            (PacketFamily::Nack, PacketKind::Disconnect) | (PacketFamily::Nack, PacketKind::Probe)
        );
        if invalid {
            return Err(ProtocolError::InvalidPacketType { type_byte: byte });
        }
        Ok(Self { family, kind })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub packet_type: PacketType,
    pub sequence_number: u32,
}

impl Header {
    pub fn write(&self, out: &mut OutputStream) {
        out.write_u64(MAGIC);
        out.write_u8(self.version);
        out.write_u8(self.packet_type.byte());
        out.write_u32(self.sequence_number);
    }

    /// Fail-fast validation order per the wire format: length, magic,
    /// version, type, sequence number.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::PacketTooSmall { len: buf.len() });
        }
        let mut input = InputStream::new(buf);
        let magic = input.read_u64().expect("length checked above");
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagicNumber);
        }
        let version = input.read_u8().expect("length checked above");
        if version != CURRENT_VERSION {
            return Err(ProtocolError::UnsupportedVersion { version });
        }
        let type_byte = input.read_u8().expect("length checked above");
        let packet_type = PacketType::from_byte(type_byte)?;
        let sequence_number = input.read_u32().expect("length checked above");
        if sequence_number < MIN_SEQ_N {
            return Err(ProtocolError::InvalidSequenceNumber);
        }
        Ok((
            Self {
                version,
                packet_type,
                sequence_number,
            },
            input.offset(),
        ))
    }
}

/// A fully parsed packet, keeping the serialized bytes alongside the
/// typed body so a send never needs to re-serialize.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub body: PacketBody,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Probe { ip: u32, port: u16 },
    Heartbeat(HeartbeatBody),
    Subscribe(SubscribeBody),
    Unsubscribe(SubscribeBody),
    Publish(PublishBody),
    Disconnect,
    /// ACK/NACK carry no body; the kind nibble says what's acknowledged.
    Empty,
}

impl Packet {
    /// Builds and serializes a packet of `kind` with no body (ack,
    /// nack, disconnect).
    pub fn empty(family: PacketFamily, kind: PacketKind, seq: u32) -> Self {
        let header = Header {
            version: CURRENT_VERSION,
            packet_type: PacketType::new(family, kind),
            sequence_number: seq,
        };
        let mut out = OutputStream::with_capacity(HEADER_SIZE);
        header.write(&mut out);
        let body = if matches!(kind, PacketKind::Disconnect) && matches!(family, PacketFamily::Normal)
        {
            PacketBody::Disconnect
        } else {
            PacketBody::Empty
        };
        Self {
            header,
            body,
            raw: out.into_bytes(),
        }
    }

    pub fn probe(seq: u32, ip: u32, port: u16) -> Self {
        let header = Header {
            version: CURRENT_VERSION,
            packet_type: PacketType::normal(PacketKind::Probe),
            sequence_number: seq,
        };
        let mut out = OutputStream::with_capacity(HEADER_SIZE + 6);
        header.write(&mut out);
        out.write_u32(ip);
        out.write_u16(port);
        Self {
            header,
            body: PacketBody::Probe { ip, port },
            raw: out.into_bytes(),
        }
    }

    pub fn heartbeat(seq: u32, body: HeartbeatBody) -> Self {
        let header = Header {
            version: CURRENT_VERSION,
            packet_type: PacketType::normal(PacketKind::Heartbeat),
            sequence_number: seq,
        };
        let mut out = OutputStream::with_capacity(HEADER_SIZE + 8 + body.peers.len() * 6);
        header.write(&mut out);
        body.write(&mut out);
        Self {
            header,
            body: PacketBody::Heartbeat(body),
            raw: out.into_bytes(),
        }
    }

    pub fn subscribe(seq: u32, body: SubscribeBody) -> Self {
        Self::subscribe_like(PacketKind::Subscribe, seq, body)
    }

    pub fn unsubscribe(seq: u32, body: SubscribeBody) -> Self {
        Self::subscribe_like(PacketKind::Unsubscribe, seq, body)
    }

    fn subscribe_like(kind: PacketKind, seq: u32, body: SubscribeBody) -> Self {
        let header = Header {
            version: CURRENT_VERSION,
            packet_type: PacketType::normal(kind),
            sequence_number: seq,
        };
        let mut out = OutputStream::with_capacity(HEADER_SIZE + 64);
        header.write(&mut out);
        body.write(&mut out);
        let wrapped = if matches!(kind, PacketKind::Subscribe) {
            PacketBody::Subscribe(body)
        } else {
            PacketBody::Unsubscribe(body)
        };
        Self {
            header,
            body: wrapped,
            raw: out.into_bytes(),
        }
    }

    pub fn publish(seq: u32, body: PublishBody) -> Self {
        let header = Header {
            version: CURRENT_VERSION,
            packet_type: PacketType::normal(PacketKind::Publish),
            sequence_number: seq,
        };
        let mut out = OutputStream::with_capacity(HEADER_SIZE + 128);
        header.write(&mut out);
        body.write(&mut out);
        Self {
            header,
            body: PacketBody::Publish(body),
            raw: out.into_bytes(),
        }
    }

    /// Deserializes a full datagram: header first (fail-fast order),
    /// then the kind-specific body.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (header, consumed) = Header::parse(buf)?;
        let rest = &buf[consumed..];
        let body = match header.packet_type.family {
            PacketFamily::Normal => match header.packet_type.kind {
                PacketKind::Probe => {
                    let mut input = InputStream::new(rest);
                    let ip = input
                        .read_u32()
                        .map_err(|_| ProtocolError::PacketTooSmall { len: buf.len() })?;
                    let port = input
                        .read_u16()
                        .map_err(|_| ProtocolError::PacketTooSmall { len: buf.len() })?;
                    PacketBody::Probe { ip, port }
                }
                PacketKind::Heartbeat => {
                    PacketBody::Heartbeat(HeartbeatBody::parse(rest, buf.len())?)
                }
                PacketKind::Subscribe => {
                    PacketBody::Subscribe(SubscribeBody::parse(rest, buf.len())?)
                }
                PacketKind::Unsubscribe => {
                    PacketBody::Unsubscribe(SubscribeBody::parse(rest, buf.len())?)
                }
                PacketKind::Publish => PacketBody::Publish(PublishBody::parse(rest, buf.len())?),
                PacketKind::Disconnect => PacketBody::Disconnect,
            },
            PacketFamily::Ack | PacketFamily::Nack => PacketBody::Empty,
        };
        Ok(Self {
            header,
            body,
            raw: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let p = Packet::probe(1, 0x0100_007f, 9000);
        let parsed = Packet::parse(&p.raw).unwrap();
        assert_eq!(parsed.raw, p.raw);
        assert_eq!(parsed.header, p.header);
        assert_eq!(parsed.body, p.body);
    }

    #[test]
    fn rejects_short_buffer() {
        let err = Packet::parse(&[0u8; 4]).unwrap_err();
        assert_eq!(err, ProtocolError::PacketTooSmall { len: 4 });
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Packet::probe(1, 0, 9000).raw;
        bytes[0] ^= 0xff;
        let err = Packet::parse(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidMagicNumber);
    }

    #[test]
    fn rejects_bad_version() {
        let mut bytes = Packet::probe(1, 0, 9000).raw;
        bytes[8] = 9;
        let err = Packet::parse(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion { version: 9 });
    }

    #[test]
    fn rejects_disconnect_nack() {
        let err = PacketType::from_byte(0x26).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidPacketType { type_byte: 0x26 });
    }

    #[test]
    fn rejects_probe_nack() {
        let err = PacketType::from_byte(0x21).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidPacketType { type_byte: 0x21 });
    }

    #[test]
    fn rejects_zero_sequence_number() {
        let mut bytes = Packet::probe(1, 0, 9000).raw;
        bytes[10..14].copy_from_slice(&0u32.to_le_bytes());
        let err = Packet::parse(&bytes).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidSequenceNumber);
    }
}
