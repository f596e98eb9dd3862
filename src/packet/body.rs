//! Kind-specific packet bodies: heartbeat peer lists, subscribe/
//! unsubscribe topic tables, and publish message batches — plus the
//! MTU-bounded block splitting shared by all three multi-entry kinds.

use crate::codec::{InputStream, OutputStream};
use crate::error::ProtocolError;

use super::hash::{is_hashable, topic_hash};
use super::{HEADER_SIZE, MTU_BUDGET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub ip: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatBody {
    pub interval_ms: u32,
    pub peers: Vec<PeerEntry>,
}

impl HeartbeatBody {
    pub fn write(&self, out: &mut OutputStream) {
        out.write_u32(self.interval_ms);
        out.write_u32(self.peers.len() as u32);
        for peer in &self.peers {
            out.write_u32(peer.ip);
            out.write_u16(peer.port);
        }
    }

    pub fn parse(rest: &[u8], total_len: usize) -> Result<Self, ProtocolError> {
        let mut input = InputStream::new(rest);
        let too_small = || ProtocolError::PacketTooSmall { len: total_len };
        let interval_ms = input.read_u32().map_err(|_| too_small())?;
        let list_size = input.read_u32().map_err(|_| too_small())?;
        let mut peers = Vec::with_capacity(list_size as usize);
        for _ in 0..list_size {
            let ip = input.read_u32().map_err(|_| too_small())?;
            let port = input.read_u16().map_err(|_| too_small())?;
            peers.push(PeerEntry { ip, port });
        }
        Ok(Self {
            interval_ms,
            peers,
        })
    }
}

/// A subscribe/unsubscribe topic table: short exact topics go in
/// `hashes`, everything else (filters and longer exact topics) in
/// `names`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSet {
    pub hashes: Vec<u64>,
    pub names: Vec<String>,
}

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies and adds one topic, per §3/§9's hash/name split.
    pub fn add_topic(&mut self, topic: &str) {
        if is_hashable(topic) {
            self.hashes.push(topic_hash(topic));
        } else {
            self.names.push(topic.to_string());
        }
    }

    fn write(&self, out: &mut OutputStream) {
        out.write_u32(self.hashes.len() as u32);
        for hash in &self.hashes {
            out.write_u64(*hash);
        }
        out.write_u32(self.names.len() as u32);
        for name in &self.names {
            out.write_cstr(name);
        }
    }

    fn parse(input: &mut InputStream<'_>, total_len: usize) -> Result<Self, ProtocolError> {
        let too_small = || ProtocolError::PacketTooSmall { len: total_len };
        let hash_count = input.read_u32().map_err(|_| too_small())?;
        let mut hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            hashes.push(input.read_u64().map_err(|_| too_small())?);
        }
        let name_count = input.read_u32().map_err(|_| too_small())?;
        let mut names = Vec::with_capacity(name_count as usize);
        for _ in 0..name_count {
            names.push(input.read_cstr().map_err(|_| too_small())?);
        }
        Ok(Self { hashes, names })
    }

    fn is_empty(&self) -> bool {
        self.hashes.is_empty() && self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeBody {
    pub subscription_id: u32,
    pub total_blocks: u32,
    pub block_n: u32,
    pub topics: TopicSet,
}

impl SubscribeBody {
    pub fn write(&self, out: &mut OutputStream) {
        out.write_u32(self.subscription_id);
        out.write_u32(self.total_blocks);
        out.write_u32(self.block_n);
        self.topics.write(out);
    }

    pub fn parse(rest: &[u8], total_len: usize) -> Result<Self, ProtocolError> {
        let mut input = InputStream::new(rest);
        let too_small = || ProtocolError::PacketTooSmall { len: total_len };
        let subscription_id = input.read_u32().map_err(|_| too_small())?;
        let total_blocks = input.read_u32().map_err(|_| too_small())?;
        let block_n = input.read_u32().map_err(|_| too_small())?;
        let topics = TopicSet::parse(&mut input, total_len)?;
        Ok(Self {
            subscription_id,
            total_blocks,
            block_n,
            topics,
        })
    }

    /// Splits a (possibly large) topic set into MTU-bounded blocks
    /// sharing one `subscription_id`.
    pub fn split(subscription_id: u32, topics: &[&str]) -> Vec<Self> {
        const FIXED_PREFIX: usize = HEADER_SIZE + 4 + 4 + 4; // sub_id, total_blocks, block_n
        const TABLE_COUNTS: usize = 4 + 4; // hash count + name count

        let mut blocks: Vec<TopicSet> = Vec::new();
        let mut current = TopicSet::new();
        let mut current_len = FIXED_PREFIX + TABLE_COUNTS;

        for topic in topics {
            let mut candidate = TopicSet::new();
            candidate.add_topic(topic);
            let added_len = if is_hashable(topic) { 8 } else { topic.len() + 1 };

            if !current.is_empty() && current_len + added_len > MTU_BUDGET {
                blocks.push(std::mem::take(&mut current));
                current_len = FIXED_PREFIX + TABLE_COUNTS;
            }
            current.add_topic(topic);
            current_len += added_len;
        }
        blocks.push(current);

        let total_blocks = blocks.len() as u32;
        blocks
            .into_iter()
            .enumerate()
            .map(|(i, topics)| Self {
                subscription_id,
                total_blocks,
                block_n: i as u32,
                topics,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub origin_ip: u32,
    pub origin_port: u16,
    pub qos: u8,
    pub topic: String,
    pub origin_client_id: String,
    pub payload: Vec<u8>,
}

impl Publication {
    fn write(&self, out: &mut OutputStream) {
        out.write_u32(self.origin_ip);
        out.write_u16(self.origin_port);
        out.write_u8(self.qos);
        out.write_cstr(&self.topic);
        out.write_cstr(&self.origin_client_id);
        out.write_u32(self.payload.len() as u32);
        out.write_bytes(&self.payload);
    }

    fn parse(input: &mut InputStream<'_>, total_len: usize) -> Result<Self, ProtocolError> {
        let too_small = || ProtocolError::PacketTooSmall { len: total_len };
        let origin_ip = input.read_u32().map_err(|_| too_small())?;
        let origin_port = input.read_u16().map_err(|_| too_small())?;
        let qos = input.read_u8().map_err(|_| too_small())?;
        let topic = input.read_cstr().map_err(|_| too_small())?;
        let origin_client_id = input.read_cstr().map_err(|_| too_small())?;
        let payload_length = input.read_u32().map_err(|_| too_small())?;
        let payload = input
            .read_bytes(payload_length as usize)
            .map_err(|_| too_small())?
            .to_vec();
        Ok(Self {
            origin_ip,
            origin_port,
            qos,
            topic,
            origin_client_id,
            payload,
        })
    }

    pub(crate) fn encoded_len(&self) -> usize {
        4 + 2 + 1 + self.topic.len() + 1 + self.origin_client_id.len() + 1 + 4 + self.payload.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishBody {
    pub publication_id: u32,
    pub total_blocks: u32,
    pub block_n: u32,
    pub publications: Vec<Publication>,
}

impl PublishBody {
    pub fn write(&self, out: &mut OutputStream) {
        out.write_u32(self.publication_id);
        out.write_u32(self.total_blocks);
        out.write_u32(self.block_n);
        out.write_u32(self.publications.len() as u32);
        for publication in &self.publications {
            publication.write(out);
        }
    }

    pub fn parse(rest: &[u8], total_len: usize) -> Result<Self, ProtocolError> {
        let mut input = InputStream::new(rest);
        let too_small = || ProtocolError::PacketTooSmall { len: total_len };
        let publication_id = input.read_u32().map_err(|_| too_small())?;
        let total_blocks = input.read_u32().map_err(|_| too_small())?;
        let block_n = input.read_u32().map_err(|_| too_small())?;
        let count = input.read_u32().map_err(|_| too_small())?;
        let mut publications = Vec::with_capacity(count as usize);
        for _ in 0..count {
            publications.push(Publication::parse(&mut input, total_len)?);
        }
        Ok(Self {
            publication_id,
            total_blocks,
            block_n,
            publications,
        })
    }

    /// Splits a batch of publications into MTU-bounded blocks sharing
    /// one `publication_id`.
    pub fn split(publication_id: u32, publications: Vec<Publication>) -> Vec<Self> {
        const FIXED_PREFIX: usize = HEADER_SIZE + 4 + 4 + 4 + 4;

        let mut blocks: Vec<Vec<Publication>> = Vec::new();
        let mut current: Vec<Publication> = Vec::new();
        let mut current_len = FIXED_PREFIX;

        for publication in publications {
            let added_len = publication.encoded_len();
            if !current.is_empty() && current_len + added_len > MTU_BUDGET {
                blocks.push(std::mem::take(&mut current));
                current_len = FIXED_PREFIX;
            }
            current_len += added_len;
            current.push(publication);
        }
        if !current.is_empty() || blocks.is_empty() {
            blocks.push(current);
        }

        let total_blocks = blocks.len() as u32;
        blocks
            .into_iter()
            .enumerate()
            .map(|(i, publications)| Self {
                publication_id,
                total_blocks,
                block_n: i as u32,
                publications,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_roundtrip() {
        let body = HeartbeatBody {
            interval_ms: 60_000,
            peers: vec![PeerEntry {
                ip: 0x0100_007f,
                port: 9000,
            }],
        };
        let mut out = OutputStream::new();
        body.write(&mut out);
        let bytes = out.into_bytes();
        let parsed = HeartbeatBody::parse(&bytes, bytes.len() + HEADER_SIZE).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn topic_set_classifies_hash_vs_name() {
        let mut topics = TopicSet::new();
        topics.add_topic("x/y");
        topics.add_topic("a/very/long/exact/topic/name");
        topics.add_topic("a/+");
        assert_eq!(topics.hashes.len(), 1);
        assert_eq!(topics.names.len(), 2);
    }

    #[test]
    fn subscribe_body_roundtrip() {
        let mut topics = TopicSet::new();
        topics.add_topic("x/y");
        let body = SubscribeBody {
            subscription_id: 7,
            total_blocks: 1,
            block_n: 0,
            topics,
        };
        let mut out = OutputStream::new();
        body.write(&mut out);
        let bytes = out.into_bytes();
        let parsed = SubscribeBody::parse(&bytes, bytes.len() + HEADER_SIZE).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn empty_subscribe_is_valid_noop() {
        let body = SubscribeBody {
            subscription_id: 1,
            total_blocks: 1,
            block_n: 0,
            topics: TopicSet::new(),
        };
        let mut out = OutputStream::new();
        body.write(&mut out);
        let bytes = out.into_bytes();
        let parsed = SubscribeBody::parse(&bytes, bytes.len() + HEADER_SIZE).unwrap();
        assert!(parsed.topics.is_empty());
    }

    #[test]
    fn publish_body_roundtrip() {
        let publication = Publication {
            origin_ip: 0x0100_007f,
            origin_port: 9000,
            qos: 0,
            topic: "x/y".into(),
            origin_client_id: "mqttA".into(),
            payload: b"hi".to_vec(),
        };
        let body = PublishBody {
            publication_id: 1,
            total_blocks: 1,
            block_n: 0,
            publications: vec![publication],
        };
        let mut out = OutputStream::new();
        body.write(&mut out);
        let bytes = out.into_bytes();
        let parsed = PublishBody::parse(&bytes, bytes.len() + HEADER_SIZE).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn split_keeps_blocks_under_budget() {
        let topics: Vec<String> = (0..500).map(|i| format!("topic/filter/{i}/+")).collect();
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let blocks = SubscribeBody::split(1, &refs);
        assert!(blocks.len() > 1);
        for block in &blocks {
            let mut out = OutputStream::new();
            block.write(&mut out);
            assert!(out.len() + HEADER_SIZE <= MTU_BUDGET);
        }
    }
}
