//! Error taxonomy shared across the bridge: configuration, network,
//! protocol, and the top-level aggregate used by `main`.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("unknown transport `{0}` for protocol `{1}`")]
    UnknownTransport(String, String),
    #[error("transport `{0}` is not supported by protocol `{1}`")]
    UnsupportedTransport(String, String),
    #[error("invalid topic filter `{0}`")]
    InvalidTopicFilter(String),
    #[error("bind collision on {0}:{1}")]
    BindCollision(Ipv4Addr, u16),
    #[error("unicast endpoint {0} is outside the network of interface `{1}`")]
    EndpointOutsideNetwork(Ipv4Addr, String),
    #[error("bridge on loopback interface `{0}` has no explicit send_port; this would recurse")]
    RecursiveLoopback(String),
    #[error("interface `{0}` not found")]
    UnknownInterface(String),
    #[error("failed to read settings file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("socket setup failed: {0}")]
    SetupFailed(io::Error),
    #[error("send failed: {0}")]
    Send(io::Error),
    #[error("receive failed: {0}")]
    Receive(io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet too small ({len} bytes)")]
    PacketTooSmall { len: usize },
    #[error("invalid magic number")]
    InvalidMagicNumber,
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u8 },
    #[error("invalid packet type 0x{type_byte:02x}")]
    InvalidPacketType { type_byte: u8 },
    #[error("invalid sequence number 0")]
    InvalidSequenceNumber,
    #[error("unexpected packet type `{kind}` from {sender} in current state")]
    InvalidPacketSequence { kind: &'static str, sender: String },
    #[error("out-of-order packet `{kind}` from {sender}")]
    OutOfOrder { kind: &'static str, sender: String },
    #[error("nack received for a kind that has no nack variant")]
    NackDoesNotExist,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
