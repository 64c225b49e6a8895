use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::PeerId;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("No free TCP port in range {start}-{end}")]
    NetworkBind { start: u16, end: u16 },

    #[error("Could not bind discovery port {port}: {source}")]
    DiscoveryBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol frame error: {0}")]
    ProtocolFrame(String),

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u64, max: usize },

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("Malformed announcement: {0}")]
    MalformedAnnouncement(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Peer {peer_id} is in room '{actual}', expected '{expected}'")]
    RoomMismatch {
        peer_id: PeerId,
        expected: String,
        actual: String,
    },

    #[error("Refusing connection from our own peer id")]
    SelfConnection,

    #[error("Handshake with {addr} timed out")]
    HandshakeTimeout { addr: SocketAddr },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Message body is empty")]
    EmptyMessage,
}

pub type ChatResult<T> = Result<T, ChatError>;
