use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

pub mod discovery;
pub mod message;

/// Identifier a process picks when it joins a room. Ordered so both ends of a
/// duplicate link agree on which one survives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for display.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: IpAddr,
    pub tcp_port: u16,
    pub nickname: String,
    pub room_name: String,
    /// Unix milliseconds of the last discovery packet or handshake.
    pub last_seen: u64,
}

impl PeerInfo {
    pub fn new(id: PeerId, address: IpAddr, tcp_port: u16, nickname: String, room_name: String) -> Self {
        Self {
            id,
            address,
            tcp_port,
            nickname,
            room_name,
            last_seen: crate::current_timestamp_millis(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }

    pub fn update_last_seen(&mut self) {
        self.last_seen = crate::current_timestamp_millis();
    }
}
