use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::protocol::PeerId;

pub const DISCOVERY_PORT: u16 = 37020;
pub const BROADCAST_ADDR: &str = "255.255.255.255";

/// Presence packet. On the wire it is one JSON object followed by `\n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub room_name: String,
    pub peer_id: PeerId,
    pub tcp_port: u16,
    pub nickname: String,
}

impl Announcement {
    pub fn to_bytes(&self) -> ChatResult<Vec<u8>> {
        let mut data = serde_json::to_vec(self)?;
        data.push(b'\n');
        Ok(data)
    }

    /// Decodes a datagram. Anything after the first newline is ignored; a
    /// datagram without one is treated as truncated.
    pub fn from_bytes(bytes: &[u8]) -> ChatResult<Self> {
        let end = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| ChatError::MalformedAnnouncement("missing terminator".to_string()))?;

        let announcement: Announcement = serde_json::from_slice(&bytes[..end])?;

        if announcement.peer_id.is_empty() {
            return Err(ChatError::MalformedAnnouncement("empty peer id".to_string()));
        }
        if announcement.room_name.is_empty() {
            return Err(ChatError::MalformedAnnouncement("empty room name".to_string()));
        }
        if announcement.tcp_port == 0 {
            return Err(ChatError::MalformedAnnouncement("tcp port is zero".to_string()));
        }

        Ok(announcement)
    }
}
