use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{ChatError, ChatResult};
use crate::protocol::discovery::DISCOVERY_PORT;
use crate::protocol::message::DEFAULT_MAX_FRAME_LEN;

/// Tunables for one room session. Timings are in milliseconds so the struct
/// can be read straight from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub discovery_port: u16,
    /// Send announcements to interface broadcast addresses.
    pub broadcast_announcements: bool,
    /// Extra unicast destinations for announcements.
    pub announce_targets: Vec<SocketAddr>,
    pub announce_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub reap_interval_ms: u64,

    pub bind_address: IpAddr,
    /// First TCP port tried. 0 lets the OS pick.
    pub tcp_port_start: u16,
    pub tcp_port_end: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_frame_len: usize,

    pub shutdown_grace_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            broadcast_announcements: true,
            announce_targets: Vec::new(),
            announce_interval_ms: 2_000,
            liveness_timeout_ms: 10_000,
            reap_interval_ms: 2_000,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port_start: 5000,
            tcp_port_end: 5099,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl RoomConfig {
    pub fn load(path: impl AsRef<Path>) -> ChatResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: RoomConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded room config");
        Ok(config)
    }

    pub fn validate(&self) -> ChatResult<()> {
        if self.tcp_port_start > self.tcp_port_end {
            return Err(ChatError::InvalidConfig(format!(
                "tcp port range {}-{} is empty",
                self.tcp_port_start, self.tcp_port_end
            )));
        }

        let timings = [
            ("announce_interval_ms", self.announce_interval_ms),
            ("liveness_timeout_ms", self.liveness_timeout_ms),
            ("reap_interval_ms", self.reap_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, value)| *value == 0) {
            return Err(ChatError::InvalidConfig(format!("{name} must be positive")));
        }

        if self.liveness_timeout_ms <= self.announce_interval_ms {
            return Err(ChatError::InvalidConfig(
                "liveness timeout must exceed the announce interval".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.read_timeout_ms {
            return Err(ChatError::InvalidConfig(
                "heartbeat interval must be shorter than the read timeout".to_string(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(ChatError::InvalidConfig("max_frame_len must be positive".to_string()));
        }
        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
