#![allow(dead_code)]

use lanchat::{RoomConfig, RoomHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::time::{sleep, Duration, Instant};

/// Loopback-only config: ephemeral ports, unicast announcements and short
/// timings so tests converge quickly without touching the real LAN.
pub fn loopback_config() -> RoomConfig {
    RoomConfig {
        discovery_port: 0,
        broadcast_announcements: false,
        announce_targets: Vec::new(),
        announce_interval_ms: 100,
        liveness_timeout_ms: 1_000,
        reap_interval_ms: 100,
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        tcp_port_start: 0,
        tcp_port_end: 0,
        connect_timeout_ms: 1_000,
        read_timeout_ms: 5_000,
        write_timeout_ms: 1_000,
        heartbeat_interval_ms: 1_000,
        shutdown_grace_ms: 500,
        ..RoomConfig::default()
    }
}

pub async fn join(room: &str, nickname: &str) -> RoomHandle {
    RoomHandle::join_with_config(room, nickname, loopback_config())
        .await
        .expect("room should start on loopback")
}

pub fn discovery_addr(room: &RoomHandle) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), room.discovery_port())
}

/// Makes `a` and `b` announce to each other.
pub fn link(a: &RoomHandle, b: &RoomHandle) {
    a.add_announce_target(discovery_addr(b));
    b.add_announce_target(discovery_addr(a));
}

/// Polls `condition` until it holds or `limit` passes.
pub async fn eventually<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

pub const SETTLE: Duration = Duration::from_secs(5);
