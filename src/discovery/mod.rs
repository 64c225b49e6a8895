use if_addrs::IfAddr;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::RoomConfig;
use crate::error::{ChatError, ChatResult};
use crate::protocol::discovery::{Announcement, BROADCAST_ADDR};
use crate::protocol::{PeerId, PeerInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// First packet from a peer, or the first since it was lost.
    Discovered(PeerInfo),
    /// A known peer announced again.
    Refreshed(PeerInfo),
    /// No packet within the liveness timeout.
    Lost(PeerInfo),
}

/// Liveness table for one room. Pure bookkeeping; the sockets live in
/// [`DiscoveryService`].
#[derive(Debug)]
pub struct PeerTable {
    room_name: String,
    local_peer_id: PeerId,
    peers: HashMap<PeerId, (PeerInfo, Instant)>,
}

impl PeerTable {
    pub fn new(room_name: String, local_peer_id: PeerId) -> Self {
        Self {
            room_name,
            local_peer_id,
            peers: HashMap::new(),
        }
    }

    /// Applies one datagram. Malformed packets, other rooms and our own
    /// announcements yield `None`.
    pub fn observe(&mut self, packet: &[u8], src: SocketAddr, now: Instant) -> Option<DiscoveryEvent> {
        let announcement = match Announcement::from_bytes(packet) {
            Ok(announcement) => announcement,
            Err(e) => {
                trace!(%src, error = %e, "dropping discovery packet");
                return None;
            }
        };

        if announcement.room_name != self.room_name {
            trace!(%src, room = %announcement.room_name, "announcement for another room");
            return None;
        }
        if announcement.peer_id == self.local_peer_id {
            return None;
        }

        let info = PeerInfo::new(
            announcement.peer_id.clone(),
            src.ip(),
            announcement.tcp_port,
            announcement.nickname,
            announcement.room_name,
        );
        let known = self
            .peers
            .insert(announcement.peer_id, (info.clone(), now))
            .is_some();

        Some(if known {
            DiscoveryEvent::Refreshed(info)
        } else {
            DiscoveryEvent::Discovered(info)
        })
    }

    /// Removes and returns every peer silent for longer than `timeout`.
    pub fn reap(&mut self, now: Instant, timeout: Duration) -> Vec<PeerInfo> {
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, (_, seen))| now.saturating_duration_since(*seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove(&id).map(|(info, _)| info))
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|(info, _)| info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

pub struct DiscoveryService {
    config: Arc<RoomConfig>,
    socket: Arc<UdpSocket>,
    port: u16,
    extra_targets: Arc<Mutex<Vec<SocketAddr>>>,
    table: Arc<Mutex<PeerTable>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiscoveryService {
    /// Binds the discovery port. The port is fixed by protocol, so failure
    /// here is a startup error.
    pub async fn bind(
        config: Arc<RoomConfig>,
        room_name: String,
        local_peer_id: PeerId,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> ChatResult<Self> {
        let bind_addr = SocketAddr::new(config.bind_address, config.discovery_port);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| ChatError::DiscoveryBind {
                port: config.discovery_port,
                source,
            })?;
        socket.set_broadcast(true)?;
        let port = socket.local_addr()?.port();
        info!(port, "discovery socket bound");

        Ok(Self {
            extra_targets: Arc::new(Mutex::new(config.announce_targets.clone())),
            config,
            socket: Arc::new(socket),
            port,
            table: Arc::new(Mutex::new(PeerTable::new(room_name, local_peer_id))),
            events,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Adds a unicast destination for announcements, for networks that drop
    /// broadcast traffic.
    pub fn add_target(&self, target: SocketAddr) {
        let mut targets = lock(&self.extra_targets);
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        lock(&self.table).peers()
    }

    /// Announces our presence every interval until shutdown.
    pub fn start_announcing(&self, announcement: Announcement, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let extra_targets = self.extra_targets.clone();
        let broadcast = self.config.broadcast_announcements;
        let discovery_port = self.port;
        let period = self.config.announce_interval();

        tokio::spawn(async move {
            let data = match announcement.to_bytes() {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "could not encode announcement");
                    return;
                }
            };
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }

                let mut targets = lock(&extra_targets).clone();
                if broadcast {
                    targets.extend(
                        Self::get_broadcast_addresses()
                            .into_iter()
                            .map(|ip| SocketAddr::new(IpAddr::V4(ip), discovery_port)),
                    );
                }

                for target in targets {
                    if let Err(e) = socket.send_to(&data, target).await {
                        debug!(%target, error = %e, "announcement not sent");
                    }
                }
            }
            debug!("announcer stopped");
        })
    }

    /// Receives announcements until shutdown, feeding the liveness table.
    pub fn start_listening(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let table = self.table.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                let received = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = socket.recv_from(&mut buffer) => received,
                };

                match received {
                    Ok((size, src)) => {
                        let event = lock(&table).observe(&buffer[..size], src, Instant::now());
                        if let Some(event) = event {
                            if let DiscoveryEvent::Discovered(info) = &event {
                                info!(peer = %info.id, nickname = %info.nickname, addr = %src, "peer discovered");
                            }
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    // ICMP errors from earlier sends surface here on some platforms.
                    Err(e) => trace!(error = %e, "discovery receive error"),
                }
            }
            debug!("discovery listener stopped");
        })
    }

    /// Expires silent peers every reap interval.
    pub fn start_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let table = self.table.clone();
        let events = self.events.clone();
        let timeout = self.config.liveness_timeout();
        let mut ticker = interval(self.config.reap_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }

                let lost = lock(&table).reap(Instant::now(), timeout);
                for info in lost {
                    info!(peer = %info.id, nickname = %info.nickname, "peer lost");
                    if events.send(DiscoveryEvent::Lost(info)).is_err() {
                        return;
                    }
                }
            }
            debug!("reaper stopped");
        })
    }

    /// IPv4 broadcast address of every non-loopback interface, plus the
    /// limited broadcast address as a fallback.
    pub fn get_broadcast_addresses() -> Vec<Ipv4Addr> {
        let mut addresses = Vec::new();

        match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                for interface in interfaces {
                    if interface.is_loopback() {
                        continue;
                    }
                    if let IfAddr::V4(v4) = interface.addr {
                        let broadcast = v4
                            .broadcast
                            .unwrap_or_else(|| subnet_broadcast(v4.ip, v4.netmask));
                        if !addresses.contains(&broadcast) {
                            addresses.push(broadcast);
                        }
                    }
                }
            }
            Err(e) => debug!(error = %e, "could not list interfaces"),
        }

        let limited: Ipv4Addr = BROADCAST_ADDR.parse().unwrap_or(Ipv4Addr::BROADCAST);
        if !addresses.contains(&limited) {
            addresses.push(limited);
        }
        addresses
    }
}

/// `ip | !netmask`
pub fn subnet_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}
