pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod room;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::events::{EventManager, EventSender};
use crate::peer::PeerHost;
use crate::protocol::discovery::Announcement;
use crate::room::ChatRoom;

pub use crate::config::RoomConfig;
pub use crate::error::{ChatError, ChatResult};
pub use crate::events::RoomEvent;
pub use crate::protocol::message::Message;
pub use crate::protocol::{PeerId, PeerInfo};
pub use crate::room::HealthStatus;

/// Unix time in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Formats a Unix millisecond timestamp as local `HH:MM:SS`.
pub fn format_timestamp(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|time| time.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

/// A joined room: discovery, the peer host and the room state, wired
/// together and running in the background until [`RoomHandle::shutdown`].
pub struct RoomHandle {
    room: Arc<ChatRoom>,
    host: PeerHost,
    discovery: DiscoveryService,
    config: Arc<RoomConfig>,
    event_manager: EventManager,
    tcp_port: u16,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RoomHandle {
    pub async fn join(room_name: &str, nickname: &str) -> ChatResult<Self> {
        Self::join_with_config(room_name, nickname, RoomConfig::default()).await
    }

    pub async fn join_with_config(room_name: &str, nickname: &str, config: RoomConfig) -> ChatResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let event_manager = EventManager::new();
        let room = Arc::new(ChatRoom::join(nickname, room_name, event_manager.get_sender())?);
        let local_peer_id = room.local_peer_id();

        let host = PeerHost::new(room.clone(), config.clone());
        let tcp_port = host.start_listening().await?;

        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let discovery = match DiscoveryService::bind(
            config.clone(),
            room.room_name(),
            local_peer_id.clone(),
            discovery_tx,
        )
        .await
        {
            Ok(discovery) => discovery,
            Err(e) => {
                host.shutdown(config.shutdown_grace()).await;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let announcement = Announcement {
            room_name: room.room_name(),
            peer_id: local_peer_id,
            tcp_port,
            nickname: room.nickname(),
        };

        let tasks = vec![
            discovery.start_listening(shutdown_rx.clone()),
            discovery.start_reaper(shutdown_rx.clone()),
            tokio::spawn(coordinate(
                discovery_rx,
                room.clone(),
                host.clone(),
                event_manager.get_sender(),
                shutdown_rx.clone(),
            )),
            discovery.start_announcing(announcement, shutdown_rx),
        ];

        info!(
            room = %room.room_name(),
            nickname = %room.nickname(),
            tcp_port,
            discovery_port = discovery.port(),
            "room session started"
        );

        Ok(Self {
            room,
            host,
            discovery,
            config,
            event_manager,
            tcp_port,
            shutdown_tx,
            tasks,
        })
    }

    pub fn send_local_message(&self, body: &str) -> ChatResult<Message> {
        self.room.send_local_message(body)
    }

    pub fn list_messages(&self) -> Vec<Message> {
        self.room.list_messages()
    }

    /// Discovered and connected peers, sorted by nickname.
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.room.list_peers()
    }

    /// Peers currently announcing on the discovery port, connected or not.
    pub fn discovered_peers(&self) -> Vec<PeerInfo> {
        self.discovery.peers()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.room.connected_peers()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.room.health_status()
    }

    /// The event stream. Only the first call returns a receiver.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<RoomEvent>> {
        self.event_manager.take_receiver()
    }

    /// Closes the link to a peer. Discovery will reconnect it on its next
    /// announcement.
    pub fn disconnect_peer(&self, peer_id: &PeerId) -> bool {
        self.host.disconnect(peer_id)
    }

    pub fn add_announce_target(&self, target: SocketAddr) {
        self.discovery.add_target(target);
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.room.local_peer_id()
    }

    pub fn nickname(&self) -> String {
        self.room.nickname()
    }

    pub fn room_name(&self) -> String {
        self.room.room_name()
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery.port()
    }

    /// Live TCP links held by the host.
    pub fn link_count(&self) -> usize {
        self.host.link_count()
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        local_ip_address::local_ip().ok()
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Stops discovery, closes every link and waits for background tasks up
    /// to the configured grace period.
    pub async fn shutdown(self) {
        let grace = self.config.shutdown_grace();
        self.shutdown_tx.send_replace(true);
        self.host.shutdown(grace).await;

        for mut task in self.tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("background task did not stop in time; aborting");
                task.abort();
            }
        }
        info!(room = %self.room.room_name(), "left room");
    }
}

/// Routes discovery events into the room and the host.
async fn coordinate(
    mut discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
    room: Arc<ChatRoom>,
    host: PeerHost,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = discovery.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            DiscoveryEvent::Discovered(info) => {
                room.observe_peer(info.clone());
                let _ = events.send(RoomEvent::PeerDiscovered(info.clone()));
                host.ensure_connected(info);
            }
            DiscoveryEvent::Refreshed(info) => {
                room.observe_peer(info.clone());
                host.ensure_connected(info);
            }
            DiscoveryEvent::Lost(info) => {
                if !room.expire_peer(&info.id) {
                    debug!(peer = %info.id, "lost peer still has a live link");
                }
                let _ = events.send(RoomEvent::PeerLost(info));
            }
        }
    }
    debug!("coordinator stopped");
}
