//! Room membership, the message log and flood deduplication.
//!
//! Every mutation happens under one lock. Handles are cloned out of the lock
//! before anything is queued to a connection, so a slow peer never holds up
//! discovery or other readers.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

use crate::error::{ChatError, ChatResult};
use crate::events::{EventSender, RoomEvent};
use crate::peer::{preferred_direction, ConnectionHandle, ConnectionId};
use crate::protocol::message::{Frame, Message};
use crate::protocol::{PeerId, PeerInfo};

/// Outcome of [`ChatRoom::register_peer`].
#[derive(Debug)]
pub enum Registration {
    /// First link to this peer.
    Inserted,
    /// Same link registered again; metadata refreshed.
    Updated,
    /// The new link won the tie-break. The old one is returned for closing.
    Replaced(ConnectionHandle),
    /// An existing link wins; the caller must close the new one.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub room_name: String,
    pub nickname: String,
    pub local_peer_id: PeerId,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub message_count: usize,
}

struct RoomState {
    room_name: String,
    nickname: String,
    local_peer_id: PeerId,
    next_sequence: u64,
    peers: HashMap<PeerId, PeerInfo>,
    /// Peers discovery currently sees announcing.
    discovered: HashSet<PeerId>,
    connections: HashMap<PeerId, ConnectionHandle>,
    message_log: Vec<Message>,
    seen_message_ids: HashSet<String>,
}

pub struct ChatRoom {
    state: Mutex<RoomState>,
    events: EventSender,
}

impl ChatRoom {
    pub fn join(nickname: &str, room_name: &str, events: EventSender) -> ChatResult<Self> {
        let nickname = nickname.trim();
        let room_name = room_name.trim();
        if nickname.is_empty() {
            return Err(ChatError::InvalidConfig("nickname cannot be empty".to_string()));
        }
        if room_name.is_empty() {
            return Err(ChatError::InvalidConfig("room name cannot be empty".to_string()));
        }

        let local_peer_id = PeerId::generate();
        info!(room = room_name, peer = %local_peer_id, "joined room");

        Ok(Self {
            state: Mutex::new(RoomState {
                room_name: room_name.to_string(),
                nickname: nickname.to_string(),
                local_peer_id,
                next_sequence: 1,
                peers: HashMap::new(),
                discovered: HashSet::new(),
                connections: HashMap::new(),
                message_log: Vec::new(),
                seen_message_ids: HashSet::new(),
            }),
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    pub fn room_name(&self) -> String {
        self.state().room_name.clone()
    }

    pub fn nickname(&self) -> String {
        self.state().nickname.clone()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.state().local_peer_id.clone()
    }

    /// Attaches a handshaken link to a peer. A peer is only ever reachable
    /// through one link; when a second one shows up the tie-break picks.
    pub fn register_peer(&self, mut info: PeerInfo, handle: ConnectionHandle) -> ChatResult<Registration> {
        let (outcome, connected) = {
            let mut state = self.state();
            if info.room_name != state.room_name {
                return Err(ChatError::RoomMismatch {
                    peer_id: info.id,
                    expected: state.room_name.clone(),
                    actual: info.room_name,
                });
            }
            if info.id == state.local_peer_id {
                return Err(ChatError::SelfConnection);
            }

            info.update_last_seen();
            let local = state.local_peer_id.clone();
            let outcome = match state.connections.get(&info.id) {
                None => Registration::Inserted,
                Some(existing) if existing.id() == handle.id() => Registration::Updated,
                Some(existing) if existing.is_closed() => Registration::Replaced(existing.clone()),
                Some(existing) => {
                    let preferred = preferred_direction(&local, &info.id);
                    if existing.direction() != handle.direction() && handle.direction() == preferred {
                        Registration::Replaced(existing.clone())
                    } else {
                        Registration::Rejected
                    }
                }
            };

            match outcome {
                Registration::Rejected => {}
                Registration::Updated => {
                    state.peers.insert(info.id.clone(), info.clone());
                }
                Registration::Inserted | Registration::Replaced(_) => {
                    state.peers.insert(info.id.clone(), info.clone());
                    state.connections.insert(info.id.clone(), handle.clone());
                }
            }
            (outcome, info)
        };

        match &outcome {
            Registration::Inserted => {
                info!(peer = %connected.id, nickname = %connected.nickname, conn = handle.id(), "peer connected");
                self.emit(RoomEvent::PeerConnected(connected));
            }
            Registration::Replaced(old) => {
                debug!(peer = %connected.id, old = old.id(), new = handle.id(), "duplicate link replaced");
            }
            Registration::Rejected => {
                debug!(peer = %connected.id, conn = handle.id(), "duplicate link rejected");
            }
            Registration::Updated => {}
        }
        Ok(outcome)
    }

    /// Records a discovery sighting without touching connections. Returns true
    /// the first time a peer is seen.
    pub fn observe_peer(&self, mut info: PeerInfo) -> bool {
        let mut state = self.state();
        if info.room_name != state.room_name || info.id == state.local_peer_id {
            return false;
        }
        info.update_last_seen();
        state.discovered.insert(info.id.clone());
        state.peers.insert(info.id.clone(), info).is_none()
    }

    /// Drops a peer that discovery lost, unless a link to it is still up. In
    /// that case the link's teardown drops it instead.
    pub fn expire_peer(&self, peer_id: &PeerId) -> bool {
        let mut state = self.state();
        state.discovered.remove(peer_id);
        if state.connections.contains_key(peer_id) {
            return false;
        }
        state.peers.remove(peer_id).is_some()
    }

    /// Removes a peer from both maps and hands back its link, if any.
    pub fn unregister_peer(&self, peer_id: &PeerId) -> Option<ConnectionHandle> {
        let (info, handle) = {
            let mut state = self.state();
            state.discovered.remove(peer_id);
            (state.peers.remove(peer_id), state.connections.remove(peer_id))
        };

        if let (Some(info), Some(_)) = (&info, &handle) {
            self.emit(RoomEvent::PeerDisconnected(info.clone()));
        }
        handle
    }

    /// Called when a link dies. Only removes the registration if `connection`
    /// is still the link on record for the peer. A peer that discovery no
    /// longer sees goes with its link.
    pub fn on_peer_disconnected(&self, peer_id: &PeerId, connection: ConnectionId) -> bool {
        let info = {
            let mut state = self.state();
            match state.connections.get(peer_id) {
                Some(current) if current.id() == connection => {
                    state.connections.remove(peer_id);
                    if state.discovered.contains(peer_id) {
                        state.peers.get(peer_id).cloned()
                    } else {
                        state.peers.remove(peer_id)
                    }
                }
                _ => return false,
            }
        };

        if let Some(info) = info {
            info!(peer = %peer_id, conn = connection, "peer disconnected");
            self.emit(RoomEvent::PeerDisconnected(info));
        }
        true
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.state().connections.contains_key(peer_id)
    }

    /// Appends a local message and queues it to every link. The log is
    /// updated before anything touches the network.
    pub fn send_local_message(&self, body: &str) -> ChatResult<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (message, targets) = {
            let mut state = self.state();
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let message = Message::new(&state.local_peer_id, sequence, state.nickname.clone(), body.to_string());
            state.seen_message_ids.insert(message.id.clone());
            state.message_log.push(message.clone());
            let targets: Vec<ConnectionHandle> = state.connections.values().cloned().collect();
            (message, targets)
        };

        let delivered = Self::fan_out(&message, &targets);
        debug!(id = %message.id, delivered, "local message sent");
        self.emit(RoomEvent::MessageSent(message.clone()));
        Ok(message)
    }

    /// Handles a message read from `from`. Returns true if it was new.
    pub fn on_message_received(&self, message: Message, from: &PeerId) -> bool {
        if message.id.is_empty() || message.sender_id.is_empty() {
            debug!(peer = %from, "dropping message without id or sender");
            return false;
        }

        let targets = {
            let mut state = self.state();
            if !state.seen_message_ids.insert(message.id.clone()) {
                trace!(id = %message.id, peer = %from, "duplicate message");
                return false;
            }
            state.message_log.push(message.clone());
            state
                .connections
                .iter()
                .filter(|(peer_id, _)| *peer_id != from)
                .map(|(_, handle)| handle.clone())
                .collect::<Vec<_>>()
        };

        let relayed = Self::fan_out(&message, &targets);
        debug!(id = %message.id, from = %from, relayed, "message received");
        self.emit(RoomEvent::MessageReceived(message));
        true
    }

    fn fan_out(message: &Message, targets: &[ConnectionHandle]) -> usize {
        targets
            .iter()
            .filter(|handle| handle.send(Frame::chat(message.clone())))
            .count()
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let state = self.state();
        let mut peers: Vec<PeerInfo> = state.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.nickname.cmp(&b.nickname).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state().connections.keys().cloned().collect()
    }

    pub fn list_messages(&self) -> Vec<Message> {
        self.state().message_log.clone()
    }

    pub fn health_status(&self) -> HealthStatus {
        let state = self.state();
        HealthStatus {
            room_name: state.room_name.clone(),
            nickname: state.nickname.clone(),
            local_peer_id: state.local_peer_id.clone(),
            connected_peers: state.connections.len(),
            known_peers: state.peers.len(),
            message_count: state.message_log.len(),
        }
    }

    /// Takes every link out of the room, for shutdown.
    pub fn drain_connections(&self) -> Vec<ConnectionHandle> {
        self.state().connections.drain().map(|(_, handle)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventManager;
    use crate::peer::Direction;
    use crate::protocol::message::frame;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn room(name: &str) -> (ChatRoom, EventManager) {
        let events = EventManager::new();
        let room = ChatRoom::join("Leader", name, events.get_sender()).unwrap();
        (room, events)
    }

    fn peer(id: &str, room_name: &str) -> PeerInfo {
        PeerInfo::new(
            PeerId::from(id),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            5001,
            format!("nick-{id}"),
            room_name.to_string(),
        )
    }

    fn link(conn: ConnectionId, id: &str, direction: Direction) -> (ConnectionHandle, mpsc::UnboundedReceiver<Frame>) {
        ConnectionHandle::channel(conn, PeerId::from(id), direction)
    }

    fn chat_bodies(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<String> {
        let mut bodies = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            if let Some(frame::Kind::Chat(message)) = frame.kind {
                bodies.push(message.body);
            }
        }
        bodies
    }

    fn remote_message(sender: &str, sequence: u64, body: &str) -> Message {
        Message::new(&PeerId::from(sender), sequence, sender.to_string(), body.to_string())
    }

    #[test]
    fn join_rejects_blank_names() {
        let events = EventManager::new();
        assert!(ChatRoom::join("  ", "room", events.get_sender()).is_err());
        assert!(ChatRoom::join("nick", "", events.get_sender()).is_err());
    }

    #[test]
    fn local_message_is_logged_before_any_link_exists() {
        let (room, _events) = room("test");
        let message = room.send_local_message("hello").unwrap();

        let log = room.list_messages();
        assert_eq!(log, vec![message.clone()]);
        assert_eq!(message.sender(), room.local_peer_id());
        assert_eq!(message.sequence(), Some(1));
    }

    #[test]
    fn local_sequence_numbers_increase() {
        let (room, _events) = room("test");
        let sequences: Vec<u64> = (0..5)
            .map(|i| room.send_local_message(&format!("m{i}")).unwrap().sequence().unwrap())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_body_is_refused() {
        let (room, _events) = room("test");
        assert!(matches!(room.send_local_message("   "), Err(ChatError::EmptyMessage)));
        assert!(room.list_messages().is_empty());
    }

    #[test]
    fn duplicate_delivery_is_logged_once() {
        let (room, _events) = room("test");
        let (b, _b_frames) = link(1, "peer-b", Direction::Outbound);
        let (c, _c_frames) = link(2, "peer-c", Direction::Outbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();
        room.register_peer(peer("peer-c", "test"), c).unwrap();

        let message = remote_message("peer-z", 1, "ping");
        assert!(room.on_message_received(message.clone(), &PeerId::from("peer-b")));
        assert!(!room.on_message_received(message, &PeerId::from("peer-c")));

        let log = room.list_messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].body, "ping");
    }

    #[test]
    fn received_message_is_flooded_to_everyone_but_its_origin() {
        let (room, _events) = room("test");
        let (b, mut b_frames) = link(1, "peer-b", Direction::Outbound);
        let (c, mut c_frames) = link(2, "peer-c", Direction::Outbound);
        let (d, mut d_frames) = link(3, "peer-d", Direction::Inbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();
        room.register_peer(peer("peer-c", "test"), c).unwrap();
        room.register_peer(peer("peer-d", "test"), d).unwrap();

        room.on_message_received(remote_message("peer-b", 1, "ping"), &PeerId::from("peer-b"));

        assert!(chat_bodies(&mut b_frames).is_empty());
        assert_eq!(chat_bodies(&mut c_frames), vec!["ping"]);
        assert_eq!(chat_bodies(&mut d_frames), vec!["ping"]);
    }

    #[test]
    fn local_message_goes_to_every_link() {
        let (room, _events) = room("test");
        let (b, mut b_frames) = link(1, "peer-b", Direction::Outbound);
        let (c, mut c_frames) = link(2, "peer-c", Direction::Inbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();
        room.register_peer(peer("peer-c", "test"), c).unwrap();

        room.send_local_message("hello").unwrap();

        assert_eq!(chat_bodies(&mut b_frames), vec!["hello"]);
        assert_eq!(chat_bodies(&mut c_frames), vec!["hello"]);
    }

    #[test]
    fn echo_of_own_message_is_ignored() {
        let (room, _events) = room("test");
        let message = room.send_local_message("hello").unwrap();
        assert!(!room.on_message_received(message, &PeerId::from("peer-b")));
        assert_eq!(room.list_messages().len(), 1);
    }

    #[test]
    fn malformed_message_is_dropped() {
        let (room, _events) = room("test");
        let mut message = remote_message("peer-b", 1, "x");
        message.id.clear();
        assert!(!room.on_message_received(message, &PeerId::from("peer-b")));
        assert!(room.list_messages().is_empty());
    }

    #[test]
    fn registering_the_same_link_twice_only_updates() {
        let (room, _events) = room("test");
        let (b, _frames) = link(1, "peer-b", Direction::Outbound);
        assert!(matches!(room.register_peer(peer("peer-b", "test"), b.clone()), Ok(Registration::Inserted)));

        let mut renamed = peer("peer-b", "test");
        renamed.nickname = "Renamed".to_string();
        assert!(matches!(room.register_peer(renamed, b), Ok(Registration::Updated)));

        let peers = room.list_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].nickname, "Renamed");
        assert_eq!(room.health_status().connected_peers, 1);
    }

    #[test]
    fn peer_from_another_room_is_refused() {
        let (room, _events) = room("alpha");
        let (b, _frames) = link(1, "peer-b", Direction::Inbound);
        assert!(matches!(
            room.register_peer(peer("peer-b", "beta"), b),
            Err(ChatError::RoomMismatch { .. })
        ));
        assert!(!room.observe_peer(peer("peer-c", "beta")));
        assert!(room.list_peers().is_empty());
    }

    #[test]
    fn tie_break_keeps_the_link_dialed_by_the_lower_id() {
        let (room, _events) = room("test");
        let local = room.local_peer_id();
        // "~" sorts after every UUID character, "0" before.
        let higher = format!("~{}", local);
        let lower = "0".to_string();

        // Against a higher peer we keep our outbound link.
        let (inbound, _f1) = link(1, &higher, Direction::Inbound);
        let (outbound, _f2) = link(2, &higher, Direction::Outbound);
        room.register_peer(peer(&higher, "test"), inbound).unwrap();
        match room.register_peer(peer(&higher, "test"), outbound).unwrap() {
            Registration::Replaced(old) => assert_eq!(old.id(), 1),
            other => panic!("expected replacement, got {other:?}"),
        }

        // Against a lower peer we keep the inbound link.
        let (inbound, _f3) = link(3, &lower, Direction::Inbound);
        let (outbound, _f4) = link(4, &lower, Direction::Outbound);
        room.register_peer(peer(&lower, "test"), inbound).unwrap();
        assert!(matches!(
            room.register_peer(peer(&lower, "test"), outbound).unwrap(),
            Registration::Rejected
        ));

        assert_eq!(room.health_status().connected_peers, 2);
    }

    #[test]
    fn stale_disconnect_does_not_evict_the_surviving_link() {
        let (room, _events) = room("test");
        let higher = format!("~{}", room.local_peer_id());
        let (inbound, _f1) = link(1, &higher, Direction::Inbound);
        let (outbound, _f2) = link(2, &higher, Direction::Outbound);
        room.register_peer(peer(&higher, "test"), inbound).unwrap();
        room.register_peer(peer(&higher, "test"), outbound).unwrap();

        assert!(!room.on_peer_disconnected(&PeerId::from(higher.as_str()), 1));
        assert!(room.is_connected(&PeerId::from(higher.as_str())));
        assert!(room.on_peer_disconnected(&PeerId::from(higher.as_str()), 2));
        assert!(!room.is_connected(&PeerId::from(higher.as_str())));
    }

    #[test]
    fn discovery_sightings_and_expiry() {
        let (room, _events) = room("test");
        assert!(room.observe_peer(peer("peer-b", "test")));
        assert!(!room.observe_peer(peer("peer-b", "test")));
        assert_eq!(room.list_peers().len(), 1);

        // Still announcing: the peer outlives its link until discovery loses it.
        let (b, _frames) = link(1, "peer-b", Direction::Outbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();
        room.on_peer_disconnected(&PeerId::from("peer-b"), 1);
        assert_eq!(room.list_peers().len(), 1);
        assert!(room.expire_peer(&PeerId::from("peer-b")));
        assert!(room.list_peers().is_empty());
    }

    #[test]
    fn peer_lost_while_connected_goes_with_its_link() {
        let (room, _events) = room("test");
        room.observe_peer(peer("peer-b", "test"));
        let (b, _frames) = link(1, "peer-b", Direction::Outbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();

        assert!(!room.expire_peer(&PeerId::from("peer-b")));
        assert_eq!(room.list_peers().len(), 1, "live link keeps the peer");

        assert!(room.on_peer_disconnected(&PeerId::from("peer-b"), 1));
        assert!(room.list_peers().is_empty());
        assert_eq!(room.health_status().known_peers, 0);
    }

    #[test]
    fn handshake_only_peer_goes_with_its_link() {
        let (room, mut events) = room("test");
        let mut receiver = events.take_receiver().unwrap();
        let (b, _frames) = link(1, "peer-b", Direction::Inbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();
        assert_eq!(room.list_peers().len(), 1);

        assert!(room.on_peer_disconnected(&PeerId::from("peer-b"), 1));
        assert!(room.list_peers().is_empty());
        assert!(matches!(receiver.try_recv(), Ok(RoomEvent::PeerConnected(_))));
        assert!(matches!(receiver.try_recv(), Ok(RoomEvent::PeerDisconnected(p)) if p.id == PeerId::from("peer-b")));
    }

    #[test]
    fn unregister_removes_both_maps_and_is_idempotent() {
        let (room, _events) = room("test");
        let (b, _frames) = link(7, "peer-b", Direction::Outbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();

        let removed = room.unregister_peer(&PeerId::from("peer-b"));
        assert_eq!(removed.map(|h| h.id()), Some(7));
        assert!(room.list_peers().is_empty());
        assert!(room.unregister_peer(&PeerId::from("peer-b")).is_none());
    }

    #[test]
    fn events_follow_membership_and_messages() {
        let (room, mut events) = room("test");
        let mut receiver = events.take_receiver().unwrap();
        let (b, _frames) = link(1, "peer-b", Direction::Outbound);
        room.register_peer(peer("peer-b", "test"), b).unwrap();
        room.on_message_received(remote_message("peer-b", 1, "hi"), &PeerId::from("peer-b"));
        room.on_peer_disconnected(&PeerId::from("peer-b"), 1);

        assert!(matches!(receiver.try_recv(), Ok(RoomEvent::PeerConnected(_))));
        assert!(matches!(receiver.try_recv(), Ok(RoomEvent::MessageReceived(m)) if m.body == "hi"));
        assert!(matches!(receiver.try_recv(), Ok(RoomEvent::PeerDisconnected(_))));
    }

    #[test]
    fn snapshots_are_detached_copies() {
        let (room, _events) = room("test");
        room.send_local_message("first").unwrap();
        let mut snapshot = room.list_messages();
        snapshot.clear();
        assert_eq!(room.list_messages().len(), 1);
    }
}
