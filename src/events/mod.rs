use crate::protocol::message::Message;
use crate::protocol::PeerInfo;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum RoomEvent {
    PeerDiscovered(PeerInfo),
    PeerLost(PeerInfo),
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
    MessageReceived(Message),
    MessageSent(Message),
}

pub type EventSender = mpsc::UnboundedSender<RoomEvent>;

pub struct EventManager {
    event_sender: EventSender,
    event_receiver: Option<mpsc::UnboundedReceiver<RoomEvent>>,
}

impl EventManager {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            event_sender: sender,
            event_receiver: Some(receiver),
        }
    }

    pub fn get_sender(&self) -> EventSender {
        self.event_sender.clone()
    }

    pub fn take_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<RoomEvent>> {
        self.event_receiver.take()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}
