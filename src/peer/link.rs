use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::RoomConfig;
use crate::error::ChatError;
use crate::protocol::message::{frame, read_frame, write_frame, Frame};
use crate::protocol::PeerId;
use crate::room::ChatRoom;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

/// The direction of the link that survives between `local` and `remote`: the
/// lower id keeps what it dialed, so both ends keep the same TCP connection.
pub fn preferred_direction(local: &PeerId, remote: &PeerId) -> Direction {
    if local < remote {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

/// Cheap, cloneable reference to a live link. Frames pushed here are written
/// by the link's writer task, one at a time.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_id: PeerId,
    direction: Direction,
    outbox: mpsc::UnboundedSender<Frame>,
    close: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Builds a handle plus the receiving end of its outbox.
    pub fn channel(
        id: ConnectionId,
        peer_id: PeerId,
        direction: Direction,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbox, frames) = mpsc::unbounded_channel();
        let (close, _) = watch::channel(false);
        let handle = Self {
            id,
            peer_id,
            direction,
            outbox,
            close: Arc::new(close),
        };
        (handle, frames)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Queues a frame. Returns false once the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbox.send(frame).is_ok()
    }

    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow() || self.outbox.is_closed()
    }

    pub(crate) fn close_signal(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }
}

/// Reads frames until the link fails, then tears it down.
pub(crate) async fn run_reader(
    mut reader: OwnedReadHalf,
    handle: ConnectionHandle,
    room: Arc<ChatRoom>,
    config: Arc<RoomConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut close = handle.close_signal();
    let peer = handle.peer_id().clone();

    let reason = loop {
        if *close.borrow() || *shutdown.borrow() {
            break "closed locally".to_string();
        }

        tokio::select! {
            _ = close.changed() => break "closed locally".to_string(),
            _ = shutdown.changed() => break "shutting down".to_string(),
            result = timeout(config.read_timeout(), read_frame(&mut reader, config.max_frame_len)) => {
                match result {
                    Err(_) => break "read timed out".to_string(),
                    Ok(Ok(None)) => break "peer closed the connection".to_string(),
                    Ok(Err(e)) => break e.to_string(),
                    Ok(Ok(Some(frame))) => match frame.kind {
                        Some(frame::Kind::Chat(message)) => {
                            room.on_message_received(message, &peer);
                        }
                        Some(frame::Kind::Heartbeat(_)) => {
                            trace!(peer = %peer, conn = handle.id(), "heartbeat");
                        }
                        Some(frame::Kind::Hello(_)) | None => {
                            break ChatError::ProtocolFrame("unexpected frame after handshake".to_string())
                                .to_string();
                        }
                    },
                }
            }
        }
    };

    debug!(peer = %peer, conn = handle.id(), %reason, "link reader stopped");
    handle.close();
    room.on_peer_disconnected(&peer, handle.id());
}

/// Drains the outbox and keeps the link alive with heartbeats. Any failed
/// write closes the link.
pub(crate) async fn run_writer(
    mut writer: OwnedWriteHalf,
    handle: ConnectionHandle,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    config: Arc<RoomConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut close = handle.close_signal();
    let mut heartbeat = interval(config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        if *close.borrow() || *shutdown.borrow() {
            break;
        }

        let frame = tokio::select! {
            _ = close.changed() => break,
            _ = shutdown.changed() => break,
            _ = heartbeat.tick() => Frame::heartbeat(),
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        match timeout(config.write_timeout(), write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer = %handle.peer_id(), conn = handle.id(), error = %e, "write failed");
                break;
            }
            Err(_) => {
                warn!(peer = %handle.peer_id(), conn = handle.id(), "write timed out");
                break;
            }
        }
    }

    handle.close();
    let _ = timeout(config.write_timeout(), writer.shutdown()).await;
}
