use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RoomConfig;
use crate::error::{ChatError, ChatResult};
use crate::protocol::message::{frame, read_frame, write_frame, Frame, Hello};
use crate::protocol::{PeerId, PeerInfo};
use crate::room::{ChatRoom, Registration};

mod link;

pub use link::{preferred_direction, ConnectionHandle, ConnectionId, Direction};

#[derive(Default)]
struct HostState {
    listener_port: Option<u16>,
    /// Peers with an outbound attempt in flight.
    pending: HashSet<PeerId>,
    /// Every registered link, by connection id.
    links: HashMap<ConnectionId, ConnectionHandle>,
    tasks: JoinSet<()>,
}

struct HostInner {
    room: Arc<ChatRoom>,
    config: Arc<RoomConfig>,
    state: Mutex<HostState>,
    next_connection: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the TCP side of a room: the listener and every link to a peer.
#[derive(Clone)]
pub struct PeerHost {
    inner: Arc<HostInner>,
}

impl PeerHost {
    pub fn new(room: Arc<ChatRoom>, config: Arc<RoomConfig>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(HostInner {
                room,
                config,
                state: Mutex::new(HostState::default()),
                next_connection: AtomicU64::new(1),
                shutdown_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state();
        while state.tasks.try_join_next().is_some() {}
        state.tasks.spawn(task);
    }

    fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Binds the first free port of the configured range and starts accepting.
    /// Returns the port to advertise.
    pub async fn start_listening(&self) -> ChatResult<u16> {
        let listener = self.bind_listener().await?;
        let port = listener.local_addr()?.port();
        self.state().listener_port = Some(port);
        info!(port, "listening for peers");

        let host = self.clone();
        self.spawn(async move { host.accept_loop(listener).await });
        Ok(port)
    }

    async fn bind_listener(&self) -> ChatResult<TcpListener> {
        let config = &self.inner.config;
        for port in config.tcp_port_start..=config.tcp_port_end {
            match TcpListener::bind(SocketAddr::new(config.bind_address, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                    debug!(port, error = %e, "port unavailable");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ChatError::NetworkBind {
            start: config.tcp_port_start,
            end: config.tcp_port_end,
        })
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.state().listener_port
    }

    /// Accepts inbound links until shutdown. Dropping the listener on exit
    /// closes the socket.
    pub async fn accept_loop(&self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let host = self.clone();
                        self.spawn(async move {
                            if let Err(e) = host.handle_inbound(stream, addr).await {
                                debug!(%addr, error = %e, "inbound link refused");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        debug!("accept loop stopped");
    }

    /// Dials `peer` in the background unless a link or an attempt already
    /// exists. Failures wait for the next discovery refresh.
    pub fn ensure_connected(&self, peer: PeerInfo) {
        if self.is_shutting_down() || self.inner.room.is_connected(&peer.id) {
            return;
        }
        if !self.state().pending.insert(peer.id.clone()) {
            return;
        }

        let host = self.clone();
        self.spawn(async move {
            let peer_id = peer.id.clone();
            if let Err(e) = host.connect_to(&peer).await {
                warn!(peer = %peer_id, error = %e, "connect failed; will retry on next announcement");
            }
            host.state().pending.remove(&peer_id);
        });
    }

    /// Opens an outbound link and runs the handshake.
    pub async fn connect_to(&self, peer: &PeerInfo) -> ChatResult<()> {
        let addr = peer.socket_addr();
        let mut stream = match timeout(self.inner.config.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ChatError::Connect { addr, source }),
            Err(_) => {
                return Err(ChatError::Connect {
                    addr,
                    source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        write_frame(&mut stream, &Frame::hello(self.local_hello())).await?;
        let hello = self.read_hello(&mut stream, addr).await?;
        let remote = self.validate_hello(&hello, addr)?;
        if remote.id != peer.id {
            return Err(ChatError::ProtocolFrame(format!(
                "expected peer {} at {addr}, found {}",
                peer.id, remote.id
            )));
        }

        self.attach(stream, remote, Direction::Outbound)
    }

    async fn handle_inbound(&self, mut stream: TcpStream, addr: SocketAddr) -> ChatResult<()> {
        let hello = self.read_hello(&mut stream, addr).await?;
        let remote = self.validate_hello(&hello, addr)?;
        write_frame(&mut stream, &Frame::hello(self.local_hello())).await?;
        self.attach(stream, remote, Direction::Inbound)
    }

    fn local_hello(&self) -> Hello {
        let room = &self.inner.room;
        Hello {
            peer_id: room.local_peer_id().to_string(),
            nickname: room.nickname(),
            room_name: room.room_name(),
            tcp_port: u32::from(self.listening_port().unwrap_or_default()),
        }
    }

    async fn read_hello(&self, stream: &mut TcpStream, addr: SocketAddr) -> ChatResult<Hello> {
        let config = &self.inner.config;
        let frame = timeout(config.read_timeout(), read_frame(stream, config.max_frame_len))
            .await
            .map_err(|_| ChatError::HandshakeTimeout { addr })??;

        match frame.and_then(|frame| frame.kind) {
            Some(frame::Kind::Hello(hello)) => Ok(hello),
            Some(_) => Err(ChatError::ProtocolFrame("expected hello".to_string())),
            None => Err(ChatError::ProtocolFrame("closed during handshake".to_string())),
        }
    }

    fn validate_hello(&self, hello: &Hello, addr: SocketAddr) -> ChatResult<PeerInfo> {
        let room = &self.inner.room;
        let peer_id = PeerId::from(hello.peer_id.as_str());
        if peer_id.is_empty() {
            return Err(ChatError::ProtocolFrame("hello without peer id".to_string()));
        }
        if peer_id == room.local_peer_id() {
            return Err(ChatError::SelfConnection);
        }
        let expected = room.room_name();
        if hello.room_name != expected {
            return Err(ChatError::RoomMismatch {
                peer_id,
                expected,
                actual: hello.room_name.clone(),
            });
        }
        let tcp_port = u16::try_from(hello.tcp_port)
            .map_err(|_| ChatError::ProtocolFrame(format!("bad tcp port {}", hello.tcp_port)))?;

        Ok(PeerInfo::new(peer_id, addr.ip(), tcp_port, hello.nickname.clone(), hello.room_name.clone()))
    }

    /// Registers a handshaken stream with the room and, if it survives the
    /// tie-break, starts its reader and writer.
    fn attach(&self, stream: TcpStream, remote: PeerInfo, direction: Direction) -> ChatResult<()> {
        if self.is_shutting_down() {
            return Ok(());
        }

        let connection = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let (handle, frames) = ConnectionHandle::channel(connection, remote.id.clone(), direction);

        match self.inner.room.register_peer(remote, handle.clone())? {
            Registration::Rejected => {
                handle.close();
                return Ok(());
            }
            Registration::Replaced(old) => {
                old.close();
                self.state().links.remove(&old.id());
            }
            Registration::Inserted | Registration::Updated => {}
        }

        let (reader, writer) = stream.into_split();
        self.state().links.insert(connection, handle.clone());

        let host = self.clone();
        let reader_handle = handle.clone();
        let room = self.inner.room.clone();
        let config = self.inner.config.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        self.spawn(async move {
            link::run_reader(reader, reader_handle, room, config, shutdown).await;
            host.state().links.remove(&connection);
        });

        let config = self.inner.config.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        self.spawn(link::run_writer(writer, handle, frames, config, shutdown));
        Ok(())
    }

    /// Drops a peer from the room and closes its link.
    pub fn disconnect(&self, peer_id: &PeerId) -> bool {
        match self.inner.room.unregister_peer(peer_id) {
            Some(handle) => {
                handle.close();
                self.state().links.remove(&handle.id());
                true
            }
            None => false,
        }
    }

    /// Number of links currently registered with the host.
    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    /// Stops accepting, closes every link and waits up to `grace` for the
    /// link tasks to finish before aborting them.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.inner.shutdown_tx.send_replace(true);
        for handle in self.inner.room.drain_connections() {
            handle.close();
        }

        let mut tasks = {
            let mut state = self.state();
            state.links.clear();
            state.pending.clear();
            std::mem::take(&mut state.tasks)
        };

        let drained = timeout(grace, async { while tasks.join_next().await.is_some() {} }).await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "link tasks did not stop in time; aborting");
            tasks.abort_all();
        }
        info!("peer host stopped");
    }
}
