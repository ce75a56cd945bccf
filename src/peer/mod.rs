//! The [Peer] is the application's entry point: it owns the UDP socket and the network thread,
//!  and it is the factory for connections and outgoing messages.
//!
//! All methods are non-blocking and can be called from any thread. Requests are handed to the
//!  network thread through a command channel, and everything the network thread has to report
//!  (received data, status changes, library notifications) is queued for
//!  [Peer::read_message].

pub mod network_loop;
pub mod socket;
pub mod statistics;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use crate::buffers::incoming::{IncomingMessage, ReleasedQueue};
use crate::buffers::outgoing::OutgoingMessage;
use crate::buffers::storage_pool::StoragePool;
use crate::config::PeerConfig;
use crate::connection::{ConnectionHandle, ConnectionStatus, Priority};
use crate::error::PeerError;
use crate::peer::network_loop::{NetworkLoop, PeerCommand};
use crate::peer::socket::bind_socket;
use crate::peer::statistics::{PeerStatistics, StatisticsSnapshot};
use crate::wire::library_messages::LibraryMessageConnect;
use crate::wire::message_type::{DeliveryMethod, MessageType};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum PeerStatus {
    NotStarted = 0,
    Starting = 1,
    Running = 2,
    ShuttingDown = 3,
    ShutDown = 4,
}

/// State shared between the application's [Peer] and the network thread
pub(crate) struct PeerShared {
    pub config: Arc<PeerConfig>,
    pub pool: Arc<StoragePool>,
    pub released: ReleasedQueue,
    pub statistics: PeerStatistics,
    /// snapshot of the network thread's connections, updated whenever a connection is added or removed
    pub connections: Mutex<Vec<ConnectionHandle>>,
    status: AtomicU8,
}

impl PeerShared {
    pub fn new(config: PeerConfig) -> Arc<PeerShared> {
        let config = Arc::new(config);
        let pool = Arc::new(StoragePool::new(config.max_pool_size));
        Arc::new(PeerShared {
            released: ReleasedQueue::new(config.enabled_notifications, pool.clone()),
            pool,
            statistics: Default::default(),
            connections: Default::default(),
            status: AtomicU8::new(PeerStatus::NotStarted.into()),
            config,
        })
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus::try_from(self.status.load(Ordering::Acquire))
            .unwrap_or(PeerStatus::ShutDown)
    }

    pub fn set_status(&self, status: PeerStatus) {
        debug!("peer status: {:?}", status);
        self.status.store(status.into(), Ordering::Release);
    }

    /// Running, unless shutdown was requested before the network loop got going
    pub fn on_loop_started(&self) {
        let _ = self.status.compare_exchange(PeerStatus::Starting.into(), PeerStatus::Running.into(), Ordering::AcqRel, Ordering::Acquire);
    }
}

pub struct Peer {
    shared: Arc<PeerShared>,
    commands: Mutex<Option<mpsc::UnboundedSender<PeerCommand>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    network_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        // the network loop shuts down when the command channel is closed
        self.commands.lock().unwrap().take();

        if let Some(thread) = self.network_thread.lock().unwrap().take() {
            if thread.join().is_err() {
                error!("network thread panicked");
            }
        }
    }
}

impl Peer {
    pub fn new(config: PeerConfig) -> anyhow::Result<Peer> {
        config.validate()?;
        Ok(Peer {
            shared: PeerShared::new(config),
            commands: Default::default(),
            local_addr: Default::default(),
            network_thread: Default::default(),
        })
    }

    /// Binds the socket and starts the network thread, returning the local address
    pub fn start(&self) -> anyhow::Result<SocketAddr> {
        let mut network_thread = self.network_thread.lock().unwrap();
        if self.shared.status() != PeerStatus::NotStarted {
            return Err(PeerError::AlreadyStarted.into());
        }

        let socket = bind_socket(&self.shared.config)?;
        let local_addr = socket.local_addr()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let network_loop = NetworkLoop::new(Box::new(socket), self.shared.clone(), receiver);

        self.shared.set_status(PeerStatus::Starting);
        let shared = self.shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("peerlink-{}", local_addr.port()))
            .spawn(move || {
                match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt.block_on(network_loop.run()),
                    Err(e) => {
                        error!("error creating the network thread's runtime: {}", e);
                        shared.set_status(PeerStatus::ShutDown);
                    }
                }
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                self.shared.set_status(PeerStatus::NotStarted);
                return Err(e.into());
            }
        };

        *self.commands.lock().unwrap() = Some(sender);
        *self.local_addr.lock().unwrap() = Some(local_addr);
        *network_thread = Some(thread);

        info!("peer {:?} started on {:?}", self.shared.config.app_identifier, local_addr);
        Ok(local_addr)
    }

    /// Disconnects all connections and stops the network thread. This returns immediately, the
    ///  shutdown completes asynchronously.
    ///
    /// Messages that are still queued are sent once, without waiting for acknowledgements. A reason
    ///  too long for a single datagram is truncated.
    pub fn shutdown(&self, reason: &str) {
        match self.shared.status() {
            PeerStatus::Starting | PeerStatus::Running => {
                self.shared.set_status(PeerStatus::ShuttingDown);
                if let Some(commands) = self.commands.lock().unwrap().as_ref() {
                    let _ = commands.send(PeerCommand::Shutdown { reason: reason.to_string() });
                }
            }
            PeerStatus::NotStarted => self.shared.set_status(PeerStatus::ShutDown),
            PeerStatus::ShuttingDown | PeerStatus::ShutDown => {}
        }
    }

    fn send_command(&self, command: PeerCommand) -> anyhow::Result<()> {
        match self.shared.status() {
            PeerStatus::NotStarted => return Err(PeerError::NotStarted.into()),
            PeerStatus::ShuttingDown | PeerStatus::ShutDown => return Err(PeerError::ShutDown.into()),
            PeerStatus::Starting | PeerStatus::Running => {}
        }

        let commands = self.commands.lock().unwrap();
        match commands.as_ref() {
            Some(commands) => commands.send(command).map_err(|_| PeerError::ShutDown.into()),
            None => Err(PeerError::NotStarted.into()),
        }
    }

    /// Starts connecting to a remote peer. The returned handle is in status
    ///  [ConnectionStatus::None] until the network thread picks up the request.
    ///
    /// The hail is sent with the Connect message, so together with the application identifier
    ///  it must fit into a single datagram.
    pub fn connect(&self, remote: SocketAddr, hail: Vec<u8>) -> anyhow::Result<ConnectionHandle> {
        let config = &self.shared.config;
        let msg = LibraryMessageConnect { app_identifier: config.app_identifier.clone(), hail };
        let max_len = config.max_library_payload();
        if msg.serialized_len() > max_len {
            return Err(PeerError::MessageTooLarge { len: msg.serialized_len(), max_len }.into());
        }

        let handle = ConnectionHandle::new(remote, max_len);
        self.send_command(PeerCommand::Connect { handle: handle.clone(), hail: msg.hail })?;
        Ok(handle)
    }

    /// Creates an empty outgoing message, recycling a pooled buffer if possible
    pub fn create_message(&self, capacity: usize) -> OutgoingMessage {
        self.shared.pool.create_outgoing(capacity)
    }

    fn user_message_type(&self, msg: &OutgoingMessage, method: DeliveryMethod, channel: u8) -> anyhow::Result<MessageType> {
        let num_channels = method.num_channels();
        if channel >= num_channels {
            return Err(PeerError::InvalidChannel { channel, num_channels }.into());
        }

        let max_len = self.shared.config.max_message_size;
        if msg.len() > max_len {
            return Err(PeerError::MessageTooLarge { len: msg.len(), max_len }.into());
        }

        MessageType::user(method, channel)
    }

    pub fn send_message(&self, msg: OutgoingMessage, connection: &ConnectionHandle, method: DeliveryMethod, channel: u8, priority: Priority) -> anyhow::Result<()> {
        let message_type = self.user_message_type(&msg, method, channel)?;
        if is_closing(connection.status()) {
            return Err(PeerError::NotConnected.into());
        }
        self.ensure_running()?;

        connection.enqueue(msg.into_queued(self.shared.pool.clone()), message_type, priority);
        Ok(())
    }

    /// Sends one message to several connections, sharing its payload. Connections that are
    ///  closing or closed are skipped.
    pub fn send_to_many(&self, msg: OutgoingMessage, connections: &[ConnectionHandle], method: DeliveryMethod, channel: u8, priority: Priority) -> anyhow::Result<()> {
        let message_type = self.user_message_type(&msg, method, channel)?;
        self.ensure_running()?;

        let recipients: Vec<&ConnectionHandle> = connections.iter()
            .filter(|c| !is_closing(c.status()))
            .collect();
        if recipients.is_empty() {
            debug!("no connection to send to");
            self.shared.pool.recycle_outgoing(msg);
            return Ok(());
        }

        let payload = msg.into_queued(self.shared.pool.clone());
        for connection in recipients {
            connection.enqueue(payload.clone(), message_type, priority);
        }
        Ok(())
    }

    /// Sends a message to all connected peers, optionally excluding one of them
    pub fn send_to_all(&self, msg: OutgoingMessage, except: Option<&ConnectionHandle>, method: DeliveryMethod, channel: u8, priority: Priority) -> anyhow::Result<()> {
        let recipients: Vec<ConnectionHandle> = self.connections().into_iter()
            .filter(|c| c.status() == ConnectionStatus::Connected)
            .filter(|c| Some(c) != except)
            .collect();
        self.send_to_many(msg, &recipients, method, channel, priority)
    }

    /// Sends a single-datagram message to an endpoint without a connection
    pub fn send_unconnected(&self, msg: OutgoingMessage, to: SocketAddr) -> anyhow::Result<()> {
        let max_len = self.shared.config.max_library_payload();
        if msg.len() > max_len {
            return Err(PeerError::MessageTooLarge { len: msg.len(), max_len }.into());
        }

        let payload = msg.into_queued(self.shared.pool.clone());
        self.send_command(PeerCommand::UnconnectedSend { to, payload })
    }

    /// Asks the peer at `to` (which may be a broadcast address) to identify itself. Answers
    ///  are reported as [crate::buffers::incoming::IncomingKind::DiscoveryResponse].
    pub fn discover(&self, to: SocketAddr) -> anyhow::Result<()> {
        self.send_command(PeerCommand::Discover { to })
    }

    fn ensure_running(&self) -> anyhow::Result<()> {
        match self.shared.status() {
            PeerStatus::NotStarted => Err(PeerError::NotStarted.into()),
            PeerStatus::ShuttingDown | PeerStatus::ShutDown => Err(PeerError::ShutDown.into()),
            PeerStatus::Starting | PeerStatus::Running => Ok(()),
        }
    }

    /// Returns the next released message if there is one. Pass it to [Peer::recycle] when done
    ///  to make its buffer available for reuse.
    pub fn read_message(&self) -> Option<IncomingMessage> {
        self.shared.released.pop()
    }

    pub fn recycle(&self, msg: IncomingMessage) {
        self.shared.pool.recycle_incoming(msg);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.statistics.snapshot()
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.shared.connections.lock().unwrap().clone()
    }

    pub fn status(&self) -> PeerStatus {
        self.shared.status()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }
}

fn is_closing(status: ConnectionStatus) -> bool {
    matches!(status, ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected)
}
