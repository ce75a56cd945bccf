use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use bytes::{BufMut, BytesMut};
use tracing::{debug, error, warn};
use crate::config::NotificationKinds;
use crate::connection::{ConnectionHandle, ConnectionStatus};
use crate::buffers::storage_pool::StoragePool;
use crate::wire::message_type::DeliveryMethod;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingKind {
    /// A connection changed its status. `reason` is empty unless the connection was
    ///  disconnected or failed.
    StatusChanged { status: ConnectionStatus, reason: String },
    DebugMessage(String),
    WarningMessage(String),
    ErrorMessage(String),
    /// Application data received on a connection
    Data { method: DeliveryMethod, channel: u8 },
    /// Application data sent without a connection; the sender endpoint is set
    UnconnectedData,
    /// A remote peer asks to connect. The message data is the remote peer's hail, and the
    ///  application is expected to call [ConnectionHandle::approve] or [ConnectionHandle::deny].
    ConnectionApproval,
    /// Answer to [crate::peer::Peer::discover], carrying the remote peer's discovery response data
    DiscoveryResponse,
}

/// A message released by the network thread to the application, read via
///  [crate::peer::Peer::read_message]. Once the application is done with it, it can hand it
///  back to [crate::peer::Peer::recycle].
pub struct IncomingMessage {
    kind: IncomingKind,
    connection: Option<ConnectionHandle>,
    sender: Option<SocketAddr>,
    data: BytesMut,
}

impl Debug for IncomingMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IncomingMessage{{{:?} from {:?}, {} bytes}}", self.kind, self.sender, self.data.len())
    }
}

impl IncomingMessage {
    pub(crate) fn new(data: BytesMut) -> IncomingMessage {
        IncomingMessage {
            kind: IncomingKind::UnconnectedData,
            connection: None,
            sender: None,
            data,
        }
    }

    pub fn kind(&self) -> &IncomingKind {
        &self.kind
    }

    /// The connection this message is related to, if any
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn sender_endpoint(&self) -> Option<SocketAddr> {
        self.sender
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub(crate) fn replace_storage(&mut self, storage: BytesMut) -> BytesMut {
        std::mem::replace(&mut self.data, storage)
    }

    pub(crate) fn into_storage(self) -> BytesMut {
        self.data
    }

    pub(crate) fn reset(&mut self) {
        self.kind = IncomingKind::UnconnectedData;
        self.connection = None;
        self.sender = None;
        self.data.clear();
    }
}

/// The queue of messages released to the application. The network thread pushes, the
///  application pops; library notifications are filtered by the configured
///  [NotificationKinds] before they are queued.
pub(crate) struct ReleasedQueue {
    queue: Mutex<VecDeque<IncomingMessage>>,
    enabled: NotificationKinds,
    pool: Arc<StoragePool>,
}

impl ReleasedQueue {
    pub fn new(enabled: NotificationKinds, pool: Arc<StoragePool>) -> ReleasedQueue {
        ReleasedQueue {
            queue: Default::default(),
            enabled,
            pool,
        }
    }

    pub fn pop(&self) -> Option<IncomingMessage> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn push(&self, kind: IncomingKind, connection: Option<&ConnectionHandle>, sender: Option<SocketAddr>, data: &[u8]) {
        let mut msg = self.pool.create_incoming(data.len());
        msg.kind = kind;
        msg.connection = connection.cloned();
        msg.sender = sender.or_else(|| connection.map(|c| c.remote_endpoint()));
        msg.data.put_slice(data);

        self.queue.lock().unwrap().push_back(msg);
    }

    pub fn debug(&self, text: String) {
        debug!("{}", text);
        if self.enabled.contains(NotificationKinds::DEBUG) {
            self.push(IncomingKind::DebugMessage(text), None, None, &[]);
        }
    }

    pub fn warning(&self, text: String) {
        warn!("{}", text);
        if self.enabled.contains(NotificationKinds::WARNING) {
            self.push(IncomingKind::WarningMessage(text), None, None, &[]);
        }
    }

    pub fn error(&self, text: String) {
        error!("{}", text);
        if self.enabled.contains(NotificationKinds::ERROR) {
            self.push(IncomingKind::ErrorMessage(text), None, None, &[]);
        }
    }

    pub fn status_changed(&self, connection: &ConnectionHandle, status: ConnectionStatus, reason: &str) {
        if self.enabled.contains(NotificationKinds::STATUS_CHANGED) {
            self.push(IncomingKind::StatusChanged { status, reason: reason.to_string() }, Some(connection), None, &[]);
        }
    }

    pub fn data(&self, connection: &ConnectionHandle, method: DeliveryMethod, channel: u8, data: &[u8]) {
        self.push(IncomingKind::Data { method, channel }, Some(connection), None, data);
    }

    pub fn connection_approval(&self, connection: &ConnectionHandle, hail: &[u8]) {
        self.push(IncomingKind::ConnectionApproval, Some(connection), None, hail);
    }

    pub fn unconnected_data(&self, from: SocketAddr, data: &[u8]) {
        if self.enabled.contains(NotificationKinds::UNCONNECTED_DATA) {
            self.push(IncomingKind::UnconnectedData, None, Some(from), data);
        }
    }

    pub fn discovery_response(&self, from: SocketAddr, data: &[u8]) {
        if self.enabled.contains(NotificationKinds::DISCOVERY_RESPONSE) {
            self.push(IncomingKind::DiscoveryResponse, None, Some(from), data);
        }
    }
}
