//! A connection to one remote peer. It is split into two parts:
//!
//! * [ConnectionHandle] is the application's view. It is cheap to clone and thread safe, and
//!   it holds the outbound priority queues, status and RTT as seen by the application.
//! * [Connection] holds all protocol state (sequence numbers, resend lists, withheld messages,
//!   handshake progress). It is owned and touched exclusively by the network thread, so it needs
//!   no locking.

pub mod latency;
pub(crate) mod fragmentation;
pub(crate) mod handshake;
pub(crate) mod receive_channels;
pub(crate) mod send_channels;

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::buffers::outgoing::QueueRef;
use crate::connection::fragmentation::{split_into_fragments, FragmentAssembler};
use crate::connection::handshake::Handshake;
use crate::connection::latency::LatencyEstimator;
use crate::connection::receive_channels::{ReceiveChannels, ReceivedMessage};
use crate::connection::send_channels::{QueuedMessage, SendChannels};
use crate::error::PeerError;
use crate::peer::PeerShared;
use crate::wire::library_messages::{LibraryMessageAcknowledge, LibraryMessageConnect, LibraryMessageConnectResponse, LibraryMessageDisconnect, LibraryMessagePing};
use crate::wire::message_header::{FragmentHeader, MessageHeader};
use crate::wire::message_type::{LibraryMessageType, MessageType};
use crate::wire::packet_writer::PacketWriter;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ConnectionStatus {
    None = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

/// Outbound queues are drained High before Normal before Low
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    fn queue_index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApprovalDecision {
    Approve { hail: Vec<u8> },
    Deny { reason: String },
}

struct ConnectionShared {
    remote: SocketAddr,
    status: AtomicU8,
    avg_rtt_nanos: AtomicU64,
    outbound: Mutex<[VecDeque<QueuedMessage>; 3]>,
    approval: Mutex<Option<ApprovalDecision>>,
    disconnect_request: Mutex<Option<String>>,
    remote_hail: Mutex<Vec<u8>>,
    max_library_payload: usize,
}

/// The application's handle to a connection. All methods are non-blocking; requests like
///  [ConnectionHandle::disconnect] are picked up by the network thread on its next iteration.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl Debug for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}, {:?}}}", self.shared.remote, self.status())
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
impl Eq for ConnectionHandle {}

impl ConnectionHandle {
    pub(crate) fn new(remote: SocketAddr, max_library_payload: usize) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::new(ConnectionShared {
                remote,
                status: AtomicU8::new(ConnectionStatus::None.into()),
                avg_rtt_nanos: AtomicU64::new(0),
                outbound: Default::default(),
                approval: Default::default(),
                disconnect_request: Default::default(),
                remote_hail: Default::default(),
                max_library_payload,
            }),
        }
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::try_from(self.shared.status.load(Ordering::Acquire))
            .unwrap_or(ConnectionStatus::None)
    }

    pub fn average_roundtrip_time(&self) -> Duration {
        Duration::from_nanos(self.shared.avg_rtt_nanos.load(Ordering::Acquire))
    }

    /// The hail data the remote peer sent during the handshake
    pub fn remote_hail(&self) -> Vec<u8> {
        self.shared.remote_hail.lock().unwrap().clone()
    }

    /// Approves an incoming connection that is awaiting approval
    pub fn approve(&self) {
        *self.shared.approval.lock().unwrap() = Some(ApprovalDecision::Approve { hail: Vec::new() });
    }

    /// Approves an incoming connection, sending `hail` back to the remote peer. The hail must
    ///  fit into a single datagram.
    pub fn approve_with_hail(&self, hail: Vec<u8>) -> anyhow::Result<()> {
        let msg = LibraryMessageConnectResponse { hail };
        self.check_library_payload(msg.serialized_len())?;
        *self.shared.approval.lock().unwrap() = Some(ApprovalDecision::Approve { hail: msg.hail });
        Ok(())
    }

    pub fn deny(&self, reason: &str) -> anyhow::Result<()> {
        let msg = LibraryMessageDisconnect { reason: reason.to_string() };
        self.check_library_payload(msg.serialized_len())?;
        *self.shared.approval.lock().unwrap() = Some(ApprovalDecision::Deny { reason: msg.reason });
        Ok(())
    }

    /// Requests a graceful disconnect. Messages that were sent before are still delivered
    ///  (reliable ones only with a configured linger time), and the remote peer receives
    ///  `reason`, which must fit into a single datagram.
    pub fn disconnect(&self, reason: &str) -> anyhow::Result<()> {
        let msg = LibraryMessageDisconnect { reason: reason.to_string() };
        self.check_library_payload(msg.serialized_len())?;
        *self.shared.disconnect_request.lock().unwrap() = Some(msg.reason);
        Ok(())
    }

    fn check_library_payload(&self, len: usize) -> anyhow::Result<()> {
        let max_len = self.shared.max_library_payload;
        if len > max_len {
            return Err(PeerError::MessageTooLarge { len, max_len }.into());
        }
        Ok(())
    }

    /// number of messages waiting in the outbound queues
    pub fn num_queued(&self) -> usize {
        self.shared.outbound.lock().unwrap()
            .iter()
            .map(|q| q.len())
            .sum()
    }

    pub(crate) fn enqueue(&self, payload: QueueRef, message_type: MessageType, priority: Priority) {
        self.shared.outbound.lock().unwrap()[priority.queue_index()]
            .push_back(QueuedMessage::new(payload, message_type));
    }

    fn take_outbound(&self) -> [VecDeque<QueuedMessage>; 3] {
        std::mem::take(&mut *self.shared.outbound.lock().unwrap())
    }

    /// Puts messages that could not be sent back in front of the queues, keeping their order
    fn requeue_front(&self, mut deferred: [VecDeque<QueuedMessage>; 3]) {
        let mut outbound = self.shared.outbound.lock().unwrap();
        for (queue, mut front) in outbound.iter_mut().zip(deferred.iter_mut().map(std::mem::take)) {
            front.append(queue);
            *queue = front;
        }
    }

    fn clear_outbound(&self) {
        self.take_outbound();
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.shared.status.store(status.into(), Ordering::Release);
    }

    fn set_avg_rtt(&self, rtt: Duration) {
        self.shared.avg_rtt_nanos.store(rtt.as_nanos() as u64, Ordering::Release);
    }

    fn set_remote_hail(&self, hail: Vec<u8>) {
        *self.shared.remote_hail.lock().unwrap() = hail;
    }

    fn take_approval(&self) -> Option<ApprovalDecision> {
        self.shared.approval.lock().unwrap().take()
    }

    fn take_disconnect_request(&self) -> Option<String> {
        self.shared.disconnect_request.lock().unwrap().take()
    }
}

/// Simple byte rate limit for user data: the debt grows with every byte sent and is paid off
///  over time at the configured rate
struct Throttle {
    debt: f64,
    last_update: Instant,
}

impl Throttle {
    fn update(&mut self, now: Instant, bytes_per_second: u32) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.debt = (self.debt - elapsed * bytes_per_second as f64).max(0.0);
        self.last_update = now;
    }

    fn is_throttled(&self, bytes_per_second: u32, peak_bytes: u32) -> bool {
        bytes_per_second > 0 && self.debt > peak_bytes as f64
    }
}

/// The network thread's side of a connection
pub(crate) struct Connection {
    handle: ConnectionHandle,
    remote: SocketAddr,
    status: ConnectionStatus,
    is_initiator: bool,
    shared: Arc<PeerShared>,
    writer: PacketWriter,
    latency: LatencyEstimator,
    send_channels: SendChannels,
    receive_channels: ReceiveChannels,
    assembler: FragmentAssembler,
    next_fragment_group: u16,
    handshake: Handshake,
    last_sent: Instant,
    linger_until: Option<(Instant, String)>,
    throttle: Throttle,
    owner_thread: ThreadId,
}

impl Connection {
    fn new(handle: ConnectionHandle, is_initiator: bool, handshake: Handshake, shared: Arc<PeerShared>, now: Instant) -> Connection {
        let config = shared.config.clone();
        let mut result = Connection {
            remote: handle.remote_endpoint(),
            handle,
            status: ConnectionStatus::None,
            is_initiator,
            writer: PacketWriter::new(config.mtu, shared.pool.clone()),
            latency: LatencyEstimator::new(config.rtt_new_sample_weight, now),
            send_channels: SendChannels::new(config.window_size),
            receive_channels: ReceiveChannels::new(),
            assembler: FragmentAssembler::new(config.fragment_group_timeout),
            next_fragment_group: 0,
            handshake,
            last_sent: now,
            linger_until: None,
            throttle: Throttle { debt: 0.0, last_update: now },
            owner_thread: std::thread::current().id(),
            shared,
        };
        result.set_status(ConnectionStatus::Connecting, "");
        result
    }

    /// A connection initiated locally, sending Connect until the remote peer responds
    pub fn new_outgoing(handle: ConnectionHandle, hail: Vec<u8>, shared: Arc<PeerShared>, now: Instant) -> Connection {
        debug!("connecting to {:?}", handle.remote_endpoint());
        Self::new(handle, true, Handshake::new(hail, false, now), shared, now)
    }

    /// A connection requested by a remote peer's Connect message
    pub fn new_incoming(handle: ConnectionHandle, remote_hail: Vec<u8>, shared: Arc<PeerShared>, now: Instant) -> Connection {
        debug!("incoming connection from {:?}", handle.remote_endpoint());
        let needs_approval = shared.config.connection_approval;
        if needs_approval {
            shared.released.connection_approval(&handle, &remote_hail);
        }
        handle.set_remote_hail(remote_hail);
        Self::new(handle, false, Handshake::new(Vec::new(), needs_approval, now), shared, now)
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn assert_network_thread(&self) {
        debug_assert_eq!(std::thread::current().id(), self.owner_thread, "connection state must only be touched by the network thread");
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: &str) {
        if self.status == status {
            return;
        }
        info!("connection {:?}: {:?} -> {:?} {}", self.remote, self.status, status, reason);
        self.status = status;
        self.handle.set_status(status);
        self.shared.released.status_changed(&self.handle, status, reason);
    }

    /// Periodic processing, called once per network loop iteration
    pub fn heartbeat(&mut self, now: Instant) {
        self.assert_network_thread();

        self.poll_application_requests(now);

        match self.status {
            ConnectionStatus::Connecting => self.handshake_heartbeat(now),
            ConnectionStatus::Connected => self.connected_heartbeat(now),
            ConnectionStatus::Disconnecting => self.linger_heartbeat(now),
            ConnectionStatus::None | ConnectionStatus::Disconnected => {}
        }
    }

    fn poll_application_requests(&mut self, now: Instant) {
        if let Some(reason) = self.handle.take_disconnect_request() {
            self.disconnect(&reason, now);
        }

        if self.handshake.is_awaiting_approval() {
            if let Some(decision) = self.handle.take_approval() {
                self.apply_approval_decision(decision, now);
            }
        }
    }

    fn connected_heartbeat(&mut self, now: Instant) {
        let config = self.shared.config.clone();

        if self.latency.is_timed_out(now, config.connection_timeout) {
            self.close("Timed out");
            return;
        }

        for group_id in self.assembler.expire(now, &self.shared.pool) {
            self.shared.released.debug(format!("dropping incomplete fragment group {} from {:?}", group_id, self.remote));
        }

        if self.latency.is_ping_due(now, config.ping_frequency) {
            let ping_id = self.latency.on_ping_sent(now);
            trace!("sending ping #{} to {:?}", ping_id, self.remote);
            self.write_library_message(LibraryMessageType::Ping, now, |buf| LibraryMessagePing { ping_id }.ser(buf));
        }

        self.resend_due(now);
        let wrote_user_data = self.drain_outbound(now);

        let piggyback = wrote_user_data && self.receive_channels.num_pending_acks() > 0;
        if piggyback || self.receive_channels.should_flush_acks(now, config.ack_flush_threshold, config.max_ack_delay) {
            self.flush_acks(now);
        }

        if now.duration_since(self.last_sent) >= config.keep_alive_delay {
            trace!("sending keepalive to {:?}", self.remote);
            self.write_library_message(LibraryMessageType::KeepAlive, now, |_| {});
        }
    }

    fn resend_due(&mut self, now: Instant) {
        let avg_rtt = self.latency.avg_rtt();
        let writer = &mut self.writer;
        let throttle = &mut self.throttle;
        let outcome = self.send_channels.resend_due(now, &self.shared.config.resend_policy, avg_rtt, |msg, sequence_number| {
            let data = msg.data();
            let header = MessageHeader::user(msg.message_type, Some(sequence_number), data.len(), msg.fragment_header());
            writer.write_message(&header, data);
            throttle.debt += data.len() as f64;
        });

        if outcome.resent > 0 {
            self.last_sent = now;
            self.shared.statistics.add_resent_messages(outcome.resent);
        }
        if outcome.dropped > 0 {
            self.shared.statistics.add_dropped_messages(outcome.dropped);
            self.shared.released.warning(format!("dropped {} reliable message(s) to {:?} after {} unacknowledged sends", outcome.dropped, self.remote, self.shared.config.resend_policy.max_sends));
        }
    }

    /// Moves messages from the application's outbound queues into datagrams, returning `true`
    ///  if any user data was written
    fn drain_outbound(&mut self, now: Instant) -> bool {
        let config = self.shared.config.clone();
        self.throttle.update(now, config.throttle_bytes_per_second);

        let max_unfragmented_payload = self.writer.max_payload_len(MessageHeader::MAX_SERIALIZED_LEN - FragmentHeader::SERIALIZED_LEN);

        let mut queues = self.handle.take_outbound();
        let mut deferred: [VecDeque<QueuedMessage>; 3] = Default::default();
        let mut wrote_user_data = false;

        for (queue, deferred) in queues.iter_mut().zip(deferred.iter_mut()) {
            while let Some(msg) = queue.pop_front() {
                if self.throttle.is_throttled(config.throttle_bytes_per_second, config.throttle_peak_bytes) {
                    deferred.push_back(msg);
                    continue;
                }

                if msg.fragment.is_none() && msg.payload.len() > max_unfragmented_payload {
                    let group_id = self.next_fragment_group;
                    self.next_fragment_group = self.next_fragment_group.wrapping_add(1);
                    for fragment in split_into_fragments(msg, group_id, config.max_fragment_payload()).into_iter().rev() {
                        queue.push_front(fragment);
                    }
                    continue;
                }

                if self.send_channels.is_window_full(msg.message_type) {
                    deferred.push_back(msg);
                    continue;
                }

                self.send_user_message(msg, now);
                wrote_user_data = true;
            }
        }

        if deferred.iter().any(|d| !d.is_empty()) {
            self.handle.requeue_front(deferred);
        }
        wrote_user_data
    }

    fn send_user_message(&mut self, msg: QueuedMessage, now: Instant) {
        let sequence_number = self.send_channels.assign_sequence_number(msg.message_type);

        let data = msg.data();
        let header = MessageHeader::user(msg.message_type, sequence_number, data.len(), msg.fragment_header());
        self.writer.write_message(&header, data);
        self.throttle.debt += data.len() as f64;
        self.last_sent = now;

        if msg.payload.mark_sent() {
            self.shared.statistics.add_sent_messages(1);
        }

        match sequence_number {
            Some(sequence_number) if msg.message_type.is_reliable() => {
                let avg_rtt = self.latency.avg_rtt();
                self.send_channels.store(msg, sequence_number, now, &self.shared.config.resend_policy, avg_rtt);
            }
            _ => {}
        }
    }

    fn flush_acks(&mut self, now: Instant) {
        if self.receive_channels.num_pending_acks() == 0 {
            return;
        }

        let acks = self.receive_channels.take_acks();
        let max_per_message = (self.writer.mtu() - MessageHeader::MAX_SERIALIZED_LEN) / LibraryMessageAcknowledge::ENTRY_LEN;
        trace!("sending {} ack(s) to {:?}", acks.len(), self.remote);

        for chunk in acks.chunks(max_per_message) {
            let msg = LibraryMessageAcknowledge { entries: chunk.to_vec() };
            self.write_library_message(LibraryMessageType::Acknowledge, now, |buf| msg.ser(buf));
        }
    }

    fn write_library_message(&mut self, library_type: LibraryMessageType, now: Instant, ser_payload: impl FnOnce(&mut BytesMut)) {
        let mut payload = BytesMut::new();
        ser_payload(&mut payload);
        let header = MessageHeader::library(library_type, payload.len());
        self.writer.write_message(&header, &payload);
        self.last_sent = now;
    }

    /// Returns the datagrams written since the last call, for sending to the remote endpoint
    pub fn take_datagrams(&mut self) -> Vec<BytesMut> {
        self.assert_network_thread();
        self.writer.take_datagrams()
    }

    /// Dispatches a message received from this connection's remote endpoint
    pub fn on_message(&mut self, header: &MessageHeader, payload: &[u8], now: Instant) {
        self.assert_network_thread();

        if self.status == ConnectionStatus::Disconnected {
            trace!("ignoring message from {:?} for a disconnected connection", self.remote);
            return;
        }

        match header.message_type {
            MessageType::Library => {
                if let Err(e) = self.on_library_message(header, payload, now) {
                    self.shared.released.warning(format!("malformed library message {:?} from {:?}: {}", header.library_type, self.remote, e));
                }
            }
            MessageType::Unconnected => {
                self.shared.released.unconnected_data(self.remote, payload);
            }
            MessageType::User { .. } => self.on_user_message(header, payload, now),
        }
    }

    fn on_library_message(&mut self, header: &MessageHeader, mut payload: &[u8], now: Instant) -> anyhow::Result<()> {
        let Some(library_type) = header.library_type else {
            return Ok(());
        };

        match library_type {
            LibraryMessageType::Connect => {
                let msg = LibraryMessageConnect::deser(&mut payload)?;
                self.on_repeated_connect(msg, now);
            }
            LibraryMessageType::ConnectResponse => {
                let msg = LibraryMessageConnectResponse::deser(&mut payload)?;
                self.on_connect_response(msg, now);
            }
            LibraryMessageType::ConnectionEstablished => {
                self.on_connection_established(now);
            }
            LibraryMessageType::Disconnect => {
                let msg = LibraryMessageDisconnect::deser(&mut payload)?;
                debug!("remote peer {:?} disconnected: {}", self.remote, msg.reason);
                self.close(&msg.reason);
            }
            LibraryMessageType::KeepAlive => {}
            LibraryMessageType::Ping => {
                let msg = LibraryMessagePing::deser(&mut payload)?;
                self.write_library_message(LibraryMessageType::Pong, now, |buf| msg.ser(buf));
            }
            LibraryMessageType::Pong => {
                let msg = LibraryMessagePing::deser(&mut payload)?;
                self.latency.on_pong(msg.ping_id, now);
                self.handle.set_avg_rtt(self.latency.avg_rtt());
            }
            LibraryMessageType::Acknowledge => {
                let msg = LibraryMessageAcknowledge::deser(&mut payload)?;
                for (sequence_number, raw_type) in msg.entries {
                    if self.send_channels.on_ack(sequence_number, raw_type) {
                        self.latency.on_response(now);
                    }
                }
            }
            LibraryMessageType::Discovery | LibraryMessageType::DiscoveryResponse => {
                debug!("ignoring {:?} from connected peer {:?}", library_type, self.remote);
            }
        }
        Ok(())
    }

    fn on_user_message(&mut self, header: &MessageHeader, payload: &[u8], now: Instant) {
        if self.status == ConnectionStatus::Connecting {
            // the acceptor treats data as implicit confirmation of the handshake
            if !self.is_initiator && self.handshake.is_response_sent() {
                self.on_established(now);
            }
            else {
                self.shared.released.debug(format!("ignoring user message from {:?} before the handshake completed", self.remote));
                return;
            }
        }

        let mut data = self.shared.pool.get_storage(payload.len());
        data.extend_from_slice(payload);
        let msg = ReceivedMessage {
            message_type: header.message_type,
            sequence_number: header.sequence_number,
            fragment: header.fragment,
            data,
        };

        let mut delivered = Vec::new();
        let classification = self.receive_channels.receive(msg, now, |m| delivered.push(m));
        trace!("received {:?} #{:?} from {:?}: {:?}", header.message_type, header.sequence_number, self.remote, classification);

        for msg in delivered {
            self.release(msg, now);
        }
    }

    fn release(&mut self, msg: ReceivedMessage, now: Instant) {
        let MessageType::User { method, channel } = msg.message_type else {
            return;
        };

        let data = match msg.fragment {
            None => msg.data,
            Some(fragment) => match self.assembler.add(fragment, msg.data, now, &self.shared.pool) {
                Ok(Some(data)) => data,
                Ok(None) => return,
                Err(e) => {
                    self.shared.released.warning(format!("fragment from {:?}: {}", self.remote, e));
                    return;
                }
            }
        };

        self.shared.statistics.add_received_messages(1);
        self.shared.released.data(&self.handle, method, channel, &data);
        self.shared.pool.recycle_storage(data);
    }

    /// Local disconnect. Messages the application queued before are still sent, and Disconnect
    ///  is the last message on the wire. With a linger time, the connection first keeps sending,
    ///  resending and acknowledging until everything is acknowledged or the linger time is over.
    pub fn disconnect(&mut self, reason: &str, now: Instant) {
        self.assert_network_thread();

        match self.status {
            ConnectionStatus::Connected if !self.shared.config.linger.is_zero() => {
                debug!("lingering before disconnecting from {:?}", self.remote);
                self.linger_until = Some((now + self.shared.config.linger, reason.to_string()));
                self.set_status(ConnectionStatus::Disconnecting, reason);
            }
            ConnectionStatus::Connecting | ConnectionStatus::Connected => self.finish_disconnect(reason, now),
            ConnectionStatus::None => self.close(reason),
            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected => {}
        }
    }

    fn linger_heartbeat(&mut self, now: Instant) {
        let Some((until, reason)) = self.linger_until.clone() else {
            return;
        };

        self.resend_due(now);
        self.drain_outbound(now);

        let is_delivered = self.handle.num_queued() == 0 && self.send_channels.num_stored() == 0;
        if is_delivered || now >= until {
            self.finish_disconnect(&reason, now);
        }
        else {
            self.flush_acks(now);
        }
    }

    /// Sends whatever the application queued, followed by Disconnect, and closes the connection
    ///  without waiting for acknowledgements. This is the final step of a local disconnect, and
    ///  it is what shutdown does for every connection.
    pub fn finish_disconnect(&mut self, reason: &str, now: Instant) {
        self.assert_network_thread();

        match self.status {
            ConnectionStatus::Connected | ConnectionStatus::Disconnecting => {
                self.drain_outbound(now);
                self.flush_acks(now);
            }
            ConnectionStatus::Connecting => {}
            ConnectionStatus::None | ConnectionStatus::Disconnected => {
                self.close(reason);
                return;
            }
        }

        // NB: a shutdown reason is not checked at the API, so it may need truncating
        let msg = LibraryMessageDisconnect::truncated(reason, self.shared.config.max_library_payload());
        self.write_library_message(LibraryMessageType::Disconnect, now, |buf| msg.ser(buf));
        self.close(reason);
    }

    /// Transitions to Disconnected immediately without a goodbye exchange, releasing all
    ///  queued and stored messages
    pub fn close(&mut self, reason: &str) {
        self.assert_network_thread();
        if self.status == ConnectionStatus::Disconnected {
            return;
        }

        let num_unacked = self.send_channels.num_stored();
        let num_unsent = self.handle.num_queued();
        if num_unacked > 0 || num_unsent > 0 {
            debug!("closing connection to {:?} with {} unacknowledged and {} unsent messages", self.remote, num_unacked, num_unsent);
        }
        self.send_channels.clear();
        self.receive_channels.clear();
        self.handle.clear_outbound();
        self.linger_until = None;
        self.set_status(ConnectionStatus::Disconnected, reason);
    }

    /// The socket reported that the remote endpoint refused or reset the connection
    pub fn on_forcibly_closed(&mut self) {
        warn!("connection to {:?} was forcibly closed", self.remote);
        self.close("Connection forcibly closed");
    }
}

#[cfg(test)]
mod tests;
