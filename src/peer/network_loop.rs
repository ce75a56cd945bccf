use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::buffers::outgoing::QueueRef;
use crate::connection::{Connection, ConnectionHandle, ConnectionStatus};
use crate::peer::socket::{DatagramSocket, Simulation};
use crate::peer::{PeerShared, PeerStatus};
use crate::wire::library_messages::{LibraryMessageConnect, LibraryMessageDisconnect, LibraryMessageDiscovery};
use crate::wire::message_header::MessageHeader;
use crate::wire::message_type::{LibraryMessageType, MessageType};
use crate::wire::packet_writer::PacketReader;

/// Requests from the application to the network thread
pub(crate) enum PeerCommand {
    Connect { handle: ConnectionHandle, hail: Vec<u8> },
    UnconnectedSend { to: SocketAddr, payload: QueueRef },
    Discover { to: SocketAddr },
    Shutdown { reason: String },
}

/// The network thread's state: the socket and all connections. Nothing in here is shared with
///  application threads except through [PeerShared].
pub(crate) struct NetworkLoop {
    socket: Box<dyn DatagramSocket>,
    shared: Arc<PeerShared>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    connections: FxHashMap<SocketAddr, Connection>,
    unconnected: Vec<(SocketAddr, BytesMut)>,
    simulation: Simulation,
    receive_buf: Vec<u8>,
}

impl NetworkLoop {
    pub fn new(socket: Box<dyn DatagramSocket>, shared: Arc<PeerShared>, commands: mpsc::UnboundedReceiver<PeerCommand>) -> NetworkLoop {
        let simulation = Simulation::new(shared.config.simulation.clone());
        NetworkLoop {
            socket,
            commands,
            connections: Default::default(),
            unconnected: Vec::new(),
            simulation,
            // NB: a datagram can be bigger than our own MTU if the remote peer is configured differently
            receive_buf: vec![0u8; 65536],
            shared,
        }
    }

    /// Runs until the application shuts the peer down or drops it
    pub async fn run(mut self) {
        info!("network loop started");
        self.shared.on_loop_started();

        loop {
            let now = Instant::now();
            if let Some(reason) = self.process_commands(now) {
                self.shutdown(&reason, now);
                break;
            }
            self.step(now);

            tokio::time::sleep(self.shared.config.loop_sleep).await;
        }

        self.shared.set_status(PeerStatus::ShutDown);
        info!("network loop terminated");
    }

    /// Processes pending application commands, returning the reason if shutdown was requested
    fn process_commands(&mut self, now: Instant) -> Option<String> {
        loop {
            match self.commands.try_recv() {
                Ok(PeerCommand::Connect { handle, hail }) => self.connect(handle, hail, now),
                Ok(PeerCommand::UnconnectedSend { to, payload }) => {
                    let header = MessageHeader::user(MessageType::Unconnected, None, payload.len(), None);
                    self.queue_unconnected(to, &header, payload.data());
                    if payload.mark_sent() {
                        self.shared.statistics.add_sent_messages(1);
                    }
                }
                Ok(PeerCommand::Discover { to }) => {
                    debug!("sending discovery request to {:?}", to);
                    let msg = LibraryMessageDiscovery { app_identifier: self.shared.config.app_identifier.clone() };
                    self.queue_unconnected_library(to, LibraryMessageType::Discovery, |buf| msg.ser(buf));
                }
                Ok(PeerCommand::Shutdown { reason }) => return Some(reason),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    debug!("peer was dropped");
                    return Some("Peer dropped".to_string());
                }
            }
        }
    }

    fn connect(&mut self, handle: ConnectionHandle, hail: Vec<u8>, now: Instant) {
        let remote = handle.remote_endpoint();
        if let Some(mut old) = self.connections.remove(&remote) {
            debug!("reconnecting to {:?}: closing previous connection", remote);
            old.close("Reconnecting");
        }

        let connection = Connection::new_outgoing(handle, hail, self.shared.clone(), now);
        self.connections.insert(remote, connection);
        self.sync_connection_list();
    }

    /// One iteration of the network loop. The order matters: datagrams written while receiving
    ///  are sent on the next iteration, before disconnected connections are removed.
    pub fn step(&mut self, now: Instant) {
        for connection in self.connections.values_mut() {
            connection.heartbeat(now);
        }
        self.send_connection_datagrams(now);
        self.remove_disconnected();

        self.send_unconnected(now);
        self.send_delayed(now);

        self.receive(now);
    }

    fn shutdown(&mut self, reason: &str, now: Instant) {
        info!("shutting down: {}", reason);
        self.shared.set_status(PeerStatus::ShuttingDown);

        // one final round: queued messages go out, followed by Disconnect
        for connection in self.connections.values_mut() {
            connection.finish_disconnect(reason, now);
        }
        self.send_connection_datagrams(now);
        self.send_unconnected(now);

        // delayed datagrams are sent right away, there is no later opportunity
        for (to, datagram) in self.simulation.take_all() {
            self.send_now(to, datagram);
        }

        self.connections.clear();
        self.sync_connection_list();
    }

    fn send_connection_datagrams(&mut self, now: Instant) {
        let mut outgoing = Vec::new();
        for (addr, connection) in self.connections.iter_mut() {
            for datagram in connection.take_datagrams() {
                outgoing.push((*addr, datagram));
            }
        }
        for (to, datagram) in outgoing {
            self.send_datagram(to, datagram, now);
        }
    }

    fn send_unconnected(&mut self, now: Instant) {
        for (to, datagram) in std::mem::take(&mut self.unconnected) {
            self.send_datagram(to, datagram, now);
        }
    }

    fn send_delayed(&mut self, now: Instant) {
        for (to, datagram) in self.simulation.take_due(now) {
            self.send_now(to, datagram);
        }
    }

    fn send_datagram(&mut self, to: SocketAddr, datagram: BytesMut, now: Instant) {
        if !self.simulation.is_active() {
            self.send_now(to, datagram);
            return;
        }

        for due in self.simulation.plan(now) {
            self.simulation.delay(due, to, datagram.clone());
        }
        self.shared.pool.recycle_storage(datagram);
    }

    fn send_now(&mut self, to: SocketAddr, datagram: BytesMut) {
        trace!("sending datagram of {} bytes to {:?}", datagram.len(), to);

        match self.socket.try_send_to(&datagram, to) {
            Ok(_) => self.shared.statistics.on_packet_sent(datagram.len()),
            Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => {
                match self.connections.get_mut(&to) {
                    Some(connection) => connection.on_forcibly_closed(),
                    None => debug!("{:?} refused an unconnected datagram", to),
                }
            }
            Err(e) => {
                if cfg!(debug_assertions) && self.shared.config.panic_on_send_error {
                    panic!("error sending datagram to {:?}: {}", to, e);
                }
                self.shared.released.warning(format!("error sending datagram to {:?}: {}", to, e));
            }
        }
        self.shared.pool.recycle_storage(datagram);
    }

    fn remove_disconnected(&mut self) {
        let num_before = self.connections.len();
        self.connections.retain(|_, c| c.status() != ConnectionStatus::Disconnected);
        if self.connections.len() != num_before {
            debug!("removed {} disconnected connection(s)", num_before - self.connections.len());
            self.sync_connection_list();
        }
    }

    fn sync_connection_list(&self) {
        *self.shared.connections.lock().unwrap() = self.connections.values()
            .map(|c| c.handle().clone())
            .collect();
    }

    fn num_active_connections(&self) -> usize {
        self.connections.values()
            .filter(|c| c.status() != ConnectionStatus::Disconnected)
            .count()
    }

    fn receive(&mut self, now: Instant) {
        let mut buf = std::mem::take(&mut self.receive_buf);
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    trace!("received datagram of {} bytes from {:?}", len, from);
                    self.shared.statistics.on_packet_received(len);
                    self.on_datagram(from, &buf[..len], now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // some platforms report an ICMP 'port unreachable' for an earlier send here
                    debug!("socket reported connection reset on receive");
                }
                Err(e) => {
                    warn!("error receiving from socket: {}", e);
                    break;
                }
            }
        }
        self.receive_buf = buf;
    }

    fn on_datagram(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) {
        for msg in PacketReader::new(datagram) {
            match msg {
                Ok((header, payload)) => self.on_message(from, &header, payload, now),
                Err(e) => self.shared.released.warning(format!("malformed datagram from {:?}: {}", from, e)),
            }
        }
    }

    fn on_message(&mut self, from: SocketAddr, header: &MessageHeader, payload: &[u8], now: Instant) {
        if let Some(connection) = self.connections.get_mut(&from) {
            connection.on_message(header, payload, now);
            return;
        }

        match header.message_type {
            MessageType::Library => {
                if let Err(e) = self.on_unconnected_library_message(from, header, payload, now) {
                    self.shared.released.warning(format!("malformed library message {:?} from {:?}: {}", header.library_type, from, e));
                }
            }
            MessageType::Unconnected => self.shared.released.unconnected_data(from, payload),
            MessageType::User { .. } => {
                self.shared.released.debug(format!("ignoring user message from unconnected endpoint {:?}", from));
            }
        }
    }

    fn on_unconnected_library_message(&mut self, from: SocketAddr, header: &MessageHeader, mut payload: &[u8], now: Instant) -> anyhow::Result<()> {
        let Some(library_type) = header.library_type else {
            return Ok(());
        };

        match library_type {
            LibraryMessageType::Connect => {
                let msg = LibraryMessageConnect::deser(&mut payload)?;
                self.on_connect(from, msg, now);
            }
            LibraryMessageType::Discovery => {
                let msg = LibraryMessageDiscovery::deser(&mut payload)?;
                let config = self.shared.config.clone();
                if !config.answer_discovery {
                    trace!("not answering discovery request from {:?}", from);
                }
                else if msg.app_identifier != config.app_identifier {
                    debug!("discovery request from {:?} for different application {:?}", from, msg.app_identifier);
                }
                else {
                    debug!("answering discovery request from {:?}", from);
                    self.queue_unconnected_library(from, LibraryMessageType::DiscoveryResponse, |buf| buf.put_slice(&config.discovery_response_data));
                }
            }
            LibraryMessageType::DiscoveryResponse => {
                self.shared.released.discovery_response(from, payload);
            }
            _ => {
                debug!("ignoring {:?} from unconnected endpoint {:?}", library_type, from);
            }
        }
        Ok(())
    }

    fn on_connect(&mut self, from: SocketAddr, msg: LibraryMessageConnect, now: Instant) {
        let config = self.shared.config.clone();

        let rejection = if msg.app_identifier != config.app_identifier {
            Some("Wrong application identifier")
        }
        else if !config.accept_incoming_connections {
            Some("Not accepting incoming connections")
        }
        else if self.num_active_connections() >= config.max_connections {
            Some("Server is full")
        }
        else {
            None
        };

        if let Some(reason) = rejection {
            self.shared.released.debug(format!("rejecting connection from {:?}: {}", from, reason));
            let msg = LibraryMessageDisconnect { reason: reason.to_string() };
            self.queue_unconnected_library(from, LibraryMessageType::Disconnect, |buf| msg.ser(buf));
            return;
        }

        let connection = Connection::new_incoming(ConnectionHandle::new(from, config.max_library_payload()), msg.hail, self.shared.clone(), now);
        self.connections.insert(from, connection);
        self.sync_connection_list();
    }

    fn queue_unconnected_library(&mut self, to: SocketAddr, library_type: LibraryMessageType, ser_payload: impl FnOnce(&mut BytesMut)) {
        let mut payload = BytesMut::new();
        ser_payload(&mut payload);
        let header = MessageHeader::library(library_type, payload.len());
        self.queue_unconnected(to, &header, &payload);
    }

    /// Unconnected messages are sent one per datagram
    fn queue_unconnected(&mut self, to: SocketAddr, header: &MessageHeader, payload: &[u8]) {
        let mut datagram = self.shared.pool.get_storage(header.serialized_len() + payload.len());
        header.ser(&mut datagram);
        datagram.put_slice(payload);
        self.unconnected.push((to, datagram));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use rstest::rstest;
    use super::*;
    use crate::buffers::incoming::IncomingKind;
    use crate::config::PeerConfig;
    use crate::peer::socket::MockDatagramSocket;
    use crate::wire::library_messages::LibraryMessageConnectResponse;

    type Datagrams = Arc<Mutex<VecDeque<(SocketAddr, Vec<u8>)>>>;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Harness {
        network_loop: NetworkLoop,
        shared: Arc<PeerShared>,
        commands: mpsc::UnboundedSender<PeerCommand>,
        incoming: Datagrams,
        sent: Datagrams,
    }

    impl Harness {
        fn new(config: PeerConfig) -> Harness {
            Self::with_send_result(config, |buf| Ok(buf.len()))
        }

        fn with_send_result(config: PeerConfig, send_result: impl Fn(&[u8]) -> io::Result<usize> + Send + 'static) -> Harness {
            let incoming: Datagrams = Default::default();
            let sent: Datagrams = Default::default();

            let mut socket = MockDatagramSocket::new();
            let incoming2 = incoming.clone();
            socket.expect_try_recv_from()
                .returning(move |buf| match incoming2.lock().unwrap().pop_front() {
                    Some((from, data)) => {
                        buf[..data.len()].copy_from_slice(&data);
                        Ok((data.len(), from))
                    }
                    None => Err(io::ErrorKind::WouldBlock.into()),
                });
            let sent2 = sent.clone();
            socket.expect_try_send_to()
                .returning(move |buf, to| {
                    sent2.lock().unwrap().push_back((to, buf.to_vec()));
                    send_result(buf)
                });

            let shared = PeerShared::new(config);
            let (commands, receiver) = mpsc::unbounded_channel();
            Harness {
                network_loop: NetworkLoop::new(Box::new(socket), shared.clone(), receiver),
                shared,
                commands,
                incoming,
                sent,
            }
        }

        fn receive_library(&self, from: SocketAddr, library_type: LibraryMessageType, ser_payload: impl FnOnce(&mut BytesMut)) {
            let mut payload = BytesMut::new();
            ser_payload(&mut payload);
            let mut datagram = BytesMut::new();
            MessageHeader::library(library_type, payload.len()).ser(&mut datagram);
            datagram.put_slice(&payload);
            self.incoming.lock().unwrap().push_back((from, datagram.to_vec()));
        }

        fn receive_connect(&self, from: SocketAddr, app_identifier: &str, hail: &[u8]) {
            let msg = LibraryMessageConnect { app_identifier: app_identifier.to_string(), hail: hail.to_vec() };
            self.receive_library(from, LibraryMessageType::Connect, |buf| msg.ser(buf));
        }

        /// all library messages sent so far, with their payload
        fn take_sent_library(&self) -> Vec<(SocketAddr, LibraryMessageType, Vec<u8>)> {
            let mut result = Vec::new();
            for (to, datagram) in self.sent.lock().unwrap().drain(..) {
                for msg in PacketReader::new(&datagram) {
                    let (header, payload) = msg.unwrap();
                    if let Some(library_type) = header.library_type {
                        result.push((to, library_type, payload.to_vec()));
                    }
                }
            }
            result
        }

        fn released(&self) -> Vec<IncomingKind> {
            let mut result = Vec::new();
            while let Some(msg) = self.shared.released.pop() {
                result.push(msg.kind().clone());
            }
            result
        }

        /// runs two iterations so that responses written while receiving are sent
        fn steps(&mut self, now: Instant) {
            self.network_loop.process_commands(now);
            self.network_loop.step(now);
            self.network_loop.step(now);
        }
    }

    fn server_config() -> PeerConfig {
        PeerConfig::server("test-app", addr(0))
    }

    #[rstest]
    #[case::wrong_app_identifier(server_config(), "other-app", "Wrong application identifier")]
    #[case::not_accepting(PeerConfig::new("test-app", addr(0)), "test-app", "Not accepting incoming connections")]
    fn test_connect_rejected(#[case] config: PeerConfig, #[case] app_identifier: &str, #[case] expected_reason: &str) {
        let mut harness = Harness::new(config);
        harness.receive_connect(addr(5000), app_identifier, b"");
        harness.steps(Instant::now());

        let sent = harness.take_sent_library();
        assert_eq!(sent.len(), 1);
        let (to, library_type, payload) = &sent[0];
        assert_eq!(*to, addr(5000));
        assert_eq!(*library_type, LibraryMessageType::Disconnect);
        assert_eq!(LibraryMessageDisconnect::deser(&mut payload.as_slice()).unwrap().reason, expected_reason);
        assert!(harness.shared.connections.lock().unwrap().is_empty());
    }

    #[test]
    fn test_server_full() {
        let mut config = server_config();
        config.max_connections = 1;
        let mut harness = Harness::new(config);

        harness.receive_connect(addr(5000), "test-app", b"");
        harness.receive_connect(addr(5001), "test-app", b"");
        harness.steps(Instant::now());

        let sent = harness.take_sent_library();
        assert!(sent.iter().any(|(to, t, _)| *to == addr(5000) && *t == LibraryMessageType::ConnectResponse));
        let rejection = sent.iter().find(|(to, _, _)| *to == addr(5001)).unwrap();
        assert_eq!(rejection.1, LibraryMessageType::Disconnect);
        assert_eq!(LibraryMessageDisconnect::deser(&mut rejection.2.as_slice()).unwrap().reason, "Server is full");
        assert_eq!(harness.shared.connections.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_connect_accepted() {
        let mut harness = Harness::new(server_config());
        harness.receive_connect(addr(5000), "test-app", &[1, 2, 3]);
        harness.steps(Instant::now());

        let sent = harness.take_sent_library();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, LibraryMessageType::ConnectResponse);
        assert_eq!(LibraryMessageConnectResponse::deser(&mut sent[0].2.as_slice()).unwrap().hail, Vec::<u8>::new());

        let connections = harness.shared.connections.lock().unwrap().clone();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].remote_endpoint(), addr(5000));
        assert_eq!(connections[0].remote_hail(), vec![1, 2, 3]);
        assert_eq!(connections[0].status(), ConnectionStatus::Connecting);
        assert_eq!(harness.released(), vec![IncomingKind::StatusChanged { status: ConnectionStatus::Connecting, reason: "".to_string() }]);
    }

    #[rstest]
    #[case::answered(true, "test-app", true)]
    #[case::not_configured(false, "test-app", false)]
    #[case::other_app(true, "other-app", false)]
    fn test_discovery(#[case] answer_discovery: bool, #[case] app_identifier: &str, #[case] expect_answer: bool) {
        let mut config = server_config();
        config.answer_discovery = answer_discovery;
        config.discovery_response_data = b"game server".to_vec();
        let mut harness = Harness::new(config);

        let msg = LibraryMessageDiscovery { app_identifier: app_identifier.to_string() };
        harness.receive_library(addr(5000), LibraryMessageType::Discovery, |buf| msg.ser(buf));
        harness.steps(Instant::now());

        let sent = harness.take_sent_library();
        if expect_answer {
            assert_eq!(sent, vec![(addr(5000), LibraryMessageType::DiscoveryResponse, b"game server".to_vec())]);
        }
        else {
            assert!(sent.is_empty());
        }
    }

    #[test]
    fn test_discovery_response_released() {
        let mut harness = Harness::new(server_config());
        harness.receive_library(addr(5000), LibraryMessageType::DiscoveryResponse, |buf| buf.put_slice(b"xyz"));
        harness.steps(Instant::now());

        let msg = harness.shared.released.pop().unwrap();
        assert_eq!(msg.kind(), &IncomingKind::DiscoveryResponse);
        assert_eq!(msg.sender_endpoint(), Some(addr(5000)));
        assert_eq!(msg.data(), b"xyz");
    }

    #[test]
    fn test_unconnected_send_and_receive() {
        let mut harness = Harness::new(server_config());
        let pool = harness.shared.pool.clone();
        let mut msg = pool.create_outgoing(5);
        msg.write(b"hello");
        harness.commands.send(PeerCommand::UnconnectedSend { to: addr(6000), payload: msg.into_queued(pool.clone()) }).unwrap();

        let mut datagram = BytesMut::new();
        MessageHeader::user(MessageType::Unconnected, None, 3, None).ser(&mut datagram);
        datagram.put_slice(b"abc");
        harness.incoming.lock().unwrap().push_back((addr(6001), datagram.to_vec()));

        harness.steps(Instant::now());

        let sent: Vec<(SocketAddr, Vec<u8>)> = harness.sent.lock().unwrap().drain(..).collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(6000));
        let (header, payload) = PacketReader::new(&sent[0].1).next().unwrap().unwrap();
        assert_eq!(header.message_type, MessageType::Unconnected);
        assert_eq!(payload, b"hello");
        assert_eq!(pool.num_recycled_outgoing(), 1);

        let received = harness.shared.released.pop().unwrap();
        assert_eq!(received.kind(), &IncomingKind::UnconnectedData);
        assert_eq!(received.data(), b"abc");

        let stats = harness.shared.statistics.snapshot();
        assert_eq!(stats.sent_packets, 1);
        assert_eq!(stats.received_packets, 1);
        assert_eq!(stats.sent_messages, 1);
    }

    #[test]
    fn test_malformed_datagram() {
        let mut harness = Harness::new(server_config());
        harness.incoming.lock().unwrap().push_back((addr(5000), vec![0xff, 0xff, 0xff]));
        harness.steps(Instant::now());

        assert!(matches!(harness.released().as_slice(), [IncomingKind::WarningMessage(_)]));
    }

    #[test]
    fn test_forcibly_closed() {
        let config = PeerConfig::new("test-app", addr(0));
        let mut harness = Harness::with_send_result(config, |_| Err(io::ErrorKind::ConnectionRefused.into()));

        let handle = ConnectionHandle::new(addr(7000), harness.shared.config.max_library_payload());
        harness.commands.send(PeerCommand::Connect { handle: handle.clone(), hail: vec![] }).unwrap();
        harness.steps(Instant::now());

        assert_eq!(handle.status(), ConnectionStatus::Disconnected);
        assert!(harness.shared.connections.lock().unwrap().is_empty());
        assert_eq!(harness.released().last(), Some(&IncomingKind::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason: "Connection forcibly closed".to_string(),
        }));
    }

    #[test]
    fn test_reconnect_closes_previous_connection() {
        let mut harness = Harness::new(PeerConfig::new("test-app", addr(0)));

        let first = ConnectionHandle::new(addr(7000), harness.shared.config.max_library_payload());
        harness.commands.send(PeerCommand::Connect { handle: first.clone(), hail: vec![] }).unwrap();
        harness.steps(Instant::now());
        assert_eq!(first.status(), ConnectionStatus::Connecting);

        let second = ConnectionHandle::new(addr(7000), harness.shared.config.max_library_payload());
        harness.commands.send(PeerCommand::Connect { handle: second.clone(), hail: vec![] }).unwrap();
        harness.steps(Instant::now());

        assert_eq!(first.status(), ConnectionStatus::Disconnected);
        assert_eq!(second.status(), ConnectionStatus::Connecting);
        assert_eq!(harness.shared.connections.lock().unwrap().clone(), vec![second]);
    }

    #[test]
    fn test_shutdown_disconnects_all() {
        let mut harness = Harness::new(server_config());
        harness.receive_connect(addr(5000), "test-app", b"");
        harness.receive_connect(addr(5001), "test-app", b"");
        harness.steps(Instant::now());
        harness.take_sent_library();

        harness.commands.send(PeerCommand::Shutdown { reason: "bye".to_string() }).unwrap();
        let reason = harness.network_loop.process_commands(Instant::now()).unwrap();
        harness.network_loop.shutdown(&reason, Instant::now());

        let mut sent = harness.take_sent_library();
        sent.sort_by_key(|(to, _, _)| *to);
        assert_eq!(sent.len(), 2);
        for ((to, library_type, payload), expected_to) in sent.iter().zip([addr(5000), addr(5001)]) {
            assert_eq!(*to, expected_to);
            assert_eq!(*library_type, LibraryMessageType::Disconnect);
            assert_eq!(LibraryMessageDisconnect::deser(&mut payload.as_slice()).unwrap().reason, "bye");
        }
        assert!(harness.shared.connections.lock().unwrap().is_empty());
        assert_eq!(harness.shared.status(), PeerStatus::ShuttingDown);
    }

    #[test]
    fn test_dropped_peer_shuts_down() {
        let mut harness = Harness::new(server_config());
        drop(harness.commands);
        assert_eq!(harness.network_loop.process_commands(Instant::now()), Some("Peer dropped".to_string()));
    }
}
