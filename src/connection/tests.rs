use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use crate::buffers::incoming::IncomingKind;
use crate::config::{NotificationKinds, PeerConfig};
use crate::connection::{Connection, ConnectionHandle, ConnectionStatus, Priority};
use crate::error::PeerError;
use crate::peer::PeerShared;
use crate::wire::message_header::MessageHeader;
use crate::wire::message_type::{DeliveryMethod, LibraryMessageType, MessageType};
use crate::wire::packet_writer::PacketReader;

const CLIENT_ADDR: &str = "127.0.0.1:5000";
const SERVER_ADDR: &str = "127.0.0.1:6000";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn config() -> PeerConfig {
    let mut result = PeerConfig::server("test", addr("127.0.0.1:0"));
    result.enabled_notifications = NotificationKinds::all();
    result
}

/// Two connections talking to each other through an in-memory 'network' on a virtual clock
struct Pair {
    client: Connection,
    server: Connection,
    now: Instant,
}

impl Pair {
    fn new(client_config: PeerConfig, server_config: PeerConfig, hail: Vec<u8>) -> Pair {
        let now = Instant::now();
        let max_payload = client_config.max_library_payload();
        let mut client = Connection::new_outgoing(ConnectionHandle::new(addr(SERVER_ADDR), max_payload), hail.clone(), PeerShared::new(client_config), now);

        // the network loop creates the server side when it receives the first Connect
        client.heartbeat(now);
        let connects = take_messages(&mut client);
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].0.library_type, Some(LibraryMessageType::Connect));

        let max_payload = server_config.max_library_payload();
        let server = Connection::new_incoming(ConnectionHandle::new(addr(CLIENT_ADDR), max_payload), hail, PeerShared::new(server_config), now);
        Pair { client, server, now }
    }

    fn connected() -> Pair {
        let mut result = Pair::new(config(), config(), vec![]);
        result.run_for(Duration::from_millis(10), Duration::from_millis(1));
        assert_eq!(result.client.status(), ConnectionStatus::Connected);
        assert_eq!(result.server.status(), ConnectionStatus::Connected);
        result
    }

    fn step(&mut self, dt: Duration, mut keep_to_client: impl FnMut(&MessageHeader) -> bool, mut keep_to_server: impl FnMut(&MessageHeader) -> bool) {
        self.now += dt;
        self.client.heartbeat(self.now);
        self.server.heartbeat(self.now);

        for (header, payload) in take_messages(&mut self.client) {
            if keep_to_server(&header) {
                self.server.on_message(&header, &payload, self.now);
            }
        }
        for (header, payload) in take_messages(&mut self.server) {
            if keep_to_client(&header) {
                self.client.on_message(&header, &payload, self.now);
            }
        }
    }

    fn run_for(&mut self, duration: Duration, dt: Duration) {
        let until = self.now + duration;
        while self.now < until {
            self.step(dt, |_| true, |_| true);
        }
    }

    fn send(&self, data: &[u8], method: DeliveryMethod, channel: u8) {
        let pool = self.client.shared.pool.clone();
        let mut msg = pool.create_outgoing(data.len());
        msg.write(data);
        self.client.handle().enqueue(msg.into_queued(pool), MessageType::user(method, channel).unwrap(), Priority::Normal);
    }
}

fn take_messages(connection: &mut Connection) -> Vec<(MessageHeader, Vec<u8>)> {
    let mut result = Vec::new();
    for datagram in connection.take_datagrams() {
        assert!(datagram.len() <= connection.shared.config.mtu);
        for msg in PacketReader::new(&datagram) {
            let (header, payload) = msg.unwrap();
            result.push((header, payload.to_vec()));
        }
        connection.shared.pool.recycle_storage(datagram);
    }
    result
}

fn released_data(connection: &Connection) -> Vec<Vec<u8>> {
    let mut result = Vec::new();
    while let Some(msg) = connection.shared.released.pop() {
        if let IncomingKind::Data { .. } = msg.kind() {
            result.push(msg.data().to_vec());
        }
    }
    result
}

fn released_status_changes(connection: &Connection) -> Vec<(ConnectionStatus, String)> {
    let mut result = Vec::new();
    while let Some(msg) = connection.shared.released.pop() {
        if let IncomingKind::StatusChanged { status, reason } = msg.kind() {
            result.push((*status, reason.clone()));
        }
    }
    result
}

/// data and status changes released to the application, in the order they were released
fn released_data_and_status(connection: &Connection) -> (Vec<Vec<u8>>, Vec<(ConnectionStatus, String)>) {
    let mut data = Vec::new();
    let mut status_changes = Vec::new();
    while let Some(msg) = connection.shared.released.pop() {
        match msg.kind() {
            IncomingKind::Data { .. } => data.push(msg.data().to_vec()),
            IncomingKind::StatusChanged { status, reason } => status_changes.push((*status, reason.clone())),
            _ => {}
        }
    }
    (data, status_changes)
}

fn is_too_large(result: anyhow::Result<()>) -> bool {
    matches!(result.unwrap_err().downcast_ref::<PeerError>(), Some(PeerError::MessageTooLarge { .. }))
}

#[test]
fn test_handshake_with_approval() {
    let mut server_config = config();
    server_config.connection_approval = true;
    let mut pair = Pair::new(config(), server_config, vec![42, 43]);

    let approval = pair.server.shared.released.pop().unwrap();
    assert_eq!(approval.kind(), &IncomingKind::ConnectionApproval);
    assert_eq!(approval.data(), &[42, 43]);

    // nothing happens while the application has not decided
    pair.run_for(Duration::from_millis(100), Duration::from_millis(10));
    assert_eq!(pair.client.status(), ConnectionStatus::Connecting);
    assert_eq!(pair.server.status(), ConnectionStatus::Connecting);

    approval.connection().unwrap().approve_with_hail(vec![7]).unwrap();
    pair.run_for(Duration::from_millis(10), Duration::from_millis(1));

    assert_eq!(pair.client.status(), ConnectionStatus::Connected);
    assert_eq!(pair.server.status(), ConnectionStatus::Connected);
    assert_eq!(pair.client.handle().status(), ConnectionStatus::Connected);
    assert_eq!(pair.client.handle().remote_hail(), vec![7]);
    assert_eq!(pair.server.handle().remote_hail(), vec![42, 43]);
    assert_eq!(released_status_changes(&pair.client), vec![
        (ConnectionStatus::Connecting, "".to_string()),
        (ConnectionStatus::Connected, "".to_string()),
    ]);
}

#[test]
fn test_approval_denied() {
    let mut server_config = config();
    server_config.connection_approval = true;
    let mut pair = Pair::new(config(), server_config, vec![]);

    pair.server.handle().deny("go away").unwrap();
    pair.run_for(Duration::from_millis(5), Duration::from_millis(1));

    assert_eq!(pair.server.status(), ConnectionStatus::Disconnected);
    assert_eq!(pair.client.status(), ConnectionStatus::Disconnected);
    assert_eq!(released_status_changes(&pair.client).last(), Some(&(ConnectionStatus::Disconnected, "go away".to_string())));
}

#[test]
fn test_no_answer_from_remote_host() {
    let config = config();
    let max_attempts = config.max_handshake_attempts as usize;
    let retry_interval = config.handshake_retry_interval;

    let mut now = Instant::now();
    let handle = ConnectionHandle::new(addr(SERVER_ADDR), config.max_library_payload());
    let mut client = Connection::new_outgoing(handle, vec![], PeerShared::new(config), now);

    let mut num_connects = 0;
    for _ in 0..=max_attempts {
        client.heartbeat(now);
        num_connects += take_messages(&mut client).len();
        now += retry_interval;
    }

    assert_eq!(num_connects, max_attempts);
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(released_status_changes(&client).last(), Some(&(ConnectionStatus::Disconnected, "No answer from remote host".to_string())));
}

#[test]
fn test_acceptor_handshake_timeout() {
    let mut pair = Pair::new(config(), config(), vec![]);
    let max_duration = pair.server.shared.config.handshake_retry_interval * pair.server.shared.config.max_handshake_attempts;

    // ConnectResponse never arrives at the client, so the server never sees ConnectionEstablished
    pair.step(Duration::from_millis(1), |_| false, |_| true);
    assert_eq!(pair.server.status(), ConnectionStatus::Connecting);

    pair.now += max_duration;
    pair.server.heartbeat(pair.now);
    assert_eq!(pair.server.status(), ConnectionStatus::Disconnected);
    assert_eq!(released_status_changes(&pair.server).last(), Some(&(ConnectionStatus::Disconnected, "Failed to complete handshake".to_string())));
}

#[test]
fn test_lost_connection_established() {
    let mut pair = Pair::new(config(), config(), vec![]);

    let mut dropped_established = false;
    let mut drop_established = |h: &MessageHeader| {
        if h.library_type == Some(LibraryMessageType::ConnectionEstablished) && !dropped_established {
            dropped_established = true;
            return false;
        }
        true
    };
    // ConnectResponse, then ConnectionEstablished on the next iteration
    pair.step(Duration::from_millis(1), |_| true, &mut drop_established);
    pair.step(Duration::from_millis(1), |_| true, &mut drop_established);
    assert!(dropped_established);
    assert_eq!(pair.client.status(), ConnectionStatus::Connected);

    // user data implicitly completes the handshake on the accepting side
    pair.send(b"first", DeliveryMethod::ReliableOrdered, 0);
    pair.run_for(Duration::from_millis(5), Duration::from_millis(1));
    assert_eq!(pair.server.status(), ConnectionStatus::Connected);
    assert_eq!(released_data(&pair.server), vec![b"first".to_vec()]);
}

#[test]
fn test_ordered_delivery_with_loss() {
    let mut pair = Pair::connected();
    for i in 0..5u8 {
        pair.send(&[i], DeliveryMethod::ReliableOrdered, 3);
    }

    let mut dropped = HashSet::new();
    let until = pair.now + Duration::from_secs(1);
    while pair.now < until {
        pair.step(Duration::from_millis(5), |_| true, |h| {
            match h.sequence_number {
                Some(seq) if h.library_type.is_none() && [1, 3].contains(&seq.to_raw()) => !dropped.insert(seq.to_raw()),
                _ => true,
            }
        });
    }

    assert_eq!(dropped.len(), 2);
    assert_eq!(released_data(&pair.server), (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
    assert_eq!(pair.client.send_channels.num_stored(), 0);
    assert_eq!(pair.server.receive_channels.num_withheld(), 0);

    let stats = pair.client.shared.statistics.snapshot();
    assert_eq!(stats.sent_messages, 5);
    assert_eq!(stats.resent_messages, 2);
}

#[test]
fn test_no_resend_after_ack() {
    let mut pair = Pair::connected();
    pair.send(b"x", DeliveryMethod::ReliableUnordered, 0);
    pair.run_for(Duration::from_secs(2), Duration::from_millis(5));

    assert_eq!(released_data(&pair.server), vec![b"x".to_vec()]);
    assert_eq!(pair.client.send_channels.num_stored(), 0);
    assert_eq!(pair.client.shared.statistics.snapshot().resent_messages, 0);
    assert_eq!(pair.client.shared.pool.num_recycled_outgoing(), 1);
}

#[test]
fn test_resends_exhausted() {
    let mut pair = Pair::connected();
    pair.send(b"x", DeliveryMethod::ReliableOrdered, 0);

    // acks never reach the client
    let until = pair.now + Duration::from_secs(8);
    while pair.now < until {
        pair.step(Duration::from_millis(5), |_| false, |_| true);
    }

    let stats = pair.client.shared.statistics.snapshot();
    assert_eq!(stats.dropped_messages, 1);
    assert_eq!(stats.resent_messages as u32, pair.client.shared.config.resend_policy.max_sends - 1);
    assert_eq!(pair.client.send_channels.num_stored(), 0);
    assert_eq!(pair.client.status(), ConnectionStatus::Connected);

    // duplicates were not released twice
    assert_eq!(released_data(&pair.server), vec![b"x".to_vec()]);
}

#[test]
fn test_fragmented_message() {
    let mut pair = Pair::connected();
    let data: Vec<u8> = (0..5000).map(|i| (i % 253) as u8).collect();
    pair.send(&data, DeliveryMethod::ReliableOrdered, 0);
    pair.run_for(Duration::from_millis(20), Duration::from_millis(1));

    assert_eq!(released_data(&pair.server), vec![data]);
    assert_eq!(pair.client.send_channels.num_stored(), 0);
    assert_eq!(pair.client.shared.statistics.snapshot().sent_messages, 1);
    assert_eq!(pair.client.shared.pool.num_recycled_outgoing(), 1);
}

#[test]
fn test_priority_order() {
    let mut pair = Pair::connected();
    let pool = pair.client.shared.pool.clone();
    let message_type = MessageType::user(DeliveryMethod::ReliableUnordered, 0).unwrap();
    for (data, priority) in [(b"low", Priority::Low), (b"nrm", Priority::Normal), (b"hig", Priority::High)] {
        let mut msg = pool.create_outgoing(3);
        msg.write(data);
        pair.client.handle().enqueue(msg.into_queued(pool.clone()), message_type, priority);
    }
    assert_eq!(pair.client.handle().num_queued(), 3);

    pair.run_for(Duration::from_millis(5), Duration::from_millis(1));
    assert_eq!(pair.client.handle().num_queued(), 0);
    assert_eq!(released_data(&pair.server), vec![b"hig".to_vec(), b"nrm".to_vec(), b"low".to_vec()]);
}

#[test]
fn test_send_window() {
    let mut client_config = config();
    client_config.window_size = 2;
    let mut pair = Pair::new(client_config, config(), vec![]);
    pair.run_for(Duration::from_millis(5), Duration::from_millis(1));

    for i in 0..5u8 {
        pair.send(&[i], DeliveryMethod::ReliableOrdered, 0);
    }

    // no acks: only the window's worth of messages goes out
    pair.step(Duration::from_millis(1), |_| false, |_| true);
    assert_eq!(pair.client.send_channels.num_stored(), 2);
    assert_eq!(pair.client.handle().num_queued(), 3);

    pair.run_for(Duration::from_millis(200), Duration::from_millis(1));
    assert_eq!(pair.client.handle().num_queued(), 0);
    assert_eq!(released_data(&pair.server), (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
}

#[test]
fn test_timeout() {
    let mut pair = Pair::connected();
    released_status_changes(&pair.client);
    let timeout = pair.client.shared.config.connection_timeout;

    // the server is gone: nothing reaches the client any more
    let until = pair.now + timeout + Duration::from_secs(1);
    while pair.now < until && pair.client.status() == ConnectionStatus::Connected {
        pair.now += Duration::from_millis(100);
        pair.client.heartbeat(pair.now);
        pair.client.take_datagrams();
    }

    assert_eq!(pair.client.status(), ConnectionStatus::Disconnected);
    assert_eq!(released_status_changes(&pair.client), vec![(ConnectionStatus::Disconnected, "Timed out".to_string())]);
}

#[test]
fn test_keepalive_and_ping_prevent_timeout() {
    let mut pair = Pair::connected();
    let timeout = pair.client.shared.config.connection_timeout;
    pair.run_for(timeout * 2, Duration::from_millis(50));

    assert_eq!(pair.client.status(), ConnectionStatus::Connected);
    assert_eq!(pair.server.status(), ConnectionStatus::Connected);
}

#[test]
fn test_remote_disconnect() {
    let mut pair = Pair::connected();
    released_status_changes(&pair.server);

    pair.client.handle().disconnect("bye").unwrap();
    pair.step(Duration::from_millis(1), |_| true, |_| true);

    assert_eq!(pair.client.status(), ConnectionStatus::Disconnected);
    assert_eq!(pair.server.status(), ConnectionStatus::Disconnected);
    assert_eq!(released_status_changes(&pair.server), vec![(ConnectionStatus::Disconnected, "bye".to_string())]);
}

#[test]
fn test_disconnect_sends_queued_messages_first() {
    let mut pair = Pair::connected();
    released_status_changes(&pair.server);

    pair.send(b"last words", DeliveryMethod::ReliableOrdered, 0);
    pair.send(b"unreliable", DeliveryMethod::Unreliable, 0);
    pair.client.handle().disconnect("bye").unwrap();

    let mut to_server = Vec::new();
    pair.step(Duration::from_millis(1), |_| true, |h| {
        to_server.push(h.library_type);
        true
    });

    assert_eq!(to_server.last(), Some(&Some(LibraryMessageType::Disconnect)));
    assert_eq!(pair.client.status(), ConnectionStatus::Disconnected);
    assert_eq!(pair.server.status(), ConnectionStatus::Disconnected);

    let (data, status_changes) = released_data_and_status(&pair.server);
    assert_eq!(data, vec![b"last words".to_vec(), b"unreliable".to_vec()]);
    assert_eq!(status_changes, vec![(ConnectionStatus::Disconnected, "bye".to_string())]);
}

#[test]
fn test_linger_resends_before_disconnect() {
    let mut client_config = config();
    client_config.linger = Duration::from_millis(100);
    let mut pair = Pair::new(client_config, config(), vec![]);
    pair.run_for(Duration::from_millis(5), Duration::from_millis(1));
    assert_eq!(pair.client.status(), ConnectionStatus::Connected);
    released_status_changes(&pair.server);

    pair.send(b"last words", DeliveryMethod::ReliableOrdered, 0);
    pair.client.handle().disconnect("bye").unwrap();

    // the first transmission is lost, and the remote peer does not learn about the disconnect yet
    pair.step(Duration::from_millis(1), |_| true, |h| h.library_type.is_some());
    assert_eq!(pair.client.status(), ConnectionStatus::Disconnecting);
    assert_eq!(pair.server.status(), ConnectionStatus::Connected);

    let mut to_server = Vec::new();
    let until = pair.now + Duration::from_millis(100);
    while pair.now < until {
        pair.step(Duration::from_millis(1), |_| true, |h| {
            to_server.push(h.library_type);
            true
        });
    }

    assert_eq!(pair.client.status(), ConnectionStatus::Disconnected);
    assert_eq!(pair.server.status(), ConnectionStatus::Disconnected);
    assert_eq!(to_server.iter().filter(|t| **t == Some(LibraryMessageType::Disconnect)).count(), 1);
    assert_eq!(to_server.last(), Some(&Some(LibraryMessageType::Disconnect)));
    assert_eq!(pair.client.shared.statistics.snapshot().resent_messages, 1);

    let (data, status_changes) = released_data_and_status(&pair.server);
    assert_eq!(data, vec![b"last words".to_vec()]);
    assert_eq!(status_changes, vec![(ConnectionStatus::Disconnected, "bye".to_string())]);
}

#[test]
fn test_linger_ends_after_linger_time() {
    let mut client_config = config();
    client_config.linger = Duration::from_millis(100);
    let mut pair = Pair::new(client_config, config(), vec![]);
    pair.run_for(Duration::from_millis(5), Duration::from_millis(1));

    pair.send(b"never acked", DeliveryMethod::ReliableOrdered, 0);
    pair.client.handle().disconnect("bye").unwrap();

    // acks never reach the client
    let start = pair.now;
    while pair.client.status() != ConnectionStatus::Disconnected && pair.now < start + Duration::from_secs(1) {
        pair.step(Duration::from_millis(10), |_| false, |_| true);
    }

    assert_eq!(pair.client.status(), ConnectionStatus::Disconnected);
    assert!(pair.now >= start + Duration::from_millis(100));
    assert!(pair.now < start + Duration::from_millis(120));
    assert_eq!(pair.server.status(), ConnectionStatus::Disconnected);
    assert_eq!(released_data(&pair.server), vec![b"never acked".to_vec()]);
}

#[test]
fn test_finish_disconnect_sends_queued_messages() {
    let mut pair = Pair::connected();
    released_status_changes(&pair.server);
    pair.send(b"last words", DeliveryMethod::ReliableOrdered, 0);

    // reasons are not checked for shutdown, so an oversized one is truncated
    let long_reason = "x".repeat(2000);
    pair.client.finish_disconnect(&long_reason, pair.now);
    assert_eq!(pair.client.status(), ConnectionStatus::Disconnected);

    let messages = take_messages(&mut pair.client);
    assert_eq!(messages.last().map(|(h, _)| h.library_type), Some(Some(LibraryMessageType::Disconnect)));
    for (header, payload) in messages {
        pair.server.on_message(&header, &payload, pair.now);
    }

    let (data, status_changes) = released_data_and_status(&pair.server);
    assert_eq!(data, vec![b"last words".to_vec()]);
    assert_eq!(status_changes.len(), 1);
    let (status, reason) = &status_changes[0];
    assert_eq!(*status, ConnectionStatus::Disconnected);
    assert!(!reason.is_empty());
    assert!(reason.len() < long_reason.len());
    assert!(long_reason.starts_with(reason.as_str()));
}

#[test]
fn test_oversized_hail_and_reason_are_rejected() {
    let mut server_config = config();
    server_config.connection_approval = true;
    let mut pair = Pair::new(config(), server_config, vec![]);
    let long_reason = "x".repeat(2000);

    assert!(is_too_large(pair.server.handle().approve_with_hail(vec![0; 2000])));
    assert!(is_too_large(pair.server.handle().deny(&long_reason)));
    assert!(is_too_large(pair.client.handle().disconnect(&long_reason)));

    // rejected requests have no effect
    pair.run_for(Duration::from_millis(10), Duration::from_millis(1));
    assert_eq!(pair.client.status(), ConnectionStatus::Connecting);
    assert_eq!(pair.server.status(), ConnectionStatus::Connecting);

    pair.server.handle().approve_with_hail(vec![0; 1000]).unwrap();
    pair.run_for(Duration::from_millis(5), Duration::from_millis(1));
    assert_eq!(pair.client.status(), ConnectionStatus::Connected);
    assert_eq!(pair.client.handle().remote_hail(), vec![0; 1000]);
}

#[test]
fn test_close_releases_queued_messages() {
    let mut pair = Pair::connected();
    pair.send(b"stored", DeliveryMethod::ReliableOrdered, 0);
    pair.step(Duration::from_millis(1), |_| false, |_| false);
    pair.send(b"queued", DeliveryMethod::ReliableOrdered, 0);
    assert_eq!(pair.client.send_channels.num_stored(), 1);
    assert_eq!(pair.client.handle().num_queued(), 1);

    pair.client.close("closed");
    assert_eq!(pair.client.send_channels.num_stored(), 0);
    assert_eq!(pair.client.handle().num_queued(), 0);
    assert_eq!(pair.client.shared.pool.num_recycled_outgoing(), 2);
}

#[test]
fn test_handle_used_from_other_thread() {
    let pair = Pair::connected();
    let handle = pair.client.handle().clone();
    let (remote, status) = std::thread::spawn(move || (handle.remote_endpoint(), handle.status())).join().unwrap();
    assert_eq!(remote, addr(SERVER_ADDR));
    assert_eq!(status, ConnectionStatus::Connected);
}

#[rstest::rstest]
#[case::disabled(0, 10_000.0, 0, false)]
#[case::below_peak(1000, 500.0, 0, false)]
#[case::above_peak(1000, 5000.0, 0, true)]
#[case::paid_off(1000, 5000.0, 4500, false)]
#[case::partly_paid_off(1000, 5000.0, 3000, true)]
fn test_throttle(#[case] bytes_per_second: u32, #[case] debt: f64, #[case] elapsed_millis: u64, #[case] expected: bool) {
    let start = Instant::now();
    let mut throttle = super::Throttle { debt, last_update: start };
    throttle.update(start + Duration::from_millis(elapsed_millis), bytes_per_second);
    assert_eq!(throttle.is_throttled(bytes_per_second, 1000), expected);
}
