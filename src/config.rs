use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use bitflags::bitflags;
use crate::sequence::NUM_SERIALS;
use crate::wire::library_messages::{LibraryMessageAcknowledge, LibraryMessageConnect};
use crate::wire::message_header::MessageHeader;

bitflags! {
    /// Selects which library notifications are released to the application. Application data
    ///  and connection approval requests are always released.
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct NotificationKinds: u8 {
        const STATUS_CHANGED     = 0b0000_0001;
        const DEBUG              = 0b0000_0010;
        const WARNING            = 0b0000_0100;
        const ERROR              = 0b0000_1000;
        const UNCONNECTED_DATA   = 0b0001_0000;
        const DISCOVERY_RESPONSE = 0b0010_0000;
    }
}

impl Default for NotificationKinds {
    fn default() -> Self {
        NotificationKinds::all().difference(NotificationKinds::DEBUG)
    }
}

/// Resend timing for reliable messages, indexed by the number of times a message was sent
///  so far: after the n-th send, the next resend is scheduled at
///  `now + base_delays[n] + avg_rtt * rtt_multipliers[n]`. If a message was sent more often
///  than there are entries, the last entry applies.
#[derive(Debug, Clone)]
pub struct ResendPolicy {
    pub base_delays: Vec<Duration>,
    pub rtt_multipliers: Vec<f64>,
    /// a message that was sent this many times without being acknowledged is dropped
    pub max_sends: u32,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        ResendPolicy {
            base_delays: [25, 50, 100, 200, 400, 800].into_iter()
                .map(Duration::from_millis)
                .collect(),
            rtt_multipliers: vec![1.5, 2.0, 2.5, 3.0, 4.0, 5.0],
            max_sends: 12,
        }
    }
}

impl ResendPolicy {
    pub fn resend_delay(&self, num_sends: u32, avg_rtt: Duration) -> Duration {
        let idx = (num_sends as usize).saturating_sub(1);
        let base = self.base_delays[idx.min(self.base_delays.len() - 1)];
        let multiplier = self.rtt_multipliers[idx.min(self.rtt_multipliers.len() - 1)];
        base + avg_rtt.mul_f64(multiplier)
    }
}

/// Artificial network impairment applied to outgoing datagrams, for testing applications
///  under adverse network conditions. All probabilities are between 0.0 and 1.0.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    pub loss: f64,
    pub duplicates: f64,
    pub min_latency: Duration,
    pub random_latency: Duration,
}

impl SimulationConfig {
    pub fn is_active(&self) -> bool {
        self.loss > 0.0 || self.duplicates > 0.0 || !self.min_latency.is_zero() || !self.random_latency.is_zero()
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peers only connect if their application identifiers are equal
    pub app_identifier: String,
    pub bind_addr: SocketAddr,

    pub accept_incoming_connections: bool,
    pub max_connections: usize,
    /// If set, the application must approve or deny each incoming connection, see
    ///  [crate::buffers::incoming::IncomingKind::ConnectionApproval]
    pub connection_approval: bool,

    /// This is the maximum UDP payload size. It must be supported by all network hops between
    ///  peers since the protocol does not rely on IP fragmentation: bigger messages are split
    ///  into fragments. With full Ethernet frames, this is `1500 - 20 - 8 = 1472` for IPV4.
    pub mtu: usize,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    /// number of buffers and wrappers that are kept for reuse, per kind
    pub max_pool_size: usize,
    pub max_message_size: usize,

    pub ping_frequency: Duration,
    /// A KeepAlive message is sent after this time without any other message
    pub keep_alive_delay: Duration,
    pub connection_timeout: Duration,
    pub handshake_retry_interval: Duration,
    pub max_handshake_attempts: u32,
    /// maximum time a disconnecting connection keeps sending, resending and acknowledging before
    ///  it sends Disconnect. It ends early once everything was acknowledged.
    pub linger: Duration,
    /// >0 and <= 1
    pub rtt_new_sample_weight: f64,

    pub resend_policy: ResendPolicy,
    /// maximum number of unacknowledged reliable messages per channel
    pub window_size: u16,
    pub ack_flush_threshold: usize,
    pub max_ack_delay: Duration,

    /// 0 disables throttling
    pub throttle_bytes_per_second: u32,
    pub throttle_peak_bytes: u32,

    pub fragment_group_timeout: Duration,

    pub answer_discovery: bool,
    pub discovery_response_data: Vec<u8>,

    pub enabled_notifications: NotificationKinds,
    pub simulation: SimulationConfig,
    /// only effective in debug builds
    pub panic_on_send_error: bool,

    pub loop_sleep: Duration,
}

impl PeerConfig {
    pub fn new(app_identifier: &str, bind_addr: SocketAddr) -> PeerConfig {
        PeerConfig {
            app_identifier: app_identifier.to_string(),
            bind_addr,
            accept_incoming_connections: false,
            max_connections: 32,
            connection_approval: false,
            mtu: 1408,
            send_buffer_size: 131071,
            receive_buffer_size: 131071,
            max_pool_size: 256,
            max_message_size: 1024*1024,
            ping_frequency: Duration::from_secs(4),
            keep_alive_delay: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(25),
            handshake_retry_interval: Duration::from_secs(3),
            max_handshake_attempts: 5,
            linger: Duration::ZERO,
            rtt_new_sample_weight: 0.25,
            resend_policy: Default::default(),
            window_size: 64,
            ack_flush_threshold: 10,
            max_ack_delay: Duration::from_millis(10),
            throttle_bytes_per_second: 0,
            throttle_peak_bytes: 8192,
            fragment_group_timeout: Duration::from_secs(30),
            answer_discovery: false,
            discovery_response_data: Vec::new(),
            enabled_notifications: Default::default(),
            simulation: Default::default(),
            panic_on_send_error: false,
            loop_sleep: Duration::from_millis(1),
        }
    }

    /// Convenience for a peer accepting incoming connections
    pub fn server(app_identifier: &str, bind_addr: SocketAddr) -> PeerConfig {
        let mut result = PeerConfig::new(app_identifier, bind_addr);
        result.accept_incoming_connections = true;
        result
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 100 {
            bail!("MTU is too small");
        }
        if self.mtu > MessageHeader::MAX_PAYLOAD_LEN {
            bail!("MTU must not exceed {}", MessageHeader::MAX_PAYLOAD_LEN);
        }
        if self.window_size == 0 || self.window_size >= NUM_SERIALS / 2 {
            bail!("window size must be between 1 and {}", NUM_SERIALS / 2 - 1);
        }
        if self.resend_policy.base_delays.is_empty() || self.resend_policy.rtt_multipliers.is_empty() {
            bail!("resend policy must have at least one base delay and one RTT multiplier");
        }
        if self.resend_policy.rtt_multipliers.iter().any(|m| !(m.is_finite() && *m >= 0.0)) {
            bail!("RTT multipliers must be finite and not negative");
        }
        if self.resend_policy.max_sends == 0 {
            bail!("max sends must be at least 1");
        }
        if self.max_handshake_attempts == 0 {
            bail!("max handshake attempts must be at least 1");
        }
        if !(self.rtt_new_sample_weight > 0.0 && self.rtt_new_sample_weight <= 1.0) {
            bail!("RTT sample weight must be >0 and <=1");
        }
        if self.ack_flush_threshold == 0 {
            bail!("ack flush threshold must be at least 1");
        }
        if self.ack_flush_threshold * LibraryMessageAcknowledge::ENTRY_LEN > self.mtu - MessageHeader::MAX_SERIALIZED_LEN {
            bail!("ack flush threshold is too big for a single datagram");
        }
        if self.max_message_size.div_ceil(self.max_fragment_payload()) > u16::MAX as usize {
            bail!("max message size {} needs more than {} fragments", self.max_message_size, u16::MAX);
        }
        if self.app_identifier.is_empty() {
            bail!("application identifier must not be empty");
        }
        let connect = LibraryMessageConnect { app_identifier: self.app_identifier.clone(), hail: Vec::new() };
        if connect.serialized_len() > self.max_library_payload() {
            bail!("application identifier is too long for a single datagram");
        }
        if self.discovery_response_data.len() > self.max_library_payload() {
            bail!("discovery response data must fit into a single datagram ({} bytes)", self.max_library_payload());
        }
        for p in [self.simulation.loss, self.simulation.duplicates] {
            if !(0.0..=1.0).contains(&p) {
                bail!("simulation probabilities must be between 0.0 and 1.0");
            }
        }
        Ok(())
    }

    /// payload bytes per fragment, leaving room for the largest possible message header
    pub fn max_fragment_payload(&self) -> usize {
        self.mtu - MessageHeader::MAX_SERIALIZED_LEN
    }

    /// Library messages (and unconnected messages) are never fragmented, so their payload must
    ///  fit into a single datagram
    pub fn max_library_payload(&self) -> usize {
        self.mtu - MessageHeader::MAX_SERIALIZED_LEN
    }
}
