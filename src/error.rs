/// Violations of the API contract. They are returned wrapped in [anyhow::Error], so callers can
///  distinguish them via `downcast_ref::<PeerError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    NotStarted,
    AlreadyStarted,
    ShutDown,
    InvalidChannel { channel: u8, num_channels: u8 },
    MessageTooLarge { len: usize, max_len: usize },
    NotConnected,
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::NotStarted => write!(f, "Peer is not started"),
            PeerError::AlreadyStarted => write!(f, "Peer is already started"),
            PeerError::ShutDown => write!(f, "Peer is shut down"),
            PeerError::InvalidChannel { channel, num_channels } =>
                write!(f, "Channel {} is out of range, delivery method has {} channel(s)", channel, num_channels),
            PeerError::MessageTooLarge { len, max_len } =>
                write!(f, "Message of {} bytes exceeds the maximum of {} bytes", len, max_len),
            PeerError::NotConnected => write!(f, "Connection is not connected"),
        }
    }
}

impl std::error::Error for PeerError {}
