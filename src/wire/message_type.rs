use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of independent channels for delivery methods that support more than one channel
pub const NUM_CHANNELS: u8 = 32;

const TYPE_LIBRARY: u8 = 0;
const TYPE_UNCONNECTED: u8 = 1;
const TYPE_USER_UNRELIABLE: u8 = 2;
const TYPE_USER_SEQUENCED: u8 = 3;
const TYPE_USER_RELIABLE_UNORDERED: u8 = TYPE_USER_SEQUENCED + NUM_CHANNELS;
const TYPE_USER_RELIABLE_SEQUENCED: u8 = TYPE_USER_RELIABLE_UNORDERED + 1;
const TYPE_USER_RELIABLE_ORDERED: u8 = TYPE_USER_RELIABLE_SEQUENCED + NUM_CHANNELS;

/// Number of distinct raw message types, i.e. the size of per-type tables
pub const NUM_MESSAGE_TYPES: usize = (TYPE_USER_RELIABLE_ORDERED + NUM_CHANNELS) as usize;

/// All types from this one onward carry a sequence number
const FIRST_SEQUENCED_TYPE: u8 = TYPE_USER_SEQUENCED;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DeliveryMethod {
    /// no guarantees, no sequence number
    Unreliable,
    /// late messages are dropped, missing messages are not re-sent
    UnreliableSequenced,
    /// every message arrives exactly once, in any order
    ReliableUnordered,
    /// late messages are dropped, but the newest message is re-sent until acknowledged
    ReliableSequenced,
    /// every message arrives exactly once, in the order it was sent within its channel
    ReliableOrdered,
}

impl DeliveryMethod {
    pub fn is_reliable(&self) -> bool {
        use DeliveryMethod::*;
        match self {
            Unreliable | UnreliableSequenced => false,
            ReliableUnordered | ReliableSequenced | ReliableOrdered => true,
        }
    }

    pub fn num_channels(&self) -> u8 {
        use DeliveryMethod::*;
        match self {
            Unreliable | ReliableUnordered => 1,
            UnreliableSequenced | ReliableSequenced | ReliableOrdered => NUM_CHANNELS,
        }
    }

    fn base_type(&self) -> u8 {
        use DeliveryMethod::*;
        match self {
            Unreliable => TYPE_USER_UNRELIABLE,
            UnreliableSequenced => TYPE_USER_SEQUENCED,
            ReliableUnordered => TYPE_USER_RELIABLE_UNORDERED,
            ReliableSequenced => TYPE_USER_RELIABLE_SEQUENCED,
            ReliableOrdered => TYPE_USER_RELIABLE_ORDERED,
        }
    }
}

/// The message type as it is encoded in bits 0..6 of the type byte. A user message's type
///  identifies both its delivery method and channel.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum MessageType {
    Library,
    Unconnected,
    User { method: DeliveryMethod, channel: u8 },
}

impl MessageType {
    pub fn user(method: DeliveryMethod, channel: u8) -> anyhow::Result<MessageType> {
        if channel >= method.num_channels() {
            return Err(anyhow!("channel {} is out of range for {:?}", channel, method));
        }
        Ok(MessageType::User { method, channel })
    }

    pub fn to_raw(&self) -> u8 {
        match self {
            MessageType::Library => TYPE_LIBRARY,
            MessageType::Unconnected => TYPE_UNCONNECTED,
            MessageType::User { method, channel } => method.base_type() + channel,
        }
    }

    pub fn try_from_raw(raw: u8) -> anyhow::Result<MessageType> {
        use DeliveryMethod::*;

        let result = match raw {
            TYPE_LIBRARY => MessageType::Library,
            TYPE_UNCONNECTED => MessageType::Unconnected,
            TYPE_USER_UNRELIABLE => MessageType::User { method: Unreliable, channel: 0 },
            TYPE_USER_RELIABLE_UNORDERED => MessageType::User { method: ReliableUnordered, channel: 0 },
            r if r >= TYPE_USER_SEQUENCED && r < TYPE_USER_RELIABLE_UNORDERED =>
                MessageType::User { method: UnreliableSequenced, channel: r - TYPE_USER_SEQUENCED },
            r if r >= TYPE_USER_RELIABLE_SEQUENCED && r < TYPE_USER_RELIABLE_ORDERED =>
                MessageType::User { method: ReliableSequenced, channel: r - TYPE_USER_RELIABLE_SEQUENCED },
            r if r >= TYPE_USER_RELIABLE_ORDERED && (r as usize) < NUM_MESSAGE_TYPES =>
                MessageType::User { method: ReliableOrdered, channel: r - TYPE_USER_RELIABLE_ORDERED },
            r => return Err(anyhow!("invalid message type {}", r)),
        };
        Ok(result)
    }

    pub fn has_sequence_number(&self) -> bool {
        self.to_raw() >= FIRST_SEQUENCED_TYPE
    }

    pub fn delivery_method(&self) -> Option<DeliveryMethod> {
        match self {
            MessageType::User { method, .. } => Some(*method),
            _ => None,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.delivery_method()
            .map(|m| m.is_reliable())
            .unwrap_or(false)
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum LibraryMessageType {
    Connect = 0,
    ConnectResponse = 1,
    ConnectionEstablished = 2,
    Disconnect = 3,
    KeepAlive = 4,
    Ping = 5,
    Pong = 6,
    Acknowledge = 7,
    Discovery = 8,
    DiscoveryResponse = 9,
}
