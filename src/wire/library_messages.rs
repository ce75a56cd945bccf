//! Payload codecs for library messages. The message header (including the library sub-type)
//!  is handled by [crate::wire::message_header::MessageHeader]; these types cover only the
//!  payload that follows it.

use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::sequence::SequenceNumber;
use crate::util::buf::{prefixed_len, put_bytes, put_string, try_get_bytes, try_get_string};

/// Sent by the initiator of a connection, repeatedly until it is answered or the handshake
///  gives up
///
/// ```ascii
/// 0: application identifier (varint length + UTF-8)
/// *: hail length (varint)
/// *: hail bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryMessageConnect {
    pub app_identifier: String,
    pub hail: Vec<u8>,
}
impl LibraryMessageConnect {
    pub fn serialized_len(&self) -> usize {
        prefixed_len(self.app_identifier.len()) + prefixed_len(self.hail.len())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.app_identifier);
        put_bytes(buf, &self.hail);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LibraryMessageConnect> {
        let app_identifier = try_get_string(buf)?;
        let hail = try_get_bytes(buf)?;
        Ok(LibraryMessageConnect { app_identifier, hail })
    }
}

/// Sent by the accepting side once the connection is approved
///
/// ```ascii
/// 0: hail length (varint)
/// *: hail bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryMessageConnectResponse {
    pub hail: Vec<u8>,
}
impl LibraryMessageConnectResponse {
    pub fn serialized_len(&self) -> usize {
        prefixed_len(self.hail.len())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_bytes(buf, &self.hail);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LibraryMessageConnectResponse> {
        Ok(LibraryMessageConnectResponse {
            hail: try_get_bytes(buf)?,
        })
    }
}

/// ```ascii
/// 0: reason (varint length + UTF-8)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryMessageDisconnect {
    pub reason: String,
}
impl LibraryMessageDisconnect {
    /// Cuts the reason short (at a character boundary) if necessary, so that the serialized
    ///  message is at most `max_len` bytes long
    pub fn truncated(reason: &str, max_len: usize) -> LibraryMessageDisconnect {
        let mut end = reason.len();
        while prefixed_len(end) > max_len || !reason.is_char_boundary(end) {
            if end == 0 {
                break;
            }
            end -= 1;
        }
        LibraryMessageDisconnect {
            reason: reason[..end].to_string(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        prefixed_len(self.reason.len())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.reason);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LibraryMessageDisconnect> {
        Ok(LibraryMessageDisconnect {
            reason: try_get_string(buf)?,
        })
    }
}

/// Payload of both Ping and Pong: a Pong echoes the ping id of the Ping it answers
///
/// ```ascii
/// 0: ping id (u8)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryMessagePing {
    pub ping_id: u8,
}
impl LibraryMessagePing {
    pub const SERIALIZED_LEN: usize = 1;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ping_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LibraryMessagePing> {
        Ok(LibraryMessagePing {
            ping_id: buf.try_get_u8()?,
        })
    }
}

/// A tightly packed array of acknowledged (sequence number, raw message type) pairs
///
/// ```ascii
/// *: (repeated) sequence number (u16 LE), message type (u8)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LibraryMessageAcknowledge {
    pub entries: Vec<(SequenceNumber, u8)>,
}
impl LibraryMessageAcknowledge {
    pub const ENTRY_LEN: usize = 3;

    pub fn serialized_len(&self) -> usize {
        self.entries.len() * Self::ENTRY_LEN
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        for (sequence_number, message_type) in &self.entries {
            buf.put_u16_le(sequence_number.to_raw());
            buf.put_u8(*message_type);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LibraryMessageAcknowledge> {
        if buf.remaining() % Self::ENTRY_LEN != 0 {
            bail!("acknowledge payload length {} is not a multiple of {}", buf.remaining(), Self::ENTRY_LEN);
        }

        let mut entries = Vec::with_capacity(buf.remaining() / Self::ENTRY_LEN);
        while buf.has_remaining() {
            let sequence_number = SequenceNumber::from_raw(buf.try_get_u16_le()?);
            let message_type = buf.try_get_u8()?;
            entries.push((sequence_number, message_type));
        }
        Ok(LibraryMessageAcknowledge { entries })
    }
}

/// ```ascii
/// 0: application identifier (varint length + UTF-8)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryMessageDiscovery {
    pub app_identifier: String,
}
impl LibraryMessageDiscovery {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.app_identifier);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LibraryMessageDiscovery> {
        Ok(LibraryMessageDiscovery {
            app_identifier: try_get_string(buf)?,
        })
    }
}
