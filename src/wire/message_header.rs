use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::sequence::SequenceNumber;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::message_type::{LibraryMessageType, MessageType};

/// Fragment descriptor, present iff the fragment flag is set in the type byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub group_id: u16,
    pub total_count: u16,
    pub fragment_index: u16,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 6;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.group_id);
        buf.put_u16_le(self.total_count);
        buf.put_u16_le(self.fragment_index);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        let group_id = buf.try_get_u16_le()?;
        let total_count = buf.try_get_u16_le()?;
        let fragment_index = buf.try_get_u16_le()?;

        if fragment_index >= total_count {
            bail!("fragment index {} is out of range for a fragment group of {}", fragment_index, total_count);
        }

        Ok(FragmentHeader {
            group_id,
            total_count,
            fragment_index,
        })
    }
}

/// Per-message header:
///
/// ```ascii
/// 0: type (u8) - bit 7 is the fragment flag, bits 0-6 the message type
/// *: library message sub-type (u8) - only for library messages
/// *: sequence number (u16 LE) - only for types carrying a sequence number
/// *: payload length (1 or 2 bytes) - if the high bit of the first byte is set, a second byte
///     follows and contributes bits 7-14
/// *: fragment descriptor (3 x u16 LE) - only if the fragment flag is set
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub library_type: Option<LibraryMessageType>,
    pub sequence_number: Option<SequenceNumber>,
    pub payload_len: u16,
    pub fragment: Option<FragmentHeader>,
}

impl MessageHeader {
    pub const FRAGMENT_FLAG: u8 = 0x80;
    pub const MAX_PAYLOAD_LEN: usize = 0x7fff;
    /// upper bound for the serialized header length, for capacity calculations
    pub const MAX_SERIALIZED_LEN: usize = 1 + 1 + 2 + 2 + FragmentHeader::SERIALIZED_LEN;

    pub fn library(library_type: LibraryMessageType, payload_len: usize) -> MessageHeader {
        MessageHeader {
            message_type: MessageType::Library,
            library_type: Some(library_type),
            sequence_number: None,
            payload_len: Self::checked_payload_len(payload_len),
            fragment: None,
        }
    }

    pub fn user(message_type: MessageType, sequence_number: Option<SequenceNumber>, payload_len: usize, fragment: Option<FragmentHeader>) -> MessageHeader {
        debug_assert_eq!(message_type.has_sequence_number(), sequence_number.is_some());

        MessageHeader {
            message_type,
            library_type: None,
            sequence_number,
            payload_len: Self::checked_payload_len(payload_len),
            fragment,
        }
    }

    fn checked_payload_len(payload_len: usize) -> u16 {
        assert!(payload_len <= Self::MAX_PAYLOAD_LEN, "payload length {} exceeds the maximum of {} - this is a bug", payload_len, Self::MAX_PAYLOAD_LEN);
        payload_len.prechecked_cast()
    }

    pub fn serialized_len(&self) -> usize {
        let mut result = 1;
        if self.library_type.is_some() {
            result += 1;
        }
        if self.sequence_number.is_some() {
            result += 2;
        }
        result += if self.payload_len < 0x80 { 1 } else { 2 };
        if self.fragment.is_some() {
            result += FragmentHeader::SERIALIZED_LEN;
        }
        result
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let flag = if self.fragment.is_some() { Self::FRAGMENT_FLAG } else { 0 };
        buf.put_u8(self.message_type.to_raw() | flag);

        if let Some(library_type) = self.library_type {
            buf.put_u8(library_type.into());
        }
        if let Some(sequence_number) = self.sequence_number {
            buf.put_u16_le(sequence_number.to_raw());
        }

        if self.payload_len < 0x80 {
            buf.put_u8(self.payload_len as u8);
        }
        else {
            buf.put_u8(0x80 | (self.payload_len & 0x7f) as u8);
            buf.put_u8((self.payload_len >> 7) as u8);
        }

        if let Some(fragment) = &self.fragment {
            fragment.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let raw_type = buf.try_get_u8()?;
        let message_type = MessageType::try_from_raw(raw_type & !Self::FRAGMENT_FLAG)?;
        let is_fragment = raw_type & Self::FRAGMENT_FLAG != 0;

        let library_type = if message_type == MessageType::Library {
            Some(LibraryMessageType::try_from(buf.try_get_u8()?)?)
        }
        else {
            None
        };

        let sequence_number = if message_type.has_sequence_number() {
            Some(SequenceNumber::from_raw(buf.try_get_u16_le()?))
        }
        else {
            None
        };

        let first = buf.try_get_u8()?;
        let payload_len = if first & 0x80 == 0 {
            first as u16
        }
        else {
            let second = buf.try_get_u8()?;
            (first & 0x7f) as u16 | ((second as u16) << 7)
        };

        let fragment = if is_fragment {
            Some(FragmentHeader::deser(buf)?)
        }
        else {
            None
        };

        Ok(MessageHeader {
            message_type,
            library_type,
            sequence_number,
            payload_len,
            fragment,
        })
    }
}
