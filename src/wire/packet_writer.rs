use std::sync::Arc;
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use tracing::trace;
use crate::buffers::storage_pool::StoragePool;
use crate::util::safe_converter::SafeCast;
use crate::wire::message_header::MessageHeader;

/// Assembles messages into datagrams of at most `mtu` bytes. When a message does not fit into
///  the current datagram, that datagram is finished and a new one is started. Finished datagrams
///  are collected until they are taken for sending.
pub struct PacketWriter {
    mtu: usize,
    pool: Arc<StoragePool>,
    current: Option<BytesMut>,
    finished: Vec<BytesMut>,
}

impl PacketWriter {
    pub fn new(mtu: usize, pool: Arc<StoragePool>) -> PacketWriter {
        PacketWriter {
            mtu,
            pool,
            current: None,
            finished: Vec::new(),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// The number of payload bytes a single message with the given header overhead can carry
    pub fn max_payload_len(&self, header_len: usize) -> usize {
        self.mtu.saturating_sub(header_len)
            .min(MessageHeader::MAX_PAYLOAD_LEN)
    }

    pub fn write_message(&mut self, header: &MessageHeader, payload: &[u8]) {
        let payload_len: usize = header.payload_len.safe_cast();
        debug_assert_eq!(payload_len, payload.len());

        let len = header.serialized_len() + payload.len();
        assert!(len <= self.mtu, "message of {} bytes exceeds MTU of {} - this is a bug", len, self.mtu);

        if let Some(current) = &self.current {
            if current.len() + len > self.mtu {
                self.finish_current();
            }
        }

        let mtu = self.mtu;
        let pool = &self.pool;
        let buf = self.current.get_or_insert_with(|| pool.get_storage(mtu));
        header.ser(buf);
        buf.put_slice(payload);
    }

    /// `true` if there is any data that was not taken yet
    #[cfg(test)]
    pub fn has_data(&self) -> bool {
        self.current.is_some() || !self.finished.is_empty()
    }

    fn finish_current(&mut self) {
        if let Some(current) = self.current.take() {
            trace!("finished datagram of {} bytes", current.len());
            self.finished.push(current);
        }
    }

    /// Returns all datagrams written so far, including a partially filled last one. The
    ///  datagrams' buffers should be returned to the pool after sending.
    pub fn take_datagrams(&mut self) -> Vec<BytesMut> {
        self.finish_current();
        std::mem::take(&mut self.finished)
    }
}

/// Splits a received datagram into its messages. Iteration stops after the first malformed
///  message, since its length and therefore the start of the next message is unknown.
pub struct PacketReader<'a> {
    remaining: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(datagram: &'a [u8]) -> PacketReader<'a> {
        PacketReader { remaining: datagram }
    }

    fn read_message(&mut self) -> anyhow::Result<(MessageHeader, &'a [u8])> {
        let mut buf = self.remaining;
        let header = MessageHeader::deser(&mut buf)?;

        let payload_len: usize = header.payload_len.safe_cast();
        if payload_len > buf.len() {
            bail!("declared payload length {} exceeds the remaining {} bytes of the datagram", payload_len, buf.len());
        }
        let (payload, rest) = buf.split_at(payload_len);
        self.remaining = rest;
        Ok((header, payload))
    }
}

impl<'a> Iterator for PacketReader<'a> {
    type Item = anyhow::Result<(MessageHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        match self.read_message() {
            Ok(msg) => Some(Ok(msg)),
            Err(e) => {
                self.remaining = &[];
                Some(Err(e))
            }
        }
    }
}
