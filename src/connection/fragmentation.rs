use std::time::Duration;
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::buffers::storage_pool::StoragePool;
use crate::connection::send_channels::QueuedMessage;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::message_header::FragmentHeader;

/// Number of fragments a message of `len` bytes is split into
pub(crate) fn num_fragments(len: usize, max_fragment_payload: usize) -> usize {
    len.div_ceil(max_fragment_payload)
}

/// Splits a message that is too big for a single datagram into fragments sharing its payload.
///  Each fragment is sent as a message of its own, with its own sequence number.
pub(crate) fn split_into_fragments(message: QueuedMessage, group_id: u16, max_fragment_payload: usize) -> Vec<QueuedMessage> {
    debug_assert!(message.fragment.is_none());

    let len = message.payload.len();
    let total_count: u16 = num_fragments(len, max_fragment_payload).prechecked_cast();

    let result = (0..total_count)
        .map(|fragment_index| {
            let index: usize = fragment_index.safe_cast();
            let start = index * max_fragment_payload;
            let end = (start + max_fragment_payload).min(len);
            QueuedMessage {
                payload: message.payload.clone(),
                message_type: message.message_type,
                fragment: Some((FragmentHeader { group_id, total_count, fragment_index }, start..end)),
            }
        })
        .collect();
    trace!("split message of {} bytes into {} fragments (group {})", len, total_count, group_id);
    result
}

struct FragmentGroup {
    fragments: Vec<Option<BytesMut>>,
    num_received: usize,
    started: Instant,
}

/// Collects fragments per group until a group is complete
pub(crate) struct FragmentAssembler {
    groups: FxHashMap<u16, FragmentGroup>,
    group_timeout: Duration,
}

impl FragmentAssembler {
    pub fn new(group_timeout: Duration) -> FragmentAssembler {
        FragmentAssembler {
            groups: Default::default(),
            group_timeout,
        }
    }

    /// Adds a received fragment, returning the reassembled message if the fragment completed
    ///  its group. Fragment buffers are returned to the pool.
    pub fn add(&mut self, header: FragmentHeader, data: BytesMut, now: Instant, pool: &StoragePool) -> anyhow::Result<Option<BytesMut>> {
        let group = self.groups.entry(header.group_id)
            .or_insert_with(|| FragmentGroup {
                fragments: (0..header.total_count).map(|_| None).collect(),
                num_received: 0,
                started: now,
            });

        let total_count: usize = header.total_count.safe_cast();
        if group.fragments.len() != total_count {
            let expected = group.fragments.len();
            self.discard(header.group_id, pool);
            bail!("fragment group {}: fragment count {} does not match previous count {} - discarding group", header.group_id, header.total_count, expected);
        }

        let fragment_index: usize = header.fragment_index.safe_cast();
        let slot = &mut group.fragments[fragment_index];
        if slot.is_some() {
            debug!("duplicate fragment {} of group {}", header.fragment_index, header.group_id);
            pool.recycle_storage(data);
            return Ok(None);
        }
        *slot = Some(data);
        group.num_received += 1;

        if group.num_received < group.fragments.len() {
            return Ok(None);
        }

        let Some(group) = self.groups.remove(&header.group_id) else {
            return Ok(None);
        };
        let total_len = group.fragments.iter().flatten().map(|f| f.len()).sum();
        let mut result = pool.get_storage(total_len);
        for fragment in group.fragments.into_iter().flatten() {
            result.put_slice(&fragment);
            pool.recycle_storage(fragment);
        }
        trace!("reassembled fragment group {}: {} bytes", header.group_id, total_len);
        Ok(Some(result))
    }

    fn discard(&mut self, group_id: u16, pool: &StoragePool) {
        if let Some(group) = self.groups.remove(&group_id) {
            for fragment in group.fragments.into_iter().flatten() {
                pool.recycle_storage(fragment);
            }
        }
    }

    /// Drops incomplete groups that are older than the group timeout, returning the ids of
    ///  dropped groups
    pub fn expire(&mut self, now: Instant, pool: &StoragePool) -> Vec<u16> {
        let expired: Vec<u16> = self.groups.iter()
            .filter(|(_, g)| now.duration_since(g.started) > self.group_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.discard(*id, pool);
        }
        expired
    }

    pub fn num_incomplete_groups(&self) -> usize {
        self.groups.len()
    }
}
