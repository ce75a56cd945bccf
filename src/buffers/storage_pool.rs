use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use bytes::BytesMut;
use tracing::{debug, trace};
use crate::buffers::incoming::IncomingMessage;
use crate::buffers::outgoing::OutgoingMessage;

/// Recycles byte buffers and message wrappers to avoid allocation per packet. There is one pool
///  per [crate::peer::Peer], shared by the application and network threads.
///
/// Raw byte buffers are searched last-to-first so that the most recently returned buffer is
///  reused first. Wrappers are pooled separately for incoming and outgoing messages, keeping
///  their buffer attached.
pub struct StoragePool {
    max_pool_size: usize,
    storage: Mutex<Vec<BytesMut>>,
    outgoing_wrappers: Mutex<Vec<OutgoingMessage>>,
    incoming_wrappers: Mutex<Vec<IncomingMessage>>,
    num_recycled_outgoing: AtomicU64,
}

impl StoragePool {
    pub fn new(max_pool_size: usize) -> StoragePool {
        StoragePool {
            max_pool_size,
            storage: Mutex::new(Vec::with_capacity(max_pool_size)),
            outgoing_wrappers: Default::default(),
            incoming_wrappers: Default::default(),
            num_recycled_outgoing: AtomicU64::new(0),
        }
    }

    /// Returns an empty buffer with a capacity of at least `min_capacity` bytes
    pub fn get_storage(&self, min_capacity: usize) -> BytesMut {
        {
            let mut storage = self.storage.lock().unwrap();
            if let Some(idx) = storage.iter().rposition(|b| b.capacity() >= min_capacity) {
                trace!("returning buffer from pool");
                return storage.remove(idx);
            }
        }

        debug!("no buffer of at least {} bytes in pool: allocating new buffer", min_capacity);
        BytesMut::with_capacity(min_capacity)
    }

    pub fn recycle_storage(&self, mut buffer: BytesMut) {
        if buffer.capacity() == 0 {
            return;
        }
        buffer.clear();

        let mut storage = self.storage.lock().unwrap();
        if storage.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            storage.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    pub fn create_outgoing(&self, min_capacity: usize) -> OutgoingMessage {
        let wrapper = self.outgoing_wrappers.lock().unwrap().pop();
        match wrapper {
            Some(mut msg) => {
                if msg.capacity() < min_capacity {
                    let old = msg.replace_storage(self.get_storage(min_capacity));
                    self.recycle_storage(old);
                }
                msg
            }
            None => OutgoingMessage::new(self.get_storage(min_capacity)),
        }
    }

    /// Called exactly once per queued message, when the last queue holding it has released it.
    ///  Messages the application drops without sending them are not recycled.
    pub(crate) fn recycle_outgoing(&self, mut msg: OutgoingMessage) {
        self.num_recycled_outgoing.fetch_add(1, Ordering::AcqRel);
        msg.clear();

        let mut wrappers = self.outgoing_wrappers.lock().unwrap();
        if wrappers.len() < self.max_pool_size {
            wrappers.push(msg);
        }
        else {
            drop(wrappers);
            self.recycle_storage(msg.into_storage());
        }
    }

    pub(crate) fn create_incoming(&self, min_capacity: usize) -> IncomingMessage {
        let wrapper = self.incoming_wrappers.lock().unwrap().pop();
        match wrapper {
            Some(mut msg) => {
                if msg.capacity() < min_capacity {
                    let old = msg.replace_storage(self.get_storage(min_capacity));
                    self.recycle_storage(old);
                }
                msg
            }
            None => IncomingMessage::new(self.get_storage(min_capacity)),
        }
    }

    pub fn recycle_incoming(&self, mut msg: IncomingMessage) {
        msg.reset();

        let mut wrappers = self.incoming_wrappers.lock().unwrap();
        if wrappers.len() < self.max_pool_size {
            wrappers.push(msg);
        }
        else {
            drop(wrappers);
            self.recycle_storage(msg.into_storage());
        }
    }

    /// number of outgoing messages that were returned to the pool after being sent
    pub fn num_recycled_outgoing(&self) -> u64 {
        self.num_recycled_outgoing.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn num_pooled_storage(&self) -> usize {
        self.storage.lock().unwrap().len()
    }
}
