use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use bytes::{BufMut, BytesMut};
use tracing::trace;
use crate::buffers::storage_pool::StoragePool;

/// A message being prepared by the application. It is created by
///  [crate::peer::Peer::create_message] and consumed when it is sent, so the same message
///  can not be sent twice.
pub struct OutgoingMessage {
    data: BytesMut,
}

impl Debug for OutgoingMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutgoingMessage{{{} bytes}}", self.data.len())
    }
}

impl OutgoingMessage {
    pub(crate) fn new(data: BytesMut) -> OutgoingMessage {
        OutgoingMessage { data }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
    }

    pub(crate) fn replace_storage(&mut self, storage: BytesMut) -> BytesMut {
        std::mem::replace(&mut self.data, storage)
    }

    pub(crate) fn into_storage(self) -> BytesMut {
        self.data
    }

    /// Freezes the message for sending, returning the first reference to it. Further queue
    ///  references are created by cloning.
    pub(crate) fn into_queued(self, pool: Arc<StoragePool>) -> QueueRef {
        let payload = Arc::new(OutgoingPayload {
            data: self.data,
            in_queue: AtomicUsize::new(0),
            sent: AtomicBool::new(false),
            pool,
        });
        QueueRef::acquire(payload)
    }
}

/// The immutable payload of a message that was handed over for sending. It is shared between
///  all send queues and resend lists that hold it, each holding exactly one [QueueRef].
pub(crate) struct OutgoingPayload {
    data: BytesMut,
    in_queue: AtomicUsize,
    sent: AtomicBool,
    pool: Arc<StoragePool>,
}

impl OutgoingPayload {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn in_queue_count(&self) -> usize {
        self.in_queue.load(Ordering::Acquire)
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }
}

/// A counted reference to an [OutgoingPayload], held by a send queue or a resend list. Cloning
///  increments the payload's in-queue count and dropping decrements it. The payload is returned
///  to the pool when the last reference is dropped, which happens exactly once regardless of
///  which thread drops it.
pub(crate) struct QueueRef {
    payload: Option<Arc<OutgoingPayload>>,
}

impl Debug for QueueRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueRef{{{} bytes, in queue {}}}", self.data().len(), self.payload().in_queue_count())
    }
}

impl QueueRef {
    fn acquire(payload: Arc<OutgoingPayload>) -> QueueRef {
        payload.in_queue.fetch_add(1, Ordering::AcqRel);
        QueueRef { payload: Some(payload) }
    }

    fn payload(&self) -> &OutgoingPayload {
        self.payload.as_ref()
            .expect("payload is only taken when dropping")
    }

    pub fn data(&self) -> &[u8] {
        self.payload().data()
    }

    pub fn len(&self) -> usize {
        self.payload().data.len()
    }

    /// returns `true` the first time the payload is marked as sent, for statistics
    pub fn mark_sent(&self) -> bool {
        !self.payload().sent.swap(true, Ordering::AcqRel)
    }

    pub fn is_sent(&self) -> bool {
        self.payload().is_sent()
    }

    pub fn in_queue_count(&self) -> usize {
        self.payload().in_queue_count()
    }
}

impl Clone for QueueRef {
    fn clone(&self) -> Self {
        let payload = self.payload.as_ref()
            .expect("payload is only taken when dropping")
            .clone();
        QueueRef::acquire(payload)
    }
}

impl Drop for QueueRef {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            payload.in_queue.fetch_sub(1, Ordering::AcqRel);

            // NB: the in-queue count reaches zero before the last Arc is dropped, so whichever
            //  thread gets the inner value is guaranteed to see a count of zero
            if let Some(payload) = Arc::into_inner(payload) {
                debug_assert_eq!(payload.in_queue.load(Ordering::Acquire), 0);
                trace!("last queue reference released: recycling outgoing message");
                let OutgoingPayload { data, pool, .. } = payload;
                pool.recycle_outgoing(OutgoingMessage::new(data));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use rstest::rstest;
    use super::*;

    fn queued(pool: &Arc<StoragePool>, data: &[u8]) -> QueueRef {
        let mut msg = pool.create_outgoing(data.len());
        msg.write(data);
        msg.into_queued(pool.clone())
    }

    #[test]
    fn test_single_ref_recycles_on_drop() {
        let pool = Arc::new(StoragePool::new(10));
        let r = queued(&pool, b"abc");
        assert_eq!(r.in_queue_count(), 1);
        assert_eq!(r.data(), b"abc");

        drop(r);
        assert_eq!(pool.num_recycled_outgoing(), 1);
    }

    #[test]
    fn test_not_recycled_while_referenced() {
        let pool = Arc::new(StoragePool::new(10));
        let r1 = queued(&pool, b"abc");
        let r2 = r1.clone();
        let r3 = r2.clone();
        assert_eq!(r1.in_queue_count(), 3);

        drop(r1);
        assert_eq!(r2.in_queue_count(), 2);
        drop(r3);
        assert_eq!(r2.in_queue_count(), 1);
        assert_eq!(pool.num_recycled_outgoing(), 0);
        assert_eq!(r2.data(), b"abc");

        drop(r2);
        assert_eq!(pool.num_recycled_outgoing(), 1);
    }

    #[rstest]
    #[case::two(2)]
    #[case::eight(8)]
    #[case::many(64)]
    fn test_concurrent_release_recycles_exactly_once(#[case] num_holders: usize) {
        for _ in 0..20 {
            let pool = Arc::new(StoragePool::new(10));
            let first = queued(&pool, b"shared");
            let refs: Vec<QueueRef> = (1..num_holders).map(|_| first.clone()).collect();
            assert_eq!(first.in_queue_count(), num_holders);

            let handles: Vec<_> = refs.into_iter()
                .map(|r| thread::spawn(move || drop(r)))
                .collect();
            drop(first);
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(pool.num_recycled_outgoing(), 1);
        }
    }

    #[test]
    fn test_mark_sent() {
        let pool = Arc::new(StoragePool::new(10));
        let r1 = queued(&pool, b"abc");
        let r2 = r1.clone();

        assert!(!r2.is_sent());
        assert!(r1.mark_sent());
        assert!(r2.is_sent());
        assert!(!r2.mark_sent());
    }
}
