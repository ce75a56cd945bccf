//! Pooled buffers and message wrappers, see [storage_pool::StoragePool]

pub mod incoming;
pub mod outgoing;
pub mod storage_pool;
