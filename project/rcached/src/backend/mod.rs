//! Backend contract: the operations a concrete cache must implement.
//!
//! The server core never interprets object contents and never produces the
//! storage-level statuses itself; whatever a backend returns is passed
//! through to the client unchanged.

use async_trait::async_trait;
use bytes::Bytes;
use common::{CacheInfo, Capabilities, ListingId, ObjectId, ObjectInfo, ObjectType, Status, TransactionId};

pub mod mem;

pub use mem::InMemoryCache;

/// Storage-level failures. Each variant maps 1:1 onto a wire status so
/// backend pass-through stays typed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("object not found")]
    NotFound,

    #[error("no space left in cache")]
    NoSpace,

    #[error("operation not supported")]
    NotSupported,

    #[error("operation forbidden")]
    Forbidden,

    #[error("malformed request")]
    Malformed,

    #[error("iteration out of bounds")]
    OutOfBounds,

    #[error("io failure: {0}")]
    Io(String),

    #[error("object data corrupted")]
    Corrupted,

    #[error("operation completed partially")]
    Partial,

    #[error("invalid object count or size")]
    BadCount,

    #[error("unknown failure")]
    Unknown,
}

impl CacheError {
    pub fn status(&self) -> Status {
        match self {
            CacheError::NotFound => Status::NotFound,
            CacheError::NoSpace => Status::NoSpace,
            CacheError::NotSupported => Status::NotSupported,
            CacheError::Forbidden => Status::Forbidden,
            CacheError::Malformed => Status::Malformed,
            CacheError::OutOfBounds => Status::OutOfBounds,
            CacheError::Io(_) => Status::IoError,
            CacheError::Corrupted => Status::Corrupted,
            CacheError::Partial => Status::Partial,
            CacheError::BadCount => Status::BadCount,
            CacheError::Unknown => Status::Unknown,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

/// Result of a shrink request. `used_bytes` is reported to the client even
/// when the cache could not get below the requested threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkOutcome {
    pub used_bytes: u64,
    pub complete: bool,
}

/// Abstract cache the server core drives. Implementations own their
/// synchronisation; the core calls from a single task but expects `Send +
/// Sync` so backends may parallelise internally.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Capability bits this backend supports; advertised verbatim in the
    /// handshake ack.
    fn capabilities(&self) -> Capabilities;

    /// Provisioning hook called once before the server starts serving.
    /// `num_workers` is a backend concern; the I/O path ignores it.
    async fn start(&self, num_workers: usize) -> Result<(), CacheError> {
        let _ = num_workers;
        Ok(())
    }

    /// Read up to `size` bytes at `offset`. A read past the tail returns
    /// fewer bytes than requested.
    async fn pread(&self, id: &ObjectId, offset: u64, size: u64) -> Result<Bytes, CacheError>;

    /// Open a store transaction for `id` under the server-allocated
    /// `txn_id`.
    async fn start_txn(
        &self,
        id: &ObjectId,
        txn_id: TransactionId,
        info: ObjectInfo,
    ) -> Result<(), CacheError>;

    /// Append payload bytes to an open transaction.
    async fn write_txn(&self, txn_id: TransactionId, data: &[u8]) -> Result<(), CacheError>;

    /// Seal a transaction and publish its object.
    async fn commit_txn(&self, txn_id: TransactionId) -> Result<(), CacheError>;

    /// Drop a transaction and release its resources.
    async fn abort_txn(&self, txn_id: TransactionId) -> Result<(), CacheError>;

    async fn info(&self) -> Result<CacheInfo, CacheError>;

    async fn object_info(&self, id: &ObjectId) -> Result<ObjectInfo, CacheError>;

    async fn change_refcount(&self, id: &ObjectId, change_by: i64) -> Result<(), CacheError>;

    /// Evict unreferenced objects until at most `shrink_to` bytes are used.
    async fn shrink(&self, shrink_to: u64) -> Result<ShrinkOutcome, CacheError>;

    /// Open a listing cursor over objects of `object_type`.
    async fn listing_begin(
        &self,
        listing_id: ListingId,
        object_type: ObjectType,
    ) -> Result<(), CacheError>;

    /// Advance a cursor; `Err(OutOfBounds)` signals exhaustion.
    async fn listing_next(&self, listing_id: ListingId) -> Result<ObjectInfo, CacheError>;

    /// Reclaim a cursor. Every successful `listing_begin` is matched by
    /// exactly one `listing_end`.
    async fn listing_end(&self, listing_id: ListingId) -> Result<(), CacheError>;
}
