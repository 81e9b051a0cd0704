//! In-memory reference backend.
//!
//! Keeps whole objects in a map with reference counts, open transactions as
//! append buffers, and listings as snapshots taken at `listing_begin`.

use super::{CacheBackend, CacheError, ShrinkOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use common::{
    CacheInfo, Capabilities, ListingId, ObjectId, ObjectInfo, ObjectType, TransactionId,
    SIZE_UNKNOWN,
};
use std::collections::HashMap;
use tokio::sync::Mutex;

struct MemObject {
    data: Vec<u8>,
    object_type: ObjectType,
    description: String,
    pinned: bool,
    refcount: i64,
}

struct OpenTxn {
    id: ObjectId,
    expected_size: u64,
    object_type: ObjectType,
    description: String,
    pinned: bool,
    data: Vec<u8>,
}

struct ListingCursor {
    items: Vec<ObjectInfo>,
    pos: usize,
}

#[derive(Default)]
struct MemState {
    objects: HashMap<ObjectId, MemObject>,
    txns: HashMap<TransactionId, OpenTxn>,
    listings: HashMap<ListingId, ListingCursor>,
}

impl MemState {
    fn used_bytes(&self) -> u64 {
        self.objects.values().map(|o| o.data.len() as u64).sum()
    }

    fn pinned_bytes(&self) -> u64 {
        self.objects
            .values()
            .filter(|o| o.pinned || o.refcount > 0)
            .map(|o| o.data.len() as u64)
            .sum()
    }
}

/// Whole-object in-memory cache with a fixed byte capacity.
pub struct InMemoryCache {
    capacity: u64,
    state: Mutex<MemState>,
}

impl InMemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemState::default()),
        }
    }

    /// Number of transactions currently open (started, neither committed
    /// nor aborted).
    pub async fn open_transactions(&self) -> usize {
        self.state.lock().await.txns.len()
    }

    /// Number of listing cursors currently open.
    pub async fn open_listings(&self) -> usize {
        self.state.lock().await.listings.len()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    fn capabilities(&self) -> Capabilities {
        Capabilities::REFCOUNT
            | Capabilities::SHRINK
            | Capabilities::INFO
            | Capabilities::LIST
            | Capabilities::DETACH
    }

    async fn pread(&self, id: &ObjectId, offset: u64, size: u64) -> Result<Bytes, CacheError> {
        let state = self.state.lock().await;
        let object = state.objects.get(id).ok_or(CacheError::NotFound)?;
        let len = object.data.len() as u64;
        if offset > len {
            return Err(CacheError::OutOfBounds);
        }
        let end = len.min(offset + size) as usize;
        Ok(Bytes::copy_from_slice(&object.data[offset as usize..end]))
    }

    async fn start_txn(
        &self,
        id: &ObjectId,
        txn_id: TransactionId,
        info: ObjectInfo,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state.txns.insert(
            txn_id,
            OpenTxn {
                id: *id,
                expected_size: info.size,
                object_type: info.object_type,
                description: info.description,
                pinned: info.pinned || info.object_type == ObjectType::Pinned,
                data: Vec::new(),
            },
        );
        Ok(())
    }

    async fn write_txn(&self, txn_id: TransactionId, data: &[u8]) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        let txn = state.txns.get_mut(&txn_id).ok_or(CacheError::Malformed)?;
        txn.data.extend_from_slice(data);
        Ok(())
    }

    async fn commit_txn(&self, txn_id: TransactionId) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        let txn = state.txns.remove(&txn_id).ok_or(CacheError::Malformed)?;
        if txn.expected_size != SIZE_UNKNOWN && txn.expected_size != txn.data.len() as u64 {
            return Err(CacheError::BadCount);
        }
        if state.used_bytes() + txn.data.len() as u64 > self.capacity {
            return Err(CacheError::NoSpace);
        }
        state.objects.insert(
            txn.id,
            MemObject {
                data: txn.data,
                object_type: txn.object_type,
                description: txn.description,
                pinned: txn.pinned,
                refcount: 1,
            },
        );
        Ok(())
    }

    async fn abort_txn(&self, txn_id: TransactionId) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state
            .txns
            .remove(&txn_id)
            .map(|_| ())
            .ok_or(CacheError::Malformed)
    }

    async fn info(&self) -> Result<CacheInfo, CacheError> {
        let state = self.state.lock().await;
        Ok(CacheInfo {
            size_bytes: self.capacity,
            used_bytes: state.used_bytes(),
            pinned_bytes: state.pinned_bytes(),
            no_shrink: false,
        })
    }

    async fn object_info(&self, id: &ObjectId) -> Result<ObjectInfo, CacheError> {
        let state = self.state.lock().await;
        let object = state.objects.get(id).ok_or(CacheError::NotFound)?;
        Ok(ObjectInfo {
            id: *id,
            size: object.data.len() as u64,
            object_type: object.object_type,
            description: object.description.clone(),
            pinned: object.pinned,
        })
    }

    async fn change_refcount(&self, id: &ObjectId, change_by: i64) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        let object = state.objects.get_mut(id).ok_or(CacheError::NotFound)?;
        let refcount = object.refcount + change_by;
        if refcount < 0 {
            return Err(CacheError::BadCount);
        }
        object.refcount = refcount;
        Ok(())
    }

    async fn shrink(&self, shrink_to: u64) -> Result<ShrinkOutcome, CacheError> {
        let mut state = self.state.lock().await;
        let mut used = state.used_bytes();
        if used > shrink_to {
            let victims: Vec<ObjectId> = state
                .objects
                .iter()
                .filter(|(_, o)| o.refcount == 0 && !o.pinned)
                .map(|(id, _)| *id)
                .collect();
            for id in victims {
                if used <= shrink_to {
                    break;
                }
                if let Some(object) = state.objects.remove(&id) {
                    used -= object.data.len() as u64;
                }
            }
        }
        Ok(ShrinkOutcome {
            used_bytes: used,
            complete: used <= shrink_to,
        })
    }

    async fn listing_begin(
        &self,
        listing_id: ListingId,
        object_type: ObjectType,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if state.listings.contains_key(&listing_id) {
            return Err(CacheError::Malformed);
        }
        let items: Vec<ObjectInfo> = state
            .objects
            .iter()
            .filter(|(_, o)| o.object_type == object_type)
            .map(|(id, o)| ObjectInfo {
                id: *id,
                size: o.data.len() as u64,
                object_type: o.object_type,
                description: o.description.clone(),
                pinned: o.pinned,
            })
            .collect();
        state.listings.insert(listing_id, ListingCursor { items, pos: 0 });
        Ok(())
    }

    async fn listing_next(&self, listing_id: ListingId) -> Result<ObjectInfo, CacheError> {
        let mut state = self.state.lock().await;
        let cursor = state
            .listings
            .get_mut(&listing_id)
            .ok_or(CacheError::Malformed)?;
        if cursor.pos >= cursor.items.len() {
            return Err(CacheError::OutOfBounds);
        }
        let item = cursor.items[cursor.pos].clone();
        cursor.pos += 1;
        Ok(item)
    }

    async fn listing_end(&self, listing_id: ListingId) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state
            .listings
            .remove(&listing_id)
            .map(|_| ())
            .ok_or(CacheError::Malformed)
    }
}
