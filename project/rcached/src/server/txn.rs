//! Identifier allocation and the in-flight transaction table.

use common::{ListingId, RequestId, SessionId, TransactionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Composite key for one outstanding transactional request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct UniqueRequest {
    pub session_id: SessionId,
    pub req_id: RequestId,
}

/// Monotonic id sources for sessions, transactions and listings. Session id
/// 0 is reserved and listing id 0 means "allocate new", so every counter
/// starts handing out values at 1.
pub(crate) struct IdAllocator {
    next_session: AtomicU64,
    next_txn: AtomicU64,
    next_listing: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_session: AtomicU64::new(0),
            next_txn: AtomicU64::new(0),
            next_listing: AtomicU64::new(0),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_txn_id(&self) -> TransactionId {
        self.next_txn.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_listing_id(&self) -> ListingId {
        self.next_listing.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// `UniqueRequest → TransactionId` for stores that are in flight. An entry
/// exists iff the transaction has started and neither committed nor
/// aborted. Touched only by the I/O task.
pub(crate) struct TransactionTable {
    map: HashMap<UniqueRequest, TransactionId>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn contains(&self, key: &UniqueRequest) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &UniqueRequest) -> Option<TransactionId> {
        self.map.get(key).copied()
    }

    pub fn insert(&mut self, key: UniqueRequest, txn_id: TransactionId) {
        self.map.insert(key, txn_id);
    }

    pub fn remove(&mut self, key: &UniqueRequest) -> Option<TransactionId> {
        self.map.remove(key)
    }

    /// Take every entry belonging to one of `sessions`, for reclamation
    /// when their connection goes away.
    pub fn drain_sessions(&mut self, sessions: &[SessionId]) -> Vec<(UniqueRequest, TransactionId)> {
        let keys: Vec<UniqueRequest> = self
            .map
            .keys()
            .filter(|key| sessions.contains(&key.session_id))
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.map.remove(&key).map(|txn_id| (key, txn_id)))
            .collect()
    }

    pub fn drain_all(&mut self) -> Vec<(UniqueRequest, TransactionId)> {
        self.map.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
