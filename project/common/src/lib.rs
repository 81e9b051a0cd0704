//! Shared protocol model for the external cache manager.
//!
//! Both the daemon and its clients speak in terms of these types; the frame
//! codec lives in [`wire`].

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod wire;

/// Protocol revision advertised in the handshake ack. Clients refuse to
/// proceed on a mismatch.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on read sizes and per-part store payloads unless overridden.
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 256 * 1024;

/// Sentinel for "object size not yet known".
pub const SIZE_UNKNOWN: u64 = u64::MAX;

pub type SessionId = u64;
pub type RequestId = u64;
pub type TransactionId = u64;
pub type ListingId = u64;

/// Digest algorithms understood by the cache. The cache never interprets
/// digests; the tag only fixes the expected width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha1,
    Rmd160,
    Sha256,
}

impl HashAlgorithm {
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 | HashAlgorithm::Rmd160 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            HashAlgorithm::Sha1 => 1,
            HashAlgorithm::Rmd160 => 2,
            HashAlgorithm::Sha256 => 3,
        }
    }

    pub fn from_wire(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(HashAlgorithm::Sha1),
            2 => Some(HashAlgorithm::Rmd160),
            3 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

pub const MAX_DIGEST_LEN: usize = 32;

/// Opaque content identifier: algorithm tag plus fixed-width digest,
/// compared bytewise. Unused digest tail is zeroed so derived equality and
/// hashing stay well defined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    algorithm: HashAlgorithm,
    digest: [u8; MAX_DIGEST_LEN],
}

impl ObjectId {
    /// Build an id from a digest of exactly the algorithm's width.
    pub fn new(algorithm: HashAlgorithm, digest: &[u8]) -> Option<Self> {
        if digest.len() != algorithm.digest_len() {
            return None;
        }
        let mut buf = [0u8; MAX_DIGEST_LEN];
        buf[..digest.len()].copy_from_slice(digest);
        Some(ObjectId {
            algorithm,
            digest: buf,
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest[..self.algorithm.digest_len()]
    }

    /// Decode the loosely-typed wire form; `None` marks a malformed id.
    pub fn from_wire(wire: &WireHash) -> Option<Self> {
        let algorithm = HashAlgorithm::from_wire(wire.algorithm)?;
        ObjectId::new(algorithm, &wire.digest)
    }

    pub fn to_wire(&self) -> WireHash {
        WireHash {
            algorithm: self.algorithm.to_wire(),
            digest: self.digest().to_vec(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.digest()))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.algorithm, hex::encode(self.digest()))
    }
}

/// Wire form of an object id. Kept loosely typed so an unknown algorithm or
/// a wrong-width digest surfaces as a `Malformed` reply instead of killing
/// the connection at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHash {
    pub algorithm: u32,
    pub digest: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectType {
    #[default]
    Regular,
    Catalog,
    Part,
    Pinned,
    Volatile,
}

/// Reply status vocabulary. The core produces `Ok`, `Malformed`,
/// `OutOfBounds` and `NotSupported`; everything else passes through from
/// the backend untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotFound,
    Malformed,
    OutOfBounds,
    NoSpace,
    NotSupported,
    Forbidden,
    IoError,
    Corrupted,
    Partial,
    BadCount,
    Unknown,
}

bitflags::bitflags! {
    /// Capability bits advertised in the handshake ack. The server honours
    /// exactly the operations whose bit it claims.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        const REFCOUNT = 1 << 0;
        const SHRINK = 1 << 1;
        const INFO = 1 << 2;
        const LIST = 1 << 3;
        const ALL_HASHES = 1 << 4;
        const DETACH = 1 << 5;
    }
}

// On the wire the bitset is its raw u64; unknown bits survive a round trip
// so newer peers can advertise capabilities older ones ignore.
impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Capabilities::from_bits_retain(u64::deserialize(
            deserializer,
        )?))
    }
}

/// Everything the cache knows about one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub size: u64,
    pub object_type: ObjectType,
    pub description: String,
    pub pinned: bool,
}

impl ObjectInfo {
    pub fn new(id: ObjectId) -> Self {
        ObjectInfo {
            id,
            size: SIZE_UNKNOWN,
            object_type: ObjectType::Regular,
            description: String::new(),
            pinned: false,
        }
    }
}

/// Aggregate cache accounting, as reported by `InfoReq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheInfo {
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub pinned_bytes: u64,
    pub no_shrink: bool,
}

/// One record of a paged listing reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRecord {
    pub hash: WireHash,
    pub pinned: bool,
    pub description: String,
}

/// Client-to-server messages. Store payloads and nothing else ride in the
/// frame attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Handshake {
        name: Option<String>,
    },
    Quit,
    Refcount {
        req_id: RequestId,
        object_id: WireHash,
        change_by: i64,
    },
    ObjectInfo {
        req_id: RequestId,
        object_id: WireHash,
    },
    Read {
        req_id: RequestId,
        object_id: WireHash,
        offset: u64,
        size: u64,
    },
    Store {
        req_id: RequestId,
        session_id: SessionId,
        object_id: WireHash,
        part_nr: u64,
        last_part: bool,
        expected_size: Option<u64>,
        object_type: Option<ObjectType>,
        description: Option<String>,
    },
    StoreAbort {
        req_id: RequestId,
        session_id: SessionId,
    },
    Info {
        req_id: RequestId,
    },
    Shrink {
        req_id: RequestId,
        shrink_to: u64,
    },
    List {
        req_id: RequestId,
        listing_id: ListingId,
        object_type: ObjectType,
    },
}

/// Server-to-client messages. Read replies carry their payload in the frame
/// attachment; `Detach` is the only message the server sends unprompted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Handshake {
        status: Status,
        name: String,
        protocol_version: u32,
        max_object_size: u64,
        session_id: SessionId,
        capabilities: Capabilities,
    },
    Refcount {
        req_id: RequestId,
        status: Status,
    },
    ObjectInfo {
        req_id: RequestId,
        status: Status,
        object_type: Option<ObjectType>,
        size: Option<u64>,
    },
    Read {
        req_id: RequestId,
        status: Status,
    },
    Store {
        req_id: RequestId,
        part_nr: u64,
        status: Status,
    },
    Info {
        req_id: RequestId,
        status: Status,
        size_bytes: u64,
        used_bytes: u64,
        pinned_bytes: u64,
        no_shrink: bool,
    },
    Shrink {
        req_id: RequestId,
        status: Status,
        used_bytes: u64,
    },
    List {
        req_id: RequestId,
        status: Status,
        listing_id: ListingId,
        is_last_part: bool,
        records: Vec<ListRecord>,
    },
    Detach,
}
