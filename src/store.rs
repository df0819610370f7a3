//! Raw record persistence.
//!
//! The store owns record identity and versioning. A record is identified by
//! `(source, provider_id)`; each distinct payload for that identity becomes a
//! new immutable version with its own [`RawRecordId`].

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{HarvestedRecord, RawRecord, RawRecordId};

const SHARD_COUNT: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Raw record not found: {0}")]
    NotFound(RawRecordId),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Result of a [`RawRecordStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Version the payload is stored under (existing one when unchanged).
    pub id: RawRecordId,
    /// `false` when an identical payload was already stored for the identity.
    pub is_new: bool,
}

#[async_trait]
pub trait RawRecordStore: Send + Sync {
    /// Stores `record` for `source` unless an identical payload already exists.
    ///
    /// Concurrent calls for the same identity and payload produce exactly one
    /// version.
    async fn put(&self, source: &str, record: HarvestedRecord) -> Result<PutOutcome, StoreError>;

    async fn get(&self, id: RawRecordId) -> Result<RawRecord, StoreError>;

    /// All versions of one identity, oldest first.
    async fn versions(&self, source: &str, provider_id: &str)
        -> Result<Vec<RawRecord>, StoreError>;
}

/// Hex SHA-256 of a payload; the store's notion of payload identity.
pub fn content_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    source: String,
    provider_id: String,
}

type Shard = Mutex<HashMap<RecordKey, Vec<RawRecord>>>;

/// In-process store with per-shard locking.
///
/// Writers for unrelated identities only contend when their keys hash to
/// the same shard.
pub struct MemoryStore {
    shards: Vec<Shard>,
    index: RwLock<HashMap<RawRecordId, RecordKey>>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored versions across all identities.
    pub fn len(&self) -> usize {
        self.read_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &RecordKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    // Every write under these locks is a single insert or push, so a panic
    // elsewhere while one was held leaves the maps consistent.

    fn lock_shard(&self, key: &RecordKey) -> MutexGuard<'_, HashMap<RecordKey, Vec<RawRecord>>> {
        self.shard(key)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_index(&self) -> RwLockReadGuard<'_, HashMap<RawRecordId, RecordKey>> {
        self.index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, HashMap<RawRecordId, RecordKey>> {
        self.index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RawRecordStore for MemoryStore {
    async fn put(&self, source: &str, record: HarvestedRecord) -> Result<PutOutcome, StoreError> {
        let digest = content_digest(&record.payload);
        let key = RecordKey {
            source: source.to_string(),
            provider_id: record.provider_id.clone(),
        };

        let mut shard = self.lock_shard(&key);
        let versions = shard.entry(key.clone()).or_default();

        if let Some(existing) = versions.iter().find(|v| v.digest == digest) {
            return Ok(PutOutcome {
                id: existing.id,
                is_new: false,
            });
        }

        let id = RawRecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        versions.push(RawRecord {
            id,
            source: key.source.clone(),
            provider_id: record.provider_id,
            payload: record.payload,
            format: record.format,
            fetched_at: Utc::now(),
            digest,
        });

        // Indexed before the shard lock is released so a `get` racing the
        // caller's enqueue always finds the version.
        self.write_index().insert(id, key);

        Ok(PutOutcome { id, is_new: true })
    }

    async fn get(&self, id: RawRecordId) -> Result<RawRecord, StoreError> {
        let key = self
            .read_index()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;

        let shard = self.lock_shard(&key);
        shard
            .get(&key)
            .and_then(|versions| versions.iter().find(|v| v.id == id))
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn versions(
        &self,
        source: &str,
        provider_id: &str,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let key = RecordKey {
            source: source.to_string(),
            provider_id: provider_id.to_string(),
        };
        let shard = self.lock_shard(&key);
        Ok(shard.get(&key).cloned().unwrap_or_default())
    }
}
