//! Byte-budgeted LRU block cache for on-disk data and index blocks.

use std::{
    hash::{BuildHasher, RandomState},
    num::NonZeroUsize,
    sync::Arc,
};

use lru::LruCache;
use parking_lot::Mutex;

use crate::files::FileRef;

const SHARDS: usize = 8;

/// Key of one cached block: the file it came from plus its offset.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BlockKey {
    /// File the block belongs to.
    pub file: FileRef,
    /// Byte offset of the block within the file.
    pub offset: u64,
}

/// Sharded LRU cache of fixed-size blocks.
///
/// The capacity is a byte budget; each shard holds up to
/// `capacity / block_size / shards` entries. Contention is spread across
/// shard mutexes keyed by the block hash.
pub struct BlockCache {
    shards: Vec<Mutex<LruCache<BlockKey, Arc<[u8]>>>>,
    hasher: RandomState,
    capacity: u64,
    block_size: u64,
}

impl BlockCache {
    /// Build a cache with a total byte budget and the expected block size.
    pub fn new(capacity: u64, block_size: u64) -> Self {
        let per_shard = (capacity / block_size.max(1) / SHARDS as u64).max(1) as usize;
        let mut shards = Vec::with_capacity(SHARDS);
        for _ in 0..SHARDS {
            shards.push(Mutex::new(LruCache::new(
                NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN),
            )));
        }
        Self {
            shards,
            hasher: RandomState::new(),
            capacity,
            block_size,
        }
    }

    /// Look up a block, refreshing its recency.
    pub fn get(&self, key: &BlockKey) -> Option<Arc<[u8]>> {
        self.shard(key).lock().get(key).cloned()
    }

    /// Insert a block, evicting the least recently used entry of the shard
    /// when full.
    pub fn put(&self, key: BlockKey, block: Arc<[u8]>) {
        self.shard(&key).lock().put(key, block);
    }

    /// Configured byte budget.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Expected block size used to derive entry counts.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn shard(&self, key: &BlockKey) -> &Mutex<LruCache<BlockKey, Arc<[u8]>>> {
        let pos = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[pos]
    }
}
