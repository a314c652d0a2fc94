//! Persistent state for the chain.
//!
//! Three logical namespaces live in one sorted key-value engine, keyed
//! by static prefixes under the chain identifier:
//!
//! - `<chainID>-block/<ID>`: serialized block record (`bytes || status`),
//! - `<chainID>-singleton/…`: the one-way `initialized` latch and the
//!   `lastAccepted` pointer,
//! - `<chainID>-height/…`: big-endian `u64` height → accepted block ID,
//!   plus the reserved `fork` and `checkpoint` keys of the host's
//!   height-indexing contract.
//!
//! All writes go through the versioned overlay; nothing is durable until
//! [`Store::commit`]. Height lookups are fronted by an internally
//! synchronized LRU.

pub mod kv;
pub mod versioned;

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::block::Block;
use crate::error::VmError;
use crate::types::{BlockId, Status};
use kv::KeyValue;
use versioned::Versioned;

/// Capacity of the height → block ID cache.
pub const HEIGHT_CACHE_SIZE: usize = 8192;

const BLOCK_PREFIX: &str = "block";
const SINGLETON_PREFIX: &str = "singleton";
const HEIGHT_PREFIX: &str = "height";

const INITIALIZED_KEY: &[u8] = b"initialized";
const LAST_ACCEPTED_KEY: &[u8] = b"lastAccepted";
const FORK_KEY: &[u8] = b"fork";
const CHECKPOINT_KEY: &[u8] = b"checkpoint";

fn prefixed(chain_id: &str, namespace: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(chain_id.len() + namespace.len() + 2 + suffix.len());
    key.extend_from_slice(chain_id.as_bytes());
    key.push(b'-');
    key.extend_from_slice(namespace.as_bytes());
    key.push(b'/');
    key.extend_from_slice(suffix);
    key
}

pub struct Store {
    chain_id: String,
    versioned: Versioned,
    height_cache: Mutex<LruCache<u64, BlockId>>,
}

impl Store {
    pub fn new(chain_id: impl Into<String>, engine: Box<dyn KeyValue>) -> Self {
        let capacity =
            NonZeroUsize::new(HEIGHT_CACHE_SIZE).expect("height cache capacity is non-zero");
        Store {
            chain_id: chain_id.into(),
            versioned: Versioned::new(engine),
            height_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn block_key(&self, id: &BlockId) -> Vec<u8> {
        prefixed(&self.chain_id, BLOCK_PREFIX, id.as_bytes())
    }

    fn singleton_key(&self, name: &[u8]) -> Vec<u8> {
        prefixed(&self.chain_id, SINGLETON_PREFIX, name)
    }

    fn height_key(&self, height: u64) -> Vec<u8> {
        prefixed(&self.chain_id, HEIGHT_PREFIX, &height.to_be_bytes())
    }

    fn metadata_key(&self, name: &[u8]) -> Vec<u8> {
        prefixed(&self.chain_id, HEIGHT_PREFIX, name)
    }

    /// Stages a block record. An `Accepted` block additionally updates
    /// the height index, so the two namespaces stay consistent within
    /// the overlay.
    pub fn put_block(&mut self, block: &Block) -> Result<(), VmError> {
        let mut record = block.bytes().to_vec();
        record.push(block.status().to_byte());
        self.versioned.put(self.block_key(&block.id()), record);

        if block.status() == Status::Accepted {
            self.set_block_id_at_height(block.height(), block.id());
        }
        Ok(())
    }

    /// Loads a block record, reconstructing its status from the trailing
    /// byte.
    pub fn get_block(&self, id: &BlockId) -> Result<Block, VmError> {
        let record = self
            .versioned
            .get(&self.block_key(id))?
            .ok_or(VmError::NotFound("block"))?;
        let (bytes, status_byte) = match record.split_last() {
            Some((last, rest)) => (rest.to_vec(), *last),
            None => {
                return Err(VmError::Codec("empty block record".to_string()));
            }
        };
        Block::from_bytes(bytes, Status::from_byte(status_byte)?)
    }

    pub fn has_block(&self, id: &BlockId) -> Result<bool, VmError> {
        Ok(self.versioned.get(&self.block_key(id))?.is_some())
    }

    /// Looks up the accepted block at `height`, serving from the LRU
    /// before touching the height namespace.
    pub fn get_block_id_at_height(&self, height: u64) -> Result<BlockId, VmError> {
        {
            let mut cache = self.height_cache.lock().expect("height cache lock poisoned");
            if let Some(id) = cache.get(&height) {
                return Ok(*id);
            }
        }

        let bytes = self
            .versioned
            .get(&self.height_key(height))?
            .ok_or(VmError::NotFound("height"))?;
        let id = BlockId::from_slice(&bytes)?;

        let mut cache = self.height_cache.lock().expect("height cache lock poisoned");
        cache.put(height, id);
        Ok(id)
    }

    fn set_block_id_at_height(&mut self, height: u64, id: BlockId) {
        {
            let mut cache = self.height_cache.lock().expect("height cache lock poisoned");
            cache.put(height, id);
        }
        self.versioned
            .put(self.height_key(height), id.as_bytes().to_vec());
    }

    /// Removes a height-index entry (and the checkpoint, which can only
    /// refer to a block that is still indexed). Used when the catch-up
    /// path truncates the accepted chain.
    pub fn delete_block_id_at_height(&mut self, height: u64) -> Result<(), VmError> {
        {
            let mut cache = self.height_cache.lock().expect("height cache lock poisoned");
            cache.pop(&height);
        }
        self.versioned.delete(self.height_key(height));
        self.versioned.delete(self.metadata_key(CHECKPOINT_KEY));
        Ok(())
    }

    pub fn get_last_accepted(&self) -> Result<BlockId, VmError> {
        let bytes = self
            .versioned
            .get(&self.singleton_key(LAST_ACCEPTED_KEY))?
            .ok_or(VmError::NotFound("lastAccepted"))?;
        BlockId::from_slice(&bytes)
    }

    pub fn set_last_accepted(&mut self, id: BlockId) {
        self.versioned
            .put(self.singleton_key(LAST_ACCEPTED_KEY), id.as_bytes().to_vec());
    }

    pub fn is_initialized(&self) -> Result<bool, VmError> {
        Ok(self
            .versioned
            .get(&self.singleton_key(INITIALIZED_KEY))?
            .is_some())
    }

    /// One-way latch: once set, a restart takes the already-initialized
    /// path.
    pub fn set_initialized(&mut self) {
        self.versioned
            .put(self.singleton_key(INITIALIZED_KEY), vec![1u8]);
    }

    pub fn get_fork_height(&self) -> Result<u64, VmError> {
        let bytes = self
            .versioned
            .get(&self.metadata_key(FORK_KEY))?
            .ok_or(VmError::NotFound("fork"))?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| VmError::Codec("fork height must be 8 bytes".to_string()))?;
        Ok(u64::from_be_bytes(arr))
    }

    pub fn set_fork_height(&mut self, height: u64) {
        self.versioned
            .put(self.metadata_key(FORK_KEY), height.to_be_bytes().to_vec());
    }

    pub fn get_checkpoint(&self) -> Result<BlockId, VmError> {
        let bytes = self
            .versioned
            .get(&self.metadata_key(CHECKPOINT_KEY))?
            .ok_or(VmError::NotFound("checkpoint"))?;
        BlockId::from_slice(&bytes)
    }

    pub fn set_checkpoint(&mut self, id: BlockId) {
        self.versioned
            .put(self.metadata_key(CHECKPOINT_KEY), id.as_bytes().to_vec());
    }

    /// Applies every staged mutation as one atomic batch.
    pub fn commit(&mut self) -> Result<(), VmError> {
        self.versioned.commit()
    }

    /// Drops any uncommitted overlay state. Called on shutdown.
    pub fn close(&mut self) {
        self.versioned.discard();
    }

    /// Deletes every key as a single atomic batch and flushes the cache.
    pub fn clear_state(&mut self) -> Result<(), VmError> {
        for key in self.versioned.keys()? {
            self.versioned.delete(key);
        }
        self.versioned.commit()?;
        let mut cache = self.height_cache.lock().expect("height cache lock poisoned");
        cache.clear();
        Ok(())
    }
}
