//! Block entity.
//!
//! A [`Block`] bundles the serializable fields ([`BlockData`]) with the
//! derived state: the canonical encoded bytes, the identifier computed
//! from them, and the lifecycle [`Status`]. Lifecycle transitions
//! (verify, accept, reject) are driven by the VM, which owns the store
//! and the daemon client; the block itself stays plain data addressed by
//! its identifier.

use crate::codec::{self, BlockData};
use crate::error::VmError;
use crate::types::{BlockId, Status};

/// A block on the chain.
///
/// Once constructed, the encoded bytes and the identifier are fixed; the
/// only mutable part is the status. `ID = BLAKE3(bytes)`, so any change
/// to the underlying fields would require building a new block.
#[derive(Clone, Debug)]
pub struct Block {
    data: BlockData,
    id: BlockId,
    bytes: Vec<u8>,
    status: Status,
}

impl Block {
    /// Builds a block from its fields, encoding it and deriving the
    /// identifier.
    pub fn new(data: BlockData, status: Status) -> Result<Self, VmError> {
        let bytes = codec::encode(&data)?;
        let id = BlockId::compute(&bytes);
        Ok(Block {
            data,
            id,
            bytes,
            status,
        })
    }

    /// Reconstructs a block from its canonical encoded bytes.
    pub fn from_bytes(bytes: Vec<u8>, status: Status) -> Result<Self, VmError> {
        let data = codec::decode(&bytes)?;
        let id = BlockId::compute(&bytes);
        Ok(Block {
            data,
            id,
            bytes,
            status,
        })
    }

    /// Constructs the genesis block: height 0, zero parent, empty
    /// payload, timestamp 0, no producing node.
    pub fn genesis() -> Result<Self, VmError> {
        Block::new(
            BlockData {
                parent_id: BlockId::EMPTY,
                height: 0,
                payload: Vec::new(),
                creation_timestamp: 0,
                producing_node: String::new(),
                daemon_hash: String::new(),
                daemon_parent_hash: String::new(),
            },
            Status::Processing,
        )
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn parent_id(&self) -> BlockId {
        self.data.parent_id
    }

    /// Height of this block. The genesis block has height 0.
    pub fn height(&self) -> u64 {
        self.data.height
    }

    /// Seconds since epoch as reported by the daemon; 0 for genesis.
    pub fn timestamp(&self) -> i64 {
        self.data.creation_timestamp
    }

    /// The daemon's serialized block, treated opaquely by the VM.
    pub fn payload(&self) -> &[u8] {
        &self.data.payload
    }

    /// Identity of the node that proposed this block, or empty.
    pub fn producing_node(&self) -> &str {
        &self.data.producing_node
    }

    pub fn daemon_hash(&self) -> &str {
        &self.data.daemon_hash
    }

    pub fn daemon_parent_hash(&self) -> &str {
        &self.data.daemon_parent_hash
    }

    /// Canonical encoded bytes (version tag included).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn is_genesis(&self) -> bool {
        self.data.height == 0
    }

    /// Checks the structural invariants that tie height, parent and
    /// payload together:
    ///
    /// `Height = 0 ⇔ ParentID = zero-ID ⇔ Payload empty`.
    pub fn check_well_formed(&self) -> Result<(), VmError> {
        if self.data.height == 0 {
            if !self.data.parent_id.is_empty() {
                return Err(VmError::Protocol(
                    "genesis block must have the zero parent id".to_string(),
                ));
            }
            if !self.data.payload.is_empty() {
                return Err(VmError::Protocol(
                    "genesis block must carry an empty payload".to_string(),
                ));
            }
        } else {
            if self.data.parent_id.is_empty() {
                return Err(VmError::Protocol(format!(
                    "block at height {} has the zero parent id",
                    self.data.height
                )));
            }
            if self.data.payload.is_empty() {
                return Err(VmError::Protocol(format!(
                    "block at height {} carries an empty payload",
                    self.data.height
                )));
            }
        }
        Ok(())
    }
}
