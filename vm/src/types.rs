//! Core domain types shared across the chain plugin.
//!
//! This module defines the strongly-typed block identifier and the block
//! status enumeration. The goal is to avoid "naked" byte buffers in
//! public APIs and instead use domain-specific newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::VmError;

/// Length in bytes of a block identifier.
pub const ID_LEN: usize = 32;

/// Strongly-typed 32-byte block identifier.
///
/// A block's identifier is the BLAKE3-256 digest of its serialized bytes,
/// so it is stable once the block has been encoded. The all-zero value is
/// reserved as the parent of the genesis block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub [u8; ID_LEN]);

impl BlockId {
    /// The zero identifier, used as the genesis block's parent.
    pub const EMPTY: BlockId = BlockId([0u8; ID_LEN]);

    /// Computes a new [`BlockId`] as the BLAKE3-256 hash of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let h = blake3::hash(data);
        BlockId(*h.as_bytes())
    }

    /// Returns the underlying 32 bytes as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Reconstructs an identifier from a raw slice, failing on any length
    /// other than [`ID_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, VmError> {
        if bytes.len() != ID_LEN {
            return Err(VmError::Codec(format!(
                "block id must be {ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(bytes);
        Ok(BlockId(arr))
    }

    /// Parses an identifier from its lowercase hex representation.
    pub fn from_hex(s: &str) -> Result<Self, VmError> {
        let bytes = hex::decode(s)
            .map_err(|e| VmError::Codec(format!("block id is not valid hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Returns `true` for the reserved all-zero identifier.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Lifecycle status of a block.
///
/// `Accepted` and `Rejected` are terminal. `Verified` blocks live in the
/// VM's in-memory verified set until they transition terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Status {
    Processing,
    Verified,
    Accepted,
    Rejected,
}

impl Status {
    /// Packs the status into the single byte appended to persisted block
    /// records.
    pub fn to_byte(self) -> u8 {
        match self {
            Status::Processing => 0,
            Status::Verified => 1,
            Status::Accepted => 2,
            Status::Rejected => 3,
        }
    }

    /// Unpacks a status byte, rejecting unknown values.
    pub fn from_byte(b: u8) -> Result<Self, VmError> {
        match b {
            0 => Ok(Status::Processing),
            1 => Ok(Status::Verified),
            2 => Ok(Status::Accepted),
            3 => Ok(Status::Rejected),
            other => Err(VmError::Codec(format!("unknown status byte {other}"))),
        }
    }

    /// Returns `true` once the block has reached a terminal status.
    pub fn is_decided(self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Processing => "Processing",
            Status::Verified => "Verified",
            Status::Accepted => "Accepted",
            Status::Rejected => "Rejected",
        };
        f.write_str(s)
    }
}
