//! Deterministic binary codec for block records.
//!
//! The wire format is a leading big-endian `u16` codec version followed
//! by the **bincode 2** encoding (`standard()` configuration, `serde`
//! integration) of the serializable block fields in fixed declaration
//! order. bincode's standard configuration is length-prefixed and has no
//! optional field omission, so identical field values always produce
//! byte-identical output. An absent daemon payload is encoded as an
//! empty byte sequence, never elided.

use serde::{Deserialize, Serialize};

use crate::error::VmError;
use crate::types::BlockId;

/// Current codec version. Bumped on any change to [`BlockData`] layout.
pub const CODEC_VERSION: u16 = 0;

/// Upper bound on the daemon payload carried by a single block.
pub const MAX_PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

/// Decode limit for a whole record: the payload bound plus generous
/// headroom for the fixed fields and the daemon hash strings.
const MAX_RECORD_BYTES: usize = MAX_PAYLOAD_BYTES + 4096;

/// The serializable fields of a block, in canonical order.
///
/// Everything else on a block (identifier, cached bytes, status) is
/// derived and never serialized.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    /// Identifier of the parent block; [`BlockId::EMPTY`] for genesis.
    pub parent_id: BlockId,
    /// Height of this block. The genesis block is at height 0.
    pub height: u64,
    /// Serialized block as produced by the external daemon. Empty only
    /// for genesis.
    pub payload: Vec<u8>,
    /// Seconds since epoch as reported by the daemon, 0 for genesis.
    pub creation_timestamp: i64,
    /// Identity of the node that built this block. Empty for genesis and
    /// for blocks ingested from the daemon's pre-existing history.
    pub producing_node: String,
    /// Daemon-side hash of the wrapped block, echoed for cross-checks.
    pub daemon_hash: String,
    /// Daemon-side hash of the wrapped block's parent.
    pub daemon_parent_hash: String,
}

/// Encodes a block record, refusing oversize payloads.
pub fn encode(data: &BlockData) -> Result<Vec<u8>, VmError> {
    if data.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(VmError::Codec(format!(
            "payload is {} bytes, exceeds the {MAX_PAYLOAD_BYTES} byte limit",
            data.payload.len()
        )));
    }

    let cfg = bincode::config::standard();
    let body = bincode::serde::encode_to_vec(data, cfg)
        .map_err(|e| VmError::Codec(format!("failed to encode block record: {e}")))?;

    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&CODEC_VERSION.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a block record, rejecting version mismatches, truncated or
/// trailing input, and oversize payloads.
pub fn decode(bytes: &[u8]) -> Result<BlockData, VmError> {
    if bytes.len() < 2 {
        return Err(VmError::Codec("truncated block record".to_string()));
    }

    let version = u16::from_be_bytes([bytes[0], bytes[1]]);
    if version != CODEC_VERSION {
        return Err(VmError::Codec(format!(
            "unsupported codec version {version}, expected {CODEC_VERSION}"
        )));
    }

    let cfg = bincode::config::standard().with_limit::<MAX_RECORD_BYTES>();
    let (data, read): (BlockData, usize) = bincode::serde::decode_from_slice(&bytes[2..], cfg)
        .map_err(|e| VmError::Codec(format!("failed to decode block record: {e}")))?;

    if read != bytes.len() - 2 {
        return Err(VmError::Codec(format!(
            "trailing garbage after block record: {} unread bytes",
            bytes.len() - 2 - read
        )));
    }
    if data.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(VmError::Codec(format!(
            "decoded payload is {} bytes, exceeds the {MAX_PAYLOAD_BYTES} byte limit",
            data.payload.len()
        )));
    }

    Ok(data)
}
