//! In-memory mock of the daemon client.
//!
//! Serves a fixed initial chain from fixture files packaged into the
//! binary, so tests and local simulations are deterministic without a
//! running daemon. Mutating operations (`validate_blocks`,
//! `submit_block`) succeed and do nothing; operations that would need a
//! real daemon to produce data (`suggest_block`, `send_value`) report a
//! descriptive error.

use super::{DaemonBlock, DaemonClient, RPC_ID, RpcError, RpcResponse};
use crate::error::{CLIENT_SIDE_ERROR, VmError};

/// Height of the fixture chain's tip.
pub const DEFAULT_INITIAL_BLOCKS: u64 = 15;

/// Fixture records for daemon heights 1..=15, oldest first. Each file is
/// a full daemon block record: payload plus timestamp/hash/parenthash.
const FIXTURE_BLOCKS: [&str; DEFAULT_INITIAL_BLOCKS as usize] = [
    include_str!("../../fixtures/block1.json"),
    include_str!("../../fixtures/block2.json"),
    include_str!("../../fixtures/block3.json"),
    include_str!("../../fixtures/block4.json"),
    include_str!("../../fixtures/block5.json"),
    include_str!("../../fixtures/block6.json"),
    include_str!("../../fixtures/block7.json"),
    include_str!("../../fixtures/block8.json"),
    include_str!("../../fixtures/block9.json"),
    include_str!("../../fixtures/block10.json"),
    include_str!("../../fixtures/block11.json"),
    include_str!("../../fixtures/block12.json"),
    include_str!("../../fixtures/block13.json"),
    include_str!("../../fixtures/block14.json"),
    include_str!("../../fixtures/block15.json"),
];

pub struct MockDaemonClient {
    initial_blocks: u64,
}

impl MockDaemonClient {
    /// Mock serving the full fixture chain.
    pub fn new() -> Self {
        MockDaemonClient {
            initial_blocks: DEFAULT_INITIAL_BLOCKS,
        }
    }

    /// Mock serving only the first `count` fixture blocks. `count` is
    /// capped at the number of packaged fixtures.
    pub fn with_initial_blocks(count: u64) -> Self {
        MockDaemonClient {
            initial_blocks: count.min(DEFAULT_INITIAL_BLOCKS),
        }
    }

    fn ignored(&self, what: &str) -> RpcResponse {
        tracing::warn!(call = what, "mock daemon ignoring call");
        RpcResponse {
            id: Some(RPC_ID.to_string()),
            result: None,
            error: Some(RpcError {
                code: CLIENT_SIDE_ERROR,
                message: format!("mock daemon ignores {what}"),
            }),
        }
    }
}

impl Default for MockDaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient for MockDaemonClient {
    fn set_host(&self, host: &str) {
        tracing::warn!(host, "set_host on mock daemon client is a no-op");
    }

    fn set_port(&self, port: u16) {
        tracing::warn!(port, "set_port on mock daemon client is a no-op");
    }

    fn get_block_count(&self) -> Result<u64, VmError> {
        Ok(self.initial_blocks)
    }

    fn get_block(&self, height: u64) -> Result<DaemonBlock, VmError> {
        if height == 0 || height > self.initial_blocks {
            return Err(VmError::daemon_client(format!(
                "mock daemon has no block at height {height}"
            )));
        }
        DaemonBlock::from_wire_json(FIXTURE_BLOCKS[(height - 1) as usize].as_bytes())
    }

    fn suggest_block(&self) -> Result<DaemonBlock, VmError> {
        Err(VmError::daemon_client(
            "mock daemon cannot suggest candidate blocks",
        ))
    }

    fn validate_blocks(&self, payloads: &[Vec<u8>]) -> Result<(), VmError> {
        tracing::debug!(
            batch = payloads.len(),
            "mock daemon treating block batch as valid"
        );
        Ok(())
    }

    fn submit_block(&self, _payload: &[u8]) -> Result<(), VmError> {
        tracing::debug!("mock daemon accepting submitted block");
        Ok(())
    }

    fn send_value(&self, _from: &str, _to: &str, _amount: f64) -> Result<Vec<u8>, VmError> {
        Err(VmError::daemon_client(
            "mock daemon cannot construct transactions",
        ))
    }

    fn call_raw(&self, method: &str, _payload: Option<&[u8]>) -> Result<RpcResponse, VmError> {
        Ok(self.ignored(method))
    }

    fn call_json(
        &self,
        method: &str,
        _params: &[serde_json::Value],
    ) -> Result<RpcResponse, VmError> {
        Ok(self.ignored(method))
    }
}
