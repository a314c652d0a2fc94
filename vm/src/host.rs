//! Glue types at the boundary between the VM and its consensus host.
//!
//! The host drives every VM entry point; the VM talks back through two
//! narrow channels: a bounded message channel to the consensus engine
//! ("a block is ready, come build it") and an [`AppSender`] for gossiping
//! opaque bytes to peers. Both are injected at initialization so tests
//! can observe them directly.

use crossbeam_channel::bounded;
pub use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::VmError;

/// Messages the VM sends to the consensus engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineMessage {
    /// Pending work exists; the engine should ask for a block.
    PendingTxs,
}

/// Creates the engine notification channel.
///
/// Depth one is deliberate: the notification is a level trigger, not a
/// queue. If the engine has not consumed the previous signal the VM
/// drops the new one and the engine catches up on its next iteration.
pub fn engine_channel() -> (Sender<EngineMessage>, Receiver<EngineMessage>) {
    bounded(1)
}

/// Host-provided capability for gossiping bytes to peers.
pub trait AppSender: Send + Sync {
    fn send_app_gossip(&self, msg: Vec<u8>) -> Result<(), VmError>;
}

/// Sender that drops everything. Used by single-node runs and tests.
pub struct NullAppSender;

impl AppSender for NullAppSender {
    fn send_app_gossip(&self, _msg: Vec<u8>) -> Result<(), VmError> {
        Ok(())
    }
}

/// Identity of this chain instance, assigned by the host.
#[derive(Clone, Debug)]
pub struct VmContext {
    /// Identifier of the chain this VM instance runs.
    pub chain_id: String,
    /// Identity of this node, stamped onto locally built blocks.
    pub node_id: String,
}

impl VmContext {
    pub fn new(chain_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        VmContext {
            chain_id: chain_id.into(),
            node_id: node_id.into(),
        }
    }
}
