//! Chain VM plugin wrapping an external block-producing daemon.
//!
//! This crate provides the pieces a Snowman-style consensus host drives
//! through the block lifecycle:
//!
//! - strongly-typed identifiers and statuses (`types`),
//! - a deterministic block codec (`codec`) and the block entity
//!   (`block`),
//! - a namespaced persistent store with a versioned write overlay
//!   (`store`),
//! - the daemon capability boundary with live JSON-RPC and mock
//!   clients (`daemon`),
//! - the lifecycle orchestrator (`vm`),
//! - request handlers for the host's HTTP surface (`service`),
//! - and configuration plus process-wide options (`config`).
//!
//! The host calls into one [`Vm`] per chain, serialized behind its own
//! chain lock; everything here is written against that contract.

pub mod block;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod error;
pub mod host;
pub mod service;
pub mod store;
pub mod types;
pub mod vm;

// Re-export the error envelope and core domain types.
pub use error::{CLIENT_SIDE_ERROR, VmError};
pub use types::{BlockId, ID_LEN, Status};

// Re-export the block entity and its serializable fields.
pub use block::Block;
pub use codec::{BlockData, CODEC_VERSION, MAX_PAYLOAD_BYTES};

// Re-export the store and its engines.
pub use store::Store;
pub use store::kv::{KeyValue, MemoryKv, RocksKv};

// Re-export the daemon boundary.
pub use daemon::{
    DaemonBlock, DaemonClient, HttpDaemonClient, MockDaemonClient, RpcError, RpcRequest,
    RpcResponse, block_stream,
};

// Re-export host glue and configuration.
pub use config::{VmConfig, VmOptions};
pub use host::{AppSender, EngineMessage, NullAppSender, VmContext, engine_channel};

// Re-export the orchestrator and the service surface.
pub use service::Service;
pub use vm::{NAME, VERSION, Vm, VmState, version_string};
