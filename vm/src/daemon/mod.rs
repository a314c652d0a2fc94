//! Capability boundary to the external block-producing daemon.
//!
//! This module defines:
//!
//! - the JSON-RPC request/response envelope shared by both client
//!   implementations,
//! - [`DaemonBlock`], the record describing one daemon-side block,
//! - the [`DaemonClient`] trait, and
//! - a lazy, bounded stream over the daemon's chain used for bulk
//!   ingest at first start.
//!
//! All client operations are synchronous and may block on network I/O;
//! the live implementation bounds every call with a request timeout.

pub mod http;
pub mod mock;

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, bounded};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::VmError;

pub use http::HttpDaemonClient;
pub use mock::MockDaemonClient;

/// Request identifier stamped on every call we originate.
pub const RPC_ID: &str = "zvm";

/// Depth of the bounded channel used by [`block_stream`].
const STREAM_DEPTH: usize = 16;

/// JSON-RPC request envelope.
///
/// `params` is either a JSON array (typed calls), a raw JSON value
/// (opaque forwarding such as `receivetx`), or absent.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub id: &'a str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a RawValue>,
}

/// Daemon-reported error payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// JSON-RPC response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Converts a daemon-reported error into [`VmError::Daemon`],
    /// otherwise hands back the (possibly null) result.
    pub fn into_result(self) -> Result<Option<Box<RawValue>>, VmError> {
        if let Some(err) = self.error {
            return Err(VmError::daemon_reported(err.code, err.message));
        }
        Ok(self.result)
    }
}

/// One block as described by the daemon: the opaque serialized payload
/// plus the metadata echoed alongside it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DaemonBlock {
    pub payload: Vec<u8>,
    pub timestamp: i64,
    pub hash: String,
    pub parent_hash: String,
}

/// Wire shape of a daemon block record, shared by `getserializedblock`
/// and `suggest` responses and by the mock's fixture files.
#[derive(Debug, Deserialize)]
struct WireBlock<'a> {
    #[serde(borrow)]
    block: &'a RawValue,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    hash: String,
    #[serde(default, rename = "parenthash")]
    parent_hash: String,
}

impl DaemonBlock {
    /// Parses a daemon block record from its JSON representation.
    pub fn from_wire_json(raw: &[u8]) -> Result<Self, VmError> {
        let wire: WireBlock<'_> = serde_json::from_slice(raw)
            .map_err(|e| VmError::daemon_client(format!("malformed daemon block record: {e}")))?;
        Ok(DaemonBlock {
            payload: wire.block.get().as_bytes().to_vec(),
            timestamp: wire.timestamp,
            hash: wire.hash,
            parent_hash: wire.parent_hash,
        })
    }
}

/// Capability interface over the external daemon.
///
/// Implementations must publish endpoint changes atomically so in-flight
/// calls observe a consistent host/port pair.
pub trait DaemonClient: Send + Sync {
    /// Re-points the live endpoint host. No-op on the mock.
    fn set_host(&self, host: &str);

    /// Re-points the live endpoint port. No-op on the mock.
    fn set_port(&self, port: u16);

    /// Current tip height on the daemon.
    fn get_block_count(&self) -> Result<u64, VmError>;

    /// Serialized block at `height` in the daemon's chain.
    fn get_block(&self, height: u64) -> Result<DaemonBlock, VmError>;

    /// Asks the daemon to mint a candidate next block (coinbase
    /// included). Idempotent within a short window.
    fn suggest_block(&self) -> Result<DaemonBlock, VmError>;

    /// Validates `payloads` as a contiguous chain extending the daemon's
    /// current tip. The list must be ordered oldest first.
    fn validate_blocks(&self, payloads: &[Vec<u8>]) -> Result<(), VmError>;

    /// Commits `payload` as the daemon's new tip. Callers must submit in
    /// ascending height order.
    fn submit_block(&self, payload: &[u8]) -> Result<(), VmError>;

    /// Constructs and broadcasts a value transfer, returning the opaque
    /// transaction bytes for gossip.
    fn send_value(&self, from: &str, to: &str, amount: f64) -> Result<Vec<u8>, VmError>;

    /// Catch-all for untyped forwarding (e.g. `receivetx`). The payload,
    /// when present, is passed through as the raw `params` value.
    fn call_raw(&self, method: &str, payload: Option<&[u8]>) -> Result<RpcResponse, VmError>;

    /// Catch-all for typed calls with a JSON array of parameters.
    fn call_json(
        &self,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<RpcResponse, VmError>;
}

/// Streams the daemon's blocks for heights `1..=count` through a bounded
/// channel fed by a producer thread.
///
/// The producer stops at the tip or on the first failure; an error is
/// delivered as the final item before the channel closes, so consumers
/// drain with a plain `for` loop and propagate the terminal `Err`.
pub fn block_stream(
    client: Arc<dyn DaemonClient>,
    count: u64,
) -> Receiver<Result<DaemonBlock, VmError>> {
    let (tx, rx) = bounded(STREAM_DEPTH);
    thread::spawn(move || {
        for height in 1..=count {
            match client.get_block(height) {
                Ok(block) => {
                    if tx.send(Ok(block)).is_err() {
                        // Consumer went away; nothing left to do.
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_block_parses_payload_and_metadata() {
        let raw = br#"{"block": {"tx": ["aa"]}, "timestamp": 1650000000, "hash": "0b", "parenthash": "0a"}"#;
        let block = DaemonBlock::from_wire_json(raw).expect("parse");
        assert_eq!(block.payload, br#"{"tx": ["aa"]}"#.to_vec());
        assert_eq!(block.timestamp, 1_650_000_000);
        assert_eq!(block.hash, "0b");
        assert_eq!(block.parent_hash, "0a");
    }

    #[test]
    fn wire_block_metadata_is_optional() {
        let raw = br#"{"block": {}}"#;
        let block = DaemonBlock::from_wire_json(raw).expect("parse");
        assert_eq!(block.timestamp, 0);
        assert!(block.hash.is_empty());
    }

    #[test]
    fn wire_block_without_payload_is_an_error() {
        assert!(DaemonBlock::from_wire_json(br#"{"timestamp": 3}"#).is_err());
        assert!(DaemonBlock::from_wire_json(b"not json").is_err());
    }

    #[test]
    fn response_with_error_becomes_daemon_error() {
        let resp: RpcResponse = serde_json::from_str(
            r#"{"id": "zvm", "result": null, "error": {"code": -8, "message": "bad params"}}"#,
        )
        .unwrap();
        match resp.into_result().unwrap_err() {
            VmError::Daemon { code, message } => {
                assert_eq!(code, -8);
                assert_eq!(message, "bad params");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn response_without_error_yields_result() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"id": "zvm", "result": {"x": 1}, "error": null}"#).unwrap();
        let result = resp.into_result().unwrap().expect("result present");
        assert_eq!(result.get(), r#"{"x": 1}"#);
    }

    #[test]
    fn block_stream_yields_fixture_blocks_in_order() {
        let client: Arc<dyn DaemonClient> = Arc::new(MockDaemonClient::new());
        let stream = block_stream(Arc::clone(&client), 15);

        let mut heights_seen = 0u64;
        for item in stream.iter() {
            let block = item.expect("mock blocks should stream cleanly");
            heights_seen += 1;
            assert_eq!(block, client.get_block(heights_seen).unwrap());
        }
        assert_eq!(heights_seen, 15);
    }

    #[test]
    fn block_stream_reports_an_error_as_the_final_item() {
        // Ask for one more block than the mock can serve.
        let client: Arc<dyn DaemonClient> = Arc::new(MockDaemonClient::new());
        let stream = block_stream(client, 16);

        let items: Vec<_> = stream.iter().collect();
        assert_eq!(items.len(), 16);
        assert!(items[..15].iter().all(|i| i.is_ok()));
        assert!(items[15].is_err());
    }

    #[test]
    fn empty_stream_closes_immediately() {
        let client: Arc<dyn DaemonClient> = Arc::new(MockDaemonClient::new());
        let stream = block_stream(client, 0);
        assert!(stream.iter().next().is_none());
    }
}
