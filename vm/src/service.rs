//! Request handlers exposed over the host's HTTP/JSON surface.
//!
//! The host owns transport and authentication; this module only maps
//! JSON requests onto VM operations and back. A request names a method
//! and carries a JSON params object; [`Service::dispatch`] routes it.
//! Every failure surfaces as a human-readable message.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use tracing::{info, warn};

use crate::daemon::RpcResponse;
use crate::error::VmError;
use crate::types::BlockId;
use crate::vm::Vm;

/// Read/admin surface over a VM. Holds the VM borrow for the duration
/// of one request; the host's per-chain lock serializes requests.
pub struct Service<'a> {
    vm: &'a mut Vm,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetBlockArgs {
    /// Hex identifier of the block to fetch.
    pub id: Option<String>,
    /// Accepted height to fetch instead.
    pub height: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GetBlockReply {
    pub id: String,
    #[serde(rename = "parentID")]
    pub parent_id: String,
    pub timestamp: i64,
    #[serde(rename = "producingNode")]
    pub producing_node: String,
    /// The daemon payload as raw JSON; absent for genesis.
    pub data: Option<Box<RawValue>>,
}

#[derive(Debug, Serialize)]
pub struct GetBlockCountReply {
    pub blocks: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubmitTxArgs {
    pub from: String,
    pub to: String,
    pub amount: f64,
}

#[derive(Debug, Serialize)]
pub struct SubmitTxReply {
    #[serde(rename = "submittedTx")]
    pub submitted_tx: Box<RawValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawDaemonCallArgs {
    pub method: String,
    pub params: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct IsChainEnabledReply {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AssociateDaemonHostPortArgs {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
pub struct SuccessReply {
    pub success: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeBlockCountsArgs {
    pub from_height: Option<u64>,
    pub to_height: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct NodeBlockCountsReply {
    pub counts: std::collections::BTreeMap<String, u64>,
}

fn parse_args<T: DeserializeOwned + Default>(params: serde_json::Value) -> Result<T, VmError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params)
        .map_err(|e| VmError::Config(format!("invalid request arguments: {e}")))
}

fn to_json<T: Serialize>(reply: T) -> Result<serde_json::Value, VmError> {
    serde_json::to_value(reply)
        .map_err(|e| VmError::Codec(format!("failed to encode reply: {e}")))
}

impl<'a> Service<'a> {
    pub fn new(vm: &'a mut Vm) -> Self {
        Service { vm }
    }

    /// Routes one request by method name. Unknown methods fail with a
    /// descriptive message.
    pub fn dispatch(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, VmError> {
        match method {
            "getBlock" => to_json(self.get_block(parse_args(params)?)?),
            "getBlockCount" => to_json(self.get_block_count()?),
            "submitTx" => to_json(self.submit_tx(parse_args(params)?)?),
            "rawDaemonCall" => to_json(self.raw_daemon_call(parse_args(params)?)?),
            "isChainEnabled" => to_json(self.is_chain_enabled()),
            "associateDaemonHostPort" => {
                to_json(self.associate_daemon_host_port(parse_args(params)?))
            }
            "mineBlock" => to_json(self.mine_block()?),
            "nodeBlockCounts" => to_json(self.node_block_counts(parse_args(params)?)?),
            other => Err(VmError::Protocol(format!(
                "unknown service method {other}"
            ))),
        }
    }

    /// Fetches a block by identifier or accepted height. One of the two
    /// must be supplied.
    pub fn get_block(&mut self, args: GetBlockArgs) -> Result<GetBlockReply, VmError> {
        let id = match (&args.id, args.height) {
            (Some(hex_id), _) => BlockId::from_hex(hex_id)?,
            (None, Some(height)) => self.vm.get_block_id_at_height(height)?,
            (None, None) => {
                return Err(VmError::Config(
                    "either id or height is required".to_string(),
                ));
            }
        };

        let block = self.vm.get_block(&id)?;
        let data = if block.payload().is_empty() {
            None
        } else {
            let text = String::from_utf8(block.payload().to_vec())
                .map_err(|e| VmError::Codec(format!("stored payload is not UTF-8: {e}")))?;
            Some(
                RawValue::from_string(text)
                    .map_err(|e| VmError::Codec(format!("stored payload is not JSON: {e}")))?,
            )
        };

        Ok(GetBlockReply {
            id: block.id().to_string(),
            parent_id: block.parent_id().to_string(),
            timestamp: block.timestamp(),
            producing_node: block.producing_node().to_string(),
            data,
        })
    }

    /// Height of the last accepted block.
    pub fn get_block_count(&mut self) -> Result<GetBlockCountReply, VmError> {
        let tip = self.vm.last_accepted_block()?;
        Ok(GetBlockCountReply {
            blocks: tip.height(),
        })
    }

    /// Builds a value transfer through the daemon, gossips the returned
    /// transaction bytes to peers, and signals the engine.
    pub fn submit_tx(&mut self, args: SubmitTxArgs) -> Result<SubmitTxReply, VmError> {
        info!(from = %args.from, to = %args.to, amount = args.amount, "submitting transaction");
        let tx_bytes = self
            .vm
            .daemon()
            .send_value(&args.from, &args.to, args.amount)?;

        if let Err(e) = self.vm.app_sender().send_app_gossip(tx_bytes.clone()) {
            warn!(error = %e, "failed to gossip transaction");
        }
        self.vm.notify_block_ready();

        let text = String::from_utf8(tx_bytes)
            .map_err(|e| VmError::Codec(format!("daemon returned non-UTF-8 tx: {e}")))?;
        let submitted_tx = RawValue::from_string(text)
            .map_err(|e| VmError::Codec(format!("daemon returned non-JSON tx: {e}")))?;
        Ok(SubmitTxReply { submitted_tx })
    }

    /// Untyped passthrough to the daemon RPC.
    pub fn raw_daemon_call(&mut self, args: RawDaemonCallArgs) -> Result<RpcResponse, VmError> {
        info!(method = %args.method, "raw daemon call");
        self.vm.daemon().call_json(&args.method, &args.params)
    }

    pub fn is_chain_enabled(&mut self) -> IsChainEnabledReply {
        IsChainEnabledReply {
            enabled: self.vm.is_enabled(),
        }
    }

    /// Hot-reconfigures the live client endpoint. Needed when several
    /// daemon instances share one machine. No-op on the mock.
    pub fn associate_daemon_host_port(
        &mut self,
        args: AssociateDaemonHostPortArgs,
    ) -> SuccessReply {
        info!(host = %args.host, port = args.port, "associating daemon host/port");
        self.vm.daemon().set_host(&args.host);
        self.vm.daemon().set_port(args.port);
        SuccessReply { success: true }
    }

    /// Asks the engine to build a block so the daemon can reap coinbase
    /// rewards. Testnet only.
    pub fn mine_block(&mut self) -> Result<SuccessReply, VmError> {
        if !self.vm.options().test_net {
            return Err(VmError::Config(
                "mineBlock can only be used on testnet".to_string(),
            ));
        }
        info!("mine block requested, signalling the engine");
        self.vm.notify_block_ready();
        Ok(SuccessReply { success: true })
    }

    /// Tallies accepted blocks per producing node over `[from, to)`.
    pub fn node_block_counts(
        &mut self,
        args: NodeBlockCountsArgs,
    ) -> Result<NodeBlockCountsReply, VmError> {
        let counts = self
            .vm
            .node_block_counts(args.from_height, args.to_height)?;
        Ok(NodeBlockCountsReply { counts })
    }
}
