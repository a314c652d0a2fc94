//! Lifecycle orchestrator for the chain.
//!
//! The consensus host drives this type through a serialized, per-chain
//! sequence of calls: initialize once, then repeated build / parse /
//! verify / accept / reject / set-preference. The VM owns the [`Store`]
//! and a [`DaemonClient`]; verification asks the daemon to validate a
//! contiguous batch of not-yet-accepted payloads, acceptance submits the
//! payload as the daemon's new tip.
//!
//! Blocks that passed verification but are not yet decided live in an
//! in-memory map keyed by identifier. Lifecycle transitions are VM
//! methods, so a block never holds a pointer back into the VM.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::block::Block;
use crate::codec::BlockData;
use crate::config::{VmConfig, VmOptions};
use crate::daemon::{self, DaemonBlock, DaemonClient};
use crate::error::VmError;
use crate::host::{AppSender, EngineMessage, Sender, VmContext};
use crate::store::Store;
use crate::store::kv::KeyValue;
use crate::types::{BlockId, Status};

/// Plugin name, as reported by `--version`.
pub const NAME: &str = "zvm";

/// Plugin version, as reported by `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The `<name>@<version>` string printed by the binary.
pub fn version_string() -> String {
    format!("{NAME}@{VERSION}")
}

/// States the host can move the VM through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmState {
    Bootstrapping,
    NormalOp,
}

pub struct Vm {
    ctx: VmContext,
    options: VmOptions,
    config: VmConfig,
    store: Store,
    daemon: Arc<dyn DaemonClient>,

    /// Blocks that passed verification but are not yet accepted or
    /// rejected, keyed by identifier.
    verified: HashMap<BlockId, Block>,

    /// Identifier of the preferred block, the tip candidate for the next
    /// locally built block.
    preferred: BlockId,

    to_engine: Sender<EngineMessage>,
    app_sender: Arc<dyn AppSender>,
    bootstrapped: AtomicBool,
}

impl Vm {
    /// Initializes the VM over the given database, resolving the daemon
    /// client from the config. Any failure is surfaced to the host;
    /// there is no partial operation.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        ctx: VmContext,
        engine: Box<dyn KeyValue>,
        _genesis_bytes: &[u8],
        _upgrade_bytes: &[u8],
        config_bytes: &[u8],
        to_engine: Sender<EngineMessage>,
        app_sender: Arc<dyn AppSender>,
        options: VmOptions,
    ) -> Result<Vm, VmError> {
        let config = VmConfig::from_json(config_bytes);
        let daemon = config.daemon_client(&ctx.node_id, &options)?;
        Self::initialize_with_client(ctx, engine, config, daemon, to_engine, app_sender, options)
    }

    /// Lower-level constructor taking an already-resolved daemon client.
    /// Embedders and tests use this to supply their own client.
    pub fn initialize_with_client(
        ctx: VmContext,
        engine: Box<dyn KeyValue>,
        config: VmConfig,
        daemon: Arc<dyn DaemonClient>,
        to_engine: Sender<EngineMessage>,
        app_sender: Arc<dyn AppSender>,
        options: VmOptions,
    ) -> Result<Vm, VmError> {
        info!(
            version = %version_string(),
            chain = %ctx.chain_id,
            node = %ctx.node_id,
            "initializing chain VM"
        );

        if options.is_chain_disabled(&ctx.chain_id) {
            return Err(VmError::Config(format!(
                "chain {} is disabled",
                ctx.chain_id
            )));
        }
        if !config.enabled {
            return Err(VmError::Config(format!(
                "chain {} is not enabled",
                ctx.chain_id
            )));
        }

        let mut store = Store::new(ctx.chain_id.clone(), engine);
        if config.clear_database {
            info!("clearing database before initializing");
            store.clear_state()?;
        }

        let mut vm = Vm {
            ctx,
            options,
            config,
            store,
            daemon,
            verified: HashMap::new(),
            preferred: BlockId::EMPTY,
            to_engine,
            app_sender,
            bootstrapped: AtomicBool::new(false),
        };
        vm.init_and_sync()?;
        info!("finished initialization");
        Ok(vm)
    }

    // ------------------------------------------------------------------
    // Host surface
    // ------------------------------------------------------------------

    /// Builds, verifies and returns a locally proposed block on top of
    /// the preferred block.
    pub fn build_block(&mut self) -> Result<Block, VmError> {
        info!("building and proposing block for consensus");
        let suggestion = self.daemon.suggest_block()?;

        let preferred = self.get_block(&self.preferred)?;
        let mut block = self.new_block(
            preferred.id(),
            preferred.height() + 1,
            suggestion,
            true,
        )?;

        self.verify_block(&mut block)?;
        Ok(block)
    }

    /// Decodes `bytes` into a block. If the identifier is already known
    /// (verified or stored), the existing instance is returned with its
    /// up-to-date status.
    pub fn parse_block(&mut self, bytes: &[u8]) -> Result<Block, VmError> {
        let block = Block::from_bytes(bytes.to_vec(), Status::Processing)?;
        match self.get_block(&block.id()) {
            Ok(existing) => {
                debug!(id = %existing.id(), "parsed an already-known block");
                Ok(existing)
            }
            Err(e) if e.is_not_found() => Ok(block),
            Err(e) => Err(e),
        }
    }

    /// Looks a block up by identifier: the in-memory verified set first,
    /// then the store.
    pub fn get_block(&self, id: &BlockId) -> Result<Block, VmError> {
        if let Some(block) = self.verified.get(id) {
            return Ok(block.clone());
        }
        self.store.get_block(id)
    }

    /// Admits `block` to the verified set after validating its whole
    /// unaccepted ancestry against the daemon.
    ///
    /// Calling this twice for the same block is a no-op returning
    /// success.
    pub fn verify_block(&mut self, block: &mut Block) -> Result<(), VmError> {
        if self.verified.contains_key(&block.id()) {
            debug!(id = %block.id(), "block already verified");
            block.set_status(Status::Verified);
            return Ok(());
        }

        block.check_well_formed()?;

        if block.height() > 0 {
            let payloads = self.collect_chain_payloads(block)?;
            self.daemon.validate_blocks(&payloads)?;
        }

        block.set_status(Status::Verified);
        self.verified.insert(block.id(), block.clone());
        debug!(id = %block.id(), height = block.height(), "verified block");
        Ok(())
    }

    /// Accepts `block`: submits its payload to the daemon, persists it,
    /// updates the height index and the last-accepted pointer, and
    /// commits.
    ///
    /// A daemon error is fatal to the operation; the host retries on the
    /// same block (submission is idempotent on the daemon side).
    pub fn accept_block(&mut self, block: &mut Block) -> Result<(), VmError> {
        info!(id = %block.id(), height = block.height(), "accepting block");

        if block.height() > 0 {
            self.daemon.submit_block(block.payload())?;
        }

        block.set_status(Status::Accepted);
        self.store.put_block(block)?;
        self.store.set_last_accepted(block.id());
        self.verified.remove(&block.id());
        self.store.commit()
    }

    /// Rejects `block`, persisting the terminal status. The daemon is
    /// not notified; it reorganizes on its own at the next accepted
    /// chain.
    pub fn reject_block(&mut self, block: &mut Block) -> Result<(), VmError> {
        info!(id = %block.id(), height = block.height(), "rejecting block");

        block.set_status(Status::Rejected);
        self.store.put_block(block)?;
        self.verified.remove(&block.id());
        self.store.commit()
    }

    /// Records `id` as the tip candidate for future [`Vm::build_block`]
    /// calls. Not persisted.
    pub fn set_preference(&mut self, id: BlockId) {
        debug!(%id, "setting preference");
        self.preferred = id;
    }

    pub fn preferred(&self) -> BlockId {
        self.preferred
    }

    pub fn last_accepted(&self) -> Result<BlockId, VmError> {
        self.store.get_last_accepted()
    }

    pub fn last_accepted_block(&self) -> Result<Block, VmError> {
        let id = self.last_accepted()?;
        self.get_block(&id)
    }

    pub fn get_block_id_at_height(&self, height: u64) -> Result<BlockId, VmError> {
        self.store.get_block_id_at_height(height)
    }

    pub fn get_block_at_height(&self, height: u64) -> Result<Block, VmError> {
        let id = self.store.get_block_id_at_height(height)?;
        self.get_block(&id)
    }

    /// Forwards gossiped bytes to the daemon and signals the engine.
    /// Daemon failures are logged, never surfaced: gossip is best
    /// effort.
    pub fn app_gossip(&self, from_node: &str, msg: Option<&[u8]>) {
        let Some(msg) = msg else {
            return;
        };
        if msg.is_empty() {
            return;
        }
        debug!(from_node, bytes = msg.len(), "received app gossip");

        match self.daemon.call_raw("receivetx", Some(msg)) {
            Ok(resp) => {
                if let Some(err) = resp.error {
                    warn!(code = err.code, message = %err.message, "daemon refused gossiped tx");
                }
            }
            Err(e) => warn!(error = %e, "failed to forward gossiped tx to daemon"),
        }

        self.notify_block_ready();
    }

    /// Non-blocking signal to the engine that a block is worth building.
    /// Dropped when the engine has not drained the previous signal.
    pub fn notify_block_ready(&self) {
        if self.to_engine.try_send(EngineMessage::PendingTxs).is_err() {
            debug!("dropping message to consensus engine");
        }
    }

    /// Moves the VM between bootstrapping and normal operation.
    pub fn set_state(&self, state: VmState) {
        info!(?state, "setting state");
        match state {
            VmState::Bootstrapping => self.bootstrapped.store(false, Ordering::SeqCst),
            VmState::NormalOp => self.bootstrapped.store(true, Ordering::SeqCst),
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn health_check(&self) -> Result<(), VmError> {
        Ok(())
    }

    pub fn connected(&self, node_id: &str) {
        debug!(node_id, "connected to node");
    }

    pub fn disconnected(&self, node_id: &str) {
        debug!(node_id, "disconnected from node");
    }

    /// Drops any uncommitted store state. The VM is unusable afterwards.
    pub fn shutdown(&mut self) {
        debug!("shutting down, closing store");
        self.store.close();
    }

    pub fn context(&self) -> &VmContext {
        &self.ctx
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn daemon(&self) -> &Arc<dyn DaemonClient> {
        &self.daemon
    }

    pub fn app_sender(&self) -> &Arc<dyn AppSender> {
        &self.app_sender
    }

    /// Tallies blocks per producing node over the accepted chain in
    /// `[from, to)`. Blocks without a producer (genesis, ingested
    /// history) are not counted.
    pub fn node_block_counts(
        &self,
        from_height: Option<u64>,
        to_height: Option<u64>,
    ) -> Result<BTreeMap<String, u64>, VmError> {
        let tip = self.last_accepted_block()?.height();
        let from = from_height.unwrap_or(0);
        let to = to_height.unwrap_or(tip + 1).min(tip + 1);

        let mut counts = BTreeMap::new();
        for height in from..to {
            let block = self.get_block_at_height(height)?;
            if !block.producing_node().is_empty() {
                *counts.entry(block.producing_node().to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn new_block(
        &self,
        parent_id: BlockId,
        height: u64,
        daemon_block: DaemonBlock,
        locally_produced: bool,
    ) -> Result<Block, VmError> {
        let producing_node = if locally_produced && height > 0 {
            self.ctx.node_id.clone()
        } else {
            String::new()
        };

        Block::new(
            BlockData {
                parent_id,
                height,
                payload: daemon_block.payload,
                creation_timestamp: daemon_block.timestamp,
                producing_node,
                daemon_hash: daemon_block.hash,
                daemon_parent_hash: daemon_block.parent_hash,
            },
            Status::Processing,
        )
    }

    /// Walks ancestors until an accepted block, collecting the payloads
    /// of `block` and every unaccepted ancestor. The result is ordered
    /// oldest first, which is what `validate_blocks` requires: the list
    /// must read as a contiguous extension of the daemon's tip.
    fn collect_chain_payloads(&self, block: &Block) -> Result<Vec<Vec<u8>>, VmError> {
        let mut payloads = vec![block.payload().to_vec()];
        let mut child_height = block.height();
        let mut cursor = block.parent_id();

        loop {
            let parent = if let Some(p) = self.verified.get(&cursor) {
                p.clone()
            } else {
                match self.store.get_block(&cursor) {
                    Ok(p) => p,
                    Err(e) if e.is_not_found() => {
                        return Err(VmError::Protocol(format!("unknown parent block {cursor}")));
                    }
                    Err(e) => return Err(e),
                }
            };

            if parent.height() + 1 != child_height {
                return Err(VmError::Protocol(format!(
                    "height gap: block at height {child_height} links to parent at height {}",
                    parent.height()
                )));
            }

            match parent.status() {
                Status::Accepted => break,
                Status::Rejected => {
                    return Err(VmError::Protocol(format!(
                        "ancestor {cursor} was rejected"
                    )));
                }
                Status::Processing | Status::Verified => {
                    if parent.height() == 0 {
                        return Err(VmError::Protocol(
                            "chain has no accepted ancestor".to_string(),
                        ));
                    }
                    payloads.push(parent.payload().to_vec());
                    child_height = parent.height();
                    cursor = parent.parent_id();
                }
            }
        }

        payloads.reverse();
        Ok(payloads)
    }

    fn initialize_preference(&mut self) -> Result<(), VmError> {
        let last_accepted = self.store.get_last_accepted()?;
        self.set_preference(last_accepted);
        Ok(())
    }

    /// Reconciles what the chain knows with what the daemon knows.
    ///
    /// Already initialized: refuse if the daemon is ahead, replay our
    /// accepted blocks if the daemon is behind, otherwise nothing.
    /// First run: accept an empty genesis, then ingest the daemon's
    /// chain block by block.
    fn init_and_sync(&mut self) -> Result<(), VmError> {
        let initialized = self.store.is_initialized()?;
        let daemon_height = self.daemon.get_block_count()?;

        if initialized {
            self.initialize_preference()?;
            let vm_height = self.get_block(&self.preferred)?.height();
            info!(daemon_height, vm_height, "chain already initialized");

            if daemon_height > vm_height {
                return Err(VmError::Protocol(format!(
                    "daemon has blocks the VM does not know about \
                     (daemon height {daemon_height}, vm height {vm_height})"
                )));
            }

            let mut next = daemon_height + 1;
            while next <= vm_height {
                let block = self.get_block_at_height(next)?;
                info!(height = next, "replaying accepted block to daemon");

                let payload = block.payload().to_vec();
                if let Err(e) = self.daemon.validate_blocks(std::slice::from_ref(&payload)) {
                    warn!(
                        height = next,
                        error = %e,
                        "daemon refused replayed block, truncating accepted chain"
                    );
                    self.truncate_accepted_chain(next, vm_height)?;
                    break;
                }
                self.daemon.submit_block(&payload)?;
                next += 1;
            }
        } else {
            info!(daemon_height, "first run, ingesting chain from daemon");

            if self.config.strict_genesis && daemon_height > 0 {
                return Err(VmError::Protocol(format!(
                    "daemon already has {daemon_height} blocks beyond its genesis \
                     and strictGenesis is set"
                )));
            }

            let mut genesis = Block::genesis()?;
            self.accept_block(&mut genesis)?;
            let mut parent_id = genesis.id();
            let mut height = 1u64;

            let stream = daemon::block_stream(Arc::clone(&self.daemon), daemon_height);
            for item in stream.iter() {
                let daemon_block = item?;
                let mut block = self.new_block(parent_id, height, daemon_block, false)?;
                self.accept_block(&mut block)?;
                parent_id = block.id();
                height += 1;
            }

            self.initialize_preference()?;
        }

        self.store.set_initialized();
        info!("committing initialized state");
        self.store.commit()
    }

    /// Degenerate reorganization: rejects the accepted blocks in
    /// `from..=tip` and repoints last-accepted (and the preference) at
    /// `from - 1`.
    fn truncate_accepted_chain(&mut self, from: u64, tip: u64) -> Result<(), VmError> {
        for height in from..=tip {
            let mut block = self.get_block_at_height(height)?;
            warn!(height, id = %block.id(), "rejecting truncated block");
            block.set_status(Status::Rejected);
            self.store.put_block(&block)?;
            self.store.delete_block_id_at_height(height)?;
            self.verified.remove(&block.id());
        }

        let new_tip = self.store.get_block_id_at_height(from - 1)?;
        self.store.set_last_accepted(new_tip);
        self.set_preference(new_tip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::daemon::{RPC_ID, RpcError, RpcResponse};
    use crate::host::{NullAppSender, Receiver, engine_channel};
    use crate::store::kv::MemoryKv;
    use std::sync::Mutex;

    /// Scripted daemon client: serves a fixed chain, records every
    /// mutating call, and can be told to fail a specific validate call.
    struct ScriptedDaemon {
        count: u64,
        blocks: Vec<DaemonBlock>,
        suggestion: Option<DaemonBlock>,
        fail_validate_on_call: Option<usize>,
        log: Mutex<CallLog>,
    }

    #[derive(Default)]
    struct CallLog {
        validated: Vec<Vec<Vec<u8>>>,
        submitted: Vec<Vec<u8>>,
        raw_calls: Vec<(String, Vec<u8>)>,
    }

    impl ScriptedDaemon {
        /// A daemon whose chain has `count` blocks above its genesis.
        fn with_chain(count: u64) -> Self {
            let blocks = (1..=count).map(scripted_block).collect();
            ScriptedDaemon {
                count,
                blocks,
                suggestion: None,
                fail_validate_on_call: None,
                log: Mutex::new(CallLog::default()),
            }
        }

        /// Same chain, but the daemon only *reports* `reported` blocks.
        /// Models a daemon that fell behind the VM.
        fn reporting(&self, reported: u64) -> Self {
            ScriptedDaemon {
                count: reported,
                blocks: self.blocks.clone(),
                suggestion: None,
                fail_validate_on_call: None,
                log: Mutex::new(CallLog::default()),
            }
        }

        fn validated(&self) -> Vec<Vec<Vec<u8>>> {
            self.log.lock().unwrap().validated.clone()
        }

        fn submitted(&self) -> Vec<Vec<u8>> {
            self.log.lock().unwrap().submitted.clone()
        }

        fn raw_calls(&self) -> Vec<(String, Vec<u8>)> {
            self.log.lock().unwrap().raw_calls.clone()
        }
    }

    fn scripted_block(height: u64) -> DaemonBlock {
        DaemonBlock {
            payload: format!(r#"{{"height":{height}}}"#).into_bytes(),
            timestamp: 1_650_000_000 + height as i64 * 75,
            hash: format!("{height:064x}"),
            parent_hash: format!("{:064x}", height - 1),
        }
    }

    impl DaemonClient for ScriptedDaemon {
        fn set_host(&self, _host: &str) {}

        fn set_port(&self, _port: u16) {}

        fn get_block_count(&self) -> Result<u64, VmError> {
            Ok(self.count)
        }

        fn get_block(&self, height: u64) -> Result<DaemonBlock, VmError> {
            self.blocks
                .get((height.max(1) - 1) as usize)
                .filter(|_| height >= 1)
                .cloned()
                .ok_or_else(|| {
                    VmError::daemon_client(format!("no scripted block at height {height}"))
                })
        }

        fn suggest_block(&self) -> Result<DaemonBlock, VmError> {
            self.suggestion
                .clone()
                .ok_or_else(|| VmError::daemon_client("no scripted suggestion"))
        }

        fn validate_blocks(&self, payloads: &[Vec<u8>]) -> Result<(), VmError> {
            let mut log = self.log.lock().unwrap();
            log.validated.push(payloads.to_vec());
            if self.fail_validate_on_call == Some(log.validated.len()) {
                return Err(VmError::daemon_reported(0, "scripted validation failure"));
            }
            Ok(())
        }

        fn submit_block(&self, payload: &[u8]) -> Result<(), VmError> {
            self.log.lock().unwrap().submitted.push(payload.to_vec());
            Ok(())
        }

        fn send_value(&self, _from: &str, _to: &str, _amount: f64) -> Result<Vec<u8>, VmError> {
            Err(VmError::daemon_client("not scripted"))
        }

        fn call_raw(&self, method: &str, payload: Option<&[u8]>) -> Result<RpcResponse, VmError> {
            self.log
                .lock()
                .unwrap()
                .raw_calls
                .push((method.to_string(), payload.unwrap_or_default().to_vec()));
            Ok(RpcResponse {
                id: Some(RPC_ID.to_string()),
                result: None,
                error: None,
            })
        }

        fn call_json(
            &self,
            _method: &str,
            _params: &[serde_json::Value],
        ) -> Result<RpcResponse, VmError> {
            Ok(RpcResponse {
                id: Some(RPC_ID.to_string()),
                result: None,
                error: Some(RpcError {
                    code: -1,
                    message: "not scripted".to_string(),
                }),
            })
        }
    }

    fn test_ctx() -> VmContext {
        VmContext::new("testchain", "node-1")
    }

    fn init_vm(
        kv: &MemoryKv,
        daemon: Arc<dyn DaemonClient>,
        config: VmConfig,
    ) -> Result<(Vm, Receiver<EngineMessage>), VmError> {
        let (tx, rx) = engine_channel();
        let vm = Vm::initialize_with_client(
            test_ctx(),
            Box::new(kv.clone()),
            config,
            daemon,
            tx,
            Arc::new(NullAppSender),
            VmOptions::default(),
        )?;
        Ok((vm, rx))
    }

    fn init_mock_vm(kv: &MemoryKv) -> (Vm, Receiver<EngineMessage>) {
        let (tx, rx) = engine_channel();
        let vm = Vm::initialize(
            test_ctx(),
            Box::new(kv.clone()),
            b"",
            b"",
            br#"{"mockDaemon": true}"#,
            tx,
            Arc::new(NullAppSender),
            VmOptions::default(),
        )
        .expect("mock initialization should succeed");
        (vm, rx)
    }

    // --------------------------------------------------------------
    // Initialization and synchronization
    // --------------------------------------------------------------

    #[test]
    fn fresh_install_ingests_the_mock_chain() {
        let kv = MemoryKv::new();
        let (vm, _rx) = init_mock_vm(&kv);

        // Genesis plus the 15 fixture blocks.
        let tip = vm.last_accepted_block().unwrap();
        assert_eq!(tip.height(), 15);
        assert_eq!(vm.preferred(), tip.id());

        let genesis = vm.get_block_at_height(0).unwrap();
        assert!(genesis.payload().is_empty());
        assert!(genesis.parent_id().is_empty());

        // The accepted block at height 7 wraps fixture 7.
        let fixture7 = vm.daemon().get_block(7).unwrap();
        let at7 = vm.get_block_at_height(7).unwrap();
        assert_eq!(at7.payload(), fixture7.payload.as_slice());
        assert_eq!(vm.get_block_id_at_height(7).unwrap(), at7.id());
        assert!(at7.producing_node().is_empty());
    }

    #[test]
    fn accepted_chain_links_parent_to_child() {
        let kv = MemoryKv::new();
        let (vm, _rx) = init_mock_vm(&kv);

        for height in 1..=15u64 {
            let block = vm.get_block_at_height(height).unwrap();
            let parent = vm.get_block_at_height(height - 1).unwrap();
            assert_eq!(block.parent_id(), parent.id());
            assert_eq!(parent.height(), block.height() - 1);
            assert_eq!(block.status(), Status::Accepted);
        }
    }

    #[test]
    fn restart_with_equal_heights_is_a_noop_sync() {
        let kv = MemoryKv::new();
        let first = Arc::new(ScriptedDaemon::with_chain(10));
        let (vm, _rx) = init_vm(&kv, first.clone(), VmConfig::default()).unwrap();
        let tip = vm.last_accepted().unwrap();
        drop(vm);

        let second = Arc::new(first.reporting(10));
        let (vm, _rx) = init_vm(&kv, second.clone(), VmConfig::default()).unwrap();

        assert!(second.validated().is_empty());
        assert!(second.submitted().is_empty());
        assert_eq!(vm.last_accepted().unwrap(), tip);
        assert_eq!(vm.last_accepted_block().unwrap().height(), 10);
    }

    #[test]
    fn restart_replays_missing_blocks_to_a_lagging_daemon() {
        let kv = MemoryKv::new();
        let first = Arc::new(ScriptedDaemon::with_chain(10));
        let (vm, _rx) = init_vm(&kv, first.clone(), VmConfig::default()).unwrap();
        let payloads: Vec<Vec<u8>> = (8..=10)
            .map(|h| vm.get_block_at_height(h).unwrap().payload().to_vec())
            .collect();
        drop(vm);

        // The daemon lost its last three blocks.
        let second = Arc::new(first.reporting(7));
        let (vm, _rx) = init_vm(&kv, second.clone(), VmConfig::default()).unwrap();

        // One validate/submit pair per missing height, ascending.
        let validated = second.validated();
        assert_eq!(validated.len(), 3);
        for (i, batch) in validated.iter().enumerate() {
            assert_eq!(batch.as_slice(), &payloads[i..=i]);
        }
        assert_eq!(second.submitted(), payloads);
        assert_eq!(vm.last_accepted_block().unwrap().height(), 10);
    }

    #[test]
    fn restart_fails_when_the_daemon_is_ahead() {
        let kv = MemoryKv::new();
        let first = Arc::new(ScriptedDaemon::with_chain(7));
        let (vm, _rx) = init_vm(&kv, first.clone(), VmConfig::default()).unwrap();
        drop(vm);

        let second = Arc::new(ScriptedDaemon::with_chain(10));
        let err = init_vm(&kv, second, VmConfig::default()).unwrap_err();
        match err {
            VmError::Protocol(msg) => {
                assert!(msg.contains("daemon has blocks"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn catchup_validation_failure_truncates_the_accepted_chain() {
        let kv = MemoryKv::new();
        let first = Arc::new(ScriptedDaemon::with_chain(10));
        let (vm, _rx) = init_vm(&kv, first.clone(), VmConfig::default()).unwrap();
        let rejected_ids: Vec<BlockId> = (8..=10)
            .map(|h| vm.get_block_at_height(h).unwrap().id())
            .collect();
        drop(vm);

        let mut second = first.reporting(7);
        second.fail_validate_on_call = Some(1);
        let second = Arc::new(second);
        let (vm, _rx) = init_vm(&kv, second.clone(), VmConfig::default()).unwrap();

        // Heights 8..=10 are gone from the index; the chain ends at 7.
        assert_eq!(vm.last_accepted_block().unwrap().height(), 7);
        assert_eq!(vm.preferred(), vm.last_accepted().unwrap());
        for height in 8..=10u64 {
            assert!(vm.get_block_id_at_height(height).unwrap_err().is_not_found());
        }
        // The blocks themselves stay addressable, terminally rejected.
        for id in rejected_ids {
            assert_eq!(vm.get_block(&id).unwrap().status(), Status::Rejected);
        }
        // Nothing was submitted after the refusal.
        assert!(second.submitted().is_empty());
    }

    #[test]
    fn ingest_submits_heights_in_strictly_ascending_order() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(5));
        let (_vm, _rx) = init_vm(&kv, daemon.clone(), VmConfig::default()).unwrap();

        let expected: Vec<Vec<u8>> = (1..=5).map(|h| scripted_block(h).payload).collect();
        assert_eq!(daemon.submitted(), expected);
    }

    #[test]
    fn strict_genesis_refuses_a_daemon_with_history() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(3));
        let config = VmConfig {
            strict_genesis: true,
            ..VmConfig::default()
        };
        let err = init_vm(&kv, daemon, config).unwrap_err();
        assert!(matches!(err, VmError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn clear_database_restarts_from_scratch() {
        let kv = MemoryKv::new();
        let first = Arc::new(ScriptedDaemon::with_chain(4));
        let (vm, _rx) = init_vm(&kv, first.clone(), VmConfig::default()).unwrap();
        drop(vm);

        let second = Arc::new(first.reporting(4));
        let config = VmConfig {
            clear_database: true,
            ..VmConfig::default()
        };
        let (vm, _rx) = init_vm(&kv, second.clone(), config).unwrap();

        // A wiped store takes the first-run path: everything was
        // re-submitted during ingest.
        assert_eq!(second.submitted().len(), 4);
        assert_eq!(vm.last_accepted_block().unwrap().height(), 4);
    }

    #[test]
    fn disabled_chains_refuse_to_initialize() {
        let kv = MemoryKv::new();
        let daemon: Arc<dyn DaemonClient> = Arc::new(ScriptedDaemon::with_chain(0));
        let (tx, _rx) = engine_channel();

        let options = VmOptions {
            disabled_chains: vec!["testchain".to_string()],
            ..VmOptions::default()
        };
        let err = Vm::initialize_with_client(
            test_ctx(),
            Box::new(kv.clone()),
            VmConfig::default(),
            daemon.clone(),
            tx.clone(),
            Arc::new(NullAppSender),
            options,
        )
        .unwrap_err();
        assert!(matches!(err, VmError::Config(_)), "{err:?}");

        let config = VmConfig {
            enabled: false,
            ..VmConfig::default()
        };
        let err = Vm::initialize_with_client(
            test_ctx(),
            Box::new(kv.clone()),
            config,
            daemon,
            tx,
            Arc::new(NullAppSender),
            VmOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, VmError::Config(_)), "{err:?}");
    }

    // --------------------------------------------------------------
    // Block lifecycle
    // --------------------------------------------------------------

    #[test]
    fn build_block_extends_the_preferred_block() {
        let kv = MemoryKv::new();
        let mut daemon = ScriptedDaemon::with_chain(4);
        daemon.suggestion = Some(DaemonBlock {
            payload: br#"{"suggested":true}"#.to_vec(),
            timestamp: 1_700_000_000,
            hash: "aa".repeat(32),
            parent_hash: "bb".repeat(32),
        });
        let daemon = Arc::new(daemon);
        let (mut vm, _rx) = init_vm(&kv, daemon.clone(), VmConfig::default()).unwrap();

        let preferred = vm.preferred();
        let block = vm.build_block().expect("build should succeed");

        assert_eq!(block.height(), 5);
        assert_eq!(block.parent_id(), preferred);
        assert_eq!(block.payload(), br#"{"suggested":true}"#);
        assert_eq!(block.timestamp(), 1_700_000_000);
        assert_eq!(block.producing_node(), "node-1");
        assert_eq!(block.daemon_hash(), "aa".repeat(32));
        assert_eq!(block.status(), Status::Verified);

        // Verification validated exactly the proposed payload.
        let validated = daemon.validated();
        assert_eq!(validated.last().unwrap().as_slice(), &[block.payload().to_vec()]);
    }

    #[test]
    fn build_block_fails_without_a_suggestion() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();
        assert!(vm.build_block().is_err());
    }

    #[test]
    fn verify_collects_ancestor_payloads_oldest_first() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(3));
        let (mut vm, _rx) = init_vm(&kv, daemon.clone(), VmConfig::default()).unwrap();

        // Three unaccepted blocks A <- B <- C on top of the accepted tip.
        let tip = vm.last_accepted_block().unwrap();
        let mut a = vm
            .new_block(tip.id(), tip.height() + 1, scripted_block(90), true)
            .unwrap();
        let mut b = vm
            .new_block(a.id(), a.height() + 1, scripted_block(91), true)
            .unwrap();
        let mut c = vm
            .new_block(b.id(), b.height() + 1, scripted_block(92), true)
            .unwrap();

        vm.verify_block(&mut a).unwrap();
        vm.verify_block(&mut b).unwrap();
        vm.verify_block(&mut c).unwrap();

        let validated = daemon.validated();
        let last = validated.last().unwrap();
        assert_eq!(
            last.as_slice(),
            &[
                a.payload().to_vec(),
                b.payload().to_vec(),
                c.payload().to_vec()
            ]
        );
    }

    #[test]
    fn verify_twice_is_a_noop() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon.clone(), VmConfig::default()).unwrap();

        let tip = vm.last_accepted_block().unwrap();
        let mut block = vm
            .new_block(tip.id(), tip.height() + 1, scripted_block(50), true)
            .unwrap();

        vm.verify_block(&mut block).unwrap();
        let calls_after_first = daemon.validated().len();
        vm.verify_block(&mut block).unwrap();
        assert_eq!(daemon.validated().len(), calls_after_first);
    }

    #[test]
    fn verify_rejects_an_unknown_parent() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();

        let mut orphan = vm
            .new_block(BlockId::compute(b"nowhere"), 3, scripted_block(60), true)
            .unwrap();
        let err = vm.verify_block(&mut orphan).unwrap_err();
        assert!(matches!(err, VmError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn verify_rejects_a_height_gap() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();

        let tip = vm.last_accepted_block().unwrap();
        // Parent is the tip (height 2) but the block claims height 5.
        let mut gapped = vm
            .new_block(tip.id(), tip.height() + 3, scripted_block(61), true)
            .unwrap();
        let err = vm.verify_block(&mut gapped).unwrap_err();
        match err {
            VmError::Protocol(msg) => assert!(msg.contains("height gap"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_a_rejected_ancestor() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();

        let tip = vm.last_accepted_block().unwrap();
        let mut doomed = vm
            .new_block(tip.id(), tip.height() + 1, scripted_block(70), true)
            .unwrap();
        vm.verify_block(&mut doomed).unwrap();
        vm.reject_block(&mut doomed).unwrap();

        let mut child = vm
            .new_block(doomed.id(), doomed.height() + 1, scripted_block(71), true)
            .unwrap();
        let err = vm.verify_block(&mut child).unwrap_err();
        match err {
            VmError::Protocol(msg) => assert!(msg.contains("rejected"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_structural_violations() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(1));
        let (mut vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();
        let tip = vm.last_accepted_block().unwrap();

        // Non-genesis with an empty payload.
        let mut empty = vm
            .new_block(
                tip.id(),
                tip.height() + 1,
                DaemonBlock {
                    payload: Vec::new(),
                    timestamp: 0,
                    hash: String::new(),
                    parent_hash: String::new(),
                },
                true,
            )
            .unwrap();
        assert!(vm.verify_block(&mut empty).is_err());

        // Genesis with a payload.
        let mut fat_genesis = Block::new(
            BlockData {
                parent_id: BlockId::EMPTY,
                height: 0,
                payload: b"{}".to_vec(),
                creation_timestamp: 0,
                producing_node: String::new(),
                daemon_hash: String::new(),
                daemon_parent_hash: String::new(),
            },
            Status::Processing,
        )
        .unwrap();
        assert!(vm.verify_block(&mut fat_genesis).is_err());
    }

    #[test]
    fn accept_submits_then_persists() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon.clone(), VmConfig::default()).unwrap();

        let tip = vm.last_accepted_block().unwrap();
        let mut block = vm
            .new_block(tip.id(), tip.height() + 1, scripted_block(80), true)
            .unwrap();
        vm.verify_block(&mut block).unwrap();
        vm.accept_block(&mut block).unwrap();

        assert_eq!(vm.last_accepted().unwrap(), block.id());
        assert_eq!(vm.get_block_id_at_height(3).unwrap(), block.id());
        assert_eq!(daemon.submitted().last().unwrap(), &block.payload().to_vec());

        // Terminal blocks leave the verified set but stay addressable.
        let loaded = vm.get_block(&block.id()).unwrap();
        assert_eq!(loaded.status(), Status::Accepted);
    }

    #[test]
    fn rejected_blocks_are_never_the_tip() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();

        let tip_before = vm.last_accepted().unwrap();
        let accepted_tip = vm.last_accepted_block().unwrap();
        let mut block = vm
            .new_block(accepted_tip.id(), accepted_tip.height() + 1, scripted_block(81), true)
            .unwrap();
        vm.verify_block(&mut block).unwrap();
        vm.reject_block(&mut block).unwrap();

        assert_eq!(vm.last_accepted().unwrap(), tip_before);
        assert_eq!(vm.get_block(&block.id()).unwrap().status(), Status::Rejected);
    }

    #[test]
    fn parse_block_consolidates_known_identifiers() {
        let kv = MemoryKv::new();
        let (mut vm, _rx) = init_mock_vm(&kv);

        let accepted = vm.get_block_at_height(3).unwrap();
        let parsed = vm.parse_block(&accepted.bytes().to_vec()).unwrap();
        assert_eq!(parsed.id(), accepted.id());
        assert_eq!(parsed.status(), Status::Accepted);

        // An unknown block comes back in Processing.
        let tip = vm.last_accepted_block().unwrap();
        let fresh = vm
            .new_block(tip.id(), tip.height() + 1, scripted_block(99), true)
            .unwrap();
        let parsed = vm.parse_block(&fresh.bytes().to_vec()).unwrap();
        assert_eq!(parsed.status(), Status::Processing);
        assert_eq!(parsed.id(), fresh.id());
    }

    // --------------------------------------------------------------
    // Gossip, notifications, state
    // --------------------------------------------------------------

    #[test]
    fn gossip_forwards_to_the_daemon_and_signals_the_engine() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(1));
        let (vm, rx) = init_vm(&kv, daemon.clone(), VmConfig::default()).unwrap();

        vm.app_gossip("peer-9", Some(br#"{"tx":"aabb"}"#));

        let raw = daemon.raw_calls();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].0, "receivetx");
        assert_eq!(raw[0].1, br#"{"tx":"aabb"}"#.to_vec());
        assert_eq!(rx.try_recv().unwrap(), EngineMessage::PendingTxs);
    }

    #[test]
    fn empty_gossip_is_ignored() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(1));
        let (vm, rx) = init_vm(&kv, daemon.clone(), VmConfig::default()).unwrap();

        vm.app_gossip("peer-9", None);
        vm.app_gossip("peer-9", Some(b""));

        assert!(daemon.raw_calls().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notify_drops_when_the_engine_lags() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(1));
        let (vm, rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();

        vm.notify_block_ready();
        vm.notify_block_ready();
        vm.notify_block_ready();

        assert_eq!(rx.try_recv().unwrap(), EngineMessage::PendingTxs);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_state_toggles_the_bootstrapped_flag() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(1));
        let (vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();

        assert!(!vm.is_bootstrapped());
        vm.set_state(VmState::NormalOp);
        assert!(vm.is_bootstrapped());
        vm.set_state(VmState::Bootstrapping);
        assert!(!vm.is_bootstrapped());
    }

    #[test]
    fn node_block_counts_tallies_locally_built_blocks() {
        let kv = MemoryKv::new();
        let daemon = Arc::new(ScriptedDaemon::with_chain(2));
        let (mut vm, _rx) = init_vm(&kv, daemon, VmConfig::default()).unwrap();

        // Extend the chain with two locally built blocks.
        for i in 0..2u64 {
            let tip = vm.last_accepted_block().unwrap();
            let mut block = vm
                .new_block(tip.id(), tip.height() + 1, scripted_block(40 + i), true)
                .unwrap();
            vm.verify_block(&mut block).unwrap();
            vm.accept_block(&mut block).unwrap();
        }

        // Ingested history has no producer, so only ours count.
        let all = vm.node_block_counts(None, None).unwrap();
        assert_eq!(all.get("node-1"), Some(&2));
        assert_eq!(all.len(), 1);

        // Half-open range excludes the upper bound.
        let partial = vm.node_block_counts(Some(3), Some(4)).unwrap();
        assert_eq!(partial.get("node-1"), Some(&1));
    }
}
