//! Chain configuration and process-wide options.
//!
//! The host hands the VM an opaque JSON blob at initialization. Unknown
//! keys are ignored; malformed JSON logs a warning and falls back to
//! defaults so a typo in the chain config degrades to a stock setup
//! instead of a crash loop.
//!
//! [`VmOptions`] carries the process-wide flags (testnet mode, forced
//! mock client, statically disabled chains) as an explicit value
//! constructed at startup and threaded into VM construction.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::daemon::http::{DEFAULT_HOST, DEFAULT_PASSWORD, DEFAULT_PORT, DEFAULT_USER};
use crate::daemon::{DaemonClient, HttpDaemonClient, MockDaemonClient};
use crate::error::VmError;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_DATA_DIR: &str = "data/zvm-db";

/// Environment variable overriding the `localSim` config key. Accepts
/// `1`/`true`/`yes` and `0`/`false`/`no`.
pub const LOCAL_SIM_ENV: &str = "ZVM_LOCAL_SIM";

/// Chains that stay disabled no matter what their config says. A chain
/// cannot be removed from this list via config.
pub const DEFAULT_DISABLED_CHAINS: [&str; 2] = [
    "2b7RnPXeuQkKvTxMszGeWcJr4dDcBhWnEP5cgH9vD3USbUqLd",
    "WyNqAfeS2GbhTVksQ8mJ5tRzcCUu7DEnKgv4HxidXeFPmjR6a",
];

/// Per-chain configuration, parsed from the host-provided JSON blob.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmConfig {
    /// If false, initialization fails fast.
    pub enabled: bool,
    /// Select the in-memory mock client instead of the live one.
    pub mock_daemon: bool,
    /// Per-node-identity endpoint lookup for multi-daemon machines.
    pub local_sim: bool,
    pub daemon_host: Option<String>,
    pub daemon_port: Option<u16>,
    pub daemon_user: Option<String>,
    pub daemon_password: Option<String>,
    /// Wipe the store before initialization.
    pub clear_database: bool,
    /// Logger level: debug/info/warn/error.
    pub log_level: String,
    /// Directory for the database and the localSim port files.
    pub data_dir: String,
    /// Refuse first-run ingest when the daemon already has blocks
    /// beyond its genesis.
    pub strict_genesis: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            enabled: true,
            mock_daemon: false,
            local_sim: false,
            daemon_host: None,
            daemon_port: None,
            daemon_user: None,
            daemon_password: None,
            clear_database: false,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            strict_genesis: false,
        }
    }
}

impl VmConfig {
    /// Parses a config blob, defaulting on absent or malformed input.
    pub fn from_json(bytes: &[u8]) -> VmConfig {
        if bytes.is_empty() {
            return VmConfig::default();
        }
        match serde_json::from_slice(bytes) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, "malformed chain config, falling back to defaults");
                VmConfig::default()
            }
        }
    }

    /// Resolves the live endpoint for this node: explicit config keys
    /// win, then the localSim per-node port file, then the conventional
    /// local daemon defaults.
    pub fn resolve_endpoint(&self, node_id: &str) -> Result<(String, u16), VmError> {
        if self.local_sim_active() {
            let port = self.lookup_node_port(node_id)?;
            return Ok((DEFAULT_HOST.to_string(), port));
        }
        let host = self
            .daemon_host
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = self.daemon_port.unwrap_or(DEFAULT_PORT);
        Ok((host, port))
    }

    /// Constructs the daemon client this chain should talk to. Selection
    /// happens once, at initialization.
    pub fn daemon_client(
        &self,
        node_id: &str,
        options: &VmOptions,
    ) -> Result<Arc<dyn DaemonClient>, VmError> {
        if self.mock_daemon || options.mock_daemon {
            tracing::info!("using mock daemon client");
            return Ok(Arc::new(MockDaemonClient::new()));
        }

        let (host, port) = self.resolve_endpoint(node_id)?;
        let user = self
            .daemon_user
            .clone()
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        let password = self
            .daemon_password
            .clone()
            .unwrap_or_else(|| DEFAULT_PASSWORD.to_string());

        tracing::info!(host, port, "using live daemon client");
        let client = HttpDaemonClient::new(host, port, user, password)?;
        Ok(Arc::new(client))
    }

    fn local_sim_active(&self) -> bool {
        match std::env::var(LOCAL_SIM_ENV) {
            Ok(v) => matches!(v.as_str(), "1" | "true" | "yes"),
            Err(_) => self.local_sim,
        }
    }

    /// Reads `<dataDir>/ports/<nodeID>`, which holds the decimal RPC
    /// port of the daemon instance assigned to this node.
    fn lookup_node_port(&self, node_id: &str) -> Result<u16, VmError> {
        let path = Path::new(&self.data_dir).join("ports").join(node_id);
        let text = fs::read_to_string(&path).map_err(|e| {
            VmError::Config(format!(
                "localSim port file {} is unreadable: {e}",
                path.display()
            ))
        })?;
        text.trim().parse::<u16>().map_err(|e| {
            VmError::Config(format!(
                "localSim port file {} does not hold a port: {e}",
                path.display()
            ))
        })
    }
}

/// Process-wide flags, constructed once at startup. No global mutable
/// state: the binary builds one of these and threads it into
/// [`crate::vm::Vm::initialize`].
#[derive(Clone, Debug)]
pub struct VmOptions {
    /// Testnet mode gates debug features such as mining empty blocks.
    pub test_net: bool,
    /// Forces the mock client for every chain in this process.
    pub mock_daemon: bool,
    /// Chains refused at initialization, in addition to anything the
    /// per-chain config disables.
    pub disabled_chains: Vec<String>,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            test_net: true,
            mock_daemon: false,
            disabled_chains: DEFAULT_DISABLED_CHAINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl VmOptions {
    pub fn is_chain_disabled(&self, chain_id: &str) -> bool {
        self.disabled_chains.iter().any(|c| c == chain_id)
    }
}
