//! Gateway configuration.
//!
//! The gateway configures itself from the environment so the same binary
//! works under a process supervisor and on a developer machine:
//!
//! - `ZVM_GATEWAY_ADDR`: HTTP listen address,
//! - `ZVM_CHAIN_ID` / `ZVM_NODE_ID`: identities handed to the VM,
//! - `ZVM_CONFIG`: path to the chain config JSON blob.

use std::net::SocketAddr;

/// Configuration for the gateway HTTP server and VM identities.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,
    /// Chain identifier handed to the VM (scopes the store keys).
    pub chain_id: String,
    /// Node identity stamped onto locally built blocks.
    pub node_id: String,
    /// Optional path to the chain config JSON blob.
    pub config_path: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        // Safe to unwrap: fixed, valid address literal.
        let addr: SocketAddr = "127.0.0.1:9652"
            .parse()
            .expect("hard-coded gateway listen address should parse");
        GatewayConfig {
            listen_addr: addr,
            chain_id: "zvm-local".to_string(),
            node_id: "node-0".to_string(),
            config_path: None,
        }
    }
}

impl GatewayConfig {
    /// Builds a config from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = GatewayConfig::default();

        if let Ok(addr) = std::env::var("ZVM_GATEWAY_ADDR") {
            match addr.parse() {
                Ok(parsed) => cfg.listen_addr = parsed,
                Err(e) => {
                    tracing::warn!(addr, error = %e, "ignoring unparseable ZVM_GATEWAY_ADDR")
                }
            }
        }
        if let Ok(chain_id) = std::env::var("ZVM_CHAIN_ID") {
            cfg.chain_id = chain_id;
        }
        if let Ok(node_id) = std::env::var("ZVM_NODE_ID") {
            cfg.node_id = node_id;
        }
        if let Ok(path) = std::env::var("ZVM_CONFIG") {
            cfg.config_path = Some(path);
        }

        cfg
    }
}
