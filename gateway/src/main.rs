// gateway/src/main.rs

//! Plugin binary for the chain VM.
//!
//! This binary wires up the `zvm` crate for a single-node run:
//!
//! - `--version` prints `zvm@<version>` and exits,
//! - the VM is initialized over a RocksDB-backed store,
//! - the service handlers are exposed on a single `POST /rpc` endpoint
//!   (plus `GET /health`),
//! - a driver thread consumes "block ready" engine messages and turns
//!   them into build/accept sequences, standing in for the consensus
//!   host on a one-node chain.

mod config;
mod routes;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::signal;

use zvm::host::Receiver;
use zvm::{EngineMessage, NullAppSender, RocksKv, Vm, VmConfig, VmContext, VmOptions};

use config::GatewayConfig;
use routes::{health, rpc};
use state::{AppState, SharedState};

fn main() {
    // `--version` must work with no environment and no daemon.
    if std::env::args().nth(1).as_deref() == Some("--version") {
        println!("{}", zvm::version_string());
        return;
    }

    let gateway_cfg = GatewayConfig::from_env();

    let config_bytes = match &gateway_cfg.config_path {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("failed to read chain config {path}: {e}");
                std::process::exit(1);
            }
        },
        None => Vec::new(),
    };
    let vm_cfg = VmConfig::from_json(&config_bytes);

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            format!(
                "zvm_gateway={level},zvm={level}",
                level = vm_cfg.log_level
            )
        }))
        .init();

    if let Err(err) = run(gateway_cfg, vm_cfg) {
        eprintln!("fatal error: {err}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(gateway_cfg: GatewayConfig, vm_cfg: VmConfig) -> Result<(), String> {
    let options = VmOptions::default();

    // ---------------------------
    // Storage + daemon client
    // ---------------------------

    let kv = RocksKv::open(&vm_cfg.data_dir)
        .map_err(|e| format!("failed to open store at {}: {e}", vm_cfg.data_dir))?;

    let daemon = vm_cfg
        .daemon_client(&gateway_cfg.node_id, &options)
        .map_err(|e| format!("failed to construct daemon client: {e}"))?;

    // ---------------------------
    // VM initialization
    // ---------------------------

    let (to_engine, from_vm) = zvm::engine_channel();
    let ctx = VmContext::new(gateway_cfg.chain_id.clone(), gateway_cfg.node_id.clone());

    let vm = Vm::initialize_with_client(
        ctx,
        Box::new(kv),
        vm_cfg,
        daemon,
        to_engine,
        Arc::new(NullAppSender),
        options,
    )
    .map_err(|e| format!("VM initialization failed: {e}"))?;

    let app_state: SharedState = Arc::new(AppState {
        vm: tokio::sync::Mutex::new(vm),
    });

    // ---------------------------
    // Block driver loop
    // ---------------------------

    let driver_state = app_state.clone();
    std::thread::spawn(move || {
        run_block_driver(driver_state, from_vm);
    });

    // ---------------------------
    // HTTP router
    // ---------------------------

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/rpc", post(rpc::rpc))
        .with_state(app_state.clone());

    tracing::info!(
        "gateway listening on http://{}",
        gateway_cfg.listen_addr
    );

    let listener = tokio::net::TcpListener::bind(gateway_cfg.listen_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", gateway_cfg.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("gateway server error: {e}"))?;

    // Drop any uncommitted overlay state before exiting.
    app_state.vm.lock().await.shutdown();

    Ok(())
}

/// Consumes engine messages and, for each, builds and accepts one block.
///
/// On a multi-node chain the consensus host owns this sequence; the
/// gateway runs it inline so a single node can make progress against a
/// real daemon.
fn run_block_driver(state: SharedState, from_vm: Receiver<EngineMessage>) {
    tracing::info!("block driver running");

    for _msg in from_vm.iter() {
        let mut vm = state.vm.blocking_lock();

        let mut block = match vm.build_block() {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build block");
                continue;
            }
        };

        match vm.accept_block(&mut block) {
            Ok(()) => {
                vm.set_preference(block.id());
                tracing::info!(
                    height = block.height(),
                    id = %block.id(),
                    "accepted locally built block"
                );
            }
            Err(e) => {
                tracing::warn!(height = block.height(), error = %e, "failed to accept block");
            }
        }
    }
}

/// Waits for Ctrl-C and returns, used for graceful shutdown.
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
