//! Shared application state.

use std::sync::Arc;

use tokio::sync::Mutex;

use zvm::Vm;

/// State held by the HTTP handlers and the block driver loop.
///
/// The VM expects the host to serialize its entry points behind a
/// per-chain lock; the mutex here is that lock.
pub struct AppState {
    pub vm: Mutex<Vm>,
}

/// Thread-safe alias for `AppState`.
pub type SharedState = Arc<AppState>;
