use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::json;

use zvm::Service;

use crate::state::SharedState;

/// Request body for `POST /rpc`.
///
/// The method is dispatched by name; a `zvm.` service prefix is
/// accepted and stripped, so both `getBlock` and `zvm.getBlock` work.
#[derive(Debug, Deserialize)]
pub struct RpcCall {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// `POST /rpc`
///
/// Single JSON endpoint over the VM's service handlers. Failures come
/// back as `{"result": null, "error": "<message>"}` with status 200;
/// transport-level problems are axum's concern.
pub async fn rpc(
    State(state): State<SharedState>,
    Json(call): Json<RpcCall>,
) -> Json<serde_json::Value> {
    let method = call
        .method
        .strip_prefix("zvm.")
        .unwrap_or(&call.method)
        .to_string();

    let mut vm = state.vm.lock().await;
    let mut service = Service::new(&mut vm);

    match service.dispatch(&method, call.params) {
        Ok(result) => Json(json!({ "result": result, "error": null })),
        Err(e) => {
            tracing::warn!(method = %method, error = %e, "service request failed");
            Json(json!({ "result": null, "error": e.to_string() }))
        }
    }
}
