//! Live JSON-RPC client for the external daemon.
//!
//! Talks to a Zcash-style daemon over HTTP POST with basic auth. The
//! request body is the envelope from [`super::RpcRequest`]; the response
//! is the `{result, error, id}` envelope. Every call is bounded by the
//! client's request timeout so a wedged daemon cannot hang the consensus
//! host indefinitely.
//!
//! The endpoint (host/port) can be re-pointed at runtime through
//! `set_host`/`set_port`; the pair lives behind one `RwLock` so
//! concurrent calls always observe a consistent endpoint.

use std::sync::RwLock;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::value::RawValue;

use super::{DaemonBlock, DaemonClient, RPC_ID, RpcRequest, RpcResponse};
use crate::error::VmError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8232;
pub const DEFAULT_USER: &str = "test";
pub const DEFAULT_PASSWORD: &str = "pw";

/// Upper bound on any single daemon call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Endpoint {
    host: String,
    port: u16,
}

pub struct HttpDaemonClient {
    endpoint: RwLock<Endpoint>,
    user: String,
    password: String,
    client: Client,
}

impl HttpDaemonClient {
    /// Constructs a client for `http://host:port/` with basic auth.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, VmError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VmError::daemon_client(format!("failed to build HTTP client: {e}")))?;

        Ok(HttpDaemonClient {
            endpoint: RwLock::new(Endpoint {
                host: host.into(),
                port,
            }),
            user: user.into(),
            password: password.into(),
            client,
        })
    }

    /// Constructs a client against the conventional local daemon
    /// endpoint.
    pub fn with_defaults() -> Result<Self, VmError> {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, DEFAULT_USER, DEFAULT_PASSWORD)
    }

    /// Current host/port pair.
    pub fn endpoint(&self) -> (String, u16) {
        let ep = self.endpoint.read().expect("endpoint lock poisoned");
        (ep.host.clone(), ep.port)
    }

    fn base_url(&self) -> String {
        let ep = self.endpoint.read().expect("endpoint lock poisoned");
        format!("http://{}:{}/", ep.host, ep.port)
    }

    fn post(&self, body: Vec<u8>) -> Result<RpcResponse, VmError> {
        let url = self.base_url();
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|e| VmError::daemon_client(format!("HTTP POST {url} failed: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .map_err(|e| VmError::daemon_client(format!("failed to read daemon response: {e}")))?;

        // Zcash-style daemons report RPC errors with a non-2xx status and
        // a regular JSON envelope in the body, so the body is
        // authoritative when it parses.
        match serde_json::from_slice::<RpcResponse>(&bytes) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(VmError::daemon_client(format!(
                "daemon returned HTTP {status}"
            ))),
            Err(e) => Err(VmError::daemon_client(format!(
                "malformed daemon response: {e}"
            ))),
        }
    }

    fn call(&self, method: &str, params: Option<&RawValue>) -> Result<RpcResponse, VmError> {
        tracing::debug!(method, "calling daemon");
        let req = RpcRequest {
            id: RPC_ID,
            method,
            params,
        };
        let body = serde_json::to_vec(&req)
            .map_err(|e| VmError::Codec(format!("failed to encode daemon request: {e}")))?;
        self.post(body)
    }

    /// Expects a present (possibly null) result, mapping daemon-reported
    /// errors along the way.
    fn call_for_result(
        &self,
        method: &str,
        params: Option<&RawValue>,
    ) -> Result<Box<RawValue>, VmError> {
        self.call(method, params)?.into_result()?.ok_or_else(|| {
            VmError::daemon_client(format!("daemon returned no result for {method}"))
        })
    }
}

/// Reinterprets an opaque payload as a raw JSON value so it can be
/// embedded in the `params` field without re-encoding.
fn raw_params(payload: &[u8]) -> Result<&RawValue, VmError> {
    serde_json::from_slice::<&RawValue>(payload)
        .map_err(|e| VmError::Codec(format!("daemon payload is not valid JSON: {e}")))
}

/// Builds the JSON array parameter for a batch validation call,
/// preserving the oldest-first payload order byte for byte.
fn batch_params(payloads: &[Vec<u8>]) -> Result<String, VmError> {
    let mut out = String::from("[");
    for (i, payload) in payloads.iter().enumerate() {
        // Validate each payload before splicing it into the array.
        let raw = raw_params(payload)?;
        if i > 0 {
            out.push(',');
        }
        out.push_str(raw.get());
    }
    out.push(']');
    Ok(out)
}

fn json_array_params(params: &[serde_json::Value]) -> Result<Box<RawValue>, VmError> {
    let text = serde_json::to_string(params)
        .map_err(|e| VmError::Codec(format!("failed to encode call params: {e}")))?;
    RawValue::from_string(text)
        .map_err(|e| VmError::Codec(format!("failed to build raw params: {e}")))
}

impl DaemonClient for HttpDaemonClient {
    fn set_host(&self, host: &str) {
        tracing::info!(host, "re-pointing daemon endpoint host");
        let mut ep = self.endpoint.write().expect("endpoint lock poisoned");
        ep.host = host.to_string();
    }

    fn set_port(&self, port: u16) {
        tracing::info!(port, "re-pointing daemon endpoint port");
        let mut ep = self.endpoint.write().expect("endpoint lock poisoned");
        ep.port = port;
    }

    fn get_block_count(&self) -> Result<u64, VmError> {
        let result = self.call_for_result("getblockcount", None)?;
        serde_json::from_str::<u64>(result.get()).map_err(|e| {
            VmError::daemon_client(format!("unparseable getblockcount result: {e}"))
        })
    }

    fn get_block(&self, height: u64) -> Result<DaemonBlock, VmError> {
        let params = json_array_params(&[serde_json::Value::String(height.to_string())])?;
        let result = self.call_for_result("getserializedblock", Some(&params))?;
        DaemonBlock::from_wire_json(result.get().as_bytes())
    }

    fn suggest_block(&self) -> Result<DaemonBlock, VmError> {
        let result = self.call_for_result("suggest", None)?;
        DaemonBlock::from_wire_json(result.get().as_bytes())
    }

    fn validate_blocks(&self, payloads: &[Vec<u8>]) -> Result<(), VmError> {
        let params = batch_params(payloads)?;
        let params = RawValue::from_string(params)
            .map_err(|e| VmError::Codec(format!("failed to build raw params: {e}")))?;
        let result = self.call("validateBlock", Some(&params))?.into_result()?;

        // A JSON null result is the daemon's "valid" answer; anything
        // else describes what it rejected.
        match result {
            None => Ok(()),
            Some(raw) if raw.get().trim() == "null" => Ok(()),
            Some(raw) => Err(VmError::daemon_reported(
                0,
                format!("daemon rejected block batch: {}", raw.get()),
            )),
        }
    }

    fn submit_block(&self, payload: &[u8]) -> Result<(), VmError> {
        let params = raw_params(payload)?;
        let result = self.call("submitblock", Some(params))?.into_result()?;
        match result {
            None => Ok(()),
            Some(raw) if raw.get().trim() == "null" => Ok(()),
            Some(raw) => Err(VmError::daemon_reported(
                0,
                format!("daemon refused submitted block: {}", raw.get()),
            )),
        }
    }

    fn send_value(&self, from: &str, to: &str, amount: f64) -> Result<Vec<u8>, VmError> {
        tracing::info!(from, to, amount, "constructing value transfer");
        let params = vec![
            serde_json::Value::String(from.to_string()),
            serde_json::json!([{ "address": to, "amount": amount }]),
        ];
        let result = self.call_json("z_sendmany", &params)?.into_result()?;
        match result {
            Some(raw) => Ok(raw.get().as_bytes().to_vec()),
            None => Err(VmError::daemon_client("z_sendmany returned no result")),
        }
    }

    fn call_raw(&self, method: &str, payload: Option<&[u8]>) -> Result<RpcResponse, VmError> {
        match payload {
            Some(bytes) => {
                let params = raw_params(bytes)?;
                self.call(method, Some(params))
            }
            None => self.call(method, None),
        }
    }

    fn call_json(
        &self,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<RpcResponse, VmError> {
        let params = json_array_params(params)?;
        self.call(method, Some(&params))
    }
}
