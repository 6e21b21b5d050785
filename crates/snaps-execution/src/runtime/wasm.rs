//! WebAssembly executor backed by Extism.
//!
//! Each snap gets its own Extism plugin instance. WASI is off, so a module
//! reaches nothing but the host functions registered here:
//!
//! | Function      | Registered when       |
//! |---------------|-----------------------|
//! | `snap_request`| always                |
//! | `snap_log`    | always                |
//!
//! The `fetch` endowment opens outbound HTTP through Extism's own
//! `allowed_hosts`; without it every request is refused.
//!
//! Handlers are exports named after the handler (`onRpcRequest`, ...). They
//! take `{ "origin", "request" }` as JSON and return `{ "result" }` or
//! `{ "error": { "message", "code"?, "data"? } }`.
//!
//! Host functions bridge to async code with `Handle::block_on`, so the
//! executor needs the multi-threaded tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use extism::{CurrentPlugin, Manifest, PTR, PluginBuilder, UserData, Val, Wasm};
use serde::Deserialize;
use serde_json::{Value, json};
use snaps_core::{HandlerType, JsonRpcError, JsonRpcRequest, SnapId};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::executor::{HostRpc, SnapExecutor};

/// Default maximum linear memory per snap: 64 MB.
const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Default wall-clock limit per guest call.
const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(60);

/// Endowment names this executor can honour.
pub const SUPPORTED_ENDOWMENTS: [&str; 1] = ["fetch"];

struct WasmHost {
    rpc: HostRpc,
    runtime: Handle,
}

type SharedPlugin = Arc<Mutex<extism::Plugin>>;

/// Runs snaps compiled to WebAssembly.
pub struct WasmExecutor {
    snaps: Mutex<HashMap<SnapId, SharedPlugin>>,
    max_memory_bytes: u64,
    max_execution_time: Duration,
}

impl std::fmt::Debug for WasmExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmExecutor")
            .field("max_memory_bytes", &self.max_memory_bytes)
            .field("max_execution_time", &self.max_execution_time)
            .finish_non_exhaustive()
    }
}

impl Default for WasmExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmExecutor {
    /// Create an executor with default limits (64 MB, 60 s per call).
    #[must_use]
    pub fn new() -> Self {
        Self {
            snaps: Mutex::new(HashMap::new()),
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
        }
    }

    /// Set the linear memory cap in bytes.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the wall-clock cap per guest call.
    #[must_use]
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.max_execution_time = duration;
        self
    }

    fn plugin(&self, snap_id: &SnapId) -> Option<SharedPlugin> {
        self.snaps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snap_id)
            .cloned()
    }

    fn manifest(&self, source: Vec<u8>, endowments: &[String]) -> Manifest {
        let pages = self.max_memory_bytes / (64 * 1024);
        let mut manifest = Manifest::new([Wasm::data(source)])
            .with_timeout(self.max_execution_time)
            .with_memory_max(u32::try_from(pages).unwrap_or(u32::MAX));
        if endowments.iter().any(|e| e == "fetch") {
            manifest = manifest.with_allowed_host("*");
        }
        manifest
    }
}

fn internal(message: impl Into<String>) -> JsonRpcError {
    JsonRpcError::new(message).with_code(JsonRpcError::INTERNAL)
}

#[async_trait]
impl SnapExecutor for WasmExecutor {
    async fn execute(
        &self,
        snap_id: &SnapId,
        source: Vec<u8>,
        endowments: Vec<String>,
        host: HostRpc,
    ) -> Result<(), JsonRpcError> {
        if let Some(unknown) = endowments
            .iter()
            .find(|e| !SUPPORTED_ENDOWMENTS.contains(&e.as_str()))
        {
            return Err(internal(format!("unsupported endowment: {unknown}")));
        }

        let manifest = self.manifest(source, &endowments);
        let user_data = UserData::new(WasmHost {
            rpc: host,
            runtime: Handle::current(),
        });
        let plugin = tokio::task::spawn_blocking(move || {
            PluginBuilder::new(manifest)
                .with_wasi(false)
                .with_function("snap_request", [PTR], [PTR], user_data.clone(), snap_request)
                .with_function("snap_log", [PTR, PTR], [], user_data, snap_log)
                .build()
        })
        .await
        .map_err(|e| internal(format!("module build task failed: {e}")))?
        .map_err(|e| internal(format!("failed to load module: {e}")))?;

        info!(snap_id = %snap_id, endowments = ?endowments, "WASM snap loaded");
        self.snaps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snap_id.clone(), Arc::new(Mutex::new(plugin)));
        Ok(())
    }

    async fn invoke(
        &self,
        snap_id: &SnapId,
        handler: HandlerType,
        origin: String,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcError> {
        let plugin = self
            .plugin(snap_id)
            .ok_or_else(|| internal(format!("snap {snap_id} is not loaded")))?;
        let input = json!({ "origin": origin, "request": request }).to_string();

        let output = tokio::task::spawn_blocking(move || {
            let mut plugin = plugin.lock().unwrap_or_else(PoisonError::into_inner);
            if !plugin.function_exists(handler.as_str()) {
                return Err(JsonRpcError::new(format!(
                    "snap does not export {}",
                    handler.as_str()
                ))
                .with_code(JsonRpcError::METHOD_NOT_FOUND));
            }
            plugin
                .call::<&str, String>(handler.as_str(), &input)
                .map_err(|e| internal(e.to_string()))
        })
        .await
        .map_err(|e| internal(format!("handler task failed: {e}")))??;

        debug!(snap_id = %snap_id, %handler, "WASM handler returned");
        parse_guest_reply(&output)
    }

    async fn terminate(&self) {
        self.snaps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Deserialize)]
struct GuestReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

fn parse_guest_reply(output: &str) -> Result<Value, JsonRpcError> {
    let reply: GuestReply = serde_json::from_str(output)
        .map_err(|e| internal(format!("malformed handler output: {e}")))?;
    match reply.error {
        Some(error) => Err(error),
        None => Ok(reply.result.unwrap_or(Value::Null)),
    }
}

fn host_of(user_data: &UserData<WasmHost>) -> Result<(HostRpc, Handle), extism::Error> {
    let data = user_data.get()?;
    let state = data.lock().unwrap_or_else(PoisonError::into_inner);
    Ok((state.rpc.clone(), state.runtime.clone()))
}

#[derive(Deserialize)]
struct GuestRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

// snap_request(request_json) -> reply_json
#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn snap_request(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<WasmHost>,
) -> Result<(), extism::Error> {
    let raw: String = plugin.memory_get_val(&inputs[0])?;
    let (rpc, runtime) = host_of(&user_data)?;

    let reply = match serde_json::from_str::<GuestRequest>(&raw) {
        Ok(request) => match runtime.block_on(rpc.request(&request.method, request.params)) {
            Ok(result) => json!({ "result": result }),
            Err(error) => json!({ "error": error }),
        },
        Err(e) => json!({
            "error": JsonRpcError::new(format!("malformed request: {e}"))
                .with_code(JsonRpcError::INVALID_PARAMS)
        }),
    };

    let reply = reply.to_string();
    let mem = plugin.memory_new(&reply)?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

// snap_log(level, message)
#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn snap_log(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<WasmHost>,
) -> Result<(), extism::Error> {
    let level: String = plugin.memory_get_val(&inputs[0])?;
    let message: String = plugin.memory_get_val(&inputs[1])?;
    let (rpc, _) = host_of(&user_data)?;
    let snap_id = rpc.snap_id();
    match level.as_str() {
        "error" => tracing::error!(snap_id = %snap_id, "{message}"),
        "warn" => warn!(snap_id = %snap_id, "{message}"),
        "debug" => debug!(snap_id = %snap_id, "{message}"),
        _ => info!(snap_id = %snap_id, "{message}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_reply_shapes() {
        assert_eq!(parse_guest_reply(r#"{"result":{"a":1}}"#).unwrap(), json!({ "a": 1 }));
        assert_eq!(parse_guest_reply("{}").unwrap(), Value::Null);
        let err = parse_guest_reply(r#"{"error":{"message":"nope","code":7}}"#).unwrap_err();
        assert_eq!(err.code, Some(7));
        assert!(parse_guest_reply("not json").is_err());
    }

    #[tokio::test]
    async fn garbage_modules_fail_to_load() {
        let executor = WasmExecutor::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let host = HostRpc::new(
            SnapId::from_static("npm:bad"),
            super::super::executor::RpcChannel::new(tx),
        );
        let err = executor
            .execute(&SnapId::from_static("npm:bad"), b"not wasm".to_vec(), Vec::new(), host)
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(JsonRpcError::INTERNAL));

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let host = HostRpc::new(
            SnapId::from_static("npm:bad"),
            super::super::executor::RpcChannel::new(tx),
        );
        let err = executor
            .execute(
                &SnapId::from_static("npm:bad"),
                Vec::new(),
                vec!["process".into()],
                host,
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("unsupported endowment"));
    }
}
