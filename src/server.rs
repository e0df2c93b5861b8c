//! Plugin server speaking line-delimited JSON-RPC 2.0 over stdio.
//!
//! The host drives the provisioner with `prepare`, `provision`, `cancel` and
//! `version` requests. While a `provision` request is being handled the
//! plugin calls back into the host on the same channel: remote commands and
//! uploads become `communicator.*` requests, progress output becomes `ui.*`
//! notifications.

use std::cell::RefCell;
use std::io::{self, BufRead, Read, Write};
use std::rc::Rc;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::communicator::{Communicator, RemoteCmd};
use crate::error::ProvisionerError;
use crate::provisioner::Provisioner;
use crate::ui::Ui;
use crate::version;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const PROVISIONER_ERROR: i32 = -32000;

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    fn new(id: Option<Value>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

/// One end of the bidirectional JSON-RPC stream.
pub struct RpcChannel<R: BufRead, W: Write> {
    reader: R,
    writer: W,
    next_id: u64,
}

impl<R: BufRead, W: Write> RpcChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            next_id: 1,
        }
    }

    /// Reads the next non-blank line, or `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .context("failed to read from host")?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    fn write<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message).context("failed to encode message")?;
        self.writer
            .write_all(payload.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush())
            .context("failed to write to host")
    }

    fn respond(&mut self, response: &JsonRpcResponse) -> Result<()> {
        self.write(response)
    }

    /// Sends a notification; no response is expected.
    pub fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        self.write(&JsonRpcRequest::new(None, method, params))
    }

    /// Sends a request to the host and waits for its response.
    ///
    /// Host requests arriving in the meantime are answered with an error,
    /// except `cancel`, which terminates the process.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.write(&JsonRpcRequest::new(Some(json!(id)), method, params))?;

        loop {
            let line = self
                .read_line()?
                .with_context(|| format!("host closed the connection while waiting for {}", method))?;
            let message: Value = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!("ignoring malformed message from host: {}", e);
                    continue;
                }
            };

            if message.get("method").is_some() {
                self.reject_nested_request(message)?;
                continue;
            }

            let response: JsonRpcResponse = match serde_json::from_value(message) {
                Ok(response) => response,
                Err(e) => {
                    warn!("ignoring malformed response from host: {}", e);
                    continue;
                }
            };
            if response.id != json!(id) {
                warn!("ignoring response with unexpected id {}", response.id);
                continue;
            }
            if let Some(error) = response.error {
                return Err(ProvisionerError::Communicator(format!(
                    "{} failed: {} (code {})",
                    method, error.message, error.code
                ))
                .into());
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    fn reject_nested_request(&mut self, message: Value) -> Result<()> {
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(_) => return Ok(()),
        };
        if request.method == "cancel" {
            info!("cancel requested while provisioning");
            if let Some(id) = request.id {
                self.respond(&JsonRpcResponse::success(id, json!({})))?;
            }
            std::process::exit(0);
        }
        if let Some(id) = request.id {
            self.respond(&JsonRpcResponse::failure(
                id,
                PROVISIONER_ERROR,
                format!("cannot handle {} while provisioning", request.method),
            ))?;
        }
        Ok(())
    }
}

type SharedChannel<R, W> = Rc<RefCell<RpcChannel<R, W>>>;

/// UI forwarding progress output to the host as notifications.
pub struct RpcUi<R: BufRead, W: Write> {
    channel: SharedChannel<R, W>,
}

impl<R: BufRead, W: Write> RpcUi<R, W> {
    fn send(&self, method: &str, message: &str) {
        if let Err(e) = self
            .channel
            .borrow_mut()
            .notify(method, json!({ "message": message }))
        {
            debug!("failed to send {}: {:#}", method, e);
        }
    }
}

impl<R: BufRead, W: Write> Ui for RpcUi<R, W> {
    fn say(&self, message: &str) {
        self.send("ui.say", message);
    }

    fn message(&self, message: &str) {
        self.send("ui.message", message);
    }

    fn error(&self, message: &str) {
        self.send("ui.error", message);
    }
}

/// Communicator executed by the host on the plugin's behalf.
pub struct RpcCommunicator<R: BufRead, W: Write> {
    channel: SharedChannel<R, W>,
}

impl<R: BufRead, W: Write> Communicator for RpcCommunicator<R, W> {
    fn start(&self, cmd: &RemoteCmd, _ui: &dyn Ui) -> Result<i32> {
        let result = self
            .channel
            .borrow_mut()
            .call("communicator.start", json!({ "command": cmd.command() }))?;
        let status = result
            .get("exit_status")
            .and_then(Value::as_i64)
            .and_then(|s| i32::try_from(s).ok())
            .ok_or_else(|| {
                ProvisionerError::Communicator(format!(
                    "communicator.start returned no exit status: {}",
                    result
                ))
            })?;
        Ok(status)
    }

    fn upload(&self, destination: &str, source: &mut dyn Read) -> Result<()> {
        let mut content = Vec::new();
        source
            .read_to_end(&mut content)
            .map_err(|e| ProvisionerError::io(format!("failed to read upload for {}", destination), e))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&content);
        self.channel.borrow_mut().call(
            "communicator.upload",
            json!({ "destination": destination, "content_base64": encoded }),
        )?;
        Ok(())
    }

    fn upload_dir(&self, destination: &str, source: &str) -> Result<()> {
        self.channel.borrow_mut().call(
            "communicator.upload_dir",
            json!({ "destination": destination, "source": source }),
        )?;
        Ok(())
    }
}

/// Serves one provisioner to the host until the input is exhausted.
pub struct PluginServer<R: BufRead, W: Write> {
    provisioner: Provisioner,
    channel: SharedChannel<R, W>,
}

impl<R: BufRead, W: Write> PluginServer<R, W> {
    pub fn new(provisioner: Provisioner, reader: R, writer: W) -> Self {
        Self {
            provisioner,
            channel: Rc::new(RefCell::new(RpcChannel::new(reader, writer))),
        }
    }

    /// Handles host requests until end of input.
    pub fn serve(mut self) -> Result<()> {
        info!("plugin server listening on stdio");
        loop {
            let Some(line) = self.channel.borrow_mut().read_line()? else {
                break;
            };

            let request = match parse_request(&line) {
                Ok(request) => request,
                Err(response) => {
                    self.channel.borrow_mut().respond(&response)?;
                    continue;
                }
            };

            debug!("handling {}", request.method);
            let is_cancel = request.method == "cancel";
            let outcome = self.dispatch(&request.method, request.params);
            if let Some(id) = request.id {
                let response = match outcome {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err((code, message)) => JsonRpcResponse::failure(id, code, message),
                };
                self.channel.borrow_mut().respond(&response)?;
            }
            if is_cancel {
                self.provisioner.cancel();
            }
        }
        info!("host closed the connection");
        Ok(())
    }

    fn dispatch(&mut self, method: &str, params: Value) -> Result<Value, (i32, String)> {
        match method {
            "prepare" => {
                let fragments = prepare_fragments(params).map_err(|m| (INVALID_REQUEST, m))?;
                self.provisioner
                    .prepare(&fragments)
                    .map_err(|e| (PROVISIONER_ERROR, e.to_string()))?;
                Ok(json!({}))
            }
            "provision" => {
                let ui = RpcUi {
                    channel: Rc::clone(&self.channel),
                };
                let comm = RpcCommunicator {
                    channel: Rc::clone(&self.channel),
                };
                self.provisioner
                    .provision(&ui, &comm)
                    .map_err(|e| (PROVISIONER_ERROR, format!("{:#}", e)))?;
                Ok(json!({}))
            }
            "cancel" => Ok(json!({})),
            "version" => Ok(json!({
                "version": version::VERSION,
                "revision": version::REVISION,
                "banner": version::banner(),
            })),
            other => Err((METHOD_NOT_FOUND, format!("method not found: {}", other))),
        }
    }
}

fn parse_request(line: &str) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let parsed: Value = serde_json::from_str(line).map_err(|_| {
        JsonRpcResponse::failure(Value::Null, PARSE_ERROR, "Parse error".to_string())
    })?;
    let id = parsed.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = serde_json::from_value(parsed).map_err(|_| {
        JsonRpcResponse::failure(id.clone(), INVALID_REQUEST, "Invalid request".to_string())
    })?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(JsonRpcResponse::failure(
            id,
            INVALID_REQUEST,
            format!("unsupported jsonrpc version: {}", request.jsonrpc),
        ));
    }
    Ok(request)
}

/// Extracts configuration fragments from `prepare` parameters.
///
/// Accepts either `{"config": [...]}` or the fragment array itself.
fn prepare_fragments(params: Value) -> Result<Vec<serde_yaml::Value>, String> {
    let fragments = match params {
        Value::Array(fragments) => fragments,
        Value::Object(mut object) => match object.remove("config") {
            Some(Value::Array(fragments)) => fragments,
            Some(other) => vec![other],
            None => return Err("prepare requires a 'config' array".to_string()),
        },
        Value::Null => Vec::new(),
        _ => return Err("prepare parameters must be an object or an array".to_string()),
    };

    fragments
        .iter()
        .map(|fragment| {
            serde_yaml::to_value(fragment)
                .map_err(|e| format!("invalid configuration fragment: {}", e))
        })
        .collect()
}

/// Runs the plugin server on standard input and output.
pub fn run_stdio(provisioner: Provisioner) -> Result<()> {
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    PluginServer::new(provisioner, stdin, stdout).serve()
}
