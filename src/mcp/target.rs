// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Target connection: the client side of the bridge.
//!
//! `StdioTarget` owns the spawned target subprocess, performs the MCP
//! initialize handshake, and correlates requests with responses over the
//! single stdio pipe. The proxy issues at most one call at a time, so
//! correlation is a linear scan of incoming events.

use async_trait::async_trait;
use futures_util::SinkExt;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::engine_core::constants::methods;
use crate::engine_core::errors::ProxyError;
use crate::engine_core::models::{JsonRpcRequest, JsonRpcResponse, ToolCallResult, ToolDef};
use crate::mcp::codec::McpCodec;
use crate::mcp::pipeline::{spawn_upstream_reader, spawn_upstream_stderr_drain, UpstreamEvent};
use crate::mcp::process::ProcessSupervisor;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The proxy's view of the target server.
///
/// A trait seam so tests can stand in a scripted double for the subprocess.
#[async_trait]
pub trait TargetConnection: Send {
    async fn list_tools(&mut self) -> Result<Vec<ToolDef>, ProxyError>;

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolCallResult, ProxyError>;
}

pub struct StdioTarget {
    _supervisor: ProcessSupervisor,
    writer: FramedWrite<Box<dyn AsyncWrite + Unpin + Send>, McpCodec>,
    events: mpsc::Receiver<UpstreamEvent>,
    next_id: i64,
}

impl StdioTarget {
    /// Spawn the configured target command and complete the MCP handshake.
    pub async fn connect(config: &TargetConfig) -> Result<Self, ProxyError> {
        let Some((cmd, args)) = config.command.split_first() else {
            return Err(ProxyError::Config("no target command configured".to_string()));
        };

        let (tx, rx) = mpsc::channel(64);
        let (supervisor, stdin, stdout, stderr) =
            ProcessSupervisor::spawn(cmd, args, config.env.as_ref(), tx.clone())?;

        let stdin = stdin
            .ok_or_else(|| ProxyError::Process("target stdin not captured".to_string()))?;
        let stdout = stdout
            .ok_or_else(|| ProxyError::Process("target stdout not captured".to_string()))?;
        if let Some(stderr) = stderr {
            spawn_upstream_stderr_drain(stderr, tx.clone());
        }
        spawn_upstream_reader(stdout, tx);

        let mut target = Self {
            _supervisor: supervisor,
            writer: FramedWrite::new(stdin, McpCodec::new()),
            events: rx,
            next_id: 1,
        };

        target.initialize().await?;
        Ok(target)
    }

    async fn initialize(&mut self) -> Result<(), ProxyError> {
        let response = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.request(
                methods::INITIALIZE,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {
                        "name": "querygate",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
        )
        .await
        .map_err(|_| ProxyError::TargetUnavailable("initialize handshake timed out".to_string()))??;

        if let Some(error) = response.error {
            return Err(ProxyError::Protocol(format!(
                "initialize failed: {}",
                error.message
            )));
        }

        self.send(&JsonRpcRequest::notification(methods::INITIALIZED, json!({})))
            .await?;
        info!("Connected to target server");
        Ok(())
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), ProxyError> {
        self.writer
            .send(request)
            .await
            .map_err(|e| ProxyError::Protocol(format!("write to target failed: {}", e)))
    }

    /// Send one request and wait for its response, surfacing target logs and
    /// termination along the way.
    async fn request(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<JsonRpcResponse, ProxyError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&JsonRpcRequest::new(id, method, params)).await?;

        let expected = Value::from(id);
        loop {
            match self.events.recv().await {
                Some(UpstreamEvent::Response(response)) => {
                    if response.id == expected {
                        return Ok(response);
                    }
                    debug!("Discarding stale response id {:?}", response.id);
                }
                Some(UpstreamEvent::Log(line)) => {
                    debug!(target: "target_stderr", "{}", line);
                }
                Some(UpstreamEvent::Terminated(code)) => {
                    warn!("Target process terminated with code {:?}", code);
                    return Err(ProxyError::TargetUnavailable(format!(
                        "target process exited (code {:?})",
                        code
                    )));
                }
                None => {
                    return Err(ProxyError::TargetUnavailable(
                        "target event channel closed".to_string(),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl TargetConnection for StdioTarget {
    async fn list_tools(&mut self) -> Result<Vec<ToolDef>, ProxyError> {
        let response = self.request(methods::TOOLS_LIST, json!({})).await?;
        if let Some(error) = response.error {
            return Err(ProxyError::Protocol(format!(
                "tools/list failed: {}",
                error.message
            )));
        }
        let tools = response
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .cloned()
            .unwrap_or_else(|| json!([]));
        serde_json::from_value(tools)
            .map_err(|e| ProxyError::Protocol(format!("bad tools/list payload: {}", e)))
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolCallResult, ProxyError> {
        let response = self
            .request(
                methods::TOOLS_CALL,
                json!({ "name": name, "arguments": arguments }),
            )
            .await?;

        if let Some(error) = response.error {
            // RPC-level fault from the target; surface as an error result so
            // the agent sees text, not a protocol exception
            return Ok(ToolCallResult::error_text(format!(
                "Target error: {}",
                error.message
            )));
        }

        let result = response.result.unwrap_or_else(|| json!({}));
        serde_json::from_value(result)
            .map_err(|e| ProxyError::Protocol(format!("bad tools/call payload: {}", e)))
    }
}
