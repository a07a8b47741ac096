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

//! The protocol bridge.
//!
//! Runs as an MCP server for the agent, owns the target connection, and
//! routes every inbound tool call through allowlist -> SQL guard -> blocker
//! -> forward -> caps -> record. Blocking is synchronous from the agent's
//! perspective: a blocked call does not return until decided or timed out.

use chrono::Utc;
use futures_util::SinkExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connectors::interface::extract_sql;
use crate::connectors::registry::get_adapter;
use crate::engine::allowlist::is_tool_known_safe;
use crate::engine::sql_guard::{
    analyze_sql, derive_policy_rule_ids, should_block_sql, SqlWarning,
};
use crate::engine_core::blocker::{
    blocker_summary, PendingDecision, PendingRequest, PendingStatus,
};
use crate::engine_core::caps::{cap_preview, cap_text};
use crate::engine_core::constants::{blocker, caps, jsonrpc, methods, tools};
use crate::engine_core::errors::{ProxyError, StoreError};
use crate::engine_core::models::{
    JsonRpcRequest, JsonRpcResponse, ObservedStep, RequestId, SchemaColumn, SessionId, StepCategory,
    StepId, StepKind, StepStatus, ToolCallResult, ToolDef, TruncatedText,
};
use crate::mcp::codec::McpCodec;
use crate::mcp::pipeline::{spawn_downstream_reader, DownstreamEvent};
use crate::mcp::target::TargetConnection;
use crate::mcp::tools::{proxy_tool_definitions, CastOutcome, CastTools, SessionTools};
use crate::store::{SessionStore, StepUpdate};

/// MCP stdio proxy that forwards requests to a target server.
pub struct McpProxy {
    config: Arc<Config>,
    store: Arc<dyn SessionStore>,
    session_tools: SessionTools,
    cast_tools: CastTools,
    target: Option<Box<dyn TargetConnection>>,
    target_tools: Vec<ToolDef>,
    shutdown: CancellationToken,
}

impl McpProxy {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SessionStore>,
        target: Option<Box<dyn TargetConnection>>,
        shutdown: CancellationToken,
    ) -> Self {
        let connection_id = Uuid::new_v4();
        let session_tools = SessionTools::new(
            store.clone(),
            connection_id,
            config.session_idle_timeout(),
        );
        let cast_tools = CastTools::new(store.clone(), config.caps());
        Self {
            config,
            store,
            session_tools,
            cast_tools,
            target,
            target_tools: Vec::new(),
            shutdown,
        }
    }

    /// Start a session ahead of the first tool call.
    pub fn start_session(&self, title: Option<&str>) -> Result<SessionId, StoreError> {
        self.session_tools.session_start(title)
    }

    /// Fetch the target's tool catalogue for republication.
    pub async fn fetch_target_tools(&mut self) -> Result<(), ProxyError> {
        let Some(target) = self.target.as_mut() else {
            warn!("No target connected, running with proxy tools only");
            return Ok(());
        };
        self.target_tools = target.list_tools().await?;
        info!("Fetched {} tools from target", self.target_tools.len());
        Ok(())
    }

    /// All tools the proxy exposes: its own plus the target's, verbatim.
    pub fn all_tools(&self) -> Vec<ToolDef> {
        let mut all = proxy_tool_definitions();
        all.extend(self.target_tools.iter().cloned());
        all
    }

    /// Serve the agent over stdio until EOF or shutdown.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let (tx, mut rx) = mpsc::channel(64);
        spawn_downstream_reader(tokio::io::stdin(), tx);
        let mut writer = FramedWrite::new(tokio::io::stdout(), McpCodec::new());
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping proxy loop");
                    break;
                }
                event = rx.recv() => {
                    match event {
                        None | Some(DownstreamEvent::Disconnect) => {
                            info!("Client disconnected");
                            break;
                        }
                        Some(DownstreamEvent::Error(e)) => {
                            warn!("Downstream protocol error: {}", e);
                            let response = JsonRpcResponse::failure(
                                Value::Null,
                                jsonrpc::ERROR_PARSE,
                                "Parse error",
                            );
                            if writer.send(&response).await.is_err() {
                                break;
                            }
                        }
                        Some(DownstreamEvent::Request(request)) => {
                            if let Some(response) = self.handle_request(request).await {
                                if writer.send(&response).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.method.starts_with("notifications/") {
            return None;
        }
        let id = request.id.clone()?;

        match request.method.as_str() {
            methods::INITIALIZE => {
                let protocol_version = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .cloned()
                    .unwrap_or_else(|| json!("2024-11-05"));
                Some(JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": protocol_version,
                        "capabilities": { "tools": {} },
                        "serverInfo": {
                            "name": "querygate",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                ))
            }
            methods::PING => Some(JsonRpcResponse::success(id, json!({}))),
            methods::TOOLS_LIST => Some(JsonRpcResponse::success(
                id,
                json!({ "tools": self.all_tools() }),
            )),
            methods::TOOLS_CALL => {
                let params = request.params.unwrap_or_else(|| json!({}));
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return Some(JsonRpcResponse::failure(
                        id,
                        jsonrpc::ERROR_INVALID_REQUEST,
                        "tools/call requires a tool name",
                    ));
                };
                let arguments = params
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();

                let result = self.handle_tool_call(name, arguments).await;
                Some(JsonRpcResponse::success(
                    id,
                    json!({ "content": result.content, "isError": result.is_error }),
                ))
            }
            other => Some(JsonRpcResponse::failure(
                id,
                jsonrpc::ERROR_METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    /// Route a tool call: session tools and casts are local, everything else
    /// runs the guard pipeline and is forwarded.
    pub async fn handle_tool_call(
        &mut self,
        name: &str,
        mut arguments: Map<String, Value>,
    ) -> ToolCallResult {
        let start = Instant::now();
        // Pre-allocate the step id so artifacts (casts) can link to this step
        let step_id = StepId::generate();

        match name {
            tools::SESSION_START | tools::SESSION_END | tools::SESSION_CURRENT => {
                self.handle_session_tool(name, &arguments)
            }
            tools::CAST_TABLE => {
                arguments.insert("origin_step_id".to_string(), json!(step_id.to_string()));
                self.handle_cast_table(&arguments, step_id, start)
            }
            _ => {
                self.handle_forwarded_call(name, arguments, step_id, start)
                    .await
            }
        }
    }

    fn handle_session_tool(&self, name: &str, arguments: &Map<String, Value>) -> ToolCallResult {
        match name {
            tools::SESSION_START => {
                let title = arguments.get("title").and_then(Value::as_str);
                match self.session_tools.session_start(title) {
                    Ok(session_id) => {
                        ToolCallResult::text(format!("Session started: {session_id}"))
                    }
                    Err(e) => {
                        error!("Failed to start session: {}", e);
                        ToolCallResult::error_text("Failed to start session")
                    }
                }
            }
            tools::SESSION_END => {
                let session_id = arguments
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if self.session_tools.session_end(session_id) {
                    ToolCallResult::text(format!("Session ended: {session_id}"))
                } else {
                    ToolCallResult::text("Session not found or not current")
                }
            }
            _ => match self.session_tools.session_current() {
                Some(session_id) => {
                    ToolCallResult::text(format!("Current session: {session_id}"))
                }
                None => ToolCallResult::text("No active session"),
            },
        }
    }

    fn handle_cast_table(
        &mut self,
        arguments: &Map<String, Value>,
        step_id: StepId,
        start: Instant,
    ) -> ToolCallResult {
        let outcome = self.run_cast_table(arguments, step_id);
        match outcome {
            Ok(outcome) => {
                let payload = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
                let result = ToolCallResult::text(payload.to_string());
                self.record_step(StepContext {
                    name: tools::CAST_TABLE,
                    args: &redact_cast_table_args(arguments),
                    result_payload: payload,
                    rpc_error: false,
                    duration_ms: start.elapsed().as_millis() as i64,
                    step_id,
                    cast_outcome: Some(outcome),
                });
                result
            }
            Err(message) => {
                self.record_step(StepContext {
                    name: tools::CAST_TABLE,
                    args: &redact_cast_table_args(arguments),
                    result_payload: json!({ "error": message }),
                    rpc_error: true,
                    duration_ms: start.elapsed().as_millis() as i64,
                    step_id,
                    cast_outcome: None,
                });
                ToolCallResult::error_text(message)
            }
        }
    }

    fn run_cast_table(
        &self,
        arguments: &Map<String, Value>,
        step_id: StepId,
    ) -> Result<CastOutcome, String> {
        let title = arguments
            .get("title")
            .and_then(Value::as_str)
            .ok_or("cast_table requires a title")?;
        let sql = arguments
            .get("sql")
            .and_then(Value::as_str)
            .ok_or("cast_table requires sql")?;
        let rows: Vec<Map<String, Value>> = arguments
            .get("rows")
            .and_then(Value::as_array)
            .ok_or("cast_table requires rows")?
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        let columns: Option<Vec<SchemaColumn>> = arguments
            .get("columns")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| format!("invalid columns: {e}"))?;

        self.cast_tools
            .cast_table(
                &self.session_tools,
                title,
                sql,
                rows,
                Some(step_id),
                columns,
            )
            .map_err(|e| {
                error!("cast_table failed: {}", e);
                "Failed to store cast".to_string()
            })
    }

    async fn handle_forwarded_call(
        &mut self,
        name: &str,
        arguments: Map<String, Value>,
        step_id: StepId,
        start: Instant,
    ) -> ToolCallResult {
        // Ensure a session exists for forwarded calls
        if let Err(e) = self.session_tools.ensure_session() {
            error!("Failed to ensure session: {}", e);
            return ToolCallResult::error_text("Session store unavailable");
        }

        if self.config.policy.protective_mode {
            let adapter = get_adapter(&self.config.target.target_type);
            if !is_tool_known_safe(name, adapter, Some(&arguments)) {
                match self.require_approval_for_unknown_tool(name, &arguments).await {
                    Ok(Some(refusal)) => return refusal,
                    Ok(None) => {}
                    Err(ProxyError::Shutdown) => {
                        return ToolCallResult::text("Proxy shutting down; call not forwarded")
                    }
                    Err(e) => {
                        error!("Unknown-tool approval failed: {}", e);
                        return ToolCallResult::error_text("Approval flow unavailable");
                    }
                }
            }

            // Check SQL regardless of tool categorization: unrecognized tool
            // aliases must not bypass the guard.
            let sql = extract_sql(adapter, name, &arguments);
            if let Some(sql) = sql {
                match self.protective_sql_check(name, &sql).await {
                    Ok(Some(refusal)) => return refusal,
                    Ok(None) => {}
                    Err(ProxyError::Shutdown) => {
                        return ToolCallResult::text("Proxy shutting down; call not forwarded")
                    }
                    Err(e) => {
                        error!("Protective mode check failed: {}", e);
                        return ToolCallResult::error_text("Approval flow unavailable");
                    }
                }
            }
        }

        // Forward to target
        let Some(target) = self.target.as_mut() else {
            return ToolCallResult::text("Target server not connected");
        };

        match target.call_tool(name, &arguments).await {
            Ok(mut result) => {
                let rpc_error = result.is_error;
                self.apply_response_caps(&mut result);
                self.record_step(StepContext {
                    name,
                    args: &arguments,
                    result_payload: Value::Array(result.content.clone()),
                    rpc_error,
                    duration_ms: start.elapsed().as_millis() as i64,
                    step_id,
                    cast_outcome: None,
                });
                result
            }
            Err(e) => {
                warn!("Tool call {} failed: {}", name, e);
                self.record_step(StepContext {
                    name,
                    args: &arguments,
                    result_payload: json!({ "error": e.to_string() }),
                    rpc_error: true,
                    duration_ms: start.elapsed().as_millis() as i64,
                    step_id,
                    cast_outcome: None,
                });
                ToolCallResult::error_text(format!("Tool call failed: {e}"))
            }
        }
    }

    /// Cap the text content of a forwarded response, appending a marker when
    /// anything was cut. Applied in every safety mode.
    fn apply_response_caps(&self, result: &mut ToolCallResult) {
        let caps_config = self.config.caps();
        for item in &mut result.content {
            let is_text = item.get("type").and_then(Value::as_str) == Some("text");
            if !is_text {
                continue;
            }
            let Some(text) = item.get("text").and_then(Value::as_str) else {
                continue;
            };
            let capped = cap_preview(&Value::String(text.to_string()), &caps_config);
            if capped.was_truncated() {
                let summary = capped.truncation_summary().unwrap_or_default();
                let body = capped.data.as_str().unwrap_or_default();
                item["text"] = json!(format!("{body}\n\n[Preview truncated: {summary}]"));
            }
        }
    }

    /// Apply protective mode policy checks to a SQL-bearing call. Returns the
    /// refusal to hand the agent when the call was blocked and not allowed.
    async fn protective_sql_check(
        &mut self,
        name: &str,
        sql: &str,
    ) -> Result<Option<ToolCallResult>, ProxyError> {
        let (should_block, reason) = should_block_sql(sql, &self.config.policy);
        if !should_block {
            return Ok(None);
        }

        let guard = analyze_sql(sql);
        let policy_rule_ids = derive_policy_rule_ids(&guard, &self.config.policy);
        let Some(session_id) = self.session_tools.session_current() else {
            return Ok(Some(ToolCallResult::text("No active session")));
        };

        let reason = reason.or_else(|| guard.reason.clone());
        let pending = PendingRequest::new(
            session_id,
            name,
            Some(json!({ "sql": cap_for_step_args(sql) })),
            Some(guard.classification.as_str().to_string()),
            Some(guard.risk_level.as_str().to_string()),
            reason.clone(),
            None,
        );
        self.store.create_pending_request(&pending)?;

        let adapter = get_adapter(&self.config.target.target_type);
        let (sql_text, sql_truncated) = cap_text(sql, caps::SQL_EXCERPT_CAP_BYTES);
        let sql_excerpt = TruncatedText {
            text: sql_text,
            truncated: sql_truncated,
        };

        let mut blocker_step = ObservedStep::new(session_id, StepKind::Blocker, name);
        blocker_step.summary = Some(format!(
            "Blocked: {}",
            reason.as_deref().unwrap_or("High-risk SQL")
        ));
        blocker_step.risk_level = Some(guard.risk_level.as_str().to_string());
        if !guard.warnings.is_empty() {
            blocker_step.warnings = Some(guard.warning_labels());
        }
        blocker_step.target_type = Some(adapter.target_type().to_string());
        // SQL was extracted, so this is a query regardless of catalog knowledge
        blocker_step.tool_category = Some(StepCategory::Query);
        blocker_step.sql = Some(sql_excerpt.clone());
        blocker_step.sql_classification = Some(guard.classification.as_str().to_string());
        blocker_step.policy_rule_ids = Some(policy_rule_ids.clone());
        blocker_step.decision = Some("pending".to_string());
        blocker_step.captured_bytes = Some(sql_excerpt.text.len() as i64);
        blocker_step.args = Some(json!({
            "request_id": pending.id.to_string(),
            "sql": pending.arguments.as_ref().and_then(|a| a.get("sql")).cloned(),
            "reason": reason,
            "classification": pending.classification,
            "risk_level": pending.risk_level,
            "policy_rule_ids": policy_rule_ids,
        }));
        let blocker_step_id = blocker_step.id;
        self.store_step(blocker_step);

        let decided = await_pending_decision(
            &self.store,
            pending.id,
            session_id,
            self.config.blocker_timeout(),
            blocker::POLL_INTERVAL,
            &self.shutdown,
        )
        .await?;
        let decision = decision_of(decided.status);
        self.finish_blocker_step(blocker_step_id, name, decision);

        if decision != PendingDecision::Allowed {
            let denial_reason = pending
                .reason
                .clone()
                .unwrap_or_else(|| "High-risk operation".to_string());
            return Ok(Some(refusal_message(decision, &denial_reason)));
        }

        Ok(None)
    }

    /// Require explicit approval for unknown tools in protective mode.
    async fn require_approval_for_unknown_tool(
        &mut self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Option<ToolCallResult>, ProxyError> {
        let Some(session_id) = self.session_tools.session_current() else {
            return Ok(Some(ToolCallResult::text("No active session")));
        };

        let reason = "Unknown tool; requires approval in protective mode.";
        let summarized = summarize_unknown_tool_args(arguments);
        let pending = PendingRequest::new(
            session_id,
            name,
            (!summarized.is_empty()).then(|| Value::Object(summarized)),
            Some("unknown".to_string()),
            Some("unknown".to_string()),
            Some(reason.to_string()),
            None,
        );
        self.store.create_pending_request(&pending)?;

        let adapter = get_adapter(&self.config.target.target_type);
        let category = adapter.categorize_tool(name);
        let policy_rule_ids = vec!["unknown_tool_requires_approval".to_string()];

        let mut blocker_step = ObservedStep::new(session_id, StepKind::Blocker, name);
        blocker_step.summary = Some(format!("Blocked: {reason}"));
        blocker_step.risk_level = pending.risk_level.clone();
        blocker_step.target_type = Some(adapter.target_type().to_string());
        blocker_step.tool_category =
            (category != StepCategory::Session).then_some(category);
        blocker_step.policy_rule_ids = Some(policy_rule_ids.clone());
        blocker_step.decision = Some("pending".to_string());
        blocker_step.args = Some(json!({
            "request_id": pending.id.to_string(),
            "reason": reason,
            "tool_name": name,
            "policy_rule_ids": policy_rule_ids,
        }));
        let blocker_step_id = blocker_step.id;
        self.store_step(blocker_step);

        let decided = await_pending_decision(
            &self.store,
            pending.id,
            session_id,
            self.config.blocker_timeout(),
            blocker::POLL_INTERVAL,
            &self.shutdown,
        )
        .await?;
        let decision = decision_of(decided.status);
        self.finish_blocker_step(blocker_step_id, name, decision);

        if decision != PendingDecision::Allowed {
            return Ok(Some(refusal_message(decision, reason)));
        }

        Ok(None)
    }

    /// Annotate the original blocker step with its decision, in place.
    fn finish_blocker_step(&self, step_id: StepId, name: &str, decision: PendingDecision) {
        let mut args = Map::new();
        args.insert("decision".to_string(), json!(decision.as_str()));
        let update = StepUpdate {
            summary: Some(blocker_summary(name, decision)),
            status: None,
            args: Some(args),
        };
        if let Err(e) = self.store.update_step(step_id, &update) {
            error!("Failed to update blocker step {}: {}", step_id, e);
        }
    }

    fn record_step(&self, ctx: StepContext<'_>) {
        let Some(session_id) = self.session_tools.session_current() else {
            return;
        };

        let adapter = get_adapter(&self.config.target.target_type);
        let category = if ctx.name == tools::CAST_TABLE {
            StepCategory::Cast
        } else {
            adapter.categorize_tool(ctx.name)
        };

        let sql_for_analysis: Option<String> = if ctx.name == tools::CAST_TABLE {
            ctx.args.get("sql").and_then(Value::as_str).map(str::to_string)
        } else if category == StepCategory::Query {
            extract_sql(adapter, ctx.name, ctx.args)
        } else {
            None
        };

        let mut sql = None;
        let mut sql_classification = None;
        let mut risk_level = None;
        let mut warnings: Option<Vec<String>> = None;
        if let Some(sql_text) = &sql_for_analysis {
            let (capped, truncated) = cap_text(sql_text, caps::SQL_EXCERPT_CAP_BYTES);
            sql = Some(TruncatedText {
                text: capped,
                truncated,
            });
            let guard = analyze_sql(sql_text);
            sql_classification = Some(guard.classification.as_str().to_string());
            risk_level = Some(guard.risk_level.as_str().to_string());
            if !guard.warnings.is_empty() {
                warnings = Some(guard.warning_labels());
            }
        }

        let mut status = if ctx.rpc_error {
            StepStatus::Error
        } else {
            StepStatus::Ok
        };

        // Best-effort: database engines often report failures inside a
        // successful RPC envelope
        let mut error_message = None;
        if category == StepCategory::Query {
            if let Some(message) = extract_query_error_message(&ctx.result_payload) {
                let (capped, _) = cap_text(&message, caps::ERROR_MESSAGE_CAP_BYTES);
                error_message = Some(capped);
                status = StepStatus::Error;
            }
        }
        if status == StepStatus::Error && error_message.is_none() {
            if let Some(message) = extract_query_error_message(&ctx.result_payload) {
                let (capped, _) = cap_text(&message, caps::ERROR_MESSAGE_CAP_BYTES);
                error_message = Some(capped);
            }
        }

        let result_text =
            serde_json::to_string(&ctx.result_payload).unwrap_or_else(|_| String::new());
        let (preview_text, preview_truncated) =
            cap_text(&result_text, caps::STEP_PREVIEW_CAP_BYTES);

        let mut captured_bytes = preview_text.len() as i64;
        if let Some(sql) = &sql {
            captured_bytes += sql.text.len() as i64;
        }
        if let Some(message) = &error_message {
            captured_bytes += message.len() as i64;
        }

        let mut result_rows_shown = None;
        let mut result_rows_total = None;
        if let Some(outcome) = &ctx.cast_outcome {
            result_rows_shown = Some(outcome.rows_shown as i64);
            result_rows_total = Some(outcome.total_rows as i64);
            // A cast filling the row cap likely means the query returned more
            if outcome.rows_shown >= self.cast_tools.caps().max_rows {
                warnings
                    .get_or_insert_with(Vec::new)
                    .push(SqlWarning::ApproachedRowCap.as_str().to_string());
            }
        }

        let mut step = ObservedStep::new(session_id, StepKind::ToolCall, ctx.name);
        step.id = ctx.step_id;
        step.status = status;
        step.duration_ms = Some(ctx.duration_ms);
        step.summary = Some(compute_step_summary(ctx.name, status));
        step.risk_level = risk_level;
        step.warnings = warnings;
        step.target_type = Some(adapter.target_type().to_string());
        step.tool_category = (category != StepCategory::Session).then_some(category);
        step.sql = sql;
        step.sql_classification = sql_classification;
        step.result_rows_shown = result_rows_shown;
        step.result_rows_total = result_rows_total;
        step.captured_bytes = Some(captured_bytes);
        step.error_message = error_message;
        step.args = Some(Value::Object(ctx.args.clone()));
        step.result = Some(ctx.result_payload);
        step.preview = Some(TruncatedText {
            text: preview_text,
            truncated: preview_truncated,
        });

        self.store_step(step);
    }

    /// Store a step, auto-creating a session if the owner vanished.
    ///
    /// The session may have been deleted out-of-band between step-start and
    /// step-persist. Recover once with a fresh session; if that also fails,
    /// log and drop the step. Observability must never take down the bridge.
    fn store_step(&self, mut step: ObservedStep) {
        match self.store.add_step(&step) {
            Ok(()) => {}
            Err(StoreError::SessionNotFound(_)) => {
                warn!(
                    "Step session {} not found, creating new session and retrying",
                    step.session_id
                );
                match self.session_tools.session_start(Some("Recovered Session")) {
                    Ok(new_session_id) => {
                        step.session_id = new_session_id;
                        match self.store.add_step(&step) {
                            Ok(()) => {
                                info!(
                                    "Successfully stored step in recovered session {}",
                                    new_session_id
                                );
                            }
                            Err(e) => {
                                error!(
                                    "CRITICAL: failed to record step even after session recovery: {}",
                                    e
                                );
                            }
                        }
                    }
                    Err(e) => {
                        error!(
                            "CRITICAL: failed to recover session for step {}: {}",
                            step.id, e
                        );
                    }
                }
            }
            Err(e) => {
                error!("Failed to record step: {}", e);
            }
        }
    }
}

struct StepContext<'a> {
    name: &'a str,
    args: &'a Map<String, Value>,
    result_payload: Value,
    rpc_error: bool,
    duration_ms: i64,
    step_id: StepId,
    cast_outcome: Option<CastOutcome>,
}

fn decision_of(status: PendingStatus) -> PendingDecision {
    match status {
        PendingStatus::Allowed => PendingDecision::Allowed,
        PendingStatus::Timeout => PendingDecision::Timeout,
        // Pending never comes back from await_pending_decision; anything
        // else maps to denied
        _ => PendingDecision::Denied,
    }
}

/// The three mutually exclusive agent-facing block outcomes. Denial and
/// timeout both instruct the agent to never silently retry.
fn refusal_message(decision: PendingDecision, reason: &str) -> ToolCallResult {
    let message = match decision {
        PendingDecision::Timeout => format!(
            "⏳ TIMEOUT: The user did not approve this action in time.\n\
             Reason: {reason}\n\
             STOP: Do not retry this operation automatically. Ask the user for guidance."
        ),
        _ => format!(
            "⛔ BLOCKED: This action was explicitly denied by the user.\n\
             Reason: {reason}\n\
             STOP: You MUST NOT retry this operation. It is forbidden."
        ),
    };
    ToolCallResult::text(message)
}

/// Poll the store until the pending request is decided or the deadline
/// elapses, at which point the proxy itself writes the timeout decision.
///
/// A record that vanished mid-poll (owning session deleted out-of-band) is
/// treated as denied, never allowed. Cancellable by shutdown; store writes
/// are single statements, so cancellation never leaves a half-written record.
pub async fn await_pending_decision(
    store: &Arc<dyn SessionStore>,
    request_id: RequestId,
    session_id: SessionId,
    deadline: Duration,
    poll_interval: Duration,
    shutdown: &CancellationToken,
) -> Result<PendingRequest, ProxyError> {
    let started = Instant::now();
    loop {
        let Some(pending) = store.get_pending_request(request_id)? else {
            return Ok(PendingRequest {
                id: request_id,
                session_id,
                created_at: Utc::now(),
                tool_name: "query".to_string(),
                arguments: None,
                classification: None,
                risk_level: None,
                reason: Some("Pending request disappeared".to_string()),
                blocker_step_id: None,
                status: PendingStatus::Denied,
                decided_at: Some(Utc::now()),
            });
        };

        if pending.status.is_terminal() {
            return Ok(pending);
        }

        let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
            // Deadline passed: the proxy is authoritative for the timeout.
            // decide is idempotent, so racing a simultaneous human decision
            // is benign - the first write wins.
            let decided = store.decide_pending_request(request_id, PendingStatus::Timeout)?;
            return Ok(decided.unwrap_or(pending));
        };

        let sleep_for = poll_interval.min(remaining);
        tokio::select! {
            _ = shutdown.cancelled() => return Err(ProxyError::Shutdown),
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

fn compute_step_summary(name: &str, status: StepStatus) -> String {
    match status {
        StepStatus::Error => format!("{name} failed"),
        StepStatus::Ok => name.to_string(),
    }
}

/// Scan a result payload for an application-level error hidden inside a
/// successful RPC envelope.
fn extract_query_error_message(result: &Value) -> Option<String> {
    match result {
        Value::Array(items) => items.iter().find_map(extract_error_message),
        other => extract_error_message(other),
    }
}

fn extract_error_message(payload: &Value) -> Option<String> {
    match payload {
        Value::String(text) => extract_error_from_text(text),
        Value::Object(map) => {
            if let Some(message) = map.get("error").and_then(extract_error_from_value) {
                return Some(message);
            }
            if let Some(message) = map.get("errors").and_then(extract_error_from_value) {
                return Some(message);
            }
            map.get("text")
                .and_then(Value::as_str)
                .and_then(extract_error_from_text)
        }
        _ => None,
    }
}

fn extract_error_from_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let parsed: Value = serde_json::from_str(trimmed).ok()?;
        return extract_error_message(&parsed);
    }
    if trimmed.to_lowercase().starts_with("database error") {
        return Some(trimmed.to_string());
    }
    None
}

fn extract_error_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        Value::Array(items) => items.iter().find_map(extract_error_from_value),
        _ => None,
    }
}

/// Keep recorded args bounded even if the agent sends very large SQL.
fn cap_for_step_args(text: &str) -> String {
    let (capped, truncated) = cap_text(text, caps::SQL_EXCERPT_CAP_BYTES);
    if truncated {
        format!("{capped}\n-- [truncated]")
    } else {
        capped
    }
}

/// Summarize unknown tool arguments without storing full payloads.
fn summarize_unknown_tool_args(arguments: &Map<String, Value>) -> Map<String, Value> {
    let mut summarized = Map::new();
    for (key, value) in arguments {
        let summary = match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if text.len() <= 120 {
                    json!(text)
                } else {
                    json!("<omitted>")
                }
            }
            Value::Array(items) => json!(format!("<list len={}>", items.len())),
            Value::Object(map) => json!(format!("<object keys={}>", map.len())),
            Value::Null => json!("<null>"),
        };
        summarized.insert(key.clone(), summary);
    }
    summarized
}

/// Redact potentially large cast payloads before persisting the step. The
/// cast artifact itself is stored separately with hard caps applied.
fn redact_cast_table_args(args: &Map<String, Value>) -> Map<String, Value> {
    let mut redacted = args.clone();
    if let Some(rows) = redacted.get("rows") {
        let replacement = match rows {
            Value::Array(items) => json!(format!("<omitted {} rows>", items.len())),
            _ => json!("<omitted>"),
        };
        redacted.insert("rows".to_string(), replacement);
    }
    redacted
}
