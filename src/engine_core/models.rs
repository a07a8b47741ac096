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

//! Domain models for the querygate proxy.
//!
//! This module contains pure data structures representing sessions, observed
//! steps, cast artifacts, and the JSON-RPC wire types. It is designed to be
//! free of I/O side effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Newtype wrapper around Uuid for type-safe session identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Generate a new random SessionId
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0.to_string()
    }
}

impl TryFrom<String> for SessionId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Uuid::parse_str(&s).map(SessionId)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StepId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(StepId)
    }
}

/// Identifier of a pending approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RequestId)
    }
}

/// Text that may have been byte-capped before storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedText {
    pub text: String,
    pub truncated: bool,
}

/// Repository/branch metadata attached to a session by an external
/// collaborator (the UI or CLI). The proxy core only persists it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// One agent conversation's container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<SessionContext>,
}

/// Kind of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ToolCall,
    ToolResult,
    Note,
    Blocker,
    BlockerDecision,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Note => "note",
            Self::Blocker => "blocker",
            Self::BlockerDecision => "blocker_decision",
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "note" => Ok(Self::Note),
            "blocker" => Ok(Self::Blocker),
            "blocker_decision" => Ok(Self::BlockerDecision),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Ok/error status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Stable categories for tool interactions, assigned by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepCategory {
    Query,
    Schema,
    List,
    Cast,
    Session,
    Unknown,
}

impl StepCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Schema => "schema",
            Self::List => "list",
            Self::Cast => "cast",
            Self::Session => "session",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for StepCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "schema" => Ok(Self::Schema),
            "list" => Ok(Self::List),
            "cast" => Ok(Self::Cast),
            "session" => Ok(Self::Session),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown step category: {other}")),
        }
    }
}

/// One recorded interaction.
///
/// Invariant: once persisted, identity and session linkage never change.
/// Only `summary`, `status`, and merged `args` may be amended in place,
/// used solely to annotate a blocker step with its eventual decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedStep {
    pub id: StepId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,

    pub kind: StepKind,
    pub name: String,

    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    /// One-line summary for UI display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Risk label for fast UI filtering ("LOW" / "MEDIUM" / "CRITICAL").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    /// Tables touched by this step (best-effort; may be partial).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables_touched: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_category: Option<StepCategory>,

    /// SQL excerpt as captured (capped). Only set when extractable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<TruncatedText>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_classification: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_rule_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_rows_shown: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_rows_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_bytes: Option<i64>,

    /// Normalized DB error message (capped). Useful when the raw result is opaque.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<TruncatedText>,
}

impl ObservedStep {
    /// A step with every optional field empty. Callers fill in what they know.
    pub fn new(session_id: SessionId, kind: StepKind, name: impl Into<String>) -> Self {
        Self {
            id: StepId::generate(),
            session_id,
            created_at: Utc::now(),
            kind,
            name: name.into(),
            status: StepStatus::Ok,
            duration_ms: None,
            summary: None,
            risk_level: None,
            warnings: None,
            tables_touched: None,
            target_type: None,
            tool_category: None,
            sql: None,
            sql_classification: None,
            policy_rule_ids: None,
            decision: None,
            result_rows_shown: None,
            result_rows_total: None,
            captured_bytes: None,
            error_message: None,
            args: None,
            result: None,
            preview: None,
        }
    }
}

/// Column schema entry of a table cast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
}

/// A table artifact persisted by the `cast_table` tool, row/column-capped
/// before storage and linked to the step that produced its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCast {
    pub id: Uuid,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub origin_step_id: StepId,
    pub title: String,
    pub sql: String,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<SchemaColumn>>,
    pub total_rows: usize,
    pub truncated: bool,
}

/// Tool definition as exchanged over MCP `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Result of a `tools/call`. Content items are kept as raw JSON so
/// non-text content passes through the proxy untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_content(text)],
            is_error: false,
        }
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_content(text)],
            is_error: true,
        }
    }
}

/// Build an MCP text content item.
pub fn text_content(text: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "type": "text", "text": text.into() })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id: Some(serde_json::Value::from(id)),
        }
    }

    /// A notification carries no id and expects no response.
    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: serde_json::Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_roundtrips_through_string() {
        let id = SessionId::generate();
        let s: String = id.into();
        let back: SessionId = s.parse().expect("parse back");
        assert_eq!(id, back);
    }

    #[test]
    fn tool_call_result_deserializes_without_is_error() {
        let raw = serde_json::json!({ "content": [ { "type": "text", "text": "hi" } ] });
        let result: ToolCallResult = serde_json::from_value(raw).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 1);
    }

    #[test]
    fn step_kind_string_roundtrip() {
        for kind in [
            StepKind::ToolCall,
            StepKind::ToolResult,
            StepKind::Note,
            StepKind::Blocker,
            StepKind::BlockerDecision,
        ] {
            assert_eq!(kind.as_str().parse::<StepKind>().unwrap(), kind);
        }
    }
}
