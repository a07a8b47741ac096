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

//! Adapter interface for normalizing target MCP tool calls.
//!
//! Adapters map target-specific tool names to stable categories and extract
//! evidence fields (SQL, table name) from arguments. Alias resolution is the
//! adapter's responsibility, invisible to the proxy core. Adapters must not
//! create unbounded previews.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::engine_core::caps::cap_text;
use crate::engine_core::models::StepCategory;

/// Default preview cap (8 KiB)
pub const DEFAULT_PREVIEW_CAP_BYTES: usize = 8 * 1024;

// Argument keys checked, in preference order, when extracting SQL.
const SQL_KEYS: &[&str] = &["sql", "query", "statement", "command"];
const TABLE_KEYS: &[&str] = &["table", "table_name", "tableName", "name"];

/// Target-specific adapter.
///
/// One implementing type per target engine, selected through the registry.
/// Category and alias tables are static data; the trait supplies shared
/// evidence-extraction and preview logic on top of them.
pub trait Adapter: Send + Sync {
    /// The target type this adapter handles (e.g. "duckdb", "postgres").
    fn target_type(&self) -> &'static str;

    /// Tool name -> category table.
    fn tool_categories(&self) -> &'static [(&'static str, StepCategory)];

    /// Alternative name -> canonical name table.
    fn tool_aliases(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    fn resolve_tool_name<'a>(&self, tool_name: &'a str) -> &'a str {
        self.tool_aliases()
            .iter()
            .find(|(alias, _)| *alias == tool_name)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(tool_name)
    }

    fn categorize_tool(&self, tool_name: &str) -> StepCategory {
        let resolved = self.resolve_tool_name(tool_name);
        self.tool_categories()
            .iter()
            .find(|(name, _)| *name == resolved)
            .map(|(_, category)| *category)
            .unwrap_or(StepCategory::Unknown)
    }

    /// Extract evidence fields (sql, table, ...) from a tool call.
    fn extract_evidence(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
    ) -> HashMap<String, Value> {
        let mut evidence = HashMap::new();

        for key in SQL_KEYS {
            if let Some(value) = arguments.get(*key) {
                evidence.insert("sql".to_string(), value.clone());
                break;
            }
        }

        for key in TABLE_KEYS {
            if let Some(value) = arguments.get(*key) {
                evidence.insert("table".to_string(), value.clone());
                break;
            }
        }

        let _ = tool_name;
        evidence
    }

    /// Build a byte-capped preview from a tool result.
    fn build_preview(&self, result: &Value, max_bytes: usize) -> (String, bool) {
        match result {
            Value::Null => (String::new(), false),
            Value::String(text) => cap_text(text, max_bytes),
            other => {
                let text = serde_json::to_string_pretty(other).unwrap_or_default();
                cap_text(&text, max_bytes)
            }
        }
    }
}

/// Extract the SQL string from a tool call, if any.
///
/// Avoids brittle assumptions about argument key names ("sql" vs "query");
/// non-string values are stringified, matching what an agent actually sent.
pub fn extract_sql(
    adapter: &dyn Adapter,
    tool_name: &str,
    arguments: &Map<String, Value>,
) -> Option<String> {
    let evidence = adapter.extract_evidence(tool_name, arguments);
    match evidence.get("sql")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::registry::get_adapter;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn sql_key_preference_order() {
        let adapter = get_adapter("generic");
        let arguments = args(&[
            ("query", json!("SELECT 2")),
            ("sql", json!("SELECT 1")),
        ]);
        let sql = extract_sql(adapter, "query", &arguments);
        assert_eq!(sql.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn statement_and_command_keys_are_recognized() {
        let adapter = get_adapter("generic");
        for key in ["statement", "command"] {
            let arguments = args(&[(key, json!("SELECT 1"))]);
            assert_eq!(
                extract_sql(adapter, "query", &arguments).as_deref(),
                Some("SELECT 1")
            );
        }
    }

    #[test]
    fn no_sql_key_yields_none() {
        let adapter = get_adapter("generic");
        let arguments = args(&[("path", json!("/tmp/x"))]);
        assert!(extract_sql(adapter, "read_file", &arguments).is_none());
    }

    #[test]
    fn non_string_sql_is_stringified() {
        let adapter = get_adapter("generic");
        let arguments = args(&[("sql", json!(42))]);
        assert_eq!(extract_sql(adapter, "query", &arguments).as_deref(), Some("42"));
    }

    #[test]
    fn preview_is_byte_capped() {
        let adapter = get_adapter("generic");
        let (preview, truncated) = adapter.build_preview(&json!("x".repeat(100)), 10);
        assert!(truncated);
        assert!(preview.len() <= 10);
    }
}
