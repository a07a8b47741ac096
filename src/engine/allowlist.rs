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

//! Allowlist policy: which tools are known safe without deep inspection.
//!
//! A call that is neither a proxy-native tool, nor schema/list, nor
//! SQL-bearing is NOT known-safe and is treated as an unknown tool
//! (fail-closed, not fail-open).

use serde_json::{Map, Value};

use crate::connectors::interface::{extract_sql, Adapter};
use crate::engine_core::constants::tools;
use crate::engine_core::models::StepCategory;

/// The proxy's own lifecycle/artifact tools, always safe.
pub const SAFE_NATIVE_TOOLS: &[&str] = &[
    tools::SESSION_START,
    tools::SESSION_END,
    tools::SESSION_CURRENT,
    tools::CAST_TABLE,
];

/// Return true if the tool is known to be safe in protective mode.
///
/// Rule, in order: proxy-native tools are safe; schema/list categories are
/// safe; otherwise safe only when the adapter can extract SQL from the
/// arguments (the SQL itself is classified downstream).
pub fn is_tool_known_safe(
    tool_name: &str,
    adapter: &dyn Adapter,
    arguments: Option<&Map<String, Value>>,
) -> bool {
    if SAFE_NATIVE_TOOLS.contains(&tool_name) {
        return true;
    }

    let category = adapter.categorize_tool(tool_name);
    if matches!(category, StepCategory::Schema | StepCategory::List) {
        return true;
    }

    let Some(arguments) = arguments else {
        return false;
    };

    extract_sql(adapter, tool_name, arguments).is_some()
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
    fn native_tools_are_always_safe() {
        let adapter = get_adapter("generic");
        for tool in SAFE_NATIVE_TOOLS {
            assert!(is_tool_known_safe(tool, adapter, None));
        }
    }

    #[test]
    fn schema_and_list_tools_are_safe() {
        let adapter = get_adapter("duckdb");
        assert!(is_tool_known_safe("describe_table", adapter, None));
        assert!(is_tool_known_safe("list_tables", adapter, None));
    }

    #[test]
    fn sql_bearing_call_is_safe_to_inspect_downstream() {
        let adapter = get_adapter("generic");
        let arguments = args(&[("sql", json!("SELECT 1"))]);
        // Even an unrecognized tool name is fine if its SQL can be classified
        assert!(is_tool_known_safe("weird_query_tool", adapter, Some(&arguments)));
    }

    #[test]
    fn unrecognized_tool_without_sql_is_not_safe() {
        let adapter = get_adapter("generic");
        let arguments = args(&[("path", json!("/etc/passwd"))]);
        assert!(!is_tool_known_safe("read_file", adapter, Some(&arguments)));
        assert!(!is_tool_known_safe("read_file", adapter, None));
    }
}
