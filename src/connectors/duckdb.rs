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

//! DuckDB adapter: tool catalog for common DuckDB MCP servers.

use crate::connectors::interface::Adapter;
use crate::engine_core::models::StepCategory;

pub struct DuckDbAdapter;

impl Adapter for DuckDbAdapter {
    fn target_type(&self) -> &'static str {
        "duckdb"
    }

    fn tool_categories(&self) -> &'static [(&'static str, StepCategory)] {
        &[
            // Query execution
            ("query", StepCategory::Query),
            ("execute", StepCategory::Query),
            ("run_query", StepCategory::Query),
            ("duckdb_query", StepCategory::Query),
            ("read_query", StepCategory::Query),
            // Schema inspection
            ("describe", StepCategory::Schema),
            ("describe_table", StepCategory::Schema),
            ("get_schema", StepCategory::Schema),
            ("table_schema", StepCategory::Schema),
            ("duckdb_describe", StepCategory::Schema),
            // List operations
            ("list_tables", StepCategory::List),
            ("show_tables", StepCategory::List),
            ("tables", StepCategory::List),
            ("list_databases", StepCategory::List),
            ("databases", StepCategory::List),
        ]
    }

    fn tool_aliases(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("exec", "execute"),
            ("sql", "query"),
            ("run", "execute"),
            ("desc", "describe"),
            ("schema", "describe_table"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_before_categorization() {
        let adapter = DuckDbAdapter;
        assert_eq!(adapter.categorize_tool("sql"), StepCategory::Query);
        assert_eq!(adapter.categorize_tool("desc"), StepCategory::Schema);
        assert_eq!(adapter.categorize_tool("show_tables"), StepCategory::List);
        assert_eq!(adapter.categorize_tool("made_up_tool"), StepCategory::Unknown);
    }
}
