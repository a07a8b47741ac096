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

//! Adapter registry keyed by target-type string.
//!
//! Falls back to a generic adapter for unknown target types so the proxy
//! never runs without evidence extraction.

use crate::connectors::duckdb::DuckDbAdapter;
use crate::connectors::interface::Adapter;
use crate::connectors::postgres::PostgresAdapter;
use crate::engine_core::models::StepCategory;

/// Fallback adapter for unknown target types.
///
/// Provides basic normalization without target-specific knowledge.
pub struct GenericAdapter;

impl Adapter for GenericAdapter {
    fn target_type(&self) -> &'static str {
        "generic"
    }

    fn tool_categories(&self) -> &'static [(&'static str, StepCategory)] {
        &[
            ("query", StepCategory::Query),
            ("execute", StepCategory::Query),
            ("run", StepCategory::Query),
            ("describe", StepCategory::Schema),
            ("schema", StepCategory::Schema),
            ("list", StepCategory::List),
            ("tables", StepCategory::List),
        ]
    }
}

static GENERIC: GenericAdapter = GenericAdapter;
static DUCKDB: DuckDbAdapter = DuckDbAdapter;
static POSTGRES: PostgresAdapter = PostgresAdapter;

/// Get the adapter for a target type, falling back to the generic one.
pub fn get_adapter(target_type: &str) -> &'static dyn Adapter {
    match target_type.trim().to_lowercase().as_str() {
        "duckdb" => &DUCKDB,
        "postgres" | "postgresql" | "pg" => &POSTGRES,
        _ => &GENERIC,
    }
}

/// List all registered adapter types.
pub fn list_adapters() -> Vec<&'static str> {
    vec!["duckdb", "generic", "postgres"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_resolve_with_aliases() {
        assert_eq!(get_adapter("duckdb").target_type(), "duckdb");
        assert_eq!(get_adapter("postgres").target_type(), "postgres");
        assert_eq!(get_adapter("pg").target_type(), "postgres");
        assert_eq!(get_adapter(" PostgreSQL ").target_type(), "postgres");
    }

    #[test]
    fn unknown_type_falls_back_to_generic() {
        assert_eq!(get_adapter("oracle").target_type(), "generic");
        assert_eq!(get_adapter("").target_type(), "generic");
    }
}
