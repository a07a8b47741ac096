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

//! Proxy-native MCP tools: session lifecycle and cast artifacts.
//!
//! Sessions map to agent conversations. Each connection keeps its own
//! session state to prevent cross-agent session bleed; idle sessions are
//! superseded by fresh ones, never mutated.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::engine_core::caps::{cap_tabular_data, CapsConfig};
use crate::engine_core::constants::tools;
use crate::engine_core::errors::StoreError;
use crate::engine_core::models::{
    SchemaColumn, SessionId, StepId, TableCast, ToolDef,
};
use crate::store::SessionStore;

/// Session lifecycle tools for the proxy.
///
/// Owns the connection-id -> session-id map. Falls back to auto-creating a
/// session on first tool call if none exists.
pub struct SessionTools {
    store: Arc<dyn SessionStore>,
    connection_id: Uuid,
    sessions: Mutex<HashMap<Uuid, SessionId>>,
    idle_timeout: Duration,
}

impl SessionTools {
    pub fn new(store: Arc<dyn SessionStore>, connection_id: Uuid, idle_timeout: Duration) -> Self {
        Self {
            store,
            connection_id,
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Start a new session, replacing any remembered one for this connection.
    pub fn session_start(&self, title: Option<&str>) -> Result<SessionId, StoreError> {
        let session = self.store.create_session(title, None)?;
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(self.connection_id, session.id);
        Ok(session.id)
    }

    /// End a session. Returns false when the id is not the current session.
    pub fn session_end(&self, session_id: &str) -> bool {
        let Ok(sid) = session_id.parse::<SessionId>() else {
            return false;
        };
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        if sessions.get(&self.connection_id) == Some(&sid) {
            sessions.remove(&self.connection_id);
            return true;
        }
        false
    }

    pub fn session_current(&self) -> Option<SessionId> {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .get(&self.connection_id)
            .copied()
    }

    /// Ensure a session exists, creating one if needed.
    ///
    /// Validates that the remembered session still exists in the store (it
    /// may have been deleted out-of-band) and that it hasn't been idle past
    /// the timeout. Either condition rotates to a fresh session rather than
    /// reusing a stale id.
    pub fn ensure_session(&self) -> Result<SessionId, StoreError> {
        let mut session_id = self.session_current();

        if let Some(sid) = session_id {
            if !self.store.session_exists(sid)? {
                self.sessions
                    .lock()
                    .expect("session map lock poisoned")
                    .remove(&self.connection_id);
                session_id = None;
            }
        }

        if let Some(sid) = session_id {
            if !self.idle_timeout.is_zero() {
                if let Some(last_active) = self.store.get_last_active_at(sid)? {
                    let elapsed = Utc::now().signed_duration_since(last_active);
                    if elapsed.num_seconds() > self.idle_timeout.as_secs() as i64 {
                        self.sessions
                            .lock()
                            .expect("session map lock poisoned")
                            .remove(&self.connection_id);
                        session_id = None;
                    }
                }
            }
        }

        match session_id {
            Some(sid) => Ok(sid),
            None => self.session_start(None),
        }
    }
}

/// Result returned to the agent by `cast_table`.
#[derive(Debug, Clone, Serialize)]
pub struct CastOutcome {
    pub cast_id: Uuid,
    pub rows_shown: usize,
    pub total_rows: usize,
    pub truncated: bool,
}

/// Cast artifact tools.
///
/// Every cast links to the step that produced its data, and rows/columns are
/// capped before storage regardless of what the agent sent.
pub struct CastTools {
    store: Arc<dyn SessionStore>,
    caps: CapsConfig,
}

impl CastTools {
    pub fn new(store: Arc<dyn SessionStore>, caps: CapsConfig) -> Self {
        Self { store, caps }
    }

    pub fn caps(&self) -> &CapsConfig {
        &self.caps
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cast_table(
        &self,
        session_tools: &SessionTools,
        title: &str,
        sql: &str,
        rows: Vec<Map<String, Value>>,
        origin_step_id: Option<StepId>,
        columns: Option<Vec<SchemaColumn>>,
    ) -> Result<CastOutcome, StoreError> {
        let session_id = session_tools.ensure_session()?;
        let step_id = origin_step_id.unwrap_or_else(StepId::generate);

        let final_columns = match columns {
            Some(columns) => Some(columns),
            None if !rows.is_empty() => Some(infer_columns(&rows)),
            None => None,
        };

        let capped = cap_tabular_data(&rows, self.caps.max_rows, self.caps.max_columns);
        let truncated = capped.rows_truncated || capped.columns_truncated;

        let cast = TableCast {
            id: Uuid::new_v4(),
            session_id,
            created_at: Utc::now(),
            origin_step_id: step_id,
            title: title.to_string(),
            sql: sql.to_string(),
            rows: capped.rows,
            columns: final_columns,
            total_rows: rows.len(),
            truncated,
        };
        self.store.add_cast(&cast)?;

        Ok(CastOutcome {
            cast_id: cast.id,
            rows_shown: cast.rows.len(),
            total_rows: rows.len(),
            truncated,
        })
    }
}

/// Infer a column schema from the first row of data.
fn infer_columns(rows: &[Map<String, Value>]) -> Vec<SchemaColumn> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };

    first
        .iter()
        .map(|(name, value)| {
            let column_type = match value {
                Value::Bool(_) => "boolean",
                Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
                Value::Number(_) => "float",
                _ => "string",
            };
            SchemaColumn {
                name: name.clone(),
                column_type: Some(column_type.to_string()),
            }
        })
        .collect()
}

/// Tool definitions for the proxy's own tools, republished alongside the
/// target's catalogue.
pub fn proxy_tool_definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: tools::SESSION_START.to_string(),
            description: Some(
                "Start a new observation session. Call at the start of a task.".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {
                        "type": "string",
                        "description": "Optional title for the session"
                    }
                }
            }),
        },
        ToolDef {
            name: tools::SESSION_END.to_string(),
            description: Some("End the current observation session.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "The session ID to end"
                    }
                },
                "required": ["session_id"]
            }),
        },
        ToolDef {
            name: tools::SESSION_CURRENT.to_string(),
            description: Some("Get the current session ID.".to_string()),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDef {
            name: tools::CAST_TABLE.to_string(),
            description: Some("Create a table cast artifact from query results.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Title for the table" },
                    "sql": {
                        "type": "string",
                        "description": "SQL query that produced the data"
                    },
                    "rows": {
                        "type": "array",
                        "description": "Data rows as array of objects",
                        "items": { "type": "object" }
                    },
                    "origin_step_id": {
                        "type": "string",
                        "description": "Optional step ID for evidence linkage"
                    },
                    "columns": {
                        "type": "array",
                        "description": "Optional column schema",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "type": { "type": "string" }
                            },
                            "required": ["name"]
                        }
                    }
                },
                "required": ["title", "sql", "rows"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_core::models::{ObservedStep, StepKind};
    use crate::store::MemoryStore;

    fn session_tools(idle_timeout: Duration) -> (Arc<MemoryStore>, SessionTools) {
        let store = Arc::new(MemoryStore::new());
        let tools = SessionTools::new(store.clone(), Uuid::new_v4(), idle_timeout);
        (store, tools)
    }

    #[test]
    fn ensure_session_auto_creates_and_reuses() {
        let (_store, tools) = session_tools(Duration::from_secs(1800));
        assert!(tools.session_current().is_none());
        let first = tools.ensure_session().unwrap();
        let second = tools.ensure_session().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn deleted_session_is_replaced_not_reused() {
        let (store, tools) = session_tools(Duration::from_secs(1800));
        let first = tools.ensure_session().unwrap();
        store.delete_session(first).unwrap();
        let second = tools.ensure_session().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn idle_session_rotates_to_a_new_one() {
        let (store, tools) = session_tools(Duration::from_secs(60));
        let first = tools.ensure_session().unwrap();

        // Backdate a step so the session looks idle
        let mut step = ObservedStep::new(first, StepKind::ToolCall, "query");
        step.created_at = Utc::now() - chrono::Duration::seconds(120);
        store.add_step(&step).unwrap();

        let second = tools.ensure_session().unwrap();
        assert_ne!(first, second);
        // The old session still exists; rotation never mutates it
        assert!(store.session_exists(first).unwrap());
    }

    #[test]
    fn zero_timeout_disables_rotation() {
        let (store, tools) = session_tools(Duration::ZERO);
        let first = tools.ensure_session().unwrap();
        let mut step = ObservedStep::new(first, StepKind::ToolCall, "query");
        step.created_at = Utc::now() - chrono::Duration::days(7);
        store.add_step(&step).unwrap();
        assert_eq!(tools.ensure_session().unwrap(), first);
    }

    #[test]
    fn session_end_only_ends_the_current_session() {
        let (_store, tools) = session_tools(Duration::from_secs(1800));
        let current = tools.ensure_session().unwrap();
        assert!(!tools.session_end(&SessionId::generate().to_string()));
        assert!(!tools.session_end("not-a-uuid"));
        assert!(tools.session_end(&current.to_string()));
        assert!(tools.session_current().is_none());
    }

    #[test]
    fn cast_table_caps_rows_and_links_step() {
        let (store, tools) = session_tools(Duration::from_secs(1800));
        let cast_tools = CastTools::new(
            store.clone(),
            CapsConfig {
                max_rows: 2,
                max_columns: 80,
                max_bytes: 512 * 1024,
            },
        );

        let rows: Vec<Map<String, Value>> = (0..5)
            .map(|i| {
                let mut row = Map::new();
                row.insert("id".to_string(), json!(i));
                row
            })
            .collect();
        let step_id = StepId::generate();
        let outcome = cast_tools
            .cast_table(&tools, "orders", "SELECT * FROM orders", rows, Some(step_id), None)
            .unwrap();

        assert_eq!(outcome.rows_shown, 2);
        assert_eq!(outcome.total_rows, 5);
        assert!(outcome.truncated);

        let session_id = tools.session_current().unwrap();
        let casts = store.list_casts(session_id).unwrap();
        assert_eq!(casts.len(), 1);
        assert_eq!(casts[0].origin_step_id, step_id);
        assert_eq!(casts[0].rows.len(), 2);
        // Columns inferred from the first row
        assert_eq!(
            casts[0].columns.as_ref().unwrap()[0].column_type.as_deref(),
            Some("integer")
        );
    }

    #[test]
    fn proxy_tools_cover_the_native_surface() {
        let names: Vec<String> = proxy_tool_definitions()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            names,
            vec!["session_start", "session_end", "session_current", "cast_table"]
        );
    }
}
