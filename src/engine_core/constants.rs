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

//! querygate constants - Single source of truth for all configuration values.
//!
//! This module centralizes magic numbers, error codes, and configuration
//! constants to ensure consistency and maintainability.

/// JSON-RPC 2.0 Error Codes
pub mod jsonrpc {
    /// Method not found (standard JSON-RPC)
    pub const ERROR_METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid request (standard JSON-RPC)
    pub const ERROR_INVALID_REQUEST: i32 = -32600;
    /// Internal error (standard JSON-RPC)
    pub const ERROR_INTERNAL: i32 = -32603;
    /// Parse error (standard JSON-RPC)
    pub const ERROR_PARSE: i32 = -32700;
}

/// MCP Protocol Methods
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
}

/// Proxy-native tool names
pub mod tools {
    pub const SESSION_START: &str = "session_start";
    pub const SESSION_END: &str = "session_end";
    pub const SESSION_CURRENT: &str = "session_current";
    pub const CAST_TABLE: &str = "cast_table";
}

/// Transport Limits (DoS Protection)
pub mod limits {
    /// Maximum allowed JSON-RPC message size (10 MB)
    pub const MAX_MESSAGE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
}

/// Hard caps applied to captured payloads
pub mod caps {
    /// Default cap on rows kept in a table preview/cast
    pub const DEFAULT_MAX_ROWS: usize = 200;
    /// Default cap on columns kept per row
    pub const DEFAULT_MAX_COLUMNS: usize = 80;
    /// Default cap on preview payload bytes (512 KiB)
    pub const DEFAULT_MAX_BYTES: usize = 512 * 1024;
    /// Cap on SQL excerpts recorded with a step (8 KiB)
    pub const SQL_EXCERPT_CAP_BYTES: usize = 8 * 1024;
    /// Cap on normalized error messages (2 KiB)
    pub const ERROR_MESSAGE_CAP_BYTES: usize = 2 * 1024;
    /// Cap on the one-line step result preview (1 KiB)
    pub const STEP_PREVIEW_CAP_BYTES: usize = 1024;
}

/// Blocker (pending approval) timing
pub mod blocker {
    use std::time::Duration;

    /// Interval between store polls while awaiting a decision
    pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
    /// Default wall-clock deadline before the proxy auto-decides timeout
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
}

/// Session management
pub mod session {
    /// Idle seconds after which a remembered session is superseded by a new one.
    /// 0 disables the timeout.
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
}

/// Retention/pruning of stored sessions
pub mod retention {
    /// Prune check runs every Nth step written
    pub const PRUNE_EVERY_STEPS: u64 = 25;
    /// Default days before old sessions are pruned
    pub const DEFAULT_RETENTION_DAYS: i64 = 14;
}

/// Configuration Environment Variables
pub mod config {
    pub const ENV_LOG_LEVEL: &str = "QUERYGATE_LOG_LEVEL";
    pub const ENV_LOG_FORMAT: &str = "QUERYGATE_LOG_FORMAT";
    pub const ENV_TARGET_TYPE: &str = "QUERYGATE_TARGET_TYPE";
    pub const ENV_STORAGE_BACKEND: &str = "QUERYGATE_STORAGE_BACKEND";
    pub const ENV_SQLITE_PATH: &str = "QUERYGATE_SQLITE_PATH";
    pub const ENV_TRANSPARENT: &str = "QUERYGATE_TRANSPARENT";
    pub const ENV_BLOCKER_TIMEOUT_SECS: &str = "QUERYGATE_BLOCKER_TIMEOUT_SECS";
}
