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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine_core::caps::CapsConfig;
use crate::engine_core::constants::{blocker, config as env_vars, retention, session};
use crate::engine_core::errors::ProxyError;

/// Safety mode toggles. Protective is the default; transparent mode turns
/// off blocking but never turns off caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub protective_mode: bool,
    pub block_ddl: bool,
    pub block_dml: bool,
    pub block_multi_statement: bool,
    pub block_delete_without_where: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            protective_mode: true,
            block_ddl: true,
            block_dml: true,
            block_multi_statement: true,
            block_delete_without_where: true,
        }
    }
}

/// Hard limits on captured payloads plus store retention budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub preview_rows: usize,
    pub preview_bytes: usize,
    pub preview_columns: usize,
    pub retention_days: i64,
    pub max_db_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            preview_rows: crate::engine_core::constants::caps::DEFAULT_MAX_ROWS,
            preview_bytes: crate::engine_core::constants::caps::DEFAULT_MAX_BYTES,
            preview_columns: crate::engine_core::constants::caps::DEFAULT_MAX_COLUMNS,
            retention_days: retention::DEFAULT_RETENTION_DAYS,
            max_db_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl StorageBackend {
    pub fn parse_safe(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => StorageBackend::Memory,
            _ => StorageBackend::Sqlite,
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".querygate")
        .join("sessions.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// The target MCP server the proxy wraps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Command and arguments to launch the target server
    pub command: Vec<String>,
    /// Target type for adapter selection ("duckdb", "postgres", ...)
    pub target_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub policy: PolicyConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    /// Wall-clock seconds before a blocked call auto-decides timeout
    pub blocker_timeout_secs: u64,
    /// Idle seconds before a remembered session is superseded (0 disables)
    pub session_idle_timeout_secs: u64,
    pub log_level: String,
    pub log_format: String, // "json" or "text"
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            policy: PolicyConfig::default(),
            limits: LimitsConfig::default(),
            storage: StorageConfig::default(),
            blocker_timeout_secs: blocker::DEFAULT_TIMEOUT_SECS,
            session_idle_timeout_secs: session::DEFAULT_IDLE_TIMEOUT_SECS,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl Config {
    /// Environment overrides on top of defaults. CLI flags are applied on
    /// top of this by the binary.
    pub fn from_env() -> Result<Self, ProxyError> {
        let mut config = Self::default();

        if let Ok(level) = env::var(env_vars::ENV_LOG_LEVEL) {
            config.log_level = level;
        }
        if let Ok(format) = env::var(env_vars::ENV_LOG_FORMAT) {
            config.log_format = format;
        }
        if let Ok(target_type) = env::var(env_vars::ENV_TARGET_TYPE) {
            config.target.target_type = target_type;
        }
        if let Ok(backend) = env::var(env_vars::ENV_STORAGE_BACKEND) {
            config.storage.backend = StorageBackend::parse_safe(&backend);
        }
        if let Ok(path) = env::var(env_vars::ENV_SQLITE_PATH) {
            config.storage.sqlite_path = PathBuf::from(path);
        }
        if let Ok(transparent) = env::var(env_vars::ENV_TRANSPARENT) {
            if transparent == "1" || transparent.to_lowercase() == "true" {
                config.policy.protective_mode = false;
            }
        }
        if let Ok(secs) = env::var(env_vars::ENV_BLOCKER_TIMEOUT_SECS) {
            config.blocker_timeout_secs = secs
                .parse()
                .map_err(|_| ProxyError::Config(format!("invalid blocker timeout: {secs}")))?;
        }

        Ok(config)
    }

    pub fn caps(&self) -> CapsConfig {
        CapsConfig {
            max_rows: self.limits.preview_rows,
            max_columns: self.limits.preview_columns,
            max_bytes: self.limits.preview_bytes,
        }
    }

    pub fn blocker_timeout(&self) -> Duration {
        Duration::from_secs(self.blocker_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protective_mode_is_the_default() {
        let config = Config::default();
        assert!(config.policy.protective_mode);
        assert!(config.policy.block_ddl);
        assert!(config.policy.block_dml);
        assert!(config.policy.block_multi_statement);
        assert!(config.policy.block_delete_without_where);
    }

    #[test]
    fn caps_mirror_limits() {
        let mut config = Config::default();
        config.limits.preview_rows = 7;
        config.limits.preview_columns = 3;
        config.limits.preview_bytes = 99;
        let caps = config.caps();
        assert_eq!(caps.max_rows, 7);
        assert_eq!(caps.max_columns, 3);
        assert_eq!(caps.max_bytes, 99);
    }

    #[test]
    fn storage_backend_parses_leniently() {
        assert_eq!(StorageBackend::parse_safe("memory"), StorageBackend::Memory);
        assert_eq!(StorageBackend::parse_safe("MEM"), StorageBackend::Memory);
        assert_eq!(StorageBackend::parse_safe("sqlite"), StorageBackend::Sqlite);
        assert_eq!(StorageBackend::parse_safe("anything"), StorageBackend::Sqlite);
    }
}
