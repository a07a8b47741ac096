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

//! Session store contract and backends.
//!
//! The store is the only channel between the proxy process and the approval
//! UI/API process: a decision written by one must become visible to a poller
//! in the other within the polling interval. The SQLite backend forces a WAL
//! checkpoint after every mutating write and uses fresh read connections for
//! cross-process-visible reads.

pub mod memory;
pub mod retention;
pub mod sqlite;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::{LimitsConfig, StorageBackend, StorageConfig};
use crate::engine_core::blocker::{PendingRequest, PendingStatus};
use crate::engine_core::errors::StoreError;
use crate::engine_core::models::{
    ObservedStep, RequestId, Session, SessionContext, SessionId, StepId, StepStatus, TableCast,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// The constrained subset of step fields that may be amended in place.
/// `args` entries are merged into the existing argument map.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub summary: Option<String>,
    pub status: Option<StepStatus>,
    pub args: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Durable, cross-process visible storage for sessions, steps, casts, and
/// pending approval requests.
pub trait SessionStore: Send + Sync {
    fn create_session(
        &self,
        title: Option<&str>,
        context: Option<&SessionContext>,
    ) -> Result<Session, StoreError>;

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Existence check without fetching full session data.
    fn session_exists(&self, session_id: SessionId) -> Result<bool, StoreError>;

    /// Timestamp of the most recent step in a session, if any.
    fn get_last_active_at(
        &self,
        session_id: SessionId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    fn delete_session(&self, session_id: SessionId) -> Result<bool, StoreError>;

    /// Sessions newest-first.
    fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// Persist a step. Fails with `SessionNotFound` when the owning session
    /// has vanished; callers decide whether to recover.
    fn add_step(&self, step: &ObservedStep) -> Result<(), StoreError>;

    /// Amend a step in place. Returns false when the step does not exist.
    fn update_step(&self, step_id: StepId, update: &StepUpdate) -> Result<bool, StoreError>;

    /// Steps of a session, ascending by creation time.
    fn list_steps(&self, session_id: SessionId) -> Result<Vec<ObservedStep>, StoreError>;

    /// Subscription primitive for newly added/updated steps, used by the
    /// external streaming API (not by the proxy core itself).
    fn subscribe_steps(&self, session_id: SessionId) -> Option<broadcast::Receiver<ObservedStep>>;

    fn add_cast(&self, cast: &TableCast) -> Result<(), StoreError>;

    fn get_cast(&self, cast_id: Uuid) -> Result<Option<TableCast>, StoreError>;

    fn list_casts(&self, session_id: SessionId) -> Result<Vec<TableCast>, StoreError>;

    /// Persist a fresh pending request (status must be `pending`).
    fn create_pending_request(&self, request: &PendingRequest) -> Result<(), StoreError>;

    fn get_pending_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<PendingRequest>, StoreError>;

    fn list_pending_requests(
        &self,
        session_id: SessionId,
        status: Option<PendingStatus>,
    ) -> Result<Vec<PendingRequest>, StoreError>;

    /// Decide a pending request exactly once. Idempotent: an already-decided
    /// record is returned unchanged, including its original `decided_at`.
    /// Returns None when the record does not exist.
    fn decide_pending_request(
        &self,
        request_id: RequestId,
        status: PendingStatus,
    ) -> Result<Option<PendingRequest>, StoreError>;
}

/// Open the configured store backend.
pub fn open_store(
    config: &StorageConfig,
    limits: &LimitsConfig,
) -> Result<Arc<dyn SessionStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open_with_retention(
            &config.sqlite_path,
            limits.retention_days,
            limits.max_db_bytes,
        )?)),
    }
}
