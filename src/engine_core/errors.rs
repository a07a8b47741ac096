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

// Domain error types - failures that should never leak internals to the agent

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the session store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The owning session no longer exists (deleted out-of-band)
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded back into a model
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to spawn or manage the target subprocess
    #[error("process error: {0}")]
    Process(String),

    /// Target connection lost or never established
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// Wire-level protocol failure talking to the target
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Shutdown requested while a call or blocker wait was in flight
    #[error("shutdown requested")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(String),
}
