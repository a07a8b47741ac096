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

//! Retention pruning of old sessions.
//!
//! Runs opportunistically off the hot path on its own connection: age-based
//! pruning first, then oldest-first deletion until the database file fits the
//! size budget.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

use crate::engine_core::errors::StoreError;

fn db_size_bytes(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Delete sessions older than the retention window, then oldest-first until
/// the file is within `max_db_bytes` (0 disables the size budget).
/// Returns the number of sessions pruned.
pub fn prune_sessions(
    path: &Path,
    retention_days: i64,
    max_db_bytes: u64,
) -> Result<usize, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let mut pruned = 0usize;

    if retention_days > 0 {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        pruned += conn.execute(
            "DELETE FROM sessions WHERE created_at < ?1",
            params![cutoff],
        )?;
    }

    let mut pruned_by_size = 0usize;
    if max_db_bytes > 0 && db_size_bytes(path) > max_db_bytes {
        while db_size_bytes(path) > max_db_bytes {
            let oldest: Option<String> = conn
                .query_row(
                    "SELECT id FROM sessions ORDER BY created_at ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .ok();
            let Some(session_id) = oldest else {
                break;
            };
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            pruned_by_size += 1;
            // DELETE alone doesn't shrink the file
            conn.execute_batch("VACUUM;")?;
        }
    }

    Ok(pruned + pruned_by_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_core::models::SessionId;
    use tempfile::TempDir;

    fn seed(path: &Path, created_at: &str) -> String {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL
            );",
        )
        .unwrap();
        let id = SessionId::generate().to_string();
        conn.execute(
            "INSERT INTO sessions (id, title, created_at) VALUES (?1, NULL, ?2)",
            params![id, created_at],
        )
        .unwrap();
        id
    }

    #[test]
    fn prunes_only_sessions_older_than_cutoff() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");

        let old = (Utc::now() - Duration::days(30)).to_rfc3339();
        let fresh = Utc::now().to_rfc3339();
        seed(&path, &old);
        let kept = seed(&path, &fresh);

        let pruned = prune_sessions(&path, 14, 0).unwrap();
        assert_eq!(pruned, 1);

        let conn = Connection::open(&path).unwrap();
        let remaining: Vec<String> = conn
            .prepare("SELECT id FROM sessions")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(remaining, vec![kept]);
    }

    #[test]
    fn zero_retention_prunes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        seed(&path, &(Utc::now() - Duration::days(365)).to_rfc3339());

        let pruned = prune_sessions(&path, 0, 0).unwrap();
        assert_eq!(pruned, 0);
    }
}
