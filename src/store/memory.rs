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

//! In-memory session store for tests and the `memory` storage backend.
//!
//! Not visible across processes; approval decisions must come from the same
//! process holding the store.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine_core::blocker::{PendingRequest, PendingStatus};
use crate::engine_core::errors::StoreError;
use crate::engine_core::models::{
    ObservedStep, RequestId, Session, SessionContext, SessionId, StepId, TableCast,
};
use crate::store::{SessionStore, StepUpdate};

const STEP_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    steps: HashMap<SessionId, Vec<ObservedStep>>,
    casts: HashMap<Uuid, TableCast>,
    session_casts: HashMap<SessionId, Vec<Uuid>>,
    pending: HashMap<RequestId, PendingRequest>,
    step_channels: HashMap<SessionId, broadcast::Sender<ObservedStep>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemoryStore {
    fn create_session(
        &self,
        title: Option<&str>,
        context: Option<&SessionContext>,
    ) -> Result<Session, StoreError> {
        let session = Session {
            id: SessionId::generate(),
            title: title.map(str::to_string),
            created_at: Utc::now(),
            context: context.cloned(),
        };

        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.sessions.insert(session.id, session.clone());
        inner.steps.insert(session.id, Vec::new());
        inner.session_casts.insert(session.id, Vec::new());
        let (tx, _) = broadcast::channel(STEP_CHANNEL_CAPACITY);
        inner.step_channels.insert(session.id, tx);
        Ok(session)
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.sessions.get(&session_id).cloned())
    }

    fn session_exists(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.sessions.contains_key(&session_id))
    }

    fn get_last_active_at(
        &self,
        session_id: SessionId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        if !inner.sessions.contains_key(&session_id) {
            return Ok(None);
        }
        Ok(inner
            .steps
            .get(&session_id)
            .and_then(|steps| steps.iter().map(|s| s.created_at).max()))
    }

    fn delete_session(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.sessions.remove(&session_id).is_none() {
            return Ok(false);
        }
        inner.steps.remove(&session_id);
        inner.step_channels.remove(&session_id);
        if let Some(cast_ids) = inner.session_casts.remove(&session_id) {
            for cast_id in cast_ids {
                inner.casts.remove(&cast_id);
            }
        }
        let orphaned: Vec<RequestId> = inner
            .pending
            .values()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.id)
            .collect();
        for request_id in orphaned {
            inner.pending.remove(&request_id);
        }
        Ok(true)
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    fn add_step(&self, step: &ObservedStep) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if !inner.sessions.contains_key(&step.session_id) {
            return Err(StoreError::SessionNotFound(*step.session_id.as_uuid()));
        }
        inner
            .steps
            .get_mut(&step.session_id)
            .expect("steps entry exists for live session")
            .push(step.clone());
        if let Some(tx) = inner.step_channels.get(&step.session_id) {
            let _ = tx.send(step.clone());
        }
        Ok(())
    }

    fn update_step(&self, step_id: StepId, update: &StepUpdate) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let mut updated: Option<ObservedStep> = None;

        for steps in inner.steps.values_mut() {
            if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                if let Some(summary) = &update.summary {
                    step.summary = Some(summary.clone());
                }
                if let Some(status) = update.status {
                    step.status = status;
                }
                if let Some(new_args) = &update.args {
                    let mut merged = match step.args.take() {
                        Some(serde_json::Value::Object(map)) => map,
                        _ => serde_json::Map::new(),
                    };
                    for (key, value) in new_args {
                        merged.insert(key.clone(), value.clone());
                    }
                    step.args = Some(serde_json::Value::Object(merged));
                }
                updated = Some(step.clone());
                break;
            }
        }

        let Some(step) = updated else {
            return Ok(false);
        };
        if let Some(tx) = inner.step_channels.get(&step.session_id) {
            let _ = tx.send(step);
        }
        Ok(true)
    }

    fn list_steps(&self, session_id: SessionId) -> Result<Vec<ObservedStep>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.steps.get(&session_id).cloned().unwrap_or_default())
    }

    fn subscribe_steps(&self, session_id: SessionId) -> Option<broadcast::Receiver<ObservedStep>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .step_channels
            .get(&session_id)
            .map(|tx| tx.subscribe())
    }

    fn add_cast(&self, cast: &TableCast) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if !inner.sessions.contains_key(&cast.session_id) {
            return Err(StoreError::SessionNotFound(*cast.session_id.as_uuid()));
        }
        inner.casts.insert(cast.id, cast.clone());
        inner
            .session_casts
            .entry(cast.session_id)
            .or_default()
            .push(cast.id);
        Ok(())
    }

    fn get_cast(&self, cast_id: Uuid) -> Result<Option<TableCast>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.casts.get(&cast_id).cloned())
    }

    fn list_casts(&self, session_id: SessionId) -> Result<Vec<TableCast>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let ids = inner.session_casts.get(&session_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.casts.get(id).cloned())
            .collect())
    }

    fn create_pending_request(&self, request: &PendingRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if !inner.sessions.contains_key(&request.session_id) {
            return Err(StoreError::SessionNotFound(*request.session_id.as_uuid()));
        }
        inner.pending.insert(request.id, request.clone());
        Ok(())
    }

    fn get_pending_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<PendingRequest>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.pending.get(&request_id).cloned())
    }

    fn list_pending_requests(
        &self,
        session_id: SessionId,
        status: Option<PendingStatus>,
    ) -> Result<Vec<PendingRequest>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut requests: Vec<PendingRequest> = inner
            .pending
            .values()
            .filter(|p| p.session_id == session_id)
            .filter(|p| status.map(|s| p.status == s).unwrap_or(true))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }

    fn decide_pending_request(
        &self,
        request_id: RequestId,
        status: PendingStatus,
    ) -> Result<Option<PendingRequest>, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(request) = inner.pending.get_mut(&request_id) else {
            return Ok(None);
        };

        // Idempotent: the first decision wins, decided_at stays stable.
        if request.status.is_terminal() {
            return Ok(Some(request.clone()));
        }
        if !status.is_terminal() {
            return Ok(Some(request.clone()));
        }

        request.status = status;
        request.decided_at = Some(Utc::now());
        Ok(Some(request.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_core::models::StepKind;
    use crate::engine_core::models::StepStatus;

    fn store_with_session() -> (MemoryStore, SessionId) {
        let store = MemoryStore::new();
        let session = store.create_session(Some("test"), None).unwrap();
        (store, session.id)
    }

    #[test]
    fn add_step_to_missing_session_fails() {
        let store = MemoryStore::new();
        let step = ObservedStep::new(SessionId::generate(), StepKind::ToolCall, "query");
        assert!(matches!(
            store.add_step(&step),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn steps_list_in_insertion_order() {
        let (store, session_id) = store_with_session();
        for name in ["a", "b", "c"] {
            store
                .add_step(&ObservedStep::new(session_id, StepKind::ToolCall, name))
                .unwrap();
        }
        let steps = store.list_steps(session_id).unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn update_step_merges_args_and_keeps_identity() {
        let (store, session_id) = store_with_session();
        let mut step = ObservedStep::new(session_id, StepKind::Blocker, "query");
        step.args = Some(serde_json::json!({ "request_id": "r1" }));
        store.add_step(&step).unwrap();

        let mut args = serde_json::Map::new();
        args.insert("decision".to_string(), serde_json::json!("denied"));
        let updated = store
            .update_step(
                step.id,
                &StepUpdate {
                    summary: Some("Denied blocked query request".to_string()),
                    status: None,
                    args: Some(args),
                },
            )
            .unwrap();
        assert!(updated);

        let steps = store.list_steps(session_id).unwrap();
        let stored = &steps[0];
        assert_eq!(stored.id, step.id);
        assert_eq!(stored.session_id, session_id);
        assert_eq!(
            stored.summary.as_deref(),
            Some("Denied blocked query request")
        );
        let args = stored.args.as_ref().unwrap().as_object().unwrap();
        assert_eq!(args.get("request_id"), Some(&serde_json::json!("r1")));
        assert_eq!(args.get("decision"), Some(&serde_json::json!("denied")));
    }

    #[test]
    fn update_missing_step_returns_false() {
        let (store, _) = store_with_session();
        let updated = store
            .update_step(StepId::generate(), &StepUpdate::default())
            .unwrap();
        assert!(!updated);
    }

    #[test]
    fn decide_is_idempotent_with_stable_decided_at() {
        let (store, session_id) = store_with_session();
        let request = PendingRequest::new(session_id, "query", None, None, None, None, None);
        store.create_pending_request(&request).unwrap();

        let first = store
            .decide_pending_request(request.id, PendingStatus::Allowed)
            .unwrap()
            .unwrap();
        assert_eq!(first.status, PendingStatus::Allowed);
        let decided_at = first.decided_at.unwrap();

        let second = store
            .decide_pending_request(request.id, PendingStatus::Denied)
            .unwrap()
            .unwrap();
        assert_eq!(second.status, PendingStatus::Allowed);
        assert_eq!(second.decided_at, Some(decided_at));
    }

    #[test]
    fn delete_session_removes_pending_requests() {
        let (store, session_id) = store_with_session();
        let request = PendingRequest::new(session_id, "query", None, None, None, None, None);
        store.create_pending_request(&request).unwrap();

        assert!(store.delete_session(session_id).unwrap());
        assert!(store.get_pending_request(request.id).unwrap().is_none());
        assert!(!store.session_exists(session_id).unwrap());
    }

    #[test]
    fn subscribers_see_new_steps() {
        let (store, session_id) = store_with_session();
        let mut rx = store.subscribe_steps(session_id).unwrap();
        let step = ObservedStep::new(session_id, StepKind::ToolCall, "query");
        store.add_step(&step).unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, step.id);
    }

    #[test]
    fn status_update_applies() {
        let (store, session_id) = store_with_session();
        let step = ObservedStep::new(session_id, StepKind::ToolCall, "query");
        store.add_step(&step).unwrap();
        store
            .update_step(
                step.id,
                &StepUpdate {
                    summary: None,
                    status: Some(StepStatus::Error),
                    args: None,
                },
            )
            .unwrap();
        assert_eq!(store.list_steps(session_id).unwrap()[0].status, StepStatus::Error);
    }
}
