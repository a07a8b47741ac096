//! Cross-process blocker resolution against the shared SQLite store.
//!
//! The approval UI runs in a separate process and communicates only through
//! the database file; a second store handle on the same path stands in for it
//! here.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use querygate::engine_core::blocker::{PendingRequest, PendingStatus};
use querygate::mcp::proxy::await_pending_decision;
use querygate::store::{SessionStore, SqliteStore};

const POLL: Duration = Duration::from_millis(50);

fn open_pair(dir: &TempDir) -> (Arc<dyn SessionStore>, Arc<dyn SessionStore>) {
    let path = dir.path().join("sessions.db");
    let proxy_side: Arc<dyn SessionStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let ui_side: Arc<dyn SessionStore> = Arc::new(SqliteStore::open(&path).unwrap());
    (proxy_side, ui_side)
}

#[tokio::test]
async fn short_deadline_times_out_quickly() {
    let dir = TempDir::new().unwrap();
    let (proxy_side, _ui_side) = open_pair(&dir);

    let session = proxy_side.create_session(None, None).unwrap();
    let request = PendingRequest::new(session.id, "query", None, None, None, None, None);
    proxy_side.create_pending_request(&request).unwrap();

    let started = Instant::now();
    let decided = await_pending_decision(
        &proxy_side,
        request.id,
        session.id,
        Duration::from_millis(10),
        POLL,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(decided.status, PendingStatus::Timeout);
    // Sleep is clamped to the remaining deadline, so overhead stays small
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn external_decision_resolves_the_wait() {
    let dir = TempDir::new().unwrap();
    let (proxy_side, ui_side) = open_pair(&dir);

    let session = proxy_side.create_session(None, None).unwrap();
    let request = PendingRequest::new(
        session.id,
        "query",
        None,
        Some("destructive".to_string()),
        Some("CRITICAL".to_string()),
        Some("Destructive SQL operation detected".to_string()),
        None,
    );
    proxy_side.create_pending_request(&request).unwrap();

    // The "UI process" approves shortly after the wait begins
    let request_id = request.id;
    let decider = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(75)).await;
        ui_side
            .decide_pending_request(request_id, PendingStatus::Allowed)
            .unwrap()
            .unwrap()
    });

    let decided = await_pending_decision(
        &proxy_side,
        request.id,
        session.id,
        Duration::from_secs(10),
        POLL,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(decided.status, PendingStatus::Allowed);
    let externally_decided = decider.await.unwrap();
    assert_eq!(externally_decided.status, PendingStatus::Allowed);

    // The proxy's late timeout attempt must not overwrite the decision
    let after = proxy_side
        .decide_pending_request(request.id, PendingStatus::Timeout)
        .unwrap()
        .unwrap();
    assert_eq!(after.status, PendingStatus::Allowed);
    assert_eq!(
        after.decided_at.unwrap().timestamp_millis(),
        externally_decided.decided_at.unwrap().timestamp_millis()
    );
}

#[tokio::test]
async fn vanished_request_is_denied_not_allowed() {
    let dir = TempDir::new().unwrap();
    let (proxy_side, ui_side) = open_pair(&dir);

    let session = proxy_side.create_session(None, None).unwrap();
    let request = PendingRequest::new(session.id, "query", None, None, None, None, None);
    proxy_side.create_pending_request(&request).unwrap();

    // Session deleted out-of-band; the cascade removes the pending record
    let session_id = session.id;
    let deleter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(ui_side.delete_session(session_id).unwrap());
    });

    let decided = await_pending_decision(
        &proxy_side,
        request.id,
        session.id,
        Duration::from_secs(10),
        POLL,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(decided.status, PendingStatus::Denied);
    assert_eq!(decided.reason.as_deref(), Some("Pending request disappeared"));
    deleter.await.unwrap();
}

#[tokio::test]
async fn shutdown_cancels_the_wait_without_deciding() {
    let dir = TempDir::new().unwrap();
    let (proxy_side, _ui_side) = open_pair(&dir);

    let session = proxy_side.create_session(None, None).unwrap();
    let request = PendingRequest::new(session.id, "query", None, None, None, None, None);
    proxy_side.create_pending_request(&request).unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        canceller.cancel();
    });

    let result = await_pending_decision(
        &proxy_side,
        request.id,
        session.id,
        Duration::from_secs(10),
        POLL,
        &token,
    )
    .await;

    assert!(result.is_err());
    // The record is left pending, not half-decided
    let record = proxy_side.get_pending_request(request.id).unwrap().unwrap();
    assert_eq!(record.status, PendingStatus::Pending);
}
