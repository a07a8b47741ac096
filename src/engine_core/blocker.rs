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

//! Blocker/pending-request models for protective mode approvals.
//!
//! The minimal data model for the human-in-the-loop approval flow. A
//! PendingRequest is created when a risky call is suspended and decided
//! exactly once, either by an external process writing through the shared
//! store or by the proxy declaring a timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::engine_core::models::{RequestId, SessionId, StepId};

/// Terminal outcome of a blocked call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingDecision {
    Allowed,
    Denied,
    Timeout,
}

impl PendingDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Timeout => "timeout",
        }
    }
}

/// Lifecycle state of a pending request: `pending` then exactly one of
/// the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Allowed,
    Denied,
    Timeout,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "allowed" => Ok(Self::Allowed),
            "denied" => Ok(Self::Denied),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown pending status: {other}")),
        }
    }
}

impl From<PendingStatus> for Option<PendingDecision> {
    fn from(status: PendingStatus) -> Self {
        match status {
            PendingStatus::Pending => None,
            PendingStatus::Allowed => Some(PendingDecision::Allowed),
            PendingStatus::Denied => Some(PendingDecision::Denied),
            PendingStatus::Timeout => Some(PendingDecision::Timeout),
        }
    }
}

/// A risky request awaiting a human allow/deny decision.
///
/// Invariant: status transitions are monotonic and single-shot. Once
/// decided, further decide attempts are no-ops that return the record
/// unchanged, including its original `decided_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: RequestId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,

    pub tool_name: String,
    /// Capped/summarized arguments, never the full unbounded payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocker_step_id: Option<StepId>,

    pub status: PendingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl PendingRequest {
    /// A fresh pending record for a blocked call.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        tool_name: impl Into<String>,
        arguments: Option<serde_json::Value>,
        classification: Option<String>,
        risk_level: Option<String>,
        reason: Option<String>,
        blocker_step_id: Option<StepId>,
    ) -> Self {
        Self {
            id: RequestId::generate(),
            session_id,
            created_at: Utc::now(),
            tool_name: tool_name.into(),
            arguments,
            classification,
            risk_level,
            reason,
            blocker_step_id,
            status: PendingStatus::Pending,
            decided_at: None,
        }
    }
}

/// One-line summary written back onto the blocker step once decided.
pub fn blocker_summary(tool_name: &str, decision: PendingDecision) -> String {
    match decision {
        PendingDecision::Allowed => format!("Approved blocked {tool_name} request"),
        PendingDecision::Timeout => format!("Auto-denied blocked {tool_name} request (timeout)"),
        PendingDecision::Denied => format!("Denied blocked {tool_name} request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_starts_pending() {
        let req = PendingRequest::new(
            SessionId::generate(),
            "query",
            None,
            Some("destructive".to_string()),
            Some("CRITICAL".to_string()),
            Some("Destructive SQL operation detected".to_string()),
            None,
        );
        assert_eq!(req.status, PendingStatus::Pending);
        assert!(req.decided_at.is_none());
        assert!(!req.status.is_terminal());
    }

    #[test]
    fn status_parses_all_values() {
        for status in ["pending", "allowed", "denied", "timeout"] {
            let parsed: PendingStatus = status.parse().unwrap();
            assert_eq!(parsed.as_str(), status);
        }
        assert!("approved".parse::<PendingStatus>().is_err());
    }

    #[test]
    fn summaries_name_the_decision() {
        assert_eq!(
            blocker_summary("query", PendingDecision::Allowed),
            "Approved blocked query request"
        );
        assert_eq!(
            blocker_summary("query", PendingDecision::Denied),
            "Denied blocked query request"
        );
        assert!(blocker_summary("query", PendingDecision::Timeout).contains("timeout"));
    }
}
