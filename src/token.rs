//! Opaque task tokens.
//!
//! The engine hands a serialized token to the matching service with every
//! dispatched task; workers echo it back verbatim when reporting outcomes.
//! The codec is stable: serialize/deserialize round-trips byte-equal.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the token locates its task inside mutable state.
///
/// Explicit variants instead of sentinel comparisons: the hot validation paths
/// match on this enum rather than testing strings for emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "routing")]
pub enum TokenRouting {
    /// Locate by the schedule event id (decisions and activities).
    Schedule { schedule_id: u64 },
    /// Locate an activity by its user-assigned id; the run is resolved
    /// through the current-execution record.
    ActivityId { activity_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToken {
    pub workflow_id: String,
    /// Absent for activity-id routing, where the caller does not know the run.
    pub run_id: Option<String>,
    #[serde(flatten)]
    pub routing: TokenRouting,
    pub attempt: i32,
}

impl TaskToken {
    pub fn for_schedule(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        schedule_id: u64,
        attempt: i32,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: Some(run_id.into()),
            routing: TokenRouting::Schedule { schedule_id },
            attempt,
        }
    }

    pub fn for_activity_id(
        workflow_id: impl Into<String>,
        activity_id: impl Into<String>,
        attempt: i32,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: None,
            routing: TokenRouting::ActivityId {
                activity_id: activity_id.into(),
            },
            attempt,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        // Struct serialization over a closed field set cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode and validate a token received from a worker.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, EngineError> {
        let token: TaskToken = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::InvalidArgument(format!("malformed task token: {e}")))?;
        if token.workflow_id.is_empty() {
            return Err(EngineError::InvalidArgument(
                "task token has no workflow id".into(),
            ));
        }
        if let Some(run_id) = &token.run_id {
            Uuid::parse_str(run_id).map_err(|_| {
                EngineError::InvalidArgument(format!("task token run id is not a UUID: {run_id}"))
            })?;
        }
        if let TokenRouting::ActivityId { activity_id } = &token.routing {
            if activity_id.is_empty() {
                return Err(EngineError::InvalidArgument(
                    "task token has neither schedule id nor activity id".into(),
                ));
            }
        }
        Ok(token)
    }
}
