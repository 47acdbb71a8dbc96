use chrono::{DateTime, Utc};

use crate::errors::TurnFailure;
use crate::frame::{ToolCallStatus, TurnId};
use crate::state::TurnStatus;

/// One tool invocation inside an assistant turn.
///
/// Tools are keyed by `name` and their `result` is opaque JSON, so new tools
/// need no changes here.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
    /// Present only once the call is `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// How a turn recovered from a dropped subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Reconnected and continued after the last applied sequence.
    Resumed,
    /// Reconnected from scratch; partial output was discarded.
    Restarted,
}

/// One query/response cycle.
///
/// Only the assembler mutates a `Turn`; everything else receives clones.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Turn {
    pub(crate) turn_id: TurnId,
    pub(crate) session_id: uuid::Uuid,
    pub(crate) query: String,
    pub(crate) status: TurnStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) text: String,
    pub(crate) tool_calls: Vec<ToolCallRecord>,
    pub(crate) last_sequence: Option<u64>,
    pub(crate) failure: Option<TurnFailure>,
    pub(crate) recovery: Option<RecoveryMode>,
    pub(crate) attempts: u32,
}

impl Turn {
    pub(crate) fn new(
        turn_id: TurnId,
        session_id: uuid::Uuid,
        query: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            turn_id,
            session_id,
            query: query.into(),
            status: TurnStatus::Pending,
            created_at,
            updated_at: created_at,
            text: String::new(),
            tool_calls: Vec::new(),
            last_sequence: None,
            failure: None,
            recovery: None,
            attempts: 1,
        }
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// User query this turn answers.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Assistant text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tool calls in the order they were started.
    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallRecord> {
        self.tool_calls.iter().find(|c| c.call_id == call_id)
    }

    /// Highest sequence applied, `None` before the first frame.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Sequence the next in-order frame must carry.
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence.map_or(0, |s| s + 1)
    }

    pub fn failure(&self) -> Option<&TurnFailure> {
        self.failure.as_ref()
    }

    pub fn recovery(&self) -> Option<RecoveryMode> {
        self.recovery
    }

    /// Number of transport subscriptions opened for this turn.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn tool_call_mut(&mut self, call_id: &str) -> Option<&mut ToolCallRecord> {
        self.tool_calls.iter_mut().find(|c| c.call_id == call_id)
    }

    /// Drops streamed content before restarting from sequence 0.
    pub(crate) fn reset_content(&mut self) {
        self.text.clear();
        self.tool_calls.clear();
        self.last_sequence = None;
    }
}
