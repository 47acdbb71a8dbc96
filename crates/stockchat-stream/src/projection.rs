//! UI-facing view of a turn.
//!
//! [`project`] is pure: the same `Turn` always yields an equal `MessageView`.
use chrono::{DateTime, Utc};

use crate::errors::FailureReason;
use crate::frame::{ToolCallStatus, TurnId};
use crate::state::TurnStatus;
use crate::turn::{RecoveryMode, Turn};

/// Badge shown next to an assistant message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusBadge {
    Waiting,
    Streaming,
    Done,
    Failed,
    Stopped,
}

impl StatusBadge {
    pub fn label(self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Streaming => "Streaming",
            Self::Done => "Done",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
        }
    }
}

impl From<TurnStatus> for StatusBadge {
    fn from(status: TurnStatus) -> Self {
        match status {
            TurnStatus::Pending => Self::Waiting,
            TurnStatus::Streaming => Self::Streaming,
            TurnStatus::Completed => Self::Done,
            TurnStatus::Errored => Self::Failed,
            TurnStatus::Cancelled => Self::Stopped,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ToolCallView {
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ErrorView {
    pub reason: FailureReason,
    pub message: String,
}

/// Immutable, render-ready snapshot of an assistant message.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct MessageView {
    pub turn_id: TurnId,
    /// User query the message answers.
    pub query: String,
    pub text: String,
    /// Tool calls in the order they started.
    pub tool_calls: Vec<ToolCallView>,
    /// Most recently started tool that is still pending or running.
    pub active_tool: Option<String>,
    pub status: TurnStatus,
    pub badge: StatusBadge,
    pub error: Option<ErrorView>,
    pub recovery: Option<RecoveryMode>,
    pub attempts: u32,
    pub last_sequence: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageView {
    pub fn is_final(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn resumed(&self) -> bool {
        self.recovery == Some(RecoveryMode::Resumed)
    }

    pub fn restarted(&self) -> bool {
        self.recovery == Some(RecoveryMode::Restarted)
    }
}

/// Builds the view for `turn`.
pub fn project(turn: &Turn) -> MessageView {
    let tool_calls: Vec<ToolCallView> = turn
        .tool_calls()
        .iter()
        .map(|call| ToolCallView {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            status: call.status,
            result: call.result.clone(),
        })
        .collect();
    let active_tool = if turn.status().is_terminal() {
        None
    } else {
        tool_calls
            .iter()
            .rev()
            .find(|call| !call.status.is_terminal())
            .map(|call| call.name.clone())
    };

    MessageView {
        turn_id: turn.turn_id().clone(),
        query: turn.query().to_string(),
        text: turn.text().to_string(),
        tool_calls,
        active_tool,
        status: turn.status(),
        badge: turn.status().into(),
        error: turn.failure().map(|failure| ErrorView {
            reason: failure.reason,
            message: failure.message.clone(),
        }),
        recovery: turn.recovery(),
        attempts: turn.attempts(),
        last_sequence: turn.last_sequence(),
        created_at: turn.created_at(),
        updated_at: turn.updated_at(),
    }
}
