use std::fmt;

use crate::frame::{FrameKind, ToolCallStatus, TurnId};
use crate::state::TurnStatus;

/// Errors produced while decoding one wire frame.
///
/// A decode error drops the frame; it only becomes fatal for the turn after
/// repeated consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Frame body was not valid JSON.
    #[error("invalid frame JSON: {0}")]
    InvalidJson(String),
    /// A required envelope field was absent.
    #[error("frame is missing `{0}`")]
    MissingField(&'static str),
    /// An envelope field had the wrong type or an invalid value.
    #[error("frame field `{field}` is invalid: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
    /// The payload shape does not match the frame kind.
    #[error("malformed {kind} payload: {message}")]
    MalformedPayload { kind: FrameKind, message: String },
}

impl DecodeError {
    pub(crate) fn invalid_field(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn malformed(kind: FrameKind, message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind,
            message: message.into(),
        }
    }
}

/// A well-formed frame that violated a protocol invariant and was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectedFrame {
    /// Frame belongs to a different turn.
    #[error("frame for turn {actual} delivered to turn {expected}")]
    ForeignTurn { expected: TurnId, actual: TurnId },
    /// Sequence was already applied or is already waiting in the reorder buffer.
    #[error("duplicate frame sequence {sequence}")]
    Duplicate { sequence: u64 },
    /// Turn already reached a terminal state.
    #[error("frame sequence {sequence} arrived after turn became {status}")]
    AfterTerminal { sequence: u64, status: TurnStatus },
    /// Turn has not started streaming yet.
    #[error("frame sequence {sequence} arrived before turn started streaming")]
    NotStreaming { sequence: u64 },
    /// Too many frames are already waiting for a sequence gap to close.
    #[error("reorder buffer full ({capacity} frames), dropped sequence {sequence}")]
    ReorderBufferFull { sequence: u64, capacity: usize },
    /// `tool_call_start` repeated an existing call id.
    #[error("tool call {call_id} already started")]
    DuplicateToolCall { call_id: String },
    /// Update or end referenced a call id that was never started.
    #[error("tool call {call_id} is unknown")]
    UnknownToolCall { call_id: String },
    /// Status change would move a tool call backwards.
    #[error("tool call {call_id} cannot move from {from} to {to}")]
    BackwardToolStatus {
        call_id: String,
        from: ToolCallStatus,
        to: ToolCallStatus,
    },
}

/// Errors reported by a transport while opening or reading a subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Backend refused the subscription (auth, bad request). Not retried.
    #[error("transport rejected subscription: {message}")]
    Rejected {
        message: String,
        status_code: Option<u16>,
    },
    /// Connection dropped or could not be established. Retried.
    #[error("transport disconnected: {message}")]
    Disconnected { message: String },
    /// Byte-level framing was unusable.
    #[error("transport protocol error: {message}")]
    Protocol { message: String },
}

impl TransportError {
    /// Creates a non-transient rejection.
    pub fn rejected(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Rejected {
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transient disconnect.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    /// Creates a framing error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether the controller may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Protocol { .. })
    }
}

/// Machine-readable reason attached to an errored turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Backend sent `turn_error`.
    ServerError,
    /// Backend sent a frame kind this client does not understand.
    UnknownFrame,
    /// Too many consecutive frames failed to decode.
    DecodeFailures,
    /// Reorder buffer never closed its gap.
    SequenceGapTimeout,
    /// Automatic retries were used up.
    TransportExhausted,
    /// Backend refused the subscription outright.
    TransportRejected,
}

impl FailureReason {
    /// Stable reason code for UI and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerError => "server_error",
            Self::UnknownFrame => "unknown_frame",
            Self::DecodeFailures => "decode_failures",
            Self::SequenceGapTimeout => "sequence_gap_timeout",
            Self::TransportExhausted => "transport_exhausted",
            Self::TransportRejected => "transport_rejected",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a turn, surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{reason}: {message}")]
pub struct TurnFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl TurnFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Top-level error type for the public controller API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Caller misuse, rejected before anything reaches the transport.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Invalid controller or transport configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The session already holds its maximum number of live turns.
    #[error("session full: {limit} turns are already streaming or queued")]
    SessionFull { limit: usize },
    /// No live or recorded turn has this id.
    #[error("unknown turn: {0}")]
    UnknownTurn(TurnId),
    /// Internal invariant violation (for example a turn task that vanished).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_disconnects_and_framing_errors_are_transient() {
        assert!(TransportError::disconnected("reset").is_transient());
        assert!(TransportError::protocol("bad chunk").is_transient());
        assert!(!TransportError::rejected("unauthorized", Some(401)).is_transient());
    }

    #[test]
    fn failure_reason_serializes_as_reason_code() {
        let failure = TurnFailure::new(FailureReason::SequenceGapTimeout, "gap at 3");
        let value = serde_json::to_value(&failure).expect("serialize");
        assert_eq!(value["reason"], "sequence_gap_timeout");
        assert_eq!(failure.to_string(), "sequence_gap_timeout: gap at 3");
    }
}
