//! Per-turn state machine.
//!
//! ```text
//! Pending --submit--> Streaming --turn_end--> Completed
//!                         |  ^      --turn_error--> Errored
//!          content frames +--+      --cancel--> Cancelled
//! ```
//!
//! Terminal states absorb every further input.
use std::fmt;

use crate::frame::FrameBody;

/// Status of one turn. `Pending` is the idle state before submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    /// Computes the transition for `input` without mutating anything.
    pub fn on(self, input: TurnInput) -> Transition {
        use TurnInput as I;
        use TurnStatus as S;

        let to = match (self, input) {
            (S::Pending, I::Submit) => S::Streaming,
            (S::Pending, I::Cancel) => S::Cancelled,
            (S::Pending, _) => return Transition::Ignored { status: self, input },
            (S::Streaming, I::Content) => return Transition::Unchanged(S::Streaming),
            (S::Streaming, I::End) => S::Completed,
            (S::Streaming, I::Error) => S::Errored,
            (S::Streaming, I::Cancel) => S::Cancelled,
            (S::Streaming, I::Submit) => return Transition::Ignored { status: self, input },
            (S::Completed | S::Errored | S::Cancelled, _) => {
                return Transition::Ignored { status: self, input };
            }
        };
        Transition::Advanced { from: self, to }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TurnInput {
    Submit,
    /// `text_delta` or any `tool_call_*` frame.
    Content,
    /// `turn_end` frame.
    End,
    /// `turn_error` frame or a locally detected fatal condition.
    Error,
    Cancel,
}

impl TurnInput {
    pub fn from_body(body: &FrameBody) -> Self {
        match body {
            FrameBody::TurnEnd => Self::End,
            FrameBody::TurnError { .. } => Self::Error,
            _ => Self::Content,
        }
    }
}

/// Result of feeding one input to [`TurnStatus::on`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    /// Status changed.
    Advanced { from: TurnStatus, to: TurnStatus },
    /// Legal self-loop; the turn content may change but the status does not.
    Unchanged(TurnStatus),
    /// Input is not applicable in this status and must be dropped.
    Ignored { status: TurnStatus, input: TurnInput },
}

impl Transition {
    /// Whether the input should be applied to the turn.
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Ignored { .. })
    }

    /// Status after the transition.
    pub fn status(&self) -> TurnStatus {
        match *self {
            Self::Advanced { to, .. } => to,
            Self::Unchanged(status) | Self::Ignored { status, .. } => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_turn_reaches_each_terminal_state() {
        assert_eq!(TurnStatus::Pending.on(TurnInput::Submit).status(), TurnStatus::Streaming);
        assert_eq!(
            TurnStatus::Streaming.on(TurnInput::Content),
            Transition::Unchanged(TurnStatus::Streaming)
        );
        assert_eq!(TurnStatus::Streaming.on(TurnInput::End).status(), TurnStatus::Completed);
        assert_eq!(TurnStatus::Streaming.on(TurnInput::Error).status(), TurnStatus::Errored);
        assert_eq!(TurnStatus::Streaming.on(TurnInput::Cancel).status(), TurnStatus::Cancelled);
    }

    #[test]
    fn terminal_states_absorb_everything() {
        for status in [TurnStatus::Completed, TurnStatus::Errored, TurnStatus::Cancelled] {
            for input in [
                TurnInput::Submit,
                TurnInput::Content,
                TurnInput::End,
                TurnInput::Error,
                TurnInput::Cancel,
            ] {
                let transition = status.on(input);
                assert!(!transition.is_applied());
                assert_eq!(transition.status(), status);
            }
        }
    }

    #[test]
    fn pending_turn_only_accepts_submit_or_cancel() {
        assert!(!TurnStatus::Pending.on(TurnInput::Content).is_applied());
        assert!(!TurnStatus::Pending.on(TurnInput::End).is_applied());
        assert_eq!(TurnStatus::Pending.on(TurnInput::Cancel).status(), TurnStatus::Cancelled);
        assert!(!TurnStatus::Streaming.on(TurnInput::Submit).is_applied());
    }
}
