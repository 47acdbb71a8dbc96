use std::time::Duration;

use crate::frame::TurnId;
use crate::projection::MessageView;
use crate::state::TurnStatus;
use crate::turn::RecoveryMode;

/// Events delivered through a `TurnHandle`, in emission order.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnEvent {
    /// Another turn of the session is still live; this one is waiting.
    Queued { turn_id: TurnId },
    /// Turn left the queue and is opening its subscription.
    Started {
        turn_id: TurnId,
        session_id: uuid::Uuid,
    },
    /// New immutable view after a material change.
    Snapshot { turn_id: TurnId, view: MessageView },
    /// Status changed. A terminal status is the last event of the turn.
    StateChanged { turn_id: TurnId, status: TurnStatus },
    /// The subscription dropped and a new attempt starts after `delay`.
    Retrying {
        turn_id: TurnId,
        attempt: u32,
        mode: RecoveryMode,
        delay: Duration,
    },
}

impl TurnEvent {
    pub fn turn_id(&self) -> &TurnId {
        match self {
            Self::Queued { turn_id }
            | Self::Started { turn_id, .. }
            | Self::Snapshot { turn_id, .. }
            | Self::StateChanged { turn_id, .. }
            | Self::Retrying { turn_id, .. } => turn_id,
        }
    }

    /// Whether this is the final event of the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StateChanged { status, .. } if status.is_terminal())
    }
}

/// Push-style sink for UI collaborators that do not hold a `TurnHandle`.
///
/// Callbacks run on the turn task and must not block. Receivers must treat the
/// view as read-only.
pub trait TurnObserver: Send + Sync {
    fn on_snapshot(&self, turn_id: &TurnId, view: &MessageView) {
        let _ = (turn_id, view);
    }

    fn on_state_change(&self, turn_id: &TurnId, status: TurnStatus) {
        let _ = (turn_id, status);
    }
}
