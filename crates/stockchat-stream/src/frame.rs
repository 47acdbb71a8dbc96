use std::fmt;

/// Opaque identifier of one turn, shared with the backend.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    /// Creates a turn id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh random turn id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the turn id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TurnId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TurnId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Wire `kind` discriminator of a frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    TextDelta,
    ToolCallStart,
    ToolCallUpdate,
    ToolCallEnd,
    TurnEnd,
    TurnError,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextDelta => "text_delta",
            Self::ToolCallStart => "tool_call_start",
            Self::ToolCallUpdate => "tool_call_update",
            Self::ToolCallEnd => "tool_call_end",
            Self::TurnEnd => "turn_end",
            Self::TurnError => "turn_error",
        }
    }

    /// Parses a wire kind; unknown kinds return `None`.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "text_delta" => Self::TextDelta,
            "tool_call_start" => Self::ToolCallStart,
            "tool_call_update" => Self::ToolCallUpdate,
            "tool_call_end" => Self::ToolCallEnd,
            "turn_end" => Self::TurnEnd,
            "turn_error" => Self::TurnError,
            _ => return None,
        })
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one tool invocation. Moves forward only:
/// `pending -> running -> completed | error`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Error => 2,
        }
    }

    /// Whether moving from `self` to `next` is a strict forward step.
    pub fn can_advance_to(self, next: ToolCallStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific content of a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameBody {
    /// Text appended to the assistant message.
    TextDelta(String),
    /// A tool invocation was announced.
    ToolCallStart { call_id: String, name: String },
    /// A tool invocation changed status.
    ToolCallUpdate {
        call_id: String,
        status: ToolCallStatus,
        result: Option<serde_json::Value>,
    },
    /// A tool invocation finished (`completed` or `error`).
    ToolCallEnd {
        call_id: String,
        status: ToolCallStatus,
        result: Option<serde_json::Value>,
    },
    /// The assistant response is complete.
    TurnEnd,
    /// The backend aborted the turn. `code` is set to `unknown_frame` for
    /// frames this client could not classify.
    TurnError {
        message: String,
        code: Option<String>,
    },
}

impl FrameBody {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::TextDelta(_) => FrameKind::TextDelta,
            Self::ToolCallStart { .. } => FrameKind::ToolCallStart,
            Self::ToolCallUpdate { .. } => FrameKind::ToolCallUpdate,
            Self::ToolCallEnd { .. } => FrameKind::ToolCallEnd,
            Self::TurnEnd => FrameKind::TurnEnd,
            Self::TurnError { .. } => FrameKind::TurnError,
        }
    }

    /// Whether this body ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnEnd | Self::TurnError { .. })
    }
}

/// One unit of the streaming protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct EventFrame {
    pub turn_id: TurnId,
    /// Per-turn position, starting at 0.
    pub sequence: u64,
    pub body: FrameBody,
}

impl EventFrame {
    pub fn new(turn_id: impl Into<TurnId>, sequence: u64, body: FrameBody) -> Self {
        Self {
            turn_id: turn_id.into(),
            sequence,
            body,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.body.kind()
    }

    pub fn text_delta(turn_id: impl Into<TurnId>, sequence: u64, text: impl Into<String>) -> Self {
        Self::new(turn_id, sequence, FrameBody::TextDelta(text.into()))
    }

    pub fn tool_call_start(
        turn_id: impl Into<TurnId>,
        sequence: u64,
        call_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(
            turn_id,
            sequence,
            FrameBody::ToolCallStart {
                call_id: call_id.into(),
                name: name.into(),
            },
        )
    }

    pub fn tool_call_update(
        turn_id: impl Into<TurnId>,
        sequence: u64,
        call_id: impl Into<String>,
        status: ToolCallStatus,
    ) -> Self {
        Self::new(
            turn_id,
            sequence,
            FrameBody::ToolCallUpdate {
                call_id: call_id.into(),
                status,
                result: None,
            },
        )
    }

    pub fn tool_call_end(
        turn_id: impl Into<TurnId>,
        sequence: u64,
        call_id: impl Into<String>,
        status: ToolCallStatus,
        result: Option<serde_json::Value>,
    ) -> Self {
        Self::new(
            turn_id,
            sequence,
            FrameBody::ToolCallEnd {
                call_id: call_id.into(),
                status,
                result,
            },
        )
    }

    pub fn turn_end(turn_id: impl Into<TurnId>, sequence: u64) -> Self {
        Self::new(turn_id, sequence, FrameBody::TurnEnd)
    }

    pub fn turn_error(turn_id: impl Into<TurnId>, sequence: u64, message: impl Into<String>) -> Self {
        Self::new(
            turn_id,
            sequence,
            FrameBody::TurnError {
                message: message.into(),
                code: None,
            },
        )
    }
}
