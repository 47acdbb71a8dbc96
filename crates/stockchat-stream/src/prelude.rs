//! Common imports for typical client usage.
pub use crate::{
    CancelHandle, ConcurrencyPolicy, EventFrame, FailureReason, HttpSseTransport,
    HttpTransportConfig, MessageView, RecoveryMode, ScriptStep, ScriptedTransport, SessionConfig,
    SessionSummary, SessionToken, StatusBadge, StreamConfig, StreamController, StreamError,
    Transport, Turn, TurnEvent, TurnHandle, TurnId, TurnObserver, TurnRequest, TurnStatus,
};
