//! Client-side streaming protocol for a stock-analysis chat assistant.
//!
//! A query becomes a *turn*. The backend streams the answer as sequenced
//! frames (text deltas, tool-call lifecycle, `turn_end` / `turn_error`); this
//! crate reassembles them in order, drives the turn state machine, recovers
//! from dropped connections and publishes immutable snapshots for rendering.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stockchat_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let controller = StreamController::builder()
//!     .transport(Arc::new(HttpSseTransport::from_env()?))
//!     .credential(SessionToken::from_env()?)
//!     .config(StreamConfig::from_env()?)
//!     .build()?;
//!
//! let mut handle = controller.start("Analyze TCS")?;
//! while let Some(event) = handle.next_event().await {
//!     if let TurnEvent::Snapshot { view, .. } = &event {
//!         println!("{}", view.text);
//!     }
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Frame assembly: ordering, dedup, gap timeout and tool-call folding.
pub mod assembler;
/// Wall-clock abstraction used for turn timestamps.
pub mod clock;
/// JSON and SSE wire codec for frames.
pub mod codec;
/// Runtime configuration, concurrency policy and session credential.
pub mod config;
/// Session-level orchestration of turns.
pub mod controller;
/// Public error types.
pub mod errors;
/// Events delivered to turn handles and observers.
pub mod events;
/// Wire-level frame model.
pub mod frame;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Pure view model derived from a turn.
pub mod projection;
/// Reconnect backoff policy.
pub mod retry;
/// Session configuration, history summary.
pub mod session;
/// Turn lifecycle state machine.
pub mod state;
/// Transport contract plus HTTP/SSE and scripted implementations.
pub mod transport;
/// Turn aggregate.
pub mod turn;

pub use assembler::{AssemblerLimits, ApplyReport, FoldOutcome, TurnAssembler};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConcurrencyPolicy, SessionToken, StreamConfig};
pub use controller::{CancelHandle, StreamController, StreamControllerBuilder, TurnHandle, TurnRequest};
pub use errors::{DecodeError, FailureReason, RejectedFrame, StreamError, TransportError, TurnFailure};
pub use events::{TurnEvent, TurnObserver};
pub use frame::{EventFrame, FrameBody, FrameKind, ToolCallStatus, TurnId};
pub use observability::init_observability;
pub use projection::{ErrorView, MessageView, StatusBadge, ToolCallView, project};
pub use retry::RetryPolicy;
pub use session::{SessionConfig, SessionSummary};
pub use state::{Transition, TurnInput, TurnStatus};
pub use transport::{
    HttpSseTransport, HttpTransportConfig, RawFrameStream, ScriptStep, ScriptedTransport,
    Subscription, Transport, TransportRequest,
};
pub use turn::{RecoveryMode, ToolCallRecord, Turn};
