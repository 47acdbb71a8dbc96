//! Transport contract between the controller and the analysis backend.
//!
//! A transport opens one subscription per turn attempt and yields raw,
//! still-encoded frames. The stream ending before `turn_end` is treated as a
//! disconnect.
use std::pin::Pin;

use crate::config::SessionToken;
use crate::errors::TransportError;
use crate::frame::TurnId;

pub mod http;
pub mod scripted;

pub use http::{HttpSseTransport, HttpTransportConfig};
pub use scripted::{ScriptStep, ScriptedTransport};

/// Raw frames as delivered by the wire, one JSON document per item.
pub type RawFrameStream =
    Pin<Box<dyn futures::Stream<Item = Result<String, TransportError>> + Send + 'static>>;

/// Parameters for opening one subscription.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub turn_id: TurnId,
    pub session_id: uuid::Uuid,
    pub query: String,
    pub credential: SessionToken,
    /// First sequence wanted when resuming; `None` for a fresh start.
    pub resume_from: Option<u64>,
    /// 1 for the first subscription of the turn.
    pub attempt: u32,
}

/// An open subscription. Dropping it releases the underlying connection.
pub struct Subscription {
    pub stream: RawFrameStream,
}

impl Subscription {
    pub fn new(stream: RawFrameStream) -> Self {
        Self { stream }
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether `TransportRequest::resume_from` is honored. When `false` the
    /// controller restarts dropped turns from scratch.
    fn supports_resume(&self) -> bool {
        false
    }

    async fn subscribe(&self, request: TransportRequest) -> Result<Subscription, TransportError>;
}
