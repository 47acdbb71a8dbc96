use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::stream;

use crate::codec;
use crate::errors::TransportError;
use crate::frame::EventFrame;

use super::{Subscription, Transport, TransportRequest};

/// One step of a scripted connection.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Frame re-addressed to the requesting turn and encoded on delivery.
    Frame(EventFrame),
    /// Raw wire text delivered verbatim.
    Raw(String),
    /// Waits before the next step.
    Pause(Duration),
    /// Fails the subscription with a transient disconnect.
    Disconnect(String),
    /// Never yields again.
    Hang,
}

/// Transport that plays back pre-recorded connections, one per subscription.
///
/// Used for fixtures, replay and tests. Each call to `subscribe` consumes the
/// next scripted connection; when none are left the subscription fails with a
/// disconnect.
#[derive(Default)]
pub struct ScriptedTransport {
    connections: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<TransportRequest>>,
    resume: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a connection script.
    pub fn connection(self, steps: Vec<ScriptStep>) -> Self {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(steps);
        self
    }

    /// Appends a connection that delivers `frames` and then closes cleanly.
    pub fn frames(self, frames: impl IntoIterator<Item = EventFrame>) -> Self {
        self.connection(frames.into_iter().map(ScriptStep::Frame).collect())
    }

    pub fn supports_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_resume(&self) -> bool {
        self.resume
    }

    async fn subscribe(&self, request: TransportRequest) -> Result<Subscription, TransportError> {
        let turn_id = request.turn_id.clone();
        let resume_from = request.resume_from.unwrap_or(0);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let Some(steps) = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        else {
            return Err(TransportError::disconnected("no scripted connection left"));
        };

        let steps: VecDeque<ScriptStep> = steps
            .into_iter()
            .filter(|step| !matches!(step, ScriptStep::Frame(f) if f.sequence < resume_from))
            .map(|step| match step {
                ScriptStep::Frame(mut frame) => {
                    frame.turn_id = turn_id.clone();
                    ScriptStep::Raw(codec::encode(&frame))
                }
                other => other,
            })
            .collect();

        let stream = stream::unfold(Some(steps), |state| async move {
            let mut steps = state?;
            loop {
                match steps.pop_front()? {
                    ScriptStep::Raw(raw) => return Some((Ok(raw), Some(steps))),
                    ScriptStep::Frame(frame) => {
                        return Some((Ok(codec::encode(&frame)), Some(steps)));
                    }
                    ScriptStep::Pause(delay) => tokio::time::sleep(delay).await,
                    ScriptStep::Disconnect(message) => {
                        return Some((Err(TransportError::disconnected(message)), None));
                    }
                    ScriptStep::Hang => futures::future::pending::<()>().await,
                }
            }
        });
        Ok(Subscription::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionToken;
    use crate::frame::TurnId;
    use futures::StreamExt as _;

    fn request(turn_id: &str, resume_from: Option<u64>) -> TransportRequest {
        TransportRequest {
            turn_id: TurnId::new(turn_id),
            session_id: uuid::Uuid::nil(),
            query: "q".into(),
            credential: SessionToken::new("t"),
            resume_from,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn frames_are_readdressed_and_resume_skips_applied_ones() {
        let transport = ScriptedTransport::new().supports_resume(true).frames([
            EventFrame::text_delta("template", 0, "a"),
            EventFrame::text_delta("template", 1, "b"),
        ]);
        let sub = transport
            .subscribe(request("t7", Some(1)))
            .await
            .expect("subscribe");
        let raw: Vec<_> = sub.stream.collect().await;
        assert_eq!(raw.len(), 1);
        let frame = codec::decode(raw[0].as_ref().expect("raw")).expect("decode");
        assert_eq!(frame.turn_id, TurnId::new("t7"));
        assert_eq!(frame.sequence, 1);
        assert_eq!(transport.requests()[0].resume_from, Some(1));
    }

    #[tokio::test]
    async fn disconnect_ends_the_stream_and_exhausted_script_fails() {
        let transport = ScriptedTransport::new().connection(vec![
            ScriptStep::Raw("x".into()),
            ScriptStep::Disconnect("reset".into()),
            ScriptStep::Raw("never".into()),
        ]);
        let sub = transport.subscribe(request("t1", None)).await.expect("subscribe");
        let items: Vec<_> = sub.stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(TransportError::Disconnected { .. })));
        assert!(transport.subscribe(request("t1", None)).await.is_err());
    }
}
