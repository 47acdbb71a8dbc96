//! Stream controller: owns transport subscriptions and the per-session
//! concurrency policy.
//!
//! Every turn runs on its own task that is the only owner of the turn's
//! [`TurnAssembler`]. The only state shared across turns is the session's
//! active-turn slot, which only controller code touches.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assembler::{AssemblerLimits, TurnAssembler};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::{ConcurrencyPolicy, SessionToken, StreamConfig};
use crate::errors::{FailureReason, StreamError, TransportError, TurnFailure};
use crate::events::{TurnEvent, TurnObserver};
use crate::frame::TurnId;
use crate::projection::project;
use crate::session::{SessionConfig, SessionHistory, SessionSummary};
use crate::state::TurnStatus;
use crate::transport::{Subscription, Transport, TransportRequest};
use crate::turn::{RecoveryMode, Turn};

/// Handle used to request cancellation of a turn.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Requests cancellation.
    ///
    /// Cancellation is cooperative: the turn observes it at its next
    /// suspension point and acknowledges with `StateChanged(Cancelled)`. No
    /// snapshot follows the acknowledgement.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Parameters for [`StreamController::start_with`].
#[derive(Clone, Debug)]
pub struct TurnRequest {
    query: String,
    policy: Option<ConcurrencyPolicy>,
    turn_id: Option<TurnId>,
}

impl TurnRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            policy: None,
            turn_id: None,
        }
    }

    /// Overrides the controller's default concurrency policy for this turn.
    pub fn policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Uses a caller-chosen turn id instead of a generated one.
    pub fn turn_id(mut self, turn_id: impl Into<TurnId>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }
}

/// Streaming handle returned by `start`.
///
/// Use `next_event()` to consume events as they arrive and `finish()` to obtain
/// the final turn.
pub struct TurnHandle {
    turn_id: TurnId,
    session_id: uuid::Uuid,
    rx: mpsc::Receiver<TurnEvent>,
    final_rx: oneshot::Receiver<Turn>,
    cancel: CancelHandle,
    saw_terminal: bool,
}

impl TurnHandle {
    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the next event. Returns `None` once the turn task is gone.
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(TurnEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the final turn.
    ///
    /// Errored and cancelled turns are returned as `Ok`; inspect
    /// `Turn::status` and `Turn::failure`.
    pub async fn finish(mut self) -> Result<Turn, StreamError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }
        self.final_rx.await.map_err(|_| {
            StreamError::protocol_msg(format!(
                "turn task for {} ended without a final turn",
                self.turn_id
            ))
        })
    }
}

struct LiveTurn {
    cancel: CancelHandle,
    query: String,
}

/// Non-terminal turns of the session in admission order.
#[derive(Default)]
struct ActiveSlot {
    live: Vec<(TurnId, watch::Receiver<bool>)>,
}

struct ControllerInner {
    transport: Arc<dyn Transport>,
    credential: SessionToken,
    config: StreamConfig,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn TurnObserver>>,
    session_id: uuid::Uuid,
    session: SessionConfig,
    live: DashMap<TurnId, LiveTurn>,
    slot: Mutex<ActiveSlot>,
    history: Mutex<SessionHistory>,
    generation: AtomicU64,
}

impl ControllerInner {
    fn slot(&self) -> MutexGuard<'_, ActiveSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn history(&self) -> MutexGuard<'_, SessionHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Controller for one chat session.
#[derive(Clone)]
pub struct StreamController {
    inner: Arc<ControllerInner>,
}

impl StreamController {
    pub fn builder() -> StreamControllerBuilder {
        StreamControllerBuilder::default()
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.inner.session_id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Starts a turn for `query` with the default concurrency policy.
    ///
    /// Returns immediately. Fails synchronously only on invalid input or when
    /// the session already holds `max_live_turns` live turns.
    pub fn start(&self, query: impl Into<String>) -> Result<TurnHandle, StreamError> {
        self.start_with(TurnRequest::new(query))
    }

    /// Starts a turn with explicit options. Must be called within a Tokio runtime.
    pub fn start_with(&self, request: TurnRequest) -> Result<TurnHandle, StreamError> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(StreamError::InvalidArgument("query must not be empty".into()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StreamError::Config("turns can only be started inside a Tokio runtime".into())
        })?;
        let inner = &self.inner;
        let turn_id = match request.turn_id {
            Some(id) if id.as_str().trim().is_empty() => {
                return Err(StreamError::InvalidArgument("turn id must not be empty".into()));
            }
            Some(id) => {
                if inner.live.contains_key(&id) || inner.history().find(&id).is_some() {
                    return Err(StreamError::InvalidArgument(format!(
                        "turn id {id} is already in use"
                    )));
                }
                id
            }
            None => TurnId::generate(),
        };
        let policy = request.policy.unwrap_or(inner.config.default_policy);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = CancelHandle {
            tx: Arc::new(cancel_tx),
        };
        let (done_tx, done_rx) = watch::channel(false);
        let predecessors = {
            let mut slot = inner.slot();
            if slot.live.len() >= inner.config.max_live_turns {
                warn!(session_id = %inner.session_id, live = slot.live.len(), "session full, turn rejected");
                return Err(StreamError::SessionFull {
                    limit: inner.config.max_live_turns,
                });
            }
            let predecessors = slot.live.clone();
            slot.live.push((turn_id.clone(), done_rx));
            predecessors
        };
        inner.live.insert(
            turn_id.clone(),
            LiveTurn {
                cancel: cancel.clone(),
                query: query.clone(),
            },
        );

        if policy == ConcurrencyPolicy::CancelPrevious {
            for (id, _) in &predecessors {
                if let Some(live) = inner.live.get(id) {
                    info!(session_id = %inner.session_id, turn_id = %id, superseded_by = %turn_id, "cancelling in-flight turn");
                    live.cancel.cancel();
                }
            }
        }

        let turn = Turn::new(turn_id.clone(), inner.session_id, query, inner.clock.now());
        let assembler = TurnAssembler::new(
            turn,
            AssemblerLimits::from(&inner.config),
            inner.clock.clone(),
        );
        let (tx, rx) = mpsc::channel(inner.config.event_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let task = TurnTask {
            inner: inner.clone(),
            emitter: Emitter {
                turn_id: turn_id.clone(),
                tx,
                observers: inner.observers.clone(),
                cancel_rx: cancel_rx.clone(),
            },
            cancel_rx,
            policy,
            generation: inner.generation.load(Ordering::SeqCst),
        };
        let guard = SlotGuard {
            inner: inner.clone(),
            turn_id: turn_id.clone(),
            done_tx,
        };
        let waits = predecessors.into_iter().map(|(_, rx)| rx).collect();
        runtime.spawn(task.run(assembler, waits, guard, final_tx));

        Ok(TurnHandle {
            turn_id,
            session_id: inner.session_id,
            rx,
            final_rx,
            cancel,
            saw_terminal: false,
        })
    }

    /// Requests cancellation of a live turn. Cancelling a finished turn is a
    /// no-op.
    pub fn cancel(&self, turn_id: &TurnId) -> Result<(), StreamError> {
        if let Some(live) = self.inner.live.get(turn_id) {
            info!(session_id = %self.inner.session_id, turn_id = %turn_id, "cancel requested");
            live.cancel.cancel();
            return Ok(());
        }
        if self.inner.history().find(turn_id).is_some() {
            return Ok(());
        }
        Err(StreamError::UnknownTurn(turn_id.clone()))
    }

    /// Re-submits the query of `turn_id` as a new turn, cancelling whatever is
    /// still streaming.
    pub fn regenerate(&self, turn_id: &TurnId) -> Result<TurnHandle, StreamError> {
        let query = self
            .inner
            .live
            .get(turn_id)
            .map(|live| live.query.clone())
            .or_else(|| {
                self.inner
                    .history()
                    .find(turn_id)
                    .map(|turn| turn.query().to_string())
            })
            .ok_or_else(|| StreamError::UnknownTurn(turn_id.clone()))?;
        self.start_with(TurnRequest::new(query).policy(ConcurrencyPolicy::CancelPrevious))
    }

    /// Starts a new chat: cancels live turns and forgets the history.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        for live in self.inner.live.iter() {
            live.cancel.cancel();
        }
        self.inner.history().clear();
        info!(session_id = %self.inner.session_id, "session cleared");
    }

    /// Ids of turns that have not reached a terminal state, oldest first.
    pub fn live_turns(&self) -> Vec<TurnId> {
        self.inner
            .slot()
            .live
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Finished turns, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.inner.history().turns()
    }

    pub fn summary(&self) -> SessionSummary {
        self.inner
            .history()
            .summarize(self.inner.session_id, &self.inner.session)
    }
}

/// Builder used to wire a transport, credential and policy into a controller.
pub struct StreamControllerBuilder {
    transport: Option<Arc<dyn Transport>>,
    credential: Option<SessionToken>,
    config: StreamConfig,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn TurnObserver>>,
    session: SessionConfig,
}

impl Default for StreamControllerBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            credential: None,
            config: StreamConfig::default(),
            clock: Arc::new(SystemClock),
            observers: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}

impl StreamControllerBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credential(mut self, credential: SessionToken) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers an observer notified of every snapshot and status change.
    pub fn observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn build(self) -> Result<StreamController, StreamError> {
        let transport = self
            .transport
            .ok_or_else(|| StreamError::Config("a transport is required".into()))?;
        let credential = self
            .credential
            .filter(|token| !token.is_empty())
            .ok_or_else(|| StreamError::Config("a session credential is required".into()))?;
        self.config.validate()?;
        Ok(StreamController {
            inner: Arc::new(ControllerInner {
                transport,
                credential,
                history: Mutex::new(SessionHistory::new(self.config.history_limit)),
                config: self.config,
                clock: self.clock,
                observers: self.observers,
                session_id: uuid::Uuid::new_v4(),
                session: self.session,
                live: DashMap::new(),
                slot: Mutex::new(ActiveSlot::default()),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

/// Releases the turn's place in the session when the task ends, even on panic.
struct SlotGuard {
    inner: Arc<ControllerInner>,
    turn_id: TurnId,
    done_tx: watch::Sender<bool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.live.remove(&self.turn_id);
        self.inner
            .slot()
            .live
            .retain(|(id, _)| id != &self.turn_id);
        self.done_tx.send_replace(true);
        debug!(turn_id = %self.turn_id, "released active turn slot");
    }
}

/// The turn was cancelled while an event waited for room in the channel.
struct Cancelled;

struct Emitter {
    turn_id: TurnId,
    tx: mpsc::Sender<TurnEvent>,
    observers: Vec<Arc<dyn TurnObserver>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Emitter {
    /// Delivers `event`, waiting for channel capacity until the turn is
    /// cancelled. A dropped handle is not an error.
    async fn send(&self, event: TurnEvent) -> Result<(), Cancelled> {
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            biased;
            sent = self.tx.send(event) => {
                if sent.is_err() {
                    debug!(turn_id = %self.turn_id, "turn handle dropped, event discarded");
                }
                Ok(())
            }
            _ = wait_cancelled(&mut cancel_rx) => {
                debug!(turn_id = %self.turn_id, "event channel full at cancel, event discarded");
                Err(Cancelled)
            }
        }
    }

    async fn snapshot(&self, turn: &Turn) -> Result<(), Cancelled> {
        let view = project(turn);
        for observer in &self.observers {
            observer.on_snapshot(&self.turn_id, &view);
        }
        self.send(TurnEvent::Snapshot {
            turn_id: self.turn_id.clone(),
            view,
        })
        .await
    }

    async fn state(&self, status: TurnStatus) -> Result<(), Cancelled> {
        for observer in &self.observers {
            observer.on_state_change(&self.turn_id, status);
        }
        self.send(TurnEvent::StateChanged {
            turn_id: self.turn_id.clone(),
            status,
        })
        .await
    }

    /// Final snapshot followed by the terminal status.
    async fn terminal(&self, turn: &Turn) -> Result<(), Cancelled> {
        self.snapshot(turn).await?;
        self.state(turn.status()).await
    }

    /// Acknowledges cancellation without waiting. When the consumer has let
    /// the channel fill up the acknowledgement only reaches observers; the
    /// handle still gets the cancelled turn from `finish`.
    fn acknowledge_cancel(&self) {
        for observer in &self.observers {
            observer.on_state_change(&self.turn_id, TurnStatus::Cancelled);
        }
        let ack = TurnEvent::StateChanged {
            turn_id: self.turn_id.clone(),
            status: TurnStatus::Cancelled,
        };
        match self.tx.try_send(ack) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(turn_id = %self.turn_id, "event channel full, cancel acknowledged to observers only");
            }
        }
    }
}

enum PumpExit {
    Finished,
    Cancelled,
    Disconnected(TransportError),
}

struct TurnTask {
    inner: Arc<ControllerInner>,
    emitter: Emitter,
    cancel_rx: watch::Receiver<bool>,
    policy: ConcurrencyPolicy,
    generation: u64,
}

impl TurnTask {
    async fn run(
        mut self,
        mut assembler: TurnAssembler,
        predecessors: Vec<watch::Receiver<bool>>,
        guard: SlotGuard,
        final_tx: oneshot::Sender<Turn>,
    ) {
        let turn_id = assembler.turn().turn_id().clone();
        let session_id = self.inner.session_id;

        if !predecessors.is_empty() {
            let queued = match self.policy {
                ConcurrencyPolicy::Queue => {
                    info!(%session_id, turn_id = %turn_id, waiting_on = predecessors.len(), "turn queued");
                    self.emitter
                        .send(TurnEvent::Queued {
                            turn_id: turn_id.clone(),
                        })
                        .await
                }
                ConcurrencyPolicy::CancelPrevious => {
                    debug!(%session_id, turn_id = %turn_id, waiting_on = predecessors.len(), "waiting for superseded turns to release");
                    Ok(())
                }
            };
            let ready = futures::future::join_all(predecessors.into_iter().map(|mut rx| async move {
                let _ = rx.wait_for(|done| *done).await;
            }));
            let cancelled = queued.is_err()
                || tokio::select! {
                    biased;
                    _ = wait_cancelled(&mut self.cancel_rx) => true,
                    _ = ready => false,
                };
            if cancelled {
                self.finish_cancelled(&mut assembler);
                return self.finish(assembler, guard, final_tx);
            }
        }

        if let Some(snapshot) = assembler.begin() {
            info!(%session_id, turn_id = %turn_id, transport = self.inner.transport.name(), "turn started");
            if self.announce(&snapshot, session_id).await.is_err() {
                self.finish_cancelled(&mut assembler);
                return self.finish(assembler, guard, final_tx);
            }
        }

        self.stream_turn(&mut assembler).await;
        self.finish(assembler, guard, final_tx);
    }

    async fn announce(&self, snapshot: &Turn, session_id: uuid::Uuid) -> Result<(), Cancelled> {
        self.emitter
            .send(TurnEvent::Started {
                turn_id: snapshot.turn_id().clone(),
                session_id,
            })
            .await?;
        self.emitter.state(TurnStatus::Streaming).await?;
        self.emitter.snapshot(snapshot).await
    }

    async fn stream_turn(&mut self, assembler: &mut TurnAssembler) {
        let retry = self.inner.config.retry.clone();
        let mut schedule = retry.schedule();
        let mut resume_from = None;
        loop {
            let request = TransportRequest {
                turn_id: assembler.turn().turn_id().clone(),
                session_id: self.inner.session_id,
                query: assembler.turn().query().to_string(),
                credential: self.inner.credential.clone(),
                resume_from,
                attempt: assembler.turn().attempts(),
            };
            let opened = tokio::select! {
                biased;
                _ = wait_cancelled(&mut self.cancel_rx) => {
                    return self.finish_cancelled(assembler);
                }
                opened = self.inner.transport.subscribe(request) => opened,
            };
            let error = match opened {
                Ok(subscription) => {
                    let exit = self.pump(assembler, subscription).await;
                    debug!(turn_id = %assembler.turn().turn_id(), "subscription released");
                    match exit {
                        PumpExit::Finished => return,
                        PumpExit::Cancelled => return self.finish_cancelled(assembler),
                        PumpExit::Disconnected(error) => error,
                    }
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                warn!(turn_id = %assembler.turn().turn_id(), %error, "transport rejected turn");
                let failure = TurnFailure::new(FailureReason::TransportRejected, error.to_string());
                return self.finish_failed(assembler, failure).await;
            }
            let Some(delay) = schedule.next() else {
                let failure = TurnFailure::new(
                    FailureReason::TransportExhausted,
                    format!(
                        "gave up after {} attempts: {error}",
                        assembler.turn().attempts()
                    ),
                );
                return self.finish_failed(assembler, failure).await;
            };

            let mode = if self.inner.transport.supports_resume() {
                RecoveryMode::Resumed
            } else {
                RecoveryMode::Restarted
            };
            let attempt = assembler.turn().attempts() + 1;
            warn!(
                turn_id = %assembler.turn().turn_id(),
                attempt,
                ?mode,
                delay_ms = delay.as_millis() as u64,
                %error,
                "turn subscription dropped, retrying"
            );
            let announced = self
                .emitter
                .send(TurnEvent::Retrying {
                    turn_id: assembler.turn().turn_id().clone(),
                    attempt,
                    mode,
                    delay,
                })
                .await;
            if announced.is_err() {
                return self.finish_cancelled(assembler);
            }
            tokio::select! {
                biased;
                _ = wait_cancelled(&mut self.cancel_rx) => {
                    return self.finish_cancelled(assembler);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            assembler.recover(mode);
            resume_from = match mode {
                RecoveryMode::Resumed => Some(assembler.turn().next_sequence()),
                RecoveryMode::Restarted => None,
            };
            if self.emitter.snapshot(assembler.turn()).await.is_err() {
                return self.finish_cancelled(assembler);
            }
        }
    }

    async fn pump(&mut self, assembler: &mut TurnAssembler, mut subscription: Subscription) -> PumpExit {
        loop {
            let deadline = assembler.gap_deadline();
            tokio::select! {
                biased;
                _ = wait_cancelled(&mut self.cancel_rx) => return PumpExit::Cancelled,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(turn) = assembler.expire_gap(Instant::now()) {
                        warn!(turn_id = %turn.turn_id(), "sequence gap timed out");
                        let _ = self.emitter.terminal(&turn).await;
                        return PumpExit::Finished;
                    }
                }
                next = subscription.stream.next() => match next {
                    Some(Ok(raw)) => match self.handle_raw(assembler, &raw).await {
                        Ok(true) => return PumpExit::Finished,
                        Ok(false) => {}
                        Err(Cancelled) => return PumpExit::Cancelled,
                    },
                    Some(Err(error)) => return PumpExit::Disconnected(error),
                    None => {
                        return PumpExit::Disconnected(TransportError::disconnected(
                            "stream closed before turn_end",
                        ));
                    }
                }
            }
        }
    }

    /// Decodes and applies one raw frame. Returns `true` once the turn is terminal.
    async fn handle_raw(&self, assembler: &mut TurnAssembler, raw: &str) -> Result<bool, Cancelled> {
        let frame = match codec::decode(raw) {
            Ok(frame) => frame,
            Err(error) => {
                return match assembler.record_decode_failure(&error) {
                    Some(turn) => {
                        let _ = self.emitter.terminal(&turn).await;
                        Ok(true)
                    }
                    None => Ok(false),
                };
            }
        };

        let sequence = frame.sequence;
        match assembler.apply(frame, Instant::now()) {
            Err(rejected) => {
                debug!(turn_id = %assembler.turn().turn_id(), sequence, %rejected, "dropped frame");
                Ok(false)
            }
            Ok(report) => {
                let status = assembler.turn().status();
                for (_, snapshot) in report.snapshots() {
                    if self.emitter.snapshot(snapshot).await.is_err() && !status.is_terminal() {
                        return Err(Cancelled);
                    }
                }
                if status.is_terminal() {
                    info!(
                        turn_id = %assembler.turn().turn_id(),
                        %status,
                        reason = assembler.turn().failure().map(|f| f.reason.as_str()),
                        "turn finished"
                    );
                    let _ = self.emitter.state(status).await;
                }
                Ok(status.is_terminal())
            }
        }
    }

    fn finish_cancelled(&self, assembler: &mut TurnAssembler) {
        if assembler.cancel().is_some() {
            info!(turn_id = %assembler.turn().turn_id(), "turn cancelled");
            self.emitter.acknowledge_cancel();
        }
    }

    async fn finish_failed(&self, assembler: &mut TurnAssembler, failure: TurnFailure) {
        let reason = failure.reason;
        if let Some(turn) = assembler.fail(failure) {
            info!(turn_id = %turn.turn_id(), %reason, "turn errored");
            let _ = self.emitter.terminal(&turn).await;
        }
    }

    fn finish(&self, assembler: TurnAssembler, guard: SlotGuard, final_tx: oneshot::Sender<Turn>) {
        let turn = assembler.into_turn();
        if turn.status().is_terminal()
            && self.inner.generation.load(Ordering::SeqCst) == self.generation
        {
            self.inner.history().push(turn.clone());
        }
        drop(guard);
        let _ = final_tx.send(turn);
    }
}

/// Resolves once cancellation has been requested; never resolves if every
/// cancel handle is gone.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        futures::future::pending::<()>().await;
    }
}
