//! Folds decoded frames into a [`Turn`].
//!
//! Frames must be applied in exact sequence order. Frames that arrive early
//! wait in a bounded reorder buffer until the gap closes; if it stays open past
//! the gap timeout the turn errors with `sequence_gap_timeout`.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::codec::UNKNOWN_FRAME_CODE;
use crate::config::StreamConfig;
use crate::errors::{DecodeError, FailureReason, RejectedFrame, TurnFailure};
use crate::frame::{EventFrame, FrameBody, ToolCallStatus};
use crate::state::{TurnInput, TurnStatus};
use crate::turn::{RecoveryMode, ToolCallRecord, Turn};

/// Bounds enforced by a [`TurnAssembler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssemblerLimits {
    pub reorder_capacity: usize,
    pub gap_timeout: Duration,
    pub max_consecutive_decode_failures: u32,
}

impl Default for AssemblerLimits {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for AssemblerLimits {
    fn from(config: &StreamConfig) -> Self {
        Self {
            reorder_capacity: config.reorder_capacity,
            gap_timeout: config.gap_timeout(),
            max_consecutive_decode_failures: config.max_consecutive_decode_failures,
        }
    }
}

/// What happened to one in-order frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FoldOutcome {
    /// Frame changed the turn; `snapshot` is the turn right after it.
    Applied { sequence: u64, snapshot: Turn },
    /// Frame consumed its slot without a visible change (empty text delta).
    Skipped { sequence: u64 },
    /// Frame consumed its slot but broke a folding rule and was dropped.
    Rejected { sequence: u64, error: RejectedFrame },
}

/// Result of [`TurnAssembler::apply`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyReport {
    /// In-order frames folded by this call, in sequence order. Includes
    /// frames released from the reorder buffer.
    pub outcomes: Vec<FoldOutcome>,
    /// Set when the frame was parked in the reorder buffer instead.
    pub buffered: Option<u64>,
}

impl ApplyReport {
    /// Snapshots produced by this call, in sequence order.
    pub fn snapshots(&self) -> impl Iterator<Item = (u64, &Turn)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            FoldOutcome::Applied { sequence, snapshot } => Some((*sequence, snapshot)),
            _ => None,
        })
    }

    /// Folding-rule rejections produced by this call.
    pub fn rejections(&self) -> impl Iterator<Item = &RejectedFrame> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            FoldOutcome::Rejected { error, .. } => Some(error),
            _ => None,
        })
    }
}

/// Sole owner and mutator of one [`Turn`].
pub struct TurnAssembler {
    turn: Turn,
    limits: AssemblerLimits,
    reorder: BTreeMap<u64, EventFrame>,
    gap_since: Option<Instant>,
    decode_failures: u32,
    clock: Arc<dyn Clock>,
}

impl TurnAssembler {
    pub fn new(turn: Turn, limits: AssemblerLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            turn,
            limits,
            reorder: BTreeMap::new(),
            gap_since: None,
            decode_failures: 0,
            clock,
        }
    }

    pub fn turn(&self) -> &Turn {
        &self.turn
    }

    pub fn into_turn(self) -> Turn {
        self.turn
    }

    /// Frames currently waiting for a gap to close.
    pub fn buffered_len(&self) -> usize {
        self.reorder.len()
    }

    /// Moves the turn from `pending` to `streaming`.
    ///
    /// Returns the new snapshot, or `None` if the turn was not pending.
    pub fn begin(&mut self) -> Option<Turn> {
        let transition = self.turn.status.on(TurnInput::Submit);
        if !transition.is_applied() {
            return None;
        }
        self.turn.status = transition.status();
        self.touch();
        Some(self.turn.clone())
    }

    /// Applies one decoded frame.
    ///
    /// `Err` means the frame was dropped without touching the turn. `Ok`
    /// reports every frame folded as a consequence, which can be more than one
    /// when the frame closes a gap.
    pub fn apply(&mut self, frame: EventFrame, now: Instant) -> Result<ApplyReport, RejectedFrame> {
        if frame.turn_id != self.turn.turn_id {
            return Err(RejectedFrame::ForeignTurn {
                expected: self.turn.turn_id.clone(),
                actual: frame.turn_id,
            });
        }
        self.decode_failures = 0;

        let sequence = frame.sequence;
        match self.turn.status {
            TurnStatus::Streaming => {}
            TurnStatus::Pending => return Err(RejectedFrame::NotStreaming { sequence }),
            status => return Err(RejectedFrame::AfterTerminal { sequence, status }),
        }

        let expected = self.turn.next_sequence();
        if sequence < expected || self.reorder.contains_key(&sequence) {
            return Err(RejectedFrame::Duplicate { sequence });
        }
        if sequence > expected {
            if self.reorder.len() >= self.limits.reorder_capacity {
                return Err(RejectedFrame::ReorderBufferFull {
                    sequence,
                    capacity: self.limits.reorder_capacity,
                });
            }
            debug!(turn_id = %self.turn.turn_id, sequence, expected, "buffering out-of-order frame");
            self.reorder.insert(sequence, frame);
            self.gap_since.get_or_insert(now);
            return Ok(ApplyReport {
                outcomes: Vec::new(),
                buffered: Some(sequence),
            });
        }

        let mut report = ApplyReport::default();
        report.outcomes.push(self.fold(frame));
        while !self.turn.status.is_terminal() {
            let Some(next) = self.reorder.remove(&self.turn.next_sequence()) else {
                break;
            };
            report.outcomes.push(self.fold(next));
        }

        if self.turn.status.is_terminal() {
            self.drop_buffered();
        } else if self.reorder.is_empty() {
            self.gap_since = None;
        } else if self.gap_since.is_some() {
            self.gap_since = Some(now);
        }
        Ok(report)
    }

    fn fold(&mut self, frame: EventFrame) -> FoldOutcome {
        let sequence = frame.sequence;
        let transition = self.turn.status.on(TurnInput::from_body(&frame.body));
        self.turn.last_sequence = Some(sequence);

        let result = match frame.body {
            FrameBody::TextDelta(text) => {
                if text.is_empty() {
                    return FoldOutcome::Skipped { sequence };
                }
                self.turn.text.push_str(&text);
                Ok(())
            }
            FrameBody::ToolCallStart { call_id, name } => {
                if self.turn.tool_call(&call_id).is_some() {
                    Err(RejectedFrame::DuplicateToolCall { call_id })
                } else {
                    self.turn.tool_calls.push(ToolCallRecord {
                        call_id,
                        name,
                        status: ToolCallStatus::Pending,
                        result: None,
                    });
                    Ok(())
                }
            }
            FrameBody::ToolCallUpdate {
                call_id,
                status,
                result,
            }
            | FrameBody::ToolCallEnd {
                call_id,
                status,
                result,
            } => self.advance_tool_call(call_id, status, result),
            FrameBody::TurnEnd => {
                self.turn.status = transition.status();
                Ok(())
            }
            FrameBody::TurnError { message, code } => {
                let reason = if code.as_deref() == Some(UNKNOWN_FRAME_CODE) {
                    FailureReason::UnknownFrame
                } else {
                    FailureReason::ServerError
                };
                self.turn.status = transition.status();
                self.turn.failure = Some(TurnFailure::new(reason, message));
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                self.touch();
                debug!(turn_id = %self.turn.turn_id, sequence, status = %self.turn.status, "applied frame");
                FoldOutcome::Applied {
                    sequence,
                    snapshot: self.turn.clone(),
                }
            }
            Err(error) => {
                warn!(turn_id = %self.turn.turn_id, sequence, %error, "rejected frame");
                FoldOutcome::Rejected { sequence, error }
            }
        }
    }

    fn advance_tool_call(
        &mut self,
        call_id: String,
        status: ToolCallStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), RejectedFrame> {
        let Some(record) = self.turn.tool_call_mut(&call_id) else {
            return Err(RejectedFrame::UnknownToolCall { call_id });
        };
        if !record.status.can_advance_to(status) {
            return Err(RejectedFrame::BackwardToolStatus {
                call_id,
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        if status == ToolCallStatus::Completed {
            record.result = result;
        }
        Ok(())
    }

    /// Counts a frame that failed to decode.
    ///
    /// Returns the errored snapshot once the consecutive-failure limit is hit.
    pub fn record_decode_failure(&mut self, error: &DecodeError) -> Option<Turn> {
        if self.turn.status.is_terminal() {
            return None;
        }
        self.decode_failures += 1;
        warn!(
            turn_id = %self.turn.turn_id,
            consecutive = self.decode_failures,
            %error,
            "dropped undecodable frame"
        );
        if self.decode_failures < self.limits.max_consecutive_decode_failures {
            return None;
        }
        self.fail(TurnFailure::new(
            FailureReason::DecodeFailures,
            format!(
                "{} consecutive frames failed to decode, last: {error}",
                self.decode_failures
            ),
        ))
    }

    /// Instant at which the open sequence gap times out. `None` while no gap
    /// is open, or when the window reaches past what the timer can represent.
    pub fn gap_deadline(&self) -> Option<Instant> {
        self.gap_since
            .and_then(|since| since.checked_add(self.limits.gap_timeout))
    }

    /// Errors the turn if its gap deadline has passed at `now`.
    pub fn expire_gap(&mut self, now: Instant) -> Option<Turn> {
        let deadline = self.gap_deadline()?;
        if now < deadline {
            return None;
        }
        let expected = self.turn.next_sequence();
        self.fail(TurnFailure::new(
            FailureReason::SequenceGapTimeout,
            format!(
                "sequence {expected} not received within {:?} ({} frames buffered)",
                self.limits.gap_timeout,
                self.reorder.len()
            ),
        ))
    }

    /// Cancels the turn. Returns the final turn if it was still live.
    pub fn cancel(&mut self) -> Option<Turn> {
        self.finish_with(TurnInput::Cancel, None)
    }

    /// Errors the turn with `failure`. Returns the final turn if it was still live.
    pub fn fail(&mut self, failure: TurnFailure) -> Option<Turn> {
        self.finish_with(TurnInput::Error, Some(failure))
    }

    fn finish_with(&mut self, input: TurnInput, failure: Option<TurnFailure>) -> Option<Turn> {
        let transition = self.turn.status.on(input);
        if !transition.is_applied() {
            return None;
        }
        self.turn.status = transition.status();
        self.turn.failure = failure;
        self.drop_buffered();
        self.touch();
        Some(self.turn.clone())
    }

    /// Prepares for a new transport subscription after a disconnect.
    ///
    /// `Resumed` keeps all state and continues at `next_sequence`;
    /// `Restarted` discards partial output and expects sequence 0 again.
    pub fn recover(&mut self, mode: RecoveryMode) {
        if mode == RecoveryMode::Restarted {
            self.turn.reset_content();
            self.drop_buffered();
        }
        self.turn.recovery = Some(mode);
        self.turn.attempts += 1;
        self.touch();
    }

    fn drop_buffered(&mut self) {
        if !self.reorder.is_empty() {
            debug!(turn_id = %self.turn.turn_id, dropped = self.reorder.len(), "discarding buffered frames");
        }
        self.reorder.clear();
        self.gap_since = None;
    }

    fn touch(&mut self) {
        self.turn.updated_at = self.clock.now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::frame::TurnId;
    use chrono::TimeZone as _;

    fn assembler() -> TurnAssembler {
        let clock = FixedClock(chrono::Utc.with_ymd_and_hms(2026, 1, 5, 9, 15, 0).unwrap());
        let turn = Turn::new(TurnId::new("t1"), uuid::Uuid::nil(), "Analyze TCS", clock.0);
        let mut assembler = TurnAssembler::new(turn, AssemblerLimits::default(), Arc::new(clock));
        assembler.begin().expect("begin");
        assembler
    }

    fn scenario_frames() -> Vec<EventFrame> {
        vec![
            EventFrame::tool_call_start("t1", 0, "c1", "fetch_price"),
            EventFrame::tool_call_update("t1", 1, "c1", ToolCallStatus::Running),
            EventFrame::tool_call_end(
                "t1",
                2,
                "c1",
                ToolCallStatus::Completed,
                Some(serde_json::json!({"price": 3542.80})),
            ),
            EventFrame::text_delta("t1", 3, "TCS is trading at 3542.80"),
            EventFrame::turn_end("t1", 4),
        ]
    }

    fn apply_all(assembler: &mut TurnAssembler, frames: Vec<EventFrame>) {
        let now = Instant::now();
        for frame in frames {
            assembler.apply(frame, now).expect("apply");
        }
    }

    #[test]
    fn unrepresentable_gap_window_never_expires() {
        let clock = FixedClock(chrono::Utc.with_ymd_and_hms(2026, 1, 5, 9, 15, 0).unwrap());
        let turn = Turn::new(TurnId::new("t1"), uuid::Uuid::nil(), "Analyze TCS", clock.0);
        let limits = AssemblerLimits {
            gap_timeout: Duration::MAX,
            ..AssemblerLimits::default()
        };
        let mut a = TurnAssembler::new(turn, limits, Arc::new(clock));
        a.begin().expect("begin");
        let now = Instant::now();
        a.apply(EventFrame::text_delta("t1", 2, "late"), now).expect("buffer");
        assert_eq!(a.buffered_len(), 1);
        assert_eq!(a.gap_deadline(), None);
        assert!(a.expire_gap(now).is_none());
    }

    #[test]
    fn in_order_scenario_completes_with_tool_result() {
        let mut a = assembler();
        apply_all(&mut a, scenario_frames());
        let turn = a.turn();
        assert_eq!(turn.status(), TurnStatus::Completed);
        assert_eq!(turn.text(), "TCS is trading at 3542.80");
        let call = turn.tool_call("c1").expect("c1");
        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.result, Some(serde_json::json!({"price": 3542.80})));
        assert_eq!(turn.last_sequence(), Some(4));
    }

    #[test]
    fn text_equals_concatenated_deltas() {
        let mut a = assembler();
        let words = ["TCS ", "is ", "", "trading ", "higher"];
        let frames = words
            .iter()
            .enumerate()
            .map(|(i, w)| EventFrame::text_delta("t1", i as u64, *w))
            .collect();
        apply_all(&mut a, frames);
        assert_eq!(a.turn().text(), words.concat());
        assert_eq!(a.turn().last_sequence(), Some(4));
    }

    #[test]
    fn duplicate_sequence_is_a_no_op() {
        let mut a = assembler();
        let now = Instant::now();
        a.apply(EventFrame::text_delta("t1", 0, "hello"), now).expect("first");
        let before = a.turn().clone();
        let err = a
            .apply(EventFrame::text_delta("t1", 0, "hello"), now)
            .expect_err("duplicate");
        assert_eq!(err, RejectedFrame::Duplicate { sequence: 0 });
        assert_eq!(a.turn(), &before);
    }

    #[test]
    fn reordered_frames_assemble_like_in_order_frames() {
        let mut in_order = assembler();
        apply_all(&mut in_order, scenario_frames());

        let mut shuffled = assembler();
        let mut frames = scenario_frames();
        frames.swap(0, 3);
        frames.swap(1, 2);
        let now = Instant::now();
        let mut snapshot_sequences = Vec::new();
        for frame in frames {
            let report = shuffled.apply(frame, now).expect("apply");
            snapshot_sequences.extend(report.snapshots().map(|(seq, _)| seq));
        }
        assert_eq!(snapshot_sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(shuffled.turn(), in_order.turn());
        assert_eq!(shuffled.buffered_len(), 0);
    }

    #[test]
    fn tool_status_never_moves_backwards() {
        let mut a = assembler();
        let now = Instant::now();
        a.apply(EventFrame::tool_call_start("t1", 0, "c1", "fetch_price"), now)
            .expect("start");
        a.apply(EventFrame::tool_call_update("t1", 1, "c1", ToolCallStatus::Running), now)
            .expect("running");
        let report = a
            .apply(EventFrame::tool_call_update("t1", 2, "c1", ToolCallStatus::Pending), now)
            .expect("slot consumed");
        assert!(matches!(
            report.rejections().next(),
            Some(RejectedFrame::BackwardToolStatus { .. })
        ));
        assert_eq!(a.turn().tool_call("c1").map(|c| c.status), Some(ToolCallStatus::Running));
        assert_eq!(a.turn().last_sequence(), Some(2));
    }

    #[test]
    fn duplicate_start_and_unknown_call_are_rejected_without_stalling() {
        let mut a = assembler();
        let now = Instant::now();
        a.apply(EventFrame::tool_call_start("t1", 0, "c1", "fetch_price"), now)
            .expect("start");
        let dup = a
            .apply(EventFrame::tool_call_start("t1", 1, "c1", "fetch_news"), now)
            .expect("slot consumed");
        assert!(matches!(
            dup.rejections().next(),
            Some(RejectedFrame::DuplicateToolCall { .. })
        ));
        let unknown = a
            .apply(EventFrame::tool_call_update("t1", 2, "c9", ToolCallStatus::Running), now)
            .expect("slot consumed");
        assert!(matches!(
            unknown.rejections().next(),
            Some(RejectedFrame::UnknownToolCall { .. })
        ));
        a.apply(EventFrame::text_delta("t1", 3, "ok"), now).expect("continues");
        assert_eq!(a.turn().tool_calls().len(), 1);
        assert_eq!(a.turn().tool_calls()[0].name, "fetch_price");
        assert_eq!(a.turn().text(), "ok");
    }

    #[test]
    fn first_terminal_frame_for_a_slot_wins() {
        let mut a = assembler();
        let now = Instant::now();
        a.apply(EventFrame::turn_end("t1", 1), now).expect("buffered");
        let err = a
            .apply(EventFrame::turn_error("t1", 1, "late failure"), now)
            .expect_err("second frame for slot 1");
        assert_eq!(err, RejectedFrame::Duplicate { sequence: 1 });
        a.apply(EventFrame::text_delta("t1", 0, "done"), now).expect("closes gap");
        assert_eq!(a.turn().status(), TurnStatus::Completed);
        assert!(a.turn().failure().is_none());
    }

    #[test]
    fn frames_after_terminal_state_are_ignored() {
        let mut a = assembler();
        let now = Instant::now();
        a.apply(EventFrame::text_delta("t1", 0, "partial"), now).expect("delta");
        assert!(a.cancel().is_some());
        let err = a
            .apply(EventFrame::turn_end("t1", 1), now)
            .expect_err("after cancel");
        assert!(matches!(
            err,
            RejectedFrame::AfterTerminal {
                status: TurnStatus::Cancelled,
                ..
            }
        ));
        assert!(a.cancel().is_none());
        assert_eq!(a.turn().status(), TurnStatus::Cancelled);
    }

    #[test]
    fn reorder_buffer_is_bounded() {
        let mut a = assembler();
        let now = Instant::now();
        for seq in 1..=16 {
            a.apply(EventFrame::text_delta("t1", seq, "x"), now).expect("buffered");
        }
        let err = a
            .apply(EventFrame::text_delta("t1", 17, "x"), now)
            .expect_err("full");
        assert!(matches!(err, RejectedFrame::ReorderBufferFull { capacity: 16, .. }));
        let report = a.apply(EventFrame::text_delta("t1", 0, "x"), now).expect("drain");
        assert_eq!(report.snapshots().count(), 17);
        assert_eq!(a.turn().text().len(), 17);
    }

    #[test]
    fn open_gap_times_out() {
        let mut a = assembler();
        let start = Instant::now();
        a.apply(EventFrame::text_delta("t1", 2, "later"), start).expect("buffered");
        let deadline = a.gap_deadline().expect("deadline");
        assert_eq!(deadline, start + Duration::from_secs(5));
        assert!(a.expire_gap(start + Duration::from_secs(4)).is_none());
        let turn = a.expire_gap(deadline).expect("errored");
        assert_eq!(turn.status(), TurnStatus::Errored);
        assert_eq!(
            turn.failure().map(|f| f.reason),
            Some(FailureReason::SequenceGapTimeout)
        );
        assert_eq!(a.buffered_len(), 0);
        assert!(a.gap_deadline().is_none());
    }

    #[test]
    fn three_consecutive_decode_failures_error_the_turn() {
        let mut a = assembler();
        let err = DecodeError::InvalidJson("eof".into());
        assert!(a.record_decode_failure(&err).is_none());
        assert!(a.record_decode_failure(&err).is_none());
        a.apply(EventFrame::text_delta("t1", 0, "ok"), Instant::now())
            .expect("good frame resets the count");
        assert!(a.record_decode_failure(&err).is_none());
        assert!(a.record_decode_failure(&err).is_none());
        let turn = a.record_decode_failure(&err).expect("third failure is fatal");
        assert_eq!(turn.failure().map(|f| f.reason), Some(FailureReason::DecodeFailures));
    }

    #[test]
    fn unknown_frame_code_maps_to_unknown_frame_reason() {
        let mut a = assembler();
        let frame = crate::codec::decode(r#"{"turn_id":"t1","sequence":0,"kind":"chart"}"#)
            .expect("decode");
        a.apply(frame, Instant::now()).expect("apply");
        assert_eq!(a.turn().status(), TurnStatus::Errored);
        assert_eq!(a.turn().failure().map(|f| f.reason), Some(FailureReason::UnknownFrame));
    }

    #[test]
    fn restart_discards_partial_output() {
        let mut a = assembler();
        apply_all(&mut a, scenario_frames().into_iter().take(3).collect());
        a.recover(RecoveryMode::Restarted);
        assert_eq!(a.turn().next_sequence(), 0);
        assert!(a.turn().tool_calls().is_empty());
        assert_eq!(a.turn().recovery(), Some(RecoveryMode::Restarted));
        assert_eq!(a.turn().attempts(), 2);
        apply_all(&mut a, scenario_frames());
        assert_eq!(a.turn().status(), TurnStatus::Completed);
    }

    #[test]
    fn foreign_and_pre_submit_frames_are_rejected() {
        let clock = FixedClock(chrono::Utc::now());
        let turn = Turn::new(TurnId::new("t1"), uuid::Uuid::nil(), "q", clock.0);
        let mut a = TurnAssembler::new(turn, AssemblerLimits::default(), Arc::new(clock));
        let now = Instant::now();
        assert!(matches!(
            a.apply(EventFrame::text_delta("t1", 0, "x"), now),
            Err(RejectedFrame::NotStreaming { .. })
        ));
        a.begin();
        assert!(matches!(
            a.apply(EventFrame::text_delta("t2", 0, "x"), now),
            Err(RejectedFrame::ForeignTurn { .. })
        ));
    }
}
