//! Wire codec for [`EventFrame`].
//!
//! A frame is one JSON object:
//!
//! ```json
//! {"turn_id":"t1","sequence":3,"kind":"text_delta","payload":"TCS is trading at 3542.80"}
//! ```
//!
//! Decoding never panics. Unknown kinds become a `turn_error` frame with code
//! `unknown_frame`; a payload that does not fit its kind is a
//! [`DecodeError::MalformedPayload`].
use serde_json::{Map, Value, json};

use crate::errors::DecodeError;
use crate::frame::{EventFrame, FrameBody, FrameKind, ToolCallStatus, TurnId};

/// `turn_error` code used for frame kinds this client does not know.
pub const UNKNOWN_FRAME_CODE: &str = "unknown_frame";

/// Decodes one JSON-encoded frame.
pub fn decode(raw: &str) -> Result<EventFrame, DecodeError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    decode_value(&value)
}

/// Decodes a frame that was already parsed as JSON.
pub fn decode_value(value: &Value) -> Result<EventFrame, DecodeError> {
    let Some(obj) = value.as_object() else {
        return Err(DecodeError::InvalidJson("frame must be a JSON object".into()));
    };

    let turn_id = match obj.get("turn_id") {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("turn_id")),
        Some(Value::String(id)) if !id.trim().is_empty() => TurnId::new(id.clone()),
        Some(_) => {
            return Err(DecodeError::invalid_field(
                "turn_id",
                "expected a non-empty string",
            ));
        }
    };
    let sequence = match obj.get("sequence") {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("sequence")),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| DecodeError::invalid_field("sequence", "expected an unsigned integer"))?,
    };
    let kind_raw = match obj.get("kind") {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("kind")),
        Some(Value::String(kind)) => kind.as_str(),
        Some(_) => return Err(DecodeError::invalid_field("kind", "expected a string")),
    };
    let payload = obj.get("payload").unwrap_or(&Value::Null);

    let body = match FrameKind::parse(kind_raw) {
        Some(kind) => decode_body(kind, payload)?,
        None => FrameBody::TurnError {
            message: format!("unknown frame kind `{kind_raw}`"),
            code: Some(UNKNOWN_FRAME_CODE.to_string()),
        },
    };

    Ok(EventFrame {
        turn_id,
        sequence,
        body,
    })
}

fn decode_body(kind: FrameKind, payload: &Value) -> Result<FrameBody, DecodeError> {
    match kind {
        FrameKind::TextDelta => match payload {
            Value::String(text) => Ok(FrameBody::TextDelta(text.clone())),
            _ => Err(DecodeError::malformed(kind, "expected a string payload")),
        },
        FrameKind::ToolCallStart => {
            let obj = payload_object(kind, payload)?;
            Ok(FrameBody::ToolCallStart {
                call_id: required_str(kind, obj, "call_id")?,
                name: required_str(kind, obj, "name")?,
            })
        }
        FrameKind::ToolCallUpdate => {
            let obj = payload_object(kind, payload)?;
            Ok(FrameBody::ToolCallUpdate {
                call_id: required_str(kind, obj, "call_id")?,
                status: required_status(kind, obj)?,
                result: optional_result(obj),
            })
        }
        FrameKind::ToolCallEnd => {
            let obj = payload_object(kind, payload)?;
            let status = required_status(kind, obj)?;
            if !status.is_terminal() {
                return Err(DecodeError::malformed(
                    kind,
                    format!("status must be completed or error, got {status}"),
                ));
            }
            Ok(FrameBody::ToolCallEnd {
                call_id: required_str(kind, obj, "call_id")?,
                status,
                result: optional_result(obj),
            })
        }
        FrameKind::TurnEnd => Ok(FrameBody::TurnEnd),
        FrameKind::TurnError => {
            let obj = payload_object(kind, payload)?;
            let code = obj
                .get("code")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            Ok(FrameBody::TurnError {
                message: required_str(kind, obj, "message")?,
                code,
            })
        }
    }
}

fn payload_object(kind: FrameKind, payload: &Value) -> Result<&Map<String, Value>, DecodeError> {
    payload
        .as_object()
        .ok_or_else(|| DecodeError::malformed(kind, "expected an object payload"))
}

fn required_str(
    kind: FrameKind,
    obj: &Map<String, Value>,
    field: &str,
) -> Result<String, DecodeError> {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| DecodeError::malformed(kind, format!("`{field}` must be a non-empty string")))
}

fn required_status(kind: FrameKind, obj: &Map<String, Value>) -> Result<ToolCallStatus, DecodeError> {
    let raw = obj
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::malformed(kind, "`status` must be a string"))?;
    ToolCallStatus::parse(raw)
        .ok_or_else(|| DecodeError::malformed(kind, format!("unknown tool status `{raw}`")))
}

fn optional_result(obj: &Map<String, Value>) -> Option<Value> {
    obj.get("result").filter(|v| !v.is_null()).cloned()
}

/// Encodes a frame as a JSON value.
pub fn encode_value(frame: &EventFrame) -> Value {
    let payload = match &frame.body {
        FrameBody::TextDelta(text) => Value::String(text.clone()),
        FrameBody::ToolCallStart { call_id, name } => json!({
            "call_id": call_id,
            "name": name,
        }),
        FrameBody::ToolCallUpdate {
            call_id,
            status,
            result,
        }
        | FrameBody::ToolCallEnd {
            call_id,
            status,
            result,
        } => {
            let mut obj = json!({
                "call_id": call_id,
                "status": status.as_str(),
            });
            if let Some(result) = result {
                obj["result"] = result.clone();
            }
            obj
        }
        FrameBody::TurnEnd => Value::Null,
        FrameBody::TurnError { message, code } => {
            let mut obj = json!({ "message": message });
            if let Some(code) = code {
                obj["code"] = Value::String(code.clone());
            }
            obj
        }
    };
    json!({
        "turn_id": frame.turn_id.as_str(),
        "sequence": frame.sequence,
        "kind": frame.kind().as_str(),
        "payload": payload,
    })
}

/// Encodes a frame as a single-line JSON string.
pub fn encode(frame: &EventFrame) -> String {
    encode_value(frame).to_string()
}

/// Encodes a frame as one server-sent-events record.
pub fn encode_sse(frame: &EventFrame) -> String {
    format!("event: {}\ndata: {}\n\n", frame.kind(), encode(frame))
}

/// One record of a server-sent-events byte stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    /// Last `id:` field of the record.
    pub id: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental line-oriented SSE reader.
///
/// Chunks may end anywhere, including mid-line or between `\r` and `\n`.
/// Lines end in `\n` or `\r\n`; a blank line dispatches the record.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    pending: SseFrame,
    data: Vec<String>,
    started: bool,
}

impl SseDecoder {
    /// Feeds a chunk and returns every record it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut records = Vec::new();
        let mut rest = chunk;
        while let Some(end) = rest.iter().position(|b| *b == b'\n') {
            self.line.extend_from_slice(&rest[..end]);
            rest = &rest[end + 1..];
            let line = std::mem::take(&mut self.line);
            if let Some(record) = self.read_line(&line) {
                records.push(record);
            }
        }
        self.line.extend_from_slice(rest);
        records
    }

    /// Whether a partial record is still buffered.
    pub fn has_partial(&self) -> bool {
        self.started || self.line.iter().any(|b| !b.is_ascii_whitespace())
    }

    fn read_line(&mut self, raw: &[u8]) -> Option<SseFrame> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            return self.dispatch();
        }
        if raw[0] == b':' {
            return None;
        }
        let line = String::from_utf8_lossy(raw);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };
        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "id" => self.pending.id = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // `retry` and unknown fields
            _ => return None,
        }
        self.started = true;
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if !std::mem::take(&mut self.started) {
            return None;
        }
        let mut record = std::mem::take(&mut self.pending);
        record.data = std::mem::take(&mut self.data).join("\n");
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tool_call_end_with_result() {
        let frame = decode(
            r#"{"turn_id":"t1","sequence":2,"kind":"tool_call_end",
                "payload":{"call_id":"c1","status":"completed","result":{"price":3542.80}}}"#,
        )
        .expect("decode");
        assert_eq!(frame.sequence, 2);
        assert_eq!(
            frame.body,
            FrameBody::ToolCallEnd {
                call_id: "c1".into(),
                status: ToolCallStatus::Completed,
                result: Some(json!({"price": 3542.80})),
            }
        );
    }

    #[test]
    fn unknown_kind_becomes_unknown_frame_error() {
        let frame = decode(r#"{"turn_id":"t1","sequence":4,"kind":"chart","payload":{}}"#)
            .expect("unknown kinds still decode");
        match frame.body {
            FrameBody::TurnError { code, message } => {
                assert_eq!(code.as_deref(), Some(UNKNOWN_FRAME_CODE));
                assert!(message.contains("chart"));
            }
            other => panic!("expected turn_error, got {other:?}"),
        }
    }

    #[test]
    fn non_string_text_delta_is_malformed() {
        let err = decode(r#"{"turn_id":"t1","sequence":0,"kind":"text_delta","payload":42}"#)
            .expect_err("should fail");
        assert!(matches!(
            err,
            DecodeError::MalformedPayload {
                kind: FrameKind::TextDelta,
                ..
            }
        ));
    }

    #[test]
    fn tool_call_end_requires_terminal_status() {
        let err = decode(
            r#"{"turn_id":"t1","sequence":0,"kind":"tool_call_end","payload":{"call_id":"c1","status":"running"}}"#,
        )
        .expect_err("running is not an end status");
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn envelope_errors_name_the_field() {
        assert_eq!(
            decode(r#"{"sequence":0,"kind":"turn_end"}"#),
            Err(DecodeError::MissingField("turn_id"))
        );
        assert!(matches!(
            decode(r#"{"turn_id":"t1","sequence":-1,"kind":"turn_end"}"#),
            Err(DecodeError::InvalidField {
                field: "sequence",
                ..
            })
        ));
        assert!(matches!(decode("not json"), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn encoded_frames_decode_to_the_same_frame() {
        let frames = [
            EventFrame::tool_call_start("t1", 0, "c1", "fetch_price"),
            EventFrame::tool_call_end("t1", 2, "c1", ToolCallStatus::Error, None),
            EventFrame::turn_end("t1", 5),
        ];
        for frame in frames {
            assert_eq!(decode(&encode(&frame)).expect("decode"), frame);
        }
    }

    #[test]
    fn sse_decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let part1 = b"event: text_delta\ndata: {\"turn_id\":\"t1\",\"sequence\":0,";
        let part2 = b"\"kind\":\"text_delta\",\"payload\":\"hi\"}\r\n\r\n: keepalive\n\n";
        assert!(decoder.push_chunk(part1).is_empty());
        assert!(decoder.has_partial());
        let frames = decoder.push_chunk(part2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("text_delta"));
        let frame = decode(&frames[0].data).expect("decode data");
        assert_eq!(frame.body, FrameBody::TextDelta("hi".into()));
        assert!(!decoder.has_partial());
    }

    #[test]
    fn encode_sse_produces_one_record() {
        let mut decoder = SseDecoder::default();
        let frame = EventFrame::text_delta("t1", 0, "a\nb");
        let records = decoder.push_chunk(encode_sse(&frame).as_bytes());
        assert_eq!(records.len(), 1);
        assert_eq!(decode(&records[0].data).expect("decode"), frame);
    }

    #[test]
    fn sse_decoder_reads_ids_multiline_data_and_split_crlf() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"id: 7\r").is_empty());
        assert!(decoder.push_chunk(b"\ndata: first\r\ndata:second\r\nretry: 100\r").is_empty());
        let records = decoder.push_chunk(b"\n\r\n");
        assert_eq!(
            records,
            vec![SseFrame {
                event: None,
                id: Some("7".into()),
                data: "first\nsecond".into(),
            }]
        );
        assert!(!decoder.has_partial());
        assert!(decoder.push_chunk(b"retry: 5\n\n").is_empty());
    }
}
