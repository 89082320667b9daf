//! # Wire Decoder
//!
//! The telemetry socket carries two encodings on one stream:
//!
//! - **Binary frames**: UTF-8 text, `|`-separated, positional. Field 1 is the
//!   message kind; the rest of the layout depends on that kind.
//! - **Text frames**: a JSON object `{ "response": <kind>, "data": <payload> }`.
//!
//! `decode` is stateless. A frame that cannot honour its kind's positional
//! contract is rejected here so the mapper never indexes past the end.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::telemetry::mapper::positions;

/// Minimum number of fields of any delimited frame (source + discriminator).
const MIN_FIELDS: usize = 2;

/// One inbound transport payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("delimited frame has {found} fields, {kind} needs at least {needed}")]
    TooFewFields { kind: String, found: usize, needed: usize },

    #[error("malformed structured event: {0}")]
    MalformedEvent(String),
}

/// Discriminator of a delimited field-update frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Notification,
    PartCount,
    Message,
    Alarm,
    Other(String),
}

impl FieldKind {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "NOTI" => FieldKind::Notification,
            "PART_COUNT" => FieldKind::PartCount,
            "MESSAGE" => FieldKind::Message,
            "ALARM" => FieldKind::Alarm,
            other => FieldKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldKind::Notification => "NOTI",
            FieldKind::PartCount => "PART_COUNT",
            FieldKind::Message => "MESSAGE",
            FieldKind::Alarm => "ALARM",
            FieldKind::Other(raw) => raw,
        }
    }

    /// Fields required by this kind's positional contract.
    pub fn min_fields(&self) -> usize {
        match self {
            FieldKind::Notification => positions::notification::MACHINE + 1,
            FieldKind::PartCount => positions::part_count::MACHINE + 1,
            FieldKind::Message | FieldKind::Alarm => positions::message::MACHINE + 1,
            FieldKind::Other(_) => MIN_FIELDS,
        }
    }
}

/// Discriminator of a structured event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    MachineStatus,
    Broadcast,
    Connect,
    Closed,
    Other(String),
}

impl ResponseKind {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "machine" | "machine-status" => ResponseKind::MachineStatus,
            "broadcast" => ResponseKind::Broadcast,
            "connect" => ResponseKind::Connect,
            "closed" => ResponseKind::Closed,
            other => ResponseKind::Other(other.to_string()),
        }
    }
}

/// A delimited frame, split and validated against its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFrame {
    pub kind: FieldKind,
    pub fields: Vec<String>,
}

impl FieldFrame {
    /// Field at `position`; empty when the position is past the end.
    pub fn field(&self, position: usize) -> &str {
        self.fields.get(position).map(String::as_str).unwrap_or("")
    }
}

/// A structured event with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub kind: ResponseKind,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Fields(FieldFrame),
    Event(EventFrame),
}

#[derive(Deserialize)]
struct RawEvent {
    response: String,
    #[serde(default)]
    data: Value,
}

/// Decodes one transport payload.
pub fn decode(frame: &Frame) -> Result<DecodedFrame, DecodeError> {
    match frame {
        Frame::Binary(bytes) => decode_fields(bytes).map(DecodedFrame::Fields),
        Frame::Text(text) => decode_event(text).map(DecodedFrame::Event),
    }
}

fn decode_fields(bytes: &[u8]) -> Result<FieldFrame, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    let fields: Vec<String> = text
        .trim_end_matches(['\r', '\n'])
        .split('|')
        .map(str::to_string)
        .collect();

    if fields.len() < MIN_FIELDS {
        return Err(DecodeError::TooFewFields {
            kind: String::new(),
            found: fields.len(),
            needed: MIN_FIELDS,
        });
    }

    let kind = FieldKind::from_wire(&fields[1]);
    let needed = kind.min_fields();
    if fields.len() < needed {
        return Err(DecodeError::TooFewFields {
            kind: kind.as_str().to_string(),
            found: fields.len(),
            needed,
        });
    }

    Ok(FieldFrame { kind, fields })
}

fn decode_event(text: &str) -> Result<EventFrame, DecodeError> {
    let raw: RawEvent = serde_json::from_str(text).map_err(|e| DecodeError::MalformedEvent(e.to_string()))?;
    Ok(EventFrame {
        kind: ResponseKind::from_wire(&raw.response),
        data: raw.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binary(text: &str) -> Frame {
        Frame::Binary(text.as_bytes().to_vec())
    }

    #[test]
    fn splits_delimited_frame_and_reads_kind() {
        let decoded = decode(&binary("edge-1|MESSAGE|20240501|x|y|z|42\n")).unwrap();
        match decoded {
            DecodedFrame::Fields(frame) => {
                assert_eq!(frame.kind, FieldKind::Message);
                assert_eq!(frame.field(6), "42");
                assert_eq!(frame.field(99), "");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_frames_shorter_than_their_contract() {
        let err = decode(&binary("edge-1|PART_COUNT|a|b|c|6|42")).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TooFewFields {
                kind: "PART_COUNT".to_string(),
                found: 7,
                needed: 14
            }
        );
        assert!(matches!(decode(&binary("lonely")), Err(DecodeError::TooFewFields { .. })));
    }

    #[test]
    fn unknown_field_kind_passes_through() {
        let decoded = decode(&binary("edge-1|HEARTBEAT")).unwrap();
        assert_eq!(
            decoded,
            DecodedFrame::Fields(FieldFrame {
                kind: FieldKind::Other("HEARTBEAT".to_string()),
                fields: vec!["edge-1".to_string(), "HEARTBEAT".to_string()],
            })
        );
    }

    #[test]
    fn invalid_utf8_is_a_decode_failure() {
        assert_eq!(decode(&Frame::Binary(vec![0xff, 0x7c, 0xfe])), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn parses_structured_events() {
        let decoded = decode(&Frame::Text(r#"{"response":"machine","data":[{"Id":1}]}"#.to_string())).unwrap();
        assert_eq!(
            decoded,
            DecodedFrame::Event(EventFrame {
                kind: ResponseKind::MachineStatus,
                data: json!([{ "Id": 1 }]),
            })
        );

        let closed = decode(&Frame::Text(r#"{"response":"closed"}"#.to_string())).unwrap();
        assert_eq!(
            closed,
            DecodedFrame::Event(EventFrame {
                kind: ResponseKind::Closed,
                data: Value::Null,
            })
        );
    }

    #[test]
    fn malformed_events_are_rejected() {
        assert!(matches!(
            decode(&Frame::Text("not json".to_string())),
            Err(DecodeError::MalformedEvent(_))
        ));
        assert!(matches!(
            decode(&Frame::Text(r#"{"data":[]}"#.to_string())),
            Err(DecodeError::MalformedEvent(_))
        ));
    }
}
