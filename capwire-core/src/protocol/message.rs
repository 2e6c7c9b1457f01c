// Top-level wire messages. Each frame is one JSON array whose first element
// names the message type; frames travel as NDJSON, one per line.
//
// IDs inside a message are always from the sender's perspective: a `pull`
// names the sender's import, a `resolve` names the sender's export, and the
// recipient looks the number up in the mirror table.

use serde_json::{Number, Value as JsonValue};
use tracing::{trace, warn};

use super::expression::{Expression, WireError};
use super::ids::{ExportId, ImportId};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `["push", expr]`: evaluate an expression; the result occupies the
    /// sender's next positive import ID.
    Push(Expression),
    /// `["pull", import_id]`: ask for the resolution of an import.
    Pull(ImportId),
    /// `["resolve", export_id, expr]`
    Resolve(ExportId, Expression),
    /// `["reject", export_id, expr]`
    Reject(ExportId, Expression),
    /// `["release", import_id, refcount]`
    Release(ImportId, u32),
    /// `["abort", expr]`: tear the session down with an error.
    Abort(Expression),
}

impl Message {
    /// Parse one frame (already decoded from JSON) into a message.
    pub fn from_json(value: &JsonValue) -> Result<Self, WireError> {
        let arr = value.as_array().ok_or(WireError::NotAnArray)?;
        let tag = match arr.first() {
            None => return Err(WireError::EmptyMessage),
            Some(JsonValue::String(tag)) => tag.as_str(),
            Some(other) => {
                warn!(head = ?other, "message head is not a string");
                return Err(WireError::UnknownMessageType(other.to_string()));
            }
        };
        trace!(tag, len = arr.len(), "parsing message");

        let arity = |expected: usize, form: &'static str| {
            if arr.len() == expected {
                Ok(())
            } else {
                Err(WireError::Arity { form })
            }
        };
        let int_at = |idx: usize, form: &'static str| {
            arr[idx].as_i64().ok_or(WireError::InvalidField {
                form,
                expected: "an integer ID",
            })
        };

        match tag {
            "push" => {
                arity(2, "push")?;
                Ok(Message::Push(Expression::from_json(&arr[1])?))
            }
            "pull" => {
                arity(2, "pull")?;
                Ok(Message::Pull(ImportId(int_at(1, "pull")?)))
            }
            "resolve" => {
                arity(3, "resolve")?;
                let id = ExportId(int_at(1, "resolve")?);
                Ok(Message::Resolve(id, Expression::from_json(&arr[2])?))
            }
            "reject" => {
                arity(3, "reject")?;
                let id = ExportId(int_at(1, "reject")?);
                Ok(Message::Reject(id, Expression::from_json(&arr[2])?))
            }
            "release" => {
                arity(3, "release")?;
                let id = ImportId(int_at(1, "release")?);
                let count = arr[2].as_u64().ok_or(WireError::InvalidField {
                    form: "release",
                    expected: "a non-negative refcount",
                })?;
                Ok(Message::Release(id, count.min(u32::MAX as u64) as u32))
            }
            "abort" => {
                arity(2, "abort")?;
                Ok(Message::Abort(Expression::from_json(&arr[1])?))
            }
            other => {
                warn!(tag = other, "unknown message type");
                Err(WireError::UnknownMessageType(other.to_string()))
            }
        }
    }

    /// Render the message as wire JSON.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Message::Push(expr) => {
                JsonValue::Array(vec![JsonValue::String("push".into()), expr.to_json()])
            }
            Message::Pull(id) => JsonValue::Array(vec![
                JsonValue::String("pull".into()),
                JsonValue::Number(Number::from(id.0)),
            ]),
            Message::Resolve(id, expr) => JsonValue::Array(vec![
                JsonValue::String("resolve".into()),
                JsonValue::Number(Number::from(id.0)),
                expr.to_json(),
            ]),
            Message::Reject(id, expr) => JsonValue::Array(vec![
                JsonValue::String("reject".into()),
                JsonValue::Number(Number::from(id.0)),
                expr.to_json(),
            ]),
            Message::Release(id, count) => JsonValue::Array(vec![
                JsonValue::String("release".into()),
                JsonValue::Number(Number::from(id.0)),
                JsonValue::Number(Number::from(*count)),
            ]),
            Message::Abort(expr) => {
                JsonValue::Array(vec![JsonValue::String("abort".into()), expr.to_json()])
            }
        }
    }
}

/// Parse a newline-delimited batch of frames.
pub fn parse_ndjson(input: &str) -> Result<Vec<Message>, WireError> {
    let mut messages = Vec::new();
    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let json: JsonValue =
            serde_json::from_str(line).map_err(|e| WireError::Json(e.to_string()))?;
        messages.push(Message::from_json(&json)?);
    }
    Ok(messages)
}

/// Serialize a batch of messages to newline-delimited JSON. The output has
/// no trailing newline; transports append one per frame as they write.
pub fn to_ndjson(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.to_json().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_push_pipeline() {
        let input = r#"["push",["pipeline",0,["add"],[[5,3]]]]"#;
        let json: JsonValue = serde_json::from_str(input).unwrap();
        match Message::from_json(&json).unwrap() {
            Message::Push(Expression::Pipeline(r)) => {
                assert_eq!(r.id, 0);
                assert!(r.args.is_some());
            }
            other => panic!("expected push/pipeline, got {:?}", other),
        }
    }

    #[test]
    fn parse_pull() {
        let json: JsonValue = serde_json::from_str(r#"["pull",1]"#).unwrap();
        assert_eq!(Message::from_json(&json).unwrap(), Message::Pull(ImportId(1)));
    }

    #[test]
    fn serialize_resolve() {
        let msg = Message::Resolve(ExportId(1), Expression::Number(Number::from(8)));
        assert_eq!(to_ndjson(&[msg]), r#"["resolve",1,8]"#);
    }

    #[test]
    fn release_carries_id_and_refcount() {
        let json: JsonValue = serde_json::from_str(r#"["release",3,2]"#).unwrap();
        assert_eq!(
            Message::from_json(&json).unwrap(),
            Message::Release(ImportId(3), 2)
        );
        assert_eq!(
            to_ndjson(&[Message::Release(ImportId(3), 2)]),
            r#"["release",3,2]"#
        );
    }

    #[test]
    fn ndjson_batch_round_trip() {
        let input = "[\"push\",[\"pipeline\",0,[\"add\"],[[5,3]]]]\n[\"pull\",1]";
        let messages = parse_ndjson(input).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(to_ndjson(&messages), input);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let err = Message::from_json(&json!(["gossip", 1])).unwrap_err();
        assert!(matches!(err, WireError::UnknownMessageType(t) if t == "gossip"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let messages = parse_ndjson("\n[\"pull\",2]\n\n").unwrap();
        assert_eq!(messages, vec![Message::Pull(ImportId(2))]);
    }
}
