// Recursive expression grammar for the Cap'n Web wire protocol.
//
// Expressions ride inside push/resolve/reject/abort messages. JSON scalars
// and objects are literal; arrays are structural. A literal array is escaped
// by wrapping it in a one-element array, so `["just","an","array"]` travels
// as `[["just","an","array"]]` and the tag position is never ambiguous.

use indexmap::IndexMap;
use serde_json::{Number, Value as JsonValue};

/// One step of a property path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(String),
    Number(usize),
}

impl PropertyKey {
    pub(crate) fn from_json(value: &JsonValue) -> Result<Self, WireError> {
        if let Some(s) = value.as_str() {
            Ok(PropertyKey::String(s.to_string()))
        } else if let Some(n) = value.as_u64() {
            Ok(PropertyKey::Number(n as usize))
        } else {
            Err(WireError::InvalidPropertyKey)
        }
    }

    pub(crate) fn to_json(&self) -> JsonValue {
        match self {
            PropertyKey::String(s) => JsonValue::String(s.clone()),
            PropertyKey::Number(n) => JsonValue::Number(Number::from(*n)),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        PropertyKey::String(s.to_string())
    }
}

impl From<usize> for PropertyKey {
    fn from(n: usize) -> Self {
        PropertyKey::Number(n)
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyKey::String(s) => write!(f, "{}", s),
            PropertyKey::Number(n) => write!(f, "{}", n),
        }
    }
}

/// `["error", type, message, stack?, data?]`
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorExpression {
    pub error_type: String,
    pub message: String,
    pub stack: Option<String>,
    pub data: Option<JsonValue>,
}

/// Shared shape of `["import", id, path?, args?]` and
/// `["pipeline", id, path?, args?]`. The ID is from the sender's
/// perspective; the recipient resolves it in its export table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceExpression {
    pub id: i64,
    pub path: Option<Vec<PropertyKey>>,
    pub args: Option<Box<Expression>>,
}

/// `["remap", id, path, captures, instructions]`
#[derive(Debug, Clone, PartialEq)]
pub struct RemapExpression {
    pub id: i64,
    pub path: Vec<PropertyKey>,
    pub captures: Vec<Expression>,
    pub instructions: Vec<Expression>,
}

/// Wire expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Literal array; serialized with the `[[...]]` escape.
    Array(Vec<Expression>),
    /// Literal object; fields are themselves expressions.
    Object(IndexMap<String, Expression>),
    /// `["date", millis]`
    Date(f64),
    Error(ErrorExpression),
    /// `["import", id, path?, args?]`: the sender passes back something it
    /// imported from us.
    Import(ReferenceExpression),
    /// `["pipeline", id, path?, args?]`: like `import`, but chained on a
    /// result that may not have resolved yet.
    Pipeline(ReferenceExpression),
    /// `["export", id]`: the sender announces a capability it hosts.
    Export(i64),
    /// `["promise", id]`: like `export`, resolved by a later resolve/reject.
    Promise(i64),
    Remap(RemapExpression),
}

/// Protocol-violation errors raised while reading frames off the wire.
/// Any of these aborts the session with `bad_request`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("message must be a JSON array")]
    NotAnArray,
    #[error("empty message array")]
    EmptyMessage,
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unknown expression tag: {0}")]
    UnknownTag(String),
    #[error("{form} expression has wrong arity")]
    Arity { form: &'static str },
    #[error("{form} field must be {expected}")]
    InvalidField {
        form: &'static str,
        expected: &'static str,
    },
    #[error("property keys must be strings or non-negative integers")]
    InvalidPropertyKey,
}

fn parse_path(value: &JsonValue, form: &'static str) -> Result<Vec<PropertyKey>, WireError> {
    value
        .as_array()
        .ok_or(WireError::InvalidField {
            form,
            expected: "a path array",
        })?
        .iter()
        .map(PropertyKey::from_json)
        .collect()
}

impl Expression {
    /// Parse a JSON value into an expression.
    pub fn from_json(value: &JsonValue) -> Result<Self, WireError> {
        match value {
            JsonValue::Null => Ok(Expression::Null),
            JsonValue::Bool(b) => Ok(Expression::Bool(*b)),
            JsonValue::Number(n) => Ok(Expression::Number(n.clone())),
            JsonValue::String(s) => Ok(Expression::String(s.clone())),
            JsonValue::Object(obj) => {
                let mut map = IndexMap::with_capacity(obj.len());
                for (k, v) in obj {
                    map.insert(k.clone(), Expression::from_json(v)?);
                }
                Ok(Expression::Object(map))
            }
            JsonValue::Array(arr) => Self::from_json_array(arr),
        }
    }

    fn from_json_array(arr: &[JsonValue]) -> Result<Self, WireError> {
        // `[[...]]`: a one-element array wrapping an array is the literal
        // escape; the inner elements are still expressions.
        if arr.len() == 1 {
            if let JsonValue::Array(inner) = &arr[0] {
                let items = inner
                    .iter()
                    .map(Expression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Expression::Array(items));
            }
        }

        match arr.first() {
            Some(JsonValue::String(tag)) => Self::from_tagged(tag, arr),
            // Nothing the serializer emits starts an array with a non-string,
            // non-array head; read it leniently as a literal.
            _ => {
                let items = arr
                    .iter()
                    .map(Expression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expression::Array(items))
            }
        }
    }

    fn from_tagged(tag: &str, arr: &[JsonValue]) -> Result<Self, WireError> {
        match tag {
            "date" => {
                if arr.len() != 2 {
                    return Err(WireError::Arity { form: "date" });
                }
                let millis = arr[1].as_f64().ok_or(WireError::InvalidField {
                    form: "date",
                    expected: "a numeric timestamp",
                })?;
                Ok(Expression::Date(millis))
            }

            "error" => {
                if !(3..=5).contains(&arr.len()) {
                    return Err(WireError::Arity { form: "error" });
                }
                let error_type = arr[1]
                    .as_str()
                    .ok_or(WireError::InvalidField {
                        form: "error",
                        expected: "a string type tag",
                    })?
                    .to_string();
                let message = arr[2]
                    .as_str()
                    .ok_or(WireError::InvalidField {
                        form: "error",
                        expected: "a string message",
                    })?
                    .to_string();
                let stack = match arr.get(3) {
                    None | Some(JsonValue::Null) => None,
                    Some(JsonValue::String(s)) => Some(s.clone()),
                    Some(_) => {
                        return Err(WireError::InvalidField {
                            form: "error",
                            expected: "a string or null stack",
                        })
                    }
                };
                let data = arr.get(4).filter(|v| !v.is_null()).cloned();
                Ok(Expression::Error(ErrorExpression {
                    error_type,
                    message,
                    stack,
                    data,
                }))
            }

            "import" | "pipeline" => {
                let form: &'static str = if tag == "import" { "import" } else { "pipeline" };
                if !(2..=4).contains(&arr.len()) {
                    return Err(WireError::Arity { form });
                }
                let id = arr[1].as_i64().ok_or(WireError::InvalidField {
                    form,
                    expected: "an integer ID",
                })?;
                let path = arr.get(2).map(|p| parse_path(p, form)).transpose()?;
                let args = arr
                    .get(3)
                    .map(Expression::from_json)
                    .transpose()?
                    .map(Box::new);
                let reference = ReferenceExpression { id, path, args };
                if tag == "import" {
                    Ok(Expression::Import(reference))
                } else {
                    Ok(Expression::Pipeline(reference))
                }
            }

            "export" | "promise" => {
                let form: &'static str = if tag == "export" { "export" } else { "promise" };
                if arr.len() != 2 {
                    return Err(WireError::Arity { form });
                }
                let id = arr[1].as_i64().ok_or(WireError::InvalidField {
                    form,
                    expected: "an integer ID",
                })?;
                if tag == "export" {
                    Ok(Expression::Export(id))
                } else {
                    Ok(Expression::Promise(id))
                }
            }

            "remap" => {
                if arr.len() != 5 {
                    return Err(WireError::Arity { form: "remap" });
                }
                let id = arr[1].as_i64().ok_or(WireError::InvalidField {
                    form: "remap",
                    expected: "an integer ID",
                })?;
                let path = match &arr[2] {
                    JsonValue::Null => Vec::new(),
                    other => parse_path(other, "remap")?,
                };
                let captures = arr[3]
                    .as_array()
                    .ok_or(WireError::InvalidField {
                        form: "remap",
                        expected: "a captures array",
                    })?
                    .iter()
                    .map(Expression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                let instructions = arr[4]
                    .as_array()
                    .ok_or(WireError::InvalidField {
                        form: "remap",
                        expected: "an instructions array",
                    })?
                    .iter()
                    .map(Expression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expression::Remap(RemapExpression {
                    id,
                    path,
                    captures,
                    instructions,
                }))
            }

            other => Err(WireError::UnknownTag(other.to_string())),
        }
    }

    /// Render the expression as wire JSON. Literal arrays always get the
    /// `[[...]]` escape so the head position can never collide with a tag.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Expression::Null => JsonValue::Null,
            Expression::Bool(b) => JsonValue::Bool(*b),
            Expression::Number(n) => JsonValue::Number(n.clone()),
            Expression::String(s) => JsonValue::String(s.clone()),

            Expression::Array(items) => {
                let inner: Vec<JsonValue> = items.iter().map(Expression::to_json).collect();
                JsonValue::Array(vec![JsonValue::Array(inner)])
            }

            Expression::Object(map) => {
                let obj = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<serde_json::Map<String, JsonValue>>();
                JsonValue::Object(obj)
            }

            Expression::Date(millis) => {
                let n = if millis.fract() == 0.0 && millis.is_finite() {
                    Number::from(*millis as i64)
                } else {
                    Number::from_f64(*millis).unwrap_or_else(|| Number::from(0))
                };
                JsonValue::Array(vec![JsonValue::String("date".into()), JsonValue::Number(n)])
            }

            Expression::Error(err) => {
                let mut arr = vec![
                    JsonValue::String("error".into()),
                    JsonValue::String(err.error_type.clone()),
                    JsonValue::String(err.message.clone()),
                ];
                match (&err.stack, &err.data) {
                    (None, None) => {}
                    (Some(stack), None) => arr.push(JsonValue::String(stack.clone())),
                    (stack, Some(data)) => {
                        arr.push(match stack {
                            Some(s) => JsonValue::String(s.clone()),
                            None => JsonValue::Null,
                        });
                        arr.push(data.clone());
                    }
                }
                JsonValue::Array(arr)
            }

            Expression::Import(reference) => reference.to_json("import"),
            Expression::Pipeline(reference) => reference.to_json("pipeline"),

            Expression::Export(id) => JsonValue::Array(vec![
                JsonValue::String("export".into()),
                JsonValue::Number(Number::from(*id)),
            ]),
            Expression::Promise(id) => JsonValue::Array(vec![
                JsonValue::String("promise".into()),
                JsonValue::Number(Number::from(*id)),
            ]),

            Expression::Remap(remap) => {
                let path: Vec<JsonValue> = remap.path.iter().map(PropertyKey::to_json).collect();
                let captures: Vec<JsonValue> =
                    remap.captures.iter().map(Expression::to_json).collect();
                let instructions: Vec<JsonValue> =
                    remap.instructions.iter().map(Expression::to_json).collect();
                JsonValue::Array(vec![
                    JsonValue::String("remap".into()),
                    JsonValue::Number(Number::from(remap.id)),
                    JsonValue::Array(path),
                    JsonValue::Array(captures),
                    JsonValue::Array(instructions),
                ])
            }
        }
    }
}

impl ReferenceExpression {
    fn to_json(&self, tag: &str) -> JsonValue {
        let mut arr = vec![
            JsonValue::String(tag.into()),
            JsonValue::Number(Number::from(self.id)),
        ];
        let needs_path = self.path.is_some() || self.args.is_some();
        if needs_path {
            let path: Vec<JsonValue> = self
                .path
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .map(PropertyKey::to_json)
                .collect();
            arr.push(JsonValue::Array(path));
        }
        if let Some(args) = &self.args {
            arr.push(args.to_json());
        }
        JsonValue::Array(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: JsonValue) -> Expression {
        Expression::from_json(&v).unwrap()
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(parse(json!(null)), Expression::Null);
        assert_eq!(parse(json!(true)), Expression::Bool(true));
        assert_eq!(parse(json!("hi")), Expression::String("hi".into()));
    }

    #[test]
    fn literal_array_escape_round_trips() {
        let wire = json!([["just", "an", "array"]]);
        let expr = parse(wire.clone());
        assert_eq!(
            expr,
            Expression::Array(vec![
                Expression::String("just".into()),
                Expression::String("an".into()),
                Expression::String("array".into()),
            ])
        );
        assert_eq!(expr.to_json(), wire);
    }

    #[test]
    fn nested_arrays_escape_at_every_level() {
        let expr = Expression::Array(vec![
            Expression::Number(Number::from(5)),
            Expression::Array(vec![Expression::Number(Number::from(3))]),
        ]);
        assert_eq!(expr.to_json(), json!([[5, [[3]]]]));
        assert_eq!(parse(json!([[5, [[3]]]])), expr);
    }

    #[test]
    fn pipeline_with_path_and_args() {
        let wire = json!(["pipeline", 0, ["add"], [[5, 3]]]);
        match parse(wire.clone()) {
            Expression::Pipeline(r) => {
                assert_eq!(r.id, 0);
                assert_eq!(r.path, Some(vec![PropertyKey::String("add".into())]));
                assert!(r.args.is_some());
            }
            other => panic!("expected pipeline, got {:?}", other),
        }
        assert_eq!(parse(wire.clone()).to_json(), wire);
    }

    #[test]
    fn pipeline_navigation_only() {
        let wire = json!(["pipeline", 1, ["id"]]);
        let expr = parse(wire.clone());
        assert_eq!(expr.to_json(), wire);
    }

    #[test]
    fn error_with_stack_and_data() {
        let wire = json!(["error", "bad_request", "Division by zero", null, {"divisor": 0}]);
        match parse(wire.clone()) {
            Expression::Error(e) => {
                assert_eq!(e.error_type, "bad_request");
                assert_eq!(e.stack, None);
                assert_eq!(e.data, Some(json!({"divisor": 0})));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(parse(wire.clone()).to_json(), wire);
    }

    #[test]
    fn date_keeps_integer_millis_integral() {
        let expr = parse(json!(["date", 1700000000000i64]));
        assert_eq!(expr, Expression::Date(1700000000000.0));
        assert_eq!(expr.to_json(), json!(["date", 1700000000000i64]));
    }

    #[test]
    fn remap_full_arity() {
        let wire = json!(["remap", 1, [], [["import", 2]], [["pipeline", -1, [], [[0]]]]]);
        match parse(wire.clone()) {
            Expression::Remap(r) => {
                assert_eq!(r.id, 1);
                assert!(r.path.is_empty());
                assert_eq!(r.captures.len(), 1);
                assert_eq!(r.instructions.len(), 1);
            }
            other => panic!("expected remap, got {:?}", other),
        }
        assert_eq!(parse(wire.clone()).to_json(), wire);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Expression::from_json(&json!(["frobnicate", 1])).unwrap_err();
        assert!(matches!(err, WireError::UnknownTag(t) if t == "frobnicate"));
    }

    #[test]
    fn object_field_order_is_preserved() {
        let wire = json!({"z": 1, "a": 2, "m": 3});
        match parse(wire.clone()) {
            Expression::Object(map) => {
                let keys: Vec<&String> = map.keys().collect();
                assert_eq!(keys, ["z", "a", "m"]);
            }
            other => panic!("expected object, got {:?}", other),
        }
        assert_eq!(parse(wire.clone()).to_json(), wire);
    }
}
