// Value-to-wire walk. This is the only place export IDs are minted: any
// stub or promise encountered in an outgoing value is announced through the
// export table, reusing the existing slot when the same capability has been
// announced before.

use std::sync::Arc;

use tracing::trace;

use crate::error::RpcError;
use super::expression::{ErrorExpression, Expression, ReferenceExpression};
use super::hooks::StubHook;
use super::session::{SessionCore, SessionOptions};
use super::value::Value;

/// Render an error for the wire, honoring the session's stack redaction.
pub(crate) fn error_expression(options: &SessionOptions, error: &RpcError) -> Expression {
    Expression::Error(ErrorExpression {
        error_type: error.code.wire_tag().to_string(),
        message: error.message.clone(),
        stack: if options.expose_stacks {
            error.stack.clone()
        } else {
            None
        },
        data: error.data.clone(),
    })
}

pub(crate) struct Serializer<'a> {
    core: &'a Arc<SessionCore>,
}

impl<'a> Serializer<'a> {
    pub fn new(core: &'a Arc<SessionCore>) -> Self {
        Serializer { core }
    }

    /// Walk a value into its wire expression, exporting capabilities as
    /// they are encountered.
    pub fn expression(&self, value: &Value) -> Expression {
        match value {
            Value::Null => Expression::Null,
            Value::Bool(b) => Expression::Bool(*b),
            Value::Number(n) => Expression::Number(n.clone()),
            Value::String(s) => Expression::String(s.clone()),

            Value::Array(items) => {
                Expression::Array(items.iter().map(|v| self.expression(v)).collect())
            }

            Value::Object(map) => Expression::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.expression(v)))
                    .collect(),
            ),

            Value::Date(millis) => Expression::Date(*millis),

            Value::Error(error) => self.error(error),

            Value::Stub(stub) => {
                let promise_flavored = stub.hook().is_promise_kind();
                self.capability(stub.hook(), promise_flavored)
            }
            Value::Promise(promise) => self.capability(promise.hook(), true),
        }
    }

    pub fn error(&self, error: &RpcError) -> Expression {
        error_expression(self.core.options(), error)
    }

    fn capability(&self, hook: &StubHook, promise_flavored: bool) -> Expression {
        // Errors captured in a hook travel as plain error values.
        if let Some(error) = hook.error_value() {
            return self.error(error);
        }

        // References back into this session's own import table are passed
        // back by ID instead of re-exported: the peer already hosts them.
        if let Some(binding) = hook.import_binding_for(self.core) {
            let reference = ReferenceExpression {
                id: binding.id.0,
                path: if binding.path.is_empty() {
                    None
                } else {
                    Some(binding.path.clone())
                },
                args: None,
            };
            return if binding.is_promise {
                Expression::Pipeline(reference)
            } else {
                Expression::Import(reference)
            };
        }

        // A capability this side hosts: mint (or reuse) an export slot.
        let (id, minted) = self
            .core
            .exports()
            .announce(hook, || self.core.allocator().allocate_export());
        trace!(%id, minted, promise_flavored, "announcing export");

        if promise_flavored {
            if minted {
                // First announcement of a pending computation: emit its
                // resolution to the peer once it completes.
                self.core.spawn_export_resolution(id, hook.clone());
            }
            Expression::Promise(id.0)
        } else {
            Expression::Export(id.0)
        }
    }
}
