// Expression evaluation for inbound frames. Walking an expression installs
// hooks as a side effect: peer announcements land in the import table, and
// `import`/`pipeline` references resolve against the export table.
//
// Errors returned here are protocol violations and abort the session with
// `bad_request`. Recoverable conditions (an unknown table ID, a failed
// dispatch) surface as Error hooks and travel back through the affected
// promise instead.

use std::sync::Arc;

use crate::error::{ErrorCode, RpcError};
use super::expression::{Expression, ReferenceExpression};
use super::hooks::{RpcPromise, Stub, StubHook};
use super::ids::{ExportId, ImportId};
use super::payload::Payload;
use super::remap;
use super::session::SessionCore;
use super::value::Value;

pub(crate) struct Parser<'a> {
    core: &'a Arc<SessionCore>,
}

impl<'a> Parser<'a> {
    pub fn new(core: &'a Arc<SessionCore>) -> Self {
        Parser { core }
    }

    /// Evaluate an expression to a value, installing hooks for any
    /// capability references it contains.
    pub fn value(&self, expr: &Expression) -> Result<Value, RpcError> {
        match expr {
            Expression::Null => Ok(Value::Null),
            Expression::Bool(b) => Ok(Value::Bool(*b)),
            Expression::Number(n) => Ok(Value::Number(n.clone())),
            Expression::String(s) => Ok(Value::String(s.clone())),

            Expression::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.value(item)?);
                }
                Ok(Value::Array(values))
            }

            Expression::Object(map) => {
                let mut values = indexmap::IndexMap::with_capacity(map.len());
                for (key, item) in map {
                    values.insert(key.clone(), self.value(item)?);
                }
                Ok(Value::Object(values))
            }

            Expression::Date(millis) => Ok(Value::Date(*millis)),

            Expression::Error(err) => {
                let code =
                    ErrorCode::from_wire_tag(&err.error_type).unwrap_or(ErrorCode::Internal);
                let mut error = RpcError::new(code, err.message.clone());
                error.stack = err.stack.clone();
                error.data = err.data.clone();
                Ok(Value::Error(error))
            }

            // The sender passes back something it imported from us: resolve
            // in our export table.
            Expression::Import(reference) => {
                let hook = self.reference_hook(reference)?;
                Ok(Value::Stub(Stub::from_hook(hook)))
            }

            // Same lookup, but chained on an unresolved result; delivered to
            // the application as a promise.
            Expression::Pipeline(reference) => {
                let hook = self.reference_hook(reference)?;
                Ok(Value::Promise(RpcPromise::from_hook(hook)))
            }

            // The sender announces a capability it hosts: install or bump an
            // import entry.
            Expression::Export(id) => {
                let id = ImportId(*id);
                self.core.imports().register_announcement(id);
                Ok(Value::Stub(Stub::from_hook(StubHook::import(
                    self.core.weak(),
                    id,
                    Vec::new(),
                    false,
                ))))
            }

            Expression::Promise(id) => {
                let id = ImportId(*id);
                self.core.imports().register_announcement(id);
                Ok(Value::Promise(RpcPromise::from_hook(StubHook::import(
                    self.core.weak(),
                    id,
                    Vec::new(),
                    true,
                ))))
            }

            Expression::Remap(expr) => {
                let hook = remap::remap_hook(self.core, expr)?;
                Ok(Value::Promise(RpcPromise::from_hook(hook)))
            }
        }
    }

    /// Evaluate a pushed expression to the hook that will occupy the next
    /// export slot.
    pub fn hook_for_push(&self, expr: &Expression) -> Result<StubHook, RpcError> {
        match expr {
            Expression::Import(reference) | Expression::Pipeline(reference) => {
                self.reference_hook(reference)
            }
            Expression::Remap(expr) => remap::remap_hook(self.core, expr),
            other => {
                let value = self.value(other)?;
                Ok(StubHook::payload(Payload::owned(value)))
            }
        }
    }

    /// Resolve an `import`/`pipeline` reference against the export table,
    /// navigating the path and dispatching the call when present. An unknown
    /// ID yields an Error hook, not an abort: that failure belongs to the
    /// affected promise. Violations inside the argument expression are still
    /// fatal and propagate.
    fn reference_hook(&self, reference: &ReferenceExpression) -> Result<StubHook, RpcError> {
        let id = ExportId(reference.id);
        let Some(hook) = self.core.exports().hook(id) else {
            return Ok(StubHook::error(RpcError::not_found(format!(
                "no export with ID {}",
                reference.id
            ))));
        };
        let path = reference.path.clone().unwrap_or_default();
        Ok(match &reference.args {
            Some(args) => {
                let args_value = self.value(args)?;
                hook.call(path, Payload::owned(args_value))
            }
            None if path.is_empty() => hook.dup(),
            None => hook.get(path),
        })
    }
}
