// Remap execution: apply a mapper to every element of a collection on the
// exporting side, without a round trip per element.
//
// Inside mapper instructions the reference IDs address a three-region scope
// instead of the session tables: negative indices name captures, index 0 is
// the element under map, and positive indices name the results of earlier
// instructions. The export table is off limits; an `export` or `promise`
// form anywhere in the instruction list is a protocol violation.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::error::{ErrorCode, RpcError};
use super::expression::{Expression, RemapExpression};
use super::hooks::{walk_value, StubHook, Walked};
use super::ids::ExportId;
use super::parser::Parser;
use super::payload::Payload;
use super::session::SessionCore;
use super::value::Value;

/// Build the promise hook for a pushed remap. Captures are evaluated once,
/// up front, with the normal expression rules; the mapping itself runs on a
/// spawned task and resolves the returned hook.
pub(crate) fn remap_hook(
    core: &Arc<SessionCore>,
    remap: &RemapExpression,
) -> Result<StubHook, RpcError> {
    if remap.instructions.is_empty() {
        return Err(RpcError::bad_request("remap requires at least one instruction"));
    }
    for instruction in &remap.instructions {
        check_instruction(instruction)?;
    }

    let Some(base) = core.exports().hook(ExportId(remap.id)) else {
        return Ok(StubHook::error(RpcError::not_found(format!(
            "no export with ID {}",
            remap.id
        ))));
    };

    let parser = Parser::new(core);
    let captures = remap
        .captures
        .iter()
        .map(|capture| parser.value(capture))
        .collect::<Result<Vec<_>, _>>()?;

    let (resolver, promise) = StubHook::promise_pair();
    let core = Arc::clone(core);
    let path = remap.path.clone();
    let instructions = remap.instructions.clone();
    tokio::spawn(async move {
        let input = match base.get(path).pull().await {
            Ok(payload) => payload.value,
            Err(error) => return resolver.reject(error),
        };
        debug!(captures = captures.len(), "remap input resolved");

        let output = match input {
            Value::Array(items) => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    mapped.push(map_element(&captures, &item, &instructions).await);
                }
                Value::Array(mapped)
            }
            // Mapping a scalar applies the mapper once to the value itself.
            single => map_element(&captures, &single, &instructions).await,
        };
        resolver.resolve(StubHook::payload(Payload::owned(output)));
    });

    Ok(promise)
}

/// Run the instruction list against one element. A failing instruction
/// short-circuits this element to an error value; other elements continue.
async fn map_element(
    captures: &[Value],
    element: &Value,
    instructions: &[Expression],
) -> Value {
    let mut results: Vec<Value> = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        let outcome = {
            let scope = Scope {
                captures,
                element,
                results: &results,
            };
            evaluate(&scope, instruction).await
        };
        match outcome {
            Ok(value) => results.push(value),
            Err(error) => return Value::Error(error),
        }
    }
    results.pop().unwrap_or(Value::Null)
}

struct Scope<'a> {
    captures: &'a [Value],
    element: &'a Value,
    results: &'a [Value],
}

impl<'a> Scope<'a> {
    /// Resolve an address-space index: negatives into the capture region,
    /// zero to the element, positives to strictly earlier results.
    fn slot(&self, index: i64) -> Result<Value, RpcError> {
        if index == 0 {
            return Ok(self.element.clone());
        }
        if index < 0 {
            let offset = (-index - 1) as usize;
            return self.captures.get(offset).cloned().ok_or_else(|| {
                RpcError::bad_request(format!("capture index {} out of range", index))
            });
        }
        self.results.get((index - 1) as usize).cloned().ok_or_else(|| {
            RpcError::bad_request(format!("instruction index {} out of range", index))
        })
    }
}

/// Reject forms that have no meaning inside a mapper before execution
/// starts: the instruction region has no export table.
fn check_instruction(expr: &Expression) -> Result<(), RpcError> {
    match expr {
        Expression::Export(_) | Expression::Promise(_) => Err(RpcError::bad_request(
            "export references are illegal inside remap instructions",
        )),
        Expression::Remap(_) => Err(RpcError::bad_request(
            "nested remap is not supported inside remap instructions",
        )),
        Expression::Array(items) => items.iter().try_for_each(check_instruction),
        Expression::Object(map) => map.values().try_for_each(check_instruction),
        Expression::Import(r) | Expression::Pipeline(r) => match &r.args {
            Some(args) => check_instruction(args),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

fn evaluate<'a>(
    scope: &'a Scope<'a>,
    expr: &'a Expression,
) -> BoxFuture<'a, Result<Value, RpcError>> {
    async move {
        match expr {
            Expression::Null => Ok(Value::Null),
            Expression::Bool(b) => Ok(Value::Bool(*b)),
            Expression::Number(n) => Ok(Value::Number(n.clone())),
            Expression::String(s) => Ok(Value::String(s.clone())),
            Expression::Date(millis) => Ok(Value::Date(*millis)),

            Expression::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(evaluate(scope, item).await?);
                }
                Ok(Value::Array(values))
            }

            Expression::Object(map) => {
                let mut values = indexmap::IndexMap::with_capacity(map.len());
                for (key, item) in map {
                    values.insert(key.clone(), evaluate(scope, item).await?);
                }
                Ok(Value::Object(values))
            }

            Expression::Error(err) => {
                let code =
                    ErrorCode::from_wire_tag(&err.error_type).unwrap_or(ErrorCode::Internal);
                let mut error = RpcError::new(code, err.message.clone());
                error.stack = err.stack.clone();
                error.data = err.data.clone();
                Ok(Value::Error(error))
            }

            Expression::Import(reference) | Expression::Pipeline(reference) => {
                let slot = scope.slot(reference.id)?;
                let path = reference.path.clone().unwrap_or_default();
                match &reference.args {
                    Some(args) => {
                        let args_value = evaluate(scope, args).await?;
                        let hook = capability_of(&slot)?;
                        let result = hook.call(path, Payload::owned(args_value));
                        let outcome = result.pull().await;
                        result.dispose();
                        Ok(outcome?.value)
                    }
                    None => match walk_value(&slot, &path)? {
                        Walked::Value(value) => Ok(value),
                        Walked::Capability(hook, rest) => {
                            let derived = hook.get(rest);
                            let outcome = derived.pull().await;
                            derived.dispose();
                            Ok(outcome?.value)
                        }
                    },
                }
            }

            Expression::Export(_) | Expression::Promise(_) => Err(RpcError::bad_request(
                "export references are illegal inside remap instructions",
            )),
            Expression::Remap(_) => Err(RpcError::bad_request(
                "nested remap is not supported inside remap instructions",
            )),
        }
    }
    .boxed()
}

fn capability_of(value: &Value) -> Result<StubHook, RpcError> {
    match value {
        Value::Stub(stub) => Ok(stub.hook().clone()),
        Value::Promise(promise) => Ok(promise.hook().clone()),
        _ => Err(RpcError::bad_request("call target in mapper is not a capability")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_forms_are_rejected_up_front() {
        let err = check_instruction(&Expression::Export(-1)).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequest);

        let nested = Expression::Array(vec![Expression::Promise(-2)]);
        assert!(check_instruction(&nested).is_err());
    }

    #[test]
    fn reference_args_are_scanned() {
        let expr = Expression::Pipeline(super::super::expression::ReferenceExpression {
            id: -1,
            path: None,
            args: Some(Box::new(Expression::Array(vec![Expression::Export(-3)]))),
        });
        assert!(check_instruction(&expr).is_err());
    }
}
