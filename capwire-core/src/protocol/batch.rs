// Client-side pipeline batch: queue several dependent calls and flush them
// as one transport write. Arguments of a queued call may reference the
// promise of an earlier call in the same batch; those references serialize
// as `["pipeline", id, path]` and never wait for the network.

use std::mem;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::RpcError;
use super::expression::{Expression, PropertyKey, ReferenceExpression};
use super::hooks::{RpcPromise, Stub, StubHook};
use super::ids::ImportId;
use super::message::Message;
use super::payload::Payload;
use super::serializer::Serializer;
use super::session::{RpcSession, SessionCore, SessionState};
use super::value::Value;

/// A batch lives for exactly one flush. Dropping it unflushed releases
/// every allocated import ID locally without emitting anything.
pub struct Batch {
    core: Arc<SessionCore>,
    queued: Vec<Message>,
    calls: Vec<ImportId>,
    flushed: bool,
}

impl Batch {
    pub fn new(session: &RpcSession) -> Self {
        Batch {
            core: Arc::clone(session.core()),
            queued: Vec::new(),
            calls: Vec::new(),
            flushed: false,
        }
    }

    /// Queue a call on a remote stub of this session. Returns the promise
    /// immediately; it can be navigated and passed as an argument to later
    /// calls in the same batch.
    pub fn call(
        &mut self,
        target: &Stub,
        path: Vec<PropertyKey>,
        args: Vec<Value>,
    ) -> Result<RpcPromise, RpcError> {
        if self.core.state() != SessionState::Open {
            return Err(RpcError::canceled("session is closed"));
        }
        let Some(binding) = target.hook().import_binding_for(&self.core) else {
            return Err(RpcError::bad_request(
                "batch calls require a remote stub belonging to this session",
            ));
        };

        let payload = Payload::from_params(Value::Array(args));
        let args_expr = Serializer::new(&self.core).expression(&payload.value);
        let mut full_path = binding.path.clone();
        full_path.extend(path);
        let base_id = binding.id.0;

        let id = self.core.allocator().allocate_import();
        self.core
            .imports()
            .register_push(id)
            .map_err(|_| RpcError::internal("import table corrupted"))?;

        trace!(base = base_id, %id, "queueing batched call");
        self.queued.push(Message::Push(Expression::Pipeline(
            ReferenceExpression {
                id: base_id,
                path: Some(full_path),
                args: Some(Box::new(args_expr)),
            },
        )));
        self.calls.push(id);

        Ok(RpcPromise::from_hook(StubHook::import(
            self.core.weak(),
            id,
            Vec::new(),
            true,
        )))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Send every queued push followed by the pulls for each call, as a
    /// single write when the transport can batch.
    pub async fn flush(mut self) -> Result<(), RpcError> {
        if self.core.state() != SessionState::Open {
            return Err(RpcError::canceled("session is closed"));
        }
        let mut messages = mem::take(&mut self.queued);
        let calls = mem::take(&mut self.calls);
        for id in calls {
            if self.core.imports().mark_pull_requested(id) {
                messages.push(Message::Pull(id));
            }
        }
        self.flushed = true;
        debug!(messages = messages.len(), "flushing batch");
        eprintln!("DEBUG before outbound send, n={}", messages.len());
        self.core.outbound().send(messages).await;
        eprintln!("DEBUG after outbound send");
        Ok(())
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.flushed {
            return;
        }
        // Cancellation: free the IDs without putting anything on the wire.
        for id in &self.calls {
            trace!(%id, "discarding unflushed batched call");
            self.core.imports().discard(*id);
        }
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("queued", &self.queued.len())
            .field("flushed", &self.flushed)
            .finish()
    }
}
