// The session kernel. Owns the tables and the allocator, drives the
// push/pull/resolve/reject/release/abort state machine, and glues hooks to
// the transport.
//
// Concurrency model: one reader task dispatches inbound messages strictly
// in order; one writer task drains the outbound queue. User handlers and
// pull resolutions run on spawned tasks and re-enter through the queue, so
// a slow handler never stalls dispatch. Kernel-side emissions use the
// non-blocking lane of the queue and can never deadlock the reader;
// application producers go through the bounded lane and suspend when the
// writer falls behind.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::transport::{RpcTransport, TransportError};
use crate::RpcTarget;
use super::expression::{Expression, PropertyKey, ReferenceExpression};
use super::hooks::{ImportBinding, Stub, StubHook};
use super::ids::{ExportId, IdAllocator, ImportId};
use super::message::Message;
use super::parser::Parser;
use super::payload::Payload;
use super::serializer::{error_expression, Serializer};
use super::resume::{ExportSnapshot, ImportSnapshot, SessionSnapshot, SNAPSHOT_VERSION};
use super::tables::{ExportTable, ImportTable, TableError};
use super::value::Value;

/// Knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Include stack traces when serializing errors. Off by default;
    /// enable for development only.
    pub expose_stacks: bool,
    /// Outbound queue depth past which application producers suspend.
    pub outbound_queue: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            expose_stacks: false,
            outbound_queue: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Aborting,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_ABORTING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Outbound writes. The writer drains this; `push` is the non-blocking
/// kernel lane, `send` the bounded application lane.
pub(crate) struct OutboundQueue {
    tx: mpsc::UnboundedSender<Vec<Message>>,
    depth: AtomicUsize,
    limit: usize,
    drained: Notify,
}

impl OutboundQueue {
    fn new(tx: mpsc::UnboundedSender<Vec<Message>>, limit: usize) -> Self {
        Self {
            tx,
            depth: AtomicUsize::new(0),
            limit,
            drained: Notify::new(),
        }
    }

    /// Enqueue without waiting. Reserved for the kernel and for release
    /// emission from handle drops, which must not suspend.
    pub fn push(&self, batch: Vec<Message>) {
        self.depth.fetch_add(batch.len(), Ordering::SeqCst);
        if self.tx.send(batch).is_err() {
            trace!("outbound queue closed; write dropped");
        }
    }

    /// Enqueue, suspending while the writer is more than `limit` messages
    /// behind.
    pub async fn send(&self, batch: Vec<Message>) {
        loop {
            if self.depth.load(Ordering::SeqCst) < self.limit {
                break;
            }
            let drained = self.drained.notified();
            tokio::pin!(drained);
            // Register before the re-check so a wakeup between the check
            // and the await cannot be lost.
            drained.as_mut().enable();
            if self.depth.load(Ordering::SeqCst) < self.limit {
                break;
            }
            drained.await;
        }
        self.push(batch);
    }

    fn note_written(&self, count: usize) {
        self.depth.fetch_sub(count, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

pub(crate) struct SessionCore {
    weak_self: Weak<SessionCore>,
    options: SessionOptions,
    allocator: IdAllocator,
    imports: ImportTable,
    exports: ExportTable,
    outbound: OutboundQueue,
    state: AtomicU8,
    // Level-triggered stop flag: tasks that subscribe after termination
    // still observe it.
    shutdown: watch::Sender<bool>,
}

impl SessionCore {
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    pub fn imports(&self) -> &ImportTable {
        &self.imports
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub fn weak(&self) -> Weak<SessionCore> {
        self.weak_self.clone()
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => SessionState::Open,
            STATE_ABORTING => SessionState::Aborting,
            _ => SessionState::Closed,
        }
    }

    pub fn import_add_ref(&self, id: ImportId) -> Result<(), TableError> {
        self.imports.add_ref(id)
    }

    /// Drop one local handle on an import; the last one removes the entry
    /// and tells the peer how many introductions it may reclaim.
    pub fn release_import(&self, id: ImportId) {
        if let Some(introductions) = self.imports.release_local(id) {
            if self.state() == SessionState::Open && introductions > 0 {
                debug!(%id, introductions, "releasing import");
                self.outbound.push(vec![Message::Release(id, introductions)]);
            }
        }
    }

    /// Compose a pipelined call on an imported capability: allocate a fresh
    /// import ID, queue the push, and hand back the promise-flavored hook.
    /// Nothing waits on the network here.
    pub fn pipeline_call(
        self: &Arc<Self>,
        binding: &ImportBinding,
        path: Vec<PropertyKey>,
        args: Payload,
    ) -> StubHook {
        if self.state() != SessionState::Open {
            return StubHook::error(RpcError::canceled("session is closed"));
        }
        if !self.imports.contains(binding.id) {
            return StubHook::error(RpcError::cap_revoked("stub has been disposed"));
        }

        let mut full_path = binding.path.clone();
        full_path.extend(path);
        let args_expr = Serializer::new(self).expression(&args.value);

        let id = self.allocator.allocate_import();
        if let Err(error) = self.imports.register_push(id) {
            // IDs are never reused, so a collision here cannot happen.
            warn!(%id, %error, "import registration failed");
            return StubHook::error(RpcError::internal("import table corrupted"));
        }

        trace!(base = %binding.id, %id, "pipelining call");
        self.outbound.push(vec![Message::Push(Expression::Pipeline(
            ReferenceExpression {
                id: binding.id.0,
                path: Some(full_path),
                args: Some(Box::new(args_expr)),
            },
        ))]);

        StubHook::import(self.weak(), id, Vec::new(), true)
    }

    /// Materialize a path-extended reference as its own push, so the peer
    /// performs the navigation: `["push", ["pipeline", id, path]]`. Used
    /// when a derived reference is pulled rather than passed along.
    pub fn pipeline_navigate(self: &Arc<Self>, binding: &ImportBinding) -> StubHook {
        if self.state() != SessionState::Open {
            return StubHook::error(RpcError::canceled("session is closed"));
        }
        if !self.imports.contains(binding.id) {
            return StubHook::error(RpcError::cap_revoked("stub has been disposed"));
        }

        let id = self.allocator.allocate_import();
        if let Err(error) = self.imports.register_push(id) {
            warn!(%id, %error, "import registration failed");
            return StubHook::error(RpcError::internal("import table corrupted"));
        }

        trace!(base = %binding.id, %id, "pipelining navigation");
        self.outbound.push(vec![Message::Push(Expression::Pipeline(
            ReferenceExpression {
                id: binding.id.0,
                path: Some(binding.path.clone()),
                args: None,
            },
        ))]);

        StubHook::import(self.weak(), id, Vec::new(), true)
    }

    /// Force resolution of an import: emit the pull (once) and wait for the
    /// matching resolve or reject.
    pub async fn pull_import(self: &Arc<Self>, id: ImportId) -> Result<Value, RpcError> {
        let Some(mut rx) = self.imports.subscribe(id) else {
            return Err(RpcError::cap_revoked("import has been released"));
        };
        if self.imports.mark_pull_requested(id) {
            self.outbound.send(vec![Message::Pull(id)]).await;
        }
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            rx.changed()
                .await
                .map_err(|_| RpcError::canceled("session closed before resolution"))?;
        }
    }

    /// Emit the resolution of an exported promise once its hook settles.
    pub fn spawn_export_resolution(self: &Arc<Self>, id: ExportId, hook: StubHook) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = hook.pull().await;
            if core.state() != SessionState::Open {
                return;
            }
            let message = match outcome {
                Ok(payload) => {
                    let expr = Serializer::new(&core).expression(&payload.value);
                    Message::Resolve(id, expr)
                }
                Err(error) => Message::Reject(id, Serializer::new(&core).error(&error)),
            };
            trace!(%id, "emitting export resolution");
            core.outbound.send(vec![message]).await;
        });
    }

    /// Tear the session down. Emits a single abort when this side initiated
    /// and the transport is still believed healthy; fails every pending
    /// import; disposes every export. Idempotent.
    pub fn terminate(&self, error: &RpcError, emit_abort: bool) {
        let prior = self
            .state
            .compare_exchange(STATE_OPEN, STATE_ABORTING, Ordering::SeqCst, Ordering::SeqCst);
        if prior.is_err() {
            return;
        }
        debug!(code = %error.code, emit_abort, "terminating session");
        if emit_abort {
            let expr = error_expression(&self.options, error);
            self.outbound.push(vec![Message::Abort(expr)]);
        }
        self.imports.fail_all(error);
        self.exports.clear_all();
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

/// A live RPC session over one transport. Dropping the session tears it
/// down; use [`RpcSession::shutdown`] for an orderly close.
pub struct RpcSession {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("state", &self.core.state())
            .finish()
    }
}

impl RpcSession {
    /// Attach a session to a transport. When `root` is given it is
    /// registered as this side's main capability at export ID 0; the peer's
    /// main capability is reachable through [`RpcSession::root_stub`].
    pub fn new<T: RpcTransport + 'static>(
        transport: T,
        root: Option<Arc<dyn RpcTarget>>,
        options: SessionOptions,
    ) -> Self {
        let transport: Arc<dyn RpcTransport> = Arc::new(transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limit = options.outbound_queue;
        let core = Arc::new_cyclic(|weak| SessionCore {
            weak_self: weak.clone(),
            options,
            allocator: IdAllocator::new(),
            imports: ImportTable::new(),
            exports: ExportTable::new(),
            outbound: OutboundQueue::new(tx, limit),
            state: AtomicU8::new(STATE_OPEN),
            shutdown: shutdown_tx,
        });

        if let Some(root) = root {
            if let Err(error) = core.exports.register_root(StubHook::target(root)) {
                warn!(%error, "root registration failed");
            }
        }
        // The peer's main capability occupies import slot 0 for the whole
        // session; the pre-registered entry keeps it from being released.
        if let Err(error) = core.imports.register_push(ImportId::main()) {
            warn!(%error, "main import registration failed");
        }

        tokio::spawn(writer_task(
            Arc::clone(&core),
            Arc::clone(&transport),
            rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(reader_task(Arc::clone(&core), transport, shutdown_rx));

        RpcSession { core }
    }

    /// A stub for the peer's main capability (import ID 0).
    pub fn root_stub(&self) -> Stub {
        let _ = self.core.import_add_ref(ImportId::main());
        Stub::from_hook(StubHook::import(
            self.core.weak(),
            ImportId::main(),
            Vec::new(),
            false,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_closed(&self) -> bool {
        self.core.state() == SessionState::Closed
    }

    /// Orderly close: nothing is sent, pending promises fail with
    /// `canceled`, exports are disposed, and the transport is closed.
    pub fn shutdown(self) {
        self.core
            .terminate(&RpcError::canceled("session shut down"), false);
    }

    /// Abort with an application-supplied error, notifying the peer.
    pub fn abort(&self, error: RpcError) {
        self.core.terminate(&error, true);
    }

    /// Capture the table state needed to reattach this session to a new
    /// transport. Token signing and storage live with the caller.
    pub fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: session_id.to_string(),
            allocator: self.core.allocator.watermarks(),
            imports: self
                .core
                .imports
                .snapshot()
                .into_iter()
                .map(|(id, refcount, introductions)| ImportSnapshot {
                    id,
                    refcount,
                    introductions,
                })
                .collect(),
            exports: self
                .core
                .exports
                .snapshot()
                .into_iter()
                .map(|(id, introductions)| ExportSnapshot { id, introductions })
                .collect(),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.core
            .terminate(&RpcError::canceled("session dropped"), false);
    }
}

async fn writer_task(
    core: Arc<SessionCore>,
    transport: Arc<dyn RpcTransport>,
    mut rx: mpsc::UnboundedReceiver<Vec<Message>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            batch = rx.recv() => match batch {
                Some(batch) => {
                    eprintln!("DEBUG writer got batch n={}", batch.len());
                    let had_abort = batch.iter().any(|m| matches!(m, Message::Abort(_)));
                    let count = batch.len();
                    let written = write_batch(&transport, batch).await;
                    eprintln!("DEBUG writer wrote batch ok={:?}", written.is_ok());
                    core.outbound.note_written(count);
                    match written {
                        Ok(()) if had_abort => break,
                        Ok(()) => {}
                        Err(error) => {
                            warn!(%error, "transport write failed");
                            core.terminate(
                                &RpcError::internal(format!("transport write failed: {}", error)),
                                false,
                            );
                            break;
                        }
                    }
                }
                None => break,
            },
            _ = async {
                while !*stop.borrow() {
                    if stop.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                // Flush whatever is already queued (the abort, if any),
                // then close.
                while let Ok(batch) = rx.try_recv() {
                    let had_abort = batch.iter().any(|m| matches!(m, Message::Abort(_)));
                    let count = batch.len();
                    let written = write_batch(&transport, batch).await;
                    core.outbound.note_written(count);
                    if written.is_err() || had_abort {
                        break;
                    }
                }
                break;
            }
        }
    }
    if let Err(error) = transport.close().await {
        trace!(%error, "transport close failed");
    }
}

async fn write_batch(
    transport: &Arc<dyn RpcTransport>,
    batch: Vec<Message>,
) -> Result<(), TransportError> {
    if batch.len() > 1 && transport.supports_batching() {
        transport.send_batch(batch).await
    } else {
        for message in batch {
            transport.send(message).await?;
        }
        Ok(())
    }
}

async fn reader_task(
    core: Arc<SessionCore>,
    transport: Arc<dyn RpcTransport>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            inbound = transport.recv() => match inbound {
                Ok(Some(message)) => {
                    if let Err(violation) = dispatch(&core, message) {
                        warn!(%violation, "protocol violation");
                        core.terminate(&violation, true);
                        break;
                    }
                    if core.state() == SessionState::Closed {
                        break;
                    }
                }
                Ok(None) => {
                    if core.state() == SessionState::Open {
                        core.terminate(&RpcError::internal("transport closed"), false);
                    }
                    break;
                }
                Err(TransportError::Codec(detail)) => {
                    core.terminate(&RpcError::bad_request(detail), true);
                    break;
                }
                Err(error) => {
                    core.terminate(
                        &RpcError::internal(format!("transport failure: {}", error)),
                        false,
                    );
                    break;
                }
            }
        }
    }
}

/// Apply one inbound message. Runs on the reader task, strictly in order;
/// anything that must wait is spawned. An `Err` is a protocol violation and
/// aborts the session.
fn dispatch(core: &Arc<SessionCore>, message: Message) -> Result<(), RpcError> {
    match message {
        Message::Push(expr) => {
            let id = core.allocator.allocate_inbound_push();
            let hook = Parser::new(core).hook_for_push(&expr)?;
            trace!(%id, "installing pushed expression");
            if let Err(error) = core.exports.register_push(id, hook) {
                warn!(%id, %error, "push registration failed");
            }
            Ok(())
        }

        // The peer pulls its import; that is our export under the same
        // number. The resolution is emitted from a spawned task so a slow
        // pull never blocks dispatch.
        Message::Pull(id) => {
            let export_id = id.as_export();
            match core.exports.hook(export_id) {
                Some(hook) => core.spawn_export_resolution(export_id, hook),
                None => {
                    let error = RpcError::not_found(format!("no export with ID {}", id.0));
                    let expr = Serializer::new(core).error(&error);
                    core.outbound.push(vec![Message::Reject(export_id, expr)]);
                }
            }
            Ok(())
        }

        // The peer resolves its export; that is our import. Unknown IDs
        // were released while the resolution was in flight and are dropped.
        Message::Resolve(id, expr) => {
            let import_id = id.as_import();
            let value = Parser::new(core).value(&expr)?;
            if !core.imports.resolve(import_id, Ok(value)) {
                trace!(id = %import_id, "resolution for released import dropped");
            }
            Ok(())
        }

        Message::Reject(id, expr) => {
            let import_id = id.as_import();
            let error = match Parser::new(core).value(&expr)? {
                Value::Error(error) => error,
                other => {
                    let mut error = RpcError::internal("peer rejected with a non-error value");
                    error.data = other.to_plain_json().ok();
                    error
                }
            };
            if !core.imports.resolve(import_id, Err(error)) {
                trace!(id = %import_id, "rejection for released import dropped");
            }
            Ok(())
        }

        Message::Release(id, refcount) => {
            let export_id = id.as_export();
            if core.exports.release(export_id, refcount) {
                trace!(id = %export_id, "export dropped");
            }
            Ok(())
        }

        Message::Abort(expr) => {
            let error = match Parser::new(core).value(&expr) {
                Ok(Value::Error(error)) => error,
                _ => RpcError::internal("peer aborted the session"),
            };
            core.terminate(&error, false);
            Ok(())
        }
    }
}
