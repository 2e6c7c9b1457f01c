// The capability evaluation graph. A hook is one of five variants behind a
// shared handle type; stubs and promises visible to the application are
// refcounted handles onto hooks. Operations never block: anything that has
// to wait (target dispatch, promise chaining, remote pulls) runs on a
// spawned task and surfaces as a Promise hook.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::trace;
use uuid::Uuid;

use crate::error::RpcError;
use crate::RpcTarget;
use super::expression::PropertyKey;
use super::ids::ImportId;
use super::payload::{settle, Payload};
use super::session::SessionCore;
use super::value::Value;

/// Internal capability reference. Cloning shares the hook without taking a
/// refcount; `dup` takes one. Application handles (`Stub`, `RpcPromise`)
/// always hold exactly one count.
#[derive(Clone)]
pub(crate) struct StubHook {
    inner: Arc<HookInner>,
}

struct HookInner {
    identity: Uuid,
    kind: HookKind,
    refs: AtomicU32,
}

enum HookKind {
    /// Every operation propagates the same error; pull fails with it.
    Error(RpcError),
    /// A locally owned value tree.
    Payload(Payload),
    /// A user-supplied callable object.
    Target(Arc<dyn RpcTarget>),
    /// A reference into the session's import table, optionally extended
    /// with a lazily accumulated property path.
    Import(ImportBinding),
    /// A completion that yields another hook.
    Promise(PromiseBinding),
}

#[derive(Clone)]
pub(crate) struct ImportBinding {
    pub session: Weak<SessionCore>,
    pub id: ImportId,
    pub path: Vec<PropertyKey>,
    /// Promise-flavored references serialize as `["pipeline", ...]`;
    /// settled stubs as `["import", ...]`.
    pub is_promise: bool,
}

#[derive(Clone)]
pub(crate) struct PromiseBinding {
    rx: watch::Receiver<Option<Result<StubHook, RpcError>>>,
}

impl PromiseBinding {
    async fn wait(mut rx: watch::Receiver<Option<Result<StubHook, RpcError>>>) -> Result<StubHook, RpcError> {
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            rx.changed()
                .await
                .map_err(|_| RpcError::canceled("promise dropped before resolution"))?;
        }
    }
}

/// Write half of a promise hook.
pub(crate) struct PromiseResolver {
    tx: watch::Sender<Option<Result<StubHook, RpcError>>>,
}

impl PromiseResolver {
    pub fn resolve(self, hook: StubHook) {
        let _ = self.tx.send(Some(Ok(hook)));
    }

    pub fn reject(self, error: RpcError) {
        let _ = self.tx.send(Some(Err(error)));
    }
}

/// Result of a stub-aware path walk: either a plain value or a capability
/// with the not-yet-walked remainder of the path.
pub(crate) enum Walked {
    Value(Value),
    Capability(StubHook, Vec<PropertyKey>),
}

pub(crate) fn walk_value(value: &Value, path: &[PropertyKey]) -> Result<Walked, RpcError> {
    let mut current = value;
    for (index, key) in path.iter().enumerate() {
        match current {
            Value::Stub(stub) => {
                return Ok(Walked::Capability(stub.hook().clone(), path[index..].to_vec()))
            }
            Value::Promise(promise) => {
                return Ok(Walked::Capability(
                    promise.hook().clone(),
                    path[index..].to_vec(),
                ))
            }
            Value::Object(map) => match key {
                PropertyKey::String(name) => {
                    current = map.get(name).ok_or_else(|| {
                        RpcError::not_found(format!("no such property: {}", name))
                    })?;
                }
                PropertyKey::Number(_) => {
                    return Err(RpcError::bad_request("object keys must be strings"))
                }
            },
            Value::Array(items) => match key {
                PropertyKey::Number(n) => {
                    current = items.get(*n).ok_or_else(|| {
                        RpcError::not_found(format!("index out of range: {}", n))
                    })?;
                }
                PropertyKey::String(_) => {
                    return Err(RpcError::bad_request("array indexes must be numbers"))
                }
            },
            _ => {
                return Err(RpcError::bad_request(format!(
                    "cannot navigate key {} into a non-container",
                    key
                )))
            }
        }
    }
    match current {
        Value::Stub(stub) => Ok(Walked::Capability(stub.hook().clone(), Vec::new())),
        Value::Promise(promise) => Ok(Walked::Capability(promise.hook().clone(), Vec::new())),
        other => Ok(Walked::Value(other.clone())),
    }
}

impl StubHook {
    fn new(kind: HookKind) -> Self {
        StubHook {
            inner: Arc::new(HookInner {
                identity: Uuid::new_v4(),
                kind,
                refs: AtomicU32::new(1),
            }),
        }
    }

    pub fn error(error: RpcError) -> Self {
        Self::new(HookKind::Error(error))
    }

    pub fn payload(payload: Payload) -> Self {
        Self::new(HookKind::Payload(payload.into_owned()))
    }

    pub fn target(target: Arc<dyn RpcTarget>) -> Self {
        Self::new(HookKind::Target(target))
    }

    pub fn import(
        session: Weak<SessionCore>,
        id: ImportId,
        path: Vec<PropertyKey>,
        is_promise: bool,
    ) -> Self {
        Self::new(HookKind::Import(ImportBinding {
            session,
            id,
            path,
            is_promise,
        }))
    }

    pub fn promise_pair() -> (PromiseResolver, StubHook) {
        let (tx, rx) = watch::channel(None);
        (
            PromiseResolver { tx },
            Self::new(HookKind::Promise(PromiseBinding { rx })),
        )
    }

    /// Stable identity for export-table reuse.
    pub fn identity(&self) -> Uuid {
        self.inner.identity
    }

    pub fn same_hook(&self, other: &StubHook) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The import binding, when this hook references the given session's
    /// import table. Serializers use this to emit pass-back references.
    pub fn import_binding_for(&self, session: &Arc<SessionCore>) -> Option<&ImportBinding> {
        match &self.inner.kind {
            HookKind::Import(binding) => {
                let same = binding
                    .session
                    .upgrade()
                    .map(|owner| Arc::ptr_eq(&owner, session))
                    .unwrap_or(false);
                same.then_some(binding)
            }
            _ => None,
        }
    }

    pub fn error_value(&self) -> Option<&RpcError> {
        match &self.inner.kind {
            HookKind::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_promise_kind(&self) -> bool {
        match &self.inner.kind {
            HookKind::Promise(_) => true,
            HookKind::Import(b) => b.is_promise,
            _ => false,
        }
    }

    /// Invoke the capability at `path` with `args`. Returns immediately; the
    /// result hook resolves when the dispatch completes.
    pub fn call(&self, path: Vec<PropertyKey>, args: Payload) -> StubHook {
        match &self.inner.kind {
            HookKind::Error(error) => StubHook::error(error.clone()),

            HookKind::Payload(payload) => match walk_value(&payload.value, &path) {
                Ok(Walked::Capability(hook, rest)) => hook.call(rest, args),
                Ok(Walked::Value(_)) => StubHook::error(RpcError::bad_request(
                    "target of call is not callable",
                )),
                Err(error) => StubHook::error(error),
            },

            HookKind::Target(target) => {
                let target = Arc::clone(target);
                let args = args.into_owned();
                let (resolver, promise) = StubHook::promise_pair();
                tokio::spawn(async move {
                    let settled = match settle(args.value).await {
                        Ok(value) => value,
                        Err(error) => return resolver.reject(error),
                    };
                    let items = match settled {
                        Value::Array(items) => items,
                        _ => {
                            return resolver.reject(RpcError::bad_request(
                                "call arguments must be an array",
                            ))
                        }
                    };
                    match target.call(&path, items).await {
                        Ok(value) => resolver
                            .resolve(StubHook::payload(Payload::from_return(value))),
                        Err(error) => resolver.reject(error),
                    }
                });
                promise
            }

            HookKind::Import(binding) => match binding.session.upgrade() {
                Some(core) => core.pipeline_call(binding, path, args),
                None => StubHook::error(RpcError::canceled("session closed")),
            },

            HookKind::Promise(binding) => {
                let rx = binding.rx.clone();
                let args = args.into_owned();
                let (resolver, promise) = StubHook::promise_pair();
                tokio::spawn(async move {
                    match PromiseBinding::wait(rx).await {
                        Ok(hook) => resolver.resolve(hook.call(path, args)),
                        Err(error) => resolver.reject(error),
                    }
                });
                promise
            }
        }
    }

    /// Navigate to a sub-capability. Never sends anything: import references
    /// extend their path lazily and the wire only sees the extended path when
    /// the result is pulled or used as an argument.
    pub fn get(&self, path: Vec<PropertyKey>) -> StubHook {
        if path.is_empty() {
            return self.dup();
        }
        match &self.inner.kind {
            HookKind::Error(error) => StubHook::error(error.clone()),

            HookKind::Payload(payload) => match walk_value(&payload.value, &path) {
                Ok(Walked::Capability(hook, rest)) => hook.get(rest),
                Ok(Walked::Value(value)) => StubHook::payload(Payload::owned(value)),
                Err(error) => StubHook::error(error),
            },

            HookKind::Target(target) => {
                let target = Arc::clone(target);
                let (resolver, promise) = StubHook::promise_pair();
                tokio::spawn(async move {
                    let mut keys = path.into_iter();
                    let name = match keys.next() {
                        Some(PropertyKey::String(name)) => name,
                        _ => {
                            return resolver.reject(RpcError::bad_request(
                                "target properties are accessed by name",
                            ))
                        }
                    };
                    let rest: Vec<PropertyKey> = keys.collect();
                    match target.get_property(&name).await {
                        Ok(value) => match walk_value(&value, &rest) {
                            Ok(Walked::Capability(hook, tail)) => {
                                resolver.resolve(hook.get(tail))
                            }
                            Ok(Walked::Value(value)) => {
                                resolver.resolve(StubHook::payload(Payload::owned(value)))
                            }
                            Err(error) => resolver.reject(error),
                        },
                        Err(error) => resolver.reject(error),
                    }
                });
                promise
            }

            HookKind::Import(binding) => {
                let Some(core) = binding.session.upgrade() else {
                    return StubHook::error(RpcError::canceled("session closed"));
                };
                if core.import_add_ref(binding.id).is_err() {
                    return StubHook::error(RpcError::cap_revoked(
                        "stub has been disposed",
                    ));
                }
                let mut extended = binding.path.clone();
                extended.extend(path);
                StubHook::import(binding.session.clone(), binding.id, extended, binding.is_promise)
            }

            HookKind::Promise(binding) => {
                let rx = binding.rx.clone();
                let (resolver, promise) = StubHook::promise_pair();
                tokio::spawn(async move {
                    match PromiseBinding::wait(rx).await {
                        Ok(hook) => resolver.resolve(hook.get(path)),
                        Err(error) => resolver.reject(error),
                    }
                });
                promise
            }
        }
    }

    /// Resolve the hook to a concrete payload.
    pub fn pull(&self) -> BoxFuture<'static, Result<Payload, RpcError>> {
        let this = self.clone();
        async move {
            match &this.inner.kind {
                HookKind::Error(error) => Err(error.clone()),

                HookKind::Payload(payload) => Ok(payload.clone()),

                // A target pulls as a stub onto itself.
                HookKind::Target(_) => Ok(Payload::owned(Value::Stub(Stub::from_hook(
                    this.dup(),
                )))),

                HookKind::Import(binding) => {
                    let core = binding
                        .session
                        .upgrade()
                        .ok_or_else(|| RpcError::canceled("session closed"))?;
                    if binding.path.is_empty() {
                        let resolved = core.pull_import(binding.id).await?;
                        Ok(Payload::owned(resolved))
                    } else {
                        // Let the peer perform the navigation: a derived
                        // reference materializes as its own pushed pipeline.
                        // The temporary import is released once resolved.
                        let nav = core.pipeline_navigate(binding);
                        let result = nav.pull().await;
                        nav.dispose();
                        result
                    }
                }

                HookKind::Promise(binding) => {
                    let hook = PromiseBinding::wait(binding.rx.clone()).await?;
                    hook.pull().await
                }
            }
        }
        .boxed()
    }

    /// Take one more refcount on the hook.
    pub fn dup(&self) -> StubHook {
        match &self.inner.kind {
            HookKind::Import(binding) => {
                if let Some(core) = binding.session.upgrade() {
                    let _ = core.import_add_ref(binding.id);
                }
            }
            _ => {
                self.inner.refs.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.clone()
    }

    /// Drop one refcount. For imports, the last handle removes the table
    /// entry and emits the release.
    pub fn dispose(&self) {
        match &self.inner.kind {
            HookKind::Import(binding) => {
                if let Some(core) = binding.session.upgrade() {
                    core.release_import(binding.id);
                }
            }
            _ => {
                let before = self.inner.refs.fetch_sub(1, Ordering::SeqCst);
                if before == 1 {
                    trace!(identity = %self.inner.identity, "hook refcount reached zero");
                }
            }
        }
    }
}

impl fmt::Debug for StubHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner.kind {
            HookKind::Error(e) => format!("error:{}", e.code),
            HookKind::Payload(_) => "payload".to_string(),
            HookKind::Target(_) => "target".to_string(),
            HookKind::Import(b) => format!("{}", b.id),
            HookKind::Promise(_) => "promise".to_string(),
        };
        write!(f, "StubHook({})", kind)
    }
}

/// Application handle to a capability. Cloning duplicates the underlying
/// reference; dropping disposes it.
pub struct Stub {
    hook: StubHook,
}

impl Stub {
    pub(crate) fn from_hook(hook: StubHook) -> Self {
        Stub { hook }
    }

    /// Host a new capability: wrap a target so it can travel inside
    /// arguments and results. The serializer exports it on first use.
    pub fn from_target(target: Arc<dyn RpcTarget>) -> Stub {
        Stub::from_hook(StubHook::target(target))
    }

    pub(crate) fn hook(&self) -> &StubHook {
        &self.hook
    }

    /// Invoke a method. Arguments may contain stubs and unresolved promises;
    /// calls on remote stubs are pipelined without waiting.
    pub fn call(&self, path: Vec<PropertyKey>, args: Vec<Value>) -> RpcPromise {
        let payload = Payload::from_params(Value::Array(args));
        RpcPromise::from_hook(self.hook.call(path, payload))
    }

    /// Pipelined property navigation. Nothing is sent until the result is
    /// pulled or used.
    pub fn get(&self, path: Vec<PropertyKey>) -> Stub {
        Stub::from_hook(self.hook.get(path))
    }

    pub fn dup(&self) -> Stub {
        self.clone()
    }

    /// Explicitly drop this handle.
    pub fn dispose(self) {}

    /// Resolve this stub to a plain value.
    pub async fn pull(&self) -> Result<Value, RpcError> {
        self.hook.pull().await.map(|p| p.value)
    }

    pub fn same_capability(&self, other: &Stub) -> bool {
        self.hook.same_hook(&other.hook)
    }
}

impl Clone for Stub {
    fn clone(&self) -> Self {
        Stub {
            hook: self.hook.dup(),
        }
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        self.hook.dispose();
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stub({:?})", self.hook)
    }
}

/// Application handle to a pending result. Like a stub, but its resolution
/// is awaited before the value reaches the application.
pub struct RpcPromise {
    hook: StubHook,
}

impl RpcPromise {
    pub(crate) fn from_hook(hook: StubHook) -> Self {
        RpcPromise { hook }
    }

    pub(crate) fn hook(&self) -> &StubHook {
        &self.hook
    }

    /// Await the resolution, consuming the handle.
    pub async fn await_value(self) -> Result<Value, RpcError> {
        self.hook.pull().await.map(|p| p.value)
    }

    /// Pipelined navigation into the eventual result.
    pub fn get(&self, path: Vec<PropertyKey>) -> RpcPromise {
        RpcPromise::from_hook(self.hook.get(path))
    }

    /// Pipelined call on the eventual result.
    pub fn call(&self, path: Vec<PropertyKey>, args: Vec<Value>) -> RpcPromise {
        let payload = Payload::from_params(Value::Array(args));
        RpcPromise::from_hook(self.hook.call(path, payload))
    }

    /// A stub sharing this promise's underlying reference.
    pub fn to_stub(&self) -> Stub {
        Stub::from_hook(self.hook.dup())
    }

    pub fn same_capability(&self, other: &RpcPromise) -> bool {
        self.hook.same_hook(&other.hook)
    }
}

impl Clone for RpcPromise {
    fn clone(&self) -> Self {
        RpcPromise {
            hook: self.hook.dup(),
        }
    }
}

impl Drop for RpcPromise {
    fn drop(&mut self) {
        self.hook.dispose();
    }
}

impl fmt::Debug for RpcPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcPromise({:?})", self.hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use indexmap::IndexMap;

    fn payload_hook() -> StubHook {
        let mut user = IndexMap::new();
        user.insert("id".to_string(), Value::from("u_1"));
        user.insert("name".to_string(), Value::from("Ada"));
        let mut map = IndexMap::new();
        map.insert("user".to_string(), Value::Object(user));
        StubHook::payload(Payload::owned(Value::Object(map)))
    }

    #[tokio::test]
    async fn error_hook_propagates_through_operations() {
        let hook = StubHook::error(RpcError::not_found("gone"));
        let chained = hook
            .get(vec!["a".into()])
            .call(vec!["b".into()], Payload::owned(Value::Array(vec![])));
        let err = chained.pull().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.message, "gone");
    }

    #[tokio::test]
    async fn payload_hook_navigates() {
        let hook = payload_hook();
        let name = hook.get(vec!["user".into(), "name".into()]);
        let payload = name.pull().await.unwrap();
        assert_eq!(payload.value, Value::from("Ada"));
    }

    #[tokio::test]
    async fn payload_hook_missing_key_is_not_found() {
        let hook = payload_hook();
        let missing = hook.get(vec!["user".into(), "email".into()]);
        let err = missing.pull().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn payload_hook_rejects_calls_on_plain_values() {
        let hook = payload_hook();
        let result = hook.call(
            vec!["user".into(), "name".into()],
            Payload::owned(Value::Array(vec![])),
        );
        let err = result.pull().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[derive(Debug)]
    struct Doubler;

    #[async_trait::async_trait]
    impl RpcTarget for Doubler {
        async fn call(&self, path: &[PropertyKey], args: Vec<Value>) -> Result<Value, RpcError> {
            match path {
                [PropertyKey::String(name)] if name == "double" => match args.first() {
                    Some(Value::Number(n)) => {
                        let doubled = n.as_i64().unwrap_or(0) * 2;
                        Ok(Value::from(doubled))
                    }
                    _ => Err(RpcError::bad_request("expected a number")),
                },
                _ => Err(RpcError::not_found("no such method")),
            }
        }

        async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
            match property {
                "kind" => Ok(Value::from("doubler")),
                _ => Err(RpcError::not_found("no such property")),
            }
        }
    }

    #[tokio::test]
    async fn target_hook_dispatches_calls() {
        let hook = StubHook::target(Arc::new(Doubler));
        let result = hook.call(
            vec!["double".into()],
            Payload::from_params(Value::Array(vec![Value::from(21)])),
        );
        let payload = result.pull().await.unwrap();
        assert_eq!(payload.value, Value::from(42));
    }

    #[tokio::test]
    async fn target_hook_converts_user_errors() {
        let hook = StubHook::target(Arc::new(Doubler));
        let result = hook.call(
            vec!["missing".into()],
            Payload::owned(Value::Array(vec![])),
        );
        let err = result.pull().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn target_hook_serves_properties() {
        let hook = StubHook::target(Arc::new(Doubler));
        let kind = hook.get(vec!["kind".into()]);
        assert_eq!(kind.pull().await.unwrap().value, Value::from("doubler"));
    }

    #[tokio::test]
    async fn target_hook_pulls_as_stub() {
        let hook = StubHook::target(Arc::new(Doubler));
        let payload = hook.pull().await.unwrap();
        assert!(matches!(payload.value, Value::Stub(_)));
    }

    #[tokio::test]
    async fn promise_hook_chains_operations() {
        let (resolver, promise) = StubHook::promise_pair();
        let chained = promise.get(vec!["user".into(), "id".into()]);
        resolver.resolve(payload_hook());
        let payload = chained.pull().await.unwrap();
        assert_eq!(payload.value, Value::from("u_1"));
    }

    #[tokio::test]
    async fn dropped_resolver_cancels_waiters() {
        let (resolver, promise) = StubHook::promise_pair();
        drop(resolver);
        let err = promise.pull().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Canceled);
    }
}
