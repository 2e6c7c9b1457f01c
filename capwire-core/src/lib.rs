//! Session kernel for the Cap'n Web RPC protocol.
//!
//! Two symmetric peers exchange references to live objects, invoke methods
//! on them, chain dependent calls into a single round trip, and dispose of
//! references through explicit refcounting. This crate is the kernel: the
//! wire codec, the import/export tables, the hook evaluation graph, the
//! push/pull/resolve/reject/release/abort loop, the pipeline batch, and the
//! remap sub-language. Transports plug in through [`transport::RpcTransport`].

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{ErrorCode, RpcError};
pub use protocol::{
    Batch, Expression, ExportId, ImportId, Message, Payload, PropertyKey, Provenance, RpcPromise,
    RpcSession, SessionOptions, SessionState, Stub, Value,
};
pub use transport::{RpcTransport, TransportError};

use async_trait::async_trait;

/// A user-supplied capability implementation. Targets are hosted in the
/// export table and invoked by the session kernel; one target may be called
/// concurrently from several sessions, and the kernel imposes no
/// synchronization of its own.
#[async_trait]
pub trait RpcTarget: Send + Sync + std::fmt::Debug {
    /// Invoke a method. `path` is the navigation path the caller used;
    /// for plain calls it is a single method name.
    async fn call(&self, path: &[PropertyKey], args: Vec<Value>) -> Result<Value, RpcError>;

    /// Read a named property.
    async fn get_property(&self, property: &str) -> Result<Value, RpcError>;
}
