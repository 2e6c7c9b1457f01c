// The session kernel, bottom up: IDs and the wire grammar, then values and
// payload provenance, then the hook graph and the tables it lives in, and
// finally the session state machine with its batch and resume companions.

pub mod batch;
pub mod expression;
pub mod hooks;
pub mod ids;
pub mod message;
pub mod payload;
pub mod resume;
pub mod session;
pub mod value;

pub(crate) mod parser;
pub(crate) mod remap;
pub(crate) mod serializer;
pub(crate) mod tables;

pub use batch::Batch;
pub use expression::{
    ErrorExpression, Expression, PropertyKey, ReferenceExpression, RemapExpression, WireError,
};
pub use hooks::{RpcPromise, Stub};
pub use ids::{AllocatorWatermarks, ExportId, IdAllocator, ImportId};
pub use message::{parse_ndjson, to_ndjson, Message};
pub use payload::{Payload, Provenance};
pub use resume::{
    ExportSnapshot, ImportSnapshot, ResumeToken, ResumeTokenError, ResumeTokenManager,
    SessionSnapshot,
};
pub use session::{RpcSession, SessionOptions, SessionState};
pub use value::Value;
