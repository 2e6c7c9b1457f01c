//! Transport adapters for the capwire session kernel.
//!
//! The kernel only knows [`capwire_core::transport::RpcTransport`]; this
//! crate provides the NDJSON codec, a transport over any ordered byte
//! stream, and an in-process pair for tests and examples. HTTP batch,
//! WebSocket, and WebTransport adapters are hosted elsewhere and plug in
//! through the same trait.

pub mod memory;
pub mod ndjson;
pub mod stream;

pub use memory::{pair, MemoryTransport};
pub use ndjson::{CodecError, NdjsonCodec, DEFAULT_MAX_FRAME_SIZE};
pub use stream::StreamTransport;
