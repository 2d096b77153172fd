//! # sealwire
//!
//! A secure byte-stream endpoint adapter: wraps any byte transport with a
//! pluggable cryptographic framer, so applications read and write
//! plaintext while only authenticated frames touch the wire.
//!
//! ## Architecture
//!
//! - **Endpoint contract** ([`transport::ByteStreamEndpoint`]): completion
//!   callbacks with by-value buffer handoff; at most one read and one
//!   write in flight.
//! - **Framers** ([`framer`]): either a stateful byte pump
//!   ([`framer::FrameProtector`]) or a slice-buffer protector
//!   ([`framer::ZeroCopyProtector`]).
//! - **Secure endpoint** ([`endpoint::SecureEndpoint`]): composes a framer
//!   with a wrapped transport, preserving the transport's callback shape.
//! - **Memory** ([`memory`]): staging slices are reserved from a shared
//!   quota; a benign reclaimer returns them under pressure.
//!
//! ## Example
//!
//! ```ignore
//! use sealwire::{ChannelConfig, Framer, MemoryQuota, SecureEndpoint, StreamEndpoint};
//! use sealwire::framer::fake::FakeProtector;
//!
//! let (a, _b) = StreamEndpoint::pair(64 * 1024);
//! let config = ChannelConfig::new(MemoryQuota::new(1 << 20));
//! let secure = SecureEndpoint::new(
//!     Framer::serialized(FakeProtector::new()),
//!     Box::new(a),
//!     sealwire::SliceBuffer::new(),
//!     &config,
//! );
//! // secure.read(...) / secure.write(...) move plaintext; `_b` sees frames.
//! ```

pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod exec;
pub mod framer;
pub mod memory;
pub mod transport;

pub use buffer::SliceBuffer;
pub use endpoint::{ChannelConfig, SecureEndpoint, STAGING_BUFFER_SIZE};
pub use error::{Result, SealwireError};
pub use exec::ExecCtx;
pub use framer::{Framer, FramerStatus};
pub use memory::{MemoryQuota, ReclamationPass};
pub use transport::{
    ByteStreamEndpoint, PollerId, PollerSetId, ReadDone, StreamEndpoint, WriteArgs, WriteDone,
    DEFAULT_MAX_FRAME_SIZE,
};
