//! Byte-stream endpoint contract and concrete transports.
//!
//! [`ByteStreamEndpoint`] is the completion-callback shape shared by plain
//! and secure endpoints: a caller cannot distinguish one from the other
//! except by looking at the bytes on each side. Buffers travel by value —
//! a read hands its destination in and receives it back through the
//! completion, a write hands its source in and receives it back drained —
//! so ownership across the suspension point is explicit.

mod stream;

pub use stream::StreamEndpoint;

use crate::buffer::SliceBuffer;
use crate::error::Result;

/// Default advisory cap on the size of a single emitted wire frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16384;

/// Completion for a read: the destination buffer (holding whatever was
/// delivered) and the outcome.
pub type ReadDone = Box<dyn FnOnce(SliceBuffer, Result<()>) + Send>;

/// Completion for a write: the source buffer (returned for reuse; contents
/// unspecified) and the outcome.
pub type WriteDone = Box<dyn FnOnce(SliceBuffer, Result<()>) + Send>;

/// Per-write knobs forwarded down the endpoint stack.
#[derive(Debug, Clone, Copy)]
pub struct WriteArgs {
    /// Advisory maximum size of any single frame put on the wire.
    pub max_frame_size: usize,
}

impl Default for WriteArgs {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Opaque handle to an I/O readiness driver an endpoint can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerId(pub u64);

/// Opaque handle to a set of readiness drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerSetId(pub u64);

/// An asynchronous byte-stream endpoint with single-shot completions.
///
/// At most one read and at most one write may be in flight at a time; the
/// completion for each fires exactly once, on whichever thread finishes the
/// operation — possibly before the submitting call returns.
pub trait ByteStreamEndpoint: Send + Sync {
    /// Submit a read. Delivered bytes are appended to `dst`, which comes
    /// back through `done`. `min_progress` asks the endpoint not to
    /// complete until at least that many bytes are available, reducing
    /// spurious short reads; `urgent` asks for expedited wakeup.
    fn read(&self, dst: SliceBuffer, done: ReadDone, urgent: bool, min_progress: usize);

    /// Submit a write of every byte in `src`. The buffer comes back
    /// through `done` once the endpoint no longer needs it.
    fn write(&self, src: SliceBuffer, done: WriteDone, args: WriteArgs);

    /// Tear the endpoint down. In-flight completions still fire (with an
    /// error where delivery can no longer be trusted). Must be called at
    /// most once.
    fn destroy(&self);

    /// Attach to a readiness driver. No-op for endpoints that do not use
    /// driver-based readiness.
    fn add_to_pollset(&self, _pollset: PollerId) {}

    /// Attach to a driver set.
    fn add_to_pollset_set(&self, _set: PollerSetId) {}

    /// Detach from a driver set.
    fn delete_from_pollset_set(&self, _set: PollerSetId) {}

    /// Remote peer description.
    fn peer(&self) -> String;

    /// Local address description.
    fn local_address(&self) -> String;

    /// Underlying file descriptor, if the transport has one.
    fn fd(&self) -> Option<i32> {
        None
    }

    /// Whether the transport can report fine-grained delivery errors.
    fn can_track_err(&self) -> bool {
        false
    }
}
