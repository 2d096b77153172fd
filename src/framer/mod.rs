//! Framer capability: converts between plaintext and authenticated frames.
//!
//! Two equivalent capabilities with different APIs:
//!
//! - [`FrameProtector`] — a stateful byte pump. `protect` and `unprotect`
//!   consume input bytes and emit output bytes through caller-provided
//!   windows; `protect_flush` drains internally buffered state.
//! - [`ZeroCopyProtector`] — operates directly on slice buffers, emitting
//!   output frames bounded by its configured maximum frame size.
//!
//! The [`Framer`] variant selects the capability once per endpoint. For the
//! byte-pump capability it also encodes whether calls must be serialized:
//! a protector that does not advertise internal thread safety is wrapped in
//! a mutex ([`CopyingFramer::Serialized`]); one that does is called
//! directly ([`CopyingFramer::Shared`]).

pub mod fake;

use parking_lot::Mutex;
use thiserror::Error;

use crate::buffer::SliceBuffer;

/// Non-OK status reported by a framer. A framer that reports a status is
/// considered poisoned; the caller is expected to destroy the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramerStatus {
    /// Inbound bytes failed authentication or framing checks.
    #[error("data corrupted")]
    DataCorrupted,
    /// Not enough data to complete the operation.
    #[error("incomplete data")]
    IncompleteData,
    /// An argument violated the framer's contract.
    #[error("invalid argument")]
    InvalidArgument,
    /// The framer ran out of internal resources.
    #[error("out of resources")]
    OutOfResources,
    /// The framer was used before it was ready.
    #[error("failed precondition")]
    FailedPrecondition,
    /// Internal framer failure.
    #[error("internal error")]
    Internal,
}

/// Progress report from one byte-pump call: how much input was consumed and
/// how much output was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pump {
    /// Input bytes consumed.
    pub consumed: usize,
    /// Output bytes written.
    pub written: usize,
}

/// Progress report from one flush call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flush {
    /// Output bytes written.
    pub written: usize,
    /// Bytes still buffered inside the framer after this call.
    pub pending: usize,
}

/// Stateful byte-pump framer ("frame protector").
///
/// Implementations may buffer internally in both directions. Every call
/// given non-empty input and non-empty output space must make progress by
/// consuming input or producing output; the endpoint's drain loops rely on
/// this to terminate.
pub trait FrameProtector: Send {
    /// Feed plaintext, producing zero or more frame bytes into `out`.
    fn protect(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus>;

    /// Drain buffered frame bytes into `out`. Callers repeat until
    /// `pending == 0`.
    fn protect_flush(&mut self, out: &mut [u8]) -> Result<Flush, FramerStatus>;

    /// Feed frame bytes, producing zero or more plaintext bytes into `out`.
    fn unprotect(&mut self, frames: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus>;
}

/// A byte-pump framer that is internally thread-safe: concurrent calls from
/// the read and write paths are allowed without external locking.
pub trait SharedFrameProtector: Send + Sync {
    /// See [`FrameProtector::protect`].
    fn protect(&self, plaintext: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus>;

    /// See [`FrameProtector::protect_flush`].
    fn protect_flush(&self, out: &mut [u8]) -> Result<Flush, FramerStatus>;

    /// See [`FrameProtector::unprotect`].
    fn unprotect(&self, frames: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus>;
}

/// Any byte-pump protector becomes thread-safe by serializing behind a
/// mutex.
impl<P: FrameProtector> SharedFrameProtector for Mutex<P> {
    fn protect(&self, plaintext: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus> {
        self.lock().protect(plaintext, out)
    }

    fn protect_flush(&self, out: &mut [u8]) -> Result<Flush, FramerStatus> {
        self.lock().protect_flush(out)
    }

    fn unprotect(&self, frames: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus> {
        self.lock().unprotect(frames, out)
    }
}

/// Slice-buffer framer. `protect` and `unprotect` take input buffers by
/// mutable reference and drain them; implementations keep independent state
/// per direction so the read and write paths may run concurrently.
pub trait ZeroCopyProtector: Send + Sync {
    /// Frame the contents of `plaintext` (drained) into `out`.
    fn protect(&self, plaintext: &mut SliceBuffer, out: &mut SliceBuffer)
        -> Result<(), FramerStatus>;

    /// Unframe the contents of `frames` (drained) into `out`.
    ///
    /// Returns the estimated number of ciphertext bytes still needed to
    /// complete the frame in flight, for use as a minimum-progress hint on
    /// the next transport read.
    fn unprotect(&self, frames: &mut SliceBuffer, out: &mut SliceBuffer)
        -> Result<usize, FramerStatus>;
}

/// The framer attached to a secure endpoint. Exactly one variant per
/// endpoint; the locking discipline for byte-pump calls is part of the
/// type.
pub enum Framer {
    /// Byte-pump framer.
    Copying(CopyingFramer),
    /// Slice-buffer framer.
    ZeroCopy(Box<dyn ZeroCopyProtector>),
}

/// Byte-pump framer plus its concurrency discipline.
pub enum CopyingFramer {
    /// Calls are serialized behind a mutex shared by the read and write
    /// paths.
    Serialized(Mutex<Box<dyn FrameProtector>>),
    /// The protector advertises internal thread safety; calls go straight
    /// through.
    Shared(Box<dyn SharedFrameProtector>),
}

impl Framer {
    /// Wrap a byte-pump protector that requires external serialization.
    pub fn serialized<P: FrameProtector + 'static>(protector: P) -> Self {
        Framer::Copying(CopyingFramer::Serialized(Mutex::new(Box::new(protector))))
    }

    /// Wrap an internally thread-safe byte-pump protector.
    pub fn shared<P: SharedFrameProtector + 'static>(protector: P) -> Self {
        Framer::Copying(CopyingFramer::Shared(Box::new(protector)))
    }

    /// Wrap a slice-buffer protector.
    pub fn zero_copy<P: ZeroCopyProtector + 'static>(protector: P) -> Self {
        Framer::ZeroCopy(Box::new(protector))
    }

    /// Whether this is the slice-buffer capability.
    pub fn is_zero_copy(&self) -> bool {
        matches!(self, Framer::ZeroCopy(_))
    }
}

impl CopyingFramer {
    /// Dispatch one protect pump call under the variant's discipline.
    pub fn protect(&self, plaintext: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus> {
        match self {
            CopyingFramer::Serialized(p) => p.lock().protect(plaintext, out),
            CopyingFramer::Shared(p) => p.protect(plaintext, out),
        }
    }

    /// Dispatch one flush call under the variant's discipline.
    pub fn protect_flush(&self, out: &mut [u8]) -> Result<Flush, FramerStatus> {
        match self {
            CopyingFramer::Serialized(p) => p.lock().protect_flush(out),
            CopyingFramer::Shared(p) => p.protect_flush(out),
        }
    }

    /// Dispatch one unprotect pump call under the variant's discipline.
    pub fn unprotect(&self, frames: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus> {
        match self {
            CopyingFramer::Serialized(p) => p.lock().unprotect(frames, out),
            CopyingFramer::Shared(p) => p.unprotect(frames, out),
        }
    }
}
