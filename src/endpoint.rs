//! Secure endpoint: a byte-stream endpoint with transparent framing.
//!
//! Wraps an owned [`ByteStreamEndpoint`] with a [`Framer`], converting
//! plaintext write payloads into authenticated frames on the wire and
//! inbound frames back into plaintext. The secure endpoint exposes the
//! same endpoint shape as the transport it wraps; callers see plaintext,
//! the wire sees frames.
//!
//! # Concurrency
//!
//! The read and write paths run independently, each under its own mutex.
//! Byte-pump framer calls are additionally serialized when the protector
//! does not advertise internal thread safety (see [`CopyingFramer`]). A
//! completion may fire re-entrantly before `read` returns when leftover
//! handshake bytes satisfy it synchronously.
//!
//! # Memory
//!
//! Staging slices for the byte-pump paths are reserved from the channel's
//! memory quota. Under quota pressure a benign reclaimer drops both
//! staging slices; they are re-reserved on next use.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::buffer::SliceBuffer;
use crate::error::{Result, SealwireError};
use crate::exec::ExecCtx;
use crate::framer::{CopyingFramer, Flush, Framer, FramerStatus, Pump};
use crate::memory::{MemoryOwner, MemoryQuota, MemoryReservation, OwnedSlice, ReclamationPass};
use crate::transport::{
    ByteStreamEndpoint, PollerId, PollerSetId, ReadDone, WriteArgs, WriteDone,
};

/// Size of the owned working area between a byte-pump framer and the slice
/// buffers, per direction.
pub const STAGING_BUFFER_SIZE: usize = 8192;

/// Channel-level configuration a secure endpoint is constructed from.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Quota that staging slices and the endpoint's own footprint are
    /// reserved against.
    pub quota: MemoryQuota,
}

impl ChannelConfig {
    /// Configuration drawing from `quota`.
    pub fn new(quota: MemoryQuota) -> Self {
        Self { quota }
    }
}

struct PendingRead {
    dst: SliceBuffer,
    done: ReadDone,
}

struct PendingWrite {
    src: SliceBuffer,
    done: WriteDone,
}

struct ReadState {
    /// Handshake residue consumed before the first wrapped read.
    leftover: SliceBuffer,
    /// Reusable ciphertext buffer handed to the wrapped endpoint.
    source: SliceBuffer,
    /// Byte-pump working area; empty for zero-copy framers.
    staging: OwnedSlice,
    pending: Option<PendingRead>,
}

struct WriteState {
    /// Byte-pump working area; empty for zero-copy framers.
    staging: OwnedSlice,
    /// Reusable frame buffer handed to the wrapped endpoint.
    output: SliceBuffer,
    /// Scratch for chunking zero-copy writes to `max_frame_size`.
    framer_staging: SliceBuffer,
    pending: Option<PendingWrite>,
}

struct Core {
    framer: Framer,
    /// Cleared under `read` while destroying, so a racing read completion
    /// observes the shutdown. Own lock so pass-throughs stay lock-ordered
    /// below the path mutexes.
    wrapped: RwLock<Option<Arc<dyn ByteStreamEndpoint>>>,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    /// Last estimate of the bytes needed to finish the frame in flight;
    /// forwarded to wrapped reads.
    min_progress: AtomicUsize,
    memory_owner: MemoryOwner,
    _self_reservation: MemoryReservation,
    has_posted_reclaimer: AtomicBool,
}

/// A framing byte-stream endpoint. See the module docs.
///
/// Cloning is not exposed: this handle is the caller's single strong
/// reference. In-flight operations and reclaimer registrations hold their
/// own references internally, so the endpoint outlives the handle until
/// the last completion fires.
pub struct SecureEndpoint {
    core: Arc<Core>,
}

impl SecureEndpoint {
    /// Wrap `wrapped` with `framer`.
    ///
    /// `leftover` carries ciphertext already received during the handshake;
    /// it is unframed by the first read before any wrapped read is issued.
    pub fn new(
        framer: Framer,
        wrapped: Box<dyn ByteStreamEndpoint>,
        leftover: SliceBuffer,
        config: &ChannelConfig,
    ) -> SecureEndpoint {
        let memory_owner = config.quota.create_owner();
        let self_reservation = memory_owner.reserve(mem::size_of::<Core>());
        let (read_staging, write_staging) = if framer.is_zero_copy() {
            (OwnedSlice::empty(), OwnedSlice::empty())
        } else {
            (
                memory_owner.make_slice(STAGING_BUFFER_SIZE),
                memory_owner.make_slice(STAGING_BUFFER_SIZE),
            )
        };
        SecureEndpoint {
            core: Arc::new(Core {
                framer,
                wrapped: RwLock::new(Some(Arc::from(wrapped))),
                read: Mutex::new(ReadState {
                    leftover,
                    source: SliceBuffer::new(),
                    staging: read_staging,
                    pending: None,
                }),
                write: Mutex::new(WriteState {
                    staging: write_staging,
                    output: SliceBuffer::new(),
                    framer_staging: SliceBuffer::new(),
                    pending: None,
                }),
                min_progress: AtomicUsize::new(1),
                memory_owner,
                _self_reservation: self_reservation,
                has_posted_reclaimer: AtomicBool::new(false),
            }),
        }
    }
}

enum ReadSubmit {
    /// Handshake residue satisfies the read without touching the wire.
    Leftover(SliceBuffer),
    Wrapped(SliceBuffer, Arc<dyn ByteStreamEndpoint>),
    Closed,
}

impl ByteStreamEndpoint for SecureEndpoint {
    fn read(&self, mut dst: SliceBuffer, done: ReadDone, urgent: bool, _min_progress: usize) {
        dst.reset();
        let core = Arc::clone(&self.core);
        let submit = {
            let mut st = core.read.lock();
            debug_assert!(st.pending.is_none(), "concurrent reads are not allowed");
            st.pending = Some(PendingRead { dst, done });
            if !st.leftover.is_empty() {
                let mut source = SliceBuffer::new();
                source.swap(&mut st.leftover);
                ReadSubmit::Leftover(source)
            } else {
                let mut source = mem::take(&mut st.source);
                source.reset();
                match core.wrapped.read().clone() {
                    Some(wrapped) => ReadSubmit::Wrapped(source, wrapped),
                    None => ReadSubmit::Closed,
                }
            }
        };
        match submit {
            ReadSubmit::Leftover(source) => Core::on_read(core, source, Ok(())),
            ReadSubmit::Wrapped(source, wrapped) => {
                let min_progress = core.min_progress.load(Ordering::Relaxed);
                let cb_core = Arc::clone(&core);
                wrapped.read(
                    source,
                    Box::new(move |source, result| Core::on_read(cb_core, source, result)),
                    urgent,
                    min_progress,
                );
            }
            ReadSubmit::Closed => Core::on_read(core, SliceBuffer::new(), Err(SealwireError::Shutdown)),
        }
    }

    fn write(&self, mut src: SliceBuffer, done: WriteDone, args: WriteArgs) {
        let core = Arc::clone(&self.core);
        let mut framer_result: std::result::Result<(), FramerStatus> = Ok(());
        let mut output;
        {
            let mut st = core.write.lock();
            debug_assert!(st.pending.is_none(), "concurrent writes are not allowed");
            output = mem::take(&mut st.output);
            output.reset();

            match &core.framer {
                Framer::ZeroCopy(protector) => {
                    // Chunk the input to `max_frame_size` so the protector
                    // cannot emit frames larger than requested.
                    while src.len() > args.max_frame_size && framer_result.is_ok() {
                        src.move_first_n_into(args.max_frame_size, &mut st.framer_staging);
                        framer_result = protector.protect(&mut st.framer_staging, &mut output);
                    }
                    if framer_result.is_ok() && !src.is_empty() {
                        framer_result = protector.protect(&mut src, &mut output);
                    }
                    st.framer_staging.reset();
                }
                Framer::Copying(protector) => {
                    framer_result =
                        protect_source(&core, &mut st.staging, &src, &mut output, protector);
                }
            }

            // The zero-copy path drains `src`; normalize the byte-pump path
            // too so the buffer handed back through the completion is empty
            // regardless of framer variant.
            src.reset();

            match framer_result {
                Err(status) => {
                    output.reset();
                    st.output = output;
                    drop(st);
                    ExecCtx::run(move || done(src, Err(SealwireError::Wrap(status))));
                    return;
                }
                Ok(()) => {
                    st.pending = Some(PendingWrite { src, done });
                }
            }
        }

        // The in-flight reference keeps `output` owned until the wrapped
        // write completes and hands it back.
        let wrapped = core.wrapped.read().clone();
        match wrapped {
            Some(wrapped) => {
                let cb_core = Arc::clone(&core);
                wrapped.write(
                    output,
                    Box::new(move |output, result| Core::on_write(cb_core, output, result)),
                    args,
                );
            }
            None => {
                let pending = {
                    let mut st = core.write.lock();
                    output.reset();
                    st.output = output;
                    st.pending.take()
                };
                if let Some(PendingWrite { src, done }) = pending {
                    ExecCtx::run(move || done(src, Err(SealwireError::Shutdown)));
                }
            }
        }
    }

    fn destroy(&self) {
        let wrapped = {
            let _read = self.core.read.lock();
            let wrapped = self.core.wrapped.write().take();
            // Cancels pending reclaimer registrations, releasing the
            // references they hold.
            self.core.memory_owner.reset();
            wrapped
        };
        if let Some(wrapped) = wrapped {
            wrapped.destroy();
        }
    }

    fn add_to_pollset(&self, pollset: PollerId) {
        let wrapped = self.core.wrapped.read().clone();
        if let Some(wrapped) = wrapped {
            wrapped.add_to_pollset(pollset);
        }
    }

    fn add_to_pollset_set(&self, set: PollerSetId) {
        let wrapped = self.core.wrapped.read().clone();
        if let Some(wrapped) = wrapped {
            wrapped.add_to_pollset_set(set);
        }
    }

    fn delete_from_pollset_set(&self, set: PollerSetId) {
        let wrapped = self.core.wrapped.read().clone();
        if let Some(wrapped) = wrapped {
            wrapped.delete_from_pollset_set(set);
        }
    }

    fn peer(&self) -> String {
        let wrapped = self.core.wrapped.read().clone();
        wrapped.map(|w| w.peer()).unwrap_or_default()
    }

    fn local_address(&self) -> String {
        let wrapped = self.core.wrapped.read().clone();
        wrapped.map(|w| w.local_address()).unwrap_or_default()
    }

    fn fd(&self) -> Option<i32> {
        let wrapped = self.core.wrapped.read().clone();
        wrapped.and_then(|w| w.fd())
    }

    fn can_track_err(&self) -> bool {
        let wrapped = self.core.wrapped.read().clone();
        wrapped.map(|w| w.can_track_err()).unwrap_or(false)
    }
}

impl Core {
    /// Completion of a wrapped read (or the leftover fast path).
    fn on_read(core: Arc<Core>, mut source: SliceBuffer, result: Result<()>) {
        let _ctx = ExecCtx::enter();
        let mut transport_result = result;
        let mut framer_result: std::result::Result<(), FramerStatus> = Ok(());
        let completion = {
            let mut st = core.read.lock();
            let Some(PendingRead { mut dst, done }) = st.pending.take() else {
                return;
            };

            // Destroyed after this completion was scheduled with OK status
            // but before it ran: surface a cancellation instead.
            if transport_result.is_ok() && core.wrapped.read().is_none() {
                transport_result = Err(SealwireError::Shutdown);
            }

            match &transport_result {
                Err(_) => dst.reset(),
                Ok(()) => match &core.framer {
                    Framer::ZeroCopy(protector) => {
                        match protector.unprotect(&mut source, &mut dst) {
                            Ok(min_progress) => {
                                core.min_progress
                                    .store(min_progress.max(1), Ordering::Relaxed);
                            }
                            Err(status) => {
                                core.min_progress.store(1, Ordering::Relaxed);
                                framer_result = Err(status);
                            }
                        }
                    }
                    Framer::Copying(protector) => {
                        framer_result = unprotect_source(
                            &core.memory_owner,
                            &mut st.staging,
                            &source,
                            &mut dst,
                            protector,
                        );
                    }
                },
            }

            if framer_result.is_err() {
                // Partial plaintext is never delivered alongside a framer
                // error.
                dst.reset();
            }

            source.reset();
            st.source = source;

            let final_result = match transport_result {
                Err(e) => Err(SealwireError::SecureRead(Box::new(e))),
                Ok(()) => match framer_result {
                    Err(status) => Err(SealwireError::Unwrap(status)),
                    Ok(()) => Ok(()),
                },
            };
            Some((dst, done, final_result))
        };

        if let Some((dst, done, final_result)) = completion {
            tracing::trace!(bytes = dst.len(), ok = final_result.is_ok(), "secure read complete");
            ExecCtx::run(move || done(dst, final_result));
        }
    }

    /// Completion of a wrapped write: restore the output buffer for reuse
    /// and hand the caller's source back.
    fn on_write(core: Arc<Core>, mut output: SliceBuffer, result: Result<()>) {
        let _ctx = ExecCtx::enter();
        tracing::trace!(bytes = output.len(), ok = result.is_ok(), "secure write complete");
        let pending = {
            let mut st = core.write.lock();
            output.reset();
            st.output = output;
            st.pending.take()
        };
        if let Some(PendingWrite { src, done }) = pending {
            ExecCtx::run(move || done(src, result));
        }
    }

    /// Register a benign reclaimer if none is outstanding. The registration
    /// holds a strong reference; destroy breaks the cycle by resetting the
    /// memory owner.
    fn maybe_post_reclaimer(core: &Arc<Core>) {
        if core.has_posted_reclaimer.swap(true, Ordering::Relaxed) {
            return;
        }
        let ep = Arc::clone(core);
        core.memory_owner.post_reclaimer(
            ReclamationPass::Benign,
            Box::new(move |sweep| {
                if sweep.is_some() {
                    tracing::debug!("secure endpoint: benign reclamation to free memory");
                    let old_read = {
                        let mut st = ep.read.lock();
                        mem::replace(&mut st.staging, OwnedSlice::empty())
                    };
                    let old_write = {
                        let mut st = ep.write.lock();
                        mem::replace(&mut st.staging, OwnedSlice::empty())
                    };
                    // Returned to the quota outside the locks.
                    drop(old_read);
                    drop(old_write);
                    ep.has_posted_reclaimer.store(false, Ordering::Relaxed);
                }
            }),
        );
    }
}

/// Append the filled staging slice to `output` and reserve a fresh one,
/// registering a reclaimer so the new reservation can be taken back under
/// pressure.
fn flush_write_staging(
    core: &Arc<Core>,
    staging: &mut OwnedSlice,
    dirty: &mut usize,
    output: &mut SliceBuffer,
) {
    let fresh = core.memory_owner.make_slice(STAGING_BUFFER_SIZE);
    output.append(mem::replace(staging, fresh).into_bytes());
    *dirty = 0;
    Core::maybe_post_reclaimer(core);
}

/// Byte-pump write path: feed every input slice through the protector into
/// the staging slice, then flush buffered frame bytes until none remain.
fn protect_source(
    core: &Arc<Core>,
    staging: &mut OwnedSlice,
    src: &SliceBuffer,
    output: &mut SliceBuffer,
    protector: &CopyingFramer,
) -> std::result::Result<(), FramerStatus> {
    let mut dirty = 0usize;
    for plain in src.iter() {
        let mut offset = 0usize;
        while offset < plain.len() {
            let window = &mut staging.as_mut_slice()[dirty..];
            match protector.protect(&plain[offset..], window) {
                Ok(Pump { consumed, written }) => {
                    offset += consumed;
                    dirty += written;
                    if dirty == staging.len() {
                        flush_write_staging(core, staging, &mut dirty, output);
                    }
                }
                Err(status) => {
                    tracing::error!(%status, "encryption error");
                    return Err(status);
                }
            }
        }
    }
    loop {
        let window = &mut staging.as_mut_slice()[dirty..];
        let Flush { written, pending } = protector.protect_flush(window)?;
        dirty += written;
        if dirty == staging.len() {
            flush_write_staging(core, staging, &mut dirty, output);
        }
        if pending == 0 {
            break;
        }
    }
    if dirty > 0 {
        output.append(staging.split_prefix(dirty));
    }
    Ok(())
}

/// Byte-pump read path: pump every source slice through the protector into
/// the staging slice, appending filled slices to `dst`.
///
/// After the staging slice fills, one more call is forced even with no
/// input left so bytes the protector buffered for lack of output space are
/// drained; the loop exits once a call produces no output.
fn unprotect_source(
    memory_owner: &MemoryOwner,
    staging: &mut OwnedSlice,
    source: &SliceBuffer,
    dst: &mut SliceBuffer,
    protector: &CopyingFramer,
) -> std::result::Result<(), FramerStatus> {
    let mut status = Ok(());
    let mut dirty = 0usize;
    let mut keep_looping = false;
    'slices: for encrypted in source.iter() {
        let mut offset = 0usize;
        while offset < encrypted.len() || keep_looping {
            let window = &mut staging.as_mut_slice()[dirty..];
            match protector.unprotect(&encrypted[offset..], window) {
                Ok(Pump { consumed, written }) => {
                    offset += consumed;
                    dirty += written;
                    if dirty == staging.len() {
                        let fresh = memory_owner.make_slice(STAGING_BUFFER_SIZE);
                        dst.append(mem::replace(staging, fresh).into_bytes());
                        dirty = 0;
                        keep_looping = true;
                    } else if written > 0 {
                        keep_looping = true;
                    } else {
                        keep_looping = false;
                    }
                }
                Err(s) => {
                    tracing::error!(status = %s, "decryption error");
                    status = Err(s);
                    break 'slices;
                }
            }
        }
    }
    if dirty > 0 {
        dst.append(staging.split_prefix(dirty));
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::fake::FakeProtector;
    use crate::framer::{FrameProtector, Framer};
    use std::sync::atomic::AtomicUsize;

    /// Wrapped endpoint that records calls and completes writes
    /// synchronously.
    struct RecordingEndpoint {
        reads: AtomicUsize,
        writes: AtomicUsize,
        pollset_adds: Mutex<Vec<PollerId>>,
    }

    impl RecordingEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                pollset_adds: Mutex::new(Vec::new()),
            })
        }
    }

    impl ByteStreamEndpoint for Arc<RecordingEndpoint> {
        fn read(&self, dst: SliceBuffer, done: ReadDone, _urgent: bool, _min_progress: usize) {
            self.reads.fetch_add(1, Ordering::Relaxed);
            done(dst, Err(SealwireError::ConnectionClosed));
        }

        fn write(&self, src: SliceBuffer, done: WriteDone, _args: WriteArgs) {
            self.writes.fetch_add(1, Ordering::Relaxed);
            done(src, Ok(()));
        }

        fn destroy(&self) {}

        fn add_to_pollset(&self, pollset: PollerId) {
            self.pollset_adds.lock().push(pollset);
        }

        fn peer(&self) -> String {
            "recording:peer".into()
        }

        fn local_address(&self) -> String {
            "recording:local".into()
        }

        fn fd(&self) -> Option<i32> {
            Some(42)
        }

        fn can_track_err(&self) -> bool {
            true
        }
    }

    /// Protector that fails every call.
    struct BrokenProtector;

    impl FrameProtector for BrokenProtector {
        fn protect(&mut self, _: &[u8], _: &mut [u8]) -> std::result::Result<Pump, FramerStatus> {
            Err(FramerStatus::Internal)
        }

        fn protect_flush(&mut self, _: &mut [u8]) -> std::result::Result<Flush, FramerStatus> {
            Err(FramerStatus::Internal)
        }

        fn unprotect(&mut self, _: &[u8], _: &mut [u8]) -> std::result::Result<Pump, FramerStatus> {
            Err(FramerStatus::DataCorrupted)
        }
    }

    fn config() -> ChannelConfig {
        ChannelConfig::new(MemoryQuota::new(1 << 20))
    }

    #[test]
    fn test_accessors_pass_through() {
        let inner = RecordingEndpoint::new();
        let ep = SecureEndpoint::new(
            Framer::serialized(FakeProtector::new()),
            Box::new(inner.clone()),
            SliceBuffer::new(),
            &config(),
        );

        assert_eq!(ep.peer(), "recording:peer");
        assert_eq!(ep.local_address(), "recording:local");
        assert_eq!(ep.fd(), Some(42));
        assert!(ep.can_track_err());

        ep.add_to_pollset(PollerId(7));
        assert_eq!(*inner.pollset_adds.lock(), vec![PollerId(7)]);
    }

    #[test]
    fn test_accessors_after_destroy_are_inert() {
        let inner = RecordingEndpoint::new();
        let ep = SecureEndpoint::new(
            Framer::serialized(FakeProtector::new()),
            Box::new(inner),
            SliceBuffer::new(),
            &config(),
        );
        ep.destroy();

        assert_eq!(ep.peer(), "");
        assert_eq!(ep.fd(), None);
        assert!(!ep.can_track_err());
    }

    #[test]
    fn test_wrap_failure_surfaces_without_touching_the_wire() {
        let inner = RecordingEndpoint::new();
        let ep = SecureEndpoint::new(
            Framer::serialized(BrokenProtector),
            Box::new(inner.clone()),
            SliceBuffer::new(),
            &config(),
        );

        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        let mut src = SliceBuffer::new();
        src.append_copy(b"doomed");
        ep.write(
            src,
            Box::new(move |_, res| {
                *r.lock() = Some(res);
            }),
            WriteArgs::default(),
        );

        match result.lock().take() {
            Some(Err(SealwireError::Wrap(FramerStatus::Internal))) => {}
            other => panic!("unexpected completion: {other:?}"),
        }
        assert_eq!(inner.writes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unwrap_failure_delivers_no_plaintext() {
        let inner = RecordingEndpoint::new();
        let ep = SecureEndpoint::new(
            Framer::serialized(BrokenProtector),
            Box::new(inner),
            {
                // Leftover ciphertext triggers the framer synchronously.
                let mut leftover = SliceBuffer::new();
                leftover.append_copy(b"garbage");
                leftover
            },
            &config(),
        );

        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        ep.read(
            SliceBuffer::new(),
            Box::new(move |dst, res| {
                *r.lock() = Some((dst.len(), res));
            }),
            false,
            1,
        );

        let completion = result.lock().take();
        match completion {
            Some((0, Err(SealwireError::Unwrap(FramerStatus::DataCorrupted)))) => {}
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn test_transport_read_error_is_wrapped() {
        let inner = RecordingEndpoint::new();
        let ep = SecureEndpoint::new(
            Framer::serialized(FakeProtector::new()),
            Box::new(inner.clone()),
            SliceBuffer::new(),
            &config(),
        );

        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        ep.read(
            SliceBuffer::new(),
            Box::new(move |dst, res| {
                *r.lock() = Some((dst.len(), res));
            }),
            false,
            1,
        );

        assert_eq!(inner.reads.load(Ordering::Relaxed), 1);
        let completion = result.lock().take();
        match completion {
            Some((0, Err(SealwireError::SecureRead(inner_err)))) => {
                assert!(matches!(*inner_err, SealwireError::ConnectionClosed));
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }
}
