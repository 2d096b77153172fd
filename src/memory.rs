//! Memory quota, reservations, and reclamation.
//!
//! A [`MemoryQuota`] tracks byte usage against a soft limit. Endpoints hold
//! a per-connection [`MemoryOwner`] that issues RAII [`MemoryReservation`]s
//! and quota-backed writable slices. The quota is non-strict: reservations
//! always succeed, but once usage exceeds the limit the quota is
//! *pressured* and dispatches registered reclaimers, one at a time, through
//! the ambient execution context so a sweep never runs on a thread that is
//! still holding endpoint locks.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::exec::ExecCtx;

/// Reclamation urgency. Benign reclaimers give up discretionary memory;
/// higher passes are progressively more disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReclamationPass {
    /// Free memory the owner can cheaply re-acquire later.
    Benign,
    /// Free memory attached to idle activity.
    Idle,
    /// Free memory even if it aborts in-flight work.
    Destructive,
}

/// Token handed to a reclaimer that is actually sweeping. Dropping it marks
/// the sweep complete.
#[derive(Debug)]
pub struct ReclamationSweep {
    _private: (),
}

/// One-shot reclaimer callback. Receives `Some(sweep)` when actually
/// reclaiming, `None` when the registration was cancelled.
pub type ReclaimFn = Box<dyn FnOnce(Option<ReclamationSweep>) + Send>;

struct ReclaimerEntry {
    owner: u64,
    pass: ReclamationPass,
    f: ReclaimFn,
}

struct QuotaState {
    limit: usize,
    used: AtomicUsize,
    next_owner: AtomicU64,
    reclaimers: Mutex<Vec<ReclaimerEntry>>,
}

impl QuotaState {
    fn pressured(&self) -> bool {
        self.used.load(Ordering::Relaxed) > self.limit
    }

    /// Dispatch at most one reclaimer (lowest pass first) if pressured.
    fn maybe_reclaim(self: &Arc<Self>) {
        if !self.pressured() {
            return;
        }
        let entry = {
            let mut reclaimers = self.reclaimers.lock();
            if reclaimers.is_empty() {
                None
            } else {
                let mut best = 0;
                for (i, e) in reclaimers.iter().enumerate() {
                    if e.pass < reclaimers[best].pass {
                        best = i;
                    }
                }
                Some(reclaimers.swap_remove(best))
            }
        };
        if let Some(entry) = entry {
            tracing::debug!(pass = ?entry.pass, "memory quota pressured, dispatching reclaimer");
            ExecCtx::run(move || (entry.f)(Some(ReclamationSweep { _private: () })));
        }
    }
}

/// Cloneable handle to a byte quota shared by every direction of a
/// connection (and, typically, by every connection on a channel).
#[derive(Clone)]
pub struct MemoryQuota {
    state: Arc<QuotaState>,
}

impl MemoryQuota {
    /// Create a quota with a soft `limit` in bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(QuotaState {
                limit,
                used: AtomicUsize::new(0),
                next_owner: AtomicU64::new(1),
                reclaimers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create an effectively unbounded quota.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.state.used.load(Ordering::Relaxed)
    }

    /// The configured soft limit.
    pub fn limit(&self) -> usize {
        self.state.limit
    }

    /// Whether usage currently exceeds the limit.
    pub fn pressured(&self) -> bool {
        self.state.pressured()
    }

    /// Mint a per-connection owner drawing from this quota.
    pub fn create_owner(&self) -> MemoryOwner {
        MemoryOwner {
            state: self.state.clone(),
            id: self.state.next_owner.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemoryQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQuota")
            .field("limit", &self.state.limit)
            .field("used", &self.used())
            .finish()
    }
}

/// Per-connection reservation source. Owns the connection's reclaimer
/// registrations; [`MemoryOwner::reset`] cancels them.
pub struct MemoryOwner {
    state: Arc<QuotaState>,
    id: u64,
}

impl MemoryOwner {
    /// Reserve `n` bytes. The reservation is released when dropped.
    pub fn reserve(&self, n: usize) -> MemoryReservation {
        self.state.used.fetch_add(n, Ordering::Relaxed);
        self.state.maybe_reclaim();
        MemoryReservation {
            state: self.state.clone(),
            bytes: n,
        }
    }

    /// Allocate a zeroed writable slice of `n` bytes backed by a
    /// reservation. Regions frozen out of the slice keep the reservation
    /// alive until the last of them drops.
    pub fn make_slice(&self, n: usize) -> OwnedSlice {
        let reservation = Arc::new(self.reserve(n));
        let mut data = BytesMut::with_capacity(n);
        data.resize(n, 0);
        OwnedSlice {
            data,
            reservation: Some(reservation),
        }
    }

    /// Register a one-shot reclaimer for this owner.
    ///
    /// Under pressure the callback runs with `Some(sweep)` through the
    /// ambient execution context; if cancelled by [`MemoryOwner::reset`]
    /// first, it runs with `None`.
    pub fn post_reclaimer(&self, pass: ReclamationPass, f: ReclaimFn) {
        self.state.reclaimers.lock().push(ReclaimerEntry {
            owner: self.id,
            pass,
            f,
        });
        self.state.maybe_reclaim();
    }

    /// Cancel every reclaimer registered by this owner, invoking each with
    /// `None`.
    pub fn reset(&self) {
        let cancelled: Vec<ReclaimerEntry> = {
            let mut reclaimers = self.state.reclaimers.lock();
            let mut kept = Vec::new();
            let mut cancelled = Vec::new();
            for entry in reclaimers.drain(..) {
                if entry.owner == self.id {
                    cancelled.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *reclaimers = kept;
            cancelled
        };
        for entry in cancelled {
            (entry.f)(None);
        }
    }
}

impl std::fmt::Debug for MemoryOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOwner").field("id", &self.id).finish()
    }
}

/// RAII deduction from a quota; usage is returned on drop.
pub struct MemoryReservation {
    state: Arc<QuotaState>,
    bytes: usize,
}

impl std::fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.state.used.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

/// Owner for frozen slice regions: keeps the backing reservation alive for
/// the lifetime of the `Bytes` handle.
struct Backing {
    data: Bytes,
    _reservation: Arc<MemoryReservation>,
}

impl AsRef<[u8]> for Backing {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// A writable byte region backed by a quota reservation.
///
/// Used as the staging area between a copying framer and the slice buffers:
/// the framer writes into the region, and filled or dirty prefixes are
/// frozen into `Bytes` and appended to an output buffer.
#[derive(Debug, Default)]
pub struct OwnedSlice {
    data: BytesMut,
    reservation: Option<Arc<MemoryReservation>>,
}

impl OwnedSlice {
    /// A zero-length slice with no reservation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Writable length of the region.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the region is zero-length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Mutable view of the whole region.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Freeze the first `n` bytes into a `Bytes`, shrinking the region to
    /// the remainder. The frozen head shares this slice's reservation.
    ///
    /// # Panics
    ///
    /// Panics if `n > len()`.
    pub fn split_prefix(&mut self, n: usize) -> Bytes {
        let head = self.data.split_to(n).freeze();
        match &self.reservation {
            Some(res) => Bytes::from_owner(Backing {
                data: head,
                _reservation: res.clone(),
            }),
            None => head,
        }
    }

    /// Freeze the entire region into a `Bytes` carrying the reservation.
    pub fn into_bytes(self) -> Bytes {
        let frozen = self.data.freeze();
        match self.reservation {
            Some(res) => Bytes::from_owner(Backing {
                data: frozen,
                _reservation: res,
            }),
            None => frozen,
        }
    }
}
