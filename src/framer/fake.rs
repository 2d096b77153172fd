//! Fake framers for loopback wiring and tests.
//!
//! The fake wire format is a 4-byte big-endian payload length followed by
//! the payload with every byte XOR-masked, so the two sides of the wire are
//! distinguishable without real cryptography:
//!
//! ```text
//! ┌──────────────┬──────────────────┐
//! │ Length       │ Masked payload   │
//! │ 4 bytes, BE  │ `length` bytes   │
//! └──────────────┴──────────────────┘
//! ```
//!
//! [`FakeProtector`] implements the byte-pump capability with internal
//! buffering in both directions — partial frames survive across calls, and
//! output that did not fit the caller's window is drained by later calls.
//! [`FakeZeroCopyProtector`] implements the slice-buffer capability with a
//! hard cap on emitted wire-frame size.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{Flush, FramerStatus, FrameProtector, Pump, ZeroCopyProtector};
use crate::buffer::SliceBuffer;

/// Length-prefix header size in bytes.
pub const FAKE_HEADER_SIZE: usize = 4;

/// Default maximum payload carried by one fake frame.
pub const DEFAULT_FAKE_FRAME_PAYLOAD: usize = 16384 - FAKE_HEADER_SIZE;

const MASK: u8 = 0x5C;

fn mask_into(payload: &[u8], out: &mut Vec<u8>) {
    out.extend(payload.iter().map(|b| b ^ MASK));
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FAKE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    mask_into(payload, &mut frame);
    frame
}

fn drain_queue(queue: &mut VecDeque<u8>, out: &mut [u8]) -> usize {
    let n = queue.len().min(out.len());
    for (dst, src) in out[..n].iter_mut().zip(queue.drain(..n)) {
        *dst = src;
    }
    n
}

/// Byte-pump fake framer.
pub struct FakeProtector {
    max_payload: usize,
    /// Plaintext accumulating toward the next outbound frame.
    partial_plain: Vec<u8>,
    /// Serialized frame bytes awaiting drain into a caller window.
    outbound: VecDeque<u8>,
    /// Raw inbound frame bytes, possibly ending mid-frame.
    inbound: Vec<u8>,
    /// Decoded plaintext awaiting drain into a caller window.
    decoded: VecDeque<u8>,
}

impl FakeProtector {
    /// Create a protector emitting frames with payloads up to
    /// `max_payload` bytes.
    pub fn with_max_payload(max_payload: usize) -> Self {
        assert!(max_payload > 0, "frame payload budget must be positive");
        Self {
            max_payload,
            partial_plain: Vec::new(),
            outbound: VecDeque::new(),
            inbound: Vec::new(),
            decoded: VecDeque::new(),
        }
    }

    /// Create a protector with the default payload budget.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_FAKE_FRAME_PAYLOAD)
    }

    /// Parse every complete frame out of `inbound` into `decoded`.
    fn decode_complete_frames(&mut self) -> Result<(), FramerStatus> {
        loop {
            if self.inbound.len() < FAKE_HEADER_SIZE {
                return Ok(());
            }
            let mut header = [0u8; FAKE_HEADER_SIZE];
            header.copy_from_slice(&self.inbound[..FAKE_HEADER_SIZE]);
            let payload_len = u32::from_be_bytes(header) as usize;
            if payload_len > self.max_payload {
                return Err(FramerStatus::DataCorrupted);
            }
            let frame_len = FAKE_HEADER_SIZE + payload_len;
            if self.inbound.len() < frame_len {
                return Ok(());
            }
            self.decoded
                .extend(self.inbound[FAKE_HEADER_SIZE..frame_len].iter().map(|b| b ^ MASK));
            self.inbound.drain(..frame_len);
        }
    }
}

impl Default for FakeProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProtector for FakeProtector {
    fn protect(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus> {
        let room = self.max_payload - self.partial_plain.len();
        let consumed = plaintext.len().min(room);
        self.partial_plain.extend_from_slice(&plaintext[..consumed]);
        if self.partial_plain.len() == self.max_payload {
            let frame = encode_frame(&self.partial_plain);
            self.outbound.extend(frame);
            self.partial_plain.clear();
        }
        let written = drain_queue(&mut self.outbound, out);
        Ok(Pump { consumed, written })
    }

    fn protect_flush(&mut self, out: &mut [u8]) -> Result<Flush, FramerStatus> {
        if !self.partial_plain.is_empty() {
            let frame = encode_frame(&self.partial_plain);
            self.outbound.extend(frame);
            self.partial_plain.clear();
        }
        let written = drain_queue(&mut self.outbound, out);
        Ok(Flush {
            written,
            pending: self.outbound.len(),
        })
    }

    fn unprotect(&mut self, frames: &[u8], out: &mut [u8]) -> Result<Pump, FramerStatus> {
        self.inbound.extend_from_slice(frames);
        let consumed = frames.len();
        self.decode_complete_frames()?;
        let written = drain_queue(&mut self.decoded, out);
        Ok(Pump { consumed, written })
    }
}

/// Receive-direction state of the zero-copy fake framer.
#[derive(Default)]
struct Unframe {
    partial: Vec<u8>,
}

/// Slice-buffer fake framer. Protect and unprotect keep independent state,
/// so concurrent use from the read and write paths is safe.
pub struct FakeZeroCopyProtector {
    max_frame_size: usize,
    unframe: Mutex<Unframe>,
}

impl FakeZeroCopyProtector {
    /// Create a protector whose emitted wire frames (header included) never
    /// exceed `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        assert!(
            max_frame_size > FAKE_HEADER_SIZE,
            "max frame size must leave room for a payload"
        );
        Self {
            max_frame_size,
            unframe: Mutex::new(Unframe::default()),
        }
    }

    fn max_payload(&self) -> usize {
        self.max_frame_size - FAKE_HEADER_SIZE
    }
}

impl ZeroCopyProtector for FakeZeroCopyProtector {
    fn protect(
        &self,
        plaintext: &mut SliceBuffer,
        out: &mut SliceBuffer,
    ) -> Result<(), FramerStatus> {
        while !plaintext.is_empty() {
            let n = plaintext.len().min(self.max_payload());
            let chunk = plaintext.split_prefix(n);
            out.append(encode_frame(&chunk.to_vec()).into());
        }
        Ok(())
    }

    fn unprotect(
        &self,
        frames: &mut SliceBuffer,
        out: &mut SliceBuffer,
    ) -> Result<usize, FramerStatus> {
        let mut state = self.unframe.lock();
        for slice in frames.iter() {
            state.partial.extend_from_slice(slice);
        }
        frames.reset();

        loop {
            if state.partial.len() < FAKE_HEADER_SIZE {
                break;
            }
            let mut header = [0u8; FAKE_HEADER_SIZE];
            header.copy_from_slice(&state.partial[..FAKE_HEADER_SIZE]);
            let payload_len = u32::from_be_bytes(header) as usize;
            if payload_len > self.max_payload() {
                return Err(FramerStatus::DataCorrupted);
            }
            let frame_len = FAKE_HEADER_SIZE + payload_len;
            if state.partial.len() < frame_len {
                break;
            }
            let payload: Vec<u8> = state.partial[FAKE_HEADER_SIZE..frame_len]
                .iter()
                .map(|b| b ^ MASK)
                .collect();
            out.append(payload.into());
            state.partial.drain(..frame_len);
        }

        // Estimate how many more ciphertext bytes complete the frame in
        // flight; the endpoint forwards this as a minimum-progress hint.
        let min_progress = if state.partial.is_empty() {
            1
        } else if state.partial.len() < FAKE_HEADER_SIZE {
            FAKE_HEADER_SIZE - state.partial.len()
        } else {
            let mut header = [0u8; FAKE_HEADER_SIZE];
            header.copy_from_slice(&state.partial[..FAKE_HEADER_SIZE]);
            let payload_len = u32::from_be_bytes(header) as usize;
            FAKE_HEADER_SIZE + payload_len - state.partial.len()
        };
        Ok(min_progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pump a full buffer through protect + flush, collecting all output.
    fn protect_all(p: &mut FakeProtector, mut plaintext: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        let mut window = [0u8; 64];
        while !plaintext.is_empty() {
            let Pump { consumed, written } = p.protect(plaintext, &mut window).unwrap();
            wire.extend_from_slice(&window[..written]);
            plaintext = &plaintext[consumed..];
        }
        loop {
            let Flush { written, pending } = p.protect_flush(&mut window).unwrap();
            wire.extend_from_slice(&window[..written]);
            if pending == 0 {
                break;
            }
        }
        wire
    }

    /// Pump wire bytes through unprotect, collecting all plaintext.
    fn unprotect_all(p: &mut FakeProtector, mut wire: &[u8]) -> Vec<u8> {
        let mut plain = Vec::new();
        let mut window = [0u8; 64];
        loop {
            let Pump { consumed, written } = p.unprotect(wire, &mut window).unwrap();
            plain.extend_from_slice(&window[..written]);
            wire = &wire[consumed..];
            if wire.is_empty() && written == 0 {
                break;
            }
        }
        plain
    }

    #[test]
    fn test_pump_round_trip() {
        let mut tx = FakeProtector::with_max_payload(16);
        let mut rx = FakeProtector::with_max_payload(16);

        let wire = protect_all(&mut tx, b"hello fake framing");
        assert_eq!(unprotect_all(&mut rx, &wire), b"hello fake framing");
    }

    #[test]
    fn test_wire_bytes_differ_from_plaintext() {
        let mut tx = FakeProtector::with_max_payload(16);
        let wire = protect_all(&mut tx, b"hello");
        assert_eq!(wire.len(), FAKE_HEADER_SIZE + 5);
        assert_ne!(&wire[FAKE_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_protect_emits_nothing_until_frame_full_or_flushed() {
        let mut tx = FakeProtector::with_max_payload(64);
        let mut window = [0u8; 64];

        let Pump { consumed, written } = tx.protect(b"partial", &mut window).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(written, 0, "partial frame stays buffered");

        let Flush { written, pending } = tx.protect_flush(&mut window).unwrap();
        assert_eq!(written, FAKE_HEADER_SIZE + 7);
        assert_eq!(pending, 0);
    }

    #[test]
    fn test_flush_reports_pending_when_window_is_small() {
        let mut tx = FakeProtector::with_max_payload(64);
        let mut big_window = [0u8; 64];
        tx.protect(b"0123456789", &mut big_window).unwrap();

        let mut tiny = [0u8; 4];
        let Flush { written, pending } = tx.protect_flush(&mut tiny).unwrap();
        assert_eq!(written, 4);
        assert_eq!(pending, 10);

        let Flush { written, pending } = tx.protect_flush(&mut big_window).unwrap();
        assert_eq!(written, 10);
        assert_eq!(pending, 0);
    }

    #[test]
    fn test_unprotect_fragmented_header() {
        let mut rx = FakeProtector::with_max_payload(64);
        let wire = encode_frame(b"test");
        let mut window = [0u8; 64];

        // First two header bytes only: nothing decodes.
        let Pump { written, .. } = rx.unprotect(&wire[..2], &mut window).unwrap();
        assert_eq!(written, 0);

        let Pump { written, .. } = rx.unprotect(&wire[2..], &mut window).unwrap();
        assert_eq!(&window[..written], b"test");
    }

    #[test]
    fn test_unprotect_fragmented_payload() {
        let mut rx = FakeProtector::with_max_payload(64);
        let wire = encode_frame(b"fragmented payload");
        let split = FAKE_HEADER_SIZE + 5;
        let mut window = [0u8; 64];

        let Pump { written, .. } = rx.unprotect(&wire[..split], &mut window).unwrap();
        assert_eq!(written, 0);

        let Pump { written, .. } = rx.unprotect(&wire[split..], &mut window).unwrap();
        assert_eq!(&window[..written], b"fragmented payload");
    }

    #[test]
    fn test_unprotect_drains_across_small_windows() {
        let mut rx = FakeProtector::with_max_payload(64);
        let wire = encode_frame(b"0123456789abcdef");
        let mut tiny = [0u8; 4];
        let mut plain = Vec::new();

        let Pump { consumed, written } = rx.unprotect(&wire, &mut tiny).unwrap();
        assert_eq!(consumed, wire.len());
        plain.extend_from_slice(&tiny[..written]);

        // Remaining plaintext comes out of internal buffering with no new
        // input — the endpoint's drain loop depends on this.
        loop {
            let Pump { written, .. } = rx.unprotect(&[], &mut tiny).unwrap();
            if written == 0 {
                break;
            }
            plain.extend_from_slice(&tiny[..written]);
        }
        assert_eq!(plain, b"0123456789abcdef");
    }

    #[test]
    fn test_unprotect_rejects_oversized_frame() {
        let mut rx = FakeProtector::with_max_payload(8);
        let wire = encode_frame(b"way too long for an 8-byte budget");
        let mut window = [0u8; 64];
        assert_eq!(
            rx.unprotect(&wire, &mut window),
            Err(FramerStatus::DataCorrupted)
        );
    }

    #[test]
    fn test_zero_copy_round_trip() {
        let framer = FakeZeroCopyProtector::new(1024);
        let mut plain = SliceBuffer::new();
        plain.append_copy(b"zero copy round trip");

        let mut wire = SliceBuffer::new();
        framer.protect(&mut plain, &mut wire).unwrap();
        assert!(plain.is_empty());

        let mut out = SliceBuffer::new();
        let min_progress = framer.unprotect(&mut wire, &mut out).unwrap();
        assert_eq!(out.to_vec(), b"zero copy round trip");
        assert_eq!(min_progress, 1);
    }

    #[test]
    fn test_zero_copy_frames_respect_max_frame_size() {
        let framer = FakeZeroCopyProtector::new(256);
        let mut plain = SliceBuffer::new();
        plain.append_copy(&vec![7u8; 1000]);

        let mut wire = SliceBuffer::new();
        framer.protect(&mut plain, &mut wire).unwrap();

        assert!(wire.count() >= 4);
        for i in 0..wire.count() {
            assert!(wire.slice_at(i).len() <= 256);
        }
    }

    #[test]
    fn test_zero_copy_min_progress_estimates_partial_frame() {
        let framer = FakeZeroCopyProtector::new(1024);
        let mut plain = SliceBuffer::new();
        plain.append_copy(&vec![1u8; 100]);
        let mut wire = SliceBuffer::new();
        framer.protect(&mut plain, &mut wire).unwrap();
        let wire_bytes = wire.to_vec();

        // Deliver the header plus 10 payload bytes; 90 remain.
        let mut chunk = SliceBuffer::new();
        chunk.append_copy(&wire_bytes[..FAKE_HEADER_SIZE + 10]);
        let mut out = SliceBuffer::new();
        let min_progress = framer.unprotect(&mut chunk, &mut out).unwrap();
        assert_eq!(min_progress, 90);
        assert!(out.is_empty());

        // Header fragments are estimated too.
        let framer = FakeZeroCopyProtector::new(1024);
        let mut chunk = SliceBuffer::new();
        chunk.append_copy(&wire_bytes[..2]);
        let mut out = SliceBuffer::new();
        assert_eq!(framer.unprotect(&mut chunk, &mut out).unwrap(), 2);
    }
}
