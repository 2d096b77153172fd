//! Adapter from tokio byte streams to the endpoint callback contract.
//!
//! A [`StreamEndpoint`] owns a dedicated reader task and a dedicated writer
//! task, each fed by an mpsc channel of requests. This keeps the callback
//! API lock-free on the submission path and lets the runtime drive the
//! actual I/O:
//!
//! ```text
//! read()  ─► mpsc ─► Reader Task ─► AsyncRead  ─► done(dst, result)
//! write() ─► mpsc ─► Writer Task ─► AsyncWrite ─► done(src, result)
//! ```
//!
//! The reader honors `min_progress`: it keeps reading until at least that
//! many bytes are buffered, so a secure endpoint waiting for the tail of a
//! frame is not woken by tiny slices.

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{ByteStreamEndpoint, ReadDone, WriteArgs, WriteDone};
use crate::buffer::SliceBuffer;
use crate::error::{Result, SealwireError};
use crate::exec::ExecCtx;

/// Bytes to ask the stream for in one syscall.
const READ_CHUNK: usize = 8192;

struct ReadRequest {
    dst: SliceBuffer,
    done: ReadDone,
    min_progress: usize,
}

struct WriteRequest {
    src: SliceBuffer,
    done: WriteDone,
}

/// A [`ByteStreamEndpoint`] over any tokio `AsyncRead + AsyncWrite` stream.
///
/// Must be created from within a tokio runtime; the reader and writer
/// tasks are spawned immediately and exit when the endpoint is destroyed
/// or the stream fails.
pub struct StreamEndpoint {
    read_tx: Mutex<Option<mpsc::UnboundedSender<ReadRequest>>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    local: String,
    peer: String,
}

impl StreamEndpoint {
    /// Wrap `stream`, spawning its reader and writer tasks.
    pub fn new<S>(stream: S, local: String, peer: String) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        tokio::spawn(reader_loop(read_rx, reader));
        tokio::spawn(writer_loop(write_rx, writer));

        Self {
            read_tx: Mutex::new(Some(read_tx)),
            write_tx: Mutex::new(Some(write_tx)),
            local,
            peer,
        }
    }

    /// An in-process endpoint pair joined back-to-back, for loopback wiring
    /// and tests. `max_buf_size` bounds the bytes in flight per direction.
    pub fn pair(max_buf_size: usize) -> (StreamEndpoint, StreamEndpoint) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (
            StreamEndpoint::new(a, "duplex:a".into(), "duplex:b".into()),
            StreamEndpoint::new(b, "duplex:b".into(), "duplex:a".into()),
        )
    }
}

impl ByteStreamEndpoint for StreamEndpoint {
    fn read(&self, dst: SliceBuffer, done: ReadDone, _urgent: bool, min_progress: usize) {
        let sent = {
            let tx = self.read_tx.lock();
            match tx.as_ref() {
                Some(tx) => tx
                    .send(ReadRequest {
                        dst,
                        done,
                        min_progress,
                    })
                    .map_err(|e| e.0),
                None => Err(ReadRequest {
                    dst,
                    done,
                    min_progress,
                }),
            }
        };
        if let Err(req) = sent {
            ExecCtx::run(move || (req.done)(req.dst, Err(SealwireError::ConnectionClosed)));
        }
    }

    fn write(&self, src: SliceBuffer, done: WriteDone, _args: WriteArgs) {
        let sent = {
            let tx = self.write_tx.lock();
            match tx.as_ref() {
                Some(tx) => tx.send(WriteRequest { src, done }).map_err(|e| e.0),
                None => Err(WriteRequest { src, done }),
            }
        };
        if let Err(req) = sent {
            ExecCtx::run(move || (req.done)(req.src, Err(SealwireError::ConnectionClosed)));
        }
    }

    fn destroy(&self) {
        // Closing the channels stops both tasks; dropping the halves closes
        // the stream.
        self.read_tx.lock().take();
        self.write_tx.lock().take();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn local_address(&self) -> String {
        self.local.clone()
    }
}

async fn reader_loop<R>(mut rx: mpsc::UnboundedReceiver<ReadRequest>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    while let Some(ReadRequest {
        mut dst,
        done,
        min_progress,
    }) = rx.recv().await
    {
        let want = min_progress.max(1);
        let mut buf = BytesMut::with_capacity(want.max(READ_CHUNK));
        let mut result: Result<()> = Ok(());
        while buf.len() < want {
            buf.reserve(READ_CHUNK);
            match reader.read_buf(&mut buf).await {
                // EOF: deliver what we have; a later read reports the close.
                Ok(0) => {
                    if buf.is_empty() {
                        result = Err(SealwireError::ConnectionClosed);
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }
        if !buf.is_empty() {
            dst.append(buf.freeze());
        }
        done(dst, result);
    }
}

async fn writer_loop<W>(mut rx: mpsc::UnboundedReceiver<WriteRequest>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(WriteRequest { src, done }) = rx.recv().await {
        let mut result: Result<()> = Ok(());
        for slice in src.iter() {
            if let Err(e) = writer.write_all(slice).await {
                result = Err(e.into());
                break;
            }
        }
        if result.is_ok() {
            if let Err(e) = writer.flush().await {
                result = Err(e.into());
            }
        }
        tracing::trace!(bytes = src.len(), ok = result.is_ok(), "stream write complete");
        done(src, result);
    }
}
