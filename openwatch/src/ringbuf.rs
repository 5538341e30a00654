//! Userspace side of the `EVENTS` ring buffer.
//!
//! A read has three outcomes: one raw record, `Closed` once the buffer was
//! closed through a [`BufferCloser`], or an I/O failure of the transport.
//! Closing is safe while a read is pending; the pending read wakes up and
//! reports `Closed`.

use std::future::Future;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use aya::maps::{MapData, RingBuf};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

/// Undecoded bytes of one ring buffer record.
pub type RawRecord = Vec<u8>;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("ring buffer closed")]
    Closed,

    #[error("reading from ring buffer: {0}")]
    Io(#[from] io::Error),
}

impl ReadError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReadError::Closed)
    }
}

/// A producer of raw records, read one at a time.
pub trait RecordSource {
    /// Wait for the next record. No timeout; waits until data or close.
    fn read(&mut self) -> impl Future<Output = Result<RawRecord, ReadError>>;
}

/// Create a linked closer / signal pair for one buffer.
pub fn close_channel() -> (BufferCloser, CloseSignal) {
    let (tx, rx) = watch::channel(false);
    (BufferCloser { tx: Arc::new(tx) }, CloseSignal { rx })
}

/// Closes the buffer from any task or thread. Closing twice is harmless.
///
/// Dropping every closer also counts as closing.
#[derive(Debug, Clone)]
pub struct BufferCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl BufferCloser {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Reader side of [`close_channel`], held by whoever owns the buffer.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the buffer is closed.
    pub async fn closed(&mut self) {
        // An error means every closer is gone.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

/// Non-blocking record queue behind a pollable file descriptor.
pub trait RecordRing: AsRawFd {
    /// Pop the next available record, `None` when drained.
    fn next_record(&mut self) -> Option<RawRecord>;
}

impl RecordRing for RingBuf<MapData> {
    fn next_record(&mut self) -> Option<RawRecord> {
        self.next().map(|item| item.to_vec())
    }
}

/// Reads records from the kernel ring buffer, woken by epoll readiness.
pub struct RingBufferSource<R: RecordRing = RingBuf<MapData>> {
    inner: AsyncFd<R>,
    signal: CloseSignal,
}

impl<R: RecordRing> RingBufferSource<R> {
    /// Must be called from within a tokio runtime.
    pub fn new(ring: R, signal: CloseSignal) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(ring)?,
            signal,
        })
    }
}

impl<R: RecordRing> RecordSource for RingBufferSource<R> {
    async fn read(&mut self) -> Result<RawRecord, ReadError> {
        loop {
            if self.signal.is_closed() {
                return Err(ReadError::Closed);
            }
            if let Some(record) = self.inner.get_mut().next_record() {
                return Ok(record);
            }
            tokio::select! {
                biased;
                () = self.signal.closed() => return Err(ReadError::Closed),
                guard = self.inner.readable_mut() => guard?.clear_ready(),
            }
        }
    }
}
