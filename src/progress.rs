//! Byte counting for transfers and the status record that reports it.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

use crate::branch::Branch;
use crate::services::MessageSink;
use crate::session::SessionId;

/// Shared progress of one transfer.
#[derive(Debug, Default)]
pub struct Progress {
    written: AtomicU64,
    total: AtomicU64,
    finished: AtomicBool,
}

impl Progress {
    pub fn add(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.written.store(0, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Completion in percent, or `None` while the size is unknown.
    pub fn percent(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some((self.written() as f64 * 100.0 / total as f64).min(100.0)),
        }
    }
}

/// Pass-through writer that feeds every accepted byte into a [`Progress`].
pub struct CountingWriter<W> {
    inner: W,
    progress: Arc<Progress>,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W, progress: Arc<Progress>) -> Self {
        Self { inner, progress }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            this.progress.add(*n as u64);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Keep a status record up to date until the transfer finishes or the
/// session is cancelled, then remove it.
pub fn spawn_status(
    sink: Arc<dyn MessageSink>,
    branch: Branch,
    session: SessionId,
    record: String,
    label: String,
    progress: Arc<Progress>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = branch.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if progress.is_finished() {
                break;
            }
            let text = match progress.percent() {
                Some(pct) => format!("{label}: {pct:4.2} %"),
                None => format!("{label}: {}", bytesize::ByteSize::b(progress.written())),
            };
            sink.post_or_edit(&session, &record, &text);
        }
        sink.delete(&session, &record);
    })
}
