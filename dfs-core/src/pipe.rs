//! Stream plumbing: a tee reader that captures what it reads, and a fan-out
//! writer that copies every write to several sinks.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Reads from `inner` and appends everything read to `sink`.
pub struct TeeReader<'a, R> {
    inner: R,
    sink: &'a mut Vec<u8>,
}

impl<'a, R> TeeReader<'a, R> {
    pub fn new(inner: R, sink: &'a mut Vec<u8>) -> Self {
        Self { inner, sink }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.sink.extend_from_slice(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Yields exactly `remaining` bytes of `inner`. Hitting end of input early is
/// an `UnexpectedEof` error rather than a short read.
pub struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> ExactReader<R> {
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let max = usize::try_from(this.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(max));
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended {} bytes short", this.remaining),
                    )));
                }
                buf.advance(n);
                this.remaining -= n as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// A borrowed write target of a `MultiWriter`.
pub type Sink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Copies each write to every sink. A sink that errors is dropped from the
/// set and its error kept; the write only fails once every sink has failed.
pub struct MultiWriter<'a> {
    sinks: Vec<Sink<'a>>,
    /// Bytes of the current buffer already accepted by each sink.
    progress: Vec<usize>,
    failed: Vec<Option<io::Error>>,
}

impl<'a> MultiWriter<'a> {
    pub fn new(sinks: Vec<Sink<'a>>) -> Self {
        let n = sinks.len();
        Self {
            sinks,
            progress: vec![0; n],
            failed: (0..n).map(|_| None).collect(),
        }
    }

    /// Error that knocked sink `index` out, if any.
    pub fn failure(&self, index: usize) -> Option<&io::Error> {
        self.failed.get(index).and_then(|f| f.as_ref())
    }

    pub fn failed_count(&self) -> usize {
        self.failed.iter().filter(|f| f.is_some()).count()
    }

    fn all_failed(&self) -> bool {
        self.failed.iter().all(|f| f.is_some())
    }

    fn last_error(&self) -> io::Error {
        self.failed
            .iter()
            .rev()
            .find_map(|f| f.as_ref())
            .map(|e| io::Error::new(e.kind(), e.to_string()))
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no sinks"))
    }
}

impl AsyncWrite for MultiWriter<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.all_failed() {
            return Poll::Ready(Err(this.last_error()));
        }
        let mut pending = false;
        for i in 0..this.sinks.len() {
            if this.failed[i].is_some() {
                continue;
            }
            while this.progress[i] < buf.len() {
                match Pin::new(&mut *this.sinks[i]).poll_write(cx, &buf[this.progress[i]..]) {
                    Poll::Ready(Ok(0)) => {
                        this.failed[i] = Some(io::ErrorKind::WriteZero.into());
                        break;
                    }
                    Poll::Ready(Ok(n)) => this.progress[i] += n,
                    Poll::Ready(Err(e)) => {
                        this.failed[i] = Some(e);
                        break;
                    }
                    Poll::Pending => {
                        pending = true;
                        break;
                    }
                }
            }
        }
        if pending {
            return Poll::Pending;
        }
        this.progress.iter_mut().for_each(|p| *p = 0);
        if this.all_failed() {
            return Poll::Ready(Err(this.last_error()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut pending = false;
        for i in 0..this.sinks.len() {
            if this.failed[i].is_some() {
                continue;
            }
            match Pin::new(&mut *this.sinks[i]).poll_flush(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => this.failed[i] = Some(e),
                Poll::Pending => pending = true,
            }
        }
        if pending {
            Poll::Pending
        } else if this.all_failed() && !this.sinks.is_empty() {
            Poll::Ready(Err(this.last_error()))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
