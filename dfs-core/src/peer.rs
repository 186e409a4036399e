//! One TCP connection to a remote node: buffered read side shared between the
//! frame decode loop and raw stream consumers, a locked write side, and the
//! stream gate that hands the read side back and forth.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, Semaphore};

use crate::protocol::Message;
use crate::transport::TransportError;
use crate::wire::{self, FrameDecodeError, FrameType};

const READ_CHUNK: usize = 4096;

/// Counted two-party wait between a connection's read loop and the consumer
/// of a raw stream on that connection.
///
/// The read loop calls `enter_and_wait` when it sees a stream frame; the
/// consumer calls `wait_stream` before touching the socket and `release` once
/// it has read the announced bytes.
pub struct StreamGate {
    entered: Semaphore,
    drained: Semaphore,
    pending: AtomicUsize,
}

impl StreamGate {
    pub fn new() -> Self {
        Self {
            entered: Semaphore::new(0),
            drained: Semaphore::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    /// Read-loop side: announce stream mode, then park until released.
    pub async fn enter_and_wait(&self) -> Result<(), TransportError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.entered.add_permits(1);
        let permit = self
            .drained
            .acquire()
            .await
            .map_err(|_| TransportError::StreamClosed)?;
        permit.forget();
        Ok(())
    }

    /// Consumer side: wait until the read loop has parked on a stream frame.
    pub async fn wait_stream(&self) -> Result<(), TransportError> {
        let permit = self
            .entered
            .acquire()
            .await
            .map_err(|_| TransportError::StreamClosed)?;
        permit.forget();
        Ok(())
    }

    /// Consumer side: the stream is drained, let the read loop resume.
    pub fn release(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.drained.add_permits(1);
    }

    /// Streams announced and not yet released.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Fail every current and future waiter. Called when the connection dies.
    pub fn close(&self) {
        self.entered.close();
        self.drained.close();
    }
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Read half with a carry-over buffer. Bytes pulled off the socket past the
/// end of a decoded message stay here and are served to the next reader first.
pub struct PeerReader {
    inner: OwnedReadHalf,
    buffered: BytesMut,
}

impl PeerReader {
    fn new(inner: OwnedReadHalf) -> Self {
        Self {
            inner,
            buffered: BytesMut::new(),
        }
    }

    pub async fn read_frame_type(&mut self) -> Result<FrameType, TransportError> {
        let b = self.read_u8().await?;
        Ok(FrameType::try_from(b)?)
    }

    /// Decode exactly one message, pulling more bytes as needed.
    pub async fn read_message(&mut self) -> Result<Message, TransportError> {
        loop {
            if !self.buffered.is_empty() {
                match wire::decode_message(&self.buffered) {
                    Ok((msg, n)) => {
                        self.buffered.advance(n);
                        return Ok(msg);
                    }
                    Err(FrameDecodeError::NeedMore) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.buffered.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buffered).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}

impl AsyncRead for PeerReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Exclusive access to a peer's read side during stream mode. Dropping it
/// releases the stream gate so the read loop resumes decoding frames.
pub struct PeerStream<'a> {
    reader: MutexGuard<'a, PeerReader>,
    gate: &'a StreamGate,
}

impl AsyncRead for PeerStream<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut *this.reader).poll_read(cx, buf)
    }
}

impl Drop for PeerStream<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// A connected remote node. Owned by the transport; the replication engine
/// holds shared references keyed by remote address.
pub struct TcpPeer {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: bool,
    reader: Mutex<PeerReader>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    gate: StreamGate,
}

impl TcpPeer {
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            remote_addr,
            local_addr,
            outbound,
            reader: Mutex::new(PeerReader::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            gate: StreamGate::new(),
        })
    }

    /// Peer identity: the remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn gate(&self) -> &StreamGate {
        &self.gate
    }

    /// Write raw bytes as one locked unit.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(bytes).await?;
        w.flush().await
    }

    pub async fn send_message(&self, msg: &Message) -> Result<(), TransportError> {
        let frame = wire::encode_frame(msg)?;
        self.send(&frame).await?;
        Ok(())
    }

    /// Hold the write side across several writes (frame byte, size, body).
    pub async fn lock_writer(&self) -> OwnedMutexGuard<OwnedWriteHalf> {
        self.writer.clone().lock_owned().await
    }

    /// Read exactly `buf.len()` bytes. Only valid before the read loop starts
    /// (handshake) or while holding the stream.
    pub async fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut r = self.reader.lock().await;
        r.read_exact(buf).await?;
        Ok(())
    }

    /// Wait for the read loop to park on a stream frame, then take the read side.
    pub async fn begin_stream(&self) -> Result<PeerStream<'_>, TransportError> {
        self.gate.wait_stream().await?;
        let reader = self.reader.lock().await;
        Ok(PeerStream {
            reader,
            gate: &self.gate,
        })
    }

    /// Read side for the connection's own decode loop.
    pub(crate) async fn lock_reader(&self) -> MutexGuard<'_, PeerReader> {
        self.reader.lock().await
    }

    /// Shut down the write side; the remote sees EOF.
    pub async fn shutdown(&self) {
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

impl std::fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}
