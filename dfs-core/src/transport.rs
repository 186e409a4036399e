//! TCP transport: accept loop, outbound dials, handshake, and one decode loop
//! per connection funnelling control messages into a single bounded channel.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::handshake::{Handshake, NoHandshake};
use crate::peer::TcpPeer;
use crate::protocol::Message;
use crate::wire::{FrameDecodeError, FrameEncodeError, FrameType};

/// Default capacity of the consume channel.
pub const DEFAULT_CONSUME_CAPACITY: usize = 64;

/// A decoded control message tagged with the sender's identity.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: SocketAddr,
    pub message: Message,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode error: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error("stream gate closed: connection is gone")]
    StreamClosed,
    #[error("consumer channel closed")]
    ConsumerGone,
    #[error("consume channel already taken")]
    AlreadyConsumed,
    #[error("peer handler already set")]
    HandlerAlreadySet,
}

/// Notified when a connection has completed its handshake and when its
/// decode loop exits.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    /// Returning an error closes the connection.
    async fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), TransportError>;

    async fn on_peer_lost(&self, _peer: &Arc<TcpPeer>) {}
}

pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub consume_capacity: usize,
}

impl TcpTransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NoHandshake),
            consume_capacity: DEFAULT_CONSUME_CAPACITY,
        }
    }
}

pub struct TcpTransport {
    opts: TcpTransportOpts,
    local_addr: OnceLock<SocketAddr>,
    handler: OnceLock<Arc<dyn PeerHandler>>,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::channel(opts.consume_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            opts,
            local_addr: OnceLock::new(),
            handler: OnceLock::new(),
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            shutdown,
        })
    }

    /// Configured listen address.
    pub fn listen_addr(&self) -> &str {
        &self.opts.listen_addr
    }

    /// Bound address, once `listen_and_accept` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn set_peer_handler(&self, handler: Arc<dyn PeerHandler>) -> Result<(), TransportError> {
        self.handler
            .set(handler)
            .map_err(|_| TransportError::HandlerAlreadySet)
    }

    /// Take the receiving end of the consume channel. Can be taken once.
    pub async fn consume(&self) -> Result<mpsc::Receiver<Rpc>, TransportError> {
        self.rpc_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyConsumed)
    }

    /// Bind and start the accept loop. Only bind failure is reported.
    pub async fn listen_and_accept(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(&self.opts.listen_addr).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        info!(%addr, "transport listening");

        let transport = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, _)) => {
                            let transport = transport.clone();
                            tokio::spawn(async move { transport.handle_conn(stream, false).await });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!(%addr, "accept loop stopped");
        });
        Ok(addr)
    }

    /// Connect to `addr` and run the connection pipeline as outbound. Returns
    /// once the connection attempt resolves; the decode loop runs on its own task.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let transport = self.clone();
        tokio::spawn(async move { transport.handle_conn(stream, true).await });
        Ok(())
    }

    /// Stop accepting. Established connections keep running.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let peer = match TcpPeer::new(stream, outbound) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!(error = %e, "could not set up connection");
                return;
            }
        };
        let remote = peer.remote_addr();

        if let Err(e) = self.opts.handshake.handshake(&peer).await {
            warn!(peer = %remote, error = %e, "handshake failed");
            peer.shutdown().await;
            return;
        }
        if let Some(handler) = self.handler.get() {
            if let Err(e) = handler.on_peer(peer.clone()).await {
                warn!(peer = %remote, error = %e, "peer rejected");
                peer.shutdown().await;
                return;
            }
        }
        debug!(peer = %remote, outbound, "peer connected");

        match self.read_loop(&peer).await {
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(peer = %remote, "connection closed by remote");
            }
            Err(e) => warn!(peer = %remote, error = %e, "dropping connection"),
            Ok(()) => {}
        }

        peer.gate().close();
        if let Some(handler) = self.handler.get() {
            handler.on_peer_lost(&peer).await;
        }
        peer.shutdown().await;
    }

    async fn read_loop(&self, peer: &TcpPeer) -> Result<(), TransportError> {
        loop {
            let message = {
                let mut reader = peer.lock_reader().await;
                match reader.read_frame_type().await? {
                    FrameType::Message => Some(reader.read_message().await?),
                    FrameType::Stream => None,
                }
            };
            match message {
                Some(message) => {
                    let rpc = Rpc {
                        from: peer.remote_addr(),
                        message,
                    };
                    self.rpc_tx
                        .send(rpc)
                        .await
                        .map_err(|_| TransportError::ConsumerGone)?;
                }
                None => {
                    debug!(peer = %peer.remote_addr(), "incoming stream, waiting for consumer");
                    peer.gate().enter_and_wait().await?;
                    debug!(peer = %peer.remote_addr(), "stream drained, resuming");
                }
            }
        }
    }
}
