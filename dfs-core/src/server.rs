//! Replication engine: a node that keeps blobs in a local store and pushes,
//! pulls and deletes them across every connected peer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError, EncKey, IV_LEN};
use crate::peer::TcpPeer;
use crate::pipe::{ExactReader, MultiWriter, Sink, TeeReader};
use crate::protocol::{hash_key, FileAction, Message, Payload, FILE_NOT_FOUND};
use crate::store::{
    cas_path_transform, PathTransformFn, Store, StoreError, StoreOpts, DEFAULT_ROOT,
};
use crate::transport::{PeerHandler, Rpc, TcpTransport, TransportError};
use crate::wire::{self, FrameType, SIZE_PREFIX_LEN};

#[derive(Debug, thiserror::Error)]
pub enum FileServerError {
    #[error("key {0:?} not found locally or on any peer")]
    NotFound(String),
    #[error("no registered peer for {0}")]
    MissingPeer(SocketAddr),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Connected peers keyed by remote address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<SocketAddr, Arc<TcpPeer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, peer: Arc<TcpPeer>) {
        self.peers.lock().await.insert(peer.remote_addr(), peer);
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<TcpPeer>> {
        self.peers.lock().await.get(addr).cloned()
    }

    /// Remove `peer` only if the registry still holds that same connection.
    pub async fn remove(&self, peer: &Arc<TcpPeer>) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get(&peer.remote_addr()) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(&peer.remote_addr());
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<TcpPeer>> {
        self.peers.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}

#[async_trait]
impl PeerHandler for PeerRegistry {
    async fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), TransportError> {
        info!(peer = %peer.remote_addr(), outbound = peer.is_outbound(), "peer registered");
        self.insert(peer).await;
        Ok(())
    }

    async fn on_peer_lost(&self, peer: &Arc<TcpPeer>) {
        if self.remove(peer).await {
            info!(peer = %peer.remote_addr(), "peer removed");
        }
    }
}

pub struct FileServerOpts {
    /// Shared by every node of a mesh. Generated when absent.
    pub enc_key: Option<EncKey>,
    pub storage_root: PathBuf,
    pub path_transform: PathTransformFn,
    pub transport: Arc<TcpTransport>,
    pub bootstrap_nodes: Vec<String>,
    /// Pause between a broadcast and the stream that depends on it.
    pub settle_delay: Duration,
}

impl FileServerOpts {
    pub fn new(transport: Arc<TcpTransport>) -> Self {
        Self {
            enc_key: None,
            storage_root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
            transport,
            bootstrap_nodes: Vec::new(),
            settle_delay: Duration::ZERO,
        }
    }
}

pub struct FileServer {
    enc_key: EncKey,
    store: Store,
    transport: Arc<TcpTransport>,
    peers: Arc<PeerRegistry>,
    bootstrap_nodes: Vec<String>,
    settle_delay: Duration,
    quit: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Arc<Self> {
        let enc_key = opts.enc_key.unwrap_or_else(EncKey::generate);
        let store = Store::new(StoreOpts {
            root: opts.storage_root,
            path_transform: opts.path_transform,
        });
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            enc_key,
            store,
            transport: opts.transport,
            peers: Arc::new(PeerRegistry::new()),
            bootstrap_nodes: opts.bootstrap_nodes,
            settle_delay: opts.settle_delay,
            quit,
            dispatch: Mutex::new(None),
        })
    }

    pub fn storage(&self) -> &Store {
        &self.store
    }

    pub fn enc_key(&self) -> &EncKey {
        &self.enc_key
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.len().await
    }

    /// Listen, start the dispatch loop, then dial every bootstrap node.
    /// Returns the bound listen address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, FileServerError> {
        self.transport.set_peer_handler(self.peers.clone())?;
        let addr = self.transport.listen_and_accept().await?;
        let rx = self.transport.consume().await?;

        let server = self.clone();
        let handle = tokio::spawn(async move { server.dispatch_loop(rx).await });
        *self.dispatch.lock().await = Some(handle);

        self.bootstrap();
        info!(%addr, root = %self.store.root().display(), "file server started");
        Ok(addr)
    }

    /// Stop the dispatch loop and the listener. Open connections are left alone.
    pub async fn stop(&self) {
        self.quit.send_replace(true);
        if let Some(handle) = self.dispatch.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn bootstrap(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|a| !a.is_empty()) {
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                debug!(%addr, "dialing bootstrap node");
                if let Err(e) = transport.dial(&addr).await {
                    warn!(%addr, error = %e, "bootstrap dial failed");
                }
            });
        }
    }

    /// Persist `reader` under `key` and push an encrypted replica to every
    /// connected peer.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<(), FileServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut plain = Vec::new();
        let size = {
            let mut tee = TeeReader::new(reader, &mut plain);
            self.store.write(key, &mut tee).await?
        };

        let hashed = hash_key(key);
        let mut replica = self.store.stage(&hashed).await?;
        let announced = self
            .broadcast(&Message::store_file(&hashed, size + IV_LEN as u64))
            .await;
        let peers = match announced {
            Ok(peers) => peers,
            Err(e) => {
                replica.discard().await;
                return Err(e);
            }
        };
        self.settle().await;

        let mut writers = Vec::with_capacity(peers.len());
        for peer in &peers {
            let mut w = peer.lock_writer().await;
            match w.write_all(&[FrameType::Stream as u8]).await {
                Ok(()) => writers.push(w),
                Err(e) => warn!(peer = %peer.remote_addr(), error = %e, "stream start failed"),
            }
        }

        let streamed = writers.len();
        let mut sinks: Vec<Sink<'_>> = Vec::with_capacity(streamed + 1);
        sinks.push(replica.file_mut());
        for w in writers.iter_mut() {
            sinks.push(&mut **w);
        }
        let mut fan_out = MultiWriter::new(sinks);
        let (n, replica_err, lost) =
            match crypto::copy_encrypt(&self.enc_key, &mut plain.as_slice(), &mut fan_out).await {
                Ok(n) => (
                    n,
                    fan_out
                        .failure(0)
                        .map(|e| io::Error::new(e.kind(), e.to_string())),
                    fan_out.failed_count(),
                ),
                Err(e) => {
                    drop(fan_out);
                    replica.discard().await;
                    return Err(e.into());
                }
            };
        drop(fan_out);
        if let Some(e) = replica_err {
            replica.discard().await;
            return Err(e.into());
        }
        replica.commit().await?;
        let peers = streamed - lost;
        info!(key = %key, bytes = n, peers, "stored and replicated");
        Ok(())
    }

    /// Open `key`, fetching it from peers when it is not on local disk.
    pub async fn get(&self, key: &str) -> Result<File, FileServerError> {
        if self.store.has(key).await? {
            debug!(key = %key, "serving from local disk");
            let (_, file) = self.store.read(key).await?;
            return Ok(file);
        }

        let hashed = hash_key(key);
        let peers = self
            .broadcast(&Message::file_key(&hashed, FileAction::Get))
            .await?;
        self.settle().await;

        let mut found = false;
        for peer in &peers {
            match self.fetch_from(peer, key).await {
                Ok(true) => found = true,
                Ok(false) => debug!(peer = %peer.remote_addr(), key = %key, "peer does not hold key"),
                Err(e) => warn!(peer = %peer.remote_addr(), error = %e, "fetch failed"),
            }
        }
        if !found {
            return Err(FileServerError::NotFound(key.to_string()));
        }
        let (_, file) = self.store.read(key).await?;
        Ok(file)
    }

    async fn fetch_from(&self, peer: &TcpPeer, key: &str) -> Result<bool, FileServerError> {
        let mut stream = peer.begin_stream().await?;
        let mut prefix = [0u8; SIZE_PREFIX_LEN];
        stream.read_exact(&mut prefix).await?;
        let size = wire::decode_size(prefix);
        if size < 0 {
            return Ok(false);
        }

        let mut body = ExactReader::new(&mut stream, size as u64);
        match self.store.write_decrypt(&self.enc_key, key, &mut body).await {
            Ok(n) => {
                info!(peer = %peer.remote_addr(), key = %key, bytes = n, "fetched from peer");
                Ok(true)
            }
            Err(e) => {
                drain(&mut body).await;
                Err(e.into())
            }
        }
    }

    /// Remove `key` locally and tell every peer to drop its replica.
    pub async fn delete(&self, key: &str) -> Result<(), FileServerError> {
        let hashed = hash_key(key);
        for k in [key, hashed.as_str()] {
            if self.store.has(k).await? {
                self.store.delete(k).await?;
            }
        }
        self.broadcast(&Message::file_key(&hashed, FileAction::Delete))
            .await?;
        info!(key = %key, "deleted");
        Ok(())
    }

    /// Send `msg` to every registered peer. Returns the peers it reached.
    async fn broadcast(&self, msg: &Message) -> Result<Vec<Arc<TcpPeer>>, FileServerError> {
        let frame = wire::encode_frame(msg).map_err(TransportError::from)?;
        let mut reached = Vec::new();
        for peer in self.peers.snapshot().await {
            match peer.send(&frame).await {
                Ok(()) => reached.push(peer),
                Err(e) => warn!(peer = %peer.remote_addr(), error = %e, "broadcast failed"),
            }
        }
        debug!(kind = msg.payload.kind(), peers = reached.len(), "broadcast");
        Ok(reached)
    }

    async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Rpc>) {
        let mut quit = self.quit.subscribe();
        let stopped = *quit.borrow();
        if !stopped {
            loop {
                tokio::select! {
                    rpc = rx.recv() => match rpc {
                        Some(rpc) => {
                            let from = rpc.from;
                            let kind = rpc.message.payload.kind();
                            if let Err(e) = self.handle_rpc(rpc).await {
                                warn!(peer = %from, kind, error = %e, "handling message failed");
                            }
                        }
                        None => break,
                    },
                    _ = quit.changed() => break,
                }
            }
        }
        self.transport.close();
        // Keep connections alive: later messages are read and dropped.
        let peers = self.peers.clone();
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                debug!(peer = %rpc.from, kind = rpc.message.payload.kind(), "server stopped, dropping message");
                if let Payload::StoreFile { size, .. } = rpc.message.payload {
                    skip_stream(&peers, rpc.from, size).await;
                }
            }
        });
        info!("file server stopped");
    }

    async fn handle_rpc(&self, rpc: Rpc) -> Result<(), FileServerError> {
        match rpc.message.payload {
            Payload::StoreFile { key, size } => self.handle_store_file(rpc.from, &key, size).await,
            Payload::FileKey {
                key,
                action: FileAction::Get,
            } => self.handle_get(rpc.from, &key).await,
            Payload::FileKey {
                key,
                action: FileAction::Delete,
            } => self.handle_delete(rpc.from, &key).await,
            Payload::Ack(text) => {
                info!(peer = %rpc.from, ack = %String::from_utf8_lossy(&text), "ack received");
                Ok(())
            }
        }
    }

    async fn peer(&self, addr: SocketAddr) -> Result<Arc<TcpPeer>, FileServerError> {
        self.peers
            .get(&addr)
            .await
            .ok_or(FileServerError::MissingPeer(addr))
    }

    async fn handle_store_file(
        &self,
        from: SocketAddr,
        key: &str,
        size: u64,
    ) -> Result<(), FileServerError> {
        let peer = self.peer(from).await?;
        let mut stream = peer.begin_stream().await?;
        let mut body = ExactReader::new(&mut stream, size);
        match self.store.write(key, &mut body).await {
            Ok(n) => {
                info!(peer = %from, key = %key, bytes = n, "replica stored");
                Ok(())
            }
            Err(e) => {
                drain(&mut body).await;
                Err(e.into())
            }
        }
    }

    async fn handle_get(&self, from: SocketAddr, key: &str) -> Result<(), FileServerError> {
        let peer = self.peer(from).await?;
        if !self.store.has(key).await? {
            debug!(peer = %from, key = %key, "requested key not held");
            let mut w = peer.lock_writer().await;
            w.write_all(&[FrameType::Stream as u8]).await?;
            w.write_all(&wire::encode_size(FILE_NOT_FOUND)).await?;
            w.flush().await?;
            return Ok(());
        }

        let (size, file) = self.store.read(key).await?;
        let mut w = peer.lock_writer().await;
        w.write_all(&[FrameType::Stream as u8]).await?;
        w.write_all(&wire::encode_size(size as i64)).await?;
        let n = tokio::io::copy(&mut file.take(size), &mut *w).await?;
        w.flush().await?;
        info!(peer = %from, key = %key, bytes = n, "served key");
        Ok(())
    }

    async fn handle_delete(&self, from: SocketAddr, key: &str) -> Result<(), FileServerError> {
        if self.store.has(key).await? {
            self.store.delete(key).await?;
            info!(peer = %from, key = %key, "replica deleted");
        }
        let peer = self.peer(from).await?;
        let me = match self.transport.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.transport.listen_addr().to_string(),
        };
        peer.send_message(&Message::ack(format!("ACK DEL from [{}]", me)))
            .await?;
        Ok(())
    }
}

/// Read and discard an announced stream nobody will store.
async fn skip_stream(peers: &PeerRegistry, from: SocketAddr, size: u64) {
    let Some(peer) = peers.get(&from).await else {
        return;
    };
    match peer.begin_stream().await {
        Ok(mut stream) => drain(&mut ExactReader::new(&mut stream, size)).await,
        Err(e) => debug!(peer = %from, error = %e, "skipping stream failed"),
    };
}

/// Consume what is left of an announced stream so the connection stays aligned.
async fn drain<R: AsyncRead + Unpin>(body: &mut R) {
    if let Err(e) = tokio::io::copy(body, &mut tokio::io::sink()).await {
        debug!(error = %e, "draining stream failed");
    }
}
