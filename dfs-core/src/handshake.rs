//! Pluggable connection handshake, run once per connection before any frame is read.

use async_trait::async_trait;

use crate::peer::TcpPeer;
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::TransportError;

const MAGIC: &[u8; 3] = b"dfs";
const HANDSHAKE_SIZE: usize = 4; // magic + version

#[async_trait]
pub trait Handshake: Send + Sync {
    /// Failure closes the connection without reporting the peer as connected.
    async fn handshake(&self, peer: &TcpPeer) -> Result<(), TransportError>;
}

/// Always succeeds; exchanges nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn handshake(&self, _peer: &TcpPeer) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Exchange magic + protocol version. The dialer writes first; the acceptor
/// reads first, then answers.
#[derive(Debug, Clone, Copy)]
pub struct VersionHandshake {
    version: u8,
}

impl VersionHandshake {
    pub fn new(version: u8) -> Self {
        Self { version }
    }

    fn bytes(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[..3].copy_from_slice(MAGIC);
        out[3] = self.version;
        out
    }

    fn check(&self, buf: &[u8; HANDSHAKE_SIZE]) -> Result<(), TransportError> {
        if &buf[..3] != MAGIC {
            return Err(TransportError::Handshake("bad magic".into()));
        }
        if buf[3] != self.version {
            return Err(TransportError::Handshake(format!(
                "unsupported protocol version {}",
                buf[3]
            )));
        }
        Ok(())
    }
}

impl Default for VersionHandshake {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

#[async_trait]
impl Handshake for VersionHandshake {
    async fn handshake(&self, peer: &TcpPeer) -> Result<(), TransportError> {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        if peer.is_outbound() {
            peer.send(&self.bytes()).await?;
            peer.recv_exact(&mut buf).await?;
            self.check(&buf)
        } else {
            peer.recv_exact(&mut buf).await?;
            self.check(&buf)?;
            peer.send(&self.bytes()).await?;
            Ok(())
        }
    }
}
