//! Payload encryption: XChaCha20 keystream over byte streams, random IV prefix.
//!
//! Layout on the wire and on disk: `[iv:24][ciphertext...]`. No integrity tag:
//! a wrong key or corrupted IV yields garbage, not an error.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 24;
const CHUNK_SIZE: usize = 32 * 1024; // 32 KiB

/// Symmetric key held by a node for its whole lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct EncKey([u8; KEY_LEN]);

impl EncKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        EncKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        EncKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse a key from 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(EncKey(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for EncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended before the IV prefix")]
    TruncatedIv,
    #[error("invalid key")]
    InvalidKey,
}

/// Encrypt `src` into `dst`: writes a fresh random IV, then the ciphertext in
/// chunks. Returns total bytes written (IV included).
pub async fn copy_encrypt<R, W>(key: &EncKey, src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    dst.write_all(&iv).await?;
    let mut cipher = XChaCha20::new(Key::from_slice(key.as_bytes()), XNonce::from_slice(&iv));
    let n = apply_stream(&mut cipher, src, dst).await?;
    Ok(IV_LEN as u64 + n)
}

/// Decrypt `src` into `dst`: reads the IV prefix, then streams the remainder.
/// Returns plaintext bytes written.
pub async fn copy_decrypt<R, W>(key: &EncKey, src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CryptoError::TruncatedIv
        } else {
            CryptoError::Io(e)
        }
    })?;
    let mut cipher = XChaCha20::new(Key::from_slice(key.as_bytes()), XNonce::from_slice(&iv));
    apply_stream(&mut cipher, src, dst).await
}

async fn apply_stream<R, W>(
    cipher: &mut XChaCha20,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}
