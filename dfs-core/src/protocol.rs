//! Replication protocol: control message types and protocol constants.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current protocol version. Used in the version handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size prefix sent in a GET reply when the peer does not hold the key.
pub const FILE_NOT_FOUND: i64 = -1;

/// Operation announced by a `FileKey` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAction {
    Get,
    Delete,
}

/// Tagged payload union. Encoding is bincode: the variant index is written
/// first and inspected before the rest of the payload is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Announces a replicated blob of `size` bytes that follows as a raw stream.
    StoreFile { key: String, size: u64 },
    /// Announces an operation against `key`.
    FileKey { key: String, action: FileAction },
    /// Free-form acknowledgment.
    Ack(Vec<u8>),
}

impl Payload {
    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::StoreFile { .. } => "store_file",
            Payload::FileKey {
                action: FileAction::Get,
                ..
            } => "get",
            Payload::FileKey {
                action: FileAction::Delete,
                ..
            } => "delete",
            Payload::Ack(_) => "ack",
        }
    }
}

/// Control message envelope. Built once per broadcast and sent identically to every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
}

impl Message {
    pub fn store_file(key: impl Into<String>, size: u64) -> Self {
        Self {
            payload: Payload::StoreFile {
                key: key.into(),
                size,
            },
        }
    }

    pub fn file_key(key: impl Into<String>, action: FileAction) -> Self {
        Self {
            payload: Payload::FileKey {
                key: key.into(),
                action,
            },
        }
    }

    pub fn ack(text: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Payload::Ack(text.into()),
        }
    }
}

/// Hash a logical key before it crosses the wire (SHA-256, lowercase hex).
/// Peers store replicas under this name and never see the logical key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
