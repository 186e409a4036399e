//! Peer-to-peer content store.
//! Nodes keep blobs in a content-addressed local store and replicate them,
//! encrypted, to every connected peer over plain TCP.

pub mod crypto;
pub mod handshake;
pub mod peer;
pub mod pipe;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transport;
pub mod wire;

pub use crypto::{copy_decrypt, copy_encrypt, CryptoError, EncKey};
pub use handshake::{Handshake, NoHandshake, VersionHandshake};
pub use peer::{StreamGate, TcpPeer};
pub use protocol::{hash_key, FileAction, Message, Payload, PROTOCOL_VERSION};
pub use server::{FileServer, FileServerError, FileServerOpts, PeerRegistry};
pub use store::{cas_path_transform, default_path_transform, PathKey, Store, StoreError, StoreOpts};
pub use transport::{PeerHandler, Rpc, TcpTransport, TcpTransportOpts, TransportError};
pub use wire::{FrameDecodeError, FrameEncodeError, FrameType};
