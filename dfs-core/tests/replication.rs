//! Multi-node replication over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use dfs_core::crypto::IV_LEN;
use dfs_core::store::PathTransformFn;
use dfs_core::wire;
use dfs_core::{
    cas_path_transform, default_path_transform, hash_key, EncKey, FileAction, FileServer,
    FileServerError, FileServerOpts, FrameDecodeError, FrameType, Message, Payload, TcpTransport,
    TcpTransportOpts, VersionHandshake, PROTOCOL_VERSION,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(10);

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

struct Node {
    server: Arc<FileServer>,
    addr: String,
    dir: TempDir,
}

impl Node {
    fn root(&self) -> std::path::PathBuf {
        self.dir.path().join("network")
    }
}

async fn start_node(key: &EncKey, bootstrap: Vec<String>) -> Node {
    start_node_with(key, bootstrap, cas_path_transform).await
}

async fn start_node_with(
    key: &EncKey,
    bootstrap: Vec<String>,
    path_transform: PathTransformFn,
) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut transport_opts = TcpTransportOpts::new("127.0.0.1:0");
    transport_opts.handshake = Arc::new(VersionHandshake::default());
    let transport = TcpTransport::new(transport_opts);

    let mut opts = FileServerOpts::new(transport);
    opts.enc_key = Some(key.clone());
    opts.storage_root = dir.path().join("network");
    opts.path_transform = path_transform;
    opts.bootstrap_nodes = bootstrap;
    let server = FileServer::new(opts);
    let addr = server.start().await.unwrap().to_string();
    Node { server, addr, dir }
}

/// Hand-driven connection to a node, for peers that misbehave.
struct RawPeer {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawPeer {
    async fn connect(node: &Node) -> Self {
        let mut stream = TcpStream::connect(&node.addr).await.unwrap();
        stream.write_all(b"dfs").await.unwrap();
        stream.write_all(&[PROTOCOL_VERSION]).await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..3], b"dfs");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn recv_message(&mut self) -> Message {
        loop {
            if !self.buf.is_empty() {
                assert_eq!(self.buf[0], FrameType::Message as u8);
                match wire::decode_message(&self.buf[1..]) {
                    Ok((msg, n)) => {
                        self.buf.drain(..n + 1);
                        return msg;
                    }
                    Err(FrameDecodeError::NeedMore) => {}
                    Err(e) => panic!("bad frame from node: {e}"),
                }
            }
            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("no message from node")
                .unwrap();
            assert!(n > 0, "node closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn expect_get(&mut self) {
        let msg = self.recv_message().await;
        assert!(
            matches!(msg.payload, Payload::FileKey { action: FileAction::Get, .. }),
            "expected a GET, got {msg:?}"
        );
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

fn stream_reply(announced: i64, body: &[u8]) -> Vec<u8> {
    let mut out = vec![FrameType::Stream as u8];
    out.extend_from_slice(&wire::encode_size(announced));
    out.extend_from_slice(body);
    out
}

fn store_file_frame(key: &str, body: &[u8]) -> Vec<u8> {
    let mut out = wire::encode_frame(&Message::store_file(key, body.len() as u64)).unwrap();
    out.push(FrameType::Stream as u8);
    out.extend_from_slice(body);
    out
}

/// Regular files below `dir`, partial blobs included.
fn files_under(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(files_under(&path));
        } else {
            out.push(path);
        }
    }
    out
}

/// Node A listening, node B bootstrapped to it, both registered.
async fn pair() -> (Node, Node) {
    let key = EncKey::generate();
    let a = start_node(&key, Vec::new()).await;
    let b = start_node(&key, vec![a.addr.clone()]).await;
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;
    (a, b)
}

async fn wait_for_peers(node: &Node, n: usize) {
    tokio::time::timeout(WAIT, async {
        while node.server.peer_count().await != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers did not register");
}

async fn wait_for_has(node: &Node, key: &str, want: bool) {
    tokio::time::timeout(WAIT, async {
        while node.server.storage().has(key).await.unwrap() != want {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("has({key}) never became {want}"));
}

async fn wait_for_size(node: &Node, key: &str, want: u64) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok((size, _)) = node.server.storage().read(key).await {
                if size == want {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{key} never reached {want} bytes"));
}

async fn get_string(node: &Node, key: &str) -> Result<String, FileServerError> {
    let mut file = tokio::time::timeout(WAIT, node.server.get(key))
        .await
        .expect("get timed out")?;
    let mut out = String::new();
    file.read_to_string(&mut out).await?;
    Ok(out)
}

#[tokio::test(flavor = "multi_thread")]
async fn store_pushes_replica_to_connected_peer() {
    init_test_tracing();
    let (a, b) = pair().await;

    a.server.store("doc", &mut &b"hello"[..]).await.unwrap();
    assert!(a.server.storage().has("doc").await.unwrap());

    // B holds ciphertext under the hashed key, never the logical key.
    let hashed = hash_key("doc");
    wait_for_size(&b, &hashed, 5 + IV_LEN as u64).await;
    assert!(!b.server.storage().has("doc").await.unwrap());

    let (size, mut replica) = b.server.storage().read(&hashed).await.unwrap();
    assert_eq!(size, 5 + IV_LEN as u64);
    let mut raw = Vec::new();
    replica.read_to_end(&mut raw).await.unwrap();
    assert_ne!(&raw[IV_LEN..], &b"hello"[..]);

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn store_skips_peers_that_connect_later() {
    init_test_tracing();
    let key = EncKey::generate();
    let a = start_node(&key, Vec::new()).await;
    a.server.store("early", &mut &b"before anyone"[..]).await.unwrap();

    let b = start_node(&key, vec![a.addr.clone()]).await;
    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;
    assert!(!b.server.storage().has(&hash_key("early")).await.unwrap());

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn get_fetches_from_peer() {
    init_test_tracing();
    let (a, b) = pair().await;

    a.server.store("doc", &mut &b"hello"[..]).await.unwrap();
    wait_for_has(&b, &hash_key("doc"), true).await;
    assert!(!b.server.storage().has("doc").await.unwrap());

    assert_eq!(get_string(&b, "doc").await.unwrap(), "hello");
    assert!(b.server.storage().has("doc").await.unwrap());

    // Second read is served from local disk.
    assert_eq!(get_string(&b, "doc").await.unwrap(), "hello");

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn get_from_origin_after_peer_joined() {
    init_test_tracing();
    let key = EncKey::generate();
    let a = start_node(&key, Vec::new()).await;
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    a.server.store("big", &mut big.as_slice()).await.unwrap();

    let b = start_node(&key, vec![a.addr.clone()]).await;
    wait_for_peers(&b, 1).await;

    let mut file = tokio::time::timeout(WAIT, b.server.get("big"))
        .await
        .unwrap()
        .unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, big);

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn get_missing_is_not_found() {
    init_test_tracing();
    let (a, b) = pair().await;

    let err = get_string(&b, "missing").await.unwrap_err();
    assert!(matches!(err, FileServerError::NotFound(_)));
    assert!(!b.server.storage().has("missing").await.unwrap());

    // The connection stays usable after a miss.
    a.server.store("after", &mut &b"still works"[..]).await.unwrap();
    wait_for_has(&b, &hash_key("after"), true).await;
    assert_eq!(get_string(&b, "after").await.unwrap(), "still works");

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_propagates_to_peers() {
    init_test_tracing();
    let (a, b) = pair().await;

    a.server.store("doc", &mut &b"hello"[..]).await.unwrap();
    let hashed = hash_key("doc");
    wait_for_has(&b, &hashed, true).await;

    a.server.delete("doc").await.unwrap();
    assert!(!a.server.storage().has("doc").await.unwrap());
    assert!(!a.server.storage().has(&hashed).await.unwrap());
    wait_for_has(&b, &hashed, false).await;

    a.server.stop().await;
    b.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn replicates_to_every_peer() {
    init_test_tracing();
    let key = EncKey::generate();
    let a = start_node(&key, Vec::new()).await;
    let b = start_node(&key, vec![a.addr.clone()]).await;
    let c = start_node(&key, vec![a.addr.clone()]).await;
    wait_for_peers(&a, 2).await;
    wait_for_peers(&b, 1).await;
    wait_for_peers(&c, 1).await;

    for i in 0..5 {
        let name = format!("file_{i}");
        let data = format!("payload number {i}");
        a.server.store(&name, &mut data.as_bytes()).await.unwrap();
    }
    for i in 0..5 {
        let hashed = hash_key(&format!("file_{i}"));
        wait_for_has(&b, &hashed, true).await;
        wait_for_has(&c, &hashed, true).await;
    }
    assert_eq!(get_string(&c, "file_3").await.unwrap(), "payload number 3");

    a.server.stop().await;
    b.server.stop().await;
    c.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_peer_is_pruned() {
    init_test_tracing();
    let (a, b) = pair().await;

    b.server.stop().await;
    for peer in b.server.peers().snapshot().await {
        peer.shutdown().await;
    }
    wait_for_peers(&a, 0).await;

    // Nothing left to replicate to; store still succeeds locally.
    a.server.store("solo", &mut &b"alone"[..]).await.unwrap();
    assert!(a.server.storage().has("solo").await.unwrap());
    a.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_reply_leaves_no_blob() {
    init_test_tracing();
    let node = start_node(&EncKey::generate(), Vec::new()).await;
    let mut fake = RawPeer::connect(&node).await;
    wait_for_peers(&node, 1).await;

    // Announces 5 bytes: not even a full IV.
    let replies = tokio::spawn(async move {
        for _ in 0..2 {
            fake.expect_get().await;
            fake.send(&stream_reply(5, b"short")).await;
        }
        fake
    });

    for _ in 0..2 {
        let err = get_string(&node, "k").await.unwrap_err();
        assert!(matches!(err, FileServerError::NotFound(_)), "{err}");
        assert!(!node.server.storage().has("k").await.unwrap());
    }
    let _fake = replies.await.unwrap();
    assert!(files_under(&node.root()).is_empty());
    node.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_reply_is_not_a_hit() {
    init_test_tracing();
    let node = start_node(&EncKey::generate(), Vec::new()).await;
    let mut fake = RawPeer::connect(&node).await;
    wait_for_peers(&node, 1).await;

    let replies = tokio::spawn(async move {
        fake.expect_get().await;
        // 24-byte IV plus 100 body bytes announced, 54 sent, then hang up.
        fake.send(&stream_reply(124, &[7u8; 54])).await;
    });

    let err = get_string(&node, "k").await.unwrap_err();
    assert!(matches!(err, FileServerError::NotFound(_)), "{err}");
    assert!(!node.server.storage().has("k").await.unwrap());
    replies.await.unwrap();

    wait_for_peers(&node, 0).await;
    assert!(files_under(&node.root()).is_empty());
    node.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_push_keeps_no_replica() {
    init_test_tracing();
    let node = start_node(&EncKey::generate(), Vec::new()).await;
    let mut fake = RawPeer::connect(&node).await;
    wait_for_peers(&node, 1).await;

    let hashed = hash_key("pushed");
    let mut frame = wire::encode_frame(&Message::store_file(&hashed, 124)).unwrap();
    frame.push(FrameType::Stream as u8);
    frame.extend_from_slice(&[9u8; 54]);
    fake.send(&frame).await;
    drop(fake);

    // The connection is pruned only after the announced stream was handled.
    wait_for_peers(&node, 0).await;
    assert!(!node.server.storage().has(&hashed).await.unwrap());
    assert!(files_under(&node.root()).is_empty());
    node.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hostile_keys_stay_inside_root() {
    init_test_tracing();
    let node = start_node_with(&EncKey::generate(), Vec::new(), default_path_transform).await;
    node.server
        .storage()
        .write("seed", &mut &b"keep me"[..])
        .await
        .unwrap();
    let mut fake = RawPeer::connect(&node).await;
    wait_for_peers(&node, 1).await;

    let mut bytes = store_file_frame("../escaped", b"pwn");
    for key in ["", ".", ".."] {
        bytes.extend(wire::encode_frame(&Message::file_key(key, FileAction::Delete)).unwrap());
    }
    bytes.extend(store_file_frame("good", b"ok!"));
    fake.send(&bytes).await;

    // Messages are handled in order; once "good" lands the rest were processed.
    wait_for_size(&node, "good", 3).await;
    assert!(!node.dir.path().join("escaped").exists());
    assert!(node.server.storage().has("seed").await.unwrap());
    assert_eq!(get_string(&node, "good").await.unwrap(), "ok!");

    let mut names: Vec<String> = std::fs::read_dir(node.root())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["good", "seed"]);
    node.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_node_keeps_connections() {
    init_test_tracing();
    let (a, b) = pair().await;

    a.server.stop().await;
    b.server.delete("anything").await.unwrap();
    b.server
        .store("late", &mut &b"after stop"[..])
        .await
        .unwrap();
    b.server.delete("anything else").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(a.server.peer_count().await, 1);
    assert_eq!(b.server.peer_count().await, 1);
    assert!(!a.server.storage().has(&hash_key("late")).await.unwrap());
    b.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_of_absent_key_is_acked() {
    init_test_tracing();
    let node = start_node(&EncKey::generate(), Vec::new()).await;
    let mut fake = RawPeer::connect(&node).await;
    wait_for_peers(&node, 1).await;

    let frame = wire::encode_frame(&Message::file_key(hash_key("never stored"), FileAction::Delete))
        .unwrap();
    fake.send(&frame).await;
    let msg = fake.recv_message().await;
    match msg.payload {
        Payload::Ack(text) => assert!(String::from_utf8_lossy(&text).starts_with("ACK DEL from [")),
        other => panic!("expected an ack, got {other:?}"),
    }
    node.server.stop().await;
}
