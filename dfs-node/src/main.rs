// dfs node: listens, joins the mesh through bootstrap peers, replicates blobs until stopped.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dfs_core::handshake::{Handshake, NoHandshake, VersionHandshake};
use dfs_core::{cas_path_transform, FileServer, FileServerOpts, TcpTransport, TcpTransportOpts};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    listen: Option<String>,
    bootstrap: Option<Vec<String>>,
}

fn parse_args() -> Option<Args> {
    let mut args = Args::default();
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("dfs-node {}", VERSION);
            return None;
        } else if let Some(p) = arg.strip_prefix("--config=") {
            args.config = Some(PathBuf::from(p));
        } else if let Some(a) = arg.strip_prefix("--listen=") {
            args.listen = Some(a.to_string());
        } else if let Some(b) = arg.strip_prefix("--bootstrap=") {
            args.bootstrap = Some(config::parse_bootstrap_nodes(b));
        } else {
            eprintln!("ignoring unknown argument {arg}");
        }
    }
    Some(args)
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args() else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    if let Some(bootstrap) = args.bootstrap {
        cfg.bootstrap_nodes = bootstrap;
    }
    let enc_key = cfg.enc_key()?;
    if enc_key.is_none() {
        warn!("no enc_key configured; generated a node-local key, peers cannot decrypt this node's replicas");
    }

    let handshake: Arc<dyn Handshake> = if cfg.version_handshake {
        Arc::new(VersionHandshake::default())
    } else {
        Arc::new(NoHandshake)
    };
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: cfg.listen_addr.clone(),
        handshake,
        consume_capacity: cfg.consume_capacity,
    });

    let mut opts = FileServerOpts::new(transport);
    opts.enc_key = enc_key;
    opts.storage_root = cfg.storage_root();
    opts.path_transform = cas_path_transform;
    opts.bootstrap_nodes = cfg.bootstrap_nodes.clone();
    opts.settle_delay = cfg.settle_delay();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = FileServer::new(opts);
        let addr = server
            .start()
            .await
            .with_context(|| format!("starting node on {}", cfg.listen_addr))?;
        info!(%addr, version = VERSION, bootstrap = cfg.bootstrap_nodes.len(), "node running");
        shutdown_signal().await?;
        info!("shutting down");
        server.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
