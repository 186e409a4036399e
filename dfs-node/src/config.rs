//! Load config from file and environment.

use anyhow::Context;
use dfs_core::EncKey;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration. File: --config path, ~/.config/dfs/config.toml or /etc/dfs/config.toml.
/// Env overrides: DFS_LISTEN_ADDR, DFS_BOOTSTRAP, DFS_STORAGE_ROOT, DFS_SETTLE_DELAY_MS,
/// DFS_ENC_KEY, DFS_VERSION_HANDSHAKE, DFS_CONSUME_CAPACITY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen address (default 0.0.0.0:3000).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Peers dialed once at startup.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Derived from the listen address when unset.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
    #[serde(default)]
    pub settle_delay_ms: u64,
    /// 64 hex chars. Every node of a mesh must use the same key.
    #[serde(default)]
    pub enc_key: Option<String>,
    #[serde(default = "default_version_handshake")]
    pub version_handshake: bool,
    #[serde(default = "default_consume_capacity")]
    pub consume_capacity: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_version_handshake() -> bool {
    true
}
fn default_consume_capacity() -> usize {
    dfs_core::transport::DEFAULT_CONSUME_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_nodes: Vec::new(),
            storage_root: None,
            settle_delay_ms: 0,
            enc_key: None,
            version_handshake: default_version_handshake(),
            consume_capacity: default_consume_capacity(),
        }
    }
}

impl Config {
    /// `<listen_addr>_network` with ':' replaced, unless set explicitly.
    pub fn storage_root(&self) -> PathBuf {
        match &self.storage_root {
            Some(p) => p.clone(),
            None => PathBuf::from(format!("{}_network", self.listen_addr.replace(':', "_"))),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Configured key, or `None` when the node should generate its own.
    pub fn enc_key(&self) -> anyhow::Result<Option<EncKey>> {
        match &self.enc_key {
            Some(s) => Ok(Some(EncKey::from_hex(s).context("enc_key")?)),
            None => Ok(None),
        }
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("DFS_LISTEN_ADDR") {
            self.listen_addr = s;
        }
        if let Some(s) = lookup("DFS_BOOTSTRAP") {
            self.bootstrap_nodes = parse_bootstrap_nodes(&s);
        }
        if let Some(s) = lookup("DFS_STORAGE_ROOT") {
            self.storage_root = Some(PathBuf::from(s));
        }
        if let Some(s) = lookup("DFS_SETTLE_DELAY_MS") {
            if let Ok(ms) = s.parse::<u64>() {
                self.settle_delay_ms = ms;
            }
        }
        if let Some(s) = lookup("DFS_ENC_KEY") {
            self.enc_key = Some(s);
        }
        if let Some(s) = lookup("DFS_VERSION_HANDSHAKE") {
            if let Ok(b) = s.parse::<bool>() {
                self.version_handshake = b;
            }
        }
        if let Some(s) = lookup("DFS_CONSUME_CAPACITY") {
            if let Ok(n) = s.parse::<usize>() {
                self.consume_capacity = n;
            }
        }
    }
}

/// Split a comma-separated address list, dropping blanks.
pub fn parse_bootstrap_nodes(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match load_file(explicit)? {
        Some(c) => c,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = explicit {
        out.push(p.to_path_buf());
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/dfs/config.toml"));
    }
    out.push(PathBuf::from("/etc/dfs/config.toml"));
    out
}

fn load_file(explicit: Option<&Path>) -> anyhow::Result<Option<Config>> {
    if let Some(p) = explicit {
        if !p.exists() {
            anyhow::bail!("config file {} does not exist", p.display());
        }
    }
    for p in config_paths(explicit) {
        if p.exists() {
            return parse_file(&p).map(Some);
        }
    }
    Ok(None)
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))
}
