//! Content-addressed blob store on the local filesystem.
//!
//! A key maps to `root/<path_name>/<file_name>` through a pure path transform.
//! Existence is filesystem presence; the store keeps no index or metadata.

use std::io;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::crypto::{self, CryptoError, EncKey};

/// Root folder used when none is configured.
pub const DEFAULT_ROOT: &str = "dfs_network";

const SEGMENT_LEN: usize = 5;

/// Location of a blob relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub path_name: String,
    pub file_name: String,
}

impl PathKey {
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path_name, self.file_name)
    }

    /// First directory segment; deleting a key removes this whole subtree.
    pub fn first_path_name(&self) -> &str {
        self.path_name.split('/').next().unwrap_or("")
    }
}

/// Maps a logical key to its location. Must be a pure function of the key.
pub type PathTransformFn = fn(&str) -> PathKey;

/// SHA-1 of the key as 40 hex chars, split into 5-char directory segments.
/// The file name is the full digest.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));
    let segments: Vec<&str> = (0..digest.len())
        .step_by(SEGMENT_LEN)
        .map(|from| &digest[from..(from + SEGMENT_LEN).min(digest.len())])
        .collect();
    PathKey {
        path_name: segments.join("/"),
        file_name: digest,
    }
}

/// Identity layout: `root/<key>/<key>`.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}

#[derive(Clone)]
pub struct StoreOpts {
    /// Folder holding every blob of this store.
    pub root: PathBuf,
    pub path_transform: PathTransformFn,
}

impl std::fmt::Debug for StoreOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOpts")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: default_path_transform,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("key {0:?} does not map to a path under the store root")]
    InvalidKey(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Every segment must be a plain, non-empty name: no `.`, `..`, root or separators.
fn is_plain_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// A blob being written to a temporary file next to its final location.
/// Becomes visible under its key only on `commit`.
pub struct StagedBlob {
    file: File,
    tmp: PathBuf,
    target: PathBuf,
}

impl StagedBlob {
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flush and move the blob into place, replacing any previous content.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.file.flush().await.map_err(io_err(&self.tmp))?;
        drop(self.file);
        fs::rename(&self.tmp, &self.target)
            .await
            .map_err(io_err(&self.target))
    }

    /// Drop the partial blob. Whatever was stored under the key stays untouched.
    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.tmp).await {
            tracing::debug!(path = %self.tmp.display(), error = %e, "removing partial blob failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    opts: StoreOpts,
}

impl Store {
    pub fn new(opts: StoreOpts) -> Self {
        Self { opts }
    }

    pub fn root(&self) -> &Path {
        &self.opts.root
    }

    /// Location of `key`. Fails when the transform yields a path that could
    /// leave the root (empty, `.`/`..` segments, separators in the file name).
    pub fn path_key(&self, key: &str) -> Result<PathKey, StoreError> {
        let path_key = (self.opts.path_transform)(key);
        if !is_plain_relative(&path_key.path_name)
            || !is_plain_relative(&path_key.file_name)
            || path_key.file_name.contains('/')
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(path_key)
    }

    /// Absolute (root-joined) path of the blob for `key`.
    pub fn blob_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self.opts.root.join(self.path_key(key)?.full_path()))
    }

    /// Existence by stat. Not-found is `false`; any other failure is an error.
    pub async fn has(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.blob_path(key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Open a temporary file for `key`, creating parent directories.
    pub async fn stage(&self, key: &str) -> Result<StagedBlob, StoreError> {
        let path_key = self.path_key(key)?;
        let dir = self.opts.root.join(&path_key.path_name);
        fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        let tmp = dir.join(format!(
            "{}.{:016x}.part",
            path_key.file_name,
            rand::random::<u64>()
        ));
        let file = File::create(&tmp).await.map_err(io_err(&tmp))?;
        Ok(StagedBlob {
            file,
            tmp,
            target: dir.join(&path_key.file_name),
        })
    }

    /// Stream `reader` into the blob for `key`, overwriting any previous content.
    /// On failure the previous content (if any) is left in place.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut staged = self.stage(key).await?;
        let copied = tokio::io::copy(reader, staged.file_mut()).await;
        match copied {
            Ok(n) => {
                let path = staged.target.clone();
                staged.commit().await?;
                tracing::debug!(path = %path.display(), bytes = n, "blob written");
                Ok(n)
            }
            Err(e) => {
                let err = io_err(&staged.target)(e);
                staged.discard().await;
                Err(err)
            }
        }
    }

    /// Like `write`, but decrypts `reader` first. Returns plaintext bytes written.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &EncKey,
        key: &str,
        reader: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut staged = self.stage(key).await?;
        let copied = crypto::copy_decrypt(enc_key, reader, staged.file_mut()).await;
        match copied {
            Ok(n) => {
                let path = staged.target.clone();
                staged.commit().await?;
                tracing::debug!(path = %path.display(), bytes = n, "decrypted blob written");
                Ok(n)
            }
            Err(e) => {
                staged.discard().await;
                Err(e.into())
            }
        }
    }

    /// Open the blob for `key`. Returns its size and an open handle; dropping
    /// the handle closes it.
    pub async fn read(&self, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.blob_path(key)?;
        let file = File::open(&path).await.map_err(io_err(&path))?;
        let size = file.metadata().await.map_err(io_err(&path))?.len();
        Ok((size, file))
    }

    /// Remove the whole first-segment subtree `key` maps into.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path_key = self.path_key(key)?;
        let subtree = self.opts.root.join(path_key.first_path_name());
        remove_tree(&subtree).await?;
        tracing::debug!(file = %path_key.file_name, "blob deleted");
        Ok(())
    }

    /// Remove the entire storage root.
    pub async fn clear(&self) -> Result<(), StoreError> {
        remove_tree(&self.opts.root).await
    }
}

async fn remove_tree(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}
