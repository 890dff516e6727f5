use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{BlockAck, RemoteEntry, RemoteStorage, clean_path};
use crate::constants::{CODE_BLOCK_MISSING, CODE_FILE_NOT_EXIST, CODE_RAPID_NOT_FOUND};
use crate::error::RemoteError;
use crate::file::{block_id, compute_hashes};

const BLOCK_DIR: &str = ".blocks";
const INDEX_FILE: &str = ".index.toml";

#[derive(Serialize, Deserialize, Debug, Clone)]
struct IndexEntry {
    hash: String,
    size: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct Index {
    #[serde(default)]
    objects: BTreeMap<String, IndexEntry>,
}

/// Object store kept in a local directory.
///
/// Objects live at their remote path below `root`; uploaded blocks are kept
/// under `.blocks/` until merged; `.index.toml` maps object paths to their
/// md5 so listings and rapid uploads do not rehash content.
pub struct LocalRemote {
    root: PathBuf,
    index: Mutex<Index>,
}

fn io_error(err: std::io::Error) -> RemoteError {
    RemoteError::transport(err.to_string())
}

impl LocalRemote {
    pub fn open<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(BLOCK_DIR))?;

        let index = match std::fs::read_to_string(root.join(INDEX_FILE)) {
            Ok(content) => toml::from_str(&content).map_err(std::io::Error::other)?,
            Err(err) if err.kind() == ErrorKind::NotFound => Index::default(),
            Err(err) => return Err(err),
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local_path(&self, remote: &str) -> PathBuf {
        self.root.join(clean_path(remote).trim_start_matches('/'))
    }

    async fn save_index(&self, index: &Index) -> Result<(), RemoteError> {
        let content = toml::to_string_pretty(index)
            .map_err(|err| RemoteError::transport(err.to_string()))?;
        tokio::fs::write(self.root.join(INDEX_FILE), content)
            .await
            .map_err(io_error)
    }

    async fn record(&self, target: &str, hash: String, size: u64) -> Result<(), RemoteError> {
        let mut index = self.index.lock().await;
        index
            .objects
            .insert(clean_path(target), IndexEntry { hash, size });
        self.save_index(&index).await
    }

    async fn hash_of(&self, remote: &str, local: &Path) -> Result<String, RemoteError> {
        if let Some(entry) = self.index.lock().await.objects.get(remote) {
            return Ok(entry.hash.clone());
        }
        let local = local.to_path_buf();
        let hashes = tokio::task::spawn_blocking(move || compute_hashes(local))
            .await
            .map_err(|err| RemoteError::transport(err.to_string()))?
            .map_err(io_error)?;
        Ok(hashes.full_hash)
    }
}

#[async_trait]
impl RemoteStorage for LocalRemote {
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let dir = clean_path(path);
        let mut read_dir = match tokio::fs::read_dir(self.local_path(&dir)).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RemoteError::service(CODE_FILE_NOT_EXIST, "file does not exist"));
            }
            Err(err) => return Err(io_error(err)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await.map_err(io_error)?;
            let is_dir = metadata.is_dir();
            let hash = if is_dir {
                String::new()
            } else {
                self.hash_of(&super::join_path(&dir, &name), &entry.path())
                    .await?
            };
            entries.push(RemoteEntry {
                name,
                hash,
                size: if is_dir { 0 } else { metadata.len() },
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn register_by_fingerprint(
        &self,
        target: &str,
        full_hash: &str,
        _slice_hash: &str,
        _integrity: &str,
        length: u64,
    ) -> Result<(), RemoteError> {
        let source = self
            .index
            .lock()
            .await
            .objects
            .iter()
            .find(|(_, entry)| entry.hash == full_hash && entry.size == length)
            .map(|(path, _)| path.clone());

        let Some(source) = source else {
            return Err(RemoteError::service(
                CODE_RAPID_NOT_FOUND,
                "rapid upload file not found",
            ));
        };

        let destination = self.local_path(target);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::copy(self.local_path(&source), &destination)
            .await
            .map_err(io_error)?;
        self.record(target, full_hash.to_string(), length).await
    }

    async fn upload_block(
        &self,
        _session_token: &str,
        _block_index: usize,
        data: Bytes,
    ) -> Result<BlockAck, RemoteError> {
        let block_id = block_id(&data);
        tokio::fs::write(self.root.join(BLOCK_DIR).join(&block_id), &data)
            .await
            .map_err(io_error)?;
        Ok(BlockAck { block_id })
    }

    async fn finalize(&self, target: &str, block_ids: &[String]) -> Result<(), RemoteError> {
        let block_dir = self.root.join(BLOCK_DIR);
        for id in block_ids {
            if !tokio::fs::try_exists(block_dir.join(id))
                .await
                .map_err(io_error)?
            {
                return Err(RemoteError::service(
                    CODE_BLOCK_MISSING,
                    "block miss in superfile2",
                ));
            }
        }

        let destination = self.local_path(target);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let mut context = md5::Context::new();
        let mut size = 0u64;
        let mut output = tokio::fs::File::create(&destination)
            .await
            .map_err(io_error)?;
        for id in block_ids {
            let block = tokio::fs::read(block_dir.join(id)).await.map_err(io_error)?;
            context.consume(&block);
            size += block.len() as u64;
            output.write_all(&block).await.map_err(io_error)?;
        }
        output.flush().await.map_err(io_error)?;

        for id in block_ids {
            // Shared blocks may already be gone.
            let _ = tokio::fs::remove_file(block_dir.join(id)).await;
        }

        self.record(target, format!("{:x}", context.compute()), size)
            .await
    }
}
