//! Boundary to the remote object store.
//!
//! The engine only talks to [`RemoteStorage`]. Request signing, HTTP retries
//! and the wire format belong to the implementation behind it.

pub mod local;
pub mod mock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    /// md5 of the content, lowercase hex. Empty for directories.
    pub hash: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAck {
    pub block_id: String,
}

#[async_trait::async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Asks the remote to create `target` from content it already stores.
    async fn register_by_fingerprint(
        &self,
        target: &str,
        full_hash: &str,
        slice_hash: &str,
        integrity: &str,
        length: u64,
    ) -> Result<(), RemoteError>;

    async fn upload_block(
        &self,
        session_token: &str,
        block_index: usize,
        data: Bytes,
    ) -> Result<BlockAck, RemoteError>;

    /// Merges previously uploaded blocks, in order, into `target`.
    async fn finalize(&self, target: &str, block_ids: &[String]) -> Result<(), RemoteError>;
}

/// Normalizes a `/`-separated remote path: absolute, no `.`/`..`, no
/// trailing or repeated separators.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn join_path(dir: &str, relative: &str) -> String {
    clean_path(&format!("{dir}/{relative}"))
}

/// Splits a cleaned path into (parent directory, file name).
pub fn split_path(path: &str) -> (String, String) {
    let path = clean_path(path);
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => ("/".to_string(), path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_paths() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("a//b/./c/"), "/a/b/c");
        assert_eq!(clean_path("/a/../../b"), "/b");
        assert_eq!(clean_path("\\win\\style"), "/win/style");
    }

    #[test]
    fn joins_and_splits() {
        assert_eq!(join_path("/videos", "dir/1.mp4"), "/videos/dir/1.mp4");
        assert_eq!(
            split_path("/videos/dir/1.mp4"),
            ("/videos/dir".to_string(), "1.mp4".to_string())
        );
        assert_eq!(split_path("/1.mp4"), ("/".to_string(), "1.mp4".to_string()));
    }
}
