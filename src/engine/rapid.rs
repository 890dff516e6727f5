use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::watch;

use crate::constants::LARGE_FILE_NOTICE;
use crate::engine::Control;
use crate::error::{RemoteError, TransferError};
use crate::file::{FileFingerprint, Hashes};
use crate::ledger::{Ledger, TransferState};
use crate::remote::{RemoteStorage, clean_path, split_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// Same name and hash already listed at the target.
    Duplicate,
    /// The remote created the target from content it already had.
    Registered,
    /// Nothing to reuse; the file has to be transferred.
    Fallthrough,
}

/// Tries to complete an upload without sending the content.
///
/// On fallthrough the computed hashes are left in the ledger so a later
/// attempt can skip both hashing and this check. A task cancelled while its
/// file is hashed stops before anything is registered.
pub async fn dedup_check(
    remote: &dyn RemoteStorage,
    ledger: &Ledger,
    fingerprint: &mut FileFingerprint,
    target: &str,
    control: &watch::Receiver<Control>,
) -> Result<DedupOutcome, TransferError> {
    let target = clean_path(target);
    let (dir, name) = split_path(&target);

    let listing = match remote.list_directory(&dir).await {
        Ok(entries) => entries,
        // Most likely the directory does not exist yet.
        Err(err @ RemoteError::Service { .. }) => {
            log::debug!("Listing {dir} failed, assuming empty: {err}");
            Vec::new()
        }
        Err(err) => return Err(err.into()),
    };

    if fingerprint.length() >= LARGE_FILE_NOTICE {
        log::info!("Hashing {} for rapid upload...", fingerprint.path().display());
    }
    let length = fingerprint.length();
    let hashes = fingerprint.hashes_async().await?.clone();
    if *control.borrow() == Control::Cancelled {
        return Err(TransferError::Cancelled);
    }

    let duplicate = listing.iter().any(|entry| {
        !entry.is_dir && entry.name == name && entry.hash.eq_ignore_ascii_case(&hashes.full_hash)
    });
    if duplicate {
        return Ok(DedupOutcome::Duplicate);
    }

    match register(remote, &target, &hashes, length).await {
        Ok(()) => Ok(DedupOutcome::Registered),
        Err(err) if err.is_quota_exceeded() => Err(err.into()),
        Err(err) => {
            log::debug!("Rapid upload of {target} refused: {err}");
            ledger.save(
                &fingerprint.ledger_key(),
                TransferState::marker(length, Some(hashes)),
            );
            Ok(DedupOutcome::Fallthrough)
        }
    }
}

async fn register(
    remote: &dyn RemoteStorage,
    target: &str,
    hashes: &Hashes,
    length: u64,
) -> Result<(), RemoteError> {
    match remote
        .register_by_fingerprint(
            target,
            &hashes.full_hash,
            &hashes.slice_hash,
            &hashes.integrity,
            length,
        )
        .await
    {
        Err(err) if err.is_insert_forbidden() => Ok(()),
        result => result,
    }
}

/// Everything needed to rapid upload a file from elsewhere.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FileSum {
    pub path: PathBuf,
    pub length: u64,
    #[serde(flatten)]
    pub hashes: Hashes,
}

impl FileSum {
    pub fn rapid_upload_command(&self, target: &str) -> String {
        format!(
            "rapidupload --length {} --md5 {} --slicemd5 {} --crc32 {} {}",
            self.length,
            self.hashes.full_hash,
            self.hashes.slice_hash,
            self.hashes.integrity,
            clean_path(target)
        )
    }
}

pub fn sum_file<P: AsRef<Path>>(path: P) -> Result<FileSum, TransferError> {
    let mut fingerprint = FileFingerprint::open(path)?;
    let hashes = fingerprint.hashes()?.clone();
    Ok(FileSum {
        path: fingerprint.path().to_path_buf(),
        length: fingerprint.length(),
        hashes,
    })
}

/// Registers `target` from known hashes, without a local file.
pub async fn rapid_upload(
    remote: &dyn RemoteStorage,
    target: &str,
    hashes: &Hashes,
    length: u64,
) -> Result<String, RemoteError> {
    let target = clean_path(target);
    register(remote, &target, hashes, length).await?;
    log::info!("Rapid upload succeeded, saved to {target}");
    Ok(target)
}

/// Merges already uploaded blocks into `target`.
pub async fn create_super_file(
    remote: &dyn RemoteStorage,
    target: &str,
    block_ids: &[String],
) -> Result<String, RemoteError> {
    let target = clean_path(target);
    match remote.finalize(&target, block_ids).await {
        Err(err) if !err.is_insert_forbidden() => return Err(err),
        _ => {}
    }
    log::info!("Merged {} blocks into {target}", block_ids.len());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CODE_QUOTA_EXCEEDED;
    use crate::file::block_id;
    use crate::remote::mock::{MockRemote, Operation};
    use bytes::Bytes;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    fn running() -> watch::Receiver<Control> {
        watch::channel(Control::Running).1
    }

    fn local_file(data: &[u8]) -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        std::fs::write(&path, data).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn listed_duplicate_skips_register() {
        let (_dir, path) = local_file(b"content");
        let remote = MockRemote::new();
        remote.insert_object("/videos/movie.mp4", "content");
        let ledger = Ledger::in_memory();

        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        let outcome = dedup_check(&remote, &ledger, &mut fingerprint, "/videos/movie.mp4", &running())
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::Duplicate);
        assert_eq!(remote.count(Operation::Register), 0);
    }

    #[tokio::test]
    async fn same_name_different_content_registers() {
        let (_dir, path) = local_file(b"new content");
        let remote = MockRemote::new();
        remote.insert_object("/videos/movie.mp4", "old content");
        remote.insert_object("/backup/copy.mp4", "new content");
        let ledger = Ledger::in_memory();

        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        let outcome = dedup_check(&remote, &ledger, &mut fingerprint, "/videos/movie.mp4", &running())
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::Registered);
        assert_eq!(
            remote.object("/videos/movie.mp4").unwrap(),
            Bytes::from("new content")
        );
    }

    #[tokio::test]
    async fn unknown_content_falls_through_and_leaves_marker() {
        let (_dir, path) = local_file(b"fresh");
        let remote = MockRemote::new();
        let ledger = Ledger::in_memory();

        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        let outcome = dedup_check(&remote, &ledger, &mut fingerprint, "/new/dir/movie.mp4", &running())
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::Fallthrough);

        let marker = ledger.get(&fingerprint.ledger_key()).unwrap();
        assert!(marker.plan.is_none());
        assert_eq!(marker.hashes.unwrap().full_hash, block_id(b"fresh"));
    }

    #[tokio::test]
    async fn quota_exceeded_is_an_error() {
        let (_dir, path) = local_file(b"fresh");
        let remote = MockRemote::new();
        remote.fail_always(
            Operation::Register,
            RemoteError::service(CODE_QUOTA_EXCEEDED, "exceed quota"),
        );
        let ledger = Ledger::in_memory();

        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        let err = dedup_check(&remote, &ledger, &mut fingerprint, "/movie.mp4", &running())
            .await
            .unwrap_err();
        assert!(err.remote().unwrap().is_quota_exceeded());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn transport_error_while_listing_aborts() {
        let (_dir, path) = local_file(b"fresh");
        let remote = MockRemote::new();
        remote.fail_always(Operation::List, RemoteError::transport("timeout"));
        let ledger = Ledger::in_memory();

        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        let result = dedup_check(&remote, &ledger, &mut fingerprint, "/movie.mp4", &running()).await;
        assert!(matches!(result, Err(TransferError::Remote(RemoteError::Transport(_)))));
        assert!(fingerprint.cached_hashes().is_none());
    }

    #[tokio::test]
    async fn cancel_during_hashing_skips_register() {
        let (_dir, path) = local_file(b"content");
        let remote = MockRemote::new();
        remote.insert_object("/backup/copy.mp4", "content");
        let ledger = Ledger::in_memory();
        let (_switch, control) = watch::channel(Control::Cancelled);

        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        let result = dedup_check(&remote, &ledger, &mut fingerprint, "/videos/movie.mp4", &control).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(remote.count(Operation::Register), 0);
        assert!(remote.object("/videos/movie.mp4").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn sum_file_reports_rapid_upload_values() {
        let (_dir, path) = local_file(b"hello world");
        let sum = sum_file(&path).unwrap();
        assert_eq!(sum.length, 11);
        assert_eq!(sum.hashes.full_hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(sum.hashes.slice_hash, sum.hashes.full_hash);
        assert_eq!(
            sum.rapid_upload_command("/d/movie.mp4"),
            "rapidupload --length 11 --md5 5eb63bbbe01eeed093cb22bb8f5acdc3 \
             --slicemd5 5eb63bbbe01eeed093cb22bb8f5acdc3 --crc32 222957957 /d/movie.mp4"
        );

        let missing = sum_file(path.with_file_name("missing"));
        assert!(matches!(missing, Err(TransferError::FileUnreadable { .. })));
    }

    #[tokio::test]
    async fn standalone_commands() {
        let remote = MockRemote::new();
        remote.insert_object("/a", "abc");
        let hashes = Hashes {
            full_hash: block_id(b"abc"),
            slice_hash: block_id(b"abc"),
            integrity: String::new(),
        };
        assert_eq!(rapid_upload(&remote, "b//", &hashes, 3).await.unwrap(), "/b");

        let ack = remote.upload_block("/c", 0, Bytes::from("xyz")).await.unwrap();
        create_super_file(&remote, "/c", &[ack.block_id]).await.unwrap();
        assert_eq!(remote.object("/c").unwrap(), Bytes::from("xyz"));
    }
}
