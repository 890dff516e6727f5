use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use crc::{CRC_32_ISO_HDLC, Crc};
use memmap2::{Mmap, MmapOptions};
use serde::{Deserialize, Serialize};

use crate::constants::SLICE_HASH_SIZE;
use crate::error::TransferError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Content hashes used to register a file without transferring it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hashes {
    /// md5 of the whole file, lowercase hex.
    pub full_hash: String,
    /// md5 of the leading [`SLICE_HASH_SIZE`] bytes, lowercase hex.
    pub slice_hash: String,
    /// crc32 (IEEE) of the whole file, decimal.
    pub integrity: String,
}

/// A local file's identity plus lazily computed content hashes.
#[derive(Debug, Clone)]
pub struct FileFingerprint {
    path: PathBuf,
    length: u64,
    modified: u64,
    hashes: Option<Hashes>,
}

impl FileFingerprint {
    /// Stats and opens `path`. Only the length is known afterwards.
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, TransferError> {
        let path = path.as_ref();
        let unreadable = |source| TransferError::FileUnreadable {
            path: path.to_path_buf(),
            source,
        };

        let (length, modified) = sanity_check(path).map_err(unreadable)?;
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        Ok(Self {
            path,
            length,
            modified,
            hashes: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Key of this file in the transfer ledger. Derived from identity
    /// (path, length, mtime) so it is available before any hashing.
    pub fn ledger_key(&self) -> String {
        let identity = format!("{}\0{}\0{}", self.path.display(), self.length, self.modified);
        hex::encode(blake3::hash(identity.as_bytes()).as_bytes())
    }

    pub fn cached_hashes(&self) -> Option<&Hashes> {
        self.hashes.as_ref()
    }

    /// Seeds the cache with hashes computed by an earlier attempt.
    pub fn restore_hashes(&mut self, hashes: Hashes) {
        self.hashes.get_or_insert(hashes);
    }

    /// Computes the hashes once; later calls return the cached value.
    pub fn hashes(&mut self) -> std::result::Result<&Hashes, TransferError> {
        let hashes = match self.hashes.take() {
            Some(hashes) => hashes,
            None => compute_hashes(&self.path).map_err(|source| {
                TransferError::FileUnreadable {
                    path: self.path.clone(),
                    source,
                }
            })?,
        };
        Ok(self.hashes.insert(hashes))
    }

    /// Same as [`hashes`](Self::hashes), hashing on the blocking pool.
    pub async fn hashes_async(&mut self) -> std::result::Result<&Hashes, TransferError> {
        if self.hashes.is_none() {
            let path = self.path.clone();
            let computed = tokio::task::spawn_blocking(move || compute_hashes(&path))
                .await
                .map_err(Error::other)
                .and_then(|hashes| hashes)
                .map_err(|source| TransferError::FileUnreadable {
                    path: self.path.clone(),
                    source,
                })?;
            self.hashes = Some(computed);
        }
        self.hashes()
    }
}

/// Returns (length, mtime in ns) of a readable regular file.
pub fn sanity_check<P: AsRef<Path>>(path: P) -> Result<(u64, u64)> {
    let file = File::open(&path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(Error::new(
            ErrorKind::IsADirectory,
            "A normal file is expected.",
        ));
    }

    let modified = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();

    Ok((metadata.len(), modified))
}

fn mmap_file(file: &File, length: u64) -> Result<Option<Mmap>> {
    if length == 0 {
        return Ok(None);
    }
    let length = usize::try_from(length)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "File too large to map"))?;
    let mmap = unsafe { MmapOptions::new().len(length).map(file)? };
    Ok(Some(mmap))
}

pub fn compute_hashes<P: AsRef<Path>>(path: P) -> Result<Hashes> {
    let file = File::open(path)?;
    let length = file.metadata()?.len();
    let mmap = mmap_file(&file, length)?;
    let data: &[u8] = mmap.as_deref().unwrap_or_default();

    let slice_end = data.len().min(SLICE_HASH_SIZE as usize);
    Ok(Hashes {
        full_hash: block_id(data),
        slice_hash: block_id(&data[..slice_end]),
        integrity: CRC32.checksum(data).to_string(),
    })
}

/// Identifier the remote assigns to an uploaded block.
pub fn block_id(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

pub fn read_block(file: &File, offset: u64, length: usize) -> Result<Bytes> {
    let mut buffer = vec![0u8; length];
    file.read_exact_at(&mut buffer, offset)?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn hashes_of_known_content() -> Result<()> {
        let dir = tempdir()?;
        let path = write_file(dir.path(), "hello.txt", b"hello world");

        let hashes = compute_hashes(&path)?;
        assert_eq!(hashes.full_hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(hashes.slice_hash, hashes.full_hash);
        assert_eq!(hashes.integrity, "222957957");
        Ok(())
    }

    #[test]
    fn slice_hash_covers_only_the_prefix() -> Result<()> {
        let dir = tempdir()?;
        let mut data = vec![0x5a; SLICE_HASH_SIZE as usize];
        data.extend_from_slice(b"tail");
        let path = write_file(dir.path(), "big.bin", &data);

        let hashes = compute_hashes(&path)?;
        assert_eq!(
            hashes.slice_hash,
            format!("{:x}", md5::compute(&data[..SLICE_HASH_SIZE as usize]))
        );
        assert_ne!(hashes.slice_hash, hashes.full_hash);
        Ok(())
    }

    #[test]
    fn empty_file_hashes() -> Result<()> {
        let dir = tempdir()?;
        let path = write_file(dir.path(), "empty", b"");
        let hashes = compute_hashes(&path)?;
        assert_eq!(hashes.full_hash, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hashes.integrity, "0");
        Ok(())
    }

    #[test]
    fn fingerprint_is_lazy_and_cached() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", b"abc");

        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        assert_eq!(fingerprint.length(), 3);
        assert_eq!(fingerprint.file_name(), "a.bin");
        assert!(fingerprint.cached_hashes().is_none());

        let first = fingerprint.hashes().unwrap().clone();
        // Content changes are not observed once cached.
        std::fs::write(&path, b"xyz").unwrap();
        assert_eq!(fingerprint.hashes().unwrap(), &first);
    }

    #[test]
    fn ledger_key_depends_on_identity() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "a.bin", b"same");
        let b = write_file(dir.path(), "b.bin", b"same");

        let key_a = FileFingerprint::open(&a).unwrap().ledger_key();
        assert_eq!(key_a, FileFingerprint::open(&a).unwrap().ledger_key());
        assert_ne!(key_a, FileFingerprint::open(&b).unwrap().ledger_key());
    }

    #[test]
    fn missing_or_directory_is_unreadable() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FileFingerprint::open(dir.path().join("missing")),
            Err(TransferError::FileUnreadable { .. })
        ));
        assert!(matches!(
            FileFingerprint::open(dir.path()),
            Err(TransferError::FileUnreadable { .. })
        ));
    }

    #[test]
    fn read_block_at_offset() -> Result<()> {
        let dir = tempdir()?;
        let path = write_file(dir.path(), "blocks", b"0123456789");
        let file = File::open(&path)?;
        assert_eq!(&read_block(&file, 4, 3)?[..], b"456");
        assert!(read_block(&file, 8, 5).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn async_hashes_match_sync() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", b"payload");
        let mut fingerprint = FileFingerprint::open(&path).unwrap();
        let hashes = fingerprint.hashes_async().await.unwrap().clone();
        assert_eq!(hashes, compute_hashes(&path).unwrap());
    }
}
