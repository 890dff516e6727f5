use std::path::PathBuf;
use std::sync::Arc;

use crate::config::TransferOptions;
use crate::constants::MAX_RAPID_UPLOAD_SIZE;
use crate::engine::TaskId;
use crate::error::TransferError;
use crate::file::FileFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Init,
    RapidUpload,
    Upload,
}

/// How a task finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// The target already holds identical content.
    DuplicateSkipped,
    RapidUploaded,
    Uploaded,
}

/// Result of running one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Goto(Step),
    Finished(Finish),
}

pub struct TransferTask {
    pub id: TaskId,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Opened on the first attempt and kept so hashes survive retries.
    pub fingerprint: Option<FileFingerprint>,
    pub step: Step,
    pub retry: u32,
    pub max_retry: u32,
    pub options: Arc<TransferOptions>,
}

impl TransferTask {
    pub fn new(
        id: TaskId,
        local_path: PathBuf,
        remote_path: String,
        options: Arc<TransferOptions>,
    ) -> Self {
        Self {
            id,
            local_path,
            remote_path,
            fingerprint: None,
            step: Step::Init,
            retry: 0,
            max_retry: options.max_retry,
            options,
        }
    }

    pub fn length(&self) -> u64 {
        self.fingerprint
            .as_ref()
            .map(FileFingerprint::length)
            .unwrap_or_default()
    }

    /// Opens the local file on first use.
    pub fn fingerprint_mut(&mut self) -> Result<&mut FileFingerprint, TransferError> {
        let fingerprint = match self.fingerprint.take() {
            Some(fingerprint) => fingerprint,
            None => FileFingerprint::open(&self.local_path)?,
        };
        Ok(self.fingerprint.insert(fingerprint))
    }

    pub fn can_retry(&self) -> bool {
        self.retry < self.max_retry
    }
}

/// Where `Init` leads: rapid upload only for files without resumable state or
/// known hashes, within the size limit, and when dedup is enabled.
pub fn after_init(
    has_state: bool,
    has_hashes: bool,
    options: &TransferOptions,
    length: u64,
) -> Transition {
    if has_state || has_hashes || options.disable_dedup || length > MAX_RAPID_UPLOAD_SIZE {
        Transition::Goto(Step::Upload)
    } else {
        Transition::Goto(Step::RapidUpload)
    }
}
