use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use super::{BlockAck, RemoteEntry, RemoteStorage, clean_path};
use crate::constants::{CODE_BLOCK_MISSING, CODE_FILE_NOT_EXIST, CODE_RAPID_NOT_FOUND};
use crate::error::RemoteError;
use crate::file::block_id;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Register,
    UploadBlock,
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Register(String),
    UploadBlock(String, usize),
    Finalize(String),
}

impl Call {
    fn operation(&self) -> Operation {
        match self {
            Call::List(_) => Operation::List,
            Call::Register(_) => Operation::Register,
            Call::UploadBlock(..) => Operation::UploadBlock,
            Call::Finalize(_) => Operation::Finalize,
        }
    }

    fn target(&self) -> &str {
        match self {
            Call::List(path)
            | Call::Register(path)
            | Call::UploadBlock(path, _)
            | Call::Finalize(path) => path,
        }
    }
}

struct Fault {
    operation: Operation,
    target: Option<String>,
    error: RemoteError,
    remaining: Option<usize>,
}

/// In-memory object store with scripted failures and a call log.
#[derive(Default)]
pub struct MockRemote {
    objects: DashMap<String, Bytes>,
    blocks: DashMap<String, Bytes>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<Call>>,
    block_delay: Mutex<Option<Duration>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, path: &str, data: impl Into<Bytes>) {
        self.objects.insert(clean_path(path), data.into());
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.objects.get(&clean_path(path)).map(|data| data.clone())
    }

    /// Every matching call fails with `error`.
    pub fn fail_always(&self, operation: Operation, error: RemoteError) {
        self.push_fault(operation, None, error, None);
    }

    /// The next `times` calls of `operation` on `target` fail with `error`.
    pub fn fail_times(&self, operation: Operation, target: &str, error: RemoteError, times: usize) {
        self.push_fault(operation, Some(clean_path(target)), error, Some(times));
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Drops every uploaded block, as the service does once they expire.
    pub fn expire_blocks(&self) {
        self.blocks.clear();
    }

    pub fn set_block_delay(&self, delay: Duration) {
        *lock(&self.block_delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    pub fn uploaded_blocks(&self, target: &str) -> Vec<usize> {
        let target = clean_path(target);
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                Call::UploadBlock(path, index) if *path == target => Some(*index),
                _ => None,
            })
            .collect()
    }

    fn push_fault(
        &self,
        operation: Operation,
        target: Option<String>,
        error: RemoteError,
        remaining: Option<usize>,
    ) {
        lock(&self.faults).push(Fault {
            operation,
            target,
            error,
            remaining,
        });
    }

    /// Logs the call, then fails it if a fault matches.
    fn enter(&self, call: Call) -> Result<(), RemoteError> {
        let mut faults = lock(&self.faults);
        let fault = faults.iter_mut().find(|fault| {
            fault.operation == call.operation()
                && fault
                    .target
                    .as_deref()
                    .is_none_or(|target| target == call.target())
                && fault.remaining != Some(0)
        });
        lock(&self.calls).push(call);

        match fault {
            Some(fault) => {
                if let Some(remaining) = fault.remaining.as_mut() {
                    *remaining -= 1;
                }
                Err(fault.error.clone())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStorage for MockRemote {
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let path = clean_path(path);
        self.enter(Call::List(path.clone()))?;

        let prefix = if path == "/" {
            path.clone()
        } else {
            format!("{path}/")
        };

        let mut entries = BTreeMap::new();
        for object in self.objects.iter() {
            let Some(relative) = object.key().strip_prefix(&prefix) else {
                continue;
            };
            let entry = match relative.split_once('/') {
                Some((dir, _)) => RemoteEntry {
                    name: dir.to_string(),
                    hash: String::new(),
                    size: 0,
                    is_dir: true,
                },
                None => RemoteEntry {
                    name: relative.to_string(),
                    hash: block_id(object.value()),
                    size: object.value().len() as u64,
                    is_dir: false,
                },
            };
            entries.insert(entry.name.clone(), entry);
        }

        if entries.is_empty() && path != "/" {
            return Err(RemoteError::service(CODE_FILE_NOT_EXIST, "file does not exist"));
        }
        Ok(entries.into_values().collect())
    }

    async fn register_by_fingerprint(
        &self,
        target: &str,
        full_hash: &str,
        _slice_hash: &str,
        _integrity: &str,
        length: u64,
    ) -> Result<(), RemoteError> {
        let target = clean_path(target);
        self.enter(Call::Register(target.clone()))?;

        let known = self
            .objects
            .iter()
            .find(|object| {
                object.value().len() as u64 == length && block_id(object.value()) == full_hash
            })
            .map(|object| object.value().clone());

        match known {
            Some(data) => {
                self.objects.insert(target, data);
                Ok(())
            }
            None => Err(RemoteError::service(
                CODE_RAPID_NOT_FOUND,
                "rapid upload file not found",
            )),
        }
    }

    async fn upload_block(
        &self,
        session_token: &str,
        block_index: usize,
        data: Bytes,
    ) -> Result<BlockAck, RemoteError> {
        let delay = *lock(&self.block_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enter(Call::UploadBlock(clean_path(session_token), block_index))?;

        let block_id = block_id(&data);
        self.blocks.insert(block_id.clone(), data);
        Ok(BlockAck { block_id })
    }

    async fn finalize(&self, target: &str, block_ids: &[String]) -> Result<(), RemoteError> {
        let target = clean_path(target);
        self.enter(Call::Finalize(target.clone()))?;

        let mut content = BytesMut::new();
        for id in block_ids {
            let Some(block) = self.blocks.get(id) else {
                return Err(RemoteError::service(
                    CODE_BLOCK_MISSING,
                    "block miss in superfile2",
                ));
            };
            content.extend_from_slice(block.value());
        }
        self.objects.insert(target, content.freeze());
        Ok(())
    }
}
