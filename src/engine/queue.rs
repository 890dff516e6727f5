use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flume::{Receiver, Sender};
use serde::Serialize;
use tokio::sync::watch;
use walkdir::WalkDir;

use super::rapid::dedup_check;
use super::task::after_init;
use super::{
    ChunkedSession, Control, DedupOutcome, Engine, Finish, Step, TaskHandle, TransferTask,
    Transition,
};
use crate::config::TransferOptions;
use crate::constants::RETRY_BACKOFF_FACTOR;
use crate::error::{TransferError, Verdict, classify};
use crate::plan::BlockPlan;
use crate::progress::{Phase, ProgressEvent};
use crate::remote::{clean_path, join_path};
use crate::util::rate::RateLimiter;

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Bytes of every file that completed, whether transferred or not.
    pub total_bytes: u64,
}

struct Entry {
    task: TransferTask,
    control: watch::Receiver<Control>,
}

/// Resolves files and directories into (local file, remote path) pairs.
///
/// A remote path is `target_dir` joined with the file's path relative to the
/// parent of the argument it was found under. Missing paths are skipped.
pub fn expand_paths<P: AsRef<Path>>(paths: &[P], target_dir: &str) -> Vec<(PathBuf, String)> {
    let mut resolved = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!("{} does not exist, skipped", path.display());
            continue;
        }
        let base = path.parent().unwrap_or(Path::new(""));

        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Skipped unreadable entry under {}: {err}", path.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(base) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            resolved.push((entry.into_path(), join_path(target_dir, &relative)));
        }
    }
    resolved
}

/// FIFO of transfer tasks, run one task at a time.
pub struct TransferQueue {
    engine: Arc<Engine>,
    tasks: VecDeque<Entry>,
    requeue_tx: Sender<Entry>,
    requeue_rx: Receiver<Entry>,
    /// Tasks sleeping out a retry backoff or parked while paused.
    waiting: usize,
}

impl TransferQueue {
    pub fn new(engine: Arc<Engine>) -> Self {
        let (requeue_tx, requeue_rx) = flume::unbounded();
        Self {
            engine,
            tasks: VecDeque::new(),
            requeue_tx,
            requeue_rx,
            waiting: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len() + self.waiting
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue_transfer<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        target_dir: &str,
        options: TransferOptions,
    ) -> Vec<TaskHandle> {
        let options = Arc::new(options);
        let target_dir = clean_path(target_dir);

        expand_paths(paths, &target_dir)
            .into_iter()
            .map(|(local_path, remote_path)| {
                let id = self.engine.allocate_id();
                let control = self.engine.controls.register(id);
                log::info!("[{id}] Enqueued {} -> {remote_path}", local_path.display());
                self.engine
                    .bus
                    .publish(ProgressEvent::new(id, Phase::Enqueued, remote_path.as_str()));

                let handle = TaskHandle {
                    id,
                    local_path: local_path.clone(),
                    remote_path: remote_path.clone(),
                    engine: Arc::clone(&self.engine),
                };
                let task = TransferTask::new(id, local_path, remote_path, Arc::clone(&options));
                self.tasks.push_back(Entry { task, control });
                handle
            })
            .collect()
    }

    /// Runs until no task is queued or waiting for a retry.
    pub async fn run(&mut self) -> QueueSummary {
        let mut summary = QueueSummary::default();

        while let Some(mut entry) = self.next().await {
            let id = entry.task.id;
            let control = *entry.control.borrow_and_update();
            match control {
                Control::Running => {}
                Control::Paused => {
                    self.park(entry);
                    continue;
                }
                Control::Cancelled => {
                    self.cancelled(entry, &mut summary);
                    continue;
                }
            }

            log::info!(
                "[{id}] Uploading {} -> {} (attempt {})",
                entry.task.local_path.display(),
                entry.task.remote_path,
                entry.task.retry + 1
            );
            let opened = entry.task.fingerprint_mut().map(|fingerprint| fingerprint.length());
            let result = match opened {
                Ok(length) => {
                    self.engine.bus.publish(
                        ProgressEvent::new(id, Phase::Started, entry.task.remote_path.as_str())
                            .bytes(0, length)
                            .retry(entry.task.retry, entry.task.max_retry),
                    );
                    self.execute(&mut entry).await
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(finish) => self.succeeded(entry, finish, &mut summary),
                Err(TransferError::Cancelled) => self.cancelled(entry, &mut summary),
                Err(err) => match classify(&err) {
                    Verdict::Continue => self.succeeded(entry, Finish::Uploaded, &mut summary),
                    Verdict::Retry if entry.task.can_retry() => self.retry(entry, err),
                    Verdict::Retry | Verdict::Terminal => self.failed(entry, err, &mut summary),
                },
            }
        }

        log::info!(
            "Queue finished: {} succeeded, {} failed, {} cancelled",
            summary.succeeded,
            summary.failed,
            summary.cancelled
        );
        summary
    }

    async fn next(&mut self) -> Option<Entry> {
        while let Ok(entry) = self.requeue_rx.try_recv() {
            self.waiting -= 1;
            self.tasks.push_back(entry);
        }
        if let Some(entry) = self.tasks.pop_front() {
            return Some(entry);
        }
        if self.waiting == 0 {
            return None;
        }

        // Every remaining task is backing off or paused. The queue holds a
        // sender, so this only waits for a timer or a control change.
        let entry = self.requeue_rx.recv_async().await.ok()?;
        self.waiting -= 1;
        Some(entry)
    }

    /// Sets a paused task aside until it is resumed or cancelled, then puts
    /// it back at the tail.
    fn park(&mut self, mut entry: Entry) {
        log::info!("[{}] Paused, parked until resumed", entry.task.id);
        self.waiting += 1;
        let requeue = self.requeue_tx.clone();
        tokio::spawn(async move {
            while *entry.control.borrow_and_update() == Control::Paused {
                if entry.control.changed().await.is_err() {
                    break;
                }
            }
            let _ = requeue.send(entry);
        });
    }

    async fn execute(&self, entry: &mut Entry) -> Result<Finish, TransferError> {
        loop {
            let transition = match entry.task.step {
                Step::Init => self.init(&mut entry.task)?,
                Step::RapidUpload => self.rapid_upload(&mut entry.task, &entry.control).await?,
                Step::Upload => self.upload(&mut entry.task, &entry.control).await?,
            };
            log::debug!("[{}] {:?} -> {transition:?}", entry.task.id, entry.task.step);

            match transition {
                Transition::Goto(step) => entry.task.step = step,
                Transition::Finished(finish) => return Ok(finish),
            }
        }
    }

    fn init(&self, task: &mut TransferTask) -> Result<Transition, TransferError> {
        let id = task.id;
        let options = Arc::clone(&task.options);
        let fingerprint = task.fingerprint_mut()?;

        let state = self.engine.ledger.get(&fingerprint.ledger_key());
        let has_state = state.as_ref().is_some_and(|state| state.plan.is_some());
        if let Some(hashes) = state.and_then(|state| state.hashes) {
            log::debug!("[{id}] Restored hashes from the ledger");
            fingerprint.restore_hashes(hashes);
        }
        let has_hashes = fingerprint.cached_hashes().is_some();

        Ok(after_init(
            has_state,
            has_hashes,
            &options,
            fingerprint.length(),
        ))
    }

    async fn rapid_upload(
        &self,
        task: &mut TransferTask,
        control: &watch::Receiver<Control>,
    ) -> Result<Transition, TransferError> {
        let Some(fingerprint) = task.fingerprint.as_mut() else {
            return Ok(Transition::Goto(Step::Init));
        };

        let outcome = dedup_check(
            self.engine.remote.as_ref(),
            &self.engine.ledger,
            fingerprint,
            &task.remote_path,
            control,
        )
        .await?;

        Ok(match outcome {
            DedupOutcome::Duplicate => Transition::Finished(Finish::DuplicateSkipped),
            DedupOutcome::Registered => Transition::Finished(Finish::RapidUploaded),
            DedupOutcome::Fallthrough => Transition::Goto(Step::Upload),
        })
    }

    async fn upload(
        &self,
        task: &mut TransferTask,
        control: &watch::Receiver<Control>,
    ) -> Result<Transition, TransferError> {
        let Some(fingerprint) = task.fingerprint.as_ref() else {
            return Ok(Transition::Goto(Step::Init));
        };
        let config = &self.engine.config;
        let length = fingerprint.length();

        let session = ChunkedSession {
            remote: Arc::clone(&self.engine.remote),
            ledger: Arc::clone(&self.engine.ledger),
            limiter: Arc::new(RateLimiter::new(task.options.max_rate)),
            control: control.clone(),
            local_path: fingerprint.path().to_path_buf(),
            target: task.remote_path.clone(),
            ledger_key: fingerprint.ledger_key(),
            length,
            hashes: fingerprint.cached_hashes().cloned(),
            plan: BlockPlan::new(length, config.min_block_size, task.options.disable_splitting),
            parallelism: task.options.parallelism,
            progress_interval: config.progress_interval(),
            ledger_flush_interval: config.ledger_flush_interval(),
        };
        log::debug!("[{}] {}", task.id, session.plan);

        let bus = &self.engine.bus;
        session
            .run(|status| {
                let mut event = ProgressEvent::new(task.id, Phase::Transferring, task.remote_path.as_str())
                    .bytes(status.uploaded, status.total)
                    .retry(task.retry, task.max_retry);
                event.speed = status.speed;
                event.elapsed_ms = status.elapsed.as_millis() as u64;
                bus.publish(event);
            })
            .await?;

        Ok(Transition::Finished(Finish::Uploaded))
    }

    fn succeeded(&self, entry: Entry, finish: Finish, summary: &mut QueueSummary) {
        let task = entry.task;
        let length = task.length();
        let bus = &self.engine.bus;

        match finish {
            Finish::DuplicateSkipped => {
                log::info!("[{}] {} already exists, skipped", task.id, task.remote_path);
                bus.publish(ProgressEvent::new(task.id, Phase::DuplicateSkipped, task.remote_path.as_str()));
            }
            Finish::RapidUploaded => {
                log::info!("[{}] Rapid upload succeeded: {}", task.id, task.remote_path);
                bus.publish(ProgressEvent::new(task.id, Phase::RapidUploaded, task.remote_path.as_str()));
            }
            Finish::Uploaded => {
                log::info!("[{}] Uploaded {}", task.id, task.remote_path);
            }
        }
        bus.publish(
            ProgressEvent::new(task.id, Phase::Succeeded, task.remote_path)
                .bytes(length, length)
                .retry(task.retry, task.max_retry),
        );

        self.engine.controls.unregister(task.id);
        summary.succeeded += 1;
        summary.total_bytes += length;
    }

    fn retry(&mut self, entry: Entry, err: TransferError) {
        let mut entry = entry;
        let task = &mut entry.task;
        task.retry += 1;
        let delay = self.engine.config.retry_backoff_unit() * RETRY_BACKOFF_FACTOR * task.retry;

        log::warn!(
            "[{}] Attempt failed: {err}. Retry {}/{} in {delay:?}",
            task.id,
            task.retry,
            task.max_retry
        );
        self.engine.bus.publish(
            ProgressEvent::new(task.id, Phase::Retrying, task.remote_path.as_str())
                .retry(task.retry, task.max_retry)
                .error(&err),
        );

        if delay.is_zero() {
            self.tasks.push_back(entry);
            return;
        }
        self.waiting += 1;
        let requeue = self.requeue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = requeue.send(entry);
        });
    }

    fn failed(&self, entry: Entry, err: TransferError, summary: &mut QueueSummary) {
        let task = entry.task;
        log::error!("[{}] Upload of {} failed: {err}", task.id, task.remote_path);
        self.engine.bus.publish(
            ProgressEvent::new(task.id, Phase::Failed, task.remote_path)
                .retry(task.retry, task.max_retry)
                .error(err),
        );
        self.engine.controls.unregister(task.id);
        summary.failed += 1;
    }

    fn cancelled(&self, entry: Entry, summary: &mut QueueSummary) {
        let task = entry.task;
        log::info!("[{}] Cancelled {}", task.id, task.remote_path);
        self.engine
            .bus
            .publish(ProgressEvent::new(task.id, Phase::Cancelled, task.remote_path));
        self.engine.controls.unregister(task.id);
        summary.cancelled += 1;
    }
}
