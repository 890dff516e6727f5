//! Parallel block transfer of one file with resumable progress.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_more::From;
use flume::{Receiver, Sender};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::Control;
use crate::error::TransferError;
use crate::file::{Hashes, block_id, read_block};
use crate::ledger::{BlockRecord, Ledger, TransferState};
use crate::plan::BlockPlan;
use crate::progress::SpeedMeter;
use crate::remote::RemoteStorage;
use crate::util::rate::RateLimiter;

const SPEED_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Planning,
    Transferring,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub uploaded: u64,
    pub total: u64,
    pub speed: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Acked {
    index: usize,
    block_id: String,
    bytes: u64,
}

#[derive(Debug)]
struct Failed {
    index: usize,
    error: TransferError,
}

#[derive(From, Debug)]
enum WorkerEvent {
    Acked(Acked),
    Failed(Failed),
}

/// Everything a session needs, assembled by the queue.
pub struct ChunkedSession {
    pub remote: Arc<dyn RemoteStorage>,
    pub ledger: Arc<Ledger>,
    pub limiter: Arc<RateLimiter>,
    pub control: watch::Receiver<Control>,
    pub local_path: PathBuf,
    pub target: String,
    pub ledger_key: String,
    pub length: u64,
    pub hashes: Option<Hashes>,
    pub plan: BlockPlan,
    pub parallelism: usize,
    pub progress_interval: Duration,
    pub ledger_flush_interval: Duration,
}

/// Mutable state, owned by the coordinating task only.
struct Progress {
    blocks: Vec<Option<String>>,
    uploaded: u64,
    started: Instant,
    meter: SpeedMeter,
}

impl ChunkedSession {
    fn snapshot(&self, progress: &Progress) -> TransferState {
        TransferState {
            length: self.length,
            plan: Some(self.plan),
            hashes: self.hashes.clone(),
            blocks: progress
                .blocks
                .iter()
                .enumerate()
                .filter_map(|(index, id)| {
                    id.clone().map(|id| BlockRecord { index, id })
                })
                .collect(),
        }
    }

    fn status(&self, progress: &mut Progress) -> SessionStatus {
        let now = Instant::now();
        SessionStatus {
            uploaded: progress.uploaded,
            total: self.length,
            speed: progress.meter.update(now, progress.uploaded),
            elapsed: now.duration_since(progress.started),
        }
    }

    /// Restores completed blocks, refusing state recorded under another plan.
    fn restore(&self) -> Result<Vec<Option<String>>, TransferError> {
        let mut blocks = vec![None; self.plan.block_count];
        let Some(state) = self.ledger.get(&self.ledger_key) else {
            return Ok(blocks);
        };
        let Some(persisted) = state.plan else {
            // Hash marker left by the rapid upload check.
            return Ok(blocks);
        };

        if persisted != self.plan || state.length != self.length {
            self.ledger.remove(&self.ledger_key);
            return Err(TransferError::StateInconsistency {
                persisted,
                planned: self.plan,
            });
        }

        for record in state.blocks {
            if let Some(slot) = blocks.get_mut(record.index) {
                *slot = Some(record.id);
            }
        }
        Ok(blocks)
    }

    pub async fn run<F>(self, mut on_status: F) -> Result<(), TransferError>
    where
        F: FnMut(SessionStatus),
    {
        let mut state = SessionState::Planning;
        log::debug!("{}: {state:?} {}", self.target, self.plan);

        let blocks = self.restore()?;
        let pending: Vec<usize> = (0..blocks.len()).filter(|i| blocks[*i].is_none()).collect();
        let uploaded = blocks
            .iter()
            .enumerate()
            .filter(|(_, id)| id.is_some())
            .map(|(index, _)| self.plan.block_range(index, self.length).1 as u64)
            .sum();
        if pending.len() < blocks.len() {
            log::info!(
                "{}: resuming, {} of {} blocks already uploaded",
                self.target,
                blocks.len() - pending.len(),
                blocks.len()
            );
        }

        let file = File::open(&self.local_path)
            .map(Arc::new)
            .map_err(|source| TransferError::FileUnreadable {
                path: self.local_path.clone(),
                source,
            })?;

        let started = Instant::now();
        let mut progress = Progress {
            blocks,
            uploaded,
            started,
            meter: SpeedMeter::new(SPEED_WINDOW),
        };
        progress.meter.update(started, uploaded);

        state = SessionState::Transferring;
        log::debug!("{}: {state:?} {} blocks", self.target, pending.len());
        let outcome = self.transfer(file, pending, &mut progress, &mut on_status).await;
        on_status(self.status(&mut progress));

        if let Err(err) = outcome {
            state = SessionState::Failed;
            log::debug!("{}: {state:?}: {err}", self.target);
            self.ledger.save(&self.ledger_key, self.snapshot(&progress));
            return Err(err);
        }

        state = SessionState::Finalizing;
        log::debug!("{}: {state:?}", self.target);
        let block_ids: Vec<String> = progress.blocks.iter().flatten().cloned().collect();
        match self.remote.finalize(&self.target, &block_ids).await {
            Ok(()) => {}
            Err(err) if err.is_insert_forbidden() => {}
            Err(err) if err.is_block_missing() => {
                // The blocks are gone; resuming from this state can never work.
                self.ledger.remove(&self.ledger_key);
                return Err(err.into());
            }
            Err(err) => {
                self.ledger.save(&self.ledger_key, self.snapshot(&progress));
                return Err(err.into());
            }
        }

        state = SessionState::Done;
        log::debug!("{}: {state:?}", self.target);
        self.ledger.remove(&self.ledger_key);
        Ok(())
    }

    async fn transfer<F>(
        &self,
        file: Arc<File>,
        pending: Vec<usize>,
        progress: &mut Progress,
        on_status: &mut F,
    ) -> Result<(), TransferError>
    where
        F: FnMut(SessionStatus),
    {
        if pending.is_empty() {
            return Ok(());
        }

        let (work_tx, work_rx) = flume::unbounded();
        for index in &pending {
            let _ = work_tx.send(*index);
        }
        drop(work_tx);

        let (event_tx, event_rx) = flume::unbounded::<WorkerEvent>();
        let workers = self.parallelism.clamp(1, pending.len());
        for worker_id in 0..workers {
            tokio::spawn(
                BlockWorker {
                    worker_id,
                    file: Arc::clone(&file),
                    plan: self.plan,
                    length: self.length,
                    target: self.target.clone(),
                    remote: Arc::clone(&self.remote),
                    limiter: Arc::clone(&self.limiter),
                    work: work_rx.clone(),
                    events: event_tx.clone(),
                    control: self.control.clone(),
                }
                .run(),
            );
        }
        drop(event_tx);

        let mut control = self.control.clone();
        let mut control_open = true;
        let mut ticker = tokio::time::interval(self.progress_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_flush = Instant::now();
        let mut first_error: Option<TransferError> = None;

        loop {
            tokio::select! {
                event = event_rx.recv_async() => match event {
                    Ok(WorkerEvent::Acked(ack)) => {
                        progress.blocks[ack.index] = Some(ack.block_id);
                        progress.uploaded += ack.bytes;
                        if last_flush.elapsed() >= self.ledger_flush_interval {
                            self.ledger.save(&self.ledger_key, self.snapshot(progress));
                            last_flush = Instant::now();
                        }
                    }
                    Ok(WorkerEvent::Failed(failed)) => {
                        log::debug!("{}: block {} failed: {}", self.target, failed.index, failed.error);
                        if first_error.is_none() {
                            // Stop handing out blocks; in-flight ones still report.
                            work_rx.drain().for_each(drop);
                            first_error = Some(failed.error);
                        }
                    }
                    // Every worker has exited.
                    Err(_) => break,
                },

                _ = ticker.tick() => on_status(self.status(progress)),

                changed = control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    } else if *control.borrow_and_update() == Control::Cancelled {
                        work_rx.drain().for_each(drop);
                        first_error.get_or_insert(TransferError::Cancelled);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if progress.blocks.iter().any(Option::is_none) => {
                // Workers stopped on their own, only cancellation does that.
                Err(TransferError::Cancelled)
            }
            None => Ok(()),
        }
    }
}

struct BlockWorker {
    worker_id: usize,
    file: Arc<File>,
    plan: BlockPlan,
    length: u64,
    target: String,
    remote: Arc<dyn RemoteStorage>,
    limiter: Arc<RateLimiter>,
    work: Receiver<usize>,
    events: Sender<WorkerEvent>,
    control: watch::Receiver<Control>,
}

impl BlockWorker {
    /// Waits out a pause; false once the transfer is cancelled.
    async fn wait_running(&mut self) -> bool {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Running => return true,
                Control::Cancelled => return false,
                Control::Paused => {
                    if self.control.changed().await.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    async fn upload(&self, index: usize) -> Result<Acked, TransferError> {
        let (offset, length) = self.plan.block_range(index, self.length);
        let file = Arc::clone(&self.file);
        let data = tokio::task::spawn_blocking(move || read_block(&file, offset, length))
            .await
            .map_err(std::io::Error::other)
            .and_then(|data| data)
            .map_err(|source| TransferError::BlockRead { index, source })?;

        self.limiter.acquire(length as u64).await;
        let block_id = match self
            .remote
            .upload_block(&self.target, index, data.clone())
            .await
        {
            Ok(ack) => ack.block_id,
            Err(err) if err.is_insert_forbidden() => block_id(&data),
            Err(err) => return Err(TransferError::Remote(err)),
        };

        Ok(Acked {
            index,
            block_id,
            bytes: length as u64,
        })
    }

    async fn run(mut self) {
        while self.wait_running().await {
            let Ok(index) = self.work.recv_async().await else {
                break;
            };
            log::trace!("worker {} uploading block {index}", self.worker_id);

            let event: WorkerEvent = match self.upload(index).await {
                Ok(acked) => acked.into(),
                Err(error) => Failed { index, error }.into(),
            };
            let failed = matches!(event, WorkerEvent::Failed(_));
            if self.events.send(event).is_err() || failed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CODE_BLOCK_MISSING, KIB};
    use crate::error::RemoteError;
    use crate::remote::mock::{MockRemote, Operation};
    use crate::util::generate_random;
    use bytes::Bytes;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        data: Vec<u8>,
        remote: Arc<MockRemote>,
        ledger: Arc<Ledger>,
        control: watch::Sender<Control>,
    }

    fn fixture(size: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data = generate_random(size);
        std::fs::write(&path, &data).unwrap();
        Fixture {
            _dir: dir,
            path,
            data,
            remote: Arc::new(MockRemote::new()),
            ledger: Arc::new(Ledger::in_memory()),
            control: watch::channel(Control::Running).0,
        }
    }

    impl Fixture {
        fn session(&self, block_size: u64) -> ChunkedSession {
            let length = self.data.len() as u64;
            ChunkedSession {
                remote: self.remote.clone(),
                ledger: self.ledger.clone(),
                limiter: Arc::new(RateLimiter::unlimited()),
                control: self.control.subscribe(),
                local_path: self.path.clone(),
                target: "/up/data.bin".into(),
                ledger_key: "key".into(),
                length,
                hashes: None,
                plan: BlockPlan::new(length, block_size, false),
                parallelism: 3,
                progress_interval: Duration::from_millis(50),
                ledger_flush_interval: Duration::ZERO,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_snapshots_are_throttled() {
        let fx = fixture(8 * KIB as usize);
        fx.remote.set_block_delay(Duration::from_millis(100));
        let session = ChunkedSession {
            parallelism: 1,
            ledger_flush_interval: Duration::from_millis(450),
            ..fx.session(KIB)
        };

        // Blocks are acked every 100ms; cancel lands while the seventh is in flight.
        let (result, ()) = tokio::join!(session.run(|_| {}), async {
            tokio::time::sleep(Duration::from_millis(650)).await;
            fx.control.send_replace(Control::Cancelled);
        });
        assert!(matches!(result, Err(TransferError::Cancelled)));

        // One periodic snapshot after the fifth ack, one when the session stops.
        assert_eq!(fx.ledger.save_count(), 2);
        let state = fx.ledger.get("key").unwrap();
        assert_eq!(state.blocks.len(), 7);
        assert_eq!(fx.remote.count(Operation::Finalize), 0);
    }

    #[tokio::test]
    async fn uploads_all_blocks_and_merges_in_order() {
        let fx = fixture(10 * KIB as usize + 17);
        let mut statuses = Vec::new();
        fx.session(KIB).run(|status| statuses.push(status)).await.unwrap();

        assert_eq!(fx.remote.object("/up/data.bin").unwrap(), Bytes::from(fx.data.clone()));
        let mut uploaded = fx.remote.uploaded_blocks("/up/data.bin");
        uploaded.sort();
        assert_eq!(uploaded, (0..11).collect::<Vec<_>>());
        assert!(fx.ledger.get("key").is_none());

        let last = statuses.last().unwrap();
        assert_eq!(last.uploaded, last.total);
    }

    #[tokio::test]
    async fn resumes_only_missing_blocks() {
        let fx = fixture(8 * KIB as usize);
        let session = fx.session(KIB);
        let plan = session.plan;

        // Blocks 0..=4 were acknowledged by an earlier run.
        for index in 0..5 {
            let (offset, len) = plan.block_range(index, fx.data.len() as u64);
            let chunk = Bytes::copy_from_slice(&fx.data[offset as usize..offset as usize + len]);
            fx.remote.upload_block("/elsewhere", index, chunk).await.unwrap();
        }
        let blocks = (0..5)
            .map(|index| {
                let (offset, len) = plan.block_range(index, fx.data.len() as u64);
                BlockRecord {
                    index,
                    id: block_id(&fx.data[offset as usize..offset as usize + len]),
                }
            })
            .collect();
        fx.ledger.put(
            "key",
            TransferState {
                length: fx.data.len() as u64,
                plan: Some(plan),
                hashes: None,
                blocks,
            },
        );

        session.run(|_| {}).await.unwrap();

        let mut uploaded = fx.remote.uploaded_blocks("/up/data.bin");
        uploaded.sort();
        assert_eq!(uploaded, vec![5, 6, 7]);
        assert_eq!(fx.remote.object("/up/data.bin").unwrap(), Bytes::from(fx.data.clone()));
    }

    #[tokio::test]
    async fn refuses_state_from_another_plan() {
        let fx = fixture(8 * KIB as usize);
        fx.ledger.put(
            "key",
            TransferState {
                length: fx.data.len() as u64,
                plan: Some(BlockPlan::new(fx.data.len() as u64, 2 * KIB, false)),
                hashes: None,
                blocks: vec![],
            },
        );

        let err = fx.session(KIB).run(|_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::StateInconsistency { .. }));
        assert!(fx.ledger.get("key").is_none());
        assert_eq!(fx.remote.count(Operation::UploadBlock), 0);
    }

    #[tokio::test]
    async fn failed_block_keeps_progress_for_retry() {
        let fx = fixture(4 * KIB as usize);
        fx.remote.fail_times(
            Operation::UploadBlock,
            "/up/data.bin",
            RemoteError::transport("connection reset"),
            1,
        );

        let mut session = fx.session(KIB);
        session.parallelism = 1;
        let err = session.run(|_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::Remote(RemoteError::Transport(_))));
        assert_eq!(fx.remote.count(Operation::Finalize), 0);

        let state = fx.ledger.get("key").unwrap();
        assert!(state.plan.is_some());

        // The retry resumes from the saved state and completes.
        fx.session(KIB).run(|_| {}).await.unwrap();
        assert_eq!(fx.remote.object("/up/data.bin").unwrap(), Bytes::from(fx.data.clone()));
    }

    #[tokio::test]
    async fn missing_blocks_at_finalize_drop_state() {
        let fx = fixture(2 * KIB as usize);
        fx.remote.fail_always(
            Operation::Finalize,
            RemoteError::service(CODE_BLOCK_MISSING, "block miss in superfile2"),
        );

        let err = fx.session(KIB).run(|_| {}).await.unwrap_err();
        assert!(err.remote().unwrap().is_block_missing());
        assert!(fx.ledger.get("key").is_none());
    }

    #[tokio::test]
    async fn insert_forbidden_counts_as_success() {
        let fx = fixture(2 * KIB as usize);
        fx.remote.fail_always(
            Operation::Finalize,
            RemoteError::service(crate::constants::CODE_INSERT_FORBIDDEN, "insert request forbid"),
        );
        fx.session(KIB).run(|_| {}).await.unwrap();
        assert!(fx.ledger.get("key").is_none());
    }

    #[tokio::test]
    async fn cancel_stops_dispatch_and_keeps_state() {
        let fx = fixture(16 * KIB as usize);
        fx.remote.set_block_delay(Duration::from_millis(20));

        let mut session = fx.session(KIB);
        session.parallelism = 2;
        let control = fx.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            control.send_replace(Control::Cancelled);
        });

        let err = session.run(|_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(fx.remote.count(Operation::Finalize), 0);

        let state = fx.ledger.get("key").unwrap();
        assert!(!state.blocks.is_empty());
        assert!(state.blocks.len() < 16);
    }

    #[tokio::test]
    async fn pause_holds_dispatch_until_resumed() {
        let fx = fixture(4 * KIB as usize);
        fx.control.send_replace(Control::Paused);

        let session = fx.session(KIB);
        let control = fx.control.clone();
        let remote = fx.remote.clone();
        let resumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let during_pause = remote.count(Operation::UploadBlock);
            control.send_replace(Control::Running);
            during_pause
        });

        session.run(|_| {}).await.unwrap();
        assert_eq!(resumer.await.unwrap(), 0);
        assert!(fx.remote.object("/up/data.bin").is_some());
    }
}
