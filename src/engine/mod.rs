//! Upload engine: task queue, rapid upload and chunked transfer sessions.

pub mod queue;
pub mod rapid;
pub mod session;
pub mod task;

pub use queue::{QueueSummary, TransferQueue, expand_paths};
pub use rapid::{DedupOutcome, FileSum, create_super_file, rapid_upload, sum_file};
pub use session::{ChunkedSession, SessionStatus};
pub use task::{Finish, Step, TransferTask, Transition};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::ledger::Ledger;
use crate::progress::{Phase, ProgressBus, ProgressEvent};
use crate::remote::RemoteStorage;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Running,
    Paused,
    Cancelled,
}

/// Pause/resume/cancel switches of live tasks.
#[derive(Default)]
pub struct Controls {
    switches: DashMap<TaskId, watch::Sender<Control>>,
}

impl Controls {
    fn register(&self, id: TaskId) -> watch::Receiver<Control> {
        let (tx, rx) = watch::channel(Control::Running);
        self.switches.insert(id, tx);
        rx
    }

    fn unregister(&self, id: TaskId) {
        self.switches.remove(&id);
    }

    /// Returns false if the task is unknown or already finished.
    fn set(&self, id: TaskId, control: Control) -> bool {
        let Some(switch) = self.switches.get(&id) else {
            return false;
        };
        switch.send_if_modified(|current| {
            // A cancelled task stays cancelled.
            if *current == control || *current == Control::Cancelled {
                return false;
            }
            *current = control;
            true
        })
    }

    pub fn get(&self, id: TaskId) -> Option<Control> {
        self.switches.get(&id).map(|switch| *switch.borrow())
    }
}

/// Returned by `enqueue_transfer` for each file put into the queue.
#[derive(Clone)]
pub struct TaskHandle {
    pub id: TaskId,
    pub local_path: std::path::PathBuf,
    pub remote_path: String,
    engine: Arc<Engine>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .finish()
    }
}

impl TaskHandle {
    pub fn pause(&self) -> bool {
        self.engine.pause(self.id)
    }

    pub fn resume(&self) -> bool {
        self.engine.resume(self.id)
    }

    pub fn cancel(&self) -> bool {
        self.engine.cancel(self.id)
    }
}

/// Shared state of the engine: remote client, ledger, progress bus and task
/// controls. Queues are created from it with [`Engine::queue`].
pub struct Engine {
    remote: Arc<dyn RemoteStorage>,
    ledger: Arc<Ledger>,
    bus: Arc<ProgressBus>,
    config: EngineConfig,
    controls: Controls,
    next_id: AtomicU64,
}

impl Engine {
    pub fn new(remote: Arc<dyn RemoteStorage>, ledger: Arc<Ledger>, config: EngineConfig) -> Self {
        Self {
            remote,
            ledger,
            bus: Arc::new(ProgressBus::new(config.replay_capacity)),
            config,
            controls: Controls::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn queue(self: &Arc<Self>) -> TransferQueue {
        TransferQueue::new(Arc::clone(self))
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStorage> {
        &self.remote
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn control(&self, id: TaskId) -> Option<Control> {
        self.controls.get(id)
    }

    pub fn pause(&self, id: TaskId) -> bool {
        self.switch(id, Control::Paused, Phase::Paused)
    }

    pub fn resume(&self, id: TaskId) -> bool {
        self.switch(id, Control::Running, Phase::Resumed)
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.switch(id, Control::Cancelled, Phase::Cancelled)
    }

    fn switch(&self, id: TaskId, control: Control, phase: Phase) -> bool {
        let changed = self.controls.set(id, control);
        if changed {
            log::info!("[{id}] {phase:?} requested");
            // The queue reports the final cancellation once the task stops.
            if phase != Phase::Cancelled {
                self.bus.publish(ProgressEvent::new(id, phase, ""));
            }
        }
        changed
    }

    fn allocate_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::MockRemote;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(MockRemote::new()),
            Arc::new(Ledger::in_memory()),
            EngineConfig::default(),
        ))
    }

    #[test]
    fn controls_follow_requests() {
        let engine = engine();
        let mut rx = engine.controls.register(1);

        assert!(engine.pause(1));
        assert!(!engine.pause(1));
        assert_eq!(*rx.borrow_and_update(), Control::Paused);

        assert!(engine.resume(1));
        assert!(engine.cancel(1));
        assert!(!engine.resume(1), "cancel is final");
        assert_eq!(*rx.borrow_and_update(), Control::Cancelled);

        assert!(!engine.cancel(42));
        engine.controls.unregister(1);
        assert_eq!(engine.control(1), None);
    }

    #[test]
    fn ids_are_monotonic() {
        let engine = engine();
        let ids: Vec<_> = (0..3).map(|_| engine.allocate_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
