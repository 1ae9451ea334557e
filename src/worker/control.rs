//! Cooperative worker control over a `watch` channel.

use std::sync::Arc;

use tokio::sync::watch;

/// Requested run state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerSignal {
    #[default]
    Run,
    /// Stop claiming jobs until resumed.
    Pause,
    /// Exit after the current job.
    Stop,
    /// Interrupt the current job and exit.
    Kill,
}

impl WorkerSignal {
    /// Precedence: kill > stop > pause/run. A weaker request never
    /// overrides a stronger one.
    fn rank(self) -> u8 {
        match self {
            Self::Run | Self::Pause => 0,
            Self::Stop => 1,
            Self::Kill => 2,
        }
    }
}

/// Cloneable control handle for one worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name: String,
    tx: Arc<watch::Sender<WorkerSignal>>,
}

impl WorkerHandle {
    /// Handle with no worker attached yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self::channel(name).0
    }

    /// Create a handle and the receiver the worker listens on.
    pub(crate) fn channel(name: impl Into<String>) -> (Self, watch::Receiver<WorkerSignal>) {
        let (tx, rx) = watch::channel(WorkerSignal::Run);
        (
            Self {
                name: name.into(),
                tx: Arc::new(tx),
            },
            rx,
        )
    }

    /// New receiver for a worker controlled by this handle.
    pub(crate) fn subscribe(&self) -> watch::Receiver<WorkerSignal> {
        self.tx.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current requested state.
    pub fn signal(&self) -> WorkerSignal {
        *self.tx.borrow()
    }

    pub fn stop(&self) {
        self.request(WorkerSignal::Stop);
    }

    pub fn kill(&self) {
        self.request(WorkerSignal::Kill);
    }

    pub fn pause(&self) {
        self.tx.send_if_modified(|s| {
            if *s == WorkerSignal::Run {
                *s = WorkerSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|s| {
            if *s == WorkerSignal::Pause {
                *s = WorkerSignal::Run;
                true
            } else {
                false
            }
        });
    }

    fn request(&self, target: WorkerSignal) {
        let name = &self.name;
        self.tx.send_if_modified(|s| {
            if target.rank() > s.rank() {
                tracing::debug!(worker = %name, from = ?*s, to = ?target, "Worker signal");
                *s = target;
                true
            } else {
                false
            }
        });
    }
}
