//! Lane scheduler — named FIFO queues with per-lane concurrency caps.
//!
//! Two lanes compose the scheduling policy: a `session:<key>` lane with a cap
//! of 1 serializes everything touching one session, and its task body
//! enqueues on the shared global lane, which bounds process-wide parallelism.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

struct Lane {
    active: usize,
    max_concurrent: usize,
    queue: VecDeque<oneshot::Sender<()>>,
}

impl Lane {
    fn new(max_concurrent: usize) -> Self {
        Self {
            active: 0,
            max_concurrent: max_concurrent.max(1),
            queue: VecDeque::new(),
        }
    }

    /// Admit queued waiters while capacity allows. Dropped receivers (a
    /// caller that went away while waiting) are skipped without consuming a
    /// slot.
    fn drain(&mut self) {
        while self.active < self.max_concurrent {
            let Some(tx) = self.queue.pop_front() else {
                break;
            };
            self.active += 1;
            if tx.send(()).is_err() {
                self.active -= 1;
            }
        }
    }
}

/// Per-lane occupancy, for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub struct LaneSnapshot {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

/// Process-wide scheduler. Lanes are created on demand and keyed by name.
#[derive(Default)]
pub struct LaneScheduler {
    lanes: Mutex<HashMap<String, Lane>>,
}

impl LaneScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `task` on the named lane. Admission is strict FIFO; the future
    /// resolves with the task's own result once the lane has granted a slot
    /// and the task has completed. The slot is released on success, failure,
    /// and panic alike.
    pub async fn enqueue<T, F, Fut>(
        &self,
        lane: &str,
        max_concurrent: usize,
        task: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        self.acquire(lane, max_concurrent).await;
        let _slot = SlotGuard {
            scheduler: self,
            lane: lane.to_string(),
        };
        task().await
    }

    async fn acquire(&self, lane: &str, max_concurrent: usize) {
        let waiter = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            let state = lanes
                .entry(lane.to_string())
                .or_insert_with(|| Lane::new(max_concurrent));
            if state.max_concurrent != max_concurrent.max(1) {
                state.max_concurrent = max_concurrent.max(1);
                state.drain();
            }
            // FIFO: even with free capacity, queued tasks go first.
            if state.queue.is_empty() && state.active < state.max_concurrent {
                state.active += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(tx);
                debug!(lane, queued = state.queue.len(), "Lane enqueue waiting");
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            // Sender dropped only if the lane is removed, which `remove_idle`
            // forbids while waiters exist.
            let _ = rx.await;
        }
    }

    fn release(&self, lane: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = lanes.get_mut(lane) {
            state.active = state.active.saturating_sub(1);
            state.drain();
        }
    }

    /// Change a lane's cap. Raising it admits queued tasks immediately.
    #[allow(dead_code)]
    pub fn set_max_concurrent(&self, lane: &str, max_concurrent: usize) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let state = lanes
            .entry(lane.to_string())
            .or_insert_with(|| Lane::new(max_concurrent));
        state.max_concurrent = max_concurrent.max(1);
        state.drain();
    }

    /// Delete a lane; refuses while it has active or queued work.
    #[allow(dead_code)]
    pub fn remove_idle(&self, lane: &str) -> bool {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        match lanes.get(lane) {
            Some(state) if state.active == 0 && state.queue.is_empty() => {
                lanes.remove(lane);
                true
            }
            _ => false,
        }
    }

    #[allow(dead_code)]
    pub fn snapshot(&self, lane: &str) -> Option<LaneSnapshot> {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.get(lane).map(|s| LaneSnapshot {
            active: s.active,
            queued: s.queue.len(),
            max_concurrent: s.max_concurrent,
        })
    }
}

struct SlotGuard<'a> {
    scheduler: &'a LaneScheduler,
    lane: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.release(&self.lane);
    }
}
