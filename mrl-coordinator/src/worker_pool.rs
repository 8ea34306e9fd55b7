use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::worker_info::{WorkerAddress, WorkerInfo, WorkerState};

/// How a leased worker's task attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The task succeeded.
    Completed,

    /// The worker answered but the task failed. The worker is responsive.
    Rejected,

    /// The call timed out or the worker could not be reached.
    Lost,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Every worker ever registered, keyed by address.
    workers: HashMap<WorkerAddress, WorkerInfo>,

    /// Idle workers, oldest first. Each address appears at most once.
    idle: VecDeque<WorkerAddress>,
}

/// Counts of workers per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub idle: usize,
    pub busy: usize,
    pub lost: usize,
}

/// The set of workers available for leasing.
///
/// All mutations go through a single lock. Waiters block on a [`Notify`]
/// that is signalled whenever a worker becomes idle.
#[derive(Debug, Default)]
pub struct WorkerPool {
    state: Mutex<PoolState>,
    available: Notify,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker to the idle set.
    ///
    /// An idle worker is left alone, so repeated registrations never create
    /// extra slots. A busy worker is noted as rejoined and comes back when
    /// its lease ends, however that attempt turns out. A lost worker comes
    /// back immediately.
    pub async fn register(&self, address: WorkerAddress) {
        {
            let mut state = self.state.lock().await;
            let PoolState { workers, idle } = &mut *state;

            match workers.get_mut(&address) {
                Some(worker) if worker.state == WorkerState::Idle => {
                    debug!(%address, "duplicate registration ignored");
                    return;
                }
                Some(worker) if worker.state == WorkerState::Busy => {
                    info!(%address, "busy worker registered again");
                    worker.rejoined = true;
                    worker.departed = false;
                    return;
                }
                Some(worker) => {
                    info!(%address, "lost worker registered again");
                    worker.departed = false;
                    worker.set_state(WorkerState::Idle);
                }
                None => {
                    info!(%address, "worker registered");
                    workers.insert(address.clone(), WorkerInfo::new(address.clone()));
                }
            }
            idle.push_back(address);
        }

        self.available.notify_one();
    }

    /// Take a worker that announced it is leaving out of the pool.
    ///
    /// An idle worker is dropped from the idle set right away. A busy one
    /// finishes its lease and is not returned. Registering again undoes this.
    pub async fn remove(&self, address: &str) {
        let mut state = self.state.lock().await;
        let PoolState { workers, idle } = &mut *state;

        let Some(worker) = workers.get_mut(address) else {
            debug!(%address, "unknown worker left");
            return;
        };
        match worker.state {
            WorkerState::Idle => {
                idle.retain(|idle_address| idle_address != address);
                worker.set_state(WorkerState::Lost);
                info!(%address, "idle worker removed");
            }
            WorkerState::Busy => {
                worker.rejoined = false;
                worker.departed = true;
                info!(%address, "busy worker leaves after its task");
            }
            WorkerState::Lost => {}
        }
    }

    /// Lease an idle worker, waiting until one is available.
    pub async fn acquire(&self) -> WorkerAddress {
        let started = Instant::now();

        loop {
            {
                let mut state = self.state.lock().await;
                let PoolState { workers, idle } = &mut *state;

                if let Some(address) = idle.pop_front() {
                    if let Some(worker) = workers.get_mut(&address) {
                        worker.set_state(WorkerState::Busy);
                    }
                    debug!(%address, waited = ?started.elapsed(), "worker acquired");
                    return address;
                }
            }

            // A permit stored by `notify_one` before we got here wakes us
            // immediately, so no registration is missed.
            self.available.notified().await;
        }
    }

    /// Return a leased worker.
    ///
    /// Only a worker that answered, or registered again during the lease,
    /// goes back to the idle set. A lost worker has to register again.
    pub async fn release(&self, address: &str, outcome: Outcome) {
        let mut state = self.state.lock().await;
        let PoolState { workers, idle } = &mut *state;

        let Some(worker) = workers.get_mut(address) else {
            warn!(%address, "released a worker the pool does not know");
            return;
        };
        if worker.state != WorkerState::Busy {
            warn!(%address, state = %worker.state, "released a worker that was not leased");
            return;
        }

        match outcome {
            Outcome::Completed => worker.completed += 1,
            Outcome::Rejected | Outcome::Lost => worker.failures += 1,
        }

        let responsive = outcome != Outcome::Lost || worker.rejoined;
        worker.rejoined = false;
        if responsive && !worker.departed {
            worker.set_state(WorkerState::Idle);
            idle.push_back(worker.address.clone());
            drop(state);
            self.available.notify_one();
        } else {
            worker.departed = false;
            worker.set_state(WorkerState::Lost);
            warn!(%address, ?outcome, "worker lost");
        }
    }

    /// Feed a registration stream into the pool until the stream ends.
    ///
    /// The returned handle can be aborted to stop listening early.
    pub fn consume_registrations<S>(self: &Arc<Self>, mut registrations: S) -> JoinHandle<()>
    where
        S: Stream<Item = WorkerAddress> + Send + Unpin + 'static,
    {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(address) = registrations.next().await {
                pool.register(address).await;
            }
            debug!("registration stream closed");
        })
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = PoolSnapshot::default();

        for worker in state.workers.values() {
            match worker.state {
                WorkerState::Idle => snapshot.idle += 1,
                WorkerState::Busy => snapshot.busy += 1,
                WorkerState::Lost => snapshot.lost += 1,
            }
        }

        snapshot
    }

    /// A copy of one worker's bookkeeping.
    pub async fn worker(&self, address: &str) -> Option<WorkerInfo> {
        self.state.lock().await.workers.get(address).cloned()
    }
}
