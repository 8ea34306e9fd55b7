use std::fmt;

/// Address a worker's gRPC server listens on (`host:port`).
pub type WorkerAddress = String;

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum WorkerState {
    /// Registered and waiting for a task.
    Idle,

    /// Leased to exactly one task attempt.
    Busy,

    /// Its last call failed. It stays out of the pool until it registers
    /// again.
    Lost,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy => write!(f, "busy"),
            WorkerState::Lost => write!(f, "lost"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Where to send `DoTask` calls.
    pub address: WorkerAddress,

    /// The state of the worker.
    pub state: WorkerState,

    /// Task attempts that completed on this worker.
    pub completed: u64,

    /// Task attempts that failed on this worker.
    pub failures: u64,

    /// Registered again while busy, e.g. after a restart. The lease ends
    /// with the worker back in the pool whatever the outcome.
    pub rejoined: bool,

    /// Announced it is leaving while busy. The lease ends with the worker
    /// out of the pool.
    pub departed: bool,
}

impl WorkerInfo {
    /// A freshly registered worker, idle.
    pub fn new(address: WorkerAddress) -> Self {
        Self {
            address,
            state: WorkerState::Idle,
            completed: 0,
            failures: 0,
            rejoined: false,
            departed: false,
        }
    }

    /// Set worker state.
    pub fn set_state(&mut self, new_state: WorkerState) {
        self.state = new_state;
    }
}
