use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use common::{Phase, TaskArgs};

use crate::transport::{CallError, TaskTransport};
use crate::worker_info::WorkerAddress;
use crate::worker_pool::{Outcome, WorkerPool};

/// How task attempts are timed and retried.
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    /// A `DoTask` call that has not answered by then counts as failed.
    pub call_timeout: Duration,

    /// Pause before re-dispatching a failed task.
    pub retry_backoff: Duration,

    /// Attempts per task before the phase is abandoned. `None` retries
    /// forever, i.e. waits for a worker that can finish the task.
    pub max_attempts: Option<u32>,

    /// Interval at which a task waiting for an idle worker reports it.
    pub stall_warning: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(100),
            max_attempts: Some(10),
            stall_warning: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("{phase} task {index} failed {attempts} times, last error: {last}")]
    RetriesExhausted {
        phase: Phase,
        index: u32,
        attempts: u32,
        last: String,
    },

    #[error("{phase} has {ntasks} tasks, more than a task index can address")]
    TooManyTasks { phase: Phase, ntasks: usize },

    #[error("dispatch of a {phase} task did not finish")]
    Dispatch {
        phase: Phase,
        #[source]
        source: JoinError,
    },

    #[error("{phase} stopped with {completed} of {ntasks} tasks complete")]
    Incomplete {
        phase: Phase,
        completed: usize,
        ntasks: usize,
    },
}

/// Result of a finished phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub ntasks: usize,

    /// Task attempts made, successful or not.
    pub attempts: u64,

    /// Task attempts that failed and were retried.
    pub failures: u64,
}

/// Which task indices of a phase have succeeded.
#[derive(Debug)]
pub struct CompletionSet {
    done: Vec<bool>,
    completed: usize,
}

impl CompletionSet {
    pub fn new(ntasks: usize) -> Self {
        Self {
            done: vec![false; ntasks],
            completed: 0,
        }
    }

    /// Record a success for `index`. Returns `false` if the index had
    /// already succeeded, in which case nothing changes.
    pub fn mark(&mut self, index: u32) -> bool {
        match self.done.get_mut(index as usize) {
            Some(done) if !*done => {
                *done = true;
                self.completed += 1;
                true
            }
            _ => false,
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.done.len()
    }
}

/// Attempt counts for one task index.
struct TaskTally {
    attempts: u32,
}

/// State shared by the dispatches of one phase.
struct PhaseContext {
    pool: Arc<WorkerPool>,
    transport: Arc<dyn TaskTransport>,
    policy: SchedulePolicy,
    completion: Mutex<CompletionSet>,
    ntasks: usize,
}

/// Drives every task of a phase to exactly one success on the workers of a
/// shared [`WorkerPool`].
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    transport: Arc<dyn TaskTransport>,
    policy: SchedulePolicy,
}

impl Scheduler {
    pub fn new(
        pool: Arc<WorkerPool>,
        transport: Arc<dyn TaskTransport>,
        policy: SchedulePolicy,
    ) -> Self {
        Self {
            pool,
            transport,
            policy,
        }
    }

    /// Run one task per entry of `inputs` and return once all of them have
    /// succeeded.
    ///
    /// Tasks are dispatched concurrently; the number of idle workers is what
    /// limits how many run at once. A failed attempt is re-dispatched to
    /// whichever worker is idle next.
    pub async fn run_phase(
        &self,
        job_name: &str,
        inputs: &[String],
        other_phase_count: u32,
        phase: Phase,
    ) -> Result<PhaseReport, ScheduleError> {
        let ntasks = inputs.len();
        if u32::try_from(ntasks).is_err() {
            return Err(ScheduleError::TooManyTasks { phase, ntasks });
        }

        info!(
            "Schedule: {} {} tasks ({} I/Os)",
            ntasks, phase, other_phase_count
        );

        let ctx = Arc::new(PhaseContext {
            pool: self.pool.clone(),
            transport: self.transport.clone(),
            policy: self.policy.clone(),
            completion: Mutex::new(CompletionSet::new(ntasks)),
            ntasks,
        });

        let mut dispatches = JoinSet::new();
        for (index, input) in inputs.iter().enumerate() {
            let args = TaskArgs {
                job_name: job_name.to_string(),
                phase,
                task_index: index as u32,
                input_ref: input.clone(),
                other_phase_count,
            };
            dispatches.spawn(dispatch(ctx.clone(), args));
        }

        let mut report = PhaseReport {
            phase,
            ntasks,
            attempts: 0,
            failures: 0,
        };

        while let Some(joined) = dispatches.join_next().await {
            let tally = match joined {
                Ok(Ok(tally)) => tally,
                Ok(Err(e)) => {
                    dispatches.abort_all();
                    return Err(e);
                }
                Err(source) => {
                    dispatches.abort_all();
                    return Err(ScheduleError::Dispatch { phase, source });
                }
            };
            report.attempts += u64::from(tally.attempts);
            report.failures += u64::from(tally.attempts - 1);
        }

        let completion = ctx.completion.lock().await;
        if !completion.is_complete() {
            return Err(ScheduleError::Incomplete {
                phase,
                completed: completion.completed(),
                ntasks,
            });
        }

        info!(
            attempts = report.attempts,
            failures = report.failures,
            "Schedule: {} done",
            phase
        );
        Ok(report)
    }
}

/// Keep dispatching one task until a worker completes it.
async fn dispatch(ctx: Arc<PhaseContext>, args: TaskArgs) -> Result<TaskTally, ScheduleError> {
    let policy = &ctx.policy;
    let index = args.task_index;
    let mut tally = TaskTally { attempts: 0 };

    loop {
        let address = acquire(&ctx, &args).await;
        tally.attempts += 1;
        debug!(phase = %args.phase, task = index, %address, attempt = tally.attempts, "dispatching");

        let call = ctx.transport.do_task(&address, &args);
        let result = timeout(policy.call_timeout, call)
            .await
            .unwrap_or_else(|_| Err(CallError::Timeout(policy.call_timeout)));

        let error = match result {
            Ok(()) => {
                let (first, completed) = {
                    let mut completion = ctx.completion.lock().await;
                    (completion.mark(index), completion.completed())
                };
                ctx.pool.release(&address, Outcome::Completed).await;

                if first {
                    info!(
                        "{}: task {} done on {} ({}/{})",
                        args.phase, index, address, completed, ctx.ntasks
                    );
                } else {
                    debug!(phase = %args.phase, task = index, "duplicate success ignored");
                }
                return Ok(tally);
            }
            Err(e) => e,
        };

        let outcome = if error.worker_responded() {
            Outcome::Rejected
        } else {
            Outcome::Lost
        };
        ctx.pool.release(&address, outcome).await;
        warn!(
            "{}: task {} failed on {} (attempt {}): {}",
            args.phase, index, address, tally.attempts, error
        );

        if let Some(max_attempts) = policy.max_attempts {
            if tally.attempts >= max_attempts {
                return Err(ScheduleError::RetriesExhausted {
                    phase: args.phase,
                    index,
                    attempts: tally.attempts,
                    last: error.to_string(),
                });
            }
        }

        tokio::time::sleep(policy.retry_backoff).await;
    }
}

/// Wait for an idle worker, reporting periodically while none shows up.
async fn acquire(ctx: &PhaseContext, args: &TaskArgs) -> WorkerAddress {
    loop {
        match timeout(ctx.policy.stall_warning, ctx.pool.acquire()).await {
            Ok(address) => return address,
            Err(_) => {
                let snapshot = ctx.pool.snapshot().await;
                warn!(
                    "{}: task {} still waiting for an idle worker ({} busy, {} lost)",
                    args.phase, args.task_index, snapshot.busy, snapshot.lost
                );
            }
        }
    }
}

/// Run a single phase on a fresh pool fed by `registrations`.
///
/// The registration stream is consumed for the whole phase and dropped once
/// every task has succeeded.
pub async fn schedule<S>(
    job_name: &str,
    inputs: &[String],
    other_phase_count: u32,
    phase: Phase,
    registrations: S,
    transport: Arc<dyn TaskTransport>,
    policy: SchedulePolicy,
) -> Result<PhaseReport, ScheduleError>
where
    S: Stream<Item = WorkerAddress> + Send + Unpin + 'static,
{
    let pool = Arc::new(WorkerPool::new());
    let listener = pool.consume_registrations(registrations);

    let result = Scheduler::new(pool, transport, policy)
        .run_phase(job_name, inputs, other_phase_count, phase)
        .await;

    listener.abort();
    result
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Succeed,
        Reject,
        Crash,
        Hang,
    }

    /// In-memory stand-in for the workers.
    #[derive(Default)]
    struct FakeTransport {
        /// Behaviour of the next attempts per task index; `Succeed` once
        /// the script runs out.
        script: StdMutex<HashMap<u32, VecDeque<Behavior>>>,

        /// Addresses that crash on every call.
        dead: StdMutex<HashSet<String>>,

        /// Every call made, in order.
        calls: StdMutex<Vec<(String, u32)>>,

        /// Successful calls per index.
        successes: StdMutex<HashMap<u32, usize>>,

        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        work: Duration,
    }

    impl FakeTransport {
        fn with_work(work: Duration) -> Self {
            Self {
                work,
                ..Default::default()
            }
        }

        fn script(&self, index: u32, behaviors: &[Behavior]) {
            self.script
                .lock()
                .unwrap()
                .insert(index, behaviors.iter().copied().collect());
        }

        fn kill(&self, address: &str) {
            self.dead.lock().unwrap().insert(address.to_string());
        }

        fn calls_for(&self, index: u32) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, i)| *i == index)
                .map(|(address, _)| address.clone())
                .collect()
        }

        fn successes(&self) -> HashMap<u32, usize> {
            self.successes.lock().unwrap().clone()
        }
    }

    #[tonic::async_trait]
    impl TaskTransport for FakeTransport {
        async fn do_task(&self, address: &str, args: &TaskArgs) -> Result<(), CallError> {
            let index = args.task_index;
            self.calls.lock().unwrap().push((address.to_string(), index));

            let behavior = if self.dead.lock().unwrap().contains(address) {
                Behavior::Crash
            } else {
                self.script
                    .lock()
                    .unwrap()
                    .get_mut(&index)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Behavior::Succeed)
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match behavior {
                Behavior::Succeed => {
                    *self.successes.lock().unwrap().entry(index).or_default() += 1;
                    Ok(())
                }
                Behavior::Reject => Err(CallError::Rejected("bad input".into())),
                Behavior::Crash => Err(CallError::Unreachable(address.to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    fn policy() -> SchedulePolicy {
        SchedulePolicy {
            call_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
            max_attempts: Some(5),
            stall_warning: Duration::from_secs(1),
        }
    }

    fn inputs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("pg-{i}.txt")).collect()
    }

    async fn scheduler(transport: Arc<FakeTransport>, workers: &[&str]) -> Scheduler {
        let pool = Arc::new(WorkerPool::new());
        for worker in workers {
            pool.register(worker.to_string()).await;
        }
        Scheduler::new(pool, transport, policy())
    }

    fn assert_each_once(transport: &FakeTransport, ntasks: u32) {
        let successes = transport.successes();
        assert_eq!(successes.len(), ntasks as usize);
        for index in 0..ntasks {
            assert_eq!(successes.get(&index), Some(&1), "task {index}");
        }
    }

    #[test]
    fn completion_is_marked_once() {
        let mut completion = CompletionSet::new(2);

        assert!(completion.mark(1));
        assert!(!completion.mark(1));
        assert_eq!(completion.completed(), 1);
        assert!(!completion.is_complete());

        assert!(completion.mark(0));
        assert!(completion.is_complete());
        assert!(!completion.mark(7));
    }

    #[tokio::test]
    async fn single_worker_runs_every_task() {
        let transport = Arc::new(FakeTransport::with_work(Duration::from_millis(5)));
        let scheduler = scheduler(transport.clone(), &["only"]).await;

        let report = scheduler
            .run_phase("wc", &inputs(3), 2, Phase::Map)
            .await
            .unwrap();

        assert_eq!(report.ntasks, 3);
        assert_eq!((report.attempts, report.failures), (3, 0));
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
        assert_each_once(&transport, 3);
    }

    #[tokio::test]
    async fn tasks_run_in_parallel_across_workers() {
        let transport = Arc::new(FakeTransport::with_work(Duration::from_millis(50)));
        let scheduler = scheduler(transport.clone(), &["a", "b", "c", "d"]).await;

        scheduler
            .run_phase("wc", &inputs(8), 1, Phase::Map)
            .await
            .unwrap();

        assert!(transport.max_in_flight.load(Ordering::SeqCst) > 1);
        assert_each_once(&transport, 8);
    }

    #[tokio::test]
    async fn crashed_worker_task_is_retried_elsewhere() {
        let transport = Arc::new(FakeTransport::default());
        transport.script(2, &[Behavior::Crash]);
        let scheduler = scheduler(transport.clone(), &["w1", "w2"]).await;

        let report = scheduler
            .run_phase("wc", &inputs(5), 3, Phase::Map)
            .await
            .unwrap();

        assert_eq!((report.attempts, report.failures), (6, 1));
        assert_each_once(&transport, 5);

        let attempts = transport.calls_for(2);
        assert_eq!(attempts.len(), 2);
        assert_ne!(attempts[0], attempts[1]);

        // The crashed worker never got another task.
        let crashed = &attempts[0];
        let calls = transport.calls.lock().unwrap().clone();
        let crash_at = calls
            .iter()
            .position(|(address, index)| address == crashed && *index == 2)
            .unwrap();
        assert!(calls[crash_at + 1..]
            .iter()
            .all(|(address, _)| address != crashed));
    }

    #[tokio::test]
    async fn rejected_task_is_retried_on_the_responsive_worker() {
        let transport = Arc::new(FakeTransport::default());
        transport.script(0, &[Behavior::Reject, Behavior::Reject]);
        let scheduler = scheduler(transport.clone(), &["solo"]).await;

        let report = scheduler
            .run_phase("wc", &inputs(2), 1, Phase::Reduce)
            .await
            .unwrap();

        assert_eq!(report.failures, 2);
        assert_each_once(&transport, 2);
        assert_eq!(transport.calls_for(0), ["solo", "solo", "solo"]);
    }

    #[tokio::test]
    async fn hung_call_times_out_and_is_retried() {
        let transport = Arc::new(FakeTransport::default());
        transport.script(1, &[Behavior::Hang]);
        let pool = Arc::new(WorkerPool::new());
        pool.register("slow".into()).await;
        pool.register("fast".into()).await;
        let scheduler = Scheduler::new(
            pool.clone(),
            transport.clone(),
            SchedulePolicy {
                call_timeout: Duration::from_millis(50),
                ..policy()
            },
        );

        let report = scheduler
            .run_phase("wc", &inputs(3), 1, Phase::Map)
            .await
            .unwrap();

        assert_eq!(report.failures, 1);
        assert_each_once(&transport, 3);
        assert_eq!(pool.snapshot().await.lost, 1);
    }

    #[tokio::test]
    async fn bounded_retries_fail_the_phase() {
        let transport = Arc::new(FakeTransport::default());
        transport.script(1, &[Behavior::Reject; 8]);
        let scheduler = scheduler(transport.clone(), &["w"]).await;

        let err = scheduler
            .run_phase("wc", &inputs(3), 1, Phase::Map)
            .await
            .unwrap_err();

        match err {
            ScheduleError::RetriesExhausted {
                index, attempts, ..
            } => assert_eq!((index, attempts), (1, 5)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unbounded_retries_wait_for_a_recovered_worker() {
        let transport = Arc::new(FakeTransport::default());
        transport.kill("w");
        let pool = Arc::new(WorkerPool::new());
        pool.register("w".into()).await;
        let scheduler = Scheduler::new(
            pool.clone(),
            transport.clone(),
            SchedulePolicy {
                max_attempts: None,
                ..policy()
            },
        );

        let phase = tokio::spawn(async move {
            scheduler
                .run_phase("wc", &inputs(1), 1, Phase::Map)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!phase.is_finished());

        transport.dead.lock().unwrap().clear();
        pool.register("w".into()).await;

        let report = timeout(Duration::from_secs(2), phase)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.failures, 1);
        assert_each_once(&transport, 1);
    }

    #[tokio::test]
    async fn schedule_consumes_late_registrations() {
        let transport = Arc::new(FakeTransport::default());
        let (tx, rx) = mpsc::channel(8);

        let registrar = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send("late-1".to_string()).await.unwrap();
            tx.send("late-2".to_string()).await.unwrap();
            tx
        });

        let report = schedule(
            "wc",
            &inputs(4),
            2,
            Phase::Map,
            ReceiverStream::new(rx),
            transport.clone(),
            policy(),
        )
        .await
        .unwrap();

        assert_eq!(report.ntasks, 4);
        assert_each_once(&transport, 4);
        drop(registrar.await.unwrap());
    }

    #[tokio::test]
    async fn empty_phase_returns_immediately() {
        let transport = Arc::new(FakeTransport::default());
        let scheduler = scheduler(transport.clone(), &[]).await;

        let report = scheduler.run_phase("wc", &[], 3, Phase::Reduce).await.unwrap();

        assert_eq!((report.ntasks, report.attempts), (0, 0));
    }
}
