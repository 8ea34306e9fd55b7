use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use common::rpc::{DoTaskRequest, DoTaskResponse, Worker};
use common::{Phase, TaskArgs, Workload};

use crate::map::{perform_map, MapTask};
use crate::reduce::{perform_reduce, ReduceTask};

/// Runs the tasks handed out by the coordinator, one at a time.
pub struct MRWorker {
    /// Held until a task's work has really finished, even when the caller
    /// has given up on it.
    in_progress: Arc<Mutex<()>>,
    workload: Workload,
    work_dir: PathBuf,
    sort_buffer: usize,
}

impl MRWorker {
    pub fn new(workload: Workload, work_dir: PathBuf, sort_buffer: usize) -> Self {
        Self {
            in_progress: Arc::new(Mutex::new(())),
            workload,
            work_dir,
            sort_buffer,
        }
    }

    async fn run_task(&self, args: TaskArgs, guard: OwnedMutexGuard<()>) -> Result<(), Error> {
        let workload = self.workload;
        let dir = self.work_dir.clone();
        let sort_buffer = self.sort_buffer;

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let _guard = guard;
            match args.phase {
                Phase::Map => {
                    perform_map(&MapTask {
                        dir: &dir,
                        job_name: &args.job_name,
                        map_task: args.task_index,
                        input_file: &args.input_ref,
                        n_reduce: args.other_phase_count,
                        map_fn: workload.map_fn,
                    })?;
                }
                Phase::Reduce => {
                    perform_reduce(&ReduceTask {
                        dir: &dir,
                        job_name: &args.job_name,
                        reduce_task: args.task_index,
                        n_map: args.other_phase_count,
                        reduce_fn: workload.reduce_fn,
                        sort_buffer,
                    })?;
                }
            }
            Ok(())
        })
        .await?
    }
}

fn reply(success: bool, message: String) -> Response<DoTaskResponse> {
    Response::new(DoTaskResponse { success, message })
}

#[tonic::async_trait]
impl Worker for MRWorker {
    async fn do_task(
        &self,
        request: Request<DoTaskRequest>,
    ) -> Result<Response<DoTaskResponse>, Status> {
        debug!("Received a work request");

        // we accept the work only if we are free
        let Ok(guard) = self.in_progress.clone().try_lock_owned() else {
            return Ok(reply(false, "worker is busy".into()));
        };

        let args = TaskArgs::try_from(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let (phase, index) = (args.phase, args.task_index);

        match self.run_task(args, guard).await {
            Ok(()) => {
                info!(%phase, task = index, "task done");
                Ok(reply(true, String::new()))
            }
            Err(e) => {
                error!(%phase, task = index, "task failed: {e:#}");
                Ok(reply(false, format!("{e:#}")))
            }
        }
    }
}
