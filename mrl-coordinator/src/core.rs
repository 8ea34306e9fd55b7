use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::info;

use common::rpc::{
    Coordinator, WorkerJoinRequest, WorkerJoinResponse, WorkerLeaveRequest, WorkerLeaveResponse,
};

use crate::worker_info::WorkerAddress;
use crate::worker_pool::WorkerPool;

/// Accepts worker registrations and forwards them to the scheduler's pool.
#[derive(Debug)]
pub struct MRCoordinator {
    registrations: mpsc::Sender<WorkerAddress>,
    pool: Arc<WorkerPool>,
}

impl MRCoordinator {
    pub fn new(registrations: mpsc::Sender<WorkerAddress>, pool: Arc<WorkerPool>) -> Self {
        Self {
            registrations,
            pool,
        }
    }
}

#[tonic::async_trait]
impl Coordinator for MRCoordinator {
    /// Worker requests to join the workforce.
    async fn worker_join(
        &self,
        request: Request<WorkerJoinRequest>,
    ) -> Result<Response<WorkerJoinResponse>, Status> {
        let remote = request.remote_addr();
        let address = request.into_inner().address;
        if address.is_empty() {
            return Err(Status::invalid_argument("worker address is empty"));
        }

        info!(%address, ?remote, "Worker joined.");
        self.registrations
            .send(address)
            .await
            .map_err(|_| Status::unavailable("coordinator is shutting down"))?;

        Ok(Response::new(WorkerJoinResponse { success: true }))
    }

    /// Worker is going away. It is not handed new work after that.
    async fn worker_leave(
        &self,
        request: Request<WorkerLeaveRequest>,
    ) -> Result<Response<WorkerLeaveResponse>, Status> {
        let address = request.into_inner().address;
        info!(%address, "Worker left.");
        self.pool.remove(&address).await;
        Ok(Response::new(WorkerLeaveResponse {}))
    }
}
