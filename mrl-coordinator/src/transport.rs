use thiserror::Error;
use tonic::Request;

use common::rpc::{DoTaskRequest, WorkerClient};
use common::TaskArgs;

/// Why a `DoTask` call did not succeed.
#[derive(Debug, Error)]
pub enum CallError {
    /// No connection could be made.
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    /// The call itself failed.
    #[error("call failed: {0}")]
    Status(#[from] tonic::Status),

    /// The worker answered and reported that the task failed.
    #[error("task failed on worker: {0}")]
    Rejected(String),

    /// No answer within the call deadline.
    #[error("no answer within {0:?}")]
    Timeout(std::time::Duration),
}

impl CallError {
    /// Whether the worker proved it is alive while failing.
    pub fn worker_responded(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }
}

/// Issues the remote "do this task" call.
#[tonic::async_trait]
pub trait TaskTransport: Send + Sync + 'static {
    async fn do_task(&self, address: &str, args: &TaskArgs) -> Result<(), CallError>;
}

/// [`TaskTransport`] over the workers' gRPC endpoint.
#[derive(Debug, Default, Clone)]
pub struct GrpcTransport;

#[tonic::async_trait]
impl TaskTransport for GrpcTransport {
    async fn do_task(&self, address: &str, args: &TaskArgs) -> Result<(), CallError> {
        let mut client = WorkerClient::connect(format!("http://{}", address))
            .await
            .map_err(|e| CallError::Unreachable(format!("{address}: {e}")))?;

        let reply = client
            .do_task(Request::new(DoTaskRequest::from(args)))
            .await?
            .into_inner();

        if reply.success {
            Ok(())
        } else {
            Err(CallError::Rejected(reply.message))
        }
    }
}
