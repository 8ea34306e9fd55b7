//! Wire messages and generated gRPC stubs shared by the coordinator and the
//! workers.
//!
//! NOTE: The stubs are generated by `build.rs` and are TIGHTLY coupled to the
//!       message types below. If you rename a message, update `build.rs` too.

use crate::{Phase, TaskArgs};

pub mod worker {
    include!(concat!(env!("OUT_DIR"), "/worker.Worker.rs"));
}

pub mod coordinator {
    include!(concat!(env!("OUT_DIR"), "/coordinator.Coordinator.rs"));
}

pub use coordinator::coordinator_client::CoordinatorClient;
pub use coordinator::coordinator_server::{Coordinator, CoordinatorServer};
pub use worker::worker_client::WorkerClient;
pub use worker::worker_server::{Worker, WorkerServer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WirePhase {
    Map = 0,
    Reduce = 1,
}

/// `DoTask` arguments.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DoTaskRequest {
    #[prost(string, tag = "1")]
    pub job_name: String,

    #[prost(enumeration = "WirePhase", tag = "2")]
    pub phase: i32,

    #[prost(uint32, tag = "3")]
    pub task_index: u32,

    /// Map input file; empty for reduce tasks.
    #[prost(string, tag = "4")]
    pub input_ref: String,

    /// Number of reduce partitions for a map task, number of map producers
    /// for a reduce task.
    #[prost(uint32, tag = "5")]
    pub other_phase_count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DoTaskResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,

    /// Error chain when `success` is false.
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkerJoinRequest {
    /// Address (`host:port`) the worker's gRPC server listens on.
    #[prost(string, tag = "1")]
    pub address: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkerJoinResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkerLeaveRequest {
    #[prost(string, tag = "1")]
    pub address: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkerLeaveResponse {}

impl From<Phase> for WirePhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Map => WirePhase::Map,
            Phase::Reduce => WirePhase::Reduce,
        }
    }
}

impl From<WirePhase> for Phase {
    fn from(phase: WirePhase) -> Self {
        match phase {
            WirePhase::Map => Phase::Map,
            WirePhase::Reduce => Phase::Reduce,
        }
    }
}

impl From<&TaskArgs> for DoTaskRequest {
    fn from(args: &TaskArgs) -> Self {
        Self {
            job_name: args.job_name.clone(),
            phase: WirePhase::from(args.phase) as i32,
            task_index: args.task_index,
            input_ref: args.input_ref.clone(),
            other_phase_count: args.other_phase_count,
        }
    }
}

impl TryFrom<DoTaskRequest> for TaskArgs {
    type Error = anyhow::Error;

    fn try_from(request: DoTaskRequest) -> Result<Self, Self::Error> {
        let phase = WirePhase::try_from(request.phase)
            .map_err(|_| anyhow::anyhow!("unknown phase `{}`", request.phase))?;

        Ok(Self {
            job_name: request.job_name,
            phase: phase.into(),
            task_index: request.task_index,
            input_ref: request.input_ref,
            other_phase_count: request.other_phase_count,
        })
    }
}
