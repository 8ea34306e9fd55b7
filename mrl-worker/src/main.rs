use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::signal;
use tonic::transport::{Channel, Server};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::rpc::{CoordinatorClient, WorkerJoinRequest, WorkerLeaveRequest, WorkerServer};

mod args;
use args::Args;

mod core;
use self::core::MRWorker;

mod map;
mod reduce;

async fn start_server(addr: SocketAddr, worker: MRWorker) {
    tokio::task::spawn(async move {
        info!("Worker server listening on {}", addr);

        if let Err(e) = Server::builder()
            .add_service(WorkerServer::new(worker))
            .serve(addr)
            .await
        {
            error!("Worker server stopped: {}", e);
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await
}

/// Keep trying to join until the coordinator accepts us.
async fn join(args: &Args, advertised: &str) -> CoordinatorClient<Channel> {
    loop {
        let attempt = async {
            let mut client = CoordinatorClient::connect(args.address.clone()).await?;
            let request = tonic::Request::new(WorkerJoinRequest {
                address: advertised.to_string(),
            });
            let response = client.worker_join(request).await?.into_inner();
            if !response.success {
                return Err(anyhow!("coordinator refused the worker"));
            }
            Ok::<_, anyhow::Error>(client)
        };

        match attempt.await {
            Ok(client) => return client,
            Err(e) => {
                warn!("Failed to join coordinator at {}: {e:#}", args.address);
                tokio::time::sleep(Duration::from_secs(args.join_retry_secs)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let workload = workload::try_named(&args.workload).ok_or_else(|| {
        anyhow!(
            "The workload `{}` is not a known workload (expected one of {:?})",
            args.workload,
            workload::WORKLOADS
        )
    })?;

    fs::create_dir_all(&args.work_dir)
        .with_context(|| format!("cannot create {}", args.work_dir.display()))?;

    let advertised = format!("{}:{}", args.host, args.port);
    let addr: SocketAddr = advertised
        .parse()
        .with_context(|| format!("invalid listen address `{advertised}`"))?;

    // Start server as background task.
    let worker = MRWorker::new(workload, args.work_dir.clone(), args.sort_buffer);
    start_server(addr, worker).await;

    let mut client = join(&args, &advertised).await;
    info!("Worker registered as {}", advertised);

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Worker server exited...");
            let leave_request = tonic::Request::new(WorkerLeaveRequest {
                address: advertised,
            });
            client.worker_leave(leave_request).await?;
            Ok(())
        }
        Err(err) => {
            error!("Fatal error encountered {}", err);
            // we also shut down in case of error
            Err(anyhow!("Unable to listen for shutdown signal: {}", err))
        }
    }
}
