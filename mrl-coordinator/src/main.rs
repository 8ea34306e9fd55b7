use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common::rpc::CoordinatorServer;
use mrl_coordinator::core::MRCoordinator;
use mrl_coordinator::jobs::Job;
use mrl_coordinator::scheduler::Scheduler;
use mrl_coordinator::transport::GrpcTransport;
use mrl_coordinator::worker_pool::WorkerPool;

mod args;
use args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    fs::create_dir_all(&args.dir)
        .with_context(|| format!("cannot create {}", args.dir.display()))?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;

    // Workers join through the gRPC service; the pool picks them up from here.
    let (registrations, rx) = mpsc::channel(64);
    let pool = Arc::new(WorkerPool::new());
    let listener = pool.consume_registrations(ReceiverStream::new(rx));

    let coordinator = MRCoordinator::new(registrations, pool.clone());

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            info!("CoordinatorServer listening on {}", addr);
            Server::builder()
                .add_service(CoordinatorServer::new(coordinator))
                .serve_with_shutdown(addr, shutdown.cancelled_owned())
                .await
        }
    });

    let scheduler = Scheduler::new(pool, Arc::new(GrpcTransport), args.policy());
    let mut job = Job::new(args.job.clone(), args.inputs.clone(), args.n_reduce, args.dir.clone())
        .with_cleanup(args.cleanup);

    let (outcome, server_running) = tokio::select! {
        outcome = job.run(&scheduler) => (outcome, true),
        stopped = &mut server => {
            let cause = match stopped {
                Ok(Ok(())) => anyhow!("server exited"),
                Ok(Err(e)) => e.into(),
                Err(e) => e.into(),
            };
            (Err(cause.context("coordinator server stopped before the job finished")), false)
        }
    };

    if server_running {
        shutdown.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Coordinator server stopped: {}", e),
            Err(e) => error!("Coordinator server task failed: {}", e),
        }
    }
    listener.abort();

    let summary = outcome.with_context(|| format!("job {} failed", job.get_name()))?;
    info!(
        map_attempts = summary.map.attempts,
        reduce_attempts = summary.reduce.attempts,
        "{} records written to {}",
        summary.records,
        summary.output.display()
    );

    Ok(())
}
