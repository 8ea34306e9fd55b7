use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The address of the coordinator server
    #[arg(short = 'j', long = "join", default_value = "http://[::1]:8030")]
    pub address: String,

    /// The host this worker listens on and advertises to the coordinator.
    #[arg(long, default_value = "[::1]")]
    pub host: String,

    /// The port to run the worker on.
    #[arg(short, long)]
    pub port: u16,

    /// Name of the MapReduce application to run (`wc`, `vertex-degree`).
    #[arg(short, long, default_value = "wc")]
    pub workload: String,

    /// Directory shared with the coordinator and the other workers.
    #[arg(short = 'd', long, default_value = "./mr-tmp")]
    pub work_dir: PathBuf,

    /// Records a reduce task sorts in memory before spilling to disk.
    #[arg(long, default_value_t = 1_000_000)]
    pub sort_buffer: usize,

    /// Seconds between attempts to join the coordinator.
    #[arg(long, default_value_t = 1)]
    pub join_retry_secs: u64,
}
