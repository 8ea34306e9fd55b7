use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use mrl_coordinator::scheduler::SchedulePolicy;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The port for the server to run on.
    #[arg(short, long, default_value = "8030")]
    pub port: u16,

    /// The host to listen on.
    #[arg(long, default_value = "[::1]")]
    pub host: String,

    /// Name of the job. Names every intermediate and output file.
    #[arg(short, long, default_value = "wc")]
    pub job: String,

    /// Number of reduce partitions.
    #[arg(short, long, default_value = "3")]
    pub n_reduce: u32,

    /// Directory shared with the workers.
    #[arg(short, long, default_value = "./mr-tmp")]
    pub dir: PathBuf,

    /// Seconds before an unanswered task call counts as failed.
    #[arg(long, default_value = "30")]
    pub call_timeout_secs: u64,

    /// Attempts per task before the job fails. 0 retries forever.
    #[arg(long, default_value = "10")]
    pub max_attempts: u32,

    /// Milliseconds to wait before re-dispatching a failed task.
    #[arg(long, default_value = "100")]
    pub retry_backoff_ms: u64,

    /// Remove intermediate files once the job has finished.
    #[arg(long)]
    pub cleanup: bool,

    /// Map input files, one map task each.
    #[arg(required = true)]
    pub inputs: Vec<String>,
}

impl Args {
    pub fn policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
            ..SchedulePolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_attempts_means_unbounded() {
        let args = Args::parse_from(["mrl-coordinator", "--max-attempts", "0", "in.txt"]);
        assert_eq!(args.policy().max_attempts, None);
        assert_eq!(args.inputs, vec!["in.txt".to_string()]);
    }

    #[test]
    fn defaults() {
        let args = Args::parse_from(["mrl-coordinator", "a.txt", "b.txt"]);
        let policy = args.policy();

        assert_eq!(args.n_reduce, 3);
        assert_eq!(policy.max_attempts, Some(10));
        assert_eq!(policy.call_timeout, Duration::from_secs(30));
    }
}
