use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tracing::{debug, info};

use common::codec::RecordReader;
use common::{merge_name, reduce_name, result_name, KeyValue, Phase};

use crate::scheduler::{PhaseReport, Scheduler};

/// State of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Job not started.
    Pending,

    /// Mapping phase.
    Mapping,

    /// Reducing phase.
    Reducing,

    /// Combining the reduce outputs.
    Merging,

    /// Job completed.
    Completed,
}

/// A job context.
#[derive(Debug, Clone)]
pub struct Job {
    /// The current state of the job.
    state: JobState,

    /// Names every intermediate and output file of the job.
    name: String,

    /// Map input files, one map task each.
    input_files: Vec<String>,

    /// Number of reduce partitions.
    n_reduce: u32,

    /// Directory shared with the workers.
    dir: PathBuf,

    /// Remove intermediate and per-partition files once merged.
    cleanup: bool,
}

/// What a finished job produced.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub map: PhaseReport,
    pub reduce: PhaseReport,
    pub output: PathBuf,
    pub records: usize,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        input_files: Vec<String>,
        n_reduce: u32,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state: JobState::Pending,
            name: name.into(),
            input_files,
            n_reduce,
            dir: dir.into(),
            cleanup: false,
        }
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Get the state of the job.
    pub fn get_state(&self) -> JobState {
        self.state
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    fn n_map(&self) -> u32 {
        self.input_files.len() as u32
    }

    /// Task inputs of a phase and the task count of the other phase.
    ///
    /// Map tasks read one input file each; reduce tasks find their input by
    /// name, so their input reference is empty.
    pub fn phase_tasks(&self, phase: Phase) -> (Vec<String>, u32) {
        match phase {
            Phase::Map => (self.input_files.clone(), self.n_reduce),
            Phase::Reduce => (vec![String::new(); self.n_reduce as usize], self.n_map()),
        }
    }

    /// Run both phases on `scheduler`, then merge the reduce outputs.
    pub async fn run(&mut self, scheduler: &Scheduler) -> Result<JobSummary, Error> {
        info!(
            job = %self.name,
            n_map = self.n_map(),
            n_reduce = self.n_reduce,
            "Starting job"
        );

        self.state = JobState::Mapping;
        let (inputs, n_other) = self.phase_tasks(Phase::Map);
        let map = scheduler
            .run_phase(&self.name, &inputs, n_other, Phase::Map)
            .await?;

        self.state = JobState::Reducing;
        let (inputs, n_other) = self.phase_tasks(Phase::Reduce);
        let reduce = scheduler
            .run_phase(&self.name, &inputs, n_other, Phase::Reduce)
            .await?;

        self.state = JobState::Merging;
        let records = merge_outputs(&self.dir, &self.name, self.n_reduce)?;
        if self.cleanup {
            cleanup_intermediate(&self.dir, &self.name, self.n_map(), self.n_reduce)?;
        }

        self.state = JobState::Completed;
        let output = result_name(&self.dir, &self.name);
        info!(job = %self.name, records, output = %output.display(), "Job completed");

        Ok(JobSummary {
            map,
            reduce,
            output,
            records,
        })
    }
}

/// Combine the output of every reduce task into one file of `key: value`
/// lines ordered by key. Returns the number of lines written.
pub fn merge_outputs(dir: &Path, job_name: &str, n_reduce: u32) -> Result<usize, Error> {
    debug!("Merge phase");

    let mut kvs: Vec<KeyValue> = vec![];
    for reduce_task in 0..n_reduce {
        let path = merge_name(dir, job_name, reduce_task);
        debug!("Merge: read {}", path.display());
        for kv in RecordReader::open(&path)? {
            kvs.push(kv?);
        }
    }
    kvs.sort();

    let path = result_name(dir, job_name);
    let file =
        File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for kv in &kvs {
        writeln!(out, "{kv}")?;
    }
    out.flush()?;

    Ok(kvs.len())
}

/// Remove the intermediate files and the per-partition outputs of a job.
/// Files that are already gone are ignored.
pub fn cleanup_intermediate(
    dir: &Path,
    job_name: &str,
    n_map: u32,
    n_reduce: u32,
) -> Result<(), Error> {
    let intermediate = (0..n_map).flat_map(move |map_task| {
        (0..n_reduce).map(move |reduce_task| reduce_name(dir, job_name, map_task, reduce_task))
    });
    let outputs = (0..n_reduce).map(|reduce_task| merge_name(dir, job_name, reduce_task));

    for path in intermediate.chain(outputs) {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("cannot remove {}", path.display()));
            }
        }
    }

    Ok(())
}
