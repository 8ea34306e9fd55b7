//! Shared types for the coordinator, the workers and the MapReduce
//! applications. Data is exchanged through files in a directory every
//! participant can reach, named by the functions in this crate.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod rpc;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes a `(filename, contents)` pair and yields new
/// key-value pairs.
pub type MapFn = fn(kv: KeyValue) -> MapOutput;

/// A reduce function takes a key and every value emitted for that key, and
/// returns a single merged value.
///
/// The order of `values` across different map producers is not part of the
/// contract.
pub type ReduceFn = fn(key: &str, values: &[String]) -> anyhow::Result<String>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
///
/// Pairs order byte-lexicographically by key, then by value. Keys are never
/// interpreted as numbers.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    #[serde(rename = "Key")]
    pub key: String,

    /// The value.
    #[serde(rename = "Value")]
    pub value: String,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Consumes the pair and returns the value.
    #[inline]
    pub fn into_value(self) -> String {
        self.value
    }
}

/// Byte-lexicographic key order used for both sorting and grouping.
///
/// It is the primary component of the [`Ord`] impl of [`KeyValue`], so a
/// sorted run of pairs keeps every key contiguous and two pairs belong to the
/// same group iff this returns [`Ordering::Equal`].
#[inline]
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.key, &other.key)
            .then_with(|| self.value.as_bytes().cmp(other.value.as_bytes()))
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

/////////////////////////////////////////////////////////////////////////////
// Tasks
/////////////////////////////////////////////////////////////////////////////

/// One of the two stages of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Map,
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => write!(f, "mapPhase"),
            Phase::Reduce => write!(f, "reducePhase"),
        }
    }
}

/// Everything a worker needs to run one task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskArgs {
    pub job_name: String,
    pub phase: Phase,

    /// Unique within the phase, in `[0, ntasks)`.
    pub task_index: u32,

    /// The map input file. Empty for reduce tasks.
    pub input_ref: String,

    /// Reduce partitions for a map task, map producers for a reduce task.
    pub other_phase_count: u32,
}

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_reduce`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key);
    (hasher.finish() & 0x7fff_ffff) as u32
}

/////////////////////////////////////////////////////////////////////////////
// File naming
/////////////////////////////////////////////////////////////////////////////

/// Intermediate file written by map task `map_task` for reduce partition
/// `reduce_task`.
pub fn reduce_name(dir: &Path, job_name: &str, map_task: u32, reduce_task: u32) -> PathBuf {
    dir.join(format!("mrtmp.{job_name}-{map_task}-{reduce_task}"))
}

/// Output file of reduce task `reduce_task`.
pub fn merge_name(dir: &Path, job_name: &str, reduce_task: u32) -> PathBuf {
    dir.join(format!("mrtmp.{job_name}-res-{reduce_task}"))
}

/// Final, merged output of a job.
pub fn result_name(dir: &Path, job_name: &str) -> PathBuf {
    dir.join(format!("mrtmp.{job_name}"))
}
