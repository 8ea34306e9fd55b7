use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ext_sort::{buffer::LimitedBufferBuilder, ExternalSorter, ExternalSorterBuilder};
use thiserror::Error;
use tracing::{debug, info};

use common::codec::{CodecError, RecordReader, RecordWriter};
use common::{compare_keys, merge_name, reduce_name, KeyValue, ReduceFn};

/// Stages a reduce task moves through, strictly in this order. A read or
/// decode failure aborts the task from whatever stage it is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceStage {
    Pending,
    Reading,
    Sorting,
    Reducing,
    Writing,
    Done,
}

impl fmt::Display for ReduceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("external sort failed: {0}")]
    Sort(String),

    #[error("reduce function failed for key `{key}`")]
    Reduce {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReduceSummary {
    /// Records read from all producers.
    pub records: usize,

    /// Distinct keys, i.e. records written.
    pub keys: usize,
}

/// Everything a single reduce task needs.
pub struct ReduceTask<'a> {
    /// Directory holding the intermediate files and receiving the output.
    pub dir: &'a Path,
    pub job_name: &'a str,
    pub reduce_task: u32,
    pub n_map: u32,
    pub reduce_fn: ReduceFn,

    /// Records held in memory before the sorter spills a chunk to disk.
    pub sort_buffer: usize,
}

/// Read the partition of every map producer, sort it by key, call
/// `reduce_fn` once per distinct key and write the results.
pub fn perform_reduce(task: &ReduceTask) -> Result<ReduceSummary, ReduceError> {
    let mut stage = ReduceStage::Pending;
    let advance = |stage: &mut ReduceStage, next: ReduceStage| {
        debug!(reduce_task = task.reduce_task, from = %stage, to = %next, "reduce stage");
        *stage = next;
    };

    // The output replaces an earlier attempt's only once it is complete.
    let out_path = merge_name(task.dir, task.job_name, task.reduce_task);
    let mut out = RecordWriter::create(&out_path)?;

    advance(&mut stage, ReduceStage::Reading);
    let readers = (0..task.n_map)
        .map(|map_task| {
            RecordReader::open(reduce_name(task.dir, task.job_name, map_task, task.reduce_task))
        })
        .collect::<Result<Vec<_>, _>>()?;

    advance(&mut stage, ReduceStage::Sorting);
    let sorter: ExternalSorter<KeyValue, CodecError, LimitedBufferBuilder> =
        ExternalSorterBuilder::new()
            .with_tmp_dir(task.dir)
            .with_buffer(LimitedBufferBuilder::new(task.sort_buffer.max(1), false))
            .build()
            .map_err(|e| ReduceError::Sort(e.to_string()))?;

    // The sorter only ever sees decoded records. The first decode error
    // ends the stream and is reported once sorting returns.
    let records = Arc::new(AtomicUsize::new(0));
    let failure: Arc<Mutex<Option<CodecError>>> = Arc::default();
    let stream = {
        let records = records.clone();
        let failure = failure.clone();
        let mut input = readers.into_iter().flatten();

        std::iter::from_fn(move || match input.next()? {
            Ok(kv) => {
                records.fetch_add(1, Ordering::Relaxed);
                Some(Ok(kv))
            }
            Err(e) => {
                if let Ok(mut failure) = failure.lock() {
                    failure.get_or_insert(e);
                }
                None
            }
        })
    };

    let sorted = sorter
        .sort(stream)
        .map_err(|e| ReduceError::Sort(e.to_string()))?;
    if let Some(e) = failure.lock().ok().and_then(|mut failure| failure.take()) {
        return Err(e.into());
    }
    let records = records.load(Ordering::Relaxed);

    advance(&mut stage, ReduceStage::Reducing);
    let mut keys = 0usize;
    let mut current_key: Option<String> = None;
    let mut values: Vec<String> = vec![];

    for item in sorted {
        let kv = item.map_err(|e| ReduceError::Sort(e.to_string()))?;

        let same_group = current_key
            .as_deref()
            .is_some_and(|key| compare_keys(key, &kv.key).is_eq());
        if !same_group {
            if let Some(key) = current_key.replace(kv.key.clone()) {
                emit(&mut out, task.reduce_fn, key, &values)?;
                keys += 1;
                values.clear();
            }
        }
        values.push(kv.into_value());
    }

    // write the last group to the output
    if let Some(key) = current_key.take() {
        emit(&mut out, task.reduce_fn, key, &values)?;
        keys += 1;
    }

    advance(&mut stage, ReduceStage::Writing);
    out.finish()?;

    advance(&mut stage, ReduceStage::Done);
    info!(
        reduce_task = task.reduce_task,
        records,
        keys,
        output = %out_path.display(),
        "reduce task finished"
    );

    Ok(ReduceSummary { records, keys })
}

fn emit(
    out: &mut RecordWriter,
    reduce_fn: ReduceFn,
    key: String,
    values: &[String],
) -> Result<(), ReduceError> {
    let value = reduce_fn(&key, values).map_err(|source| ReduceError::Reduce {
        key: key.clone(),
        source,
    })?;

    out.write(&KeyValue { key, value })?;
    Ok(())
}
