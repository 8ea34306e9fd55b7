use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Error};
use tracing::info;

use common::codec::RecordWriter;
use common::{ihash, reduce_name, KeyValue, MapFn};

/// Everything a single map task needs.
pub struct MapTask<'a> {
    pub dir: &'a Path,
    pub job_name: &'a str,
    pub map_task: u32,
    pub input_file: &'a str,
    pub n_reduce: u32,
    pub map_fn: MapFn,
}

/// Run `map_fn` over one input file and split its output into one
/// intermediate file per reduce partition. Every partition file is created,
/// even when no key hashes to it.
pub fn perform_map(task: &MapTask) -> Result<usize, Error> {
    if task.n_reduce == 0 {
        return Err(anyhow!("map task {} has no reduce partitions", task.map_task));
    }

    info!(
        map_task = task.map_task,
        input = task.input_file,
        "Starting map task"
    );

    let contents = fs::read_to_string(task.input_file)
        .with_context(|| format!("failed reading map input `{}`", task.input_file))?;

    let mut partitions = (0..task.n_reduce)
        .map(|reduce_task| {
            RecordWriter::create(reduce_name(task.dir, task.job_name, task.map_task, reduce_task))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let emitted = (task.map_fn)(KeyValue::new(task.input_file, contents))?;

    let mut records = 0usize;
    for kv in emitted {
        let kv = kv?;
        let partition = ihash(kv.key.as_bytes()) % task.n_reduce;
        partitions[partition as usize].write(&kv)?;
        records += 1;
    }

    for partition in partitions {
        partition.finish()?;
    }

    info!(map_task = task.map_task, records, "map task finished");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use common::codec::RecordReader;

    use super::*;

    fn words(kv: KeyValue) -> common::MapOutput {
        let words: Vec<String> = kv.value.split_whitespace().map(str::to_string).collect();
        Ok(Box::new(
            words
                .into_iter()
                .map(|word| Ok::<_, Error>(KeyValue::new(word, "1"))),
        ))
    }

    #[test]
    fn partitions_by_key_hash() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "a b c d e f a b").unwrap();
        let input = input.to_string_lossy().to_string();

        let task = MapTask {
            dir: dir.path(),
            job_name: "test",
            map_task: 4,
            input_file: &input,
            n_reduce: 3,
            map_fn: words,
        };
        assert_eq!(perform_map(&task).unwrap(), 8);

        let mut total = 0;
        for reduce_task in 0..3 {
            let path = reduce_name(dir.path(), "test", 4, reduce_task);
            for kv in RecordReader::open(path).unwrap() {
                let kv = kv.unwrap();
                assert_eq!(ihash(kv.key.as_bytes()) % 3, reduce_task);
                total += 1;
            }
        }
        assert_eq!(total, 8);
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let task = MapTask {
            dir: dir.path(),
            job_name: "test",
            map_task: 0,
            input_file: "/definitely/not/here.txt",
            n_reduce: 2,
            map_fn: words,
        };
        assert!(perform_map(&task).is_err());
    }
}
