//! Streaming encoding of intermediate and output records.
//!
//! Records are newline-delimited JSON objects, one [`KeyValue`] per line, so
//! a reader can tell "end of stream" apart from "malformed record".

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::KeyValue;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cannot open `{}`", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create `{}`", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed reading `{}` at line {line}", path.display())]
    Read {
        path: PathBuf,
        line: usize,
        #[source]
        source: io::Error,
    },

    #[error("malformed record in `{}` at line {line}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed writing `{}`", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Decodes the records of one file, one at a time.
pub struct RecordReader {
    path: PathBuf,
    reader: BufReader<File>,
    line: usize,
    buf: String,
}

impl RecordReader {
    /// Open `path` for reading. A missing file is an error, never an empty
    /// stream.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| CodecError::Open {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            reader: BufReader::new(file),
            line: 0,
            buf: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(None)` once the stream is exhausted.
    pub fn next_record(&mut self) -> Result<Option<KeyValue>, CodecError> {
        loop {
            self.buf.clear();
            self.line += 1;

            let read = self
                .reader
                .read_line(&mut self.buf)
                .map_err(|source| CodecError::Read {
                    path: self.path.clone(),
                    line: self.line,
                    source,
                })?;
            if read == 0 {
                return Ok(None);
            }

            let record = self.buf.trim_end_matches(['\n', '\r']);
            if record.trim().is_empty() {
                continue;
            }

            return serde_json::from_str(record)
                .map(Some)
                .map_err(|source| CodecError::Malformed {
                    path: self.path.clone(),
                    line: self.line,
                    source,
                });
        }
    }
}

impl Iterator for RecordReader {
    type Item = Result<KeyValue, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Encodes records into a scratch file next to `path`.
///
/// [`finish`](RecordWriter::finish) renames the scratch file over `path`, so
/// readers only ever see a complete file and whatever a previous attempt left
/// there is replaced. A writer dropped before `finish` leaves `path` alone.
pub struct RecordWriter {
    path: PathBuf,
    writer: BufWriter<NamedTempFile>,
    written: usize,
}

impl RecordWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file = NamedTempFile::new_in(dir).map_err(|source| CodecError::Create {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write(&mut self, kv: &KeyValue) -> Result<(), CodecError> {
        let write_err = |source: io::Error| CodecError::Write {
            path: self.path.clone(),
            source,
        };

        serde_json::to_writer(&mut self.writer, kv).map_err(|e| write_err(e.into()))?;
        self.writer.write_all(b"\n").map_err(write_err)?;
        self.written += 1;

        Ok(())
    }

    /// Flush, move the file into place and return the number of records
    /// written.
    pub fn finish(self) -> Result<usize, CodecError> {
        let write_err = |source: io::Error| CodecError::Write {
            path: self.path.clone(),
            source,
        };

        let file = self
            .writer
            .into_inner()
            .map_err(|e| write_err(e.into_error()))?;
        file.persist(&self.path).map_err(|e| write_err(e.error))?;

        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn reads_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&KeyValue::new("a", "1")).unwrap();
        writer.write(&KeyValue::new("line\nbreak", "\"quoted\"")).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let records: Vec<_> = RecordReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            records,
            vec![
                KeyValue::new("a", "1"),
                KeyValue::new("line\nbreak", "\"quoted\"")
            ]
        );
    }

    #[test]
    fn uses_capitalised_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&KeyValue::new("k", "v")).unwrap();
        writer.finish().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"Key\":\"k\",\"Value\":\"v\"}\n");
    }

    #[test]
    fn malformed_record_is_an_error_not_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        fs::write(
            &path,
            "{\"Key\":\"a\",\"Value\":\"1\"}\n\n{\"Key\":\"b\"\n{\"Key\":\"c\",\"Value\":\"3\"}\n",
        )
        .unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap(), Some(KeyValue::new("a", "1")));
        match reader.next_record() {
            Err(CodecError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected a malformed record, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RecordReader::open(dir.path().join("nope")),
            Err(CodecError::Open { .. })
        ));
    }

    #[test]
    fn finish_replaces_a_previous_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        fs::write(&path, "left over from a previous attempt\n").unwrap();

        RecordWriter::create(&path).unwrap().finish().unwrap();

        assert!(RecordReader::open(&path).unwrap().next_record().unwrap().is_none());
    }

    #[test]
    fn output_appears_only_once_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        fs::write(&path, "{\"Key\":\"old\",\"Value\":\"1\"}\n").unwrap();

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&KeyValue::new("new", "2")).unwrap();
        assert_eq!(
            RecordReader::open(&path).unwrap().next_record().unwrap(),
            Some(KeyValue::new("old", "1"))
        );

        writer.finish().unwrap();
        let records: Vec<_> = RecordReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records, vec![KeyValue::new("new", "2")]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn abandoned_writer_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write(&KeyValue::new("a", "1")).unwrap();
        drop(writer);

        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
