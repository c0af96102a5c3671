//! Append-only persistence log.
//!
//! The log is the durable copy of the table: every successful insert and
//! remove appends one [`Record`] line, and replaying the file from an empty
//! table rebuilds the same mapping. At startup the log is replayed and then
//! rewritten as a compact snapshot of the live entries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::Record;

/// File name of the log inside the data directory.
pub const LOG_FILE: &str = "logfile.log";
const COMPACT_FILE: &str = "logfile.log.compact";

/// Outcome of replaying an existing log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Records handed to the apply callback.
    pub applied: usize,
    /// Line at which replay stopped because the record could not be parsed.
    pub stopped_at: Option<usize>,
}

/// Open handle on the log file, positioned for appending.
#[derive(Debug)]
pub struct PersistLog {
    path: PathBuf,
    file: File,
    /// Set when a failed append could not be cut back out of the file.
    torn: bool,
}

impl PersistLog {
    /// Replays the log in `dir`, calling `apply` for each record in file order.
    ///
    /// A missing log is an empty log. Replay stops at the first line that is
    /// not a valid record; records before it stay applied.
    pub fn replay<F>(dir: &Path, mut apply: F) -> Result<ReplaySummary>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let path = dir.join(LOG_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ReplaySummary::default()),
            Err(err) => return Err(err.into()),
        };

        let mut summary = ReplaySummary::default();
        let mut reader = BufReader::new(file);
        let mut raw = Vec::new();
        let mut line_no = 0usize;
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            line_no += 1;
            let parsed = match std::str::from_utf8(&raw) {
                Ok(text) => Record::parse(text.trim_end_matches('\n'), line_no),
                Err(_) => Err(Error::InvalidFormat {
                    line: line_no,
                    content: String::from_utf8_lossy(&raw).into_owned(),
                }),
            };
            match parsed {
                Ok(Some(record)) => {
                    apply(record)?;
                    summary.applied += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), line = line_no, error = %err, "stopping log replay at invalid record");
                    summary.stopped_at = Some(line_no);
                    break;
                }
            }
        }
        Ok(summary)
    }

    /// Replaces the log in `dir` with `records` and opens it for appending.
    ///
    /// The snapshot is written to a side file and renamed over the log, so the
    /// previous log survives a crash during the rewrite.
    pub fn rewrite<I>(dir: &Path, records: I) -> Result<Self>
    where
        I: IntoIterator<Item = Record>,
    {
        fs::create_dir_all(dir)?;
        let compact = dir.join(COMPACT_FILE);
        let path = dir.join(LOG_FILE);

        let mut writer = BufWriter::new(File::create(&compact)?);
        let mut written = 0usize;
        for record in records {
            writeln!(writer, "{record}")?;
            written += 1;
        }
        let file = writer.into_inner().map_err(|err| Error::Io(err.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&compact, &path)?;
        debug!(path = %path.display(), records = written, "compacted log");

        Self::open_append(path)
    }

    fn open_append(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            torn: false,
        })
    }

    /// Appends one record and flushes it to the OS.
    ///
    /// A write that fails part way is truncated away, so the log never keeps
    /// a fragment that a later record would be appended to.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let line = format!("{record}\n");
        self.append_with(|file| {
            file.write_all(line.as_bytes())?;
            file.flush()
        })
    }

    fn append_with<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        if self.torn {
            return Err(Error::Io(io::Error::other(
                "log ends in a partial record; reopen the store",
            )));
        }
        let len = self.file.metadata()?.len();
        if let Err(err) = write(&mut self.file) {
            if let Err(trim) = self.file.set_len(len) {
                warn!(path = %self.path.display(), error = %trim, "failed to cut partial record from log");
                self.torn = true;
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Truncates the log and reopens it empty.
    pub fn reset(&mut self) -> Result<()> {
        File::create(&self.path)?;
        let reopened = Self::open_append(self.path.clone())?;
        *self = reopened;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::value::Value;

    fn put(key: &str, n: i64) -> Record {
        Record::Put {
            key: Key::new(key).unwrap(),
            value: Value::Integer(n),
        }
    }

    fn collect(dir: &Path) -> (Vec<Record>, ReplaySummary) {
        let mut seen = Vec::new();
        let summary = PersistLog::replay(dir, |record| {
            seen.push(record);
            Ok(())
        })
        .unwrap();
        (seen, summary)
    }

    #[test]
    fn missing_log_replays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (records, summary) = collect(dir.path());
        assert!(records.is_empty());
        assert_eq!(summary, ReplaySummary::default());
    }

    #[test]
    fn appended_records_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PersistLog::rewrite(dir.path(), Vec::new()).unwrap();
        log.append(&put("a", 1)).unwrap();
        log.append(&Record::Remove {
            key: Key::new("a").unwrap(),
        })
        .unwrap();
        log.append(&put("b", 2)).unwrap();

        let (records, summary) = collect(dir.path());
        assert_eq!(summary.applied, 3);
        assert_eq!(records[0], put("a", 1));
        assert_eq!(records[2], put("b", 2));
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text, "a=1\n~a=\nb=2\n");
    }

    #[test]
    fn replay_stops_at_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), "a=1\nb=2\nc=\nd=4\n").unwrap();
        let (records, summary) = collect(dir.path());
        assert_eq!(records, vec![put("a", 1), put("b", 2)]);
        assert_eq!(summary.stopped_at, Some(3));
    }

    #[test]
    fn replay_stops_at_line_that_is_not_utf8() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), b"a=1\nb=2\n\xff\xfe=3\nd=4\n").unwrap();
        let (records, summary) = collect(dir.path());
        assert_eq!(records, vec![put("a", 1), put("b", 2)]);
        assert_eq!(summary.stopped_at, Some(3));
    }

    #[test]
    fn failed_append_leaves_no_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PersistLog::rewrite(dir.path(), vec![put("a", 1)]).unwrap();
        let err = log
            .append_with(|file| {
                file.write_all(b"b")?;
                Err(io::Error::other("no space left on device"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        log.append(&put("c", 3)).unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "a=1\nc=3\n");
        let (records, summary) = collect(dir.path());
        assert_eq!(records, vec![put("a", 1), put("c", 3)]);
        assert_eq!(summary.stopped_at, None);
    }

    #[test]
    fn rewrite_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), "a=1\n~a=\nb=2\n").unwrap();
        let log = PersistLog::rewrite(dir.path(), vec![put("b", 2)]).unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "b=2\n");
        assert!(!dir.path().join(COMPACT_FILE).exists());
    }

    #[test]
    fn reset_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PersistLog::rewrite(dir.path(), vec![put("x", 9)]).unwrap();
        log.reset().unwrap();
        log.append(&put("y", 1)).unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "y=1\n");
    }
}
