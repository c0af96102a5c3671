//! Chained hash table of tagged values backed by the persistence log.
//!
//! [`HashTable`] provides per-call safety only: each chain sits behind its
//! own mutex so the table is `Sync`, but operations spanning several keys are
//! not atomic. Multi-key atomicity is layered on top by
//! [`SyncStore`](crate::store::SyncStore).

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::log::PersistLog;
use crate::record::Record;
use crate::value::{Value, INTEGER, REFERENCE};

const HASH_SEED: i32 = 5381;
const HASH_MULTIPLIER: f64 = 0.618034;

/// Maps `key` to a bucket in `[0, table_size)`.
///
/// djb2 over the key bytes, reduced with multiplicative hashing:
/// `floor(table_size * frac(h * 0.618034))`.
pub fn bucket_index(key: &str, table_size: usize) -> usize {
    let hash = key
        .bytes()
        .fold(HASH_SEED, |h, b| h.wrapping_mul(33).wrapping_add(i32::from(b)));
    let scaled = f64::from(hash) * HASH_MULTIPLIER;
    let fraction = scaled - scaled.floor();
    let index = (table_size as f64 * fraction) as usize;
    index.min(table_size.saturating_sub(1))
}

#[derive(Debug)]
struct Entry {
    key: Key,
    value: Value,
}

type Chain = Vec<Entry>;

/// Fixed-size chained hash table whose mutations are mirrored to a log.
#[derive(Debug)]
pub struct HashTable {
    buckets: Vec<Mutex<Chain>>,
    log: Mutex<PersistLog>,
    max_recursion: u16,
}

impl HashTable {
    /// Opens the table persisted under `config.data_dir`.
    ///
    /// Replays the existing log without re-logging, then compacts it to one
    /// record per live entry.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let table_size = config.effective_table_size();
        let mut chains: Vec<Chain> = (0..table_size).map(|_| Chain::new()).collect();

        let summary = PersistLog::replay(&config.data_dir, |record| {
            apply_unlogged(&mut chains, record);
            Ok(())
        })?;

        let snapshot: Vec<Record> = chains
            .iter()
            .flatten()
            .map(|entry| Record::Put {
                key: entry.key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        let live = snapshot.len();
        let log = PersistLog::rewrite(&config.data_dir, snapshot)?;

        info!(
            dir = %config.data_dir.display(),
            replayed = summary.applied,
            live,
            table_size,
            "opened store"
        );

        Ok(Self {
            buckets: chains.into_iter().map(Mutex::new).collect(),
            log: Mutex::new(log),
            max_recursion: config.max_recursion,
        })
    }

    /// Number of buckets.
    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }

    pub fn max_recursion(&self) -> u16 {
        self.max_recursion
    }

    /// Validates `key` and returns its bucket.
    pub fn bucket_of(&self, key: &str) -> Result<usize> {
        crate::key::validate(key)?;
        Ok(bucket_index(key, self.table_size()))
    }

    /// Inserts or overwrites `key`.
    pub fn insert(&self, key: &str, value: Value) -> Result<()> {
        let key = Key::new(key)?;
        let mut chain = self.chain(bucket_index(key.as_str(), self.table_size()));
        self.log().append(&Record::Put {
            key: key.clone(),
            value: value.clone(),
        })?;

        match chain.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value,
            None => chain.push(Entry { key, value }),
        }
        Ok(())
    }

    /// Inserts a reference to the variable `target`.
    pub fn insert_reference(&self, key: &str, target: &str) -> Result<()> {
        crate::key::validate(key)?;
        self.insert(key, Value::reference(target)?)
    }

    /// Returns the stored value, whichever variant it is.
    pub fn get(&self, key: &str) -> Result<Value> {
        let chain = self.chain(self.bucket_of(key)?);
        chain
            .iter()
            .find(|entry| entry.key.as_str() == key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Looks up an integer variable.
    pub fn lookup_integer(&self, key: &str) -> Result<i64> {
        match self.get(key)? {
            Value::Integer(n) => Ok(n),
            other => Err(mismatch(key, INTEGER, &other)),
        }
    }

    /// Looks up a reference variable, returning the referenced name.
    pub fn lookup_reference(&self, key: &str) -> Result<Key> {
        match self.get(key)? {
            Value::Reference(target) => Ok(target),
            other => Err(mismatch(key, REFERENCE, &other)),
        }
    }

    /// Follows references from `key` until an integer is found.
    ///
    /// Each dereference of a reference costs one hop; running out of hops
    /// fails with [`Error::CycleOrTooDeep`], a missing link with
    /// [`Error::NotFound`].
    pub fn recursive_lookup(&self, key: &str, max_hops: u16) -> Result<i64> {
        let mut current = key.to_string();
        for _ in 0..max_hops {
            match self.get(&current)? {
                Value::Integer(n) => return Ok(n),
                Value::Reference(next) => current = next.into_string(),
            }
        }
        Err(Error::CycleOrTooDeep {
            key: key.to_string(),
            hops: max_hops,
        })
    }

    /// Removes `key`, failing with [`Error::NotFound`] if absent.
    pub fn remove(&self, key: &str) -> Result<()> {
        let mut chain = self.chain(self.bucket_of(key)?);
        let position = chain
            .iter()
            .position(|entry| entry.key.as_str() == key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        let record = Record::Remove {
            key: chain[position].key.clone(),
        };
        self.log().append(&record)?;
        chain.swap_remove(position);
        Ok(())
    }

    /// Drops every entry and restarts the log empty.
    pub fn clear(&self) -> Result<()> {
        let mut chains: Vec<_> = (0..self.table_size()).map(|i| self.chain(i)).collect();
        self.log().reset()?;
        for chain in chains.iter_mut() {
            chain.clear();
        }
        Ok(())
    }

    /// Writes every entry as a `key=value` line to a new file at `path`.
    ///
    /// Fails if `path` already exists.
    pub fn dump(&self, path: &Path) -> Result<usize> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = BufWriter::new(file);
        let mut written = 0usize;
        for index in 0..self.table_size() {
            for entry in self.chain(index).iter() {
                writeln!(writer, "{}={}", entry.key, entry.value)?;
                written += 1;
            }
        }
        writer.flush()?;
        Ok(written)
    }

    /// Applies the records in the file at `path`, in order.
    ///
    /// The file is read in full before anything is applied, so loading the
    /// store's own log sees only the records present when the load began.
    /// An invalid line aborts the load; lines before it stay applied.
    /// Removals of absent keys are ignored.
    pub fn load(&self, path: &Path) -> Result<usize> {
        let contents = fs::read_to_string(path)?;
        let mut applied = 0usize;
        for (index, line) in contents.lines().enumerate() {
            let Some(record) = Record::parse(line, index + 1)? else {
                continue;
            };
            match record {
                Record::Put { key, value } => self.insert(key.as_str(), value)?,
                Record::Remove { key } => match self.remove(key.as_str()) {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                },
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        (0..self.table_size()).map(|i| self.chain(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out every entry, in bucket order.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        (0..self.table_size())
            .flat_map(|i| {
                self.chain(i)
                    .iter()
                    .map(|entry| (entry.key.clone(), entry.value.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn chain(&self, index: usize) -> MutexGuard<'_, Chain> {
        self.buckets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self) -> MutexGuard<'_, PersistLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_unlogged(chains: &mut [Chain], record: Record) {
    let table_size = chains.len();
    match record {
        Record::Put { key, value } => {
            let chain = &mut chains[bucket_index(key.as_str(), table_size)];
            match chain.iter_mut().find(|entry| entry.key == key) {
                Some(entry) => entry.value = value,
                None => chain.push(Entry { key, value }),
            }
        }
        Record::Remove { key } => {
            let chain = &mut chains[bucket_index(key.as_str(), table_size)];
            match chain.iter().position(|entry| entry.key == key) {
                Some(position) => {
                    chain.swap_remove(position);
                }
                None => warn!(key = %key, "log removes a key that is not present"),
            }
        }
    }
}

fn mismatch(key: &str, expected: &'static str, found: &Value) -> Error {
    Error::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::log::LOG_FILE;

    fn open(dir: &Path) -> HashTable {
        HashTable::open(&StoreConfig::new(dir)).unwrap()
    }

    #[test]
    fn bucket_index_stays_in_range() {
        for size in [1, 2, 7, 32, 1000] {
            for key in ["a", "foo", "bar", "foobar", "Z_9", "abcdefghijklmnopqrstuvwxyz01234"] {
                assert!(bucket_index(key, size) < size);
            }
        }
    }

    #[test]
    fn bucket_index_is_deterministic() {
        assert_eq!(bucket_index("counter", 32), bucket_index("counter", 32));
    }

    #[test]
    fn insert_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        table.insert("foo", Value::Integer(42)).unwrap();
        table.insert("bar", Value::Integer(-42)).unwrap();
        assert_eq!(table.lookup_integer("foo").unwrap(), 42);
        assert_eq!(table.lookup_integer("bar").unwrap(), -42);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn overwrite_changes_value_and_tag() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        table.insert("foo", Value::Integer(1)).unwrap();
        table.insert_reference("foo", "bar").unwrap();
        assert_eq!(table.lookup_reference("foo").unwrap().as_str(), "bar");
        assert!(matches!(
            table.lookup_integer("foo"),
            Err(Error::TypeMismatch { expected: "integer", found: "reference", .. })
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn invalid_keys_are_rejected_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        let too_long = "x".repeat(40);
        for key in ["", "5oobar", "foo~bar", "a=b", too_long.as_str()] {
            assert!(matches!(table.insert(key, Value::Integer(1)), Err(Error::InvalidKey(_))));
            assert!(matches!(table.get(key), Err(Error::InvalidKey(_))));
            assert!(matches!(table.remove(key), Err(Error::InvalidKey(_))));
        }
        assert!(matches!(table.insert_reference("ok", "9bad"), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn remove_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        table.insert("foo", Value::Integer(1)).unwrap();
        table.remove("foo").unwrap();
        assert!(matches!(table.get("foo"), Err(Error::NotFound(_))));
        assert!(matches!(table.remove("foo"), Err(Error::NotFound(_))));
    }

    #[test]
    fn recursive_lookup_hop_budget() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        table.insert_reference("k", "k2").unwrap();
        table.insert_reference("k2", "k3").unwrap();
        table.insert("k3", Value::Integer(42)).unwrap();
        assert_eq!(table.recursive_lookup("k", 3).unwrap(), 42);
        assert!(matches!(
            table.recursive_lookup("k", 2),
            Err(Error::CycleOrTooDeep { hops: 2, .. })
        ));

        table.insert_reference("me", "me").unwrap();
        for hops in [0, 1, 5, 50] {
            assert!(matches!(
                table.recursive_lookup("me", hops),
                Err(Error::CycleOrTooDeep { .. })
            ));
        }

        table.insert_reference("dangling", "nowhere").unwrap();
        assert!(matches!(
            table.recursive_lookup("dangling", 10),
            Err(Error::NotFound(name)) if name == "nowhere"
        ));
    }

    #[test]
    fn replay_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), "a=1\nb=2\n~a=\nc=3\n").unwrap();
        let table = open(dir.path());
        assert!(matches!(table.get("a"), Err(Error::NotFound(_))));
        assert_eq!(table.lookup_integer("b").unwrap(), 2);
        assert_eq!(table.lookup_integer("c").unwrap(), 3);
    }

    #[test]
    fn reopening_compacts_the_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = open(dir.path());
            table.insert("a", Value::Integer(1)).unwrap();
            table.insert("a", Value::Integer(2)).unwrap();
            table.insert("b", Value::Integer(3)).unwrap();
            table.remove("b").unwrap();
        }
        let table = open(dir.path());
        assert_eq!(table.lookup_integer("a").unwrap(), 2);
        let log = fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(log, "a=2\n");
    }

    #[test]
    fn clear_empties_table_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        table.insert("a", Value::Integer(1)).unwrap();
        table.clear().unwrap();
        assert!(table.is_empty());
        table.insert("b", Value::Integer(2)).unwrap();
        drop(table);

        let table = open(dir.path());
        assert!(matches!(table.get("a"), Err(Error::NotFound(_))));
        assert_eq!(table.lookup_integer("b").unwrap(), 2);
    }

    #[test]
    fn dump_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        let target = dir.path().join("snapshot");
        fs::write(&target, "").unwrap();
        match table.dump(&target) {
            Err(Error::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn dump_writes_only_puts() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        table.insert("n", Value::Integer(-5)).unwrap();
        table.insert_reference("r", "n").unwrap();
        table.insert("gone", Value::Integer(0)).unwrap();
        table.remove("gone").unwrap();

        let target = dir.path().join("snapshot");
        assert_eq!(table.dump(&target).unwrap(), 2);
        let mut lines: Vec<String> = fs::read_to_string(&target)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        lines.sort();
        assert_eq!(lines, vec!["n=-5", "r=n"]);
    }

    #[test]
    fn load_keeps_lines_before_a_bad_one() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        let input = dir.path().join("input");
        fs::write(&input, "a=1\n~missing=\nb=2\nbroken\nc=3\n").unwrap();
        assert!(matches!(
            table.load(&input),
            Err(Error::InvalidFormat { line: 4, .. })
        ));
        assert_eq!(table.lookup_integer("a").unwrap(), 1);
        assert_eq!(table.lookup_integer("b").unwrap(), 2);
        assert!(matches!(table.get("c"), Err(Error::NotFound(_))));
    }

    #[test]
    fn loading_own_log_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let table = open(dir.path());
        table.insert("a", Value::Integer(1)).unwrap();
        table.insert_reference("b", "a").unwrap();

        let log = dir.path().join(LOG_FILE);
        assert_eq!(table.load(&log).unwrap(), 2);
        assert_eq!(fs::read_to_string(&log).unwrap(), "a=1\nb=a\na=1\nb=a\n");
        assert_eq!(table.lookup_integer("a").unwrap(), 1);
        assert_eq!(table.lookup_reference("b").unwrap().as_str(), "a");
    }

    #[test]
    fn loaded_records_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        fs::write(&input, "a=1\nptr=a\n").unwrap();
        {
            let table = open(dir.path());
            assert_eq!(table.load(&input).unwrap(), 2);
        }
        let table = open(dir.path());
        assert_eq!(table.recursive_lookup("ptr", 2).unwrap(), 1);
    }
}
