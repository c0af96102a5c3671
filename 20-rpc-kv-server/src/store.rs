//! Thread-safe store: the hash table guarded by the bucket lock table.
//!
//! Single-key operations lock their bucket for the duration of the call.
//! Operations that must see several keys consistently go through
//! [`SyncStore::transaction`], which locks every participating bucket up
//! front in the global order and releases them when the closure returns.
//! Whole-table operations (clear, dump, load, recursive computations) hold
//! every bucket, and refuse to start while the caller holds only some.

use std::path::Path;

use tracing::{info, warn};

use crate::arith::{Computation, Operand};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::lock::{LockTable, OwnerId};
use crate::table::HashTable;
use crate::value::Value;

/// Buckets held by one owner; released on drop.
#[must_use = "the buckets are released as soon as the guard is dropped"]
pub struct HeldBuckets<'a> {
    locks: &'a LockTable,
    buckets: Vec<usize>,
    owner: OwnerId,
    released: bool,
}

impl HeldBuckets<'_> {
    /// Releases the buckets now, reporting ownership errors.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.locks.release_many(&self.buckets, self.owner)
    }
}

impl Drop for HeldBuckets<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.locks.release_many(&self.buckets, self.owner) {
            warn!(owner = self.owner, error = %err, "failed to release buckets");
        }
    }
}

/// Hash table plus per-bucket reentrant locks.
#[derive(Debug)]
pub struct SyncStore {
    table: HashTable,
    locks: LockTable,
}

impl SyncStore {
    /// Opens (and replays) the store described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let table = HashTable::open(config)?;
        let locks = LockTable::new(table.table_size());
        Ok(Self { table, locks })
    }

    pub fn table_size(&self) -> usize {
        self.table.table_size()
    }

    pub fn max_recursion(&self) -> u16 {
        self.table.max_recursion()
    }

    /// Locks the buckets of `keys` in canonical order.
    ///
    /// Every key is validated before anything is locked.
    pub fn lock_keys(&self, keys: &[&str], owner: OwnerId) -> Result<HeldBuckets<'_>> {
        let buckets = keys
            .iter()
            .map(|key| self.table.bucket_of(key))
            .collect::<Result<Vec<_>>>()?;
        let buckets = self.locks.acquire_many(buckets, owner);
        Ok(self.held(buckets, owner))
    }

    /// Locks every bucket.
    ///
    /// An owner that already holds some but not all buckets would wait for
    /// the rest out of order, so it fails with [`Error::LockOrder`] instead.
    pub fn lock_all(&self, owner: OwnerId) -> Result<HeldBuckets<'_>> {
        let held = self.locks.held_by(owner);
        if held > 0 && held < self.locks.len() {
            return Err(Error::LockOrder { owner, held });
        }
        self.locks.acquire_all(owner);
        Ok(self.held((0..self.locks.len()).collect(), owner))
    }

    fn held(&self, buckets: Vec<usize>, owner: OwnerId) -> HeldBuckets<'_> {
        HeldBuckets {
            locks: &self.locks,
            buckets,
            owner,
            released: false,
        }
    }

    /// Runs `body` while holding the buckets of every key in `keys`.
    ///
    /// Store calls made from inside `body` by the same owner re-enter the held
    /// buckets without blocking.
    pub fn transaction<T, F>(&self, keys: &[&str], owner: OwnerId, body: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let held = self.lock_keys(keys, owner)?;
        let outcome = body(self);
        held.release()?;
        outcome
    }

    pub fn insert(&self, key: &str, value: Value, owner: OwnerId) -> Result<()> {
        let _held = self.lock_keys(&[key], owner)?;
        self.table.insert(key, value)
    }

    pub fn insert_integer(&self, key: &str, value: i64, owner: OwnerId) -> Result<()> {
        self.insert(key, Value::Integer(value), owner)
    }

    /// Stores a reference from `key` to `target`.
    pub fn insert_reference(&self, key: &str, target: &str, owner: OwnerId) -> Result<()> {
        let _held = self.lock_keys(&[key], owner)?;
        self.table.insert_reference(key, target)
    }

    pub fn get(&self, key: &str, owner: OwnerId) -> Result<Value> {
        let _held = self.lock_keys(&[key], owner)?;
        self.table.get(key)
    }

    pub fn lookup_integer(&self, key: &str, owner: OwnerId) -> Result<i64> {
        let _held = self.lock_keys(&[key], owner)?;
        self.table.lookup_integer(key)
    }

    pub fn lookup_reference(&self, key: &str, owner: OwnerId) -> Result<Key> {
        let _held = self.lock_keys(&[key], owner)?;
        self.table.lookup_reference(key)
    }

    /// Resolves `key` through references using the configured hop budget.
    ///
    /// The referents are not known up front, so this holds the whole table.
    fn recursive_lookup(&self, key: &str, owner: OwnerId) -> Result<i64> {
        crate::key::validate(key)?;
        let _held = self.lock_all(owner)?;
        self.table.recursive_lookup(key, self.max_recursion())
    }

    pub fn remove(&self, key: &str, owner: OwnerId) -> Result<()> {
        let _held = self.lock_keys(&[key], owner)?;
        self.table.remove(key)
    }

    pub fn clear(&self, owner: OwnerId) -> Result<()> {
        let _held = self.lock_all(owner)?;
        self.table.clear()?;
        info!(owner, "cleared store");
        Ok(())
    }

    /// Snapshots the table into a new file at `path`.
    pub fn dump(&self, path: &Path, owner: OwnerId) -> Result<usize> {
        let _held = self.lock_all(owner)?;
        let written = self.table.dump(path)?;
        info!(owner, path = %path.display(), entries = written, "dumped store");
        Ok(written)
    }

    /// Applies the records in `path`. Records before an invalid line stay
    /// applied.
    pub fn load(&self, path: &Path, owner: OwnerId) -> Result<usize> {
        let _held = self.lock_all(owner)?;
        let applied = self.table.load(path)?;
        info!(owner, path = %path.display(), records = applied, "loaded store");
        Ok(applied)
    }

    /// Evaluates `computation` atomically with respect to every variable it
    /// touches, storing the result when it names a destination.
    ///
    /// Recursive computations with variable operands hold the whole table,
    /// since the buckets of the referents are only discovered while resolving.
    pub fn compute(&self, computation: &Computation, owner: OwnerId) -> Result<i64> {
        let variables = computation.variables();
        for name in &variables {
            crate::key::validate(name)?;
        }

        let resolves_references = computation.recursive
            && (computation.lhs.variable().is_some() || computation.rhs.variable().is_some());
        let held = if resolves_references {
            self.lock_all(owner)?
        } else {
            self.lock_keys(&variables, owner)?
        };

        let outcome = self.evaluate(computation, owner);
        held.release()?;
        outcome
    }

    fn evaluate(&self, computation: &Computation, owner: OwnerId) -> Result<i64> {
        let lhs = self.resolve(&computation.lhs, computation.recursive, owner)?;
        let rhs = self.resolve(&computation.rhs, computation.recursive, owner)?;
        let result = computation.op.apply(lhs, rhs)?;
        if let Some(dest) = &computation.dest {
            self.insert_integer(dest, result, owner)?;
        }
        Ok(result)
    }

    fn resolve(&self, operand: &Operand, recursive: bool, owner: OwnerId) -> Result<i64> {
        match operand {
            Operand::Literal(n) => Ok(*n),
            Operand::Variable(name) if recursive => self.recursive_lookup(name, owner),
            Operand::Variable(name) => self.lookup_integer(name, owner),
        }
    }

    /// Copies out every entry under a whole-table lock.
    pub fn entries(&self, owner: OwnerId) -> Result<Vec<(Key, Value)>> {
        let _held = self.lock_all(owner)?;
        Ok(self.table.entries())
    }

    pub fn len(&self, owner: OwnerId) -> Result<usize> {
        let _held = self.lock_all(owner)?;
        Ok(self.table.len())
    }

    /// Low-level lock access for callers that manage locks by hand.
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Bucket that `key` hashes to.
    pub fn bucket_of(&self, key: &str) -> Result<usize> {
        self.table.bucket_of(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::ArithOp;

    const OWNER: OwnerId = 1;

    fn open(dir: &Path) -> SyncStore {
        SyncStore::open(&StoreConfig::new(dir)).unwrap()
    }

    #[test]
    fn simple_operations_release_their_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.insert_integer("a", 5, OWNER).unwrap();
        assert_eq!(store.lookup_integer("a", OWNER).unwrap(), 5);
        let bucket = store.bucket_of("a").unwrap();
        assert_eq!(store.locks().holder(bucket), None);

        assert!(store.remove("missing", OWNER).is_err());
        assert_eq!(store.locks().holder(store.bucket_of("missing").unwrap()), None);
    }

    #[test]
    fn invalid_key_locks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert!(matches!(
            store.lock_keys(&["good", "9bad"], OWNER),
            Err(Error::InvalidKey(_))
        ));
        assert!((0..store.table_size()).all(|b| store.locks().holder(b).is_none()));
    }

    #[test]
    fn compute_stores_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.insert_integer("a", 40, OWNER).unwrap();
        store.insert_integer("b", 2, OWNER).unwrap();
        let sum = Computation::new(ArithOp::Add, "a", "b").store_in("c");
        assert_eq!(store.compute(&sum, OWNER).unwrap(), 42);
        assert_eq!(store.lookup_integer("c", OWNER).unwrap(), 42);
    }

    #[test]
    fn compute_in_place_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.insert_integer("n", 1, OWNER).unwrap();
        let double = Computation::new(ArithOp::Mul, "n", 2i64).store_in("n");
        store.compute(&double, OWNER).unwrap();
        store.compute(&double, OWNER).unwrap();
        assert_eq!(store.lookup_integer("n", OWNER).unwrap(), 4);
    }

    #[test]
    fn compute_failures_leave_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.insert_integer("c", 7, OWNER).unwrap();
        let overflow = Computation::new(ArithOp::Add, i64::MAX, 1i64).store_in("c");
        assert!(matches!(store.compute(&overflow, OWNER), Err(Error::Overflow)));
        let missing = Computation::new(ArithOp::Add, "nope", 1i64).store_in("c");
        assert!(matches!(store.compute(&missing, OWNER), Err(Error::NotFound(_))));
        assert_eq!(store.lookup_integer("c", OWNER).unwrap(), 7);
        assert!((0..store.table_size()).all(|b| store.locks().holder(b).is_none()));
    }

    #[test]
    fn recursive_compute_follows_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.insert_integer("base", 10, OWNER).unwrap();
        store.insert_reference("alias", "base", OWNER).unwrap();
        let plain = Computation::new(ArithOp::Add, "alias", 1i64);
        assert!(matches!(store.compute(&plain, OWNER), Err(Error::TypeMismatch { .. })));
        let deep = Computation::new(ArithOp::Add, "alias", 1i64).recursive();
        assert_eq!(store.compute(&deep, OWNER).unwrap(), 11);
    }

    #[test]
    fn transaction_holds_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let seen = store
            .transaction(&["x", "y"], OWNER, |store| {
                let x_bucket = store.bucket_of("x")?;
                assert_eq!(store.locks().holder(x_bucket), Some(OWNER));
                store.insert_integer("x", 1, OWNER)?;
                store.insert_integer("y", 2, OWNER)?;
                Ok(store.locks().holder(x_bucket))
            })
            .unwrap();
        assert_eq!(seen, Some(OWNER));
        assert_eq!(store.locks().holder(store.bucket_of("x").unwrap()), None);
    }

    #[test]
    fn whole_table_work_inside_a_partial_transaction_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStore::open(&StoreConfig::new(dir.path()).with_table_size(8)).unwrap();
        store.insert_integer("base", 3, OWNER).unwrap();
        store.insert_reference("alias", "base", OWNER).unwrap();

        let deep = Computation::new(ArithOp::Add, "alias", 1i64).recursive();
        let outcome = store.transaction(&["alias"], OWNER, |store| store.compute(&deep, OWNER));
        assert!(matches!(outcome, Err(Error::LockOrder { owner: OWNER, held: 1 })));
        let outcome = store.transaction(&["alias"], OWNER, |store| store.clear(OWNER));
        assert!(matches!(outcome, Err(Error::LockOrder { .. })));
        assert!((0..store.table_size()).all(|b| store.locks().holder(b).is_none()));

        // Holding the whole table first makes the nested calls reentrant.
        let held = store.lock_all(OWNER).unwrap();
        assert_eq!(store.compute(&deep, OWNER).unwrap(), 4);
        assert_eq!(store.len(OWNER).unwrap(), 2);
        held.release().unwrap();
        assert!((0..store.table_size()).all(|b| store.locks().holder(b).is_none()));
    }

    #[test]
    fn dump_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = open(&dir.path().join("one"));
        source.insert_integer("n", -1, OWNER).unwrap();
        source.insert_reference("r", "n", OWNER).unwrap();
        let snapshot = dir.path().join("snapshot");
        assert_eq!(source.dump(&snapshot, OWNER).unwrap(), 2);

        let target = open(&dir.path().join("two"));
        assert_eq!(target.load(&snapshot, OWNER).unwrap(), 2);
        let mut expected = source.entries(OWNER).unwrap();
        let mut actual = target.entries(OWNER).unwrap();
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        actual.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(expected, actual);
    }
}
