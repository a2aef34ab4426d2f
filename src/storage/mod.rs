//! Storage Layer - pluggable persistence backends
//!
//! One common contract over three tiers:
//! - `LocalFileStorage`: one JSON document file, whole-file snapshot
//!   transactions
//! - `SqliteStorage`: one SQLite file, `(id, data JSON)` tables, native
//!   exclusive transactions
//! - `RemoteStorage`: synchronous REST client, best-effort marker
//!   transactions
//!
//! Backends differ in durability and query mechanics, never in contract.
//! Transactions are reentrant via a counter but provide no cross-process
//! isolation: two processes over the same local file can race. That gap is
//! deliberate and documented, not a guarantee.

pub mod local;
pub mod remote;
pub mod sqlite;

pub use local::LocalFileStorage;
pub use remote::RemoteStorage;
pub use sqlite::SqliteStorage;

use crate::record::Record;
use crate::value::{Eid, EidKind, Value};
use crate::{Error, Result};
use std::cell::Cell;
use std::collections::BTreeMap;

/// A query key.
///
/// Absent (`None` at the call site) means all records; otherwise a single
/// eid, a field-equality mapping (AND of all pairs, OR when `match_any`),
/// or a sequence of keys applied element-wise and concatenated.
#[derive(Debug, Clone)]
pub enum Key {
    Eid(Eid),
    Where {
        conditions: BTreeMap<String, Value>,
        match_any: bool,
    },
    Any(Vec<Key>),
}

impl Key {
    pub fn eid(eid: impl Into<Eid>) -> Self {
        Key::Eid(eid.into())
    }

    /// Single field-equality condition
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        let mut conditions = BTreeMap::new();
        conditions.insert(field.to_string(), value.into());
        Key::Where {
            conditions,
            match_any: false,
        }
    }

    /// Conjunction of field-equality conditions
    pub fn where_all(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Key::Where {
            conditions: pairs.into_iter().collect(),
            match_any: false,
        }
    }

    /// Disjunction of field-equality conditions
    pub fn where_any(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Key::Where {
            conditions: pairs.into_iter().collect(),
            match_any: true,
        }
    }

    /// In-memory evaluation against one record, used by the document
    /// backend and by client-side filtering paths.
    pub fn matches(&self, eid: &Eid, fields: &BTreeMap<String, Value>) -> bool {
        match self {
            Key::Eid(expected) => expected == eid,
            Key::Where {
                conditions,
                match_any,
            } => {
                let hit = |(name, value): (&String, &Value)| fields.get(name) == Some(value);
                if *match_any {
                    conditions.iter().any(hit)
                } else {
                    conditions.iter().all(hit)
                }
            }
            Key::Any(keys) => keys.iter().any(|k| k.matches(eid, fields)),
        }
    }
}

/// Field-level matcher for `match_field`: a regular expression over string
/// values, or an arbitrary boolean test. Mutually exclusive by construction.
pub enum Matcher {
    Regex(regex::Regex),
    Predicate(fn(&Value) -> bool),
}

impl Matcher {
    pub fn regex(pattern: &str) -> Result<Self> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| Error::Validation(format!("bad match pattern '{}': {}", pattern, e)))?;
        Ok(Matcher::Regex(re))
    }

    pub fn predicate(test: fn(&Value) -> bool) -> Self {
        Matcher::Predicate(test)
    }

    /// A regex matches only string values; a predicate sees the raw value.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Matcher::Regex(re) => value.as_str().is_some_and(|s| re.is_match(s)),
            Matcher::Predicate(test) => test(value),
        }
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Matcher::Regex(re) => write!(f, "Regex({})", re.as_str()),
            Matcher::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

/// The common storage contract.
///
/// Every operation names its table explicitly; the controller supplies its
/// model's table. Exactly one backend instance exists per physical store
/// per process, opened lazily and closed by dropping it.
pub trait StorageBackend {
    /// Human-readable identity for diagnostics
    fn name(&self) -> &str;

    /// The identifier kind this backend assigns
    fn eid_kind(&self) -> EidKind;

    fn count(&self, table: &str) -> Result<usize>;

    /// First record matching `key`, if any
    fn get(&self, table: &str, key: &Key) -> Result<Option<Record>>;

    /// All records matching `key`; `None` means the whole table
    fn search(&self, table: &str, key: Option<&Key>) -> Result<Vec<Record>>;

    /// Records whose `field` satisfies the matcher
    fn match_field(&self, table: &str, field: &str, matcher: &Matcher) -> Result<Vec<Record>>;

    fn contains(&self, table: &str, key: &Key) -> Result<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    /// Insert and return the stored record with its assigned eid
    fn insert(&self, table: &str, fields: BTreeMap<String, Value>) -> Result<Record>;

    /// Merge `fields` into every record matching `key`; returns the number
    /// of records touched
    fn update(&self, table: &str, fields: &BTreeMap<String, Value>, key: &Key) -> Result<usize>;

    /// Remove the named fields from every record matching `key`
    fn unset(&self, table: &str, fields: &[&str], key: &Key) -> Result<usize>;

    /// Delete every record matching `key`
    fn remove(&self, table: &str, key: &Key) -> Result<usize>;

    /// Delete all records in the table
    fn purge(&self, table: &str) -> Result<()>;

    /// Untyped top-level key/value data kept next to the tables
    fn meta_get(&self, key: &str) -> Result<Option<Value>>;
    fn meta_set(&self, key: &str, value: Value) -> Result<()>;
    fn meta_unset(&self, key: &str) -> Result<()>;

    /// Enter a transaction scope; nested calls only increment a counter
    fn begin(&self) -> Result<()>;

    /// Leave a transaction scope. The outermost `end` commits when every
    /// scope passed `commit = true`, otherwise reverts.
    fn end(&self, commit: bool) -> Result<()>;
}

/// Run `f` inside a transaction scope on `storage`: commit on `Ok`, revert
/// on `Err`. Scopes nest; only the outermost one commits or reverts.
pub fn transact<T, F>(storage: &dyn StorageBackend, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    storage.begin()?;
    match f() {
        Ok(value) => {
            storage.end(true)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(end_err) = storage.end(false) {
                tracing::warn!("rollback after '{}' failed: {}", err, end_err);
            }
            Err(err)
        }
    }
}

/// Reentrant transaction counter shared by the backend implementations.
/// Process-local; single-threaded by design.
#[derive(Debug, Default)]
pub(crate) struct TxDepth {
    depth: Cell<u32>,
    poisoned: Cell<bool>,
}

impl TxDepth {
    /// Returns true when this enter opened the outermost scope
    pub fn enter(&self) -> bool {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        depth == 0
    }

    /// Returns `Some(commit_all)` when this leave closed the outermost
    /// scope; the flag is false if any scope asked for a revert.
    pub fn leave(&self, commit: bool) -> Result<Option<bool>> {
        let depth = self.depth.get();
        if depth == 0 {
            return Err(Error::Storage(
                "transaction end without matching begin".to_string(),
            ));
        }
        if !commit {
            self.poisoned.set(true);
        }
        self.depth.set(depth - 1);
        if depth == 1 {
            let poisoned = self.poisoned.replace(false);
            Ok(Some(!poisoned))
        } else {
            Ok(None)
        }
    }

    pub fn active(&self) -> bool {
        self.depth.get() > 0
    }
}
