//! Local document-file backend
//!
//! One UTF-8 JSON file holds the whole table-set: top-level keys are table
//! names, each table maps decimal-string eids to field mappings, and a
//! reserved `_meta` table holds top-level key/value data. Queries are
//! evaluated in memory; the working set is small enough that the whole file
//! is the unit of durability.
//!
//! Transactions snapshot the entire decoded state at the outermost begin
//! and restore it on revert. Disk is only touched at commit time while a
//! transaction is open, so a revert never needs to rewrite the file.

use crate::record::Record;
use crate::storage::{Key, Matcher, StorageBackend, TxDepth};
use crate::value::{Eid, EidKind, Value};
use crate::{Error, Result};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Reserved top-level table holding untyped key/value pairs
const META_TABLE: &str = "_meta";

type Fields = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct FileState {
    tables: BTreeMap<String, BTreeMap<i64, Fields>>,
    meta: BTreeMap<String, Value>,
}

/// JSON document file storage.
///
/// Opens read-only when the underlying file is not writable: reads keep
/// working, writes fail with `Error::ReadOnly`.
pub struct LocalFileStorage {
    path: PathBuf,
    label: String,
    read_only: bool,
    state: RefCell<FileState>,
    snapshot: RefCell<Option<FileState>>,
    tx: TxDepth,
    dirty: Cell<bool>,
}

impl LocalFileStorage {
    /// Open the document file, creating it (and parent directories) when
    /// missing. Falls back to read-only mode if the file cannot be written.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = Self::load(&path)?;
        let read_only = !probe_writable(&path);
        if read_only {
            tracing::warn!("{} is not writable, opening read-only", path.display());
        }
        Ok(Self {
            label: path.display().to_string(),
            path,
            read_only,
            state: RefCell::new(state),
            snapshot: RefCell::new(None),
            tx: TxDepth::default(),
            dirty: Cell::new(false),
        })
    }

    /// Open without ever writing, regardless of file permissions
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = Self::load(&path)?;
        Ok(Self {
            label: path.display().to_string(),
            path,
            read_only: true,
            state: RefCell::new(state),
            snapshot: RefCell::new(None),
            tx: TxDepth::default(),
            dirty: Cell::new(false),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<FileState> {
        if !path.exists() {
            return Ok(FileState::default());
        }
        let text = fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(FileState::default());
        }
        let raw: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_str(&text)?;

        let mut state = FileState::default();
        for (table, entries) in raw {
            if table == META_TABLE {
                state.meta = entries;
                continue;
            }
            let mut decoded = BTreeMap::new();
            for (id, value) in entries {
                let eid: i64 = id.parse().map_err(|_| {
                    Error::Storage(format!(
                        "{}: table '{}' has non-numeric record id '{}'",
                        path.display(),
                        table,
                        id
                    ))
                })?;
                let Value::Map(fields) = value else {
                    return Err(Error::Storage(format!(
                        "{}: record {}/{} is not a field mapping",
                        path.display(),
                        table,
                        eid
                    )));
                };
                decoded.insert(eid, fields);
            }
            state.tables.insert(table, decoded);
        }
        Ok(state)
    }

    /// Rewrite the whole file from the in-memory state
    fn flush(&self) -> Result<()> {
        let state = self.state.borrow();
        let mut raw: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for (table, entries) in &state.tables {
            let encoded = entries
                .iter()
                .map(|(id, fields)| (id.to_string(), Value::Map(fields.clone())))
                .collect();
            raw.insert(table.clone(), encoded);
        }
        if !state.meta.is_empty() {
            raw.insert(META_TABLE.to_string(), state.meta.clone());
        }
        let text = serde_json::to_string_pretty(&raw)?;
        fs::write(&self.path, text)?;
        self.dirty.set(false);
        Ok(())
    }

    fn write_guard(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(self.label.clone()));
        }
        Ok(())
    }

    /// Persist after a mutation: immediately outside a transaction,
    /// deferred to commit inside one.
    fn persist(&self) -> Result<()> {
        if self.tx.active() {
            self.dirty.set(true);
            Ok(())
        } else {
            self.flush()
        }
    }

    /// Matching eids in ascending id order
    fn matching_ids(&self, table: &str, key: Option<&Key>) -> Vec<i64> {
        let state = self.state.borrow();
        let Some(entries) = state.tables.get(table) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|(id, fields)| {
                key.is_none_or(|k| k.matches(&Eid::Num(**id), fields))
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Whether the file (or its would-be location) accepts writes. A missing
/// file is materialized as an empty document so permission problems show
/// up at open, not at first commit.
fn probe_writable(path: &Path) -> bool {
    if path.exists() {
        fs::OpenOptions::new().append(true).open(path).is_ok()
    } else {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        fs::write(path, "{}").is_ok()
    }
}

impl StorageBackend for LocalFileStorage {
    fn name(&self) -> &str {
        &self.label
    }

    fn eid_kind(&self) -> EidKind {
        EidKind::Numeric
    }

    fn count(&self, table: &str) -> Result<usize> {
        Ok(self
            .state
            .borrow()
            .tables
            .get(table)
            .map_or(0, |t| t.len()))
    }

    fn get(&self, table: &str, key: &Key) -> Result<Option<Record>> {
        let ids = self.matching_ids(table, Some(key));
        let state = self.state.borrow();
        Ok(ids.first().map(|id| {
            let fields = state.tables[table][id].clone();
            Record::with_eid(Eid::Num(*id), fields)
        }))
    }

    fn search(&self, table: &str, key: Option<&Key>) -> Result<Vec<Record>> {
        let ids = self.matching_ids(table, key);
        let state = self.state.borrow();
        Ok(ids
            .iter()
            .map(|id| Record::with_eid(Eid::Num(*id), state.tables[table][id].clone()))
            .collect())
    }

    fn match_field(&self, table: &str, field: &str, matcher: &Matcher) -> Result<Vec<Record>> {
        let state = self.state.borrow();
        let Some(entries) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter(|(_, fields)| fields.get(field).is_some_and(|v| matcher.matches(v)))
            .map(|(id, fields)| Record::with_eid(Eid::Num(*id), fields.clone()))
            .collect())
    }

    fn insert(&self, table: &str, fields: BTreeMap<String, Value>) -> Result<Record> {
        self.write_guard()?;
        let eid = {
            let mut state = self.state.borrow_mut();
            let entries = state.tables.entry(table.to_string()).or_default();
            let eid = entries.keys().next_back().map_or(1, |last| last + 1);
            entries.insert(eid, fields.clone());
            eid
        };
        self.persist()?;
        tracing::debug!("{}: inserted {}/{}", self.label, table, eid);
        Ok(Record::with_eid(Eid::Num(eid), fields))
    }

    fn update(&self, table: &str, fields: &BTreeMap<String, Value>, key: &Key) -> Result<usize> {
        self.write_guard()?;
        let ids = self.matching_ids(table, Some(key));
        {
            let mut state = self.state.borrow_mut();
            let Some(entries) = state.tables.get_mut(table) else {
                return Ok(0);
            };
            for id in &ids {
                if let Some(existing) = entries.get_mut(id) {
                    for (name, value) in fields {
                        existing.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        if !ids.is_empty() {
            self.persist()?;
        }
        Ok(ids.len())
    }

    fn unset(&self, table: &str, fields: &[&str], key: &Key) -> Result<usize> {
        self.write_guard()?;
        let ids = self.matching_ids(table, Some(key));
        {
            let mut state = self.state.borrow_mut();
            let Some(entries) = state.tables.get_mut(table) else {
                return Ok(0);
            };
            for id in &ids {
                if let Some(existing) = entries.get_mut(id) {
                    for name in fields {
                        existing.remove(*name);
                    }
                }
            }
        }
        if !ids.is_empty() {
            self.persist()?;
        }
        Ok(ids.len())
    }

    fn remove(&self, table: &str, key: &Key) -> Result<usize> {
        self.write_guard()?;
        let ids = self.matching_ids(table, Some(key));
        {
            let mut state = self.state.borrow_mut();
            if let Some(entries) = state.tables.get_mut(table) {
                for id in &ids {
                    entries.remove(id);
                }
            }
        }
        if !ids.is_empty() {
            self.persist()?;
        }
        Ok(ids.len())
    }

    fn purge(&self, table: &str) -> Result<()> {
        self.write_guard()?;
        self.state.borrow_mut().tables.remove(table);
        self.persist()
    }

    fn meta_get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.borrow().meta.get(key).cloned())
    }

    fn meta_set(&self, key: &str, value: Value) -> Result<()> {
        self.write_guard()?;
        self.state.borrow_mut().meta.insert(key.to_string(), value);
        self.persist()
    }

    fn meta_unset(&self, key: &str) -> Result<()> {
        self.write_guard()?;
        self.state.borrow_mut().meta.remove(key);
        self.persist()
    }

    fn begin(&self) -> Result<()> {
        if self.tx.enter() {
            *self.snapshot.borrow_mut() = Some(self.state.borrow().clone());
            tracing::debug!("{}: transaction begin", self.label);
        }
        Ok(())
    }

    fn end(&self, commit: bool) -> Result<()> {
        match self.tx.leave(commit)? {
            Some(true) => {
                self.snapshot.borrow_mut().take();
                if self.dirty.get() {
                    self.flush()?;
                }
                tracing::debug!("{}: transaction commit", self.label);
                Ok(())
            }
            Some(false) => {
                // Disk was never written inside the scope, so restoring
                // the in-memory snapshot is the whole rollback.
                if let Some(snapshot) = self.snapshot.borrow_mut().take() {
                    *self.state.borrow_mut() = snapshot;
                }
                self.dirty.set(false);
                tracing::debug!("{}: transaction rollback", self.label);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LocalFileStorage {
    fn drop(&mut self) {
        // Committed mutations are already on disk; dirty state here means
        // an open transaction never ended. The file keeps the last
        // committed state.
        if self.tx.active() || self.dirty.get() {
            tracing::warn!(
                "{}: closed with an open transaction, uncommitted changes discarded",
                self.label
            );
        }
    }
}

impl std::fmt::Debug for LocalFileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileStorage")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish()
    }
}
