//! SQLite-backed storage
//!
//! One database file; each table is a two-column relation
//! `(id INTEGER PRIMARY KEY, data JSON NOT NULL)` created on demand.
//! Field-equality predicates translate to `json_extract` expressions in the
//! generated WHERE clause; updates merge with `json_patch` and unsets use
//! `json_remove`, so a field change never round-trips the whole document.
//! Transactions use the native `BEGIN EXCLUSIVE` / `COMMIT` / `ROLLBACK`
//! primitives - no snapshot copy needed.

use crate::record::Record;
use crate::storage::{Key, Matcher, StorageBackend, TxDepth};
use crate::value::{Eid, EidKind, Value};
use crate::{Error, Result};
use rusqlite::{Connection, params};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Embedded-SQL storage over a single database file
pub struct SqliteStorage {
    conn: Connection,
    label: String,
    tx: TxDepth,
    /// Tables already ensured this session
    ensured: RefCell<BTreeSet<String>>,
}

impl SqliteStorage {
    /// Open a database file (creates if it doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn,
            label: path.display().to_string(),
            tx: TxDepth::default(),
            ensured: RefCell::new(BTreeSet::new()),
        };
        storage.initialize()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn,
            label: ":memory:".to_string(),
            tx: TxDepth::default(),
            ensured: RefCell::new(BTreeSet::new()),
        };
        storage.initialize()?;
        Ok(storage)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS _meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(())
    }

    /// Record tables are created on first touch
    fn ensure_table(&self, table: &str) -> Result<()> {
        check_ident(table)?;
        if self.ensured.borrow().contains(table) {
            return Ok(());
        }
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (id INTEGER PRIMARY KEY, data JSON NOT NULL)",
                table
            ),
            [],
        )?;
        self.ensured.borrow_mut().insert(table.to_string());
        Ok(())
    }

    /// Translate a key into a WHERE clause over `json_extract` expressions.
    /// Returns `None` when the key needs in-memory evaluation (sequence
    /// keys, non-scalar condition values, foreign-tier eids).
    fn where_clause(key: &Key) -> Result<Option<(String, Vec<rusqlite::types::Value>)>> {
        match key {
            Key::Eid(Eid::Num(id)) => Ok(Some((
                "id = ?1".to_string(),
                vec![rusqlite::types::Value::Integer(*id)],
            ))),
            Key::Eid(Eid::Text(_)) => Ok(None),
            Key::Where {
                conditions,
                match_any,
            } => {
                let mut terms = Vec::new();
                let mut params = Vec::new();
                for (field, value) in conditions {
                    check_ident(field)?;
                    let param = match value {
                        Value::Int(n) => rusqlite::types::Value::Integer(*n),
                        Value::Str(s) => rusqlite::types::Value::Text(s.clone()),
                        // json_extract yields 1/0 for JSON booleans
                        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
                        Value::List(_) | Value::Map(_) => return Ok(None),
                    };
                    terms.push(format!(
                        "json_extract(data, '$.{}') = ?{}",
                        field,
                        params.len() + 1
                    ));
                    params.push(param);
                }
                if terms.is_empty() {
                    // AND of nothing matches everything, OR of nothing matches nothing
                    let clause = if *match_any { "0" } else { "1" };
                    return Ok(Some((clause.to_string(), Vec::new())));
                }
                let joiner = if *match_any { " OR " } else { " AND " };
                Ok(Some((terms.join(joiner), params)))
            }
            Key::Any(_) => Ok(None),
        }
    }

    fn select(
        &self,
        table: &str,
        clause: Option<(String, Vec<rusqlite::types::Value>)>,
    ) -> Result<Vec<Record>> {
        let sql = match &clause {
            Some((text, _)) => format!(
                "SELECT id, data FROM \"{}\" WHERE {} ORDER BY id",
                table, text
            ),
            None => format!("SELECT id, data FROM \"{}\" ORDER BY id", table),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let params = clause.map(|(_, p)| p).unwrap_or_default();
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            let id: i64 = row.get(0)?;
            let data: String = row.get(1)?;
            Ok((id, data))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, data) = row?;
            records.push(decode_record(&self.label, table, id, &data)?);
        }
        Ok(records)
    }

    /// Matching row ids, resolving in-memory when the key cannot be
    /// expressed as a clause
    fn resolve_ids(&self, table: &str, key: &Key) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = Vec::new();
        for record in self.search(table, Some(key))? {
            if let Some(Eid::Num(id)) = record.eid() {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
        }
        Ok(ids)
    }

    fn id_list(ids: &[i64]) -> String {
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn decode_record(label: &str, table: &str, id: i64, data: &str) -> Result<Record> {
    let fields: BTreeMap<String, Value> = serde_json::from_str(data).map_err(|e| {
        Error::Storage(format!(
            "{}: malformed document {}/{}: {}",
            label, table, id, e
        ))
    })?;
    Ok(Record::with_eid(Eid::Num(id), fields))
}

/// Table and field names are interpolated into SQL and JSON paths; only
/// plain identifiers are usable.
fn check_ident(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::Storage(format!("unusable identifier '{}'", name)))
    }
}

impl StorageBackend for SqliteStorage {
    fn name(&self) -> &str {
        &self.label
    }

    fn eid_kind(&self) -> EidKind {
        EidKind::Numeric
    }

    fn count(&self, table: &str) -> Result<usize> {
        self.ensure_table(table)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get(&self, table: &str, key: &Key) -> Result<Option<Record>> {
        Ok(self.search(table, Some(key))?.into_iter().next())
    }

    fn search(&self, table: &str, key: Option<&Key>) -> Result<Vec<Record>> {
        self.ensure_table(table)?;
        match key {
            None => self.select(table, None),
            Some(Key::Any(keys)) => {
                // Element-wise, concatenated, deduplicated by id
                let mut seen = BTreeSet::new();
                let mut records = Vec::new();
                for sub in keys {
                    for record in self.search(table, Some(sub))? {
                        if let Some(eid) = record.eid() {
                            if seen.insert(eid.clone()) {
                                records.push(record);
                            }
                        }
                    }
                }
                Ok(records)
            }
            Some(key) => match Self::where_clause(key)? {
                Some(clause) => self.select(table, Some(clause)),
                None => {
                    let all = self.select(table, None)?;
                    Ok(all
                        .into_iter()
                        .filter(|r| {
                            r.eid().is_some_and(|eid| key.matches(eid, r.fields()))
                        })
                        .collect())
                }
            },
        }
    }

    fn match_field(&self, table: &str, field: &str, matcher: &Matcher) -> Result<Vec<Record>> {
        self.ensure_table(table)?;
        // Regex/predicate evaluation happens client-side over a full fetch
        let all = self.select(table, None)?;
        Ok(all
            .into_iter()
            .filter(|r| r.get(field).is_some_and(|v| matcher.matches(v)))
            .collect())
    }

    fn insert(&self, table: &str, fields: BTreeMap<String, Value>) -> Result<Record> {
        self.ensure_table(table)?;
        let data = serde_json::to_string(&fields)?;
        self.conn.execute(
            &format!("INSERT INTO \"{}\" (data) VALUES (json(?1))", table),
            params![data],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!("{}: inserted {}/{}", self.label, table, id);
        Ok(Record::with_eid(Eid::Num(id), fields))
    }

    fn update(&self, table: &str, fields: &BTreeMap<String, Value>, key: &Key) -> Result<usize> {
        self.ensure_table(table)?;
        let ids = self.resolve_ids(table, key)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let patch = serde_json::to_string(fields)?;
        let touched = self.conn.execute(
            &format!(
                "UPDATE \"{}\" SET data = json_patch(data, json(?1)) WHERE id IN ({})",
                table,
                Self::id_list(&ids)
            ),
            params![patch],
        )?;
        Ok(touched)
    }

    fn unset(&self, table: &str, fields: &[&str], key: &Key) -> Result<usize> {
        self.ensure_table(table)?;
        let ids = self.resolve_ids(table, key)?;
        if ids.is_empty() || fields.is_empty() {
            return Ok(0);
        }
        let mut paths = Vec::new();
        for field in fields {
            check_ident(field)?;
            paths.push(format!("'$.{}'", field));
        }
        let touched = self.conn.execute(
            &format!(
                "UPDATE \"{}\" SET data = json_remove(data, {}) WHERE id IN ({})",
                table,
                paths.join(", "),
                Self::id_list(&ids)
            ),
            [],
        )?;
        Ok(touched)
    }

    fn remove(&self, table: &str, key: &Key) -> Result<usize> {
        self.ensure_table(table)?;
        let ids = self.resolve_ids(table, key)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.conn.execute(
            &format!(
                "DELETE FROM \"{}\" WHERE id IN ({})",
                table,
                Self::id_list(&ids)
            ),
            [],
        )?;
        Ok(removed)
    }

    fn purge(&self, table: &str) -> Result<()> {
        self.ensure_table(table)?;
        self.conn
            .execute(&format!("DELETE FROM \"{}\"", table), [])?;
        Ok(())
    }

    fn meta_get(&self, key: &str) -> Result<Option<Value>> {
        use rusqlite::OptionalExtension;
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM _meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn meta_set(&self, key: &str, value: Value) -> Result<()> {
        let text = serde_json::to_string(&value)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO _meta (key, value) VALUES (?1, ?2)",
            params![key, text],
        )?;
        Ok(())
    }

    fn meta_unset(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM _meta WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        if self.tx.enter() {
            self.conn.execute_batch("BEGIN EXCLUSIVE")?;
            tracing::debug!("{}: transaction begin", self.label);
        }
        Ok(())
    }

    fn end(&self, commit: bool) -> Result<()> {
        match self.tx.leave(commit)? {
            Some(true) => {
                self.conn.execute_batch("COMMIT")?;
                tracing::debug!("{}: transaction commit", self.label);
                Ok(())
            }
            Some(false) => {
                self.conn.execute_batch("ROLLBACK")?;
                tracing::debug!("{}: transaction rollback", self.label);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::transact;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_insert_and_get() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        let rec = storage
            .insert("target", fields(&[("name", Value::from("alpha"))]))
            .unwrap();
        assert_eq!(rec.eid(), Some(&Eid::Num(1)));

        let found = storage.get("target", &Key::eid(1)).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&Value::from("alpha")));
        assert_eq!(storage.count("target").unwrap(), 1);
    }

    #[test]
    fn test_json_clause_search() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .insert(
                "target",
                fields(&[
                    ("name", Value::from("alpha")),
                    ("jobs", Value::Int(4)),
                    ("managed", Value::Bool(true)),
                ]),
            )
            .unwrap();
        storage
            .insert(
                "target",
                fields(&[
                    ("name", Value::from("beta")),
                    ("jobs", Value::Int(8)),
                    ("managed", Value::Bool(false)),
                ]),
            )
            .unwrap();

        let hits = storage
            .search("target", Some(&Key::eq("jobs", Value::Int(8))))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("name"), Some(&Value::from("beta")));

        let hits = storage
            .search("target", Some(&Key::eq("managed", Value::Bool(true))))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("name"), Some(&Value::from("alpha")));

        let any = storage
            .search(
                "target",
                Some(&Key::where_any(vec![
                    ("name".to_string(), Value::from("alpha")),
                    ("jobs".to_string(), Value::Int(8)),
                ])),
            )
            .unwrap();
        assert_eq!(any.len(), 2);
    }

    #[test]
    fn test_list_condition_falls_back_to_scan() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let flags = Value::List(vec![Value::from("-O2"), Value::from("-g")]);
        storage
            .insert(
                "measurement",
                fields(&[("name", Value::from("m1")), ("flags", flags.clone())]),
            )
            .unwrap();
        storage
            .insert("measurement", fields(&[("name", Value::from("m2"))]))
            .unwrap();

        let hits = storage
            .search("measurement", Some(&Key::eq("flags", flags)))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("name"), Some(&Value::from("m1")));
    }

    #[test]
    fn test_update_patches_in_place() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .insert(
                "t",
                fields(&[("name", Value::from("alpha")), ("jobs", Value::Int(4))]),
            )
            .unwrap();

        let touched = storage
            .update("t", &fields(&[("jobs", Value::Int(8))]), &Key::eid(1))
            .unwrap();
        assert_eq!(touched, 1);

        let rec = storage.get("t", &Key::eid(1)).unwrap().unwrap();
        assert_eq!(rec.get("jobs"), Some(&Value::Int(8)));
        assert_eq!(rec.get("name"), Some(&Value::from("alpha")));
    }

    #[test]
    fn test_unset_removes_fields() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .insert(
                "t",
                fields(&[
                    ("name", Value::from("alpha")),
                    ("jobs", Value::Int(4)),
                    ("arch", Value::from("x86_64")),
                ]),
            )
            .unwrap();

        storage.unset("t", &["jobs", "arch"], &Key::eid(1)).unwrap();
        let rec = storage.get("t", &Key::eid(1)).unwrap().unwrap();
        assert_eq!(rec.get("jobs"), None);
        assert_eq!(rec.get("arch"), None);
        assert_eq!(rec.get("name"), Some(&Value::from("alpha")));
    }

    #[test]
    fn test_remove_and_purge() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.insert("t", fields(&[("n", Value::Int(1))])).unwrap();
        storage.insert("t", fields(&[("n", Value::Int(2))])).unwrap();

        assert_eq!(storage.remove("t", &Key::eid(1)).unwrap(), 1);
        assert_eq!(storage.count("t").unwrap(), 1);

        storage.purge("t").unwrap();
        assert_eq!(storage.count("t").unwrap(), 0);
    }

    #[test]
    fn test_match_field() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .insert("t", fields(&[("compiler", Value::from("gcc-13"))]))
            .unwrap();
        storage
            .insert("t", fields(&[("compiler", Value::from("clang-17"))]))
            .unwrap();

        let hits = storage
            .match_field("t", "compiler", &Matcher::regex("^gcc").unwrap())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("compiler"), Some(&Value::from("gcc-13")));
    }

    #[test]
    fn test_transaction_rollback() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.insert("t", fields(&[("n", Value::Int(1))])).unwrap();

        let result: Result<()> = transact(&storage, || {
            storage.insert("t", fields(&[("n", Value::Int(2))]))?;
            storage.update("t", &fields(&[("n", Value::Int(99))]), &Key::eid(1))?;
            Err(Error::Validation("boom".to_string()))
        });
        assert!(result.is_err());

        assert_eq!(storage.count("t").unwrap(), 1);
        let rec = storage.get("t", &Key::eid(1)).unwrap().unwrap();
        assert_eq!(rec.get("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_nested_transaction_commit() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        transact(&storage, || {
            storage.insert("t", fields(&[("n", Value::Int(1))]))?;
            transact(&storage, || {
                storage.insert("t", fields(&[("n", Value::Int(2))]))?;
                Ok(())
            })
        })
        .unwrap();

        assert_eq!(storage.count("t").unwrap(), 2);
    }

    #[test]
    fn test_meta_roundtrip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .meta_set("schema_version", Value::Int(3))
            .unwrap();
        assert_eq!(
            storage.meta_get("schema_version").unwrap(),
            Some(Value::Int(3))
        );
        storage.meta_unset("schema_version").unwrap();
        assert_eq!(storage.meta_get("schema_version").unwrap(), None);
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let err = storage
            .insert("bad; DROP TABLE", fields(&[("n", Value::Int(1))]))
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_persistence_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .insert("target", fields(&[("name", Value::from("alpha"))]))
                .unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.count("target").unwrap(), 1);
    }
}
