//! Remote REST storage
//!
//! Every operation is a synchronous HTTP request against a per-table
//! resource path. Equality keys become a JSON `where` query parameter;
//! `match_any` becomes a logical `$or` query object. Record identifiers are
//! server-assigned opaque strings, never integers.
//!
//! Transactions here are a best-effort convenience, not a guarantee:
//! `begin` creates a server-side marker record, inserts made inside the
//! scope are tagged with the marker, and a revert deletes everything tagged
//! under it. A crash between steps leaves partial state, and updates made
//! inside the scope are not reverted at all. Callers needing real
//! atomicity must stay on a local tier.

use crate::record::Record;
use crate::storage::{Key, Matcher, StorageBackend, TxDepth};
use crate::value::{Eid, EidKind, Value};
use crate::{Error, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

/// Header naming the logical database on the server
pub const DATABASE_HEADER: &str = "X-Strata-Database";
/// Header carrying the bearer credential
pub const TOKEN_HEADER: &str = "X-Strata-Token";

/// Server-assigned identifier key on wire records
const ID_FIELD: &str = "_id";
/// Transaction marker tag on records inserted inside a scope
const TXN_FIELD: &str = "_txn";
/// Resource holding transaction marker records
const TXN_TABLE: &str = "_transaction";
/// Resource holding untyped key/value pairs
const META_TABLE: &str = "_meta";

#[derive(Default)]
struct TxState {
    marker: Option<String>,
    /// (table, id) pairs inserted under the current marker
    writes: Vec<(String, String)>,
}

/// REST-backed storage tier
pub struct RemoteStorage {
    client: Client,
    base: String,
    database: String,
    token: Option<String>,
    label: String,
    /// Ask the server to create backlinks on insert (`propagate=true`)
    propagate: bool,
    depth: TxDepth,
    tx: RefCell<TxState>,
}

impl RemoteStorage {
    /// Bind to a remote endpoint. No request is made until first use.
    pub fn connect(url: &str, database: &str, token: Option<String>) -> Result<Self> {
        let base = url.trim_end_matches('/').to_string();
        let client = Client::builder().build()?;
        Ok(Self {
            label: format!("{}/{}", base, database),
            client,
            base,
            database: database.to_string(),
            token,
            propagate: false,
            depth: TxDepth::default(),
            tx: RefCell::new(TxState::default()),
        })
    }

    /// Request server-side backlink creation on every insert
    pub fn with_propagate(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/", self.base, table)
    }

    fn record_url(&self, table: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base, table, id)
    }

    fn headers(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header(DATABASE_HEADER, &self.database);
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    /// GET a record collection, optionally filtered
    fn fetch(&self, table: &str, filter: Option<&serde_json::Value>) -> Result<Vec<Record>> {
        let mut req = self.headers(self.client.get(self.table_url(table)));
        if let Some(filter) = filter {
            req = req.query(&[("where", filter.to_string())]);
        }
        let resp = req.send()?;
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "{}: search on '{}' failed with {}",
                self.label,
                table,
                resp.status()
            )));
        }
        let items: Vec<serde_json::Map<String, serde_json::Value>> = resp.json()?;
        items
            .into_iter()
            .map(|item| decode_wire(&self.label, table, item))
            .collect()
    }

    /// GET a single record; 404 is a valid "not found", not an error
    fn fetch_one(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let resp = self
            .headers(self.client.get(self.record_url(table, id)))
            .send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "{}: lookup of {}/{} failed with {}",
                self.label,
                table,
                id,
                resp.status()
            )));
        }
        let item: serde_json::Map<String, serde_json::Value> = resp.json()?;
        Ok(Some(decode_wire(&self.label, table, item)?))
    }

    fn patch(&self, table: &str, id: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self
            .headers(self.client.patch(self.record_url(table, id)))
            .json(body)
            .send()?;
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "{}: patch of {}/{} failed with {}",
                self.label,
                table,
                id,
                resp.status()
            )));
        }
        Ok(())
    }

    fn delete_where(&self, table: &str, filter: &serde_json::Value) -> Result<()> {
        let resp = self
            .headers(self.client.delete(self.table_url(table)))
            .query(&[("where", filter.to_string())])
            .send()?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Error::Storage(format!(
                "{}: filtered delete on '{}' failed with {}",
                self.label,
                table,
                resp.status()
            )));
        }
        Ok(())
    }

    fn delete_one(&self, table: &str, id: &str) -> Result<()> {
        let resp = self
            .headers(self.client.delete(self.record_url(table, id)))
            .send()?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Error::Storage(format!(
                "{}: delete of {}/{} failed with {}",
                self.label,
                table,
                id,
                resp.status()
            )));
        }
        Ok(())
    }

    fn require_text(&self, eid: &Eid) -> Result<String> {
        match eid {
            Eid::Text(id) => Ok(id.clone()),
            Eid::Num(id) => Err(Error::Storage(format!(
                "{}: integer eid '{}' does not belong to this tier",
                self.label, id
            ))),
        }
    }
}

/// Build the `where` query object for a key; `None` for keys that resolve
/// through other paths (point lookups, sequences).
fn where_query(key: &Key) -> Option<serde_json::Value> {
    match key {
        Key::Eid(_) | Key::Any(_) => None,
        Key::Where {
            conditions,
            match_any,
        } => {
            let object = |pairs: &BTreeMap<String, Value>| {
                serde_json::Value::Object(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.clone(), serde_json::json!(v)))
                        .collect(),
                )
            };
            if *match_any {
                let branches: Vec<serde_json::Value> = conditions
                    .iter()
                    .map(|(k, v)| serde_json::json!({ k.clone(): v }))
                    .collect();
                Some(serde_json::json!({ "$or": branches }))
            } else {
                Some(object(conditions))
            }
        }
    }
}

/// Split a wire object into eid and fields
fn decode_wire(
    label: &str,
    table: &str,
    mut item: serde_json::Map<String, serde_json::Value>,
) -> Result<Record> {
    let id = match item.remove(ID_FIELD) {
        Some(serde_json::Value::String(id)) => id,
        _ => {
            return Err(Error::Storage(format!(
                "{}: record in '{}' lacks a server id",
                label, table
            )));
        }
    };
    let fields: BTreeMap<String, Value> =
        serde_json::from_value(serde_json::Value::Object(item)).map_err(|e| {
            Error::Storage(format!("{}: malformed document {}/{}: {}", label, table, id, e))
        })?;
    Ok(Record::with_eid(Eid::Text(id), fields))
}

impl StorageBackend for RemoteStorage {
    fn name(&self) -> &str {
        &self.label
    }

    fn eid_kind(&self) -> EidKind {
        EidKind::Opaque
    }

    fn count(&self, table: &str) -> Result<usize> {
        Ok(self.fetch(table, None)?.len())
    }

    fn get(&self, table: &str, key: &Key) -> Result<Option<Record>> {
        match key {
            Key::Eid(eid) => self.fetch_one(table, &self.require_text(eid)?),
            _ => Ok(self.search(table, Some(key))?.into_iter().next()),
        }
    }

    fn search(&self, table: &str, key: Option<&Key>) -> Result<Vec<Record>> {
        match key {
            None => self.fetch(table, None),
            Some(Key::Eid(eid)) => Ok(self
                .fetch_one(table, &self.require_text(eid)?)?
                .into_iter()
                .collect()),
            Some(Key::Any(keys)) => {
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
            Some(key) => self.fetch(table, where_query(key).as_ref()),
        }
    }

    fn match_field(&self, table: &str, field: &str, matcher: &Matcher) -> Result<Vec<Record>> {
        // No server-side regex dependency; filter a full fetch client-side
        Ok(self
            .fetch(table, None)?
            .into_iter()
            .filter(|r| r.get(field).is_some_and(|v| matcher.matches(v)))
            .collect())
    }

    fn insert(&self, table: &str, fields: BTreeMap<String, Value>) -> Result<Record> {
        let mut body = serde_json::json!(fields);
        if let Some(marker) = &self.tx.borrow().marker {
            body[TXN_FIELD] = serde_json::json!(marker);
        }

        let mut req = self.headers(self.client.post(self.table_url(table)));
        if self.propagate {
            req = req.query(&[("propagate", "true")]);
        }
        let resp = req.json(&body).send()?;
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "{}: insert into '{}' failed with {}",
                self.label,
                table,
                resp.status()
            )));
        }
        let item: serde_json::Map<String, serde_json::Value> = resp.json()?;
        let record = decode_wire(&self.label, table, item)?;

        if let Some(Eid::Text(id)) = record.eid() {
            let mut tx = self.tx.borrow_mut();
            if tx.marker.is_some() {
                tx.writes.push((table.to_string(), id.clone()));
            }
            tracing::debug!("{}: inserted {}/{}", self.label, table, id);
        }
        Ok(record)
    }

    fn update(&self, table: &str, fields: &BTreeMap<String, Value>, key: &Key) -> Result<usize> {
        let body = serde_json::json!(fields);
        let hits = self.search(table, Some(key))?;
        for record in &hits {
            if let Some(eid) = record.eid() {
                self.patch(table, &self.require_text(eid)?, &body)?;
            }
        }
        Ok(hits.len())
    }

    fn unset(&self, table: &str, fields: &[&str], key: &Key) -> Result<usize> {
        // Partial update with nulls removes the keys server-side
        let mut body = serde_json::Map::new();
        for field in fields {
            body.insert(field.to_string(), serde_json::Value::Null);
        }
        let body = serde_json::Value::Object(body);

        let hits = self.search(table, Some(key))?;
        for record in &hits {
            if let Some(eid) = record.eid() {
                self.patch(table, &self.require_text(eid)?, &body)?;
            }
        }
        Ok(hits.len())
    }

    fn remove(&self, table: &str, key: &Key) -> Result<usize> {
        match key {
            Key::Eid(eid) => {
                let id = self.require_text(eid)?;
                let existed = self.fetch_one(table, &id)?.is_some();
                self.delete_one(table, &id)?;
                Ok(existed as usize)
            }
            Key::Where { .. } => {
                let hits = self.search(table, Some(key))?;
                if !hits.is_empty() {
                    if let Some(filter) = where_query(key) {
                        self.delete_where(table, &filter)?;
                    }
                }
                Ok(hits.len())
            }
            Key::Any(keys) => {
                let mut removed = 0;
                for sub in keys {
                    removed += self.remove(table, sub)?;
                }
                Ok(removed)
            }
        }
    }

    fn purge(&self, table: &str) -> Result<()> {
        let resp = self
            .headers(self.client.delete(self.table_url(table)))
            .send()?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Error::Storage(format!(
                "{}: purge of '{}' failed with {}",
                self.label,
                table,
                resp.status()
            )));
        }
        Ok(())
    }

    fn meta_get(&self, key: &str) -> Result<Option<Value>> {
        let filter = serde_json::json!({ "key": key });
        let hits = self.fetch(META_TABLE, Some(&filter))?;
        Ok(hits.into_iter().next().and_then(|r| r.get("value").cloned()))
    }

    fn meta_set(&self, key: &str, value: Value) -> Result<()> {
        let filter = serde_json::json!({ "key": key });
        let existing = self.fetch(META_TABLE, Some(&filter))?;
        match existing.first().and_then(|r| r.eid()) {
            Some(eid) => {
                let body = serde_json::json!({ "value": value });
                self.patch(META_TABLE, &self.require_text(eid)?, &body)
            }
            None => {
                let mut fields = BTreeMap::new();
                fields.insert("key".to_string(), Value::from(key));
                fields.insert("value".to_string(), value);
                self.insert(META_TABLE, fields).map(|_| ())
            }
        }
    }

    fn meta_unset(&self, key: &str) -> Result<()> {
        self.delete_where(META_TABLE, &serde_json::json!({ "key": key }))
    }

    fn begin(&self) -> Result<()> {
        if self.depth.enter() {
            let marker = self.insert(TXN_TABLE, BTreeMap::new())?;
            let id = match marker.eid() {
                Some(Eid::Text(id)) => id.clone(),
                _ => {
                    return Err(Error::Storage(format!(
                        "{}: transaction marker has no server id",
                        self.label
                    )));
                }
            };
            tracing::debug!("{}: transaction marker {}", self.label, id);
            let mut tx = self.tx.borrow_mut();
            tx.marker = Some(id);
            tx.writes.clear();
        }
        Ok(())
    }

    fn end(&self, commit: bool) -> Result<()> {
        let Some(outcome) = self.depth.leave(commit)? else {
            return Ok(());
        };
        let (marker, writes) = {
            let mut tx = self.tx.borrow_mut();
            (tx.marker.take(), std::mem::take(&mut tx.writes))
        };
        let Some(marker) = marker else {
            return Ok(());
        };

        if outcome {
            // Scrub the marker tags; data stays either way
            let clear = serde_json::json!({ TXN_FIELD: serde_json::Value::Null });
            for (table, id) in &writes {
                if let Err(e) = self.patch(table, id, &clear) {
                    tracing::warn!("{}: marker scrub on {}/{} failed: {}", self.label, table, id, e);
                }
            }
        } else {
            // Best-effort revert: sweep every touched table for records
            // tagged under the marker. Updates made in the scope stand.
            let tables: BTreeSet<&String> = writes.iter().map(|(t, _)| t).collect();
            for table in tables {
                let filter = serde_json::json!({ TXN_FIELD: marker });
                if let Err(e) = self.delete_where(table, &filter) {
                    tracing::warn!("{}: revert sweep on '{}' failed: {}", self.label, table, e);
                }
            }
            tracing::debug!("{}: transaction reverted under {}", self.label, marker);
        }

        self.delete_one(TXN_TABLE, &marker)
    }
}

impl std::fmt::Debug for RemoteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStorage")
            .field("base", &self.base)
            .field("database", &self.database)
            .finish()
    }
}
