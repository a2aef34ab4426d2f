//! Record type and content-digest identity
//!
//! A record is an ordered field mapping plus the opaque identifier its
//! backend assigned at insert time. Two records on different tiers are "the
//! same" exactly when their content digests agree; eids never cross tiers.

use crate::value::{Eid, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved field carrying the source-tier content digest on transported
/// records. Excluded from digest computation so a transported copy keeps
/// the digest of its origin.
pub const DIGEST_FIELD: &str = "_digest";

/// A stored record: backend-assigned eid plus ordered field mapping.
///
/// Records are immutable once read; all mutation goes through
/// `Controller::update`/`unset` so association invariants hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    eid: Option<Eid>,
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create a record that has not been inserted yet (no eid)
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { eid: None, fields }
    }

    /// Create a record as read back from a backend
    pub fn with_eid(eid: Eid, fields: BTreeMap<String, Value>) -> Self {
        Self {
            eid: Some(eid),
            fields,
        }
    }

    /// The backend-assigned identifier, if this record has been inserted
    pub fn eid(&self) -> Option<&Eid> {
        self.eid.as_ref()
    }

    /// Field lookup
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// All fields in order
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Consume into the field mapping
    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    /// Deterministic content digest over the record's fields.
    ///
    /// Stable across processes and tiers, independent of eid. The reserved
    /// `_digest` transport tag is excluded so a transported copy hashes to
    /// its origin digest.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in &self.fields {
            if name == DIGEST_FIELD {
                continue;
            }
            canonical_bytes(&mut hasher, name, value);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// The ids stored in a foreign-key field: a single id for `ForeignOne`
    /// attributes, every id in the sequence for `ForeignMany`.
    pub fn foreign_ids(&self, field: &str) -> Vec<Eid> {
        match self.fields.get(field) {
            Some(Value::List(items)) => items.iter().filter_map(Value::as_eid).collect(),
            Some(value) => value.as_eid().into_iter().collect(),
            None => Vec::new(),
        }
    }
}

/// Feed one field into the hasher in a self-delimiting canonical encoding.
fn canonical_bytes(hasher: &mut blake3::Hasher, name: &str, value: &Value) {
    hasher.update(&(name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
    canonical_value(hasher, value);
}

fn canonical_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Int(n) => {
            hasher.update(b"i");
            hasher.update(&n.to_le_bytes());
        }
        Value::Str(s) => {
            hasher.update(b"s");
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"t" } else { b"f" });
        }
        Value::List(items) => {
            hasher.update(b"l");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                canonical_value(hasher, item);
            }
        }
        Value::Map(map) => {
            hasher.update(b"m");
            hasher.update(&(map.len() as u64).to_le_bytes());
            for (k, v) in map {
                hasher.update(&(k.len() as u64).to_le_bytes());
                hasher.update(k.as_bytes());
                canonical_value(hasher, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_digest_ignores_eid() {
        let f = fields(&[("name", Value::from("alpha")), ("jobs", Value::Int(4))]);
        let a = Record::with_eid(Eid::Num(1), f.clone());
        let b = Record::with_eid(Eid::Num(99), f.clone());
        let c = Record::new(f);

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest(), c.digest());
    }

    #[test]
    fn test_digest_ignores_transport_tag() {
        let plain = Record::new(fields(&[("name", Value::from("alpha"))]));
        let tagged = Record::new(fields(&[
            ("name", Value::from("alpha")),
            (DIGEST_FIELD, Value::from("feedbeef")),
        ]));

        assert_eq!(plain.digest(), tagged.digest());
    }

    #[test]
    fn test_digest_sensitive_to_content() {
        let a = Record::new(fields(&[("name", Value::from("alpha"))]));
        let b = Record::new(fields(&[("name", Value::from("beta"))]));
        assert_ne!(a.digest(), b.digest());

        // Field boundaries matter: ("ab", "c") is not ("a", "bc")
        let c = Record::new(fields(&[("ab", Value::from("c"))]));
        let d = Record::new(fields(&[("a", Value::from("bc"))]));
        assert_ne!(c.digest(), d.digest());
    }

    #[test]
    fn test_foreign_ids() {
        let rec = Record::new(fields(&[
            ("target", Value::Int(3)),
            (
                "trials",
                Value::List(vec![Value::Int(1), Value::Int(2)]),
            ),
        ]));

        assert_eq!(rec.foreign_ids("target"), vec![Eid::Num(3)]);
        assert_eq!(rec.foreign_ids("trials"), vec![Eid::Num(1), Eid::Num(2)]);
        assert!(rec.foreign_ids("absent").is_empty());
    }
}
