//! Tagged value and identifier types
//!
//! A `Value` is the unit of record field content: integer, string, boolean,
//! sequence, or nested map. It is JSON-compatible with serde serialization.
//! An `Eid` is a backend-assigned record identifier, unique only within one
//! table of one storage tier; local backends assign integers, the remote
//! backend assigns opaque strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A record field value.
///
/// Maps are ordered (`BTreeMap`) so serialized field content is
/// deterministic, which the content digest depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// The type tag of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Str(_) => ValueType::Str,
            Value::Bool(_) => ValueType::Bool,
            Value::List(_) => ValueType::List,
            Value::Map(_) => ValueType::Map,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as sequence
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get as nested map
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Interpret this value as a record identifier, if it is one
    pub fn as_eid(&self) -> Option<Eid> {
        match self {
            Value::Int(n) => Some(Eid::Num(*n)),
            Value::Str(s) => Some(Eid::Text(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Type tags for schema scalar attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Str,
    Bool,
    List,
    Map,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Str => "str",
            ValueType::Bool => "bool",
            ValueType::List => "list",
            ValueType::Map => "map",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backend-assigned record identifier.
///
/// Eids are tier-local: an eid from one storage backend must never be
/// compared against an eid from another. Cross-tier identity goes through
/// the content digest instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Eid {
    Num(i64),
    Text(String),
}

impl Eid {
    /// The value form this eid takes when stored inside a record field
    pub fn to_value(&self) -> Value {
        match self {
            Eid::Num(n) => Value::Int(*n),
            Eid::Text(s) => Value::Str(s.clone()),
        }
    }

    pub fn as_num(&self) -> Option<i64> {
        match self {
            Eid::Num(n) => Some(*n),
            Eid::Text(_) => None,
        }
    }

    /// True if this eid matches the given backend identifier kind
    pub fn is_kind(&self, kind: EidKind) -> bool {
        matches!(
            (self, kind),
            (Eid::Num(_), EidKind::Numeric) | (Eid::Text(_), EidKind::Opaque)
        )
    }
}

impl std::fmt::Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eid::Num(n) => write!(f, "{}", n),
            Eid::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Eid {
    fn from(n: i64) -> Self {
        Eid::Num(n)
    }
}

impl From<&str> for Eid {
    fn from(s: &str) -> Self {
        Eid::Text(s.to_string())
    }
}

/// The identifier kind a backend assigns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EidKind {
    /// Integer row ids (local backends)
    Numeric,
    /// Server-assigned opaque strings (remote backend)
    Opaque,
}
