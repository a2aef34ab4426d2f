//! Shared test fixtures: a small toolchain-configuration model family and
//! backend constructors.

use crate::registry::{Registry, RegistryBuilder};
use crate::schema::{Attribute, Direction};
use crate::storage::{LocalFileStorage, SqliteStorage};
use crate::value::{Value, ValueType};
use std::collections::BTreeMap;

/// Opt-in log output for test debugging; respects `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Target / Experiment / Measurement / Note. Experiments require a target
/// (cascade on disassociation) and optionally reference a measurement;
/// notes reference a target one-directionally.
pub fn registry() -> Registry {
    RegistryBuilder::new()
        .add(
            "Target",
            vec![
                Attribute::scalar("name", ValueType::Str)
                    .primary_key()
                    .required(),
                Attribute::scalar("tau_source", ValueType::Str)
                    .default_value(Value::from("download")),
                Attribute::scalar("host_os", ValueType::Str),
                Attribute::foreign_many("experiments", "Experiment", "target")
                    .direction(Direction::Down),
            ],
        )
        .add(
            "Experiment",
            vec![
                Attribute::scalar("name", ValueType::Str)
                    .primary_key()
                    .required(),
                Attribute::foreign_one("target", "Target")
                    .via("experiments")
                    .required()
                    .direction(Direction::Up),
                Attribute::foreign_one("measurement", "Measurement")
                    .via("experiments")
                    .direction(Direction::Up),
            ],
        )
        .add(
            "Measurement",
            vec![
                Attribute::scalar("name", ValueType::Str)
                    .primary_key()
                    .required(),
                Attribute::scalar("profile", ValueType::Bool).default_value(Value::Bool(true)),
                Attribute::foreign_many("experiments", "Experiment", "measurement")
                    .direction(Direction::Down),
            ],
        )
        .add(
            "Note",
            vec![
                Attribute::scalar("body", ValueType::Str)
                    .primary_key()
                    .required(),
                Attribute::foreign_one("subject", "Target"),
            ],
        )
        .build()
        .expect("fixture registry")
}

pub fn local_storage() -> (tempfile::TempDir, LocalFileStorage) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = LocalFileStorage::open(dir.path().join("records.json")).expect("open");
    (dir, storage)
}

pub fn sqlite_storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().expect("open")
}
