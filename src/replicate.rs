//! Cross-tier replication - hash-based push/pull between storage tiers
//!
//! Traversal walks a record's direction-tagged association graph to find
//! the minimal consistent set to move: upward prerequisites first, the seed
//! itself, then downward dependents, so a destination tier never receives a
//! record before its prerequisites. Visits are tracked by content digest,
//! never by eid - identifiers are tier-local and meaningless across tiers.
//!
//! Transport rewrites association fields on the way over: `Down` edges are
//! stripped (dependents are not known yet at the destination), `Up` edges
//! are rewritten to destination-local eids through the remap table built as
//! records land in dependency order. Untagged foreign edges do not cross
//! tiers at all.

use crate::record::{DIGEST_FIELD, Record};
use crate::registry::Registry;
use crate::schema::{AttrKind, Direction};
use crate::storage::{Key, StorageBackend, transact};
use crate::value::{Eid, Value};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Which way records are moving; mechanics are identical, diagnostics and
/// server-side backlink behavior differ per tier configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Push,
    Pull,
}

impl TransportMode {
    fn verb(&self) -> &'static str {
        match self {
            TransportMode::Push => "pushed",
            TransportMode::Pull => "pulled",
        }
    }
}

/// Source-tier (model, eid) to destination-tier eid
pub type RemapTable = BTreeMap<(String, String), Eid>;

/// What one replication run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub transported: usize,
    pub already_present: usize,
}

/// Moves record graphs between a source and a destination tier
pub struct Replicator<'a> {
    registry: &'a Registry,
    source: &'a dyn StorageBackend,
    destination: &'a dyn StorageBackend,
}

impl<'a> Replicator<'a> {
    pub fn new(
        registry: &'a Registry,
        source: &'a dyn StorageBackend,
        destination: &'a dyn StorageBackend,
    ) -> Self {
        Self {
            registry,
            source,
            destination,
        }
    }

    /// Move records matching `key` (and their graph) up to the destination
    pub fn push(&self, model: &str, key: &Key) -> Result<ReplicationReport> {
        self.replicate(model, key, TransportMode::Push)
    }

    /// Move records matching `key` (and their graph) down from the source
    pub fn pull(&self, model: &str, key: &Key) -> Result<ReplicationReport> {
        self.replicate(model, key, TransportMode::Pull)
    }

    fn replicate(&self, model: &str, key: &Key, mode: TransportMode) -> Result<ReplicationReport> {
        let controller = self.registry.controller(model, self.source)?;
        let seeds = controller.search(Some(key))?;
        if seeds.is_empty() {
            return Err(Error::NotFound(format!(
                "no {} records match the replication key",
                model
            )));
        }
        let ordered = self.traverse(model, &seeds)?;

        transact(self.destination, || {
            let mut remap = RemapTable::new();
            let mut report = ReplicationReport::default();
            for (record_model, record) in &ordered {
                let (_, already_present) =
                    self.transport_record(record_model, record, &mut remap, mode)?;
                if already_present {
                    report.already_present += 1;
                } else {
                    report.transported += 1;
                }
            }
            tracing::info!(
                "{} {} records ({} already present)",
                mode.verb(),
                report.transported,
                report.already_present
            );
            Ok(report)
        })
    }

    /// Dependency-ordered closure of the seeds over direction-tagged
    /// edges: upward prerequisites, seed, downward dependents. Each record
    /// is visited at most once, keyed by content digest, so cyclic graphs
    /// terminate.
    pub fn traverse(&self, model: &str, seeds: &[Record]) -> Result<Vec<(String, Record)>> {
        let mut visited = BTreeSet::new();
        let mut ordered = Vec::new();
        for seed in seeds {
            self.visit(model, seed, &mut visited, &mut ordered)?;
        }
        Ok(ordered)
    }

    fn visit(
        &self,
        model: &str,
        record: &Record,
        visited: &mut BTreeSet<String>,
        ordered: &mut Vec<(String, Record)>,
    ) -> Result<()> {
        if !visited.insert(record.digest()) {
            return Ok(());
        }
        for (up_model, up) in self.neighbors(model, record, Direction::Up)? {
            self.visit(&up_model, &up, visited, ordered)?;
        }
        ordered.push((model.to_string(), record.clone()));
        for (down_model, down) in self.neighbors(model, record, Direction::Down)? {
            self.visit(&down_model, &down, visited, ordered)?;
        }
        Ok(())
    }

    /// Direction-tagged depth-1 neighbors on the source tier: this
    /// record's own tagged foreign attributes, plus records elsewhere
    /// whose oppositely-tagged attributes point at it.
    fn neighbors(
        &self,
        model: &str,
        record: &Record,
        direction: Direction,
    ) -> Result<Vec<(String, Record)>> {
        let schema = self.registry.resolve(model)?;
        let mut found = Vec::new();

        for attr in schema.attrs() {
            if attr.direction != Some(direction) {
                continue;
            }
            let Some(foreign_model) = attr.kind.foreign_model() else {
                continue;
            };
            let foreign_schema = self.registry.resolve(foreign_model)?;
            for fid in record.foreign_ids(&attr.name) {
                if let Some(rec) = self.source.get(foreign_schema.table(), &Key::Eid(fid))? {
                    found.push((foreign_model.to_string(), rec));
                }
            }
        }

        // A record r is a dependent of s when s.attr points at r and attr
        // is tagged Up; symmetrically for prerequisites.
        let opposite = match direction {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        };
        let Some(eid) = record.eid() else {
            return Ok(found);
        };
        for other_model in self.registry.models() {
            let other_schema = self.registry.resolve(other_model)?;
            for attr in other_schema.attrs() {
                if attr.direction != Some(opposite) || attr.kind.foreign_model() != Some(model) {
                    continue;
                }
                let pointers = match &attr.kind {
                    AttrKind::ForeignOne { .. } => self.source.search(
                        other_schema.table(),
                        Some(&Key::eq(&attr.name, eid.to_value())),
                    )?,
                    AttrKind::ForeignMany { .. } => {
                        // Membership in a sequence is not an equality key
                        let all = self.source.search(other_schema.table(), None)?;
                        all.into_iter()
                            .filter(|r| r.foreign_ids(&attr.name).contains(eid))
                            .collect()
                    }
                    AttrKind::Scalar(_) => Vec::new(),
                };
                for rec in pointers {
                    found.push((other_model.to_string(), rec));
                }
            }
        }
        Ok(found)
    }

    /// Move one record to the destination tier.
    ///
    /// Returns the destination-local eid and whether an equivalent record
    /// (by content digest) was already there, in which case nothing is
    /// written. `Up` edges must already be resolvable through `remap`:
    /// records are transported in the order `traverse` produced.
    pub fn transport_record(
        &self,
        model: &str,
        record: &Record,
        remap: &mut RemapTable,
        mode: TransportMode,
    ) -> Result<(Eid, bool)> {
        let schema = self.registry.resolve(model)?;
        let digest = record.digest();

        if let Some(existing) = self.find_by_digest(schema.table(), &digest)? {
            if let Some(src) = record.eid() {
                remap.insert((model.to_string(), src.to_string()), existing.clone());
            }
            tracing::debug!("{} {} already present at destination", model, digest);
            return Ok((existing, true));
        }

        let mut fields = record.fields().clone();
        fields.remove(DIGEST_FIELD);
        for attr in schema.attrs() {
            if !attr.kind.is_foreign() {
                continue;
            }
            match attr.direction {
                Some(Direction::Down) | None => {
                    fields.remove(&attr.name);
                }
                Some(Direction::Up) => {
                    let ids = record.foreign_ids(&attr.name);
                    if ids.is_empty() {
                        fields.remove(&attr.name);
                        continue;
                    }
                    let foreign_model = attr.kind.foreign_model().unwrap_or_default();
                    let mut mapped = Vec::new();
                    for id in ids {
                        let dest = remap
                            .get(&(foreign_model.to_string(), id.to_string()))
                            .cloned()
                            .ok_or_else(|| {
                                Error::Storage(format!(
                                    "prerequisite {} {} was not transported before {}.{}",
                                    foreign_model, id, model, attr.name
                                ))
                            })?;
                        mapped.push(dest);
                    }
                    let value = if attr.kind.is_collection() {
                        Value::List(mapped.iter().map(Eid::to_value).collect())
                    } else {
                        mapped[0].to_value()
                    };
                    fields.insert(attr.name.clone(), value);
                }
            }
        }
        fields.insert(DIGEST_FIELD.to_string(), Value::Str(digest.clone()));

        let inserted = self.destination.insert(schema.table(), fields)?;
        let eid = inserted.eid().cloned().ok_or_else(|| {
            Error::Storage(format!("destination assigned no eid to {} record", model))
        })?;
        if let Some(src) = record.eid() {
            remap.insert((model.to_string(), src.to_string()), eid.clone());
        }
        tracing::debug!("{} {} {} as {}", mode.verb(), model, digest, eid);
        Ok((eid, false))
    }

    /// Destination lookup by content digest: the transport tag first, then
    /// live digests of untagged records (so a record pulled back to its
    /// origin tier is still recognized).
    fn find_by_digest(&self, table: &str, digest: &str) -> Result<Option<Eid>> {
        let tagged = self
            .destination
            .search(table, Some(&Key::eq(DIGEST_FIELD, digest)))?;
        if let Some(hit) = tagged.first() {
            return Ok(hit.eid().cloned());
        }
        for record in self.destination.search(table, None)? {
            if record.digest() == digest {
                return Ok(record.eid().cloned());
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use crate::schema::Attribute;
    use crate::testutil::{self, fields};
    use crate::value::ValueType;

    #[test]
    fn test_push_transports_prerequisites_first() {
        testutil::init_tracing();
        let registry = testutil::registry();
        let (_dir, local) = testutil::local_storage();
        let shared = testutil::sqlite_storage();

        let targets = registry.controller("Target", &local).unwrap();
        let experiments = registry.controller("Experiment", &local).unwrap();

        let tid = targets
            .create(fields(&[("name", Value::from("alpha"))]))
            .unwrap()
            .eid()
            .unwrap()
            .clone();
        experiments
            .create(fields(&[
                ("name", Value::from("e1")),
                ("target", tid.to_value()),
            ]))
            .unwrap();

        let replicator = Replicator::new(&registry, &local, &shared);
        let report = replicator
            .push("Experiment", &Key::eq("name", "e1"))
            .unwrap();
        assert_eq!(report.transported, 2);
        assert_eq!(report.already_present, 0);

        // Target landed with its digest tag and no dependents field
        let remote_targets = registry.controller("Target", &shared).unwrap();
        let target = remote_targets.one(&Key::eq("name", "alpha")).unwrap().unwrap();
        assert!(target.get(DIGEST_FIELD).is_some());
        assert_eq!(target.get("experiments"), None);

        // Experiment's up edge points at the destination-local target id
        let remote_experiments = registry.controller("Experiment", &shared).unwrap();
        let exp = remote_experiments.one(&Key::eq("name", "e1")).unwrap().unwrap();
        assert_eq!(exp.get("target"), Some(&target.eid().unwrap().to_value()));
    }

    #[test]
    fn test_transport_is_idempotent() {
        let registry = testutil::registry();
        let (_dir, local) = testutil::local_storage();
        let shared = testutil::sqlite_storage();

        let targets = registry.controller("Target", &local).unwrap();
        let record = targets
            .create(fields(&[("name", Value::from("alpha"))]))
            .unwrap();

        let replicator = Replicator::new(&registry, &local, &shared);
        let mut remap = RemapTable::new();
        let (first_eid, present) = replicator
            .transport_record("Target", &record, &mut remap, TransportMode::Push)
            .unwrap();
        assert!(!present);

        let mut remap = RemapTable::new();
        let (second_eid, present) = replicator
            .transport_record("Target", &record, &mut remap, TransportMode::Push)
            .unwrap();
        assert!(present);
        assert_eq!(first_eid, second_eid);

        let remote_targets = registry.controller("Target", &shared).unwrap();
        assert_eq!(remote_targets.count().unwrap(), 1);
    }

    #[test]
    fn test_push_twice_reports_already_present() {
        let registry = testutil::registry();
        let (_dir, local) = testutil::local_storage();
        let shared = testutil::sqlite_storage();

        let targets = registry.controller("Target", &local).unwrap();
        targets
            .create(fields(&[("name", Value::from("alpha"))]))
            .unwrap();

        let replicator = Replicator::new(&registry, &local, &shared);
        let key = Key::eq("name", "alpha");
        let first = replicator.push("Target", &key).unwrap();
        assert_eq!(first.transported, 1);

        let second = replicator.push("Target", &key).unwrap();
        assert_eq!(second.transported, 0);
        assert_eq!(second.already_present, 1);
    }

    #[test]
    fn test_pull_recognizes_origin_records() {
        let registry = testutil::registry();
        let (_dir, local) = testutil::local_storage();
        let shared = testutil::sqlite_storage();

        let targets = registry.controller("Target", &local).unwrap();
        targets
            .create(fields(&[("name", Value::from("alpha"))]))
            .unwrap();

        let up = Replicator::new(&registry, &local, &shared);
        up.push("Target", &Key::eq("name", "alpha")).unwrap();

        // Pulling the pushed copy back finds the untagged origin record
        // by live digest and writes nothing
        let down = Replicator::new(&registry, &shared, &local);
        let report = down.pull("Target", &Key::eq("name", "alpha")).unwrap();
        assert_eq!(report.transported, 0);
        assert_eq!(report.already_present, 1);
        assert_eq!(targets.count().unwrap(), 1);
    }

    #[test]
    fn test_traversal_terminates_on_cycles() {
        let registry = RegistryBuilder::new()
            .add(
                "Stage",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key().required(),
                    Attribute::foreign_one("next", "Stage").direction(Direction::Up),
                ],
            )
            .build()
            .unwrap();
        let storage = testutil::sqlite_storage();
        let stages = registry.controller("Stage", &storage).unwrap();

        let a = stages
            .create(fields(&[("name", Value::from("a"))]))
            .unwrap();
        let aid = a.eid().unwrap().clone();
        let bid = stages
            .create(fields(&[
                ("name", Value::from("b")),
                ("next", aid.to_value()),
            ]))
            .unwrap()
            .eid()
            .unwrap()
            .clone();
        stages
            .update(fields(&[("next", bid.to_value())]), &Key::Eid(aid.clone()))
            .unwrap();

        let (_dir, other) = testutil::local_storage();
        let replicator = Replicator::new(&registry, &storage, &other);
        let seed = stages.one(&Key::Eid(aid)).unwrap().unwrap();
        let ordered = replicator.traverse("Stage", &[seed]).unwrap();

        // Both records, each exactly once
        assert_eq!(ordered.len(), 2);
        let names: Vec<_> = ordered
            .iter()
            .filter_map(|(_, r)| r.get("name").cloned())
            .collect();
        assert!(names.contains(&Value::from("a")));
        assert!(names.contains(&Value::from("b")));
    }

    #[test]
    fn test_replicate_missing_seed_errors() {
        let registry = testutil::registry();
        let (_dir, local) = testutil::local_storage();
        let shared = testutil::sqlite_storage();

        let replicator = Replicator::new(&registry, &local, &shared);
        let err = replicator
            .push("Target", &Key::eq("name", "ghost"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_digest_matches_across_tiers() {
        let registry = testutil::registry();
        let (_dir, local) = testutil::local_storage();
        let shared = testutil::sqlite_storage();

        let data = fields(&[("name", Value::from("alpha"))]);
        let on_local = registry
            .controller("Target", &local)
            .unwrap()
            .create(data.clone())
            .unwrap();
        let on_sqlite = registry
            .controller("Target", &shared)
            .unwrap()
            .create(data)
            .unwrap();

        assert_ne!(on_local.eid(), None);
        assert_eq!(on_local.digest(), on_sqlite.digest());
    }
}
