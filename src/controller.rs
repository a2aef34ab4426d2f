//! Controller - the relational engine over one (schema, backend) pair
//!
//! Validates data against the schema, performs CRUD against the bound
//! storage backend, and re-derives association side effects: foreign-key
//! propagation, cascading deletes, compatibility constraints, lifecycle
//! hooks. Every mutating operation runs inside one transaction scope; a
//! failure at any step leaves no partial record and no partial association.

use crate::record::Record;
use crate::registry::Registry;
use crate::schema::{AttrKind, Attribute, Constraint, Schema};
use crate::storage::{Key, Matcher, StorageBackend, transact};
use crate::value::{Eid, EidKind, Value};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Records being deleted in the current cascade, keyed by model and eid.
/// Required-edge cycles would otherwise recurse forever.
type DeleteGuard = BTreeSet<(String, String)>;

/// Relational CRUD bound to exactly one schema and one storage backend.
///
/// Sibling controllers for foreign models are derived on demand from the
/// shared registry, bound to the same backend.
pub struct Controller<'a> {
    schema: &'a Schema,
    registry: &'a Registry,
    storage: &'a dyn StorageBackend,
}

impl<'a> Controller<'a> {
    pub fn new(schema: &'a Schema, registry: &'a Registry, storage: &'a dyn StorageBackend) -> Self {
        Self {
            schema,
            registry,
            storage,
        }
    }

    pub fn model(&self) -> &str {
        self.schema.name()
    }

    pub fn table(&self) -> &str {
        self.schema.table()
    }

    pub fn schema(&self) -> &Schema {
        self.schema
    }

    /// The backend this controller is bound to
    pub fn storage(&self) -> &'a dyn StorageBackend {
        self.storage
    }

    /// Sibling controller for another model on the same backend
    pub fn for_model(&self, model: &str) -> Result<Controller<'a>> {
        self.registry.controller(model, self.storage)
    }

    // ========== Reads ==========

    /// First record matching `key`, if any
    pub fn one(&self, key: &Key) -> Result<Option<Record>> {
        self.storage.get(self.table(), key)
    }

    pub fn all(&self) -> Result<Vec<Record>> {
        self.storage.search(self.table(), None)
    }

    pub fn count(&self) -> Result<usize> {
        self.storage.count(self.table())
    }

    /// Records matching `key`; no key returns all records
    pub fn search(&self, key: Option<&Key>) -> Result<Vec<Record>> {
        self.storage.search(self.table(), key)
    }

    /// Records whose `field` satisfies a regex or predicate matcher
    pub fn match_field(&self, field: &str, matcher: &Matcher) -> Result<Vec<Record>> {
        self.storage.match_field(self.table(), field, matcher)
    }

    pub fn exists(&self, key: &Key) -> Result<bool> {
        self.storage.contains(self.table(), key)
    }

    /// Records whose content digest ends with any of the given hex
    /// suffixes. A suffix matching more than one record is an ambiguity
    /// error, never silently resolved.
    pub fn search_hash(&self, suffixes: &[&str]) -> Result<Vec<Record>> {
        let all = self.all()?;
        let digests: Vec<String> = all.iter().map(Record::digest).collect();

        let mut picked = Vec::new();
        let mut seen = BTreeSet::new();
        for suffix in suffixes {
            let suffix_lower = suffix.to_lowercase();
            let hits: Vec<usize> = digests
                .iter()
                .enumerate()
                .filter(|(_, d)| d.ends_with(&suffix_lower))
                .map(|(i, _)| i)
                .collect();
            if hits.len() > 1 {
                return Err(Error::AmbiguousHash {
                    suffix: suffix.to_string(),
                    count: hits.len(),
                });
            }
            for i in hits {
                if seen.insert(digests[i].clone()) {
                    picked.push(all[i].clone());
                }
            }
        }
        Ok(picked)
    }

    // ========== Mutations ==========

    /// Validate, check uniqueness, insert, establish associations, check
    /// compatibility, fire the creation hook - atomically.
    pub fn create(&self, data: BTreeMap<String, Value>) -> Result<Record> {
        let populated = self.validate_create(data)?;
        self.check_unique(&populated, &[])?;

        transact(self.storage, || {
            let record = self.storage.insert(self.table(), populated)?;
            self.verify_references(&record)?;
            for edge in self.schema.associations() {
                let foreign_ids = record.foreign_ids(&edge.attr);
                if !foreign_ids.is_empty() {
                    self.associate(&record, &edge.model, &edge.via, &foreign_ids)?;
                }
            }
            self.check_compatibility(&record)?;
            if let Some(hooks) = self.registry.hooks(self.model()) {
                hooks.created(&record);
            }
            if let Some(eid) = record.eid() {
                tracing::info!("created {} {}", self.model(), eid);
            }
            Ok(record)
        })
    }

    /// Apply a field change to every record matching `key`, maintaining
    /// the symmetric difference of each changed association - atomically.
    pub fn update(&self, data: BTreeMap<String, Value>, key: &Key) -> Result<()> {
        self.validate_update(&data)?;

        // Affected set is computed before mutating so stale foreign keys
        // are still known afterwards.
        let affected = self.search(Some(key))?;
        if affected.is_empty() {
            return Ok(());
        }
        let exclude: Vec<Eid> = affected.iter().filter_map(|r| r.eid().cloned()).collect();
        self.check_unique(&data, &exclude)?;

        transact(self.storage, || {
            self.storage.update(self.table(), &data, key)?;
            let mut guard = DeleteGuard::new();
            for old in &affected {
                for edge in self.schema.associations() {
                    let Some(new_value) = data.get(&edge.attr) else {
                        continue;
                    };
                    let old_ids = old.foreign_ids(&edge.attr);
                    let new_ids = value_ids(new_value);
                    let added: Vec<Eid> = new_ids
                        .iter()
                        .filter(|id| !old_ids.contains(id))
                        .cloned()
                        .collect();
                    let removed: Vec<Eid> = old_ids
                        .iter()
                        .filter(|id| !new_ids.contains(id))
                        .cloned()
                        .collect();
                    self.associate(old, &edge.model, &edge.via, &added)?;
                    self.disassociate(old, &edge.model, &edge.via, &removed, &mut guard)?;
                }

                let Some(eid) = old.eid() else { continue };
                let current = self
                    .storage
                    .get(self.table(), &Key::Eid(eid.clone()))?
                    .ok_or_else(|| {
                        Error::Storage(format!("{} {} vanished mid-update", self.model(), eid))
                    })?;
                self.verify_references(&current)?;
                self.check_compatibility(&current)?;
                if let Some(hooks) = self.registry.hooks(self.model()) {
                    hooks.updated(&current);
                }
                tracing::info!("updated {} {}", self.model(), eid);
            }
            Ok(())
        })
    }

    /// Remove fields from every record matching `key`; an association
    /// attribute being unset is fully disassociated first.
    pub fn unset(&self, fields: &[&str], key: &Key) -> Result<()> {
        for name in fields {
            let attr = self.schema.attr(name).ok_or_else(|| {
                Error::Validation(format!("{} has no attribute '{}'", self.model(), name))
            })?;
            if attr.required {
                return Err(Error::Validation(format!(
                    "cannot unset required attribute {}.{}",
                    self.model(),
                    name
                )));
            }
        }

        let affected = self.search(Some(key))?;
        if affected.is_empty() {
            return Ok(());
        }

        transact(self.storage, || {
            self.storage.unset(self.table(), fields, key)?;
            let mut guard = DeleteGuard::new();
            for old in &affected {
                for edge in self.schema.associations() {
                    if !fields.contains(&edge.attr.as_str()) {
                        continue;
                    }
                    let old_ids = old.foreign_ids(&edge.attr);
                    self.disassociate(old, &edge.model, &edge.via, &old_ids, &mut guard)?;
                }

                let Some(eid) = old.eid() else { continue };
                if let Some(current) = self.storage.get(self.table(), &Key::Eid(eid.clone()))? {
                    self.check_compatibility(&current)?;
                    if let Some(hooks) = self.registry.hooks(self.model()) {
                        hooks.updated(&current);
                    }
                }
            }
            Ok(())
        })
    }

    /// Delete every record matching `key`, severing or cascading all
    /// associations referencing each record first.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let affected = self.search(Some(key))?;
        transact(self.storage, || {
            let mut guard = DeleteGuard::new();
            for record in &affected {
                self.delete_record(record, &mut guard)?;
            }
            Ok(())
        })
    }

    fn delete_record(&self, record: &Record, guard: &mut DeleteGuard) -> Result<()> {
        let eid = record.eid().cloned().ok_or_else(|| {
            Error::Storage(format!("{} record without eid cannot be deleted", self.model()))
        })?;
        if !guard.insert((self.model().to_string(), eid.to_string())) {
            return Ok(());
        }

        // Sever every bidirectional edge this record participates in
        for edge in self.schema.associations() {
            let foreign_ids = record.foreign_ids(&edge.attr);
            self.disassociate(record, &edge.model, &edge.via, &foreign_ids, guard)?;
        }

        // One-directional backlinks: foreign records pointing here through
        // an attribute this schema has no field for
        for reference in self.schema.references() {
            let foreign_schema = self.registry.resolve(&reference.model)?;
            let attr = foreign_schema.attr(&reference.attr).ok_or_else(|| {
                Error::Schema(format!(
                    "{}.{} referenced but not declared",
                    reference.model, reference.attr
                ))
            })?;
            let referers = self.storage.search(
                foreign_schema.table(),
                Some(&Key::eq(&reference.attr, eid.to_value())),
            )?;
            for referer in referers {
                if attr.required {
                    self.for_model(&reference.model)?
                        .delete_record(&referer, guard)?;
                } else if let Some(rid) = referer.eid() {
                    self.storage.unset(
                        foreign_schema.table(),
                        &[&reference.attr],
                        &Key::Eid(rid.clone()),
                    )?;
                }
            }
        }

        if let Some(hooks) = self.registry.hooks(self.model()) {
            hooks.deleted(record);
        }
        self.storage.remove(self.table(), &Key::Eid(eid.clone()))?;
        tracing::info!("deleted {} {}", self.model(), eid);
        Ok(())
    }

    // ========== Association maintenance ==========

    /// Establish the reverse side of an association on each foreign
    /// record: a `ForeignOne` backlink is set to this record's id, a
    /// `ForeignMany` backlink gains it (set union).
    fn associate(
        &self,
        record: &Record,
        foreign_model: &str,
        via: &str,
        foreign_ids: &[Eid],
    ) -> Result<()> {
        if foreign_ids.is_empty() {
            return Ok(());
        }
        let eid = record.eid().cloned().ok_or_else(|| {
            Error::Storage(format!("{} record without eid cannot associate", self.model()))
        })?;
        let foreign_schema = self.registry.resolve(foreign_model)?;
        let via_attr = foreign_schema.attr(via).ok_or_else(|| {
            Error::Schema(format!("{}.{} is not declared", foreign_model, via))
        })?;

        for fid in foreign_ids {
            let foreign = self
                .storage
                .get(foreign_schema.table(), &Key::Eid(fid.clone()))?
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "{} {} referenced by {}.{}",
                        foreign_model, fid, self.model(), via
                    ))
                })?;

            match &via_attr.kind {
                AttrKind::ForeignOne { .. } => {
                    let mut patch = BTreeMap::new();
                    patch.insert(via.to_string(), eid.to_value());
                    self.storage
                        .update(foreign_schema.table(), &patch, &Key::Eid(fid.clone()))?;
                }
                AttrKind::ForeignMany { .. } => {
                    let mut members = foreign.foreign_ids(via);
                    if !members.contains(&eid) {
                        members.push(eid.clone());
                        let mut patch = BTreeMap::new();
                        patch.insert(
                            via.to_string(),
                            Value::List(members.iter().map(Eid::to_value).collect()),
                        );
                        self.storage
                            .update(foreign_schema.table(), &patch, &Key::Eid(fid.clone()))?;
                    }
                }
                AttrKind::Scalar(_) => {
                    return Err(Error::Schema(format!(
                        "{}.{} is not a foreign attribute",
                        foreign_model, via
                    )));
                }
            }
            tracing::debug!(
                "associated {} {} with {} {}",
                self.model(),
                eid,
                foreign_model,
                fid
            );
        }
        Ok(())
    }

    /// Remove the reverse side of an association from each foreign record.
    /// A `required` backlink losing its last value cascades a delete of the
    /// now-orphaned foreign record instead of leaving it dangling.
    fn disassociate(
        &self,
        record: &Record,
        foreign_model: &str,
        via: &str,
        foreign_ids: &[Eid],
        guard: &mut DeleteGuard,
    ) -> Result<()> {
        if foreign_ids.is_empty() {
            return Ok(());
        }
        let eid = record.eid().cloned().ok_or_else(|| {
            Error::Storage(format!(
                "{} record without eid cannot disassociate",
                self.model()
            ))
        })?;
        let foreign_schema = self.registry.resolve(foreign_model)?;
        let via_attr = foreign_schema.attr(via).ok_or_else(|| {
            Error::Schema(format!("{}.{} is not declared", foreign_model, via))
        })?;
        let foreign_ctl = self.for_model(foreign_model)?;

        for fid in foreign_ids {
            let Some(foreign) = self
                .storage
                .get(foreign_schema.table(), &Key::Eid(fid.clone()))?
            else {
                tracing::warn!(
                    "stale foreign key: {} {} no longer exists, skipping",
                    foreign_model,
                    fid
                );
                continue;
            };

            match &via_attr.kind {
                AttrKind::ForeignOne { .. } => {
                    if via_attr.required {
                        foreign_ctl.delete_record(&foreign, guard)?;
                    } else {
                        self.storage
                            .unset(foreign_schema.table(), &[via], &Key::Eid(fid.clone()))?;
                    }
                }
                AttrKind::ForeignMany { .. } => {
                    let members: Vec<Eid> = foreign
                        .foreign_ids(via)
                        .into_iter()
                        .filter(|m| m != &eid)
                        .collect();
                    if members.is_empty() && via_attr.required {
                        foreign_ctl.delete_record(&foreign, guard)?;
                    } else {
                        let mut patch = BTreeMap::new();
                        patch.insert(
                            via.to_string(),
                            Value::List(members.iter().map(Eid::to_value).collect()),
                        );
                        self.storage
                            .update(foreign_schema.table(), &patch, &Key::Eid(fid.clone()))?;
                    }
                }
                AttrKind::Scalar(_) => {
                    return Err(Error::Schema(format!(
                        "{}.{} is not a foreign attribute",
                        foreign_model, via
                    )));
                }
            }
            tracing::debug!(
                "disassociated {} {} from {} {}",
                self.model(),
                eid,
                foreign_model,
                fid
            );
        }
        Ok(())
    }

    // ========== Validation ==========

    fn validate_create(&self, data: BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        for name in data.keys() {
            if self.schema.attr(name).is_none() {
                return Err(Error::Validation(format!(
                    "{} has no attribute '{}'",
                    self.model(),
                    name
                )));
            }
        }

        let mut populated = data;
        for attr in self.schema.attrs() {
            if !populated.contains_key(&attr.name) {
                if let Some(default) = &attr.default {
                    populated.insert(attr.name.clone(), default.clone());
                }
            }
        }

        for attr in self.schema.attrs() {
            match populated.get(&attr.name) {
                Some(value) => self.check_type(attr, value)?,
                None if attr.required => {
                    return Err(Error::Validation(format!(
                        "{}.{} is required",
                        self.model(),
                        attr.name
                    )));
                }
                None => {}
            }
        }
        Ok(populated)
    }

    fn validate_update(&self, data: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in data {
            let attr = self.schema.attr(name).ok_or_else(|| {
                Error::Validation(format!("{} has no attribute '{}'", self.model(), name))
            })?;
            self.check_type(attr, value)?;
        }
        Ok(())
    }

    /// Scalars check against their declared type; foreign keys check
    /// against the backend's identifier kind - integers on local tiers,
    /// opaque strings on the remote tier.
    fn check_type(&self, attr: &Attribute, value: &Value) -> Result<()> {
        let eid_ok = |v: &Value| {
            v.as_eid()
                .is_some_and(|eid| eid.is_kind(self.storage.eid_kind()))
        };
        let expected = match &attr.kind {
            AttrKind::Scalar(value_type) => {
                if value.value_type() == *value_type {
                    return Ok(());
                }
                value_type.as_str().to_string()
            }
            AttrKind::ForeignOne { model, .. } => {
                if eid_ok(value) {
                    return Ok(());
                }
                format!("{} id", model)
            }
            AttrKind::ForeignMany { model, .. } => {
                if value
                    .as_list()
                    .is_some_and(|items| items.iter().all(eid_ok))
                {
                    return Ok(());
                }
                format!("sequence of {} ids", model)
            }
        };
        let kind_note = match self.storage.eid_kind() {
            EidKind::Numeric => "integer",
            EidKind::Opaque => "string",
        };
        Err(Error::Validation(format!(
            "{}.{} = {} is not a valid {} (this tier uses {} ids)",
            self.model(),
            attr.name,
            value,
            expected,
            kind_note
        )))
    }

    /// Match-any search over the unique-attribute values present in
    /// `fields`; any hit outside `exclude` is a conflict.
    fn check_unique(&self, fields: &BTreeMap<String, Value>, exclude: &[Eid]) -> Result<()> {
        let conditions: Vec<(String, Value)> = self
            .schema
            .unique_attrs()
            .filter_map(|attr| {
                fields
                    .get(&attr.name)
                    .map(|value| (attr.name.clone(), value.clone()))
            })
            .collect();
        if conditions.is_empty() {
            return Ok(());
        }

        let hits = self
            .storage
            .search(self.table(), Some(&Key::where_any(conditions.clone())))?;
        for hit in hits {
            if hit.eid().is_some_and(|eid| exclude.contains(eid)) {
                continue;
            }
            for (name, value) in &conditions {
                if hit.get(name) == Some(value) {
                    return Err(Error::UniqueConstraint {
                        model: self.model().to_string(),
                        attribute: name.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Foreign attributes with no association edge still point at records
    /// that must exist.
    fn verify_references(&self, record: &Record) -> Result<()> {
        for attr in self.schema.attrs() {
            let Some(model) = attr.kind.foreign_model() else {
                continue;
            };
            if self
                .schema
                .associations()
                .iter()
                .any(|e| e.attr == attr.name)
            {
                continue;
            }
            let foreign_schema = self.registry.resolve(model)?;
            for fid in record.foreign_ids(&attr.name) {
                if !self
                    .storage
                    .contains(foreign_schema.table(), &Key::Eid(fid.clone()))?
                {
                    return Err(Error::NotFound(format!(
                        "{} {} referenced by {}.{}",
                        model,
                        fid,
                        self.model(),
                        attr.name
                    )));
                }
            }
        }
        Ok(())
    }

    // ========== Compatibility ==========

    /// Evaluate every triggered compat rule against the record's depth-1
    /// neighbors of the constraint's target model.
    fn check_compatibility(&self, record: &Record) -> Result<()> {
        for attr in self.schema.attrs() {
            if attr.compat.is_empty() {
                continue;
            }
            let Some(value) = record.get(&attr.name) else {
                continue;
            };
            for rule in &attr.compat {
                if !rule.trigger.matches(value) {
                    continue;
                }
                for constraint in &rule.constraints {
                    for other in self.neighbors(record, &constraint.model)? {
                        self.evaluate_constraint(record, attr, value, constraint, &other)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate_constraint(
        &self,
        record: &Record,
        attr: &Attribute,
        value: &Value,
        constraint: &Constraint,
        other: &Record,
    ) -> Result<()> {
        use crate::schema::ConstraintKind::*;

        let satisfied = match other.get(&constraint.attr) {
            Some(target) => constraint
                .expected
                .as_ref()
                .is_none_or(|expected| expected.matches(target)),
            None => false,
        };
        let violated = match constraint.kind {
            Require | Encourage => !satisfied,
            Exclude | Discourage => satisfied,
        };
        if !violated {
            return Ok(());
        }

        let identify = |schema: &Schema, rec: &Record| {
            let pk = &schema.primary_key().name;
            rec.get(pk)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string())
        };
        let other_schema = self.registry.resolve(&constraint.model)?;
        let detail = format!(
            "{} '{}' with {}.{} = {} {}s {}.{} on {} '{}'",
            self.model(),
            identify(self.schema, record),
            self.model(),
            attr.name,
            value,
            constraint.kind,
            constraint.model,
            constraint.attr,
            constraint.model,
            identify(other_schema, other),
        );

        if constraint.kind.is_fatal() {
            Err(Error::IncompatibleRecord(detail))
        } else {
            tracing::warn!("compatibility advisory: {}", detail);
            Ok(())
        }
    }

    /// Depth-1 associated records of `model`: forward edges via this
    /// record's foreign keys plus reverse references pointing at it.
    fn neighbors(&self, record: &Record, model: &str) -> Result<Vec<Record>> {
        let mut result = Vec::new();
        let mut seen = BTreeSet::new();
        let foreign_schema = self.registry.resolve(model)?;

        for edge in self
            .schema
            .associations()
            .iter()
            .filter(|e| e.model == model)
        {
            for fid in record.foreign_ids(&edge.attr) {
                if !seen.insert(fid.to_string()) {
                    continue;
                }
                if let Some(rec) = self
                    .storage
                    .get(foreign_schema.table(), &Key::Eid(fid.clone()))?
                {
                    result.push(rec);
                }
            }
        }

        if let Some(eid) = record.eid() {
            for reference in self.schema.references().iter().filter(|r| r.model == model) {
                let referers = self.storage.search(
                    foreign_schema.table(),
                    Some(&Key::eq(&reference.attr, eid.to_value())),
                )?;
                for rec in referers {
                    if rec.eid().is_some_and(|fid| seen.insert(fid.to_string())) {
                        result.push(rec);
                    }
                }
            }
        }
        Ok(result)
    }
}

/// The eids carried by an association attribute value
fn value_ids(value: &Value) -> Vec<Eid> {
    match value {
        Value::List(items) => items.iter().filter_map(Value::as_eid).collect(),
        other => other.as_eid().into_iter().collect(),
    }
}
