//! Schema registry - explicit model registration and two-pass linking
//!
//! Models are registered once at process initialization, then `build()`
//! validates every schema in isolation (pass one) and wires association
//! edges across all declared models (pass two). Forward references between
//! models resolve because linking happens only after every declaration is
//! in. The built registry is immutable.

use crate::controller::Controller;
use crate::record::Record;
use crate::schema::{AssociationEdge, Attribute, ReferenceEdge, Schema};
use crate::storage::StorageBackend;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Model lifecycle callbacks, registered alongside the declaration.
/// Fired inside the same transaction as the triggering operation.
pub trait ModelHooks {
    fn created(&self, _record: &Record) {}
    fn updated(&self, _record: &Record) {}
    fn deleted(&self, _record: &Record) {}
}

/// No-op hooks for models that declare none
struct DefaultHooks;

impl ModelHooks for DefaultHooks {}

/// Collects model declarations before the linking pass
pub struct RegistryBuilder {
    decls: Vec<(String, Vec<Attribute>, Box<dyn ModelHooks>)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self { decls: Vec::new() }
    }

    /// Register a model declaration
    pub fn add(mut self, name: &str, attrs: Vec<Attribute>) -> Self {
        self.decls
            .push((name.to_string(), attrs, Box::new(DefaultHooks)));
        self
    }

    /// Register a model declaration with lifecycle hooks
    pub fn add_with_hooks(
        mut self,
        name: &str,
        attrs: Vec<Attribute>,
        hooks: Box<dyn ModelHooks>,
    ) -> Self {
        self.decls.push((name.to_string(), attrs, hooks));
        self
    }

    /// Build the registry: validate each schema, then link associations.
    ///
    /// Fails fast with `Error::Schema` on any structural problem; nothing
    /// about a malformed declaration is recoverable at runtime.
    pub fn build(self) -> Result<Registry> {
        let mut schemas = BTreeMap::new();
        let mut hooks = BTreeMap::new();

        // Pass one: per-schema invariants
        for (name, attrs, model_hooks) in self.decls {
            if schemas.contains_key(&name) {
                return Err(Error::Schema(format!("duplicate model '{}'", name)));
            }
            let schema = Schema::new(&name, attrs)?;
            schemas.insert(name.clone(), schema);
            hooks.insert(name, model_hooks);
        }

        // Pass two: derive association and reference edges across models
        link_associations(&mut schemas)?;

        Ok(Registry { schemas, hooks })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive forward/reverse edges for every foreign attribute and check that
/// both ends of each `via` relationship agree.
fn link_associations(schemas: &mut BTreeMap<String, Schema>) -> Result<()> {
    enum EdgeOp {
        Assoc(String, AssociationEdge),
        Refer(String, ReferenceEdge),
    }

    let mut ops = Vec::new();

    for (name, schema) in schemas.iter() {
        for attr in schema.attrs() {
            let Some(foreign) = attr.kind.foreign_model() else {
                continue;
            };
            let Some(foreign_schema) = schemas.get(foreign) else {
                return Err(Error::Schema(format!(
                    "{}.{}: unknown model '{}'",
                    name, attr.name, foreign
                )));
            };

            let Some(via) = attr.kind.via() else {
                // No via here; if the other side declares the relationship,
                // its pass covers both ends. Otherwise this is one-directional
                // and the foreign schema records a backlink reference so
                // deletes there can find records pointing in.
                let declared_on_foreign = foreign_schema.attrs().iter().any(|b| {
                    b.kind.foreign_model() == Some(name.as_str())
                        && b.kind.via() == Some(attr.name.as_str())
                });
                if !declared_on_foreign {
                    ops.push(EdgeOp::Refer(
                        foreign.to_string(),
                        ReferenceEdge {
                            model: name.clone(),
                            attr: attr.name.clone(),
                        },
                    ));
                }
                continue;
            };

            let Some(via_attr) = foreign_schema.attr(via) else {
                return Err(Error::Schema(format!(
                    "{}.{}: via target {}.{} does not exist",
                    name, attr.name, foreign, via
                )));
            };
            if via_attr.kind.foreign_model() != Some(name.as_str()) {
                return Err(Error::Schema(format!(
                    "{}.{}: via target {}.{} does not point back to {}",
                    name, attr.name, foreign, via, name
                )));
            }
            if let Some(back) = via_attr.kind.via() {
                if back != attr.name {
                    return Err(Error::Schema(format!(
                        "{}.{}: via target {}.{} points back through '{}', expected '{}'",
                        name, attr.name, foreign, via, back, attr.name
                    )));
                }
            }

            ops.push(EdgeOp::Assoc(
                name.clone(),
                AssociationEdge {
                    attr: attr.name.clone(),
                    model: foreign.to_string(),
                    via: via.to_string(),
                },
            ));
            // When only this side declares `via`, derive the reverse edge
            // so the foreign side maintains the relationship too.
            if via_attr.kind.via().is_none() {
                ops.push(EdgeOp::Assoc(
                    foreign.to_string(),
                    AssociationEdge {
                        attr: via.to_string(),
                        model: name.clone(),
                        via: attr.name.clone(),
                    },
                ));
            }
        }
    }

    for op in ops {
        match op {
            EdgeOp::Assoc(owner, edge) => {
                if let Some(schema) = schemas.get_mut(&owner) {
                    schema.push_association(edge);
                }
            }
            EdgeOp::Refer(owner, edge) => {
                if let Some(schema) = schemas.get_mut(&owner) {
                    schema.push_reference(edge);
                }
            }
        }
    }

    Ok(())
}

/// The built, immutable registry of model schemas
pub struct Registry {
    schemas: BTreeMap<String, Schema>,
    hooks: BTreeMap<String, Box<dyn ModelHooks>>,
}

impl Registry {
    /// Look up a model's schema
    pub fn resolve(&self, model: &str) -> Result<&Schema> {
        self.schemas
            .get(model)
            .ok_or_else(|| Error::Schema(format!("unknown model '{}'", model)))
    }

    /// Lifecycle hooks for a model (no-op defaults when none declared)
    pub fn hooks(&self, model: &str) -> Option<&dyn ModelHooks> {
        self.hooks.get(model).map(|h| h.as_ref())
    }

    /// All declared model names
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Bind a controller for `model` to a storage backend
    pub fn controller<'a>(
        &'a self,
        model: &str,
        storage: &'a dyn StorageBackend,
    ) -> Result<Controller<'a>> {
        let schema = self.resolve(model)?;
        Ok(Controller::new(schema, self, storage))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Direction;
    use crate::value::ValueType;

    fn target_attrs() -> Vec<Attribute> {
        vec![
            Attribute::scalar("name", ValueType::Str).primary_key(),
            Attribute::foreign_many("experiments", "Experiment", "target")
                .direction(Direction::Down),
        ]
    }

    fn experiment_attrs() -> Vec<Attribute> {
        vec![
            Attribute::scalar("name", ValueType::Str).primary_key(),
            Attribute::foreign_one("target", "Target")
                .via("experiments")
                .required()
                .direction(Direction::Up),
        ]
    }

    #[test]
    fn test_two_pass_linking_resolves_forward_references() {
        // Target is declared first but references Experiment, which only
        // exists after the second add; linking happens at build time.
        let registry = RegistryBuilder::new()
            .add("Target", target_attrs())
            .add("Experiment", experiment_attrs())
            .build()
            .unwrap();

        let target = registry.resolve("Target").unwrap();
        assert_eq!(
            target.associations(),
            &[AssociationEdge {
                attr: "experiments".to_string(),
                model: "Experiment".to_string(),
                via: "target".to_string(),
            }]
        );

        let experiment = registry.resolve("Experiment").unwrap();
        assert_eq!(
            experiment.associations(),
            &[AssociationEdge {
                attr: "target".to_string(),
                model: "Target".to_string(),
                via: "experiments".to_string(),
            }]
        );
    }

    #[test]
    fn test_one_sided_via_derives_reverse_association() {
        // Experiment declares via, Target's backlink attribute does not:
        // the reverse association must still be derived for Target.
        let registry = RegistryBuilder::new()
            .add(
                "Target",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    Attribute::foreign_many("experiments", "Experiment", "target"),
                ],
            )
            .add(
                "Experiment",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    // No .via() here: Target's declaration carries it
                    Attribute::foreign_one("target", "Target"),
                ],
            )
            .build()
            .unwrap();

        let experiment = registry.resolve("Experiment").unwrap();
        assert_eq!(experiment.associations().len(), 1);
        assert_eq!(experiment.associations()[0].via, "experiments");
    }

    #[test]
    fn test_no_via_records_reference() {
        let registry = RegistryBuilder::new()
            .add(
                "Target",
                vec![Attribute::scalar("name", ValueType::Str).primary_key()],
            )
            .add(
                "Note",
                vec![
                    Attribute::scalar("body", ValueType::Str).primary_key(),
                    Attribute::foreign_one("subject", "Target"),
                ],
            )
            .build()
            .unwrap();

        let target = registry.resolve("Target").unwrap();
        assert_eq!(
            target.references(),
            &[ReferenceEdge {
                model: "Note".to_string(),
                attr: "subject".to_string(),
            }]
        );
        assert!(target.associations().is_empty());
    }

    #[test]
    fn test_missing_via_target_fails() {
        let err = RegistryBuilder::new()
            .add(
                "Target",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    Attribute::foreign_many("experiments", "Experiment", "nonexistent"),
                ],
            )
            .add(
                "Experiment",
                vec![Attribute::scalar("name", ValueType::Str).primary_key()],
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_via_target_must_point_back() {
        let err = RegistryBuilder::new()
            .add(
                "Target",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    Attribute::foreign_many("experiments", "Experiment", "other"),
                ],
            )
            .add(
                "Experiment",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    Attribute::foreign_one("other", "Measurement"),
                ],
            )
            .add(
                "Measurement",
                vec![Attribute::scalar("name", ValueType::Str).primary_key()],
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_disagreeing_via_edges_fail() {
        let err = RegistryBuilder::new()
            .add(
                "Target",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    Attribute::foreign_many("experiments", "Experiment", "target"),
                ],
            )
            .add(
                "Experiment",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    // Points back through the wrong attribute name
                    Attribute::foreign_one("target", "Target").via("trials"),
                ],
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_unknown_foreign_model_fails() {
        let err = RegistryBuilder::new()
            .add(
                "Experiment",
                vec![
                    Attribute::scalar("name", ValueType::Str).primary_key(),
                    Attribute::foreign_one("target", "Target"),
                ],
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_duplicate_model_fails() {
        let err = RegistryBuilder::new()
            .add(
                "Target",
                vec![Attribute::scalar("name", ValueType::Str).primary_key()],
            )
            .add(
                "Target",
                vec![Attribute::scalar("name", ValueType::Str).primary_key()],
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
