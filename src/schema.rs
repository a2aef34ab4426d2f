//! Model schemas - attribute descriptors and association edges
//!
//! A schema declares, per model, the ordered attribute list: scalar type or
//! foreign reference, required/default/unique/primary-key flags, replication
//! direction, and compatibility rules. Association edges between schemas are
//! derived by the registry's second pass, never declared twice.

use crate::value::{Value, ValueType};
use crate::{Error, Result};

/// Replication direction of an association edge.
///
/// `Up` points toward prerequisites (records the owner cannot exist
/// without); `Down` points toward dependents. Push/pull traversal follows
/// only direction-tagged edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an attribute holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrKind {
    /// Plain typed value
    Scalar(ValueType),
    /// Single foreign key into `model`; `via` names the backlink attribute
    /// on the foreign schema when the relationship is bidirectional
    ForeignOne { model: String, via: Option<String> },
    /// Set of foreign keys into `model`; collections always name their
    /// backlink attribute
    ForeignMany { model: String, via: String },
}

impl AttrKind {
    /// The foreign model this attribute points at, if any
    pub fn foreign_model(&self) -> Option<&str> {
        match self {
            AttrKind::Scalar(_) => None,
            AttrKind::ForeignOne { model, .. } | AttrKind::ForeignMany { model, .. } => {
                Some(model)
            }
        }
    }

    /// The declared backlink attribute name, if any
    pub fn via(&self) -> Option<&str> {
        match self {
            AttrKind::Scalar(_) => None,
            AttrKind::ForeignOne { via, .. } => via.as_deref(),
            AttrKind::ForeignMany { via, .. } => Some(via),
        }
    }

    pub fn is_foreign(&self) -> bool {
        !matches!(self, AttrKind::Scalar(_))
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, AttrKind::ForeignMany { .. })
    }
}

/// Boolean test over a single field value
pub type Predicate = fn(&Value) -> bool;

/// When a compatibility rule fires: the attribute's current value equals
/// the literal, or satisfies the predicate.
#[derive(Clone)]
pub enum Trigger {
    Literal(Value),
    When(Predicate),
}

impl Trigger {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Trigger::Literal(expected) => value == expected,
            Trigger::When(pred) => pred(value),
        }
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Literal(v) => write!(f, "Literal({})", v),
            Trigger::When(_) => write!(f, "When(<predicate>)"),
        }
    }
}

/// The four compatibility constraint kinds. `Require`/`Exclude` violations
/// abort the enclosing operation; `Encourage`/`Discourage` are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Require,
    Encourage,
    Discourage,
    Exclude,
}

impl ConstraintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintKind::Require => "require",
            ConstraintKind::Encourage => "encourage",
            ConstraintKind::Discourage => "discourage",
            ConstraintKind::Exclude => "exclude",
        }
    }

    /// True for the kinds whose violation is a fatal error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConstraintKind::Require | ConstraintKind::Exclude)
    }
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the target attribute is expected to look like. Absent means mere
/// presence of the attribute satisfies the constraint.
#[derive(Clone)]
pub enum Expected {
    Literal(Value),
    Check(Predicate),
}

impl Expected {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Expected::Literal(expected) => value == expected,
            Expected::Check(pred) => pred(value),
        }
    }
}

impl std::fmt::Debug for Expected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expected::Literal(v) => write!(f, "Literal({})", v),
            Expected::Check(_) => write!(f, "Check(<predicate>)"),
        }
    }
}

/// One constraint against an associated record of `model`
#[derive(Debug, Clone)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub model: String,
    pub attr: String,
    pub expected: Option<Expected>,
}

impl Constraint {
    pub fn new(kind: ConstraintKind, model: &str, attr: &str) -> Self {
        Self {
            kind,
            model: model.to_string(),
            attr: attr.to_string(),
            expected: None,
        }
    }

    pub fn expecting(mut self, expected: Expected) -> Self {
        self.expected = Some(expected);
        self
    }
}

/// A compatibility rule: when `trigger` matches the declaring attribute's
/// current value, every constraint is checked against associated records.
#[derive(Debug, Clone)]
pub struct CompatRule {
    pub trigger: Trigger,
    pub constraints: Vec<Constraint>,
}

impl CompatRule {
    pub fn new(trigger: Trigger, constraints: Vec<Constraint>) -> Self {
        Self {
            trigger,
            constraints,
        }
    }
}

/// One attribute descriptor
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub kind: AttrKind,
    pub required: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub default: Option<Value>,
    pub direction: Option<Direction>,
    pub compat: Vec<CompatRule>,
}

impl Attribute {
    fn base(name: &str, kind: AttrKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            unique: false,
            primary_key: false,
            default: None,
            direction: None,
            compat: Vec::new(),
        }
    }

    /// Declare a scalar attribute
    pub fn scalar(name: &str, value_type: ValueType) -> Self {
        Self::base(name, AttrKind::Scalar(value_type))
    }

    /// Declare a single foreign reference (one-directional until `.via()`)
    pub fn foreign_one(name: &str, model: &str) -> Self {
        Self::base(
            name,
            AttrKind::ForeignOne {
                model: model.to_string(),
                via: None,
            },
        )
    }

    /// Declare a foreign collection; collections always name their backlink
    pub fn foreign_many(name: &str, model: &str, via: &str) -> Self {
        Self::base(
            name,
            AttrKind::ForeignMany {
                model: model.to_string(),
                via: via.to_string(),
            },
        )
    }

    /// Name the backlink attribute on the foreign schema
    pub fn via(mut self, via: &str) -> Self {
        if let AttrKind::ForeignOne { via: slot, .. } = &mut self.kind {
            *slot = Some(via.to_string());
        }
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn compat(mut self, rule: CompatRule) -> Self {
        self.compat.push(rule);
        self
    }
}

/// A derived forward association: local `attr` points at `model`, whose
/// `via` attribute points back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationEdge {
    pub attr: String,
    pub model: String,
    pub via: String,
}

/// A derived one-directional backlink: `model.attr` points at this schema
/// but this schema carries no field for the relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEdge {
    pub model: String,
    pub attr: String,
}

/// A model's validated schema. Constructed by the registry, immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    table: String,
    attrs: Vec<Attribute>,
    associations: Vec<AssociationEdge>,
    references: Vec<ReferenceEdge>,
}

impl Schema {
    /// Validate the single-schema invariants and build. Association edges
    /// are wired by the registry's second pass.
    pub fn new(name: &str, attrs: Vec<Attribute>) -> Result<Self> {
        let mut primary = None;
        for attr in &attrs {
            if attr.primary_key {
                if let Some(first) = &primary {
                    return Err(Error::Schema(format!(
                        "{}: multiple primary keys ({} and {})",
                        name, first, attr.name
                    )));
                }
                primary = Some(attr.name.clone());
                if attr.kind.is_foreign() {
                    return Err(Error::Schema(format!(
                        "{}.{}: primary key must be a scalar",
                        name, attr.name
                    )));
                }
            }
            if attr.unique && attr.kind.is_foreign() {
                return Err(Error::Schema(format!(
                    "{}.{}: unique is only valid on scalar attributes",
                    name, attr.name
                )));
            }
            if let Some(default) = &attr.default {
                if let AttrKind::Scalar(vt) = &attr.kind {
                    if default.value_type() != *vt {
                        return Err(Error::Schema(format!(
                            "{}.{}: default {} does not match declared type {}",
                            name, attr.name, default, vt
                        )));
                    }
                }
            }
        }
        if primary.is_none() {
            return Err(Error::Schema(format!(
                "{}: exactly one attribute must be the primary key",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            table: name.to_lowercase(),
            attrs,
            associations: Vec::new(),
            references: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend table holding this model's records
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn primary_key(&self) -> &Attribute {
        // Schema::new guarantees exactly one
        self.attrs
            .iter()
            .find(|a| a.primary_key)
            .unwrap_or(&self.attrs[0])
    }

    /// Attributes whose values must be unique across the table
    pub fn unique_attrs(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter().filter(|a| a.unique)
    }

    pub fn associations(&self) -> &[AssociationEdge] {
        &self.associations
    }

    pub fn references(&self) -> &[ReferenceEdge] {
        &self.references
    }

    pub(crate) fn push_association(&mut self, edge: AssociationEdge) {
        if !self.associations.contains(&edge) {
            self.associations.push(edge);
        }
    }

    pub(crate) fn push_reference(&mut self, edge: ReferenceEdge) {
        if !self.references.contains(&edge) {
            self.references.push(edge);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_requires_single_primary_key() {
        let err = Schema::new(
            "Target",
            vec![Attribute::scalar("name", ValueType::Str)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));

        let err = Schema::new(
            "Target",
            vec![
                Attribute::scalar("name", ValueType::Str).primary_key(),
                Attribute::scalar("host", ValueType::Str).primary_key(),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_unique_rejected_on_foreign() {
        let mut attr = Attribute::foreign_one("target", "Target");
        attr.unique = true;
        let err = Schema::new(
            "Experiment",
            vec![
                Attribute::scalar("name", ValueType::Str).primary_key(),
                attr,
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_default_type_mismatch() {
        let err = Schema::new(
            "Target",
            vec![
                Attribute::scalar("name", ValueType::Str).primary_key(),
                Attribute::scalar("jobs", ValueType::Int).default_value(Value::from("four")),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_attribute_builder() {
        let attr = Attribute::foreign_one("target", "Target")
            .via("experiments")
            .required()
            .direction(Direction::Up);

        assert_eq!(attr.kind.foreign_model(), Some("Target"));
        assert_eq!(attr.kind.via(), Some("experiments"));
        assert!(attr.required);
        assert_eq!(attr.direction, Some(Direction::Up));
    }

    #[test]
    fn test_trigger_and_expected() {
        let trigger = Trigger::Literal(Value::from("gcc"));
        assert!(trigger.matches(&Value::from("gcc")));
        assert!(!trigger.matches(&Value::from("clang")));

        let when = Trigger::When(|v| v.as_int().is_some_and(|n| n > 4));
        assert!(when.matches(&Value::Int(8)));
        assert!(!when.matches(&Value::Int(2)));

        let expected = Expected::Check(|v| v.as_bool() == Some(true));
        assert!(expected.matches(&Value::Bool(true)));
    }
}
