//! Type descriptors: the declared shape of nodes and relationships

use crate::codec::PropertyCodec;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Set of labels carried by a node, compared as a set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        self.0.insert(label.into())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn is_subset(&self, other: &LabelSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.iter().collect();
        write!(f, "{{{}}}", labels.join(", "))
    }
}

/// Index intent declared on a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexIntent {
    #[default]
    None,
    Index,
    Unique,
}

/// A declared property
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    /// Name used in storage when it differs from `name`
    pub db_name: Option<String>,
    pub codec: Arc<dyn PropertyCodec>,
    pub required: bool,
    pub default: Option<Value>,
    pub index: IndexIntent,
    /// Part of the key used by get-or-create merges
    pub merge_key: bool,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, codec: impl PropertyCodec + 'static) -> Self {
        Self {
            name: name.into(),
            db_name: None,
            codec: Arc::new(codec),
            required: false,
            default: None,
            index: IndexIntent::None,
            merge_key: false,
        }
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = Some(db_name.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = IndexIntent::Index;
        self
    }

    pub fn unique(mut self) -> Self {
        self.index = IndexIntent::Unique;
        self
    }

    pub fn merge_key(mut self) -> Self {
        self.merge_key = true;
        self
    }

    pub fn storage_name(&self) -> &str {
        self.db_name.as_deref().unwrap_or(&self.name)
    }

    /// Static default, falling back to a codec-generated value
    pub fn default_value(&self) -> Option<Value> {
        self.default.clone().or_else(|| self.codec.generate())
    }
}

/// Direction of a declared relationship, seen from the declaring type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Either,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
            Direction::Either => Direction::Either,
        }
    }
}

/// Declared bound on the number of relationships
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    ZeroOrMore,
    AtMostOne,
    AtLeastOne,
    ExactlyOne,
}

impl Cardinality {
    /// Inclusive (min, max) bounds; `None` means unbounded
    pub fn bounds(self) -> (usize, Option<usize>) {
        match self {
            Cardinality::ZeroOrMore => (0, None),
            Cardinality::AtMostOne => (0, Some(1)),
            Cardinality::AtLeastOne => (1, None),
            Cardinality::ExactlyOne => (1, Some(1)),
        }
    }

    pub fn allows(self, count: usize) -> bool {
        let (min, max) = self.bounds();
        count >= min && max.map_or(true, |max| count <= max)
    }
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Cardinality::ZeroOrMore => "zero or more",
            Cardinality::AtMostOne => "at most one",
            Cardinality::AtLeastOne => "at least one",
            Cardinality::ExactlyOne => "exactly one",
        };
        write!(f, "{}", name)
    }
}

/// How a lower bound is enforced on disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    #[default]
    Strict,
    Soft,
}

/// A named relationship declared on a node type
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDef {
    pub name: String,
    /// Names of the accepted target types
    pub targets: Vec<String>,
    pub rel_type: String,
    pub direction: Direction,
    pub cardinality: Cardinality,
    pub enforcement: Enforcement,
    /// Name of the relationship type carrying properties, if any
    pub model: Option<String>,
}

impl RelationshipDef {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        rel_type: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            name: name.into(),
            targets: vec![target.into()],
            rel_type: rel_type.into(),
            direction,
            cardinality: Cardinality::ZeroOrMore,
            enforcement: Enforcement::Strict,
            model: None,
        }
    }

    /// Outgoing relationship
    pub fn to(name: impl Into<String>, target: impl Into<String>, rel_type: impl Into<String>) -> Self {
        Self::new(name, target, rel_type, Direction::Outgoing)
    }

    /// Incoming relationship
    pub fn from(name: impl Into<String>, target: impl Into<String>, rel_type: impl Into<String>) -> Self {
        Self::new(name, target, rel_type, Direction::Incoming)
    }

    /// Relationship matched in either direction
    pub fn either(name: impl Into<String>, target: impl Into<String>, rel_type: impl Into<String>) -> Self {
        Self::new(name, target, rel_type, Direction::Either)
    }

    pub fn or_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn soft(mut self) -> Self {
        self.enforcement = Enforcement::Soft;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Entity type descriptor
///
/// The label set is the ancestor labels plus the type's own label.
/// `extends` copies the parent's properties and relationships by value;
/// declarations added afterwards with the same name replace inherited ones.
#[derive(Debug, Clone)]
pub struct NodeType {
    pub name: String,
    pub label: String,
    pub ancestors: Vec<String>,
    pub optional_labels: Vec<String>,
    properties: Vec<PropertyDef>,
    relationships: Vec<RelationshipDef>,
}

impl NodeType {
    /// New type whose label equals its name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            ancestors: Vec::new(),
            optional_labels: Vec::new(),
            properties: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn extends(mut self, parent: &NodeType) -> Self {
        let mut ancestors = parent.ancestors.clone();
        ancestors.push(parent.label.clone());
        ancestors.retain(|label| !self.ancestors.contains(label));
        self.ancestors.extend(ancestors);
        for property in &parent.properties {
            if self.property(&property.name).is_none() {
                self.properties.push(property.clone());
            }
        }
        for relationship in &parent.relationships {
            if self.relationship(&relationship.name).is_none() {
                self.relationships.push(relationship.clone());
            }
        }
        self
    }

    pub fn with_optional_label(mut self, label: impl Into<String>) -> Self {
        self.optional_labels.push(label.into());
        self
    }

    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.retain(|p| p.name != property.name);
        self.properties.push(property);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipDef) -> Self {
        self.relationships.retain(|r| r.name != relationship.name);
        self.relationships.push(relationship);
        self
    }

    /// Mandatory labels: ancestors plus own label
    pub fn labels(&self) -> LabelSet {
        self.ancestors
            .iter()
            .cloned()
            .chain(std::iter::once(self.label.clone()))
            .collect()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label == label || self.ancestors.iter().any(|a| a == label)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_by_storage_name(&self, db_name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.storage_name() == db_name)
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDef> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn relationships(&self) -> &[RelationshipDef] {
        &self.relationships
    }

    /// Default variable name used in compiled queries
    pub fn variable(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Relationship type descriptor, bound to a single relationship label
#[derive(Debug, Clone)]
pub struct RelationshipType {
    pub name: String,
    pub rel_type: String,
    /// Names of the descriptors this one extends, nearest last
    pub ancestors: Vec<String>,
    properties: Vec<PropertyDef>,
}

impl RelationshipType {
    pub fn new(name: impl Into<String>, rel_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rel_type: rel_type.into(),
            ancestors: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Subtype bound to the parent's label
    pub fn extends(mut self, parent: &RelationshipType) -> Self {
        self.rel_type = parent.rel_type.clone();
        self.ancestors = parent.ancestors.clone();
        self.ancestors.push(parent.name.clone());
        for property in &parent.properties {
            if self.property(&property.name).is_none() {
                self.properties.push(property.clone());
            }
        }
        self
    }

    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.retain(|p| p.name != property.name);
        self.properties.push(property);
        self
    }

    pub fn is_subtype_of(&self, name: &str) -> bool {
        self.ancestors.iter().any(|a| a == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_by_storage_name(&self, db_name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.storage_name() == db_name)
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DateTimeCodec, FloatCodec, StringCodec};

    fn coffee() -> NodeType {
        NodeType::new("Coffee")
            .with_property(PropertyDef::new("name", StringCodec::new()).unique())
            .with_property(PropertyDef::new("price", FloatCodec))
            .with_relationship(RelationshipDef::from("suppliers", "Supplier", "COFFEE SUPPLIERS"))
    }

    #[test]
    fn test_label_set_is_unordered() {
        let a: LabelSet = ["Coffee", "Arabica"].into_iter().collect();
        let b: LabelSet = ["Arabica", "Coffee"].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "{Arabica, Coffee}");
    }

    #[test]
    fn test_extends_merges_by_value() {
        let arabica = NodeType::new("Arabica")
            .extends(&coffee())
            .with_property(PropertyDef::new("price", StringCodec::new()));

        assert_eq!(arabica.labels(), ["Coffee", "Arabica"].into_iter().collect());
        assert!(arabica.has_label("Coffee"));
        assert!(arabica.relationship("suppliers").is_some());
        assert_eq!(arabica.properties().len(), 2);
        assert_eq!(arabica.property("price").unwrap().codec.kind(), "string");
        assert_eq!(coffee().property("price").unwrap().codec.kind(), "float");
    }

    #[test]
    fn test_cardinality_bounds() {
        assert!(Cardinality::ZeroOrMore.allows(10));
        assert!(Cardinality::AtMostOne.allows(0));
        assert!(!Cardinality::AtMostOne.allows(2));
        assert!(!Cardinality::AtLeastOne.allows(0));
        assert!(!Cardinality::ExactlyOne.allows(2));
        assert!(Cardinality::ExactlyOne.allows(1));
    }

    #[test]
    fn test_relationship_subtype() {
        let base = RelationshipType::new("SupplierRel", "COFFEE SUPPLIERS")
            .with_property(PropertyDef::new("since", StringCodec::new()));
        let express = RelationshipType::new("ExpressSupplierRel", "ignored").extends(&base);

        assert_eq!(express.rel_type, "COFFEE SUPPLIERS");
        assert!(express.is_subtype_of("SupplierRel"));
        assert!(express.property("since").is_some());
    }

    #[test]
    fn test_relationship_subtype_keeps_own_properties() {
        let base = RelationshipType::new("SupplierRel", "COFFEE SUPPLIERS")
            .with_property(PropertyDef::new("since", StringCodec::new()))
            .with_property(PropertyDef::new("volume", FloatCodec));
        let express = RelationshipType::new("ExpressSupplierRel", "ignored")
            .with_property(PropertyDef::new("since", DateTimeCodec))
            .extends(&base);

        assert_eq!(express.properties().len(), 2);
        assert_eq!(express.property("since").unwrap().codec.kind(), "datetime");
        assert_eq!(express.property("volume").unwrap().codec.kind(), "float");
    }
}
