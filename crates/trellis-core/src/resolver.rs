//! Result resolution: raw driver rows back to typed entities
//!
//! Node cells are resolved through [`Registry::resolve`] on their label set
//! and decoded with the resolved type's codecs. Relationship cells use the
//! bound relationship type when there is one and stay generic otherwise.
//! Scalars pass through under their column name.

use crate::compiler::{ColumnKind, ResultShape};
use crate::descriptor::{LabelSet, NodeType, PropertyDef, RelationshipType};
use crate::driver::{QueryOutput, RawNode, RawRelationship, RawValue};
use crate::error::{Error, Result};
use crate::path::PathMode;
use crate::registry::Registry;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Typed entity
#[derive(Debug, Clone)]
pub struct Entity {
    pub element_id: String,
    pub labels: LabelSet,
    pub node_type: Arc<NodeType>,
    /// Decoded values keyed by declared name; undeclared raw properties pass through
    pub properties: BTreeMap<String, Value>,
}

impl Entity {
    pub fn type_name(&self) -> &str {
        &self.node_type.name
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.element_id == other.element_id
            && self.labels == other.labels
            && self.node_type.name == other.node_type.name
            && self.properties == other.properties
    }
}

/// Relationship, typed when its label has a bound model
#[derive(Debug, Clone)]
pub struct Relationship {
    pub element_id: String,
    pub rel_type: String,
    pub start_id: String,
    pub end_id: String,
    pub model: Option<Arc<RelationshipType>>,
    pub properties: BTreeMap<String, Value>,
}

impl Relationship {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).filter(|v| !v.is_null())
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_ref().map(|m| m.name.as_str())
    }
}

impl PartialEq for Relationship {
    fn eq(&self, other: &Self) -> bool {
        self.element_id == other.element_id
            && self.rel_type == other.rel_type
            && self.start_id == other.start_id
            && self.end_id == other.end_id
            && self.properties == other.properties
    }
}

/// One resolved cell
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Entity(Entity),
    Relationship(Relationship),
    Value(Value),
    List(Vec<Resolved>),
    Map(BTreeMap<String, Resolved>),
}

impl Resolved {
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Resolved::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            Resolved::Relationship(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Resolved::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Resolved]> {
        match self {
            Resolved::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Resolved::Value(Value::Null))
    }
}

/// Resolved cells of one row, in column order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRow {
    cells: Vec<(String, Resolved)>,
}

impl ResolvedRow {
    pub fn get(&self, column: &str) -> Option<&Resolved> {
        self.cells.iter().find(|(name, _)| name == column).map(|(_, r)| r)
    }

    pub fn entity(&self, column: &str) -> Option<&Entity> {
        self.get(column).and_then(Resolved::as_entity)
    }

    pub fn relationship(&self, column: &str) -> Option<&Relationship> {
        self.get(column).and_then(Resolved::as_relationship)
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.get(column).and_then(Resolved::as_value)
    }

    pub fn take_entity(self, column: &str) -> Option<Entity> {
        self.cells.into_iter().find_map(|(name, cell)| match cell {
            Resolved::Entity(e) if name == column => Some(e),
            _ => None,
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Mapping from a resolved entity to an application type
pub trait FromEntity: Sized {
    fn from_entity(entity: &Entity) -> Result<Self>;
}

/// Edge of a subgraph between two resolved entities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphEdge {
    /// Path alias or hop chain that produced the child
    pub key: String,
    pub parent_id: String,
    pub child_id: String,
    pub relationship_id: Option<String>,
}

/// Root entity with its traversed neighbours
///
/// `neighbors` and `relationships` are side tables keyed by path alias (or
/// hop chain), each entity appearing once however many rows reached it.
/// `edges` records which parent reached which child.
#[derive(Debug, Clone, PartialEq)]
pub struct Subgraph {
    pub root: Entity,
    pub neighbors: BTreeMap<String, Vec<Entity>>,
    pub relationships: BTreeMap<String, Vec<Relationship>>,
    pub edges: Vec<SubgraphEdge>,
}

impl Subgraph {
    fn new(root: Entity) -> Self {
        Self {
            root,
            neighbors: BTreeMap::new(),
            relationships: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn neighbors(&self, key: &str) -> &[Entity] {
        self.neighbors.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn relationships(&self, key: &str) -> &[Relationship] {
        self.relationships.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Entities reached from `parent_id` along `key`
    pub fn children(&self, parent_id: &str, key: &str) -> Vec<&Entity> {
        let neighbors = self.neighbors(key);
        self.edges
            .iter()
            .filter(|e| e.key == key && e.parent_id == parent_id)
            .filter_map(|e| neighbors.iter().find(|n| n.element_id == e.child_id))
            .collect()
    }
}

/// Traversal column located in a raw output
struct NodeColumn<'a> {
    index: usize,
    key: &'a str,
    parent: Option<usize>,
    relationship: Option<usize>,
}

/// Maps raw rows to typed results against a registry
pub struct Resolver<'r> {
    registry: &'r Registry,
}

impl<'r> Resolver<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Resolve a node through its label set, most specific type first
    pub fn entity(&self, raw: &RawNode) -> Result<Entity> {
        let labels: LabelSet = raw.labels.iter().cloned().collect();
        let node_type = match self.registry.resolve(&labels) {
            Ok(node_type) => node_type,
            Err(Error::UnknownType { .. }) => {
                return Err(Error::UnresolvedEntity {
                    labels,
                    registry: self.registry.snapshot()?,
                });
            }
            Err(e) => return Err(e),
        };
        let properties = decode_properties(node_type.properties(), &raw.properties)?;
        Ok(Entity {
            element_id: raw.element_id.clone(),
            labels,
            node_type,
            properties,
        })
    }

    pub fn relationship(&self, raw: &RawRelationship) -> Result<Relationship> {
        let model = self.registry.resolve_relationship(&raw.rel_type)?;
        let properties = match &model {
            Some(model) => decode_properties(model.properties(), &raw.properties)?,
            None => raw.properties.clone(),
        };
        Ok(Relationship {
            element_id: raw.element_id.clone(),
            rel_type: raw.rel_type.clone(),
            start_id: raw.start_id.clone(),
            end_id: raw.end_id.clone(),
            model,
            properties,
        })
    }

    /// Resolve any cell, descending into lists and maps
    pub fn value(&self, raw: &RawValue) -> Result<Resolved> {
        Ok(match raw {
            RawValue::Value(v) => Resolved::Value(v.clone()),
            RawValue::Node(node) => Resolved::Entity(self.entity(node)?),
            RawValue::Relationship(rel) => Resolved::Relationship(self.relationship(rel)?),
            RawValue::List(items) => {
                Resolved::List(items.iter().map(|i| self.value(i)).collect::<Result<_>>()?)
            }
            RawValue::Map(entries) => Resolved::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.value(v)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Resolve every row; columns the shape declares as nodes must hold nodes or null
    pub fn resolve(&self, output: &QueryOutput, shape: &ResultShape) -> Result<Vec<ResolvedRow>> {
        let mut rows = Vec::with_capacity(output.rows.len());
        for raw_row in &output.rows {
            if raw_row.len() != output.columns.len() {
                return Err(Error::Resolution(format!(
                    "row has {} cells for {} columns",
                    raw_row.len(),
                    output.columns.len()
                )));
            }
            let mut cells = Vec::with_capacity(raw_row.len());
            for (name, raw) in output.columns.iter().zip(raw_row) {
                let kind = shape.column(name).map(|c| &c.kind);
                let cell = match (kind, raw) {
                    (Some(ColumnKind::Root | ColumnKind::Node { .. }), RawValue::Node(node)) => {
                        Resolved::Entity(self.entity(node)?)
                    }
                    (Some(ColumnKind::Relationship { .. }), RawValue::Relationship(rel)) => {
                        Resolved::Relationship(self.relationship(rel)?)
                    }
                    (Some(ColumnKind::Projection) | None, other) => self.value(other)?,
                    (Some(_), other) if other.is_null() => Resolved::Value(Value::Null),
                    (Some(_), other) => {
                        return Err(Error::Resolution(format!(
                            "column {} holds a {} where an entity or relationship was expected",
                            name,
                            other.kind()
                        )));
                    }
                };
                cells.push((name.clone(), cell));
            }
            rows.push(ResolvedRow { cells });
        }
        tracing::debug!("Resolved {} rows over {} columns", rows.len(), output.columns.len());
        Ok(rows)
    }

    /// Resolve the root column of every row into `T`
    pub fn resolve_as<T: FromEntity>(&self, output: &QueryOutput, shape: &ResultShape) -> Result<Vec<T>> {
        let root = shape
            .root
            .as_deref()
            .ok_or_else(|| Error::Resolution("result has no root column".to_string()))?;
        self.resolve(output, shape)?
            .iter()
            .map(|row| {
                let entity = row
                    .entity(root)
                    .ok_or_else(|| Error::Resolution(format!("row has no entity in column {}", root)))?;
                T::from_entity(entity)
            })
            .collect()
    }

    /// Rebuild one subgraph per distinct root entity
    pub fn resolve_subgraph(&self, output: &QueryOutput, shape: &ResultShape) -> Result<Vec<Subgraph>> {
        if shape.mode == Some(PathMode::FilterOnly) {
            return Err(Error::Resolution(
                "filter-only traversals return no subgraph".to_string(),
            ));
        }
        let root_name = shape
            .root
            .as_deref()
            .ok_or_else(|| Error::Resolution("result has no root column".to_string()))?;
        let root_index = column_index(output, root_name)?;

        let mut columns = Vec::new();
        for column in &shape.columns {
            if let ColumnKind::Node {
                key,
                parent,
                relationship,
                ..
            } = &column.kind
            {
                columns.push(NodeColumn {
                    index: column_index(output, &column.name)?,
                    key,
                    parent: parent.as_deref().map(|p| column_index(output, p)).transpose()?,
                    relationship: relationship
                        .as_deref()
                        .map(|r| column_index(output, r))
                        .transpose()?,
                });
            }
        }
        if columns.is_empty() {
            return Err(Error::Resolution("result has no traversal columns".to_string()));
        }

        let mut graphs: Vec<Subgraph> = Vec::new();
        let mut by_root: HashMap<String, usize> = HashMap::new();

        for row in &output.rows {
            if row.len() != output.columns.len() {
                return Err(Error::Resolution(format!(
                    "row has {} cells for {} columns",
                    row.len(),
                    output.columns.len()
                )));
            }
            let RawValue::Node(raw_root) = &row[root_index] else {
                return Err(Error::Resolution(format!(
                    "root column {} holds a {}",
                    root_name,
                    row[root_index].kind()
                )));
            };
            let slot = match by_root.get(&raw_root.element_id) {
                Some(slot) => *slot,
                None => {
                    graphs.push(Subgraph::new(self.entity(raw_root)?));
                    by_root.insert(raw_root.element_id.clone(), graphs.len() - 1);
                    graphs.len() - 1
                }
            };
            let graph = &mut graphs[slot];

            for column in &columns {
                let RawValue::Node(raw) = &row[column.index] else {
                    continue;
                };
                let parent_id = match column.parent {
                    None => raw_root.element_id.clone(),
                    Some(index) => match &row[index] {
                        RawValue::Node(parent) => parent.element_id.clone(),
                        _ => continue,
                    },
                };

                let neighbors = graph.neighbors.entry(column.key.to_string()).or_default();
                if !neighbors.iter().any(|n| n.element_id == raw.element_id) {
                    neighbors.push(self.entity(raw)?);
                }

                let mut relationship_id = None;
                if let Some(RawValue::Relationship(rel)) = column.relationship.map(|i| &row[i]) {
                    let rels = graph.relationships.entry(column.key.to_string()).or_default();
                    if !rels.iter().any(|r| r.element_id == rel.element_id) {
                        rels.push(self.relationship(rel)?);
                    }
                    relationship_id = Some(rel.element_id.clone());
                }

                let edge = SubgraphEdge {
                    key: column.key.to_string(),
                    parent_id,
                    child_id: raw.element_id.clone(),
                    relationship_id,
                };
                if !graph.edges.contains(&edge) {
                    graph.edges.push(edge);
                }
            }
        }
        tracing::debug!("Resolved {} subgraphs from {} rows", graphs.len(), output.rows.len());
        Ok(graphs)
    }
}

fn column_index(output: &QueryOutput, name: &str) -> Result<usize> {
    output
        .column_index(name)
        .ok_or_else(|| Error::Resolution(format!("result has no column {}", name)))
}

/// Decode stored values by storage name; missing declared values take their static default
fn decode_properties(defs: &[PropertyDef], raw: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
    let mut decoded = BTreeMap::new();
    for def in defs {
        let value = match raw.get(def.storage_name()) {
            Some(stored) => def.codec.decode(stored).map_err(|e| Error::Decode {
                property: def.name.clone(),
                message: e.message,
            })?,
            None => def.default.clone().unwrap_or_default(),
        };
        decoded.insert(def.name.clone(), value);
    }
    for (key, value) in raw {
        if !defs.iter().any(|d| d.storage_name() == key) {
            decoded.insert(key.clone(), value.clone());
        }
    }
    Ok(decoded)
}

/// First item, if any
pub fn first<T>(items: Vec<T>) -> Option<T> {
    items.into_iter().next()
}

/// The only item; `Ok(None)` when empty, an error when there are several
pub fn single<T>(items: Vec<T>) -> Result<Option<T>> {
    if items.len() > 1 {
        return Err(Error::MultipleResults(items.len()));
    }
    Ok(items.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DateTimeCodec, IntegerCodec, StringCodec};
    use crate::compiler::Compiler;
    use crate::descriptor::RelationshipDef;
    use crate::path::TraverseOptions;
    use crate::plan::QueryPlan;

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        let person = NodeType::new("Person")
            .with_property(PropertyDef::new("name", StringCodec::new()))
            .with_property(PropertyDef::new("age", IntegerCodec).with_db_name("years"))
            .with_property(PropertyDef::new("status", StringCodec::new()).with_default("active"))
            .with_relationship(RelationshipDef::to("friends", "Person", "FRIEND"));
        let employee = NodeType::new("Employee")
            .extends(&person)
            .with_property(PropertyDef::new("badge", StringCodec::new()));
        registry.register(person).unwrap();
        registry.register(employee).unwrap();
        registry
            .register_relationship(
                RelationshipType::new("Friendship", "FRIEND")
                    .with_property(PropertyDef::new("since", DateTimeCodec)),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn person(id: &str, name: &str) -> RawNode {
        RawNode::new(id, ["Person"]).with_property("name", name)
    }

    #[test]
    fn test_most_specific_type() {
        let registry = registry();
        let resolver = Resolver::new(&registry);

        let raw = RawNode::new("e1", ["Person", "Employee"])
            .with_property("name", "Ada")
            .with_property("years", 36)
            .with_property("badge", "B-7")
            .with_property("legacy", true);
        let entity = resolver.entity(&raw).unwrap();

        assert_eq!(entity.type_name(), "Employee");
        assert_eq!(entity.get_i64("age"), Some(36));
        assert_eq!(entity.get_str("status"), Some("active"));
        assert_eq!(entity.properties["legacy"], Value::Bool(true));
        assert!(!entity.properties.contains_key("years"));
    }

    #[test]
    fn test_unresolved_entity_carries_snapshot() {
        let registry = registry();
        let err = Resolver::new(&registry)
            .entity(&RawNode::new("x", ["Robot"]))
            .unwrap_err();
        match err {
            Error::UnresolvedEntity { labels, registry } => {
                assert!(labels.contains("Robot"));
                assert!(registry.contains("{Person} --> Person"));
                assert!(registry.contains("{Employee, Person} --> Employee"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_names_property() {
        let registry = registry();
        let raw = RawNode::new("p", ["Person"]).with_property("years", "old");
        let err = Resolver::new(&registry).entity(&raw).unwrap_err();
        assert!(matches!(err, Error::Decode { ref property, .. } if property == "age"));
    }

    #[test]
    fn test_relationships_typed_or_generic() {
        let registry = registry();
        let resolver = Resolver::new(&registry);

        let typed = resolver
            .relationship(&RawRelationship::new("r1", "FRIEND", "a", "b").with_property("since", 0.0))
            .unwrap();
        assert_eq!(typed.model_name(), Some("Friendship"));
        assert_eq!(typed.get("since"), Some(&Value::from("1970-01-01T00:00:00+00:00")));

        let generic = resolver
            .relationship(&RawRelationship::new("r2", "KNOWS", "a", "b").with_property("weight", 2))
            .unwrap();
        assert!(generic.model.is_none());
        assert_eq!(generic.get("weight"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_resolve_rows_with_projections() {
        let registry = registry();
        let plan = QueryPlan::new(&registry, "Person")
            .unwrap()
            .annotate("friend_count", crate::plan::Expr::count(crate::plan::VarRef::node("self")))
            .unwrap();
        let shape = Compiler::compile(&plan).unwrap().shape;

        let output = QueryOutput::new(["person", "friend_count"])
            .with_row(vec![person("p1", "Ada").into(), Value::Integer(3).into()]);
        let rows = Resolver::new(&registry).resolve(&output, &shape).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity("person").unwrap().get_str("name"), Some("Ada"));
        assert_eq!(rows[0].value("friend_count"), Some(&Value::Integer(3)));

        let bad = QueryOutput::new(["person", "friend_count"])
            .with_row(vec![Value::from("nope").into(), Value::Integer(3).into()]);
        assert!(matches!(
            Resolver::new(&registry).resolve(&bad, &shape),
            Err(Error::Resolution(_))
        ));
    }

    #[test]
    fn test_subgraph_deduplicates() {
        let registry = registry();
        let plan = QueryPlan::new(&registry, "Person")
            .unwrap()
            .traverse_with("friends__friends", TraverseOptions::new().with_alias("fof"))
            .unwrap();
        let shape = Compiler::compile(&plan).unwrap().shape;
        let names: Vec<&str> = shape.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["person", "person_friends_1", "r1", "fof", "fof_rel"]);

        let friend = |id: &str, from: &str, to: &str| -> RawValue {
            RawRelationship::new(id, "FRIEND", from, to).into()
        };
        let output = QueryOutput::new(names.clone())
            .with_row(vec![
                person("a", "Ada").into(),
                person("b", "Bob").into(),
                friend("ab", "a", "b"),
                person("c", "Cy").into(),
                friend("bc", "b", "c"),
            ])
            .with_row(vec![
                person("a", "Ada").into(),
                person("b", "Bob").into(),
                friend("ab", "a", "b"),
                person("d", "Di").into(),
                friend("bd", "b", "d"),
            ])
            .with_row(vec![
                person("z", "Zed").into(),
                person("b", "Bob").into(),
                friend("zb", "z", "b"),
                Value::Null.into(),
                Value::Null.into(),
            ]);

        let graphs = Resolver::new(&registry).resolve_subgraph(&output, &shape).unwrap();
        assert_eq!(graphs.len(), 2);

        let ada = &graphs[0];
        assert_eq!(ada.root.get_str("name"), Some("Ada"));
        assert_eq!(ada.neighbors("friends").len(), 1);
        assert_eq!(ada.relationships("friends").len(), 1);
        assert_eq!(ada.neighbors("fof").len(), 2);
        let via_bob: Vec<&str> = ada
            .children("b", "fof")
            .iter()
            .filter_map(|e| e.get_str("name"))
            .collect();
        assert_eq!(via_bob, vec!["Cy", "Di"]);

        let zed = &graphs[1];
        assert_eq!(zed.neighbors("friends").len(), 1);
        assert!(zed.neighbors("fof").is_empty());
    }

    #[test]
    fn test_subgraph_rejects_short_rows() {
        let registry = registry();
        let plan = QueryPlan::new(&registry, "Person").unwrap().traverse("friends").unwrap();
        let shape = Compiler::compile(&plan).unwrap().shape;
        let output = QueryOutput::new(["person", "person_friends_1", "r1"]).with_row(vec![person("a", "Ada").into()]);

        let err = Resolver::new(&registry).resolve_subgraph(&output, &shape).unwrap_err();
        assert!(matches!(err, Error::Resolution(ref m) if m.contains("1 cells for 3 columns")));
    }

    #[test]
    fn test_subgraph_rejects_filter_only() {
        let registry = registry();
        let plan = QueryPlan::new(&registry, "Person")
            .unwrap()
            .traverse_filter_only("friends", TraverseOptions::new())
            .unwrap();
        let shape = Compiler::compile(&plan).unwrap().shape;
        let output = QueryOutput::new(["person"]).with_row(vec![person("a", "Ada").into()]);
        assert!(Resolver::new(&registry).resolve_subgraph(&output, &shape).is_err());
    }

    struct Name(String);

    impl FromEntity for Name {
        fn from_entity(entity: &Entity) -> Result<Self> {
            entity
                .get_str("name")
                .map(|n| Name(n.to_string()))
                .ok_or_else(|| Error::Resolution("missing name".to_string()))
        }
    }

    #[test]
    fn test_resolve_as_and_single() {
        let registry = registry();
        let shape = Compiler::compile(&QueryPlan::new(&registry, "Person").unwrap())
            .unwrap()
            .shape;
        let output = QueryOutput::new(["person"])
            .with_row(vec![person("a", "Ada").into()])
            .with_row(vec![person("b", "Bob").into()]);

        let names: Vec<Name> = Resolver::new(&registry).resolve_as(&output, &shape).unwrap();
        assert_eq!(names.iter().map(|n| n.0.as_str()).collect::<Vec<_>>(), vec!["Ada", "Bob"]);

        assert!(matches!(single(names), Err(Error::MultipleResults(2))));
        assert_eq!(single(Vec::<u8>::new()).unwrap(), None);
        assert_eq!(first(vec![1, 2]), Some(1));
    }
}
