//! Entity/type registry: label sets to node types, labels to relationship types
//!
//! A `Registry` is built explicitly at startup and shared by reference
//! (`Arc<Registry>`) with plan builders and the result resolver. All
//! registration happens under a single write lock so concurrent registrations
//! never interleave partially.

use crate::descriptor::{LabelSet, NodeType, RelationshipType};
use crate::error::{Error, Result};
use crate::limits::{validate_identifier, validate_label, validate_label_count};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct RegistryState {
    /// Every registered label set, optional-label combinations included
    nodes: HashMap<LabelSet, Arc<NodeType>>,
    /// Type name to its mandatory label set
    names: HashMap<String, LabelSet>,
    /// Relationship label to the active descriptor
    relationships: HashMap<String, Arc<RelationshipType>>,
    /// Relationship descriptor name to descriptor
    relationship_names: HashMap<String, Arc<RelationshipType>>,
}

/// Registry of node and relationship types
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryState>> {
        self.state
            .read()
            .map_err(|e| Error::Internal(format!("Lock error: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .write()
            .map_err(|e| Error::Internal(format!("Lock error: {}", e)))
    }

    /// Register a node type under its label set and every optional-label combination
    ///
    /// Re-registering the same name with the same labels replaces the descriptor.
    pub fn register(&self, node: NodeType) -> Result<Arc<NodeType>> {
        validate_node_type(&node)?;

        let labels = node.labels();
        let label_sets = label_combinations(&labels, &node.optional_labels);
        let node = Arc::new(node);

        let mut state = self.write()?;

        if let Some(previous) = state.names.get(&node.name) {
            if *previous != labels {
                return Err(Error::RelabelConflict {
                    name: node.name.clone(),
                    previous: previous.clone(),
                    requested: labels,
                });
            }
        }
        for set in &label_sets {
            if let Some(existing) = state.nodes.get(set) {
                if existing.name != node.name {
                    return Err(Error::DuplicateType {
                        name: node.name.clone(),
                        labels: set.clone(),
                        existing: existing.name.clone(),
                    });
                }
            }
        }

        let name = node.name.clone();
        state.nodes.retain(|_, existing| existing.name != name);
        for set in label_sets {
            state.nodes.insert(set, node.clone());
        }
        state.names.insert(name, labels.clone());

        tracing::debug!("Registered node type {} with labels {}", node.name, labels);
        Ok(node)
    }

    /// Bind a relationship type to its label
    ///
    /// A subtype of the bound descriptor replaces it; a supertype of the bound
    /// descriptor leaves the subtype active. Anything else is a redefinition.
    pub fn register_relationship(&self, relationship: RelationshipType) -> Result<Arc<RelationshipType>> {
        validate_identifier(&relationship.name)?;
        validate_label(&relationship.rel_type)?;
        for property in relationship.properties() {
            validate_identifier(&property.name)?;
            validate_identifier(property.storage_name())?;
        }

        let relationship = Arc::new(relationship);
        let mut state = self.write()?;

        let replace = match state.relationships.get(&relationship.rel_type) {
            None => true,
            Some(bound) if bound.name == relationship.name => true,
            Some(bound) if relationship.is_subtype_of(&bound.name) => true,
            Some(bound) if bound.is_subtype_of(&relationship.name) => false,
            Some(bound) => {
                return Err(Error::RelationshipRedefined {
                    rel_type: relationship.rel_type.clone(),
                    bound: bound.name.clone(),
                    requested: relationship.name.clone(),
                });
            }
        };

        if replace {
            state
                .relationships
                .insert(relationship.rel_type.clone(), relationship.clone());
            tracing::debug!(
                "Bound relationship label {} to {}",
                relationship.rel_type,
                relationship.name
            );
        }
        state
            .relationship_names
            .insert(relationship.name.clone(), relationship.clone());
        Ok(relationship)
    }

    /// Most specific node type whose label set is contained in `labels`
    pub fn resolve(&self, labels: &LabelSet) -> Result<Arc<NodeType>> {
        let state = self.read()?;

        if let Some(exact) = state.nodes.get(labels) {
            return Ok(exact.clone());
        }

        let mut best: Vec<(&LabelSet, &Arc<NodeType>)> = Vec::new();
        for (set, node) in state.nodes.iter().filter(|(set, _)| set.is_subset(labels)) {
            match best.first() {
                Some((current, _)) if current.len() > set.len() => {}
                Some((current, _)) if current.len() == set.len() => best.push((set, node)),
                _ => best = vec![(set, node)],
            }
        }

        let mut candidates: Vec<String> = best.iter().map(|(_, node)| node.name.clone()).collect();
        candidates.sort();
        candidates.dedup();

        match candidates.len() {
            0 => Err(Error::UnknownType {
                labels: labels.clone(),
            }),
            1 => Ok(best[0].1.clone()),
            _ => Err(Error::AmbiguousType {
                labels: labels.clone(),
                candidates,
            }),
        }
    }

    /// Active descriptor for a relationship label, if one is bound
    pub fn resolve_relationship(&self, rel_type: &str) -> Result<Option<Arc<RelationshipType>>> {
        Ok(self.read()?.relationships.get(rel_type).cloned())
    }

    /// Node type by name
    pub fn node_type(&self, name: &str) -> Result<Arc<NodeType>> {
        let state = self.read()?;
        state
            .names
            .get(name)
            .and_then(|labels| state.nodes.get(labels))
            .cloned()
            .ok_or_else(|| Error::UnknownTypeName(name.to_string()))
    }

    /// Every registered node type, sorted by name
    pub fn node_types(&self) -> Result<Vec<Arc<NodeType>>> {
        let state = self.read()?;
        let mut types: Vec<Arc<NodeType>> = state
            .names
            .values()
            .filter_map(|labels| state.nodes.get(labels).cloned())
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }

    /// Relationship type by descriptor name
    pub fn relationship_type(&self, name: &str) -> Result<Arc<RelationshipType>> {
        self.read()?
            .relationship_names
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTypeName(name.to_string()))
    }

    /// Number of registered node types
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.names.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sorted `labels --> type` listing of every registered label set
    pub fn snapshot(&self) -> Result<String> {
        let state = self.read()?;
        let mut lines: Vec<String> = state
            .nodes
            .iter()
            .map(|(labels, node)| format!("{} --> {}", labels, node.name))
            .collect();
        lines.sort();
        Ok(lines.join("\n"))
    }
}

fn validate_node_type(node: &NodeType) -> Result<()> {
    validate_identifier(&node.name)?;
    validate_label(&node.label)?;
    for label in node.ancestors.iter().chain(&node.optional_labels) {
        validate_label(label)?;
    }
    validate_label_count(node.ancestors.len() + 1, node.optional_labels.len())?;
    for property in node.properties() {
        validate_identifier(&property.name)?;
        validate_identifier(property.storage_name())?;
    }
    for relationship in node.relationships() {
        validate_identifier(&relationship.name)?;
        validate_label(&relationship.rel_type)?;
        if relationship.targets.is_empty() {
            return Err(Error::Compile(format!(
                "relationship {} on {} declares no target type",
                relationship.name, node.name
            )));
        }
    }
    Ok(())
}

/// `base` united with every subset of `optional`
fn label_combinations(base: &LabelSet, optional: &[String]) -> Vec<LabelSet> {
    let mut sets = vec![base.clone()];
    for label in optional {
        let extended: Vec<LabelSet> = sets
            .iter()
            .map(|set| {
                let mut set = set.clone();
                set.insert(label.clone());
                set
            })
            .collect();
        sets.extend(extended);
    }
    sets.sort();
    sets.dedup();
    sets
}
