//! Path specifications: typed multi-hop traversals from a root type

use crate::descriptor::{NodeType, RelationshipDef, RelationshipType};
use crate::error::{Error, Result};
use crate::limits::validate_identifier;
use crate::predicate::parse_hops;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Whether traversal results are returned or only used to filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMode {
    Fetch,
    FilterOnly,
}

impl std::fmt::Display for PathMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathMode::Fetch => write!(f, "fetch"),
            PathMode::FilterOnly => write!(f, "filter-only"),
        }
    }
}

/// Options for a single `traverse` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraverseOptions {
    /// Variable name for the last hop's node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default)]
    pub optional: bool,

    #[serde(default = "default_include")]
    pub include_nodes: bool,

    #[serde(default = "default_include")]
    pub include_rels: bool,
}

fn default_include() -> bool {
    true
}

impl Default for TraverseOptions {
    fn default() -> Self {
        Self {
            alias: None,
            optional: false,
            include_nodes: true,
            include_rels: true,
        }
    }
}

impl TraverseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn without_nodes(mut self) -> Self {
        self.include_nodes = false;
        self
    }

    pub fn without_rels(mut self) -> Self {
        self.include_rels = false;
        self
    }
}

/// One resolved hop
#[derive(Debug, Clone)]
pub struct Hop {
    pub relationship: RelationshipDef,
    /// Registered target types, in declaration order
    pub targets: Vec<Arc<NodeType>>,
    pub model: Option<Arc<RelationshipType>>,
}

/// One step of a path specification
#[derive(Debug, Clone)]
pub struct PathStep {
    pub hop: Hop,
    /// Hop names from the root up to and including this step
    pub chain: String,
    pub optional: bool,
    pub alias: Option<String>,
    pub include_node: bool,
    pub include_rel: bool,
}

impl PathStep {
    pub fn name(&self) -> &str {
        &self.hop.relationship.name
    }
}

/// Ordered steps rooted at the plan's root type
#[derive(Debug, Clone)]
pub struct PathSpec {
    pub expr: String,
    pub steps: Vec<PathStep>,
    pub mode: PathMode,
    /// Added by the compiler for filters on untraversed hops; never returned
    pub hidden: bool,
}

impl PathSpec {
    /// Parse `expr` against the relationship declarations reachable from `root`
    pub fn resolve(
        registry: &Registry,
        root: &NodeType,
        expr: &str,
        options: &TraverseOptions,
        mode: PathMode,
    ) -> Result<Self> {
        if let Some(alias) = &options.alias {
            validate_identifier(alias)?;
        }
        let hop_names = parse_hops(expr)?;
        let hops = walk(registry, root, &hop_names)?;
        let last = hops.len() - 1;

        let steps = hops
            .into_iter()
            .enumerate()
            .map(|(i, hop)| PathStep {
                hop,
                chain: hop_names[..=i].join("__"),
                optional: options.optional,
                alias: if i == last { options.alias.clone() } else { None },
                include_node: mode == PathMode::Fetch && options.include_nodes,
                include_rel: mode == PathMode::Fetch && options.include_rels,
            })
            .collect();

        Ok(Self {
            expr: expr.to_string(),
            steps,
            mode,
            hidden: false,
        })
    }

    /// Mandatory, unreturned path used only to bind variables for filters
    pub(crate) fn hidden(registry: &Registry, root: &NodeType, hops: &[String]) -> Result<Self> {
        let mut spec = Self::resolve(
            registry,
            root,
            &hops.join("__"),
            &TraverseOptions::default(),
            PathMode::FilterOnly,
        )?;
        spec.hidden = true;
        Ok(spec)
    }

    pub fn alias(&self) -> Option<&str> {
        self.steps.last().and_then(|s| s.alias.as_deref())
    }
}

/// Resolve hop names one by one, starting at `root`
///
/// Each hop is looked up on the types reached so far; with several target
/// types the first one declaring the hop wins.
pub fn walk(registry: &Registry, root: &NodeType, hops: &[String]) -> Result<Vec<Hop>> {
    let mut current: Vec<Arc<NodeType>> = Vec::new();
    let mut resolved = Vec::with_capacity(hops.len());

    for hop_name in hops {
        let relationship = if resolved.is_empty() {
            root.relationship(hop_name).cloned()
        } else {
            current
                .iter()
                .find_map(|node| node.relationship(hop_name).cloned())
        };
        let relationship = relationship.ok_or_else(|| Error::UnknownRelation {
            type_name: if resolved.is_empty() {
                root.name.clone()
            } else {
                type_names(&current)
            },
            hop: hop_name.clone(),
        })?;

        let targets = relationship
            .targets
            .iter()
            .map(|target| registry.node_type(target))
            .collect::<Result<Vec<_>>>()?;
        let model = relationship
            .model
            .as_deref()
            .map(|name| registry.relationship_type(name))
            .transpose()?;

        current = targets.clone();
        resolved.push(Hop {
            relationship,
            targets,
            model,
        });
    }
    Ok(resolved)
}

fn type_names(types: &[Arc<NodeType>]) -> String {
    types
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::RelationshipDef;

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .register(
                NodeType::new("Coffee")
                    .with_relationship(RelationshipDef::from("suppliers", "Supplier", "COFFEE SUPPLIERS"))
                    .with_relationship(RelationshipDef::to("species", "Species", "COFFEE SPECIES")),
            )
            .unwrap();
        registry
            .register(
                NodeType::new("Supplier")
                    .with_relationship(RelationshipDef::to("coffees", "Coffee", "COFFEE SUPPLIERS"))
                    .with_relationship(RelationshipDef::to("country", "Country", "LOCATED IN")),
            )
            .unwrap();
        registry.register(NodeType::new("Country")).unwrap();
        registry.register(NodeType::new("Species")).unwrap();
        registry
    }

    #[test]
    fn test_resolve_multi_hop() {
        let registry = registry();
        let root = registry.node_type("Coffee").unwrap();
        let spec = PathSpec::resolve(
            &registry,
            &root,
            "suppliers__country",
            &TraverseOptions::new().with_alias("origin"),
            PathMode::Fetch,
        )
        .unwrap();

        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[0].chain, "suppliers");
        assert_eq!(spec.steps[1].chain, "suppliers__country");
        assert_eq!(spec.steps[1].hop.targets[0].name, "Country");
        assert_eq!(spec.alias(), Some("origin"));
        assert!(spec.steps[0].alias.is_none());
    }

    #[test]
    fn test_unknown_hop() {
        let registry = registry();
        let root = registry.node_type("Coffee").unwrap();
        let err = PathSpec::resolve(
            &registry,
            &root,
            "suppliers__owner",
            &TraverseOptions::default(),
            PathMode::Fetch,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::UnknownRelation { ref type_name, ref hop } if type_name == "Supplier" && hop == "owner"
        ));
    }

    #[test]
    fn test_filter_only_never_includes() {
        let registry = registry();
        let root = registry.node_type("Coffee").unwrap();
        let spec = PathSpec::resolve(
            &registry,
            &root,
            "species",
            &TraverseOptions::default(),
            PathMode::FilterOnly,
        )
        .unwrap();
        assert!(!spec.steps[0].include_node);
        assert!(!spec.steps[0].include_rel);
    }

    #[test]
    fn test_unregistered_target() {
        let registry = Registry::new();
        let root = registry
            .register(NodeType::new("Coffee").with_relationship(RelationshipDef::to("roaster", "Roaster", "ROASTED BY")))
            .unwrap();
        let err = PathSpec::resolve(&registry, &root, "roaster", &TraverseOptions::default(), PathMode::Fetch)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTypeName(ref name) if name == "Roaster"));
    }
}
