//! Query plans: the chainable specification handed to the compiler
//!
//! Every builder call validates against the registry as it is made, so
//! unknown hops and properties surface while the plan is being written
//! rather than when it is compiled.

use crate::descriptor::NodeType;
use crate::error::{Error, Result};
use crate::limits::validate_identifier;
use crate::path::{walk, Hop, PathMode, PathSpec, TraverseOptions};
use crate::predicate::{parse_hops, FieldPath, Predicate};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One ordering term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTerm {
    Field { field: FieldPath, descending: bool },
    Random,
}

impl OrderTerm {
    /// `name`, `-suppliers__delivery_cost`, `suppliers|since` or `?` for random
    pub fn parse(expr: &str) -> Result<Self> {
        if expr == "?" {
            return Ok(OrderTerm::Random);
        }
        let (descending, field) = match expr.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, expr),
        };
        Ok(OrderTerm::Field {
            field: FieldPath::parse(field)?,
            descending,
        })
    }
}

/// Skip/limit, both bound as parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Reference to a variable visible in the query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarRef {
    /// The root node
    Root,
    /// Node bound by a traversal, by hop chain or alias
    Node(String),
    /// Relationship bound by a traversal, by hop chain or alias
    Relationship(String),
    /// Name introduced by a transform or a subquery
    Name(String),
    Property(Box<VarRef>, String),
}

impl VarRef {
    /// `self` names the root
    pub fn node(path: impl Into<String>) -> Self {
        let path = path.into();
        if path == "self" {
            VarRef::Root
        } else {
            VarRef::Node(path)
        }
    }

    pub fn rel(path: impl Into<String>) -> Self {
        VarRef::Relationship(path.into())
    }

    pub fn name(name: impl Into<String>) -> Self {
        VarRef::Name(name.into())
    }

    pub fn prop(self, property: impl Into<String>) -> Self {
        VarRef::Property(Box::new(self), property.into())
    }
}

/// Projection expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Ref(VarRef),
    Collect { inner: Box<Expr>, distinct: bool },
    Count { inner: Box<Expr>, distinct: bool },
    Last(Box<Expr>),
    Size(Box<Expr>),
    Sum(Box<Expr>),
    Avg(Box<Expr>),
    Min(Box<Expr>),
    Max(Box<Expr>),
}

impl Expr {
    pub fn collect(inner: impl Into<Expr>) -> Self {
        Expr::Collect {
            inner: Box::new(inner.into()),
            distinct: false,
        }
    }

    pub fn collect_distinct(inner: impl Into<Expr>) -> Self {
        Expr::Collect {
            inner: Box::new(inner.into()),
            distinct: true,
        }
    }

    pub fn count(inner: impl Into<Expr>) -> Self {
        Expr::Count {
            inner: Box::new(inner.into()),
            distinct: false,
        }
    }

    pub fn count_distinct(inner: impl Into<Expr>) -> Self {
        Expr::Count {
            inner: Box::new(inner.into()),
            distinct: true,
        }
    }

    pub fn last(inner: impl Into<Expr>) -> Self {
        Expr::Last(Box::new(inner.into()))
    }

    pub fn size(inner: impl Into<Expr>) -> Self {
        Expr::Size(Box::new(inner.into()))
    }

    pub fn sum(inner: impl Into<Expr>) -> Self {
        Expr::Sum(Box::new(inner.into()))
    }

    pub fn avg(inner: impl Into<Expr>) -> Self {
        Expr::Avg(Box::new(inner.into()))
    }

    pub fn min(inner: impl Into<Expr>) -> Self {
        Expr::Min(Box::new(inner.into()))
    }

    pub fn max(inner: impl Into<Expr>) -> Self {
        Expr::Max(Box::new(inner.into()))
    }

    /// Whether the expression groups rows
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::Ref(_) => false,
            Expr::Collect { .. } | Expr::Count { .. } | Expr::Sum(_) | Expr::Avg(_) | Expr::Min(_) | Expr::Max(_) => {
                true
            }
            Expr::Last(inner) | Expr::Size(inner) => inner.is_aggregate(),
        }
    }
}

impl From<VarRef> for Expr {
    fn from(var: VarRef) -> Self {
        Expr::Ref(var)
    }
}

/// Named projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformVar {
    pub name: String,
    pub source: VarRef,
    pub include_in_return: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOrder {
    pub target: VarRef,
    pub descending: bool,
}

/// Intermediate `WITH` stage; afterwards only its outputs are in scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transform {
    pub vars: Vec<TransformVar>,
    pub distinct: bool,
    pub ordering: Vec<TransformOrder>,
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carry `source` forward as `name` without returning it
    pub fn var(mut self, name: impl Into<String>, source: VarRef) -> Self {
        self.vars.push(TransformVar {
            name: name.into(),
            source,
            include_in_return: false,
        });
        self
    }

    /// Carry `source` forward as `name` and return it
    pub fn returning(mut self, name: impl Into<String>, source: VarRef) -> Self {
        self.vars.push(TransformVar {
            name: name.into(),
            source,
            include_in_return: true,
        });
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// `name`, `name.property`, optionally prefixed with `-`
    pub fn order_by(mut self, expr: &str) -> Result<Self> {
        let (descending, rest) = match expr.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, expr),
        };
        let target = match rest.split_once('.') {
            Some((name, property)) => {
                validate_identifier(name)?;
                validate_identifier(property)?;
                VarRef::name(name).prop(property)
            }
            None => {
                validate_identifier(rest)?;
                VarRef::name(rest)
            }
        };
        self.ordering.push(TransformOrder { target, descending });
        Ok(self)
    }
}

/// Nested plan spliced in as a `CALL` block
#[derive(Debug, Clone)]
pub struct Subquery {
    pub plan: Box<QueryPlan>,
    pub returns: Vec<String>,
    pub imports: Vec<String>,
}

/// Existence check on a relationship chain
#[derive(Debug, Clone)]
pub struct ExistenceFilter {
    pub hops: Vec<Hop>,
    pub present: bool,
}

/// Query plan rooted at one node type
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub(crate) registry: Arc<Registry>,
    pub(crate) root: Arc<NodeType>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) existence: Vec<ExistenceFilter>,
    pub(crate) paths: Vec<PathSpec>,
    pub(crate) mode: Option<PathMode>,
    pub(crate) unique: Vec<String>,
    pub(crate) ordering: Vec<OrderTerm>,
    pub(crate) pagination: Pagination,
    pub(crate) annotations: Vec<Annotation>,
    pub(crate) transforms: Vec<Transform>,
    pub(crate) subqueries: Vec<Subquery>,
}

impl QueryPlan {
    /// Plan rooted at the registered type `root`
    pub fn new(registry: &Arc<Registry>, root: &str) -> Result<Self> {
        let root = registry.node_type(root)?;
        Ok(Self::for_type(registry, root))
    }

    pub fn for_type(registry: &Arc<Registry>, root: Arc<NodeType>) -> Self {
        Self {
            registry: registry.clone(),
            root,
            predicate: None,
            existence: Vec::new(),
            paths: Vec::new(),
            mode: None,
            unique: Vec::new(),
            ordering: Vec::new(),
            pagination: Pagination::default(),
            annotations: Vec::new(),
            transforms: Vec::new(),
            subqueries: Vec::new(),
        }
    }

    pub fn root(&self) -> &Arc<NodeType> {
        &self.root
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn paths(&self) -> &[PathSpec] {
        &self.paths
    }

    pub fn mode(&self) -> Option<PathMode> {
        self.mode
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    /// AND `predicate` into the plan's filter
    pub fn filter(mut self, predicate: Predicate) -> Result<Self> {
        for condition in predicate.conditions() {
            self.check_field(&condition.field)?;
        }
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => Predicate::and([existing, predicate]),
            None => predicate,
        });
        Ok(self)
    }

    /// AND the negation of `predicate` into the plan's filter
    pub fn exclude(self, predicate: Predicate) -> Result<Self> {
        self.filter(Predicate::negate(predicate))
    }

    /// Require (or forbid) at least one match of the hop chain `path`
    pub fn has(mut self, path: &str, present: bool) -> Result<Self> {
        let hops = walk(&self.registry, &self.root, &parse_hops(path)?)?;
        self.existence.push(ExistenceFilter { hops, present });
        Ok(self)
    }

    /// Traverse `expr` and return what it reaches
    pub fn traverse(self, expr: &str) -> Result<Self> {
        self.traverse_with(expr, TraverseOptions::default())
    }

    pub fn traverse_with(self, expr: &str, options: TraverseOptions) -> Result<Self> {
        self.add_path(expr, options, PathMode::Fetch)
    }

    /// Traverse `expr` to filter or alias only; nothing along it is returned
    pub fn traverse_filter_only(self, expr: &str, options: TraverseOptions) -> Result<Self> {
        self.add_path(expr, options, PathMode::FilterOnly)
    }

    fn add_path(mut self, expr: &str, options: TraverseOptions, mode: PathMode) -> Result<Self> {
        if let Some(committed) = self.mode {
            if committed != mode {
                return Err(Error::IncompatibleMode {
                    committed,
                    requested: mode,
                });
            }
        }
        if let Some(alias) = &options.alias {
            let taken = self.paths.iter().any(|p| p.alias() == Some(alias.as_str()))
                || *alias == self.root.variable();
            if taken {
                return Err(Error::DuplicateAlias(alias.clone()));
            }
        }
        let spec = PathSpec::resolve(&self.registry, &self.root, expr, &options, mode)?;
        self.mode = Some(mode);
        self.paths.push(spec);
        Ok(self)
    }

    /// Share the variables bound for these chains or aliases across paths
    pub fn unique_variables<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for name in names {
            let name = name.as_ref().to_string();
            if !self.unique.contains(&name) {
                self.unique.push(name);
            }
        }
        self
    }

    pub fn order_by(mut self, expr: &str) -> Result<Self> {
        let term = OrderTerm::parse(expr)?;
        if let OrderTerm::Field { field, .. } = &term {
            self.check_field(field)?;
        }
        self.ordering.push(term);
        Ok(self)
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.pagination.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.pagination.limit = Some(limit);
        self
    }

    pub fn annotate(mut self, name: &str, expr: impl Into<Expr>) -> Result<Self> {
        validate_identifier(name)?;
        self.annotations.push(Annotation {
            name: name.to_string(),
            expr: expr.into(),
        });
        Ok(self)
    }

    pub fn transform(mut self, transform: Transform) -> Result<Self> {
        if transform.vars.is_empty() {
            return Err(Error::Compile("transform declares no variables".to_string()));
        }
        for var in &transform.vars {
            validate_identifier(&var.name)?;
        }
        self.transforms.push(transform);
        Ok(self)
    }

    /// Splice `plan` in as a subquery that sees only `imports` and exposes `returns`
    pub fn subquery<S: AsRef<str>>(mut self, plan: QueryPlan, returns: &[S], imports: &[S]) -> Result<Self> {
        let returns: Vec<String> = returns.iter().map(|s| s.as_ref().to_string()).collect();
        let imports: Vec<String> = imports.iter().map(|s| s.as_ref().to_string()).collect();
        if returns.is_empty() {
            return Err(Error::Compile("subquery returns nothing".to_string()));
        }
        for name in returns.iter().chain(&imports) {
            validate_identifier(name)?;
        }
        self.subqueries.push(Subquery {
            plan: Box::new(plan),
            returns,
            imports,
        });
        Ok(self)
    }

    /// Check that `field` names a declared property at the end of declared hops
    fn check_field(&self, field: &FieldPath) -> Result<()> {
        if field.hops.is_empty() {
            return match self.root.property(&field.property) {
                Some(_) => Ok(()),
                None => Err(Error::UnknownProperty {
                    type_name: self.root.name.clone(),
                    property: field.property.clone(),
                }),
            };
        }

        let hops = walk(&self.registry, &self.root, &field.hops)?;
        let Some(last) = hops.last() else {
            return Err(Error::Internal("walk returned no hops".to_string()));
        };

        if field.on_relationship {
            let model = last.model.as_ref().ok_or_else(|| Error::InvalidFilter {
                field: field.to_string(),
                message: format!("relationship {} declares no model", last.relationship.name),
            })?;
            if model.property(&field.property).is_none() {
                return Err(Error::UnknownProperty {
                    type_name: model.name.clone(),
                    property: field.property.clone(),
                });
            }
        } else if !last.targets.iter().any(|t| t.property(&field.property).is_some()) {
            return Err(Error::UnknownProperty {
                type_name: last.relationship.targets.join("|"),
                property: field.property.clone(),
            });
        }
        Ok(())
    }
}
