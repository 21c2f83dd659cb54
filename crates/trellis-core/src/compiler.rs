//! Compiler: query plan to a single parameterized Cypher statement
//!
//! Compilation is a pure walk over the plan. Every operand is bound as a
//! parameter; only validated identifiers and quoted labels are written into
//! the text. Variable and parameter names are allocated from counters, so
//! compiling the same plan twice yields identical output.
//!
//! Clause order:
//!
//! ```text
//! MATCH <mandatory patterns> WHERE <filters on mandatory variables>
//! OPTIONAL MATCH <optional pattern> ...
//! WITH * WHERE <filters touching optional variables>
//! WITH <transform> ...
//! CALL { WITH <imports> <subquery> } ...
//! RETURN <projections> ORDER BY <terms> SKIP $skip LIMIT $limit
//! ```

use crate::descriptor::{Direction, NodeType, PropertyDef, RelationshipType};
use crate::error::{Error, Result};
use crate::limits::validate_identifier;
use crate::path::{Hop, PathMode, PathSpec, PathStep};
use crate::plan::{ExistenceFilter, Expr, OrderTerm, QueryPlan, VarRef};
use crate::predicate::{Condition, FieldPath, Operator, Predicate};
use crate::value::{Parameters, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Compiled statement with its parameters and the shape of its rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub text: String,
    pub params: Parameters,
    pub shape: ResultShape,
}

/// What each returned column holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultShape {
    /// Root variable, when the root is returned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<PathMode>,
    pub columns: Vec<Column>,
}

impl ResultShape {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    /// The root entity
    Root,
    /// Entity reached by a traversal
    Node {
        /// Path alias, or the hop chain when no alias was given
        key: String,
        hop: String,
        /// Column of the nearest returned ancestor; `None` for the root
        parent: Option<String>,
        /// Column holding the relationship that reached this node
        relationship: Option<String>,
    },
    /// Relationship crossed by a traversal
    Relationship { key: String },
    /// Scalar or aggregated projection
    Projection,
}

/// Plan compiler
pub struct Compiler;

impl Compiler {
    /// Compile a plan into one statement
    pub fn compile(plan: &QueryPlan) -> Result<CompiledQuery> {
        let mut ctx = Context::default();
        let (text, shape) = ctx.compile_plan(plan, "", &[], None, false)?;
        tracing::debug!("Compiled query for {}: {}", plan.root().name, text);
        Ok(CompiledQuery {
            text,
            params: ctx.binder.params,
            shape,
        })
    }

    /// Compile a plan into a statement counting its root matches
    pub fn compile_count(plan: &QueryPlan) -> Result<CompiledQuery> {
        let mut ctx = Context::default();
        let (text, shape) = ctx.compile_plan(plan, "", &[], None, true)?;
        tracing::debug!("Compiled count query for {}: {}", plan.root().name, text);
        Ok(CompiledQuery {
            text,
            params: ctx.binder.params,
            shape,
        })
    }

    /// `MERGE` on the merge-key properties, setting everything else on create
    ///
    /// Merge keys must be supplied; defaults (generated ones included) only
    /// ever apply to the `ON CREATE SET` part.
    pub fn compile_get_or_create(
        node: &NodeType,
        properties: &BTreeMap<String, Value>,
    ) -> Result<CompiledQuery> {
        for key in properties.keys() {
            if node.property(key).is_none() {
                return Err(Error::UnknownProperty {
                    type_name: node.name.clone(),
                    property: key.clone(),
                });
            }
        }

        let var = node.variable();
        let mut binder = ParamBinder::default();
        let mut merge = Vec::new();
        let mut on_create = Vec::new();

        for def in node.properties() {
            let hint = format!("{}_{}", var, def.storage_name());
            let supplied = properties.get(&def.name).filter(|v| !v.is_null());
            if def.merge_key {
                let value = supplied.ok_or_else(|| Error::Encode {
                    property: def.name.clone(),
                    message: "merge key value must be supplied".to_string(),
                })?;
                let param = binder.bind("", &hint, encode(def, &def.name, value)?);
                merge.push(format!("{}: ${}", def.storage_name(), param));
                continue;
            }
            match supplied.cloned().or_else(|| def.default_value()) {
                Some(value) => {
                    let param = binder.bind("", &hint, encode(def, &def.name, &value)?);
                    on_create.push(format!("{}.{} = ${}", var, def.storage_name(), param));
                }
                None if def.required => {
                    return Err(Error::Encode {
                        property: def.name.clone(),
                        message: "required property has no value".to_string(),
                    });
                }
                None => {}
            }
        }

        if merge.is_empty() {
            return Err(Error::Compile(format!("{} declares no merge key", node.name)));
        }

        let labels: String = node
            .ancestors
            .iter()
            .chain(std::iter::once(&node.label))
            .map(|label| format!(":{}", quote(label)))
            .collect();
        let mut text = format!("MERGE ({}{} {{{}}})", var, labels, merge.join(", "));
        if !on_create.is_empty() {
            text.push_str(&format!(" ON CREATE SET {}", on_create.join(", ")));
        }
        text.push_str(&format!(" RETURN {}", var));

        Ok(CompiledQuery {
            text,
            params: binder.params,
            shape: ResultShape {
                root: Some(var.clone()),
                mode: None,
                columns: vec![Column {
                    name: var,
                    kind: ColumnKind::Root,
                }],
            },
        })
    }
}

/// Quote a label or relationship type unless it is a plain identifier
pub fn quote(name: &str) -> String {
    if validate_identifier(name).is_ok() {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}

/// Allocates parameter names unique across the whole statement
#[derive(Default)]
struct ParamBinder {
    params: Parameters,
    counters: HashMap<String, usize>,
}

impl ParamBinder {
    fn bind(&mut self, namespace: &str, hint: &str, value: Value) -> String {
        let key = format!("{}{}", namespace, hint);
        let counter = self.counters.entry(key.clone()).or_insert(0);
        loop {
            *counter += 1;
            let name = format!("{}_{}", key, counter);
            if !self.params.contains_key(&name) {
                self.params.insert(name.clone(), value);
                return name;
            }
        }
    }
}

fn encode(def: &PropertyDef, field: &str, value: &Value) -> Result<Value> {
    def.codec.encode(value).map_err(|e| Error::Encode {
        property: field.to_string(),
        message: e.message,
    })
}

/// Variables bound for one traversal step
#[derive(Debug, Clone)]
struct Binding {
    chain: String,
    alias: Option<String>,
    hop: String,
    var: String,
    rel_var: String,
    targets: Vec<Arc<NodeType>>,
    model: Option<Arc<RelationshipType>>,
    optional: bool,
    include_node: bool,
    include_rel: bool,
    /// Index of the binding this step starts from; `None` for the root
    parent: Option<usize>,
}

impl Binding {
    fn key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.chain)
    }
}

/// Variable scope of one (sub)query
struct Scope<'p> {
    plan: &'p QueryPlan,
    root_var: String,
    root_labelled: bool,
    bindings: Vec<Binding>,
    declared: BTreeSet<String>,
    /// Names introduced by subqueries
    extra: Vec<String>,
    /// Set once a transform has replaced the scope
    transformed: Option<Vec<String>>,
    node_counter: usize,
    rel_counter: usize,
    mandatory: Vec<String>,
    optional: Vec<String>,
}

impl<'p> Scope<'p> {
    fn new(plan: &'p QueryPlan, imports: &[String]) -> Result<Self> {
        let root_var = plan.root().variable();
        let root_imported = imports.contains(&root_var);
        let mut scope = Self {
            plan,
            root_var: root_var.clone(),
            root_labelled: root_imported,
            bindings: Vec::new(),
            declared: BTreeSet::new(),
            extra: Vec::new(),
            transformed: None,
            node_counter: 0,
            rel_counter: 0,
            mandatory: Vec::new(),
            optional: Vec::new(),
        };
        for import in imports {
            scope.declare(import)?;
        }
        if !root_imported {
            scope.declare(&root_var)?;
        }
        Ok(scope)
    }

    fn declare(&mut self, name: &str) -> Result<()> {
        if !self.declared.insert(name.to_string()) {
            return Err(Error::Compile(format!("variable {} is bound twice", name)));
        }
        Ok(())
    }

    fn is_visible(&self, name: &str) -> bool {
        match &self.transformed {
            Some(names) => names.iter().any(|n| n == name) || self.extra.iter().any(|n| n == name),
            None => self.declared.contains(name) || self.extra.iter().any(|n| n == name),
        }
    }

    fn binding_for_chain(&self, chain: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.chain == chain)
    }

    fn binding_for_key(&self, key: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|b| b.alias.as_deref() == Some(key))
            .or_else(|| self.binding_for_chain(key))
    }

    /// Index of an earlier binding this step should share, if any
    fn reusable(&self, step: &PathStep, hidden: bool) -> Option<usize> {
        let unique = &self.plan.unique;
        self.bindings.iter().position(|b| {
            b.chain == step.chain
                && (hidden
                    || unique.contains(&b.chain)
                    || b.alias.as_ref().map_or(false, |a| unique.contains(a)))
        })
    }

    fn start_pattern(&mut self, start: Option<usize>, optional: bool) -> String {
        match start {
            Some(index) => format!("({})", self.bindings[index].var),
            None if !optional && !self.root_labelled => {
                self.root_labelled = true;
                format!("({}:{})", self.root_var, quote(&self.plan.root().label))
            }
            None => format!("({})", self.root_var),
        }
    }

    fn flush(&mut self, pattern: &mut String, optional: bool) {
        if pattern.is_empty() {
            return;
        }
        let text = std::mem::take(pattern);
        if optional {
            self.optional.push(text);
        } else {
            self.mandatory.push(text);
        }
    }

    /// Bind every step of `spec`, emitting pattern text for new steps
    ///
    /// Steps after an optional one stay optional. A step shared with an
    /// earlier path emits nothing and the pattern restarts from its variable.
    fn bind_path(&mut self, spec: &PathSpec) -> Result<()> {
        let mut start: Option<usize> = None;
        let mut pattern = String::new();
        let mut pattern_optional = false;
        let mut after_optional = false;

        for step in &spec.steps {
            if let Some(existing) = self.reusable(step, spec.hidden) {
                self.flush(&mut pattern, pattern_optional);
                after_optional |= self.bindings[existing].optional;
                start = Some(existing);
                continue;
            }

            let optional = step.optional || after_optional;
            if !pattern.is_empty() && optional != pattern_optional {
                self.flush(&mut pattern, pattern_optional);
            }
            if pattern.is_empty() {
                pattern = self.start_pattern(start, optional);
                pattern_optional = optional;
            }

            self.node_counter += 1;
            self.rel_counter += 1;
            let var = match &step.alias {
                Some(alias) => alias.clone(),
                None => format!(
                    "{}_{}_{}",
                    step.hop.targets[0].variable(),
                    step.chain,
                    self.node_counter
                ),
            };
            let rel_var = match &step.alias {
                Some(alias) => format!("{}_rel", alias),
                None => format!("r{}", self.rel_counter),
            };
            self.declare(&var)?;
            self.declare(&rel_var)?;

            pattern.push_str(&relationship_pattern(&step.hop, Some(&rel_var)));
            pattern.push_str(&format!("({}:{})", var, label_expr(&step.hop.targets)));

            self.bindings.push(Binding {
                chain: step.chain.clone(),
                alias: step.alias.clone(),
                hop: step.name().to_string(),
                var,
                rel_var,
                targets: step.hop.targets.clone(),
                model: step.hop.model.clone(),
                optional,
                include_node: step.include_node && !spec.hidden,
                include_rel: step.include_rel && !spec.hidden,
                parent: start,
            });
            start = Some(self.bindings.len() - 1);
            after_optional = optional;
        }
        self.flush(&mut pattern, pattern_optional);
        Ok(())
    }

    /// `var.property` for a field path, with the variable and declaration
    fn resolve_field(&self, field: &FieldPath, context: &str) -> Result<(String, String, PropertyDef)> {
        let unbound = || Error::UnboundFieldPath {
            path: field.to_string(),
            context: context.to_string(),
        };
        if self.transformed.is_some() {
            return Err(unbound());
        }

        let (var, def) = if field.hops.is_empty() {
            let def = self.plan.root().property(&field.property).ok_or_else(|| {
                Error::UnknownProperty {
                    type_name: self.plan.root().name.clone(),
                    property: field.property.clone(),
                }
            })?;
            (self.root_var.clone(), def.clone())
        } else {
            let binding = self.binding_for_chain(&field.chain()).ok_or_else(unbound)?;
            if field.on_relationship {
                let def = binding
                    .model
                    .as_ref()
                    .and_then(|m| m.property(&field.property))
                    .ok_or_else(unbound)?;
                (binding.rel_var.clone(), def.clone())
            } else {
                let def = binding
                    .targets
                    .iter()
                    .find_map(|t| t.property(&field.property))
                    .ok_or_else(unbound)?;
                (binding.var.clone(), def.clone())
            }
        };
        Ok((format!("{}.{}", var, def.storage_name()), var, def))
    }

    /// Render a variable reference, mapping declared property names to storage names
    fn render_ref(&self, var: &VarRef, context: &str) -> Result<String> {
        let unbound = |path: &str| Error::UnboundFieldPath {
            path: path.to_string(),
            context: context.to_string(),
        };
        let traversal_visible = self.transformed.is_none();
        match var {
            VarRef::Root if traversal_visible => Ok(self.root_var.clone()),
            VarRef::Root => Err(unbound("self")),
            VarRef::Node(key) if traversal_visible => self
                .binding_for_key(key)
                .map(|b| b.var.clone())
                .ok_or_else(|| unbound(key)),
            VarRef::Relationship(key) if traversal_visible => self
                .binding_for_key(key)
                .map(|b| b.rel_var.clone())
                .ok_or_else(|| unbound(key)),
            VarRef::Node(key) | VarRef::Relationship(key) => Err(unbound(key)),
            VarRef::Name(name) if self.is_visible(name) => Ok(name.clone()),
            VarRef::Name(name) => Err(unbound(name)),
            VarRef::Property(inner, property) => {
                validate_identifier(property)?;
                let storage = self.storage_name(inner, property);
                Ok(format!("{}.{}", self.render_ref(inner, context)?, storage))
            }
        }
    }

    fn storage_name(&self, var: &VarRef, property: &str) -> String {
        let def = match var {
            VarRef::Root => self.plan.root().property(property),
            VarRef::Node(key) => self
                .binding_for_key(key)
                .and_then(|b| b.targets.iter().find_map(|t| t.property(property))),
            VarRef::Relationship(key) => self
                .binding_for_key(key)
                .and_then(|b| b.model.as_ref())
                .and_then(|m| m.property(property)),
            _ => None,
        };
        def.map_or_else(|| property.to_string(), |d| d.storage_name().to_string())
    }

    fn render_expr(&self, expr: &Expr) -> Result<String> {
        let call = |name: &str, inner: &Expr, distinct: bool| -> Result<String> {
            Ok(format!(
                "{}({}{})",
                name,
                if distinct { "DISTINCT " } else { "" },
                self.render_expr(inner)?
            ))
        };
        match expr {
            Expr::Ref(var) => self.render_ref(var, "projections"),
            Expr::Collect { inner, distinct } => call("collect", inner, *distinct),
            Expr::Count { inner, distinct } => call("count", inner, *distinct),
            Expr::Last(inner) => call("last", inner, false),
            Expr::Size(inner) => call("size", inner, false),
            Expr::Sum(inner) => call("sum", inner, false),
            Expr::Avg(inner) => call("avg", inner, false),
            Expr::Min(inner) => call("min", inner, false),
            Expr::Max(inner) => call("max", inner, false),
        }
    }

    /// Nearest ancestor binding whose node is returned
    fn returned_parent(&self, binding: &Binding) -> Option<String> {
        let mut parent = binding.parent;
        while let Some(index) = parent {
            let candidate = &self.bindings[index];
            if candidate.include_node {
                return Some(candidate.var.clone());
            }
            parent = candidate.parent;
        }
        None
    }
}

fn relationship_pattern(hop: &Hop, var: Option<&str>) -> String {
    let inner = format!("{}:{}", var.unwrap_or_default(), quote(&hop.relationship.rel_type));
    relationship_arrow(hop.relationship.direction, &inner)
}

/// `-[inner]->`, `<-[inner]-` or `-[inner]-`
pub(crate) fn relationship_arrow(direction: Direction, inner: &str) -> String {
    match direction {
        Direction::Outgoing => format!("-[{}]->", inner),
        Direction::Incoming => format!("<-[{}]-", inner),
        Direction::Either => format!("-[{}]-", inner),
    }
}

fn label_expr(targets: &[Arc<NodeType>]) -> String {
    targets
        .iter()
        .map(|t| quote(&t.label))
        .collect::<Vec<_>>()
        .join("|")
}

fn existence_pattern(root_var: &str, filter: &ExistenceFilter) -> String {
    let mut pattern = format!("({})", root_var);
    for hop in &filter.hops {
        pattern.push_str(&relationship_pattern(hop, None));
        pattern.push_str(&format!("(:{})", label_expr(&hop.targets)));
    }
    let keyword = if filter.present { "EXISTS" } else { "NOT EXISTS" };
    format!("{} {{ {} }}", keyword, pattern)
}

/// Regular expression for the string-matching operators
fn pattern_for(operator: Operator, text: &str) -> String {
    let escaped = regex::escape(text);
    match operator {
        Operator::IExact => format!("(?i){}", escaped),
        Operator::Contains => format!(".*{}.*", escaped),
        Operator::IContains => format!("(?i).*{}.*", escaped),
        Operator::StartsWith => format!("{}.*", escaped),
        Operator::IStartsWith => format!("(?i){}.*", escaped),
        Operator::EndsWith => format!(".*{}", escaped),
        Operator::IEndsWith => format!("(?i).*{}", escaped),
        Operator::IRegex => format!("(?i){}", text),
        _ => text.to_string(),
    }
}

fn comparison(operator: Operator) -> &'static str {
    match operator {
        Operator::Ne => "<>",
        Operator::Lt => "<",
        Operator::Gt => ">",
        Operator::Lte => "<=",
        Operator::Gte => ">=",
        _ => "=",
    }
}

/// Shared state of one compilation, subqueries included
#[derive(Default)]
struct Context {
    binder: ParamBinder,
}

impl Context {
    fn compile_plan(
        &mut self,
        plan: &QueryPlan,
        namespace: &str,
        imports: &[String],
        returns: Option<&[String]>,
        count: bool,
    ) -> Result<(String, ResultShape)> {
        let mut scope = Scope::new(plan, imports)?;

        for name in &plan.unique {
            let declared = plan
                .paths
                .iter()
                .flat_map(|p| &p.steps)
                .any(|s| s.chain == *name || s.alias.as_deref() == Some(name.as_str()));
            if !declared {
                return Err(Error::Compile(format!(
                    "unique variable {} was never declared by a traversal",
                    name
                )));
            }
        }

        let hidden = hidden_paths(plan)?;
        for spec in plan.paths.iter().chain(&hidden) {
            scope.bind_path(spec)?;
        }

        let mut clauses = Vec::new();
        let has_match = !scope.mandatory.is_empty() || !scope.root_labelled;
        if has_match {
            if !scope.root_labelled {
                let root = format!("({}:{})", scope.root_var, quote(&plan.root().label));
                scope.mandatory.insert(0, root);
            }
            clauses.push(format!("MATCH {}", scope.mandatory.join(", ")));
        }

        // Filters go after the clause that binds the last variable they use
        let mut early = Vec::new();
        let mut late = Vec::new();
        if let Some(predicate) = &plan.predicate {
            let mut used = BTreeSet::new();
            let expr = self.lower(&scope, predicate, namespace, false, &mut used)?;
            let touches_optional = scope
                .bindings
                .iter()
                .any(|b| b.optional && (used.contains(&b.var) || used.contains(&b.rel_var)));
            if touches_optional {
                late.push(expr);
            } else {
                early.push(expr);
            }
        }
        for filter in &plan.existence {
            early.push(existence_pattern(&scope.root_var, filter));
        }
        if !early.is_empty() {
            if has_match {
                clauses.push(format!("WHERE {}", early.join(" AND ")));
            } else {
                late.splice(0..0, early);
            }
        }
        for pattern in &scope.optional {
            clauses.push(format!("OPTIONAL MATCH {}", pattern));
        }
        if !late.is_empty() {
            clauses.push(format!("WITH * WHERE {}", late.join(" AND ")));
        }

        let mut transform_returns = Vec::new();
        for transform in &plan.transforms {
            let mut items = Vec::new();
            let mut names = Vec::new();
            for var in &transform.vars {
                if names.contains(&var.name) {
                    return Err(Error::DuplicateProjection(var.name.clone()));
                }
                items.push(format!("{} AS {}", scope.render_ref(&var.source, "transforms")?, var.name));
                names.push(var.name.clone());
            }
            scope.transformed = Some(names);
            transform_returns = transform
                .vars
                .iter()
                .filter(|v| v.include_in_return)
                .map(|v| v.name.clone())
                .collect();

            let mut clause = format!(
                "WITH {}{}",
                if transform.distinct { "DISTINCT " } else { "" },
                items.join(", ")
            );
            if !transform.ordering.is_empty() {
                let terms = transform
                    .ordering
                    .iter()
                    .map(|o| {
                        scope
                            .render_ref(&o.target, "transform ordering")
                            .map(|t| if o.descending { format!("{} DESC", t) } else { t })
                    })
                    .collect::<Result<Vec<_>>>()?;
                clause.push_str(&format!(" ORDER BY {}", terms.join(", ")));
            }
            clauses.push(clause);
        }

        let mut subquery_returns = Vec::new();
        for (index, subquery) in plan.subqueries.iter().enumerate() {
            for import in &subquery.imports {
                if !scope.is_visible(import) {
                    return Err(Error::Compile(format!(
                        "subquery imports {} which is not bound in the enclosing query",
                        import
                    )));
                }
            }
            let child_namespace = format!("{}sq{}_", namespace, index + 1);
            let (inner, _) = self.compile_plan(
                &subquery.plan,
                &child_namespace,
                &subquery.imports,
                Some(&subquery.returns),
                false,
            )?;
            let call = if subquery.imports.is_empty() {
                format!("CALL {{ {} }}", inner)
            } else {
                format!("CALL {{ WITH {} {} }}", subquery.imports.join(", "), inner)
            };
            clauses.push(call);

            for name in &subquery.returns {
                if scope.is_visible(name) {
                    return Err(Error::DuplicateProjection(name.clone()));
                }
                scope.extra.push(name.clone());
                subquery_returns.push(name.clone());
            }
        }

        if count {
            if scope.transformed.is_some() {
                return Err(Error::Compile("cannot count a transformed plan".to_string()));
            }
            let mut clause = format!("WITH {}", scope.root_var);
            clause.push_str(&self.pagination(plan, namespace)?);
            clauses.push(clause);
            clauses.push(format!("RETURN count({}) AS count", scope.root_var));
            return Ok((
                clauses.join(" "),
                ResultShape {
                    root: None,
                    mode: plan.mode,
                    columns: vec![Column {
                        name: "count".to_string(),
                        kind: ColumnKind::Projection,
                    }],
                },
            ));
        }

        let mut items: Vec<(String, String)> = Vec::new();
        let mut columns = Vec::new();
        let mut root = None;

        match returns {
            Some(requested) => {
                for name in requested {
                    if let Some(annotation) = plan.annotations.iter().find(|a| a.name == *name) {
                        items.push((name.clone(), format!("{} AS {}", scope.render_expr(&annotation.expr)?, name)));
                    } else if scope.is_visible(name) {
                        items.push((name.clone(), name.clone()));
                    } else {
                        return Err(Error::Compile(format!(
                            "subquery return {} is not produced by the subquery",
                            name
                        )));
                    }
                    columns.push(Column {
                        name: name.clone(),
                        kind: ColumnKind::Projection,
                    });
                }
            }
            None => {
                if scope.transformed.is_some() {
                    for name in &transform_returns {
                        items.push((name.clone(), name.clone()));
                        columns.push(Column {
                            name: name.clone(),
                            kind: ColumnKind::Projection,
                        });
                    }
                } else {
                    root = Some(scope.root_var.clone());
                    items.push((scope.root_var.clone(), scope.root_var.clone()));
                    columns.push(Column {
                        name: scope.root_var.clone(),
                        kind: ColumnKind::Root,
                    });
                    for binding in &scope.bindings {
                        if binding.include_node {
                            items.push((binding.var.clone(), binding.var.clone()));
                            columns.push(Column {
                                name: binding.var.clone(),
                                kind: ColumnKind::Node {
                                    key: binding.key().to_string(),
                                    hop: binding.hop.clone(),
                                    parent: scope.returned_parent(binding),
                                    relationship: binding.include_rel.then(|| binding.rel_var.clone()),
                                },
                            });
                        }
                        if binding.include_rel {
                            items.push((binding.rel_var.clone(), binding.rel_var.clone()));
                            columns.push(Column {
                                name: binding.rel_var.clone(),
                                kind: ColumnKind::Relationship {
                                    key: binding.key().to_string(),
                                },
                            });
                        }
                    }
                }
                for name in &subquery_returns {
                    items.push((name.clone(), name.clone()));
                    columns.push(Column {
                        name: name.clone(),
                        kind: ColumnKind::Projection,
                    });
                }
                for annotation in &plan.annotations {
                    let expr = scope.render_expr(&annotation.expr)?;
                    items.push((annotation.name.clone(), format!("{} AS {}", expr, annotation.name)));
                    columns.push(Column {
                        name: annotation.name.clone(),
                        kind: ColumnKind::Projection,
                    });
                }
            }
        }

        let mut seen = BTreeSet::new();
        for (name, _) in &items {
            if !seen.insert(name.as_str()) {
                return Err(Error::DuplicateProjection(name.clone()));
            }
        }
        if items.is_empty() {
            return Err(Error::Compile("query returns nothing".to_string()));
        }
        let projections: Vec<&str> = items.iter().map(|(_, text)| text.as_str()).collect();
        clauses.push(format!("RETURN {}", projections.join(", ")));

        if !plan.ordering.is_empty() {
            // After an aggregating RETURN only projected variables stay in scope
            let aggregating = plan.annotations.iter().any(|a| a.expr.is_aggregate());
            let terms = plan
                .ordering
                .iter()
                .map(|term| match term {
                    OrderTerm::Random => Ok("rand()".to_string()),
                    OrderTerm::Field { field, descending } => {
                        let (lhs, var, _) = scope.resolve_field(field, "ordering")?;
                        if aggregating && !items.iter().any(|(name, _)| *name == var) {
                            return Err(Error::UnboundFieldPath {
                                path: field.to_string(),
                                context: "ordering of an aggregated result".to_string(),
                            });
                        }
                        Ok(if *descending { format!("{} DESC", lhs) } else { lhs })
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            clauses.push(format!("ORDER BY {}", terms.join(", ")));
        }

        let pagination = self.pagination(plan, namespace)?;
        if !pagination.is_empty() {
            clauses.push(pagination.trim_start().to_string());
        }

        Ok((
            clauses.join(" "),
            ResultShape {
                root,
                mode: plan.mode,
                columns,
            },
        ))
    }

    /// ` SKIP $p LIMIT $p`, or empty
    fn pagination(&mut self, plan: &QueryPlan, namespace: &str) -> Result<String> {
        let mut out = String::new();
        let bounds = plan.pagination();
        for (keyword, bound) in [("SKIP", bounds.skip), ("LIMIT", bounds.limit)] {
            if let Some(bound) = bound {
                let value = i64::try_from(bound)
                    .map_err(|_| Error::Compile(format!("{} {} is out of range", keyword, bound)))?;
                let param = self
                    .binder
                    .bind(namespace, &keyword.to_lowercase(), Value::Integer(value));
                out.push_str(&format!(" {} ${}", keyword, param));
            }
        }
        Ok(out)
    }

    /// Lower a predicate tree; OR groups are always parenthesised, AND groups when nested
    fn lower(
        &mut self,
        scope: &Scope<'_>,
        predicate: &Predicate,
        namespace: &str,
        nested: bool,
        used: &mut BTreeSet<String>,
    ) -> Result<String> {
        match predicate {
            Predicate::Leaf(condition) => self.lower_condition(scope, condition, namespace, used),
            Predicate::And(children) if children.is_empty() => Ok("true".to_string()),
            Predicate::Or(children) if children.is_empty() => Ok("false".to_string()),
            Predicate::And(children) => {
                let parts = children
                    .iter()
                    .map(|c| self.lower(scope, c, namespace, true, used))
                    .collect::<Result<Vec<_>>>()?;
                let joined = parts.join(" AND ");
                Ok(if nested && parts.len() > 1 {
                    format!("({})", joined)
                } else {
                    joined
                })
            }
            Predicate::Or(children) => {
                let parts = children
                    .iter()
                    .map(|c| self.lower(scope, c, namespace, true, used))
                    .collect::<Result<Vec<_>>>()?;
                Ok(if parts.len() > 1 {
                    format!("({})", parts.join(" OR "))
                } else {
                    parts.join("")
                })
            }
            Predicate::Not(inner) => Ok(format!(
                "NOT ({})",
                self.lower(scope, inner, namespace, false, used)?
            )),
        }
    }

    fn lower_condition(
        &mut self,
        scope: &Scope<'_>,
        condition: &Condition,
        namespace: &str,
        used: &mut BTreeSet<String>,
    ) -> Result<String> {
        let (lhs, var, def) = scope.resolve_field(&condition.field, "filters")?;
        used.insert(var.clone());
        let field = condition.field.to_string();
        let hint = format!("{}_{}", var, def.storage_name());

        match condition.operator {
            Operator::IsNull => {
                let is_null = condition.value.as_bool().unwrap_or(true);
                Ok(format!("{} IS {}NULL", lhs, if is_null { "" } else { "NOT " }))
            }
            Operator::In => {
                let items = condition.value.as_list().unwrap_or_default();
                if def.codec.is_array() {
                    let encoded = encode(&def, &field, &condition.value)?;
                    let param = self.binder.bind(namespace, &hint, encoded);
                    Ok(format!("any(x IN {} WHERE x IN ${})", lhs, param))
                } else {
                    let encoded = items
                        .iter()
                        .map(|item| encode(&def, &field, item))
                        .collect::<Result<Vec<_>>>()?;
                    let param = self.binder.bind(namespace, &hint, Value::List(encoded));
                    Ok(format!("{} IN ${}", lhs, param))
                }
            }
            op if op.is_pattern() => {
                let encoded = encode(&def, &field, &condition.value)?;
                let text = encoded.as_str().ok_or_else(|| Error::InvalidFilter {
                    field: field.clone(),
                    message: format!("{} needs a string property, {} stores {}", op, def.name, encoded.type_name()),
                })?;
                let param = self
                    .binder
                    .bind(namespace, &hint, Value::String(pattern_for(op, text)));
                Ok(format!("{} =~ ${}", lhs, param))
            }
            op => {
                let encoded = encode(&def, &field, &condition.value)?;
                let param = self.binder.bind(namespace, &hint, encoded);
                Ok(format!("{} {} ${}", lhs, comparison(op), param))
            }
        }
    }
}

/// Unreturned paths for node filters whose hops no traversal declares
fn hidden_paths(plan: &QueryPlan) -> Result<Vec<PathSpec>> {
    let mut hidden: Vec<PathSpec> = Vec::new();
    let Some(predicate) = &plan.predicate else {
        return Ok(hidden);
    };
    for condition in predicate.conditions() {
        let field = &condition.field;
        if field.hops.is_empty() || field.on_relationship {
            continue;
        }
        let chain = field.chain();
        let covered = plan
            .paths
            .iter()
            .chain(&hidden)
            .flat_map(|p| &p.steps)
            .any(|s| s.chain == chain);
        if !covered {
            hidden.push(PathSpec::hidden(plan.registry(), plan.root(), &field.hops)?);
        }
    }
    Ok(hidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ArrayCodec, FloatCodec, IntegerCodec, StringCodec, UniqueIdCodec};
    use crate::descriptor::{PropertyDef, RelationshipDef, RelationshipType};
    use crate::path::TraverseOptions;
    use crate::plan::Transform;
    use crate::registry::Registry;
    use proptest::prelude::*;

    fn q(lookup: &str, value: impl Into<Value>) -> Predicate {
        Predicate::lookup(lookup, value).unwrap()
    }

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .register_relationship(
                RelationshipType::new("SupplierRel", "COFFEE SUPPLIERS")
                    .with_property(PropertyDef::new("since", StringCodec::new()))
                    .with_property(PropertyDef::new("courier", StringCodec::new())),
            )
            .unwrap();
        registry
            .register(
                NodeType::new("Coffee")
                    .with_property(PropertyDef::new("name", StringCodec::new()).unique())
                    .with_property(PropertyDef::new("price", FloatCodec))
                    .with_property(PropertyDef::new("tags", ArrayCodec::of(StringCodec::new())))
                    .with_relationship(
                        RelationshipDef::from("suppliers", "Supplier", "COFFEE SUPPLIERS")
                            .with_model("SupplierRel"),
                    )
                    .with_relationship(RelationshipDef::to("species", "Species", "COFFEE SPECIES")),
            )
            .unwrap();
        registry
            .register(
                NodeType::new("Supplier")
                    .with_property(PropertyDef::new("name", StringCodec::new()))
                    .with_property(PropertyDef::new("delivery_cost", IntegerCodec))
                    .with_relationship(RelationshipDef::to("coffees", "Coffee", "COFFEE SUPPLIERS"))
                    .with_relationship(RelationshipDef::to("country", "Country", "LOCATED IN")),
            )
            .unwrap();
        registry
            .register(NodeType::new("Country").with_property(PropertyDef::new("code", StringCodec::new())))
            .unwrap();
        registry
            .register(NodeType::new("Species").with_property(PropertyDef::new("name", StringCodec::new())))
            .unwrap();
        Arc::new(registry)
    }

    fn coffee(registry: &Arc<Registry>) -> QueryPlan {
        QueryPlan::new(registry, "Coffee").unwrap()
    }

    #[test]
    fn test_coffee_supplier_country() {
        let registry = registry();
        let plan = coffee(&registry)
            .traverse("suppliers__country")
            .unwrap()
            .filter(q("name__icontains", "arabica") | !q("price__gt", 10))
            .unwrap()
            .order_by("-suppliers__delivery_cost")
            .unwrap()
            .limit(5);

        let compiled = Compiler::compile(&plan).unwrap();
        assert_eq!(
            compiled.text,
            "MATCH (coffee:Coffee)<-[r1:`COFFEE SUPPLIERS`]-(supplier_suppliers_1:Supplier)\
             -[r2:`LOCATED IN`]->(country_suppliers__country_2:Country) \
             WHERE (coffee.name =~ $coffee_name_1 OR NOT (coffee.price > $coffee_price_1)) \
             RETURN coffee, supplier_suppliers_1, r1, country_suppliers__country_2, r2 \
             ORDER BY supplier_suppliers_1.delivery_cost DESC \
             LIMIT $limit_1"
        );
        assert_eq!(compiled.text.matches("MATCH").count(), 1);
        assert_eq!(compiled.params.len(), 3);
        assert_eq!(compiled.params["coffee_name_1"], Value::from("(?i).*arabica.*"));
        assert_eq!(compiled.params["coffee_price_1"], Value::Float(10.0));
        assert_eq!(compiled.params["limit_1"], Value::Integer(5));
    }

    #[test]
    fn test_grouping_is_preserved() {
        let registry = registry();
        let a = q("name", "a");
        let b = q("name", "b");
        let c = q("price__lt", 3);

        let grouped = Compiler::compile(
            &coffee(&registry)
                .filter(Predicate::and([Predicate::or([a.clone(), b.clone()]), c.clone()]))
                .unwrap(),
        )
        .unwrap();
        let distributed = Compiler::compile(
            &coffee(&registry)
                .filter(Predicate::or([
                    Predicate::and([a.clone(), c.clone()]),
                    Predicate::and([b, c]),
                ]))
                .unwrap(),
        )
        .unwrap();

        assert!(grouped
            .text
            .contains("WHERE (coffee.name = $coffee_name_1 OR coffee.name = $coffee_name_2) AND coffee.price < $coffee_price_1"));
        assert!(distributed.text.contains(
            "WHERE ((coffee.name = $coffee_name_1 AND coffee.price < $coffee_price_1) OR (coffee.name = $coffee_name_2 AND coffee.price < $coffee_price_2))"
        ));
        assert_ne!(grouped.text, distributed.text);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let registry = registry();
        let plan = coffee(&registry)
            .traverse("suppliers__country")
            .unwrap()
            .traverse_with("species", TraverseOptions::new().optional())
            .unwrap()
            .filter(q("name__in", vec!["a", "b"]) & q("suppliers__name__startswith", "Ac"))
            .unwrap()
            .skip(10)
            .limit(5);

        let first = Compiler::compile(&plan).unwrap();
        let second = Compiler::compile(&plan).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_operators() {
        let registry = registry();
        let compile = |p: Predicate| Compiler::compile(&coffee(&registry).filter(p).unwrap()).unwrap();

        let compiled = compile(q("name__isnull", true));
        assert!(compiled.text.contains("WHERE coffee.name IS NULL"));
        assert!(compiled.params.is_empty());

        let compiled = compile(q("name__isnull", false));
        assert!(compiled.text.contains("coffee.name IS NOT NULL"));

        let compiled = compile(q("name__ne", "x"));
        assert!(compiled.text.contains("coffee.name <> $coffee_name_1"));

        let compiled = compile(q("name__in", vec!["a", "b"]));
        assert!(compiled.text.contains("coffee.name IN $coffee_name_1"));
        assert_eq!(compiled.params["coffee_name_1"], Value::from(vec!["a", "b"]));

        let compiled = compile(q("tags__in", vec!["organic"]));
        assert!(compiled.text.contains("any(x IN coffee.tags WHERE x IN $coffee_tags_1)"));

        let compiled = compile(q("name__endswith", "a.b"));
        assert_eq!(compiled.params["coffee_name_1"], Value::from(".*a\\.b"));

        let compiled = compile(q("name__iregex", "^ar.*"));
        assert_eq!(compiled.params["coffee_name_1"], Value::from("(?i)^ar.*"));

        let compiled = compile(q("name__iexact", "Arabica"));
        assert!(compiled.text.contains("coffee.name =~ $coffee_name_1"));
        assert_eq!(compiled.params["coffee_name_1"], Value::from("(?i)Arabica"));
    }

    #[test]
    fn test_encode_error() {
        let registry = registry();
        let plan = coffee(&registry).filter(q("price__gt", "cheap")).unwrap();
        let err = Compiler::compile(&plan).unwrap_err();
        assert!(matches!(err, Error::Encode { ref property, .. } if property == "price"));
    }

    #[test]
    fn test_optional_paths_follow_mandatory() {
        let registry = registry();
        let plan = coffee(&registry)
            .traverse_with("species", TraverseOptions::new().optional())
            .unwrap()
            .traverse("suppliers")
            .unwrap()
            .filter(q("species__name", "arabica"))
            .unwrap();

        let text = Compiler::compile(&plan).unwrap().text;
        assert_eq!(
            text,
            "MATCH (coffee:Coffee)<-[r2:`COFFEE SUPPLIERS`]-(supplier_suppliers_2:Supplier) \
             OPTIONAL MATCH (coffee)-[r1:`COFFEE SPECIES`]->(species_species_1:Species) \
             WITH * WHERE species_species_1.name = $species_species_1_name_1 \
             RETURN coffee, species_species_1, r1, supplier_suppliers_2, r2"
        );
    }

    #[test]
    fn test_only_optional_paths_still_match_root() {
        let registry = registry();
        let plan = coffee(&registry)
            .traverse_with("species", TraverseOptions::new().optional())
            .unwrap();
        let text = Compiler::compile(&plan).unwrap().text;
        assert!(text.starts_with(
            "MATCH (coffee:Coffee) OPTIONAL MATCH (coffee)-[r1:`COFFEE SPECIES`]->(species_species_1:Species)"
        ));
    }

    #[test]
    fn test_unique_variables_share_prefix() {
        let registry = registry();
        let base = coffee(&registry)
            .traverse("suppliers__country")
            .unwrap()
            .traverse("suppliers__coffees")
            .unwrap();

        let disjoint = Compiler::compile(&base).unwrap().text;
        assert!(disjoint.contains(
            "(coffee)<-[r3:`COFFEE SUPPLIERS`]-(supplier_suppliers_3:Supplier)-[r4:`COFFEE SUPPLIERS`]->(coffee_suppliers__coffees_4:Coffee)"
        ));

        let shared = Compiler::compile(&base.unique_variables(&["suppliers"])).unwrap();
        assert!(shared.text.contains(", (supplier_suppliers_1)-[r3:`COFFEE SUPPLIERS`]->(coffee_suppliers__coffees_3:Coffee)"));
        assert!(!shared.text.contains("supplier_suppliers_3"));
    }

    #[test]
    fn test_unique_variable_must_be_declared() {
        let registry = registry();
        let plan = coffee(&registry)
            .traverse("suppliers")
            .unwrap()
            .unique_variables(&["species"]);
        assert!(matches!(Compiler::compile(&plan), Err(Error::Compile(_))));
    }

    #[test]
    fn test_relationship_filter_needs_binding() {
        let registry = registry();
        let plan = coffee(&registry).filter(q("suppliers|since__gt", "2020")).unwrap();
        let err = Compiler::compile(&plan).unwrap_err();
        assert!(matches!(err, Error::UnboundFieldPath { ref path, .. } if path == "suppliers|since"));

        let plan = coffee(&registry)
            .traverse("suppliers")
            .unwrap()
            .filter(q("suppliers|since__gt", "2020"))
            .unwrap();
        let compiled = Compiler::compile(&plan).unwrap();
        assert!(compiled.text.contains("WHERE r1.since > $r1_since_1"));
    }

    #[test]
    fn test_hidden_path_for_hop_filter() {
        let registry = registry();
        let plan = coffee(&registry)
            .filter(q("suppliers__country__code", "CO"))
            .unwrap();
        let compiled = Compiler::compile(&plan).unwrap();
        assert!(compiled.text.starts_with("MATCH (coffee:Coffee)<-[r1:`COFFEE SUPPLIERS`]-"));
        assert!(compiled.text.ends_with("RETURN coffee"));
        assert_eq!(compiled.shape.columns.len(), 1);
    }

    #[test]
    fn test_ordering_needs_binding() {
        let registry = registry();
        let plan = coffee(&registry).order_by("-suppliers__delivery_cost").unwrap();
        let err = Compiler::compile(&plan).unwrap_err();
        assert!(matches!(err, Error::UnboundFieldPath { ref context, .. } if context == "ordering"));
    }

    #[test]
    fn test_existence_filters() {
        let registry = registry();
        let plan = coffee(&registry)
            .has("suppliers", true)
            .unwrap()
            .has("species", false)
            .unwrap()
            .filter(q("name", "a") | q("name", "b"))
            .unwrap();
        let text = Compiler::compile(&plan).unwrap().text;
        assert_eq!(
            text,
            "MATCH (coffee:Coffee) WHERE (coffee.name = $coffee_name_1 OR coffee.name = $coffee_name_2) \
             AND EXISTS { (coffee)<-[:`COFFEE SUPPLIERS`]-(:Supplier) } \
             AND NOT EXISTS { (coffee)-[:`COFFEE SPECIES`]->(:Species) } RETURN coffee"
        );
    }

    #[test]
    fn test_annotations_and_duplicates() {
        let registry = registry();
        let plan = coffee(&registry)
            .traverse_filter_only("suppliers", TraverseOptions::new().with_alias("supplier"))
            .unwrap()
            .annotate("supplier_names", Expr::collect_distinct(VarRef::node("supplier").prop("name")))
            .unwrap()
            .annotate("supplier_count", Expr::count(VarRef::node("suppliers")))
            .unwrap();
        let compiled = Compiler::compile(&plan).unwrap();
        assert!(compiled.text.ends_with(
            "RETURN coffee, collect(DISTINCT supplier.name) AS supplier_names, count(supplier) AS supplier_count"
        ));
        assert_eq!(compiled.shape.mode, Some(PathMode::FilterOnly));

        let ordered_by_hidden = coffee(&registry)
            .traverse_filter_only("suppliers", TraverseOptions::new().with_alias("supplier"))
            .unwrap()
            .annotate("supplier_count", Expr::count(VarRef::node("supplier")))
            .unwrap()
            .order_by("-suppliers__name")
            .unwrap();
        assert!(matches!(
            Compiler::compile(&ordered_by_hidden),
            Err(Error::UnboundFieldPath { ref path, .. }) if path == "suppliers__name"
        ));

        let ordered_by_root = coffee(&registry)
            .traverse_filter_only("suppliers", TraverseOptions::new().with_alias("supplier"))
            .unwrap()
            .annotate("supplier_count", Expr::count(VarRef::node("supplier")))
            .unwrap()
            .order_by("-price")
            .unwrap();
        assert!(Compiler::compile(&ordered_by_root)
            .unwrap()
            .text
            .ends_with("count(supplier) AS supplier_count ORDER BY coffee.price DESC"));

        let duplicate = coffee(&registry)
            .annotate("coffee", Expr::size(VarRef::node("self").prop("tags")))
            .unwrap();
        assert!(matches!(
            Compiler::compile(&duplicate),
            Err(Error::DuplicateProjection(ref name)) if name == "coffee"
        ));
    }

    #[test]
    fn test_transform_replaces_scope() {
        let registry = registry();
        let plan = coffee(&registry)
            .traverse("suppliers")
            .unwrap()
            .transform(
                Transform::new()
                    .returning("origin", VarRef::node("self"))
                    .var("rel", VarRef::rel("suppliers"))
                    .order_by("-rel.since")
                    .unwrap(),
            )
            .unwrap()
            .annotate("latest", Expr::last(Expr::collect(VarRef::name("rel"))))
            .unwrap();
        let text = Compiler::compile(&plan).unwrap().text;
        assert!(text.contains("WITH coffee AS origin, r1 AS rel ORDER BY rel.since DESC"));
        assert!(text.ends_with("RETURN origin, last(collect(rel)) AS latest"));

        let stale = plan.order_by("name").unwrap();
        assert!(matches!(Compiler::compile(&stale), Err(Error::UnboundFieldPath { .. })));
    }

    #[test]
    fn test_subquery_namespaces_parameters() {
        let registry = registry();
        let inner = coffee(&registry)
            .traverse("suppliers")
            .unwrap()
            .filter(q("name", "inner"))
            .unwrap()
            .annotate("latest", Expr::last(Expr::collect(VarRef::rel("suppliers"))))
            .unwrap();
        let plan = coffee(&registry)
            .filter(q("name", "outer"))
            .unwrap()
            .subquery(inner, &["latest"], &["coffee"])
            .unwrap()
            .limit(1);

        let compiled = Compiler::compile(&plan).unwrap();
        assert_eq!(
            compiled.text,
            "MATCH (coffee:Coffee) WHERE coffee.name = $coffee_name_1 \
             CALL { WITH coffee MATCH (coffee)<-[r1:`COFFEE SUPPLIERS`]-(supplier_suppliers_1:Supplier) \
             WHERE coffee.name = $sq1_coffee_name_1 RETURN last(collect(r1)) AS latest } \
             RETURN coffee, latest LIMIT $limit_1"
        );
        assert_eq!(compiled.params["coffee_name_1"], Value::from("outer"));
        assert_eq!(compiled.params["sq1_coffee_name_1"], Value::from("inner"));
        let outer_names: Vec<&String> = compiled
            .params
            .keys()
            .filter(|k| !k.starts_with("sq1_"))
            .collect();
        assert_eq!(outer_names, vec!["coffee_name_1", "limit_1"]);
        assert_eq!(compiled.shape.column("latest").unwrap().kind, ColumnKind::Projection);
    }

    #[test]
    fn test_subquery_errors() {
        let registry = registry();
        let inner = || coffee(&registry).annotate("n", Expr::count(VarRef::node("self"))).unwrap();

        let missing_return = coffee(&registry).subquery(inner(), &["total"], &["coffee"]).unwrap();
        assert!(matches!(Compiler::compile(&missing_return), Err(Error::Compile(_))));

        let bad_import = coffee(&registry).subquery(inner(), &["n"], &["supplier"]).unwrap();
        assert!(matches!(Compiler::compile(&bad_import), Err(Error::Compile(_))));

        let shadowing = coffee(&registry)
            .annotate("n", Expr::count(VarRef::node("self")))
            .unwrap()
            .subquery(inner(), &["n"], &["coffee"])
            .unwrap();
        assert!(matches!(Compiler::compile(&shadowing), Err(Error::DuplicateProjection(_))));
    }

    #[test]
    fn test_compile_count() {
        let registry = registry();
        let plan = coffee(&registry)
            .filter(q("price__lt", 5))
            .unwrap()
            .order_by("name")
            .unwrap()
            .skip(2);
        let compiled = Compiler::compile_count(&plan).unwrap();
        assert_eq!(
            compiled.text,
            "MATCH (coffee:Coffee) WHERE coffee.price < $coffee_price_1 WITH coffee SKIP $skip_1 RETURN count(coffee) AS count"
        );
    }

    #[test]
    fn test_get_or_create() {
        let node = NodeType::new("Roaster")
            .with_property(PropertyDef::new("uid", UniqueIdCodec).merge_key())
            .with_property(PropertyDef::new("name", StringCodec::new()).required())
            .with_property(PropertyDef::new("rating", IntegerCodec).with_default(3));

        let mut props = BTreeMap::new();
        props.insert("uid".to_string(), Value::from("r-1"));
        props.insert("name".to_string(), Value::from("Lyon"));
        let compiled = Compiler::compile_get_or_create(&node, &props).unwrap();
        assert_eq!(
            compiled.text,
            "MERGE (roaster:Roaster {uid: $roaster_uid_1}) ON CREATE SET roaster.name = $roaster_name_1, \
             roaster.rating = $roaster_rating_1 RETURN roaster"
        );
        assert_eq!(compiled.params["roaster_rating_1"], Value::Integer(3));

        // Generated defaults never stand in for a merge key
        props.remove("uid");
        let err = Compiler::compile_get_or_create(&node, &props).unwrap_err();
        assert!(matches!(err, Error::Encode { ref property, .. } if property == "uid"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("Coffee"), "Coffee");
        assert_eq!(quote("COFFEE SUPPLIERS"), "`COFFEE SUPPLIERS`");
        assert_eq!(quote("a`b"), "`a``b`");
    }

    proptest! {
        #[test]
        fn prop_values_are_never_inlined(
            text in "[a-z]{0,4}'[ -~\\t\\n\\r]{0,16}",
            skip in 0u64..1_000_000,
        ) {
            let registry = registry();
            let plan = coffee(&registry)
                .filter(
                    Predicate::lookup("name", text.clone()).unwrap()
                        | Predicate::lookup("name__in", vec![text.clone()]).unwrap()
                        | Predicate::lookup("name__contains", text.clone()).unwrap(),
                )
                .unwrap()
                .skip(skip);
            let compiled = Compiler::compile(&plan).unwrap();

            prop_assert!(!compiled.text.contains('\''));
            prop_assert!(!compiled.text.contains(&text));
            prop_assert_eq!(&compiled.params["coffee_name_1"], &Value::from(text.clone()));
            prop_assert_eq!(&compiled.params["coffee_name_2"], &Value::from(vec![text.clone()]));
            prop_assert_eq!(&compiled.params["skip_1"], &Value::Integer(skip as i64));
            prop_assert!(compiled.text.ends_with("SKIP $skip_1"));
        }
    }
}
