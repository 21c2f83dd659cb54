//! Driver boundary: the narrow interface the core calls to run statements
//!
//! Implementations live outside this crate. The core only needs statement
//! execution with named parameters and a transaction for the cardinality
//! guard's check-then-write sequences.

use crate::compiler::Compiler;
use crate::error::{Error, Result};
use crate::plan::QueryPlan;
use crate::registry::Registry;
use crate::resolver::{single, Entity, ResolvedRow, Resolver, Subgraph};
use crate::value::{Parameters, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node as returned by the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub element_id: String,
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl RawNode {
    pub fn new<S: Into<String>>(element_id: impl Into<String>, labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            element_id: element_id.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Relationship as returned by the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRelationship {
    pub element_id: String,
    pub rel_type: String,
    pub start_id: String,
    pub end_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl RawRelationship {
    pub fn new(
        element_id: impl Into<String>,
        rel_type: impl Into<String>,
        start_id: impl Into<String>,
        end_id: impl Into<String>,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            rel_type: rel_type.into(),
            start_id: start_id.into(),
            end_id: end_id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// One cell of a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawValue {
    Value(Value),
    Node(RawNode),
    Relationship(RawRelationship),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Value(Value::Null))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            RawValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RawValue::Value(v) => v.type_name(),
            RawValue::Node(_) => "node",
            RawValue::Relationship(_) => "relationship",
            RawValue::List(_) => "list",
            RawValue::Map(_) => "map",
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        RawValue::Value(value)
    }
}

impl From<RawNode> for RawValue {
    fn from(node: RawNode) -> Self {
        RawValue::Node(node)
    }
}

impl From<RawRelationship> for RawValue {
    fn from(rel: RawRelationship) -> Self {
        RawValue::Relationship(rel)
    }
}

/// Column names plus rows, in column order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawValue>>,
}

impl QueryOutput {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Output with a single scalar cell
    pub fn scalar(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new([column.into()]).with_row(vec![RawValue::Value(value.into())])
    }

    pub fn with_row(mut self, row: Vec<RawValue>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Integer in `column` of the first row
    pub fn first_integer(&self, column: &str) -> Option<i64> {
        let index = self.column_index(column)?;
        self.rows.first()?.get(index)?.as_value()?.as_i64()
    }
}

/// Statement execution
#[async_trait]
pub trait Driver: Send + Sync {
    /// Run one statement outside any explicit transaction
    async fn execute(&self, query: &str, params: &Parameters) -> Result<QueryOutput>;

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// Unit of work; dropped without `commit` means nothing is applied
#[async_trait]
pub trait Transaction: Send {
    async fn execute(&mut self, query: &str, params: &Parameters) -> Result<QueryOutput>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Compile `plan`, run it and resolve every row
pub async fn fetch<D: Driver + ?Sized>(driver: &D, plan: &QueryPlan) -> Result<Vec<ResolvedRow>> {
    let compiled = Compiler::compile(plan)?;
    let output = driver.execute(&compiled.text, &compiled.params).await?;
    Resolver::new(plan.registry()).resolve(&output, &compiled.shape)
}

/// Compile `plan`, run it and rebuild one subgraph per root entity
pub async fn fetch_subgraphs<D: Driver + ?Sized>(driver: &D, plan: &QueryPlan) -> Result<Vec<Subgraph>> {
    let compiled = Compiler::compile(plan)?;
    let output = driver.execute(&compiled.text, &compiled.params).await?;
    Resolver::new(plan.registry()).resolve_subgraph(&output, &compiled.shape)
}

/// Number of root matches, honouring skip/limit
pub async fn count<D: Driver + ?Sized>(driver: &D, plan: &QueryPlan) -> Result<u64> {
    let compiled = Compiler::compile_count(plan)?;
    let output = driver.execute(&compiled.text, &compiled.params).await?;
    let count = output.first_integer("count").unwrap_or(0);
    u64::try_from(count).map_err(|_| Error::Resolution(format!("negative count {}", count)))
}

/// Merge an entity of `type_name` on its merge keys and return it
pub async fn get_or_create<D: Driver + ?Sized>(
    driver: &D,
    registry: &Registry,
    type_name: &str,
    properties: &BTreeMap<String, Value>,
) -> Result<Entity> {
    let node = registry.node_type(type_name)?;
    let compiled = Compiler::compile_get_or_create(&node, properties)?;
    let output = driver.execute(&compiled.text, &compiled.params).await?;
    let rows = Resolver::new(registry).resolve(&output, &compiled.shape)?;
    single(rows)?
        .and_then(|row| row.take_entity(&node.variable()))
        .ok_or_else(|| Error::Resolution(format!("get-or-create of {} returned no entity", type_name)))
}
