//! Trellis Core - declarative graph query compiler and result resolver
//!
//! Applications describe node and relationship types in a [`Registry`], build
//! a [`QueryPlan`] from filters and traversals, compile it to a single
//! parameterized Cypher statement with [`Compiler`], and map the rows a
//! [`Driver`] returns back to typed entities with [`Resolver`].
//! Relationship writes go through the [`CardinalityGuard`].

#![allow(clippy::result_large_err)]

pub mod cardinality;
pub mod codec;
pub mod compiler;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod limits;
pub mod path;
pub mod plan;
pub mod predicate;
pub mod registry;
pub mod resolver;
pub mod settings;
pub mod value;

pub use cardinality::{CardinalityGuard, CardinalityViolation, MutationOutcome, ValidationReport};
pub use codec::{
    ArrayCodec, BooleanCodec, CodecError, DateTimeCodec, FloatCodec, IntegerCodec, JsonCodec, PropertyCodec,
    StringCodec, UniqueIdCodec,
};
pub use compiler::{Column, ColumnKind, CompiledQuery, Compiler, ResultShape};
pub use descriptor::{
    Cardinality, Direction, Enforcement, IndexIntent, LabelSet, NodeType, PropertyDef, RelationshipDef,
    RelationshipType,
};
pub use driver::{count, fetch, fetch_subgraphs, get_or_create, Driver, QueryOutput, RawNode, RawRelationship, RawValue, Transaction};
pub use error::{Error, Result};
pub use limits::ValidationError;
pub use path::{PathMode, PathSpec, TraverseOptions};
pub use plan::{Expr, OrderTerm, Pagination, QueryPlan, Transform, VarRef};
pub use predicate::{FieldPath, Operator, Predicate};
pub use registry::Registry;
pub use resolver::{first, single, Entity, FromEntity, Relationship, Resolved, ResolvedRow, Resolver, Subgraph, SubgraphEdge};
pub use settings::{IdFunction, Settings};
pub use value::{Parameters, Value};
