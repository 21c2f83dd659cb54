//! Error types for Trellis Core

use crate::cardinality::CardinalityViolation;
use crate::descriptor::LabelSet;
use crate::limits::ValidationError;
use crate::path::PathMode;
use thiserror::Error;

/// Result type alias using Trellis' Error
pub type Result<T> = std::result::Result<T, Error>;

/// Trellis error types
///
/// Variants are grouped by the stage that raises them: registration,
/// plan authoring, compilation, result resolution, property codecs and
/// relationship constraints.
#[derive(Error, Debug)]
pub enum Error {
    // Registration
    #[error("Label set {labels} is already registered to {existing}, cannot register {name}")]
    DuplicateType {
        name: String,
        labels: LabelSet,
        existing: String,
    },

    #[error("Type {name} is registered with labels {previous}, cannot re-register it with {requested}")]
    RelabelConflict {
        name: String,
        previous: LabelSet,
        requested: LabelSet,
    },

    #[error("Relationship label {rel_type} is bound to {bound}, cannot rebind it to unrelated {requested}")]
    RelationshipRedefined {
        rel_type: String,
        bound: String,
        requested: String,
    },

    #[error("No registered type matches labels {labels}")]
    UnknownType { labels: LabelSet },

    #[error("Type not registered: {0}")]
    UnknownTypeName(String),

    #[error("Labels {labels} match more than one type equally well: {candidates:?}")]
    AmbiguousType {
        labels: LabelSet,
        candidates: Vec<String>,
    },

    // Plan authoring
    #[error("{type_name} has no relationship named {hop}")]
    UnknownRelation { type_name: String, hop: String },

    #[error("{type_name} has no property named {property}")]
    UnknownProperty { type_name: String, property: String },

    #[error("Plan already traverses in {committed} mode, cannot add a {requested} traversal")]
    IncompatibleMode {
        committed: PathMode,
        requested: PathMode,
    },

    #[error("Alias {0} is declared more than once")]
    DuplicateAlias(String),

    #[error("Invalid filter on {field}: {message}")]
    InvalidFilter { field: String, message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // Compilation
    #[error("Field path {path} is not bound in {context}")]
    UnboundFieldPath { path: String, context: String },

    #[error("Projection {0} is declared more than once")]
    DuplicateProjection(String),

    #[error("Compile error: {0}")]
    Compile(String),

    // Resolution
    #[error("No registered type matches labels {labels}; registered types:\n{registry}")]
    UnresolvedEntity { labels: LabelSet, registry: String },

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Expected at most one result, got {0}")]
    MultipleResults(usize),

    // Property codecs
    #[error("Cannot encode {property}: {message}")]
    Encode { property: String, message: String },

    #[error("Cannot decode {property}: {message}")]
    Decode { property: String, message: String },

    // Relationship constraints
    #[error("Attempted cardinality violation on {relationship}: {message}")]
    AttemptedCardinalityViolation {
        relationship: String,
        message: String,
    },

    #[error("{0}")]
    CardinalityViolation(Box<CardinalityViolation>),

    #[error("{relationship} cannot point at {actual}, expected {expected}")]
    TargetTypeMismatch {
        relationship: String,
        expected: String,
        actual: String,
    },

    #[error("{source_id} is not connected to {target_id} via {relationship}")]
    NotConnected {
        source_id: String,
        target_id: String,
        relationship: String,
    },

    // Driver boundary
    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
