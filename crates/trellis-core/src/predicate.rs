//! Predicate trees: field/operator/value leaves combined with AND, OR, NOT
//!
//! Field paths use `__` between hops and before the operator suffix, and `|`
//! to address a property stored on the relationship of the last hop:
//!
//! ```text
//! name__icontains            property `name` on the root
//! suppliers__country__code   property `code` two hops away
//! suppliers|since__gt        property `since` on the `suppliers` relationship
//! ```

use crate::error::{Error, Result};
use crate::limits::{validate_identifier, validate_path_length};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, Not};

/// Comparison operator of a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Exact,
    IExact,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    In,
    IsNull,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Regex,
    IRegex,
}

impl Operator {
    const ALL: [Operator; 17] = [
        Operator::Exact,
        Operator::IExact,
        Operator::Ne,
        Operator::Lt,
        Operator::Gt,
        Operator::Lte,
        Operator::Gte,
        Operator::In,
        Operator::IsNull,
        Operator::Contains,
        Operator::IContains,
        Operator::StartsWith,
        Operator::IStartsWith,
        Operator::EndsWith,
        Operator::IEndsWith,
        Operator::Regex,
        Operator::IRegex,
    ];

    /// Suffix used in lookup strings
    pub fn suffix(self) -> &'static str {
        match self {
            Operator::Exact => "exact",
            Operator::IExact => "iexact",
            Operator::Ne => "ne",
            Operator::Lt => "lt",
            Operator::Gt => "gt",
            Operator::Lte => "lte",
            Operator::Gte => "gte",
            Operator::In => "in",
            Operator::IsNull => "isnull",
            Operator::Contains => "contains",
            Operator::IContains => "icontains",
            Operator::StartsWith => "startswith",
            Operator::IStartsWith => "istartswith",
            Operator::EndsWith => "endswith",
            Operator::IEndsWith => "iendswith",
            Operator::Regex => "regex",
            Operator::IRegex => "iregex",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.suffix() == suffix)
    }

    /// Operators lowered to a regular-expression match
    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            Operator::IExact
                | Operator::Contains
                | Operator::IContains
                | Operator::StartsWith
                | Operator::IStartsWith
                | Operator::EndsWith
                | Operator::IEndsWith
                | Operator::Regex
                | Operator::IRegex
        )
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Parsed field path: hops from the root, then a property
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    pub hops: Vec<String>,
    pub property: String,
    /// Property lives on the relationship of the last hop
    pub on_relationship: bool,
}

impl FieldPath {
    pub fn parse(expr: &str) -> Result<Self> {
        let (hop_part, property, on_relationship) = match expr.split_once('|') {
            Some((hops, property)) => (Some(hops), property, true),
            None => match expr.rsplit_once("__") {
                Some((hops, property)) => (Some(hops), property, false),
                None => (None, expr, false),
            },
        };

        let hops = match hop_part {
            Some(part) => parse_hops(part)?,
            None => Vec::new(),
        };
        if on_relationship && hops.is_empty() {
            return Err(Error::InvalidFilter {
                field: expr.to_string(),
                message: "relationship properties need a hop before '|'".to_string(),
            });
        }
        validate_identifier(property)?;

        Ok(Self {
            hops,
            property: property.to_string(),
            on_relationship,
        })
    }

    /// Hop names joined with `__`; empty for root properties
    pub fn chain(&self) -> String {
        self.hops.join("__")
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hops.is_empty() {
            write!(f, "{}", self.property)
        } else if self.on_relationship {
            write!(f, "{}|{}", self.chain(), self.property)
        } else {
            write!(f, "{}__{}", self.chain(), self.property)
        }
    }
}

/// Split a hop expression like `a__b__c` into validated hop names
pub fn parse_hops(expr: &str) -> Result<Vec<String>> {
    let hops: Vec<String> = expr.split("__").map(str::to_string).collect();
    validate_path_length(hops.len())?;
    for hop in &hops {
        validate_identifier(hop)?;
    }
    Ok(hops)
}

/// A single comparison
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: FieldPath,
    pub operator: Operator,
    pub value: Value,
}

/// Immutable boolean expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Leaf(Condition),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Leaf comparison; the operand shape is checked against the operator
    pub fn leaf(field: &str, operator: Operator, value: impl Into<Value>) -> Result<Self> {
        let field_path = FieldPath::parse(field)?;
        let value = value.into();

        let problem = match operator {
            Operator::In if value.as_list().is_none() => Some("expects a list"),
            Operator::IsNull if value.as_bool().is_none() => Some("expects a bool"),
            op if op.is_pattern() && value.as_str().is_none() => Some("expects a string"),
            _ => None,
        };
        if let Some(problem) = problem {
            return Err(Error::InvalidFilter {
                field: field.to_string(),
                message: format!("{} {}, got {}", operator, problem, value.type_name()),
            });
        }

        Ok(Predicate::Leaf(Condition {
            field: field_path,
            operator,
            value,
        }))
    }

    /// Leaf from a lookup string such as `price__gt`; no suffix means `exact`
    pub fn lookup(lookup: &str, value: impl Into<Value>) -> Result<Self> {
        let (field, operator) = match lookup.rsplit_once("__") {
            Some((field, suffix)) => match Operator::from_suffix(suffix) {
                Some(op) => (field, op),
                None => (lookup, Operator::Exact),
            },
            None => (lookup, Operator::Exact),
        };
        Self::leaf(field, operator, value)
    }

    /// N-ary AND; nested ANDs are flattened and a single child is returned as is
    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut children = Vec::new();
        for predicate in predicates {
            match predicate {
                Predicate::And(nested) => children.extend(nested),
                other => children.push(other),
            }
        }
        if children.len() == 1 {
            children.remove(0)
        } else {
            Predicate::And(children)
        }
    }

    /// N-ary OR; nested ORs are flattened and a single child is returned as is
    pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut children = Vec::new();
        for predicate in predicates {
            match predicate {
                Predicate::Or(nested) => children.extend(nested),
                other => children.push(other),
            }
        }
        if children.len() == 1 {
            children.remove(0)
        } else {
            Predicate::Or(children)
        }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Predicate::Not(Box::new(predicate))
    }

    /// All leaves, depth first
    pub fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            Predicate::Leaf(condition) => out.push(condition),
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.collect_conditions(out);
                }
            }
            Predicate::Not(inner) => inner.collect_conditions(out),
        }
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        Predicate::and([self, rhs])
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        Predicate::or([self, rhs])
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::negate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(lookup: &str, value: impl Into<Value>) -> Predicate {
        Predicate::lookup(lookup, value).unwrap()
    }

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("name").unwrap();
        assert!(path.hops.is_empty());
        assert_eq!(path.property, "name");

        let path = FieldPath::parse("suppliers__country__code").unwrap();
        assert_eq!(path.hops, vec!["suppliers", "country"]);
        assert_eq!(path.property, "code");
        assert_eq!(path.chain(), "suppliers__country");
        assert!(!path.on_relationship);

        let path = FieldPath::parse("suppliers|since").unwrap();
        assert_eq!(path.hops, vec!["suppliers"]);
        assert!(path.on_relationship);
        assert_eq!(path.to_string(), "suppliers|since");

        assert!(FieldPath::parse("|since").is_err());
        assert!(FieldPath::parse("suppliers__").is_err());
        assert!(FieldPath::parse("name` = 1 //").is_err());
    }

    #[test]
    fn test_lookup_suffix() {
        let Predicate::Leaf(cond) = q("price__gt", 10) else {
            panic!("expected a leaf");
        };
        assert_eq!(cond.operator, Operator::Gt);
        assert_eq!(cond.field.property, "price");

        let Predicate::Leaf(cond) = q("suppliers|since__lte", "2020") else {
            panic!("expected a leaf");
        };
        assert_eq!(cond.operator, Operator::Lte);
        assert!(cond.field.on_relationship);

        // Unknown suffix is part of the path
        let Predicate::Leaf(cond) = q("suppliers__name", "Acme") else {
            panic!("expected a leaf");
        };
        assert_eq!(cond.operator, Operator::Exact);
        assert_eq!(cond.field.hops, vec!["suppliers"]);
    }

    #[test]
    fn test_operand_shape() {
        assert!(Predicate::lookup("name__in", "x").is_err());
        assert!(Predicate::lookup("name__isnull", "yes").is_err());
        assert!(Predicate::lookup("price__contains", 3).is_err());
        assert!(Predicate::lookup("name__in", vec!["a", "b"]).is_ok());
        assert!(Predicate::lookup("name__isnull", true).is_ok());
    }

    #[test]
    fn test_and_flattens() {
        let a = q("a", 1);
        let b = q("b", 2);
        let c = q("c", 3);

        let chained = (a.clone() & b.clone()) & c.clone();
        assert_eq!(chained, Predicate::And(vec![a.clone(), b.clone(), c.clone()]));

        let grouped = (a.clone() | b.clone()) & c.clone();
        assert_eq!(
            grouped,
            Predicate::And(vec![Predicate::Or(vec![a.clone(), b.clone()]), c.clone()])
        );
        assert_eq!(Predicate::and([a.clone()]), a);
    }

    #[test]
    fn test_conditions_walk() {
        let tree = q("a", 1) | !(q("b", 2) & q("c", 3));
        let names: Vec<&str> = tree
            .conditions()
            .iter()
            .map(|c| c.field.property.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
