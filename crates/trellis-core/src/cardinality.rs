//! Cardinality guard: checked relationship mutations
//!
//! Every mutation runs its count queries and its write inside one driver
//! transaction. A failed check rolls the transaction back, so a rejected
//! `connect` never leaves a half-written edge behind.
//!
//! Checks per declared cardinality:
//!
//! ```text
//! connect     AtMostOne, ExactlyOne   existing count must be 0 (both sides)
//! disconnect  AtLeastOne, ExactlyOne  remaining count must stay >= 1
//! reconnect   upper bound on the new target, lower bound on the old one
//! disconnect_all  AtLeastOne, ExactlyOne  no edge may exist; lower bound on every old target
//! replace     upper bound on the new target, lower bound on the old ones
//! ```
//!
//! `disconnect_all` and `replace` follow the same table. The upper bound of
//! the declaring side is always strict. Soft enforcement (per declaration for
//! lower bounds, or for the target side through
//! `Settings::soft_inverse_cardinality_check`) downgrades any other failed
//! check to a warning on the returned [`MutationOutcome`].

use crate::compiler::{quote, relationship_arrow};
use crate::descriptor::{Cardinality, Enforcement, NodeType, RelationshipDef};
use crate::driver::{Driver, Transaction};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::resolver::Entity;
use crate::settings::Settings;
use crate::value::{Parameters, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Persisted count outside a declared bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardinalityViolation {
    pub element_id: String,
    pub type_name: String,
    pub relationship: String,
    pub expected: Cardinality,
    pub actual: usize,
}

impl std::fmt::Display for CardinalityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} has {} {} relationship(s), expected {}",
            self.type_name, self.element_id, self.actual, self.relationship, self.expected
        )
    }
}

/// Result of scanning persisted data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub violations: Vec<CardinalityViolation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// First violation as an error
    pub fn into_result(self) -> Result<()> {
        match self.violations.into_iter().next() {
            Some(violation) => Err(Error::CardinalityViolation(Box::new(violation))),
            None => Ok(()),
        }
    }
}

/// Warnings collected while a mutation was applied under soft enforcement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    pub warnings: Vec<String>,
}

impl MutationOutcome {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Applies relationship mutations after checking declared cardinalities
pub struct CardinalityGuard {
    registry: Arc<Registry>,
    settings: Settings,
}

impl CardinalityGuard {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            settings: Settings::default(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create `source -[relationship]-> target` with encoded relationship properties
    pub async fn connect<D: Driver + ?Sized>(
        &self,
        driver: &D,
        source: &Entity,
        relationship: &str,
        target: &Entity,
        properties: &BTreeMap<String, Value>,
    ) -> Result<MutationOutcome> {
        let def = declaration(source, relationship)?;
        self.check_target(def, target)?;
        let encoded = self.encode_properties(def, properties)?;

        let mut tx = driver.begin_transaction().await?;
        let applied = self.connect_in(&mut *tx, def, source, target, encoded).await;
        let outcome = finish(tx, applied).await?;
        tracing::info!(
            "Connected {} -[{}]-> {}",
            source.element_id,
            def.rel_type,
            target.element_id
        );
        Ok(outcome)
    }

    /// Remove every `relationship` edge between `source` and `target`
    pub async fn disconnect<D: Driver + ?Sized>(
        &self,
        driver: &D,
        source: &Entity,
        relationship: &str,
        target: &Entity,
    ) -> Result<MutationOutcome> {
        let def = declaration(source, relationship)?;

        let mut tx = driver.begin_transaction().await?;
        let applied = self.disconnect_in(&mut *tx, def, source, target).await;
        let outcome = finish(tx, applied).await?;
        tracing::info!(
            "Disconnected {} -[{}]-> {}",
            source.element_id,
            def.rel_type,
            target.element_id
        );
        Ok(outcome)
    }

    /// Move the edge from `old_target` to `new_target` in one transaction
    ///
    /// The source side keeps its count, so only the targets' declarations are checked.
    pub async fn reconnect<D: Driver + ?Sized>(
        &self,
        driver: &D,
        source: &Entity,
        relationship: &str,
        old_target: &Entity,
        new_target: &Entity,
        properties: &BTreeMap<String, Value>,
    ) -> Result<MutationOutcome> {
        let def = declaration(source, relationship)?;
        self.check_target(def, new_target)?;
        let encoded = self.encode_properties(def, properties)?;

        let mut tx = driver.begin_transaction().await?;
        let applied = self
            .reconnect_in(&mut *tx, def, source, old_target, new_target, encoded)
            .await;
        let outcome = finish(tx, applied).await?;
        tracing::info!(
            "Reconnected {} -[{}]-> {} (was {})",
            source.element_id,
            def.rel_type,
            new_target.element_id,
            old_target.element_id
        );
        Ok(outcome)
    }

    /// Remove every `relationship` edge of `source`
    pub async fn disconnect_all<D: Driver + ?Sized>(
        &self,
        driver: &D,
        source: &Entity,
        relationship: &str,
    ) -> Result<MutationOutcome> {
        let def = declaration(source, relationship)?;

        let mut tx = driver.begin_transaction().await?;
        let applied = self.disconnect_all_in(&mut *tx, def, source).await;
        let outcome = finish(tx, applied).await?;
        tracing::info!("Disconnected all {} -[{}]->", source.element_id, def.rel_type);
        Ok(outcome)
    }

    /// Remove every `relationship` edge of `source`, then connect `target`, in one transaction
    pub async fn replace<D: Driver + ?Sized>(
        &self,
        driver: &D,
        source: &Entity,
        relationship: &str,
        target: &Entity,
        properties: &BTreeMap<String, Value>,
    ) -> Result<MutationOutcome> {
        let def = declaration(source, relationship)?;
        self.check_target(def, target)?;
        let encoded = self.encode_properties(def, properties)?;

        let mut tx = driver.begin_transaction().await?;
        let applied = self.replace_in(&mut *tx, def, source, target, encoded).await;
        let outcome = finish(tx, applied).await?;
        tracing::info!(
            "Replaced {} -[{}]-> with {}",
            source.element_id,
            def.rel_type,
            target.element_id
        );
        Ok(outcome)
    }

    /// Whether at least one `relationship` edge joins `source` and `target`
    pub async fn is_connected<D: Driver + ?Sized>(
        &self,
        driver: &D,
        source: &Entity,
        relationship: &str,
        target: &Entity,
    ) -> Result<bool> {
        let def = declaration(source, relationship)?;
        let query = format!("{} RETURN count(r) AS count", self.pair_match(def, "r"));
        let output = driver.execute(&query, &self.pair_params(source, target)).await?;
        Ok(output.first_integer("count").unwrap_or(0) > 0)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    /// Scan persisted data for counts outside every declared bound
    ///
    /// Reports only; nothing is modified and no error is raised for violations.
    pub async fn validate_existing_data<D: Driver + ?Sized>(&self, driver: &D) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for node_type in self.registry.node_types()? {
            for def in node_type.relationships() {
                let (min, max) = def.cardinality.bounds();
                if def.cardinality == Cardinality::ZeroOrMore {
                    continue;
                }

                let mut params = Parameters::new();
                let mut conditions = Vec::new();
                if min > 0 {
                    params.insert("min".to_string(), Value::Integer(min as i64));
                    conditions.push("count < $min");
                }
                if let Some(max) = max {
                    params.insert("max".to_string(), Value::Integer(max as i64));
                    conditions.push("count > $max");
                }
                let query = format!(
                    "MATCH (us:{}) OPTIONAL MATCH (us){}() WITH us, count(r) AS count WHERE {} RETURN {} AS id, count",
                    quote(&node_type.label),
                    relationship_arrow(def.direction, &format!("r:{}", quote(&def.rel_type))),
                    conditions.join(" OR "),
                    self.settings.id_function.apply("us"),
                );
                tracing::debug!("Validating {}.{}: {}", node_type.name, def.name, query);

                let output = driver.execute(&query, &params).await?;
                let (Some(id_index), Some(count_index)) = (output.column_index("id"), output.column_index("count")) else {
                    continue;
                };
                for row in &output.rows {
                    let element_id = match row.get(id_index).and_then(|c| c.as_value()) {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => continue,
                    };
                    let actual = row
                        .get(count_index)
                        .and_then(|c| c.as_value())
                        .and_then(Value::as_i64)
                        .unwrap_or(0)
                        .max(0) as usize;
                    let duplicate = report
                        .violations
                        .iter()
                        .any(|v| v.element_id == element_id && v.relationship == def.name);
                    if !duplicate {
                        report.violations.push(CardinalityViolation {
                            element_id,
                            type_name: node_type.name.clone(),
                            relationship: def.name.clone(),
                            expected: def.cardinality,
                            actual,
                        });
                    }
                }
            }
        }
        if !report.is_valid() {
            tracing::warn!("Found {} cardinality violations", report.violations.len());
        }
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transaction bodies
    // ─────────────────────────────────────────────────────────────────────────

    async fn connect_in(
        &self,
        tx: &mut dyn Transaction,
        def: &RelationshipDef,
        source: &Entity,
        target: &Entity,
        encoded: Vec<(String, Value)>,
    ) -> Result<MutationOutcome> {
        let mut outcome = MutationOutcome::default();

        if def.cardinality.bounds().1 == Some(1) {
            let existing = self.count_from(tx, def, source).await?;
            if existing > 0 {
                self.reject(
                    &mut outcome,
                    false,
                    def,
                    format!(
                        "{} {} already has {} {} relationship(s), declared {}",
                        source.type_name(),
                        source.element_id,
                        existing,
                        def.name,
                        def.cardinality
                    ),
                )?;
            }
        }

        self.check_inverse_upper(tx, &mut outcome, def, source, target).await?;
        self.create(tx, def, source, target, encoded).await?;
        Ok(outcome)
    }

    async fn disconnect_in(
        &self,
        tx: &mut dyn Transaction,
        def: &RelationshipDef,
        source: &Entity,
        target: &Entity,
    ) -> Result<MutationOutcome> {
        let mut outcome = MutationOutcome::default();

        let between = self.count_between(tx, def, source, target).await?;
        if between == 0 {
            return Err(Error::NotConnected {
                source_id: source.element_id.clone(),
                target_id: target.element_id.clone(),
                relationship: def.name.clone(),
            });
        }

        let (min, _) = def.cardinality.bounds();
        if min > 0 {
            let remaining = self.count_from(tx, def, source).await?.saturating_sub(between);
            if remaining < min {
                self.reject(
                    &mut outcome,
                    def.enforcement == Enforcement::Soft,
                    def,
                    format!(
                        "removing {} from {} {} leaves {}, declared {}",
                        def.name,
                        source.type_name(),
                        source.element_id,
                        remaining,
                        def.cardinality
                    ),
                )?;
            }
        }

        self.check_inverse_lower(tx, &mut outcome, def, source, target, between)
            .await?;
        self.delete(tx, def, source, target).await?;
        Ok(outcome)
    }

    async fn reconnect_in(
        &self,
        tx: &mut dyn Transaction,
        def: &RelationshipDef,
        source: &Entity,
        old_target: &Entity,
        new_target: &Entity,
        encoded: Vec<(String, Value)>,
    ) -> Result<MutationOutcome> {
        let mut outcome = MutationOutcome::default();

        let between = self.count_between(tx, def, source, old_target).await?;
        if between == 0 {
            return Err(Error::NotConnected {
                source_id: source.element_id.clone(),
                target_id: old_target.element_id.clone(),
                relationship: def.name.clone(),
            });
        }
        if old_target.element_id != new_target.element_id {
            self.check_inverse_lower(tx, &mut outcome, def, source, old_target, between)
                .await?;
            self.check_inverse_upper(tx, &mut outcome, def, source, new_target)
                .await?;
        }

        self.delete(tx, def, source, old_target).await?;
        self.create(tx, def, source, new_target, encoded).await?;
        Ok(outcome)
    }

    async fn disconnect_all_in(
        &self,
        tx: &mut dyn Transaction,
        def: &RelationshipDef,
        source: &Entity,
    ) -> Result<MutationOutcome> {
        let mut outcome = MutationOutcome::default();

        let (min, _) = def.cardinality.bounds();
        if min > 0 {
            let existing = self.count_from(tx, def, source).await?;
            if existing > 0 {
                self.reject(
                    &mut outcome,
                    def.enforcement == Enforcement::Soft,
                    def,
                    format!(
                        "removing all {} from {} {} leaves 0, declared {}",
                        def.name,
                        source.type_name(),
                        source.element_id,
                        def.cardinality
                    ),
                )?;
            }
        }

        self.check_inverse_lower_all(tx, &mut outcome, def, source, None)
            .await?;
        self.delete_all(tx, def, source).await?;
        Ok(outcome)
    }

    async fn replace_in(
        &self,
        tx: &mut dyn Transaction,
        def: &RelationshipDef,
        source: &Entity,
        target: &Entity,
        encoded: Vec<(String, Value)>,
    ) -> Result<MutationOutcome> {
        let mut outcome = MutationOutcome::default();

        // Edges already joining the pair are removed and recreated
        let kept = self.count_between(tx, def, source, target).await?;
        self.check_inverse_lower_all(tx, &mut outcome, def, source, Some(target))
            .await?;
        if let Some(inverse) = self.inverse(def, &source.node_type, &target.node_type) {
            if inverse.cardinality.bounds().1 == Some(1) {
                let existing = self
                    .count_from(tx, inverse, target)
                    .await?
                    .saturating_sub(kept);
                if existing > 0 {
                    self.reject(
                        &mut outcome,
                        self.inverse_is_soft(inverse),
                        inverse,
                        format!(
                            "{} {} already has {} {} relationship(s), declared {}",
                            target.type_name(),
                            target.element_id,
                            existing,
                            inverse.name,
                            inverse.cardinality
                        ),
                    )?;
                }
            }
        }

        self.delete_all(tx, def, source).await?;
        self.create(tx, def, source, target, encoded).await?;
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checks
    // ─────────────────────────────────────────────────────────────────────────

    /// The target side may only gain an edge if its declaration allows one more
    async fn check_inverse_upper(
        &self,
        tx: &mut dyn Transaction,
        outcome: &mut MutationOutcome,
        def: &RelationshipDef,
        source: &Entity,
        target: &Entity,
    ) -> Result<()> {
        let Some(inverse) = self.inverse(def, &source.node_type, &target.node_type) else {
            return Ok(());
        };
        if inverse.cardinality.bounds().1 != Some(1) {
            return Ok(());
        }
        let existing = self.count_from(tx, inverse, target).await?;
        if existing > 0 {
            self.reject(
                outcome,
                self.inverse_is_soft(inverse),
                inverse,
                format!(
                    "{} {} already has {} {} relationship(s), declared {}",
                    target.type_name(),
                    target.element_id,
                    existing,
                    inverse.name,
                    inverse.cardinality
                ),
            )?;
        }
        Ok(())
    }

    /// The target side may only lose `removed` edges if its lower bound still holds
    async fn check_inverse_lower(
        &self,
        tx: &mut dyn Transaction,
        outcome: &mut MutationOutcome,
        def: &RelationshipDef,
        source: &Entity,
        target: &Entity,
        removed: usize,
    ) -> Result<()> {
        let Some(inverse) = self.inverse(def, &source.node_type, &target.node_type) else {
            return Ok(());
        };
        let (min, _) = inverse.cardinality.bounds();
        if min == 0 {
            return Ok(());
        }
        let remaining = self.count_from(tx, inverse, target).await?.saturating_sub(removed);
        if remaining < min {
            self.reject(
                outcome,
                self.inverse_is_soft(inverse),
                inverse,
                format!(
                    "removing {} from {} {} leaves {}, declared {}",
                    inverse.name,
                    target.type_name(),
                    target.element_id,
                    remaining,
                    inverse.cardinality
                ),
            )?;
        }
        Ok(())
    }

    /// Every current target of `source` must keep its inverse lower bound once
    /// all of `source`'s edges are gone; `keep` is about to be reconnected
    async fn check_inverse_lower_all(
        &self,
        tx: &mut dyn Transaction,
        outcome: &mut MutationOutcome,
        def: &RelationshipDef,
        source: &Entity,
        keep: Option<&Entity>,
    ) -> Result<()> {
        let id = self.settings.id_function;
        for target_name in &def.targets {
            let target_type = self.registry.node_type(target_name)?;
            let Some(inverse) = self.inverse(def, &source.node_type, &target_type) else {
                continue;
            };
            let (min, _) = inverse.cardinality.bounds();
            if min == 0 {
                continue;
            }

            let mut params = Parameters::new();
            params.insert("source_id".to_string(), self.id_value(&source.element_id));
            params.insert("min".to_string(), Value::Integer(min as i64));
            let mut filter = format!("{} = $source_id", id.apply("us"));
            if let Some(keep) = keep {
                params.insert("target_id".to_string(), self.id_value(&keep.element_id));
                filter.push_str(&format!(" AND NOT {} = $target_id", id.apply("them")));
            }
            let query = format!(
                "MATCH (us){}(them:{}) WHERE {} WITH them, count(r) AS removed \
                 OPTIONAL MATCH (them){}() WITH them, removed, count(r2) AS total \
                 WHERE total - removed < $min RETURN {} AS id, total - removed AS remaining",
                relationship_arrow(def.direction, &format!("r:{}", quote(&def.rel_type))),
                quote(&target_type.label),
                filter,
                relationship_arrow(inverse.direction, &format!("r2:{}", quote(&def.rel_type))),
                id.apply("them"),
            );
            let output = tx.execute(&query, &params).await?;
            let (Some(id_index), Some(remaining_index)) =
                (output.column_index("id"), output.column_index("remaining"))
            else {
                continue;
            };
            for row in &output.rows {
                let element_id = match row.get(id_index).and_then(|c| c.as_value()) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => continue,
                };
                let remaining = row
                    .get(remaining_index)
                    .and_then(|c| c.as_value())
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    .max(0);
                self.reject(
                    outcome,
                    self.inverse_is_soft(inverse),
                    inverse,
                    format!(
                        "removing {} from {} {} leaves {}, declared {}",
                        inverse.name, target_type.name, element_id, remaining, inverse.cardinality
                    ),
                )?;
            }
        }
        Ok(())
    }

    fn inverse_is_soft(&self, inverse: &RelationshipDef) -> bool {
        self.settings.soft_inverse_cardinality_check || inverse.enforcement == Enforcement::Soft
    }

    /// Declaration on `target` covering the same edges from the other end
    fn inverse<'t>(
        &self,
        def: &RelationshipDef,
        source: &NodeType,
        target: &'t NodeType,
    ) -> Option<&'t RelationshipDef> {
        target.relationships().iter().find(|candidate| {
            candidate.rel_type == def.rel_type
                && candidate.direction == def.direction.reversed()
                && candidate.targets.iter().any(|t| self.is_a(source, t))
        })
    }

    fn is_a(&self, node: &NodeType, type_name: &str) -> bool {
        node.name == type_name
            || self
                .registry
                .node_type(type_name)
                .map_or(false, |t| node.has_label(&t.label))
    }

    fn check_target(&self, def: &RelationshipDef, target: &Entity) -> Result<()> {
        if def.targets.iter().any(|t| self.is_a(&target.node_type, t)) {
            return Ok(());
        }
        Err(Error::TargetTypeMismatch {
            relationship: def.name.clone(),
            expected: def.targets.join("|"),
            actual: target.type_name().to_string(),
        })
    }

    fn reject(
        &self,
        outcome: &mut MutationOutcome,
        soft: bool,
        def: &RelationshipDef,
        message: String,
    ) -> Result<()> {
        if soft {
            tracing::warn!("Cardinality of {} not enforced: {}", def.name, message);
            outcome.warnings.push(message);
            return Ok(());
        }
        Err(Error::AttemptedCardinalityViolation {
            relationship: def.name.clone(),
            message,
        })
    }

    /// Relationship properties through the model's codecs, defaults applied
    fn encode_properties(
        &self,
        def: &RelationshipDef,
        properties: &BTreeMap<String, Value>,
    ) -> Result<Vec<(String, Value)>> {
        let Some(model_name) = &def.model else {
            return match properties.keys().next() {
                Some(key) => Err(Error::UnknownProperty {
                    type_name: def.rel_type.clone(),
                    property: key.clone(),
                }),
                None => Ok(Vec::new()),
            };
        };
        let model = self.registry.relationship_type(model_name)?;
        for key in properties.keys() {
            if model.property(key).is_none() {
                return Err(Error::UnknownProperty {
                    type_name: model.name.clone(),
                    property: key.clone(),
                });
            }
        }

        let mut encoded = Vec::new();
        for prop in model.properties() {
            let value = properties
                .get(&prop.name)
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| prop.default_value());
            match value {
                Some(value) => {
                    let stored = prop.codec.encode(&value).map_err(|e| Error::Encode {
                        property: prop.name.clone(),
                        message: e.message,
                    })?;
                    encoded.push((prop.storage_name().to_string(), stored));
                }
                None if prop.required => {
                    return Err(Error::Encode {
                        property: prop.name.clone(),
                        message: "required property has no value".to_string(),
                    });
                }
                None => {}
            }
        }
        Ok(encoded)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn id_value(&self, element_id: &str) -> Value {
        match self.settings.id_function {
            crate::settings::IdFunction::Id => element_id
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::from(element_id)),
            crate::settings::IdFunction::ElementId => Value::from(element_id),
        }
    }

    fn pair_params(&self, source: &Entity, target: &Entity) -> Parameters {
        let mut params = Parameters::new();
        params.insert("source_id".to_string(), self.id_value(&source.element_id));
        params.insert("target_id".to_string(), self.id_value(&target.element_id));
        params
    }

    fn pair_match(&self, def: &RelationshipDef, edge: &str) -> String {
        let id = self.settings.id_function;
        format!(
            "MATCH (us){}(them) WHERE {} = $source_id AND {} = $target_id",
            relationship_arrow(def.direction, &format!("{}:{}", edge, quote(&def.rel_type))),
            id.apply("us"),
            id.apply("them"),
        )
    }

    /// Edges of `def` at `entity`
    async fn count_from(&self, tx: &mut dyn Transaction, def: &RelationshipDef, entity: &Entity) -> Result<usize> {
        let query = format!(
            "MATCH (us){}() WHERE {} = $source_id RETURN count(r) AS count",
            relationship_arrow(def.direction, &format!("r:{}", quote(&def.rel_type))),
            self.settings.id_function.apply("us"),
        );
        let mut params = Parameters::new();
        params.insert("source_id".to_string(), self.id_value(&entity.element_id));
        tracing::debug!("Counting {} at {}", def.name, entity.element_id);
        let output = tx.execute(&query, &params).await?;
        Ok(output.first_integer("count").unwrap_or(0).max(0) as usize)
    }

    async fn count_between(
        &self,
        tx: &mut dyn Transaction,
        def: &RelationshipDef,
        source: &Entity,
        target: &Entity,
    ) -> Result<usize> {
        let query = format!("{} RETURN count(r) AS count", self.pair_match(def, "r"));
        let output = tx.execute(&query, &self.pair_params(source, target)).await?;
        Ok(output.first_integer("count").unwrap_or(0).max(0) as usize)
    }

    async fn create(
        &self,
        tx: &mut dyn Transaction,
        def: &RelationshipDef,
        source: &Entity,
        target: &Entity,
        encoded: Vec<(String, Value)>,
    ) -> Result<()> {
        let mut params = self.pair_params(source, target);
        let mut assignments = Vec::with_capacity(encoded.len());
        for (name, value) in encoded {
            let param = format!("rel_{}", name);
            assignments.push(format!("{}: ${}", name, param));
            params.insert(param, value);
        }
        let properties = if assignments.is_empty() {
            String::new()
        } else {
            format!(" {{{}}}", assignments.join(", "))
        };
        let id = self.settings.id_function;
        let query = format!(
            "MATCH (us), (them) WHERE {} = $source_id AND {} = $target_id MERGE (us){}(them) RETURN r",
            id.apply("us"),
            id.apply("them"),
            relationship_arrow(def.direction, &format!("r:{}{}", quote(&def.rel_type), properties)),
        );
        tx.execute(&query, &params).await?;
        Ok(())
    }

    async fn delete_all(&self, tx: &mut dyn Transaction, def: &RelationshipDef, source: &Entity) -> Result<()> {
        let query = format!(
            "MATCH (us){}() WHERE {} = $source_id DELETE r",
            relationship_arrow(def.direction, &format!("r:{}", quote(&def.rel_type))),
            self.settings.id_function.apply("us"),
        );
        let mut params = Parameters::new();
        params.insert("source_id".to_string(), self.id_value(&source.element_id));
        tx.execute(&query, &params).await?;
        Ok(())
    }

    async fn delete(&self, tx: &mut dyn Transaction, def: &RelationshipDef, source: &Entity, target: &Entity) -> Result<()> {
        let query = format!("{} DELETE r", self.pair_match(def, "r"));
        tx.execute(&query, &self.pair_params(source, target)).await?;
        Ok(())
    }
}

fn declaration<'e>(source: &'e Entity, relationship: &str) -> Result<&'e RelationshipDef> {
    source
        .node_type
        .relationship(relationship)
        .ok_or_else(|| Error::UnknownRelation {
            type_name: source.type_name().to_string(),
            hop: relationship.to_string(),
        })
}

/// Commit on success, roll back and keep the original error otherwise
async fn finish(tx: Box<dyn Transaction>, applied: Result<MutationOutcome>) -> Result<MutationOutcome> {
    match applied {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!("Rollback failed: {}", rollback);
            }
            tracing::debug!("Mutation rejected: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringCodec;
    use crate::descriptor::{PropertyDef, RelationshipType};
    use crate::driver::RawNode;
    use crate::resolver::Resolver;

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .register_relationship(
                RelationshipType::new("Ownership", "OWNS")
                    .with_property(PropertyDef::new("since", StringCodec::new()).required())
                    .with_property(PropertyDef::new("note", StringCodec::new()).with_default("-")),
            )
            .unwrap();
        registry
            .register(
                NodeType::new("Person").with_relationship(
                    RelationshipDef::to("pets", "Pet", "OWNS").with_model("Ownership"),
                ),
            )
            .unwrap();
        registry
            .register(NodeType::new("Pet").with_relationship(
                RelationshipDef::from("owner", "Person", "OWNS").with_cardinality(Cardinality::ExactlyOne),
            ))
            .unwrap();
        registry.register(NodeType::new("Rock")).unwrap();
        Arc::new(registry)
    }

    fn entity(registry: &Registry, id: &str, label: &str) -> Entity {
        Resolver::new(registry).entity(&RawNode::new(id, [label])).unwrap()
    }

    #[test]
    fn test_violation_report() {
        let report = ValidationReport {
            violations: vec![CardinalityViolation {
                element_id: "4:x:1".to_string(),
                type_name: "Pet".to_string(),
                relationship: "owner".to_string(),
                expected: Cardinality::ExactlyOne,
                actual: 0,
            }],
        };
        assert!(!report.is_valid());
        let err = report.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Pet 4:x:1 has 0 owner relationship(s), expected exactly one"
        );
        assert!(ValidationReport::default().into_result().is_ok());
    }

    #[test]
    fn test_inverse_declaration() {
        let registry = registry();
        let guard = CardinalityGuard::new(registry.clone());
        let person = registry.node_type("Person").unwrap();
        let pet = registry.node_type("Pet").unwrap();
        let pets = person.relationship("pets").unwrap();

        let inverse = guard.inverse(pets, &person, &pet).unwrap();
        assert_eq!(inverse.name, "owner");
        assert!(guard.inverse(pets, &person, &registry.node_type("Rock").unwrap()).is_none());
    }

    #[test]
    fn test_target_type_checked() {
        let registry = registry();
        let guard = CardinalityGuard::new(registry.clone());
        let person = registry.node_type("Person").unwrap();
        let pets = person.relationship("pets").unwrap();

        assert!(guard.check_target(pets, &entity(&registry, "p", "Pet")).is_ok());
        let err = guard.check_target(pets, &entity(&registry, "r", "Rock")).unwrap_err();
        assert!(matches!(err, Error::TargetTypeMismatch { ref actual, .. } if actual == "Rock"));
    }

    #[test]
    fn test_relationship_properties_encoded() {
        let registry = registry();
        let guard = CardinalityGuard::new(registry.clone());
        let person = registry.node_type("Person").unwrap();
        let pets = person.relationship("pets").unwrap();

        let mut props = BTreeMap::new();
        props.insert("since".to_string(), Value::from("2021"));
        let encoded = guard.encode_properties(pets, &props).unwrap();
        assert_eq!(
            encoded,
            vec![
                ("since".to_string(), Value::from("2021")),
                ("note".to_string(), Value::from("-")),
            ]
        );

        assert!(matches!(
            guard.encode_properties(pets, &BTreeMap::new()),
            Err(Error::Encode { ref property, .. }) if property == "since"
        ));

        props.insert("color".to_string(), Value::from("red"));
        assert!(matches!(
            guard.encode_properties(pets, &props),
            Err(Error::UnknownProperty { .. })
        ));
    }
}
