//! Runtime settings consumed by the cardinality guard

use serde::{Deserialize, Serialize};

/// Function used to address entities by identity in guard queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFunction {
    #[default]
    ElementId,
    /// Legacy integer ids
    Id,
}

impl IdFunction {
    /// `elementId(var)` or `id(var)`
    pub fn apply(self, var: &str) -> String {
        match self {
            IdFunction::ElementId => format!("elementId({})", var),
            IdFunction::Id => format!("id({})", var),
        }
    }
}

/// Guard settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Only warn when a connect would break the cardinality declared on the target side
    pub soft_inverse_cardinality_check: bool,

    pub id_function: IdFunction,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_soft_inverse_check(mut self) -> Self {
        self.soft_inverse_cardinality_check = true;
        self
    }

    pub fn with_id_function(mut self, id_function: IdFunction) -> Self {
        self.id_function = id_function;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(!settings.soft_inverse_cardinality_check);
        assert_eq!(settings.id_function, IdFunction::ElementId);
    }

    #[test]
    fn test_partial_document() {
        let settings: Settings = serde_json::from_str(r#"{"id_function": "id"}"#).unwrap();
        assert_eq!(settings.id_function, IdFunction::Id);
        assert_eq!(settings.id_function.apply("n"), "id(n)");
        assert_eq!(IdFunction::ElementId.apply("n"), "elementId(n)");
    }
}
