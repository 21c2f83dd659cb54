//! Input validation limits for names that end up inside query text
//!
//! Values are always bound as parameters, but labels, relationship types,
//! property names and variable names are written into the query itself.
//! Everything of that kind passes through one of these checks first.

/// Maximum length for identifiers: property names, aliases, hop names (255 chars)
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Maximum length for a label or relationship type (255 chars)
pub const MAX_LABEL_LEN: usize = 255;

/// Maximum labels carried by a single type, ancestors included (32)
pub const MAX_LABELS_PER_TYPE: usize = 32;

/// Maximum optional labels per type (8, i.e. 256 registered combinations)
pub const MAX_OPTIONAL_LABELS: usize = 8;

/// Maximum hops in a single path expression (16)
pub const MAX_PATH_HOPS: usize = 16;

/// Validation error type
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyIdentifier,
    IdentifierTooLong { len: usize, max: usize },
    InvalidIdentifier { name: String },
    EmptyLabel,
    LabelTooLong { len: usize, max: usize },
    InvalidLabel { label: String },
    TooManyLabels { count: usize, max: usize },
    TooManyOptionalLabels { count: usize, max: usize },
    EmptyPath,
    PathTooLong { hops: usize, max: usize },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyIdentifier => write!(f, "Identifier cannot be empty"),
            Self::IdentifierTooLong { len, max } => {
                write!(f, "Identifier too long: {} chars (max {})", len, max)
            }
            Self::InvalidIdentifier { name } => write!(
                f,
                "Invalid identifier {:?}: expected letters, digits and underscores, not starting with a digit",
                name
            ),
            Self::EmptyLabel => write!(f, "Label cannot be empty"),
            Self::LabelTooLong { len, max } => {
                write!(f, "Label too long: {} chars (max {})", len, max)
            }
            Self::InvalidLabel { label } => {
                write!(f, "Invalid label {:?}: control characters are not allowed", label)
            }
            Self::TooManyLabels { count, max } => {
                write!(f, "Too many labels: {} (max {})", count, max)
            }
            Self::TooManyOptionalLabels { count, max } => {
                write!(f, "Too many optional labels: {} (max {})", count, max)
            }
            Self::EmptyPath => write!(f, "Path expression cannot be empty"),
            Self::PathTooLong { hops, max } => {
                write!(f, "Path too long: {} hops (max {})", hops, max)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate an identifier written verbatim into query text
pub fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyIdentifier);
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::IdentifierTooLong {
            len: name.len(),
            max: MAX_IDENTIFIER_LEN,
        });
    }
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::InvalidIdentifier {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate a label or relationship type (these are always backtick-quoted)
pub fn validate_label(label: &str) -> Result<(), ValidationError> {
    if label.is_empty() {
        return Err(ValidationError::EmptyLabel);
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(ValidationError::LabelTooLong {
            len: label.len(),
            max: MAX_LABEL_LEN,
        });
    }
    if label.chars().any(char::is_control) {
        return Err(ValidationError::InvalidLabel {
            label: label.to_string(),
        });
    }
    Ok(())
}

/// Validate label counts for one type
pub fn validate_label_count(count: usize, optional: usize) -> Result<(), ValidationError> {
    if count > MAX_LABELS_PER_TYPE {
        return Err(ValidationError::TooManyLabels {
            count,
            max: MAX_LABELS_PER_TYPE,
        });
    }
    if optional > MAX_OPTIONAL_LABELS {
        return Err(ValidationError::TooManyOptionalLabels {
            count: optional,
            max: MAX_OPTIONAL_LABELS,
        });
    }
    Ok(())
}

/// Validate the hop count of a path expression
pub fn validate_path_length(hops: usize) -> Result<(), ValidationError> {
    if hops == 0 {
        return Err(ValidationError::EmptyPath);
    }
    if hops > MAX_PATH_HOPS {
        return Err(ValidationError::PathTooLong {
            hops,
            max: MAX_PATH_HOPS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("delivery_cost").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2fast").is_err());
        assert!(validate_identifier("name) DETACH DELETE (n").is_err());
        assert!(validate_identifier(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_validate_label() {
        assert!(validate_label("COFFEE SUPPLIERS").is_ok());
        assert!(validate_label("").is_err());
        assert!(validate_label("bad\nlabel").is_err());
    }

    #[test]
    fn test_validate_path_length() {
        assert!(validate_path_length(3).is_ok());
        assert_eq!(validate_path_length(0), Err(ValidationError::EmptyPath));
        assert!(validate_path_length(MAX_PATH_HOPS + 1).is_err());
    }
}
