//! Error types shared by the state-indexer crates.

use thiserror::Error;

/// Errors raised while building or loading shared types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TypesError::Config("missing file".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing file");

        let err = TypesError::InvalidInput("batch_size must be > 0".to_string());
        assert_eq!(err.to_string(), "Invalid input: batch_size must be > 0");
    }
}
