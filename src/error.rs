//! Error types for the mtf-ensemble library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parameter count mismatch: model declares {expected}, got {actual}")]
    ParameterCountMismatch { expected: usize, actual: usize },

    #[error("Invalid ensemble count {0}: at least one ensemble is required")]
    InvalidEnsembleCount(usize),

    #[error("Invalid {distribution} parameter: {reason}")]
    InvalidDistributionParameter {
        distribution: &'static str,
        reason: String,
    },

    #[error("Insufficient rows in parameter table: need {required}, have {available}")]
    InsufficientRows { required: usize, available: usize },

    #[error("Parameter table has no column '{0}'")]
    MissingColumn(String),

    #[error("Parameter index {index} out of range for {len} parameters")]
    ParameterIndexOutOfRange { index: usize, len: usize },

    #[error("Fitter initialization failed: {0}")]
    FitterInitialization(String),

    #[error("Fit failed: {0}")]
    Fit(String),

    #[error("Run cancelled after {completed} of {requested} trials")]
    Cancelled { completed: usize, requested: usize },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnsembleError {
    /// Whether the error aborts a whole run rather than a single trial.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Fit(_))
    }

    /// Report any error from fitter setup as `FitterInitialization`.
    pub(crate) fn into_initialization(self) -> Self {
        match self {
            Self::FitterInitialization(_) => self,
            other => Self::FitterInitialization(other.to_string()),
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, EnsembleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fit_errors_are_recoverable() {
        assert!(!EnsembleError::Fit("no convergence".into()).is_fatal());
        assert!(EnsembleError::FitterInitialization("empty model".into()).is_fatal());
        assert!(EnsembleError::InvalidEnsembleCount(0).is_fatal());
    }

    #[test]
    fn test_initialization_errors_are_not_rewrapped() {
        let err = EnsembleError::FitterInitialization("empty template".into()).into_initialization();
        assert_eq!(err.to_string(), "Fitter initialization failed: empty template");

        let err = EnsembleError::InvalidModel("no channels".into()).into_initialization();
        assert!(matches!(err, EnsembleError::FitterInitialization(_)));
        assert_eq!(
            err.to_string(),
            "Fitter initialization failed: Invalid model: no channels"
        );
    }

    #[test]
    fn test_messages() {
        let err = EnsembleError::InsufficientRows {
            required: 60,
            available: 59,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient rows in parameter table: need 60, have 59"
        );
    }
}
