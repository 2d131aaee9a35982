//! Error handling for the RTI generator
//!
//! Generation-time failures are structural: a feature that is selected but
//! not supported, or a configuration that cannot be laid out. Run-time
//! failures of the generated code (solver or model status codes) never show
//! up here, they are returned verbatim by the generated procedures.

use thiserror::Error;

/// Main error type shared by every generation phase
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExportError {
    /// A feature was selected that the block-condensing exporter does not
    /// support. Generation stops instead of substituting something else.
    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("IR construction error: {message}")]
    Ir { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Internal generator error: {message}")]
    InternalError { message: String },
}

impl ExportError {
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        ExportError::NotImplemented {
            feature: feature.into(),
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        ExportError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// True for the "selected but unsupported" class of errors
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, ExportError::NotImplemented { .. })
    }

    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, ExportError::InvalidConfiguration { .. })
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::InvalidConfiguration {
            message: err.to_string(),
        }
    }
}

/// Convert from String (for simple error cases)
impl From<String> for ExportError {
    fn from(message: String) -> Self {
        ExportError::InternalError { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = ExportError::not_implemented("exact Hessian multipliers");
        assert!(err.is_not_implemented());
        assert!(!err.is_invalid_configuration());
        assert_eq!(err.to_string(), "Not implemented: exact Hessian multipliers");

        let err = ExportError::invalid_configuration("block size 5 exceeds horizon 4");
        assert!(err.is_invalid_configuration());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: block size 5 exceeds horizon 4"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.json");
        let err: ExportError = io.into();
        assert!(matches!(err, ExportError::IoError { .. }));
    }

    #[test]
    fn test_string_conversion() {
        let err: ExportError = "unexpected".to_string().into();
        assert_eq!(err.to_string(), "Internal generator error: unexpected");
    }
}
