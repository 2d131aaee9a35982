use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Function '{0}' takes parameters and cannot be an entry point")]
    NotAnEntryPoint(String),

    #[error("Unknown {storage} variable '{name}'")]
    UnknownVariable { storage: String, name: String },

    #[error("Access to {name}[{index}] out of bounds (length {len})")]
    OutOfBounds {
        name: String,
        index: usize,
        len: usize,
    },

    #[error("Buffer '{name}' expects {expected} values, got {found}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Index '{0}' is not bound")]
    UnboundIndex(String),

    #[error("Parameter '{0}' is not bound")]
    UnboundParameter(String),

    #[error("Variable '{0}' is read-only")]
    ReadOnly(String),

    #[error("External routine '{name}' failed: {message}")]
    External { name: String, message: String },
}
