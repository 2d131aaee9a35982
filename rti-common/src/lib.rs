//! Block-condensing RTI generator - Common Types and Utilities
//!
//! This crate contains the error taxonomy, the generator options and the
//! problem configuration shared by every phase of the exporter.

pub mod error;
pub mod options;
pub mod problem;

pub use error::ExportError;
pub use options::{GeneratorOptions, HessianApproximation, PrintLevel};
pub use problem::{load_config, save_config, BoxBound, Dimensions, ProblemConfig};
