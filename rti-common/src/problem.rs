//! Problem configuration
//!
//! The exporter is driven by a small JSON document describing the horizon,
//! the dimensions, the block size and the generator options.

use crate::error::ExportError;
use crate::options::GeneratorOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Horizon and variable dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Differential states per stage
    pub nx: usize,
    /// Controls per stage
    pub nu: usize,
    /// Stage measurement outputs
    #[serde(default)]
    pub ny: usize,
    /// Terminal measurement outputs
    #[serde(default)]
    pub nyn: usize,
    /// Number of shooting stages
    pub n: usize,
}

impl Dimensions {
    pub fn new(nx: usize, nu: usize, ny: usize, nyn: usize, n: usize) -> Self {
        Self { nx, nu, ny, nyn, n }
    }
}

/// A simple bound on one component of the state or control vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxBound {
    pub component: usize,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl BoxBound {
    pub fn is_active(&self) -> bool {
        self.lower.is_some_and(f64::is_finite) || self.upper.is_some_and(f64::is_finite)
    }
}

/// Complete description of one export job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemConfig {
    pub dims: Dimensions,
    pub block_size: usize,
    #[serde(default = "default_true")]
    pub initial_state_fixed: bool,
    /// Levenberg-Marquardt term added to the terminal Hessian
    #[serde(default)]
    pub levenberg_marquardt: f64,
    /// Add the Levenberg-Marquardt term to every stage Hessian as well
    #[serde(default)]
    pub regularize_hessian: bool,
    /// Constant linear state term of the objective; a run-time buffer when absent
    #[serde(default)]
    pub linear_state_term: Option<Vec<f64>>,
    #[serde(default)]
    pub state_bounds: Vec<BoxBound>,
    #[serde(default)]
    pub control_bounds: Vec<BoxBound>,
    #[serde(default)]
    pub options: GeneratorOptions,
}

fn default_true() -> bool {
    true
}

impl ProblemConfig {
    /// Configuration with default options and no bounds
    pub fn new(dims: Dimensions, block_size: usize) -> Self {
        Self {
            dims,
            block_size,
            initial_state_fixed: true,
            levenberg_marquardt: 0.0,
            regularize_hessian: false,
            linear_state_term: None,
            state_bounds: Vec::new(),
            control_bounds: Vec::new(),
            options: GeneratorOptions::default(),
        }
    }

    pub fn has_bounds(&self) -> bool {
        self.state_bounds.iter().any(BoxBound::is_active)
            || self.control_bounds.iter().any(BoxBound::is_active)
    }

    /// Check everything that does not depend on the block layout
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.dims.n == 0 {
            return Err(ExportError::invalid_configuration(
                "horizon length N must be at least 1",
            ));
        }

        if !self.levenberg_marquardt.is_finite() || self.levenberg_marquardt < 0.0 {
            return Err(ExportError::invalid_configuration(format!(
                "Levenberg-Marquardt term must be finite and non-negative, got {}",
                self.levenberg_marquardt
            )));
        }

        if let Some(slx) = &self.linear_state_term {
            if slx.len() != self.dims.nx {
                return Err(ExportError::invalid_configuration(format!(
                    "linear state term has {} entries, expected NX = {}",
                    slx.len(),
                    self.dims.nx
                )));
            }
        }

        for bound in &self.state_bounds {
            if bound.component >= self.dims.nx {
                return Err(ExportError::invalid_configuration(format!(
                    "state bound on component {} but NX = {}",
                    bound.component, self.dims.nx
                )));
            }
        }

        for bound in &self.control_bounds {
            if bound.component >= self.dims.nu {
                return Err(ExportError::invalid_configuration(format!(
                    "control bound on component {} but NU = {}",
                    bound.component, self.dims.nu
                )));
            }
        }

        Ok(())
    }
}

/// Load and validate a problem configuration from a JSON file
pub fn load_config(path: &Path) -> Result<ProblemConfig, ExportError> {
    let content = std::fs::read_to_string(path)?;
    let config: ProblemConfig = serde_json::from_str(&content)?;
    config.validate()?;
    log::debug!(
        "Loaded {}: N = {}, NX = {}, NU = {}, block size {}",
        path.display(),
        config.dims.n,
        config.dims.nx,
        config.dims.nu,
        config.block_size
    );
    Ok(config)
}

/// Save a problem configuration as pretty-printed JSON
pub fn save_config(config: &ProblemConfig, path: &Path) -> Result<(), ExportError> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
