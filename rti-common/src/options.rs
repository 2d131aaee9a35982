//! Generator options
//!
//! Read-only key/value options consulted while exporting. The JSON keys
//! are the upper-case option names (`HOTSTART_QP`, `PRINTLEVEL`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Hessian approximation used by the exported RTI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HessianApproximation {
    #[default]
    GaussNewton,
    /// Requires multiplier reconstruction in the expansion step
    ExactHessian,
}

impl fmt::Display for HessianApproximation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HessianApproximation::GaussNewton => write!(f, "GAUSS_NEWTON"),
            HessianApproximation::ExactHessian => write!(f, "EXACT_HESSIAN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrintLevel {
    None,
    Low,
    #[default]
    Medium,
    High,
}

/// Options consulted by the block-condensing exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct GeneratorOptions {
    pub hessian_approximation: HessianApproximation,
    /// Per-stage weighting matrices instead of one shared matrix
    pub cg_use_variable_weighting_matrix: bool,
    /// Values <= 0 mean "derive from the number of QP variables"
    pub max_num_qp_iterations: i32,
    #[serde(rename = "PRINTLEVEL")]
    pub print_level: PrintLevel,
    pub cg_use_openmp: bool,
    pub hotstart_qp: bool,
    pub cg_export_folder_name: PathBuf,
    pub cg_hardcode_constraint_values: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            hessian_approximation: HessianApproximation::GaussNewton,
            cg_use_variable_weighting_matrix: false,
            max_num_qp_iterations: -1,
            print_level: PrintLevel::Medium,
            cg_use_openmp: false,
            hotstart_qp: false,
            cg_export_folder_name: PathBuf::from("export"),
            cg_hardcode_constraint_values: true,
        }
    }
}

impl GeneratorOptions {
    pub fn exact_hessian(&self) -> bool {
        self.hessian_approximation == HessianApproximation::ExactHessian
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let options = GeneratorOptions::default();
        assert!(!options.exact_hessian());
        assert_eq!(options.max_num_qp_iterations, -1);
        assert_eq!(options.print_level, PrintLevel::Medium);
        assert!(options.cg_hardcode_constraint_values);
    }

    #[test]
    fn test_upper_case_keys() {
        let json = r#"{
            "HESSIAN_APPROXIMATION": "EXACT_HESSIAN",
            "MAX_NUM_QP_ITERATIONS": 0,
            "PRINTLEVEL": "HIGH",
            "CG_USE_OPENMP": true,
            "HOTSTART_QP": true,
            "CG_EXPORT_FOLDER_NAME": "out/solver"
        }"#;
        let options: GeneratorOptions = serde_json::from_str(json).unwrap();
        assert!(options.exact_hessian());
        assert_eq!(options.max_num_qp_iterations, 0);
        assert_eq!(options.print_level, PrintLevel::High);
        assert!(options.cg_use_openmp);
        assert!(options.hotstart_qp);
        assert_eq!(options.cg_export_folder_name, PathBuf::from("out/solver"));
        // Missing keys fall back to defaults
        assert!(!options.cg_use_variable_weighting_matrix);
        assert!(options.cg_hardcode_constraint_values);
    }

    #[test]
    fn test_print_level_ordering() {
        assert!(PrintLevel::High > PrintLevel::Medium);
        assert!(PrintLevel::None < PrintLevel::Low);
    }
}
