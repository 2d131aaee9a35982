//! Block-condensing RTI generator - Code Generation
//!
//! This crate turns a problem configuration into the C source of a
//! real-time iteration solver. It includes:
//!
//! - Block partition of the horizon
//! - Condensing and expansion engines
//! - QP interface adapter for a FORCES-style multistage solver
//! - RTI scheduler (initialization, preparation, feedback and KKT query)

pub mod condensing;
pub mod expansion;
pub mod multipliers;
pub mod partition;
pub mod qp_interface;
pub mod scheduler;
pub mod variables;

pub use condensing::{CondensingEngine, CondensingFunctions};
pub use expansion::{ExpansionEngine, ExpansionFunctions};
pub use multipliers::{bound_multiplier, check_multiplier_support, BoundIndexSet};
pub use partition::{BlockInfo, BlockPartition};
pub use qp_interface::{iteration_cap, ForcesGenerator, ForcesInterface, GENERATOR_SCRIPT_NAME};
pub use scheduler::{RtiScheduler, SchedulerFunctions, KKT_PLACEHOLDER};
pub use variables::{LinearStateTerm, SolverVariables};

use rti_common::{ExportError, ProblemConfig};
use rti_ir::Module;
use std::path::{Path, PathBuf};

pub const SOURCE_NAME: &str = "rti_solver.c";
pub const HEADER_NAME: &str = "rti_qp_interface.h";

const SOLVER_MODULE: &str = "forces";
const INSTANCE_PREFIX: &str = "rtiForces";

/// Everything produced by one export
#[derive(Debug)]
pub struct ExportedSolver {
    pub module: Module,
    pub partition: BlockPartition,
    pub variables: SolverVariables,
    pub functions: SchedulerFunctions,
    pub source: String,
    pub header: String,
    pub generator: ForcesGenerator,
}

impl ExportedSolver {
    /// Write the source, the interface header and the generator script into `dir`
    pub fn write(&self, dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
        std::fs::create_dir_all(dir)?;
        let source = dir.join(SOURCE_NAME);
        std::fs::write(&source, &self.source)?;
        let header = dir.join(HEADER_NAME);
        std::fs::write(&header, &self.header)?;
        let script = self.generator.export_to(&dir.join(GENERATOR_SCRIPT_NAME))?;
        log::info!("Exported RTI solver to {}", dir.display());
        Ok(vec![source, header, script])
    }
}

/// Generate the complete RTI solver for `config`
pub fn export_solver(config: &ProblemConfig) -> Result<ExportedSolver, ExportError> {
    config.validate()?;
    check_multiplier_support(&config.options)?;
    if config.has_bounds() {
        return Err(ExportError::not_implemented("box constraints"));
    }

    let partition = BlockPartition::new(&config.dims, config.block_size)?;
    log::debug!("Block partition:\n{}", partition);

    let mut module = Module::new("rti_solver");
    let interface = ForcesInterface::new(SOLVER_MODULE, INSTANCE_PREFIX);
    interface.install(&mut module, HEADER_NAME)?;

    let variables = SolverVariables::declare(&mut module, config, &partition)?;
    scheduler::declare_collaborators(&mut module)?;

    let expansion = ExpansionEngine::new(&partition, &variables).emit(&mut module)?;
    let condensing = CondensingEngine::new(&partition, &variables).emit(&mut module)?;
    let functions = RtiScheduler::new(
        config,
        &partition,
        &variables,
        &interface.solve_name(),
        &interface.init_name(),
    )
    .emit(&mut module, &condensing, &expansion)?;

    let generator = ForcesGenerator::configure(config, &partition, SOLVER_MODULE);
    log::warn!("Python solver generator is not implemented; writing the MATLAB script only");

    let source = rti_ir::emit_c(&module);
    let header = interface.render_header(&module, "RTI_QP_INTERFACE_H");
    log::debug!(
        "Generated {} functions, {} bytes of source",
        module.functions.len(),
        source.len()
    );

    Ok(ExportedSolver {
        module,
        partition,
        variables,
        functions,
        source,
        header,
        generator,
    })
}
