//! Buffers of the generated solver
//!
//! Every buffer is declared once in the module with its final shape. The
//! engines only hold the ids and build sub-range views from them.

use crate::partition::BlockPartition;
use rti_common::{ExportError, ProblemConfig};
use rti_ir::{Module, ScalarType, StorageClass, VarId, Variable};

/// Solver parameter, output and info fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpVariables {
    /// Stacked block Hessians, `nb*nbv x nbv`
    pub h: VarId,
    /// Stacked block gradients, `nb*nbv`
    pub f: VarId,
    /// Coupling matrices, `nb*NX x nbv`
    pub c: VarId,
    /// Coupling offsets, `nb*NX`
    pub d: VarId,
    pub hn: VarId,
    pub f_n: VarId,
    /// Entry state of the first block, when the initial state is fixed
    pub c0: Option<VarId>,
    pub z_init: Option<VarId>,
    pub z_last_init: Option<VarId>,
    pub zn_init: Option<VarId>,
    /// Decisions of the full-length blocks, `nbv` per block
    pub z: VarId,
    /// Decisions of a shorter last block
    pub z_last: Option<VarId>,
    /// Terminal state decision
    pub zn: VarId,
    pub it: VarId,
    pub res_eq: VarId,
    pub pobj: VarId,
    pub solvetime: VarId,
}

/// Where the linear state term of the objective comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearStateTerm {
    /// Known at generation time, inlined
    Given(VarId),
    /// One run-time vector for the terminal stage
    Shared(VarId),
    /// One run-time row per stage, `(N+1) x NX`
    PerStage(VarId),
}

impl LinearStateTerm {
    pub fn var(&self) -> VarId {
        match self {
            LinearStateTerm::Given(id) | LinearStateTerm::Shared(id) | LinearStateTerm::PerStage(id) => {
                *id
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolverVariables {
    pub x: VarId,
    pub u: VarId,
    pub y: VarId,
    pub y_n: VarId,
    pub x0: Option<VarId>,
    pub slx: LinearStateTerm,

    pub ev_gx: VarId,
    pub ev_gu: VarId,
    pub d: VarId,
    pub dy: VarId,
    pub dy_n: VarId,
    pub q1: VarId,
    pub s1: VarId,
    pub r1: VarId,
    pub q2: VarId,
    pub r2: VarId,
    pub qn1: VarId,
    pub qn2: VarId,

    pub qp: QpVariables,
}

fn declare(module: &mut Module, variable: Variable) -> Result<VarId, ExportError> {
    Ok(module.add_variable(variable)?)
}

fn real(name: &str, rows: usize, cols: usize, storage: StorageClass, doc: &str) -> Variable {
    Variable::new(name, rows, cols, storage).with_doc(doc)
}

impl SolverVariables {
    pub fn declare(
        module: &mut Module,
        config: &ProblemConfig,
        partition: &BlockPartition,
    ) -> Result<Self, ExportError> {
        use StorageClass::{QpInfo, QpOutput, QpParams, Variables, Workspace};

        let dims = config.dims;
        let (nx, nu, ny, nyn, n) = (dims.nx, dims.nu, dims.ny, dims.nyn, dims.n);
        let nb = partition.number_of_blocks();
        let nbv = partition.num_block_variables();
        let hotstart = config.options.hotstart_qp;

        let x = declare(module, real("x", n + 1, nx, Variables, "Matrix containing N+1 differential variable vectors."))?;
        let u = declare(module, real("u", n, nu, Variables, "Matrix containing N control variable vectors."))?;
        let y = declare(module, real("y", n, ny, Variables, "Matrix containing N reference/measurement vectors."))?;
        let y_n = declare(module, real("yN", nyn, 1, Variables, "Reference/measurement vector for the terminal stage."))?;
        let x0 = if config.initial_state_fixed {
            Some(declare(module, real("x0", nx, 1, Variables, "Current state feedback vector."))?)
        } else {
            None
        };

        let slx = match &config.linear_state_term {
            Some(values) => LinearStateTerm::Given(declare(
                module,
                Variable::given("Slx", nx, 1, values.clone()),
            )?),
            None if config.options.cg_use_variable_weighting_matrix => LinearStateTerm::PerStage(declare(
                module,
                real("Slx", n + 1, nx, Variables, "Linear state terms of the objective, one row per stage."),
            )?),
            None => LinearStateTerm::Shared(declare(
                module,
                real("Slx", nx, 1, Variables, "Linear state term of the terminal objective."),
            )?),
        };

        let ev_gx = declare(module, real("evGx", n * nx, nx, Workspace, "Sensitivities w.r.t. the previous state."))?;
        let ev_gu = declare(module, real("evGu", n * nx, nu, Workspace, "Sensitivities w.r.t. the stage control."))?;
        let d = declare(module, real("d", n * nx, 1, Workspace, "Continuity defects."))?;
        let dy = declare(module, real("Dy", n, ny, Workspace, "Stage output deviations."))?;
        let dy_n = declare(module, real("DyN", nyn, 1, Workspace, "Terminal output deviation."))?;
        let q1 = declare(module, real("Q1", n * nx, nx, Workspace, "Stage state Hessians."))?;
        let s1 = declare(module, real("S1", n * nx, nu, Workspace, "Stage state-control Hessians."))?;
        let r1 = declare(module, real("R1", n * nu, nu, Workspace, "Stage control Hessians."))?;
        let q2 = declare(module, real("Q2", n * nx, ny, Workspace, "Stage state gradient weights."))?;
        let r2 = declare(module, real("R2", n * nu, ny, Workspace, "Stage control gradient weights."))?;
        let qn1 = declare(module, real("QN1", nx, nx, Workspace, "Terminal Hessian."))?;
        let qn2 = declare(module, real("QN2", nx, nyn, Workspace, "Terminal gradient weight."))?;

        let z_len = partition.full_blocks() * nbv;
        let z_last_len = partition
            .has_short_tail()
            .then(|| nx + partition.last_block_len() * nu);
        let qp = QpVariables {
            h: declare(module, real("H", nb * nbv, nbv, QpParams, "Condensed block Hessians."))?,
            f: declare(module, real("f", nb * nbv, 1, QpParams, "Condensed block gradients."))?,
            c: declare(module, real("C", nb * nx, nbv, QpParams, "Block coupling matrices."))?,
            d: declare(module, real("d", nb * nx, 1, QpParams, "Block coupling offsets."))?,
            hn: declare(module, real("HN", nx, nx, QpParams, "Terminal Hessian."))?,
            f_n: declare(module, real("fN", nx, 1, QpParams, "Terminal gradient."))?,
            c0: if config.initial_state_fixed {
                Some(declare(module, real("c0", nx, 1, QpParams, "Entry state deviation of the first block."))?)
            } else {
                None
            },
            z_init: if hotstart {
                Some(declare(module, real("z_init", z_len, 1, QpParams, "Initial guess of the block decisions."))?)
            } else {
                None
            },
            z_last_init: match z_last_len {
                Some(len) if hotstart => Some(declare(
                    module,
                    real("zLast_init", len, 1, QpParams, "Initial guess of the last block decisions."),
                )?),
                _ => None,
            },
            zn_init: if hotstart {
                Some(declare(module, real("zN_init", nx, 1, QpParams, "Initial guess of the terminal state."))?)
            } else {
                None
            },
            z: declare(module, real("z", z_len, 1, QpOutput, "Block decisions."))?,
            z_last: match z_last_len {
                Some(len) => Some(declare(module, real("zLast", len, 1, QpOutput, "Decisions of the shorter last block."))?),
                None => None,
            },
            zn: declare(module, real("zN", nx, 1, QpOutput, "Terminal state decision."))?,
            it: declare(
                module,
                Variable {
                    scalar: ScalarType::Int,
                    ..real("it", 1, 1, QpInfo, "Number of iterations.")
                },
            )?,
            res_eq: declare(module, real("res_eq", 1, 1, QpInfo, "Equality residual."))?,
            pobj: declare(module, real("pobj", 1, 1, QpInfo, "Primal objective."))?,
            solvetime: declare(module, real("solvetime", 1, 1, QpInfo, "Solve time."))?,
        };

        log::debug!(
            "Declared solver buffers: {} blocks of {} variables, {} QP variables",
            nb,
            nbv,
            partition.num_qp_variables()
        );

        Ok(Self {
            x,
            u,
            y,
            y_n,
            x0,
            slx,
            ev_gx,
            ev_gu,
            d,
            dy,
            dy_n,
            q1,
            s1,
            r1,
            q2,
            r2,
            qn1,
            qn2,
            qp,
        })
    }
}
