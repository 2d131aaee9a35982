//! RTI scheduler
//!
//! Emits the two standing procedures of the scheme, the solver
//! initialization and the auxiliary KKT query. `preparationStep`
//! linearizes, evaluates the objective and condenses every block;
//! `feedbackStep` solves the condensed QP and expands its solution into the
//! trajectory. Nonzero status codes of the model simulation and of the
//! solver are returned unchanged.

use crate::condensing::CondensingFunctions;
use crate::expansion::ExpansionFunctions;
use crate::partition::BlockPartition;
use crate::variables::{LinearStateTerm, SolverVariables};
use rti_common::{ExportError, ProblemConfig};
use rti_ir::{
    Arg, AssignOp, Block, Expr, ExternalDecl, FunctionBuilder, FunctionId, IndexId, Module, Offset,
    Shape, Statement, StorageClass, VarId,
};

pub const MODEL_SIMULATION: &str = "modelSimulation";
pub const EVALUATE_OBJECTIVE: &str = "evaluateObjective";

/// Value returned by `getKKT`
pub const KKT_PLACEHOLDER: f64 = 1e-15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerFunctions {
    pub initialize: FunctionId,
    pub regularize: Option<FunctionId>,
    pub preparation: FunctionId,
    pub feedback: FunctionId,
    pub get_kkt: FunctionId,
}

/// Declare the model-simulation and objective collaborators
pub fn declare_collaborators(module: &mut Module) -> Result<(), ExportError> {
    module.declare_external(ExternalDecl {
        name: MODEL_SIMULATION.to_string(),
        returns_status: true,
        params: Vec::new(),
        declared_elsewhere: false,
        doc: Some("Simulate the model and compute sensitivities; nonzero on failure.".to_string()),
    })?;
    module.declare_external(ExternalDecl {
        name: EVALUATE_OBJECTIVE.to_string(),
        returns_status: false,
        params: Vec::new(),
        declared_elsewhere: false,
        doc: Some("Evaluate stage and terminal objective Hessians and gradients.".to_string()),
    })?;
    Ok(())
}

pub struct RtiScheduler<'a> {
    config: &'a ProblemConfig,
    partition: &'a BlockPartition,
    vars: &'a SolverVariables,
    solve: String,
    solver_init: String,
}

impl<'a> RtiScheduler<'a> {
    pub fn new(
        config: &'a ProblemConfig,
        partition: &'a BlockPartition,
        vars: &'a SolverVariables,
        solve: &str,
        solver_init: &str,
    ) -> Self {
        Self {
            config,
            partition,
            vars,
            solve: solve.to_string(),
            solver_init: solver_init.to_string(),
        }
    }

    pub fn emit(
        &self,
        module: &mut Module,
        condensing: &CondensingFunctions,
        expansion: &ExpansionFunctions,
    ) -> Result<SchedulerFunctions, ExportError> {
        let initialize = self.emit_initialize(module)?;
        let regularize = if self.config.regularize_hessian {
            Some(self.emit_regularization(module)?)
        } else {
            None
        };
        let preparation = self.emit_preparation(module, condensing, regularize)?;
        let feedback = self.emit_feedback(module, expansion)?;
        let get_kkt = self.emit_get_kkt(module)?;
        Ok(SchedulerFunctions {
            initialize,
            regularize,
            preparation,
            feedback,
            get_kkt,
        })
    }

    /// Loop over the full-length blocks, then the shorter last block
    fn block_calls(
        &self,
        module: &Module,
        block_i: IndexId,
        routine: FunctionId,
        last: Option<FunctionId>,
    ) -> Result<Vec<Statement>, ExportError> {
        let mut statements = Vec::new();
        let full = self.partition.full_blocks();
        if full > 0 {
            let body = vec![module.call(routine, vec![Arg::Index(Offset::indexed(block_i, 1, 0))])?];
            statements.push(if self.config.options.cg_use_openmp {
                Statement::parallel_for(block_i, 0, full, body)
            } else {
                Statement::for_loop(block_i, 0, full, body)
            });
        }
        if let Some(last) = last {
            let k = self.partition.number_of_blocks() - 1;
            statements.push(module.call(last, vec![Arg::Index(Offset::constant(k))])?);
        }
        Ok(statements)
    }

    /// Zero the trajectory, the solver buffers and the QP structures, then
    /// let the solver set itself up
    fn emit_initialize(&self, module: &mut Module) -> Result<FunctionId, ExportError> {
        use StorageClass::{QpOutput, QpParams, Variables, Workspace};

        let mut builder = FunctionBuilder::new("initializeSolver");
        builder.doc("Initialize the solver: zero all buffers and set up the QP solver.");
        let row = builder.add_index(module, "rowI")?;

        let targets: Vec<(usize, usize, VarId)> = module
            .variables
            .iter()
            .enumerate()
            .filter(|(_, v)| {
                matches!(v.storage, Variables | Workspace | QpParams | QpOutput) && !v.is_given()
            })
            .map(|(i, v)| (v.shape.rows, v.shape.cols, VarId(i as u32)))
            .collect();
        log::trace!("initializeSolver clears {} buffers", targets.len());
        for (rows, cols, id) in targets {
            if rows == 1 {
                builder.assign(module, module.whole(id), Expr::Zero(Shape::new(1, cols)))?;
            } else {
                let body = vec![Statement::assign(
                    module.rows(id, Offset::indexed(row, 1, 0), 1)?,
                    AssignOp::Set,
                    Expr::Zero(Shape::new(1, cols)),
                )?];
                builder.push(Statement::for_loop(row, 0, rows, body));
            }
        }

        builder.push(module.call_external(&self.solver_init, None)?);
        Ok(builder.finish(module)?)
    }

    fn emit_regularization(&self, module: &mut Module) -> Result<FunctionId, ExportError> {
        let (nx, nu, n) = (self.partition.nx, self.partition.nu, self.partition.n);
        let lambda = self.config.levenberg_marquardt;

        let mut builder = FunctionBuilder::new("regularizeHessian");
        builder.doc("Add the Levenberg-Marquardt term to every stage Hessian.");
        let stage = builder.add_index(module, "stageI")?;
        let q = module.rows(self.vars.q1, Offset::indexed(stage, nx, 0), nx)?;
        let r = module.rows(self.vars.r1, Offset::indexed(stage, nu, 0), nu)?;
        let body = vec![
            Statement::assign(q, AssignOp::Add, Expr::Identity { size: nx, scale: lambda })?,
            Statement::assign(r, AssignOp::Add, Expr::Identity { size: nu, scale: lambda })?,
        ];
        builder.push(Statement::for_loop(stage, 0, n, body));
        Ok(builder.finish(module)?)
    }

    fn linear_state_term(&self, module: &Module) -> Result<Block, ExportError> {
        Ok(match self.vars.slx {
            LinearStateTerm::Given(id) | LinearStateTerm::Shared(id) => module.whole(id),
            LinearStateTerm::PerStage(id) => module
                .rows(id, Offset::constant(self.partition.n), 1)?
                .transpose(),
        })
    }

    fn emit_preparation(
        &self,
        module: &mut Module,
        condensing: &CondensingFunctions,
        regularize: Option<FunctionId>,
    ) -> Result<FunctionId, ExportError> {
        let v = self.vars;
        let nx = self.partition.nx;

        let mut builder = FunctionBuilder::new("preparationStep");
        builder.doc("Preparation step of the RTI scheme.");
        let ret = builder.add_status(module, "ret", "Status of the model simulation.", true)?;
        let block_i = builder.add_index(module, "blockI")?;

        builder.push(module.call_external(MODEL_SIMULATION, Some(ret))?);
        builder.push(Statement::IfNonZero {
            status: ret,
            body: vec![Statement::Return],
        });
        builder.push(module.call_external(EVALUATE_OBJECTIVE, None)?);
        if let Some(regularize) = regularize {
            builder.push(module.call(regularize, Vec::new())?);
        }

        builder.subtract(module, module.whole(v.dy), module.whole(v.y))?;
        builder.subtract(module, module.whole(v.dy_n), module.whole(v.y_n))?;

        for statement in self.block_calls(module, block_i, condensing.prep, condensing.prep_last)? {
            builder.push(statement);
        }

        let lambda = self.config.levenberg_marquardt;
        builder.assign(
            module,
            module.whole(v.qp.hn),
            module.whole(v.qn1) + Expr::Identity { size: nx, scale: lambda },
        )?;
        let slx = self.linear_state_term(module)?;
        builder.assign(
            module,
            module.whole(v.qp.f_n),
            module.whole(v.qn2) * module.whole(v.dy_n) + slx,
        )?;
        builder.push(Statement::Return);
        Ok(builder.finish(module)?)
    }

    fn emit_feedback(&self, module: &mut Module, expansion: &ExpansionFunctions) -> Result<FunctionId, ExportError> {
        let v = self.vars;
        let n = self.partition.n;

        let mut builder = FunctionBuilder::new("feedbackStep");
        builder.doc("Feedback/estimation step of the RTI scheme.");
        let tmp = builder.add_status(module, "tmp", "Status code of the QP solver.", true)?;
        let block_i = builder.add_index(module, "blockI")?;

        if let (Some(c0), Some(x0)) = (v.qp.c0, v.x0) {
            let x_first = module.rows(v.x, Offset::constant(0), 1)?.transpose();
            builder.assign(module, module.whole(c0), module.whole(x0) - x_first)?;
        }

        // Warm start from the previous solution
        if let (Some(z_init), Some(zn_init)) = (v.qp.z_init, v.qp.zn_init) {
            builder.assign(module, module.whole(z_init), module.whole(v.qp.z))?;
            if let (Some(init), Some(last)) = (v.qp.z_last_init, v.qp.z_last) {
                builder.assign(module, module.whole(init), module.whole(last))?;
            }
            builder.assign(module, module.whole(zn_init), module.whole(v.qp.zn))?;
        }

        builder.push(module.call_external(&self.solve, Some(tmp))?);
        builder.push(Statement::IfNonZero {
            status: tmp,
            body: vec![Statement::Return],
        });

        for statement in self.block_calls(module, block_i, expansion.expand, expansion.expand_last)? {
            builder.push(statement);
        }

        let x_last = module.rows(v.x, Offset::constant(n), 1)?;
        builder.accumulate(module, x_last, module.whole(v.qp.zn).transpose())?;
        builder.push(Statement::Return);
        Ok(builder.finish(module)?)
    }

    fn emit_get_kkt(&self, module: &mut Module) -> Result<FunctionId, ExportError> {
        let mut builder = FunctionBuilder::new("getKKT");
        builder.doc("Get the KKT tolerance of the current iterate. Under development: returns a fixed 1e-15, not a KKT residual.");
        let kkt = builder.add_return_value(module, "kkt", "Placeholder, not a KKT residual.")?;
        builder.comment("placeholder");
        builder.assign(module, kkt, Expr::Scalar(KKT_PLACEHOLDER))?;
        builder.push(Statement::Return);
        Ok(builder.finish(module)?)
    }
}
