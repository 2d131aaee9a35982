//! Expansion engine
//!
//! Rebuilds the full state and control trajectory from the condensed QP
//! solution, one block per call. The per-stage propagation
//! `sOut += Gx*sIn + Gu*du` lives in a shared helper so every block routine
//! emits the same code for it.

use crate::partition::BlockPartition;
use crate::variables::SolverVariables;
use rti_common::ExportError;
use rti_ir::{Arg, FunctionBuilder, FunctionId, Module, Offset, VarId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionFunctions {
    pub step: FunctionId,
    /// `expand(blockI)` for blocks of full length
    pub expand: FunctionId,
    /// `expandLast(blockI)` for a shorter last block
    pub expand_last: Option<FunctionId>,
}

pub struct ExpansionEngine<'a> {
    partition: &'a BlockPartition,
    vars: &'a SolverVariables,
}

impl<'a> ExpansionEngine<'a> {
    pub fn new(partition: &'a BlockPartition, vars: &'a SolverVariables) -> Self {
        Self { partition, vars }
    }

    pub fn emit(&self, module: &mut Module) -> Result<ExpansionFunctions, ExportError> {
        let step = self.emit_step(module)?;
        let expand = self.emit_block(module, "expand", self.partition.block_size, step, None)?;
        let expand_last = match self.vars.qp.z_last {
            Some(z_last) if self.partition.has_short_tail() => {
                let len = self.partition.last_block_len();
                Some(self.emit_block(module, "expandLast", len, step, Some(z_last))?)
            }
            _ => None,
        };
        log::debug!(
            "Expansion: {} full blocks, short tail: {}",
            self.partition.full_blocks(),
            expand_last.is_some()
        );
        Ok(ExpansionFunctions {
            step,
            expand,
            expand_last,
        })
    }

    fn emit_step(&self, module: &mut Module) -> Result<FunctionId, ExportError> {
        let (nx, nu) = (self.partition.nx, self.partition.nu);

        let mut builder = FunctionBuilder::new("expansionStep");
        builder.doc("Propagate a state deviation over one stage: sOut += Gx*sIn + Gu*du.");
        let gx = builder.add_param(module, "Gx", nx, nx)?;
        let gu = builder.add_param(module, "Gu", nx, nu)?;
        let du = builder.add_param(module, "du", nu, 1)?;
        let s_in = builder.add_param(module, "sIn", nx, 1)?;
        let s_out = builder.add_param(module, "sOut", nx, 1)?;
        builder.accumulate(module, s_out, gx * s_in + gu * du)?;
        Ok(builder.finish(module)?)
    }

    /// Expansion of one block with `len` stages, `blockI` selecting the block.
    /// Full blocks read their slot of `z`; the shorter last block reads all
    /// of `last`.
    fn emit_block(
        &self,
        module: &mut Module,
        name: &str,
        len: usize,
        step: FunctionId,
        last: Option<VarId>,
    ) -> Result<FunctionId, ExportError> {
        let p = self.partition;
        let v = self.vars;
        let (nx, nu, bs) = (p.nx, p.nu, p.block_size);
        let nbv = p.num_block_variables();

        let mut builder = FunctionBuilder::new(name);
        builder.doc("Add the condensed QP solution of one block to the state and control trajectory.");
        let block_i = builder.add_index_param(module, "blockI")?;
        let sbar = builder.add_local(module, "sbar", len * nx, 1)?;

        let (decisions, at) = match last {
            Some(z_last) => (z_last, Offset::constant(0)),
            None => (v.qp.z, Offset::indexed(block_i, nbv, 0)),
        };
        let control = |i: usize| at.shifted(nx + i * nu);

        for i in 0..len {
            let du = module.block(decisions, control(i), nu, 0, 1)?;
            let u_row = module.rows(v.u, Offset::indexed(block_i, bs, i), 1)?;
            builder.accumulate(module, u_row, du.transpose())?;
        }

        let entry = module.block(decisions, at, nx, 0, 1)?;
        builder.assign(module, sbar.rows(0, nx), entry)?;
        let x_entry = module.rows(v.x, Offset::indexed(block_i, bs, 0), 1)?;
        builder.accumulate(module, x_entry, sbar.rows(0, nx).transpose())?;

        if len > 1 {
            let defects = module.block(v.d, Offset::indexed(block_i, bs * nx, 0), (len - 1) * nx, 0, 1)?;
            builder.assign(module, sbar.rows(nx, (len - 1) * nx), defects)?;
        }

        for row in 0..len.saturating_sub(1) {
            let stage = Offset::indexed(block_i, bs * nx, row * nx);
            let args = vec![
                Arg::Address(module.rows(v.ev_gx, stage, nx)?),
                Arg::Address(module.rows(v.ev_gu, stage, nx)?),
                Arg::Address(module.block(decisions, control(row), nu, 0, 1)?),
                Arg::Address(sbar.rows(row * nx, nx)),
                Arg::Address(sbar.rows((row + 1) * nx, nx)),
            ];
            builder.push(module.call(step, args)?);
            let x_row = module.rows(v.x, Offset::indexed(block_i, bs, row + 1), 1)?;
            builder.accumulate(module, x_row, sbar.rows((row + 1) * nx, nx).transpose())?;
        }

        Ok(builder.finish(module)?)
    }
}
