//! Condensing engine
//!
//! Forward elimination inside one block. With `w = [dx_entry; du_0 .. du_{L-1}]`
//! every intra-block state deviation is affine in `w`:
//!
//! ```text
//! dx_j = G_j w + c_j,   G_0 = [I 0],  c_0 = 0
//! G_{j+1} = A_j G_j + B_j E_j,  c_{j+1} = A_j c_j + d_j
//! ```
//!
//! where `E_j` selects `du_j`. The block Hessian and gradient collect the
//! stage objective through this map and `(G_L, c_L)` couples the block to
//! the entry state of the next block (or the terminal state). The solver
//! states that coupling as `C w - x_next = d`, so `C = G_L` and `d = -c_L`.

use crate::partition::BlockPartition;
use crate::variables::SolverVariables;
use rti_common::ExportError;
use rti_ir::{Expr, FunctionBuilder, FunctionId, Module, Offset, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondensingFunctions {
    /// `condensePrep(blockI)` for blocks of full length
    pub prep: FunctionId,
    /// `condensePrepLast(blockI)` for a shorter last block
    pub prep_last: Option<FunctionId>,
}

pub struct CondensingEngine<'a> {
    partition: &'a BlockPartition,
    vars: &'a SolverVariables,
}

impl<'a> CondensingEngine<'a> {
    pub fn new(partition: &'a BlockPartition, vars: &'a SolverVariables) -> Self {
        Self { partition, vars }
    }

    pub fn emit(&self, module: &mut Module) -> Result<CondensingFunctions, ExportError> {
        let prep = self.emit_block(module, "condensePrep", self.partition.block_size)?;
        let prep_last = if self.partition.has_short_tail() {
            Some(self.emit_block(module, "condensePrepLast", self.partition.last_block_len())?)
        } else {
            None
        };
        Ok(CondensingFunctions { prep, prep_last })
    }

    fn emit_block(&self, module: &mut Module, name: &str, len: usize) -> Result<FunctionId, ExportError> {
        let p = self.partition;
        let v = self.vars;
        let (nx, nu, bs) = (p.nx, p.nu, p.block_size);
        let nbv = p.num_block_variables();
        let width = nx + len * nu;

        let mut builder = FunctionBuilder::new(name);
        builder.doc("Condense one block: Hessian, gradient and coupling to the next block.");
        let block_i = builder.add_index_param(module, "blockI")?;

        let g = builder.add_local(module, "G", nx, width)?;
        let g_next = builder.add_local(module, "Gn", nx, width)?;
        let c = builder.add_local(module, "c", nx, 1)?;
        let c_next = builder.add_local(module, "cn", nx, 1)?;
        let qg = builder.add_local(module, "QG", nx, width)?;
        let sg = builder.add_local(module, "SG", nu, width)?;
        let qc = builder.add_local(module, "qc", nx, 1)?;
        let sc = builder.add_local(module, "sc", nu, 1)?;

        // This block's slots in the solver parameters
        let h = module.block(v.qp.h, Offset::indexed(block_i, nbv, 0), width, 0, width)?;
        let f = module.block(v.qp.f, Offset::indexed(block_i, nbv, 0), width, 0, 1)?;
        let coupling = module.block(v.qp.c, Offset::indexed(block_i, nx, 0), nx, 0, width)?;
        let offset = module.block(v.qp.d, Offset::indexed(block_i, nx, 0), nx, 0, 1)?;

        builder.assign(module, h, Expr::Zero(Shape::new(width, width)))?;
        builder.assign(module, f, Expr::Zero(Shape::new(width, 1)))?;
        builder.assign(module, g, Expr::Zero(Shape::new(nx, width)))?;
        builder.assign(module, g.cols(0, nx), Expr::Identity { size: nx, scale: 1.0 })?;
        builder.assign(module, c, Expr::Zero(Shape::new(nx, 1)))?;

        for j in 0..len {
            let cu = nx + j * nu;
            let state_rows = Offset::indexed(block_i, bs * nx, j * nx);
            let control_rows = Offset::indexed(block_i, bs * nu, j * nu);

            let q = module.rows(v.q1, state_rows, nx)?;
            let s = module.rows(v.s1, state_rows, nx)?;
            let r = module.rows(v.r1, control_rows, nu)?;
            let q2 = module.rows(v.q2, state_rows, nx)?;
            let r2 = module.rows(v.r2, control_rows, nu)?;
            let dy = module.rows(v.dy, Offset::indexed(block_i, bs, j), 1)?.transpose();
            let a = module.rows(v.ev_gx, state_rows, nx)?;
            let b = module.rows(v.ev_gu, state_rows, nx)?;
            let defect = module.rows(v.d, state_rows, nx)?;

            builder.comment(&format!("stage {} of the block", j));

            // H += G'(Q G + S E) + E'(S' G + R E)
            builder.assign(module, qg, q * g)?;
            builder.accumulate(module, qg.cols(cu, nu), s)?;
            builder.assign(module, sg, s.transpose() * g)?;
            builder.accumulate(module, sg.cols(cu, nu), r)?;
            builder.accumulate(module, h, g.transpose() * qg)?;
            builder.accumulate(module, h.rows(cu, nu), sg)?;

            // f += G'(Q c + Q2 Dy) + E'(S' c + R2 Dy)
            builder.assign(module, qc, q * c + q2 * dy)?;
            builder.accumulate(module, f, g.transpose() * qc)?;
            builder.assign(module, sc, s.transpose() * c + r2 * dy)?;
            builder.accumulate(module, f.rows(cu, nu), sc)?;

            // G = A G + B E, c = A c + d
            builder.assign(module, g_next, a * g)?;
            builder.accumulate(module, g_next.cols(cu, nu), b)?;
            builder.assign(module, g, g_next)?;
            builder.assign(module, c_next, a * c + defect)?;
            builder.assign(module, c, c_next)?;
        }

        builder.assign(module, coupling, g)?;
        builder.assign(module, offset, Expr::Zero(Shape::new(nx, 1)) - c)?;

        log::trace!("{}: {} stages, {} decision variables", name, len, width);
        Ok(builder.finish(module)?)
    }
}
