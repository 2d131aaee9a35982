//! Block partition of the horizon
//!
//! Block `k` owns stages `k*B .. min((k+1)*B, N)`. Its decision vector is
//! the entry state deviation (`NX`) followed by the stacked control
//! deviations of its stages. Blocks are laid out with a uniform stride of
//! `NX + B*NU`; a shorter last block only uses the leading part of its slot.

use rti_common::{Dimensions, ExportError};
use serde::Serialize;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockPartition {
    pub nx: usize,
    pub nu: usize,
    pub n: usize,
    pub block_size: usize,
}

/// Layout summary of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub index: usize,
    pub stages: Range<usize>,
    pub variables: usize,
    pub offset: usize,
}

impl BlockPartition {
    pub fn new(dims: &Dimensions, block_size: usize) -> Result<Self, ExportError> {
        if block_size == 0 {
            return Err(ExportError::invalid_configuration(
                "block size must be at least 1",
            ));
        }
        if block_size > dims.n {
            return Err(ExportError::invalid_configuration(format!(
                "block size {} exceeds horizon length {}",
                block_size, dims.n
            )));
        }
        Ok(Self {
            nx: dims.nx,
            nu: dims.nu,
            n: dims.n,
            block_size,
        })
    }

    pub fn number_of_blocks(&self) -> usize {
        self.n.div_ceil(self.block_size)
    }

    /// Number of stages in block `k`
    pub fn block_len(&self, k: usize) -> usize {
        self.stages(k).len()
    }

    pub fn stages(&self, k: usize) -> Range<usize> {
        let start = (k * self.block_size).min(self.n);
        let end = ((k + 1) * self.block_size).min(self.n);
        start..end
    }

    /// Decision variables of a full block (the stride of the layout)
    pub fn num_block_variables(&self) -> usize {
        self.nx + self.block_size * self.nu
    }

    /// Decision variables actually used by block `k`
    pub fn block_variables(&self, k: usize) -> usize {
        self.nx + self.block_len(k) * self.nu
    }

    pub fn block_offset(&self, k: usize) -> usize {
        k * self.num_block_variables()
    }

    /// Position of the controls of stage `i` of block `k` in the decision vector
    pub fn control_offset(&self, k: usize, i: usize) -> usize {
        self.block_offset(k) + self.nx + i * self.nu
    }

    /// Block decisions plus the terminal state
    pub fn num_qp_variables(&self) -> usize {
        self.number_of_blocks() * self.nx + self.n * self.nu + self.nx
    }

    /// Length of the block decision vector (without the terminal state)
    pub fn num_block_decisions(&self) -> usize {
        self.num_qp_variables() - self.nx
    }

    pub fn has_short_tail(&self) -> bool {
        self.n % self.block_size != 0
    }

    /// Blocks handled by the uniform per-block routines
    pub fn full_blocks(&self) -> usize {
        if self.has_short_tail() {
            self.number_of_blocks() - 1
        } else {
            self.number_of_blocks()
        }
    }

    pub fn last_block_len(&self) -> usize {
        self.block_len(self.number_of_blocks() - 1)
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        (0..self.number_of_blocks()).map(|k| BlockInfo {
            index: k,
            stages: self.stages(k),
            variables: self.block_variables(k),
            offset: self.block_offset(k),
        })
    }
}

impl fmt::Display for BlockPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "N = {}, NX = {}, NU = {}, block size {} -> {} blocks, {} QP variables",
            self.n,
            self.nx,
            self.nu,
            self.block_size,
            self.number_of_blocks(),
            self.num_qp_variables()
        )?;
        for block in self.blocks() {
            writeln!(
                f,
                "  block {:>3}: stages {:>3}..{:<3} variables {:>4} at offset {}",
                block.index, block.stages.start, block.stages.end, block.variables, block.offset
            )?;
        }
        write!(f, "  terminal : {} variables at offset {}", self.nx, self.num_block_decisions())
    }
}
