//! Reference interpreter for the emission IR
//!
//! Executes a generated [`rti_ir::Module`] directly, with the same
//! element-wise semantics the C renderer produces. Routines declared as
//! external (model simulation, objective evaluation, QP solve) are routed to
//! an [`Externals`] implementation that works on the persistent [`Memory`].

mod error;
mod execution;
mod memory;

pub use error::VmError;
pub use execution::{Externals, Vm};
pub use memory::Memory;
