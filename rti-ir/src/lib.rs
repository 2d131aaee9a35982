//! Block-condensing RTI generator - Intermediate Representation
//!
//! The generator builds matrix-level statements into a [`Module`]. The
//! module can be dumped as text (its `Display` impl), rendered to C with
//! [`emit_c`], or executed by the `rti-vm` interpreter.

pub mod emit;
pub mod ir;

pub use emit::{emit_c, format_offset, format_real, storage_declarations, CEmitter};
pub use ir::{
    Arg, AssignOp, Block, Expr, ExternalDecl, Function, FunctionBuilder, FunctionId, IndexId,
    IndexVar, IrError, Module, Offset, Param, ScalarType, Shape, Statement, StorageClass,
    StorageNames, VarId, Variable,
};

/// Serialize a module for inspection tools
pub fn module_to_json(module: &Module) -> Result<String, rti_common::ExportError> {
    let text = serde_json::to_string_pretty(module)?;
    log::trace!("Serialized module '{}' ({} bytes)", module.name, text.len());
    Ok(text)
}
