use crate::error::VmError;
use rti_ir::{Module, StorageClass, VarId};
use std::collections::HashMap;

fn unknown(storage: StorageClass, name: &str) -> VmError {
    VmError::UnknownVariable {
        storage: storage.to_string(),
        name: name.to_string(),
    }
}

/// Persistent storage of a module
///
/// Every non-given variable of a persistent storage class owns one
/// zero-initialized row-major buffer. Buffers are addressed by storage
/// class and name from outside the interpreter.
#[derive(Debug, Clone)]
pub struct Memory {
    buffers: HashMap<VarId, Vec<f64>>,
    names: HashMap<(StorageClass, String), VarId>,
}

impl Memory {
    pub fn new(module: &Module) -> Self {
        let mut buffers = HashMap::new();
        let mut names = HashMap::new();
        for (i, variable) in module.variables.iter().enumerate() {
            if variable.storage.is_persistent() && !variable.is_given() {
                let id = VarId(i as u32);
                buffers.insert(id, vec![0.0; variable.shape.len()]);
                names.insert((variable.storage, variable.name.clone()), id);
            }
        }
        Self { buffers, names }
    }

    pub fn id(&self, storage: StorageClass, name: &str) -> Result<VarId, VmError> {
        self.names
            .get(&(storage, name.to_string()))
            .copied()
            .ok_or_else(|| unknown(storage, name))
    }

    pub fn get(&self, storage: StorageClass, name: &str) -> Result<&[f64], VmError> {
        let id = self.id(storage, name)?;
        self.buffers
            .get(&id)
            .map(Vec::as_slice)
            .ok_or_else(|| unknown(storage, name))
    }

    pub fn get_mut(&mut self, storage: StorageClass, name: &str) -> Result<&mut [f64], VmError> {
        let id = self.id(storage, name)?;
        self.buffers
            .get_mut(&id)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| unknown(storage, name))
    }

    /// Overwrite a whole buffer
    pub fn set(&mut self, storage: StorageClass, name: &str, values: &[f64]) -> Result<(), VmError> {
        let buffer = self.get_mut(storage, name)?;
        if buffer.len() != values.len() {
            return Err(VmError::LengthMismatch {
                name: name.to_string(),
                expected: buffer.len(),
                found: values.len(),
            });
        }
        buffer.copy_from_slice(values);
        Ok(())
    }

    pub(crate) fn buffer(&self, id: VarId) -> Option<&Vec<f64>> {
        self.buffers.get(&id)
    }

    pub(crate) fn buffer_mut(&mut self, id: VarId) -> Option<&mut Vec<f64>> {
        self.buffers.get_mut(&id)
    }
}
