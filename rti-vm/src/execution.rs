use crate::error::VmError;
use crate::memory::Memory;
use rti_ir::{
    Arg, AssignOp, Block, Expr, FunctionId, IndexId, Module, Offset, Param, Statement,
    StorageClass, VarId,
};
use std::collections::HashMap;

/// Routines the generated code calls but does not define
pub trait Externals {
    /// Run `name` against the persistent memory and return its status code.
    /// The status is ignored for routines that do not return one.
    fn call(&mut self, name: &str, memory: &mut Memory) -> Result<i32, VmError>;
}

impl<F> Externals for F
where
    F: FnMut(&str, &mut Memory) -> Result<i32, VmError>,
{
    fn call(&mut self, name: &str, memory: &mut Memory) -> Result<i32, VmError> {
        self(name, memory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Location {
    Global(VarId),
    Given(VarId),
    Local { frame: usize, var: VarId },
}

/// Resolved address; parameters always resolve to non-parameter storage
#[derive(Debug, Clone, Copy, PartialEq)]
struct Pointer {
    location: Location,
    start: usize,
}

enum Binding {
    Pointer(Pointer),
    Index(usize),
}

#[derive(Default)]
struct Frame {
    locals: HashMap<VarId, Vec<f64>>,
    params: HashMap<VarId, Pointer>,
    indices: HashMap<IndexId, usize>,
}

enum Flow {
    Next,
    Return,
}

/// Dense row-major value of an expression
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    fn at(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    fn zip(self, other: Matrix, f: impl Fn(f64, f64) -> f64) -> Matrix {
        let data = self.data.iter().zip(&other.data).map(|(a, b)| f(*a, *b)).collect();
        Matrix { data, ..self }
    }
}

/// The interpreter
///
/// Whole right-hand sides are evaluated before the target is written.
/// Generated code never reads and writes overlapping storage in one
/// statement, so this matches the unrolled C.
pub struct Vm<'m, E: Externals> {
    module: &'m Module,
    pub memory: Memory,
    externals: E,
    frames: Vec<Frame>,
    /// Number of generated-function invocations so far
    pub calls: usize,
}

impl<'m, E: Externals> Vm<'m, E> {
    pub fn new(module: &'m Module, externals: E) -> Self {
        Self {
            module,
            memory: Memory::new(module),
            externals,
            frames: Vec::new(),
            calls: 0,
        }
    }

    pub fn externals(&self) -> &E {
        &self.externals
    }

    pub fn externals_mut(&mut self) -> &mut E {
        &mut self.externals
    }

    /// Run a parameterless function and return its return value, if any
    pub fn run(&mut self, name: &str) -> Result<Option<f64>, VmError> {
        let id = self
            .module
            .function_id(name)
            .ok_or_else(|| VmError::UnknownFunction(name.to_string()))?;
        if !self.module.function(id).params.is_empty() {
            return Err(VmError::NotAnEntryPoint(name.to_string()));
        }
        self.invoke(id, Vec::new())
    }

    /// Run a function returning an integer status (0 when it returns nothing)
    pub fn run_status(&mut self, name: &str) -> Result<i32, VmError> {
        Ok(self.run(name)?.map(|value| value as i32).unwrap_or(0))
    }

    fn invoke(&mut self, id: FunctionId, bindings: Vec<Binding>) -> Result<Option<f64>, VmError> {
        let module = self.module;
        let function = module.function(id);
        log::trace!("enter {}", function.name);
        self.calls += 1;

        let mut frame = Frame::default();
        for local in &function.locals {
            frame
                .locals
                .insert(*local, vec![0.0; module.variable(*local).shape.len()]);
        }
        for (param, binding) in function.params.iter().zip(bindings) {
            match (param, binding) {
                (Param::Matrix(var), Binding::Pointer(pointer)) => {
                    frame.params.insert(*var, pointer);
                }
                (Param::Index(index), Binding::Index(value)) => {
                    frame.indices.insert(*index, value);
                }
                (Param::Matrix(var), Binding::Index(_)) => {
                    return Err(VmError::UnboundParameter(module.variable(*var).name.clone()))
                }
                (Param::Index(index), Binding::Pointer(_)) => {
                    return Err(VmError::UnboundIndex(module.index_name(*index).to_string()))
                }
            }
        }

        self.frames.push(frame);
        let result = self.exec_block(&function.body);
        let value = match (&result, function.return_value) {
            (Ok(_), Some(var)) => self.locate(var, 0).and_then(|p| self.load(p)).map(Some),
            _ => Ok(None),
        };
        self.frames.pop();
        result?;
        value
    }

    fn exec_block(&mut self, statements: &'m [Statement]) -> Result<Flow, VmError> {
        for statement in statements {
            if let Flow::Return = self.exec(statement)? {
                return Ok(Flow::Return);
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, statement: &'m Statement) -> Result<Flow, VmError> {
        match statement {
            Statement::Assign { target, op, value } => {
                let value = self.eval(value)?;
                let shape = target.shape();
                for i in 0..shape.rows {
                    for j in 0..shape.cols {
                        let pointer = self.locate(target.var, self.flat(target, i, j)?)?;
                        let v = value.at(i, j);
                        let new = match op {
                            AssignOp::Set => v,
                            AssignOp::Add => self.load(pointer)? + v,
                            AssignOp::Sub => self.load(pointer)? - v,
                        };
                        self.store(pointer, new)?;
                    }
                }
            }
            Statement::Call { function, args } => {
                let mut bindings = Vec::with_capacity(args.len());
                for arg in args {
                    bindings.push(match arg {
                        Arg::Address(block) => {
                            Binding::Pointer(self.locate(block.var, self.flat(block, 0, 0)?)?)
                        }
                        Arg::Index(offset) => Binding::Index(self.offset(offset)?),
                    });
                }
                self.invoke(*function, bindings)?;
            }
            Statement::External { result, name, .. } => {
                log::trace!("external {}", name);
                let status = self.externals.call(name, &mut self.memory)?;
                if let Some(var) = result {
                    let pointer = self.locate(*var, 0)?;
                    self.store(pointer, f64::from(status))?;
                }
            }
            Statement::ForLoop {
                index,
                start,
                end,
                body,
                ..
            } => {
                for value in *start..*end {
                    self.frame_mut()?.indices.insert(*index, value);
                    if let Flow::Return = self.exec_block(body)? {
                        return Ok(Flow::Return);
                    }
                }
            }
            Statement::IfNonZero { status, body } => {
                let value = self.load(self.locate(*status, 0)?)?;
                if value != 0.0 {
                    return self.exec_block(body);
                }
            }
            Statement::Return => return Ok(Flow::Return),
            Statement::Comment(_) => {}
        }
        Ok(Flow::Next)
    }

    fn frame(&self) -> Result<&Frame, VmError> {
        self.frames
            .last()
            .ok_or_else(|| VmError::UnknownFunction("<no active call>".to_string()))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::UnknownFunction("<no active call>".to_string()))
    }

    fn offset(&self, offset: &Offset) -> Result<usize, VmError> {
        match offset.index {
            None => Ok(offset.constant),
            Some((id, coeff)) => {
                let value = self
                    .frame()?
                    .indices
                    .get(&id)
                    .copied()
                    .ok_or_else(|| VmError::UnboundIndex(self.module.index_name(id).to_string()))?;
                Ok(value * coeff + offset.constant)
            }
        }
    }

    /// Flat element position of `(i, j)` inside the viewed variable
    fn flat(&self, block: &Block, i: usize, j: usize) -> Result<usize, VmError> {
        let cols = self.module.variable(block.var).shape.cols;
        let (row, col) = block.element(i, j);
        Ok(self.offset(&row)? * cols + col)
    }

    fn locate(&self, var: VarId, flat: usize) -> Result<Pointer, VmError> {
        let variable = self.module.variable(var);
        if variable.is_given() {
            return Ok(Pointer {
                location: Location::Given(var),
                start: flat,
            });
        }
        match variable.storage {
            StorageClass::Param => {
                let pointer = self
                    .frame()?
                    .params
                    .get(&var)
                    .copied()
                    .ok_or_else(|| VmError::UnboundParameter(variable.name.clone()))?;
                Ok(Pointer {
                    start: pointer.start + flat,
                    ..pointer
                })
            }
            StorageClass::Local => Ok(Pointer {
                location: Location::Local {
                    frame: self.frames.len().saturating_sub(1),
                    var,
                },
                start: flat,
            }),
            _ => Ok(Pointer {
                location: Location::Global(var),
                start: flat,
            }),
        }
    }

    fn out_of_bounds(&self, var: VarId, index: usize, len: usize) -> VmError {
        VmError::OutOfBounds {
            name: self.module.variable(var).name.clone(),
            index,
            len,
        }
    }

    fn load(&self, pointer: Pointer) -> Result<f64, VmError> {
        let (var, buffer) = match pointer.location {
            Location::Global(var) => (var, self.memory.buffer(var)),
            Location::Given(var) => (var, self.module.variable(var).values.as_ref()),
            Location::Local { frame, var } => {
                (var, self.frames.get(frame).and_then(|f| f.locals.get(&var)))
            }
        };
        let buffer = buffer.ok_or_else(|| self.out_of_bounds(var, pointer.start, 0))?;
        buffer
            .get(pointer.start)
            .copied()
            .ok_or_else(|| self.out_of_bounds(var, pointer.start, buffer.len()))
    }

    fn store(&mut self, pointer: Pointer, value: f64) -> Result<(), VmError> {
        let module = self.module;
        let (var, buffer) = match pointer.location {
            Location::Global(var) => (var, self.memory.buffer_mut(var)),
            Location::Given(var) => {
                return Err(VmError::ReadOnly(module.variable(var).name.clone()))
            }
            Location::Local { frame, var } => (
                var,
                self.frames.get_mut(frame).and_then(|f| f.locals.get_mut(&var)),
            ),
        };
        let oob = |len| VmError::OutOfBounds {
            name: module.variable(var).name.clone(),
            index: pointer.start,
            len,
        };
        let buffer = buffer.ok_or_else(|| oob(0))?;
        let len = buffer.len();
        let slot = buffer.get_mut(pointer.start).ok_or_else(|| oob(len))?;
        *slot = value;
        Ok(())
    }

    fn eval(&self, expr: &Expr) -> Result<Matrix, VmError> {
        match expr {
            Expr::Block(block) => {
                let shape = block.shape();
                let mut out = Matrix::zeros(shape.rows, shape.cols);
                for i in 0..shape.rows {
                    for j in 0..shape.cols {
                        let pointer = self.locate(block.var, self.flat(block, i, j)?)?;
                        out.data[i * shape.cols + j] = self.load(pointer)?;
                    }
                }
                Ok(out)
            }
            Expr::Zero(shape) => Ok(Matrix::zeros(shape.rows, shape.cols)),
            Expr::Identity { size, scale } => {
                let mut out = Matrix::zeros(*size, *size);
                for i in 0..*size {
                    out.data[i * size + i] = *scale;
                }
                Ok(out)
            }
            Expr::Scalar(value) => Ok(Matrix {
                rows: 1,
                cols: 1,
                data: vec![*value],
            }),
            Expr::Add(lhs, rhs) => Ok(self.eval(lhs)?.zip(self.eval(rhs)?, |a, b| a + b)),
            Expr::Sub(lhs, rhs) => Ok(self.eval(lhs)?.zip(self.eval(rhs)?, |a, b| a - b)),
            Expr::Mul(lhs, rhs) => {
                let (a, b) = (self.eval(lhs)?, self.eval(rhs)?);
                let mut out = Matrix::zeros(a.rows, b.cols);
                for i in 0..a.rows {
                    for k in 0..a.cols {
                        let aik = a.at(i, k);
                        if aik == 0.0 {
                            continue;
                        }
                        for j in 0..b.cols {
                            out.data[i * b.cols + j] += aik * b.at(k, j);
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rti_ir::{ExternalDecl, FunctionBuilder, Shape, Variable};

    fn no_externals(name: &str, _: &mut Memory) -> Result<i32, VmError> {
        Err(VmError::External {
            name: name.to_string(),
            message: "not available".to_string(),
        })
    }

    /// x[k] += 1 for every row through a helper taking a row pointer
    fn increment_module() -> Module {
        let mut module = Module::new("inc");
        let x = module
            .add_variable(Variable::new("x", 3, 2, StorageClass::Variables))
            .unwrap();

        let mut helper = FunctionBuilder::new("bump");
        let row = helper.add_param(&mut module, "row", 1, 2).unwrap();
        let tmp = helper.add_local(&mut module, "tmp", 1, 2).unwrap();
        helper.assign(&module, tmp, row + Expr::Zero(Shape::new(1, 2))).unwrap();
        helper
            .accumulate(&module, row, Expr::Identity { size: 1, scale: 1.0 } * Expr::from(tmp) - Expr::from(tmp))
            .unwrap();
        helper.accumulate(&module, row.cols(1, 1), Expr::Scalar(1.0)).unwrap();
        let helper = helper.finish(&mut module).unwrap();

        let mut main = FunctionBuilder::new("main");
        let k = main.add_index(&mut module, "k").unwrap();
        let call = module
            .call(helper, vec![Arg::Address(module.rows(x, Offset::indexed(k, 1, 0), 1).unwrap())])
            .unwrap();
        main.push(Statement::for_loop(k, 0, 3, vec![call]));
        main.finish(&mut module).unwrap();
        module
    }

    #[test]
    fn test_calls_through_row_pointers() {
        let module = increment_module();
        let mut vm = Vm::new(&module, no_externals);
        vm.memory
            .set(StorageClass::Variables, "x", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        assert_eq!(vm.run("main").unwrap(), None);
        assert_eq!(
            vm.memory.get(StorageClass::Variables, "x").unwrap(),
            &[1.0, 3.0, 3.0, 5.0, 5.0, 7.0]
        );
        assert_eq!(vm.calls, 4);
    }

    #[test]
    fn test_entry_points() {
        let module = increment_module();
        let mut vm = Vm::new(&module, no_externals);
        assert_eq!(vm.run("bump"), Err(VmError::NotAnEntryPoint("bump".to_string())));
        assert_eq!(vm.run("missing"), Err(VmError::UnknownFunction("missing".to_string())));
    }

    fn status_module() -> Module {
        let mut module = Module::new("status");
        module
            .declare_external(ExternalDecl {
                name: "simulate".to_string(),
                returns_status: true,
                params: Vec::new(),
                declared_elsewhere: false,
                doc: None,
            })
            .unwrap();
        let y = module
            .add_variable(Variable::new("y", 2, 1, StorageClass::Workspace))
            .unwrap();
        let gain = module
            .add_variable(Variable::given("gain", 2, 2, vec![2.0, 0.0, 0.0, 3.0]))
            .unwrap();

        let mut main = FunctionBuilder::new("step");
        let ret = main.add_status(&mut module, "ret", "status", true).unwrap();
        main.push(module.call_external("simulate", Some(ret)).unwrap());
        main.push(Statement::IfNonZero {
            status: ret,
            body: vec![Statement::Return],
        });
        let (y, gain) = (module.whole(y), module.whole(gain));
        let tmp = main.add_local(&mut module, "tmp", 2, 1).unwrap();
        main.assign(&module, tmp, gain * y).unwrap();
        main.assign(&module, y, tmp).unwrap();
        main.push(Statement::Return);
        main.finish(&mut module).unwrap();
        module
    }

    #[test]
    fn test_external_status_controls_flow() {
        let module = status_module();

        let ok = |_: &str, memory: &mut Memory| -> Result<i32, VmError> {
            memory.set(StorageClass::Workspace, "y", &[1.0, 1.0])?;
            Ok(0)
        };
        let mut vm = Vm::new(&module, ok);
        assert_eq!(vm.run_status("step").unwrap(), 0);
        assert_eq!(vm.memory.get(StorageClass::Workspace, "y").unwrap(), &[2.0, 3.0]);

        let failing = |_: &str, _: &mut Memory| -> Result<i32, VmError> { Ok(7) };
        let mut vm = Vm::new(&module, failing);
        vm.memory.set(StorageClass::Workspace, "y", &[5.0, 5.0]).unwrap();
        assert_eq!(vm.run_status("step").unwrap(), 7);
        assert_eq!(vm.memory.get(StorageClass::Workspace, "y").unwrap(), &[5.0, 5.0]);
    }

    #[test]
    fn test_out_of_bounds_is_reported() {
        let mut module = Module::new("oob");
        let v = module
            .add_variable(Variable::new("v", 2, 1, StorageClass::Workspace))
            .unwrap();
        let mut main = FunctionBuilder::new("main");
        let k = main.add_index(&mut module, "k").unwrap();
        let target = module.rows(v, Offset::indexed(k, 1, 0), 1).unwrap();
        let body = vec![Statement::assign(target, AssignOp::Set, Expr::Scalar(1.0)).unwrap()];
        main.push(Statement::for_loop(k, 0, 3, body));
        main.finish(&mut module).unwrap();

        let mut vm = Vm::new(&module, no_externals);
        let err = vm.run("main").unwrap_err();
        assert_eq!(
            err,
            VmError::OutOfBounds {
                name: "v".to_string(),
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn test_memory_length_check() {
        let module = status_module();
        let mut memory = Memory::new(&module);
        assert!(memory.set(StorageClass::Workspace, "y", &[1.0]).is_err());
        assert!(memory.get(StorageClass::Variables, "y").is_err());
        // Given matrices have no buffer
        assert!(memory.get(StorageClass::Workspace, "gain").is_err());
    }
}
