//! Code-emission Intermediate Representation
//!
//! The generator never writes target text directly. It appends typed
//! statements to functions in a [`Module`]; every operand refers to a
//! variable, loop index or function through a stable id, so there are no
//! back-references between nodes. Rendering (see [`crate::emit`]) and
//! execution (the `rti-vm` crate) are separate passes over the same tree.

use rti_common::ExportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Variable identifier (index into [`Module::variables`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// Loop or function index identifier (index into [`Module::indices`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u32);

/// Function identifier (index into [`Module::functions`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%v{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%i{}", self.0)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@f{}", self.0)
    }
}

/// Matrix shape (rows x cols)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("Shape mismatch in {context}: {left} vs {right}")]
    ShapeMismatch {
        context: String,
        left: Shape,
        right: Shape,
    },

    #[error("Block {shape} at ({row}, {col}) exceeds '{name}' ({bounds})")]
    OutOfRange {
        name: String,
        row: usize,
        col: usize,
        shape: Shape,
        bounds: Shape,
    },

    #[error("Variable '{0}' holds given values and cannot be written")]
    ReadOnly(String),

    #[error("Unknown variable {0}")]
    UnknownVariable(VarId),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Duplicate symbol '{0}'")]
    DuplicateSymbol(String),

    #[error("Call to '{function}' expects {expected} arguments, got {found}")]
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("Argument {position} of call to '{function}': {message}")]
    BadArgument {
        function: String,
        position: usize,
        message: String,
    },
}

impl From<IrError> for ExportError {
    fn from(err: IrError) -> Self {
        ExportError::Ir {
            message: err.to_string(),
        }
    }
}

/// Element type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Real,
    Int,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::Real => write!(f, "real_t"),
            ScalarType::Int => write!(f, "int"),
        }
    }
}

/// Where a variable lives in the generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    /// User-facing persistent buffers (trajectory, references)
    Variables,
    /// Internal persistent buffers (sensitivities, objective blocks)
    Workspace,
    /// Fields of the QP solver parameter structure
    QpParams,
    /// Fields of the QP solver output structure
    QpOutput,
    /// Fields of the QP solver info structure
    QpInfo,
    /// Function-local storage
    Local,
    /// Function parameter, bound by address at each call site
    Param,
}

impl StorageClass {
    /// Storage that outlives a single function call
    pub fn is_persistent(&self) -> bool {
        !matches!(self, StorageClass::Local | StorageClass::Param)
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageClass::Variables => "variables",
            StorageClass::Workspace => "workspace",
            StorageClass::QpParams => "qp.params",
            StorageClass::QpOutput => "qp.output",
            StorageClass::QpInfo => "qp.info",
            StorageClass::Local => "local",
            StorageClass::Param => "param",
        };
        write!(f, "{}", name)
    }
}

/// A dense row-major matrix variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub shape: Shape,
    pub scalar: ScalarType,
    pub storage: StorageClass,
    /// Values known at generation time; such variables are inlined as literals
    pub values: Option<Vec<f64>>,
    pub doc: Option<String>,
}

impl Variable {
    pub fn new(name: &str, rows: usize, cols: usize, storage: StorageClass) -> Self {
        Self {
            name: name.to_string(),
            shape: Shape::new(rows, cols),
            scalar: ScalarType::Real,
            storage,
            values: None,
            doc: None,
        }
    }

    pub fn int(name: &str, storage: StorageClass) -> Self {
        Self {
            scalar: ScalarType::Int,
            ..Self::new(name, 1, 1, storage)
        }
    }

    /// A read-only matrix with known values (row-major)
    pub fn given(name: &str, rows: usize, cols: usize, values: Vec<f64>) -> Self {
        Self {
            values: Some(values),
            ..Self::new(name, rows, cols, StorageClass::Workspace)
        }
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }

    pub fn is_given(&self) -> bool {
        self.values.is_some()
    }

    /// Scalars are declared and referenced without a subscript
    pub fn is_scalar(&self) -> bool {
        self.shape.len() == 1 && self.storage != StorageClass::Param
    }
}

/// A named integer index (loop counter or function argument)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexVar {
    pub name: String,
}

/// Affine row offset `coeff * index + constant`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub index: Option<(IndexId, usize)>,
    pub constant: usize,
}

impl Offset {
    pub fn constant(constant: usize) -> Self {
        Self {
            index: None,
            constant,
        }
    }

    pub fn indexed(index: IndexId, coeff: usize, constant: usize) -> Self {
        Self {
            index: Some((index, coeff)),
            constant,
        }
    }

    pub fn shifted(self, by: usize) -> Self {
        Self {
            constant: self.constant + by,
            ..self
        }
    }

    /// Multiply the whole offset by `factor` (row offset -> flat offset)
    pub fn scaled(self, factor: usize) -> Self {
        Self {
            index: self.index.map(|(id, coeff)| (id, coeff * factor)),
            constant: self.constant * factor,
        }
    }

    pub fn evaluate(&self, index_value: impl Fn(IndexId) -> usize) -> usize {
        match self.index {
            Some((id, coeff)) => index_value(id) * coeff + self.constant,
            None => self.constant,
        }
    }
}

/// A rectangular view into a variable
///
/// `row` may depend on an index; `col` is always fixed. Sub-views are taken
/// in the variable's own orientation, `transposed` only affects how the
/// view is read or written.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub var: VarId,
    pub row: Offset,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
    pub transposed: bool,
}

impl Block {
    pub fn shape(&self) -> Shape {
        if self.transposed {
            Shape::new(self.cols, self.rows)
        } else {
            Shape::new(self.rows, self.cols)
        }
    }

    pub fn transpose(self) -> Self {
        Self {
            transposed: !self.transposed,
            ..self
        }
    }

    /// Rows `start..start + count` of this view
    pub fn rows(self, start: usize, count: usize) -> Self {
        debug_assert!(start + count <= self.rows);
        Self {
            row: self.row.shifted(start),
            rows: count,
            ..self
        }
    }

    /// Columns `start..start + count` of this view
    pub fn cols(self, start: usize, count: usize) -> Self {
        debug_assert!(start + count <= self.cols);
        Self {
            col: self.col + start,
            cols: count,
            ..self
        }
    }

    /// Element `(i, j)` of the view mapped to (row offset, column) in the variable
    pub fn element(&self, i: usize, j: usize) -> (Offset, usize) {
        let (r, c) = if self.transposed { (j, i) } else { (i, j) };
        (self.row.shifted(r), self.col + c)
    }
}

/// Matrix expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Block(Block),
    Zero(Shape),
    /// `scale * I`
    Identity { size: usize, scale: f64 },
    Scalar(f64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn shape(&self) -> Result<Shape, IrError> {
        match self {
            Expr::Block(block) => Ok(block.shape()),
            Expr::Zero(shape) => Ok(*shape),
            Expr::Identity { size, .. } => Ok(Shape::new(*size, *size)),
            Expr::Scalar(_) => Ok(Shape::new(1, 1)),
            Expr::Add(lhs, rhs) | Expr::Sub(lhs, rhs) => {
                let (l, r) = (lhs.shape()?, rhs.shape()?);
                if l != r {
                    return Err(IrError::ShapeMismatch {
                        context: "sum".to_string(),
                        left: l,
                        right: r,
                    });
                }
                Ok(l)
            }
            Expr::Mul(lhs, rhs) => {
                let (l, r) = (lhs.shape()?, rhs.shape()?);
                if l.cols != r.rows {
                    return Err(IrError::ShapeMismatch {
                        context: "product".to_string(),
                        left: l,
                        right: r,
                    });
                }
                Ok(Shape::new(l.rows, r.cols))
            }
        }
    }

    /// Blocks read by this expression
    pub fn blocks(&self) -> Vec<Block> {
        let mut out = Vec::new();
        self.collect_blocks(&mut out);
        out
    }

    fn collect_blocks(&self, out: &mut Vec<Block>) {
        match self {
            Expr::Block(block) => out.push(*block),
            Expr::Add(lhs, rhs) | Expr::Sub(lhs, rhs) | Expr::Mul(lhs, rhs) => {
                lhs.collect_blocks(out);
                rhs.collect_blocks(out);
            }
            Expr::Zero(_) | Expr::Identity { .. } | Expr::Scalar(_) => {}
        }
    }
}

impl From<Block> for Expr {
    fn from(block: Block) -> Self {
        Expr::Block(block)
    }
}

impl<T: Into<Expr>> std::ops::Add<T> for Expr {
    type Output = Expr;
    fn add(self, rhs: T) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> std::ops::Sub<T> for Expr {
    type Output = Expr;
    fn sub(self, rhs: T) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> std::ops::Mul<T> for Expr {
    type Output = Expr;
    fn mul(self, rhs: T) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> std::ops::Mul<T> for Block {
    type Output = Expr;
    fn mul(self, rhs: T) -> Expr {
        Expr::from(self) * rhs
    }
}

impl<T: Into<Expr>> std::ops::Add<T> for Block {
    type Output = Expr;
    fn add(self, rhs: T) -> Expr {
        Expr::from(self) + rhs
    }
}

impl<T: Into<Expr>> std::ops::Sub<T> for Block {
    type Output = Expr;
    fn sub(self, rhs: T) -> Expr {
        Expr::from(self) - rhs
    }
}

/// Assignment operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

impl fmt::Display for AssignOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignOp::Set => write!(f, "="),
            AssignOp::Add => write!(f, "+="),
            AssignOp::Sub => write!(f, "-="),
        }
    }
}

/// Argument of a call to a generated function
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    /// Address of the first element of a view
    Address(Block),
    Index(Offset),
}

/// Function parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    Matrix(VarId),
    Index(IndexId),
}

/// Prototype of a routine provided outside the generated code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDecl {
    pub name: String,
    /// Returns an integer status code
    pub returns_status: bool,
    /// Only the QP structures can be passed, by address
    pub params: Vec<StorageClass>,
    /// Declared by a header the generated code includes
    pub declared_elsewhere: bool,
    pub doc: Option<String>,
}

/// IR statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// target (=|+=|-=) value
    Assign {
        target: Block,
        op: AssignOp,
        value: Expr,
    },

    /// Call of a generated function
    Call { function: FunctionId, args: Vec<Arg> },

    /// Call of an external routine, optionally capturing its status code
    External {
        result: Option<VarId>,
        name: String,
        args: Vec<StorageClass>,
    },

    ForLoop {
        index: IndexId,
        start: usize,
        end: usize,
        /// Iterations are independent and may run concurrently
        parallel: bool,
        body: Vec<Statement>,
    },

    /// Runs `body` when the integer `status` is nonzero
    IfNonZero { status: VarId, body: Vec<Statement> },

    /// Return from the enclosing function with its return value
    Return,

    Comment(String),
}

impl Statement {
    pub fn assign(target: Block, op: AssignOp, value: impl Into<Expr>) -> Result<Self, IrError> {
        let value = value.into();
        let shape = value.shape()?;
        if shape != target.shape() {
            return Err(IrError::ShapeMismatch {
                context: format!("assignment ({})", op),
                left: target.shape(),
                right: shape,
            });
        }
        Ok(Statement::Assign { target, op, value })
    }

    pub fn for_loop(index: IndexId, start: usize, end: usize, body: Vec<Statement>) -> Self {
        Statement::ForLoop {
            index,
            start,
            end,
            parallel: false,
            body,
        }
    }

    pub fn parallel_for(index: IndexId, start: usize, end: usize, body: Vec<Statement>) -> Self {
        Statement::ForLoop {
            index,
            start,
            end,
            parallel: true,
            body,
        }
    }
}

/// Function in IR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub doc: Option<String>,
    pub params: Vec<Param>,
    pub locals: Vec<VarId>,
    /// Loop counters declared inside the function
    pub indices: Vec<IndexId>,
    /// Local scalar returned by `Statement::Return`
    pub return_value: Option<VarId>,
    pub body: Vec<Statement>,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            doc: None,
            params: Vec::new(),
            locals: Vec::new(),
            indices: Vec::new(),
            return_value: None,
            body: Vec::new(),
        }
    }
}

/// Names under which the persistent storage classes are rendered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNames {
    pub variables: String,
    pub workspace: String,
    pub qp_params: String,
    pub qp_output: String,
    pub qp_info: String,
}

impl Default for StorageNames {
    fn default() -> Self {
        Self {
            variables: "rtiVariables".to_string(),
            workspace: "rtiWorkspace".to_string(),
            qp_params: "params".to_string(),
            qp_output: "output".to_string(),
            qp_info: "info".to_string(),
        }
    }
}

impl StorageNames {
    /// Instance name of a persistent storage class
    pub fn instance(&self, storage: StorageClass) -> Option<&str> {
        match storage {
            StorageClass::Variables => Some(&self.variables),
            StorageClass::Workspace => Some(&self.workspace),
            StorageClass::QpParams => Some(&self.qp_params),
            StorageClass::QpOutput => Some(&self.qp_output),
            StorageClass::QpInfo => Some(&self.qp_info),
            StorageClass::Local | StorageClass::Param => None,
        }
    }
}

/// IR Module - one generated compilation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub variables: Vec<Variable>,
    pub indices: Vec<IndexVar>,
    pub functions: Vec<Function>,
    pub externals: Vec<ExternalDecl>,
    pub storage_names: StorageNames,
    /// Verbatim lines placed after the includes (QP structure instances)
    pub preamble: Vec<String>,
    pub includes: Vec<String>,
    /// Storage structure types come from an included header
    #[serde(default)]
    pub storage_types_in_header: bool,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            variables: Vec::new(),
            indices: Vec::new(),
            functions: Vec::new(),
            externals: Vec::new(),
            storage_names: StorageNames::default(),
            preamble: Vec::new(),
            includes: Vec::new(),
            storage_types_in_header: false,
        }
    }

    /// Add a persistent variable; names are unique per storage class
    pub fn add_variable(&mut self, variable: Variable) -> Result<VarId, IrError> {
        if variable.storage.is_persistent()
            && self
                .variables
                .iter()
                .any(|v| v.storage == variable.storage && v.name == variable.name)
        {
            return Err(IrError::DuplicateSymbol(variable.name));
        }
        if let Some(values) = &variable.values {
            if values.len() != variable.shape.len() {
                return Err(IrError::ShapeMismatch {
                    context: format!("given values of '{}'", variable.name),
                    left: variable.shape,
                    right: Shape::new(values.len(), 1),
                });
            }
        }
        self.variables.push(variable);
        Ok(VarId((self.variables.len() - 1) as u32))
    }

    pub fn add_index(&mut self, name: &str) -> IndexId {
        self.indices.push(IndexVar {
            name: name.to_string(),
        });
        IndexId((self.indices.len() - 1) as u32)
    }

    pub fn declare_external(&mut self, decl: ExternalDecl) -> Result<(), IrError> {
        if self.externals.iter().any(|e| e.name == decl.name) {
            return Err(IrError::DuplicateSymbol(decl.name));
        }
        self.externals.push(decl);
        Ok(())
    }

    pub fn add_function(&mut self, function: Function) -> Result<FunctionId, IrError> {
        if self.functions.iter().any(|f| f.name == function.name)
            || self.externals.iter().any(|e| e.name == function.name)
        {
            return Err(IrError::DuplicateSymbol(function.name));
        }
        self.functions.push(function);
        Ok(FunctionId((self.functions.len() - 1) as u32))
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.0 as usize]
    }

    pub fn index_name(&self, id: IndexId) -> &str {
        &self.indices[id.0 as usize].name
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunctionId(i as u32))
    }

    pub fn get_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn external(&self, name: &str) -> Option<&ExternalDecl> {
        self.externals.iter().find(|e| e.name == name)
    }

    /// Persistent variable by storage class and name
    pub fn find_variable(&self, storage: StorageClass, name: &str) -> Option<VarId> {
        self.variables
            .iter()
            .position(|v| v.storage == storage && v.name == name)
            .map(|i| VarId(i as u32))
    }

    /// View of the whole variable
    pub fn whole(&self, id: VarId) -> Block {
        let shape = self.variable(id).shape;
        Block {
            var: id,
            row: Offset::constant(0),
            col: 0,
            rows: shape.rows,
            cols: shape.cols,
            transposed: false,
        }
    }

    /// View starting at an (possibly indexed) row offset
    pub fn block(
        &self,
        id: VarId,
        row: Offset,
        rows: usize,
        col: usize,
        cols: usize,
    ) -> Result<Block, IrError> {
        let var = self.variable(id);
        if row.constant + rows > var.shape.rows || col + cols > var.shape.cols {
            return Err(IrError::OutOfRange {
                name: var.name.clone(),
                row: row.constant,
                col,
                shape: Shape::new(rows, cols),
                bounds: var.shape,
            });
        }
        Ok(Block {
            var: id,
            row,
            col,
            rows,
            cols,
            transposed: false,
        })
    }

    /// Full-width rows `row .. row + rows`
    pub fn rows(&self, id: VarId, row: Offset, rows: usize) -> Result<Block, IrError> {
        let cols = self.variable(id).shape.cols;
        self.block(id, row, rows, 0, cols)
    }

    /// Check a call against the callee's parameter list
    pub fn call(&self, function: FunctionId, args: Vec<Arg>) -> Result<Statement, IrError> {
        let callee = self
            .functions
            .get(function.0 as usize)
            .ok_or_else(|| IrError::UnknownFunction(function.to_string()))?;
        if callee.params.len() != args.len() {
            return Err(IrError::ArityMismatch {
                function: callee.name.clone(),
                expected: callee.params.len(),
                found: args.len(),
            });
        }
        for (position, (param, arg)) in callee.params.iter().zip(&args).enumerate() {
            match (param, arg) {
                (Param::Matrix(param), Arg::Address(block)) => {
                    let needed = self.variable(*param).shape.len();
                    let target = self.variable(block.var);
                    let start = block.row.constant * target.shape.cols + block.col;
                    if start + needed > target.shape.len() {
                        return Err(IrError::BadArgument {
                            function: callee.name.clone(),
                            position,
                            message: format!(
                                "'{}' has no room for {} elements at offset {}",
                                target.name, needed, start
                            ),
                        });
                    }
                }
                (Param::Index(_), Arg::Index(_)) => {}
                _ => {
                    return Err(IrError::BadArgument {
                        function: callee.name.clone(),
                        position,
                        message: "argument kind does not match parameter".to_string(),
                    })
                }
            }
        }
        Ok(Statement::Call { function, args })
    }

    /// Call of a declared external routine
    pub fn call_external(&self, name: &str, result: Option<VarId>) -> Result<Statement, IrError> {
        let decl = self
            .external(name)
            .ok_or_else(|| IrError::UnknownFunction(name.to_string()))?;
        if result.is_some() && !decl.returns_status {
            return Err(IrError::BadArgument {
                function: name.to_string(),
                position: 0,
                message: "routine does not return a status".to_string(),
            });
        }
        Ok(Statement::External {
            result,
            name: decl.name.clone(),
            args: decl.params.clone(),
        })
    }

    /// Human readable form of a view
    pub fn block_name(&self, block: &Block) -> String {
        let var = self.variable(block.var);
        let row = match block.row.index {
            Some((id, coeff)) if block.row.constant > 0 => {
                format!("{}*{}+{}", self.index_name(id), coeff, block.row.constant)
            }
            Some((id, coeff)) => format!("{}*{}", self.index_name(id), coeff),
            None => block.row.constant.to_string(),
        };
        let mut name = if block.rows == var.shape.rows
            && block.cols == var.shape.cols
            && block.row == Offset::constant(0)
        {
            var.name.clone()
        } else {
            format!(
                "{}[{}:+{}, {}:+{}]",
                var.name, row, block.rows, block.col, block.cols
            )
        };
        if block.transposed {
            name.push('\'');
        }
        name
    }

    fn expr_name(&self, expr: &Expr) -> String {
        match expr {
            Expr::Block(block) => self.block_name(block),
            Expr::Zero(shape) => format!("zeros({})", shape),
            Expr::Identity { size, scale } => format!("{}*eye({})", scale, size),
            Expr::Scalar(value) => format!("{}", value),
            Expr::Add(l, r) => format!("({} + {})", self.expr_name(l), self.expr_name(r)),
            Expr::Sub(l, r) => format!("({} - {})", self.expr_name(l), self.expr_name(r)),
            Expr::Mul(l, r) => format!("{} * {}", self.expr_name(l), self.expr_name(r)),
        }
    }

    fn write_statements(
        &self,
        f: &mut fmt::Formatter<'_>,
        statements: &[Statement],
        depth: usize,
    ) -> fmt::Result {
        let pad = "  ".repeat(depth);
        for statement in statements {
            match statement {
                Statement::Assign { target, op, value } => {
                    writeln!(f, "{}{} {} {}", pad, self.block_name(target), op, self.expr_name(value))?
                }
                Statement::Call { function, args } => {
                    let args: Vec<String> = args
                        .iter()
                        .map(|arg| match arg {
                            Arg::Address(block) => format!("&{}", self.block_name(block)),
                            Arg::Index(offset) => match offset.index {
                                Some((id, coeff)) => format!(
                                    "{}*{}+{}",
                                    self.index_name(id),
                                    coeff,
                                    offset.constant
                                ),
                                None => offset.constant.to_string(),
                            },
                        })
                        .collect();
                    writeln!(f, "{}call {}({})", pad, self.function(*function).name, args.join(", "))?
                }
                Statement::External { result, name, args } => {
                    let args: Vec<String> = args.iter().map(|a| format!("&{}", a)).collect();
                    match result {
                        Some(var) => writeln!(
                            f,
                            "{}{} = extern {}({})",
                            pad,
                            self.variable(*var).name,
                            name,
                            args.join(", ")
                        )?,
                        None => writeln!(f, "{}extern {}({})", pad, name, args.join(", "))?,
                    }
                }
                Statement::ForLoop { index, start, end, parallel, body } => {
                    writeln!(
                        f,
                        "{}for{} {} in {}..{}:",
                        pad,
                        if *parallel { " parallel" } else { "" },
                        self.index_name(*index),
                        start,
                        end
                    )?;
                    self.write_statements(f, body, depth + 1)?;
                }
                Statement::IfNonZero { status, body } => {
                    writeln!(f, "{}if {} != 0:", pad, self.variable(*status).name)?;
                    self.write_statements(f, body, depth + 1)?;
                }
                Statement::Return => writeln!(f, "{}ret", pad)?,
                Statement::Comment(text) => writeln!(f, "{}; {}", pad, text)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for var in self.variables.iter().filter(|v| v.storage.is_persistent()) {
            writeln!(f, "  {} {} {}: {}", var.storage, var.scalar, var.name, var.shape)?;
        }
        for function in &self.functions {
            let params: Vec<String> = function
                .params
                .iter()
                .map(|p| match p {
                    Param::Matrix(id) => {
                        let var = self.variable(*id);
                        format!("{}: {}", var.name, var.shape)
                    }
                    Param::Index(id) => format!("{}: index", self.index_name(*id)),
                })
                .collect();
            writeln!(f, "define {}({}) {{", function.name, params.join(", "))?;
            self.write_statements(f, &function.body, 1)?;
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

/// Builder for one function; statements are appended in order
pub struct FunctionBuilder {
    function: Function,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            function: Function::new(name),
        }
    }

    pub fn doc(&mut self, doc: &str) -> &mut Self {
        self.function.doc = Some(doc.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    fn check_local_name(&self, module: &Module, name: &str) -> Result<(), IrError> {
        let taken = self
            .function
            .params
            .iter()
            .filter_map(|p| match p {
                Param::Matrix(id) => Some(module.variable(*id).name.as_str()),
                Param::Index(id) => Some(module.index_name(*id)),
            })
            .chain(self.function.locals.iter().map(|id| module.variable(*id).name.as_str()))
            .chain(self.function.indices.iter().map(|id| module.index_name(*id)))
            .any(|n| n == name);
        if taken {
            return Err(IrError::DuplicateSymbol(name.to_string()));
        }
        Ok(())
    }

    /// Matrix parameter passed by address
    pub fn add_param(
        &mut self,
        module: &mut Module,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<Block, IrError> {
        self.check_local_name(module, name)?;
        let id = module.add_variable(Variable::new(name, rows, cols, StorageClass::Param))?;
        self.function.params.push(Param::Matrix(id));
        Ok(module.whole(id))
    }

    pub fn add_index_param(&mut self, module: &mut Module, name: &str) -> Result<IndexId, IrError> {
        self.check_local_name(module, name)?;
        let id = module.add_index(name);
        self.function.params.push(Param::Index(id));
        Ok(id)
    }

    pub fn add_local(
        &mut self,
        module: &mut Module,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<Block, IrError> {
        self.check_local_name(module, name)?;
        let id = module.add_variable(Variable::new(name, rows, cols, StorageClass::Local))?;
        self.function.locals.push(id);
        Ok(module.whole(id))
    }

    /// Integer status local, optionally returned by the function
    pub fn add_status(
        &mut self,
        module: &mut Module,
        name: &str,
        doc: &str,
        returned: bool,
    ) -> Result<VarId, IrError> {
        self.check_local_name(module, name)?;
        let id = module.add_variable(Variable::int(name, StorageClass::Local).with_doc(doc))?;
        self.function.locals.push(id);
        if returned {
            self.function.return_value = Some(id);
        }
        Ok(id)
    }

    /// Real scalar local returned by the function
    pub fn add_return_value(&mut self, module: &mut Module, name: &str, doc: &str) -> Result<Block, IrError> {
        self.check_local_name(module, name)?;
        let id = module.add_variable(Variable::new(name, 1, 1, StorageClass::Local).with_doc(doc))?;
        self.function.locals.push(id);
        self.function.return_value = Some(id);
        Ok(module.whole(id))
    }

    /// Loop counter declared in this function
    pub fn add_index(&mut self, module: &mut Module, name: &str) -> Result<IndexId, IrError> {
        self.check_local_name(module, name)?;
        let id = module.add_index(name);
        self.function.indices.push(id);
        Ok(id)
    }

    pub fn push(&mut self, statement: Statement) {
        self.function.body.push(statement);
    }

    fn write(
        &mut self,
        module: &Module,
        target: Block,
        op: AssignOp,
        value: impl Into<Expr>,
    ) -> Result<(), IrError> {
        let var = module.variable(target.var);
        if var.is_given() {
            return Err(IrError::ReadOnly(var.name.clone()));
        }
        let statement = Statement::assign(target, op, value)?;
        self.push(statement);
        Ok(())
    }

    pub fn assign(&mut self, module: &Module, target: Block, value: impl Into<Expr>) -> Result<(), IrError> {
        self.write(module, target, AssignOp::Set, value)
    }

    pub fn accumulate(
        &mut self,
        module: &Module,
        target: Block,
        value: impl Into<Expr>,
    ) -> Result<(), IrError> {
        self.write(module, target, AssignOp::Add, value)
    }

    pub fn subtract(&mut self, module: &Module, target: Block, value: impl Into<Expr>) -> Result<(), IrError> {
        self.write(module, target, AssignOp::Sub, value)
    }

    pub fn comment(&mut self, text: &str) {
        self.push(Statement::Comment(text.to_string()));
    }

    pub fn finish(self, module: &mut Module) -> Result<FunctionId, IrError> {
        module.add_function(self.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn module_with_x() -> (Module, VarId) {
        let mut module = Module::new("test");
        let x = module
            .add_variable(Variable::new("x", 5, 2, StorageClass::Variables))
            .unwrap();
        (module, x)
    }

    #[test]
    fn test_offsets() {
        let idx = IndexId(0);
        let offset = Offset::indexed(idx, 4, 2).shifted(1);
        assert_eq!(offset.evaluate(|_| 3), 15);
        assert_eq!(offset.scaled(2), Offset::indexed(idx, 8, 6));
        assert_eq!(Offset::constant(7).evaluate(|_| 100), 7);
    }

    #[test]
    fn test_block_views() {
        let (module, x) = module_with_x();
        let row = module.rows(x, Offset::constant(1), 1).unwrap();
        assert_eq!(row.shape(), Shape::new(1, 2));
        assert_eq!(row.transpose().shape(), Shape::new(2, 1));

        let t = row.transpose();
        assert_eq!(t.element(1, 0), (Offset::constant(1), 1));

        assert!(module.block(x, Offset::constant(4), 2, 0, 2).is_err());
        assert!(module.block(x, Offset::constant(4), 1, 1, 1).is_ok());
    }

    #[test]
    fn test_expression_shapes() {
        let mut module = Module::new("test");
        let a = module
            .add_variable(Variable::new("A", 3, 3, StorageClass::Workspace))
            .unwrap();
        let b = module
            .add_variable(Variable::new("B", 3, 1, StorageClass::Workspace))
            .unwrap();
        let a = module.whole(a);
        let b = module.whole(b);

        assert_eq!((a * b).shape().unwrap(), Shape::new(3, 1));
        assert_eq!((a * a + Expr::Identity { size: 3, scale: 2.0 }).shape().unwrap(), Shape::new(3, 3));
        assert!((b * a).shape().is_err());
        assert!((a + b).shape().is_err());
        assert_eq!((b.transpose() * a * b).shape().unwrap(), Shape::new(1, 1));
    }

    #[test]
    fn test_assignment_shape_check() {
        let (module, x) = module_with_x();
        let row = module.rows(x, Offset::constant(0), 1).unwrap();
        assert!(Statement::assign(row, AssignOp::Set, Expr::Zero(Shape::new(1, 2))).is_ok());
        let err = Statement::assign(row, AssignOp::Add, Expr::Zero(Shape::new(2, 1))).unwrap_err();
        assert!(matches!(err, IrError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_symbols() {
        let (mut module, _) = module_with_x();
        let dup = module.add_variable(Variable::new("x", 1, 1, StorageClass::Variables));
        assert_eq!(dup, Err(IrError::DuplicateSymbol("x".to_string())));
        // Same name in another storage class is fine
        assert!(module
            .add_variable(Variable::new("x", 1, 1, StorageClass::Workspace))
            .is_ok());
    }

    #[test]
    fn test_given_variables_are_read_only() {
        let mut module = Module::new("test");
        let slx = module
            .add_variable(Variable::given("Slx", 2, 1, vec![1.0, 2.0]))
            .unwrap();
        let mut builder = FunctionBuilder::new("f");
        let target = module.whole(slx);
        let err = builder
            .assign(&module, target, Expr::Zero(Shape::new(2, 1)))
            .unwrap_err();
        assert_eq!(err, IrError::ReadOnly("Slx".to_string()));

        let bad = module.add_variable(Variable::given("bad", 2, 2, vec![1.0]));
        assert!(bad.is_err());
    }

    #[test]
    fn test_call_checks() {
        let mut module = Module::new("test");
        let buffer = module
            .add_variable(Variable::new("buf", 4, 1, StorageClass::Workspace))
            .unwrap();

        let mut helper = FunctionBuilder::new("helper");
        helper.add_param(&mut module, "v", 2, 1).unwrap();
        helper.add_index_param(&mut module, "k").unwrap();
        let helper = helper.finish(&mut module).unwrap();

        let ok = module.call(
            helper,
            vec![
                Arg::Address(module.block(buffer, Offset::constant(2), 2, 0, 1).unwrap()),
                Arg::Index(Offset::constant(1)),
            ],
        );
        assert!(ok.is_ok());

        let too_far = module.call(
            helper,
            vec![
                Arg::Address(module.block(buffer, Offset::constant(3), 1, 0, 1).unwrap()),
                Arg::Index(Offset::constant(1)),
            ],
        );
        assert!(matches!(too_far, Err(IrError::BadArgument { .. })));

        let arity = module.call(helper, vec![Arg::Index(Offset::constant(0))]);
        assert!(matches!(arity, Err(IrError::ArityMismatch { expected: 2, found: 1, .. })));
    }

    #[test]
    fn test_local_name_clash() {
        let mut module = Module::new("test");
        let mut builder = FunctionBuilder::new("f");
        builder.add_local(&mut module, "tmp", 2, 1).unwrap();
        assert!(builder.add_index(&mut module, "tmp").is_err());
    }

    #[test]
    fn test_external_calls() {
        let mut module = Module::new("test");
        module
            .declare_external(ExternalDecl {
                name: "modelSimulation".to_string(),
                returns_status: true,
                params: Vec::new(),
                declared_elsewhere: false,
                doc: None,
            })
            .unwrap();
        module
            .declare_external(ExternalDecl {
                name: "evaluateObjective".to_string(),
                returns_status: false,
                params: Vec::new(),
                declared_elsewhere: false,
                doc: None,
            })
            .unwrap();
        let ret = module.add_variable(Variable::int("ret", StorageClass::Local)).unwrap();

        assert!(module.call_external("modelSimulation", Some(ret)).is_ok());
        assert!(module.call_external("evaluateObjective", Some(ret)).is_err());
        assert!(module.call_external("missing", None).is_err());
    }

    #[test]
    fn test_module_display() {
        let (mut module, x) = module_with_x();
        let mut builder = FunctionBuilder::new("shift");
        let k = builder.add_index(&mut module, "k").unwrap();
        let row = module.rows(x, Offset::indexed(k, 1, 0), 1).unwrap();
        let body = vec![Statement::assign(row, AssignOp::Set, Expr::Zero(Shape::new(1, 2))).unwrap()];
        builder.push(Statement::for_loop(k, 0, 5, body));
        builder.finish(&mut module).unwrap();

        let text = module.to_string();
        assert!(text.contains("define shift() {"));
        assert!(text.contains("for k in 0..5:"));
        assert!(text.contains("x[k*1:+1, 0:+2] = zeros(1x2)"));
    }
}
