//! C rendering of an IR module
//!
//! Matrix statements are unrolled element by element. Terms that are
//! structurally zero (zero blocks, zero literals, off-diagonal identity
//! entries) are pruned, so a product with a sparse given matrix only
//! produces the nonzero multiply-adds.

use crate::ir::{
    Arg, AssignOp, Block, Expr, Function, Module, Offset, Param, Statement, StorageClass,
    Variable,
};

/// Render a real literal the way the generated sources spell them
pub fn format_real(value: f64) -> String {
    format!("{:+.16e}", value)
}

/// Render an affine offset, e.g. `blockI*8+3`
pub fn format_offset(module: &Module, offset: &Offset) -> String {
    match offset.index {
        Some((_, 0)) | None => offset.constant.to_string(),
        Some((id, coeff)) => {
            let mut text = module.index_name(id).to_string();
            if coeff != 1 {
                text.push_str(&format!("*{}", coeff));
            }
            if offset.constant != 0 {
                text.push_str(&format!("+{}", offset.constant));
            }
            text
        }
    }
}

/// A rendered scalar term; `compound` terms need parentheses inside products
struct Term {
    text: String,
    compound: bool,
}

impl Term {
    fn simple(text: String) -> Self {
        Self {
            text,
            compound: false,
        }
    }

    fn grouped(&self) -> String {
        if self.compound {
            format!("({})", self.text)
        } else {
            self.text.clone()
        }
    }
}

/// Renders one module as a C translation unit
pub struct CEmitter<'m> {
    module: &'m Module,
    output: String,
    indent: usize,
}

impl<'m> CEmitter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            output: String::new(),
            indent: 0,
        }
    }

    /// Render the whole module
    pub fn emit(mut self) -> String {
        let module = self.module;
        self.line(&format!("/* Generated by rtigen: {} */", module.name));
        self.blank();
        for include in &module.includes {
            self.line(&format!("#include \"{}\"", include));
        }
        if !module.includes.is_empty() {
            self.blank();
        }
        for line in &module.preamble {
            self.line(line);
        }
        if !module.preamble.is_empty() {
            self.blank();
        }

        self.emit_storage(StorageClass::Variables);
        self.emit_storage(StorageClass::Workspace);

        for external in module.externals.iter().filter(|e| !e.declared_elsewhere) {
            if let Some(doc) = &external.doc {
                self.line(&format!("/** {} */", doc));
            }
            let ret = if external.returns_status { "int" } else { "void" };
            self.line(&format!("{} {}( void );", ret, external.name));
        }
        if !module.externals.is_empty() {
            self.blank();
        }

        for function in &module.functions {
            self.line(&format!("{};", self.signature(function)));
        }
        self.blank();

        for function in &module.functions {
            self.emit_function(function);
            self.blank();
        }

        self.output
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.output.push('\t');
        }
        self.output.push_str(text);
        self.output.push('\n');
    }

    fn blank(&mut self) {
        self.output.push('\n');
    }

    fn declaration(variable: &Variable) -> String {
        if variable.is_scalar() {
            format!("{} {};", variable.scalar, variable.name)
        } else {
            format!("{} {}[ {} ];", variable.scalar, variable.name, variable.shape.len())
        }
    }

    fn emit_storage(&mut self, storage: StorageClass) {
        let module = self.module;
        let Some(instance) = module.storage_names.instance(storage) else {
            return;
        };
        if storage_members(module, storage).is_empty() {
            return;
        }
        let type_name = storage_type_name(instance);
        if !module.storage_types_in_header {
            for line in storage_typedef(module, storage) {
                self.line(&line);
            }
            self.blank();
        }
        self.line(&format!("{} {};", type_name, instance));
        self.blank();
    }

    fn signature(&self, function: &Function) -> String {
        let module = self.module;
        let ret = match function.return_value {
            Some(id) => module.variable(id).scalar.to_string(),
            None => "void".to_string(),
        };
        let params: Vec<String> = function
            .params
            .iter()
            .map(|p| match p {
                Param::Matrix(id) => format!("real_t* const {}", module.variable(*id).name),
                Param::Index(id) => format!("int {}", module.index_name(*id)),
            })
            .collect();
        if params.is_empty() {
            format!("{} {}( void )", ret, function.name)
        } else {
            format!("{} {}( {} )", ret, function.name, params.join(", "))
        }
    }

    fn emit_function(&mut self, function: &Function) {
        let module = self.module;
        if let Some(doc) = &function.doc {
            self.line(&format!("/** {} */", doc));
        }
        self.line(&self.signature(function));
        self.line("{");
        self.indent += 1;
        for id in &function.locals {
            let variable = module.variable(*id);
            self.line(&Self::declaration(variable));
        }
        for id in &function.indices {
            self.line(&format!("int {};", module.index_name(*id)));
        }
        if !function.locals.is_empty() || !function.indices.is_empty() {
            self.blank();
        }
        self.emit_statements(&function.body, function);
        self.indent -= 1;
        self.line("}");
    }

    fn emit_statements(&mut self, statements: &[Statement], function: &Function) {
        let module = self.module;
        for statement in statements {
            match statement {
                Statement::Assign { target, op, value } => self.emit_assign(target, *op, value),
                Statement::Call { function: callee, args } => {
                    let args: Vec<String> = args
                        .iter()
                        .map(|arg| match arg {
                            Arg::Address(block) => self.address(block),
                            Arg::Index(offset) => format_offset(module, offset),
                        })
                        .collect();
                    let name = &module.function(*callee).name;
                    self.line(&format!("{}( {} );", name, args.join(", ")));
                }
                Statement::External { result, name, args } => {
                    let args: Vec<String> = args
                        .iter()
                        .filter_map(|storage| module.storage_names.instance(*storage))
                        .map(|instance| format!("&{}", instance))
                        .collect();
                    let call = if args.is_empty() {
                        format!("{}(  )", name)
                    } else {
                        format!("{}( {} )", name, args.join(", "))
                    };
                    match result {
                        Some(id) => {
                            let target = module.variable(*id).name.clone();
                            self.line(&format!("{} = {};", target, call));
                        }
                        None => self.line(&format!("{};", call)),
                    }
                }
                Statement::ForLoop {
                    index,
                    start,
                    end,
                    parallel,
                    body,
                } => {
                    if *parallel {
                        self.output.push_str("#pragma omp parallel for\n");
                    }
                    let name = module.index_name(*index).to_string();
                    self.line(&format!(
                        "for ({name} = {start}; {name} < {end}; ++{name})"
                    ));
                    self.line("{");
                    self.indent += 1;
                    self.emit_statements(body, function);
                    self.indent -= 1;
                    self.line("}");
                }
                Statement::IfNonZero { status, body } => {
                    let name = module.variable(*status).name.clone();
                    self.line(&format!("if ({} != 0)", name));
                    self.line("{");
                    self.indent += 1;
                    self.emit_statements(body, function);
                    self.indent -= 1;
                    self.line("}");
                }
                Statement::Return => match function.return_value {
                    Some(id) => {
                        let name = module.variable(id).name.clone();
                        self.line(&format!("return {};", name));
                    }
                    None => self.line("return;"),
                },
                Statement::Comment(text) => self.line(&format!("/* {} */", text)),
            }
        }
    }

    fn emit_assign(&mut self, target: &Block, op: AssignOp, value: &Expr) {
        let shape = target.shape();
        for i in 0..shape.rows {
            for j in 0..shape.cols {
                let lhs = self.reference(target, i, j);
                match (op, self.term(value, i, j)) {
                    (AssignOp::Set, Some(term)) => self.line(&format!("{} = {};", lhs, term.text)),
                    (AssignOp::Set, None) => self.line(&format!("{} = 0.0;", lhs)),
                    (AssignOp::Add, Some(term)) => self.line(&format!("{} += {};", lhs, term.text)),
                    (AssignOp::Sub, Some(term)) => {
                        self.line(&format!("{} -= {};", lhs, term.grouped()))
                    }
                    (AssignOp::Add | AssignOp::Sub, None) => {}
                }
            }
        }
    }

    fn base(&self, variable: &Variable) -> String {
        match self.module.storage_names.instance(variable.storage) {
            Some(instance) => format!("{}.{}", instance, variable.name),
            None => variable.name.clone(),
        }
    }

    fn flat(&self, block: &Block, i: usize, j: usize) -> Offset {
        let variable = self.module.variable(block.var);
        let (row, col) = block.element(i, j);
        row.scaled(variable.shape.cols).shifted(col)
    }

    /// L-value of element `(i, j)` of a view
    fn reference(&self, block: &Block, i: usize, j: usize) -> String {
        let variable = self.module.variable(block.var);
        let base = self.base(variable);
        if variable.is_scalar() {
            return base;
        }
        format!("{}[{}]", base, format_offset(self.module, &self.flat(block, i, j)))
    }

    /// Address of the first element of a view
    fn address(&self, block: &Block) -> String {
        let variable = self.module.variable(block.var);
        let base = self.base(variable);
        if variable.is_scalar() {
            return format!("&{}", base);
        }
        let flat = self.flat(block, 0, 0);
        if flat == Offset::constant(0) {
            base
        } else {
            format!("&({}[{}])", base, format_offset(self.module, &flat))
        }
    }

    /// Scalar term for element `(i, j)`; `None` when it is structurally zero
    fn term(&self, expr: &Expr, i: usize, j: usize) -> Option<Term> {
        match expr {
            Expr::Block(block) => {
                let variable = self.module.variable(block.var);
                match &variable.values {
                    Some(values) => {
                        let flat = self.flat(block, i, j);
                        // Given variables are only addressed with constant offsets
                        let value = values.get(flat.constant).copied().unwrap_or(0.0);
                        if flat.index.is_some() || value != 0.0 {
                            Some(Term::simple(format_real(value)))
                        } else {
                            None
                        }
                    }
                    None => Some(Term::simple(self.reference(block, i, j))),
                }
            }
            Expr::Zero(_) => None,
            Expr::Identity { scale, .. } => {
                (i == j && *scale != 0.0).then(|| Term::simple(format_real(*scale)))
            }
            Expr::Scalar(value) => (*value != 0.0).then(|| Term::simple(format_real(*value))),
            Expr::Add(lhs, rhs) => match (self.term(lhs, i, j), self.term(rhs, i, j)) {
                (None, None) => None,
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (Some(a), Some(b)) => Some(Term {
                    text: format!("{} + {}", a.text, b.text),
                    compound: true,
                }),
            },
            Expr::Sub(lhs, rhs) => match (self.term(lhs, i, j), self.term(rhs, i, j)) {
                (None, None) => None,
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(Term {
                    text: format!("- {}", b.grouped()),
                    compound: true,
                }),
                (Some(a), Some(b)) => Some(Term {
                    text: format!("{} - {}", a.text, b.grouped()),
                    compound: true,
                }),
            },
            Expr::Mul(lhs, rhs) => {
                let inner = lhs.shape().map(|s| s.cols).unwrap_or(0);
                let products: Vec<String> = (0..inner)
                    .filter_map(|k| {
                        let a = self.term(lhs, i, k)?;
                        let b = self.term(rhs, k, j)?;
                        Some(format!("{}*{}", a.grouped(), b.grouped()))
                    })
                    .collect();
                match products.len() {
                    0 => None,
                    1 => products.into_iter().next().map(Term::simple),
                    _ => Some(Term {
                        text: products.join(" + "),
                        compound: true,
                    }),
                }
            }
        }
    }
}

/// Render a module as C source
pub fn emit_c(module: &Module) -> String {
    CEmitter::new(module).emit()
}

fn storage_members(module: &Module, storage: StorageClass) -> Vec<&Variable> {
    module
        .variables
        .iter()
        .filter(|v| v.storage == storage && !v.is_given())
        .collect()
}

/// `rtiVariables` is an instance of `RtiVariables`
fn storage_type_name(instance: &str) -> String {
    let mut type_name = instance.to_string();
    if let Some(first) = type_name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    type_name
}

fn storage_typedef(module: &Module, storage: StorageClass) -> Vec<String> {
    let Some(instance) = module.storage_names.instance(storage) else {
        return Vec::new();
    };
    let type_name = storage_type_name(instance);
    let mut lines = vec![format!("typedef struct {}_", type_name), "{".to_string()];
    for variable in storage_members(module, storage) {
        if let Some(doc) = &variable.doc {
            lines.push(format!("\t/** {} */", doc));
        }
        lines.push(format!("\t{}", CEmitter::declaration(variable)));
    }
    lines.push(format!("}} {};", type_name));
    lines
}

/// Structure types and `extern` instances of the persistent storage, for a
/// header shared with user code
pub fn storage_declarations(module: &Module) -> String {
    let mut out = String::new();
    for storage in [StorageClass::Variables, StorageClass::Workspace] {
        let Some(instance) = module.storage_names.instance(storage) else {
            continue;
        };
        if storage_members(module, storage).is_empty() {
            continue;
        }
        for line in storage_typedef(module, storage) {
            out.push_str(&line);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&format!("extern {} {};\n\n", storage_type_name(instance), instance));
    }
    out
}
