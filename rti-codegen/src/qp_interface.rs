//! QP interface adapter for a FORCES-style multistage solver
//!
//! Two artifacts come out of here: the interface header that declares the
//! solver's parameter/output/info instances for the generated code, and a
//! MATLAB script that builds the solver itself. At run time the generated
//! code calls `<module>_solve(&params, &output, &info)` and treats the
//! returned status as opaque.

use crate::multipliers::BoundIndexSet;
use crate::partition::BlockPartition;
use rti_common::{ExportError, PrintLevel, ProblemConfig};
use rti_ir::{ExternalDecl, Module, ScalarType, StorageClass, Variable};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// File name of the generated solver build script
pub const GENERATOR_SCRIPT_NAME: &str = "rti_forces_generator.m";

/// Effective iteration cap: non-positive requests derive it from the QP size
pub fn iteration_cap(max_num_qp_iterations: i32, num_qp_vars: usize) -> usize {
    if max_num_qp_iterations <= 0 {
        3 * num_qp_vars
    } else {
        max_num_qp_iterations as usize
    }
}

/// Solver print level: only HIGH is verbose
pub fn solver_print_level(level: PrintLevel) -> u8 {
    if level == PrintLevel::High {
        2
    } else {
        0
    }
}

/// Layout of the solver's memory as seen by the generated code
#[derive(Debug, Clone, PartialEq)]
pub struct ForcesInterface {
    pub module_name: String,
    pub instance_prefix: String,
    pub header_name: String,
    pub params_struct_name: String,
    pub params_field_decl: String,
    pub output_struct_name: String,
    pub output_field_decl: String,
    pub info_struct_name: String,
    pub info_field_decl: String,
}

impl ForcesInterface {
    /// Interface for solver module `module_name`; instances are named
    /// `<instance_prefix>_params` and so on
    pub fn new(module_name: &str, instance_prefix: &str) -> Self {
        let mut interface = Self {
            module_name: module_name.to_string(),
            instance_prefix: instance_prefix.to_string(),
            header_name: String::new(),
            params_struct_name: String::new(),
            params_field_decl: String::new(),
            output_struct_name: String::new(),
            output_field_decl: String::new(),
            info_struct_name: String::new(),
            info_field_decl: String::new(),
        };
        let float = format!("{}_FLOAT", module_name);
        interface.configure(
            &format!("{}.h", module_name),
            &format!("{}_params", module_name),
            &float,
            &format!("{}_output", module_name),
            &float,
            &format!("{}_info", module_name),
            &float,
        );
        interface
    }

    /// Declare the solver header and the three structures. The field
    /// declarations are the C element types of the structure fields.
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &mut self,
        header_name: &str,
        params_struct_name: &str,
        params_field_decl: &str,
        output_struct_name: &str,
        output_field_decl: &str,
        info_struct_name: &str,
        info_field_decl: &str,
    ) {
        self.header_name = header_name.to_string();
        self.params_struct_name = params_struct_name.to_string();
        self.params_field_decl = params_field_decl.to_string();
        self.output_struct_name = output_struct_name.to_string();
        self.output_field_decl = output_field_decl.to_string();
        self.info_struct_name = info_struct_name.to_string();
        self.info_field_decl = info_field_decl.to_string();
    }

    pub fn solve_name(&self) -> String {
        format!("{}_solve", self.module_name)
    }

    /// Solver setup hook called once by `initializeSolver`
    pub fn init_name(&self) -> String {
        let mut name = self.module_name.clone();
        if let Some(first) = name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        format!("initialize{}", name)
    }

    fn instance(&self, suffix: &str) -> String {
        format!("{}_{}", self.instance_prefix, suffix)
    }

    /// Bind the QP storage classes of `module` to this solver. The storage
    /// structure types move into the interface header.
    pub fn install(&self, module: &mut Module, interface_header: &str) -> Result<(), ExportError> {
        module.storage_names.qp_params = self.instance("params");
        module.storage_names.qp_output = self.instance("output");
        module.storage_names.qp_info = self.instance("info");
        module.storage_types_in_header = true;
        module.includes.push(interface_header.to_string());
        module.preamble.push(format!("{} {};", self.params_struct_name, self.instance("params")));
        module.preamble.push(format!("{} {};", self.output_struct_name, self.instance("output")));
        module.preamble.push(format!("{} {};", self.info_struct_name, self.instance("info")));
        module.declare_external(ExternalDecl {
            name: self.solve_name(),
            returns_status: true,
            params: vec![StorageClass::QpParams, StorageClass::QpOutput, StorageClass::QpInfo],
            declared_elsewhere: true,
            doc: None,
        })?;
        module.declare_external(ExternalDecl {
            name: self.init_name(),
            returns_status: false,
            params: Vec::new(),
            declared_elsewhere: false,
            doc: Some("Prepare the QP solver; provided together with the solver.".to_string()),
        })?;
        Ok(())
    }

    fn field_lines(&self, module: &Module, storage: StorageClass, field_decl: &str) -> Vec<String> {
        module
            .variables
            .iter()
            .filter(|v| v.storage == storage)
            .map(|v: &Variable| {
                let ty = match v.scalar {
                    ScalarType::Int => "int",
                    ScalarType::Real => field_decl,
                };
                let decl = if v.is_scalar() {
                    format!("{} {};", ty, v.name)
                } else {
                    format!("{} {}[ {} ];", ty, v.name, v.shape.len())
                };
                match &v.doc {
                    Some(doc) => format!("{:<32} - {}", decl, doc),
                    None => decl,
                }
            })
            .collect()
    }

    /// Interface header included by the generated solver source and by the
    /// user code that fills the solver buffers
    pub fn render_header(&self, module: &Module, guard: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "/* Generated by rtigen: QP interface for {} */", self.module_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "#ifndef {}", guard);
        let _ = writeln!(out, "#define {}", guard);
        let _ = writeln!(out);
        let _ = writeln!(out, "#include \"{}\"", self.header_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "#ifndef RTI_REAL_T_DEFINED");
        let _ = writeln!(out, "#define RTI_REAL_T_DEFINED");
        let _ = writeln!(out, "typedef double real_t;");
        let _ = writeln!(out, "#endif");
        let _ = writeln!(out);

        out.push_str(&rti_ir::storage_declarations(module));

        let sections = [
            (StorageClass::QpParams, &self.params_struct_name, &self.params_field_decl),
            (StorageClass::QpOutput, &self.output_struct_name, &self.output_field_decl),
            (StorageClass::QpInfo, &self.info_struct_name, &self.info_field_decl),
        ];
        for (storage, struct_name, field_decl) in sections {
            let _ = writeln!(out, "/* Fields of {} used by the generated code:", struct_name);
            for line in self.field_lines(module, storage, field_decl) {
                let _ = writeln!(out, " *   {}", line);
            }
            let _ = writeln!(out, " */");
            if let Some(instance) = module.storage_names.instance(storage) {
                let _ = writeln!(out, "extern {} {};", struct_name, instance);
            }
            let _ = writeln!(out);
        }

        for function in &module.functions {
            if let Some(doc) = &function.doc {
                if function.params.is_empty() {
                    let ret = match function.return_value {
                        Some(id) => module.variable(id).scalar.to_string(),
                        None => "void".to_string(),
                    };
                    let _ = writeln!(out, "/** {} */", doc);
                    let _ = writeln!(out, "{} {}( void );", ret, function.name);
                    let _ = writeln!(out);
                }
            }
        }

        let _ = writeln!(out, "#endif /* {} */", guard);
        out
    }
}

/// Configuration of the solver build script
///
/// The script declares one QP stage per block plus the terminal state. Its
/// parameter and output names are the structure fields the generated code
/// reads and writes, with the same stacked layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ForcesGenerator {
    pub nx: usize,
    pub nu: usize,
    pub n: usize,
    pub block_size: usize,
    pub block_lengths: Vec<usize>,
    /// Lower, upper and affine bound index sets per QP stage
    pub lb_indices: Vec<BoundIndexSet>,
    pub ub_indices: Vec<BoundIndexSet>,
    pub ab_indices: Vec<BoundIndexSet>,
    pub hessian_given: bool,
    pub diagonal_h: bool,
    pub diagonal_hn: bool,
    pub initial_state_fixed: bool,
    pub module_name: String,
    pub print_level: u8,
    pub max_iterations: usize,
    pub parallel: bool,
    pub overwrite: bool,
    pub warm_start: bool,
}

/// MATLAB stage list `first:last`, or a single stage
fn stage_range(first: usize, last: usize) -> String {
    if first == last {
        first.to_string()
    } else {
        format!("{}:{}", first, last)
    }
}

impl ForcesGenerator {
    pub fn configure(
        config: &ProblemConfig,
        partition: &BlockPartition,
        module_name: &str,
    ) -> Self {
        let options = &config.options;
        let nb = partition.number_of_blocks();
        let nbv = partition.num_block_variables();

        // Bounds on the block decisions: entry state and controls of each block
        let mut lb_indices = Vec::with_capacity(nb + 1);
        let mut ub_indices = Vec::with_capacity(nb + 1);
        for upper in [false, true] {
            let states = BoundIndexSet::from_bounds(&config.state_bounds, config.dims.nx, config.dims.n + 1, upper);
            let controls = BoundIndexSet::from_bounds(&config.control_bounds, config.dims.nu, config.dims.n, upper);
            let target = if upper { &mut ub_indices } else { &mut lb_indices };
            for block in partition.blocks() {
                let entry = block.stages.start;
                let mut indices: Vec<usize> = states.slice(entry * config.dims.nx..(entry + 1) * config.dims.nx);
                indices.extend(
                    controls
                        .slice(block.stages.start * config.dims.nu..block.stages.end * config.dims.nu)
                        .into_iter()
                        .map(|i| i + config.dims.nx),
                );
                target.push(BoundIndexSet::new(indices));
            }
            target.push(BoundIndexSet::new(
                states.slice(config.dims.n * config.dims.nx..(config.dims.n + 1) * config.dims.nx),
            ));
        }

        let max_iterations = iteration_cap(options.max_num_qp_iterations, partition.num_qp_variables());
        log::debug!(
            "Solver generator: {} stages of at most {} variables, maxit {}",
            nb + 1,
            nbv,
            max_iterations
        );

        Self {
            nx: config.dims.nx,
            nu: config.dims.nu,
            n: config.dims.n,
            block_size: partition.block_size,
            block_lengths: partition.blocks().map(|b| b.stages.len()).collect(),
            lb_indices,
            ub_indices,
            ab_indices: vec![BoundIndexSet::default(); nb + 1],
            hessian_given: false,
            diagonal_h: false,
            diagonal_hn: false,
            initial_state_fixed: config.initial_state_fixed,
            module_name: module_name.to_string(),
            print_level: solver_print_level(options.print_level),
            max_iterations,
            parallel: options.cg_use_openmp,
            overwrite: true,
            warm_start: options.hotstart_qp,
        }
    }

    fn matlab_list(indices: &BoundIndexSet) -> String {
        let items: Vec<String> = indices.as_slice().iter().map(|i| (i + 1).to_string()).collect();
        format!("[{}]", items.join(" "))
    }

    /// Length of the shorter last block, if there is one
    fn short_tail(&self) -> Option<usize> {
        self.block_lengths
            .last()
            .copied()
            .filter(|len| *len < self.block_size)
    }

    /// MATLAB source of the build script
    pub fn render(&self) -> String {
        let nb = self.block_lengths.len();
        let terminal = nb + 1;
        let tail = self.short_tail();
        let full = if tail.is_some() { nb - 1 } else { nb };

        let mut out = String::new();
        let _ = writeln!(out, "% Generated by rtigen: builds the block-condensed QP solver '{}'", self.module_name);
        let _ = writeln!(out, "% Do not edit, regenerate instead.");
        let _ = writeln!(out, "%");
        let _ = writeln!(out, "% Parameters mapped to several stages are stacked: stage k reads slot k.");
        let _ = writeln!(out, "% Slots of H, f and C are sized for a full block; a shorter last block");
        let _ = writeln!(out, "% reads the leading rows and columns of its slot. The coupling of block k");
        let _ = writeln!(out, "% is C_k*z_k - x_{{k+1}} = d_k, so d holds the negated block offset.");
        let _ = writeln!(out);
        let _ = writeln!(out, "nx = {};", self.nx);
        let _ = writeln!(out, "nu = {};", self.nu);
        let _ = writeln!(out, "N = {};", self.n);
        let _ = writeln!(out, "nBlocks = {};", nb);
        let _ = writeln!(out);
        let _ = writeln!(out, "stages = MultistageProblem(nBlocks + 1);");
        let _ = writeln!(out);

        for (k, len) in self.block_lengths.iter().enumerate() {
            let stage = k + 1;
            let nvar = self.nx + len * self.nu;
            let _ = writeln!(out, "% block {}: {} stages", k, len);
            let _ = writeln!(out, "stages({}).dims.n = {};", stage, nvar);
            let r = if k == 0 && !self.initial_state_fixed { 0 } else { self.nx };
            let _ = writeln!(out, "stages({}).dims.r = {};", stage, r);
            self.render_bounds(&mut out, stage, k);
            if k == 0 && self.initial_state_fixed {
                let _ = writeln!(out, "stages({}).eq.D = [eye(nx), zeros(nx, {})];", stage, len * self.nu);
            } else if k > 0 {
                let _ = writeln!(out, "stages({}).eq.D = [-eye(nx), zeros(nx, {})];", stage, len * self.nu);
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "% terminal state");
        let _ = writeln!(out, "stages({}).dims.n = nx;", terminal);
        let _ = writeln!(out, "stages({}).dims.r = nx;", terminal);
        self.render_bounds(&mut out, terminal, nb);
        let _ = writeln!(out, "stages({}).eq.D = -eye(nx);", terminal);
        let _ = writeln!(out);

        let blocks = stage_range(1, nb);
        let _ = writeln!(out, "params = [];");
        let _ = writeln!(out, "params(end+1) = newParam('H', {}, 'cost.H');", blocks);
        let _ = writeln!(out, "params(end+1) = newParam('f', {}, 'cost.f');", blocks);
        let _ = writeln!(out, "params(end+1) = newParam('C', {}, 'eq.C');", blocks);
        let _ = writeln!(out, "params(end+1) = newParam('d', {}, 'eq.c');", stage_range(2, terminal));
        if self.initial_state_fixed {
            let _ = writeln!(out, "params(end+1) = newParam('c0', 1, 'eq.c');");
        }
        let _ = writeln!(out, "params(end+1) = newParam('HN', {}, 'cost.H');", terminal);
        let _ = writeln!(out, "params(end+1) = newParam('fN', {}, 'cost.f');", terminal);
        if self.warm_start {
            let _ = writeln!(out, "params(end+1) = newParam('z_init', {}, 'z_init');", stage_range(1, full));
            if tail.is_some() {
                let _ = writeln!(out, "params(end+1) = newParam('zLast_init', {}, 'z_init');", nb);
            }
            let _ = writeln!(out, "params(end+1) = newParam('zN_init', {}, 'z_init');", terminal);
        }
        let _ = writeln!(out);

        let flag = |b: bool| u8::from(b);
        let _ = writeln!(out, "% Hessian given: {}, diagonal H: {}, diagonal HN: {}",
            flag(self.hessian_given), flag(self.diagonal_h), flag(self.diagonal_hn));
        let _ = writeln!(out, "codeoptions = getOptions('{}');", self.module_name);
        let _ = writeln!(out, "codeoptions.printlevel = {};", self.print_level);
        let _ = writeln!(out, "codeoptions.maxit = {};", self.max_iterations);
        let _ = writeln!(out, "codeoptions.parallel = {};", flag(self.parallel));
        let _ = writeln!(out, "codeoptions.overwrite = {};", flag(self.overwrite));
        let _ = writeln!(out, "codeoptions.warmstart = {};", flag(self.warm_start));
        let _ = writeln!(out);

        let mut outputs = vec![format!(
            "newOutput('z', {}, 1:nx+{}*nu)",
            stage_range(1, full),
            self.block_size
        )];
        if let Some(len) = tail {
            outputs.push(format!("newOutput('zLast', {}, 1:nx+{}*nu)", nb, len));
        }
        outputs.push(format!("newOutput('zN', {}, 1:nx)", terminal));
        let _ = writeln!(out, "outputs = [ {} ];", outputs.join(", "));
        let _ = writeln!(out, "generateCode(stages, params, codeoptions, outputs);");
        out
    }

    fn render_bounds(&self, out: &mut String, stage: usize, k: usize) {
        let empty = BoundIndexSet::default();
        let lb = self.lb_indices.get(k).unwrap_or(&empty);
        let ub = self.ub_indices.get(k).unwrap_or(&empty);
        let ab = self.ab_indices.get(k).unwrap_or(&empty);
        let _ = writeln!(out, "stages({}).dims.l = {};", stage, lb.len());
        let _ = writeln!(out, "stages({}).dims.u = {};", stage, ub.len());
        let _ = writeln!(out, "stages({}).dims.p = {};", stage, ab.len());
        let _ = writeln!(out, "stages({}).ineq.b.lbidx = {};", stage, Self::matlab_list(lb));
        let _ = writeln!(out, "stages({}).ineq.b.ubidx = {};", stage, Self::matlab_list(ub));
    }

    /// Write the script to `path`, creating its folder
    pub fn export_to(&self, path: &Path) -> Result<PathBuf, ExportError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.render())?;
        log::debug!("Wrote solver generator {}", path.display());
        Ok(path.to_path_buf())
    }
}
