//! Tests for the top-level export: refused features, written artifacts and
//! the generator configuration derived from the problem

use pretty_assertions::assert_eq;
use rti_codegen::{export_solver, iteration_cap, HEADER_NAME, SOURCE_NAME, GENERATOR_SCRIPT_NAME};
use rti_common::{load_config, save_config, BoxBound, Dimensions, HessianApproximation, PrintLevel, ProblemConfig};
use rti_ir::StorageClass;

fn config() -> ProblemConfig {
    ProblemConfig::new(Dimensions::new(2, 1, 1, 1, 4), 2)
}

#[test]
fn test_exact_hessian_is_not_implemented() {
    let mut config = config();
    config.options.hessian_approximation = HessianApproximation::ExactHessian;
    let err = export_solver(&config).unwrap_err();
    assert!(err.is_not_implemented());
    assert!(err.to_string().contains("EXACT_HESSIAN"));
}

#[test]
fn test_box_constraints_are_not_implemented() {
    let mut config = config();
    config.state_bounds.push(BoxBound {
        component: 0,
        lower: Some(-5.0),
        upper: Some(5.0),
    });
    assert!(export_solver(&config).unwrap_err().is_not_implemented());
}

#[test]
fn test_block_size_checked_at_generation() {
    let mut config = config();
    config.block_size = 5;
    let err = export_solver(&config).unwrap_err();
    assert!(err.is_invalid_configuration());
    assert_eq!(
        err.to_string(),
        "Invalid configuration: block size 5 exceeds horizon length 4"
    );
}

#[test]
fn test_iteration_cap_follows_qp_size() {
    // NX=2, NU=1, N=4, B=2: 2*2 + 4*1 + 2 QP variables
    let mut config = config();
    config.options.max_num_qp_iterations = 0;
    let solver = export_solver(&config).unwrap();
    assert_eq!(solver.partition.num_qp_variables(), 10);
    assert_eq!(solver.generator.max_iterations, 30);
    assert_eq!(iteration_cap(0, 10), 30);

    config.options.max_num_qp_iterations = 12;
    config.options.print_level = PrintLevel::High;
    let solver = export_solver(&config).unwrap();
    assert_eq!(solver.generator.max_iterations, 12);
    assert_eq!(solver.generator.print_level, 2);
}

#[test]
fn test_generated_source_layout() {
    let mut config = config();
    config.block_size = 3;
    let solver = export_solver(&config).unwrap();
    let source = &solver.source;

    for name in [
        "void expansionStep(",
        "void expand( int blockI )",
        "void expandLast( int blockI )",
        "void condensePrep( int blockI )",
        "void condensePrepLast( int blockI )",
        "int preparationStep( void )",
        "int feedbackStep( void )",
        "real_t getKKT( void )",
    ] {
        assert!(source.contains(name), "missing {}", name);
    }
    assert!(source.contains("int modelSimulation( void );"));
    assert!(source.contains("void evaluateObjective( void );"));
    assert!(source.contains("expandLast( 1 );"));
    assert!(source.contains("rtiVariables.x[8] += rtiForces_output.zN[0];"));
    assert!(!source.contains("regularizeHessian"));

    assert!(solver.header.contains("extern forces_output rtiForces_output;"));
    assert!(solver.header.contains("not a KKT residual"));
}

/// Names passed to `newParam('...'` or `newOutput('...'` in the build script
fn script_fields<'a>(script: &'a str, call: &str) -> Vec<&'a str> {
    let pattern = format!("{}('", call);
    script
        .match_indices(&pattern)
        .filter_map(|(at, _)| {
            let rest = &script[at + pattern.len()..];
            rest.find('\'').map(|end| &rest[..end])
        })
        .collect()
}

#[test]
fn test_build_script_declares_the_fields_the_source_uses() {
    // Short last block, fixed initial state and warm start
    let mut config = ProblemConfig::new(Dimensions::new(2, 1, 1, 1, 5), 2);
    config.options.hotstart_qp = true;
    let solver = export_solver(&config).unwrap();
    let script = solver.generator.render();

    let params = script_fields(&script, "newParam");
    let outputs = script_fields(&script, "newOutput");
    assert_eq!(
        params,
        vec!["H", "f", "C", "d", "c0", "HN", "fN", "z_init", "zLast_init", "zN_init"]
    );
    assert_eq!(outputs, vec!["z", "zLast", "zN"]);

    for (storage, names) in [(StorageClass::QpParams, &params), (StorageClass::QpOutput, &outputs)] {
        for name in names.iter() {
            assert!(
                solver.header.contains(&format!("forces_FLOAT {}[ ", name)),
                "{} missing from the header",
                name
            );
            assert!(solver.module.find_variable(storage, name).is_some(), "{} not declared", name);
        }
        let declared = solver.module.variables.iter().filter(|v| v.storage == storage).count();
        assert_eq!(declared, names.len());
    }
    // Every field the source writes is one of them
    for name in ["H", "f", "C", "d", "c0", "HN", "fN", "z_init", "zLast_init", "zN_init"] {
        assert!(solver.source.contains(&format!("rtiForces_params.{}[", name)), "{}", name);
    }
    assert!(solver.source.contains("rtiForces_output.zLast[0]"));
}

#[test]
fn test_header_is_self_contained() {
    let solver = export_solver(&config()).unwrap();
    let header = &solver.header;

    // Comments never nest: each one closes before the next opens
    let mut rest = header.as_str();
    while let Some(open) = rest.find("/*") {
        let body = &rest[open + 2..];
        let close = body.find("*/").expect("unterminated comment");
        assert!(!body[..close].contains("/*"), "nested comment: {}", &body[..close]);
        rest = &body[close + 2..];
    }

    // User code fills the solver buffers through the header alone
    assert!(header.contains("typedef struct RtiVariables_"));
    assert!(header.contains("extern RtiVariables rtiVariables;"));
    assert!(header.contains("typedef struct RtiWorkspace_"));
    assert!(header.contains("extern RtiWorkspace rtiWorkspace;"));
    assert!(header.contains("\treal_t evGx[ 16 ];"));
    assert!(header.contains(" *   int it;"));
    assert!(!solver.source.contains("typedef struct"));
}

#[test]
fn test_write_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let solver = export_solver(&config()).unwrap();
    let written = solver.write(dir.path()).unwrap();
    assert_eq!(
        written,
        vec![
            dir.path().join(SOURCE_NAME),
            dir.path().join(HEADER_NAME),
            dir.path().join(GENERATOR_SCRIPT_NAME),
        ]
    );
    assert_eq!(std::fs::read_to_string(&written[0]).unwrap(), solver.source);
    assert_eq!(std::fs::read_to_string(&written[1]).unwrap(), solver.header);
    assert!(std::fs::read_to_string(&written[2])
        .unwrap()
        .contains("codeoptions = getOptions('forces');"));
}

#[test]
fn test_config_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("problem.json");
    let mut config = config();
    config.options.cg_use_openmp = true;
    config.linear_state_term = Some(vec![0.5, 0.0]);
    save_config(&config, &path).unwrap();
    let loaded = load_config(&path).unwrap();
    assert_eq!(loaded, config);

    // The given linear term is inlined; its zero entry disappears
    let solver = export_solver(&loaded).unwrap();
    assert!(solver.source.contains("rtiForces_params.fN[0] = rtiWorkspace.QN2[0]*rtiWorkspace.DyN + +5.0000000000000000e-1;"));
    assert!(solver.source.contains("rtiForces_params.fN[1] = rtiWorkspace.QN2[1]*rtiWorkspace.DyN;"));
}

#[test]
fn test_demo_configuration_exports() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/crane.json");
    let config = load_config(&path).unwrap();
    assert_eq!(config.options.print_level, PrintLevel::Low);
    let solver = export_solver(&config).unwrap();
    // 10 stages in blocks of 3: three full blocks and a one-stage tail
    assert_eq!(solver.partition.number_of_blocks(), 4);
    assert_eq!(solver.partition.last_block_len(), 1);
    assert!(solver.module.get_function("expandLast").is_some());
    assert!(solver.generator.warm_start);
}
