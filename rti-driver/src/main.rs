//! Block-condensing RTI generator driver
//!
//! Reads a JSON problem description and writes the generated RTI solver:
//! the C source, the QP interface header and the solver build script.

use clap::{Parser, Subcommand};
use rti_codegen::{export_solver, BlockPartition};
use rti_common::load_config;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rtigen")]
#[command(about = "Block-condensing RTI code generator")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the RTI solver for a problem description
    Export {
        /// Problem configuration (JSON)
        config: PathBuf,

        /// Output directory; defaults to CG_EXPORT_FOLDER_NAME
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the IR to stdout before rendering
        #[arg(long)]
        print_ir: bool,

        /// Save the IR as JSON to this file
        #[arg(long)]
        ir_output: Option<PathBuf>,
    },

    /// Show how the horizon is split into blocks
    Partition {
        /// Problem configuration (JSON)
        config: PathBuf,

        /// Print the partition as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            config,
            output,
            print_ir,
            ir_output,
        } => {
            if let Err(e) = export_command(&config, output.as_deref(), print_ir, ir_output.as_deref()) {
                eprintln!("Error exporting solver: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Partition { config, json } => {
            if let Err(e) = partition_command(&config, json) {
                eprintln!("Error reading partition: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn export_command(
    config_path: &Path,
    output_dir: Option<&Path>,
    print_ir: bool,
    ir_output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let solver = export_solver(&config)?;

    if print_ir {
        println!("{}", solver.module);
    }

    if let Some(path) = ir_output {
        fs::write(path, rti_ir::module_to_json(&solver.module)?)?;
        println!("IR written to: {}", path.display());
    }

    let dir = output_dir.unwrap_or(config.options.cg_export_folder_name.as_path());
    for path in solver.write(dir)? {
        println!("Wrote {}", path.display());
    }
    println!(
        "{} blocks over N = {}, {} QP variables",
        solver.partition.number_of_blocks(),
        config.dims.n,
        solver.partition.num_qp_variables()
    );
    Ok(())
}

fn partition_command(config_path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let partition = BlockPartition::new(&config.dims, config.block_size)?;
    if json {
        let blocks: Vec<_> = partition.blocks().collect();
        println!("{}", serde_json::to_string_pretty(&blocks)?);
    } else {
        print!("{}", partition);
    }
    log::debug!("Partition of {} shown", config_path.display());
    Ok(())
}
