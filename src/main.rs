use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{debug, info, LevelFilter};
use std::path::PathBuf;
use std::time::Instant;
use trajectory_common::{AnalysisConfig, RgMode};

mod dump;
mod grid;
mod gyration;
mod msd;
mod msd_curves;
mod propensity;
mod table;
mod thermo;

/// Post-processing of 2D LAMMPS glass simulations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the analysis config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Per-particle MSD from dump frames, particle table and propensity grid
    Propensity,
    /// Rebuild the propensity grid from an existing particle table
    Bin {
        /// Particle table to read (defaults to propensity.output.particle_table)
        #[arg(long)]
        table: Option<PathBuf>,
    },
    /// Merge whole-system MSD(t) curves of several temperatures
    MsdCurves,
    /// Average radius of gyration series over runs and shear directions
    RgAverage {
        /// Output mode: squared, linear or semi-log (overrides gyration.mode)
        #[arg(long)]
        mode: Option<RgMode>,
    },
    /// Average one thermo column of LAMMPS logs per temperature
    ThermoAverage,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize the logger (Info unless RUST_LOG says otherwise)
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("Starting trajectory analysis...");
    info!("Using {} Rayon threads.", rayon::current_num_threads());

    // --- Load Configuration ---
    let config = AnalysisConfig::load(&args.config)?;
    debug!("Configuration: {:#?}", config);

    // --- Run the selected analysis ---
    let start_time = Instant::now();
    match args.command {
        Command::Propensity => {
            let map = propensity::run_propensity(config.propensity()?)?;
            info!(
                "{}x{} propensity grid built from {} intervals.",
                map.grid.resolution, map.grid.resolution, map.intervals
            );
        }
        Command::Bin { table } => {
            propensity::run_binning(config.propensity()?, table.as_deref())?;
        }
        Command::MsdCurves => {
            msd_curves::run_msd_curves(config.msd_curves()?)?;
        }
        Command::RgAverage { mode } => {
            // Command line mode wins over the config file
            let gyration = config.gyration()?;
            gyration::run_gyration(gyration, mode.unwrap_or(gyration.mode))?;
        }
        Command::ThermoAverage => {
            thermo::run_thermo(config.thermo()?)?;
        }
    }

    info!("Analysis finished in {:.3} seconds.", start_time.elapsed().as_secs_f64());
    Ok(())
}
