//! Measure energy, bond energies and spin correlations of a stored PEPS.
//!
//! Usage: `vmc_measure <run file>`.

use std::path::{ Path, PathBuf };
use log::info;
use peps_net::{ params::ParamsError, MCMeasurementExecutor, MCMeasurementPara, VMCError };
use lib::{ exit_with, read_run_file, run_ranks, DriverOptions };

fn main() {
    env_logger::init();
    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        exit_with(ParamsError::Invalid("missing run file argument".to_string()).into());
    };
    if let Err(err) = run(&path) { exit_with(err); }
    info!("measurement finished");
}

fn run(path: &Path) -> Result<(), VMCError> {
    let text = read_run_file(path)?;
    let params = MCMeasurementPara::from_json(&text)?;
    let options = DriverOptions::from_json(&text)?;
    let initial = options.initial_wavefunction()?;
    let solver = options.solver();
    run_ranks(options.ranks, &solver, |solver, comm| {
        let mut executor
            = match initial.as_ref() {
                Some(sitps) => MCMeasurementExecutor::new(params.clone(), sitps.clone(), solver, comm)?,
                None => MCMeasurementExecutor::load(params.clone(), solver, comm)?,
            };
        executor.execute()
    })
}
