//! Optimize a PEPS for the spin-1/2 XXZ model.
//!
//! Usage: `vmc_optimize <run file>`. The run file holds the optimization
//! parameters plus the driver options `ranks`, `jz`, `jxy` and, to start from
//! a random wavefunction instead of the stored one, `init`.

use std::path::{ Path, PathBuf };
use log::info;
use peps_net::{ params::ParamsError, VMCError, VMCOptimizePara, VMCPEPSExecutor };
use lib::{ exit_with, read_run_file, run_ranks, DriverOptions };

fn main() {
    env_logger::init();
    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        exit_with(ParamsError::Invalid("missing run file argument".to_string()).into());
    };
    if let Err(err) = run(&path) { exit_with(err); }
    info!("optimization finished");
}

fn run(path: &Path) -> Result<(), VMCError> {
    let text = read_run_file(path)?;
    let params = VMCOptimizePara::from_json(&text)?;
    let options = DriverOptions::from_json(&text)?;
    let initial = options.initial_wavefunction()?;
    let solver = options.solver();
    run_ranks(options.ranks, &solver, |solver, comm| {
        let mut executor
            = match initial.as_ref() {
                Some(sitps) => VMCPEPSExecutor::new(params.clone(), sitps.clone(), solver, comm)?,
                None => VMCPEPSExecutor::load(params.clone(), solver, comm)?,
            };
        executor.execute()
    })
}
