use std::{ fs, path::Path, thread };
use rand::{ SeedableRng, rngs::StdRng };
use serde::Deserialize;
use peps_net::{
    comm::ThreadComm,
    params::ParamsError,
    EnergySolver,
    SpinOneHalfXXZSquare,
    SplitIndexTPS,
    VMCError,
    VMCResult,
};

/// Shape of a freshly generated wavefunction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LatticeInit {
    pub rows: usize,
    pub cols: usize,
    #[serde(default = "default_phys_dim")]
    pub phys_dim: usize,
    pub bond_dim: usize,
}

fn default_phys_dim() -> usize { 2 }

fn default_ranks() -> usize { 1 }

fn default_coupling() -> f64 { 1.0 }

/// Driver-level options read from the same run file as the library
/// parameters.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DriverOptions {
    /// Number of ranks, each run on its own thread.
    #[serde(default = "default_ranks")]
    pub ranks: usize,
    #[serde(default = "default_coupling")]
    pub jz: f64,
    #[serde(default = "default_coupling")]
    pub jxy: f64,
    /// Start from a random wavefunction of this shape instead of loading one.
    #[serde(default)]
    pub init: Option<LatticeInit>,
    /// Seed for the random starting wavefunction.
    #[serde(default)]
    pub init_seed: Option<u64>,
}

impl DriverOptions {
    pub fn from_json(text: &str) -> Result<Self, ParamsError> {
        let options: Self = serde_json::from_str(text)?;
        if options.ranks == 0 {
            return Err(ParamsError::Invalid("ranks must be positive".to_string()));
        }
        Ok(options)
    }

    /// XXZ solver with the configured couplings.
    pub fn solver(&self) -> SpinOneHalfXXZSquare {
        SpinOneHalfXXZSquare::new(self.jz, self.jxy)
    }

    /// Random starting wavefunction, if one was requested.
    pub fn initial_wavefunction(&self) -> VMCResult<Option<SplitIndexTPS>> {
        let Some(init) = self.init else { return Ok(None); };
        let mut rng = match self.init_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sitps = SplitIndexTPS::random(
            init.rows, init.cols, init.phys_dim, init.bond_dim, &mut rng)?;
        Ok(Some(sitps))
    }
}

/// Read a run file.
pub fn read_run_file<P>(path: P) -> Result<String, ParamsError>
where P: AsRef<Path>
{
    Ok(fs::read_to_string(path)?)
}

/// Run `job` once per rank on scoped threads connected by a [`ThreadComm`]
/// group, returning the first failure.
pub fn run_ranks<S, F>(ranks: usize, solver: &S, job: F) -> VMCResult<()>
where
    S: EnergySolver + Clone + Send + Sync,
    F: Fn(S, ThreadComm) -> VMCResult<()> + Sync,
{
    let results: Vec<VMCResult<()>>
        = thread::scope(|s| {
            let handles: Vec<_>
                = ThreadComm::group(ranks).into_iter()
                .map(|comm| {
                    let job = &job;
                    s.spawn(move || job(solver.clone(), comm))
                })
                .collect();
            handles.into_iter()
                .map(|h| h.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
                .collect()
        });
    results.into_iter().collect::<VMCResult<Vec<()>>>()?;
    Ok(())
}

/// Log a fatal error and exit with its code.
pub fn exit_with(err: VMCError) -> ! {
    log::error!("{err}");
    std::process::exit(err.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_options_default_to_one_heisenberg_rank() {
        let options = DriverOptions::from_json(r#"{ "mc_samples": 10 }"#).unwrap();
        assert_eq!(options.ranks, 1);
        assert_eq!(options.solver(), SpinOneHalfXXZSquare::new(1.0, 1.0));
        assert!(options.initial_wavefunction().unwrap().is_none());
    }

    #[test]
    fn zero_ranks_is_invalid() {
        let err = DriverOptions::from_json(r#"{ "ranks": 0 }"#).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn seeded_initial_wavefunction_is_reproducible() {
        let text = r#"{
            "init": { "rows": 2, "cols": 3, "bond_dim": 2 },
            "init_seed": 17
        }"#;
        let options = DriverOptions::from_json(text).unwrap();
        let a = options.initial_wavefunction().unwrap().unwrap();
        let b = options.initial_wavefunction().unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!((a.rows(), a.cols()), (2, 3));
    }

    #[test]
    fn first_rank_failure_is_reported() {
        let solver = SpinOneHalfXXZSquare::new(1.0, 1.0);
        let result = run_ranks(2, &solver, |_, comm| {
            use peps_net::Communicator;
            if comm.is_master() {
                Err(ParamsError::Invalid("boom".to_string()).into())
            } else {
                Ok(())
            }
        });
        assert_eq!(result.unwrap_err().exit_code(), 4);
    }
}
