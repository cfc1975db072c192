//! Monte Carlo measurement of observables for a fixed wavefunction.

use std::{
    fs,
    io::{ self, Write },
    path::Path,
    time::Instant,
};
use log::{ debug, info };
use rand::rngs::StdRng;
use crate::{
    comm::{ Communicator, MASTER_RANK },
    configuration::Configuration,
    params::MCMeasurementPara,
    sample::{ AcceptCounts, TPSSample },
    solver::{ EnergySolver, ObservablesLocal },
    stats,
    tps::SplitIndexTPS,
    vmc::{
        self,
        ExecutorStatus,
        VMCResult,
    },
};

/// A Monte Carlo estimate with its standard error.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Estimate {
    pub value: f64,
    pub error: f64,
}

/// Rank-averaged observables.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeasuredObservables {
    pub energy: Estimate,
    pub bond_energies: Vec<Estimate>,
    pub one_point_functions: Vec<Estimate>,
    pub two_point_functions: Vec<Estimate>,
}

impl MeasuredObservables {
    fn from_flat(estimates: &[Estimate], lens: [usize; 3]) -> Self {
        let (energy, rest) = estimates.split_first()
            .map(|(e, rest)| (*e, rest))
            .unwrap_or_default();
        let (bonds, rest) = rest.split_at(lens[0].min(rest.len()));
        let (one_point, rest) = rest.split_at(lens[1].min(rest.len()));
        let (two_point, _) = rest.split_at(lens[2].min(rest.len()));
        Self {
            energy,
            bond_energies: bonds.to_vec(),
            one_point_functions: one_point.to_vec(),
            two_point_functions: two_point.to_vec(),
        }
    }

    /// Write one file per observable under `dir`, one `value error` pair per
    /// line.
    pub fn dump<P>(&self, dir: P) -> io::Result<()>
    where P: AsRef<Path>
    {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let write = |name: &str, data: &[Estimate]| -> io::Result<()> {
            let mut out = io::BufWriter::new(fs::File::create(dir.join(name))?);
            data.iter().try_for_each(|e| writeln!(out, "{} {}", e.value, e.error))?;
            out.flush()
        };
        write("energy", std::slice::from_ref(&self.energy))?;
        write("bond_energys", &self.bond_energies)?;
        write("one_point_functions", &self.one_point_functions)?;
        write("two_point_functions", &self.two_point_functions)?;
        Ok(())
    }
}

/// Per-sample mean of every observable, flattened as energy, bond energies,
/// one-point, then two-point functions.
fn local_means(samples: &[ObservablesLocal]) -> (Vec<f64>, [usize; 3]) {
    let Some(first) = samples.first() else { return (Vec::new(), [0; 3]); };
    let lens = [
        first.bond_energies.len(),
        first.one_point_functions.len(),
        first.two_point_functions.len(),
    ];
    let mut sums = vec![0.0; 1 + lens.iter().sum::<usize>()];
    for obs in samples.iter() {
        let flat
            = std::iter::once(&obs.energy)
            .chain(obs.bond_energies.iter())
            .chain(obs.one_point_functions.iter())
            .chain(obs.two_point_functions.iter());
        sums.iter_mut().zip(flat).for_each(|(s, x)| { *s += x; });
    }
    let n = samples.len() as f64;
    sums.iter_mut().for_each(|s| { *s /= n; });
    (sums, lens)
}

/// Samples observables on one rank and averages them over all ranks.
pub struct MCMeasurementExecutor<S, C> {
    params: MCMeasurementPara,
    sitps: SplitIndexTPS,
    sample: TPSSample,
    solver: S,
    comm: C,
    rng: StdRng,
    status: ExecutorStatus,
    warmed_up: bool,
    samples: Vec<ObservablesLocal>,
    accepts: AcceptCounts,
    results: MeasuredObservables,
}

impl<S, C> MCMeasurementExecutor<S, C>
where
    S: EnergySolver,
    C: Communicator,
{
    /// Measure `sitps` starting from a fresh configuration.
    pub fn new(params: MCMeasurementPara, sitps: SplitIndexTPS, solver: S, comm: C)
        -> VMCResult<Self>
    {
        params.validate()?;
        let mut rng = vmc::rank_rng(params.mc.seed, comm.rank());
        let config
            = vmc::initial_configuration(&params.mc, sitps.rows(), sitps.cols(), &mut rng)?;
        Self::from_parts(params, sitps, config, false, solver, comm, rng)
    }

    /// Measure the wavefunction stored under `wavefunction_path`, resuming the
    /// stored configurations where possible.
    pub fn load(params: MCMeasurementPara, solver: S, comm: C) -> VMCResult<Self> {
        params.validate()?;
        let mut rng = vmc::rank_rng(params.mc.seed, comm.rank());
        let (sitps, config, loaded) = vmc::load_state(&params.mc, &comm, &mut rng)?;
        Self::from_parts(params, sitps, config, loaded, solver, comm, rng)
    }

    fn from_parts(
        params: MCMeasurementPara,
        sitps: SplitIndexTPS,
        config: Configuration,
        warmed_up: bool,
        solver: S,
        comm: C,
        rng: StdRng,
    ) -> VMCResult<Self>
    {
        vmc::check_compatibility(&params.mc, &sitps, &config)?;
        let sample = TPSSample::new(&sitps, config, params.mc.trunc_para)?;
        if comm.is_master() {
            info!("Monte Carlo measurement of PEPS");
            info!("system size (lx, ly): ({}, {})", sitps.cols(), sitps.rows());
            info!("sampling numbers: {} on {} ranks", params.mc.mc_samples, comm.size());
        }
        Ok(Self {
            samples: Vec::with_capacity(params.mc.mc_samples),
            params,
            sitps,
            sample,
            solver,
            comm,
            rng,
            status: ExecutorStatus::Inited,
            warmed_up,
            accepts: AcceptCounts::default(),
            results: MeasuredObservables::default(),
        })
    }

    pub fn status(&self) -> ExecutorStatus { self.status }

    pub fn sample(&self) -> &TPSSample { &self.sample }

    /// Accepted moves summed over every measurement sweep on this rank.
    pub fn accept_counts(&self) -> AcceptCounts { self.accepts }

    /// Observables of every sample taken on this rank.
    pub fn samples(&self) -> &[ObservablesLocal] { &self.samples }

    /// Rank-averaged results, available on every rank after
    /// [`execute`][Self::execute].
    pub fn results(&self) -> &MeasuredObservables { &self.results }

    /// Warm up, sample, reduce over ranks and dump.
    pub fn execute(&mut self) -> VMCResult<()> {
        self.status = ExecutorStatus::Exeing;
        self.warm_up()?;
        self.mc_measure()?;
        self.gather_statistics()?;
        self.dump_data()?;
        self.status = ExecutorStatus::Finish;
        Ok(())
    }

    pub fn warm_up(&mut self) -> VMCResult<()> {
        if self.warmed_up { return Ok(()); }
        let start = Instant::now();
        vmc::mc_sweeps(
            &mut self.sample,
            &self.sitps,
            &self.params.mc,
            self.params.mc.mc_warm_up_sweeps,
            &mut self.rng,
        )?;
        debug!(
            "rank {:4} warm-up completes T = {:.2}s",
            self.comm.rank(),
            start.elapsed().as_secs_f64(),
        );
        self.warmed_up = true;
        Ok(())
    }

    fn mc_measure(&mut self) -> VMCResult<()> {
        self.samples.clear();
        for _ in 0..self.params.mc.mc_samples {
            self.accepts += vmc::mc_sweeps(
                &mut self.sample,
                &self.sitps,
                &self.params.mc,
                self.params.mc.mc_sweeps_between_sample,
                &mut self.rng,
            )?;
            let obs = self.solver.sample_measure(&self.sitps, &mut self.sample)?;
            self.samples.push(obs);
        }
        Ok(())
    }

    /// Equal-weight mean over ranks of every rank's sample mean, with the
    /// standard error of that mean.
    fn gather_statistics(&mut self) -> VMCResult<()> {
        let (means, lens) = local_means(&self.samples);
        let k = means.len();
        let flat: Vec<f64>
            = match self.comm.gather_scalars(MASTER_RANK, means)? {
                Some(all) => {
                    let mut flat = Vec::with_capacity(2 * k);
                    let columns: Vec<Vec<f64>>
                        = (0..k)
                        .map(|j| all.iter().filter_map(|rank| rank.get(j).copied()).collect())
                        .collect();
                    flat.extend(columns.iter().map(|c| stats::mean(c)));
                    flat.extend(columns.iter().map(|c| stats::standard_error(c)));
                    flat
                },
                None => Vec::new(),
            };
        let flat = self.comm.broadcast_scalars(MASTER_RANK, flat)?;
        let (values, errors) = flat.split_at(flat.len() / 2);
        let estimates: Vec<Estimate>
            = values.iter().zip(errors)
            .map(|(value, error)| Estimate { value: *value, error: *error })
            .collect();
        self.results = MeasuredObservables::from_flat(&estimates, lens);
        if self.comm.is_master() {
            info!(
                "E0 = {:14.6} \u{00b1} {:10.2e}",
                self.results.energy.value,
                self.results.energy.error,
            );
        }
        Ok(())
    }

    /// Write the results under `output_path` (master) and this rank's
    /// configuration next to the wavefunction.
    pub fn dump_data(&self) -> VMCResult<()> {
        if self.comm.is_master() {
            self.results.dump(&self.params.output_path)?;
        }
        self.sample.config.dump(&self.params.mc.wavefunction_path, self.comm.rank())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use crate::{
        comm::SerialComm,
        params::{ MCParams, MCSweepScheme },
        solver::SpinOneHalfHeisenbergSquare,
        tensor::TruncatePara,
    };

    #[test]
    fn local_means_flatten_in_order() {
        let obs = |e: f64| ObservablesLocal {
            energy: e,
            bond_energies: vec![e, 2.0 * e],
            one_point_functions: vec![0.5],
            two_point_functions: vec![-e],
        };
        let (means, lens) = local_means(&[obs(1.0), obs(3.0)]);
        assert_eq!(lens, [2, 1, 1]);
        assert_eq!(means, vec![2.0, 2.0, 4.0, 0.5, -2.0]);
        let estimates: Vec<Estimate>
            = means.iter().map(|v| Estimate { value: *v, error: 0.0 }).collect();
        let unflat = MeasuredObservables::from_flat(&estimates, lens);
        assert_eq!(unflat.energy.value, 2.0);
        assert_eq!(unflat.bond_energies.len(), 2);
        assert_eq!(unflat.two_point_functions[0].value, -2.0);
    }

    #[test]
    fn measurement_dumps_every_observable() {
        let dir = tempfile::tempdir().unwrap();
        let params = MCMeasurementPara {
            mc: MCParams {
                trunc_para: TruncatePara::new(1, 16, 0.0),
                mc_samples: 10,
                mc_warm_up_sweeps: 2,
                mc_sweeps_between_sample: 1,
                mc_sweep_scheme: MCSweepScheme::SequentiallyNNSiteFlip,
                occupancy: vec![3, 3],
                init_config: None,
                wavefunction_path: dir.path().join("tps"),
                seed: Some(5),
            },
            output_path: dir.path().join("measure"),
        };
        let mut rng = StdRng::seed_from_u64(81);
        let sitps = SplitIndexTPS::random(2, 3, 2, 2, &mut rng).unwrap();
        let mut exe = MCMeasurementExecutor::new(
            params, sitps, SpinOneHalfHeisenbergSquare::new(), SerialComm::new(),
        ).unwrap();
        exe.execute().unwrap();
        assert_eq!(exe.status(), ExecutorStatus::Finish);
        assert_eq!(exe.samples().len(), 10);
        let results = exe.results();
        assert_eq!(results.bond_energies.len(), 7);
        assert_eq!(results.one_point_functions.len(), 6);
        assert_eq!(results.two_point_functions.len(), 3);
        assert_eq!(results.energy.error, 0.0);
        assert_relative_eq!(
            results.energy.value,
            results.bond_energies.iter().map(|e| e.value).sum::<f64>(),
            epsilon = 1e-10,
        );
        for name in ["energy", "bond_energys", "one_point_functions", "two_point_functions"] {
            assert!(dir.path().join("measure").join(name).exists());
        }
        let energy = fs::read_to_string(dir.path().join("measure/energy")).unwrap();
        assert_eq!(energy.split_whitespace().count(), 2);
    }
}
