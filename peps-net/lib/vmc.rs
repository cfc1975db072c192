//! Variational Monte Carlo optimization of a [`SplitIndexTPS`].
//!
//! Every rank runs an independent Markov chain over configurations. One
//! optimization iteration samples `mc_samples` configurations per rank,
//! estimating the local energy and the log-derivatives `O` at each, and then
//! reduces over ranks to the energy `E` and the gradient
//!
//! ```text
//! g = <E_loc O> - E <O>
//! ```
//!
//! on the master. The master updates the wavefunction, normalizes every site
//! and broadcasts the result back to all ranks.

use std::{
    fs,
    io::{ self, Write },
    path::Path,
    time::Instant,
};
use log::{ debug, info, warn };
use rand::{ Rng, SeedableRng, rngs::StdRng };
use thiserror::Error;
use crate::{
    comm::{ CommError, Communicator },
    configuration::{ Configuration, ConfigurationError },
    lattice::{ nn_bond_count, SiteIdx },
    params::{ MCParams, MCSweepScheme, ParamsError, VMCOptimizePara, WavefunctionUpdateScheme },
    sample::{ AcceptCounts, TPSSample },
    solver::EnergySolver,
    sr::{ self, LogDerivSample, SRSMatrix },
    stats,
    tn2d::TNError,
    tps::{ SplitIndexTPS, TPSError },
};

/// Per-rank seed offset.
const RANK_SEED_STRIDE: u64 = 10086;

/// Basis size of a compressed Kagome site: three packed bond bits.
const KAGOME_PHYS_DIM: usize = 8;

#[derive(Debug, Error)]
pub enum VMCError {
    #[error("{0}")]
    Params(#[from] ParamsError),

    /// Returned when the stored wavefunction can't be read.
    #[error("failed to load wavefunction: {0}")]
    WavefunctionLoad(TPSError),

    #[error("wavefunction error: {0}")]
    Wavefunction(#[from] TPSError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Returned when a configuration selects a basis value the wavefunction
    /// doesn't have.
    #[error("configuration holds basis {1} at {0:?}, but the site has only {2}")]
    BasisOutOfRange(SiteIdx, usize, usize),

    /// Returned when the sweep scheme can't act on the wavefunction's sites.
    #[error("sweep scheme {0} needs {1} basis states at every site")]
    PhysDimMismatch(MCSweepScheme, usize),

    #[error("tensor network error: {0}")]
    Network(#[from] TNError),

    #[error("communication error: {0}")]
    Comm(#[from] CommError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
use VMCError::*;
pub type VMCResult<T> = Result<T, VMCError>;

impl VMCError {
    /// Process exit code for a run that fails with this error: 1 and 2 for an
    /// unsupported sweep or update scheme, 3 for an unreadable wavefunction, 4
    /// for other invalid inputs and 5 for failures during the run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Params(err) => err.exit_code(),
            WavefunctionLoad(_) => 3,
            PhysDimMismatch(..) => 1,
            Configuration(_) | BasisOutOfRange(..) => 4,
            Wavefunction(_) | Network(_) | Comm(_) | Io(_) => 5,
        }
    }
}

/// Lifecycle of an executor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExecutorStatus {
    Inited,
    Exeing,
    Finish,
}

/// Seed a rank's generator from the configured base seed, or from OS entropy.
pub(crate) fn rank_rng(seed: Option<u64>, rank: usize) -> StdRng {
    let base = seed.unwrap_or_else(rand::random);
    StdRng::seed_from_u64(base.wrapping_add(RANK_SEED_STRIDE.wrapping_mul(rank as u64)))
}

/// Starting configuration: the preset one if given, else a random one with
/// the configured occupancy.
pub(crate) fn initial_configuration<R>(mc: &MCParams, rows: usize, cols: usize, rng: &mut R)
    -> VMCResult<Configuration>
where R: Rng + ?Sized
{
    match &mc.init_config {
        Some(preset) => {
            let config = Configuration::from_rows(preset.clone())?;
            if config.rows() != rows || config.cols() != cols {
                return Err(ConfigurationError::ShapeMismatch(
                    config.rows(), config.cols(), rows, cols).into());
            }
            Ok(config)
        },
        None => Ok(Configuration::random(rows, cols, &mc.occupancy, rng)?),
    }
}

/// Read the wavefunction and this rank's configuration from the wavefunction
/// directory. A missing or unreadable configuration falls back to
/// [`initial_configuration`]; the returned flag tells whether the stored one
/// was used.
pub(crate) fn load_state<C, R>(mc: &MCParams, comm: &C, rng: &mut R)
    -> VMCResult<(SplitIndexTPS, Configuration, bool)>
where
    C: Communicator,
    R: Rng + ?Sized,
{
    let sitps = SplitIndexTPS::load(&mc.wavefunction_path).map_err(WavefunctionLoad)?;
    let (rows, cols) = (sitps.rows(), sitps.cols());
    match Configuration::load(&mc.wavefunction_path, comm.rank(), rows, cols) {
        Ok(config) => Ok((sitps, config, true)),
        Err(err) => {
            warn!(
                "rank {}: loading configuration failed ({err}); using the preset \
                configuration and a random warm-up",
                comm.rank(),
            );
            let config = initial_configuration(mc, rows, cols, rng)?;
            Ok((sitps, config, false))
        },
    }
}

/// Check that `config` and the sweep scheme fit the wavefunction.
pub(crate) fn check_compatibility(
    mc: &MCParams,
    sitps: &SplitIndexTPS,
    config: &Configuration,
) -> VMCResult<()>
{
    if config.rows() != sitps.rows() || config.cols() != sitps.cols() {
        return Err(ConfigurationError::ShapeMismatch(
            config.rows(), config.cols(), sitps.rows(), sitps.cols()).into());
    }
    if let Some((site, basis))
        = config.indexed_iter().find(|(site, b)| **b >= sitps.phys_dim(*site))
    {
        return Err(BasisOutOfRange(site, *basis, sitps.phys_dim(site)));
    }
    if mc.mc_sweep_scheme == MCSweepScheme::CompressedLatticeKagomeLocalUpdate
        && sitps.sites().any(|site| sitps.phys_dim(site) != KAGOME_PHYS_DIM)
    {
        return Err(PhysDimMismatch(mc.mc_sweep_scheme, KAGOME_PHYS_DIM));
    }
    Ok(())
}

/// Run `n` sweeps of the configured scheme, summing the accepted moves.
pub(crate) fn mc_sweeps<R>(
    sample: &mut TPSSample,
    sitps: &SplitIndexTPS,
    mc: &MCParams,
    n: usize,
    rng: &mut R,
) -> Result<AcceptCounts, TNError>
where R: Rng + ?Sized
{
    let mut counts = AcceptCounts::default();
    for _ in 0..n {
        counts += match mc.mc_sweep_scheme {
            MCSweepScheme::SequentiallyNNSiteFlip
                => sample.mc_sequentially_nn_flip_sweep(sitps, &mc.trunc_para, rng)?,
            MCSweepScheme::CompressedLatticeKagomeLocalUpdate
                => sample.mc_compressed_kagome_lattice_local_update_sweep(
                    sitps, &mc.trunc_para, rng)?,
        };
    }
    Ok(counts)
}

/// Write one value per line.
pub(crate) fn dump_vec<P>(path: P, data: &[f64]) -> io::Result<()>
where P: AsRef<Path>
{
    let mut out = io::BufWriter::new(fs::File::create(path)?);
    data.iter().try_for_each(|x| writeln!(out, "{x}"))?;
    out.flush()
}

/// Single-site moves attempted by one Kagome sweep: every site once per
/// orientation.
fn kagome_site_moves(rows: usize, cols: usize) -> usize { 2 * rows * cols }

/// Drives the optimization on one rank.
pub struct VMCPEPSExecutor<S, C> {
    params: VMCOptimizePara,
    sitps: SplitIndexTPS,
    sample: TPSSample,
    solver: S,
    comm: C,
    rng: StdRng,
    status: ExecutorStatus,
    warmed_up: bool,
    energy_samples: Vec<f64>,
    gten_sum: SplitIndexTPS,
    g_times_energy_sum: SplitIndexTPS,
    gten_samples: Vec<LogDerivSample>,
    energy_trajectory: Vec<f64>,
    energy_error_trajectory: Vec<f64>,
    grad_norms: Vec<f64>,
}

impl<S, C> VMCPEPSExecutor<S, C>
where
    S: EnergySolver,
    C: Communicator,
{
    /// Start from `sitps` and a fresh configuration. Every rank must pass the
    /// same wavefunction.
    pub fn new(params: VMCOptimizePara, sitps: SplitIndexTPS, solver: S, comm: C)
        -> VMCResult<Self>
    {
        params.validate()?;
        let mut rng = rank_rng(params.mc.seed, comm.rank());
        let config = initial_configuration(&params.mc, sitps.rows(), sitps.cols(), &mut rng)?;
        Self::from_parts(params, sitps, config, false, solver, comm, rng)
    }

    /// Start from the wavefunction and configurations stored under
    /// `wavefunction_path`. Ranks whose configuration can't be read start over
    /// from a fresh one and warm up again.
    pub fn load(params: VMCOptimizePara, solver: S, comm: C) -> VMCResult<Self> {
        params.validate()?;
        let mut rng = rank_rng(params.mc.seed, comm.rank());
        let (sitps, config, loaded) = load_state(&params.mc, &comm, &mut rng)?;
        Self::from_parts(params, sitps, config, loaded, solver, comm, rng)
    }

    fn from_parts(
        params: VMCOptimizePara,
        sitps: SplitIndexTPS,
        config: Configuration,
        warmed_up: bool,
        solver: S,
        comm: C,
        rng: StdRng,
    ) -> VMCResult<Self>
    {
        check_compatibility(&params.mc, &sitps, &config)?;
        let sample = TPSSample::new(&sitps, config, params.mc.trunc_para)?;
        let gten_sum = sitps.zeros_like();
        let g_times_energy_sum = sitps.zeros_like();
        let iterations = params.step_lens.len();
        let new = Self {
            energy_samples: Vec::with_capacity(params.mc.mc_samples),
            gten_samples: Vec::new(),
            energy_trajectory: Vec::with_capacity(iterations),
            energy_error_trajectory: Vec::with_capacity(iterations),
            grad_norms: Vec::with_capacity(iterations),
            params,
            sitps,
            sample,
            solver,
            comm,
            rng,
            status: ExecutorStatus::Inited,
            warmed_up,
            gten_sum,
            g_times_energy_sum,
        };
        new.print_info();
        Ok(new)
    }

    fn print_info(&self) {
        if !self.comm.is_master() { return; }
        let mc = &self.params.mc;
        info!("variational Monte Carlo optimization of PEPS");
        info!("system size (lx, ly): ({}, {})", self.sitps.cols(), self.sitps.rows());
        info!("PEPS bond dimension: {}", self.sitps.max_bond_dim());
        info!("BMPS bond dimension: {}/{}", mc.trunc_para.d_min, mc.trunc_para.d_max);
        info!("sampling numbers: {}", mc.mc_samples);
        info!("gradient update times: {}", self.params.step_lens.len());
        info!("update scheme: {}", self.params.update_scheme);
        info!("sweep scheme: {}", mc.mc_sweep_scheme);
        info!("number of ranks (including master): {}", self.comm.size());
    }

    pub fn status(&self) -> ExecutorStatus { self.status }

    pub fn params(&self) -> &VMCOptimizePara { &self.params }

    pub fn sitps(&self) -> &SplitIndexTPS { &self.sitps }

    pub fn sample(&self) -> &TPSSample { &self.sample }

    pub fn comm(&self) -> &C { &self.comm }

    /// Local energies sampled by this rank in the last iteration.
    pub fn energy_samples(&self) -> &[f64] { &self.energy_samples }

    /// Grand-mean energy of every iteration, identical on all ranks.
    pub fn energy_trajectory(&self) -> &[f64] { &self.energy_trajectory }

    pub fn energy_error_trajectory(&self) -> &[f64] { &self.energy_error_trajectory }

    /// Gradient norm of every iteration; empty except on the master.
    pub fn grad_norms(&self) -> &[f64] { &self.grad_norms }

    /// Warm up, optimize, then dump everything.
    pub fn execute(&mut self) -> VMCResult<()> {
        self.status = ExecutorStatus::Exeing;
        self.warm_up()?;
        self.optimize()?;
        self.dump_data()?;
        self.status = ExecutorStatus::Finish;
        Ok(())
    }

    /// Run the warm-up sweeps unless the chain is already equilibrated.
    pub fn warm_up(&mut self) -> VMCResult<()> {
        if self.warmed_up { return Ok(()); }
        let start = Instant::now();
        mc_sweeps(
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

    /// One optimization iteration per configured step length.
    pub fn optimize(&mut self) -> VMCResult<()> {
        let (rows, cols) = (self.sitps.rows(), self.sitps.cols());
        let sweeps_per_sample = self.params.mc.mc_sweeps_between_sample;
        let attempts = (self.params.mc.mc_samples * sweeps_per_sample) as f64;
        let bond_moves = nn_bond_count(rows, cols) as f64 * attempts;
        let site_moves = kagome_site_moves(rows, cols) as f64 * attempts;
        let step_lens = self.params.step_lens.clone();
        for (iter, step) in step_lens.into_iter().enumerate() {
            let start = Instant::now();
            self.clear_samples();
            let mut counts = AcceptCounts::default();
            for _ in 0..self.params.mc.mc_samples {
                counts += mc_sweeps(
                    &mut self.sample,
                    &self.sitps,
                    &self.params.mc,
                    sweeps_per_sample,
                    &mut self.rng,
                )?;
                self.sample_energy_and_holes()?;
            }
            let (mut grad, gten_ave) = self.gather_statistics()?;

            let update_start = Instant::now();
            let mut step_len = step;
            let mut sr_info: Option<(usize, f64)> = None;
            match self.params.update_scheme {
                WavefunctionUpdateScheme::StochasticGradient => {
                    self.update_tps(grad.as_ref(), step_len)?;
                },
                WavefunctionUpdateScheme::RandomStepStochasticGradient => {
                    if self.comm.is_master() { step_len *= self.rng.gen::<f64>(); }
                    self.update_tps(grad.as_ref(), step_len)?;
                },
                WavefunctionUpdateScheme::BoundGradientElement => {
                    if let Some(g) = grad.as_mut() { g.bound_elements(step_len); }
                    self.update_tps(grad.as_ref(), step_len)?;
                },
                WavefunctionUpdateScheme::StochasticReconfiguration => {
                    let solved = self.natural_gradient(grad.as_ref(), gten_ave.as_ref())?;
                    let natural_grad = solved.map(|(x, iters)| {
                        sr_info = Some((iters, x.norm()));
                        x
                    });
                    self.update_tps(natural_grad.as_ref(), step_len)?;
                },
            }
            let update_time = update_start.elapsed().as_secs_f64();

            if self.comm.is_master() {
                let mut rates = format!("{:5.2}", counts.bonds() as f64 / bond_moves);
                if self.params.mc.mc_sweep_scheme == MCSweepScheme::CompressedLatticeKagomeLocalUpdate {
                    rates += &format!(" {:5.2}", counts.site as f64 / site_moves);
                }
                let sr_text
                    = sr_info.map(|(iters, norm)| {
                        format!("  SRSolver iter = {iters:4}  NGrad norm = {norm:9.1e}")
                    })
                    .unwrap_or_default();
                info!(
                    "iter {iter:4}  alpha = {step_len:9.1e}  E0 = {:14.6} \u{00b1} {:10.2e}  \
                    grad norm = {:9.1e}  accept rate = {rates}{sr_text}  \
                    TPS update T = {update_time:6.2}s  tot T = {:8.2}s",
                    self.energy_trajectory.last().copied().unwrap_or(f64::NAN),
                    self.energy_error_trajectory.last().copied().unwrap_or(f64::NAN),
                    self.grad_norms.last().copied().unwrap_or(f64::NAN),
                    start.elapsed().as_secs_f64(),
                );
            }
        }
        Ok(())
    }

    fn clear_samples(&mut self) {
        self.energy_samples.clear();
        self.gten_sum = self.sitps.zeros_like();
        self.g_times_energy_sum = self.sitps.zeros_like();
        self.gten_samples.clear();
    }

    /// Estimate the local energy and log-derivatives of the current
    /// configuration and add them to the running sums.
    fn sample_energy_and_holes(&mut self) -> VMCResult<()> {
        let (energy, holes) = self.solver.cal_energy_and_holes(&self.sitps, &mut self.sample)?;
        self.energy_samples.push(energy);
        for (site, o) in holes.indexed_iter() {
            let basis = self.sample.config[site];
            self.gten_sum[site][basis].scaled_add(1.0, o);
            self.g_times_energy_sum[site][basis].scaled_add(energy, o);
        }
        if self.params.update_scheme == WavefunctionUpdateScheme::StochasticReconfiguration {
            self.gten_samples.push(LogDerivSample::new(&self.sample.config, holes));
        }
        Ok(())
    }

    /// Record the energy statistics of the iteration and reduce the gradient,
    /// and for SR the mean log-derivative, onto the master.
    #[allow(clippy::type_complexity)]
    fn gather_statistics(&mut self)
        -> VMCResult<(Option<SplitIndexTPS>, Option<SplitIndexTPS>)>
    {
        let local_mean = stats::mean(&self.energy_samples);
        let (energy, err) = stats::gather_energy_statistics(&self.comm, local_mean)?;
        self.energy_trajectory.push(energy);
        self.energy_error_trajectory.push(err);

        let inv_n = 1.0 / self.params.mc.mc_samples as f64;
        let mut gten_ave = std::mem::replace(&mut self.gten_sum, self.sitps.zeros_like());
        gten_ave.scale(inv_n);
        let mut grad = std::mem::replace(&mut self.g_times_energy_sum, self.sitps.zeros_like());
        grad.scale(inv_n);
        grad.axpy(-energy, &gten_ave);
        let grad = stats::mean_sitps(&self.comm, grad)?;
        let gten_ave
            = if self.params.update_scheme == WavefunctionUpdateScheme::StochasticReconfiguration {
                stats::mean_sitps(&self.comm, gten_ave)?
            } else {
                None
            };
        if let Some(g) = grad.as_ref() { self.grad_norms.push(g.norm()); }
        Ok((grad, gten_ave))
    }

    fn natural_gradient(
        &self,
        grad: Option<&SplitIndexTPS>,
        gten_ave: Option<&SplitIndexTPS>,
    ) -> VMCResult<Option<(SplitIndexTPS, usize)>>
    {
        let cg = &self.params.cg_params;
        let matrix = SRSMatrix {
            samples: &self.gten_samples,
            mean: gten_ave,
            world_size: self.comm.size(),
            diag_shift: cg.diag_shift,
        };
        Ok(sr::stochastic_reconfiguration(&self.comm, &matrix, grad, &self.sitps, cg)?)
    }

    /// `T -= step_len * direction` and site normalization on the master, then
    /// broadcast. `direction` is only read on the master.
    fn update_tps(&mut self, direction: Option<&SplitIndexTPS>, step_len: f64)
        -> VMCResult<()>
    {
        if self.comm.is_master() {
            if let Some(direction) = direction {
                self.sitps.axpy(-step_len, direction);
                self.sitps.normalize_sites();
            }
        }
        stats::broadcast_sitps(&self.comm, &mut self.sitps)?;
        self.sample.reset(&self.sitps)?;
        Ok(())
    }

    /// Dump to the configured wavefunction directory.
    pub fn dump_data(&self) -> VMCResult<()> {
        self.dump_data_to(&self.params.mc.wavefunction_path)
    }

    /// Write the wavefunction (master), this rank's configuration, the energy
    /// samples of the last iteration and, on the master, the trajectories.
    pub fn dump_data_to<P>(&self, tps_path: P) -> VMCResult<()>
    where P: AsRef<Path>
    {
        let tps_path = tps_path.as_ref();
        let energy_path = &self.params.energy_path;
        let rank = self.comm.rank();
        if self.comm.is_master() {
            self.sitps.dump(tps_path)?;
            fs::create_dir_all(energy_path)?;
        }
        // the directories must exist before any rank writes into them
        self.comm.barrier()?;
        self.sample.config.dump(tps_path, rank)?;
        dump_vec(energy_path.join(format!("energy_sample{rank}")), &self.energy_samples)?;
        if self.comm.is_master() {
            dump_vec(energy_path.join("energy_trajectory"), &self.energy_trajectory)?;
            dump_vec(energy_path.join("energy_err_trajectory"), &self.energy_error_trajectory)?;
            dump_vec(energy_path.join("grad_norm_trajectory"), &self.grad_norms)?;
        }
        Ok(())
    }
}
