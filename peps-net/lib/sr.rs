//! Stochastic reconfiguration: the natural gradient `x = S^-1 g`, where `S` is
//! the covariance of the log-derivatives `O_i = d ln psi(c_i) / d T` over the
//! Monte Carlo samples,
//!
//! ```text
//! S v = (1/N) sum_i O_i (O_i . v) - Obar (Obar . v) + eps v
//! ```
//!
//! `S` is never stored: every application runs over the stored samples, which
//! are spread over all ranks, and is reduced on the master. The master drives
//! conjugate gradient while the other ranks serve operator applications.

use log::{ debug, warn };
use ndarray as nd;
use serde::{ Deserialize, Serialize };
use crate::{
    comm::{ CommResult, Communicator, MASTER_RANK },
    configuration::Configuration,
    lattice::Grid,
    stats,
    tensor,
    tps::SplitIndexTPS,
};

/// Minimal vector-space structure needed by [`conjugate_gradient`].
pub trait VectorSpace: Clone {
    fn inner(&self, other: &Self) -> f64;

    /// `self += alpha * x`.
    fn axpy(&mut self, alpha: f64, x: &Self);

    fn scale(&mut self, alpha: f64);

    fn zeros_like(&self) -> Self;

    fn norm(&self) -> f64 { self.inner(self).sqrt() }
}

impl VectorSpace for nd::Array1<f64> {
    fn inner(&self, other: &Self) -> f64 { self.dot(other) }

    fn axpy(&mut self, alpha: f64, x: &Self) { self.scaled_add(alpha, x); }

    fn scale(&mut self, alpha: f64) { self.map_inplace(|v| { *v *= alpha; }); }

    fn zeros_like(&self) -> Self { nd::Array1::zeros(self.len()) }
}

impl VectorSpace for SplitIndexTPS {
    fn inner(&self, other: &Self) -> f64 { SplitIndexTPS::inner(self, other) }

    fn axpy(&mut self, alpha: f64, x: &Self) { SplitIndexTPS::axpy(self, alpha, x); }

    fn scale(&mut self, alpha: f64) { SplitIndexTPS::scale(self, alpha); }

    fn zeros_like(&self) -> Self { SplitIndexTPS::zeros_like(self) }
}

fn default_max_iter() -> usize { 100 }

fn default_tolerance() -> f64 { 1e-8 }

fn default_residue_restart_step() -> usize { 20 }

fn default_diag_shift() -> f64 { 1e-3 }

/// Conjugate-gradient and regularization parameters.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConjugateGradientParams {
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Relative residual `||r|| / ||b||` at which the iteration stops.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Recompute the residual from scratch every this many iterations; 0
    /// disables restarts.
    #[serde(default = "default_residue_restart_step")]
    pub residue_restart_step: usize,
    #[serde(default = "default_diag_shift")]
    pub diag_shift: f64,
}

impl Default for ConjugateGradientParams {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            tolerance: default_tolerance(),
            residue_restart_step: default_residue_restart_step(),
            diag_shift: default_diag_shift(),
        }
    }
}

/// Solve `A x = b` for symmetric positive-definite `A`, starting from `x0`.
///
/// Returns the solution and the number of iterations performed. A zero
/// right-hand side returns `x0` untouched after zero iterations.
pub fn conjugate_gradient<V, F, E>(
    mut apply: F,
    b: &V,
    x0: V,
    params: &ConjugateGradientParams,
) -> Result<(V, usize), E>
where
    V: VectorSpace,
    F: FnMut(&V) -> Result<V, E>,
{
    let b_norm = b.norm();
    if b_norm == 0.0 { return Ok((x0, 0)); }
    let threshold = params.tolerance * b_norm;

    let residual = |apply: &mut F, x: &V| -> Result<V, E> {
        let mut r = b.clone();
        r.axpy(-1.0, &apply(x)?);
        Ok(r)
    };

    let mut x = x0;
    let mut r = residual(&mut apply, &x)?;
    let mut p = r.clone();
    let mut rr = r.inner(&r);
    for k in 0..params.max_iter {
        if rr.sqrt() <= threshold { return Ok((x, k)); }
        let ap = apply(&p)?;
        let pap = p.inner(&ap);
        if pap <= 0.0 || !pap.is_finite() {
            warn!("conjugate gradient broke down at iteration {k}: p.Ap = {pap:e}");
            return Ok((x, k));
        }
        let alpha = rr / pap;
        x.axpy(alpha, &p);
        if params.residue_restart_step > 0 && (k + 1) % params.residue_restart_step == 0 {
            r = residual(&mut apply, &x)?;
        } else {
            r.axpy(-alpha, &ap);
        }
        let rr_new = r.inner(&r);
        if rr_new.sqrt() <= threshold { return Ok((x, k + 1)); }
        p.scale(rr_new / rr);
        p.axpy(1.0, &r);
        rr = rr_new;
    }
    debug!(
        "conjugate gradient stopped after {} iterations at relative residual {:e}",
        params.max_iter,
        rr.sqrt() / b_norm,
    );
    Ok((x, params.max_iter))
}

/// Log-derivative of one Monte Carlo sample. Only the component belonging to
/// the sampled basis value is non-zero at each site, so only that one is kept.
#[derive(Clone, Debug, PartialEq)]
pub struct LogDerivSample {
    basis: Grid<usize>,
    tensors: Grid<nd::Array4<f64>>,
}

impl LogDerivSample {
    /// Pair per-site log-derivative tensors with the configuration they were
    /// computed for.
    pub fn new(config: &Configuration, tensors: Grid<nd::Array4<f64>>) -> Self {
        Self { basis: (**config).clone(), tensors }
    }

    /// `O . v`.
    pub fn dot(&self, v: &SplitIndexTPS) -> f64 {
        self.tensors.indexed_iter()
            .map(|(site, t)| tensor::inner(t, &v[site][self.basis[site]]))
            .sum()
    }

    /// `acc += alpha * O`.
    pub fn add_to(&self, alpha: f64, acc: &mut SplitIndexTPS) {
        self.tensors.indexed_iter()
            .for_each(|(site, t)| { acc[site][self.basis[site]].scaled_add(alpha, t); });
    }
}

/// The SR matrix `S` restricted to the samples held by one rank.
#[derive(Copy, Clone, Debug)]
pub struct SRSMatrix<'a> {
    /// Samples of this rank.
    pub samples: &'a [LogDerivSample],
    /// Mean log-derivative over all ranks; only needed on the master.
    pub mean: Option<&'a SplitIndexTPS>,
    /// Number of ranks, each holding the same number of samples.
    pub world_size: usize,
    pub diag_shift: f64,
}

impl<'a> SRSMatrix<'a> {
    /// `sum_i O_i (O_i . v)` over this rank's samples.
    pub fn local_apply(&self, v: &SplitIndexTPS) -> SplitIndexTPS {
        let mut acc = v.zeros_like();
        self.samples.iter()
            .for_each(|o| { o.add_to(o.dot(v), &mut acc); });
        acc
    }

    /// Complete `S v` from the sum over every rank's samples.
    pub fn finish_apply(&self, summed: SplitIndexTPS, v: &SplitIndexTPS) -> SplitIndexTPS {
        let total = (self.samples.len() * self.world_size).max(1) as f64;
        let mut sv = summed;
        sv.scale(1.0 / total);
        if let Some(mean) = self.mean {
            sv.axpy(-mean.inner(v), mean);
        }
        sv.axpy(self.diag_shift, v);
        sv
    }

    /// `S v` when every sample lives on this rank.
    pub fn apply(&self, v: &SplitIndexTPS) -> SplitIndexTPS {
        self.finish_apply(self.local_apply(v), v)
    }
}

/// Solve `S x = grad` across all ranks. The master must pass the gradient and
/// receives `Some((x, iterations))`; every other rank serves operator
/// applications until the master is done and receives `None`. `template`
/// fixes the tensor shapes on the serving ranks.
pub fn stochastic_reconfiguration<C>(
    comm: &C,
    matrix: &SRSMatrix<'_>,
    grad: Option<&SplitIndexTPS>,
    template: &SplitIndexTPS,
    params: &ConjugateGradientParams,
) -> CommResult<Option<(SplitIndexTPS, usize)>>
where C: Communicator
{
    if comm.is_master() {
        let b = grad.cloned().unwrap_or_else(|| template.zeros_like());
        let apply = |v: &SplitIndexTPS| -> CommResult<SplitIndexTPS> {
            comm.broadcast_flag(MASTER_RANK, true)?;
            let mut v = v.clone();
            stats::broadcast_sitps(comm, &mut v)?;
            let summed = stats::sum_sitps(comm, matrix.local_apply(&v))?
                .unwrap_or_else(|| v.zeros_like());
            Ok(matrix.finish_apply(summed, &v))
        };
        let solved = conjugate_gradient(apply, &b, b.zeros_like(), params);
        // release the serving ranks even if an application failed
        let stopped = comm.broadcast_flag(MASTER_RANK, false);
        let solved = solved?;
        stopped?;
        Ok(Some(solved))
    } else {
        while comm.broadcast_flag(MASTER_RANK, false)? {
            let mut v = template.zeros_like();
            stats::broadcast_sitps(comm, &mut v)?;
            stats::sum_sitps(comm, matrix.local_apply(&v))?;
        }
        Ok(None)
    }
}
