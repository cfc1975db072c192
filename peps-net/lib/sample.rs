//! Markov-chain Monte Carlo over configurations of a [`SplitIndexTPS`].
//!
//! A [`TPSSample`] owns the current configuration, the tensor network it
//! selects, and the cached amplitude. Sweeps walk the lattice row by row and
//! then column by column, proposing local moves whose amplitudes are read off
//! the boundary caches without recontracting the network. Accepted moves
//! commit the proposed amplitude directly; the amplitude is recomputed by a
//! full trace at the start of every row and column.
//!
//! Two move sets are provided:
//! - nearest-neighbor exchange of local basis values, for number-conserving
//!   models;
//! - the compressed Kagome update, where every site packs three bond degrees
//!   of freedom into the bits of an 8-valued basis index. A site may rotate
//!   its bits cyclically, and a bond may exchange one occupied bit with an
//!   empty one across the bond.

use std::ops::AddAssign;
use log::warn;
use rand::Rng;
use crate::{
    configuration::Configuration,
    lattice::{ BMPSPosition, BondOrientation, SiteIdx },
    tensor::{ self, TruncatePara },
    tn2d::{ TNResult, TensorNetwork2D },
    tps::SplitIndexTPS,
};

/// Accepted moves during one sweep.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptCounts {
    /// Accepted moves on horizontal bonds.
    pub horizontal: usize,
    /// Accepted moves on vertical bonds.
    pub vertical: usize,
    /// Accepted single-site moves.
    pub site: usize,
}

impl AcceptCounts {
    /// Accepted bond moves in both orientations.
    pub fn bonds(&self) -> usize { self.horizontal + self.vertical }
}

impl AddAssign for AcceptCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.horizontal += rhs.horizontal;
        self.vertical += rhs.vertical;
        self.site += rhs.site;
    }
}

/// Probability of accepting a move from amplitude `psi_current` to
/// `psi_proposed`: `min(1, |psi_proposed / psi_current|²)`.
///
/// Returns exactly 1 whenever `|psi_proposed| >= |psi_current|` and 0 if the
/// ratio is undefined.
pub fn acceptance_probability(psi_current: f64, psi_proposed: f64) -> f64 {
    if psi_proposed.abs() >= psi_current.abs() { return 1.0; }
    let p = (psi_proposed / psi_current).powi(2);
    if p.is_nan() { 0.0 } else { p.min(1.0) }
}

fn metropolis<R>(psi_current: f64, psi_proposed: f64, rng: &mut R) -> bool
where R: Rng + ?Sized
{
    let p = acceptance_probability(psi_current, psi_proposed);
    p >= 1.0 || rng.gen::<f64>() < p
}

/// Outcome of a compressed-Kagome single-site update.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RotationChoice {
    /// Keep the current basis value.
    Stay,
    /// Move to the rotated basis value with the smaller amplitude.
    Smaller,
    /// Move to the rotated basis value with the larger amplitude.
    Larger,
}

/// Pick the outcome of a three-state single-site update from the squared
/// amplitudes of the current state (`p0`) and of the two rotated candidates,
/// `p1 <= p2`, given a uniform draw `rand` from `[0, 1)`.
///
/// When one weight dominates (it is at least the sum of the other two):
/// - if `p2` dominates, move to it;
/// - if `p0` dominates, move to `p2` with probability `p2/p0`, to `p1` with
///   probability `p1/p0`, and stay otherwise.
///
/// Otherwise the weights are balanced:
/// - `p0` largest: move to `p2` with probability `p2/(p1 + p2)`, else to `p1`;
/// - `p0` smallest: move to `p2` with probability `p2/(p0 + p1)`, else to `p1`;
/// - `p0` in the middle: move to `p2` when `rand <= p2/(p0 + p1)`, to `p1` when
///   `rand` additionally falls under `p1/p0 · (1 - p2/(p0 + p1))`, and stay
///   otherwise.
pub fn choose_rotation(p0: f64, p1: f64, p2: f64, rand: f64) -> RotationChoice {
    use RotationChoice::*;
    if p0 + p1 + p2 <= 2.0 * p0.max(p2) {
        if p2 >= p0 {
            Larger
        } else if rand < p2 / p0 {
            Larger
        } else if rand < (p1 + p2) / p0 {
            Smaller
        } else {
            Stay
        }
    } else if p0 >= p2 {
        if rand < p2 / (p2 + p1) { Larger } else { Smaller }
    } else if p0 <= p1 {
        if rand < p2 / (p0 + p1) { Larger } else { Smaller }
    } else {
        let to_larger = p2 / (p0 + p1);
        if rand <= to_larger {
            Larger
        } else if rand <= to_larger + p1 / p0 * (1.0 - to_larger) {
            Smaller
        } else {
            Stay
        }
    }
}

/// Cyclic rotation of the three packed bond bits of a compressed Kagome site.
#[inline]
pub fn rotate_kagome(basis: usize) -> usize { basis / 4 + 2 * (basis % 4) }

/// Monte Carlo state: a configuration, its tensor network and its amplitude.
#[derive(Clone, Debug)]
pub struct TPSSample {
    pub config: Configuration,
    pub tn: TensorNetwork2D,
    pub amplitude: f64,
}

impl TPSSample {
    /// Build the network for `config` and contract it once for the amplitude.
    pub fn new(sitps: &SplitIndexTPS, config: Configuration, trunc: TruncatePara)
        -> TNResult<Self>
    {
        let tn = TensorNetwork2D::new(sitps, &config, trunc);
        let mut new = Self { config, tn, amplitude: 0.0 };
        new.amplitude = new.contract()?;
        Ok(new)
    }

    /// Rebuild the network and amplitude for the current configuration, e.g.
    /// after the wavefunction has changed.
    pub fn reset(&mut self, sitps: &SplitIndexTPS) -> TNResult<()> {
        let trunc = *self.tn.trunc_para();
        self.tn = TensorNetwork2D::new(sitps, &self.config, trunc);
        self.amplitude = self.contract()?;
        Ok(())
    }

    fn contract(&mut self) -> TNResult<f64> {
        self.tn.generate_bmps_approach(BMPSPosition::Up)?;
        self.tn.init_bten(BMPSPosition::Left, 0);
        self.tn.grow_full_bten(BMPSPosition::Right, 0, 2, true)?;
        self.tn.trace(SiteIdx(0, 0), BondOrientation::Horizontal)
    }

    /// One sweep of nearest-neighbor exchange moves over every horizontal,
    /// then every vertical bond.
    pub fn mc_sequentially_nn_flip_sweep<R>(
        &mut self,
        sitps: &SplitIndexTPS,
        trunc: &TruncatePara,
        rng: &mut R,
    ) -> TNResult<AcceptCounts>
    where R: Rng + ?Sized
    {
        let (ly, lx) = (self.config.rows(), self.config.cols());
        let mut counts = AcceptCounts::default();
        self.tn.set_trunc_para(*trunc);

        self.tn.generate_bmps_approach(BMPSPosition::Up)?;
        for row in 0..ly {
            self.tn.init_bten(BMPSPosition::Left, row);
            self.tn.grow_full_bten(BMPSPosition::Right, row, 2, true)?;
            self.amplitude = self.tn.trace(SiteIdx(row, 0), BondOrientation::Horizontal)?;
            for col in 0..lx.saturating_sub(1) {
                let accepted = self.exchange_update(
                    SiteIdx(row, col),
                    SiteIdx(row, col + 1),
                    BondOrientation::Horizontal,
                    sitps,
                    rng,
                )?;
                if accepted { counts.horizontal += 1; }
                if col + 2 < lx { self.tn.bten_move_step(BMPSPosition::Right)?; }
            }
            if row + 1 < ly { self.tn.bmps_move_step(BMPSPosition::Down)?; }
        }

        self.tn.generate_bmps_approach(BMPSPosition::Left)?;
        for col in 0..lx {
            self.tn.init_bten(BMPSPosition::Up, col);
            self.tn.grow_full_bten(BMPSPosition::Down, col, 2, true)?;
            self.amplitude = self.tn.trace(SiteIdx(0, col), BondOrientation::Vertical)?;
            for row in 0..ly.saturating_sub(1) {
                let accepted = self.exchange_update(
                    SiteIdx(row, col),
                    SiteIdx(row + 1, col),
                    BondOrientation::Vertical,
                    sitps,
                    rng,
                )?;
                if accepted { counts.vertical += 1; }
                if row + 2 < ly { self.tn.bten_move_step(BMPSPosition::Down)?; }
            }
            if col + 1 < lx { self.tn.bmps_move_step(BMPSPosition::Right)?; }
        }
        self.tn.delete_inner_bmps(BMPSPosition::Left);
        self.tn.delete_inner_bmps(BMPSPosition::Right);
        Ok(counts)
    }

    /// Propose swapping the basis values of two neighboring sites. Equal
    /// values make the move a no-op that counts as accepted.
    fn exchange_update<R>(
        &mut self,
        site1: SiteIdx,
        site2: SiteIdx,
        orient: BondOrientation,
        sitps: &SplitIndexTPS,
        rng: &mut R,
    ) -> TNResult<bool>
    where R: Rng + ?Sized
    {
        let (c1, c2) = (self.config[site1], self.config[site2]);
        if c1 == c2 { return Ok(true); }
        let psi = self.tn.replace_nn_site_trace(
            site1, site2, orient, &sitps[site1][c2], &sitps[site2][c1])?;
        if !metropolis(self.amplitude, psi, rng) { return Ok(false); }
        self.config.swap(site1, site2);
        self.tn.update_site_config(site1, c2, sitps);
        self.tn.update_site_config(site2, c1, sitps);
        self.amplitude = psi;
        Ok(true)
    }

    /// One sweep of compressed-Kagome updates: at every site a single-site
    /// rotation, then a bond exchange with the next site along the line; rows
    /// first, then columns.
    pub fn mc_compressed_kagome_lattice_local_update_sweep<R>(
        &mut self,
        sitps: &SplitIndexTPS,
        trunc: &TruncatePara,
        rng: &mut R,
    ) -> TNResult<AcceptCounts>
    where R: Rng + ?Sized
    {
        let (ly, lx) = (self.config.rows(), self.config.cols());
        let mut counts = AcceptCounts::default();
        self.tn.set_trunc_para(*trunc);

        self.tn.generate_bmps_approach(BMPSPosition::Up)?;
        for row in 0..ly {
            self.tn.init_bten(BMPSPosition::Left, row);
            self.tn.grow_full_bten(BMPSPosition::Right, row, 1, true)?;
            self.amplitude = self.tn.trace(SiteIdx(row, 0), BondOrientation::Horizontal)?;
            for col in 0..lx {
                let site = SiteIdx(row, col);
                if self.kagome_single_site_update(site, BondOrientation::Horizontal, sitps, rng)? {
                    counts.site += 1;
                }
                if col + 1 < lx {
                    let accepted = self.kagome_exchange_update(
                        site, SiteIdx(row, col + 1), BondOrientation::Horizontal, sitps, rng)?;
                    if accepted { counts.horizontal += 1; }
                    self.tn.bten_move_step(BMPSPosition::Right)?;
                }
            }
            if row + 1 < ly { self.tn.bmps_move_step(BMPSPosition::Down)?; }
        }

        self.tn.generate_bmps_approach(BMPSPosition::Left)?;
        for col in 0..lx {
            self.tn.init_bten(BMPSPosition::Up, col);
            self.tn.grow_full_bten(BMPSPosition::Down, col, 1, true)?;
            self.amplitude = self.tn.trace(SiteIdx(0, col), BondOrientation::Vertical)?;
            for row in 0..ly {
                let site = SiteIdx(row, col);
                if self.kagome_single_site_update(site, BondOrientation::Vertical, sitps, rng)? {
                    counts.site += 1;
                }
                if row + 1 < ly {
                    let accepted = self.kagome_exchange_update(
                        site, SiteIdx(row + 1, col), BondOrientation::Vertical, sitps, rng)?;
                    if accepted { counts.vertical += 1; }
                    self.tn.bten_move_step(BMPSPosition::Down)?;
                }
            }
            if col + 1 < lx { self.tn.bmps_move_step(BMPSPosition::Right)?; }
        }
        self.tn.delete_inner_bmps(BMPSPosition::Left);
        self.tn.delete_inner_bmps(BMPSPosition::Right);
        Ok(counts)
    }

    /// Rotate the packed bits of one site among its three cyclic variants.
    /// Sites with all bits equal are invariant and never move.
    fn kagome_single_site_update<R>(
        &mut self,
        site: SiteIdx,
        orient: BondOrientation,
        sitps: &SplitIndexTPS,
        rng: &mut R,
    ) -> TNResult<bool>
    where R: Rng + ?Sized
    {
        let c0 = self.config[site];
        if c0 == 0 || c0 == 7 { return Ok(false); }
        let r1 = rotate_kagome(c0);
        let r2 = rotate_kagome(r1);
        let psi1 = self.tn.replace_one_site_trace(site, &sitps[site][r1], orient)?;
        let psi2 = self.tn.replace_one_site_trace(site, &sitps[site][r2], orient)?;
        let ((small, psi_small), (large, psi_large))
            = if psi1.abs() <= psi2.abs() {
                ((r1, psi1), (r2, psi2))
            } else {
                ((r2, psi2), (r1, psi1))
            };
        let choice = choose_rotation(
            self.amplitude.powi(2),
            psi_small.powi(2),
            psi_large.powi(2),
            rng.gen::<f64>(),
        );
        let (basis, psi) = match choice {
            RotationChoice::Stay => { return Ok(false); },
            RotationChoice::Smaller => (small, psi_small),
            RotationChoice::Larger => (large, psi_large),
        };
        self.config[site] = basis;
        self.tn.update_site_config(site, basis, sitps);
        self.amplitude = psi;
        Ok(true)
    }

    /// Move one occupied bond bit across a bond: bit 2 of the left site with
    /// bit 0 of the right site for horizontal bonds, bit 1 of the upper site
    /// with bit 0 of the lower site for vertical bonds.
    fn kagome_exchange_update<R>(
        &mut self,
        site1: SiteIdx,
        site2: SiteIdx,
        orient: BondOrientation,
        sitps: &SplitIndexTPS,
        rng: &mut R,
    ) -> TNResult<bool>
    where R: Rng + ?Sized
    {
        let (c1, c2) = (self.config[site1], self.config[site2]);
        let bit1 = match orient {
            BondOrientation::Horizontal => 2,
            BondOrientation::Vertical => 1,
        };
        if (c1 >> bit1) & 1 == c2 & 1 { return Ok(false); }
        let ex1 = c1 ^ (1 << bit1);
        let ex2 = c2 ^ 1;
        if tensor::is_null(&sitps[site1][ex1]) || tensor::is_null(&sitps[site2][ex2]) {
            warn!(
                "exchange {site1:?}:{c1}->{ex1}, {site2:?}:{c2}->{ex2} targets an empty block; skipped"
            );
            return Ok(false);
        }
        let psi = self.tn.replace_nn_site_trace(
            site1, site2, orient, &sitps[site1][ex1], &sitps[site2][ex2])?;
        if !metropolis(self.amplitude, psi, rng) { return Ok(false); }
        self.config[site1] = ex1;
        self.config[site2] = ex2;
        self.tn.update_site_config(site1, ex1, sitps);
        self.tn.update_site_config(site2, ex2, sitps);
        self.amplitude = psi;
        Ok(true)
    }
}
