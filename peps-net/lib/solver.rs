//! Local energy and observable estimators.
//!
//! An [`EnergySolver`] evaluates, for one Monte Carlo configuration, the local
//! energy `E_loc = sum_{c'} <c|H|c'> psi(c') / psi(c)` together with the
//! log-derivative ("hole") tensors `d ln psi / d T_site`. Both come out of the
//! same two boundary sweeps over the network, so the amplitude of every
//! off-diagonal configuration is obtained as a substituted trace.
//!
//! Spin-1/2 models use basis 0 for spin down and basis 1 for spin up.

use log::warn;
use ndarray as nd;
use crate::{
    lattice::{ BMPSPosition, BondOrientation, Grid, SiteIdx },
    sample::TPSSample,
    tensor,
    tn2d::TNResult,
    tps::SplitIndexTPS,
};

/// Ratios `|psi'/psi|` above this are treated as unreliable contractions
/// when estimating the energy for the gradient.
pub const DEFAULT_RATIO_THRESHOLD: f64 = 1e8;

/// Tighter ratio bound for measurement, where a single outlier biases every
/// reported bond energy.
pub const DEFAULT_MEASURE_RATIO_THRESHOLD: f64 = 1e5;

/// Observables of a single Monte Carlo sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservablesLocal {
    /// Local energy.
    pub energy: f64,
    /// Energy of every nearest-neighbor bond: horizontal bonds row by row,
    /// then vertical bonds column by column.
    pub bond_energies: Vec<f64>,
    /// `<S^z_i>` for every site, row-major.
    pub one_point_functions: Vec<f64>,
    /// Correlations along the middle row from a fixed reference site:
    /// `S^z S^z`, then `S^+ S^-`, then `S^- S^+`, each for every distance.
    pub two_point_functions: Vec<f64>,
}

/// A physical model whose local energy can be estimated from a sampled
/// configuration.
pub trait EnergySolver {
    /// Local energy of the current configuration of `sample`, and the hole
    /// tensor of every site divided by the amplitude. The boundary caches of
    /// `sample` are rebuilt along the way and its amplitude is refreshed.
    fn cal_energy_and_holes(&self, sitps: &SplitIndexTPS, sample: &mut TPSSample)
        -> TNResult<(f64, Grid<nd::Array4<f64>>)>;

    /// Local values of the measured observables for the current configuration.
    fn sample_measure(&self, sitps: &SplitIndexTPS, sample: &mut TPSSample)
        -> TNResult<ObservablesLocal>;
}

/// Spin-1/2 XXZ model on the square lattice with nearest-neighbor couplings,
/// `H = sum_<ij> jz S^z_i S^z_j + jxy/2 (S^+_i S^-_j + S^-_i S^+_j)`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpinOneHalfXXZSquare {
    pub jz: f64,
    pub jxy: f64,
    pub ratio_threshold: f64,
    pub measure_ratio_threshold: f64,
}

impl SpinOneHalfXXZSquare {
    pub fn new(jz: f64, jxy: f64) -> Self {
        Self {
            jz,
            jxy,
            ratio_threshold: DEFAULT_RATIO_THRESHOLD,
            measure_ratio_threshold: DEFAULT_MEASURE_RATIO_THRESHOLD,
        }
    }

    pub fn with_ratio_threshold(mut self, ratio_threshold: f64) -> Self {
        self.ratio_threshold = ratio_threshold;
        self
    }

    pub fn with_measure_ratio_threshold(mut self, ratio_threshold: f64) -> Self {
        self.measure_ratio_threshold = ratio_threshold;
        self
    }

    /// Energy of the bond between two neighboring sites; `site2` follows
    /// `site1` along `orient`.
    fn bond_energy(
        &self,
        sitps: &SplitIndexTPS,
        sample: &TPSSample,
        site1: SiteIdx,
        site2: SiteIdx,
        orient: BondOrientation,
        threshold: f64,
    ) -> TNResult<f64>
    {
        let (c1, c2) = (sample.config[site1], sample.config[site2]);
        if c1 == c2 { return Ok(0.25 * self.jz); }
        let (t1, t2) = (&sitps[site1][c2], &sitps[site2][c1]);
        let psi_ex = sample.tn.replace_nn_site_trace(site1, site2, orient, t1, t2)?;
        let ratio = psi_ex / sample.amplitude;
        if !ratio.is_finite() || ratio.abs() > threshold {
            warn!(
                "unreliable amplitude ratio on {orient:?} bond {site1:?}-{site2:?}: \
                psi = {:e}, psi_ex = {psi_ex:e}, |T1| = {:e}, |T2| = {:e}; contribution dropped",
                sample.amplitude,
                tensor::frobenius_norm(t1),
                tensor::frobenius_norm(t2),
            );
            return Ok(0.0);
        }
        Ok(-0.25 * self.jz + 0.5 * self.jxy * ratio)
    }

    /// Off-diagonal spin-flip correlations from `site0` to `site`, both on row
    /// `row`: `(<S^+_0 S^-_x>, <S^-_0 S^+_x>)`.
    fn flip_correlation(
        &self,
        sitps: &SplitIndexTPS,
        sample: &TPSSample,
        site0: SiteIdx,
        site: SiteIdx,
    ) -> TNResult<(f64, f64)>
    {
        let (c0, c) = (sample.config[site0], sample.config[site]);
        if c0 == c { return Ok((0.0, 0.0)); }
        let psi_ex = sample.tn.replace_trace(
            BondOrientation::Horizontal,
            site0.row(),
            &[(site0.col(), &sitps[site0][c]), (site.col(), &sitps[site][c0])],
        )?;
        let ratio = psi_ex / sample.amplitude;
        if c0 == 0 { Ok((ratio, 0.0)) } else { Ok((0.0, ratio)) }
    }

    /// Both boundary sweeps. Holes are collected in the row pass when
    /// `holes` is given; bond energies are always collected, dropping ratios
    /// above `threshold`.
    fn sweep(
        &self,
        sitps: &SplitIndexTPS,
        sample: &mut TPSSample,
        threshold: f64,
        mut holes: Option<&mut Grid<nd::Array4<f64>>>,
        mut flips: Option<&mut Vec<(f64, f64)>>,
    ) -> TNResult<(Vec<f64>, Vec<f64>)>
    {
        let (ly, lx) = (sample.config.rows(), sample.config.cols());
        let (ref_row, ref_col) = (ly / 2, lx / 4);
        let mut horizontal: Vec<f64> = Vec::with_capacity(ly * lx.saturating_sub(1));
        let mut vertical: Vec<f64> = Vec::with_capacity(lx * ly.saturating_sub(1));

        sample.tn.generate_bmps_approach(BMPSPosition::Up)?;
        for row in 0..ly {
            sample.tn.init_bten(BMPSPosition::Left, row);
            sample.tn.grow_full_bten(BMPSPosition::Right, row, 1, true)?;
            sample.amplitude = sample.tn.trace(SiteIdx(row, 0), BondOrientation::Horizontal)?;
            if row == ref_row {
                if let Some(flips) = flips.as_mut() {
                    for d in 1..=lx / 2 {
                        let site = SiteIdx(row, ref_col + d);
                        flips.push(self.flip_correlation(sitps, sample, SiteIdx(row, ref_col), site)?);
                    }
                }
            }
            for col in 0..lx {
                let site = SiteIdx(row, col);
                if let Some(holes) = holes.as_mut() {
                    let hole = sample.tn.punch_hole(site, BondOrientation::Horizontal)?;
                    holes[site] = hole / sample.amplitude;
                }
                if col + 1 < lx {
                    horizontal.push(self.bond_energy(
                        sitps,
                        sample,
                        site,
                        SiteIdx(row, col + 1),
                        BondOrientation::Horizontal,
                        threshold,
                    )?);
                    sample.tn.bten_move_step(BMPSPosition::Right)?;
                }
            }
            if row + 1 < ly { sample.tn.bmps_move_step(BMPSPosition::Down)?; }
        }

        if ly > 1 {
            sample.tn.generate_bmps_approach(BMPSPosition::Left)?;
            for col in 0..lx {
                sample.tn.init_bten(BMPSPosition::Up, col);
                sample.tn.grow_full_bten(BMPSPosition::Down, col, 2, true)?;
                sample.amplitude = sample.tn.trace(SiteIdx(0, col), BondOrientation::Vertical)?;
                for row in 0..ly - 1 {
                    vertical.push(self.bond_energy(
                        sitps,
                        sample,
                        SiteIdx(row, col),
                        SiteIdx(row + 1, col),
                        BondOrientation::Vertical,
                        threshold,
                    )?);
                    if row + 2 < ly { sample.tn.bten_move_step(BMPSPosition::Down)?; }
                }
                if col + 1 < lx { sample.tn.bmps_move_step(BMPSPosition::Right)?; }
            }
        }
        Ok((horizontal, vertical))
    }
}

impl EnergySolver for SpinOneHalfXXZSquare {
    fn cal_energy_and_holes(&self, sitps: &SplitIndexTPS, sample: &mut TPSSample)
        -> TNResult<(f64, Grid<nd::Array4<f64>>)>
    {
        let mut holes = Grid::from_fn(sitps.rows(), sitps.cols(), |site| {
            nd::Array4::zeros(sitps[site][0].raw_dim())
        });
        let (horizontal, vertical)
            = self.sweep(sitps, sample, self.ratio_threshold, Some(&mut holes), None)?;
        let energy: f64 = horizontal.iter().chain(vertical.iter()).sum();
        Ok((energy, holes))
    }

    fn sample_measure(&self, sitps: &SplitIndexTPS, sample: &mut TPSSample)
        -> TNResult<ObservablesLocal>
    {
        let mut flips: Vec<(f64, f64)> = Vec::new();
        let (mut bond_energies, vertical)
            = self.sweep(sitps, sample, self.measure_ratio_threshold, None, Some(&mut flips))?;
        bond_energies.extend(vertical);
        let energy: f64 = bond_energies.iter().sum();
        let sz = |c: usize| c as f64 - 0.5;
        let one_point_functions: Vec<f64> = sample.config.iter().map(|c| sz(*c)).collect();

        let (ly, lx) = (sample.config.rows(), sample.config.cols());
        let site0 = SiteIdx(ly / 2, lx / 4);
        let mut two_point_functions: Vec<f64>
            = (1..=lx / 2)
            .map(|d| sz(sample.config[site0]) * sz(sample.config[SiteIdx(site0.row(), site0.col() + d)]))
            .collect();
        two_point_functions.extend(flips.iter().map(|(pm, _)| *pm));
        two_point_functions.extend(flips.iter().map(|(_, mp)| *mp));
        Ok(ObservablesLocal { energy, bond_energies, one_point_functions, two_point_functions })
    }
}

/// Spin-1/2 antiferromagnetic Heisenberg model on the square lattice, the
/// isotropic point `jz = jxy = 1` of [`SpinOneHalfXXZSquare`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpinOneHalfHeisenbergSquare(SpinOneHalfXXZSquare);

impl Default for SpinOneHalfHeisenbergSquare {
    fn default() -> Self { Self(SpinOneHalfXXZSquare::new(1.0, 1.0)) }
}

impl SpinOneHalfHeisenbergSquare {
    pub fn new() -> Self { Self::default() }

    pub fn with_ratio_threshold(self, ratio_threshold: f64) -> Self {
        Self(self.0.with_ratio_threshold(ratio_threshold))
    }

    pub fn with_measure_ratio_threshold(self, ratio_threshold: f64) -> Self {
        Self(self.0.with_measure_ratio_threshold(ratio_threshold))
    }
}

impl EnergySolver for SpinOneHalfHeisenbergSquare {
    fn cal_energy_and_holes(&self, sitps: &SplitIndexTPS, sample: &mut TPSSample)
        -> TNResult<(f64, Grid<nd::Array4<f64>>)>
    {
        self.0.cal_energy_and_holes(sitps, sample)
    }

    fn sample_measure(&self, sitps: &SplitIndexTPS, sample: &mut TPSSample)
        -> TNResult<ObservablesLocal>
    {
        self.0.sample_measure(sitps, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{ configuration::Configuration, tensor::TruncatePara };

    fn trunc() -> TruncatePara { TruncatePara::new(1, 64, 0.0) }

    // Every configuration amplitude of a 1 x 2 state with bond dimension 1 is
    // the product of two site scalars.
    fn product_state(a: [f64; 2], b: [f64; 2]) -> SplitIndexTPS {
        let grid = Grid::from_fn(1, 2, |site| {
            let amps = if site.col() == 0 { a } else { b };
            amps.iter().map(|x| nd::Array4::from_elem((1, 1, 1, 1), *x)).collect()
        });
        SplitIndexTPS::from_grid(grid).unwrap()
    }

    #[test]
    fn equal_spins_use_diagonal_element_only() {
        let mut sitps = product_state([1.0, 1.0], [1.0, 1.0]);
        // any ratio evaluation would turn the energy into NaN
        sitps[SiteIdx(0, 0)][0].fill(f64::NAN);
        sitps[SiteIdx(0, 1)][0].fill(f64::NAN);
        let config = Configuration::from_rows(vec![vec![1, 1]]).unwrap();
        let mut sample = TPSSample::new(&sitps, config, trunc()).unwrap();
        let solver = SpinOneHalfHeisenbergSquare::new();
        let (energy, holes) = solver.cal_energy_and_holes(&sitps, &mut sample).unwrap();
        assert_eq!(energy, 0.25);
        assert!(holes.iter().all(|h| h.iter().all(|x| x.is_finite())));
    }

    #[test]
    fn antiparallel_bond_energy_uses_amplitude_ratio() {
        let sitps = product_state([0.6, 0.8], [0.3, 0.4]);
        let config = Configuration::from_rows(vec![vec![0, 1]]).unwrap();
        let mut sample = TPSSample::new(&sitps, config, trunc()).unwrap();
        let solver = SpinOneHalfXXZSquare::new(2.0, 1.0);
        let (energy, holes) = solver.cal_energy_and_holes(&sitps, &mut sample).unwrap();
        let ratio = (0.8 * 0.3) / (0.6 * 0.4);
        assert_relative_eq!(energy, -0.5 + 0.5 * ratio, epsilon = 1e-12);
        // d ln psi / d T = 1 / T for a product of scalars
        assert_relative_eq!(holes[SiteIdx(0, 0)][[0, 0, 0, 0]], 1.0 / 0.6, epsilon = 1e-12);
        assert_relative_eq!(holes[SiteIdx(0, 1)][[0, 0, 0, 0]], 1.0 / 0.4, epsilon = 1e-12);
    }

    #[test]
    fn huge_ratios_are_dropped() {
        let sitps = product_state([1e-12, 1.0], [1.0, 1e-12]);
        let config = Configuration::from_rows(vec![vec![0, 1]]).unwrap();
        let mut sample = TPSSample::new(&sitps, config, trunc()).unwrap();
        let (energy, _) = SpinOneHalfHeisenbergSquare::new()
            .cal_energy_and_holes(&sitps, &mut sample)
            .unwrap();
        assert_eq!(energy, 0.0);
    }

    #[test]
    fn measurement_drops_ratios_the_energy_keeps() {
        // ratio 1e6: above the measurement bound, below the energy bound
        let sitps = product_state([1e-3, 1.0], [1.0, 1e-3]);
        let config = Configuration::from_rows(vec![vec![0, 1]]).unwrap();
        let mut sample = TPSSample::new(&sitps, config, trunc()).unwrap();
        let solver = SpinOneHalfHeisenbergSquare::new();
        let (energy, _) = solver.cal_energy_and_holes(&sitps, &mut sample).unwrap();
        assert_relative_eq!(energy, -0.25 + 0.5e6, max_relative = 1e-9);
        let obs = solver.sample_measure(&sitps, &mut sample).unwrap();
        assert_eq!(obs.bond_energies, vec![0.0]);
        assert_eq!(obs.energy, 0.0);
        let loose = solver.with_measure_ratio_threshold(1e8);
        let obs = loose.sample_measure(&sitps, &mut sample).unwrap();
        assert_relative_eq!(obs.energy, energy, max_relative = 1e-9);
    }

    #[test]
    fn holes_reproduce_the_amplitude() {
        let mut rng = StdRng::seed_from_u64(41);
        let sitps = SplitIndexTPS::random(3, 3, 2, 2, &mut rng).unwrap();
        let config = Configuration::random(3, 3, &[4, 5], &mut rng).unwrap();
        let mut sample = TPSSample::new(&sitps, config, trunc()).unwrap();
        let (_, holes) = SpinOneHalfHeisenbergSquare::new()
            .cal_energy_and_holes(&sitps, &mut sample)
            .unwrap();
        for site in holes.sites() {
            let t = &sitps[site][sample.config[site]];
            assert_relative_eq!(tensor::inner(&holes[site], t), 1.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn measurement_layout() {
        let mut rng = StdRng::seed_from_u64(42);
        let sitps = SplitIndexTPS::random(2, 4, 2, 2, &mut rng).unwrap();
        let config = Configuration::random(2, 4, &[4, 4], &mut rng).unwrap();
        let mut sample = TPSSample::new(&sitps, config, trunc()).unwrap();
        let solver = SpinOneHalfHeisenbergSquare::new();
        let obs = solver.sample_measure(&sitps, &mut sample).unwrap();
        assert_eq!(obs.bond_energies.len(), 10);
        assert_eq!(obs.one_point_functions.len(), 8);
        assert_eq!(obs.two_point_functions.len(), 6);
        assert_relative_eq!(obs.energy, obs.bond_energies.iter().sum::<f64>(), epsilon = 1e-12);
        let (energy, _) = solver.cal_energy_and_holes(&sitps, &mut sample).unwrap();
        assert_relative_eq!(obs.energy, energy, epsilon = 1e-10);
        let config_before = sample.config.clone();
        solver.sample_measure(&sitps, &mut sample).unwrap();
        assert_eq!(sample.config, config_before);
    }
}
