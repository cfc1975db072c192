//! Variational tensor product states with the physical index split into one
//! virtual tensor per local basis value.
//!
//! Every site holds a `Vec` of rank-4 tensors, one per local basis value, with
//! legs ordered as
//! ```text
//!            3 (up)
//!            |
//!   0 (left) T 2 (right)
//!            |
//!            1 (down)
//! ```
//! Legs on the lattice edge have dimension 1. The whole collection is also
//! treated as a vector (the space gradients and natural gradients live in),
//! hence the arithmetic below.

use std::{
    fs,
    io,
    ops::{ Index, IndexMut },
    path::{ Path, PathBuf },
};
use ndarray as nd;
use rand::Rng;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    lattice::{ Grid, SiteIdx },
    tensor,
};

#[derive(Debug, Error)]
pub enum TPSError {
    /// Returned when attempting to create a state for an empty lattice.
    #[error("error in TPS creation: cannot create for an empty lattice")]
    EmptyLattice,

    /// Returned when the physical dimension is zero.
    #[error("error in TPS creation: physical dimension must be nonzero")]
    ZeroPhysDim,

    /// Returned when a source TPS has a tensor that isn't compatible with its
    /// neighbors.
    #[error("error in TPS creation: tensor at {0:?} has mismatched virtual legs")]
    BondMismatch(SiteIdx),

    /// Returned on file system errors during dump/load.
    #[error("TPS i/o error: {0}")]
    Io(#[from] io::Error),

    /// Returned when a tensor or the metadata file fails to (de)serialize.
    #[error("TPS serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Returned when loaded metadata doesn't describe a valid lattice.
    #[error("TPS metadata describes {0} sites but lists {1} physical dimensions")]
    BadMetadata(usize, usize),
}
use TPSError::*;
pub type TPSResult<T> = Result<T, TPSError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TPSMeta {
    rows: usize,
    cols: usize,
    phys_dims: Vec<usize>,
}

/// Variational wavefunction: per-site, per-basis rank-4 tensors.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitIndexTPS {
    tensors: Grid<Vec<nd::Array4<f64>>>,
}

impl Index<SiteIdx> for SplitIndexTPS {
    type Output = Vec<nd::Array4<f64>>;

    fn index(&self, site: SiteIdx) -> &Self::Output { &self.tensors[site] }
}

impl IndexMut<SiteIdx> for SplitIndexTPS {
    fn index_mut(&mut self, site: SiteIdx) -> &mut Self::Output {
        &mut self.tensors[site]
    }
}

/// Shape `[left, down, right, up]` of a site tensor with bulk bond dimension
/// `d`.
fn site_shape(rows: usize, cols: usize, site: SiteIdx, d: usize) -> [usize; 4] {
    let SiteIdx(r, c) = site;
    [
        if c == 0 { 1 } else { d },
        if r == rows - 1 { 1 } else { d },
        if c == cols - 1 { 1 } else { d },
        if r == 0 { 1 } else { d },
    ]
}

impl SplitIndexTPS {
    /// Wrap an existing collection of site tensors.
    pub fn from_grid(tensors: Grid<Vec<nd::Array4<f64>>>) -> TPSResult<Self> {
        if tensors.size() == 0 { return Err(EmptyLattice); }
        if tensors.iter().any(|ts| ts.is_empty()) { return Err(ZeroPhysDim); }
        let new = Self { tensors };
        new.check_bonds()?;
        Ok(new)
    }

    /// Random state with uniform physical dimension `phys_dim` and bulk bond
    /// dimension `bond_dim`; entries are drawn uniformly from `[-1, 1)` and
    /// each site is then normalized.
    pub fn random<R>(
        rows: usize,
        cols: usize,
        phys_dim: usize,
        bond_dim: usize,
        rng: &mut R,
    ) -> TPSResult<Self>
    where R: Rng + ?Sized
    {
        if rows == 0 || cols == 0 { return Err(EmptyLattice); }
        if phys_dim == 0 { return Err(ZeroPhysDim); }
        let tensors = Grid::from_fn(rows, cols, |site| {
            let shape = site_shape(rows, cols, site, bond_dim.max(1));
            (0..phys_dim)
                .map(|_| nd::Array4::from_shape_simple_fn(shape, || rng.gen_range(-1.0..1.0)))
                .collect()
        });
        let mut new = Self { tensors };
        new.normalize_sites();
        Ok(new)
    }

    /// Split a TPS whose site tensors carry the physical index as a fifth leg,
    /// `[left, down, right, up, phys]`.
    pub fn from_tps(tps: &Grid<nd::Array5<f64>>) -> TPSResult<Self> {
        let tensors = tps.map(|t| {
            t.axis_iter(nd::Axis(4)).map(|comp| comp.to_owned()).collect()
        });
        Self::from_grid(tensors)
    }

    fn check_bonds(&self) -> TPSResult<()> {
        let rows = self.rows();
        let cols = self.cols();
        for (site, ts) in self.tensors.indexed_iter() {
            let shape = ts[0].shape();
            if ts.iter().any(|t| t.shape() != shape) { return Err(BondMismatch(site)); }
            let SiteIdx(r, c) = site;
            let edge_ok
                = (c != 0 || shape[0] == 1)
                && (r != rows - 1 || shape[1] == 1)
                && (c != cols - 1 || shape[2] == 1)
                && (r != 0 || shape[3] == 1);
            if !edge_ok { return Err(BondMismatch(site)); }
            if c + 1 < cols && self[SiteIdx(r, c + 1)][0].shape()[0] != shape[2] {
                return Err(BondMismatch(site));
            }
            if r + 1 < rows && self[SiteIdx(r + 1, c)][0].shape()[3] != shape[1] {
                return Err(BondMismatch(site));
            }
        }
        Ok(())
    }

    pub fn rows(&self) -> usize { self.tensors.rows() }

    pub fn cols(&self) -> usize { self.tensors.cols() }

    /// Number of local basis values at a site.
    pub fn phys_dim(&self, site: SiteIdx) -> usize { self.tensors[site].len() }

    /// Largest virtual bond dimension over all sites.
    pub fn max_bond_dim(&self) -> usize {
        self.tensors.iter()
            .flat_map(|ts| ts[0].shape().iter().copied().collect::<Vec<_>>())
            .max()
            .unwrap_or(1)
    }

    pub fn sites(&self) -> impl Iterator<Item = SiteIdx> + '_ {
        self.tensors.sites()
    }

    /// Iterate over all tensors in `(site, basis)` order.
    pub fn iter(&self) -> impl Iterator<Item = &nd::Array4<f64>> + '_ {
        self.tensors.iter().flat_map(|ts| ts.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut nd::Array4<f64>> + '_ {
        self.tensors.iter_mut().flat_map(|ts| ts.iter_mut())
    }

    /// A state of identical structure with every entry set to zero.
    pub fn zeros_like(&self) -> Self {
        let tensors = self.tensors.map(|ts| {
            ts.iter().map(|t| nd::Array4::zeros(t.raw_dim())).collect()
        });
        Self { tensors }
    }

    /// Euclidean inner product over all entries.
    pub fn inner(&self, other: &Self) -> f64 {
        self.iter().zip(other.iter())
            .map(|(a, b)| tensor::inner(a, b))
            .sum()
    }

    /// 2-norm over all entries.
    pub fn norm(&self) -> f64 { self.inner(self).sqrt() }

    /// `self += alpha * other`.
    pub fn axpy(&mut self, alpha: f64, other: &Self) {
        self.iter_mut().zip(other.iter())
            .for_each(|(a, b)| { a.scaled_add(alpha, b); });
    }

    /// `self *= alpha`.
    pub fn scale(&mut self, alpha: f64) {
        self.iter_mut().for_each(|t| { t.map_inplace(|x| { *x *= alpha; }); });
    }

    /// Clamp the magnitude of every entry to at most `bound`.
    pub fn bound_elements(&mut self, bound: f64) {
        self.iter_mut().for_each(|t| { tensor::bound_elements(t, bound); });
    }

    /// 2-norm of the tensor set at one site.
    pub fn site_norm(&self, site: SiteIdx) -> f64 {
        self.tensors[site].iter()
            .map(|t| tensor::inner(t, t))
            .sum::<f64>()
            .sqrt()
    }

    /// Rescale each site's tensor set to unit 2-norm, returning the norms
    /// found beforehand. Sites with zero norm are left untouched.
    pub fn normalize_sites(&mut self) -> Grid<f64> {
        let norms = self.tensors.map(|ts| {
            ts.iter().map(|t| tensor::inner(t, t)).sum::<f64>().sqrt()
        });
        self.tensors.iter_mut().zip(norms.iter())
            .filter(|(_, n)| **n > 0.0)
            .for_each(|(ts, n)| {
                ts.iter_mut().for_each(|t| { t.map_inplace(|x| { *x /= n; }); });
            });
        norms
    }

    fn tensor_path(dir: &Path, site: SiteIdx, basis: usize) -> PathBuf {
        dir.join(format!("tps_ten{}_{}_{}.json", site.0, site.1, basis))
    }

    /// Write the state to `dir`: a metadata file plus one file per
    /// `(site, basis)` tensor.
    pub fn dump<P>(&self, dir: P) -> TPSResult<()>
    where P: AsRef<Path>
    {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let meta = TPSMeta {
            rows: self.rows(),
            cols: self.cols(),
            phys_dims: self.tensors.iter().map(|ts| ts.len()).collect(),
        };
        fs::write(dir.join("meta.json"), serde_json::to_string(&meta)?)?;
        for (site, ts) in self.tensors.indexed_iter() {
            for (b, t) in ts.iter().enumerate() {
                let file = fs::File::create(Self::tensor_path(dir, site, b))?;
                serde_json::to_writer(io::BufWriter::new(file), t)?;
            }
        }
        Ok(())
    }

    /// Read a state written by [`dump`][Self::dump].
    pub fn load<P>(dir: P) -> TPSResult<Self>
    where P: AsRef<Path>
    {
        let dir = dir.as_ref();
        let meta: TPSMeta
            = serde_json::from_str(&fs::read_to_string(dir.join("meta.json"))?)?;
        if meta.rows * meta.cols != meta.phys_dims.len() {
            return Err(BadMetadata(meta.rows * meta.cols, meta.phys_dims.len()));
        }
        let mut data: Vec<Vec<nd::Array4<f64>>> = Vec::with_capacity(meta.phys_dims.len());
        for (k, d) in meta.phys_dims.iter().enumerate() {
            let site = SiteIdx(k / meta.cols, k % meta.cols);
            let ts = (0..*d)
                .map(|b| {
                    let file = fs::File::open(Self::tensor_path(dir, site, b))?;
                    let t: nd::Array4<f64>
                        = serde_json::from_reader(io::BufReader::new(file))?;
                    Ok(t)
                })
                .collect::<TPSResult<Vec<_>>>()?;
            data.push(ts);
        }
        let tensors = Grid::from_vec(meta.rows, meta.cols, data)
            .ok_or(BadMetadata(meta.rows * meta.cols, meta.phys_dims.len()))?;
        Self::from_grid(tensors)
    }
}
