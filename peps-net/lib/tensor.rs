//! Dense tensor primitives backing the boundary contraction engine.
//!
//! Tensors are plain `ndarray` arrays of `f64` with positional legs. Pairwise
//! contractions go through [`tensordot`], which permutes both operands so that
//! the paired legs meet in a single matrix product; singular value
//! decompositions are delegated to `nalgebra`.
//!
//! ```text
//!   a[i, j, k] · b[k, l]   ==   tensordot(a, b, &[2], &[0])[i, j, l]
//! ```

use std::ops::Add;
use nalgebra as na;
use ndarray as nd;
use serde::{ Deserialize, Serialize };
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorError {
    /// Returned when a contraction pairs legs of different dimensions.
    #[error("error in contraction: leg {0} of dimension {1} paired with leg {2} of dimension {3}")]
    LegMismatch(usize, usize, usize, usize),

    /// Returned when a contraction pairs unequal numbers of legs.
    #[error("error in contraction: {0} legs paired with {1} legs")]
    LegCountMismatch(usize, usize),

    /// Returned when a contraction names a leg that doesn't exist.
    #[error("error in contraction: no leg {0} on a tensor of rank {1}")]
    InvalidLeg(usize, usize),

    /// Returned when a reshape doesn't preserve the element count.
    #[error("shape error: {0}")]
    Shape(#[from] nd::ShapeError),

    /// Returned when a line of site tensors doesn't match the length of the
    /// boundary absorbing it.
    #[error("error in absorption: line of length {0} against a boundary of length {1}")]
    LineLengthMismatch(usize, usize),

    /// Returned when the SVD routine fails to produce singular vectors.
    #[error("error in svd: decomposition did not produce singular vectors")]
    SvdFailure,
}
use TensorError::*;
pub type TensorResult<T> = Result<T, TensorError>;

/// Flatten a tensor (in logical order) into a matrix.
fn matricize(arr: nd::ArrayViewD<'_, f64>, rows: usize, cols: usize)
    -> TensorResult<nd::Array2<f64>>
{
    let data: Vec<f64> = arr.iter().copied().collect();
    Ok(nd::Array2::from_shape_vec((rows, cols), data)?)
}

/// Contract legs `axes_a` of `a` with legs `axes_b` of `b`.
///
/// The remaining legs of `a` come first in the result, in their original
/// order, followed by the remaining legs of `b`.
pub fn tensordot<S1, S2, D1, D2>(
    a: &nd::ArrayBase<S1, D1>,
    b: &nd::ArrayBase<S2, D2>,
    axes_a: &[usize],
    axes_b: &[usize],
) -> TensorResult<nd::ArrayD<f64>>
where
    S1: nd::Data<Elem = f64>,
    S2: nd::Data<Elem = f64>,
    D1: nd::Dimension,
    D2: nd::Dimension,
{
    if axes_a.len() != axes_b.len() {
        return Err(LegCountMismatch(axes_a.len(), axes_b.len()));
    }
    let a = a.view().into_dyn();
    let b = b.view().into_dyn();
    let sh_a: Vec<usize> = a.shape().to_vec();
    let sh_b: Vec<usize> = b.shape().to_vec();
    for (&ka, &kb) in axes_a.iter().zip(axes_b) {
        if ka >= sh_a.len() { return Err(InvalidLeg(ka, sh_a.len())); }
        if kb >= sh_b.len() { return Err(InvalidLeg(kb, sh_b.len())); }
        if sh_a[ka] != sh_b[kb] {
            return Err(LegMismatch(ka, sh_a[ka], kb, sh_b[kb]));
        }
    }
    let free_a: Vec<usize>
        = (0..sh_a.len()).filter(|k| !axes_a.contains(k)).collect();
    let free_b: Vec<usize>
        = (0..sh_b.len()).filter(|k| !axes_b.contains(k)).collect();
    let m: usize = free_a.iter().map(|k| sh_a[*k]).product();
    let n: usize = free_b.iter().map(|k| sh_b[*k]).product();
    let inner: usize = axes_a.iter().map(|k| sh_a[*k]).product();
    let perm_a: Vec<usize> = free_a.iter().chain(axes_a).copied().collect();
    let perm_b: Vec<usize> = axes_b.iter().chain(free_b.iter()).copied().collect();
    let mat_a = matricize(a.permuted_axes(perm_a), m, inner)?;
    let mat_b = matricize(b.permuted_axes(perm_b), inner, n)?;
    let shape: Vec<usize>
        = free_a.iter().map(|k| sh_a[*k])
        .chain(free_b.iter().map(|k| sh_b[*k]))
        .collect();
    Ok(mat_a.dot(&mat_b).into_shape(shape)?)
}

/// Frobenius norm of any tensor.
#[inline]
pub fn frobenius_norm<S, D>(arr: &nd::ArrayBase<S, D>) -> f64
where
    S: nd::Data<Elem = f64>,
    D: nd::Dimension,
{
    arr.iter().map(|x| x * x).fold(0.0, Add::add).sqrt()
}

/// Euclidean inner product of two tensors of identical shape.
#[inline]
pub fn inner<S1, S2, D>(a: &nd::ArrayBase<S1, D>, b: &nd::ArrayBase<S2, D>)
    -> f64
where
    S1: nd::Data<Elem = f64>,
    S2: nd::Data<Elem = f64>,
    D: nd::Dimension,
{
    debug_assert_eq!(a.shape(), b.shape());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).fold(0.0, Add::add)
}

/// Clamp the magnitude of every element to at most `bound`, keeping signs.
#[inline]
pub fn bound_elements<S, D>(arr: &mut nd::ArrayBase<S, D>, bound: f64)
where
    S: nd::DataMut<Elem = f64>,
    D: nd::Dimension,
{
    let bound = bound.abs();
    arr.map_inplace(|x| { *x = x.clamp(-bound, bound); });
}

/// Return `true` if every element is exactly zero, i.e. the tensor carries no
/// allowed block.
#[inline]
pub fn is_null<S, D>(arr: &nd::ArrayBase<S, D>) -> bool
where
    S: nd::Data<Elem = f64>,
    D: nd::Dimension,
{
    arr.iter().all(|x| *x == 0.0)
}

/// Bond dimension bounds and truncation error threshold shared by every
/// boundary-MPS compression.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TruncatePara {
    /// Lower bound on kept bond dimensions.
    #[serde(rename = "Dmin")]
    pub d_min: usize,
    /// Upper bound on kept bond dimensions.
    #[serde(rename = "Dmax")]
    pub d_max: usize,
    /// Maximum discarded weight, relative to the total squared singular
    /// values.
    pub trunc_err: f64,
}

impl TruncatePara {
    pub fn new(d_min: usize, d_max: usize, trunc_err: f64) -> Self {
        Self { d_min, d_max, trunc_err }
    }

    /// Number of singular values to keep out of `svals`, assumed sorted in
    /// descending order.
    pub fn keep_dim(&self, svals: &[f64]) -> usize {
        let n = svals.len();
        if n == 0 { return 0; }
        let total: f64 = svals.iter().map(|s| s * s).fold(0.0, Add::add);
        let mut keep = n;
        if total > 0.0 {
            let mut discarded: f64 = 0.0;
            while keep > 1 {
                let s = svals[keep - 1];
                if (discarded + s * s) / total > self.trunc_err { break; }
                discarded += s * s;
                keep -= 1;
            }
        }
        keep.max(self.d_min).min(self.d_max).min(n).max(1)
    }
}

/// Thin singular value decomposition `m = u · diag(s) · vt` with `s` sorted
/// in descending order.
#[derive(Clone, Debug)]
pub struct Svd {
    pub u: nd::Array2<f64>,
    pub s: Vec<f64>,
    pub vt: nd::Array2<f64>,
}

impl Svd {
    /// Number of singular values held.
    pub fn rank(&self) -> usize { self.s.len() }

    /// Discard all but the leading `keep` singular triplets.
    pub fn truncate(self, keep: usize) -> Self {
        let keep = keep.min(self.s.len());
        let Self { u, mut s, vt } = self;
        s.truncate(keep);
        let u = u.slice(nd::s![.., ..keep]).to_owned();
        let vt = vt.slice(nd::s![..keep, ..]).to_owned();
        Self { u, s, vt }
    }

    /// Return `diag(s) · vt`.
    pub fn svt(&self) -> nd::Array2<f64> {
        let mut svt = self.vt.clone();
        svt.outer_iter_mut().zip(&self.s)
            .for_each(|(mut row, sv)| { row.map_inplace(|x| { *x *= sv; }); });
        svt
    }

    /// Return `u · diag(s)`.
    pub fn us(&self) -> nd::Array2<f64> {
        let mut us = self.u.clone();
        us.axis_iter_mut(nd::Axis(1)).zip(&self.s)
            .for_each(|(mut col, sv)| { col.map_inplace(|x| { *x *= sv; }); });
        us
    }
}

/// Compute the thin SVD of a matrix.
pub fn svd(m: &nd::Array2<f64>) -> TensorResult<Svd> {
    let (rows, cols) = m.dim();
    let mat: na::DMatrix<f64> = na::DMatrix::from_fn(rows, cols, |i, j| m[[i, j]]);
    let decomp = mat.svd(true, true);
    let (Some(u), Some(v_t)) = (decomp.u, decomp.v_t) else {
        return Err(SvdFailure);
    };
    let svals = decomp.singular_values;
    let mut order: Vec<usize> = (0..svals.len()).collect();
    order.sort_by(|&i, &j| svals[j].total_cmp(&svals[i]));
    let k = order.len();
    let u_out: nd::Array2<f64>
        = nd::Array2::from_shape_fn((rows, k), |(i, a)| u[(i, order[a])]);
    let vt_out: nd::Array2<f64>
        = nd::Array2::from_shape_fn((k, cols), |(a, j)| v_t[(order[a], j)]);
    let s: Vec<f64> = order.iter().map(|a| svals[*a]).collect();
    Ok(Svd { u: u_out, s, vt: vt_out })
}
