//! Boundary matrix product states.
//!
//! A boundary MPS holds the contraction of every line of site tensors between
//! one lattice edge and the current line. Its tensors carry legs
//! `[left bond, physical, right bond]`, where the physical legs are the
//! still-open virtual legs of the last absorbed line, ordered along the line.
//!
//! Site tensors are stored as `[left, down, right, up]`. To treat all four
//! edges alike, every line is looked at in the *frame* of the edge it is
//! being absorbed from, with legs `[prev, far, next, near]`: `prev`/`next`
//! run along the line (top to bottom for columns, left to right for rows),
//! `near` points at the edge and `far` points away from it.
//!
//! ```text
//!   edge  ========= (boundary MPS, physical legs pointing down)
//!          |  |  |
//!   line  -T--T--T-   near = up, far = down   (frame of `Up`)
//!          |  |  |
//! ```

use std::ops::Index;
use ndarray as nd;
use crate::{
    lattice::BMPSPosition,
    tensor::{ self, TensorError, TensorResult, TruncatePara },
};

/// Permutation taking a site tensor `[left, down, right, up]` into the frame
/// `[prev, far, next, near]` of a boundary grown from `post`.
pub fn frame_perm(post: BMPSPosition) -> [usize; 4] {
    match post {
        BMPSPosition::Up => [0, 1, 2, 3],
        BMPSPosition::Down => [0, 3, 2, 1],
        BMPSPosition::Left => [3, 2, 1, 0],
        BMPSPosition::Right => [3, 0, 1, 2],
    }
}

/// Inverse of a leg permutation.
pub fn inverse_perm(perm: [usize; 4]) -> [usize; 4] {
    let mut inv = [0; 4];
    perm.iter().enumerate().for_each(|(i, p)| { inv[*p] = i; });
    inv
}

fn to_matrix(t: &nd::Array3<f64>, rows: usize, cols: usize)
    -> TensorResult<nd::Array2<f64>>
{
    Ok(nd::Array2::from_shape_vec((rows, cols), t.iter().copied().collect())?)
}

/// A boundary MPS.
#[derive(Clone, Debug, PartialEq)]
pub struct BMPS {
    tensors: Vec<nd::Array3<f64>>,
}

impl Index<usize> for BMPS {
    type Output = nd::Array3<f64>;

    fn index(&self, k: usize) -> &Self::Output { &self.tensors[k] }
}

impl BMPS {
    /// The trivial boundary of a line of `len` sites, before anything has been
    /// absorbed.
    pub fn vacuum(len: usize) -> Self {
        Self { tensors: vec![nd::Array3::ones((1, 1, 1)); len] }
    }

    pub fn len(&self) -> usize { self.tensors.len() }

    pub fn is_empty(&self) -> bool { self.tensors.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, nd::Array3<f64>> {
        self.tensors.iter()
    }

    /// Largest bond dimension along the chain.
    pub fn max_bond_dim(&self) -> usize {
        self.tensors.iter().map(|t| t.shape()[2]).max().unwrap_or(1)
    }

    /// Absorb a line of site tensors given in the frame of this boundary's
    /// edge, then compress the result.
    pub fn absorb(&self, line: &[nd::ArrayView4<'_, f64>], trunc: &TruncatePara)
        -> TensorResult<Self>
    {
        if line.len() != self.len() {
            return Err(TensorError::LineLengthMismatch(line.len(), self.len()));
        }
        let tensors: Vec<nd::Array3<f64>>
            = self.tensors.iter().zip(line)
            .map(|(m, t)| -> TensorResult<nd::Array3<f64>> {
                let (a, _, b) = m.dim();
                let (l, f, r, _) = t.dim();
                // (a, b, l, f, r) -> (a, l, f, b, r)
                let prod = tensor::tensordot(m, t, &[1], &[3])?;
                let data: Vec<f64>
                    = prod.view().permuted_axes(vec![0, 2, 3, 1, 4])
                    .iter().copied().collect();
                Ok(nd::Array3::from_shape_vec((a * l, f, b * r), data)?)
            })
            .collect::<TensorResult<_>>()?;
        let mut new = Self { tensors };
        new.compress(trunc)?;
        Ok(new)
    }

    /// Bring the chain into right-canonical form without truncation, then
    /// sweep back truncating every bond.
    fn compress(&mut self, trunc: &TruncatePara) -> TensorResult<()> {
        let n = self.tensors.len();
        if n < 2 { return Ok(()); }
        for j in (1..n).rev() {
            let (a, s, b) = self.tensors[j].dim();
            let dec = tensor::svd(&to_matrix(&self.tensors[j], a, s * b)?)?;
            let smax = dec.s.first().copied().unwrap_or(0.0);
            let rank
                = dec.s.iter()
                .take_while(|sv| **sv > f64::EPSILON * smax)
                .count()
                .max(1);
            let dec = dec.truncate(rank);
            let us = dec.us();
            self.tensors[j] = dec.vt.into_shape((rank, s, b))?;
            self.tensors[j - 1]
                = tensor::tensordot(&self.tensors[j - 1], &us, &[2], &[0])?
                .into_dimensionality::<nd::Ix3>()?;
        }
        for j in 0..n - 1 {
            let (a, s, b) = self.tensors[j].dim();
            let dec = tensor::svd(&to_matrix(&self.tensors[j], a * s, b)?)?;
            let keep = trunc.keep_dim(&dec.s);
            let dec = dec.truncate(keep);
            let svt = dec.svt();
            self.tensors[j] = dec.u.into_shape((a, s, keep))?;
            self.tensors[j + 1]
                = tensor::tensordot(&svt, &self.tensors[j + 1], &[1], &[0])?
                .into_dimensionality::<nd::Ix3>()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use itertools::Itertools;
    use rand::{ Rng, SeedableRng, rngs::StdRng };

    fn dense(mps: &BMPS) -> nd::ArrayD<f64> {
        let mut acc: nd::ArrayD<f64> = mps[0].clone().into_dyn();
        for j in 1..mps.len() {
            let last = acc.ndim() - 1;
            acc = tensor::tensordot(&acc, &mps[j], &[last], &[0]).unwrap();
        }
        acc
    }

    fn random_row(rng: &mut StdRng, d: usize) -> Vec<nd::Array4<f64>> {
        vec![
            nd::Array4::from_shape_simple_fn((1, d, d, 1), || rng.gen_range(-1.0..1.0)),
            nd::Array4::from_shape_simple_fn((d, d, d, 1), || rng.gen_range(-1.0..1.0)),
            nd::Array4::from_shape_simple_fn((d, d, 1, 1), || rng.gen_range(-1.0..1.0)),
        ]
    }

    #[test]
    fn frames_invert() {
        for post in BMPSPosition::ALL {
            let perm = frame_perm(post);
            let inv = inverse_perm(perm);
            for k in 0..4 { assert_eq!(perm[inv[k]], k); }
        }
    }

    #[test]
    fn absorb_is_exact_without_truncation() {
        let mut rng = StdRng::seed_from_u64(11);
        let row = random_row(&mut rng, 2);
        let views: Vec<nd::ArrayView4<f64>> = row.iter().map(|t| t.view()).collect();
        let trunc = TruncatePara::new(1, 64, 0.0);
        let mps = BMPS::vacuum(3).absorb(&views, &trunc).unwrap();
        let full = dense(&mps);
        assert_eq!(full.shape(), &[1, 2, 2, 2, 1]);
        for (d0, d1, d2) in (0..2).cartesian_product(0..2).cartesian_product(0..2)
            .map(|((a, b), c)| (a, b, c))
        {
            let expected: f64
                = (0..2).cartesian_product(0..2)
                .map(|(x, y)| {
                    row[0][[0, d0, x, 0]] * row[1][[x, d1, y, 0]] * row[2][[y, d2, 0, 0]]
                })
                .sum();
            assert_relative_eq!(full[[0, d0, d1, d2, 0]], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn absorb_rejects_line_of_wrong_length() {
        let mut rng = StdRng::seed_from_u64(13);
        let row = random_row(&mut rng, 2);
        let views: Vec<nd::ArrayView4<f64>> = row.iter().map(|t| t.view()).collect();
        let err = BMPS::vacuum(4)
            .absorb(&views, &TruncatePara::new(1, 8, 0.0))
            .unwrap_err();
        assert!(matches!(err, TensorError::LineLengthMismatch(3, 4)));
    }

    #[test]
    fn absorb_truncates_bond_dimension() {
        let mut rng = StdRng::seed_from_u64(12);
        let row = random_row(&mut rng, 3);
        let views: Vec<nd::ArrayView4<f64>> = row.iter().map(|t| t.view()).collect();
        let mps = BMPS::vacuum(3)
            .absorb(&views, &TruncatePara::new(1, 2, 0.0))
            .unwrap();
        assert!(mps.max_bond_dim() <= 2);
        let exact = BMPS::vacuum(3)
            .absorb(&views, &TruncatePara::new(1, 64, 0.0))
            .unwrap();
        assert_eq!(exact.max_bond_dim(), 3);
        let (n_trunc, n_exact) = (tensor::frobenius_norm(&dense(&mps)), tensor::frobenius_norm(&dense(&exact)));
        assert!(n_trunc <= n_exact + 1e-10);
    }
}
