//! Single-layer 2D tensor network for one configuration, contracted with
//! boundary MPS.
//!
//! A [`TensorNetwork2D`] holds the site tensors selected by a configuration and
//! two kinds of cached partial contractions:
//!
//! - Boundary MPS stacks, one per lattice edge. Entry `k` of the stack for an
//!   edge is the boundary after absorbing the `k` lines closest to that edge
//!   (entry 0 is the vacuum). `Up`/`Down` absorb rows; `Left`/`Right` absorb
//!   columns.
//! - Partial boundary tensors ("BTen") along one line that is sandwiched
//!   between two boundary MPS. Entry `k` of the stack for an end of the line is
//!   the environment after absorbing the `k` sites closest to that end.
//!   `Left`/`Right` run along rows; `Up`/`Down` run along columns.
//!
//! A BTen environment is a rank-3 tensor `[a, t, b]` whose legs connect to the
//! boundary MPS on the `Up` (rows) or `Left` (columns) side, to the line
//! itself, and to the boundary MPS on the opposite side.
//!
//! Caches are rebuilt wholesale by [`generate_bmps_approach`], which is the only
//! way to start a sweep in a new direction. Within a sweep,
//! [`bmps_move_step`] and [`bten_move_step`] slide the caches one line or one
//! site at a time. Amplitude queries never mutate the caches: environments that
//! aren't cached are contracted on the fly from the deepest cached one.
//!
//! Sites updated through [`update_site_config`] must not lie inside any cached
//! environment that is read afterward; sweeps guarantee this by only updating
//! sites in the window between the two BTen stacks.
//!
//! [`generate_bmps_approach`]: TensorNetwork2D::generate_bmps_approach
//! [`bmps_move_step`]: TensorNetwork2D::bmps_move_step
//! [`bten_move_step`]: TensorNetwork2D::bten_move_step
//! [`update_site_config`]: TensorNetwork2D::update_site_config

use ndarray as nd;
use thiserror::Error;
use crate::{
    bmps::{ BMPS, frame_perm, inverse_perm },
    configuration::Configuration,
    lattice::{ BMPSPosition, BondOrientation, Grid, SiteIdx },
    tensor::{ self, TensorError, TruncatePara },
    tps::SplitIndexTPS,
};

#[derive(Debug, Error)]
pub enum TNError {
    /// Returned when a contraction needs a boundary MPS layer that hasn't been
    /// grown.
    #[error("boundary MPS from {post:?} does not reach line {line}")]
    BoundaryNotReady { post: BMPSPosition, line: usize },

    /// Returned when moving boundaries before any approach was generated.
    #[error("no boundary approach has been generated")]
    NoApproach,

    /// Returned when a two-site query is given sites that aren't adjacent along
    /// the requested orientation.
    #[error("sites {0:?} and {1:?} are not nearest neighbors along {2:?}")]
    NotNeighbors(SiteIdx, SiteIdx, BondOrientation),

    /// Returned when a local tensor replacement is requested at a position
    /// outside the line.
    #[error("position {0} is outside a line of length {1}")]
    OutOfLine(usize, usize),

    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}
use TNError::*;
pub type TNResult<T> = Result<T, TNError>;

/// Validity of the boundary MPS caches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoundaryState {
    /// Nothing cached.
    Unset,
    /// Boundaries positioned to contract `line` (counted in lattice
    /// coordinates) in a sweep that started at `edge`.
    Approach { edge: BMPSPosition, line: usize },
}

/// Edge whose boundary MPS sits on the head side of lines of the given
/// orientation, and the BTen ends along such lines, as `(bmps_a, bmps_b,
/// bten_head, bten_tail)`.
fn line_posts(orient: BondOrientation)
    -> (BMPSPosition, BMPSPosition, BMPSPosition, BMPSPosition)
{
    match orient {
        BondOrientation::Horizontal
            => (BMPSPosition::Up, BMPSPosition::Down, BMPSPosition::Left, BMPSPosition::Right),
        BondOrientation::Vertical
            => (BMPSPosition::Left, BMPSPosition::Right, BMPSPosition::Up, BMPSPosition::Down),
    }
}

fn vacuum_env() -> nd::Array3<f64> { nd::Array3::ones((1, 1, 1)) }

fn to_ix3(arr: nd::ArrayD<f64>) -> TNResult<nd::Array3<f64>> {
    Ok(arr.into_dimensionality::<nd::Ix3>().map_err(TensorError::from)?)
}

/// Everything needed to contract across one line: the two boundary MPS
/// sandwiching it and the line's site tensors in the frame of the first one.
struct LineEnv<'a> {
    a: &'a BMPS,
    b: &'a BMPS,
    sites: Vec<nd::ArrayView4<'a, f64>>,
}

impl<'a> LineEnv<'a> {
    fn len(&self) -> usize { self.sites.len() }

    /// Absorb position `p` into an environment covering `0..p`.
    fn head_step<'b>(
        &'b self,
        env: &nd::Array3<f64>,
        p: usize,
        site: Option<nd::ArrayView4<'b, f64>>,
    ) -> TNResult<nd::Array3<f64>>
    {
        let t = site.unwrap_or_else(|| self.sites[p].view());
        // (a, t, b) . A(a, x, a') -> (t, b, x, a')
        let x = tensor::tensordot(env, &self.a[p], &[0], &[0])?;
        // . T(t, y, t', x) -> (b, a', y, t')
        let y = tensor::tensordot(&x, &t, &[0, 2], &[0, 3])?;
        // . B(b, y, b') -> (a', t', b')
        let z = tensor::tensordot(&y, &self.b[p], &[0, 2], &[0, 1])?;
        to_ix3(z)
    }

    /// Absorb position `p` into an environment covering `p + 1..`.
    fn tail_step(&self, env: &nd::Array3<f64>, p: usize) -> TNResult<nd::Array3<f64>> {
        // A(a, x, a') . (a', t', b') -> (a, x, t', b')
        let x = tensor::tensordot(&self.a[p], env, &[2], &[0])?;
        // . T(t, y, t', x) -> (a, b', t, y)
        let y = tensor::tensordot(&x, &self.sites[p], &[1, 2], &[3, 2])?;
        // . B(b, y, b') -> (a, t, b)
        let z = tensor::tensordot(&y, &self.b[p], &[1, 3], &[2, 1])?;
        to_ix3(z)
    }

    /// Environment of position `p` in the frame `[prev, far, next, near]`.
    fn hole(&self, left: &nd::Array3<f64>, right: &nd::Array3<f64>, p: usize)
        -> TNResult<nd::Array4<f64>>
    {
        // (a, t, b) . A(a, x, a') -> (t, b, x, a')
        let x = tensor::tensordot(left, &self.a[p], &[0], &[0])?;
        // . B(b, y, b') -> (t, x, a', y, b')
        let y = tensor::tensordot(&x, &self.b[p], &[1], &[0])?;
        // . (a', t', b') -> (t, x, y, t')
        let z = tensor::tensordot(&y, right, &[2, 4], &[0, 2])?;
        let frame: nd::Array4<f64>
            = z.into_dimensionality::<nd::Ix4>().map_err(TensorError::from)?
            .permuted_axes([0, 2, 3, 1]);
        Ok(frame)
    }
}

/// A single-layer tensor network with boundary-MPS caches.
#[derive(Clone, Debug)]
pub struct TensorNetwork2D {
    tensors: Grid<nd::Array4<f64>>,
    bmps: [Vec<BMPS>; 4],
    bten: [Vec<nd::Array3<f64>>; 4],
    bten_line: Option<(BondOrientation, usize)>,
    state: BoundaryState,
    trunc: TruncatePara,
}

impl TensorNetwork2D {
    /// Select the site tensors of `sitps` picked out by `config`.
    pub fn new(sitps: &SplitIndexTPS, config: &Configuration, trunc: TruncatePara)
        -> Self
    {
        let tensors = Grid::from_fn(sitps.rows(), sitps.cols(), |site| {
            sitps[site][config[site]].clone()
        });
        Self {
            tensors,
            bmps: Default::default(),
            bten: Default::default(),
            bten_line: None,
            state: BoundaryState::Unset,
            trunc,
        }
    }

    pub fn rows(&self) -> usize { self.tensors.rows() }

    pub fn cols(&self) -> usize { self.tensors.cols() }

    pub fn state(&self) -> BoundaryState { self.state }

    pub fn trunc_para(&self) -> &TruncatePara { &self.trunc }

    /// Change the truncation parameters, dropping every cache.
    pub fn set_trunc_para(&mut self, trunc: TruncatePara) {
        self.trunc = trunc;
        self.clear_caches();
    }

    pub fn tensor(&self, site: SiteIdx) -> &nd::Array4<f64> { &self.tensors[site] }

    /// Cached boundary MPS layers grown from `post`.
    pub fn bmps(&self, post: BMPSPosition) -> &[BMPS] { &self.bmps[post.index()] }

    /// Cached BTen environments grown from `post`.
    pub fn bten(&self, post: BMPSPosition) -> &[nd::Array3<f64>] {
        &self.bten[post.index()]
    }

    fn clear_caches(&mut self) {
        self.bmps.iter_mut().for_each(|stack| { stack.clear(); });
        self.bten.iter_mut().for_each(|stack| { stack.clear(); });
        self.bten_line = None;
        self.state = BoundaryState::Unset;
    }

    /// Number of sites along a line of the given orientation.
    fn line_len(&self, orient: BondOrientation) -> usize {
        match orient {
            BondOrientation::Horizontal => self.cols(),
            BondOrientation::Vertical => self.rows(),
        }
    }

    /// Number of lines of the given orientation.
    fn num_lines(&self, orient: BondOrientation) -> usize {
        match orient {
            BondOrientation::Horizontal => self.rows(),
            BondOrientation::Vertical => self.cols(),
        }
    }

    /// Lattice index of the `k`-th line absorbed from `post`.
    fn absorbed_line(&self, post: BMPSPosition, k: usize) -> usize {
        let n = self.num_lines(post.absorbed_lines());
        if post.is_head() { k } else { n - 1 - k }
    }

    /// Site tensors of one line in the frame of `post`.
    fn line_frame(&self, post: BMPSPosition, line: usize) -> Vec<nd::ArrayView4<'_, f64>> {
        let orient = post.absorbed_lines();
        let perm = frame_perm(post);
        (0..self.line_len(orient))
            .map(|p| {
                self.tensors[SiteIdx::from_line_pos(orient, line, p)]
                    .view()
                    .permuted_axes(perm)
            })
            .collect()
    }

    fn reset_bmps(&mut self, post: BMPSPosition) {
        let len = self.line_len(post.absorbed_lines());
        self.bmps[post.index()] = vec![BMPS::vacuum(len)];
    }

    /// Absorb the next line into the boundary grown from `post`. Does nothing
    /// if every line has already been absorbed.
    fn grow_bmps_step(&mut self, post: BMPSPosition) -> TNResult<()> {
        if self.bmps[post.index()].is_empty() { self.reset_bmps(post); }
        let absorbed = self.bmps[post.index()].len() - 1;
        if absorbed >= self.num_lines(post.absorbed_lines()) { return Ok(()); }
        let line = self.absorbed_line(post, absorbed);
        let next = {
            let frame = self.line_frame(post, line);
            let last = &self.bmps[post.index()][absorbed];
            last.absorb(&frame, &self.trunc)?
        };
        self.bmps[post.index()].push(next);
        Ok(())
    }

    /// Drop every cached layer and rebuild boundaries so that the line
    /// closest to `post` can be contracted: the boundary from `post` is reset
    /// to the vacuum and the boundary from the opposite edge is grown over all
    /// remaining lines.
    pub fn generate_bmps_approach(&mut self, post: BMPSPosition) -> TNResult<()> {
        self.clear_caches();
        BMPSPosition::ALL.into_iter().for_each(|p| { self.reset_bmps(p); });
        let opp = post.opposite();
        let n = self.num_lines(post.absorbed_lines());
        while self.bmps[opp.index()].len() < n {
            self.grow_bmps_step(opp)?;
        }
        self.state = BoundaryState::Approach {
            edge: post,
            line: self.absorbed_line(post, 0),
        };
        Ok(())
    }

    /// Slide the boundaries one line toward `direction`: the boundary from the
    /// opposite edge absorbs the current line and the boundary from
    /// `direction` releases its innermost layer.
    pub fn bmps_move_step(&mut self, direction: BMPSPosition) -> TNResult<()> {
        let BoundaryState::Approach { edge, .. } = self.state else {
            return Err(NoApproach);
        };
        let from = direction.opposite();
        let n = self.num_lines(direction.absorbed_lines());
        self.grow_bmps_step(from)?;
        let current = (self.bmps[from.index()].len() - 1).min(n - 1);
        self.bmps[direction.index()].truncate(n - current);
        self.bten.iter_mut().for_each(|stack| { stack.clear(); });
        self.bten_line = None;
        self.state = BoundaryState::Approach {
            edge,
            line: self.absorbed_line(from, current),
        };
        Ok(())
    }

    /// Release every layer of the boundary from `post` except the vacuum.
    pub fn delete_inner_bmps(&mut self, post: BMPSPosition) {
        if self.bmps[post.index()].is_empty() {
            self.reset_bmps(post);
        } else {
            self.bmps[post.index()].truncate(1);
        }
    }

    /// Pair of boundary MPS sandwiching a line, with the line's site tensors.
    fn line_env(&self, orient: BondOrientation, line: usize) -> TNResult<LineEnv<'_>> {
        let (post_a, post_b, _, _) = line_posts(orient);
        let n = self.num_lines(orient);
        let a = self.bmps[post_a.index()].get(line)
            .ok_or(BoundaryNotReady { post: post_a, line })?;
        let b = self.bmps[post_b.index()].get(n - 1 - line)
            .ok_or(BoundaryNotReady { post: post_b, line })?;
        Ok(LineEnv { a, b, sites: self.line_frame(post_a, line) })
    }

    /// Cached BTen environments from `post` if they belong to the given line.
    fn cached_bten(&self, post: BMPSPosition, orient: BondOrientation, line: usize)
        -> &[nd::Array3<f64>]
    {
        if self.bten_line == Some((orient, line)) {
            &self.bten[post.index()]
        } else {
            &[]
        }
    }

    /// Environment of the sites `0..p` along a line.
    fn left_env(&self, env: &LineEnv<'_>, orient: BondOrientation, line: usize, p: usize)
        -> TNResult<nd::Array3<f64>>
    {
        let (_, _, head, _) = line_posts(orient);
        let cache = self.cached_bten(head, orient, line);
        if let Some(e) = cache.get(p) { return Ok(e.clone()); }
        let (mut acc, mut k) = match cache.last() {
            Some(e) => (e.clone(), cache.len() - 1),
            None => (vacuum_env(), 0),
        };
        while k < p {
            acc = env.head_step(&acc, k, None)?;
            k += 1;
        }
        Ok(acc)
    }

    /// Environment of the sites `p + 1..` along a line.
    fn right_env(&self, env: &LineEnv<'_>, orient: BondOrientation, line: usize, p: usize)
        -> TNResult<nd::Array3<f64>>
    {
        let (_, _, _, tail) = line_posts(orient);
        let n = env.len();
        let cache = self.cached_bten(tail, orient, line);
        if let Some(e) = cache.get(n - 1 - p) { return Ok(e.clone()); }
        let (mut acc, mut covered) = match cache.last() {
            Some(e) => (e.clone(), cache.len() - 1),
            None => (vacuum_env(), 0),
        };
        while covered < n - 1 - p {
            acc = env.tail_step(&acc, n - 1 - covered)?;
            covered += 1;
        }
        Ok(acc)
    }

    /// Reset the BTen stack at `post` to the vacuum for the given line.
    ///
    /// Moving to a different line also drops the stack at the opposite end.
    pub fn init_bten(&mut self, post: BMPSPosition, line: usize) {
        let key = (post.bten_lines(), line);
        if self.bten_line != Some(key) {
            self.bten.iter_mut().for_each(|stack| { stack.clear(); });
            self.bten_line = Some(key);
        }
        self.bten[post.index()] = vec![vacuum_env()];
    }

    /// Absorb one more site into the BTen stack at `post`. Does nothing if the
    /// whole line is already absorbed.
    pub fn grow_bten_step(&mut self, post: BMPSPosition) -> TNResult<()> {
        let orient = post.bten_lines();
        let Some((o, line)) = self.bten_line else { return Err(NoApproach); };
        if o != orient { return Err(NoApproach); }
        if self.bten[post.index()].is_empty() { self.bten[post.index()].push(vacuum_env()); }
        let absorbed = self.bten[post.index()].len() - 1;
        let n = self.line_len(orient);
        if absorbed >= n { return Ok(()); }
        let next = {
            let env = self.line_env(orient, line)?;
            let last = &self.bten[post.index()][absorbed];
            if post.is_head() {
                env.head_step(last, absorbed, None)?
            } else {
                env.tail_step(last, n - 1 - absorbed)?
            }
        };
        self.bten[post.index()].push(next);
        Ok(())
    }

    /// Grow the BTen stack at `post` along `line` until all but `remain` sites
    /// are absorbed, starting over from the vacuum if `reset` is set or the
    /// stack belongs to another line.
    pub fn grow_full_bten(
        &mut self,
        post: BMPSPosition,
        line: usize,
        remain: usize,
        reset: bool,
    ) -> TNResult<()>
    {
        let orient = post.bten_lines();
        if reset
            || self.bten_line != Some((orient, line))
            || self.bten[post.index()].is_empty()
        {
            self.init_bten(post, line);
        }
        let target = self.line_len(orient).saturating_sub(remain);
        while self.bten[post.index()].len() - 1 < target {
            self.grow_bten_step(post)?;
        }
        Ok(())
    }

    /// Slide the BTen window one site toward `direction`: the stack at the
    /// opposite end absorbs a site and the stack at `direction` releases its
    /// innermost environment.
    pub fn bten_move_step(&mut self, direction: BMPSPosition) -> TNResult<()> {
        self.grow_bten_step(direction.opposite())?;
        let stack = &mut self.bten[direction.index()];
        if stack.len() > 1 { stack.pop(); }
        Ok(())
    }

    /// Keep only the first `len` environments (at least the vacuum) of the
    /// BTen stack at `post`.
    pub fn truncate_bten(&mut self, post: BMPSPosition, len: usize) {
        self.bten[post.index()].truncate(len.max(1));
    }

    /// Contract a line with some of its site tensors replaced. Replacement
    /// tensors are given as `(position along the line, tensor)` in the usual
    /// `[left, down, right, up]` leg order.
    pub fn replace_trace(
        &self,
        orient: BondOrientation,
        line: usize,
        replacements: &[(usize, &nd::Array4<f64>)],
    ) -> TNResult<f64>
    {
        let env = self.line_env(orient, line)?;
        let n = env.len();
        if let Some((p, _)) = replacements.iter().find(|(p, _)| *p >= n) {
            return Err(OutOfLine(*p, n));
        }
        let start = replacements.iter().map(|(p, _)| *p).min().unwrap_or(0);
        let end = replacements.iter().map(|(p, _)| *p).max().unwrap_or(0);
        let (post_a, ..) = line_posts(orient);
        let perm = frame_perm(post_a);
        let mut acc = self.left_env(&env, orient, line, start)?;
        for p in start..=end {
            let replaced: Option<nd::ArrayView4<f64>>
                = replacements.iter()
                .find(|(q, _)| *q == p)
                .map(|(_, t)| t.view().permuted_axes(perm));
            acc = env.head_step(&acc, p, replaced)?;
        }
        let right = self.right_env(&env, orient, line, end)?;
        Ok(tensor::inner(&acc, &right))
    }

    /// Amplitude of the network, contracted across the line through `site`.
    pub fn trace(&self, site: SiteIdx, orient: BondOrientation) -> TNResult<f64> {
        let p = site.pos(orient);
        let line = site.line(orient);
        let env = self.line_env(orient, line)?;
        let mut acc = self.left_env(&env, orient, line, p)?;
        acc = env.head_step(&acc, p, None)?;
        let right = self.right_env(&env, orient, line, p)?;
        Ok(tensor::inner(&acc, &right))
    }

    /// Amplitude with the tensor at `site` replaced.
    pub fn replace_one_site_trace(
        &self,
        site: SiteIdx,
        replacement: &nd::Array4<f64>,
        orient: BondOrientation,
    ) -> TNResult<f64>
    {
        self.replace_trace(orient, site.line(orient), &[(site.pos(orient), replacement)])
    }

    /// Amplitude with the tensors at two neighboring sites replaced; `site2`
    /// must follow `site1` along `orient`.
    pub fn replace_nn_site_trace(
        &self,
        site1: SiteIdx,
        site2: SiteIdx,
        orient: BondOrientation,
        replacement1: &nd::Array4<f64>,
        replacement2: &nd::Array4<f64>,
    ) -> TNResult<f64>
    {
        if site1.line(orient) != site2.line(orient)
            || site1.pos(orient) + 1 != site2.pos(orient)
        {
            return Err(NotNeighbors(site1, site2, orient));
        }
        self.replace_trace(
            orient,
            site1.line(orient),
            &[(site1.pos(orient), replacement1), (site2.pos(orient), replacement2)],
        )
    }

    /// Contraction of the whole network except the tensor at `site`, with legs
    /// in the site tensor order `[left, down, right, up]`. Contracting the hole
    /// with the site tensor gives back the amplitude.
    pub fn punch_hole(&self, site: SiteIdx, orient: BondOrientation)
        -> TNResult<nd::Array4<f64>>
    {
        let p = site.pos(orient);
        let line = site.line(orient);
        let env = self.line_env(orient, line)?;
        let left = self.left_env(&env, orient, line, p)?;
        let right = self.right_env(&env, orient, line, p)?;
        let (post_a, ..) = line_posts(orient);
        let inv = inverse_perm(frame_perm(post_a));
        let hole = env.hole(&left, &right, p)?.permuted_axes(inv);
        Ok(hole.as_standard_layout().into_owned())
    }

    /// Swap in the tensor for a new local basis value at `site`.
    pub fn update_site_config(&mut self, site: SiteIdx, basis: usize, sitps: &SplitIndexTPS) {
        self.tensors[site] = sitps[site][basis].clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use itertools::Itertools;
    use rand::{ SeedableRng, rngs::StdRng };

    /// Sum over every assignment of bond indices.
    fn brute_force(tensors: &Grid<nd::Array4<f64>>) -> f64 {
        let (rows, cols) = (tensors.rows(), tensors.cols());
        let mut bonds: Vec<(SiteIdx, usize)> = Vec::new(); // (site, 2 = right | 1 = down)
        for site in tensors.sites() {
            if site.1 + 1 < cols { bonds.push((site, 2)); }
            if site.0 + 1 < rows { bonds.push((site, 1)); }
        }
        let dims: Vec<usize> = bonds.iter().map(|(s, leg)| tensors[*s].shape()[*leg]).collect();
        dims.iter().map(|d| 0..*d).multi_cartesian_product()
            .map(|assign| {
                let bond = |site: SiteIdx, leg: usize| -> usize {
                    bonds.iter().position(|b| *b == (site, leg))
                        .map(|k| assign[k])
                        .unwrap_or(0)
                };
                tensors.sites()
                    .map(|site| {
                        let SiteIdx(r, c) = site;
                        let l = if c > 0 { bond(SiteIdx(r, c - 1), 2) } else { 0 };
                        let u = if r > 0 { bond(SiteIdx(r - 1, c), 1) } else { 0 };
                        tensors[site][[l, bond(site, 1), bond(site, 2), u]]
                    })
                    .product::<f64>()
            })
            .sum()
    }

    fn network(rows: usize, cols: usize, seed: u64) -> (SplitIndexTPS, Configuration, TensorNetwork2D) {
        let mut rng = StdRng::seed_from_u64(seed);
        let sitps = SplitIndexTPS::random(rows, cols, 2, 2, &mut rng).unwrap();
        let n = rows * cols;
        let config = Configuration::random(rows, cols, &[n / 2, n - n / 2], &mut rng).unwrap();
        let tn = TensorNetwork2D::new(&sitps, &config, TruncatePara::new(1, 64, 0.0));
        (sitps, config, tn)
    }

    #[test]
    fn trace_matches_brute_force_in_both_orientations() {
        let (_, _, mut tn) = network(3, 3, 21);
        let exact = brute_force(&tn.tensors);
        tn.generate_bmps_approach(BMPSPosition::Up).unwrap();
        for row in 0..3 {
            for col in 0..3 {
                let amp = tn.trace(SiteIdx(row, col), BondOrientation::Horizontal).unwrap();
                assert_relative_eq!(amp, exact, max_relative = 1e-9);
            }
            if row < 2 { tn.bmps_move_step(BMPSPosition::Down).unwrap(); }
        }
        tn.generate_bmps_approach(BMPSPosition::Left).unwrap();
        for col in 0..3 {
            tn.init_bten(BMPSPosition::Up, col);
            tn.grow_full_bten(BMPSPosition::Down, col, 2, true).unwrap();
            let amp = tn.trace(SiteIdx(0, col), BondOrientation::Vertical).unwrap();
            assert_relative_eq!(amp, exact, max_relative = 1e-9);
            if col < 2 { tn.bmps_move_step(BMPSPosition::Right).unwrap(); }
        }
    }

    #[test]
    fn boundaries_track_approach_state() {
        let (_, _, mut tn) = network(2, 3, 22);
        assert_eq!(tn.state(), BoundaryState::Unset);
        assert!(matches!(tn.bmps_move_step(BMPSPosition::Down), Err(TNError::NoApproach)));
        tn.generate_bmps_approach(BMPSPosition::Up).unwrap();
        assert_eq!(tn.state(), BoundaryState::Approach { edge: BMPSPosition::Up, line: 0 });
        assert_eq!(tn.bmps(BMPSPosition::Down).len(), 2);
        assert_eq!(tn.bmps(BMPSPosition::Up).len(), 1);
        tn.bmps_move_step(BMPSPosition::Down).unwrap();
        assert_eq!(tn.state(), BoundaryState::Approach { edge: BMPSPosition::Up, line: 1 });
        assert_eq!(tn.bmps(BMPSPosition::Up).len(), 2);
        assert_eq!(tn.bmps(BMPSPosition::Down).len(), 1);
        tn.delete_inner_bmps(BMPSPosition::Up);
        assert_eq!(tn.bmps(BMPSPosition::Up).len(), 1);
        assert!(matches!(
            tn.trace(SiteIdx(1, 0), BondOrientation::Horizontal),
            Err(TNError::BoundaryNotReady { post: BMPSPosition::Up, line: 1 })
        ));
    }

    #[test]
    fn replaced_traces_match_brute_force() {
        let (sitps, config, mut tn) = network(2, 3, 23);
        tn.generate_bmps_approach(BMPSPosition::Up).unwrap();
        tn.init_bten(BMPSPosition::Left, 0);
        tn.grow_full_bten(BMPSPosition::Right, 0, 2, true).unwrap();
        let (s1, s2) = (SiteIdx(0, 0), SiteIdx(0, 1));
        let t1 = &sitps[s1][1 - config[s1]];
        let t2 = &sitps[s2][1 - config[s2]];
        let amp = tn.replace_nn_site_trace(s1, s2, BondOrientation::Horizontal, t1, t2).unwrap();
        let mut replaced = tn.tensors.clone();
        replaced[s1] = t1.clone();
        replaced[s2] = t2.clone();
        assert_relative_eq!(amp, brute_force(&replaced), max_relative = 1e-9);

        let far = SiteIdx(0, 2);
        let t3 = &sitps[far][1 - config[far]];
        let amp = tn.replace_trace(BondOrientation::Horizontal, 0, &[(0, t1), (2, t3)]).unwrap();
        let mut replaced = tn.tensors.clone();
        replaced[s1] = t1.clone();
        replaced[far] = t3.clone();
        assert_relative_eq!(amp, brute_force(&replaced), max_relative = 1e-9);

        // queries leave the caches as they were
        assert_eq!(tn.bten(BMPSPosition::Right).len(), 2);
        assert_eq!(tn.bten(BMPSPosition::Left).len(), 1);
        assert!(matches!(
            tn.replace_nn_site_trace(s1, far, BondOrientation::Horizontal, t1, t3),
            Err(TNError::NotNeighbors(..))
        ));
    }

    #[test]
    fn substituted_site_in_rotated_frame_matches_brute_force() {
        let (sitps, config, mut tn) = network(3, 2, 25);
        tn.generate_bmps_approach(BMPSPosition::Left).unwrap();
        tn.init_bten(BMPSPosition::Up, 0);
        tn.grow_full_bten(BMPSPosition::Down, 0, 2, true).unwrap();
        for row in 0..3 {
            let site = SiteIdx(row, 0);
            let t = &sitps[site][1 - config[site]];
            let amp = tn.replace_one_site_trace(site, t, BondOrientation::Vertical).unwrap();
            let mut replaced = tn.tensors.clone();
            replaced[site] = t.clone();
            assert_relative_eq!(amp, brute_force(&replaced), max_relative = 1e-9);
        }
    }

    #[test]
    fn holes_contract_back_to_amplitude() {
        let (_, _, mut tn) = network(3, 2, 24);
        let exact = brute_force(&tn.tensors);
        for (post, orient) in [
            (BMPSPosition::Up, BondOrientation::Horizontal),
            (BMPSPosition::Left, BondOrientation::Vertical),
        ] {
            tn.generate_bmps_approach(post).unwrap();
            let lines = if orient == BondOrientation::Horizontal { 3 } else { 2 };
            let len = 5 - lines;
            let (head, tail) = if orient == BondOrientation::Horizontal {
                (BMPSPosition::Left, BMPSPosition::Right)
            } else {
                (BMPSPosition::Up, BMPSPosition::Down)
            };
            for line in 0..lines {
                tn.init_bten(head, line);
                tn.grow_full_bten(tail, line, 1, true).unwrap();
                for p in 0..len {
                    let site = SiteIdx::from_line_pos(orient, line, p);
                    let hole = tn.punch_hole(site, orient).unwrap();
                    assert_eq!(hole.shape(), tn.tensor(site).shape());
                    assert_relative_eq!(
                        tensor::inner(&hole, tn.tensor(site)), exact, max_relative = 1e-9);
                    if p + 1 < len { tn.bten_move_step(tail).unwrap(); }
                }
                if line + 1 < lines { tn.bmps_move_step(post.opposite()).unwrap(); }
            }
        }
    }

    #[test]
    fn cached_and_on_the_fly_environments_agree() {
        let (_, _, mut tn) = network(2, 4, 25);
        tn.generate_bmps_approach(BMPSPosition::Up).unwrap();
        let uncached = tn.trace(SiteIdx(0, 2), BondOrientation::Horizontal).unwrap();
        tn.init_bten(BMPSPosition::Left, 0);
        tn.grow_full_bten(BMPSPosition::Right, 0, 1, true).unwrap();
        tn.grow_bten_step(BMPSPosition::Left).unwrap();
        assert_eq!(tn.bten(BMPSPosition::Left).len(), 2);
        let cached = tn.trace(SiteIdx(0, 2), BondOrientation::Horizontal).unwrap();
        assert_relative_eq!(cached, uncached, max_relative = 1e-10);
        tn.truncate_bten(BMPSPosition::Right, 0);
        assert_eq!(tn.bten(BMPSPosition::Right).len(), 1);
    }
}
