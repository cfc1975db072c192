//! Site indexing, bond orientations, and dense 2D storage over a square
//! lattice.

use std::ops::{ Index, IndexMut };
use itertools::Itertools;
use serde::{ Deserialize, Serialize };

/// A lattice site, `SiteIdx(row, col)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteIdx(pub usize, pub usize);

impl SiteIdx {
    pub fn row(&self) -> usize { self.0 }

    pub fn col(&self) -> usize { self.1 }

    /// Index of the line containing the site, for lines of the given
    /// orientation.
    pub fn line(&self, orient: BondOrientation) -> usize {
        match orient {
            BondOrientation::Horizontal => self.0,
            BondOrientation::Vertical => self.1,
        }
    }

    /// Position of the site along its line.
    pub fn pos(&self, orient: BondOrientation) -> usize {
        match orient {
            BondOrientation::Horizontal => self.1,
            BondOrientation::Vertical => self.0,
        }
    }

    /// Inverse of [`line`][Self::line] and [`pos`][Self::pos].
    pub fn from_line_pos(orient: BondOrientation, line: usize, pos: usize)
        -> Self
    {
        match orient {
            BondOrientation::Horizontal => Self(line, pos),
            BondOrientation::Vertical => Self(pos, line),
        }
    }
}

/// Orientation of a bond or of a line of sites.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondOrientation {
    Horizontal,
    Vertical,
}

impl BondOrientation {
    pub fn rotate(self) -> Self {
        match self {
            Self::Horizontal => Self::Vertical,
            Self::Vertical => Self::Horizontal,
        }
    }
}

/// One of the four lattice edges a boundary MPS or a partial boundary tensor
/// can be grown from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BMPSPosition {
    Left = 0,
    Down = 1,
    Right = 2,
    Up = 3,
}

impl BMPSPosition {
    pub const ALL: [Self; 4] = [Self::Left, Self::Down, Self::Right, Self::Up];

    pub fn index(self) -> usize { self as usize }

    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Down => Self::Up,
            Self::Right => Self::Left,
            Self::Up => Self::Down,
        }
    }

    /// Orientation of the lines a boundary MPS from this edge absorbs: rows
    /// for `Up`/`Down`, columns for `Left`/`Right`.
    pub fn absorbed_lines(self) -> BondOrientation {
        match self {
            Self::Up | Self::Down => BondOrientation::Horizontal,
            Self::Left | Self::Right => BondOrientation::Vertical,
        }
    }

    /// Orientation of the lines a partial boundary tensor from this edge runs
    /// along: rows for `Left`/`Right`, columns for `Up`/`Down`.
    pub fn bten_lines(self) -> BondOrientation {
        self.absorbed_lines().rotate()
    }

    /// `true` for edges at the start of a line (`Up`, `Left`).
    pub fn is_head(self) -> bool { matches!(self, Self::Up | Self::Left) }
}

/// Dense row-major storage of one item per lattice site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T> Grid<T> {
    /// Create a new grid, filling each site from a closure.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> Self
    where F: FnMut(SiteIdx) -> T
    {
        let data: Vec<T>
            = (0..rows).cartesian_product(0..cols)
            .map(|(r, c)| f(SiteIdx(r, c)))
            .collect();
        Self { rows, cols, data }
    }

    /// Create a grid from row-major data.
    ///
    /// Returns `None` if the data length doesn't match the shape.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize { self.rows }

    pub fn cols(&self) -> usize { self.cols }

    pub fn size(&self) -> usize { self.data.len() }

    pub fn get(&self, site: SiteIdx) -> Option<&T> {
        (site.0 < self.rows && site.1 < self.cols)
            .then(|| &self.data[site.0 * self.cols + site.1])
    }

    /// Iterate over all sites in row-major order.
    pub fn sites(&self) -> impl Iterator<Item = SiteIdx> + '_ {
        (0..self.rows).cartesian_product(0..self.cols)
            .map(|(r, c)| SiteIdx(r, c))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> { self.data.iter() }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.data.iter_mut()
    }

    /// Iterate over `(site, item)` pairs in row-major order.
    pub fn indexed_iter(&self) -> impl Iterator<Item = (SiteIdx, &T)> + '_ {
        self.sites().zip(self.data.iter())
    }

    /// Apply a function to every item, producing a new grid of the same
    /// shape.
    pub fn map<U, F>(&self, mut f: F) -> Grid<U>
    where F: FnMut(&T) -> U
    {
        Grid {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(&mut f).collect(),
        }
    }

    pub fn into_vec(self) -> Vec<T> { self.data }
}

impl<T> Index<SiteIdx> for Grid<T> {
    type Output = T;

    fn index(&self, site: SiteIdx) -> &T {
        assert!(site.0 < self.rows && site.1 < self.cols,
            "site {site:?} out of bounds for a {}x{} grid", self.rows, self.cols);
        &self.data[site.0 * self.cols + site.1]
    }
}

impl<T> IndexMut<SiteIdx> for Grid<T> {
    fn index_mut(&mut self, site: SiteIdx) -> &mut T {
        assert!(site.0 < self.rows && site.1 < self.cols,
            "site {site:?} out of bounds for a {}x{} grid", self.rows, self.cols);
        &mut self.data[site.0 * self.cols + site.1]
    }
}

/// Number of nearest-neighbor bonds on an open `ly × lx` square lattice.
pub fn nn_bond_count(ly: usize, lx: usize) -> usize {
    lx.saturating_sub(1) * ly + ly.saturating_sub(1) * lx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_consistent() {
        for post in BMPSPosition::ALL {
            assert_eq!(post.opposite().opposite(), post);
            assert_eq!(BMPSPosition::ALL[post.index()], post);
            assert_ne!(post.absorbed_lines(), post.bten_lines());
            assert_ne!(post.is_head(), post.opposite().is_head());
        }
        assert_eq!(BMPSPosition::Up.absorbed_lines(), BondOrientation::Horizontal);
        assert_eq!(BMPSPosition::Left.bten_lines(), BondOrientation::Horizontal);
    }

    #[test]
    fn grid_is_row_major() {
        let grid = Grid::from_fn(2, 3, |SiteIdx(r, c)| 10 * r + c);
        assert_eq!(grid.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 10, 11, 12]);
        assert_eq!(grid[SiteIdx(1, 2)], 12);
        assert_eq!(grid.get(SiteIdx(2, 0)), None);
        let site = SiteIdx(1, 2);
        for orient in [BondOrientation::Horizontal, BondOrientation::Vertical] {
            assert_eq!(
                SiteIdx::from_line_pos(orient, site.line(orient), site.pos(orient)),
                site,
            );
        }
        assert_eq!(nn_bond_count(2, 3), 7);
        assert_eq!(nn_bond_count(1, 2), 1);
    }
}
