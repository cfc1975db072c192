//! Classical configurations: one local basis index per lattice site.

use std::{
    fs,
    io::{ self, Write },
    ops::{ Deref, DerefMut },
    path::{ Path, PathBuf },
};
use rand::{ Rng, seq::SliceRandom };
use thiserror::Error;
use crate::lattice::{ Grid, SiteIdx };

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Returned when the requested occupation numbers don't add up to the
    /// number of lattice sites.
    #[error("error in configuration creation: occupancy sums to {0} but the lattice has {1} sites")]
    OccupancyMismatch(usize, usize),

    /// Returned when a configuration file can't be read or written.
    #[error("configuration i/o error: {0}")]
    Io(#[from] io::Error),

    /// Returned when a configuration file holds a non-integer entry.
    #[error("error parsing configuration file: bad entry {0:?}")]
    Parse(String),

    /// Returned when a configuration file has ragged or empty rows.
    #[error("error parsing configuration file: rows of unequal length")]
    Ragged,

    /// Returned when a loaded configuration has a different shape than
    /// expected.
    #[error("loaded configuration has shape {0}x{1}, expected {2}x{3}")]
    ShapeMismatch(usize, usize, usize, usize),
}
use ConfigurationError::*;
pub type ConfigurationResult<T> = Result<T, ConfigurationError>;

/// A classical configuration over the lattice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration(Grid<usize>);

impl Deref for Configuration {
    type Target = Grid<usize>;

    fn deref(&self) -> &Grid<usize> { &self.0 }
}

impl DerefMut for Configuration {
    fn deref_mut(&mut self) -> &mut Grid<usize> { &mut self.0 }
}

impl From<Grid<usize>> for Configuration {
    fn from(grid: Grid<usize>) -> Self { Self(grid) }
}

impl Configuration {
    /// Create a configuration with every site in local basis 0.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self(Grid::from_fn(rows, cols, |_| 0))
    }

    /// Create a configuration from nested rows.
    pub fn from_rows(rows: Vec<Vec<usize>>) -> ConfigurationResult<Self> {
        let nrows = rows.len();
        let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
        if ncols == 0 || rows.iter().any(|r| r.len() != ncols) {
            return Err(Ragged);
        }
        let data: Vec<usize> = rows.into_iter().flatten().collect();
        Grid::from_vec(nrows, ncols, data).map(Self).ok_or(Ragged)
    }

    /// Create a random configuration in which exactly `occupancy[b]` sites
    /// hold local basis `b`.
    pub fn random<R>(rows: usize, cols: usize, occupancy: &[usize], rng: &mut R)
        -> ConfigurationResult<Self>
    where R: Rng + ?Sized
    {
        let total: usize = occupancy.iter().sum();
        if total != rows * cols {
            return Err(OccupancyMismatch(total, rows * cols));
        }
        let mut data: Vec<usize>
            = occupancy.iter().enumerate()
            .flat_map(|(b, n)| std::iter::repeat(b).take(*n))
            .collect();
        data.shuffle(rng);
        Grid::from_vec(rows, cols, data).map(Self)
            .ok_or(OccupancyMismatch(total, rows * cols))
    }

    /// Number of sites holding each local basis value `0..num_basis`.
    pub fn occupation_counts(&self, num_basis: usize) -> Vec<usize> {
        let mut counts = vec![0; num_basis];
        self.iter().filter(|b| **b < num_basis).for_each(|b| { counts[*b] += 1; });
        counts
    }

    /// Sum of all local basis values.
    pub fn sum(&self) -> usize { self.iter().sum() }

    /// Exchange the basis values held on two sites.
    pub fn swap(&mut self, site1: SiteIdx, site2: SiteIdx) {
        let tmp = self[site1];
        self[site1] = self[site2];
        self[site2] = tmp;
    }

    /// Path of the configuration file for a given rank under `dir`.
    pub fn file_path<P>(dir: P, rank: usize) -> PathBuf
    where P: AsRef<Path>
    {
        dir.as_ref().join(format!("configuration{rank}"))
    }

    /// Write the configuration as plain text, one lattice row per line.
    pub fn dump<P>(&self, dir: P, rank: usize) -> ConfigurationResult<()>
    where P: AsRef<Path>
    {
        fs::create_dir_all(dir.as_ref())?;
        let mut out = io::BufWriter::new(fs::File::create(Self::file_path(dir, rank))?);
        for r in 0..self.rows() {
            let line: Vec<String>
                = (0..self.cols()).map(|c| self[SiteIdx(r, c)].to_string()).collect();
            writeln!(out, "{}", line.join(" "))?;
        }
        out.flush()?;
        Ok(())
    }

    /// Read a configuration written by [`dump`][Self::dump], checking its
    /// shape.
    pub fn load<P>(dir: P, rank: usize, rows: usize, cols: usize)
        -> ConfigurationResult<Self>
    where P: AsRef<Path>
    {
        let text = fs::read_to_string(Self::file_path(dir, rank))?;
        let parsed: Vec<Vec<usize>>
            = text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.split_whitespace()
                    .map(|tok| tok.parse::<usize>().map_err(|_| Parse(tok.to_string())))
                    .collect::<ConfigurationResult<Vec<usize>>>()
            })
            .collect::<ConfigurationResult<Vec<Vec<usize>>>>()?;
        let config = Self::from_rows(parsed)?;
        if config.rows() != rows || config.cols() != cols {
            return Err(ShapeMismatch(config.rows(), config.cols(), rows, cols));
        }
        Ok(config)
    }
}
