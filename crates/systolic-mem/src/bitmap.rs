//! Memory bitmap and fault-address sampling.

use crate::error::{BitmapError, Result};
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spatial distribution of fault addresses over the memory grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AddrDistribution {
    /// Every cell equally likely.
    Uniform,
    /// Faults cluster around a hot spot (wear-out modeling).
    Poisson {
        /// Row-coordinate lambda.
        lambda_row: f64,
        /// Column-coordinate lambda.
        lambda_col: f64,
    },
}

/// The bitmap of one on-chip buffer: a `rows` x `cols` cell grid, each cell
/// one memory word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    /// Memory rows.
    pub rows: usize,
    /// Memory columns.
    pub cols: usize,
    /// Word length in bits.
    pub word_len: u16,
}

impl Bitmap {
    /// Bitmap of the given geometry.
    #[must_use]
    pub const fn new(rows: usize, cols: usize, word_len: u16) -> Self {
        Self {
            rows,
            cols,
            word_len,
        }
    }

    /// Total cell count.
    #[must_use]
    pub const fn cells(&self) -> usize {
        self.rows * self.cols
    }

    /// Number of faults a fault rate implies for this memory.
    #[must_use]
    pub fn fault_count(&self, rate: f64) -> usize {
        (self.cells() as f64 * rate) as usize
    }

    /// Sample one fault address under the given distribution.
    ///
    /// Poisson samples falling outside the grid are redrawn, so the result
    /// is always a valid cell.
    pub fn sample_addr<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        distribution: AddrDistribution,
    ) -> Result<(usize, usize)> {
        match distribution {
            AddrDistribution::Uniform => {
                Ok((rng.gen_range(0..self.rows), rng.gen_range(0..self.cols)))
            }
            AddrDistribution::Poisson {
                lambda_row,
                lambda_col,
            } => {
                let in_range = |lam: f64, extent: usize| lam >= 0.0 && lam < extent as f64;
                if !in_range(lambda_row, self.rows) || !in_range(lambda_col, self.cols) {
                    return Err(BitmapError::LambdaOutOfRange {
                        lambda_row,
                        lambda_col,
                        rows: self.rows,
                        cols: self.cols,
                    });
                }
                let out_of_range = || BitmapError::LambdaOutOfRange {
                    lambda_row,
                    lambda_col,
                    rows: self.rows,
                    cols: self.cols,
                };
                let row_dist =
                    Poisson::new(lambda_row.max(f64::MIN_POSITIVE)).map_err(|_| out_of_range())?;
                let col_dist =
                    Poisson::new(lambda_col.max(f64::MIN_POSITIVE)).map_err(|_| out_of_range())?;
                let draw = |rng: &mut R, dist: &Poisson<f64>, extent: usize| loop {
                    let v = dist.sample(rng) as usize;
                    if v < extent {
                        return v;
                    }
                };
                let row = draw(rng, &row_dist, self.rows);
                let col = draw(rng, &col_dist, self.cols);
                Ok((row, col))
            }
        }
    }

    /// Generate the fault map of this memory: `fault_count(rate)` distinct
    /// faulty cells, each tagged with the fault mode.
    ///
    /// Addresses are rejection-sampled until distinct, mirroring how
    /// manufacturing defects land on distinct cells.
    pub fn gen_fault_map<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rate: f64,
        distribution: AddrDistribution,
        mode: &str,
    ) -> Result<(BTreeMap<(usize, usize), String>, usize)> {
        let wanted = self.fault_count(rate);
        if wanted > self.cells() {
            return Err(BitmapError::RateTooHigh {
                rate,
                wanted,
                cells: self.cells(),
            });
        }
        let mut faults = BTreeMap::new();
        while faults.len() < wanted {
            let addr = self.sample_addr(rng, distribution)?;
            faults.entry(addr).or_insert_with(|| mode.to_string());
        }
        tracing::debug!(
            faults = faults.len(),
            rows = self.rows,
            cols = self.cols,
            "generated memory fault map"
        );
        Ok((faults, wanted))
    }
}
