//! Tensor tile surface.
//!
//! The engine maps tile-space fault tables owned by a [`Tile`] onto the PE
//! array and writes recovered tables back. Only the fault-exchange surface
//! lives here — slicing a tensor into tiles is the owning layer's business.

use crate::error::{DataflowError, Result};
use crate::table::FaultTable;
use serde::{Deserialize, Serialize};

/// One tensor tile: its (slice) shape and the fault tables exchanged with
/// the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tile {
    shape: Vec<usize>,
    expanded: bool,
    bias_shape: Option<Vec<usize>>,
    /// Tile-space faults of the tensor itself.
    pub faults: FaultTable,
    /// Recovered partial-sum faults (written on the ofmap tile).
    pub psum_faults: FaultTable,
    /// Bias faults (read and written on the weight tile).
    pub bias_faults: FaultTable,
}

impl Tile {
    /// Tile with an explicit slice shape (trailing axis = slice count).
    #[must_use]
    pub fn new(slice_shape: Vec<usize>) -> Self {
        let width = slice_shape.len();
        Self {
            shape: slice_shape,
            expanded: true,
            bias_shape: None,
            faults: FaultTable::empty(width),
            psum_faults: FaultTable::empty(width),
            bias_faults: FaultTable::empty(0),
        }
    }

    /// Flat (sliceless) tile; mapping treats it as a single slice.
    #[must_use]
    pub fn from_flat(shape: Vec<usize>) -> Self {
        let width = shape.len();
        Self {
            shape,
            expanded: false,
            bias_shape: None,
            faults: FaultTable::empty(width),
            psum_faults: FaultTable::empty(width),
            bias_faults: FaultTable::empty(0),
        }
    }

    /// Attach the bias slice shape carried alongside a weight tile.
    #[must_use]
    pub fn with_bias_shape(mut self, slice_shape: Vec<usize>) -> Self {
        self.bias_shape = Some(slice_shape);
        self
    }

    /// Install tile-space faults.
    #[must_use]
    pub fn with_faults(mut self, faults: FaultTable) -> Self {
        self.faults = faults;
        self
    }

    /// Install bias faults.
    #[must_use]
    pub fn with_bias_faults(mut self, faults: FaultTable) -> Self {
        self.bias_faults = faults;
        self
    }

    /// True when the tile carries an explicit slice axis.
    #[must_use]
    pub const fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Declared shape (without the implicit slice axis for flat tiles).
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Shape the mapping pipeline works in: the slice shape, with a trailing
    /// extent of 1 appended for flat tiles.
    #[must_use]
    pub fn slice_shape(&self) -> Vec<usize> {
        if self.expanded {
            self.shape.clone()
        } else {
            let mut s = self.shape.clone();
            s.push(1);
            s
        }
    }

    /// Bias slice shape, if one was attached.
    pub fn bias_slice_shape(&self) -> Result<Vec<usize>> {
        self.bias_shape
            .clone()
            .ok_or_else(|| DataflowError::config("tile carries no bias slice shape"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_tile_gains_slice_axis() {
        let tile = Tile::from_flat(vec![4, 4]);
        assert_eq!(tile.slice_shape(), vec![4, 4, 1]);
        assert!(!tile.is_expanded());
    }

    #[test]
    fn bias_shape_is_optional() {
        let tile = Tile::new(vec![4, 4, 2]);
        assert!(tile.bias_slice_shape().is_err());
        let tile = tile.with_bias_shape(vec![4, 2]);
        assert_eq!(tile.bias_slice_shape().unwrap(), vec![4, 2]);
    }
}
