//! Mapping-shape planning.
//!
//! Each premap stage needs a target PE-side shape and the bookkeeping that
//! places tile axes inside it. Shapes are assembled in canonical axis order
//! (`PE_y`, `PE_x`, `t_clk`, slice last); the [`AxisTracker`] records which
//! PE axes earlier stages already claimed so later stages slot their axes
//! around them. The same planners serve the backward (demap) direction,
//! where the tracker holds the axes still left to solve.

use crate::axes::PeAxis;
use crate::error::{DataflowError, Result};

/// Clock cycles needed to move a tile through the non-clock PE dimensions.
#[must_use]
pub fn estimate_clk(tile_shape: &[usize], pe_dims: &[usize]) -> usize {
    let tile: usize = tile_shape.iter().product();
    let pe: usize = pe_dims.iter().product::<usize>().max(1);
    (tile + pe - 1) / pe
}

/// PE axes claimed so far by one tensor's mapping, plus the derived clock
/// depth shared by its stages.
#[derive(Debug, Clone, Default)]
pub(crate) struct AxisTracker {
    pub axes: Vec<PeAxis>,
    pub tmp_clk: Option<usize>,
}

impl AxisTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, axis: PeAxis) -> bool {
        self.axes.contains(&axis)
    }

    /// Claim an axis; claiming one twice means two mapping rules target the
    /// same PE dimension, which is a configuration error.
    pub fn claim(&mut self, axis: PeAxis) -> Result<()> {
        if self.contains(axis) {
            return Err(DataflowError::config(format!(
                "axis {axis} is mapped by more than one rule"
            )));
        }
        self.axes.push(axis);
        Ok(())
    }

    /// Release an axis during backward solving.
    pub fn release(&mut self, axis: PeAxis) -> Result<()> {
        match self.axes.iter().position(|&a| a == axis) {
            Some(i) => {
                self.axes.remove(i);
                Ok(())
            }
            None => Err(DataflowError::config(format!(
                "axis {axis} is not part of this tensor's mapping"
            ))),
        }
    }

    /// Derive the clock depth once per tensor; `pe_dims` is the partial shape
    /// (PE axes plus slice) at the point the clock axis first appears.
    fn ensure_clk(&mut self, tile_shape: &[usize], pe_dims: &[usize]) -> usize {
        *self
            .tmp_clk
            .get_or_insert_with(|| estimate_clk(tile_shape, pe_dims))
    }

    fn update(&mut self, axes: &[PeAxis], backward: bool) -> Result<()> {
        for &a in axes {
            if backward {
                self.release(a)?;
            } else {
                self.claim(a)?;
            }
        }
        Ok(())
    }
}

fn grid_extent(grid: (usize, usize), axis: PeAxis) -> usize {
    match axis {
        PeAxis::PeY => grid.0,
        PeAxis::PeX => grid.1,
        PeAxis::Clk => unreachable!("clock extent is derived, not fixed"),
    }
}

/// Target shape and priority for a permute stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PermutePlan {
    pub shape: Vec<usize>,
    pub prior: Vec<usize>,
}

pub(crate) fn permute_plan(
    tracker: &mut AxisTracker,
    grid: (usize, usize),
    axes: &[PeAxis],
    tile_shape: &[usize],
    backward: bool,
) -> Result<PermutePlan> {
    let slice = *tile_shape
        .last()
        .ok_or_else(|| DataflowError::config("tile shape is empty"))?;

    let mut shape = Vec::with_capacity(axes.len() + 1);
    let mut canon = Vec::with_capacity(axes.len());
    for axis in [PeAxis::PeY, PeAxis::PeX] {
        if axes.contains(&axis) {
            canon.push((axis, shape.len()));
            shape.push(grid_extent(grid, axis));
        }
    }
    shape.push(slice);
    if axes.contains(&PeAxis::Clk) {
        let clk = tracker.ensure_clk(tile_shape, &shape);
        let pos = shape.len() - 1;
        canon.push((PeAxis::Clk, pos));
        shape.insert(pos, clk);
    }

    // Priority values: first axis in the rule's list is most significant,
    // the slice axis sits above all of them.
    let mut prior = vec![0usize; shape.len()];
    for (rank, axis) in axes.iter().enumerate() {
        if let Some((_, pos)) = canon.iter().find(|(a, _)| a == axis) {
            prior[*pos] = axes.len() - 1 - rank;
        }
    }
    prior[shape.len() - 1] = axes.len();

    tracker.update(axes, backward)?;
    Ok(PermutePlan { shape, prior })
}

/// Target shape, fixed positions and data-axis placement for a fixed stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FixedPlan {
    pub fix_dims: Vec<usize>,
    pub shape: Vec<usize>,
    pub axis_map: Vec<usize>,
}

pub(crate) fn fixed_plan(
    tracker: &mut AxisTracker,
    grid: (usize, usize),
    fix_axes: &[PeAxis],
    tile_shape: &[usize],
    backward: bool,
) -> Result<FixedPlan> {
    let slice = *tile_shape
        .last()
        .ok_or_else(|| DataflowError::config("tile shape is empty"))?;

    let mut shape = Vec::new();
    let mut fix_dims = Vec::new();
    for axis in [PeAxis::PeY, PeAxis::PeX] {
        if fix_axes.contains(&axis) {
            fix_dims.push(shape.len());
            shape.push(grid_extent(grid, axis));
        } else if tracker.contains(axis) {
            shape.push(grid_extent(grid, axis));
        }
    }
    shape.push(slice);
    if fix_axes.contains(&PeAxis::Clk) {
        let clk = tracker.ensure_clk(tile_shape, &shape);
        let pos = shape.len() - 1;
        fix_dims.push(pos);
        shape.insert(pos, clk);
    } else if tracker.contains(PeAxis::Clk) {
        let clk = tracker.ensure_clk(tile_shape, &shape);
        shape.insert(shape.len() - 1, clk);
    }

    let axis_map: Vec<usize> = (0..shape.len()).filter(|p| !fix_dims.contains(p)).collect();

    tracker.update(fix_axes, backward)?;
    Ok(FixedPlan {
        fix_dims,
        shape,
        axis_map,
    })
}

/// Target shape, fan-out positions and data-axis placement for a broadcast
/// stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BroadcastPlan {
    pub shape: Vec<usize>,
    pub broadcast_dims: Vec<usize>,
    pub axis_map: Vec<usize>,
}

pub(crate) fn broadcast_plan(
    tracker: &mut AxisTracker,
    grid: (usize, usize),
    broadcast_axes: &[PeAxis],
    tile_shape: &[usize],
    backward: bool,
) -> Result<BroadcastPlan> {
    let slice = *tile_shape
        .last()
        .ok_or_else(|| DataflowError::config("tile shape is empty"))?;

    let mut shape = Vec::new();
    let mut broadcast_dims = Vec::new();
    for axis in [PeAxis::PeY, PeAxis::PeX] {
        if broadcast_axes.contains(&axis) {
            broadcast_dims.push(shape.len());
            shape.push(grid_extent(grid, axis));
        } else if tracker.contains(axis) {
            shape.push(grid_extent(grid, axis));
        }
    }
    shape.push(slice);
    if broadcast_axes.contains(&PeAxis::Clk) {
        let clk = tracker.ensure_clk(tile_shape, &shape);
        let pos = shape.len() - 1;
        broadcast_dims.push(pos);
        shape.insert(pos, clk);
    } else if tracker.contains(PeAxis::Clk) {
        let clk = tracker.ensure_clk(tile_shape, &shape);
        shape.insert(shape.len() - 1, clk);
    }

    let axis_map: Vec<usize> = (0..shape.len())
        .filter(|p| !broadcast_dims.contains(p))
        .collect();

    tracker.update(broadcast_axes, backward)?;
    Ok(BroadcastPlan {
        shape,
        broadcast_dims,
        axis_map,
    })
}

/// Window geometry and axis placement for a streaming stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamPlan {
    pub data_shape: Vec<usize>,
    pub data_stream_axis: usize,
    pub window_shape: Vec<usize>,
    pub window_stream_axis: usize,
    pub window_clk_axis: usize,
    pub axis_map: Vec<usize>,
}

pub(crate) fn stream_plan(
    tracker: &mut AxisTracker,
    grid: (usize, usize),
    stream_axis: PeAxis,
    tile_shape: &[usize],
    backward: bool,
) -> Result<StreamPlan> {
    if !stream_axis.is_physical() {
        return Err(DataflowError::config(
            "streaming axis must be PE_x or PE_y",
        ));
    }
    if !tracker.contains(PeAxis::Clk) {
        return Err(DataflowError::config(
            "streaming requires the clock axis to be mapped by an earlier rule",
        ));
    }
    let slice = *tile_shape
        .last()
        .ok_or_else(|| DataflowError::config("tile shape is empty"))?;

    let mut shape = Vec::new();
    let mut window_stream_axis = 0;
    for axis in [PeAxis::PeY, PeAxis::PeX] {
        if axis == stream_axis {
            window_stream_axis = shape.len();
            shape.push(grid_extent(grid, axis));
        } else if tracker.contains(axis) {
            shape.push(grid_extent(grid, axis));
        }
    }
    let latency = grid_extent(grid, stream_axis) - 1;
    shape.push(slice);
    let clk = tracker.ensure_clk(tile_shape, &shape);
    shape.insert(shape.len() - 1, clk + latency);
    let window_clk_axis = shape.len() - 2;

    let mut data_shape = shape.clone();
    data_shape.remove(window_stream_axis);
    let data_stream_axis = data_shape.len() - 2;
    // The stream slot of the data shape is the unpadded clock depth: it is
    // the reflection extent for backward tile flow, and reflecting within
    // the latency-padded window would land captures past the window edge.
    data_shape[data_stream_axis] = clk;

    let mut axis_map: Vec<usize> = (0..shape.len())
        .filter(|&p| p != window_stream_axis && p != window_clk_axis)
        .collect();
    axis_map.insert(data_stream_axis, window_stream_axis);

    tracker.update(&[stream_axis], backward)?;
    Ok(StreamPlan {
        data_shape,
        data_stream_axis,
        window_shape: shape,
        window_stream_axis,
        window_clk_axis,
        axis_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clk_estimate_rounds_up() {
        assert_eq!(estimate_clk(&[4, 3, 2], &[4, 2]), 3);
        assert_eq!(estimate_clk(&[4, 4, 2], &[4, 4, 2]), 1);
    }

    #[test]
    fn permute_plan_orders_axes_canonically() {
        let mut tracker = AxisTracker::new();
        let plan = permute_plan(
            &mut tracker,
            (4, 6),
            &[PeAxis::Clk, PeAxis::PeX],
            &[4, 3, 2],
            false,
        )
        .unwrap();
        // Canonical order PE_x then t_clk then slice; clk = ceil(24/12) = 2.
        assert_eq!(plan.shape, vec![6, 2, 2]);
        // First-listed axis (t_clk) most significant, slice above all.
        assert_eq!(plan.prior, vec![0, 1, 2]);
        assert_eq!(tracker.axes, vec![PeAxis::Clk, PeAxis::PeX]);
        assert_eq!(tracker.tmp_clk, Some(2));
    }

    #[test]
    fn fixed_plan_slots_around_claimed_axes() {
        let mut tracker = AxisTracker::new();
        permute_plan(
            &mut tracker,
            (4, 6),
            &[PeAxis::Clk, PeAxis::PeX],
            &[4, 3, 2],
            false,
        )
        .unwrap();
        let plan = fixed_plan(&mut tracker, (4, 6), &[PeAxis::PeY], &[4, 3, 2], false).unwrap();
        assert_eq!(plan.shape, vec![4, 6, 2, 2]);
        assert_eq!(plan.fix_dims, vec![0]);
        assert_eq!(plan.axis_map, vec![1, 2, 3]);
    }

    #[test]
    fn broadcast_plan_reports_data_placement() {
        let mut tracker = AxisTracker::new();
        permute_plan(
            &mut tracker,
            (4, 6),
            &[PeAxis::PeY, PeAxis::PeX],
            &[4, 6, 2],
            false,
        )
        .unwrap();
        let plan =
            broadcast_plan(&mut tracker, (4, 6), &[PeAxis::Clk], &[4, 6, 2], false).unwrap();
        // clk = ceil(48/48) = 1 inserted before the slice axis.
        assert_eq!(plan.shape, vec![4, 6, 1, 2]);
        assert_eq!(plan.broadcast_dims, vec![2]);
        assert_eq!(plan.axis_map, vec![0, 1, 3]);
    }

    #[test]
    fn stream_plan_adds_window_latency() {
        let mut tracker = AxisTracker::new();
        permute_plan(
            &mut tracker,
            (4, 6),
            &[PeAxis::PeY, PeAxis::Clk],
            &[4, 3, 2],
            false,
        )
        .unwrap();
        let plan = stream_plan(&mut tracker, (4, 6), PeAxis::PeX, &[4, 3, 2], false).unwrap();
        // clk = ceil(24/8) = 3, window adds n_x - 1 = 5 cycles.
        assert_eq!(plan.window_shape, vec![4, 6, 8, 2]);
        assert_eq!(plan.window_stream_axis, 1);
        assert_eq!(plan.window_clk_axis, 2);
        assert_eq!(plan.data_shape, vec![4, 3, 2]);
        assert_eq!(plan.data_stream_axis, 1);
        assert_eq!(plan.axis_map, vec![0, 1, 3]);
    }

    #[test]
    fn stream_without_clock_rejected() {
        let mut tracker = AxisTracker::new();
        assert!(stream_plan(&mut tracker, (4, 6), PeAxis::PeX, &[4, 3, 2], false).is_err());
    }

    #[test]
    fn double_claim_rejected() {
        let mut tracker = AxisTracker::new();
        tracker.claim(PeAxis::PeX).unwrap();
        assert!(tracker.claim(PeAxis::PeX).is_err());
    }
}
