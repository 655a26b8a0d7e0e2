//! Axis-mapping coordinate primitives.
//!
//! Four composable transforms move fault coordinates between tile index
//! space and PE dataflow space, each with a forward (tile -> PE) and a
//! backward (PE -> tile) form:
//!
//! | forward | backward |
//! |---------|----------|
//! | [`permute_ravel`] | [`permute_ravel`] with source/target swapped |
//! | [`fixed_insert`] | [`fixed_extract`] |
//! | [`broadcast_insert`] | [`narrowcast`] |
//! | [`stream_capture`] | [`stream_flowback`] |
//!
//! Fan-out transforms return a dispatch vector naming the source record of
//! every output row so the caller can replicate fault metadata alongside.

use crate::axes::FlowDirection;
use crate::coords::CoordMatrix;
use crate::error::{DataflowError, Result};

/// Axis indices sorted by priority value, most significant first.
///
/// Mirrors a descending argsort: the axis holding the largest priority value
/// ravels as the most-significant digit.
fn priority_order(prior: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..prior.len()).collect();
    order.sort_by_key(|&i| prior[i]);
    order.reverse();
    order
}

/// Convert coordinates between two shapes via a single linear index.
///
/// Each coordinate is collapsed to a linear index under the source priority
/// (row-major, most-significant axis first) and unraveled under the target
/// priority. Works for expansion and contraction alike, so the backward
/// mapping is the same call with source and target swapped.
pub fn permute_ravel(
    coords: &CoordMatrix,
    src_shape: &[usize],
    src_prior: &[usize],
    dst_shape: &[usize],
    dst_prior: &[usize],
) -> Result<CoordMatrix> {
    if src_shape.len() != src_prior.len() {
        return Err(DataflowError::PriorityLength {
            expected: src_shape.len(),
            got: src_prior.len(),
        });
    }
    if dst_shape.len() != dst_prior.len() {
        return Err(DataflowError::PriorityLength {
            expected: dst_shape.len(),
            got: dst_prior.len(),
        });
    }
    if coords.width() != src_shape.len() {
        return Err(DataflowError::CoordWidth {
            expected: src_shape.len(),
            got: coords.width(),
        });
    }

    let src_order = priority_order(src_prior);
    let dst_order = priority_order(dst_prior);

    let mut out = CoordMatrix::empty(dst_shape.len());
    let mut buf = vec![0i64; dst_shape.len()];
    for row in coords.iter_rows() {
        let mut lin: i64 = 0;
        for &ax in &src_order {
            lin = lin * src_shape[ax] as i64 + row[ax];
        }
        for &ax in dst_order.iter().rev() {
            let extent = dst_shape[ax] as i64;
            buf[ax] = lin.rem_euclid(extent);
            lin = lin.div_euclid(extent);
        }
        out.push_row(&buf);
    }
    Ok(out)
}

fn resolve_fix_indices(
    fix_dims: &[usize],
    fix_indices: &[i64],
    target_shape: &[usize],
) -> Result<Vec<i64>> {
    if fix_dims.len() != fix_indices.len() {
        return Err(DataflowError::config(format!(
            "{} fixed dimensions but {} indices",
            fix_dims.len(),
            fix_indices.len()
        )));
    }
    fix_dims
        .iter()
        .zip(fix_indices)
        .map(|(&d, &v)| {
            let extent = target_shape[d] as i64;
            let resolved = if v < 0 { extent + v } else { v };
            if resolved < 0 || resolved >= extent {
                return Err(DataflowError::config(format!(
                    "fixed index {v} outside extent {extent} on axis {d}"
                )));
            }
            Ok(resolved)
        })
        .collect()
}

/// Insert constant indices on the fixed target axes.
///
/// `axis_map[i]` is the target position of source axis `i`.
pub fn fixed_insert(
    coords: &CoordMatrix,
    fix_dims: &[usize],
    fix_indices: &[i64],
    target_shape: &[usize],
    axis_map: &[usize],
) -> Result<CoordMatrix> {
    if coords.width() + fix_dims.len() != target_shape.len() {
        return Err(DataflowError::CoordWidth {
            expected: target_shape.len() - fix_dims.len(),
            got: coords.width(),
        });
    }
    let resolved = resolve_fix_indices(fix_dims, fix_indices, target_shape)?;

    let mut out = CoordMatrix::empty(target_shape.len());
    let mut buf = vec![0i64; target_shape.len()];
    for row in coords.iter_rows() {
        for (d, v) in fix_dims.iter().zip(&resolved) {
            buf[*d] = *v;
        }
        for (i, &ax) in axis_map.iter().enumerate() {
            buf[ax] = row[i];
        }
        out.push_row(&buf);
    }
    Ok(out)
}

/// Remove the fixed axes, keeping only coordinates inside the fixed area.
///
/// Returns the narrowed coordinates plus the keep-mask over the input rows,
/// so the caller can drop the matching fault records.
pub fn fixed_extract(
    coords: &CoordMatrix,
    fix_dims: &[usize],
    fix_indices: &[i64],
    target_shape: &[usize],
    axis_map: &[usize],
) -> Result<(CoordMatrix, Vec<bool>)> {
    if coords.width() != target_shape.len() {
        return Err(DataflowError::CoordWidth {
            expected: target_shape.len(),
            got: coords.width(),
        });
    }
    let resolved = resolve_fix_indices(fix_dims, fix_indices, target_shape)?;

    let mut out = CoordMatrix::empty(axis_map.len());
    let mut keep = Vec::with_capacity(coords.rows());
    let mut buf = vec![0i64; axis_map.len()];
    for row in coords.iter_rows() {
        let inside = fix_dims
            .iter()
            .zip(&resolved)
            .all(|(&d, &v)| row[d] == v);
        keep.push(inside);
        if inside {
            for (i, &ax) in axis_map.iter().enumerate() {
                buf[i] = row[ax];
            }
            out.push_row(&buf);
        }
    }
    Ok((out, keep))
}

/// Replicate every coordinate across all index combinations of the
/// broadcast target axes.
///
/// One input coordinate fans out to the product of the broadcast extents;
/// the dispatch vector names the source row of each output row.
pub fn broadcast_insert(
    coords: &CoordMatrix,
    target_shape: &[usize],
    broadcast_dims: &[usize],
    axis_map: &[usize],
) -> Result<(CoordMatrix, Vec<usize>)> {
    if coords.width() + broadcast_dims.len() != target_shape.len() {
        return Err(DataflowError::CoordWidth {
            expected: target_shape.len() - broadcast_dims.len(),
            got: coords.width(),
        });
    }
    let extents: Vec<usize> = broadcast_dims.iter().map(|&d| target_shape[d]).collect();
    let fanout: usize = extents.iter().product();

    let mut out = CoordMatrix::empty(target_shape.len());
    let mut dispatch = Vec::with_capacity(coords.rows() * fanout);
    let mut buf = vec![0i64; target_shape.len()];
    for (r, row) in coords.iter_rows().enumerate() {
        for (i, &ax) in axis_map.iter().enumerate() {
            buf[ax] = row[i];
        }
        // Walk the broadcast index space in row-major order.
        for mut leaf in 0..fanout {
            for (d, &extent) in broadcast_dims.iter().zip(&extents).rev() {
                buf[*d] = (leaf % extent) as i64;
                leaf /= extent;
            }
            out.push_row(&buf);
            dispatch.push(r);
        }
    }
    Ok((out, dispatch))
}

/// Remove the broadcast axes (narrowcast). Coincident results are left for a
/// subsequent collapse to merge.
pub fn narrowcast(
    coords: &CoordMatrix,
    broadcast_dims: &[usize],
    axis_map: &[usize],
) -> Result<CoordMatrix> {
    if coords.width() != axis_map.len() + broadcast_dims.len() {
        return Err(DataflowError::CoordWidth {
            expected: axis_map.len() + broadcast_dims.len(),
            got: coords.width(),
        });
    }
    let mut out = CoordMatrix::empty(axis_map.len());
    let mut buf = vec![0i64; axis_map.len()];
    for row in coords.iter_rows() {
        for (i, &ax) in axis_map.iter().enumerate() {
            buf[i] = row[ax];
        }
        out.push_row(&buf);
    }
    Ok(out)
}

/// Capture a streamed tensor through a sliding PE window.
///
/// Each data position is seen by all `w` PEs of the window; the captured
/// clock is the position along the data's stream axis (reflected for
/// backward tile flow) plus the window offset of the capturing PE (0..w for
/// a forward sweep, reversed for a backward one). One input coordinate
/// yields `w` (PE position, clock) captures.
#[allow(clippy::too_many_arguments)]
pub fn stream_capture(
    coords: &CoordMatrix,
    data_shape: &[usize],
    data_stream_axis: usize,
    window_shape: &[usize],
    window_stream_axis: usize,
    window_clk_axis: usize,
    tile_flow: FlowDirection,
    pe_flow: FlowDirection,
    axis_map: &[usize],
) -> Result<(CoordMatrix, Vec<usize>)> {
    if window_shape.len() != data_shape.len() + 1 {
        return Err(DataflowError::config(format!(
            "stream window rank {} must exceed data rank {} by one",
            window_shape.len(),
            data_shape.len()
        )));
    }
    if coords.width() != data_shape.len() {
        return Err(DataflowError::CoordWidth {
            expected: data_shape.len(),
            got: coords.width(),
        });
    }
    let w = window_shape[window_stream_axis];
    let reflect = data_shape[data_stream_axis] as i64 - 1;

    let mut out = CoordMatrix::empty(window_shape.len());
    let mut dispatch = Vec::with_capacity(coords.rows() * w);
    let mut buf = vec![0i64; window_shape.len()];
    for (r, row) in coords.iter_rows().enumerate() {
        let base = match tile_flow {
            FlowDirection::Forward => row[data_stream_axis],
            FlowDirection::Backward => reflect - row[data_stream_axis],
        };
        for pe in 0..w {
            let offset = match pe_flow {
                FlowDirection::Forward => pe,
                FlowDirection::Backward => w - 1 - pe,
            } as i64;
            for (i, &ax) in axis_map.iter().enumerate() {
                buf[ax] = if i == data_stream_axis {
                    pe as i64
                } else {
                    row[i]
                };
            }
            buf[window_clk_axis] = base + offset;
            out.push_row(&buf);
            dispatch.push(r);
        }
    }
    Ok((out, dispatch))
}

/// Reconstruct the pre-capture data position from a windowed capture.
///
/// Subtracts the capturing PE's window offset from the captured clock and
/// undoes the tile-flow reflection; exact inverse of [`stream_capture`] for
/// every direction combination. Out-of-range results (pipeline fill/drain
/// captures of other data) are left for the caller's outlier drop.
#[allow(clippy::too_many_arguments)]
pub fn stream_flowback(
    coords: &CoordMatrix,
    data_shape: &[usize],
    data_stream_axis: usize,
    window_shape: &[usize],
    window_stream_axis: usize,
    window_clk_axis: usize,
    tile_flow: FlowDirection,
    pe_flow: FlowDirection,
    axis_map: &[usize],
) -> Result<CoordMatrix> {
    if window_shape.len() != data_shape.len() + 1 {
        return Err(DataflowError::config(format!(
            "stream window rank {} must exceed data rank {} by one",
            window_shape.len(),
            data_shape.len()
        )));
    }
    if coords.width() != window_shape.len() {
        return Err(DataflowError::CoordWidth {
            expected: window_shape.len(),
            got: coords.width(),
        });
    }
    let w = window_shape[window_stream_axis] as i64;
    let reflect = data_shape[data_stream_axis] as i64 - 1;

    let mut out = CoordMatrix::empty(data_shape.len());
    let mut buf = vec![0i64; data_shape.len()];
    for row in coords.iter_rows() {
        let pe = row[window_stream_axis];
        let offset = match pe_flow {
            FlowDirection::Forward => pe,
            FlowDirection::Backward => w - 1 - pe,
        };
        let base = row[window_clk_axis] - offset;
        let data_pos = match tile_flow {
            FlowDirection::Forward => base,
            FlowDirection::Backward => reflect - base,
        };
        for (i, &ax) in axis_map.iter().enumerate() {
            buf[i] = if i == data_stream_axis {
                data_pos
            } else {
                row[ax]
            };
        }
        out.push_row(&buf);
    }
    Ok(out)
}

/// Keep-mask for coordinates inside `[0, extent)` on every axis of `shape`.
pub fn outlier_mask(coords: &CoordMatrix, shape: &[usize]) -> Result<Vec<bool>> {
    if coords.width() != shape.len() {
        return Err(DataflowError::CoordWidth {
            expected: shape.len(),
            got: coords.width(),
        });
    }
    Ok(coords
        .iter_rows()
        .map(|row| {
            row.iter()
                .zip(shape)
                .all(|(&v, &e)| v >= 0 && v < e as i64)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permute_transposes_via_linear_index() {
        // 2x3 row-major -> 3x2 with swapped significance.
        let coords = CoordMatrix::from_rows(2, &[&[1, 2]]).unwrap();
        let out = permute_ravel(&coords, &[2, 3], &[1, 0], &[3, 2], &[0, 1]).unwrap();
        // Linear index 1*3+2 = 5; target raveled with axis 1 most
        // significant: 5 = col*3 + row -> (2, 1).
        assert_eq!(out.row(0), &[2, 1]);
    }

    #[test]
    fn permute_round_trips() {
        let coords =
            CoordMatrix::from_rows(3, &[&[0, 1, 2], &[3, 2, 1], &[1, 0, 0]]).unwrap();
        let src_shape = [4, 3, 3];
        let src_prior = [2, 1, 0];
        let dst_shape = [6, 2, 3];
        let dst_prior = [0, 2, 1];
        let fwd = permute_ravel(&coords, &src_shape, &src_prior, &dst_shape, &dst_prior).unwrap();
        let back = permute_ravel(&fwd, &dst_shape, &dst_prior, &src_shape, &src_prior).unwrap();
        assert_eq!(back, coords);
    }

    #[test]
    fn permute_rejects_length_mismatch() {
        let coords = CoordMatrix::from_rows(2, &[&[0, 0]]).unwrap();
        assert!(matches!(
            permute_ravel(&coords, &[2, 2], &[0], &[4], &[0]),
            Err(DataflowError::PriorityLength { .. })
        ));
    }

    #[test]
    fn broadcast_fans_out_across_axis() {
        // data_shape=(3,), target_shape=(3,4), broadcast axis 1:
        // (1,) -> (1,0) (1,1) (1,2) (1,3).
        let coords = CoordMatrix::from_rows(1, &[&[1]]).unwrap();
        let (out, dispatch) = broadcast_insert(&coords, &[3, 4], &[1], &[0]).unwrap();
        assert_eq!(out.rows(), 4);
        for k in 0..4 {
            assert_eq!(out.row(k), &[1, k as i64]);
        }
        assert_eq!(dispatch, vec![0, 0, 0, 0]);
    }

    #[test]
    fn narrowcast_undoes_broadcast() {
        let coords = CoordMatrix::from_rows(1, &[&[1], &[2]]).unwrap();
        let (wide, _) = broadcast_insert(&coords, &[3, 4], &[1], &[0]).unwrap();
        let narrow = narrowcast(&wide, &[1], &[0]).unwrap();
        assert_eq!(narrow.column(0), vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn fixed_pins_axis_to_index() {
        // fix_dims=0, index=2, target_shape=(5,6): (3,) -> (2,3).
        let coords = CoordMatrix::from_rows(1, &[&[3]]).unwrap();
        let out = fixed_insert(&coords, &[0], &[2], &[5, 6], &[1]).unwrap();
        assert_eq!(out.row(0), &[2, 3]);
    }

    #[test]
    fn fixed_extract_filters_non_fixed_area() {
        let coords = CoordMatrix::from_rows(2, &[&[2, 3], &[1, 3], &[2, 5]]).unwrap();
        let (out, keep) = fixed_extract(&coords, &[0], &[2], &[5, 6], &[1]).unwrap();
        assert_eq!(keep, vec![true, false, true]);
        assert_eq!(out.column(0), vec![3, 5]);
    }

    #[test]
    fn fixed_negative_index_resolves_from_end() {
        let coords = CoordMatrix::from_rows(1, &[&[0]]).unwrap();
        let out = fixed_insert(&coords, &[0], &[-1], &[5, 6], &[1]).unwrap();
        assert_eq!(out.row(0), &[4, 0]);
    }

    #[test]
    fn stream_capture_sweeps_window() {
        // Window width 3 over data length 5, both directions forward:
        // position 2 -> (PE 0, clk 2), (PE 1, clk 3), (PE 2, clk 4).
        let coords = CoordMatrix::from_rows(1, &[&[2]]).unwrap();
        let (out, dispatch) = stream_capture(
            &coords,
            &[5],
            0,
            &[3, 7],
            0,
            1,
            FlowDirection::Forward,
            FlowDirection::Forward,
            &[0],
        )
        .unwrap();
        assert_eq!(out.rows(), 3);
        assert_eq!(out.row(0), &[0, 2]);
        assert_eq!(out.row(1), &[1, 3]);
        assert_eq!(out.row(2), &[2, 4]);
        assert_eq!(dispatch, vec![0, 0, 0]);
    }

    #[test]
    fn stream_round_trips_all_directions() {
        let coords = CoordMatrix::from_rows(1, &[&[0], &[2], &[4]]).unwrap();
        for tile_flow in [FlowDirection::Forward, FlowDirection::Backward] {
            for pe_flow in [FlowDirection::Forward, FlowDirection::Backward] {
                let (caught, _) = stream_capture(
                    &coords,
                    &[5],
                    0,
                    &[3, 7],
                    0,
                    1,
                    tile_flow,
                    pe_flow,
                    &[0],
                )
                .unwrap();
                let back = stream_flowback(
                    &caught,
                    &[5],
                    0,
                    &[3, 7],
                    0,
                    1,
                    tile_flow,
                    pe_flow,
                    &[0],
                )
                .unwrap();
                // Every capture of a position flows back to that position.
                for (i, row) in back.iter_rows().enumerate() {
                    assert_eq!(row[0], coords.get(i / 3, 0));
                }
            }
        }
    }

    #[test]
    fn outlier_mask_bounds_every_axis() {
        let coords =
            CoordMatrix::from_rows(2, &[&[0, 0], &[-1, 0], &[1, 3], &[2, 0]]).unwrap();
        let mask = outlier_mask(&coords, &[2, 4]).unwrap();
        assert_eq!(mask, vec![true, false, true, false]);
    }
}
