//! Slice scheduling on the clock axis.
//!
//! After premapping, every tensor's shape ends in `[.., t_clk, slice]`.
//! Alignment folds the slice axis into the clock axis (serialization),
//! pads the clock axis with stall/latency cycles, and pads the slice axis
//! with dummy packs; decomposition reverses each step exactly.
//!
//! All operations here take the coordinate set as an `Option` so the same
//! code drives the shape-only pre-plan mode.

use crate::coords::CoordMatrix;
use crate::error::{DataflowError, Result};
use crate::policy::DummyPackMode;

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Fold the trailing slice axis into the clock axis.
///
/// With `pack_size == 1` the slice index becomes the high digits of a wider
/// clock index and the slice axis disappears. With `pack_size > 1` slices
/// group into packs: the in-pack remainder selects a clock offset while the
/// pack index remains as a (shorter) slice axis.
pub fn serialize_slices(
    coords: Option<&mut CoordMatrix>,
    shape: &mut Vec<usize>,
    slice_clk: Option<usize>,
    pack_size: usize,
) -> Result<()> {
    if shape.len() < 2 {
        return Err(DataflowError::config(
            "serialization needs a clock and a slice axis",
        ));
    }
    let clk_dim = shape.len() - 2;
    let slice_dim = shape.len() - 1;
    let slice_clk = slice_clk.unwrap_or(shape[clk_dim]);
    let slice_num = shape[slice_dim];

    if let Some(coords) = coords {
        if coords.width() != shape.len() {
            return Err(DataflowError::CoordWidth {
                expected: shape.len(),
                got: coords.width(),
            });
        }
        let clk = coords.column(clk_dim);
        let slice = coords.column(slice_dim);
        let pe = coords.remove_columns(&[clk_dim, slice_dim]);
        let pack = pack_size as i64;
        let sclk = slice_clk as i64;
        if pack_size > 1 {
            let new_clk: Vec<i64> = clk
                .iter()
                .zip(&slice)
                .map(|(&c, &s)| (s % pack) * sclk + c)
                .collect();
            let new_slice: Vec<i64> = slice.iter().map(|&s| s / pack).collect();
            let mut out = pe.insert_column(pe.width(), &new_clk);
            out = out.insert_column(out.width(), &new_slice);
            *coords = out;
        } else {
            let new_clk: Vec<i64> = clk
                .iter()
                .zip(&slice)
                .map(|(&c, &s)| s * sclk + c)
                .collect();
            *coords = pe.insert_column(pe.width(), &new_clk);
        }
    }

    shape.truncate(shape.len() - 2);
    if pack_size > 1 {
        shape.push(slice_clk * pack_size);
        shape.push(div_ceil(slice_num, pack_size));
    } else {
        shape.push(slice_clk * slice_num);
    }
    Ok(())
}

/// Split the clock axis back into clock and slice axes; exact inverse of
/// [`serialize_slices`].
pub fn deserialize_slices(
    coords: &mut CoordMatrix,
    shape: &mut Vec<usize>,
    slice_clk: Option<usize>,
    pack_size: usize,
) -> Result<()> {
    if pack_size > 1 {
        if shape.len() < 2 {
            return Err(DataflowError::config(
                "pack-grouped deserialization needs a clock and a slice axis",
            ));
        }
        let clk_dim = shape.len() - 2;
        let slice_dim = shape.len() - 1;
        let slice_clk = slice_clk.unwrap_or(shape[clk_dim] / pack_size);
        let slice_num = shape[slice_dim] * pack_size;

        if coords.width() != shape.len() {
            return Err(DataflowError::CoordWidth {
                expected: shape.len(),
                got: coords.width(),
            });
        }
        let clk = coords.column(clk_dim);
        let slice = coords.column(slice_dim);
        let pe = coords.remove_columns(&[clk_dim, slice_dim]);
        let pack = pack_size as i64;
        let sclk = slice_clk as i64;
        let new_clk: Vec<i64> = clk.iter().map(|&c| c.rem_euclid(sclk)).collect();
        let new_slice: Vec<i64> = clk
            .iter()
            .zip(&slice)
            .map(|(&c, &s)| s * pack + c.div_euclid(sclk))
            .collect();
        let mut out = pe.insert_column(pe.width(), &new_clk);
        out = out.insert_column(out.width(), &new_slice);
        *coords = out;

        shape.truncate(shape.len() - 2);
        shape.push(slice_clk);
        shape.push(slice_num);
    } else {
        if shape.is_empty() {
            return Err(DataflowError::config("deserialization needs a clock axis"));
        }
        let clk_dim = shape.len() - 1;
        let slice_clk = slice_clk.unwrap_or(shape[clk_dim]);
        let slice_num = div_ceil(shape[clk_dim], slice_clk);

        if coords.width() != shape.len() {
            return Err(DataflowError::CoordWidth {
                expected: shape.len(),
                got: coords.width(),
            });
        }
        let clk = coords.column(clk_dim);
        let pe = coords.remove_columns(&[clk_dim]);
        let sclk = slice_clk as i64;
        let new_clk: Vec<i64> = clk.iter().map(|&c| c.rem_euclid(sclk)).collect();
        let new_slice: Vec<i64> = clk.iter().map(|&c| c.div_euclid(sclk)).collect();
        let mut out = pe.insert_column(pe.width(), &new_clk);
        out = out.insert_column(out.width(), &new_slice);
        *coords = out;

        shape.truncate(shape.len() - 1);
        shape.push(slice_clk);
        shape.push(slice_num);
    }
    Ok(())
}

/// Add stall/latency cycles to the clock axis (`shape[-2]`).
pub fn insert_stall(
    coords: Option<&mut CoordMatrix>,
    shape: &mut Vec<usize>,
    cycles: usize,
) -> Result<()> {
    if shape.len() < 2 {
        return Err(DataflowError::config(
            "stall insertion needs a clock and a slice axis",
        ));
    }
    let clk_dim = shape.len() - 2;
    if let Some(coords) = coords {
        coords.map_column(clk_dim, |c| c + cycles as i64);
    }
    shape[clk_dim] += cycles;
    Ok(())
}

/// Remove stall/latency cycles from the clock axis; exact inverse of
/// [`insert_stall`].
pub fn remove_stall(
    coords: Option<&mut CoordMatrix>,
    shape: &mut Vec<usize>,
    cycles: usize,
) -> Result<()> {
    if shape.len() < 2 {
        return Err(DataflowError::config(
            "stall removal needs a clock and a slice axis",
        ));
    }
    let clk_dim = shape.len() - 2;
    if let Some(coords) = coords {
        coords.map_column(clk_dim, |c| c - cycles as i64);
    }
    shape[clk_dim] -= cycles;
    Ok(())
}

/// Insert dummy slice packs on the trailing slice axis.
pub fn insert_dummy_packs(
    coords: Option<&mut CoordMatrix>,
    shape: &mut Vec<usize>,
    mode: DummyPackMode,
    count: usize,
) -> Result<()> {
    if shape.is_empty() {
        return Err(DataflowError::config("dummy insertion needs a slice axis"));
    }
    let slice_dim = shape.len() - 1;
    let n = count as i64;
    match mode {
        DummyPackMode::PreAll => {
            if let Some(coords) = coords {
                coords.map_column(slice_dim, |s| s + n);
            }
            shape[slice_dim] += count;
        }
        DummyPackMode::PostAll => {
            shape[slice_dim] += count;
        }
        DummyPackMode::PreEach => {
            if let Some(coords) = coords {
                coords.map_column(slice_dim, |s| s * (n + 1) + n);
            }
            shape[slice_dim] *= count + 1;
        }
        DummyPackMode::PostEach => {
            if let Some(coords) = coords {
                coords.map_column(slice_dim, |s| s * (n + 1));
            }
            shape[slice_dim] *= count + 1;
        }
    }
    Ok(())
}

/// Remove dummy slice packs, keeping only records in the real-data residue
/// class of the insertion mode. Returns the keep-mask applied to the
/// coordinates so the caller can drop fault records alongside.
pub fn remove_dummy_packs(
    coords: &mut CoordMatrix,
    shape: &mut Vec<usize>,
    mode: DummyPackMode,
    count: usize,
) -> Result<Vec<bool>> {
    if shape.is_empty() {
        return Err(DataflowError::config("dummy removal needs a slice axis"));
    }
    let slice_dim = shape.len() - 1;
    let n = count as i64;
    let slices = coords.column(slice_dim);
    let keep: Vec<bool> = match mode {
        DummyPackMode::PreAll => slices.iter().map(|&s| s >= n).collect(),
        DummyPackMode::PostAll => {
            let limit = shape[slice_dim] as i64 - n;
            slices.iter().map(|&s| s < limit).collect()
        }
        DummyPackMode::PreEach => slices.iter().map(|&s| s % (n + 1) == n).collect(),
        DummyPackMode::PostEach => slices.iter().map(|&s| s % (n + 1) == 0).collect(),
    };
    *coords = coords.filter(&keep);
    match mode {
        DummyPackMode::PreAll => {
            coords.map_column(slice_dim, |s| s - n);
            shape[slice_dim] -= count;
        }
        DummyPackMode::PostAll => {
            shape[slice_dim] -= count;
        }
        DummyPackMode::PreEach | DummyPackMode::PostEach => {
            coords.map_column(slice_dim, |s| s / (n + 1));
            shape[slice_dim] /= count + 1;
        }
    }
    Ok(keep)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords4() -> CoordMatrix {
        // [pe_y, pe_x, clk, slice]
        CoordMatrix::from_rows(4, &[&[0, 1, 2, 0], &[1, 0, 3, 4], &[2, 2, 0, 5]]).unwrap()
    }

    #[test]
    fn serialize_flattens_slices() {
        let mut coords = coords4();
        let mut shape = vec![3, 3, 4, 6];
        serialize_slices(Some(&mut coords), &mut shape, None, 1).unwrap();
        assert_eq!(shape, vec![3, 3, 24]);
        // clk' = slice*4 + clk
        assert_eq!(coords.column(2), vec![2, 19, 20]);
    }

    #[test]
    fn serialize_deserialize_identity_pack_1() {
        let original = coords4();
        let mut coords = original.clone();
        let mut shape = vec![3, 3, 4, 6];
        serialize_slices(Some(&mut coords), &mut shape, None, 1).unwrap();
        deserialize_slices(&mut coords, &mut shape, Some(4), 1).unwrap();
        assert_eq!(shape, vec![3, 3, 4, 6]);
        assert_eq!(coords, original);
    }

    #[test]
    fn serialize_deserialize_identity_pack_3() {
        let original = coords4();
        let mut coords = original.clone();
        let mut shape = vec![3, 3, 4, 6];
        serialize_slices(Some(&mut coords), &mut shape, None, 3).unwrap();
        assert_eq!(shape, vec![3, 3, 12, 2]);
        deserialize_slices(&mut coords, &mut shape, None, 3).unwrap();
        assert_eq!(shape, vec![3, 3, 4, 6]);
        assert_eq!(coords, original);
    }

    #[test]
    fn stall_round_trips() {
        let original = coords4();
        let mut coords = original.clone();
        let mut shape = vec![3, 3, 4, 6];
        insert_stall(Some(&mut coords), &mut shape, 5).unwrap();
        assert_eq!(shape[2], 9);
        assert_eq!(coords.column(2), vec![7, 8, 5]);
        remove_stall(Some(&mut coords), &mut shape, 5).unwrap();
        assert_eq!(shape, vec![3, 3, 4, 6]);
        assert_eq!(coords, original);
    }

    #[test]
    fn dummy_pack_round_trips_every_mode() {
        for mode in [
            DummyPackMode::PreAll,
            DummyPackMode::PostAll,
            DummyPackMode::PreEach,
            DummyPackMode::PostEach,
        ] {
            for count in 1..=3 {
                let original = coords4();
                let mut coords = original.clone();
                let mut shape = vec![3, 3, 4, 6];
                insert_dummy_packs(Some(&mut coords), &mut shape, mode, count).unwrap();
                let keep = remove_dummy_packs(&mut coords, &mut shape, mode, count).unwrap();
                assert!(keep.iter().all(|&k| k), "{mode:?} n={count} dropped data");
                assert_eq!(shape, vec![3, 3, 4, 6], "{mode:?} n={count}");
                assert_eq!(coords, original, "{mode:?} n={count}");
            }
        }
    }

    #[test]
    fn dummy_pack_removal_drops_foreign_slices() {
        // pre_each n=1: real data sits at odd slice indices.
        let mut coords =
            CoordMatrix::from_rows(4, &[&[0, 0, 0, 0], &[0, 0, 0, 1], &[0, 0, 0, 2]]).unwrap();
        let mut shape = vec![3, 3, 4, 12];
        let keep =
            remove_dummy_packs(&mut coords, &mut shape, DummyPackMode::PreEach, 1).unwrap();
        assert_eq!(keep, vec![false, true, false]);
        assert_eq!(coords.rows(), 1);
        assert_eq!(coords.row(0)[3], 0);
        assert_eq!(shape[3], 6);
    }
}
