//! Property tests for the round-trip laws of the coordinate algebra.

use proptest::prelude::*;
use systolic_dataflow::schedule::{
    deserialize_slices, insert_dummy_packs, insert_stall, remove_dummy_packs, remove_stall,
    serialize_slices,
};
use systolic_dataflow::transform::permute_ravel;
use systolic_dataflow::{CoordMatrix, DummyPackMode};

/// Unravel a linear index into a row-major coordinate of `shape`.
fn unravel(mut lin: usize, shape: &[usize]) -> Vec<i64> {
    let mut coord = vec![0i64; shape.len()];
    for (i, &extent) in shape.iter().enumerate().rev() {
        coord[i] = (lin % extent) as i64;
        lin /= extent;
    }
    coord
}

fn permute_inputs() -> impl Strategy<
    Value = (
        Vec<usize>, // src shape
        Vec<usize>, // src priority
        Vec<usize>, // dst shape (same extents, shuffled)
        Vec<usize>, // dst priority
        Vec<usize>, // linear fault positions
    ),
> {
    prop::collection::vec(1usize..5, 2..5).prop_flat_map(|shape| {
        let rank = shape.len();
        let total: usize = shape.iter().product();
        let prior: Vec<usize> = (0..rank).collect();
        (
            Just(shape.clone()),
            Just(prior.clone()).prop_shuffle(),
            Just(shape).prop_shuffle(),
            Just(prior).prop_shuffle(),
            prop::collection::vec(0..total, 1..8),
        )
    })
}

proptest! {
    #[test]
    fn permute_round_trips((src_shape, src_prior, dst_shape, dst_prior, positions) in permute_inputs()) {
        let mut coords = CoordMatrix::empty(src_shape.len());
        for &p in &positions {
            coords.push_row(&unravel(p, &src_shape));
        }
        let fwd = permute_ravel(&coords, &src_shape, &src_prior, &dst_shape, &dst_prior).unwrap();
        let back = permute_ravel(&fwd, &dst_shape, &dst_prior, &src_shape, &src_prior).unwrap();
        prop_assert_eq!(back, coords);
    }
}

fn scheduled_coords() -> impl Strategy<Value = (Vec<usize>, Vec<Vec<i64>>)> {
    (1usize..5, 1usize..5, 1usize..6, 1usize..4).prop_flat_map(|(y, x, clk, packs)| {
        // Slice count is a multiple of every pack size under test so the
        // pack-grouped shapes reconstruct exactly.
        let slices = packs * 6;
        let shape = vec![y, x, clk, slices];
        let rows = prop::collection::vec(
            (0..y as i64, 0..x as i64, 0..clk as i64, 0..slices as i64)
                .prop_map(|(a, b, c, s)| vec![a, b, c, s]),
            1..10,
        );
        (Just(shape), rows)
    })
}

proptest! {
    #[test]
    fn serialize_round_trips((shape, rows) in scheduled_coords(), pack_size in 1usize..4) {
        let mut coords = CoordMatrix::empty(4);
        for row in &rows {
            coords.push_row(row);
        }
        let original = coords.clone();
        let mut work_shape = shape.clone();
        // Flattening (pack_size 1) erases the per-slice depth; hand it back
        // for the reverse split, as the engine does with its cached shapes.
        let slice_clk = (pack_size == 1).then_some(shape[2]);
        serialize_slices(Some(&mut coords), &mut work_shape, None, pack_size).unwrap();
        deserialize_slices(&mut coords, &mut work_shape, slice_clk, pack_size).unwrap();
        prop_assert_eq!(&work_shape, &shape);
        prop_assert_eq!(coords, original);
    }

    #[test]
    fn stall_round_trips((shape, rows) in scheduled_coords(), cycles in 1usize..8) {
        let mut coords = CoordMatrix::empty(4);
        for row in &rows {
            coords.push_row(row);
        }
        let original = coords.clone();
        let mut work_shape = shape.clone();
        insert_stall(Some(&mut coords), &mut work_shape, cycles).unwrap();
        remove_stall(Some(&mut coords), &mut work_shape, cycles).unwrap();
        prop_assert_eq!(&work_shape, &shape);
        prop_assert_eq!(coords, original);
    }

    #[test]
    fn dummy_packs_round_trip(
        (shape, rows) in scheduled_coords(),
        count in 1usize..4,
        mode_pick in 0usize..4,
    ) {
        let mode = [
            DummyPackMode::PreAll,
            DummyPackMode::PostAll,
            DummyPackMode::PreEach,
            DummyPackMode::PostEach,
        ][mode_pick];
        let mut coords = CoordMatrix::empty(4);
        for row in &rows {
            coords.push_row(row);
        }
        let original = coords.clone();
        let mut work_shape = shape.clone();
        insert_dummy_packs(Some(&mut coords), &mut work_shape, mode, count).unwrap();
        let keep = remove_dummy_packs(&mut coords, &mut work_shape, mode, count).unwrap();
        prop_assert!(keep.iter().all(|&k| k));
        prop_assert_eq!(&work_shape, &shape);
        prop_assert_eq!(coords, original);
    }
}
