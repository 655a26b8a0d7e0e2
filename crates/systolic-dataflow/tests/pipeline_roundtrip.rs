//! End-to-end mapping pipeline tests.
//!
//! The reference configuration is a 4x4 weight-stationary array that
//! exercises all four axis-mapping disciplines:
//!
//! - ifmap: permuted onto rows/clock, streamed across columns
//! - weight: resident per PE, broadcast over the clock axis
//! - ofmap: permuted onto the whole grid with two drain cycles
//! - bias: one row, fixed placement, pinned to the first cycle
//! - psum: permuted onto columns/clock, streamed down the rows backwards

use std::collections::{BTreeMap, BTreeSet};
use systolic_dataflow::prelude::*;
use systolic_dataflow::table::FaultMeta;
use systolic_dataflow::FaultColumns;

fn reference_setup() -> DataflowSetup {
    let ifmap = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeY, PeAxis::Clk], vec![2, 1, 0]).unwrap())
        .with_streaming(
            StreamMap::new(PeAxis::PeX, FlowDirection::Forward, FlowDirection::Forward).unwrap(),
        );
    let wght = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeY, PeAxis::PeX], vec![2, 1, 0]).unwrap())
        .with_broadcast(BroadcastMap::new(vec![PeAxis::Clk]).unwrap());
    let ofmap = DataflowPolicy::new()
        .with_permute(
            PermuteMap::new(vec![PeAxis::PeY, PeAxis::PeX, PeAxis::Clk], vec![2, 1, 0]).unwrap(),
        )
        .with_stall_latency(2);
    let bias = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeX], vec![1, 0]).unwrap())
        .with_fixed(FixedMap::new(vec![PeAxis::PeY, PeAxis::Clk], vec![0, 0]).unwrap());
    let psum = DataflowPolicy::new()
        .with_permute(PermuteMap::new(vec![PeAxis::PeX, PeAxis::Clk], vec![2, 1, 0]).unwrap())
        .with_streaming(
            StreamMap::new(PeAxis::PeY, FlowDirection::Backward, FlowDirection::Backward)
                .unwrap(),
        );
    DataflowSetup::new()
        .with_ifmap(ifmap)
        .with_wght(wght)
        .with_ofmap(ofmap)
        .with_bias(bias)
        .with_psum(psum)
}

fn tile_faults(width: usize, coords: &[&[i64]], port: PortTag) -> FaultTable {
    let mut cols = FaultColumns::empty(width);
    for (id, coord) in coords.iter().enumerate() {
        cols.push(coord, FaultMeta::single(port, FaultMode::BitFlip, 3, id as u64));
    }
    FaultTable::Columnar(cols)
}

fn engine_with(
    ifmap_faults: Option<FaultTable>,
    wght_faults: Option<FaultTable>,
    ofmap_faults: Option<FaultTable>,
    bias_faults: Option<FaultTable>,
) -> PeArray {
    let mut ifmap = Tile::new(vec![4, 3, 2]);
    let mut wght = Tile::new(vec![4, 4, 2]).with_bias_shape(vec![4, 2]);
    let mut ofmap = Tile::new(vec![4, 4, 2]);
    if let Some(f) = ifmap_faults {
        ifmap = ifmap.with_faults(f);
    }
    if let Some(f) = wght_faults {
        wght = wght.with_faults(f);
    }
    if let Some(f) = ofmap_faults {
        ofmap = ofmap.with_faults(f);
    }
    if let Some(f) = bias_faults {
        wght = wght.with_bias_faults(f);
    }
    let mut pe = PeArray::new(4, 4);
    pe.set_tiles(ifmap, wght, ofmap);
    pe.configure_dataflow(reference_setup());
    pe
}

const ALL_ROLES: [TensorRole; 5] = [
    TensorRole::Ifmap,
    TensorRole::Weight,
    TensorRole::Ofmap,
    TensorRole::Bias,
    TensorRole::Psum,
];

/// Forward pipeline with real fault mapping for `mapped` only; every other
/// role runs shape-only so the unified table holds exactly one tensor's
/// faults.
fn run_forward(pe: &mut PeArray, mapped: TensorRole) {
    for role in ALL_ROLES {
        pe.premap(role, role != mapped).unwrap();
        pe.duplicate_mapping(role).unwrap();
    }
    pe.align_slice_pack().unwrap();
}

fn coord_id_sets(table: &FaultTable) -> BTreeMap<Vec<i64>, BTreeSet<u64>> {
    let cols = table.clone().into_columnar();
    let mut out = BTreeMap::new();
    for (row, meta) in cols.coords().iter_rows().zip(cols.meta()) {
        let entry: &mut BTreeSet<u64> = out.entry(row.to_vec()).or_default();
        entry.extend(meta.ids.iter().copied());
    }
    out
}

fn assert_round_trip(original: &FaultTable, recovered: &FaultTable) {
    assert_eq!(coord_id_sets(original), coord_id_sets(recovered));
}

#[test]
fn ifmap_streaming_round_trip() {
    let faults = tile_faults(3, &[&[0, 0, 0], &[2, 1, 1], &[3, 2, 0]], PortTag::IfmapIn);
    let mut pe = engine_with(Some(faults.clone()), None, None, None);
    run_forward(&mut pe, TensorRole::Ifmap);
    // Streaming fans each fault out to one capture per window column.
    assert_eq!(pe.fault_table().len(), 3 * 4);

    pe.decompose_slice_pack().unwrap();
    pe.reduce_mapping(TensorRole::Ifmap).unwrap();
    pe.demap(TensorRole::Ifmap).unwrap();
    assert_round_trip(&faults, &pe.ifmap_tile().unwrap().faults);
}

#[test]
fn weight_broadcast_round_trip() {
    let faults = tile_faults(3, &[&[0, 0, 0], &[3, 3, 1], &[1, 2, 0]], PortTag::WghtIn);
    let mut pe = engine_with(None, Some(faults.clone()), None, None);
    run_forward(&mut pe, TensorRole::Weight);

    pe.decompose_slice_pack().unwrap();
    pe.reduce_mapping(TensorRole::Weight).unwrap();
    pe.demap(TensorRole::Weight).unwrap();
    assert_round_trip(&faults, &pe.wght_tile().unwrap().faults);
}

#[test]
fn ofmap_stall_round_trip() {
    let faults = tile_faults(3, &[&[1, 1, 0], &[2, 3, 1], &[0, 0, 0]], PortTag::PsumOut);
    let mut pe = engine_with(None, None, Some(faults.clone()), None);
    run_forward(&mut pe, TensorRole::Ofmap);

    pe.decompose_slice_pack().unwrap();
    pe.reduce_mapping(TensorRole::Ofmap).unwrap();
    pe.demap(TensorRole::Ofmap).unwrap();
    assert_round_trip(&faults, &pe.ofmap_tile().unwrap().faults);
}

#[test]
fn bias_fixed_round_trip() {
    let faults = tile_faults(2, &[&[0, 0], &[3, 1], &[2, 0]], PortTag::PsumIn);
    let mut pe = engine_with(None, None, None, Some(faults.clone()));
    run_forward(&mut pe, TensorRole::Bias);

    pe.decompose_slice_pack().unwrap();
    pe.reduce_mapping(TensorRole::Bias).unwrap();
    pe.demap(TensorRole::Bias).unwrap();
    assert_round_trip(&faults, &pe.wght_tile().unwrap().bias_faults);
}

#[test]
fn psum_backward_streaming_round_trip() {
    // Psum maps the ofmap tile's faults through its own backward-flowing
    // stream; the recovered table lands in the ofmap tile's psum slot.
    let faults = tile_faults(3, &[&[1, 1, 0], &[2, 3, 1]], PortTag::PsumOut);
    let mut pe = engine_with(None, None, Some(faults.clone()), None);
    run_forward(&mut pe, TensorRole::Psum);

    pe.decompose_slice_pack().unwrap();
    pe.reduce_mapping(TensorRole::Psum).unwrap();
    pe.demap(TensorRole::Psum).unwrap();
    assert_round_trip(&faults, &pe.ofmap_tile().unwrap().psum_faults);
}

#[test]
fn repeat_and_duplicate_round_trip() {
    let faults = tile_faults(3, &[&[0, 0, 0], &[2, 1, 1]], PortTag::IfmapIn);
    let setup = {
        let mut s = reference_setup();
        s.ifmap = s.ifmap.clone().with_repeat(2).with_duplicate(2);
        s
    };
    let ifmap = Tile::new(vec![4, 3, 2]).with_faults(faults.clone());
    let wght = Tile::new(vec![4, 4, 2]).with_bias_shape(vec![4, 2]);
    let ofmap = Tile::new(vec![4, 4, 2]);
    let mut pe = PeArray::new(4, 4);
    pe.set_tiles(ifmap, wght, ofmap);
    pe.configure_dataflow(setup);

    run_forward(&mut pe, TensorRole::Ifmap);
    // 2 repeats x 2 duplicates multiply the ifmap pack count.
    assert_eq!(pe.pack_num(), Some(8));

    pe.decompose_slice_pack().unwrap();
    pe.reduce_mapping(TensorRole::Ifmap).unwrap();
    pe.demap(TensorRole::Ifmap).unwrap();
    assert_round_trip(&faults, &pe.ifmap_tile().unwrap().faults);
}

#[test]
fn alignment_depth_matches_reference() {
    let mut pe = engine_with(None, None, None, None);
    for role in ALL_ROLES {
        pe.premap(role, true).unwrap();
    }
    pe.align_slice_pack().unwrap();
    // ifmap streams over 3 + (4-1) cycles, psum over 4 + (4-1).
    assert_eq!(pe.pack_clk(), Some(7));
    assert_eq!(pe.pack_num(), Some(2));
    assert_eq!(pe.n_clk(), Some(14));
}

#[test]
fn generated_trial_recovers_in_bounds_faults() {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    let mut pe = engine_with(None, None, None, None);
    for role in ALL_ROLES {
        pe.premap(role, true).unwrap();
        pe.duplicate_mapping(role).unwrap();
    }
    pe.align_slice_pack().unwrap();
    let cache = pe.save_shapes().unwrap();

    let mut rng = StdRng::seed_from_u64(2024);
    for trial in 0..20 {
        pe.restore_shapes(&cache).unwrap();
        pe.gen_transient_faults(&mut rng, 8, 12, FaultMode::BitFlip, None)
            .unwrap();
        pe.decompose_slice_pack().unwrap();
        for role in ALL_ROLES {
            pe.demap(role).unwrap();
        }
        let tiles = [
            (pe.ifmap_tile().unwrap().faults.clone(), vec![4usize, 3, 2]),
            (pe.wght_tile().unwrap().faults.clone(), vec![4, 4, 2]),
            (pe.ofmap_tile().unwrap().faults.clone(), vec![4, 4, 2]),
        ];
        for (table, shape) in tiles {
            let cols = table.into_columnar();
            assert_eq!(cols.coords().rows(), cols.meta().len(), "trial {trial}");
            for row in cols.coords().iter_rows() {
                for (v, e) in row.iter().zip(&shape) {
                    assert!(*v >= 0 && *v < *e as i64, "trial {trial}: {row:?}");
                }
            }
        }
    }
}

#[test]
fn repeated_trials_with_shape_cache_are_deterministic() {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    let run = || {
        let mut pe = engine_with(None, None, None, None);
        for role in ALL_ROLES {
            pe.premap(role, true).unwrap();
            pe.duplicate_mapping(role).unwrap();
        }
        pe.align_slice_pack().unwrap();
        let cache = pe.save_shapes().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            pe.restore_shapes(&cache).unwrap();
            pe.gen_stuck_at_faults(&mut rng, 8, FaultMode::StuckAt1, None, false)
                .unwrap();
            pe.decompose_slice_pack().unwrap();
            for role in ALL_ROLES {
                pe.demap(role).unwrap();
            }
            outcomes.push((
                coord_id_sets(&pe.ifmap_tile().unwrap().faults),
                coord_id_sets(&pe.wght_tile().unwrap().faults),
                coord_id_sets(&pe.ofmap_tile().unwrap().faults),
            ));
        }
        outcomes
    };
    assert_eq!(run(), run());
}
