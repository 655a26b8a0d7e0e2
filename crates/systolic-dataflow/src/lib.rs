#![forbid(unsafe_code)]

//! PE-array dataflow model for fault-tolerance analysis of systolic tensor
//! accelerators.
//!
//! This crate maps fault locations of a 2D processing-element array back and
//! forth between **tile index space** (positions inside a logical
//! ifmap/weight/ofmap tensor tile) and **PE dataflow space** (physical PE
//! row, PE column, clock cycle). Where a fault lands decides which tensor
//! values it corrupts; the mapping is the whole analysis, no arithmetic is
//! simulated.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`axes`] | PE dataflow axes (`PE_y`, `PE_x`, `t_clk`), flow directions |
//! | [`coords`] | Columnar coordinate matrix the bulk transforms run over |
//! | [`table`] | Fault tables: columnar and coordinate-indexed layouts |
//! | [`policy`] | Per-tensor mapping policies (permute/fixed/broadcast/stream + scheduling knobs) |
//! | [`transform`] | The four axis-mapping primitives, forward and backward |
//! | [`schedule`] | Slice serialization, stall/latency, dummy packs |
//! | [`engine`] | [`PeArray`]: the staged mapping pipeline |
//! | [`wiring`] | Physical inter-PE port pairing for fault propagation |
//! | [`tile`] | Tile-side fault exchange surface |
//!
//! # Example
//!
//! ```
//! use systolic_dataflow::prelude::*;
//!
//! # fn main() -> systolic_dataflow::Result<()> {
//! // A 4x4 PE grid; every tensor occupies the whole grid, one tile slice
//! // per two accumulation steps.
//! let policy = || -> systolic_dataflow::Result<DataflowPolicy> {
//!     Ok(DataflowPolicy::new().with_permute(PermuteMap::new(
//!         vec![PeAxis::PeY, PeAxis::PeX, PeAxis::Clk],
//!         vec![3, 2, 1, 0],
//!     )?))
//! };
//!
//! let mut pe = PeArray::new(4, 4);
//! pe.set_tiles(
//!     Tile::new(vec![4, 4, 2, 2]),
//!     Tile::new(vec![4, 4, 2, 2]),
//!     Tile::new(vec![4, 4, 2, 2]),
//! );
//! pe.configure_dataflow(
//!     DataflowSetup::new()
//!         .with_ifmap(policy()?)
//!         .with_wght(policy()?)
//!         .with_ofmap(policy()?),
//! );
//!
//! // Shape-only forward pass, then a randomized fault trial.
//! for role in [TensorRole::Ifmap, TensorRole::Weight, TensorRole::Ofmap] {
//!     pe.premap(role, true)?;
//!     pe.duplicate_mapping(role)?;
//! }
//! pe.align_slice_pack()?;
//!
//! use rand::SeedableRng;
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//! pe.gen_stuck_at_faults(&mut rng, 8, FaultMode::StuckAt0, None, false)?;
//! pe.decompose_slice_pack()?;
//! pe.demap(TensorRole::Ifmap)?;
//! println!(
//!     "ifmap faults hit: {}",
//!     pe.ifmap_tile().unwrap().faults.len()
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod axes;
pub mod coords;
mod engine;
mod error;
mod generate;
mod plan;
pub mod policy;
pub mod schedule;
pub mod table;
pub mod tile;
pub mod transform;
pub mod wiring;

pub use axes::{FlowDirection, PeAxis};
pub use coords::CoordMatrix;
pub use engine::{PeArray, ShapeCache, TensorRole};
pub use error::{DataflowError, Result};
pub use plan::estimate_clk;
pub use policy::{
    BroadcastMap, DataflowPolicy, DataflowSetup, DummyPackMode, DummyPackSpec, FixedMap,
    PermuteMap, StreamMap,
};
pub use table::{FaultColumns, FaultMeta, FaultMode, FaultOrigin, FaultTable, PortTag};
pub use tile::Tile;
pub use wiring::{MacWiring, PortWiring, WiringKind};

/// Re-export of the commonly used types.
pub mod prelude {
    pub use crate::axes::{FlowDirection, PeAxis};
    pub use crate::engine::{PeArray, ShapeCache, TensorRole};
    pub use crate::error::Result;
    pub use crate::policy::{
        BroadcastMap, DataflowPolicy, DataflowSetup, DummyPackMode, FixedMap, PermuteMap,
        StreamMap,
    };
    pub use crate::table::{FaultColumns, FaultMode, FaultOrigin, FaultTable, PortTag};
    pub use crate::tile::Tile;
    pub use crate::wiring::{MacWiring, PortWiring, WiringKind};
}
