//! PE-array dataflow engine.
//!
//! [`PeArray`] models a 2D grid of processing elements (`n_y` rows x `n_x`
//! columns) executing one tensor tile over `n_clk` cycles, and moves fault
//! tables between tile index space and PE dataflow space.
//!
//! The pipeline runs in a fixed order, enforced structurally:
//!
//! ```text
//! configure_dataflow
//!   -> premap (per tensor)            permute -> fixed -> broadcast -> stream
//!   -> duplicate_mapping (per tensor) repeat / duplicate on the clock axis
//!   -> align_slice_pack               serialize + stall + dummy packs, unify
//!   -> decompose_slice_pack           split the unified table per tensor
//!   -> reduce_mapping (per tensor)    undo repeat / duplicate
//!   -> demap (per tensor)             stream -> broadcast -> fixed -> permute
//! ```
//!
//! Premapping with `pre_plan` runs the shape algebra without touching any
//! fault coordinates; a [`ShapeCache`] snapshot of the aligned shapes lets
//! thousands of randomized fault trials reuse one forward plan.

use crate::axes::PeAxis;
use crate::error::{DataflowError, Result};
use crate::plan::{broadcast_plan, fixed_plan, permute_plan, stream_plan, AxisTracker};
use crate::policy::{DataflowPolicy, DataflowSetup};
use crate::schedule::{
    deserialize_slices, insert_dummy_packs, insert_stall, remove_dummy_packs, remove_stall,
    serialize_slices,
};
use crate::table::{FaultColumns, FaultMeta, FaultOrigin, FaultTable, PortTag};
use crate::tile::Tile;
use crate::transform::{
    broadcast_insert, fixed_extract, fixed_insert, narrowcast, outlier_mask, permute_ravel,
    stream_capture, stream_flowback,
};
use crate::wiring::MacWiring;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tensor role a mapping applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorRole {
    /// Input feature map.
    Ifmap,
    /// Weight kernel.
    Weight,
    /// Output feature map.
    Ofmap,
    /// Weight bias (shares the weight tile).
    Bias,
    /// Partial sum (shares the ofmap tile).
    Psum,
}

impl TensorRole {
    /// Port tag a tensor's faults enter the PE array on.
    #[must_use]
    pub const fn port(self) -> PortTag {
        match self {
            Self::Ifmap => PortTag::IfmapIn,
            Self::Weight => PortTag::WghtIn,
            Self::Ofmap | Self::Psum => PortTag::PsumOut,
            Self::Bias => PortTag::PsumIn,
        }
    }
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ifmap => "ifmap",
            Self::Weight => "wght",
            Self::Ofmap => "ofmap",
            Self::Bias => "bias",
            Self::Psum => "psum",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default)]
struct RoleMap<T> {
    ifmap: T,
    wght: T,
    ofmap: T,
    bias: T,
    psum: T,
}

impl<T> RoleMap<T> {
    fn get(&self, role: TensorRole) -> &T {
        match role {
            TensorRole::Ifmap => &self.ifmap,
            TensorRole::Weight => &self.wght,
            TensorRole::Ofmap => &self.ofmap,
            TensorRole::Bias => &self.bias,
            TensorRole::Psum => &self.psum,
        }
    }

    fn get_mut(&mut self, role: TensorRole) -> &mut T {
        match role {
            TensorRole::Ifmap => &mut self.ifmap,
            TensorRole::Weight => &mut self.wght,
            TensorRole::Ofmap => &mut self.ofmap,
            TensorRole::Bias => &mut self.bias,
            TensorRole::Psum => &mut self.psum,
        }
    }
}

/// Installed per-role policies plus which optional tensors participate.
#[derive(Debug, Clone)]
struct FlowSet {
    setup: DataflowSetup,
    use_bias: bool,
    use_psum: bool,
}

impl FlowSet {
    fn policy(&self, role: TensorRole) -> &DataflowPolicy {
        match role {
            TensorRole::Ifmap => &self.setup.ifmap,
            TensorRole::Weight => &self.setup.wght,
            TensorRole::Ofmap => &self.setup.ofmap,
            TensorRole::Bias => &self.setup.bias,
            TensorRole::Psum => &self.setup.psum,
        }
    }

    fn active_roles(&self) -> Vec<TensorRole> {
        let mut roles = vec![TensorRole::Ifmap, TensorRole::Weight, TensorRole::Ofmap];
        if self.use_bias {
            roles.push(TensorRole::Bias);
        }
        if self.use_psum {
            roles.push(TensorRole::Psum);
        }
        roles
    }
}

/// Working state of one tensor's mapping.
#[derive(Debug, Clone)]
pub(crate) struct MappingState {
    /// PE-side shape at the current pipeline position.
    pub shape: Vec<usize>,
    /// PE axes the premap claimed, in claim order.
    pub used_axes: Vec<PeAxis>,
    /// Clock depth derived during premap.
    pub tmp_clk: Option<usize>,
    /// Working fault table; `None` in shape-only runs.
    pub table: Option<FaultColumns>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unconfigured,
    Configured,
    Aligned,
    Decomposed,
}

impl Phase {
    const fn name(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Aligned => "aligned",
            Self::Decomposed => "decomposed",
        }
    }
}

/// Snapshot of the aligned mapping shapes; restoring one skips the forward
/// shape algebra for repeated fault trials against the same configuration.
#[derive(Debug, Clone)]
pub struct ShapeCache {
    states: RoleMap<Option<(Vec<usize>, Vec<PeAxis>, Option<usize>)>>,
    n_clk: usize,
    pack_clk: usize,
    pack_num: usize,
}

/// The PE-array dataflow model.
#[derive(Debug)]
pub struct PeArray {
    pub(crate) n_y: usize,
    pub(crate) n_x: usize,
    pub(crate) n_clk: Option<usize>,
    pack_clk: Option<usize>,
    pack_num: Option<usize>,
    flows: Option<FlowSet>,
    ifmap_tile: Option<Tile>,
    wght_tile: Option<Tile>,
    ofmap_tile: Option<Tile>,
    states: RoleMap<Option<MappingState>>,
    pub(crate) fault_table: FaultColumns,
    pub(crate) fault_origin: FaultOrigin,
    pub(crate) wiring: Option<MacWiring>,
    phase: Phase,
}

impl PeArray {
    /// Engine for an `n_y` x `n_x` PE grid.
    #[must_use]
    pub fn new(n_y: usize, n_x: usize) -> Self {
        Self {
            n_y,
            n_x,
            n_clk: None,
            pack_clk: None,
            pack_num: None,
            flows: None,
            ifmap_tile: None,
            wght_tile: None,
            ofmap_tile: None,
            states: RoleMap::default(),
            fault_table: FaultColumns::empty(3),
            fault_origin: FaultOrigin::Uniform,
            wiring: None,
            phase: Phase::Unconfigured,
        }
    }

    /// Attach a MAC wiring description.
    #[must_use]
    pub fn with_wiring(mut self, wiring: MacWiring) -> Self {
        self.wiring = Some(wiring);
        self
    }

    /// Grid rows.
    #[must_use]
    pub const fn n_y(&self) -> usize {
        self.n_y
    }

    /// Grid columns.
    #[must_use]
    pub const fn n_x(&self) -> usize {
        self.n_x
    }

    /// Clock depth of one tile pass, once alignment derived it.
    #[must_use]
    pub const fn n_clk(&self) -> Option<usize> {
        self.n_clk
    }

    /// Unified clock depth per slice pack, once alignment derived it.
    #[must_use]
    pub const fn pack_clk(&self) -> Option<usize> {
        self.pack_clk
    }

    /// Unified slice-pack count, once alignment derived it.
    #[must_use]
    pub const fn pack_num(&self) -> Option<usize> {
        self.pack_num
    }

    /// Install the tiles the mappings read from and write to.
    pub fn set_tiles(&mut self, ifmap: Tile, wght: Tile, ofmap: Tile) {
        self.ifmap_tile = Some(ifmap);
        self.wght_tile = Some(wght);
        self.ofmap_tile = Some(ofmap);
    }

    /// Input feature map tile.
    #[must_use]
    pub fn ifmap_tile(&self) -> Option<&Tile> {
        self.ifmap_tile.as_ref()
    }

    /// Weight tile.
    #[must_use]
    pub fn wght_tile(&self) -> Option<&Tile> {
        self.wght_tile.as_ref()
    }

    /// Output feature map tile.
    #[must_use]
    pub fn ofmap_tile(&self) -> Option<&Tile> {
        self.ofmap_tile.as_ref()
    }

    /// The unified PE-space fault table.
    #[must_use]
    pub fn fault_table(&self) -> &FaultColumns {
        &self.fault_table
    }

    /// Install a PE-space fault table directly (coordinates are
    /// `(PE_y, PE_x, t_clk)`).
    pub fn set_fault_table(&mut self, table: FaultTable, origin: FaultOrigin) -> Result<()> {
        let cols = table.into_columnar();
        if !cols.is_empty() && cols.coords().width() != 3 {
            return Err(DataflowError::CoordWidth {
                expected: 3,
                got: cols.coords().width(),
            });
        }
        self.fault_table = cols;
        self.fault_origin = origin;
        Ok(())
    }

    /// Per-tensor working fault table (populated by `decompose_slice_pack`).
    #[must_use]
    pub fn working_table(&self, role: TensorRole) -> Option<&FaultColumns> {
        self.states.get(role).as_ref()?.table.as_ref()
    }

    fn require_phase(&self, stage: &'static str, expected: Phase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(DataflowError::PipelineOrder {
                stage,
                expected: expected.name(),
                got: self.phase.name(),
            })
        }
    }

    fn flows(&self, stage: &'static str) -> Result<&FlowSet> {
        self.flows.as_ref().ok_or(DataflowError::PipelineOrder {
            stage,
            expected: "configured",
            got: "unconfigured",
        })
    }

    fn tile_for(&self, role: TensorRole) -> Result<&Tile> {
        let tile = match role {
            TensorRole::Ifmap => &self.ifmap_tile,
            TensorRole::Weight | TensorRole::Bias => &self.wght_tile,
            TensorRole::Ofmap | TensorRole::Psum => &self.ofmap_tile,
        };
        tile.as_ref()
            .ok_or_else(|| DataflowError::config(format!("no tile installed for {role}")))
    }

    fn state_mut(&mut self, stage: &'static str, role: TensorRole) -> Result<&mut MappingState> {
        self.states
            .get_mut(role)
            .as_mut()
            .ok_or(DataflowError::PipelineOrder {
                stage,
                expected: "premapped tensor",
                got: "unmapped tensor",
            })
    }

    /// Install the five per-role policies. Idempotent; resets any mapping
    /// progress from an earlier configuration.
    pub fn configure_dataflow(&mut self, setup: DataflowSetup) {
        let use_bias = setup.bias.is_active();
        let use_psum = setup.psum.is_active();
        self.flows = Some(FlowSet {
            setup,
            use_bias,
            use_psum,
        });
        self.states = RoleMap::default();
        self.n_clk = None;
        self.pack_clk = None;
        self.pack_num = None;
        self.fault_table = FaultColumns::empty(3);
        self.phase = Phase::Configured;
    }

    /// Map one tensor's tile-space faults onto the PE dataflow model:
    /// permute -> fixed -> broadcast -> streaming, in that order.
    ///
    /// With `pre_plan` only the mapping shape is computed; no fault
    /// coordinates are touched.
    pub fn premap(&mut self, role: TensorRole, pre_plan: bool) -> Result<()> {
        self.require_phase("premap", Phase::Configured)?;
        let policy = self.flows("premap")?.policy(role).clone();
        if !policy.has_axis_rule() {
            return Err(DataflowError::config(format!(
                "{role} policy has no axis-mapping rule"
            )));
        }

        let tile = self.tile_for(role)?;
        let tile_shape = match role {
            TensorRole::Bias => tile.bias_slice_shape()?,
            _ => tile.slice_shape(),
        };
        let flat = !tile.is_expanded() && role != TensorRole::Bias;

        let mut work: Option<FaultColumns> = if pre_plan {
            None
        } else {
            let faults = match role {
                TensorRole::Bias => tile.bias_faults.clone(),
                _ => tile.faults.clone(),
            };
            let mut cols = faults.into_columnar();
            if cols.is_empty() {
                None
            } else {
                if flat && cols.coords().width() + 1 == tile_shape.len() {
                    let zeros = vec![0i64; cols.len()];
                    let widened = cols.coords().insert_column(cols.coords().width(), &zeros);
                    cols.set_coords(widened);
                }
                if cols.coords().width() != tile_shape.len() {
                    return Err(DataflowError::CoordWidth {
                        expected: tile_shape.len(),
                        got: cols.coords().width(),
                    });
                }
                for meta in &mut cols.meta {
                    meta.ports = vec![role.port()];
                }
                Some(cols)
            }
        };

        let grid = (self.n_y, self.n_x);
        let mut tracker = AxisTracker::new();
        let mut shape: Option<Vec<usize>> = None;

        if let Some(p) = &policy.permute {
            if p.tile_priority.len() != tile_shape.len() {
                return Err(DataflowError::PriorityLength {
                    expected: tile_shape.len(),
                    got: p.tile_priority.len(),
                });
            }
            let plan = permute_plan(&mut tracker, grid, &p.axes, &tile_shape, false)?;
            if let Some(w) = &mut work {
                let mapped = permute_ravel(
                    w.coords(),
                    &tile_shape,
                    &p.tile_priority,
                    &plan.shape,
                    &plan.prior,
                )?;
                w.set_coords(mapped);
            }
            shape = Some(plan.shape);
        }

        if let Some(f) = &policy.fixed {
            let plan = fixed_plan(&mut tracker, grid, &f.axes, &tile_shape, false)?;
            if let Some(w) = &mut work {
                let mapped = fixed_insert(
                    w.coords(),
                    &plan.fix_dims,
                    &f.indices,
                    &plan.shape,
                    &plan.axis_map,
                )?;
                w.set_coords(mapped);
            }
            shape = Some(plan.shape);
        }

        if let Some(b) = &policy.broadcast {
            let plan = broadcast_plan(&mut tracker, grid, &b.axes, &tile_shape, false)?;
            if let Some(w) = &mut work {
                let (mapped, dispatch) = broadcast_insert(
                    w.coords(),
                    &plan.shape,
                    &plan.broadcast_dims,
                    &plan.axis_map,
                )?;
                w.set_coords(mapped);
                w.dispatch_meta(&dispatch);
            }
            shape = Some(plan.shape);
        }

        if let Some(s) = &policy.streaming {
            let plan = stream_plan(&mut tracker, grid, s.axis, &tile_shape, false)?;
            if let Some(w) = &mut work {
                let (mapped, dispatch) = stream_capture(
                    w.coords(),
                    &plan.data_shape,
                    plan.data_stream_axis,
                    &plan.window_shape,
                    plan.window_stream_axis,
                    plan.window_clk_axis,
                    s.tile_flow,
                    s.pe_flow,
                    &plan.axis_map,
                )?;
                w.set_coords(mapped);
                w.dispatch_meta(&dispatch);
            }
            shape = Some(plan.window_shape);
        }

        for axis in PeAxis::ALL {
            if !tracker.contains(axis) {
                return Err(DataflowError::config(format!(
                    "{role} policy leaves {axis} unmapped"
                )));
            }
        }

        let shape = shape.ok_or_else(|| {
            DataflowError::config(format!("{role} policy has no axis-mapping rule"))
        })?;
        tracing::debug!(
            role = %role,
            shape = ?shape,
            faults = work.as_ref().map_or(0, FaultColumns::len),
            "premapped tile onto PE dataflow model"
        );
        *self.states.get_mut(role) = Some(MappingState {
            shape,
            used_axes: tracker.axes,
            tmp_clk: tracker.tmp_clk,
            table: work,
        });
        Ok(())
    }

    /// Replicate a premapped tensor along the clock axis: `repeat` passes
    /// element-wise, then `duplicate` copies of the whole mapped extent.
    pub fn duplicate_mapping(&mut self, role: TensorRole) -> Result<()> {
        self.require_phase("duplicate_mapping", Phase::Configured)?;
        let policy = self.flows("duplicate_mapping")?.policy(role).clone();
        let st = self.state_mut("duplicate_mapping", role)?;
        let slice_dim = st.shape.len() - 1;
        let mut cutset = st.shape[slice_dim];

        if policy.repeat > 0 {
            let r = policy.repeat;
            if let Some(tab) = &mut st.table {
                let expanded = tab.coords().repeat_each(r);
                let dispatch: Vec<usize> = (0..expanded.rows()).map(|i| i / r).collect();
                let mut coords = expanded;
                for i in 0..coords.rows() {
                    let pass = (i % r) as i64;
                    let s = coords.get(i, slice_dim);
                    coords.set(i, slice_dim, s * r as i64 + pass);
                }
                tab.set_coords(coords);
                tab.dispatch_meta(&dispatch);
            }
            cutset *= r;
        }

        if policy.duplicate > 0 {
            let d = policy.duplicate;
            if let Some(tab) = &mut st.table {
                let block = tab.coords().rows();
                let expanded = tab.coords().tile_blocks(d);
                let dispatch: Vec<usize> = (0..expanded.rows()).map(|i| i % block).collect();
                let mut coords = expanded;
                for i in 0..coords.rows() {
                    let pass = (i / block.max(1)) as i64;
                    let s = coords.get(i, slice_dim);
                    coords.set(i, slice_dim, s + pass * cutset as i64);
                }
                tab.set_coords(coords);
                tab.dispatch_meta(&dispatch);
            }
            cutset *= d;
        }

        st.shape[slice_dim] = cutset;
        Ok(())
    }

    /// Undo `duplicate_mapping` on a decomposed tensor, collapsing the
    /// coordinates the replication made coincident.
    pub fn reduce_mapping(&mut self, role: TensorRole) -> Result<()> {
        self.require_phase("reduce_mapping", Phase::Decomposed)?;
        let policy = self.flows("reduce_mapping")?.policy(role).clone();
        let origin = self.fault_origin;
        let st = self.state_mut("reduce_mapping", role)?;
        let slice_dim = st.shape.len() - 1;
        let mut cutset = st.shape[slice_dim];

        if policy.duplicate > 0 {
            cutset /= policy.duplicate;
            if let Some(tab) = &mut st.table {
                let c = cutset as i64;
                let mut coords = tab.coords().clone();
                coords.map_column(slice_dim, |s| s.rem_euclid(c));
                tab.set_coords(coords);
                tab.collapse(origin);
            }
        }

        if policy.repeat > 0 {
            cutset /= policy.repeat;
            if let Some(tab) = &mut st.table {
                let r = policy.repeat as i64;
                let mut coords = tab.coords().clone();
                coords.map_column(slice_dim, |s| s.div_euclid(r));
                tab.set_coords(coords);
                tab.collapse(origin);
            }
        }

        st.shape[slice_dim] = cutset;
        Ok(())
    }

    /// Serialize every active tensor's slices onto the clock axis, insert
    /// stall/latency and dummy packs, unify the pack depth across tensors
    /// and concatenate everything into the engine's PE-space fault table.
    pub fn align_slice_pack(&mut self) -> Result<()> {
        self.require_phase("align_slice_pack", Phase::Configured)?;
        let flows = self.flows("align_slice_pack")?.clone();
        let roles = flows.active_roles();
        for &role in &roles {
            if self.states.get(role).is_none() {
                return Err(DataflowError::PipelineOrder {
                    stage: "align_slice_pack",
                    expected: "all active tensors premapped",
                    got: "unmapped tensor",
                });
            }
        }

        for &role in &roles {
            let policy = flows.policy(role).clone();
            let st = self.state_mut("align_slice_pack", role)?;
            if policy.pack_size > 1 {
                serialize_slices(
                    st.table.as_mut().map(|t| &mut t.coords),
                    &mut st.shape,
                    None,
                    policy.pack_size,
                )?;
            }
            if policy.stall_latency > 0 {
                insert_stall(
                    st.table.as_mut().map(|t| &mut t.coords),
                    &mut st.shape,
                    policy.stall_latency,
                )?;
            }
            if let Some(spec) = policy.dummy_packs {
                insert_dummy_packs(
                    st.table.as_mut().map(|t| &mut t.coords),
                    &mut st.shape,
                    spec.mode,
                    spec.count,
                )?;
            }
        }

        let mut pack_nums = Vec::with_capacity(roles.len());
        let mut pack_clks = Vec::with_capacity(roles.len());
        for &r in &roles {
            if let Some(st) = self.states.get(r).as_ref() {
                let rank = st.shape.len();
                pack_nums.push(st.shape[rank - 1]);
                pack_clks.push(st.shape[rank - 2]);
            }
        }
        if pack_nums.windows(2).any(|w| w[0] != w[1]) {
            tracing::warn!(
                ?pack_nums,
                "slice-pack counts disagree across tensors; aligning to the maximum"
            );
        }
        let pack_clk = pack_clks.into_iter().max().unwrap_or(0);
        let pack_num = pack_nums.into_iter().max().unwrap_or(0);

        self.pack_clk = Some(pack_clk);
        self.pack_num = Some(pack_num);
        self.n_clk = Some(pack_clk * pack_num);

        let mut parts: Vec<FaultColumns> = Vec::new();
        for role in [
            TensorRole::Ofmap,
            TensorRole::Weight,
            TensorRole::Ifmap,
            TensorRole::Bias,
            TensorRole::Psum,
        ] {
            if !roles.contains(&role) {
                continue;
            }
            let Some(st) = self.states.get_mut(role).as_mut() else {
                continue;
            };
            if let Some(mut tab) = st.table.take() {
                let mut scratch = st.shape.clone();
                serialize_slices(Some(&mut tab.coords), &mut scratch, Some(pack_clk), 1)?;
                if tab.coords().width() != 3 {
                    return Err(DataflowError::CoordWidth {
                        expected: 3,
                        got: tab.coords().width(),
                    });
                }
                parts.push(tab);
            }
        }
        self.fault_table = if parts.is_empty() {
            FaultColumns::empty(3)
        } else {
            let refs: Vec<&FaultColumns> = parts.iter().collect();
            FaultColumns::concat(&refs)?
        };

        tracing::debug!(
            pack_clk,
            pack_num,
            n_clk = pack_clk * pack_num,
            faults = self.fault_table.len(),
            "aligned slice packs across tensors"
        );
        self.phase = Phase::Aligned;
        Ok(())
    }

    /// Split the unified PE-space fault table back into per-tensor working
    /// tables: deserialize at the unified pack depth, strip dummy packs and
    /// stall/latency, drop out-of-range records, unpack slices.
    pub fn decompose_slice_pack(&mut self) -> Result<()> {
        self.require_phase("decompose_slice_pack", Phase::Aligned)?;
        let flows = self.flows("decompose_slice_pack")?.clone();
        let n_clk = self.n_clk.ok_or(DataflowError::ClockDepthUnset)?;
        let pack_clk = self.pack_clk.ok_or(DataflowError::ClockDepthUnset)?;
        let unified = self.fault_table.clone();

        for role in flows.active_roles() {
            let policy = flows.policy(role).clone();
            let mut tab = unified.clone();
            let mut pe_shape = vec![self.n_y, self.n_x, n_clk];
            deserialize_slices(&mut tab.coords, &mut pe_shape, Some(pack_clk), 1)?;

            let st = self.state_mut("decompose_slice_pack", role)?;
            if let Some(spec) = policy.dummy_packs {
                let keep =
                    remove_dummy_packs(&mut tab.coords, &mut st.shape, spec.mode, spec.count)?;
                filter_meta(&mut tab.meta, &keep);
            }
            if policy.stall_latency > 0 {
                remove_stall(Some(&mut tab.coords), &mut st.shape, policy.stall_latency)?;
            }
            let keep = outlier_mask(&tab.coords, &st.shape)?;
            tab.retain_mask(&keep);

            if policy.pack_size > 1 {
                deserialize_slices(&mut tab.coords, &mut st.shape, None, policy.pack_size)?;
            }
            tracing::debug!(role = %role, faults = tab.len(), "decomposed slice pack");
            st.table = Some(tab);
        }
        self.phase = Phase::Decomposed;
        Ok(())
    }

    /// Map one tensor's working faults back into tile space:
    /// streaming -> broadcast -> fixed -> permute, the exact mirror of
    /// `premap`, collapsing coincident coordinates after each fan-in.
    /// Recovered faults are written into the tensor's tile.
    pub fn demap(&mut self, role: TensorRole) -> Result<()> {
        self.require_phase("demap", Phase::Decomposed)?;
        let policy = self.flows("demap")?.policy(role).clone();
        let origin = self.fault_origin;
        let tile = self.tile_for(role)?;
        let tile_shape = match role {
            TensorRole::Bias => tile.bias_slice_shape()?,
            _ => tile.slice_shape(),
        };
        let flat = !tile.is_expanded() && role != TensorRole::Bias;

        let st = self.state_mut("demap", role)?;
        let mut tracker = AxisTracker {
            axes: st.used_axes.clone(),
            tmp_clk: st.tmp_clk,
        };
        let Some(mut tab) = st.table.take() else {
            return Ok(());
        };

        let grid = (self.n_y, self.n_x);

        if let Some(s) = &policy.streaming {
            let plan = stream_plan(&mut tracker, grid, s.axis, &tile_shape, true)?;
            let mapped = stream_flowback(
                tab.coords(),
                &plan.data_shape,
                plan.data_stream_axis,
                &plan.window_shape,
                plan.window_stream_axis,
                plan.window_clk_axis,
                s.tile_flow,
                s.pe_flow,
                &plan.axis_map,
            )?;
            tab.set_coords(mapped);
            tab.collapse(origin);
        }

        if let Some(b) = &policy.broadcast {
            let plan = broadcast_plan(&mut tracker, grid, &b.axes, &tile_shape, true)?;
            let mapped = narrowcast(tab.coords(), &plan.broadcast_dims, &plan.axis_map)?;
            tab.set_coords(mapped);
            tab.collapse(origin);
        }

        if let Some(f) = &policy.fixed {
            let plan = fixed_plan(&mut tracker, grid, &f.axes, &tile_shape, true)?;
            let (mapped, keep) = fixed_extract(
                tab.coords(),
                &plan.fix_dims,
                &f.indices,
                &plan.shape,
                &plan.axis_map,
            )?;
            tab.set_coords(mapped);
            filter_meta(&mut tab.meta, &keep);
        }

        if let Some(p) = &policy.permute {
            let plan = permute_plan(&mut tracker, grid, &p.axes, &tile_shape, true)?;
            let keep = outlier_mask(tab.coords(), &plan.shape)?;
            tab.retain_mask(&keep);
            let mapped = permute_ravel(
                tab.coords(),
                &plan.shape,
                &plan.prior,
                &tile_shape,
                &p.tile_priority,
            )?;
            tab.set_coords(mapped);
        }

        if !tab.is_empty() {
            tab.collapse(origin);
        }
        if flat {
            let last = tab.coords().width() - 1;
            tab.coords = tab.coords().remove_columns(&[last]);
        }
        tracing::debug!(role = %role, faults = tab.len(), "demapped faults into tile space");

        let table = FaultTable::Columnar(tab);
        let missing = || DataflowError::config(format!("no tile installed for {role}"));
        match role {
            TensorRole::Ifmap => self.ifmap_tile.as_mut().ok_or_else(missing)?.faults = table,
            TensorRole::Weight => self.wght_tile.as_mut().ok_or_else(missing)?.faults = table,
            TensorRole::Ofmap => self.ofmap_tile.as_mut().ok_or_else(missing)?.faults = table,
            TensorRole::Bias => {
                self.wght_tile.as_mut().ok_or_else(missing)?.bias_faults = table;
            }
            TensorRole::Psum => {
                self.ofmap_tile.as_mut().ok_or_else(missing)?.psum_faults = table;
            }
        }
        Ok(())
    }

    /// Shift neighbor-facing faults (`ifmap_out`, `wght_out`, `psum_in`)
    /// onto the PE their wire actually reaches, dropping faults whose
    /// neighbor does not exist. Uses the installed [`MacWiring`] when
    /// present, otherwise derives the direction from the streaming/permute
    /// configuration.
    pub fn translate_neighbor_io(&self, table: &mut FaultColumns) -> Result<()> {
        let flows = self.flows("translate_neighbor_io")?;
        let n_clk = self.n_clk.ok_or(DataflowError::ClockDepthUnset)?;
        if table.coords().width() != 3 {
            return Err(DataflowError::CoordWidth {
                expected: 3,
                got: table.coords().width(),
            });
        }

        for i in 0..table.len() {
            let Some(&port) = table.meta[i].ports.first() else {
                continue;
            };
            let shift = match &self.wiring {
                Some(w) => w.shift_for(port),
                None => default_shift(flows, port),
            };
            if let Some((axis, step)) = shift {
                let col = match axis {
                    PeAxis::PeY => 0,
                    PeAxis::PeX => 1,
                    PeAxis::Clk => continue,
                };
                let v = table.coords.get(i, col);
                table.coords.set(i, col, v + step);
            }
        }

        let keep = outlier_mask(table.coords(), &[self.n_y, self.n_x, n_clk])?;
        table.retain_mask(&keep);
        Ok(())
    }

    /// Snapshot the aligned mapping shapes for reuse across fault trials.
    pub fn save_shapes(&self) -> Result<ShapeCache> {
        self.require_phase("save_shapes", Phase::Aligned)?;
        let mut states: RoleMap<Option<(Vec<usize>, Vec<PeAxis>, Option<usize>)>> =
            RoleMap::default();
        for role in [
            TensorRole::Ifmap,
            TensorRole::Weight,
            TensorRole::Ofmap,
            TensorRole::Bias,
            TensorRole::Psum,
        ] {
            *states.get_mut(role) = self
                .states
                .get(role)
                .as_ref()
                .map(|st| (st.shape.clone(), st.used_axes.clone(), st.tmp_clk));
        }
        Ok(ShapeCache {
            states,
            n_clk: self.n_clk.ok_or(DataflowError::ClockDepthUnset)?,
            pack_clk: self.pack_clk.ok_or(DataflowError::ClockDepthUnset)?,
            pack_num: self.pack_num.ok_or(DataflowError::ClockDepthUnset)?,
        })
    }

    /// Restore an aligned shape snapshot, putting the engine right before
    /// `decompose_slice_pack` with an empty fault table.
    pub fn restore_shapes(&mut self, cache: &ShapeCache) -> Result<()> {
        self.flows("restore_shapes")?;
        for role in [
            TensorRole::Ifmap,
            TensorRole::Weight,
            TensorRole::Ofmap,
            TensorRole::Bias,
            TensorRole::Psum,
        ] {
            *self.states.get_mut(role) =
                cache
                    .states
                    .get(role)
                    .as_ref()
                    .map(|(shape, axes, tmp_clk)| MappingState {
                        shape: shape.clone(),
                        used_axes: axes.clone(),
                        tmp_clk: *tmp_clk,
                        table: None,
                    });
        }
        self.n_clk = Some(cache.n_clk);
        self.pack_clk = Some(cache.pack_clk);
        self.pack_num = Some(cache.pack_num);
        self.fault_table = FaultColumns::empty(3);
        self.phase = Phase::Aligned;
        Ok(())
    }

    /// Clear the unified fault table between trials.
    pub fn clear_faults(&mut self) {
        self.fault_table = FaultColumns::empty(3);
    }

    /// Clear all mapping progress, keeping policies, tiles and wiring.
    pub fn clear_mapping(&mut self) {
        self.states = RoleMap::default();
        self.n_clk = None;
        self.pack_clk = None;
        self.pack_num = None;
        if self.flows.is_some() {
            self.phase = Phase::Configured;
        }
    }

    /// Drop the installed policies (and any mapping progress).
    pub fn clear_flows(&mut self) {
        self.flows = None;
        self.clear_mapping();
        self.phase = Phase::Unconfigured;
    }

    /// Drop the installed tiles.
    pub fn clear_tiles(&mut self) {
        self.ifmap_tile = None;
        self.wght_tile = None;
        self.ofmap_tile = None;
    }

    /// Reset the engine to its freshly constructed state.
    pub fn clear_all(&mut self) {
        self.clear_flows();
        self.clear_tiles();
        self.clear_faults();
    }
}

fn default_shift(flows: &FlowSet, port: PortTag) -> Option<(PeAxis, i64)> {
    fn neighbor_axis(policy: &DataflowPolicy) -> Option<PeAxis> {
        policy.streaming.map(|s| s.axis).or_else(|| {
            policy
                .permute
                .as_ref()
                .and_then(|p| p.axes.iter().copied().find(|a| a.is_physical()))
        })
    }
    match port {
        PortTag::IfmapOut => neighbor_axis(&flows.setup.ifmap).map(|a| (a, 1)),
        PortTag::WghtOut => neighbor_axis(&flows.setup.wght).map(|a| (a, 1)),
        PortTag::PsumIn => neighbor_axis(&flows.setup.psum).map(|a| (a, -1)),
        _ => None,
    }
}

pub(crate) fn filter_meta(meta: &mut Vec<FaultMeta>, keep: &[bool]) {
    let mut it = keep.iter();
    meta.retain(|_| *it.next().unwrap_or(&false));
}
