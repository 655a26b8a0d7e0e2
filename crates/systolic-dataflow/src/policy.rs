//! Per-tensor dataflow policies.
//!
//! A [`DataflowPolicy`] declares how one tensor tile maps onto the PE array:
//! up to one axis-mapping rule per discipline (permute, fixed, broadcast,
//! streaming) plus the scalar scheduling knobs (repeat/duplicate counts,
//! slice-pack size, stall/latency cycles, dummy-pack insertion).
//!
//! Policies are validated at construction and immutable once installed into
//! the engine.

use crate::axes::{FlowDirection, PeAxis};
use crate::error::{DataflowError, Result};
use serde::{Deserialize, Serialize};

fn check_axis_list(axes: &[PeAxis], what: &str) -> Result<()> {
    if axes.is_empty() {
        return Err(DataflowError::config(format!("{what} axis list is empty")));
    }
    for (i, a) in axes.iter().enumerate() {
        if axes[..i].contains(a) {
            return Err(DataflowError::config(format!(
                "{what} axis list repeats {a}"
            )));
        }
    }
    Ok(())
}

/// Generalized transpose+reshape rule: linearize tile coordinates under the
/// tile priority, unravel under the PE-axis priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermuteMap {
    /// PE axes the tile occupies, highest mapping priority first.
    pub axes: Vec<PeAxis>,
    /// Ravel priority per tile axis (larger = more significant).
    pub tile_priority: Vec<usize>,
}

impl PermuteMap {
    /// Validated constructor.
    pub fn new(axes: Vec<PeAxis>, tile_priority: Vec<usize>) -> Result<Self> {
        check_axis_list(&axes, "permute")?;
        Ok(Self {
            axes,
            tile_priority,
        })
    }
}

/// Pin the tensor to constant indices on one or more PE axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedMap {
    /// Pinned axes.
    pub axes: Vec<PeAxis>,
    /// Constant index per pinned axis; negative values resolve from the
    /// axis end (-1 = last index).
    pub indices: Vec<i64>,
}

impl FixedMap {
    /// Validated constructor.
    pub fn new(axes: Vec<PeAxis>, indices: Vec<i64>) -> Result<Self> {
        check_axis_list(&axes, "fixed")?;
        if axes.len() != indices.len() {
            return Err(DataflowError::config(format!(
                "fixed maps {} axes but provides {} indices",
                axes.len(),
                indices.len()
            )));
        }
        Ok(Self { axes, indices })
    }
}

/// Replicate the tensor across every index of one or more PE axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMap {
    /// Fan-out axes.
    pub axes: Vec<PeAxis>,
}

impl BroadcastMap {
    /// Validated constructor.
    pub fn new(axes: Vec<PeAxis>) -> Result<Self> {
        check_axis_list(&axes, "broadcast")?;
        Ok(Self { axes })
    }
}

/// Stream the tensor through a 1-D sliding window of PEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMap {
    /// Physical PE axis the window sweeps along.
    pub axis: PeAxis,
    /// Direction the tile data flows in.
    pub tile_flow: FlowDirection,
    /// Direction the window sweeps.
    pub pe_flow: FlowDirection,
}

impl StreamMap {
    /// Validated constructor; the sweep axis must be physical.
    pub fn new(axis: PeAxis, tile_flow: FlowDirection, pe_flow: FlowDirection) -> Result<Self> {
        if !axis.is_physical() {
            return Err(DataflowError::config(
                "streaming axis must be PE_x or PE_y",
            ));
        }
        Ok(Self {
            axis,
            tile_flow,
            pe_flow,
        })
    }
}

/// Where dummy slice packs are inserted relative to the real packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DummyPackMode {
    /// n dummies before all real packs: `~ ~ A B C`.
    PreAll,
    /// n dummies after all real packs: `A B C ~ ~`.
    PostAll,
    /// n dummies before each real pack: `~ ~ A ~ ~ B ~ ~ C`.
    PreEach,
    /// n dummies after each real pack: `A ~ ~ B ~ ~ C ~ ~`.
    PostEach,
}

/// Dummy-pack insertion: placeholder schedule slots for a tensor absent
/// during part of the computation window (bias during accumulation, say).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyPackSpec {
    /// Insertion mode.
    pub mode: DummyPackMode,
    /// Number of dummy packs per insertion point.
    pub count: usize,
}

/// Complete mapping policy for one tensor role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataflowPolicy {
    /// Permute rule.
    pub permute: Option<PermuteMap>,
    /// Fixed rule.
    pub fixed: Option<FixedMap>,
    /// Broadcast rule.
    pub broadcast: Option<BroadcastMap>,
    /// Streaming rule.
    pub streaming: Option<StreamMap>,
    /// Element-wise repeats of the mapped tile along the clock axis
    /// (back-to-back passes over the same PE positions). 0 = none.
    pub repeat: usize,
    /// Whole-extent duplicates of the mapped clock range (separately
    /// scheduled full passes, e.g. channel accumulation). 0 = none.
    pub duplicate: usize,
    /// Number of tile slices grouped into one slice pack.
    pub pack_size: usize,
    /// Pipeline fill/drain cycles added on the clock axis.
    pub stall_latency: usize,
    /// Dummy-pack insertion.
    pub dummy_packs: Option<DummyPackSpec>,
}

impl Default for DataflowPolicy {
    fn default() -> Self {
        Self {
            permute: None,
            fixed: None,
            broadcast: None,
            streaming: None,
            repeat: 0,
            duplicate: 0,
            pack_size: 1,
            stall_latency: 0,
            dummy_packs: None,
        }
    }
}

impl DataflowPolicy {
    /// Empty policy; add rules with the `with_*` builders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a permute rule.
    #[must_use]
    pub fn with_permute(mut self, permute: PermuteMap) -> Self {
        self.permute = Some(permute);
        self
    }

    /// Attach a fixed rule.
    #[must_use]
    pub fn with_fixed(mut self, fixed: FixedMap) -> Self {
        self.fixed = Some(fixed);
        self
    }

    /// Attach a broadcast rule.
    #[must_use]
    pub fn with_broadcast(mut self, broadcast: BroadcastMap) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// Attach a streaming rule.
    #[must_use]
    pub fn with_streaming(mut self, streaming: StreamMap) -> Self {
        self.streaming = Some(streaming);
        self
    }

    /// Set the element-wise repeat count.
    #[must_use]
    pub fn with_repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat;
        self
    }

    /// Set the whole-extent duplicate count.
    #[must_use]
    pub fn with_duplicate(mut self, duplicate: usize) -> Self {
        self.duplicate = duplicate;
        self
    }

    /// Set the slice-pack size.
    #[must_use]
    pub fn with_pack_size(mut self, pack_size: usize) -> Self {
        self.pack_size = pack_size.max(1);
        self
    }

    /// Set the stall/latency cycle count.
    #[must_use]
    pub fn with_stall_latency(mut self, cycles: usize) -> Self {
        self.stall_latency = cycles;
        self
    }

    /// Attach dummy-pack insertion.
    #[must_use]
    pub fn with_dummy_packs(mut self, mode: DummyPackMode, count: usize) -> Self {
        self.dummy_packs = Some(DummyPackSpec { mode, count });
        self
    }

    /// True when any rule or knob differs from the empty policy. Bias and
    /// psum only participate in alignment when their policy is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        *self != Self::default()
    }

    /// True when at least one axis-mapping rule is present.
    #[must_use]
    pub fn has_axis_rule(&self) -> bool {
        self.permute.is_some()
            || self.fixed.is_some()
            || self.broadcast.is_some()
            || self.streaming.is_some()
    }
}

/// The five per-role policies installed by `configure_dataflow`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataflowSetup {
    /// Output feature map policy.
    pub ofmap: DataflowPolicy,
    /// Weight kernel policy.
    pub wght: DataflowPolicy,
    /// Input feature map policy.
    pub ifmap: DataflowPolicy,
    /// Partial-sum policy (shares the ofmap tile).
    pub psum: DataflowPolicy,
    /// Bias policy (shares the weight tile).
    pub bias: DataflowPolicy,
}

impl DataflowSetup {
    /// Empty setup; fill per-role policies with the `with_*` builders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ofmap policy.
    #[must_use]
    pub fn with_ofmap(mut self, policy: DataflowPolicy) -> Self {
        self.ofmap = policy;
        self
    }

    /// Set the weight policy.
    #[must_use]
    pub fn with_wght(mut self, policy: DataflowPolicy) -> Self {
        self.wght = policy;
        self
    }

    /// Set the ifmap policy.
    #[must_use]
    pub fn with_ifmap(mut self, policy: DataflowPolicy) -> Self {
        self.ifmap = policy;
        self
    }

    /// Set the psum policy.
    #[must_use]
    pub fn with_psum(mut self, policy: DataflowPolicy) -> Self {
        self.psum = policy;
        self
    }

    /// Set the bias policy.
    #[must_use]
    pub fn with_bias(mut self, policy: DataflowPolicy) -> Self {
        self.bias = policy;
        self
    }
}
