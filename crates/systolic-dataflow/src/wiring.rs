//! Physical inter-PE port wiring.
//!
//! A [`MacWiring`] describes how the MAC unit's I/O ports pair with the
//! neighboring PEs: which physical dimension each data class travels along
//! and in which direction. It drives neighbor I/O fault translation and
//! fault propagation across the interconnect, and nothing else — the
//! dataflow mapping itself never consults it.

use crate::axes::{FlowDirection, PeAxis};
use crate::error::{DataflowError, Result};
use crate::table::PortTag;
use serde::{Deserialize, Serialize};

/// How one port class connects to the neighboring PE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WiringKind {
    /// Output pairs with the next PE's input along a physical dimension.
    IoPair,
    /// Port stays inside the PE (no inter-PE hop).
    Internal,
}

/// Wiring of one data class (ifmap, weight or psum ports).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortWiring {
    /// Pairing type.
    pub kind: WiringKind,
    /// Physical dimension the pair spans.
    pub dimension: PeAxis,
    /// Travel direction along that dimension.
    pub direction: FlowDirection,
}

impl PortWiring {
    /// Validated constructor; the pairing dimension must be physical.
    pub fn new(kind: WiringKind, dimension: PeAxis, direction: FlowDirection) -> Result<Self> {
        if !dimension.is_physical() {
            return Err(DataflowError::config(
                "wiring dimension must be PE_x or PE_y",
            ));
        }
        Ok(Self {
            kind,
            dimension,
            direction,
        })
    }
}

/// Inter-PE wiring of the three data classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacWiring {
    /// ifmap_in / ifmap_out pairing.
    pub ifmap: PortWiring,
    /// wght_in / wght_out pairing.
    pub wght: PortWiring,
    /// psum_in / psum_out pairing.
    pub psum: PortWiring,
}

impl MacWiring {
    fn class_of(&self, port: PortTag) -> PortWiring {
        match port {
            PortTag::IfmapIn | PortTag::IfmapOut => self.ifmap,
            PortTag::WghtIn | PortTag::WghtOut => self.wght,
            PortTag::PsumIn | PortTag::PsumOut => self.psum,
        }
    }

    /// Axis and signed step a neighbor-facing fault moves by, or `None` for
    /// ports that stay local.
    ///
    /// `ifmap_out`/`wght_out` sit on the downstream edge of the pair, so
    /// they shift with the travel direction; `psum_in` sits on the upstream
    /// edge and shifts against it.
    #[must_use]
    pub fn shift_for(&self, port: PortTag) -> Option<(PeAxis, i64)> {
        if !port.is_neighbor_io() {
            return None;
        }
        let wiring = self.class_of(port);
        if wiring.kind != WiringKind::IoPair {
            return None;
        }
        let polarity = match port {
            PortTag::PsumIn => -wiring.direction.polarity(),
            _ => wiring.direction.polarity(),
        };
        Some((wiring.dimension, polarity))
    }

    /// PE locations whose data a faulty port contaminates: the PE itself
    /// plus, for paired ports, the partner PE across the interconnect.
    /// Partners outside the grid do not exist and are omitted.
    #[must_use]
    pub fn propagated_locations(
        &self,
        port: PortTag,
        loc: (i64, i64),
        grid: (usize, usize),
    ) -> Vec<(i64, i64)> {
        let mut out = vec![loc];
        let wiring = self.class_of(port);
        if wiring.kind != WiringKind::IoPair {
            return out;
        }
        let step = match port {
            // Outputs feed the downstream partner's input.
            PortTag::IfmapOut | PortTag::WghtOut | PortTag::PsumOut => {
                wiring.direction.polarity()
            }
            // Inputs carry data produced by the upstream partner.
            PortTag::IfmapIn | PortTag::WghtIn | PortTag::PsumIn => {
                -wiring.direction.polarity()
            }
        };
        let partner = match wiring.dimension {
            PeAxis::PeY => (loc.0 + step, loc.1),
            PeAxis::PeX => (loc.0, loc.1 + step),
            PeAxis::Clk => return out,
        };
        let (n_y, n_x) = (grid.0 as i64, grid.1 as i64);
        if partner.0 >= 0 && partner.0 < n_y && partner.1 >= 0 && partner.1 < n_x {
            out.push(partner);
        }
        out
    }
}
