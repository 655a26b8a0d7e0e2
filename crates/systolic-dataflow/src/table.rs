//! Fault tables.
//!
//! A fault table carries simulated hardware faults, each located by a
//! coordinate (tile-space axis positions, or PE-space `(PE_y, PE_x, t_clk)`)
//! plus fault metadata. Two physical layouts exist:
//!
//! - **indexed**: coordinate tuple -> fault record, convenient for lookup;
//! - **columnar**: a [`CoordMatrix`] plus one [`FaultMeta`] per row, the only
//!   layout the mapping transforms operate on.
//!
//! Conversion between the two is lossless. After backward mapping collapses
//! fan-out, a single record may carry several ids/bits/ports as parallel
//! lists.

use crate::coords::CoordMatrix;
use crate::error::{DataflowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// PE I/O port a fault sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortTag {
    /// Input-feature-map input register.
    IfmapIn,
    /// Input-feature-map forwarding output.
    IfmapOut,
    /// Weight input register.
    WghtIn,
    /// Weight forwarding output.
    WghtOut,
    /// Partial-sum input.
    PsumIn,
    /// Partial-sum output.
    PsumOut,
}

impl PortTag {
    /// All six ports.
    pub const ALL: [Self; 6] = [
        Self::IfmapIn,
        Self::IfmapOut,
        Self::WghtIn,
        Self::WghtOut,
        Self::PsumIn,
        Self::PsumOut,
    ];

    /// Ports that face a neighboring PE and therefore shift under
    /// neighbor I/O translation.
    #[must_use]
    pub const fn is_neighbor_io(self) -> bool {
        matches!(self, Self::IfmapOut | Self::WghtOut | Self::PsumIn)
    }
}

impl fmt::Display for PortTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IfmapIn => "ifmap_in",
            Self::IfmapOut => "ifmap_out",
            Self::WghtIn => "wght_in",
            Self::WghtOut => "wght_out",
            Self::PsumIn => "psum_in",
            Self::PsumOut => "psum_out",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PortTag {
    type Err = DataflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ifmap_in" => Ok(Self::IfmapIn),
            "ifmap_out" => Ok(Self::IfmapOut),
            "wght_in" => Ok(Self::WghtIn),
            "wght_out" => Ok(Self::WghtOut),
            "psum_in" => Ok(Self::PsumIn),
            "psum_out" => Ok(Self::PsumOut),
            other => Err(DataflowError::UnknownPort {
                token: other.to_string(),
            }),
        }
    }
}

/// Fault mode of a single fault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultMode {
    /// Stuck-at-0.
    StuckAt0,
    /// Stuck-at-1.
    StuckAt1,
    /// Single bit flip.
    BitFlip,
    /// Experiment-defined tag.
    Custom(String),
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StuckAt0 => write!(f, "stuck-at-0"),
            Self::StuckAt1 => write!(f, "stuck-at-1"),
            Self::BitFlip => write!(f, "bit-flip"),
            Self::Custom(tag) => write!(f, "{tag}"),
        }
    }
}

impl From<&str> for FaultMode {
    fn from(s: &str) -> Self {
        match s {
            "stuck-at-0" | "0" => Self::StuckAt0,
            "stuck-at-1" | "1" => Self::StuckAt1,
            "bit-flip" | "flip" => Self::BitFlip,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Metadata of one fault record.
///
/// Every field is a parallel list: singletons for freshly generated faults,
/// longer after coordinate collapsing merged several records into one. The
/// `ids` trace back to the originally generated faults and are conserved
/// through every fan-out and fan-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultMeta {
    /// Port tags.
    pub ports: Vec<PortTag>,
    /// Fault modes.
    pub modes: Vec<FaultMode>,
    /// Affected bit indices.
    pub bits: Vec<u16>,
    /// Provenance ids.
    pub ids: Vec<u64>,
}

impl FaultMeta {
    /// Record for one fault.
    #[must_use]
    pub fn single(port: PortTag, mode: FaultMode, bit: u16, id: u64) -> Self {
        Self {
            ports: vec![port],
            modes: vec![mode],
            bits: vec![bit],
            ids: vec![id],
        }
    }
}

/// How fault metadata relates across records, which decides what a collapse
/// must merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultOrigin {
    /// All records stem from one generated fault (stuck-at replication):
    /// metadata is identical everywhere, a collapse merges ids only.
    Uniform,
    /// Records stem from independent faults (transient burst): a collapse
    /// merges ids, modes, bits and ports positionally.
    Mixed,
}

/// Columnar fault table: coordinates plus one metadata record per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultColumns {
    pub(crate) coords: CoordMatrix,
    pub(crate) meta: Vec<FaultMeta>,
}

impl FaultColumns {
    /// Empty table of the given coordinate width.
    #[must_use]
    pub fn empty(width: usize) -> Self {
        Self {
            coords: CoordMatrix::empty(width),
            meta: Vec::new(),
        }
    }

    /// Build from parts; coordinate rows and metadata must pair one-to-one.
    pub fn new(coords: CoordMatrix, meta: Vec<FaultMeta>) -> Result<Self> {
        if coords.rows() != meta.len() {
            return Err(DataflowError::config(format!(
                "fault table has {} coordinates but {} metadata records",
                coords.rows(),
                meta.len()
            )));
        }
        Ok(Self { coords, meta })
    }

    /// Number of fault records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.meta.len()
    }

    /// True when the table has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    /// Coordinate matrix.
    #[must_use]
    pub fn coords(&self) -> &CoordMatrix {
        &self.coords
    }

    /// Metadata records.
    #[must_use]
    pub fn meta(&self) -> &[FaultMeta] {
        &self.meta
    }

    /// Append one record.
    pub fn push(&mut self, coord: &[i64], meta: FaultMeta) {
        self.coords.push_row(coord);
        self.meta.push(meta);
    }

    /// Replace the coordinates wholesale (row count must be preserved by the
    /// caller or matched with a dispatch/filter on the metadata side).
    pub(crate) fn set_coords(&mut self, coords: CoordMatrix) {
        self.coords = coords;
    }

    /// Duplicate metadata along a fan-out dispatch (entry i names the source
    /// record of output record i).
    pub(crate) fn dispatch_meta(&mut self, dispatch: &[usize]) {
        self.meta = dispatch.iter().map(|&i| self.meta[i].clone()).collect();
    }

    /// Drop records whose mask entry is false, coordinates and metadata
    /// together.
    pub(crate) fn retain_mask(&mut self, keep: &[bool]) {
        self.coords = self.coords.filter(keep);
        let mut it = keep.iter();
        self.meta.retain(|_| *it.next().unwrap_or(&false));
    }

    /// Merge records that share a coordinate.
    ///
    /// The result holds exactly one record per distinct coordinate (sorted
    /// lexicographically) and the union of the input ids; with
    /// [`FaultOrigin::Mixed`] the mode/bit/port lists merge alongside.
    /// Group members are visited in ascending record order, so the merge is
    /// independent of the input ordering.
    pub fn collapse(&mut self, origin: FaultOrigin) {
        if self.len() <= 1 {
            return;
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.coords.row(a).cmp(self.coords.row(b)));

        let mut coords = CoordMatrix::empty(self.coords.width());
        let mut meta: Vec<FaultMeta> = Vec::new();
        for &i in &order {
            let row = self.coords.row(i);
            let same_group = coords.rows() > 0 && coords.row(coords.rows() - 1) == row;
            match meta.last_mut() {
                Some(last) if same_group => {
                    let rec = &self.meta[i];
                    last.ids.extend_from_slice(&rec.ids);
                    if origin == FaultOrigin::Mixed {
                        last.ports.extend_from_slice(&rec.ports);
                        last.modes.extend(rec.modes.iter().cloned());
                        last.bits.extend_from_slice(&rec.bits);
                    }
                }
                _ => {
                    coords.push_row(row);
                    meta.push(self.meta[i].clone());
                }
            }
        }
        self.coords = coords;
        self.meta = meta;
    }

    /// Concatenate tables of equal coordinate width.
    pub fn concat(parts: &[&Self]) -> Result<Self> {
        let coords: Vec<&CoordMatrix> = parts.iter().map(|p| &p.coords).collect();
        let coords = CoordMatrix::concat(&coords)?;
        let meta = parts.iter().flat_map(|p| p.meta.iter().cloned()).collect();
        Ok(Self { coords, meta })
    }
}

/// A fault table in either physical layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FaultTable {
    /// Coordinate-indexed layout.
    Indexed(HashMap<Vec<i64>, FaultMeta>),
    /// Columnar layout; the only one the mapping pipeline accepts.
    Columnar(FaultColumns),
}

impl FaultTable {
    /// Empty columnar table of the given width.
    #[must_use]
    pub fn empty(width: usize) -> Self {
        Self::Columnar(FaultColumns::empty(width))
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Indexed(map) => map.len(),
            Self::Columnar(cols) => cols.len(),
        }
    }

    /// True when no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert to the columnar layout (records sorted by coordinate for a
    /// deterministic order).
    #[must_use]
    pub fn into_columnar(self) -> FaultColumns {
        match self {
            Self::Columnar(cols) => cols,
            Self::Indexed(map) => {
                let width = map.keys().next().map_or(0, Vec::len);
                let mut entries: Vec<(Vec<i64>, FaultMeta)> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                let mut cols = FaultColumns::empty(width);
                for (coord, meta) in entries {
                    cols.push(&coord, meta);
                }
                cols
            }
        }
    }

    /// Convert to the indexed layout. Records sharing a coordinate merge
    /// their field lists positionally.
    #[must_use]
    pub fn into_indexed(self) -> HashMap<Vec<i64>, FaultMeta> {
        match self {
            Self::Indexed(map) => map,
            Self::Columnar(cols) => {
                let mut map: HashMap<Vec<i64>, FaultMeta> = HashMap::new();
                for (row, meta) in cols.coords.iter_rows().zip(cols.meta) {
                    match map.entry(row.to_vec()) {
                        std::collections::hash_map::Entry::Occupied(mut e) => {
                            let rec = e.get_mut();
                            rec.ports.extend_from_slice(&meta.ports);
                            rec.modes.extend(meta.modes.iter().cloned());
                            rec.bits.extend_from_slice(&meta.bits);
                            rec.ids.extend_from_slice(&meta.ids);
                        }
                        std::collections::hash_map::Entry::Vacant(e) => {
                            e.insert(meta);
                        }
                    }
                }
                map
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FaultColumns {
        let coords =
            CoordMatrix::from_rows(2, &[&[1, 0], &[0, 2], &[1, 0], &[0, 2], &[3, 3]]).unwrap();
        let meta = (0..5)
            .map(|i| FaultMeta::single(PortTag::IfmapIn, FaultMode::BitFlip, 3, i))
            .collect();
        FaultColumns::new(coords, meta).unwrap()
    }

    #[test]
    fn collapse_merges_ids_per_coordinate() {
        let mut t = table();
        t.collapse(FaultOrigin::Uniform);
        assert_eq!(t.len(), 3);
        // Sorted by coordinate: (0,2), (1,0), (3,3).
        assert_eq!(t.coords().row(0), &[0, 2]);
        assert_eq!(t.meta()[0].ids, vec![1, 3]);
        assert_eq!(t.meta()[1].ids, vec![0, 2]);
        assert_eq!(t.meta()[2].ids, vec![4]);
        // Uniform origin: metadata stays singleton.
        assert_eq!(t.meta()[0].bits, vec![3]);
    }

    #[test]
    fn collapse_preserves_id_union() {
        let mut t = table();
        t.collapse(FaultOrigin::Mixed);
        let mut ids: Vec<u64> = t.meta().iter().flat_map(|m| m.ids.clone()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        // Mixed origin: the merged record carries parallel lists.
        assert_eq!(t.meta()[0].ports.len(), 2);
        assert_eq!(t.meta()[0].bits.len(), 2);
    }

    #[test]
    fn layout_conversion_round_trip() {
        let mut t = table();
        t.collapse(FaultOrigin::Uniform);
        let indexed = FaultTable::Columnar(t.clone()).into_indexed();
        assert_eq!(indexed.len(), 3);
        let back = FaultTable::Indexed(indexed).into_columnar();
        assert_eq!(back, t);
    }

    #[test]
    fn port_tag_round_trip() {
        for port in PortTag::ALL {
            assert_eq!(port.to_string().parse::<PortTag>().unwrap(), port);
        }
        assert!("psum".parse::<PortTag>().is_err());
    }
}
