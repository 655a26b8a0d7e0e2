//! PE dataflow axes and flow directions.
//!
//! The dataflow model is a 3D grid: two physical PE dimensions (`PE_y` rows,
//! `PE_x` columns) plus the clock axis `t_clk`. A tensor tile mapped onto the
//! array gains a trailing slice axis on top of these three.

use crate::error::{DataflowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One axis of the PE dataflow model.
///
/// Variant order is the canonical axis order used when mapping shapes are
/// assembled: rows, then columns, then clock (the slice axis always trails).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeAxis {
    /// PE row direction (`PE_y`).
    PeY,
    /// PE column direction (`PE_x`).
    PeX,
    /// Clock cycle direction (`t_clk`).
    Clk,
}

impl PeAxis {
    /// All axes in canonical order.
    pub const ALL: [Self; 3] = [Self::PeY, Self::PeX, Self::Clk];

    /// True for the two physical PE dimensions.
    #[must_use]
    pub const fn is_physical(self) -> bool {
        matches!(self, Self::PeY | Self::PeX)
    }
}

impl fmt::Display for PeAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeY => "PE_y",
            Self::PeX => "PE_x",
            Self::Clk => "t_clk",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PeAxis {
    type Err = DataflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PE_y" => Ok(Self::PeY),
            "PE_x" => Ok(Self::PeX),
            "t_clk" => Ok(Self::Clk),
            other => Err(DataflowError::UnknownAxis {
                token: other.to_string(),
            }),
        }
    }
}

/// Direction of a data or window sweep along an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowDirection {
    /// Starts from index 0 and increments.
    Forward,
    /// Starts from the last index and decrements.
    Backward,
}

impl FlowDirection {
    /// Signed unit step of the direction.
    #[must_use]
    pub const fn polarity(self) -> i64 {
        match self {
            Self::Forward => 1,
            Self::Backward => -1,
        }
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FlowDirection {
    type Err = DataflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(Self::Forward),
            "backward" => Ok(Self::Backward),
            other => Err(DataflowError::config(format!(
                "flow direction must be `forward` or `backward`, got `{other}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_token_round_trip() {
        for axis in PeAxis::ALL {
            assert_eq!(axis.to_string().parse::<PeAxis>().unwrap(), axis);
        }
    }

    #[test]
    fn axis_token_rejected() {
        assert!(matches!(
            "t_row".parse::<PeAxis>(),
            Err(DataflowError::UnknownAxis { .. })
        ));
    }

    #[test]
    fn direction_polarity() {
        assert_eq!(FlowDirection::Forward.polarity(), 1);
        assert_eq!(FlowDirection::Backward.polarity(), -1);
    }
}
