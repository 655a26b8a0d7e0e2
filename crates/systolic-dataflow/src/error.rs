//! Error types for dataflow mapping operations

use thiserror::Error;

/// Result type alias for dataflow mapping operations
pub type Result<T> = std::result::Result<T, DataflowError>;

/// Errors that can occur while configuring or running the mapping pipeline
#[derive(Debug, Error)]
pub enum DataflowError {
    /// Invalid dataflow configuration
    #[error("Invalid dataflow configuration: {reason}")]
    Config {
        /// Reason for rejection
        reason: String,
    },

    /// Pipeline stage invoked out of order
    #[error("Pipeline stage out of order: {stage} requires {expected}, engine is {got}")]
    PipelineOrder {
        /// Stage that was invoked
        stage: &'static str,
        /// State the stage requires
        expected: &'static str,
        /// State the engine is actually in
        got: &'static str,
    },

    /// Priority list does not cover the shape it orders
    #[error("Priority list length {got} does not match shape rank {expected}")]
    PriorityLength {
        /// Rank of the shape being ordered
        expected: usize,
        /// Length of the supplied priority list
        got: usize,
    },

    /// Coordinate width disagrees with the current mapping shape
    #[error("Coordinate width {got} does not match mapping rank {expected}")]
    CoordWidth {
        /// Rank of the current mapping shape
        expected: usize,
        /// Width of the supplied coordinates
        got: usize,
    },

    /// Axis token outside the PE dataflow axis set
    #[error("Unknown axis token `{token}` (expected PE_x, PE_y or t_clk)")]
    UnknownAxis {
        /// Offending token
        token: String,
    },

    /// Port tag outside the PE I/O port set
    #[error("Unknown port tag `{token}`")]
    UnknownPort {
        /// Offending token
        token: String,
    },

    /// Clock depth queried before alignment derived it
    #[error("Clock depth not derived; run alignment (or its shape-only pre-plan) first")]
    ClockDepthUnset,
}

impl DataflowError {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
