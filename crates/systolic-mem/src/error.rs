//! Error types for bitmap fault generation

use thiserror::Error;

/// Result type alias for bitmap operations
pub type Result<T> = std::result::Result<T, BitmapError>;

/// Errors that can occur while sampling memory fault addresses
#[derive(Debug, Error)]
pub enum BitmapError {
    /// Poisson lambda outside the memory grid
    #[error("Poisson lambda ({lambda_row}, {lambda_col}) outside memory shape {rows}x{cols}")]
    LambdaOutOfRange {
        /// Row lambda
        lambda_row: f64,
        /// Column lambda
        lambda_col: f64,
        /// Memory rows
        rows: usize,
        /// Memory columns
        cols: usize,
    },

    /// Fault rate produces more faults than memory cells
    #[error("Fault rate {rate} asks for {wanted} faults in a memory of {cells} cells")]
    RateTooHigh {
        /// Requested fault rate
        rate: f64,
        /// Faults the rate implies
        wanted: usize,
        /// Cells available
        cells: usize,
    },
}
