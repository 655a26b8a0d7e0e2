#![forbid(unsafe_code)]

//! Memory-bitmap fault-address generator.
//!
//! Models an on-chip buffer as a 2D bitmap of memory cells and samples
//! fault addresses over it, either uniformly or clustered around a Poisson
//! hot spot. The resulting fault map feeds buffer fault-tolerance analysis
//! the same way the PE-array engine's fault tables feed dataflow analysis.
//!
//! # Example
//!
//! ```
//! use rand::SeedableRng;
//! use systolic_mem::{AddrDistribution, Bitmap};
//!
//! # fn main() -> systolic_mem::Result<()> {
//! let bitmap = Bitmap::new(64, 32, 8);
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//! let (faults, count) =
//!     bitmap.gen_fault_map(&mut rng, 0.01, AddrDistribution::Uniform, "flip")?;
//! assert_eq!(faults.len(), count);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

mod bitmap;
mod error;

pub use bitmap::{AddrDistribution, Bitmap};
pub use error::{BitmapError, Result};
