#![warn(missing_docs)]

//! Pipeline driver for the hexspring hexahedral mesher.
//!
//! Takes surface models plus a parameter record and produces a
//! conforming hexahedral grid: initial lattice, boundary clamps, cusp
//! snapping, parallel spring-energy relaxation, sharp-ridge fitting,
//! and octree refinement.

pub mod dump_obj;
pub mod error;
pub mod mesher;
pub mod params;
pub mod relax;

pub use dump_obj::DumpObj;
pub use error::{ErrorCode, MesherError, Result};
pub use mesher::{Mesher, NullReporter, Reporter};
pub use params::Params;
pub use relax::{enforce_derived_clamps, relax_pass, RelaxStats};
