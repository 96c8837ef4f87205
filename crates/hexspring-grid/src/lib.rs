#![warn(missing_docs)]

//! Hexahedral grid core for the hexspring mesher.
//!
//! The data model (vertices with clamps, eight-cornered cells with
//! rest edge lengths, the grid arena with its logical-id cell map and
//! vertex spatial index), the spring energy model, and the per-vertex
//! steepest-descent optimiser.

pub mod cell;
pub mod clamp;
pub mod edge;
pub mod energy;
pub mod face;
pub mod grid;
mod io;
pub mod optimizer;
pub mod state;
pub mod tables;
pub mod vert;

pub use cell::{GridCell, PRISM_REST_STRETCH};
pub use clamp::{mask, Clamp};
pub use edge::GridEdge;
pub use energy::EnergyParams;
pub use face::{GridFace, SearchableFace};
pub use grid::Grid;
pub use optimizer::{minimize_vertex_energy, SteepestDescent, MAX_OPTIMIZER_STEPS};
pub use state::{Overlay, Positions, VertState};
pub use tables::{CellVertPos, FaceNumber, VertEdgeDir};
pub use vert::GridVert;

/// Sentinel for "no index".
pub const INVALID_INDEX: usize = usize::MAX;
