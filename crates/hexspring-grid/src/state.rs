//! Position views.
//!
//! Geometry and energy routines are generic over where vertex
//! positions come from: the canonical grid, a worker's forked
//! relaxation state, or a single-vertex overlay used to probe a
//! candidate position without mutating anything.

use hexspring_math::Vec3;

use crate::clamp::Clamp;

/// Source of vertex positions, addressed by stable vertex index.
pub trait Positions {
    /// Position of vertex `vert_idx`.
    fn pt(&self, vert_idx: usize) -> Vec3;
}

/// One vertex's mutable relaxation state: position plus clamp.
#[derive(Debug, Clone)]
pub struct VertState {
    /// Current position.
    pub pt: Vec3,
    /// Current clamp.
    pub clamp: Clamp,
}

impl Positions for [VertState] {
    fn pt(&self, vert_idx: usize) -> Vec3 {
        self[vert_idx].pt
    }
}

impl Positions for Vec<VertState> {
    fn pt(&self, vert_idx: usize) -> Vec3 {
        self[vert_idx].pt
    }
}

/// A position view with a single vertex's position replaced.
pub struct Overlay<'a, P: Positions + ?Sized> {
    base: &'a P,
    vert_idx: usize,
    pt: Vec3,
}

impl<'a, P: Positions + ?Sized> Overlay<'a, P> {
    /// View `base` with `vert_idx` moved to `pt`.
    pub fn new(base: &'a P, vert_idx: usize, pt: Vec3) -> Self {
        Self { base, vert_idx, pt }
    }
}

impl<P: Positions + ?Sized> Positions for Overlay<'_, P> {
    fn pt(&self, vert_idx: usize) -> Vec3 {
        if vert_idx == self.vert_idx {
            self.pt
        } else {
            self.base.pt(vert_idx)
        }
    }
}
