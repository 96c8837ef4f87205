//! Grid faces: a cell id plus a face number, and the sorted-corner
//! form used to match the same face across neighbouring cells.

use hexspring_math::{triangle_normal, Vec3};

use crate::grid::Grid;
use crate::state::Positions;
use crate::tables::FaceNumber;

/// A face of a specific cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridFace {
    cell_idx: usize,
    face: FaceNumber,
}

impl GridFace {
    /// Face `face` of cell `cell_idx`.
    pub fn new(cell_idx: usize, face: FaceNumber) -> Self {
        Self { cell_idx, face }
    }

    /// The owning cell's logical id.
    pub fn cell_idx(&self) -> usize {
        self.cell_idx
    }

    /// Which face of the cell.
    pub fn face_number(&self) -> FaceNumber {
        self.face
    }

    /// The four corner vertex indices in winding order.
    pub fn vert_indices(&self, grid: &Grid) -> [usize; 4] {
        grid.cell(self.cell_idx).face_indices(self.face)
    }

    /// Average of the two face-triangle normals, unitised.
    pub fn normal<P: Positions + ?Sized>(&self, grid: &Grid, pos: &P) -> Vec3 {
        let tris = grid.cell(self.cell_idx).face_tri_points(self.face, pos);
        let n = triangle_normal(&tris[0]) + triangle_normal(&tris[1]);
        hexspring_math::safe_normalize(&n).unwrap_or_else(Vec3::zeros)
    }

    /// Mean of the four corners.
    pub fn centroid<P: Positions + ?Sized>(&self, grid: &Grid, pos: &P) -> Vec3 {
        let idx = self.vert_indices(grid);
        idx.iter().map(|&i| pos.pt(i)).sum::<Vec3>() / 4.0
    }

    /// True when both faces have the same corner set, in any order.
    pub fn same_verts(verts0: &[usize; 4], verts1: &[usize; 4]) -> bool {
        verts0.iter().all(|v| verts1.contains(v))
    }
}

/// A face keyed by its sorted corner indices, so two cells sharing a
/// face compare equal even with different local orientations.
#[derive(Debug, Clone, Copy)]
pub struct SearchableFace {
    face: GridFace,
    sorted: [usize; 4],
}

impl SearchableFace {
    /// Key `face` by its corner indices.
    pub fn new(face: GridFace, indices: [usize; 4]) -> Self {
        let mut sorted = indices;
        sorted.sort_unstable();
        Self { face, sorted }
    }

    /// The underlying cell face.
    pub fn face(&self) -> &GridFace {
        &self.face
    }

    /// The sorted corner key.
    pub fn sorted_indices(&self) -> &[usize; 4] {
        &self.sorted
    }
}

// Identity is the corner set alone; the (cell, face) payload records
// which cell contributed the face first.
impl PartialEq for SearchableFace {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Eq for SearchableFace {}

impl PartialOrd for SearchableFace {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchableFace {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sorted.cmp(&other.sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_verts_any_order() {
        let a = [3, 9, 4, 7];
        let b = [7, 4, 9, 3];
        let c = [7, 4, 9, 5];
        assert!(GridFace::same_verts(&a, &b));
        assert!(!GridFace::same_verts(&a, &c));
    }

    #[test]
    fn test_searchable_face_matches_across_cells() {
        let f0 = SearchableFace::new(GridFace::new(0, FaceNumber::Top), [4, 5, 7, 6]);
        let f1 = SearchableFace::new(GridFace::new(3, FaceNumber::Bottom), [6, 7, 5, 4]);
        assert_eq!(f0, f1);

        let mut set = std::collections::BTreeSet::new();
        set.insert(f0);
        set.insert(f1);
        assert_eq!(set.len(), 1);
    }
}
