//! The grid: vertex arena, compact cell store with a logical-id map,
//! and the vertex spatial index.

use std::collections::BTreeSet;

use hexspring_math::{
    safe_normalize, triangle_normal, BoundingBox, Plane, Vec3, OPTIMIZER_TOL, SAME_DIST_TOL,
};
use hexspring_surface::SurfaceModel;

use crate::cell::GridCell;
use crate::clamp::Clamp;
use crate::face::GridFace;
use crate::state::Positions;
use crate::tables::{CellVertPos, CORNER_FACES};
use crate::vert::GridVert;

/// Vertex and cell storage plus the vertex spatial index.
///
/// Vertices are append-only for the life of a run. Cells may be
/// deleted: deletion invalidates the logical id and compacts the store
/// by swapping the back entry into the hole, so only the moved cell's
/// storage index changes.
#[derive(Debug, Clone)]
pub struct Grid {
    verts: Vec<GridVert>,
    cell_index_map: Vec<Option<usize>>,
    cell_storage: Vec<GridCell>,
    vert_tree: hexspring_math::SpatialTree,
}

impl Positions for Grid {
    fn pt(&self, vert_idx: usize) -> Vec3 {
        *self.verts[vert_idx].pt()
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::new()
    }
}

impl Grid {
    /// An empty grid. Call [`set_bounds`](Self::set_bounds) before
    /// adding vertices.
    pub fn new() -> Self {
        Self {
            verts: Vec::new(),
            cell_index_map: Vec::new(),
            cell_storage: Vec::new(),
            vert_tree: hexspring_math::SpatialTree::new(BoundingBox::new(
                Vec3::zeros(),
                Vec3::new(1.0, 1.0, 1.0),
            )),
        }
    }

    /// Adopt working bounds for the vertex spatial index, slightly
    /// grown so boundary vertices stay inside.
    pub fn set_bounds(&mut self, bbox: &BoundingBox) {
        let mut search = *bbox;
        search.grow(0.01 * bbox.range().norm());
        self.vert_tree.reset(search);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.verts.clear();
        self.cell_index_map.clear();
        self.cell_storage.clear();
        self.vert_tree.clear();
    }

    // ---- vertices ----------------------------------------------------

    /// Number of vertices.
    pub fn num_verts(&self) -> usize {
        self.verts.len()
    }

    /// True when `vert_idx` names a vertex.
    pub fn vert_exists(&self, vert_idx: usize) -> bool {
        vert_idx < self.verts.len()
    }

    /// A vertex by index.
    pub fn vert(&self, vert_idx: usize) -> &GridVert {
        &self.verts[vert_idx]
    }

    /// A vertex by index, mutable.
    pub fn vert_mut(&mut self, vert_idx: usize) -> &mut GridVert {
        &mut self.verts[vert_idx]
    }

    /// Add a vertex, fusing onto an existing one within
    /// `SAME_DIST_TOL`. Returns the (new or existing) index.
    pub fn add_vert(&mut self, pt: &Vec3) -> usize {
        let mut query = BoundingBox::from_point(pt);
        query.grow(SAME_DIST_TOL);
        for hit in self.vert_tree.find(&query) {
            if hexspring_math::tolerant_eq_pt(self.verts[hit].pt(), pt) {
                return hit;
            }
        }
        let idx = self.verts.len();
        self.verts.push(GridVert::new(idx, *pt));
        self.vert_tree.add(BoundingBox::from_point(pt), idx);
        idx
    }

    /// Move a vertex through the spatial index. Fails (and leaves the
    /// vertex in place) when the destination would fuse it with a
    /// different existing vertex.
    pub fn set_vert_pos(&mut self, vert_idx: usize, pt: &Vec3) -> bool {
        let mut query = BoundingBox::from_point(pt);
        query.grow(SAME_DIST_TOL);
        for hit in self.vert_tree.find(&query) {
            if hit != vert_idx && hexspring_math::tolerant_eq_pt(self.verts[hit].pt(), pt) {
                return false;
            }
        }
        self.move_vert_direct(vert_idx, pt);
        true
    }

    /// Move a vertex, keeping the spatial index in step, without the
    /// fuse check. Used for clamp snaps whose targets are already
    /// known to be distinct.
    pub fn move_vert_direct(&mut self, vert_idx: usize, pt: &Vec3) {
        let old_box = BoundingBox::from_point(self.verts[vert_idx].pt());
        let was_tracked = self.vert_tree.remove(&old_box, vert_idx);
        self.verts[vert_idx].set_pt(*pt);
        if was_tracked {
            self.vert_tree.add(BoundingBox::from_point(pt), vert_idx);
        }
    }

    /// Vertex indices whose positions fall in `bbox`. Rebuilds the
    /// spatial index first if it was cleared.
    pub fn find_verts(&mut self, bbox: &BoundingBox) -> Vec<usize> {
        if self.vert_tree.is_empty() && !self.verts.is_empty() {
            self.rebuild_vert_tree();
        }
        self.vert_tree.find(bbox)
    }

    /// Drop the spatial index. Bulk vertex movement (a relaxation
    /// pass) clears it first and rebuilds afterwards.
    pub fn clear_vert_tree(&mut self) {
        self.vert_tree.clear();
    }

    /// Rebuild the spatial index from current positions.
    pub fn rebuild_vert_tree(&mut self) {
        let mut bounds = BoundingBox::empty();
        for vert in &self.verts {
            bounds.merge_point(vert.pt());
        }
        bounds.grow(0.01 * bounds.range().norm().max(1.0));
        self.vert_tree.reset(bounds);
        for (idx, vert) in self.verts.iter().enumerate() {
            self.vert_tree.add(BoundingBox::from_point(vert.pt()), idx);
        }
    }

    /// Number of vertices carrying a clamp other than `None`.
    pub fn num_clamped_verts(&self) -> usize {
        self.verts
            .iter()
            .filter(|v| !matches!(v.clamp(), Clamp::None))
            .count()
    }

    // ---- cells -------------------------------------------------------

    /// Number of logical cell ids ever issued (live and deleted).
    pub fn num_cells(&self) -> usize {
        self.cell_index_map.len()
    }

    /// Number of live cells.
    pub fn num_live_cells(&self) -> usize {
        self.cell_storage.len()
    }

    /// True when the logical id names a live cell.
    pub fn cell_exists(&self, cell_idx: usize) -> bool {
        self.cell_index_map
            .get(cell_idx)
            .map_or(false, |m| m.is_some())
    }

    /// A live cell by logical id.
    pub fn cell(&self, cell_idx: usize) -> &GridCell {
        &self.cell_storage[self.cell_index_map[cell_idx].expect("cell was deleted")]
    }

    /// A live cell by logical id, mutable.
    pub fn cell_mut(&mut self, cell_idx: usize) -> &mut GridCell {
        &mut self.cell_storage[self.cell_index_map[cell_idx].expect("cell was deleted")]
    }

    /// Snapshot of the live logical ids, bounded to the ids that exist
    /// now, so it is safe to iterate while splitting adds more cells.
    pub fn live_cell_ids(&self) -> Vec<usize> {
        (0..self.cell_index_map.len())
            .filter(|&id| self.cell_index_map[id].is_some())
            .collect()
    }

    /// Add a cell, wiring corner back-links. Panics if the new cell
    /// fails verification; a broken cell is an invariant violation.
    pub fn add_cell(&mut self, cell: GridCell) -> usize {
        let cell_id = self.cell_index_map.len();
        let storage_idx = self.cell_storage.len();
        self.cell_storage.push(cell);
        self.cell_index_map.push(Some(storage_idx));
        self.cell_storage[storage_idx].set_id(cell_id);

        for pos in CellVertPos::ALL {
            let vert_idx = self.cell_storage[storage_idx].vert_idx(pos);
            self.verts[vert_idx].add_cell_index(cell_id);
        }

        if !self.cell(cell_id).verify(self, true) {
            panic!("new cell {cell_id} is invalid");
        }
        cell_id
    }

    /// Delete a cell: unlink corners, invalidate the logical id, and
    /// compact storage by swapping the back entry into the hole.
    pub fn delete_cell(&mut self, cell_idx: usize) {
        let Some(storage_idx) = self.cell_index_map[cell_idx].take() else {
            return;
        };

        for pos in CellVertPos::ALL {
            let vert_idx = self.cell_storage[storage_idx].vert_idx(pos);
            self.verts[vert_idx].remove_cell_index(cell_idx);
        }

        let last = self.cell_storage.len() - 1;
        if storage_idx != last {
            let moved_id = self.cell_storage[last].id();
            self.cell_index_map[moved_id] = Some(storage_idx);
        }
        self.cell_storage.swap_remove(storage_idx);
    }

    /// Current storage slot of a live cell (changes on compaction).
    pub(crate) fn storage_index(&self, cell_idx: usize) -> usize {
        self.cell_index_map[cell_idx].expect("cell was deleted")
    }

    /// Cell by storage slot, in storage order.
    pub(crate) fn cell_at_storage(&self, storage_idx: usize) -> &GridCell {
        &self.cell_storage[storage_idx]
    }

    /// Assemble a grid from deserialised parts. The caller rebuilds
    /// the spatial index.
    pub(crate) fn from_parts(
        verts: Vec<GridVert>,
        cell_index_map: Vec<Option<usize>>,
        cell_storage: Vec<GridCell>,
    ) -> Self {
        Self {
            verts,
            cell_index_map,
            cell_storage,
            vert_tree: hexspring_math::SpatialTree::new(BoundingBox::new(
                Vec3::zeros(),
                Vec3::new(1.0, 1.0, 1.0),
            )),
        }
    }

    // ---- vertex topology helpers -------------------------------------

    /// Shortest edge leaving `vert_idx` under a position view.
    pub fn min_adj_edge_length<P: Positions + ?Sized>(&self, vert_idx: usize, pos: &P) -> f64 {
        let pt0 = pos.pt(vert_idx);
        let mut checked = BTreeSet::new();
        let mut min_len = f64::MAX;
        for &cell_idx in self.verts[vert_idx].cell_indices() {
            let cell = self.cell(cell_idx);
            let Some(p0) = cell.verts_pos(vert_idx) else {
                continue;
            };
            for other in cell.adjacent_edge_vert_indices(p0) {
                if checked.insert(other) {
                    min_len = min_len.min((pos.pt(other) - pt0).norm());
                }
            }
        }
        min_len
    }

    /// Degrees-of-freedom balance metric: zero for clamped vertices;
    /// otherwise the norm of the mean of the distinct outgoing edge
    /// directions over the average edge length. Near zero means the
    /// vertex is surrounded evenly and needs no clamp.
    pub fn dof_metric<P: Positions + ?Sized>(&self, vert_idx: usize, pos: &P) -> f64 {
        if !self.verts[vert_idx].clamp().matches(crate::clamp::mask::NONE) {
            return 0.0;
        }

        let pt0 = pos.pt(vert_idx);
        let mut edge_dirs: Vec<Vec3> = Vec::new();
        let mut avg_edge_length = 0.0;
        for &cell_idx in self.verts[vert_idx].cell_indices() {
            let cell = self.cell(cell_idx);
            let Some(p0) = cell.verts_pos(vert_idx) else {
                continue;
            };
            for other in cell.adjacent_edge_vert_indices(p0) {
                let v = pt0 - pos.pt(other);
                let len = v.norm();
                let Some(dir) = safe_normalize(&v) else {
                    continue;
                };
                let duplicate = edge_dirs.iter().any(|d| (1.0 - d.dot(&dir).abs()) < 0.01);
                if !duplicate {
                    avg_edge_length += len;
                    edge_dirs.push(dir);
                }
            }
        }
        if edge_dirs.is_empty() {
            return 0.0;
        }
        avg_edge_length /= edge_dirs.len() as f64;
        let sum: Vec3 = edge_dirs.iter().sum::<Vec3>() / edge_dirs.len() as f64;
        sum.norm() / avg_edge_length
    }

    /// Cells reachable from `vert_idx` through shared corners.
    /// `levels == 0` gives the immediately adjacent ring.
    pub fn adjacent_cell_indices(&self, vert_idx: usize, levels: usize) -> BTreeSet<usize> {
        let mut adj: BTreeSet<usize> = self.verts[vert_idx].cell_indices().iter().copied().collect();
        for _ in 0..levels + 1 {
            let frontier: Vec<usize> = adj.iter().copied().collect();
            for cell_idx in frontier {
                let cell = self.cell(cell_idx);
                for pos in CellVertPos::ALL {
                    let v = cell.vert_idx(pos);
                    adj.extend(self.verts[v].cell_indices().iter().copied());
                }
            }
        }
        adj
    }

    /// The faces meeting at `vert_idx`. With `include_opposed` false,
    /// pairs of faces facing each other (normals more than 135° apart)
    /// are both removed, leaving only the vertex's outward shell.
    pub fn vert_faces(&self, vert_idx: usize, include_opposed: bool) -> Vec<GridFace> {
        let mut faces = Vec::new();
        for &cell_idx in self.verts[vert_idx].cell_indices() {
            let cell = self.cell(cell_idx);
            let Some(pos) = cell.verts_pos(vert_idx) else {
                continue;
            };
            for face in CORNER_FACES[pos.index()] {
                faces.push(GridFace::new(cell_idx, face));
            }
        }

        if !include_opposed {
            let mut i = 0;
            while i < faces.len() {
                let mut removed = false;
                for j in (i + 1)..faces.len() {
                    let ni = faces[i].normal(self, self);
                    let nj = faces[j].normal(self, self);
                    if ni.dot(&nj) < -0.7071 {
                        faces.remove(j);
                        faces.remove(i);
                        removed = true;
                        break;
                    }
                }
                if !removed {
                    i += 1;
                }
            }
        }
        faces
    }

    /// Centroid of three grid vertices.
    pub fn triangle_centroid<P: Positions + ?Sized>(&self, tri: &[usize; 3], pos: &P) -> Vec3 {
        hexspring_math::triangle_centroid(&[pos.pt(tri[0]), pos.pt(tri[1]), pos.pt(tri[2])])
    }

    // ---- clamp enforcement -------------------------------------------

    /// Snap a vertex onto whatever derived-geometry clamp it carries.
    /// Bypasses the spatial index; callers rebuild it afterwards.
    pub fn clamp_vertex(&mut self, vert_idx: usize) -> Option<f64> {
        match self.verts[vert_idx].clamp() {
            Clamp::CellEdgeCenter(_) => self.snap_to_cell_edge_center(vert_idx),
            Clamp::CellFaceCenter(_) => self.snap_to_cell_face_center(vert_idx),
            Clamp::TriPlane(_) => self.snap_to_tri_plane(vert_idx),
            _ => None,
        }
    }

    /// Snap a `CellEdgeCenter` vertex onto its edge midpoint. Returns
    /// the correction distance, `None` when the clamp does not apply.
    pub fn snap_to_cell_edge_center(&mut self, vert_idx: usize) -> Option<f64> {
        let Clamp::CellEdgeCenter(edge) = self.verts[vert_idx].clamp().clone() else {
            return None;
        };
        let new_pt = edge.center(self);
        let dist = (new_pt - self.verts[vert_idx].pt()).norm();
        if dist > OPTIMIZER_TOL {
            self.verts[vert_idx].set_pt(new_pt);
        }
        Some(dist)
    }

    /// Snap a `CellFaceCenter` vertex onto its face centroid.
    pub fn snap_to_cell_face_center(&mut self, vert_idx: usize) -> Option<f64> {
        let Clamp::CellFaceCenter(face) = self.verts[vert_idx].clamp().clone() else {
            return None;
        };
        if !self.cell_exists(face.cell_idx()) {
            log::warn!(
                "vertex {vert_idx} is clamped to the face of deleted cell {}",
                face.cell_idx()
            );
            return None;
        }
        let new_pt = self
            .cell(face.cell_idx())
            .face_centroid(face.face_number(), self);
        let dist = (new_pt - self.verts[vert_idx].pt()).norm();
        if dist > OPTIMIZER_TOL {
            self.verts[vert_idx].set_pt(new_pt);
        }
        Some(dist)
    }

    /// Project a `TriPlane` vertex back onto its triangle's plane.
    pub fn snap_to_tri_plane(&mut self, vert_idx: usize) -> Option<f64> {
        let Clamp::TriPlane(tri) = self.verts[vert_idx].clamp().clone() else {
            return None;
        };
        let pts = [self.pt(tri[0]), self.pt(tri[1]), self.pt(tri[2])];
        let plane = Plane::new(pts[0], triangle_normal(&pts));
        let cur = *self.verts[vert_idx].pt();
        let dist = plane.signed_distance(&cur);
        if dist.abs() > OPTIMIZER_TOL {
            self.verts[vert_idx].set_pt(cur - dist * plane.normal);
        }
        Some(dist.abs())
    }

    // ---- verification ------------------------------------------------

    /// True when the spatial index holds exactly one entry per vertex
    /// (plus `delta` in-flight removals).
    pub fn verify_vert_count(&self, delta: usize) -> bool {
        self.verts.len() == self.vert_tree.len() + delta
    }

    /// Full structural verification: cell/vertex cross-links, cell
    /// geometry, clamp references, spatial-index size. Logs the first
    /// failure and returns false.
    pub fn verify(&self, models: &[SurfaceModel]) -> bool {
        for cell_id in self.live_cell_ids() {
            let cell = self.cell(cell_id);
            if cell.id() != cell_id {
                log::warn!("cell {cell_id}: stored id {} mismatch", cell.id());
                return false;
            }
            if !cell.verify(self, true) {
                return false;
            }
        }

        for (vert_idx, vert) in self.verts.iter().enumerate() {
            if vert.index() != vert_idx {
                log::warn!("vertex {vert_idx}: stored index {} mismatch", vert.index());
                return false;
            }
            for &cell_idx in vert.cell_indices() {
                if !self.cell_exists(cell_idx) {
                    log::warn!("vertex {vert_idx} links to deleted cell {cell_idx}");
                    return false;
                }
                if self.cell(cell_idx).verts_pos(vert_idx).is_none() {
                    log::warn!("vertex {vert_idx} not a corner of linked cell {cell_idx}");
                    return false;
                }
            }
            if !self.verify_clamp(vert_idx, models) {
                return false;
            }
        }

        if !self.vert_tree.is_empty() && !self.verify_vert_count(0) {
            log::warn!(
                "spatial index holds {} entries for {} vertices",
                self.vert_tree.len(),
                self.verts.len()
            );
            return false;
        }
        true
    }

    fn verify_clamp(&self, vert_idx: usize, models: &[SurfaceModel]) -> bool {
        let vert = &self.verts[vert_idx];
        let clamp = vert.clamp();
        if !clamp.references_valid(models) {
            log::warn!("vertex {vert_idx}: clamp references missing model data");
            return false;
        }
        match clamp {
            Clamp::Edge {
                model,
                polyline,
                segment,
            } => {
                let m = &models[*model];
                let pl = &m.polylines[*polyline];
                let Some(cp) = pl.closest_point(&m.surface, vert.pt()) else {
                    log::warn!("vertex {vert_idx}: empty polyline behind edge clamp");
                    return false;
                };
                if cp.dist > SAME_DIST_TOL {
                    log::warn!(
                        "vertex {vert_idx}: {} off its clamped polyline",
                        cp.dist
                    );
                    return false;
                }
                if cp.seg_idx != *segment {
                    log::warn!(
                        "vertex {vert_idx}: clamped to segment {segment}, closest is {}",
                        cp.seg_idx
                    );
                    return false;
                }
            }
            Clamp::CellEdgeCenter(edge) => {
                if !self.vert_exists(edge.vert(0)) || !self.vert_exists(edge.vert(1)) {
                    log::warn!("vertex {vert_idx}: edge-center clamp names missing vertices");
                    return false;
                }
                let mid = edge.center(self);
                if (mid - vert.pt()).norm() >= SAME_DIST_TOL {
                    log::warn!("vertex {vert_idx}: off its clamped edge midpoint");
                    return false;
                }
            }
            Clamp::TriPlane(tri) => {
                if tri.iter().any(|&v| !self.vert_exists(v)) {
                    log::warn!("vertex {vert_idx}: tri-plane clamp names missing vertices");
                    return false;
                }
            }
            Clamp::CellFaceCenter(face) => {
                if !self.cell_exists(face.cell_idx()) {
                    log::warn!("vertex {vert_idx}: face-center clamp names deleted cell");
                    return false;
                }
            }
            _ => {}
        }
        true
    }

    // ---- initial lattice ---------------------------------------------

    /// Build the initial axis-aligned lattice filling `bbox` with
    /// roughly `max_edge`-sized cells. Returns the per-axis division
    /// counts.
    pub fn init_lattice(&mut self, bbox: &BoundingBox, max_edge: f64) -> [usize; 3] {
        self.clear();
        self.set_bounds(bbox);
        let range = bbox.range();

        let mut divs = [0usize; 3];
        for axis in 0..3 {
            divs[axis] = ((range[axis] / max_edge + 0.5) as usize).max(1);
        }
        let edge_lengths = Vec3::new(
            range.x / divs[0] as f64,
            range.y / divs[1] as f64,
            range.z / divs[2] as f64,
        );
        log::info!(
            "initial grid: {}x{}x{} cells",
            divs[0],
            divs[1],
            divs[2]
        );

        for z in 0..divs[2] {
            for y in 0..divs[1] {
                for x in 0..divs[0] {
                    let min_pt = bbox.min
                        + Vec3::new(
                            x as f64 * edge_lengths.x,
                            y as f64 * edge_lengths.y,
                            z as f64 * edge_lengths.z,
                        );
                    let mut cell = GridCell::new();
                    for dz in 0..2usize {
                        for dy in 0..2usize {
                            for dx in 0..2usize {
                                let pt = min_pt
                                    + Vec3::new(
                                        dx as f64 * edge_lengths.x,
                                        dy as f64 * edge_lengths.y,
                                        dz as f64 * edge_lengths.z,
                                    );
                                let vert_idx = self.add_vert(&pt);
                                cell.set_vert_idx(CellVertPos::from_lattice(dx, dy, dz), vert_idx);
                            }
                        }
                    }
                    for i in 0..12 {
                        let dir = cell.edge(i).dir(self);
                        let axis = (0..3)
                            .find(|&a| hexspring_math::tolerant_eq(dir[a].abs(), 1.0))
                            .expect("lattice edge not axis-aligned");
                        cell.set_rest_edge_length(i, edge_lengths[axis]);
                    }
                    self.add_cell(cell);
                }
            }
        }

        let expected = (divs[0] + 1) * (divs[1] + 1) * (divs[2] + 1);
        if expected != self.num_verts() {
            log::warn!(
                "unexpected vertex count after lattice init: {} != {expected}",
                self.num_verts()
            );
        }
        divs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_bbox(n: f64) -> BoundingBox {
        BoundingBox::new(Vec3::zeros(), Vec3::new(n, n, n))
    }

    #[test]
    fn test_single_cell_lattice() {
        let mut grid = Grid::new();
        grid.init_lattice(&unit_bbox(1.0), 1.0);
        assert_eq!(grid.num_live_cells(), 1);
        assert_eq!(grid.num_verts(), 8);
        assert!(grid.verify(&[]));
    }

    #[test]
    fn test_two_by_two_lattice() {
        let mut grid = Grid::new();
        grid.init_lattice(&unit_bbox(2.0), 1.0);
        assert_eq!(grid.num_live_cells(), 8);
        assert_eq!(grid.num_verts(), 27);
        assert!(grid.verify(&[]));
    }

    #[test]
    fn test_add_vert_fuses_coincident() {
        let mut grid = Grid::new();
        grid.set_bounds(&unit_bbox(1.0));
        let a = grid.add_vert(&Vec3::new(0.5, 0.5, 0.5));
        let b = grid.add_vert(&Vec3::new(0.5, 0.5, 0.5));
        assert_eq!(a, b);
        assert_eq!(grid.num_verts(), 1);
    }

    #[test]
    fn test_set_vert_pos_rejects_fuse() {
        let mut grid = Grid::new();
        grid.set_bounds(&unit_bbox(1.0));
        let a = grid.add_vert(&Vec3::new(0.25, 0.5, 0.5));
        let b = grid.add_vert(&Vec3::new(0.75, 0.5, 0.5));
        assert_ne!(a, b);
        assert!(!grid.set_vert_pos(a, &Vec3::new(0.75, 0.5, 0.5)));
        assert!(grid.set_vert_pos(a, &Vec3::new(0.4, 0.5, 0.5)));
        assert!((grid.vert(a).pt().x - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_delete_cell_compacts_and_preserves_ids() {
        let mut grid = Grid::new();
        grid.init_lattice(&unit_bbox(2.0), 1.0);
        assert_eq!(grid.num_cells(), 8);

        grid.delete_cell(3);
        assert!(!grid.cell_exists(3));
        assert_eq!(grid.num_live_cells(), 7);
        // All remaining logical ids still resolve to themselves.
        for id in grid.live_cell_ids() {
            assert_eq!(grid.cell(id).id(), id);
        }
        // The deleted cell's corners no longer link to it.
        for vert_idx in 0..grid.num_verts() {
            assert!(!grid.vert(vert_idx).linked_to_cell(3));
        }
        assert!(grid.verify(&[]));
    }

    #[test]
    fn test_min_adj_edge_length() {
        let mut grid = Grid::new();
        grid.init_lattice(&unit_bbox(2.0), 1.0);
        // Every lattice edge has length 1.
        for vert_idx in 0..grid.num_verts() {
            assert!((grid.min_adj_edge_length(vert_idx, &grid) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_dof_metric_balanced_interior() {
        let mut grid = Grid::new();
        grid.init_lattice(&unit_bbox(2.0), 1.0);
        // The body-centre vertex is fully surrounded: metric ~ 0.
        let centre = grid
            .find_verts(&BoundingBox::from_point(&Vec3::new(1.0, 1.0, 1.0)))
            .into_iter()
            .next()
            .unwrap();
        assert!(grid.dof_metric(centre, &grid) < 1e-9);
        // A corner vertex is one-sided: metric well away from 0.
        let corner = grid
            .find_verts(&BoundingBox::from_point(&Vec3::zeros()))
            .into_iter()
            .next()
            .unwrap();
        assert!(grid.dof_metric(corner, &grid) > 0.1);
    }
}
