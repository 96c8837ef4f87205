//! Cell subdivision.
//!
//! Two split kinds share a common split record: the octree 1→8 split
//! and the diagonal split that cuts a cell into two triangular prisms
//! along a clamped face diagonal and dices each prism into six
//! cuboids. After all splits run, the records drive clamp inheritance
//! onto the newly created vertices: boundary edges and faces of the
//! deleted source cell, matching edges and faces of neighbouring
//! cells, and polylines the source corners were clamped to.

use std::collections::{BTreeMap, BTreeSet};

use hexspring_grid::{
    mask, CellVertPos, Clamp, FaceNumber, Grid, GridCell, GridEdge, GridFace,
};
use hexspring_math::{Plane, Vec3, SAME_DIST_TOL, SAME_DIST_TOL_SQR};
use hexspring_surface::SurfaceModel;

use CellVertPos::*;
use FaceNumber::*;

/// Degrees-of-freedom metric above which an unclamped new vertex is a
/// clamp candidate.
const NEEDS_CLAMP_METRIC: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitKind {
    Octree,
    TriPrism,
}

/// What a split remembers about its source cell: enough to inherit
/// clamps after every split has run.
#[derive(Debug)]
struct SplitRecord {
    kind: SplitKind,
    /// Snapshot of the deleted source cell.
    cell: GridCell,
    /// The diagonal corners of a prism split.
    corners: Option<(CellVertPos, CellVertPos)>,
    /// Vertices created for this split's children.
    verts: BTreeSet<usize>,
}

#[derive(Debug, Clone, Copy)]
struct DiagonalSplit {
    cell_idx: usize,
    face: FaceNumber,
    corners: [CellVertPos; 2],
}

/// Splits cells and re-clamps the vertices the splits create.
pub struct Splitter<'a> {
    grid: &'a mut Grid,
    models: &'a [SurfaceModel],
    num_initial_verts: usize,

    // Working state of the octree split in progress.
    work_cell: GridCell,
    center: usize,
    face_centers: [usize; 6],
    edge_centers: BTreeMap<GridEdge, usize>,

    records: Vec<SplitRecord>,
    clamped_verts: Vec<usize>,
    new_cells: Vec<usize>,
    final_edges: BTreeSet<GridEdge>,
    // Clamp snaps are buffered and applied after all clamps are
    // chosen, so neighbour matching sees a geometrically stable grid.
    moved_points: BTreeMap<usize, Vec3>,
}

impl<'a> Splitter<'a> {
    /// A splitter over `grid`, consulting `models` for polyline
    /// re-clamping.
    pub fn new(grid: &'a mut Grid, models: &'a [SurfaceModel]) -> Self {
        let num_initial_verts = grid.num_verts();
        Self {
            grid,
            models,
            num_initial_verts,
            work_cell: GridCell::new(),
            center: hexspring_grid::INVALID_INDEX,
            face_centers: [hexspring_grid::INVALID_INDEX; 6],
            edge_centers: BTreeMap::new(),
            records: Vec::new(),
            clamped_verts: Vec::new(),
            new_cells: Vec::new(),
            final_edges: BTreeSet::new(),
            moved_points: BTreeMap::new(),
        }
    }

    /// Cells created by this splitter, in creation order.
    pub fn new_cells(&self) -> &[usize] {
        &self.new_cells
    }

    /// Cells incident to a vertex this splitter clamped.
    pub fn clamped_cells(&self) -> Vec<usize> {
        let mut cells = BTreeSet::new();
        for &vert_idx in &self.clamped_verts {
            cells.extend(self.grid.vert(vert_idx).cell_indices().iter().copied());
        }
        cells.into_iter().collect()
    }

    /// Octree-split every live cell, then inherit clamps.
    pub fn split_all(&mut self) {
        for cell_idx in self.grid.live_cell_ids() {
            self.split_cell_full(cell_idx);
        }
        self.finish();
    }

    /// Split a set of cells: first the diagonal splits their clamped
    /// face diagonals call for, then octree splits for the rest, then
    /// clamp inheritance.
    pub fn split_cells(&mut self, cells: &BTreeSet<usize>) {
        let mut diagonal: BTreeMap<GridEdge, Vec<DiagonalSplit>> = BTreeMap::new();
        for &cell_idx in cells {
            self.find_diagonal_splits(cell_idx, &mut diagonal);
        }
        for recs in diagonal.values() {
            for rec in recs {
                self.split_cell_face_diagonally(rec.cell_idx, rec.face, rec.corners[0]);
            }
        }
        for &cell_idx in cells {
            self.split_cell_full(cell_idx);
        }
        self.finish();
    }

    /// Octree-split one cell (1→8). Clamp inheritance waits for
    /// [`finish`](Self::finish).
    pub fn split_cell_full(&mut self, cell_idx: usize) {
        if !self.grid.cell_exists(cell_idx) {
            return;
        }
        self.split_cell_full_init(cell_idx);
        let rec_idx = self.create_record(SplitKind::Octree, None, cell_idx);

        // One sub-cell per source corner, assembled from the corner,
        // three edge centres, three face centres, and the body centre.
        self.add_sub_cell(rec_idx, LwrFntLft, [
            self.corn(LwrFntLft),
            self.edge_ctr(LwrFntLft, LwrFntRgt),
            self.edge_ctr(LwrFntLft, LwrBckLft),
            self.face_ctr(Bottom),
            self.edge_ctr(LwrFntLft, UprFntLft),
            self.face_ctr(Front),
            self.face_ctr(Left),
            self.center,
        ]);
        self.add_sub_cell(rec_idx, LwrFntRgt, [
            self.edge_ctr(LwrFntLft, LwrFntRgt),
            self.corn(LwrFntRgt),
            self.face_ctr(Bottom),
            self.edge_ctr(LwrFntRgt, LwrBckRgt),
            self.face_ctr(Front),
            self.edge_ctr(LwrFntRgt, UprFntRgt),
            self.center,
            self.face_ctr(Right),
        ]);
        self.add_sub_cell(rec_idx, LwrBckLft, [
            self.edge_ctr(LwrFntLft, LwrBckLft),
            self.face_ctr(Bottom),
            self.corn(LwrBckLft),
            self.edge_ctr(LwrBckLft, LwrBckRgt),
            self.face_ctr(Left),
            self.center,
            self.edge_ctr(LwrBckLft, UprBckLft),
            self.face_ctr(Back),
        ]);
        self.add_sub_cell(rec_idx, LwrBckRgt, [
            self.face_ctr(Bottom),
            self.edge_ctr(LwrFntRgt, LwrBckRgt),
            self.edge_ctr(LwrBckLft, LwrBckRgt),
            self.corn(LwrBckRgt),
            self.center,
            self.face_ctr(Right),
            self.face_ctr(Back),
            self.edge_ctr(LwrBckRgt, UprBckRgt),
        ]);
        self.add_sub_cell(rec_idx, UprFntLft, [
            self.edge_ctr(LwrFntLft, UprFntLft),
            self.face_ctr(Front),
            self.face_ctr(Left),
            self.center,
            self.corn(UprFntLft),
            self.edge_ctr(UprFntLft, UprFntRgt),
            self.edge_ctr(UprFntLft, UprBckLft),
            self.face_ctr(Top),
        ]);
        self.add_sub_cell(rec_idx, UprFntRgt, [
            self.face_ctr(Front),
            self.edge_ctr(LwrFntRgt, UprFntRgt),
            self.center,
            self.face_ctr(Right),
            self.edge_ctr(UprFntLft, UprFntRgt),
            self.corn(UprFntRgt),
            self.face_ctr(Top),
            self.edge_ctr(UprFntRgt, UprBckRgt),
        ]);
        self.add_sub_cell(rec_idx, UprBckLft, [
            self.face_ctr(Left),
            self.center,
            self.edge_ctr(LwrBckLft, UprBckLft),
            self.face_ctr(Back),
            self.edge_ctr(UprFntLft, UprBckLft),
            self.face_ctr(Top),
            self.corn(UprBckLft),
            self.edge_ctr(UprBckLft, UprBckRgt),
        ]);
        self.add_sub_cell(rec_idx, UprBckRgt, [
            self.center,
            self.face_ctr(Right),
            self.face_ctr(Back),
            self.edge_ctr(LwrBckRgt, UprBckRgt),
            self.face_ctr(Top),
            self.edge_ctr(UprFntRgt, UprBckRgt),
            self.edge_ctr(UprBckLft, UprBckRgt),
            self.corn(UprBckRgt),
        ]);
    }

    /// Run clamp inheritance over the accumulated split records and
    /// apply the buffered point moves.
    pub fn finish(&mut self) {
        self.build_edge_set();
        for rec_idx in 0..self.records.len() {
            self.clamp_to_edge_boundaries(rec_idx);
            self.clamp_to_face_boundaries(rec_idx);
        }
        for rec_idx in 0..self.records.len() {
            match self.records[rec_idx].kind {
                SplitKind::Octree => self.apply_octree_clamps(rec_idx),
                SplitKind::TriPrism => self.apply_prism_clamps(rec_idx),
            }
            self.clamp_to_adjacent_cell_edges(rec_idx);
            for face in FaceNumber::ALL {
                self.clamp_to_adjacent_cell_face(rec_idx, face);
            }
        }

        let moves: Vec<(usize, Vec3)> = std::mem::take(&mut self.moved_points).into_iter().collect();
        for (vert_idx, pt) in moves {
            self.grid.move_vert_direct(vert_idx, &pt);
        }

        self.fix_broken_links();
        self.final_edges.clear();
        self.records.clear();
    }

    // ---- octree split internals --------------------------------------

    fn split_cell_full_init(&mut self, cell_idx: usize) {
        self.work_cell = self.grid.cell(cell_idx).clone();
        let centroid = self.work_cell.centroid(self.grid);
        self.center = self.grid.add_vert(&centroid);
        self.edge_centers.clear();
        for i in 0..12 {
            let edge = self.work_cell.edge(i);
            let mid = edge.center(self.grid);
            self.edge_centers.insert(edge, self.grid.add_vert(&mid));
        }
        for face in FaceNumber::ALL {
            let ctr = self.work_cell.face_centroid(face, self.grid);
            self.face_centers[face.index()] = self.grid.add_vert(&ctr);
        }
    }

    fn corn(&self, pos: CellVertPos) -> usize {
        self.work_cell.vert_idx(pos)
    }

    fn edge_ctr(&self, p0: CellVertPos, p1: CellVertPos) -> usize {
        self.edge_centers[&GridEdge::new(self.corn(p0), self.corn(p1))]
    }

    fn face_ctr(&self, face: FaceNumber) -> usize {
        self.face_centers[face.index()]
    }

    fn add_sub_cell(&mut self, rec_idx: usize, _source_corner: CellVertPos, corners: [usize; 8]) {
        let mut cell = GridCell::new();
        for (pos, &vert_idx) in CellVertPos::ALL.iter().zip(&corners) {
            cell.set_vert_idx(*pos, vert_idx);
        }
        for i in 0..12 {
            cell.set_rest_edge_length(i, self.work_cell.rest_edge_length(i) / 2.0);
        }
        self.add_cell_to_record(cell, rec_idx);
    }

    fn create_record(
        &mut self,
        kind: SplitKind,
        corners: Option<(CellVertPos, CellVertPos)>,
        cell_idx: usize,
    ) -> usize {
        let cell = self.grid.cell(cell_idx).clone();
        self.records.push(SplitRecord {
            kind,
            cell,
            corners,
            verts: BTreeSet::new(),
        });
        self.grid.delete_cell(cell_idx);
        self.records.len() - 1
    }

    fn add_cell_to_record(&mut self, cell: GridCell, rec_idx: usize) -> usize {
        let cell_idx = self.grid.add_cell(cell);
        let cell_ref = self.grid.cell(cell_idx);
        for pos in CellVertPos::ALL {
            let vert_idx = cell_ref.vert_idx(pos);
            if vert_idx >= self.num_initial_verts {
                self.records[rec_idx].verts.insert(vert_idx);
            }
        }
        self.new_cells.push(cell_idx);
        cell_idx
    }

    // ---- diagonal split ----------------------------------------------

    /// Record the face diagonals of `cell_idx` that carry exactly two
    /// feature-clamped corners, grouped by the diagonal edge so both
    /// cells sharing it split consistently.
    fn find_diagonal_splits(
        &mut self,
        cell_idx: usize,
        out: &mut BTreeMap<GridEdge, Vec<DiagonalSplit>>,
    ) {
        if !self.grid.cell_exists(cell_idx) {
            return;
        }
        let cell = self.grid.cell(cell_idx);

        for face in FaceNumber::ALL {
            let face_pos = hexspring_grid::tables::FACE_CORNERS[face.index()];
            let face_verts = cell.face_indices(face);

            let mut clamped = [false; 4];
            let mut num_clamped = 0;
            for i in 0..4 {
                let clamp = self.grid.vert(face_verts[i]).clamp();
                clamped[i] = matches!(clamp, Clamp::Edge { .. } | Clamp::Vert { .. });
                if clamped[i] {
                    num_clamped += 1;
                }
            }
            if num_clamped != 2 {
                continue;
            }

            let (edge, corners) = if clamped[0] && clamped[2] {
                (
                    GridEdge::new(face_verts[0], face_verts[2]),
                    [face_pos[0], face_pos[2]],
                )
            } else if clamped[1] && clamped[3] {
                (
                    GridEdge::new(face_verts[1], face_verts[3]),
                    [face_pos[1], face_pos[3]],
                )
            } else {
                continue;
            };
            out.entry(edge).or_default().push(DiagonalSplit {
                cell_idx,
                face,
                corners,
            });
        }
    }

    /// Cut `face` (and its opposite) along the diagonal through
    /// `corner0`, building two triangular prisms, each diced into six
    /// cuboids.
    fn split_cell_face_diagonally(&mut self, cell_idx: usize, face: FaceNumber, corner0: CellVertPos) {
        if !self.grid.cell_exists(cell_idx) {
            return;
        }
        let base_cell = self.grid.cell(cell_idx).clone();
        let opp_face = face.opposite();

        let corners = self.diagonal_corners(&base_cell, face, corner0);
        let rec_idx = self.create_record(SplitKind::TriPrism, Some(corners), cell_idx);

        let mut face_idx = [base_cell.face_indices(face), base_cell.face_indices(opp_face)];
        // Invert the opposite face so both rings wind the same way.
        face_idx[1].swap(1, 3);

        let corner_idx = [
            base_cell.vert_idx(corner0),
            base_cell
                .opposite_edge_end_vert_idx(face, corner0)
                .expect("diagonal corner has no axial edge"),
        ];

        // Split each ring into two triangles along the diagonal from
        // the clamped corner.
        let mut tris = [[[0usize; 3]; 2]; 2];
        for (i, ring) in face_idx.iter().enumerate() {
            let start = ring
                .iter()
                .position(|&v| v == corner_idx[i])
                .expect("diagonal corner not on its face");
            for j in 0..3 {
                tris[i][0][j] = ring[(start + j) % 4];
            }
            tris[i][1] = [ring[start], ring[(start + 2) % 4], ring[(start + 3) % 4]];
        }

        self.add_triangular_prism(tris[0][0], tris[1][0], rec_idx);
        self.add_triangular_prism(tris[0][1], tris[1][1], rec_idx);
    }

    fn diagonal_corners(
        &self,
        cell: &GridCell,
        face: FaceNumber,
        corner0: CellVertPos,
    ) -> (CellVertPos, CellVertPos) {
        // The other diagonal corner on the same face.
        let ring = hexspring_grid::tables::FACE_CORNERS[face.index()];
        let start = ring.iter().position(|&p| p == corner0).unwrap_or(0);
        (corner0, ring[(start + 2) % 4])
    }

    /// Dice one triangular prism into six cuboids: per end, the
    /// centroid and edge midpoints make three quads; each quad pair is
    /// extruded with an axial mid-layer into two cells.
    fn add_triangular_prism(&mut self, tri0: [usize; 3], tri1: [usize; 3], rec_idx: usize) {
        let tri_idx = [tri0, tri1];
        let mut edge_ctr_idx = [[0usize; 3]; 2];
        let mut ctr_idx = [0usize; 2];

        for (end, tri) in tri_idx.iter().enumerate() {
            let pts = [
                *self.grid.vert(tri[0]).pt(),
                *self.grid.vert(tri[1]).pt(),
                *self.grid.vert(tri[2]).pt(),
            ];
            for i in 0..3 {
                let mid = (pts[i] + pts[(i + 1) % 3]) / 2.0;
                edge_ctr_idx[end][i] = self.grid.add_vert(&mid);
            }
            let ctr = hexspring_math::triangle_centroid(&pts);
            ctr_idx[end] = self.grid.add_vert(&ctr);
        }

        let mut quads = [[[0usize; 4]; 3]; 2];
        for end in 0..2 {
            quads[end][0] = [
                tri_idx[end][0],
                edge_ctr_idx[end][0],
                ctr_idx[end],
                edge_ctr_idx[end][2],
            ];
            quads[end][1] = [
                edge_ctr_idx[end][0],
                tri_idx[end][1],
                edge_ctr_idx[end][1],
                ctr_idx[end],
            ];
            quads[end][2] = [
                ctr_idx[end],
                edge_ctr_idx[end][1],
                tri_idx[end][2],
                edge_ctr_idx[end][2],
            ];
        }
        for i in 0..3 {
            self.add_quad_prism(quads[0][i], quads[1][i], rec_idx);
        }
    }

    fn add_quad_prism(&mut self, front: [usize; 4], back: [usize; 4], rec_idx: usize) {
        let mut mid = [0usize; 4];
        for i in 0..4 {
            let front_pt = *self.grid.vert(front[i]).pt();
            let back_pt = *self.grid.vert(back[i]).pt();
            mid[i] = self.grid.add_vert(&((front_pt + back_pt) * 0.5));
        }
        self.add_quad(front, mid, rec_idx);
        self.add_quad(mid, back, rec_idx);
    }

    fn add_quad(&mut self, front: [usize; 4], back: [usize; 4], rec_idx: usize) {
        let mut cell = GridCell::new();
        cell.set_vert_idx(LwrFntLft, front[0]);
        cell.set_vert_idx(LwrFntRgt, front[1]);
        cell.set_vert_idx(UprFntRgt, front[2]);
        cell.set_vert_idx(UprFntLft, front[3]);

        cell.set_vert_idx(LwrBckLft, back[0]);
        cell.set_vert_idx(LwrBckRgt, back[1]);
        cell.set_vert_idx(UprBckRgt, back[2]);
        cell.set_vert_idx(UprBckLft, back[3]);

        cell.default_rest_edge_lengths(self.grid);
        self.add_cell_to_record(cell, rec_idx);
    }

    // ---- clamp inheritance -------------------------------------------

    fn build_edge_set(&mut self) {
        self.final_edges.clear();
        for cell_id in self.grid.live_cell_ids() {
            let cell = self.grid.cell(cell_id);
            for i in 0..12 {
                self.final_edges.insert(cell.edge(i));
            }
        }
    }

    fn is_clamped(&self, vert_idx: usize) -> bool {
        !matches!(self.grid.vert(vert_idx).clamp(), Clamp::None)
    }

    fn needs_clamp(&self, vert_idx: usize) -> bool {
        self.grid.dof_metric(vert_idx, self.grid) > NEEDS_CLAMP_METRIC
    }

    /// The inheritable clamp of a boundary edge: both endpoints
    /// Parallel/Fixed, with a Parallel direction along the edge.
    fn edge_boundary_clamp(&self, edge: &GridEdge) -> Option<Clamp> {
        let clamp0 = self.grid.vert(edge.vert(0)).clamp();
        let clamp1 = self.grid.vert(edge.vert(1)).clamp();
        if !clamp0.matches(mask::PARALLEL | mask::FIXED)
            || !clamp1.matches(mask::PARALLEL | mask::FIXED)
        {
            return None;
        }
        let edge_dir = edge.dir(self.grid);
        for clamp in [clamp0, clamp1] {
            if let Clamp::Parallel(dir) = clamp {
                if (1.0 - dir.dot(&edge_dir).abs()) < 1.0e-6 {
                    return Some(clamp.clone());
                }
            }
        }
        None
    }

    /// Inheritance step 1: new vertices lying on a boundary edge of
    /// the deleted source cell pick up its Parallel clamp.
    fn clamp_to_edge_boundaries(&mut self, rec_idx: usize) {
        let src_cell = self.records[rec_idx].cell.clone();
        let mut verts = std::mem::take(&mut self.records[rec_idx].verts);

        for i in 0..12 {
            let edge = src_cell.edge(i);
            let Some(clamp) = self.edge_boundary_clamp(&edge) else {
                continue;
            };
            let candidates: Vec<usize> = verts.iter().copied().collect();
            for vert_idx in candidates {
                if self.is_clamped(vert_idx) {
                    continue;
                }
                let (d, t) = edge.dist_to_point(self.grid, self.grid.vert(vert_idx).pt());
                if d < SAME_DIST_TOL && (0.0..1.0).contains(&t) {
                    self.grid.vert_mut(vert_idx).set_clamp(clamp.clone());
                    self.clamped_verts.push(vert_idx);
                    verts.remove(&vert_idx);
                    break;
                }
            }
        }
        self.records[rec_idx].verts = verts;
    }

    /// Inheritance step 2: new vertices on a perpendicular-boundary
    /// face plane of the source cell pick up its Perpendicular clamp,
    /// unless they sit exactly on a grid-edge midpoint, which wins.
    fn clamp_to_face_boundaries(&mut self, rec_idx: usize) {
        let src_cell = self.records[rec_idx].cell.clone();
        let mut verts = std::mem::take(&mut self.records[rec_idx].verts);

        for face in FaceNumber::ALL {
            let Some(clamp) = src_cell.perpendicular_boundary_clamp(self.grid, face) else {
                continue;
            };
            let tri = src_cell.face_tri_points(face, self.grid)[0];
            let face_plane = Plane::from_triangle(&tri);

            let candidates: Vec<usize> = verts.iter().copied().collect();
            for vert_idx in candidates {
                if self.is_clamped(vert_idx) {
                    continue;
                }
                let dist = face_plane.distance(self.grid.vert(vert_idx).pt());
                if dist < SAME_DIST_TOL {
                    if self.clamp_vert_to_edge_midpoints(vert_idx) {
                        verts.remove(&vert_idx);
                    } else {
                        self.grid.vert_mut(vert_idx).set_clamp(clamp.clone());
                        self.clamped_verts.push(vert_idx);
                        verts.remove(&vert_idx);
                    }
                }
            }
        }
        self.records[rec_idx].verts = verts;
    }

    /// Snap a vertex onto the first grid-edge midpoint within
    /// tolerance, clamping it there.
    fn clamp_vert_to_edge_midpoints(&mut self, vert_idx: usize) -> bool {
        let edges: Vec<GridEdge> = self.final_edges.iter().copied().collect();
        for edge in edges {
            let mid = edge.center(self.grid);
            let d_sqr = (self.grid.vert(vert_idx).pt() - mid).norm_squared();
            if d_sqr < SAME_DIST_TOL_SQR {
                self.moved_points.insert(vert_idx, mid);
                self.grid
                    .vert_mut(vert_idx)
                    .set_clamp(Clamp::CellEdgeCenter(edge));
                self.clamped_verts.push(vert_idx);
                return true;
            }
        }
        false
    }

    /// Inheritance step 5: the midpoint of a source edge whose
    /// endpoints were clamped to the same polyline is re-clamped to
    /// that polyline.
    fn apply_octree_clamps(&mut self, rec_idx: usize) {
        let src_cell = self.records[rec_idx].cell.clone();
        for i in 0..12 {
            let edge = src_cell.edge(i);
            let ctr = edge.center(self.grid);
            let Some(vert_idx) = self.find_record_vert(rec_idx, &ctr) else {
                continue;
            };
            if let Some((model, polyline)) = self.clamped_to_same_polyline(edge.vert(0), edge.vert(1))
            {
                self.clamp_vert_to_polyline(vert_idx, model, polyline);
            }
        }
    }

    /// Inheritance step 6, prism form: the midpoint of the clamped
    /// diagonal inherits the polyline clamp.
    fn apply_prism_clamps(&mut self, rec_idx: usize) {
        let src_cell = self.records[rec_idx].cell.clone();
        let Some((corner0, corner1)) = self.records[rec_idx].corners else {
            return;
        };
        let vert0 = src_cell.vert_idx(corner0);
        let vert1 = src_cell.vert_idx(corner1);
        let Some((model, polyline)) = self.clamped_to_same_polyline(vert0, vert1) else {
            return;
        };
        let mid = (self.grid.vert(vert0).pt() + self.grid.vert(vert1).pt()) * 0.5;
        match self.find_record_vert(rec_idx, &mid) {
            Some(vert_idx) => {
                self.clamp_vert_to_polyline(vert_idx, model, polyline);
            }
            None => log::warn!("prism split: no vertex at the diagonal midpoint"),
        }
    }

    fn find_record_vert(&self, rec_idx: usize, pt: &Vec3) -> Option<usize> {
        self.records[rec_idx]
            .verts
            .iter()
            .copied()
            .find(|&v| hexspring_math::tolerant_eq_pt(self.grid.vert(v).pt(), pt))
    }

    /// The (model, polyline) both endpoints are effectively clamped
    /// to, when at least one is an edge clamp and the other is an
    /// edge, vertex, or fixed clamp.
    fn clamped_to_same_polyline(&self, vert0: usize, vert1: usize) -> Option<(usize, usize)> {
        let clamp0 = self.grid.vert(vert0).clamp();
        let clamp1 = self.grid.vert(vert1).clamp();

        if !clamp0.matches(mask::EDGE) && !clamp1.matches(mask::EDGE) {
            return None;
        }
        let hard = mask::EDGE | mask::VERT | mask::FIXED;
        if !clamp0.matches(hard) || !clamp1.matches(hard) {
            return None;
        }

        let edge_ref = |clamp: &Clamp| match clamp {
            Clamp::Edge {
                model, polyline, ..
            } => Some((*model, *polyline)),
            _ => None,
        };

        if clamp0.matches(mask::FIXED | mask::VERT) {
            edge_ref(clamp1)
        } else if clamp1.matches(mask::FIXED | mask::VERT) {
            edge_ref(clamp0)
        } else {
            let (m0, p0) = edge_ref(clamp0)?;
            let (m1, p1) = edge_ref(clamp1)?;
            (m0 == m1 && p0 == p1).then_some((m0, p0))
        }
    }

    /// Clamp a vertex onto a polyline: buffered move to the closest
    /// point, edge clamp to the closest segment.
    fn clamp_vert_to_polyline(&mut self, vert_idx: usize, model: usize, polyline: usize) -> bool {
        if self.is_clamped(vert_idx) {
            return false;
        }
        let m = &self.models[model];
        let pl = &m.polylines[polyline];
        let pt = self.grid.vert(vert_idx).pt();
        let Some(cp) = pl.closest_point(&m.surface, pt) else {
            return false;
        };
        let seg = pl.segment(&m.surface, cp.seg_idx);
        let best_pt = seg.interpolate(cp.t.clamp(0.0, 1.0));

        self.moved_points.insert(vert_idx, best_pt);
        self.grid.vert_mut(vert_idx).set_clamp(Clamp::Edge {
            model,
            polyline,
            segment: cp.seg_idx,
        });
        self.clamped_verts.push(vert_idx);
        true
    }

    /// Inheritance step 3: a new vertex coinciding with the midpoint
    /// of a neighbouring cell's edge becomes a CellEdgeCenter there.
    fn clamp_to_adjacent_cell_edges(&mut self, rec_idx: usize) {
        let src_cell = self.records[rec_idx].cell.clone();

        // Neighbour edges spanned by two source-cell corners. Several
        // cells may share one; the last found wins.
        let mut edge_to_cell: BTreeMap<GridEdge, usize> = BTreeMap::new();
        for pos in CellVertPos::ALL {
            let vert_idx = src_cell.vert_idx(pos);
            for &cell_id in self.grid.vert(vert_idx).cell_indices() {
                let adj_cell = self.grid.cell(cell_id);
                for i in 0..12 {
                    let edge = adj_cell.edge(i);
                    if src_cell.verts_pos(edge.vert(0)).is_some()
                        && src_cell.verts_pos(edge.vert(1)).is_some()
                    {
                        edge_to_cell.insert(edge, cell_id);
                    }
                }
            }
        }

        let mut verts = std::mem::take(&mut self.records[rec_idx].verts);
        for (edge, _cell_id) in edge_to_cell {
            let mid = edge.center(self.grid);
            let candidates: Vec<usize> = verts.iter().copied().collect();
            for vert_idx in candidates {
                if !self.needs_clamp(vert_idx) {
                    verts.remove(&vert_idx);
                    continue;
                }
                let d_sqr = (self.grid.vert(vert_idx).pt() - mid).norm_squared();
                if d_sqr < SAME_DIST_TOL_SQR {
                    self.grid
                        .vert_mut(vert_idx)
                        .set_clamp(Clamp::CellEdgeCenter(edge));
                    self.clamped_verts.push(vert_idx);
                    verts.remove(&vert_idx);
                }
            }
        }
        self.records[rec_idx].verts = verts;
    }

    /// Inheritance step 4: match a neighbour face with the same
    /// unordered corner set; candidates clamp to its centroid or its
    /// triangle planes, nearest first, with a quarter-edge fallback
    /// when nothing is in tolerance.
    fn clamp_to_adjacent_cell_face(&mut self, rec_idx: usize, face_num: FaceNumber) {
        let src_cell = self.records[rec_idx].cell.clone();
        let src_face_idx = src_cell.face_indices(face_num);

        let mut match_face: Option<GridFace> = None;
        'search: for pos in CellVertPos::ALL {
            let vert_idx = src_cell.vert_idx(pos);
            for &cell_id in self.grid.vert(vert_idx).cell_indices() {
                let adj_cell = self.grid.cell(cell_id);
                for fnum in FaceNumber::ALL {
                    if GridFace::same_verts(&src_face_idx, &adj_cell.face_indices(fnum)) {
                        match_face = Some(GridFace::new(cell_id, fnum));
                        break 'search;
                    }
                }
            }
        }
        let Some(match_face) = match_face else {
            return;
        };

        let face_mid = match_face.centroid(self.grid, self.grid);
        let face_idx = match_face.vert_indices(self.grid);
        // Both diagonal triangulations of the matched face.
        let tris = [
            [face_idx[0], face_idx[1], face_idx[2]],
            [face_idx[0], face_idx[2], face_idx[3]],
            [face_idx[1], face_idx[2], face_idx[3]],
            [face_idx[1], face_idx[3], face_idx[0]],
        ];

        let mut verts = std::mem::take(&mut self.records[rec_idx].verts);
        let mut matches: Vec<(f64, usize, Clamp)> = Vec::new();
        let candidates: Vec<usize> = verts.iter().copied().collect();
        for vert_idx in candidates {
            if !self.needs_clamp(vert_idx) {
                verts.remove(&vert_idx);
                continue;
            }
            let pt = *self.grid.vert(vert_idx).pt();
            matches.push((
                (pt - face_mid).norm_squared(),
                vert_idx,
                Clamp::CellFaceCenter(match_face),
            ));

            for tri in &tris {
                let pts = [
                    *self.grid.vert(tri[0]).pt(),
                    *self.grid.vert(tri[1]).pt(),
                    *self.grid.vert(tri[2]).pt(),
                ];
                let ctr = hexspring_math::triangle_centroid(&pts);
                let normal = hexspring_math::triangle_normal(&pts);
                let v = pt - ctr;
                if v.dot(&normal).abs() < SAME_DIST_TOL {
                    matches.push((v.norm_squared(), vert_idx, Clamp::TriPlane(*tri)));
                }
            }
        }

        matches.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut i = 0;
        let mut count = 0;
        // Every in-tolerance bucket clamps; later entries of an equal
        // bucket overwrite earlier ones, preferring triangle planes
        // over the face centroid.
        while i < matches.len() && matches[i].0 < SAME_DIST_TOL_SQR {
            let key = matches[i].0;
            while i < matches.len() && matches[i].0 == key {
                let (_, vert_idx, clamp) = &matches[i];
                self.grid.vert_mut(*vert_idx).set_clamp(clamp.clone());
                self.clamped_verts.push(*vert_idx);
                verts.remove(vert_idx);
                count += 1;
                i += 1;
            }
        }

        // No in-tolerance match left: the nearest candidate is as
        // clamped as it can be, if it is within a quarter edge (or the
        // exact triangle pair already landed).
        if i < matches.len() {
            let key = matches[i].0;
            let dist = key.sqrt();
            while i < matches.len() && matches[i].0 == key {
                let (_, vert_idx, clamp) = &matches[i];
                let max_move = 0.25 * self.grid.min_adj_edge_length(*vert_idx, self.grid);
                if count == 2 || dist < max_move {
                    self.grid.vert_mut(*vert_idx).set_clamp(clamp.clone());
                    self.clamped_verts.push(*vert_idx);
                    verts.remove(vert_idx);
                    break;
                }
                i += 1;
            }
        }

        self.records[rec_idx].verts = verts;
    }

    /// After the splits, CellEdgeCenter clamps whose edge no longer
    /// belongs to any live cell are downgraded and re-evaluated
    /// against the grid boundary.
    fn fix_broken_links(&mut self) {
        for vert_idx in 0..self.grid.num_verts() {
            let Clamp::CellEdgeCenter(edge) = self.grid.vert(vert_idx).clamp().clone() else {
                continue;
            };
            if self.final_edges.contains(&edge) {
                continue;
            }
            self.grid.vert_mut(vert_idx).set_clamp(Clamp::None);
            self.clamp_vert_to_grid_boundary(vert_idx);
        }
    }

    /// Re-derive a boundary clamp for an orphaned vertex from its
    /// neighbours: two collinear Parallel/Fixed edge-neighbours give a
    /// Parallel clamp, otherwise any neighbouring Perpendicular clamp
    /// is copied.
    fn clamp_vert_to_grid_boundary(&mut self, vert_idx: usize) -> bool {
        if self.is_clamped(vert_idx) {
            return false;
        }
        let Some((edge_adj, corner_adj)) = self.adjacent_verts(vert_idx) else {
            return false;
        };

        let boundary_adj: Vec<usize> = edge_adj
            .iter()
            .copied()
            .filter(|&v| self.grid.vert(v).clamp().matches(mask::PARALLEL | mask::FIXED))
            .collect();
        if boundary_adj.len() == 2 {
            let pt = *self.grid.vert(vert_idx).pt();
            let v0 = self.grid.vert(boundary_adj[0]).pt() - pt;
            let v1 = self.grid.vert(boundary_adj[1]).pt() - pt;
            if let (Some(d0), Some(d1)) = (
                hexspring_math::safe_normalize(&v0),
                hexspring_math::safe_normalize(&v1),
            ) {
                if d0.dot(&d1).abs() > 0.7071 {
                    self.grid.vert_mut(vert_idx).set_clamp(Clamp::Parallel(d0));
                    self.clamped_verts.push(vert_idx);
                    return true;
                }
            }
        }

        for pool in [&edge_adj, &corner_adj] {
            for &adj in pool {
                if let Clamp::Perpendicular(_) = self.grid.vert(adj).clamp() {
                    let clamp = self.grid.vert(adj).clamp().clone();
                    self.grid.vert_mut(vert_idx).set_clamp(clamp);
                    self.clamped_verts.push(vert_idx);
                    return true;
                }
            }
        }
        false
    }

    /// Split a vertex's face-ring neighbours into edge-adjacent and
    /// corner-adjacent sets.
    fn adjacent_verts(&self, vert_idx: usize) -> Option<(BTreeSet<usize>, BTreeSet<usize>)> {
        let faces = self.grid.vert_faces(vert_idx, false);
        if faces.is_empty() {
            return None;
        }
        let mut edge_adj = BTreeSet::new();
        let mut corner_adj = BTreeSet::new();
        for face in &faces {
            let fv = face.vert_indices(self.grid);
            for j in 0..4 {
                if fv[j] == vert_idx {
                    continue;
                }
                if fv[(j + 3) % 4] == vert_idx || fv[(j + 1) % 4] == vert_idx {
                    edge_adj.insert(fv[j]);
                } else {
                    corner_adj.insert(fv[j]);
                }
            }
        }
        Some((edge_adj, corner_adj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexspring_math::BoundingBox;

    fn lattice(n: f64) -> Grid {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(n, n, n)),
            1.0,
        );
        grid
    }

    #[test]
    fn test_octree_split_single_cell() {
        let mut grid = lattice(1.0);
        let mut splitter = Splitter::new(&mut grid, &[]);
        splitter.split_all();
        assert_eq!(splitter.new_cells().len(), 8);

        assert_eq!(grid.num_live_cells(), 8);
        assert_eq!(grid.num_verts(), 27);
        assert!(grid.verify(&[]));
        // Rest lengths halve.
        for cell_id in grid.live_cell_ids() {
            for i in 0..12 {
                assert!((grid.cell(cell_id).rest_edge_length(i) - 0.5).abs() < 1e-12);
            }
        }
        // Source cell id 0 is gone; children got fresh ids.
        assert!(!grid.cell_exists(0));
    }

    #[test]
    fn test_second_split_all_doubles_each_axis() {
        let mut grid = lattice(1.0);
        Splitter::new(&mut grid, &[]).split_all();
        Splitter::new(&mut grid, &[]).split_all();
        assert_eq!(grid.num_live_cells(), 64);
        assert_eq!(grid.num_verts(), 125);
        assert!(grid.verify(&[]));
    }

    #[test]
    fn test_split_preserves_boundary_clamps_on_new_verts() {
        let mut grid = lattice(1.0);
        // Clamp the source cell like the driver would: corners fixed.
        for vert_idx in 0..8 {
            grid.vert_mut(vert_idx).set_clamp(Clamp::Fixed);
        }
        let mut splitter = Splitter::new(&mut grid, &[]);
        splitter.split_all();

        // The 8 original corners stay Fixed.
        for vert_idx in 0..8 {
            assert_eq!(grid.vert(vert_idx).clamp(), &Clamp::Fixed);
        }
        assert!(grid.verify(&[]));
    }

    #[test]
    fn test_octree_split_volume_conserved() {
        let mut grid = lattice(2.0);
        let total_before: f64 = grid
            .live_cell_ids()
            .iter()
            .map(|&id| grid.cell(id).volume(&grid))
            .sum();
        Splitter::new(&mut grid, &[]).split_all();
        let total_after: f64 = grid
            .live_cell_ids()
            .iter()
            .map(|&id| grid.cell(id).volume(&grid))
            .sum();
        assert!((total_before - total_after).abs() < 1e-9);
    }

    #[test]
    fn test_parallel_boundary_edge_inherited() {
        let mut grid = lattice(1.0);
        // Mark the bottom-front edge as a boundary: both corner verts
        // Parallel along X.
        let v0 = 0; // (0,0,0)
        let (v1, _) = (1..8)
            .map(|i| (i, *grid.vert(i).pt()))
            .find(|(_, p)| (p - Vec3::new(1.0, 0.0, 0.0)).norm() < 1e-9)
            .unwrap();
        grid.vert_mut(v0).set_clamp(Clamp::Parallel(Vec3::new(1.0, 0.0, 0.0)));
        grid.vert_mut(v1).set_clamp(Clamp::Parallel(Vec3::new(1.0, 0.0, 0.0)));

        let mut splitter = Splitter::new(&mut grid, &[]);
        splitter.split_all();

        // The new midpoint of that edge inherits the Parallel clamp.
        let mid = (0..grid.num_verts())
            .find(|&i| (grid.vert(i).pt() - Vec3::new(0.5, 0.0, 0.0)).norm() < 1e-9)
            .unwrap();
        assert!(
            matches!(grid.vert(mid).clamp(), Clamp::Parallel(_)),
            "midpoint got {:?}",
            grid.vert(mid).clamp()
        );
    }
}
