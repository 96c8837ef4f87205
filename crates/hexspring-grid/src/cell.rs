//! Hexahedral cells.

use std::collections::BTreeMap;
use std::io::Write;

use hexspring_math::{
    triangle_normal, volume_under_triangle, BoundingBox, LineSegment, Plane, Vec3, FILE_PRECISION,
    SAME_DIST_TOL,
};
use hexspring_surface::{Result, SurfaceError, TokenReader};

use crate::clamp::{mask, Clamp};
use crate::edge::GridEdge;
use crate::face::{GridFace, SearchableFace};
use crate::grid::Grid;
use crate::state::Positions;
use crate::tables::{
    adjacent_edge_ends, CellVertPos, FaceNumber, VertEdgeDir, EDGE_END, EDGE_VERTS, FACE_CORNERS,
    FACE_INWARD_DIR,
};
use crate::INVALID_INDEX;

/// Rest-length stretch applied when dicing prisms into cuboids; a
/// design parameter, not a derived quantity.
pub const PRISM_REST_STRETCH: f64 = 1.125;

/// Edge numbers grouped by lattice axis; each group's members are
/// geometrically parallel in an undeformed cell.
const EDGE_GROUPS: [[usize; 4]; 3] = [
    [0, 2, 4, 6],   // X (left-right)
    [8, 9, 10, 11], // Y (front-back)
    [1, 3, 5, 7],   // Z (bottom-top)
];

/// An eight-cornered cell with per-edge rest lengths.
#[derive(Debug, Clone)]
pub struct GridCell {
    id: usize,
    vert_indices: [usize; 8],
    rest_edge_len: [f64; 12],
}

impl Default for GridCell {
    fn default() -> Self {
        Self::new()
    }
}

impl GridCell {
    /// An unattached cell with no corners set.
    pub fn new() -> Self {
        Self {
            id: INVALID_INDEX,
            vert_indices: [INVALID_INDEX; 8],
            rest_edge_len: [-1.0; 12],
        }
    }

    /// The cell's stable logical id.
    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    /// Corner vertex index at a lattice position.
    pub fn vert_idx(&self, pos: CellVertPos) -> usize {
        self.vert_indices[pos.index()]
    }

    /// Set a corner vertex index.
    pub fn set_vert_idx(&mut self, pos: CellVertPos, vert_idx: usize) {
        self.vert_indices[pos.index()] = vert_idx;
    }

    /// The lattice position of a vertex index in this cell.
    pub fn verts_pos(&self, vert_idx: usize) -> Option<CellVertPos> {
        CellVertPos::ALL
            .into_iter()
            .find(|p| self.vert_indices[p.index()] == vert_idx)
    }

    /// Rest length of logical edge `i`.
    pub fn rest_edge_length(&self, i: usize) -> f64 {
        self.rest_edge_len[i]
    }

    /// Set the rest length of logical edge `i`.
    pub fn set_rest_edge_length(&mut self, i: usize, len: f64) {
        self.rest_edge_len[i] = len;
    }

    /// Logical edge `i` as a grid edge.
    pub fn edge(&self, i: usize) -> GridEdge {
        let (a, b) = EDGE_VERTS[i];
        GridEdge::new(self.vert_idx(a), self.vert_idx(b))
    }

    /// The corner reached from `pos` along `dir`, if any.
    pub fn edge_end_vert_idx(&self, pos: CellVertPos, dir: VertEdgeDir) -> Option<usize> {
        EDGE_END[pos.index()][dir.index()].map(|p| self.vert_idx(p))
    }

    /// The corner on the opposite side of `face` reached by the axial
    /// edge from `corner`.
    pub fn opposite_edge_end_vert_idx(&self, face: FaceNumber, corner: CellVertPos) -> Option<usize> {
        self.edge_end_vert_idx(corner, FACE_INWARD_DIR[face.index()])
    }

    /// Vertex indices of the three edge neighbours of `pos`.
    pub fn adjacent_edge_vert_indices(&self, pos: CellVertPos) -> [usize; 3] {
        adjacent_edge_ends(pos).map(|p| self.vert_idx(p))
    }

    /// Corner indices of `face`, wound outward.
    pub fn face_indices(&self, face: FaceNumber) -> [usize; 4] {
        FACE_CORNERS[face.index()].map(|p| self.vert_idx(p))
    }

    /// The two triangles covering `face` (0-2 diagonal split).
    pub fn face_tri_indices(&self, face: FaceNumber) -> [[usize; 3]; 2] {
        let v = self.face_indices(face);
        [[v[0], v[1], v[2]], [v[0], v[2], v[3]]]
    }

    /// Corner positions of `face`.
    pub fn face_points<P: Positions + ?Sized>(&self, face: FaceNumber, pos: &P) -> [Vec3; 4] {
        self.face_indices(face).map(|i| pos.pt(i))
    }

    /// The two face triangles as point triples.
    pub fn face_tri_points<P: Positions + ?Sized>(&self, face: FaceNumber, pos: &P) -> [[Vec3; 3]; 2] {
        self.face_tri_indices(face)
            .map(|tri| tri.map(|i| pos.pt(i)))
    }

    /// This cell's `face` keyed for cross-cell matching.
    pub fn searchable_face(&self, face: FaceNumber) -> SearchableFace {
        SearchableFace::new(GridFace::new(self.id, face), self.face_indices(face))
    }

    /// Signed volume: the sum over the 12 face triangles of the volume
    /// under each along +Z. Positive for outward-wound, untangled
    /// cells.
    pub fn volume<P: Positions + ?Sized>(&self, pos: &P) -> f64 {
        let mut vol = 0.0;
        for face in FaceNumber::ALL {
            for tri in self.face_tri_points(face, pos) {
                vol += volume_under_triangle(&tri);
            }
        }
        vol
    }

    /// Mean of the eight corners.
    pub fn centroid<P: Positions + ?Sized>(&self, pos: &P) -> Vec3 {
        self.vert_indices.iter().map(|&i| pos.pt(i)).sum::<Vec3>() / 8.0
    }

    /// Mean of a face's four corners.
    pub fn face_centroid<P: Positions + ?Sized>(&self, face: FaceNumber, pos: &P) -> Vec3 {
        self.face_indices(face)
            .iter()
            .map(|&i| pos.pt(i))
            .sum::<Vec3>()
            / 4.0
    }

    /// Bounding box over the corners.
    pub fn bbox<P: Positions + ?Sized>(&self, pos: &P) -> BoundingBox {
        let mut bb = BoundingBox::empty();
        for &i in &self.vert_indices {
            bb.merge_point(&pos.pt(i));
        }
        bb
    }

    /// Insert the 12 edge lengths into `lengths`.
    pub fn edge_lengths<P: Positions + ?Sized>(
        &self,
        pos: &P,
        lengths: &mut BTreeMap<GridEdge, f64>,
    ) {
        for i in 0..12 {
            let edge = self.edge(i);
            lengths.insert(edge, edge.length(pos));
        }
    }

    /// True when `pt` is on the inner side of all 12 face triangles.
    pub fn contains_point<P: Positions + ?Sized>(&self, pos: &P, pt: &Vec3) -> bool {
        for face in FaceNumber::ALL {
            for tri in self.face_tri_points(face, pos) {
                let normal = triangle_normal(&tri);
                if (pt - tri[0]).dot(&normal) > SAME_DIST_TOL {
                    return false;
                }
            }
        }
        true
    }

    /// The corner closest to a segment, with its distance.
    pub fn closest_corner_to_segment<P: Positions + ?Sized>(
        &self,
        pos: &P,
        seg: &LineSegment,
    ) -> (CellVertPos, f64) {
        let mut best = (CellVertPos::LwrFntLft, f64::MAX);
        for p in CellVertPos::ALL {
            let d = seg.approach(&pos.pt(self.vert_idx(p))).dist;
            if d < best.1 {
                best = (p, d);
                if d < SAME_DIST_TOL {
                    break;
                }
            }
        }
        best
    }

    /// Minimum distance from `pt` to the planes of `face` under both
    /// diagonal triangulations.
    pub fn dist_to_face<P: Positions + ?Sized>(&self, face: FaceNumber, pos: &P, pt: &Vec3) -> f64 {
        let p = self.face_points(face, pos);
        let tris = [
            [p[0], p[1], p[2]],
            [p[0], p[2], p[3]],
            [p[1], p[2], p[3]],
            [p[1], p[2], p[0]],
        ];
        let mut min_dist = f64::MAX;
        for tri in &tris {
            let d = Plane::from_triangle(tri).distance(pt);
            if d < SAME_DIST_TOL {
                return d;
            }
            min_dist = min_dist.min(d);
        }
        min_dist
    }

    /// Count corners whose clamp matches `clamp_mask`.
    pub fn num_clamped(&self, grid: &Grid, clamp_mask: u32) -> usize {
        self.vert_indices
            .iter()
            .filter(|&&v| grid.vert(v).clamp().matches(clamp_mask))
            .count()
    }

    /// A face is a perpendicular boundary when a corner carries a
    /// `Perpendicular` clamp whose normal is parallel to the face
    /// normal, or two corners carry `Parallel` clamps whose cross
    /// product is. Returns the clamp new face-plane vertices inherit.
    pub fn perpendicular_boundary_clamp(&self, grid: &Grid, face: FaceNumber) -> Option<Clamp> {
        let pts = self.face_points(face, grid);
        let normal = hexspring_math::safe_normalize(&(pts[1] - pts[0]).cross(&(pts[3] - pts[0])))?;

        let mut parallels: Vec<Vec3> = Vec::new();
        for &vert_idx in &self.face_indices(face) {
            let clamp = grid.vert(vert_idx).clamp();
            match clamp {
                Clamp::Perpendicular(v) => {
                    if (1.0 - normal.dot(v).abs()) < 1.0e-6 {
                        return Some(clamp.clone());
                    }
                }
                Clamp::Parallel(v) => parallels.push(*v),
                _ => {}
            }
        }
        if parallels.len() == 2 {
            let perp = hexspring_math::safe_normalize(&parallels[0].cross(&parallels[1]))?;
            if (1.0 - normal.dot(&perp).abs()) < SAME_DIST_TOL {
                return Some(Clamp::Perpendicular(perp));
            }
        }
        None
    }

    /// Set rest edge lengths from current geometry: each parallel
    /// 4-edge group takes `PRISM_REST_STRETCH` times its shortest
    /// member.
    pub fn default_rest_edge_lengths<P: Positions + ?Sized>(&mut self, pos: &P) {
        for group in EDGE_GROUPS {
            let mut min_len = f64::MAX;
            for &i in &group {
                min_len = min_len.min(self.edge(i).length(pos));
            }
            for &i in &group {
                self.rest_edge_len[i] = PRISM_REST_STRETCH * min_len;
            }
        }
    }

    /// Structural checks: valid distinct corners, positive rest
    /// lengths, positive volume.
    pub fn verify(&self, grid: &Grid, verify_verts: bool) -> bool {
        for (n, &v) in self.vert_indices.iter().enumerate() {
            if !grid.vert_exists(v) {
                log::warn!("cell {}: corner {n} refers to missing vertex {v}", self.id);
                return false;
            }
            if self.vert_indices[..n].contains(&v) {
                log::warn!("cell {}: corner {n} duplicates vertex {v}", self.id);
                return false;
            }
        }

        for i in 0..12 {
            if self.rest_edge_len[i] < 1.0e-9 {
                log::warn!("cell {}: rest edge length {i} not set", self.id);
                return false;
            }
        }

        let vol = self.volume(grid);
        if vol <= SAME_DIST_TOL * SAME_DIST_TOL * SAME_DIST_TOL {
            log::warn!("cell {}: bad volume {vol}", self.id);
            return false;
        }

        if verify_verts {
            for &v in &self.vert_indices {
                if !grid.vert(v).linked_to_cell(self.id) {
                    log::warn!("cell {}: vertex {v} missing back-link", self.id);
                    return false;
                }
            }
        }
        true
    }

    /// Write the `ID:` record.
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "ID: {}", self.id)?;
        for len in &self.rest_edge_len {
            assert!(*len > 1.0e-6, "bad cell rest edge length on save");
        }
        write!(out, "REL:")?;
        for len in &self.rest_edge_len {
            write!(out, " {:.prec$}", len, prec = FILE_PRECISION)?;
        }
        writeln!(out)?;
        write!(out, "VI:")?;
        for v in &self.vert_indices {
            write!(out, " {v}")?;
        }
        writeln!(out)
    }

    /// Read an `ID:` record.
    pub fn read(tokens: &mut TokenReader<'_>) -> Result<Self> {
        tokens.expect("ID:")?;
        let id: usize = tokens.parse()?;
        tokens.expect("REL:")?;
        let mut cell = Self::new();
        cell.id = id;
        for i in 0..12 {
            cell.rest_edge_len[i] = tokens.parse()?;
        }
        tokens.expect("VI:")?;
        for i in 0..8 {
            cell.vert_indices[i] = tokens.parse()?;
        }
        if cell.rest_edge_len.iter().any(|&l| l <= 0.0) {
            return Err(SurfaceError::Stream(format!(
                "cell {id} has a non-positive rest edge length"
            )));
        }
        Ok(cell)
    }

    /// Count by mask over an explicit clamp accessor; used by callers
    /// holding forked relaxation state.
    pub fn num_clamped_by<F: Fn(usize) -> u32>(&self, clamp_mask_of: F, clamp_mask: u32) -> usize {
        self.vert_indices
            .iter()
            .filter(|&&v| clamp_mask_of(v) & clamp_mask != 0)
            .count()
    }

    /// True when any corner's clamp matches `clamp_mask`.
    pub fn any_clamped(&self, grid: &Grid, clamp_mask: u32) -> bool {
        self.num_clamped(grid, clamp_mask) > 0
    }

    /// Count corners clamped onto surface features (edge or vertex
    /// clamps), the predicate both the fitter and splitter gate on.
    pub fn num_feature_clamped(&self, grid: &Grid) -> usize {
        self.num_clamped(grid, mask::EDGE) + self.num_clamped(grid, mask::VERT)
    }
}
