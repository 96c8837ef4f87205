//! Polyline fitting: walk a sharp ridge through the grid, snapping one
//! grid corner per step onto the ridge.
//!
//! From the grid vertex nearest the polyline's first point, each step
//! intersects the polyline against the faces of the cells around the
//! current corner, picks the face-hit/corner pair with the lowest bend
//! energy at the hit point, moves that corner onto the hit, and clamps
//! it to the polyline. Cells touched along the way are handed back to
//! the driver for splitting.

use std::collections::{BTreeMap, BTreeSet};

use hexspring_grid::{energy, CellVertPos, Clamp, FaceNumber, Grid};
use hexspring_math::{
    intersect_segment_triangle, BoundingBox, RayHit, Vec3, SAME_DIST_TOL, SAME_DIST_TOL_SQR,
};
use hexspring_surface::SurfaceModel;

#[derive(Debug, Clone, Copy)]
struct FaceHit {
    hit: RayHit,
    face: FaceNumber,
    start_corner: CellVertPos,
    pl_idx: usize,
}

/// Fits one polyline of one model into the grid.
pub struct PolylineFitter<'a> {
    grid: &'a mut Grid,
    models: &'a [SurfaceModel],
    model_idx: usize,
    polyline_num: usize,
    /// Radius of the neighbourhood searched for the starting corner.
    start_radius: f64,
    clamped_verts: Vec<usize>,
}

impl<'a> PolylineFitter<'a> {
    /// A fitter for `models[model_idx].polylines[polyline_num]`.
    /// `start_radius` bounds the search for the starting grid corner
    /// (the driver passes the maximum edge length).
    pub fn new(
        grid: &'a mut Grid,
        models: &'a [SurfaceModel],
        model_idx: usize,
        polyline_num: usize,
        start_radius: f64,
    ) -> Self {
        Self {
            grid,
            models,
            model_idx,
            polyline_num,
            start_radius,
            clamped_verts: Vec::new(),
        }
    }

    /// Walk the polyline, clamping corners. Every cell touched is
    /// added to `cells_to_split`. Returns the number of corners
    /// fitted.
    pub fn fit(&mut self, cells_to_split: &mut BTreeSet<usize>) -> usize {
        let mut num_fitted = 0;
        let mut pl_idx = 0usize;
        let Some(mut corner_idx) = self.find_starting_corner() else {
            log::warn!(
                "polyline {}:{} has no grid corner near its start",
                self.model_idx,
                self.polyline_num
            );
            return 0;
        };

        // One corner clamps per step; the vertex count bounds the walk.
        for _ in 0..self.grid.num_verts() {
            let hits = self.find_cell_face_hits(corner_idx, cells_to_split);
            if hits.is_empty() {
                // Usually means the walk ran off the end of the line.
                break;
            }
            if !self.fit_cells(&hits, &mut corner_idx, &mut pl_idx) {
                break;
            }
            let clamp = self.grid.vert(corner_idx).clamp();
            if !clamp.matches(hexspring_grid::mask::EDGE | hexspring_grid::mask::VERT) && pl_idx > 0
            {
                break;
            }
            num_fitted += 1;
        }

        self.add_polyline_end_to_clamped();
        self.collect_clamped_cells(cells_to_split);
        num_fitted
    }

    fn surface_model(&self) -> &SurfaceModel {
        &self.models[self.model_idx]
    }

    /// Nearest grid vertex to the polyline's first point, searched in
    /// a box that doubles until something is found.
    fn find_starting_corner(&mut self) -> Option<usize> {
        let model = &self.models[self.model_idx];
        let pl = &model.polylines[self.polyline_num];
        let start_pt = *model.surface.vert(*pl.verts().first()?);

        let mut radius = self.start_radius;
        for _ in 0..8 {
            let mut bb = BoundingBox::from_point(&start_pt);
            bb.grow(radius);
            let hits = self.grid.find_verts(&bb);
            if let Some(best) = hits.into_iter().min_by(|&a, &b| {
                let da = (self.grid.vert(a).pt() - start_pt).norm_squared();
                let db = (self.grid.vert(b).pt() - start_pt).norm_squared();
                da.total_cmp(&db)
            }) {
                return Some(best);
            }
            radius *= 2.0;
        }
        None
    }

    /// Face pierces of the polyline through every fit-eligible cell
    /// around `start_vert_idx`, keyed by cell.
    fn find_cell_face_hits(
        &mut self,
        start_vert_idx: usize,
        cells_to_split: &mut BTreeSet<usize>,
    ) -> BTreeMap<usize, Vec<FaceHit>> {
        let corner_pt = *self.grid.vert(start_vert_idx).pt();

        let mut eligible = Vec::new();
        for &cell_idx in self.grid.vert(start_vert_idx).cell_indices() {
            if self.grid.cell(cell_idx).num_feature_clamped(self.grid) < 2 {
                eligible.push(cell_idx);
            }
        }

        let mut hits: BTreeMap<usize, Vec<FaceHit>> = BTreeMap::new();
        for cell_idx in eligible {
            let corner = match self.grid.cell(cell_idx).verts_pos(start_vert_idx) {
                Some(p) => p,
                None => continue,
            };
            let all_hits = self.find_pierces(cell_idx, corner);
            if all_hits.is_empty() {
                continue;
            }
            cells_to_split.insert(cell_idx);
            let useful: Vec<FaceHit> = all_hits
                .into_iter()
                .filter(|fh| !hexspring_math::tolerant_eq_pt(&fh.hit.hit_pt, &corner_pt))
                .collect();
            if !useful.is_empty() {
                hits.insert(cell_idx, useful);
            }
        }
        hits
    }

    /// Intersect the polyline against the six faces of a cell,
    /// deduplicating hit points (a hit on a shared face diagonal
    /// appears in both triangles).
    fn find_pierces(&self, cell_idx: usize, corner: CellVertPos) -> Vec<FaceHit> {
        let cell = self.grid.cell(cell_idx);
        let mut hit_pts: Vec<Vec3> = Vec::new();
        let mut hits = Vec::new();

        for face in FaceNumber::ALL {
            let tris = cell.face_tri_points(face, self.grid);
            for tri in &tris {
                if let Some((hit, pl_idx)) = self.polyline_intersects_tri(tri) {
                    let duplicate = hit_pts
                        .iter()
                        .any(|p| hexspring_math::tolerant_eq_pt(p, &hit.hit_pt));
                    if !duplicate {
                        hit_pts.push(hit.hit_pt);
                        hits.push(FaceHit {
                            hit,
                            face,
                            start_corner: corner,
                            pl_idx,
                        });
                    }
                    break;
                }
            }
        }
        hits
    }

    /// First polyline segment piercing `tri`, with the hit.
    fn polyline_intersects_tri(&self, tri: &[Vec3; 3]) -> Option<(RayHit, usize)> {
        let model = self.surface_model();
        let pl = &model.polylines[self.polyline_num];
        for pl_idx in 0..pl.num_segments() {
            let seg = pl.segment(&model.surface, pl_idx);
            if let Some(hit) = intersect_segment_triangle(&seg, tri) {
                return Some((hit, pl_idx));
            }
        }
        None
    }

    /// Choose and clamp the best corner among the collected hits.
    /// Advances `corner_idx`/`pl_idx` on success.
    fn fit_cells(
        &mut self,
        cell_face_hits: &BTreeMap<usize, Vec<FaceHit>>,
        corner_idx: &mut usize,
        pl_idx: &mut usize,
    ) -> bool {
        for (&cell_idx, face_hits) in cell_face_hits {
            let corner_pos = self
                .grid
                .cell(cell_idx)
                .verts_pos(*corner_idx)
                .expect("hit cell does not contain the walk corner");

            let mut best: Option<(CellVertPos, FaceHit)> = None;
            let mut min_energy = f64::MAX;
            for fh in face_hits {
                let Some(pos) = self.closest_unclamped_corner(cell_idx, corner_pos, fh) else {
                    continue;
                };
                let vert_idx = self.grid.cell(cell_idx).vert_idx(pos);
                let bend =
                    energy::vertex_bend_energy_at(self.grid, self.grid, vert_idx, &fh.hit.hit_pt);
                if bend < min_energy {
                    min_energy = bend;
                    best = Some((pos, *fh));
                }
            }

            if let Some((clamp_pos, fh)) = best {
                if self.grid.cell(cell_idx).num_feature_clamped(self.grid) < 2 {
                    self.put_corner_on_polyline(cell_idx, clamp_pos, &fh);
                }
                *corner_idx = self.grid.cell(cell_idx).vert_idx(clamp_pos);
                *pl_idx = fh.pl_idx;
                return true;
            }
        }
        false
    }

    /// The fit-eligible corner of the hit face closest in bend energy
    /// to the hit point. Excludes the walk corner itself, the cell's
    /// opposite corner, feature-clamped corners, and boundary-clamped
    /// corners the hit cannot reach within their plane or line.
    fn closest_unclamped_corner(
        &self,
        cell_idx: usize,
        ignore_pos: CellVertPos,
        face_hit: &FaceHit,
    ) -> Option<CellVertPos> {
        let cell = self.grid.cell(cell_idx);
        let face_corner_pos = hexspring_grid::tables::FACE_CORNERS[face_hit.face.index()];

        let corner = face_hit.start_corner;
        let opp_corner = corner.opposite();
        let clamp_pt = face_hit.hit.hit_pt;

        let mut best: Option<(CellVertPos, f64)> = None;
        for pos in face_corner_pos {
            if pos == ignore_pos || pos == corner || pos == opp_corner {
                continue;
            }
            let vert_idx = cell.vert_idx(pos);
            let vert = self.grid.vert(vert_idx);
            let v = vert.pt() - clamp_pt;
            match vert.clamp() {
                Clamp::Fixed | Clamp::Vert { .. } | Clamp::Edge { .. } | Clamp::Tri { .. } => {
                    continue
                }
                Clamp::Perpendicular(n) => {
                    if v.dot(n).abs() > SAME_DIST_TOL {
                        continue;
                    }
                }
                Clamp::Parallel(d) => {
                    if (v - d * d.dot(&v)).norm_squared() > SAME_DIST_TOL_SQR {
                        continue;
                    }
                }
                _ => {}
            }

            let bend = energy::vertex_bend_energy_at(self.grid, self.grid, vert_idx, &clamp_pt);
            if best.map_or(true, |(_, e)| bend < e) {
                best = Some((pos, bend));
            }
        }
        best.map(|(pos, _)| pos)
    }

    /// Move the chosen corner onto the (clamp-projected) hit point and
    /// give it an edge clamp, upgrading already-constrained corners to
    /// Fixed.
    fn put_corner_on_polyline(&mut self, cell_idx: usize, corner: CellVertPos, face_hit: &FaceHit) {
        let vert_idx = self.grid.cell(cell_idx).vert_idx(corner);
        let cur_pt = *self.grid.vert(vert_idx).pt();

        let mut clamp_pt = face_hit.hit.hit_pt;
        match self.grid.vert(vert_idx).clamp() {
            Clamp::Perpendicular(n) => {
                // Keep the point in its boundary plane.
                let v = clamp_pt - cur_pt;
                clamp_pt = cur_pt + (v - n * n.dot(&v));
            }
            Clamp::Parallel(d) => {
                // Keep the point on its boundary line.
                let v = clamp_pt - cur_pt;
                clamp_pt = cur_pt + d * d.dot(&v);
            }
            _ => {}
        }

        let model = &self.models[self.model_idx];
        let pl = &model.polylines[self.polyline_num];
        if let Some(cp) = pl.closest_point(&model.surface, &clamp_pt) {
            if cp.dist > SAME_DIST_TOL {
                log::debug!(
                    "fit corner {vert_idx} lands {:.3e} off polyline {}:{}",
                    cp.dist,
                    self.model_idx,
                    self.polyline_num
                );
            }
        }

        if !self.grid.set_vert_pos(vert_idx, &clamp_pt) {
            // Would fuse with an existing vertex; report and leave the
            // corner where it is.
            log::warn!("fit aborted for corner {vert_idx}: move would fuse vertices");
            return;
        }

        let new_clamp = if matches!(self.grid.vert(vert_idx).clamp(), Clamp::None) {
            Clamp::Edge {
                model: self.model_idx,
                polyline: self.polyline_num,
                segment: face_hit.pl_idx,
            }
        } else {
            // A boundary-clamped corner crossed by the ridge loses all
            // freedom.
            Clamp::Fixed
        };
        self.grid.vert_mut(vert_idx).set_clamp(new_clamp);

        if self.grid.cell(cell_idx).num_feature_clamped(self.grid) < 2 {
            log::debug!(
                "cell {cell_idx} has {} feature-clamped corners after fit",
                self.grid.cell(cell_idx).num_feature_clamped(self.grid)
            );
        }
        self.clamped_verts.push(vert_idx);
    }

    /// The polyline's far endpoint joins the clamp set when a grid
    /// vertex sits exactly there.
    fn add_polyline_end_to_clamped(&mut self) {
        let model = &self.models[self.model_idx];
        let pl = &model.polylines[self.polyline_num];
        let Some(&end_vert) = pl.verts().last() else {
            return;
        };
        let end_pt = *model.surface.vert(end_vert);
        let mut bb = BoundingBox::from_point(&end_pt);
        bb.grow(SAME_DIST_TOL);
        let near = self.grid.find_verts(&bb);
        if near.len() == 1 {
            self.clamped_verts.push(near[0]);
        }
    }

    fn collect_clamped_cells(&self, cells_to_split: &mut BTreeSet<usize>) {
        for &vert_idx in &self.clamped_verts {
            cells_to_split.extend(self.grid.vert(vert_idx).cell_indices().iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexspring_surface::TriangleSurface;

    /// A 2×2×2 lattice with driver-style boundary clamps.
    fn clamped_lattice() -> Grid {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(2.0, 2.0, 2.0)),
            1.0,
        );
        for vert_idx in 0..grid.num_verts() {
            let clamp = match grid.vert(vert_idx).num_cells() {
                8 => continue,
                4 => {
                    let pt = *grid.vert(vert_idx).pt();
                    let axis = (0..3).find(|&a| pt[a] == 0.0 || pt[a] == 2.0).unwrap();
                    let mut n = Vec3::zeros();
                    n[axis] = 1.0;
                    Clamp::Perpendicular(n)
                }
                2 => {
                    let pt = *grid.vert(vert_idx).pt();
                    let axis = (0..3).find(|&a| pt[a] != 0.0 && pt[a] != 2.0).unwrap();
                    let mut d = Vec3::zeros();
                    d[axis] = 1.0;
                    Clamp::Parallel(d)
                }
                1 => Clamp::Fixed,
                n => panic!("unexpected cell count {n}"),
            };
            grid.vert_mut(vert_idx).set_clamp(clamp);
        }
        grid
    }

    /// A model whose single polyline runs along the x axis at
    /// y = z = 1, crossing the 2×2×2 grid interior.
    fn axis_model() -> SurfaceModel {
        let points = [
            Vec3::new(-0.1, 1.0, 1.0),
            Vec3::new(0.7, 1.0, 1.0),
            Vec3::new(1.4, 1.0, 1.0),
            Vec3::new(2.1, 1.0, 1.0),
        ];
        let mut verts: Vec<Vec3> = points.to_vec();
        let base = verts.len();
        verts.push(Vec3::new(50.0, 0.0, -50.0));
        verts.push(Vec3::new(51.0, 0.0, -50.0));
        verts.push(Vec3::new(50.0, 1.0, -50.0));
        let surface = TriangleSurface::from_indexed(verts, vec![[base, base + 1, base + 2]]);

        let mut model = SurfaceModel::new(surface, 30.0);
        let mut pl = hexspring_surface::Polyline::new();
        pl.add_edge([0, 1]);
        pl.add_edge([1, 2]);
        pl.add_edge([2, 3]);
        model.polylines.push(pl);
        model
    }

    #[test]
    fn test_fit_straight_polyline_through_grid() {
        let mut grid = clamped_lattice();
        let model = axis_model();
        let models = [model];

        let mut cells_to_split = BTreeSet::new();
        let mut fitter = PolylineFitter::new(&mut grid, &models, 0, 0, 1.0);
        let fitted = fitter.fit(&mut cells_to_split);
        assert!(fitted > 0, "nothing fitted");
        assert!(!cells_to_split.is_empty());

        // Exactly the three grid vertices along the axis acquire edge
        // clamps (the boundary verts at x=0 and x=2 are crossed and
        // upgraded to Fixed, or left as they were).
        let mut edge_clamped = 0;
        for vert_idx in 0..grid.num_verts() {
            let pt = *grid.vert(vert_idx).pt();
            if let Clamp::Edge { .. } = grid.vert(vert_idx).clamp() {
                edge_clamped += 1;
                assert!((pt.y - 1.0).abs() < 1e-9, "edge clamp off axis at {pt:?}");
                assert!((pt.z - 1.0).abs() < 1e-9, "edge clamp off axis at {pt:?}");
            }
        }
        assert!(
            edge_clamped >= 1,
            "no interior vertices clamped to the ridge"
        );
        // Every edge-clamped vertex satisfies its clamp invariant.
        assert!(grid.verify(&models));
    }

    /// On an unclamped grid the walk clamps the interior axis vertex
    /// and one axis end before the touched cells saturate at two
    /// feature-clamped corners each.
    #[test]
    fn test_fit_on_unclamped_grid_clamps_axis_verts() {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(2.0, 2.0, 2.0)),
            1.0,
        );
        let models = [axis_model()];
        let mut cells = BTreeSet::new();
        let fitted = PolylineFitter::new(&mut grid, &models, 0, 0, 1.0).fit(&mut cells);
        assert_eq!(fitted, 2);

        let clamped: Vec<Vec3> = (0..grid.num_verts())
            .filter(|&i| matches!(grid.vert(i).clamp(), Clamp::Edge { .. }))
            .map(|i| *grid.vert(i).pt())
            .collect();
        assert_eq!(clamped.len(), 2);
        for pt in &clamped {
            assert!((pt.y - 1.0).abs() < 1e-9 && (pt.z - 1.0).abs() < 1e-9);
        }
        assert!(grid.verify(&models));
    }

    #[test]
    fn test_fitted_cells_reported_for_split() {
        let mut grid = clamped_lattice();
        let models = [axis_model()];
        let mut cells_to_split = BTreeSet::new();
        PolylineFitter::new(&mut grid, &models, 0, 0, 1.0).fit(&mut cells_to_split);
        for &cell_idx in &cells_to_split {
            assert!(grid.cell_exists(cell_idx));
        }
    }

    #[test]
    fn test_missing_start_neighbourhood() {
        let mut grid = clamped_lattice();
        // Polyline far outside the grid bounds.
        let points = [Vec3::new(500.0, 500.0, 500.0), Vec3::new(501.0, 500.0, 500.0)];
        let mut verts = points.to_vec();
        let base = verts.len();
        verts.push(Vec3::new(600.0, 0.0, 0.0));
        verts.push(Vec3::new(601.0, 0.0, 0.0));
        verts.push(Vec3::new(600.0, 1.0, 0.0));
        let surface = TriangleSurface::from_indexed(verts, vec![[base, base + 1, base + 2]]);
        let mut model = SurfaceModel::new(surface, 30.0);
        let mut pl = hexspring_surface::Polyline::new();
        pl.add_edge([0, 1]);
        model.polylines.push(pl);
        let models = [model];

        let mut cells = BTreeSet::new();
        let fitted = PolylineFitter::new(&mut grid, &models, 0, 0, 1.0).fit(&mut cells);
        // The expanding search may reach the grid eventually, but no
        // face is ever pierced.
        assert_eq!(fitted, 0);
    }
}
