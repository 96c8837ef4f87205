#![warn(missing_docs)]

//! Triangle surface input for the hexspring mesher.
//!
//! The grid core consumes this crate as a read-only service: STL
//! loading, spatial search over triangles, sharp-edge extraction,
//! polyline chaining, closest-point-on-polyline queries, and
//! segment/triangle intersection.

pub mod error;
pub mod polyline;
pub mod stl;

pub use error::{Result, SurfaceError};
pub use polyline::{Polyline, PolylineApproach};

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};

use hexspring_math::{
    triangle_normal, BoundingBox, LineSegment, SpatialTree, Vec3, FILE_PRECISION, SAME_DIST_TOL,
};

/// An edge of the triangle surface with its adjacent triangles.
#[derive(Debug, Clone)]
pub struct SurfaceEdge {
    /// The two endpoint vertex indices, ascending.
    pub verts: [usize; 2],
    /// Indices of the triangles sharing this edge (2 on a closed
    /// manifold).
    pub tris: Vec<usize>,
}

/// An indexed triangle surface with merged vertices and edge adjacency.
#[derive(Debug, Clone, Default)]
pub struct TriangleSurface {
    verts: Vec<Vec3>,
    tris: Vec<[usize; 3]>,
    edges: Vec<SurfaceEdge>,
    edge_map: BTreeMap<(usize, usize), usize>,
    bbox: BoundingBox,
}

impl TriangleSurface {
    /// An empty surface.
    pub fn new() -> Self {
        Self {
            bbox: BoundingBox::empty(),
            ..Default::default()
        }
    }

    /// Build a surface from raw triangle soup, merging coincident
    /// vertices within `SAME_DIST_TOL`.
    pub fn from_triangles(triangles: &[[Vec3; 3]]) -> Self {
        let mut bbox = BoundingBox::empty();
        for tri in triangles {
            for pt in tri {
                bbox.merge_point(pt);
            }
        }
        let mut search_box = bbox;
        if !search_box.is_empty() {
            search_box.grow(0.01 * search_box.range().norm().max(1.0));
        }

        let mut surface = Self::new();
        surface.bbox = bbox;
        let mut tree = SpatialTree::new(search_box);
        for tri in triangles {
            let mut idx = [0usize; 3];
            for (i, pt) in tri.iter().enumerate() {
                idx[i] = surface.add_vert(&mut tree, pt);
            }
            if idx[0] == idx[1] || idx[1] == idx[2] || idx[0] == idx[2] {
                // Degenerate sliver, drop it.
                continue;
            }
            surface.add_tri(idx);
        }
        surface
    }

    /// Build a surface from already-indexed data (no vertex merging).
    pub fn from_indexed(verts: Vec<Vec3>, tris: Vec<[usize; 3]>) -> Self {
        let mut surface = Self::new();
        for pt in &verts {
            surface.bbox.merge_point(pt);
        }
        surface.verts = verts;
        for t in tris {
            surface.add_tri(t);
        }
        surface
    }

    fn add_vert(&mut self, tree: &mut SpatialTree, pt: &Vec3) -> usize {
        let mut query = BoundingBox::from_point(pt);
        query.grow(SAME_DIST_TOL);
        for hit in tree.find(&query) {
            if hexspring_math::tolerant_eq_pt(&self.verts[hit], pt) {
                return hit;
            }
        }
        let idx = self.verts.len();
        self.verts.push(*pt);
        tree.add(BoundingBox::from_point(pt), idx);
        idx
    }

    fn add_tri(&mut self, idx: [usize; 3]) {
        let tri_idx = self.tris.len();
        self.tris.push(idx);
        for i in 0..3 {
            let (a, b) = (idx[i], idx[(i + 1) % 3]);
            let key = (a.min(b), a.max(b));
            let edge_idx = *self.edge_map.entry(key).or_insert_with(|| {
                self.edges.push(SurfaceEdge {
                    verts: [key.0, key.1],
                    tris: Vec::new(),
                });
                self.edges.len() - 1
            });
            self.edges[edge_idx].tris.push(tri_idx);
        }
    }

    /// Number of vertices.
    pub fn num_verts(&self) -> usize {
        self.verts.len()
    }

    /// Number of triangles.
    pub fn num_tris(&self) -> usize {
        self.tris.len()
    }

    /// Number of unique edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// A vertex position.
    pub fn vert(&self, idx: usize) -> &Vec3 {
        &self.verts[idx]
    }

    /// A triangle's vertex indices.
    pub fn tri(&self, idx: usize) -> &[usize; 3] {
        &self.tris[idx]
    }

    /// An edge record.
    pub fn edge(&self, idx: usize) -> &SurfaceEdge {
        &self.edges[idx]
    }

    /// A triangle's corner positions.
    pub fn tri_points(&self, idx: usize) -> [Vec3; 3] {
        let t = self.tris[idx];
        [self.verts[t[0]], self.verts[t[1]], self.verts[t[2]]]
    }

    /// The surface bounding box.
    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bbox
    }

    /// Angle between the normals of the two triangles sharing an edge.
    /// Returns `None` for non-manifold or boundary edges.
    pub fn edge_dihedral_angle(&self, edge_idx: usize) -> Option<f64> {
        let edge = &self.edges[edge_idx];
        if edge.tris.len() != 2 {
            return None;
        }
        let n0 = triangle_normal(&self.tri_points(edge.tris[0]));
        let n1 = triangle_normal(&self.tri_points(edge.tris[1]));
        let cos = n0.dot(&n1);
        let sin = n0.cross(&n1).norm();
        Some(sin.atan2(cos))
    }

    /// True if the edge's dihedral angle exceeds `asin(sin_theta)`.
    pub fn is_edge_sharp(&self, edge_idx: usize, sin_theta: f64) -> bool {
        match self.edge_dihedral_angle(edge_idx) {
            Some(angle) => angle > sin_theta.clamp(-1.0, 1.0).asin(),
            None => false,
        }
    }

    /// True when every edge is shared by exactly two triangles.
    pub fn is_closed(&self) -> bool {
        self.edges.iter().all(|e| e.tris.len() == 2)
    }

    /// Closest point on a triangle to `pt`.
    pub fn closest_point_on_tri(&self, tri_idx: usize, pt: &Vec3) -> Vec3 {
        closest_point_on_triangle(&self.tri_points(tri_idx), pt)
    }

    /// Write the mesh portion of a model blob.
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Surface version 1")?;
        writeln!(out, "SV {}", self.verts.len())?;
        for v in &self.verts {
            writeln!(
                out,
                "{:.prec$} {:.prec$} {:.prec$}",
                v.x,
                v.y,
                v.z,
                prec = FILE_PRECISION
            )?;
        }
        writeln!(out, "ST {}", self.tris.len())?;
        for t in &self.tris {
            writeln!(out, "{} {} {}", t[0], t[1], t[2])?;
        }
        Ok(())
    }

    /// Read the mesh portion of a model blob written by [`save`](Self::save).
    pub fn read(tokens: &mut TokenReader<'_>) -> Result<Self> {
        tokens.expect("Surface")?;
        tokens.expect("version")?;
        let version: u32 = tokens.parse()?;
        if version != 1 {
            return Err(SurfaceError::Stream(format!(
                "unsupported surface version {version}"
            )));
        }
        tokens.expect("SV")?;
        let num_verts: usize = tokens.parse()?;
        let mut surface = Self::new();
        for _ in 0..num_verts {
            let x: f64 = tokens.parse()?;
            let y: f64 = tokens.parse()?;
            let z: f64 = tokens.parse()?;
            let pt = Vec3::new(x, y, z);
            surface.bbox.merge_point(&pt);
            surface.verts.push(pt);
        }
        tokens.expect("ST")?;
        let num_tris: usize = tokens.parse()?;
        for _ in 0..num_tris {
            let a: usize = tokens.parse()?;
            let b: usize = tokens.parse()?;
            let c: usize = tokens.parse()?;
            if a >= num_verts || b >= num_verts || c >= num_verts {
                return Err(SurfaceError::Stream("triangle index out of range".into()));
            }
            surface.add_tri([a, b, c]);
        }
        Ok(surface)
    }
}

/// Closest point on a triangle to `pt` (interior, edge, or corner).
pub fn closest_point_on_triangle(tri: &[Vec3; 3], pt: &Vec3) -> Vec3 {
    let normal = triangle_normal(tri);
    let projected = pt - normal.dot(&(pt - tri[0])) * normal;

    let mut inside = true;
    for i in 0..3 {
        let e = tri[(i + 1) % 3] - tri[i];
        if normal.dot(&e.cross(&(projected - tri[i]))) < 0.0 {
            inside = false;
            break;
        }
    }
    if inside {
        return projected;
    }

    let mut best = tri[0];
    let mut best_dist = f64::INFINITY;
    for i in 0..3 {
        let seg = LineSegment::new(tri[i], tri[(i + 1) % 3]);
        let a = seg.approach(pt);
        if a.dist < best_dist {
            best_dist = a.dist;
            best = seg.interpolate(a.t.clamp(0.0, 1.0));
        }
    }
    best
}

/// A surface model: the triangle mesh plus its detected sharp polylines
/// and cusp vertices. This is the unit the mesher's clamp references
/// index into.
#[derive(Debug, Clone)]
pub struct SurfaceModel {
    /// The underlying triangle surface.
    pub surface: TriangleSurface,
    /// Chains of sharp edges, split at cusps, longest first after
    /// [`init`](Self::init).
    pub polylines: Vec<Polyline>,
    /// Surface vertex indices where sharp chains end or bend sharper
    /// than the threshold.
    pub cusps: BTreeSet<usize>,
    sin_sharp_angle: f64,
}

impl SurfaceModel {
    /// Wrap a surface with a sharp-angle threshold in degrees.
    pub fn new(surface: TriangleSurface, sharp_angle_deg: f64) -> Self {
        Self {
            surface,
            polylines: Vec::new(),
            cusps: BTreeSet::new(),
            sin_sharp_angle: (sharp_angle_deg * std::f64::consts::PI / 180.0).sin(),
        }
    }

    /// The sine of the sharp-angle threshold.
    pub fn sin_sharp_angle(&self) -> f64 {
        self.sin_sharp_angle
    }

    /// Detect sharp edges, chain them into polylines, extract cusps and
    /// split the chains there.
    pub fn init(&mut self) {
        let sharps = self.find_sharp_edges();
        log::debug!("surface: {} sharp edges", sharps.len());
        self.create_polylines(&sharps);
        self.split_polylines_at_cusps();
        // Longest ridges are fitted first by the driver.
        self.polylines
            .sort_by(|a, b| b.verts().len().cmp(&a.verts().len()));
        log::debug!(
            "surface: {} polylines, {} cusps",
            self.polylines.len(),
            self.cusps.len()
        );
    }

    /// Indices of all sharp edges at the configured threshold.
    pub fn find_sharp_edges(&self) -> Vec<usize> {
        (0..self.surface.num_edges())
            .filter(|&i| self.surface.is_edge_sharp(i, self.sin_sharp_angle))
            .collect()
    }

    /// True when `idx` names a polyline of this model.
    pub fn polyline_exists(&self, idx: usize) -> bool {
        idx < self.polylines.len()
    }

    fn create_polylines(&mut self, sharps: &[usize]) {
        let mut remaining: Vec<[usize; 2]> =
            sharps.iter().map(|&e| self.surface.edge(e).verts).collect();
        let mut chains: Vec<Polyline> = Vec::new();

        while !remaining.is_empty() {
            let mut added = false;
            for i in 0..remaining.len() {
                if chains.iter_mut().any(|pl| pl.add_edge(remaining[i])) {
                    remaining.swap_remove(i);
                    added = true;
                    break;
                }
            }
            if !added {
                let edge = remaining.pop().unwrap();
                let mut pl = Polyline::new();
                pl.add_edge(edge);
                chains.push(pl);
            }
        }
        self.polylines = chains;
    }

    fn split_polylines_at_cusps(&mut self) {
        let cos_angle = (1.0 - self.sin_sharp_angle * self.sin_sharp_angle).sqrt();
        let source = std::mem::take(&mut self.polylines);

        for pl in source {
            let verts = pl.verts().to_vec();
            let n = verts.len();
            let num_segs = pl.num_segments();
            if num_segs < 3 {
                continue;
            }

            let mut cusp_positions: BTreeSet<usize> = BTreeSet::new();
            if !pl.is_closed() {
                // Open chain ends are always cusps.
                cusp_positions.insert(0);
                cusp_positions.insert(n - 1);
                self.cusps.insert(verts[0]);
                self.cusps.insert(verts[n - 1]);
            }

            // Interior direction breaks sharper than the threshold.
            let limit = if pl.is_closed() { n } else { n - 2 };
            for i in 0..limit {
                let j = (i + 1) % n;
                let k = (i + 2) % n;
                let v0 = (self.surface.vert(verts[j]) - self.surface.vert(verts[i])).normalize();
                let v1 = (self.surface.vert(verts[k]) - self.surface.vert(verts[j])).normalize();
                if v0.dot(&v1) < cos_angle {
                    cusp_positions.insert(j);
                    self.cusps.insert(verts[j]);
                }
            }

            if cusp_positions.is_empty() {
                // A smooth closed loop stays whole.
                self.polylines.push(pl);
                continue;
            }

            let cusp_list: Vec<usize> = cusp_positions.into_iter().collect();
            let pair_count = if pl.is_closed() {
                cusp_list.len()
            } else {
                cusp_list.len() - 1
            };
            for ci in 0..pair_count {
                let cj = (ci + 1) % cusp_list.len();
                let start = cusp_list[ci];
                let mut end = cusp_list[cj];
                if end <= start {
                    end += n;
                }
                let mut piece = Polyline::new();
                for i in start..end {
                    piece.add_edge([verts[i % n], verts[(i + 1) % n]]);
                }
                if piece.num_segments() > 0 {
                    self.polylines.push(piece);
                }
            }
        }
    }

    /// Smallest distance from any vertex to a triangle it does not
    /// touch, an estimate of the model's narrowest gap used to bound
    /// the minimum edge length.
    pub fn min_gap(&self) -> f64 {
        let surface = &self.surface;
        if surface.num_tris() == 0 {
            return f64::MAX;
        }

        let mut tri_tree = SpatialTree::new({
            let mut bb = *surface.bounding_box();
            bb.grow(0.01 * bb.range().norm().max(1.0));
            bb
        });
        let mut avg_edge = 0.0;
        for i in 0..surface.num_tris() {
            let pts = surface.tri_points(i);
            let mut bb = BoundingBox::empty();
            for p in &pts {
                bb.merge_point(p);
            }
            tri_tree.add(bb, i);
            avg_edge += (pts[1] - pts[0]).norm();
        }
        avg_edge /= surface.num_tris() as f64;

        let mut min_gap = f64::MAX;
        for vert_idx in 0..surface.num_verts() {
            let pt = surface.vert(vert_idx);
            let mut query = BoundingBox::from_point(pt);
            query.grow(2.0 * avg_edge);
            for tri_idx in tri_tree.find(&query) {
                if surface.tri(tri_idx).contains(&vert_idx) {
                    continue;
                }
                let closest = surface.closest_point_on_tri(tri_idx, pt);
                let d = (closest - pt).norm();
                // Coincident geometry is shared surface, not a gap.
                if d > SAME_DIST_TOL && d < min_gap {
                    min_gap = d;
                }
            }
        }
        min_gap
    }

    /// Write the full model blob (mesh + polylines).
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Model version 1")?;
        self.surface.save(out)?;
        writeln!(out, "#PL {}", self.polylines.len())?;
        for pl in &self.polylines {
            pl.save(out)?;
        }
        Ok(())
    }

    /// Read a model blob written by [`save`](Self::save).
    pub fn read(tokens: &mut TokenReader<'_>, sharp_angle_deg: f64) -> Result<Self> {
        tokens.expect("Model")?;
        tokens.expect("version")?;
        let version: u32 = tokens.parse()?;
        if version != 1 {
            return Err(SurfaceError::Stream(format!(
                "unsupported model version {version}"
            )));
        }
        let surface = TriangleSurface::read(tokens)?;
        tokens.expect("#PL")?;
        let num_polylines: usize = tokens.parse()?;
        let mut model = Self::new(surface, sharp_angle_deg);
        for _ in 0..num_polylines {
            model.polylines.push(Polyline::read(tokens)?);
        }
        // Cusps are re-derived rather than stored.
        for pl in &model.polylines {
            if !pl.is_closed() {
                model.cusps.insert(*pl.verts().first().unwrap());
                model.cusps.insert(*pl.verts().last().unwrap());
            }
        }
        Ok(model)
    }
}

/// Whitespace token reader over a text stream, the common substrate of
/// the versioned save formats.
pub struct TokenReader<'a> {
    input: Box<dyn BufRead + 'a>,
    pending: Vec<String>,
}

impl<'a> TokenReader<'a> {
    /// Wrap a buffered reader.
    pub fn new(input: impl BufRead + 'a) -> Self {
        Self {
            input: Box::new(input),
            pending: Vec::new(),
        }
    }

    /// Next whitespace-delimited token, or `None` at end of input.
    pub fn next(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(tok) = self.pending.pop() {
                return Ok(Some(tok));
            }
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.pending = line.split_whitespace().rev().map(String::from).collect();
        }
    }

    /// Next token, erroring at end of input.
    pub fn require(&mut self) -> Result<String> {
        self.next()?
            .ok_or_else(|| SurfaceError::Stream("unexpected end of stream".into()))
    }

    /// Consume a token and check it equals `tag`.
    pub fn expect(&mut self, tag: &str) -> Result<()> {
        let tok = self.require()?;
        if tok != tag {
            return Err(SurfaceError::Stream(format!(
                "expected '{tag}', found '{tok}'"
            )));
        }
        Ok(())
    }

    /// Drain and return the remaining tokens of the current line.
    /// Used by records whose value count is "until end of line".
    pub fn take_line(&mut self) -> Vec<String> {
        let mut rest: Vec<String> = std::mem::take(&mut self.pending);
        rest.reverse();
        rest
    }

    /// Consume and parse a token.
    pub fn parse<T: std::str::FromStr>(&mut self) -> Result<T> {
        let tok = self.require()?;
        tok.parse()
            .map_err(|_| SurfaceError::Stream(format!("malformed value '{tok}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A unit cube as triangle soup with outward-facing windings.
    pub(crate) fn cube_soup() -> Vec<[Vec3; 3]> {
        let p = |x: f64, y: f64, z: f64| Vec3::new(x, y, z);
        let c = [
            p(0., 0., 0.),
            p(1., 0., 0.),
            p(1., 1., 0.),
            p(0., 1., 0.),
            p(0., 0., 1.),
            p(1., 0., 1.),
            p(1., 1., 1.),
            p(0., 1., 1.),
        ];
        let quads: [[usize; 4]; 6] = [
            [0, 3, 2, 1],
            [4, 5, 6, 7],
            [0, 1, 5, 4],
            [2, 3, 7, 6],
            [0, 4, 7, 3],
            [1, 2, 6, 5],
        ];
        let mut soup = Vec::new();
        for q in &quads {
            soup.push([c[q[0]], c[q[1]], c[q[2]]]);
            soup.push([c[q[0]], c[q[2]], c[q[3]]]);
        }
        soup
    }

    #[test]
    fn test_cube_topology() {
        let surface = TriangleSurface::from_triangles(&cube_soup());
        assert_eq!(surface.num_verts(), 8);
        assert_eq!(surface.num_tris(), 12);
        assert_eq!(surface.num_edges(), 18);
        assert!(surface.is_closed());
    }

    #[test]
    fn test_cube_sharp_edges_and_cusps() {
        let surface = TriangleSurface::from_triangles(&cube_soup());
        let mut model = SurfaceModel::new(surface, 45.0);
        model.init();

        let sharps = model.find_sharp_edges();
        // The 12 cube edges are sharp; the 6 face diagonals are not.
        assert_eq!(sharps.len(), 12);
        assert_eq!(model.cusps.len(), 8);
    }

    #[test]
    fn test_closest_point_on_triangle() {
        let tri = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
        ];
        // Above the interior: projects straight down.
        let c = closest_point_on_triangle(&tri, &Vec3::new(0.5, 0.5, 3.0));
        assert_relative_eq!(c.x, 0.5);
        assert_relative_eq!(c.z, 0.0);
        // Outside an edge: clamps onto it.
        let c = closest_point_on_triangle(&tri, &Vec3::new(1.0, -1.0, 0.0));
        assert_relative_eq!(c.y, 0.0);
        assert_relative_eq!(c.x, 1.0);
        // Past a corner.
        let c = closest_point_on_triangle(&tri, &Vec3::new(-1.0, -1.0, 0.0));
        assert_relative_eq!((c - tri[0]).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_model_save_read_round_trip() {
        let surface = TriangleSurface::from_triangles(&cube_soup());
        let mut model = SurfaceModel::new(surface, 45.0);
        model.init();

        let mut buf = Vec::new();
        model.save(&mut buf).unwrap();
        let mut tokens = TokenReader::new(std::io::BufReader::new(buf.as_slice()));
        let restored = SurfaceModel::read(&mut tokens, 45.0).unwrap();

        assert_eq!(restored.surface.num_verts(), model.surface.num_verts());
        assert_eq!(restored.surface.num_tris(), model.surface.num_tris());
        assert_eq!(restored.polylines.len(), model.polylines.len());
    }

    #[test]
    fn test_min_gap_two_plates() {
        // Two parallel unit squares 0.25 apart.
        let mut soup = Vec::new();
        for &z in &[0.0, 0.25] {
            let p = |x: f64, y: f64| Vec3::new(x, y, z);
            soup.push([p(0., 0.), p(1., 0.), p(1., 1.)]);
            soup.push([p(0., 0.), p(1., 1.), p(0., 1.)]);
        }
        let model = SurfaceModel::new(TriangleSurface::from_triangles(&soup), 30.0);
        assert_relative_eq!(model.min_gap(), 0.25, epsilon = 1e-9);
    }
}
