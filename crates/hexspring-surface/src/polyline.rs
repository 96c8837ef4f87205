//! Sharp-edge polylines.
//!
//! A polyline is an ordered chain of surface-vertex indices built by
//! greedily appending sharp edges at either end. The grid fitter and
//! the edge-clamp gradient consume it through segment retrieval and
//! closest-point queries.

use std::io::Write;

use hexspring_math::{BoundingBox, LineSegment, Vec3};

use crate::error::{Result, SurfaceError};
use crate::{TokenReader, TriangleSurface};

/// An ordered chain of surface-vertex indices.
#[derive(Debug, Clone, Default)]
pub struct Polyline {
    verts: Vec<usize>,
    closed: bool,
}

/// Result of a closest-point query against a polyline.
#[derive(Debug, Clone, Copy)]
pub struct PolylineApproach {
    /// Index of the closest segment.
    pub seg_idx: usize,
    /// Unclamped projection parameter on that segment.
    pub t: f64,
    /// Distance to the closest point on the chain.
    pub dist: f64,
}

impl Polyline {
    /// An empty polyline.
    pub fn new() -> Self {
        Self::default()
    }

    /// The chained vertex indices.
    pub fn verts(&self) -> &[usize] {
        &self.verts
    }

    /// True when the chain closed on itself.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of segments (a closed chain has one per vertex).
    pub fn num_segments(&self) -> usize {
        if self.closed {
            self.verts.len()
        } else {
            self.verts.len().saturating_sub(1)
        }
    }

    /// True when `idx` names a segment.
    pub fn is_valid_index(&self, idx: usize) -> bool {
        idx < self.num_segments()
    }

    /// Try to attach an edge at either end of the chain. Returns false
    /// when the edge does not connect (or the chain is already closed).
    pub fn add_edge(&mut self, edge: [usize; 2]) -> bool {
        if self.closed {
            return false;
        }
        if self.verts.is_empty() {
            self.verts.extend_from_slice(&edge);
            return true;
        }

        let first = *self.verts.first().unwrap();
        let last = *self.verts.last().unwrap();
        let next = if edge[0] == last {
            Some(edge[1])
        } else if edge[1] == last {
            Some(edge[0])
        } else {
            None
        };
        if let Some(v) = next {
            if v == first {
                self.closed = true;
            } else {
                self.verts.push(v);
            }
            return true;
        }

        let prev = if edge[0] == first {
            Some(edge[1])
        } else if edge[1] == first {
            Some(edge[0])
        } else {
            None
        };
        if let Some(v) = prev {
            if v == last {
                self.closed = true;
            } else {
                self.verts.insert(0, v);
            }
            return true;
        }
        false
    }

    /// The `i`-th segment as a line segment in space.
    pub fn segment(&self, surface: &TriangleSurface, i: usize) -> LineSegment {
        let n = self.verts.len();
        LineSegment::new(
            *surface.vert(self.verts[i]),
            *surface.vert(self.verts[(i + 1) % n]),
        )
    }

    /// Closest point on the chain to `pt`: segment index, unclamped
    /// parameter on that segment, and distance. Ties at shared vertices
    /// resolve to the lower segment index.
    pub fn closest_point(&self, surface: &TriangleSurface, pt: &Vec3) -> Option<PolylineApproach> {
        let mut best: Option<PolylineApproach> = None;
        for i in 0..self.num_segments() {
            let a = self.segment(surface, i).approach(pt);
            if best.map_or(true, |b| a.dist < b.dist) {
                best = Some(PolylineApproach {
                    seg_idx: i,
                    t: a.t,
                    dist: a.dist,
                });
            }
        }
        best
    }

    /// Bounding box over the chained vertices.
    pub fn bounding_box(&self, surface: &TriangleSurface) -> BoundingBox {
        let mut bb = BoundingBox::empty();
        for &v in &self.verts {
            bb.merge_point(surface.vert(v));
        }
        bb
    }

    /// Write one `PL:` record.
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write!(
            out,
            "PL: {} {}",
            if self.closed { 1 } else { 0 },
            self.verts.len()
        )?;
        for &v in &self.verts {
            write!(out, " {v}")?;
        }
        writeln!(out)
    }

    /// Read one `PL:` record.
    pub fn read(tokens: &mut TokenReader<'_>) -> Result<Self> {
        tokens.expect("PL:")?;
        let closed_flag: u32 = tokens.parse()?;
        let count: usize = tokens.parse()?;
        if count < 2 {
            return Err(SurfaceError::Stream("polyline with fewer than 2 verts".into()));
        }
        let mut verts = Vec::with_capacity(count);
        for _ in 0..count {
            verts.push(tokens.parse()?);
        }
        Ok(Self {
            verts,
            closed: closed_flag != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_surface(points: &[Vec3]) -> TriangleSurface {
        // Positions only; the single far-away triangle keeps the
        // surface non-empty without touching the point indices.
        let mut verts = points.to_vec();
        let base = verts.len();
        verts.push(Vec3::new(100.0, 0.0, -50.0));
        verts.push(Vec3::new(101.0, 0.0, -50.0));
        verts.push(Vec3::new(100.0, 1.0, -50.0));
        TriangleSurface::from_indexed(verts, vec![[base, base + 1, base + 2]])
    }

    #[test]
    fn test_chain_both_ends() {
        let mut pl = Polyline::new();
        assert!(pl.add_edge([3, 4]));
        assert!(pl.add_edge([4, 5]));
        assert!(pl.add_edge([2, 3]));
        assert!(!pl.add_edge([9, 10]));
        assert_eq!(pl.verts(), &[2, 3, 4, 5]);
        assert!(!pl.is_closed());
        assert_eq!(pl.num_segments(), 3);
    }

    #[test]
    fn test_chain_closes() {
        let mut pl = Polyline::new();
        assert!(pl.add_edge([0, 1]));
        assert!(pl.add_edge([1, 2]));
        assert!(pl.add_edge([2, 0]));
        assert!(pl.is_closed());
        assert_eq!(pl.num_segments(), 3);
        assert!(!pl.add_edge([0, 5]));
    }

    #[test]
    fn test_closest_point_prefers_lower_segment_at_shared_vertex() {
        let points = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
        ];
        let surface = line_surface(&points);
        let mut pl = Polyline::new();
        pl.add_edge([0, 1]);
        pl.add_edge([1, 2]);

        // Exactly at the shared vertex: segment 0, t = 1.
        let a = pl
            .closest_point(&surface, &Vec3::new(1.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(a.seg_idx, 0);
        assert_relative_eq!(a.t, 1.0);
        assert_relative_eq!(a.dist, 0.0, epsilon = 1e-12);

        // Mid-segment hit.
        let a = pl
            .closest_point(&surface, &Vec3::new(0.5, 0.2, 0.0))
            .unwrap();
        assert_eq!(a.seg_idx, 0);
        assert_relative_eq!(a.t, 0.5);
        assert_relative_eq!(a.dist, 0.2);
    }

    #[test]
    fn test_save_read_round_trip() {
        let mut pl = Polyline::new();
        pl.add_edge([7, 8]);
        pl.add_edge([8, 9]);
        let mut buf = Vec::new();
        pl.save(&mut buf).unwrap();

        let mut tokens = TokenReader::new(std::io::BufReader::new(buf.as_slice()));
        let restored = Polyline::read(&mut tokens).unwrap();
        assert_eq!(restored.verts(), pl.verts());
        assert_eq!(restored.is_closed(), pl.is_closed());
    }
}
