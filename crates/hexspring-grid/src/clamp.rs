//! Vertex clamps.
//!
//! A clamp pins a grid vertex to a geometric locus: nothing, a fixed
//! point, a plane, a line, a surface feature, or derived grid
//! geometry. The optimiser dispatches its gradient generator on the
//! clamp, and the splitter filters cells by how many corners carry
//! which clamps via the bitmask.

use std::io::Write;

use hexspring_math::{Vec3, FILE_PRECISION};
use hexspring_surface::{SurfaceModel, TokenReader};

use crate::edge::GridEdge;
use crate::face::GridFace;
use crate::tables::FaceNumber;

/// Bitmask values for clamp set-membership tests.
pub mod mask {
    /// Free vertex.
    pub const NONE: u32 = 1;
    /// Immovable vertex.
    pub const FIXED: u32 = 2;
    /// Pinned to a surface vertex.
    pub const VERT: u32 = 4;
    /// Constrained to a polyline segment.
    pub const EDGE: u32 = 8;
    /// Pinned to a surface triangle.
    pub const TRI: u32 = 16;
    /// Constrained to a plane.
    pub const PERPENDICULAR: u32 = 32;
    /// Constrained to a line.
    pub const PARALLEL: u32 = 64;
    /// Pinned to a grid edge midpoint.
    pub const CELL_EDGE_CENTER: u32 = 128;
    /// Pinned to a cell face centroid.
    pub const CELL_FACE_CENTER: u32 = 256;
    /// Constrained to the plane of three grid vertices.
    pub const GRID_TRI_PLANE: u32 = 512;
    /// Everything.
    pub const ANY: u32 = u32::MAX;
}

/// The geometric locus a grid vertex is pinned to.
#[derive(Debug, Clone, PartialEq)]
pub enum Clamp {
    /// Free to move anywhere.
    None,
    /// May not move at all.
    Fixed,
    /// May move only in the plane perpendicular to the stored normal.
    Perpendicular(Vec3),
    /// May move only along the stored direction.
    Parallel(Vec3),
    /// Pinned to a surface vertex (treated as fixed).
    Vert {
        /// Surface model index.
        model: usize,
        /// Surface vertex index.
        vert: usize,
    },
    /// Constrained to a polyline segment of a surface model.
    Edge {
        /// Surface model index.
        model: usize,
        /// Polyline number within the model.
        polyline: usize,
        /// Segment index within the polyline.
        segment: usize,
    },
    /// Pinned to a surface triangle.
    Tri {
        /// Surface model index.
        model: usize,
        /// The triangle's surface-vertex indices.
        verts: [usize; 3],
    },
    /// Constrained to the plane through three grid vertices.
    TriPlane([usize; 3]),
    /// Pinned to the midpoint of a grid edge.
    CellEdgeCenter(GridEdge),
    /// Pinned to the centroid of a cell face.
    CellFaceCenter(GridFace),
}

impl Default for Clamp {
    fn default() -> Self {
        Clamp::None
    }
}

impl Clamp {
    /// The bitmask bit of this clamp.
    pub fn mask(&self) -> u32 {
        match self {
            Clamp::None => mask::NONE,
            Clamp::Fixed => mask::FIXED,
            Clamp::Vert { .. } => mask::VERT,
            Clamp::Edge { .. } => mask::EDGE,
            Clamp::Tri { .. } => mask::TRI,
            Clamp::Perpendicular(_) => mask::PERPENDICULAR,
            Clamp::Parallel(_) => mask::PARALLEL,
            Clamp::CellEdgeCenter(_) => mask::CELL_EDGE_CENTER,
            Clamp::CellFaceCenter(_) => mask::CELL_FACE_CENTER,
            Clamp::TriPlane(_) => mask::GRID_TRI_PLANE,
        }
    }

    /// True when this clamp's bit is in `m`.
    pub fn matches(&self, m: u32) -> bool {
        self.mask() & m != 0
    }

    /// The constraint vector of a `Perpendicular` or `Parallel` clamp.
    pub fn vector(&self) -> Option<&Vec3> {
        match self {
            Clamp::Perpendicular(v) | Clamp::Parallel(v) => Some(v),
            _ => None,
        }
    }

    /// Serialisation token.
    pub fn token(&self) -> &'static str {
        match self {
            Clamp::None => "CLAMP_NONE",
            Clamp::Fixed => "CLAMP_FIXED",
            Clamp::Vert { .. } => "CLAMP_VERT",
            Clamp::Edge { .. } => "CLAMP_EDGE",
            Clamp::Tri { .. } => "CLAMP_TRI",
            Clamp::Perpendicular(_) => "CLAMP_PERPENDICULAR",
            Clamp::Parallel(_) => "CLAMP_PARALLEL",
            Clamp::CellEdgeCenter(_) => "CLAMP_CELL_EDGE_CENTER",
            Clamp::CellFaceCenter(_) => "CLAMP_CELL_FACE_CENTER",
            Clamp::TriPlane(_) => "CLAMP_GRID_TRI_PLANE",
        }
    }

    /// Write the `CT:` record with its payload line.
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "CT: {}", self.token())?;
        match self {
            Clamp::None | Clamp::Fixed => {}
            Clamp::Vert { model, vert } => writeln!(out, "  RI: {model} {vert}")?,
            Clamp::Edge {
                model,
                polyline,
                segment,
            } => writeln!(out, "  RI: {model} {polyline} {segment}")?,
            Clamp::Tri { model, verts } => {
                writeln!(out, "  RI: {model} {} {} {}", verts[0], verts[1], verts[2])?
            }
            Clamp::TriPlane(v) => writeln!(out, "  RI: {} {} {}", v[0], v[1], v[2])?,
            Clamp::CellEdgeCenter(edge) => {
                writeln!(out, "  RI: {} {}", edge.vert(0), edge.vert(1))?
            }
            Clamp::CellFaceCenter(face) => writeln!(
                out,
                "  RI: {} {}",
                face.cell_idx(),
                face.face_number().index()
            )?,
            Clamp::Perpendicular(v) | Clamp::Parallel(v) => writeln!(
                out,
                "  V: {:.prec$} {:.prec$} {:.prec$}",
                v.x,
                v.y,
                v.z,
                prec = FILE_PRECISION
            )?,
        }
        Ok(())
    }

    /// Read a `CT:` record. A missing payload line is a parse error.
    pub fn read(tokens: &mut TokenReader<'_>) -> hexspring_surface::Result<Self> {
        tokens.expect("CT:")?;
        let tag = tokens.require()?;
        let clamp = match tag.as_str() {
            "CLAMP_NONE" => Clamp::None,
            "CLAMP_FIXED" => Clamp::Fixed,
            "CLAMP_VERT" => {
                tokens.expect("RI:")?;
                Clamp::Vert {
                    model: tokens.parse()?,
                    vert: tokens.parse()?,
                }
            }
            "CLAMP_EDGE" => {
                tokens.expect("RI:")?;
                Clamp::Edge {
                    model: tokens.parse()?,
                    polyline: tokens.parse()?,
                    segment: tokens.parse()?,
                }
            }
            "CLAMP_TRI" => {
                tokens.expect("RI:")?;
                Clamp::Tri {
                    model: tokens.parse()?,
                    verts: [tokens.parse()?, tokens.parse()?, tokens.parse()?],
                }
            }
            "CLAMP_GRID_TRI_PLANE" => {
                tokens.expect("RI:")?;
                Clamp::TriPlane([tokens.parse()?, tokens.parse()?, tokens.parse()?])
            }
            "CLAMP_CELL_EDGE_CENTER" => {
                tokens.expect("RI:")?;
                let v0: usize = tokens.parse()?;
                let v1: usize = tokens.parse()?;
                Clamp::CellEdgeCenter(GridEdge::new(v0, v1))
            }
            "CLAMP_CELL_FACE_CENTER" => {
                tokens.expect("RI:")?;
                let cell: usize = tokens.parse()?;
                let face_idx: usize = tokens.parse()?;
                let face = FaceNumber::from_index(face_idx).ok_or_else(|| {
                    hexspring_surface::SurfaceError::Stream(format!(
                        "bad face number {face_idx} in clamp"
                    ))
                })?;
                Clamp::CellFaceCenter(GridFace::new(cell, face))
            }
            "CLAMP_PERPENDICULAR" | "CLAMP_PARALLEL" => {
                tokens.expect("V:")?;
                let v = Vec3::new(tokens.parse()?, tokens.parse()?, tokens.parse()?);
                if tag == "CLAMP_PERPENDICULAR" {
                    Clamp::Perpendicular(v)
                } else {
                    Clamp::Parallel(v)
                }
            }
            other => {
                return Err(hexspring_surface::SurfaceError::Stream(format!(
                    "unknown clamp type '{other}'"
                )))
            }
        };
        Ok(clamp)
    }

    /// True when every model/polyline/segment this clamp names exists.
    /// Grid-vertex references are checked by the grid's own verify.
    pub fn references_valid(&self, models: &[SurfaceModel]) -> bool {
        match self {
            Clamp::Vert { model, .. } | Clamp::Tri { model, .. } => *model < models.len(),
            Clamp::Edge {
                model,
                polyline,
                segment,
            } => {
                let Some(m) = models.get(*model) else {
                    return false;
                };
                if !m.polyline_exists(*polyline) {
                    return false;
                }
                m.polylines[*polyline].is_valid_index(*segment)
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(clamp: &Clamp) -> Clamp {
        let mut buf = Vec::new();
        clamp.save(&mut buf).unwrap();
        let mut tokens = TokenReader::new(std::io::BufReader::new(buf.as_slice()));
        Clamp::read(&mut tokens).unwrap()
    }

    #[test]
    fn test_masks_are_distinct_bits() {
        let all = [
            Clamp::None,
            Clamp::Fixed,
            Clamp::Perpendicular(Vec3::x()),
            Clamp::Parallel(Vec3::y()),
            Clamp::Vert { model: 0, vert: 0 },
            Clamp::Edge {
                model: 0,
                polyline: 0,
                segment: 0,
            },
            Clamp::Tri {
                model: 0,
                verts: [0, 1, 2],
            },
            Clamp::TriPlane([0, 1, 2]),
            Clamp::CellEdgeCenter(GridEdge::new(0, 1)),
            Clamp::CellFaceCenter(GridFace::new(0, FaceNumber::Top)),
        ];
        let mut seen = 0u32;
        for clamp in &all {
            let m = clamp.mask();
            assert_eq!(m.count_ones(), 1);
            assert_eq!(seen & m, 0, "duplicate mask bit for {clamp:?}");
            seen |= m;
        }
        assert!(all[0].matches(mask::NONE | mask::EDGE));
        assert!(!all[1].matches(mask::NONE | mask::EDGE));
    }

    #[test]
    fn test_save_read_round_trip() {
        let samples = [
            Clamp::None,
            Clamp::Fixed,
            Clamp::Perpendicular(Vec3::new(0.0, 0.0, 1.0)),
            Clamp::Parallel(Vec3::new(1.0, 0.0, 0.0)),
            Clamp::Vert { model: 2, vert: 17 },
            Clamp::Edge {
                model: 0,
                polyline: 3,
                segment: 5,
            },
            Clamp::TriPlane([4, 9, 12]),
            Clamp::CellEdgeCenter(GridEdge::new(7, 3)),
            Clamp::CellFaceCenter(GridFace::new(11, FaceNumber::Left)),
        ];
        for clamp in &samples {
            assert_eq!(&round_trip(clamp), clamp);
        }
    }
}
