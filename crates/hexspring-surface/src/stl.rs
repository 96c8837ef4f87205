//! STL input, ASCII and binary.
//!
//! Both forms produce a [`TriangleSurface`] with coincident vertices
//! merged, since STL stores disconnected triangle soup.

use std::fs;
use std::path::Path;

use hexspring_math::Vec3;

use crate::error::{Result, SurfaceError};
use crate::TriangleSurface;

/// Read an STL file, auto-detecting ASCII vs binary.
pub fn read_stl(path: &Path) -> Result<TriangleSurface> {
    let bytes = fs::read(path)?;
    if is_binary(&bytes) {
        read_binary(&bytes)
    } else {
        read_ascii(std::str::from_utf8(&bytes).map_err(|_| {
            SurfaceError::stl(0, "file is neither valid binary STL nor UTF-8 text")
        })?)
    }
}

/// True when the byte length matches the binary layout exactly.
/// "solid" prefixes lie; the length test does not.
fn is_binary(bytes: &[u8]) -> bool {
    if bytes.len() < 84 {
        return false;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    bytes.len() == 84 + count * 50
}

/// Parse binary STL: 80-byte header, u32 triangle count, then 50-byte
/// records of normal + three vertices (f32 each) + attribute count.
pub fn read_binary(bytes: &[u8]) -> Result<TriangleSurface> {
    if bytes.len() < 84 {
        return Err(SurfaceError::stl(0, "binary STL shorter than its header"));
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    if bytes.len() != 84 + count * 50 {
        return Err(SurfaceError::stl(
            0,
            format!("binary STL length mismatch for {count} triangles"),
        ));
    }

    let f32_at = |offset: usize| -> f64 {
        f32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as f64
    };

    let mut soup = Vec::with_capacity(count);
    for i in 0..count {
        let rec = 84 + i * 50;
        // Skip the stored normal; it is rederived from the winding.
        let mut tri = [Vec3::zeros(); 3];
        for (v, corner) in tri.iter_mut().enumerate() {
            let base = rec + 12 + v * 12;
            *corner = Vec3::new(f32_at(base), f32_at(base + 4), f32_at(base + 8));
        }
        soup.push(tri);
    }
    Ok(TriangleSurface::from_triangles(&soup))
}

/// Parse ASCII STL.
pub fn read_ascii(text: &str) -> Result<TriangleSurface> {
    let mut soup: Vec<[Vec3; 3]> = Vec::new();
    let mut tri: Vec<Vec3> = Vec::new();
    let mut in_solid = false;

    for (line_no, raw) in text.lines().enumerate() {
        let line_no = line_no + 1;
        let mut words = raw.split_whitespace();
        let Some(keyword) = words.next() else {
            continue;
        };
        match keyword {
            "solid" => in_solid = true,
            "endsolid" => in_solid = false,
            "facet" | "outer" | "endloop" => {}
            "endfacet" => {
                if tri.len() != 3 {
                    return Err(SurfaceError::stl(
                        line_no,
                        format!("facet closed with {} vertices", tri.len()),
                    ));
                }
                soup.push([tri[0], tri[1], tri[2]]);
                tri.clear();
            }
            "vertex" => {
                if !in_solid {
                    return Err(SurfaceError::stl(line_no, "vertex outside solid"));
                }
                let mut coords = [0.0f64; 3];
                for c in coords.iter_mut() {
                    let word = words
                        .next()
                        .ok_or_else(|| SurfaceError::stl(line_no, "vertex with missing coordinate"))?;
                    *c = word.parse().map_err(|_| {
                        SurfaceError::stl(line_no, format!("malformed coordinate '{word}'"))
                    })?;
                }
                if tri.len() == 3 {
                    return Err(SurfaceError::stl(line_no, "more than 3 vertices in facet"));
                }
                tri.push(Vec3::new(coords[0], coords[1], coords[2]));
            }
            other => {
                return Err(SurfaceError::stl(
                    line_no,
                    format!("unexpected keyword '{other}'"),
                ));
            }
        }
    }

    if soup.is_empty() {
        return Err(SurfaceError::Degenerate("STL contains no triangles".into()));
    }
    Ok(TriangleSurface::from_triangles(&soup))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TETRA_ASCII: &str = "\
solid tetra
  facet normal 0 0 -1
    outer loop
      vertex 0 0 0
      vertex 0 1 0
      vertex 1 0 0
    endloop
  endfacet
  facet normal 0 -1 0
    outer loop
      vertex 0 0 0
      vertex 1 0 0
      vertex 0 0 1
    endloop
  endfacet
  facet normal -1 0 0
    outer loop
      vertex 0 0 0
      vertex 0 0 1
      vertex 0 1 0
    endloop
  endfacet
  facet normal 1 1 1
    outer loop
      vertex 1 0 0
      vertex 0 1 0
      vertex 0 0 1
    endloop
  endfacet
endsolid tetra
";

    #[test]
    fn test_ascii_tetrahedron() {
        let surface = read_ascii(TETRA_ASCII).unwrap();
        assert_eq!(surface.num_tris(), 4);
        assert_eq!(surface.num_verts(), 4);
        assert_eq!(surface.num_edges(), 6);
        assert!(surface.is_closed());
    }

    #[test]
    fn test_ascii_malformed_vertex() {
        let bad = "solid s\nfacet normal 0 0 1\nouter loop\nvertex 0 zero 0\n";
        let err = read_ascii(bad).unwrap_err();
        assert!(matches!(err, SurfaceError::Stl { line: 4, .. }));
    }

    fn binary_from(soup: &[[f32; 9]]) -> Vec<u8> {
        let mut bytes = vec![0u8; 80];
        bytes.extend_from_slice(&(soup.len() as u32).to_le_bytes());
        for tri in soup {
            bytes.extend_from_slice(&[0u8; 12]); // normal
            for f in tri {
                bytes.extend_from_slice(&f.to_le_bytes());
            }
            bytes.extend_from_slice(&[0u8; 2]); // attribute count
        }
        bytes
    }

    #[test]
    fn test_binary_round_trip() {
        let soup = [
            [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0],
        ];
        let bytes = binary_from(&soup);
        assert!(is_binary(&bytes));
        let surface = read_binary(&bytes).unwrap();
        assert_eq!(surface.num_tris(), 2);
        assert_eq!(surface.num_verts(), 4); // shared diagonal merged
    }

    #[test]
    fn test_binary_length_mismatch() {
        let mut bytes = binary_from(&[[0.0; 9]]);
        bytes.pop();
        assert!(!is_binary(&bytes));
        assert!(read_binary(&bytes).is_err());
    }
}
