//! Diagnostic OBJ dumps of the grid.
//!
//! Writes the grid's cell faces as quads, optionally filtered to cells
//! with at least some number of clamped corners. Vertices carry a
//! colour keyed on their clamp tag (the `v x y z r g b` extension most
//! viewers accept).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hexspring_grid::{Clamp, FaceNumber, Grid, SearchableFace};

/// Diagnostic colour for a clamp tag.
fn clamp_color(clamp: &Clamp) -> [f32; 3] {
    match clamp {
        Clamp::None => [0.7, 0.7, 0.7],
        Clamp::Fixed => [1.0, 0.0, 0.0],
        Clamp::Parallel(_) => [1.0, 0.5, 0.0],
        Clamp::Perpendicular(_) => [1.0, 1.0, 0.0],
        Clamp::Vert { .. } => [1.0, 0.0, 1.0],
        Clamp::Edge { .. } => [0.0, 0.0, 1.0],
        Clamp::Tri { .. } => [0.0, 1.0, 1.0],
        Clamp::CellEdgeCenter(_) => [0.0, 1.0, 0.0],
        Clamp::CellFaceCenter(_) => [0.0, 0.5, 0.0],
        Clamp::TriPlane(_) => [0.5, 0.0, 1.0],
    }
}

/// Writes OBJ dumps of a grid into a directory.
pub struct DumpObj {
    dir: PathBuf,
}

impl DumpObj {
    /// A dumper writing into `dir` (created on demand).
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Write `<name>.obj` with the faces of every cell having at least
    /// `min_clamps` corners matching `clamp_mask`. Faces shared by two
    /// selected cells are written once.
    pub fn write(
        &self,
        grid: &Grid,
        name: &str,
        min_clamps: usize,
        clamp_mask: u32,
    ) -> std::io::Result<PathBuf> {
        let cells: Vec<usize> = grid
            .live_cell_ids()
            .into_iter()
            .filter(|&id| grid.cell(id).num_clamped(grid, clamp_mask) >= min_clamps)
            .collect();
        self.write_cells(grid, name, &cells)
    }

    /// Write `<name>.obj` for an explicit cell list.
    pub fn write_cells(
        &self,
        grid: &Grid,
        name: &str,
        cells: &[usize],
    ) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{name}.obj"));
        let mut out = BufWriter::new(File::create(&path)?);

        let mut faces: BTreeSet<SearchableFace> = BTreeSet::new();
        for &cell_id in cells {
            let cell = grid.cell(cell_id);
            for face in FaceNumber::ALL {
                faces.insert(cell.searchable_face(face));
            }
        }

        // Remap the used vertices to a compact 1-based OBJ index.
        let mut vert_map: BTreeMap<usize, usize> = BTreeMap::new();
        for face in &faces {
            for &v in face.sorted_indices() {
                let next = vert_map.len() + 1;
                vert_map.entry(v).or_insert(next);
            }
        }

        writeln!(out, "# hexspring grid dump: {} faces", faces.len())?;
        let mut ordered: Vec<(usize, usize)> = vert_map.iter().map(|(&v, &i)| (i, v)).collect();
        ordered.sort_unstable();
        for (_, vert_idx) in ordered {
            let pt = grid.vert(vert_idx).pt();
            let [r, g, b] = clamp_color(grid.vert(vert_idx).clamp());
            writeln!(
                out,
                "v {} {} {} {r} {g} {b}",
                pt.x, pt.y, pt.z
            )?;
        }
        for face in &faces {
            let idx = face.face().vert_indices(grid);
            writeln!(
                out,
                "f {} {} {} {}",
                vert_map[&idx[0]], vert_map[&idx[1]], vert_map[&idx[2]], vert_map[&idx[3]]
            )?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexspring_math::{BoundingBox, Vec3};

    #[test]
    fn test_dump_writes_unique_faces() {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(2.0, 2.0, 2.0)),
            1.0,
        );
        let dir = std::env::temp_dir().join("hexspring_dump_test");
        let dump = DumpObj::new(&dir);
        let path = dump.write(&grid, "lattice", 0, hexspring_grid::mask::ANY).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let n_verts = text.lines().filter(|l| l.starts_with("v ")).count();
        let n_faces = text.lines().filter(|l| l.starts_with("f ")).count();
        assert_eq!(n_verts, 27);
        // 8 cells x 6 faces with 12 interior faces shared once each.
        assert_eq!(n_faces, 36);
        std::fs::remove_dir_all(&dir).ok();
    }
}
