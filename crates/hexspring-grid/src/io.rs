//! Versioned text save/read of the grid.
//!
//! ```text
//! GridBase version 1
//! Verts <N>
//!   (VT:/PT:/CI:/CT: records)*
//! CellIndexMap <M>        # deleted logical ids omitted
//!   (<logicalId> <storageIdx>)*
//! Cells <K>
//!   (ID:/REL:/VI: records)*
//! ```

use std::io::Write;

use hexspring_surface::{Result, SurfaceError, TokenReader};

use crate::cell::GridCell;
use crate::grid::Grid;
use crate::vert::GridVert;

impl Grid {
    /// Write the grid stream.
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "GridBase version 1")?;

        writeln!(out, "Verts {}", self.num_verts())?;
        for vert_idx in 0..self.num_verts() {
            self.vert(vert_idx).save(out)?;
        }

        writeln!(out, "CellIndexMap {}", self.num_cells())?;
        for cell_id in self.live_cell_ids() {
            writeln!(out, "{} {}", cell_id, self.storage_index(cell_id))?;
        }

        writeln!(out, "Cells {}", self.num_live_cells())?;
        for storage_idx in 0..self.num_live_cells() {
            self.cell_at_storage(storage_idx).save(out)?;
        }
        Ok(())
    }

    /// Read a grid stream written by [`save`](Self::save). The vertex
    /// spatial index is rebuilt from the read positions.
    pub fn read(tokens: &mut TokenReader<'_>) -> Result<Self> {
        tokens.expect("GridBase")?;
        tokens.expect("version")?;
        let version: u32 = tokens.parse()?;
        if version != 1 {
            return Err(SurfaceError::Stream(format!(
                "unsupported grid version {version}"
            )));
        }

        tokens.expect("Verts")?;
        let num_verts: usize = tokens.parse()?;
        let mut verts = Vec::with_capacity(num_verts);
        for i in 0..num_verts {
            let vert = GridVert::read(tokens)?;
            if vert.index() != i {
                return Err(SurfaceError::Stream(format!(
                    "vertex {i} stored with index {}",
                    vert.index()
                )));
            }
            verts.push(vert);
        }

        tokens.expect("CellIndexMap")?;
        let map_len: usize = tokens.parse()?;
        let mut cell_index_map: Vec<Option<usize>> = vec![None; map_len];
        // Live entries run until the Cells sentinel.
        let num_cells: usize = loop {
            let tok = tokens.require()?;
            if tok == "Cells" {
                break tokens.parse()?;
            }
            let logical: usize = tok
                .parse()
                .map_err(|_| SurfaceError::Stream(format!("malformed map entry '{tok}'")))?;
            let storage: usize = tokens.parse()?;
            if logical >= map_len {
                return Err(SurfaceError::Stream(format!(
                    "cell map entry {logical} out of range {map_len}"
                )));
            }
            cell_index_map[logical] = Some(storage);
        };

        let mut cell_storage = Vec::with_capacity(num_cells);
        for _ in 0..num_cells {
            cell_storage.push(GridCell::read(tokens)?);
        }

        for (logical, entry) in cell_index_map.iter().enumerate() {
            if let Some(storage) = entry {
                if *storage >= cell_storage.len() {
                    return Err(SurfaceError::Stream(format!(
                        "cell {logical} maps to missing storage slot {storage}"
                    )));
                }
                if cell_storage[*storage].id() != logical {
                    return Err(SurfaceError::Stream(format!(
                        "cell map entry {logical} disagrees with stored id {}",
                        cell_storage[*storage].id()
                    )));
                }
            }
        }

        let mut grid = Grid::from_parts(verts, cell_index_map, cell_storage);
        grid.rebuild_vert_tree();
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexspring_math::{BoundingBox, Vec3};

    fn lattice(n: f64) -> Grid {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(n, n, n)),
            1.0,
        );
        grid
    }

    fn round_trip(grid: &Grid) -> Grid {
        let mut buf = Vec::new();
        grid.save(&mut buf).unwrap();
        let mut tokens = TokenReader::new(std::io::BufReader::new(buf.as_slice()));
        Grid::read(&mut tokens).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_everything() {
        let grid = lattice(2.0);
        let restored = round_trip(&grid);

        assert_eq!(restored.num_verts(), grid.num_verts());
        assert_eq!(restored.num_cells(), grid.num_cells());
        assert_eq!(restored.num_live_cells(), grid.num_live_cells());
        for i in 0..grid.num_verts() {
            assert!((restored.vert(i).pt() - grid.vert(i).pt()).norm() < 1e-12);
            assert_eq!(restored.vert(i).clamp(), grid.vert(i).clamp());
            assert_eq!(restored.vert(i).cell_indices(), grid.vert(i).cell_indices());
        }
        assert!(restored.verify(&[]));
    }

    #[test]
    fn test_round_trip_with_deleted_cells() {
        let mut grid = lattice(2.0);
        grid.delete_cell(2);
        grid.delete_cell(5);
        let restored = round_trip(&grid);

        assert_eq!(restored.num_cells(), 8);
        assert_eq!(restored.num_live_cells(), 6);
        assert!(!restored.cell_exists(2));
        assert!(!restored.cell_exists(5));
        for id in grid.live_cell_ids() {
            assert_eq!(restored.cell(id).id(), id);
        }
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let grid = lattice(1.0);
        let mut buf = Vec::new();
        grid.save(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        let mut tokens = TokenReader::new(std::io::BufReader::new(buf.as_slice()));
        assert!(Grid::read(&mut tokens).is_err());
    }
}
