//! Grid vertices.

use std::io::Write;

use hexspring_math::{check_finite, Vec3, FILE_PRECISION};
use hexspring_surface::{Result, SurfaceError, TokenReader};

use crate::clamp::Clamp;
use crate::state::VertState;

/// A vertex of the hexahedral grid: position, clamp, and back-links to
/// every cell that uses it as a corner.
#[derive(Debug, Clone)]
pub struct GridVert {
    index: usize,
    pt: Vec3,
    clamp: Clamp,
    cell_indices: Vec<usize>,
    change_number: u64,
}

impl GridVert {
    /// A vertex with a stable index and position.
    pub fn new(index: usize, pt: Vec3) -> Self {
        Self {
            index,
            pt,
            clamp: Clamp::None,
            cell_indices: Vec::new(),
            change_number: 1,
        }
    }

    /// The vertex's stable index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current position.
    pub fn pt(&self) -> &Vec3 {
        &self.pt
    }

    /// Move the vertex, bumping the change counter. The caller keeps
    /// the spatial index in step.
    pub fn set_pt(&mut self, pt: Vec3) {
        check_finite(pt.x);
        check_finite(pt.y);
        check_finite(pt.z);
        self.pt = pt;
        self.change_number += 1;
    }

    /// The vertex's clamp.
    pub fn clamp(&self) -> &Clamp {
        &self.clamp
    }

    /// Replace the clamp.
    pub fn set_clamp(&mut self, clamp: Clamp) {
        self.clamp = clamp;
    }

    /// Monotonic change counter; bumps on every position commit.
    pub fn change_number(&self) -> u64 {
        self.change_number
    }

    /// Bump the change counter without moving (used by Commit when
    /// adopting a worker's result).
    pub(crate) fn bump_change_number(&mut self) {
        self.change_number += 1;
    }

    /// The cells using this vertex, in insertion order.
    pub fn cell_indices(&self) -> &[usize] {
        &self.cell_indices
    }

    /// Number of cells using this vertex.
    pub fn num_cells(&self) -> usize {
        self.cell_indices.len()
    }

    /// Record a cell back-link. Duplicates are ignored.
    pub(crate) fn add_cell_index(&mut self, cell_idx: usize) {
        if !self.cell_indices.contains(&cell_idx) {
            self.cell_indices.push(cell_idx);
        }
    }

    /// Drop a cell back-link.
    pub(crate) fn remove_cell_index(&mut self, cell_idx: usize) {
        self.cell_indices.retain(|&c| c != cell_idx);
    }

    /// True when this vertex lists `cell_idx`.
    pub fn linked_to_cell(&self, cell_idx: usize) -> bool {
        self.cell_indices.contains(&cell_idx)
    }

    /// The vertex's relaxation state (position + clamp).
    pub fn state(&self) -> VertState {
        VertState {
            pt: self.pt,
            clamp: self.clamp.clone(),
        }
    }

    /// Adopt a relaxation state, bumping the change counter.
    pub fn apply_state(&mut self, state: &VertState) {
        self.pt = state.pt;
        self.clamp = state.clamp.clone();
        self.change_number += 1;
    }

    /// Write the `VT:` record.
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "VT: {}", self.index)?;
        writeln!(
            out,
            "PT: {:.prec$} {:.prec$} {:.prec$}",
            self.pt.x,
            self.pt.y,
            self.pt.z,
            prec = FILE_PRECISION
        )?;
        write!(out, "CI:")?;
        for ci in &self.cell_indices {
            write!(out, " {ci}")?;
        }
        writeln!(out)?;
        self.clamp.save(out)
    }

    /// Read a `VT:` record.
    pub fn read(tokens: &mut TokenReader<'_>) -> Result<Self> {
        tokens.expect("VT:")?;
        let index: usize = tokens.parse()?;
        tokens.expect("PT:")?;
        let pt = Vec3::new(tokens.parse()?, tokens.parse()?, tokens.parse()?);
        tokens.expect("CI:")?;
        let mut cell_indices = Vec::new();
        for word in tokens.take_line() {
            let ci: usize = word
                .parse()
                .map_err(|_| SurfaceError::Stream(format!("malformed cell index '{word}'")))?;
            cell_indices.push(ci);
        }
        let clamp = Clamp::read(tokens)?;
        Ok(Self {
            index,
            pt,
            clamp,
            cell_indices,
            change_number: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_links_no_duplicates() {
        let mut vert = GridVert::new(0, Vec3::zeros());
        vert.add_cell_index(3);
        vert.add_cell_index(5);
        vert.add_cell_index(3);
        assert_eq!(vert.cell_indices(), &[3, 5]);
        vert.remove_cell_index(3);
        assert_eq!(vert.cell_indices(), &[5]);
        assert!(vert.linked_to_cell(5));
        assert!(!vert.linked_to_cell(3));
    }

    #[test]
    fn test_change_counter() {
        let mut vert = GridVert::new(0, Vec3::zeros());
        let n = vert.change_number();
        vert.set_pt(Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(vert.change_number(), n + 1);
    }

    #[test]
    #[should_panic]
    fn test_nan_position_panics() {
        let mut vert = GridVert::new(0, Vec3::zeros());
        vert.set_pt(Vec3::new(f64::NAN, 0.0, 0.0));
    }

    #[test]
    fn test_save_read_round_trip() {
        let mut vert = GridVert::new(12, Vec3::new(0.5, -1.25, 3.0));
        vert.add_cell_index(2);
        vert.add_cell_index(9);
        vert.set_clamp(Clamp::Parallel(Vec3::new(0.0, 1.0, 0.0)));

        let mut buf = Vec::new();
        vert.save(&mut buf).unwrap();
        let mut tokens = TokenReader::new(std::io::BufReader::new(buf.as_slice()));
        let restored = GridVert::read(&mut tokens).unwrap();

        assert_eq!(restored.index(), 12);
        assert_eq!(restored.cell_indices(), vert.cell_indices());
        assert_eq!(restored.clamp(), vert.clamp());
        assert!((restored.pt() - vert.pt()).norm() < 1e-12);
    }
}
