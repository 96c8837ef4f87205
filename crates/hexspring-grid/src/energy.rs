//! The spring energy model.
//!
//! A cell's energy is a compression term over its 12 edges (quadratic
//! in the deviation from the rest length) plus a bend term over its 8
//! corners (quadratic in each corner triad's deviation from
//! orthogonality). A vertex's energy is the sum over the cells that
//! use it.

use hexspring_math::{check_finite, safe_normalize, Vec3};

use crate::cell::GridCell;
use crate::grid::Grid;
use crate::state::{Overlay, Positions};
use crate::tables::{CellVertPos, ORIENTED_CORNER_EDGES};

/// Per-edge compression spring constant.
const COMPRESSION_K: f64 = 10.0;

/// Per-corner-pair bend spring constant.
const BEND_K: f64 = 1000.0;

/// Bend energies above this are treated as numerical errors.
const MAX_BEND_ENERGY: f64 = 1.0e5;

/// Weights and exponents combining the two energy terms.
#[derive(Debug, Clone, Copy)]
pub struct EnergyParams {
    /// Coefficient on the compression term.
    pub k_compress: f64,
    /// Exponent on the compression term.
    pub p_compress: f64,
    /// Coefficient on the bend term.
    pub k_bend: f64,
    /// Exponent on the bend term.
    pub p_bend: f64,
}

impl Default for EnergyParams {
    fn default() -> Self {
        Self {
            k_compress: 0.001,
            p_compress: 2.0,
            k_bend: 1.0,
            p_bend: 1.0,
        }
    }
}

impl EnergyParams {
    /// Combine raw bend and compression sums into a cell total.
    fn total(&self, bend: f64, compression: f64) -> f64 {
        self.k_bend * bend.powf(self.p_bend) + self.k_compress * compression.powf(self.p_compress)
    }
}

/// Compression energy of one cell: `k·(len − rest)²` per edge.
pub fn cell_compression_energy<P: Positions + ?Sized>(cell: &GridCell, pos: &P) -> f64 {
    let mut total = 0.0;
    for edge_num in 0..12 {
        let rest = cell.rest_edge_length(edge_num);
        let len = cell.edge(edge_num).length(pos);
        let delta = len - rest;
        let e = COMPRESSION_K * delta * delta;
        check_finite(e);
        total += e;
    }
    total
}

/// Bend energy of one cell: for each corner, the three outgoing edge
/// directions in the fixed right-handed ordering; for each cyclic pair
/// `(a, b)` with third edge `c`, `θ = atan2(|(a×b)×c|, (a×b)·c)` and
/// the penalty is `k·(θ/π)²`.
pub fn cell_bend_energy<P: Positions + ?Sized>(cell: &GridCell, pos: &P) -> f64 {
    let mut total = 0.0;
    for corner in CellVertPos::ALL {
        let pt0 = pos.pt(cell.vert_idx(corner));
        let mut dirs = [Vec3::zeros(); 3];
        for (i, &other) in ORIENTED_CORNER_EDGES[corner.index()].iter().enumerate() {
            let v = pos.pt(cell.vert_idx(other)) - pt0;
            dirs[i] = safe_normalize(&v).unwrap_or_else(Vec3::zeros);
        }
        for i in 0..3 {
            let a = &dirs[i];
            let b = &dirs[(i + 1) % 3];
            let c = &dirs[(i + 2) % 3];
            let normal = a.cross(b);
            let cos = normal.dot(c);
            let sin = normal.cross(c).norm();
            check_finite(cos);
            check_finite(sin);
            let theta = sin.atan2(cos) / std::f64::consts::PI;
            total += BEND_K * theta * theta;
        }
    }
    if total > MAX_BEND_ENERGY {
        panic!("bend energy {total} out of bounds");
    }
    total
}

/// Total energy of one cell.
pub fn cell_energy<P: Positions + ?Sized>(cell: &GridCell, pos: &P, params: &EnergyParams) -> f64 {
    let bend = if params.k_bend > 0.0 {
        cell_bend_energy(cell, pos)
    } else {
        0.0
    };
    let compression = if params.k_compress > 0.0 {
        cell_compression_energy(cell, pos)
    } else {
        0.0
    };
    params.total(bend, compression)
}

/// Total energy of every cell using `vert_idx`.
pub fn vertex_energy<P: Positions + ?Sized>(
    grid: &Grid,
    pos: &P,
    vert_idx: usize,
    params: &EnergyParams,
) -> f64 {
    grid.vert(vert_idx)
        .cell_indices()
        .iter()
        .map(|&ci| cell_energy(grid.cell(ci), pos, params))
        .sum()
}

/// Bend-only energy of every cell using `vert_idx`.
pub fn vertex_bend_energy<P: Positions + ?Sized>(grid: &Grid, pos: &P, vert_idx: usize) -> f64 {
    grid.vert(vert_idx)
        .cell_indices()
        .iter()
        .map(|&ci| cell_bend_energy(grid.cell(ci), pos))
        .sum()
}

/// Vertex energy with the vertex probed at `at_pt` instead of its
/// stored position.
pub fn vertex_energy_at<P: Positions + ?Sized>(
    grid: &Grid,
    pos: &P,
    vert_idx: usize,
    at_pt: &Vec3,
    params: &EnergyParams,
) -> f64 {
    let overlay = Overlay::new(pos, vert_idx, *at_pt);
    vertex_energy(grid, &overlay, vert_idx, params)
}

/// Bend-only vertex energy probed at `at_pt`.
pub fn vertex_bend_energy_at<P: Positions + ?Sized>(
    grid: &Grid,
    pos: &P,
    vert_idx: usize,
    at_pt: &Vec3,
) -> f64 {
    let overlay = Overlay::new(pos, vert_idx, *at_pt);
    vertex_bend_energy(grid, &overlay, vert_idx)
}

/// Total energy over every live cell.
pub fn total_grid_energy(grid: &Grid, params: &EnergyParams) -> f64 {
    grid.live_cell_ids()
        .into_iter()
        .map(|ci| cell_energy(grid.cell(ci), grid, params))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexspring_math::BoundingBox;
    use approx::assert_relative_eq;

    fn lattice(n: f64) -> Grid {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(n, n, n)),
            1.0,
        );
        grid
    }

    #[test]
    fn test_perfect_lattice_has_zero_energy() {
        let grid = lattice(2.0);
        let params = EnergyParams::default();
        assert_relative_eq!(total_grid_energy(&grid, &params), 0.0, epsilon = 1e-18);
    }

    #[test]
    fn test_stretched_edge_costs_compression() {
        let grid = lattice(1.0);
        let cell = grid.cell(0);
        // Probe a corner pulled outward along x by 0.1.
        let e = vertex_energy_at(
            &grid,
            &grid,
            cell.vert_idx(crate::tables::CellVertPos::LwrFntLft),
            &Vec3::new(-0.1, 0.0, 0.0),
            &EnergyParams {
                k_bend: 0.0,
                ..Default::default()
            },
        );
        // Three edges leave that corner; only the x edge is stretched
        // by exactly 0.1, the other two by sqrt(1.01)-1 each.
        assert!(e > 0.0);
        let x_only = 10.0 * 0.1 * 0.1;
        assert!(e >= 0.001 * (x_only * x_only) * 0.99);
    }

    #[test]
    fn test_sheared_cell_costs_bend() {
        let grid = lattice(1.0);
        let idx = grid.cell(0).vert_idx(crate::tables::CellVertPos::UprFntLft);
        let params = EnergyParams {
            k_compress: 0.0,
            ..Default::default()
        };
        let straight = vertex_energy(&grid, &grid, idx, &params);
        assert_relative_eq!(straight, 0.0, epsilon = 1e-18);
        let sheared = vertex_energy_at(&grid, &grid, idx, &Vec3::new(0.3, 0.0, 1.0), &params);
        assert!(sheared > 0.0);
    }

    #[test]
    fn test_energy_probe_does_not_mutate() {
        let grid = lattice(1.0);
        let before = *grid.vert(0).pt();
        let _ = vertex_energy_at(&grid, &grid, 0, &Vec3::new(0.2, 0.2, 0.2), &EnergyParams::default());
        assert_eq!(*grid.vert(0).pt(), before);
    }

    #[test]
    #[should_panic]
    fn test_bend_energy_guard_panics_on_degenerate() {
        let grid = lattice(1.0);
        // Collapse a corner onto the body diagonal far outside: the
        // triads invert and the guard trips via non-finite/overflow…
        // use a NaN probe to hit the finite check deterministically.
        let _ = vertex_energy_at(
            &grid,
            &grid,
            0,
            &Vec3::new(f64::NAN, 0.0, 0.0),
            &EnergyParams::default(),
        );
    }
}
