//! Parallel relaxation passes.
//!
//! A pass is a three-phase barrier. Seed: every worker forks a full
//! copy of the canonical vertex state. Work: worker `w` optimises the
//! vertices with `index % workers == w` against its own copy; its
//! completed moves are parked in its stash by the optimiser's scoped
//! restore, and other workers' moves are invisible. Commit: for every
//! vertex whose stashed clamp kind matches the canonical one, the
//! stash becomes canonical and the change counter bumps. The spatial
//! index, cell store and tables are read-only during Work.

use hexspring_grid::{energy, minimize_vertex_energy, EnergyParams, Grid, VertState};
use hexspring_surface::SurfaceModel;
use rayon::prelude::*;

/// Aggregate motion and energy of one pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelaxStats {
    /// Largest single-vertex move.
    pub max_move: f64,
    /// Mean move over all vertices.
    pub avg_move: f64,
    /// Largest post-move vertex energy.
    pub max_energy: f64,
    /// Mean post-move vertex energy.
    pub avg_energy: f64,
}

struct WorkerOutput {
    stash: Vec<VertState>,
    max_move: f64,
    sum_move: f64,
    max_energy: f64,
    sum_energy: f64,
}

/// Run one Seed/Work/Commit relaxation pass.
///
/// The caller clears the vertex spatial index before a run of passes
/// and rebuilds it afterwards; Commit moves vertices without
/// consulting it.
pub fn relax_pass(
    grid: &mut Grid,
    models: &[SurfaceModel],
    params: &EnergyParams,
    num_workers: usize,
    clamp_mask: u32,
) -> RelaxStats {
    let num_workers = num_workers.max(1);
    let num_verts = grid.num_verts();

    // Seed: canonical state, cloned per worker below.
    let base: Vec<VertState> = (0..num_verts).map(|i| grid.vert(i).state()).collect();

    // Work: one task per worker over its round-robin partition.
    let grid_ref: &Grid = grid;
    let outputs: Vec<WorkerOutput> = (0..num_workers)
        .into_par_iter()
        .map(|worker| {
            let mut state = base.clone();
            let mut stash = base.clone();
            let mut out = WorkerOutput {
                stash: Vec::new(),
                max_move: 0.0,
                sum_move: 0.0,
                max_energy: 0.0,
                sum_energy: 0.0,
            };
            let mut vert_idx = worker;
            while vert_idx < num_verts {
                let moved = minimize_vertex_energy(
                    grid_ref,
                    models,
                    &mut state,
                    &mut stash[vert_idx],
                    vert_idx,
                    clamp_mask,
                    params,
                );
                out.max_move = out.max_move.max(moved);
                out.sum_move += moved;

                let e = energy::vertex_energy(grid_ref, &state, vert_idx, params);
                out.max_energy = out.max_energy.max(e);
                out.sum_energy += e;

                vert_idx += num_workers;
            }
            out.stash = stash;
            out
        })
        .collect();

    // Commit: adopt each vertex's owning worker's stash when the clamp
    // kind survived.
    for vert_idx in 0..num_verts {
        let owner = vert_idx % num_workers;
        let stash = &outputs[owner].stash[vert_idx];
        if stash.clamp.mask() == grid.vert(vert_idx).clamp().mask() {
            grid.vert_mut(vert_idx).apply_state(stash);
        } else {
            log::warn!(
                "vertex {vert_idx}: clamp kind changed mid-pass, discarding its move"
            );
        }
    }

    let mut stats = RelaxStats::default();
    for out in &outputs {
        stats.max_move = stats.max_move.max(out.max_move);
        stats.avg_move += out.sum_move;
        stats.max_energy = stats.max_energy.max(out.max_energy);
        stats.avg_energy += out.sum_energy;
    }
    if num_verts > 0 {
        stats.avg_move /= num_verts as f64;
        stats.avg_energy /= num_verts as f64;
    }
    stats
}

/// One round of derived-clamp enforcement: snap every CellEdgeCenter,
/// TriPlane and CellFaceCenter vertex back onto its locus. Returns the
/// mean correction distance.
pub fn enforce_derived_clamps(grid: &mut Grid) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for vert_idx in 0..grid.num_verts() {
        if let Some(dist) = grid.clamp_vertex(vert_idx) {
            total += dist.abs();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexspring_grid::Clamp;
    use hexspring_math::{BoundingBox, Vec3};

    fn lattice(n: f64) -> Grid {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(n, n, n)),
            1.0,
        );
        grid
    }

    #[test]
    fn test_pass_restores_displaced_centre() {
        let mut grid = lattice(2.0);
        // Fix everything except the body centre, then displace it.
        let centre = (0..grid.num_verts())
            .find(|&i| (grid.vert(i).pt() - Vec3::new(1.0, 1.0, 1.0)).norm() < 1e-9)
            .unwrap();
        for i in 0..grid.num_verts() {
            if i != centre {
                grid.vert_mut(i).set_clamp(Clamp::Fixed);
            }
        }
        grid.clear_vert_tree();
        grid.vert_mut(centre).set_pt(Vec3::new(1.2, 0.9, 1.1));

        let params = EnergyParams::default();
        for _ in 0..12 {
            relax_pass(&mut grid, &[], &params, 4, hexspring_grid::mask::ANY);
        }
        grid.rebuild_vert_tree();

        assert!(
            (grid.vert(centre).pt() - Vec3::new(1.0, 1.0, 1.0)).norm() < 1e-4,
            "centre ended at {:?}",
            grid.vert(centre).pt()
        );
        assert!(grid.verify(&[]));
    }

    #[test]
    fn test_pass_leaves_perfect_lattice_alone() {
        let mut grid = lattice(2.0);
        for i in 0..grid.num_verts() {
            if grid.vert(i).num_cells() == 1 {
                grid.vert_mut(i).set_clamp(Clamp::Fixed);
            }
        }
        let before: Vec<Vec3> = (0..grid.num_verts()).map(|i| *grid.vert(i).pt()).collect();
        grid.clear_vert_tree();
        let stats = relax_pass(
            &mut grid,
            &[],
            &EnergyParams::default(),
            4,
            hexspring_grid::mask::ANY,
        );
        grid.rebuild_vert_tree();
        assert!(stats.max_move < 1e-9);
        for (i, pt) in before.iter().enumerate() {
            assert!((grid.vert(i).pt() - pt).norm() < 1e-9);
        }
    }

    #[test]
    fn test_enforce_derived_clamps_snaps_midpoint() {
        let mut grid = lattice(2.0);
        // Mid-edge vertex clamped to the midpoint of the grid edge
        // between two corner verts, then nudged off it.
        let a = (0..grid.num_verts())
            .find(|&i| (grid.vert(i).pt() - Vec3::zeros()).norm() < 1e-9)
            .unwrap();
        let b = (0..grid.num_verts())
            .find(|&i| (grid.vert(i).pt() - Vec3::new(2.0, 0.0, 0.0)).norm() < 1e-9)
            .unwrap();
        let mid = (0..grid.num_verts())
            .find(|&i| (grid.vert(i).pt() - Vec3::new(1.0, 0.0, 0.0)).norm() < 1e-9)
            .unwrap();
        grid.vert_mut(mid)
            .set_clamp(Clamp::CellEdgeCenter(hexspring_grid::GridEdge::new(a, b)));
        grid.clear_vert_tree();
        grid.vert_mut(mid).set_pt(Vec3::new(1.1, 0.05, 0.0));

        let moved = enforce_derived_clamps(&mut grid);
        assert!(moved > 0.0);
        assert!((grid.vert(mid).pt() - Vec3::new(1.0, 0.0, 0.0)).norm() < 1e-9);
    }
}
