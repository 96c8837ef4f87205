//! One-vertex steepest-descent optimisation.
//!
//! A generic quadratic-line-search descender plus one gradient
//! generator per clamp tag. The gradient generator returns a unit
//! direction and the largest step the clamp geometry allows before a
//! discontinuity (`f64::MAX` when unbounded, `0` to stop).

use hexspring_math::{
    safe_normalize, Vec3, AXIS_X, AXIS_Y, AXIS_Z, MIN_NORMALIZE_DIVISOR, OPTIMIZER_TOL,
    SAME_DIST_TOL,
};
use hexspring_surface::SurfaceModel;

use crate::clamp::{mask, Clamp};
use crate::energy::{vertex_energy_at, EnergyParams};
use crate::grid::Grid;
use crate::state::VertState;

/// Per-vertex optimiser iteration cap.
pub const MAX_OPTIMIZER_STEPS: usize = 10;

/// Quadratic line-search steepest descent over a 3D point.
#[derive(Debug, Clone, Copy)]
pub struct SteepestDescent {
    /// Finite-difference step for slope and curvature probes.
    pub differential: f64,
}

impl Default for SteepestDescent {
    fn default() -> Self {
        Self {
            differential: 1.0e-8,
        }
    }
}

/// Stationary-point offset of the parabola fitted through
/// `f(p − h·g), f(p), f(p + h·g)`. Zero when the value or curvature is
/// numerically flat; panics on a non-finite result.
pub fn calc_move_dist<V: Fn(&Vec3) -> f64>(cur: &Vec3, dt: f64, gradient: &Vec3, value: &V) -> f64 {
    let val1 = value(cur);
    if val1.abs() < MIN_NORMALIZE_DIVISOR {
        return 0.0;
    }
    let val0 = value(&(cur - dt * gradient)) - val1;
    let val2 = value(&(cur + dt * gradient)) - val1;

    let a = (val2 + val0) / (2.0 * dt * dt);
    if a.abs() < MIN_NORMALIZE_DIVISOR {
        return 0.0;
    }
    let b = (val2 - val0) / (2.0 * dt);
    let move_dist = -b / (2.0 * a);
    if !move_dist.is_finite() {
        panic!("non-finite line-search step");
    }
    move_dist
}

impl SteepestDescent {
    /// Descend from `cur`.
    ///
    /// `grad` may reposition `cur` (a clamp snapping the point back
    /// onto its locus) and returns `(direction, max_dist)`;
    /// `max_dist == 0` stops. The offset is clamped to
    /// `0.2 · max_change` and then to `max_dist` (stepping exactly
    /// `max_dist` and re-consulting the generator when the geometric
    /// limit is hit). Stops when the cumulative move exceeds
    /// `max_change`. Returns the total distance moved.
    pub fn run<V, G, L>(
        &self,
        cur: &mut Vec3,
        max_steps: usize,
        max_change: f64,
        value: &V,
        mut grad: G,
        mut log: L,
    ) -> f64
    where
        V: Fn(&Vec3) -> f64,
        G: FnMut(&mut Vec3, f64) -> (Vec3, f64),
        L: FnMut(usize, f64),
    {
        let start = *cur;
        let max_step = 0.2 * max_change;
        let mut move_dist = f64::MAX;
        let mut count = 0;
        while count < max_steps && move_dist > OPTIMIZER_TOL {
            let (gradient, max_dist) = grad(cur, self.differential);
            if max_dist == 0.0 {
                // The generator found no direction to move in.
                break;
            }

            move_dist = calc_move_dist(cur, self.differential, &gradient, value);
            if move_dist > max_step {
                move_dist = max_step;
            }

            if move_dist > max_dist {
                // Ran onto a geometric discontinuity (a model vertex
                // or edge); step to it and let the generator decide.
                *cur += max_dist * gradient;
                count += 1;
                continue;
            }

            let next = *cur + move_dist * gradient;
            if (next - start).norm() > max_change {
                break;
            }
            *cur = next;
            log(count, move_dist);
            count += 1;
        }
        (*cur - start).norm()
    }
}

/// Bitmask of the clamps the optimiser can move at all.
const MOVABLE_MASK: u32 =
    mask::NONE | mask::EDGE | mask::PERPENDICULAR | mask::PARALLEL | mask::GRID_TRI_PLANE;

/// Optimise one vertex against a relaxation state.
///
/// Reads and writes only `state`; the grid supplies topology and rest
/// lengths, `models` back the edge clamps. On exit the optimised
/// `(position, clamp)` is in `*stash` and `state[vert_idx]` is
/// restored to its entry value, so concurrent evaluations of other
/// vertices never see this vertex's completed move. Returns the
/// distance moved.
pub fn minimize_vertex_energy(
    grid: &Grid,
    models: &[SurfaceModel],
    state: &mut [VertState],
    stash: &mut VertState,
    vert_idx: usize,
    clamp_mask: u32,
    params: &EnergyParams,
) -> f64 {
    let clamp = state[vert_idx].clamp.clone();
    if !clamp.matches(clamp_mask & MOVABLE_MASK) {
        return 0.0;
    }

    let entry = state[vert_idx].clone();
    let mut pos = entry.pt;
    let mut new_clamp = clamp.clone();
    let max_change = 0.25 * grid.min_adj_edge_length(vert_idx, &*state);

    let dist = {
        let view: &[VertState] = state;
        let value = |p: &Vec3| vertex_energy_at(grid, view, vert_idx, p, params);
        let descender = SteepestDescent::default();
        let log = |count: usize, step: f64| {
            log::trace!("vert {vert_idx} opt step {count}: moved {step:.3e}");
        };

        match &clamp {
            Clamp::None => descender.run(
                &mut pos,
                MAX_OPTIMIZER_STEPS,
                max_change,
                &value,
                |cur, dt| free_gradient(grid, view, vert_idx, cur, dt, params),
                log,
            ),
            Clamp::Perpendicular(normal) => {
                let normal = *normal;
                descender.run(
                    &mut pos,
                    MAX_OPTIMIZER_STEPS,
                    max_change,
                    &value,
                    |cur, dt| perpendicular_gradient(grid, view, vert_idx, &normal, cur, dt, params),
                    log,
                )
            }
            Clamp::Parallel(dir) => {
                let dir = *dir;
                descender.run(
                    &mut pos,
                    MAX_OPTIMIZER_STEPS,
                    max_change,
                    &value,
                    |_cur, _dt| (dir, f64::MAX),
                    log,
                )
            }
            Clamp::TriPlane(tri) => {
                let pts = [
                    view[tri[0]].pt,
                    view[tri[1]].pt,
                    view[tri[2]].pt,
                ];
                let normal = hexspring_math::triangle_normal(&pts);
                descender.run(
                    &mut pos,
                    MAX_OPTIMIZER_STEPS,
                    max_change,
                    &value,
                    |cur, dt| perpendicular_gradient(grid, view, vert_idx, &normal, cur, dt, params),
                    log,
                )
            }
            Clamp::Edge {
                model,
                polyline,
                segment: _,
            } => {
                let m = &models[*model];
                let pl = &m.polylines[*polyline];
                descender.run(
                    &mut pos,
                    MAX_OPTIMIZER_STEPS,
                    max_change,
                    &value,
                    |cur, dt| edge_gradient(grid, view, vert_idx, m, pl, cur, dt, params),
                    log,
                )
            }
            _ => 0.0,
        }
    };

    // Keep an edge clamp honest about where it ended up: snap onto the
    // line and adopt the segment the point actually sits on.
    if let Clamp::Edge {
        model,
        polyline,
        segment,
    } = &mut new_clamp
    {
        let m = &models[*model];
        let pl = &m.polylines[*polyline];
        if let Some(cp) = pl.closest_point(&m.surface, &pos) {
            if cp.dist > SAME_DIST_TOL {
                let seg = pl.segment(&m.surface, cp.seg_idx);
                pos = seg.interpolate(cp.t.clamp(0.0, 1.0));
            }
            if cp.seg_idx != *segment {
                log::trace!(
                    "vert {vert_idx} edge clamp shifted segment {} -> {}",
                    segment,
                    cp.seg_idx
                );
                *segment = cp.seg_idx;
            }
        }
    }

    *stash = VertState {
        pt: pos,
        clamp: new_clamp,
    };
    state[vert_idx] = entry;
    dist
}

/// If the fitted step along `gradient` is negative, flip the
/// direction so the line search moves downhill with a positive step.
fn fix_gradient_direction<V: Fn(&Vec3) -> f64>(cur: &Vec3, dt: f64, gradient: &mut Vec3, value: &V) {
    if calc_move_dist(cur, dt, gradient, value) < 0.0 {
        *gradient = -*gradient;
    }
}

fn free_gradient(
    grid: &Grid,
    view: &[VertState],
    vert_idx: usize,
    cur: &mut Vec3,
    dt: f64,
    params: &EnergyParams,
) -> (Vec3, f64) {
    let e0 = vertex_energy_at(grid, view, vert_idx, cur, params);
    if e0 <= 1.0e-6 {
        return (Vec3::zeros(), 0.0);
    }

    let mut gradient = Vec3::zeros();
    for axis in 0..3 {
        let mut displaced = *cur;
        displaced[axis] += dt;
        let e1 = vertex_energy_at(grid, view, vert_idx, &displaced, params);
        gradient[axis] = (e1 - e0) / dt;
    }
    if let Some(unit) = safe_normalize(&gradient) {
        gradient = unit;
    }

    let value = |p: &Vec3| vertex_energy_at(grid, view, vert_idx, p, params);
    fix_gradient_direction(cur, dt, &mut gradient, &value);
    (gradient, f64::MAX)
}

fn perpendicular_gradient(
    grid: &Grid,
    view: &[VertState],
    vert_idx: usize,
    normal: &Vec3,
    cur: &mut Vec3,
    dt: f64,
    params: &EnergyParams,
) -> (Vec3, f64) {
    let e0 = vertex_energy_at(grid, view, vert_idx, cur, params);
    if e0 < 1.0e-6 {
        return (Vec3::zeros(), 0.0);
    }

    // An orthonormal basis of the constraint plane.
    let mut x_axis = AXIS_X;
    if x_axis.dot(normal).abs() > 0.7071 {
        x_axis = AXIS_Y;
        if x_axis.dot(normal).abs() > 0.7071 {
            x_axis = AXIS_Z;
        }
    }
    let x_axis = match safe_normalize(&(x_axis - normal * normal.dot(&x_axis))) {
        Some(v) => v,
        None => return (Vec3::zeros(), 0.0),
    };
    let y_axis = normal.cross(&x_axis);

    let mut gradient = Vec3::zeros();
    for dir in [x_axis, y_axis] {
        let e1 = vertex_energy_at(grid, view, vert_idx, &(*cur + dt * dir), params);
        gradient += ((e1 - e0) / dt) * dir;
    }
    if let Some(unit) = safe_normalize(&gradient) {
        gradient = unit;
    }

    let value = |p: &Vec3| vertex_energy_at(grid, view, vert_idx, p, params);
    fix_gradient_direction(cur, dt, &mut gradient, &value);
    (gradient, f64::MAX)
}

/// Edge-clamp gradient: constrained to the polyline. At a segment
/// interior there are two candidate directions (toward each
/// endpoint); at an interior chain vertex, back along the current
/// segment or on into the next. The candidate with the larger fitted
/// step wins, and the returned max distance is the run to that
/// candidate's far end. With fewer than two candidates (the chain's
/// very ends) the point is snapped and the walk stops; the
/// neighbouring segment's own test covers the remaining geometry.
fn edge_gradient(
    grid: &Grid,
    view: &[VertState],
    vert_idx: usize,
    model: &SurfaceModel,
    pl: &hexspring_surface::Polyline,
    cur: &mut Vec3,
    dt: f64,
    params: &EnergyParams,
) -> (Vec3, f64) {
    let Some(cp) = pl.closest_point(&model.surface, cur) else {
        return (Vec3::zeros(), 0.0);
    };
    let seg = pl.segment(&model.surface, cp.seg_idx);
    let seg_len = seg.length();

    let mut candidates: Vec<Vec3> = Vec::new();
    if cp.t < 0.0 {
        // Before the chain start; only reachable on the first segment.
        log::trace!("vert {vert_idx}: optimum before the start of its polyline");
        *cur = seg.p0;
        if cp.seg_idx == 0 {
            candidates.push(seg.p1 - seg.p0);
        }
    } else if cp.t * seg_len > seg_len - SAME_DIST_TOL {
        // At (or past) the segment end vertex.
        if cp.dist > SAME_DIST_TOL {
            log::trace!("vert {vert_idx}: pulled onto polyline vertex");
        }
        *cur = seg.p1;
        candidates.push(seg.p0 - seg.p1);
        if cp.seg_idx + 1 < pl.num_segments() {
            let next = pl.segment(&model.surface, cp.seg_idx + 1);
            candidates.push(next.p1 - next.p0);
        }
    } else {
        let clamp_pt = seg.interpolate(cp.t);
        if cp.dist > SAME_DIST_TOL {
            // Drifted off the line; lock it back on.
            log::trace!("vert {vert_idx}: {:.3e} off its polyline, snapping", cp.dist);
            *cur = clamp_pt;
        }
        candidates.push(seg.p0 - clamp_pt);
        candidates.push(seg.p1 - clamp_pt);
    }

    let dirs: Vec<(Vec3, f64)> = candidates
        .iter()
        .filter_map(|c| {
            let len = c.norm();
            if len < MIN_NORMALIZE_DIVISOR {
                None
            } else {
                Some((c / len, len))
            }
        })
        .collect();
    if dirs.len() < 2 {
        return (Vec3::zeros(), 0.0);
    }

    let value = |p: &Vec3| vertex_energy_at(grid, view, vert_idx, p, params);
    let mut best: Option<(Vec3, f64)> = None;
    let mut best_step = 0.0;
    for (dir, len) in dirs {
        let step = calc_move_dist(cur, dt, &dir, &value);
        if step > best_step {
            best_step = step;
            best = Some((dir, len));
        }
    }
    best.unwrap_or((Vec3::zeros(), 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use hexspring_math::BoundingBox;

    /// Quadratic bowl: the descender must land on the minimum.
    #[test]
    fn test_descender_finds_parabola_minimum() {
        let target = Vec3::new(0.3, -0.2, 0.7);
        let value = |p: &Vec3| (p - target).norm_squared();
        let mut cur = Vec3::zeros();
        let descender = SteepestDescent::default();
        let dist = descender.run(
            &mut cur,
            20,
            10.0,
            &value,
            |cur, dt| {
                let e0 = value(cur);
                if e0 < 1e-18 {
                    return (Vec3::zeros(), 0.0);
                }
                let mut g = Vec3::zeros();
                for axis in 0..3 {
                    let mut d = *cur;
                    d[axis] += dt;
                    g[axis] = (value(&d) - e0) / dt;
                }
                ((-g).normalize(), f64::MAX)
            },
            |_, _| {},
        );
        // max_change caps each pass at 2.0 of travel; target is closer.
        assert!(dist > 0.0);
        assert!((cur - target).norm() < 1e-4, "stopped at {cur:?}");
    }

    #[test]
    fn test_calc_move_dist_on_parabola() {
        // f(x) = (x-2)^2 along +X from the origin: the fitted step is
        // exactly 2.
        let value = |p: &Vec3| (p.x - 2.0) * (p.x - 2.0) + 1.0;
        let step = calc_move_dist(&Vec3::zeros(), 1e-8, &AXIS_X, &value);
        assert_relative_eq!(step, 2.0, epsilon = 1e-4);
    }

    fn lattice(n: f64) -> Grid {
        let mut grid = Grid::new();
        grid.init_lattice(
            &BoundingBox::new(Vec3::zeros(), Vec3::new(n, n, n)),
            1.0,
        );
        grid
    }

    /// Spec case: displace the body-centre vertex of a 2×2×2 grid with
    /// all others fixed; repeated optimisation returns it to the
    /// centroid within 1e-4.
    #[test]
    fn test_displaced_interior_vertex_recovers() {
        let grid = lattice(2.0);
        let params = EnergyParams::default();
        let centre_idx = (0..grid.num_verts())
            .find(|&i| (grid.vert(i).pt() - Vec3::new(1.0, 1.0, 1.0)).norm() < 1e-9)
            .unwrap();

        let mut state: Vec<VertState> = (0..grid.num_verts())
            .map(|i| {
                let mut s = grid.vert(i).state();
                if i != centre_idx {
                    s.clamp = Clamp::Fixed;
                }
                s
            })
            .collect();
        state[centre_idx].pt = Vec3::new(1.21, 0.87, 1.13);

        let mut stash = state[centre_idx].clone();
        for _ in 0..10 {
            minimize_vertex_energy(
                &grid,
                &[],
                &mut state,
                &mut stash,
                centre_idx,
                mask::ANY,
                &params,
            );
            // Commit the stash the way a relaxation pass would.
            state[centre_idx] = stash.clone();
        }
        assert!(
            (state[centre_idx].pt - Vec3::new(1.0, 1.0, 1.0)).norm() < 1e-4,
            "ended at {:?}",
            state[centre_idx].pt
        );
    }

    /// Fixed vertices never move and never update their stash.
    #[test]
    fn test_fixed_vertex_does_not_move() {
        let grid = lattice(1.0);
        let mut state: Vec<VertState> = (0..grid.num_verts()).map(|i| grid.vert(i).state()).collect();
        state[0].clamp = Clamp::Fixed;
        let sentinel = VertState {
            pt: Vec3::new(9.0, 9.0, 9.0),
            clamp: Clamp::None,
        };
        let mut stash = sentinel.clone();
        let moved = minimize_vertex_energy(
            &grid,
            &[],
            &mut state,
            &mut stash,
            0,
            mask::ANY,
            &EnergyParams::default(),
        );
        assert_eq!(moved, 0.0);
        assert_eq!(stash.pt, sentinel.pt);
    }

    /// A Parallel-clamped vertex only ever moves along its line.
    #[test]
    fn test_parallel_clamp_moves_on_line_only() {
        let grid = lattice(2.0);
        let params = EnergyParams::default();
        // Mid-edge vertex at (1,0,0) is Parallel(X) on the boundary.
        let idx = (0..grid.num_verts())
            .find(|&i| (grid.vert(i).pt() - Vec3::new(1.0, 0.0, 0.0)).norm() < 1e-9)
            .unwrap();
        let mut state: Vec<VertState> =
            (0..grid.num_verts()).map(|i| grid.vert(i).state()).collect();
        for (i, s) in state.iter_mut().enumerate() {
            if i != idx {
                s.clamp = Clamp::Fixed;
            }
        }
        state[idx].clamp = Clamp::Parallel(AXIS_X);
        state[idx].pt = Vec3::new(0.8, 0.0, 0.0);

        let mut stash = state[idx].clone();
        minimize_vertex_energy(&grid, &[], &mut state, &mut stash, idx, mask::ANY, &params);
        assert_relative_eq!(stash.pt.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(stash.pt.z, 0.0, epsilon = 1e-12);
        // It moved back toward the relaxed position.
        assert!((stash.pt.x - 1.0).abs() < (0.8f64 - 1.0).abs());
    }
}
