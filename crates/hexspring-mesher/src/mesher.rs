//! The pipeline driver.
//!
//! Builds the initial lattice, clamps the boundary, snaps cusps, and
//! then alternates relaxation, polyline fitting, and splitting until
//! the configured number of divide passes has run. Each stage boundary
//! can be resumed from a saved grid file in the work directory.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hexspring_grid::{mask, Clamp, EnergyParams, Grid};
use hexspring_math::{BoundingBox, Vec3, AXIS_X, AXIS_Y, AXIS_Z};
use hexspring_refine::{PolylineFitter, Splitter};
use hexspring_surface::{stl, SurfaceModel, TokenReader};

use crate::error::{ErrorCode, MesherError, Result};
use crate::params::Params;
use crate::relax::{enforce_derived_clamps, relax_pass};

/// Stage file names in the work directory.
const STAGE_INITIAL: &str = "initial.grid";
const STAGE_PRE_FIT: &str = "pre_fit.grid";
const STAGE_POST_FIT: &str = "post_fit.grid";

/// Maximum polylines fitted per fit pass.
const MAX_FITS_PER_PASS: usize = 3;

/// Progress and cancellation hooks. The driver polls
/// [`is_running`](Reporter::is_running) at stage boundaries and
/// between relaxation iterations.
pub trait Reporter: Send + Sync {
    /// False requests a stop; the run unwinds cleanly and returns
    /// [`ErrorCode::NoErr`].
    fn is_running(&self) -> bool {
        true
    }

    /// Stage and progress notifications.
    fn report(&self, _key: &str) {}

    /// A surface model was added.
    fn report_model_added(&self, _model_idx: usize) {}
}

/// A reporter that never stops and ignores reports.
pub struct NullReporter;

impl Reporter for NullReporter {}

/// The hexahedral meshing pipeline.
pub struct Mesher {
    params: Params,
    energy_params: EnergyParams,
    grid: Grid,
    models: Vec<SurfaceModel>,
    reporter: Arc<dyn Reporter>,
    work_dir: Option<PathBuf>,
    dump_dir: Option<PathBuf>,
    num_workers: usize,
    pre_split_around_polylines: bool,
}

impl Mesher {
    /// A mesher over validated parameters.
    pub fn new(params: Params) -> Result<Self> {
        params
            .validate()
            .map_err(MesherError::Invariant)?;
        Ok(Self {
            params,
            energy_params: EnergyParams::default(),
            grid: Grid::new(),
            models: Vec::new(),
            reporter: Arc::new(NullReporter),
            work_dir: None,
            dump_dir: None,
            num_workers: 4,
            pre_split_around_polylines: false,
        })
    }

    /// Write diagnostic OBJ dumps at stage boundaries into this
    /// directory.
    pub fn set_dump_dir(&mut self, dir: impl AsRef<Path>) {
        self.dump_dir = Some(dir.as_ref().to_path_buf());
    }

    fn dump_stage(&self, name: &str) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let dump = crate::dump_obj::DumpObj::new(dir);
        if let Err(err) = dump.write(&self.grid, name, 0, mask::ANY) {
            log::warn!("OBJ dump '{name}' failed: {err}");
        }
        let reduced = format!("{name}_clamped");
        if let Err(err) = dump.write(&self.grid, &reduced, 1, mask::VERT | mask::EDGE | mask::TRI) {
            log::warn!("OBJ dump '{reduced}' failed: {err}");
        }
    }

    /// Install a reporter.
    pub fn set_reporter(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporter = reporter;
    }

    /// Stage files are saved to and resumed from this directory.
    pub fn set_work_dir(&mut self, dir: impl AsRef<Path>) {
        self.work_dir = Some(dir.as_ref().to_path_buf());
    }

    /// Number of relaxation workers (default 4).
    pub fn set_num_workers(&mut self, workers: usize) {
        self.num_workers = workers.max(1);
    }

    /// Pre-refine cells whose boxes contain polyline vertices before
    /// fitting (off by default).
    pub fn set_pre_split_around_polylines(&mut self, enabled: bool) {
        self.pre_split_around_polylines = enabled;
    }

    /// The grid under construction.
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// The loaded surface models.
    pub fn models(&self) -> &[SurfaceModel] {
        &self.models
    }

    /// Current parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Load an STL file as a surface model and detect its features.
    pub fn add_stl_file(&mut self, path: &Path) -> Result<()> {
        let surface = stl::read_stl(path)?;
        log::info!(
            "loaded {}: {} verts, {} tris",
            path.display(),
            surface.num_verts(),
            surface.num_tris()
        );
        let mut model = SurfaceModel::new(surface, self.params.sharp_angle_deg);
        model.init();
        self.add_model(model);
        Ok(())
    }

    /// Add a prepared surface model.
    pub fn add_model(&mut self, model: SurfaceModel) {
        self.models.push(model);
        self.reporter.report_model_added(self.models.len() - 1);
    }

    fn check_stop(&self) -> Result<()> {
        if self.reporter.is_running() {
            Ok(())
        } else {
            Err(MesherError::Stopped)
        }
    }

    /// Narrowest gap over all models.
    pub fn find_minimum_gap(&self) -> f64 {
        self.models
            .iter()
            .map(|m| m.min_gap())
            .fold(f64::MAX, f64::min)
    }

    /// Measure the models and size the grid.
    pub fn init(&mut self) {
        let gap = self.find_minimum_gap();
        if gap < f64::MAX {
            self.params.min_gap_size = gap;
        }
        log::info!("minimum normal gap: {:.6}", self.params.min_gap_size);
        log::info!("max edge length:    {:.6}", self.params.calc_max_edge_length());
        log::info!("min edge length:    {:.6}", self.params.calc_min_edge_length());
        log::info!("max divisions:      {}", self.params.calc_max_divisions());
        log::info!("sharp angle:        {} deg", self.params.sharp_angle_deg);

        self.grid.set_bounds(&self.params.bounds());
    }

    // ---- stage 1-3: initial grid -------------------------------------

    /// Build the lattice, clamp the boundary, snap cusps.
    pub fn make_initial_grid(&mut self) -> Result<()> {
        self.grid
            .init_lattice(&self.params.bounds(), self.params.calc_max_edge_length());
        if !self.grid.verify(&self.models) {
            return Err(MesherError::Invariant("initial lattice is invalid".into()));
        }
        let total = hexspring_grid::energy::total_grid_energy(&self.grid, &self.energy_params);
        if total != 0.0 {
            log::warn!("initial grid energy is {total}, expected 0");
        }

        self.clamp_boundaries();
        if self.pre_split_around_polylines {
            self.split_cells_around_polylines();
        }
        self.snap_to_cusps();
        self.save_stage(STAGE_INITIAL)?;
        Ok(())
    }

    /// Classify every vertex by incident-cell count: interior free, on
    /// a face, on an edge, or at a corner of the box.
    pub fn clamp_boundaries(&mut self) {
        for vert_idx in 0..self.grid.num_verts() {
            if !matches!(self.grid.vert(vert_idx).clamp(), Clamp::None) {
                continue;
            }
            match self.grid.vert(vert_idx).num_cells() {
                8 => {}
                4 => self.clamp_boundary_plane(vert_idx),
                2 => self.clamp_boundary_edge(vert_idx),
                1 => self
                    .grid
                    .vert_mut(vert_idx)
                    .set_clamp(Clamp::Fixed),
                n => panic!("boundary vertex {vert_idx} with {n} cells"),
            }
        }
    }

    fn neighbor_dirs(&self, vert_idx: usize) -> Vec<Vec3> {
        let pt = *self.grid.vert(vert_idx).pt();
        let mut dirs = Vec::new();
        for &cell_idx in self.grid.vert(vert_idx).cell_indices() {
            let cell = self.grid.cell(cell_idx);
            let Some(pos) = cell.verts_pos(vert_idx) else {
                continue;
            };
            for other in cell.adjacent_edge_vert_indices(pos) {
                let v = self.grid.vert(other).pt() - pt;
                if let Some(dir) = hexspring_math::safe_normalize(&v) {
                    dirs.push(dir);
                }
            }
        }
        dirs
    }

    /// A 4-cell vertex sits on a box face: clamp perpendicular to the
    /// axis with no neighbours on one side.
    fn clamp_boundary_plane(&mut self, vert_idx: usize) {
        let dirs = self.neighbor_dirs(vert_idx);
        let mut hits = [0usize; 6];
        for dir in &dirs {
            for (axis_idx, axis) in [AXIS_X, AXIS_Y, AXIS_Z].iter().enumerate() {
                let dp = dir.dot(axis);
                if dp > 0.7071 {
                    hits[axis_idx] += 1;
                } else if dp < -0.7071 {
                    hits[axis_idx + 3] += 1;
                }
            }
        }

        let clamp = if hits[0] == 0 || hits[3] == 0 {
            Clamp::Perpendicular(AXIS_X)
        } else if hits[1] == 0 || hits[4] == 0 {
            Clamp::Perpendicular(AXIS_Y)
        } else if hits[2] == 0 || hits[5] == 0 {
            Clamp::Perpendicular(AXIS_Z)
        } else {
            panic!("face vertex {vert_idx}: no missing axis direction");
        };
        self.grid.vert_mut(vert_idx).set_clamp(clamp);
    }

    /// A 2-cell vertex sits on a box edge: clamp parallel to the axis
    /// with exactly one negative neighbour.
    fn clamp_boundary_edge(&mut self, vert_idx: usize) {
        let dirs = self.neighbor_dirs(vert_idx);
        let mut neg_hits = [0usize; 3];
        for dir in &dirs {
            for (axis_idx, axis) in [AXIS_X, AXIS_Y, AXIS_Z].iter().enumerate() {
                if dir.dot(axis) < -0.7071 {
                    neg_hits[axis_idx] += 1;
                }
            }
        }

        let clamp = if neg_hits[0] == 1 {
            Clamp::Parallel(AXIS_X)
        } else if neg_hits[1] == 1 {
            Clamp::Parallel(AXIS_Y)
        } else if neg_hits[2] == 1 {
            Clamp::Parallel(AXIS_Z)
        } else {
            panic!("edge vertex {vert_idx}: no single-ended axis");
        };
        self.grid.vert_mut(vert_idx).set_clamp(clamp);
    }

    /// Pin the grid vertex nearest each in-bounds surface cusp
    /// (Manhattan metric, within 1.5 max edge lengths).
    pub fn snap_to_cusps(&mut self) {
        let max_edge = self.params.calc_max_edge_length();
        let bounds = self.params.bounds();

        for model_idx in 0..self.models.len() {
            let cusps: Vec<usize> = self.models[model_idx].cusps.iter().copied().collect();
            for cusp_vert in cusps {
                let cusp_pt = *self.models[model_idx].surface.vert(cusp_vert);
                if !bounds.contains(&cusp_pt) {
                    continue;
                }
                let mut bb = BoundingBox::from_point(&cusp_pt);
                bb.grow(1.5 * max_edge);
                let candidates = self.grid.find_verts(&bb);

                let mut best: Option<usize> = None;
                let mut min_dist = 1.5 * max_edge;
                for vert_idx in candidates {
                    let v = self.grid.vert(vert_idx).pt() - cusp_pt;
                    let dist = v.x.abs() + v.y.abs() + v.z.abs();
                    if dist < min_dist {
                        min_dist = dist;
                        best = Some(vert_idx);
                    }
                }
                match best {
                    Some(vert_idx) => {
                        self.grid.move_vert_direct(vert_idx, &cusp_pt);
                        self.grid.vert_mut(vert_idx).set_clamp(Clamp::Vert {
                            model: model_idx,
                            vert: cusp_vert,
                        });
                    }
                    None => log::warn!("failed to snap cusp at {cusp_pt:?}"),
                }
            }
        }
    }

    /// Pre-refinement: when any cell's box contains vertices of more
    /// than one polyline, octree-split every polyline-carrying cell
    /// twice so the fitter has room to separate the ridges.
    pub fn split_cells_around_polylines(&mut self) {
        let mut cells_to_split: Vec<usize> = Vec::new();
        let mut max_polylines_in_cell = 0usize;

        for cell_id in self.grid.live_cell_ids() {
            let bb = self.grid.cell(cell_id).bbox(&self.grid);
            let mut seen = BTreeSet::new();
            for (model_idx, model) in self.models.iter().enumerate() {
                for (pl_num, pl) in model.polylines.iter().enumerate() {
                    if pl
                        .verts()
                        .iter()
                        .any(|&v| bb.contains(model.surface.vert(v)))
                    {
                        seen.insert((model_idx, pl_num));
                    }
                }
            }
            if !seen.is_empty() {
                max_polylines_in_cell = max_polylines_in_cell.max(seen.len());
                cells_to_split.push(cell_id);
            }
        }

        if max_polylines_in_cell > 1 {
            for _ in 0..2 {
                let mut splitter = Splitter::new(&mut self.grid, &self.models);
                for cell_id in &cells_to_split {
                    splitter.split_cell_full(*cell_id);
                }
                splitter.finish();
                cells_to_split = splitter.new_cells().to_vec();
            }
        }
    }

    // ---- stage 4/6: relaxation ---------------------------------------

    /// Run parallel relaxation passes, enforcing derived clamps
    /// between passes.
    pub fn minimize_mesh(&mut self, steps: usize, clamp_mask: u32) -> Result<()> {
        self.grid.clear_vert_tree();

        for step in 0..steps {
            self.check_stop()?;
            let stats = relax_pass(
                &mut self.grid,
                &self.models,
                &self.energy_params,
                self.num_workers,
                clamp_mask,
            );

            let mut clamp_move = f64::MAX;
            for _ in 0..3 {
                if clamp_move <= 1.0e-5 {
                    break;
                }
                clamp_move = enforce_derived_clamps(&mut self.grid);
            }

            log::info!(
                "relax {step}: max move {:.3e}, avg move {:.3e}, max energy {:.3e}, avg energy {:.3e}",
                stats.max_move,
                stats.avg_move,
                stats.max_energy,
                stats.avg_energy
            );
            self.reporter.report("grid_verts_changed");
        }

        self.grid.rebuild_vert_tree();
        Ok(())
    }

    // ---- stage 5: polyline fit + split -------------------------------

    /// Fit sharp polylines into the grid and split the touched cells.
    pub fn put_corners_on_sharp_edges(&mut self) -> Result<()> {
        let mut cells_to_split = BTreeSet::new();
        let bounds = self.params.bounds();
        let start_radius = self.params.calc_max_edge_length();

        let mut fitted = 0usize;
        for model_idx in 0..self.models.len() {
            // Models present their polylines longest first.
            for pl_num in 0..self.models[model_idx].polylines.len() {
                if fitted >= MAX_FITS_PER_PASS {
                    break;
                }
                let pl_bb =
                    self.models[model_idx].polylines[pl_num].bounding_box(&self.models[model_idx].surface);
                if !bounds.intersects(&pl_bb) {
                    continue;
                }
                let mut fitter = PolylineFitter::new(
                    &mut self.grid,
                    &self.models,
                    model_idx,
                    pl_num,
                    start_radius,
                );
                if fitter.fit(&mut cells_to_split) > 0 {
                    fitted += 1;
                }
            }
        }
        log::info!(
            "fitted {fitted} polylines, {} cells to split",
            cells_to_split.len()
        );

        if !self.grid.verify(&self.models) {
            log::warn!("grid failed verification after polyline fit");
        }

        self.minimize_mesh(25, mask::ANY)?;

        let new_cells = {
            let mut splitter = Splitter::new(&mut self.grid, &self.models);
            splitter.split_cells(&cells_to_split);
            splitter.new_cells().to_vec()
        };

        // Re-seat the derived clamps the split handed out.
        for cell_id in new_cells {
            if !self.grid.cell_exists(cell_id) {
                continue;
            }
            for pos in hexspring_grid::CellVertPos::ALL {
                let vert_idx = self.grid.cell(cell_id).vert_idx(pos);
                let _ = self.grid.clamp_vertex(vert_idx);
            }
        }
        self.grid.rebuild_vert_tree();

        if !self.grid.verify(&self.models) {
            log::warn!("grid failed verification after diagonal split");
        }
        Ok(())
    }

    // ---- stage 7: divide ---------------------------------------------

    /// Split every cell and relax, `num_divisions` times.
    pub fn divide_mesh(&mut self, num_divisions: usize) -> Result<()> {
        for division in 0..num_divisions {
            self.check_stop()?;
            log::info!("divide pass {division}");
            for vert_idx in 0..self.grid.num_verts() {
                let _ = self.grid.snap_to_cell_edge_center(vert_idx);
            }
            // The snaps bypass the spatial index; the splitter's
            // vertex dedup needs it current.
            self.grid.rebuild_vert_tree();
            {
                let mut splitter = Splitter::new(&mut self.grid, &self.models);
                splitter.split_all();
            }
            self.minimize_mesh(25, mask::ANY)?;
        }
        Ok(())
    }

    // ---- save / read -------------------------------------------------

    /// Write the full mesher stream.
    pub fn save(&self, out: &mut dyn Write) -> Result<()> {
        if !self.grid.verify(&self.models) {
            return Err(MesherError::Invariant(
                "refusing to save an unverifiable grid".into(),
            ));
        }
        writeln!(out, "Mesher version 1")?;
        self.params.save(out)?;
        self.grid.save(out)?;
        writeln!(out, "NM: {}", self.models.len())?;
        for model in &self.models {
            model.save(out)?;
        }
        Ok(())
    }

    /// Read a mesher stream, replacing the grid, params and models.
    pub fn read(&mut self, tokens: &mut TokenReader<'_>) -> Result<()> {
        tokens.expect("Mesher")?;
        tokens.expect("version")?;
        let version: u32 = tokens.parse::<u32>()?;
        if version != 1 {
            return Err(MesherError::Invariant(format!(
                "unsupported mesher version {version}"
            )));
        }
        let params = Params::read(tokens)?;
        let grid = Grid::read(tokens)?;
        tokens.expect("NM:")?;
        let num_models: usize = tokens.parse()?;
        let mut models = Vec::with_capacity(num_models);
        for _ in 0..num_models {
            models.push(SurfaceModel::read(tokens, params.sharp_angle_deg)?);
        }

        if !grid.verify(&models) {
            return Err(MesherError::Invariant(
                "read grid failed verification".into(),
            ));
        }
        self.params = params;
        self.grid = grid;
        self.models = models;
        Ok(())
    }

    fn stage_path(&self, name: &str) -> Option<PathBuf> {
        self.work_dir.as_ref().map(|d| d.join(name))
    }

    fn save_stage(&self, name: &str) -> Result<()> {
        let Some(path) = self.stage_path(name) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&path)?);
        self.save(&mut out)?;
        log::info!("saved state to {}", path.display());
        Ok(())
    }

    fn try_read_stage(&mut self, name: &str) -> bool {
        let Some(path) = self.stage_path(name) else {
            return false;
        };
        let Ok(file) = File::open(&path) else {
            return false;
        };
        let mut tokens = TokenReader::new(BufReader::new(file));
        match self.read(&mut tokens) {
            Ok(()) => {
                log::info!("resumed from {}", path.display());
                true
            }
            Err(err) => {
                log::warn!("could not resume from {}: {err}", path.display());
                false
            }
        }
    }

    // ---- top level ---------------------------------------------------

    /// Run the full pipeline. A stop request yields
    /// [`ErrorCode::NoErr`]; unexpected failures are logged and yield
    /// [`ErrorCode::UnknownErr`].
    pub fn run(&mut self) -> ErrorCode {
        match self.run_stages() {
            Ok(()) => ErrorCode::NoErr,
            Err(MesherError::Stopped) => ErrorCode::NoErr,
            Err(err) => {
                log::error!("meshing failed: {err}");
                ErrorCode::UnknownErr
            }
        }
    }

    fn run_stages(&mut self) -> Result<()> {
        self.init();

        if !self.try_read_stage(STAGE_POST_FIT) {
            if !self.try_read_stage(STAGE_PRE_FIT) {
                if !self.try_read_stage(STAGE_INITIAL) {
                    self.make_initial_grid()?;
                }
                self.reporter.report("grid_topol_change");
                self.minimize_mesh(50, mask::ANY)?;
                self.save_stage(STAGE_PRE_FIT)?;
                self.dump_stage("pre_fit");
            }
            self.reporter.report("grid_topol_change");

            self.put_corners_on_sharp_edges()?;
            // Everything must be saved together: polyline numbering is
            // part of the clamp references.
            self.save_stage(STAGE_POST_FIT)?;
            self.dump_stage("post_fit");
        }
        self.reporter.report("grid_topol_change");

        self.minimize_mesh(25, mask::ANY)?;
        self.divide_mesh(self.params.calc_max_divisions())?;
        self.dump_stage("final");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexspring_surface::TriangleSurface;

    fn cube_params(n: f64) -> Params {
        Params {
            max_edge_length: 1.0,
            min_edge_length: 1.0,
            min_gap_size: 10.0,
            sharp_angle_deg: 45.0,
            bounds_min: [0.0; 3],
            bounds_max: [n; 3],
        }
    }

    /// A unit cube surface, outward wound.
    fn cube_soup(size: f64) -> Vec<[Vec3; 3]> {
        let p = |x: f64, y: f64, z: f64| Vec3::new(x * size, y * size, z * size);
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
    fn test_boundary_clamp_classification() {
        let mut mesher = Mesher::new(cube_params(2.0)).unwrap();
        mesher.init();
        mesher.make_initial_grid().unwrap();

        let grid = mesher.grid();
        let mut fixed = 0;
        let mut parallel = 0;
        let mut perpendicular = 0;
        let mut free = 0;
        for i in 0..grid.num_verts() {
            match grid.vert(i).clamp() {
                Clamp::Fixed => fixed += 1,
                Clamp::Parallel(_) => parallel += 1,
                Clamp::Perpendicular(_) => perpendicular += 1,
                Clamp::None => free += 1,
                other => panic!("unexpected clamp {other:?}"),
            }
        }
        assert_eq!(fixed, 8);
        assert_eq!(parallel, 12);
        assert_eq!(perpendicular, 6);
        assert_eq!(free, 1);
    }

    #[test]
    fn test_clamp_boundaries_is_idempotent() {
        let mut mesher = Mesher::new(cube_params(2.0)).unwrap();
        mesher.init();
        mesher.make_initial_grid().unwrap();

        let before: Vec<Clamp> = (0..mesher.grid().num_verts())
            .map(|i| mesher.grid().vert(i).clamp().clone())
            .collect();
        mesher.clamp_boundaries();
        for (i, clamp) in before.iter().enumerate() {
            assert_eq!(mesher.grid().vert(i).clamp(), clamp);
        }
    }

    #[test]
    fn test_cusp_snap_on_unit_cube() {
        // A unit cube model inside a 1-cell grid: all 8 cusps land on
        // the 8 grid corners.
        let mut mesher = Mesher::new(cube_params(1.0)).unwrap();
        let mut model = SurfaceModel::new(TriangleSurface::from_triangles(&cube_soup(1.0)), 45.0);
        model.init();
        assert_eq!(model.find_sharp_edges().len(), 12);
        assert_eq!(model.cusps.len(), 8);
        mesher.add_model(model);

        mesher.init();
        mesher.make_initial_grid().unwrap();

        let grid = mesher.grid();
        let mut vert_clamped = 0;
        for i in 0..grid.num_verts() {
            if let Clamp::Vert { .. } = grid.vert(i).clamp() {
                vert_clamped += 1;
            }
        }
        assert_eq!(vert_clamped, 8);
        assert!(grid.verify(mesher.models()));
    }

    #[test]
    fn test_mesher_save_read_round_trip() {
        let mut mesher = Mesher::new(cube_params(2.0)).unwrap();
        let mut model = SurfaceModel::new(TriangleSurface::from_triangles(&cube_soup(2.0)), 45.0);
        model.init();
        mesher.add_model(model);
        mesher.init();
        mesher.make_initial_grid().unwrap();

        let mut buf = Vec::new();
        mesher.save(&mut buf).unwrap();

        let mut restored = Mesher::new(cube_params(2.0)).unwrap();
        let mut tokens = TokenReader::new(BufReader::new(buf.as_slice()));
        restored.read(&mut tokens).unwrap();

        assert_eq!(restored.grid().num_verts(), mesher.grid().num_verts());
        assert_eq!(restored.grid().num_cells(), mesher.grid().num_cells());
        assert_eq!(restored.models().len(), 1);
        for i in 0..mesher.grid().num_verts() {
            assert_eq!(
                restored.grid().vert(i).clamp(),
                mesher.grid().vert(i).clamp()
            );
            assert!((restored.grid().vert(i).pt() - mesher.grid().vert(i).pt()).norm() < 1e-12);
        }
    }

    #[test]
    fn test_minimize_respects_stop_request() {
        struct StopNow;
        impl Reporter for StopNow {
            fn is_running(&self) -> bool {
                false
            }
        }

        let mut mesher = Mesher::new(cube_params(2.0)).unwrap();
        mesher.init();
        mesher.make_initial_grid().unwrap();
        mesher.set_reporter(Arc::new(StopNow));
        match mesher.minimize_mesh(5, mask::ANY) {
            Err(MesherError::Stopped) => {}
            other => panic!("expected Stopped, got {other:?}"),
        }
        // And a full run maps the stop to a clean exit.
        assert_eq!(mesher.run(), ErrorCode::NoErr);
    }

    #[test]
    fn test_full_run_without_models() {
        // No models: the box itself is the geometry, zero divisions.
        let mut mesher = Mesher::new(cube_params(2.0)).unwrap();
        assert_eq!(mesher.run(), ErrorCode::NoErr);
        assert_eq!(mesher.grid().num_live_cells(), 8);
        assert!(mesher.grid().verify(&[]));
    }

    #[test]
    fn test_fit_stage_on_cube_model() {
        let mut mesher = Mesher::new(cube_params(2.0)).unwrap();
        let mut model = SurfaceModel::new(TriangleSurface::from_triangles(&cube_soup(2.0)), 45.0);
        model.init();
        mesher.add_model(model);

        mesher.init();
        mesher.make_initial_grid().unwrap();
        mesher.minimize_mesh(5, mask::ANY).unwrap();
        mesher.put_corners_on_sharp_edges().unwrap();

        // The fit clamps corners onto the cube's ridges; the grid
        // survives the follow-up splits.
        assert!(mesher.grid().verify(mesher.models()));
        assert!(mesher.grid().num_live_cells() >= 8);
    }
}
