//! hexspring CLI: mesh STL surfaces into a hexahedral grid.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hexspring_mesher::{ErrorCode, Mesher, Params};

#[derive(Parser)]
#[command(name = "hexspring")]
#[command(about = "Spring-energy hexahedral volume mesher", long_about = None)]
struct Cli {
    /// Parameter file (TOML: edge lengths, sharp angle, bounds)
    params: PathBuf,

    /// STL surface file; repeat for multiple models
    #[arg(short, long = "stl")]
    stl: Vec<PathBuf>,

    /// Directory for stage files; enables resume across runs
    #[arg(short, long = "work-dir")]
    work_dir: Option<PathBuf>,

    /// Directory for diagnostic OBJ dumps
    #[arg(long = "dump-dir")]
    dump_dir: Option<PathBuf>,

    /// Relaxation worker threads
    #[arg(short = 'j', long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let text = std::fs::read_to_string(&cli.params)
        .with_context(|| format!("reading {}", cli.params.display()))?;
    let params: Params =
        toml::from_str(&text).with_context(|| format!("parsing {}", cli.params.display()))?;

    let mut mesher = Mesher::new(params).context("invalid parameters")?;
    mesher.set_num_workers(cli.workers);
    if let Some(dir) = &cli.work_dir {
        mesher.set_work_dir(dir);
    }
    if let Some(dir) = &cli.dump_dir {
        mesher.set_dump_dir(dir);
    }

    for path in &cli.stl {
        mesher
            .add_stl_file(path)
            .with_context(|| format!("loading {}", path.display()))?;
    }

    match mesher.run() {
        ErrorCode::NoErr => {
            log::info!(
                "done: {} cells, {} vertices ({} clamped)",
                mesher.grid().num_live_cells(),
                mesher.grid().num_verts(),
                mesher.grid().num_clamped_verts()
            );
            Ok(())
        }
        ErrorCode::UnknownErr => bail!("meshing failed; see the log"),
    }
}
