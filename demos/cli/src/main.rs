use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use env_logger::Env;
use log::{info, warn};

use taskbot::{
    cam::RasterWorkflow,
    export::ExportOptions,
    job::{JobKind, JobState},
    orchestrator::{OrchestratorContext, OrchestratorSettings, TaskOrchestrator},
    render::{RenderInput, View},
    sampler::FlatColorSampler,
};

mod engine;

/// Renders a design script, streaming its mesh until the level of detail
/// settles
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Input script
    input: PathBuf,

    /// Maximum number of frames to run before giving up on convergence
    #[clap(short = 'N', long, default_value_t = 1000)]
    frames: usize,

    /// Size of the (virtual) viewport, in pixels
    #[clap(short, long, default_value_t = 256)]
    size: usize,

    /// Fraction of the viewport covered by the model
    #[clap(short, long, default_value_t = 0.8)]
    zoom: f32,

    /// File to export once the mesh has settled (`.png`, `.stl`, `.asdf`,
    /// `.svg`, or `.math`)
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// Export resolution, in voxels per millimeter
    #[clap(short, long, default_value_t = 10.0)]
    resolution: f32,

    /// Merge leaf cells when exporting `.asdf` files
    #[clap(long)]
    merge_leafs: bool,

    /// Triangulate `.stl` exports with cubical marching squares
    #[clap(long)]
    cms: bool,

    /// Export `.png` files as 16-bit height-maps instead of shape colors
    #[clap(long)]
    heightmap: bool,

    /// Also generate a raster toolpath
    #[clap(long)]
    cam: bool,
}

/// Ticks the orchestrator until `done` returns true, sleeping on the wake
/// channel between frames
///
/// Returns `false` if we ran out of frames.
fn run_until<F: Fn(&TaskOrchestrator) -> bool>(
    t: &mut TaskOrchestrator,
    wake: &crossbeam_channel::Receiver<()>,
    frames: usize,
    done: F,
) -> bool {
    for _ in 0..frames {
        t.tick();
        if done(t) {
            return true;
        }
        let _ = wake.recv_timeout(Duration::from_millis(50));
    }
    false
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let script = std::fs::read_to_string(&args.input)?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let renderer = engine::IsoRenderer {
        size: args.size,
        zoom: args.zoom,
    };
    let mut t = TaskOrchestrator::new(
        OrchestratorContext {
            evaluator: Arc::new(engine::ScriptEvaluator),
            loader: Arc::new(engine::VoxelLoader),
            sampler: Box::new(FlatColorSampler::new(renderer)),
            wake: Some(tx),
        },
        OrchestratorSettings::default(),
    );

    let start = Instant::now();
    t.start_render(View::default(), RenderInput::Script(script))?;
    let settled = run_until(&mut t, &rx, args.frames, |t| {
        !t.is_busy() && (t.lod_converged() || t.design_failed())
    });
    if t.job_state(JobKind::Render) == Some(JobState::Failed) {
        if let Some(line) = t.error_line() {
            warn!("error on line {}", line + 1);
        }
        bail!("{}", t.status());
    }
    if !settled {
        warn!("mesh did not settle after {} frames", args.frames);
    }
    info!("Rendered in {:?}", start.elapsed());
    for line in t.output().lines() {
        info!("{line}");
    }

    for (i, root) in t.meshes().iter().enumerate() {
        let deepest = root.leafs().map(|c| c.depth()).max().unwrap_or(0);
        info!(
            "mesh {i}: {} leaves (max depth {deepest}), {} vertices, {} triangles",
            root.leafs().count(),
            root.vertex_count(),
            root.triangle_count(),
        );
    }
    if let Some(img) = t.image() {
        info!("height-map: {}x{} pixels", img.width, img.height);
    }

    if args.cam {
        t.start_cam(Arc::new(RasterWorkflow::default()))?;
        run_until(&mut t, &rx, args.frames, |t| !t.is_busy());
        match t.toolpath() {
            Some(p) => info!(
                "toolpath: {} strokes, {:.1} mm total",
                p.paths.len(),
                p.length()
            ),
            None => warn!("{}", t.status()),
        }
    }

    if let Some(path) = args.out {
        let options = ExportOptions {
            resolution: args.resolution,
            merge_leafs: args.merge_leafs,
            use_cms: args.cms,
            heightmap: args.heightmap,
            ..ExportOptions::new(path)
        };
        t.start_export(options)?;
        run_until(&mut t, &rx, args.frames, |t| !t.is_busy());
        if t.job_state(JobKind::Export) != Some(JobState::Done) {
            bail!("{}", t.status());
        }
        info!("{}", t.status());
    }

    if !t.shutdown(Duration::from_secs(1)) {
        warn!("some jobs did not stop in time");
    }
    Ok(())
}
