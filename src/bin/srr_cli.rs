use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;

use srr_core::config::IllPosedPolicy;
use srr_core::io::{load_stacks, read_volume, write_json, write_stacks, write_transforms, write_volume};
use srr_core::metrics::Similarity;
use srr_core::simulate::{phantom, simulate_stack, AcquisitionProtocol, MotionAmplitude, Orientation};
use srr_core::two_step::LoopState;
use srr_core::{
    initial_estimate, reconstruct_volume, AlphaSweep, CommandDriver, DeconvolutionMode, Grid,
    MotionCorrection, ParameterStudy, ReconstructionConfig, SolveReport, Stack, StaticDriver,
    TwoStepReconstruction,
};

/// Slice-to-volume super-resolution reconstruction.
///
/// Stacks are described by a JSON manifest listing, per stack, an
/// `(n_slices, nx, ny)` f32 image array (.npy), an optional u8 mask array,
/// and the acquisition geometry. Volumes are written as .npy with a .json
/// grid sidecar.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Single reconstruction without motion correction
    Reconstruct(SolveArgs),
    /// Alternate reconstruction with an external motion-correction command
    TwoStep {
        #[command(flatten)]
        solve: SolveArgs,
        #[command(flatten)]
        driver: DriverArgs,
    },
    /// Sweep the regularization weight and score against a reference volume
    Study {
        #[command(flatten)]
        solve: SolveArgs,
        #[command(flatten)]
        driver: DriverArgs,
        /// Reference volume (.npy with .json grid); also fixes the grid
        #[arg(long)]
        truth: PathBuf,
        #[arg(long)]
        alpha_low: f64,
        #[arg(long)]
        alpha_high: f64,
        #[arg(long, default_value_t = 5)]
        alpha_count: usize,
        /// Space alpha values logarithmically
        #[arg(long)]
        log_spacing: bool,
        #[arg(long, value_enum, default_value_t = SimilarityArg::Ncc)]
        similarity: SimilarityArg,
    },
    /// Write synthetic stacks of a smooth phantom
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SolveArgs {
    /// Stack manifest (JSON)
    #[arg(long)]
    stacks: PathBuf,

    /// Reconstruction config (JSON); command-line values override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    alpha: Option<f64>,

    #[arg(long)]
    iter_max: Option<usize>,

    #[arg(long)]
    iter_max_first: Option<usize>,

    #[arg(long)]
    cycles: Option<usize>,

    /// Isotropic reconstruction spacing in mm
    #[arg(long)]
    resolution: Option<f64>,

    /// Existing volume whose grid is resampled to the target resolution
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Pin voxels without slice data to zero instead of failing
    #[arg(long)]
    zero_fill: bool,

    /// Part of the slice PSF to deconvolve
    #[arg(long, value_enum)]
    deconvolution: Option<DeconvolutionArg>,

    /// Gaussian FWHM (mm, slice axes) used for every slice instead of its own PSF
    #[arg(long, value_delimiter = ',', num_args = 3, conflicts_with = "deconvolution")]
    predefined_fwhm: Option<Vec<f64>>,

    #[arg(long)]
    output_dir: PathBuf,
}

#[derive(Args, Debug)]
struct DriverArgs {
    /// Registration command; slice transforms stay fixed if omitted
    #[arg(long)]
    driver: Option<PathBuf>,

    /// Extra arguments placed before the cycle directory
    #[arg(long = "driver-arg", allow_hyphen_values = true)]
    driver_args: Vec<String>,

    #[arg(long, default_value_t = 600)]
    driver_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Phantom grid edge length in voxels
    #[arg(long, default_value_t = 32)]
    size: usize,

    /// Phantom voxel spacing in mm
    #[arg(long, default_value_t = 1.0)]
    voxel: f64,

    #[arg(long, default_value = "axial,coronal,sagittal", value_delimiter = ',')]
    orientations: Vec<Orientation>,

    #[arg(long, default_value_t = 1.0)]
    in_plane_spacing: f64,

    #[arg(long, default_value_t = 2.0)]
    thickness: f64,

    #[arg(long, default_value_t = 0.0)]
    noise: f64,

    /// Maximum per-slice rotation in degrees
    #[arg(long, default_value_t = 0.0)]
    motion_degrees: f64,

    /// Maximum per-slice translation in mm
    #[arg(long, default_value_t = 0.0)]
    motion_mm: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long)]
    output_dir: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DeconvolutionArg {
    Full3d,
    OnlyInPlane,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SimilarityArg {
    Ncc,
    Rmse,
    Psnr,
}

impl From<SimilarityArg> for Similarity {
    fn from(arg: SimilarityArg) -> Self {
        match arg {
            SimilarityArg::Ncc => Similarity::Ncc,
            SimilarityArg::Rmse => Similarity::Rmse,
            SimilarityArg::Psnr => Similarity::Psnr,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Commands::Reconstruct(solve) => reconstruct(&solve),
        Commands::TwoStep { solve, driver } => two_step(&solve, &driver),
        Commands::Study {
            solve,
            driver,
            truth,
            alpha_low,
            alpha_high,
            alpha_count,
            log_spacing,
            similarity,
        } => {
            let sweep = if log_spacing {
                AlphaSweep::logarithmic(alpha_low, alpha_high, alpha_count)
            } else {
                AlphaSweep::linear(alpha_low, alpha_high, alpha_count)
            };
            study(&solve, &driver, &truth, sweep, similarity.into())
        }
        Commands::Simulate(args) => simulate(&args),
    }
}

/// `report.json` of a two-step run.
#[derive(Serialize)]
struct TwoStepReport<'a> {
    states: &'a [LoopState],
    reports: &'a [SolveReport],
}

struct Prepared {
    config: ReconstructionConfig,
    stacks: Vec<Stack>,
}

fn prepare(args: &SolveArgs) -> Result<Prepared> {
    let mut config = match &args.config {
        Some(path) => ReconstructionConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {:?}: {}", path, e))?,
        None => ReconstructionConfig::default(),
    };
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(n) = args.iter_max {
        config.iter_max = n;
    }
    if args.iter_max_first.is_some() {
        config.iter_max_first = args.iter_max_first;
    }
    if let Some(n) = args.cycles {
        config.two_step_cycles = n;
    }
    if args.resolution.is_some() {
        config.resolution = args.resolution;
    }
    if args.zero_fill {
        config.ill_posed_policy = IllPosedPolicy::ZeroFill;
    }
    match (args.deconvolution, &args.predefined_fwhm) {
        (Some(DeconvolutionArg::Full3d), _) => config.deconvolution = DeconvolutionMode::Full3d,
        (Some(DeconvolutionArg::OnlyInPlane), _) => {
            config.deconvolution = DeconvolutionMode::OnlyInPlane
        }
        (None, Some(fwhm)) => {
            let fwhm: [f64; 3] = fwhm
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("--predefined-fwhm takes three values"))?;
            config.deconvolution = DeconvolutionMode::PredefinedCovariance { fwhm };
        }
        (None, None) => {}
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let stacks = load_stacks(&args.stacks)
        .map_err(|e| anyhow::anyhow!("Failed to load stacks {:?}: {}", args.stacks, e))?;
    fs::create_dir_all(&args.output_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create {:?}: {}", args.output_dir, e))?;
    Ok(Prepared { config, stacks })
}

fn reference_grid(path: &Option<PathBuf>) -> Result<Option<Grid>> {
    path.as_ref()
        .map(|p| {
            read_volume(p)
                .map(|v| v.grid().clone())
                .map_err(|e| anyhow::anyhow!("Failed to read reference volume {:?}: {}", p, e))
        })
        .transpose()
}

fn make_driver(args: &DriverArgs, work_dir: PathBuf) -> Box<dyn MotionCorrection> {
    match &args.driver {
        Some(program) => Box::new(
            CommandDriver::new(program, work_dir)
                .with_args(args.driver_args.iter().cloned())
                .with_timeout(Duration::from_secs(args.driver_timeout_secs)),
        ),
        None => Box::new(StaticDriver),
    }
}

fn output_path(dir: &Path, config: &ReconstructionConfig, n_stacks: usize) -> PathBuf {
    dir.join(format!("{}.npy", config.setting_specific_name("recon", n_stacks)))
}

fn reconstruct(args: &SolveArgs) -> Result<()> {
    let Prepared { config, stacks } = prepare(args)?;
    let reference = reference_grid(&args.reference)?;
    let initial = initial_estimate(&stacks, &config, reference.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to build initial estimate: {}", e))?;

    let (volume, report) = reconstruct_volume(&stacks, &initial, &config)
        .map_err(|e| anyhow::anyhow!("Reconstruction failed: {}", e))?;

    let output = output_path(&args.output_dir, &config, stacks.len());
    write_volume(&output, &volume)
        .map_err(|e| anyhow::anyhow!("Failed to write volume {:?}: {}", output, e))?;
    write_json(&args.output_dir.join("report.json"), &report)
        .map_err(|e| anyhow::anyhow!("Failed to write report: {}", e))?;

    println!(
        "Reconstruction written to {:?} ({} iterations, converged: {})",
        output, report.iterations, report.converged
    );
    Ok(())
}

fn two_step(args: &SolveArgs, driver_args: &DriverArgs) -> Result<()> {
    let Prepared { config, stacks } = prepare(args)?;
    let reference = reference_grid(&args.reference)?;
    let initial = initial_estimate(&stacks, &config, reference.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to build initial estimate: {}", e))?;

    let driver = make_driver(driver_args, args.output_dir.join("motion"));
    let n_stacks = stacks.len();
    let outcome = TwoStepReconstruction::new(&config, driver)
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?
        .run(stacks, initial)
        .map_err(|e| anyhow::anyhow!("Two-step reconstruction failed: {}", e))?;

    let output = output_path(&args.output_dir, &config, n_stacks);
    write_volume(&output, &outcome.volume)
        .map_err(|e| anyhow::anyhow!("Failed to write volume {:?}: {}", output, e))?;
    write_transforms(&args.output_dir.join("transforms.json"), &outcome.transforms)
        .map_err(|e| anyhow::anyhow!("Failed to write transforms: {}", e))?;
    let report = TwoStepReport {
        states: &outcome.states,
        reports: &outcome.reports,
    };
    write_json(&args.output_dir.join("report.json"), &report)
        .map_err(|e| anyhow::anyhow!("Failed to write report: {}", e))?;

    println!(
        "Reconstruction written to {:?} after {} cycle(s)",
        output, config.two_step_cycles
    );
    Ok(())
}

fn study(
    args: &SolveArgs,
    driver_args: &DriverArgs,
    truth: &Path,
    sweep: AlphaSweep,
    similarity: Similarity,
) -> Result<()> {
    let Prepared { mut config, stacks } = prepare(args)?;
    let reference = read_volume(truth)
        .map_err(|e| anyhow::anyhow!("Failed to read reference volume {:?}: {}", truth, e))?;
    if config.resolution.is_none() {
        config.resolution = Some(reference.grid().spacing.x);
    }
    let initial = initial_estimate(&stacks, &config, Some(reference.grid()))
        .map_err(|e| anyhow::anyhow!("Failed to build initial estimate: {}", e))?;
    if !initial.grid().same_geometry(reference.grid()) {
        anyhow::bail!(
            "reference grid {:?} does not match the reconstruction grid {:?}; \
             pass --resolution equal to the reference spacing",
            reference.grid().shape,
            initial.grid().shape
        );
    }

    let motion_dir = args.output_dir.join("motion");
    let report = ParameterStudy::new(&config, sweep, &reference)
        .with_similarity(similarity)
        .run(&stacks, &initial, |alpha| {
            make_driver(
                driver_args,
                motion_dir.join(format!("alpha{alpha}").replace('.', "p")),
            )
        })
        .map_err(|e| anyhow::anyhow!("Parameter study failed: {}", e))?;

    let summary = report.summary();
    write_json(&args.output_dir.join("study.json"), &summary)
        .map_err(|e| anyhow::anyhow!("Failed to write study report: {}", e))?;
    let best = config.with_alpha(summary.best_alpha);
    let output = output_path(&args.output_dir, &best, stacks.len());
    write_volume(&output, &report.into_best_volume())
        .map_err(|e| anyhow::anyhow!("Failed to write volume {:?}: {}", output, e))?;

    println!(
        "Best alpha {} ({:?} = {:.6}); volume written to {:?}",
        summary.best_alpha, similarity, summary.best_score, output
    );
    Ok(())
}

fn simulate(args: &SimulateArgs) -> Result<()> {
    let grid = Grid::isotropic([args.size; 3], nalgebra::Vector3::zeros(), args.voxel)
        .map_err(|e| anyhow::anyhow!("Invalid phantom grid: {}", e))?;
    let truth = phantom(&grid).map_err(|e| anyhow::anyhow!("Failed to build phantom: {}", e))?;
    let ctx = ReconstructionConfig::default().operator_context();

    let mut stacks = Vec::with_capacity(args.orientations.len());
    let mut motion = Vec::with_capacity(args.orientations.len());
    for (i, &orientation) in args.orientations.iter().enumerate() {
        let mut protocol = AcquisitionProtocol::new(orientation, args.in_plane_spacing, args.thickness);
        protocol.noise_sigma = args.noise;
        protocol.seed = args.seed.wrapping_add(i as u64);
        if args.motion_degrees > 0.0 || args.motion_mm > 0.0 {
            protocol.motion = Some(MotionAmplitude {
                rotation: args.motion_degrees.to_radians(),
                translation: args.motion_mm,
            });
        }
        let simulated = simulate_stack(&truth, &protocol, ctx)
            .map_err(|e| anyhow::anyhow!("Failed to simulate {} stack: {}", orientation.name(), e))?;
        info!("simulated {} stack with {} slices", orientation.name(), simulated.stack.len());
        stacks.push(simulated.stack);
        motion.push(simulated.motion);
    }

    let manifest = write_stacks(&args.output_dir, &stacks)
        .map_err(|e| anyhow::anyhow!("Failed to write stacks: {}", e))?;
    write_volume(&args.output_dir.join("truth.npy"), &truth)
        .map_err(|e| anyhow::anyhow!("Failed to write phantom: {}", e))?;
    write_transforms(&args.output_dir.join("motion.json"), &motion)
        .map_err(|e| anyhow::anyhow!("Failed to write motion: {}", e))?;

    println!("Simulated {} stack(s); manifest written to {:?}", stacks.len(), manifest);
    Ok(())
}
