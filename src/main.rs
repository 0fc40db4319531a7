// ========================================================================================
//
//                          THE FITTING FRONT END: LDSHRINK
//
// ========================================================================================
//
// Reads a region bundle (GWAS marginal effects plus the LD blocks they were computed
// against), resolves the engine configuration from an optional TOML file and the
// command-line overrides, runs the fit and writes the weight table.

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ldshrink::config::{BurnIn, ConfigError, RidgeAlgo, SamplerKind};
use ldshrink::progress::{EngineKind, FitObserver, IterationReport};
use ldshrink::region::{BundleError, RegionError, ScalingMode, load_bundle};
use ldshrink::weights::{WeightFormat, WeightsError};
use ldshrink::{EngineConfig, FitError, GibbsConfig, RidgeConfig, fit_grouped, fit_weights};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::Instant;
use thiserror::Error;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[command(
    name = "ldshrink",
    version,
    about = "Bayesian polygenic score weights from GWAS summary statistics and LD blocks."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Empirical-Bayes ridge with learned heritability and shrinkage.
    Ridge(RidgeArgs),
    /// Continuous-shrinkage Gibbs sampler.
    Gibbs(GibbsArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Region bundle (TOML) with sample size, variants and LD blocks.
    #[arg(long)]
    bundle: PathBuf,

    /// Engine configuration file (TOML). Command-line options override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output weight file. Names ending in `legacyweights.tsv` select the legacy layout.
    #[arg(long, short)]
    out: PathBuf,

    /// Weight file layout: `prst` or `legacy`. Defaults to a choice based on the file name.
    #[arg(long)]
    format: Option<String>,

    /// Allele standard deviations used for scaling: `ref` or `target`.
    #[arg(long, default_value = "ref")]
    scaling: String,

    /// Fit each chromosome as an independent problem.
    #[arg(long)]
    group_by_chrom: bool,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    shuffle: bool,

    /// Record a per-iteration score trace.
    #[arg(long)]
    score: bool,

    #[arg(long)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct RidgeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Hyperparameter update: `mackay`, `em` or `fixed`.
    #[arg(long)]
    algo: Option<String>,

    /// Fixed heritability. Supplying it selects the fixed algorithm.
    #[arg(long)]
    h2: Option<f64>,

    #[arg(long)]
    h2start: Option<f64>,

    #[arg(long)]
    n_iter: Option<usize>,

    #[arg(long)]
    tol: Option<f64>,

    /// Fraction of eigenvalue mass kept per region.
    #[arg(long)]
    frac: Option<f64>,

    /// Fail instead of flooring a negative residual sum of squares.
    #[arg(long)]
    strict_rmse: bool,
}

#[derive(Args, Debug)]
struct GibbsArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Block sampler: `rue`, `bhat` or `sld`.
    #[arg(long)]
    sampler: Option<String>,

    #[arg(long)]
    n_iter: Option<usize>,

    /// Burn-in as an iteration count, or as a fraction of n_iter when below one.
    #[arg(long)]
    burnin: Option<BurnIn>,

    /// Keep every n-th draw after burn-in.
    #[arg(long)]
    n_slice: Option<usize>,

    #[arg(long)]
    a: Option<f64>,

    #[arg(long)]
    b: Option<f64>,

    /// Fixed global shrinkage. Learned when absent.
    #[arg(long)]
    phi: Option<f64>,

    /// Upper bound on local variance draws.
    #[arg(long)]
    clip: Option<f64>,

    #[arg(long, conflicts_with = "clip")]
    no_clip: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Bundle(#[from] BundleError),
    #[error("{0}")]
    Region(#[from] RegionError),
    #[error("{0}")]
    Weights(#[from] WeightsError),
    #[error("{0}")]
    Fit(#[from] FitError),
    #[error("Configuration file describes the '{found}' engine, but the '{expected}' subcommand was used")]
    EngineMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

// ========================================================================================
//                                  PROGRESS REPORTING
// ========================================================================================

struct ProgressBarObserver {
    enabled: bool,
    bar: Option<ProgressBar>,
}

impl ProgressBarObserver {
    fn new(enabled: bool) -> Self {
        Self { enabled, bar: None }
    }
}

impl FitObserver for ProgressBarObserver {
    fn on_start(&mut self, engine: EngineKind, total_iterations: usize, regions: usize) {
        let draw_target = if self.enabled && std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_iterations as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(format!("{} over {} regions", engine, regions));
        self.bar = Some(bar);
    }

    fn on_iteration(&mut self, report: &IterationReport) {
        if let Some(bar) = &self.bar {
            bar.set_position(report.iteration as u64);
            match (report.h2, report.sigma) {
                (Some(h2), _) => bar.set_message(format!("h2 = {:.4}", h2)),
                (None, Some(sigma)) => bar.set_message(format!("sigma = {:.4}", sigma)),
                (None, None) => {}
            }
        }
    }

    fn on_finish(&mut self, engine: EngineKind, iterations: usize) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        log::debug!("{} stopped after {} iterations", engine, iterations);
    }
}

// ========================================================================================
//                              CONFIGURATION RESOLUTION
// ========================================================================================

fn base_config(common: &CommonArgs, expected: &'static str) -> Result<Option<EngineConfig>, CliError> {
    let Some(path) = &common.config else {
        return Ok(None);
    };
    let config = EngineConfig::from_toml_path(path)?;
    if config.name() != expected {
        return Err(CliError::EngineMismatch {
            expected,
            found: config.name(),
        });
    }
    Ok(Some(config))
}

fn ridge_config(args: &RidgeArgs) -> Result<RidgeConfig, CliError> {
    let mut config = match base_config(&args.common, "ridge")? {
        Some(EngineConfig::Ridge(config)) => config,
        _ => RidgeConfig::default(),
    };
    if let Some(algo) = &args.algo {
        config.algo = algo.parse::<RidgeAlgo>()?;
    }
    config.h2 = args.h2.or(config.h2);
    config.h2start = args.h2start.unwrap_or(config.h2start);
    config.n_iter = args.n_iter.unwrap_or(config.n_iter);
    config.tol = args.tol.unwrap_or(config.tol);
    config.frac = args.frac.unwrap_or(config.frac);
    config.strict_rmse |= args.strict_rmse;
    config.shuffle |= args.common.shuffle;
    config.compute_score |= args.common.score;
    config.seed = args.common.seed.or(config.seed);
    config.validate()?;
    Ok(config)
}

fn gibbs_config(args: &GibbsArgs) -> Result<GibbsConfig, CliError> {
    let mut config = match base_config(&args.common, "gibbs")? {
        Some(EngineConfig::Gibbs(config)) => config,
        _ => GibbsConfig::default(),
    };
    if let Some(sampler) = &args.sampler {
        config.sampler = sampler.parse::<SamplerKind>()?;
    }
    config.n_iter = args.n_iter.unwrap_or(config.n_iter);
    config.burnin = args.burnin.unwrap_or(config.burnin);
    config.n_slice = args.n_slice.unwrap_or(config.n_slice);
    config.a = args.a.unwrap_or(config.a);
    config.b = args.b.unwrap_or(config.b);
    config.phi = args.phi.or(config.phi);
    if args.no_clip {
        config.clip = None;
    } else if args.clip.is_some() {
        config.clip = args.clip;
    }
    config.shuffle |= args.common.shuffle;
    config.compute_score |= args.common.score;
    config.seed = args.common.seed.or(config.seed);
    config.validate()?;
    Ok(config)
}

// ========================================================================================
//                                 THE MAIN LOGIC
// ========================================================================================

fn run(common: &CommonArgs, config: EngineConfig) -> Result<(), CliError> {
    let start_time = Instant::now();
    let scaling = common.scaling.parse::<ScalingMode>()?;
    let format = match &common.format {
        Some(name) => name.parse::<WeightFormat>()?,
        None => WeightFormat::from_path(&common.out),
    };

    log::info!("Loading region bundle {}", common.bundle.display());
    let store = load_bundle(&common.bundle)?;
    let mut observer = ProgressBarObserver::new(!common.no_progress);

    let table = if common.group_by_chrom {
        let grouped = fit_grouped(&store, &config, scaling, &mut observer)?;
        for (chrom, fit) in &grouped.groups {
            log::info!("Chromosome {}: {}", chrom, fit.summary());
        }
        grouped.table
    } else {
        let fitted = fit_weights(&store, &config, scaling, &mut observer)?;
        log::info!("{}", fitted.fit.summary());
        if let (Some(first), Some(last)) = (fitted.fit.scores().first(), fitted.fit.scores().last()) {
            log::info!("Score trace: first = {:.6e}, last = {:.6e}", first, last);
        }
        fitted.table
    };

    table.write(&common.out, format)?;
    log::info!("Finished in {:.2?}", start_time.elapsed());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Ridge(args) => {
            ridge_config(args).and_then(|config| run(&args.common, EngineConfig::Ridge(config)))
        }
        Command::Gibbs(args) => {
            gibbs_config(args).and_then(|config| run(&args.common, EngineConfig::Gibbs(config)))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
