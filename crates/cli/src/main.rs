// crates/cli/src/main.rs
//
// Entry point: parse flags, register datasets, then hand a worker closure
// to the rank launcher. Training vs evaluation is an explicit branch on the
// parsed flags, decided once per worker.
//
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use vitdet_core::{
    launch, ConfigBuilder, DatasetRegistry, DetConfig, Evaluator, LaunchConfig, Trainer,
    WorkerContext,
};

/// Port the `--debug` gate listens on before any work starts.
const DEBUG_ATTACH_PORT: u16 = 9310;

/// vitdet – train or evaluate a ViT-backed detector on COCO-format datasets
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Path to a YAML config file
    #[arg(long = "config-file", value_name = "PATH")]
    config_file: PathBuf,

    /// Block at startup until a client connects on port 9310
    #[arg(long)]
    debug: bool,

    /// Registry name for the training split
    #[arg(long = "train_dataset", default_value = "data_train")]
    train_dataset: String,

    /// Registry name for the validation split
    #[arg(long = "val_dataset", default_value = "data_val")]
    val_dataset: String,

    /// COCO instances JSON for the training split
    #[arg(long = "train_json", value_name = "PATH")]
    train_json: PathBuf,

    /// Image directory for the training split
    #[arg(long = "train_images", value_name = "DIR")]
    train_images: PathBuf,

    /// COCO instances JSON for the validation split
    #[arg(long = "val_json", value_name = "PATH")]
    val_json: PathBuf,

    /// Image directory for the validation split
    #[arg(long = "val_images", value_name = "DIR")]
    val_images: PathBuf,

    /// Evaluate the validation split instead of training
    #[arg(long = "eval-only")]
    eval_only: bool,

    /// Resume from the latest checkpoint in OUTPUT_DIR when one exists
    #[arg(long)]
    resume: bool,

    /// Workers per machine
    #[arg(long = "num-gpus", default_value_t = 1)]
    num_gpus: u32,

    /// Number of machines participating in the run
    #[arg(long = "num-machines", default_value_t = 1)]
    num_machines: u32,

    /// Rank of this machine, 0-based
    #[arg(long = "machine-rank", default_value_t = 0)]
    machine_rank: u32,

    /// Rendezvous URL shared by all machines ("auto" derives one per run)
    #[arg(long = "dist-url", default_value = "auto")]
    dist_url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Trailing KEY VALUE pairs applied on top of the config file
    #[arg(value_name = "OPTS", num_args = 0..)]
    opts: Vec<String>,
}

/// What a worker does once launched. Decided once from the flags; everything
/// downstream branches on this tag rather than on `Args` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Train,
    Eval,
}

impl Mode {
    fn from_args(args: &Args) -> Self {
        if args.eval_only {
            Mode::Eval
        } else {
            Mode::Train
        }
    }
}

fn main() -> Result<()> {
    // Load environment variables from a .env file when one is present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "vitdet={lvl},vitdet_core={lvl},vitdet_data={lvl}",
            lvl = log_level
        ))
        .init();

    info!("vitdet v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("command line: {:?}", args);

    if args.debug {
        wait_for_attach()?;
    }

    let launch_cfg = LaunchConfig {
        num_gpus: args.num_gpus,
        num_machines: args.num_machines,
        machine_rank: args.machine_rank,
        dist_url: args.dist_url.clone(),
    };

    let args = Arc::new(args);
    launch(&launch_cfg, move |ctx| {
        let args = Arc::clone(&args);
        async move { run_worker(&args, ctx).await }
    })
}

/// Block until something connects to the attach port. Lets an external
/// debugger or profiler latch onto the process before any dataset IO starts.
fn wait_for_attach() -> Result<()> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", DEBUG_ATTACH_PORT))
        .with_context(|| format!("failed to bind attach port {}", DEBUG_ATTACH_PORT))?;
    info!(
        "waiting for a client on 0.0.0.0:{} before continuing",
        DEBUG_ATTACH_PORT
    );
    let (_stream, peer) = listener
        .accept()
        .context("failed to accept on the attach port")?;
    info!("client attached from {}", peer);
    Ok(())
}

/// Per-rank body: register datasets, build the frozen config, then train or
/// evaluate according to the mode tag.
async fn run_worker(args: &Args, ctx: WorkerContext) -> Result<()> {
    let mut registry = DatasetRegistry::new();
    registry.register(
        &args.train_dataset,
        BTreeMap::new(),
        &args.train_json,
        &args.train_images,
    )?;
    registry.register(
        &args.val_dataset,
        BTreeMap::new(),
        &args.val_json,
        &args.val_images,
    )?;

    let cfg = setup(args, &ctx)?;

    match Mode::from_args(args) {
        Mode::Eval => {
            let evaluator = Evaluator::new(&cfg, &registry)?;
            let results = evaluator.run(args.resume).await?;
            if ctx.is_main_process() {
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
        }
        Mode::Train => {
            let mut trainer = Trainer::new(&cfg, &registry, ctx.is_main_process())?;
            trainer.resume_or_load(args.resume)?;
            trainer.train().await?;
        }
    }
    Ok(())
}

/// Build the frozen run config: defaults, ViT family fill-in, config file,
/// dataset names, then trailing overrides, in that order. Rank 0 also
/// materializes OUTPUT_DIR and drops a `config.yaml` snapshot into it so a
/// finished run is reproducible from its output directory alone.
fn setup(args: &Args, ctx: &WorkerContext) -> Result<DetConfig> {
    let cfg = ConfigBuilder::defaults()?
        .with_vit_defaults()?
        .merge_file(&args.config_file)?
        .set_datasets(&args.train_dataset, &args.val_dataset)
        .merge_overrides(&args.opts)?
        .freeze()?;

    if ctx.is_main_process() {
        std::fs::create_dir_all(&cfg.output_dir)
            .with_context(|| format!("failed to create output dir {}", cfg.output_dir))?;
        let snapshot = Path::new(&cfg.output_dir).join("config.yaml");
        std::fs::write(&snapshot, cfg.to_yaml()?)
            .with_context(|| format!("failed to write config snapshot {}", snapshot.display()))?;
        info!("full config saved to {}", snapshot.display());
    }

    info!(
        "rank {}/{} ready (config: {}, output: {})",
        ctx.rank,
        ctx.world_size,
        args.config_file.display(),
        cfg.output_dir
    );
    Ok(cfg)
}
