use clap::{Parser, Subcommand};
use drawbatch::batch::{self, BatchDriver};
use drawbatch::checkpoint::CheckpointStore;
use drawbatch::client::HttpClient;
use drawbatch::config::{self, BatchConfig, ConfigError};
use drawbatch::metrics::{FixedSampler, MetricsLog, ResourceSampler, SystemSampler};
use drawbatch::output;
use drawbatch::queue::{self, Selection, WorkItem};
use drawbatch::request::Params;
use drawbatch::writer::OutputWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Flags shared by the run subcommands.
#[derive(clap::Args, Clone)]
struct RunArgs {
    /// Output root (overrides the config file)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Checkpoint log of completed items (overrides the config file)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Metrics CSV (overrides the config file)
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Build the queue and show what would run, without contacting the server
    #[arg(long)]
    dry_run: bool,

    /// Record zero CPU / RAM usage instead of sampling the host
    #[arg(long)]
    no_resource_sampling: bool,
}

fn version_string() -> &'static str {
    if env!("DRAWBATCH_ON_RELEASE_TAG") == "true" {
        return env!("CARGO_PKG_VERSION");
    }
    match env!("DRAWBATCH_GIT_HASH") {
        "" => "dev@unknown",
        hash => Box::leak(format!("dev@{hash}").into_boxed_str()),
    }
}

#[derive(Parser)]
#[command(name = "drawbatch")]
#[command(about = "Resumable batch driver for local image generation servers")]
#[command(long_about = "\
Resumable batch driver for local image generation servers

Sends one request per work item to a Draw Things / Automatic1111-style API,
saves every returned image as PNG, appends a metrics row per image, and
records completed items so an interrupted run resumes where it stopped.

Run modes:

  txt2img   Prompts from the template table, selected by nation and category
            generations/<nation>/<category>/<nation>_<category>_<n>_<i>.png

  img2img   Every image below the input directory, structure mirrored
            upscaled/<relative dir>/<stem>_upscaled_<i>.png

Re-running the same command skips everything already recorded in the
checkpoint log and retries everything that failed.

Run 'drawbatch gen-config' to generate a documented drawbatch.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file [default: drawbatch.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Generation server base URL (overrides the config file)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate images from prompt templates
    Txt2img {
        /// Selection to generate; repeatable [default: [[txt2img.queue]] from config]
        #[arg(long = "select", value_name = "NATION:CATEGORY:COUNT")]
        selections: Vec<Selection>,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Send every image below a directory through image-to-image
    Img2img {
        /// Input root scanned recursively (overrides the config file)
        #[arg(long)]
        input: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },
    /// List the nations available in the template table
    Nations,
    /// Print a stock drawbatch.toml with all options documented
    GenConfig,
}

/// Artifact locations for one run, CLI flags over config values.
struct RunPaths {
    output: PathBuf,
    checkpoint: PathBuf,
    metrics: PathBuf,
}

impl RunPaths {
    fn resolve(run: &RunArgs, output: &str, checkpoint: &str, metrics: &str) -> Self {
        Self {
            output: run.output.clone().unwrap_or_else(|| output.into()),
            checkpoint: run.checkpoint.clone().unwrap_or_else(|| checkpoint.into()),
            metrics: run.metrics.clone().unwrap_or_else(|| metrics.into()),
        }
    }
}

/// Everything needed to run one mode, independent of how the queue was built.
struct Job<'a> {
    config: &'a BatchConfig,
    endpoint: &'a str,
    params: &'a Params,
    paths: RunPaths,
    queue: Vec<WorkItem>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.api.base_url = base_url;
        config.validate()?;
    }

    match cli.command {
        Command::Txt2img { selections, run } => {
            let selections = if selections.is_empty() {
                config.txt2img.queue.clone()
            } else {
                selections
            };
            if selections.is_empty() {
                return Err(ConfigError::Validation(
                    "nothing selected: pass --select NATION:CATEGORY:COUNT or add [[txt2img.queue]] entries"
                        .into(),
                )
                .into());
            }
            let queue = queue::build_template_queue(
                &config.txt2img.templates,
                &selections,
                &config.txt2img.prompt_suffix,
            );
            let paths = RunPaths::resolve(
                &run,
                &config.txt2img.output,
                &config.txt2img.checkpoint,
                &config.txt2img.metrics,
            );
            execute(
                Job {
                    config: &config,
                    endpoint: &config.txt2img.endpoint,
                    params: &config.txt2img.params,
                    paths,
                    queue,
                },
                &run,
            )?;
        }
        Command::Img2img { input, run } => {
            let input = input.unwrap_or_else(|| config.img2img.input.clone().into());
            let paths = RunPaths::resolve(
                &run,
                &config.img2img.output,
                &config.img2img.checkpoint,
                &config.img2img.metrics,
            );
            let queue = queue::scan_directory(
                &input,
                &config.img2img.extensions,
                Some(&paths.output),
                &config.img2img.output_suffix,
            )?;
            tracing::info!(input = %input.display(), items = queue.len(), "scanned input");
            execute(
                Job {
                    config: &config,
                    endpoint: &config.img2img.endpoint,
                    params: &config.img2img.params,
                    paths,
                    queue,
                },
                &run,
            )?;
        }
        Command::Nations => {
            output::print_nations(&queue::available_nations(&config.txt2img.templates));
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "drawbatch=debug"
    } else {
        "drawbatch=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// An explicitly named config file must exist; the default one is optional.
fn load_config(explicit: Option<&Path>) -> Result<BatchConfig, ConfigError> {
    match explicit {
        Some(path) if !path.exists() => Err(ConfigError::NotFound(path.to_path_buf())),
        Some(path) => config::load_config(path),
        None => config::load_config(Path::new(config::DEFAULT_CONFIG_FILE)),
    }
}

fn execute(job: Job<'_>, run: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let checkpoint = CheckpointStore::load(&job.paths.checkpoint)?;
    tracing::info!(
        path = %checkpoint.path().display(),
        completed = checkpoint.len(),
        "loaded checkpoint"
    );

    if run.dry_run {
        let (pending, done) = batch::plan(&job.queue, &checkpoint);
        output::print_plan(&pending, &done);
        return Ok(());
    }

    std::fs::create_dir_all(&job.paths.output).map_err(|e| {
        ConfigError::Validation(format!(
            "cannot create output root {}: {e}",
            job.paths.output.display()
        ))
    })?;

    let client = HttpClient::new(
        &job.config.api.base_url,
        job.endpoint,
        Duration::from_secs(job.config.api.timeout_secs),
    )?;
    tracing::info!(url = client.url(), items = job.queue.len(), "starting batch");

    let sampler: Box<dyn ResourceSampler> = if run.no_resource_sampling {
        Box::new(FixedSampler::default())
    } else {
        Box::new(SystemSampler::new())
    };

    let (tx, rx) = std::sync::mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            for line in output::format_event(&event) {
                println!("{}", line);
            }
        }
    });

    let mut driver = BatchDriver::new(
        client,
        sampler,
        job.params.clone(),
        OutputWriter::new(&job.paths.output),
        MetricsLog::new(&job.paths.metrics),
        checkpoint,
    )
    .with_events(tx);
    let report = driver.run(&job.queue);
    // Dropping the driver closes the channel so the printer drains and exits
    drop(driver);
    if printer.join().is_err() {
        tracing::warn!("progress printer panicked");
    }

    output::print_summary(&report);
    Ok(())
}
