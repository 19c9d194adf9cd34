use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use kinetoscope_core::catalog::LabelCatalog;
use kinetoscope_core::decode::MODEL_INPUT_SIZE;
use kinetoscope_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use kinetoscope_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER,
};
use kinetoscope_core::model_registry::{ModelMode, ModelRegistry};
use kinetoscope_core::pipeline::{AnalysisOptions, AnalysisReport, AnalysisRun};
use kinetoscope_core::render::RenderConfig;

#[derive(Parser)]
#[command(name = "kinetoscope", about = "Streaming video action recognition with confidence charts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a clip and render the confidence visualization
    Analyze(AnalyzeArgs),
    /// Inspect and fetch models
    Models {
        #[command(subcommand)]
        command: ModelsCommands,
    },
}

#[derive(Args)]
struct AnalyzeArgs {
    #[arg(help = "Path to the input video (mp4 or gif)")]
    video: PathBuf,
    #[arg(long, value_name = "MODE", help = "Inference mode: base or stream")]
    mode: Option<String>,
    #[arg(long, value_name = "ID", help = "Model identifier from the registry")]
    model: Option<String>,
    #[arg(short = 'k', long = "top-k", value_name = "N", help = "Number of predictions to track")]
    top_k: Option<usize>,
    #[arg(short = 'o', long, value_name = "PATH", help = "Visualization output path")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Label catalog file, one label per line")]
    labels: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ModelsCommands {
    /// List known models and their download state
    List,
    /// Download a model (and the label catalog) into the models directory
    Download {
        #[arg(help = "Model identifier, e.g. movinet_a2_stream")]
        name: String,
    },
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(resolved_data_dir.as_path());

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&resolved_data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let registry = build_registry(&resolved_data_dir, &config);

    match cli.command {
        Commands::Analyze(args) => run_analyze(&resolved_data_dir, &config, &registry, args),
        Commands::Models { command } => match command {
            ModelsCommands::List => run_models_list(&registry),
            ModelsCommands::Download { name } => run_models_download(&registry, &name),
        },
    }
}

fn build_registry(data_dir: &Path, config: &AppConfig) -> ModelRegistry {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let mut registry = ModelRegistry::with_builtin_models(models_dir);
    if let Err(e) = registry.discover() {
        warn!(error = %e, "Failed to scan models directory");
    }
    registry
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.console_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&console_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        pid,
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn run_analyze(
    data_dir: &Path,
    config: &AppConfig,
    registry: &ModelRegistry,
    args: AnalyzeArgs,
) -> Result<()> {
    if !args.video.exists() {
        bail!("input video does not exist: {}", args.video.display());
    }

    let model_id = args
        .model
        .unwrap_or_else(|| config.analysis.model_id.clone());
    let mode: ModelMode = args
        .mode
        .as_deref()
        .unwrap_or(config.analysis.model_mode.as_str())
        .parse()?;

    ensure_model_available(registry, &model_id)?;
    let input_size = registry
        .get(&model_id)
        .map(|entry| entry.input_size)
        .unwrap_or(MODEL_INPUT_SIZE);
    let catalog = load_catalog(registry, args.labels.as_deref())?;

    let top_k = args.top_k.unwrap_or(config.analysis.top_k);
    let output_path = match args.output {
        Some(path) => path,
        None => default_output_path(&args.video, &resolve_relative_to(data_dir, &config.paths.work_dir)),
    };
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory: {}", parent.display())
            })?;
        }
    }

    let options = AnalysisOptions {
        model_id,
        mode,
        top_k,
        input_size,
        video_fps_override: config.analysis.video_fps,
        output_path,
        render: RenderConfig {
            figure_height: config.analysis.figure_height,
            playhead_scale: config.analysis.playhead_scale as f64,
            output_fps: config.analysis.output_fps,
        },
    };

    let mut run = AnalysisRun::prepare(&args.video, catalog, options)?;
    let report = run.run(registry)?;
    print_report(&report);
    Ok(())
}

/// Fetches the model on demand so `analyze` works on a fresh install.
fn ensure_model_available(registry: &ModelRegistry, model_id: &str) -> Result<()> {
    if registry.is_downloaded(model_id) {
        return Ok(());
    }
    if registry.get(model_id).is_none() {
        bail!(
            "unknown model '{}'; run `kinetoscope models list` to see what is available",
            model_id
        );
    }

    info!(model = %model_id, "model not present locally, downloading");
    registry.download(model_id)?;
    Ok(())
}

fn load_catalog(registry: &ModelRegistry, override_path: Option<&Path>) -> Result<LabelCatalog> {
    let path = match override_path {
        Some(path) => path.to_path_buf(),
        None => {
            if !registry.has_labels() {
                info!("label catalog not present locally, downloading");
                registry.download_labels()?;
            }
            registry.labels_path()
        }
    };

    LabelCatalog::load_from_path(&path)
}

/// `<work_dir>/<input stem>_analysis.mp4`.
fn default_output_path(video: &Path, work_dir: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "analysis".to_string());
    work_dir.join(format!("{stem}_analysis.mp4"))
}

fn print_report(report: &AnalysisReport) {
    println!(
        "Analyzed {} frames ({:.2}s of video)",
        report.frames, report.duration_seconds
    );
    for (rank, (label, probability)) in report.top.iter().enumerate() {
        println!("  {}. {:<40} {:5.1}%", rank + 1, label, probability * 100.0);
    }
    if let Some(path) = &report.output_path {
        println!("Visualization written to {}", path.display());
    }
}

fn run_models_list(registry: &ModelRegistry) -> Result<()> {
    for entry in registry.list() {
        let state = if registry.is_downloaded(&entry.name) {
            "downloaded"
        } else {
            "available"
        };
        println!(
            "{:<24} {:<8} {:<12} {}",
            entry.name,
            entry.mode.to_string(),
            state,
            entry.description
        );
    }
    let labels = if registry.has_labels() {
        "downloaded"
    } else {
        "available"
    };
    println!("{:<24} {:<8} {:<12} Kinetics-600 label catalog", "labels", "-", labels);
    Ok(())
}

fn run_models_download(registry: &ModelRegistry, name: &str) -> Result<()> {
    let path = registry.download(name)?;
    println!("Model saved to {}", path.display());

    if !registry.has_labels() {
        let labels = registry.download_labels()?;
        println!("Labels saved to {}", labels.display());
    }
    Ok(())
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::select_log_filter(&options)
}



#[cfg(test)]
mod mode_parse_tests {
    use super::*;

    #[test]
    fn parses_both_modes() {
        assert_eq!("base".parse::<ModelMode>().unwrap(), ModelMode::Base);
        assert_eq!("stream".parse::<ModelMode>().unwrap(), ModelMode::Stream);
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!("fast".parse::<ModelMode>().is_err());
    }
}
