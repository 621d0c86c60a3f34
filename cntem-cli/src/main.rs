// Cntem command line interface
// Replays recorded frames through a counting session and manages configuration

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use cntem_core::{ConfigFormat, CounterConfig, EvidenceMode};
use cntem_eye::camera::load_frame;
use cntem_eye::{CountingPipeline, ObjectDetector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL: &str = "yolov8n-bottles.onnx";
const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

#[derive(Parser)]
#[command(name = "cntem")]
#[command(about = "Count bottles and cans passing through a camera's view", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a directory of still frames through a counting session
    Replay {
        /// Directory of frames, processed in file name order
        dir: PathBuf,

        /// Configuration file (JSON, TOML or YAML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Evidence source, overrides the configuration
        #[arg(long, short)]
        mode: Option<ModeArg>,

        /// ONNX model for detector mode (default: ~/.cntem/models/yolov8n-bottles.onnx)
        #[arg(long)]
        model: Option<PathBuf>,

        /// Frame rate the frames were captured at
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Print every frame report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Validate a configuration file
    Check {
        file: PathBuf,
    },

    /// Print the effective configuration
    Show {
        /// Configuration file to start from instead of the defaults
        #[arg(long, short)]
        file: Option<PathBuf>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "toml")]
        format: FormatArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Detector,
    Tripwire,
}

impl From<ModeArg> for EvidenceMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Detector => EvidenceMode::Detector,
            ModeArg::Tripwire => EvidenceMode::Tripwire,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Toml,
    Yaml,
}

impl From<FormatArg> for ConfigFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Json => ConfigFormat::Json,
            FormatArg::Toml => ConfigFormat::Toml,
            FormatArg::Yaml => ConfigFormat::Yaml,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Replay {
            dir,
            config,
            mode,
            model,
            fps,
            json,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(mode) = mode {
                config.mode = mode.into();
            }
            replay(&dir, config, model, fps, json).await?;
        }
        Commands::Config(cmd) => handle_config_command(cmd)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CounterConfig> {
    let mut config = match path {
        Some(path) => CounterConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => CounterConfig::default(),
    };
    config.apply_env().context("Invalid CNTEM_* environment override")?;
    Ok(config)
}

async fn replay(dir: &Path, mut config: CounterConfig, model: Option<PathBuf>, fps: u32, json: bool) -> anyhow::Result<()> {
    if fps == 0 {
        bail!("--fps must be at least 1");
    }

    let detector = match config.mode {
        EvidenceMode::Detector => {
            // the model's own class list is the vocabulary it can be filtered by
            if config.target_classes != config.decoder.class_names {
                info!("Using model classes {:?} as target classes", config.decoder.class_names);
                config.target_classes = config.decoder.class_names.clone();
            }
            let path = model.or_else(default_model_path);
            load_detector(path.as_deref(), &config)?
        }
        EvidenceMode::Tripwire => None,
    };

    let mut pipeline = CountingPipeline::from_config(config, detector).context("Failed to start counting session")?;
    let frames = frame_paths(dir)?;
    if frames.is_empty() {
        bail!("No frames found in {}", dir.display());
    }
    info!(
        "Replaying {} frames from {} with {} evidence",
        frames.len(),
        dir.display(),
        pipeline.evidence_name()
    );

    let frame_interval = Duration::from_secs_f64(1.0 / fps as f64);
    for (sequence, path) in frames.iter().enumerate() {
        let timestamp = frame_interval * sequence as u32;
        let frame = match load_frame(path, sequence as u64, timestamp) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        let Some(report) = pipeline.process(&frame).await else {
            continue;
        };

        if json {
            println!("{}", serde_json::to_string(&report)?);
        }
        if report.count_delta > 0 {
            let labels: Vec<&str> = report
                .tracks
                .iter()
                .filter(|t| report.confirmed_ids.contains(&t.id))
                .map(|t| pipeline.config().display_name(&t.class_name))
                .collect();
            let label = if labels.is_empty() { "item".to_string() } else { labels.join(", ") };
            info!(
                "+{} {} at {} (total {})",
                report.count_delta,
                label,
                path.display(),
                pipeline.total()
            );
        }
    }

    pipeline.stop();
    println!("Total: {}", pipeline.total());
    Ok(())
}

fn default_model_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cntem").join("models").join(DEFAULT_MODEL))
}

#[cfg(feature = "onnx")]
fn load_detector(path: Option<&Path>, config: &CounterConfig) -> anyhow::Result<Option<Arc<dyn ObjectDetector>>> {
    use cntem_eye::models::{BoxDecoder, OnnxModel};
    use cntem_eye::TensorDetector;

    let Some(path) = path else {
        warn!("No model path and no home directory to look in");
        return Ok(None);
    };

    match OnnxModel::new(path, config.decoder.input_size) {
        Ok(model) => {
            let decoder = BoxDecoder::from_config(&config.decoder);
            Ok(Some(Arc::new(TensorDetector::new(model, decoder))))
        }
        Err(e) => {
            warn!("Detector unavailable: {}", e);
            Ok(None)
        }
    }
}

#[cfg(not(feature = "onnx"))]
fn load_detector(path: Option<&Path>, _config: &CounterConfig) -> anyhow::Result<Option<Arc<dyn ObjectDetector>>> {
    if let Some(path) = path {
        warn!(
            "Ignoring model {}: this build has no ONNX support (enable the `onnx` feature)",
            path.display()
        );
    }
    Ok(None)
}

/// Image files in `dir`, sorted by file name
fn frame_paths(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame {
            paths.push(path);
        } else {
            debug!("Ignoring {}", path.display());
        }
    }

    paths.sort();
    Ok(paths)
}

fn handle_config_command(cmd: ConfigCommands) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Check { file } => {
            let config = CounterConfig::from_file(&file)
                .with_context(|| format!("Failed to load configuration from {}", file.display()))?;
            config
                .validate()
                .with_context(|| format!("{} is not a valid configuration", file.display()))?;
            println!("{}: ok ({:?} mode)", file.display(), config.mode);
        }
        ConfigCommands::Show { file, format } => {
            let config = load_config(file.as_deref())?;
            let rendered = config.render(format.into())?;
            println!("{}", rendered);
        }
    }

    Ok(())
}
