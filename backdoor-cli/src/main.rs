//! backdoor CLI: poison image datasets and manage training checkpoints.

mod commands;

use backdoor_core::config::ConfigSource;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Backdoor-attack research toolkit
#[derive(Parser, Debug)]
#[command(name = "backdoor", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (.toml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Stamp or blend a trigger into an image file or every image in a directory
    Poison {
        /// Input image or directory
        input: PathBuf,
        /// Output image or directory
        output: PathBuf,
        /// Attack to apply (defaults to the configured trigger)
        #[arg(long, value_enum, requires = "trigger")]
        attack: Option<Attack>,
        /// Trigger image path
        #[arg(long, requires = "attack")]
        trigger: Option<PathBuf>,
        /// Blend ratio for the blend attack
        #[arg(long)]
        alpha: Option<f32>,
    },
    /// Print the epochs that keep their own checkpoint file
    SavedEpochs {
        /// Total epochs (defaults to training.num_epochs)
        num_epochs: Option<usize>,
        #[arg(long)]
        stage: Option<usize>,
        #[arg(long)]
        min_interval: Option<usize>,
        #[arg(long)]
        max_interval: Option<usize>,
    },
    /// Inspect or seed a checkpoint directory
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Rebuild the configured components and restore them from a checkpoint
    Resume {
        /// Resume directive: "False" for scratch, "" for the latest, or a file name
        #[arg(long)]
        from: Option<String>,
        /// Checkpoint directory (defaults to training.ckpt_dir)
        #[arg(long)]
        ckpt_dir: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attack {
    Badnets,
    Blend,
}

#[derive(clap::Subcommand, Debug)]
pub enum CheckpointAction {
    /// Write an untrained epoch-0 `latest_model.pt` from the configured components
    Init {
        #[arg(long)]
        ckpt_dir: Option<PathBuf>,
    },
    /// List the checkpoints recorded in the directory manifest
    List {
        #[arg(long)]
        ckpt_dir: Option<PathBuf>,
    },
    /// Show the contents of one checkpoint file
    Inspect {
        /// File name inside the checkpoint directory, or a path
        name: String,
        #[arg(long)]
        ckpt_dir: Option<PathBuf>,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Write the default configuration to a file
    Init {
        /// Destination (defaults to the user config path)
        path: Option<PathBuf>,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "backdoor", "backdoor")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "backdoor.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, &ConfigSource::standard(cli.config))
}
