//! Command-line interface for infer-bridge.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Drive the reference inference engine through the asynchronous bridge.
#[derive(Parser, Debug)]
#[command(name = "infer-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print plugin versions for a device.
    Versions {
        /// Device name (CPU, GPU).
        #[arg(short, long, default_value = "CPU")]
        device: String,
    },

    /// Parse a model and print its inputs and outputs.
    Info {
        /// Path to the model description.
        #[arg(short, long)]
        model: PathBuf,

        /// Path to the weights file.
        #[arg(short, long)]
        weights: PathBuf,
    },

    /// Run a model end to end.
    Infer {
        /// Path to the model description.
        #[arg(short, long)]
        model: PathBuf,

        /// Path to the weights file.
        #[arg(short, long)]
        weights: PathBuf,

        /// Device to compile for. Defaults to `engine.device` from the config.
        #[arg(short, long)]
        device: Option<String>,

        /// Path to input data (JSON object mapping input name to values).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// How the run is driven.
        #[arg(long, value_enum, default_value_t = RunMode::Sync)]
        mode: RunMode,

        /// Path to optional config file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

/// How `infer` runs the request.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Block the host thread in `infer`.
    Sync,
    /// Run on a worker and wait on the promise.
    Async,
    /// Start on the engine's threads and wait for the completion notifier.
    Notify,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Pretty,
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_infer_with_defaults() {
        let cli = Cli::try_parse_from([
            "infer-bridge",
            "infer",
            "--model",
            "m.yaml",
            "--weights",
            "m.bin",
        ])
        .unwrap();
        match cli.command {
            Commands::Infer {
                device,
                mode,
                format,
                ..
            } => {
                assert_eq!(device, None);
                assert_eq!(mode, RunMode::Sync);
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::try_parse_from(["infer-bridge", "versions", "--verbose"]).unwrap();
        assert!(cli.verbose);
    }
}
