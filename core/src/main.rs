//! CLI entry point for infer-bridge.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use infer_bridge::cli::{Cli, Commands, OutputFormat, RunMode};
use infer_bridge::config::Config;
use infer_bridge::{files, EngineInstance, Host, InferenceRequest, Precision, ReferenceCore};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(60);
const PREVIEW_LEN: usize = 8;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    match cli.command {
        Commands::Versions { device } => {
            let config = Config::default();
            let host = Host::new(&config.bridge)?;
            let engine = EngineInstance::new(&host, Arc::new(ReferenceCore::new()));
            let versions = engine.enumerate_versions(&device)?;
            println!("{}", serde_json::to_string_pretty(&versions)?);
        }

        Commands::Info { model, weights } => {
            let config = Config::default();
            let host = Host::new(&config.bridge)?;
            let engine = EngineInstance::new(&host, Arc::new(ReferenceCore::new()));

            info!("Parsing model: {}", model.display());
            let parsed = host
                .block_on(engine.parse_model(files(&model, &weights)))
                .with_context(|| format!("Failed to parse model: {}", model.display()))?;

            let output = json!({
                "name": parsed.name(),
                "inputs": parsed.inputs(),
                "outputs": parsed.outputs(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Infer {
            model,
            weights,
            device,
            input,
            mode,
            config,
            format,
        } => {
            // Load optional config
            let config = if let Some(config_path) = config {
                Config::from_yaml_file(&config_path)
                    .with_context(|| format!("Failed to load config: {}", config_path.display()))?
            } else {
                Config::default()
            };
            let device = device.unwrap_or_else(|| config.engine.device.clone());
            info!("Using device: {}", device);

            let host = Host::new(&config.bridge)?;
            let core = Arc::new(ReferenceCore::from_config(&config.reference));
            let engine = EngineInstance::from_config(&host, core, &config.engine)?;

            info!("Parsing model: {}", model.display());
            let parsed = host.block_on(engine.parse_model(files(&model, &weights)))?;
            info!("Compiling for {}", device);
            let executable = host.block_on(engine.compile(&parsed, &device))?;
            let request = executable.create_inference_request()?;

            if let Some(input) = input {
                load_inputs(&request, &input)?;
            }

            info!("Running inference ({:?})...", mode);
            let started = Instant::now();
            run(&host, &request, mode)?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            info!("Inference complete in {:.2}ms", latency_ms);

            let mut outputs = Vec::new();
            for desc in request.outputs() {
                let buffer = request.get_result_buffer(&desc.name)?;
                let preview: Vec<f32> = if buffer.precision() == Precision::Fp32 {
                    buffer.to_vec_f32()?.into_iter().take(PREVIEW_LEN).collect()
                } else {
                    Vec::new()
                };
                outputs.push(json!({
                    "name": buffer.name(),
                    "precision": buffer.precision(),
                    "dims": buffer.dims(),
                    "byte_len": buffer.byte_len(),
                    "preview": preview,
                }));
            }

            let output = json!({
                "model": parsed.name(),
                "device": executable.device(),
                "mode": format!("{:?}", mode).to_lowercase(),
                "latency_ms": latency_ms,
                "outputs": outputs,
            });

            match format {
                OutputFormat::Pretty => println!("{}", serde_json::to_string_pretty(&output)?),
                OutputFormat::Json => println!("{}", serde_json::to_string(&output)?),
            }
        }
    }

    Ok(())
}

fn run(host: &Host, request: &InferenceRequest, mode: RunMode) -> Result<()> {
    match mode {
        RunMode::Sync => request.infer()?,
        RunMode::Async => host.block_on(request.infer_async())?,
        RunMode::Notify => {
            let done = Rc::new(Cell::new(false));
            let flag = Rc::clone(&done);
            request.register_completion_notifier(move || flag.set(true))?;
            request.start_async()?;
            if !host.run_until(|| done.get(), NOTIFY_TIMEOUT) {
                bail!("No completion notification within {:?}", NOTIFY_TIMEOUT);
            }
        }
    }
    Ok(())
}

/// Fill request inputs from a JSON object mapping input names to either a
/// flat array of values or a single value broadcast to every element.
fn load_inputs(request: &InferenceRequest, path: &Path) -> Result<()> {
    info!("Loading input: {}", path.display());
    let document: Value = serde_json::from_str(
        &fs::read_to_string(path)
            .with_context(|| format!("Failed to read input: {}", path.display()))?,
    )?;
    let entries = document
        .as_object()
        .context("Input must be an object mapping input names to values")?;

    for (name, value) in entries {
        let buffer = request.get_result_buffer(name)?;
        match value {
            Value::Number(n) => {
                let n = n.as_f64().context("Input value is not a number")?;
                buffer.fill_f32(n as f32)?;
            }
            Value::Array(values) => {
                let values = values
                    .iter()
                    .map(|v| v.as_f64().map(|f| f as f32))
                    .collect::<Option<Vec<f32>>>()
                    .with_context(|| format!("Input '{}' must contain only numbers", name))?;
                buffer.write_f32(&values)?;
            }
            _ => bail!("Input '{}' must be a number or an array of numbers", name),
        }
    }
    Ok(())
}
