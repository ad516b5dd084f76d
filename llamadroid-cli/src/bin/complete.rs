//! Desktop driver for the llamadroid generation engine
//!
//! Runs the same prefill/step loop the Android bridge uses against a local
//! GGUF model and streams the fragments to stdout.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use llamadroid_engine::{
    Backend, GenerationLimits, GenerationWorker, LlamaCppBackend, ModelOps, SamplerDefaults,
    Session, Settings, StreamToken,
};
use serde::Serialize;
use tracing::info;

/// Generate text from a GGUF model with self-extend and batched prefill
#[derive(Parser, Debug)]
#[command(name = "llamadroid-complete")]
struct Cli {
    /// Path to the GGUF model
    model: PathBuf,

    /// Prompt text
    prompt: String,

    /// Settings file (defaults to the user config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum tokens to generate
    #[arg(long)]
    max_tokens: Option<i64>,

    /// Override the sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Override nucleus sampling top-p
    #[arg(long)]
    top_p: Option<f32>,

    /// Send the prompt as-is instead of wrapping it in the chat template
    #[arg(long)]
    raw: bool,

    /// Print a JSON summary instead of streaming text
    #[arg(long)]
    json: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    text: String,
    fragments: usize,
    finish_reason: String,
    elapsed_ms: u128,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "llamadroid_complete=debug,llamadroid_engine=debug,llama_cpp_2=info"
    } else {
        "llamadroid_complete=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Settings::load(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    llamadroid_engine::backend::llamacpp::route_logs_to_tracing();

    let settings = load_settings(cli.config.as_ref())?;

    let mut defaults = SamplerDefaults::new();
    defaults.set_temperature(cli.temperature.unwrap_or(settings.sampling.temperature));
    defaults.set_top_p(cli.top_p.unwrap_or(settings.sampling.top_p));
    defaults.set_max_tokens(
        cli.max_tokens
            .unwrap_or(i64::from(settings.generation.max_tokens)),
    );
    let sampling = settings.sampling.with_defaults(&defaults);

    let backend = LlamaCppBackend::new()?;
    info!("Loading model from {}...", cli.model.display());
    let model = Arc::new(
        backend
            .load_model(&cli.model)
            .with_context(|| format!("Failed to load model from {}", cli.model.display()))?,
    );

    let prompt = if cli.raw {
        cli.prompt.clone()
    } else {
        model.format_chat("user", &cli.prompt)?
    };

    let context_params = settings.context_params();
    let generation_config = settings.generation_config();
    let factory = move || {
        let context = backend.new_context(&model, &context_params)?;
        let sampler = backend.new_sampler(&model, &sampling)?;
        Session::new(context, sampler, &generation_config)
    };

    let limits = GenerationLimits {
        max_tokens: defaults.max_tokens,
    };
    let start = Instant::now();
    let worker = GenerationWorker::spawn(factory, prompt, limits)?;

    let mut text = String::new();
    let mut fragments = 0;
    let mut finish_reason = None;
    let mut stdout = std::io::stdout().lock();
    for item in worker.iter() {
        match item {
            StreamToken::Token(fragment) => {
                if !cli.json {
                    stdout.write_all(fragment.as_bytes())?;
                    stdout.flush()?;
                }
                fragments += 1;
                text.push_str(&fragment);
            }
            StreamToken::Done(reason) => {
                finish_reason = Some(reason);
                break;
            }
            StreamToken::Error(msg) => anyhow::bail!("generation failed: {msg}"),
        }
    }
    let elapsed_ms = start.elapsed().as_millis();

    if cli.json {
        let summary = Summary {
            text,
            fragments,
            finish_reason: format!("{:?}", finish_reason),
            elapsed_ms,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        writeln!(stdout)?;
        info!(
            fragments,
            elapsed_ms = elapsed_ms as u64,
            ?finish_reason,
            "generation finished"
        );
    }
    Ok(())
}
