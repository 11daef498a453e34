//! Command-line front end for critique-orchestrator.
//!
//! Runs one orchestration and prints the result as JSON. Without
//! `--config` every built-in model is served by the echo backend, so the
//! binary works offline.
//!
//! ```text
//! critique-orchestrator [--config FILE] [--store-dir DIR] [--max-iterations N]
//!                       [--threshold Q] [--cost-limit USD] [--schema] <prompt>
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (overrides `[observability]`)
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;
use std::sync::Arc;

use critique_orchestrator::config::{self, loader, OrchestratorConfig};
use critique_orchestrator::engine::{InMemoryThreadStore, JsonFileThreadStore, ThreadStore};
use critique_orchestrator::{init_tracing, metrics};
use tracing::info;

const USAGE: &str = "usage: critique-orchestrator [--config FILE] [--store-dir DIR] \
[--max-iterations N] [--threshold Q] [--cost-limit USD] [--schema] <prompt>";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    store_dir: Option<PathBuf>,
    max_iterations: Option<u32>,
    threshold: Option<f64>,
    cost_limit: Option<f64>,
    schema: bool,
    prompt: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--store-dir" => args.store_dir = Some(PathBuf::from(value("--store-dir")?)),
            "--max-iterations" => {
                let v = value("--max-iterations")?;
                args.max_iterations = Some(v.parse().map_err(|_| format!("bad --max-iterations: {v}"))?);
            }
            "--threshold" => {
                let v = value("--threshold")?;
                args.threshold = Some(v.parse().map_err(|_| format!("bad --threshold: {v}"))?);
            }
            "--cost-limit" => {
                let v = value("--cost-limit")?;
                args.cost_limit = Some(v.parse().map_err(|_| format!("bad --cost-limit: {v}"))?);
            }
            "--schema" => args.schema = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}\n{USAGE}")),
            other => args.prompt.push(other.to_string()),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(a) => a,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    if args.schema {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let cfg = match &args.config {
        Some(path) => loader::load_from_file(path)?,
        None => OrchestratorConfig::echo_demo(),
    };

    if std::env::var_os("LOG_FORMAT").is_none() {
        std::env::set_var("LOG_FORMAT", cfg.observability.log_format.as_env_value());
    }
    let _ = init_tracing();
    metrics::init_metrics()?;

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let store: Arc<dyn ThreadStore> = match &args.store_dir {
        Some(dir) => Arc::new(JsonFileThreadStore::new(dir)),
        None => Arc::new(InMemoryThreadStore::new()),
    };
    let orchestrator = cfg.build_orchestrator(store)?;

    let mut policy = cfg.policy();
    if let Some(n) = args.max_iterations {
        policy.max_iterations = n;
    }
    if let Some(q) = args.threshold {
        policy.quality_threshold = q;
    }
    if args.cost_limit.is_some() {
        policy.cost_limit = args.cost_limit;
    }

    info!(name = %cfg.orchestrator.name, providers = cfg.providers.len(), "Starting orchestration");

    let result = orchestrator.orchestrate(&prompt, policy).await?;
    println!("{}", serde_json::to_string_pretty(&result.to_json())?);

    let summary = metrics::get_metrics_summary();
    info!(
        threads = ?summary.threads_total,
        provider_requests = ?summary.provider_requests,
        "Metrics summary"
    );

    if let Some(err) = result.error {
        return Err(err.into());
    }
    Ok(())
}
