mod api_scenario;

use anyhow::{Context, Result};
use clap::Parser;
use loadrig_core::{
    run_test, Config, MetricSummary, MockTransport, ReqwestTransport, TestResult, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use api_scenario::ApiScenario;

#[derive(Parser, Debug)]
#[command(name = "loadrig")]
#[command(about = "API load-test runner - ramps virtual users against a target API")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.toml")]
    config: PathBuf,

    /// Transport mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Target base URL (overrides config)
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// API key for authenticated endpoints (overrides config)
    #[arg(long, env = "API_KEY")]
    api_key: Option<String>,

    /// Directory for result JSON files
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(base_url) = args.base_url {
        config.target.base_url = base_url;
    }
    if let Some(api_key) = args.api_key {
        config.target.api_key = Some(api_key);
    }

    info!("Target: {}", config.target.base_url);
    info!("Seed: {}", config.scenario.seed);
    info!("Stages: {}", config.stages.len());
    info!("Thresholds: {}", config.thresholds.len());

    // Create transport based on mode
    let transport: Arc<dyn Transport> = match args.mode.as_str() {
        "mock" => Arc::new(
            MockTransport::new(5).with_body(r#"{"data":{"access_token":"mock-token"}}"#),
        ),
        "http" => Arc::new(
            ReqwestTransport::new(Duration::from_millis(config.target.timeout_ms))
                .context("Failed to create HTTP transport")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };
    info!("Using transport: {}", transport.name());

    let scenario = Arc::new(ApiScenario::new(&config));

    // Ctrl-C drains the run cooperatively instead of killing it.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining virtual users");
            let _ = shutdown_tx.send(true);
        }
    });

    let result = run_test(&config, scenario, transport, shutdown_rx).await?;

    // Write results to file
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = args.out_dir.join(format!("run_{timestamp}.json"));
    std::fs::create_dir_all(&args.out_dir).ok();
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)?;

    info!("Results written to {}", output_path.display());
    print_summary(&result);

    if !result.success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(result: &TestResult) {
    println!("\n=== {} Summary ===", result.scenario);
    println!("Duration: {}ms", result.duration_ms);
    println!("Iterations: {}", result.iterations);
    if result.aborted {
        println!(
            "Aborted: {}",
            result.abort_reason.as_deref().unwrap_or("unknown")
        );
    }

    println!("\nMetrics:");
    for (name, summary) in &result.metrics {
        match summary {
            MetricSummary::Counter { sum, .. } => println!("  {name}: {sum}"),
            MetricSummary::Rate {
                rate, trues, total, ..
            } => println!("  {name}: {:.2}% ({trues}/{total})", rate * 100.0),
            MetricSummary::Trend {
                mean, p95, max, ..
            } => println!("  {name}: mean={mean:.2} p95={p95:.2} max={max:.2}"),
        }
    }

    println!("\nThresholds:");
    for outcome in &result.thresholds {
        let status = if outcome.passed { "PASS" } else { "FAIL" };
        match outcome.observed {
            Some(value) => println!(
                "  [{status}] {} {} (observed {value:.2})",
                outcome.metric, outcome.expression
            ),
            None => println!(
                "  [{status}] {} {} (no data)",
                outcome.metric, outcome.expression
            ),
        }
    }

    println!(
        "\nVerdict: {}",
        if result.success() { "PASS" } else { "FAIL" }
    );
    println!();
}
