use std::path::PathBuf;
use std::sync::Arc;

use attest_stress::config::Config;
use attest_stress::error_handling::HarnessError;
use attest_stress::orchestrator::{Harness, HarnessSettings, ScenarioParams};
use attest_stress::prometheus_metrics::RunMetrics;
use attest_stress::report::ReportDocument;
use attest_stress::transport::HttpTransport;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Flags override STRESS_* environment variables, which override defaults.
#[derive(Parser)]
#[command(name = "attest-stress")]
#[command(about = "Stress and adversarial test harness for the attestation/enrollment protocol")]
#[command(version)]
struct Cli {
    /// Target node URL
    #[arg(long)]
    url: Option<String>,

    /// Total number of miners to simulate
    #[arg(long)]
    miners: Option<usize>,

    /// Max concurrent sessions
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Report file (.json for JSON, Markdown otherwise)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Ratio of miners sharing one identity (0.0 to 1.0)
    #[arg(long)]
    dupes: Option<f64>,

    /// Every 5th miner submits a malformed payload
    #[arg(long)]
    malformed: bool,

    /// Delay the second half of the miners to straddle an epoch transition
    #[arg(long)]
    epoch_boundary: bool,

    /// Seed for reproducible identities and payloads
    #[arg(long)]
    seed: Option<u64>,

    /// Also write Prometheus text metrics to this file
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    /// Verify the target's TLS certificate
    #[arg(long)]
    verify_tls: bool,

    /// Skip the reachability probe before the run
    #[arg(long)]
    skip_preflight: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.url { config.target_url = v; }
        if let Some(v) = self.miners { config.miners = v; }
        if let Some(v) = self.concurrency { config.concurrency = v; }
        if let Some(v) = self.timeout { config.request_timeout_secs = v; }
        if let Some(v) = self.output { config.output = v; }
        if let Some(v) = self.dupes { config.duplicate_ratio = v; }
        if let Some(v) = self.seed { config.seed = Some(v); }
        if let Some(v) = self.metrics_output { config.metrics_output = Some(v); }
        config.malformed |= self.malformed;
        config.epoch_boundary |= self.epoch_boundary;
        config.verify_tls |= self.verify_tls;
        config.skip_preflight |= self.skip_preflight;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    cli.apply(&mut config);
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("--- Attestation Stress Test Harness ---");
    println!("Time: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("Target: {}", config.target_url);
    println!(
        "Config: {} miners, {} max concurrency, {}% duplicate IDs",
        config.miners,
        config.concurrency,
        config.duplicate_ratio * 100.0
    );
    println!("{}", "-".repeat(40));

    let transport = Arc::new(HttpTransport::new(config.get_request_timeout(), config.verify_tls)?);
    let metrics = Arc::new(RunMetrics::new());
    let harness = Harness::new(
        transport,
        HarnessSettings {
            base_url: config.target_url.clone(),
            concurrency: config.concurrency,
            retry: config.retry_policy(),
            epoch_offset: config.get_epoch_offset(),
            top_errors: config.top_errors,
            seed: config.seed,
        },
    )
    .with_metrics(Arc::clone(&metrics));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let params = ScenarioParams {
        num_miners: config.miners,
        duplicate_ratio: config.duplicate_ratio,
        malformed: config.malformed,
        epoch_boundary: config.epoch_boundary,
    };
    if params.epoch_boundary {
        println!("   [Mode] Epoch Boundary Simulation enabled (staggered start)");
    }

    let outcome = async {
        if !config.skip_preflight {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::Aborted),
                r = harness.preflight() => r?,
            }
        }
        harness.run(&params, &cancel).await
    }
    .await;

    let summary = match outcome {
        Ok(summary) => summary,
        Err(HarnessError::Aborted) => {
            println!("\nTest aborted by user.");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Stress run halted");
            return Err(e.into());
        }
    };

    let doc = ReportDocument::new(&config.target_url, &params, config.concurrency, summary.report);
    doc.print_summary();
    doc.write_to(&config.output)?;
    info!(path = %config.output.display(), "Report written");

    if let Some(path) = &config.metrics_output {
        std::fs::write(path, metrics.export_metrics()?)?;
        info!(path = %path.display(), "Metrics written");
    }
    Ok(())
}
