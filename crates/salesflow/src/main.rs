use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use salesflow_core::driver::reference_client;
use salesflow_core::{PipelineConfig, PipelineDriver, RunReport};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Daily sales analytics pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh reference data, compute the analytics views and publish them
    Run(RunArgs),
    /// Validate reference store parameters and credential resolution
    HealthCheck,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Override SALESFLOW_DATA_ROOT
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Override ENVIRONMENT
    #[arg(long)]
    environment: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env().context("failed to load pipeline configuration")?;

    match cli.command {
        Command::Run(args) => {
            if let Some(root) = args.data_root {
                config.data_root = root;
            }
            if let Some(environment) = args.environment {
                config.environment = environment;
            }
            run(&config).await
        }
        Command::HealthCheck => {
            let client = reference_client(&config);
            let healthy = client
                .health_check()
                .await
                .context("reference store health check errored")?;
            println!("{}", if healthy { "healthy" } else { "unhealthy" });
            if !healthy {
                bail!("reference store health check failed");
            }
            Ok(())
        }
    }
}

async fn run(config: &PipelineConfig) -> Result<()> {
    let driver = PipelineDriver::from_config(config)
        .await
        .context("failed to assemble pipeline")?;

    info!(
        environment = driver.environment(),
        data_root = %config.data_root.display(),
        "starting pipeline run"
    );
    let report = match driver.run().await {
        Ok(report) => report,
        Err(err) => {
            error!(stage = %err.stage, code = err.code(), "pipeline run failed: {err}");
            return Err(err).context("pipeline run failed");
        }
    };

    info!(
        report = %serde_json::to_string(&report).context("failed to serialize run report")?,
        "run report"
    );
    println!("{}", summary_table(&report));
    Ok(())
}

fn summary_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["table", "rows", "bytes", "blake3"]);
    for published in &report.published {
        table.add_row(vec![
            published.table.clone(),
            published.rows.to_string(),
            published.bytes.to_string(),
            published.content_hash.chars().take(16).collect(),
        ]);
    }
    table
}
