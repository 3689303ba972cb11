mod config;
mod demo;
mod scenario;

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::config::ConnectorConfig;
use crate::demo::DemoSummary;
use crate::scenario::Scenario;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Dataspace connector: contract negotiation and transfer provisioning.
#[derive(Parser)]
#[command(
    name = "connector",
    version,
    about = "Dataspace connector: contract negotiation and transfer provisioning"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Negotiate and provision a scenario between two in-process connectors
    Demo {
        /// Path to the scenario TOML file
        #[arg(long)]
        scenario: PathBuf,
        /// Path to the connector config TOML file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },

    /// Parse a connector config file and print the effective settings
    CheckConfig {
        /// Path to the connector config TOML file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            scenario,
            config,
            timeout_secs,
        } => cmd_demo(&scenario, config.as_deref(), timeout_secs, cli.output),
        Commands::CheckConfig { file } => cmd_check_config(&file, cli.output),
    }
}

fn cmd_demo(scenario: &Path, config: Option<&Path>, timeout_secs: u64, output: OutputFormat) {
    let config = ConnectorConfig::load(config).unwrap_or_else(|e| fail(&e, output));
    init_logging(&config);
    let scenario = Scenario::load(scenario).unwrap_or_else(|e| fail(&e, output));

    let runtime = tokio::runtime::Runtime::new()
        .unwrap_or_else(|e| fail(&format!("failed to start runtime: {e}"), output));
    let summary = runtime
        .block_on(demo::run(
            &scenario,
            &config,
            Duration::from_secs(timeout_secs),
        ))
        .unwrap_or_else(|e| fail(&e, output));

    match output {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Text => print_summary(&summary),
    }
    if !summary.succeeded() {
        process::exit(1);
    }
}

fn cmd_check_config(file: &Path, output: OutputFormat) {
    let config = ConnectorConfig::load(Some(file)).unwrap_or_else(|e| fail(&e, output));
    match output {
        OutputFormat::Json => print_json(&config),
        OutputFormat::Text => {
            println!("connector_id      {}", config.connector_id);
            println!("identity_claim    {}", config.identity_claim);
            println!("log_filter        {}", config.log_filter);
            let n = &config.negotiation;
            println!(
                "negotiation       max_retries={} batch_size={} idle_millis={} retry_base_millis={} agreement_validity_secs={}",
                n.max_retries, n.batch_size, n.idle_millis, n.retry_base_millis, n.agreement_validity_secs
            );
            let t = &config.transfer;
            println!(
                "transfer          max_retries={} batch_size={} idle_millis={} retry_base_millis={}",
                t.max_retries, t.batch_size, t.idle_millis, t.retry_base_millis
            );
            for (operand, claim) in &config.policy.claim_operands {
                println!("claim operand     {operand} -> {claim}");
            }
        }
    }
}

fn print_summary(summary: &DemoSummary) {
    println!("offers visible    {}", summary.offers);
    println!("offer             {}", summary.offer_id);
    println!(
        "negotiation       {} ({:?})",
        summary.negotiation_id, summary.negotiation_state
    );
    if let Some(agreement) = &summary.agreement_id {
        println!("agreement         {agreement}");
    }
    if let (Some(id), Some(state)) = (&summary.transfer_id, summary.transfer_state) {
        println!("transfer          {id} ({state:?})");
    }
    if let Some(destination) = &summary.destination {
        let properties: Vec<String> = destination
            .properties
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!("destination       {} {}", destination.kind, properties.join(" "));
    }
    for key in &summary.secret_keys {
        println!("secret            {key}");
    }
    if let Some(detail) = &summary.detail {
        println!("detail            {detail}");
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
    println!("{}", json);
}

/// Logs go to stderr; `RUST_LOG` wins over the configured filter.
fn init_logging(config: &ConnectorConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn fail(msg: &str, output: OutputFormat) -> ! {
    report_error(msg, output);
    process::exit(1);
}

pub(crate) fn report_error(msg: &str, output: OutputFormat) {
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{{\"error\": \"{}\"}}", msg.replace('"', "\\\""));
        }
    }
}
