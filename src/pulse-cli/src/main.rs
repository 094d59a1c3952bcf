//! Pulse: send tracking events from the command line.
//!
//! Runs the tracker in a server context: no page, no beacon, HTTP delivery
//! through `reqwest`.

use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use pulse_core::types::{EventLevel, Metadata};
use pulse_core::{Capabilities, TrackerConfig};
use pulse_web_sdk::Tracker;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(about = "Client-side event tracking")]
#[command(version)]
struct Cli {
    /// Project identifier (overrides config)
    #[arg(long, global = true, env = "PULSE__PROJECT_ID")]
    project_id: Option<String>,

    /// Collection endpoint (overrides config)
    #[arg(long, global = true, env = "PULSE__ENDPOINT")]
    endpoint: Option<String>,

    /// Emit tracker diagnostics
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track a single event
    Track {
        /// Event name
        event: String,

        /// Severity: info, warn or error
        #[arg(long, default_value = "info")]
        level: EventLevel,

        /// Metadata entry as key=value; values are parsed as JSON when possible
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, serde_json::Value)>,

        /// How long to wait for the delivery to complete
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
    },
}

fn parse_meta(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err("metadata key must not be empty".into());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| value.into());
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_cli=info,pulse_web_sdk=info,pulse_core=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = TrackerConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        TrackerConfig::default()
    });

    if let Some(project_id) = cli.project_id {
        config.project_id = project_id;
    }
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if cli.debug {
        config.debug = true;
    }

    let capabilities = Capabilities::server().context("failed to build http client")?;
    let tracker = Tracker::builder(config)
        .capabilities(capabilities)
        .on_error(|e| error!(kind = %e.kind, status = ?e.status_code, message = %e.message, "delivery failed"))
        .build()?;

    match cli.command {
        Command::Track {
            event,
            level,
            meta,
            wait_ms,
        } => {
            let metadata = (!meta.is_empty()).then(|| meta.into_iter().collect::<Metadata>());
            if !tracker.track(&event, metadata, level) {
                anyhow::bail!("event `{event}` was not queued");
            }
            info!(event = %event, level = level.as_str(), project_id = tracker.project_id(), "event queued");

            // Delivery runs detached; give it a chance to finish before exit.
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    tracker.shutdown().await;
    Ok(())
}
