//! # Pacer
//!
//! Throttled, window-aware outbound voice and SMS attempt scheduler.
//!
//! Usage:
//!   pacer serve                      # Run schedulers + gateway (default port 5050)
//!   pacer serve --port 8080          # Custom port
//!   pacer check                      # Print readiness for both channels
//!   pacer history --channel sms      # Recent attempts from the history DB

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pacer_core::{Channel, Moment, PacerConfig};
use pacer_gateway::AppState;
use pacer_scheduler::HistoryDb;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "pacer",
    version,
    about = "📞 Pacer: throttled outbound voice and SMS attempts"
)]
struct Cli {
    /// Config file (default: $PACER_CONFIG or ~/.pacer/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the schedulers and the HTTP gateway
    Serve {
        /// Gateway port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show configuration readiness for each channel
    Check,
    /// List recent attempts from the history database
    History {
        /// voice or sms
        #[arg(long, default_value = "voice")]
        channel: Channel,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&str>) -> Result<PacerConfig> {
    let Some(path) = path else {
        return Ok(PacerConfig::load()?);
    };
    let mut config = PacerConfig::load_from(std::path::Path::new(&expand_path(path)))?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config.normalize();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "pacer=debug,pacer_scheduler=debug,pacer_gateway=debug,pacer_providers=debug,tower_http=debug"
    } else {
        "pacer=info,pacer_scheduler=info,pacer_gateway=info,pacer_providers=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tracing::info!("🚀 Pacer v{} starting", env!("CARGO_PKG_VERSION"));
            pacer_gateway::start(config).await?;
        }
        Command::Check => {
            let placement = pacer_providers::create_placement(&config)?;
            let state = AppState::new(config, placement, Arc::new(HistoryDb::open_in_memory()?));
            let now = Moment::now();
            let mut report = serde_json::Map::new();
            for channel in Channel::ALL {
                let status = state.scheduler(channel).status(now);
                report.insert(channel.to_string(), serde_json::to_value(status)?);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::History { channel, limit } => {
            let db = HistoryDb::open(&config.history_path())?;
            let metrics = db.metrics(channel)?;
            println!(
                "{} {channel}: {} attempts ({} completed, {} failed, avg {:.1}s)",
                channel.icon(),
                metrics.total,
                metrics.completed,
                metrics.failed,
                metrics.avg_duration_secs
            );
            for a in db.list(channel, limit)? {
                println!(
                    "  {}  {:<10} {:<12} {:>5}s  {} events  {}",
                    a.completed_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                    a.state.as_str(),
                    a.provider_status.as_deref().unwrap_or("-"),
                    a.duration_secs.unwrap_or(0),
                    a.event_count,
                    a.sid
                );
            }
        }
    }
    Ok(())
}
