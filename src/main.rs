//! Thermostat history CLI - Main Entry Point
//!
//! Thin front end over [`HistoryService`]: ingest a date range, discover
//! devices, page through stored records, inspect coverage, and manage
//! the site directory.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thermo_history::config::directory::SiteDirectory;
use thermo_history::storage::QueryRequest;
use thermo_history::{HistoryConfig, HistoryService, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Thermostat history subsystem CLI
#[derive(Parser, Debug)]
#[command(name = "thermo-history")]
#[command(about = "Ingest, inspect, and query thermostat telemetry history")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "THERMO_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull history for a site across a date range
    Ingest {
        /// Site identifier
        site: String,

        /// First day to ingest (YYYY-MM-DD)
        start: NaiveDate,

        /// Last day to ingest, inclusive (YYYY-MM-DD)
        end: NaiveDate,
    },
    /// List device serials a site reported on one day
    Discover {
        /// Site identifier
        site: String,

        /// Day to scan (YYYY-MM-DD)
        date: NaiveDate,
    },
    /// Page through stored records for one device
    Query {
        /// Site identifier
        site: String,

        /// Device serial number
        device: String,

        /// First day of the range (YYYY-MM-DD)
        start: NaiveDate,

        /// Last day of the range, inclusive (YYYY-MM-DD)
        end: NaiveDate,

        /// Zero-based page number
        #[arg(long, default_value = "0")]
        page: usize,

        /// Records per page (0 uses the configured default)
        #[arg(long, default_value = "0")]
        page_size: usize,
    },
    /// Show store coverage from the metadata index
    Stats,
    /// Register or update credentials for a site
    AddSite {
        /// Site identifier
        site: String,

        /// Username for the upstream service
        #[arg(long, env = "THERMO_SITE_USERNAME")]
        username: String,

        /// Password for the upstream service
        #[arg(long, env = "THERMO_SITE_PASSWORD")]
        password: String,
    },
}

impl Cli {
    /// Initialize logging based on debug flag
    fn initialize_logging(&self) {
        let filter = if self.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.initialize_logging();

    let config = HistoryConfig::load(cli.config.as_deref())?;
    config.validate()?;

    // Directory maintenance does not need the store or dispatcher
    if let Command::AddSite {
        site,
        username,
        password,
    } = &cli.command
    {
        let mut directory = SiteDirectory::load(&config.sites_file)?;
        directory.add_site(site.clone(), username.clone(), password.clone());
        directory.save(&config.sites_file)?;
        println!(
            "Registered credentials for site '{site}' in {}",
            config.sites_file.display()
        );
        return Ok(());
    }

    let service = HistoryService::new(config).await?;

    match cli.command {
        Command::Ingest { site, start, end } => {
            info!("🚀 Ingesting history for site {site} from {start} to {end}");
            let report = service.ingest_range(&site, start, end).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Discover { site, date } => {
            let serials = service.discover(&site, date).await?;
            if serials.is_empty() {
                println!("No devices reported for site '{site}' on {date}");
            } else {
                for serial in serials {
                    println!("{serial}");
                }
            }
        }
        Command::Query {
            site,
            device,
            start,
            end,
            page,
            page_size,
        } => {
            let page = service
                .query(QueryRequest {
                    site,
                    device,
                    start,
                    end,
                    page,
                    page_size,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Stats => {
            let stats = service.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::AddSite { .. } => unreachable!("handled before service construction"),
    }

    Ok(())
}
