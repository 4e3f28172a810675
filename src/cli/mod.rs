pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline until interrupted
    Run {
        /// URL to seed the pipeline with on startup
        #[arg(short, long)]
        url: Option<String>,

        /// Site identifier for the seeded URL
        #[arg(short, long, default_value = "default")]
        site_id: String,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Fetch worker replicas (overrides the profile)
        #[arg(long)]
        fetchers: Option<usize>,

        /// Clean worker replicas (overrides the profile)
        #[arg(long)]
        cleaners: Option<usize>,

        /// Persist worker replicas (overrides the profile)
        #[arg(long)]
        persisters: Option<usize>,

        /// Index worker replicas (overrides the profile)
        #[arg(long)]
        indexers: Option<usize>,
    },

    /// Seed a URL onto the fetch queue
    Seed {
        /// URL to enqueue
        #[arg(required = true)]
        url: String,

        /// Site identifier
        #[arg(short, long, default_value = "default")]
        site_id: String,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Seed a deletion for a URL
    Delete {
        /// URL to remove from the store and index
        #[arg(required = true)]
        url: String,

        /// Site identifier
        #[arg(short, long, default_value = "default")]
        site_id: String,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Show queue metrics and backend statistics
    Status {
        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Drain the pending list of a queue
    Clear {
        /// Queue to clear (url, crawl, clean, index)
        #[arg(required = true)]
        queue: String,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            url,
            site_id,
            profile,
            fetchers,
            cleaners,
            persisters,
            indexers,
        } => {
            info!("Starting pipeline");
            commands::run(
                url, site_id, profile, fetchers, cleaners, persisters, indexers,
            )
            .await
        }
        Commands::Seed {
            url,
            site_id,
            profile,
        } => {
            info!("Seeding {}", url);
            commands::seed(url, site_id, profile).await
        }
        Commands::Delete {
            url,
            site_id,
            profile,
        } => {
            info!("Seeding deletion for {}", url);
            commands::delete(url, site_id, profile).await
        }
        Commands::Status { profile } => commands::status(profile).await,
        Commands::Clear { queue, profile } => {
            info!("Clearing queue {}", queue);
            commands::clear(queue, profile).await
        }
        Commands::Config { profile, list } => {
            if list {
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                commands::manage_profile(profile_name).await
            } else {
                commands::show_config().await
            }
        }
    }
}
