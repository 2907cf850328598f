//! Chimera CLI - download game archives from file hosts
//!
//! Transfers run in the foreground: `add` and `resume` follow the download
//! until it completes, and Ctrl-C pauses it so it can be resumed later.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Chimera - game archive downloader
#[derive(Parser)]
#[command(name = "chimera")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for Chimera
    #[arg(long, env = "CHIMERA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file and follow its progress
    Add {
        /// Host page or direct URL
        url: String,

        /// Game title, also used to name the file when the host gives none
        #[arg(short, long)]
        title: String,

        /// Catalog id of the game
        #[arg(short, long, default_value = "")]
        remote_id: String,

        /// Directory to save into (defaults to the configured downloads path)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Resume a paused download and follow its progress
    Resume {
        /// Download URL
        url: String,
    },

    /// List downloads
    List {
        /// Filter by status (progress, paused, completed)
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download URL
        url: String,
    },

    /// Abort a download and delete the partial file
    Abort {
        /// Download URL
        url: String,
    },

    /// Remove a download and delete its file
    Remove {
        /// Download URL
        url: String,

        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "warn,chimera_core=debug,chimera=debug"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "chimera", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("chimera"))
            .unwrap_or_else(|| PathBuf::from(".chimera"))
    });

    let core = chimera_core::ChimeraCore::new(data_dir).await?;

    match cli.command {
        Commands::Add {
            url,
            title,
            remote_id,
            dir,
        } => commands::add_download(&core, &url, &title, &remote_id, dir, cli.output).await?,

        Commands::Resume { url } => commands::resume_download(&core, &url, cli.output).await?,

        Commands::List { status, all } => {
            commands::list_downloads(&core, status, all, cli.output).await?
        }

        Commands::Info { url } => commands::show_info(&core, &url, cli.output).await?,

        Commands::Abort { url } => commands::abort_download(&core, &url).await?,

        Commands::Remove { url, yes } => commands::remove_download(&core, &url, yes).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
