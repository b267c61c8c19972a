//! downlink - resumable concurrent downloads from the command line.
//!
//! Downloads run through a [`downlink::DownloadSession`] persisted in the
//! target directory, so an interrupted invocation can be continued later
//! with `downlink resume`.

mod commands;
mod error;
mod progress;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "downlink",
    version,
    about = "Resumable concurrent downloads that survive restarts"
)]
struct Cli {
    /// Session directory (defaults to the user download directory).
    #[arg(long, global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download one or more URLs
    Get {
        /// Source URLs
        #[arg(required = true)]
        urls: Vec<String>,
        /// How many transfers may run at once
        #[arg(long, default_value_t = downlink::config::DEFAULT_MAX_CONCURRENT)]
        concurrent: usize,
        /// Skip metered (cellular) network paths
        #[arg(long)]
        no_cellular: bool,
    },
    /// Continue every paused or interrupted transfer in the session
    Resume {
        /// How many transfers may run at once
        #[arg(long, default_value_t = downlink::config::DEFAULT_MAX_CONCURRENT)]
        concurrent: usize,
    },
    /// Show the persisted session without touching it
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let directory = cli.dir.clone().unwrap_or_else(default_directory);

    let result = match cli.command {
        Command::Get {
            urls,
            concurrent,
            no_cellular,
        } => {
            commands::get::run(commands::get::GetArgs {
                urls,
                directory,
                concurrent,
                no_cellular,
            })
            .await
        }
        Command::Resume { concurrent } => {
            commands::resume::run(commands::resume::ResumeArgs {
                directory,
                concurrent,
            })
            .await
        }
        Command::Status => commands::status::run(&directory),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Default session directory: the user's download directory, or a
/// `downlink` directory under home when the platform has none.
fn default_directory() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("downlink")))
        .unwrap_or_else(|| PathBuf::from("."))
}
