mod app;
mod commands;
mod render;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::app::App;

#[derive(Parser)]
#[command(name = "calsync")]
#[command(about = "Sync CalDAV calendars into a local store and browse their occurrences")]
struct Cli {
    /// Show debug logs and list every change
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull server changes and push local ones
    Sync {
        /// Only sync this account
        #[arg(short, long)]
        account: Option<String>,

        /// Only sync this calendar (by name)
        #[arg(short, long)]
        calendar: Option<String>,
    },
    /// Discover and list the calendars of each account
    Calendars {
        /// Only list this account
        #[arg(short, long)]
        account: Option<String>,
    },
    /// Show local changes waiting to be uploaded
    Pending,
    /// Show occurrences between two dates
    Agenda {
        /// First day (YYYY-MM-DD), defaults to today
        #[arg(long)]
        from: Option<String>,

        /// Last day (YYYY-MM-DD), defaults to a week from the first day
        #[arg(long)]
        to: Option<String>,

        /// Only show this calendar (by name)
        #[arg(short, long)]
        calendar: Option<String>,
    },
    /// Re-expand recurring events for the current sync window
    Rematerialize {
        /// Only this calendar (by name)
        #[arg(short, long)]
        calendar: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let app = App::load()?;
    match cli.command {
        Commands::Sync { account, calendar } => {
            commands::sync::run(&app, account.as_deref(), calendar.as_deref(), cli.verbose).await
        }
        Commands::Calendars { account } => commands::calendars::run(&app, account.as_deref()).await,
        Commands::Pending => commands::pending::run(&app).await,
        Commands::Agenda { from, to, calendar } => {
            commands::agenda::run(&app, from.as_deref(), to.as_deref(), calendar.as_deref()).await
        }
        Commands::Rematerialize { calendar } => {
            commands::rematerialize::run(&app, calendar.as_deref()).await
        }
    }
}

/// Logs go to stderr. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "calsync=debug" } else { "calsync=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
