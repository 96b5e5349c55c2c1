//! LifeDash sync - local autosave store tool.
//!
//! Usage:
//!   # Show queued writes, cached snapshots and the last sync of a user
//!   lifedash-sync inspect u1
//!
//!   # Walk through an offline edit against an in-memory remote store
//!   RUST_LOG=debug lifedash-sync demo
//!
//!   # Show or change settings
//!   lifedash-sync settings --debounce-ms 500

mod commands;
mod state;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::SettingsChange;
use std::path::PathBuf;
use store::{DocId, UserId};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lifedash-sync")]
#[command(about = "Inspect and exercise the offline autosave store")]
struct Args {
    /// Directory holding settings.json and local storage
    #[arg(long, default_value = "lifedash-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a user's queued writes, cached documents and last sync time
    Inspect { user: String },

    /// Discard a user's queued writes
    ClearQueue { user: String },

    /// Show settings, or change them with the flags below
    Settings {
        /// Restore defaults before applying other changes
        #[arg(long)]
        reset: bool,

        #[arg(long)]
        enabled: Option<bool>,

        #[arg(long)]
        debounce_ms: Option<u64>,

        #[arg(long)]
        write_timeout_ms: Option<u64>,

        #[arg(long)]
        flush_min_interval_ms: Option<u64>,
    },

    /// Simulate going offline, editing and reconnecting
    Demo {
        #[arg(long, default_value = "u1")]
        user: String,

        #[arg(long, default_value = "noteA")]
        document: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::debug!("Data directory: {:?}", args.data_dir);

    let mut manager = state::load_settings(&args.data_dir)?;

    match args.command {
        Command::Inspect { user } => {
            let storage = state::LocalStorage::open(&args.data_dir, manager.get())?;
            let report = commands::inspect(&storage, &UserId::from(user))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ClearQueue { user } => {
            let storage = state::LocalStorage::open(&args.data_dir, manager.get())?;
            let dropped = commands::clear_queue(&storage, &UserId::from(user))?;
            println!("Dropped {} queued write(s)", dropped);
        }
        Command::Settings {
            reset,
            enabled,
            debounce_ms,
            write_timeout_ms,
            flush_min_interval_ms,
        } => {
            let settings = commands::settings(
                &mut manager,
                SettingsChange {
                    reset,
                    enabled,
                    debounce_ms,
                    write_timeout_ms,
                    flush_min_interval_ms,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Demo { user, document } => {
            commands::demo(manager.get(), &UserId::from(user), &DocId::from(document)).await?;
        }
    }

    Ok(())
}
