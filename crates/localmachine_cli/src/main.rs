//! localmachine CLI
//!
//! Command-line tools for localmachine agents.
//!
//! # Commands
//!
//! - `inspect` - List the events in a packed file or export archive
//! - `verify` - Check checksums and names of a packed file or archive
//! - `export` - Write an export archive from an agent journal
//! - `import` - Store the events of an archive in an agent journal
//! - `status` - Show what an agent still has to sync

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use localmachine_protocol::FacilityId;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// localmachine command-line tools.
#[derive(Parser)]
#[command(name = "localmachine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the events in a packed file or export archive
    Inspect {
        /// Packed `.dat` file or `.zip` archive
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Check checksums and names of a packed file or archive
    Verify {
        /// Packed `.dat` file or `.zip` archive
        file: PathBuf,
    },

    /// Write an export archive from an agent journal
    Export {
        /// Agent journal
        #[arg(short, long)]
        journal: PathBuf,

        /// Home facility id
        #[arg(long, value_parser = commands::parse_facility)]
        home: FacilityId,

        /// Directory receiving the archive
        #[arg(short, long)]
        out: PathBuf,

        /// Facility code used in file names, as `<id>=<code>` (repeatable)
        #[arg(long = "facility", value_parser = commands::parse_facility_code)]
        facilities: Vec<(FacilityId, String)>,

        /// Capacity of one packed file in bytes
        #[arg(long, default_value_t = localmachine_protocol::EXPORT_CAPACITY)]
        capacity: usize,
    },

    /// Store the events of an archive in an agent journal
    ///
    /// Events are replayed by the agent's next sync cycle.
    Import {
        /// Agent journal
        #[arg(short, long)]
        journal: PathBuf,

        /// Home facility id
        #[arg(long, value_parser = commands::parse_facility)]
        home: FacilityId,

        /// Export archive
        archive: PathBuf,
    },

    /// Show what an agent still has to sync
    Status {
        /// Agent journal
        #[arg(short, long)]
        journal: PathBuf,

        /// Home facility id
        #[arg(long, value_parser = commands::parse_facility)]
        home: FacilityId,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { file, format } => commands::inspect::run(&file, format)?,
        Commands::Verify { file } => commands::verify::run(&file)?,
        Commands::Export {
            journal,
            home,
            out,
            facilities,
            capacity,
        } => {
            commands::transfer::export(&journal, home, &out, &facilities, capacity)?;
        }
        Commands::Import {
            journal,
            home,
            archive,
        } => {
            commands::transfer::import(&journal, home, &archive)?;
        }
        Commands::Status {
            journal,
            home,
            format,
        } => commands::status::run(&journal, home, format)?,
    }

    Ok(())
}
