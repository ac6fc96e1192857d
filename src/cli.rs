use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::export::ExportFormat;
use crate::model::IntervalStatus;

#[derive(Parser)]
#[command(name = "fuhrpark")]
#[command(about = "Fleet reservation server with conflict checking")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding the WAL (overrides FUHRPARK_DATA_DIR)
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the PostgreSQL wire server (default)
    Serve,
    /// Print reservations from the WAL
    Export {
        /// Only this vehicle
        #[arg(long, value_name = "ID")]
        vehicle: Option<ulid::Ulid>,
        /// Only reservations with this status
        #[arg(long, value_parser = parse_status)]
        status: Option<IntervalStatus>,
        #[arg(long, value_enum, default_value = "csv")]
        format: ExportFormat,
    },
    /// Print the TÜV inspection report
    Inspections,
}

fn parse_status(s: &str) -> Result<IntervalStatus, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::parse_from(["fuhrpark"]);
        assert!(cli.command.is_none());
        assert!(cli.data_dir.is_none());
    }

    #[test]
    fn export_flags() {
        let cli = Cli::parse_from([
            "fuhrpark",
            "export",
            "--status",
            "active",
            "--format",
            "json",
            "--data-dir",
            "/tmp/fp",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/fp")));
        match cli.command {
            Some(Commands::Export {
                vehicle,
                status,
                format,
            }) => {
                assert_eq!(vehicle, None);
                assert_eq!(status, Some(IntervalStatus::Active));
                assert_eq!(format, ExportFormat::Json);
            }
            _ => panic!("expected export"),
        }
    }

    #[test]
    fn bad_status_is_rejected() {
        assert!(Cli::try_parse_from(["fuhrpark", "export", "--status", "maybe"]).is_err());
    }
}
