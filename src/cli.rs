//! CLI argument parsing for the dialer-worker binary.

use clap::{Args, Parser, Subcommand};

use crate::types::{ColumnMapping, ColumnRef, DuplicatePolicy};

#[derive(Parser)]
#[command(name = "dialer-worker", about = "Phonebook import and campaign subscriber worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Import a CSV file into a phonebook and print the job result
    Import(ImportArgs),
    /// Collect subscribers for a campaign and print the job result
    Collect {
        #[arg(long)]
        campaign: i64,
    },
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    #[arg(long)]
    pub phonebook: i64,
    /// File reference relative to UPLOAD_DIR
    #[arg(long)]
    pub file: String,
    /// Phone column, by header name or zero-based position
    #[arg(long, default_value = "phone")]
    pub phone: String,
    #[arg(long)]
    pub first_name: Option<String>,
    #[arg(long)]
    pub last_name: Option<String>,
    #[arg(long)]
    pub email: Option<String>,
    #[arg(long)]
    pub status: Option<String>,
    /// Update existing contacts instead of skipping them
    #[arg(long)]
    pub overwrite: bool,
    /// With --overwrite, blank fields clear stored values
    #[arg(long, requires = "overwrite")]
    pub blank_overwrites: bool,
}

impl ImportArgs {
    pub fn column_mapping(&self) -> ColumnMapping {
        ColumnMapping {
            phone: column_ref(&self.phone),
            first_name: self.first_name.as_deref().map(column_ref),
            last_name: self.last_name.as_deref().map(column_ref),
            email: self.email.as_deref().map(column_ref),
            status: self.status.as_deref().map(column_ref),
        }
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        if self.overwrite {
            DuplicatePolicy::Overwrite {
                blank_overwrites: self.blank_overwrites,
            }
        } else {
            DuplicatePolicy::Skip
        }
    }
}

/// All-digit arguments select a column by position
fn column_ref(raw: &str) -> ColumnRef {
    match raw.parse::<usize>() {
        Ok(position) => ColumnRef::Position(position),
        Err(_) => ColumnRef::Name(raw.to_string()),
    }
}
