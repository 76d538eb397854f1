//! Command-line arguments.

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use tally_core::{ProcessingStatus, RunMode, SearchIntent};

#[derive(Debug, Parser)]
#[command(name = "tally")]
#[command(author, version, about = "Invoice attachment extraction with an audit trail")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Search the mailbox and process matching attachments once
    Run(RunArgs),

    /// Run on the configured daily schedule until interrupted
    Schedule {
        /// Run immediately once, print the report, and exit
        #[arg(long)]
        now: bool,
    },

    /// List recently processed attachments with their invoices
    Recent {
        /// Lookback window in days
        #[arg(short, long, default_value_t = 7)]
        days: i64,

        /// Only records in this status (pending, completed, failed)
        #[arg(short, long, value_parser = parse_status)]
        status: Option<ProcessingStatus>,

        /// Maximum records returned
        #[arg(short, long, default_value_t = tally_core::defaults::RECENT_LIMIT)]
        limit: i64,
    },

    /// Show one attachment record and its invoices
    Show {
        /// Attachment record id
        id: Uuid,
    },

    /// Validate configuration and optionally ping the backends
    CheckConfig {
        /// Also check storage and the extraction model are reachable
        #[arg(long)]
        ping: bool,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Sender address, domain, or "From: ..." query
    #[arg(long)]
    pub sender: Option<String>,

    /// Text the subject should contain
    #[arg(long)]
    pub subject: Option<String>,

    /// Expected attachment name (plain or {"filename": "..."})
    #[arg(long)]
    pub name_hint: Option<String>,

    /// Lookback window in days
    #[arg(long)]
    pub days_back: Option<u32>,

    /// Process every candidate above the threshold, not only the best one
    #[arg(long)]
    pub all: bool,
}

impl RunArgs {
    /// Flags layered over the configured search intent.
    pub fn intent(&self, base: &SearchIntent) -> SearchIntent {
        let mut intent = base.clone();
        if let Some(sender) = &self.sender {
            intent.sender_email = Some(sender.clone());
        }
        if let Some(subject) = &self.subject {
            intent.subject_contains = Some(subject.clone());
        }
        if let Some(hint) = &self.name_hint {
            intent.attachment_name_hint = Some(hint.clone());
        }
        if let Some(days) = self.days_back {
            intent.days_back = days;
        }
        intent
    }

    pub fn mode(&self) -> RunMode {
        if self.all {
            RunMode::AllAboveThreshold
        } else {
            RunMode::RecommendedOnly
        }
    }
}

fn parse_status(raw: &str) -> Result<ProcessingStatus, String> {
    raw.trim()
        .to_lowercase()
        .parse()
        .map_err(|e: tally_core::Error| e.to_string())
}
