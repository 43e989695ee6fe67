//! The arguments for administering indexes

use chrono::prelude::*;
use clap::Parser;
use std::path::PathBuf;

/// The arguments for administering indexes
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct AdminArgs {
    /// The path to load our config from
    #[clap(short, long, default_value = "sluice.yml")]
    pub config: PathBuf,
    /// The sub command to execute
    #[clap(subcommand)]
    pub cmd: AdminCommand,
}

/// The admin sub commands
#[derive(Parser, Debug, Clone)]
pub enum AdminCommand {
    /// Rebuild indexes without downtime
    Reset(Selection),
    /// Rebuild only the indexes whose settings or mappings changed
    Upgrade(Selection),
    /// Re-import every document into existing indexes
    Update(Selection),
    /// Re-import documents that are missing or out of date
    Sync(Selection),
    /// Replay journaled changes made after some time
    JournalApply(JournalApply),
    /// Delete journaled changes made before some time
    JournalClean(JournalClean),
}

/// The indexes or types to act on
#[derive(Parser, Debug, Clone, Default)]
pub struct Selection {
    /// Only act on these indexes or `index#type` targets
    #[clap(short, long)]
    pub only: Vec<String>,
    /// Skip these indexes or `index#type` targets
    #[clap(short, long)]
    pub except: Vec<String>,
}

/// Replay journaled changes
#[derive(Parser, Debug, Clone)]
pub struct JournalApply {
    /// Replay entries created after this time (RFC 3339)
    #[clap(short, long)]
    pub time: DateTime<Utc>,
    /// The indexes or types to replay
    #[clap(flatten)]
    pub selection: Selection,
}

/// Delete journaled changes
#[derive(Parser, Debug, Clone)]
pub struct JournalClean {
    /// Delete entries created at or before this time (RFC 3339) or all entries if not set
    #[clap(short, long)]
    pub time: Option<DateTime<Utc>>,
    /// The indexes or types to delete entries for
    #[clap(flatten)]
    pub selection: Selection,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let args = AdminArgs::parse_from([
            "sluice-admin",
            "journal-apply",
            "--time",
            "2014-05-01T12:00:00Z",
            "--only",
            "cities",
        ]);
        match args.cmd {
            AdminCommand::JournalApply(apply) => {
                assert_eq!(apply.time, Utc.with_ymd_and_hms(2014, 5, 1, 12, 0, 0).unwrap());
                assert_eq!(apply.selection.only, vec!["cities".to_owned()]);
            }
            other => panic!("Unexpected command {other:?}"),
        }
        assert_eq!(args.config, PathBuf::from("sluice.yml"));
    }
}
