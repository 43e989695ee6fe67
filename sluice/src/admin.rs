//! Administrative operations that report their progress to an output

use chrono::prelude::*;
use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::instrument;

mod args;

pub use args::{AdminArgs, AdminCommand, JournalApply, JournalClean, Selection};

use crate::import::{ImportOptions, ImportReport, ImportSource};
use crate::index::{IndexHandle, ResetOptions, TypeHandle};
use crate::conf::Conf;
use crate::registry::{Registry, TypeKey};
use crate::{Error, Sluice};

/// Format a duration like `1h 2m 5s`
///
/// # Arguments
///
/// * `duration` - The duration to format
pub fn human_duration(duration: Duration) -> String {
    let mut seconds = duration.as_secs();
    if seconds == 0 {
        return "0s".to_owned();
    }
    let mut parts = Vec::with_capacity(4);
    for (amount, unit) in [(60, "s"), (60, "m"), (24, "h")] {
        if seconds == 0 {
            break;
        }
        parts.push(format!("{}{unit}", seconds % amount));
        seconds /= amount;
    }
    // anything left over is whole days
    if seconds > 0 {
        parts.push(format!("{seconds}d"));
    }
    parts.reverse();
    parts.join(" ")
}

/// Runs administrative operations and writes their progress to an output
pub struct Admin<W: Write> {
    /// The sluice client to use
    sluice: Sluice,
    /// Where to write our progress
    output: W,
}

impl<W: Write> Admin<W> {
    /// Create a new admin
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to use
    /// * `output` - Where to write progress
    pub fn new(sluice: Sluice, output: W) -> Self {
        Admin { sluice, output }
    }

    /// Get our output back
    pub fn into_inner(self) -> W {
        self.output
    }

    /// Get the indexes to act on sorted by name
    ///
    /// # Arguments
    ///
    /// * `selection` - The indexes to keep or skip
    fn indexes_from(&self, selection: &Selection) -> Result<Vec<IndexHandle>, Error> {
        let mut names = if selection.only.is_empty() {
            self.sluice
                .registry
                .indexes()
                .map(|definition| definition.name.clone())
                .collect::<Vec<String>>()
        } else {
            selection.only.clone()
        };
        names.retain(|name| !selection.except.contains(name));
        names.sort();
        names.dedup();
        names.iter().map(|name| self.sluice.index(name)).collect()
    }

    /// Get the types to act on sorted by their `index#type` name
    ///
    /// # Arguments
    ///
    /// * `selection` - The indexes or types to keep or skip
    fn types_from(&self, selection: &Selection) -> Result<Vec<TypeHandle>, Error> {
        let mut keys = if selection.only.is_empty() {
            self.sluice
                .registry
                .indexes()
                .flat_map(|definition| definition.type_keys())
                .collect::<Vec<TypeKey>>()
        } else {
            let mut keys = Vec::default();
            for target in &selection.only {
                keys.extend(self.sluice.registry.derive_types(target)?);
            }
            keys
        };
        for target in &selection.except {
            let skipped = self.sluice.registry.derive_types(target)?;
            keys.retain(|key| !skipped.contains(key));
        }
        keys.sort();
        keys.dedup();
        keys.iter()
            .map(|key| self.sluice.type_handle(&key.to_string()))
            .collect()
    }

    /// Write the results of an import
    ///
    /// # Arguments
    ///
    /// * `report` - The import to write
    fn print_import(&mut self, report: &ImportReport) -> Result<(), Error> {
        // round up so quick imports don't look free
        let elapsed = Duration::from_secs(report.elapsed.as_secs_f64().ceil() as u64);
        let stats = report
            .counts
            .iter()
            .map(|(action, count)| format!("{action} {count}"))
            .collect::<Vec<String>>()
            .join(", ");
        writeln!(
            self.output,
            "  Imported {} in {}, stats: {stats}",
            report.target,
            human_duration(elapsed)
        )?;
        write!(self.output, "{}", report.error_summary())?;
        Ok(())
    }

    /// Write how long an operation took in total
    ///
    /// # Arguments
    ///
    /// * `start` - When the operation started
    fn print_total(&mut self, start: Instant) -> Result<(), Error> {
        writeln!(self.output, "Total: {}", human_duration(start.elapsed()))?;
        Ok(())
    }

    /// Reset a single index to a new timestamped version
    ///
    /// # Arguments
    ///
    /// * `index` - The index to reset
    async fn reset_one(&mut self, index: &IndexHandle) -> Result<(), Error> {
        writeln!(self.output, "Resetting {}", index.definition().name)?;
        let suffix = Utc::now().timestamp_millis().to_string();
        let report = index.reset(Some(&suffix), &ResetOptions::default()).await?;
        for import in &report.imports {
            self.print_import(import)?;
        }
        Ok(())
    }

    /// Rebuild indexes without downtime
    ///
    /// Returns the names of the indexes that were reset.
    ///
    /// # Arguments
    ///
    /// * `selection` - The indexes to reset
    #[instrument(name = "Admin::reset", skip_all, err(Debug))]
    pub async fn reset(&mut self, selection: &Selection) -> Result<Vec<String>, Error> {
        let start = Instant::now();
        let mut reset = Vec::default();
        for index in self.indexes_from(selection)? {
            self.reset_one(&index).await?;
            reset.push(index.definition().name.clone());
        }
        self.print_total(start)?;
        Ok(reset)
    }

    /// Rebuild only the indexes whose specification changed
    ///
    /// Returns the names of the indexes that were reset.
    ///
    /// # Arguments
    ///
    /// * `selection` - The indexes to check
    #[instrument(name = "Admin::upgrade", skip_all, err(Debug))]
    pub async fn upgrade(&mut self, selection: &Selection) -> Result<Vec<String>, Error> {
        let start = Instant::now();
        let indexes = self.indexes_from(selection)?;
        // check every specification at once
        let changed = futures::future::try_join_all(
            indexes
                .iter()
                .map(|index| async move { index.specification().changed().await }),
        )
        .await?;
        let mut reset = Vec::default();
        if changed.iter().any(|changed| *changed) {
            for (index, changed) in indexes.iter().zip(changed) {
                if changed {
                    self.reset_one(index).await?;
                    reset.push(index.definition().name.clone());
                } else {
                    writeln!(
                        self.output,
                        "Skipping {}, the specification didn't change",
                        index.definition().name
                    )?;
                }
            }
        } else {
            writeln!(self.output, "No index specification was changed")?;
        }
        self.print_total(start)?;
        Ok(reset)
    }

    /// Re-import every document of the selected types into existing indexes
    ///
    /// Returns the keys of the types that were updated.
    ///
    /// # Arguments
    ///
    /// * `selection` - The indexes or types to update
    #[instrument(name = "Admin::update", skip_all, err(Debug))]
    pub async fn update(&mut self, selection: &Selection) -> Result<Vec<TypeKey>, Error> {
        let start = Instant::now();
        // group our types by the index they are in
        let mut grouped: BTreeMap<String, Vec<TypeHandle>> = BTreeMap::default();
        for handle in self.types_from(selection)? {
            grouped
                .entry(handle.key().index.clone())
                .or_default()
                .push(handle);
        }
        let mut updated = Vec::default();
        for (name, handles) in grouped {
            let index = self.sluice.index(&name)?;
            if !index.exists().await? {
                writeln!(
                    self.output,
                    "Skipping {name}, it does not exists (use the reset command to create and update it)"
                )?;
                continue;
            }
            writeln!(self.output, "Updating {name}")?;
            for handle in handles {
                let report = handle
                    .import(ImportSource::All, &ImportOptions::default())
                    .await?;
                self.print_import(&report)?;
                updated.push(handle.key().clone());
            }
        }
        self.print_total(start)?;
        Ok(updated)
    }

    /// Re-import documents that are missing or out of date
    ///
    /// Returns the keys of the types that had documents re-imported.
    ///
    /// # Arguments
    ///
    /// * `selection` - The indexes or types to sync
    #[instrument(name = "Admin::sync", skip_all, err(Debug))]
    pub async fn sync(&mut self, selection: &Selection) -> Result<Vec<TypeKey>, Error> {
        let start = Instant::now();
        let mut synced = Vec::default();
        for handle in self.types_from(selection)? {
            let key = handle.key().clone();
            writeln!(self.output, "Synchronizing {key}")?;
            let time = Instant::now();
            let report = handle.sync().await?;
            if let Some(import) = &report.import {
                self.print_import(import)?;
            }
            if report.count > 0 {
                if !report.missing.is_empty() {
                    writeln!(self.output, "  Missing documents: {:?}", report.missing)?;
                }
                if !report.outdated.is_empty() {
                    writeln!(self.output, "  Outdated documents: {:?}", report.outdated)?;
                }
                synced.push(key);
            } else {
                writeln!(self.output, "  Skipping {key}, up to date")?;
            }
            writeln!(self.output, "  Took {}", human_duration(time.elapsed()))?;
        }
        self.print_total(start)?;
        Ok(synced)
    }

    /// Replay journaled changes made after some time
    ///
    /// Returns the number of entries that were applied.
    ///
    /// # Arguments
    ///
    /// * `time` - Replay entries created after this
    /// * `selection` - The indexes or types to replay
    #[instrument(name = "Admin::journal_apply", skip_all, err(Debug))]
    pub async fn journal_apply(&mut self, time: DateTime<Utc>, selection: &Selection) -> Result<usize, Error> {
        let start = Instant::now();
        writeln!(
            self.output,
            "Applying journal entries created after {}",
            time.to_rfc3339()
        )?;
        let targets = self
            .types_from(selection)?
            .iter()
            .map(|handle| handle.key().to_string())
            .collect::<Vec<String>>();
        let report = self.sluice.journal().apply(time, None, &targets).await?;
        if report.entries == 0 {
            writeln!(self.output, "No journal entries were created after the specified time")?;
        } else {
            writeln!(
                self.output,
                "  Applied journal to {targets:?}, {} entries, {} stages",
                report.entries, report.stages
            )?;
        }
        for failure in &report.failures {
            self.print_import(failure)?;
        }
        self.print_total(start)?;
        Ok(report.entries)
    }

    /// Delete journaled changes made at or before some time
    ///
    /// Returns the number of entries that were deleted.
    ///
    /// # Arguments
    ///
    /// * `time` - Delete entries created at or before this or every entry if not set
    /// * `selection` - The indexes or types to delete entries for
    #[instrument(name = "Admin::journal_clean", skip_all, err(Debug))]
    pub async fn journal_clean(&mut self, time: Option<DateTime<Utc>>, selection: &Selection) -> Result<u64, Error> {
        let start = Instant::now();
        if let Some(time) = time {
            writeln!(
                self.output,
                "Cleaning journal entries created before {}",
                time.to_rfc3339()
            )?;
        }
        // only filter entries when we were asked to
        let targets = if selection.only.is_empty() && selection.except.is_empty() {
            Vec::default()
        } else {
            self.types_from(selection)?
                .iter()
                .map(|handle| handle.key().to_string())
                .collect::<Vec<String>>()
        };
        let count = self.sluice.journal().clean(time, &targets).await?;
        writeln!(self.output, "Cleaned up {count} journal entries")?;
        self.print_total(start)?;
        Ok(count)
    }

    /// Run an admin command
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to run
    pub async fn run(&mut self, cmd: &AdminCommand) -> Result<(), Error> {
        match cmd {
            AdminCommand::Reset(selection) => {
                self.reset(selection).await?;
            }
            AdminCommand::Upgrade(selection) => {
                self.upgrade(selection).await?;
            }
            AdminCommand::Update(selection) => {
                self.update(selection).await?;
            }
            AdminCommand::Sync(selection) => {
                self.sync(selection).await?;
            }
            AdminCommand::JournalApply(apply) => {
                self.journal_apply(apply.time, &apply.selection).await?;
            }
            AdminCommand::JournalClean(clean) => {
                self.journal_clean(clean.time, &clean.selection).await?;
            }
        }
        Ok(())
    }
}

/// Run an admin command against Elastic and write its progress to stdout
///
/// # Arguments
///
/// * `args` - The parsed admin arguments
/// * `registry` - The indexes to administer
pub async fn handle(args: &AdminArgs, registry: Registry) -> Result<(), Error> {
    let conf = Conf::new(&args.config)?;
    crate::trace::setup("sluice-admin", &conf.tracing);
    let sluice = Sluice::from_conf(conf, registry)?;
    let mut admin = Admin::new(sluice, std::io::stdout());
    admin.run(&args.cmd).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(human_duration(Duration::from_millis(200)), "0s");
        assert_eq!(human_duration(Duration::from_secs(5)), "5s");
        assert_eq!(human_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(human_duration(Duration::from_secs(3600)), "1h 0m 0s");
        assert_eq!(human_duration(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }
}
