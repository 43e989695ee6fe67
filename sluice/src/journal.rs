//! Records the changes made by imports so they can be replayed later

use chrono::prelude::*;
use itertools::Itertools;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{Level, event, instrument};
use uuid::Uuid;

use crate::backends::{BulkAction, BulkItem, BulkRequest};
use crate::import::{ImportOptions, ImportReport, ImportSource};
use crate::registry::{JOURNAL_INDEX, TypeKey};
use crate::{Error, Sluice};

/// A change that was applied to some documents
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// The base name of the index that was changed
    pub index_name: String,
    /// The type of documents that were changed
    pub type_name: String,
    /// The action that was applied
    pub action: BulkAction,
    /// The ids of the documents that were changed
    pub references: Vec<String>,
    /// When this change was made
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Get the type this entry changed
    pub fn key(&self) -> TypeKey {
        TypeKey::new(&self.index_name, &self.type_name)
    }
}

/// The outcome of applying the journal
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct JournalApplyReport {
    /// The number of entries that were applied
    pub entries: usize,
    /// The number of stages it took to catch up
    pub stages: usize,
    /// Whether we ran out of retries before catching up
    pub exhausted: bool,
    /// The imports that did not fully succeed
    pub failures: Vec<ImportReport>,
}

/// Build a filter restricting journal entries to some indexes or types
///
/// # Arguments
///
/// * `only` - The indexes or `index#type` targets to keep
fn only_clause<T: AsRef<str>>(only: &[T]) -> Option<Value> {
    if only.is_empty() {
        return None;
    }
    let clauses = only
        .iter()
        .map(|target| match target.as_ref().split_once('#') {
            Some((index, type_name)) => json!({"bool": {"filter": [
                {"term": {"index_name": index}},
                {"term": {"type_name": type_name}},
            ]}}),
            None => json!({"term": {"index_name": target.as_ref()}}),
        })
        .collect::<Vec<Value>>();
    Some(json!({"bool": {"should": clauses, "minimum_should_match": 1}}))
}

/// The journal of changes applied by imports
#[derive(Clone)]
pub struct Journal {
    /// The sluice client to use
    sluice: Sluice,
}

impl Journal {
    /// Create a handle to the journal
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to use
    pub fn new(sluice: Sluice) -> Self {
        Journal { sluice }
    }

    /// Append entries to the journal
    ///
    /// # Arguments
    ///
    /// * `entries` - The entries to append
    #[instrument(name = "Journal::write", skip_all, fields(entries = entries.len()), err(Debug))]
    pub async fn write(&self, entries: &[JournalEntry]) -> Result<(), Error> {
        if entries.is_empty() {
            return Ok(());
        }
        let handle = self.sluice.index(JOURNAL_INDEX)?;
        handle.ensure_exists().await?;
        let items = entries
            .iter()
            .map(|entry| {
                Ok(BulkItem {
                    action: BulkAction::Index,
                    type_name: "journal".to_owned(),
                    id: Uuid::new_v4().to_string(),
                    source: Some(serde_json::to_value(entry)?),
                })
            })
            .collect::<Result<Vec<BulkItem>, Error>>()?;
        let request = BulkRequest {
            index: handle.index_name(None),
            items,
            refresh: true,
        };
        let response = self.sluice.backend.bulk(&request).await?;
        // journal writes must not silently go missing
        if let Some(failed) = response.items.iter().find(|item| item.error.is_some()) {
            return Err(Error::new(format!(
                "Failed to write journal entry: {}",
                failed.error.clone().unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Get the entries created after some time in the order they were created
    ///
    /// # Arguments
    ///
    /// * `since` - Only get entries created after this
    /// * `only` - The indexes or `index#type` targets to get entries for
    #[instrument(name = "Journal::entries", skip_all, err(Debug))]
    pub async fn entries<T: AsRef<str>>(
        &self,
        since: Option<DateTime<Utc>>,
        only: &[T],
    ) -> Result<Vec<JournalEntry>, Error> {
        let mut query = self
            .sluice
            .query(&[JOURNAL_INDEX])?
            .order(json!({"created_at": "asc"}));
        if let Some(since) = since {
            query = query.filter(json!({"range": {"created_at": {"gt": since.timestamp_millis()}}}));
        }
        if let Some(clause) = only_clause(only) {
            query = query.filter(clause);
        }
        let batch_size = self.sluice.conf.search.batch_size;
        query
            .scroll_hits(batch_size)
            .await?
            .into_iter()
            .map(|hit| Ok(serde_json::from_value(hit.source)?))
            .collect()
    }

    /// Replay the journal until it stops growing or we run out of retries
    ///
    /// Each stage re-imports the documents referenced by entries newer then the
    /// last stage without journaling them again.
    ///
    /// # Arguments
    ///
    /// * `since` - Replay entries created after this
    /// * `retries` - The max number of extra stages to run
    /// * `only` - The indexes or `index#type` targets to replay
    #[instrument(name = "Journal::apply", skip_all, fields(since = since.to_rfc3339()), err(Debug))]
    pub async fn apply<T: AsRef<str>>(
        &self,
        since: DateTime<Utc>,
        retries: Option<usize>,
        only: &[T],
    ) -> Result<JournalApplyReport, Error> {
        let retries = retries.unwrap_or(self.sluice.conf.journal.retries);
        let mut report = JournalApplyReport::default();
        let mut watermark = since;
        while report.stages <= retries {
            let entries = self.entries(Some(watermark), only).await?;
            if entries.is_empty() {
                return Ok(report);
            }
            report.stages += 1;
            report.entries += entries.len();
            // move our watermark up to the newest entry we have seen
            if let Some(newest) = entries.iter().map(|entry| entry.created_at).max() {
                watermark = newest;
            }
            // group the referenced ids by type
            let grouped: BTreeMap<TypeKey, Vec<String>> = entries
                .into_iter()
                .map(|entry| (entry.key(), entry.references))
                .into_group_map()
                .into_iter()
                .map(|(key, refs)| (key, refs.into_iter().flatten().unique().collect()))
                .collect();
            for (key, ids) in grouped {
                let handle = match self.sluice.type_handle(&key.to_string()) {
                    Ok(handle) => handle,
                    Err(error) => {
                        event!(
                            Level::WARN,
                            msg = "Skipping journal entries for an unknown type",
                            target = key.to_string(),
                            error = error.to_string()
                        );
                        continue;
                    }
                };
                let options = ImportOptions::default().journal(false);
                let imported = handle.import(ImportSource::Ids(ids), &options).await?;
                if !imported.is_success() {
                    report.failures.push(imported);
                }
            }
            event!(
                Level::INFO,
                msg = "Applied journal stage",
                stage = report.stages,
                entries = report.entries
            );
        }
        // we only ran out of retries if entries are still waiting
        report.exhausted = !self.entries(Some(watermark), only).await?.is_empty();
        Ok(report)
    }

    /// Delete the entries created at or before some time
    ///
    /// # Arguments
    ///
    /// * `until` - Delete entries created at or before this or all entries if not set
    /// * `only` - The indexes or `index#type` targets to delete entries for
    #[instrument(name = "Journal::clean", skip_all, err(Debug))]
    pub async fn clean<T: AsRef<str>>(
        &self,
        until: Option<DateTime<Utc>>,
        only: &[T],
    ) -> Result<u64, Error> {
        let mut query = self.sluice.query(&[JOURNAL_INDEX])?;
        if let Some(until) = until {
            query = query.filter(json!({"range": {"created_at": {"lte": until.timestamp_millis()}}}));
        }
        if let Some(clause) = only_clause(only) {
            query = query.filter(clause);
        }
        let deleted = query.delete_all().await?;
        event!(Level::INFO, msg = "Cleaned journal", deleted);
        Ok(deleted)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_clauses() {
        assert!(only_clause::<&str>(&[]).is_none());
        let clause = only_clause(&["cities", "places#country"]).unwrap();
        assert_eq!(clause["bool"]["minimum_should_match"], 1);
        assert_eq!(clause["bool"]["should"][0], json!({"term": {"index_name": "cities"}}));
        assert_eq!(
            clause["bool"]["should"][1]["bool"]["filter"][1],
            json!({"term": {"type_name": "country"}})
        );
    }

    #[test]
    fn entries_store_millis() {
        let entry = JournalEntry {
            index_name: "cities".to_owned(),
            type_name: "city".to_owned(),
            action: BulkAction::Index,
            references: vec!["1".to_owned()],
            created_at: Utc.timestamp_millis_opt(1_500_000_000_123).unwrap(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["created_at"], 1_500_000_000_123_i64);
        assert_eq!(value["action"], "index");
        assert_eq!(entry.key(), TypeKey::new("cities", "city"));
    }
}
