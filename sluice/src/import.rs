//! Imports records from their sources into indexes in bulk

use chrono::prelude::*;
use itertools::Itertools;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{Level, event, instrument};

use crate::backends::{BulkAction, BulkItem, BulkRequest, BulkResponse};
use crate::journal::JournalEntry;
use crate::registry::{Document, IndexDefinition, TypeDefinition, TypeKey};
use crate::{Error, Sluice};

/// The options for an import
///
/// Unset options fall back to the type, then the index, then the config.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ImportOptions {
    /// The number of records to load and send per batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// The max size in bytes of a single bulk request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_size: Option<usize>,
    /// Whether to write journal entries for this import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<bool>,
    /// Whether to refresh the index once this import is done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<bool>,
    /// The suffix of the physical index to import into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    /// Only send these fields as partial updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_fields: Option<Vec<String>>,
    /// Whether failed partial updates are retried as full documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_failover: Option<bool>,
}

impl ImportOptions {
    /// Set the number of records per batch
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Set the max size in bytes of a bulk request
    #[must_use]
    pub fn bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = Some(bulk_size);
        self
    }

    /// Set whether to write journal entries
    #[must_use]
    pub fn journal(mut self, journal: bool) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Set whether to refresh after importing
    #[must_use]
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Set the suffix of the physical index to import into
    #[must_use]
    pub fn suffix<T: Into<String>>(mut self, suffix: T) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Only send these fields as partial updates
    #[must_use]
    pub fn update_fields<I, T>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.update_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Set whether failed partial updates are retried as full documents
    #[must_use]
    pub fn update_failover(mut self, failover: bool) -> Self {
        self.update_failover = Some(failover);
        self
    }

    /// Lay another set of options on top of these
    ///
    /// # Arguments
    ///
    /// * `over` - The options that take priority
    #[must_use]
    pub fn overlay(&self, over: &ImportOptions) -> ImportOptions {
        ImportOptions {
            batch_size: over.batch_size.or(self.batch_size),
            bulk_size: over.bulk_size.or(self.bulk_size),
            journal: over.journal.or(self.journal),
            refresh: over.refresh.or(self.refresh),
            suffix: over.suffix.clone().or_else(|| self.suffix.clone()),
            update_fields: over
                .update_fields
                .clone()
                .or_else(|| self.update_fields.clone()),
            update_failover: over.update_failover.or(self.update_failover),
        }
    }
}

/// A single change to import
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Record {
    /// Write this document
    Index(Document),
    /// Delete the document with this id
    Delete(String),
}

impl Record {
    /// Get the id of this record
    pub fn id(&self) -> &str {
        match self {
            Record::Index(doc) => &doc.id,
            Record::Delete(id) => id,
        }
    }
}

/// What to import
#[derive(Debug, Clone, PartialEq)]
pub enum ImportSource {
    /// Every record in the type's adapter
    All,
    /// Records to load from the adapter by id
    Ids(Vec<String>),
    /// Records that are already loaded
    Records(Vec<Record>),
}

/// The outcome of importing a type
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImportReport {
    /// The type that was imported
    pub target: TypeKey,
    /// The number of successful operations for each action
    pub counts: BTreeMap<BulkAction, usize>,
    /// The ids that failed for each action grouped by their error
    pub errors: BTreeMap<BulkAction, BTreeMap<String, Vec<String>>>,
    /// How long this import took
    pub elapsed: Duration,
}

impl ImportReport {
    /// Create an empty report
    ///
    /// # Arguments
    ///
    /// * `target` - The type being imported
    pub fn new(target: TypeKey) -> Self {
        ImportReport {
            target,
            counts: BTreeMap::default(),
            errors: BTreeMap::default(),
            elapsed: Duration::default(),
        }
    }

    /// Check if every operation in this import succeeded
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Get the number of successful operations for an action
    ///
    /// # Arguments
    ///
    /// * `action` - The action to count
    pub fn count(&self, action: BulkAction) -> usize {
        self.counts.get(&action).copied().unwrap_or_default()
    }

    /// Get every id that failed
    pub fn failed_ids(&self) -> Vec<String> {
        self.errors
            .values()
            .flat_map(|grouped| grouped.values().flatten().cloned())
            .unique()
            .collect()
    }

    /// Record a failed operation
    ///
    /// # Arguments
    ///
    /// * `action` - The action that failed
    /// * `error` - The error the operation failed with
    /// * `id` - The id of the document that failed
    fn record_error(&mut self, action: BulkAction, error: &Value, id: &str) {
        self.errors
            .entry(action)
            .or_default()
            .entry(error.to_string())
            .or_default()
            .push(id.to_owned());
    }

    /// Record a successful operation
    ///
    /// # Arguments
    ///
    /// * `action` - The action that succeeded
    fn record_success(&mut self, action: BulkAction) {
        *self.counts.entry(action).or_default() += 1;
    }

    /// Describe the errors in this import grouped by action and error
    ///
    /// Each line is indented and ends with a newline.
    pub fn error_summary(&self) -> String {
        let mut summary = String::default();
        for (action, grouped) in &self.errors {
            summary.push_str(&format!("    {} errors:\n", capitalize(action.as_str())));
            for (error, ids) in grouped {
                summary.push_str(&format!(
                    "      `{error}`\n        on {} documents: {ids:?}\n",
                    ids.len()
                ));
            }
        }
        summary
    }

    /// Build a message describing why this import failed
    pub fn failure_message(&self) -> String {
        format!(
            "Import failed for `{}` with:\n{}",
            self.target,
            self.error_summary().trim_end()
        )
    }
}

/// Uppercase the first letter of a word
///
/// # Arguments
///
/// * `word` - The word to capitalize
fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::default(),
    }
}

/// Split bulk items into contiguous chunks that fit in a max request size
///
/// The size of each item counts its action line and its document line. An
/// item that is bigger then the max on its own is sent by itself.
///
/// # Arguments
///
/// * `items` - The items to split
/// * `max` - The max size of a chunk in bytes
pub fn chunk_items(items: &[BulkItem], max: usize) -> Vec<&[BulkItem]> {
    let mut chunks = Vec::default();
    let mut start = 0;
    let mut current = 0;
    for (pos, item) in items.iter().enumerate() {
        let size = item.serialized_size();
        // start a new chunk if this item would not fit
        if pos > start && current + size > max {
            chunks.push(&items[start..pos]);
            start = pos;
            current = 0;
        }
        current += size;
    }
    // push the remaining chunk if it has any values in it
    if start < items.len() {
        chunks.push(&items[start..]);
    }
    chunks
}

/// The resolved settings for a single import
#[derive(Debug, Clone)]
struct ResolvedOptions {
    /// The number of records per batch
    batch_size: usize,
    /// The max size in bytes of a bulk request
    bulk_size: Option<usize>,
    /// Whether to write journal entries
    journal: bool,
    /// Whether to refresh once done
    refresh: bool,
    /// The suffix of the physical index to import into
    suffix: Option<String>,
    /// Only send these fields as partial updates
    update_fields: Option<Vec<String>>,
    /// Whether failed partial updates are retried as full documents
    update_failover: bool,
}

/// Imports records for a single type
pub(crate) struct Importer<'a> {
    /// The sluice client to use
    sluice: &'a Sluice,
    /// The type being imported
    type_def: &'a TypeDefinition,
    /// The key for the type being imported
    key: TypeKey,
    /// The settings for this import
    options: ResolvedOptions,
    /// The physical index or alias to write to
    target: String,
}

impl<'a> Importer<'a> {
    /// Build an importer for a type
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to use
    /// * `index` - The index being imported into
    /// * `type_def` - The type being imported
    /// * `options` - The options set for this import
    pub fn new(
        sluice: &'a Sluice,
        index: &'a IndexDefinition,
        type_def: &'a TypeDefinition,
        options: &ImportOptions,
    ) -> Self {
        let conf = &sluice.conf.import;
        // lay our options on top of the index and type defaults
        let merged = index
            .import_options
            .overlay(&type_def.import_options)
            .overlay(options);
        let options = ResolvedOptions {
            batch_size: merged.batch_size.unwrap_or(conf.batch_size).max(1),
            bulk_size: merged.bulk_size.or(conf.bulk_size),
            // types can force journaling on or off
            journal: type_def
                .journal
                .unwrap_or_else(|| merged.journal.unwrap_or(conf.journal)),
            refresh: merged.refresh.unwrap_or(conf.refresh),
            suffix: merged.suffix,
            update_fields: merged.update_fields,
            update_failover: merged.update_failover.unwrap_or(conf.update_failover),
        };
        let target = sluice.index_name(&index.name, options.suffix.as_deref());
        Importer {
            sluice,
            type_def,
            key: TypeKey::new(&index.name, &type_def.name),
            options,
            target,
        }
    }

    /// Load a batch of records from our adapter by id
    ///
    /// # Arguments
    ///
    /// * `ids` - The ids to load
    async fn load(&self, ids: &[String]) -> Result<Vec<Record>, Error> {
        let mut docs = self
            .type_def
            .adapter
            .load(ids)
            .await?
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect::<HashMap<String, Document>>();
        // any ids without a record get deleted
        Ok(ids
            .iter()
            .map(|id| match docs.remove(id) {
                Some(doc) => Record::Index(doc),
                None => Record::Delete(id.clone()),
            })
            .collect())
    }

    /// Build the bulk operation for a record
    ///
    /// # Arguments
    ///
    /// * `record` - The record to build an operation for
    fn bulk_item(&self, record: &Record) -> BulkItem {
        match (record, &self.options.update_fields) {
            (Record::Index(doc), Some(fields)) => {
                // only send the fields we were asked to update
                let partial = doc
                    .source
                    .as_object()
                    .map(|source| {
                        fields
                            .iter()
                            .filter_map(|field| {
                                source.get(field).map(|value| (field.clone(), value.clone()))
                            })
                            .collect::<Map<String, Value>>()
                    })
                    .unwrap_or_default();
                BulkItem {
                    action: BulkAction::Update,
                    type_name: self.key.type_name.clone(),
                    id: doc.id.clone(),
                    source: Some(Value::Object(partial)),
                }
            }
            (Record::Index(doc), None) => BulkItem {
                action: BulkAction::Index,
                type_name: self.key.type_name.clone(),
                id: doc.id.clone(),
                source: Some(doc.source.clone()),
            },
            (Record::Delete(id), _) => BulkItem {
                action: BulkAction::Delete,
                type_name: self.key.type_name.clone(),
                id: id.clone(),
                source: None,
            },
        }
    }

    /// Send a list of bulk operations split by our bulk size
    ///
    /// # Arguments
    ///
    /// * `items` - The operations to send
    async fn send(&self, items: &[BulkItem]) -> Result<BulkResponse, Error> {
        let chunks = match self.options.bulk_size {
            Some(bulk_size) => chunk_items(items, bulk_size),
            None => vec![items],
        };
        let mut response = BulkResponse::default();
        for chunk in chunks {
            let request = BulkRequest {
                index: self.target.clone(),
                items: chunk.to_vec(),
                refresh: false,
            };
            let chunk_response = self.sluice.backend.bulk(&request).await?;
            response.took += chunk_response.took;
            response.items.extend(chunk_response.items);
        }
        Ok(response)
    }

    /// Import a single batch of records
    ///
    /// # Arguments
    ///
    /// * `records` - The records to import
    /// * `report` - The report to add our results to
    async fn import_batch(&self, records: &[Record], report: &mut ImportReport) -> Result<(), Error> {
        if records.is_empty() {
            return Ok(());
        }
        let items = records
            .iter()
            .map(|record| self.bulk_item(record))
            .collect::<Vec<BulkItem>>();
        let response = self.send(&items).await?;
        // track which ids succeeded for each action so we can journal them
        let mut succeeded: BTreeMap<BulkAction, Vec<String>> = BTreeMap::default();
        let mut failover = Vec::default();
        for result in response.items {
            match result.error {
                None => {
                    report.record_success(result.action);
                    succeeded.entry(result.action).or_default().push(result.id);
                }
                // retry failed partial updates as full documents
                Some(_) if result.action == BulkAction::Update && self.options.update_failover => {
                    failover.push(result.id);
                }
                Some(error) => report.record_error(result.action, &error, &result.id),
            }
        }
        if !failover.is_empty() {
            let retries = records
                .iter()
                .filter_map(|record| match record {
                    Record::Index(doc) if failover.contains(&doc.id) => Some(BulkItem {
                        action: BulkAction::Index,
                        type_name: self.key.type_name.clone(),
                        id: doc.id.clone(),
                        source: Some(doc.source.clone()),
                    }),
                    _ => None,
                })
                .collect::<Vec<BulkItem>>();
            event!(
                Level::DEBUG,
                msg = "Retrying failed updates as full documents",
                target = self.key.to_string(),
                count = retries.len()
            );
            for result in self.send(&retries).await?.items {
                match result.error {
                    None => {
                        report.record_success(result.action);
                        succeeded.entry(result.action).or_default().push(result.id);
                    }
                    Some(error) => report.record_error(result.action, &error, &result.id),
                }
            }
        }
        // journal anything that was applied
        if self.options.journal && !succeeded.is_empty() {
            let now = Utc::now();
            let entries = succeeded
                .into_iter()
                .map(|(action, references)| JournalEntry {
                    index_name: self.key.index.clone(),
                    type_name: self.key.type_name.clone(),
                    action,
                    references,
                    created_at: now,
                })
                .collect::<Vec<JournalEntry>>();
            self.sluice.journal().write(&entries).await?;
        }
        Ok(())
    }

    /// Import records into our index
    ///
    /// # Arguments
    ///
    /// * `source` - What to import
    #[instrument(name = "Importer::run", skip_all, fields(target = self.key.to_string(), index = self.target), err(Debug))]
    pub async fn run(&self, source: ImportSource) -> Result<ImportReport, Error> {
        let start = Instant::now();
        let mut report = ImportReport::new(self.key.clone());
        // make sure our index exists unless we are writing to a specific version
        if self.options.suffix.is_none() && !self.sluice.conf.import.skip_index_creation {
            self.sluice.index(&self.key.index)?.ensure_exists().await?;
        }
        let batch_size = self.options.batch_size;
        match source {
            ImportSource::All => {
                let ids = self.type_def.adapter.ids().await?;
                for batch in ids.chunks(batch_size) {
                    let records = self.load(batch).await?;
                    self.import_batch(&records, &mut report).await?;
                }
            }
            ImportSource::Ids(ids) => {
                let ids = ids.into_iter().unique().collect::<Vec<String>>();
                for batch in ids.chunks(batch_size) {
                    let records = self.load(batch).await?;
                    self.import_batch(&records, &mut report).await?;
                }
            }
            ImportSource::Records(records) => {
                for batch in records.chunks(batch_size) {
                    self.import_batch(batch, &mut report).await?;
                }
            }
        }
        // make our changes searchable if we were asked to
        if self.options.refresh && (!report.counts.is_empty() || !report.errors.is_empty()) {
            self.sluice
                .backend
                .refresh(std::slice::from_ref(&self.target))
                .await?;
        }
        report.elapsed = start.elapsed();
        event!(
            Level::INFO,
            msg = "Imported",
            target = self.key.to_string(),
            index = report.count(BulkAction::Index),
            update = report.count(BulkAction::Update),
            delete = report.count(BulkAction::Delete),
            failed = report.failed_ids().len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn item(id: &str, size: usize) -> BulkItem {
        BulkItem {
            action: BulkAction::Index,
            type_name: "city".to_owned(),
            id: id.to_owned(),
            source: Some(json!({"name": "x".repeat(size)})),
        }
    }

    #[test]
    fn chunking() {
        let items = vec![item("1", 10), item("2", 10), item("3", 500), item("4", 10)];
        let small = items[0].serialized_size();
        // everything fits in one chunk
        assert_eq!(chunk_items(&items, usize::MAX).len(), 1);
        // the big item is sent on its own
        let chunks = chunk_items(&items, small * 2);
        let lens = chunks.iter().map(|chunk| chunk.len()).collect::<Vec<_>>();
        assert_eq!(lens, vec![2, 1, 1]);
        assert!(chunk_items(&[], 10).is_empty());
    }

    #[test]
    fn overlay() {
        let base = ImportOptions::default().batch_size(10).journal(true);
        let over = ImportOptions::default().batch_size(5).suffix("2014");
        let merged = base.overlay(&over);
        assert_eq!(merged.batch_size, Some(5));
        assert_eq!(merged.journal, Some(true));
        assert_eq!(merged.suffix.as_deref(), Some("2014"));
    }

    #[test]
    fn failure_message() {
        let mut report = ImportReport::new(TypeKey::new("cities", "city"));
        report.record_error(BulkAction::Index, &json!({"type": "mapper_parsing_exception"}), "2");
        report.record_success(BulkAction::Index);
        assert!(!report.is_success());
        assert_eq!(report.failed_ids(), vec!["2".to_owned()]);
        assert!(report.failure_message().contains("Index errors:"));
        assert!(report.failure_message().contains("on 1 documents: [\"2\"]"));
        assert_eq!(
            report.error_summary(),
            "    Index errors:\n      `{\"type\":\"mapper_parsing_exception\"}`\n        on 1 documents: [\"2\"]\n"
        );
        assert_eq!(
            report.failure_message(),
            format!("Import failed for `cities#city` with:\n{}", report.error_summary().trim_end())
        );
    }
}
