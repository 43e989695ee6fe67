//! Adapters that supply records to import

use chrono::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::Error;
use crate::registry::{Adapter, Document};

/// A record held by a memory adapter
#[derive(Debug, Clone)]
struct MemoryRecord {
    /// The document to index for this record
    source: Value,
    /// When this record was last updated if that is tracked
    updated_at: Option<DateTime<Utc>>,
}

/// Records held in memory
///
/// Clones share the same records so a test can keep changing them after
/// handing the adapter to a type.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdapter {
    /// The records by id
    records: Arc<RwLock<BTreeMap<String, MemoryRecord>>>,
}

impl MemoryAdapter {
    /// Create an empty memory adapter
    pub fn new() -> Self {
        MemoryAdapter::default()
    }

    /// Create a memory adapter holding some records
    ///
    /// # Arguments
    ///
    /// * `records` - The ids and documents to hold
    pub fn with_records<I, T>(records: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (T, Value)>,
        T: Into<String>,
    {
        let adapter = MemoryAdapter::new();
        for (id, source) in records {
            adapter.insert(id, source)?;
        }
        Ok(adapter)
    }

    /// Add or replace a record
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the record
    /// * `source` - The document to index for this record
    pub fn insert<T: Into<String>>(&self, id: T, source: Value) -> Result<(), Error> {
        self.write(id.into(), MemoryRecord { source, updated_at: None })
    }

    /// Add or replace a record and track when it was updated
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the record
    /// * `source` - The document to index for this record
    /// * `updated_at` - When this record was updated
    pub fn insert_at<T: Into<String>>(
        &self,
        id: T,
        source: Value,
        updated_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let record = MemoryRecord {
            source,
            updated_at: Some(updated_at),
        };
        self.write(id.into(), record)
    }

    /// Store a record
    fn write(&self, id: String, record: MemoryRecord) -> Result<(), Error> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::new("Memory adapter lock is poisoned"))?;
        records.insert(id, record);
        Ok(())
    }

    /// Remove a record
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the record to remove
    pub fn remove(&self, id: &str) -> Result<bool, Error> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::new("Memory adapter lock is poisoned"))?;
        Ok(records.remove(id).is_some())
    }

    /// Get the number of records held
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.read()?.len())
    }

    /// Check if no records are held
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.read()?.is_empty())
    }

    /// Lock our records for reading
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, MemoryRecord>>, Error> {
        self.records
            .read()
            .map_err(|_| Error::new("Memory adapter lock is poisoned"))
    }
}

#[async_trait::async_trait]
impl Adapter for MemoryAdapter {
    async fn ids(&self) -> Result<Vec<String>, Error> {
        Ok(self.read()?.keys().cloned().collect())
    }

    async fn load(&self, ids: &[String]) -> Result<Vec<Document>, Error> {
        let records = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                records
                    .get(id)
                    .map(|record| Document::new(id.clone(), record.source.clone()))
            })
            .collect())
    }

    async fn sync_data(&self) -> Result<Option<Vec<(String, DateTime<Utc>)>>, Error> {
        let records = self.read()?;
        // only report update times if every record tracks them
        if records.is_empty() || records.values().any(|record| record.updated_at.is_none()) {
            return Ok(None);
        }
        Ok(Some(
            records
                .iter()
                .filter_map(|(id, record)| record.updated_at.map(|time| (id.clone(), time)))
                .collect(),
        ))
    }
}
