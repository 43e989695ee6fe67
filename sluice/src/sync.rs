//! Find and re-import documents that drifted away from their source records

use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{Level, event, instrument};

use crate::import::{ImportOptions, ImportReport, ImportSource};
use crate::index::TypeHandle;
use crate::registry::TypeKey;
use crate::Error;

/// The outcome of syncing a type
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// The type that was synced
    pub target: TypeKey,
    /// The number of documents that were re-imported
    pub count: usize,
    /// The ids of records that were not indexed
    pub missing: Vec<String>,
    /// The ids of records whose documents were older then the record
    pub outdated: Vec<String>,
    /// The result of re-importing these documents if anything was re-imported
    pub import: Option<ImportReport>,
}

/// Parse a timestamp stored in a document
///
/// # Arguments
///
/// * `value` - The stored timestamp as a string or epoch millis
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|time| time.with_timezone(&Utc)),
        Value::Number(num) => num
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

impl TypeHandle {
    /// Get when each indexed document of this type was last updated
    ///
    /// # Arguments
    ///
    /// * `field` - The field holding when a document was updated
    async fn indexed_timestamps(&self, field: &str) -> Result<HashMap<String, Option<DateTime<Utc>>>, Error> {
        let batch_size = self.sluice.conf.search.batch_size;
        Ok(self
            .query()
            .only([field])
            .scroll_hits(batch_size)
            .await?
            .into_iter()
            .map(|hit| {
                let updated = hit.source.get(field).and_then(parse_timestamp);
                (hit.id, updated)
            })
            .collect())
    }

    /// Re-import records that are missing from the index or out of date
    ///
    /// Adapters that can't say when records were updated only find missing records.
    #[instrument(name = "TypeHandle::sync", skip(self), fields(target = self.key().to_string()), err(Debug))]
    pub async fn sync(&self) -> Result<SyncReport, Error> {
        let type_def = self.definition()?;
        let indexed = self.indexed_timestamps(&type_def.sync_field).await?;
        let mut missing = Vec::default();
        let mut outdated = Vec::default();
        match type_def.adapter.sync_data().await? {
            Some(records) => {
                for (id, updated) in records {
                    match indexed.get(&id) {
                        None => missing.push(id),
                        // compare at the precision documents store timestamps at
                        Some(Some(stored)) if stored.timestamp_millis() == updated.timestamp_millis() => (),
                        Some(_) => outdated.push(id),
                    }
                }
            }
            None => {
                missing = type_def
                    .adapter
                    .ids()
                    .await?
                    .into_iter()
                    .filter(|id| !indexed.contains_key(id))
                    .collect();
            }
        }
        let count = missing.len() + outdated.len();
        let import = if count > 0 {
            let ids = missing.iter().chain(outdated.iter()).cloned().collect();
            Some(self.import(ImportSource::Ids(ids), &ImportOptions::default()).await?)
        } else {
            None
        };
        event!(
            Level::INFO,
            msg = "Synced",
            target = self.key().to_string(),
            missing = missing.len(),
            outdated = outdated.len()
        );
        Ok(SyncReport {
            target: self.key().clone(),
            count,
            missing,
            outdated,
            import,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps() {
        let time = Utc.with_ymd_and_hms(2014, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2014-05-01T12:30:00Z")), Some(time));
        assert_eq!(parse_timestamp(&json!(time.timestamp_millis())), Some(time));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }
}
