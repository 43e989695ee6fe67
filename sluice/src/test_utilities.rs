//! Helpers for testing code built on sluice

use chrono::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::adapters::MemoryAdapter;
use crate::backends::{BulkAction, Memory};
use crate::conf::Conf;
use crate::journal::JournalEntry;
use crate::registry::{Adapter, Document, IndexDefinition, Registry, TypeDefinition};
use crate::{Error, Sluice};

#[macro_export]
macro_rules! is {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err($crate::Error::new(format!(
                "Failed == check because the value {:#?} != {:#?}",
                $left, $right
            )));
        }
    };
    ($left:expr, $right:expr, $msg:expr) => {
        if $left != $right {
            return Err($crate::Error::new(format!(
                "Failed == check because {:#?} != {:#?}: Check '{}'",
                $left, $right, $msg
            )));
        }
    };
}

#[macro_export]
macro_rules! is_not {
    ($left:expr, $right:expr) => {
        if $left == $right {
            return Err($crate::Error::new(format!(
                "Failed != check {:#?} == {:#?}",
                $left, $right
            )));
        }
    };
}

#[macro_export]
macro_rules! is_in {
    ($list:expr, $item:expr) => {
        if !$list.iter().any(|x| *x == $item) {
            return Err($crate::Error::new(format!(
                "Failed is_in check because {:#?} is not in {:#?}",
                $item, $list
            )));
        }
    };
}

#[macro_export]
macro_rules! is_empty {
    ($val:expr) => {
        if !$val.is_empty() {
            return Err($crate::Error::new(format!(
                "Failed is_empty check because it contains: {:#?}",
                $val
            )));
        }
    };
}

#[macro_export]
macro_rules! contains {
    ($val:expr, $pattern:expr) => {
        if !$val.contains($pattern) {
            return Err($crate::Error::new(format!(
                "Failed contains check because {:#?} is not in {:#?}",
                $pattern, $val
            )));
        }
    };
}

/// Build a client backed by an in memory search service
///
/// # Arguments
///
/// * `conf` - The config to use
/// * `registry` - The indexes to manage
pub fn memory_sluice(conf: Conf, registry: Registry) -> (Sluice, Arc<Memory>) {
    let memory = Arc::new(Memory::new());
    let sluice = Sluice::from_parts(conf, memory.clone(), registry);
    (sluice, memory)
}

/// Build a `cities` index with a single `city` type
///
/// # Arguments
///
/// * `cities` - Where city records come from
pub fn cities_index(cities: MemoryAdapter) -> IndexDefinition {
    IndexDefinition::new("cities")
        .settings(json!({"index": {"number_of_shards": 1}}))
        .with_type(
            TypeDefinition::new("city", cities)
                .field("name", json!({"type": "keyword"}))
                .field("country", json!({"type": "keyword"}))
                .field("rating", json!({"type": "integer"}))
                .field("updated_at", json!({"type": "date"})),
        )
}

/// Build a `places` index with `city` and `country` types
///
/// # Arguments
///
/// * `cities` - Where city records come from
/// * `countries` - Where country records come from
pub fn places_index(cities: MemoryAdapter, countries: MemoryAdapter) -> IndexDefinition {
    IndexDefinition::new("places")
        .with_type(
            TypeDefinition::new("city", cities)
                .field("name", json!({"type": "keyword"}))
                .field("rating", json!({"type": "integer"})),
        )
        .with_type(
            TypeDefinition::new("country", countries)
                .field("name", json!({"type": "keyword"}))
                .field("population", json!({"type": "long"})),
        )
}

/// Build city records with ids from 1 up to a count
///
/// # Arguments
///
/// * `count` - The number of cities to build
pub fn cities(count: usize) -> Result<MemoryAdapter, Error> {
    MemoryAdapter::with_records((1..=count).map(|id| {
        let country = if id % 2 == 0 { "France" } else { "Spain" };
        (
            id.to_string(),
            json!({"name": format!("City {id}"), "country": country, "rating": id}),
        )
    }))
}

/// An adapter whose records keep changing while they are loaded
///
/// Every load changes one more record and journals that change until the
/// configured number of changes runs out. Journal entries are stamped one
/// second apart starting from a set time.
#[derive(Clone)]
pub struct ChangingAdapter {
    /// The records to load
    pub records: MemoryAdapter,
    /// The client to journal changes with once it is built
    pub sluice: Arc<OnceLock<Sluice>>,
    /// The `index#type` these records are for
    target: (String, String),
    /// The number of changes left to make
    remaining: Arc<AtomicUsize>,
    /// When the next change is journaled
    clock: Arc<Mutex<DateTime<Utc>>>,
}

impl ChangingAdapter {
    /// Create a new changing adapter
    ///
    /// # Arguments
    ///
    /// * `records` - The records to load and change
    /// * `index` - The index these records are in
    /// * `type_name` - The type these records are
    /// * `changes` - The number of changes to make
    /// * `start` - When the first change is journaled
    pub fn new(
        records: MemoryAdapter,
        index: &str,
        type_name: &str,
        changes: usize,
        start: DateTime<Utc>,
    ) -> Self {
        ChangingAdapter {
            records,
            sluice: Arc::new(OnceLock::new()),
            target: (index.to_owned(), type_name.to_owned()),
            remaining: Arc::new(AtomicUsize::new(changes)),
            clock: Arc::new(Mutex::new(start)),
        }
    }

    /// Get the number of changes left to make
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Change the first record we loaded and journal it
    ///
    /// # Arguments
    ///
    /// * `loaded` - The documents that were just loaded
    async fn change(&self, loaded: &[Document]) -> Result<(), Error> {
        let Some(sluice) = self.sluice.get() else {
            return Ok(());
        };
        let Some(first) = loaded.first() else {
            return Ok(());
        };
        let left = self.remaining();
        if left == 0 {
            return Ok(());
        }
        self.remaining.store(left - 1, Ordering::SeqCst);
        let mut source = first.source.clone();
        source["name"] = json!(format!("Changed {left}"));
        self.records.insert(first.id.clone(), source)?;
        let created_at = {
            let mut clock = self
                .clock
                .lock()
                .map_err(|_| Error::new("Changing adapter clock is poisoned"))?;
            let created_at = *clock;
            *clock = created_at + chrono::Duration::seconds(1);
            created_at
        };
        let entry = JournalEntry {
            index_name: self.target.0.clone(),
            type_name: self.target.1.clone(),
            action: BulkAction::Index,
            references: vec![first.id.clone()],
            created_at,
        };
        sluice.journal().write(&[entry]).await
    }
}

#[async_trait::async_trait]
impl Adapter for ChangingAdapter {
    async fn ids(&self) -> Result<Vec<String>, Error> {
        self.records.ids().await
    }

    async fn load(&self, ids: &[String]) -> Result<Vec<Document>, Error> {
        let loaded = self.records.load(ids).await?;
        self.change(&loaded).await?;
        Ok(loaded)
    }
}
