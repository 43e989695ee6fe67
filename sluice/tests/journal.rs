//! Tests recording and replaying changes through the journal

use chrono::{Duration, Utc};
use serde_json::json;
use sluice::backends::BulkAction;
use sluice::test_utilities::{self, ChangingAdapter, cities, cities_index, places_index};
use sluice::{
    Conf, Error, ImportOptions, ImportSource, IndexDefinition, JournalEntry, Registry,
    TypeDefinition, is, is_empty,
};

/// Build a journal entry
///
/// # Arguments
///
/// * `index` - The index that changed
/// * `type_name` - The type that changed
/// * `ids` - The ids that changed
/// * `created_at` - When the change was made
fn entry(index: &str, type_name: &str, ids: &[&str], created_at: chrono::DateTime<Utc>) -> JournalEntry {
    JournalEntry {
        index_name: index.to_owned(),
        type_name: type_name.to_owned(),
        action: BulkAction::Index,
        references: ids.iter().map(|id| (*id).to_owned()).collect(),
        created_at,
    }
}

/// Build a client whose cities change while they are loaded
///
/// # Arguments
///
/// * `changes` - The number of changes to make while loading
/// * `start` - When the first change is journaled
fn changing_client(
    changes: usize,
    start: chrono::DateTime<Utc>,
) -> Result<(sluice::Sluice, std::sync::Arc<sluice::backends::Memory>, ChangingAdapter), Error> {
    let changing = ChangingAdapter::new(cities(3)?, "cities", "city", changes, start);
    let index = IndexDefinition::new("cities").with_type(
        TypeDefinition::new("city", changing.clone()).field("name", json!({"type": "keyword"})),
    );
    let registry = Registry::new().with(index)?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let _ = changing.sluice.set(sluice.clone());
    Ok((sluice, memory, changing))
}

#[tokio::test]
async fn apply_follows_entries_made_while_applying() -> Result<(), Error> {
    let start = Utc::now() - Duration::seconds(100);
    let (sluice, memory, changing) = changing_client(3, start + Duration::seconds(1))?;
    let journal = sluice.journal();
    journal.write(&[entry("cities", "city", &["1"], start)]).await?;
    let report = journal
        .apply::<&str>(start - Duration::milliseconds(1), Some(10), &[])
        .await?;
    // each change made while replaying takes another stage
    is!(report.stages, 4);
    is!(report.entries, 4);
    is!(report.exhausted, false);
    is_empty!(report.failures);
    is!(changing.remaining(), 0);
    let city = memory.document("cities", "city", "1")?.unwrap_or_default();
    is!(city["name"], json!("Changed 1"));
    Ok(())
}

#[tokio::test]
async fn apply_runs_out_of_retries() -> Result<(), Error> {
    let start = Utc::now() - Duration::seconds(100);
    let (sluice, _, changing) = changing_client(3, start + Duration::seconds(1))?;
    let journal = sluice.journal();
    journal.write(&[entry("cities", "city", &["1"], start)]).await?;
    // no retries means a single stage
    let report = journal
        .apply::<&str>(start - Duration::milliseconds(1), Some(0), &[])
        .await?;
    is!(report.stages, 1);
    is!(report.entries, 1);
    is!(report.exhausted, true);
    is!(changing.remaining(), 2);
    // picking up where we left off uses the retries it is given
    let report = journal
        .apply::<&str>(start + Duration::milliseconds(500), Some(1), &[])
        .await?;
    is!(report.stages, 2);
    is!(report.exhausted, true);
    is!(changing.remaining(), 0);
    Ok(())
}

#[tokio::test]
async fn apply_replays_only_journaled_ids() -> Result<(), Error> {
    let registry = Registry::new()
        .with(cities_index(cities(5)?))?
        .with(places_index(cities(2)?, cities(2)?))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let journal = sluice.journal();
    let created = Utc::now();
    journal
        .write(&[entry("cities", "city", &["1", "2", "3"], created)])
        .await?;
    let report = journal
        .apply::<&str>(created - Duration::milliseconds(1), None, &[])
        .await?;
    is!(report.entries, 1);
    is!(report.stages, 1);
    is!(report.exhausted, false);
    is_empty!(report.failures);
    for id in ["1", "2", "3"] {
        is!(memory.document("cities", "city", id)?.is_some(), true);
    }
    for id in ["4", "5"] {
        is!(memory.document("cities", "city", id)?.is_none(), true);
    }
    // no other type was touched
    is!(sluice.index("places")?.exists().await?, false);
    // replayed imports are not journaled again
    is!(journal.entries::<&str>(None, &[]).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn entries_are_filtered() -> Result<(), Error> {
    let registry = Registry::new()
        .with(cities_index(cities(1)?))?
        .with(places_index(cities(1)?, cities(1)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let journal = sluice.journal();
    let start = Utc::now() - Duration::seconds(10);
    journal
        .write(&[
            entry("cities", "city", &["1"], start),
            entry("places", "city", &["2"], start + Duration::seconds(1)),
            entry("places", "country", &["3"], start + Duration::seconds(2)),
        ])
        .await?;
    is!(journal.entries::<&str>(None, &[]).await?.len(), 3);
    // entries come back oldest first
    let after = journal.entries::<&str>(Some(start), &[]).await?;
    let refs = after
        .iter()
        .map(|entry| entry.references.clone())
        .collect::<Vec<Vec<String>>>();
    is!(refs, vec![vec!["2".to_owned()], vec!["3".to_owned()]]);
    is!(journal.entries(None, &["places"]).await?.len(), 2);
    is!(journal.entries(None, &["places#country", "cities"]).await?.len(), 2);
    // cleaning removes entries up to a time
    is!(journal.clean(Some(start + Duration::seconds(1)), &["places"]).await?, 1);
    is!(journal.entries::<&str>(None, &[]).await?.len(), 2);
    is!(journal.clean::<&str>(None, &[]).await?, 2);
    is_empty!(journal.entries::<&str>(None, &[]).await?);
    Ok(())
}

#[tokio::test]
async fn imports_are_journaled() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(3)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let handle = sluice.type_handle("cities#city")?;
    let before = Utc::now() - Duration::seconds(1);
    handle
        .import_strict(
            ImportSource::Ids(vec!["1".to_owned(), "2".to_owned()]),
            &ImportOptions::default().journal(true),
        )
        .await?;
    let entries = sluice.journal().entries::<&str>(Some(before), &[]).await?;
    is!(entries.len(), 1);
    is!(entries[0].key().to_string(), "cities#city");
    is!(entries[0].action, BulkAction::Index);
    is!(entries[0].references, vec!["1".to_owned(), "2".to_owned()]);
    // unjournaled imports leave no entries
    handle
        .import_strict(ImportSource::All, &ImportOptions::default())
        .await?;
    is!(sluice.journal().entries::<&str>(None, &[]).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn nothing_to_apply() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let report = sluice
        .journal()
        .apply::<&str>(Utc::now(), Some(3), &[])
        .await?;
    is!(report.entries, 0);
    is!(report.stages, 0);
    is!(sluice.journal().clean::<&str>(None, &[]).await?, 0);
    Ok(())
}
