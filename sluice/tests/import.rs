//! Tests importing records into indexes

use serde_json::json;
use sluice::adapters::MemoryAdapter;
use sluice::backends::BulkAction;
use sluice::test_utilities::{self, cities, cities_index};
use sluice::{
    Conf, Document, Error, ImportOptions, ImportSource, Record, Registry, is, is_empty,
};

#[tokio::test]
async fn partial_failures_are_grouped() -> Result<(), Error> {
    let adapter = MemoryAdapter::with_records([
        ("1", json!({"name": "Paris", "rating": 1})),
        ("2", json!({"name": "Madrid", "rating": "great"})),
        ("3", json!({"name": "Rome", "rating": 3})),
    ])?;
    let registry = Registry::new().with(cities_index(adapter))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let handle = sluice.type_handle("cities#city")?;
    let report = handle
        .import(ImportSource::All, &ImportOptions::default())
        .await?;
    is!(report.is_success(), false);
    is!(report.count(BulkAction::Index), 2);
    let grouped = report.errors.get(&BulkAction::Index).cloned().unwrap_or_default();
    is!(grouped.len(), 1);
    is!(grouped.values().next().cloned(), Some(vec!["2".to_owned()]));
    is!(report.failed_ids(), vec!["2".to_owned()]);
    is!(memory.document("cities", "city", "1")?.is_some(), true);
    is!(memory.document("cities", "city", "2")?.is_none(), true);
    // the strict form turns the report into an error
    match handle
        .import_strict(ImportSource::All, &ImportOptions::default())
        .await
    {
        Err(Error::ImportFailed(report)) => is!(report.failed_ids(), vec!["2".to_owned()]),
        Err(error) => return Err(error),
        Ok(report) => return Err(Error::new(format!("Import should have failed: {report:?}"))),
    }
    Ok(())
}

#[tokio::test]
async fn missing_records_are_deleted() -> Result<(), Error> {
    let adapter = cities(3)?;
    let registry = Registry::new().with(cities_index(adapter.clone()))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let handle = sluice.type_handle("cities")?;
    handle
        .import_strict(ImportSource::All, &ImportOptions::default())
        .await?;
    adapter.remove("2")?;
    let report = handle
        .import_strict(
            ImportSource::Ids(vec!["1".to_owned(), "2".to_owned()]),
            &ImportOptions::default(),
        )
        .await?;
    is!(report.count(BulkAction::Index), 1);
    is!(report.count(BulkAction::Delete), 1);
    is!(memory.document("cities", "city", "2")?.is_none(), true);
    is!(memory.document("cities", "city", "3")?.is_some(), true);
    Ok(())
}

#[tokio::test]
async fn explicit_records() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(MemoryAdapter::new()))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let handle = sluice.type_handle("cities#city")?;
    let records = vec![
        Record::Index(Document::new("10", json!({"name": "Oslo", "rating": 4}))),
        Record::Index(Document::new("11", json!({"name": "Bergen", "rating": 2}))),
        Record::Delete("12".to_owned()),
    ];
    let report = handle
        .import_strict(ImportSource::Records(records), &ImportOptions::default())
        .await?;
    is!(report.count(BulkAction::Index), 2);
    is!(report.count(BulkAction::Delete), 1);
    is!(
        memory.document("cities", "city", "10")?,
        Some(json!({"name": "Oslo", "rating": 4}))
    );
    Ok(())
}

#[tokio::test]
async fn small_batches_import_everything() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(25)?))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let before = memory.bulk_requests();
    let options = ImportOptions::default().batch_size(10).journal(false);
    let report = sluice
        .type_handle("cities#city")?
        .import_strict(ImportSource::All, &options)
        .await?;
    is!(report.count(BulkAction::Index), 25);
    is!(memory.bulk_requests() - before, 3);
    Ok(())
}

#[tokio::test]
async fn partial_updates_fail_over() -> Result<(), Error> {
    let adapter = cities(2)?;
    let registry = Registry::new().with(cities_index(adapter.clone()))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let handle = sluice.type_handle("cities#city")?;
    handle
        .import_strict(
            ImportSource::Ids(vec!["1".to_owned()]),
            &ImportOptions::default(),
        )
        .await?;
    adapter.insert("1", json!({"name": "Renamed", "country": "Spain", "rating": 1}))?;
    // 2 was never indexed so its update fails over to a full index
    let options = ImportOptions::default()
        .update_fields(["name"])
        .update_failover(true);
    let report = handle
        .import_strict(
            ImportSource::Ids(vec!["1".to_owned(), "2".to_owned()]),
            &options,
        )
        .await?;
    is!(report.count(BulkAction::Update), 1);
    is!(report.count(BulkAction::Index), 1);
    is!(
        memory.document("cities", "city", "1")?,
        Some(json!({"name": "Renamed", "country": "Spain", "rating": 1}))
    );
    is!(memory.document("cities", "city", "2")?.is_some(), true);
    // without failover the missing document is an error
    let adapter_3 = cities(3)?;
    let registry = Registry::new().with(cities_index(adapter_3))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let report = sluice
        .type_handle("cities#city")?
        .import(
            ImportSource::Ids(vec!["3".to_owned()]),
            &ImportOptions::default()
                .update_fields(["name"])
                .update_failover(false),
        )
        .await?;
    is!(report.failed_ids(), vec!["3".to_owned()]);
    is_empty!(report.counts.values().filter(|count| **count > 0).collect::<Vec<_>>());
    Ok(())
}
