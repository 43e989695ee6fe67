//! Tests managing the lifecycle of indexes

use chrono::{Duration, Utc};
use serde_json::json;
use sluice::test_utilities::{self, ChangingAdapter, cities, cities_index};
use sluice::{
    Conf, Error, ImportOptions, IndexDefinition, Registry, ResetOptions, TypeDefinition, is,
    is_empty, is_in,
};

#[tokio::test]
async fn create_and_delete() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let index = sluice.index("cities")?;
    is!(index.exists().await?, false);
    is!(index.create(None, true).await?, true);
    is!(index.exists().await?, true);
    // creating it again is rejected
    is!(index.create(None, true).await?, false);
    is!(
        memory.settings("cities")?,
        json!({"index": {"number_of_shards": 1}})
    );
    is!(index.delete(None).await?, true);
    is!(index.delete(None).await?, false);
    match index.delete_strict(None).await {
        Err(error) => is!(error.is_index_missing(), true),
        Ok(()) => return Err(Error::new("Deleted a missing index")),
    }
    Ok(())
}

#[tokio::test]
async fn versions_are_aliased() -> Result<(), Error> {
    let mut conf = Conf::default();
    conf.prefix = "test".to_owned();
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (sluice, memory) = test_utilities::memory_sluice(conf, registry);
    let index = sluice.index("cities")?;
    index.create_strict(Some("2014"), true).await?;
    is!(index.exists().await?, true);
    is!(index.indexes().await?, vec!["test_cities_2014".to_owned()]);
    is!(memory.index_names()?, vec!["test_cities_2014".to_owned()]);
    // deleting the base name deletes every version
    index.delete_strict(None).await?;
    is_empty!(memory.index_names()?);
    Ok(())
}

#[tokio::test]
async fn reset_in_place() -> Result<(), Error> {
    let adapter = cities(3)?;
    let registry = Registry::new().with(cities_index(adapter.clone()))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let index = sluice.index("cities")?;
    let report = index.reset(None, &ResetOptions::default()).await?;
    is!(report.is_success(), true);
    is!(report.index, "cities");
    is!(index.query().count().await?, 3);
    // purging drops documents whose records are gone
    adapter.remove("3")?;
    index.reset(None, &ResetOptions::default()).await?;
    is!(index.query().count().await?, 2);
    Ok(())
}

#[tokio::test]
async fn reset_swaps_versions() -> Result<(), Error> {
    let adapter = cities(4)?;
    let registry = Registry::new().with(cities_index(adapter.clone()))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let index = sluice.index("cities")?;
    let first = index.reset(Some("v1"), &ResetOptions::default()).await?;
    is!(first.index, "cities_v1");
    is_empty!(first.replaced);
    is!(index.indexes().await?, vec!["cities_v1".to_owned()]);
    adapter.insert("5", json!({"name": "City 5", "country": "Spain", "rating": 5}))?;
    let options = ResetOptions {
        disable_refresh_interval: Some(true),
        ..ResetOptions::default()
    };
    let second = index.reset(Some("v2"), &options).await?;
    is!(second.index, "cities_v2");
    is!(second.replaced, vec!["cities_v1".to_owned()]);
    let replayed = second.journal.as_ref().map(|journal| journal.entries);
    is!(replayed, Some(0));
    is!(index.indexes().await?, vec!["cities_v2".to_owned()]);
    is_in!(memory.index_names()?, "cities_v2".to_owned());
    is!(memory.index_names()?.contains(&"cities_v1".to_owned()), false);
    // loading settings are restored once the import finishes
    is!(
        memory.settings("cities")?["index"]["refresh_interval"],
        json!("1s")
    );
    // the alias now serves the new version
    let query = index.query();
    is!(query.count().await?, 5);
    let typed = query.typed_hits().await?;
    is!(typed.len(), 5);
    for (key, hit) in &typed {
        is!(key.to_string(), "cities#city");
        is!(hit.index, "cities_v2");
    }
    Ok(())
}

#[tokio::test]
async fn reset_replays_changes_made_while_importing() -> Result<(), Error> {
    let changing = ChangingAdapter::new(cities(3)?, "cities", "city", 1, Utc::now() + Duration::seconds(60));
    let index = IndexDefinition::new("cities").with_type(
        TypeDefinition::new("city", changing.clone()).field("name", json!({"type": "keyword"})),
    );
    let registry = Registry::new().with(index)?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    let index = sluice.index("cities")?;
    index.reset(Some("v1"), &ResetOptions::default()).await?;
    // records only start changing once the adapter can journal them
    is!(changing.remaining(), 1);
    let _ = changing.sluice.set(sluice.clone());
    let report = index.reset(Some("v2"), &ResetOptions::default()).await?;
    is!(changing.remaining(), 0);
    // the change made during the import was replayed into the new version
    let replayed = report.journal.as_ref().map(|journal| journal.entries);
    is!(replayed, Some(1));
    let city = memory.document("cities_v2", "city", "1")?.unwrap_or_default();
    is!(city["name"], json!("Changed 1"));
    is!(index.query().count().await?, 3);
    Ok(())
}

#[tokio::test]
async fn specification_tracks_changes() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let specification = sluice.index("cities")?.specification();
    is!(specification.stored().await?.is_none(), true);
    is!(specification.changed().await?, true);
    specification.lock().await?;
    is!(specification.stored().await?, Some(specification.current()));
    is!(specification.changed().await?, false);
    // a different definition under the same name counts as a change
    let changed = cities_index(cities(1)?).settings(json!({"index": {"number_of_shards": 2}}));
    let registry = Registry::new().with(changed)?;
    let other = sluice::Sluice::from_parts(Conf::default(), sluice.backend.clone(), registry);
    is!(other.index("cities")?.specification().changed().await?, true);
    Ok(())
}

#[tokio::test]
async fn resets_lock_the_specification() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(2)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let index = sluice.index("cities")?;
    index.reset(Some("1"), &ResetOptions::default()).await?;
    is!(index.specification().changed().await?, false);
    Ok(())
}

#[tokio::test]
async fn import_into_missing_index_creates_it() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(2)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let index = sluice.index("cities")?;
    let reports = index.import_strict(&ImportOptions::default()).await?;
    is!(reports.len(), 1);
    is!(index.exists().await?, true);
    is!(index.query().count().await?, 2);
    Ok(())
}
