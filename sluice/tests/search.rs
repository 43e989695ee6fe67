//! Tests querying indexes through the memory backend

use futures::TryStreamExt;
use serde_json::{Value, json};
use sluice::adapters::MemoryAdapter;
use sluice::search::Hit;
use sluice::test_utilities::{self, cities, cities_index, places_index};
use sluice::{Conf, Error, FilterMode, ImportOptions, Registry, is, is_empty, is_in};

/// Build a client with a loaded `cities` index
///
/// # Arguments
///
/// * `count` - The number of cities to load
async fn loaded(count: usize) -> Result<(sluice::Sluice, std::sync::Arc<sluice::backends::Memory>), Error> {
    let registry = Registry::new().with(cities_index(cities(count)?))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    sluice
        .index("cities")?
        .import_strict(&ImportOptions::default().refresh(true))
        .await?;
    Ok((sluice, memory))
}

#[tokio::test]
async fn none_never_searches() -> Result<(), Error> {
    let (sluice, memory) = loaded(3).await?;
    let before = memory.searches();
    let query = sluice
        .query(&["cities"])?
        .none()
        .filter(json!({"term": {"country": "Spain"}}))
        .limit(5);
    is!(query.is_none(), true);
    is_empty!(query.to_vec().await?);
    is!(query.total().await?, 0);
    is!(query.count().await?, 0);
    is!(memory.searches(), before);
    Ok(())
}

#[tokio::test]
async fn disjoint_types_never_search() -> Result<(), Error> {
    let (sluice, memory) = loaded(3).await?;
    let before = memory.searches();
    let query = sluice.query(&["cities#city"])?.types(["country"]);
    is!(query.is_none(), true);
    is_empty!(query.ids().await?);
    is!(memory.searches(), before);
    Ok(())
}

#[tokio::test]
async fn merge_is_commutative() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let query = sluice.query(&["cities"])?;
    let left = query.filter(json!({"term": {"name": "Johny"}}));
    let right = query.filter(json!({"range": {"age": {"lte": 42}}}));
    // pull the joined filters out of each merged body
    let filters = |body: Value| -> Vec<Value> {
        body["query"]["bool"]["filter"]["bool"]["filter"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    };
    let forward = filters(left.merge(&right).request().body);
    let backward = filters(right.merge(&left).request().body);
    is!(forward.len(), 2);
    is!(backward.len(), 2);
    for filter in &forward {
        is_in!(backward, *filter);
    }
    Ok(())
}

#[tokio::test]
async fn filter_modes() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let name = json!({"term": {"name": "Johny"}});
    let age = json!({"range": {"age": {"lte": 42}}});
    let query = sluice
        .query(&["cities"])?
        .filter(name.clone())
        .filter(age.clone());
    is!(
        query.request().body["query"]["bool"]["filter"],
        json!({"bool": {"filter": [name.clone(), age.clone()]}})
    );
    let query = query.filter_mode(FilterMode::Or);
    is!(
        query.request().body["query"]["bool"]["filter"],
        json!({"bool": {"should": [name, age], "minimum_should_match": 1}})
    );
    Ok(())
}

#[tokio::test]
async fn pagination() -> Result<(), Error> {
    let (sluice, _) = loaded(250).await?;
    let query = sluice.query(&["cities"])?;
    let page = query.limit(100).offset(300);
    is!(page.request().body["size"], json!(100));
    is!(page.request().body["from"], json!(300));
    // the default page size only returns some hits
    is!(query.ids().await?.len(), 10);
    is!(query.total().await?, 250);
    let unlimited = query.unlimited().await?;
    is!(unlimited.criteria().size(), Some(250));
    is!(unlimited.ids().await?.len(), 250);
    Ok(())
}

#[tokio::test]
async fn filters_and_orders() -> Result<(), Error> {
    let (sluice, _) = loaded(5).await?;
    let query = sluice
        .query(&["cities"])?
        .filter(json!({"term": {"country": "Spain"}}))
        .order(json!({"rating": "desc"}));
    is!(query.ids().await?, vec!["5", "3", "1"]);
    is!(query.count().await?, 3);
    is!(query.is_loaded(), true);
    let names = query
        .only(["name"])
        .to_vec()
        .await?
        .into_iter()
        .map(|source| source["name"].clone())
        .collect::<Vec<Value>>();
    is!(names, vec![json!("City 5"), json!("City 3"), json!("City 1")]);
    Ok(())
}

#[tokio::test]
async fn aggregations() -> Result<(), Error> {
    let (sluice, _) = loaded(5).await?;
    let query = sluice
        .query(&["cities"])?
        .aggregations(json!({"countries": {"terms": {"field": "country"}}}))
        .limit(0);
    let countries = query.aggregation("countries").await?.unwrap_or_default();
    is!(
        countries["buckets"],
        json!([
            {"key": "Spain", "doc_count": 3},
            {"key": "France", "doc_count": 2},
        ])
    );
    is!(query.aggregation("missing").await?.is_none(), true);
    let results = query.aggregation_results().await?;
    is!(results.len(), 1);
    is!(results.contains_key("countries"), true);
    Ok(())
}

#[tokio::test]
async fn missing_indexes_are_empty() -> Result<(), Error> {
    let registry = Registry::new().with(cities_index(cities(3)?))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    let query = sluice.query(&["cities"])?;
    is_empty!(query.hits().await?);
    is!(query.exists().await?, false);
    is!(query.count().await?, 0);
    is!(query.delete_all().await?, 0);
    Ok(())
}

#[tokio::test]
async fn find_by_id() -> Result<(), Error> {
    let (sluice, _) = loaded(5).await?;
    let query = sluice.query(&["cities"])?;
    let found = query.find(&["2", "4", "9"]).await?;
    let mut ids = found.iter().map(|hit| hit.id.clone()).collect::<Vec<String>>();
    ids.sort();
    is!(ids, vec!["2", "4"]);
    for hit in &found {
        is!(hit.type_name, "city");
    }
    match query.find(&["8", "9"]).await {
        Err(Error::DocumentNotFound(ids)) => is!(ids, vec!["8", "9"]),
        Err(error) => return Err(error),
        Ok(hits) => return Err(Error::new(format!("Found missing documents: {hits:?}"))),
    }
    Ok(())
}

#[tokio::test]
async fn delete_matching() -> Result<(), Error> {
    let (sluice, _) = loaded(5).await?;
    let query = sluice.query(&["cities"])?;
    let deleted = query
        .filter(json!({"term": {"country": "France"}}))
        .delete_all()
        .await?;
    is!(deleted, 2);
    is!(query.count().await?, 3);
    Ok(())
}

#[tokio::test]
async fn typed_hits_across_types() -> Result<(), Error> {
    let countries = MemoryAdapter::with_records([
        ("fr", json!({"name": "France", "population": 68_000_000})),
        ("es", json!({"name": "Spain", "population": 48_000_000})),
    ])?;
    let registry = Registry::new().with(places_index(cities(2)?, countries))?;
    let (sluice, _) = test_utilities::memory_sluice(Conf::default(), registry);
    sluice
        .index("places")?
        .import_strict(&ImportOptions::default().refresh(true))
        .await?;
    let query = sluice.query(&["places"])?;
    let typed = query.typed_hits().await?;
    is!(typed.len(), 4);
    let countries = typed
        .iter()
        .filter(|(key, _)| key.type_name == "country")
        .count();
    is!(countries, 2);
    // restricting to one type only returns that type
    let query = sluice.query(&["places#country"])?;
    let mut ids = query.ids().await?;
    ids.sort();
    is!(ids, vec!["es", "fr"]);
    let query = sluice.query(&["places"])?.types(["city"]);
    is!(query.count().await?, 2);
    Ok(())
}

#[tokio::test]
async fn service_errors_surface() -> Result<(), Error> {
    let (sluice, _) = loaded(1).await?;
    let query = sluice.query(&["cities"])?.query(json!({"bogus": {}}));
    match query.hits().await {
        Err(error) => is!(error.status(), Some(400)),
        Ok(hits) => return Err(Error::new(format!("Bogus query returned {hits:?}"))),
    }
    Ok(())
}

/// Build a client with loaded `cities` and `places` indexes
///
/// Places cities and countries share the ids `1` and `2`.
async fn loaded_places() -> Result<(sluice::Sluice, std::sync::Arc<sluice::backends::Memory>), Error> {
    let countries = MemoryAdapter::with_records([
        ("1", json!({"name": "France", "population": 68_000_000})),
        ("2", json!({"name": "Spain", "population": 48_000_000})),
    ])?;
    let registry = Registry::new()
        .with(cities_index(cities(3)?))?
        .with(places_index(cities(2)?, countries))?;
    let (sluice, memory) = test_utilities::memory_sluice(Conf::default(), registry);
    for index in ["cities", "places"] {
        sluice
            .index(index)?
            .import_strict(&ImportOptions::default().refresh(true))
            .await?;
    }
    Ok((sluice, memory))
}

#[tokio::test]
async fn mixed_targets_keep_types_with_their_index() -> Result<(), Error> {
    let (sluice, _) = loaded_places().await?;
    let query = sluice.query(&["places#country", "cities"])?;
    let typed = query.typed_hits().await?;
    is!(typed.len(), 5);
    for (key, _) in &typed {
        is_in!(["places#country", "cities#city"], key.to_string().as_str());
    }
    is!(query.count().await?, 5);
    // types only narrow the indexes they belong to
    let narrowed = sluice.query(&["places#country", "cities"])?.types(["city"]);
    let typed = narrowed.typed_hits().await?;
    is!(typed.len(), 3);
    for (key, _) in &typed {
        is!(key.to_string(), "cities#city");
    }
    Ok(())
}

#[tokio::test]
async fn types_share_record_ids() -> Result<(), Error> {
    let (sluice, memory) = loaded_places().await?;
    is!(sluice.query(&["places"])?.count().await?, 4);
    let city = memory.document("places", "city", "1")?.unwrap_or_default();
    let country = memory.document("places", "country", "1")?.unwrap_or_default();
    is!(city["name"], json!("City 1"));
    is!(country["name"], json!("France"));
    // finding an id in every type returns one hit per type
    let found = sluice.query(&["places"])?.find(&["1"]).await?;
    let mut types = found.iter().map(|hit| hit.type_name.clone()).collect::<Vec<String>>();
    types.sort();
    is!(types, vec!["city", "country"]);
    for hit in &found {
        is!(hit.id, "1");
    }
    // deleting a country leaves the city with the same id alone
    let deleted = sluice
        .query(&["places#country"])?
        .filter_ids(&["1"])
        .delete_all()
        .await?;
    is!(deleted, 1);
    is!(memory.document("places", "country", "1")?.is_none(), true);
    is!(memory.document("places", "city", "1")?.is_some(), true);
    Ok(())
}

#[tokio::test]
async fn scrolls_in_batches() -> Result<(), Error> {
    let (sluice, memory) = loaded(25).await?;
    let query = sluice.query(&["cities"])?.order(json!("rating"));
    let batches = query.scroll_batches(10).try_collect::<Vec<Vec<Hit>>>().await?;
    let sizes = batches.iter().map(Vec::len).collect::<Vec<usize>>();
    is!(sizes, vec![10, 10, 5]);
    is!(batches[2][4].id, "25");
    is!(memory.open_scrolls()?, 0);
    // offsets are ignored but limits are kept
    is!(query.offset(5).scroll_hits(10).await?.len(), 25);
    let limited = query.limit(12).scroll_hits(7).await?;
    is!(limited.len(), 12);
    is!(limited[11].id, "12");
    is!(memory.open_scrolls()?, 0);
    // scrolling an index that does not exist finds nothing
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (empty, _) = test_utilities::memory_sluice(Conf::default(), registry);
    is_empty!(empty.query(&["cities"])?.scroll_hits(10).await?);
    Ok(())
}

#[tokio::test]
async fn scrolls_past_the_default_page() -> Result<(), Error> {
    let (sluice, _) = loaded(30).await?;
    let query = sluice.query(&["cities"])?;
    is!(query.ids().await?.len(), 10);
    is!(query.scroll_hits(1000).await?.len(), 30);
    is!(query.none().scroll_hits(1000).await?.len(), 0);
    Ok(())
}

#[tokio::test]
async fn pluck_fields() -> Result<(), Error> {
    let (sluice, _) = loaded(3).await?;
    let query = sluice.query(&["cities"])?.order(json!("rating"));
    let plucked = query.pluck(&["_id", "name"]).await?;
    is!(
        plucked,
        vec![
            vec![json!("1"), json!("City 1")],
            vec![json!("2"), json!("City 2")],
            vec![json!("3"), json!("City 3")],
        ]
    );
    // limits are respected and hit fields need no source
    let plucked = query.limit(1).pluck(&["_type", "_index"]).await?;
    is!(plucked, vec![vec![json!("city"), json!("cities")]]);
    Ok(())
}

#[tokio::test]
async fn first_hit() -> Result<(), Error> {
    let (sluice, memory) = loaded(3).await?;
    let query = sluice.query(&["cities"])?.order(json!({"rating": "desc"}));
    let first = query.first().await?.map(|hit| hit.id);
    is!(first, Some("3".to_owned()));
    // a loaded query answers from its response
    query.hits().await?;
    let before = memory.searches();
    let first = query.first().await?.map(|hit| hit.id);
    is!(first, Some("3".to_owned()));
    is!(memory.searches(), before);
    // a loaded page without hits has to search again
    let empty = query.limit(0);
    is!(empty.total().await?, 3);
    let first = empty.first().await?.map(|hit| hit.id);
    is!(first, Some("3".to_owned()));
    let nothing = query.filter(json!({"term": {"country": "Italy"}}));
    is!(nothing.first().await?.is_none(), true);
    Ok(())
}

#[tokio::test]
async fn search_after_pages() -> Result<(), Error> {
    let (sluice, _) = loaded(5).await?;
    let query = sluice.query(&["cities"])?.order(json!("rating")).limit(2);
    let page = query.hits().await?;
    is!(page.iter().map(|hit| hit.id.as_str()).collect::<Vec<&str>>(), vec!["1", "2"]);
    let last = page.last().map(|hit| hit.sort.clone()).unwrap_or_default();
    is!(last, vec![json!(2)]);
    let next = query.search_after(last).ids().await?;
    is!(next, vec!["3", "4"]);
    Ok(())
}

#[tokio::test]
async fn exclude_source_fields() -> Result<(), Error> {
    let (sluice, _) = loaded(1).await?;
    let query = sluice.query(&["cities"])?;
    let sources = query.exclude(["country"]).to_vec().await?;
    is!(sources, vec![json!({"name": "City 1", "rating": 1})]);
    let sources = query.only(["name", "country"]).exclude(["country"]).to_vec().await?;
    is!(sources, vec![json!({"name": "City 1"})]);
    let sources = query.no_source().to_vec().await?;
    is!(sources, vec![Value::Null]);
    Ok(())
}

#[tokio::test]
async fn combine_queries() -> Result<(), Error> {
    let (sluice, _) = loaded(5).await?;
    let query = sluice.query(&["cities"])?.order(json!("rating"));
    let spanish = query.filter(json!({"term": {"country": "Spain"}}));
    let top = query.filter(json!({"range": {"rating": {"gte": 3}}}));
    is!(spanish.and(&top).ids().await?, vec!["3", "5"]);
    is!(spanish.or(&top).ids().await?, vec!["1", "3", "4", "5"]);
    is!(spanish.not(&top).ids().await?, vec!["1"]);
    // combining with a query that matches nothing
    is!(spanish.or(&query.none()).ids().await?, vec!["1", "3", "5"]);
    is!(spanish.and(&query.none()).is_none(), true);
    Ok(())
}
