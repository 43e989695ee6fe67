//! Build and lazily execute searches against registered indexes

use futures::{Stream, TryStreamExt, stream};
use itertools::Itertools;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{Level, event, instrument};

mod criteria;
mod modes;
mod response;

pub use criteria::{CompiledSearch, Criteria, CriteriaModes, SearchOptions};
pub use modes::{FilterMode, QueryMode, RawMode};
pub use response::{Hit, Hits, HitsTotal, SearchResponse};

use crate::backends::{Backend, SearchRequest, TypeScope, document_id};
use crate::registry::TypeKey;
use crate::{Error, Sluice};

/// The number of hits fetched in each batch when plucking every document
const PLUCK_BATCH_SIZE: u64 = 10_000;

/// Get a field from a hit for `pluck`
///
/// # Arguments
///
/// * `hit` - The hit to get a field from
/// * `field` - The field to get
fn pluck_field(hit: &Hit, field: &str) -> Value {
    match field {
        "_id" => json!(hit.id),
        "_index" => json!(hit.index),
        "_type" => json!(hit.type_name),
        _ => hit.source.get(field).cloned().unwrap_or(Value::Null),
    }
}

/// Where a scroll through a query's hits is
enum ScrollState {
    /// The scroll has not been opened yet
    Start(SearchRequest),
    /// The scroll is open
    Next(String),
    /// Every batch was returned
    Done,
}

/// A scroll through a query's hits
struct Scroll {
    /// The search service to scroll with
    backend: Arc<dyn Backend>,
    /// How long to keep the scroll alive between batches
    keep_alive: String,
    /// The number of hits in each batch
    batch_size: u64,
    /// The number of hits left to return if this query was limited
    remaining: Option<u64>,
    /// Where this scroll is
    state: ScrollState,
}

impl Scroll {
    /// Get the next batch of hits
    async fn next_batch(mut self) -> Result<Option<(Vec<Hit>, Scroll)>, Error> {
        let response = match std::mem::replace(&mut self.state, ScrollState::Done) {
            ScrollState::Done => return Ok(None),
            ScrollState::Start(request) => {
                match self.backend.scroll_start(&request, &self.keep_alive).await {
                    Ok(response) => response,
                    // scrolling a missing index finds nothing
                    Err(error) if error.is_index_missing() => return Ok(None),
                    Err(error) => return Err(error),
                }
            }
            ScrollState::Next(scroll_id) => {
                self.backend.scroll_next(&scroll_id, &self.keep_alive).await?
            }
        };
        let mut hits = response.hits.hits;
        let fetched = hits.len() as u64;
        if let Some(remaining) = self.remaining.as_mut() {
            hits.truncate(*remaining as usize);
            *remaining -= hits.len() as u64;
        }
        let finished = fetched < self.batch_size || self.remaining == Some(0);
        if let Some(scroll_id) = response.scroll_id {
            if finished {
                self.backend.clear_scroll(&scroll_id).await?;
            } else {
                self.state = ScrollState::Next(scroll_id);
            }
        }
        if hits.is_empty() {
            return Ok(None);
        }
        Ok(Some((hits, self)))
    }
}

/// A search against some indexes that runs the first time its results are needed
///
/// Every builder method returns a new query with its own cached response.
#[derive(Clone)]
pub struct Query {
    /// The sluice client to search with
    sluice: Sluice,
    /// The base names of the indexes to search
    indexes: Vec<String>,
    /// The types this query is restricted to if any
    roots: Vec<TypeKey>,
    /// The accumulated search
    criteria: Criteria,
    /// The cached response for this search
    response: Arc<OnceCell<SearchResponse>>,
}

impl Query {
    /// Create a new query
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to search with
    /// * `indexes` - The base names of the indexes to search
    /// * `roots` - The types to restrict this query to or nothing for every type
    pub(crate) fn new(sluice: Sluice, indexes: Vec<String>, roots: Vec<TypeKey>) -> Self {
        Query {
            sluice,
            indexes,
            roots,
            criteria: Criteria::default(),
            response: Arc::new(OnceCell::new()),
        }
    }

    /// Build a new query from our criteria
    ///
    /// # Arguments
    ///
    /// * `update` - The change to make to our criteria
    fn chain<F: FnOnce(Criteria) -> Criteria>(&self, update: F) -> Query {
        Query {
            sluice: self.sluice.clone(),
            indexes: self.indexes.clone(),
            roots: self.roots.clone(),
            criteria: update(self.criteria.clone()),
            response: Arc::new(OnceCell::new()),
        }
    }

    /// Get the criteria for this query
    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    /// Change this query's criteria directly
    ///
    /// # Arguments
    ///
    /// * `update` - The change to make to our criteria
    #[must_use]
    pub fn with<F: FnOnce(Criteria) -> Criteria>(&self, update: F) -> Query {
        self.chain(update)
    }

    /// Add a query clause
    #[must_use]
    pub fn query(&self, clause: Value) -> Query {
        self.chain(|criteria| criteria.query(clause))
    }

    /// Add a filter clause
    #[must_use]
    pub fn filter(&self, clause: Value) -> Query {
        self.chain(|criteria| criteria.filter(clause))
    }

    /// Add a post filter clause
    #[must_use]
    pub fn post_filter(&self, clause: Value) -> Query {
        self.chain(|criteria| criteria.post_filter(clause))
    }

    /// Set how query clauses are joined
    #[must_use]
    pub fn query_mode(&self, mode: QueryMode) -> Query {
        self.chain(|criteria| criteria.query_mode(mode))
    }

    /// Set how filter clauses are joined
    #[must_use]
    pub fn filter_mode(&self, mode: FilterMode) -> Query {
        self.chain(|criteria| criteria.filter_mode(mode))
    }

    /// Set how post filter clauses are joined
    #[must_use]
    pub fn post_filter_mode(&self, mode: FilterMode) -> Query {
        self.chain(|criteria| criteria.post_filter_mode(mode))
    }

    /// Set how function scores combine with the query score
    #[must_use]
    pub fn boost_mode(&self, mode: &str) -> Query {
        self.chain(|criteria| criteria.boost_mode(mode))
    }

    /// Set how function scores combine with each other
    #[must_use]
    pub fn score_mode(&self, mode: &str) -> Query {
        self.chain(|criteria| criteria.score_mode(mode))
    }

    /// Add sort terms
    #[must_use]
    pub fn order(&self, sort: Value) -> Query {
        self.chain(|criteria| criteria.order(sort))
    }

    /// Replace the sort terms
    #[must_use]
    pub fn reorder(&self, sort: Value) -> Query {
        self.chain(|criteria| criteria.reorder(sort))
    }

    /// Limit the number of hits returned
    #[must_use]
    pub fn limit(&self, size: u64) -> Query {
        self.chain(|criteria| criteria.limit(size))
    }

    /// Skip some number of hits
    #[must_use]
    pub fn offset(&self, from: u64) -> Query {
        self.chain(|criteria| criteria.offset(from))
    }

    /// Set a search timeout
    #[must_use]
    pub fn timeout(&self, timeout: &str) -> Query {
        self.chain(|criteria| criteria.timeout(timeout))
    }

    /// Explain how each hit was scored
    #[must_use]
    pub fn explain(&self, explain: bool) -> Query {
        self.chain(|criteria| criteria.explain(explain))
    }

    /// Set the highlight settings
    #[must_use]
    pub fn highlight(&self, highlight: Value) -> Query {
        self.chain(|criteria| criteria.highlight(highlight))
    }

    /// Set the rescore settings
    #[must_use]
    pub fn rescore(&self, rescore: Value) -> Query {
        self.chain(|criteria| criteria.rescore(rescore))
    }

    /// Drop hits below a score
    #[must_use]
    pub fn min_score(&self, min_score: f64) -> Query {
        self.chain(|criteria| criteria.min_score(min_score))
    }

    /// Compute scores when sorting on a field
    #[must_use]
    pub fn track_scores(&self, track_scores: bool) -> Query {
        self.chain(|criteria| criteria.track_scores(track_scores))
    }

    /// Set the shard preference
    #[must_use]
    pub fn preference(&self, preference: &str) -> Query {
        self.chain(|criteria| criteria.preference(preference))
    }

    /// Set the search type
    #[must_use]
    pub fn search_type(&self, search_type: &str) -> Query {
        self.chain(|criteria| criteria.search_type(search_type))
    }

    /// Add source fields to return
    #[must_use]
    pub fn only<I, T>(&self, fields: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.chain(|criteria| criteria.only(fields))
    }

    /// Replace the source fields to return
    #[must_use]
    pub fn only_exactly<I, T>(&self, fields: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.chain(|criteria| criteria.only_exactly(fields))
    }

    /// Add types to restrict this search to
    #[must_use]
    pub fn types<I, T>(&self, types: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.chain(|criteria| criteria.types(types))
    }

    /// Replace the types to restrict this search to
    #[must_use]
    pub fn types_exactly<I, T>(&self, types: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.chain(|criteria| criteria.types_exactly(types))
    }

    /// Add a raw score function
    #[must_use]
    pub fn score(&self, function: Value) -> Query {
        self.chain(|criteria| criteria.score(function))
    }

    /// Score with a script
    #[must_use]
    pub fn script_score(&self, script: &str, options: Value) -> Query {
        self.chain(|criteria| criteria.script_score(script, options))
    }

    /// Multiply scores by a factor
    #[must_use]
    pub fn boost_factor(&self, factor: f64, options: Value) -> Query {
        self.chain(|criteria| criteria.boost_factor(factor, options))
    }

    /// Multiply scores by a weight
    #[must_use]
    pub fn weight(&self, factor: f64, options: Value) -> Query {
        self.chain(|criteria| criteria.weight(factor, options))
    }

    /// Score randomly with a seed
    #[must_use]
    pub fn random_score(&self, seed: i64, options: Value) -> Query {
        self.chain(|criteria| criteria.random_score(seed, options))
    }

    /// Score with the value of a field
    #[must_use]
    pub fn field_value_factor(&self, settings: Value, options: Value) -> Query {
        self.chain(|criteria| criteria.field_value_factor(settings, options))
    }

    /// Score with a decay function over a field
    #[must_use]
    pub fn decay(&self, function: &str, field: &str, options: Value) -> Query {
        self.chain(|criteria| criteria.decay(function, field, options))
    }

    /// Add aggregations
    #[must_use]
    pub fn aggregations(&self, aggregations: Value) -> Query {
        self.chain(|criteria| criteria.aggregations(aggregations))
    }

    /// Add suggesters
    #[must_use]
    pub fn suggest(&self, suggest: Value) -> Query {
        self.chain(|criteria| criteria.suggest(suggest))
    }

    /// Add script fields
    #[must_use]
    pub fn script_fields(&self, script_fields: Value) -> Query {
        self.chain(|criteria| criteria.script_fields(script_fields))
    }

    /// Make this query match nothing without asking the search service
    #[must_use]
    pub fn none(&self) -> Query {
        self.chain(Criteria::none)
    }

    /// Leave some source fields out of each hit
    #[must_use]
    pub fn exclude<I, T>(&self, fields: I) -> Query
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.chain(|criteria| criteria.exclude(fields))
    }

    /// Skip returning sources entirely
    #[must_use]
    pub fn no_source(&self) -> Query {
        self.chain(Criteria::no_source)
    }

    /// Only return hits that sort after the sort values of a hit already seen
    #[must_use]
    pub fn search_after(&self, values: Vec<Value>) -> Query {
        self.chain(|criteria| criteria.search_after(values))
    }

    /// Set whether the exact number of hits is tracked
    #[must_use]
    pub fn track_total_hits(&self, track: bool) -> Query {
        self.chain(|criteria| criteria.track_total_hits(track))
    }

    /// Require both our where clauses and another query's to match
    ///
    /// Only the query, filters and post filters of `other` are used.
    ///
    /// # Arguments
    ///
    /// * `other` - The query to combine with
    #[must_use]
    pub fn and(&self, other: &Query) -> Query {
        self.chain(|criteria| criteria.and(&other.criteria, &self.sluice.conf.search))
    }

    /// Allow either our where clauses or another query's to match
    ///
    /// # Arguments
    ///
    /// * `other` - The query to combine with
    #[must_use]
    pub fn or(&self, other: &Query) -> Query {
        self.chain(|criteria| criteria.or(&other.criteria, &self.sluice.conf.search))
    }

    /// Require our where clauses to match while another query's do not
    ///
    /// # Arguments
    ///
    /// * `other` - The query to combine with
    #[must_use]
    pub fn not(&self, other: &Query) -> Query {
        self.chain(|criteria| criteria.not(&other.criteria, &self.sluice.conf.search))
    }

    /// Merge another query's criteria into this one
    ///
    /// # Arguments
    ///
    /// * `other` - The query to merge in
    #[must_use]
    pub fn merge(&self, other: &Query) -> Query {
        self.chain(|criteria| criteria.merge(&other.criteria))
    }

    /// Get the types this search is restricted to in each physical index
    ///
    /// An empty list searches every type. Returns `None` if no type could
    /// possibly match.
    pub fn scopes(&self) -> Option<Vec<TypeScope>> {
        if self.roots.is_empty() && self.criteria.types.is_empty() {
            return Some(Vec::default());
        }
        let mut scopes = Vec::with_capacity(self.indexes.len());
        for base in &self.indexes {
            let types = if self.roots.is_empty() {
                self.criteria.types.clone()
            } else {
                // roots keep each type paired with the index it belongs to
                self.roots
                    .iter()
                    .filter(|key| key.index == *base)
                    .filter(|key| {
                        self.criteria.types.is_empty() || self.criteria.types.contains(&key.type_name)
                    })
                    .map(|key| key.type_name.clone())
                    .collect::<Vec<String>>()
            };
            if !types.is_empty() {
                scopes.push(TypeScope {
                    index: self.sluice.index_name(base, None),
                    types,
                });
            }
        }
        if scopes.is_empty() { None } else { Some(scopes) }
    }

    /// Check if this query can never match anything
    pub fn is_none(&self) -> bool {
        self.criteria.none || self.scopes().is_none()
    }

    /// Get the names of every type this query could return
    fn searched_types(&self) -> Vec<String> {
        match self.scopes() {
            Some(scopes) if !scopes.is_empty() => scopes
                .into_iter()
                .flat_map(|scope| scope.types)
                .unique()
                .collect(),
            _ => self
                .indexes
                .iter()
                .filter_map(|base| self.sluice.registry.index(base).ok())
                .flat_map(|definition| definition.types.iter().map(|type_def| type_def.name.clone()))
                .unique()
                .collect(),
        }
    }

    /// Get the stored document ids for some record ids in every type we search
    ///
    /// # Arguments
    ///
    /// * `ids` - The record ids to get stored ids for
    fn document_ids<T: AsRef<str>>(&self, ids: &[T]) -> Vec<String> {
        self.searched_types()
            .iter()
            .cartesian_product(ids)
            .map(|(type_name, id)| document_id(type_name, id.as_ref()))
            .collect()
    }

    /// Only match documents built from some record ids
    ///
    /// # Arguments
    ///
    /// * `ids` - The record ids to match
    #[must_use]
    pub fn filter_ids<T: AsRef<str>>(&self, ids: &[T]) -> Query {
        self.filter(json!({"ids": {"values": self.document_ids(ids)}}))
    }

    /// Get the physical index names this query searches
    pub fn index_names(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|base| self.sluice.index_name(base, None))
            .collect()
    }

    /// Build the request for this query
    pub fn request(&self) -> SearchRequest {
        let compiled = self.criteria.compile(&self.sluice.conf.search);
        SearchRequest {
            index: self.index_names(),
            scopes: self.scopes().unwrap_or_default(),
            body: compiled.body,
            options: compiled.options,
        }
    }

    /// Build a request that only needs to count hits
    fn count_request(&self) -> SearchRequest {
        let mut request = self.request();
        let query = request.body.get("query").cloned();
        request.body = match query {
            Some(query) => json!({ "query": query }),
            None => json!({}),
        };
        request
    }

    /// Send this search
    #[instrument(name = "Query::execute", skip_all, fields(indexes = ?self.indexes), err(Debug))]
    async fn execute(&self) -> Result<SearchResponse, Error> {
        // searches that can never match don't need to be sent
        if self.is_none() {
            return Ok(SearchResponse::default());
        }
        match self.sluice.backend.search(&self.request()).await {
            Ok(response) => Ok(response),
            Err(error) if error.is_index_missing() => {
                event!(Level::DEBUG, msg = "Searched a missing index", error = error.to_string());
                Ok(SearchResponse::default())
            }
            Err(error) => Err(error),
        }
    }

    /// Get the response for this query, sending it if it hasn't been sent yet
    pub async fn response(&self) -> Result<&SearchResponse, Error> {
        self.response.get_or_try_init(|| self.execute()).await
    }

    /// Check if this query has already been sent
    pub fn is_loaded(&self) -> bool {
        self.response.initialized()
    }

    /// Get the hits for this query
    pub async fn hits(&self) -> Result<Vec<Hit>, Error> {
        Ok(self.response().await?.hits.hits.clone())
    }

    /// Get the hits for this query along with the type each one belongs to
    ///
    /// Hits from indexes or types that are not registered are skipped.
    pub async fn typed_hits(&self) -> Result<Vec<(TypeKey, Hit)>, Error> {
        let response = self.response().await?;
        let mut typed = Vec::with_capacity(response.hits.hits.len());
        for hit in &response.hits.hits {
            match self.dispatch(hit) {
                Some(key) => typed.push((key, hit.clone())),
                None => event!(
                    Level::WARN,
                    msg = "Failed to find the type for a hit",
                    index = hit.index,
                    type_name = hit.type_name
                ),
            }
        }
        Ok(typed)
    }

    /// Find the type a hit belongs to from its physical index and type
    ///
    /// # Arguments
    ///
    /// * `hit` - The hit to find a type for
    pub fn dispatch(&self, hit: &Hit) -> Option<TypeKey> {
        // prefer the longest matching index name so `cities_v2` doesn't match `cities`
        let base = self
            .indexes
            .iter()
            .filter(|base| {
                let physical = self.sluice.index_name(base, None);
                hit.index == physical || hit.index.starts_with(&format!("{physical}_"))
            })
            .max_by_key(|base| base.len())?;
        let definition = self.sluice.registry.index(base).ok()?;
        definition
            .type_def(&hit.type_name)
            .ok()
            .map(|type_def| TypeKey::new(base, &type_def.name))
    }

    /// Get the source documents that hit
    pub async fn to_vec(&self) -> Result<Vec<Value>, Error> {
        Ok(self
            .response()
            .await?
            .hits
            .hits
            .iter()
            .map(|hit| hit.source.clone())
            .collect())
    }

    /// Get the ids of the documents that hit
    pub async fn ids(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .response()
            .await?
            .hits
            .hits
            .iter()
            .map(|hit| hit.id.clone())
            .collect())
    }

    /// Get the total number of documents that hit
    pub async fn total(&self) -> Result<u64, Error> {
        Ok(self.response().await?.total())
    }

    /// Count the documents that match without fetching them
    ///
    /// Uses the loaded response if this query was already sent.
    #[instrument(name = "Query::count", skip_all, err(Debug))]
    pub async fn count(&self) -> Result<u64, Error> {
        if let Some(response) = self.response.get() {
            return Ok(response.total());
        }
        if self.is_none() {
            return Ok(0);
        }
        match self.sluice.backend.count(&self.count_request()).await {
            Ok(count) => Ok(count),
            Err(error) if error.is_index_missing() => Ok(0),
            Err(error) => Err(error),
        }
    }

    /// Get the computed aggregations
    pub async fn aggregation_results(&self) -> Result<Map<String, Value>, Error> {
        Ok(self.response().await?.aggregations.clone())
    }

    /// Get a single computed aggregation
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the aggregation to get
    pub async fn aggregation(&self, name: &str) -> Result<Option<Value>, Error> {
        Ok(self.response().await?.aggregations.get(name).cloned())
    }

    /// Get the suggestions
    pub async fn suggest_results(&self) -> Result<Map<String, Value>, Error> {
        Ok(self.response().await?.suggest.clone())
    }

    /// Get how long the search took in ms
    pub async fn took(&self) -> Result<u64, Error> {
        Ok(self.response().await?.took)
    }

    /// Check if the search timed out and only returned partial results
    pub async fn timed_out(&self) -> Result<bool, Error> {
        Ok(self.response().await?.timed_out)
    }

    /// Check if any documents match this query
    pub async fn exists(&self) -> Result<bool, Error> {
        if let Some(response) = self.response.get() {
            return Ok(response.total() > 0);
        }
        Ok(self.limit(0).total().await? > 0)
    }

    /// Get a query that returns every matching document
    ///
    /// Use `scroll_hits` for searches that may match more documents than the
    /// search service returns at once.
    pub async fn unlimited(&self) -> Result<Query, Error> {
        let total = self.count().await?;
        Ok(self.offset(0).limit(total))
    }

    /// Get the first matching hit
    ///
    /// Uses the loaded response if this query was already sent.
    pub async fn first(&self) -> Result<Option<Hit>, Error> {
        if let Some(response) = self.response.get() {
            if !response.hits.hits.is_empty() || response.total() == 0 {
                return Ok(response.hits.hits.first().cloned());
            }
        }
        let first = self.chain(|mut criteria| {
            criteria.aggregations.clear();
            criteria.suggest.clear();
            criteria.limit(1)
        });
        Ok(first.hits().await?.into_iter().next())
    }

    /// Stream every matching hit in batches using the scroll API
    ///
    /// Any offset is ignored while a limit caps the total number of hits.
    ///
    /// # Arguments
    ///
    /// * `batch_size` - The number of hits to fetch in each batch
    pub fn scroll_batches(
        &self,
        batch_size: u64,
    ) -> impl Stream<Item = Result<Vec<Hit>, Error>> + Send + 'static {
        let batch_size = batch_size.max(1);
        let state = if self.is_none() {
            ScrollState::Done
        } else {
            let batched = self.chain(|mut criteria| {
                criteria.request_options.remove("from");
                criteria.limit(batch_size)
            });
            ScrollState::Start(batched.request())
        };
        let scroll = Scroll {
            backend: self.sluice.backend.clone(),
            keep_alive: self.sluice.conf.search.scroll.clone(),
            batch_size,
            remaining: self.criteria.size(),
            state,
        };
        stream::try_unfold(scroll, Scroll::next_batch)
    }

    /// Get every matching hit using the scroll API
    ///
    /// # Arguments
    ///
    /// * `batch_size` - The number of hits to fetch in each batch
    #[instrument(name = "Query::scroll_hits", skip(self), err(Debug))]
    pub async fn scroll_hits(&self, batch_size: u64) -> Result<Vec<Hit>, Error> {
        self.scroll_batches(batch_size).try_concat().await
    }

    /// Get the values of some fields from every matching document
    ///
    /// `_id`, `_index` and `_type` are read from the hit itself. Every matching
    /// document is scrolled through unless a limit is set.
    ///
    /// # Arguments
    ///
    /// * `fields` - The fields to get values for
    #[instrument(name = "Query::pluck", skip_all, err(Debug))]
    pub async fn pluck<T: AsRef<str>>(&self, fields: &[T]) -> Result<Vec<Vec<Value>>, Error> {
        let fields = fields
            .iter()
            .map(|field| field.as_ref().to_owned())
            .filter(|field| !field.is_empty())
            .collect::<Vec<String>>();
        let source_fields = fields
            .iter()
            .filter(|field| !matches!(field.as_str(), "_id" | "_index" | "_type"))
            .cloned()
            .collect::<Vec<String>>();
        let plucking = self.chain(|mut criteria| {
            criteria.aggregations.clear();
            criteria.suggest.clear();
            criteria.script_fields.clear();
            criteria.excludes.clear();
            criteria.no_source = source_fields.is_empty();
            criteria.only_exactly(source_fields)
        });
        let hits = if self.criteria.size().is_some() {
            plucking.hits().await?
        } else {
            plucking.scroll_hits(PLUCK_BATCH_SIZE).await?
        };
        Ok(hits
            .iter()
            .map(|hit| fields.iter().map(|field| pluck_field(hit, field)).collect())
            .collect())
    }

    /// Find documents by id
    ///
    /// # Arguments
    ///
    /// * `ids` - The ids of the documents to find
    #[instrument(name = "Query::find", skip_all, err(Debug))]
    pub async fn find<T: AsRef<str>>(&self, ids: &[T]) -> Result<Vec<Hit>, Error> {
        let ids = ids
            .iter()
            .map(|id| id.as_ref().to_owned())
            .collect::<Vec<String>>();
        let stored = self.document_ids(&ids);
        let limit = stored.len() as u64;
        let batch_size = self.sluice.conf.search.batch_size;
        let found = self.chain(|mut criteria| {
            criteria.aggregations.clear();
            criteria.suggest.clear();
            criteria.request_options.remove("from");
            criteria.request_options.remove("size");
            criteria.filter(json!({"ids": {"values": stored}}))
        });
        // lots of ids are scrolled through instead of fetched at once
        let hits = if ids.len() as u64 > batch_size {
            found.scroll_hits(batch_size).await?
        } else {
            found.limit(limit).hits().await?
        };
        if hits.is_empty() {
            return Err(Error::DocumentNotFound(ids));
        }
        Ok(hits)
    }

    /// Delete every document that matches this query
    ///
    /// Returns the number of documents that were deleted.
    #[instrument(name = "Query::delete_all", skip_all, fields(indexes = ?self.indexes), err(Debug))]
    pub async fn delete_all(&self) -> Result<u64, Error> {
        if self.is_none() {
            return Ok(0);
        }
        let deleted = match self.sluice.backend.delete_by_query(&self.count_request()).await {
            Ok(deleted) => deleted,
            Err(error) if error.is_index_missing() => 0,
            Err(error) => return Err(error),
        };
        // make the deletes visible to the next search
        if deleted > 0 {
            self.sluice.backend.refresh(&self.index_names()).await?;
        }
        Ok(deleted)
    }
}
