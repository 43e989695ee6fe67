//! An in process search service used for tests and local development

use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{Level, event, instrument};
use uuid::Uuid;

use super::{
    AliasAction, Backend, BulkAction, BulkItemResult, BulkRequest, BulkResponse, SearchRequest,
    document_id,
};
use crate::Error;
use crate::conf::ClusterStatus;
use crate::search::{Hit, Hits, HitsTotal, SearchResponse};

mod eval;

use eval::DocRef;

/// Deep merge one JSON object into another
///
/// # Arguments
///
/// * `target` - The value to merge into
/// * `patch` - The value to merge in
fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                deep_merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// A document stored in a memory index
#[derive(Debug, Clone)]
struct StoredDoc {
    /// The type of this document
    type_name: String,
    /// The id of the record this document was built from
    id: String,
    /// The document itself
    source: Value,
}

/// A single index held in memory
#[derive(Debug, Default)]
struct MemoryIndex {
    /// The settings for this index
    settings: Value,
    /// The mapped properties for this index
    properties: Map<String, Value>,
    /// The aliases pointing at this index
    aliases: BTreeSet<String>,
    /// The documents in this index by their stored id
    docs: BTreeMap<String, StoredDoc>,
}

impl MemoryIndex {
    /// Build an index from a create body
    ///
    /// # Arguments
    ///
    /// * `body` - The body this index is being created with
    fn new(body: &Value) -> Self {
        let properties = body
            .pointer("/mappings/properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        MemoryIndex {
            settings: body.get("settings").cloned().unwrap_or_else(|| json!({})),
            properties,
            aliases: BTreeSet::default(),
            docs: BTreeMap::default(),
        }
    }
}

/// Everything held by the memory backend
#[derive(Debug, Default)]
struct MemoryState {
    /// The indexes by name
    indexes: BTreeMap<String, MemoryIndex>,
}

impl MemoryState {
    /// Resolve an index or alias name to the indexes it points at
    ///
    /// # Arguments
    ///
    /// * `name` - The index or alias to resolve
    fn resolve(&self, name: &str) -> Result<Vec<String>, Error> {
        if self.indexes.contains_key(name) {
            return Ok(vec![name.to_owned()]);
        }
        // find any indexes with this name as an alias
        let found = self
            .indexes
            .iter()
            .filter(|(_, index)| index.aliases.contains(name))
            .map(|(index, _)| index.clone())
            .collect::<Vec<String>>();
        if found.is_empty() {
            Err(Error::index_missing(name))
        } else {
            Ok(found)
        }
    }

    /// Resolve many names to a deduplicated list of indexes
    ///
    /// # Arguments
    ///
    /// * `names` - The index or alias names to resolve
    fn resolve_all(&self, names: &[String]) -> Result<Vec<String>, Error> {
        let mut resolved = BTreeSet::default();
        for name in names {
            resolved.extend(self.resolve(name)?);
        }
        Ok(resolved.into_iter().collect())
    }

    /// Get the types each physical index may return for a search
    ///
    /// Indexes that are missing from the returned map may return nothing and a
    /// `None` means every type may be returned.
    ///
    /// # Arguments
    ///
    /// * `request` - The search to get the allowed types for
    fn allowed_types(&self, request: &SearchRequest) -> Result<BTreeMap<String, Option<BTreeSet<String>>>, Error> {
        let mut allowed = BTreeMap::default();
        let searched = self.resolve_all(&request.index)?;
        // unscoped searches return every type from every index
        if request.scopes.is_empty() {
            for name in searched {
                allowed.insert(name, None);
            }
            return Ok(allowed);
        }
        for scope in &request.scopes {
            let Ok(names) = self.resolve(&scope.index) else {
                continue;
            };
            for name in names.into_iter().filter(|name| searched.contains(name)) {
                let entry = allowed.entry(name).or_insert_with(|| Some(BTreeSet::default()));
                if let Some(types) = entry {
                    types.extend(scope.types.iter().cloned());
                }
            }
        }
        Ok(allowed)
    }

    /// Check if an alias name is taken by an index
    ///
    /// # Arguments
    ///
    /// * `alias` - The alias to check
    fn check_alias(&self, alias: &str) -> Result<(), Error> {
        if self.indexes.contains_key(alias) {
            return Err(Error::Service {
                status: 400,
                kind: "invalid_alias_name_exception".to_owned(),
                reason: format!("an index exists with the same name as the alias [{alias}]"),
            });
        }
        Ok(())
    }
}

/// A matched document and where it came from
struct Matched<'a> {
    /// The physical index this document is in
    index: &'a str,
    /// The document itself
    doc: DocRef<'a>,
}

/// The hits left in an open scroll
#[derive(Debug)]
struct MemoryScroll {
    /// The hits that have not been returned yet
    hits: VecDeque<Hit>,
    /// The number of hits to return in each batch
    size: usize,
    /// The total number of hits this scroll found
    total: u64,
}

/// A search service that keeps everything in memory
#[derive(Debug, Default)]
pub struct Memory {
    /// The indexes in this backend
    state: RwLock<MemoryState>,
    /// The scrolls that are still open
    scrolls: Mutex<BTreeMap<String, MemoryScroll>>,
    /// The number of bulk requests that were sent
    bulk_requests: AtomicUsize,
    /// The number of searches that were sent
    searches: AtomicUsize,
}

impl Memory {
    /// Create a new empty memory backend
    pub fn new() -> Self {
        Memory::default()
    }

    /// Get the number of bulk requests this backend has handled
    pub fn bulk_requests(&self) -> usize {
        self.bulk_requests.load(Ordering::SeqCst)
    }

    /// Get the number of searches, counts and deletes by query this backend has handled
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    /// Get the names of every index
    pub fn index_names(&self) -> Result<Vec<String>, Error> {
        Ok(self.read()?.indexes.keys().cloned().collect())
    }

    /// Get the settings for an index
    ///
    /// # Arguments
    ///
    /// * `index` - The index to get settings for
    pub fn settings(&self, index: &str) -> Result<Value, Error> {
        let state = self.read()?;
        let name = state.resolve(index)?;
        Ok(name
            .first()
            .and_then(|name| state.indexes.get(name))
            .map(|index| index.settings.clone())
            .unwrap_or_default())
    }

    /// Get a document from an index
    ///
    /// # Arguments
    ///
    /// * `index` - The index or alias to look in
    /// * `type_name` - The type of the document
    /// * `id` - The id of the document
    pub fn document(&self, index: &str, type_name: &str, id: &str) -> Result<Option<Value>, Error> {
        let state = self.read()?;
        let key = document_id(type_name, id);
        for name in state.resolve(index)? {
            if let Some(doc) = state.indexes.get(&name).and_then(|index| index.docs.get(&key)) {
                // a document stored under this id by another type is not ours
                if doc.type_name == type_name {
                    return Ok(Some(doc.source.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Get the number of scrolls that are still open
    pub fn open_scrolls(&self) -> Result<usize, Error> {
        Ok(self.scrolls()?.len())
    }

    /// Lock our open scrolls
    fn scrolls(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemoryScroll>>, Error> {
        self.scrolls
            .lock()
            .map_err(|err| Error::new(format!("Memory backend scroll lock poisoned: {err}")))
    }

    /// Lock our state for reading
    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, Error> {
        self.state
            .read()
            .map_err(|err| Error::new(format!("Memory backend lock poisoned: {err}")))
    }

    /// Lock our state for writing
    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, Error> {
        self.state
            .write()
            .map_err(|err| Error::new(format!("Memory backend lock poisoned: {err}")))
    }

    /// Find the documents matching a search's query and types
    ///
    /// # Arguments
    ///
    /// * `state` - The state to search
    /// * `request` - The search to execute
    fn find<'a>(
        state: &'a MemoryState,
        request: &SearchRequest,
    ) -> Result<Vec<Matched<'a>>, Error> {
        let allowed = state.allowed_types(request)?;
        let query = request.body.get("query");
        let mut matched = Vec::default();
        for (name, types) in &allowed {
            let Some((name, index)) = state.indexes.get_key_value(name) else {
                continue;
            };
            for (stored_id, stored) in &index.docs {
                // skip any types we were not asked for
                if types.as_ref().is_some_and(|types| !types.contains(&stored.type_name)) {
                    continue;
                }
                let doc = DocRef {
                    document_id: stored_id,
                    id: &stored.id,
                    type_name: &stored.type_name,
                    source: &stored.source,
                };
                let hit = match query {
                    Some(query) => eval::matches(query, &doc)?,
                    None => true,
                };
                if hit {
                    matched.push(Matched { index: name, doc });
                }
            }
        }
        Ok(matched)
    }

    /// Execute a search against our state
    ///
    /// # Arguments
    ///
    /// * `state` - The state to search
    /// * `request` - The search to execute
    /// * `paged` - Whether to apply the requested page or return every hit
    fn respond(state: &MemoryState, request: &SearchRequest, paged: bool) -> Result<SearchResponse, Error> {
        let matched = Memory::find(state, request)?;
        let docs = matched.iter().map(|found| found.doc).collect::<Vec<_>>();
        // aggregations ignore post filters
        let aggregations = match request
            .body
            .get("aggregations")
            .or_else(|| request.body.get("aggs"))
            .and_then(Value::as_object)
        {
            Some(aggregations) => eval::aggregate(aggregations, &docs)?,
            None => Map::default(),
        };
        // apply any post filter
        let mut hits = Vec::with_capacity(matched.len());
        for found in matched {
            let keep = match request.body.get("post_filter") {
                Some(filter) => eval::matches(filter, &found.doc)?,
                None => true,
            };
            if keep {
                hits.push(found);
            }
        }
        let total = hits.len() as u64;
        // sort our hits if we were asked to
        let sort = eval::parse_sort(request.body.get("sort"))?;
        if !sort.is_empty() {
            hits.sort_by(|left, right| eval::compare_docs(&sort, (&left.doc, 1.0), (&right.doc, 1.0)));
        }
        // skip anything at or before a search after cursor
        if let Some(after) = request.body.get("search_after") {
            let Some(after) = after.as_array().filter(|after| after.len() == sort.len()) else {
                return Err(Error::Service {
                    status: 400,
                    kind: "illegal_argument_exception".to_owned(),
                    reason: "search_after has to match the sort values".to_owned(),
                });
            };
            hits.retain(|found| {
                let values = eval::sort_values(&sort, &found.doc, 1.0);
                eval::sorts_after(&sort, &values, after)
            });
        }
        let (from, size) = if paged {
            let from = request.body.get("from").and_then(Value::as_u64).unwrap_or(0) as usize;
            let size = request.body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
            (from, size)
        } else {
            (0, usize::MAX)
        };
        let fields = request.body.get("_source");
        let hits = hits
            .into_iter()
            .skip(from)
            .take(size)
            .map(|found| Hit {
                id: found.doc.id.to_owned(),
                index: found.index.to_owned(),
                type_name: found.doc.type_name.to_owned(),
                score: Some(1.0),
                source: project(found.doc.source, fields),
                sort: if sort.is_empty() {
                    Vec::default()
                } else {
                    eval::sort_values(&sort, &found.doc, 1.0)
                },
                ..Hit::default()
            })
            .collect::<Vec<Hit>>();
        // suggestions are echoed back without any options
        let suggest = request
            .body
            .get("suggest")
            .and_then(Value::as_object)
            .map(|suggest| {
                suggest
                    .keys()
                    .map(|name| (name.clone(), json!([])))
                    .collect::<Map<String, Value>>()
            })
            .unwrap_or_default();
        Ok(SearchResponse {
            took: 1,
            timed_out: false,
            hits: Hits {
                total: HitsTotal::Detailed {
                    value: total,
                    relation: "eq".to_owned(),
                },
                max_score: (!hits.is_empty()).then_some(1.0),
                hits,
            },
            aggregations,
            suggest,
            scroll_id: None,
        })
    }
}

/// Project a document down to the requested source fields
///
/// # Arguments
///
/// * `source` - The source to project
/// * `fields` - The `_source` setting from the search body
fn project(source: &Value, fields: Option<&Value>) -> Value {
    match fields {
        Some(Value::Bool(false)) => Value::Null,
        Some(Value::Array(fields)) => {
            let mut projected = Map::default();
            for field in fields.iter().filter_map(Value::as_str) {
                if let Some(value) = source.get(field) {
                    projected.insert(field.to_owned(), value.clone());
                }
            }
            Value::Object(projected)
        }
        Some(Value::String(field)) => project(source, Some(&json!([field]))),
        Some(Value::Object(filter)) => {
            let mut projected = match filter.get("includes") {
                Some(includes) => project(source, Some(includes)),
                None => source.clone(),
            };
            if let (Some(projected), Some(excludes)) = (projected.as_object_mut(), filter.get("excludes")) {
                let excludes = match excludes {
                    Value::String(field) => vec![field.as_str()],
                    other => other.as_array().into_iter().flatten().filter_map(Value::as_str).collect(),
                };
                for field in excludes {
                    projected.remove(field);
                }
            }
            projected
        }
        _ => source.clone(),
    }
}

#[async_trait::async_trait]
impl Backend for Memory {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn index_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.read()?.resolve(name).is_ok())
    }

    #[instrument(name = "Backend<Memory>::create_index", skip(self, body), err(Debug))]
    async fn create_index(&self, name: &str, body: &Value) -> Result<(), Error> {
        let mut state = self.write()?;
        if state.indexes.contains_key(name) {
            return Err(Error::Service {
                status: 400,
                kind: "resource_already_exists_exception".to_owned(),
                reason: format!("index [{name}] already exists"),
            });
        }
        if state.resolve(name).is_ok() {
            return Err(Error::Service {
                status: 400,
                kind: "invalid_index_name_exception".to_owned(),
                reason: format!("Invalid index name [{name}], already exists as alias"),
            });
        }
        let mut index = MemoryIndex::new(body);
        // add any aliases this index was created with
        if let Some(aliases) = body.get("aliases").and_then(Value::as_object) {
            for alias in aliases.keys() {
                state.check_alias(alias)?;
                index.aliases.insert(alias.clone());
            }
        }
        state.indexes.insert(name.to_owned(), index);
        event!(Level::DEBUG, msg = "Created index", index = name);
        Ok(())
    }

    #[instrument(name = "Backend<Memory>::delete_indexes", skip(self), err(Debug))]
    async fn delete_indexes(&self, names: &[String]) -> Result<(), Error> {
        let mut state = self.write()?;
        // make sure every index exists before deleting any of them
        let resolved = state.resolve_all(names)?;
        for name in resolved {
            state.indexes.remove(&name);
        }
        Ok(())
    }

    async fn get_aliases(&self, name: &str) -> Result<BTreeMap<String, Vec<String>>, Error> {
        let state = self.read()?;
        let Ok(indexes) = state.resolve(name) else {
            return Ok(BTreeMap::default());
        };
        Ok(indexes
            .into_iter()
            .filter_map(|index| {
                state
                    .indexes
                    .get(&index)
                    .map(|found| (index, found.aliases.iter().cloned().collect()))
            })
            .collect())
    }

    #[instrument(name = "Backend<Memory>::update_aliases", skip_all, err(Debug))]
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), Error> {
        let mut state = self.write()?;
        // validate every action before applying any of them
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    state.resolve(index)?;
                    state.check_alias(alias)?;
                }
                AliasAction::Remove { index, alias } => {
                    let has_alias = state
                        .indexes
                        .get(index)
                        .is_some_and(|found| found.aliases.contains(alias));
                    if !has_alias {
                        return Err(Error::Service {
                            status: 404,
                            kind: "aliases_not_found_exception".to_owned(),
                            reason: format!("aliases [{alias}] missing on [{index}]"),
                        });
                    }
                }
            }
        }
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    for name in state.resolve(index)? {
                        if let Some(found) = state.indexes.get_mut(&name) {
                            found.aliases.insert(alias.clone());
                        }
                    }
                }
                AliasAction::Remove { index, alias } => {
                    if let Some(found) = state.indexes.get_mut(index) {
                        found.aliases.remove(alias);
                    }
                }
            }
        }
        Ok(())
    }

    async fn put_settings(&self, index: &str, settings: &Value) -> Result<(), Error> {
        let mut state = self.write()?;
        for name in state.resolve(index)? {
            if let Some(found) = state.indexes.get_mut(&name) {
                deep_merge(&mut found.settings, settings);
            }
        }
        Ok(())
    }

    async fn refresh(&self, indexes: &[String]) -> Result<(), Error> {
        // writes are visible immediately so just make sure these exist
        self.read()?.resolve_all(indexes)?;
        Ok(())
    }

    async fn wait_for_status(&self, _status: ClusterStatus) -> Result<(), Error> {
        Ok(())
    }

    #[instrument(name = "Backend<Memory>::bulk", skip_all, fields(index = %request.index, items = request.items.len()), err(Debug))]
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse, Error> {
        self.bulk_requests.fetch_add(1, Ordering::SeqCst);
        let mut state = self.write()?;
        // writing to a missing index creates it
        let target = match state.resolve(&request.index) {
            Ok(mut names) if names.len() == 1 => names.remove(0),
            Ok(_) => {
                return Err(Error::Service {
                    status: 400,
                    kind: "illegal_argument_exception".to_owned(),
                    reason: format!(
                        "alias [{}] has more than one index associated with it",
                        request.index
                    ),
                });
            }
            Err(_) => {
                state
                    .indexes
                    .insert(request.index.clone(), MemoryIndex::new(&json!({})));
                request.index.clone()
            }
        };
        let index = state
            .indexes
            .get_mut(&target)
            .ok_or_else(|| Error::index_missing(&target))?;
        let mut items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let key = item.document_id();
            let (status, error) = match item.action {
                BulkAction::Index => {
                    let source = item.source.clone().unwrap_or_else(|| json!({}));
                    match eval::validate(&index.properties, &source) {
                        Ok(()) => {
                            let stored = StoredDoc {
                                type_name: item.type_name.clone(),
                                id: item.id.clone(),
                                source,
                            };
                            match index.docs.insert(key, stored) {
                                Some(_) => (200, None),
                                None => (201, None),
                            }
                        }
                        Err(error) => (400, Some(error)),
                    }
                }
                BulkAction::Update => match index.docs.get(&key) {
                    Some(existing) => {
                        let mut merged = existing.source.clone();
                        if let Some(patch) = &item.source {
                            deep_merge(&mut merged, patch);
                        }
                        match eval::validate(&index.properties, &merged) {
                            Ok(()) => {
                                if let Some(existing) = index.docs.get_mut(&key) {
                                    existing.source = merged;
                                }
                                (200, None)
                            }
                            Err(error) => (400, Some(error)),
                        }
                    }
                    None => (
                        404,
                        Some(json!({
                            "type": "document_missing_exception",
                            "reason": "document missing",
                        })),
                    ),
                },
                // deleting a missing document is not an error
                BulkAction::Delete => match index.docs.remove(&key) {
                    Some(_) => (200, None),
                    None => (404, None),
                },
            };
            items.push(BulkItemResult {
                action: item.action,
                type_name: item.type_name.clone(),
                id: item.id.clone(),
                status,
                error,
            });
        }
        Ok(BulkResponse { took: 1, items })
    }

    #[instrument(name = "Backend<Memory>::search", skip_all, fields(index = ?request.index), err(Debug))]
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, Error> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let state = self.read()?;
        Memory::respond(&state, request, true)
    }

    #[instrument(name = "Backend<Memory>::scroll_start", skip_all, fields(index = ?request.index), err(Debug))]
    async fn scroll_start(&self, request: &SearchRequest, _keep_alive: &str) -> Result<SearchResponse, Error> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let mut response = {
            let state = self.read()?;
            Memory::respond(&state, request, false)?
        };
        let size = request.body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
        // keep everything past the first batch for later
        let rest = response.hits.hits.split_off(size.min(response.hits.hits.len()));
        let scroll_id = Uuid::new_v4().to_string();
        let scroll = MemoryScroll {
            hits: rest.into(),
            size,
            total: response.total(),
        };
        self.scrolls()?.insert(scroll_id.clone(), scroll);
        response.scroll_id = Some(scroll_id);
        Ok(response)
    }

    async fn scroll_next(&self, scroll_id: &str, _keep_alive: &str) -> Result<SearchResponse, Error> {
        let mut scrolls = self.scrolls()?;
        let scroll = scrolls.get_mut(scroll_id).ok_or_else(|| Error::Service {
            status: 404,
            kind: "search_context_missing_exception".to_owned(),
            reason: format!("No search context found for id [{scroll_id}]"),
        })?;
        let take = scroll.size.min(scroll.hits.len());
        let hits = scroll.hits.drain(..take).collect::<Vec<Hit>>();
        Ok(SearchResponse {
            took: 1,
            hits: Hits {
                total: HitsTotal::Detailed {
                    value: scroll.total,
                    relation: "eq".to_owned(),
                },
                max_score: (!hits.is_empty()).then_some(1.0),
                hits,
            },
            scroll_id: Some(scroll_id.to_owned()),
            ..SearchResponse::default()
        })
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), Error> {
        self.scrolls()?.remove(scroll_id);
        Ok(())
    }

    async fn count(&self, request: &SearchRequest) -> Result<u64, Error> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let state = self.read()?;
        Ok(Memory::find(&state, request)?.len() as u64)
    }

    #[instrument(name = "Backend<Memory>::delete_by_query", skip_all, fields(index = ?request.index), err(Debug))]
    async fn delete_by_query(&self, request: &SearchRequest) -> Result<u64, Error> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.write()?;
        // find the documents to delete
        let doomed = Memory::find(&state, request)?
            .into_iter()
            .map(|found| {
                (found.index.to_owned(), found.doc.document_id.to_owned())
            })
            .collect::<Vec<_>>();
        let deleted = doomed.len() as u64;
        for (index, key) in doomed {
            if let Some(index) = state.indexes.get_mut(&index) {
                index.docs.remove(&key);
            }
        }
        Ok(deleted)
    }
}
