//! Support talking to elastic

use elasticsearch::auth::Credentials;
use elasticsearch::cert::CertificateValidation;
use elasticsearch::cluster::ClusterHealthParts;
use elasticsearch::http::request::JsonBody;
use elasticsearch::http::response::Response;
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesGetAliasParts,
    IndicesPutSettingsParts, IndicesRefreshParts,
};
use elasticsearch::params::{Refresh, SearchType, WaitForStatus};
use elasticsearch::{
    BulkParts, ClearScrollParts, CountParts, DeleteByQueryParts, Elasticsearch, ScrollParts,
    SearchParts,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{Level, event, instrument};
use url::Url;

use super::{
    AliasAction, Backend, BulkAction, BulkItemResult, BulkRequest, BulkResponse, SearchRequest,
    TypeScope, split_document_id,
};
use crate::Error;
use crate::conf::{self, ClusterStatus};
use crate::import::chunk_items;
use crate::search::SearchResponse;

/// The field each document's type is stored in
pub const TYPE_FIELD: &str = "sluice_type";

/// The maximum size of a single bulk request body in bytes
const MAX_BODY_SIZE: usize = 1024 * 1024 * 1000;

/// Check a response for errors and cast it to JSON
///
/// # Arguments
///
/// * `resp` - The response to check
async fn check(resp: Response) -> Result<Value, Error> {
    let status = resp.status_code();
    // get the body of our response
    let body = resp.json::<Value>().await?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(Error::service(status.as_u16(), &body))
    }
}

/// Build a filter that only lets the scoped types through for each index
///
/// # Arguments
///
/// * `scopes` - The types to allow in each index
fn scope_filter(scopes: &[TypeScope]) -> Option<Value> {
    if scopes.is_empty() {
        return None;
    }
    let clauses = scopes
        .iter()
        .map(|scope| {
            json!({"bool": {"filter": [
                {"term": {"_index": scope.index}},
                {"terms": { TYPE_FIELD: scope.types }},
            ]}})
        })
        .collect::<Vec<Value>>();
    Some(json!({"bool": {"should": clauses, "minimum_should_match": 1}}))
}

/// Restrict a query to the types a search is scoped to
///
/// # Arguments
///
/// * `query` - The query to restrict
/// * `scopes` - The types to allow in each index
fn restrict_types(query: Option<&Value>, scopes: &[TypeScope]) -> Option<Value> {
    let Some(filter) = scope_filter(scopes) else {
        return query.cloned();
    };
    Some(json!({
        "bool": {
            "must": query.cloned().unwrap_or_else(|| json!({"match_all": {}})),
            "filter": filter,
        }
    }))
}

/// Build the body for a search with its types applied
///
/// # Arguments
///
/// * `request` - The search to build a body for
fn typed_body(request: &SearchRequest) -> Value {
    let mut body = request.body.clone();
    if let Value::Object(map) = &mut body {
        if let Some(query) = restrict_types(map.get("query"), &request.scopes) {
            map.insert("query".to_owned(), query);
        }
        // totals are capped at 10k unless we ask for exact ones
        map.entry("track_total_hits").or_insert(json!(true));
    }
    body
}

/// Cast a raw search response and split our stored ids back into types and ids
///
/// # Arguments
///
/// * `raw` - The raw search response
fn parse_search(raw: Value) -> Result<SearchResponse, Error> {
    let mut response: SearchResponse = serde_json::from_value(raw)?;
    for hit in &mut response.hits.hits {
        let tagged = hit
            .source
            .as_object_mut()
            .and_then(|source| source.remove(TYPE_FIELD));
        let split = split_document_id(&hit.id).map(|(type_name, id)| (type_name.to_owned(), id.to_owned()));
        match (split, tagged) {
            (Some((type_name, id)), _) => {
                hit.type_name = type_name;
                hit.id = id;
            }
            // documents written by something else only have their type field
            (None, Some(Value::String(type_name))) => hit.type_name = type_name,
            (None, _) => (),
        }
    }
    Ok(response)
}

/// An elastic cluster
#[derive(Clone)]
pub struct Elastic {
    /// The elastic client to use
    elastic: Elasticsearch,
}

impl Elastic {
    /// Create a new Elastic backend
    ///
    /// # Arguments
    ///
    /// * `conf` - The elastic settings to use
    pub fn new(conf: &conf::Elastic) -> Result<Self, Error> {
        // we can only support a single node connection pool
        let url = Url::parse(&conf.node)?;
        // build our connection pool
        let pool = SingleNodeConnectionPool::new(url);
        // build our transport object for elastic
        let transport = TransportBuilder::new(pool)
            .auth(Credentials::Basic(
                conf.username.clone(),
                conf.password.clone(),
            ))
            .cert_validation(CertificateValidation::None)
            .timeout(Duration::from_secs(conf.timeout))
            .build()?;
        // build our elastic client
        let elastic = Elasticsearch::new(transport);
        Ok(Elastic { elastic })
    }

    /// Send a search optionally opening a scroll
    ///
    /// # Arguments
    ///
    /// * `request` - The search to send
    /// * `scroll` - How long to keep a scroll open for if we are scrolling
    async fn send_search(&self, request: &SearchRequest, scroll: Option<&str>) -> Result<SearchResponse, Error> {
        let index = request.index.iter().map(String::as_str).collect::<Vec<&str>>();
        let mut builder = self
            .elastic
            .search(SearchParts::Index(&index))
            .body(typed_body(request));
        if let Some(preference) = &request.options.preference {
            builder = builder.preference(preference);
        }
        if let Some(search_type) = &request.options.search_type {
            let search_type = match search_type.as_str() {
                "query_then_fetch" => SearchType::QueryThenFetch,
                "dfs_query_then_fetch" => SearchType::DfsQueryThenFetch,
                other => return Err(Error::new(format!("Unsupported search type `{other}`"))),
            };
            builder = builder.search_type(search_type);
        }
        if let Some(scroll) = scroll {
            builder = builder.scroll(scroll);
        }
        let resp = builder.send().await?;
        parse_search(check(resp).await?)
    }

    /// Send a single chunk of bulk operations
    ///
    /// # Arguments
    ///
    /// * `request` - The request the items come from
    /// * `items` - The operations to send
    async fn bulk_chunk(
        &self,
        request: &BulkRequest,
        items: &[super::BulkItem],
    ) -> Result<BulkResponse, Error> {
        // convert our items to json bodies
        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(items.len() * 2);
        for item in items {
            body.push(item.action_line().into());
            match (&item.action, &item.source) {
                (BulkAction::Index, Some(source)) => {
                    // tag each document with its type
                    let mut source = source.clone();
                    if let Value::Object(map) = &mut source {
                        map.insert(TYPE_FIELD.to_owned(), json!(item.type_name));
                    }
                    body.push(source.into());
                }
                (BulkAction::Update, Some(source)) => body.push(json!({ "doc": source }).into()),
                _ => (),
            }
        }
        let refresh = if request.refresh {
            Refresh::True
        } else {
            Refresh::False
        };
        let resp = self
            .elastic
            .bulk(BulkParts::Index(&request.index))
            .body(body)
            .refresh(refresh)
            // data can be very large and may take awhile
            .request_timeout(Duration::from_secs(120))
            .send()
            .await?;
        let raw = check(resp).await?;
        // pair each result back up with the item it was for
        let results = raw
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::new("malformed elastic bulk response: missing items"))?;
        if results.len() != items.len() {
            return Err(Error::new(format!(
                "malformed elastic bulk response: sent {} items but got {} results",
                items.len(),
                results.len()
            )));
        }
        let items = items
            .iter()
            .zip(results)
            .map(|(item, result)| {
                let result = result.get(item.action.as_str()).unwrap_or(result);
                BulkItemResult {
                    action: item.action,
                    type_name: item.type_name.clone(),
                    id: item.id.clone(),
                    status: result.get("status").and_then(Value::as_u64).unwrap_or(500) as u16,
                    error: result.get("error").cloned(),
                }
            })
            .collect();
        Ok(BulkResponse {
            took: raw.get("took").and_then(Value::as_u64).unwrap_or_default(),
            items,
        })
    }
}

#[async_trait::async_trait]
impl Backend for Elastic {
    fn name(&self) -> &'static str {
        "Elastic"
    }

    #[instrument(name = "Backend<Elastic>::index_exists", skip(self), err(Debug))]
    async fn index_exists(&self, name: &str) -> Result<bool, Error> {
        let resp = self
            .elastic
            .indices()
            .exists(IndicesExistsParts::Index(&[name]))
            .send()
            .await?;
        Ok(resp.status_code().is_success())
    }

    #[instrument(name = "Backend<Elastic>::create_index", skip(self, body), err(Debug))]
    async fn create_index(&self, name: &str, body: &Value) -> Result<(), Error> {
        // map our type field on every index
        let mut body = body.clone();
        body["mappings"]["properties"][TYPE_FIELD] = json!({"type": "keyword"});
        let resp = self
            .elastic
            .indices()
            .create(IndicesCreateParts::Index(name))
            .body(body)
            .send()
            .await?;
        check(resp).await?;
        event!(Level::INFO, msg = "Index created successfully", index = name);
        Ok(())
    }

    #[instrument(name = "Backend<Elastic>::delete_indexes", skip(self), err(Debug))]
    async fn delete_indexes(&self, names: &[String]) -> Result<(), Error> {
        let names = names.iter().map(String::as_str).collect::<Vec<&str>>();
        let resp = self
            .elastic
            .indices()
            .delete(IndicesDeleteParts::Index(&names))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    #[instrument(name = "Backend<Elastic>::get_aliases", skip(self), err(Debug))]
    async fn get_aliases(&self, name: &str) -> Result<BTreeMap<String, Vec<String>>, Error> {
        let resp = self
            .elastic
            .indices()
            .get_alias(IndicesGetAliasParts::Index(&[name]))
            .send()
            .await?;
        // missing indexes have no aliases
        if resp.status_code().as_u16() == 404 {
            return Ok(BTreeMap::default());
        }
        let raw = check(resp).await?;
        let mut aliases = BTreeMap::default();
        if let Value::Object(indexes) = raw {
            for (index, info) in indexes {
                let names = info
                    .get("aliases")
                    .and_then(Value::as_object)
                    .map(|names| names.keys().cloned().collect())
                    .unwrap_or_default();
                aliases.insert(index, names);
            }
        }
        Ok(aliases)
    }

    #[instrument(name = "Backend<Elastic>::update_aliases", skip_all, err(Debug))]
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), Error> {
        let resp = self
            .elastic
            .indices()
            .update_aliases()
            .body(json!({ "actions": actions }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    #[instrument(name = "Backend<Elastic>::put_settings", skip(self, settings), err(Debug))]
    async fn put_settings(&self, index: &str, settings: &Value) -> Result<(), Error> {
        let resp = self
            .elastic
            .indices()
            .put_settings(IndicesPutSettingsParts::Index(&[index]))
            .body(settings.clone())
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    #[instrument(name = "Backend<Elastic>::refresh", skip(self), err(Debug))]
    async fn refresh(&self, indexes: &[String]) -> Result<(), Error> {
        let indexes = indexes.iter().map(String::as_str).collect::<Vec<&str>>();
        let resp = self
            .elastic
            .indices()
            .refresh(IndicesRefreshParts::Index(&indexes))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    #[instrument(name = "Backend<Elastic>::wait_for_status", skip(self), err(Debug))]
    async fn wait_for_status(&self, status: ClusterStatus) -> Result<(), Error> {
        let status = match status {
            ClusterStatus::Green => WaitForStatus::Green,
            ClusterStatus::Yellow => WaitForStatus::Yellow,
            ClusterStatus::Red => WaitForStatus::Red,
        };
        let resp = self
            .elastic
            .cluster()
            .health(ClusterHealthParts::None)
            .wait_for_status(status)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    #[instrument(name = "Backend<Elastic>::bulk", skip_all, fields(index = %request.index, items = request.items.len()), err(Debug))]
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse, Error> {
        let mut response = BulkResponse::default();
        // ensure there are actually documents to send, otherwise just return
        if request.items.is_empty() {
            return Ok(response);
        }
        // chunk the docs into request bodies of reasonable size
        for chunk in chunk_items(&request.items, MAX_BODY_SIZE) {
            let chunk_response = self.bulk_chunk(request, chunk).await?;
            response.took += chunk_response.took;
            response.items.extend(chunk_response.items);
        }
        Ok(response)
    }

    #[instrument(name = "Backend<Elastic>::search", skip_all, fields(index = ?request.index), err(Debug))]
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, Error> {
        self.send_search(request, None).await
    }

    #[instrument(name = "Backend<Elastic>::scroll_start", skip_all, fields(index = ?request.index), err(Debug))]
    async fn scroll_start(&self, request: &SearchRequest, keep_alive: &str) -> Result<SearchResponse, Error> {
        self.send_search(request, Some(keep_alive)).await
    }

    #[instrument(name = "Backend<Elastic>::scroll_next", skip_all, err(Debug))]
    async fn scroll_next(&self, scroll_id: &str, keep_alive: &str) -> Result<SearchResponse, Error> {
        let resp = self
            .elastic
            .scroll(ScrollParts::None)
            .body(json!({"scroll": keep_alive, "scroll_id": scroll_id}))
            .send()
            .await?;
        parse_search(check(resp).await?)
    }

    #[instrument(name = "Backend<Elastic>::clear_scroll", skip_all, err(Debug))]
    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), Error> {
        let resp = self
            .elastic
            .clear_scroll(ClearScrollParts::None)
            .body(json!({"scroll_id": [scroll_id]}))
            .send()
            .await?;
        // scrolls that already expired are already cleared
        if resp.status_code().as_u16() == 404 {
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }

    #[instrument(name = "Backend<Elastic>::count", skip_all, fields(index = ?request.index), err(Debug))]
    async fn count(&self, request: &SearchRequest) -> Result<u64, Error> {
        let index = request.index.iter().map(String::as_str).collect::<Vec<&str>>();
        let query = restrict_types(request.body.get("query"), &request.scopes)
            .unwrap_or_else(|| json!({"match_all": {}}));
        let resp = self
            .elastic
            .count(CountParts::Index(&index))
            .body(json!({ "query": query }))
            .send()
            .await?;
        let raw = check(resp).await?;
        Ok(raw.get("count").and_then(Value::as_u64).unwrap_or_default())
    }

    #[instrument(name = "Backend<Elastic>::delete_by_query", skip_all, fields(index = ?request.index), err(Debug))]
    async fn delete_by_query(&self, request: &SearchRequest) -> Result<u64, Error> {
        let index = request.index.iter().map(String::as_str).collect::<Vec<&str>>();
        let query = restrict_types(request.body.get("query"), &request.scopes)
            .unwrap_or_else(|| json!({"match_all": {}}));
        let resp = self
            .elastic
            .delete_by_query(DeleteByQueryParts::Index(&index))
            .body(json!({ "query": query }))
            .send()
            .await?;
        let raw = check(resp).await?;
        Ok(raw.get("deleted").and_then(Value::as_u64).unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scopes_pair_indexes_with_types() {
        let scopes = vec![
            TypeScope {
                index: "places".to_owned(),
                types: vec!["country".to_owned()],
            },
            TypeScope {
                index: "cities".to_owned(),
                types: vec!["city".to_owned()],
            },
        ];
        let query = restrict_types(None, &scopes).unwrap();
        assert_eq!(query["bool"]["must"], json!({"match_all": {}}));
        assert_eq!(
            query["bool"]["filter"]["bool"]["should"][0],
            json!({"bool": {"filter": [
                {"term": {"_index": "places"}},
                {"terms": {"sluice_type": ["country"]}},
            ]}})
        );
        assert_eq!(restrict_types(Some(&json!({"match_all": {}})), &[]), Some(json!({"match_all": {}})));
    }

    #[test]
    fn hits_are_split_back_into_types() {
        let raw = json!({
            "took": 3,
            "hits": {"total": {"value": 2, "relation": "eq"}, "hits": [
                {"_id": "country#1", "_index": "places_v1", "_source": {"name": "Spain", "sluice_type": "country"}},
                {"_id": "7", "_index": "other", "_source": {"sluice_type": "city"}},
            ]},
            "_scroll_id": "abc",
        });
        let response = parse_search(raw).unwrap();
        let hits = &response.hits.hits;
        assert_eq!((hits[0].type_name.as_str(), hits[0].id.as_str()), ("country", "1"));
        assert_eq!(hits[0].source, json!({"name": "Spain"}));
        assert_eq!((hits[1].type_name.as_str(), hits[1].id.as_str()), ("city", "7"));
        assert_eq!(response.scroll_id.as_deref(), Some("abc"));
    }
}
