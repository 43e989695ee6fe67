//! The accumulated description of a search that has not been sent yet

use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::modes::{FilterMode, QueryMode};
use crate::conf::SearchDefaults;

/// The per criteria modes used when compiling a search
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CriteriaModes {
    /// How queries are joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryMode>,
    /// How filters are joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterMode>,
    /// How post filters are joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_filter: Option<FilterMode>,
    /// How function scores are combined with the query score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost_mode: Option<String>,
    /// How function scores are combined with each other
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_mode: Option<String>,
}

/// The options sent next to the body of a search
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    /// The shard preference for this search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<String>,
    /// The search type for this search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_type: Option<String>,
}

/// A compiled search without its target indexes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompiledSearch {
    /// The body to send
    pub body: Value,
    /// The options to send next to the body
    #[serde(flatten)]
    pub options: SearchOptions,
}

/// Flatten a sort value into single field sort terms
///
/// # Arguments
///
/// * `value` - The sort value to flatten
/// * `sort` - The list to add sort terms to
fn flatten_sort(value: Value, sort: &mut Vec<Value>) {
    match value {
        Value::Null => (),
        Value::Array(values) => values.into_iter().for_each(|value| flatten_sort(value, sort)),
        // each key in a map is its own sort term
        Value::Object(map) => map
            .into_iter()
            .for_each(|(field, order)| sort.push(json!({ field: order }))),
        other => sort.push(other),
    }
}

/// Add values to a list while skipping any that are already in it
///
/// # Arguments
///
/// * `list` - The list to extend
/// * `values` - The values to add
fn extend_unique(list: &mut Vec<String>, values: impl IntoIterator<Item = String>) {
    for value in values {
        if !list.contains(&value) {
            list.push(value);
        }
    }
}

/// Build a score function with the shared function options applied
///
/// # Arguments
///
/// * `function` - The score function body
/// * `options` - The filter and weight options to merge in
fn score_function(mut function: Map<String, Value>, options: Value) -> Value {
    if let Value::Object(options) = options {
        function.extend(options);
    }
    Value::Object(function)
}

/// How the where clauses of two criteria are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    /// Both clauses must match
    And,
    /// Either clause may match
    Or,
    /// Our clause must match and theirs must not
    Not,
}

impl Combinator {
    /// Combine two joined clauses
    ///
    /// # Arguments
    ///
    /// * `mine` - Our joined clause
    /// * `theirs` - The other criteria's joined clause
    fn combine(self, mine: Option<Value>, theirs: Option<Value>) -> Option<Value> {
        match (self, mine, theirs) {
            (_, mine, None) => mine,
            (Combinator::Not, None, Some(theirs)) => Some(json!({"bool": {"must_not": [theirs]}})),
            (_, None, Some(theirs)) => Some(theirs),
            (Combinator::And, Some(mine), Some(theirs)) => Some(json!({"bool": {"must": [mine, theirs]}})),
            (Combinator::Or, Some(mine), Some(theirs)) => Some(json!({"bool": {"should": [mine, theirs]}})),
            (Combinator::Not, Some(mine), Some(theirs)) => {
                Some(json!({"bool": {"must": [mine], "must_not": [theirs]}}))
            }
        }
    }
}

/// The accumulated parts of a search request
///
/// Every builder method consumes the criteria and returns the updated copy.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    /// The query clauses to join
    #[serde(default)]
    pub queries: Vec<Value>,
    /// The filter clauses to join
    #[serde(default)]
    pub filters: Vec<Value>,
    /// The post filter clauses to join
    #[serde(default)]
    pub post_filters: Vec<Value>,
    /// The sort terms in order
    #[serde(default)]
    pub sort: Vec<Value>,
    /// The source fields to return
    #[serde(default)]
    pub fields: Vec<String>,
    /// The source fields to leave out
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Whether to skip returning sources at all
    #[serde(default)]
    pub no_source: bool,
    /// The types to restrict this search to
    #[serde(default)]
    pub types: Vec<String>,
    /// The function score functions
    #[serde(default)]
    pub scores: Vec<Value>,
    /// The aggregations to compute
    #[serde(default)]
    pub aggregations: Map<String, Value>,
    /// The suggesters to run
    #[serde(default)]
    pub suggest: Map<String, Value>,
    /// The script fields to compute
    #[serde(default)]
    pub script_fields: Map<String, Value>,
    /// Options set directly on the body (size, from, highlight, ...)
    #[serde(default)]
    pub request_options: Map<String, Value>,
    /// Options sent next to the body
    #[serde(default)]
    pub search_options: SearchOptions,
    /// The modes to compile with
    #[serde(default)]
    pub modes: CriteriaModes,
    /// Whether this search can never return anything
    #[serde(default)]
    pub none: bool,
}

impl Criteria {
    /// Add a query clause
    ///
    /// # Arguments
    ///
    /// * `clause` - The query clause to add
    #[must_use]
    pub fn query(mut self, clause: Value) -> Self {
        if !clause.is_null() {
            self.queries.push(clause);
        }
        self
    }

    /// Add a filter clause
    ///
    /// # Arguments
    ///
    /// * `clause` - The filter clause to add
    #[must_use]
    pub fn filter(mut self, clause: Value) -> Self {
        if !clause.is_null() {
            self.filters.push(clause);
        }
        self
    }

    /// Add a post filter clause
    ///
    /// # Arguments
    ///
    /// * `clause` - The post filter clause to add
    #[must_use]
    pub fn post_filter(mut self, clause: Value) -> Self {
        if !clause.is_null() {
            self.post_filters.push(clause);
        }
        self
    }

    /// Set how queries are joined
    #[must_use]
    pub fn query_mode(mut self, mode: QueryMode) -> Self {
        self.modes.query = Some(mode);
        self
    }

    /// Set how filters are joined
    #[must_use]
    pub fn filter_mode(mut self, mode: FilterMode) -> Self {
        self.modes.filter = Some(mode);
        self
    }

    /// Set how post filters are joined
    #[must_use]
    pub fn post_filter_mode(mut self, mode: FilterMode) -> Self {
        self.modes.post_filter = Some(mode);
        self
    }

    /// Set how function scores are combined with the query score
    #[must_use]
    pub fn boost_mode<T: Into<String>>(mut self, mode: T) -> Self {
        self.modes.boost_mode = Some(mode.into());
        self
    }

    /// Set how function scores are combined with each other
    #[must_use]
    pub fn score_mode<T: Into<String>>(mut self, mode: T) -> Self {
        self.modes.score_mode = Some(mode.into());
        self
    }

    /// Append sort terms
    ///
    /// Strings sort by a field, maps are split into one term per key and
    /// arrays are flattened.
    ///
    /// # Arguments
    ///
    /// * `value` - The sort terms to add
    #[must_use]
    pub fn order(mut self, value: Value) -> Self {
        flatten_sort(value, &mut self.sort);
        self
    }

    /// Replace all sort terms
    ///
    /// # Arguments
    ///
    /// * `value` - The sort terms to use
    #[must_use]
    pub fn reorder(mut self, value: Value) -> Self {
        self.sort.clear();
        self.order(value)
    }

    /// Set a raw request option on the body
    ///
    /// # Arguments
    ///
    /// * `key` - The body key to set
    /// * `value` - The value to set
    #[must_use]
    pub fn request_option<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.request_options.insert(key.into(), value);
        self
    }

    /// Limit the number of hits returned
    #[must_use]
    pub fn limit(self, size: u64) -> Self {
        self.request_option("size", json!(size))
    }

    /// Skip some number of hits
    #[must_use]
    pub fn offset(self, from: u64) -> Self {
        self.request_option("from", json!(from))
    }

    /// Set how long the search service may spend on this search (`10s`, `500ms`)
    #[must_use]
    pub fn timeout<T: Into<String>>(self, timeout: T) -> Self {
        self.request_option("timeout", Value::String(timeout.into()))
    }

    /// Ask the search service to explain how each hit was scored
    #[must_use]
    pub fn explain(self, explain: bool) -> Self {
        self.request_option("explain", json!(explain))
    }

    /// Set the highlighting settings
    #[must_use]
    pub fn highlight(self, highlight: Value) -> Self {
        self.request_option("highlight", highlight)
    }

    /// Set the rescoring settings
    #[must_use]
    pub fn rescore(self, rescore: Value) -> Self {
        self.request_option("rescore", rescore)
    }

    /// Drop any hits scored below this
    #[must_use]
    pub fn min_score(self, min_score: f64) -> Self {
        self.request_option("min_score", json!(min_score))
    }

    /// Compute scores even when sorting on a field
    #[must_use]
    pub fn track_scores(self, track_scores: bool) -> Self {
        self.request_option("track_scores", json!(track_scores))
    }

    /// Only return hits that sort after these values
    ///
    /// # Arguments
    ///
    /// * `values` - The sort values of the last hit already seen
    #[must_use]
    pub fn search_after(self, values: Vec<Value>) -> Self {
        self.request_option("search_after", Value::Array(values))
    }

    /// Set whether the exact number of hits is tracked
    #[must_use]
    pub fn track_total_hits(self, track: bool) -> Self {
        self.request_option("track_total_hits", json!(track))
    }

    /// Get the limit that is set if any
    pub fn size(&self) -> Option<u64> {
        self.request_options.get("size").and_then(Value::as_u64)
    }

    /// Get the offset that is set if any
    pub fn from(&self) -> Option<u64> {
        self.request_options.get("from").and_then(Value::as_u64)
    }

    /// Set the shard preference
    #[must_use]
    pub fn preference<T: Into<String>>(mut self, preference: T) -> Self {
        self.search_options.preference = Some(preference.into());
        self
    }

    /// Set the search type
    #[must_use]
    pub fn search_type<T: Into<String>>(mut self, search_type: T) -> Self {
        self.search_options.search_type = Some(search_type.into());
        self
    }

    /// Add source fields to return
    ///
    /// # Arguments
    ///
    /// * `fields` - The fields to add
    #[must_use]
    pub fn only<I, T>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        extend_unique(&mut self.fields, fields.into_iter().map(Into::into));
        self
    }

    /// Replace the source fields to return
    ///
    /// # Arguments
    ///
    /// * `fields` - The fields to return
    #[must_use]
    pub fn only_exactly<I, T>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.fields.clear();
        self.only(fields)
    }

    /// Add source fields to leave out
    ///
    /// # Arguments
    ///
    /// * `fields` - The fields to leave out
    #[must_use]
    pub fn exclude<I, T>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        extend_unique(&mut self.excludes, fields.into_iter().map(Into::into));
        self
    }

    /// Skip returning sources entirely
    #[must_use]
    pub fn no_source(mut self) -> Self {
        self.no_source = true;
        self
    }

    /// Add types to restrict this search to
    ///
    /// # Arguments
    ///
    /// * `types` - The type names to add
    #[must_use]
    pub fn types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        extend_unique(&mut self.types, types.into_iter().map(Into::into));
        self
    }

    /// Replace the types to restrict this search to
    ///
    /// # Arguments
    ///
    /// * `types` - The type names to use
    #[must_use]
    pub fn types_exactly<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.types.clear();
        self.types(types)
    }

    /// Add a raw function score function
    ///
    /// # Arguments
    ///
    /// * `function` - The function to add
    #[must_use]
    pub fn score(mut self, function: Value) -> Self {
        if !function.is_null() {
            self.scores.push(function);
        }
        self
    }

    /// Score documents with a script
    ///
    /// # Arguments
    ///
    /// * `script` - The script source to score with
    /// * `options` - Extra options like `params`, `filter` or `weight`
    #[must_use]
    pub fn script_score<T: Into<String>>(self, script: T, options: Value) -> Self {
        // params belong to the script while everything else is a function option
        let mut options = match options {
            Value::Object(options) => options,
            _ => Map::default(),
        };
        let mut script = json!({"source": script.into()});
        if let Some(params) = options.remove("params") {
            script["params"] = params;
        }
        let mut function = Map::default();
        function.insert("script_score".to_owned(), json!({ "script": script }));
        self.score(score_function(function, Value::Object(options)))
    }

    /// Boost the score of documents by a constant factor
    ///
    /// Factors are truncated to integers.
    ///
    /// # Arguments
    ///
    /// * `factor` - The factor to boost by
    /// * `options` - Extra options like `filter`
    #[must_use]
    pub fn boost_factor(self, factor: f64, options: Value) -> Self {
        self.weight(factor, options)
    }

    /// Weight the score of documents by a constant factor
    ///
    /// # Arguments
    ///
    /// * `factor` - The weight to apply
    /// * `options` - Extra options like `filter`
    #[must_use]
    pub fn weight(self, factor: f64, options: Value) -> Self {
        let mut function = Map::default();
        function.insert("weight".to_owned(), json!(factor.trunc() as i64));
        self.score(score_function(function, options))
    }

    /// Randomize the score of documents
    ///
    /// # Arguments
    ///
    /// * `seed` - The seed to randomize with
    /// * `options` - Extra options like `filter` or `weight`
    #[must_use]
    pub fn random_score(self, seed: i64, options: Value) -> Self {
        let mut function = Map::default();
        function.insert(
            "random_score".to_owned(),
            json!({"seed": seed, "field": "_seq_no"}),
        );
        self.score(score_function(function, options))
    }

    /// Score documents using a field value
    ///
    /// # Arguments
    ///
    /// * `settings` - The field value factor settings
    /// * `options` - Extra options like `filter` or `weight`
    #[must_use]
    pub fn field_value_factor(self, settings: Value, options: Value) -> Self {
        let mut function = Map::default();
        function.insert("field_value_factor".to_owned(), settings);
        self.score(score_function(function, options))
    }

    /// Decay the score of documents by their distance from an origin
    ///
    /// # Arguments
    ///
    /// * `function` - The decay function to use (gauss, exp, linear)
    /// * `field` - The field to decay on
    /// * `options` - `origin`, `scale`, `offset` and `decay` along with any
    ///   function options
    #[must_use]
    pub fn decay(self, function: &str, field: &str, options: Value) -> Self {
        let mut options = match options {
            Value::Object(options) => options,
            _ => Map::default(),
        };
        // pull out the settings for the field itself
        let mut field_options = Map::default();
        for key in ["origin", "scale", "offset", "decay"] {
            if let Some(value) = options.remove(key).filter(|value| !value.is_null()) {
                field_options.insert(key.to_owned(), value);
            }
        }
        let mut decay = Map::default();
        decay.insert(field.to_owned(), Value::Object(field_options));
        let mut body = Map::default();
        body.insert(function.to_owned(), Value::Object(decay));
        self.score(score_function(body, Value::Object(options)))
    }

    /// Merge in named aggregations
    ///
    /// # Arguments
    ///
    /// * `aggregations` - A map of aggregation names to definitions
    #[must_use]
    pub fn aggregations(mut self, aggregations: Value) -> Self {
        if let Value::Object(aggregations) = aggregations {
            self.aggregations.extend(aggregations);
        }
        self
    }

    /// Merge in named suggesters
    ///
    /// # Arguments
    ///
    /// * `suggest` - A map of suggester names to definitions
    #[must_use]
    pub fn suggest(mut self, suggest: Value) -> Self {
        if let Value::Object(suggest) = suggest {
            self.suggest.extend(suggest);
        }
        self
    }

    /// Merge in script fields
    ///
    /// # Arguments
    ///
    /// * `script_fields` - A map of field names to scripts
    #[must_use]
    pub fn script_fields(mut self, script_fields: Value) -> Self {
        if let Value::Object(script_fields) = script_fields {
            self.script_fields.extend(script_fields);
        }
        self
    }

    /// Mark this criteria as never matching anything
    #[must_use]
    pub fn none(mut self) -> Self {
        self.none = true;
        self
    }

    /// Merge another criteria into this one
    ///
    /// Lists are concatenated, maps are merged and set values in `other` win.
    ///
    /// # Arguments
    ///
    /// * `other` - The criteria to merge in
    #[must_use]
    pub fn merge(mut self, other: &Criteria) -> Self {
        self.queries.extend(other.queries.iter().cloned());
        self.filters.extend(other.filters.iter().cloned());
        self.post_filters.extend(other.post_filters.iter().cloned());
        self.sort.extend(other.sort.iter().cloned());
        self.scores.extend(other.scores.iter().cloned());
        extend_unique(&mut self.fields, other.fields.iter().cloned());
        extend_unique(&mut self.excludes, other.excludes.iter().cloned());
        extend_unique(&mut self.types, other.types.iter().cloned());
        self.no_source |= other.no_source;
        self.aggregations.extend(other.aggregations.clone());
        self.suggest.extend(other.suggest.clone());
        self.script_fields.extend(other.script_fields.clone());
        self.request_options.extend(other.request_options.clone());
        // merge any options that are set in the other criteria
        if other.search_options.preference.is_some() {
            self.search_options.preference = other.search_options.preference.clone();
        }
        if other.search_options.search_type.is_some() {
            self.search_options.search_type = other.search_options.search_type.clone();
        }
        if other.modes.query.is_some() {
            self.modes.query = other.modes.query.clone();
        }
        if other.modes.filter.is_some() {
            self.modes.filter = other.modes.filter.clone();
        }
        if other.modes.post_filter.is_some() {
            self.modes.post_filter = other.modes.post_filter.clone();
        }
        if other.modes.boost_mode.is_some() {
            self.modes.boost_mode = other.modes.boost_mode.clone();
        }
        if other.modes.score_mode.is_some() {
            self.modes.score_mode = other.modes.score_mode.clone();
        }
        self.none |= other.none;
        self
    }

    /// Combine our query, filter and post filter with another criteria's
    ///
    /// Everything else is kept from this criteria.
    ///
    /// # Arguments
    ///
    /// * `other` - The criteria to combine with
    /// * `combinator` - How to combine each clause
    /// * `defaults` - The modes to join clauses with when none are set
    fn combine(mut self, other: &Criteria, combinator: Combinator, defaults: &SearchDefaults) -> Self {
        let (query, filter, post_filter) = match combinator {
            Combinator::And if self.none || other.none => return self.none(),
            // a criteria that matches nothing takes nothing away
            Combinator::Or | Combinator::Not if other.none => return self,
            Combinator::Not if self.none => return self,
            Combinator::Or if self.none => (
                other.joined_query(defaults),
                other.joined_filter(defaults),
                other.joined_post_filter(defaults),
            ),
            _ => (
                combinator.combine(self.joined_query(defaults), other.joined_query(defaults)),
                combinator.combine(self.joined_filter(defaults), other.joined_filter(defaults)),
                combinator.combine(
                    self.joined_post_filter(defaults),
                    other.joined_post_filter(defaults),
                ),
            ),
        };
        self.none = false;
        // each part is now a single clause
        self.queries = query.into_iter().collect();
        self.filters = filter.into_iter().collect();
        self.post_filters = post_filter.into_iter().collect();
        self.modes.query = Some(QueryMode::Must);
        self.modes.filter = Some(FilterMode::And);
        self.modes.post_filter = Some(FilterMode::And);
        self
    }

    /// Require both our where clauses and another criteria's to match
    ///
    /// # Arguments
    ///
    /// * `other` - The criteria to combine with
    /// * `defaults` - The modes to join clauses with when none are set
    #[must_use]
    pub fn and(self, other: &Criteria, defaults: &SearchDefaults) -> Self {
        self.combine(other, Combinator::And, defaults)
    }

    /// Allow either our where clauses or another criteria's to match
    ///
    /// # Arguments
    ///
    /// * `other` - The criteria to combine with
    /// * `defaults` - The modes to join clauses with when none are set
    #[must_use]
    pub fn or(self, other: &Criteria, defaults: &SearchDefaults) -> Self {
        self.combine(other, Combinator::Or, defaults)
    }

    /// Require our where clauses to match and another criteria's to not match
    ///
    /// # Arguments
    ///
    /// * `other` - The criteria to combine with
    /// * `defaults` - The modes to join clauses with when none are set
    #[must_use]
    pub fn not(self, other: &Criteria, defaults: &SearchDefaults) -> Self {
        self.combine(other, Combinator::Not, defaults)
    }

    /// Build the `_source` setting if one is needed
    fn compile_source(&self) -> Option<Value> {
        if self.no_source {
            return Some(Value::Bool(false));
        }
        match (self.fields.is_empty(), self.excludes.is_empty()) {
            (true, true) => None,
            (false, true) => Some(json!(self.fields)),
            (true, false) => Some(json!({"excludes": self.excludes})),
            (false, false) => Some(json!({"includes": self.fields, "excludes": self.excludes})),
        }
    }

    /// Get the joined query clause
    ///
    /// # Arguments
    ///
    /// * `defaults` - The modes to use when this criteria sets none
    pub fn joined_query(&self, defaults: &SearchDefaults) -> Option<Value> {
        let mode = self.modes.query.as_ref().unwrap_or(&defaults.query_mode);
        mode.join(&self.queries)
    }

    /// Get the joined filter clause
    ///
    /// # Arguments
    ///
    /// * `defaults` - The modes to use when this criteria sets none
    pub fn joined_filter(&self, defaults: &SearchDefaults) -> Option<Value> {
        let mode = self.modes.filter.as_ref().unwrap_or(&defaults.filter_mode);
        mode.join(&self.filters)
    }

    /// Get the joined post filter clause
    ///
    /// # Arguments
    ///
    /// * `defaults` - The modes to use when this criteria sets none
    pub fn joined_post_filter(&self, defaults: &SearchDefaults) -> Option<Value> {
        // post filters fall back to the filter mode
        let mode = self
            .modes
            .post_filter
            .as_ref()
            .or(defaults.post_filter_mode.as_ref())
            .or(self.modes.filter.as_ref())
            .unwrap_or(&defaults.filter_mode);
        mode.join(&self.post_filters)
    }

    /// Build the query part of the body
    ///
    /// # Arguments
    ///
    /// * `defaults` - The modes to use when this criteria sets none
    fn compile_query(&self, defaults: &SearchDefaults) -> Option<Value> {
        // a vacuous search matches nothing
        if self.none {
            return Some(json!({"match_none": {}}));
        }
        let query = self.joined_query(defaults);
        // combine our query and filters
        let query = match (query, self.joined_filter(defaults)) {
            (query, Some(filter)) => Some(json!({
                "bool": {
                    "must": query.unwrap_or_else(|| json!({"match_all": {}})),
                    "filter": filter,
                }
            })),
            (query, None) => query,
        };
        // wrap our query with any score functions
        if self.scores.is_empty() {
            return query;
        }
        let mut function_score = Map::default();
        function_score.insert("functions".to_owned(), Value::Array(self.scores.clone()));
        if let Some(query) = query {
            function_score.insert("query".to_owned(), query);
        }
        if let Some(boost_mode) = &self.modes.boost_mode {
            function_score.insert("boost_mode".to_owned(), json!(boost_mode));
        }
        if let Some(score_mode) = &self.modes.score_mode {
            function_score.insert("score_mode".to_owned(), json!(score_mode));
        }
        Some(json!({ "function_score": function_score }))
    }

    /// Compile this criteria into a search body and its options
    ///
    /// # Arguments
    ///
    /// * `defaults` - The modes to use when this criteria sets none
    pub fn compile(&self, defaults: &SearchDefaults) -> CompiledSearch {
        let mut body = Map::default();
        if let Some(query) = self.compile_query(defaults) {
            body.insert("query".to_owned(), query);
        }
        if let Some(post_filter) = self.joined_post_filter(defaults) {
            body.insert("post_filter".to_owned(), post_filter);
        }
        if !self.aggregations.is_empty() {
            body.insert(
                "aggregations".to_owned(),
                Value::Object(self.aggregations.clone()),
            );
        }
        if !self.suggest.is_empty() {
            body.insert("suggest".to_owned(), Value::Object(self.suggest.clone()));
        }
        if !self.sort.is_empty() {
            body.insert("sort".to_owned(), Value::Array(self.sort.clone()));
        }
        if let Some(source) = self.compile_source() {
            body.insert("_source".to_owned(), source);
        }
        if !self.script_fields.is_empty() {
            body.insert(
                "script_fields".to_owned(),
                Value::Object(self.script_fields.clone()),
            );
        }
        // request options are set last
        body.extend(self.request_options.clone());
        CompiledSearch {
            body: Value::Object(body),
            options: self.search_options.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn order_flattens() {
        let criteria = Criteria::default()
            .order(json!("name"))
            .order(json!([{"age": "desc"}, "rating"]))
            .order(json!({"a": "asc", "b": {"order": "desc"}}));
        assert_eq!(
            criteria.sort,
            vec![
                json!("name"),
                json!({"age": "desc"}),
                json!("rating"),
                json!({"a": "asc"}),
                json!({"b": {"order": "desc"}}),
            ]
        );
        let criteria = criteria.reorder(json!("age"));
        assert_eq!(criteria.sort, vec![json!("age")]);
    }

    #[test]
    fn only_and_types_dedupe() {
        let criteria = Criteria::default()
            .only(["name", "age"])
            .only(["age", "rating"])
            .types(["city"])
            .types(["city", "country"]);
        assert_eq!(criteria.fields, vec!["name", "age", "rating"]);
        assert_eq!(criteria.types, vec!["city", "country"]);
        let criteria = criteria.only_exactly(["id"]).types_exactly(["country"]);
        assert_eq!(criteria.fields, vec!["id"]);
        assert_eq!(criteria.types, vec!["country"]);
    }

    #[test]
    fn compiles_pagination() {
        let compiled = Criteria::default().limit(100).offset(300).compile(&SearchDefaults::default());
        assert_eq!(compiled.body, json!({"size": 100, "from": 300}));
    }

    #[test]
    fn compiles_filters_with_match_all() {
        let compiled = Criteria::default()
            .filter(json!({"term": {"name": "Johny"}}))
            .compile(&SearchDefaults::default());
        assert_eq!(
            compiled.body,
            json!({"query": {"bool": {
                "must": {"match_all": {}},
                "filter": {"term": {"name": "Johny"}}
            }}})
        );
    }

    #[test]
    fn compiles_scores() {
        let compiled = Criteria::default()
            .query(json!({"match": {"name": "Moscow"}}))
            .boost_factor(5.7, json!({"filter": {"term": {"rating": 5}}}))
            .script_score("doc['rating'].value", json!({"params": {"a": 1}}))
            .decay("gauss", "age", json!({"origin": 30, "scale": 5, "decay": null}))
            .boost_mode("sum")
            .compile(&SearchDefaults::default());
        assert_eq!(
            compiled.body,
            json!({"query": {"function_score": {
                "query": {"match": {"name": "Moscow"}},
                "functions": [
                    {"weight": 5, "filter": {"term": {"rating": 5}}},
                    {"script_score": {"script": {"source": "doc['rating'].value", "params": {"a": 1}}}},
                    {"gauss": {"age": {"origin": 30, "scale": 5}}}
                ],
                "boost_mode": "sum"
            }}})
        );
    }

    #[test]
    fn compiles_search_options() {
        let compiled = Criteria::default()
            .preference("_local")
            .search_type("dfs_query_then_fetch")
            .only(["name"])
            .post_filter(json!({"term": {"age": 1}}))
            .post_filter(json!({"term": {"age": 2}}))
            .filter_mode(FilterMode::Or)
            .compile(&SearchDefaults::default());
        assert_eq!(compiled.options.preference.as_deref(), Some("_local"));
        assert_eq!(
            compiled.options.search_type.as_deref(),
            Some("dfs_query_then_fetch")
        );
        assert_eq!(compiled.body["_source"], json!(["name"]));
        // post filters fall back to the filter mode
        assert_eq!(
            compiled.body["post_filter"],
            json!({"bool": {"should": [{"term": {"age": 1}}, {"term": {"age": 2}}], "minimum_should_match": 1}})
        );
    }

    #[test]
    fn compiles_source_filters() {
        let defaults = SearchDefaults::default();
        let compiled = Criteria::default().exclude(["population"]).compile(&defaults);
        assert_eq!(compiled.body["_source"], json!({"excludes": ["population"]}));
        let compiled = Criteria::default()
            .only(["name", "rating"])
            .exclude(["rating"])
            .compile(&defaults);
        assert_eq!(
            compiled.body["_source"],
            json!({"includes": ["name", "rating"], "excludes": ["rating"]})
        );
        let compiled = Criteria::default().only(["name"]).no_source().compile(&defaults);
        assert_eq!(compiled.body["_source"], json!(false));
    }

    #[test]
    fn combines_where_clauses() {
        let defaults = SearchDefaults::default();
        let first = Criteria::default()
            .filter(json!({"term": {"name": "Moscow"}}))
            .query(json!({"match": {"name": "London"}}))
            .limit(5);
        let second = Criteria::default()
            .filter(json!({"term": {"name": "Berlin"}}))
            .query(json!({"match": {"name": "Washington"}}))
            .limit(20);
        let and = first.clone().and(&second, &defaults).compile(&defaults);
        assert_eq!(
            and.body["query"],
            json!({"bool": {
                "must": {"bool": {"must": [{"match": {"name": "London"}}, {"match": {"name": "Washington"}}]}},
                "filter": {"bool": {"must": [{"term": {"name": "Moscow"}}, {"term": {"name": "Berlin"}}]}}
            }})
        );
        // everything but the where clauses comes from the first criteria
        assert_eq!(and.body["size"], json!(5));
        let or = first.clone().or(&second, &defaults).compile(&defaults);
        assert_eq!(
            or.body["query"]["bool"]["filter"],
            json!({"bool": {"should": [{"term": {"name": "Moscow"}}, {"term": {"name": "Berlin"}}]}})
        );
        let not = first.clone().not(&second, &defaults).compile(&defaults);
        assert_eq!(
            not.body["query"]["bool"]["filter"],
            json!({"bool": {"must": [{"term": {"name": "Moscow"}}], "must_not": [{"term": {"name": "Berlin"}}]}})
        );
        // an empty side leaves the other untouched
        let only_post = Criteria::default().post_filter(json!({"term": {"age": 1}}));
        let and = first.and(&only_post, &defaults).compile(&defaults);
        assert_eq!(and.body["post_filter"], json!({"term": {"age": 1}}));
    }

    #[test]
    fn combines_with_none() {
        let defaults = SearchDefaults::default();
        let some = Criteria::default().filter(json!({"term": {"name": "Moscow"}}));
        let none = Criteria::default().none();
        assert!(some.clone().and(&none, &defaults).none);
        assert_eq!(some.clone().or(&none, &defaults), some);
        assert_eq!(some.clone().not(&none, &defaults), some);
        let either = none.or(&some, &defaults);
        assert!(!either.none);
        assert_eq!(either.filters, vec![json!({"term": {"name": "Moscow"}})]);
    }

    #[test]
    fn none_compiles_to_match_none() {
        let compiled = Criteria::default()
            .query(json!({"match_all": {}}))
            .none()
            .compile(&SearchDefaults::default());
        assert_eq!(compiled.body["query"], json!({"match_none": {}}));
    }
}
