//! The modes used to join query and filter clauses together

use serde_derive::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;

use crate::Error;

/// A raw mode as it appears in configs and serialized criteria
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum RawMode {
    /// An integer minimum should match
    Int(i64),
    /// A float tie breaker
    Float(f64),
    /// A named mode or a percentage
    Str(String),
}

/// Build the minimum should match value to send
///
/// # Arguments
///
/// * `raw` - The minimum should match value to cast
fn minimum_should_match(raw: &str) -> Value {
    // integers are sent as numbers and everything else as is
    match raw.parse::<i64>() {
        Ok(count) => json!(count),
        Err(_) => json!(raw),
    }
}

/// How multiple query clauses are combined
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "RawMode", into = "RawMode")]
pub enum QueryMode {
    /// All queries must match
    Must,
    /// Any query should match
    Should,
    /// No query may match
    MustNot,
    /// Use the best scoring query
    DisMax,
    /// Use the best scoring query with a tie breaker for the others
    TieBreaker(f64),
    /// Some number or percentage of the queries should match
    MinimumShouldMatch(String),
}

impl Default for QueryMode {
    /// Queries must all match by default
    fn default() -> Self {
        QueryMode::Must
    }
}

impl QueryMode {
    /// Join a list of query clauses into one clause
    ///
    /// A single clause is used as is unless this is `MustNot`.
    ///
    /// # Arguments
    ///
    /// * `queries` - The queries to join
    pub fn join(&self, queries: &[Value]) -> Option<Value> {
        // a single query does not need to be wrapped
        if queries.is_empty() || (queries.len() == 1 && *self != QueryMode::MustNot) {
            return queries.first().cloned();
        }
        let joined = match self {
            QueryMode::Must => json!({"bool": {"must": queries}}),
            QueryMode::Should => json!({"bool": {"should": queries}}),
            QueryMode::MustNot => json!({"bool": {"must_not": queries}}),
            QueryMode::DisMax => json!({"dis_max": {"queries": queries}}),
            QueryMode::TieBreaker(tie_breaker) => {
                json!({"dis_max": {"queries": queries, "tie_breaker": tie_breaker}})
            }
            QueryMode::MinimumShouldMatch(raw) => json!({
                "bool": {"should": queries, "minimum_should_match": minimum_should_match(raw)}
            }),
        };
        Some(joined)
    }
}

impl FromStr for QueryMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "must" => Ok(QueryMode::Must),
            "should" => Ok(QueryMode::Should),
            "must_not" => Ok(QueryMode::MustNot),
            "dis_max" => Ok(QueryMode::DisMax),
            _ if raw.parse::<i64>().is_ok() || raw.ends_with('%') => {
                Ok(QueryMode::MinimumShouldMatch(raw.to_owned()))
            }
            // floats are tie breakers
            _ => match raw.parse::<f64>() {
                Ok(tie_breaker) => Ok(QueryMode::TieBreaker(tie_breaker)),
                Err(_) => Err(Error::new(format!("Unknown query mode `{raw}`"))),
            },
        }
    }
}

impl TryFrom<RawMode> for QueryMode {
    type Error = Error;

    fn try_from(raw: RawMode) -> Result<Self, Self::Error> {
        match raw {
            RawMode::Int(count) => Ok(QueryMode::MinimumShouldMatch(count.to_string())),
            RawMode::Float(tie_breaker) => Ok(QueryMode::TieBreaker(tie_breaker)),
            RawMode::Str(raw) => QueryMode::from_str(&raw),
        }
    }
}

impl From<QueryMode> for RawMode {
    fn from(mode: QueryMode) -> Self {
        match mode {
            QueryMode::Must => RawMode::Str("must".to_owned()),
            QueryMode::Should => RawMode::Str("should".to_owned()),
            QueryMode::MustNot => RawMode::Str("must_not".to_owned()),
            QueryMode::DisMax => RawMode::Str("dis_max".to_owned()),
            QueryMode::TieBreaker(tie_breaker) => RawMode::Float(tie_breaker),
            QueryMode::MinimumShouldMatch(raw) => RawMode::Str(raw),
        }
    }
}

/// How multiple filter clauses are combined
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "RawMode", into = "RawMode")]
pub enum FilterMode {
    /// Every filter must match
    And,
    /// Any filter may match
    Or,
    /// Every filter must match as a scoring query
    Must,
    /// Any filter should match as a scoring query
    Should,
    /// No filter may match
    MustNot,
    /// Some number or percentage of the filters should match
    MinimumShouldMatch(String),
}

impl Default for FilterMode {
    /// Filters are all required by default
    fn default() -> Self {
        FilterMode::And
    }
}

impl FilterMode {
    /// Join a list of filter clauses into one clause
    ///
    /// # Arguments
    ///
    /// * `filters` - The filters to join
    pub fn join(&self, filters: &[Value]) -> Option<Value> {
        // a single filter does not need to be wrapped
        if filters.is_empty() || (filters.len() == 1 && *self != FilterMode::MustNot) {
            return filters.first().cloned();
        }
        let joined = match self {
            FilterMode::And => json!({"bool": {"filter": filters}}),
            FilterMode::Or => json!({"bool": {"should": filters, "minimum_should_match": 1}}),
            FilterMode::Must => json!({"bool": {"must": filters}}),
            FilterMode::Should => json!({"bool": {"should": filters}}),
            FilterMode::MustNot => json!({"bool": {"must_not": filters}}),
            FilterMode::MinimumShouldMatch(raw) => json!({
                "bool": {"should": filters, "minimum_should_match": minimum_should_match(raw)}
            }),
        };
        Some(joined)
    }
}

impl FromStr for FilterMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "and" => Ok(FilterMode::And),
            "or" => Ok(FilterMode::Or),
            "must" => Ok(FilterMode::Must),
            "should" => Ok(FilterMode::Should),
            "must_not" => Ok(FilterMode::MustNot),
            _ if raw.parse::<i64>().is_ok() || raw.ends_with('%') => {
                Ok(FilterMode::MinimumShouldMatch(raw.to_owned()))
            }
            _ => Err(Error::new(format!("Unknown filter mode `{raw}`"))),
        }
    }
}

impl TryFrom<RawMode> for FilterMode {
    type Error = Error;

    fn try_from(raw: RawMode) -> Result<Self, Self::Error> {
        match raw {
            RawMode::Int(count) => Ok(FilterMode::MinimumShouldMatch(count.to_string())),
            RawMode::Float(value) => Err(Error::new(format!(
                "Tie breakers ({value}) are only supported for queries"
            ))),
            RawMode::Str(raw) => FilterMode::from_str(&raw),
        }
    }
}

impl From<FilterMode> for RawMode {
    fn from(mode: FilterMode) -> Self {
        match mode {
            FilterMode::And => RawMode::Str("and".to_owned()),
            FilterMode::Or => RawMode::Str("or".to_owned()),
            FilterMode::Must => RawMode::Str("must".to_owned()),
            FilterMode::Should => RawMode::Str("should".to_owned()),
            FilterMode::MustNot => RawMode::Str("must_not".to_owned()),
            FilterMode::MinimumShouldMatch(raw) => RawMode::Str(raw),
        }
    }
}
