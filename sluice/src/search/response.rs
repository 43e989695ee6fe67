//! The responses returned by searches

use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The total number of documents that hit
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum HitsTotal {
    /// A plain count
    Count(u64),
    /// A count with how exact it is
    Detailed { value: u64, relation: String },
}

impl Default for HitsTotal {
    fn default() -> Self {
        HitsTotal::Count(0)
    }
}

impl HitsTotal {
    /// Get the total number of hits
    pub fn value(&self) -> u64 {
        match self {
            HitsTotal::Count(value) | HitsTotal::Detailed { value, .. } => *value,
        }
    }
}

/// A single document that hit
#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq)]
pub struct Hit {
    /// The id of this document
    #[serde(alias = "_id")]
    pub id: String,
    /// The physical index this document came from
    #[serde(alias = "_index")]
    pub index: String,
    /// The type of this document
    #[serde(alias = "_type", default)]
    pub type_name: String,
    /// The score for this document
    #[serde(alias = "_score", default)]
    pub score: Option<f64>,
    /// The document itself
    #[serde(alias = "_source", default)]
    pub source: Value,
    /// Any highlighted fragments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<Value>,
    /// Any computed script fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// The sort values for this document
    #[serde(default)]
    pub sort: Vec<Value>,
}

/// The documents that hit on a search
#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq)]
pub struct Hits {
    /// The total number of documents that hit
    #[serde(default)]
    pub total: HitsTotal,
    /// The max score of a single document that was returned
    #[serde(default)]
    pub max_score: Option<f64>,
    /// The documents that were returned
    #[serde(default)]
    pub hits: Vec<Hit>,
}

/// A response to a search
#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq)]
pub struct SearchResponse {
    /// How long this search took in ms
    #[serde(default)]
    pub took: u64,
    /// Whether this search timed out and returned partial results
    #[serde(default)]
    pub timed_out: bool,
    /// The documents that hit
    #[serde(default)]
    pub hits: Hits,
    /// The computed aggregations
    #[serde(default)]
    pub aggregations: Map<String, Value>,
    /// The suggestions that were found
    #[serde(default)]
    pub suggest: Map<String, Value>,
    /// The scroll to get the next batch of hits from
    #[serde(rename = "_scroll_id", default, skip_serializing_if = "Option::is_none")]
    pub scroll_id: Option<String>,
}

impl SearchResponse {
    /// Get the total number of documents that hit
    pub fn total(&self) -> u64 {
        self.hits.total.value()
    }
}
