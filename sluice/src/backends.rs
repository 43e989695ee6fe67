//! The search services that indexes live in

use serde_derive::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::Error;
use crate::conf::ClusterStatus;
use crate::search::{SearchOptions, SearchResponse};

mod elastic;
mod memory;

pub use elastic::Elastic;
pub use memory::Memory;

/// Build the id a document is stored under in an index
///
/// Every type in an index shares one id space so record ids are prefixed with
/// their type (`city#1`). Raw `ids` queries match against these ids.
///
/// # Arguments
///
/// * `type_name` - The type of the document
/// * `id` - The id of the record the document was built from
pub fn document_id(type_name: &str, id: &str) -> String {
    format!("{type_name}#{id}")
}

/// Split a stored document id back into its type and record id
///
/// # Arguments
///
/// * `document_id` - The stored id to split
pub fn split_document_id(document_id: &str) -> Option<(&str, &str)> {
    // type names can't contain a '#' so the first one ends the type
    document_id.split_once('#')
}

/// The action to take on a single document in a bulk request
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    /// Write a full document
    Index,
    /// Merge a partial document into an existing one
    Update,
    /// Delete a document
    Delete,
}

impl BulkAction {
    /// Get this action as a str
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Update => "update",
            BulkAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for BulkAction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single document operation in a bulk request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BulkItem {
    /// The action to take
    pub action: BulkAction,
    /// The type of document this is
    pub type_name: String,
    /// The id of the document
    pub id: String,
    /// The document or partial document to write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
}

impl BulkItem {
    /// Get the id this item is stored under
    pub fn document_id(&self) -> String {
        document_id(&self.type_name, &self.id)
    }

    /// Build the action line for this item
    pub fn action_line(&self) -> Value {
        json!({ self.action.as_str(): { "_id": self.document_id() } })
    }

    /// Build the document line for this item if it has one
    pub fn document_line(&self) -> Option<Value> {
        match (&self.action, &self.source) {
            (BulkAction::Index, Some(source)) => Some(source.clone()),
            (BulkAction::Update, Some(source)) => Some(json!({ "doc": source })),
            _ => None,
        }
    }

    /// Get the serialized size of this item in bytes including newlines
    pub fn serialized_size(&self) -> usize {
        // get the size of our action line
        let action = self.action_line().to_string().len() + 1;
        // add the size of our document line if we have one
        match self.document_line() {
            Some(doc) => action + doc.to_string().len() + 1,
            None => action,
        }
    }
}

/// A bulk request against a single index
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BulkRequest {
    /// The index or alias to write to
    pub index: String,
    /// The operations to apply
    pub items: Vec<BulkItem>,
    /// Whether to refresh the index once these operations are applied
    #[serde(default)]
    pub refresh: bool,
}

/// The result of a single operation in a bulk request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    /// The action that was taken
    pub action: BulkAction,
    /// The type of document this was
    pub type_name: String,
    /// The id of the document
    pub id: String,
    /// The status code for this operation
    pub status: u16,
    /// The error for this operation if it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// The response to a bulk request
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    /// How long this request took in ms
    pub took: u64,
    /// The results for each operation in the order they were sent
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    /// Check if any operation in this response failed
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|item| item.error.is_some())
    }
}

/// A change to apply to the aliases in a search service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AliasAction {
    /// Point an alias at an index
    Add { index: String, alias: String },
    /// Stop pointing an alias at an index
    Remove { index: String, alias: String },
}

/// The types a search may return from a single index
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TypeScope {
    /// The index or alias these types live in
    pub index: String,
    /// The types to return from this index
    pub types: Vec<String>,
}

/// A search against one or more indexes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// The indexes or aliases to search
    pub index: Vec<String>,
    /// The types to return from each index or nothing to return every type
    #[serde(default)]
    pub scopes: Vec<TypeScope>,
    /// The body of this search
    pub body: Value,
    /// The options to send next to the body
    #[serde(flatten)]
    pub options: SearchOptions,
}

/// A search service that can hold indexes
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The name of this backend
    fn name(&self) -> &'static str;

    /// Check if an index or alias exists
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the index or alias to check
    async fn index_exists(&self, name: &str) -> Result<bool, Error>;

    /// Create a new index
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the index to create
    /// * `body` - The settings, mappings and aliases to create it with
    async fn create_index(&self, name: &str, body: &Value) -> Result<(), Error>;

    /// Delete indexes
    ///
    /// # Arguments
    ///
    /// * `names` - The names of the indexes to delete
    async fn delete_indexes(&self, names: &[String]) -> Result<(), Error>;

    /// Get the aliases for the indexes an index or alias name resolves to
    ///
    /// Missing indexes resolve to an empty map.
    ///
    /// # Arguments
    ///
    /// * `name` - The index or alias to resolve
    async fn get_aliases(&self, name: &str) -> Result<BTreeMap<String, Vec<String>>, Error>;

    /// Atomically apply a list of alias changes
    ///
    /// # Arguments
    ///
    /// * `actions` - The alias changes to apply
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), Error>;

    /// Update the settings for an index
    ///
    /// # Arguments
    ///
    /// * `index` - The index to update
    /// * `settings` - The settings to apply
    async fn put_settings(&self, index: &str, settings: &Value) -> Result<(), Error>;

    /// Make recent changes to indexes searchable
    ///
    /// # Arguments
    ///
    /// * `indexes` - The indexes to refresh
    async fn refresh(&self, indexes: &[String]) -> Result<(), Error>;

    /// Wait for the cluster to reach a status
    ///
    /// # Arguments
    ///
    /// * `status` - The status to wait for
    async fn wait_for_status(&self, status: ClusterStatus) -> Result<(), Error>;

    /// Apply a list of operations to an index
    ///
    /// # Arguments
    ///
    /// * `request` - The bulk request to send
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse, Error>;

    /// Search for documents
    ///
    /// # Arguments
    ///
    /// * `request` - The search to execute
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, Error>;

    /// Start scrolling through every document matching a search
    ///
    /// The response holds the first batch and the id to get the next batch with.
    ///
    /// # Arguments
    ///
    /// * `request` - The search to scroll through
    /// * `keep_alive` - How long to keep the scroll open between batches (`1m`)
    async fn scroll_start(&self, request: &SearchRequest, keep_alive: &str) -> Result<SearchResponse, Error>;

    /// Get the next batch of an open scroll
    ///
    /// # Arguments
    ///
    /// * `scroll_id` - The scroll to get the next batch for
    /// * `keep_alive` - How long to keep the scroll open after this batch
    async fn scroll_next(&self, scroll_id: &str, keep_alive: &str) -> Result<SearchResponse, Error>;

    /// Close an open scroll
    ///
    /// # Arguments
    ///
    /// * `scroll_id` - The scroll to close
    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), Error>;

    /// Count the documents matching a search
    ///
    /// # Arguments
    ///
    /// * `request` - The search to count hits for
    async fn count(&self, request: &SearchRequest) -> Result<u64, Error>;

    /// Delete the documents matching a search
    ///
    /// # Arguments
    ///
    /// * `request` - The search to delete hits for
    async fn delete_by_query(&self, request: &SearchRequest) -> Result<u64, Error>;
}
