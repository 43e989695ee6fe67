//! The registry of index and type definitions

use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::Error;
use crate::import::ImportOptions;

/// The name of the index journal entries are stored in
pub const JOURNAL_INDEX: &str = "sluice_journal";

/// The name of the index specifications are stored in
pub const SPECIFICATION_INDEX: &str = "sluice_specifications";

/// A document loaded from a source of records
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Document {
    /// The id of this document
    pub id: String,
    /// The body to index for this document
    pub source: Value,
}

impl Document {
    /// Create a new document
    ///
    /// # Arguments
    ///
    /// * `id` - The id of this document
    /// * `source` - The body to index
    pub fn new<T: Into<String>>(id: T, source: Value) -> Self {
        Document {
            id: id.into(),
            source,
        }
    }
}

/// A source of records for a type
#[async_trait::async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Get the ids of every record in this source
    async fn ids(&self) -> Result<Vec<String>, Error>;

    /// Load the documents for some ids
    ///
    /// Ids with no record are left out and get deleted from the index.
    ///
    /// # Arguments
    ///
    /// * `ids` - The ids to load
    async fn load(&self, ids: &[String]) -> Result<Vec<Document>, Error>;

    /// Get when each record was last updated if this source tracks that
    async fn sync_data(&self) -> Result<Option<Vec<(String, DateTime<Utc>)>>, Error> {
        Ok(None)
    }
}

/// An adapter with no records for indexes that are only written directly
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAdapter;

#[async_trait::async_trait]
impl Adapter for NullAdapter {
    async fn ids(&self) -> Result<Vec<String>, Error> {
        Ok(Vec::default())
    }

    async fn load(&self, _ids: &[String]) -> Result<Vec<Document>, Error> {
        Ok(Vec::default())
    }
}

/// The name of a type within an index (`index#type`)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey {
    /// The base name of the index
    pub index: String,
    /// The name of the type
    pub type_name: String,
}

impl TypeKey {
    /// Create a new type key
    ///
    /// # Arguments
    ///
    /// * `index` - The base name of the index
    /// * `type_name` - The name of the type
    pub fn new<I: Into<String>, T: Into<String>>(index: I, type_name: T) -> Self {
        TypeKey {
            index: index.into(),
            type_name: type_name.into(),
        }
    }
}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.type_name)
    }
}

impl FromStr for TypeKey {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('#') {
            Some((index, type_name)) if !index.is_empty() && !type_name.is_empty() => {
                Ok(TypeKey::new(index, type_name))
            }
            _ => Err(Error::new(format!("`{raw}` is not in the form index#type"))),
        }
    }
}

/// Default the field used to detect outdated documents
fn default_sync_field() -> String {
    "updated_at".to_owned()
}

/// A kind of document within an index
#[derive(Clone)]
pub struct TypeDefinition {
    /// The name of this type
    pub name: String,
    /// Where records for this type come from
    pub adapter: Arc<dyn Adapter>,
    /// The mapped properties for this type
    pub mappings: Map<String, Value>,
    /// The default options for imports of this type
    pub import_options: ImportOptions,
    /// Whether imports of this type are journaled regardless of other settings
    pub journal: Option<bool>,
    /// The field holding when a document was last updated
    pub sync_field: String,
}

impl std::fmt::Debug for TypeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TypeDefinition")
            .field("name", &self.name)
            .field("mappings", &self.mappings)
            .field("import_options", &self.import_options)
            .field("journal", &self.journal)
            .field("sync_field", &self.sync_field)
            .finish_non_exhaustive()
    }
}

impl TypeDefinition {
    /// Create a new type definition
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this type
    /// * `adapter` - Where records for this type come from
    pub fn new<T: Into<String>, A: Adapter>(name: T, adapter: A) -> Self {
        TypeDefinition {
            name: name.into(),
            adapter: Arc::new(adapter),
            mappings: Map::default(),
            import_options: ImportOptions::default(),
            journal: None,
            sync_field: default_sync_field(),
        }
    }

    /// Map a field
    ///
    /// # Arguments
    ///
    /// * `field` - The field to map
    /// * `mapping` - The mapping for this field
    #[must_use]
    pub fn field<T: Into<String>>(mut self, field: T, mapping: Value) -> Self {
        self.mappings.insert(field.into(), mapping);
        self
    }

    /// Set the default import options for this type
    #[must_use]
    pub fn import_options(mut self, options: ImportOptions) -> Self {
        self.import_options = options;
        self
    }

    /// Force journaling on or off for this type
    #[must_use]
    pub fn journal(mut self, journal: bool) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Set the field that holds when a document was last updated
    #[must_use]
    pub fn sync_field<T: Into<String>>(mut self, field: T) -> Self {
        self.sync_field = field.into();
        self
    }
}

/// A logical index and the types in it
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    /// The base name of this index
    pub name: String,
    /// The settings to create this index with
    pub settings: Value,
    /// The types in this index
    pub types: Vec<TypeDefinition>,
    /// The default options for imports into this index
    pub import_options: ImportOptions,
    /// Whether this is one of our own bookkeeping indexes
    pub system: bool,
}

impl IndexDefinition {
    /// Create a new index definition
    ///
    /// # Arguments
    ///
    /// * `name` - The base name of this index
    pub fn new<T: Into<String>>(name: T) -> Self {
        IndexDefinition {
            name: name.into(),
            settings: json!({}),
            types: Vec::default(),
            import_options: ImportOptions::default(),
            system: false,
        }
    }

    /// Set the settings for this index
    #[must_use]
    pub fn settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// Add a type to this index
    #[must_use]
    pub fn with_type(mut self, type_def: TypeDefinition) -> Self {
        self.types.push(type_def);
        self
    }

    /// Set the default import options for this index
    #[must_use]
    pub fn import_options(mut self, options: ImportOptions) -> Self {
        self.import_options = options;
        self
    }

    /// Get a type in this index
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the type to get
    pub fn type_def(&self, name: &str) -> Result<&TypeDefinition, Error> {
        self.types
            .iter()
            .find(|type_def| type_def.name == name)
            .ok_or_else(|| Error::UndefinedType {
                index: self.name.clone(),
                type_name: name.to_owned(),
            })
    }

    /// Get the keys for every type in this index
    pub fn type_keys(&self) -> Vec<TypeKey> {
        self.types
            .iter()
            .map(|type_def| TypeKey::new(&self.name, &type_def.name))
            .collect()
    }

    /// Get the mappings for this index with every type's properties merged
    pub fn mappings(&self) -> Value {
        let mut properties = Map::default();
        for type_def in &self.types {
            properties.extend(type_def.mappings.clone());
        }
        json!({ "properties": properties })
    }

    /// Get the settings and mappings this index is built from
    pub fn specification(&self) -> Value {
        json!({
            "settings": self.settings,
            "mappings": self.mappings(),
        })
    }

    /// Build the body to create this index with
    ///
    /// # Arguments
    ///
    /// * `alias` - An alias to point at the new index
    pub fn create_body(&self, alias: Option<&str>) -> Value {
        let mut body = self.specification();
        if let Some(alias) = alias {
            body["aliases"] = json!({ alias: {} });
        }
        body
    }
}

/// Build the full name of an index
///
/// Blank parts are skipped.
///
/// # Arguments
///
/// * `prefix` - The prefix for every index
/// * `base` - The base name of the index
/// * `suffix` - The version suffix of this index
pub fn index_name(prefix: &str, base: &str, suffix: Option<&str>) -> String {
    [prefix, base, suffix.unwrap_or_default()]
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<&str>>()
        .join("_")
}

/// Check that a name can be used for an index or type
///
/// # Arguments
///
/// * `kind` - What kind of name this is
/// * `name` - The name to check
fn validate_name(kind: &str, name: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::new(format!("{kind} names can not be blank")));
    }
    if name.contains(['#', ':', ' ', ',']) {
        return Err(Error::new(format!(
            "{kind} name `{name}` can not contain '#', ':', ',' or spaces"
        )));
    }
    Ok(())
}

/// The definitions for every index
#[derive(Debug, Clone)]
pub struct Registry {
    /// The index definitions by base name
    indexes: BTreeMap<String, Arc<IndexDefinition>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// Create a registry with only our bookkeeping indexes
    pub fn new() -> Self {
        let mut indexes = BTreeMap::default();
        let journal = IndexDefinition {
            system: true,
            ..IndexDefinition::new(JOURNAL_INDEX).with_type(
                TypeDefinition::new("journal", NullAdapter)
                    .field("index_name", json!({"type": "keyword"}))
                    .field("type_name", json!({"type": "keyword"}))
                    .field("action", json!({"type": "keyword"}))
                    .field("references", json!({"type": "keyword"}))
                    .field("created_at", json!({"type": "date", "format": "epoch_millis"}))
                    .journal(false),
            )
        };
        let specification = IndexDefinition {
            system: true,
            ..IndexDefinition::new(SPECIFICATION_INDEX).with_type(
                TypeDefinition::new("specification", NullAdapter)
                    .field("specification", json!({"type": "object", "enabled": false}))
                    .journal(false),
            )
        };
        indexes.insert(journal.name.clone(), Arc::new(journal));
        indexes.insert(specification.name.clone(), Arc::new(specification));
        Registry { indexes }
    }

    /// Add an index definition
    ///
    /// # Arguments
    ///
    /// * `definition` - The index to add
    pub fn register(&mut self, definition: IndexDefinition) -> Result<(), Error> {
        validate_name("Index", &definition.name)?;
        if definition.types.is_empty() {
            return Err(Error::new(format!(
                "Index `{}` must have at least one type",
                definition.name
            )));
        }
        for type_def in &definition.types {
            validate_name("Type", &type_def.name)?;
        }
        if self.indexes.contains_key(&definition.name) {
            return Err(Error::new(format!(
                "Index `{}` is already registered",
                definition.name
            )));
        }
        self.indexes
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Add an index definition while building a registry
    ///
    /// # Arguments
    ///
    /// * `definition` - The index to add
    pub fn with(mut self, definition: IndexDefinition) -> Result<Self, Error> {
        self.register(definition)?;
        Ok(self)
    }

    /// Get an index definition by name
    ///
    /// # Arguments
    ///
    /// * `name` - The base name of the index
    pub fn index(&self, name: &str) -> Result<&Arc<IndexDefinition>, Error> {
        self.indexes
            .get(name)
            .ok_or_else(|| Error::UndefinedIndex(name.to_owned()))
    }

    /// Resolve `index#type` or a single type index name to a type
    ///
    /// # Arguments
    ///
    /// * `target` - The type or index to resolve
    pub fn derive_type(&self, target: &str) -> Result<(&Arc<IndexDefinition>, TypeKey), Error> {
        match target.split_once('#') {
            Some((index, type_name)) => {
                let definition = self.index(index)?;
                definition.type_def(type_name)?;
                Ok((definition, TypeKey::new(index, type_name)))
            }
            None => {
                let definition = self.index(target)?;
                match definition.types.as_slice() {
                    [only] => Ok((definition, TypeKey::new(target, &only.name))),
                    _ => Err(Error::UnderivableType(target.to_owned())),
                }
            }
        }
    }

    /// Resolve `index#type` or an index name to every type it refers to
    ///
    /// # Arguments
    ///
    /// * `target` - The type or index to resolve
    pub fn derive_types(&self, target: &str) -> Result<Vec<TypeKey>, Error> {
        if target.contains('#') {
            let (_, key) = self.derive_type(target)?;
            return Ok(vec![key]);
        }
        Ok(self.index(target)?.type_keys())
    }

    /// Get a type definition by its key
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the type
    pub fn type_def(&self, key: &TypeKey) -> Result<&TypeDefinition, Error> {
        self.index(&key.index)?.type_def(&key.type_name)
    }

    /// Iterate over the user defined indexes in name order
    pub fn indexes(&self) -> impl Iterator<Item = &Arc<IndexDefinition>> {
        self.indexes.values().filter(|definition| !definition.system)
    }

    /// Iterate over every index including our bookkeeping indexes
    pub fn all(&self) -> impl Iterator<Item = &Arc<IndexDefinition>> {
        self.indexes.values()
    }
}
