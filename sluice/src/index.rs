//! Actions on registered indexes and the types within them

use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{Level, event, instrument};

mod specification;

pub use specification::Specification;

use crate::backends::AliasAction;
use crate::import::{ImportOptions, ImportReport, ImportSource, Importer};
use crate::journal::JournalApplyReport;
use crate::registry::{IndexDefinition, TypeDefinition, TypeKey};
use crate::search::Query;
use crate::{Error, Sluice};

/// The options for resetting an index
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResetOptions {
    /// The options to import with
    #[serde(default)]
    pub import: ImportOptions,
    /// Whether to replay changes journaled while a new index was being built
    #[serde(default = "default_apply_journal")]
    pub apply_journal: bool,
    /// Disable refreshing the new index while importing into it
    #[serde(default)]
    pub disable_refresh_interval: Option<bool>,
    /// Drop replicas on the new index while importing into it
    #[serde(default)]
    pub no_replicas: Option<bool>,
}

/// Default to applying the journal after a reset
fn default_apply_journal() -> bool {
    true
}

impl Default for ResetOptions {
    fn default() -> Self {
        ResetOptions {
            import: ImportOptions::default(),
            apply_journal: default_apply_journal(),
            disable_refresh_interval: None,
            no_replicas: None,
        }
    }
}

/// The outcome of resetting an index
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResetReport {
    /// The physical index that now holds our data
    pub index: String,
    /// The old physical indexes that were swapped out
    pub replaced: Vec<String>,
    /// The results of importing each type
    pub imports: Vec<ImportReport>,
    /// The result of replaying the journal if it was replayed
    pub journal: Option<JournalApplyReport>,
}

impl ResetReport {
    /// Check if every import in this reset succeeded
    pub fn is_success(&self) -> bool {
        self.imports.iter().all(ImportReport::is_success)
    }
}

/// A handle to a registered index
#[derive(Clone)]
pub struct IndexHandle {
    /// The sluice client to use
    sluice: Sluice,
    /// The definition of this index
    definition: Arc<IndexDefinition>,
}

impl IndexHandle {
    /// Create a new index handle
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to use
    /// * `definition` - The definition of this index
    pub(crate) fn new(sluice: Sluice, definition: Arc<IndexDefinition>) -> Self {
        IndexHandle { sluice, definition }
    }

    /// Get the definition for this index
    pub fn definition(&self) -> &Arc<IndexDefinition> {
        &self.definition
    }

    /// Get the full name of this index or one of its versions
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version of this index to get a name for
    pub fn index_name(&self, suffix: Option<&str>) -> String {
        self.sluice.index_name(&self.definition.name, suffix)
    }

    /// Get a handle to one of this index's types
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the type
    pub fn type_handle(&self, name: &str) -> Result<TypeHandle, Error> {
        let type_def = self.definition.type_def(name)?;
        Ok(TypeHandle {
            sluice: self.sluice.clone(),
            index: self.definition.clone(),
            key: TypeKey::new(&self.definition.name, &type_def.name),
        })
    }

    /// Get handles to every type in this index
    pub fn type_handles(&self) -> Vec<TypeHandle> {
        self.definition
            .type_keys()
            .into_iter()
            .map(|key| TypeHandle {
                sluice: self.sluice.clone(),
                index: self.definition.clone(),
                key,
            })
            .collect()
    }

    /// Get a handle to this index's stored specification
    pub fn specification(&self) -> Specification {
        Specification::new(self.sluice.clone(), self.definition.clone())
    }

    /// Start a query against this index
    pub fn query(&self) -> Query {
        Query::new(self.sluice.clone(), vec![self.definition.name.clone()], Vec::default())
    }

    /// Check if this index exists
    pub async fn exists(&self) -> Result<bool, Error> {
        self.sluice.backend.index_exists(&self.index_name(None)).await
    }

    /// Create this index or a version of it
    ///
    /// A version is aliased to the index's base name unless `alias` is false.
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version of this index to create
    /// * `alias` - Whether to alias a version to the base name
    #[instrument(name = "IndexHandle::create_strict", skip(self), fields(index = self.definition.name), err(Debug))]
    pub async fn create_strict(&self, suffix: Option<&str>, alias: bool) -> Result<(), Error> {
        let general = self.index_name(None);
        let name = self.index_name(suffix);
        // only alias versions of this index
        let alias = (alias && name != general).then_some(general.as_str());
        let body = self.definition.create_body(alias);
        self.sluice.backend.create_index(&name, &body).await?;
        // wait for the cluster to settle if we were asked to
        if let Some(status) = self.sluice.conf.wait_for_status {
            self.sluice.backend.wait_for_status(status).await?;
        }
        event!(Level::INFO, msg = "Created index", index = name, alias);
        Ok(())
    }

    /// Create this index or a version of it
    ///
    /// Returns false if the search service rejected the index.
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version of this index to create
    /// * `alias` - Whether to alias a version to the base name
    pub async fn create(&self, suffix: Option<&str>, alias: bool) -> Result<bool, Error> {
        match self.create_strict(suffix, alias).await {
            Ok(()) => Ok(true),
            Err(Error::Service { status: 400, .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Create this index if it doesn't already exist
    pub async fn ensure_exists(&self) -> Result<(), Error> {
        if !self.exists().await? {
            self.create(None, true).await?;
        }
        Ok(())
    }

    /// Get the physical names of this index or one of its versions
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version of this index
    async fn physical(&self, suffix: Option<&str>) -> Result<Vec<String>, Error> {
        let aliases = self.sluice.backend.get_aliases(&self.index_name(suffix)).await?;
        Ok(aliases.into_keys().collect())
    }

    /// Delete this index or a version of it
    ///
    /// Deleting the base name deletes every version behind it.
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version of this index to delete
    #[instrument(name = "IndexHandle::delete_strict", skip(self), fields(index = self.definition.name), err(Debug))]
    pub async fn delete_strict(&self, suffix: Option<&str>) -> Result<(), Error> {
        let name = self.index_name(suffix);
        let physical = self.physical(suffix).await?;
        if physical.is_empty() {
            return Err(Error::index_missing(&name));
        }
        self.sluice.backend.delete_indexes(&physical).await?;
        event!(Level::INFO, msg = "Deleted index", index = name, physical = ?physical);
        Ok(())
    }

    /// Delete this index or a version of it
    ///
    /// Returns false if the index did not exist.
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version of this index to delete
    pub async fn delete(&self, suffix: Option<&str>) -> Result<bool, Error> {
        match self.delete_strict(suffix).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_index_missing() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Delete this index and create it again empty
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version to create
    pub async fn purge(&self, suffix: Option<&str>) -> Result<(), Error> {
        self.delete(None).await?;
        // an old version may still be around under this suffix
        if suffix.is_some() {
            self.delete(suffix).await?;
        }
        self.create_strict(suffix, true).await
    }

    /// Get the physical indexes behind this index's alias
    pub async fn indexes(&self) -> Result<Vec<String>, Error> {
        let general = self.index_name(None);
        Ok(self
            .physical(None)
            .await?
            .into_iter()
            .filter(|name| name != &general)
            .collect())
    }

    /// Get any other aliases pointing at this index
    pub async fn aliases(&self) -> Result<Vec<String>, Error> {
        let general = self.index_name(None);
        let aliases = self.sluice.backend.get_aliases(&general).await?;
        let mut found = aliases
            .into_values()
            .flatten()
            .filter(|alias| alias != &general)
            .collect::<Vec<String>>();
        found.sort();
        found.dedup();
        Ok(found)
    }

    /// Import every type in this index
    ///
    /// # Arguments
    ///
    /// * `options` - The options to import with
    pub async fn import(&self, options: &ImportOptions) -> Result<Vec<ImportReport>, Error> {
        let mut reports = Vec::with_capacity(self.definition.types.len());
        for handle in self.type_handles() {
            reports.push(handle.import(ImportSource::All, options).await?);
        }
        Ok(reports)
    }

    /// Import every type in this index and fail if any documents failed
    ///
    /// # Arguments
    ///
    /// * `options` - The options to import with
    pub async fn import_strict(&self, options: &ImportOptions) -> Result<Vec<ImportReport>, Error> {
        let reports = self.import(options).await?;
        if let Some(failed) = reports.iter().find(|report| !report.is_success()) {
            return Err(Error::ImportFailed(Box::new(failed.clone())));
        }
        Ok(reports)
    }

    /// Build the settings to use while bulk loading a new index
    ///
    /// # Arguments
    ///
    /// * `options` - The options for this reset
    fn loading_settings(&self, options: &ResetOptions) -> (Option<Value>, Option<Value>) {
        let conf = &self.sluice.conf.reset;
        let disable_refresh = options
            .disable_refresh_interval
            .unwrap_or(conf.disable_refresh_interval);
        let no_replicas = options.no_replicas.unwrap_or(conf.no_replicas);
        let mut loading = serde_json::Map::default();
        let mut restore = serde_json::Map::default();
        let configured = &self.definition.settings["index"];
        if disable_refresh {
            loading.insert("refresh_interval".to_owned(), json!("-1"));
            restore.insert(
                "refresh_interval".to_owned(),
                configured
                    .get("refresh_interval")
                    .cloned()
                    .unwrap_or_else(|| json!("1s")),
            );
        }
        if no_replicas {
            loading.insert("number_of_replicas".to_owned(), json!(0));
            restore.insert(
                "number_of_replicas".to_owned(),
                configured
                    .get("number_of_replicas")
                    .cloned()
                    .unwrap_or_else(|| json!(1)),
            );
        }
        if loading.is_empty() {
            return (None, None);
        }
        (
            Some(json!({ "index": loading })),
            Some(json!({ "index": restore })),
        )
    }

    /// Rebuild this index from its sources
    ///
    /// With a suffix and an existing aliased version, the new version is built
    /// next to the old one and the alias is swapped once it is loaded.
    /// Otherwise the index is purged and imported in place.
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version to build
    /// * `options` - The options for this reset
    #[instrument(name = "IndexHandle::reset", skip(self, options), fields(index = self.definition.name), err(Debug))]
    pub async fn reset(&self, suffix: Option<&str>, options: &ResetOptions) -> Result<ResetReport, Error> {
        let old = match suffix {
            Some(_) => self.indexes().await?,
            None => Vec::default(),
        };
        let report = match suffix {
            Some(suffix) if !old.is_empty() => self.swap(suffix, old, options).await?,
            _ => {
                self.purge(suffix).await?;
                let import = options.import.clone().suffix_opt(suffix);
                ResetReport {
                    index: self.index_name(suffix),
                    replaced: Vec::default(),
                    imports: self.import(&import).await?,
                    journal: None,
                }
            }
        };
        self.specification().lock().await?;
        Ok(report)
    }

    /// Build a new version of this index and swap our alias over to it
    ///
    /// # Arguments
    ///
    /// * `suffix` - The version to build
    /// * `old` - The versions our alias currently points at
    /// * `options` - The options for this reset
    async fn swap(&self, suffix: &str, old: Vec<String>, options: &ResetOptions) -> Result<ResetReport, Error> {
        // entries are stored in millis so step back one to keep any from this instant
        let started = Utc::now() - chrono::Duration::milliseconds(1);
        let general = self.index_name(None);
        let name = self.index_name(Some(suffix));
        self.create_strict(Some(suffix), false).await?;
        let (loading, restore) = self.loading_settings(options);
        if let Some(loading) = &loading {
            self.sluice.backend.put_settings(&name, loading).await?;
        }
        // changes made while we import are replayed from the journal
        let import = options
            .import
            .clone()
            .suffix(suffix)
            .journal(false)
            .refresh(loading.is_none());
        let imports = self.import(&import).await?;
        if let Some(restore) = &restore {
            self.sluice.backend.put_settings(&name, restore).await?;
            self.sluice.backend.refresh(std::slice::from_ref(&name)).await?;
        }
        // swap our alias in a single atomic step
        let mut actions = old
            .iter()
            .map(|index| AliasAction::Remove {
                index: index.clone(),
                alias: general.clone(),
            })
            .collect::<Vec<AliasAction>>();
        actions.push(AliasAction::Add {
            index: name.clone(),
            alias: general.clone(),
        });
        self.sluice.backend.update_aliases(&actions).await?;
        self.sluice.backend.delete_indexes(&old).await?;
        event!(Level::INFO, msg = "Swapped index", index = general, new = name, old = ?old);
        let journal = if options.apply_journal {
            let only = [self.definition.name.as_str()];
            Some(self.sluice.journal().apply(started, None, &only).await?)
        } else {
            None
        };
        Ok(ResetReport {
            index: name,
            replaced: old,
            imports,
            journal,
        })
    }
}

impl ImportOptions {
    /// Set the suffix only if one was given
    ///
    /// # Arguments
    ///
    /// * `suffix` - The suffix to set
    fn suffix_opt(self, suffix: Option<&str>) -> Self {
        match suffix {
            Some(suffix) => self.suffix(suffix),
            None => self,
        }
    }
}

/// A handle to a type within a registered index
#[derive(Clone)]
pub struct TypeHandle {
    /// The sluice client to use
    pub(crate) sluice: Sluice,
    /// The index this type is in
    pub(crate) index: Arc<IndexDefinition>,
    /// The key for this type
    pub(crate) key: TypeKey,
}

impl TypeHandle {
    /// Get the key for this type
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Get the definition for this type
    pub fn definition(&self) -> Result<&TypeDefinition, Error> {
        self.index.type_def(&self.key.type_name)
    }

    /// Get a handle to the index this type is in
    pub fn index(&self) -> IndexHandle {
        IndexHandle::new(self.sluice.clone(), self.index.clone())
    }

    /// Start a query against just this type
    pub fn query(&self) -> Query {
        Query::new(
            self.sluice.clone(),
            vec![self.index.name.clone()],
            vec![self.key.clone()],
        )
    }

    /// Import records for this type
    ///
    /// Documents that fail are listed in the report instead of raising an error.
    ///
    /// # Arguments
    ///
    /// * `source` - What to import
    /// * `options` - The options to import with
    pub async fn import(&self, source: ImportSource, options: &ImportOptions) -> Result<ImportReport, Error> {
        let type_def = self.definition()?;
        Importer::new(&self.sluice, &self.index, type_def, options)
            .run(source)
            .await
    }

    /// Import records for this type and fail if any documents failed
    ///
    /// # Arguments
    ///
    /// * `source` - What to import
    /// * `options` - The options to import with
    pub async fn import_strict(&self, source: ImportSource, options: &ImportOptions) -> Result<ImportReport, Error> {
        let report = self.import(source, options).await?;
        if !report.is_success() {
            return Err(Error::ImportFailed(Box::new(report)));
        }
        Ok(report)
    }
}
