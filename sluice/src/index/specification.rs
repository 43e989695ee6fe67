//! Tracks the settings and mappings an index was last built with

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::instrument;

use crate::import::{ImportOptions, ImportSource, Record};
use crate::registry::{Document, IndexDefinition, SPECIFICATION_INDEX};
use crate::{Error, Sluice};

/// The stored specification for an index
pub struct Specification {
    /// The sluice client to use
    sluice: Sluice,
    /// The index this specification is for
    definition: Arc<IndexDefinition>,
}

impl Specification {
    /// Create a new specification handle
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to use
    /// * `definition` - The index this specification is for
    pub fn new(sluice: Sluice, definition: Arc<IndexDefinition>) -> Self {
        Specification { sluice, definition }
    }

    /// Get the specification the index would be built with now
    pub fn current(&self) -> Value {
        self.definition.specification()
    }

    /// Get the specification the index was last built with
    #[instrument(name = "Specification::stored", skip_all, fields(index = self.definition.name), err(Debug))]
    pub async fn stored(&self) -> Result<Option<Value>, Error> {
        let hits = self
            .sluice
            .query(&[SPECIFICATION_INDEX])?
            .filter_ids(&[&self.definition.name])
            .limit(1)
            .hits()
            .await?;
        Ok(hits
            .into_iter()
            .next()
            .and_then(|mut hit| hit.source.get_mut("specification").map(Value::take)))
    }

    /// Check if the index would be built differently then it was last built
    pub async fn changed(&self) -> Result<bool, Error> {
        Ok(self.stored().await?.as_ref() != Some(&self.current()))
    }

    /// Store the current specification as the one the index was built with
    #[instrument(name = "Specification::lock", skip_all, fields(index = self.definition.name), err(Debug))]
    pub async fn lock(&self) -> Result<(), Error> {
        let doc = Document::new(
            self.definition.name.clone(),
            json!({"specification": self.current()}),
        );
        self.sluice
            .type_handle(SPECIFICATION_INDEX)?
            .import_strict(
                ImportSource::Records(vec![Record::Index(doc)]),
                &ImportOptions::default().refresh(true),
            )
            .await?;
        Ok(())
    }
}
