//! Applies queued index updates in the background

use kanal::AsyncReceiver;
use serde_derive::{Deserialize, Serialize};
use tracing::{Level, event, instrument};
use uuid::Uuid;

use crate::import::{ImportOptions, ImportSource};
use crate::registry::TypeKey;
use crate::{Error, Sluice};

/// An update waiting to be applied by a worker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateJob {
    /// The id of this job
    pub id: Uuid,
    /// The type to update
    pub target: TypeKey,
    /// The ids of the records that changed
    pub ids: Vec<String>,
    /// The options to import with
    pub options: ImportOptions,
}

impl UpdateJob {
    /// Create a new update job
    ///
    /// # Arguments
    ///
    /// * `target` - The type to update
    /// * `ids` - The ids of the records that changed
    /// * `options` - The options to import with
    pub fn new(target: TypeKey, ids: Vec<String>, options: ImportOptions) -> Self {
        UpdateJob {
            id: Uuid::new_v4(),
            target,
            ids,
            options,
        }
    }
}

/// Pulls update jobs off of a queue and imports them
pub struct UpdateWorker {
    /// The sluice client to import with
    sluice: Sluice,
    /// The channel to pull jobs from
    jobs_rx: AsyncReceiver<UpdateJob>,
}

impl UpdateWorker {
    /// Create a new update worker
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to import with
    /// * `jobs_rx` - The channel to pull jobs from
    pub fn new(sluice: Sluice, jobs_rx: AsyncReceiver<UpdateJob>) -> Self {
        UpdateWorker { sluice, jobs_rx }
    }

    /// Import a single job
    ///
    /// # Arguments
    ///
    /// * `job` - The job to import
    #[instrument(name = "UpdateWorker::handle", skip_all, fields(job = job.id.to_string(), target = job.target.to_string()), err(Debug))]
    async fn handle(&self, job: UpdateJob) -> Result<(), Error> {
        self.sluice
            .type_handle(&job.target.to_string())?
            .import_strict(ImportSource::Ids(job.ids), &job.options)
            .await?;
        Ok(())
    }

    /// Import every job that is already waiting in the queue
    ///
    /// Returns the number of jobs that were handled.
    pub async fn drain(&self) -> Result<usize, Error> {
        let mut handled = 0;
        while let Some(job) = self.jobs_rx.try_recv()? {
            self.handle(job).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Poll our job queue until it closes
    #[instrument(name = "UpdateWorker::start", skip_all, err(Debug))]
    pub async fn start(self) -> Result<(), Error> {
        while let Ok(job) = self.jobs_rx.recv().await {
            let id = job.id;
            // a failed job should not stop the worker
            if let Err(error) = self.handle(job).await {
                event!(
                    Level::ERROR,
                    msg = "Failed to apply update job",
                    job = id.to_string(),
                    error = error.to_string()
                );
            }
        }
        Ok(())
    }
}
