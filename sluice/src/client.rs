//! The client that ties a config, a search backend, and registered indexes together

use kanal::AsyncSender;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{Level, event};

use crate::backends::{Backend, Elastic};
use crate::conf::Conf;
use crate::index::{IndexHandle, TypeHandle};
use crate::journal::Journal;
use crate::registry::{Registry, TypeKey, index_name};
use crate::search::Query;
use crate::strategy::{RequestStrategies, StrategyStack, UpdateJob, UpdateWorker};
use crate::Error;

/// A client for indexing and searching registered indexes
#[derive(Clone)]
pub struct Sluice {
    /// The config for this client
    pub conf: Arc<Conf>,
    /// The search service to talk to
    pub backend: Arc<dyn Backend>,
    /// The indexes we know about
    pub registry: Arc<Registry>,
    /// The queue to send queued updates to if one was set up
    queue: Option<AsyncSender<UpdateJob>>,
}

impl std::fmt::Debug for Sluice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Sluice")
            .field("conf", &self.conf)
            .field("backend", &self.backend.name())
            .field("registry", &self.registry)
            .field("queue", &self.queue.is_some())
            .finish()
    }
}

impl Sluice {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `conf` - The config to use
    /// * `backend` - The search service to talk to
    /// * `registry` - The indexes to manage
    pub fn new<B: Backend>(conf: Conf, backend: B, registry: Registry) -> Self {
        Sluice {
            conf: Arc::new(conf),
            backend: Arc::new(backend),
            registry: Arc::new(registry),
            queue: None,
        }
    }

    /// Create a new client from a shared backend
    ///
    /// # Arguments
    ///
    /// * `conf` - The config to use
    /// * `backend` - The search service to talk to
    /// * `registry` - The indexes to manage
    pub fn from_parts(conf: Conf, backend: Arc<dyn Backend>, registry: Registry) -> Self {
        Sluice {
            conf: Arc::new(conf),
            backend,
            registry: Arc::new(registry),
            queue: None,
        }
    }

    /// Create a client talking to Elastic from a config file
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the config file
    /// * `registry` - The indexes to manage
    pub fn from_path<P: AsRef<Path>>(path: P, registry: Registry) -> Result<Self, Error> {
        let conf = Conf::new(path)?;
        Sluice::from_conf(conf, registry)
    }

    /// Create a client talking to Elastic
    ///
    /// # Arguments
    ///
    /// * `conf` - The config to use
    /// * `registry` - The indexes to manage
    pub fn from_conf(conf: Conf, registry: Registry) -> Result<Self, Error> {
        let elastic = Elastic::new(&conf.elastic)?;
        event!(Level::INFO, msg = "Connecting to Elastic", node = conf.elastic.node);
        Ok(Sluice::new(conf, elastic, registry))
    }

    /// Set up a queue for queued updates and a worker to drain it
    ///
    /// # Arguments
    ///
    /// * `capacity` - The max number of jobs that can wait in the queue
    #[must_use]
    pub fn with_update_queue(mut self, capacity: usize) -> (Self, UpdateWorker) {
        let (jobs_tx, jobs_rx) = kanal::bounded_async(capacity);
        self.queue = Some(jobs_tx);
        let worker = UpdateWorker::new(self.clone(), jobs_rx);
        (self, worker)
    }

    /// Send a job to our update queue
    ///
    /// # Arguments
    ///
    /// * `job` - The job to send
    pub(crate) async fn enqueue(&self, job: UpdateJob) -> Result<(), Error> {
        match &self.queue {
            Some(queue) => {
                queue.send(job).await?;
                Ok(())
            }
            None => Err(Error::new(format!(
                "No update queue is set up to apply queued updates to `{}`",
                job.target
            ))),
        }
    }

    /// Get the full name of an index or one of its versions
    ///
    /// # Arguments
    ///
    /// * `base` - The base name of the index
    /// * `suffix` - The version of the index
    pub fn index_name(&self, base: &str, suffix: Option<&str>) -> String {
        index_name(&self.conf.prefix, base, suffix)
    }

    /// Get a handle to a registered index
    ///
    /// # Arguments
    ///
    /// * `name` - The base name of the index
    pub fn index(&self, name: &str) -> Result<IndexHandle, Error> {
        let definition = self.registry.index(name)?.clone();
        Ok(IndexHandle::new(self.clone(), definition))
    }

    /// Get a handle to a type from `index#type` or a single type index name
    ///
    /// # Arguments
    ///
    /// * `target` - The type to get a handle for
    pub fn type_handle(&self, target: &str) -> Result<TypeHandle, Error> {
        let (definition, key) = self.registry.derive_type(target)?;
        Ok(TypeHandle {
            sluice: self.clone(),
            index: definition.clone(),
            key,
        })
    }

    /// Start a query against some indexes or types
    ///
    /// Targets are either an index name or `index#type`.
    ///
    /// # Arguments
    ///
    /// * `targets` - The indexes or types to search
    pub fn query<T: AsRef<str>>(&self, targets: &[T]) -> Result<Query, Error> {
        let mut indexes: Vec<String> = Vec::with_capacity(targets.len());
        let mut typed: Vec<TypeKey> = Vec::default();
        let mut untyped: Vec<String> = Vec::default();
        for target in targets {
            let target = target.as_ref();
            match target.split_once('#') {
                Some((index, _)) => {
                    let (_, key) = self.registry.derive_type(target)?;
                    typed.push(key);
                    if !indexes.iter().any(|name| name == index) {
                        indexes.push(index.to_owned());
                    }
                }
                None => {
                    self.registry.index(target)?;
                    untyped.push(target.to_owned());
                    if !indexes.iter().any(|name| name == target) {
                        indexes.push(target.to_owned());
                    }
                }
            }
        }
        // a mix of types and whole indexes restricts to every type involved
        if !typed.is_empty() {
            for index in &untyped {
                typed.extend(self.registry.index(index)?.type_keys());
            }
        }
        Ok(Query::new(self.clone(), indexes, typed))
    }

    /// Get a handle to the journal
    pub fn journal(&self) -> Journal {
        Journal::new(self.clone())
    }

    /// Get a new strategy stack with the configured root strategy
    pub fn strategies(&self) -> StrategyStack {
        StrategyStack::new(self.clone())
    }

    /// Get a new strategy stack for a single request
    ///
    /// Updates held by the request strategy are flushed once the returned
    /// stack is released or dropped.
    pub fn request_strategies(&self) -> Result<RequestStrategies, Error> {
        RequestStrategies::new(self.clone())
    }

    /// Run some work for a single request
    ///
    /// The request strategy is always popped. An error from the work is
    /// returned before any error from flushing updates.
    ///
    /// # Arguments
    ///
    /// * `work` - The work to run with the request's strategy stack
    pub async fn wrap_request<F, Fut, T>(&self, work: F) -> Result<T, Error>
    where
        F: FnOnce(StrategyStack) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let strategies = self.request_strategies()?;
        let result = work(StrategyStack::clone(&strategies)).await;
        let released = strategies.release().await;
        let value = result?;
        released?;
        Ok(value)
    }
}
