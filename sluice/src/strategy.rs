//! Decides how index updates triggered by record changes are applied

use itertools::Itertools;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, event, instrument};

mod queue;

pub use queue::{UpdateJob, UpdateWorker};

use crate::import::{ImportOptions, ImportSource};
use crate::registry::TypeKey;
use crate::{Error, Sluice};

/// The kinds of update strategies
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Updates are an error
    #[default]
    Base,
    /// Updates are ignored
    Bypass,
    /// Updates are imported right away
    Urgent,
    /// Updates are collected and imported once the strategy is left
    Atomic,
    /// Updates are sent to a background worker
    Queued,
}

impl StrategyKind {
    /// Get this kind as a str
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Base => "base",
            StrategyKind::Bypass => "bypass",
            StrategyKind::Urgent => "urgent",
            StrategyKind::Atomic => "atomic",
            StrategyKind::Queued => "queued",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "base" => Ok(StrategyKind::Base),
            "bypass" => Ok(StrategyKind::Bypass),
            "urgent" => Ok(StrategyKind::Urgent),
            "atomic" => Ok(StrategyKind::Atomic),
            "queued" => Ok(StrategyKind::Queued),
            _ => Err(Error::UnknownStrategy(raw.to_owned())),
        }
    }
}

/// An entry in a strategy stack
#[derive(Debug)]
enum Strategy {
    Base,
    Bypass,
    Urgent,
    /// The ids waiting to be imported for each type
    Atomic(BTreeMap<TypeKey, Vec<String>>),
    Queued,
}

impl Strategy {
    /// Start a new strategy
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of strategy to start
    fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Base => Strategy::Base,
            StrategyKind::Bypass => Strategy::Bypass,
            StrategyKind::Urgent => Strategy::Urgent,
            StrategyKind::Atomic => Strategy::Atomic(BTreeMap::default()),
            StrategyKind::Queued => Strategy::Queued,
        }
    }

    /// Get the kind of this strategy
    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Base => StrategyKind::Base,
            Strategy::Bypass => StrategyKind::Bypass,
            Strategy::Urgent => StrategyKind::Urgent,
            Strategy::Atomic(_) => StrategyKind::Atomic,
            Strategy::Queued => StrategyKind::Queued,
        }
    }

    /// Check if leaving this strategy has work to do
    fn has_pending(&self) -> bool {
        matches!(self, Strategy::Atomic(pending) if !pending.is_empty())
    }

    /// Finish any work this strategy is holding on to
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to import with
    async fn leave(self, sluice: &Sluice) -> Result<(), Error> {
        if let Strategy::Atomic(pending) = self {
            for (key, ids) in pending {
                let ids = ids.into_iter().unique().collect::<Vec<String>>();
                event!(
                    Level::DEBUG,
                    msg = "Flushing atomic updates",
                    target = key.to_string(),
                    count = ids.len()
                );
                sluice
                    .type_handle(&key.to_string())?
                    .import_strict(ImportSource::Ids(ids), &ImportOptions::default())
                    .await?;
            }
        }
        Ok(())
    }
}

/// The stack of update strategies for a single task or request
///
/// Clones share the same stack.
#[derive(Clone)]
pub struct StrategyStack {
    /// The sluice client to apply updates with
    sluice: Sluice,
    /// The strategies from the root up
    strategies: Arc<Mutex<Vec<Strategy>>>,
}

impl StrategyStack {
    /// Create a stack with just the configured root strategy
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to apply updates with
    pub fn new(sluice: Sluice) -> Self {
        let root = Strategy::new(sluice.conf.strategies.root);
        StrategyStack {
            sluice,
            strategies: Arc::new(Mutex::new(vec![root])),
        }
    }

    /// Lock our strategies
    fn lock(&self) -> Result<MutexGuard<'_, Vec<Strategy>>, Error> {
        self.strategies
            .lock()
            .map_err(|_| Error::new("Strategy stack lock is poisoned"))
    }

    /// Get the kind of the current strategy
    pub fn current(&self) -> Result<StrategyKind, Error> {
        let strategies = self.lock()?;
        Ok(strategies.last().map_or(StrategyKind::Base, Strategy::kind))
    }

    /// Get the number of strategies on this stack including the root
    pub fn depth(&self) -> Result<usize, Error> {
        Ok(self.lock()?.len())
    }

    /// Push a new strategy onto this stack
    ///
    /// The strategy is popped when the returned guard is released or dropped.
    ///
    /// # Arguments
    ///
    /// * `kind` - The kind of strategy to push
    pub fn push(&self, kind: StrategyKind) -> Result<StrategyGuard, Error> {
        let mut strategies = self.lock()?;
        strategies.push(Strategy::new(kind));
        event!(Level::DEBUG, msg = "Pushed strategy", kind = kind.as_str(), depth = strategies.len());
        Ok(StrategyGuard {
            stack: self.clone(),
            released: false,
        })
    }

    /// Push a strategy by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the strategy to push
    pub fn push_named(&self, name: &str) -> Result<StrategyGuard, Error> {
        self.push(StrategyKind::from_str(name)?)
    }

    /// Remove the current strategy without leaving it
    fn remove(&self) -> Result<Strategy, Error> {
        let mut strategies = self.lock()?;
        // the root strategy always stays on the stack
        if strategies.len() <= 1 {
            return Err(Error::RootStrategyPop);
        }
        strategies.pop().ok_or(Error::RootStrategyPop)
    }

    /// Pop the current strategy and finish its work
    #[instrument(name = "StrategyStack::pop", skip_all, err(Debug))]
    pub async fn pop(&self) -> Result<StrategyKind, Error> {
        let strategy = self.remove()?;
        let kind = strategy.kind();
        strategy.leave(&self.sluice).await?;
        Ok(kind)
    }

    /// Run some work under a strategy
    ///
    /// The strategy is always popped. An error from the work is returned before
    /// any error from leaving the strategy.
    ///
    /// # Arguments
    ///
    /// * `kind` - The strategy to run this work under
    /// * `work` - The work to run
    pub async fn wrap<F, Fut, T>(&self, kind: StrategyKind, work: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let guard = self.push(kind)?;
        let result = work().await;
        let popped = guard.release().await;
        let value = result?;
        popped?;
        Ok(value)
    }

    /// Tell the current strategy that some records changed
    ///
    /// # Arguments
    ///
    /// * `target` - The `index#type` or single type index that changed
    /// * `ids` - The ids of the records that changed
    #[instrument(name = "StrategyStack::update", skip(self, ids), err(Debug))]
    pub async fn update<T: AsRef<str>>(&self, target: &str, ids: &[T]) -> Result<(), Error> {
        let (_, key) = self.sluice.registry.derive_type(target)?;
        let ids = ids
            .iter()
            .map(|id| id.as_ref().to_owned())
            .collect::<Vec<String>>();
        // atomic updates are collected without leaving the lock
        let kind = {
            let mut strategies = self.lock()?;
            match strategies.last_mut() {
                Some(Strategy::Atomic(pending)) => {
                    pending.entry(key.clone()).or_default().extend(ids.iter().cloned());
                    StrategyKind::Atomic
                }
                Some(strategy) => strategy.kind(),
                None => StrategyKind::Base,
            }
        };
        match kind {
            StrategyKind::Base => Err(Error::UndefinedUpdateStrategy(key.to_string())),
            StrategyKind::Bypass | StrategyKind::Atomic => Ok(()),
            StrategyKind::Urgent => {
                if ids.is_empty() {
                    return Ok(());
                }
                self.sluice
                    .type_handle(&key.to_string())?
                    .import_strict(ImportSource::Ids(ids), &ImportOptions::default())
                    .await?;
                Ok(())
            }
            StrategyKind::Queued => {
                if ids.is_empty() {
                    return Ok(());
                }
                self.sluice
                    .enqueue(UpdateJob::new(key, ids, ImportOptions::default()))
                    .await
            }
        }
    }
}

/// A strategy stack for a single request
///
/// The configured request strategy sits on top of the root and is popped when
/// this is released or dropped.
pub struct RequestStrategies {
    /// The stack for this request
    stack: StrategyStack,
    /// The guard for the request strategy
    guard: Option<StrategyGuard>,
}

impl RequestStrategies {
    /// Start the strategies for a request
    ///
    /// # Arguments
    ///
    /// * `sluice` - The sluice client to apply updates with
    pub fn new(sluice: Sluice) -> Result<Self, Error> {
        let kind = sluice.conf.strategies.request;
        let stack = StrategyStack::new(sluice);
        let guard = stack.push(kind)?;
        Ok(RequestStrategies {
            stack,
            guard: Some(guard),
        })
    }

    /// Pop the request strategy and finish its work
    pub async fn release(mut self) -> Result<StrategyKind, Error> {
        match self.guard.take() {
            Some(guard) => guard.release().await,
            None => Err(Error::RootStrategyPop),
        }
    }
}

impl Deref for RequestStrategies {
    type Target = StrategyStack;

    fn deref(&self) -> &Self::Target {
        &self.stack
    }
}

/// Pops a strategy once it goes out of scope
///
/// Prefer `release` so errors from leaving the strategy are returned. A
/// dropped guard finishes the strategy's work in the background.
pub struct StrategyGuard {
    /// The stack this guard pops from
    stack: StrategyStack,
    /// Whether this guard was already released
    released: bool,
}

impl StrategyGuard {
    /// Pop this strategy and finish its work
    pub async fn release(mut self) -> Result<StrategyKind, Error> {
        self.released = true;
        self.stack.pop().await
    }
}

impl Drop for StrategyGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let strategy = match self.stack.remove() {
            Ok(strategy) => strategy,
            Err(error) => {
                event!(Level::ERROR, msg = "Failed to pop strategy", error = error.to_string());
                return;
            }
        };
        if !strategy.has_pending() {
            return;
        }
        // finish this strategy's work on the current runtime if we have one
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sluice = self.stack.sluice.clone();
                handle.spawn(async move {
                    if let Err(error) = strategy.leave(&sluice).await {
                        event!(Level::ERROR, msg = "Failed to flush dropped strategy", error = error.to_string());
                    }
                });
            }
            Err(_) => event!(
                Level::ERROR,
                msg = "Dropped a strategy with pending updates outside of a runtime"
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(StrategyKind::from_str("atomic").unwrap(), StrategyKind::Atomic);
        assert_eq!(StrategyKind::Queued.to_string(), "queued");
        assert_eq!(StrategyKind::from_str("lazy").unwrap_err().kind(), "UnknownStrategy");
        assert_eq!(StrategyKind::default(), StrategyKind::Base);
    }

    #[test]
    fn pending() {
        assert!(!Strategy::new(StrategyKind::Atomic).has_pending());
        let mut pending = BTreeMap::default();
        pending.insert(TypeKey::new("cities", "city"), vec!["1".to_owned()]);
        assert!(Strategy::Atomic(pending).has_pending());
        assert!(!Strategy::Urgent.has_pending());
    }
}
