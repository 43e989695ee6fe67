//! Sluice: define search indexes, keep them in sync with their sources, and query them

pub mod adapters;
pub mod admin;
pub mod backends;
mod client;
pub mod conf;
mod error;
pub mod import;
pub mod index;
pub mod journal;
pub mod registry;
pub mod search;
pub mod strategy;
pub mod sync;
pub mod test_utilities;
pub mod trace;

pub use client::Sluice;
pub use conf::Conf;
pub use error::Error;
pub use import::{ImportOptions, ImportReport, ImportSource, Record};
pub use index::{IndexHandle, ResetOptions, ResetReport, TypeHandle};
pub use journal::{Journal, JournalApplyReport, JournalEntry};
pub use registry::{Adapter, Document, IndexDefinition, Registry, TypeDefinition, TypeKey};
pub use search::{Criteria, FilterMode, Query, QueryMode};
pub use strategy::{
    RequestStrategies, StrategyGuard, StrategyKind, StrategyStack, UpdateJob, UpdateWorker,
};
pub use sync::SyncReport;
