//! The config for sluice

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

use crate::search::{FilterMode, QueryMode};
use crate::strategy::StrategyKind;

/// Default the elastic node to a local cluster
fn default_elastic_node() -> String {
    "http://localhost:9200".to_owned()
}

/// Default the elastic username
fn default_elastic_username() -> String {
    "elastic".to_owned()
}

/// Default the request timeout to 60 seconds
fn default_elastic_timeout() -> u64 {
    60
}

/// The settings for talking to elastic
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Elastic {
    /// The node to connect to
    #[serde(default = "default_elastic_node")]
    pub node: String,
    /// The username to authenticate with
    #[serde(default = "default_elastic_username")]
    pub username: String,
    /// The password to authenticate with
    #[serde(default)]
    pub password: String,
    /// How long to wait for a request in seconds
    #[serde(default = "default_elastic_timeout")]
    pub timeout: u64,
}

impl Default for Elastic {
    fn default() -> Self {
        Elastic {
            node: default_elastic_node(),
            username: default_elastic_username(),
            password: String::default(),
            timeout: default_elastic_timeout(),
        }
    }
}

/// The health statuses a cluster can be waited on for
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Green,
    Yellow,
    Red,
}

impl ClusterStatus {
    /// Get this status as a str
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Green => "green",
            ClusterStatus::Yellow => "yellow",
            ClusterStatus::Red => "red",
        }
    }
}

/// Default the number of records to load per batch
fn default_batch_size() -> usize {
    1000
}

/// Default to retrying failed partial updates as full documents
fn default_update_failover() -> bool {
    true
}

/// Default to refreshing indexes after an import
fn default_refresh() -> bool {
    true
}

/// The default settings for imports
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImportDefaults {
    /// The number of records to load and send per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The max size in bytes of a single bulk request
    #[serde(default)]
    pub bulk_size: Option<usize>,
    /// Whether imports write journal entries
    #[serde(default)]
    pub journal: bool,
    /// Whether to skip creating missing indexes before importing
    #[serde(default)]
    pub skip_index_creation: bool,
    /// Whether failed partial updates are retried as full documents
    #[serde(default = "default_update_failover")]
    pub update_failover: bool,
    /// Whether to refresh indexes after importing
    #[serde(default = "default_refresh")]
    pub refresh: bool,
}

impl Default for ImportDefaults {
    fn default() -> Self {
        ImportDefaults {
            batch_size: default_batch_size(),
            bulk_size: None,
            journal: false,
            skip_index_creation: false,
            update_failover: default_update_failover(),
            refresh: default_refresh(),
        }
    }
}

/// Default how long scrolls are kept alive between batches
fn default_scroll() -> String {
    "1m".to_owned()
}

/// Default the number of hits in each scroll batch
fn default_scroll_batch_size() -> u64 {
    1000
}

/// The default modes used when compiling searches
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SearchDefaults {
    /// How queries are joined
    #[serde(default)]
    pub query_mode: QueryMode,
    /// How filters are joined
    #[serde(default)]
    pub filter_mode: FilterMode,
    /// How post filters are joined, falls back to the filter mode
    #[serde(default)]
    pub post_filter_mode: Option<FilterMode>,
    /// How long scrolls are kept alive between batches
    #[serde(default = "default_scroll")]
    pub scroll: String,
    /// The number of hits fetched in each scroll batch
    #[serde(default = "default_scroll_batch_size")]
    pub batch_size: u64,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        SearchDefaults {
            query_mode: QueryMode::default(),
            filter_mode: FilterMode::default(),
            post_filter_mode: None,
            scroll: default_scroll(),
            batch_size: default_scroll_batch_size(),
        }
    }
}

/// Default the request strategy to atomic
fn default_request_strategy() -> StrategyKind {
    StrategyKind::Atomic
}

/// The update strategies to start with
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StrategyDefaults {
    /// The strategy at the bottom of every stack
    #[serde(default)]
    pub root: StrategyKind,
    /// The strategy pushed for each request
    #[serde(default = "default_request_strategy")]
    pub request: StrategyKind,
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        StrategyDefaults {
            root: StrategyKind::default(),
            request: default_request_strategy(),
        }
    }
}

/// Settings that are changed while an index is being reset
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResetDefaults {
    /// Disable refreshing the new index until it is imported
    #[serde(default)]
    pub disable_refresh_interval: bool,
    /// Drop replicas on the new index until it is imported
    #[serde(default)]
    pub no_replicas: bool,
}

/// Default the number of journal apply passes
fn default_journal_retries() -> usize {
    10
}

/// The settings for the journal
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JournalDefaults {
    /// How many passes to make when applying the journal
    #[serde(default = "default_journal_retries")]
    pub retries: usize,
}

impl Default for JournalDefaults {
    fn default() -> Self {
        JournalDefaults {
            retries: default_journal_retries(),
        }
    }
}

/// The log level to set
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy, Default)]
pub enum LogLevel {
    /// Do not log any info
    Off,
    /// Log at the error level
    Error,
    /// Log at the warning level
    Warn,
    /// Only Setup and up info
    Setup,
    /// Log at the info level
    #[default]
    Info,
    /// Log at the debug level
    Debug,
    /// Log at the tracing level
    Trace,
}

impl LogLevel {
    /// Cast this log level to a tracing filter
    #[must_use]
    pub fn to_filter(&self) -> tracing_subscriber::filter::LevelFilter {
        match self {
            LogLevel::Off => tracing_subscriber::filter::LevelFilter::OFF,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
            LogLevel::Warn | LogLevel::Setup => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    /// Allow the log level to be displayed
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogLevel::Off => write!(f, "Off"),
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warn => write!(f, "Warn"),
            LogLevel::Setup => write!(f, "Setup"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
            LogLevel::Trace => write!(f, "Trace"),
        }
    }
}

/// The settings for local tracing
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Tracing {
    /// The level to log at
    #[serde(default)]
    pub level: LogLevel,
}

/// The config for sluice
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Conf {
    /// The elastic settings
    #[serde(default)]
    pub elastic: Elastic,
    /// The prefix to add to every index name
    #[serde(default)]
    pub prefix: String,
    /// The cluster status to wait for after creating indexes
    #[serde(default)]
    pub wait_for_status: Option<ClusterStatus>,
    /// The default import settings
    #[serde(default)]
    pub import: ImportDefaults,
    /// The default search settings
    #[serde(default)]
    pub search: SearchDefaults,
    /// The default update strategies
    #[serde(default)]
    pub strategies: StrategyDefaults,
    /// The settings changed during a reset
    #[serde(default)]
    pub reset: ResetDefaults,
    /// The journal settings
    #[serde(default)]
    pub journal: JournalDefaults,
    /// The tracing settings
    #[serde(default)]
    pub tracing: Tracing,
}

impl Conf {
    /// Creates a new config object
    ///
    /// Any `SLUICE__` prefixed environment variables are laid on top of the file.
    ///
    /// # Arguments
    ///
    /// * `path` - The path to read the config file from
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            // load from a file first
            .add_source(File::from(path.as_ref()).format(FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                Environment::with_prefix("SLUICE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Build a config from a YAML string
    ///
    /// # Arguments
    ///
    /// * `raw` - The YAML to parse
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(raw, FileFormat::Yaml))
            .build()?
            .try_deserialize()
    }
}
