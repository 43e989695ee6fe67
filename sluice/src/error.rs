//! An error from sluice

use crate::import::ImportReport;

/// An error from sluice
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// An index name that is not registered
    UndefinedIndex(String),
    /// A type name that is not part of its index
    UndefinedType { index: String, type_name: String },
    /// An index with several types was referenced without a type
    UnderivableType(String),
    /// A record changed while the base strategy was active
    UndefinedUpdateStrategy(String),
    /// The root strategy can not be popped
    RootStrategyPop,
    /// An unknown strategy name
    UnknownStrategy(String),
    /// An import finished with errors
    ImportFailed(Box<ImportReport>),
    /// None of the requested documents were found
    DocumentNotFound(Vec<String>),
    /// The search service rejected a request
    Service {
        /// The status code returned by the service
        status: u16,
        /// The error type reported by the service
        kind: String,
        /// The reason reported by the service
        reason: String,
    },
    /// An error from an IO operation
    IO(std::io::Error),
    /// An error from parsing a timestamp/date
    ChronoParse(chrono::ParseError),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from building an elastic client
    BuildElastic(elasticsearch::http::transport::BuildError),
    /// An error from an elastic client
    Elastic(elasticsearch::Error),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from parsing a URL
    UrlParse(url::ParseError),
    /// An error from sending a kanal message
    KanalSend(kanal::SendError),
    /// An error from receiving a kanal message
    KanalRecv(kanal::ReceiveError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Build a service error from an error body returned by the search service
    ///
    /// # Arguments
    ///
    /// * `status` - The status code that was returned
    /// * `body` - The error body that was returned
    pub fn service(status: u16, body: &serde_json::Value) -> Self {
        // errors are either nested under an error key or are the error itself
        let error = body.get("error").unwrap_or(body);
        // get the type of error that occured
        let kind = error
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        // get the reason this error occured
        let reason = match error.get("reason") {
            Some(serde_json::Value::String(reason)) => reason.clone(),
            Some(other) => other.to_string(),
            None => error.to_string(),
        };
        Error::Service {
            status,
            kind,
            reason,
        }
    }

    /// Build the error for a missing index
    ///
    /// # Arguments
    ///
    /// * `index` - The name of the missing index
    pub fn index_missing(index: &str) -> Self {
        Error::Service {
            status: 404,
            kind: "index_not_found_exception".to_owned(),
            reason: format!("no such index [{index}]"),
        }
    }

    /// Check if this error means that the index we talked to does not exist
    pub fn is_index_missing(&self) -> bool {
        match self {
            Error::Service { status, kind, .. } => {
                *status == 404 && kind == "index_not_found_exception"
            }
            _ => false,
        }
    }

    /// Get the status code from this error if one exists
    pub fn status(&self) -> Option<u16> {
        // get the status code from any error types that support it
        match self {
            Error::Service { status, .. } => Some(*status),
            Error::Elastic(err) => err.status_code().map(|code| code.as_u16()),
            Error::UndefinedIndex(_)
            | Error::UndefinedType { .. }
            | Error::DocumentNotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Generic(msg) => Some(msg.clone()),
            Error::UndefinedIndex(name) => Some(format!("Index `{name}` is not defined")),
            Error::UndefinedType { index, type_name } => Some(format!(
                "Type `{type_name}` is not defined in index `{index}`"
            )),
            Error::UnderivableType(name) => Some(format!(
                "Index `{name}` has more than one type, please specify type via `{name}#type_name`"
            )),
            Error::UndefinedUpdateStrategy(target) => Some(format!(
                "Index update strategy is undefined for current context while updating `{target}`. \
                 Please wrap your code with a strategy such as `atomic` or `urgent`"
            )),
            Error::RootStrategyPop => Some("Can't pop the root strategy".to_owned()),
            Error::UnknownStrategy(name) => Some(format!("Can't find update strategy `{name}`")),
            Error::ImportFailed(report) => Some(report.failure_message()),
            Error::DocumentNotFound(ids) => Some(format!("Could not find documents for ids: {}", ids.join(", "))),
            Error::Service { kind, reason, .. } => Some(format!("{kind}: {reason}")),
            Error::IO(err) => Some(err.to_string()),
            Error::ChronoParse(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::BuildElastic(err) => Some(err.to_string()),
            Error::Elastic(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::UrlParse(err) => Some(err.to_string()),
            Error::KanalSend(err) => Some(err.to_string()),
            Error::KanalRecv(err) => Some(err.to_string()),
        }
    }

    /// get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generic(_) => "Generic",
            Error::UndefinedIndex(_) => "UndefinedIndex",
            Error::UndefinedType { .. } => "UndefinedType",
            Error::UnderivableType(_) => "UnderivableType",
            Error::UndefinedUpdateStrategy(_) => "UndefinedUpdateStrategy",
            Error::RootStrategyPop => "RootStrategyPop",
            Error::UnknownStrategy(_) => "UnknownStrategy",
            Error::ImportFailed(_) => "ImportFailed",
            Error::DocumentNotFound(_) => "DocumentNotFound",
            Error::Service { .. } => "Service",
            Error::IO(_) => "IO",
            Error::ChronoParse(_) => "ChronoParse",
            Error::Config(_) => "Config",
            Error::BuildElastic(_) => "BuildElastic",
            Error::Elastic(_) => "Elastic",
            Error::Serde(_) => "Serde",
            Error::UrlParse(_) => "UrlParse",
            Error::KanalSend(_) => "KanalSend",
            Error::KanalRecv(_) => "KanalRecv",
        }
    }
}

impl std::fmt::Display for Error {
    /// display this error in a easy readble format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match (self.status(), self.msg()) {
            (Some(code), Some(msg)) => write!(f, "Code: {code} Error: {msg}"),
            (None, Some(msg)) => write!(f, "Error: {msg}"),
            (Some(code), None) => write!(f, "Code: {code}"),
            (None, None) => write!(f, "Kind: {}", self.kind()),
        }
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<chrono::ParseError> for Error {
    fn from(error: chrono::ParseError) -> Self {
        Error::ChronoParse(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<elasticsearch::Error> for Error {
    fn from(error: elasticsearch::Error) -> Self {
        Error::Elastic(error)
    }
}

impl From<elasticsearch::http::transport::BuildError> for Error {
    fn from(error: elasticsearch::http::transport::BuildError) -> Self {
        Error::BuildElastic(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::UrlParse(error)
    }
}

impl From<kanal::SendError> for Error {
    fn from(error: kanal::SendError) -> Self {
        Error::KanalSend(error)
    }
}

impl From<kanal::ReceiveError> for Error {
    fn from(error: kanal::ReceiveError) -> Self {
        Error::KanalRecv(error)
    }
}
