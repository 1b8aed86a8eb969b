use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::ArcStr;

/// Failure attached to a single node. Cloneable so the same error can be
/// handed to the report and to every status subscriber.
#[derive(Debug, Clone)]
pub struct NodeError(Arc<anyhow::Error>);

impl NodeError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying error, for downcasting.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(e: anyhow::Error) -> Self {
        NodeError(Arc::new(e))
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error)]
pub enum TataraError {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Signature database error:\n{0}")]
    Database(#[from] DatabaseError),

    #[error("Couldn't start the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't open the trace output.\n{0}")]
    Trace(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors in the graph or the options, detected before anything executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Dependency cycle detected: {}", format_cycles(.0))]
    Cycle(Vec<Vec<ArcStr>>),

    #[error("Unknown node '{0}'")]
    UnknownNode(Box<str>),

    #[error("Option '{0}' is not settable")]
    UnknownOption(Box<str>),

    #[error("Invalid value '{value}' for option '{name}': {reason}")]
    InvalidOption {
        name: Box<str>,
        value: Box<str>,
        reason: &'static str,
    },
}

fn format_cycles(cycles: &[Vec<ArcStr>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Couldn't access the signature database.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode the signature database.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode the signature database.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

/// Artifact cache failures. These never fail a build, they are logged and
/// treated as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error on {0}.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),
}

/// Reasons a node can fail without its own action reporting an error.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Source '{0}' does not exist and no action can build it")]
    MissingSource(Box<str>),

    #[error("Dependency '{0}' failed")]
    Dependency(Box<str>),

    #[error("Build stopped after an earlier failure")]
    Stopped,

    #[error("Action for '{0}' finished but did not produce its output")]
    MissingOutput(Box<str>),

    #[error("Action panicked: {0}")]
    Panic(String),
}
