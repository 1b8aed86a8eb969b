#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod action;
mod cache;
pub mod config;
mod core;
mod db;
mod engine;
mod error;
mod graph;
pub mod scanner;
mod signature;
pub mod tree;

pub use crate::action::{Action, ActionContext};
pub use crate::cache::{ArtifactCache, cache_key};
pub use crate::config::Options;
pub use crate::core::{ArcStr, Signature};
pub use crate::db::{ContentInfo, NodeRecord, SignatureDb};
pub use crate::engine::{BuildReport, BuildStatus, Engine, NodeReport, StatusEvent, TaskExecution, Verdict};
pub use crate::error::*;
pub use crate::graph::{Attributes, Dependency, Graph, Node, NodeId, NodeState};
pub use crate::signature::SignatureEngine;

/// Installs a `tracing` subscriber that prints log lines above the progress
/// bars instead of through them. Verbosity follows `RUST_LOG`, defaulting to
/// `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .with(filter)
        .try_init()?;

    Ok(())
}
