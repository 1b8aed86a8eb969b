mod report;
mod scheduler;
mod taskmaster;
mod trace;

use std::sync::mpsc::Sender;

use crate::cache::ArtifactCache;
use crate::config::Options;
use crate::db::SignatureDb;
use crate::error::{ConfigError, TataraError};
use crate::graph::{Graph, NodeId};
use crate::scanner::{ImplicitCache, discover_implicit};
use crate::signature::SignatureEngine;

pub use report::{BuildReport, BuildStatus, NodeReport, StatusEvent, TaskExecution, Verdict};

use scheduler::{Scheduler, Worker};
use taskmaster::Taskmaster;
use trace::Trace;

/// Drives builds of one graph.
///
/// The engine owns the graph, the options and the signature database. Each
/// call to [`Engine::build`] is one run: implicit dependencies are
/// discovered, the graph is checked for cycles, stale nodes are rebuilt and
/// the new signatures are persisted.
pub struct Engine {
    graph: Graph,
    options: Options,
    db: SignatureDb,
    implicit: Option<Box<dyn ImplicitCache>>,
    status: Option<Sender<StatusEvent>>,
}

impl Engine {
    /// Creates an engine, loading the signature database configured in
    /// `options`.
    pub fn new(graph: Graph, options: Options) -> Result<Self, TataraError> {
        let db = match &options.database {
            Some(path) => SignatureDb::open(path)?,
            None => SignatureDb::in_memory(),
        };

        Ok(Self {
            graph,
            options,
            db,
            implicit: None,
            status: None,
        })
    }

    /// Replaces the signature database.
    pub fn with_database(mut self, db: SignatureDb) -> Self {
        self.db = db;
        self
    }

    /// Stores scanner results somewhere other than the signature database.
    pub fn with_implicit_cache(mut self, cache: impl ImplicitCache + 'static) -> Self {
        self.implicit = Some(Box::new(cache));
        self
    }

    /// Subscribes to node state transitions.
    pub fn with_status(mut self, status: Sender<StatusEvent>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The graph may be changed between runs, never during one.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn database(&self) -> &SignatureDb {
        &self.db
    }

    /// Builds `targets` and everything they depend on.
    ///
    /// Configuration errors, such as a dependency cycle, are returned before
    /// any action runs. Failures of individual nodes are not errors here;
    /// they are recorded in the returned [`BuildReport`].
    pub fn build(&mut self, targets: &[NodeId]) -> Result<BuildReport, TataraError> {
        let Self {
            graph,
            options,
            db,
            implicit,
            status,
        } = self;

        if let Some(&missing) = targets.iter().find(|id| id.index() >= graph.len()) {
            return Err(ConfigError::UnknownNode(format!("#{}", missing.index()).into()).into());
        }

        let signatures = SignatureEngine::new(options, db);
        let implicit: &dyn ImplicitCache = match implicit {
            Some(cache) => &**cache,
            None => &*db,
        };

        let discovery = discover_implicit(graph, targets, &signatures, implicit, options.implicit_cache)?;
        tracing::debug!(
            "implicit dependencies: {} files scanned, {} reused",
            discovery.scanned,
            discovery.reused
        );

        let cycles = graph.detect_cycles();
        if !cycles.is_empty() {
            return Err(ConfigError::Cycle(cycles).into());
        }

        let cache = if options.dry_run || options.question {
            None
        } else {
            ArtifactCache::open(&options.cache).unwrap_or_else(|e| {
                tracing::warn!("{}, building without the artifact cache", e);
                None
            })
        };

        let trace = match &options.trace {
            Some(path) => Some(Trace::create(path).map_err(TataraError::Trace)?),
            None => None,
        };

        let scheduler = Scheduler::new(options)?;
        let graph: &Graph = graph;
        let worker = Worker {
            graph,
            cache: cache.as_ref(),
        };

        let report = scheduler.run(&worker, |dispatcher| {
            Taskmaster::new(graph, options, &signatures, &discovery.forced)
                .with_cache(cache.as_ref())
                .with_status(status.as_ref())
                .with_trace(trace)
                .run(targets, dispatcher)
        });

        if !options.dry_run && !options.question {
            db.flush()?;
        }

        tracing::info!("{}", report);
        Ok(report)
    }

    /// Builds every node that nothing else depends on. Files a scanner once
    /// referenced but nothing references any more are left alone.
    pub fn build_all(&mut self) -> Result<BuildReport, TataraError> {
        let graph = &self.graph;
        let roots: Vec<NodeId> = graph
            .node_ids()
            .filter(|&id| graph.parents(id).is_empty() && !graph.node(id).is_discovered())
            .collect();
        self.build(&roots)
    }
}
