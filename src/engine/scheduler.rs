//! The job scheduler.
//!
//! Actions run on a fixed-size rayon pool. The taskmaster hands over one
//! [`Job`] per stale node and gets a [`Completion`] back through a channel;
//! workers never touch the walk's state themselves.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use indicatif::ProgressStyle;
use rayon::{Scope, ThreadPool, ThreadPoolBuilder};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::action::ActionContext;
use crate::cache::{ArtifactCache, cache_key};
use crate::config::{CacheMode, Options};
use crate::core::Signature;
use crate::error::{BuildError, NodeError, TataraError};
use crate::graph::{Dependency, Graph, NodeId};

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("Error setting task spinner template")
});

/// A stale node handed to a worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Job {
    pub id: NodeId,
    pub signature: Signature,
}

/// How a job produced its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Produced {
    Executed,
    Retrieved,
}

#[derive(Debug)]
pub(crate) struct Completion {
    pub id: NodeId,
    pub outcome: Result<Produced, NodeError>,
    pub start: Instant,
    pub duration: Duration,
}

pub(crate) struct Scheduler {
    pool: ThreadPool,
}

impl Scheduler {
    pub fn new(options: &Options) -> Result<Self, TataraError> {
        let mut builder = ThreadPoolBuilder::new()
            .num_threads(options.jobs.get())
            .thread_name(|i| format!("tatara-worker-{i}"));

        if let Some(kib) = options.stack_size {
            builder = builder.stack_size(kib * 1024);
        }

        Ok(Self {
            pool: builder.build()?,
        })
    }

    /// Runs `walk` on the calling thread while jobs it submits through the
    /// [`Dispatcher`] execute on the pool. Returns once `walk` returns and
    /// every submitted job has finished.
    pub fn run<'env, R>(
        &self,
        worker: &'env Worker<'env>,
        walk: impl FnOnce(&mut Dispatcher<'_, 'env>) -> R,
    ) -> R {
        self.pool.in_place_scope(|scope| {
            let (sender, receiver) = channel();
            let mut dispatcher = Dispatcher {
                scope,
                worker,
                sender,
                receiver,
                in_flight: 0,
            };
            walk(&mut dispatcher)
        })
    }
}

/// The taskmaster's handle on the pool.
pub(crate) struct Dispatcher<'s, 'env> {
    scope: &'s Scope<'env>,
    worker: &'env Worker<'env>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    in_flight: usize,
}

impl Dispatcher<'_, '_> {
    pub fn submit(&mut self, job: Job) {
        let worker = self.worker;
        let sender = self.sender.clone();
        self.in_flight += 1;

        self.scope.spawn(move |_| {
            let completion = worker.run(job);
            // The receiver outlives the scope, so this only fails if the
            // walk itself panicked.
            let _ = sender.send(completion);
        });
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Blocks until a submitted job finishes. Returns `None` when nothing is
    /// running.
    pub fn wait(&mut self) -> Option<Completion> {
        if self.in_flight == 0 {
            return None;
        }
        let completion = self.receiver.recv().ok()?;
        self.in_flight -= 1;
        Some(completion)
    }
}

/// What a worker needs to run a job.
pub(crate) struct Worker<'a> {
    pub graph: &'a Graph,
    pub cache: Option<&'a ArtifactCache>,
}

impl Worker<'_> {
    fn run(&self, job: Job) -> Completion {
        let node = self.graph.node(job.id);

        let span = tracing::span!(Level::INFO, "task", name = node.key());
        span.pb_set_style(&TASK_STYLE);
        span.pb_set_message(&format!("Building {}", node.key()));
        let _enter = span.enter();

        let start = Instant::now();

        // Panics are caught so a misbehaving action only fails its own node;
        // the job holds no shared state that a panic could leave half-updated.
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.produce(job))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };
                Err(NodeError::new(BuildError::Panic(msg)))
            }
        };

        Completion {
            id: job.id,
            outcome,
            start,
            duration: start.elapsed(),
        }
    }

    fn produce(&self, job: Job) -> Result<Produced, NodeError> {
        let node = self.graph.node(job.id);
        let Some(action) = node.action() else {
            return Ok(Produced::Executed);
        };

        let inputs: Vec<Utf8PathBuf> = self
            .graph
            .children_of_kind(job.id, Dependency::Explicit)
            .into_iter()
            .filter_map(|child| self.graph.node(child).path().map(|p| p.to_path_buf()))
            .collect();

        let side_effects = self.graph.side_effects(job.id);
        let outputs: Vec<Utf8PathBuf> = node
            .path()
            .into_iter()
            .map(|p| p.to_path_buf())
            .chain(
                side_effects
                    .iter()
                    .filter_map(|&side| self.graph.node(side).path().map(|p| p.to_path_buf())),
            )
            .collect();

        let context = ActionContext {
            target: node.key(),
            inputs: &inputs,
            outputs: &outputs,
        };

        // Only single-output nodes are cached: side effects couldn't be
        // restored along with the target.
        let cache = match (self.cache, node.path()) {
            (Some(cache), _) if cache.mode() == CacheMode::Disabled => {
                cache.debug(node.key(), "bypass");
                None
            }
            (Some(cache), _) if !side_effects.is_empty() => {
                cache.debug(node.key(), "side-effects");
                None
            }
            (Some(cache), None) => {
                cache.debug(node.key(), "no-output");
                None
            }
            (Some(cache), Some(path)) => Some((cache, path, cache_key(job.signature, node.key()))),
            (None, _) => None,
        };

        if let Some((cache, path, key)) = cache {
            match cache.retrieve(key, path) {
                Ok(true) => {
                    cache.debug(node.key(), "hit");
                    if cache.show() {
                        tracing::info!("{}", action.describe(&context));
                    } else {
                        tracing::info!("Retrieved {} from cache", node.key());
                    }
                    return Ok(Produced::Retrieved);
                }
                Ok(false) => cache.debug(node.key(), "miss"),
                Err(e) => {
                    cache.debug(node.key(), "error");
                    tracing::warn!("{}", e);
                }
            }
        }

        if !node.attributes.precious
            && let Some(path) = node.path()
        {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::trace!("removed stale {}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("couldn't remove {}: {}", path, e),
            }
        }

        tracing::info!("{}", action.describe(&context));
        action.execute(&context)?;

        if let Some(path) = node.path() {
            if !path.exists() {
                return Err(NodeError::new(BuildError::MissingOutput(node.key().into())));
            }

            if let Some((cache, _, key)) = cache
                && let Err(e) = cache.store(key, path)
            {
                tracing::warn!("{}", e);
            }
        }

        Ok(Produced::Executed)
    }
}
