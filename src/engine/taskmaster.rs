//! The graph walker.
//!
//! The taskmaster is the single owner of per-run node state. It keeps a
//! ready set of pending nodes whose children have all finished, classifies
//! each one as fresh or stale, and hands stale nodes with an action to the
//! [`Dispatcher`]. Completions come back through the dispatcher and are
//! applied here, one at a time, so dependency counters are never shared
//! between threads.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;
use std::sync::mpsc::Sender;

use indicatif::ProgressStyle;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::ArtifactCache;
use crate::config::{ErrorPolicy, Options, Order};
use crate::core::{Blake3Hasher, Signature};
use crate::engine::report::{BuildReport, BuildStatus, NodeReport, StatusEvent, TaskExecution, Verdict};
use crate::engine::scheduler::{Completion, Dispatcher, Job, Produced};
use crate::engine::trace::{Trace, TraceRecord};
use crate::error::{BuildError, NodeError};
use crate::graph::{Graph, NodeId, NodeState};
use crate::signature::SignatureEngine;

static BUILD_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

/// Nodes whose children have all finished.
enum ReadySet {
    /// Lowest node id first, which is graph insertion order.
    Ordered(BTreeSet<NodeId>),
    Shuffled(Vec<NodeId>, StdRng),
}

impl ReadySet {
    fn new(options: &Options) -> Self {
        match options.order {
            Order::Deterministic => ReadySet::Ordered(BTreeSet::new()),
            Order::Random => {
                let seed = options.random_seed.unwrap_or_else(|| rand::rng().random());
                tracing::debug!("random task order, seed {}", seed);
                ReadySet::Shuffled(Vec::new(), StdRng::seed_from_u64(seed))
            }
        }
    }

    fn insert(&mut self, id: NodeId) {
        match self {
            ReadySet::Ordered(set) => {
                set.insert(id);
            }
            ReadySet::Shuffled(list, _) => list.push(id),
        }
    }

    fn pop(&mut self) -> Option<NodeId> {
        match self {
            ReadySet::Ordered(set) => set.pop_first(),
            ReadySet::Shuffled(list, rng) => {
                if list.is_empty() {
                    return None;
                }
                let i = rng.random_range(0..list.len());
                Some(list.swap_remove(i))
            }
        }
    }
}

/// Per-run bookkeeping for one node.
struct Slot {
    state: NodeState,
    /// Children that have not finished yet.
    waiting: usize,
    verdict: Option<Verdict>,
    /// The signature computed for the node this run.
    signature: Option<Signature>,
    /// The signature dependents see, which differs from `signature` for
    /// failures swallowed by ignore-errors.
    visible: Option<Signature>,
    error: Option<NodeError>,
    warning: Option<NodeError>,
    cache_hit: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: NodeState::Unvisited,
            waiting: 0,
            verdict: None,
            signature: None,
            visible: None,
            error: None,
            warning: None,
            cache_hit: false,
        }
    }
}

/// What to do with a node taken from the ready set.
enum Step {
    /// The node reached its final state without any work.
    Done,
    /// The node needs its action run.
    Submit(Job),
    /// Question mode met a stale node.
    Stale,
}

pub(crate) struct Taskmaster<'a> {
    graph: &'a Graph,
    options: &'a Options,
    signatures: &'a SignatureEngine<'a>,
    forced: &'a HashSet<NodeId>,
    cache: Option<&'a ArtifactCache>,
    status: Option<&'a Sender<StatusEvent>>,
    trace: Option<Trace>,
    slots: HashMap<NodeId, Slot>,
    ready: ReadySet,
    /// Ready nodes held back because a producer of a shared side effect is
    /// running.
    deferred: Vec<NodeId>,
    /// Side-effect nodes currently being written by a running job.
    busy: HashSet<NodeId>,
    execution_times: HashMap<NodeId, TaskExecution>,
    executed: usize,
    cache_hits: usize,
    stopped: bool,
    stale_found: bool,
}

impl<'a> Taskmaster<'a> {
    pub fn new(
        graph: &'a Graph,
        options: &'a Options,
        signatures: &'a SignatureEngine<'a>,
        forced: &'a HashSet<NodeId>,
    ) -> Self {
        Self {
            graph,
            options,
            signatures,
            forced,
            cache: None,
            status: None,
            trace: None,
            slots: HashMap::new(),
            ready: ReadySet::new(options),
            deferred: Vec::new(),
            busy: HashSet::new(),
            execution_times: HashMap::new(),
            executed: 0,
            cache_hits: 0,
            stopped: false,
            stale_found: false,
        }
    }

    /// Nodes that never reach a worker still get a line in the cache debug
    /// report.
    pub fn with_cache(mut self, cache: Option<&'a ArtifactCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_status(mut self, status: Option<&'a Sender<StatusEvent>>) -> Self {
        self.status = status;
        self
    }

    pub fn with_trace(mut self, trace: Option<Trace>) -> Self {
        self.trace = trace;
        self
    }

    /// Walks everything `targets` depend on and returns the outcome.
    pub fn run(mut self, targets: &[NodeId], dispatcher: &mut Dispatcher<'_, '_>) -> BuildReport {
        let total = self.visit(targets);

        let span = tracing::span!(Level::INFO, "build");
        span.pb_set_style(&BUILD_STYLE);
        span.pb_set_length(total as u64);
        span.pb_set_message("Building...");
        let _enter = span.enter();

        loop {
            while !self.stopped && dispatcher.in_flight() < self.options.jobs.get() {
                let Some(id) = self.ready.pop() else {
                    break;
                };

                if self.blocked_by_side_effect(id) {
                    self.deferred.push(id);
                    continue;
                }

                match self.evaluate(id) {
                    Step::Done => {
                        span.pb_inc(1);
                        self.finish(id);
                    }
                    Step::Submit(job) => {
                        self.claim_side_effects(id);
                        self.transition(id, NodeState::Executing, None);
                        dispatcher.submit(job);
                    }
                    Step::Stale => {
                        self.stale_found = true;
                        self.stopped = true;
                    }
                }
            }

            let Some(completion) = dispatcher.wait() else {
                break;
            };
            span.pb_inc(1);
            self.complete(completion);
        }

        self.report()
    }

    /// Marks every node in the closure of `targets` pending, children before
    /// parents, and seeds the ready set with the leaves.
    fn visit(&mut self, targets: &[NodeId]) -> usize {
        let closure = self.graph.closure(targets);
        for &id in &closure {
            self.slots.insert(id, Slot::new());
        }

        let mut stack: Vec<(NodeId, bool)> = targets.iter().rev().map(|&id| (id, false)).collect();
        while let Some((id, expanded)) = stack.pop() {
            if self.slots[&id].state != NodeState::Unvisited {
                continue;
            }
            if expanded {
                let children = self.graph.children(id);
                let waiting = children.len();
                self.slot(id).waiting = waiting;
                self.transition(id, NodeState::Pending, None);
                if waiting == 0 {
                    self.ready.insert(id);
                }
                continue;
            }

            stack.push((id, true));
            for child in self.graph.children(id).into_iter().rev() {
                if self.slots[&child].state == NodeState::Unvisited {
                    stack.push((child, false));
                }
            }
        }

        closure.len()
    }

    /// Decides the fate of a ready node.
    fn evaluate(&mut self, id: NodeId) -> Step {
        let graph = self.graph;
        let node = graph.node(id);
        let children = graph.children(id);

        if let Some(&failed) = children.iter().find(|&&child| self.poisons(child)) {
            let error = NodeError::new(BuildError::Dependency(graph.node(failed).key().into()));
            self.cache_debug(id, "skipped");
            self.fail(id, error);
            return Step::Done;
        }

        let inputs: Vec<(&str, Signature)> = children
            .iter()
            .map(|&child| {
                let signature = self.slots[&child].visible.unwrap_or_default();
                (graph.node(child).key(), signature)
            })
            .collect();

        let signature = match self.signatures.compute_signature(node, &inputs) {
            Ok(signature) => signature,
            Err(e) => {
                self.cache_debug(id, "skipped");
                self.fail(id, NodeError::new(e));
                return Step::Done;
            }
        };
        {
            let slot = self.slot(id);
            slot.signature = Some(signature);
            slot.visible = Some(signature);
        }

        if node.is_source() {
            return self.evaluate_source(id, signature);
        }

        let stale = self.forced.contains(&id)
            || self.signatures.is_stale(node, signature)
            || (node.has_action() && self.outputs_missing(id));

        if !stale {
            self.cache_debug(id, "fresh");
            self.slot(id).verdict = Some(Verdict::Fresh);
            self.transition(id, NodeState::UpToDate, None);
            return Step::Done;
        }

        self.slot(id).verdict = Some(Verdict::Stale);
        self.transition(id, NodeState::NeedsBuild, None);

        if self.options.question {
            return Step::Stale;
        }
        if self.options.dry_run {
            if let Some(action) = node.action() {
                tracing::info!("would build {} ({})", node.key(), action.identity());
            }
            return Step::Done;
        }

        if node.has_action() {
            Step::Submit(Job { id, signature })
        } else {
            // Aliases and side effects have nothing to run; their children
            // already did the work.
            self.cache_debug(id, "no-output");
            self.signatures.record_built(node, signature);
            self.transition(id, NodeState::Built, None);
            Step::Done
        }
    }

    fn evaluate_source(&mut self, id: NodeId, signature: Signature) -> Step {
        let graph = self.graph;
        let node = graph.node(id);
        self.cache_debug(id, "source");
        let exists = match node.path() {
            Some(path) => matches!(self.signatures.content(node.key(), path), Ok(Some(_))),
            None => false,
        };

        if !exists {
            self.fail(id, NodeError::new(BuildError::MissingSource(node.key().into())));
            return Step::Done;
        }

        self.slot(id).verdict = Some(Verdict::Fresh);
        if !self.options.dry_run && !self.options.question {
            self.signatures.record_built(node, signature);
        }
        self.transition(id, NodeState::UpToDate, None);
        Step::Done
    }

    /// Applies the result of a finished job.
    fn complete(&mut self, completion: Completion) {
        let Completion {
            id,
            outcome,
            start,
            duration,
        } = completion;
        let graph = self.graph;
        let node = graph.node(id);

        self.release_side_effects(id);
        self.execution_times.insert(id, TaskExecution { start, duration });

        match outcome {
            Ok(produced) => {
                let outcome = match produced {
                    Produced::Executed => {
                        self.executed += 1;
                        "executed"
                    }
                    Produced::Retrieved => {
                        self.cache_hits += 1;
                        self.slot(id).cache_hit = true;
                        "retrieved"
                    }
                };
                if let Some(signature) = self.slots[&id].signature {
                    self.signatures.record_built(node, signature);
                }
                self.transition(id, NodeState::Built, Some(outcome));
            }
            Err(error) if node.attributes.ignore_errors => {
                self.executed += 1;
                tracing::warn!("{} failed, ignoring: {}", node.key(), error);
                let outcome = error.to_string();
                let slot = self.slot(id);
                slot.visible = slot.signature.map(failure_marker);
                slot.warning = Some(error);
                self.transition(id, NodeState::Built, Some(&outcome));
            }
            Err(error) => {
                self.executed += 1;
                tracing::error!("{} failed: {}", node.key(), error);
                self.fail(id, error);
            }
        }

        self.finish(id);
    }

    /// Records a failure. Under ignore-errors dependents see a poisoned
    /// signature but are not failed themselves; otherwise the failure ends
    /// admission when the policy is to stop.
    fn fail(&mut self, id: NodeId, error: NodeError) {
        if self.options.errors == ErrorPolicy::Stop && !self.graph.node(id).attributes.ignore_errors {
            self.stopped = true;
        }

        let outcome = error.to_string();
        let marker = Signature::hash(self.graph.node(id).key());
        let slot = self.slot(id);
        slot.visible = Some(failure_marker(slot.signature.unwrap_or(marker)));
        slot.error = Some(error);
        self.transition(id, NodeState::Failed, Some(&outcome));
    }

    /// Releases the dependents of a finished node.
    fn finish(&mut self, id: NodeId) {
        for parent in self.graph.parents(id) {
            let Some(slot) = self.slots.get_mut(&parent) else {
                continue;
            };
            slot.waiting -= 1;
            if slot.waiting == 0 && slot.state == NodeState::Pending {
                self.ready.insert(parent);
            }
        }
    }

    fn poisons(&self, child: NodeId) -> bool {
        self.slots[&child].state == NodeState::Failed && !self.graph.node(child).attributes.ignore_errors
    }

    fn outputs_missing(&self, id: NodeId) -> bool {
        let graph = self.graph;
        let own = graph.node(id).path().is_some_and(|path| !path.exists());
        own || graph
            .side_effects(id)
            .into_iter()
            .filter_map(|side| graph.node(side).path())
            .any(|path| !path.exists())
    }

    fn blocked_by_side_effect(&self, id: NodeId) -> bool {
        !self.busy.is_empty()
            && self.graph.node(id).has_action()
            && self.graph.side_effects(id).iter().any(|side| self.busy.contains(side))
    }

    fn claim_side_effects(&mut self, id: NodeId) {
        self.busy.extend(self.graph.side_effects(id));
    }

    fn release_side_effects(&mut self, id: NodeId) {
        let sides = self.graph.side_effects(id);
        if sides.is_empty() {
            return;
        }
        for side in sides {
            self.busy.remove(&side);
        }
        for id in self.deferred.drain(..) {
            self.ready.insert(id);
        }
    }

    fn cache_debug(&self, id: NodeId, verdict: &str) {
        if let Some(cache) = self.cache {
            cache.debug(self.graph.node(id).key(), verdict);
        }
    }

    fn slot(&mut self, id: NodeId) -> &mut Slot {
        self.slots.entry(id).or_insert_with(Slot::new)
    }

    fn transition(&mut self, id: NodeId, to: NodeState, outcome: Option<&str>) {
        let graph = self.graph;
        let key = graph.node(id).key_arc();
        let slot = self.slot(id);
        let from = slot.state;
        debug_assert!(from < to, "{key}: {from} -> {to} goes backwards");
        slot.state = to;
        let verdict = slot.verdict;

        tracing::trace!("{}: {} -> {}", key, from, to);

        if let Some(trace) = &mut self.trace {
            trace.record(&TraceRecord {
                node: key,
                from,
                to,
                verdict,
                outcome,
            });
        }

        if let Some(status) = self.status {
            let _ = status.send(StatusEvent {
                id,
                key: key.clone(),
                from,
                to,
            });
        }
    }

    fn report(mut self) -> BuildReport {
        // Nodes left behind by an early stop never got to run.
        if self.stopped && !self.stale_found {
            let pending: Vec<NodeId> = self
                .slots
                .iter()
                .filter(|(_, slot)| slot.state == NodeState::Pending)
                .map(|(&id, _)| id)
                .collect();
            for id in pending {
                self.fail(id, NodeError::new(BuildError::Stopped));
            }
        }

        if let Some(trace) = self.trace.take() {
            trace.finish();
        }

        let status = if self.options.question {
            if self.stale_found {
                BuildStatus::NotUpToDate
            } else if self.slots.values().any(|slot| slot.state == NodeState::Failed) {
                BuildStatus::Failed
            } else {
                BuildStatus::UpToDate
            }
        } else if self.slots.values().any(|slot| slot.state == NodeState::Failed) {
            BuildStatus::Failed
        } else {
            BuildStatus::Success
        };

        let graph = self.graph;
        let nodes = self
            .slots
            .into_iter()
            .map(|(id, slot)| {
                let report = NodeReport {
                    key: graph.node(id).key_arc().clone(),
                    state: slot.state,
                    verdict: slot.verdict,
                    cache_hit: slot.cache_hit,
                    error: slot.error,
                    warning: slot.warning,
                };
                (id, report)
            })
            .collect();

        BuildReport {
            status,
            nodes,
            executed: self.executed,
            cache_hits: self.cache_hits,
            execution_times: self.execution_times,
        }
    }
}

/// The signature a failed node presents to its dependents. Never recorded,
/// so the failure is retried on the next run.
fn failure_marker(signature: Signature) -> Signature {
    let mut hasher = Blake3Hasher::default();
    hasher.field("failed").field(signature.as_bytes());
    hasher.into()
}
