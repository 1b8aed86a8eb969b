use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use console::style;

use crate::core::ArcStr;
use crate::error::NodeError;
use crate::graph::{NodeId, NodeState};

/// Overall outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    /// Every requested target ended up to date or built.
    Success,
    /// At least one node the targets depend on failed.
    Failed,
    /// Question mode found nothing to rebuild.
    UpToDate,
    /// Question mode found a stale node.
    NotUpToDate,
}

impl BuildStatus {
    /// Process exit code a front end should use for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            BuildStatus::Success | BuildStatus::UpToDate => 0,
            BuildStatus::NotUpToDate => 1,
            BuildStatus::Failed => 2,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::UpToDate)
    }
}

/// Result of comparing a node's signature with its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Fresh,
    Stale,
}

/// A state transition, delivered to status subscribers as it happens.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub id: NodeId,
    pub key: ArcStr,
    pub from: NodeState,
    pub to: NodeState,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub key: ArcStr,
    pub state: NodeState,
    pub verdict: Option<Verdict>,
    /// Restored from the artifact cache instead of being built.
    pub cache_hit: bool,
    /// Why the node failed.
    pub error: Option<NodeError>,
    /// Failure swallowed because the node ignores errors.
    pub warning: Option<NodeError>,
}

/// Everything a build run found out.
#[derive(Debug)]
pub struct BuildReport {
    pub status: BuildStatus,
    /// Final state of every node the targets depend on.
    pub nodes: BTreeMap<NodeId, NodeReport>,
    /// Number of actions that actually ran.
    pub executed: usize,
    /// Number of targets restored from the artifact cache.
    pub cache_hits: usize,
    pub execution_times: HashMap<NodeId, TaskExecution>,
}

impl BuildReport {
    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.get(&id).map(|node| node.state)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeReport> {
        self.nodes.get(&id)
    }

    /// Looks a node up by key.
    pub fn find(&self, key: &str) -> Option<&NodeReport> {
        self.nodes.values().find(|node| &*node.key == key)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|node| node.state == state).count()
    }

    /// Nodes that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &NodeError)> {
        self.nodes
            .values()
            .filter_map(|node| node.error.as_ref().map(|error| (&*node.key, error)))
    }
}

impl Display for BuildReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let status = match self.status {
            BuildStatus::Success => style("build succeeded").green(),
            BuildStatus::UpToDate => style("up to date").green(),
            BuildStatus::NotUpToDate => style("not up to date").yellow(),
            BuildStatus::Failed => style("build failed").red(),
        };

        write!(
            f,
            "{}: {} built, {} up to date, {} failed",
            status.bold(),
            self.count(NodeState::Built),
            self.count(NodeState::UpToDate),
            self.count(NodeState::Failed),
        )?;

        let pending = self.count(NodeState::NeedsBuild);
        if pending > 0 {
            write!(f, ", {pending} need building")?;
        }
        if self.cache_hits > 0 {
            write!(f, " ({} from cache)", self.cache_hits)?;
        }

        for (key, error) in self.failures() {
            write!(f, "\n  {} {}: {}", style("✗").red(), key, error)?;
        }

        Ok(())
    }
}
