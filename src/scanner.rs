//! Implicit dependency discovery.
//!
//! A [`Scanner`] attached to a target inspects the contents of the target's
//! explicit inputs and names further files they reference, like headers
//! pulled in by a C source. Discovered files become implicit dependencies
//! of the target and, transitively, are scanned themselves.
//!
//! Scan results are cached per scanned file, keyed by that file's signature
//! at scan time. The [`ImplicitCacheMode`] decides whether the cache is
//! trusted.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::ImplicitCacheMode;
use crate::core::{Blake3Hasher, Signature};
use crate::error::TataraError;
use crate::graph::{Dependency, Graph, NodeId};
use crate::signature::SignatureEngine;

pub trait Scanner: Send + Sync {
    /// Folded into the scan cache key, so switching scanners invalidates
    /// cached results.
    fn identity(&self) -> Cow<'_, str>;

    /// Returns the paths referenced by the file at `path` whose contents are
    /// `content`.
    fn scan(&self, path: &Utf8Path, content: &[u8]) -> Vec<Utf8PathBuf>;
}

/// Finds `#include "file"` style references.
///
/// Every line starting with one of the configured directives contributes
/// the quoted (or bare) word that follows. Relative references resolve
/// against the directory of the scanned file.
#[derive(Debug, Clone)]
pub struct IncludeScanner {
    directives: Vec<String>,
}

impl Default for IncludeScanner {
    fn default() -> Self {
        Self::new(["#include"])
    }
}

impl IncludeScanner {
    pub fn new<I, S>(directives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            directives: directives.into_iter().map(Into::into).collect(),
        }
    }

    fn reference<'a>(&self, line: &'a str) -> Option<&'a str> {
        let line = line.trim_start();
        let rest = self
            .directives
            .iter()
            .find_map(|directive| line.strip_prefix(directive.as_str()))?;

        // The directive has to be a whole word.
        if !rest.starts_with(char::is_whitespace) && !rest.starts_with('"') {
            return None;
        }

        let rest = rest.trim_start();

        // System references (`<stdio.h>`) are not tracked.
        if rest.starts_with('<') {
            return None;
        }

        let name = match rest.strip_prefix('"') {
            Some(quoted) => quoted.split('"').next()?,
            None => rest.split_whitespace().next()?,
        };

        (!name.is_empty()).then_some(name)
    }
}

impl Scanner for IncludeScanner {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Owned(format!("include:{}", self.directives.join(",")))
    }

    fn scan(&self, path: &Utf8Path, content: &[u8]) -> Vec<Utf8PathBuf> {
        let text = String::from_utf8_lossy(content);
        let base = path.parent().unwrap_or(Utf8Path::new(""));

        text.lines()
            .filter_map(|line| self.reference(line))
            .map(|name| {
                let name = Utf8Path::new(name);
                if name.is_absolute() {
                    name.to_path_buf()
                } else {
                    base.join(name)
                }
            })
            .collect()
    }
}

/// A previously computed scan result.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanEntry {
    /// Signature of the scanned file and scanner at scan time.
    pub signature: Signature,
    /// Keys of the referenced nodes.
    pub dependencies: Vec<String>,
}

/// Storage for scan results, keyed by the scanned node's key.
pub trait ImplicitCache: Send + Sync {
    fn get(&self, key: &str) -> Option<ScanEntry>;
    fn put(&self, key: &str, entry: ScanEntry);
}

/// Cache that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct MemoryImplicitCache {
    entries: Mutex<HashMap<String, ScanEntry>>,
}

impl ImplicitCache for MemoryImplicitCache {
    fn get(&self, key: &str) -> Option<ScanEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn put(&self, key: &str, entry: ScanEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), entry);
    }
}

/// Outcome of the discovery pass.
#[derive(Debug, Default)]
pub(crate) struct Discovery {
    /// Targets that must be treated as changed regardless of signatures.
    pub forced: HashSet<NodeId>,
    /// Files actually read and scanned, as opposed to served from cache.
    pub scanned: usize,
    /// Files whose references came from the cache.
    pub reused: usize,
}

/// Runs every scanner reachable from `roots` and records what they find as
/// implicit dependencies in `graph`.
pub(crate) fn discover_implicit(
    graph: &mut Graph,
    roots: &[NodeId],
    engine: &SignatureEngine,
    cache: &dyn ImplicitCache,
    mode: ImplicitCacheMode,
) -> Result<Discovery, TataraError> {
    let mut discovery = Discovery::default();

    // Edges found by an earlier pass may no longer hold.
    let previous = graph.closure(roots);
    graph.clear_implicit(&previous);

    let targets: Vec<NodeId> = graph
        .closure(roots)
        .into_iter()
        .filter(|&id| graph.node(id).scanner.is_some())
        .collect();

    // Results for one scanner and file are the same no matter which target
    // asked, so they are shared across targets within a pass.
    let mut memo: HashMap<(String, NodeId), Vec<String>> = HashMap::new();

    for target in targets {
        let Some(scanner) = graph.node(target).scanner.clone() else {
            continue;
        };
        let identity = scanner.identity().into_owned();

        if mode == ImplicitCacheMode::ForceChanged {
            discovery.forced.insert(target);
        }

        let mut queue: Vec<NodeId> = graph.children_of_kind(target, Dependency::Explicit);
        queue.reverse();
        let mut visited: BTreeSet<NodeId> = queue.iter().copied().collect();

        while let Some(file) = queue.pop() {
            let memo_key = (identity.clone(), file);
            let references = match memo.get(&memo_key) {
                Some(references) => references.clone(),
                None => {
                    let references =
                        scan_file(graph, file, &*scanner, &identity, engine, cache, mode, &mut discovery)?;
                    memo.insert(memo_key, references.clone());
                    references
                }
            };

            for key in references {
                let dependency = graph.add_discovered(&key);
                if dependency == target {
                    continue;
                }
                if graph.add_implicit(target, dependency) {
                    tracing::debug!("{} implicitly depends on {}", graph.node(target).key(), key);
                }
                if visited.insert(dependency) {
                    queue.push(dependency);
                }
            }
        }
    }

    Ok(discovery)
}

#[allow(clippy::too_many_arguments)]
fn scan_file(
    graph: &Graph,
    file: NodeId,
    scanner: &dyn Scanner,
    identity: &str,
    engine: &SignatureEngine,
    cache: &dyn ImplicitCache,
    mode: ImplicitCacheMode,
    discovery: &mut Discovery,
) -> Result<Vec<String>, TataraError> {
    let node = graph.node(file);
    let Some(path) = node.path() else {
        return Ok(Vec::new());
    };

    // Files that don't exist yet (generated ones) can't be inspected.
    let Some(content) = engine.content(node.key(), path)? else {
        return Ok(Vec::new());
    };

    let signature: Signature = {
        let mut hasher = Blake3Hasher::default();
        hasher.field(identity).field(content.hash.as_bytes());
        hasher.into()
    };

    let cached = match mode {
        ImplicitCacheMode::Disabled | ImplicitCacheMode::ForceChanged => None,
        ImplicitCacheMode::Trust => cache.get(node.key()).filter(|entry| entry.signature == signature),
        ImplicitCacheMode::ForceUnchanged => cache.get(node.key()),
    };

    if let Some(entry) = cached {
        discovery.reused += 1;
        return Ok(entry.dependencies);
    }

    let bytes = fs::read(path)?;
    let dependencies: Vec<String> = scanner
        .scan(path, &bytes)
        .into_iter()
        .map(|path| path.into_string())
        .collect();
    discovery.scanned += 1;

    cache.put(
        node.key(),
        ScanEntry {
            signature,
            dependencies: dependencies.clone(),
        },
    );

    Ok(dependencies)
}
