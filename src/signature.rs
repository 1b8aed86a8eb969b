//! Change detection.
//!
//! A node's signature folds together everything that determines its
//! output: the identity of its action, the signatures of all its
//! dependencies (explicit and implicit, in order) and, for source files,
//! a fingerprint of their contents. A node is stale when the freshly
//! computed signature differs from the one recorded after its last build.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;

use crate::config::{ChangePolicy, Options};
use crate::core::{Blake3Hasher, Signature};
use crate::db::{ContentInfo, SignatureDb};
use crate::graph::Node;

/// Domain separator, bumped whenever the signature layout changes.
const SIGNATURE_TAG: &str = "tatara:node:v1";

/// Computes and records node signatures.
pub struct SignatureEngine<'a> {
    policy: ChangePolicy,
    max_drift: i64,
    chunk_size: usize,
    db: &'a SignatureDb,
    /// Content fingerprints already taken during this run.
    contents: Mutex<HashMap<String, Option<ContentInfo>>>,
}

impl<'a> SignatureEngine<'a> {
    pub fn new(options: &Options, db: &'a SignatureDb) -> Self {
        Self {
            policy: options.change_policy,
            max_drift: options.max_drift,
            chunk_size: options.hash_chunk_size,
            db,
            contents: Mutex::new(HashMap::new()),
        }
    }

    /// Fingerprints the file behind `key`. Returns `None` when the file
    /// doesn't exist.
    ///
    /// With [`ChangePolicy::Timestamp`] the recorded hash is reused when the
    /// modification time and size match the record and the file was last
    /// modified longer than the drift tolerance ago. Files touched more
    /// recently than that (or "in the future") are rehashed, since their
    /// timestamps can't yet be trusted.
    pub fn content(&self, key: &str, path: &Utf8Path) -> io::Result<Option<ContentInfo>> {
        if let Some(info) = self.lock().get(key) {
            return Ok(*info);
        }

        let info = self.fingerprint(key, path)?;
        self.lock().insert(key.to_string(), info);
        Ok(info)
    }

    fn fingerprint(&self, key: &str, path: &Utf8Path) -> io::Result<Option<ContentInfo>> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let (mtime, mtime_nanos) = split_time(metadata.modified()?);
        let size = metadata.len();

        if self.policy == ChangePolicy::Timestamp
            && let Some(recorded) = self.db.content(key)
            && recorded.mtime == mtime
            && recorded.mtime_nanos == mtime_nanos
            && recorded.size == size
            && self.outside_drift(mtime)
        {
            tracing::trace!("{} unchanged by timestamp", key);
            return Ok(Some(recorded));
        }

        let hash = Signature::hash_file(path, self.chunk_size)?;
        tracing::trace!("hashed {} ({} bytes)", key, size);

        Ok(Some(ContentInfo {
            mtime,
            mtime_nanos,
            size,
            hash,
        }))
    }

    fn outside_drift(&self, mtime: i64) -> bool {
        if self.max_drift < 0 {
            return false;
        }
        let (now, _) = split_time(SystemTime::now());
        now.saturating_sub(mtime) > self.max_drift
    }

    /// Folds a node and the signatures of its dependencies into its
    /// signature. `children` must list every dependency, with the signature
    /// each one ended the run with, in the order the graph reports them.
    pub fn compute_signature(
        &self,
        node: &Node,
        children: &[(&str, Signature)],
    ) -> io::Result<Signature> {
        let mut hasher = Blake3Hasher::default();
        hasher.field(SIGNATURE_TAG);

        match node.action() {
            Some(action) => hasher.field("action").field(action.identity().as_bytes()),
            None => hasher.field("none"),
        };

        for (key, signature) in children {
            hasher.field(key).field(signature.as_bytes());
        }

        if node.is_source()
            && let Some(path) = node.path()
        {
            match self.content(node.key(), path)? {
                Some(content) => hasher.field("content").field(content.hash.as_bytes()),
                None => hasher.field("missing"),
            };
        }

        Ok(hasher.into())
    }

    /// Compares a freshly computed signature with the last recorded one.
    /// Nodes without a record, or flagged always-build, are stale.
    pub fn is_stale(&self, node: &Node, signature: Signature) -> bool {
        if node.attributes.always_build {
            return true;
        }
        self.db.signature(node.key()) != Some(signature)
    }

    /// Persists the signature of a successfully built node, replacing the
    /// previous record. Source files also get their content fingerprint
    /// recorded so the timestamp fast path can use it next time.
    pub fn record_built(&self, node: &Node, signature: Signature) {
        self.db.set_signature(node.key(), signature);

        if node.is_source()
            && let Some(Some(content)) = self.lock().get(node.key())
        {
            self.db.set_content(node.key(), *content);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<ContentInfo>>> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn split_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => (duration.as_secs() as i64, duration.subsec_nanos()),
        Err(e) => (-(e.duration().as_secs() as i64), 0),
    }
}
