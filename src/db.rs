//! The signature database.
//!
//! The only state that survives between runs besides the artifact cache:
//! for every node key, the signature it was last built with, the content
//! fingerprint of source files, and cached scanner results.
//!
//! All records sit behind one mutex. Updates from concurrent workers are
//! therefore serialized and can't tear the map, and flushing writes a
//! snapshot through a temporary file that is renamed into place.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Signature;
use crate::error::DatabaseError;
use crate::scanner::{ImplicitCache, ScanEntry};

const VERSION: u32 = 1;

/// Fingerprint of a file's contents along with the metadata that allows it
/// to be reused without rehashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    pub mtime_nanos: u32,
    pub size: u64,
    pub hash: Signature,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Signature of the inputs the current output was built from.
    pub signature: Option<Signature>,
    /// Content fingerprint, for files.
    pub content: Option<ContentInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    version: u32,
    nodes: BTreeMap<String, NodeRecord>,
    scans: BTreeMap<String, ScanEntry>,
}

#[derive(Debug)]
pub struct SignatureDb {
    path: Option<Utf8PathBuf>,
    records: Mutex<Records>,
}

impl SignatureDb {
    /// A database that is never written anywhere.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Records {
                version: VERSION,
                ..Default::default()
            }),
        }
    }

    /// Loads the database at `path`. A missing file is an empty database. A
    /// file from an incompatible version is discarded, which only costs a
    /// full rebuild.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, DatabaseError> {
        let path = path.into();

        let records = match File::open(&path) {
            Ok(file) => {
                let records: Records = ciborium::from_reader(BufReader::new(file))?;
                if records.version == VERSION {
                    records
                } else {
                    tracing::warn!(
                        "signature database {} has version {}, starting fresh",
                        path,
                        records.version
                    );
                    Records {
                        version: VERSION,
                        ..Default::default()
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Records {
                version: VERSION,
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("loaded {} node records from {}", records.nodes.len(), path);

        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<NodeRecord> {
        self.lock().nodes.get(key).cloned()
    }

    pub fn signature(&self, key: &str) -> Option<Signature> {
        self.lock().nodes.get(key).and_then(|record| record.signature)
    }

    pub fn content(&self, key: &str) -> Option<ContentInfo> {
        self.lock().nodes.get(key).and_then(|record| record.content)
    }

    pub fn set_signature(&self, key: &str, signature: Signature) {
        self.lock().nodes.entry(key.to_string()).or_default().signature = Some(signature);
    }

    pub fn set_content(&self, key: &str, content: ContentInfo) {
        self.lock().nodes.entry(key.to_string()).or_default().content = Some(content);
    }

    pub fn remove(&self, key: &str) -> Option<NodeRecord> {
        self.lock().nodes.remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    /// Writes the current records to disk. Does nothing for an in-memory
    /// database.
    pub fn flush(&self) -> Result<(), DatabaseError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let temp = path.with_extension(format!("tmp-{}", std::process::id()));
        {
            let records = self.lock();
            let mut writer = BufWriter::new(File::create(&temp)?);
            ciborium::into_writer(&*records, &mut writer)?;
            writer.flush()?;
        }
        fs::rename(&temp, path)?;

        tracing::debug!("wrote signature database {}", path);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImplicitCache for SignatureDb {
    fn get(&self, key: &str) -> Option<ScanEntry> {
        self.lock().scans.get(key).cloned()
    }

    fn put(&self, key: &str, entry: ScanEntry) {
        self.lock().scans.insert(key.to_string(), entry);
    }
}
