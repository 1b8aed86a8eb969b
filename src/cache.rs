//! Content-addressed artifact cache.
//!
//! Entries are plain files stored under `<dir>/<first two hex digits>/<hex>`,
//! where the hex string is the cache key of the node. Entries are written
//! through a temporary file and renamed into place, so a reader never sees a
//! partial entry and two writers racing on the same key simply leave one of
//! two identical files behind.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{CacheMode, CacheOptions};
use crate::core::{Blake3Hasher, Signature};
use crate::error::CacheError;

pub struct ArtifactCache {
    dir: Utf8PathBuf,
    mode: CacheMode,
    show: bool,
    debug: Option<Mutex<BufWriter<File>>>,
}

impl ArtifactCache {
    /// Opens the cache described by `options`. Returns `None` when caching is
    /// disabled and no debug report was asked for. Without a directory the
    /// cache behaves as disabled.
    pub fn open(options: &CacheOptions) -> Result<Option<Self>, CacheError> {
        let mode = match options.dir {
            Some(_) => options.mode,
            None => CacheMode::Disabled,
        };
        if mode == CacheMode::Disabled && options.debug.is_none() {
            return Ok(None);
        }

        let dir = options.dir.clone().unwrap_or_default();
        if mode != CacheMode::Disabled {
            fs::create_dir_all(&dir).map_err(|e| CacheError::Io(dir.clone(), e))?;
        }

        let debug = match &options.debug {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|e| CacheError::Io(parent.to_path_buf(), e))?;
                }
                let file = File::create(path).map_err(|e| CacheError::Io(path.clone(), e))?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };

        tracing::debug!("artifact cache at {} ({:?})", dir, mode);

        Ok(Some(Self {
            dir,
            mode,
            show: options.show,
            debug,
        }))
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Whether retrieved targets should print their action description.
    pub fn show(&self) -> bool {
        self.show
    }

    /// Location of the entry for `key`.
    pub fn entry_path(&self, key: Signature) -> Utf8PathBuf {
        let hex = key.to_hex();
        self.dir.join(&hex[..2]).join(hex)
    }

    /// Returns the path of the entry for `key` if there is one.
    pub fn lookup(&self, key: Signature) -> Option<Utf8PathBuf> {
        if !self.mode.allows_lookup() {
            return None;
        }
        let path = self.entry_path(key);
        path.is_file().then_some(path)
    }

    /// Copies the entry for `key` to `target`. Returns `false` on a miss.
    pub fn retrieve(&self, key: Signature, target: &Utf8Path) -> Result<bool, CacheError> {
        let Some(entry) = self.lookup(key) else {
            return Ok(false);
        };

        if let Some(dir) = target.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| CacheError::Io(dir.to_path_buf(), e))?;
        }

        let temp = temp_path(target);
        fs::copy(&entry, &temp).map_err(|e| CacheError::Io(entry.clone(), e))?;
        fs::rename(&temp, target).map_err(|e| CacheError::Io(target.to_path_buf(), e))?;

        Ok(true)
    }

    /// Stores the file at `source` under `key`. Does nothing in modes that
    /// don't store.
    pub fn store(&self, key: Signature, source: &Utf8Path) -> Result<(), CacheError> {
        if !self.mode.allows_store() {
            return Ok(());
        }

        let entry = self.entry_path(key);
        let dir = entry.parent().unwrap_or(&self.dir);
        fs::create_dir_all(dir).map_err(|e| CacheError::Io(dir.to_path_buf(), e))?;

        let temp = temp_path(&entry);
        fs::copy(source, &temp).map_err(|e| CacheError::Io(source.to_path_buf(), e))?;
        fs::rename(&temp, &entry).map_err(|e| CacheError::Io(entry.clone(), e))?;

        tracing::trace!("cached {} as {}", source, key);
        Ok(())
    }

    /// Appends one line to the debug report, if one was requested.
    pub fn debug(&self, node: &str, verdict: &str) {
        let Some(debug) = &self.debug else {
            return;
        };

        let mut writer = debug.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let line = format!("{} {} {}", self.mode_name(), verdict, node);
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            tracing::warn!("couldn't write the cache debug report: {}", e);
        }
    }

    fn mode_name(&self) -> &'static str {
        match self.mode {
            CacheMode::Normal => "normal",
            CacheMode::Force => "force",
            CacheMode::ReadOnly => "readonly",
            CacheMode::Disabled => "disabled",
        }
    }
}

/// Cache key of a node: its signature combined with its key, since several
/// targets built by one action share a signature but not their contents.
pub fn cache_key(signature: Signature, key: &str) -> Signature {
    let mut hasher = Blake3Hasher::default();
    hasher.field("tatara:cache:v1").field(signature.as_bytes()).field(key);
    hasher.into()
}

fn temp_path(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("entry");
    path.with_file_name(format!(".{name}.tmp-{}-{:?}", std::process::id(), std::thread::current().id()))
}
