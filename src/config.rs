//! Build options.
//!
//! [`Options`] is an immutable value constructed once by the front end and
//! handed to the [`Engine`](crate::Engine) at construction time. Nothing in
//! the engine reads global state; every switch that changes behaviour lives
//! here.

use std::num::NonZeroUsize;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Two days, the default tolerance for unreliable file system clocks.
pub const DEFAULT_MAX_DRIFT: i64 = 2 * 24 * 60 * 60;

/// Default read size used when hashing file contents.
pub const DEFAULT_HASH_CHUNK_SIZE: usize = 64 * 1024;

/// What happens to the rest of the build once an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Stop admitting new tasks; running actions are allowed to finish.
    #[default]
    Stop,
    /// Build every branch that does not depend on the failed node.
    KeepGoing,
}

/// Order among tasks that are ready at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Order {
    /// Ready tasks are taken in graph insertion order.
    #[default]
    Deterministic,
    /// Ready tasks are shuffled, which surfaces configurations that silently
    /// rely on an undeclared ordering.
    Random,
}

/// How the content fingerprint of a source file is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangePolicy {
    /// Reuse the recorded content hash when the file's modification time and
    /// size are unchanged and the modification time lies outside the clock
    /// drift window. Otherwise fall back to hashing.
    #[default]
    Timestamp,
    /// Always hash the full contents.
    Content,
}

/// Policy for reusing implicit dependencies found by scanners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImplicitCacheMode {
    /// Never consult the cache, always rescan.
    Disabled,
    /// Reuse a cached list when the scanned file's signature is unchanged.
    #[default]
    Trust,
    /// Rescan everything and treat every scanning target as changed.
    ForceChanged,
    /// Reuse a cached list even when the scanned file has changed.
    ForceUnchanged,
}

/// Artifact cache behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Look up before building, store after building.
    #[default]
    Normal,
    /// Always build, then store. Used to refresh a shared cache.
    Force,
    /// Look up, never store.
    ReadOnly,
    /// Bypass the cache entirely.
    Disabled,
}

impl CacheMode {
    pub fn allows_lookup(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::ReadOnly)
    }

    pub fn allows_store(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Force)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub mode: CacheMode,
    /// Cache directory. The cache is inactive when this is unset.
    pub dir: Option<Utf8PathBuf>,
    /// Describe the action of a retrieved target as if it had been run.
    pub show: bool,
    /// Destination for a per-node report of cache decisions.
    pub debug: Option<Utf8PathBuf>,
}

/// Immutable build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Number of actions that may run at once.
    pub jobs: NonZeroUsize,
    pub errors: ErrorPolicy,
    /// Walk the graph and report decisions without executing or persisting.
    pub dry_run: bool,
    /// Stop at the first stale node and only report whether the targets are
    /// up to date.
    pub question: bool,
    pub order: Order,
    /// Seed for [`Order::Random`]. A fresh seed is drawn when unset.
    pub random_seed: Option<u64>,
    /// Clock drift tolerance in seconds. Negative disables the timestamp
    /// fast path.
    pub max_drift: i64,
    /// Read size in bytes for content hashing.
    pub hash_chunk_size: usize,
    pub change_policy: ChangePolicy,
    pub implicit_cache: ImplicitCacheMode,
    pub cache: CacheOptions,
    /// Worker thread stack size in KiB. Platform default when unset.
    pub stack_size: Option<usize>,
    /// Destination for the per-node decision trace.
    pub trace: Option<Utf8PathBuf>,
    /// Location of the persisted signature database. Kept in memory only
    /// when unset.
    pub database: Option<Utf8PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            jobs: NonZeroUsize::MIN,
            errors: ErrorPolicy::default(),
            dry_run: false,
            question: false,
            order: Order::default(),
            random_seed: None,
            max_drift: DEFAULT_MAX_DRIFT,
            hash_chunk_size: DEFAULT_HASH_CHUNK_SIZE,
            change_policy: ChangePolicy::default(),
            implicit_cache: ImplicitCacheMode::default(),
            cache: CacheOptions::default(),
            stack_size: None,
            trace: None,
            database: None,
        }
    }
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }
}

/// Builder for [`Options`], with string-typed setters for front ends that
/// receive settings as text.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn jobs(mut self, jobs: usize) -> Result<Self, ConfigError> {
        self.options.jobs = NonZeroUsize::new(jobs).ok_or_else(|| ConfigError::InvalidOption {
            name: "jobs".into(),
            value: jobs.to_string().into(),
            reason: "a positive integer is required",
        })?;
        Ok(self)
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.options.errors = if keep_going {
            ErrorPolicy::KeepGoing
        } else {
            ErrorPolicy::Stop
        };
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.options.dry_run = dry_run;
        self
    }

    pub fn question(mut self, question: bool) -> Self {
        self.options.question = question;
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.options.order = order;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.options.random_seed = Some(seed);
        self
    }

    pub fn max_drift(mut self, seconds: i64) -> Self {
        self.options.max_drift = seconds;
        self
    }

    pub fn hash_chunk_size(mut self, bytes: usize) -> Result<Self, ConfigError> {
        if bytes == 0 {
            return Err(ConfigError::InvalidOption {
                name: "hash_chunk_size".into(),
                value: "0".into(),
                reason: "a positive integer is required",
            });
        }
        self.options.hash_chunk_size = bytes;
        Ok(self)
    }

    pub fn change_policy(mut self, policy: ChangePolicy) -> Self {
        self.options.change_policy = policy;
        self
    }

    pub fn implicit_cache(mut self, mode: ImplicitCacheMode) -> Self {
        self.options.implicit_cache = mode;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.options.cache.mode = mode;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.options.cache.dir = Some(dir.into());
        self
    }

    pub fn cache_show(mut self, show: bool) -> Self {
        self.options.cache.show = show;
        self
    }

    pub fn cache_debug(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.options.cache.debug = Some(path.into());
        self
    }

    pub fn stack_size(mut self, kib: usize) -> Self {
        self.options.stack_size = Some(kib);
        self
    }

    pub fn trace(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.options.trace = Some(path.into());
        self
    }

    pub fn database(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.options.database = Some(path.into());
        self
    }

    /// Sets an option from its textual name and value.
    ///
    /// Only the subset of options that makes sense to adjust from a build
    /// description is accepted; anything else is rejected with
    /// [`ConfigError::UnknownOption`].
    pub fn set(self, name: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidOption {
            name: name.into(),
            value: value.into(),
            reason,
        };
        let flag = || parse_bool(value).ok_or_else(|| invalid("a boolean is required"));

        match name {
            "jobs" => {
                let jobs = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("a positive integer is required"))?;
                self.jobs(jobs)
            }
            "max_drift" => {
                let drift = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid("an integer is required"))?;
                Ok(self.max_drift(drift))
            }
            "hash_chunk_size" => {
                let bytes = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("an integer is required"))?;
                self.hash_chunk_size(bytes)
            }
            "stack_size" => {
                let kib = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("an integer is required"))?;
                Ok(self.stack_size(kib))
            }
            "random" => {
                let order = if flag()? {
                    Order::Random
                } else {
                    Order::Deterministic
                };
                Ok(self.order(order))
            }
            "keep_going" => {
                let keep_going = flag()?;
                Ok(self.keep_going(keep_going))
            }
            "dry_run" => {
                let dry_run = flag()?;
                Ok(self.dry_run(dry_run))
            }
            "question" => {
                let question = flag()?;
                Ok(self.question(question))
            }
            "implicit_cache" => {
                let mode = match value.trim() {
                    "disabled" | "false" | "0" => ImplicitCacheMode::Disabled,
                    "trust" | "true" | "1" => ImplicitCacheMode::Trust,
                    "force-changed" => ImplicitCacheMode::ForceChanged,
                    "force-unchanged" => ImplicitCacheMode::ForceUnchanged,
                    _ => return Err(invalid("expected disabled, trust, force-changed or force-unchanged")),
                };
                Ok(self.implicit_cache(mode))
            }
            "cache" => {
                let mode = match value.trim() {
                    "normal" => CacheMode::Normal,
                    "force" | "populate" => CacheMode::Force,
                    "readonly" => CacheMode::ReadOnly,
                    "disabled" => CacheMode::Disabled,
                    _ => return Err(invalid("expected normal, force, readonly or disabled")),
                };
                Ok(self.cache_mode(mode))
            }
            _ => Err(ConfigError::UnknownOption(name.into())),
        }
    }

    pub fn build(self) -> Options {
        self.options
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
