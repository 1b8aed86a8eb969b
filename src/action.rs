//! Build actions.
//!
//! An [`Action`] is whatever turns a node's inputs into its outputs. The
//! engine never looks inside an action; it only needs a stable
//! [`identity`](Action::identity) to fold into the node's signature, so that
//! editing a command invalidates its targets even when no input changed.

use std::borrow::Cow;
use std::fs;
use std::io::Write;
use std::process;

use anyhow::{Context, bail};
use camino::Utf8PathBuf;

/// Everything an action is allowed to see while it runs.
#[derive(Debug)]
pub struct ActionContext<'a> {
    /// Key of the node being built.
    pub target: &'a str,
    /// Paths of the node's explicit dependencies, in declaration order.
    pub inputs: &'a [Utf8PathBuf],
    /// Paths the action is expected to produce. The node's own path comes
    /// first, followed by its side-effect outputs.
    pub outputs: &'a [Utf8PathBuf],
}

pub trait Action: Send + Sync {
    /// A string that changes whenever the action would produce different
    /// output for the same inputs.
    fn identity(&self) -> Cow<'_, str>;

    /// Human-readable description printed when the action runs.
    fn describe(&self, context: &ActionContext) -> String {
        let _ = context;
        self.identity().into_owned()
    }

    fn execute(&self, context: &ActionContext) -> anyhow::Result<()>;
}

/// Runs an external program.
///
/// The argument vector understands a few placeholders which are expanded
/// right before the process starts:
///
/// * `$TARGET` the first output
/// * `$TARGETS` every output, one argument each
/// * `$SOURCE` the first input
/// * `$SOURCES` every input, one argument each
#[derive(Debug, Clone)]
pub struct Command {
    argv: Vec<String>,
}

impl Command {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    fn expand(&self, context: &ActionContext) -> Vec<String> {
        let mut args = Vec::with_capacity(self.argv.len());

        for arg in &self.argv {
            match arg.as_str() {
                "$TARGETS" => args.extend(context.outputs.iter().map(|p| p.to_string())),
                "$SOURCES" => args.extend(context.inputs.iter().map(|p| p.to_string())),
                _ => args.push(substitute(arg, context)),
            }
        }

        args
    }
}

/// Longer names come first so `$TARGETS` is never read as `$TARGET`.
const PLACEHOLDERS: [&str; 4] = ["$TARGETS", "$TARGET", "$SOURCES", "$SOURCE"];

/// Expands placeholders embedded in a larger argument. List placeholders
/// join their paths with spaces.
fn substitute(arg: &str, context: &ActionContext) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        rest = &rest[at..];

        let Some(placeholder) = PLACEHOLDERS.into_iter().find(|p| rest.starts_with(p)) else {
            out.push('$');
            rest = &rest[1..];
            continue;
        };

        let paths = match placeholder {
            "$TARGETS" | "$TARGET" => context.outputs,
            _ => context.inputs,
        };
        let expansion = if placeholder.ends_with('S') {
            paths.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(" ")
        } else {
            paths.first().map(|p| p.to_string()).unwrap_or_default()
        };

        out.push_str(&expansion);
        rest = &rest[placeholder.len()..];
    }

    out.push_str(rest);
    out
}

impl Action for Command {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Owned(self.argv.join(" "))
    }

    fn describe(&self, context: &ActionContext) -> String {
        self.expand(context).join(" ")
    }

    fn execute(&self, context: &ActionContext) -> anyhow::Result<()> {
        let args = self.expand(context);
        let Some((program, rest)) = args.split_first() else {
            bail!("empty command for '{}'", context.target);
        };

        let status = process::Command::new(program)
            .args(rest)
            .status()
            .with_context(|| format!("couldn't spawn '{program}'"))?;

        if !status.success() {
            bail!("'{}' exited with {}", args.join(" "), status);
        }

        Ok(())
    }
}

/// Copies the first input to the first output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFile;

impl Action for CopyFile {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed("copy")
    }

    fn describe(&self, context: &ActionContext) -> String {
        format!(
            "copy {} -> {}",
            context.inputs.first().map(|p| p.as_str()).unwrap_or("?"),
            context.outputs.first().map(|p| p.as_str()).unwrap_or("?"),
        )
    }

    fn execute(&self, context: &ActionContext) -> anyhow::Result<()> {
        let (Some(source), Some(target)) = (context.inputs.first(), context.outputs.first()) else {
            bail!("copy needs one input and one output");
        };

        fs::copy(source, target).with_context(|| format!("couldn't copy {source} to {target}"))?;
        Ok(())
    }
}

/// Concatenates every input, in order, into the first output. A minimal
/// stand-in for archivers and bundlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Concat;

impl Action for Concat {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed("concat")
    }

    fn describe(&self, context: &ActionContext) -> String {
        format!(
            "concat {} inputs -> {}",
            context.inputs.len(),
            context.outputs.first().map(|p| p.as_str()).unwrap_or("?"),
        )
    }

    fn execute(&self, context: &ActionContext) -> anyhow::Result<()> {
        let Some(target) = context.outputs.first() else {
            bail!("concat needs an output");
        };

        let mut out = fs::File::create(target).with_context(|| format!("couldn't create {target}"))?;
        for input in context.inputs {
            let data = fs::read(input).with_context(|| format!("couldn't read {input}"))?;
            out.write_all(&data)?;
        }
        out.flush()?;

        Ok(())
    }
}

/// Wraps a closure as an action. The identity must be supplied explicitly
/// since a closure has no inspectable contents.
pub struct FnAction<F> {
    identity: Cow<'static, str>,
    callback: F,
}

impl<F> FnAction<F>
where
    F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(identity: impl Into<Cow<'static, str>>, callback: F) -> Self {
        Self {
            identity: identity.into(),
            callback,
        }
    }
}

impl<F> Action for FnAction<F>
where
    F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync,
{
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.identity.as_ref())
    }

    fn execute(&self, context: &ActionContext) -> anyhow::Result<()> {
        (self.callback)(context)
    }
}
