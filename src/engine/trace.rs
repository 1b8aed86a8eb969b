//! Structured log of every decision the taskmaster makes, one JSON object
//! per line. Written for people and tools reading it afterwards; the engine
//! never reads it back.

use std::fs::File;
use std::io::{BufWriter, Write};

use camino::Utf8Path;
use serde::Serialize;

use crate::engine::report::Verdict;
use crate::graph::NodeState;

#[derive(Debug, Serialize)]
pub(crate) struct TraceRecord<'a> {
    pub node: &'a str,
    pub from: NodeState,
    pub to: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'a str>,
}

pub(crate) struct Trace {
    writer: BufWriter<File>,
    broken: bool,
}

impl Trace {
    pub fn create(path: &Utf8Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            broken: false,
        })
    }

    /// Appends a record. The first write error is logged and disables the
    /// trace for the rest of the run.
    pub fn record(&mut self, record: &TraceRecord) {
        if self.broken {
            return;
        }

        let result = serde_json::to_writer(&mut self.writer, record)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));

        if let Err(e) = result {
            tracing::warn!("couldn't write the trace, disabling it: {}", e);
            self.broken = true;
        }
    }

    pub fn finish(mut self) {
        if !self.broken
            && let Err(e) = self.writer.flush()
        {
            tracing::warn!("couldn't flush the trace: {}", e);
        }
    }
}
