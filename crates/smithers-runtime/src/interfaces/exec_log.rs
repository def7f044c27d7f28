//! Per-execution NDJSON event stream plus a rolled-up summary:
//! `<workspace>/.smithers/executions/<execution-id>/logs/
//! stream.ndjson` and `stream.summary.json`. This is the on-disk record of
//! what an `AgentExecutor` observed while streaming a model response — the
//! core owns the file format and directory layout; a real executor is the
//! one calling `append` as chunks/tool-calls/errors arrive.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smithers_common::errors::{StoreError, StoreErrorKind};

/// Event kinds this log records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StreamEventKind {
    TextEnd { text: String },
    ReasoningEnd { text: String },
    ToolCall { tool_name: String, input: serde_json::Value },
    ToolResult { tool_name: String, output: String },
    Error { message: String },
}

impl StreamEventKind {
    fn tag(&self) -> &'static str {
        match self {
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamEventRecord {
    agent_run_id: String,
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: StreamEventKind,
}

/// Running counts written to `stream.summary.json` on `finalize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSummary {
    pub text_end: u64,
    pub reasoning_end: u64,
    pub tool_call: u64,
    pub tool_result: u64,
    pub error: u64,
}

impl StreamSummary {
    fn record(&mut self, kind: &StreamEventKind) {
        match kind {
            StreamEventKind::TextEnd { .. } => self.text_end += 1,
            StreamEventKind::ReasoningEnd { .. } => self.reasoning_end += 1,
            StreamEventKind::ToolCall { .. } => self.tool_call += 1,
            StreamEventKind::ToolResult { .. } => self.tool_result += 1,
            StreamEventKind::Error { .. } => self.error += 1,
        }
    }
}

/// Appends NDJSON lines to `stream.ndjson` under one Execution's log
/// directory and keeps a running `StreamSummary`, flushed to
/// `stream.summary.json` by `finalize` (also run on `Drop`, best-effort).
pub struct ExecutionLogWriter {
    dir: PathBuf,
    file: Mutex<File>,
    summary: Mutex<StreamSummary>,
}

impl ExecutionLogWriter {
    /// Opens (creating if absent) `<dir>/stream.ndjson` in append mode. `dir`
    /// is `SmithersConfig::execution_logs_dir(execution_id)`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            StoreError::with_source(StoreErrorKind::Io, "failed to create execution log directory", e.into())
        })?;
        let path = dir.join("stream.ndjson");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to open stream.ndjson", e.into()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file: Mutex::new(file),
            summary: Mutex::new(StreamSummary::default()),
        })
    }

    /// Appends one event, tagged with the `AgentRun.id` it belongs to and the
    /// current timestamp, and updates the in-memory summary.
    pub fn append(&self, agent_run_id: &str, event: StreamEventKind) -> Result<(), StoreError> {
        tracing::trace!(agent_run_id, kind = event.tag(), "appending stream event");
        let record = StreamEventRecord {
            agent_run_id: agent_run_id.to_string(),
            at: Utc::now(),
            event,
        };
        let line = serde_json::to_string(&record).expect("stream event record must serialize");
        {
            let mut file = self.file.lock().expect("execution log file mutex poisoned");
            writeln!(file, "{line}")
                .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to append to stream.ndjson", e.into()))?;
        }
        self.summary.lock().expect("execution log summary mutex poisoned").record(&record.event);
        Ok(())
    }

    /// Writes the current summary to `stream.summary.json`. Safe to call more
    /// than once (each call overwrites).
    pub fn finalize(&self) -> Result<(), StoreError> {
        let summary = self.summary.lock().expect("execution log summary mutex poisoned").clone();
        let path = self.dir.join("stream.summary.json");
        let json = serde_json::to_string_pretty(&summary).expect("stream summary must serialize");
        std::fs::write(&path, json)
            .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to write stream.summary.json", e.into()))?;
        Ok(())
    }

    pub fn summary(&self) -> StreamSummary {
        self.summary.lock().expect("execution log summary mutex poisoned").clone()
    }
}

impl Drop for ExecutionLogWriter {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}
