//! Agent executor: runs one agent subprocess against one worktree, streams
//! its stdout, and turns recognized lines into [`TraceEvent`]s and
//! [`ProgressEvent`]s (§4.5).
//!
//! Modeled on the teacher's `ClaudeCodeAdapter` (`harness/claude_code.rs`):
//! `tokio::process::Command` with piped stdout, a line-by-line stream built
//! over `BufReader::lines()`, tolerant per-line JSON parsing where a
//! malformed line degrades to a `log_line` rather than failing the
//! iteration, and SIGTERM-then-grace-then-SIGKILL teardown. The wire shape
//! recognized here (`{"type":"tool_call","subtype":...}`) is this spec's
//! own, not Claude Code's `stream-json` shapes, so the parsing function
//! itself is new; the subprocess plumbing around it is carried over.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::item::Item;
use crate::progress::{ProgressBus, ProgressEvent};
use crate::trace::{TraceAggregator, TraceEvent, TraceEventType};
use crate::worktree::WorktreeHandle;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to read agent stdout: {0}")]
    Io(#[source] std::io::Error),
}

/// How to invoke the agent subprocess. The agent itself is out of scope
/// (§1): this is just enough to spawn *something* that speaks the wire
/// protocol of §4.5/§6.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

/// What the executor observed at agent exit, handed to the evaluator.
#[derive(Debug, Clone)]
pub struct IterationRunResult {
    pub trace_id: String,
    pub span_id: String,
    pub exit_success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Grace period between SIGTERM and SIGKILL (§4.5 "waits up to a short
/// grace period, then SIGKILLs").
const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct AgentExecutor {
    progress: ProgressBus,
    trace: Arc<TraceAggregator>,
}

impl AgentExecutor {
    pub fn new(progress: ProgressBus, trace: Arc<TraceAggregator>) -> Self {
        Self { progress, trace }
    }

    /// Run one iteration. `trace_id`/`loop_span_id` identify the enclosing
    /// loop trace and span the iteration attaches to as a child.
    pub async fn run(
        &self,
        trace_id: &str,
        loop_span_id: &str,
        item: &Item,
        worktree: &WorktreeHandle,
        command: &AgentCommand,
        agent_timeout: Duration,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<IterationRunResult, AgentError> {
        let span_id = Uuid::new_v4().to_string();
        let start = chrono::Utc::now();

        let mut iter_attrs = HashMap::new();
        iter_attrs.insert("item_id".to_string(), item.id.clone());
        iter_attrs.insert("item_title".to_string(), item.title.clone());
        iter_attrs.insert("worktree".to_string(), worktree.path().display().to_string());

        self.trace
            .ingest(TraceEvent {
                trace_id: trace_id.to_string(),
                span_id: span_id.clone(),
                parent_id: loop_span_id.to_string(),
                kind: TraceEventType::IterationStart,
                name: item.id.clone(),
                timestamp: start,
                attributes: iter_attrs,
            })
            .await;

        self.progress.publish(ProgressEvent::IterationStarted {
            item_id: item.id.clone(),
            item_title: item.title.clone(),
            worktree: worktree.path().display().to_string(),
        });

        if dry_run {
            tracing::info!(
                item_id = %item.id,
                program = %command.program,
                args = ?command.args,
                "dry run: would invoke agent"
            );
            return self
                .finish(trace_id, &span_id, item, start, true, false)
                .await;
        }

        let (exit_success, timed_out) = self
            .drive_subprocess(trace_id, &span_id, item, worktree, command, agent_timeout, cancel)
            .await?;

        self.finish(trace_id, &span_id, item, start, exit_success, timed_out).await
    }

    async fn finish(
        &self,
        trace_id: &str,
        span_id: &str,
        item: &Item,
        start: chrono::DateTime<chrono::Utc>,
        exit_success: bool,
        timed_out: bool,
    ) -> Result<IterationRunResult, AgentError> {
        let end = chrono::Utc::now();
        let duration_ms = (end - start).num_milliseconds().max(0) as u64;

        let outcome = if timed_out {
            "agent_error"
        } else if exit_success {
            "success"
        } else {
            "failure"
        };

        let mut end_attrs = HashMap::new();
        end_attrs.insert("outcome".to_string(), outcome.to_string());
        end_attrs.insert("duration_ms".to_string(), duration_ms.to_string());

        self.trace
            .ingest(TraceEvent {
                trace_id: trace_id.to_string(),
                span_id: span_id.to_string(),
                parent_id: String::new(),
                kind: TraceEventType::IterationEnd,
                name: item.id.clone(),
                timestamp: end,
                attributes: end_attrs,
            })
            .await;

        self.progress.publish(ProgressEvent::IterationEnded {
            item_id: item.id.clone(),
            outcome: outcome.to_string(),
            duration_ms,
        });

        Ok(IterationRunResult {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            exit_success,
            timed_out,
            duration_ms,
        })
    }

    async fn drive_subprocess(
        &self,
        trace_id: &str,
        iter_span_id: &str,
        item: &Item,
        worktree: &WorktreeHandle,
        command: &AgentCommand,
        agent_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(bool, bool), AgentError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(worktree.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(AgentError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    kill_child(&mut child).await;
                    return Ok((false, false));
                }
                _ = tokio::time::sleep(agent_timeout) => {
                    kill_child(&mut child).await;
                    return Ok((false, true));
                }
                line = lines.next_line() => {
                    match line.map_err(AgentError::Io)? {
                        Some(line) => {
                            self.handle_line(trace_id, iter_span_id, item, &line).await;
                        }
                        None => break,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(AgentError::Io)?;
        Ok((status.success(), false))
    }

    async fn handle_line(&self, trace_id: &str, iter_span_id: &str, item: &Item, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(line) else {
            self.progress.publish(ProgressEvent::LogLine {
                item_id: item.id.clone(),
                line: line.to_string(),
            });
            return;
        };

        if value.get("type").and_then(Value::as_str) != Some("tool_call") {
            self.progress.publish(ProgressEvent::LogLine {
                item_id: item.id.clone(),
                line: line.to_string(),
            });
            return;
        }

        let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or_default();
        let name = value.get("name").and_then(Value::as_str).unwrap_or("tool").to_string();
        let call_id = value
            .get("call_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut attributes = HashMap::new();
        if let Some(args) = value.get("arguments").and_then(Value::as_object) {
            for (key, val) in args {
                let key = if key == "path" { "file_path".to_string() } else { key.clone() };
                attributes.insert(key, stringify_value(val));
            }
        }

        let kind = match subtype {
            "ended" => TraceEventType::ToolEnd,
            _ => TraceEventType::ToolStart,
        };

        if let Some(duration_ms) = value.get("duration_ms") {
            attributes.insert("duration_ms".to_string(), stringify_value(duration_ms));
        }

        let event = TraceEvent {
            trace_id: trace_id.to_string(),
            span_id: call_id,
            parent_id: iter_span_id.to_string(),
            kind,
            name,
            timestamp: chrono::Utc::now(),
            attributes,
        };

        self.trace.ingest(event.clone()).await;

        let progress_event = match kind {
            TraceEventType::ToolEnd => {
                ProgressEvent::ToolEnded { item_id: item.id.clone(), trace_event: event }
            }
            _ => ProgressEvent::ToolStarted { item_id: item.id.clone(), trace_event: event },
        };
        self.progress.publish(progress_event);
    }
}

/// Stringify a JSON value; whole-numbered floats/ints render without a
/// decimal point so `3.0` and `3` both become `"3"`.
fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            } else {
                n.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

async fn kill_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
